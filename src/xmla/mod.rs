//! XMLA transport for the Analysis Services engine: command construction,
//! response parsing, and the live extended-event stream decoder.

pub mod client;
pub mod command;
pub mod response;
pub mod stream;
