//! Records Analysis Services extended events to partitioned JSONL files.
//!
//! The service creates a server-side trace from a template, subscribes to
//! its live event stream, and appends every decoded event as one line of
//! JSON under `<output_root>/<yyyyMMdd>/<event-name>.jsonl`. Connection
//! loss is survived by resubscribing; shutdown deletes the trace.

pub mod cancel;
pub mod error;
pub mod event;
pub mod ingest;
pub mod lifecycle;
pub mod settings;
pub mod sink;
pub mod supervisor;
pub mod xmla;

pub use cancel::CancelToken;
pub use event::{FieldValue, OutputRecord, StreamEvent};
pub use ingest::{TraceIngestor, RETRY_DELAY};
pub use lifecycle::TraceTemplate;
pub use settings::Settings;
pub use sink::{MemorySink, PartitionedJsonlSink, RecordSink};
pub use supervisor::{TraceSupervisor, SHUTDOWN_WAIT};
pub use xmla::client::{ConnectionProvider, EngineConnection, XmlaProvider};
