//! Builders for the XMLA requests the service sends. Every request is a
//! SOAP 1.1 Execute call; the interesting part is the engine command nested
//! inside it.

use quick_xml::escape::escape;

pub const SOAP_NS: &str = "http://schemas.xmlsoap.org/soap/envelope/";
pub const XMLA_NS: &str = "urn:schemas-microsoft-com:xml-analysis";
/// Namespace of the engine DDL commands (Subscribe, Delete, ...).
pub const ENGINE_NS: &str = "http://schemas.microsoft.com/analysisservices/2003/engine";

/// Session handling for one Execute call.
pub enum SessionHeader<'a> {
    /// No session header at all.
    None,
    /// Ask the engine to open a new session and return its id.
    Begin,
    /// Attach the call to an existing session.
    Attach(&'a str),
    /// Tear the session down.
    End(&'a str),
}

/// Subscribe to the live event stream of an existing trace. The response to
/// this command never completes; the engine keeps the connection open and
/// writes events into it.
pub fn subscribe_command(trace_id: &str) -> String {
    format!(
        "<Subscribe xmlns=\"{ns}\"><Object xmlns=\"{ns}\"><TraceID>{id}</TraceID></Object></Subscribe>",
        ns = ENGINE_NS,
        id = escape(trace_id),
    )
}

/// Delete a server-side trace by id.
pub fn delete_command(trace_id: &str) -> String {
    format!(
        "<Delete xmlns=\"{ns}\"><Object><TraceID>{id}</TraceID></Object></Delete>",
        ns = ENGINE_NS,
        id = escape(trace_id),
    )
}

/// Run a DMV or DAX statement.
pub fn statement_command(statement: &str) -> String {
    format!("<Statement>{}</Statement>", escape(statement))
}

/// Wrap an engine command in the full SOAP envelope. `command` may be empty,
/// which the engine accepts for pure session-management calls.
pub fn execute_envelope(command: &str, catalog: Option<&str>, session: &SessionHeader) -> String {
    let header = match session {
        SessionHeader::None => String::new(),
        SessionHeader::Begin => format!(
            "<soap:Header><BeginSession soap:mustUnderstand=\"1\" xmlns=\"{XMLA_NS}\"/></soap:Header>"
        ),
        SessionHeader::Attach(id) => format!(
            "<soap:Header><Session soap:mustUnderstand=\"1\" SessionId=\"{}\" xmlns=\"{XMLA_NS}\"/></soap:Header>",
            escape(id),
        ),
        SessionHeader::End(id) => format!(
            "<soap:Header><EndSession soap:mustUnderstand=\"1\" SessionId=\"{}\" xmlns=\"{XMLA_NS}\"/></soap:Header>",
            escape(id),
        ),
    };
    let catalog = match catalog {
        Some(name) => format!("<Catalog>{}</Catalog>", escape(name)),
        None => String::new(),
    };
    format!(
        "<?xml version=\"1.0\" encoding=\"utf-8\"?>\
         <soap:Envelope xmlns:soap=\"{SOAP_NS}\">\
         {header}\
         <soap:Body>\
         <Execute xmlns=\"{XMLA_NS}\">\
         <Command>{command}</Command>\
         <Properties><PropertyList>{catalog}</PropertyList></Properties>\
         </Execute>\
         </soap:Body>\
         </soap:Envelope>"
    )
}
