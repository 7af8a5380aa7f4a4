//! Parsers for the engine's XMLA responses. The service only ever needs a
//! handful of things out of them: a session id, a fault message, the rows of
//! the trace discovery query, and the trace id buried in a creation template.

use quick_xml::events::Event;
use quick_xml::Reader;

use crate::error::{ConfigError, EngineError};

/// One row of `$system.discover_traces`. Only `trace_id` is required; the
/// engine reports the other columns as empty for system traces.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TraceRow {
    pub trace_id: String,
    pub creation_time: Option<String>,
    pub stop_time: Option<String>,
    pub trace_type: Option<String>,
}

/// Pull the `SessionId` out of a BeginSession response header. Lenient: any
/// malformed or unexpected response reads as "no session".
pub fn session_id(xml: &str) -> Option<String> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    loop {
        match reader.read_event().ok()? {
            Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"Session" => {
                let attr = e.try_get_attribute("SessionId").ok().flatten()?;
                return attr.unescape_value().ok().map(|v| v.into_owned());
            }
            Event::Eof => return None,
            _ => {}
        }
    }
}

/// Find the human-readable error in a response, if it carries one. The engine
/// reports failures two ways: a SOAP `faultstring`, or an `Error` element
/// with a `Description` attribute inside an otherwise well-formed reply.
pub fn fault_description(xml: &str) -> Option<String> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut in_faultstring = false;
    loop {
        match reader.read_event().ok()? {
            Event::Start(e) if e.local_name().as_ref() == b"faultstring" => in_faultstring = true,
            Event::Text(text) if in_faultstring => {
                return text.unescape().ok().map(|v| v.into_owned());
            }
            // Some engine builds wrap the message in CDATA.
            Event::CData(text) if in_faultstring => {
                return Some(String::from_utf8_lossy(&text.into_inner()).into_owned());
            }
            Event::End(_) => in_faultstring = false,
            Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"Error" => {
                if let Some(attr) = e.try_get_attribute("Description").ok().flatten() {
                    return attr.unescape_value().ok().map(|v| v.into_owned());
                }
            }
            Event::Eof => return None,
            _ => {}
        }
    }
}

/// Parse the rowset returned by the trace discovery statement. Rows without a
/// trace id are dropped.
pub fn trace_rows(xml: &str) -> Result<Vec<TraceRow>, EngineError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut rows = Vec::new();
    let mut row: Option<TraceRow> = None;
    let mut column: Option<String> = None;
    loop {
        match reader.read_event().map_err(bad_response)? {
            Event::Start(e) if e.local_name().as_ref() == b"row" => {
                row = Some(TraceRow::default());
            }
            Event::Start(e) if row.is_some() => {
                column =
                    Some(String::from_utf8_lossy(e.local_name().as_ref()).to_ascii_lowercase());
            }
            Event::Text(text) => {
                if let (Some(row), Some(column)) = (row.as_mut(), column.as_deref()) {
                    let value = text.unescape().map_err(bad_response)?.into_owned();
                    match column {
                        "traceid" => row.trace_id = value,
                        "creationtime" => row.creation_time = Some(value),
                        "stoptime" => row.stop_time = Some(value),
                        "type" => row.trace_type = Some(value),
                        _ => {}
                    }
                }
            }
            Event::End(e) if e.local_name().as_ref() == b"row" => {
                if let Some(finished) = row.take() {
                    if !finished.trace_id.is_empty() {
                        rows.push(finished);
                    }
                }
                column = None;
            }
            Event::End(_) => column = None,
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(rows)
}

/// Extract the trace id from a trace creation template. The id lives at
/// ObjectDefinition/Trace/ID; an `ID` element anywhere else (data sources,
/// nested objects) does not count.
pub fn template_trace_id(xml: &str) -> Result<String, ConfigError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut path: Vec<String> = Vec::new();
    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                path.push(String::from_utf8_lossy(e.local_name().as_ref()).into_owned());
            }
            Event::End(_) => {
                path.pop();
            }
            Event::Text(text) => {
                if path_ends_with(&path, &["ObjectDefinition", "Trace", "ID"]) {
                    let id = text.unescape()?.trim().to_string();
                    if id.is_empty() {
                        return Err(ConfigError::MissingTraceId);
                    }
                    return Ok(id);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Err(ConfigError::MissingTraceId)
}

fn path_ends_with(path: &[String], suffix: &[&str]) -> bool {
    path.len() >= suffix.len()
        && path[path.len() - suffix.len()..]
            .iter()
            .zip(suffix)
            .all(|(a, b)| a == b)
}

fn bad_response(err: quick_xml::Error) -> EngineError {
    EngineError::Response(err.to_string())
}
