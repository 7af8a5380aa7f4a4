use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Problems with the settings file, the connection string, or the trace
/// template. These surface before the service starts and are always fatal.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("connection string: {0}")]
    ConnectionString(String),
    #[error("trace template has no ObjectDefinition/Trace/ID element")]
    MissingTraceId,
    #[error("trace template is not well-formed XML: {0}")]
    BadTemplate(#[from] quick_xml::Error),
}

/// A command to the engine failed: the request could not be sent, the
/// response was an error status, or the body carried a fault.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine request failed: {0}")]
    Transport(#[from] ureq::Error),
    #[error("engine returned a fault: {0}")]
    Fault(String),
    #[error("engine response was not understood: {0}")]
    Response(String),
}

/// Why a streaming read stopped yielding, or why one item within it was
/// dropped. `Event` is recoverable (skip the item and keep reading); the
/// other variants end the stream.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("stream failed: {0}")]
    Fault(#[from] quick_xml::Error),
    #[error("stream ended in the middle of an event")]
    Truncated,
    #[error(transparent)]
    Event(#[from] DecodeError),
}

/// One event on the stream had an invalid shape.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("event is missing required attribute '{0}'")]
    MissingAttribute(&'static str),
    #[error("event id '{value}' is not a UUID: {source}")]
    BadUuid {
        value: String,
        #[source]
        source: uuid::Error,
    },
    #[error("field '{field}' has a malformed {kind} value '{value}'")]
    BadFieldValue {
        field: String,
        kind: &'static str,
        value: String,
    },
}

/// A record could not be appended to the output partition.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("failed to create partition directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to append to {path}: {source}")]
    Append {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("record could not be serialized: {0}")]
    Serialize(#[from] serde_json::Error),
}
