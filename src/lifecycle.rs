//! Server-side trace lifecycle: create on startup (replacing any leftover
//! trace with the same id), delete on shutdown. The subscription itself
//! lives in [`crate::ingest`].

use std::fs;
use std::path::Path;

use tracing::{error, info, warn};

use crate::error::{ConfigError, EngineError};
use crate::xmla::client::{ConnectionProvider, EngineConnection};
use crate::xmla::command::{delete_command, statement_command};
use crate::xmla::response::{self, TraceRow};

/// Discovery statement listing every trace the server currently has.
pub const DISCOVER_TRACES: &str =
    "select TraceId, CreationTime, StopTime, [Type] from $system.discover_traces";

/// A trace creation command, loaded verbatim from disk. The engine decides
/// what the trace captures; this service only needs the id out of it.
#[derive(Debug, Clone)]
pub struct TraceTemplate {
    body: String,
    trace_id: String,
}

impl TraceTemplate {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let body = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_xml(body)
    }

    pub fn from_xml(body: String) -> Result<Self, ConfigError> {
        let trace_id = response::template_trace_id(&body)?;
        Ok(TraceTemplate { body, trace_id })
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn body(&self) -> &str {
        &self.body
    }
}

pub fn active_traces<C: EngineConnection>(conn: &mut C) -> Result<Vec<TraceRow>, EngineError> {
    let body = conn.execute(&statement_command(DISCOVER_TRACES))?;
    response::trace_rows(&body)
}

/// Create the template's trace on the server. Trace ids collide
/// case-insensitively, so any existing trace with this id is deleted first;
/// if that delete fails the creation is still attempted and its error is the
/// one that matters.
pub fn ensure_trace_active<C: EngineConnection>(
    conn: &mut C,
    template: &TraceTemplate,
) -> Result<(), EngineError> {
    let existing = active_traces(conn)?;
    let wanted = template.trace_id().to_lowercase();
    if existing
        .iter()
        .any(|row| row.trace_id.to_lowercase() == wanted)
    {
        info!(
            trace = template.trace_id(),
            "a trace with this id already exists, deleting it"
        );
        delete_trace_on(conn, template.trace_id());
    }
    conn.execute(template.body())?;
    info!(trace = template.trace_id(), "trace created");
    Ok(())
}

/// Best-effort delete on an already-open connection. Shutdown and collision
/// handling both go through here; a failure is logged and swallowed.
pub fn delete_trace_on<C: EngineConnection>(conn: &mut C, trace_id: &str) {
    info!(trace = trace_id, "deleting trace");
    if let Err(err) = conn.execute(&delete_command(trace_id)) {
        warn!(trace = trace_id, error = %err, "failed to delete trace");
    }
}

/// Best-effort delete on a fresh connection, for callers that no longer own
/// one. Never fails; an unreachable engine just leaves the trace behind for
/// the collision check on the next start.
pub fn delete_trace<P: ConnectionProvider>(provider: &P, trace_id: &str) {
    if trace_id.is_empty() {
        error!("cannot delete a trace without an id");
        return;
    }
    let mut conn = match provider.connect() {
        Ok(conn) => conn,
        Err(err) => {
            warn!(trace = trace_id, error = %err, "could not connect to delete trace");
            return;
        }
    };
    delete_trace_on(&mut conn, trace_id);
    conn.close();
}
