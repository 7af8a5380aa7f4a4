//! The reader loop: subscribe to the trace, decode events as they arrive,
//! append each one to the sink. Runs until cancelled, treating every engine
//! hiccup as a reason to reconnect rather than a reason to die.

use std::io::BufReader;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::error::{EngineError, StreamError};
use crate::event::OutputRecord;
use crate::sink::RecordSink;
use crate::xmla::client::{ConnectionProvider, EngineConnection};
use crate::xmla::command::subscribe_command;
use crate::xmla::stream::EventStream;

/// Pause between subscription attempts. The engine drops subscriptions on
/// restarts and pauses, so the loop waits this long and tries again, forever.
pub const RETRY_DELAY: Duration = Duration::from_secs(10);

/// How one pass over the stream ended.
enum StreamEnd {
    Cancelled,
    Disconnected,
}

/// Owns a connection and a sink, and pumps one trace's events between them.
///
/// The first subscription reuses the connection handed over by the caller
/// (the one the trace was created on); every reconnect after that is a fresh
/// connection from the provider. Whatever connection is held when the loop
/// ends is closed here, on this thread.
pub struct TraceIngestor<P: ConnectionProvider, S: RecordSink> {
    provider: P,
    conn: Option<P::Conn>,
    trace_id: String,
    sink: S,
    cancel: CancelToken,
    retry_delay: Duration,
}

impl<P: ConnectionProvider, S: RecordSink> TraceIngestor<P, S> {
    pub fn new(
        provider: P,
        conn: P::Conn,
        trace_id: impl Into<String>,
        sink: S,
        cancel: CancelToken,
    ) -> Self {
        TraceIngestor {
            provider,
            conn: Some(conn),
            trace_id: trace_id.into(),
            sink,
            cancel,
            retry_delay: RETRY_DELAY,
        }
    }

    /// Tests shrink the delay; production uses [`RETRY_DELAY`].
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Block until cancelled. Never returns early: failed subscriptions and
    /// dropped streams are logged, waited out, and retried.
    pub fn run(mut self) {
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            match self.stream_cycle() {
                Ok(StreamEnd::Cancelled) => break,
                Ok(StreamEnd::Disconnected) => {}
                Err(err) => {
                    warn!(trace = self.trace_id.as_str(), error = %err, "subscription attempt failed");
                }
            }
            self.drop_connection();
            if self.cancel.is_cancelled() {
                break;
            }
            debug!(
                "waiting {}s before subscribing again",
                self.retry_delay.as_secs()
            );
            thread::sleep(self.retry_delay);
        }
        self.drop_connection();
        info!(trace = self.trace_id.as_str(), "trace reader stopped");
    }

    /// One subscription: open the stream and drain it. Event-level problems
    /// are skipped in place; anything that ends the stream reports how.
    fn stream_cycle(&mut self) -> Result<StreamEnd, EngineError> {
        info!(trace = self.trace_id.as_str(), "subscribing to trace");
        let mut conn = match self.conn.take() {
            Some(conn) => conn,
            None => self.provider.connect()?,
        };
        let reader = conn.open_stream(&subscribe_command(&self.trace_id));
        self.conn = Some(conn);
        let reader = reader?;

        for item in EventStream::new(BufReader::new(reader)) {
            if self.cancel.is_cancelled() {
                return Ok(StreamEnd::Cancelled);
            }
            match item {
                Ok(event) => {
                    debug!(event = event.name.as_str(), "event received");
                    let record = OutputRecord::from(event);
                    if let Err(err) = self.sink.append(&record) {
                        warn!(event = record.name.as_str(), error = %err, "failed to persist event, skipping it");
                    }
                }
                Err(StreamError::Event(err)) => {
                    warn!(error = %err, "skipping malformed event");
                }
                Err(err) => {
                    warn!(error = %err, "event stream failed");
                    return Ok(StreamEnd::Disconnected);
                }
            }
        }
        info!(trace = self.trace_id.as_str(), "trace stopped streaming");
        Ok(StreamEnd::Disconnected)
    }

    fn drop_connection(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            debug!("closing engine connection");
            conn.close();
        }
    }
}
