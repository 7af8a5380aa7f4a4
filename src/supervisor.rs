//! Start/stop orchestration. `start` prepares the trace and hands the
//! connection to a dedicated reader thread; `stop` cancels it, waits a
//! bounded time, and removes the trace from the server.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::ingest::{TraceIngestor, RETRY_DELAY};
use crate::lifecycle::{self, TraceTemplate};
use crate::sink::RecordSink;
use crate::xmla::client::{ConnectionProvider, EngineConnection};

/// Longest `stop` will wait for the reader thread before abandoning it. An
/// abandoned reader is still cancelled; it just may be stuck in a blocking
/// read that only ends when the process does.
pub const SHUTDOWN_WAIT: Duration = Duration::from_secs(30);

struct Worker {
    handle: JoinHandle<()>,
    done: Receiver<()>,
}

/// Owns the whole service lifecycle for one trace. Single-shot: a stopped
/// supervisor cannot be started again.
pub struct TraceSupervisor<P, S>
where
    P: ConnectionProvider + Clone + 'static,
    S: RecordSink + Send + 'static,
{
    provider: P,
    template: TraceTemplate,
    sink: Option<S>,
    retry_delay: Duration,
    shutdown_wait: Duration,
    cancel: CancelToken,
    worker: Option<Worker>,
    /// Set while the trace exists server-side, cleared once deleted.
    trace_id: Option<String>,
}

impl<P, S> TraceSupervisor<P, S>
where
    P: ConnectionProvider + Clone + 'static,
    S: RecordSink + Send + 'static,
{
    pub fn new(provider: P, template: TraceTemplate, sink: S) -> Self {
        TraceSupervisor {
            provider,
            template,
            sink: Some(sink),
            retry_delay: RETRY_DELAY,
            shutdown_wait: SHUTDOWN_WAIT,
            cancel: CancelToken::new(),
            worker: None,
            trace_id: None,
        }
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_shutdown_wait(mut self, wait: Duration) -> Self {
        self.shutdown_wait = wait;
        self
    }

    pub fn trace_id(&self) -> &str {
        self.template.trace_id()
    }

    /// Connect, create the trace, and spawn the reader thread. The creation
    /// connection moves into the thread so the subscription reuses it. A
    /// failed start leaves nothing behind on the server.
    pub fn start(&mut self) -> Result<()> {
        if self.worker.is_some() {
            bail!("trace service is already running");
        }
        let sink = self
            .sink
            .take()
            .context("trace service cannot be restarted")?;
        let mut conn = self
            .provider
            .connect()
            .context("failed to connect to the engine")?;
        let created = lifecycle::ensure_trace_active(&mut conn, &self.template);
        if created.is_err() {
            conn.close();
        }
        created.with_context(|| {
            format!("failed to create trace '{}'", self.template.trace_id())
        })?;

        let trace_id = self.template.trace_id().to_string();
        let ingestor = TraceIngestor::new(
            self.provider.clone(),
            conn,
            trace_id.clone(),
            sink,
            self.cancel.clone(),
        )
        .with_retry_delay(self.retry_delay);
        let (done_tx, done_rx) = mpsc::channel();
        let spawned = thread::Builder::new()
            .name("trace_reader".to_string())
            .spawn(move || {
                ingestor.run();
                let _ = done_tx.send(());
            });
        let handle = match spawned {
            Ok(handle) => handle,
            Err(err) => {
                // The trace was created; take it down before reporting.
                lifecycle::delete_trace(&self.provider, &trace_id);
                return Err(err).context("failed to spawn the trace reader thread");
            }
        };
        self.trace_id = Some(trace_id);
        self.worker = Some(Worker {
            handle,
            done: done_rx,
        });
        info!(trace = self.template.trace_id(), "trace service started");
        Ok(())
    }

    /// Start the service, block until `shutdown` yields a message or loses
    /// its sender, then stop it. The trace is removed on every exit path.
    pub fn run_until(&mut self, shutdown: Receiver<()>) -> Result<()> {
        self.start()?;
        let waited = shutdown.recv();
        self.stop();
        waited.context("the stop channel closed unexpectedly")
    }

    /// Cancel the reader, wait for it within the shutdown bound, then delete
    /// the trace on a connection of our own. Safe to call more than once and
    /// on a supervisor that never started.
    pub fn stop(&mut self) {
        info!("stopping trace service");
        self.cancel.cancel();
        if let Some(worker) = self.worker.take() {
            debug!(
                "waiting up to {}s for the trace reader",
                self.shutdown_wait.as_secs()
            );
            match worker.done.recv_timeout(self.shutdown_wait) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    if worker.handle.join().is_err() {
                        warn!("trace reader thread panicked");
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    warn!("trace reader did not stop within the wait bound, abandoning it");
                }
            }
        }
        if let Some(trace_id) = self.trace_id.take() {
            lifecycle::delete_trace(&self.provider, &trace_id);
        }
        info!("trace service stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::sink::MemorySink;
    use std::collections::VecDeque;
    use std::io::{Cursor, Read};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Instant;

    const TEMPLATE: &str =
        "<Create xmlns=\"http://schemas.microsoft.com/analysisservices/2003/engine\">\
         <ObjectDefinition><Trace><ID>MyTrace01</ID><Name>MyTrace01</Name></Trace>\
         </ObjectDefinition></Create>";

    fn one_event_stream() -> String {
        "<Envelope><Body><event uuid=\"aaaaaaaa-0000-0000-0000-000000000001\" \
         name=\"QueryEnd\" timestamp=\"t\"/></Body></Envelope>"
            .to_string()
    }

    /// Reader that never yields data, standing in for a subscription that
    /// stays silent.
    struct NeverReader {
        rx: mpsc::Receiver<()>,
    }

    impl Read for NeverReader {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            let _ = self.rx.recv();
            Ok(0)
        }
    }

    #[derive(Default)]
    struct EngineLog {
        /// Every execute and subscribe command, in call order.
        commands: Mutex<Vec<String>>,
        streams: Mutex<VecDeque<String>>,
        connects: AtomicUsize,
        closes: AtomicUsize,
        fail_create: AtomicBool,
        stuck_streams: AtomicBool,
        keep_alive: Mutex<Vec<mpsc::Sender<()>>>,
    }

    #[derive(Clone, Default)]
    struct FakeProvider(Arc<EngineLog>);

    impl FakeProvider {
        fn commands(&self) -> Vec<String> {
            self.0.commands.lock().unwrap().clone()
        }

        fn index_of(&self, needle: &str) -> Option<usize> {
            self.commands().iter().position(|c| c.contains(needle))
        }
    }

    impl ConnectionProvider for FakeProvider {
        type Conn = FakeConn;

        fn connect(&self) -> Result<FakeConn, EngineError> {
            self.0.connects.fetch_add(1, Ordering::SeqCst);
            Ok(FakeConn(Arc::clone(&self.0)))
        }
    }

    struct FakeConn(Arc<EngineLog>);

    impl EngineConnection for FakeConn {
        fn execute(&mut self, command: &str) -> Result<String, EngineError> {
            self.0.commands.lock().unwrap().push(command.to_string());
            if command.starts_with("<Create") && self.0.fail_create.load(Ordering::SeqCst) {
                return Err(EngineError::Fault("creation refused".to_string()));
            }
            Ok("<Envelope><Body/></Envelope>".to_string())
        }

        fn open_stream(&mut self, command: &str) -> Result<Box<dyn Read>, EngineError> {
            self.0.commands.lock().unwrap().push(command.to_string());
            if self.0.stuck_streams.load(Ordering::SeqCst) {
                let (tx, rx) = mpsc::channel();
                self.0.keep_alive.lock().unwrap().push(tx);
                return Ok(Box::new(NeverReader { rx }));
            }
            let body = self
                .0
                .streams
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_default();
            Ok(Box::new(Cursor::new(body.into_bytes())))
        }

        fn close(&mut self) {
            self.0.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn supervisor(
        provider: &FakeProvider,
        sink: MemorySink,
    ) -> TraceSupervisor<FakeProvider, MemorySink> {
        let template = TraceTemplate::from_xml(TEMPLATE.to_string()).unwrap();
        TraceSupervisor::new(provider.clone(), template, sink)
            .with_retry_delay(Duration::from_millis(5))
            .with_shutdown_wait(Duration::from_secs(5))
    }

    fn wait_for<F: Fn() -> bool>(what: &str, ready: F) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !ready() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_start_streams_and_stop_cleans_up() {
        let provider = FakeProvider::default();
        provider.0.streams.lock().unwrap().push_back(one_event_stream());
        let sink = MemorySink::new();
        let mut supervisor = supervisor(&provider, sink.clone());

        supervisor.start().unwrap();
        wait_for("a recorded event", || !sink.records().is_empty());
        supervisor.stop();

        assert_eq!(sink.records()[0].name, "QueryEnd");
        let commands = provider.commands();
        assert_eq!(
            commands.iter().filter(|c| c.starts_with("<Create")).count(),
            1
        );
        let create = provider.index_of("<Create").unwrap();
        let subscribe = provider.index_of("<Subscribe").unwrap();
        let delete = provider.index_of("<Delete").unwrap();
        assert!(create < subscribe, "trace must exist before subscribing");
        assert!(subscribe < delete, "delete belongs to shutdown");
        assert!(commands[delete].contains("<TraceID>MyTrace01</TraceID>"));
    }

    #[test]
    fn test_stop_abandons_a_reader_stuck_in_a_blocking_read() {
        let provider = FakeProvider::default();
        provider.0.stuck_streams.store(true, Ordering::SeqCst);
        let sink = MemorySink::new();
        let mut supervisor =
            supervisor(&provider, sink).with_shutdown_wait(Duration::from_millis(50));

        supervisor.start().unwrap();
        wait_for("the subscription", || {
            provider.index_of("<Subscribe").is_some()
        });

        let begun = Instant::now();
        supervisor.stop();
        assert!(
            begun.elapsed() < Duration::from_secs(2),
            "stop must not wait for a stuck reader"
        );
        // The trace is still deleted even though the reader was abandoned.
        assert!(provider.index_of("<Delete").is_some());
    }

    #[test]
    fn test_run_until_stops_after_a_signal() {
        let provider = FakeProvider::default();
        provider.0.streams.lock().unwrap().push_back(one_event_stream());
        let sink = MemorySink::new();
        let mut supervisor = supervisor(&provider, sink.clone());

        let (stop_tx, stop_rx) = mpsc::channel();
        let recorded = sink.clone();
        thread::spawn(move || {
            wait_for("a recorded event", || !recorded.records().is_empty());
            let _ = stop_tx.send(());
        });

        supervisor.run_until(stop_rx).unwrap();
        assert!(!sink.records().is_empty());
        assert!(provider.index_of("<Delete").is_some());
    }

    #[test]
    fn test_run_until_cleans_up_when_the_stop_channel_dies() {
        let provider = FakeProvider::default();
        provider.0.streams.lock().unwrap().push_back(one_event_stream());
        let mut supervisor = supervisor(&provider, MemorySink::new());

        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        drop(stop_tx);
        let err = supervisor.run_until(stop_rx).unwrap_err();
        assert!(err.to_string().contains("stop channel"));

        // The wait failed, but the service still shut down in order.
        let create = provider.index_of("<Create").unwrap();
        let delete = provider.index_of("<Delete").unwrap();
        assert!(create < delete);
    }

    #[test]
    fn test_run_until_propagates_a_failed_start() {
        let provider = FakeProvider::default();
        provider.0.fail_create.store(true, Ordering::SeqCst);
        let mut supervisor = supervisor(&provider, MemorySink::new());

        let (_stop_tx, stop_rx) = mpsc::channel();
        assert!(supervisor.run_until(stop_rx).is_err());
        // The trace never existed, so nothing is deleted.
        assert!(provider.index_of("<Delete").is_none());
    }

    #[test]
    fn test_start_twice_is_rejected() {
        let provider = FakeProvider::default();
        let mut supervisor = supervisor(&provider, MemorySink::new());
        supervisor.start().unwrap();
        let err = supervisor.start().unwrap_err();
        assert!(err.to_string().contains("already running"));
        supervisor.stop();
    }

    #[test]
    fn test_failed_creation_fails_start_and_closes_the_connection() {
        let provider = FakeProvider::default();
        provider.0.fail_create.store(true, Ordering::SeqCst);
        let mut supervisor = supervisor(&provider, MemorySink::new());

        let err = supervisor.start().unwrap_err();
        assert!(err.to_string().contains("failed to create trace 'MyTrace01'"));
        assert_eq!(provider.0.closes.load(Ordering::SeqCst), 1);
        // Nothing to clean up: no trace was created, so stop deletes nothing.
        supervisor.stop();
        assert!(provider.index_of("<Delete").is_none());
    }

    #[test]
    fn test_stop_without_start_is_harmless() {
        let provider = FakeProvider::default();
        let mut supervisor = supervisor(&provider, MemorySink::new());
        supervisor.stop();
        assert!(provider.commands().is_empty());
        assert_eq!(provider.0.connects.load(Ordering::SeqCst), 0);
    }
}
