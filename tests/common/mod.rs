//! In-process engine stand-in for integration tests.
//!
//! Speaks just enough XMLA-over-HTTP for the service: it answers session
//! handshakes, reports configured traces from the discovery statement, and
//! serves scripted event streams to subscribers. Every command body it
//! receives is recorded so tests can assert on ordering.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Default)]
struct EngineState {
    /// Request bodies in arrival order.
    commands: Mutex<Vec<String>>,
    /// Trace ids the discovery statement reports as already existing.
    traces: Mutex<Vec<String>>,
    /// Scripted subscription payloads, one per Subscribe.
    streams: Mutex<VecDeque<String>>,
    stop: AtomicBool,
}

/// A loopback engine endpoint. Shuts down when dropped.
pub struct FakeEngine {
    addr: SocketAddr,
    state: Arc<EngineState>,
    accept_thread: Option<thread::JoinHandle<()>>,
}

impl FakeEngine {
    pub fn start() -> FakeEngine {
        let listener = TcpListener::bind("127.0.0.1:0").expect("failed to bind the fake engine");
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(EngineState::default());
        let accept_state = Arc::clone(&state);
        let accept_thread = thread::spawn(move || {
            for stream in listener.incoming() {
                if accept_state.stop.load(Ordering::SeqCst) {
                    break;
                }
                let Ok(stream) = stream else { break };
                let client_state = Arc::clone(&accept_state);
                // Subscriptions hold their socket while other requests
                // arrive, so every client gets its own thread.
                thread::spawn(move || {
                    let _ = handle_client(stream, &client_state);
                });
            }
        });
        FakeEngine {
            addr,
            state,
            accept_thread: Some(accept_thread),
        }
    }

    /// Connection string pointing at this instance.
    pub fn connection_string(&self) -> String {
        format!(
            "Data Source=http://{}/xmla;Initial Catalog=Test;User ID=svc;Password=secret",
            self.addr
        )
    }

    /// Make the discovery statement report `trace_id` as already existing.
    pub fn add_existing_trace(&self, trace_id: &str) {
        self.state.traces.lock().unwrap().push(trace_id.to_string());
    }

    /// Queue one subscription payload. Subscribes past the end of the queue
    /// get an empty stream.
    pub fn push_stream(&self, body: impl Into<String>) {
        self.state.streams.lock().unwrap().push_back(body.into());
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.commands.lock().unwrap().clone()
    }

    /// Index of the first recorded command containing `needle`.
    pub fn command_index(&self, needle: &str) -> Option<usize> {
        self.commands().iter().position(|c| c.contains(needle))
    }

    /// Block until a command containing `needle` has been received.
    pub fn wait_for_command(&self, needle: &str) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while self.command_index(needle).is_none() {
            assert!(
                Instant::now() < deadline,
                "timed out waiting for a command containing {needle:?}"
            );
            thread::sleep(Duration::from_millis(10));
        }
    }
}

impl Drop for FakeEngine {
    fn drop(&mut self) {
        self.state.stop.store(true, Ordering::SeqCst);
        // Wake the accept loop so it observes the stop flag.
        let _ = TcpStream::connect(self.addr);
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
    }
}

/// Build a subscription payload of `(uuid, name)` events, each carrying one
/// typed field.
pub fn event_stream_body(events: &[(&str, &str)]) -> String {
    let mut body = String::from("<Envelope><Body>");
    for (uuid, name) in events {
        body.push_str(&format!(
            "<event uuid=\"{uuid}\" name=\"{name}\" timestamp=\"2024-01-15T10:30:00.1234567Z\">\
             <data name=\"Duration\"><value type=\"xs:long\">125</value></data>\
             </event>"
        ));
    }
    body.push_str("</Body></Envelope>");
    body
}

fn handle_client(mut stream: TcpStream, state: &EngineState) -> std::io::Result<()> {
    let body = read_request(&mut stream)?;
    state.commands.lock().unwrap().push(body.clone());

    if body.contains("<BeginSession") {
        return respond(&mut stream, &session_response());
    }
    if body.contains("discover_traces") {
        let traces = state.traces.lock().unwrap().clone();
        return respond(&mut stream, &rowset_response(&traces));
    }
    if body.contains("<Subscribe") {
        let payload = state.streams.lock().unwrap().pop_front().unwrap_or_else(|| {
            "<Envelope><Body></Body></Envelope>".to_string()
        });
        // No Content-Length: the body runs until the socket closes, the
        // same unbounded shape a real subscription response has.
        stream.write_all(
            b"HTTP/1.1 200 OK\r\nContent-Type: text/xml\r\nConnection: close\r\n\r\n",
        )?;
        stream.write_all(payload.as_bytes())?;
        return Ok(());
    }
    respond(&mut stream, &empty_response())
}

fn read_request(stream: &mut TcpStream) -> std::io::Result<String> {
    let mut data = Vec::new();
    let mut buf = [0u8; 4096];
    let header_end = loop {
        if let Some(pos) = find_blank_line(&data) {
            break pos;
        }
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(std::io::Error::other("connection closed mid-request"));
        }
        data.extend_from_slice(&buf[..n]);
    };

    let headers = String::from_utf8_lossy(&data[..header_end]).to_string();
    let mut content_length = 0usize;
    for line in headers.lines() {
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse().unwrap_or(0);
            }
        }
    }

    while data.len() < header_end + content_length {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
    }
    let body_end = (header_end + content_length).min(data.len());
    Ok(String::from_utf8_lossy(&data[header_end..body_end]).to_string())
}

fn find_blank_line(data: &[u8]) -> Option<usize> {
    data.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

fn respond(stream: &mut TcpStream, body: &str) -> std::io::Result<()> {
    let head = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/xml\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    stream.write_all(head.as_bytes())?;
    stream.write_all(body.as_bytes())
}

fn session_response() -> String {
    "<soap:Envelope xmlns:soap=\"http://schemas.xmlsoap.org/soap/envelope/\">\
     <soap:Header>\
     <Session xmlns=\"urn:schemas-microsoft-com:xml-analysis\" SessionId=\"fake-session-1\"/>\
     </soap:Header>\
     <soap:Body><ExecuteResponse/></soap:Body></soap:Envelope>"
        .to_string()
}

fn rowset_response(traces: &[String]) -> String {
    let rows: String = traces
        .iter()
        .map(|id| {
            format!(
                "<row><TraceId>{id}</TraceId>\
                 <CreationTime>2024-01-15T00:00:00</CreationTime><Type>1</Type></row>"
            )
        })
        .collect();
    format!(
        "<soap:Envelope xmlns:soap=\"http://schemas.xmlsoap.org/soap/envelope/\">\
         <soap:Body><ExecuteResponse><return>\
         <root xmlns=\"urn:schemas-microsoft-com:xml-analysis:rowset\">{rows}</root>\
         </return></ExecuteResponse></soap:Body></soap:Envelope>"
    )
}

fn empty_response() -> String {
    "<soap:Envelope xmlns:soap=\"http://schemas.xmlsoap.org/soap/envelope/\">\
     <soap:Body><ExecuteResponse><return><root/></return></ExecuteResponse>\
     </soap:Body></soap:Envelope>"
        .to_string()
}
