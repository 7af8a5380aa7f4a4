//! HTTP transport to the engine. Connections are plain blocking ureq agents
//! speaking SOAP; one connection maps to one engine session.

use std::io::Read;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use tracing::{debug, warn};

use crate::error::{ConfigError, EngineError};
use crate::xmla::command::{execute_envelope, SessionHeader};
use crate::xmla::response;

/// A live connection to the engine. `execute` runs a command to completion;
/// `open_stream` hands back the raw response body of a command that never
/// completes, which is how trace subscriptions work.
pub trait EngineConnection: Send {
    fn execute(&mut self, command: &str) -> Result<String, EngineError>;
    fn open_stream(&mut self, command: &str) -> Result<Box<dyn Read>, EngineError>;
    /// Release server-side state. Errors are not worth surfacing this late.
    fn close(&mut self);
}

/// Hands out independent connections. Cloneable so different owners (the
/// reader thread, the shutdown path) can each connect on their own.
pub trait ConnectionProvider: Send {
    type Conn: EngineConnection + 'static;

    fn connect(&self) -> Result<Self::Conn, EngineError>;
}

/// Where and how to reach the engine, parsed out of a connection string.
#[derive(Clone, Debug)]
struct Endpoint {
    url: String,
    catalog: Option<String>,
    credentials: Option<(String, String)>,
}

/// `Data Source=https://host/xmla;Initial Catalog=Sales;User ID=u;Password=p`.
/// Key matching is case-insensitive and accepts the usual short aliases.
/// Unknown keys are ignored, the way engine drivers treat them.
fn parse_connection_string(raw: &str) -> Result<Endpoint, ConfigError> {
    let mut url = None;
    let mut catalog = None;
    let mut user = None;
    let mut password = None;
    for pair in raw.split(';') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let Some((key, value)) = pair.split_once('=') else {
            return Err(ConfigError::ConnectionString(format!(
                "expected key=value, got '{pair}'"
            )));
        };
        let value = value.trim();
        match key.trim().to_ascii_lowercase().as_str() {
            "data source" | "datasource" => url = Some(value.to_string()),
            "initial catalog" | "catalog" => catalog = Some(value.to_string()),
            "user id" | "uid" => user = Some(value.to_string()),
            "password" | "pwd" => password = Some(value.to_string()),
            _ => {}
        }
    }
    let url = url.ok_or_else(|| {
        ConfigError::ConnectionString("missing 'Data Source' key".to_string())
    })?;
    if !url.starts_with("http://") && !url.starts_with("https://") {
        return Err(ConfigError::ConnectionString(format!(
            "'Data Source' must be an http(s) endpoint, got '{url}'"
        )));
    }
    let credentials = match (user, password) {
        (Some(user), Some(password)) => Some((user, password)),
        (None, None) => None,
        _ => {
            return Err(ConfigError::ConnectionString(
                "'User ID' and 'Password' must be given together".to_string(),
            ))
        }
    };
    Ok(Endpoint {
        url,
        catalog,
        credentials,
    })
}

/// Connection factory for a real engine endpoint.
#[derive(Clone)]
pub struct XmlaProvider {
    endpoint: Endpoint,
}

impl XmlaProvider {
    pub fn from_connection_string(raw: &str) -> Result<Self, ConfigError> {
        Ok(XmlaProvider {
            endpoint: parse_connection_string(raw)?,
        })
    }
}

impl ConnectionProvider for XmlaProvider {
    type Conn = XmlaConnection;

    fn connect(&self) -> Result<XmlaConnection, EngineError> {
        XmlaConnection::open(self.endpoint.clone())
    }
}

/// One engine session over HTTP.
pub struct XmlaConnection {
    agent: ureq::Agent,
    endpoint: Endpoint,
    session_id: Option<String>,
}

impl XmlaConnection {
    fn open(endpoint: Endpoint) -> Result<Self, EngineError> {
        // The engine reports failures as SOAP faults, usually under an HTTP
        // error status. Keep error statuses as responses so the fault text
        // survives. No timeouts: a subscription stays open indefinitely.
        let agent = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .build()
            .new_agent();
        let mut conn = XmlaConnection {
            agent,
            endpoint,
            session_id: None,
        };
        let envelope = conn.envelope("", &SessionHeader::Begin);
        let body = conn.roundtrip(&envelope)?;
        conn.session_id = response::session_id(&body);
        match &conn.session_id {
            Some(id) => debug!(session = id.as_str(), "connected to the engine"),
            // Some gateways strip the header; commands still work without it.
            None => debug!("connected to the engine without a session id"),
        }
        Ok(conn)
    }

    fn envelope(&self, command: &str, session: &SessionHeader) -> String {
        execute_envelope(command, self.endpoint.catalog.as_deref(), session)
    }

    fn attach_header(&self) -> SessionHeader<'_> {
        match self.session_id.as_deref() {
            Some(id) => SessionHeader::Attach(id),
            None => SessionHeader::None,
        }
    }

    fn post(&self, envelope: &str) -> Result<ureq::http::Response<ureq::Body>, EngineError> {
        let mut request = self
            .agent
            .post(&self.endpoint.url)
            .header("Content-Type", "text/xml; charset=utf-8")
            .header(
                "SOAPAction",
                "\"urn:schemas-microsoft-com:xml-analysis:Execute\"",
            );
        if let Some((user, password)) = &self.endpoint.credentials {
            let token = STANDARD.encode(format!("{user}:{password}"));
            request = request.header("Authorization", format!("Basic {token}"));
        }
        Ok(request.send(envelope)?)
    }

    /// POST one envelope and read the reply in full. A fault in the body
    /// wins over the HTTP status, since it carries the engine's own message.
    fn roundtrip(&self, envelope: &str) -> Result<String, EngineError> {
        let response = self.post(envelope)?;
        let status = response.status();
        let body = read_body(response)?;
        if let Some(description) = response::fault_description(&body) {
            return Err(EngineError::Fault(description));
        }
        if !status.is_success() {
            return Err(EngineError::Response(format!("engine returned HTTP {status}")));
        }
        Ok(body)
    }
}

impl EngineConnection for XmlaConnection {
    fn execute(&mut self, command: &str) -> Result<String, EngineError> {
        let envelope = self.envelope(command, &self.attach_header());
        self.roundtrip(&envelope)
    }

    fn open_stream(&mut self, command: &str) -> Result<Box<dyn Read>, EngineError> {
        let envelope = self.envelope(command, &self.attach_header());
        let response = self.post(&envelope)?;
        let status = response.status();
        if !status.is_success() {
            // A refused subscription has a bounded body; read it for the
            // fault text instead of handing back a dead stream.
            let body = read_body(response)?;
            if let Some(description) = response::fault_description(&body) {
                return Err(EngineError::Fault(description));
            }
            return Err(EngineError::Response(format!("engine returned HTTP {status}")));
        }
        Ok(Box::new(response.into_body().into_reader()))
    }

    fn close(&mut self) {
        if let Some(id) = self.session_id.take() {
            let envelope = self.envelope("", &SessionHeader::End(&id));
            if let Err(err) = self.post(&envelope) {
                warn!(error = %err, "failed to end the engine session");
            }
        }
    }
}

fn read_body(response: ureq::http::Response<ureq::Body>) -> Result<String, EngineError> {
    response
        .into_body()
        .read_to_string()
        .map_err(EngineError::from)
}
