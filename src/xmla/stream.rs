//! Decoder for the live extended-event stream. The engine answers a
//! Subscribe with an unbounded XML document; events arrive one `<event>`
//! element at a time and are decoded as they appear, never buffered as a
//! whole document.

use std::collections::BTreeMap;
use std::io::BufRead;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use uuid::Uuid;

use crate::error::{DecodeError, StreamError};
use crate::event::{FieldValue, StreamEvent};

/// Incremental reader over a subscription response body.
///
/// Yields one item per `<event>` element. A malformed event comes out as
/// `Err(StreamError::Event(..))` with the reader already positioned past it,
/// so the caller can skip it and pull the next one. XML-level failures and
/// mid-event truncation end the stream; after one of those (or `None`) the
/// iterator is fused.
pub struct EventStream<R: BufRead> {
    reader: Reader<R>,
    buf: Vec<u8>,
    finished: bool,
}

impl<R: BufRead> EventStream<R> {
    pub fn new(source: R) -> Self {
        let mut reader = Reader::from_reader(source);
        reader.config_mut().trim_text(true);
        EventStream {
            reader,
            buf: Vec::new(),
            finished: false,
        }
    }

    /// Consume everything up to the matching `</event>` and collect the
    /// typed fields. Field-level problems are remembered but do not stop
    /// the scan, so the reader always lands on an element boundary.
    fn read_body(&mut self) -> Result<(BTreeMap<String, FieldValue>, Option<DecodeError>), StreamError> {
        let mut fields = BTreeMap::new();
        let mut pending: Option<DecodeError> = None;
        let mut depth = 0usize;
        let mut field: Option<String> = None;
        let mut value_type: Option<String> = None;
        let mut in_value = false;
        let mut raw = String::new();
        loop {
            self.buf.clear();
            match self.reader.read_event_into(&mut self.buf)? {
                Event::Start(e) => {
                    depth += 1;
                    match e.local_name().as_ref() {
                        b"data" => field = attr_value(&e, "name"),
                        b"value" if field.is_some() => {
                            in_value = true;
                            value_type = attr_value(&e, "type");
                            raw.clear();
                        }
                        _ => {}
                    }
                }
                Event::Empty(e) if e.local_name().as_ref() == b"value" => {
                    // <value/> is a present-but-empty field
                    if let Some(name) = field.as_deref() {
                        let kind = attr_value(&e, "type");
                        record_field(
                            &mut fields,
                            &mut pending,
                            name,
                            kind.as_deref(),
                            String::new(),
                        );
                    }
                }
                Event::Text(text) if in_value => {
                    raw.push_str(&text.unescape()?);
                }
                // Query text often arrives wrapped in CDATA.
                Event::CData(text) if in_value => {
                    raw.push_str(&String::from_utf8_lossy(&text.into_inner()));
                }
                Event::End(e) => {
                    if depth == 0 {
                        return Ok((fields, pending));
                    }
                    depth -= 1;
                    match e.local_name().as_ref() {
                        b"value" if in_value => {
                            in_value = false;
                            if let Some(name) = field.as_deref() {
                                record_field(
                                    &mut fields,
                                    &mut pending,
                                    name,
                                    value_type.as_deref(),
                                    std::mem::take(&mut raw),
                                );
                            }
                        }
                        b"data" => field = None,
                        _ => {}
                    }
                }
                Event::Eof => return Err(StreamError::Truncated),
                _ => {}
            }
        }
    }

    /// The body is consumed in full before any validation, even for a doomed
    /// event, so the next item starts on an element boundary.
    fn decode_event(&mut self, start: &BytesStart) -> Result<StreamEvent, StreamError> {
        let (fields, pending) = self.read_body()?;
        build_event(start, fields, pending)
    }
}

fn build_event(
    start: &BytesStart,
    fields: BTreeMap<String, FieldValue>,
    pending: Option<DecodeError>,
) -> Result<StreamEvent, StreamError> {
    let uuid = attr_value(start, "uuid").ok_or(DecodeError::MissingAttribute("uuid"))?;
    let name = attr_value(start, "name").ok_or(DecodeError::MissingAttribute("name"))?;
    let timestamp =
        attr_value(start, "timestamp").ok_or(DecodeError::MissingAttribute("timestamp"))?;
    if let Some(err) = pending {
        return Err(err.into());
    }
    let uuid = Uuid::parse_str(&uuid).map_err(|source| DecodeError::BadUuid {
        value: uuid.clone(),
        source,
    })?;
    Ok(StreamEvent {
        uuid,
        timestamp,
        name,
        fields,
    })
}

impl<R: BufRead> Iterator for EventStream<R> {
    type Item = Result<StreamEvent, StreamError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        loop {
            self.buf.clear();
            let event = match self.reader.read_event_into(&mut self.buf) {
                Ok(event) => event,
                Err(err) => {
                    self.finished = true;
                    return Some(Err(err.into()));
                }
            };
            match event {
                Event::Start(e) if e.local_name().as_ref() == b"event" => {
                    let start = e.into_owned();
                    let item = self.decode_event(&start);
                    if matches!(item, Err(StreamError::Fault(_) | StreamError::Truncated)) {
                        self.finished = true;
                    }
                    return Some(item);
                }
                Event::Empty(e) if e.local_name().as_ref() == b"event" => {
                    return Some(build_event(&e, BTreeMap::new(), None));
                }
                Event::Eof => {
                    self.finished = true;
                    return None;
                }
                // Wrapper elements around the event sequence carry nothing.
                _ => {}
            }
        }
    }
}

fn attr_value(start: &BytesStart, name: &str) -> Option<String> {
    start
        .try_get_attribute(name)
        .ok()
        .flatten()
        .and_then(|attr| attr.unescape_value().ok())
        .map(|v| v.into_owned())
}

fn record_field(
    fields: &mut BTreeMap<String, FieldValue>,
    pending: &mut Option<DecodeError>,
    name: &str,
    kind: Option<&str>,
    raw: String,
) {
    match typed_value(kind, raw, name) {
        Ok(value) => {
            fields.insert(name.to_string(), value);
        }
        Err(err) => {
            if pending.is_none() {
                *pending = Some(err);
            }
        }
    }
}

/// Map an `xsi:type` annotation onto a field value. Unannotated and unknown
/// types stay text.
fn typed_value(kind: Option<&str>, raw: String, field: &str) -> Result<FieldValue, DecodeError> {
    let Some(kind) = kind else {
        return Ok(FieldValue::Text(raw));
    };
    // The annotation arrives prefixed ("xs:long"); only the local part matters.
    let local = kind.rsplit(':').next().unwrap_or(kind);
    match local {
        "byte" | "short" | "int" | "integer" | "long" | "unsignedByte" | "unsignedShort"
        | "unsignedInt" | "unsignedLong" => {
            // Counters above i64::MAX arrive as xs:unsignedLong.
            if let Ok(value) = raw.trim().parse::<i64>() {
                Ok(FieldValue::Integer(value))
            } else if let Ok(value) = raw.trim().parse::<u64>() {
                Ok(FieldValue::Unsigned(value))
            } else {
                Err(bad_field(field, "integer", raw))
            }
        }
        "float" | "double" | "decimal" => raw
            .trim()
            .parse::<f64>()
            .map(FieldValue::Float)
            .map_err(|_| bad_field(field, "float", raw)),
        "boolean" => match raw.trim() {
            "true" | "1" => Ok(FieldValue::Boolean(true)),
            "false" | "0" => Ok(FieldValue::Boolean(false)),
            _ => Err(bad_field(field, "boolean", raw)),
        },
        "base64Binary" => STANDARD
            .decode(raw.trim())
            .map(FieldValue::Binary)
            .map_err(|_| bad_field(field, "base64Binary", raw)),
        _ => Ok(FieldValue::Text(raw)),
    }
}

fn bad_field(field: &str, kind: &'static str, value: String) -> DecodeError {
    DecodeError::BadFieldValue {
        field: field.to_string(),
        kind,
        value,
    }
}
