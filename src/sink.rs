//! Where decoded events end up. The production sink appends JSON lines to
//! date-partitioned files; `MemorySink` is the in-process stand-in used by
//! tests and by anything that wants to observe records directly.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{Local, NaiveDate};

use crate::error::SinkError;
use crate::event::OutputRecord;

pub trait RecordSink {
    fn append(&mut self, record: &OutputRecord) -> Result<(), SinkError>;
}

/// Appends each record as one line of compact JSON to
/// `<root>/<yyyyMMdd>/<event-name>.jsonl`, creating directories on demand.
/// Files are opened per append; nothing is held between events, so a crash
/// never loses more than the line being written.
#[derive(Clone, Debug)]
pub struct PartitionedJsonlSink {
    root: PathBuf,
}

impl PartitionedJsonlSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        PartitionedJsonlSink { root: root.into() }
    }

    /// The file a record with this name lands in on the given day.
    pub fn partition_path(&self, date: NaiveDate, event_name: &str) -> PathBuf {
        self.root
            .join(date.format("%Y%m%d").to_string())
            .join(format!("{}.jsonl", sanitize_component(event_name)))
    }

    fn append_on(&self, date: NaiveDate, record: &OutputRecord) -> Result<(), SinkError> {
        let path = self.partition_path(date, &record.name);
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|source| SinkError::CreateDir {
                path: dir.to_path_buf(),
                source,
            })?;
        }
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| SinkError::Append {
                path: path.clone(),
                source,
            })?;
        file.write_all(line.as_bytes())
            .map_err(|source| SinkError::Append { path, source })
    }
}

impl RecordSink for PartitionedJsonlSink {
    fn append(&mut self, record: &OutputRecord) -> Result<(), SinkError> {
        // Partitions follow the local clock, so a service left running rolls
        // to a new directory at midnight.
        self.append_on(Local::now().date_naive(), record)
    }
}

/// Event names come from the engine and become file names; anything outside
/// a conservative set is replaced.
fn sanitize_component(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ' ') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "event".to_string()
    } else {
        cleaned
    }
}

/// Collects records in memory. Clones share the same backing store, so a
/// test can hand one clone to the service and keep another to assert on.
#[derive(Clone, Debug, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<OutputRecord>>>,
    fail_names: Arc<Mutex<Vec<String>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<OutputRecord> {
        self.records.lock().unwrap().clone()
    }

    /// Make appends for this event name fail, for exercising skip paths.
    pub fn fail_event(&self, name: &str) {
        self.fail_names.lock().unwrap().push(name.to_string());
    }
}

impl RecordSink for MemorySink {
    fn append(&mut self, record: &OutputRecord) -> Result<(), SinkError> {
        if self.fail_names.lock().unwrap().iter().any(|n| n == &record.name) {
            return Err(SinkError::Append {
                path: Path::new(&record.name).to_path_buf(),
                source: std::io::Error::other("rejected by test sink"),
            });
        }
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }
}
