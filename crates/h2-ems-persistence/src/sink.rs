//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Record sink contract and the event-log backed sink."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use h2_ems_cell::PersistItem;

use crate::event_log::{EventLogEntry, EventLogWriter};
use crate::Result;

/// An open connection to a persistent store.
pub trait RecordSink: Send {
    /// Persist one item, returning the number of bytes written.
    fn write(&mut self, item: &PersistItem, at: DateTime<Utc>) -> Result<usize>;

    /// Push buffered data to durable storage.
    fn flush(&mut self) -> Result<()>;
}

/// Opens [`RecordSink`] connections. Called again after every sink failure.
pub trait SinkConnector: Send + Sync {
    /// Human-readable target, used in logs.
    fn describe(&self) -> String;

    /// Open a fresh connection.
    fn connect(&self) -> Result<Box<dyn RecordSink>>;
}

/// Sink appending JSON lines to a local record log.
#[derive(Debug)]
pub struct EventLogSink {
    writer: EventLogWriter,
}

impl EventLogSink {
    /// Open (or create) the log at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            writer: EventLogWriter::open(path)?,
        })
    }
}

impl RecordSink for EventLogSink {
    fn write(&mut self, item: &PersistItem, at: DateTime<Utc>) -> Result<usize> {
        let (_, bytes) = self.writer.append(EventLogEntry::from_item(item, at)?)?;
        Ok(bytes)
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()
    }
}

/// Connector for [`EventLogSink`].
#[derive(Debug, Clone)]
pub struct EventLogConnector {
    path: PathBuf,
}

impl EventLogConnector {
    /// Connector targeting the log at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SinkConnector for EventLogConnector {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    fn connect(&self) -> Result<Box<dyn RecordSink>> {
        Ok(Box::new(EventLogSink::open(&self.path)?))
    }
}
