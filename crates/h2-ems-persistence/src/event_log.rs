//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Append-only JSON-lines record log."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use h2_ems_cell::PersistItem;
use serde::{Deserialize, Serialize};
use sha2::Digest;
use tracing::warn;

use crate::{PersistenceError, Result};

/// Version written into the header line of every record log.
pub const LOG_FORMAT_VERSION: u16 = 1;

const LOG_FORMAT: &str = "h2-ems-records";

/// First line of a record log.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct EventLogHeader {
    format: String,
    version: u16,
    created_at: DateTime<Utc>,
    hash: String,
}

impl EventLogHeader {
    fn new(created_at: DateTime<Utc>) -> Self {
        let hash = format!(
            "{:x}",
            sha2::Sha256::digest(format!("{LOG_FORMAT}/{}", created_at.to_rfc3339()).as_bytes())
        );
        Self {
            format: LOG_FORMAT.to_owned(),
            version: LOG_FORMAT_VERSION,
            created_at,
            hash,
        }
    }
}

/// One persisted burst or snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventLogEntry {
    /// Sequential identifier assigned when appending.
    pub sequence: u64,
    /// Time the item was persisted.
    pub timestamp: DateTime<Utc>,
    /// `burst` or `snapshot`.
    pub kind: String,
    /// Owning module for snapshots.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<u8>,
    /// Serialized item.
    pub payload: serde_json::Value,
}

impl EventLogEntry {
    /// Build an entry for a dequeued handoff item.
    pub fn from_item(item: &PersistItem, timestamp: DateTime<Utc>) -> Result<Self> {
        Ok(Self {
            sequence: 0,
            timestamp,
            kind: item.kind().to_owned(),
            device: item.device().map(|device| device.get()),
            payload: serde_json::to_value(item)?,
        })
    }
}

/// Append-only writer for the record log.
pub struct EventLogWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    next_sequence: u64,
}

impl std::fmt::Debug for EventLogWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLogWriter")
            .field("path", &self.path)
            .field("next_sequence", &self.next_sequence)
            .finish()
    }
}

impl EventLogWriter {
    /// Open a log for appending, writing a header if the file is new. Sequence
    /// numbers continue from the last entry of an existing log.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        if path.exists() {
            truncate_torn_tail(path)?;
        }
        let fresh = !path.exists() || fs::metadata(path)?.len() == 0;
        let next_sequence = if fresh { 0 } else { last_sequence(path)? };
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut writer = BufWriter::new(file);

        if fresh {
            let line = serde_json::to_string(&EventLogHeader::new(Utc::now()))?;
            writer.write_all(line.as_bytes())?;
            writer.write_all(b"\n")?;
            writer.flush()?;
        }

        Ok(Self {
            path: path.to_path_buf(),
            writer,
            next_sequence,
        })
    }

    /// Append an entry and return the assigned sequence number and byte count.
    pub fn append(&mut self, mut entry: EventLogEntry) -> Result<(u64, usize)> {
        self.next_sequence += 1;
        entry.sequence = self.next_sequence;
        let line = serde_json::to_string(&entry)?;
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok((entry.sequence, line.len() + 1))
    }

    /// Flush buffered writes to the underlying file handle.
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    /// Location of the log on disk.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn read_header(reader: &mut BufReader<File>, path: &Path) -> Result<EventLogHeader> {
    let mut first_line = String::new();
    reader.read_line(&mut first_line)?;
    let header: EventLogHeader = serde_json::from_str(first_line.trim())
        .map_err(|_| PersistenceError::BadHeader(path.display().to_string()))?;
    if header.format != LOG_FORMAT {
        return Err(PersistenceError::BadHeader(path.display().to_string()));
    }
    Ok(header)
}

/// Cut back a partial last line left by an append interrupted mid-write, so
/// the log can be reopened and appended to again.
fn truncate_torn_tail(path: &Path) -> Result<()> {
    let contents = fs::read(path)?;
    if contents.is_empty() || contents.ends_with(b"\n") {
        return Ok(());
    }
    let keep = contents
        .iter()
        .rposition(|byte| *byte == b'\n')
        .map_or(0, |newline| newline + 1);
    warn!(
        target: "h2_ems::persistence",
        path = %path.display(),
        dropped_bytes = contents.len() - keep,
        "truncating torn record at end of log"
    );
    OpenOptions::new()
        .write(true)
        .open(path)?
        .set_len(keep as u64)?;
    Ok(())
}

fn last_sequence(path: &Path) -> Result<u64> {
    let mut last = 0u64;
    for entry in EventLogReader::open(path)? {
        last = entry?.sequence;
    }
    Ok(last)
}

/// Replay the log in order, invoking the callback for each entry.
pub fn replay<F>(path: &Path, mut handler: F) -> Result<usize>
where
    F: FnMut(EventLogEntry) -> Result<()>,
{
    let mut count = 0usize;
    for entry in EventLogReader::open(path)? {
        handler(entry?)?;
        count += 1;
    }
    Ok(count)
}

/// Streaming iterator over the log entries.
pub struct EventLogReader {
    lines: std::io::Lines<BufReader<File>>,
}

impl EventLogReader {
    /// Open the log for sequential reading, validating its header.
    pub fn open(path: &Path) -> Result<Self> {
        let mut reader = BufReader::new(File::open(path)?);
        read_header(&mut reader, path)?;
        Ok(Self {
            lines: reader.lines(),
        })
    }
}

impl Iterator for EventLogReader {
    type Item = Result<EventLogEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.lines.next()? {
                Ok(line) if line.trim().is_empty() => continue,
                Ok(line) => {
                    return Some(serde_json::from_str(&line).map_err(PersistenceError::from))
                }
                Err(err) => return Some(Err(err.into())),
            }
        }
    }
}
