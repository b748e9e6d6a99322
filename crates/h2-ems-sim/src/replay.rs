//! ---
//! ems_section: "11-simulation-test-harness"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Bus capture replay as a frame source."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use csv::{ReaderBuilder, WriterBuilder};
use h2_ems_cell::{BusConnector, FrameSource, RawFrame, TransportError};
use h2_ems_common::SharedClock;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::frames::{CaptureFrame, CaptureRecord};

/// How replayed frames are spaced in time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Pacing {
    /// Sleep between frames, dividing capture offsets by `speedup`. Frames are
    /// stamped with the clock at delivery.
    RealTime { speedup: f64 },
    /// Deliver back to back, stamped `connect time + offset`.
    Instant,
}

impl Pacing {
    pub fn real_time(speedup: Option<f64>) -> Self {
        let speedup = speedup.filter(|s| s.is_finite() && *s > 0.0).unwrap_or(1.0);
        Pacing::RealTime { speedup }
    }
}

/// A loaded capture, ordered by offset.
#[derive(Debug, Default, Clone)]
pub struct ReplayEngine {
    frames: Vec<CaptureFrame>,
}

impl ReplayEngine {
    pub fn new(mut frames: Vec<CaptureFrame>) -> Self {
        frames.sort_by_key(|frame| frame.offset_ms);
        Self { frames }
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json(path),
            Some("csv") => Self::from_csv(path),
            _ => anyhow::bail!("unsupported capture format: {}", path.display()),
        }
    }

    pub fn frames(&self) -> &[CaptureFrame] {
        &self.frames
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Offset of the last frame.
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.frames.last().map_or(0, |frame| frame.offset_ms))
    }

    fn from_json(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read capture file {}", path.display()))?;
        let rows: Vec<CaptureRecord> = serde_json::from_str(&contents)
            .with_context(|| format!("invalid capture JSON {}", path.display()))?;
        let frames = rows
            .iter()
            .enumerate()
            .map(|(n, row)| {
                row.parse()
                    .with_context(|| format!("capture record {n} in {}", path.display()))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(frames))
    }

    fn from_csv(path: &Path) -> Result<Self> {
        let file = fs::File::open(path)
            .with_context(|| format!("unable to open capture csv {}", path.display()))?;
        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_reader(file);
        let mut frames = Vec::new();
        for row in reader.deserialize::<CaptureRecord>() {
            let row = row.with_context(|| format!("invalid capture row in {}", path.display()))?;
            frames.push(
                row.parse()
                    .with_context(|| format!("invalid capture row in {}", path.display()))?,
            );
        }
        Ok(Self::new(frames))
    }
}

/// Write frames as a CSV capture readable by [`ReplayEngine::from_path`].
pub fn write_capture_csv(path: &Path, frames: &[CaptureFrame]) -> Result<()> {
    let mut writer = WriterBuilder::new()
        .has_headers(true)
        .from_path(path)
        .with_context(|| format!("unable to create capture csv {}", path.display()))?;
    for frame in frames {
        writer.serialize(CaptureRecord::from(frame))?;
    }
    writer.flush()?;
    Ok(())
}

/// Bus connector replaying a capture. Every connect starts from the first frame.
#[derive(Debug, Clone)]
pub struct ReplayConnector {
    name: String,
    frames: Arc<[CaptureFrame]>,
    pacing: Pacing,
    clock: SharedClock,
}

impl ReplayConnector {
    pub fn new(
        name: impl Into<String>,
        engine: ReplayEngine,
        pacing: Pacing,
        clock: SharedClock,
    ) -> Self {
        Self {
            name: name.into(),
            frames: engine.frames.into(),
            pacing,
            clock,
        }
    }
}

#[async_trait]
impl BusConnector for ReplayConnector {
    fn describe(&self) -> String {
        format!("replay:{}", self.name)
    }

    async fn connect(&self) -> Result<Box<dyn FrameSource>, TransportError> {
        info!(
            target: "h2_ems::sim",
            capture = %self.name,
            frames = self.frames.len(),
            pacing = ?self.pacing,
            "starting capture replay"
        );
        Ok(Box::new(ReplaySource::new(
            self.frames.clone(),
            self.pacing,
            self.clock.clone(),
        )))
    }
}

/// One pass over a capture.
#[derive(Debug)]
pub struct ReplaySource {
    frames: Arc<[CaptureFrame]>,
    cursor: usize,
    pacing: Pacing,
    clock: SharedClock,
    started: Instant,
    base: DateTime<Utc>,
}

impl ReplaySource {
    pub fn new(frames: Arc<[CaptureFrame]>, pacing: Pacing, clock: SharedClock) -> Self {
        let base = clock.now();
        Self {
            frames,
            cursor: 0,
            pacing,
            clock,
            started: Instant::now(),
            base,
        }
    }

    pub fn remaining(&self) -> usize {
        self.frames.len() - self.cursor
    }
}

#[async_trait]
impl FrameSource for ReplaySource {
    async fn next_frame(&mut self) -> Result<Option<RawFrame>, TransportError> {
        let Some(frame) = self.frames.get(self.cursor).cloned() else {
            debug!(target: "h2_ems::sim", "capture exhausted");
            return Ok(None);
        };
        self.cursor += 1;
        let raw = match self.pacing {
            Pacing::RealTime { speedup } => {
                let due = Duration::from_secs_f64(frame.offset_ms as f64 / 1000.0 / speedup);
                tokio::time::sleep_until(self.started + due).await;
                frame.to_raw_at(self.clock.now())?
            }
            Pacing::Instant => frame.to_raw(self.base)?,
        };
        Ok(Some(raw))
    }
}
