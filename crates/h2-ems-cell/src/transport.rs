//! ---
//! ems_section: "04-fuel-cell-bus"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Bus adapter contract and in-memory frame source."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::frame::RawFrame;

/// A connected stream of frames.
#[async_trait]
pub trait FrameSource: Send {
    /// Next frame in arrival order. `Ok(None)` marks a finite source that has
    /// been exhausted; errors mean the connection is gone.
    async fn next_frame(&mut self) -> Result<Option<RawFrame>, TransportError>;
}

/// Opens connections to a bus adapter. Called again after every disconnect.
#[async_trait]
pub trait BusConnector: Send + Sync {
    fn describe(&self) -> String;

    async fn connect(&self) -> Result<Box<dyn FrameSource>, TransportError>;
}

#[derive(Debug)]
pub struct ChannelSource {
    rx: mpsc::Receiver<RawFrame>,
}

impl ChannelSource {
    pub fn new(rx: mpsc::Receiver<RawFrame>) -> Self {
        Self { rx }
    }
}

#[async_trait]
impl FrameSource for ChannelSource {
    async fn next_frame(&mut self) -> Result<Option<RawFrame>, TransportError> {
        Ok(self.rx.recv().await)
    }
}

/// Connector over an in-process channel. Hands out its receiver once; later
/// connects report the adapter as unavailable.
#[derive(Debug)]
pub struct ChannelConnector {
    name: String,
    rx: Mutex<Option<mpsc::Receiver<RawFrame>>>,
}

impl ChannelConnector {
    pub fn new(name: impl Into<String>, capacity: usize) -> (mpsc::Sender<RawFrame>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            tx,
            Self {
                name: name.into(),
                rx: Mutex::new(Some(rx)),
            },
        )
    }
}

#[async_trait]
impl BusConnector for ChannelConnector {
    fn describe(&self) -> String {
        format!("channel:{}", self.name)
    }

    async fn connect(&self) -> Result<Box<dyn FrameSource>, TransportError> {
        let rx = self
            .rx
            .lock()
            .take()
            .ok_or_else(|| TransportError::Unavailable(self.describe()))?;
        Ok(Box::new(ChannelSource::new(rx)))
    }
}
