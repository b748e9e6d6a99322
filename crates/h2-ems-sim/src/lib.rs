//! ---
//! ems_section: "11-simulation"
//! ems_subsection: "01-bootstrap"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Bus capture replay crate exports."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
//! Bus capture replay and synthetic fuel-cell frames.
//!
//! Captures are CSV (`offset_ms,id,data`) or a JSON list of the same records,
//! with `id` in hex (`0x139`) or decimal and `data` as a hex string.

pub mod frames;
pub mod replay;

pub use frames::{CaptureFrame, FrameBuilder};
pub use replay::{write_capture_csv, Pacing, ReplayConnector, ReplayEngine, ReplaySource};
