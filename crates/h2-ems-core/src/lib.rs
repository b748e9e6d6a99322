//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Supervisor runtime crate exports."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Supervisor runtime for H2-EMS: bus ingestion, the recovery sweep, telemetry
//! logging and the persistence consumer.

pub mod ingest;
#[cfg(feature = "simulation")]
pub mod offline;
pub mod supervisor;

pub use ingest::{IngestCounts, IngestStats};
#[cfg(feature = "simulation")]
pub use offline::{decode_capture, OfflineReport};
pub use supervisor::{Collaborators, Supervisor, SupervisorHandle};
