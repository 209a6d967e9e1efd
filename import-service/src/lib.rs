pub mod config;
pub mod importer;
pub mod metrics_server;
pub mod observability;
pub mod pipeline;
pub mod reconcile;
pub mod sinks;
pub mod sources;
pub mod transform;
pub mod writer;

pub use importer::{CycleReport, Importer, MeterJob};
pub use pipeline::{Envelope, ImportError};
