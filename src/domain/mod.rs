//! Domain models - raw sensor events and derived aggregates
//!
//! This module contains the canonical data types used throughout the system:
//! - `types` - identifiers, raw detections/crossings, device digests
//! - `rollup` - hourly Look/Move rollups and facility reports
//! - `tally` - live sliding-window counts
//! - `error` - store/ingest errors and per-event diagnostics

pub mod error;
pub mod rollup;
pub mod tally;
pub mod types;

pub use error::{Diagnostic, DiagnosticKind, IngestError, Severity, StoreError};
pub use rollup::{FacilityHourReport, HourKey, HourRollup, LookHourRollup, MoveHourRollup};
pub use types::{DeviceDigest, DeviceId, DeviceType, SensorEvent, TriggerId, TriggerType};
