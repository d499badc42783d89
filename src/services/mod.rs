//! Services - business logic and state management
//!
//! This module contains the core business logic services:
//! - `normalizer` - Validates digests and groups events by device-hour
//! - `look_builder` - Look (person detection) hour rollups
//! - `move_builder` - Move (border/hotspot/dwell) hour rollups
//! - `occupancy` - Bucket grid, presence marking and occupancy stats
//! - `demographics` - Age bucket, generation and gender classification
//! - `engine` - Applies digests to the rollup store and seals elapsed hours
//! - `tally_tracker` - Sliding-window distinct counts for live views
//! - `combiner` - Facility-wide hour reports
//! - `ingest_worker` - Sharded async ingest workers

pub mod combiner;
pub mod demographics;
pub mod engine;
pub mod ingest_worker;
pub mod look_builder;
pub mod move_builder;
pub mod normalizer;
pub mod occupancy;
pub mod tally_tracker;

// Re-export commonly used types
pub use combiner::FacilityCombiner;
pub use engine::{IngestReport, RetryPolicy, RollupEngine};
pub use ingest_worker::{IngestPool, IngestProgress};
pub use normalizer::{NormalizedDigest, Normalizer};
pub use occupancy::RollupSettings;
pub use tally_tracker::{TallyTracker, TallyWindows};
