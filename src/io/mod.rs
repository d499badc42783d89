//! IO modules - external system interfaces
//!
//! This module contains all external IO operations:
//! - `digest_reader` - Device digests from JSONL files
//! - `store` - Versioned rollup store with compare-and-swap writes
//! - `egress` - Sealed rollups and facility reports to file (JSONL format)
//! - `prometheus` - Prometheus metrics HTTP endpoint

pub mod digest_reader;
pub mod egress;
pub mod prometheus;
pub mod store;

// Re-export commonly used types
pub use digest_reader::load_digests;
pub use egress::RollupEgress;
pub use store::{MemoryRollupStore, RollupStore, Versioned};
