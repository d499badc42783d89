//! Infrastructure - configuration, registry, and metrics
//!
//! This module contains infrastructure concerns:
//! - `config` - Application configuration (TOML loading, defaults)
//! - `registry` - Registered facilities, devices and triggers
//! - `metrics` - Lock-free metrics collection

pub mod config;
pub mod metrics;
pub mod registry;

// Re-export commonly used types
pub use config::Config;
pub use metrics::Metrics;
pub use registry::FacilityRegistry;
