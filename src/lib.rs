//! Facility rollup library
//!
//! Hourly Look/Move sensor rollups, live tallies and facility reports.
//! Exposes modules for integration testing and binary reuse.

pub mod domain;
pub mod infra;
pub mod io;
pub mod services;
