//! Rollup store - versioned, compare-and-swap persistence of hour rollups
//!
//! Each device-hour record carries a version that every successful write
//! bumps. Writers read, rebuild, and swap with the version they read; a stale
//! version yields `StoreError::Conflict` and the writer re-reads.

use crate::domain::error::StoreError;
use crate::domain::rollup::{HourKey, HourRollup};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use tracing::trace;

/// A stored value and the version it was read at
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub version: u64,
    pub value: T,
}

#[async_trait]
pub trait RollupStore: Send + Sync {
    async fn load(&self, key: &HourKey) -> Result<Option<Versioned<HourRollup>>, StoreError>;

    /// Write `rollup` if the stored version still equals `expected`
    /// (`None` = the key must not exist yet); returns the new version
    async fn compare_and_swap(
        &self,
        key: &HourKey,
        expected: Option<u64>,
        rollup: HourRollup,
    ) -> Result<u64, StoreError>;

    /// Keys of every rollup whose hour starts before `cutoff`, in key order
    async fn keys_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<HourKey>, StoreError>;
}

/// In-process store; retained raw input stays on the records
#[derive(Default)]
pub struct MemoryRollupStore {
    records: RwLock<BTreeMap<HourKey, Versioned<HourRollup>>>,
}

impl MemoryRollupStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Every stored rollup, ordered by key
    pub fn snapshot(&self) -> Vec<HourRollup> {
        self.records.read().values().map(|v| v.value.clone()).collect()
    }
}

#[async_trait]
impl RollupStore for MemoryRollupStore {
    async fn load(&self, key: &HourKey) -> Result<Option<Versioned<HourRollup>>, StoreError> {
        Ok(self.records.read().get(key).cloned())
    }

    async fn compare_and_swap(
        &self,
        key: &HourKey,
        expected: Option<u64>,
        rollup: HourRollup,
    ) -> Result<u64, StoreError> {
        let mut records = self.records.write();
        let actual = records.get(key).map(|v| v.version);
        if actual != expected {
            return Err(StoreError::Conflict { key: key.clone(), expected, actual });
        }
        let version = actual.map_or(1, |v| v + 1);
        records.insert(key.clone(), Versioned { version, value: rollup });
        trace!(key = %key, version, "rollup_stored");
        Ok(version)
    }

    async fn keys_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<HourKey>, StoreError> {
        Ok(self
            .records
            .read()
            .keys()
            .filter(|k| k.hour_start < cutoff)
            .cloned()
            .collect())
    }
}
