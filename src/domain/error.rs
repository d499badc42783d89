//! Error and diagnostic types
//!
//! Per-event problems never fail a digest: they become `Diagnostic`s on the
//! ingest report. `IngestError` is reserved for failures of a whole hour or
//! digest, classified as recoverable (retry later) or structural (fix config).

use crate::domain::rollup::HourKey;
use crate::domain::types::DeviceType;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("version conflict on {key}: expected {expected:?}, found {actual:?}")]
    Conflict { key: HourKey, expected: Option<u64>, actual: Option<u64> },
}

/// How loudly a failure must be surfaced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Skip and continue, or retry the digest later
    Recoverable,
    /// Configuration mismatch; the affected hour is halted
    Structural,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IngestError {
    #[error("write conflict on {key} persisted after {attempts} attempts")]
    RetriesExhausted { key: HourKey, attempts: u32 },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("bucket count mismatch on {key}: stored {stored}, configured {configured}")]
    BucketCountMismatch { key: HourKey, stored: usize, configured: usize },
    #[error("device type mismatch on {key}: stored {stored:?}, digest {digest:?}")]
    DeviceTypeMismatch { key: HourKey, stored: DeviceType, digest: DeviceType },
    #[error("invalid rollup settings: {0}")]
    InvalidSettings(String),
}

impl IngestError {
    pub fn severity(&self) -> Severity {
        match self {
            IngestError::RetriesExhausted { .. } | IngestError::Store(_) => Severity::Recoverable,
            IngestError::BucketCountMismatch { .. }
            | IngestError::DeviceTypeMismatch { .. }
            | IngestError::InvalidSettings(_) => Severity::Structural,
        }
    }

    #[inline]
    pub fn is_structural(&self) -> bool {
        self.severity() == Severity::Structural
    }
}

/// Why a single event (or a whole digest window) was set aside
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    OutOfBounds,
    InvalidSession,
    InvalidDigestWindow,
    DeviceTypeMismatch,
    UnregisteredDevice,
    UnregisteredTrigger,
    SealedHour,
}

impl DiagnosticKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiagnosticKind::OutOfBounds => "out_of_bounds",
            DiagnosticKind::InvalidSession => "invalid_session",
            DiagnosticKind::InvalidDigestWindow => "invalid_digest_window",
            DiagnosticKind::DeviceTypeMismatch => "device_type_mismatch",
            DiagnosticKind::UnregisteredDevice => "unregistered_device",
            DiagnosticKind::UnregisteredTrigger => "unregistered_trigger",
            DiagnosticKind::SealedHour => "sealed_hour",
        }
    }

    /// Flags are kept in the rollups; everything else drops the event
    pub fn drops_event(&self) -> bool {
        !matches!(self, DiagnosticKind::UnregisteredDevice | DiagnosticKind::UnregisteredTrigger)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub detail: String,
}

impl Diagnostic {
    pub fn new(kind: DiagnosticKind, detail: impl Into<String>) -> Self {
        Self { kind, detail: detail.into() }
    }
}
