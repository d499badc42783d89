//! Digest reader - loads device digests from JSONL files
//!
//! One digest per line, camelCase keys. Blank lines are ignored; lines that
//! fail to parse are skipped with a warning.

use crate::domain::types::DeviceDigest;
use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use tracing::{info, warn};

pub fn parse_digest_line(line: &str) -> serde_json::Result<DeviceDigest> {
    serde_json::from_str(line)
}

/// Parsed digests in file order, and the number of skipped lines
pub fn load_digests(path: impl AsRef<Path>) -> Result<(Vec<DeviceDigest>, usize)> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("failed to open digest file {}", path.display()))?;

    let mut digests = Vec::new();
    let mut skipped = 0usize;
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("failed to read {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        match parse_digest_line(&line) {
            Ok(digest) => digests.push(digest),
            Err(e) => {
                skipped += 1;
                warn!(file = %path.display(), line = idx + 1, error = %e, "digest_line_skipped");
            }
        }
    }

    info!(file = %path.display(), digests = digests.len(), skipped, "digests_loaded");
    Ok((digests, skipped))
}
