//! Rollup egress - writes sealed rollups and facility reports to file
//!
//! Records are written in JSONL format (one JSON object per line) to the
//! file specified in config, each tagged with a `kind`.

use crate::domain::rollup::{FacilityHourReport, HourRollup};
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use tracing::{debug, error, info};

/// One egress line
#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EgressRecord<'a> {
    Rollup(&'a HourRollup),
    FacilityReport(&'a FacilityHourReport),
}

/// Egress writer for rollups
pub struct RollupEgress {
    file_path: String,
}

impl RollupEgress {
    pub fn new(file_path: &str) -> Self {
        info!(file_path = %file_path, "egress_initialized");
        Self { file_path: file_path.to_string() }
    }

    /// Write a sealed device rollup
    /// Returns true if successful, false otherwise
    pub fn write_rollup(&self, rollup: &HourRollup) -> bool {
        let key = rollup.key();
        match self.write_record(&EgressRecord::Rollup(rollup)) {
            Ok(()) => {
                info!(key = %key, device_type = rollup.device_type().as_str(), "rollup_egressed");
                true
            }
            Err(e) => {
                error!(key = %key, error = %e, "rollup_egress_failed");
                false
            }
        }
    }

    pub fn write_report(&self, report: &FacilityHourReport) -> bool {
        match self.write_record(&EgressRecord::FacilityReport(report)) {
            Ok(()) => {
                info!(
                    facility = %report.facility_id,
                    hour_start = %report.hour_start,
                    entrances = report.totals.entrances,
                    exits = report.totals.exits,
                    "facility_report_egressed"
                );
                true
            }
            Err(e) => {
                error!(facility = %report.facility_id, error = %e, "facility_report_egress_failed");
                false
            }
        }
    }

    /// Write multiple rollups
    pub fn write_rollups(&self, rollups: &[HourRollup]) -> usize {
        rollups.iter().filter(|r| self.write_rollup(r)).count()
    }

    fn write_record(&self, record: &EgressRecord<'_>) -> std::io::Result<()> {
        let line = serde_json::to_string(record)?;
        self.append_line(&line)
    }

    /// Append a line to the egress file
    fn append_line(&self, line: &str) -> std::io::Result<()> {
        let path = Path::new(&self.file_path);

        // Create parent directories if they don't exist
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new().create(true).append(true).open(path)?;

        writeln!(file, "{}", line)?;
        debug!(file = %self.file_path, bytes = %line.len(), "egress_written");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::rollup::{FacilityTotals, LookHourRollup, MoveHourRollup};
    use crate::domain::types::DeviceId;
    use chrono::{TimeZone, Utc};
    use std::fs;
    use tempfile::tempdir;

    fn look() -> HourRollup {
        let hour = Utc.with_ymd_and_hms(2025, 3, 14, 10, 0, 0).unwrap();
        let mut r = LookHourRollup::empty(DeviceId::new("look-1"), hour, 60);
        r.entrances = 3;
        r.finalized = true;
        HourRollup::Look(r)
    }

    #[test]
    fn test_write_rollup_tagged() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("rollups.jsonl");
        let egress = RollupEgress::new(file_path.to_str().unwrap());

        assert!(egress.write_rollup(&look()));

        let content = fs::read_to_string(&file_path).unwrap();
        assert!(content.ends_with('\n'));
        let parsed: serde_json::Value = serde_json::from_str(content.trim()).unwrap();
        assert_eq!(parsed["kind"], "rollup");
        assert_eq!(parsed["device_type"], "look");
        assert_eq!(parsed["entrances"], 3);
        assert_eq!(parsed["finalized"], true);
        // Retained raw input is never written out
        assert!(parsed.get("observations").is_none());
    }

    #[test]
    fn test_write_report_and_append() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("nested").join("out.jsonl");
        fs::create_dir_all(file_path.parent().unwrap()).unwrap();
        fs::write(&file_path, "{\"existing\":\"data\"}\n").unwrap();
        let egress = RollupEgress::new(file_path.to_str().unwrap());

        let hour = Utc.with_ymd_and_hms(2025, 3, 14, 10, 0, 0).unwrap();
        let report = FacilityHourReport {
            facility_id: "mall".to_string(),
            hour_start: hour,
            look: vec![],
            moves: vec![MoveHourRollup::empty(DeviceId::new("move-1"), hour, 60)],
            totals: FacilityTotals::default(),
            unknown_devices: vec![],
        };
        assert!(egress.write_report(&report));
        assert_eq!(egress.write_rollups(&[look(), look()]), 2);

        let content = fs::read_to_string(&file_path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].contains("existing"));
        let parsed: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(parsed["kind"], "facility_report");
        assert_eq!(parsed["facility_id"], "mall");
    }

    #[test]
    fn test_creates_parent_directories() {
        let dir = tempdir().unwrap();
        let nested_path = dir.path().join("a").join("b").join("rollups.jsonl");
        let egress = RollupEgress::new(nested_path.to_str().unwrap());
        assert!(egress.write_rollup(&look()));
        assert!(nested_path.exists());
    }
}
