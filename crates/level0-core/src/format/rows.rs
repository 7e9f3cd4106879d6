//! Typed measurement rows produced by the Level 0 parsers.

use std::collections::HashSet;
use std::hash::Hash;

use chrono::{DateTime, Utc};

use crate::models::{AffectedRange, FileDescriptor, FileType, ImportSummary};

/// One autocorrelator spectrum.
#[derive(Debug, Clone, PartialEq)]
pub struct AcRecord {
    pub stw: u64,
    /// `AC1` or `AC2`.
    pub backend: String,
    /// Receiver: `495`, `549`, `555`, `572`, `SPL` or `119`.
    pub frontend: String,
    /// `SIG` or `REF`.
    pub sig_type: String,
    pub ssb_att: [u16; 4],
    pub ssb_fq: [u16; 4],
    pub prescaler: u16,
    /// Integration time in seconds.
    pub inttime: f64,
    pub mode: u16,
    /// 8 × 2 monitor values, row-major.
    pub acd_mon: Vec<f64>,
    /// 8 × 96 correlator values, row-major.
    pub cc: Vec<f64>,
}

/// Mechanism phase of one chopper cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct FbaRecord {
    pub stw: u64,
    /// `REF`, `SK1`, `CAL` or `SK2`.
    pub mech_type: String,
}

/// One housekeeping sample.
#[derive(Debug, Clone, PartialEq)]
pub struct ShkRecord {
    pub stw: u64,
    pub shk_type: String,
    pub value: f64,
}

/// One attitude solution.
#[derive(Debug, Clone, PartialEq)]
pub struct AttitudeRecord {
    pub stw: u64,
    pub soda: i32,
    pub year: i32,
    pub mon: u32,
    pub day: u32,
    pub hour: u32,
    pub min: u32,
    pub secs: f64,
    pub orbit: f64,
    pub qt: [f64; 4],
    pub qa: [f64; 4],
    pub qe: [f64; 3],
    pub gps: [f64; 6],
    pub acs: f64,
}

impl AttitudeRecord {
    /// Squared norm of the attitude error vector.
    pub fn error_norm(&self) -> f64 {
        self.qe.iter().map(|e| e * e).sum()
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        let date = chrono::NaiveDate::from_ymd_opt(self.year, self.mon, self.day)?;
        let whole = self.secs.floor();
        let nanos = ((self.secs - whole) * 1e9).round() as u32;
        let time = chrono::NaiveTime::from_hms_nano_opt(
            self.hour,
            self.min,
            whole as u32,
            nanos.min(999_999_999),
        )?;
        Some(date.and_time(time).and_utc())
    }
}

/// Parsed content of one file, one variant per data category.
#[derive(Debug, Clone, PartialEq)]
pub enum MeasurementRows {
    Spectra(Vec<AcRecord>),
    Mechanism(Vec<FbaRecord>),
    Housekeeping(Vec<ShkRecord>),
    Attitude(Vec<AttitudeRecord>),
}

impl MeasurementRows {
    pub fn len(&self) -> usize {
        match self {
            MeasurementRows::Spectra(rows) => rows.len(),
            MeasurementRows::Mechanism(rows) => rows.len(),
            MeasurementRows::Housekeeping(rows) => rows.len(),
            MeasurementRows::Attitude(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn stws(&self) -> Vec<u64> {
        match self {
            MeasurementRows::Spectra(rows) => rows.iter().map(|r| r.stw).collect(),
            MeasurementRows::Mechanism(rows) => rows.iter().map(|r| r.stw).collect(),
            MeasurementRows::Housekeeping(rows) => rows.iter().map(|r| r.stw).collect(),
            MeasurementRows::Attitude(rows) => rows.iter().map(|r| r.stw).collect(),
        }
    }

    /// Satellite time span and, for attitude data, the UTC span.
    pub fn affected_range(&self) -> Option<AffectedRange> {
        let stws = self.stws();
        let stw_start = *stws.iter().min()?;
        let stw_end = *stws.iter().max()?;

        let (time_start, time_end) = match self {
            MeasurementRows::Attitude(rows) => {
                let times: Vec<_> = rows.iter().filter_map(|r| r.timestamp()).collect();
                (times.iter().min().copied(), times.iter().max().copied())
            }
            _ => (None, None),
        };

        Some(AffectedRange {
            stw_start,
            stw_end,
            time_start,
            time_end,
        })
    }

    /// Summarise these rows as the result of importing `descriptor`.
    pub fn summarize(
        &self,
        descriptor: &FileDescriptor,
        file_type: FileType,
        newly_committed: bool,
    ) -> ImportSummary {
        ImportSummary {
            object_key: descriptor.object_key.clone(),
            object_version: descriptor.object_version.clone(),
            file_type,
            category: file_type.category(),
            row_count: self.len() as u64,
            instrument: file_type.extension().to_ascii_uppercase(),
            range: self.affected_range(),
            newly_committed,
        }
    }
}

/// Keep the last occurrence of every key, preserving the order of the
/// survivors.
pub fn keep_last_by<T, K, F>(rows: Vec<T>, key: F) -> Vec<T>
where
    K: Eq + Hash,
    F: Fn(&T) -> K,
{
    let mut seen = HashSet::new();
    let mut kept: Vec<T> = rows
        .into_iter()
        .rev()
        .filter(|row| seen.insert(key(row)))
        .collect();
    kept.reverse();
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keep_last_by() {
        let rows = vec![(1, "a"), (2, "b"), (1, "c"), (3, "d")];
        let kept = keep_last_by(rows, |r| r.0);
        assert_eq!(kept, vec![(2, "b"), (1, "c"), (3, "d")]);
    }

    #[test]
    fn test_affected_range_spans_rows() {
        let rows = MeasurementRows::Mechanism(vec![
            FbaRecord {
                stw: 30,
                mech_type: "REF".into(),
            },
            FbaRecord {
                stw: 10,
                mech_type: "SK1".into(),
            },
        ]);
        let range = rows.affected_range().unwrap();
        assert_eq!((range.stw_start, range.stw_end), (10, 30));
        assert!(range.time_start.is_none());
        assert!(MeasurementRows::Spectra(vec![]).affected_range().is_none());
    }

    #[test]
    fn test_summary_labels() {
        let descriptor = FileDescriptor::new("L0/0ce86a42.fba", "v1", Utc::now());
        let rows = MeasurementRows::Mechanism(vec![FbaRecord {
            stw: 1,
            mech_type: "CAL".into(),
        }]);
        let s = rows.summarize(&descriptor, FileType::Fba, true);
        assert_eq!(s.instrument, "FBA");
        assert_eq!(s.row_count, 1);
        assert_eq!(s.category.as_str(), "mechanism");
    }
}
