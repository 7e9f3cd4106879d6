//! Level 0 file formats.
//!
//! | Module | Files | Rows |
//! |--------|-------|------|
//! | [`ac`] | `.ac1`, `.ac2` | [`AcRecord`](rows::AcRecord) |
//! | [`fba`] | `.fba` | [`FbaRecord`](rows::FbaRecord) |
//! | [`shk`] | `.shk` | [`ShkRecord`](rows::ShkRecord) |
//! | [`attitude`] | `.att` | [`AttitudeRecord`](rows::AttitudeRecord) |
//!
//! [`parse`] decodes a file of a known type and then runs the plausibility
//! checks in [`validate`]. Any failure is a [`ParseError`], which the
//! import step reports as a malformed file.

pub mod ac;
pub mod attitude;
pub mod blocks;
pub mod fba;
pub mod rows;
pub mod shk;
#[cfg(any(test, feature = "test-support"))]
pub mod synth;

use crate::error::ParseError;
use crate::models::FileType;

use blocks::BlockKind;
use rows::MeasurementRows;

/// Tolerance on unit quaternion components.
const QUATERNION_SLACK: f64 = 1e-6;

/// Decode and validate the raw content of one file.
pub fn parse(
    file_type: FileType,
    file_name: &str,
    bytes: &[u8],
) -> Result<MeasurementRows, ParseError> {
    let rows = match file_type {
        FileType::Ac1 => MeasurementRows::Spectra(ac::parse_ac(file_name, bytes, BlockKind::Ac1)?),
        FileType::Ac2 => MeasurementRows::Spectra(ac::parse_ac(file_name, bytes, BlockKind::Ac2)?),
        FileType::Fba => MeasurementRows::Mechanism(fba::parse_fba(file_name, bytes)?),
        FileType::Shk => MeasurementRows::Housekeeping(shk::parse_shk(file_name, bytes)?),
        FileType::Att => MeasurementRows::Attitude(attitude::parse_attitude(bytes)?),
    };
    validate(&rows)?;
    Ok(rows)
}

/// Plausibility checks on decoded rows.
pub fn validate(rows: &MeasurementRows) -> Result<(), ParseError> {
    match rows {
        MeasurementRows::Spectra(spectra) => {
            for s in spectra {
                if !(s.inttime.is_finite() && s.inttime > 0.0) {
                    return Err(ParseError::Implausible(format!(
                        "integration time {} at stw {}",
                        s.inttime, s.stw
                    )));
                }
                if s.cc.iter().chain(&s.acd_mon).any(|v| !v.is_finite()) {
                    return Err(ParseError::Implausible(format!(
                        "non-finite correlator value at stw {}",
                        s.stw
                    )));
                }
            }
        }
        MeasurementRows::Mechanism(_) => {}
        MeasurementRows::Housekeeping(samples) => {
            if let Some(bad) = samples.iter().find(|s| !s.value.is_finite()) {
                return Err(ParseError::Implausible(format!(
                    "non-finite {} at stw {}",
                    bad.shk_type, bad.stw
                )));
            }
        }
        MeasurementRows::Attitude(records) => {
            for r in records {
                if r.timestamp().is_none() {
                    return Err(ParseError::Implausible(format!(
                        "invalid date/time {:04}-{:02}-{:02} {:02}:{:02}:{} at stw {}",
                        r.year, r.mon, r.day, r.hour, r.min, r.secs, r.stw
                    )));
                }
                let components = r.qt.iter().chain(&r.qa);
                if components
                    .clone()
                    .any(|q| !q.is_finite() || q.abs() > 1.0 + QUATERNION_SLACK)
                {
                    return Err(ParseError::Implausible(format!(
                        "quaternion component out of range at stw {}",
                        r.stw
                    )));
                }
            }
        }
    }
    Ok(())
}
