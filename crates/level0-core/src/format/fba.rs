//! Filter-bank mechanism files (`.fba`).
//!
//! Every head block records the chopper mirror position; bits 13..15 of
//! the mirror word select the phase.

use crate::error::ParseError;
use crate::format::blocks::{stw_high_bits, BlockKind, Level0File};
use crate::format::rows::{keep_last_by, FbaRecord};

const PHASES: [&str; 4] = ["REF", "SK1", "CAL", "SK2"];

pub fn parse_fba(file_name: &str, bytes: &[u8]) -> Result<Vec<FbaRecord>, ParseError> {
    let high = stw_high_bits(file_name)?;
    let file = Level0File::parse_as(bytes, BlockKind::Fba)?;
    let head_user = BlockKind::Fba.head_user();

    let records: Vec<FbaRecord> = file
        .blocks()
        .filter(|b| b.is_head(head_user))
        .map(|b| FbaRecord {
            stw: b.stw() as u64 + high,
            mech_type: mechanism_phase(b.payload()).to_string(),
        })
        .collect();
    Ok(keep_last_by(records, |r| r.stw))
}

/// Phase from the first valid mirror word (payload word 5, else 6).
pub fn mechanism_phase(payload: &[u16]) -> &'static str {
    let mirror = [payload[5], payload[6]]
        .into_iter()
        .find(|&w| w != 0xffff)
        .unwrap_or(0);
    PHASES[(mirror >> 13 & 3) as usize]
}
