//! Attitude files (`.att`).
//!
//! Attitude files are text. The first line ends with the SODA processing
//! version. The header runs to an `EOF` line, followed by five more lines
//! before the records start. Each record is a whitespace-separated line:
//!
//! ```text
//! YYYYMMDD hh mm ss.sss stw orbit qt0..qt3 qa0..qa3 qe0..qe2 gps0..gps5 [.. mode .. acs]
//! ```
//!
//! Records stop at the first line with fewer than 23 columns. When two
//! records share a time word, or lie within 16 ticks of each other, the one
//! with the smaller error vector is kept.

use std::collections::BTreeMap;

use crate::error::ParseError;
use crate::format::rows::AttitudeRecord;

const MIN_COLUMNS: usize = 23;
const EXTENDED_COLUMNS: usize = 37;
const FINE_POINTING: i64 = 5;
const NEIGHBOUR_TICKS: u64 = 17;
const HEADER_SKIP: usize = 5;

/// Time words outside this range are ignored.
const STW_RANGE: std::ops::RangeInclusive<u64> = 0..=0x8_0000_0000;

pub fn parse_attitude(bytes: &[u8]) -> Result<Vec<AttitudeRecord>, ParseError> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| ParseError::Attitude(format!("not UTF-8 text: {}", e)))?;
    let mut lines = text.lines().enumerate();

    let soda = lines
        .next()
        .and_then(|(_, first)| first.split_whitespace().last())
        .and_then(|token| token.parse::<f64>().ok())
        .ok_or_else(|| ParseError::Attitude("missing SODA version on first line".into()))?
        as i32;

    if !lines.any(|(_, line)| line.trim_end() == "EOF") {
        return Err(ParseError::Attitude("missing EOF header marker".into()));
    }
    for _ in 0..HEADER_SKIP {
        lines.next();
    }

    let mut table: BTreeMap<u64, AttitudeRecord> = BTreeMap::new();
    for (index, line) in lines {
        let cols: Vec<&str> = line.split_whitespace().collect();
        if cols.len() < MIN_COLUMNS {
            break;
        }
        let record = parse_record(&cols, soda).map_err(|reason| ParseError::AttitudeRecord {
            line: index + 1,
            reason,
        })?;
        if !STW_RANGE.contains(&record.stw) {
            continue;
        }
        match table.get(&record.stw) {
            Some(existing)
                if existing.qe == record.qe || existing.error_norm() <= record.error_norm() => {}
            _ => {
                table.insert(record.stw, record);
            }
        }
    }

    Ok(drop_close_neighbours(table))
}

fn parse_record(cols: &[&str], soda: i32) -> Result<AttitudeRecord, String> {
    let date = cols[0];
    if date.len() != 8 || !date.bytes().all(|b| b.is_ascii_digit()) {
        return Err(format!("bad date '{}'", date));
    }
    let int = |s: &str| s.parse::<i64>().map_err(|_| format!("bad integer '{}'", s));
    let float = |s: &str| s.parse::<f64>().map_err(|_| format!("bad number '{}'", s));

    let floats = |range: std::ops::Range<usize>| -> Result<Vec<f64>, String> {
        cols[range].iter().map(|s| float(*s)).collect()
    };
    let qt = floats(6..10)?;
    let qa = floats(10..14)?;
    let qe = floats(14..17)?;
    let gps = floats(17..23)?;

    let acs = if cols.len() == EXTENDED_COLUMNS && int(cols[34])? == FINE_POINTING {
        float(cols[36])?
    } else {
        0.0
    };

    let stw = int(cols[4])?;
    if stw < 0 {
        return Err(format!("negative time word {}", stw));
    }

    Ok(AttitudeRecord {
        stw: stw as u64,
        soda,
        year: int(&date[0..4])? as i32,
        mon: int(&date[4..6])? as u32,
        day: int(&date[6..8])? as u32,
        hour: int(cols[1])? as u32,
        min: int(cols[2])? as u32,
        secs: float(cols[3])?,
        orbit: float(cols[5])?,
        qt: [qt[0], qt[1], qt[2], qt[3]],
        qa: [qa[0], qa[1], qa[2], qa[3]],
        qe: [qe[0], qe[1], qe[2]],
        gps: [gps[0], gps[1], gps[2], gps[3], gps[4], gps[5]],
        acs,
    })
}

/// Thin out records closer than [`NEIGHBOUR_TICKS`] to the current anchor,
/// keeping the smaller error of each close pair. Records with an identical
/// error vector are kept without moving the anchor.
fn drop_close_neighbours(table: BTreeMap<u64, AttitudeRecord>) -> Vec<AttitudeRecord> {
    let mut kept: Vec<AttitudeRecord> = Vec::with_capacity(table.len());
    let mut anchor: Option<usize> = None;
    for record in table.into_values() {
        let Some(a) = anchor else {
            kept.push(record);
            anchor = Some(kept.len() - 1);
            continue;
        };
        let previous = &kept[a];
        if record.stw - previous.stw >= NEIGHBOUR_TICKS {
            kept.push(record);
            anchor = Some(kept.len() - 1);
        } else if previous.qe == record.qe {
            kept.push(record);
        } else if record.error_norm() < previous.error_norm() {
            kept.remove(a);
            kept.push(record);
            anchor = Some(kept.len() - 1);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::synth;

    #[test]
    fn test_parse_synthetic_attitude() {
        let text = synth::attitude_file(1000, 5);
        let rows = parse_attitude(text.as_bytes()).unwrap();
        assert_eq!(rows.len(), 5);
        assert_eq!(rows[0].soda, 7);
        assert_eq!(rows[0].stw, 1000);
        assert_eq!(rows[0].year, 2024);
        assert!(rows[0].timestamp().is_some());
        assert_eq!(rows[0].acs, 0.0);
    }

    #[test]
    fn test_duplicate_stw_keeps_smaller_error() {
        let mut text = synth::attitude_header(7);
        text.push_str(&synth::attitude_line(500, [0.3, 0.0, 0.0], None));
        text.push_str(&synth::attitude_line(500, [0.1, 0.0, 0.0], None));
        text.push_str(&synth::attitude_line(500, [0.2, 0.0, 0.0], None));
        let rows = parse_attitude(text.as_bytes()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].qe[0], 0.1);
    }

    #[test]
    fn test_close_neighbours_are_thinned() {
        let mut text = synth::attitude_header(7);
        text.push_str(&synth::attitude_line(100, [0.3, 0.0, 0.0], None));
        text.push_str(&synth::attitude_line(110, [0.1, 0.0, 0.0], None));
        text.push_str(&synth::attitude_line(200, [0.5, 0.0, 0.0], None));
        let rows = parse_attitude(text.as_bytes()).unwrap();
        let stws: Vec<_> = rows.iter().map(|r| r.stw).collect();
        assert_eq!(stws, vec![110, 200]);
    }

    #[test]
    fn test_fine_pointing_acs_column() {
        let mut text = synth::attitude_header(7);
        text.push_str(&synth::attitude_line(100, [0.0, 0.0, 0.0], Some(0.25)));
        let rows = parse_attitude(text.as_bytes()).unwrap();
        assert_eq!(rows[0].acs, 0.25);
    }

    #[test]
    fn test_short_line_ends_records() {
        let mut text = synth::attitude_header(7);
        text.push_str(&synth::attitude_line(100, [0.0, 0.0, 0.0], None));
        text.push_str("trailer line\n");
        text.push_str(&synth::attitude_line(900, [0.0, 0.0, 0.0], None));
        let rows = parse_attitude(text.as_bytes()).unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn test_missing_header_marker() {
        let err = parse_attitude(b"SODA 7\nno marker here\n").unwrap_err();
        assert!(matches!(err, ParseError::Attitude(_)));
    }

    #[test]
    fn test_bad_number_reports_line() {
        let mut text = synth::attitude_header(7);
        text.push_str(&synth::attitude_line(100, [0.0, 0.0, 0.0], None).replace("100", "x1"));
        match parse_attitude(text.as_bytes()).unwrap_err() {
            ParseError::AttitudeRecord { line, .. } => assert_eq!(line, 8),
            other => panic!("unexpected {:?}", other),
        }
    }
}
