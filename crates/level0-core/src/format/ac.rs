//! Autocorrelator spectra (`.ac1`, `.ac2`).
//!
//! A spectrum is a head block (sync word and the backend's head user word)
//! followed by 12 data blocks. The data blocks hold 768 signed correlator
//! values forming an 8 × 96 matrix, one row per correlator chip. The
//! index word of the first data block carries the acquisition discipline.
//!
//! Head payload layout (word offsets):
//!
//! | Offset | Content |
//! |--------|---------|
//! | 8      | chopper word (`0xAAAA` = chopper in) |
//! | 12     | sample count |
//! | 16..32 | monitor values, 8 × 2 |
//! | 35     | mode in the high byte |
//! | 36     | input channel in bits 8..12 |
//! | 37..41 | SSB attenuation |
//! | 41..45 | SSB frequency (reversed) |
//! | 49     | prescaler |
//! | 50..58 | zero lags |

use crate::error::ParseError;
use crate::format::blocks::{stw_high_bits, Block, BlockKind, Discipline, Level0File};
use crate::format::rows::{keep_last_by, AcRecord};

/// Correlator clock in Hz.
pub const CLOCK_FREQ: f64 = 224.0e6;

/// Data blocks per spectrum.
pub const DATA_BLOCKS: usize = 12;

const CHIPS: usize = 8;
const LAGS: usize = 96;

const FRONTENDS: [&str; 6] = ["549", "495", "572", "555", "SPL", "119"];

/// Sideband sign of each chip pair.
const SSB_SIGN: [i32; 8] = [1, -1, 1, -1, -1, 1, -1, 1];

/// Decode every usable spectrum in an AC file.
///
/// Only spectra taken in the AERO discipline, with a valid input channel
/// and a prescaler in range are returned. A spectrum cut off by the end of
/// the file is skipped; a file whose only spectra are cut off is
/// malformed. Spectra repeating a time word keep the last occurrence.
pub fn parse_ac(
    file_name: &str,
    bytes: &[u8],
    backend: BlockKind,
) -> Result<Vec<AcRecord>, ParseError> {
    let high = stw_high_bits(file_name)?;
    let file = Level0File::parse_as(bytes, backend)?;
    let head_user = backend.head_user();
    let blocks: Vec<Block<'_>> = file.blocks().collect();

    let mut records = Vec::new();
    let mut complete = 0usize;
    let mut cut_off = None;
    let mut i = 0;
    while i < blocks.len() {
        let head = blocks[i];
        if !head.is_head(head_user) {
            i += 1;
            continue;
        }
        let stw = head.stw() as u64 + high;
        let rest = &blocks[i + 1..];
        if rest.len() < DATA_BLOCKS {
            cut_off = Some(ParseError::IncompleteSpectrum {
                stw,
                blocks: rest.len(),
            });
            break;
        }
        let data = &rest[..DATA_BLOCKS];
        i += 1 + DATA_BLOCKS;
        complete += 1;

        if data[0].discipline() != Some(Discipline::Aero) {
            continue;
        }
        if let Some(record) = decode_spectrum(stw, head.payload(), data, backend) {
            records.push(record);
        }
    }

    if complete == 0 {
        if let Some(err) = cut_off {
            return Err(err);
        }
    }
    Ok(keep_last_by(records, |r| r.stw))
}

fn decode_spectrum(
    stw: u64,
    head: &[u16],
    data: &[Block<'_>],
    backend: BlockKind,
) -> Option<AcRecord> {
    let frontend = frontend(head)?;
    let inttime = integration_time(head);
    if inttime == 0.0 {
        return None;
    }

    let mut cc: Vec<i64> = data
        .iter()
        .flat_map(|b| b.payload().iter().map(|&w| w as i16 as i64))
        .collect();

    let zlags: Vec<i64> = (0..CHIPS)
        .map(|r| ((head[50 + r] as i64) << 4) + (cc[r * LAGS] & 0xf))
        .collect();

    let mode = mode(head);
    for chip in band_starts(mode) {
        if chip >= CHIPS {
            continue;
        }
        cc[chip * LAGS] = zlags[chip];
        if cc[chip * LAGS + 2] > 0 {
            cc[chip * LAGS + 2] -= 65536;
        }
    }

    let half_clock = CLOCK_FREQ / 2.0;
    let cc: Vec<f64> = cc
        .iter()
        .map(|&v| v as f64 * 2048.0 / inttime / half_clock)
        .collect();

    let mut acd_mon = Vec::with_capacity(CHIPS * 2);
    for (r, &zlag) in zlags.iter().enumerate() {
        for c in 0..2 {
            let mut mon = (zlag & 0xf0000) + head[16 + 2 * r + c] as i64;
            if (mon - zlag).abs() > 0x8000 {
                if mon > zlag {
                    mon -= 0x10000;
                } else {
                    mon += 0x10000;
                }
            }
            acd_mon.push(mon as f64 * 1024.0 / inttime / half_clock);
        }
    }

    Some(AcRecord {
        stw,
        backend: backend.name().to_string(),
        frontend: frontend.to_string(),
        sig_type: sig_type(frontend, head[8], backend).to_string(),
        ssb_att: [head[37], head[38], head[39], head[40]],
        ssb_fq: [head[44], head[43], head[42], head[41]],
        prescaler: head[49],
        inttime,
        mode,
        acd_mon,
        cc,
    })
}

/// Receiver selected by the input channel, if valid.
pub fn frontend(head: &[u16]) -> Option<&'static str> {
    let input = (head[36] >> 8 & 0x000f) as usize;
    if (1..=6).contains(&input) {
        Some(FRONTENDS[input - 1])
    } else {
        None
    }
}

/// Signal or reference phase from the chopper word and receiver.
pub fn sig_type(frontend: &str, chop: u16, backend: BlockKind) -> &'static str {
    let chopper_in = chop == 0xaaaa;
    let split_is_ref = backend == BlockKind::Ac1;
    let reference = match frontend {
        "495" | "549" => chopper_in,
        "555" | "572" | "119" => !chopper_in,
        "SPL" => chopper_in == split_is_ref,
        _ => return "NAN",
    };
    if reference {
        "REF"
    } else {
        "SIG"
    }
}

/// Integration time in seconds; zero when the prescaler is out of range.
pub fn integration_time(head: &[u16]) -> f64 {
    let prescaler = head[49];
    if (2..=6).contains(&prescaler) {
        let samples = (head[12] as u64) << (14 - prescaler);
        samples as f64 / 10.0e6
    } else {
        0.0
    }
}

pub fn mode(head: &[u16]) -> u16 {
    head[35] >> 8 & 0x00ff
}

/// Chips that start a band for the given correlator mode.
///
/// The mode's bits say which chips start a new cascade; each band spans
/// the chips up to the next start.
pub fn band_starts(mode: u16) -> Vec<usize> {
    let mut seq = [0i32; 16];
    let mut bits = ((mode as u32) << 1) | 1;
    let mut m = 0;
    for i in 0..8 {
        if bits & 1 != 0 {
            m = i;
        }
        seq[2 * m] += 1;
        bits >>= 1;
    }
    for i in 0..8 {
        seq[2 * i + 1] = match (seq[2 * i], SSB_SIGN[i] < 0) {
            (0, _) => 0,
            (_, true) => -1,
            (_, false) => 1,
        };
    }

    let mut starts = Vec::new();
    let mut band = 0i32;
    for (ind, &count) in seq.iter().enumerate() {
        if ind as i32 == band {
            starts.push(ind / 2);
            band = ind as i32 + 2 * count;
        }
    }
    starts
}
