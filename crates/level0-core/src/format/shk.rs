//! Science housekeeping files (`.shk`).
//!
//! Housekeeping words are multiplexed: the low nibble of a word names the
//! sub-channel and the upper twelve bits carry the value. Three products
//! are extracted per file:
//!
//! - local oscillator frequencies, reconstructed from HRO/PRO word pairs
//!   on the A side (495, 549 GHz) and B side (572, 555 GHz);
//! - single-sideband tunings for all four receivers;
//! - sixteen calibrated temperature and current channels.

use crate::error::ParseError;
use crate::format::blocks::{stw_high_bits, BlockKind, Level0File};
use crate::format::rows::{keep_last_by, ShkRecord};

/// Payload word offsets.
const LO_A: usize = 21;
const LO_B: usize = 29;
const SSB_A: (usize, usize) = (35, 36);
const SSB_B: (usize, usize) = (41, 42);

struct Channel {
    label: &'static str,
    word: usize,
    sub: u16,
    convert: fn(f64) -> f64,
}

fn mixer_current(x: f64) -> f64 {
    5.0 * x / 4095.0 / 1.22
}

fn load_voltage(x: f64) -> f64 {
    20.0 * (5.0 * x / 4095.0 - 1.16)
}

fn hot_load(x: f64) -> f64 {
    load_voltage(x) + 273.15
}

fn sensor_temperature(x: f64) -> f64 {
    70.0 * (5.0 * x / 4095.0 - 3.86) + 273.15
}

const CHANNELS: [Channel; 16] = [
    Channel { label: "mixC495", word: 19, sub: 0, convert: mixer_current },
    Channel { label: "mixC549", word: 19, sub: 1, convert: mixer_current },
    Channel { label: "mixC555", word: 27, sub: 1, convert: mixer_current },
    Channel { label: "mixC572", word: 27, sub: 0, convert: mixer_current },
    Channel { label: "imageloadB", word: 28, sub: 2, convert: load_voltage },
    Channel { label: "imageloadA", word: 20, sub: 2, convert: load_voltage },
    Channel { label: "hotloadA", word: 20, sub: 1, convert: hot_load },
    Channel { label: "hotloadB", word: 28, sub: 1, convert: hot_load },
    Channel { label: "mixerA", word: 20, sub: 3, convert: sensor_temperature },
    Channel { label: "mixerB", word: 28, sub: 3, convert: sensor_temperature },
    Channel { label: "lnaA", word: 20, sub: 4, convert: sensor_temperature },
    Channel { label: "lnaB", word: 28, sub: 4, convert: sensor_temperature },
    Channel { label: "119mixerA", word: 20, sub: 5, convert: sensor_temperature },
    Channel { label: "119mixerB", word: 28, sub: 5, convert: sensor_temperature },
    Channel { label: "warmifA", word: 20, sub: 0, convert: load_voltage },
    Channel { label: "warmifB", word: 28, sub: 0, convert: load_voltage },
];

fn sub(word: u16) -> u16 {
    word & 0x000f
}

fn value(word: u16) -> u16 {
    word >> 4
}

/// Local oscillator frequency in Hz from an HRO/PRO pair.
pub fn lo_frequency(hro: u16, pro: u16, multiplier: f64) -> f64 {
    ((4000.0 + hro as f64) * multiplier + pro as f64 / 32.0 + 100.0) * 6.0e6
}

pub fn parse_shk(file_name: &str, bytes: &[u8]) -> Result<Vec<ShkRecord>, ParseError> {
    let high = stw_high_bits(file_name)?;
    let file = Level0File::parse_as(bytes, BlockKind::Shk)?;

    let mut stws = Vec::with_capacity(file.block_count());
    let mut payloads = Vec::with_capacity(file.block_count());
    for block in file.blocks() {
        stws.push(block.stw() as u64 + high);
        payloads.push(block.payload());
    }

    let mut rows = Vec::new();
    lo_frequencies(&stws, &payloads, &mut rows);
    ssb_tunings(&stws, &payloads, &mut rows);
    for channel in &CHANNELS {
        for (stw, payload) in stws.iter().zip(&payloads) {
            let word = payload[channel.word];
            if sub(word) == channel.sub {
                rows.push(ShkRecord {
                    stw: *stw,
                    shk_type: channel.label.to_string(),
                    value: (channel.convert)(value(word) as f64),
                });
            }
        }
    }

    Ok(keep_last_by(rows, |r| (r.stw, r.shk_type.clone())))
}

fn lo_frequencies(stws: &[u64], payloads: &[&[u16]], rows: &mut Vec<ShkRecord>) {
    let aside: Vec<u16> = payloads.iter().map(|p| p[LO_A]).collect();
    let bside: Vec<u16> = payloads.iter().map(|p| p[LO_B]).collect();

    let pair = |words: &[u16], i: usize, subs: (u16, u16), m: f64| -> f64 {
        if sub(words[i]) == subs.0 && sub(words[i + 1]) == subs.1 {
            lo_frequency(value(words[i]), value(words[i + 1]), m)
        } else {
            0.0
        }
    };

    let mut a_rows = Vec::new();
    let mut b_rows = Vec::new();
    for i in 0..stws.len().saturating_sub(3) {
        if sub(aside[i]) == 0 {
            a_rows.push((stws[i], "LO495", pair(&aside, i, (0, 1), 17.0)));
            a_rows.push((stws[i], "LO549", pair(&aside, i + 2, (2, 3), 19.0)));
        }
        if sub(bside[i]) == 0 {
            b_rows.push((stws[i], "LO572", pair(&bside, i, (0, 1), 20.0)));
            b_rows.push((stws[i], "LO555", pair(&bside, i + 2, (2, 3), 19.0)));
        }
    }

    for label in ["LO495", "LO549"] {
        push_labelled(rows, &a_rows, label);
    }
    for label in ["LO555", "LO572"] {
        push_labelled(rows, &b_rows, label);
    }
}

fn ssb_tunings(stws: &[u64], payloads: &[&[u16]], rows: &mut Vec<ShkRecord>) {
    let mut aside = Vec::with_capacity(payloads.len());
    let mut bside = Vec::with_capacity(payloads.len());
    let mut a_side_active = Vec::with_capacity(payloads.len());
    for p in payloads {
        if p[SSB_A.0] != 0xffff && p[SSB_A.1] != 0xffff {
            aside.push(p[SSB_A.0]);
            bside.push(p[SSB_A.1]);
            a_side_active.push(true);
        } else {
            aside.push(p[SSB_B.0]);
            bside.push(p[SSB_B.1]);
            a_side_active.push(false);
        }
    }

    let mut tunings = Vec::new();
    let mut i = 0;
    while i + 2 < stws.len() {
        if sub(aside[i]) == 0
            && sub(bside[i]) == 0
            && sub(aside[i + 2]) == 2
            && sub(bside[i + 2]) == 2
        {
            let (ssb495, ssb572, ssb549, ssb555) = if a_side_active[i] {
                (aside[i], aside[i + 2], bside[i], bside[i + 2])
            } else {
                (aside[i + 2], aside[i], bside[i + 2], bside[i])
            };
            tunings.push((stws[i], "SSB495", value(ssb495) as f64));
            tunings.push((stws[i], "SSB549", value(ssb549) as f64));
            tunings.push((stws[i], "SSB555", value(ssb555) as f64));
            tunings.push((stws[i], "SSB572", value(ssb572) as f64));
            i += 2;
        } else {
            i += 1;
        }
    }

    for label in ["SSB495", "SSB549", "SSB555", "SSB572"] {
        push_labelled(rows, &tunings, label);
    }
}

fn push_labelled(rows: &mut Vec<ShkRecord>, samples: &[(u64, &str, f64)], label: &str) {
    rows.extend(
        samples
            .iter()
            .filter(|(_, l, _)| *l == label)
            .map(|(stw, l, v)| ShkRecord {
                stw: *stw,
                shk_type: l.to_string(),
                value: *v,
            }),
    );
}
