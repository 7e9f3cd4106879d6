//! Synthetic Level 0 files for tests.
//!
//! The generated files are structurally valid and decode to predictable
//! values, which keeps parser and pipeline tests independent of real
//! instrument downlinks.

use crate::format::blocks::{BlockKind, SYNC};

/// Time word step between consecutive synthetic spectra.
pub const SPECTRUM_STEP: u32 = 0x20;

/// Time word step between consecutive attitude records.
pub const ATTITUDE_STEP: u64 = 20;

fn to_bytes(words: &[u16]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

fn block(kind: BlockKind, user: u16, stw: u32) -> Vec<u16> {
    let mut words = vec![0u16; kind.block_words()];
    words[0] = SYNC;
    words[1] = (stw & 0xffff) as u16;
    words[2] = (stw >> 16) as u16;
    words[3] = user;
    words
}

/// Parameters of one synthetic autocorrelator spectrum.
#[derive(Debug, Clone)]
pub struct SpectrumSpec {
    pub kind: BlockKind,
    pub stw: u32,
    /// Index word of the first data block (`0x8000` = AERO).
    pub index: u16,
    /// Input channel (2 selects the 495 GHz receiver).
    pub input: u16,
    pub prescaler: u16,
    pub chop: u16,
    pub samples: u16,
}

impl SpectrumSpec {
    pub fn new(kind: BlockKind, stw: u32) -> Self {
        Self {
            kind,
            stw,
            index: 0x8000,
            input: 2,
            prescaler: 4,
            chop: 0xaaaa,
            samples: 1000,
        }
    }
}

/// One head block followed by twelve data blocks.
pub fn ac_spectrum(spec: &SpectrumSpec) -> Vec<u8> {
    let kind = spec.kind;
    let head_user = kind.head_user();
    let tail_at = kind.block_words() - kind.tail_words();

    let mut head = block(kind, head_user, spec.stw);
    {
        let p = &mut head[4..tail_at];
        p[8] = spec.chop;
        p[12] = spec.samples;
        for w in &mut p[16..32] {
            *w = 50;
        }
        p[35] = 0;
        p[36] = spec.input << 8;
        for (i, w) in p[37..41].iter_mut().enumerate() {
            *w = 10 + i as u16;
        }
        for i in 0..4 {
            p[44 - i] = 3900 + i as u16;
        }
        p[49] = spec.prescaler;
        for w in &mut p[50..58] {
            *w = 100;
        }
    }
    head[tail_at] = spec.index;

    let mut words = head;
    for n in 0..crate::format::ac::DATA_BLOCKS {
        let mut data = block(kind, head_user | 1, spec.stw + 1 + n as u32);
        for (j, w) in data[4..tail_at].iter_mut().enumerate() {
            *w = ((j % 40) as u16) << 4;
        }
        data[tail_at] = spec.index;
        words.extend(data);
    }
    to_bytes(&words)
}

/// `count` default spectra starting at `first_stw`.
pub fn ac_file(kind: BlockKind, first_stw: u32, count: usize) -> Vec<u8> {
    (0..count)
        .flat_map(|i| ac_spectrum(&SpectrumSpec::new(kind, first_stw + i as u32 * SPECTRUM_STEP)))
        .collect()
}

/// Mechanism blocks cycling through the four phases.
pub fn fba_file(first_stw: u32, count: usize) -> Vec<u8> {
    let kind = BlockKind::Fba;
    let mut words = Vec::with_capacity(count * kind.block_words());
    for i in 0..count {
        let mut b = block(kind, kind.head_user(), first_stw + i as u32);
        b[4 + 5] = ((i % 4) as u16) << 13;
        words.extend(b);
    }
    to_bytes(&words)
}

/// Housekeeping blocks with multiplexed sub-channels.
pub fn shk_file(first_stw: u32, count: usize) -> Vec<u8> {
    let kind = BlockKind::Shk;
    let mux = |v: u16, sub: usize| (v << 4) | sub as u16;
    let mut words = Vec::with_capacity(count * kind.block_words());
    for i in 0..count {
        let mut b = block(kind, kind.head_user(), first_stw + i as u32);
        let p = &mut b[4..];
        p[19] = mux(1000, i % 2);
        p[27] = mux(1000, i % 2);
        p[20] = mux(2000, i % 6);
        p[28] = mux(2000, i % 6);
        p[21] = mux(100, i % 4);
        p[29] = mux(100, i % 4);
        p[35] = mux(1200, i % 4);
        p[36] = mux(1200, i % 4);
        words.extend(b);
    }
    to_bytes(&words)
}

/// Attitude header: SODA version line, `EOF` marker and five filler lines.
pub fn attitude_header(soda: i32) -> String {
    let mut text = format!("ATTITUDE RECONSTRUCTION SODA {}\nEOF\n", soda);
    for n in 1..=5 {
        text.push_str(&format!("# header {}\n", n));
    }
    text
}

/// One attitude record; `acs` adds the fine-pointing columns.
pub fn attitude_line(stw: u64, qe: [f64; 3], acs: Option<f64>) -> String {
    let mut line = format!(
        "20240101 12 30 15.250 {} 1234.25 0.5 0.5 0.5 0.5 0.5 0.5 0.5 0.5 {} {} {} 7000.0 -1.0 2.0 3.0 4.0 -6.0",
        stw, qe[0], qe[1], qe[2]
    );
    if let Some(acs) = acs {
        for _ in 23..34 {
            line.push_str(" 0");
        }
        line.push_str(&format!(" 5 0 {}", acs));
    }
    line.push('\n');
    line
}

/// A complete attitude file with evenly spaced records.
pub fn attitude_file(first_stw: u64, count: usize) -> String {
    let mut text = attitude_header(7);
    for i in 0..count {
        text.push_str(&attitude_line(
            first_stw + i as u64 * ATTITUDE_STEP,
            [0.0, 0.0, 0.0],
            None,
        ));
    }
    text
}
