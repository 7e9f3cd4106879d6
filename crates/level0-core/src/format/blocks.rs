//! Fixed-size block reader for binary Level 0 files.
//!
//! A file is a sequence of little-endian 16-bit words grouped into blocks
//! whose size depends on the instrument:
//!
//! ```text
//!  word 0   word 1    word 2    word 3   word 4 ..           .. len-tail   .. len-1
//! ┌──────┬─────────┬─────────┬────────┬──────────────────────┬───────────┬─────┐
//! │ sync │ stw low │ stw high│  user  │       payload        │   index   │ ... │
//! └──────┴─────────┴─────────┴────────┴──────────────────────┴───────────┴─────┘
//! ```
//!
//! The user word of the first block determines the block geometry for the
//! whole file.

use crate::error::ParseError;

/// Sync word marking the head block of a record.
pub const SYNC: u16 = 0x2bd3;

/// Block size unit in words.
const UNIT: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockKind {
    Shk,
    Fba,
    Aos,
    Ac1,
    Ac2,
}

impl BlockKind {
    /// Identify the block geometry from a user word.
    pub fn from_user(user: u16) -> Option<Self> {
        match user {
            0x732c => Some(BlockKind::Shk),
            0x73ec => Some(BlockKind::Fba),
            u if u & 0xfff0 == 0x7360 => Some(BlockKind::Aos),
            u if u & 0xfff0 == 0x7380 => Some(BlockKind::Ac1),
            u if u & 0xfff0 == 0x73b0 => Some(BlockKind::Ac2),
            _ => None,
        }
    }

    /// Block length in 16-bit words.
    pub fn block_words(self) -> usize {
        match self {
            BlockKind::Shk => 5 * UNIT,
            BlockKind::Fba => UNIT,
            BlockKind::Aos => 8 * UNIT,
            BlockKind::Ac1 | BlockKind::Ac2 => 5 * UNIT,
        }
    }

    /// Number of trailing words after the payload.
    pub fn tail_words(self) -> usize {
        match self {
            BlockKind::Ac1 | BlockKind::Ac2 => 7,
            BlockKind::Shk | BlockKind::Fba | BlockKind::Aos => 4,
        }
    }

    /// User word carried by the head block of a record.
    pub fn head_user(self) -> u16 {
        match self {
            BlockKind::Shk => 0x732c,
            BlockKind::Fba => 0x73ec,
            BlockKind::Aos => 0x7360,
            BlockKind::Ac1 => 0x7380,
            BlockKind::Ac2 => 0x73b0,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            BlockKind::Shk => "SHK",
            BlockKind::Fba => "FBA",
            BlockKind::Aos => "AOS",
            BlockKind::Ac1 => "AC1",
            BlockKind::Ac2 => "AC2",
        }
    }
}

/// Spectrum acquisition discipline, read from a block's index word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discipline {
    Aero,
    Astr,
}

/// One block borrowed from a decoded file.
#[derive(Debug, Clone, Copy)]
pub struct Block<'a> {
    words: &'a [u16],
    tail: usize,
}

impl<'a> Block<'a> {
    pub fn sync(&self) -> u16 {
        self.words[0]
    }

    /// The raw 32-bit satellite time word.
    pub fn stw(&self) -> u32 {
        (self.words[2] as u32) << 16 | self.words[1] as u32
    }

    pub fn user(&self) -> u16 {
        self.words[3]
    }

    /// Words between the four header words and the tail.
    pub fn payload(&self) -> &'a [u16] {
        &self.words[4..self.words.len() - self.tail]
    }

    pub fn index_word(&self) -> u16 {
        self.words[self.words.len() - self.tail]
    }

    /// `None` when the index word's valid bit is clear.
    pub fn discipline(&self) -> Option<Discipline> {
        let index = self.index_word();
        if index & 0x8000 == 0 {
            None
        } else if index & 0x4000 != 0 {
            Some(Discipline::Astr)
        } else {
            Some(Discipline::Aero)
        }
    }

    pub fn is_head(&self, head_user: u16) -> bool {
        self.sync() == SYNC && self.user() == head_user
    }
}

/// A binary Level 0 file split into words.
#[derive(Debug, Clone)]
pub struct Level0File {
    kind: BlockKind,
    words: Vec<u16>,
}

impl Level0File {
    /// Decode raw bytes and check that they form whole blocks of a known kind.
    ///
    /// # Errors
    ///
    /// [`ParseError::Empty`] for a file shorter than one header,
    /// [`ParseError::UnknownBlockType`] when the first user word is not a
    /// Level 0 type, and [`ParseError::Truncated`] when the length is not a
    /// whole number of blocks.
    pub fn parse(bytes: &[u8]) -> Result<Self, ParseError> {
        if bytes.len() < 8 {
            return Err(ParseError::Empty);
        }
        if bytes.len() % 2 != 0 {
            return Err(ParseError::Truncated {
                len: bytes.len(),
                block_bytes: 2,
            });
        }
        let words: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();

        let kind = BlockKind::from_user(words[3]).ok_or(ParseError::UnknownBlockType(words[3]))?;
        if words.len() % kind.block_words() != 0 {
            return Err(ParseError::Truncated {
                len: bytes.len(),
                block_bytes: kind.block_words() * 2,
            });
        }
        Ok(Self { kind, words })
    }

    /// Like [`Level0File::parse`], but also requires a specific kind.
    pub fn parse_as(bytes: &[u8], expected: BlockKind) -> Result<Self, ParseError> {
        let file = Self::parse(bytes)?;
        if file.kind != expected {
            return Err(ParseError::WrongBlockType {
                expected: expected.name(),
                found: file.kind.name(),
            });
        }
        Ok(file)
    }

    pub fn kind(&self) -> BlockKind {
        self.kind
    }

    pub fn block_count(&self) -> usize {
        self.words.len() / self.kind.block_words()
    }

    pub fn blocks(&self) -> impl Iterator<Item = Block<'_>> + '_ {
        let tail = self.kind.tail_words();
        self.words
            .chunks_exact(self.kind.block_words())
            .map(move |words| Block { words, tail })
    }
}

/// High bits of the satellite time word, encoded in the file name.
///
/// Level 0 file names are the hex time word of the first record shifted
/// right by four bits; the top nibble of the 36-bit counter is recovered
/// from it as `(name_hex << 4) & 0xF_0000_0000`.
pub fn stw_high_bits(file_name: &str) -> Result<u64, ParseError> {
    let name = file_name.rsplit('/').next().unwrap_or(file_name);
    let stem = name.split('.').next().unwrap_or(name);
    let value = u64::from_str_radix(stem, 16)
        .map_err(|_| ParseError::InvalidFileName(name.to_string()))?;
    Ok((value << 4) & 0xF_0000_0000)
}
