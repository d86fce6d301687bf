//! Snapshot container format.
//!
//! A snapshot is self-contained and byte-ordered:
//!
//! ```text
//! "FrodoSnapshot" 0x0A
//! version (0x00)
//! flags (bit 0: 1541 processor state included)
//! VIC | SID | CIA1 | CIA2 chip blocks
//! CPU block: RAM, color RAM, registers
//! delay byte (cycles the CPU ran ahead of the other chips)
//! [ drive path (256) | 1541 block | drive delay | job block ]
//! ```
//!
//! The delay bridges the two scheduling modes: the cycle-accurate save
//! path advances the machine to an instruction boundary and records how
//! far the CPU got ahead; the loader replays those cycles into the other
//! chips. Line-based saves always record zero.

pub const SNAPSHOT_HEADER: &[u8] = b"FrodoSnapshot\n";
pub const SNAPSHOT_VERSION: u8 = 0;
/// Flags bit: 1541 processor-level state follows.
pub const SNAPSHOT_1541: u8 = 0x01;

/// Byte cursor over snapshot data.
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    /// Validate the header and position the cursor on the flags byte's
    /// successor. Returns (reader, flags).
    pub fn new(data: &'a [u8]) -> Result<(Self, u8), String> {
        if data.len() < SNAPSHOT_HEADER.len() + 2 {
            return Err("snapshot too small".into());
        }
        if &data[..SNAPSHOT_HEADER.len()] != SNAPSHOT_HEADER {
            return Err("not a snapshot file".into());
        }
        let version = data[SNAPSHOT_HEADER.len()];
        if version != SNAPSHOT_VERSION {
            return Err(format!("unsupported snapshot version {version}"));
        }
        let flags = data[SNAPSHOT_HEADER.len() + 1];
        Ok((
            Self {
                data,
                pos: SNAPSHOT_HEADER.len() + 2,
            },
            flags,
        ))
    }

    pub fn take(&mut self, len: usize) -> Result<&'a [u8], String> {
        if self.pos + len > self.data.len() {
            return Err("snapshot truncated".into());
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn byte(&mut self) -> Result<u8, String> {
        Ok(self.take(1)?[0])
    }

    /// Current cursor, for the line-mode double VIC load.
    #[must_use]
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn seek(&mut self, pos: usize) {
        self.pos = pos.min(self.data.len());
    }
}

/// Begin a snapshot byte stream.
#[must_use]
pub fn header(flags: u8) -> Vec<u8> {
    let mut out = Vec::with_capacity(0x12000);
    out.extend_from_slice(SNAPSHOT_HEADER);
    out.push(SNAPSHOT_VERSION);
    out.push(flags);
    out
}
