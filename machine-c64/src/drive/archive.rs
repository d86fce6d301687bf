//! Read-only archive drive: .t64 tape archives and LYNX containers.
//!
//! Both formats carry a directory of PRG files; the drive materializes
//! each entry as a full PRG stream (2-byte load address + body) and
//! serves it over read channels. All writes report WRITE PROTECT ON.

use super::{
    directory_listing, parse_filename, AccessMode, DosError, Drive, ErrorChannel, ST_EOF,
    ST_NOTPRESENT, ST_OK, ST_TIMEOUT,
};
use crate::disk::{name_matches, DirEntry};

const T64_SIGNATURES: [&[u8]; 2] = [b"C64 tape image", b"C64S tape file"];
/// LYNX directories count in 254-byte blocks.
const LYNX_BLOCK: usize = 254;

struct Entry {
    name: Vec<u8>,
    data: Vec<u8>,
}

enum Channel {
    Closed,
    Read { data: Vec<u8>, pos: usize },
}

impl Default for Channel {
    fn default() -> Self {
        Channel::Closed
    }
}

pub struct ArchiveDrive {
    name: Vec<u8>,
    entries: Vec<Entry>,
    channels: [Channel; 16],
    error: ErrorChannel,
}

impl ArchiveDrive {
    /// Parse a .t64 or LYNX archive.
    pub fn new(bytes: &[u8]) -> Result<Self, String> {
        let (name, entries) = if T64_SIGNATURES.iter().any(|sig| bytes.starts_with(sig)) {
            parse_t64(bytes)?
        } else if looks_like_lynx(bytes) {
            parse_lynx(bytes)?
        } else {
            return Err("not a T64 or LYNX archive".into());
        };
        Ok(Self {
            name,
            entries,
            channels: Default::default(),
            error: ErrorChannel::new(),
        })
    }

    #[must_use]
    pub fn file_count(&self) -> usize {
        self.entries.len()
    }

    fn find(&self, pattern: &[u8]) -> Option<&Entry> {
        self.entries
            .iter()
            .find(|e| name_matches(pattern, &e.name))
    }
}

impl Drive for ArchiveDrive {
    fn open(&mut self, channel: usize, name: &[u8]) -> u8 {
        if channel == 15 {
            // Only the harmless housekeeping commands make sense here
            match name.first() {
                Some(b'I' | b'V' | b'U') | None => self.error.set(DosError::Ok, 0, 0),
                Some(b'S' | b'N' | b'R') => self.error.set(DosError::WriteProtect, 0, 0),
                _ => self.error.set(DosError::SyntaxError31, 0, 0),
            }
            return ST_OK;
        }
        if channel >= 16 {
            return ST_NOTPRESENT;
        }

        if name.first() == Some(&b'$') {
            let entries: Vec<DirEntry> = self
                .entries
                .iter()
                .map(|e| {
                    let mut padded = [0xA0u8; 16];
                    let n = e.name.len().min(16);
                    padded[..n].copy_from_slice(&e.name[..n]);
                    DirEntry {
                        slot: (0, 0, 0),
                        file_type: 0x02,
                        closed: true,
                        first_track: 0,
                        first_sector: 0,
                        name: padded,
                        blocks: e.data.len().div_ceil(LYNX_BLOCK).min(0xFFFF) as u16,
                    }
                })
                .collect();
            let listing = directory_listing(&self.name, [b'T', b'A'], &entries, 0);
            self.channels[channel] = Channel::Read {
                data: listing,
                pos: 0,
            };
            return ST_OK;
        }

        let (pattern, mode) = parse_filename(name);
        if mode == AccessMode::Write {
            self.error.set(DosError::WriteProtect, 0, 0);
            return ST_TIMEOUT;
        }
        match self.find(pattern) {
            Some(entry) => {
                self.channels[channel] = Channel::Read {
                    data: entry.data.clone(),
                    pos: 0,
                };
                self.error.set(DosError::Ok, 0, 0);
                ST_OK
            }
            None => {
                self.error.set(DosError::FileNotFound, 0, 0);
                ST_TIMEOUT
            }
        }
    }

    fn close(&mut self, channel: usize) -> u8 {
        if channel < 16 {
            self.channels[channel] = Channel::Closed;
        }
        ST_OK
    }

    fn read(&mut self, channel: usize) -> (u8, u8) {
        if channel == 15 {
            return self.error.read();
        }
        if channel >= 16 {
            return (ST_NOTPRESENT, 0);
        }
        match &mut self.channels[channel] {
            Channel::Read { data, pos } => {
                if *pos >= data.len() {
                    return (ST_EOF | ST_TIMEOUT, 0);
                }
                let byte = data[*pos];
                *pos += 1;
                if *pos >= data.len() {
                    (ST_EOF, byte)
                } else {
                    (ST_OK, byte)
                }
            }
            Channel::Closed => (ST_TIMEOUT, 0),
        }
    }

    fn write(&mut self, channel: usize, _byte: u8, _eoi: bool) -> u8 {
        if channel == 15 {
            return ST_OK;
        }
        self.error.set(DosError::WriteProtect, 0, 0);
        ST_TIMEOUT
    }

    fn reset(&mut self) {
        for ch in &mut self.channels {
            *ch = Channel::Closed;
        }
        self.error = ErrorChannel::new();
    }
}

// ---------------------------------------------------------------------
// T64
// ---------------------------------------------------------------------

fn parse_t64(bytes: &[u8]) -> Result<(Vec<u8>, Vec<Entry>), String> {
    if bytes.len() < 64 {
        return Err("T64 header truncated".into());
    }
    let max_entries = u16::from_le_bytes([bytes[34], bytes[35]]) as usize;
    // Plenty of broken archives claim zero used entries
    let used = match u16::from_le_bytes([bytes[36], bytes[37]]) as usize {
        0 => 1,
        n => n,
    };
    let mut name_len = 24;
    while name_len > 0 && matches!(bytes[40 + name_len - 1], 0 | b' ') {
        name_len -= 1;
    }
    let tape_name = bytes[40..40 + name_len].to_vec();

    let mut entries = Vec::new();
    for i in 0..used.min(max_entries.max(1)) {
        let off = 64 + i * 32;
        if off + 32 > bytes.len() {
            break;
        }
        let rec = &bytes[off..off + 32];
        if rec[0] != 1 {
            continue; // not a normal tape file
        }
        let start = u16::from_le_bytes([rec[2], rec[3]]);
        let end = u16::from_le_bytes([rec[4], rec[5]]);
        let data_off = u32::from_le_bytes([rec[8], rec[9], rec[10], rec[11]]) as usize;
        let len = (end.wrapping_sub(start)) as usize;
        if data_off + len > bytes.len() {
            continue;
        }
        let mut name_len = 16;
        while name_len > 0 && matches!(rec[16 + name_len - 1], 0 | b' ') {
            name_len -= 1;
        }
        let name = rec[16..16 + name_len].to_vec();

        let mut data = Vec::with_capacity(len + 2);
        data.extend_from_slice(&start.to_le_bytes());
        data.extend_from_slice(&bytes[data_off..data_off + len]);
        entries.push(Entry { name, data });
    }

    if entries.is_empty() {
        return Err("T64 archive has no usable entries".into());
    }
    Ok((tape_name, entries))
}

// ---------------------------------------------------------------------
// LYNX
// ---------------------------------------------------------------------

fn looks_like_lynx(bytes: &[u8]) -> bool {
    bytes
        .windows(4)
        .take(0x100)
        .any(|w| w == b"LYNX")
}

/// Read an ASCII decimal terminated by CR, skipping leading spaces.
fn read_decimal(bytes: &[u8], pos: &mut usize) -> Option<usize> {
    while *pos < bytes.len() && bytes[*pos] == b' ' {
        *pos += 1;
    }
    let start = *pos;
    while *pos < bytes.len() && bytes[*pos].is_ascii_digit() {
        *pos += 1;
    }
    if start == *pos {
        return None;
    }
    let value: usize = std::str::from_utf8(&bytes[start..*pos])
        .ok()?
        .parse()
        .ok()?;
    while *pos < bytes.len() && bytes[*pos] != 0x0D {
        *pos += 1;
    }
    *pos += 1; // past the CR
    Some(value)
}

/// Read a CR-terminated field.
fn read_field(bytes: &[u8], pos: &mut usize) -> Vec<u8> {
    let start = *pos;
    while *pos < bytes.len() && bytes[*pos] != 0x0D {
        *pos += 1;
    }
    let mut field = bytes[start..*pos].to_vec();
    *pos += 1;
    while field.last() == Some(&b' ') || field.last() == Some(&0xA0) {
        field.pop();
    }
    while field.first() == Some(&b' ') {
        field.remove(0);
    }
    field
}

fn parse_lynx(bytes: &[u8]) -> Result<(Vec<u8>, Vec<Entry>), String> {
    // The signature line carries the directory size in blocks:
    // " 10  *LYNX XIII ..." after a short BASIC stub.
    let sig = bytes
        .windows(4)
        .position(|w| w == b"LYNX")
        .ok_or_else(|| String::from("LYNX signature missing"))?;
    let line_start = bytes[..sig]
        .iter()
        .rposition(|&b| b == 0x0D)
        .map_or(0, |p| p + 1);

    let mut pos = line_start;
    let dir_blocks =
        read_decimal(bytes, &mut pos).ok_or_else(|| String::from("LYNX directory size missing"))?;
    let num_files =
        read_decimal(bytes, &mut pos).ok_or_else(|| String::from("LYNX file count missing"))?;

    let mut entries = Vec::new();
    let mut data_pos = dir_blocks * LYNX_BLOCK;
    for _ in 0..num_files {
        let name = read_field(bytes, &mut pos);
        let blocks =
            read_decimal(bytes, &mut pos).ok_or_else(|| String::from("LYNX entry truncated"))?;
        let _file_type = read_field(bytes, &mut pos);
        let last_bytes = read_decimal(bytes, &mut pos)
            .ok_or_else(|| String::from("LYNX entry truncated"))?;

        let len = if blocks == 0 {
            0
        } else {
            (blocks - 1) * LYNX_BLOCK + last_bytes.saturating_sub(1)
        };
        if data_pos + len > bytes.len() {
            return Err("LYNX payload truncated".into());
        }
        entries.push(Entry {
            name,
            data: bytes[data_pos..data_pos + len].to_vec(),
        });
        // Files start on block boundaries
        data_pos += blocks * LYNX_BLOCK;
    }

    Ok((b"LYNX".to_vec(), entries))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_t64(entries: &[(&[u8], u16, &[u8])]) -> Vec<u8> {
        let mut bytes = vec![0u8; 64 + entries.len() * 32];
        bytes[..14].copy_from_slice(b"C64 tape image");
        bytes[34..36].copy_from_slice(&(entries.len() as u16).to_le_bytes());
        bytes[36..38].copy_from_slice(&(entries.len() as u16).to_le_bytes());
        bytes[40..44].copy_from_slice(b"TAPE");
        for b in &mut bytes[44..64] {
            *b = b' ';
        }

        let mut data_off = bytes.len();
        let mut payloads = Vec::new();
        for (i, (name, load, payload)) in entries.iter().enumerate() {
            let off = 64 + i * 32;
            bytes[off] = 1;
            bytes[off + 1] = 0x82;
            bytes[off + 2..off + 4].copy_from_slice(&load.to_le_bytes());
            let end = load + payload.len() as u16;
            bytes[off + 4..off + 6].copy_from_slice(&end.to_le_bytes());
            bytes[off + 8..off + 12].copy_from_slice(&(data_off as u32).to_le_bytes());
            let mut padded = [b' '; 16];
            padded[..name.len()].copy_from_slice(name);
            bytes[off + 16..off + 32].copy_from_slice(&padded);
            data_off += payload.len();
            payloads.push(*payload);
        }
        for p in payloads {
            bytes.extend_from_slice(p);
        }
        bytes
    }

    #[test]
    fn t64_parse_and_read() {
        let t64 = make_t64(&[(b"HELLO", 0x0801, &[0xAA, 0xBB])]);
        let mut drive = ArchiveDrive::new(&t64).expect("parses");
        assert_eq!(drive.file_count(), 1);

        assert_eq!(drive.open(0, b"HELLO"), ST_OK);
        assert_eq!(drive.read(0), (ST_OK, 0x01)); // load address low
        assert_eq!(drive.read(0), (ST_OK, 0x08));
        assert_eq!(drive.read(0), (ST_OK, 0xAA));
        assert_eq!(drive.read(0), (ST_EOF, 0xBB));
    }

    #[test]
    fn t64_writes_are_protected() {
        let t64 = make_t64(&[(b"A", 0x0801, &[1])]);
        let mut drive = ArchiveDrive::new(&t64).expect("parses");
        assert_ne!(drive.open(1, b"0:B,P,W"), ST_OK);
    }

    #[test]
    fn rejects_garbage() {
        assert!(ArchiveDrive::new(&[0u8; 100]).is_err());
    }

    fn make_lynx(files: &[(&[u8], &[u8])]) -> Vec<u8> {
        let mut header = Vec::new();
        header.extend_from_slice(b" 1  *LYNX TEST\r");
        header.extend_from_slice(format!(" {}\r", files.len()).as_bytes());
        for (name, payload) in files {
            let blocks = payload.len() / LYNX_BLOCK + 1;
            let last = payload.len() % LYNX_BLOCK + 1;
            header.extend_from_slice(name);
            header.push(0x0D);
            header.extend_from_slice(format!(" {blocks}\r").as_bytes());
            header.extend_from_slice(b"P\r");
            header.extend_from_slice(format!(" {last}\r").as_bytes());
        }
        // One directory block
        header.resize(LYNX_BLOCK, 0);
        for (_, payload) in files {
            let mut chunk = payload.to_vec();
            let padded = payload.len().div_ceil(LYNX_BLOCK).max(1) * LYNX_BLOCK;
            chunk.resize(padded, 0);
            header.extend_from_slice(&chunk);
        }
        header
    }

    #[test]
    fn lynx_parse_and_read() {
        let payload = [0x01, 0x08, 0x42];
        let lynx = make_lynx(&[(b"PROG", &payload)]);
        let mut drive = ArchiveDrive::new(&lynx).expect("parses");
        assert_eq!(drive.file_count(), 1);

        assert_eq!(drive.open(0, b"PROG"), ST_OK);
        let mut bytes = Vec::new();
        loop {
            let (st, b) = drive.read(0);
            bytes.push(b);
            if st & ST_EOF != 0 {
                break;
            }
        }
        assert_eq!(bytes, payload);
    }
}
