//! 1541 disk image container: .d64 and .x64, with BAM and directory
//! handling.
//!
//! Geometry: 35 tracks (optionally 40) with zone-dependent sectors per
//! track (21/19/18/17), 256 bytes per sector. Track 18 holds the BAM
//! (sector 0) and the directory chain (sector 1 onward). An optional
//! trailer of one error byte per sector carries per-sector read status.

pub const SECTOR_SIZE: usize = 256;
const D64_SECTORS_35: usize = 683;
const D64_SECTORS_40: usize = 768;
/// x64 images put a 64-byte header before the .d64 body.
const X64_HEADER_SIZE: usize = 64;
const X64_MAGIC: [u8; 4] = [0x43, 0x15, 0x41, 0x64];

/// Sectors per track, 1-indexed.
const SECTORS_PER_TRACK: [u8; 41] = [
    0, //
    21, 21, 21, 21, 21, 21, 21, 21, 21, 21, 21, 21, 21, 21, 21, 21, 21, // 1-17
    19, 19, 19, 19, 19, 19, 19, // 18-24
    18, 18, 18, 18, 18, 18, // 25-30
    17, 17, 17, 17, 17, // 31-35
    17, 17, 17, 17, 17, // 36-40
];

/// Byte offset of sector 0 of each track.
const TRACK_OFFSETS: [usize; 41] = {
    let mut offsets = [0usize; 41];
    let mut track = 1;
    let mut offset = 0;
    while track <= 40 {
        offsets[track] = offset;
        offset += SECTORS_PER_TRACK[track] as usize * SECTOR_SIZE;
        track += 1;
    }
    offsets
};

/// One directory entry (32 bytes on disk).
#[derive(Debug, Clone)]
pub struct DirEntry {
    /// Location of the entry itself: (track, sector, slot 0-7).
    pub slot: (u8, u8, u8),
    pub file_type: u8,
    pub closed: bool,
    pub first_track: u8,
    pub first_sector: u8,
    pub name: [u8; 16],
    pub blocks: u16,
}

impl DirEntry {
    /// PETSCII name without $A0 padding.
    #[must_use]
    pub fn name_bytes(&self) -> &[u8] {
        let end = self
            .name
            .iter()
            .position(|&b| b == 0xA0)
            .unwrap_or(self.name.len());
        &self.name[..end]
    }
}

pub struct DiskImage {
    data: Vec<u8>,
    error_info: Option<Vec<u8>>,
    num_tracks: u8,
    writable: bool,
}

impl DiskImage {
    /// Parse a .d64 or .x64 image.
    pub fn from_bytes(bytes: &[u8], writable: bool) -> Result<Self, String> {
        // Strip an x64 header if present
        let body = if bytes.len() >= X64_HEADER_SIZE && bytes[..4] == X64_MAGIC {
            &bytes[X64_HEADER_SIZE..]
        } else {
            bytes
        };
        let x64 = body.len() != bytes.len();

        let (num_tracks, sectors) = match body.len() {
            n if n == D64_SECTORS_35 * SECTOR_SIZE || n == D64_SECTORS_35 * 257 => {
                (35u8, D64_SECTORS_35)
            }
            n if n == D64_SECTORS_40 * SECTOR_SIZE || n == D64_SECTORS_40 * 257 => {
                (40u8, D64_SECTORS_40)
            }
            n => return Err(format!("unrecognized disk image size: {n} bytes")),
        };

        let data = body[..sectors * SECTOR_SIZE].to_vec();
        let error_info = if body.len() > sectors * SECTOR_SIZE {
            Some(body[sectors * SECTOR_SIZE..].to_vec())
        } else {
            None
        };

        Ok(Self {
            data,
            error_info,
            num_tracks,
            // x64 attachments are treated as read-only
            writable: writable && !x64,
        })
    }

    /// A freshly formatted 35-track image.
    #[must_use]
    pub fn blank(name: &[u8], id: [u8; 2]) -> Self {
        let mut image = Self {
            data: vec![0; D64_SECTORS_35 * SECTOR_SIZE],
            error_info: None,
            num_tracks: 35,
            writable: true,
        };
        image.format(name, id);
        image
    }

    #[must_use]
    pub fn num_tracks(&self) -> u8 {
        self.num_tracks
    }

    #[must_use]
    pub fn writable(&self) -> bool {
        self.writable
    }

    pub fn set_writable(&mut self, writable: bool) {
        self.writable = writable;
    }

    /// Serialized image bytes (for writing back to the host).
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = self.data.clone();
        if let Some(ref errs) = self.error_info {
            out.extend_from_slice(errs);
        }
        out
    }

    #[must_use]
    pub fn sectors_per_track(track: u8) -> u8 {
        if (1..=40).contains(&track) {
            SECTORS_PER_TRACK[track as usize]
        } else {
            0
        }
    }

    #[must_use]
    pub fn sector_offset(&self, track: u8, sector: u8) -> Option<usize> {
        if track == 0 || track > self.num_tracks || sector >= Self::sectors_per_track(track) {
            return None;
        }
        Some(TRACK_OFFSETS[track as usize] + sector as usize * SECTOR_SIZE)
    }

    #[must_use]
    pub fn sector_index(&self, track: u8, sector: u8) -> Option<usize> {
        self.sector_offset(track, sector).map(|o| o / SECTOR_SIZE)
    }

    #[must_use]
    pub fn read_sector(&self, track: u8, sector: u8) -> Option<&[u8]> {
        let offset = self.sector_offset(track, sector)?;
        Some(&self.data[offset..offset + SECTOR_SIZE])
    }

    pub fn write_sector(&mut self, track: u8, sector: u8, data: &[u8]) -> bool {
        if data.len() != SECTOR_SIZE || !self.writable {
            return false;
        }
        let Some(offset) = self.sector_offset(track, sector) else {
            return false;
        };
        self.data[offset..offset + SECTOR_SIZE].copy_from_slice(data);
        true
    }

    /// Per-sector error byte from the image trailer (1 = no error).
    #[must_use]
    pub fn error_byte(&self, track: u8, sector: u8) -> u8 {
        match (&self.error_info, self.sector_index(track, sector)) {
            (Some(errs), Some(idx)) if idx < errs.len() => errs[idx],
            _ => 1,
        }
    }

    /// Disk ID from the BAM.
    #[must_use]
    pub fn disk_id(&self) -> [u8; 2] {
        match self.read_sector(18, 0) {
            Some(bam) => [bam[0xA2], bam[0xA3]],
            None => [0x30, 0x30],
        }
    }

    // -----------------------------------------------------------------
    // BAM
    // -----------------------------------------------------------------

    fn bam_entry_offset(track: u8) -> usize {
        4 * track as usize
    }

    /// Whether a block is free in the BAM.
    #[must_use]
    pub fn block_free(&self, track: u8, sector: u8) -> bool {
        let Some(bam_off) = self.sector_offset(18, 0) else {
            return false;
        };
        let e = bam_off + Self::bam_entry_offset(track);
        self.data[e + 1 + (sector / 8) as usize] & (1 << (sector & 7)) != 0
    }

    fn set_block(&mut self, track: u8, sector: u8, free: bool) {
        let Some(bam_off) = self.sector_offset(18, 0) else {
            return;
        };
        let e = bam_off + Self::bam_entry_offset(track);
        let byte = e + 1 + (sector / 8) as usize;
        let mask = 1 << (sector & 7);
        let was_free = self.data[byte] & mask != 0;
        if free && !was_free {
            self.data[byte] |= mask;
            self.data[e] += 1;
        } else if !free && was_free {
            self.data[byte] &= !mask;
            self.data[e] -= 1;
        }
    }

    /// Count of free blocks (directory track excluded, as DOS reports).
    #[must_use]
    pub fn blocks_free(&self) -> u16 {
        let Some(bam_off) = self.sector_offset(18, 0) else {
            return 0;
        };
        let mut total = 0u16;
        for track in 1..=self.num_tracks.min(35) {
            if track == 18 {
                continue;
            }
            total += u16::from(self.data[bam_off + Self::bam_entry_offset(track)]);
        }
        total
    }

    /// Allocate the next free block, preferring the track interleave DOS
    /// uses (outward from 17, inward from 19). Returns (track, sector).
    pub fn allocate_block(&mut self) -> Option<(u8, u8)> {
        let mut candidates: Vec<u8> = Vec::new();
        for d in 0..18u8 {
            if 17 >= d && 17 - d >= 1 {
                candidates.push(17 - d);
            }
            if 19 + d <= self.num_tracks.min(35) {
                candidates.push(19 + d);
            }
        }
        for track in candidates {
            for sector in 0..Self::sectors_per_track(track) {
                if self.block_free(track, sector) {
                    self.set_block(track, sector, false);
                    return Some((track, sector));
                }
            }
        }
        None
    }

    pub fn free_chain(&mut self, mut track: u8, mut sector: u8) {
        while track != 0 {
            let Some(offset) = self.sector_offset(track, sector) else {
                return;
            };
            let next_track = self.data[offset];
            let next_sector = self.data[offset + 1];
            self.set_block(track, sector, true);
            track = next_track;
            sector = next_sector;
        }
    }

    // -----------------------------------------------------------------
    // Directory
    // -----------------------------------------------------------------

    /// All directory entries, deleted slots skipped.
    #[must_use]
    pub fn directory(&self) -> Vec<DirEntry> {
        let mut entries = Vec::new();
        let mut track = 18u8;
        let mut sector = 1u8;
        let mut guard = 0;
        while track != 0 && guard < 80 {
            guard += 1;
            let Some(offset) = self.sector_offset(track, sector) else {
                break;
            };
            let block = &self.data[offset..offset + SECTOR_SIZE];
            for slot in 0..8usize {
                let e = &block[slot * 32..slot * 32 + 32];
                let file_type = e[2];
                if file_type & 0x07 == 0 && file_type & 0x80 == 0 {
                    continue;
                }
                let mut name = [0u8; 16];
                name.copy_from_slice(&e[5..21]);
                entries.push(DirEntry {
                    slot: (track, sector, slot as u8),
                    file_type: file_type & 0x07,
                    closed: file_type & 0x80 != 0,
                    first_track: e[3],
                    first_sector: e[4],
                    name,
                    blocks: u16::from(e[30]) | (u16::from(e[31]) << 8),
                });
            }
            track = block[0];
            sector = block[1];
        }
        entries
    }

    /// Find a closed file whose name matches `pattern` (PETSCII with
    /// `*`/`?` wildcards).
    #[must_use]
    pub fn find_file(&self, pattern: &[u8]) -> Option<DirEntry> {
        self.directory()
            .into_iter()
            .filter(|e| e.closed)
            .find(|e| name_matches(pattern, e.name_bytes()))
    }

    /// Read a whole file by following its sector chain.
    #[must_use]
    pub fn read_file(&self, entry: &DirEntry) -> Option<Vec<u8>> {
        let mut out = Vec::new();
        let mut track = entry.first_track;
        let mut sector = entry.first_sector;
        let mut guard = 0;
        while track != 0 {
            guard += 1;
            if guard > 800 {
                return None;
            }
            let block = self.read_sector(track, sector)?;
            if block[0] == 0 {
                // Final block: byte 1 indexes the last used byte
                let last = block[1] as usize;
                if last >= 2 {
                    out.extend_from_slice(&block[2..=last.min(255)]);
                }
                break;
            }
            out.extend_from_slice(&block[2..]);
            track = block[0];
            sector = block[1];
        }
        Some(out)
    }

    /// Write a file: allocate a chain, link it, and add a directory
    /// entry. Returns false when the disk is full or read-only.
    pub fn write_file(&mut self, name: &[u8], payload: &[u8]) -> bool {
        if !self.writable {
            return false;
        }
        let chunks: Vec<&[u8]> = if payload.is_empty() {
            vec![&[][..]]
        } else {
            payload.chunks(254).collect()
        };

        let mut blocks = Vec::with_capacity(chunks.len());
        for _ in &chunks {
            match self.allocate_block() {
                Some(ts) => blocks.push(ts),
                None => {
                    for &(t, s) in &blocks {
                        self.set_block(t, s, true);
                    }
                    return false;
                }
            }
        }

        for (i, chunk) in chunks.iter().enumerate() {
            let (track, sector) = blocks[i];
            let mut block = [0u8; SECTOR_SIZE];
            if i + 1 < blocks.len() {
                block[0] = blocks[i + 1].0;
                block[1] = blocks[i + 1].1;
            } else {
                block[0] = 0;
                block[1] = (chunk.len() + 1) as u8;
            }
            block[2..2 + chunk.len()].copy_from_slice(chunk);
            let offset = match self.sector_offset(track, sector) {
                Some(o) => o,
                None => return false,
            };
            self.data[offset..offset + SECTOR_SIZE].copy_from_slice(&block);
        }

        self.add_dir_entry(name, 0x02, blocks[0], blocks.len() as u16)
    }

    fn add_dir_entry(&mut self, name: &[u8], file_type: u8, first: (u8, u8), blocks: u16) -> bool {
        let mut track = 18u8;
        let mut sector = 1u8;
        let mut guard = 0;
        loop {
            guard += 1;
            if guard > 80 {
                return false;
            }
            let Some(offset) = self.sector_offset(track, sector) else {
                return false;
            };
            for slot in 0..8usize {
                let e = offset + slot * 32;
                if self.data[e + 2] == 0 {
                    self.data[e + 2] = 0x80 | file_type;
                    self.data[e + 3] = first.0;
                    self.data[e + 4] = first.1;
                    let mut padded = [0xA0u8; 16];
                    let n = name.len().min(16);
                    padded[..n].copy_from_slice(&name[..n]);
                    self.data[e + 5..e + 21].copy_from_slice(&padded);
                    self.data[e + 30] = blocks as u8;
                    self.data[e + 31] = (blocks >> 8) as u8;
                    return true;
                }
            }
            let next_track = self.data[offset];
            let next_sector = self.data[offset + 1];
            if next_track == 0 {
                // Extend the directory by one sector on track 18
                let mut new_sector = None;
                for s in 1..Self::sectors_per_track(18) {
                    if self.block_free(18, s) {
                        new_sector = Some(s);
                        break;
                    }
                }
                let Some(s) = new_sector else { return false };
                self.set_block(18, s, false);
                self.data[offset] = 18;
                self.data[offset + 1] = s;
                let new_off = match self.sector_offset(18, s) {
                    Some(o) => o,
                    None => return false,
                };
                self.data[new_off..new_off + SECTOR_SIZE].fill(0);
                self.data[new_off + 1] = 0xFF;
                track = 18;
                sector = s;
            } else {
                track = next_track;
                sector = next_sector;
            }
        }
    }

    /// Scratch a file: mark the entry deleted and free its chain.
    pub fn scratch(&mut self, entry: &DirEntry) -> bool {
        if !self.writable {
            return false;
        }
        let (t, s, slot) = entry.slot;
        let Some(offset) = self.sector_offset(t, s) else {
            return false;
        };
        self.data[offset + slot as usize * 32 + 2] = 0;
        self.free_chain(entry.first_track, entry.first_sector);
        true
    }

    /// Rename a file in place.
    pub fn rename(&mut self, entry: &DirEntry, new_name: &[u8]) -> bool {
        if !self.writable {
            return false;
        }
        let (t, s, slot) = entry.slot;
        let Some(offset) = self.sector_offset(t, s) else {
            return false;
        };
        let e = offset + slot as usize * 32;
        let mut padded = [0xA0u8; 16];
        let n = new_name.len().min(16);
        padded[..n].copy_from_slice(&new_name[..n]);
        self.data[e + 5..e + 21].copy_from_slice(&padded);
        true
    }

    /// Rebuild the BAM from the directory: free everything, then
    /// re-allocate the directory track and every file chain.
    pub fn validate(&mut self) {
        if !self.writable {
            return;
        }
        for track in 1..=self.num_tracks.min(35) {
            for sector in 0..Self::sectors_per_track(track) {
                self.set_block(track, sector, true);
            }
        }
        self.set_block(18, 0, false);
        let mut t = 18;
        let mut s = 1;
        let mut guard = 0;
        while t != 0 && guard < 80 {
            guard += 1;
            self.set_block(t, s, false);
            let Some(offset) = self.sector_offset(t, s) else {
                break;
            };
            let (nt, ns) = (self.data[offset], self.data[offset + 1]);
            t = nt;
            s = ns;
        }
        for entry in self.directory() {
            if !entry.closed {
                continue;
            }
            let mut t = entry.first_track;
            let mut s = entry.first_sector;
            let mut guard = 0;
            while t != 0 && guard < 800 {
                guard += 1;
                self.set_block(t, s, false);
                let Some(offset) = self.sector_offset(t, s) else {
                    break;
                };
                let (nt, ns) = (self.data[offset], self.data[offset + 1]);
                t = nt;
                s = ns;
            }
        }
    }

    /// Format: wipe everything, rebuild the BAM and an empty directory.
    pub fn format(&mut self, name: &[u8], id: [u8; 2]) {
        if !self.writable {
            return;
        }
        self.data.fill(0);

        // BAM header
        let bam = self.sector_offset(18, 0).unwrap_or(0);
        self.data[bam] = 18; // directory chain
        self.data[bam + 1] = 1;
        self.data[bam + 2] = 0x41; // DOS format marker 'A'
        for track in 1..=self.num_tracks.min(35) {
            let e = bam + Self::bam_entry_offset(track);
            let n = Self::sectors_per_track(track);
            self.data[e] = n;
            for sector in 0..n {
                self.data[e + 1 + (sector / 8) as usize] |= 1 << (sector & 7);
            }
        }
        // Disk name and ID
        let mut padded = [0xA0u8; 16];
        let n = name.len().min(16);
        padded[..n].copy_from_slice(&name[..n]);
        self.data[bam + 0x90..bam + 0xA0].copy_from_slice(&padded);
        self.data[bam + 0xA0] = 0xA0;
        self.data[bam + 0xA1] = 0xA0;
        self.data[bam + 0xA2] = id[0];
        self.data[bam + 0xA3] = id[1];
        self.data[bam + 0xA4] = 0xA0;
        self.data[bam + 0xA5] = 0x32; // "2A"
        self.data[bam + 0xA6] = 0x41;

        // Directory track and BAM allocated
        self.set_block(18, 0, false);
        self.set_block(18, 1, false);
        let dir = self.sector_offset(18, 1).unwrap_or(0);
        self.data[dir] = 0;
        self.data[dir + 1] = 0xFF;
    }
}

/// CBM filename pattern match: `*` matches the rest, `?` one character.
#[must_use]
pub fn name_matches(pattern: &[u8], name: &[u8]) -> bool {
    let mut pi = 0;
    let mut ni = 0;
    loop {
        match (pattern.get(pi), name.get(ni)) {
            (None, None) => return true,
            (Some(b'*'), _) => return true,
            (Some(b'?'), Some(_)) => {
                pi += 1;
                ni += 1;
            }
            (Some(&p), Some(&n)) if p == n => {
                pi += 1;
                ni += 1;
            }
            _ => return false,
        }
    }
}
