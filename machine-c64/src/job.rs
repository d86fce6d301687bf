//! Sector-level GCR job engine.
//!
//! The drive DOS queues work by writing a job code into zero page
//! ($00..$04, one slot per buffer at $300/$400/..) and the track/sector
//! pair into the header table at $06. A patched opcode in the DOS idle
//! loop hands control here; the engine decodes the job, moves the head
//! with step-delay timing, converts between the 256-byte payload and its
//! GCR form, and writes the status byte back over the job code.
//!
//! Backends: .d64/.x64 sector images (with optional per-sector error
//! bytes) and .g64 pre-encoded GCR tracks.

use crate::disk::DiskImage;
use crate::gcr;

/// Job status bytes as the DOS sees them.
pub const JOB_OK: u8 = 0x01;
pub const JOB_HEADER_NOT_FOUND: u8 = 0x02;
pub const JOB_SYNC_NOT_FOUND: u8 = 0x03;
pub const JOB_DATA_NOT_FOUND: u8 = 0x04;
pub const JOB_DATA_CHECKSUM: u8 = 0x05;
pub const JOB_VERIFY_ERROR: u8 = 0x07;
pub const JOB_WRITE_PROTECT: u8 = 0x08;
pub const JOB_HEADER_CHECKSUM: u8 = 0x09;
pub const JOB_ID_MISMATCH: u8 = 0x0B;
pub const JOB_NOT_READY: u8 = 0x0F;

/// Drive CPU cycles per half-track head step.
const STEP_CYCLES: u32 = 4000;

/// Buffer RAM base and job-slot count.
const BUFFER_BASE: usize = 0x300;
const NUM_JOBS: usize = 5;

pub enum JobBackend {
    None,
    Image(DiskImage),
    G64(G64Image),
}

pub struct Job1541 {
    backend: JobBackend,
    /// Head position in whole tracks.
    track: u8,
    /// Pending head-settle cycles; jobs wait until the head arrives.
    step_busy: u32,
}

impl Job1541 {
    #[must_use]
    pub fn new() -> Self {
        Self {
            backend: JobBackend::None,
            track: 18,
            step_busy: 0,
        }
    }

    pub fn set_backend(&mut self, backend: JobBackend) {
        self.backend = backend;
    }

    #[must_use]
    pub fn backend(&self) -> &JobBackend {
        &self.backend
    }

    #[must_use]
    pub fn has_disk(&self) -> bool {
        !matches!(self.backend, JobBackend::None)
    }

    #[must_use]
    pub fn track(&self) -> u8 {
        self.track
    }

    /// Move the head directly (wire-level stepper).
    pub fn set_track(&mut self, track: u8) {
        self.track = track.clamp(1, 40);
    }

    #[must_use]
    pub fn writable(&self) -> bool {
        match &self.backend {
            JobBackend::Image(image) => image.writable(),
            JobBackend::G64(g64) => g64.writable,
            JobBackend::None => false,
        }
    }

    /// Consume head-settle time; called once per emulated drive cycle
    /// batch.
    pub fn count_cycles(&mut self, cycles: u32) {
        self.step_busy = self.step_busy.saturating_sub(cycles);
    }

    /// Whether a head movement is still in flight.
    #[must_use]
    pub fn head_busy(&self) -> bool {
        self.step_busy > 0
    }

    /// GCR stream of the whole current track, for the wire-level head.
    #[must_use]
    pub fn track_stream(&self) -> Vec<u8> {
        match &self.backend {
            JobBackend::Image(image) => gcr::encode_track(image, self.track),
            JobBackend::G64(g64) => g64.track_stream(self.track).to_vec(),
            JobBackend::None => Vec::new(),
        }
    }

    /// Scan the job queue in drive RAM. Executes at most one job per
    /// call (the controller services one buffer per idle-loop pass).
    /// Returns a jump target for execute-buffer jobs.
    pub fn process_queue(&mut self, ram: &mut [u8; 0x800]) -> Option<u16> {
        for slot in 0..NUM_JOBS {
            let code = ram[slot];
            if code & 0x80 == 0 {
                continue;
            }
            let track = ram[6 + 2 * slot];
            let sector = ram[7 + 2 * slot];

            // Seek first; retry this job once the head settles
            if track != self.track && (1..=40).contains(&track) {
                let delta = i32::from(track) - i32::from(self.track);
                self.step_busy += delta.unsigned_abs() * 2 * STEP_CYCLES;
                self.track = track;
                return None;
            }
            if self.step_busy > 0 {
                return None;
            }

            match code & 0xF0 {
                0xE0 | 0xF0 => {
                    // Execute/jump to buffer
                    ram[slot] = JOB_OK;
                    return Some((BUFFER_BASE + slot * 0x100) as u16);
                }
                _ => {
                    let base = BUFFER_BASE + slot * 0x100;
                    let mut buffer = [0u8; 256];
                    buffer.copy_from_slice(&ram[base..base + 256]);
                    let status = self.run_job(code, track, sector, &mut buffer);
                    ram[base..base + 256].copy_from_slice(&buffer);
                    ram[slot] = status;
                    return None;
                }
            }
        }
        None
    }

    /// Run one sector job against the backend.
    pub fn run_job(&mut self, code: u8, track: u8, sector: u8, buffer: &mut [u8; 256]) -> u8 {
        if !self.has_disk() {
            return JOB_NOT_READY;
        }
        match code & 0xF0 {
            0x80 => match self.read_sector(track, sector) {
                Ok(data) => {
                    buffer.copy_from_slice(&data);
                    JOB_OK
                }
                Err(status) => status,
            },
            0x90 => {
                if !self.writable() {
                    return JOB_WRITE_PROTECT;
                }
                self.write_sector(track, sector, buffer)
            }
            0xA0 => match self.read_sector(track, sector) {
                Ok(data) => {
                    if data == *buffer {
                        JOB_OK
                    } else {
                        JOB_VERIFY_ERROR
                    }
                }
                Err(status) => status,
            },
            0xB0 => {
                // Seek: confirm the track has readable headers
                if self.read_sector(track, 0).is_ok() {
                    JOB_OK
                } else {
                    JOB_SYNC_NOT_FOUND
                }
            }
            _ => JOB_HEADER_NOT_FOUND,
        }
    }

    fn read_sector(&mut self, track: u8, sector: u8) -> Result<[u8; 256], u8> {
        match &self.backend {
            JobBackend::None => Err(JOB_NOT_READY),
            JobBackend::Image(image) => {
                let Some(data) = image.read_sector(track, sector) else {
                    return Err(JOB_HEADER_NOT_FOUND);
                };
                // The error-byte trailer carries the job status directly
                let status = image.error_byte(track, sector);
                if status > 1 {
                    return Err(status);
                }
                let mut out = [0u8; 256];
                out.copy_from_slice(data);
                Ok(out)
            }
            JobBackend::G64(g64) => g64.read_sector(track, sector),
        }
    }

    fn write_sector(&mut self, track: u8, sector: u8, buffer: &[u8; 256]) -> u8 {
        match &mut self.backend {
            JobBackend::None => JOB_NOT_READY,
            JobBackend::Image(image) => {
                if image.write_sector(track, sector, buffer) {
                    JOB_OK
                } else {
                    JOB_HEADER_NOT_FOUND
                }
            }
            JobBackend::G64(g64) => g64.write_sector(track, sector, buffer),
        }
    }

    // -----------------------------------------------------------------
    // Snapshot
    // -----------------------------------------------------------------

    pub const STATE_SIZE: usize = 6;

    pub fn save_state(&self, out: &mut Vec<u8>) {
        out.push(self.track);
        out.push(u8::from(self.has_disk()));
        out.extend_from_slice(&self.step_busy.to_le_bytes());
    }

    pub fn load_state(&mut self, data: &[u8]) -> Result<(), String> {
        if data.len() < Self::STATE_SIZE {
            return Err("job state truncated".into());
        }
        self.track = data[0];
        self.step_busy = u32::from_le_bytes([data[2], data[3], data[4], data[5]]);
        Ok(())
    }
}

impl Default for Job1541 {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------
// G64
// ---------------------------------------------------------------------

const G64_SIGNATURE: &[u8; 8] = b"GCR-1541";

/// A .g64 image: pre-encoded GCR track streams.
pub struct G64Image {
    /// Per half-track stream (index = half-track 0..83).
    tracks: Vec<Vec<u8>>,
    pub writable: bool,
}

impl G64Image {
    pub fn from_bytes(bytes: &[u8], writable: bool) -> Result<Self, String> {
        if bytes.len() < 12 || &bytes[..8] != G64_SIGNATURE {
            return Err("not a G64 image".into());
        }
        let num_tracks = bytes[9] as usize;
        if bytes.len() < 12 + num_tracks * 4 {
            return Err("G64 track table truncated".into());
        }

        let mut tracks = Vec::with_capacity(num_tracks);
        for i in 0..num_tracks {
            let entry = 12 + i * 4;
            let offset = u32::from_le_bytes([
                bytes[entry],
                bytes[entry + 1],
                bytes[entry + 2],
                bytes[entry + 3],
            ]) as usize;
            if offset == 0 {
                tracks.push(Vec::new());
                continue;
            }
            if offset + 2 > bytes.len() {
                return Err("G64 track offset out of range".into());
            }
            let len = u16::from_le_bytes([bytes[offset], bytes[offset + 1]]) as usize;
            if offset + 2 + len > bytes.len() {
                return Err("G64 track data truncated".into());
            }
            tracks.push(bytes[offset + 2..offset + 2 + len].to_vec());
        }

        Ok(Self { tracks, writable })
    }

    /// Build a G64 from a sector image (all whole tracks encoded).
    #[must_use]
    pub fn from_image(image: &DiskImage) -> Self {
        let mut tracks = vec![Vec::new(); 84];
        for track in 1..=image.num_tracks() {
            tracks[(track as usize - 1) * 2] = gcr::encode_track(image, track);
        }
        Self {
            tracks,
            writable: true,
        }
    }

    /// GCR stream for a whole track (empty when unformatted).
    #[must_use]
    pub fn track_stream(&self, track: u8) -> &[u8] {
        let idx = (track.max(1) as usize - 1) * 2;
        self.tracks.get(idx).map_or(&[], Vec::as_slice)
    }

    /// Locate `sector` on `track`: scan for sync + header, decode, then
    /// decode the following data block.
    pub fn read_sector(&self, track: u8, sector: u8) -> Result<[u8; 256], u8> {
        let (_, data_start) = self.find_sector(track, sector)?;
        let stream = self.track_stream(track);
        let mut block = Vec::with_capacity(gcr::DATA_BLOCK_GCR);
        for i in 0..gcr::DATA_BLOCK_GCR {
            block.push(stream[(data_start + i) % stream.len()]);
        }
        match gcr::decode_data_block(&block) {
            Ok(payload) => Ok(payload),
            Err(gcr::DataBlockError::NotFound) => Err(JOB_DATA_NOT_FOUND),
            Err(gcr::DataBlockError::Checksum) => Err(JOB_DATA_CHECKSUM),
        }
    }

    /// Re-encode one sector's data block in place.
    pub fn write_sector(&mut self, track: u8, sector: u8, payload: &[u8; 256]) -> u8 {
        if !self.writable {
            return JOB_WRITE_PROTECT;
        }
        let (_, data_start) = match self.find_sector(track, sector) {
            Ok(found) => found,
            Err(status) => return status,
        };
        let encoded = gcr::encode_data_block(payload);
        let idx = (track.max(1) as usize - 1) * 2;
        let stream = &mut self.tracks[idx];
        let len = stream.len();
        for (i, &b) in encoded.iter().enumerate() {
            stream[(data_start + i) % len] = b;
        }
        JOB_OK
    }

    /// Find the header for (track, sector). Returns (header offset,
    /// offset of the data block behind the following sync).
    fn find_sector(&self, track: u8, sector: u8) -> Result<(usize, usize), u8> {
        let stream = self.track_stream(track);
        if stream.is_empty() {
            return Err(JOB_SYNC_NOT_FOUND);
        }
        let len = stream.len();
        let mut saw_sync = false;

        let mut i = 0;
        while i < len {
            // Sync run
            if stream[i] != 0xFF {
                i += 1;
                continue;
            }
            saw_sync = true;
            let mut j = i;
            while j < len + 8 && stream[j % len] == 0xFF {
                j += 1;
            }
            let block_start = j % len;
            let mut header = [0u8; 10];
            for (k, h) in header.iter_mut().enumerate() {
                *h = stream[(block_start + k) % len];
            }
            if let Some(hdr) = gcr::decode_header(&header) {
                if hdr.track == track && hdr.sector == sector {
                    if !hdr.checksum_ok {
                        return Err(JOB_HEADER_CHECKSUM);
                    }
                    // Skip the gap to the data sync, then the sync
                    let mut d = block_start + 10;
                    let mut guard = 0;
                    while stream[d % len] != 0xFF && guard < 32 {
                        d += 1;
                        guard += 1;
                    }
                    if guard == 32 {
                        return Err(JOB_DATA_NOT_FOUND);
                    }
                    let mut sync_guard = 0;
                    while stream[d % len] == 0xFF && sync_guard < 16 {
                        d += 1;
                        sync_guard += 1;
                    }
                    return Ok((block_start, d % len));
                }
            }
            i = j.max(i + 1);
        }

        if saw_sync {
            Err(JOB_HEADER_NOT_FOUND)
        } else {
            Err(JOB_SYNC_NOT_FOUND)
        }
    }

    /// Serialize back to .g64 bytes.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let num_tracks = self.tracks.len();
        let max_len = self
            .tracks
            .iter()
            .map(Vec::len)
            .max()
            .unwrap_or(0)
            .max(gcr::SECTOR_GCR) as u16;

        let mut out = Vec::new();
        out.extend_from_slice(G64_SIGNATURE);
        out.push(0); // version
        out.push(num_tracks as u8);
        out.extend_from_slice(&(max_len + 2).to_le_bytes());

        let table_at = out.len();
        out.resize(out.len() + num_tracks * 4, 0);
        // Speed-zone table: one entry per track, default zones
        let speed_at = out.len();
        out.resize(out.len() + num_tracks * 4, 0);

        for (i, track) in self.tracks.iter().enumerate() {
            if track.is_empty() {
                continue;
            }
            let offset = out.len() as u32;
            out[table_at + i * 4..table_at + i * 4 + 4].copy_from_slice(&offset.to_le_bytes());
            let zone = u32::from(gcr::speed_zone((i / 2 + 1) as u8));
            out[speed_at + i * 4..speed_at + i * 4 + 4]
                .copy_from_slice(&(3 - zone.min(3)).to_le_bytes());
            out.extend_from_slice(&(track.len() as u16).to_le_bytes());
            out.extend_from_slice(track);
        }
        out
    }
}
