//! Group Code Recording: the 4-to-5 bit encoding the 1541 writes to
//! disk. Every nibble maps to a 5-bit code with at most two consecutive
//! zero bits, which keeps the read clock recoverable.
//!
//! On-disk sector layout:
//!   sync (5 × $FF), header block (8 raw -> 10 GCR bytes), gap (9 × $55),
//!   sync, data block (260 raw -> 325 GCR bytes), inter-sector gap.
//!
//! The bit rate depends on the speed zone:
//!   tracks  1-17: 26 cycles/bit, 18-24: 28, 25-30: 30, 31-35: 32.

use crate::disk::DiskImage;

const GCR_ENCODE: [u8; 16] = [
    0x0A, 0x0B, 0x12, 0x13, 0x0E, 0x0F, 0x16, 0x17, 0x09, 0x19, 0x1A, 0x1B, 0x0D, 0x1D, 0x1E,
    0x15,
];

/// Inverse table; invalid codes map to 0xFF.
const GCR_DECODE: [u8; 32] = [
    0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, //
    0xFF, 0x08, 0x00, 0x01, 0xFF, 0x0C, 0x04, 0x05, //
    0xFF, 0xFF, 0x02, 0x03, 0xFF, 0x0F, 0x06, 0x07, //
    0xFF, 0x09, 0x0A, 0x0B, 0xFF, 0x0D, 0x0E, 0xFF,
];

/// Length of a GCR-encoded data block (260 raw bytes).
pub const DATA_BLOCK_GCR: usize = 325;
/// Length of one encoded sector including syncs and gaps.
pub const SECTOR_GCR: usize = 5 + 10 + 9 + 5 + DATA_BLOCK_GCR + 9;

#[must_use]
pub fn speed_zone(track: u8) -> u8 {
    match track {
        1..=17 => 0,
        18..=24 => 1,
        25..=30 => 2,
        _ => 3,
    }
}

/// Drive CPU cycles per GCR byte at ~1 MHz.
#[must_use]
pub fn cycles_per_byte(track: u8) -> u32 {
    match speed_zone(track) {
        0 => 208,
        1 => 224,
        2 => 240,
        _ => 256,
    }
}

/// Pack 4 raw bytes into 5 GCR bytes.
#[must_use]
pub fn encode_group(input: &[u8; 4]) -> [u8; 5] {
    let n: [u8; 8] = [
        GCR_ENCODE[(input[0] >> 4) as usize],
        GCR_ENCODE[(input[0] & 0x0F) as usize],
        GCR_ENCODE[(input[1] >> 4) as usize],
        GCR_ENCODE[(input[1] & 0x0F) as usize],
        GCR_ENCODE[(input[2] >> 4) as usize],
        GCR_ENCODE[(input[2] & 0x0F) as usize],
        GCR_ENCODE[(input[3] >> 4) as usize],
        GCR_ENCODE[(input[3] & 0x0F) as usize],
    ];
    [
        (n[0] << 3) | (n[1] >> 2),
        (n[1] << 6) | (n[2] << 1) | (n[3] >> 4),
        (n[3] << 4) | (n[4] >> 1),
        (n[4] << 7) | (n[5] << 2) | (n[6] >> 3),
        (n[6] << 5) | n[7],
    ]
}

/// Unpack 5 GCR bytes into 4 raw bytes; `None` on an invalid code.
#[must_use]
pub fn decode_group(input: &[u8; 5]) -> Option<[u8; 4]> {
    let g = [
        (input[0] >> 3) & 0x1F,
        ((input[0] << 2) | (input[1] >> 6)) & 0x1F,
        (input[1] >> 1) & 0x1F,
        ((input[1] << 4) | (input[2] >> 4)) & 0x1F,
        ((input[2] << 1) | (input[3] >> 7)) & 0x1F,
        (input[3] >> 2) & 0x1F,
        ((input[3] << 3) | (input[4] >> 5)) & 0x1F,
        input[4] & 0x1F,
    ];
    let mut d = [0u8; 8];
    for (i, &code) in g.iter().enumerate() {
        let v = GCR_DECODE[code as usize];
        if v == 0xFF {
            return None;
        }
        d[i] = v;
    }
    Some([
        (d[0] << 4) | d[1],
        (d[2] << 4) | d[3],
        (d[4] << 4) | d[5],
        (d[6] << 4) | d[7],
    ])
}

/// Encode a sector header: $08, checksum, sector, track, id2, id1, $0F, $0F.
#[must_use]
pub fn encode_header(track: u8, sector: u8, id: [u8; 2]) -> [u8; 10] {
    let checksum = sector ^ track ^ id[0] ^ id[1];
    let raw = [0x08, checksum, sector, track, id[1], id[0], 0x0F, 0x0F];
    let a = encode_group(&[raw[0], raw[1], raw[2], raw[3]]);
    let b = encode_group(&[raw[4], raw[5], raw[6], raw[7]]);
    [a[0], a[1], a[2], a[3], a[4], b[0], b[1], b[2], b[3], b[4]]
}

/// Decoded header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectorHeader {
    pub track: u8,
    pub sector: u8,
    pub id: [u8; 2],
    pub checksum_ok: bool,
}

/// Decode a 10-byte GCR header block.
#[must_use]
pub fn decode_header(gcr: &[u8]) -> Option<SectorHeader> {
    if gcr.len() < 10 {
        return None;
    }
    let a = decode_group(&[gcr[0], gcr[1], gcr[2], gcr[3], gcr[4]])?;
    let b = decode_group(&[gcr[5], gcr[6], gcr[7], gcr[8], gcr[9]])?;
    if a[0] != 0x08 {
        return None;
    }
    let (checksum, sector, track) = (a[1], a[2], a[3]);
    let id = [b[1], b[0]];
    Some(SectorHeader {
        track,
        sector,
        id,
        checksum_ok: checksum == sector ^ track ^ id[0] ^ id[1],
    })
}

/// Encode 256 payload bytes into a 325-byte GCR data block
/// ($07 marker, payload, XOR checksum, two pad bytes).
#[must_use]
pub fn encode_data_block(payload: &[u8; 256]) -> Vec<u8> {
    let mut checksum = 0u8;
    for &b in payload.iter() {
        checksum ^= b;
    }
    let mut raw = Vec::with_capacity(260);
    raw.push(0x07);
    raw.extend_from_slice(payload);
    raw.push(checksum);
    raw.push(0x00);
    raw.push(0x00);

    let mut gcr = Vec::with_capacity(DATA_BLOCK_GCR);
    for chunk in raw.chunks_exact(4) {
        gcr.extend_from_slice(&encode_group(&[chunk[0], chunk[1], chunk[2], chunk[3]]));
    }
    gcr
}

/// Data block decode errors, mapped to job status by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataBlockError {
    /// A GCR code did not decode or the marker byte was wrong.
    NotFound,
    /// The payload decoded but its checksum disagrees.
    Checksum,
}

/// Decode a 325-byte GCR data block into its 256 payload bytes.
pub fn decode_data_block(gcr: &[u8]) -> Result<[u8; 256], DataBlockError> {
    if gcr.len() < DATA_BLOCK_GCR {
        return Err(DataBlockError::NotFound);
    }
    let mut raw = Vec::with_capacity(260);
    for chunk in gcr[..DATA_BLOCK_GCR].chunks_exact(5) {
        let group = decode_group(&[chunk[0], chunk[1], chunk[2], chunk[3], chunk[4]])
            .ok_or(DataBlockError::NotFound)?;
        raw.extend_from_slice(&group);
    }
    if raw[0] != 0x07 {
        return Err(DataBlockError::NotFound);
    }
    let mut payload = [0u8; 256];
    payload.copy_from_slice(&raw[1..257]);
    let mut checksum = 0u8;
    for &b in payload.iter() {
        checksum ^= b;
    }
    if checksum != raw[257] {
        return Err(DataBlockError::Checksum);
    }
    Ok(payload)
}

/// Encode one complete sector with syncs and gaps.
#[must_use]
pub fn encode_sector(track: u8, sector: u8, payload: &[u8; 256], id: [u8; 2]) -> Vec<u8> {
    let mut out = Vec::with_capacity(SECTOR_GCR);
    out.extend_from_slice(&[0xFF; 5]);
    out.extend_from_slice(&encode_header(track, sector, id));
    out.extend_from_slice(&[0x55; 9]);
    out.extend_from_slice(&[0xFF; 5]);
    out.extend_from_slice(&encode_data_block(payload));
    out.extend_from_slice(&[0x55; 9]);
    out
}

/// Encode a whole track from a disk image as one continuous stream the
/// head reads in a loop.
#[must_use]
pub fn encode_track(image: &DiskImage, track: u8) -> Vec<u8> {
    let sectors = DiskImage::sectors_per_track(track);
    let id = image.disk_id();
    let mut out = Vec::with_capacity(sectors as usize * SECTOR_GCR);
    for sector in 0..sectors {
        let mut payload = [0u8; 256];
        if let Some(data) = image.read_sector(track, sector) {
            payload.copy_from_slice(data);
        }
        out.extend_from_slice(&encode_sector(track, sector, &payload, id));
    }
    out
}
