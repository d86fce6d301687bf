//! Host-directory drive: a directory of .prg/.p00 files presented as a
//! flat CBM disk.

use std::fs;
use std::path::{Path, PathBuf};

use log::warn;

use super::{
    directory_listing, parse_filename, AccessMode, DosError, Drive, ErrorChannel, ST_EOF,
    ST_NOTPRESENT, ST_OK, ST_TIMEOUT,
};
use crate::disk::{name_matches, DirEntry};

/// .p00 container: 26-byte header ("C64File", original name, record
/// length), then the PRG payload.
const P00_HEADER_SIZE: usize = 26;
const P00_MAGIC: &[u8; 8] = b"C64File\0";

enum Channel {
    Closed,
    Read { data: Vec<u8>, pos: usize },
    Write { path: PathBuf, buf: Vec<u8> },
}

impl Default for Channel {
    fn default() -> Self {
        Channel::Closed
    }
}

pub struct FsDrive {
    base: PathBuf,
    channels: [Channel; 16],
    error: ErrorChannel,
    command: Vec<u8>,
}

impl FsDrive {
    /// Attach a host directory. Missing directories still attach; every
    /// access then reports DRIVE NOT READY.
    #[must_use]
    pub fn new(base: &Path) -> Self {
        Self {
            base: base.to_path_buf(),
            channels: Default::default(),
            error: ErrorChannel::new(),
            command: Vec::new(),
        }
    }

    /// CBM view of the directory: uppercase names without extensions.
    fn entries(&self) -> Vec<(Vec<u8>, PathBuf, u64)> {
        let mut out = Vec::new();
        let Ok(dir) = fs::read_dir(&self.base) else {
            return out;
        };
        for entry in dir.flatten() {
            let path = entry.path();
            let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
                continue;
            };
            let ext = ext.to_ascii_lowercase();
            if ext != "prg" && ext != "p00" {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            out.push((stem.to_ascii_uppercase().into_bytes(), path, size));
        }
        out.sort();
        out
    }

    fn find(&self, pattern: &[u8]) -> Option<(Vec<u8>, PathBuf)> {
        self.entries()
            .into_iter()
            .find(|(name, _, _)| name_matches(pattern, name))
            .map(|(name, path, _)| (name, path))
    }

    /// Load a file's PRG payload, stripping a .p00 header if present.
    fn load_payload(path: &Path) -> Option<Vec<u8>> {
        let data = match fs::read(path) {
            Ok(d) => d,
            Err(e) => {
                warn!("drive file {} unreadable: {e}", path.display());
                return None;
            }
        };
        if data.len() > P00_HEADER_SIZE && data[..8] == *P00_MAGIC {
            Some(data[P00_HEADER_SIZE..].to_vec())
        } else {
            Some(data)
        }
    }

    fn host_name(&self, name: &[u8]) -> PathBuf {
        let lower: String = name
            .iter()
            .map(|&b| (b as char).to_ascii_lowercase())
            .collect();
        self.base.join(format!("{lower}.prg"))
    }

    fn execute_command(&mut self, cmd: &[u8]) {
        let cmd = match cmd.split_last() {
            Some((&b'\r', rest)) => rest,
            _ => cmd,
        };
        if cmd.is_empty() {
            return;
        }
        match cmd[0] {
            b'I' | b'V' | b'U' => self.error.set(DosError::Ok, 0, 0),
            b'S' => {
                let Some(colon) = cmd.iter().position(|&b| b == b':') else {
                    self.error.set(DosError::SyntaxError, 0, 0);
                    return;
                };
                let pattern = &cmd[colon + 1..];
                let mut count = 0u8;
                for (name, path, _) in self.entries() {
                    if name_matches(pattern, &name) && fs::remove_file(&path).is_ok() {
                        count += 1;
                    }
                }
                self.error.set(DosError::FilesScratched(count), 0, 0);
            }
            b'R' => {
                let syntax = cmd
                    .iter()
                    .position(|&b| b == b':')
                    .map(|colon| &cmd[colon + 1..])
                    .and_then(|rest| {
                        rest.iter()
                            .position(|&b| b == b'=')
                            .map(|eq| (rest[..eq].to_vec(), rest[eq + 1..].to_vec()))
                    });
                let Some((new_name, old_name)) = syntax else {
                    self.error.set(DosError::SyntaxError, 0, 0);
                    return;
                };
                match self.find(&old_name) {
                    Some((_, path)) => {
                        let target = self.host_name(&new_name);
                        if fs::rename(&path, &target).is_ok() {
                            self.error.set(DosError::Ok, 0, 0);
                        } else {
                            self.error.set(DosError::WriteError, 0, 0);
                        }
                    }
                    None => self.error.set(DosError::FileNotFound, 0, 0),
                }
            }
            b'N' => {
                // A host directory cannot be formatted
                self.error.set(DosError::Ok, 0, 0);
            }
            _ => self.error.set(DosError::SyntaxError31, 0, 0),
        }
    }
}

impl Drive for FsDrive {
    fn open(&mut self, channel: usize, name: &[u8]) -> u8 {
        if channel == 15 {
            self.execute_command(name);
            return ST_OK;
        }
        if channel >= 16 {
            return ST_NOTPRESENT;
        }
        if !self.base.is_dir() {
            self.error.set(DosError::NotReady, 0, 0);
            return ST_TIMEOUT;
        }

        if name.first() == Some(&b'$') {
            let entries: Vec<DirEntry> = self
                .entries()
                .into_iter()
                .map(|(name, _, size)| {
                    let mut padded = [0xA0u8; 16];
                    let n = name.len().min(16);
                    padded[..n].copy_from_slice(&name[..n]);
                    DirEntry {
                        slot: (0, 0, 0),
                        file_type: 0x02,
                        closed: true,
                        first_track: 0,
                        first_sector: 0,
                        name: padded,
                        blocks: size.div_ceil(254).min(0xFFFF) as u16,
                    }
                })
                .collect();
            let listing = directory_listing(b"HOST DIRECTORY", [b'F', b'S'], &entries, 0);
            self.channels[channel] = Channel::Read {
                data: listing,
                pos: 0,
            };
            self.error.set(DosError::Ok, 0, 0);
            return ST_OK;
        }

        let (pattern, mode) = parse_filename(name);
        match mode {
            AccessMode::Read => match self.find(pattern).and_then(|(_, p)| Self::load_payload(&p)) {
                Some(data) => {
                    self.channels[channel] = Channel::Read { data, pos: 0 };
                    self.error.set(DosError::Ok, 0, 0);
                    ST_OK
                }
                None => {
                    self.error.set(DosError::FileNotFound, 0, 0);
                    ST_TIMEOUT
                }
            },
            AccessMode::Write => {
                if self.find(pattern).is_some() {
                    self.error.set(DosError::FileExists, 0, 0);
                    return ST_TIMEOUT;
                }
                self.channels[channel] = Channel::Write {
                    path: self.host_name(pattern),
                    buf: Vec::new(),
                };
                self.error.set(DosError::Ok, 0, 0);
                ST_OK
            }
        }
    }

    fn close(&mut self, channel: usize) -> u8 {
        if channel >= 16 {
            return ST_NOTPRESENT;
        }
        if channel == 15 {
            if !self.command.is_empty() {
                let cmd = std::mem::take(&mut self.command);
                self.execute_command(&cmd);
            }
            return ST_OK;
        }
        let ch = std::mem::replace(&mut self.channels[channel], Channel::Closed);
        if let Channel::Write { path, buf } = ch {
            if let Err(e) = fs::write(&path, &buf) {
                warn!("drive write to {} failed: {e}", path.display());
                self.error.set(DosError::WriteError, 0, 0);
            }
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
            _ => (ST_TIMEOUT, 0),
        }
    }

    fn write(&mut self, channel: usize, byte: u8, _eoi: bool) -> u8 {
        if channel == 15 {
            self.command.push(byte);
            if byte == b'\r' {
                let cmd = std::mem::take(&mut self.command);
                self.execute_command(&cmd);
            }
            return ST_OK;
        }
        if channel >= 16 {
            return ST_NOTPRESENT;
        }
        match &mut self.channels[channel] {
            Channel::Write { buf, .. } => {
                buf.push(byte);
                ST_OK
            }
            _ => {
                self.error.set(DosError::FileNotOpen, 0, 0);
                ST_TIMEOUT
            }
        }
    }

    fn reset(&mut self) {
        for ch in &mut self.channels {
            *ch = Channel::Closed;
        }
        self.command.clear();
        self.error = ErrorChannel::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = env::temp_dir().join(format!("fsdrive-test-{tag}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).expect("temp dir");
        dir
    }

    #[test]
    fn reads_prg_payload() {
        let dir = temp_dir("read");
        fs::write(dir.join("game.prg"), [0x01, 0x08, 0xAA]).expect("write");
        let mut drive = FsDrive::new(&dir);

        assert_eq!(drive.open(0, b"GAME"), ST_OK);
        assert_eq!(drive.read(0), (ST_OK, 0x01));
        assert_eq!(drive.read(0), (ST_OK, 0x08));
        assert_eq!(drive.read(0), (ST_EOF, 0xAA));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn p00_header_is_stripped() {
        let dir = temp_dir("p00");
        let mut data = Vec::new();
        data.extend_from_slice(P00_MAGIC);
        data.extend_from_slice(&[0; P00_HEADER_SIZE - 8]);
        data.extend_from_slice(&[0x01, 0x08, 0x55]);
        fs::write(dir.join("thing.p00"), &data).expect("write");
        let mut drive = FsDrive::new(&dir);

        assert_eq!(drive.open(0, b"THING"), ST_OK);
        assert_eq!(drive.read(0), (ST_OK, 0x01));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn wildcard_open_matches_first() {
        let dir = temp_dir("wild");
        fs::write(dir.join("alpha.prg"), [0x01, 0x08]).expect("write");
        let mut drive = FsDrive::new(&dir);
        assert_eq!(drive.open(0, b"*"), ST_OK);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_directory_reports_not_ready() {
        let dir = env::temp_dir().join("fsdrive-test-definitely-missing");
        let mut drive = FsDrive::new(&dir);
        assert_ne!(drive.open(0, b"ANY"), ST_OK);
        let mut status = Vec::new();
        loop {
            let (st, b) = drive.read(15);
            status.push(b);
            if st & ST_EOF != 0 {
                break;
            }
        }
        assert!(status.starts_with(b"74"));
    }

    #[test]
    fn write_and_scratch() {
        let dir = temp_dir("write");
        let mut drive = FsDrive::new(&dir);
        assert_eq!(drive.open(1, b"0:OUT,P,W"), ST_OK);
        drive.write(1, 0x42, false);
        drive.close(1);
        assert!(dir.join("out.prg").exists());

        drive.open(15, b"S:OUT");
        assert!(!dir.join("out.prg").exists());
        let _ = fs::remove_dir_all(&dir);
    }
}
