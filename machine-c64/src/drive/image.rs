//! Disk-image drive: .d64/.x64 channels over a [`DiskImage`].

use super::{
    directory_listing, parse_filename, AccessMode, DosError, Drive, ErrorChannel, ST_EOF,
    ST_NOTPRESENT, ST_OK, ST_TIMEOUT,
};
use crate::disk::{name_matches, DiskImage};

enum Channel {
    Closed,
    Read { data: Vec<u8>, pos: usize },
    Write { name: Vec<u8>, buf: Vec<u8> },
}

pub struct ImageDrive {
    image: DiskImage,
    channels: [Channel; 16],
    error: ErrorChannel,
    /// Pending channel-15 command bytes, executed at close/unlisten.
    command: Vec<u8>,
}

impl ImageDrive {
    /// Attach a .d64/.x64 image.
    pub fn new(bytes: &[u8], writable: bool) -> Result<Self, String> {
        let image = DiskImage::from_bytes(bytes, writable)?;
        Ok(Self {
            image,
            channels: Default::default(),
            error: ErrorChannel::new(),
            command: Vec::new(),
        })
    }

    #[must_use]
    pub fn image(&self) -> &DiskImage {
        &self.image
    }

    pub fn image_mut(&mut self) -> &mut DiskImage {
        &mut self.image
    }

    fn disk_name(&self) -> Vec<u8> {
        match self.image.read_sector(18, 0) {
            Some(bam) => bam[0x90..0xA0]
                .iter()
                .copied()
                .take_while(|&b| b != 0xA0)
                .collect(),
            None => Vec::new(),
        }
    }

    /// Run a CBM DOS command that arrived on channel 15.
    fn execute_command(&mut self, cmd: &[u8]) {
        let cmd = match cmd.split_last() {
            Some((&b'\r', rest)) => rest,
            _ => cmd,
        };
        if cmd.is_empty() {
            return;
        }

        match cmd[0] {
            // Initialize: re-read the BAM (nothing cached here)
            b'I' => self.error.set(DosError::Ok, 0, 0),
            // Validate: rebuild the BAM from the directory
            b'V' => {
                if self.image.writable() {
                    self.image.validate();
                    self.error.set(DosError::Ok, 0, 0);
                } else {
                    self.error.set(DosError::WriteProtect, 0, 0);
                }
            }
            // UJ / U: reset
            b'U' => {
                self.error.set(DosError::Startup, 0, 0);
            }
            // Rename: R:NEW=OLD
            b'R' => {
                let Some(colon) = cmd.iter().position(|&b| b == b':') else {
                    self.error.set(DosError::SyntaxError, 0, 0);
                    return;
                };
                let rest = &cmd[colon + 1..];
                let Some(eq) = rest.iter().position(|&b| b == b'=') else {
                    self.error.set(DosError::SyntaxError, 0, 0);
                    return;
                };
                let (new_name, old_name) = (&rest[..eq], &rest[eq + 1..]);
                if self.image.find_file(new_name).is_some() {
                    self.error.set(DosError::FileExists, 0, 0);
                    return;
                }
                match self.image.find_file(old_name) {
                    Some(entry) => {
                        if self.image.rename(&entry, new_name) {
                            self.error.set(DosError::Ok, 0, 0);
                        } else {
                            self.error.set(DosError::WriteProtect, 0, 0);
                        }
                    }
                    None => self.error.set(DosError::FileNotFound, 0, 0),
                }
            }
            // Scratch: S:PATTERN
            b'S' => {
                let Some(colon) = cmd.iter().position(|&b| b == b':') else {
                    self.error.set(DosError::SyntaxError, 0, 0);
                    return;
                };
                let pattern = &cmd[colon + 1..];
                if !self.image.writable() {
                    self.error.set(DosError::WriteProtect, 0, 0);
                    return;
                }
                let victims: Vec<_> = self
                    .image
                    .directory()
                    .into_iter()
                    .filter(|e| e.closed && name_matches(pattern, e.name_bytes()))
                    .collect();
                let mut count = 0u8;
                for entry in &victims {
                    if self.image.scratch(entry) {
                        count += 1;
                    }
                }
                self.error.set(DosError::FilesScratched(count), 0, 0);
            }
            // New (format): N:NAME,ID
            b'N' => {
                let Some(colon) = cmd.iter().position(|&b| b == b':') else {
                    self.error.set(DosError::SyntaxError, 0, 0);
                    return;
                };
                if !self.image.writable() {
                    self.error.set(DosError::WriteProtect, 0, 0);
                    return;
                }
                let rest = &cmd[colon + 1..];
                let mut parts = rest.split(|&b| b == b',');
                let name = parts.next().unwrap_or(&[]);
                let id = parts.next().unwrap_or(b"00");
                let id = [
                    id.first().copied().unwrap_or(b'0'),
                    id.get(1).copied().unwrap_or(b'0'),
                ];
                self.image.format(name, id);
                self.error.set(DosError::Ok, 0, 0);
            }
            _ => self.error.set(DosError::SyntaxError31, 0, 0),
        }
    }
}

impl Drive for ImageDrive {
    fn open(&mut self, channel: usize, name: &[u8]) -> u8 {
        if channel == 15 {
            // An OPEN on the command channel carries a command
            self.execute_command(name);
            return ST_OK;
        }
        if channel >= 16 {
            return ST_NOTPRESENT;
        }

        // Directory pseudo-file
        if name.first() == Some(&b'$') {
            let listing = directory_listing(
                &self.disk_name(),
                self.image.disk_id(),
                &self
                    .image
                    .directory()
                    .into_iter()
                    .filter(|e| e.closed)
                    .collect::<Vec<_>>(),
                self.image.blocks_free(),
            );
            self.channels[channel] = Channel::Read {
                data: listing,
                pos: 0,
            };
            self.error.set(DosError::Ok, 0, 0);
            return ST_OK;
        }

        // Direct-access buffers are the job engine's business
        if name.first() == Some(&b'#') {
            self.error.set(DosError::NoChannel, 0, 0);
            return ST_TIMEOUT;
        }

        let (pattern, mode) = parse_filename(name);
        match mode {
            AccessMode::Read => match self.image.find_file(pattern) {
                Some(entry) => match self.image.read_file(&entry) {
                    Some(data) => {
                        self.channels[channel] = Channel::Read { data, pos: 0 };
                        self.error.set(DosError::Ok, 0, 0);
                        ST_OK
                    }
                    None => {
                        self.error.set(DosError::FileNotFound, entry.first_track, 0);
                        ST_TIMEOUT
                    }
                },
                None => {
                    self.error.set(DosError::FileNotFound, 0, 0);
                    ST_TIMEOUT
                }
            },
            AccessMode::Write => {
                if !self.image.writable() {
                    self.error.set(DosError::WriteProtect, 0, 0);
                    return ST_TIMEOUT;
                }
                if self.image.find_file(pattern).is_some() {
                    self.error.set(DosError::FileExists, 0, 0);
                    return ST_TIMEOUT;
                }
                self.channels[channel] = Channel::Write {
                    name: pattern.to_vec(),
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
        if let Channel::Write { name, buf } = ch {
            if !self.image.write_file(&name, &buf) {
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
            Channel::Write { .. } => (ST_TIMEOUT, 0),
            Channel::Closed => (ST_TIMEOUT, 0),
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

impl Default for Channel {
    fn default() -> Self {
        Channel::Closed
    }
}
