//! IEC serial bus.
//!
//! Two layers:
//! - [`IecLines`]: the three open-collector wires (ATN, CLK, DATA). Each
//!   participant contributes a pull-down; a line reads high only when
//!   nobody pulls it. This is the wire level the full 1541 model uses.
//! - [`Iec`]: the protocol level behind the fast KERNAL patches. Eight
//!   sub-commands replace the serial routines and talk to the attached
//!   drives' channel interfaces directly.

use std::path::Path;

use log::warn;

use crate::drive::{ArchiveDrive, Drive, FsDrive, ImageDrive, ST_NOTPRESENT, ST_TIMEOUT};

/// The three bus wires as wired-OR pull-downs: index 0 = C64 side,
/// index 1 = drive side.
#[derive(Debug, Clone, Copy, Default)]
pub struct IecLines {
    atn_pulls: [bool; 2],
    clk_pulls: [bool; 2],
    data_pulls: [bool; 2],
}

impl IecLines {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_c64(&mut self, atn: bool, clk: bool, data: bool) {
        self.atn_pulls[0] = atn;
        self.clk_pulls[0] = clk;
        self.data_pulls[0] = data;
    }

    pub fn set_drive(&mut self, clk: bool, data: bool) {
        self.clk_pulls[1] = clk;
        self.data_pulls[1] = data;
    }

    /// Line levels; true = high (released).
    #[must_use]
    pub fn atn(&self) -> bool {
        !self.atn_pulls[0] && !self.atn_pulls[1]
    }

    #[must_use]
    pub fn clk(&self) -> bool {
        !self.clk_pulls[0] && !self.clk_pulls[1]
    }

    #[must_use]
    pub fn data(&self) -> bool {
        !self.data_pulls[0] && !self.data_pulls[1]
    }
}

/// How a bus participant is currently addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum BusState {
    #[default]
    Idle,
    Listening,
    Talking,
}

/// Protocol-level IEC with up to four attached drives (devices 8..11).
pub struct Iec {
    drives: [Option<Box<dyn Drive>>; 4],
    state: BusState,
    /// Addressed device (0..3) while listening/talking.
    device: usize,
    /// Current secondary address (channel).
    sec_addr: u8,
    /// Collecting an OPEN filename until the unlisten.
    opening: bool,
    name_buf: Vec<u8>,
}

impl Iec {
    #[must_use]
    pub fn new() -> Self {
        Self {
            drives: Default::default(),
            state: BusState::Idle,
            device: 0,
            sec_addr: 0,
            opening: false,
            name_buf: Vec::new(),
        }
    }

    /// Attach a drive by path: a directory, a disk image, or an archive.
    /// An empty path detaches the device.
    pub fn attach(&mut self, device: usize, path: &str, data: Option<&[u8]>) {
        if device >= 4 {
            return;
        }
        if path.is_empty() {
            self.drives[device] = None;
            return;
        }

        let lower = path.to_ascii_lowercase();
        let drive: Option<Box<dyn Drive>> = if let Some(bytes) = data {
            Self::drive_from_bytes(&lower, bytes)
        } else if Path::new(path).is_dir() {
            Some(Box::new(FsDrive::new(Path::new(path))))
        } else {
            match std::fs::read(path) {
                Ok(bytes) => Self::drive_from_bytes(&lower, &bytes),
                Err(e) => {
                    warn!("cannot attach {path}: {e}");
                    None
                }
            }
        };
        self.drives[device] = drive;
    }

    fn drive_from_bytes(lower_path: &str, bytes: &[u8]) -> Option<Box<dyn Drive>> {
        let result: Result<Box<dyn Drive>, String> =
            if lower_path.ends_with(".d64") || lower_path.ends_with(".x64") {
                ImageDrive::new(bytes, true).map(|d| Box::new(d) as Box<dyn Drive>)
            } else if lower_path.ends_with(".t64") || lower_path.ends_with(".lnx") {
                ArchiveDrive::new(bytes).map(|d| Box::new(d) as Box<dyn Drive>)
            } else {
                // Sniff: images by size, archives by signature
                ImageDrive::new(bytes, true)
                    .map(|d| Box::new(d) as Box<dyn Drive>)
                    .or_else(|_| ArchiveDrive::new(bytes).map(|d| Box::new(d) as Box<dyn Drive>))
            };
        match result {
            Ok(d) => Some(d),
            Err(e) => {
                warn!("cannot attach {lower_path}: {e}");
                None
            }
        }
    }

    /// Direct access to an attached drive (tests, host tooling).
    pub fn drive_mut(&mut self, device: usize) -> Option<&mut Box<dyn Drive>> {
        self.drives.get_mut(device).and_then(|d| d.as_mut())
    }

    pub fn attach_drive(&mut self, device: usize, drive: Box<dyn Drive>) {
        if device < 4 {
            self.drives[device] = Some(drive);
        }
    }

    pub fn reset(&mut self) {
        self.state = BusState::Idle;
        self.opening = false;
        self.name_buf.clear();
        for drive in self.drives.iter_mut().flatten() {
            drive.reset();
        }
    }

    // -----------------------------------------------------------------
    // The eight fast-path operations ($F2 sub-commands)
    // -----------------------------------------------------------------

    /// Sub 0x00: data byte out to the current listener. `eoi` marks the
    /// last byte of the transfer.
    pub fn out(&mut self, byte: u8, eoi: bool) -> u8 {
        if self.state != BusState::Listening {
            return ST_TIMEOUT;
        }
        let device = self.device;
        let Some(drive) = self.drives[device].as_mut() else {
            return ST_NOTPRESENT;
        };
        if self.opening {
            self.name_buf.push(byte);
            return 0;
        }
        drive.write((self.sec_addr & 0x0F) as usize, byte, eoi)
    }

    /// Sub 0x01: command byte out under ATN (TALK/LISTEN addressing).
    pub fn out_atn(&mut self, byte: u8) -> u8 {
        match byte & 0xF0 {
            0x20 => {
                // LISTEN
                let device = (byte & 0x0F) as usize;
                if !(8..12).contains(&device) {
                    return ST_NOTPRESENT;
                }
                self.device = device - 8;
                if self.drives[self.device].is_none() {
                    self.state = BusState::Idle;
                    return ST_NOTPRESENT;
                }
                self.state = BusState::Listening;
                0
            }
            0x30 => {
                // UNLISTEN completes a pending OPEN
                let status = self.finish_open();
                self.state = BusState::Idle;
                status
            }
            0x40 => {
                // TALK
                let device = (byte & 0x0F) as usize;
                if !(8..12).contains(&device) {
                    return ST_NOTPRESENT;
                }
                self.device = device - 8;
                if self.drives[self.device].is_none() {
                    self.state = BusState::Idle;
                    return ST_NOTPRESENT;
                }
                self.state = BusState::Talking;
                0
            }
            0x50 => {
                // UNTALK
                self.state = BusState::Idle;
                0
            }
            _ => ST_TIMEOUT,
        }
    }

    /// Sub 0x02: secondary address out. $6x selects a data channel,
    /// $Ex closes, $Fx begins an OPEN.
    pub fn out_sec(&mut self, byte: u8) -> u8 {
        self.sec_addr = byte;
        let channel = (byte & 0x0F) as usize;
        match byte & 0xF0 {
            0xF0 => {
                self.opening = true;
                self.name_buf.clear();
                0
            }
            0xE0 => {
                let device = self.device;
                match self.drives[device].as_mut() {
                    Some(drive) => drive.close(channel),
                    None => ST_NOTPRESENT,
                }
            }
            _ => 0,
        }
    }

    /// Sub 0x03: byte in from the current talker. Returns (status, byte);
    /// the EOI status bit travels back through the carry flag.
    pub fn byte_in(&mut self) -> (u8, u8) {
        if self.state != BusState::Talking {
            return (ST_TIMEOUT, 0);
        }
        let device = self.device;
        let sec = (self.sec_addr & 0x0F) as usize;
        match self.drives[device].as_mut() {
            Some(drive) => drive.read(sec),
            None => (ST_NOTPRESENT, 0),
        }
    }

    /// Sub 0x04: assert ATN. The protocol layer has nothing to latch.
    pub fn set_atn(&mut self) {}

    /// Sub 0x05: release ATN.
    pub fn rel_atn(&mut self) {}

    /// Sub 0x06: turn-around, C64 listener becomes talker.
    pub fn turnaround(&mut self) {}

    /// Sub 0x07: release all lines.
    pub fn release(&mut self) {
        self.state = BusState::Idle;
    }

    /// A pending OPEN completes at the unlisten: hand the collected
    /// filename to the drive.
    fn finish_open(&mut self) -> u8 {
        if !self.opening {
            return 0;
        }
        self.opening = false;
        let name = std::mem::take(&mut self.name_buf);
        let channel = (self.sec_addr & 0x0F) as usize;
        let device = self.device;
        match self.drives[device].as_mut() {
            Some(drive) => drive.open(channel, &name),
            None => ST_NOTPRESENT,
        }
    }
}

impl Default for Iec {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::DiskImage;
    use crate::drive::{ST_EOF, ST_OK};

    fn iec_with_d64(name: &[u8], payload: &[u8]) -> Iec {
        let mut image = DiskImage::blank(b"BUSTEST", [0x41, 0x42]);
        assert!(image.write_file(name, payload));
        let mut iec = Iec::new();
        iec.attach(0, "test.d64", Some(&image.to_bytes()));
        iec
    }

    /// Drive the bus the way the patched KERNAL does for OPEN+READ.
    fn open_channel(iec: &mut Iec, device: u8, channel: u8, name: &[u8]) {
        assert_eq!(iec.out_atn(0x20 | device), 0); // LISTEN
        assert_eq!(iec.out_sec(0xF0 | channel), 0); // OPEN
        for &b in name {
            assert_eq!(iec.out(b, false), 0);
        }
        assert_eq!(iec.out_atn(0x3F), 0); // UNLISTEN performs the open
    }

    #[test]
    fn wired_or_lines() {
        let mut lines = IecLines::new();
        assert!(lines.atn() && lines.clk() && lines.data());

        lines.set_c64(false, true, false);
        assert!(!lines.clk());
        lines.set_drive(true, false);
        lines.set_c64(false, false, false);
        assert!(!lines.clk()); // drive still holds it
        lines.set_drive(false, false);
        assert!(lines.clk());
    }

    #[test]
    fn open_read_sequence() {
        let payload = [0x01, 0x08, 0x0B, 0x08, 0x0A, 0x00];
        let mut iec = iec_with_d64(b"HELLO", &payload);

        open_channel(&mut iec, 8, 0, b"HELLO");
        assert_eq!(iec.out_atn(0x48), 0); // TALK 8
        assert_eq!(iec.out_sec(0x60), 0); // channel 0

        let mut bytes = Vec::new();
        loop {
            let (st, byte) = iec.byte_in();
            bytes.push(byte);
            if st & ST_EOF != 0 {
                break;
            }
            assert_eq!(st, ST_OK);
        }
        assert_eq!(bytes, payload);
        assert_eq!(iec.out_atn(0x5F), 0); // UNTALK
    }

    #[test]
    fn status_channel_over_bus() {
        let mut iec = iec_with_d64(b"X", &[0]);
        // Read channel 15 without any command: startup message
        assert_eq!(iec.out_atn(0x48), 0);
        assert_eq!(iec.out_sec(0x6F), 0);
        let mut text = Vec::new();
        loop {
            let (st, byte) = iec.byte_in();
            text.push(byte);
            if st & ST_EOF != 0 {
                break;
            }
        }
        assert!(text.starts_with(b"73"));
    }

    #[test]
    fn absent_device_reports_not_present() {
        let mut iec = Iec::new();
        assert_eq!(iec.out_atn(0x29), ST_NOTPRESENT); // LISTEN 9, nothing there
        assert_eq!(iec.out_atn(0x2F), ST_NOTPRESENT); // device 15 invalid
    }

    #[test]
    fn close_through_bus() {
        let mut iec = iec_with_d64(b"HELLO", &[1, 2, 3]);
        open_channel(&mut iec, 8, 2, b"HELLO");
        assert_eq!(iec.out_atn(0x28), 0);
        assert_eq!(iec.out_sec(0xE2), 0); // CLOSE channel 2
        assert_eq!(iec.out_atn(0x3F), 0);
    }
}
