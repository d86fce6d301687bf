//! Processor-level 1541 drive: 6502 CPU over 2K RAM, 16K DOS ROM and
//! two 6522 VIAs, plus the disk surface as a spinning GCR byte stream.
//!
//! VIA1 ($1800) carries the IEC lines:
//!   PB0 DATA in, PB1 DATA out, PB2 CLK in, PB3 CLK out,
//!   PB4 ATN acknowledge (pulls DATA while ATN is low), PB7 ATN in;
//!   CA1 sees ATN edges.
//! VIA2 ($1C00) carries the mechanics:
//!   PA  head data byte, PB0-1 stepper phase, PB2 motor, PB3 LED,
//!   PB4 write-protect sense, PB7 SYNC (active-low); CB1 byte-ready,
//!   CB2 low selects write mode.
//!
//! The DOS ROM is patched like the KERNAL: the idle loop becomes
//! `$F2 00` (job-engine poll + park), the write-sector and format
//! entries become `$F2 01`/`$F2 02` so the job engine performs them at
//! sector level.

use emu_core::{Bus, PatchResult};
use log::warn;

use cpu_6510::Mos6510;

use crate::gcr;
use crate::iec::IecLines;
use crate::job::{Job1541, JobBackend, JOB_OK};
use crate::via::Via;

pub const DRIVE_RAM_SIZE: usize = 0x800;
pub const DRIVE_ROM_SIZE: usize = 0x4000;

/// Address the patched DOS idle loop parks at.
const IDLE_LOOP_ADDR: u16 = 0xEC9B;
/// Resume addresses for the write-sector and format patches.
const WRITE_SECTOR_RESUME: u16 = 0xF599;
const FORMAT_RESUME: u16 = 0xFB0E;

pub struct DriveBus {
    pub ram: Box<[u8; DRIVE_RAM_SIZE]>,
    rom: Box<[u8; DRIVE_ROM_SIZE]>,
    pub via1: Via,
    pub via2: Via,
    pub job: Job1541,
    /// Set by the idle-loop patch when the DOS has nothing to do.
    idle_request: bool,
}

impl DriveBus {
    fn new() -> Self {
        let mut bus = Self {
            ram: Box::new([0; DRIVE_RAM_SIZE]),
            rom: Box::new([0; DRIVE_ROM_SIZE]),
            via1: Via::new(),
            via2: Via::new(),
            job: Job1541::new(),
            idle_request: false,
        };
        bus.builtin_rom();
        bus.patch_rom();
        bus
    }

    /// Stub DOS: park straight in the patched idle loop so the job
    /// engine serves sector requests without a real ROM image.
    fn builtin_rom(&mut self) {
        self.rom.fill(0xEA);
        self.rom[0x3F48] = 0x40; // RTI at $FF48
        self.rom[0x3FFA] = 0x48; // NMI vector
        self.rom[0x3FFB] = 0xFF;
        self.rom[0x3FFC] = (IDLE_LOOP_ADDR & 0xFF) as u8;
        self.rom[0x3FFD] = (IDLE_LOOP_ADDR >> 8) as u8;
        self.rom[0x3FFE] = 0x48; // IRQ vector
        self.rom[0x3FFF] = 0xFF;
    }

    pub fn load_rom(&mut self, data: &[u8]) {
        if data.len() < DRIVE_ROM_SIZE {
            warn!("drive ROM image short ({} bytes), keeping stub", data.len());
            return;
        }
        self.rom.copy_from_slice(&data[..DRIVE_ROM_SIZE]);
        self.patch_rom();
    }

    /// Apply the DOS patches.
    fn patch_rom(&mut self) {
        // Skip the ROM checksum test
        self.rom[0x2AE4] = 0xEA;
        self.rom[0x2AE5] = 0xEA;
        self.rom[0x2AE8] = 0xEA;
        self.rom[0x2AE9] = 0xEA;
        // DOS idle loop -> job engine poll
        self.rom[0x2C9B] = 0xF2;
        self.rom[0x2C9C] = 0x00;
        // Write sector
        self.rom[0x3594] = 0x20;
        self.rom[0x3595] = 0xF2;
        self.rom[0x3596] = 0xF5;
        self.rom[0x3597] = 0xF2;
        self.rom[0x3598] = 0x01;
        // Format track
        self.rom[0x3B0C] = 0xF2;
        self.rom[0x3B0D] = 0x02;
    }

    /// Write one sector at the position the DOS has set up: header
    /// track/sector at $18/$19, data in the buffer the pointer at $31
    /// selects.
    fn patched_write_sector(&mut self) -> u8 {
        let track = self.ram[0x18];
        let sector = self.ram[0x19];
        let base = (usize::from(self.ram[0x31]) << 8) & 0x700;
        let base = base.clamp(0x300, 0x700);
        let mut buffer = [0u8; 256];
        buffer.copy_from_slice(&self.ram[base..base + 256]);
        self.job.run_job(0x90, track, sector, &mut buffer)
    }

    /// Format the track under the head with the ID at $12/$13.
    fn patched_format(&mut self) -> u8 {
        let track = self.job.track();
        let blank = [0u8; 256];
        for sector in 0..crate::disk::DiskImage::sectors_per_track(track) {
            let mut buffer = blank;
            let status = self.job.run_job(0x90, track, sector, &mut buffer);
            if status != JOB_OK {
                return status;
            }
        }
        JOB_OK
    }
}

impl Bus for DriveBus {
    fn read(&mut self, addr: u16) -> u8 {
        match addr {
            0x0000..=0x17FF => self.ram[(addr & 0x07FF) as usize],
            0x1800..=0x1BFF => self.via1.read((addr & 0x0F) as u8),
            0x1C00..=0x1FFF => self.via2.read((addr & 0x0F) as u8),
            0x8000..=0xFFFF => self.rom[(addr & 0x3FFF) as usize],
            _ => 0xFF,
        }
    }

    fn write(&mut self, addr: u16, value: u8) {
        match addr {
            0x0000..=0x17FF => self.ram[(addr & 0x07FF) as usize] = value,
            0x1800..=0x1BFF => self.via1.write((addr & 0x0F) as u8, value),
            0x1C00..=0x1FFF => self.via2.write((addr & 0x0F) as u8, value),
            _ => {}
        }
    }

    fn irq_level(&self) -> bool {
        self.via1.irq_line() || self.via2.irq_line()
    }

    fn patch_dispatch(&mut self, sub_op: u8, _a: u8) -> PatchResult {
        match sub_op {
            0x00 => {
                // Idle loop: run the job queue; park when it is drained
                if let Some(target) = self.job.process_queue(&mut self.ram) {
                    return PatchResult::jump(target);
                }
                let pending = self.ram[..5].iter().any(|&code| code & 0x80 != 0);
                if !pending && !self.job.head_busy() {
                    self.idle_request = true;
                }
                PatchResult::jump(IDLE_LOOP_ADDR)
            }
            0x01 => {
                let status = self.patched_write_sector();
                PatchResult {
                    a: Some(status),
                    carry: Some(status != JOB_OK),
                    resume: Some(WRITE_SECTOR_RESUME),
                }
            }
            0x02 => {
                let status = self.patched_format();
                PatchResult {
                    a: Some(status),
                    carry: Some(status != JOB_OK),
                    resume: Some(FORMAT_RESUME),
                }
            }
            _ => PatchResult::illegal(),
        }
    }
}

pub struct Drive1541 {
    pub cpu: Mos6510,
    pub bus: DriveBus,
    /// True while the DOS is parked in its idle loop; the scheduler
    /// skips the CPU until something wakes it.
    pub idle: bool,

    // Wire-level head state
    half_track: u8,
    motor_on: bool,
    led_on: bool,
    write_mode: bool,
    gcr_stream: Vec<u8>,
    gcr_pos: usize,
    byte_counter: u32,
    byte_ready: bool,
    prev_stepper: u8,
    prev_atn_low: bool,
    write_buffer: Vec<u8>,
}

impl Drive1541 {
    #[must_use]
    pub fn new() -> Self {
        let bus = DriveBus::new();
        let mut cpu = Mos6510::new();
        cpu.set_pc(IDLE_LOOP_ADDR);
        Self {
            cpu,
            bus,
            idle: false,
            half_track: 34, // track 18
            motor_on: false,
            led_on: false,
            write_mode: false,
            gcr_stream: Vec::new(),
            gcr_pos: 0,
            byte_counter: 0,
            byte_ready: false,
            prev_stepper: 0,
            prev_atn_low: false,
            write_buffer: Vec::new(),
        }
    }

    pub fn load_rom(&mut self, data: &[u8]) {
        self.bus.load_rom(data);
    }

    pub fn insert_disk(&mut self, backend: JobBackend) {
        self.bus.job.set_backend(backend);
        self.refresh_stream();
    }

    pub fn eject_disk(&mut self) {
        self.bus.job.set_backend(JobBackend::None);
        self.gcr_stream.clear();
        self.gcr_pos = 0;
    }

    #[must_use]
    pub fn has_disk(&self) -> bool {
        self.bus.job.has_disk()
    }

    #[must_use]
    pub fn track(&self) -> u8 {
        self.bus.job.track()
    }

    #[must_use]
    pub fn motor_on(&self) -> bool {
        self.motor_on
    }

    #[must_use]
    pub fn led_on(&self) -> bool {
        self.led_on
    }

    pub fn reset(&mut self) {
        self.bus.via1.reset();
        self.bus.via2.reset();
        self.cpu.reset(&mut self.bus);
        self.idle = false;
        self.bus.idle_request = false;
        self.write_buffer.clear();
    }

    /// Anything that needs the DOS (ATN, VIA interrupts) clears the
    /// parked state.
    pub fn wake(&mut self) {
        self.idle = false;
    }

    fn refresh_stream(&mut self) {
        self.gcr_stream = self.bus.job.track_stream();
        if self.gcr_pos >= self.gcr_stream.len() {
            self.gcr_pos = 0;
        }
    }

    /// Advance the VIA timers and the head-settle clock; wakes and
    /// interrupts the CPU when a VIA raises its line.
    pub fn count_via_timers(&mut self, cycles: u32, cycle_counter: u32) {
        self.bus.via1.count(cycles);
        self.bus.via2.count(cycles);
        self.bus.job.count_cycles(cycles);
        if self.bus.via1.irq_line() || self.bus.via2.irq_line() {
            self.wake();
            self.cpu.trigger_cia_irq(cycle_counter);
        } else {
            self.cpu.clear_cia_irq();
        }
    }

    /// Couple the IEC wires into VIA1 and back out.
    pub fn sync_iec(&mut self, lines: &mut IecLines) {
        // Inputs: bits read 1 when the line is pulled low, ATN in is the
        // raw level
        let mut ext = self.bus.via1.ext_b;
        ext = (ext & !0x01) | u8::from(!lines.data());
        ext = (ext & !0x04) | (u8::from(!lines.clk()) << 2);
        ext = (ext & !0x80) | (u8::from(lines.atn()) << 7);
        self.bus.via1.ext_b = ext;

        let atn_low = !lines.atn();
        if atn_low != self.prev_atn_low {
            self.bus.via1.set_ca1(atn_low);
            self.prev_atn_low = atn_low;
            if atn_low {
                self.wake();
            }
        }

        // Outputs: DATA out, CLK out, plus the ATN-acknowledge gate
        let pb = self.bus.via1.port_b_output();
        let atn_ack = pb & 0x10 != 0 && atn_low;
        lines.set_drive(pb & 0x08 != 0, pb & 0x02 != 0 || atn_ack);
    }

    /// One phi2 cycle of the drive CPU.
    pub fn emulate_cycle(&mut self, cycle_counter: u32) {
        self.cpu.emulate_cycle(&mut self.bus, cycle_counter);
        if self.bus.idle_request {
            self.bus.idle_request = false;
            self.idle = true;
        }
    }

    /// One whole instruction; returns its cycle cost (line-based mode).
    pub fn emulate_instruction(&mut self) -> u32 {
        let cycles = self.cpu.step(&mut self.bus);
        if self.bus.idle_request {
            self.bus.idle_request = false;
            self.idle = true;
        }
        cycles
    }

    /// Advance the disk surface: mechanics from VIA2, byte-rate GCR
    /// streaming into (or out of) the head data port.
    pub fn spin(&mut self, cycles: u32) {
        self.update_mechanics();
        if !self.motor_on {
            return;
        }
        if self.gcr_stream.is_empty() {
            self.refresh_stream();
            if self.gcr_stream.is_empty() {
                return;
            }
        }

        let track = self.bus.job.track();
        let cpb = gcr::cycles_per_byte(track);
        self.byte_counter += cycles;

        while self.byte_counter >= cpb {
            self.byte_counter -= cpb;

            if self.write_mode {
                // Capture what the DOS shifts out through port A
                let byte = self.bus.via2.port_a_output();
                if self.gcr_pos < self.gcr_stream.len() {
                    self.gcr_stream[self.gcr_pos] = byte;
                }
                self.write_buffer.push(byte);
            } else {
                let byte = self.gcr_stream[self.gcr_pos];
                self.bus.via2.ext_a = byte;
                // SYNC detect is active-low on PB7
                let in_sync = byte == 0xFF;
                self.bus.via2.ext_b =
                    (self.bus.via2.ext_b & !0x80) | if in_sync { 0 } else { 0x80 };
            }

            self.gcr_pos += 1;
            if self.gcr_pos >= self.gcr_stream.len() {
                self.gcr_pos = 0;
            }

            // Byte-ready pulse on CB1
            self.byte_ready = !self.byte_ready;
            self.bus.via2.set_cb1(self.byte_ready);
        }
    }

    /// Decode VIA2 port B into motor/LED/stepper/write state.
    fn update_mechanics(&mut self) {
        let pb = self.bus.via2.port_b_output();
        self.motor_on = pb & 0x04 != 0;
        self.led_on = pb & 0x08 != 0;

        let phase = pb & 0x03;
        if phase != self.prev_stepper {
            self.step_head(phase);
        }

        // Write-protect sense: low when protected or no disk
        let wp = if self.has_disk() && self.bus.job.writable() {
            0x10
        } else {
            0x00
        };
        self.bus.via2.ext_b = (self.bus.via2.ext_b & !0x10) | wp;

        let was_writing = self.write_mode;
        self.write_mode = self.bus.via2.cb2_manual() == Some(false);
        if was_writing && !self.write_mode {
            self.flush_write_buffer();
        }
    }

    /// Four-phase stepper: +1 phase steps inward, -1 outward.
    fn step_head(&mut self, new_phase: u8) {
        let delta = (i16::from(new_phase) - i16::from(self.prev_stepper)).rem_euclid(4);
        match delta {
            1 if self.half_track < 69 => self.half_track += 1,
            3 if self.half_track > 0 => self.half_track -= 1,
            _ => {}
        }
        self.prev_stepper = new_phase;

        let new_track = self.half_track / 2 + 1;
        if new_track != self.bus.job.track() {
            self.bus.job.set_track(new_track);
            // Half-track positions read as noise: no sync marks
            if self.half_track & 1 != 0 {
                self.gcr_stream = vec![0x00; 7692];
                self.gcr_pos = 0;
            } else {
                self.refresh_stream();
            }
        }
    }

    /// On leaving write mode, scan what the head wrote for data blocks
    /// and fold them back into the backend.
    fn flush_write_buffer(&mut self) {
        if self.write_buffer.is_empty() || !self.has_disk() {
            self.write_buffer.clear();
            return;
        }
        let track = self.bus.job.track();
        let buf = std::mem::take(&mut self.write_buffer);

        // The data block follows the last header the head saw; find the
        // sector by scanning the stream backwards for a header block.
        let sector = self.last_header_sector();

        let mut i = 0;
        while i + 5 + gcr::DATA_BLOCK_GCR <= buf.len() {
            if buf[i..i + 5].iter().all(|&b| b == 0xFF) {
                let start = i + 5;
                if let Ok(payload) = gcr::decode_data_block(&buf[start..start + gcr::DATA_BLOCK_GCR])
                {
                    if let Some(sector) = sector {
                        let mut payload = payload;
                        let status = self.bus.job.run_job(0x90, track, sector, &mut payload);
                        if status != JOB_OK {
                            warn!("wire-level write to {track}/{sector} failed: {status:#04x}");
                        }
                    }
                }
                i = start + gcr::DATA_BLOCK_GCR;
            } else {
                i += 1;
            }
        }
        self.refresh_stream();
    }

    /// Sector number of the most recent header before the head position.
    fn last_header_sector(&self) -> Option<u8> {
        if self.gcr_stream.is_empty() {
            return None;
        }
        let len = self.gcr_stream.len();
        for back in 0..len {
            let pos = (self.gcr_pos + len - back) % len;
            if self.gcr_stream[pos] != 0xFF {
                continue;
            }
            let hdr_start = (pos + 1) % len;
            let mut header = [0u8; 10];
            for (k, h) in header.iter_mut().enumerate() {
                *h = self.gcr_stream[(hdr_start + k) % len];
            }
            if let Some(hdr) = gcr::decode_header(&header) {
                return Some(hdr.sector);
            }
        }
        None
    }

    // -----------------------------------------------------------------
    // Snapshot
    // -----------------------------------------------------------------

    pub fn save_state(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.bus.ram.as_ref());
        let s = self.cpu.get_state();
        out.extend_from_slice(&[s.a, s.x, s.y, s.sp]);
        out.extend_from_slice(&s.pc.to_le_bytes());
        out.push(s.p);
        let mut intr = 0u8;
        for (i, &pending) in s.interrupt.iter().enumerate() {
            if pending {
                intr |= 1 << i;
            }
        }
        out.push(intr);
        out.push(
            u8::from(s.nmi_state)
                | (u8::from(s.instruction_complete) << 1)
                | (u8::from(self.idle) << 2),
        );
        self.bus.via1.save_state(out);
        self.bus.via2.save_state(out);
    }

    pub const STATE_SIZE: usize = DRIVE_RAM_SIZE + 9 + 2 * Via::STATE_SIZE;

    pub fn load_state(&mut self, data: &[u8]) -> Result<(), String> {
        if data.len() < Self::STATE_SIZE {
            return Err("1541 state truncated".into());
        }
        self.bus.ram.copy_from_slice(&data[..DRIVE_RAM_SIZE]);
        let r = &data[DRIVE_RAM_SIZE..];
        let mut state = cpu_6510::CpuState {
            a: r[0],
            x: r[1],
            y: r[2],
            sp: r[3],
            pc: u16::from_le_bytes([r[4], r[5]]),
            p: r[6],
            interrupt: [false; 4],
            nmi_state: r[8] & 1 != 0,
            instruction_complete: r[8] & 2 != 0,
        };
        for i in 0..4 {
            state.interrupt[i] = r[7] & (1 << i) != 0;
        }
        self.cpu.set_state(&state);
        self.idle = r[8] & 4 != 0;
        let via_at = DRIVE_RAM_SIZE + 9;
        self.bus.via1.load_state(&data[via_at..])?;
        self.bus.via2.load_state(&data[via_at + Via::STATE_SIZE..])?;
        self.refresh_stream();
        Ok(())
    }
}

impl Default for Drive1541 {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::DiskImage;

    fn drive_with_disk() -> Drive1541 {
        let mut image = DiskImage::blank(b"WIRETEST", [0x41, 0x42]);
        let mut sector = [0u8; 256];
        sector[0] = 0x99;
        assert!(image.write_sector(18, 0, &sector));
        let mut drive = Drive1541::new();
        drive.insert_disk(JobBackend::Image(image));
        drive
    }

    #[test]
    fn stub_rom_parks_in_idle_loop() {
        let mut drive = Drive1541::new();
        drive.reset();
        assert_eq!(drive.cpu.pc(), IDLE_LOOP_ADDR);
        drive.emulate_instruction();
        assert!(drive.idle);
    }

    #[test]
    fn job_write_read_through_patches() {
        let mut drive = drive_with_disk();
        drive.reset();

        // Queue a read job for track 18 sector 0 in buffer 0
        drive.bus.ram[0] = 0x80;
        drive.bus.ram[6] = 18;
        drive.bus.ram[7] = 0;
        drive.idle = false;
        for _ in 0..8 {
            drive.emulate_instruction();
        }
        assert_eq!(drive.bus.ram[0], JOB_OK);
        assert_eq!(drive.bus.ram[0x300], 0x99);
    }

    #[test]
    fn atn_edge_wakes_the_drive() {
        let mut drive = drive_with_disk();
        drive.reset();
        drive.emulate_instruction();
        assert!(drive.idle);

        let mut lines = IecLines::new();
        drive.sync_iec(&mut lines); // ATN high: stays idle
        assert!(drive.idle);

        lines.set_c64(true, false, false);
        drive.sync_iec(&mut lines);
        assert!(!drive.idle);
    }

    #[test]
    fn motor_streams_bytes_into_via2() {
        let mut drive = drive_with_disk();
        // Motor on via VIA2 port B
        drive.bus.via2.write(0x02, 0x0F); // DDRB
        drive.bus.via2.write(0x00, 0x04); // motor bit

        drive.spin(gcr::cycles_per_byte(18) * 2);
        // The stream starts with a sync run
        assert_eq!(drive.bus.via2.ext_a, 0xFF);
        assert_eq!(drive.bus.via2.ext_b & 0x80, 0); // SYNC active-low
        assert!(drive.gcr_pos > 0);
    }

    #[test]
    fn stepper_moves_head() {
        let mut drive = drive_with_disk();
        drive.bus.via2.write(0x02, 0x0F);
        assert_eq!(drive.track(), 18);

        // Two half-track steps inward
        drive.bus.via2.write(0x00, 0x01);
        drive.update_mechanics();
        drive.bus.via2.write(0x00, 0x02);
        drive.update_mechanics();
        assert_eq!(drive.track(), 19);
    }

    #[test]
    fn state_round_trip() {
        let mut drive = drive_with_disk();
        drive.reset();
        drive.bus.ram[0x100] = 0xAB;
        drive.emulate_instruction();

        let mut blob = Vec::new();
        drive.save_state(&mut blob);
        assert_eq!(blob.len(), Drive1541::STATE_SIZE);

        let mut other = Drive1541::new();
        other.load_state(&blob).expect("loads");
        assert_eq!(other.bus.ram[0x100], 0xAB);
        assert_eq!(other.idle, drive.idle);
        assert_eq!(other.cpu.pc(), drive.cpu.pc());
    }
}
