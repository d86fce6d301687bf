//! The machine: chip assembly, the two scheduler paths, VBlank
//! housekeeping, reset, and snapshots.
//!
//! Per phi2 cycle the order is fixed: VIC, CIA1, CIA2, CPU, then the
//! drive. Test programs rely on the VIC updating its raster comparator
//! before the CPU samples the IRQ line on the same cycle.

use emu_core::{AudioConfig, Host, HostControl, VideoConfig};
use log::warn;

use cpu_6510::Mos6510;

use crate::bus::C64Bus;
use crate::disk::DiskImage;
use crate::drive1541::Drive1541;
use crate::job::{G64Image, JobBackend};
use crate::prefs::{Prefs, Timing};
use crate::snapshot::{self, Reader, SNAPSHOT_1541};
use crate::vic::{DISPLAY_HEIGHT, DISPLAY_WIDTH};

pub struct C64 {
    pub bus: C64Bus,
    pub cpu: Mos6510,
    pub drive: Drive1541,

    prefs: Prefs,
    pending_prefs: Option<Prefs>,

    cycle_counter: u32,
    quit: bool,
    /// Joystick-emulation key mask from the host keyboard.
    joykey: u8,
    audio_buf: Vec<i16>,
}

impl C64 {
    #[must_use]
    pub fn new(prefs: Prefs) -> Self {
        let mut c64 = Self {
            bus: C64Bus::new(prefs.sample_rate, prefs.tod_divider()),
            cpu: Mos6510::new(),
            drive: Drive1541::new(),
            prefs: Prefs::default(),
            pending_prefs: None,
            cycle_counter: 0,
            quit: false,
            joykey: 0xFF,
            audio_buf: Vec::new(),
        };
        c64.apply_prefs(prefs);
        c64.cpu.reset(&mut c64.bus);
        c64.drive.reset();
        c64
    }

    // -----------------------------------------------------------------
    // ROMs and media
    // -----------------------------------------------------------------

    pub fn load_basic(&mut self, data: &[u8]) {
        self.bus.mem.load_basic(data);
    }

    pub fn load_kernal(&mut self, data: &[u8]) {
        self.bus.mem.load_kernal(data);
        self.bus
            .mem
            .patch_kernal(self.prefs.fast_reset, self.prefs.emul_1541_proc);
    }

    pub fn load_chargen(&mut self, data: &[u8]) {
        self.bus.mem.load_chargen(data);
    }

    pub fn load_drive_rom(&mut self, data: &[u8]) {
        self.drive.load_rom(data);
    }

    /// Attach media to a device from in-memory bytes: both the fast-IEC
    /// channel layer and, for sector/GCR images on device 8, the
    /// wire-level drive.
    pub fn attach_image(&mut self, device: usize, path: &str, bytes: &[u8]) {
        self.bus.iec.attach(device, path, Some(bytes));
        if device == 0 {
            let lower = path.to_ascii_lowercase();
            if lower.ends_with(".g64") {
                match G64Image::from_bytes(bytes, true) {
                    Ok(g64) => self.drive.insert_disk(JobBackend::G64(g64)),
                    Err(e) => warn!("cannot attach {path} to the drive unit: {e}"),
                }
            } else {
                match DiskImage::from_bytes(bytes, true) {
                    Ok(image) => self.drive.insert_disk(JobBackend::Image(image)),
                    Err(e) => warn!("cannot attach {path} to the drive unit: {e}"),
                }
            }
        }
    }

    // -----------------------------------------------------------------
    // Host control surface
    // -----------------------------------------------------------------

    /// Soft reset, as if the CPU saw the RESET line.
    pub fn reset(&mut self) {
        self.cpu.async_reset();
        self.drive.reset();
        self.bus.sid.reset();
        self.bus.cia1.reset();
        self.bus.cia2.reset();
        self.bus.iec.reset();
        self.bus.mem.reset();
    }

    /// Pulse the NMI line (Restore key).
    pub fn nmi(&mut self) {
        self.cpu.trigger_nmi(self.cycle_counter);
        self.cpu.clear_nmi();
    }

    /// Hand over a new preference set; it becomes active at the next
    /// frame boundary so no chip sees a half-applied configuration.
    pub fn set_prefs(&mut self, prefs: Prefs) {
        self.pending_prefs = Some(prefs);
    }

    #[must_use]
    pub fn prefs(&self) -> &Prefs {
        &self.prefs
    }

    #[must_use]
    pub fn video_config(&self) -> VideoConfig {
        VideoConfig {
            width: DISPLAY_WIDTH as u32,
            height: DISPLAY_HEIGHT as u32,
            fps: self.prefs.frame_rate(),
        }
    }

    #[must_use]
    pub fn audio_config(&self) -> AudioConfig {
        AudioConfig {
            sample_rate: self.prefs.sample_rate,
            samples_per_frame: self.samples_per_frame(),
        }
    }

    fn samples_per_frame(&self) -> usize {
        (self.prefs.sample_rate as f32 / self.prefs.frame_rate()).ceil() as usize
    }

    /// The finished frame (palette indices).
    #[must_use]
    pub fn frame(&self) -> &[u8] {
        self.bus.vic.frame()
    }

    /// Enter the emulation loop; returns when the host requests quit.
    pub fn run(&mut self, host: &mut dyn Host) {
        self.quit = false;
        while !self.quit {
            self.emulate_frame(host);
        }
    }

    /// Emulate exactly one frame, then do VBlank housekeeping.
    pub fn emulate_frame(&mut self, host: &mut dyn Host) {
        match self.prefs.timing {
            Timing::Cycle => loop {
                if self.emulate_cycle_step() {
                    break;
                }
            },
            Timing::Line => loop {
                if self.emulate_line_step() {
                    break;
                }
            },
        }
        self.vblank(host);
    }

    fn apply_prefs(&mut self, prefs: Prefs) {
        self.bus
            .mem
            .patch_kernal(prefs.fast_reset, prefs.emul_1541_proc);
        self.bus.vic.configure(
            prefs.ntsc,
            prefs.normal_cycles,
            prefs.bad_line_cycles,
            prefs.sprites_on,
            prefs.sprite_collisions,
        );
        self.bus.sid.apply_prefs(&prefs);

        for device in 0..4 {
            if prefs.drive_path[device] != self.prefs.drive_path[device] {
                self.bus.iec.attach(device, &prefs.drive_path[device], None);
                if device == 0 {
                    self.attach_drive_unit(&prefs.drive_path[device]);
                }
            }
        }

        // Switching the processor-level drive on resets it
        if prefs.emul_1541_proc && !self.prefs.emul_1541_proc {
            self.drive.reset();
        }

        self.prefs = prefs;
    }

    /// Point the wire-level drive unit at the device-8 path.
    fn attach_drive_unit(&mut self, path: &str) {
        if path.is_empty() {
            self.drive.eject_disk();
            return;
        }
        let lower = path.to_ascii_lowercase();
        let backend = match std::fs::read(path) {
            Ok(bytes) if lower.ends_with(".g64") => {
                G64Image::from_bytes(&bytes, true).map(JobBackend::G64)
            }
            Ok(bytes) => DiskImage::from_bytes(&bytes, true).map(JobBackend::Image),
            Err(e) => Err(e.to_string()),
        };
        match backend {
            Ok(b) => self.drive.insert_disk(b),
            Err(e) => {
                warn!("cannot attach {path} to the drive unit: {e}");
                self.drive.eject_disk();
            }
        }
    }

    // -----------------------------------------------------------------
    // Scheduler
    // -----------------------------------------------------------------

    /// Sample every interrupt line into the CPU's pending vector.
    fn sample_interrupt_lines(&mut self) {
        let cc = self.cycle_counter;
        if self.bus.vic.irq_line() {
            self.cpu.trigger_vic_irq(cc);
        } else {
            self.cpu.clear_vic_irq();
        }
        if self.bus.cia1.irq_line() {
            self.cpu.trigger_cia_irq(cc);
        } else {
            self.cpu.clear_cia_irq();
        }
        if self.bus.cia2.irq_line() {
            self.cpu.trigger_nmi(cc);
        } else {
            self.cpu.clear_nmi();
        }
    }

    /// One phi2 tick of the whole machine. Returns true at frame end.
    fn emulate_cycle_step(&mut self) -> bool {
        let r = self.bus.vic.emulate_cycle(&self.bus.mem);
        if r.line_done {
            self.bus.sid.emulate_line();
        }
        self.bus.ba_low = self.bus.vic.ba_low();

        self.sample_interrupt_lines();
        self.bus.cia1.step();
        self.bus.cia2.step();

        self.cpu.emulate_cycle(&mut self.bus, self.cycle_counter);

        if self.prefs.emul_1541_proc {
            self.drive.sync_iec(&mut self.bus.iec_lines);
            self.drive.count_via_timers(1, self.cycle_counter);
            if !self.drive.idle {
                self.drive.emulate_cycle(self.cycle_counter);
            }
            self.drive.spin(1);
            self.drive.sync_iec(&mut self.bus.iec_lines);
        }

        self.cycle_counter = self.cycle_counter.wrapping_add(1);
        r.frame_done
    }

    /// One raster line of the whole machine. Returns true at frame end.
    fn emulate_line_step(&mut self) -> bool {
        let lr = self.bus.vic.emulate_line(&self.bus.mem);
        self.bus.sid.emulate_line();
        self.bus.cia1.emulate_line(self.prefs.cia_cycles);
        self.bus.cia2.emulate_line(self.prefs.cia_cycles);
        self.bus.ba_low = false;

        self.sample_interrupt_lines();

        if self.prefs.emul_1541_proc {
            self.drive.sync_iec(&mut self.bus.iec_lines);
            let floppy_cycles = self.prefs.floppy_cycles;
            self.drive
                .count_via_timers(floppy_cycles.max(0) as u32, self.cycle_counter);
            self.drive.spin(floppy_cycles.max(0) as u32);

            if self.drive.idle {
                self.cpu.emulate_line(&mut self.bus, lr.cycles);
            } else {
                // Both processors active: alternate instructions until
                // each has used its budget for the line
                let mut cycles = lr.cycles;
                let mut cycles_1541 = floppy_cycles;
                while cycles > 0 || cycles_1541 > 0 {
                    if cycles > cycles_1541 {
                        cycles -= self.cpu.step(&mut self.bus) as i32;
                    } else {
                        cycles_1541 -= self.drive.emulate_instruction() as i32;
                        if self.drive.idle {
                            cycles_1541 = 0;
                        }
                    }
                }
            }
            self.drive.sync_iec(&mut self.bus.iec_lines);
        } else {
            self.cpu.emulate_line(&mut self.bus, lr.cycles);
        }

        self.cycle_counter = self
            .cycle_counter
            .wrapping_add(self.prefs.cycles_per_line());
        lr.frame_done
    }

    /// VBlank housekeeping: input polling, TOD ticks, audio and frame
    /// delivery, deferred preference swap.
    fn vblank(&mut self, host: &mut dyn Host) {
        host.poll_keyboard(
            &mut self.bus.input.matrix,
            &mut self.bus.input.rev_matrix,
            &mut self.joykey,
        );

        let mut joy1 = host.poll_joystick(0);
        let mut joy2 = host.poll_joystick(1);
        if self.prefs.joystick_swap {
            std::mem::swap(&mut joy1, &mut joy2);
        }
        self.bus.input.joystick1 = joy1;
        self.bus.input.joystick2 = joy2 & self.joykey;

        self.bus.cia1.count_tod();
        self.bus.cia2.count_tod();

        let samples = self.samples_per_frame();
        self.audio_buf.resize(samples, 0);
        self.bus.sid.calc_buffer(&mut self.audio_buf);
        host.push_audio(&self.audio_buf);

        host.present_frame(self.bus.vic.frame(), DISPLAY_WIDTH);
        if host.frame_done() == HostControl::Quit {
            self.quit = true;
        }

        if let Some(prefs) = self.pending_prefs.take() {
            self.apply_prefs(prefs);
        }
    }

    // -----------------------------------------------------------------
    // Snapshots
    // -----------------------------------------------------------------

    /// Advance every chip except the CPU's instruction stream by one
    /// cycle; used to roll the machine to an instruction boundary.
    fn advance_cycle_for_snapshot(&mut self) {
        let r = self.bus.vic.emulate_cycle(&self.bus.mem);
        if r.line_done {
            self.bus.sid.emulate_line();
        }
        self.bus.ba_low = self.bus.vic.ba_low();
        self.bus.cia1.step();
        self.bus.cia2.step();
        self.cpu.emulate_cycle(&mut self.bus, self.cycle_counter);
        if self.prefs.emul_1541_proc {
            self.drive.count_via_timers(1, self.cycle_counter);
            if !self.drive.idle {
                self.drive.emulate_cycle(self.cycle_counter);
            }
        }
        self.cycle_counter = self.cycle_counter.wrapping_add(1);
    }

    fn save_cpu_block(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.bus.mem.ram.as_ref());
        out.extend_from_slice(self.bus.mem.color_ram.as_ref());

        let s = self.cpu.get_state();
        out.extend_from_slice(&[
            s.a,
            s.x,
            s.y,
            s.p,
            self.bus.mem.port_ddr,
            self.bus.mem.port_data,
        ]);
        out.extend_from_slice(&s.pc.to_le_bytes());
        out.push(s.sp);
        let mut intr = 0u8;
        for (i, &pending) in s.interrupt.iter().enumerate() {
            if pending {
                intr |= 1 << i;
            }
        }
        out.push(intr);
        out.push(u8::from(s.nmi_state) | (u8::from(s.instruction_complete) << 1));
        out.push(self.bus.mem.dfff_byte);
    }

    fn load_cpu_block(&mut self, reader: &mut Reader) -> Result<(), String> {
        let ram = reader.take(0x10000)?;
        self.bus.mem.ram.copy_from_slice(ram);
        let color = reader.take(0x400)?;
        self.bus.mem.color_ram.copy_from_slice(color);

        let regs = reader.take(12)?;
        let state = cpu_6510::CpuState {
            a: regs[0],
            x: regs[1],
            y: regs[2],
            p: regs[3],
            pc: u16::from_le_bytes([regs[6], regs[7]]),
            sp: regs[8],
            interrupt: [
                regs[9] & 1 != 0,
                regs[9] & 2 != 0,
                regs[9] & 4 != 0,
                regs[9] & 8 != 0,
            ],
            nmi_state: regs[10] & 1 != 0,
            instruction_complete: regs[10] & 2 != 0,
        };
        self.cpu.set_state(&state);
        self.bus.mem.port_ddr = regs[4];
        self.bus.mem.port_data = regs[5];
        self.bus.mem.dfff_byte = regs[11];
        self.bus.mem.rebuild_map();
        Ok(())
    }

    /// Serialize the machine. In cycle-accurate mode the machine is
    /// first advanced to the CPU's next instruction boundary; the cycle
    /// count it took is stored as the delay byte.
    pub fn save_snapshot(&mut self) -> Vec<u8> {
        let mut flags = 0;
        if self.prefs.emul_1541_proc {
            flags |= SNAPSHOT_1541;
        }
        let mut out = snapshot::header(flags);

        self.bus.vic.save_state(&mut out);
        self.bus.sid.save_state(&mut out);
        self.bus.cia1.save_state(&mut out);
        self.bus.cia2.save_state(&mut out);

        let mut delay = 0u8;
        if self.prefs.timing == Timing::Cycle {
            while !self.cpu.instruction_complete() {
                self.advance_cycle_for_snapshot();
                delay = delay.wrapping_add(1);
            }
        }
        self.save_cpu_block(&mut out);
        out.push(delay);

        if self.prefs.emul_1541_proc {
            let mut path = [0u8; 256];
            let bytes = self.prefs.drive_path[0].as_bytes();
            let n = bytes.len().min(255);
            path[..n].copy_from_slice(&bytes[..n]);
            out.extend_from_slice(&path);

            // The drive CPU also rests at an instruction boundary
            let mut drive_delay = 0u8;
            if self.prefs.timing == Timing::Cycle {
                while !self.drive.idle && !self.drive.cpu.instruction_complete() {
                    self.advance_cycle_for_snapshot();
                    drive_delay = drive_delay.wrapping_add(1);
                }
            }
            self.drive.save_state(&mut out);
            out.push(drive_delay);
            self.drive.bus.job.save_state(&mut out);
        }

        out
    }

    /// Restore a snapshot. On a malformed image the machine resets and
    /// the error is returned.
    pub fn load_snapshot(&mut self, data: &[u8]) -> Result<(), String> {
        match self.load_snapshot_inner(data) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.reset();
                Err(e)
            }
        }
    }

    fn load_snapshot_inner(&mut self, data: &[u8]) -> Result<(), String> {
        let (mut reader, flags) = Reader::new(data)?;

        let vic_pos = reader.position();
        self.bus
            .vic
            .load_state(reader.take(crate::vic::Vic::STATE_SIZE)?)?;
        self.bus
            .sid
            .load_state(reader.take(crate::sid::Sid::STATE_SIZE)?)?;
        self.bus
            .cia1
            .load_state(reader.take(crate::cia::Cia::STATE_SIZE)?)?;
        self.bus
            .cia2
            .load_state(reader.take(crate::cia::Cia::STATE_SIZE)?)?;
        self.load_cpu_block(&mut reader)?;

        // Replay the CPU's head start into the other chips
        let delay = reader.byte()?;
        for _ in 0..delay {
            let r = self.bus.vic.emulate_cycle(&self.bus.mem);
            if r.line_done {
                self.bus.sid.emulate_line();
            }
            self.bus.cia1.step();
            self.bus.cia2.step();
        }

        if flags & SNAPSHOT_1541 != 0 {
            let path_bytes = reader.take(256)?;
            let end = path_bytes.iter().position(|&b| b == 0).unwrap_or(255);
            let path = String::from_utf8_lossy(&path_bytes[..end]).into_owned();

            self.drive
                .load_state(reader.take(Drive1541::STATE_SIZE)?)?;
            let drive_delay = reader.byte()?;
            for _ in 0..drive_delay {
                let r = self.bus.vic.emulate_cycle(&self.bus.mem);
                if r.line_done {
                    self.bus.sid.emulate_line();
                }
                self.bus.cia1.step();
                self.bus.cia2.step();
                self.cpu.emulate_cycle(&mut self.bus, self.cycle_counter);
            }
            self.drive
                .bus
                .job
                .load_state(reader.take(crate::job::Job1541::STATE_SIZE)?)?;

            if !self.prefs.emul_1541_proc {
                let mut prefs = self.prefs.clone();
                prefs.emul_1541_proc = true;
                prefs.drive_path[0] = path;
                self.apply_prefs(prefs);
            }
        } else if self.prefs.emul_1541_proc {
            // Snapshot without drive state while the drive is on
            let mut prefs = self.prefs.clone();
            prefs.emul_1541_proc = false;
            self.apply_prefs(prefs);
        }

        // Line-based mode loads the VIC block twice: restoring the
        // other chips clobbers latched sprite DMA state
        if self.prefs.timing == Timing::Line {
            let end = reader.position();
            reader.seek(vic_pos);
            self.bus
                .vic
                .load_state(reader.take(crate::vic::Vic::STATE_SIZE)?)?;
            reader.seek(end);
        }

        self.bus.update_cia2_outputs();
        Ok(())
    }

    /// Dump RAM, color RAM, and (with the drive on) drive RAM.
    pub fn save_ram(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.bus.mem.ram.as_ref());
        out.extend_from_slice(self.bus.mem.color_ram.as_ref());
        if self.prefs.emul_1541_proc {
            out.extend_from_slice(self.drive.bus.ram.as_ref());
        }
    }

    #[must_use]
    pub fn cycle_counter(&self) -> u32 {
        self.cycle_counter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullHost {
        frames: u32,
    }

    impl Host for NullHost {
        fn poll_keyboard(&mut self, _: &mut [u8; 8], _: &mut [u8; 8], _: &mut u8) {}

        fn poll_joystick(&mut self, _port: u8) -> u8 {
            0xFF
        }

        fn present_frame(&mut self, frame: &[u8], pitch: usize) {
            assert_eq!(pitch, DISPLAY_WIDTH);
            assert_eq!(frame.len(), DISPLAY_WIDTH * DISPLAY_HEIGHT);
        }

        fn frame_done(&mut self) -> HostControl {
            self.frames += 1;
            if self.frames >= 3 {
                HostControl::Quit
            } else {
                HostControl::Continue
            }
        }
    }

    #[test]
    fn run_loop_observes_quit() {
        let mut c64 = C64::new(Prefs::default());
        let mut host = NullHost { frames: 0 };
        c64.run(&mut host);
        assert_eq!(host.frames, 3);
    }

    #[test]
    fn cycle_mode_frames_advance_the_raster() {
        let mut prefs = Prefs::default();
        prefs.timing = Timing::Cycle;
        let mut c64 = C64::new(prefs);
        let mut host = NullHost { frames: 0 };
        c64.emulate_frame(&mut host);
        assert!(c64.cycle_counter() >= 312 * 63 - 63);
    }

    #[test]
    fn prefs_swap_at_frame_boundary() {
        let mut c64 = C64::new(Prefs::default());
        let mut prefs = Prefs::default();
        prefs.sprites_on = false;
        c64.set_prefs(prefs);
        assert!(c64.prefs().sprites_on); // not yet applied

        let mut host = NullHost { frames: 0 };
        c64.emulate_frame(&mut host);
        assert!(!c64.prefs().sprites_on);
    }

    #[test]
    fn snapshot_round_trip_restores_ram() {
        let mut c64 = C64::new(Prefs::default());
        let mut host = NullHost { frames: 0 };
        c64.emulate_frame(&mut host);
        c64.bus.mem.ram[0x1234] = 0x77;
        c64.bus.mem.color_ram[0x10] = 0x0A;

        let blob = c64.save_snapshot();
        let pc = c64.cpu.pc();

        c64.reset();
        c64.bus.mem.ram[0x1234] = 0;
        c64.load_snapshot(&blob).expect("loads");
        assert_eq!(c64.bus.mem.ram[0x1234], 0x77);
        assert_eq!(c64.bus.mem.color_ram[0x10], 0x0A);
        assert_eq!(c64.cpu.pc(), pc);
    }

    #[test]
    fn malformed_snapshot_resets_and_errors() {
        let mut c64 = C64::new(Prefs::default());
        assert!(c64.load_snapshot(b"garbage").is_err());
    }

    #[test]
    fn save_ram_layout() {
        let c64 = C64::new(Prefs::default());
        let mut out = Vec::new();
        c64.save_ram(&mut out);
        assert_eq!(out.len(), 0x10000 + 0x400);
    }
}
