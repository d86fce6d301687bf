//! Boot scenarios against real ROM images.
//!
//! These need `basic.rom`, `kernal.rom` and `chargen.rom` at the
//! workspace `roms/` directory and are ignored by default.

use emu_core::{Host, HostControl};
use machine_c64::{Prefs, C64};
use std::fs;
use std::path::PathBuf;

/// "READY." in screen codes.
const READY: [u8; 6] = [0x12, 0x05, 0x01, 0x04, 0x19, 0x2E];

struct NullHost;

impl Host for NullHost {
    fn poll_keyboard(&mut self, _: &mut [u8; 8], _: &mut [u8; 8], _: &mut u8) {}

    fn poll_joystick(&mut self, _port: u8) -> u8 {
        0xFF
    }

    fn present_frame(&mut self, _frame: &[u8], _pitch: usize) {}

    fn frame_done(&mut self) -> HostControl {
        HostControl::Continue
    }
}

fn rom_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .expect("workspace root")
        .join("roms")
}

fn boot_machine() -> C64 {
    let dir = rom_dir();
    let mut c64 = C64::new(Prefs::default());
    c64.load_basic(&fs::read(dir.join("basic.rom")).expect("basic.rom"));
    c64.load_kernal(&fs::read(dir.join("kernal.rom")).expect("kernal.rom"));
    c64.load_chargen(&fs::read(dir.join("chargen.rom")).expect("chargen.rom"));
    c64.reset();
    c64
}

fn screen_contains(c64: &C64, needle: &[u8]) -> bool {
    c64.bus.mem.ram[0x0400..0x07E8]
        .windows(needle.len())
        .any(|w| w == needle)
}

#[test]
#[ignore = "needs ROM images at roms/"]
fn boots_to_ready_prompt() {
    let mut c64 = boot_machine();
    let mut host = NullHost;

    let mut found = false;
    for _ in 0..100 {
        c64.emulate_frame(&mut host);
        if screen_contains(&c64, &READY) {
            found = true;
            break;
        }
    }
    assert!(found, "no READY. prompt within 100 frames");

    // The cursor blinks at about 2 Hz: the character under it toggles
    let cursor_pos = 0x0400
        + c64.bus.mem.ram[0xD6] as usize * 40
        + c64.bus.mem.ram[0xD3] as usize;
    let before = c64.bus.mem.ram[cursor_pos];
    let mut toggled = false;
    for _ in 0..30 {
        c64.emulate_frame(&mut host);
        if c64.bus.mem.ram[cursor_pos] != before {
            toggled = true;
            break;
        }
    }
    assert!(toggled, "cursor is not blinking");
}

#[test]
#[ignore = "needs ROM images at roms/"]
fn autoload_types_into_basic() {
    let mut c64 = boot_machine();
    let mut host = NullHost;
    for _ in 0..100 {
        c64.emulate_frame(&mut host);
        if screen_contains(&c64, &READY) {
            break;
        }
    }

    // Stuff the keyboard buffer with PRINT 5+3 <CR>
    let keys = b"PRINT 5+3\r";
    for (i, &k) in keys.iter().enumerate() {
        c64.bus.mem.ram[0x0277 + i] = k;
    }
    c64.bus.mem.ram[0xC6] = keys.len() as u8;

    for _ in 0..50 {
        c64.emulate_frame(&mut host);
    }
    // Screen code for "8"
    assert!(screen_contains(&c64, &[0x38]), "BASIC did not evaluate");
}
