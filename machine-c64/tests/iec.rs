//! Serial-bus scenarios: the fast-IEC path end to end against a disk
//! image, driven the way the patched KERNAL routines drive it.

use emu_core::Bus;
use machine_c64::{DiskImage, Prefs, C64};

/// The documented test program: a one-line BASIC stub (SYS 2064).
const HELLO_PAYLOAD: [u8; 14] = [
    0x01, 0x08, 0x0B, 0x08, 0x0A, 0x00, 0x9E, 0x32, 0x30, 0x36, 0x34, 0x00, 0x00, 0x00,
];

fn machine_with_hello() -> C64 {
    let mut image = DiskImage::blank(b"IEC TEST", [0x4A, 0x4B]);
    assert!(image.write_file(b"HELLO", &HELLO_PAYLOAD));
    let mut c64 = C64::new(Prefs::default());
    c64.attach_image(0, "hello.d64", &image.to_bytes());
    c64
}

/// Drive one fast-IEC sub-command the way the $F2 handler does.
fn sub(c64: &mut C64, op: u8, a: u8) -> emu_core::PatchResult {
    c64.bus.patch_dispatch(op, a)
}

#[test]
fn open_and_read_returns_payload_with_eoi_on_last_byte() {
    let mut c64 = machine_with_hello();

    // OPEN 1,8,0,"HELLO"
    sub(&mut c64, 0x04, 0); // assert ATN
    sub(&mut c64, 0x01, 0x28); // LISTEN 8
    sub(&mut c64, 0x02, 0xF0); // OPEN channel 0
    for &b in b"HELLO" {
        sub(&mut c64, 0x00, b);
    }
    sub(&mut c64, 0x01, 0x3F); // UNLISTEN
    sub(&mut c64, 0x05, 0); // release ATN

    // TALK 8, channel 0, then read it all
    sub(&mut c64, 0x01, 0x48);
    sub(&mut c64, 0x02, 0x60);
    sub(&mut c64, 0x06, 0); // turn-around

    let mut bytes = Vec::new();
    loop {
        let r = sub(&mut c64, 0x03, 0);
        bytes.push(r.a.expect("byte in"));
        if r.carry == Some(true) {
            break;
        }
        assert!(bytes.len() <= HELLO_PAYLOAD.len(), "EOI never arrived");
    }
    assert_eq!(bytes, HELLO_PAYLOAD);

    sub(&mut c64, 0x01, 0x5F); // UNTALK
    sub(&mut c64, 0x07, 0); // release
    // The KERNAL status byte stayed clean
    assert_eq!(c64.bus.mem.ram[0x90], 0);
}

#[test]
fn load_address_prefixes_the_stream() {
    let mut c64 = machine_with_hello();
    sub(&mut c64, 0x01, 0x28);
    sub(&mut c64, 0x02, 0xF0);
    for &b in b"HELLO" {
        sub(&mut c64, 0x00, b);
    }
    sub(&mut c64, 0x01, 0x3F);
    sub(&mut c64, 0x01, 0x48);
    sub(&mut c64, 0x02, 0x60);

    let first = sub(&mut c64, 0x03, 0);
    let second = sub(&mut c64, 0x03, 0);
    assert_eq!(first.a, Some(0x01)); // load address $0801
    assert_eq!(second.a, Some(0x08));
}

#[test]
fn missing_device_sets_status_byte() {
    let mut c64 = machine_with_hello();
    c64.bus.mem.ram[0x90] = 0;
    sub(&mut c64, 0x01, 0x29); // LISTEN 9: nothing attached
    assert_ne!(c64.bus.mem.ram[0x90] & 0x80, 0, "DEVICE NOT PRESENT");
}

#[test]
fn missing_file_reports_file_not_found_on_status_channel() {
    let mut c64 = machine_with_hello();

    sub(&mut c64, 0x01, 0x28);
    sub(&mut c64, 0x02, 0xF0);
    for &b in b"NOPE" {
        sub(&mut c64, 0x00, b);
    }
    sub(&mut c64, 0x01, 0x3F);

    // Read channel 15
    sub(&mut c64, 0x01, 0x48);
    sub(&mut c64, 0x02, 0x6F);
    let mut status = Vec::new();
    loop {
        let r = sub(&mut c64, 0x03, 0);
        status.push(r.a.expect("status byte"));
        if r.carry == Some(true) {
            break;
        }
    }
    assert!(status.starts_with(b"62, FILE NOT FOUND"));
}

#[test]
fn save_writes_back_through_the_bus() {
    let mut c64 = machine_with_hello();

    // OPEN 1,8,1,"OUT,P,W" then send bytes
    sub(&mut c64, 0x01, 0x28);
    sub(&mut c64, 0x02, 0xF1);
    for &b in b"0:OUT,P,W" {
        sub(&mut c64, 0x00, b);
    }
    sub(&mut c64, 0x01, 0x3F);

    sub(&mut c64, 0x01, 0x28);
    sub(&mut c64, 0x02, 0x61); // data channel 1
    for &b in &[0x00u8, 0x10, 0xAB] {
        sub(&mut c64, 0x00, b);
    }
    sub(&mut c64, 0x01, 0x3F);
    // CLOSE channel 1 flushes the file
    sub(&mut c64, 0x01, 0x28);
    sub(&mut c64, 0x02, 0xE1);
    sub(&mut c64, 0x01, 0x3F);

    // Read it back
    sub(&mut c64, 0x01, 0x28);
    sub(&mut c64, 0x02, 0xF0);
    for &b in b"OUT" {
        sub(&mut c64, 0x00, b);
    }
    sub(&mut c64, 0x01, 0x3F);
    sub(&mut c64, 0x01, 0x48);
    sub(&mut c64, 0x02, 0x60);
    let r = sub(&mut c64, 0x03, 0);
    assert_eq!(r.a, Some(0x00));
    let r = sub(&mut c64, 0x03, 0);
    assert_eq!(r.a, Some(0x10));
}
