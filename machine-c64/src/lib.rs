//! Commodore 64 emulation core.
//!
//! A cycle-driven model of the C64 and its 1541 floppy drive:
//! - 6510 CPU over a banked memory map (via the `cpu-6510` crate)
//! - VIC-II raster engine with sprites, bad lines, and raster interrupts
//! - SID three-voice synthesis with filter and sampled-voice playback
//! - Two CIAs with timers, TOD clocks, and interrupt routing
//! - IEC serial bus, both as a fast protocol-level path (KERNAL patches)
//!   and as a wire-level 6502/VIA/GCR drive model
//! - A self-contained binary snapshot format
//!
//! The host supplies ROM images, input state, and frame/audio sinks; see
//! `emu_core::Host`. Without ROM images the core falls back to built-in
//! stubs that idle harmlessly.

mod bus;
mod c64;
mod cia;
mod disk;
pub mod drive;
mod drive1541;
mod gcr;
mod iec;
mod job;
mod memory;
mod palette;
mod prefs;
mod sid;
mod snapshot;
mod via;
mod vic;

pub use bus::{C64Bus, InputState};
pub use c64::C64;
pub use cia::Cia;
pub use disk::DiskImage;
pub use drive1541::Drive1541;
pub use iec::{Iec, IecLines};
pub use memory::C64Memory;
pub use palette::PALETTE;
pub use prefs::{Prefs, Timing};
pub use sid::Sid;
pub use vic::{Vic, DISPLAY_HEIGHT, DISPLAY_WIDTH};
