//! Addressing mode helpers.
//!
//! Each helper fetches its operand bytes, performs the dummy reads real
//! hardware performs (they matter: a dummy read of an I/O register has
//! the register's read side effects), and returns the effective address.
//! Indexed read modes additionally return whether the index crossed a
//! page, which costs one penalty cycle.

use crate::Mos6510;
use emu_core::Bus;

impl Mos6510 {
    /// Fetch the next byte at PC and advance PC.
    pub(crate) fn fetch(&mut self, bus: &mut impl Bus) -> u8 {
        let value = bus.read(self.pc);
        self.pc = self.pc.wrapping_add(1);
        value
    }

    /// Fetch a little-endian word at PC.
    pub(crate) fn fetch_word(&mut self, bus: &mut impl Bus) -> u16 {
        let low = self.fetch(bus);
        let high = self.fetch(bus);
        u16::from_le_bytes([low, high])
    }

    /// Read a little-endian word.
    pub(crate) fn read_word(&self, bus: &mut impl Bus, addr: u16) -> u16 {
        let low = bus.read(addr);
        let high = bus.read(addr.wrapping_add(1));
        u16::from_le_bytes([low, high])
    }

    /// Read a word with the JMP-indirect page wraparound bug: at $xxFF the
    /// high byte comes from $xx00.
    pub(crate) fn read_word_page_bug(&self, bus: &mut impl Bus, addr: u16) -> u16 {
        let low = bus.read(addr);
        let high = bus.read((addr & 0xFF00) | (addr.wrapping_add(1) & 0x00FF));
        u16::from_le_bytes([low, high])
    }

    pub(crate) fn push(&mut self, bus: &mut impl Bus, value: u8) {
        bus.write(0x0100 | u16::from(self.sp), value);
        self.sp = self.sp.wrapping_sub(1);
    }

    pub(crate) fn pull(&mut self, bus: &mut impl Bus) -> u8 {
        self.sp = self.sp.wrapping_add(1);
        bus.read(0x0100 | u16::from(self.sp))
    }

    pub(crate) fn push_word(&mut self, bus: &mut impl Bus, value: u16) {
        self.push(bus, (value >> 8) as u8);
        self.push(bus, value as u8);
    }

    pub(crate) fn pull_word(&mut self, bus: &mut impl Bus) -> u16 {
        let low = self.pull(bus);
        let high = self.pull(bus);
        u16::from_le_bytes([low, high])
    }

    // -----------------------------------------------------------------
    // Effective address computation
    // -----------------------------------------------------------------

    /// $nn
    pub(crate) fn addr_zp(&mut self, bus: &mut impl Bus) -> u16 {
        u16::from(self.fetch(bus))
    }

    /// $nn,X, wrapping within the zero page.
    pub(crate) fn addr_zp_x(&mut self, bus: &mut impl Bus) -> u16 {
        let base = self.fetch(bus);
        bus.read(u16::from(base));
        u16::from(base.wrapping_add(self.x))
    }

    /// $nn,Y, wrapping within the zero page.
    pub(crate) fn addr_zp_y(&mut self, bus: &mut impl Bus) -> u16 {
        let base = self.fetch(bus);
        bus.read(u16::from(base));
        u16::from(base.wrapping_add(self.y))
    }

    /// $nnnn
    pub(crate) fn addr_abs(&mut self, bus: &mut impl Bus) -> u16 {
        self.fetch_word(bus)
    }

    /// $nnnn,X for reads: returns (address, page crossed).
    pub(crate) fn addr_abs_x(&mut self, bus: &mut impl Bus) -> (u16, bool) {
        let base = self.fetch_word(bus);
        let addr = base.wrapping_add(u16::from(self.x));
        (addr, (base ^ addr) & 0xFF00 != 0)
    }

    /// $nnnn,X for writes/RMW: the dummy read at the un-fixed address
    /// always happens.
    pub(crate) fn addr_abs_x_rmw(&mut self, bus: &mut impl Bus) -> u16 {
        let base = self.fetch_word(bus);
        let addr = base.wrapping_add(u16::from(self.x));
        bus.read((base & 0xFF00) | (addr & 0x00FF));
        addr
    }

    /// $nnnn,Y for reads: returns (address, page crossed).
    pub(crate) fn addr_abs_y(&mut self, bus: &mut impl Bus) -> (u16, bool) {
        let base = self.fetch_word(bus);
        let addr = base.wrapping_add(u16::from(self.y));
        (addr, (base ^ addr) & 0xFF00 != 0)
    }

    /// $nnnn,Y for writes/RMW.
    pub(crate) fn addr_abs_y_rmw(&mut self, bus: &mut impl Bus) -> u16 {
        let base = self.fetch_word(bus);
        let addr = base.wrapping_add(u16::from(self.y));
        bus.read((base & 0xFF00) | (addr & 0x00FF));
        addr
    }

    /// ($nn,X)
    pub(crate) fn addr_ind_x(&mut self, bus: &mut impl Bus) -> u16 {
        let base = self.fetch(bus);
        bus.read(u16::from(base));
        let ptr = base.wrapping_add(self.x);
        let low = bus.read(u16::from(ptr));
        let high = bus.read(u16::from(ptr.wrapping_add(1)));
        u16::from_le_bytes([low, high])
    }

    /// ($nn),Y for reads: returns (address, page crossed).
    pub(crate) fn addr_ind_y(&mut self, bus: &mut impl Bus) -> (u16, bool) {
        let ptr = self.fetch(bus);
        let low = bus.read(u16::from(ptr));
        let high = bus.read(u16::from(ptr.wrapping_add(1)));
        let base = u16::from_le_bytes([low, high]);
        let addr = base.wrapping_add(u16::from(self.y));
        (addr, (base ^ addr) & 0xFF00 != 0)
    }

    /// ($nn),Y for writes/RMW.
    pub(crate) fn addr_ind_y_rmw(&mut self, bus: &mut impl Bus) -> u16 {
        let ptr = self.fetch(bus);
        let low = bus.read(u16::from(ptr));
        let high = bus.read(u16::from(ptr.wrapping_add(1)));
        let base = u16::from_le_bytes([low, high]);
        let addr = base.wrapping_add(u16::from(self.y));
        bus.read((base & 0xFF00) | (addr & 0x00FF));
        addr
    }

    /// Conditional branch. Returns extra cycles: 1 if taken, 2 if taken
    /// across a page boundary.
    pub(crate) fn branch_if(&mut self, bus: &mut impl Bus, condition: bool) -> u32 {
        let offset = self.fetch(bus) as i8;
        if !condition {
            return 0;
        }
        let target = self.pc.wrapping_add(offset as u16);
        let crossed = (self.pc ^ target) & 0xFF00 != 0;
        self.pc = target;
        if crossed {
            2
        } else {
            1
        }
    }
}
