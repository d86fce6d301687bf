/// Result of dispatching a fabricated `$F2` opcode to the bus.
///
/// The KERNAL and drive-ROM patches replace a handful of routine entry
/// points with `$F2 nn`. The CPU treats `$F2` as an ordinary opcode whose
/// implementation lives on the bus side; the bus performs the routine's
/// effect synchronously and tells the CPU how to resume.
#[derive(Debug, Clone, Copy, Default)]
pub struct PatchResult {
    /// New accumulator value. `Some` also updates the N and Z flags.
    pub a: Option<u8>,
    /// Carry flag override (EOI indication on byte-in).
    pub carry: Option<bool>,
    /// Address execution resumes at. `None` means the sub-opcode was not
    /// recognized and the CPU should treat the byte pair as an illegal op.
    pub resume: Option<u16>,
}

impl PatchResult {
    /// An unrecognized sub-opcode.
    #[must_use]
    pub fn illegal() -> Self {
        Self::default()
    }

    /// Plain control transfer with no register effects.
    #[must_use]
    pub fn jump(resume: u16) -> Self {
        Self {
            a: None,
            carry: None,
            resume: Some(resume),
        }
    }
}

/// A bus that supports memory read/write operations.
///
/// The 6502 family is fully memory-mapped, so this is the only seam
/// between a CPU and the machine around it. All side effects of I/O
/// registers (collision latches clearing on read, interrupt flags
/// acknowledging on write) happen inside `read`/`write`.
pub trait Bus {
    /// Read a byte from the given address.
    fn read(&mut self, addr: u16) -> u8;

    /// Write a byte to the given address.
    fn write(&mut self, addr: u16, value: u8);

    /// State of the BA line. While low, the video chip owns the bus and
    /// the CPU must not perform read cycles.
    fn ba_low(&self) -> bool {
        false
    }

    /// Combined level of the IRQ sources behind this bus. The CPU
    /// consults it before servicing a latched IRQ, so an interrupt
    /// acknowledged mid-batch (a handler reading an ICR) drops the
    /// request immediately instead of at the next scheduler sample
    /// point. Buses that do not model interrupt wiring leave the
    /// default, which trusts the CPU's latches.
    fn irq_level(&self) -> bool {
        true
    }

    /// Handle the fabricated `$F2` opcode.
    ///
    /// `sub_op` is the byte following the opcode, `a` the accumulator at
    /// dispatch time. The default implementation recognizes nothing.
    fn patch_dispatch(&mut self, _sub_op: u8, _a: u8) -> PatchResult {
        PatchResult::illegal()
    }
}
