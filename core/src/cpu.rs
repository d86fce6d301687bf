use crate::Bus;

/// A CPU that can execute instructions against a bus.
///
/// The type parameter `B` is the bus type this CPU operates on.
pub trait Cpu<B: Bus> {
    /// Execute one whole instruction. Returns cycles consumed.
    fn step(&mut self, bus: &mut B) -> u32;

    /// Advance the CPU by one phi2 cycle.
    ///
    /// `cycle_counter` is the machine-wide cycle count, used to order
    /// interrupt arrival against instruction boundaries.
    fn step_cycle(&mut self, bus: &mut B, cycle_counter: u32);

    /// Reset the CPU through the reset vector.
    fn reset(&mut self, bus: &mut B);

    /// Get the current program counter.
    fn pc(&self) -> u16;
}
