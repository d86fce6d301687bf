//! Conformance against Tom Harte's `SingleStepTests` 6502 vectors.
//!
//! Each of the 256 opcode files holds 10,000 cases of initial state,
//! final state, and the cycle-by-cycle bus trace. We check register and
//! memory state plus the total cycle count (the bus trace order is not
//! comparable to a whole-instruction interpreter).
//!
//! Vectors live in `test-data/65x02/6502/v1/XX.json` at the workspace
//! root; the test skips silently when they are absent.

use cpu_6510::Mos6510;
use emu_core::Bus;
use serde::Deserialize;
use std::fs;
use std::path::Path;

/// Flat 64KB RAM bus.
struct TestBus {
    ram: Vec<u8>,
}

impl TestBus {
    fn new() -> Self {
        Self {
            ram: vec![0; 0x10000],
        }
    }

    fn load_ram(&mut self, entries: &[(u16, u8)]) {
        for &(addr, value) in entries {
            self.ram[addr as usize] = value;
        }
    }

    fn peek(&self, addr: u16) -> u8 {
        self.ram[addr as usize]
    }
}

impl Bus for TestBus {
    fn read(&mut self, addr: u16) -> u8 {
        self.ram[addr as usize]
    }

    fn write(&mut self, addr: u16, value: u8) {
        self.ram[addr as usize] = value;
    }
}

#[derive(Deserialize)]
struct TestCase {
    name: String,
    initial: CpuJson,
    #[serde(rename = "final")]
    final_state: CpuJson,
    cycles: Vec<(u16, u8, String)>,
}

#[derive(Deserialize)]
struct CpuJson {
    pc: u16,
    s: u8,
    a: u8,
    x: u8,
    y: u8,
    p: u8,
    ram: Vec<(u16, u8)>,
}

fn setup(cpu: &mut Mos6510, bus: &mut TestBus, state: &CpuJson) {
    bus.load_ram(&state.ram);
    cpu.set_pc(state.pc);
    cpu.set_sp(state.s);
    cpu.set_a(state.a);
    cpu.set_x(state.x);
    cpu.set_y(state.y);
    cpu.set_status(state.p);
}

fn compare(cpu: &Mos6510, bus: &TestBus, cycles: u32, case: &TestCase) -> Vec<String> {
    let mut errors = Vec::new();
    let expected = &case.final_state;

    if cpu.pc() != expected.pc {
        errors.push(format!("PC: got ${:04X}, want ${:04X}", cpu.pc(), expected.pc));
    }
    if cpu.sp() != expected.s {
        errors.push(format!("S: got ${:02X}, want ${:02X}", cpu.sp(), expected.s));
    }
    if cpu.a() != expected.a {
        errors.push(format!("A: got ${:02X}, want ${:02X}", cpu.a(), expected.a));
    }
    if cpu.x() != expected.x {
        errors.push(format!("X: got ${:02X}, want ${:02X}", cpu.x(), expected.x));
    }
    if cpu.y() != expected.y {
        errors.push(format!("Y: got ${:02X}, want ${:02X}", cpu.y(), expected.y));
    }

    // Bit 5 always reads as 1; B is a push-time artefact.
    let actual_p = cpu.status();
    let expected_p = expected.p | 0x20;
    if actual_p != expected_p {
        errors.push(format!("P: got ${actual_p:02X}, want ${expected_p:02X}"));
    }

    for &(addr, want) in &expected.ram {
        let got = bus.peek(addr);
        if got != want {
            errors.push(format!("RAM[${addr:04X}]: got ${got:02X}, want ${want:02X}"));
        }
    }

    let want_cycles = case.cycles.len() as u32;
    if cycles != want_cycles {
        errors.push(format!("cycles: got {cycles}, want {want_cycles}"));
    }

    errors
}

/// Opcodes whose unstable or halting behaviour the vectors model
/// differently from this implementation.
fn skip_opcode(opcode: u8) -> bool {
    matches!(
        opcode,
        // JAM group (vectors model the halt; we log and continue)
        0x02 | 0x12 | 0x22 | 0x32 | 0x42 | 0x52 | 0x62 | 0x72 | 0x92 | 0xB2 | 0xD2 | 0xF2
        // Unstable magic-constant ops, and ARR whose decimal-mode
        // fixups are not modelled
        | 0x8B | 0xAB | 0x6B
    )
}

#[test]
fn single_step_vectors() {
    let test_dir = Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .expect("workspace root")
        .join("test-data/65x02/6502/v1");

    if !test_dir.exists() {
        eprintln!("test data not found at {}, skipping", test_dir.display());
        return;
    }

    let mut total_fail = 0u64;

    for opcode in 0..=0xFFu8 {
        if skip_opcode(opcode) {
            continue;
        }
        let path = test_dir.join(format!("{opcode:02x}.json"));
        if !path.exists() {
            continue;
        }

        let data = fs::read_to_string(&path)
            .unwrap_or_else(|e| panic!("read {}: {e}", path.display()));
        let cases: Vec<TestCase> = serde_json::from_str(&data)
            .unwrap_or_else(|e| panic!("parse {}: {e}", path.display()));

        for case in &cases {
            let mut cpu = Mos6510::new();
            let mut bus = TestBus::new();
            setup(&mut cpu, &mut bus, &case.initial);

            let cycles = cpu.step(&mut bus);

            let errors = compare(&cpu, &bus, cycles, case);
            if !errors.is_empty() {
                total_fail += 1;
                if total_fail <= 10 {
                    eprintln!("{}: {}", case.name, errors.join("; "));
                }
            }
        }
    }

    assert_eq!(total_fail, 0, "{total_fail} vector mismatches");
}
