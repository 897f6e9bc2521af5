//! End-to-end dispatcher test: a small program produces the same memory-visible result
//! whether it runs purely interpreted or through the block cache with interpreter fallback.

#![cfg(target_arch = "x86_64")]

use sh2_emu::bus::BusInterface;
use sh2_emu::jit::Sh2Jit;
use sh2_emu::{spec, Sh2};

const RAM_LEN: usize = 64 * 1024;
const RESULT_ADDR: usize = 0x2000;

struct RamBus {
    ram: Box<[u8; RAM_LEN]>,
}

impl RamBus {
    fn with_program(program: &[u16]) -> Self {
        let mut ram: Box<[u8; RAM_LEN]> =
            vec![0; RAM_LEN].into_boxed_slice().try_into().unwrap();

        // Reset vectors: PC = 0x1000, SP = 0x8000
        ram[0..4].copy_from_slice(&0x0000_1000_u32.to_be_bytes());
        ram[4..8].copy_from_slice(&0x0000_8000_u32.to_be_bytes());

        for (i, word) in program.iter().enumerate() {
            let offset = 0x1000 + 2 * i;
            ram[offset..offset + 2].copy_from_slice(&word.to_be_bytes());
        }

        Self { ram }
    }

    fn index(address: u32) -> usize {
        (address as usize) & (RAM_LEN - 1)
    }

    fn result(&mut self) -> u32 {
        self.read_longword(RESULT_ADDR as u32)
    }
}

impl BusInterface for RamBus {
    fn read_byte(&mut self, address: u32) -> u8 {
        self.ram[Self::index(address)]
    }

    fn read_word(&mut self, address: u32) -> u16 {
        let i = Self::index(address & !1);
        u16::from_be_bytes([self.ram[i], self.ram[i + 1]])
    }

    fn read_longword(&mut self, address: u32) -> u32 {
        let i = Self::index(address & !3);
        u32::from_be_bytes([self.ram[i], self.ram[i + 1], self.ram[i + 2], self.ram[i + 3]])
    }

    fn write_byte(&mut self, address: u32, value: u8) {
        self.ram[Self::index(address)] = value;
    }

    fn write_word(&mut self, address: u32, value: u16) {
        let i = Self::index(address & !1);
        self.ram[i..i + 2].copy_from_slice(&value.to_be_bytes());
    }

    fn write_longword(&mut self, address: u32, value: u32) {
        let i = Self::index(address & !3);
        self.ram[i..i + 4].copy_from_slice(&value.to_be_bytes());
    }

    fn reset(&self) -> bool {
        false
    }

    fn interrupt_level(&self) -> u8 {
        0
    }
}

// Sums 10..=1 into R0, stores the result to RESULT_ADDR, then spins
const SUM_LOOP: &[u16] = &[
    0xE10A, // MOV #10, R1
    0xE000, // MOV #0, R0
    0xE220, // MOV #0x20, R2
    0x4218, // SHLL8 R2          (R2 = 0x2000)
    0x301C, // loop: ADD R1, R0
    0x4110, // DT R1
    0x8BFC, // BF loop
    0x2202, // MOV.L R0, @R2
    0xAFFE, // BRA self
    0x0009, // NOP (delay slot)
];

fn run_interpreted(steps: u64) -> u32 {
    let mut bus = RamBus::with_program(SUM_LOOP);
    let mut cpu = Sh2::new("test".into());

    for _ in 0..steps {
        cpu.execute(1, &mut bus);
    }
    bus.result()
}

fn run_with_jit(steps: u64) -> (u32, Sh2Jit) {
    let mut bus = RamBus::with_program(SUM_LOOP);
    let mut cpu = Sh2::new("test".into());

    let mut jit = Sh2Jit::new();
    jit.set_verified_opcodes(0..spec::SPECS.len());

    for _ in 0..steps {
        if !jit.run(&mut cpu, &mut bus) {
            cpu.execute(1, &mut bus);
        }
    }
    (bus.result(), jit)
}

#[test]
fn jit_and_interpreter_produce_the_same_result() {
    assert_eq!(run_interpreted(300), 55);

    let (result, jit) = run_with_jit(300);
    assert_eq!(result, 55);

    let stats = jit.cache_stats();
    assert!(stats.block_count > 0, "no blocks were compiled");
    assert!(stats.hits > 0, "the loop should have re-entered compiled blocks");
}

#[test]
fn invalidation_forces_recompilation() {
    let mut bus = RamBus::with_program(SUM_LOOP);
    let mut cpu = Sh2::new("test".into());
    let mut jit = Sh2Jit::new();
    jit.set_verified_opcodes(0..spec::SPECS.len());

    for _ in 0..100 {
        if !jit.run(&mut cpu, &mut bus) {
            cpu.execute(1, &mut bus);
        }
    }
    let blocks_before = jit.cache_stats().block_count;
    assert!(blocks_before > 0);

    // Everything in the program range is dropped; re-running repopulates the cache
    jit.invalidate(0x1000, 0x1100);
    assert_eq!(jit.cache_stats().block_count, 0);

    for _ in 0..50 {
        if !jit.run(&mut cpu, &mut bus) {
            cpu.execute(1, &mut bus);
        }
    }
    assert!(jit.cache_stats().block_count > 0);
}
