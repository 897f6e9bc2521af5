//! Emulation core for the Hitachi SH-2 CPU
//!
//! Contains both the interpreter, which implements the full instruction set and acts as the
//! reference semantics, and a basic-block dynamic recompiler that is validated against the
//! interpreter before it is allowed to execute anything (see the [`jit`] module).
//!
//! Timing is tracked per instruction using issue cycle counts from the instruction
//! specification database in [`spec`]. Memory access delays are not modeled.

pub mod bus;
mod disassemble;
mod instructions;
pub mod jit;
mod registers;
pub mod spec;

use crate::bus::BusInterface;
pub use crate::registers::{Sh2Registers, StatusRegister};
use bincode::{Decode, Encode};

const RESET_PC_VECTOR: u32 = 0x00000000;
const RESET_SP_VECTOR: u32 = 0x00000004;

const RESET_INTERRUPT_MASK: u8 = 15;
const RESET_VBR: u32 = 0x00000000;

const BASE_IRL_VECTOR_NUMBER: u32 = 64;

// R15 is the hardware stack pointer
const SP: usize = 15;

// Only A0-28 are visible externally; A29-31 select on-chip partitions
const EXTERNAL_ADDRESS_MASK: u32 = 0x1FFFFFFF;

#[derive(Debug, Clone, Encode, Decode)]
pub struct Sh2 {
    registers: Sh2Registers,
    reset_pending: bool,
    name: String,
}

impl Sh2 {
    #[must_use]
    pub fn new(name: String) -> Self {
        Self { registers: Sh2Registers::default(), reset_pending: true, name }
    }

    /// Execute up to `ticks` instructions.
    ///
    /// Will not execute any instructions on the call that performs a reset or enters an
    /// interrupt handler.
    #[inline]
    pub fn execute<B: BusInterface>(&mut self, ticks: u64, bus: &mut B) {
        if ticks == 0 {
            return;
        }

        if bus.reset() {
            self.reset_pending = true;
            return;
        }

        if self.reset_pending {
            self.reset_pending = false;
            self.perform_reset(bus);
            return;
        }

        let mut remaining = ticks;

        // Interrupts cannot trigger in a delay slot, so drain the pending delay slot
        // instruction before checking levels
        if self.registers.next_op_in_delay_slot {
            self.execute_single_instruction(bus);
            remaining -= 1;
        }

        debug_assert!(
            !self.registers.next_op_in_delay_slot,
            "SH-2 executed two consecutive delay slot instructions, PC={:08X}",
            self.registers.pc
        );

        let interrupt_level = bus.interrupt_level();
        if interrupt_level > self.registers.sr.interrupt_mask {
            let vector_number = BASE_IRL_VECTOR_NUMBER + u32::from(interrupt_level >> 1);
            self.handle_interrupt(interrupt_level, vector_number, bus);
            return;
        }

        for _ in 0..remaining {
            self.execute_single_instruction(bus);
        }
    }

    /// Execute instructions until at least `cycle_budget` cycles have elapsed, returning the
    /// number of cycles actually consumed.
    #[inline]
    pub fn run<B: BusInterface>(&mut self, cycle_budget: u64, bus: &mut B) -> u64 {
        let start = self.registers.cycles;

        // Check reset/interrupts once per slice; callers keep slices short
        self.execute(1, bus);
        while self.registers.cycles.wrapping_sub(start) < cycle_budget {
            if self.reset_pending || bus.reset() {
                break;
            }
            self.execute_single_instruction(bus);
        }

        self.registers.cycles.wrapping_sub(start)
    }

    fn perform_reset<B: BusInterface>(&mut self, bus: &mut B) {
        // The first 8 bytes of the address space hold the reset vector and the initial SP
        self.registers.pc = self.read_longword(RESET_PC_VECTOR, bus);
        self.registers.next_pc = self.registers.pc.wrapping_add(2);
        self.registers.next_op_in_delay_slot = false;

        self.registers.gpr[SP] = self.read_longword(RESET_SP_VECTOR, bus);

        self.registers.sr.interrupt_mask = RESET_INTERRUPT_MASK;
        self.registers.vbr = RESET_VBR;

        log::trace!(
            "[{}] Reset SH-2; PC is {:08X} and SP is {:08X}",
            self.name,
            self.registers.pc,
            self.registers.gpr[SP]
        );
    }

    #[inline(always)]
    fn execute_single_instruction<B: BusInterface>(&mut self, bus: &mut B) {
        let pc = self.registers.pc;
        let opcode = self.read_word(pc, bus);
        self.registers.pc = self.registers.next_pc;
        self.registers.next_pc = self.registers.pc.wrapping_add(2);
        self.registers.next_op_in_delay_slot = false;

        if log::log_enabled!(log::Level::Trace) {
            log::trace!(
                "[{}] Executing opcode {opcode:04X} at PC {pc:08X}: {}",
                self.name,
                disassemble::disassemble(opcode)
            );
            log::trace!("  Registers: {:08X?}", self.registers.gpr);
            log::trace!("  SR={:?} PR={:08X}", self.registers.sr, self.registers.pr);
        }

        self.registers.cycles += u64::from(spec::issue_cycles(opcode));
        instructions::execute(self, opcode, bus);
    }

    #[must_use]
    pub fn cycle_count(&self) -> u64 {
        self.registers.cycles
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn registers(&self) -> &Sh2Registers {
        &self.registers
    }

    pub(crate) fn registers_mut(&mut self) -> &mut Sh2Registers {
        &mut self.registers
    }

    fn read_byte<B: BusInterface>(&mut self, address: u32, bus: &mut B) -> u8 {
        match address >> 29 {
            0 | 1 => bus.read_byte(address & EXTERNAL_ADDRESS_MASK),
            // Associative purge / cache array partitions; the on-chip cache is not emulated
            2 | 3 | 6 => 0,
            7 => self.read_internal_register(address) as u8,
            _ => open_bus_read(address) as u8,
        }
    }

    fn read_word<B: BusInterface>(&mut self, address: u32, bus: &mut B) -> u16 {
        match address >> 29 {
            0 | 1 => bus.read_word(address & EXTERNAL_ADDRESS_MASK),
            2 | 3 | 6 => 0,
            7 => self.read_internal_register(address) as u16,
            _ => open_bus_read(address) as u16,
        }
    }

    fn read_longword<B: BusInterface>(&mut self, address: u32, bus: &mut B) -> u32 {
        match address >> 29 {
            0 | 1 => bus.read_longword(address & EXTERNAL_ADDRESS_MASK),
            2 | 3 | 6 => 0,
            7 => self.read_internal_register(address),
            _ => open_bus_read(address),
        }
    }

    fn write_byte<B: BusInterface>(&mut self, address: u32, value: u8, bus: &mut B) {
        match address >> 29 {
            0 | 1 => bus.write_byte(address & EXTERNAL_ADDRESS_MASK, value),
            2 | 3 | 6 => {}
            7 => self.write_internal_register(address, value.into()),
            _ => log::warn!("[{}] Unexpected byte write: {address:08X} {value:02X}", self.name),
        }
    }

    fn write_word<B: BusInterface>(&mut self, address: u32, value: u16, bus: &mut B) {
        match address >> 29 {
            0 | 1 => bus.write_word(address & EXTERNAL_ADDRESS_MASK, value),
            2 | 3 | 6 => {}
            7 => self.write_internal_register(address, value.into()),
            _ => log::warn!("[{}] Unexpected word write: {address:08X} {value:04X}", self.name),
        }
    }

    fn write_longword<B: BusInterface>(&mut self, address: u32, value: u32, bus: &mut B) {
        match address >> 29 {
            0 | 1 => bus.write_longword(address & EXTERNAL_ADDRESS_MASK, value),
            2 | 3 | 6 => {}
            7 => self.write_internal_register(address, value),
            _ => log::warn!("[{}] Unexpected longword write: {address:08X} {value:08X}", self.name),
        }
    }

    // On-chip module registers (partition 7). The peripheral modules themselves (DIVU, DMAC,
    // FRT, WDT, SCI) are not emulated; games that only configure and never depend on them
    // work with reads-as-zero
    fn read_internal_register(&self, address: u32) -> u32 {
        log::trace!("[{}] Internal register read: {address:08X}", self.name);
        match address {
            // Bus control register; games write a magic value here and read it back
            0xFFFFFFE0 => 0xA55A0001,
            _ => 0,
        }
    }

    fn write_internal_register(&mut self, address: u32, value: u32) {
        log::trace!("[{}] Internal register write: {address:08X} {value:08X}", self.name);
    }

    fn handle_interrupt<B: BusInterface>(
        &mut self,
        interrupt_level: u8,
        vector_number: u32,
        bus: &mut B,
    ) {
        let mut sp = self.registers.gpr[SP].wrapping_sub(4);
        self.write_longword(sp, self.registers.sr.into(), bus);

        sp = sp.wrapping_sub(4);
        self.write_longword(sp, self.registers.pc, bus);

        self.registers.gpr[SP] = sp;
        self.registers.sr.interrupt_mask = interrupt_level;

        let vector_addr = self.registers.vbr.wrapping_add(vector_number << 2);
        self.registers.pc = self.read_longword(vector_addr, bus);
        self.registers.next_pc = self.registers.pc.wrapping_add(2);
        self.registers.next_op_in_delay_slot = false;

        log::debug!(
            "[{}] Handled interrupt of level {interrupt_level} with vector number {vector_number}, jumped to {:08X}",
            self.name,
            self.registers.pc
        );
    }
}

fn open_bus_read(address: u32) -> u32 {
    log::warn!("Unexpected SH-2 address partition read: {address:08X}");
    0
}
