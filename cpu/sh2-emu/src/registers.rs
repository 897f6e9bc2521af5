//! SH-2 architectural registers

use crate::RESET_INTERRUPT_MASK;
use bincode::{Decode, Encode};
use brimir_common::num::GetBit;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct StatusRegister {
    // Interrupt levels <= this value are masked
    pub interrupt_mask: u8,
    // Carry/test flag, written by most arithmetic and all compare instructions
    pub t: bool,
    // Saturation flag used by the multiply-accumulate instructions
    pub s: bool,
    // Division step flags
    pub q: bool,
    pub m: bool,
}

impl Default for StatusRegister {
    fn default() -> Self {
        Self { interrupt_mask: RESET_INTERRUPT_MASK, t: false, s: false, q: false, m: false }
    }
}

impl From<u32> for StatusRegister {
    fn from(value: u32) -> Self {
        Self {
            interrupt_mask: ((value >> 4) & 0xF) as u8,
            t: value.bit(0),
            s: value.bit(1),
            q: value.bit(8),
            m: value.bit(9),
        }
    }
}

impl From<StatusRegister> for u32 {
    fn from(value: StatusRegister) -> Self {
        (u32::from(value.m) << 9)
            | (u32::from(value.q) << 8)
            | (u32::from(value.interrupt_mask) << 4)
            | (u32::from(value.s) << 1)
            | u32::from(value.t)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Encode, Decode)]
pub struct Sh2Registers {
    // General-purpose registers; R15 doubles as the hardware stack pointer
    pub gpr: [u32; 16],
    pub sr: StatusRegister,
    // Global base register (GBR addressing modes)
    pub gbr: u32,
    // Vector base register (base of the exception vector table)
    pub vbr: u32,
    // Multiply-accumulator
    pub mach: u32,
    pub macl: u32,
    // Procedure register (subroutine return address)
    pub pr: u32,
    // Program counter; next_pc is where execution continues after the current instruction,
    // which is how branch delay slots are modeled
    pub pc: u32,
    pub next_pc: u32,
    // Set when next_pc was redirected by an instruction with a branch delay slot
    pub next_op_in_delay_slot: bool,
    // Executed-cycle counter, advanced per instruction using the specification database
    pub cycles: u64,
}

impl Sh2Registers {
    #[must_use]
    pub fn mac(&self) -> i64 {
        ((i64::from(self.mach) << 32) as u64 | u64::from(self.macl)) as i64
    }

    pub fn set_mac(&mut self, mac: i64) {
        self.macl = mac as u32;
        self.mach = ((mac as u64) >> 32) as u32;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sr_round_trips_through_u32() {
        let sr = StatusRegister { interrupt_mask: 9, t: true, s: false, q: true, m: false };
        let word: u32 = sr.into();
        assert_eq!(word, (1 << 8) | (9 << 4) | 1);
        assert_eq!(StatusRegister::from(word), sr);
    }

    #[test]
    fn mac_combines_halves() {
        let mut registers = Sh2Registers::default();
        registers.set_mac(-2);
        assert_eq!(registers.mach, 0xFFFFFFFF);
        assert_eq!(registers.macl, 0xFFFFFFFE);
        assert_eq!(registers.mac(), -2);
    }
}
