//! Block analyzer: walks SH-2 code through an injected memory-read closure, decodes each word
//! against the specification database, and builds a typed IR block for the backend.
//!
//! Translation covers the register-to-register core of the instruction set plus simple
//! indirect loads/stores and the common branch forms. Anything else ends the block; if the
//! very first instruction is untranslatable the whole analysis fails and the caller falls
//! back to the interpreter.

use crate::jit::ir::{ExitKind, IrBlock, IrInstruction, IrOp, IrOperand, LiveRanges};
use crate::spec;

pub const DEFAULT_MAX_BLOCK_LEN: usize = 100;

#[derive(Debug, Clone, Copy)]
enum Decoded {
    Simple(IrInstruction),
    Terminator(Terminator),
    Unsupported,
}

#[derive(Debug, Clone, Copy)]
struct Terminator {
    instruction: IrInstruction,
    exit: ExitKind,
    branch_target: u32,
    has_delay_slot: bool,
    /// Register whose value the exit target depends on (register-indirect branches); the
    /// delay slot must not write it
    target_register: Option<u8>,
}

pub struct BlockAnalyzer {
    max_block_len: usize,
}

impl Default for BlockAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockAnalyzer {
    #[must_use]
    pub fn new() -> Self {
        Self { max_block_len: DEFAULT_MAX_BLOCK_LEN }
    }

    #[must_use]
    pub fn with_max_block_len(max_block_len: usize) -> Self {
        Self { max_block_len }
    }

    /// Build an IR block starting at `start_pc`.
    ///
    /// `read` fetches instruction words; `allowed` filters which opcode words may be
    /// compiled (the dispatcher passes the validated-opcode predicate here).
    ///
    /// Returns `None` when nothing at `start_pc` can be compiled.
    pub fn analyze<R, A>(&self, mut read: R, start_pc: u32, allowed: A) -> Option<IrBlock>
    where
        R: FnMut(u32) -> u16,
        A: Fn(u16) -> bool,
    {
        let mut block = IrBlock::new(start_pc);
        let mut pc = start_pc;

        while block.len() < self.max_block_len {
            let word = read(pc);

            let decoded =
                if allowed(word) { translate(pc, word) } else { Decoded::Unsupported };

            match decoded {
                Decoded::Simple(instruction) => {
                    block.push(instruction);
                    pc = pc.wrapping_add(2);
                }
                Decoded::Terminator(terminator) => {
                    if terminator.has_delay_slot {
                        let slot_addr = pc.wrapping_add(2);
                        let slot_word = read(slot_addr);
                        let slot = if allowed(slot_word) {
                            translate(slot_addr, slot_word)
                        } else {
                            Decoded::Unsupported
                        };

                        match slot {
                            Decoded::Simple(slot_instruction)
                                if !writes_register(
                                    &slot_instruction,
                                    terminator.target_register,
                                ) =>
                            {
                                // The delay slot executes before the branch takes effect,
                                // so it is ordered ahead of the branch in IR
                                block.push(slot_instruction);
                            }
                            _ => {
                                // Slot instruction is untranslatable (or is itself a branch,
                                // which hardware treats as a slot illegal); stop before the
                                // terminator and let the interpreter run it
                                if block.is_empty() {
                                    return None;
                                }
                                block.exit = ExitKind::Sequential;
                                return Some(block);
                            }
                        }
                    }

                    block.push(terminator.instruction);
                    block.exit = terminator.exit;
                    block.branch_target = terminator.branch_target;
                    block.terminator_has_delay_slot = terminator.has_delay_slot;
                    return Some(block);
                }
                Decoded::Unsupported => {
                    if block.is_empty() {
                        return None;
                    }
                    block.exit = ExitKind::Sequential;
                    return Some(block);
                }
            }
        }

        block.exit = ExitKind::Sequential;
        Some(block)
    }

    /// Backward dataflow liveness: sources become live, destinations kill liveness when not
    /// also a source. The per-instruction masks drive the backend's residency decisions.
    #[must_use]
    pub fn analyze_liveness(&self, block: &IrBlock) -> LiveRanges {
        let mut ranges = LiveRanges {
            live_in: 0,
            live_out: 0,
            per_instruction: vec![0; block.len()],
        };

        let mut live: u16 = 0;
        for (i, instruction) in block.instructions.iter().enumerate().rev() {
            if let Some(r) = instruction.src1.reg() {
                live |= 1 << r;
            }
            if let Some(r) = instruction.src2.reg() {
                live |= 1 << r;
            }

            ranges.per_instruction[i] = live;

            if is_register_write(instruction) {
                if let Some(r) = instruction.dst.reg() {
                    live &= !(1 << r);
                }
            }
        }

        ranges.live_in = live;
        ranges.live_out = ranges.per_instruction.last().copied().unwrap_or(0);
        ranges
    }
}

fn is_register_write(instruction: &IrInstruction) -> bool {
    !matches!(
        instruction.op,
        IrOp::Store8 | IrOp::Store16 | IrOp::Store32 | IrOp::Branch | IrOp::BranchCond
    )
}

fn writes_register(instruction: &IrInstruction, register: Option<u8>) -> bool {
    let Some(register) = register else {
        return false;
    };
    is_register_write(instruction) && instruction.dst.reg() == Some(register)
}

fn ir(op: IrOp, dst: IrOperand, src1: IrOperand, src2: IrOperand, addr: u32, word: u16) -> Decoded {
    Decoded::Simple(
        IrInstruction::new(op, dst, src1, src2).with_cycles(spec::issue_cycles(word)).at(addr),
    )
}

#[allow(clippy::too_many_lines)]
fn translate(addr: u32, word: u16) -> Decoded {
    use IrOperand::{Addr, Flag, Imm, Reg};

    let n = ((word >> 8) & 0xF) as u8;
    let m = ((word >> 4) & 0xF) as u8;

    // Exact encodings first
    match word {
        // NOP
        0x0009 => return ir(IrOp::Nop, IrOperand::None, IrOperand::None, IrOperand::None, addr, word),
        // CLRT / SETT
        0x0008 => return ir(IrOp::ClrT, IrOperand::None, IrOperand::None, IrOperand::None, addr, word),
        0x0018 => return ir(IrOp::SetT, IrOperand::None, IrOperand::None, IrOperand::None, addr, word),
        // RTS
        0x000B => {
            return Decoded::Terminator(Terminator {
                instruction: IrInstruction::new(
                    IrOp::Return,
                    IrOperand::None,
                    IrOperand::None,
                    IrOperand::None,
                )
                .with_cycles(spec::issue_cycles(word))
                .at(addr),
                exit: ExitKind::Return,
                branch_target: 0,
                has_delay_slot: true,
                target_register: None,
            });
        }
        _ => {}
    }

    match word & 0xF00F {
        // MOV Rm, Rn
        0x6003 => return ir(IrOp::MovReg, Reg(n), Reg(m), IrOperand::None, addr, word),
        // ADD / ADDC / SUB / SUBC
        0x300C => return ir(IrOp::Add, Reg(n), Reg(n), Reg(m), addr, word),
        0x300E => return ir(IrOp::Addc, Reg(n), Reg(n), Reg(m), addr, word),
        0x3008 => return ir(IrOp::Sub, Reg(n), Reg(n), Reg(m), addr, word),
        0x300A => return ir(IrOp::Subc, Reg(n), Reg(n), Reg(m), addr, word),
        // NEG
        0x600B => return ir(IrOp::Neg, Reg(n), Reg(m), IrOperand::None, addr, word),
        // Logic
        0x2009 => return ir(IrOp::And, Reg(n), Reg(n), Reg(m), addr, word),
        0x200B => return ir(IrOp::Or, Reg(n), Reg(n), Reg(m), addr, word),
        0x200A => return ir(IrOp::Xor, Reg(n), Reg(n), Reg(m), addr, word),
        0x6007 => return ir(IrOp::Not, Reg(n), Reg(m), IrOperand::None, addr, word),
        0x2008 => return ir(IrOp::Tst, IrOperand::None, Reg(n), Reg(m), addr, word),
        // Compares
        0x3000 => return ir(IrOp::CmpEq, IrOperand::None, Reg(n), Reg(m), addr, word),
        0x3002 => return ir(IrOp::CmpHs, IrOperand::None, Reg(n), Reg(m), addr, word),
        0x3003 => return ir(IrOp::CmpGe, IrOperand::None, Reg(n), Reg(m), addr, word),
        0x3006 => return ir(IrOp::CmpHi, IrOperand::None, Reg(n), Reg(m), addr, word),
        0x3007 => return ir(IrOp::CmpGt, IrOperand::None, Reg(n), Reg(m), addr, word),
        // Extensions
        0x600E => return ir(IrOp::ExtsB, Reg(n), Reg(m), IrOperand::None, addr, word),
        0x600F => return ir(IrOp::ExtsW, Reg(n), Reg(m), IrOperand::None, addr, word),
        0x600C => return ir(IrOp::ExtuB, Reg(n), Reg(m), IrOperand::None, addr, word),
        0x600D => return ir(IrOp::ExtuW, Reg(n), Reg(m), IrOperand::None, addr, word),
        // Simple indirect loads (sign-extending) and stores
        0x6000 => return ir(IrOp::Load8, Reg(n), Reg(m), IrOperand::None, addr, word),
        0x6001 => return ir(IrOp::Load16, Reg(n), Reg(m), IrOperand::None, addr, word),
        0x6002 => return ir(IrOp::Load32, Reg(n), Reg(m), IrOperand::None, addr, word),
        0x2000 => return ir(IrOp::Store8, IrOperand::None, Reg(n), Reg(m), addr, word),
        0x2001 => return ir(IrOp::Store16, IrOperand::None, Reg(n), Reg(m), addr, word),
        0x2002 => return ir(IrOp::Store32, IrOperand::None, Reg(n), Reg(m), addr, word),
        _ => {}
    }

    match word & 0xF0FF {
        // MOVT
        0x0029 => return ir(IrOp::Movt, Reg(n), Flag(0), IrOperand::None, addr, word),
        // DT
        0x4010 => return ir(IrOp::Dt, Reg(n), Reg(n), IrOperand::None, addr, word),
        // CMP/PZ, CMP/PL
        0x4011 => return ir(IrOp::CmpPz, IrOperand::None, Reg(n), IrOperand::None, addr, word),
        0x4015 => return ir(IrOp::CmpPl, IrOperand::None, Reg(n), IrOperand::None, addr, word),
        // Single-bit shifts and rotates (SHAL shares the SHLL result)
        0x4000 | 0x4020 => return ir(IrOp::Shll, Reg(n), Reg(n), IrOperand::None, addr, word),
        0x4001 => return ir(IrOp::Shlr, Reg(n), Reg(n), IrOperand::None, addr, word),
        0x4021 => return ir(IrOp::Shar, Reg(n), Reg(n), IrOperand::None, addr, word),
        0x4004 => return ir(IrOp::Rotl, Reg(n), Reg(n), IrOperand::None, addr, word),
        0x4005 => return ir(IrOp::Rotr, Reg(n), Reg(n), IrOperand::None, addr, word),
        // Multi-bit shifts
        0x4008 => return ir(IrOp::ShllImm, Reg(n), Reg(n), Imm(2), addr, word),
        0x4009 => return ir(IrOp::ShlrImm, Reg(n), Reg(n), Imm(2), addr, word),
        0x4018 => return ir(IrOp::ShllImm, Reg(n), Reg(n), Imm(8), addr, word),
        0x4019 => return ir(IrOp::ShlrImm, Reg(n), Reg(n), Imm(8), addr, word),
        0x4028 => return ir(IrOp::ShllImm, Reg(n), Reg(n), Imm(16), addr, word),
        0x4029 => return ir(IrOp::ShlrImm, Reg(n), Reg(n), Imm(16), addr, word),
        // JMP @Rm / JSR @Rm
        0x402B => {
            return Decoded::Terminator(Terminator {
                instruction: IrInstruction::new(
                    IrOp::BranchReg,
                    IrOperand::None,
                    Reg(n),
                    IrOperand::None,
                )
                .with_cycles(spec::issue_cycles(word))
                .at(addr),
                exit: ExitKind::Dynamic,
                branch_target: 0,
                has_delay_slot: true,
                target_register: Some(n),
            });
        }
        0x400B => {
            let ret = addr.wrapping_add(4);
            return Decoded::Terminator(Terminator {
                instruction: IrInstruction::new(IrOp::CallReg, Addr(ret), Reg(n), IrOperand::None)
                    .with_cycles(spec::issue_cycles(word))
                    .at(addr),
                exit: ExitKind::Dynamic,
                branch_target: 0,
                has_delay_slot: true,
                target_register: Some(n),
            });
        }
        // BRAF Rm / BSRF Rm: target = PC + 4 + Rm
        0x0023 => {
            let base = addr.wrapping_add(4);
            return Decoded::Terminator(Terminator {
                instruction: IrInstruction::new(
                    IrOp::BranchReg,
                    IrOperand::None,
                    Reg(n),
                    Imm(base as i32),
                )
                .with_cycles(spec::issue_cycles(word))
                .at(addr),
                exit: ExitKind::Dynamic,
                branch_target: 0,
                has_delay_slot: true,
                target_register: Some(n),
            });
        }
        0x0003 => {
            let base = addr.wrapping_add(4);
            return Decoded::Terminator(Terminator {
                instruction: IrInstruction::new(IrOp::CallReg, Addr(base), Reg(n), Imm(base as i32))
                    .with_cycles(spec::issue_cycles(word))
                    .at(addr),
                exit: ExitKind::Dynamic,
                branch_target: 0,
                has_delay_slot: true,
                target_register: Some(n),
            });
        }
        _ => {}
    }

    match word & 0xFF00 {
        // BT / BF: branch without delay slot; taken costs 2 extra cycles
        0x8900 | 0x8B00 => {
            let disp = i32::from(word as i8) << 1;
            let target = addr.wrapping_add(4).wrapping_add(disp as u32);
            let branch_on_t = word & 0xFF00 == 0x8900;
            return Decoded::Terminator(Terminator {
                instruction: IrInstruction::new(
                    IrOp::BranchCond,
                    Addr(target),
                    Flag(u8::from(!branch_on_t)),
                    Imm(2),
                )
                .with_cycles(spec::issue_cycles(word))
                .at(addr),
                exit: ExitKind::Conditional,
                branch_target: target,
                has_delay_slot: false,
                target_register: None,
            });
        }
        // BT/S / BF/S: delayed conditional; taken costs 1 extra cycle
        0x8D00 | 0x8F00 => {
            let disp = i32::from(word as i8) << 1;
            let target = addr.wrapping_add(4).wrapping_add(disp as u32);
            let branch_on_t = word & 0xFF00 == 0x8D00;
            return Decoded::Terminator(Terminator {
                instruction: IrInstruction::new(
                    IrOp::BranchCond,
                    Addr(target),
                    Flag(u8::from(!branch_on_t)),
                    Imm(1),
                )
                .with_cycles(spec::issue_cycles(word))
                .at(addr),
                exit: ExitKind::Conditional,
                branch_target: target,
                has_delay_slot: true,
                target_register: None,
            });
        }
        // CMP/EQ #imm, R0
        0x8800 => {
            let imm = i32::from(word as i8);
            return ir(IrOp::CmpEqImm, IrOperand::None, Reg(0), Imm(imm), addr, word);
        }
        // AND/OR/XOR/TST #imm, R0 (zero-extended)
        0xC900 => {
            return ir(IrOp::And, Reg(0), Reg(0), Imm(i32::from(word & 0xFF)), addr, word);
        }
        0xCB00 => return ir(IrOp::Or, Reg(0), Reg(0), Imm(i32::from(word & 0xFF)), addr, word),
        0xCA00 => return ir(IrOp::Xor, Reg(0), Reg(0), Imm(i32::from(word & 0xFF)), addr, word),
        0xC800 => {
            return ir(IrOp::Tst, IrOperand::None, Reg(0), Imm(i32::from(word & 0xFF)), addr, word);
        }
        _ => {}
    }

    match word & 0xF000 {
        // MOV #imm, Rn
        0xE000 => return ir(IrOp::MovImm, Reg(n), Imm(i32::from(word as i8)), IrOperand::None, addr, word),
        // ADD #imm, Rn
        0x7000 => return ir(IrOp::AddImm, Reg(n), Reg(n), Imm(i32::from(word as i8)), addr, word),
        // BRA / BSR
        0xA000 | 0xB000 => {
            let disp = i32::from(((word as i16) << 4) >> 4) << 1;
            let target = addr.wrapping_add(4).wrapping_add(disp as u32);
            let is_call = word & 0xF000 == 0xB000;
            let instruction = if is_call {
                IrInstruction::new(
                    IrOp::Call,
                    Addr(target),
                    Addr(addr.wrapping_add(4)),
                    IrOperand::None,
                )
            } else {
                IrInstruction::new(IrOp::Branch, Addr(target), IrOperand::None, IrOperand::None)
            };
            return Decoded::Terminator(Terminator {
                instruction: instruction.with_cycles(spec::issue_cycles(word)).at(addr),
                exit: ExitKind::Branch,
                branch_target: target,
                has_delay_slot: true,
                target_register: None,
            });
        }
        _ => {}
    }

    Decoded::Unsupported
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analyze_words(words: &[u16]) -> Option<IrBlock> {
        let analyzer = BlockAnalyzer::new();
        analyzer.analyze(
            |addr| {
                let index = ((addr - 0x0600_4000) / 2) as usize;
                words.get(index).copied().unwrap_or(0x0009)
            },
            0x0600_4000,
            |_| true,
        )
    }

    #[test]
    fn straight_line_block_ends_at_branch() {
        // MOV #5, R1; ADD R2, R1; BRA +disp(0); NOP (delay slot)
        let block = analyze_words(&[0xE105, 0x312C, 0xA000, 0x0009]).unwrap();

        assert_eq!(block.exit, ExitKind::Branch);
        assert!(block.terminator_has_delay_slot);
        // MOV, ADD, delay-slot NOP, branch
        assert_eq!(block.len(), 4);
        assert_eq!(block.end_addr, 0x0600_4008);
        // BRA at 0x06004004 with disp 0 targets 0x06004008
        assert_eq!(block.branch_target, 0x0600_4008);
    }

    #[test]
    fn unsupported_first_instruction_fails_analysis() {
        // MAC.L @R1+, @R2+ is interpreter-only
        assert!(analyze_words(&[0x020F]).is_none());
    }

    #[test]
    fn unsupported_instruction_ends_block() {
        let block = analyze_words(&[0xE105, 0x020F, 0xE106]).unwrap();
        assert_eq!(block.exit, ExitKind::Sequential);
        assert_eq!(block.len(), 1);
        assert_eq!(block.end_addr, 0x0600_4002);
    }

    #[test]
    fn delay_slot_writing_jump_register_aborts_the_terminator() {
        // JSR @R3 with MOV #0, R3 in the delay slot; the captured target would be clobbered
        let block = analyze_words(&[0xE105, 0x430B, 0xE300]).unwrap();
        assert_eq!(block.exit, ExitKind::Sequential);
        assert_eq!(block.len(), 1);
    }

    #[test]
    fn liveness_masks_track_backward_flow() {
        // MOV R2, R1; ADD R3, R1
        let block = analyze_words(&[0x6123, 0x313C, 0x020F]).unwrap();
        let analyzer = BlockAnalyzer::new();
        let ranges = analyzer.analyze_liveness(&block);

        // At the MOV, R2 and R3 are live (R3 read by the ADD); R1 is not (overwritten first)
        assert!(ranges.is_live(0, 2));
        assert!(ranges.is_live(0, 3));
        assert_eq!(ranges.live_in & (1 << 1), 0);
        // At the ADD, R1 and R3 are live
        assert!(ranges.is_live(1, 1));
        assert!(ranges.is_live(1, 3));
    }

    #[test]
    fn max_block_len_bounds_analysis() {
        let analyzer = BlockAnalyzer::with_max_block_len(10);
        let block = analyzer.analyze(|_| 0xE105, 0x0600_4000, |_| true).unwrap();
        assert_eq!(block.len(), 10);
        assert_eq!(block.exit, ExitKind::Sequential);
    }
}
