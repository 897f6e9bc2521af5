//! x86-64 backend: translates IR blocks to native code
//!
//! Register residency: SH-2 R0-R4 live in the SysV callee-saved registers rbx/r12/r13/r14/r15
//! for the duration of a block; rbp holds the `JitContext` pointer; R5-R15 stay memory-backed
//! in the context. Caller-saved registers (rax, rcx, rdx, rsi, rdi, r8-r11) are scratch, which
//! also makes bus helper calls cheap: the resident set survives them for free.
//!
//! Every observable effect is routed through the context structure: non-resident registers are
//! read and written in place, the T flag is a context word, and memory accesses call the bus
//! thunks stored in the context. Exits write back the dirty residents, bump the cycle counter,
//! store the next PC, and return the exit kind to the dispatcher.

use crate::jit::cache::BlockFn;
use crate::jit::codebuf::{CodeBuffer, ExecutableCode};
use crate::jit::ir::{ExitKind, IrBlock, IrInstruction, IrOp, IrOperand, LiveRanges};
use crate::jit;
use std::io;

// Context field displacements (verified against the struct layout by a test in jit.rs)
const GPR_OFF: i32 = jit::CTX_GPR_OFFSET;
const PC_OFF: i32 = jit::CTX_PC_OFFSET;
const PR_OFF: i32 = jit::CTX_PR_OFFSET;
const T_OFF: i32 = jit::CTX_T_OFFSET;
const CYCLES_OFF: i32 = jit::CTX_CYCLES_OFFSET;
const BUS_OFF: i32 = jit::CTX_BUS_OFFSET;
const READ8_OFF: i32 = jit::CTX_READ8_OFFSET;
const READ16_OFF: i32 = jit::CTX_READ16_OFFSET;
const READ32_OFF: i32 = jit::CTX_READ32_OFFSET;
const WRITE8_OFF: i32 = jit::CTX_WRITE8_OFFSET;
const WRITE16_OFF: i32 = jit::CTX_WRITE16_OFFSET;
const WRITE32_OFF: i32 = jit::CTX_WRITE32_OFFSET;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum X64Reg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl X64Reg {
    fn low3(self) -> u8 {
        (self as u8) & 7
    }

    fn extended(self) -> bool {
        (self as u8) >= 8
    }

    // sil/dil/spl/bpl are only addressable as byte registers with a REX prefix
    fn byte_needs_rex(self) -> bool {
        self.extended() || matches!(self, Self::Rsi | Self::Rdi | Self::Rbp)
    }
}

// SH-2 R0-R4 residents, in order
const RESIDENT: [X64Reg; 5] = [X64Reg::Rbx, X64Reg::R12, X64Reg::R13, X64Reg::R14, X64Reg::R15];

fn resident(reg: u8) -> Option<X64Reg> {
    RESIDENT.get(reg as usize).copied()
}

fn gpr_offset(reg: u8) -> i32 {
    GPR_OFF + 4 * i32::from(reg)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Cond {
    Carry = 0x2,
    NotCarry = 0x3,
    Equal = 0x4,
    NotEqual = 0x5,
    Above = 0x7,
    GreaterOrEqual = 0xD,
    Greater = 0xF,
}

// Discriminants are the ALU group's /n ModRM extension for the 0x81 imm32 forms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AluOp {
    Add = 0,
    Or = 1,
    And = 4,
    Sub = 5,
    Xor = 6,
    Cmp = 7,
}

struct Emitter<'a> {
    buf: &'a mut CodeBuffer,
}

impl Emitter<'_> {
    fn rex(&mut self, w: bool, reg: u8, rm: u8) {
        let rex = 0x40
            | (u8::from(w) << 3)
            | (u8::from(reg >= 8) << 2)
            | u8::from(rm >= 8);
        if rex != 0x40 || w {
            self.buf.emit8(rex);
        }
    }

    fn rex_force(&mut self, reg: u8, rm: u8) {
        self.buf.emit8(0x40 | (u8::from(reg >= 8) << 2) | u8::from(rm >= 8));
    }

    fn modrm_reg(&mut self, reg: u8, rm: u8) {
        self.buf.emit8(0xC0 | ((reg & 7) << 3) | (rm & 7));
    }

    // [rbp + disp32] addressing
    fn modrm_rbp_disp(&mut self, reg: u8, disp: i32) {
        self.buf.emit8(0x80 | ((reg & 7) << 3) | 0x05);
        self.buf.emit32(disp as u32);
    }

    fn push(&mut self, reg: X64Reg) {
        if reg.extended() {
            self.buf.emit8(0x41);
        }
        self.buf.emit8(0x50 + reg.low3());
    }

    fn pop(&mut self, reg: X64Reg) {
        if reg.extended() {
            self.buf.emit8(0x41);
        }
        self.buf.emit8(0x58 + reg.low3());
    }

    fn sub_rsp(&mut self, imm: i8) {
        self.buf.emit8(0x48);
        self.buf.emit8(0x83);
        self.buf.emit8(0xEC);
        self.buf.emit8(imm as u8);
    }

    fn add_rsp(&mut self, imm: i8) {
        self.buf.emit8(0x48);
        self.buf.emit8(0x83);
        self.buf.emit8(0xC4);
        self.buf.emit8(imm as u8);
    }

    // mov r64, r64
    fn mov_rr64(&mut self, dst: X64Reg, src: X64Reg) {
        self.rex(true, src as u8, dst as u8);
        self.buf.emit8(0x89);
        self.modrm_reg(src as u8, dst as u8);
    }

    // mov r32, r32
    fn mov_rr(&mut self, dst: X64Reg, src: X64Reg) {
        if dst == src {
            return;
        }
        self.rex(false, src as u8, dst as u8);
        self.buf.emit8(0x89);
        self.modrm_reg(src as u8, dst as u8);
    }

    // mov r32, imm32
    fn mov_ri(&mut self, dst: X64Reg, imm: u32) {
        if dst.extended() {
            self.buf.emit8(0x41);
        }
        self.buf.emit8(0xB8 + dst.low3());
        self.buf.emit32(imm);
    }

    // mov r32, [rbp + disp]
    fn mov_rm(&mut self, dst: X64Reg, disp: i32) {
        self.rex(false, dst as u8, 0);
        self.buf.emit8(0x8B);
        self.modrm_rbp_disp(dst as u8, disp);
    }

    // mov r64, [rbp + disp]
    fn mov_rm64(&mut self, dst: X64Reg, disp: i32) {
        self.rex(true, dst as u8, 0);
        self.buf.emit8(0x8B);
        self.modrm_rbp_disp(dst as u8, disp);
    }

    // mov [rbp + disp], r32
    fn mov_mr(&mut self, disp: i32, src: X64Reg) {
        self.rex(false, src as u8, 0);
        self.buf.emit8(0x89);
        self.modrm_rbp_disp(src as u8, disp);
    }

    // mov dword [rbp + disp], imm32
    fn mov_mi(&mut self, disp: i32, imm: u32) {
        self.buf.emit8(0xC7);
        self.modrm_rbp_disp(0, disp);
        self.buf.emit32(imm);
    }

    // ALU r32, r32 (dst = dst op src)
    fn alu_rr(&mut self, op: AluOp, dst: X64Reg, src: X64Reg) {
        let opcode = match op {
            AluOp::Add => 0x01,
            AluOp::Or => 0x09,
            AluOp::And => 0x21,
            AluOp::Sub => 0x29,
            AluOp::Xor => 0x31,
            AluOp::Cmp => 0x39,
        };
        self.rex(false, src as u8, dst as u8);
        self.buf.emit8(opcode);
        self.modrm_reg(src as u8, dst as u8);
    }

    // ALU r32, imm32
    fn alu_ri(&mut self, op: AluOp, dst: X64Reg, imm: u32) {
        self.rex(false, 0, dst as u8);
        self.buf.emit8(0x81);
        self.modrm_reg(op as u8, dst as u8);
        self.buf.emit32(imm);
    }

    // test r32, r32
    fn test_rr(&mut self, a: X64Reg, b: X64Reg) {
        self.rex(false, b as u8, a as u8);
        self.buf.emit8(0x85);
        self.modrm_reg(b as u8, a as u8);
    }

    // test r32, imm32
    fn test_ri(&mut self, reg: X64Reg, imm: u32) {
        self.rex(false, 0, reg as u8);
        self.buf.emit8(0xF7);
        self.modrm_reg(0, reg as u8);
        self.buf.emit32(imm);
    }

    fn not_r(&mut self, reg: X64Reg) {
        self.rex(false, 0, reg as u8);
        self.buf.emit8(0xF7);
        self.modrm_reg(2, reg as u8);
    }

    fn neg_r(&mut self, reg: X64Reg) {
        self.rex(false, 0, reg as u8);
        self.buf.emit8(0xF7);
        self.modrm_reg(3, reg as u8);
    }

    // D1 /n group: single-bit shifts and rotates
    fn shift1(&mut self, modrm_op: u8, reg: X64Reg) {
        self.rex(false, 0, reg as u8);
        self.buf.emit8(0xD1);
        self.modrm_reg(modrm_op, reg as u8);
    }

    // C1 /n group: shift by immediate
    fn shift_imm(&mut self, modrm_op: u8, reg: X64Reg, count: u8) {
        self.rex(false, 0, reg as u8);
        self.buf.emit8(0xC1);
        self.modrm_reg(modrm_op, reg as u8);
        self.buf.emit8(count);
    }

    // movsx r32, r8 / r16; movzx r32, r8 / r16
    fn extend(&mut self, dst: X64Reg, src: X64Reg, opcode: u8) {
        if matches!(opcode, 0xBE | 0xB6) && src.byte_needs_rex() && !src.extended() {
            self.rex_force(dst as u8, src as u8);
        } else {
            self.rex(false, dst as u8, src as u8);
        }
        self.buf.emit8(0x0F);
        self.buf.emit8(opcode);
        self.modrm_reg(dst as u8, src as u8);
    }

    fn movsx8(&mut self, dst: X64Reg, src: X64Reg) {
        self.extend(dst, src, 0xBE);
    }

    fn movsx16(&mut self, dst: X64Reg, src: X64Reg) {
        self.extend(dst, src, 0xBF);
    }

    fn movzx8(&mut self, dst: X64Reg, src: X64Reg) {
        self.extend(dst, src, 0xB6);
    }

    fn movzx16(&mut self, dst: X64Reg, src: X64Reg) {
        self.extend(dst, src, 0xB7);
    }

    // setcc r8
    fn setcc(&mut self, cond: Cond, reg: X64Reg) {
        if reg.byte_needs_rex() {
            self.rex_force(0, reg as u8);
        }
        self.buf.emit8(0x0F);
        self.buf.emit8(0x90 + cond as u8);
        self.modrm_reg(0, reg as u8);
    }

    // or r8, r8
    fn or_r8(&mut self, dst: X64Reg, src: X64Reg) {
        if dst.byte_needs_rex() || src.byte_needs_rex() {
            self.rex_force(src as u8, dst as u8);
        }
        self.buf.emit8(0x08);
        self.modrm_reg(src as u8, dst as u8);
    }

    // call qword [rbp + disp]
    fn call_m(&mut self, disp: i32) {
        self.buf.emit8(0xFF);
        self.modrm_rbp_disp(2, disp);
    }

    // jcc rel32; returns the patch position of the displacement
    fn jcc(&mut self, cond: Cond) -> usize {
        self.buf.emit8(0x0F);
        self.buf.emit8(0x80 + cond as u8);
        let pos = self.buf.position();
        self.buf.emit32(0);
        pos
    }

    fn patch_jump(&mut self, patch_pos: usize) {
        let rel = (self.buf.position() as i64 - (patch_pos as i64 + 4)) as i32;
        self.buf.patch32(patch_pos, rel as u32);
    }

    // add qword [rbp + disp], imm32
    fn add_m64_imm(&mut self, disp: i32, imm: u32) {
        self.buf.emit8(0x48);
        self.buf.emit8(0x81);
        self.modrm_rbp_disp(0, disp);
        self.buf.emit32(imm);
    }

    fn ret(&mut self) {
        self.buf.emit8(0xC3);
    }
}

#[derive(Debug)]
pub enum CompileError {
    MalformedIr(IrInstruction),
    Buffer(io::Error),
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MalformedIr(instruction) => write!(f, "malformed IR instruction: {instruction:?}"),
            Self::Buffer(source) => write!(f, "code buffer error: {source}"),
        }
    }
}

impl std::error::Error for CompileError {}

impl From<io::Error> for CompileError {
    fn from(source: io::Error) -> Self {
        Self::Buffer(source)
    }
}

pub struct X64Backend;

impl X64Backend {
    /// Compile an IR block, returning executable code whose entry point follows the
    /// [`BlockFn`] signature.
    pub fn compile(
        block: &IrBlock,
        liveness: &LiveRanges,
    ) -> Result<(ExecutableCode, BlockFn), CompileError> {
        let mut buf = CodeBuffer::new()?;
        let mut e = Emitter { buf: &mut buf };

        // Prologue: save callee-saved registers, keep the stack 16-byte aligned for thunk
        // calls, load the context pointer and the resident SH-2 registers
        e.push(X64Reg::Rbp);
        e.push(X64Reg::Rbx);
        e.push(X64Reg::R12);
        e.push(X64Reg::R13);
        e.push(X64Reg::R14);
        e.push(X64Reg::R15);
        e.sub_rsp(8);
        e.mov_rr64(X64Reg::Rbp, X64Reg::Rdi);
        for (sh2_reg, &native) in RESIDENT.iter().enumerate() {
            e.mov_rm(native, gpr_offset(sh2_reg as u8));
        }

        let mut ctx = BlockCompiler { e, block, liveness, dirty_residents: 0 };

        for (index, instruction) in block.instructions.iter().enumerate() {
            ctx.compile_instruction(instruction, index)?;
        }

        // Blocks without a control-flow terminator fall through sequentially
        if !matches!(
            block.instructions.last().map(|i| i.op),
            Some(
                IrOp::Branch
                    | IrOp::BranchCond
                    | IrOp::Call
                    | IrOp::CallReg
                    | IrOp::BranchReg
                    | IrOp::Return
            )
        ) {
            ctx.emit_exit(PcValue::Constant(block.end_addr), 0, ExitKind::Sequential);
        }

        let code = buf.make_executable()?;
        // SAFETY: the buffer contains a complete function that follows the BlockFn ABI:
        // it only returns through the emitted epilogue
        let entry_fn = unsafe { std::mem::transmute::<*const u8, BlockFn>(code.entry()) };

        Ok((code, entry_fn))
    }
}

enum PcValue {
    /// Statically known next PC
    Constant(u32),
    /// Next PC is already in eax
    InEax,
}

struct BlockCompiler<'a, 'b> {
    e: Emitter<'a>,
    block: &'b IrBlock,
    liveness: &'b LiveRanges,
    dirty_residents: u8,
}

impl BlockCompiler<'_, '_> {
    fn load_gpr(&mut self, dst: X64Reg, reg: u8) {
        match resident(reg) {
            Some(native) => self.e.mov_rr(dst, native),
            None => self.e.mov_rm(dst, gpr_offset(reg)),
        }
    }

    /// Store a computed register value. Dead stores to memory-backed registers are elided
    /// when the liveness pass proves the value is overwritten before any later read.
    fn store_gpr(&mut self, reg: u8, src: X64Reg, instruction_index: usize) {
        match resident(reg) {
            Some(native) => {
                self.e.mov_rr(native, src);
                self.dirty_residents |= 1 << reg;
            }
            None => {
                if self.is_dead_store(reg, instruction_index) {
                    return;
                }
                self.e.mov_mr(gpr_offset(reg), src);
            }
        }
    }

    fn is_dead_store(&self, reg: u8, instruction_index: usize) -> bool {
        let next = instruction_index + 1;
        if next >= self.block.len() {
            return false;
        }

        // Not read again within the block...
        if self.liveness.per_instruction[next] & (1 << reg) != 0 {
            return false;
        }
        // ...and definitely overwritten by a later instruction
        self.block.instructions[next..].iter().any(|later| {
            later.dst.reg() == Some(reg)
                && !matches!(
                    later.op,
                    IrOp::Store8
                        | IrOp::Store16
                        | IrOp::Store32
                        | IrOp::Branch
                        | IrOp::BranchCond
                        | IrOp::Call
                        | IrOp::CallReg
                )
        })
    }

    fn load_operand(&mut self, dst: X64Reg, operand: IrOperand) -> Result<(), CompileError> {
        match operand {
            IrOperand::Reg(r) => self.load_gpr(dst, r),
            IrOperand::Imm(imm) => self.e.mov_ri(dst, imm as u32),
            _ => return Err(CompileError::MalformedIr(IrInstruction::new(
                IrOp::Nop,
                operand,
                IrOperand::None,
                IrOperand::None,
            ))),
        }
        Ok(())
    }

    fn set_t_from_cond(&mut self, cond: Cond) {
        self.e.setcc(cond, X64Reg::Rdx);
        self.e.movzx8(X64Reg::Rdx, X64Reg::Rdx);
        self.e.mov_mr(T_OFF, X64Reg::Rdx);
    }

    fn alu_with_src2(
        &mut self,
        op: AluOp,
        dst: X64Reg,
        src2: IrOperand,
    ) -> Result<(), CompileError> {
        match src2 {
            IrOperand::Reg(r) => {
                self.load_gpr(X64Reg::Rcx, r);
                self.e.alu_rr(op, dst, X64Reg::Rcx);
            }
            IrOperand::Imm(imm) => self.e.alu_ri(op, dst, imm as u32),
            _ => {
                return Err(CompileError::MalformedIr(IrInstruction::new(
                    IrOp::Nop,
                    IrOperand::None,
                    IrOperand::None,
                    src2,
                )))
            }
        }
        Ok(())
    }

    fn dst_reg(&self, instruction: &IrInstruction) -> Result<u8, CompileError> {
        instruction.dst.reg().ok_or(CompileError::MalformedIr(*instruction))
    }

    #[allow(clippy::too_many_lines)]
    fn compile_instruction(
        &mut self,
        instruction: &IrInstruction,
        index: usize,
    ) -> Result<(), CompileError> {
        use X64Reg::{Rax, Rcx, Rdx, Rsi, R8, R9};

        match instruction.op {
            IrOp::Nop => {}

            IrOp::MovReg | IrOp::ExtsB | IrOp::ExtsW | IrOp::ExtuB | IrOp::ExtuW
            | IrOp::Not | IrOp::Neg => {
                self.load_operand(Rax, instruction.src1)?;
                match instruction.op {
                    IrOp::ExtsB => self.e.movsx8(Rax, Rax),
                    IrOp::ExtsW => self.e.movsx16(Rax, Rax),
                    IrOp::ExtuB => self.e.movzx8(Rax, Rax),
                    IrOp::ExtuW => self.e.movzx16(Rax, Rax),
                    IrOp::Not => self.e.not_r(Rax),
                    IrOp::Neg => self.e.neg_r(Rax),
                    _ => {}
                }
                let dst = self.dst_reg(instruction)?;
                self.store_gpr(dst, Rax, index);
            }

            IrOp::MovImm => {
                self.load_operand(Rax, instruction.src1)?;
                let dst = self.dst_reg(instruction)?;
                self.store_gpr(dst, Rax, index);
            }

            IrOp::Movt => {
                self.e.mov_rm(Rax, T_OFF);
                let dst = self.dst_reg(instruction)?;
                self.store_gpr(dst, Rax, index);
            }

            IrOp::Add | IrOp::AddImm => {
                self.load_operand(Rax, instruction.src1)?;
                self.alu_with_src2(AluOp::Add, Rax, instruction.src2)?;
                let dst = self.dst_reg(instruction)?;
                self.store_gpr(dst, Rax, index);
            }

            IrOp::Sub => {
                self.load_operand(Rax, instruction.src1)?;
                self.alu_with_src2(AluOp::Sub, Rax, instruction.src2)?;
                let dst = self.dst_reg(instruction)?;
                self.store_gpr(dst, Rax, index);
            }

            IrOp::And | IrOp::Or | IrOp::Xor => {
                let alu = match instruction.op {
                    IrOp::And => AluOp::And,
                    IrOp::Or => AluOp::Or,
                    _ => AluOp::Xor,
                };
                self.load_operand(Rax, instruction.src1)?;
                self.alu_with_src2(alu, Rax, instruction.src2)?;
                let dst = self.dst_reg(instruction)?;
                self.store_gpr(dst, Rax, index);
            }

            IrOp::Addc | IrOp::Subc => {
                let alu = if instruction.op == IrOp::Addc { AluOp::Add } else { AluOp::Sub };
                self.load_operand(Rax, instruction.src1)?;
                self.load_operand(Rcx, instruction.src2)?;
                self.e.mov_rm(Rdx, T_OFF);
                self.e.alu_rr(alu, Rax, Rcx);
                self.e.setcc(Cond::Carry, R8);
                self.e.alu_rr(alu, Rax, Rdx);
                self.e.setcc(Cond::Carry, R9);
                self.e.or_r8(R8, R9);
                self.e.movzx8(Rdx, R8);
                self.e.mov_mr(T_OFF, Rdx);
                let dst = self.dst_reg(instruction)?;
                self.store_gpr(dst, Rax, index);
            }

            IrOp::Dt => {
                self.load_operand(Rax, instruction.src1)?;
                self.e.alu_ri(AluOp::Sub, Rax, 1);
                self.set_t_from_cond(Cond::Equal);
                let dst = self.dst_reg(instruction)?;
                self.store_gpr(dst, Rax, index);
            }

            IrOp::Tst => {
                self.load_operand(Rax, instruction.src1)?;
                match instruction.src2 {
                    IrOperand::Reg(r) => {
                        self.load_gpr(Rcx, r);
                        self.e.test_rr(Rax, Rcx);
                    }
                    IrOperand::Imm(imm) => self.e.test_ri(Rax, imm as u32),
                    _ => return Err(CompileError::MalformedIr(*instruction)),
                }
                self.set_t_from_cond(Cond::Equal);
            }

            IrOp::Shll | IrOp::Shlr | IrOp::Shar | IrOp::Rotl | IrOp::Rotr => {
                let modrm_op = match instruction.op {
                    IrOp::Rotl => 0,
                    IrOp::Rotr => 1,
                    IrOp::Shll => 4,
                    IrOp::Shlr => 5,
                    _ => 7, // sar
                };
                self.load_operand(Rax, instruction.src1)?;
                self.e.shift1(modrm_op, Rax);
                self.set_t_from_cond(Cond::Carry);
                let dst = self.dst_reg(instruction)?;
                self.store_gpr(dst, Rax, index);
            }

            IrOp::ShllImm | IrOp::ShlrImm => {
                let IrOperand::Imm(count) = instruction.src2 else {
                    return Err(CompileError::MalformedIr(*instruction));
                };
                let modrm_op = if instruction.op == IrOp::ShllImm { 4 } else { 5 };
                self.load_operand(Rax, instruction.src1)?;
                self.e.shift_imm(modrm_op, Rax, count as u8);
                let dst = self.dst_reg(instruction)?;
                self.store_gpr(dst, Rax, index);
            }

            IrOp::CmpEq | IrOp::CmpEqImm | IrOp::CmpHs | IrOp::CmpGe | IrOp::CmpHi
            | IrOp::CmpGt => {
                self.load_operand(Rax, instruction.src1)?;
                self.alu_with_src2(AluOp::Cmp, Rax, instruction.src2)?;
                let cond = match instruction.op {
                    IrOp::CmpEq | IrOp::CmpEqImm => Cond::Equal,
                    IrOp::CmpHs => Cond::NotCarry,
                    IrOp::CmpGe => Cond::GreaterOrEqual,
                    IrOp::CmpHi => Cond::Above,
                    _ => Cond::Greater,
                };
                self.set_t_from_cond(cond);
            }

            IrOp::CmpPz | IrOp::CmpPl => {
                self.load_operand(Rax, instruction.src1)?;
                self.e.alu_ri(AluOp::Cmp, Rax, 0);
                let cond =
                    if instruction.op == IrOp::CmpPz { Cond::GreaterOrEqual } else { Cond::Greater };
                self.set_t_from_cond(cond);
            }

            IrOp::SetT => self.e.mov_mi(T_OFF, 1),
            IrOp::ClrT => self.e.mov_mi(T_OFF, 0),

            IrOp::Load8 | IrOp::Load16 | IrOp::Load32 => {
                let thunk = match instruction.op {
                    IrOp::Load8 => READ8_OFF,
                    IrOp::Load16 => READ16_OFF,
                    _ => READ32_OFF,
                };
                self.load_operand(Rsi, instruction.src1)?;
                self.e.mov_rm64(X64Reg::Rdi, BUS_OFF);
                self.e.call_m(thunk);
                match instruction.op {
                    IrOp::Load8 => self.e.movsx8(Rax, Rax),
                    IrOp::Load16 => self.e.movsx16(Rax, Rax),
                    _ => {}
                }
                let dst = self.dst_reg(instruction)?;
                self.store_gpr(dst, Rax, index);
            }

            IrOp::Store8 | IrOp::Store16 | IrOp::Store32 => {
                let thunk = match instruction.op {
                    IrOp::Store8 => WRITE8_OFF,
                    IrOp::Store16 => WRITE16_OFF,
                    _ => WRITE32_OFF,
                };
                self.load_operand(Rsi, instruction.src1)?;
                self.load_operand(Rdx, instruction.src2)?;
                self.e.mov_rm64(X64Reg::Rdi, BUS_OFF);
                self.e.call_m(thunk);
            }

            IrOp::Branch => {
                let IrOperand::Addr(target) = instruction.dst else {
                    return Err(CompileError::MalformedIr(*instruction));
                };
                self.emit_exit(PcValue::Constant(target), 0, ExitKind::Branch);
            }

            IrOp::Call => {
                let (IrOperand::Addr(target), IrOperand::Addr(ret)) =
                    (instruction.dst, instruction.src1)
                else {
                    return Err(CompileError::MalformedIr(*instruction));
                };
                self.e.mov_mi(PR_OFF, ret);
                self.emit_exit(PcValue::Constant(target), 0, ExitKind::Branch);
            }

            IrOp::Return => {
                self.e.mov_rm(Rax, PR_OFF);
                self.emit_exit(PcValue::InEax, 0, ExitKind::Return);
            }

            IrOp::BranchReg | IrOp::CallReg => {
                let IrOperand::Reg(target_reg) = instruction.src1 else {
                    return Err(CompileError::MalformedIr(*instruction));
                };
                if instruction.op == IrOp::CallReg {
                    let IrOperand::Addr(ret) = instruction.dst else {
                        return Err(CompileError::MalformedIr(*instruction));
                    };
                    self.e.mov_mi(PR_OFF, ret);
                }
                self.load_gpr(Rax, target_reg);
                if let IrOperand::Imm(base) = instruction.src2 {
                    self.e.alu_ri(AluOp::Add, Rax, base as u32);
                }
                self.emit_exit(PcValue::InEax, 0, ExitKind::Dynamic);
            }

            IrOp::BranchCond => {
                let (IrOperand::Addr(target), IrOperand::Flag(inverted)) =
                    (instruction.dst, instruction.src1)
                else {
                    return Err(CompileError::MalformedIr(*instruction));
                };
                let IrOperand::Imm(taken_extra) = instruction.src2 else {
                    return Err(CompileError::MalformedIr(*instruction));
                };

                self.e.mov_rm(Rax, T_OFF);
                self.e.test_rr(Rax, Rax);
                // Flag(0): branch when T is set; Flag(1): branch when T is clear
                let skip_cond = if inverted == 0 { Cond::Equal } else { Cond::NotEqual };
                let skip_patch = self.e.jcc(skip_cond);

                self.emit_exit(
                    PcValue::Constant(target),
                    taken_extra as u32,
                    ExitKind::Conditional,
                );

                self.e.patch_jump(skip_patch);
                self.emit_exit(PcValue::Constant(self.block.end_addr), 0, ExitKind::Conditional);
            }
        }

        Ok(())
    }

    /// Write back dirty residents, store the next PC, charge the block's cycles, and return
    /// to the dispatcher with the exit kind in eax.
    fn emit_exit(&mut self, pc: PcValue, extra_cycles: u32, kind: ExitKind) {
        match pc {
            PcValue::Constant(value) => self.e.mov_mi(PC_OFF, value),
            PcValue::InEax => self.e.mov_mr(PC_OFF, X64Reg::Rax),
        }

        for (sh2_reg, &native) in RESIDENT.iter().enumerate() {
            if self.dirty_residents & (1 << sh2_reg) != 0 {
                self.e.mov_mr(gpr_offset(sh2_reg as u8), native);
            }
        }

        let cycles = self.block.total_cycles + extra_cycles;
        if cycles != 0 {
            self.e.add_m64_imm(CYCLES_OFF, cycles);
        }

        self.e.mov_ri(X64Reg::Rax, kind as u32);

        self.e.add_rsp(8);
        self.e.pop(X64Reg::R15);
        self.e.pop(X64Reg::R14);
        self.e.pop(X64Reg::R13);
        self.e.pop(X64Reg::R12);
        self.e.pop(X64Reg::Rbx);
        self.e.pop(X64Reg::Rbp);
        self.e.ret();
    }
}
