//! SH-2 dynamic recompiler
//!
//! The JIT compiles one basic block at a time: the analyzer decodes SH-2 words against the
//! specification database into IR, the x86-64 backend emits native code, and the block cache
//! maps start PCs to compiled entry points. The interpreter remains the reference semantics;
//! the dispatcher only hands a block to compiled code when every opcode in it has passed
//! differential validation (see [`validator`]).

pub mod analyzer;
pub mod cache;
pub mod codebuf;
pub mod ir;
pub mod validator;
mod x64;

use crate::bus::BusInterface;
use crate::jit::analyzer::BlockAnalyzer;
use crate::jit::cache::{BlockCache, CacheStats, CompiledBlock};
use crate::jit::codebuf::ExecutableCode;
use crate::jit::x64::X64Backend;
use crate::{spec, EXTERNAL_ADDRESS_MASK, Sh2, Sh2Registers};
use rustc_hash::FxHashSet;
use std::ffi::c_void;

// Context field displacements used by the emitter; checked against the real layout below
pub(crate) const CTX_GPR_OFFSET: i32 = 0;
pub(crate) const CTX_PC_OFFSET: i32 = 64;
pub(crate) const CTX_PR_OFFSET: i32 = 68;
pub(crate) const CTX_T_OFFSET: i32 = 88;
pub(crate) const CTX_CYCLES_OFFSET: i32 = 112;
pub(crate) const CTX_BUS_OFFSET: i32 = 120;
pub(crate) const CTX_READ8_OFFSET: i32 = 128;
pub(crate) const CTX_READ16_OFFSET: i32 = 136;
pub(crate) const CTX_READ32_OFFSET: i32 = 144;
pub(crate) const CTX_WRITE8_OFFSET: i32 = 152;
pub(crate) const CTX_WRITE16_OFFSET: i32 = 160;
pub(crate) const CTX_WRITE32_OFFSET: i32 = 168;

type ReadThunk = unsafe extern "C" fn(*mut c_void, u32) -> u32;
type WriteThunk = unsafe extern "C" fn(*mut c_void, u32, u32);

/// SH-2 state in the flat layout compiled code works against.
///
/// Field order is load-bearing: the emitter addresses fields by constant displacement
/// from the context pointer.
#[repr(C)]
pub struct JitContext {
    pub gpr: [u32; 16],
    pub pc: u32,
    pub pr: u32,
    pub gbr: u32,
    pub vbr: u32,
    pub mach: u32,
    pub macl: u32,
    pub t: u32,
    pub s: u32,
    pub q: u32,
    pub m: u32,
    pub imask: u32,
    _pad: u32,
    pub cycles: u64,
    bus: *mut c_void,
    read8: ReadThunk,
    read16: ReadThunk,
    read32: ReadThunk,
    write8: WriteThunk,
    write16: WriteThunk,
    write32: WriteThunk,
}

// Bus access thunks called from generated code. These mirror the interpreter's address
// partition dispatch: partitions 0/1 reach the external bus, the cache partitions read as
// zero, and of the on-chip registers only the BCR1 magic value is visible
unsafe extern "C" fn read8_thunk<B: BusInterface>(bus: *mut c_void, address: u32) -> u32 {
    let bus = unsafe { &mut *bus.cast::<B>() };
    match address >> 29 {
        0 | 1 => bus.read_byte(address & EXTERNAL_ADDRESS_MASK).into(),
        _ => 0,
    }
}

unsafe extern "C" fn read16_thunk<B: BusInterface>(bus: *mut c_void, address: u32) -> u32 {
    let bus = unsafe { &mut *bus.cast::<B>() };
    match address >> 29 {
        0 | 1 => bus.read_word(address & EXTERNAL_ADDRESS_MASK).into(),
        _ => 0,
    }
}

unsafe extern "C" fn read32_thunk<B: BusInterface>(bus: *mut c_void, address: u32) -> u32 {
    let bus = unsafe { &mut *bus.cast::<B>() };
    match address >> 29 {
        0 | 1 => bus.read_longword(address & EXTERNAL_ADDRESS_MASK),
        7 if address == 0xFFFFFFE0 => 0xA55A0001,
        _ => 0,
    }
}

unsafe extern "C" fn write8_thunk<B: BusInterface>(bus: *mut c_void, address: u32, value: u32) {
    let bus = unsafe { &mut *bus.cast::<B>() };
    if address >> 29 <= 1 {
        bus.write_byte(address & EXTERNAL_ADDRESS_MASK, value as u8);
    }
}

unsafe extern "C" fn write16_thunk<B: BusInterface>(bus: *mut c_void, address: u32, value: u32) {
    let bus = unsafe { &mut *bus.cast::<B>() };
    if address >> 29 <= 1 {
        bus.write_word(address & EXTERNAL_ADDRESS_MASK, value as u16);
    }
}

unsafe extern "C" fn write32_thunk<B: BusInterface>(bus: *mut c_void, address: u32, value: u32) {
    let bus = unsafe { &mut *bus.cast::<B>() };
    if address >> 29 <= 1 {
        bus.write_longword(address & EXTERNAL_ADDRESS_MASK, value);
    }
}

impl JitContext {
    fn new<B: BusInterface>(registers: &Sh2Registers, bus: &mut B) -> Self {
        Self {
            gpr: registers.gpr,
            pc: registers.pc,
            pr: registers.pr,
            gbr: registers.gbr,
            vbr: registers.vbr,
            mach: registers.mach,
            macl: registers.macl,
            t: registers.sr.t.into(),
            s: registers.sr.s.into(),
            q: registers.sr.q.into(),
            m: registers.sr.m.into(),
            imask: registers.sr.interrupt_mask.into(),
            _pad: 0,
            cycles: registers.cycles,
            bus: std::ptr::from_mut(bus).cast(),
            read8: read8_thunk::<B>,
            read16: read16_thunk::<B>,
            read32: read32_thunk::<B>,
            write8: write8_thunk::<B>,
            write16: write16_thunk::<B>,
            write32: write32_thunk::<B>,
        }
    }

    fn write_back(&self, registers: &mut Sh2Registers) {
        registers.gpr = self.gpr;
        registers.pc = self.pc;
        registers.next_pc = self.pc.wrapping_add(2);
        registers.next_op_in_delay_slot = false;
        registers.pr = self.pr;
        registers.gbr = self.gbr;
        registers.vbr = self.vbr;
        registers.mach = self.mach;
        registers.macl = self.macl;
        registers.sr.t = self.t != 0;
        registers.sr.s = self.s != 0;
        registers.sr.q = self.q != 0;
        registers.sr.m = self.m != 0;
        registers.sr.interrupt_mask = self.imask as u8;
        registers.cycles = self.cycles;
    }
}

/// Block dispatcher and compilation driver for one SH-2.
pub struct Sh2Jit {
    analyzer: BlockAnalyzer,
    cache: BlockCache,
    // Keeps every compiled mapping alive; cache invalidation only unlinks entries
    code: Vec<ExecutableCode>,
    // Spec database indices cleared for compilation by the validator
    verified: FxHashSet<usize>,
}

impl Default for Sh2Jit {
    fn default() -> Self {
        Self::new()
    }
}

impl Sh2Jit {
    #[must_use]
    pub fn new() -> Self {
        Self {
            analyzer: BlockAnalyzer::new(),
            cache: BlockCache::new(),
            code: Vec::new(),
            verified: FxHashSet::default(),
        }
    }

    /// Replace the set of opcodes the dispatcher may compile. Only spec database indices
    /// whose generated test suite passed belong here; everything else stays on the
    /// interpreter. Existing compiled blocks are dropped because the old set produced them.
    pub fn set_verified_opcodes(&mut self, indices: impl IntoIterator<Item = usize>) {
        self.verified = indices.into_iter().collect();
        self.clear();
    }

    #[must_use]
    pub fn verified_opcode_count(&self) -> usize {
        self.verified.len()
    }

    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Drop blocks whose start PC falls in `[start, end)`. Callers widen the range past the
    /// written bytes so that blocks spanning the write are caught too.
    pub fn invalidate(&mut self, start: u32, end: u32) {
        self.cache.invalidate(start, end);
    }

    pub fn clear(&mut self) {
        self.cache.clear();
        self.code.clear();
    }

    /// Try to run one compiled block at the CPU's current PC.
    ///
    /// Returns `false` (without executing anything) when the JIT cannot or should not take
    /// over: pending reset or interrupt, a delay slot in flight, or no compilable block at
    /// this address. The caller falls back to the interpreter.
    pub fn run<B: BusInterface>(&mut self, cpu: &mut Sh2, bus: &mut B) -> bool {
        // The only backend targets x86-64
        if !cfg!(target_arch = "x86_64") {
            return false;
        }

        let registers = cpu.registers();
        if cpu.reset_pending
            || registers.next_op_in_delay_slot
            || bus.reset()
            || bus.interrupt_level() > registers.sr.interrupt_mask
        {
            return false;
        }

        let pc = registers.pc;
        let block = match self.cache.lookup(pc) {
            Some(block) => block,
            None => {
                if self.cache.is_failed(pc) {
                    return false;
                }
                match self.compile_block(pc, bus) {
                    Some(block) => block,
                    None => {
                        self.cache.record_failure(pc);
                        return false;
                    }
                }
            }
        };

        let mut ctx = JitContext::new(cpu.registers(), bus);
        // SAFETY: the entry pointer targets a mapping kept alive by self.code, and the
        // compiled code only dereferences the context passed to it
        let exit_code = unsafe { (block.entry)(&mut ctx) };
        ctx.write_back(cpu.registers_mut());

        log::trace!(
            "[{}] Ran compiled block {pc:08X}..{:08X}, exit {exit_code}, next PC {:08X}",
            cpu.name(),
            block.end_addr,
            cpu.registers().pc
        );

        true
    }

    fn compile_block<B: BusInterface>(&mut self, pc: u32, bus: &mut B) -> Option<CompiledBlock> {
        let verified = &self.verified;
        let block = self.analyzer.analyze(
            |addr| bus.read_word(addr & EXTERNAL_ADDRESS_MASK),
            pc,
            |word| spec::decode_index(word).is_some_and(|index| verified.contains(&index)),
        )?;

        let liveness = self.analyzer.analyze_liveness(&block);

        match X64Backend::compile(&block, &liveness) {
            Ok((code, entry)) => {
                let compiled = CompiledBlock {
                    start_addr: block.start_addr,
                    end_addr: block.end_addr,
                    instruction_count: block.len() as u32,
                    entry,
                };
                self.code.push(code);
                self.cache.insert(compiled);
                log::debug!(
                    "Compiled block {pc:08X}..{:08X} ({} IR instructions, exit {:?})",
                    block.end_addr,
                    block.len(),
                    block.exit
                );
                Some(compiled)
            }
            Err(error) => {
                log::warn!("Failed to compile block at {pc:08X}: {error}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::offset_of;

    #[test]
    fn context_offsets_match_the_emitter_constants() {
        assert_eq!(offset_of!(JitContext, gpr), CTX_GPR_OFFSET as usize);
        assert_eq!(offset_of!(JitContext, pc), CTX_PC_OFFSET as usize);
        assert_eq!(offset_of!(JitContext, pr), CTX_PR_OFFSET as usize);
        assert_eq!(offset_of!(JitContext, t), CTX_T_OFFSET as usize);
        assert_eq!(offset_of!(JitContext, cycles), CTX_CYCLES_OFFSET as usize);
        assert_eq!(offset_of!(JitContext, bus), CTX_BUS_OFFSET as usize);
        assert_eq!(offset_of!(JitContext, read8), CTX_READ8_OFFSET as usize);
        assert_eq!(offset_of!(JitContext, read16), CTX_READ16_OFFSET as usize);
        assert_eq!(offset_of!(JitContext, read32), CTX_READ32_OFFSET as usize);
        assert_eq!(offset_of!(JitContext, write8), CTX_WRITE8_OFFSET as usize);
        assert_eq!(offset_of!(JitContext, write16), CTX_WRITE16_OFFSET as usize);
        assert_eq!(offset_of!(JitContext, write32), CTX_WRITE32_OFFSET as usize);
    }
}
