//! Dual-execution differential validation
//!
//! Every test case runs the same instruction through the interpreter and through a
//! single-instruction compiled block on identical isolated contexts, then compares the full
//! architectural state and test RAM byte for byte. The generated suite drives which opcodes
//! the dispatcher is allowed to compile: an opcode is cleared for JIT execution only after
//! its whole suite passes.

use crate::bus::BusInterface;
use crate::jit::analyzer::BlockAnalyzer;
use crate::jit::x64::X64Backend;
use crate::jit::JitContext;
use crate::spec::{self, InstructionSpec};
use crate::{disassemble, Sh2, Sh2Registers};

// Test code lives at this address inside the test RAM
const TEST_PC: u32 = 0x1000;

const TEST_RAM_LEN: usize = 64 * 1024;

/// Complete architectural state snapshot for comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sh2State {
    pub r: [u32; 16],
    pub pc: u32,
    pub pr: u32,
    pub gbr: u32,
    pub vbr: u32,
    pub mach: u32,
    pub macl: u32,
    pub t: bool,
    pub s: bool,
    pub q: bool,
    pub m: bool,
    pub imask: u8,
    pub cycles: u64,
}

impl Default for Sh2State {
    fn default() -> Self {
        Self {
            r: [0; 16],
            pc: TEST_PC,
            pr: 0x3000,
            gbr: 0x4000,
            vbr: 0,
            mach: 0,
            macl: 0,
            t: false,
            s: false,
            q: false,
            m: false,
            imask: 0,
            cycles: 0,
        }
    }
}

impl Sh2State {
    fn apply_to(&self, registers: &mut Sh2Registers) {
        registers.gpr = self.r;
        registers.pc = self.pc;
        registers.next_pc = self.pc.wrapping_add(2);
        registers.next_op_in_delay_slot = false;
        registers.pr = self.pr;
        registers.gbr = self.gbr;
        registers.vbr = self.vbr;
        registers.mach = self.mach;
        registers.macl = self.macl;
        registers.sr.t = self.t;
        registers.sr.s = self.s;
        registers.sr.q = self.q;
        registers.sr.m = self.m;
        registers.sr.interrupt_mask = self.imask;
        registers.cycles = self.cycles;
    }

    fn capture(registers: &Sh2Registers) -> Self {
        Self {
            r: registers.gpr,
            pc: registers.pc,
            pr: registers.pr,
            gbr: registers.gbr,
            vbr: registers.vbr,
            mach: registers.mach,
            macl: registers.macl,
            t: registers.sr.t,
            s: registers.sr.s,
            q: registers.sr.q,
            m: registers.sr.m,
            imask: registers.sr.interrupt_mask,
            cycles: registers.cycles,
        }
    }

    /// Name every field where `self` and `other` differ.
    #[must_use]
    pub fn diff(&self, other: &Self) -> Vec<String> {
        let mut diffs = Vec::new();

        for i in 0..16 {
            if self.r[i] != other.r[i] {
                diffs.push(format!("R{i}: {:08X} vs {:08X}", self.r[i], other.r[i]));
            }
        }

        macro_rules! check {
            ($field:ident, $fmt:literal) => {
                if self.$field != other.$field {
                    diffs.push(format!(
                        concat!(stringify!($field), ": ", $fmt, " vs ", $fmt),
                        self.$field, other.$field
                    ));
                }
            };
        }

        check!(pc, "{:08X}");
        check!(pr, "{:08X}");
        check!(gbr, "{:08X}");
        check!(vbr, "{:08X}");
        check!(mach, "{:08X}");
        check!(macl, "{:08X}");
        check!(t, "{}");
        check!(s, "{}");
        check!(q, "{}");
        check!(m, "{}");
        check!(imask, "{}");
        check!(cycles, "{}");

        diffs
    }
}

/// Flat big-endian RAM covering every access the tests can make (addresses wrap).
struct TestBus {
    ram: Box<[u8; TEST_RAM_LEN]>,
}

impl TestBus {
    fn new(instruction: u16) -> Self {
        let mut ram: Box<[u8; TEST_RAM_LEN]> =
            vec![0; TEST_RAM_LEN].into_boxed_slice().try_into().unwrap();

        // Recognizable pattern so memory loads read something other than zero
        for (i, byte) in ram.iter_mut().enumerate() {
            *byte = (i as u8).wrapping_mul(31).wrapping_add(7);
        }

        let pc = TEST_PC as usize;
        ram[pc..pc + 2].copy_from_slice(&instruction.to_be_bytes());
        // NOP in the delay slot position
        ram[pc + 2..pc + 4].copy_from_slice(&0x0009_u16.to_be_bytes());

        Self { ram }
    }

    fn index(address: u32) -> usize {
        (address as usize) & (TEST_RAM_LEN - 1)
    }
}

impl BusInterface for TestBus {
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

#[derive(Debug, Clone)]
pub struct InstructionTest {
    pub instruction: u16,
    pub description: String,
    pub initial: Sh2State,
    /// Expected final state for hand-authored canonical cases; generated cases compare the
    /// two execution paths against each other instead
    pub expected: Option<Sh2State>,
}

impl InstructionTest {
    pub fn new(instruction: u16, description: impl Into<String>) -> Self {
        Self {
            instruction,
            description: description.into(),
            initial: Sh2State::default(),
            expected: None,
        }
    }
}

#[derive(Debug)]
pub struct ValidationResult {
    pub passed: bool,
    /// False when the analyzer/backend declined the opcode and only the interpreter ran
    pub jit_supported: bool,
    pub interpreter_state: Sh2State,
    pub jit_state: Option<Sh2State>,
    pub diffs: Vec<String>,
}

impl ValidationResult {
    #[must_use]
    pub fn report(&self, test: &InstructionTest) -> String {
        let mut out = format!(
            "{} ({}): {}\n",
            disassemble::disassemble(test.instruction),
            test.description,
            if self.passed { "PASS" } else { "FAIL" }
        );
        for diff in &self.diffs {
            out.push_str("  ");
            out.push_str(diff);
            out.push('\n');
        }
        out
    }
}

pub struct Validator {
    analyzer: BlockAnalyzer,
}

impl Default for Validator {
    fn default() -> Self {
        Self::new()
    }
}

impl Validator {
    #[must_use]
    pub fn new() -> Self {
        // A single SH-2 instruction per block (plus its delay slot when it has one)
        Self { analyzer: BlockAnalyzer::with_max_block_len(1) }
    }

    /// Execute one test on both paths and compare every architectural field plus RAM.
    #[must_use]
    pub fn validate(&self, test: &InstructionTest) -> ValidationResult {
        let (interpreter_state, interpreter_ram) = run_interpreter(test);

        let mut diffs = Vec::new();
        if let Some(expected) = &test.expected {
            for diff in expected.diff(&interpreter_state) {
                diffs.push(format!("interpreter vs expected {diff}"));
            }
        }

        let jit_outcome = self.run_jit(test);
        let (jit_supported, jit_state) = match jit_outcome {
            Some((jit_state, jit_ram)) => {
                for diff in interpreter_state.diff(&jit_state) {
                    diffs.push(format!("interpreter vs jit {diff}"));
                }
                if interpreter_ram != jit_ram {
                    diffs.push("memory contents diverged".into());
                }
                (true, Some(jit_state))
            }
            None => (false, None),
        };

        ValidationResult {
            passed: diffs.is_empty(),
            jit_supported,
            interpreter_state,
            jit_state,
            diffs,
        }
    }

    fn run_jit(&self, test: &InstructionTest) -> Option<(Sh2State, Box<[u8; TEST_RAM_LEN]>)> {
        if !cfg!(target_arch = "x86_64") {
            return None;
        }

        let mut bus = TestBus::new(test.instruction);

        let block = self.analyzer.analyze(
            |addr| {
                let i = TestBus::index(addr & !1);
                u16::from_be_bytes([bus.ram[i], bus.ram[i + 1]])
            },
            test.initial.pc,
            |_| true,
        )?;
        let liveness = self.analyzer.analyze_liveness(&block);
        let (code, entry) = X64Backend::compile(&block, &liveness).ok()?;

        let mut registers = Sh2Registers::default();
        test.initial.apply_to(&mut registers);

        let mut ctx = JitContext::new(&registers, &mut bus);
        // SAFETY: entry points into `code`, which lives until the end of this scope
        unsafe {
            (entry)(&mut ctx);
        }
        ctx.write_back(&mut registers);
        drop(code);

        Some((Sh2State::capture(&registers), bus.ram))
    }
}

fn run_interpreter(test: &InstructionTest) -> (Sh2State, Box<[u8; TEST_RAM_LEN]>) {
    let mut bus = TestBus::new(test.instruction);
    let mut cpu = Sh2::new("validator".into());
    cpu.reset_pending = false;
    test.initial.apply_to(&mut cpu.registers);

    let instructions = match spec::decode(test.instruction) {
        Some(instruction) if instruction.has_delay_slot => 2,
        _ => 1,
    };
    cpu.execute(instructions, &mut bus);

    (Sh2State::capture(cpu.registers()), bus.ram)
}

// ============================================================================
// Test generation from the specification database
// ============================================================================

#[derive(Debug, Clone)]
pub struct InstructionTestSuite {
    pub spec_index: usize,
    pub syntax: &'static str,
    pub tests: Vec<InstructionTest>,
}

/// Operand values covering the normal and boundary cases: small values, zero, -1, and the
/// signed extremes.
const OPERAND_VALUES: [u32; 6] = [5, 3, 0, 0xFFFFFFFF, 0x7FFFFFFF, 0x80000000];

fn encode(instruction: &InstructionSpec, n: u16, m: u16, imm: u16) -> u16 {
    let mut word = instruction.pattern;
    if instruction.has_rn {
        word |= (n & 0xF) << 8;
    }
    if instruction.has_rm {
        word |= (m & 0xF) << 4;
    }
    if instruction.imm_bits > 0 {
        word |= imm & ((1 << instruction.imm_bits) - 1);
    }
    word
}


/// Generate the test suite for one database entry: normal operands, boundary values,
/// register aliasing, and T-flag variants, aiming for 8-12 cases per opcode.
#[must_use]
pub fn generate_suite(spec_index: usize) -> InstructionTestSuite {
    let instruction = &spec::SPECS[spec_index];
    let mut tests = Vec::new();

    let memory_safe_base = |slot: usize| 0x2000 + 0x100 * slot as u32;

    if instruction.has_rn && instruction.has_rm {
        for (i, (&a, &b)) in
            OPERAND_VALUES.iter().zip(OPERAND_VALUES.iter().rev()).enumerate()
        {
            let mut test =
                InstructionTest::new(encode(instruction, 1, 2, 0), format!("operands {i}"));
            if instruction.reads_memory || instruction.writes_memory {
                // Keep addresses inside the test RAM; the value register keeps the pattern
                test.initial.r[1] = memory_safe_base(0);
                test.initial.r[2] = memory_safe_base(1) | (b & 3);
            } else {
                test.initial.r[1] = a;
                test.initial.r[2] = b;
            }
            tests.push(test);
        }

        // Rn == Rm aliasing
        let mut aliased = InstructionTest::new(encode(instruction, 3, 3, 0), "aliased Rn=Rm");
        aliased.initial.r[3] = if instruction.reads_memory || instruction.writes_memory {
            memory_safe_base(2)
        } else {
            0x12345678
        };
        tests.push(aliased);
    } else if instruction.has_rn || instruction.has_rm {
        let field = u16::from(instruction.has_rn);
        for (i, &value) in OPERAND_VALUES.iter().enumerate() {
            let mut test = InstructionTest::new(
                encode(instruction, field, field, 0),
                format!("operand {i}"),
            );
            let register = usize::from(field);
            test.initial.r[register] =
                if instruction.reads_memory || instruction.writes_memory {
                    memory_safe_base(i)
                } else {
                    value
                };
            tests.push(test);
        }
    }

    if instruction.imm_bits > 0 {
        let imm_values: &[u16] = if instruction.imm_bits == 4 {
            &[0, 3, 0xF]
        } else {
            &[0, 5, 0x7F, 0x80, 0xFF]
        };
        for &imm in imm_values {
            let mut test = InstructionTest::new(
                encode(instruction, 1, 1, imm),
                format!("immediate {imm:#X}"),
            );
            test.initial.r[0] = 0x40;
            test.initial.r[1] = if instruction.reads_memory || instruction.writes_memory {
                memory_safe_base(7)
            } else {
                10
            };
            tests.push(test);
        }
    }

    if tests.is_empty() {
        tests.push(InstructionTest::new(encode(instruction, 0, 0, 0), "bare"));
    }

    // Flag coverage: rerun a representative subset with T set. This matters for the
    // carry-propagating and branch instructions and costs nothing for the rest
    let mut with_t: Vec<InstructionTest> = tests
        .iter()
        .take(3)
        .map(|test| {
            let mut test = test.clone();
            test.description.push_str(", T=1");
            test.initial.t = true;
            test
        })
        .collect();
    tests.append(&mut with_t);

    InstructionTestSuite { spec_index, syntax: instruction.syntax, tests }
}

/// Hand-authored cases with exact expected states; these pin the interpreter itself, not
/// just interpreter/JIT agreement.
#[must_use]
pub fn canonical_tests() -> Vec<InstructionTest> {
    let mut tests = Vec::new();

    // ADD R2, R1: 5 + 3
    let mut test = InstructionTest::new(0x312C, "add small operands");
    test.initial.r[1] = 5;
    test.initial.r[2] = 3;
    let mut expected = test.initial;
    expected.r[1] = 8;
    expected.pc += 2;
    expected.cycles += 1;
    test.expected = Some(expected);
    tests.push(test);

    // ADDC R2, R1 with carry out
    let mut test = InstructionTest::new(0x312E, "addc carry out");
    test.initial.r[1] = 0xFFFFFFFF;
    test.initial.r[2] = 1;
    let mut expected = test.initial;
    expected.r[1] = 0;
    expected.t = true;
    expected.pc += 2;
    expected.cycles += 1;
    test.expected = Some(expected);
    tests.push(test);

    // ADDC R2, R1 with incoming carry
    let mut test = InstructionTest::new(0x312E, "addc carry in");
    test.initial.r[1] = 5;
    test.initial.r[2] = 3;
    test.initial.t = true;
    let mut expected = test.initial;
    expected.r[1] = 9;
    expected.t = false;
    expected.pc += 2;
    expected.cycles += 1;
    test.expected = Some(expected);
    tests.push(test);

    // SUBC R2, R1 with borrow out
    let mut test = InstructionTest::new(0x312A, "subc borrow out");
    test.initial.r[1] = 0;
    test.initial.r[2] = 1;
    let mut expected = test.initial;
    expected.r[1] = 0xFFFFFFFF;
    expected.t = true;
    expected.pc += 2;
    expected.cycles += 1;
    test.expected = Some(expected);
    tests.push(test);

    // BT not taken: PC advances by 2, costs 1 cycle
    let mut test = InstructionTest::new(0x8905, "bt not taken");
    let mut expected = test.initial;
    expected.pc += 2;
    expected.cycles += 1;
    test.expected = Some(expected);
    tests.push(test);

    // BT taken: PC = pc + 4 + 2*disp, costs 3 cycles
    let mut test = InstructionTest::new(0x8905, "bt taken");
    test.initial.t = true;
    let mut expected = test.initial;
    expected.pc = TEST_PC + 4 + 2 * 5;
    expected.cycles += 3;
    test.expected = Some(expected);
    tests.push(test);

    // MOV #-1, R1 sign extends
    let mut test = InstructionTest::new(0xE1FF, "mov negative immediate");
    let mut expected = test.initial;
    expected.r[1] = 0xFFFFFFFF;
    expected.pc += 2;
    expected.cycles += 1;
    test.expected = Some(expected);
    tests.push(test);

    // BRA +0 with NOP delay slot: lands 4 past the branch, 2 + 1 cycles
    let mut test = InstructionTest::new(0xA000, "bra with delay slot");
    let mut expected = test.initial;
    expected.pc = TEST_PC + 4;
    expected.cycles += 3;
    test.expected = Some(expected);
    tests.push(test);

    // SHLL: MSB out to T
    let mut test = InstructionTest::new(0x4100, "shll carries msb");
    test.initial.r[1] = 0x80000001;
    let mut expected = test.initial;
    expected.r[1] = 2;
    expected.t = true;
    expected.pc += 2;
    expected.cycles += 1;
    test.expected = Some(expected);
    tests.push(test);

    // CMP/GT signed comparison
    let mut test = InstructionTest::new(0x3127, "cmp/gt signed");
    test.initial.r[1] = 5;
    test.initial.r[2] = 0xFFFFFFFF;
    let mut expected = test.initial;
    expected.t = true;
    expected.pc += 2;
    expected.cycles += 1;
    test.expected = Some(expected);
    tests.push(test);

    tests
}

#[derive(Debug, Default)]
pub struct SuiteResults {
    pub total_tests: usize,
    pub passed: usize,
    pub failed: usize,
    pub jit_covered_specs: usize,
    pub failures: Vec<String>,
    /// Database indices whose entire suite passed under the JIT
    pub verified_spec_indices: Vec<usize>,
}

impl SuiteResults {
    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.failed == 0
    }
}

/// Run the generated suites for the whole database, returning the spec indices cleared for
/// JIT dispatch.
#[must_use]
pub fn run_generated_suites(validator: &Validator) -> SuiteResults {
    let mut results = SuiteResults::default();

    for spec_index in 0..spec::SPECS.len() {
        let suite = generate_suite(spec_index);

        let mut suite_passed = true;
        let mut jit_ran = false;
        for test in &suite.tests {
            let result = validator.validate(test);
            results.total_tests += 1;
            if result.passed {
                results.passed += 1;
            } else {
                results.failed += 1;
                suite_passed = false;
                results.failures.push(result.report(test));
            }
            jit_ran |= result.jit_supported;
        }

        if jit_ran {
            results.jit_covered_specs += 1;
            if suite_passed {
                results.verified_spec_indices.push(spec_index);
            }
        }
    }

    results
}
