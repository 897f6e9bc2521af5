//! Executable code buffer
//!
//! A page-aligned anonymous mapping that is writable during emission and flipped to
//! read+execute before first invocation, with an explicit instruction-cache
//! synchronization step on the flip.

use memmap2::{Mmap, MmapMut, MmapOptions};
use std::io;

const INITIAL_CAPACITY: usize = 4096;

#[derive(Debug)]
enum State {
    Writable(MmapMut),
    Executable(Mmap),
}

#[derive(Debug)]
pub struct CodeBuffer {
    state: State,
    len: usize,
}

impl CodeBuffer {
    pub fn new() -> io::Result<Self> {
        Self::with_capacity(INITIAL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> io::Result<Self> {
        let map = MmapOptions::new().len(capacity.max(INITIAL_CAPACITY)).map_anon()?;
        Ok(Self { state: State::Writable(map), len: 0 })
    }

    #[must_use]
    pub fn position(&self) -> usize {
        self.len
    }

    pub fn emit8(&mut self, byte: u8) {
        self.reserve(1);
        let State::Writable(map) = &mut self.state else {
            panic!("emit into an executable code buffer");
        };
        map[self.len] = byte;
        self.len += 1;
    }

    pub fn emit32(&mut self, value: u32) {
        for byte in value.to_le_bytes() {
            self.emit8(byte);
        }
    }

    pub fn emit64(&mut self, value: u64) {
        for byte in value.to_le_bytes() {
            self.emit8(byte);
        }
    }

    /// Overwrite a previously emitted 32-bit value (branch target fixups).
    pub fn patch32(&mut self, position: usize, value: u32) {
        let State::Writable(map) = &mut self.state else {
            panic!("patch into an executable code buffer");
        };
        assert!(position + 4 <= self.len, "patch position out of bounds");
        map[position..position + 4].copy_from_slice(&value.to_le_bytes());
    }

    pub fn reserve(&mut self, additional: usize) {
        let State::Writable(map) = &mut self.state else {
            panic!("reserve on an executable code buffer");
        };
        let needed = self.len + additional;
        if needed <= map.len() {
            return;
        }

        let mut new_capacity = map.len();
        while new_capacity < needed {
            new_capacity *= 2;
        }

        let mut grown = MmapOptions::new()
            .len(new_capacity)
            .map_anon()
            .expect("failed to grow code buffer");
        grown[..self.len].copy_from_slice(&map[..self.len]);
        self.state = State::Writable(grown);
    }

    /// Flip the buffer to read+execute and return the entry pointer.
    pub fn make_executable(mut self) -> io::Result<ExecutableCode> {
        let State::Writable(map) = self.state else {
            panic!("code buffer is already executable");
        };
        let map = map.make_exec()?;
        flush_instruction_cache();
        self.state = State::Executable(map);
        match &self.state {
            State::Executable(map) => Ok(ExecutableCode { ptr: map.as_ptr(), _map: self }),
            State::Writable(_) => unreachable!(),
        }
    }
}

/// Instruction-cache synchronization for the write->execute transition.
///
/// x86-64 keeps instruction fetch coherent with data writes, but moving from writing code
/// to executing it on the same core still requires a serializing instruction; CPUID is the
/// architecturally defined one. Another backend architecture would need its icache
/// maintenance instructions here instead.
fn flush_instruction_cache() {
    #[cfg(target_arch = "x86_64")]
    // SAFETY: CPUID leaf 0 is available on every x86-64 processor and has no side effects
    // beyond serialization
    unsafe {
        std::arch::x86_64::__cpuid(0);
    }
}

/// Owns the executable mapping; the entry pointer is valid for as long as this value lives.
#[derive(Debug)]
pub struct ExecutableCode {
    ptr: *const u8,
    _map: CodeBuffer,
}

impl ExecutableCode {
    #[must_use]
    pub fn entry(&self) -> *const u8 {
        self.ptr
    }
}

// The mapping is never written after the protection flip
unsafe impl Send for ExecutableCode {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emission_and_patching() {
        let mut buf = CodeBuffer::new().unwrap();
        buf.emit8(0xC3);
        let pos = buf.position();
        buf.emit32(0xDEADBEEF);
        buf.patch32(pos, 0x12345678);

        assert_eq!(buf.position(), 5);
    }

    #[test]
    fn growth_preserves_contents() {
        let mut buf = CodeBuffer::new().unwrap();
        for i in 0..INITIAL_CAPACITY + 100 {
            buf.emit8(i as u8);
        }
        assert_eq!(buf.position(), INITIAL_CAPACITY + 100);
    }

    #[test]
    fn executes_a_trivial_function() {
        let mut buf = CodeBuffer::new().unwrap();
        // mov eax, 42; ret
        buf.emit8(0xB8);
        buf.emit32(42);
        buf.emit8(0xC3);

        let code = buf.make_executable().unwrap();
        let f: extern "C" fn() -> u32 = unsafe { std::mem::transmute(code.entry()) };
        assert_eq!(f(), 42);
    }
}
