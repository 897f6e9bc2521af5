//! SCSP sound unit
//!
//! Register-driven 32-slot PCM playback out of 512 KiB of sound RAM, ticked once per output
//! sample (44.1 kHz). Each generated stereo pair goes out through the sample callback the
//! orchestrator installs; the consumer-side ring buffer lives there.

use bincode::{Decode, Encode};
use brimir_common::boxedarray::BoxedByteArray;
use brimir_common::num::GetBit;

pub const SOUND_RAM_LEN: usize = 512 * 1024;

const SLOT_COUNT: usize = 32;
// Each slot occupies 0x20 bytes of register space
const SLOT_REG_SHIFT: u32 = 5;

const SOUND_RAM_START: u32 = 0x05A0_0000;
const SLOT_REG_START: u32 = 0x05B0_0000;

pub type SoundRam = BoxedByteArray<SOUND_RAM_LEN>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Encode, Decode)]
pub enum InterpolationMode {
    NearestNeighbor,
    #[default]
    Linear,
}

#[derive(Debug, Clone, Copy, Default, Encode, Decode)]
struct Slot {
    key_on: bool,
    /// Start address in sound RAM (bytes)
    start_addr: u32,
    /// Loop points in samples
    loop_start: u16,
    loop_end: u16,
    /// 8-bit PCM when set, 16-bit otherwise
    pcm8: bool,
    looping: bool,
    /// Playback position, 16.16 fixed point sample index
    position: u64,
    /// Per-output-sample increment, 16.16
    step: u32,
    /// Total level attenuation, 0 = full volume
    total_level: u8,
    /// Pan: 0-15 attenuates right, 16-31 attenuates left
    pan: u8,
}

impl Slot {
    fn write_register(&mut self, offset: u32, value: u16) {
        match offset {
            0x00 => {
                // KYONB + loop control + start address high bits
                self.key_on = value.bit(11);
                self.pcm8 = value.bit(4);
                self.looping = value.bit(9);
                self.start_addr = (self.start_addr & 0xFFFF) | (u32::from(value & 0xF) << 16);
                if value.bit(12) {
                    // KYONEX latches key state for every slot; handled by the chip
                }
            }
            0x02 => self.start_addr = (self.start_addr & !0xFFFF) | u32::from(value),
            0x04 => self.loop_start = value,
            0x06 => self.loop_end = value,
            0x10 => {
                // OCT/FNS pitch word: step = (1 + FNS/1024) * 2^OCT in 16.16
                let fns = u32::from(value & 0x3FF);
                let oct = ((value >> 11) & 0xF) as i8;
                let oct = if oct >= 8 { oct - 16 } else { oct };
                let base = (1 << 16) + (fns << 6);
                self.step = if oct >= 0 { base << oct } else { base >> (-oct) };
            }
            0x14 => self.total_level = (value & 0xFF) as u8,
            0x16 => self.pan = (value & 0x1F) as u8,
            _ => {}
        }
    }

    fn trigger(&mut self) {
        self.position = 0;
    }

    fn sample(&mut self, ram: &SoundRam, interpolation: InterpolationMode) -> (i32, i32) {
        if !self.key_on || self.step == 0 {
            return (0, 0);
        }

        let index = (self.position >> 16) as u32;
        let end = u32::from(self.loop_end.max(1));
        if index >= end {
            if self.looping {
                let loop_len = u64::from(end - u32::from(self.loop_start.min(self.loop_end)));
                if loop_len == 0 {
                    self.key_on = false;
                    return (0, 0);
                }
                self.position = (u64::from(self.loop_start) << 16)
                    + (self.position - (u64::from(end) << 16)) % (loop_len << 16);
            } else {
                self.key_on = false;
                return (0, 0);
            }
        }

        let index = (self.position >> 16) as u32;
        let fraction = (self.position & 0xFFFF) as i64;

        let mono = match interpolation {
            InterpolationMode::NearestNeighbor => i64::from(self.fetch(ram, index)),
            InterpolationMode::Linear => {
                let current = i64::from(self.fetch(ram, index));
                let next = i64::from(self.fetch(ram, index + 1));
                current + ((next - current) * fraction >> 16)
            }
        };

        self.position += u64::from(self.step);

        // Total level: 0.375 dB units; approximate with a linear shift every 8 steps
        let attenuated = mono >> (self.total_level >> 3);

        let (left, right) = if self.pan < 16 {
            (attenuated, attenuated >> (self.pan & 0xF).min(15))
        } else {
            (attenuated >> (self.pan & 0xF).min(15), attenuated)
        };

        (left as i32, right as i32)
    }

    fn fetch(&self, ram: &SoundRam, sample_index: u32) -> i16 {
        if self.pcm8 {
            let addr = (self.start_addr + sample_index) as usize & (SOUND_RAM_LEN - 1);
            i16::from(ram[addr] as i8) << 8
        } else {
            let addr = (self.start_addr + sample_index * 2) as usize & (SOUND_RAM_LEN - 2);
            i16::from_be_bytes([ram[addr], ram[addr + 1]])
        }
    }
}

#[derive(Debug, Encode, Decode)]
pub struct Scsp {
    sound_ram: SoundRam,
    slots: [Slot; SLOT_COUNT],
    interpolation: InterpolationMode,
    /// Stereo pairs generated since the counter was last read (frame accounting)
    samples_this_frame: u32,
}

impl Default for Scsp {
    fn default() -> Self {
        Self::new()
    }
}

impl Scsp {
    #[must_use]
    pub fn new() -> Self {
        Self {
            sound_ram: SoundRam::new(),
            slots: [Slot::default(); SLOT_COUNT],
            interpolation: InterpolationMode::default(),
            samples_this_frame: 0,
        }
    }

    pub fn set_interpolation(&mut self, interpolation: InterpolationMode) {
        self.interpolation = interpolation;
    }

    pub fn read_byte(&mut self, address: u32) -> u8 {
        let word = self.read_word(address & !1);
        if address & 1 == 0 { (word >> 8) as u8 } else { word as u8 }
    }

    pub fn read_word(&mut self, address: u32) -> u16 {
        match address {
            SOUND_RAM_START..=0x05AF_FFFF => {
                let i = ((address - SOUND_RAM_START) as usize) & (SOUND_RAM_LEN - 2);
                u16::from_be_bytes([self.sound_ram[i], self.sound_ram[i + 1]])
            }
            _ => {
                let offset = address & 0xFFF;
                if offset < (SLOT_COUNT as u32) << SLOT_REG_SHIFT {
                    // Slot registers are write-mostly; reads return zero like an idle chip
                    0
                } else {
                    log::trace!("SCSP control register read: {address:08X}");
                    0
                }
            }
        }
    }

    pub fn write_byte(&mut self, address: u32, value: u8) {
        let mut word = self.read_word(address & !1);
        if address & 1 == 0 {
            word = (word & 0x00FF) | (u16::from(value) << 8);
        } else {
            word = (word & 0xFF00) | u16::from(value);
        }
        self.write_word(address & !1, word);
    }

    pub fn write_word(&mut self, address: u32, value: u16) {
        match address {
            SOUND_RAM_START..=0x05AF_FFFF => {
                let i = ((address - SOUND_RAM_START) as usize) & (SOUND_RAM_LEN - 2);
                self.sound_ram[i..i + 2].copy_from_slice(&value.to_be_bytes());
            }
            _ if address >= SLOT_REG_START => {
                let offset = address & 0xFFF;
                let slot_index = (offset >> SLOT_REG_SHIFT) as usize;
                if slot_index < SLOT_COUNT {
                    let was_on = self.slots[slot_index].key_on;
                    self.slots[slot_index].write_register(offset & 0x1F, value);
                    if !was_on && self.slots[slot_index].key_on {
                        self.slots[slot_index].trigger();
                    }
                } else {
                    log::trace!("SCSP control register write: {address:08X} {value:04X}");
                }
            }
            _ => log::trace!("SCSP write: {address:08X} {value:04X}"),
        }
    }

    /// Generate one output sample, delivering it through `sample_callback`.
    pub fn tick_sample(&mut self, mut sample_callback: impl FnMut(i16, i16)) {
        let mut left: i32 = 0;
        let mut right: i32 = 0;

        for slot in &mut self.slots {
            let (slot_l, slot_r) = slot.sample(&self.sound_ram, self.interpolation);
            left += slot_l;
            right += slot_r;
        }

        self.samples_this_frame += 1;
        sample_callback(
            left.clamp(i16::MIN.into(), i16::MAX.into()) as i16,
            right.clamp(i16::MIN.into(), i16::MAX.into()) as i16,
        );
    }

    /// Stereo pairs generated since the last call; the orchestrator checks this against the
    /// ring buffer's frame intake.
    pub fn take_frame_sample_count(&mut self) -> u32 {
        std::mem::take(&mut self.samples_this_frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keyed_slot_register_writes(scsp: &mut Scsp, slot: u32) {
        let base = SLOT_REG_START + (slot << SLOT_REG_SHIFT);
        // 16-bit PCM at sound RAM offset 0x100, loop end 64, pitch 1.0
        scsp.write_word(base + 0x02, 0x0100);
        scsp.write_word(base + 0x04, 0);
        scsp.write_word(base + 0x06, 64);
        scsp.write_word(base + 0x10, 0);
        scsp.write_word(base + 0x14, 0);
        scsp.write_word(base + 0x16, 0);
        scsp.write_word(base, 1 << 11);
    }

    #[test]
    fn keyed_on_slot_plays_pcm_from_sound_ram() {
        let mut scsp = Scsp::new();

        // A constant positive sample value
        for i in 0..64 {
            scsp.write_word(SOUND_RAM_START + 0x100 + i * 2, 0x4000);
        }
        keyed_slot_register_writes(&mut scsp, 0);

        let mut captured = Vec::new();
        for _ in 0..4 {
            scsp.tick_sample(|l, r| captured.push((l, r)));
        }

        assert_eq!(captured.len(), 4);
        assert!(captured.iter().all(|&(l, r)| l == 0x4000 && r == 0x4000));
    }

    #[test]
    fn silent_when_no_slot_is_keyed() {
        let mut scsp = Scsp::new();

        let mut captured = Vec::new();
        scsp.tick_sample(|l, r| captured.push((l, r)));
        assert_eq!(captured, vec![(0, 0)]);
    }

    #[test]
    fn frame_sample_count_tracks_ticks() {
        let mut scsp = Scsp::new();
        for _ in 0..735 {
            scsp.tick_sample(|_, _| {});
        }
        assert_eq!(scsp.take_frame_sample_count(), 735);
        assert_eq!(scsp.take_frame_sample_count(), 0);
    }

    #[test]
    fn non_looping_slot_stops_at_the_end() {
        let mut scsp = Scsp::new();
        for i in 0..4 {
            scsp.write_word(SOUND_RAM_START + 0x100 + i * 2, 0x1000);
        }

        let base = SLOT_REG_START;
        scsp.write_word(base + 0x02, 0x0100);
        scsp.write_word(base + 0x06, 4);
        scsp.write_word(base + 0x10, 0);
        scsp.write_word(base, 1 << 11);

        let mut samples = Vec::new();
        for _ in 0..8 {
            scsp.tick_sample(|l, _| samples.push(l));
        }

        assert!(samples[..4].iter().all(|&s| s != 0));
        assert!(samples[4..].iter().all(|&s| s == 0));
    }
}
