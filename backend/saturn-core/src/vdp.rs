//! VDP1 + VDP2 video pipeline, software path
//!
//! VDP1 walks its command table and rasterizes sprites, polygons, and lines into the sprite
//! framebuffer. VDP2 composites the tile/bitmap background layers with the sprite layer per
//! scanline, honoring per-screen priorities and color calculation, with the back screen
//! filling uncovered pixels. Rendering is scanline-at-a-time so mid-frame register writes
//! (line scroll tricks) land on the correct lines.

mod thread;
mod vdp1;
mod vdp2;

pub use thread::RenderThread;

use bincode::{Decode, Encode};
use brimir_common::boxedarray::{BoxedByteArray, BoxedWordArray};
use brimir_common::frontend::{Color, FrameSize, TimingMode};
use brimir_common::num::GetBit;

pub const VDP1_VRAM_LEN: usize = 512 * 1024;
pub const VDP2_VRAM_LEN: usize = 512 * 1024;
pub const CRAM_LEN_WORDS: usize = 2048;

// Sprite framebuffer: 512x256 16bpp
pub const SPRITE_FB_WIDTH: usize = 512;
pub const SPRITE_FB_HEIGHT: usize = 256;

pub const MAX_FRAME_WIDTH: usize = 704;
pub const MAX_FRAME_HEIGHT: usize = 512;

const VDP1_VRAM_START: u32 = 0x05C0_0000;
const VDP1_FB_START: u32 = 0x05C8_0000;
const VDP1_REG_START: u32 = 0x05D0_0000;
const VDP2_VRAM_START: u32 = 0x05E0_0000;
const VDP2_CRAM_START: u32 = 0x05F0_0000;
const VDP2_REG_START: u32 = 0x05F8_0000;

pub type Vdp1Vram = BoxedByteArray<VDP1_VRAM_LEN>;
pub type Vdp2Vram = BoxedByteArray<VDP2_VRAM_LEN>;
pub type Cram = BoxedWordArray<CRAM_LEN_WORDS>;
pub type SpriteFrameBuffer = BoxedWordArray<{ SPRITE_FB_WIDTH * SPRITE_FB_HEIGHT }>;

/// Final composited output; sized for the largest Saturn mode, consumers use `frame_size`.
///
/// Not part of save states: it is rebuilt within one frame.
#[derive(Debug, Clone)]
pub struct FrameBuffer(Box<[Color]>);

impl Default for FrameBuffer {
    fn default() -> Self {
        Self(vec![Color::default(); MAX_FRAME_WIDTH * MAX_FRAME_HEIGHT].into_boxed_slice())
    }
}

impl Encode for FrameBuffer {
    fn encode<E: bincode::enc::Encoder>(
        &self,
        _encoder: &mut E,
    ) -> Result<(), bincode::error::EncodeError> {
        Ok(())
    }
}

impl<Context> Decode<Context> for FrameBuffer {
    fn decode<D: bincode::de::Decoder<Context = Context>>(
        _decoder: &mut D,
    ) -> Result<Self, bincode::error::DecodeError> {
        Ok(Self::default())
    }
}

impl<'de, Context> bincode::BorrowDecode<'de, Context> for FrameBuffer {
    fn borrow_decode<D: bincode::de::BorrowDecoder<'de, Context = Context>>(
        _decoder: &mut D,
    ) -> Result<Self, bincode::error::DecodeError> {
        Ok(Self::default())
    }
}

/// VDP2 screen mode derived from TVMD.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct DisplayMode {
    pub width: u32,
    pub height: u32,
    pub display_enabled: bool,
}

#[derive(Debug, Clone, Default, Encode, Decode)]
pub struct Vdp1Registers {
    /// TVMR: frame buffer mode
    pub tvmr: u16,
    /// FBCR: frame buffer change control
    pub fbcr: u16,
    /// PTMR: plot trigger (1 = draw on write, 2 = draw at frame change)
    pub ptmr: u16,
    /// EWDR: erase/write color
    pub ewdr: u16,
}

#[derive(Debug, Clone, Default, Encode, Decode)]
pub struct Vdp2Registers {
    pub tvmd: u16,
    /// BGON: screen enables
    pub bgon: u16,
    /// CHCTLA/CHCTLB: character size and color depth per screen
    pub chctla: u16,
    pub chctlb: u16,
    /// PNCN0-3: pattern name supplement
    pub pncn: [u16; 4],
    /// Map offsets and plane designations
    pub mpofn: u16,
    pub mpabn: [u16; 4],
    /// Rotation screen map offset and plane
    pub mpofr: u16,
    pub mpabra: u16,
    /// Integer scroll per NBG
    pub scx: [u16; 4],
    pub scy: [u16; 4],
    /// PRINA/PRINB/PRIR: layer priorities
    pub prina: u16,
    pub prinb: u16,
    pub prir: u16,
    /// PRISA: sprite priority
    pub prisa: u16,
    /// CCCTL/CCRNA: color calculation control and NBG ratios
    pub ccctl: u16,
    pub ccrna: u16,
    pub ccrnb: u16,
    /// BKTAU/BKTAL: back screen table address
    pub bktau: u16,
    pub bktal: u16,
    /// Rotation parameter table address
    pub rpta_upper: u16,
    pub rpta_lower: u16,
}

impl Vdp2Registers {
    pub fn nbg_enabled(&self, screen: usize) -> bool {
        self.bgon.bit(screen as u8)
    }

    pub fn rbg0_enabled(&self) -> bool {
        self.bgon.bit(4)
    }

    pub fn nbg_priority(&self, screen: usize) -> u8 {
        let value = match screen {
            0 => self.prina & 0x7,
            1 => (self.prina >> 8) & 0x7,
            2 => self.prinb & 0x7,
            _ => (self.prinb >> 8) & 0x7,
        };
        value as u8
    }

    pub fn rbg0_priority(&self) -> u8 {
        (self.prir & 0x7) as u8
    }

    pub fn sprite_priority(&self) -> u8 {
        (self.prisa & 0x7) as u8
    }

    pub fn display_mode(&self) -> DisplayMode {
        let width = match self.tvmd & 0x7 {
            0 => 320,
            1 => 352,
            2 | 4 | 6 => 640,
            _ => 704,
        };
        let height = match (self.tvmd >> 4) & 0x3 {
            0 => 224,
            1 => 240,
            _ => 256,
        };
        // Double-density interlace doubles the visible height
        let height = if (self.tvmd >> 6) & 0x3 == 0x3 { height * 2 } else { height };

        DisplayMode { width, height: height.min(MAX_FRAME_HEIGHT as u32), display_enabled: self.tvmd.bit(15) }
    }
}

#[derive(Debug, Encode, Decode)]
pub struct Vdp {
    timing_mode: TimingMode,
    pub vdp1_regs: Vdp1Registers,
    pub vdp2_regs: Vdp2Registers,
    vdp1_vram: Vdp1Vram,
    vdp2_vram: Vdp2Vram,
    cram: Cram,
    sprite_fb: SpriteFrameBuffer,
    frame: FrameBuffer,
    frame_size: FrameSize,
    /// Command list has been walked for the current frame
    vdp1_drawn: bool,
}

impl Vdp {
    #[must_use]
    pub fn new(timing_mode: TimingMode) -> Self {
        Self {
            timing_mode,
            vdp1_regs: Vdp1Registers::default(),
            vdp2_regs: Vdp2Registers::default(),
            vdp1_vram: Vdp1Vram::new(),
            vdp2_vram: Vdp2Vram::new(),
            cram: Cram::new(),
            sprite_fb: SpriteFrameBuffer::new(),
            frame: FrameBuffer::default(),
            frame_size: FrameSize { width: 320, height: 224 },
            vdp1_drawn: false,
        }
    }

    #[must_use]
    pub fn timing_mode(&self) -> TimingMode {
        self.timing_mode
    }

    pub fn read_word(&mut self, address: u32) -> u16 {
        match address {
            VDP1_VRAM_START..=0x05C7_FFFF => {
                let i = ((address - VDP1_VRAM_START) as usize) & (VDP1_VRAM_LEN - 2);
                u16::from_be_bytes([self.vdp1_vram[i], self.vdp1_vram[i + 1]])
            }
            VDP1_FB_START..=0x05CF_FFFF => {
                let i = (((address - VDP1_FB_START) / 2) as usize)
                    & (SPRITE_FB_WIDTH * SPRITE_FB_HEIGHT - 1);
                self.sprite_fb[i]
            }
            VDP1_REG_START..=0x05D7_FFFF => self.read_vdp1_register(address),
            VDP2_VRAM_START..=0x05EF_FFFF => {
                let i = ((address - VDP2_VRAM_START) as usize) & (VDP2_VRAM_LEN - 2);
                u16::from_be_bytes([self.vdp2_vram[i], self.vdp2_vram[i + 1]])
            }
            VDP2_CRAM_START..=0x05F7_FFFF => {
                self.cram[(((address - VDP2_CRAM_START) / 2) as usize) & (CRAM_LEN_WORDS - 1)]
            }
            VDP2_REG_START..=0x05FD_FFFF => self.read_vdp2_register(address),
            _ => {
                log::warn!("Unexpected VDP read: {address:08X}");
                0
            }
        }
    }

    pub fn write_word(&mut self, address: u32, value: u16) {
        match address {
            VDP1_VRAM_START..=0x05C7_FFFF => {
                let i = ((address - VDP1_VRAM_START) as usize) & (VDP1_VRAM_LEN - 2);
                self.vdp1_vram[i..i + 2].copy_from_slice(&value.to_be_bytes());
            }
            VDP1_FB_START..=0x05CF_FFFF => {
                let i = (((address - VDP1_FB_START) / 2) as usize)
                    & (SPRITE_FB_WIDTH * SPRITE_FB_HEIGHT - 1);
                self.sprite_fb[i] = value;
            }
            VDP1_REG_START..=0x05D7_FFFF => self.write_vdp1_register(address, value),
            VDP2_VRAM_START..=0x05EF_FFFF => {
                let i = ((address - VDP2_VRAM_START) as usize) & (VDP2_VRAM_LEN - 2);
                self.vdp2_vram[i..i + 2].copy_from_slice(&value.to_be_bytes());
            }
            VDP2_CRAM_START..=0x05F7_FFFF => {
                self.cram[(((address - VDP2_CRAM_START) / 2) as usize) & (CRAM_LEN_WORDS - 1)] =
                    value;
            }
            VDP2_REG_START..=0x05FD_FFFF => self.write_vdp2_register(address, value),
            _ => log::warn!("Unexpected VDP write: {address:08X} {value:04X}"),
        }
    }

    fn read_vdp1_register(&self, address: u32) -> u16 {
        match address & 0x1F {
            0x00 => self.vdp1_regs.tvmr,
            0x02 => self.vdp1_regs.fbcr,
            0x04 => self.vdp1_regs.ptmr,
            0x06 => self.vdp1_regs.ewdr,
            // EDSR: both frame buffer change bits set (draw finished)
            0x10 => 0x3,
            _ => 0,
        }
    }

    fn write_vdp1_register(&mut self, address: u32, value: u16) {
        match address & 0x1F {
            0x00 => self.vdp1_regs.tvmr = value,
            0x02 => self.vdp1_regs.fbcr = value,
            0x04 => {
                self.vdp1_regs.ptmr = value;
                // Plot trigger mode 1 draws immediately on write
                if value & 0x3 == 1 {
                    self.run_vdp1();
                }
            }
            0x06 => self.vdp1_regs.ewdr = value,
            _ => log::trace!("VDP1 register write: {address:08X} {value:04X}"),
        }
    }

    fn read_vdp2_register(&self, address: u32) -> u16 {
        match address & 0x1FF {
            0x000 => self.vdp2_regs.tvmd,
            // TVSTAT: report steady VBlank-out, even field
            0x004 => 0x0002,
            0x020 => self.vdp2_regs.bgon,
            0x028 => self.vdp2_regs.chctla,
            0x02A => self.vdp2_regs.chctlb,
            _ => 0,
        }
    }

    #[allow(clippy::match_same_arms)]
    fn write_vdp2_register(&mut self, address: u32, value: u16) {
        let regs = &mut self.vdp2_regs;
        match address & 0x1FF {
            0x000 => regs.tvmd = value,
            0x020 => regs.bgon = value,
            0x028 => regs.chctla = value,
            0x02A => regs.chctlb = value,
            0x030 => regs.pncn[0] = value,
            0x032 => regs.pncn[1] = value,
            0x034 => regs.pncn[2] = value,
            0x036 => regs.pncn[3] = value,
            0x03C => regs.mpofn = value,
            0x03E => regs.mpofr = value,
            0x050 => regs.mpabra = value,
            0x040 => regs.mpabn[0] = value,
            0x044 => regs.mpabn[1] = value,
            0x048 => regs.mpabn[2] = value,
            0x04C => regs.mpabn[3] = value,
            0x070 => regs.scx[0] = value,
            0x074 => regs.scy[0] = value,
            0x080 => regs.scx[1] = value,
            0x084 => regs.scy[1] = value,
            0x090 => regs.scx[2] = value,
            0x092 => regs.scy[2] = value,
            0x094 => regs.scx[3] = value,
            0x096 => regs.scy[3] = value,
            0x0AC => regs.bktau = value,
            0x0AE => regs.bktal = value,
            0x0BC => regs.rpta_upper = value,
            0x0BE => regs.rpta_lower = value,
            0x0F8 => regs.prina = value,
            0x0FA => regs.prinb = value,
            0x0FC => regs.prir = value,
            0x0F0 => regs.prisa = value,
            0x108 => regs.ccrna = value,
            0x10A => regs.ccrnb = value,
            0x0E0 => {} // SPCTL; fixed sprite type 0 behavior
            0x0E4 => regs.ccctl = value,
            _ => log::trace!("VDP2 register write: {address:08X} {value:04X}"),
        }
    }

    /// Walk the VDP1 command table into the sprite framebuffer.
    pub fn run_vdp1(&mut self) {
        vdp1::render_command_list(&self.vdp1_vram, &mut self.sprite_fb);
        self.vdp1_drawn = true;
    }

    /// Called at the start of each frame: latch the display mode and erase the sprite
    /// framebuffer with the erase/write color.
    pub fn begin_frame(&mut self) {
        let mode = self.vdp2_regs.display_mode();
        self.frame_size = FrameSize { width: mode.width, height: mode.height };

        let erase_color = self.vdp1_regs.ewdr;
        self.sprite_fb.fill(erase_color);
        self.vdp1_drawn = false;

        // Plot trigger mode 2 draws at frame change
        if self.vdp1_regs.ptmr & 0x3 == 2 {
            self.run_vdp1();
        }
    }

    /// Composite one scanline of the current frame.
    pub fn render_scanline(&mut self, line: u32) {
        if line >= self.frame_size.height {
            return;
        }

        let width = self.frame_size.width as usize;
        let row_start = (line as usize) * MAX_FRAME_WIDTH;
        let row = &mut self.frame.0[row_start..row_start + width];

        if !self.vdp2_regs.display_mode().display_enabled {
            row.fill(Color::BLACK);
            return;
        }

        vdp2::render_line(
            line,
            &self.vdp2_regs,
            &self.vdp2_vram,
            &self.cram,
            &self.sprite_fb,
            row,
        );
    }

    /// Render every scanline at once (used by the threaded renderer's snapshot path).
    pub fn render_full_frame(&mut self) {
        self.begin_frame();
        for line in 0..self.frame_size.height {
            self.render_scanline(line);
        }
    }

    #[must_use]
    pub fn frame_size(&self) -> FrameSize {
        self.frame_size
    }

    /// The current frame's pixels, tightly packed at the current frame size.
    pub fn copy_frame_into(&self, out: &mut Vec<Color>) {
        let width = self.frame_size.width as usize;
        let height = self.frame_size.height as usize;

        out.clear();
        out.reserve(width * height);
        for line in 0..height {
            let row_start = line * MAX_FRAME_WIDTH;
            out.extend_from_slice(&self.frame.0[row_start..row_start + width]);
        }
    }

    /// A snapshot of everything the renderer needs, handed to the render thread.
    #[must_use]
    pub fn snapshot(&self) -> RenderSnapshot {
        RenderSnapshot {
            vdp1_regs: self.vdp1_regs.clone(),
            vdp2_regs: self.vdp2_regs.clone(),
            vdp1_vram: self.vdp1_vram.clone(),
            vdp2_vram: self.vdp2_vram.clone(),
            cram: self.cram.clone(),
            timing_mode: self.timing_mode,
        }
    }
}

/// The register/VRAM state a detached renderer needs to draw a complete frame.
#[derive(Debug, Clone)]
pub struct RenderSnapshot {
    pub vdp1_regs: Vdp1Registers,
    pub vdp2_regs: Vdp2Registers,
    pub vdp1_vram: Vdp1Vram,
    pub vdp2_vram: Vdp2Vram,
    pub cram: Cram,
    pub timing_mode: TimingMode,
}

impl RenderSnapshot {
    /// Rebuild a throwaway VDP from the snapshot and render the full frame.
    #[must_use]
    pub fn render(self) -> (Vec<Color>, FrameSize) {
        let mut vdp = Vdp::new(self.timing_mode);
        vdp.vdp1_regs = self.vdp1_regs;
        vdp.vdp2_regs = self.vdp2_regs;
        vdp.vdp1_vram = self.vdp1_vram;
        vdp.vdp2_vram = self.vdp2_vram;
        vdp.cram = self.cram;

        vdp.render_full_frame();

        let mut frame = Vec::new();
        vdp.copy_frame_into(&mut frame);
        (frame, vdp.frame_size())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_mode_decodes_tvmd() {
        let mut regs = Vdp2Registers::default();
        regs.tvmd = 0x8000;
        assert_eq!(
            regs.display_mode(),
            DisplayMode { width: 320, height: 224, display_enabled: true }
        );

        regs.tvmd = 0x8001 | (1 << 4);
        assert_eq!(
            regs.display_mode(),
            DisplayMode { width: 352, height: 240, display_enabled: true }
        );
    }

    #[test]
    fn vram_and_cram_round_trip_through_the_word_interface() {
        let mut vdp = Vdp::new(TimingMode::Ntsc);

        vdp.write_word(0x05C0_0010, 0xABCD);
        assert_eq!(vdp.read_word(0x05C0_0010), 0xABCD);

        vdp.write_word(0x05E0_0020, 0x1234);
        assert_eq!(vdp.read_word(0x05E0_0020), 0x1234);

        vdp.write_word(0x05F0_0002, 0x7FFF);
        assert_eq!(vdp.read_word(0x05F0_0002), 0x7FFF);
    }

    #[test]
    fn disabled_display_renders_black() {
        let mut vdp = Vdp::new(TimingMode::Ntsc);
        vdp.begin_frame();
        vdp.render_scanline(0);

        let mut frame = Vec::new();
        vdp.copy_frame_into(&mut frame);
        assert!(frame[..320].iter().all(|&c| c == Color::BLACK));
    }
}
