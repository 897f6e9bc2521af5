//! VDP2 background layers and per-scanline compositing
//!
//! Composites the four normal scroll screens (8x8 cell tiles, 16 or 256 color), the
//! rotating screen RBG0 (affine sampling of the same cell format), and the VDP1 sprite
//! layer, by per-pixel priority with optional ratio color calculation and the back screen
//! underneath everything.

use super::{Cram, SpriteFrameBuffer, Vdp2Registers, Vdp2Vram, SPRITE_FB_HEIGHT, SPRITE_FB_WIDTH};
use brimir_common::frontend::Color;
use brimir_common::num::GetBit;

const NBG_COUNT: usize = 4;

// Layer indices into the candidate array; sprite first so it wins priority ties
const LAYER_SPRITE: usize = 0;
const LAYER_NBG_BASE: usize = 1;
const LAYER_RBG0: usize = 5;
const LAYER_COUNT: usize = 6;

#[derive(Debug, Clone, Copy, Default)]
struct LayerPixel {
    color: u16,
    priority: u8,
    opaque: bool,
    color_calc: bool,
}

pub fn render_line(
    line: u32,
    regs: &Vdp2Registers,
    vram: &Vdp2Vram,
    cram: &Cram,
    sprite_fb: &SpriteFrameBuffer,
    row: &mut [Color],
) {
    let back_color = back_screen_color(line, regs, vram);
    let ratio = u16::from(regs.ccrna as u8 & 0x1F);

    for (x, out) in row.iter_mut().enumerate() {
        let mut layers = [LayerPixel::default(); LAYER_COUNT];

        layers[LAYER_SPRITE] = sprite_pixel(x as u32, line, regs, cram, sprite_fb);

        for screen in 0..NBG_COUNT {
            if regs.nbg_enabled(screen) {
                layers[LAYER_NBG_BASE + screen] = nbg_pixel(screen, x as u32, line, regs, vram, cram);
            }
        }

        if regs.rbg0_enabled() {
            layers[LAYER_RBG0] = rbg0_pixel(x as u32, line, regs, vram, cram);
        }

        // Highest priority opaque pixel wins; priority 0 never displays
        let mut top: Option<LayerPixel> = None;
        let mut second: Option<LayerPixel> = None;
        for pixel in layers {
            if !pixel.opaque || pixel.priority == 0 {
                continue;
            }
            match top {
                Some(current) if pixel.priority <= current.priority => {
                    if second.is_none_or(|s| pixel.priority > s.priority) {
                        second = Some(pixel);
                    }
                }
                _ => {
                    second = top;
                    top = Some(pixel);
                }
            }
        }

        *out = match top {
            None => back_color,
            Some(pixel) => {
                let top_color = Color::from_saturn_rgb555(pixel.color);
                if pixel.color_calc {
                    let under = second
                        .map_or(back_color, |p| Color::from_saturn_rgb555(p.color));
                    blend(top_color, under, ratio)
                } else {
                    top_color
                }
            }
        };
    }
}

fn back_screen_color(line: u32, regs: &Vdp2Registers, vram: &Vdp2Vram) -> Color {
    let table_addr = ((u32::from(regs.bktau & 0x7) << 16) | u32::from(regs.bktal)) << 1;
    // Bit 15 of BKTAU selects one color per line instead of a single color
    let offset = if regs.bktau.bit(15) { table_addr + line * 2 } else { table_addr };
    Color::from_saturn_rgb555(read_vram_word(vram, offset))
}

fn read_vram_word(vram: &Vdp2Vram, offset: u32) -> u16 {
    let i = (offset as usize) & (super::VDP2_VRAM_LEN - 2);
    u16::from_be_bytes([vram[i], vram[i + 1]])
}

fn blend(top: Color, under: Color, ratio: u16) -> Color {
    // Ratio 0 keeps the top layer; 31 is (almost) entirely the layer underneath
    let mix = |a: u8, b: u8| {
        ((u16::from(a) * (31 - ratio) + u16::from(b) * ratio) / 31) as u8
    };
    Color::rgb(mix(top.r, under.r), mix(top.g, under.g), mix(top.b, under.b))
}

fn sprite_pixel(
    x: u32,
    y: u32,
    regs: &Vdp2Registers,
    cram: &Cram,
    sprite_fb: &SpriteFrameBuffer,
) -> LayerPixel {
    if x >= SPRITE_FB_WIDTH as u32 || y >= SPRITE_FB_HEIGHT as u32 {
        return LayerPixel::default();
    }

    let value = sprite_fb[(y as usize) * SPRITE_FB_WIDTH + (x as usize)];
    if value == 0 {
        return LayerPixel::default();
    }

    // MSB set means the VDP1 wrote RGB data; otherwise it is a palette code
    let color = if value.bit(15) { value } else { cram[usize::from(value) & 0x7FF] };

    LayerPixel {
        color,
        priority: regs.sprite_priority(),
        opaque: true,
        color_calc: regs.ccctl.bit(6),
    }
}

/// Per-screen character color depth: false = 16 colors, true = 256 colors.
fn nbg_color_256(screen: usize, regs: &Vdp2Registers) -> bool {
    match screen {
        0 => (regs.chctla >> 4) & 0x7 != 0,
        1 => (regs.chctla >> 12) & 0x3 != 0,
        2 => regs.chctlb.bit(1),
        _ => regs.chctlb.bit(5),
    }
}

fn nbg_pixel(
    screen: usize,
    x: u32,
    y: u32,
    regs: &Vdp2Registers,
    vram: &Vdp2Vram,
    cram: &Cram,
) -> LayerPixel {
    let sx = (x + u32::from(regs.scx[screen] & 0x7FF)) & 511;
    let sy = (y + u32::from(regs.scy[screen] & 0x7FF)) & 511;

    let map_offset = u32::from((regs.mpofn >> (screen * 4)) & 0x7);
    let plane = u32::from(regs.mpabn[screen] & 0x3F);
    let plane_addr = ((map_offset << 6) | plane) * 0x2000;

    sample_cell(
        plane_addr,
        sx,
        sy,
        nbg_color_256(screen, regs),
        regs.pncn[screen],
        regs.nbg_priority(screen),
        regs.ccctl.bit(screen as u8),
        vram,
        cram,
    )
}

fn rbg0_pixel(
    x: u32,
    y: u32,
    regs: &Vdp2Registers,
    vram: &Vdp2Vram,
    cram: &Cram,
) -> LayerPixel {
    // Rotation parameter table: screen start and the per-line / per-pixel deltas as
    // signed 16.16 fixed point
    let table = ((u32::from(regs.rpta_upper & 0x7) << 16) | u32::from(regs.rpta_lower)) << 1;
    let read_fixed = |offset: u32| -> i64 {
        let high = read_vram_word(vram, table + offset);
        let low = read_vram_word(vram, table + offset + 2);
        i64::from(((u32::from(high) << 16) | u32::from(low)) as i32)
    };

    let xst = read_fixed(0x00);
    let yst = read_fixed(0x04);
    let dxst = read_fixed(0x0C);
    let dyst = read_fixed(0x10);
    let dx = read_fixed(0x14);
    let dy = read_fixed(0x18);

    let u = xst + i64::from(y) * dxst + i64::from(x) * dx;
    let v = yst + i64::from(y) * dyst + i64::from(x) * dy;

    let su = ((u >> 16) as u32) & 511;
    let sv = ((v >> 16) as u32) & 511;

    let plane_addr = ((u32::from((regs.mpofr) & 0x7) << 6) | u32::from(regs.mpabra & 0x3F)) * 0x2000;

    sample_cell(
        plane_addr,
        su,
        sv,
        regs.chctlb.bit(12),
        regs.pncn[0],
        regs.rbg0_priority(),
        regs.ccctl.bit(4),
        vram,
        cram,
    )
}

/// Resolve one pixel of an 8x8-cell tile plane: pattern name lookup, character fetch,
/// palette resolution.
#[allow(clippy::too_many_arguments)]
fn sample_cell(
    plane_addr: u32,
    sx: u32,
    sy: u32,
    color_256: bool,
    pncn: u16,
    priority: u8,
    color_calc: bool,
    vram: &Vdp2Vram,
    cram: &Cram,
) -> LayerPixel {
    let cell = (sy / 8) * 64 + sx / 8;
    let pattern = read_vram_word(vram, plane_addr + cell * 2);

    // 1-word pattern name: character number in the low bits plus the supplement from PNCN,
    // palette in the high nibble, flips in bits 10-11
    let char_number = u32::from(pattern & 0x3FF) | (u32::from(pncn & 0x1F) << 10);
    let palette = u32::from((pattern >> 12) & 0xF) | (u32::from((pncn >> 5) & 0x7) << 4);
    let h_flip = pattern.bit(10);
    let v_flip = pattern.bit(11);

    let mut px = sx % 8;
    let mut py = sy % 8;
    if h_flip {
        px = 7 - px;
    }
    if v_flip {
        py = 7 - py;
    }

    let texel = if color_256 {
        let char_addr = char_number * 64;
        u16::from(vram[((char_addr + py * 8 + px) as usize) & (super::VDP2_VRAM_LEN - 1)])
    } else {
        let char_addr = char_number * 32;
        let byte = vram[((char_addr + (py * 8 + px) / 2) as usize) & (super::VDP2_VRAM_LEN - 1)];
        u16::from(if (py * 8 + px) & 1 == 0 { byte >> 4 } else { byte & 0xF })
    };

    if texel == 0 {
        return LayerPixel::default();
    }

    let cram_index = if color_256 {
        ((palette & 0x7) << 8) as usize | usize::from(texel)
    } else {
        ((palette << 4) as usize | usize::from(texel)) & (super::CRAM_LEN_WORDS - 1)
    };

    LayerPixel {
        color: cram[cram_index & (super::CRAM_LEN_WORDS - 1)],
        priority,
        opaque: true,
        color_calc,
    }
}

#[cfg(test)]
mod tests {
    use super::super::{Cram, SpriteFrameBuffer, Vdp2Vram};
    use super::*;

    fn write_vram_word(vram: &mut Vdp2Vram, offset: usize, value: u16) {
        vram[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
    }

    #[test]
    fn back_screen_fills_uncovered_pixels() {
        let regs = Vdp2Registers::default();
        let mut vram = Vdp2Vram::new();
        let cram = Cram::new();
        let sprite_fb = SpriteFrameBuffer::new();

        // Back screen table at VRAM offset 0: pure red (RGB555 blue-high convention)
        write_vram_word(&mut vram, 0, 0x001F);

        let mut row = vec![Color::default(); 320];
        render_line(0, &regs, &vram, &cram, &sprite_fb, &mut row);

        assert!(row.iter().all(|&c| c == Color::rgb(255, 0, 0)));
    }

    #[test]
    fn sprite_layer_beats_back_screen_when_priority_is_set() {
        let mut regs = Vdp2Registers::default();
        regs.prisa = 0x6;

        let vram = Vdp2Vram::new();
        let cram = Cram::new();
        let mut sprite_fb = SpriteFrameBuffer::new();
        // RGB white at pixel (3, 0)
        sprite_fb[3] = 0xFFFF;

        let mut row = vec![Color::default(); 8];
        render_line(0, &regs, &vram, &cram, &sprite_fb, &mut row);

        assert_eq!(row[3], Color::rgb(255, 255, 255));
        assert_eq!(row[0], Color::rgb(0, 0, 0));
    }

    #[test]
    fn nbg_tile_resolves_through_cram() {
        let mut regs = Vdp2Registers::default();
        regs.bgon = 0x1; // NBG0 on
        regs.prina = 0x7;

        let mut vram = Vdp2Vram::new();
        let mut cram = Cram::new();
        let sprite_fb = SpriteFrameBuffer::new();

        // Pattern name for cell (0,0): character 1, palette 0
        write_vram_word(&mut vram, 0, 0x0001);
        // Character 1 at 32 bytes: all texels = 1 (4bpp nibbles 0x11)
        for i in 0..32 {
            vram[32 + i] = 0x11;
        }
        // Palette entry 1: green
        cram[1] = 0x03E0;

        let mut row = vec![Color::default(); 8];
        render_line(0, &regs, &vram, &cram, &sprite_fb, &mut row);

        assert_eq!(row[0], Color::rgb(0, 255, 0));
    }

    #[test]
    fn higher_priority_layer_wins() {
        let mut regs = Vdp2Registers::default();
        regs.bgon = 0x1;
        regs.prina = 0x2; // NBG0 priority 2
        regs.prisa = 0x5; // sprites priority 5

        let mut vram = Vdp2Vram::new();
        let mut cram = Cram::new();
        let mut sprite_fb = SpriteFrameBuffer::new();

        write_vram_word(&mut vram, 0, 0x0001);
        for i in 0..32 {
            vram[32 + i] = 0x11;
        }
        cram[1] = 0x03E0; // green tile
        sprite_fb[0] = 0xFFFF; // white sprite

        let mut row = vec![Color::default(); 1];
        render_line(0, &regs, &vram, &cram, &sprite_fb, &mut row);
        assert_eq!(row[0], Color::rgb(255, 255, 255));

        // Flip the priorities and the tile shows through
        regs.prina = 0x6;
        regs.prisa = 0x1;
        render_line(0, &regs, &vram, &cram, &sprite_fb, &mut row);
        assert_eq!(row[0], Color::rgb(0, 255, 0));
    }
}
