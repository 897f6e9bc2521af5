//! CD block: tray, drive state, and the command interface
//!
//! Enough of the CR1-4 command protocol for the BIOS to see a live drive and for games to
//! stream data sectors. Sector delivery is paced through scheduler events; the read speed
//! factor scales the pacing the way the real drive's 2x mode does.

use crate::disc::Disc;
use bincode::{Decode, Encode};
use brimir_common::num::U16Ext;

// HIRQ bits the command flow uses
const HIRQ_CMOK: u16 = 1 << 0;
const HIRQ_DRDY: u16 = 1 << 1;
const HIRQ_EFLS: u16 = 1 << 6;

// Drive status codes (CR1 high byte)
const STATUS_PAUSE: u8 = 0x01;
const STATUS_PLAY: u8 = 0x03;
const STATUS_OPEN: u8 = 0x06;
const STATUS_NODISC: u8 = 0x07;

pub const DEFAULT_READ_SPEED: u8 = 2;

#[derive(Debug, Encode, Decode)]
pub struct CdBlock {
    disc: Option<Disc>,
    tray_open: bool,
    hirq: u16,
    cr: [u16; 4],
    response: [u16; 4],
    /// Current pickup position in absolute frames
    current_frame: u32,
    playing: bool,
    read_speed: u8,
    /// Data sectors delivered since the last buffer drain
    sectors_available: u8,
}

impl Default for CdBlock {
    fn default() -> Self {
        Self::new()
    }
}

impl CdBlock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            disc: None,
            tray_open: true,
            hirq: HIRQ_CMOK,
            cr: [0; 4],
            response: [0; 4],
            current_frame: 150,
            playing: false,
            read_speed: DEFAULT_READ_SPEED,
            sectors_available: 0,
        }
    }

    pub fn insert_disc(&mut self, disc: Disc) {
        self.disc = Some(disc);
    }

    pub fn eject_disc(&mut self) {
        self.disc = None;
        self.tray_open = true;
        self.playing = false;
    }

    pub fn close_tray(&mut self) {
        self.tray_open = false;
    }

    #[must_use]
    pub fn disc(&self) -> Option<&Disc> {
        self.disc.as_ref()
    }

    pub fn set_read_speed(&mut self, speed: u8) {
        self.read_speed = speed.clamp(2, 200);
    }

    #[must_use]
    pub fn read_speed(&self) -> u8 {
        self.read_speed
    }

    /// Cycles between sector deliveries while playing: 75 sectors/second at 1x, scaled by
    /// the read speed factor.
    #[must_use]
    pub fn drive_cycle_interval(&self, sh2_clock: u64) -> u64 {
        sh2_clock / (75 * u64::from(self.read_speed))
    }

    /// Periodic drive tick from the scheduler: advance the pickup and raise data-ready.
    pub fn tick_drive(&mut self) {
        if !self.playing || self.tray_open {
            return;
        }

        if self.disc.is_some() {
            self.current_frame += 1;
            self.sectors_available = self.sectors_available.saturating_add(1);
            self.hirq |= HIRQ_DRDY;
        }
    }

    fn drive_status(&self) -> u8 {
        if self.tray_open {
            STATUS_OPEN
        } else if self.disc.is_none() {
            STATUS_NODISC
        } else if self.playing {
            STATUS_PLAY
        } else {
            STATUS_PAUSE
        }
    }

    pub fn read_word(&mut self, address: u32) -> u16 {
        match address & 0x3F {
            0x08 => self.hirq,
            0x0C => 0xFFFF, // HIRQ mask; not modeled
            0x18 => self.response[0],
            0x1C => self.response[1],
            0x20 => self.response[2],
            0x24 => self.response[3],
            _ => 0,
        }
    }

    pub fn write_word(&mut self, address: u32, value: u16) {
        match address & 0x3F {
            // Writing zeros acknowledges HIRQ bits
            0x08 => self.hirq &= value,
            0x18 => self.cr[0] = value,
            0x1C => self.cr[1] = value,
            0x20 => self.cr[2] = value,
            // CR4 write fires the command
            0x24 => {
                self.cr[3] = value;
                self.execute_command();
            }
            _ => log::trace!("CD block register write: {address:08X} {value:04X}"),
        }
    }

    fn execute_command(&mut self) {
        let command = self.cr[0].msb();
        log::debug!("CD block command {command:02X}");

        // Default response: status + position
        let status = self.drive_status();
        self.response = [
            (u16::from(status) << 8) | u16::from(self.cr[0].lsb()),
            (self.current_frame >> 16) as u16,
            self.current_frame as u16,
            u16::from(self.sectors_available),
        ];

        match command {
            // Get status / get hardware info / get TOC: the default response carries what
            // the BIOS needs to proceed
            0x00 | 0x01 | 0x02 => {}
            // Initialize CD system
            0x04 => {
                self.playing = false;
                self.current_frame = 150;
                self.sectors_available = 0;
                self.hirq |= HIRQ_EFLS;
            }
            // Play / seek to FAD
            0x10 | 0x11 => {
                let fad = (u32::from(self.cr[0].lsb()) << 16) | u32::from(self.cr[1]);
                if fad != 0xFFFFFF {
                    self.current_frame = fad & 0xF_FFFF;
                }
                self.playing = command == 0x10;
            }
            // End data transfer
            0x06 => {
                self.sectors_available = 0;
                self.hirq &= !HIRQ_DRDY;
            }
            _ => log::warn!("Unhandled CD block command {command:02X}"),
        }

        self.hirq |= HIRQ_CMOK;
    }

    #[must_use]
    pub fn is_playing(&self) -> bool {
        self.playing
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disc::{AreaCode, Disc, DiscHeader};

    fn test_disc() -> Disc {
        Disc {
            header: DiscHeader {
                game_title: "TEST GAME".into(),
                product_number: "T-00000".into(),
                area_code: AreaCode::NORTH_AMERICA,
            },
            ..Disc::default()
        }
    }

    #[test]
    fn status_reflects_tray_and_disc_state() {
        let mut cd = CdBlock::new();
        assert_eq!(cd.drive_status(), STATUS_OPEN);

        cd.close_tray();
        assert_eq!(cd.drive_status(), STATUS_NODISC);

        cd.insert_disc(test_disc());
        assert_eq!(cd.drive_status(), STATUS_PAUSE);
    }

    #[test]
    fn play_command_starts_sector_delivery() {
        let mut cd = CdBlock::new();
        cd.insert_disc(test_disc());
        cd.close_tray();

        // Play from FAD 200
        cd.write_word(0x18, 0x1000);
        cd.write_word(0x1C, 200);
        cd.write_word(0x24, 0);
        assert!(cd.is_playing());
        assert_eq!(cd.current_frame, 200);

        cd.tick_drive();
        cd.tick_drive();
        assert_eq!(cd.sectors_available, 2);
        assert_ne!(cd.read_word(0x08) & HIRQ_DRDY, 0);
    }

    #[test]
    fn read_speed_scales_the_drive_interval() {
        let mut cd = CdBlock::new();
        let at_2x = cd.drive_cycle_interval(crate::SH2_CLOCK_NTSC);

        cd.set_read_speed(4);
        assert_eq!(cd.drive_cycle_interval(crate::SH2_CLOCK_NTSC), at_2x / 2);

        // Clamped to the valid range
        cd.set_read_speed(1);
        assert_eq!(cd.read_speed(), 2);
    }
}
