//! SMPC: system manager and peripheral control
//!
//! Handles the command interface the BIOS drives (notably INTBACK for peripheral data and
//! the RTC), the two peripheral ports, and the persistent data file holding the clock
//! offset and system settings. Input flows pull-style: when the emulated game polls, the
//! port invokes the report callback the orchestrator registered and the current pad state
//! is encoded into the output registers.

use bincode::{Decode, Encode};
use brimir_common::num::GetBit;
use std::fs;
use std::io;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

pub const PORT_COUNT: usize = 2;

// Saturn control pad button bits; 0 = pressed on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct SaturnButtons(pub u16);

impl SaturnButtons {
    pub const RIGHT: u16 = 1 << 15;
    pub const LEFT: u16 = 1 << 14;
    pub const DOWN: u16 = 1 << 13;
    pub const UP: u16 = 1 << 12;
    pub const START: u16 = 1 << 11;
    pub const A: u16 = 1 << 10;
    pub const C: u16 = 1 << 9;
    pub const B: u16 = 1 << 8;
    pub const R: u16 = 1 << 7;
    pub const X: u16 = 1 << 6;
    pub const Y: u16 = 1 << 5;
    pub const Z: u16 = 1 << 4;
    pub const L: u16 = 1 << 3;

    /// All buttons released (inverted logic: every line high)
    #[must_use]
    pub fn released() -> Self {
        Self(0xFFFF)
    }

    pub fn press(&mut self, button: u16) {
        self.0 &= !button;
    }
}

impl Default for SaturnButtons {
    fn default() -> Self {
        Self::released()
    }
}

/// Filled in by the orchestrator's report callback during peripheral polling.
#[derive(Debug, Clone, Copy)]
pub struct PeripheralReport {
    pub connected: bool,
    pub buttons: SaturnButtons,
}

impl Default for PeripheralReport {
    fn default() -> Self {
        Self { connected: true, buttons: SaturnButtons::released() }
    }
}

pub type PeripheralReportCallback = Box<dyn FnMut(&mut PeripheralReport) + Send>;

/// Clock and system settings that survive across sessions (`.smpc` file).
#[derive(Debug, Clone, Copy, Encode, Decode)]
pub struct SmpcPersistentData {
    /// Offset between host wall clock and the emulated RTC, in seconds
    pub rtc_offset_seconds: i64,
    pub area_code: u8,
    /// Battery-backed SMEM bytes (language and audio settings)
    pub smem: [u8; 4],
}

impl Default for SmpcPersistentData {
    fn default() -> Self {
        Self { rtc_offset_seconds: 0, area_code: 0x01, smem: [0; 4] }
    }
}

const OREG_COUNT: usize = 32;

#[derive(Debug, Encode, Decode)]
pub struct Smpc {
    ireg: [u8; 7],
    oreg: [u8; OREG_COUNT],
    status_flag: bool,
    /// SSHON/SSHOFF state; the system gates slave SH-2 execution on this
    pub slave_sh2_on: bool,
    pub persistent: SmpcPersistentData,
}

pub struct PeripheralPorts {
    callbacks: [Option<PeripheralReportCallback>; PORT_COUNT],
}

impl Default for PeripheralPorts {
    fn default() -> Self {
        Self { callbacks: [None, None] }
    }
}

impl PeripheralPorts {
    pub fn set_report_callback(&mut self, port: usize, callback: PeripheralReportCallback) {
        if port < PORT_COUNT {
            self.callbacks[port] = Some(callback);
        }
    }

    pub fn clear(&mut self) {
        self.callbacks = [None, None];
    }

    fn poll(&mut self, port: usize) -> PeripheralReport {
        let mut report = PeripheralReport::default();
        if let Some(callback) = self.callbacks.get_mut(port).and_then(Option::as_mut) {
            callback(&mut report);
        }
        report
    }
}

impl Default for Smpc {
    fn default() -> Self {
        Self::new()
    }
}

impl Smpc {
    #[must_use]
    pub fn new() -> Self {
        Self {
            ireg: [0; 7],
            oreg: [0; OREG_COUNT],
            status_flag: false,
            slave_sh2_on: false,
            persistent: SmpcPersistentData::default(),
        }
    }

    pub fn read_register(&mut self, address: u32) -> u8 {
        match address & 0x7F {
            // OREG0-31 at odd addresses 0x21-0x5F
            offset @ 0x21..=0x5F if offset & 1 == 1 => {
                self.oreg[((offset - 0x21) / 2) as usize]
            }
            // SR
            0x61 => 0x80 | u8::from(self.status_flag),
            // SF
            0x63 => u8::from(self.status_flag),
            _ => 0,
        }
    }

    pub fn write_register(&mut self, address: u32, value: u8) {
        match address & 0x7F {
            // IREG0-6 at odd addresses 0x01-0x0D
            offset @ 0x01..=0x0D if offset & 1 == 1 => {
                self.ireg[((offset - 1) / 2) as usize] = value;
            }
            // COMREG: commands complete immediately from the bus's point of view
            0x1F => self.execute_command_register_only(value),
            // SF: writing sets the busy flag; command completion clears it
            0x63 => self.status_flag = true,
            _ => log::trace!("SMPC register write: {address:08X} {value:02X}"),
        }
    }

    /// Commands that do not need the peripheral ports. INTBACK peripheral data is filled in
    /// by [`Smpc::execute_intback`], which the system calls with the ports borrowed.
    fn execute_command_register_only(&mut self, command: u8) {
        log::debug!("SMPC command {command:02X}");
        match command {
            // SSHON / SSHOFF
            0x02 => self.slave_sh2_on = true,
            0x03 => self.slave_sh2_on = false,
            // MSHON / sound and CD on-off: nothing observable at this level
            0x00 | 0x01 | 0x04..=0x07 => {}
            // SETSMEM
            0x17 => {
                self.persistent.smem.copy_from_slice(&self.ireg[0..4]);
            }
            // SETTIME
            0x16 => self.set_rtc_from_iregs(),
            // INTBACK: status portion; peripheral portion is appended by the system
            0x10 => self.fill_status_oregs(),
            _ => log::warn!("Unhandled SMPC command {command:02X}"),
        }
        self.status_flag = false;
    }

    /// INTBACK continuation: encode both ports' pad reports into OREGs.
    pub fn execute_intback(&mut self, ports: &mut PeripheralPorts) {
        // Only when the command requested peripheral data
        if !self.ireg[1].bit(3) {
            return;
        }

        let mut index = 0;
        for port in 0..PORT_COUNT {
            let report = ports.poll(port);
            if !report.connected {
                // F0: no peripheral on this port
                self.push_oreg(&mut index, 0xF0);
                continue;
            }

            // Standard pad: port status (1 peripheral, direct), then type + 2 data bytes
            self.push_oreg(&mut index, 0xF1);
            self.push_oreg(&mut index, 0x02);
            let buttons = report.buttons.0;
            self.push_oreg(&mut index, (buttons >> 8) as u8);
            self.push_oreg(&mut index, buttons as u8);
        }
    }

    fn push_oreg(&mut self, index: &mut usize, value: u8) {
        if *index < OREG_COUNT {
            self.oreg[*index] = value;
            *index += 1;
        }
    }

    fn fill_status_oregs(&mut self) {
        let seconds = self.rtc_now();

        // A fixed, plausible date encoding: the BIOS mainly cares that the values are BCD
        // and self-consistent
        let days = seconds / 86_400;
        let time_of_day = seconds % 86_400;
        self.oreg[0] = 0x80; // STE set: clock has been set
        self.oreg[1] = to_bcd((1996 + days / 365 % 100) as u8);
        self.oreg[2] = to_bcd((days / 30 % 12 + 1) as u8);
        self.oreg[3] = to_bcd((days % 30 + 1) as u8);
        self.oreg[4] = to_bcd((time_of_day / 3600) as u8);
        self.oreg[5] = to_bcd((time_of_day % 3600 / 60) as u8);
        self.oreg[6] = to_bcd((time_of_day % 60) as u8);
        self.oreg[9] = self.persistent.area_code;
        self.oreg[10] = 0;
        self.oreg[12..16].copy_from_slice(&self.persistent.smem);
    }

    fn set_rtc_from_iregs(&mut self) {
        // The BIOS hands a full BCD timestamp; persist it as an offset from the host clock
        // so the emulated RTC keeps advancing between sessions
        let host = host_epoch_seconds();
        let requested = i64::from(from_bcd(self.ireg[6])) // seconds
            + 60 * i64::from(from_bcd(self.ireg[5]))
            + 3600 * i64::from(from_bcd(self.ireg[4]));
        // Only the time-of-day delta is tracked; date-level offsets ride along with it
        let host_time_of_day = host % 86_400;
        self.persistent.rtc_offset_seconds = requested - host_time_of_day;
        log::debug!("SMPC RTC set; offset is now {}s", self.persistent.rtc_offset_seconds);
    }

    fn rtc_now(&self) -> i64 {
        host_epoch_seconds() + self.persistent.rtc_offset_seconds
    }

    /// Load persistent data from the `.smpc` file if it exists.
    pub fn load_persistent_data(&mut self, path: &Path) -> io::Result<()> {
        let bytes = fs::read(path)?;
        let (data, _) = bincode::decode_from_slice(&bytes, persistent_config())
            .map_err(|source| io::Error::new(io::ErrorKind::InvalidData, source))?;
        self.persistent = data;
        Ok(())
    }

    /// Write persistent data to the `.smpc` file.
    pub fn save_persistent_data(&self, path: &Path) -> io::Result<()> {
        let bytes = bincode::encode_to_vec(self.persistent, persistent_config())
            .map_err(io::Error::other)?;
        fs::write(path, bytes)
    }
}

fn persistent_config() -> impl bincode::config::Config {
    bincode::config::standard().with_little_endian().with_fixed_int_encoding()
}

fn host_epoch_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_secs() as i64)
}

fn to_bcd(value: u8) -> u8 {
    ((value / 10) << 4) | (value % 10)
}

fn from_bcd(value: u8) -> u8 {
    (value >> 4) * 10 + (value & 0xF)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intback_encodes_inverted_button_lines() {
        let mut smpc = Smpc::new();
        let mut ports = PeripheralPorts::default();

        ports.set_report_callback(
            0,
            Box::new(|report| {
                report.buttons.press(SaturnButtons::START);
                report.buttons.press(SaturnButtons::A);
            }),
        );

        // INTBACK requesting peripheral data
        smpc.write_register(0x03, 0x08);
        smpc.write_register(0x1F, 0x10);
        smpc.execute_intback(&mut ports);

        assert_eq!(smpc.oreg[0], 0xF1);
        assert_eq!(smpc.oreg[1], 0x02);
        let buttons = (u16::from(smpc.oreg[2]) << 8) | u16::from(smpc.oreg[3]);
        assert_eq!(buttons & SaturnButtons::START, 0);
        assert_eq!(buttons & SaturnButtons::A, 0);
        // Unpressed lines stay high
        assert_ne!(buttons & SaturnButtons::B, 0);

        // Port 2 has no callback; the default report is a released pad
        assert_eq!(smpc.oreg[4], 0xF1);
    }

    #[test]
    fn setsmem_persists_ireg_bytes() {
        let mut smpc = Smpc::new();
        for (i, value) in [1, 2, 3, 4].into_iter().enumerate() {
            smpc.write_register(0x01 + 2 * i as u32, value);
        }
        smpc.write_register(0x1F, 0x17);

        assert_eq!(smpc.persistent.smem, [1, 2, 3, 4]);
    }

    #[test]
    fn persistent_data_round_trips_through_the_file() {
        let mut smpc = Smpc::new();
        smpc.persistent.rtc_offset_seconds = -12345;
        smpc.persistent.area_code = 0x04;
        smpc.persistent.smem = [9, 8, 7, 6];

        let dir = std::env::temp_dir().join("saturn-core-smpc-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("brimir_saturn_rtc.smpc");

        smpc.save_persistent_data(&path).unwrap();

        let mut loaded = Smpc::new();
        loaded.load_persistent_data(&path).unwrap();
        assert_eq!(loaded.persistent.rtc_offset_seconds, -12345);
        assert_eq!(loaded.persistent.area_code, 0x04);
        assert_eq!(loaded.persistent.smem, [9, 8, 7, 6]);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn command_clears_the_busy_flag() {
        let mut smpc = Smpc::new();
        smpc.write_register(0x63, 1);
        assert_eq!(smpc.read_register(0x63), 1);

        smpc.write_register(0x1F, 0x10);
        assert_eq!(smpc.read_register(0x63), 0);
    }
}
