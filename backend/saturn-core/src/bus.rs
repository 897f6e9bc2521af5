//! Saturn system bus
//!
//! Address decoding for the 27-bit external space both SH-2s see. The region table is fixed:
//! BIOS ROM, SMPC, backup RAM, low work RAM, the CD block, SCSP, VDP1/VDP2, and high work
//! RAM, with the customary mirrors. Unmapped reads return 0xFF on every byte (open bus);
//! unmapped writes are logged and dropped.
//!
//! The bus itself is a short-lived borrow assembled around the system's components for the
//! duration of a CPU slice. Writes into work RAM are recorded so the caller can invalidate
//! any compiled blocks covering them.

use crate::backupram::BackupRam;
use crate::cdblock::CdBlock;
use crate::scsp::Scsp;
use crate::smpc::Smpc;
use crate::vdp::Vdp;
use brimir_common::boxedarray::BoxedByteArray;
use brimir_common::num::U16Ext;
use sh2_emu::bus::BusInterface;

pub type WorkRam = BoxedByteArray<{ crate::WORK_RAM_LEN }>;
pub type BiosRom = BoxedByteArray<{ crate::BIOS_LEN }>;

const BIOS_END: u32 = 0x000F_FFFF;
const SMPC_START: u32 = 0x0010_0000;
const SMPC_END: u32 = 0x0017_FFFF;
const BACKUP_START: u32 = 0x0018_0000;
const BACKUP_END: u32 = 0x001F_FFFF;
const WRAM_LOW_START: u32 = 0x0020_0000;
const WRAM_LOW_END: u32 = 0x002F_FFFF;
const CD_BLOCK_START: u32 = 0x0580_0000;
const CD_BLOCK_END: u32 = 0x059F_FFFF;
const SCSP_START: u32 = 0x05A0_0000;
const SCSP_END: u32 = 0x05BF_FFFF;
const VDP1_START: u32 = 0x05C0_0000;
const VDP1_END: u32 = 0x05D7_FFFF;
const VDP2_START: u32 = 0x05E0_0000;
const VDP2_END: u32 = 0x05FD_FFFF;
const WRAM_HIGH_START: u32 = 0x0600_0000;

/// Interrupt lines as the SH-2s see them, maintained by the system between slices.
#[derive(Debug, Clone, Copy, Default, bincode::Encode, bincode::Decode)]
pub struct InterruptState {
    pub master_level: u8,
    pub slave_level: u8,
    pub reset_asserted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WhichCpu {
    Master,
    Slave,
}

pub struct SaturnBus<'a> {
    pub which: WhichCpu,
    pub bios: &'a BiosRom,
    pub wram_low: &'a mut WorkRam,
    pub wram_high: &'a mut WorkRam,
    pub vdp: &'a mut Vdp,
    pub scsp: &'a mut Scsp,
    pub smpc: &'a mut Smpc,
    pub cd_block: &'a mut CdBlock,
    pub backup_ram: &'a mut BackupRam,
    pub interrupts: &'a InterruptState,
    /// Ranges written this slice that may contain compiled code
    pub code_writes: &'a mut Vec<(u32, u32)>,
}

impl SaturnBus<'_> {
    fn record_code_write(&mut self, address: u32, len: u32) {
        self.code_writes.push((address, address + len));
    }
}

macro_rules! wram_index {
    ($address:expr) => {
        ($address as usize) & (crate::WORK_RAM_LEN - 1)
    };
}

impl BusInterface for SaturnBus<'_> {
    fn read_byte(&mut self, address: u32) -> u8 {
        match address {
            0..=BIOS_END => self.bios[(address as usize) & (crate::BIOS_LEN - 1)],
            SMPC_START..=SMPC_END => self.smpc.read_register(address),
            BACKUP_START..=BACKUP_END => self.backup_ram.read_byte(address),
            WRAM_LOW_START..=WRAM_LOW_END => self.wram_low[wram_index!(address)],
            CD_BLOCK_START..=CD_BLOCK_END => self.cd_block.read_word(address).lsb(),
            SCSP_START..=SCSP_END => self.scsp.read_byte(address),
            VDP1_START..=VDP1_END | VDP2_START..=VDP2_END => {
                let word = self.vdp.read_word(address & !1);
                if address & 1 == 0 { word.msb() } else { word.lsb() }
            }
            WRAM_HIGH_START.. => self.wram_high[wram_index!(address)],
            _ => open_bus_byte(address),
        }
    }

    fn read_word(&mut self, address: u32) -> u16 {
        match address {
            0..=BIOS_END => {
                let i = (address as usize) & (crate::BIOS_LEN - 2);
                u16::from_be_bytes([self.bios[i], self.bios[i + 1]])
            }
            SMPC_START..=SMPC_END => self.smpc.read_register(address | 1).into(),
            BACKUP_START..=BACKUP_END => {
                0xFF00 | u16::from(self.backup_ram.read_byte(address | 1))
            }
            WRAM_LOW_START..=WRAM_LOW_END => {
                let i = wram_index!(address & !1);
                u16::from_be_bytes([self.wram_low[i], self.wram_low[i + 1]])
            }
            CD_BLOCK_START..=CD_BLOCK_END => self.cd_block.read_word(address),
            SCSP_START..=SCSP_END => self.scsp.read_word(address),
            VDP1_START..=VDP1_END | VDP2_START..=VDP2_END => self.vdp.read_word(address),
            WRAM_HIGH_START.. => {
                let i = wram_index!(address & !1);
                u16::from_be_bytes([self.wram_high[i], self.wram_high[i + 1]])
            }
            _ => u16::from_be_bytes([open_bus_byte(address); 2]),
        }
    }

    fn read_longword(&mut self, address: u32) -> u32 {
        let high = self.read_word(address & !3);
        let low = self.read_word((address & !3) | 2);
        (u32::from(high) << 16) | u32::from(low)
    }

    fn write_byte(&mut self, address: u32, value: u8) {
        match address {
            0..=BIOS_END => log::warn!("BIOS ROM byte write ignored: {address:08X} {value:02X}"),
            SMPC_START..=SMPC_END => self.smpc.write_register(address, value),
            BACKUP_START..=BACKUP_END => self.backup_ram.write_byte(address, value),
            WRAM_LOW_START..=WRAM_LOW_END => {
                self.wram_low[wram_index!(address)] = value;
                self.record_code_write(address, 1);
            }
            CD_BLOCK_START..=CD_BLOCK_END => {
                self.cd_block.write_word(address, value.into());
            }
            SCSP_START..=SCSP_END => self.scsp.write_byte(address, value),
            VDP1_START..=VDP1_END | VDP2_START..=VDP2_END => {
                let mut word = self.vdp.read_word(address & !1);
                if address & 1 == 0 { word.set_msb(value) } else { word.set_lsb(value) }
                self.vdp.write_word(address & !1, word);
            }
            WRAM_HIGH_START.. => {
                self.wram_high[wram_index!(address)] = value;
                self.record_code_write(address, 1);
            }
            _ => log::warn!("Unmapped byte write: {address:08X} {value:02X}"),
        }
    }

    fn write_word(&mut self, address: u32, value: u16) {
        match address {
            0..=BIOS_END => log::warn!("BIOS ROM word write ignored: {address:08X} {value:04X}"),
            SMPC_START..=SMPC_END => self.smpc.write_register(address | 1, value.lsb()),
            BACKUP_START..=BACKUP_END => self.backup_ram.write_byte(address | 1, value.lsb()),
            WRAM_LOW_START..=WRAM_LOW_END => {
                let i = wram_index!(address & !1);
                self.wram_low[i..i + 2].copy_from_slice(&value.to_be_bytes());
                self.record_code_write(address & !1, 2);
            }
            CD_BLOCK_START..=CD_BLOCK_END => self.cd_block.write_word(address, value),
            SCSP_START..=SCSP_END => self.scsp.write_word(address, value),
            VDP1_START..=VDP1_END | VDP2_START..=VDP2_END => self.vdp.write_word(address, value),
            WRAM_HIGH_START.. => {
                let i = wram_index!(address & !1);
                self.wram_high[i..i + 2].copy_from_slice(&value.to_be_bytes());
                self.record_code_write(address & !1, 2);
            }
            _ => log::warn!("Unmapped word write: {address:08X} {value:04X}"),
        }
    }

    fn write_longword(&mut self, address: u32, value: u32) {
        self.write_word(address & !3, (value >> 16) as u16);
        self.write_word((address & !3) | 2, value as u16);
    }

    fn reset(&self) -> bool {
        self.interrupts.reset_asserted
    }

    fn interrupt_level(&self) -> u8 {
        match self.which {
            WhichCpu::Master => self.interrupts.master_level,
            WhichCpu::Slave => self.interrupts.slave_level,
        }
    }
}

fn open_bus_byte(address: u32) -> u8 {
    log::trace!("Open bus read: {address:08X}");
    0xFF
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backupram::BackupRam;
    use crate::cdblock::CdBlock;
    use crate::scsp::Scsp;
    use crate::smpc::Smpc;
    use crate::vdp::Vdp;
    use brimir_common::frontend::TimingMode;

    struct Fixture {
        bios: BiosRom,
        wram_low: WorkRam,
        wram_high: WorkRam,
        vdp: Vdp,
        scsp: Scsp,
        smpc: Smpc,
        cd_block: CdBlock,
        backup_ram: BackupRam,
        interrupts: InterruptState,
        code_writes: Vec<(u32, u32)>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                bios: BiosRom::new(),
                wram_low: WorkRam::new(),
                wram_high: WorkRam::new(),
                vdp: Vdp::new(TimingMode::Ntsc),
                scsp: Scsp::new(),
                smpc: Smpc::new(),
                cd_block: CdBlock::new(),
                backup_ram: BackupRam::in_memory(),
                interrupts: InterruptState::default(),
                code_writes: Vec::new(),
            }
        }

        fn bus(&mut self) -> SaturnBus<'_> {
            SaturnBus {
                which: WhichCpu::Master,
                bios: &self.bios,
                wram_low: &mut self.wram_low,
                wram_high: &mut self.wram_high,
                vdp: &mut self.vdp,
                scsp: &mut self.scsp,
                smpc: &mut self.smpc,
                cd_block: &mut self.cd_block,
                backup_ram: &mut self.backup_ram,
                interrupts: &self.interrupts,
                code_writes: &mut self.code_writes,
            }
        }
    }

    #[test]
    fn work_ram_round_trips_big_endian() {
        let mut fixture = Fixture::new();
        let mut bus = fixture.bus();

        bus.write_longword(0x0600_1000, 0x0123_4567);
        assert_eq!(bus.read_longword(0x0600_1000), 0x0123_4567);
        assert_eq!(bus.read_word(0x0600_1000), 0x0123);
        assert_eq!(bus.read_byte(0x0600_1003), 0x67);

        bus.write_word(0x0020_0000, 0xBEEF);
        assert_eq!(bus.read_word(0x0020_0000), 0xBEEF);
    }

    #[test]
    fn unmapped_reads_return_open_bus() {
        let mut fixture = Fixture::new();
        let mut bus = fixture.bus();

        assert_eq!(bus.read_byte(0x0400_0000), 0xFF);
        assert_eq!(bus.read_word(0x0400_0000), 0xFFFF);
        assert_eq!(bus.read_longword(0x0400_0000), 0xFFFF_FFFF);
    }

    #[test]
    fn work_ram_writes_are_recorded_for_invalidation() {
        let mut fixture = Fixture::new();
        let mut bus = fixture.bus();

        bus.write_word(0x0600_2000, 0x1234);
        bus.write_byte(0x0020_0010, 0x56);

        assert_eq!(fixture.code_writes, vec![(0x0600_2000, 0x0600_2002), (0x0020_0010, 0x0020_0011)]);
    }

    #[test]
    fn work_ram_mirrors() {
        let mut fixture = Fixture::new();
        let mut bus = fixture.bus();

        bus.write_word(0x0600_0100, 0xCAFE);
        assert_eq!(bus.read_word(0x0610_0100), 0xCAFE);
    }
}
