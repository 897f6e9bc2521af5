//! Internal backup RAM
//!
//! 32 KiB of battery-backed save memory living in a memory-mapped file so the host sees
//! every write the game makes. The hardware maps the array onto odd byte lanes of a 64 KiB
//! bus window (even bytes read back 0xFF). When the file cannot be created the emulator
//! falls back to a volatile in-memory buffer and records the error instead of failing the
//! game load.

use crate::BACKUP_RAM_LEN;
use bincode::{Decode, Encode};
use memmap2::MmapMut;
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};

const FORMAT_HEADER: &[u8; 16] = b"BackUpRam Format";

enum Backing {
    Mapped { map: MmapMut, path: PathBuf },
    Memory(Box<[u8; BACKUP_RAM_LEN]>),
}

impl std::fmt::Debug for Backing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Mapped { path, .. } => write!(f, "Mapped({})", path.display()),
            Self::Memory(_) => write!(f, "Memory"),
        }
    }
}

#[derive(Debug)]
pub struct BackupRam {
    backing: Backing,
    dirty: bool,
}

impl BackupRam {
    /// Open or create the `.bup` file and map it. A fresh file is initialized with the
    /// BIOS format header pattern so games see formatted memory.
    pub fn map_file(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().read(true).write(true).create(true).truncate(false).open(path)?;

        let needs_format = file.metadata()?.len() != BACKUP_RAM_LEN as u64;
        file.set_len(BACKUP_RAM_LEN as u64)?;

        // SAFETY: the mapping is backed by a file this process just opened read-write; the
        // emulator is the only writer while the game is loaded
        let mut map = unsafe { MmapMut::map_mut(&file)? };

        if needs_format {
            format_image(&mut map);
            map.flush()?;
        }

        Ok(Self { backing: Backing::Mapped { map, path: path.to_path_buf() }, dirty: false })
    }

    /// Volatile fallback used when the save directory is unusable.
    #[must_use]
    pub fn in_memory() -> Self {
        let mut bytes: Box<[u8; BACKUP_RAM_LEN]> =
            vec![0; BACKUP_RAM_LEN].into_boxed_slice().try_into().unwrap();
        format_image(bytes.as_mut_slice());
        Self { backing: Backing::Memory(bytes), dirty: false }
    }

    fn bytes(&self) -> &[u8] {
        match &self.backing {
            Backing::Mapped { map, .. } => map,
            Backing::Memory(bytes) => bytes.as_slice(),
        }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        match &mut self.backing {
            Backing::Mapped { map, .. } => map,
            Backing::Memory(bytes) => bytes.as_mut_slice(),
        }
    }

    /// Bus read: backup RAM sits on the odd byte lanes; even addresses float high.
    #[must_use]
    pub fn read_byte(&self, address: u32) -> u8 {
        if address & 1 == 0 {
            return 0xFF;
        }
        self.bytes()[((address >> 1) as usize) & (BACKUP_RAM_LEN - 1)]
    }

    /// Bus write: only the odd lanes are connected.
    pub fn write_byte(&mut self, address: u32, value: u8) {
        if address & 1 == 0 {
            return;
        }
        let index = ((address >> 1) as usize) & (BACKUP_RAM_LEN - 1);
        self.bytes_mut()[index] = value;
        self.dirty = true;
    }

    /// Copy the full image for the host-visible view.
    #[must_use]
    pub fn read_all(&self) -> Vec<u8> {
        self.bytes().to_vec()
    }

    /// Overwrite the full image (frontend SRAM write-back).
    pub fn write_all(&mut self, data: &[u8]) -> bool {
        if data.len() != BACKUP_RAM_LEN {
            return false;
        }
        self.bytes_mut().copy_from_slice(data);
        self.dirty = true;
        true
    }

    /// True when the game has written since the flag was last taken.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    /// Push mapped bytes out to disk. A no-op for the in-memory fallback.
    pub fn flush(&mut self) -> io::Result<()> {
        match &mut self.backing {
            Backing::Mapped { map, .. } => map.flush(),
            Backing::Memory(_) => Ok(()),
        }
    }

    #[must_use]
    pub fn is_file_backed(&self) -> bool {
        matches!(self.backing, Backing::Mapped { .. })
    }
}

// Save states capture the image contents; on load they are written back through whatever
// backing is currently attached
impl Encode for BackupRam {
    fn encode<E: bincode::enc::Encoder>(
        &self,
        encoder: &mut E,
    ) -> Result<(), bincode::error::EncodeError> {
        for byte in self.bytes() {
            byte.encode(encoder)?;
        }
        Ok(())
    }
}

impl<Context> Decode<Context> for BackupRam {
    fn decode<D: bincode::de::Decoder<Context = Context>>(
        decoder: &mut D,
    ) -> Result<Self, bincode::error::DecodeError> {
        let mut ram = Self::in_memory();
        for byte in ram.bytes_mut() {
            *byte = u8::decode(decoder)?;
        }
        Ok(ram)
    }
}

impl<'de, Context> bincode::BorrowDecode<'de, Context> for BackupRam {
    fn borrow_decode<D: bincode::de::BorrowDecoder<'de, Context = Context>>(
        decoder: &mut D,
    ) -> Result<Self, bincode::error::DecodeError> {
        Decode::decode(decoder)
    }
}

/// Freshly formatted backup RAM: the BIOS format marker repeated through the header block,
/// zeroes elsewhere.
fn format_image(image: &mut [u8]) {
    image.fill(0);
    for chunk in image[..0x200].chunks_mut(FORMAT_HEADER.len()) {
        chunk.copy_from_slice(&FORMAT_HEADER[..chunk.len()]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_image_is_formatted() {
        let ram = BackupRam::in_memory();
        assert_eq!(&ram.read_all()[..16], FORMAT_HEADER);
    }

    #[test]
    fn odd_lane_addressing() {
        let mut ram = BackupRam::in_memory();

        ram.write_byte(0x0018_0001, 0xAB);
        assert_eq!(ram.read_byte(0x0018_0001), 0xAB);
        // Even lanes float high and ignore writes
        ram.write_byte(0x0018_0000, 0x12);
        assert_eq!(ram.read_byte(0x0018_0000), 0xFF);

        assert!(ram.take_dirty());
        assert!(!ram.take_dirty());
    }

    #[test]
    fn full_image_round_trip() {
        let mut ram = BackupRam::in_memory();
        let payload = vec![0x5A; BACKUP_RAM_LEN];

        assert!(ram.write_all(&payload));
        assert_eq!(ram.read_all(), payload);

        // Wrong length is rejected
        assert!(!ram.write_all(&[0; 16]));
    }

    #[test]
    fn mapped_file_persists_across_reopen() {
        let dir = std::env::temp_dir().join("saturn-core-bup-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("test_game.bup");
        std::fs::remove_file(&path).ok();

        {
            let mut ram = BackupRam::map_file(&path).unwrap();
            ram.write_byte(0x0018_0001, 0x77);
            ram.flush().unwrap();
        }

        let ram = BackupRam::map_file(&path).unwrap();
        assert_eq!(ram.read_byte(0x0018_0001), 0x77);
        assert!(ram.is_file_backed());

        std::fs::remove_file(&path).ok();
    }
}
