//! Configuration, error types, and the save-state serialization profile

use crate::scsp::InterpolationMode;
use brimir_common::frontend::TimingMode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SaturnError {
    #[error("BIOS image must be {} bytes, was {length} bytes", crate::BIOS_LEN)]
    InvalidBiosLength { length: usize },
    #[error("no BIOS image has been loaded")]
    BiosNotLoaded,
    #[error("scheduler error: {0}")]
    Scheduler(String),
    #[error("failed to serialize state: {0}")]
    StateEncode(String),
    #[error("failed to deserialize state: {0}")]
    StateDecode(String),
    #[error("backup RAM file error: {0}")]
    BackupRam(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy)]
pub struct SaturnConfig {
    pub timing_mode: TimingMode,
    pub audio_interpolation: InterpolationMode,
    pub cd_read_speed: u8,
    pub autodetect_region: bool,
    pub threaded_rendering: bool,
}

impl Default for SaturnConfig {
    fn default() -> Self {
        Self {
            timing_mode: TimingMode::Ntsc,
            audio_interpolation: InterpolationMode::default(),
            cd_read_speed: crate::cdblock::DEFAULT_READ_SPEED,
            autodetect_region: true,
            threaded_rendering: true,
        }
    }
}

/// Serialization profile shared by save states and persistent files. The decode limit
/// bounds hostile state images.
#[must_use]
pub fn state_config() -> impl bincode::config::Config {
    bincode::config::standard()
        .with_little_endian()
        .with_fixed_int_encoding()
        .with_limit::<{ 64 * 1024 * 1024 }>()
}
