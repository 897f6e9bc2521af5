//! Disc session model and the loader seam
//!
//! Container parsing (.cue/.iso/.chd/...) is an external concern: anything that can produce
//! a session list with a readable first-session header satisfies [`DiscLoader`]. The core
//! only consumes the header metadata and hands sector access to the CD block.

use bincode::{Decode, Encode};
use std::fmt::{self, Display, Formatter};
use std::path::Path;

pub const SECTOR_LEN: usize = 2352;

/// Disc compatibility area codes; a header may advertise several.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Encode, Decode)]
pub struct AreaCode(pub u8);

impl AreaCode {
    pub const JAPAN: Self = Self(1 << 0);
    pub const ASIA_NTSC: Self = Self(1 << 1);
    pub const NORTH_AMERICA: Self = Self(1 << 2);
    pub const EUROPE_PAL: Self = Self(1 << 3);
    pub const ASIA_PAL: Self = Self(1 << 4);

    #[must_use]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    #[must_use]
    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl Display for AreaCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut any = false;
        for (code, letter) in [
            (Self::JAPAN, 'J'),
            (Self::NORTH_AMERICA, 'U'),
            (Self::EUROPE_PAL, 'E'),
            (Self::ASIA_PAL, 'A'),
            (Self::ASIA_NTSC, 'T'),
        ] {
            if self.contains(code) {
                write!(f, "{letter}")?;
                any = true;
            }
        }
        if !any {
            write!(f, "?")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Encode, Decode)]
pub struct DiscHeader {
    pub game_title: String,
    pub product_number: String,
    pub area_code: AreaCode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub enum TrackKind {
    Data,
    Audio,
}

#[derive(Debug, Clone, Encode, Decode)]
pub struct Track {
    pub kind: TrackKind,
    pub start_frame: u32,
    pub frame_count: u32,
}

#[derive(Debug, Clone, Default, Encode, Decode)]
pub struct Session {
    pub tracks: Vec<Track>,
}

/// A loaded disc: session list plus the first session's header.
#[derive(Debug, Clone, Default, Encode, Decode)]
pub struct Disc {
    pub header: DiscHeader,
    pub sessions: Vec<Session>,
    /// Raw sector payload, indexed by absolute frame. In-memory because concrete container
    /// formats live behind the loader seam.
    pub sector_data: Vec<u8>,
}

impl Disc {
    #[must_use]
    pub fn read_sector(&self, frame: u32) -> Option<&[u8]> {
        let start = (frame as usize) * SECTOR_LEN;
        self.sector_data.get(start..start + SECTOR_LEN)
    }
}

/// Message severity for loader diagnostics captured by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderMessageType {
    Info,
    Warning,
    Error,
}

/// The external disc-parsing service.
pub trait DiscLoader {
    /// Parse the image at `path` into a [`Disc`]. Diagnostics go through `message`; error
    /// messages end up in the orchestrator's `last_error`.
    fn load(
        &mut self,
        path: &Path,
        message: &mut dyn FnMut(LoaderMessageType, String),
    ) -> Option<Disc>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn area_codes_format_as_region_letters() {
        let combined = AreaCode::JAPAN.union(AreaCode::NORTH_AMERICA).union(AreaCode::EUROPE_PAL);
        assert_eq!(combined.to_string(), "JUE");
        assert_eq!(AreaCode::default().to_string(), "?");
    }

    #[test]
    fn sector_reads_are_bounds_checked() {
        let disc = Disc {
            sector_data: vec![0xAA; SECTOR_LEN * 2],
            ..Disc::default()
        };

        assert!(disc.read_sector(1).is_some());
        assert!(disc.read_sector(2).is_none());
    }
}
