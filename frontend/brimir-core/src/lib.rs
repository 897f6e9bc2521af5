//! Frame orchestrator: the core wrapper a frontend plugin layer sits on
//!
//! Owns the Saturn hardware graph, the renderer selection, the audio ring, per-port input
//! state, and the persistent save channels (per-game backup RAM, system-wide SMPC data).
//! The lifecycle is a strict state machine: Uninitialized -> Initialized <-> GameLoaded.
//! Every recoverable failure is recorded in `last_error` rather than lost.

pub mod audio;
pub mod input;

use crate::audio::AudioRingBuffer;
use brimir_common::frontend::{Color, FrameSize};
use brimir_renderer::config::RendererConfig;
use brimir_renderer::{AcceleratedRenderer, RendererCapabilities};
use saturn_core::api::{SaturnConfig, SaturnError};
use saturn_core::backupram::BackupRam;
use saturn_core::disc::{DiscLoader, LoaderMessageType};
use saturn_core::scsp::InterpolationMode;
use saturn_core::system::Saturn;
use saturn_core::BACKUP_RAM_LEN;
use sh2_emu::jit::validator::{run_generated_suites, Validator};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Host SRAM view refresh interval, in frames.
const SRAM_SYNC_INTERVAL_FRAMES: u32 = 300;

/// System-wide SMPC persistent data file name.
pub const SMPC_FILE_NAME: &str = "brimir_saturn_rtc.smpc";

/// Known BIOS image names in preference order: JP 1.01, JP 1.00, the US/EU 1.01 and 1.00
/// sets, then the generic EU dump.
pub const BIOS_PREFERENCE: &[&str] = &[
    "sega_101.bin",
    "sega_100.bin",
    "mpr-17933.bin",
    "sega_100a.bin",
    "sega1003.bin",
    "saturn_bios_eu.bin",
];

/// Rank a BIOS file name against the preference list (lower is better).
#[must_use]
pub fn bios_preference_rank(file_name: &str) -> Option<usize> {
    let lowered = file_name.to_ascii_lowercase();
    BIOS_PREFERENCE.iter().position(|&known| known == lowered)
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("core is not initialized")]
    NotInitialized,
    #[error("operation requires a loaded game")]
    NoGameLoaded,
    #[error("game path does not exist: {0}")]
    GamePathMissing(PathBuf),
    #[error("disc loader produced no usable session list")]
    DiscLoadFailed,
    #[error(transparent)]
    Saturn(#[from] SaturnError),
    #[error("renderer error: {0}")]
    Renderer(#[from] brimir_renderer::RendererError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CoreState {
    Uninitialized,
    Initialized,
    GameLoaded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PixelFormat {
    #[default]
    Xrgb8888,
    Rgb565,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RendererSelection {
    #[default]
    Software,
    Accelerated,
}

enum RendererKind {
    Software,
    Accelerated(Box<AcceleratedRenderer>),
}

#[derive(Debug, Clone, Default)]
pub struct GameInfo {
    pub title: String,
    pub region: String,
}

pub struct SaturnCore {
    state: CoreState,
    saturn: Option<Saturn>,
    saturn_config: SaturnConfig,
    renderer: RendererKind,
    renderer_config: RendererConfig,

    audio: AudioRingBuffer,
    port_buttons: [Arc<AtomicU16>; 2],

    framebuffer: Vec<Color>,
    framebuffer_rgb565: Vec<u16>,
    frame_size: FrameSize,
    pixel_format: PixelFormat,

    /// Full-area display toggles; when false the customary overscan margin is cropped
    horizontal_overscan: bool,
    vertical_overscan: bool,

    sram_view: Vec<u8>,
    sram_first_load: bool,
    frames_since_sram_sync: u32,
    bup_path: Option<PathBuf>,
    smpc_path: Option<PathBuf>,

    jit_verified: Vec<usize>,
    game_info: Option<GameInfo>,
    last_error: Option<String>,
}

impl Default for SaturnCore {
    fn default() -> Self {
        Self::new()
    }
}

impl SaturnCore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: CoreState::Uninitialized,
            saturn: None,
            saturn_config: SaturnConfig::default(),
            renderer: RendererKind::Software,
            renderer_config: RendererConfig::default(),
            audio: AudioRingBuffer::new(),
            port_buttons: [Arc::new(AtomicU16::new(0)), Arc::new(AtomicU16::new(0))],
            framebuffer: Vec::new(),
            framebuffer_rgb565: Vec::new(),
            frame_size: FrameSize { width: 320, height: 224 },
            pixel_format: PixelFormat::default(),
            horizontal_overscan: true,
            vertical_overscan: true,
            sram_view: Vec::new(),
            sram_first_load: true,
            frames_since_sram_sync: 0,
            bup_path: None,
            smpc_path: None,
            jit_verified: Vec::new(),
            game_info: None,
            last_error: None,
        }
    }

    fn record_error(&mut self, message: impl Into<String>) {
        let message = message.into();
        log::error!("{message}");
        self.last_error = Some(message);
    }

    #[must_use]
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.state != CoreState::Uninitialized
    }

    #[must_use]
    pub fn is_game_loaded(&self) -> bool {
        self.state == CoreState::GameLoaded
    }

    /// Build the hardware graph, install the video/audio callbacks, connect controllers,
    /// and clear the JIT's compiled-opcode set against the validation suite. Idempotent;
    /// on failure all partial state is released.
    pub fn initialize(&mut self) -> Result<(), CoreError> {
        if self.state != CoreState::Uninitialized {
            return Ok(());
        }

        let mut saturn = Saturn::new(&self.saturn_config);

        // Audio producer into the ring
        let producer = self.audio.producer();
        saturn.set_sample_callback(Box::new(move |left, right| producer.push(left, right)));

        // Controller report callbacks pull the current per-port masks lazily during
        // SMPC polling; Saturn button logic is inverted (0 = pressed)
        for port in 0..2 {
            let buttons = Arc::clone(&self.port_buttons[port]);
            saturn.ports.set_report_callback(
                port,
                Box::new(move |report| {
                    report.buttons = input::translate_buttons(buttons.load(Ordering::Relaxed));
                }),
            );
        }

        // Only opcodes whose differential suite passes may reach compiled code
        let results = run_generated_suites(&Validator::new());
        if !results.all_passed() {
            self.record_error(format!(
                "JIT validation failed for {} of {} generated tests; affected opcodes stay on the interpreter",
                results.failed, results.total_tests
            ));
        }
        log::info!(
            "JIT validation: {}/{} tests passed, {} opcodes cleared for compilation",
            results.passed,
            results.total_tests,
            results.verified_spec_indices.len()
        );
        self.jit_verified = results.verified_spec_indices;
        saturn.set_jit_verified_opcodes(self.jit_verified.iter().copied());

        self.saturn = Some(saturn);
        self.state = CoreState::Initialized;
        Ok(())
    }

    /// Tear everything down (unloading first if needed).
    pub fn shutdown(&mut self) {
        if self.state == CoreState::GameLoaded {
            self.unload_game();
        }
        self.saturn = None;
        self.state = CoreState::Uninitialized;
    }

    fn saturn_mut(&mut self) -> Result<&mut Saturn, CoreError> {
        self.saturn.as_mut().ok_or(CoreError::NotInitialized)
    }

    /// Load the IPL image; exactly 512 KiB or nothing.
    pub fn load_bios(&mut self, data: &[u8]) -> Result<(), CoreError> {
        let result = self.saturn_mut()?.load_ipl(data);
        if let Err(error) = &result {
            self.record_error(error.to_string());
        }
        result.map_err(CoreError::from)
    }

    /// Load a game: validate the path, set up the backup RAM channels, run the disc
    /// loader, hand the disc to the hardware, and close the tray.
    pub fn load_game(
        &mut self,
        path: &Path,
        save_dir: &Path,
        system_dir: &Path,
        loader: &mut dyn DiscLoader,
    ) -> Result<(), CoreError> {
        if self.saturn.is_none() {
            return Err(CoreError::NotInitialized);
        }
        if !path.exists() {
            let error = CoreError::GamePathMissing(path.to_path_buf());
            self.record_error(error.to_string());
            return Err(error);
        }

        // Per-game backup RAM file; failure falls back to volatile memory, recorded
        let stem = path.file_stem().map_or_else(|| "game".into(), |s| s.to_string_lossy().into_owned());
        let bup_path = save_dir.join(format!("{stem}.bup"));
        match BackupRam::map_file(&bup_path) {
            Ok(backup_ram) => {
                self.saturn_mut()?.backup_ram = backup_ram;
                self.bup_path = Some(bup_path);
            }
            Err(error) => {
                self.record_error(format!(
                    "Failed to map backup RAM at {}: {error}; saves will not persist",
                    bup_path.display()
                ));
                self.bup_path = None;
            }
        }

        // System-wide SMPC persistent data (RTC); absence just means a first run
        let smpc_path = system_dir.join(SMPC_FILE_NAME);
        if smpc_path.exists() {
            if let Err(error) = self.saturn_mut()?.smpc.load_persistent_data(&smpc_path) {
                self.record_error(format!("Failed to load SMPC data: {error}"));
            }
        }
        self.smpc_path = Some(smpc_path);

        // Populate the host view once so the frontend sees the save contents immediately
        self.sram_view = self.saturn_mut()?.backup_ram.read_all();
        self.sram_first_load = true;
        self.frames_since_sram_sync = 0;

        // Hand parsing to the external loader, capturing its diagnostics
        let mut captured_errors = Vec::new();
        let disc = loader.load(path, &mut |message_type, message| {
            if message_type == LoaderMessageType::Error {
                captured_errors.push(message);
            }
        });

        let disc = match disc {
            Some(disc) if !disc.sessions.is_empty() => disc,
            _ => {
                let detail = if captured_errors.is_empty() {
                    "disc loader returned no sessions".to_string()
                } else {
                    captured_errors.join("; ")
                };
                self.record_error(detail);
                return Err(CoreError::DiscLoadFailed);
            }
        };

        self.game_info = Some(GameInfo {
            title: disc.header.game_title.clone(),
            region: disc.header.area_code.to_string(),
        });

        let autodetect = self.saturn_config.autodetect_region;
        let area_code = disc.header.area_code;
        {
            let saturn = self.saturn_mut()?;
            saturn.load_disc(disc);
            saturn.close_tray();
            // Threaded rendering may have been stopped by a previous unload
            saturn.set_threaded_rendering(true);
            if autodetect {
                saturn.autodetect_region(area_code);
            }
        }

        self.state = CoreState::GameLoaded;
        Ok(())
    }

    /// Unload in strict order: stop the render thread, persist SMPC data, take a final
    /// SRAM snapshot, eject the disc.
    pub fn unload_game(&mut self) {
        let Some(saturn) = self.saturn.as_mut() else {
            return;
        };

        saturn.set_threaded_rendering(false);

        if let Some(smpc_path) = &self.smpc_path {
            if let Err(error) = saturn.smpc.save_persistent_data(smpc_path) {
                self.last_error = Some(format!("Failed to save SMPC data: {error}"));
            }
        }

        self.sram_view = saturn.backup_ram.read_all();
        if let Err(error) = saturn.backup_ram.flush() {
            self.last_error = Some(format!("Failed to flush backup RAM: {error}"));
        }

        saturn.eject_disc();

        self.game_info = None;
        self.sram_first_load = true;
        self.frames_since_sram_sync = 0;
        self.state = CoreState::Initialized;
    }

    /// Run exactly one frame. Hardware failures are recorded and surfaced without tearing
    /// the emulator down; the frontend may retry or unload.
    pub fn run_frame(&mut self) -> Result<(), CoreError> {
        let result = {
            let saturn = self.saturn_mut()?;
            saturn.run_frame()
        };

        if let Err(error) = result {
            self.record_error(format!("run_frame failed: {error}"));
            return Err(error.into());
        }

        self.frames_since_sram_sync += 1;
        self.update_framebuffer()?;
        Ok(())
    }

    fn update_framebuffer(&mut self) -> Result<(), CoreError> {
        let saturn = self.saturn.as_mut().ok_or(CoreError::NotInitialized)?;
        let (full_frame, size) = saturn.frame();
        let Some(full_size) = size else {
            return Ok(());
        };

        let cropped;
        let (frame, size) = if self.horizontal_overscan && self.vertical_overscan {
            (full_frame, full_size)
        } else {
            let (buffer, size) = crop_overscan(
                full_frame,
                full_size,
                self.horizontal_overscan,
                self.vertical_overscan,
            );
            cropped = buffer;
            (cropped.as_slice(), size)
        };

        match &mut self.renderer {
            RendererKind::Software => {
                self.framebuffer.clear();
                self.framebuffer.extend_from_slice(frame);
                self.frame_size = size;
            }
            RendererKind::Accelerated(renderer) => match renderer.render(frame, size) {
                Ok(output) => {
                    self.framebuffer = output.pixels;
                    self.frame_size = output.size;
                }
                Err(error) => {
                    // Degrade to the software output for this frame
                    self.last_error = Some(format!("GPU renderer failed: {error}"));
                    self.framebuffer.clear();
                    self.framebuffer.extend_from_slice(frame);
                    self.frame_size = size;
                }
            },
        }

        if self.pixel_format == PixelFormat::Rgb565 {
            convert_to_rgb565(&self.framebuffer, &mut self.framebuffer_rgb565);
        }

        Ok(())
    }

    /// Soft reset.
    pub fn reset(&mut self) -> Result<(), CoreError> {
        self.saturn_mut()?.reset();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Video output
    // ------------------------------------------------------------------

    #[must_use]
    pub fn framebuffer(&self) -> &[u8] {
        match self.pixel_format {
            // Color is Pod with the exact B, G, R, X layout the XRGB8888 contract describes
            PixelFormat::Xrgb8888 => bytemuck::cast_slice(&self.framebuffer),
            PixelFormat::Rgb565 => bytemuck::cast_slice(&self.framebuffer_rgb565),
        }
    }

    #[must_use]
    pub fn framebuffer_width(&self) -> u32 {
        self.frame_size.width
    }

    #[must_use]
    pub fn framebuffer_height(&self) -> u32 {
        self.frame_size.height
    }

    #[must_use]
    pub fn framebuffer_pitch(&self) -> u32 {
        self.frame_size.width * self.bytes_per_pixel()
    }

    fn bytes_per_pixel(&self) -> u32 {
        match self.pixel_format {
            PixelFormat::Xrgb8888 => 4,
            PixelFormat::Rgb565 => 2,
        }
    }

    #[must_use]
    pub fn pixel_format(&self) -> PixelFormat {
        self.pixel_format
    }

    pub fn set_pixel_format(&mut self, format: PixelFormat) {
        self.pixel_format = format;
    }

    // ------------------------------------------------------------------
    // Audio output
    // ------------------------------------------------------------------

    /// Drain up to `max_pairs` stereo pairs into `dst` (interleaved L, R).
    pub fn drain_audio(&mut self, dst: &mut [i16], max_pairs: usize) -> usize {
        self.audio.drain(dst, max_pairs)
    }

    // ------------------------------------------------------------------
    // Input
    // ------------------------------------------------------------------

    /// Store the raw frontend button mask for a port; takes effect at the next SMPC poll,
    /// which happens during the following frame at the earliest.
    pub fn set_controller_state(&mut self, port: usize, buttons: u16) {
        if let Some(state) = self.port_buttons.get(port) {
            state.store(buttons, Ordering::Relaxed);
        }
    }

    // ------------------------------------------------------------------
    // Backup RAM (SRAM) channels
    // ------------------------------------------------------------------

    #[must_use]
    pub fn sram_len(&self) -> usize {
        BACKUP_RAM_LEN
    }

    /// Host-visible SRAM view, lazily refreshed from the hardware-mapped file every
    /// `SRAM_SYNC_INTERVAL_FRAMES` frames or when the game wrote to it.
    pub fn sram_data(&mut self) -> &[u8] {
        if self.sram_view.len() != BACKUP_RAM_LEN {
            // First call before any game load: hand out an empty image the frontend can
            // fill in
            self.sram_view = vec![0; BACKUP_RAM_LEN];
            return &self.sram_view;
        }

        if self.state == CoreState::GameLoaded && !self.sram_first_load {
            if let Some(saturn) = self.saturn.as_mut() {
                let dirty = saturn.backup_ram.take_dirty();
                if dirty || self.frames_since_sram_sync >= SRAM_SYNC_INTERVAL_FRAMES {
                    self.sram_view = saturn.backup_ram.read_all();
                    self.frames_since_sram_sync = 0;
                }
            }
        }

        &self.sram_view
    }

    /// Write the frontend's SRAM image straight through to the hardware-mapped file, and
    /// enable automatic refreshes from here on.
    pub fn set_sram_data(&mut self, data: &[u8]) -> bool {
        let Some(saturn) = self.saturn.as_mut() else {
            return false;
        };

        if data.len() != BACKUP_RAM_LEN {
            self.record_error(format!(
                "SRAM size mismatch: expected {BACKUP_RAM_LEN} bytes, got {}",
                data.len()
            ));
            return false;
        }

        if !saturn.backup_ram.write_all(data) {
            return false;
        }
        // The write just came from the host; don't report it back as a hardware change
        saturn.backup_ram.take_dirty();
        if let Err(error) = saturn.backup_ram.flush() {
            self.record_error(format!("Failed to flush backup RAM: {error}"));
        }

        self.sram_view.clear();
        self.sram_view.extend_from_slice(data);
        self.sram_first_load = false;
        true
    }

    /// Force the host view to match the hardware-mapped file right now.
    pub fn refresh_sram_from_hardware(&mut self) {
        if let Some(saturn) = self.saturn.as_mut() {
            self.sram_view = saturn.backup_ram.read_all();
            self.frames_since_sram_sync = 0;
        }
    }

    // ------------------------------------------------------------------
    // Save states
    // ------------------------------------------------------------------

    pub fn save_state(&mut self, out: &mut Vec<u8>) -> Result<(), CoreError> {
        let result = self.saturn_mut()?.save_state(out);
        if let Err(error) = &result {
            self.record_error(error.to_string());
        }
        result.map_err(CoreError::from)
    }

    /// Valid only with a game loaded. ROM identity checks are skipped so states work
    /// across BIOS variants; runtime resources are reattached afterwards.
    pub fn load_state(&mut self, data: &[u8]) -> Result<(), CoreError> {
        if self.state != CoreState::GameLoaded {
            return Err(CoreError::NoGameLoaded);
        }

        let threaded = self.saturn_mut()?.threaded_rendering();
        let result = self.saturn_mut()?.load_state(data);
        if let Err(error) = &result {
            self.record_error(error.to_string());
            return result.map_err(CoreError::from);
        }

        // The deserialized machine has fresh transient state: reconnect everything that
        // lives outside the save image
        let producer = self.audio.producer();
        let jit_verified = self.jit_verified.clone();
        let bup_bytes = {
            let saturn = self.saturn_mut()?;
            saturn.set_sample_callback(Box::new(move |left, right| producer.push(left, right)));
            saturn.set_jit_verified_opcodes(jit_verified);
            saturn.set_threaded_rendering(threaded);
            saturn.backup_ram.read_all()
        };

        for port in 0..2 {
            let buttons = Arc::clone(&self.port_buttons[port]);
            self.saturn_mut()?.ports.set_report_callback(
                port,
                Box::new(move |report| {
                    report.buttons = input::translate_buttons(buttons.load(Ordering::Relaxed));
                }),
            );
        }

        // Re-attach the memory-mapped backup file, carrying the restored contents over
        if let Some(bup_path) = self.bup_path.clone() {
            match BackupRam::map_file(&bup_path) {
                Ok(mut backup_ram) => {
                    backup_ram.write_all(&bup_bytes);
                    backup_ram.take_dirty();
                    self.saturn_mut()?.backup_ram = backup_ram;
                }
                Err(error) => {
                    self.record_error(format!("Failed to remap backup RAM: {error}"));
                }
            }
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------

    pub fn set_audio_interpolation(&mut self, interpolation: InterpolationMode) {
        self.saturn_config.audio_interpolation = interpolation;
        if let Some(saturn) = self.saturn.as_mut() {
            saturn.apply_config(&self.saturn_config);
        }
    }

    pub fn set_cd_read_speed(&mut self, speed: u8) {
        self.saturn_config.cd_read_speed = speed.clamp(2, 200);
        if let Some(saturn) = self.saturn.as_mut() {
            saturn.apply_config(&self.saturn_config);
        }
    }

    pub fn set_autodetect_region(&mut self, enabled: bool) {
        self.saturn_config.autodetect_region = enabled;
    }

    /// Show the full horizontal area (true) or crop the overscan margin (false).
    pub fn set_horizontal_overscan(&mut self, enabled: bool) {
        self.horizontal_overscan = enabled;
    }

    /// Show the full vertical area (true) or crop the overscan margin (false).
    pub fn set_vertical_overscan(&mut self, enabled: bool) {
        self.vertical_overscan = enabled;
    }

    /// Output dimensions after overscan cropping; matches the next frame's framebuffer.
    #[must_use]
    pub fn visible_resolution(&self) -> FrameSize {
        self.frame_size
    }

    /// Select the output path. Switching to the accelerated renderer can fail (no adapter);
    /// the software path is always available and failure degrades to it.
    pub fn set_renderer(&mut self, selection: RendererSelection) {
        self.renderer = match selection {
            RendererSelection::Software => RendererKind::Software,
            RendererSelection::Accelerated => {
                match AcceleratedRenderer::new(self.renderer_config) {
                    Ok(renderer) => RendererKind::Accelerated(Box::new(renderer)),
                    Err(error) => {
                        self.record_error(format!(
                            "Accelerated renderer unavailable ({error}); using software output"
                        ));
                        RendererKind::Software
                    }
                }
            }
        };
    }

    #[must_use]
    pub fn active_renderer(&self) -> RendererSelection {
        match self.renderer {
            RendererKind::Software => RendererSelection::Software,
            RendererKind::Accelerated(_) => RendererSelection::Accelerated,
        }
    }

    /// Capabilities of the currently selected renderer.
    #[must_use]
    pub fn renderer_capabilities(&self) -> RendererCapabilities {
        match &self.renderer {
            RendererKind::Software => RendererCapabilities {
                internal_upscaling: false,
                anti_aliasing: false,
                texture_filtering: false,
                full_pipeline: false,
                max_texture_dimension: 0,
                max_internal_scale: 1,
            },
            RendererKind::Accelerated(renderer) => renderer.capabilities(),
        }
    }

    pub fn set_renderer_config(&mut self, config: RendererConfig) {
        self.renderer_config = config;
        if let RendererKind::Accelerated(renderer) = &mut self.renderer {
            renderer.reload_config(config);
        }
    }

    #[must_use]
    pub fn renderer_config(&self) -> RendererConfig {
        self.renderer_config
    }

    #[must_use]
    pub fn game_info(&self) -> Option<&GameInfo> {
        self.game_info.as_ref()
    }
}

impl Drop for SaturnCore {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// Pixels trimmed from each edge when overscan display is off, scaled up for the
// double-resolution modes
const OVERSCAN_MARGIN: u32 = 8;

fn crop_overscan(
    frame: &[Color],
    size: FrameSize,
    keep_horizontal: bool,
    keep_vertical: bool,
) -> (Vec<Color>, FrameSize) {
    let h_margin = if keep_horizontal { 0 } else { OVERSCAN_MARGIN * (size.width / 352).max(1) };
    let v_margin = if keep_vertical { 0 } else { OVERSCAN_MARGIN * (size.height / 240).max(1) };

    let cropped_size =
        FrameSize { width: size.width - 2 * h_margin, height: size.height - 2 * v_margin };

    let mut out = Vec::with_capacity(cropped_size.pixel_count());
    for row in v_margin..size.height - v_margin {
        let start = (row * size.width + h_margin) as usize;
        out.extend_from_slice(&frame[start..start + cropped_size.width as usize]);
    }

    (out, cropped_size)
}

/// XRGB8888 -> RGB565, four pixels at a time so the compiler can vectorize the body.
fn convert_to_rgb565(frame: &[Color], out: &mut Vec<u16>) {
    out.clear();
    out.reserve(frame.len());

    let mut chunks = frame.chunks_exact(4);
    for chunk in &mut chunks {
        out.extend_from_slice(&[
            chunk[0].to_rgb565(),
            chunk[1].to_rgb565(),
            chunk[2].to_rgb565(),
            chunk[3].to_rgb565(),
        ]);
    }
    for color in chunks.remainder() {
        out.push(color.to_rgb565());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rgb565_conversion_matches_the_packing_rules() {
        let frame =
            vec![Color::rgb(255, 0, 0), Color::rgb(0, 255, 0), Color::rgb(0, 0, 255), Color::BLACK, Color::rgb(255, 255, 255)];
        let mut out = Vec::new();
        convert_to_rgb565(&frame, &mut out);

        assert_eq!(out, vec![0xF800, 0x07E0, 0x001F, 0x0000, 0xFFFF]);
    }

    #[test]
    fn bios_preference_ranks_known_names() {
        assert_eq!(bios_preference_rank("sega_101.bin"), Some(0));
        assert_eq!(bios_preference_rank("SEGA_100.BIN"), Some(1));
        assert!(bios_preference_rank("unknown.bin").is_none());
        assert!(bios_preference_rank("sega_101.bin") < bios_preference_rank("mpr-17933.bin"));
    }
}
