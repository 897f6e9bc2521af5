//! The Saturn system: every component wired to the scheduler and stepped one frame at a time

use crate::api::{SaturnError, SaturnConfig};
use crate::backupram::BackupRam;
use crate::bus::{BiosRom, InterruptState, SaturnBus, WhichCpu, WorkRam};
use crate::cdblock::CdBlock;
use crate::disc::{AreaCode, Disc};
use crate::scheduler::{EventKind, Scheduler};
use crate::scsp::Scsp;
use crate::smpc::{PeripheralPorts, Smpc};
use crate::vdp::{RenderThread, Vdp};
use crate::{BIOS_LEN, SH2_CLOCK_NTSC, SH2_CLOCK_PAL};
use bincode::{Decode, Encode};
use brimir_common::boxedarray::Transient;
use brimir_common::frontend::{Color, FrameSize, TimingMode};
use sh2_emu::jit::Sh2Jit;
use sh2_emu::Sh2;

// VBlank-IN comes in through the SCU at the highest level
const VBLANK_INTERRUPT_LEVEL: u8 = 15;

// Widening applied around invalidated writes so blocks that span the written bytes are
// dropped too (2 bytes per instruction times the analyzer's block length cap)
const INVALIDATE_WINDOW: u32 = 2 * 100;

pub type SampleCallback = Box<dyn FnMut(i16, i16) + Send>;

#[derive(Encode, Decode)]
pub struct Saturn {
    timing_mode: TimingMode,
    sh2_master: Sh2,
    sh2_slave: Sh2,
    slave_enabled: bool,
    scheduler: Scheduler,
    bios: BiosRom,
    bios_loaded: bool,
    wram_low: WorkRam,
    wram_high: WorkRam,
    pub vdp: Vdp,
    pub scsp: Scsp,
    pub smpc: Smpc,
    pub cd_block: CdBlock,
    pub backup_ram: BackupRam,
    interrupts: InterruptState,
    frame_count: u64,
    /// Scheduler cycle up to which the CPUs have executed
    cpu_synced_to: u64,
    audio_chain_started: bool,
    cd_chain_started: bool,

    // Runtime-only state, rebuilt after save state loads.
    // The two cores are identical, and each gets its own block dispatcher: they run
    // different code, and separate caches keep one core's invalidations from costing the
    // other its hot blocks (bus writes still invalidate both)
    jit_master: Transient<Sh2Jit>,
    jit_slave: Transient<Sh2Jit>,
    pub ports: Transient<PeripheralPorts>,
    sample_callback: Transient<Option<SampleCallback>>,
    render_thread: Transient<Option<RenderThread>>,
    code_writes: Transient<Vec<(u32, u32)>>,
    frame_out: Transient<Vec<Color>>,
    frame_size: Transient<Option<FrameSize>>,
}

impl Saturn {
    #[must_use]
    pub fn new(config: &SaturnConfig) -> Self {
        let mut saturn = Self {
            timing_mode: config.timing_mode,
            sh2_master: Sh2::new("Master".into()),
            sh2_slave: Sh2::new("Slave".into()),
            slave_enabled: false,
            scheduler: Scheduler::new(),
            bios: BiosRom::new(),
            bios_loaded: false,
            wram_low: WorkRam::new(),
            wram_high: WorkRam::new(),
            vdp: Vdp::new(config.timing_mode),
            scsp: Scsp::new(),
            smpc: Smpc::new(),
            cd_block: CdBlock::new(),
            backup_ram: BackupRam::in_memory(),
            interrupts: InterruptState::default(),
            frame_count: 0,
            cpu_synced_to: 0,
            audio_chain_started: false,
            cd_chain_started: false,
            jit_master: Transient(Sh2Jit::new()),
            jit_slave: Transient(Sh2Jit::new()),
            ports: Transient(PeripheralPorts::default()),
            sample_callback: Transient(None),
            render_thread: Transient(None),
            code_writes: Transient(Vec::new()),
            frame_out: Transient(Vec::new()),
            frame_size: Transient(None),
        };
        saturn.apply_config(config);
        saturn
    }

    pub fn apply_config(&mut self, config: &SaturnConfig) {
        self.scsp.set_interpolation(config.audio_interpolation);
        self.cd_block.set_read_speed(config.cd_read_speed);
        self.set_threaded_rendering(config.threaded_rendering);
    }

    #[must_use]
    pub fn timing_mode(&self) -> TimingMode {
        self.timing_mode
    }

    pub fn set_timing_mode(&mut self, timing_mode: TimingMode) {
        self.timing_mode = timing_mode;
    }

    fn sh2_clock(&self) -> u64 {
        match self.timing_mode {
            TimingMode::Ntsc => SH2_CLOCK_NTSC,
            TimingMode::Pal => SH2_CLOCK_PAL,
        }
    }

    fn cycles_per_frame(&self) -> u64 {
        match self.timing_mode {
            TimingMode::Ntsc => self.sh2_clock() / 60,
            TimingMode::Pal => self.sh2_clock() / 50,
        }
    }

    pub fn set_sample_callback(&mut self, callback: SampleCallback) {
        self.sample_callback.0 = Some(callback);
    }

    /// Clear the compiled-opcode allowlist both dispatchers may use. The orchestrator
    /// feeds this from the validation suite at startup and again after save state loads.
    pub fn set_jit_verified_opcodes(&mut self, indices: impl IntoIterator<Item = usize>) {
        let indices: Vec<usize> = indices.into_iter().collect();
        self.jit_master.set_verified_opcodes(indices.iter().copied());
        self.jit_slave.set_verified_opcodes(indices);
    }

    /// Enable or disable the threaded renderer. Disabling joins the worker and is a
    /// prerequisite for unloading a game.
    pub fn set_threaded_rendering(&mut self, enabled: bool) {
        match (enabled, self.render_thread.0.take()) {
            (true, None) => self.render_thread.0 = Some(RenderThread::spawn()),
            (true, Some(thread)) => self.render_thread.0 = Some(thread),
            (false, Some(thread)) => thread.join(),
            (false, None) => {}
        }
    }

    #[must_use]
    pub fn threaded_rendering(&self) -> bool {
        self.render_thread.0.is_some()
    }

    /// Load the IPL (BIOS) image; anything other than exactly 512 KiB is rejected.
    pub fn load_ipl(&mut self, data: &[u8]) -> Result<(), SaturnError> {
        if data.len() != BIOS_LEN {
            return Err(SaturnError::InvalidBiosLength { length: data.len() });
        }
        self.bios.copy_from_slice(data);
        self.bios_loaded = true;
        Ok(())
    }

    #[must_use]
    pub fn bios_loaded(&self) -> bool {
        self.bios_loaded
    }

    pub fn load_disc(&mut self, disc: Disc) {
        self.cd_block.insert_disc(disc);
    }

    pub fn eject_disc(&mut self) {
        self.cd_block.eject_disc();
    }

    pub fn close_tray(&mut self) {
        self.cd_block.close_tray();
    }

    /// Pick the console area code from the disc header's compatibility mask.
    pub fn autodetect_region(&mut self, area_code: AreaCode) {
        let selected = [
            AreaCode::NORTH_AMERICA,
            AreaCode::EUROPE_PAL,
            AreaCode::JAPAN,
            AreaCode::ASIA_NTSC,
            AreaCode::ASIA_PAL,
        ]
        .into_iter()
        .find(|&candidate| area_code.contains(candidate));

        if let Some(selected) = selected {
            self.smpc.persistent.area_code = selected.0;
            let timing = if selected == AreaCode::EUROPE_PAL || selected == AreaCode::ASIA_PAL {
                TimingMode::Pal
            } else {
                TimingMode::Ntsc
            };
            self.timing_mode = timing;
            log::info!("Autodetected region {selected:?}, timing mode {timing:?}");
        }
    }

    /// Soft reset: both CPUs restart from the reset vectors, compiled blocks are dropped,
    /// memory and device state survive.
    pub fn reset(&mut self) {
        self.sh2_master = Sh2::new("Master".into());
        self.sh2_slave = Sh2::new("Slave".into());
        self.slave_enabled = false;
        self.jit_master.clear();
        self.jit_slave.clear();
        self.interrupts = InterruptState::default();
    }

    #[must_use]
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// The last completed frame. Valid until the next `run_frame` call.
    #[must_use]
    pub fn frame(&self) -> (&[Color], Option<FrameSize>) {
        (&self.frame_out.0, self.frame_size.0)
    }

    /// Run exactly one frame: CPUs, VDP, SCSP, SMPC, and the CD block step under the
    /// scheduler until VBlank.
    pub fn run_frame(&mut self) -> Result<(), SaturnError> {
        if !self.bios_loaded {
            return Err(SaturnError::BiosNotLoaded);
        }

        let frame_start = self.scheduler.current_cycle();
        let frame_end = frame_start + self.cycles_per_frame();
        let total_lines = u64::from(self.timing_mode.scanlines_per_frame());
        let cycles_per_line = self.cycles_per_frame() / total_lines;

        self.slave_enabled = self.smpc.slave_sh2_on;

        let threaded = self.render_thread.0.is_some();
        if !threaded {
            self.vdp.begin_frame();
        }

        // Frame-shaped events: one HBlank per line, VBlank at the end
        for line in 0..total_lines {
            self.scheduler
                .schedule_at(
                    frame_start + (line + 1) * cycles_per_line,
                    EventKind::HBlank,
                    line as u32,
                )
                .map_err(|e| SaturnError::Scheduler(e.to_string()))?;
        }
        self.scheduler
            .schedule_at(frame_end, EventKind::VBlank, 0)
            .map_err(|e| SaturnError::Scheduler(e.to_string()))?;

        // Free-running chains survive across frames once primed
        if !self.audio_chain_started {
            self.audio_chain_started = true;
            let interval = self.sh2_clock() / u64::from(crate::AUDIO_SAMPLE_RATE);
            self.scheduler.schedule_in(interval, EventKind::ScspSample, 0);
        }
        if !self.cd_chain_started {
            self.cd_chain_started = true;
            let interval = self.cd_block.drive_cycle_interval(self.sh2_clock());
            self.scheduler.schedule_in(interval, EventKind::CdDrive, 0);
        }

        let visible_height = u64::from(self.vdp.frame_size().height);

        loop {
            let Some(event) = self.scheduler.pop_due(frame_end) else {
                self.run_cpus_until(frame_end);
                self.scheduler.advance_by(frame_end - self.scheduler.current_cycle());
                break;
            };

            self.run_cpus_until(event.cycle);

            match event.kind {
                EventKind::HBlank => {
                    let line = u64::from(event.payload);
                    if !threaded {
                        self.vdp.render_scanline(event.payload);
                    }
                    // VBlank-IN pulses at the bottom of the visible area and clears on the
                    // following line
                    if line == visible_height {
                        self.interrupts.master_level = VBLANK_INTERRUPT_LEVEL;
                    } else {
                        self.interrupts.master_level = 0;
                    }
                }
                EventKind::ScspSample => {
                    let callback = &mut self.sample_callback.0;
                    self.scsp.tick_sample(|l, r| {
                        if let Some(callback) = callback.as_mut() {
                            callback(l, r);
                        }
                    });
                    let interval = self.sh2_clock() / u64::from(crate::AUDIO_SAMPLE_RATE);
                    self.scheduler.schedule_in(interval, EventKind::ScspSample, 0);
                }
                EventKind::CdDrive => {
                    self.cd_block.tick_drive();
                    let interval = self.cd_block.drive_cycle_interval(self.sh2_clock());
                    self.scheduler.schedule_in(interval, EventKind::CdDrive, 0);
                }
                EventKind::SmpcCommand => {
                    let ports = &mut self.ports.0;
                    self.smpc.execute_intback(ports);
                }
                EventKind::VBlank => {
                    break;
                }
            }
        }

        // SMPC peripheral polling happens once per frame, after VBlank, which is where the
        // BIOS expects fresh INTBACK data
        self.smpc.execute_intback(&mut self.ports.0);

        self.finish_frame(threaded);
        self.frame_count += 1;
        Ok(())
    }

    fn finish_frame(&mut self, threaded: bool) {
        if threaded {
            let snapshot = self.vdp.snapshot();
            let rendered = self
                .render_thread
                .0
                .as_ref()
                .and_then(|thread| thread.render(snapshot));

            match rendered {
                Some((frame, size)) => {
                    self.frame_out.0 = frame;
                    self.frame_size.0 = Some(size);
                    return;
                }
                None => {
                    log::error!("VDP render thread died; falling back to inline rendering");
                    self.render_thread.0 = None;
                    self.vdp.render_full_frame();
                }
            }
        }

        self.vdp.copy_frame_into(&mut self.frame_out.0);
        self.frame_size.0 = Some(self.vdp.frame_size());
    }

    /// Step both CPUs up to the given scheduler cycle, JIT blocks first with interpreter
    /// fallback, applying any code invalidations the bus recorded.
    fn run_cpus_until(&mut self, cycle: u64) {
        let budget = cycle.saturating_sub(self.cpu_synced_to);
        if budget == 0 {
            return;
        }
        self.cpu_synced_to = cycle;

        let master_target = self.sh2_master.cycle_count() + budget;
        while self.sh2_master.cycle_count() < master_target {
            let mut bus = SaturnBus {
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
                code_writes: &mut self.code_writes.0,
            };

            if !self.jit_master.run(&mut self.sh2_master, &mut bus) {
                self.sh2_master.execute(8, &mut bus);
            }

            self.apply_code_invalidations();
        }

        if self.slave_enabled {
            let slave_target = self.sh2_slave.cycle_count() + budget;
            while self.sh2_slave.cycle_count() < slave_target {
                let mut bus = SaturnBus {
                    which: WhichCpu::Slave,
                    bios: &self.bios,
                    wram_low: &mut self.wram_low,
                    wram_high: &mut self.wram_high,
                    vdp: &mut self.vdp,
                    scsp: &mut self.scsp,
                    smpc: &mut self.smpc,
                    cd_block: &mut self.cd_block,
                    backup_ram: &mut self.backup_ram,
                    interrupts: &self.interrupts,
                    code_writes: &mut self.code_writes.0,
                };
                if !self.jit_slave.run(&mut self.sh2_slave, &mut bus) {
                    self.sh2_slave.execute(8, &mut bus);
                }
                self.apply_code_invalidations();
            }
        }
    }

    /// Writes from either CPU (or DMA through the bus) drop covering blocks from both
    /// dispatchers; the cores share the address space.
    fn apply_code_invalidations(&mut self) {
        if self.code_writes.0.is_empty() {
            return;
        }
        for (start, end) in self.code_writes.0.drain(..) {
            let start = start.saturating_sub(INVALIDATE_WINDOW);
            let end = end + INVALIDATE_WINDOW;
            self.jit_master.0.invalidate(start, end);
            self.jit_slave.0.invalidate(start, end);
        }
    }

    /// Serialize the full machine state.
    pub fn save_state(&self, out: &mut Vec<u8>) -> Result<(), SaturnError> {
        *out = bincode::encode_to_vec(self, crate::api::state_config())
            .map_err(|source| SaturnError::StateEncode(source.to_string()))?;
        Ok(())
    }

    /// Replace the machine state from a serialized image. ROM identity is deliberately not
    /// checked so states carry across BIOS variants; runtime resources (JIT cache, render
    /// thread, callbacks) must be reattached by the caller.
    pub fn load_state(&mut self, data: &[u8]) -> Result<(), SaturnError> {
        let (loaded, _): (Self, usize) =
            bincode::decode_from_slice(data, crate::api::state_config())
                .map_err(|source| SaturnError::StateDecode(source.to_string()))?;
        *self = loaded;
        Ok(())
    }
}

impl Drop for Saturn {
    fn drop(&mut self) {
        if let Some(thread) = self.render_thread.0.take() {
            thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::SaturnConfig;

    fn test_bios() -> Vec<u8> {
        let mut bios = vec![0; BIOS_LEN];
        // Reset vector: PC = 0x00000800 (inside the BIOS image), SP = 0x06004000
        bios[0..4].copy_from_slice(&0x0000_0800_u32.to_be_bytes());
        bios[4..8].copy_from_slice(&0x0600_4000_u32.to_be_bytes());
        // An endless BRA-to-self loop with a NOP delay slot
        bios[0x800..0x802].copy_from_slice(&0xAFFE_u16.to_be_bytes());
        bios[0x802..0x804].copy_from_slice(&0x0009_u16.to_be_bytes());
        bios
    }

    #[test]
    fn run_frame_requires_a_bios() {
        let mut saturn = Saturn::new(&SaturnConfig::default());
        assert!(matches!(saturn.run_frame(), Err(SaturnError::BiosNotLoaded)));
    }

    #[test]
    fn bios_length_is_validated() {
        let mut saturn = Saturn::new(&SaturnConfig::default());
        assert!(matches!(
            saturn.load_ipl(&[0; 100]),
            Err(SaturnError::InvalidBiosLength { length: 100 })
        ));
        assert!(saturn.load_ipl(&test_bios()).is_ok());
    }

    #[test]
    fn one_frame_produces_video_and_audio() {
        let mut saturn = Saturn::new(&SaturnConfig { threaded_rendering: false, ..SaturnConfig::default() });
        saturn.load_ipl(&test_bios()).unwrap();

        let samples = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
        let counter = std::sync::Arc::clone(&samples);
        saturn.set_sample_callback(Box::new(move |_, _| {
            counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }));

        saturn.run_frame().unwrap();

        let (frame, size) = saturn.frame();
        let size = size.unwrap();
        assert_eq!(frame.len(), (size.width * size.height) as usize);

        // One NTSC frame of 44.1 kHz audio is ~735 stereo pairs
        let pairs = samples.load(std::sync::atomic::Ordering::Relaxed);
        assert!((700..=770).contains(&pairs), "{pairs} samples in one frame");
        assert_eq!(u64::from(pairs), u64::from(saturn.scsp.take_frame_sample_count()));
    }

    #[test]
    fn save_state_round_trips_cpu_state() {
        let mut saturn = Saturn::new(&SaturnConfig { threaded_rendering: false, ..SaturnConfig::default() });
        saturn.load_ipl(&test_bios()).unwrap();
        saturn.run_frame().unwrap();

        let mut state = Vec::new();
        saturn.save_state(&mut state).unwrap();
        let cycle_at_save = saturn.scheduler.current_cycle();
        let frame_at_save = saturn.frame_count();

        saturn.run_frame().unwrap();
        assert_ne!(saturn.frame_count(), frame_at_save);

        saturn.load_state(&state).unwrap();
        assert_eq!(saturn.scheduler.current_cycle(), cycle_at_save);
        assert_eq!(saturn.frame_count(), frame_at_save);

        // A second image of the restored state is byte-identical
        let mut second = Vec::new();
        saturn.save_state(&mut second).unwrap();
        assert_eq!(state, second);
    }

    #[test]
    fn reset_restarts_the_cpus_but_keeps_memory() {
        let mut saturn = Saturn::new(&SaturnConfig { threaded_rendering: false, ..SaturnConfig::default() });
        saturn.load_ipl(&test_bios()).unwrap();
        saturn.run_frame().unwrap();

        saturn.wram_high[0] = 0x42;
        saturn.reset();
        assert_eq!(saturn.wram_high[0], 0x42);
        assert!(saturn.run_frame().is_ok());
    }
}
