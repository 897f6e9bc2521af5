//! Optional background render thread
//!
//! The main thread hands over a register/VRAM snapshot at VBlank and blocks on the finished
//! frame, so the framebuffer contract (fully written before `run_frame` returns) holds in
//! both threaded and inline modes. Disabling the thread drops the channel and joins the
//! worker.

use super::RenderSnapshot;
use brimir_common::frontend::{Color, FrameSize};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};

pub struct RenderThread {
    snapshot_tx: Sender<RenderSnapshot>,
    frame_rx: Receiver<(Vec<Color>, FrameSize)>,
    handle: JoinHandle<()>,
}

impl RenderThread {
    #[must_use]
    #[allow(clippy::missing_panics_doc)]
    pub fn spawn() -> Self {
        let (snapshot_tx, snapshot_rx) = mpsc::channel::<RenderSnapshot>();
        let (frame_tx, frame_rx) = mpsc::channel();

        let handle = thread::Builder::new()
            .name("vdp-render".into())
            .spawn(move || {
                while let Ok(snapshot) = snapshot_rx.recv() {
                    if frame_tx.send(snapshot.render()).is_err() {
                        break;
                    }
                }
            })
            .expect("failed to spawn the VDP render thread");

        Self { snapshot_tx, frame_rx, handle }
    }

    /// Render one frame on the worker, blocking until it completes.
    ///
    /// Falls back to `None` if the worker died; the caller renders inline in that case.
    pub fn render(&self, snapshot: RenderSnapshot) -> Option<(Vec<Color>, FrameSize)> {
        if self.snapshot_tx.send(snapshot).is_err() {
            return None;
        }
        self.frame_rx.recv().ok()
    }

    /// Shut the worker down, waiting for any in-flight frame to finish.
    pub fn join(self) {
        drop(self.snapshot_tx);
        drop(self.frame_rx);
        if let Err(panic) = self.handle.join() {
            log::error!("VDP render thread panicked: {panic:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::Vdp;
    use super::*;
    use brimir_common::frontend::TimingMode;

    #[test]
    fn threaded_render_produces_a_full_frame() {
        let mut vdp = Vdp::new(TimingMode::Ntsc);
        vdp.vdp2_regs.tvmd = 0x8000;

        let thread = RenderThread::spawn();
        let (frame, size) = thread.render(vdp.snapshot()).unwrap();

        assert_eq!(size, FrameSize { width: 320, height: 224 });
        assert_eq!(frame.len(), 320 * 224);

        thread.join();
    }

    #[test]
    fn join_after_multiple_frames_is_clean() {
        let vdp = Vdp::new(TimingMode::Ntsc);
        let thread = RenderThread::spawn();

        for _ in 0..3 {
            assert!(thread.render(vdp.snapshot()).is_some());
        }
        thread.join();
    }
}
