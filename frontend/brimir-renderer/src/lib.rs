//! Offscreen GPU post-processing for the software-rendered Saturn frame
//!
//! The hybrid pipeline: the native-resolution frame is uploaded into a BGRA8 texture (the
//! little-endian alias of the XRGB8888 data, so no per-pixel conversion), a fullscreen pass
//! upscales it with the selected filter and applies scanlines/brightness/gamma, an optional
//! second pass runs FXAA or RCAS sharpening, and the result is copied into a mappable
//! staging buffer for CPU readback.

pub mod config;
mod renderer;

pub use renderer::{AcceleratedRenderer, GpuFrame, RendererCapabilities, RendererError};
