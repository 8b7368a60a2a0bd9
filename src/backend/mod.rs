//! Platform backend interfaces.
//!
//! A backend renders frames for the scene ([`FrameBackend`]), imports client
//! buffers ([`TextureImporter`]) and optionally provides fences for explicit
//! synchronization ([`FenceBackend`]).

use std::time::Duration;

use cgmath::Matrix4;
use thiserror::Error;
use tracing::{info, warn};

use crate::buffer::{TextureId, TextureImporter};
use crate::geometry::{Region, Size};
use crate::output::OutputInfo;
use crate::sync::FenceBackend;

pub mod headless;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// The backend knows the age of its back buffers and repaints precisely.
    pub buffer_age: bool,
    pub surfaceless_context: bool,
    /// The backend reports buffer swaps itself; no software pacing needed.
    pub swap_event: bool,
    pub direct_rendering: bool,
    /// Clearing a set of rectangles is cheaper than clearing the whole output.
    pub clipped_clear: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphicsResetStatus {
    NoError,
    Guilty,
    Innocent,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Filter {
    Nearest,
    Linear,
    Lanczos,
}

/// One textured draw: a triangle list with interleaved `[x, y, u, v]` vertices.
#[derive(Debug, Clone, PartialEq)]
pub struct DrawCall {
    pub texture: TextureId,
    pub vertices: Vec<f32>,
    pub transform: Matrix4<f32>,
    /// Premultiplied colour the texture is multiplied with.
    pub modulation: [f32; 4],
    pub saturation: f32,
    pub blend: bool,
    pub filter: Filter,
    pub shader: Option<u32>,
}

impl DrawCall {
    pub fn vertex_count(&self) -> usize {
        self.vertices.len() / 4
    }
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend `{0}` is not available in this build")]
    Unavailable(String),
    #[error("failed to create a rendering context: {0}")]
    Context(String),
    #[error("OpenGL {major}.{minor} is too old, 2.0 is required")]
    UnsupportedGlVersion { major: u32, minor: u32 },
    #[error("output size {requested:?} exceeds the viewport limit {limit:?}")]
    ViewportTooLarge { requested: Size, limit: Size },
}

pub trait FrameBackend {
    fn name(&self) -> &str;
    fn capabilities(&self) -> Capabilities;
    fn gl_version(&self) -> (u32, u32);
    fn max_viewport_size(&self) -> Size;

    fn make_current(&mut self) -> bool;
    fn done_current(&mut self);

    /// Starts a frame; returns a region that must be repainted in addition to damage.
    fn prepare_rendering_frame(&mut self) -> Region {
        Region::new()
    }

    /// Starts painting one output; returns its extra repaint region.
    fn prepare_rendering_for_screen(&mut self, output: &OutputInfo) -> Region;

    /// Commits the output's frame. `valid` is the area holding correct
    /// content, `damaged` the area that changed.
    fn end_rendering_frame_for_screen(
        &mut self,
        output: &OutputInfo,
        valid: &Region,
        damaged: &Region,
    );

    /// GPU time of the last frame.
    fn render_time(&self) -> Duration;

    fn graphics_reset_status(&mut self) -> GraphicsResetStatus {
        GraphicsResetStatus::NoError
    }

    fn clear(&mut self, region: &Region, color: [f32; 4]);
    fn draw(&mut self, call: DrawCall);

    fn importer(&mut self) -> &mut dyn TextureImporter;

    fn fences(&mut self) -> Option<&mut dyn FenceBackend> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Headless,
}

impl BackendKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "headless" | "software" => Some(BackendKind::Headless),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            BackendKind::Headless => "headless",
        }
    }
}

/// Backends to try in order; a forced backend comes first.
pub fn candidates(forced: Option<&str>) -> Vec<BackendKind> {
    let mut list = Vec::new();
    if let Some(name) = forced {
        match BackendKind::from_name(name) {
            Some(kind) => list.push(kind),
            None => warn!("Unknown compositing backend `{name}`, using defaults"),
        }
    }
    for kind in [BackendKind::Headless] {
        if !list.contains(&kind) {
            list.push(kind);
        }
    }
    list
}

/// Creates the first backend whose construction succeeds.
pub fn select<T>(
    candidates: &[BackendKind],
    mut create: impl FnMut(BackendKind) -> Result<T, BackendError>,
) -> Result<T, BackendError> {
    let mut last_error = BackendError::Unavailable("none".into());
    for kind in candidates {
        match create(*kind) {
            Ok(backend) => {
                info!("Using the {} compositing backend", kind.name());
                return Ok(backend);
            }
            Err(err) => {
                warn!("Failed to create the {} backend: {err}", kind.name());
                last_error = err;
            }
        }
    }
    Err(last_error)
}
