//! Software backend that records frames instead of presenting them.

use std::collections::{HashSet, VecDeque};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::time::{Duration, Instant};

use drm_fourcc::DrmFourcc;
use tracing::{debug, trace};

use super::{Capabilities, DrawCall, FrameBackend, GraphicsResetStatus};
use crate::buffer::texture::is_shm_format_supported;
use crate::buffer::{Dmabuf, ImportError, ShmImage, Texture, TextureId, TextureImporter};
use crate::geometry::{Rectangle, Region, Size};
use crate::output::{OutputId, OutputInfo};
use crate::sync::{
    FenceBackend, FenceHandle, FenceStatus, RoundtripCookie, SyncError, WaitResult,
};

const MAX_VIEWPORT: Size = Size::new(16384, 16384);

const DMABUF_FORMATS: &[DrmFourcc] = &[
    DrmFourcc::Argb8888,
    DrmFourcc::Xrgb8888,
    DrmFourcc::Abgr8888,
    DrmFourcc::Xbgr8888,
    DrmFourcc::Argb2101010,
    DrmFourcc::Xrgb2101010,
];

/// Hands out texture names and counts uploads.
#[derive(Debug)]
pub struct HeadlessImporter {
    next_id: u64,
    release_tx: Sender<TextureId>,
    release_rx: Receiver<TextureId>,
    live: HashSet<TextureId>,
    pub full_uploads: usize,
    /// One entry per re-uploaded rectangle, buffer pixels.
    pub damage_uploads: Vec<Rectangle>,
}

impl Default for HeadlessImporter {
    fn default() -> Self {
        let (release_tx, release_rx) = channel();
        Self {
            next_id: 1,
            release_tx,
            release_rx,
            live: HashSet::new(),
            full_uploads: 0,
            damage_uploads: Vec::new(),
        }
    }
}

impl HeadlessImporter {
    pub fn live_textures(&self) -> usize {
        self.live.len()
    }

    fn allocate(&mut self, size: Size, format: DrmFourcc) -> Texture {
        let id = TextureId(self.next_id);
        self.next_id += 1;
        self.live.insert(id);
        Texture::owned(id, size, format, self.release_tx.clone())
    }
}

impl TextureImporter for HeadlessImporter {
    fn import_shm(&mut self, image: &ShmImage) -> Result<Texture, ImportError> {
        if image.size.is_empty() {
            return Err(ImportError::EmptyBuffer(image.size));
        }
        if !is_shm_format_supported(image.format) {
            return Err(ImportError::UnsupportedFormat(image.format));
        }
        self.full_uploads += 1;
        Ok(self.allocate(image.size, image.format))
    }

    fn update_shm(
        &mut self,
        texture: &mut Texture,
        image: &ShmImage,
        damage: &[Rectangle],
    ) -> Result<(), ImportError> {
        if !self.live.contains(&texture.id()) {
            return Err(ImportError::ContextLost);
        }
        trace!(texture = texture.id().0, rects = damage.len(), size = ?image.size, "sub-image upload");
        self.damage_uploads.extend_from_slice(damage);
        Ok(())
    }

    fn import_dmabuf(&mut self, dmabuf: &Dmabuf) -> Result<Texture, ImportError> {
        if dmabuf.size.is_empty() {
            return Err(ImportError::EmptyBuffer(dmabuf.size));
        }
        if !DMABUF_FORMATS.contains(&dmabuf.format) {
            return Err(ImportError::UnsupportedFormat(dmabuf.format));
        }
        Ok(self.allocate(dmabuf.size, dmabuf.format))
    }

    fn cleanup_texture_cache(&mut self) {
        while let Ok(id) = self.release_rx.try_recv() {
            self.live.remove(&id);
        }
    }
}

/// Fences that signal as soon as they are triggered, unless stalled.
#[derive(Debug, Default)]
pub struct HeadlessFences {
    next: u32,
    live: HashSet<u32>,
    signaled: HashSet<u32>,
    /// Triggered fences never signal while set.
    pub stalled: bool,
    pub triggers: usize,
    pub waits: usize,
}

impl HeadlessFences {
    pub fn live_fences(&self) -> usize {
        self.live.len()
    }
}

impl FenceBackend for HeadlessFences {
    fn create_fence(&mut self) -> Result<FenceHandle, SyncError> {
        self.next += 1;
        self.live.insert(self.next);
        Ok(FenceHandle(self.next))
    }

    fn trigger(&mut self, fence: FenceHandle) {
        self.triggers += 1;
        if !self.stalled {
            self.signaled.insert(fence.0);
        }
    }

    fn insert_wait(&mut self, _fence: FenceHandle) {
        self.waits += 1;
    }

    fn status(&mut self, fence: FenceHandle) -> FenceStatus {
        if self.signaled.contains(&fence.0) {
            FenceStatus::Signaled
        } else {
            FenceStatus::Unsignaled
        }
    }

    fn client_wait(&mut self, fence: FenceHandle, _timeout: Duration) -> WaitResult {
        match self.status(fence) {
            FenceStatus::Signaled => WaitResult::Signaled,
            FenceStatus::Unsignaled => WaitResult::TimedOut,
        }
    }

    fn reset(&mut self, fence: FenceHandle) -> RoundtripCookie {
        self.signaled.remove(&fence.0);
        RoundtripCookie(fence.0)
    }

    fn finish_roundtrip(&mut self, _cookie: RoundtripCookie) {}

    fn destroy_fence(&mut self, fence: FenceHandle) {
        self.live.remove(&fence.0);
        self.signaled.remove(&fence.0);
    }
}

/// Everything submitted for one output between prepare and end of a frame.
#[derive(Debug, Clone, Default)]
pub struct HeadlessFrame {
    pub output: OutputId,
    pub clears: Vec<Region>,
    pub draws: Vec<DrawCall>,
    pub valid: Region,
    pub damaged: Region,
}

#[derive(Debug)]
pub struct HeadlessBackend {
    capabilities: Capabilities,
    gl_version: (u32, u32),
    max_viewport: Size,
    importer: HeadlessImporter,
    fences: Option<HeadlessFences>,
    current: bool,
    context_lost: bool,
    frame_start: Option<Instant>,
    render_time: Duration,
    reset_status: VecDeque<GraphicsResetStatus>,
    extra_repaint: Region,
    pending: Option<HeadlessFrame>,
    frames: Vec<HeadlessFrame>,
}

impl Default for HeadlessBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessBackend {
    pub fn new() -> Self {
        Self {
            capabilities: Capabilities {
                buffer_age: true,
                surfaceless_context: true,
                swap_event: false,
                direct_rendering: true,
                clipped_clear: true,
            },
            gl_version: (3, 3),
            max_viewport: MAX_VIEWPORT,
            importer: HeadlessImporter::default(),
            fences: Some(HeadlessFences::default()),
            current: false,
            context_lost: false,
            frame_start: None,
            render_time: Duration::ZERO,
            reset_status: VecDeque::new(),
            extra_repaint: Region::new(),
            pending: None,
            frames: Vec::new(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_gl_version(mut self, major: u32, minor: u32) -> Self {
        self.gl_version = (major, minor);
        self
    }

    pub fn with_max_viewport(mut self, size: Size) -> Self {
        self.max_viewport = size;
        self
    }

    pub fn without_fences(mut self) -> Self {
        self.fences = None;
        self
    }

    /// Queues statuses returned by successive reset queries.
    pub fn schedule_reset(&mut self, statuses: impl IntoIterator<Item = GraphicsResetStatus>) {
        self.reset_status.extend(statuses);
    }

    /// While set, the rendering context cannot be made current.
    pub fn set_context_lost(&mut self, lost: bool) {
        self.context_lost = lost;
    }

    /// Region reported as needing repaint by the next frame preparation.
    pub fn set_extra_repaint(&mut self, region: Region) {
        self.extra_repaint = region;
    }

    pub fn frames(&self) -> &[HeadlessFrame] {
        &self.frames
    }

    pub fn last_frame(&self) -> Option<&HeadlessFrame> {
        self.frames.last()
    }

    /// Frame being recorded between prepare and end.
    pub fn pending_frame(&self) -> Option<&HeadlessFrame> {
        self.pending.as_ref()
    }

    pub fn take_frames(&mut self) -> Vec<HeadlessFrame> {
        std::mem::take(&mut self.frames)
    }

    pub fn headless_importer(&self) -> &HeadlessImporter {
        &self.importer
    }

    pub fn headless_fences(&mut self) -> Option<&mut HeadlessFences> {
        self.fences.as_mut()
    }

    pub fn is_current(&self) -> bool {
        self.current
    }
}

impl FrameBackend for HeadlessBackend {
    fn name(&self) -> &str {
        "headless"
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn gl_version(&self) -> (u32, u32) {
        self.gl_version
    }

    fn max_viewport_size(&self) -> Size {
        self.max_viewport
    }

    fn make_current(&mut self) -> bool {
        self.current = !self.context_lost;
        self.current
    }

    fn done_current(&mut self) {
        self.current = false;
    }

    fn prepare_rendering_frame(&mut self) -> Region {
        self.frame_start = Some(Instant::now());
        std::mem::take(&mut self.extra_repaint)
    }

    fn prepare_rendering_for_screen(&mut self, output: &OutputInfo) -> Region {
        if self.frame_start.is_none() {
            self.frame_start = Some(Instant::now());
        }
        self.pending = Some(HeadlessFrame {
            output: output.id,
            ..Default::default()
        });
        Region::new()
    }

    fn end_rendering_frame_for_screen(
        &mut self,
        output: &OutputInfo,
        valid: &Region,
        damaged: &Region,
    ) {
        let mut frame = self.pending.take().unwrap_or_else(|| HeadlessFrame {
            output: output.id,
            ..Default::default()
        });
        frame.valid = valid.clone();
        frame.damaged = damaged.clone();
        debug!(
            output = output.id,
            draws = frame.draws.len(),
            damaged = damaged.area(),
            "headless frame done"
        );
        self.frames.push(frame);
        self.render_time = self
            .frame_start
            .take()
            .map(|start| start.elapsed())
            .unwrap_or_default();
    }

    fn render_time(&self) -> Duration {
        self.render_time
    }

    fn graphics_reset_status(&mut self) -> GraphicsResetStatus {
        self.reset_status
            .pop_front()
            .unwrap_or(GraphicsResetStatus::NoError)
    }

    fn clear(&mut self, region: &Region, _color: [f32; 4]) {
        if let Some(frame) = self.pending.as_mut() {
            frame.clears.push(region.clone());
        }
    }

    fn draw(&mut self, call: DrawCall) {
        if let Some(frame) = self.pending.as_mut() {
            frame.draws.push(call);
        }
    }

    fn importer(&mut self) -> &mut dyn TextureImporter {
        &mut self.importer
    }

    fn fences(&mut self) -> Option<&mut dyn FenceBackend> {
        self.fences
            .as_mut()
            .map(|fences| fences as &mut dyn FenceBackend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_dropped_textures_are_freed_on_cleanup() {
        let mut importer = HeadlessImporter::default();
        let image = ShmImage {
            size: Size::new(2, 2),
            stride: 8,
            format: DrmFourcc::Xrgb8888,
            scale: 1,
            data: Arc::from(vec![0u8; 16]),
        };
        let texture = importer.import_shm(&image).unwrap();
        assert_eq!(importer.live_textures(), 1);
        drop(texture);
        assert_eq!(importer.live_textures(), 1);
        importer.cleanup_texture_cache();
        assert_eq!(importer.live_textures(), 0);
    }

    #[test]
    fn test_scheduled_reset_statuses_drain() {
        let mut backend = HeadlessBackend::new();
        backend.schedule_reset([GraphicsResetStatus::Guilty]);
        assert_eq!(backend.graphics_reset_status(), GraphicsResetStatus::Guilty);
        assert_eq!(backend.graphics_reset_status(), GraphicsResetStatus::NoError);
    }
}
