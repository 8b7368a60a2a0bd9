//! The scene: turns a stacking order into one painted frame per output.

use std::collections::HashMap;
use std::rc::Rc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::backend::{BackendError, Capabilities, FrameBackend, GraphicsResetStatus};
use crate::decoration::DecorationRenderer;
use crate::effects::EffectChain;
use crate::geometry::{Point, Rectangle, Region, Size};
use crate::output::{OutputId, OutputInfo};
use crate::shadow::{DecorationShadowCache, Shadow};
use crate::sync::SyncManager;
use crate::toplevel::{Toplevel, WindowId};
use crate::window::{WindowEntry, WindowRenderObject};

mod paint;

pub use paint::extend_paint_region;

#[derive(Debug, Error)]
pub enum SceneError {
    #[error("OpenGL {major}.{minor} is too old, 2.0 is required")]
    UnsupportedGlVersion { major: u32, minor: u32 },
    #[error("output {output} of size {requested:?} exceeds the viewport limit {limit:?}")]
    ViewportTooLarge {
        output: OutputId,
        requested: Size,
        limit: Size,
    },
}

impl From<SceneError> for BackendError {
    fn from(err: SceneError) -> Self {
        match err {
            SceneError::UnsupportedGlVersion { major, minor } => {
                BackendError::UnsupportedGlVersion { major, minor }
            }
            SceneError::ViewportTooLarge {
                requested, limit, ..
            } => BackendError::ViewportTooLarge { requested, limit },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SceneConfig {
    /// Longest wait for a graphics reset to complete.
    pub reset_timeout: Duration,
    pub reset_poll_interval: Duration,
    pub background: [f32; 4],
}

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            reset_timeout: Duration::from_secs(10),
            reset_poll_interval: Duration::from_micros(50),
            background: [0.0, 0.0, 0.0, 1.0],
        }
    }
}

/// Result of painting one output.
#[derive(Debug, Clone, Default)]
pub struct FrameOutcome {
    /// Area that changed on screen.
    pub update: Region,
    /// Area holding correct content after the frame.
    pub valid: Region,
    /// Render time reported by the backend.
    pub duration: Duration,
    /// Windows drawn, with their frame geometry.
    pub painted: Vec<(WindowId, Rectangle)>,
    /// Repaints requested by effects during post-paint.
    pub repaints: Region,
    /// A graphics reset happened; the compositor has to reinitialize.
    pub reset: bool,
    /// Fence handling failed and explicit sync got disabled.
    pub sync_failed: bool,
    /// A frame was handed to the backend, so a swap completion will follow.
    pub submitted: bool,
}

pub struct Scene {
    config: SceneConfig,
    capabilities: Capabilities,
    windows: HashMap<WindowId, WindowEntry>,
    shadow_cache: DecorationShadowCache,
    sync: Option<SyncManager>,
    last_present_time: Duration,
}

impl std::fmt::Debug for Scene {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scene")
            .field("config", &self.config)
            .field("windows", &self.windows.len())
            .field("sync", &self.sync.is_some())
            .finish()
    }
}

impl Scene {
    pub fn new(
        config: SceneConfig,
        backend: &dyn FrameBackend,
        outputs: &[OutputInfo],
        sync: Option<SyncManager>,
    ) -> Result<Self, SceneError> {
        let (major, minor) = backend.gl_version();
        if major < 2 {
            return Err(SceneError::UnsupportedGlVersion { major, minor });
        }
        let limit = backend.max_viewport_size();
        for output in outputs {
            let requested = output.geometry.size;
            if requested.w > limit.w || requested.h > limit.h {
                return Err(SceneError::ViewportTooLarge {
                    output: output.id,
                    requested,
                    limit,
                });
            }
        }
        info!(
            backend = backend.name(),
            gl = format!("{major}.{minor}"),
            "Scene initialized"
        );
        Ok(Self {
            config,
            capabilities: backend.capabilities(),
            windows: HashMap::new(),
            shadow_cache: DecorationShadowCache::default(),
            sync,
            last_present_time: Duration::ZERO,
        })
    }

    pub fn add_window(&mut self, toplevel: Rc<dyn Toplevel>) {
        let id = toplevel.id();
        match self.windows.get_mut(&id) {
            Some(entry) => {
                entry.toplevel = toplevel;
                entry.render.restore();
            }
            None => {
                self.windows.insert(id, WindowEntry::new(toplevel));
            }
        }
    }

    /// Forgets the window `id`. A window an effect still references stays
    /// as a remnant until [`Scene::release_remnants`] finds it released.
    /// Returns whether the window was known.
    pub fn remove_window(&mut self, id: WindowId) -> bool {
        let Some(entry) = self.windows.get_mut(&id) else {
            return false;
        };
        if entry.render.is_referenced() {
            debug!(window = id, "window kept as a remnant");
            entry.render.mark_deleted();
            return true;
        }
        self.windows.remove(&id);
        self.shadow_cache.purge();
        true
    }

    /// Frees remnants no effect references anymore. Returns their ids with
    /// the area they covered.
    pub fn release_remnants(&mut self) -> Vec<(WindowId, Region)> {
        let released: Vec<WindowId> = self
            .windows
            .iter()
            .filter(|(_, entry)| entry.render.is_deleted() && !entry.render.is_referenced())
            .map(|(id, _)| *id)
            .collect();
        let mut freed = Vec::with_capacity(released.len());
        for id in released {
            if let Some(entry) = self.windows.remove(&id) {
                freed.push((id, entry.render.visible_region(entry.toplevel.as_ref())));
            }
        }
        if !freed.is_empty() {
            debug!(count = freed.len(), "remnants released");
            self.shadow_cache.purge();
        }
        freed
    }

    pub fn window(&self, id: WindowId) -> Option<&WindowRenderObject> {
        self.windows.get(&id).map(|entry| &entry.render)
    }

    pub fn window_mut(&mut self, id: WindowId) -> Option<&mut WindowRenderObject> {
        self.windows.get_mut(&id).map(|entry| &mut entry.render)
    }

    pub fn window_count(&self) -> usize {
        self.windows.len()
    }

    pub fn set_shadow(&mut self, id: WindowId, shadow: Option<Shadow>) {
        if let Some(render) = self.window_mut(id) {
            render.set_shadow(shadow);
        }
    }

    pub fn set_decoration(&mut self, id: WindowId, renderer: Option<DecorationRenderer>) {
        if let Some(render) = self.window_mut(id) {
            render.set_decoration(renderer);
        }
    }

    /// The window attached a new buffer; the old one stays for cross-fades.
    pub fn buffer_changed(&mut self, id: WindowId) {
        if let Some(render) = self.window_mut(id) {
            render.discard_buffer();
        }
    }

    pub fn geometry_shape_changed(&mut self, id: WindowId) {
        let Some(entry) = self.windows.get_mut(&id) else {
            return;
        };
        let size = entry.toplevel.size();
        entry.render.invalidate_quads();
        if let Some(shadow) = entry.render.shadow_mut() {
            shadow.geometry_changed(size);
        }
    }

    pub fn has_sync(&self) -> bool {
        self.sync.is_some()
    }

    pub fn set_sync(&mut self, sync: Option<SyncManager>) {
        self.sync = sync;
    }

    /// Hands the fence ring back, e.g. to destroy it before the backend goes away.
    pub fn take_sync(&mut self) -> Option<SyncManager> {
        self.sync.take()
    }

    /// Takes over the windows of a scene whose GPU context is gone. Shadows
    /// and decorations are kept and uploaded again; buffers start over.
    pub fn adopt_windows(&mut self, mut previous: Scene) {
        for (id, mut entry) in previous.windows.drain() {
            let shadow = entry.render.take_shadow().map(|mut shadow| {
                shadow.release_texture();
                shadow
            });
            let decoration = entry.render.take_decoration().map(|mut decoration| {
                decoration.release_texture();
                decoration
            });
            self.add_window(entry.toplevel);
            self.set_shadow(id, shadow);
            self.set_decoration(id, decoration);
            if let Some(render) = self.window_mut(id) {
                render.inherit(entry.render);
            }
        }
        self.last_present_time = previous.last_present_time;
    }

    fn monotonic_present_time(&mut self, present_time: Duration) -> Duration {
        if present_time < self.last_present_time {
            warn!(
                ?present_time,
                last = ?self.last_present_time,
                "Presentation time went backwards"
            );
            return self.last_present_time;
        }
        self.last_present_time = present_time;
        present_time
    }

    /// Waits for a pending graphics reset to finish. Returns whether one happened.
    fn check_graphics_reset(&self, backend: &mut dyn FrameBackend) -> bool {
        let status = backend.graphics_reset_status();
        match status {
            GraphicsResetStatus::NoError => return false,
            GraphicsResetStatus::Guilty => {
                warn!("A graphics reset attributable to the current GL context occurred")
            }
            GraphicsResetStatus::Innocent => {
                warn!("A graphics reset not attributable to the current GL context occurred")
            }
            GraphicsResetStatus::Unknown => warn!("A graphics reset of an unknown cause occurred"),
        }

        let start = Instant::now();
        loop {
            if backend.graphics_reset_status() == GraphicsResetStatus::NoError {
                break;
            }
            if start.elapsed() >= self.config.reset_timeout {
                warn!("Waiting for the graphics reset to complete timed out");
                break;
            }
            std::thread::sleep(self.config.reset_poll_interval);
        }
        true
    }

    /// Paints `output` for the windows in `stacking` (bottom to top).
    #[profiling::function]
    #[allow(clippy::too_many_arguments)]
    pub fn paint(
        &mut self,
        backend: &mut dyn FrameBackend,
        effects: &mut EffectChain,
        output: &OutputInfo,
        damage: &Region,
        stacking: &[Rc<dyn Toplevel>],
        present_time: Duration,
        locked: bool,
    ) -> FrameOutcome {
        let leads = get_leads(stacking);

        if !backend.make_current() {
            warn!(output = output.id, "Failed to make the rendering context current");
            return FrameOutcome::default();
        }
        if stacking.iter().any(|window| !window.damage().is_empty()) {
            if let (Some(sync), Some(fences)) = (self.sync.as_mut(), backend.fences()) {
                sync.next_fence().trigger(fences);
            }
        }
        let mut repaint = backend.prepare_rendering_frame();
        repaint |= &backend.prepare_rendering_for_screen(output);

        if self.check_graphics_reset(backend) {
            return FrameOutcome {
                reset: true,
                ..Default::default()
            };
        }

        let present_time = self.monotonic_present_time(present_time);
        let damage = damage.intersect_rect(&output.geometry);
        let mut outcome = paint::paint_output(
            paint::PaintContext {
                config: &self.config,
                capabilities: self.capabilities,
                windows: &mut self.windows,
                shadow_cache: &mut self.shadow_cache,
                sync: self.sync.as_mut(),
                backend,
                effects,
            },
            output,
            &damage,
            &repaint,
            &leads,
            present_time,
            locked,
        );
        backend.end_rendering_frame_for_screen(output, &outcome.valid, &outcome.update);
        outcome.submitted = true;

        if let Some(mut sync) = self.sync.take() {
            match backend.fences() {
                Some(fences) => {
                    if sync.update_fences(fences) {
                        self.sync = Some(sync);
                    } else {
                        warn!("Updating fences failed, disabling explicit synchronization");
                        sync.destroy(fences);
                        outcome.sync_failed = true;
                    }
                }
                None => self.sync = Some(sync),
            }
        }

        backend.importer().cleanup_texture_cache();
        outcome.duration = backend.render_time();
        trace!(
            output = output.id,
            painted = outcome.painted.len(),
            duration = ?outcome.duration,
            "frame painted"
        );
        outcome
    }
}

/// Windows that take part in the stacking order. Annexed windows hand their
/// pending repaints to their lead and paint as part of it.
pub fn get_leads(stacking: &[Rc<dyn Toplevel>]) -> Vec<Rc<dyn Toplevel>> {
    let mut leads = Vec::with_capacity(stacking.len());
    for window in stacking {
        let Some(lead_id) = window.annexed_to() else {
            leads.push(window.clone());
            continue;
        };
        let lead = stacking.iter().find(|candidate| candidate.id() == lead_id);
        match lead {
            Some(lead) => {
                if window.has_pending_repaints() {
                    lead.add_repaint(&window.repaints());
                    window.reset_repaints();
                }
            }
            None => debug!(window = window.id(), lead = lead_id, "annexed window without lead"),
        }
    }
    leads
}

/// Frame-local offset of `child` inside `lead`.
pub(crate) fn annexed_offset(lead: &dyn Toplevel, child: &dyn Toplevel) -> Point {
    child.pos() - lead.pos()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::HeadlessBackend;
    use crate::toplevel::SurfaceWindow;

    fn output() -> OutputInfo {
        OutputInfo::new(1, "test", Rectangle::new(0, 0, 1920, 1080), 60_000)
    }

    #[test]
    fn test_construction_checks_backend_limits() {
        let old = HeadlessBackend::new().with_gl_version(1, 4);
        let err = Scene::new(SceneConfig::default(), &old, &[output()], None).unwrap_err();
        assert!(matches!(err, SceneError::UnsupportedGlVersion { major: 1, minor: 4 }));

        let small = HeadlessBackend::new().with_max_viewport(Size::new(1024, 1024));
        let err = Scene::new(SceneConfig::default(), &small, &[output()], None).unwrap_err();
        assert!(matches!(err, SceneError::ViewportTooLarge { output: 1, .. }));
        assert!(matches!(
            BackendError::from(err),
            BackendError::ViewportTooLarge { .. }
        ));

        assert!(Scene::new(SceneConfig::default(), &HeadlessBackend::new(), &[output()], None).is_ok());
    }

    #[test]
    fn test_annexed_repaints_go_to_lead() {
        let lead = Rc::new(SurfaceWindow::new(1, Rectangle::new(0, 0, 100, 100)));
        let child = Rc::new(SurfaceWindow::new(2, Rectangle::new(10, 10, 20, 20)));
        lead.annex(&child);
        child.damage_rect(Rectangle::new(0, 0, 5, 5));

        let stacking: Vec<Rc<dyn Toplevel>> = vec![lead.clone(), child.clone()];
        let leads = get_leads(&stacking);
        assert_eq!(leads.len(), 1);
        assert_eq!(leads[0].id(), 1);
        assert!(lead.repaints().equals_rect(&Rectangle::new(10, 10, 5, 5)));
        assert!(child.repaints().is_empty());
        assert_eq!(annexed_offset(lead.as_ref(), child.as_ref()), Point::new(10, 10));
    }

    #[test]
    fn test_present_time_is_monotonic() {
        let mut scene = Scene::new(SceneConfig::default(), &HeadlessBackend::new(), &[output()], None).unwrap();
        assert_eq!(scene.monotonic_present_time(Duration::from_millis(20)), Duration::from_millis(20));
        assert_eq!(scene.monotonic_present_time(Duration::from_millis(10)), Duration::from_millis(20));
        assert_eq!(scene.monotonic_present_time(Duration::from_millis(30)), Duration::from_millis(30));
    }

    #[test]
    fn test_fences_wait_for_a_current_context() {
        let mut backend = HeadlessBackend::new();
        let sync = SyncManager::new(backend.fences().unwrap(), Duration::from_secs(1)).unwrap();
        let mut scene = Scene::new(SceneConfig::default(), &backend, &[output()], Some(sync)).unwrap();
        let window = Rc::new(SurfaceWindow::new(1, Rectangle::new(0, 0, 10, 10)));
        window.attach(crate::buffer::BufferSource::solid(Size::new(10, 10), [0, 0, 0, 255]));
        scene.add_window(window.clone());
        let stacking: Vec<Rc<dyn Toplevel>> = vec![window];
        let mut effects = EffectChain::new();
        let damage = Region::from_rect(output().geometry);

        backend.set_context_lost(true);
        let outcome = scene.paint(&mut backend, &mut effects, &output(), &damage, &stacking, Duration::ZERO, false);
        assert!(!outcome.submitted);
        assert_eq!(backend.headless_fences().unwrap().triggers, 0);
        assert!(backend.frames().is_empty());

        backend.set_context_lost(false);
        let outcome = scene.paint(&mut backend, &mut effects, &output(), &damage, &stacking, Duration::ZERO, false);
        assert!(outcome.submitted);
        assert_eq!(backend.headless_fences().unwrap().triggers, 1);
    }

    #[test]
    fn test_buffer_change_keeps_previous_content() {
        let window = Rc::new(SurfaceWindow::new(1, Rectangle::new(0, 0, 10, 10)));
        window.attach(crate::buffer::BufferSource::Framebuffer(crate::buffer::Framebuffer {
            texture: crate::buffer::TextureId(9),
            size: Size::new(10, 10),
        }));
        let mut scene = Scene::new(SceneConfig::default(), &HeadlessBackend::new(), &[output()], None).unwrap();
        scene.add_window(window.clone());
        assert!(scene.window_mut(1).unwrap().update_buffer(window.as_ref()));
        scene.buffer_changed(1);
        let render = scene.window(1).unwrap();
        assert!(render.reference_previous_buffer().is_some());
        assert!(!render.has_valid_buffer());
        assert!(scene.remove_window(1));
        assert!(!scene.remove_window(1));
    }
}
