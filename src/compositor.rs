//! Compositor context.
//!
//! Owns the scene, the effects chain and one scheduler per output, and
//! drives them from calloop timers. The platform reports finished swaps
//! through [`Compositor::swapped_sw`] and [`Compositor::swapped_hw`].

use std::rc::Rc;
use std::time::Duration;

use calloop::timer::{TimeoutAction, Timer};
use calloop::{EventLoop, LoopHandle};
use tracing::{debug, error, info, trace, warn};

use crate::backend::FrameBackend;
use crate::config::Config;
use crate::decoration::DecorationRenderer;
use crate::effects::EffectChain;
use crate::geometry::{Rectangle, Region};
use crate::output::{OutputId, OutputInfo, OutputScheduler, Prepared, TimerRequest};
use crate::presentation::{Clock, FeedbackSink, Presentation, PresentationKind};
use crate::scene::{FrameOutcome, Scene, SceneError};
use crate::shadow::Shadow;
use crate::sync::SyncManager;
use crate::toplevel::{Toplevel, WindowId};

pub const RESET_NOTIFICATION: &str = "Desktop effects were restarted due to a graphics reset";
pub const SYNC_NOTIFICATION: &str =
    "Explicit synchronization was disabled because the graphics driver stopped responding";

/// User-visible notifications, e.g. a desktop notification daemon.
pub trait Notifier {
    fn notify(&mut self, message: &str);
}

/// Notifier that only logs.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&mut self, message: &str) {
        warn!(target: "lumen::notification", "{message}");
    }
}

pub struct Compositor<B: FrameBackend> {
    config: Config,
    backend: B,
    scene: Option<Scene>,
    effects: EffectChain,
    schedulers: Vec<OutputScheduler>,
    presentation: Presentation,
    /// Bottom to top.
    stacking: Vec<Rc<dyn Toplevel>>,
    sink: Box<dyn FeedbackSink>,
    notifier: Box<dyn Notifier>,
    clock: Rc<dyn Clock>,
    locked: bool,
    idle: bool,
    frames: u64,
}

impl<B: FrameBackend> std::fmt::Debug for Compositor<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compositor")
            .field("backend", &self.backend.name())
            .field("scene", &self.scene)
            .field("effects", &self.effects)
            .field("outputs", &self.schedulers.len())
            .field("windows", &self.stacking.len())
            .field("locked", &self.locked)
            .field("idle", &self.idle)
            .finish()
    }
}

fn create_scene<B: FrameBackend>(
    config: &Config,
    backend: &mut B,
    outputs: &[OutputInfo],
) -> Result<Scene, SceneError> {
    let mut scene = Scene::new(config.scene_config(), &*backend, outputs, None)?;
    if config.explicit_sync {
        if let Some(fences) = backend.fences() {
            match SyncManager::new(fences, config.fence_timeout()) {
                Ok(sync) => scene.set_sync(Some(sync)),
                Err(err) => warn!("Explicit synchronization unavailable: {err}"),
            }
        }
    }
    info!(explicit_sync = scene.has_sync(), "Compositing scene ready");
    Ok(scene)
}

impl<B: FrameBackend> Compositor<B> {
    pub fn new(
        config: Config,
        mut backend: B,
        outputs: Vec<OutputInfo>,
        sink: Box<dyn FeedbackSink>,
        notifier: Box<dyn Notifier>,
        clock: Rc<dyn Clock>,
    ) -> Result<Self, SceneError> {
        let outputs: Vec<OutputInfo> = outputs
            .into_iter()
            .map(|mut output| {
                if output.refresh_mhz == 0 {
                    output.refresh_mhz = config.default_refresh_mhz;
                }
                output
            })
            .collect();
        let scene = create_scene(&config, &mut backend, &outputs)?;
        if config.software_cursor {
            info!("Using a software cursor");
        }
        let scheduler_config = config.scheduler_config();
        let mut compositor = Self {
            presentation: Presentation::new(outputs.clone()),
            schedulers: outputs
                .into_iter()
                .map(|info| OutputScheduler::new(info, scheduler_config))
                .collect(),
            config,
            backend,
            scene: Some(scene),
            effects: EffectChain::new(),
            stacking: Vec::new(),
            sink,
            notifier,
            clock,
            locked: false,
            idle: false,
            frames: 0,
        };
        compositor.add_repaint_full();
        Ok(compositor)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn scene(&self) -> Option<&Scene> {
        self.scene.as_ref()
    }

    pub fn effects(&self) -> &EffectChain {
        &self.effects
    }

    pub fn effects_mut(&mut self) -> &mut EffectChain {
        &mut self.effects
    }

    pub fn scheduler(&self, output: OutputId) -> Option<&OutputScheduler> {
        self.schedulers.iter().find(|s| s.id() == output)
    }

    pub fn outputs(&self) -> impl Iterator<Item = &OutputInfo> {
        self.schedulers.iter().map(OutputScheduler::info)
    }

    pub fn is_idle(&self) -> bool {
        self.idle
    }

    /// Frames painted since startup.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn stacking(&self) -> &[Rc<dyn Toplevel>] {
        &self.stacking
    }

    /// Adds a window on top of the stacking order.
    pub fn add_window(&mut self, toplevel: Rc<dyn Toplevel>) {
        let id = toplevel.id();
        self.stacking.retain(|window| window.id() != id);
        self.stacking.push(toplevel.clone());
        let Some(scene) = self.scene.as_mut() else {
            return;
        };
        scene.add_window(toplevel.clone());

        if toplevel.wants_shadow() {
            if let Some(source) = self.config.shadow_source() {
                match Shadow::new(source, toplevel.size()) {
                    Ok(shadow) => scene.set_shadow(id, Some(shadow)),
                    Err(err) => debug!(window = id, "no shadow: {err}"),
                }
            }
        }
        if toplevel.decoration_layout().is_some() {
            let painter = Box::new(self.config.decoration_painter());
            scene.set_decoration(id, Some(DecorationRenderer::new(painter)));
        }
        self.repaint_window(toplevel.as_ref());
    }

    /// The window went away. While an effect references it, it keeps painting
    /// as a remnant.
    pub fn remove_window(&mut self, id: WindowId) {
        let Some(index) = self.stacking.iter().position(|window| window.id() == id) else {
            return;
        };
        let toplevel = self.stacking[index].clone();
        self.repaint_window(toplevel.as_ref());
        let remnant = self.scene.as_mut().is_some_and(|scene| {
            scene.remove_window(id);
            scene.window(id).is_some()
        });
        if !remnant {
            self.stacking.remove(index);
        }
    }

    /// Drops remnants whose effects released them.
    pub fn release_remnants(&mut self) {
        let Some(scene) = self.scene.as_mut() else {
            return;
        };
        for (id, region) in scene.release_remnants() {
            self.stacking.retain(|window| window.id() != id);
            self.add_repaint(&region);
        }
    }

    pub fn raise_window(&mut self, id: WindowId) {
        let Some(index) = self.stacking.iter().position(|window| window.id() == id) else {
            return;
        };
        let toplevel = self.stacking.remove(index);
        self.repaint_window(toplevel.as_ref());
        self.stacking.push(toplevel);
    }

    /// The window has new damage; its repaints are picked up by the next run.
    pub fn window_damaged(&mut self, id: WindowId) {
        let Some(toplevel) = self.window(id) else {
            return;
        };
        let repaints = toplevel.repaints();
        self.schedule_repaint(&repaints);
    }

    pub fn window_buffer_changed(&mut self, id: WindowId) {
        if let Some(scene) = self.scene.as_mut() {
            scene.buffer_changed(id);
        }
        self.window_damaged(id);
    }

    /// The window moved, resized or changed its shape. `old` is the area it
    /// covered before, shadow included.
    pub fn window_geometry_changed(&mut self, id: WindowId, old: &Region) {
        self.add_repaint(old);
        let Some(toplevel) = self.window(id) else {
            return;
        };
        if let Some(scene) = self.scene.as_mut() {
            scene.geometry_shape_changed(id);
            if let Some(decoration) = scene.window_mut(id).and_then(|render| render.decoration_mut()) {
                decoration.mark_sizes_dirty();
            }
        }
        self.repaint_window(toplevel.as_ref());
    }

    /// Area `id` covers on screen, shadow included.
    pub fn visible_region(&self, id: WindowId) -> Option<Region> {
        let toplevel = self.window(id)?;
        let render = self.scene.as_ref()?.window(id)?;
        Some(render.visible_region(toplevel.as_ref()))
    }

    fn window(&self, id: WindowId) -> Option<Rc<dyn Toplevel>> {
        self.stacking.iter().find(|window| window.id() == id).cloned()
    }

    fn repaint_window(&mut self, toplevel: &dyn Toplevel) {
        let region = self
            .scene
            .as_ref()
            .and_then(|scene| scene.window(toplevel.id()))
            .map(|render| render.visible_region(toplevel))
            .unwrap_or_else(|| Region::from_rect(toplevel.frame_geometry()));
        self.add_repaint(&region);
    }

    pub fn set_screen_locked(&mut self, locked: bool) {
        if self.locked != locked {
            info!(locked, "Screen lock changed");
            self.locked = locked;
            self.add_repaint_full();
        }
    }

    pub fn is_screen_locked(&self) -> bool {
        self.locked
    }

    pub fn add_repaint(&mut self, region: &Region) {
        for scheduler in &mut self.schedulers {
            scheduler.add_repaint(region);
        }
    }

    pub fn add_repaint_full(&mut self) {
        let mut region = Region::new();
        for scheduler in &self.schedulers {
            region.add_rect(scheduler.geometry());
        }
        self.add_repaint(&region);
    }

    /// Arms the timers of outputs touched by `region` without adding repaints.
    fn schedule_repaint(&mut self, region: &Region) {
        for scheduler in &mut self.schedulers {
            if !region.intersect_rect(&scheduler.geometry()).is_empty() {
                scheduler.set_delay_timer();
            }
        }
    }

    pub fn set_dpms(&mut self, output: OutputId, on: bool) {
        if let Some(scheduler) = self.schedulers.iter_mut().find(|s| s.id() == output) {
            scheduler.set_dpms_on(on);
        }
    }

    pub fn set_session_active(&mut self, active: bool) {
        for scheduler in &mut self.schedulers {
            scheduler.set_session_active(active);
        }
    }

    fn check_idle(&mut self) {
        if !self.idle && self.schedulers.iter().all(OutputScheduler::is_idle) {
            debug!("Compositor is idle");
            self.idle = true;
        }
    }

    /// Composite timers armed since the last call.
    pub fn take_timer_requests(&mut self) -> Vec<TimerRequest> {
        self.schedulers
            .iter_mut()
            .filter_map(OutputScheduler::take_timer_request)
            .collect()
    }

    /// A composite timer fired; stale timers are ignored.
    pub fn on_timer(&mut self, output: OutputId, generation: u64) {
        match self.scheduler(output) {
            Some(scheduler) if scheduler.is_current_timer(generation) => self.composite(output),
            Some(_) => trace!(output, generation, "stale composite timer"),
            None => trace!(output, "timer for a removed output"),
        }
    }

    /// Paints `output` if it has anything to paint.
    pub fn composite(&mut self, output: OutputId) {
        profiling::scope!("composite");
        let Some(index) = self.schedulers.iter().position(|s| s.id() == output) else {
            warn!(output, "composite requested for an unknown output");
            return;
        };

        self.release_remnants();
        let mut forwarded = Vec::new();
        let prepared = self.schedulers[index].prepare_run(
            self.stacking.clone(),
            self.effects.elevated_windows(),
            self.locked,
            |region| forwarded.push(region.clone()),
        );
        for (i, scheduler) in self.schedulers.iter_mut().enumerate() {
            if i != index {
                for region in &forwarded {
                    scheduler.add_repaint(region);
                }
            }
        }

        let plan = match prepared {
            Prepared::Deferred => return,
            Prepared::Idle => {
                self.check_idle();
                return;
            }
            Prepared::Run(plan) => plan,
        };
        self.idle = false;

        let Some(scene) = self.scene.as_mut() else {
            return;
        };
        let has_swap_event = self.backend.capabilities().swap_event;
        let info = self.schedulers[index].info().clone();
        let clock = self.clock.clone();
        let now = clock.now();
        let refresh = info.refresh_interval();
        let present_time = match self.schedulers[index].last_vblank() {
            Some(vblank) if vblank + refresh >= now => vblank + refresh,
            _ => now,
        };

        let backend = &mut self.backend;
        let effects = &mut self.effects;
        let locked = self.locked;
        let mut outcome = FrameOutcome::default();
        self.schedulers[index].run(clock.as_ref(), has_swap_event, || {
            outcome = scene.paint(
                backend,
                effects,
                &info,
                &plan.repaints,
                &plan.windows,
                present_time,
                locked,
            );
            outcome.submitted.then_some(outcome.duration)
        });

        if outcome.reset {
            self.reinitialize();
            return;
        }
        if !outcome.submitted {
            // keep the damage for the retry
            self.schedulers[index].add_repaint(&plan.repaints);
            return;
        }
        self.frames += 1;
        if outcome.sync_failed {
            self.notifier.notify(SYNC_NOTIFICATION);
        }
        if !outcome.repaints.is_empty() {
            self.add_repaint(&outcome.repaints);
        }
        // effects may have let go of remnants while painting
        self.release_remnants();
        if let Some(scene) = self.scene.as_ref() {
            // remnants get no feedback
            outcome
                .painted
                .retain(|(id, _)| scene.window(*id).is_some_and(|render| !render.is_deleted()));
        }

        self.presentation
            .lock(output, &outcome.painted, self.sink.as_mut());
        if !has_swap_event {
            self.presentation.software_presented(
                output,
                clock.now(),
                PresentationKind::empty(),
                self.sink.as_mut(),
            );
        }
        trace!(
            output,
            painted = outcome.painted.len(),
            update = ?outcome.update.bounding_rect(),
            "composited"
        );
    }

    /// The backend finished a swap without a hardware timestamp.
    pub fn swapped_sw(&mut self, output: OutputId) {
        let now = self.clock.now();
        let Some(scheduler) = self.schedulers.iter_mut().find(|s| s.id() == output) else {
            return;
        };
        if scheduler.swapped_sw(now) {
            let refresh = scheduler.info().refresh_interval();
            self.presentation
                .presented(output, now, refresh, PresentationKind::VSYNC, self.sink.as_mut());
        }
    }

    /// The backend finished a swap at the vblank `sec`.`usec`.
    pub fn swapped_hw(&mut self, output: OutputId, sec: u64, usec: u32) {
        let now = self.clock.now();
        let Some(scheduler) = self.schedulers.iter_mut().find(|s| s.id() == output) else {
            return;
        };
        if scheduler.swapped_hw(now, sec, usec) {
            let refresh = scheduler.info().refresh_interval();
            let timestamp = Duration::from_secs(sec) + Duration::from_micros(usec as u64);
            self.presentation.presented(
                output,
                timestamp,
                refresh,
                PresentationKind::VSYNC | PresentationKind::HW_CLOCK | PresentationKind::HW_COMPLETION,
                self.sink.as_mut(),
            );
        }
    }

    /// Rebuilds the scene and the schedulers after a graphics reset.
    fn reinitialize(&mut self) {
        warn!("Reinitializing compositing after a graphics reset");
        let outputs: Vec<OutputInfo> = self.schedulers.iter().map(|s| s.info().clone()).collect();
        if let Some(mut previous) = self.scene.take() {
            if let (Some(sync), Some(fences)) = (previous.take_sync(), self.backend.fences()) {
                sync.destroy(fences);
            }
            match create_scene(&self.config, &mut self.backend, &outputs) {
                Ok(mut scene) => {
                    scene.adopt_windows(previous);
                    self.scene = Some(scene);
                }
                Err(err) => error!("Failed to recreate the scene: {err}"),
            }
        }

        let scheduler_config = self.config.scheduler_config();
        self.schedulers = outputs
            .into_iter()
            .map(|info| OutputScheduler::new(info, scheduler_config))
            .collect();
        self.notifier.notify(RESET_NOTIFICATION);
        self.add_repaint_full();
    }

    /// Output whose geometry covers most of `rect`.
    pub fn output_at(&self, rect: &Rectangle) -> Option<OutputId> {
        self.presentation.max_coverage_output(rect)
    }

    /// Releases GPU resources held outside the scene.
    pub fn shutdown(mut self) -> B {
        if let Some(mut scene) = self.scene.take() {
            if let (Some(sync), Some(fences)) = (scene.take_sync(), self.backend.fences()) {
                sync.destroy(fences);
            }
        }
        info!(frames = self.frames, "Compositor shut down");
        self.backend
    }
}

impl<B: FrameBackend + 'static> Compositor<B> {
    /// Turns pending timer requests into calloop timers.
    pub fn schedule_timers(&mut self, handle: &LoopHandle<'static, Self>) {
        for TimerRequest {
            output,
            generation,
            delay,
        } in self.take_timer_requests()
        {
            let result = handle.insert_source(Timer::from_duration(delay), move |_, _, compositor| {
                compositor.on_timer(output, generation);
                TimeoutAction::Drop
            });
            if let Err(err) = result {
                error!(output, "failed to schedule composite timer: {}", err.error);
            }
        }
    }

    /// Runs one event loop iteration.
    pub fn dispatch(
        &mut self,
        event_loop: &mut EventLoop<'static, Self>,
        timeout: Option<Duration>,
    ) -> Result<(), calloop::Error> {
        self.schedule_timers(&event_loop.handle());
        event_loop.dispatch(timeout, self)?;
        self.schedule_timers(&event_loop.handle());
        Ok(())
    }
}
