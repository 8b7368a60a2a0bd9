//! Outputs and the per-output repaint scheduler.
//!
//! The scheduler decides when an output composites. It never owns a timer
//! itself: arming produces a [`TimerRequest`] that the compositor turns into a
//! calloop timer, and stale timers are recognized by their generation.

use std::rc::Rc;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::geometry::{Rectangle, Region};
use crate::presentation::Clock;
use crate::toplevel::{Toplevel, WindowId};

pub type OutputId = u32;

/// Refresh rate assumed when an output reports none, in mHz.
pub const DEFAULT_REFRESH_MHZ: u32 = 60_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputInfo {
    pub id: OutputId,
    pub name: String,
    /// Position and size in the global compositor space.
    pub geometry: Rectangle,
    /// Refresh rate in mHz.
    pub refresh_mhz: u32,
}

impl OutputInfo {
    pub fn new(id: OutputId, name: impl Into<String>, geometry: Rectangle, refresh_mhz: u32) -> Self {
        Self {
            id,
            name: name.into(),
            geometry,
            refresh_mhz,
        }
    }

    pub fn refresh_interval(&self) -> Duration {
        refresh_interval(self.refresh_mhz)
    }
}

pub fn refresh_interval(refresh_mhz: u32) -> Duration {
    let mhz = if refresh_mhz == 0 {
        DEFAULT_REFRESH_MHZ
    } else {
        refresh_mhz
    };
    Duration::from_nanos(1_000_000_000_000 / mhz as u64)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Upper bound of the compositing delay; forces a minimum frame rate.
    pub max_delay: Duration,
    /// The hardware margin is the refresh interval divided by this.
    pub hw_margin_divisor: u32,
    /// Frames after which the duration maxima rotate.
    pub paint_period_frames: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_delay: Duration::from_millis(250),
            hw_margin_divisor: 10,
            paint_period_frames: 100,
        }
    }
}

/// Maximum over roughly the last one to two periods.
#[derive(Debug, Clone)]
pub struct RollingMax {
    slots: [Duration; 2],
    frames: u32,
    period: u32,
}

impl RollingMax {
    pub fn new(period: u32) -> Self {
        Self {
            slots: [Duration::ZERO; 2],
            frames: 0,
            period: period.max(1),
        }
    }

    pub fn update(&mut self, duration: Duration) {
        if self.frames >= self.period {
            self.slots[1] = self.slots[0];
            self.slots[0] = Duration::ZERO;
            self.frames = 0;
        }
        self.slots[0] = self.slots[0].max(duration);
        self.frames += 1;
    }

    pub fn max(&self) -> Duration {
        self.slots[0].max(self.slots[1])
    }
}

/// A one-shot timer the compositor should arm for an output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerRequest {
    pub output: OutputId,
    pub generation: u64,
    pub delay: Duration,
}

pub struct RunPlan {
    pub repaints: Region,
    /// Windows to paint, bottom to top.
    pub windows: Vec<Rc<dyn Toplevel>>,
}

impl std::fmt::Debug for RunPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ids: Vec<WindowId> = self.windows.iter().map(|window| window.id()).collect();
        f.debug_struct("RunPlan")
            .field("repaints", &self.repaints)
            .field("windows", &ids)
            .finish()
    }
}

#[derive(Debug)]
pub enum Prepared {
    /// Waiting on a swap, a powered-off display or an inactive session.
    Deferred,
    /// Nothing to paint.
    Idle,
    Run(RunPlan),
}

#[derive(Debug)]
pub struct OutputScheduler {
    info: OutputInfo,
    config: SchedulerConfig,
    repaints: Region,
    delay: Duration,
    swap_pending: bool,
    idle: bool,
    dpms_on: bool,
    session_active: bool,
    timer_armed: bool,
    generation: u64,
    timer_request: Option<TimerRequest>,
    paint_durations: RollingMax,
    render_durations: RollingMax,
    last_vblank: Option<Duration>,
}

impl OutputScheduler {
    pub fn new(info: OutputInfo, config: SchedulerConfig) -> Self {
        Self {
            info,
            config,
            repaints: Region::new(),
            delay: Duration::ZERO,
            swap_pending: false,
            idle: true,
            dpms_on: true,
            session_active: true,
            timer_armed: false,
            generation: 0,
            timer_request: None,
            paint_durations: RollingMax::new(config.paint_period_frames),
            render_durations: RollingMax::new(config.paint_period_frames),
            last_vblank: None,
        }
    }

    pub fn info(&self) -> &OutputInfo {
        &self.info
    }

    pub fn id(&self) -> OutputId {
        self.info.id
    }

    pub fn geometry(&self) -> Rectangle {
        self.info.geometry
    }

    pub fn repaints(&self) -> &Region {
        &self.repaints
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn is_idle(&self) -> bool {
        self.idle
    }

    pub fn is_swap_pending(&self) -> bool {
        self.swap_pending
    }

    pub fn is_timer_armed(&self) -> bool {
        self.timer_armed
    }

    pub fn max_paint_duration(&self) -> Duration {
        self.paint_durations.max()
    }

    pub fn max_render_duration(&self) -> Duration {
        self.render_durations.max()
    }

    fn waiting_for_event(&self) -> bool {
        self.timer_armed || self.swap_pending || !self.dpms_on || !self.session_active
    }

    pub fn add_repaint(&mut self, region: &Region) {
        let capped = region.intersect_rect(&self.info.geometry);
        if capped.is_empty() {
            return;
        }
        self.repaints |= &capped;
        self.set_delay_timer();
    }

    /// Arms the composite timer unless something else will trigger the next run.
    pub fn set_delay_timer(&mut self) {
        if self.waiting_for_event() {
            return;
        }
        let delay = self.delay.min(self.config.max_delay);
        self.generation += 1;
        self.timer_armed = true;
        self.timer_request = Some(TimerRequest {
            output: self.info.id,
            generation: self.generation,
            delay,
        });
        trace!(output = self.info.id, ?delay, "composite timer armed");
    }

    pub fn take_timer_request(&mut self) -> Option<TimerRequest> {
        self.timer_request.take()
    }

    /// Whether a timer with this generation is still the armed one.
    pub fn is_current_timer(&self, generation: u64) -> bool {
        self.timer_armed && generation == self.generation
    }

    fn disarm(&mut self) {
        self.timer_armed = false;
        self.timer_request = None;
    }

    /// Collects what the next composite paints.
    ///
    /// Window repaints touching other outputs are handed to `forward`,
    /// `elevated` windows are moved on top and, while `locked`, only lock
    /// screen and input method windows remain.
    pub fn prepare_run(
        &mut self,
        mut windows: Vec<Rc<dyn Toplevel>>,
        elevated: &[WindowId],
        locked: bool,
        mut forward: impl FnMut(&Region),
    ) -> Prepared {
        self.disarm();
        if self.swap_pending || !self.dpms_on || !self.session_active {
            return Prepared::Deferred;
        }

        let mut has_window_repaints = false;
        for window in &windows {
            if !window.has_pending_repaints() {
                continue;
            }
            let repaints = window.repaints();
            if repaints.intersect_rect(&self.info.geometry).is_empty() {
                continue;
            }
            forward(&repaints);
            has_window_repaints = true;
        }

        for id in elevated {
            if let Some(index) = windows.iter().position(|window| window.id() == *id) {
                let window = windows.remove(index);
                windows.push(window);
            }
        }

        if self.repaints.is_empty() && !has_window_repaints {
            self.idle = true;
            self.delay = Duration::ZERO;
            return Prepared::Idle;
        }
        self.idle = false;

        windows.retain(|window| {
            window.is_ready_for_painting()
                && (!locked || window.is_lock_screen() || window.is_input_method())
        });

        Prepared::Run(RunPlan {
            repaints: std::mem::take(&mut self.repaints),
            windows,
        })
    }

    /// Runs `paint` and records its timings. `paint` returns the render time
    /// reported by the backend, or `None` when no frame reached the backend.
    pub fn run(
        &mut self,
        clock: &dyn Clock,
        has_swap_event: bool,
        paint: impl FnOnce() -> Option<Duration>,
    ) {
        let start = clock.now();
        let render = paint();
        let elapsed = clock.now().saturating_sub(start);
        self.paint_durations.update(elapsed);
        let Some(render) = render else {
            debug!(output = self.info.id, "no frame submitted, retrying");
            self.retard_next_run();
            return;
        };
        self.render_durations.update(render);
        if has_swap_event {
            // the backend's swap callback drives the next run
            self.swap_pending = true;
        } else {
            self.retard_next_run();
        }
    }

    /// Without swap events, composite again one refresh interval later.
    pub fn retard_next_run(&mut self) {
        self.delay = self.info.refresh_interval();
        self.set_delay_timer();
    }

    pub fn compute_delay(&self, now: Duration, last_vblank: Duration, refresh: Duration) -> Duration {
        let vblank_to_now = now.saturating_sub(last_vblank);
        let hw_margin = refresh / self.config.hw_margin_divisor.max(1);
        refresh
            .saturating_sub(vblank_to_now)
            .saturating_sub(hw_margin)
            .saturating_sub(self.paint_durations.max())
            .saturating_sub(self.render_durations.max())
            .min(self.config.max_delay)
    }

    fn swapped(&mut self, now: Duration, vblank: Duration, refresh: Option<Duration>) -> bool {
        if !self.swap_pending {
            warn!(output = self.info.id, "Swap completed but no swap pending");
            return false;
        }
        self.swap_pending = false;
        let refresh = refresh
            .filter(|refresh| !refresh.is_zero())
            .unwrap_or_else(|| self.info.refresh_interval());
        self.delay = self.compute_delay(now, vblank, refresh);
        self.last_vblank = Some(vblank);
        self.disarm();
        if !self.repaints.is_empty() {
            self.set_delay_timer();
        }
        true
    }

    /// Swap completed without a hardware timestamp.
    pub fn swapped_sw(&mut self, now: Duration) -> bool {
        self.swapped(now, now, None)
    }

    /// Swap completed at the hardware vblank `sec`.`usec`, in the clock's domain.
    pub fn swapped_hw(&mut self, now: Duration, sec: u64, usec: u32) -> bool {
        let vblank = Duration::from_secs(sec) + Duration::from_micros(usec as u64);
        self.swapped(now, vblank, None)
    }

    pub fn last_vblank(&self) -> Option<Duration> {
        self.last_vblank
    }

    pub fn set_dpms_on(&mut self, on: bool) {
        self.dpms_on = on;
        if !on {
            self.disarm();
        } else if !self.repaints.is_empty() {
            self.set_delay_timer();
        }
    }

    pub fn set_session_active(&mut self, active: bool) {
        self.session_active = active;
        if !active {
            self.disarm();
        } else if !self.repaints.is_empty() {
            self.set_delay_timer();
        }
    }
}
