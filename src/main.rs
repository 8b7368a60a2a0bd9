use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use anyhow::Context;
use calloop::EventLoop;

use lumen::backend::headless::HeadlessBackend;
use lumen::backend::{self, BackendError, BackendKind};
use lumen::buffer::BufferSource;
use lumen::effects::{
    Effect, EffectWindow, NextPaintWindow, NextPrePaintWindow, PaintMask, WindowPaintData,
    WindowPrePaintData,
};
use lumen::geometry::{Rectangle, Region, Size};
use lumen::output::OutputInfo;
use lumen::presentation::{FeedbackSink, MonotonicClock, PresentationFeedback};
use lumen::toplevel::{DecorationLayout, SurfaceWindow, Toplevel, WindowId};
use lumen::{Compositor, Config, LogNotifier};

const DEMO_FRAMES: u64 = 240;
const FADE_DURATION: Duration = Duration::from_millis(500);

/// Logs what clients would receive.
struct LogSink;

impl FeedbackSink for LogSink {
    fn presented(&mut self, window: WindowId, feedback: &PresentationFeedback) {
        tracing::trace!(window, sequence = feedback.sequence(), "presented");
    }

    fn frame_done(&mut self, window: WindowId, time: Duration) {
        tracing::trace!(window, ?time, "frame done");
    }

    fn discarded(&mut self, window: WindowId) {
        tracing::trace!(window, "feedback discarded");
    }
}

/// Fades new windows in.
#[derive(Default)]
struct FadeIn {
    started: HashMap<WindowId, Duration>,
    progress: HashMap<WindowId, f64>,
}

impl Effect for FadeIn {
    fn name(&self) -> &str {
        "fade-in"
    }

    fn pre_paint_window(
        &mut self,
        window: &EffectWindow,
        data: &mut WindowPrePaintData,
        present_time: Duration,
        next: NextPrePaintWindow<'_>,
    ) {
        let start = *self.started.entry(window.id).or_insert(present_time);
        let progress =
            (present_time.saturating_sub(start).as_secs_f64() / FADE_DURATION.as_secs_f64()).min(1.0);
        self.progress.insert(window.id, progress);
        if progress < 1.0 {
            data.set_translucent();
        }
        next.call(window, data, present_time);
    }

    fn paint_window(
        &mut self,
        window: &EffectWindow,
        mask: PaintMask,
        region: &Region,
        data: &mut WindowPaintData,
        next: NextPaintWindow<'_>,
    ) {
        if let Some(progress) = self.progress.get(&window.id) {
            data.multiply_opacity(*progress);
        }
        next.call(window, mask, region, data);
    }

    fn post_paint_window(&mut self, window: &EffectWindow, repaints: &mut Region) {
        if self.progress.get(&window.id).is_some_and(|p| *p < 1.0) {
            repaints.add_rect(window.geometry);
        }
    }
}

fn demo_windows() -> Vec<Rc<SurfaceWindow>> {
    let desktop = SurfaceWindow::new(1, Rectangle::new(0, 0, 1920, 1080));
    desktop.attach(BufferSource::solid(desktop.size(), [30, 30, 46, 255]));

    let terminal = SurfaceWindow::new(2, Rectangle::new(200, 150, 800, 600));
    terminal.set_decoration(Some(DecorationLayout {
        top: Rectangle::new(0, 0, 800, 30),
        ..Default::default()
    }));
    terminal.attach(BufferSource::solid(Size::new(800, 570), [12, 12, 12, 255]));

    let popup = SurfaceWindow::new(3, Rectangle::new(1700, 400, 500, 300));
    popup.set_has_alpha(true);
    popup.attach(BufferSource::solid(popup.size(), [200, 200, 220, 200]));

    vec![Rc::new(desktop), Rc::new(terminal), Rc::new(popup)]
}

fn main() -> anyhow::Result<()> {
    if let Ok(env_filter) = tracing_subscriber::EnvFilter::try_from_default_env() {
        tracing_subscriber::fmt()
            .compact()
            .with_env_filter(env_filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter("info")
            .compact()
            .init();
    }

    #[cfg(feature = "profile-with-tracy")]
    profiling::tracy_client::Client::start();

    profiling::register_thread!("Main Thread");

    #[cfg(feature = "profile-with-puffin")]
    let _server = puffin_http::Server::new(&format!("0.0.0.0:{}", puffin_http::DEFAULT_PORT));
    #[cfg(feature = "profile-with-puffin")]
    profiling::puffin::set_scopes_on(true);

    let config = Config::load();
    let outputs = vec![
        OutputInfo::new(1, "HEADLESS-1", Rectangle::new(0, 0, 1920, 1080), 60_000),
        OutputInfo::new(2, "HEADLESS-2", Rectangle::new(1920, 0, 1280, 1024), 0),
    ];

    let candidates = backend::candidates(config.backend.as_deref());
    let mut compositor = backend::select(&candidates, |kind| match kind {
        BackendKind::Headless => Compositor::new(
            config.clone(),
            HeadlessBackend::new(),
            outputs.clone(),
            Box::new(LogSink),
            Box::new(LogNotifier),
            Rc::new(MonotonicClock::default()),
        )
        .map_err(BackendError::from),
    })
    .context("no compositing backend could be created")?;
    compositor.effects_mut().push(Box::new(FadeIn::default()));

    let windows = demo_windows();
    for window in &windows {
        compositor.add_window(window.clone());
    }

    let mut event_loop: EventLoop<'static, Compositor<HeadlessBackend>> =
        EventLoop::try_new().context("failed to create the event loop")?;

    let mut tick: u32 = 0;
    while compositor.frames() < DEMO_FRAMES {
        compositor
            .dispatch(&mut event_loop, Some(Duration::from_millis(16)))
            .context("event loop dispatch failed")?;

        // the terminal keeps printing
        tick = tick.wrapping_add(1);
        let line = Rectangle::new(0, ((tick * 16) % 560) as i32, 800, 16);
        windows[1].damage_rect(line);
        compositor.window_damaged(windows[1].id());
        compositor.backend_mut().take_frames();
    }

    for output in compositor.outputs() {
        if let Some(scheduler) = compositor.scheduler(output.id) {
            tracing::info!(
                output = %output.name,
                max_paint = ?scheduler.max_paint_duration(),
                max_render = ?scheduler.max_render_duration(),
                "frame timings"
            );
        }
    }
    compositor.shutdown();
    Ok(())
}
