use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use lumen::backend::headless::HeadlessBackend;
use lumen::backend::{Capabilities, FrameBackend, GraphicsResetStatus};
use lumen::buffer::{BufferSource, PreviousBuffer};
use lumen::effects::{
    Effect, EffectChain, EffectWindow, NextPaintWindow, NextPrePaintWindow, PaintMask,
    WindowPaintData, WindowPrePaintData,
};
use lumen::geometry::{Rectangle, Region};
use lumen::output::OutputInfo;
use lumen::scene::{FrameOutcome, Scene, SceneConfig};
use lumen::toplevel::{SurfaceWindow, Toplevel};

const SCREEN: Rectangle = Rectangle::new(0, 0, 1920, 1080);

fn output() -> OutputInfo {
    OutputInfo::new(1, "test", SCREEN, 60_000)
}

fn window(id: u32, rect: Rectangle, has_alpha: bool) -> Rc<SurfaceWindow> {
    let window = Rc::new(SurfaceWindow::new(id, rect));
    window.set_has_alpha(has_alpha);
    window.attach(BufferSource::solid(rect.size, [10, 20, 30, 255]));
    window
}

struct Setup {
    backend: HeadlessBackend,
    scene: Scene,
    effects: EffectChain,
    stacking: Vec<Rc<dyn Toplevel>>,
}

impl Setup {
    fn new(backend: HeadlessBackend, windows: &[Rc<SurfaceWindow>]) -> Self {
        let mut scene = Scene::new(SceneConfig::default(), &backend, &[output()], None).unwrap();
        let stacking: Vec<Rc<dyn Toplevel>> =
            windows.iter().map(|w| w.clone() as Rc<dyn Toplevel>).collect();
        for window in &stacking {
            scene.add_window(window.clone());
        }
        Self {
            backend,
            scene,
            effects: EffectChain::new(),
            stacking,
        }
    }

    fn paint(&mut self, damage: &Region) -> FrameOutcome {
        self.scene.paint(
            &mut self.backend,
            &mut self.effects,
            &output(),
            damage,
            &self.stacking,
            Duration::from_millis(16),
            false,
        )
    }
}

#[test]
fn full_repaint_of_fullscreen_window() {
    let fullscreen = window(1, SCREEN, false);
    let mut setup = Setup::new(HeadlessBackend::new(), &[fullscreen]);

    let outcome = setup.paint(&Region::from_rect(SCREEN));
    assert!(outcome.update.equals_rect(&SCREEN));
    assert!(outcome.valid.equals_rect(&SCREEN));
    assert_eq!(outcome.painted, vec![(1, SCREEN)]);
    assert!(!outcome.reset);

    let frame = setup.backend.last_frame().unwrap();
    // the opaque window covers the whole background
    assert!(frame.clears.is_empty());
    assert_eq!(frame.draws.len(), 1);
    assert_eq!(frame.draws[0].vertex_count(), 6);
    assert!(!frame.draws[0].blend);
}

#[test]
fn opaque_window_occludes_the_one_below() {
    let below = window(1, Rectangle::new(0, 0, 400, 400), false);
    let above = window(2, Rectangle::new(0, 0, 400, 400), false);
    let mut setup = Setup::new(HeadlessBackend::new(), &[below, above]);

    let outcome = setup.paint(&Region::from_rect(Rectangle::new(0, 0, 100, 100)));
    assert_eq!(outcome.painted.len(), 1);
    assert_eq!(outcome.painted[0].0, 2);
    let frame = setup.backend.last_frame().unwrap();
    assert_eq!(frame.draws.len(), 1);
}

#[test]
fn occlusion_leaves_uncovered_windows_whole() {
    let below = window(1, Rectangle::new(0, 0, 400, 400), false);
    let above = window(2, Rectangle::new(0, 0, 400, 400), false);
    let aside = Rectangle::new(600, 0, 200, 200);
    let beside = window(3, aside, false);
    let windows = [below, beside, above];
    let mut setup = Setup::new(HeadlessBackend::new(), &windows);
    for window in &windows {
        window.reset_repaints();
    }

    let mut damage = Region::from_rect(Rectangle::new(0, 0, 100, 100));
    damage.add_rect(aside);
    let outcome = setup.paint(&damage);
    let ids: Vec<u32> = outcome.painted.iter().map(|(id, _)| *id).collect();
    assert_eq!(ids, vec![3, 2]);
    assert!(outcome.update.contains_rect(&aside));

    let frame = setup.backend.last_frame().unwrap();
    assert_eq!(frame.draws.len(), 2);
    // the window off to the side paints all of itself
    let vertices = &frame.draws[0].vertices;
    assert_eq!(frame.draws[0].vertex_count(), 6);
    let xs: Vec<f32> = vertices.chunks(4).map(|v| v[0]).collect();
    let ys: Vec<f32> = vertices.chunks(4).map(|v| v[1]).collect();
    assert_eq!(xs.iter().cloned().fold(f32::MAX, f32::min), 0.0);
    assert_eq!(xs.iter().cloned().fold(f32::MIN, f32::max), 200.0);
    assert_eq!(ys.iter().cloned().fold(f32::MAX, f32::min), 0.0);
    assert_eq!(ys.iter().cloned().fold(f32::MIN, f32::max), 200.0);
}

#[test]
fn translucent_window_repaints_the_one_below() {
    let below = window(1, Rectangle::new(0, 0, 400, 400), false);
    let above = window(2, Rectangle::new(0, 0, 400, 400), true);
    let mut setup = Setup::new(HeadlessBackend::new(), &[below.clone(), above.clone()]);

    below.reset_repaints();
    above.reset_repaints();

    let damage = Rectangle::new(0, 0, 100, 100);
    let outcome = setup.paint(&Region::from_rect(damage));
    let ids: Vec<u32> = outcome.painted.iter().map(|(id, _)| *id).collect();
    assert_eq!(ids, vec![1, 2]);
    assert!(outcome.update.equals_rect(&damage));

    let frame = setup.backend.last_frame().unwrap();
    // the background is hidden by the opaque window
    assert!(frame.clears.is_empty());
    assert_eq!(frame.draws.len(), 2);
    assert!(!frame.draws[0].blend);
    assert!(frame.draws[1].blend);
}

#[test]
fn no_damage_paints_nothing() {
    let win = window(1, Rectangle::new(0, 0, 400, 400), false);
    let mut setup = Setup::new(HeadlessBackend::new(), &[win]);
    setup.paint(&Region::from_rect(SCREEN));

    let outcome = setup.paint(&Region::new());
    assert!(outcome.update.is_empty());
    assert!(outcome.painted.is_empty());
    assert!(setup.backend.last_frame().unwrap().draws.is_empty());
}

#[test]
fn window_repaints_extend_the_damage() {
    let win = window(1, Rectangle::new(100, 100, 400, 400), false);
    let mut setup = Setup::new(HeadlessBackend::new(), &[win.clone()]);
    setup.paint(&Region::from_rect(SCREEN));

    win.damage_rect(Rectangle::new(0, 0, 10, 10));
    let outcome = setup.paint(&Region::new());
    assert!(outcome
        .update
        .equals_rect(&Rectangle::new(100, 100, 10, 10)));
    assert!(win.repaints().is_empty());
}

#[test]
fn large_damage_without_buffer_age_repaints_everything() {
    let backend = HeadlessBackend::new().with_capabilities(Capabilities {
        buffer_age: false,
        ..HeadlessBackend::new().capabilities()
    });
    let win = window(1, Rectangle::new(0, 0, 400, 400), false);
    let mut setup = Setup::new(backend, &[win]);

    let outcome = setup.paint(&Region::from_rect(Rectangle::new(0, 0, 1920, 900)));
    assert!(outcome.update.equals_rect(&SCREEN));
}

#[test]
fn graphics_reset_abandons_the_frame() {
    let mut backend = HeadlessBackend::new();
    backend.schedule_reset([GraphicsResetStatus::Guilty, GraphicsResetStatus::NoError]);
    let win = window(1, SCREEN, false);
    let mut setup = Setup::new(backend, &[win]);

    let outcome = setup.paint(&Region::from_rect(SCREEN));
    assert!(outcome.reset);
    assert_eq!(outcome.duration, Duration::ZERO);
    assert!(outcome.painted.is_empty());
}

/// Keeps the superseded content of every window it sees and fades to the new one.
struct CrossFade {
    held: Rc<RefCell<Option<PreviousBuffer>>>,
    progress: f64,
}

impl Effect for CrossFade {
    fn name(&self) -> &str {
        "crossfade"
    }

    fn pre_paint_window(
        &mut self,
        window: &EffectWindow,
        data: &mut WindowPrePaintData,
        present_time: Duration,
        next: NextPrePaintWindow<'_>,
    ) {
        if let Some(previous) = window.reference_previous_buffer() {
            *self.held.borrow_mut() = Some(previous);
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
        data.set_cross_fade_progress(self.progress);
        next.call(window, mask, region, data);
    }
}

#[test]
fn cross_fade_draws_the_superseded_content() {
    let win = window(1, SCREEN, false);
    let mut setup = Setup::new(HeadlessBackend::new(), &[win.clone()]);
    let held = Rc::new(RefCell::new(None));
    setup.effects.push(Box::new(CrossFade {
        held: held.clone(),
        progress: 0.25,
    }));
    setup.paint(&Region::from_rect(SCREEN));
    assert!(held.borrow().is_none());

    win.attach(BufferSource::solid(SCREEN.size, [200, 20, 30, 255]));
    setup.scene.buffer_changed(1);
    setup.paint(&Region::from_rect(SCREEN));
    assert!(held.borrow().is_some());

    let frame = setup.backend.last_frame().unwrap();
    assert_eq!(frame.draws.len(), 2);
    assert_eq!(frame.draws[0].modulation[3], 1.0);
    assert_eq!(frame.draws[1].modulation[3], 0.75);
    assert!(frame.draws[1].blend);

    // the effect is the last one holding the old content
    assert!(setup.scene.window(1).unwrap().buffers().previous().is_some());
    held.borrow_mut().take();
    assert!(setup.scene.window(1).unwrap().buffers().previous().is_none());
}
