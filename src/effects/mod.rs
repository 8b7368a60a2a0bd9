//! The effects chain.
//!
//! Effects are called in order for every paint pass. Each hook receives a
//! continuation for the rest of the chain; an effect that does not call it
//! stops the pass for the stages after it. The last continuation of the
//! paint passes is the scene's own stage.

use std::fmt;
use std::rc::{Rc, Weak};
use std::time::Duration;

use tracing::debug;

use crate::buffer::PreviousBuffer;
use crate::geometry::{Rectangle, Region};
use crate::toplevel::WindowId;

pub mod data;

pub use data::{
    PaintDisabled, PaintMask, Rotation, ScreenPaintData, ScreenPrePaintData, Transform,
    WindowPaintData, WindowPrePaintData,
};

/// Keeps a window's render state alive after the window went away, e.g. for
/// a closing animation. The state is freed once every handle is released.
#[derive(Debug, Clone)]
pub struct WindowRef(Rc<WindowId>);

impl WindowRef {
    pub(crate) fn new(id: WindowId) -> Self {
        Self(Rc::new(id))
    }

    pub fn id(&self) -> WindowId {
        *self.0
    }

    pub fn release(self) {}

    pub(crate) fn downgrade(&self) -> Weak<WindowId> {
        Rc::downgrade(&self.0)
    }

    /// Whether a handle other than this one is alive.
    pub(crate) fn is_shared(&self) -> bool {
        Rc::strong_count(&self.0) > 1
    }
}

/// What effects see of a window during a paint pass.
#[derive(Debug, Clone)]
pub struct EffectWindow {
    pub id: WindowId,
    pub geometry: Rectangle,
    pub opacity: f64,
    pub has_alpha: bool,
    pub is_remnant: bool,
    pub is_lock_screen: bool,
    pub has_decoration: bool,
    previous: Option<PreviousBuffer>,
    handle: Weak<WindowId>,
}

impl EffectWindow {
    pub fn new(id: WindowId, geometry: Rectangle, opacity: f64, has_alpha: bool) -> Self {
        Self {
            id,
            geometry,
            opacity,
            has_alpha,
            is_remnant: false,
            is_lock_screen: false,
            has_decoration: false,
            previous: None,
            handle: Weak::new(),
        }
    }

    pub fn with_handle(mut self, handle: &WindowRef) -> Self {
        self.handle = handle.downgrade();
        self
    }

    /// Keeps the window painted after it is removed, until the handle is released.
    pub fn reference(&self) -> Option<WindowRef> {
        self.handle.upgrade().map(WindowRef)
    }

    pub fn with_previous(mut self, previous: Option<PreviousBuffer>) -> Self {
        self.previous = previous;
        self
    }

    /// Keeps the superseded content alive for a cross-fade until the handle is released.
    pub fn reference_previous_buffer(&self) -> Option<PreviousBuffer> {
        self.previous.clone()
    }

    pub fn has_previous_buffer(&self) -> bool {
        self.previous.is_some()
    }
}

pub trait Effect {
    fn name(&self) -> &str;

    /// Inactive effects are skipped by every pass.
    fn is_active(&self) -> bool {
        true
    }

    fn pre_paint_screen(
        &mut self,
        data: &mut ScreenPrePaintData,
        present_time: Duration,
        next: NextPrePaintScreen<'_>,
    ) {
        next.call(data, present_time);
    }

    fn paint_screen(
        &mut self,
        mask: PaintMask,
        region: &Region,
        data: &mut ScreenPaintData,
        next: NextPaintScreen<'_>,
    ) {
        next.call(mask, region, data);
    }

    /// Adds to `repaints` to request another frame, e.g. while animating.
    fn post_paint_screen(&mut self, repaints: &mut Region) {
        let _ = repaints;
    }

    fn pre_paint_window(
        &mut self,
        window: &EffectWindow,
        data: &mut WindowPrePaintData,
        present_time: Duration,
        next: NextPrePaintWindow<'_>,
    ) {
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
        next.call(window, mask, region, data);
    }

    fn post_paint_window(&mut self, window: &EffectWindow, repaints: &mut Region) {
        let _ = (window, repaints);
    }
}

fn split_active(effects: &mut [Box<dyn Effect>]) -> Option<(&mut Box<dyn Effect>, &mut [Box<dyn Effect>])> {
    let start = effects.iter().position(|effect| effect.is_active())?;
    effects[start..].split_first_mut()
}

pub struct NextPrePaintScreen<'a> {
    rest: &'a mut [Box<dyn Effect>],
}

impl NextPrePaintScreen<'_> {
    pub fn call(self, data: &mut ScreenPrePaintData, present_time: Duration) {
        if let Some((effect, rest)) = split_active(self.rest) {
            effect.pre_paint_screen(data, present_time, NextPrePaintScreen { rest });
        }
    }
}

/// Final arguments of a screen paint that reached the end of the chain.
#[derive(Debug, Clone)]
pub struct ScreenPaint {
    pub mask: PaintMask,
    pub region: Region,
    pub data: ScreenPaintData,
}

pub struct NextPaintScreen<'a> {
    rest: &'a mut [Box<dyn Effect>],
    result: &'a mut Option<ScreenPaint>,
}

impl NextPaintScreen<'_> {
    pub fn call(self, mask: PaintMask, region: &Region, data: &mut ScreenPaintData) {
        match split_active(self.rest) {
            Some((effect, rest)) => effect.paint_screen(
                mask,
                region,
                data,
                NextPaintScreen {
                    rest,
                    result: self.result,
                },
            ),
            None => {
                *self.result = Some(ScreenPaint {
                    mask,
                    region: region.clone(),
                    data: data.clone(),
                })
            }
        }
    }
}

pub struct NextPrePaintWindow<'a> {
    rest: &'a mut [Box<dyn Effect>],
}

impl NextPrePaintWindow<'_> {
    pub fn call(self, window: &EffectWindow, data: &mut WindowPrePaintData, present_time: Duration) {
        if let Some((effect, rest)) = split_active(self.rest) {
            effect.pre_paint_window(window, data, present_time, NextPrePaintWindow { rest });
        }
    }
}

/// The scene's window draw stage.
pub type DrawWindow<'a> = dyn FnMut(&EffectWindow, PaintMask, &Region, &mut WindowPaintData) + 'a;

pub struct NextPaintWindow<'a> {
    rest: &'a mut [Box<dyn Effect>],
    draw: &'a mut DrawWindow<'a>,
}

impl<'a> NextPaintWindow<'a> {
    pub fn call(
        self,
        window: &EffectWindow,
        mask: PaintMask,
        region: &Region,
        data: &mut WindowPaintData,
    ) {
        match split_active(self.rest) {
            Some((effect, rest)) => effect.paint_window(
                window,
                mask,
                region,
                data,
                NextPaintWindow {
                    rest,
                    draw: self.draw,
                },
            ),
            None => (self.draw)(window, mask, region, data),
        }
    }
}

/// Ordered list of loaded effects.
#[derive(Default)]
pub struct EffectChain {
    effects: Vec<Box<dyn Effect>>,
    elevated: Vec<WindowId>,
}

impl fmt::Debug for EffectChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EffectChain")
            .field(
                "effects",
                &self.effects.iter().map(|e| e.name()).collect::<Vec<_>>(),
            )
            .field("elevated", &self.elevated)
            .finish()
    }
}

impl EffectChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, effect: Box<dyn Effect>) {
        debug!("loading effect {}", effect.name());
        self.effects.push(effect);
    }

    pub fn remove(&mut self, name: &str) -> Option<Box<dyn Effect>> {
        let index = self.effects.iter().position(|e| e.name() == name)?;
        Some(self.effects.remove(index))
    }

    pub fn len(&self) -> usize {
        self.effects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.effects.is_empty()
    }

    pub fn has_active_effects(&self) -> bool {
        self.effects.iter().any(|e| e.is_active())
    }

    /// Keeps a window on top of the stacking order, e.g. while it is being dragged.
    pub fn elevate_window(&mut self, window: WindowId, elevate: bool) {
        self.elevated.retain(|id| *id != window);
        if elevate {
            self.elevated.push(window);
        }
    }

    pub fn elevated_windows(&self) -> &[WindowId] {
        &self.elevated
    }

    pub fn pre_paint_screen(&mut self, data: &mut ScreenPrePaintData, present_time: Duration) {
        NextPrePaintScreen {
            rest: &mut self.effects,
        }
        .call(data, present_time);
    }

    /// Runs the screen paint pass. Returns the arguments that reached the end
    /// of the chain, or `None` when an effect stopped it.
    pub fn paint_screen(
        &mut self,
        mask: PaintMask,
        region: &Region,
        data: &mut ScreenPaintData,
    ) -> Option<ScreenPaint> {
        let mut result = None;
        NextPaintScreen {
            rest: &mut self.effects,
            result: &mut result,
        }
        .call(mask, region, data);
        result
    }

    pub fn post_paint_screen(&mut self) -> Region {
        let mut repaints = Region::new();
        for effect in self.effects.iter_mut().filter(|e| e.is_active()) {
            effect.post_paint_screen(&mut repaints);
        }
        repaints
    }

    pub fn pre_paint_window(
        &mut self,
        window: &EffectWindow,
        data: &mut WindowPrePaintData,
        present_time: Duration,
    ) {
        NextPrePaintWindow {
            rest: &mut self.effects,
        }
        .call(window, data, present_time);
    }

    pub fn paint_window<'a>(
        &'a mut self,
        window: &EffectWindow,
        mask: PaintMask,
        region: &Region,
        data: &mut WindowPaintData,
        draw: &'a mut DrawWindow<'a>,
    ) {
        NextPaintWindow {
            rest: &mut self.effects,
            draw,
        }
        .call(window, mask, region, data);
    }

    pub fn post_paint_window(&mut self, window: &EffectWindow) -> Region {
        let mut repaints = Region::new();
        for effect in self.effects.iter_mut().filter(|e| e.is_active()) {
            effect.post_paint_window(window, &mut repaints);
        }
        repaints
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct Recorder {
        name: &'static str,
        log: Rc<RefCell<Vec<String>>>,
        active: bool,
        stop: bool,
    }

    impl Recorder {
        fn boxed(name: &'static str, log: &Rc<RefCell<Vec<String>>>) -> Box<Self> {
            Box::new(Self {
                name,
                log: log.clone(),
                active: true,
                stop: false,
            })
        }
    }

    impl Effect for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        fn is_active(&self) -> bool {
            self.active
        }

        fn paint_screen(
            &mut self,
            mask: PaintMask,
            region: &Region,
            data: &mut ScreenPaintData,
            next: NextPaintScreen<'_>,
        ) {
            self.log.borrow_mut().push(self.name.to_string());
            if !self.stop {
                next.call(mask | PaintMask::SCREEN_BACKGROUND_FIRST, region, data);
            }
        }

        fn paint_window(
            &mut self,
            window: &EffectWindow,
            mask: PaintMask,
            region: &Region,
            data: &mut WindowPaintData,
            next: NextPaintWindow<'_>,
        ) {
            self.log.borrow_mut().push(format!("{}:{}", self.name, window.id));
            data.multiply_opacity(0.5);
            next.call(window, mask, region, data);
        }

        fn post_paint_screen(&mut self, repaints: &mut Region) {
            repaints.add_rect(Rectangle::new(0, 0, 1, 1));
        }
    }

    #[test]
    fn test_chain_runs_in_order_and_reaches_terminal() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut chain = EffectChain::new();
        chain.push(Recorder::boxed("a", &log));
        chain.push(Recorder::boxed("b", &log));

        let result = chain
            .paint_screen(PaintMask::empty(), &Region::new(), &mut ScreenPaintData::default())
            .unwrap();
        assert_eq!(*log.borrow(), vec!["a", "b"]);
        assert!(result.mask.contains(PaintMask::SCREEN_BACKGROUND_FIRST));
    }

    #[test]
    fn test_effect_can_stop_the_pass() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut chain = EffectChain::new();
        let mut first = Recorder::boxed("a", &log);
        first.stop = true;
        chain.push(first);
        chain.push(Recorder::boxed("b", &log));
        let result =
            chain.paint_screen(PaintMask::empty(), &Region::new(), &mut ScreenPaintData::default());
        assert!(result.is_none());
        assert_eq!(*log.borrow(), vec!["a"]);
    }

    #[test]
    fn test_inactive_effects_are_skipped() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut chain = EffectChain::new();
        let mut inactive = Recorder::boxed("a", &log);
        inactive.active = false;
        chain.push(inactive);
        chain.push(Recorder::boxed("b", &log));

        let window = EffectWindow::new(7, Rectangle::new(0, 0, 10, 10), 1.0, false);
        let mut data = WindowPaintData::new(1.0, Default::default());
        let mut drawn = None;
        let mut draw = |w: &EffectWindow, _: PaintMask, _: &Region, d: &mut WindowPaintData| {
            drawn = Some((w.id, d.opacity));
        };
        chain.paint_window(&window, PaintMask::empty(), &Region::new(), &mut data, &mut draw);
        assert_eq!(drawn, Some((7, 0.5)));
        assert_eq!(*log.borrow(), vec!["b:7"]);
        assert_eq!(chain.post_paint_screen().area(), 1);
    }

    #[test]
    fn test_elevation_is_unique() {
        let mut chain = EffectChain::new();
        chain.elevate_window(1, true);
        chain.elevate_window(2, true);
        chain.elevate_window(1, true);
        assert_eq!(chain.elevated_windows(), &[2, 1]);
        chain.elevate_window(2, false);
        assert_eq!(chain.elevated_windows(), &[1]);
    }
}
