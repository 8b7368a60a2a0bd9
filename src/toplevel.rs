//! The window-management view consumed by the pipeline.
//!
//! The pipeline never owns windows; it reads them through [`Toplevel`] and
//! only touches the repaint and damage accessors.

use std::cell::{Cell, RefCell};

use crate::buffer::BufferSource;
use crate::geometry::{Point, Rectangle, Region, Size};

pub type WindowId = u32;

/// Server-side decoration parts in frame-local coordinates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecorationLayout {
    pub left: Rectangle,
    pub top: Rectangle,
    pub right: Rectangle,
    pub bottom: Rectangle,
}

impl DecorationLayout {
    /// Parts in atlas order: left, top, right, bottom.
    pub fn parts(&self) -> [Rectangle; 4] {
        [self.left, self.top, self.right, self.bottom]
    }

    pub fn region(&self) -> Region {
        self.parts().into_iter().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.parts().iter().all(Rectangle::is_empty)
    }
}

pub trait Toplevel {
    fn id(&self) -> WindowId;

    /// Frame geometry in global coordinates, decoration included.
    fn frame_geometry(&self) -> Rectangle;

    fn pos(&self) -> Point {
        self.frame_geometry().loc
    }

    fn size(&self) -> Size {
        self.frame_geometry().size
    }

    /// Offset of the client buffer inside the frame.
    fn buffer_offset(&self) -> Point {
        Point::default()
    }

    /// Client content inside the buffer, buffer-local.
    fn content_rect(&self) -> Rectangle {
        Rectangle::from_loc_and_size(Point::default(), self.size())
    }

    /// Content that gets rendered, frame-local. Shaped windows return several rects.
    fn content_region(&self) -> Region {
        Region::from_rect(self.content_rect().translated(self.buffer_offset()))
    }

    /// Opaque part of the content as declared by the client, frame-local.
    fn opaque_region(&self) -> Region {
        Region::new()
    }

    fn decoration_layout(&self) -> Option<DecorationLayout> {
        None
    }

    fn decoration_has_alpha(&self) -> bool {
        true
    }

    fn has_alpha(&self) -> bool;
    fn opacity(&self) -> f64;

    fn buffer_scale(&self) -> f64 {
        1.0
    }

    fn buffer_source(&self) -> Option<BufferSource>;

    /// Damage accumulated since the last reset, buffer-local surface coordinates.
    fn damage(&self) -> Region;
    fn reset_damage(&self);

    /// Pending repaints in global coordinates.
    fn repaints(&self) -> Region;
    fn has_pending_repaints(&self) -> bool {
        !self.repaints().is_empty()
    }
    fn add_repaint(&self, region: &Region);
    fn reset_repaints(&self);

    fn is_remnant(&self) -> bool {
        false
    }
    fn is_on_current_desktop(&self) -> bool {
        true
    }
    fn is_on_current_activity(&self) -> bool {
        true
    }
    fn is_minimized(&self) -> bool {
        false
    }
    /// False while the window manager keeps the window hidden.
    fn is_shown(&self) -> bool {
        true
    }
    fn is_lock_screen(&self) -> bool {
        false
    }
    fn is_input_method(&self) -> bool {
        false
    }
    fn is_ready_for_painting(&self) -> bool {
        true
    }
    fn wants_shadow(&self) -> bool {
        true
    }

    /// Lead window this one is annexed to, if any.
    fn annexed_to(&self) -> Option<WindowId> {
        None
    }
    /// Annexed children with their position relative to this window.
    fn annexed_children(&self) -> Vec<(WindowId, Point)> {
        Vec::new()
    }
}

/// Plain [`Toplevel`] for surfaces whose state the caller sets directly.
#[derive(Debug)]
pub struct SurfaceWindow {
    id: WindowId,
    geometry: Cell<Rectangle>,
    opacity: Cell<f64>,
    has_alpha: Cell<bool>,
    scale: Cell<f64>,
    source: RefCell<Option<BufferSource>>,
    damage: RefCell<Region>,
    repaints: RefCell<Region>,
    opaque: RefCell<Region>,
    decoration: Cell<Option<DecorationLayout>>,
    decoration_alpha: Cell<bool>,
    remnant: Cell<bool>,
    minimized: Cell<bool>,
    on_desktop: Cell<bool>,
    lock_screen: Cell<bool>,
    input_method: Cell<bool>,
    ready: Cell<bool>,
    lead: Cell<Option<WindowId>>,
    children: RefCell<Vec<(WindowId, Point)>>,
}

impl SurfaceWindow {
    pub fn new(id: WindowId, geometry: Rectangle) -> Self {
        Self {
            id,
            geometry: Cell::new(geometry),
            opacity: Cell::new(1.0),
            has_alpha: Cell::new(false),
            scale: Cell::new(1.0),
            source: RefCell::new(None),
            damage: RefCell::new(Region::new()),
            repaints: RefCell::new(Region::new()),
            opaque: RefCell::new(Region::new()),
            decoration: Cell::new(None),
            decoration_alpha: Cell::new(true),
            remnant: Cell::new(false),
            minimized: Cell::new(false),
            on_desktop: Cell::new(true),
            lock_screen: Cell::new(false),
            input_method: Cell::new(false),
            ready: Cell::new(true),
            lead: Cell::new(None),
            children: RefCell::new(Vec::new()),
        }
    }

    /// Attaches a new buffer and damages all of it.
    pub fn attach(&self, source: BufferSource) {
        let size = source.size();
        *self.source.borrow_mut() = Some(source);
        self.damage_rect(Rectangle::from_loc_and_size(Point::default(), size));
    }

    pub fn damage_rect(&self, rect: Rectangle) {
        self.damage.borrow_mut().add_rect(rect);
        let global = rect.translated(self.pos() + self.buffer_offset());
        self.repaints.borrow_mut().add_rect(global);
    }

    pub fn set_geometry(&self, geometry: Rectangle) {
        self.geometry.set(geometry);
    }

    pub fn set_opacity(&self, opacity: f64) {
        self.opacity.set(opacity.clamp(0.0, 1.0));
    }

    pub fn set_has_alpha(&self, has_alpha: bool) {
        self.has_alpha.set(has_alpha);
    }

    pub fn set_buffer_scale(&self, scale: f64) {
        self.scale.set(scale);
    }

    pub fn set_opaque_region(&self, region: Region) {
        *self.opaque.borrow_mut() = region;
    }

    pub fn set_decoration(&self, layout: Option<DecorationLayout>) {
        self.decoration.set(layout);
    }

    pub fn set_decoration_has_alpha(&self, has_alpha: bool) {
        self.decoration_alpha.set(has_alpha);
    }

    pub fn set_remnant(&self, remnant: bool) {
        self.remnant.set(remnant);
    }

    pub fn set_minimized(&self, minimized: bool) {
        self.minimized.set(minimized);
    }

    pub fn set_on_current_desktop(&self, on_desktop: bool) {
        self.on_desktop.set(on_desktop);
    }

    pub fn set_lock_screen(&self, lock_screen: bool) {
        self.lock_screen.set(lock_screen);
    }

    pub fn set_input_method(&self, input_method: bool) {
        self.input_method.set(input_method);
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.set(ready);
    }

    pub fn annex(&self, child: &SurfaceWindow) {
        child.lead.set(Some(self.id));
        let offset = child.pos() - self.pos();
        self.children.borrow_mut().push((child.id, offset));
    }
}

impl Toplevel for SurfaceWindow {
    fn id(&self) -> WindowId {
        self.id
    }

    fn frame_geometry(&self) -> Rectangle {
        self.geometry.get()
    }

    fn buffer_offset(&self) -> Point {
        match self.decoration.get() {
            Some(layout) => Point::new(layout.left.size.w, layout.top.size.h),
            None => Point::default(),
        }
    }

    fn content_rect(&self) -> Rectangle {
        let size = match self.decoration.get() {
            Some(layout) => Size::new(
                self.size().w - layout.left.size.w - layout.right.size.w,
                self.size().h - layout.top.size.h - layout.bottom.size.h,
            ),
            None => self.size(),
        };
        Rectangle::from_loc_and_size(Point::default(), size)
    }

    fn opaque_region(&self) -> Region {
        self.opaque.borrow().clone()
    }

    fn decoration_layout(&self) -> Option<DecorationLayout> {
        self.decoration.get()
    }

    fn decoration_has_alpha(&self) -> bool {
        self.decoration_alpha.get()
    }

    fn has_alpha(&self) -> bool {
        self.has_alpha.get()
    }

    fn opacity(&self) -> f64 {
        self.opacity.get()
    }

    fn buffer_scale(&self) -> f64 {
        self.scale.get()
    }

    fn buffer_source(&self) -> Option<BufferSource> {
        self.source.borrow().clone()
    }

    fn damage(&self) -> Region {
        self.damage.borrow().clone()
    }

    fn reset_damage(&self) {
        self.damage.borrow_mut().clear();
    }

    fn repaints(&self) -> Region {
        self.repaints.borrow().clone()
    }

    fn add_repaint(&self, region: &Region) {
        *self.repaints.borrow_mut() |= region;
    }

    fn reset_repaints(&self) {
        self.repaints.borrow_mut().clear();
    }

    fn is_remnant(&self) -> bool {
        self.remnant.get()
    }

    fn is_on_current_desktop(&self) -> bool {
        self.on_desktop.get()
    }

    fn is_minimized(&self) -> bool {
        self.minimized.get()
    }

    fn is_lock_screen(&self) -> bool {
        self.lock_screen.get()
    }

    fn is_input_method(&self) -> bool {
        self.input_method.get()
    }

    fn is_ready_for_painting(&self) -> bool {
        self.ready.get()
    }

    fn annexed_to(&self) -> Option<WindowId> {
        self.lead.get()
    }

    fn annexed_children(&self) -> Vec<(WindowId, Point)> {
        self.children.borrow().clone()
    }
}
