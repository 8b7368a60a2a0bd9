//! Per-window render state: buffers, shadow, decoration and cached quads.

use std::rc::Rc;

use crate::buffer::{BufferPair, PreviousBuffer};
use crate::decoration::DecorationRenderer;
use crate::effects::{EffectWindow, PaintDisabled, PaintMask, WindowRef};
use crate::geometry::{Point, Rectangle, Region};
use crate::quads::{WindowQuad, WindowQuadList, WindowQuadType};
use crate::shadow::Shadow;
use crate::toplevel::{Toplevel, WindowId};

pub mod paint;

pub use paint::{content_opacity, previous_content_opacity};

/// A window known to the scene with its render state.
pub struct WindowEntry {
    pub toplevel: Rc<dyn Toplevel>,
    pub render: WindowRenderObject,
}

impl WindowEntry {
    pub fn new(toplevel: Rc<dyn Toplevel>) -> Self {
        let render = WindowRenderObject::new(toplevel.id());
        Self { toplevel, render }
    }
}

impl std::fmt::Debug for WindowEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowEntry")
            .field("id", &self.render.id())
            .field("render", &self.render)
            .finish()
    }
}

/// Content of an annexed child, painted as part of its lead.
#[derive(Clone, Copy)]
pub struct AnnexedContent<'a> {
    pub window: WindowId,
    /// Child frame position relative to the lead's frame.
    pub offset: Point,
    pub toplevel: &'a dyn Toplevel,
}

/// Content quads for `toplevel`, placed at `offset` from the lead's frame.
fn make_contents_quads(chain: u32, toplevel: &dyn Toplevel, offset: Point) -> WindowQuadList {
    let buffer_offset = toplevel.buffer_offset();
    let region = toplevel.content_region();
    let scale = toplevel.buffer_scale();
    region
        .rects()
        .iter()
        .map(|rect| {
            let x0 = (rect.left() + offset.x) as f64;
            let y0 = (rect.top() + offset.y) as f64;
            let x1 = (rect.right() + offset.x) as f64;
            let y1 = (rect.bottom() + offset.y) as f64;
            // texture coordinates are buffer pixels
            let source = rect.translated(Point::new(-buffer_offset.x, -buffer_offset.y));
            WindowQuad::from_rect(
                WindowQuadType::Contents,
                chain,
                (x0, y0, x1, y1),
                (
                    source.left() as f64 * scale,
                    source.top() as f64 * scale,
                    source.right() as f64 * scale,
                    source.bottom() as f64 * scale,
                ),
            )
        })
        .collect()
}

#[derive(Debug)]
pub struct WindowRenderObject {
    id: WindowId,
    buffers: BufferPair,
    shadow: Option<Shadow>,
    decoration: Option<DecorationRenderer>,
    quads: Option<WindowQuadList>,
    /// Window owning each content chain, indexed by chain id. Chain 0 is this window.
    chains: Vec<WindowId>,
    cached_geometry: Rectangle,
    disabled: PaintDisabled,
    handle: WindowRef,
    /// The window is gone; effects holding a [`WindowRef`] keep it painted.
    deleted: bool,
}

impl WindowRenderObject {
    pub fn new(id: WindowId) -> Self {
        Self {
            id,
            buffers: BufferPair::new(),
            shadow: None,
            decoration: None,
            quads: None,
            chains: vec![id],
            cached_geometry: Rectangle::default(),
            disabled: PaintDisabled::empty(),
            handle: WindowRef::new(id),
            deleted: false,
        }
    }

    pub fn id(&self) -> WindowId {
        self.id
    }

    pub fn buffers(&self) -> &BufferPair {
        &self.buffers
    }

    pub fn buffers_mut(&mut self) -> &mut BufferPair {
        &mut self.buffers
    }

    /// Creates the content buffer if needed. Returns whether it is valid.
    pub fn update_buffer(&mut self, toplevel: &dyn Toplevel) -> bool {
        self.buffers.update(self.id, toplevel).is_some()
    }

    pub fn has_valid_buffer(&self) -> bool {
        self.buffers.current().is_some_and(|buffer| buffer.is_valid())
    }

    /// The window got a new buffer; the current one is kept as previous content.
    pub fn discard_buffer(&mut self) {
        self.buffers.discard();
    }

    pub fn reference_previous_buffer(&self) -> Option<PreviousBuffer> {
        self.buffers.reference_previous()
    }

    pub fn unreference_previous_buffer(&mut self) {
        self.buffers.unreference_previous();
    }

    pub fn shadow(&self) -> Option<&Shadow> {
        self.shadow.as_ref()
    }

    pub fn shadow_mut(&mut self) -> Option<&mut Shadow> {
        self.shadow.as_mut()
    }

    pub fn take_shadow(&mut self) -> Option<Shadow> {
        self.invalidate_quads();
        self.shadow.take()
    }

    pub fn set_shadow(&mut self, shadow: Option<Shadow>) {
        self.shadow = shadow;
        self.invalidate_quads();
    }

    pub fn decoration(&self) -> Option<&DecorationRenderer> {
        self.decoration.as_ref()
    }

    pub fn decoration_mut(&mut self) -> Option<&mut DecorationRenderer> {
        self.decoration.as_mut()
    }

    pub fn take_decoration(&mut self) -> Option<DecorationRenderer> {
        self.invalidate_quads();
        self.decoration.take()
    }

    pub fn set_decoration(&mut self, renderer: Option<DecorationRenderer>) {
        self.decoration = renderer;
        self.invalidate_quads();
    }

    pub fn mark_deleted(&mut self) {
        self.deleted = true;
    }

    /// The window came back before its remnant was released.
    pub fn restore(&mut self) {
        self.deleted = false;
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// Whether an effect holds a [`WindowRef`] on this window.
    pub fn is_referenced(&self) -> bool {
        self.handle.is_shared()
    }

    /// Takes over the identity of the render object this one replaces, so
    /// handles held by effects stay valid.
    pub fn inherit(&mut self, previous: WindowRenderObject) {
        self.handle = previous.handle;
        self.deleted = previous.deleted;
    }

    pub fn is_opaque(toplevel: &dyn Toplevel) -> bool {
        toplevel.opacity() == 1.0 && !toplevel.has_alpha()
    }

    pub fn is_painting_enabled(&self) -> bool {
        self.disabled.is_empty()
    }

    pub fn paint_disabled(&self) -> PaintDisabled {
        self.disabled
    }

    /// Applies the mask an effect left in the pre-paint data.
    pub fn set_paint_disabled(&mut self, disabled: PaintDisabled) {
        self.disabled = disabled;
    }

    /// Recomputes the disable reasons from the window state. Explicit
    /// requests survive until [`WindowRenderObject::enable_painting`].
    pub fn reset_painting_enabled(&mut self, toplevel: &dyn Toplevel) {
        let mut disabled = self.disabled & PaintDisabled::EXPLICIT;
        if (toplevel.is_remnant() || self.deleted) && !self.is_referenced() {
            disabled |= PaintDisabled::DELETED;
        }
        if !toplevel.is_on_current_desktop() {
            disabled |= PaintDisabled::DESKTOP;
        }
        if toplevel.is_minimized() {
            disabled |= PaintDisabled::MINIMIZE;
        }
        if !toplevel.is_on_current_activity() {
            disabled |= PaintDisabled::ACTIVITY;
        }
        if !toplevel.is_shown() {
            disabled |= PaintDisabled::UNSPECIFIED;
        }
        self.disabled = disabled;
    }

    pub fn enable_painting(&mut self, reason: PaintDisabled) {
        self.disabled.remove(reason);
    }

    pub fn disable_painting(&mut self, reason: PaintDisabled) {
        self.disabled.insert(reason);
    }

    /// Drops the cached quads after a geometry or shape change.
    pub fn invalidate_quads(&mut self) {
        self.quads = None;
    }

    /// Window owning content chain `chain`.
    pub fn chain_window(&self, chain: u32) -> Option<WindowId> {
        self.chains.get(chain as usize).copied()
    }

    /// Frame-local quads: shadow, decoration and one content chain for the
    /// window plus each annexed child.
    pub fn build_quads(
        &mut self,
        toplevel: &dyn Toplevel,
        children: &[AnnexedContent<'_>],
    ) -> WindowQuadList {
        let geometry = toplevel.frame_geometry();
        if geometry.size != self.cached_geometry.size {
            self.quads = None;
        }
        let chains: Vec<WindowId> = std::iter::once(self.id)
            .chain(children.iter().map(|child| child.window))
            .collect();
        if chains != self.chains {
            self.quads = None;
        }
        if let Some(quads) = &self.quads {
            return quads.clone();
        }
        profiling::scope!("build_quads");

        let mut quads = make_contents_quads(0, toplevel, Point::default());
        for (index, child) in children.iter().enumerate() {
            quads.extend(make_contents_quads(
                index as u32 + 1,
                child.toplevel,
                child.offset,
            ));
        }

        if let (Some(layout), Some(renderer)) = (toplevel.decoration_layout(), &self.decoration) {
            quads.extend(renderer.make_quads(&layout, &layout.region()));
        }

        if let Some(shadow) = self.shadow.as_mut() {
            shadow.geometry_changed(geometry.size);
            if toplevel.wants_shadow() {
                quads.extend(shadow.quads().iter().copied());
            }
        }

        self.chains = chains;
        self.cached_geometry = geometry;
        self.quads = Some(quads.clone());
        quads
    }

    /// Global region the window may touch, shadow included.
    pub fn visible_region(&self, toplevel: &dyn Toplevel) -> Region {
        let geometry = toplevel.frame_geometry();
        let mut region = Region::from_rect(geometry);
        if let Some(shadow) = self.shadow.as_ref().filter(|_| toplevel.wants_shadow()) {
            region |= &shadow.region().translated(geometry.loc);
        }
        region
    }

    /// Mask and global clip for the pre-paint pass.
    pub fn pre_paint_state(&self, toplevel: &dyn Toplevel, base: PaintMask) -> (PaintMask, Region) {
        let pos = toplevel.pos();
        let client_shape = toplevel.content_region().translated(pos);
        let (mask, mut clip) = if Self::is_opaque(toplevel) {
            (base | PaintMask::WINDOW_OPAQUE, client_shape)
        } else if toplevel.has_alpha() && toplevel.opacity() == 1.0 {
            let opaque_shape = toplevel.opaque_region().translated(pos);
            let clip = &client_shape & &opaque_shape;
            if !client_shape.is_empty() && client_shape == opaque_shape {
                (base | PaintMask::WINDOW_OPAQUE, clip)
            } else {
                (base | PaintMask::WINDOW_TRANSLUCENT, clip)
            }
        } else {
            (base | PaintMask::WINDOW_TRANSLUCENT, Region::new())
        };

        if let Some(layout) = toplevel.decoration_layout() {
            if !toplevel.decoration_has_alpha() && toplevel.opacity() == 1.0 {
                clip |= &layout.region().translated(pos);
            }
        }
        (mask, clip)
    }

    pub fn effect_window(&self, toplevel: &dyn Toplevel) -> EffectWindow {
        let mut window = EffectWindow::new(
            self.id,
            toplevel.frame_geometry(),
            toplevel.opacity(),
            toplevel.has_alpha(),
        )
        .with_previous(self.buffers.reference_previous())
        .with_handle(&self.handle);
        window.is_remnant = toplevel.is_remnant() || self.deleted;
        window.is_lock_screen = toplevel.is_lock_screen();
        window.has_decoration = toplevel.decoration_layout().is_some();
        window
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Size;
    use crate::shadow::ShadowSource;
    use crate::toplevel::{DecorationLayout, SurfaceWindow};

    fn decorated(window: &SurfaceWindow) {
        window.set_decoration(Some(DecorationLayout {
            left: Rectangle::new(0, 20, 5, 100),
            top: Rectangle::new(0, 0, 110, 20),
            right: Rectangle::new(105, 20, 5, 100),
            bottom: Rectangle::new(0, 120, 110, 5),
        }));
    }

    #[test]
    fn test_disable_reasons_follow_window_state() {
        let window = SurfaceWindow::new(1, Rectangle::new(0, 0, 10, 10));
        let mut object = WindowRenderObject::new(1);
        object.reset_painting_enabled(&window);
        assert!(object.is_painting_enabled());

        window.set_minimized(true);
        window.set_on_current_desktop(false);
        object.reset_painting_enabled(&window);
        assert_eq!(
            object.paint_disabled(),
            PaintDisabled::MINIMIZE | PaintDisabled::DESKTOP
        );

        window.set_minimized(false);
        window.set_on_current_desktop(true);
        object.disable_painting(PaintDisabled::EXPLICIT);
        object.reset_painting_enabled(&window);
        assert_eq!(object.paint_disabled(), PaintDisabled::EXPLICIT);
        object.enable_painting(PaintDisabled::EXPLICIT);
        assert!(object.is_painting_enabled());
    }

    #[test]
    fn test_deleted_window_paints_while_referenced() {
        let window = SurfaceWindow::new(1, Rectangle::new(0, 0, 10, 10));
        let mut object = WindowRenderObject::new(1);
        let handle = object.effect_window(&window).reference().unwrap();
        assert!(object.is_referenced());

        object.mark_deleted();
        object.reset_painting_enabled(&window);
        assert!(object.is_painting_enabled());
        assert!(object.effect_window(&window).is_remnant);

        handle.release();
        assert!(!object.is_referenced());
        object.reset_painting_enabled(&window);
        assert_eq!(object.paint_disabled(), PaintDisabled::DELETED);
    }

    #[test]
    fn test_opaque_window_clips_its_content() {
        let window = SurfaceWindow::new(1, Rectangle::new(10, 10, 100, 100));
        let object = WindowRenderObject::new(1);
        let (mask, clip) = object.pre_paint_state(&window, PaintMask::empty());
        assert_eq!(mask, PaintMask::WINDOW_OPAQUE);
        assert!(clip.equals_rect(&Rectangle::new(10, 10, 100, 100)));

        window.set_opacity(0.5);
        let (mask, clip) = object.pre_paint_state(&window, PaintMask::empty());
        assert_eq!(mask, PaintMask::WINDOW_TRANSLUCENT);
        assert!(clip.is_empty());
    }

    #[test]
    fn test_alpha_window_clips_opaque_region() {
        let window = SurfaceWindow::new(1, Rectangle::new(0, 0, 100, 100));
        window.set_has_alpha(true);
        window.set_opaque_region(Region::from_rect(Rectangle::new(0, 0, 100, 50)));
        let object = WindowRenderObject::new(1);
        let (mask, clip) = object.pre_paint_state(&window, PaintMask::SCREEN_REGION);
        assert_eq!(mask, PaintMask::SCREEN_REGION | PaintMask::WINDOW_TRANSLUCENT);
        assert!(clip.equals_rect(&Rectangle::new(0, 0, 100, 50)));

        window.set_opaque_region(Region::from_rect(Rectangle::new(0, 0, 100, 100)));
        let (mask, _) = object.pre_paint_state(&window, PaintMask::empty());
        assert_eq!(mask, PaintMask::WINDOW_OPAQUE);
    }

    #[test]
    fn test_quads_cover_content_and_children() {
        let lead = SurfaceWindow::new(1, Rectangle::new(0, 0, 100, 100));
        lead.set_buffer_scale(2.0);
        let child = SurfaceWindow::new(2, Rectangle::new(20, 30, 10, 10));
        let mut object = WindowRenderObject::new(1);
        let children = [AnnexedContent {
            window: 2,
            offset: Point::new(20, 30),
            toplevel: &child,
        }];
        let quads = object.build_quads(&lead, &children);
        assert_eq!(quads.len(), 2);
        assert_eq!(quads[0].id, 0);
        assert_eq!(quads[0].vertices[2].tx, 200.0);
        assert_eq!(quads[1].id, 1);
        assert_eq!(quads[1].left(), 20.0);
        assert_eq!(object.chain_window(1), Some(2));

        let without_child = object.build_quads(&lead, &[]);
        assert_eq!(without_child.len(), 1);
    }

    #[test]
    fn test_decorated_content_is_offset() {
        let window = SurfaceWindow::new(1, Rectangle::new(0, 0, 110, 125));
        decorated(&window);
        let mut object = WindowRenderObject::new(1);
        let quads = object.build_quads(&window, &[]);
        // no renderer attached, so only the content quad
        assert_eq!(quads.len(), 1);
        assert_eq!(quads[0].left(), 5.0);
        assert_eq!(quads[0].top(), 20.0);
        assert_eq!(quads[0].vertices[0].tx, 0.0);
    }

    #[test]
    fn test_shadow_quads_follow_geometry() {
        let window = SurfaceWindow::new(1, Rectangle::new(0, 0, 100, 100));
        let mut object = WindowRenderObject::new(1);
        object.set_shadow(Some(
            Shadow::new(ShadowSource::gradient(4, [0, 0, 0, 255]), Size::new(100, 100)).unwrap(),
        ));
        assert_eq!(object.build_quads(&window, &[]).len(), 9);
        assert_eq!(object.visible_region(&window).bounding_rect(), Rectangle::new(-4, -4, 108, 108));

        window.set_geometry(Rectangle::new(0, 0, 3, 3));
        let quads = object.build_quads(&window, &[]);
        assert_eq!(quads.shadows().len(), 0);
    }

    #[test]
    fn test_decoration_without_alpha_joins_clip() {
        let window = SurfaceWindow::new(1, Rectangle::new(0, 0, 110, 125));
        decorated(&window);
        window.set_has_alpha(true);
        window.set_decoration_has_alpha(false);
        let object = WindowRenderObject::new(1);
        let (mask, clip) = object.pre_paint_state(&window, PaintMask::empty());
        assert_eq!(mask, PaintMask::WINDOW_TRANSLUCENT);
        assert_eq!(clip, window.decoration_layout().unwrap().region());

        window.set_opacity(0.5);
        let (_, clip) = object.pre_paint_state(&window, PaintMask::empty());
        assert!(clip.is_empty());
    }
}
