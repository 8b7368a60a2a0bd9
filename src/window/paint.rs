//! Turning a window's quads into backend draw calls.
//!
//! A window paints back to front as its shadow, its decoration, one content
//! chain per buffer (its own plus one per annexed child) and, during a
//! cross-fade, the previous content.

use std::collections::HashMap;

use cgmath::{Matrix4, Vector3};
use tracing::{debug, trace};

use crate::backend::{DrawCall, Filter, FrameBackend};
use crate::buffer::texture::{Texture, TextureId};
use crate::buffer::Buffer;
use crate::effects::{PaintMask, WindowPaintData};
use crate::geometry::{Point, Rectangle, Region};
use crate::quads::{WindowQuadList, WindowQuadType};
use crate::shadow::DecorationShadowCache;
use crate::sync::SyncManager;
use crate::toplevel::{Toplevel, WindowId};

use super::{WindowEntry, WindowRenderObject};

/// Opacity of the current content while cross-fading in from the previous one.
pub fn content_opacity(opacity: f64, progress: f64, has_alpha: bool) -> f64 {
    if progress != 1.0 && (opacity < 0.95 || has_alpha) {
        opacity * (1.0 - (1.0 - progress).powf(1.0 + 2.0 * opacity))
    } else {
        opacity
    }
}

pub fn previous_content_opacity(opacity: f64, progress: f64) -> f64 {
    opacity * (1.0 - progress)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LeafKind {
    Shadow,
    Decoration,
    Content(u32),
}

#[derive(Debug, Clone)]
pub struct Leaf {
    pub kind: LeafKind,
    pub quads: WindowQuadList,
}

/// Groups quads into leaves in paint order. Content chains come in id order.
pub fn split_leaves(quads: &WindowQuadList) -> Vec<Leaf> {
    let mut shadow = WindowQuadList::new();
    let mut decoration = WindowQuadList::new();
    let mut chains: Vec<(u32, WindowQuadList)> = Vec::new();
    for quad in quads {
        match quad.kind {
            WindowQuadType::Shadow(_) => shadow.push(*quad),
            WindowQuadType::Decoration => decoration.push(*quad),
            WindowQuadType::Contents => match chains.iter_mut().find(|(id, _)| *id == quad.id) {
                Some((_, list)) => list.push(*quad),
                None => chains.push((quad.id, std::iter::once(*quad).collect())),
            },
        }
    }
    chains.sort_by_key(|(id, _)| *id);

    let mut leaves = Vec::with_capacity(chains.len() + 2);
    if !shadow.is_empty() {
        leaves.push(Leaf {
            kind: LeafKind::Shadow,
            quads: shadow,
        });
    }
    if !decoration.is_empty() {
        leaves.push(Leaf {
            kind: LeafKind::Decoration,
            quads: decoration,
        });
    }
    leaves.extend(chains.into_iter().map(|(id, quads)| Leaf {
        kind: LeafKind::Content(id),
        quads,
    }));
    leaves
}

/// Main-chain quads re-targeted at the previous buffer's content rect.
///
/// `current` and `previous` are the content rects in texture pixels.
pub fn previous_content_quads(
    main: &WindowQuadList,
    current: Rectangle,
    previous: Rectangle,
) -> WindowQuadList {
    if current.is_empty() {
        return WindowQuadList::new();
    }
    let (cx, cy) = (current.left() as f64, current.top() as f64);
    let (cw, ch) = (current.size.w as f64, current.size.h as f64);
    let (px, py) = (previous.left() as f64, previous.top() as f64);
    let (pw, ph) = (previous.size.w as f64, previous.size.h as f64);
    main.iter()
        .filter(|quad| quad.kind == WindowQuadType::Contents && quad.id == 0)
        .map(|quad| {
            let mut quad = *quad;
            for vertex in quad.vertices.iter_mut() {
                vertex.tx = px + (vertex.tx - cx) / cw * pw;
                vertex.ty = py + (vertex.ty - cy) / ch * ph;
            }
            quad
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct LeafTexture {
    id: TextureId,
    size: (f64, f64),
    y_inverted: bool,
}

impl From<&Texture> for LeafTexture {
    fn from(texture: &Texture) -> Self {
        let size = texture.size();
        Self {
            id: texture.id(),
            size: (size.w as f64, size.h as f64),
            y_inverted: texture.is_y_inverted(),
        }
    }
}

/// Everything a window paint writes to.
pub struct PaintTarget<'a> {
    pub backend: &'a mut dyn FrameBackend,
    pub sync: Option<&'a mut SyncManager>,
    pub shadow_cache: &'a mut DecorationShadowCache,
    /// Output projection, applied after the window transform.
    pub projection: Matrix4<f32>,
}

/// Uploads pending damage and returns the texture of the window's current buffer.
fn bind_texture(
    render: &mut WindowRenderObject,
    toplevel: &dyn Toplevel,
    backend: &mut dyn FrameBackend,
    sync: Option<&mut SyncManager>,
) -> Option<LeafTexture> {
    let id = render.id();
    let buffer = render.buffers_mut().current_mut()?;
    if buffer.is_discarded() {
        return buffer.texture().map(LeafTexture::from);
    }
    let damage = toplevel.damage();
    if !damage.is_empty() {
        // the client may still be rendering into the buffer
        if let (Some(sync), Some(fences)) = (sync, backend.fences()) {
            if let Some(fence) = sync.current_fence() {
                fence.wait(fences);
            }
        }
        buffer.refresh(toplevel);
    }
    let result = buffer.bind(backend.importer(), &damage);
    toplevel.reset_damage();
    match result {
        Ok(texture) => texture.map(LeafTexture::from),
        Err(err) => {
            debug!(window = id, "Failed to bind window buffer: {err}");
            None
        }
    }
}

fn filter_for(mask: PaintMask, transformed: bool) -> Filter {
    if mask.contains(PaintMask::WINDOW_LANCZOS) {
        Filter::Lanczos
    } else if transformed {
        Filter::Linear
    } else {
        Filter::Nearest
    }
}

struct Emitter<'d> {
    data: &'d WindowPaintData,
    transform: Matrix4<f32>,
    filter: Filter,
}

impl Emitter<'_> {
    fn emit(
        &self,
        backend: &mut dyn FrameBackend,
        texture: LeafTexture,
        quads: &WindowQuadList,
        opacity: f64,
        has_alpha: bool,
    ) {
        if quads.is_empty() || opacity <= 0.0 {
            return;
        }
        let o = opacity as f32;
        let b = self.data.brightness as f32;
        backend.draw(DrawCall {
            texture: texture.id,
            vertices: quads.interleaved_vertices(texture.size, texture.y_inverted),
            transform: self.transform,
            modulation: [o * b, o * b, o * b, o],
            saturation: self.data.saturation as f32,
            blend: has_alpha || opacity < 1.0,
            filter: self.filter,
            shader: self.data.shader,
        });
    }
}

/// Paints `window` and its annexed children inside `region` (global).
pub fn draw_window(
    windows: &mut HashMap<WindowId, WindowEntry>,
    window: WindowId,
    mask: PaintMask,
    region: &Region,
    data: &WindowPaintData,
    target: &mut PaintTarget<'_>,
) {
    profiling::scope!("draw_window");
    let Some(toplevel) = windows.get(&window).map(|entry| entry.toplevel.clone()) else {
        return;
    };
    let pos = toplevel.pos();
    let transformed = mask.intersects(
        PaintMask::WINDOW_TRANSFORMED
            | PaintMask::SCREEN_TRANSFORMED
            | PaintMask::SCREEN_WITH_TRANSFORMED_WINDOWS,
    ) || data.is_transformed()
        || data.quads.is_transformed();

    // Untransformed quads are clipped on the CPU; transformed ones paint whole.
    let quads = if transformed {
        data.quads.clone()
    } else {
        data.quads
            .clipped(&region.translated(Point::new(-pos.x, -pos.y)))
    };
    if quads.is_empty() {
        return;
    }

    let model = Matrix4::from_translation(Vector3::new(pos.x as f32, pos.y as f32, 0.0))
        * data.transform.matrix();
    let emitter = Emitter {
        data,
        transform: target.projection * model,
        filter: filter_for(mask, transformed),
    };
    let opacity = data.opacity;
    let progress = data.cross_fade_progress;

    for leaf in split_leaves(&quads) {
        match leaf.kind {
            LeafKind::Shadow => {
                let Some(entry) = windows.get_mut(&window) else {
                    return;
                };
                let texture = entry.render.shadow_mut().and_then(|shadow| {
                    shadow.texture(target.backend.importer(), target.shadow_cache)
                });
                if let Some(texture) = texture {
                    emitter.emit(
                        target.backend,
                        LeafTexture::from(texture.as_ref()),
                        &leaf.quads,
                        opacity,
                        true,
                    );
                }
            }
            LeafKind::Decoration => {
                let Some(layout) = toplevel.decoration_layout() else {
                    continue;
                };
                let Some(entry) = windows.get_mut(&window) else {
                    return;
                };
                let texture = entry.render.decoration_mut().and_then(|renderer| {
                    renderer.render(&layout);
                    renderer
                        .texture(target.backend.importer())
                        .map(LeafTexture::from)
                });
                if let Some(texture) = texture {
                    emitter.emit(target.backend, texture, &leaf.quads, opacity, true);
                }
            }
            LeafKind::Content(chain) => {
                let owner = windows
                    .get(&window)
                    .and_then(|entry| entry.render.chain_window(chain));
                let Some(entry) = owner.and_then(|owner| windows.get_mut(&owner)) else {
                    trace!(window, chain, "content chain without a window");
                    continue;
                };
                let chain_opaque = WindowRenderObject::is_opaque(entry.toplevel.as_ref());
                let texture = bind_texture(
                    &mut entry.render,
                    entry.toplevel.as_ref(),
                    target.backend,
                    target.sync.as_deref_mut(),
                );
                if let Some(texture) = texture {
                    emitter.emit(
                        target.backend,
                        texture,
                        &leaf.quads,
                        content_opacity(opacity, progress, toplevel.has_alpha()),
                        !chain_opaque,
                    );
                }
            }
        }
    }

    if progress < 1.0 {
        let Some(entry) = windows.get(&window) else {
            return;
        };
        let scale = toplevel.buffer_scale();
        let current = entry
            .render
            .buffers()
            .current()
            .map(|buffer| buffer.content_rect().scaled(scale));
        let previous = entry.render.buffers().previous();
        if let (Some(current), Some(previous)) = (current, previous) {
            draw_previous(&emitter, target.backend, &quads, current, &previous, scale, opacity, progress);
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn draw_previous(
    emitter: &Emitter<'_>,
    backend: &mut dyn FrameBackend,
    quads: &WindowQuadList,
    current: Rectangle,
    previous: &Buffer,
    scale: f64,
    opacity: f64,
    progress: f64,
) {
    let Some(texture) = previous.texture().map(LeafTexture::from) else {
        return;
    };
    let old_quads = previous_content_quads(quads, current, previous.content_rect().scaled(scale));
    emitter.emit(
        backend,
        texture,
        &old_quads,
        previous_content_opacity(opacity, progress),
        true,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;
    use std::sync::Arc;

    use drm_fourcc::DrmFourcc;

    use crate::backend::headless::HeadlessBackend;
    use crate::buffer::{BufferSource, ShmImage};
    use crate::geometry::Size;
    use crate::output::OutputInfo;
    use crate::quads::WindowQuad;
    use crate::toplevel::SurfaceWindow;

    fn shm(w: i32, h: i32) -> BufferSource {
        BufferSource::Shm(ShmImage {
            size: Size::new(w, h),
            stride: w as u32 * 4,
            format: DrmFourcc::Argb8888,
            scale: 1,
            data: Arc::from(vec![0u8; (w * h * 4) as usize]),
        })
    }

    fn entry(window: &Rc<SurfaceWindow>) -> WindowEntry {
        WindowEntry::new(window.clone())
    }

    fn output() -> OutputInfo {
        OutputInfo::new(0, "test", Rectangle::new(0, 0, 100, 100), 60_000)
    }

    fn target<'a>(
        backend: &'a mut HeadlessBackend,
        cache: &'a mut DecorationShadowCache,
    ) -> PaintTarget<'a> {
        PaintTarget {
            backend,
            sync: None,
            shadow_cache: cache,
            projection: Matrix4::from_scale(1.0),
        }
    }

    #[test]
    fn test_cross_fade_opacity() {
        assert_eq!(content_opacity(1.0, 1.0, false), 1.0);
        // opaque windows are not faded in
        assert_eq!(content_opacity(1.0, 0.5, false), 1.0);
        let faded = content_opacity(1.0, 0.5, true);
        assert!((faded - 0.875).abs() < 1e-9);
        assert_eq!(previous_content_opacity(0.8, 0.25), 0.8 * 0.75);
    }

    #[test]
    fn test_leaves_are_in_paint_order() {
        let rect = (0.0, 0.0, 10.0, 10.0);
        let quads: WindowQuadList = [
            WindowQuad::from_rect(WindowQuadType::Contents, 1, rect, rect),
            WindowQuad::from_rect(WindowQuadType::Decoration, 0, rect, rect),
            WindowQuad::from_rect(WindowQuadType::Contents, 0, rect, rect),
            WindowQuad::from_rect(
                WindowQuadType::Shadow(crate::quads::ShadowElement::Top),
                0,
                rect,
                rect,
            ),
        ]
        .into_iter()
        .collect();
        let kinds: Vec<LeafKind> = split_leaves(&quads).iter().map(|leaf| leaf.kind).collect();
        assert_eq!(
            kinds,
            vec![
                LeafKind::Shadow,
                LeafKind::Decoration,
                LeafKind::Content(0),
                LeafKind::Content(1)
            ]
        );
    }

    #[test]
    fn test_previous_quads_map_into_old_content() {
        let quads: WindowQuadList = std::iter::once(WindowQuad::from_rect(
            WindowQuadType::Contents,
            0,
            (0.0, 0.0, 100.0, 50.0),
            (0.0, 0.0, 100.0, 50.0),
        ))
        .collect();
        let old = previous_content_quads(
            &quads,
            Rectangle::new(0, 0, 100, 50),
            Rectangle::new(10, 0, 50, 100),
        );
        assert_eq!(old.len(), 1);
        assert_eq!(old[0].vertices[0].tx, 10.0);
        assert_eq!(old[0].vertices[2].tx, 60.0);
        assert_eq!(old[0].vertices[2].ty, 100.0);
        assert_eq!(old[0].right(), 100.0);
    }

    #[test]
    fn test_opaque_window_draws_without_blending() {
        let window = Rc::new(SurfaceWindow::new(1, Rectangle::new(10, 10, 20, 20)));
        window.attach(shm(20, 20));
        let mut windows = HashMap::new();
        windows.insert(1, entry(&window));
        let quads = {
            let entry = windows.get_mut(&1).unwrap();
            assert!(entry.render.update_buffer(window.as_ref()));
            entry.render.build_quads(window.as_ref(), &[])
        };

        let mut backend = HeadlessBackend::new();
        backend.prepare_rendering_for_screen(&output());
        let mut cache = DecorationShadowCache::default();
        let data = WindowPaintData::new(1.0, quads.clone());
        draw_window(
            &mut windows,
            1,
            PaintMask::WINDOW_OPAQUE,
            &Region::from_rect(Rectangle::new(0, 0, 100, 100)),
            &data,
            &mut target(&mut backend, &mut cache),
        );
        let calls = &backend.pending_frame().unwrap().draws;
        assert_eq!(calls.len(), 1);
        assert!(!calls[0].blend);
        assert_eq!(calls[0].modulation, [1.0; 4]);
        assert_eq!(calls[0].vertex_count(), 6);
        assert_eq!(backend.headless_importer().full_uploads, 1);
        assert!(window.damage().is_empty());

        // translucent and clipped to a quarter of the window
        let data = WindowPaintData::new(0.5, quads);
        draw_window(
            &mut windows,
            1,
            PaintMask::WINDOW_TRANSLUCENT,
            &Region::from_rect(Rectangle::new(0, 0, 20, 20)),
            &data,
            &mut target(&mut backend, &mut cache),
        );
        let calls = &backend.pending_frame().unwrap().draws;
        assert_eq!(calls.len(), 2);
        assert!(calls[1].blend);
        assert_eq!(calls[1].modulation, [0.5; 4]);
        assert_eq!(calls[1].vertices[0], 0.0);
        assert_eq!(calls[1].vertices[4], 10.0);
        // no new damage, no new upload
        assert_eq!(backend.headless_importer().full_uploads, 1);
        assert!(backend.headless_importer().damage_uploads.is_empty());
    }

    #[test]
    fn test_nearly_opaque_window_is_not_faded_in() {
        let window = Rc::new(SurfaceWindow::new(1, Rectangle::new(0, 0, 20, 20)));
        window.attach(shm(20, 20));
        window.set_opacity(0.97);
        let mut windows = HashMap::new();
        windows.insert(1, entry(&window));
        let quads = {
            let entry = windows.get_mut(&1).unwrap();
            entry.render.update_buffer(window.as_ref());
            entry.render.build_quads(window.as_ref(), &[])
        };
        let mut backend = HeadlessBackend::new();
        backend.prepare_rendering_for_screen(&output());
        let mut cache = DecorationShadowCache::default();
        let mut data = WindowPaintData::new(0.97, quads);
        data.set_cross_fade_progress(0.5);
        draw_window(
            &mut windows,
            1,
            PaintMask::WINDOW_TRANSLUCENT,
            &Region::from_rect(Rectangle::new(0, 0, 20, 20)),
            &data,
            &mut target(&mut backend, &mut cache),
        );
        let calls = &backend.pending_frame().unwrap().draws;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].modulation[3], 0.97_f64 as f32);

        // with an alpha channel the same window fades
        window.set_has_alpha(true);
        draw_window(
            &mut windows,
            1,
            PaintMask::WINDOW_TRANSLUCENT,
            &Region::from_rect(Rectangle::new(0, 0, 20, 20)),
            &data,
            &mut target(&mut backend, &mut cache),
        );
        let calls = &backend.pending_frame().unwrap().draws;
        let faded = content_opacity(0.97, 0.5, true) as f32;
        assert_eq!(calls[1].modulation[3], faded);
        assert!(faded < 0.97);
    }

    #[test]
    fn test_damage_is_uploaded_partially() {
        let window = Rc::new(SurfaceWindow::new(1, Rectangle::new(0, 0, 20, 20)));
        window.attach(shm(20, 20));
        let mut windows = HashMap::new();
        windows.insert(1, entry(&window));
        let quads = {
            let entry = windows.get_mut(&1).unwrap();
            entry.render.update_buffer(window.as_ref());
            entry.render.build_quads(window.as_ref(), &[])
        };
        let mut backend = HeadlessBackend::new();
        let mut cache = DecorationShadowCache::default();
        let region = Region::from_rect(Rectangle::new(0, 0, 20, 20));
        let data = WindowPaintData::new(1.0, quads);
        draw_window(&mut windows, 1, PaintMask::empty(), &region, &data, &mut target(&mut backend, &mut cache));

        window.damage_rect(Rectangle::new(2, 2, 4, 4));
        draw_window(&mut windows, 1, PaintMask::empty(), &region, &data, &mut target(&mut backend, &mut cache));
        assert_eq!(backend.headless_importer().full_uploads, 1);
        assert_eq!(
            backend.headless_importer().damage_uploads,
            vec![Rectangle::new(2, 2, 4, 4)]
        );
    }
}
