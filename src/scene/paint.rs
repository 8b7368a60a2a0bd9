//! Screen and window paint passes.
//!
//! Without screen transformations the simple path runs: windows are walked
//! top-down to find what each one has to repaint given the opaque windows
//! above it, then painted bottom-up. With a transformed screen every window
//! paints everything (the generic path).

use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use cgmath::Matrix4;
use tracing::{debug, trace, warn};

use crate::backend::{Capabilities, FrameBackend};
use crate::effects::{
    EffectChain, EffectWindow, PaintMask, ScreenPaintData, ScreenPrePaintData, WindowPaintData,
    WindowPrePaintData,
};
use crate::geometry::{Point, Rectangle, Region};
use crate::output::OutputInfo;
use crate::quads::WindowQuadList;
use crate::shadow::DecorationShadowCache;
use crate::sync::SyncManager;
use crate::toplevel::{Toplevel, WindowId};
use crate::window::paint::{draw_window, PaintTarget};
use crate::window::{AnnexedContent, WindowEntry, WindowRenderObject};

use super::{annexed_offset, FrameOutcome, SceneConfig};

/// Share of the output a single dirty rect may cover before the whole output is repainted.
const EXTEND_THRESHOLD: f64 = 0.748;
const EXTEND_THRESHOLD_FULLSCREEN: f64 = 0.49;

pub(super) struct PaintContext<'a> {
    pub config: &'a SceneConfig,
    pub capabilities: Capabilities,
    pub windows: &'a mut HashMap<WindowId, WindowEntry>,
    pub shadow_cache: &'a mut DecorationShadowCache,
    pub sync: Option<&'a mut SyncManager>,
    pub backend: &'a mut dyn FrameBackend,
    pub effects: &'a mut EffectChain,
}

/// A window that survived pre-paint.
struct Phase {
    toplevel: Rc<dyn Toplevel>,
    window: EffectWindow,
    mask: PaintMask,
    paint: Region,
    clip: Region,
    region: Region,
    quads: WindowQuadList,
}

/// Without buffer age, a nearly full repaint becomes a full one.
pub fn extend_paint_region(
    dirty: &mut Region,
    output: &Rectangle,
    opaque_fullscreen: bool,
    buffer_age: bool,
) {
    if buffer_age {
        return;
    }
    let threshold = if opaque_fullscreen {
        EXTEND_THRESHOLD_FULLSCREEN
    } else {
        EXTEND_THRESHOLD
    };
    let limit = output.area() as f64 * threshold;
    if dirty.rects().iter().any(|rect| rect.area() as f64 > limit) {
        *dirty = Region::from_rect(*output);
    }
}

fn output_projection(geometry: Rectangle) -> Matrix4<f32> {
    let x = geometry.loc.x as f32;
    let y = geometry.loc.y as f32;
    let w = geometry.size.w as f32;
    let h = geometry.size.h as f32;
    cgmath::ortho(x, x + w, y + h, y, -1.0, 1.0)
}

#[allow(clippy::too_many_arguments)]
pub(super) fn paint_output(
    mut ctx: PaintContext<'_>,
    output: &OutputInfo,
    damage: &Region,
    repaint: &Region,
    leads: &[Rc<dyn Toplevel>],
    present_time: Duration,
    locked: bool,
) -> FrameOutcome {
    let output_region = Region::from_rect(output.geometry);
    let mask = if *damage == output_region {
        PaintMask::empty()
    } else {
        PaintMask::SCREEN_REGION
    };
    let mut pre = ScreenPrePaintData {
        mask,
        paint: damage.clone(),
    };
    ctx.effects.pre_paint_screen(&mut pre, present_time);

    let mut mask = pre.mask;
    let region = if mask.is_screen_transformed() {
        mask.remove(PaintMask::SCREEN_REGION);
        Region::infinite()
    } else if mask.contains(PaintMask::SCREEN_REGION) {
        &pre.paint & &output_region
    } else {
        output_region.clone()
    };

    let mut screen_data = ScreenPaintData::default();
    let Some(screen) = ctx.effects.paint_screen(mask, &region, &mut screen_data) else {
        debug!(output = output.id, "screen paint stopped by an effect");
        return FrameOutcome {
            repaints: ctx.effects.post_paint_screen(),
            ..Default::default()
        };
    };

    let projection = output_projection(output.geometry) * screen.data.transform.matrix();
    let generic = screen.mask.is_screen_transformed();
    let (mut phases, opaque_fullscreen) = pre_paint_windows(
        &mut ctx,
        leads,
        screen.mask,
        &screen.region,
        generic,
        &output.geometry,
        present_time,
    );

    let mut painted = Vec::with_capacity(phases.len());
    let (damaged, painted_region) = if generic {
        paint_generic(&mut ctx, &mut phases, screen.mask, &output_region, projection, locked, &mut painted)
    } else {
        paint_simple(
            &mut ctx,
            &mut phases,
            screen.mask,
            repaint,
            output,
            opaque_fullscreen,
            projection,
            locked,
            &mut painted,
        )
    };
    let valid = &(&screen.region | &painted_region) & &output_region;

    let mut repaints = Region::new();
    for phase in &phases {
        repaints |= &ctx.effects.post_paint_window(&phase.window);
    }
    repaints |= &ctx.effects.post_paint_screen();

    FrameOutcome {
        update: damaged,
        valid,
        painted,
        repaints,
        ..Default::default()
    }
}

/// Annexed children of `lead` whose buffer can be painted.
fn annexed_children(
    windows: &mut HashMap<WindowId, WindowEntry>,
    lead: &dyn Toplevel,
) -> Vec<(WindowId, Point, Rc<dyn Toplevel>)> {
    let mut children = Vec::new();
    for (id, _) in lead.annexed_children() {
        let Some(entry) = windows.get_mut(&id) else {
            continue;
        };
        let child = entry.toplevel.clone();
        if entry.render.update_buffer(child.as_ref()) {
            children.push((id, annexed_offset(lead, child.as_ref()), child));
        }
    }
    children
}

fn pre_paint_windows(
    ctx: &mut PaintContext<'_>,
    leads: &[Rc<dyn Toplevel>],
    screen_mask: PaintMask,
    region: &Region,
    generic: bool,
    output: &Rectangle,
    present_time: Duration,
) -> (Vec<Phase>, bool) {
    profiling::scope!("pre_paint_windows");
    let mut phases = Vec::with_capacity(leads.len());
    let mut opaque_fullscreen = false;

    for toplevel in leads {
        let id = toplevel.id();
        let children = annexed_children(ctx.windows, toplevel.as_ref());
        let Some(entry) = ctx.windows.get_mut(&id) else {
            trace!(window = id, "window not known to the scene");
            continue;
        };
        let render = &mut entry.render;
        // taken before the new buffer releases the pair's hold on the previous one
        let window = render.effect_window(toplevel.as_ref());
        render.update_buffer(toplevel.as_ref());
        render.reset_painting_enabled(toplevel.as_ref());

        let opaque = WindowRenderObject::is_opaque(toplevel.as_ref());
        let (mask, clip, paint) = if generic {
            let kind = if opaque {
                PaintMask::WINDOW_OPAQUE
            } else {
                PaintMask::WINDOW_TRANSLUCENT
            };
            (screen_mask | kind, Region::new(), Region::infinite())
        } else {
            let (mask, clip) = render.pre_paint_state(toplevel.as_ref(), screen_mask);
            (mask, clip, region | &toplevel.repaints())
        };
        // effects may schedule repaints for the next frame from here on
        toplevel.reset_repaints();
        opaque_fullscreen = opaque && toplevel.frame_geometry().contains_rect(output);

        let annexed: Vec<AnnexedContent<'_>> = children
            .iter()
            .map(|(child, offset, toplevel)| AnnexedContent {
                window: *child,
                offset: *offset,
                toplevel: toplevel.as_ref(),
            })
            .collect();
        let quads = render.build_quads(toplevel.as_ref(), &annexed);
        let mut data = WindowPrePaintData {
            mask,
            paint,
            clip,
            quads,
            disabled: render.paint_disabled(),
        };
        ctx.effects.pre_paint_window(&window, &mut data, present_time);
        if data.quads.is_transformed() {
            warn!(window = id, "Pre-paint calls are not allowed to transform quads");
            data.quads = render.build_quads(toplevel.as_ref(), &annexed);
        }

        render.set_paint_disabled(data.disabled);
        if !data.disabled.is_empty() {
            trace!(window = id, disabled = ?data.disabled, "window not painted");
            continue;
        }
        phases.push(Phase {
            toplevel: toplevel.clone(),
            window,
            mask: data.mask,
            paint: data.paint,
            clip: data.clip,
            region: Region::new(),
            quads: data.quads,
        });
    }
    (phases, opaque_fullscreen)
}

fn clear_background(ctx: &mut PaintContext<'_>, region: &Region, output: &Region) {
    if region.is_empty() {
        return;
    }
    let color = ctx.config.background;
    if ctx.capabilities.clipped_clear {
        ctx.backend.clear(&(region & output), color);
    } else {
        ctx.backend.clear(output, color);
    }
}

#[allow(clippy::too_many_arguments)]
fn paint_simple(
    ctx: &mut PaintContext<'_>,
    phases: &mut [Phase],
    screen_mask: PaintMask,
    repaint: &Region,
    output: &OutputInfo,
    opaque_fullscreen: bool,
    projection: Matrix4<f32>,
    locked: bool,
    painted: &mut Vec<(WindowId, Rectangle)>,
) -> (Region, Region) {
    profiling::scope!("paint_simple");
    let output_region = Region::from_rect(output.geometry);
    let covers_output = |region: &Region| (&output_region - region).is_empty();

    let mut dirty = Region::new();
    for phase in phases.iter() {
        dirty |= &phase.paint;
    }
    let repaint_clip = repaint - &dirty;
    dirty |= repaint;

    let mut full_repaint = covers_output(&dirty);
    if !full_repaint {
        extend_paint_region(
            &mut dirty,
            &output.geometry,
            opaque_fullscreen,
            ctx.capabilities.buffer_age,
        );
        full_repaint = covers_output(&dirty);
    }

    let mut all_clips = Region::new();
    let mut upper_translucent_damage = repaint.clone();
    for phase in phases.iter_mut().rev() {
        phase.region = if full_repaint {
            output_region.clone()
        } else {
            &phase.paint | &upper_translucent_damage
        };
        // parts covered by opaque windows above
        phase.region -= &all_clips;
        if !phase.clip.is_empty() && !phase.mask.contains(PaintMask::WINDOW_TRANSLUCENT) {
            all_clips |= &phase.clip;
            if !full_repaint {
                upper_translucent_damage |= &(&phase.region - &phase.clip);
            }
        } else if !full_repaint {
            upper_translucent_damage |= &phase.region;
        }
    }

    let mut painted_area = Region::new();
    if !screen_mask.contains(PaintMask::SCREEN_BACKGROUND_FIRST) {
        painted_area = &dirty - &all_clips;
        clear_background(ctx, &painted_area, &output_region);
    }

    for phase in phases.iter_mut() {
        // windows below a translucent one are repainted where it paints
        painted_area |= &phase.region;
        phase.region = painted_area.clone();
        if paint_window(ctx, phase, &output_region, projection, locked) {
            painted.push((phase.window.id, phase.toplevel.frame_geometry()));
        }
    }

    if full_repaint {
        (&output_region - &repaint_clip, output_region)
    } else {
        (&painted_area - &repaint_clip, painted_area)
    }
}

fn paint_generic(
    ctx: &mut PaintContext<'_>,
    phases: &mut [Phase],
    screen_mask: PaintMask,
    output_region: &Region,
    projection: Matrix4<f32>,
    locked: bool,
    painted: &mut Vec<(WindowId, Rectangle)>,
) -> (Region, Region) {
    profiling::scope!("paint_generic");
    if !screen_mask.contains(PaintMask::SCREEN_BACKGROUND_FIRST) {
        clear_background(ctx, output_region, output_region);
    }
    for phase in phases.iter_mut() {
        phase.region = Region::infinite();
        if paint_window(ctx, phase, output_region, projection, locked) {
            painted.push((phase.window.id, phase.toplevel.frame_geometry()));
        }
    }
    (output_region.clone(), output_region.clone())
}

/// Runs the effects' window paint with the window draw as its last stage.
fn paint_window(
    ctx: &mut PaintContext<'_>,
    phase: &Phase,
    output_region: &Region,
    projection: Matrix4<f32>,
    locked: bool,
) -> bool {
    if locked && !(phase.toplevel.is_lock_screen() || phase.toplevel.is_input_method()) {
        return false;
    }
    let region = &phase.region & output_region;
    if region.is_empty() {
        return false;
    }

    let mut data = WindowPaintData::new(phase.toplevel.opacity(), phase.quads.clone());
    let PaintContext {
        windows,
        shadow_cache,
        sync,
        backend,
        effects,
        ..
    } = ctx;
    let mut target = PaintTarget {
        backend: &mut **backend,
        sync: sync.as_deref_mut(),
        shadow_cache: &mut **shadow_cache,
        projection,
    };
    let mut draw = |window: &EffectWindow,
                    mask: PaintMask,
                    region: &Region,
                    data: &mut WindowPaintData| {
        draw_window(windows, window.id, mask, region, data, &mut target);
    };
    effects.paint_window(&phase.window, phase.mask, &region, &mut data, &mut draw);
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    const OUTPUT: Rectangle = Rectangle::new(0, 0, 1000, 1000);

    #[test]
    fn test_large_dirty_rect_extends_to_output() {
        let mut dirty = Region::from_rect(Rectangle::new(0, 0, 1000, 800));
        extend_paint_region(&mut dirty, &OUTPUT, false, false);
        assert!(dirty.equals_rect(&OUTPUT));

        let mut dirty = Region::from_rect(Rectangle::new(0, 0, 1000, 700));
        extend_paint_region(&mut dirty, &OUTPUT, false, false);
        assert!(dirty.equals_rect(&Rectangle::new(0, 0, 1000, 700)));

        extend_paint_region(&mut dirty, &OUTPUT, true, false);
        assert!(dirty.equals_rect(&OUTPUT));
    }

    #[test]
    fn test_buffer_age_keeps_dirty_region() {
        let mut dirty = Region::from_rect(Rectangle::new(0, 0, 1000, 999));
        extend_paint_region(&mut dirty, &OUTPUT, true, true);
        assert!(dirty.equals_rect(&Rectangle::new(0, 0, 1000, 999)));
    }

    #[test]
    fn test_projection_maps_output_corners() {
        use cgmath::{Point3, Transform};
        let projection = output_projection(Rectangle::new(100, 0, 200, 100));
        let top_left = projection.transform_point(Point3::new(100.0, 0.0, 0.0));
        let bottom_right = projection.transform_point(Point3::new(300.0, 100.0, 0.0));
        assert_eq!((top_left.x, top_left.y), (-1.0, 1.0));
        assert_eq!((bottom_right.x, bottom_right.y), (1.0, -1.0));
    }
}
