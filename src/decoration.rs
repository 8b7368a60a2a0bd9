//! Server-side decoration rendering into a texture atlas.
//!
//! The four decoration parts are stacked vertically in one atlas: top,
//! bottom, then left and right rotated by 90° so every part is laid out
//! horizontally. Each part is padded by one pixel of clamped edge pixels to
//! avoid texture bleeding when sampling with linear filtering.

use drm_fourcc::DrmFourcc;
use image::{imageops, RgbaImage};
use std::sync::Arc;
use tracing::{debug, trace};

use crate::buffer::{ImportError, ShmImage, Texture, TextureImporter};
use crate::geometry::{Point, Rectangle, Region, Size};
use crate::quads::{WindowQuad, WindowQuadList, WindowQuadType};
use crate::toplevel::DecorationLayout;

const PADDING: i32 = 1;
const ATLAS_WIDTH_ALIGNMENT: i32 = 128;

/// Draws decoration content; provided by the decoration theme.
pub trait DecorationPainter {
    /// Paints the frame-local `rect` of the decoration into an image of
    /// `rect.size` scaled by `scale`.
    fn paint(&self, rect: Rectangle, scale: f64) -> RgbaImage;
}

/// Paints every part in one colour.
#[derive(Debug, Clone, Copy)]
pub struct SolidDecoration {
    pub color: [u8; 4],
}

impl DecorationPainter for SolidDecoration {
    fn paint(&self, rect: Rectangle, scale: f64) -> RgbaImage {
        let size = rect.size.scaled(scale);
        RgbaImage::from_pixel(
            size.w.max(0) as u32,
            size.h.max(0) as u32,
            image::Rgba(self.color),
        )
    }
}

fn align(value: i32, alignment: i32) -> i32 {
    (value + alignment - 1) & !(alignment - 1)
}

/// Atlas positions of the top, bottom, left and right parts, unscaled.
fn sprite_positions(layout: &DecorationLayout) -> [Point; 4] {
    let top = Point::new(PADDING, PADDING);
    let bottom = Point::new(PADDING, top.y + layout.top.size.h + 2 * PADDING);
    let left = Point::new(PADDING, bottom.y + layout.bottom.size.h + 2 * PADDING);
    let right = Point::new(PADDING, left.y + layout.left.size.w + 2 * PADDING);
    [top, bottom, left, right]
}

/// Atlas size for `layout`, or `None` when there is nothing to render.
pub fn atlas_size(layout: &DecorationLayout, scale: f64) -> Option<Size> {
    if layout.is_empty() {
        return None;
    }
    let width = layout
        .top
        .size
        .w
        .max(layout.bottom.size.w)
        .max(layout.left.size.h)
        .max(layout.right.size.h);
    let height =
        layout.top.size.h + layout.bottom.size.h + layout.left.size.w + layout.right.size.w;
    let width = align(width + 2 * PADDING, ATLAS_WIDTH_ALIGNMENT);
    let height = height + 4 * 2 * PADDING;
    let size = Size::new(width, height).scaled(scale);
    (!size.is_empty()).then_some(size)
}

pub struct DecorationRenderer {
    painter: Box<dyn DecorationPainter>,
    atlas: Option<RgbaImage>,
    texture: Option<Texture>,
    scheduled: Region,
    sizes_dirty: bool,
    uploaded: bool,
    dirty_rects: Vec<Rectangle>,
    scale: f64,
}

impl std::fmt::Debug for DecorationRenderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecorationRenderer")
            .field("atlas", &self.atlas.as_ref().map(|a| a.dimensions()))
            .field("scheduled", &self.scheduled)
            .field("sizes_dirty", &self.sizes_dirty)
            .field("scale", &self.scale)
            .finish()
    }
}

impl DecorationRenderer {
    pub fn new(painter: Box<dyn DecorationPainter>) -> Self {
        Self {
            painter,
            atlas: None,
            texture: None,
            scheduled: Region::new(),
            sizes_dirty: true,
            uploaded: false,
            dirty_rects: Vec::new(),
            scale: 1.0,
        }
    }

    /// Queues a frame-local region of the decoration for re-rendering.
    pub fn schedule(&mut self, region: &Region) {
        self.scheduled |= region;
    }

    /// The decoration parts changed size; the atlas is resized on the next render.
    pub fn mark_sizes_dirty(&mut self) {
        self.sizes_dirty = true;
    }

    pub fn set_scale(&mut self, scale: f64) {
        if scale != self.scale {
            self.scale = scale;
            self.sizes_dirty = true;
        }
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn atlas_size(&self) -> Option<Size> {
        self.atlas
            .as_ref()
            .map(|atlas| Size::new(atlas.width() as i32, atlas.height() as i32))
    }

    pub fn needs_render(&self) -> bool {
        self.sizes_dirty || !self.scheduled.is_empty()
    }

    /// Renders scheduled parts into the atlas. Does nothing when neither a
    /// region was scheduled nor the sizes changed.
    pub fn render(&mut self, layout: &DecorationLayout) {
        let dirty = self.sizes_dirty;
        if self.scheduled.is_empty() && !dirty {
            return;
        }
        profiling::scope!("decoration_render");
        if dirty {
            self.resize_atlas(layout);
            self.sizes_dirty = false;
        }
        let scheduled = std::mem::take(&mut self.scheduled);
        if self.atlas.is_none() {
            // Retried once the decoration gets a valid size.
            return;
        }

        let frame = layout
            .parts()
            .iter()
            .fold(Rectangle::default(), |acc, part| acc.merge(part));
        let geometry = if dirty {
            frame
        } else {
            scheduled.bounding_rect()
        };

        let [top_pos, bottom_pos, left_pos, right_pos] = sprite_positions(layout);
        let parts = [
            (layout.left, left_pos, true),
            (layout.top, top_pos, false),
            (layout.right, right_pos, true),
            (layout.bottom, bottom_pos, false),
        ];
        for (part, position, rotated) in parts {
            if let Some(geo) = part.intersection(&geometry) {
                self.render_part(geo, part, position, rotated);
            }
        }
    }

    fn resize_atlas(&mut self, layout: &DecorationLayout) {
        let Some(size) = atlas_size(layout, self.scale) else {
            debug!("Decoration has an invalid size, dropping its atlas");
            self.atlas = None;
            self.texture = None;
            return;
        };
        if self.atlas_size() == Some(size) {
            return;
        }
        trace!(?size, "resizing decoration atlas");
        self.atlas = Some(RgbaImage::new(size.w as u32, size.h as u32));
        self.texture = None;
        self.uploaded = false;
        self.dirty_rects.clear();
    }

    fn render_part(&mut self, geo: Rectangle, part: Rectangle, position: Point, rotated: bool) {
        let scale = self.scale;
        let Some(atlas) = self.atlas.as_mut() else {
            return;
        };

        // Pad only the edges where the dirty area touches the part's edges.
        let rect = geo.adjusted(
            if geo.left() == part.left() { PADDING } else { 0 },
            if geo.top() == part.top() { PADDING } else { 0 },
            if geo.right() == part.right() { PADDING } else { 0 },
            if geo.bottom() == part.bottom() { PADDING } else { 0 },
        );
        let mut viewport = geo.translated(Point::new(-rect.left(), -rect.top()));

        let content = self.painter.paint(geo, scale);
        let image_size = rect.size.scaled(scale);
        let mut image = RgbaImage::new(image_size.w.max(0) as u32, image_size.h.max(0) as u32);
        let viewport_scaled = viewport.scaled(scale);
        imageops::replace(
            &mut image,
            &content,
            viewport_scaled.left() as i64,
            viewport_scaled.top() as i64,
        );
        let integer_scaling = scale.fract() == 0.0;
        clamp(
            &mut image,
            if integer_scaling {
                viewport_scaled
            } else {
                viewport_scaled.adjusted(-1, -1, -1, -1)
            },
        );

        let mut dirty_offset = geo.loc - part.loc;
        if rotated {
            image = transpose(&image);
            viewport = Rectangle::new(
                viewport.top(),
                viewport.left(),
                viewport.size.h,
                viewport.size.w,
            );
            dirty_offset = Point::new(dirty_offset.y, dirty_offset.x);
        }

        let dest = position + dirty_offset - viewport.loc;
        let dest = Point::new(
            (dest.x as f64 * scale).round() as i32,
            (dest.y as f64 * scale).round() as i32,
        );
        imageops::replace(atlas, &image, dest.x as i64, dest.y as i64);
        self.dirty_rects.push(Rectangle::new(
            dest.x,
            dest.y,
            image.width() as i32,
            image.height() as i32,
        ));
    }

    pub fn release_texture(&mut self) {
        self.texture = None;
        self.uploaded = false;
        self.dirty_rects.clear();
    }

    /// Uploads the atlas, only the rendered parts when a texture exists.
    pub fn texture(&mut self, importer: &mut dyn TextureImporter) -> Option<&Texture> {
        let atlas = self.atlas.as_ref()?;
        let result = match self.texture.as_mut() {
            Some(texture) if self.uploaded => {
                if self.dirty_rects.is_empty() {
                    Ok(())
                } else {
                    importer.update_shm(texture, &atlas_image(atlas), &self.dirty_rects)
                }
            }
            _ => match upload(atlas, importer) {
                Ok(texture) => {
                    self.texture = Some(texture);
                    Ok(())
                }
                Err(err) => Err(err),
            },
        };
        match result {
            Ok(()) => {
                self.uploaded = true;
                self.dirty_rects.clear();
                self.texture.as_ref()
            }
            Err(err) => {
                debug!("Failed to upload decoration atlas: {err}");
                self.texture = None;
                self.uploaded = false;
                None
            }
        }
    }

    /// Quads for the parts of `layout` inside `region` (frame-local), with
    /// texture coordinates in atlas pixels.
    pub fn make_quads(&self, layout: &DecorationLayout, region: &Region) -> WindowQuadList {
        make_decoration_quads(layout, region, self.scale)
    }
}

pub fn make_decoration_quads(
    layout: &DecorationLayout,
    region: &Region,
    texture_scale: f64,
) -> WindowQuadList {
    let [top_pos, bottom_pos, left_pos, right_pos] = sprite_positions(layout);
    // Vertical parts live transposed in the atlas.
    let left_sprite = Point::new(left_pos.y, left_pos.x);
    let right_sprite = Point::new(right_pos.y, right_pos.x);

    let parts = [
        (layout.left, left_sprite, true),
        (layout.top, top_pos, false),
        (layout.right, right_sprite, true),
        (layout.bottom, bottom_pos, false),
    ];

    let mut list = WindowQuadList::new();
    for (part, sprite, swap) in parts {
        let offset = Point::new(-part.left(), -part.top()) + sprite;
        for r in region.intersect_rect(&part).rects() {
            let (x0, y0, x1, y1) = (r.left(), r.top(), r.right(), r.bottom());
            let u0 = (x0 + offset.x) as f64 * texture_scale;
            let v0 = (y0 + offset.y) as f64 * texture_scale;
            let u1 = (x1 + offset.x) as f64 * texture_scale;
            let v1 = (y1 + offset.y) as f64 * texture_scale;

            let rect = (x0 as f64, y0 as f64, x1 as f64, y1 as f64);
            let mut quad = if swap {
                let mut quad =
                    WindowQuad::from_rect(WindowQuadType::Decoration, 0, rect, (v0, u0, v1, u1));
                quad.vertices[1].tx = v0;
                quad.vertices[1].ty = u1;
                quad.vertices[3].tx = v1;
                quad.vertices[3].ty = u0;
                quad
            } else {
                WindowQuad::from_rect(WindowQuadType::Decoration, 0, rect, (u0, v0, u1, v1))
            };
            quad.uv_swapped = swap;
            list.push(quad);
        }
    }
    list
}

fn atlas_image(atlas: &RgbaImage) -> ShmImage {
    ShmImage {
        size: Size::new(atlas.width() as i32, atlas.height() as i32),
        stride: atlas.width() * 4,
        format: DrmFourcc::Abgr8888,
        scale: 1,
        data: Arc::from(atlas.as_raw().as_slice()),
    }
}

fn upload(atlas: &RgbaImage, importer: &mut dyn TextureImporter) -> Result<Texture, ImportError> {
    let mut texture = importer.import_shm(&atlas_image(atlas))?;
    texture.set_y_inverted(true);
    Ok(texture)
}

/// Rotates 90° counter-clockwise and flips vertically.
fn transpose(image: &RgbaImage) -> RgbaImage {
    let rotated = imageops::rotate90(image);
    imageops::flip_horizontal(&rotated)
}

/// Extends the border pixels of `viewport` over the rest of `image`.
fn clamp(image: &mut RgbaImage, viewport: Rectangle) {
    let (width, height) = (image.width() as i32, image.height() as i32);
    let bounds = Rectangle::new(0, 0, width, height);
    let Some(viewport) = viewport.intersection(&bounds) else {
        return;
    };
    for y in 0..height {
        for x in 0..width {
            if viewport.contains(Point::new(x, y)) {
                continue;
            }
            let sx = x.clamp(viewport.left(), viewport.right() - 1);
            let sy = y.clamp(viewport.top(), viewport.bottom() - 1);
            let pixel = *image.get_pixel(sx as u32, sy as u32);
            image.put_pixel(x as u32, y as u32, pixel);
        }
    }
}
