//! Drop shadows built from eight border images.
//!
//! The images are packed into one atlas texture; [`Shadow::build_quads`]
//! lays out quads around the window sampling from that atlas.

use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::sync::Arc;

use drm_fourcc::DrmFourcc;
use image::{imageops, RgbaImage};
use tracing::{debug, warn};

use crate::buffer::{ImportError, ShmImage, Texture, TextureImporter};
use crate::geometry::{Rectangle, Region, Size};
use crate::quads::{ShadowElement, WindowQuad, WindowQuadList, WindowQuadType};

/// Windows smaller than this in either direction get no shadow.
pub const MIN_SHADOW_WINDOW_SIZE: i32 = 5;

const ELEMENTS: [ShadowElement; 8] = [
    ShadowElement::Top,
    ShadowElement::TopRight,
    ShadowElement::Right,
    ShadowElement::BottomRight,
    ShadowElement::Bottom,
    ShadowElement::BottomLeft,
    ShadowElement::Left,
    ShadowElement::TopLeft,
];

fn index(element: ShadowElement) -> usize {
    match element {
        ShadowElement::Top => 0,
        ShadowElement::TopRight => 1,
        ShadowElement::Right => 2,
        ShadowElement::BottomRight => 3,
        ShadowElement::Bottom => 4,
        ShadowElement::BottomLeft => 5,
        ShadowElement::Left => 6,
        ShadowElement::TopLeft => 7,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Margins {
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
    pub left: i32,
}

/// A shadow image shared between all windows using the same decoration theme.
#[derive(Debug)]
pub struct DecorationShadow {
    pub id: u64,
    pub image: RgbaImage,
    pub padding: Margins,
    /// Element geometry inside `image`, in [`ShadowElement`] order starting at `Top`.
    pub elements: [Rectangle; 8],
}

#[derive(Debug, Clone)]
pub enum ShadowSource {
    /// Eight images in [`ShadowElement`] order starting at `Top`.
    Elements {
        images: Box<[RgbaImage; 8]>,
        offsets: Margins,
    },
    Decoration(Rc<DecorationShadow>),
}

#[derive(Debug, thiserror::Error)]
pub enum ShadowError {
    #[error("shadow property needs 12 values, got {0}")]
    PropertyLength(usize),
    #[error("shadow pixmap {0:#x} could not be read")]
    MissingPixmap(u32),
    #[error("shadow atlas would be empty")]
    EmptyAtlas,
}

impl ShadowSource {
    /// Parses the twelve-cardinal X11 shadow property: eight pixmaps followed
    /// by the top, right, bottom and left offsets.
    pub fn from_x11_property(
        data: &[u32],
        mut fetch: impl FnMut(u32) -> Option<RgbaImage>,
    ) -> Result<Self, ShadowError> {
        if data.len() != 12 {
            return Err(ShadowError::PropertyLength(data.len()));
        }
        let mut images: Vec<RgbaImage> = Vec::with_capacity(8);
        for pixmap in &data[..8] {
            images.push(fetch(*pixmap).ok_or(ShadowError::MissingPixmap(*pixmap))?);
        }
        let images: [RgbaImage; 8] = images
            .try_into()
            .map_err(|_| ShadowError::PropertyLength(data.len()))?;
        Ok(ShadowSource::Elements {
            images: Box::new(images),
            offsets: Margins {
                top: data[8] as i32,
                right: data[9] as i32,
                bottom: data[10] as i32,
                left: data[11] as i32,
            },
        })
    }

    /// Generated shadow fading out linearly over `radius` pixels.
    pub fn gradient(radius: u32, color: [u8; 4]) -> Self {
        let radius = radius.max(1);
        let fade = |distance: f64| -> image::Rgba<u8> {
            let strength = (1.0 - distance / radius as f64).clamp(0.0, 1.0);
            let alpha = (color[3] as f64 * strength * strength).round() as u8;
            image::Rgba([color[0], color[1], color[2], alpha])
        };
        let edge = |horizontal: bool, inward: bool| {
            let (w, h) = if horizontal { (1, radius) } else { (radius, 1) };
            RgbaImage::from_fn(w, h, |x, y| {
                let along = if horizontal { y } else { x };
                let distance = if inward { along } else { radius - 1 - along };
                fade(distance as f64)
            })
        };
        let corner = |flip_x: bool, flip_y: bool| {
            RgbaImage::from_fn(radius, radius, |x, y| {
                let dx = (if flip_x { x } else { radius - 1 - x }) as f64;
                let dy = (if flip_y { y } else { radius - 1 - y }) as f64;
                fade((dx * dx + dy * dy).sqrt())
            })
        };
        let offset = radius as i32;
        ShadowSource::Elements {
            images: Box::new([
                edge(true, false),
                corner(true, false),
                edge(false, true),
                corner(true, true),
                edge(true, true),
                corner(false, true),
                edge(false, false),
                corner(false, false),
            ]),
            offsets: Margins {
                top: offset,
                right: offset,
                bottom: offset,
                left: offset,
            },
        }
    }

    fn element_size(&self, element: ShadowElement) -> Size {
        match self {
            ShadowSource::Elements { images, .. } => {
                let image = &images[index(element)];
                Size::new(image.width() as i32, image.height() as i32)
            }
            ShadowSource::Decoration(shadow) => shadow.elements[index(element)].size,
        }
    }

    fn offsets(&self) -> Margins {
        match self {
            ShadowSource::Elements { offsets, .. } => *offsets,
            ShadowSource::Decoration(shadow) => shadow.padding,
        }
    }
}

/// Textures of decoration shadows, shared by every window using the same theme shadow.
#[derive(Debug, Default)]
pub struct DecorationShadowCache {
    textures: HashMap<u64, Weak<Texture>>,
}

impl DecorationShadowCache {
    pub fn texture(
        &mut self,
        shadow: &DecorationShadow,
        importer: &mut dyn TextureImporter,
    ) -> Result<Rc<Texture>, ImportError> {
        if let Some(texture) = self.textures.get(&shadow.id).and_then(Weak::upgrade) {
            return Ok(texture);
        }
        let texture = Rc::new(upload_image(&shadow.image, importer)?);
        self.textures.insert(shadow.id, Rc::downgrade(&texture));
        Ok(texture)
    }

    /// Forgets entries whose texture is no longer used by any shadow.
    pub fn purge(&mut self) {
        self.textures.retain(|_, texture| texture.strong_count() > 0);
    }

    pub fn len(&self) -> usize {
        self.textures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.textures.is_empty()
    }
}

pub(crate) fn upload_image(
    image: &RgbaImage,
    importer: &mut dyn TextureImporter,
) -> Result<Texture, ImportError> {
    let size = Size::new(image.width() as i32, image.height() as i32);
    let shm = ShmImage {
        size,
        stride: image.width() * 4,
        // RGBA byte order is ABGR8888 in little-endian fourcc terms.
        format: DrmFourcc::Abgr8888,
        scale: 1,
        data: Arc::from(image.as_raw().as_slice()),
    };
    let mut texture = importer.import_shm(&shm)?;
    texture.set_y_inverted(true);
    Ok(texture)
}

#[derive(Debug)]
pub struct Shadow {
    source: ShadowSource,
    offsets: Margins,
    atlas: Option<RgbaImage>,
    atlas_size: Size,
    texture: Option<Rc<Texture>>,
    quads: WindowQuadList,
    region: Region,
    cached_size: Size,
}

impl Shadow {
    /// Builds the shadow for a window of `window_size`.
    pub fn new(source: ShadowSource, window_size: Size) -> Result<Self, ShadowError> {
        let mut shadow = Shadow {
            offsets: source.offsets(),
            source,
            atlas: None,
            atlas_size: Size::default(),
            texture: None,
            quads: WindowQuadList::new(),
            region: Region::new(),
            cached_size: window_size,
        };
        shadow.prepare_atlas()?;
        shadow.update_region(window_size);
        shadow.build_quads(window_size);
        Ok(shadow)
    }

    pub fn quads(&self) -> &WindowQuadList {
        &self.quads
    }

    /// Area covered by the shadow, window-local.
    pub fn region(&self) -> &Region {
        &self.region
    }

    pub fn offsets(&self) -> Margins {
        self.offsets
    }

    pub fn atlas_size(&self) -> Size {
        self.atlas_size
    }

    /// Rebuilds region and quads when the window size changed.
    pub fn geometry_changed(&mut self, window_size: Size) {
        if self.cached_size == window_size {
            return;
        }
        self.cached_size = window_size;
        self.update_region(window_size);
        self.build_quads(window_size);
    }

    /// Forgets the uploaded texture, e.g. after the GPU context was lost.
    pub fn release_texture(&mut self) {
        self.texture = None;
    }

    pub fn texture(
        &mut self,
        importer: &mut dyn TextureImporter,
        cache: &mut DecorationShadowCache,
    ) -> Option<Rc<Texture>> {
        if self.texture.is_none() {
            let result = match &self.source {
                ShadowSource::Decoration(shadow) => cache.texture(shadow, importer),
                ShadowSource::Elements { .. } => match &self.atlas {
                    Some(atlas) => upload_image(atlas, importer).map(Rc::new),
                    None => return None,
                },
            };
            match result {
                Ok(texture) => self.texture = Some(texture),
                Err(err) => {
                    debug!("Failed to upload shadow texture: {err}");
                    return None;
                }
            }
        }
        self.texture.clone()
    }

    fn sizes(&self) -> [Size; 8] {
        ELEMENTS.map(|element| self.source.element_size(element))
    }

    fn prepare_atlas(&mut self) -> Result<(), ShadowError> {
        let [top, top_right, right, bottom_right, bottom, bottom_left, left, top_left] =
            self.sizes();

        let inner_left = top_left.w.max(left.w).max(bottom_left.w);
        let inner_top = top_left.h.max(top.h).max(top_right.h);
        let width = inner_left + top.w.max(bottom.w) + top_right.w.max(right.w).max(bottom_right.w);
        let height =
            inner_top + left.h.max(right.h) + bottom_left.h.max(bottom.h).max(bottom_right.h);

        if width <= 0 || height <= 0 {
            warn!("Not building a shadow with an empty atlas");
            return Err(ShadowError::EmptyAtlas);
        }
        self.atlas_size = Size::new(width, height);

        let ShadowSource::Elements { images, .. } = &self.source else {
            return Ok(());
        };

        let mut atlas = RgbaImage::new(width as u32, height as u32);
        let place = |atlas: &mut RgbaImage, element: ShadowElement, x: i32, y: i32| {
            imageops::replace(atlas, &images[index(element)], x as i64, y as i64);
        };
        place(&mut atlas, ShadowElement::TopLeft, 0, 0);
        place(&mut atlas, ShadowElement::Top, inner_left, 0);
        place(&mut atlas, ShadowElement::TopRight, width - top_right.w, 0);
        place(&mut atlas, ShadowElement::Left, 0, inner_top);
        place(&mut atlas, ShadowElement::Right, width - right.w, inner_top);
        place(&mut atlas, ShadowElement::BottomLeft, 0, height - bottom_left.h);
        place(&mut atlas, ShadowElement::Bottom, inner_left, height - bottom.h);
        place(
            &mut atlas,
            ShadowElement::BottomRight,
            width - bottom_right.w,
            height - bottom_right.h,
        );
        self.atlas = Some(atlas);
        Ok(())
    }

    fn update_region(&mut self, size: Size) {
        let Margins {
            top,
            right,
            bottom,
            left,
        } = self.offsets;
        self.region = [
            Rectangle::new(0, -top, size.w, top),
            Rectangle::new(size.w, -top, right, size.h + top + bottom),
            Rectangle::new(0, size.h, size.w, bottom),
            Rectangle::new(-left, -top, left, size.h + top + bottom),
        ]
        .into_iter()
        .collect();
    }

    /// Lays out up to eight quads around a window of `size`.
    pub fn build_quads(&mut self, size: Size) {
        profiling::scope!("shadow_build_quads");
        self.quads.clear();
        if size.w < MIN_SHADOW_WINDOW_SIZE || size.h < MIN_SHADOW_WINDOW_SIZE {
            self.region.clear();
            return;
        }
        if self.region.is_empty() {
            self.update_region(size);
        }

        let [top, top_right, right, bottom_right, bottom, bottom_left, left, top_left] =
            self.sizes();
        let m_left = top_left.w.max(left.w).max(bottom_left.w) as f64;
        let m_top = top_left.h.max(top.h).max(top_right.h) as f64;
        let m_right = top_right.w.max(right.w).max(bottom_right.w) as f64;
        let m_bottom = bottom_right.h.max(bottom.h).max(bottom_left.h) as f64;

        let outer = RectF::new(
            -self.offsets.left as f64,
            -self.offsets.top as f64,
            size.w as f64 + self.offsets.right as f64,
            size.h as f64 + self.offsets.bottom as f64,
        );
        let width = (self.atlas_size.w as f64).max(1.0);
        let height = (self.atlas_size.h as f64).max(1.0);

        let corner = |element: Size, x: f64, y: f64, fallback: (f64, f64)| {
            if element.is_empty() {
                RectF::new(fallback.0, fallback.1, fallback.0, fallback.1)
            } else {
                RectF::new(x, y, x + element.w as f64, y + element.h as f64)
            }
        };
        let mut tl = corner(
            top_left,
            outer.x1,
            outer.y1,
            (outer.x1 + m_left, outer.y1 + m_top),
        );
        let mut tr = corner(
            top_right,
            outer.x2 - top_right.w as f64,
            outer.y1,
            (outer.x2 - m_right, outer.y1 + m_top),
        );
        let mut br = corner(
            bottom_right,
            outer.x2 - bottom_right.w as f64,
            outer.y2 - bottom_right.h as f64,
            (outer.x2 - m_right, outer.y2 - m_bottom),
        );
        let mut bl = corner(
            bottom_left,
            outer.x1,
            outer.y2 - bottom_left.h as f64,
            (outer.x1 + m_left, outer.y2 - m_bottom),
        );

        distribute_horizontally(&mut tl, &mut tr);
        distribute_horizontally(&mut bl, &mut br);
        distribute_vertically(&mut tl, &mut bl);
        distribute_vertically(&mut tr, &mut br);

        let mut push = |element: ShadowElement, rect: &RectF, tex: (f64, f64, f64, f64)| {
            if !rect.is_valid() {
                return;
            }
            self.quads.push(WindowQuad::from_rect(
                WindowQuadType::Shadow(element),
                0,
                (rect.x1, rect.y1, rect.x2, rect.y2),
                (tex.0 * width, tex.1 * height, tex.2 * width, tex.3 * height),
            ));
        };

        push(
            ShadowElement::TopLeft,
            &tl,
            (0.0, 0.0, tl.width() / width, tl.height() / height),
        );
        push(
            ShadowElement::TopRight,
            &tr,
            (1.0 - tr.width() / width, 0.0, 1.0, tr.height() / height),
        );
        push(
            ShadowElement::BottomRight,
            &br,
            (1.0 - br.width() / width, 1.0 - br.height() / height, 1.0, 1.0),
        );
        push(
            ShadowElement::BottomLeft,
            &bl,
            (0.0, 1.0 - bl.height() / height, bl.width() / width, 1.0),
        );

        let mut top_rect = RectF::new(tl.x2, outer.y1, tr.x1, outer.y1 + top.h as f64);
        let mut right_rect = RectF::new(outer.x2 - right.w as f64, tr.y2, outer.x2, br.y1);
        let mut bottom_rect = RectF::new(bl.x2, outer.y2 - bottom.h as f64, br.x1, outer.y2);
        let mut left_rect = RectF::new(outer.x1, tl.y2, outer.x1 + left.w as f64, bl.y1);

        distribute_horizontally(&mut left_rect, &mut right_rect);
        distribute_vertically(&mut top_rect, &mut bottom_rect);

        let tx1 = m_left / width;
        push(
            ShadowElement::Top,
            &top_rect,
            (tx1, 0.0, tx1 + top.w as f64 / width, top_rect.height() / height),
        );
        let ty1 = m_top / height;
        push(
            ShadowElement::Right,
            &right_rect,
            (
                1.0 - right_rect.width() / width,
                ty1,
                1.0,
                ty1 + right.h as f64 / height,
            ),
        );
        push(
            ShadowElement::Bottom,
            &bottom_rect,
            (
                tx1,
                1.0 - bottom_rect.height() / height,
                tx1 + bottom.w as f64 / width,
                1.0,
            ),
        );
        push(
            ShadowElement::Left,
            &left_rect,
            (0.0, ty1, left_rect.width() / width, ty1 + left.h as f64 / height),
        );
    }
}

#[derive(Debug, Clone, Copy)]
struct RectF {
    x1: f64,
    y1: f64,
    x2: f64,
    y2: f64,
}

impl RectF {
    fn new(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Self { x1, y1, x2, y2 }
    }

    fn width(&self) -> f64 {
        self.x2 - self.x1
    }

    fn height(&self) -> f64 {
        self.y2 - self.y1
    }

    fn is_valid(&self) -> bool {
        self.width() > 0.0 && self.height() > 0.0
    }
}

/// Splits the horizontal overlap of two tiles evenly between them.
fn distribute_horizontally(left: &mut RectF, right: &mut RectF) {
    if left.x2 > right.x1 {
        let bounded_right = left.x2.min(right.x2);
        let bounded_left = left.x1.max(right.x1);
        let half = (bounded_right - bounded_left) / 2.0;
        left.x2 = bounded_right - half;
        right.x1 = bounded_left + half;
    }
}

fn distribute_vertically(top: &mut RectF, bottom: &mut RectF) {
    if top.y2 > bottom.y1 {
        let bounded_bottom = top.y2.min(bottom.y2);
        let bounded_top = top.y1.max(bottom.y1);
        let half = (bounded_bottom - bounded_top) / 2.0;
        top.y2 = bounded_bottom - half;
        bottom.y1 = bounded_top + half;
    }
}
