//! Window geometry as textured quads.

use std::ops::{Deref, DerefMut};

use crate::geometry::{Rectangle, Region};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShadowElement {
    Top,
    TopRight,
    Right,
    BottomRight,
    Bottom,
    BottomLeft,
    Left,
    TopLeft,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WindowQuadType {
    Contents,
    Decoration,
    Shadow(ShadowElement),
}

impl WindowQuadType {
    pub fn is_shadow(&self) -> bool {
        matches!(self, WindowQuadType::Shadow(_))
    }
}

/// A vertex with its current position, the position it was built at and a
/// texture coordinate in texture pixels.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WindowVertex {
    pub px: f64,
    pub py: f64,
    ox: f64,
    oy: f64,
    pub tx: f64,
    pub ty: f64,
}

impl WindowVertex {
    pub fn new(x: f64, y: f64, tx: f64, ty: f64) -> Self {
        Self {
            px: x,
            py: y,
            ox: x,
            oy: y,
            tx,
            ty,
        }
    }

    pub fn original_x(&self) -> f64 {
        self.ox
    }

    pub fn original_y(&self) -> f64 {
        self.oy
    }

    pub fn is_transformed(&self) -> bool {
        self.px != self.ox || self.py != self.oy
    }
}

/// Four vertices in top-left, top-right, bottom-right, bottom-left order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowQuad {
    pub vertices: [WindowVertex; 4],
    pub kind: WindowQuadType,
    /// Content chain the quad belongs to; only meaningful for contents quads.
    pub id: u32,
    /// Texture axes are swapped, used by the rotated decoration parts.
    pub uv_swapped: bool,
}

impl WindowQuad {
    pub fn new(kind: WindowQuadType, id: u32, vertices: [WindowVertex; 4]) -> Self {
        Self {
            vertices,
            kind,
            id,
            uv_swapped: false,
        }
    }

    /// Axis-aligned quad covering `rect`, sampling `(u0, v0)..(u1, v1)`.
    pub fn from_rect(
        kind: WindowQuadType,
        id: u32,
        rect: (f64, f64, f64, f64),
        tex: (f64, f64, f64, f64),
    ) -> Self {
        let (x0, y0, x1, y1) = rect;
        let (u0, v0, u1, v1) = tex;
        Self::new(
            kind,
            id,
            [
                WindowVertex::new(x0, y0, u0, v0),
                WindowVertex::new(x1, y0, u1, v0),
                WindowVertex::new(x1, y1, u1, v1),
                WindowVertex::new(x0, y1, u0, v1),
            ],
        )
    }

    pub fn left(&self) -> f64 {
        self.vertices
            .iter()
            .map(|v| v.ox)
            .fold(f64::INFINITY, f64::min)
    }

    pub fn right(&self) -> f64 {
        self.vertices
            .iter()
            .map(|v| v.ox)
            .fold(f64::NEG_INFINITY, f64::max)
    }

    pub fn top(&self) -> f64 {
        self.vertices
            .iter()
            .map(|v| v.oy)
            .fold(f64::INFINITY, f64::min)
    }

    pub fn bottom(&self) -> f64 {
        self.vertices
            .iter()
            .map(|v| v.oy)
            .fold(f64::NEG_INFINITY, f64::max)
    }

    pub fn is_transformed(&self) -> bool {
        self.vertices.iter().any(WindowVertex::is_transformed)
    }

    /// Cuts out the part of an untransformed quad between the given original
    /// coordinates, interpolating texture coordinates.
    pub fn make_sub_quad(&self, x1: f64, y1: f64, x2: f64, y2: f64) -> WindowQuad {
        debug_assert!(!self.is_transformed());
        let (left, top) = (self.left(), self.top());
        let (width, height) = (self.right() - left, self.bottom() - top);
        let v0 = &self.vertices[0];
        let v2 = &self.vertices[2];

        let lerp = |a: f64, b: f64, t: f64| a + (b - a) * t;
        let tex = |x: f64, y: f64| {
            let fx = if width > 0.0 { (x - left) / width } else { 0.0 };
            let fy = if height > 0.0 { (y - top) / height } else { 0.0 };
            if self.uv_swapped {
                (lerp(v0.tx, v2.tx, fy), lerp(v0.ty, v2.ty, fx))
            } else {
                (lerp(v0.tx, v2.tx, fx), lerp(v0.ty, v2.ty, fy))
            }
        };

        let corner = |x: f64, y: f64| {
            let (tx, ty) = tex(x, y);
            WindowVertex::new(x, y, tx, ty)
        };
        WindowQuad {
            vertices: [corner(x1, y1), corner(x2, y1), corner(x2, y2), corner(x1, y2)],
            kind: self.kind,
            id: self.id,
            uv_swapped: self.uv_swapped,
        }
    }

    pub fn translate(&mut self, dx: f64, dy: f64) {
        for vertex in &mut self.vertices {
            vertex.px += dx;
            vertex.py += dy;
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WindowQuadList(Vec<WindowQuad>);

impl WindowQuadList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn select(&self, kind: WindowQuadType) -> WindowQuadList {
        self.0.iter().filter(|q| q.kind == kind).copied().collect()
    }

    pub fn filter_out(&self, kind: WindowQuadType) -> WindowQuadList {
        self.0.iter().filter(|q| q.kind != kind).copied().collect()
    }

    pub fn shadows(&self) -> WindowQuadList {
        self.0.iter().filter(|q| q.kind.is_shadow()).copied().collect()
    }

    pub fn is_transformed(&self) -> bool {
        self.0.iter().any(WindowQuad::is_transformed)
    }

    /// Clips every quad against `region`, given in the quads' coordinate space.
    pub fn clipped(&self, region: &Region) -> WindowQuadList {
        let mut out = WindowQuadList::new();
        for quad in &self.0 {
            let quad_rect = Rectangle::from_extremities(
                quad.left().floor() as i32,
                quad.top().floor() as i32,
                quad.right().ceil() as i32,
                quad.bottom().ceil() as i32,
            );
            for rect in region.rects() {
                if rect.contains_rect(&quad_rect) {
                    out.push(*quad);
                    break;
                }
                let x1 = quad.left().max(rect.left() as f64);
                let y1 = quad.top().max(rect.top() as f64);
                let x2 = quad.right().min(rect.right() as f64);
                let y2 = quad.bottom().min(rect.bottom() as f64);
                if x1 < x2 && y1 < y2 {
                    out.push(quad.make_sub_quad(x1, y1, x2, y2));
                }
            }
        }
        out
    }

    pub fn translate(&mut self, dx: f64, dy: f64) {
        for quad in &mut self.0 {
            quad.translate(dx, dy);
        }
    }

    /// Two triangles per quad, `[x, y, u, v]` per vertex, with texture
    /// coordinates normalized by `texture_size` and flipped for textures whose
    /// first row is the bottom of the image.
    pub fn interleaved_vertices(&self, texture_size: (f64, f64), y_inverted: bool) -> Vec<f32> {
        let (tw, th) = texture_size;
        let mut data = Vec::with_capacity(self.0.len() * 6 * 4);
        for quad in &self.0 {
            for index in [0usize, 1, 2, 0, 2, 3] {
                let vertex = &quad.vertices[index];
                let u = if tw > 0.0 { vertex.tx / tw } else { 0.0 };
                let mut v = if th > 0.0 { vertex.ty / th } else { 0.0 };
                if !y_inverted {
                    v = 1.0 - v;
                }
                data.extend_from_slice(&[vertex.px as f32, vertex.py as f32, u as f32, v as f32]);
            }
        }
        data
    }
}

impl Deref for WindowQuadList {
    type Target = Vec<WindowQuad>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for WindowQuadList {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl FromIterator<WindowQuad> for WindowQuadList {
    fn from_iter<T: IntoIterator<Item = WindowQuad>>(iter: T) -> Self {
        WindowQuadList(iter.into_iter().collect())
    }
}

impl IntoIterator for WindowQuadList {
    type Item = WindowQuad;
    type IntoIter = std::vec::IntoIter<WindowQuad>;
    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a WindowQuadList {
    type Item = &'a WindowQuad;
    type IntoIter = std::slice::Iter<'a, WindowQuad>;
    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
