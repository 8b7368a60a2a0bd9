//! Integer geometry used for damage, clip and repaint bookkeeping.
//!
//! A [`Region`] is a set of disjoint rectangles. Operations keep that
//! invariant, so the area of a region is the sum of its rectangles' areas.

use std::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, Sub, SubAssign};

/// Half extent of the "infinite" region used while the screen is transformed.
const INFINITE_EXTENT: i32 = 1 << 29;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

impl std::ops::Add for Point {
    type Output = Point;
    fn add(self, rhs: Point) -> Point {
        Point::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl std::ops::Sub for Point {
    type Output = Point;
    fn sub(self, rhs: Point) -> Point {
        Point::new(self.x - rhs.x, self.y - rhs.y)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Size {
    pub w: i32,
    pub h: i32,
}

impl Size {
    pub const fn new(w: i32, h: i32) -> Self {
        Self { w, h }
    }

    pub fn is_empty(&self) -> bool {
        self.w <= 0 || self.h <= 0
    }

    pub fn scaled(&self, scale: f64) -> Size {
        Size::new(
            (self.w as f64 * scale).round() as i32,
            (self.h as f64 * scale).round() as i32,
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Rectangle {
    pub loc: Point,
    pub size: Size,
}

impl Rectangle {
    pub const fn new(x: i32, y: i32, w: i32, h: i32) -> Self {
        Self {
            loc: Point::new(x, y),
            size: Size::new(w, h),
        }
    }

    pub const fn from_loc_and_size(loc: Point, size: Size) -> Self {
        Self { loc, size }
    }

    /// Builds the rectangle spanning two corners, `(x1, y1)` inclusive and `(x2, y2)` exclusive.
    pub fn from_extremities(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self::new(x1, y1, x2 - x1, y2 - y1)
    }

    pub fn is_empty(&self) -> bool {
        self.size.is_empty()
    }

    pub fn left(&self) -> i32 {
        self.loc.x
    }

    pub fn top(&self) -> i32 {
        self.loc.y
    }

    pub fn right(&self) -> i32 {
        self.loc.x + self.size.w
    }

    pub fn bottom(&self) -> i32 {
        self.loc.y + self.size.h
    }

    pub fn area(&self) -> i64 {
        if self.is_empty() {
            0
        } else {
            self.size.w as i64 * self.size.h as i64
        }
    }

    pub fn contains(&self, point: Point) -> bool {
        point.x >= self.left()
            && point.x < self.right()
            && point.y >= self.top()
            && point.y < self.bottom()
    }

    pub fn contains_rect(&self, other: &Rectangle) -> bool {
        other.is_empty()
            || (other.left() >= self.left()
                && other.top() >= self.top()
                && other.right() <= self.right()
                && other.bottom() <= self.bottom())
    }

    pub fn overlaps(&self, other: &Rectangle) -> bool {
        self.intersection(other).is_some()
    }

    pub fn intersection(&self, other: &Rectangle) -> Option<Rectangle> {
        let left = self.left().max(other.left());
        let top = self.top().max(other.top());
        let right = self.right().min(other.right());
        let bottom = self.bottom().min(other.bottom());
        let rect = Rectangle::from_extremities(left, top, right, bottom);
        (!rect.is_empty()).then_some(rect)
    }

    /// Smallest rectangle containing both; empty inputs are ignored.
    pub fn merge(&self, other: &Rectangle) -> Rectangle {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        Rectangle::from_extremities(
            self.left().min(other.left()),
            self.top().min(other.top()),
            self.right().max(other.right()),
            self.bottom().max(other.bottom()),
        )
    }

    pub fn translated(&self, offset: Point) -> Rectangle {
        Rectangle::from_loc_and_size(self.loc + offset, self.size)
    }

    /// Scales every edge, rounding outwards so the result covers the scaled area.
    pub fn scaled(&self, scale: f64) -> Rectangle {
        let left = (self.left() as f64 * scale).floor() as i32;
        let top = (self.top() as f64 * scale).floor() as i32;
        let right = (self.right() as f64 * scale).ceil() as i32;
        let bottom = (self.bottom() as f64 * scale).ceil() as i32;
        Rectangle::from_extremities(left, top, right, bottom)
    }

    /// Grows (or shrinks, with negative values) every edge.
    pub fn adjusted(&self, left: i32, top: i32, right: i32, bottom: i32) -> Rectangle {
        Rectangle::from_extremities(
            self.left() - left,
            self.top() - top,
            self.right() + right,
            self.bottom() + bottom,
        )
    }

    /// Returns the parts of `self` not covered by `other`, at most four disjoint pieces.
    pub fn subtract_rect(&self, other: &Rectangle) -> Vec<Rectangle> {
        let Some(inter) = self.intersection(other) else {
            return if self.is_empty() { Vec::new() } else { vec![*self] };
        };

        let mut pieces = Vec::with_capacity(4);
        if inter.top() > self.top() {
            pieces.push(Rectangle::from_extremities(
                self.left(),
                self.top(),
                self.right(),
                inter.top(),
            ));
        }
        if inter.bottom() < self.bottom() {
            pieces.push(Rectangle::from_extremities(
                self.left(),
                inter.bottom(),
                self.right(),
                self.bottom(),
            ));
        }
        if inter.left() > self.left() {
            pieces.push(Rectangle::from_extremities(
                self.left(),
                inter.top(),
                inter.left(),
                inter.bottom(),
            ));
        }
        if inter.right() < self.right() {
            pieces.push(Rectangle::from_extremities(
                inter.right(),
                inter.top(),
                self.right(),
                inter.bottom(),
            ));
        }
        pieces
    }
}

#[derive(Debug, Clone, Default)]
pub struct Region {
    rects: Vec<Rectangle>,
}

impl Region {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_rect(rect: Rectangle) -> Self {
        let mut region = Region::new();
        region.add_rect(rect);
        region
    }

    /// A region covering any realistic screen space.
    pub fn infinite() -> Self {
        Region::from_rect(Rectangle::new(
            -INFINITE_EXTENT,
            -INFINITE_EXTENT,
            2 * INFINITE_EXTENT,
            2 * INFINITE_EXTENT,
        ))
    }

    pub fn is_empty(&self) -> bool {
        self.rects.is_empty()
    }

    pub fn rects(&self) -> &[Rectangle] {
        &self.rects
    }

    pub fn area(&self) -> i64 {
        self.rects.iter().map(Rectangle::area).sum()
    }

    pub fn bounding_rect(&self) -> Rectangle {
        self.rects
            .iter()
            .fold(Rectangle::default(), |acc, rect| acc.merge(rect))
    }

    pub fn contains(&self, point: Point) -> bool {
        self.rects.iter().any(|rect| rect.contains(point))
    }

    pub fn contains_rect(&self, rect: &Rectangle) -> bool {
        Region::from_rect(*rect).subtract(self).is_empty()
    }

    pub fn intersects(&self, rect: &Rectangle) -> bool {
        self.rects.iter().any(|r| r.overlaps(rect))
    }

    /// True when the region covers exactly `rect`.
    pub fn equals_rect(&self, rect: &Rectangle) -> bool {
        *self == Region::from_rect(*rect)
    }

    pub fn add_rect(&mut self, rect: Rectangle) {
        if rect.is_empty() {
            return;
        }
        let mut pieces = vec![rect];
        for existing in &self.rects {
            pieces = pieces
                .into_iter()
                .flat_map(|piece| piece.subtract_rect(existing))
                .collect();
            if pieces.is_empty() {
                return;
            }
        }
        self.rects.extend(pieces);
    }

    pub fn union(&self, other: &Region) -> Region {
        let mut result = self.clone();
        for rect in &other.rects {
            result.add_rect(*rect);
        }
        result
    }

    pub fn subtract(&self, other: &Region) -> Region {
        let mut rects = self.rects.clone();
        for cut in &other.rects {
            rects = rects
                .into_iter()
                .flat_map(|rect| rect.subtract_rect(cut))
                .collect();
            if rects.is_empty() {
                break;
            }
        }
        Region { rects }
    }

    pub fn intersect(&self, other: &Region) -> Region {
        let rects = self
            .rects
            .iter()
            .flat_map(|a| other.rects.iter().filter_map(move |b| a.intersection(b)))
            .collect();
        Region { rects }
    }

    pub fn intersect_rect(&self, rect: &Rectangle) -> Region {
        let rects = self
            .rects
            .iter()
            .filter_map(|r| r.intersection(rect))
            .collect();
        Region { rects }
    }

    pub fn translated(&self, offset: Point) -> Region {
        Region {
            rects: self.rects.iter().map(|r| r.translated(offset)).collect(),
        }
    }

    pub fn scaled(&self, scale: f64) -> Region {
        self.rects.iter().map(|r| r.scaled(scale)).collect()
    }

    pub fn clear(&mut self) {
        self.rects.clear();
    }
}

impl PartialEq for Region {
    fn eq(&self, other: &Self) -> bool {
        self.area() == other.area()
            && self.subtract(other).is_empty()
            && other.subtract(self).is_empty()
    }
}

impl Eq for Region {}

impl From<Rectangle> for Region {
    fn from(rect: Rectangle) -> Self {
        Region::from_rect(rect)
    }
}

impl FromIterator<Rectangle> for Region {
    fn from_iter<T: IntoIterator<Item = Rectangle>>(iter: T) -> Self {
        let mut region = Region::new();
        for rect in iter {
            region.add_rect(rect);
        }
        region
    }
}

impl BitOr<&Region> for &Region {
    type Output = Region;
    fn bitor(self, rhs: &Region) -> Region {
        self.union(rhs)
    }
}

impl BitOrAssign<&Region> for Region {
    fn bitor_assign(&mut self, rhs: &Region) {
        for rect in &rhs.rects {
            self.add_rect(*rect);
        }
    }
}

impl BitAnd<&Region> for &Region {
    type Output = Region;
    fn bitand(self, rhs: &Region) -> Region {
        self.intersect(rhs)
    }
}

impl BitAndAssign<&Region> for Region {
    fn bitand_assign(&mut self, rhs: &Region) {
        *self = self.intersect(rhs);
    }
}

impl Sub<&Region> for &Region {
    type Output = Region;
    fn sub(self, rhs: &Region) -> Region {
        self.subtract(rhs)
    }
}

impl SubAssign<&Region> for Region {
    fn sub_assign(&mut self, rhs: &Region) {
        *self = self.subtract(rhs);
    }
}
