//! Data records passed through the paint passes.

use bitflags::bitflags;
use cgmath::{Deg, Matrix4, SquareMatrix, Vector3};

use crate::geometry::Region;
use crate::quads::WindowQuadList;

bitflags! {
    /// How a window or the screen is going to be painted.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PaintMask: u32 {
        const WINDOW_OPAQUE = 1 << 0;
        const WINDOW_TRANSLUCENT = 1 << 1;
        const WINDOW_TRANSFORMED = 1 << 2;
        /// Only the paint region of the screen needs painting.
        const SCREEN_REGION = 1 << 3;
        const SCREEN_TRANSFORMED = 1 << 4;
        const SCREEN_WITH_TRANSFORMED_WINDOWS = 1 << 5;
        const SCREEN_BACKGROUND_FIRST = 1 << 6;
        const WINDOW_LANCZOS = 1 << 8;
    }
}

impl PaintMask {
    pub fn is_screen_transformed(&self) -> bool {
        self.intersects(PaintMask::SCREEN_TRANSFORMED | PaintMask::SCREEN_WITH_TRANSFORMED_WINDOWS)
    }
}

bitflags! {
    /// Reasons a window is currently not painted.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PaintDisabled: u32 {
        /// Disabled on request, e.g. by an effect.
        const EXPLICIT = 1 << 0;
        const DELETED = 1 << 1;
        const DESKTOP = 1 << 2;
        const MINIMIZE = 1 << 3;
        const ACTIVITY = 1 << 4;
        /// Hidden for a reason not covered by the other bits.
        const UNSPECIFIED = 1 << 5;
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rotation {
    pub angle: Deg<f32>,
    pub axis: Vector3<f32>,
    /// Rotation origin relative to the painted item.
    pub origin: Vector3<f32>,
}

/// Scale, then rotation around an origin, then translation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    pub scale: Vector3<f32>,
    pub translation: Vector3<f32>,
    pub rotation: Option<Rotation>,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            scale: Vector3::new(1.0, 1.0, 1.0),
            translation: Vector3::new(0.0, 0.0, 0.0),
            rotation: None,
        }
    }
}

impl Transform {
    pub fn is_identity(&self) -> bool {
        *self == Transform::default()
    }

    pub fn matrix(&self) -> Matrix4<f32> {
        let scale = Matrix4::from_nonuniform_scale(self.scale.x, self.scale.y, self.scale.z);
        let rotation = match self.rotation {
            Some(rotation) if rotation.angle != Deg(0.0) => {
                Matrix4::from_translation(rotation.origin)
                    * Matrix4::from_axis_angle(rotation.axis, rotation.angle)
                    * Matrix4::from_translation(-rotation.origin)
            }
            _ => Matrix4::identity(),
        };
        Matrix4::from_translation(self.translation) * rotation * scale
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScreenPrePaintData {
    pub mask: PaintMask,
    pub paint: Region,
}

#[derive(Debug, Clone, Default)]
pub struct WindowPrePaintData {
    pub mask: PaintMask,
    /// Region the window will paint, global coordinates.
    pub paint: Region,
    /// Region the window covers opaquely.
    pub clip: Region,
    pub quads: WindowQuadList,
    pub disabled: PaintDisabled,
}

impl WindowPrePaintData {
    /// The window will be painted with translucency, so it occludes nothing.
    pub fn set_translucent(&mut self) {
        self.mask |= PaintMask::WINDOW_TRANSLUCENT;
        self.mask.remove(PaintMask::WINDOW_OPAQUE);
        self.clip.clear();
    }

    pub fn set_transformed(&mut self) {
        self.mask |= PaintMask::WINDOW_TRANSFORMED;
    }

    pub fn enable_painting(&mut self, reason: PaintDisabled) {
        self.disabled.remove(reason);
    }

    pub fn disable_painting(&mut self, reason: PaintDisabled) {
        self.disabled.insert(reason);
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScreenPaintData {
    pub transform: Transform,
}

#[derive(Debug, Clone)]
pub struct WindowPaintData {
    pub opacity: f64,
    pub saturation: f64,
    pub brightness: f64,
    pub transform: Transform,
    pub quads: WindowQuadList,
    /// Progress of a cross-fade from the previous content, 1 when none is running.
    pub cross_fade_progress: f64,
    pub shader: Option<u32>,
}

impl WindowPaintData {
    pub fn new(opacity: f64, quads: WindowQuadList) -> Self {
        Self {
            opacity,
            saturation: 1.0,
            brightness: 1.0,
            transform: Transform::default(),
            quads,
            cross_fade_progress: 1.0,
            shader: None,
        }
    }

    pub fn multiply_opacity(&mut self, factor: f64) -> f64 {
        self.opacity = (self.opacity * factor).clamp(0.0, 1.0);
        self.opacity
    }

    pub fn multiply_brightness(&mut self, factor: f64) -> f64 {
        self.brightness *= factor;
        self.brightness
    }

    pub fn multiply_saturation(&mut self, factor: f64) -> f64 {
        self.saturation *= factor;
        self.saturation
    }

    pub fn set_cross_fade_progress(&mut self, progress: f64) {
        self.cross_fade_progress = progress.clamp(0.0, 1.0);
    }

    pub fn is_transformed(&self) -> bool {
        !self.transform.is_identity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cgmath::{Transform as _, Point3};

    #[test]
    fn test_translucent_drops_clip() {
        let mut data = WindowPrePaintData {
            mask: PaintMask::WINDOW_OPAQUE,
            clip: Region::from_rect(crate::geometry::Rectangle::new(0, 0, 10, 10)),
            ..Default::default()
        };
        data.set_translucent();
        assert_eq!(data.mask, PaintMask::WINDOW_TRANSLUCENT);
        assert!(data.clip.is_empty());
    }

    #[test]
    fn test_transform_applies_scale_before_translation() {
        let transform = Transform {
            scale: Vector3::new(2.0, 2.0, 1.0),
            translation: Vector3::new(10.0, 0.0, 0.0),
            rotation: None,
        };
        let point = transform.matrix().transform_point(Point3::new(1.0, 1.0, 0.0));
        assert_eq!(point, Point3::new(12.0, 2.0, 0.0));
        assert!(Transform::default().is_identity());
    }

    #[test]
    fn test_opacity_stays_in_range() {
        let mut data = WindowPaintData::new(0.8, WindowQuadList::new());
        assert_eq!(data.multiply_opacity(2.0), 1.0);
        data.set_cross_fade_progress(-1.0);
        assert_eq!(data.cross_fade_progress, 0.0);
    }
}
