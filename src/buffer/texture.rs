use std::sync::mpsc::Sender;

use drm_fourcc::DrmFourcc;
use thiserror::Error;

use super::{Dmabuf, Framebuffer, ShmImage};
use crate::geometry::{Rectangle, Size};

/// Backend-specific texture name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureId(pub u64);

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("unsupported pixel format {0:?}")]
    UnsupportedFormat(DrmFourcc),
    #[error("buffer has an empty size {0:?}")]
    EmptyBuffer(Size),
    #[error("shm buffer is too small: expected {expected} bytes, got {actual}")]
    TruncatedBuffer { expected: usize, actual: usize },
    #[error("dmabuf import failed: {0}")]
    Dmabuf(String),
    #[error("framebuffer has no texture attached")]
    NoFramebufferTexture,
    #[error("gpu context lost")]
    ContextLost,
}

/// A texture owned by a [`TextureImporter`].
///
/// Dropping an owned texture queues its name for destruction; the importer
/// frees queued names on [`TextureImporter::cleanup_texture_cache`], with its
/// context current.
#[derive(Debug)]
pub struct Texture {
    id: TextureId,
    size: Size,
    format: Option<DrmFourcc>,
    y_inverted: bool,
    release: Option<Sender<TextureId>>,
}

impl Texture {
    /// Creates a texture the importer will destroy once dropped.
    pub fn owned(id: TextureId, size: Size, format: DrmFourcc, release: Sender<TextureId>) -> Self {
        Self {
            id,
            size,
            format: Some(format),
            y_inverted: true,
            release: Some(release),
        }
    }

    /// Wraps a texture name owned by someone else, e.g. a framebuffer.
    pub fn borrowed(id: TextureId, size: Size) -> Self {
        Self {
            id,
            size,
            format: None,
            y_inverted: false,
            release: None,
        }
    }

    pub fn id(&self) -> TextureId {
        self.id
    }

    pub fn size(&self) -> Size {
        self.size
    }

    pub fn format(&self) -> Option<DrmFourcc> {
        self.format
    }

    /// Whether row zero of the texture is the top of the image.
    pub fn is_y_inverted(&self) -> bool {
        self.y_inverted
    }

    pub fn set_y_inverted(&mut self, inverted: bool) {
        self.y_inverted = inverted;
    }
}

impl Drop for Texture {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            let _ = release.send(self.id);
        }
    }
}

/// Turns pixel sources into textures.
///
/// Calls must happen with the importer's context current.
pub trait TextureImporter {
    /// Uploads a whole shared-memory image into a new texture.
    fn import_shm(&mut self, image: &ShmImage) -> Result<Texture, ImportError>;

    /// Re-uploads `damage` (buffer pixel coordinates) of `image` into `texture`.
    fn update_shm(
        &mut self,
        texture: &mut Texture,
        image: &ShmImage,
        damage: &[Rectangle],
    ) -> Result<(), ImportError>;

    /// Zero-copy import of a dmabuf.
    fn import_dmabuf(&mut self, dmabuf: &Dmabuf) -> Result<Texture, ImportError>;

    /// Reuses the texture attached to an internal framebuffer.
    fn import_framebuffer(&mut self, framebuffer: &Framebuffer) -> Result<Texture, ImportError> {
        if framebuffer.size.is_empty() {
            return Err(ImportError::EmptyBuffer(framebuffer.size));
        }
        Ok(Texture::borrowed(framebuffer.texture, framebuffer.size))
    }

    /// Destroys textures released since the last call.
    fn cleanup_texture_cache(&mut self);
}

/// Formats accepted for shared-memory uploads.
pub const SHM_FORMATS: &[DrmFourcc] = &[
    DrmFourcc::Argb8888,
    DrmFourcc::Xrgb8888,
    DrmFourcc::Abgr8888,
    DrmFourcc::Xbgr8888,
];

pub fn is_shm_format_supported(format: DrmFourcc) -> bool {
    SHM_FORMATS.contains(&format)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;

    #[test]
    fn test_owned_texture_released_on_drop() {
        let (tx, rx) = channel();
        let texture = Texture::owned(TextureId(7), Size::new(4, 4), DrmFourcc::Argb8888, tx);
        assert!(rx.try_recv().is_err());
        drop(texture);
        assert_eq!(rx.try_recv().ok(), Some(TextureId(7)));
    }

    #[test]
    fn test_borrowed_texture_is_never_released() {
        let texture = Texture::borrowed(TextureId(3), Size::new(4, 4));
        assert!(!texture.is_y_inverted());
        drop(texture);
    }

    #[test]
    fn test_shm_format_support() {
        assert!(is_shm_format_supported(DrmFourcc::Xrgb8888));
        assert!(!is_shm_format_supported(DrmFourcc::Nv12));
    }
}
