//! Window buffers and their textures.
//!
//! A [`Buffer`] maps one pixel source (shm image, dmabuf, internal
//! framebuffer or internal image) onto a [`Texture`]. Windows keep a
//! [`BufferPair`]: the current buffer plus the previous one, which stays
//! alive while a cross-fade holds a [`PreviousBuffer`] handle to it.

use std::rc::{Rc, Weak};
use std::sync::Arc;

use drm_fourcc::DrmFourcc;
use tracing::{debug, trace};

use crate::geometry::{Rectangle, Region, Size};
use crate::toplevel::{Toplevel, WindowId};

pub mod texture;

pub use texture::{ImportError, Texture, TextureId, TextureImporter};

/// CPU-side pixels, either a client shm buffer or a compositor-rendered image.
#[derive(Debug, Clone)]
pub struct ShmImage {
    pub size: Size,
    pub stride: u32,
    pub format: DrmFourcc,
    /// Buffer scale; damage arrives in surface coordinates and is scaled by it.
    pub scale: i32,
    pub data: Arc<[u8]>,
}

impl ShmImage {
    pub fn required_len(&self) -> usize {
        self.stride as usize * self.size.h.max(0) as usize
    }

    /// ARGB8888 image filled with one RGBA colour.
    pub fn solid(size: Size, rgba: [u8; 4]) -> Self {
        let [r, g, b, a] = rgba;
        let pixels = size.w.max(0) as usize * size.h.max(0) as usize;
        let data: Vec<u8> = std::iter::repeat([b, g, r, a])
            .take(pixels)
            .flatten()
            .collect();
        Self {
            size,
            stride: size.w.max(0) as u32 * 4,
            format: DrmFourcc::Argb8888,
            scale: 1,
            data: data.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dmabuf {
    /// Identity of the exported buffer object, changes when the client attaches a new one.
    pub id: u64,
    pub size: Size,
    pub format: DrmFourcc,
    pub modifier: u64,
    /// Exporter flag: rows are stored bottom-up.
    pub y_inverted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Framebuffer {
    pub texture: TextureId,
    pub size: Size,
}

#[derive(Debug, Clone)]
pub enum BufferSource {
    Shm(ShmImage),
    Dmabuf(Dmabuf),
    Framebuffer(Framebuffer),
    InternalImage(ShmImage),
}

impl BufferSource {
    pub fn solid(size: Size, rgba: [u8; 4]) -> Self {
        BufferSource::Shm(ShmImage::solid(size, rgba))
    }

    pub fn size(&self) -> Size {
        match self {
            BufferSource::Shm(image) | BufferSource::InternalImage(image) => image.size,
            BufferSource::Dmabuf(dmabuf) => dmabuf.size,
            BufferSource::Framebuffer(fb) => fb.size,
        }
    }
}

/// One texture-importable pixel source of a window.
#[derive(Debug)]
pub struct Buffer {
    window: WindowId,
    source: Option<BufferSource>,
    texture: Option<Texture>,
    content_rect: Rectangle,
    discarded: bool,
}

impl Buffer {
    pub fn new(window: WindowId) -> Self {
        Self {
            window,
            source: None,
            texture: None,
            content_rect: Rectangle::default(),
            discarded: false,
        }
    }

    /// Fetches the window's pixel source. Returns immediately if already valid.
    pub fn create(&mut self, toplevel: &dyn Toplevel) {
        if self.is_valid() {
            return;
        }
        let Some(source) = toplevel.buffer_source() else {
            debug!(window = self.window, "no buffer attached yet");
            return;
        };
        let size = source.size();
        if size.is_empty() {
            debug!(window = self.window, ?size, "ignoring buffer with empty size");
            return;
        }
        self.content_rect = toplevel.content_rect();
        self.source = Some(source);
    }

    /// Picks up new contents committed to the same buffer. Discarded and
    /// invalid buffers are left alone.
    pub fn refresh(&mut self, toplevel: &dyn Toplevel) {
        if self.discarded || !self.is_valid() {
            return;
        }
        if let Some(source) = toplevel.buffer_source() {
            if !source.size().is_empty() {
                self.content_rect = toplevel.content_rect();
                self.source = Some(source);
            }
        }
    }

    pub fn is_valid(&self) -> bool {
        self.source.is_some()
    }

    pub fn is_discarded(&self) -> bool {
        self.discarded
    }

    /// The buffer was superseded; it stays alive for cross-fades only.
    pub fn mark_as_discarded(&mut self) {
        self.discarded = true;
    }

    pub fn size(&self) -> Size {
        self.source
            .as_ref()
            .map(BufferSource::size)
            .unwrap_or_default()
    }

    /// Area inside the buffer holding client content.
    pub fn content_rect(&self) -> Rectangle {
        self.content_rect
    }

    pub fn texture(&self) -> Option<&Texture> {
        self.texture.as_ref()
    }

    pub fn source(&self) -> Option<&BufferSource> {
        self.source.as_ref()
    }

    /// Makes the texture reflect the pixel source.
    ///
    /// With an existing texture only the `damage` region (surface coordinates)
    /// is re-uploaded; otherwise the whole source is loaded. A failed upload
    /// drops the texture so the next bind starts from scratch.
    pub fn bind(
        &mut self,
        importer: &mut dyn TextureImporter,
        damage: &Region,
    ) -> Result<Option<&Texture>, ImportError> {
        if self.discarded {
            return Ok(self.texture.as_ref());
        }
        let Some(source) = self.source.as_ref() else {
            return Ok(None);
        };

        let result = match self.texture.take() {
            Some(texture) if damage.is_empty() => Ok(texture),
            Some(texture) => update_texture(importer, texture, source, damage),
            None => load_texture(importer, source),
        };

        match result {
            Ok(texture) => {
                self.texture = Some(texture);
                Ok(self.texture.as_ref())
            }
            Err(err) => {
                self.source = None;
                Err(err)
            }
        }
    }
}

fn load_texture(
    importer: &mut dyn TextureImporter,
    source: &BufferSource,
) -> Result<Texture, ImportError> {
    profiling::scope!("load_texture");
    match source {
        BufferSource::Shm(image) | BufferSource::InternalImage(image) => {
            check_shm(image)?;
            let mut texture = importer.import_shm(image)?;
            texture.set_y_inverted(true);
            Ok(texture)
        }
        BufferSource::Dmabuf(dmabuf) => {
            let mut texture = importer.import_dmabuf(dmabuf)?;
            texture.set_y_inverted(!dmabuf.y_inverted);
            Ok(texture)
        }
        BufferSource::Framebuffer(fb) => {
            let mut texture = importer.import_framebuffer(fb)?;
            texture.set_y_inverted(false);
            Ok(texture)
        }
    }
}

fn update_texture(
    importer: &mut dyn TextureImporter,
    mut texture: Texture,
    source: &BufferSource,
    damage: &Region,
) -> Result<Texture, ImportError> {
    profiling::scope!("update_texture");
    match source {
        BufferSource::Shm(image) | BufferSource::InternalImage(image) => {
            if texture.size() != image.size {
                trace!(old = ?texture.size(), new = ?image.size, "shm size changed, reloading");
                drop(texture);
                return load_texture(importer, source);
            }
            check_shm(image)?;
            let bounds = Rectangle::from_loc_and_size(Default::default(), image.size);
            let rects: Vec<Rectangle> = damage
                .rects()
                .iter()
                .map(|rect| rect.scaled(image.scale as f64))
                .filter_map(|rect| rect.intersection(&bounds))
                .collect();
            importer.update_shm(&mut texture, image, &rects)?;
            Ok(texture)
        }
        BufferSource::Dmabuf(_) | BufferSource::Framebuffer(_) => {
            drop(texture);
            load_texture(importer, source)
        }
    }
}

fn check_shm(image: &ShmImage) -> Result<(), ImportError> {
    if !texture::is_shm_format_supported(image.format) {
        return Err(ImportError::UnsupportedFormat(image.format));
    }
    let expected = image.required_len();
    if image.data.len() < expected {
        return Err(ImportError::TruncatedBuffer {
            expected,
            actual: image.data.len(),
        });
    }
    Ok(())
}

/// Handle keeping a superseded buffer alive for a cross-fade.
///
/// Release it with [`PreviousBuffer::release`] once the cross-fade completes.
#[derive(Debug, Clone)]
pub struct PreviousBuffer(Rc<Buffer>);

impl PreviousBuffer {
    pub fn buffer(&self) -> &Buffer {
        &self.0
    }

    pub fn release(self) {}
}

/// Current buffer plus the superseded one kept for cross-fades.
#[derive(Debug, Default)]
pub struct BufferPair {
    current: Option<Buffer>,
    previous: Weak<Buffer>,
    /// The pair's own hold on the previous buffer, dropped once a new buffer is valid.
    discard_ref: Option<Rc<Buffer>>,
}

impl BufferPair {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<&Buffer> {
        self.current.as_ref()
    }

    pub fn current_mut(&mut self) -> Option<&mut Buffer> {
        self.current.as_mut()
    }

    pub fn previous(&self) -> Option<Rc<Buffer>> {
        self.previous.upgrade()
    }

    /// Creates the current buffer if needed and returns it when valid.
    pub fn update(&mut self, window: WindowId, toplevel: &dyn Toplevel) -> Option<&mut Buffer> {
        let buffer = self.current.get_or_insert_with(|| Buffer::new(window));
        if !buffer.is_valid() {
            buffer.create(toplevel);
            if buffer.is_valid() {
                self.discard_ref = None;
            }
        }
        self.current.as_mut().filter(|buffer| buffer.is_valid())
    }

    /// Supersedes the current buffer. A valid one becomes the previous buffer.
    pub fn discard(&mut self) {
        let Some(mut buffer) = self.current.take() else {
            return;
        };
        if !buffer.is_valid() {
            return;
        }
        buffer.mark_as_discarded();
        let buffer = Rc::new(buffer);
        self.previous = Rc::downgrade(&buffer);
        self.discard_ref = Some(buffer);
    }

    /// Takes a cross-fade reference on the previous buffer.
    pub fn reference_previous(&self) -> Option<PreviousBuffer> {
        self.previous.upgrade().map(PreviousBuffer)
    }

    /// Drops the pair's own reference on the previous buffer.
    pub fn unreference_previous(&mut self) {
        self.discard_ref = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::HeadlessImporter;
    use crate::toplevel::SurfaceWindow;

    fn shm(size: Size) -> BufferSource {
        let stride = size.w as u32 * 4;
        BufferSource::Shm(ShmImage {
            size,
            stride,
            format: DrmFourcc::Argb8888,
            scale: 1,
            data: vec![0u8; stride as usize * size.h as usize].into(),
        })
    }

    #[test]
    fn test_create_is_idempotent_and_skips_empty_buffers() {
        let window = SurfaceWindow::new(1, Rectangle::new(0, 0, 10, 10));
        let mut buffer = Buffer::new(1);
        buffer.create(&window);
        assert!(!buffer.is_valid());

        window.attach(shm(Size::new(0, 10)));
        buffer.create(&window);
        assert!(!buffer.is_valid());

        window.attach(shm(Size::new(10, 10)));
        buffer.create(&window);
        assert!(buffer.is_valid());
        window.attach(shm(Size::new(20, 20)));
        buffer.create(&window);
        assert_eq!(buffer.size(), Size::new(10, 10));
    }

    #[test]
    fn test_bind_uploads_only_damage() {
        let window = SurfaceWindow::new(1, Rectangle::new(0, 0, 10, 10));
        window.attach(shm(Size::new(10, 10)));
        let mut importer = HeadlessImporter::default();
        let mut buffer = Buffer::new(1);
        buffer.create(&window);

        buffer.bind(&mut importer, &Region::new()).unwrap();
        assert_eq!(importer.full_uploads, 1);

        let damage = Region::from_rect(Rectangle::new(2, 2, 3, 3));
        buffer.bind(&mut importer, &damage).unwrap();
        assert_eq!(importer.full_uploads, 1);
        assert_eq!(importer.damage_uploads, vec![Rectangle::new(2, 2, 3, 3)]);

        buffer.bind(&mut importer, &Region::new()).unwrap();
        assert_eq!(importer.damage_uploads.len(), 1);
    }

    #[test]
    fn test_bind_failure_invalidates_buffer() {
        let window = SurfaceWindow::new(1, Rectangle::new(0, 0, 10, 10));
        window.attach(BufferSource::Shm(ShmImage {
            size: Size::new(10, 10),
            stride: 40,
            format: DrmFourcc::Nv12,
            scale: 1,
            data: vec![0u8; 400].into(),
        }));
        let mut importer = HeadlessImporter::default();
        let mut buffer = Buffer::new(1);
        buffer.create(&window);
        assert!(buffer.bind(&mut importer, &Region::new()).is_err());
        assert!(!buffer.is_valid());
    }

    #[test]
    fn test_dmabuf_orientation_follows_exporter_flag() {
        let window = SurfaceWindow::new(1, Rectangle::new(0, 0, 10, 10));
        let mut importer = HeadlessImporter::default();
        for flag in [false, true] {
            window.attach(BufferSource::Dmabuf(Dmabuf {
                id: 1,
                size: Size::new(10, 10),
                format: DrmFourcc::Argb8888,
                modifier: 0,
                y_inverted: flag,
            }));
            let mut buffer = Buffer::new(1);
            buffer.create(&window);
            let texture = buffer.bind(&mut importer, &Region::new()).unwrap().unwrap();
            assert_eq!(texture.is_y_inverted(), !flag);
        }
    }

    #[test]
    fn test_previous_buffer_lives_while_referenced() {
        let window = SurfaceWindow::new(1, Rectangle::new(0, 0, 10, 10));
        window.attach(shm(Size::new(10, 10)));
        let mut pair = BufferPair::new();
        assert!(pair.update(1, &window).is_some());

        pair.discard();
        assert!(pair.current().is_none());
        let previous = pair.previous().unwrap();
        assert!(previous.is_discarded());
        drop(previous);

        let fade = pair.reference_previous().unwrap();
        window.attach(shm(Size::new(20, 20)));
        assert!(pair.update(1, &window).is_some());
        assert!(pair.previous().is_some());

        fade.release();
        assert!(pair.previous().is_none());
    }

    #[test]
    fn test_discarding_invalid_buffer_keeps_no_previous() {
        let window = SurfaceWindow::new(1, Rectangle::new(0, 0, 10, 10));
        let mut pair = BufferPair::new();
        assert!(pair.update(1, &window).is_none());
        pair.discard();
        assert!(pair.previous().is_none());
    }
}
