//! zero-copy textures: linear gbm buffers exported as dma-bufs and sampled
//! through `EGLImage`s
//!
//! the cpu fills a linear buffer object once, its descriptor is wrapped in an
//! egl image and attached to an external texture. The texture keeps the
//! storage alive, the image and the descriptor are gone after the import.
use std::{
    ffi::c_void,
    io,
    os::fd::{AsRawFd, OwnedFd},
};

use drm::buffer::{DrmFourcc, DrmModifier};
use gbm::{BufferObject, BufferObjectFlags};
use gl::types::{GLenum, GLint, GLuint};
use khronos_egl as egl;

use crate::{card::Card, Error, Result};

/// display extensions needed to import dma-bufs
pub const IMAGE_EXTENSIONS: [&str; 2] = ["EGL_KHR_image_base", "EGL_EXT_image_dma_buf_import"];
/// client api extensions needed to sample imported images
pub const GL_IMAGE_EXTENSIONS: [&str; 2] = ["GL_OES_EGL_image", "GL_OES_EGL_image_external"];
pub(crate) const MODIFIERS_EXTENSION: &str = "EGL_EXT_image_dma_buf_import_modifiers";

pub(crate) const TEXTURE_EXTERNAL_OES: GLenum = 0x8D65;

const EGL_LINUX_DMA_BUF_EXT: egl::Enum = 0x3270;
const EGL_LINUX_DRM_FOURCC_EXT: egl::Int = 0x3271;

/// per plane: fd, offset, pitch, modifier low and high word
const PLANE_ATTRIBUTES: [[egl::Int; 5]; 3] = [
    [0x3272, 0x3273, 0x3274, 0x3443, 0x3444],
    [0x3275, 0x3276, 0x3277, 0x3445, 0x3446],
    [0x3278, 0x3279, 0x327A, 0x3447, 0x3448],
];

type EglImage = *mut c_void;

#[allow(non_snake_case)]
#[derive(Clone, Copy)]
pub(crate) struct ImageFns {
    eglCreateImageKHR: unsafe extern "system" fn(*mut c_void, *mut c_void, egl::Enum, *mut c_void, *const egl::Int) -> EglImage,
    eglDestroyImageKHR: unsafe extern "system" fn(*mut c_void, EglImage) -> egl::Boolean,
    glEGLImageTargetTexture2DOES: unsafe extern "system" fn(GLenum, EglImage),
}

impl ImageFns {
    pub(crate) fn load(proc: impl Fn(&str) -> Result<extern "system" fn()>) -> Result<Self> {
        // SAFETY: the signatures follow the extension specifications
        unsafe {
            Ok(ImageFns {
                eglCreateImageKHR: std::mem::transmute(proc("eglCreateImageKHR")?),
                eglDestroyImageKHR: std::mem::transmute(proc("eglDestroyImageKHR")?),
                glEGLImageTargetTexture2DOES: std::mem::transmute(proc("glEGLImageTargetTexture2DOES")?),
            })
        }
    }
}

#[derive(Debug)]
pub struct DmaBufPlane {
    pub fd: OwnedFd,
    pub offset: u32,
    pub pitch: u32,
}

/// a buffer the gpu can sample without a copy
#[derive(Debug)]
pub struct DmaBufImage {
    pub size: (u32, u32),
    pub fourcc: DrmFourcc,
    pub modifier: DrmModifier,
    pub planes: Vec<DmaBufPlane>,
}

impl DmaBufImage {
    /// one multi-planar image out of single plane ones, such as nv12 out of
    /// a luma and a chroma buffer
    ///
    /// the size is the first image's. The modifier is dropped unless every
    /// image agrees on it.
    pub fn merge(fourcc: DrmFourcc, images: Vec<DmaBufImage>) -> Result<DmaBufImage> {
        let first = images
            .first()
            .ok_or_else(|| Error::Render(format!("no planes to build a {fourcc:?} image from")))?;
        let size = first.size;
        let modifier = match images.iter().all(|image| image.modifier == first.modifier) {
            true => first.modifier,
            false => DrmModifier::Invalid,
        };
        let planes = images.into_iter().flat_map(|image| image.planes).collect();
        Ok(DmaBufImage { size, fourcc, modifier, planes })
    }

    /// `eglCreateImageKHR` attribute list describing the image
    ///
    /// modifiers are only passed along when the display understands them
    pub fn attributes(&self, modifiers: bool) -> Result<Vec<egl::Int>> {
        if self.planes.is_empty() || self.planes.len() > PLANE_ATTRIBUTES.len() {
            return Err(Error::Render(format!("{:?} image with {} planes", self.fourcc, self.planes.len())));
        }

        let (width, height) = self.size;
        let mut attribs = vec![
            egl::WIDTH,
            width as egl::Int,
            egl::HEIGHT,
            height as egl::Int,
            EGL_LINUX_DRM_FOURCC_EXT,
            self.fourcc as u32 as egl::Int,
        ];

        let with_modifier = modifiers && self.modifier != DrmModifier::Invalid;
        let modifier = u64::from(self.modifier);
        for (plane, [fd, offset, pitch, lo, hi]) in self.planes.iter().zip(PLANE_ATTRIBUTES) {
            attribs.extend([fd, plane.fd.as_raw_fd(), offset, plane.offset as egl::Int, pitch, plane.pitch as egl::Int]);
            if with_modifier {
                attribs.extend([lo, modifier as u32 as egl::Int, hi, (modifier >> 32) as u32 as egl::Int]);
            }
        }
        attribs.push(egl::NONE);
        Ok(attribs)
    }
}

/// attaches dma-bufs to external textures of the current context
///
/// only valid while the [`EglContext`](super::EglContext) it came from lives
#[derive(Clone, Copy)]
pub struct ImageImporter {
    display: *mut c_void,
    fns: ImageFns,
    modifiers: bool,
}

impl ImageImporter {
    pub(crate) fn new(display: *mut c_void, fns: ImageFns, modifiers: bool) -> Self {
        Self { display, fns, modifiers }
    }

    /// whether format modifiers are passed to the driver
    pub fn modifiers(&self) -> bool {
        self.modifiers
    }

    /// back `texture` on the active unit with `image`
    pub fn import(&self, image: &DmaBufImage, texture: GLuint) -> Result<()> {
        let attribs = image.attributes(self.modifiers)?;
        // SAFETY: the attribute list is `NONE` terminated and its descriptors
        // stay open for the duration of the call
        let egl_image = unsafe {
            (self.fns.eglCreateImageKHR)(
                self.display,
                std::ptr::null_mut(),
                EGL_LINUX_DMA_BUF_EXT,
                std::ptr::null_mut(),
                attribs.as_ptr(),
            )
        };
        if egl_image.is_null() {
            return Err(Error::BufferImportFailed(io::Error::other(format!(
                "eglCreateImageKHR rejected a {}x{} {:?} dma-buf",
                image.size.0, image.size.1, image.fourcc
            ))));
        }

        unsafe {
            gl::BindTexture(TEXTURE_EXTERNAL_OES, texture);
            gl::TexParameteri(TEXTURE_EXTERNAL_OES, gl::TEXTURE_MIN_FILTER, gl::LINEAR as GLint);
            gl::TexParameteri(TEXTURE_EXTERNAL_OES, gl::TEXTURE_MAG_FILTER, gl::LINEAR as GLint);
            gl::TexParameteri(TEXTURE_EXTERNAL_OES, gl::TEXTURE_WRAP_S, gl::CLAMP_TO_EDGE as GLint);
            gl::TexParameteri(TEXTURE_EXTERNAL_OES, gl::TEXTURE_WRAP_T, gl::CLAMP_TO_EDGE as GLint);
            (self.fns.glEGLImageTargetTexture2DOES)(TEXTURE_EXTERNAL_OES, egl_image);
            if (self.fns.eglDestroyImageKHR)(self.display, egl_image) == egl::FALSE {
                tracing::warn!("failed to destroy egl image");
            }
        }
        Ok(())
    }
}

/// hands out cpu writable buffers on the scanout device
pub struct BufferAllocator<'a> {
    device: &'a gbm::Device<Card>,
}

impl<'a> BufferAllocator<'a> {
    pub(crate) fn new(device: &'a gbm::Device<Card>) -> Self {
        Self { device }
    }

    /// a linear `format` buffer. `WRITE` would give a dumb buffer the gpu
    /// may not import, so the buffer is mapped instead
    pub fn linear(&self, size: (u32, u32), format: DrmFourcc) -> Result<LinearBuffer> {
        let bpp = bytes_per_pixel(format)
            .ok_or_else(|| Error::Render(format!("no cpu layout for {format:?} buffers")))?;
        let bo = self
            .device
            .create_buffer_object::<()>(size.0, size.1, format, BufferObjectFlags::LINEAR)
            .map_err(Error::device("allocate linear buffer"))?;
        Ok(LinearBuffer { bo, size, format, bpp })
    }
}

/// single plane buffer object in linear layout
pub struct LinearBuffer {
    bo: BufferObject<()>,
    size: (u32, u32),
    format: DrmFourcc,
    bpp: usize,
}

impl LinearBuffer {
    pub fn size(&self) -> (u32, u32) {
        self.size
    }

    /// copy tightly packed rows into the buffer
    pub fn write(&mut self, pixels: &[u8]) -> Result<()> {
        let (width, height) = self.size;
        let row = width as usize * self.bpp;
        if pixels.len() < row * height as usize {
            return Err(Error::Render(format!(
                "{} bytes do not fill a {width}x{height} {:?} buffer",
                pixels.len(),
                self.format
            )));
        }

        self.bo
            .map_mut(0, 0, width, height, |map| {
                let stride = map.stride() as usize;
                copy_rows(map.buffer_mut(), stride, pixels, row);
            })
            .map_err(Error::device("map linear buffer"))
    }

    /// a fresh descriptor of the buffer with its layout
    pub fn export(&self) -> Result<DmaBufImage> {
        let fd = self.bo.fd().map_err(|err| Error::BufferImportFailed(io::Error::other(err)))?;
        Ok(DmaBufImage {
            size: self.size,
            fourcc: self.format,
            modifier: self.bo.modifier(),
            planes: vec![DmaBufPlane { fd, offset: self.bo.offset(0), pitch: self.bo.stride() }],
        })
    }
}

fn bytes_per_pixel(format: DrmFourcc) -> Option<usize> {
    match format {
        DrmFourcc::Abgr8888 | DrmFourcc::Argb8888 | DrmFourcc::Xbgr8888 | DrmFourcc::Xrgb8888 => Some(4),
        DrmFourcc::Gr88 | DrmFourcc::Rg88 => Some(2),
        DrmFourcc::R8 => Some(1),
        _ => None,
    }
}

/// copy `row` bytes per line from packed `src` into `dst` lines of `stride`
fn copy_rows(dst: &mut [u8], stride: usize, src: &[u8], row: usize) {
    for (dst, src) in dst.chunks_mut(stride).zip(src.chunks_exact(row)) {
        dst[..row].copy_from_slice(src);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::null_fd;

    fn image(size: (u32, u32), fourcc: DrmFourcc, modifier: DrmModifier, pitch: u32) -> DmaBufImage {
        let plane = DmaBufPlane { fd: null_fd().unwrap(), offset: 0, pitch };
        DmaBufImage { size, fourcc, modifier, planes: vec![plane] }
    }

    #[test]
    fn single_plane_attributes() {
        let rgba = image((512, 256), DrmFourcc::Abgr8888, DrmModifier::Linear, 2048);
        let fd = rgba.planes[0].fd.as_raw_fd();

        #[rustfmt::skip]
        let expected = [
            egl::WIDTH, 512, egl::HEIGHT, 256, 0x3271, 0x3432_4241,
            0x3272, fd, 0x3273, 0, 0x3274, 2048,
            egl::NONE,
        ];
        assert_eq!(rgba.attributes(false).unwrap(), expected);
    }

    #[test]
    fn modifiers_split_into_words() {
        let modifier = DrmModifier::from(0x0100_0000_0000_0002);
        let rgba = image((64, 64), DrmFourcc::Abgr8888, modifier, 256);

        let attribs = rgba.attributes(true).unwrap();
        assert_eq!(&attribs[12..16], &[0x3443, 2, 0x3444, 0x0100_0000]);
        assert_eq!(attribs.last(), Some(&egl::NONE));

        let invalid = image((64, 64), DrmFourcc::Abgr8888, DrmModifier::Invalid, 256);
        assert!(!invalid.attributes(true).unwrap().contains(&0x3443));
    }

    #[test]
    fn merged_nv12_lists_both_planes() {
        let luma = image((512, 512), DrmFourcc::R8, DrmModifier::Linear, 512);
        let chroma = image((256, 256), DrmFourcc::Gr88, DrmModifier::Linear, 512);
        let nv12 = DmaBufImage::merge(DrmFourcc::Nv12, vec![luma, chroma]).unwrap();

        assert_eq!(nv12.size, (512, 512));
        assert_eq!(nv12.modifier, DrmModifier::Linear);
        let attribs = nv12.attributes(true).unwrap();
        for name in [0x3272, 0x3275, 0x3277, 0x3445, 0x3446] {
            assert!(attribs.contains(&name), "{name:#x} missing");
        }
        assert!(!attribs.contains(&0x3278));
    }

    #[test]
    fn merge_drops_disagreeing_modifiers() {
        let luma = image((16, 16), DrmFourcc::R8, DrmModifier::Linear, 16);
        let chroma = image((8, 8), DrmFourcc::Gr88, DrmModifier::from(0x0100_0000_0000_0001), 16);
        let nv12 = DmaBufImage::merge(DrmFourcc::Nv12, vec![luma, chroma]).unwrap();
        assert_eq!(nv12.modifier, DrmModifier::Invalid);

        assert!(DmaBufImage::merge(DrmFourcc::Nv12, Vec::new()).is_err());
    }

    #[test]
    fn plane_count_is_bounded() {
        let mut image = image((16, 16), DrmFourcc::R8, DrmModifier::Linear, 16);
        image.planes.clear();
        assert!(image.attributes(false).is_err());
    }

    #[test]
    fn rows_land_on_stride_boundaries() {
        let src = [1, 2, 3, 4, 5, 6];
        let mut dst = [0u8; 8];
        copy_rows(&mut dst, 4, &src, 3);
        assert_eq!(dst, [1, 2, 3, 0, 4, 5, 6, 0]);
    }

    #[test]
    fn cpu_layouts() {
        assert_eq!(bytes_per_pixel(DrmFourcc::Abgr8888), Some(4));
        assert_eq!(bytes_per_pixel(DrmFourcc::Gr88), Some(2));
        assert_eq!(bytes_per_pixel(DrmFourcc::R8), Some(1));
        assert_eq!(bytes_per_pixel(DrmFourcc::Nv12), None);
    }
}
