//! frame content drawn into the current egl surface
use std::{fmt, str::FromStr};

use drm::buffer::DrmFourcc;

use crate::{
    gpu::{BufferAllocator, DmaBufImage, Gpu},
    Error, Result,
};

mod cube;
pub mod transform;
mod video;

pub use cube::{checkerboard, nv12_checkerboard, CubeContent, CubeRenderer};
pub use video::{FrameSource, RawFrames, RawVideo};

/// draws one frame into the bound surface, never presents
pub trait Renderer {
    fn draw(&mut self, frame: u64) -> Result<()>;
}

impl<R: Renderer + ?Sized> Renderer for Box<R> {
    fn draw(&mut self, frame: u64) -> Result<()> {
        (**self).draw(frame)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContentMode {
    /// vertex colored cube
    #[default]
    Smooth,
    /// cube textured with a generated rgba checkerboard
    Rgba,
    /// nv12 checkerboard as a luma and a chroma image, converted in the shader
    Nv12TwoImages,
    /// nv12 checkerboard as one two-plane image, converted by the driver
    Nv12OneImage,
    /// cube textured from a video source
    Video,
}

const CONTENT_MODES: [(&str, ContentMode); 5] = [
    ("smooth", ContentMode::Smooth),
    ("rgba", ContentMode::Rgba),
    ("nv12-2img", ContentMode::Nv12TwoImages),
    ("nv12-1img", ContentMode::Nv12OneImage),
    ("video", ContentMode::Video),
];

impl FromStr for ContentMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CONTENT_MODES
            .iter()
            .find(|(name, _)| *name == s)
            .map(|(_, mode)| *mode)
            .ok_or_else(|| {
                let names: Vec<_> = CONTENT_MODES.iter().map(|(name, _)| *name).collect();
                format!("unknown content mode `{s}`, expected one of {}", names.join(", "))
            })
    }
}

impl fmt::Display for ContentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (name, _) = CONTENT_MODES.iter().find(|(_, mode)| mode == self).ok_or(fmt::Error)?;
        f.write_str(name)
    }
}

const CHECKERBOARD_SIZE: u32 = 512;

/// build the renderer for `mode` on the current context of `gpu`
///
/// every textured mode needs dma-buf import, its absence is reported here
/// rather than on the first frame
pub fn content_renderer(
    mode: ContentMode,
    gpu: &Gpu,
    video: Option<Box<dyn FrameSource>>,
) -> Result<Box<dyn Renderer>> {
    let importer = match mode {
        ContentMode::Smooth => None,
        _ => Some(gpu.image_importer()?),
    };
    let allocator = gpu.allocator();

    let content = match (mode, video) {
        (ContentMode::Smooth, _) => CubeContent::Smooth,
        (ContentMode::Rgba, _) => CubeContent::Image(rgba_texture(&allocator)?),
        (ContentMode::Nv12TwoImages, _) => {
            let (luma, chroma) = nv12_textures(&allocator)?;
            CubeContent::Nv12Planes { luma, chroma }
        }
        (ContentMode::Nv12OneImage, _) => {
            let (luma, chroma) = nv12_textures(&allocator)?;
            CubeContent::Image(DmaBufImage::merge(DrmFourcc::Nv12, vec![luma, chroma])?)
        }
        (ContentMode::Video, Some(source)) => CubeContent::Video(source),
        (ContentMode::Video, None) => {
            return Err(Error::Render("video mode needs a frame source".into()));
        }
    };
    tracing::info!("drawing {mode} cube");
    Ok(Box::new(CubeRenderer::new(gpu.size(), content, importer)?))
}

fn rgba_texture(allocator: &BufferAllocator<'_>) -> Result<DmaBufImage> {
    let size = CHECKERBOARD_SIZE;
    // rgba byte order is abgr8888 in drm terms
    let mut buffer = allocator.linear((size, size), DrmFourcc::Abgr8888)?;
    buffer.write(&checkerboard(size, size / 8))?;
    buffer.export()
}

fn nv12_textures(allocator: &BufferAllocator<'_>) -> Result<(DmaBufImage, DmaBufImage)> {
    let size = CHECKERBOARD_SIZE;
    let (y, uv) = nv12_checkerboard(size, size / 8);

    let mut luma = allocator.linear((size, size), DrmFourcc::R8)?;
    luma.write(&y)?;
    let mut chroma = allocator.linear((size / 2, size / 2), DrmFourcc::Gr88)?;
    chroma.write(&uv)?;
    Ok((luma.export()?, chroma.export()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_content_mode() {
        assert_eq!("smooth".parse(), Ok(ContentMode::Smooth));
        assert_eq!("rgba".parse(), Ok(ContentMode::Rgba));
        assert_eq!("nv12-2img".parse(), Ok(ContentMode::Nv12TwoImages));
        assert_eq!("nv12-1img".parse(), Ok(ContentMode::Nv12OneImage));
        assert_eq!("video".parse(), Ok(ContentMode::Video));
        assert!("nv12".parse::<ContentMode>().is_err());
    }

    #[test]
    fn content_mode_names_round_trip() {
        for (name, mode) in CONTENT_MODES {
            assert_eq!(mode.to_string(), name);
            assert_eq!(name.parse(), Ok(mode));
        }
    }
}
