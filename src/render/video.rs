use std::{
    fs::File,
    io::{self, BufReader, Read, Seek, SeekFrom},
    path::{Path, PathBuf},
};

use drm::buffer::DrmFourcc;

use crate::{
    gpu::{BufferAllocator, DmaBufImage, LinearBuffer},
    Error, Result,
};

/// producer of frames the gpu can import
pub trait FrameSource {
    fn size(&self) -> (u32, u32);

    /// next frame, `None` at end of stream
    fn next_frame(&mut self) -> Result<Option<DmaBufImage>>;

    /// rewind to the first frame
    fn restart(&mut self) -> Result<()>;
}

/// headerless file of back to back rgba frames
pub struct RawFrames {
    path: PathBuf,
    reader: BufReader<File>,
    size: (u32, u32),
    frame: Vec<u8>,
    frames_read: u64,
}

impl RawFrames {
    pub fn open(path: impl AsRef<Path>, size: (u32, u32)) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|err| Error::Render(format!("{}: {err}", path.display())))?;
        let frame_len = size.0 as usize * size.1 as usize * 4;
        if frame_len == 0 {
            return Err(Error::Render(format!("invalid video size {}x{}", size.0, size.1)));
        }

        Ok(Self {
            path: path.into(),
            reader: BufReader::new(file),
            size,
            frame: vec![0; frame_len],
            frames_read: 0,
        })
    }

    pub fn size(&self) -> (u32, u32) {
        self.size
    }

    pub fn frames_read(&self) -> u64 {
        self.frames_read
    }

    /// next frame's pixels, `None` at end of stream
    pub fn next_frame(&mut self) -> Result<Option<&[u8]>> {
        match self.reader.read_exact(&mut self.frame) {
            Ok(()) => {
                self.frames_read += 1;
                Ok(Some(&self.frame))
            }
            // a trailing partial frame counts as end of stream
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
            Err(err) => Err(Error::Render(format!("{}: {err}", self.path.display()))),
        }
    }

    pub fn restart(&mut self) -> Result<()> {
        tracing::debug!(frames = self.frames_read, "end of stream, restarting {}", self.path.display());
        self.reader
            .seek(SeekFrom::Start(0))
            .map_err(|err| Error::Render(format!("{}: {err}", self.path.display())))?;
        Ok(())
    }
}

/// raw rgba frames played through a pair of linear buffers
///
/// frames alternate between the buffers, so the cpu never overwrites the one
/// the last draw sampled
pub struct RawVideo {
    frames: RawFrames,
    buffers: [LinearBuffer; 2],
    next: usize,
}

impl RawVideo {
    pub fn open(path: impl AsRef<Path>, size: (u32, u32), allocator: &BufferAllocator<'_>) -> Result<Self> {
        let frames = RawFrames::open(path.as_ref(), size)?;
        let buffers = [allocator.linear(size, DrmFourcc::Abgr8888)?, allocator.linear(size, DrmFourcc::Abgr8888)?];

        tracing::info!("playing {} as {}x{} rgba", path.as_ref().display(), size.0, size.1);
        Ok(Self { frames, buffers, next: 0 })
    }

    pub fn frames_read(&self) -> u64 {
        self.frames.frames_read()
    }
}

impl FrameSource for RawVideo {
    fn size(&self) -> (u32, u32) {
        self.frames.size()
    }

    fn next_frame(&mut self) -> Result<Option<DmaBufImage>> {
        let Some(pixels) = self.frames.next_frame()? else {
            return Ok(None);
        };
        let len = self.buffers.len();
        let buffer = &mut self.buffers[self.next];
        self.next = (self.next + 1) % len;

        buffer.write(pixels)?;
        buffer.export().map(Some)
    }

    fn restart(&mut self) -> Result<()> {
        self.frames.restart()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn video_file(name: &str, bytes: &[u8]) -> PathBuf {
        let path = std::env::temp_dir().join(format!("atomflip-{}-{name}.rgba", std::process::id()));
        File::create(&path).unwrap().write_all(bytes).unwrap();
        path
    }

    #[test]
    fn reads_frames_until_end_of_stream() {
        let mut bytes = vec![1u8; 16];
        bytes.extend([2u8; 16]);
        bytes.extend([3u8; 5]);
        let path = video_file("frames", &bytes);

        let mut video = RawFrames::open(&path, (2, 2)).unwrap();
        assert_eq!(video.next_frame().unwrap(), Some(&[1u8; 16][..]));
        assert_eq!(video.next_frame().unwrap(), Some(&[2u8; 16][..]));
        assert_eq!(video.next_frame().unwrap(), None);

        video.restart().unwrap();
        assert_eq!(video.next_frame().unwrap(), Some(&[1u8; 16][..]));
        assert_eq!(video.frames_read(), 3);

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn rejects_empty_size() {
        let path = video_file("empty", &[]);
        assert!(RawFrames::open(&path, (0, 16)).is_err());
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = RawFrames::open("/nonexistent/clip.rgba", (2, 2)).err().unwrap();
        assert_eq!(err.kind(), crate::ErrorKind::Render);
    }
}
