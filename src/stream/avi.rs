//! Motion-JPEG in AVI, the built-in recording container.
//!
//! Layout (single video stream, offsets in bytes):
//!
//! ```text
//!   0  RIFF <size> 'AVI '
//!  12  LIST <192> 'hdrl'
//!  24    avih <56>  main header          (total frames @48, buffer size @60)
//!  88    LIST <116> 'strl'
//! 100      strh <56> stream header       (length @140, buffer size @144)
//! 164      strf <40> BITMAPINFOHEADER
//! 212  LIST <size> 'movi'
//! 224    00dc <len> jpeg [pad] ...
//!      idx1 <16 * frames>
//! ```
//!
//! Sizes and counts are written as placeholders and patched in `finish`. RIFF sizes are
//! 32-bit, so a file never grows past `AVI_MAX_BYTES`: a frame that would not fit with
//! its index entry is refused with `RecordingError::Full`.

use anyhow::{anyhow, Context, Result};
use image::imageops::{self, FilterType};
use image::RgbImage;
use std::borrow::Cow;
use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::recording::{RecorderBackend, RecordingWriter};
use crate::error::RecordingError;
use crate::frame::encode_jpeg;

/// Largest file the 32-bit RIFF sizes can describe.
pub const AVI_MAX_BYTES: u64 = u32::MAX as u64;

const RIFF_SIZE_AT: u64 = 4;
const TOTAL_FRAMES_AT: u64 = 48;
const MAIN_BUFFER_SIZE_AT: u64 = 60;
const STREAM_LENGTH_AT: u64 = 140;
const STREAM_BUFFER_SIZE_AT: u64 = 144;
const MOVI_SIZE_AT: u64 = 216;
const MOVI_FOURCC_AT: u64 = 220;
const FIRST_CHUNK_AT: u64 = 224;

const AVIF_HASINDEX: u32 = 0x10;
const AVIIF_KEYFRAME: u32 = 0x10;

/// Recorder backend writing `.avi` files with one JPEG per frame.
pub struct MjpegAviBackend {
    quality: u8,
    max_bytes: u64,
}

impl MjpegAviBackend {
    pub fn new(quality: u8) -> Self {
        Self {
            quality,
            max_bytes: AVI_MAX_BYTES,
        }
    }

    /// Cap each file below `AVI_MAX_BYTES`.
    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes.min(AVI_MAX_BYTES);
        self
    }
}

impl Default for MjpegAviBackend {
    fn default() -> Self {
        Self::new(85)
    }
}

impl RecorderBackend for MjpegAviBackend {
    fn name(&self) -> &'static str {
        "mjpeg-avi"
    }

    fn extension(&self) -> &'static str {
        "avi"
    }

    fn open(&self, path: &Path, width: u32, height: u32, fps: u32) -> Result<Box<dyn RecordingWriter>> {
        Ok(Box::new(
            MjpegAviWriter::create(path, width, height, fps, self.quality)?
                .with_max_bytes(self.max_bytes),
        ))
    }
}

/// Streaming MJPEG AVI writer.
pub struct MjpegAviWriter {
    path: PathBuf,
    out: BufWriter<File>,
    width: u32,
    height: u32,
    quality: u8,
    position: u64,
    /// `(offset from the 'movi' fourcc, payload length)` per frame.
    index: Vec<(u32, u32)>,
    max_chunk: u32,
    max_bytes: u64,
}

impl MjpegAviWriter {
    pub fn create(path: &Path, width: u32, height: u32, fps: u32, quality: u8) -> Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("create recording {}", path.display()))?;
        let mut writer = Self {
            path: path.to_path_buf(),
            out: BufWriter::new(file),
            width,
            height,
            quality,
            position: 0,
            index: Vec::new(),
            max_chunk: 0,
            max_bytes: AVI_MAX_BYTES,
        };
        writer.write_headers(fps.max(1))?;
        Ok(writer)
    }

    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes.min(AVI_MAX_BYTES);
        self
    }

    fn write_headers(&mut self, fps: u32) -> Result<()> {
        let frame_bytes = self.width.saturating_mul(self.height).saturating_mul(3);
        let mut header = Vec::with_capacity(FIRST_CHUNK_AT as usize);

        header.extend_from_slice(b"RIFF");
        put_u32(&mut header, 0);
        header.extend_from_slice(b"AVI ");

        header.extend_from_slice(b"LIST");
        put_u32(&mut header, 192);
        header.extend_from_slice(b"hdrl");

        header.extend_from_slice(b"avih");
        put_u32(&mut header, 56);
        put_u32(&mut header, 1_000_000 / fps);
        put_u32(&mut header, frame_bytes.saturating_mul(fps));
        put_u32(&mut header, 0);
        put_u32(&mut header, AVIF_HASINDEX);
        put_u32(&mut header, 0); // total frames
        put_u32(&mut header, 0);
        put_u32(&mut header, 1); // streams
        put_u32(&mut header, 0); // suggested buffer size
        put_u32(&mut header, self.width);
        put_u32(&mut header, self.height);
        header.extend_from_slice(&[0u8; 16]);

        header.extend_from_slice(b"LIST");
        put_u32(&mut header, 116);
        header.extend_from_slice(b"strl");

        header.extend_from_slice(b"strh");
        put_u32(&mut header, 56);
        header.extend_from_slice(b"vids");
        header.extend_from_slice(b"MJPG");
        put_u32(&mut header, 0);
        put_u16(&mut header, 0);
        put_u16(&mut header, 0);
        put_u32(&mut header, 0);
        put_u32(&mut header, 1); // scale
        put_u32(&mut header, fps); // rate
        put_u32(&mut header, 0);
        put_u32(&mut header, 0); // length
        put_u32(&mut header, 0); // suggested buffer size
        put_u32(&mut header, u32::MAX); // default quality
        put_u32(&mut header, 0);
        put_u16(&mut header, 0);
        put_u16(&mut header, 0);
        put_u16(&mut header, self.width.min(u16::MAX as u32) as u16);
        put_u16(&mut header, self.height.min(u16::MAX as u32) as u16);

        header.extend_from_slice(b"strf");
        put_u32(&mut header, 40);
        put_u32(&mut header, 40);
        put_u32(&mut header, self.width);
        put_u32(&mut header, self.height);
        put_u16(&mut header, 1);
        put_u16(&mut header, 24);
        header.extend_from_slice(b"MJPG");
        put_u32(&mut header, frame_bytes);
        header.extend_from_slice(&[0u8; 16]);

        header.extend_from_slice(b"LIST");
        put_u32(&mut header, 0);
        header.extend_from_slice(b"movi");

        debug_assert_eq!(header.len() as u64, FIRST_CHUNK_AT);
        self.out.write_all(&header).context("write avi header")?;
        self.position = FIRST_CHUNK_AT;
        Ok(())
    }

    /// File size once the index is written, if one more chunk of `chunk_bytes` is added.
    fn projected_len(&self, chunk_bytes: u64) -> u64 {
        self.position + chunk_bytes + 8 + 16 * (self.index.len() as u64 + 1)
    }

    fn write_chunk(&mut self, payload: &[u8]) -> Result<()> {
        let len = u32::try_from(payload.len()).context("frame too large for avi")?;
        let chunk_bytes = 8 + payload.len() as u64 + (payload.len() % 2) as u64;
        if self.projected_len(chunk_bytes) > self.max_bytes {
            if self.index.is_empty() {
                return Err(anyhow!(
                    "a {} byte frame does not fit in a {} byte avi",
                    payload.len(),
                    self.max_bytes
                ));
            }
            return Err(RecordingError::Full(self.path.clone()).into());
        }
        let offset = u32::try_from(self.position - MOVI_FOURCC_AT).context("avi offset overflow")?;

        self.out.write_all(b"00dc")?;
        self.out.write_all(&len.to_le_bytes())?;
        self.out.write_all(payload)?;
        let mut written = 8 + payload.len() as u64;
        if payload.len() % 2 == 1 {
            self.out.write_all(&[0])?;
            written += 1;
        }

        self.position += written;
        self.index.push((offset, len));
        self.max_chunk = self.max_chunk.max(len);
        Ok(())
    }

    fn patch_u32(&mut self, at: u64, value: u32) -> Result<()> {
        self.out.seek(SeekFrom::Start(at))?;
        self.out.write_all(&value.to_le_bytes())?;
        Ok(())
    }
}

impl RecordingWriter for MjpegAviWriter {
    fn write(&mut self, image: &RgbImage) -> Result<()> {
        let frame = if image.dimensions() == (self.width, self.height) {
            Cow::Borrowed(image)
        } else {
            Cow::Owned(imageops::resize(
                image,
                self.width,
                self.height,
                FilterType::Triangle,
            ))
        };
        let jpeg = encode_jpeg(&frame, self.quality)?;
        self.write_chunk(&jpeg)
            .with_context(|| format!("write frame to {}", self.path.display()))
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn finish(mut self: Box<Self>) -> Result<PathBuf> {
        let movi_end = self.position;

        let mut idx = Vec::with_capacity(8 + self.index.len() * 16);
        idx.extend_from_slice(b"idx1");
        put_u32(
            &mut idx,
            u32::try_from(self.index.len() * 16).context("avi index too large")?,
        );
        for (offset, len) in &self.index {
            idx.extend_from_slice(b"00dc");
            put_u32(&mut idx, AVIIF_KEYFRAME);
            put_u32(&mut idx, *offset);
            put_u32(&mut idx, *len);
        }
        self.out.write_all(&idx).context("write avi index")?;
        let file_len = movi_end + idx.len() as u64;

        let frames = u32::try_from(self.index.len()).context("too many avi frames")?;
        let max_chunk = self.max_chunk;
        let riff_size = u32::try_from(file_len - 8).context("avi exceeds the RIFF size limit")?;
        let movi_size =
            u32::try_from(movi_end - MOVI_FOURCC_AT).context("avi exceeds the RIFF size limit")?;
        self.patch_u32(RIFF_SIZE_AT, riff_size)?;
        self.patch_u32(MOVI_SIZE_AT, movi_size)?;
        self.patch_u32(TOTAL_FRAMES_AT, frames)?;
        self.patch_u32(STREAM_LENGTH_AT, frames)?;
        self.patch_u32(MAIN_BUFFER_SIZE_AT, max_chunk)?;
        self.patch_u32(STREAM_BUFFER_SIZE_AT, max_chunk)?;

        self.out.flush().context("flush recording")?;
        self.out.get_ref().sync_all().context("sync recording")?;
        Ok(self.path)
    }
}

fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn put_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn u32_at(bytes: &[u8], at: usize) -> u32 {
        u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
    }

    #[test]
    fn writes_indexed_mjpeg_avi() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.avi");
        let mut writer: Box<dyn RecordingWriter> =
            MjpegAviBackend::default().open(&path, 64, 48, 30).unwrap();
        for value in [0u8, 128, 255] {
            writer
                .write(&RgbImage::from_pixel(64, 48, Rgb([value, value, value])))
                .unwrap();
        }
        let finished = writer.finish().unwrap();
        assert_eq!(finished, path);

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[0..4], b"RIFF");
        assert_eq!(&bytes[8..12], b"AVI ");
        assert_eq!(u32_at(&bytes, 4) as usize, bytes.len() - 8);
        assert_eq!(u32_at(&bytes, 48), 3);
        assert_eq!(u32_at(&bytes, 140), 3);
        assert_eq!(u32_at(&bytes, 64), 64);
        assert_eq!(u32_at(&bytes, 68), 48);
        assert_eq!(&bytes[220..224], b"movi");

        // First chunk is a JPEG.
        assert_eq!(&bytes[224..228], b"00dc");
        assert_eq!(&bytes[232..234], &[0xFF, 0xD8]);

        // The index sits right after the movi list and points back at every chunk.
        let movi_end = 220 + u32_at(&bytes, 216) as usize;
        assert_eq!(&bytes[movi_end..movi_end + 4], b"idx1");
        assert_eq!(u32_at(&bytes, movi_end + 4), 48);
        let first_offset = u32_at(&bytes, movi_end + 16) as usize;
        assert_eq!(first_offset, 4);
        assert_eq!(&bytes[220 + first_offset..224 + first_offset], b"00dc");
    }

    #[test]
    fn full_file_refuses_frames_and_stays_valid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.avi");
        let mut writer = MjpegAviWriter::create(&path, 64, 48, 30, 80)
            .unwrap()
            .with_max_bytes(4096);
        let image = RgbImage::from_pixel(64, 48, Rgb([10, 200, 90]));

        let mut written = 0;
        let err = loop {
            match writer.write(&image) {
                Ok(()) => written += 1,
                Err(err) => break err,
            }
            assert!(written < 100, "size limit never reached");
        };
        assert!(written >= 1);
        assert!(matches!(
            err.downcast_ref::<RecordingError>(),
            Some(RecordingError::Full(full)) if *full == path
        ));

        Box::new(writer).finish().unwrap();
        let bytes = std::fs::read(&path).unwrap();
        assert!(bytes.len() <= 4096, "{} bytes", bytes.len());
        assert_eq!(u32_at(&bytes, 4) as usize, bytes.len() - 8);
        assert_eq!(u32_at(&bytes, 48), written);
    }

    #[test]
    fn frame_larger_than_an_empty_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.avi");
        let mut writer = MjpegAviWriter::create(&path, 64, 48, 30, 80)
            .unwrap()
            .with_max_bytes(300);
        let err = writer.write(&RgbImage::new(64, 48)).unwrap_err();
        assert!(err.downcast_ref::<RecordingError>().is_none());
    }

    #[test]
    fn frames_of_other_sizes_are_resized() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.avi");
        let mut writer = MjpegAviWriter::create(&path, 32, 24, 30, 80).unwrap();
        writer.write(&RgbImage::new(64, 48)).unwrap();
        assert_eq!(writer.index.len(), 1);
        Box::new(writer).finish().unwrap();
    }
}
