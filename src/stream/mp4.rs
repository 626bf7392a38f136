//! H.264 in MP4 recordings through FFmpeg (feature: record-ffmpeg).

use anyhow::{anyhow, Context, Result};
use ffmpeg_next as ffmpeg;
use image::RgbImage;
use std::path::{Path, PathBuf};

use super::recording::{RecorderBackend, RecordingWriter};

#[derive(Default)]
pub struct H264Mp4Backend;

impl RecorderBackend for H264Mp4Backend {
    fn name(&self) -> &'static str {
        "h264-mp4"
    }

    fn extension(&self) -> &'static str {
        "mp4"
    }

    fn open(&self, path: &Path, width: u32, height: u32, fps: u32) -> Result<Box<dyn RecordingWriter>> {
        Ok(Box::new(H264Mp4Writer::create(path, width, height, fps)?))
    }
}

pub struct H264Mp4Writer {
    path: PathBuf,
    output: ffmpeg::format::context::Output,
    encoder: ffmpeg::encoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    stream_index: usize,
    encoder_time_base: ffmpeg::Rational,
    stream_time_base: ffmpeg::Rational,
    width: u32,
    height: u32,
    next_pts: i64,
}

// The FFmpeg contexts are only ever touched by the thread holding the recorder lock.
unsafe impl Send for H264Mp4Writer {}

impl H264Mp4Writer {
    pub fn create(path: &Path, width: u32, height: u32, fps: u32) -> Result<Self> {
        ffmpeg::init().context("initialize ffmpeg")?;
        let fps = fps.max(1) as i32;

        let mut output = ffmpeg::format::output(&path)
            .with_context(|| format!("open {} for writing", path.display()))?;
        let codec = ffmpeg::encoder::find(ffmpeg::codec::Id::H264)
            .ok_or_else(|| anyhow!("ffmpeg build has no H.264 encoder"))?;
        let global_header = output
            .format()
            .flags()
            .contains(ffmpeg::format::flag::Flags::GLOBAL_HEADER);

        let mut stream = output.add_stream(codec).context("add video stream")?;
        let stream_index = stream.index();

        let mut video = ffmpeg::codec::context::Context::new_with_codec(codec)
            .encoder()
            .video()
            .context("create H.264 encoder")?;
        video.set_width(width);
        video.set_height(height);
        video.set_format(ffmpeg::format::Pixel::YUV420P);
        video.set_time_base((1, fps));
        video.set_frame_rate(Some((fps, 1)));
        if global_header {
            video.set_flags(ffmpeg::codec::Flags::GLOBAL_HEADER);
        }
        let encoder = video.open_as(codec).context("open H.264 encoder")?;
        stream.set_parameters(&encoder);
        stream.set_time_base((1, fps));

        output
            .write_header()
            .with_context(|| format!("write header of {}", path.display()))?;
        let stream_time_base = output
            .stream(stream_index)
            .ok_or_else(|| anyhow!("video stream vanished"))?
            .time_base();

        let scaler = ffmpeg::software::scaling::Context::get(
            ffmpeg::format::Pixel::RGB24,
            width,
            height,
            ffmpeg::format::Pixel::YUV420P,
            width,
            height,
            ffmpeg::software::scaling::flag::Flags::BILINEAR,
        )
        .context("create ffmpeg scaler")?;

        Ok(Self {
            path: path.to_path_buf(),
            output,
            encoder,
            scaler,
            stream_index,
            encoder_time_base: ffmpeg::Rational::new(1, fps),
            stream_time_base,
            width,
            height,
            next_pts: 0,
        })
    }

    fn drain_packets(&mut self) -> Result<()> {
        let mut packet = ffmpeg::Packet::empty();
        while self.encoder.receive_packet(&mut packet).is_ok() {
            packet.set_stream(self.stream_index);
            packet.rescale_ts(self.encoder_time_base, self.stream_time_base);
            packet
                .write_interleaved(&mut self.output)
                .context("write packet")?;
        }
        Ok(())
    }
}

impl RecordingWriter for H264Mp4Writer {
    fn write(&mut self, image: &RgbImage) -> Result<()> {
        if image.dimensions() != (self.width, self.height) {
            anyhow::bail!(
                "frame is {}x{}, recording is {}x{}",
                image.width(),
                image.height(),
                self.width,
                self.height
            );
        }

        let mut rgb = ffmpeg::frame::Video::new(ffmpeg::format::Pixel::RGB24, self.width, self.height);
        let row_bytes = self.width as usize * 3;
        let stride = rgb.stride(0);
        let data = rgb.data_mut(0);
        for (row, pixels) in image.as_raw().chunks_exact(row_bytes).enumerate() {
            data[row * stride..row * stride + row_bytes].copy_from_slice(pixels);
        }

        let mut yuv = ffmpeg::frame::Video::empty();
        self.scaler.run(&rgb, &mut yuv).context("convert frame to YUV")?;
        yuv.set_pts(Some(self.next_pts));
        self.next_pts += 1;

        self.encoder.send_frame(&yuv).context("encode frame")?;
        self.drain_packets()
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn finish(mut self: Box<Self>) -> Result<PathBuf> {
        self.encoder.send_eof().context("flush encoder")?;
        self.drain_packets()?;
        self.output.write_trailer().context("write mp4 trailer")?;
        Ok(self.path.clone())
    }
}
