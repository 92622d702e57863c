//! ffmpeg-next implementation of the pipeline's media backend.

use std::path::Path;

use anyhow::{Context, Result};
use crowd_pipeline::{
    frame_rate_ratio, CodecCandidate, EncoderSettings, FrameSource, MediaBackend, PixelLayout,
    SourceInfo, VideoWriter,
};
use ffmpeg::format::Pixel;
use ffmpeg::software::scaling::{self, flag::Flags};
use ffmpeg::util::frame::video::Video;
use ffmpeg::{Packet, Rational};
use image::RgbImage;

/// `AVFormatContext.duration` is in microseconds.
const AV_TIME_BASE: f64 = 1_000_000.0;
/// Used when the container does not report a usable frame rate.
const FALLBACK_FPS: i32 = 30;
/// Intermediate bitrate for the first-pass encoders, the h264 re-encode
/// sets its own quality.
const BIT_RATE: usize = 8_000_000;

#[derive(Debug, Default)]
pub struct FfmpegBackend;

impl MediaBackend for FfmpegBackend {
    fn open_source(&mut self, path: &Path) -> Result<Box<dyn FrameSource>> {
        Ok(Box::new(FfmpegFrameSource::open(path)?))
    }

    fn open_writer(
        &mut self,
        candidate: &CodecCandidate,
        settings: &EncoderSettings,
    ) -> Result<Box<dyn VideoWriter>> {
        Ok(Box::new(FfmpegVideoWriter::open(candidate, settings)?))
    }
}

/// Decodes the best video stream of a file into RGB frames.
pub struct FfmpegFrameSource {
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    decoder: ffmpeg::decoder::Video,
    scaler: scaling::Context,
    info: SourceInfo,
    eof_sent: bool,
}

impl FfmpegFrameSource {
    pub fn open(path: &Path) -> Result<Self> {
        let input = ffmpeg::format::input(&path)
            .with_context(|| format!("Failed to open {path:?} with ffmpeg"))?;
        let stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .context("File has no video track")?;
        let stream_index = stream.index();

        let context = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
            .context("Load video decoder parameters")?;
        let decoder = context
            .decoder()
            .video()
            .context("Open ffmpeg video decoder")?;

        let fps = [stream.avg_frame_rate(), stream.rate()]
            .into_iter()
            .find(|r| r.numerator() > 0 && r.denominator() > 0)
            .map(f64::from)
            .unwrap_or(0.0);
        let total_frames = if stream.frames() > 0 {
            stream.frames() as u64
        } else if input.duration() > 0 && fps > 0.0 {
            (input.duration() as f64 / AV_TIME_BASE * fps).round() as u64
        } else {
            0
        };
        let info = SourceInfo {
            fps,
            width: decoder.width(),
            height: decoder.height(),
            total_frames,
        };

        let scaler = scaling::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            Flags::BILINEAR,
        )
        .context("Create ffmpeg scaler")?;

        Ok(Self {
            input,
            stream_index,
            decoder,
            scaler,
            info,
            eof_sent: false,
        })
    }

    fn next_packet(&mut self) -> Option<Packet> {
        let stream_index = self.stream_index;
        self.input
            .packets()
            .find(|(stream, _)| stream.index() == stream_index)
            .map(|(_, packet)| packet)
    }
}

impl FrameSource for FfmpegFrameSource {
    fn info(&self) -> SourceInfo {
        self.info
    }

    fn read(&mut self) -> Result<Option<RgbImage>> {
        let mut decoded = Video::empty();
        loop {
            match self.decoder.receive_frame(&mut decoded) {
                Ok(()) => {
                    let mut rgb_frame = Video::empty();
                    self.scaler
                        .run(&decoded, &mut rgb_frame)
                        .context("Scale frame to RGB")?;
                    return frame_to_image(&rgb_frame).map(Some);
                }
                Err(ffmpeg::Error::Eof) => return Ok(None),
                Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::error::EAGAIN => {
                    if self.eof_sent {
                        return Ok(None);
                    }
                }
                Err(e) => return Err(e).context("Receive decoded frame"),
            }

            match self.next_packet() {
                Some(packet) => self
                    .decoder
                    .send_packet(&packet)
                    .context("Send packet to ffmpeg decoder")?,
                None => {
                    self.decoder.send_eof().context("Flush ffmpeg decoder")?;
                    self.eof_sent = true;
                }
            }
        }
    }
}

/// Copies an RGB24 frame row by row, dropping stride padding.
fn frame_to_image(frame: &Video) -> Result<RgbImage> {
    let (width, height) = (frame.width(), frame.height());
    let row_bytes = width as usize * 3;
    let stride = frame.stride(0);
    let data = frame.data(0);

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        pixels.extend_from_slice(
            data.get(start..start + row_bytes)
                .context("ffmpeg frame row is out of bounds")?,
        );
    }
    RgbImage::from_raw(width, height, pixels).context("Frame buffer size mismatch")
}

/// Encodes RGB frames into a container with one codec candidate.
pub struct FfmpegVideoWriter {
    octx: ffmpeg::format::context::Output,
    encoder: ffmpeg::encoder::video::Encoder,
    scaler: scaling::Context,
    stream_index: usize,
    encoder_time_base: Rational,
    stream_time_base: Rational,
    width: u32,
    height: u32,
    next_pts: i64,
    closed: bool,
}

impl FfmpegVideoWriter {
    pub fn open(candidate: &CodecCandidate, settings: &EncoderSettings) -> Result<Self> {
        let codec = ffmpeg::encoder::find_by_name(candidate.encoder)
            .with_context(|| format!("Encoder {} is not available", candidate.encoder))?;
        let mut octx = ffmpeg::format::output(&settings.path)
            .with_context(|| format!("Failed to create {:?}", settings.path))?;
        let global_header = octx
            .format()
            .flags()
            .contains(ffmpeg::format::Flags::GLOBAL_HEADER);

        // kept to a small exact ratio, mpeg4 rejects time bases above 65535
        let (num, den) = frame_rate_ratio(settings.fps).unwrap_or_else(|| {
            log::warn!("Unknown source fps, writing at {FALLBACK_FPS}");
            (FALLBACK_FPS, 1)
        });
        let frame_rate = Rational::new(num, den);
        let encoder_time_base = Rational::new(den, num);
        // 4:2:0 chroma needs even dimensions
        let (enc_width, enc_height) = (settings.width & !1, settings.height & !1);
        let format = match candidate.pixel_layout {
            PixelLayout::Yuv420p => Pixel::YUV420P,
            PixelLayout::Yuvj420p => Pixel::YUVJ420P,
        };

        let mut ost = octx.add_stream(codec).context("Add output stream")?;
        let stream_index = ost.index();
        let mut encoder = ffmpeg::codec::context::Context::new_with_codec(codec)
            .encoder()
            .video()
            .context("Create video encoder")?;
        encoder.set_width(enc_width);
        encoder.set_height(enc_height);
        encoder.set_format(format);
        encoder.set_frame_rate(Some(frame_rate));
        encoder.set_time_base(encoder_time_base);
        encoder.set_bit_rate(BIT_RATE);
        if global_header {
            encoder.set_flags(ffmpeg::codec::Flags::GLOBAL_HEADER);
        }
        let encoder = encoder
            .open_as(codec)
            .with_context(|| format!("Open encoder {}", candidate.encoder))?;
        ost.set_parameters(&encoder);
        ost.set_time_base(encoder_time_base);

        octx.write_header().context("Write container header")?;
        let stream_time_base = octx
            .stream(stream_index)
            .context("Output stream disappeared")?
            .time_base();

        let scaler = scaling::Context::get(
            Pixel::RGB24,
            settings.width,
            settings.height,
            format,
            enc_width,
            enc_height,
            Flags::BILINEAR,
        )
        .context("Create ffmpeg scaler")?;

        log::debug!(
            "Opened {} writer {:?} {enc_width}x{enc_height} @ {num}/{den}",
            candidate.encoder,
            settings.path
        );
        Ok(Self {
            octx,
            encoder,
            scaler,
            stream_index,
            encoder_time_base,
            stream_time_base,
            width: settings.width,
            height: settings.height,
            next_pts: 0,
            closed: false,
        })
    }

    fn write_packets(&mut self) -> Result<()> {
        let mut packet = Packet::empty();
        while self.encoder.receive_packet(&mut packet).is_ok() {
            packet.set_stream(self.stream_index);
            // one frame per packet, lets the muxer size the last sample
            if packet.duration() == 0 {
                packet.set_duration(1);
            }
            packet.rescale_ts(self.encoder_time_base, self.stream_time_base);
            packet
                .write_interleaved(&mut self.octx)
                .context("Write packet")?;
        }
        Ok(())
    }
}

impl VideoWriter for FfmpegVideoWriter {
    fn is_open(&self) -> bool {
        !self.closed
    }

    fn write(&mut self, frame: &RgbImage) -> Result<()> {
        anyhow::ensure!(!self.closed, "Writer is closed");
        anyhow::ensure!(
            frame.dimensions() == (self.width, self.height),
            "Frame is {:?}, writer expects {}x{}",
            frame.dimensions(),
            self.width,
            self.height
        );

        let mut rgb_frame = Video::new(Pixel::RGB24, self.width, self.height);
        let row_bytes = self.width as usize * 3;
        let stride = rgb_frame.stride(0);
        let data = rgb_frame.data_mut(0);
        for (row, src) in frame.as_raw().chunks_exact(row_bytes).enumerate() {
            data[row * stride..row * stride + row_bytes].copy_from_slice(src);
        }

        let mut encoded_frame = Video::empty();
        self.scaler
            .run(&rgb_frame, &mut encoded_frame)
            .context("Convert frame for encoder")?;
        encoded_frame.set_pts(Some(self.next_pts));
        self.next_pts += 1;

        self.encoder
            .send_frame(&encoded_frame)
            .context("Send frame to encoder")?;
        self.write_packets()
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.encoder.send_eof().context("Flush encoder")?;
        self.write_packets()?;
        self.octx.write_trailer().context("Write container trailer")?;
        Ok(())
    }
}

impl Drop for FfmpegVideoWriter {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::warn!("Closing video writer: {e:#}");
        }
    }
}
