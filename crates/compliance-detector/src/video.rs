//! Video container I/O: metadata extraction, sequential frame decode, and
//! keyframe transport encoding.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use image::RgbImage;
use md5::{Digest, Md5};

use crate::error::{Error, Result};

/// Mirrors the Python original's `get_video_metadata`.
#[derive(Clone, Debug)]
pub struct VideoMetadata {
    pub url: String,
    pub filename: String,
    pub duration: f64,
    pub fps: f64,
    pub width: u32,
    pub height: u32,
    pub total_frames: u64,
    pub resolution: String,
    pub aspect_ratio: String,
}

/// 12-hex MD5 of `"{path}_{filesize}"` ("Keyframe directory").
pub fn generate_video_id(path: &Path) -> std::io::Result<String> {
    let file_size = std::fs::metadata(path)?.len();
    let content = format!("{}_{file_size}", path.display());
    let digest = Md5::digest(content.as_bytes());
    Ok(format!("{digest:x}")[..12].to_string())
}

/// Classifies width:height into a common label, or falls back to the literal
/// ratio.
pub fn classify_aspect_ratio(width: u32, height: u32) -> String {
    if height == 0 {
        return format!("{width}:{height}");
    }
    let ratio = width as f64 / height as f64;
    if (ratio - 16.0 / 9.0).abs() < 0.1 {
        "16:9".to_string()
    } else if (ratio - 4.0 / 3.0).abs() < 0.1 {
        "4:3".to_string()
    } else if (ratio - 1.0).abs() < 0.1 {
        "1:1".to_string()
    } else {
        format!("{width}:{height}")
    }
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// Decodes just enough of the container to report duration/fps/resolution,
/// without running the change detector.
pub fn read_video_metadata(path: &Path) -> Result<VideoMetadata> {
    let input = ffmpeg_next::format::input(&path)
        .map_err(|e| Error::SourceUnavailable(e.to_string()))?;

    let stream = input
        .streams()
        .best(ffmpeg_next::media::Type::Video)
        .ok_or_else(|| Error::Decode("no decodable video stream".into()))?;

    let rate = stream.avg_frame_rate();
    let fps = if rate.denominator() != 0 {
        rate.numerator() as f64 / rate.denominator() as f64
    } else {
        0.0
    };

    let decoder_ctx = ffmpeg_next::codec::context::Context::from_parameters(stream.parameters())
        .map_err(|e| Error::Decode(e.to_string()))?;
    let decoder = decoder_ctx
        .decoder()
        .video()
        .map_err(|e| Error::Decode(e.to_string()))?;

    let width = decoder.width();
    let height = decoder.height();

    let time_base: f64 = stream.time_base().into();
    let stream_duration = stream.duration().max(0) as f64 * time_base;
    let total_frames = if stream.frames() > 0 {
        stream.frames() as u64
    } else if fps > 0.0 {
        (stream_duration * fps).round() as u64
    } else {
        0
    };
    let duration = if fps > 0.0 && total_frames > 0 {
        total_frames as f64 / fps
    } else {
        stream_duration
    };

    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let url = path
        .canonicalize()
        .unwrap_or_else(|_| path.to_path_buf())
        .display()
        .to_string();

    Ok(VideoMetadata {
        url: format!("local://{url}"),
        filename,
        duration: round2(duration),
        fps,
        width,
        height,
        total_frames,
        resolution: format!("{width}x{height}"),
        aspect_ratio: classify_aspect_ratio(width, height),
    })
}

/// Resizes (if wider than `max_width`) and JPEG-encodes a frame for
/// transport — different width/quality for file vs. webcam keyframes
///.
pub fn resize_and_encode_jpeg(frame: &RgbImage, max_width: u32, quality: u8) -> Result<Vec<u8>> {
    let resized = if frame.width() > max_width {
        let scale = max_width as f64 / frame.width() as f64;
        let new_height = ((frame.height() as f64) * scale).round().max(1.0) as u32;
        image::imageops::resize(frame, max_width, new_height, image::imageops::FilterType::Lanczos3)
    } else {
        frame.clone()
    };

    let mut bytes = Vec::new();
    let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut bytes, quality);
    encoder.encode_image(&resized)?;
    Ok(bytes)
}

/// Sequential (no-seek) decoder for a video file, used by the file-mode
/// threaded pipeline's reader thread ("Thread A reads the source
/// sequentially").
pub struct FileFrameSource {
    input: ffmpeg_next::format::context::Input,
    decoder: ffmpeg_next::decoder::Video,
    scaler: ffmpeg_next::software::scaling::Context,
    video_stream_index: usize,
    fps: f64,
    total_frames: u64,
}

impl FileFrameSource {
    pub fn open(path: &Path) -> Result<Self> {
        ffmpeg_next::init().map_err(|e| Error::SourceUnavailable(e.to_string()))?;
        let input =
            ffmpeg_next::format::input(&path).map_err(|e| Error::SourceUnavailable(e.to_string()))?;

        let (video_stream_index, fps, total_frames, parameters) = {
            let stream = input
                .streams()
                .best(ffmpeg_next::media::Type::Video)
                .ok_or_else(|| Error::Decode("no decodable video stream".into()))?;
            let rate = stream.avg_frame_rate();
            let fps = if rate.denominator() != 0 {
                rate.numerator() as f64 / rate.denominator() as f64
            } else {
                0.0
            };
            (stream.index(), fps, stream.frames().max(0) as u64, stream.parameters())
        };

        let decoder_ctx = ffmpeg_next::codec::context::Context::from_parameters(parameters)
            .map_err(|e| Error::Decode(e.to_string()))?;
        let decoder = decoder_ctx
            .decoder()
            .video()
            .map_err(|e| Error::Decode(e.to_string()))?;

        let scaler = ffmpeg_next::software::scaling::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg_next::format::Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            ffmpeg_next::software::scaling::Flags::BILINEAR,
        )
        .map_err(|e| Error::Decode(e.to_string()))?;

        Ok(Self { input, decoder, scaler, video_stream_index, fps, total_frames })
    }

    pub fn fps(&self) -> f64 {
        self.fps
    }

    pub fn total_frames(&self) -> u64 {
        self.total_frames
    }

    /// Walks the whole container once, in order, invoking `on_frame` for
    /// every `sample_step`-th decoded frame. Decimating here (rather than
    /// skipping decode work upstream) matches the original's choice to
    /// decode every frame but only queue sampled ones — container formats
    /// rarely allow cheap frame-skipping without breaking decoder state.
    pub fn for_each_sampled_frame(
        &mut self,
        sample_step: u64,
        mut on_frame: impl FnMut(u64, RgbImage) -> Result<()>,
    ) -> Result<()> {
        let video_stream_index = self.video_stream_index;
        let mut frame_index: u64 = 0;
        let mut decoded = ffmpeg_next::util::frame::Video::empty();

        for (stream, packet) in self.input.packets() {
            if stream.index() != video_stream_index {
                continue;
            }
            self.decoder
                .send_packet(&packet)
                .map_err(|e| Error::Decode(e.to_string()))?;
            while self.decoder.receive_frame(&mut decoded).is_ok() {
                if frame_index % sample_step == 0 {
                    let rgb = convert_to_rgb(&mut self.scaler, &decoded)?;
                    on_frame(frame_index, rgb)?;
                }
                frame_index += 1;
            }
        }

        self.decoder
            .send_eof()
            .map_err(|e| Error::Decode(e.to_string()))?;
        while self.decoder.receive_frame(&mut decoded).is_ok() {
            if frame_index % sample_step == 0 {
                let rgb = convert_to_rgb(&mut self.scaler, &decoded)?;
                on_frame(frame_index, rgb)?;
            }
            frame_index += 1;
        }

        Ok(())
    }

    /// Decodes the whole file a second time and returns the very last
    /// decodable frame, used by the file-mode pipeline's EOF bookend check
    /// ("force-capture with trigger = last"). Videos short enough
    /// to need this are, by construction, short enough that a second pass is
    /// cheap relative to the first.
    pub fn last_decodable_frame(path: &Path) -> Result<Option<(u64, RgbImage)>> {
        let mut source = Self::open(path)?;
        let mut last = None;
        source.for_each_sampled_frame(1, |idx, frame| {
            last = Some((idx, frame));
            Ok(())
        })?;
        Ok(last)
    }
}

fn convert_to_rgb(
    scaler: &mut ffmpeg_next::software::scaling::Context,
    decoded: &ffmpeg_next::util::frame::Video,
) -> Result<RgbImage> {
    let mut rgb_frame = ffmpeg_next::util::frame::Video::empty();
    scaler
        .run(decoded, &mut rgb_frame)
        .map_err(|e| Error::Decode(e.to_string()))?;

    let width = rgb_frame.width();
    let height = rgb_frame.height();
    let stride = rgb_frame.stride(0);
    let data = rgb_frame.data(0);

    let mut buffer = Vec::with_capacity((width * height * 3) as usize);
    for row in 0..height as usize {
        let start = row * stride;
        buffer.extend_from_slice(&data[start..start + width as usize * 3]);
    }

    RgbImage::from_raw(width, height, buffer)
        .ok_or_else(|| Error::Decode("decoded frame had an unexpected buffer size".into()))
}

/// Packages a batch of already-decoded JPEG frames into an mp4 clip at a
/// fixed frame rate. Used only by the
/// remote GPU client, which needs to hand the proxy a `video_url` content
/// part rather than individual images.
pub fn mux_jpegs_to_mp4(jpeg_frames: &[Vec<u8>], fps: u32) -> Result<Vec<u8>> {
    if jpeg_frames.is_empty() {
        return Err(Error::Decode("no frames to mux into mp4".into()));
    }

    let decoded: Vec<RgbImage> = jpeg_frames
        .iter()
        .map(|bytes| {
            image::load_from_memory(bytes)
                .map(|img| img.to_rgb8())
                .map_err(|e| Error::Decode(format!("failed to decode jpeg frame for mp4 mux: {e}")))
        })
        .collect::<Result<_>>()?;

    let (width, height) = (decoded[0].width(), decoded[0].height());

    let tmp = tempfile_path("compliance-remote-gpu", ".mp4")?;
    {
        let mut octx = ffmpeg_next::format::output(&tmp)
            .map_err(|e| Error::Decode(format!("failed to open mp4 muxer: {e}")))?;

        let codec = ffmpeg_next::encoder::find(ffmpeg_next::codec::Id::H264)
            .ok_or_else(|| Error::Decode("no h264 encoder available".into()))?;
        let mut stream = octx
            .add_stream(codec)
            .map_err(|e| Error::Decode(format!("failed to add mp4 video stream: {e}")))?;

        let mut encoder = ffmpeg_next::codec::context::Context::new_with_codec(codec)
            .encoder()
            .video()
            .map_err(|e| Error::Decode(format!("failed to open h264 encoder: {e}")))?;
        encoder.set_width(width);
        encoder.set_height(height);
        encoder.set_format(ffmpeg_next::format::Pixel::YUV420P);
        encoder.set_time_base(ffmpeg_next::Rational::new(1, fps as i32));
        let mut opened = encoder
            .open_as(codec)
            .map_err(|e| Error::Decode(format!("failed to finalize h264 encoder: {e}")))?;
        stream.set_parameters(&opened);

        let mut scaler = ffmpeg_next::software::scaling::Context::get(
            ffmpeg_next::format::Pixel::RGB24,
            width,
            height,
            ffmpeg_next::format::Pixel::YUV420P,
            width,
            height,
            ffmpeg_next::software::scaling::Flags::BILINEAR,
        )
        .map_err(|e| Error::Decode(e.to_string()))?;

        octx.write_header().map_err(|e| Error::Decode(format!("failed to write mp4 header: {e}")))?;

        let stream_index = 0usize;
        for (pts, frame) in decoded.iter().enumerate() {
            let mut rgb_frame = ffmpeg_next::util::frame::Video::new(
                ffmpeg_next::format::Pixel::RGB24,
                width,
                height,
            );
            rgb_frame.data_mut(0).copy_from_slice(frame.as_raw());

            let mut yuv_frame = ffmpeg_next::util::frame::Video::empty();
            scaler
                .run(&rgb_frame, &mut yuv_frame)
                .map_err(|e| Error::Decode(e.to_string()))?;
            yuv_frame.set_pts(Some(pts as i64));

            opened
                .send_frame(&yuv_frame)
                .map_err(|e| Error::Decode(format!("encoder rejected frame: {e}")))?;
            drain_encoder_packets(&mut opened, &mut octx, stream_index)?;
        }

        opened.send_eof().map_err(|e| Error::Decode(e.to_string()))?;
        drain_encoder_packets(&mut opened, &mut octx, stream_index)?;
        octx.write_trailer().map_err(|e| Error::Decode(format!("failed to write mp4 trailer: {e}")))?;
    }

    let bytes = std::fs::read(&tmp)?;
    let _ = std::fs::remove_file(&tmp);
    Ok(bytes)
}

fn drain_encoder_packets(
    encoder: &mut ffmpeg_next::encoder::Video,
    octx: &mut ffmpeg_next::format::context::Output,
    stream_index: usize,
) -> Result<()> {
    let mut packet = ffmpeg_next::Packet::empty();
    while encoder.receive_packet(&mut packet).is_ok() {
        packet.set_stream(stream_index);
        packet
            .write_interleaved(octx)
            .map_err(|e| Error::Decode(format!("failed to write mp4 packet: {e}")))?;
    }
    Ok(())
}

fn tempfile_path(prefix: &str, suffix: &str) -> Result<std::path::PathBuf> {
    let unique = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    Ok(std::env::temp_dir().join(format!("{prefix}-{unique}{suffix}")))
}

/// A single continuously-updated latest-frame cell for streaming sources,
/// fed by a webcam or RTSP source opened via `ffmpeg`'s device/network
/// demuxers.
pub struct StreamFrameSource {
    input: ffmpeg_next::format::context::Input,
    decoder: ffmpeg_next::decoder::Video,
    scaler: ffmpeg_next::software::scaling::Context,
    video_stream_index: usize,
}

impl StreamFrameSource {
    /// `source` is either a webcam device path (e.g. `/dev/video0`) or an
    /// RTSP URL; both are opened as ordinary `ffmpeg` inputs.
    pub fn open(source: &str) -> Result<Self> {
        ffmpeg_next::init().map_err(|e| Error::SourceUnavailable(e.to_string()))?;
        let input =
            ffmpeg_next::format::input(&source).map_err(|e| Error::SourceUnavailable(e.to_string()))?;

        let (video_stream_index, parameters) = {
            let stream = input
                .streams()
                .best(ffmpeg_next::media::Type::Video)
                .ok_or_else(|| Error::Decode("no decodable video stream".into()))?;
            (stream.index(), stream.parameters())
        };

        let decoder_ctx = ffmpeg_next::codec::context::Context::from_parameters(parameters)
            .map_err(|e| Error::Decode(e.to_string()))?;
        let decoder = decoder_ctx
            .decoder()
            .video()
            .map_err(|e| Error::Decode(e.to_string()))?;

        let scaler = ffmpeg_next::software::scaling::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg_next::format::Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            ffmpeg_next::software::scaling::Flags::BILINEAR,
        )
        .map_err(|e| Error::Decode(e.to_string()))?;

        Ok(Self { input, decoder, scaler, video_stream_index })
    }

    /// Grabs frames in a loop until `stop` is set, calling `on_frame` for
    /// each one ("continuously overwrites a single-slot latest-
    /// frame cell"). The caller's `on_frame` is expected to just store the
    /// frame, not process it — processing happens on the sampler thread.
    pub fn run_until_stopped(
        &mut self,
        stop: &AtomicBool,
        mut on_frame: impl FnMut(RgbImage),
    ) -> Result<()> {
        let video_stream_index = self.video_stream_index;
        let mut decoded = ffmpeg_next::util::frame::Video::empty();

        for (stream, packet) in self.input.packets() {
            if stop.load(Ordering::Relaxed) {
                break;
            }
            if stream.index() != video_stream_index {
                continue;
            }
            self.decoder
                .send_packet(&packet)
                .map_err(|e| Error::Decode(e.to_string()))?;
            while self.decoder.receive_frame(&mut decoded).is_ok() {
                let rgb = convert_to_rgb(&mut self.scaler, &decoded)?;
                on_frame(rgb);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mux_rejects_empty_frame_list() {
        let result = mux_jpegs_to_mp4(&[], 4);
        assert!(result.is_err());
    }

    #[test]
    fn classifies_common_aspect_ratios() {
        assert_eq!(classify_aspect_ratio(1920, 1080), "16:9");
        assert_eq!(classify_aspect_ratio(640, 480), "4:3");
        assert_eq!(classify_aspect_ratio(500, 500), "1:1");
        assert_eq!(classify_aspect_ratio(1000, 300), "1000:300");
    }

    #[test]
    fn video_id_is_twelve_hex_chars() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.mp4");
        std::fs::write(&path, b"not a real video, just needs a size").unwrap();

        let id = generate_video_id(&path).unwrap();
        assert_eq!(id.len(), 12);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn video_id_depends_on_size() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.mp4");
        let b = dir.path().join("b.mp4");
        std::fs::write(&a, b"short").unwrap();
        std::fs::write(&b, b"a little bit longer").unwrap();

        assert_ne!(generate_video_id(&a).unwrap(), generate_video_id(&b).unwrap());
    }

    #[test]
    fn resize_and_encode_shrinks_wide_frames() {
        let frame = RgbImage::from_pixel(1000, 500, image::Rgb([10, 20, 30]));
        let jpeg = resize_and_encode_jpeg(&frame, 500, 85).unwrap();
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!(decoded.width(), 500);
        assert_eq!(decoded.height(), 250);
    }

    #[test]
    fn resize_and_encode_leaves_narrow_frames_alone() {
        let frame = RgbImage::from_pixel(200, 100, image::Rgb([10, 20, 30]));
        let jpeg = resize_and_encode_jpeg(&frame, 768, 85).unwrap();
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!(decoded.width(), 200);
        assert_eq!(decoded.height(), 100);
    }
}
