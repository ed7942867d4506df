//! Video sources that decode a file into RGB frames.
//!
//! Two backends are available:
//! - `MjpegFileSource` reads a length-prefixed MJPEG container, where every
//!   frame is a 5-byte ASCII decimal length followed by the JPEG bytes.
//! - `FfmpegSource` (feature `ffmpeg`) decodes any container libav supports,
//!   including `.mjpeg` files that are bare concatenated JPEGs.
//!
//! `open` picks the backend from the file extension and, for `.mjpeg`, from
//! the first two bytes of the file. Every open source is
//! owned by exactly one stream and is closed when it is dropped.

use anyhow::{bail, Context, Result};
use image::{ImageFormat, RgbImage};
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Width of the ASCII length prefix in the MJPEG container.
pub const FRAME_LEN_DIGITS: usize = 5;

/// Start-of-image marker that opens every JPEG.
const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];

/// A decoded video frame.
pub type Frame = RgbImage;

/// A source of decoded frames.
pub trait VideoSource: Send {
    /// Reads the next frame. Returns `Ok(None)` on a clean end of stream.
    fn next_frame(&mut self) -> Result<Option<Frame>>;
}

/// Opens `path` with the backend matching its extension.
pub fn open(path: &str) -> Result<Box<dyn VideoSource>> {
    if path.is_empty() {
        bail!("video source path is empty");
    }
    if is_mjpeg_path(path) {
        #[cfg(feature = "ffmpeg")]
        {
            if is_bare_jpeg_sequence(path)? {
                return Ok(Box::new(ffmpeg_source::FfmpegSource::open(path)?));
            }
        }
        return Ok(Box::new(MjpegFileSource::open(path)?));
    }

    #[cfg(feature = "ffmpeg")]
    {
        Ok(Box::new(ffmpeg_source::FfmpegSource::open(path)?))
    }
    #[cfg(not(feature = "ffmpeg"))]
    {
        Err(anyhow::anyhow!(
            "decoding '{}' requires the ffmpeg feature (only length-prefixed .mjpeg/.mjpg files are built in)",
            path
        ))
    }
}

fn is_mjpeg_path(path: &str) -> bool {
    Path::new(path)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("mjpeg") || ext.eq_ignore_ascii_case("mjpg"))
        .unwrap_or(false)
}

fn starts_with_jpeg(reader: &mut impl BufRead) -> io::Result<bool> {
    Ok(reader.fill_buf()?.starts_with(&JPEG_SOI))
}

#[cfg(feature = "ffmpeg")]
fn is_bare_jpeg_sequence(path: &str) -> Result<bool> {
    let file = File::open(path).with_context(|| format!("failed to open '{}'", path))?;
    Ok(starts_with_jpeg(&mut BufReader::new(file))?)
}

/// Counts the video sources currently held open across all streams.
#[derive(Clone, Debug, Default)]
pub struct ActiveSources(Arc<AtomicUsize>);

impl ActiveSources {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of sources open right now.
    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    /// Registers one open source. The count drops again when the guard does.
    pub fn acquire(&self) -> SourceGuard {
        self.0.fetch_add(1, Ordering::SeqCst);
        SourceGuard(self.0.clone())
    }
}

/// Keeps one source registered in `ActiveSources` while alive.
#[derive(Debug)]
pub struct SourceGuard(Arc<AtomicUsize>);

impl Drop for SourceGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Reads frames from a length-prefixed MJPEG file.
pub struct MjpegFileSource {
    reader: BufReader<File>,
    frame_num: u64,
}

impl MjpegFileSource {
    /// Opens the given file.
    ///
    /// Fails on a file that starts with a JPEG marker instead of a length
    /// prefix, as written by `ffmpeg -f mjpeg`.
    pub fn open(path: &str) -> Result<Self> {
        let file =
            File::open(path).with_context(|| format!("failed to open MJPEG file '{}'", path))?;
        let mut reader = BufReader::new(file);
        if starts_with_jpeg(&mut reader).with_context(|| format!("failed to read '{}'", path))? {
            bail!("'{}' is a bare JPEG sequence without length prefixes", path);
        }
        debug!("Opened MJPEG file {}", path);
        Ok(Self {
            reader,
            frame_num: 0,
        })
    }

    /// Reads the next JPEG payload without decoding it.
    /// Returns `Ok(None)` on EOF.
    pub fn next_encoded(&mut self) -> io::Result<Option<Vec<u8>>> {
        let mut len_buf = [0u8; FRAME_LEN_DIGITS];
        match self.reader.read_exact(&mut len_buf) {
            Ok(_) => (),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }

        let len_str = std::str::from_utf8(&len_buf)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let frame_len = match len_str.trim().parse::<usize>() {
            Ok(len) => len,
            Err(e) => {
                warn!("Invalid frame length string: '{}'", len_str);
                return Err(io::Error::new(io::ErrorKind::InvalidData, e));
            }
        };

        let mut frame_data = vec![0u8; frame_len];
        self.reader.read_exact(&mut frame_data)?;

        self.frame_num += 1;
        Ok(Some(frame_data))
    }
}

impl VideoSource for MjpegFileSource {
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let Some(jpeg) = self
            .next_encoded()
            .with_context(|| format!("read MJPEG frame {}", self.frame_num + 1))?
        else {
            return Ok(None);
        };
        let image = image::load_from_memory_with_format(&jpeg, ImageFormat::Jpeg)
            .with_context(|| format!("decode MJPEG frame {}", self.frame_num))?;
        Ok(Some(image.to_rgb8()))
    }
}

/// Appends one JPEG frame to a length-prefixed MJPEG container.
pub fn write_mjpeg_frame<W: Write>(writer: &mut W, jpeg: &[u8]) -> Result<()> {
    let max_len = 10usize.pow(FRAME_LEN_DIGITS as u32) - 1;
    if jpeg.len() > max_len {
        bail!(
            "frame of {} bytes exceeds the container limit of {} bytes",
            jpeg.len(),
            max_len
        );
    }
    write!(writer, "{:0width$}", jpeg.len(), width = FRAME_LEN_DIGITS)?;
    writer.write_all(jpeg)?;
    Ok(())
}

#[cfg(feature = "ffmpeg")]
mod ffmpeg_source {
    //! Local file decoding through libav.

    use super::{Frame, VideoSource};
    use anyhow::{anyhow, Context, Result};
    use ffmpeg_next as ffmpeg;
    use image::RgbImage;
    use tracing::{debug, info};

    pub(crate) struct FfmpegSource {
        path: String,
        input: ffmpeg::format::context::Input,
        stream_index: usize,
        decoder: ffmpeg::codec::decoder::Video,
        scaler: ffmpeg::software::scaling::Context,
        frame_count: u64,
        eof_sent: bool,
    }

    impl FfmpegSource {
        pub(crate) fn open(path: &str) -> Result<Self> {
            ffmpeg::init().context("initialize ffmpeg")?;
            let input = ffmpeg::format::input(&path)
                .with_context(|| format!("failed to open '{}' with ffmpeg", path))?;
            let input_stream = input
                .streams()
                .best(ffmpeg::media::Type::Video)
                .ok_or_else(|| anyhow!("'{}' has no video track", path))?;
            let stream_index = input_stream.index();
            let context =
                ffmpeg::codec::context::Context::from_parameters(input_stream.parameters())
                    .context("load video decoder parameters")?;
            let decoder = context
                .decoder()
                .video()
                .context("open ffmpeg video decoder")?;

            let scaler = ffmpeg::software::scaling::Context::get(
                decoder.format(),
                decoder.width(),
                decoder.height(),
                ffmpeg::util::format::pixel::Pixel::RGB24,
                decoder.width(),
                decoder.height(),
                ffmpeg::software::scaling::flag::Flags::BILINEAR,
            )
            .context("create ffmpeg scaler")?;

            info!(
                "Opened {} with ffmpeg ({}x{})",
                path,
                decoder.width(),
                decoder.height()
            );

            Ok(Self {
                path: path.to_string(),
                input,
                stream_index,
                decoder,
                scaler,
                frame_count: 0,
                eof_sent: false,
            })
        }

        fn convert_frame(&mut self, decoded: &ffmpeg::frame::Video) -> Result<Frame> {
            let mut rgb_frame = ffmpeg::frame::Video::empty();
            self.scaler
                .run(decoded, &mut rgb_frame)
                .context("scale frame to RGB")?;

            let width = rgb_frame.width();
            let height = rgb_frame.height();
            let row_bytes = width as usize * 3;
            let stride = rgb_frame.stride(0);
            let data = rgb_frame.data(0);

            let mut pixels = Vec::with_capacity(row_bytes * height as usize);
            for row in 0..height as usize {
                let start = row * stride;
                pixels.extend_from_slice(
                    data.get(start..start + row_bytes)
                        .context("ffmpeg frame row is out of bounds")?,
                );
            }

            RgbImage::from_raw(width, height, pixels)
                .ok_or_else(|| anyhow!("decoded frame does not match {}x{}", width, height))
        }
    }

    impl VideoSource for FfmpegSource {
        fn next_frame(&mut self) -> Result<Option<Frame>> {
            let mut decoded = ffmpeg::frame::Video::empty();
            loop {
                if self.decoder.receive_frame(&mut decoded).is_ok() {
                    let frame = self.convert_frame(&decoded)?;
                    self.frame_count += 1;
                    return Ok(Some(frame));
                }
                if self.eof_sent {
                    debug!("{} decoded {} frames", self.path, self.frame_count);
                    return Ok(None);
                }

                match self.input.packets().next() {
                    Some((stream, packet)) => {
                        if stream.index() != self.stream_index {
                            continue;
                        }
                        self.decoder
                            .send_packet(&packet)
                            .with_context(|| format!("send packet from {} to decoder", self.path))?;
                    }
                    None => {
                        self.decoder.send_eof().context("flush ffmpeg decoder")?;
                        self.eof_sent = true;
                    }
                }
            }
        }
    }
}
