//! Per-request frame production.
//!
//! `FrameStreamer` is a pull-based iterator: the first `next()` opens the
//! video source, every following call decodes one frame and re-encodes it
//! as a JPEG chunk. A source that cannot be opened yields a single PNG
//! chunk holding the error image. `stream` wraps the iterator into the
//! paced async body used by the HTTP handler.

use crate::config::{FrameRate, StreamConfig};
use crate::multipart::{FrameChunk, ImageKind};
use crate::video_source::{self, ActiveSources, Frame, SourceGuard, VideoSource};
use anyhow::{Context, Result};
use bytes::Bytes;
use futures_util::stream::{unfold, Stream};
use image::codecs::jpeg::JpegEncoder;
use std::convert::Infallible;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// JPEG quality used when re-encoding decoded frames.
pub const JPEG_QUALITY: u8 = 95;

/// Observable lifecycle of one stream.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum StreamState {
    Init,
    Open,
    ErrorEmitted,
    Closed,
}

enum Phase {
    Init,
    Open {
        source: Box<dyn VideoSource>,
        _guard: SourceGuard,
    },
    ErrorEmitted,
    Closed,
}

/// Produces the chunks of one stream request.
pub struct FrameStreamer {
    path: String,
    error_image: Bytes,
    active: ActiveSources,
    phase: Phase,
    frames_emitted: u64,
}

impl FrameStreamer {
    /// Creates a streamer for `path`. Nothing is opened until the first `next()`.
    pub fn new(path: impl Into<String>, error_image: Bytes) -> Self {
        Self {
            path: path.into(),
            error_image,
            active: ActiveSources::new(),
            phase: Phase::Init,
            frames_emitted: 0,
        }
    }

    /// Reports the open source in `active` while it is held.
    pub fn with_active_sources(mut self, active: ActiveSources) -> Self {
        self.active = active;
        self
    }

    pub fn state(&self) -> StreamState {
        match self.phase {
            Phase::Init => StreamState::Init,
            Phase::Open { .. } => StreamState::Open,
            Phase::ErrorEmitted => StreamState::ErrorEmitted,
            Phase::Closed => StreamState::Closed,
        }
    }

    pub fn frames_emitted(&self) -> u64 {
        self.frames_emitted
    }

    fn open_source(&mut self) -> Option<FrameChunk> {
        match video_source::open(&self.path) {
            Ok(source) => {
                info!("Opened video source {}", self.path);
                self.phase = Phase::Open {
                    source,
                    _guard: self.active.acquire(),
                };
                self.read_frame()
            }
            Err(e) => {
                warn!(
                    "Cannot open video source {}: {:#}. Sending error image.",
                    self.path, e
                );
                self.phase = Phase::ErrorEmitted;
                Some(FrameChunk::png(self.error_image.clone()))
            }
        }
    }

    fn read_frame(&mut self) -> Option<FrameChunk> {
        let Phase::Open { source, .. } = &mut self.phase else {
            return None;
        };

        let encoded = source
            .next_frame()
            .and_then(|frame| frame.map(|f| encode_jpeg(&f)).transpose());

        match encoded {
            Ok(Some(jpeg)) => {
                self.frames_emitted += 1;
                Some(FrameChunk::jpeg(jpeg))
            }
            Ok(None) => {
                info!(
                    "End of video stream {} reached after {} frames.",
                    self.path, self.frames_emitted
                );
                self.close();
                None
            }
            Err(e) => {
                warn!(
                    "Stopping stream of {} after {} frames: {:#}",
                    self.path, self.frames_emitted, e
                );
                self.close();
                None
            }
        }
    }

    /// Releases the source, if one is held.
    fn close(&mut self) {
        self.phase = Phase::Closed;
    }
}

impl Iterator for FrameStreamer {
    type Item = FrameChunk;

    fn next(&mut self) -> Option<FrameChunk> {
        match self.phase {
            Phase::Init => self.open_source(),
            Phase::Open { .. } => self.read_frame(),
            Phase::ErrorEmitted | Phase::Closed => {
                self.close();
                None
            }
        }
    }
}

/// Encodes one frame as a JPEG image.
pub fn encode_jpeg(frame: &Frame) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY)
        .encode_image(frame)
        .context("encode frame as JPEG")?;
    Ok(out)
}

/// Builds the paced response body for one stream request.
pub fn stream(
    config: &StreamConfig,
    active: &ActiveSources,
) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
    let streamer = FrameStreamer::new(config.video_path.clone(), config.error_image.clone())
        .with_active_sources(active.clone());
    paced(streamer, config.frame_rate)
}

/// Drives `streamer` on the blocking pool, pausing one frame interval after
/// every JPEG chunk. Dropping the returned stream drops the streamer and
/// with it the video source.
pub fn paced(
    streamer: FrameStreamer,
    frame_rate: FrameRate,
) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
    let pause = frame_rate.pause_interval();
    unfold(Some((streamer, Duration::ZERO)), move |state| async move {
        let (streamer, delay) = state?;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let pulled = tokio::task::spawn_blocking(move || {
            let mut streamer = streamer;
            let chunk = streamer.next();
            (streamer, chunk)
        })
        .await;

        let (streamer, chunk) = match pulled {
            Ok(pulled) => pulled,
            Err(e) => {
                error!("Frame decoding task failed: {}", e);
                return None;
            }
        };

        let chunk = chunk?;
        let delay = match chunk.kind {
            ImageKind::Jpeg => pause,
            ImageKind::Png => Duration::ZERO,
        };
        debug!(
            "Emitting {} chunk of {} bytes",
            chunk.kind.content_type(),
            chunk.payload.len()
        );
        Some((Ok::<_, Infallible>(chunk.encode()), Some((streamer, delay))))
    })
}
