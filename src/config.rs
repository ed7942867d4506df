//! Startup configuration for the streaming server.
//!
//! Everything is resolved once in `StreamConfig::from_args` and never
//! changes afterwards. A missing video path is a usage error reported by
//! clap; a bad frame rate is corrected to the default instead.

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::builder::NonEmptyStringValueParser;
use clap::Parser;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

pub const DEFAULT_FRAME_RATE: u32 = 30;
pub const MIN_FRAME_RATE: u32 = 1;
pub const MAX_FRAME_RATE: u32 = 120;
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:5000";
pub const DEFAULT_ERROR_IMAGE: &str = "static/playback_error.png";

/// Frames per second, always within `MIN_FRAME_RATE..=MAX_FRAME_RATE`.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct FrameRate(u32);

impl FrameRate {
    /// Accepts `value` if it is in range.
    pub fn new(value: i64) -> Option<Self> {
        let range = i64::from(MIN_FRAME_RATE)..=i64::from(MAX_FRAME_RATE);
        range.contains(&value).then(|| Self(value as u32))
    }

    /// Parses a user-supplied rate, rejecting non-numeric and out-of-range input.
    pub fn try_parse(input: &str) -> Option<Self> {
        input.trim().parse::<i64>().ok().and_then(Self::new)
    }

    /// Like `try_parse`, but falls back to the default for anything invalid or absent.
    pub fn parse_or_default(input: Option<&str>) -> Self {
        input.and_then(Self::try_parse).unwrap_or_default()
    }

    pub fn get(self) -> u32 {
        self.0
    }

    /// Delay between two emitted frames.
    pub fn pause_interval(self) -> Duration {
        Duration::from_secs(1) / self.0
    }
}

impl Default for FrameRate {
    fn default() -> Self {
        Self(DEFAULT_FRAME_RATE)
    }
}

impl fmt::Display for FrameRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} fps", self.0)
    }
}

/// MJPEG File Streamer Server
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to the video file to stream.
    #[arg(env = "STREAMER_VIDEO", value_parser = NonEmptyStringValueParser::new())]
    pub video: String,

    /// Frames per second (1-120). Invalid values fall back to 30.
    #[arg(short, long, env = "STREAMER_FRAME_RATE", allow_hyphen_values = true)]
    pub frame_rate: Option<String>,

    /// Address the HTTP server listens on.
    #[arg(short, long, env = "STREAMER_BIND", default_value = DEFAULT_BIND_ADDR)]
    pub bind: String,

    /// Image sent instead of the video when it cannot be opened.
    #[arg(long, env = "STREAMER_ERROR_IMAGE", default_value = DEFAULT_ERROR_IMAGE)]
    pub error_image: PathBuf,
}

/// Immutable settings shared by every stream request.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub video_path: String,
    pub frame_rate: FrameRate,
    pub bind_addr: String,
    pub error_image: Bytes,
}

impl StreamConfig {
    pub fn new(video_path: impl Into<String>, frame_rate: FrameRate, error_image: Bytes) -> Self {
        Self {
            video_path: video_path.into(),
            frame_rate,
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            error_image,
        }
    }

    /// Resolves parsed arguments, loading the error image from disk.
    pub fn from_args(args: Args) -> Result<Self> {
        let frame_rate = match args.frame_rate.as_deref() {
            Some(raw) => FrameRate::try_parse(raw).unwrap_or_else(|| {
                warn!(
                    "Ignoring invalid frame rate '{}', using {}",
                    raw,
                    FrameRate::default()
                );
                FrameRate::default()
            }),
            None => FrameRate::default(),
        };
        let error_image = load_error_image(&args.error_image)?;

        info!(
            "Configured to stream {} at {} on {}",
            args.video, frame_rate, args.bind
        );

        Ok(Self {
            video_path: args.video,
            frame_rate,
            bind_addr: args.bind,
            error_image,
        })
    }
}

/// Reads the fallback image once at startup.
pub fn load_error_image(path: &Path) -> Result<Bytes> {
    let data = std::fs::read(path)
        .with_context(|| format!("failed to read error image '{}'", path.display()))?;
    Ok(Bytes::from(data))
}
