//! Server binary for the MJPEG file streamer.
//!
//! Streams the frames of one local video file to every browser that opens
//! `/stream_video_file`, or an error image if the file cannot be opened.

use anyhow::Result;
use clap::Parser;
use mjpeg_file_streamer::config::{Args, StreamConfig};
use mjpeg_file_streamer::server;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing (logging)
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let config = StreamConfig::from_args(args)?;
    server::run(config).await
}
