//! Client binary for the MJPEG file streamer.
//!
//! Connects to a running server, reads the multipart stream and reports or
//! saves every image it receives.

use anyhow::Result;
use clap::Parser;
use mjpeg_file_streamer::client::{run, ClientArgs};
use mjpeg_file_streamer::server::STREAM_PATH;
use std::path::PathBuf;
use tracing::info;

/// MJPEG File Streamer Client
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// The server's address, as host:port.
    #[arg(short, long, default_value = "127.0.0.1:5000")]
    server: String,

    /// The stream path to request.
    #[arg(short, long, default_value = STREAM_PATH)]
    path: String,

    /// Disconnect after this many images.
    #[arg(short, long)]
    max_frames: Option<usize>,

    /// Directory to save received images into.
    #[arg(short, long)]
    output_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing (logging)
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    let client_args = ClientArgs {
        server_addr: args.server,
        path: args.path,
        max_frames: args.max_frames,
        output_dir: args.output_dir,
    };

    let count = run(client_args).await?;
    info!("Stream finished after {} images.", count);
    println!("{}", count);

    Ok(())
}
