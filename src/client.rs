//! A command-line consumer of the MJPEG stream.
//!
//! `StreamConnection` issues the GET with hyper's pooled client and feeds
//! each body frame to a `PartReader`. `run` drives one connection, optionally
//! saving every received image to a directory.

use crate::multipart::{Part, PartReader, STREAM_CONTENT_TYPE};
use anyhow::{bail, Context, Result};
use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::body::Incoming;
use hyper::header::{self, HeaderMap};
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::path::PathBuf;
use tracing::{debug, info};

/// Arguments required to run the client.
#[derive(Clone, Debug)]
pub struct ClientArgs {
    pub server_addr: String,
    pub path: String,
    pub max_frames: Option<usize>,
    pub output_dir: Option<PathBuf>,
}

/// An open MJPEG stream response.
///
/// Dropping it drops the response body, which closes the connection.
pub struct StreamConnection {
    headers: HeaderMap,
    body: Incoming,
    parts: PartReader,
    finished: bool,
}

impl StreamConnection {
    /// Connects to `server_addr` and requests `path`.
    ///
    /// Fails unless the server answers 200 with a multipart stream.
    pub async fn connect(server_addr: &str, path: &str) -> Result<Self> {
        let uri = format!("http://{}{}", server_addr, path);
        let client = Client::builder(TokioExecutor::new()).build_http::<Empty<Bytes>>();

        let req = Request::builder()
            .method(Method::GET)
            .uri(&uri)
            .header(header::ACCEPT, STREAM_CONTENT_TYPE)
            .body(Empty::new())
            .with_context(|| format!("Invalid stream URL '{}'", uri))?;

        debug!("GET {}", uri);
        let response = client
            .request(req)
            .await
            .with_context(|| format!("Failed to connect to server at {}", server_addr))?;
        info!("Connected to streaming server at {}", server_addr);

        let status = response.status();
        if status != StatusCode::OK {
            bail!("Server returned status {} for {}", status.as_u16(), path);
        }

        let (head, body) = response.into_parts();
        let connection = Self {
            headers: head.headers,
            body,
            parts: PartReader::new(),
            finished: false,
        };
        let content_type = connection.content_type().unwrap_or("");
        if !content_type.starts_with("multipart/x-mixed-replace") {
            bail!("Unexpected content type '{}'", content_type);
        }
        Ok(connection)
    }

    /// Headers of the stream response.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
    }

    /// Waits for the next complete part. Returns `Ok(None)` once the stream ends.
    pub async fn next_part(&mut self) -> Result<Option<Part>> {
        loop {
            if let Some(part) = self.parts.next_part()? {
                return Ok(Some(part));
            }
            if self.finished {
                return self.parts.finish();
            }

            match self.body.frame().await {
                Some(frame) => {
                    let frame = frame.context("Failed to read from stream")?;
                    if let Ok(data) = frame.into_data() {
                        self.parts.push(&data);
                    }
                }
                None => self.finished = true,
            }
        }
    }
}

/// Streams from the server until it ends or `max_frames` parts arrived.
/// Returns the number of parts received.
pub async fn run(args: ClientArgs) -> Result<usize> {
    if let Some(dir) = &args.output_dir {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }

    let mut connection = StreamConnection::connect(&args.server_addr, &args.path).await?;
    let mut count = 0;

    while args.max_frames.map_or(true, |max| count < max) {
        let Some(part) = connection.next_part().await? else {
            break;
        };
        count += 1;
        let content_type = part.content_type().unwrap_or("unknown");
        info!(
            "Received part {} ({}, {} bytes)",
            count,
            content_type,
            part.body.len()
        );

        if let Some(dir) = &args.output_dir {
            let extension = part.kind().map(|k| k.extension()).unwrap_or("bin");
            let file = dir.join(format!("frame_{:06}.{}", count, extension));
            tokio::fs::write(&file, &part.body)
                .await
                .with_context(|| format!("Failed to write {}", file.display()))?;
        }
    }

    if args.max_frames == Some(count) {
        info!("Received {} parts, disconnecting.", count);
    }
    Ok(count)
}
