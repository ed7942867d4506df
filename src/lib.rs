//! # MJPEG File Streamer Library
//!
//! This crate contains the shared logic for the MJPEG file streaming
//! server and client: configuration, video sources, the multipart wire
//! format, the per-request frame streamer and the HTTP surface.

pub mod client;
pub mod config;
pub mod multipart;
pub mod server;
pub mod streamer;
pub mod video_source;
