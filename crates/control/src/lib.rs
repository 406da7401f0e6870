//! Local control protocol for the upload engine.
//!
//! A companion shell talks to [`ControlServer`] over loopback TCP. Each
//! message is one JSON document ([`ControlRequest`](uplift_protocol::ControlRequest)
//! or [`ControlResponse`](uplift_protocol::ControlResponse)) in a
//! length-delimited frame.
//!
//! # Wire format
//!
//! ```text
//! [len: u32 BE][json: len bytes]
//! ```
//!
//! Frames above [`MAX_FRAME_LEN`] are rejected and close the connection.

pub mod client;
pub mod error;
pub mod server;

pub use client::ControlClient;
pub use error::ControlError;
pub use server::{ControlDefaults, ControlServer};

use std::time::Duration;

use tokio_util::codec::LengthDelimitedCodec;

/// Largest accepted frame (1 MiB).
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Timeout for connecting to a control server.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Frame codec shared by server and client.
pub fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec()
}
