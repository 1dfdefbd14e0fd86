//! restream: control plane for a live ffmpeg relay.
//!
//! An upstream RTMP relay receives a live feed; this crate probes it, runs a
//! single ffmpeg process that re-encodes it to an RTMP destination, and keeps
//! every connected client informed of the stream state.

pub mod api;
pub mod broadcast;
pub mod config;
pub mod encoder;
pub mod error;
pub mod logging;
pub mod probe;
pub mod signals;
pub mod supervisor;

pub use error::{Error, Result};
