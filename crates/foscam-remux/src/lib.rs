//! Stream fan-out and remux pipeline (components E-F): per-subscriber byte
//! pipes plus the H.264-passthrough/AC3-transcode remux worker that turns
//! them into a fragmented-MP4 stream. Builds on `foscam_core::Session` via
//! the `MediaSink` trait so this crate owns the only `ffmpeg-the-third`
//! dependency in the workspace.

mod avio;
pub mod error;
pub mod stream;
pub mod worker;

pub use error::Error;
pub use stream::{Subscriber, SubscriberConfig};
pub use worker::{RemuxWorker, WorkerConfig};
