//! Camera session protocol engine: byte pipes, the wire codec, the CGI
//! client, and the camera session state machine (components A-D).
//! `foscam-remux` builds the stream fan-out/remux pipeline (components
//! E-F) on top of this crate's [`session::MediaSink`] trait.

pub mod cgi;
pub mod config;
pub mod error;
pub mod pipe;
pub mod session;
pub mod wire;

pub use config::Settings;
pub use error::Error;
pub use pipe::PipeBuffer;
pub use session::{MediaSink, Session, SessionState};
