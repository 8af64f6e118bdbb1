//! Error taxonomy for the camera session protocol engine.
//!
//! Mirrors the taxonomy in the spec this crate implements: connect/CGI
//! failures are fatal at construction, protocol errors are fatal to the
//! session, camera-rejection errors surface only to the caller of
//! `VideoOn`/`AudioOn`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("connect to camera failed: {0}")]
    Connect(String),

    #[error("cgi request failed: {0}")]
    Cgi(String),

    #[error("invalid magic in protocol header")]
    InvalidMagic,

    #[error("invalid body length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("short buffer: needed {needed} bytes, have {have}")]
    ShortBuffer { needed: usize, have: usize },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("camera rejected {0} request")]
    Camera(&'static str),

    #[error("session lost: {0}")]
    SessionLost(String),

    #[error("configuration error: {0}")]
    Config(String),
}
