//! Error taxonomy for the subscriber stream and remux worker. Mirrors
//! `foscam_core::Error`'s shape (`thiserror`-derived, one crate-level enum)
//! but scoped to codec-library failures, which are always fatal to a single
//! subscriber and never to the session or its siblings (spec §7).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("remux init failed: {0}")]
    RemuxInit(String),

    #[error("remux runtime error: {0}")]
    RemuxRuntime(String),
}
