//! Layered configuration loading for the fields enumerated in spec §6,
//! built on the `config` crate (the layered defaults/file/env loader
//! `DA1F-RoAnalyzer` already carries for its own device settings).

use serde::Deserialize;

use crate::error::Error;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    pub uid: u32,
    pub user: String,
    pub password: String,
    pub downstream_port: u16,

    #[serde(default = "default_pipe_capacity")]
    pub pipe_capacity: usize,
    #[serde(default = "default_probe_size")]
    pub probe_size: usize,
    #[serde(default = "default_video_buffer_size")]
    pub video_buffer_size: usize,
    #[serde(default = "default_audio_buffer_size")]
    pub audio_buffer_size: usize,
}

fn default_pipe_capacity() -> usize {
    1024 * 1024
}

fn default_probe_size() -> usize {
    256 * 1024
}

fn default_video_buffer_size() -> usize {
    4096
}

fn default_audio_buffer_size() -> usize {
    4096
}

impl Settings {
    /// Loads settings layered as: built-in defaults → optional
    /// `foscam.toml` in the current directory → `FOSCAM_*` environment
    /// variable overrides (e.g. `FOSCAM_HOST`, `FOSCAM_PORT`).
    pub fn load() -> Result<Self, Error> {
        let builder = config::Config::builder()
            .set_default("port", 88)?
            .set_default("uid", 0)?
            .set_default("downstream_port", 8080)?
            .set_default("pipe_capacity", default_pipe_capacity() as i64)?
            .set_default("probe_size", default_probe_size() as i64)?
            .set_default("video_buffer_size", default_video_buffer_size() as i64)?
            .set_default("audio_buffer_size", default_audio_buffer_size() as i64)?
            .add_source(config::File::with_name("foscam").required(false))
            .add_source(config::Environment::with_prefix("FOSCAM"));

        let settings = builder.build().map_err(|e| Error::Config(e.to_string()))?;
        settings
            .try_deserialize()
            .map_err(|e| Error::Config(e.to_string()))
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::Config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_populate_optional_fields() {
        std::env::set_var("FOSCAM_HOST", "192.168.1.50");
        std::env::set_var("FOSCAM_USER", "admin");
        std::env::set_var("FOSCAM_PASSWORD", "secret");
        let settings = Settings::load().expect("settings should load from env alone");
        assert_eq!(settings.host, "192.168.1.50");
        assert_eq!(settings.port, 88);
        assert_eq!(settings.pipe_capacity, default_pipe_capacity());
        std::env::remove_var("FOSCAM_HOST");
        std::env::remove_var("FOSCAM_USER");
        std::env::remove_var("FOSCAM_PASSWORD");
    }
}
