//! Channel configuration, loaded from TOML.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::transfer::{DEFAULT_CHUNK_SIZE, DEFAULT_SINK_CAPACITY};
use crate::wire::MAX_FRAME_LEN;

/// Per-channel settings. Every field has a default, so an empty file is valid.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelConfig {
    /// Received files go under `work_dir/<session id>` (default `xbridge-work`).
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    /// Plaintext bytes per `File` envelope (default 256 KiB).
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Queue depth in front of the file write worker (default 64).
    #[serde(default = "default_sink_capacity")]
    pub sink_capacity: usize,
    /// Outbound envelopes buffered ahead of the writer task (default 32).
    #[serde(default = "default_outbound_capacity")]
    pub outbound_capacity: usize,
    /// Largest accepted inbound frame (default 16 MiB).
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: u32,
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("xbridge-work")
}
fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}
fn default_sink_capacity() -> usize {
    DEFAULT_SINK_CAPACITY
}
fn default_outbound_capacity() -> usize {
    32
}
fn default_max_frame_len() -> u32 {
    MAX_FRAME_LEN
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            work_dir: default_work_dir(),
            chunk_size: default_chunk_size(),
            sink_capacity: default_sink_capacity(),
            outbound_capacity: default_outbound_capacity(),
            max_frame_len: default_max_frame_len(),
        }
    }
}

impl ChannelConfig {
    /// Defaults with a different working directory.
    pub fn with_work_dir(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            ..Self::default()
        }
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let s = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&s)?;
        if config.chunk_size == 0 || config.max_frame_len == 0 {
            return Err(ConfigError::Invalid(
                "chunk_size and max_frame_len must be non-zero".into(),
            ));
        }
        // Outbound frames are always capped at the wire limit.
        if config.max_frame_len > MAX_FRAME_LEN {
            return Err(ConfigError::Invalid(format!(
                "max_frame_len exceeds the wire limit of {MAX_FRAME_LEN}"
            )));
        }
        // An encrypted chunk plus envelope overhead has to fit in one frame.
        if config.chunk_size as u64 + 1024 > config.max_frame_len as u64 {
            return Err(ConfigError::Invalid(
                "chunk_size does not fit in max_frame_len".into(),
            ));
        }
        Ok(config)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config file: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(contents: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("xbridge.toml");
        std::fs::write(&path, contents).unwrap();
        (dir, path)
    }

    #[test]
    fn empty_file_is_defaults() {
        let (_dir, path) = write("");
        assert_eq!(ChannelConfig::load(&path).unwrap(), ChannelConfig::default());
    }

    #[test]
    fn partial_override() {
        let (_dir, path) = write("work_dir = \"/var/lib/xbridge\"\nchunk_size = 4096\n");
        let config = ChannelConfig::load(&path).unwrap();
        assert_eq!(config.work_dir, PathBuf::from("/var/lib/xbridge"));
        assert_eq!(config.chunk_size, 4096);
        assert_eq!(config.sink_capacity, 64);
    }

    #[test]
    fn unknown_keys_rejected() {
        let (_dir, path) = write("chunk_sz = 1\n");
        assert!(matches!(
            ChannelConfig::load(&path),
            Err(ConfigError::Toml(_))
        ));
    }

    #[test]
    fn chunk_must_fit_frame() {
        let (_dir, path) = write("chunk_size = 8192\nmax_frame_len = 4096\n");
        assert!(matches!(
            ChannelConfig::load(&path),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn frame_limit_capped_at_wire_limit() {
        let (_dir, path) = write("chunk_size = 20971520\nmax_frame_len = 33554432\n");
        assert!(matches!(
            ChannelConfig::load(&path),
            Err(ConfigError::Invalid(_))
        ));

        let (_dir, path) = write(&format!("max_frame_len = {MAX_FRAME_LEN}\n"));
        assert_eq!(ChannelConfig::load(&path).unwrap().max_frame_len, MAX_FRAME_LEN);
    }
}
