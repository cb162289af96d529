//! Configuration for the vigil client
//!
//! Settings load from a TOML file (default location under the platform config
//! directory) with CLI/env overrides applied by `main`. The core treats the
//! loaded values as immutable for the duration of a turn.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::{Error, Result};

/// Default assistant server address
const DEFAULT_SERVER: &str = "http://127.0.0.1:8787";

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Assistant server base address
    pub server_address: String,

    /// Enable wake word spotting
    pub wake_word_enabled: bool,

    /// Wake phrase to listen for
    pub wake_phrase: String,

    /// Keyword spotting sensitivity in `[0.0, 1.0]`; higher triggers on
    /// quieter speech
    pub spotting_sensitivity: f32,

    /// Transcription endpoint; defaults to `{server_address}/transcribe`
    pub stt_url: Option<String>,

    /// Transcription model identifier
    pub stt_model: String,

    /// Bearer token for the transcription endpoint, if required
    pub api_key: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_address: DEFAULT_SERVER.to_string(),
            wake_word_enabled: true,
            wake_phrase: "hey vigil".to_string(),
            spotting_sensitivity: 0.5,
            stt_url: None,
            stt_model: "whisper-1".to_string(),
            api_key: None,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// A missing file at the default location yields defaults; an explicitly
    /// provided path must exist.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed, or if the
    /// resulting values are invalid.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (Self::default_path(), false),
        };

        let config = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            let config: Self = toml::from_str(&raw)?;
            tracing::debug!(path = %path.display(), "configuration loaded");
            config
        } else if required {
            return Err(Error::Config(format!(
                "config file not found: {}",
                path.display()
            )));
        } else {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            Self::default()
        };

        config.validate()?;
        Ok(config)
    }

    /// Default config file location under the platform config directory
    #[must_use]
    pub fn default_path() -> PathBuf {
        directories::ProjectDirs::from("dev", "omni", "vigil").map_or_else(
            || PathBuf::from("vigil.toml"),
            |dirs| dirs.config_dir().join("vigil.toml"),
        )
    }

    /// Parsed assistant server base URL
    ///
    /// # Errors
    ///
    /// Returns error if the configured address is not a valid URL.
    pub fn server_url(&self) -> Result<Url> {
        Url::parse(&self.server_address)
            .map_err(|e| Error::Config(format!("invalid server address: {e}")))
    }

    /// Transcription endpoint URL
    ///
    /// # Errors
    ///
    /// Returns error if the configured address is not a valid URL.
    pub fn stt_url(&self) -> Result<Url> {
        match &self.stt_url {
            Some(url) => {
                Url::parse(url).map_err(|e| Error::Config(format!("invalid stt url: {e}")))
            }
            None => {
                let mut url = self.server_url()?;
                url.set_path("/transcribe");
                Ok(url)
            }
        }
    }

    /// Validate configured values
    ///
    /// # Errors
    ///
    /// Returns error if any value is out of range or unparseable.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.spotting_sensitivity) {
            return Err(Error::Config(format!(
                "spotting_sensitivity must be in [0.0, 1.0], got {}",
                self.spotting_sensitivity
            )));
        }
        if self.wake_word_enabled && self.wake_phrase.trim().is_empty() {
            return Err(Error::Config(
                "wake_phrase required when wake word is enabled".to_string(),
            ));
        }
        self.server_url()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert!(config.wake_word_enabled);
    }

    #[test]
    fn stt_url_derived_from_server() {
        let config = Config {
            server_address: "http://10.0.0.2:9000".to_string(),
            ..Config::default()
        };
        assert_eq!(
            config.stt_url().unwrap().as_str(),
            "http://10.0.0.2:9000/transcribe"
        );
    }

    #[test]
    fn rejects_out_of_range_sensitivity() {
        let config = Config {
            spotting_sensitivity: 1.5,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_toml_with_partial_fields() {
        let raw = r#"
            server_address = "http://assistant.local:8080"
            spotting_sensitivity = 0.8
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.server_address, "http://assistant.local:8080");
        assert!((config.spotting_sensitivity - 0.8).abs() < f32::EPSILON);
        assert_eq!(config.wake_phrase, "hey vigil");
    }

    #[test]
    fn loads_from_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vigil.toml");
        std::fs::write(&path, "wake_phrase = \"hey nova\"\n").unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.wake_phrase, "hey nova");
        assert_eq!(config.server_address, DEFAULT_SERVER);
    }

    #[test]
    fn missing_explicit_path_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        assert!(Config::load(Some(&path)).is_err());
    }
}
