//! Playback configuration.
//!
//! Mirrors the inward configuration surface of the pipeline. Every field
//! can also be changed at runtime through the [`Player`] accessors; a
//! `Config` is just a convenient bundle that can be read from TOML.
//!
//! ```toml
//! proxy = "http://proxy.lan:3128"
//! normalization = true
//! fallback_gain = -6.0
//! limiter = true
//! equalizer = [3.0, 2.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 2.0]
//! volume = 0.8
//! ```
//!
//! [`Player`]: crate::player::Player

use std::{fs, io, path::Path};

use serde::Deserialize;
use veil::Redact;

use crate::{
    error::Result,
    pipeline::{EQ_BANDS, EQ_MAX_GAIN, EQ_MIN_GAIN},
};

#[derive(Redact, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Explicit proxy preference. When unset the system default applies.
    /// Redacted in debug output since it may carry credentials.
    #[redact]
    pub proxy: Option<String>,

    /// Name of the output device. When unset the sink is auto-detected.
    pub device: Option<String>,

    /// Loudness normalization.
    pub normalization: bool,

    /// Gain in dB for streams without loudness metadata.
    pub fallback_gain: f32,

    /// Peak limiter after normalization.
    pub limiter: bool,

    /// Equalizer band gains in dB, lowest band first.
    pub equalizer: [f32; EQ_BANDS],

    /// Linear output volume.
    pub volume: f32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            proxy: None,
            device: None,
            normalization: true,
            fallback_gain: 0.0,
            limiter: true,
            equalizer: [0.0; EQ_BANDS],
            volume: 1.0,
        }
    }
}

impl Config {
    /// Parses a TOML document and clamps values into range.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for malformed TOML or unknown keys.
    pub fn from_toml(document: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(document)?;
        config.clamp();
        Ok(config)
    }

    /// Loads the configuration from a file. A missing file yields the
    /// defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(document) => {
                debug!("loading configuration from {}", path.display());
                Self::from_toml(&document)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(
                    "configuration file {} not found, using defaults",
                    path.display()
                );
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn clamp(&mut self) {
        for gain in &mut self.equalizer {
            *gain = gain.clamp(EQ_MIN_GAIN, EQ_MAX_GAIN);
        }
        self.volume = self.volume.clamp(0.0, 1.0);
        if self.proxy.as_deref().is_some_and(|proxy| proxy.trim().is_empty()) {
            self.proxy = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_is_default() {
        assert_eq!(Config::from_toml("").unwrap(), Config::default());
    }

    #[test]
    fn values_are_clamped() {
        let config = Config::from_toml(
            "volume = 3.0\nequalizer = [-30.0, 20.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]\nproxy = \"\"",
        )
        .unwrap();
        assert_eq!(config.volume, 1.0);
        assert_eq!(config.equalizer[0], EQ_MIN_GAIN);
        assert_eq!(config.equalizer[1], EQ_MAX_GAIN);
        assert_eq!(config.proxy, None);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(Config::from_toml("volume_db = 3").is_err());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = Config::load("/nonexistent/streamcore.toml").unwrap();
        assert_eq!(config, Config::default());
    }
}
