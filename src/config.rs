//! Engine settings, read from TOML
use std::ops::RangeInclusive;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Jumps allowed in one advancement before it is reported as a loop.
    pub max_jumps: usize,
    pub webservice_timeout_secs: u64,
    /// Times the same create action may appear in one chain of record creations.
    pub create_recursion_limit: usize,
    pub date_min_year: i32,
    pub date_max_year: i32,
    pub default_notify_recipients: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_jumps: 100,
            webservice_timeout_secs: 30,
            create_recursion_limit: 1,
            date_min_year: 1800,
            date_max_year: 9999,
            default_notify_recipients: vec![],
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(source)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    pub fn date_years(&self) -> RangeInclusive<i32> {
        self.date_min_year..=self.date_max_year
    }

    pub fn webservice_timeout(&self) -> Duration {
        Duration::from_secs(self.webservice_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_keys_use_defaults() {
        let config = EngineConfig::from_toml_str("max_jumps = 5\n").unwrap();
        assert_eq!(config.max_jumps, 5);
        assert_eq!(config.create_recursion_limit, 1);
        assert_eq!(config.date_years(), 1800..=9999);
    }

    #[test]
    fn bad_toml_is_a_parse_error() {
        assert!(matches!(
            EngineConfig::from_toml_str("max_jumps = \"many\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        std::fs::write(
            &path,
            "webservice_timeout_secs = 5\ndefault_notify_recipients = [\"ops@localhost\"]\n",
        )
        .unwrap();
        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.webservice_timeout(), Duration::from_secs(5));
        assert_eq!(config.default_notify_recipients, vec!["ops@localhost".to_string()]);
        assert!(matches!(
            EngineConfig::load(dir.path().join("missing.toml")),
            Err(ConfigError::Io(_))
        ));
    }
}
