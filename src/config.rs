//! Compiler configuration.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Code generation options.
///
/// ```toml
/// intrinsics = true
/// memory_checks = false
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JitConfig {
    /// Inline the float intrinsics instead of dispatching to the natives.
    pub intrinsics: bool,
    /// Bounds-check indirect data accesses against the data segment.
    pub memory_checks: bool,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            intrinsics: true,
            memory_checks: true,
        }
    }
}

impl JitConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn with_intrinsics(mut self, enabled: bool) -> Self {
        self.intrinsics = enabled;
        self
    }

    pub fn with_memory_checks(mut self, enabled: bool) -> Self {
        self.memory_checks = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = JitConfig::default();
        assert!(config.intrinsics);
        assert!(config.memory_checks);
    }

    #[test]
    fn test_partial_toml() {
        let config = JitConfig::from_toml_str("intrinsics = false").unwrap();
        assert!(!config.intrinsics);
        assert!(config.memory_checks);
    }

    #[test]
    fn test_empty_toml() {
        assert_eq!(JitConfig::from_toml_str("").unwrap(), JitConfig::default());
    }

    #[test]
    fn test_bad_toml() {
        assert!(matches!(
            JitConfig::from_toml_str("intrinsics = \"yes\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jit.toml");
        fs::write(&path, "memory_checks = false\n").unwrap();
        let config = JitConfig::load(&path).unwrap();
        assert_eq!(config, JitConfig::default().with_memory_checks(false));
    }
}
