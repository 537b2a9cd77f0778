//! Responder configuration.
//!
//! Values come from an optional TOML file; CLI flags in `main.rs` override
//! whatever the file sets.

use crate::error::{Result, ScpError};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Order in which Source emits the entries of a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListingOrder {
    /// Stable byte-wise sort by entry name
    #[default]
    Name,
    /// Whatever order the directory listing returns
    Native,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResponderConfig {
    /// Consecutive unparseable records tolerated inside an open directory
    pub max_desync_records: u32,
    /// Deadline for each individual channel or filesystem operation
    pub op_timeout_secs: Option<u64>,
    pub listing_order: ListingOrder,
    /// Resolve `~` and `~/...` in the requested path
    pub expand_tilde: bool,
}

impl Default for ResponderConfig {
    fn default() -> Self {
        Self {
            max_desync_records: 3,
            op_timeout_secs: None,
            listing_order: ListingOrder::Name,
            expand_tilde: true,
        }
    }
}

impl ResponderConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ScpError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| ScpError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_desync_records == 0 {
            return Err(ScpError::Config(
                "max_desync_records must be at least 1".to_string(),
            ));
        }
        if self.op_timeout_secs == Some(0) {
            return Err(ScpError::Config(
                "op_timeout_secs must be positive when set".to_string(),
            ));
        }
        Ok(())
    }

    pub fn op_timeout(&self) -> Option<Duration> {
        self.op_timeout_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_toml_gives_defaults() {
        let config = ResponderConfig::from_toml("").unwrap();
        assert_eq!(config, ResponderConfig::default());
        assert_eq!(config.op_timeout(), None);
    }

    #[test]
    fn test_partial_toml() {
        let config = ResponderConfig::from_toml(
            r#"
            op_timeout_secs = 30
            listing_order = "native"
            "#,
        )
        .unwrap();
        assert_eq!(config.op_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.listing_order, ListingOrder::Native);
        assert_eq!(config.max_desync_records, 3);
        assert!(config.expand_tilde);
    }

    #[test]
    fn test_rejects_zero_desync_bound() {
        let err = ResponderConfig::from_toml("max_desync_records = 0").unwrap_err();
        assert!(matches!(err, ScpError::Config(_)));
    }

    #[test]
    fn test_rejects_unknown_keys() {
        assert!(ResponderConfig::from_toml("block_size = 4096").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("scp.toml");
        std::fs::write(&path, "expand_tilde = false\n").unwrap();
        let config = ResponderConfig::load(&path).unwrap();
        assert!(!config.expand_tilde);

        assert!(ResponderConfig::load(&tmp.path().join("missing.toml")).is_err());
    }
}
