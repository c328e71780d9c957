//! Gateway configuration
//!
//! Loaded once at startup from TOML, validated, and then passed by reference
//! (or `Arc`) into every component that needs it. Nothing reads configuration
//! through globals.
//!
//! ```
//! use s3gw::config::GatewayConfig;
//!
//! let config = GatewayConfig::from_toml_str(r#"
//!     [write]
//!     max_fragments = 8
//! "#).unwrap();
//!
//! assert_eq!(config.write.max_fragments, 8);
//! assert_eq!(config.ids.max_collision_retries, 20);
//! ```

use crate::core::oid::{ObjectId, MAX_COLLISION_RETRIES};
use crate::error::{GatewayError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use validator::Validate;

/// Well-known id of the probable-delete (tombstone) index
///
/// Global indexes live inside the reserved id range, so generated object ids
/// can never collide with them.
pub const DEFAULT_LEDGER_INDEX: ObjectId = ObjectId::from_parts(0, 0x3);

/// How object ids are produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum IdMode {
    /// Hash of the request URI
    #[default]
    Deterministic,
    /// Uniformly random
    Random,
}

/// One row of the size → layout table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutBracket {
    /// Largest object size (inclusive) served by this layout
    pub max_size: u64,
    /// Backend layout id
    pub layout_id: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct IdConfig {
    pub mode: IdMode,

    #[validate(range(min = 1, max = 1000))]
    pub max_collision_retries: u32,
}

impl Default for IdConfig {
    fn default() -> Self {
        IdConfig {
            mode: IdMode::Deterministic,
            max_collision_retries: MAX_COLLISION_RETRIES,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct LayoutConfig {
    /// Size brackets; sorted at load time
    #[validate(length(min = 1))]
    pub brackets: Vec<LayoutBracket>,

    /// Layout used for anything larger than `size_cap`
    #[validate(range(min = 1, max = 14))]
    pub max_layout_id: u8,

    /// Objects above this size always get `max_layout_id`
    pub size_cap: u64,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        // 4 KiB objects get the 4 KiB unit layout, and so on up to 1 MiB units.
        let brackets = (1u8..=9)
            .map(|layout_id| LayoutBracket {
                max_size: 4096u64 << (layout_id - 1),
                layout_id,
            })
            .chain([
                LayoutBracket {
                    max_size: 4 * 1024 * 1024,
                    layout_id: 10,
                },
                LayoutBracket {
                    max_size: 16 * 1024 * 1024,
                    layout_id: 11,
                },
            ])
            .collect();

        LayoutConfig {
            brackets,
            max_layout_id: 12,
            size_cap: 16 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct WriteConfig {
    /// Layout units carried by one backend write
    #[validate(range(min = 1, max = 1024))]
    pub payload_units: u32,

    /// Consecutive write failures on one backend object before splitting
    #[validate(range(min = 1, max = 100))]
    pub failures_before_fragment: u32,

    /// Upper bound on fragments per logical object
    #[validate(range(min = 1, max = 1000))]
    pub max_fragments: u32,
}

impl Default for WriteConfig {
    fn default() -> Self {
        WriteConfig {
            payload_units: 4,
            failures_before_fragment: 1,
            max_fragments: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct LedgerConfig {
    pub index_id: ObjectId,

    /// Prefix keys with a size-class character to spread ledger load
    pub bucket_keys: bool,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        LedgerConfig {
            index_id: DEFAULT_LEDGER_INDEX,
            bucket_keys: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct BackendConfig {
    /// Longest the event loop waits for any completion before declaring a stall
    #[validate(range(min = 1))]
    pub join_wait_timeout_ms: u64,

    /// Timeouts within the window that trigger a graceful drain
    #[validate(range(min = 1))]
    pub etimedout_max_threshold: u32,

    #[validate(range(min = 1))]
    pub etimedout_window_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig {
            join_wait_timeout_ms: 30_000,
            etimedout_max_threshold: 16,
            etimedout_window_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceConfig {
    /// Written into every tombstone so the reaper can skip live writers
    pub instance_id: String,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        InstanceConfig {
            instance_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

/// Process-wide gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate, Default)]
#[serde(default)]
pub struct GatewayConfig {
    #[validate(nested)]
    pub ids: IdConfig,

    #[validate(nested)]
    pub layout: LayoutConfig,

    #[validate(nested)]
    pub write: WriteConfig,

    #[validate(nested)]
    pub ledger: LedgerConfig,

    #[validate(nested)]
    pub backend: BackendConfig,

    pub instance: InstanceConfig,
}

impl GatewayConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: GatewayConfig = toml::from_str(text)?;
        config.check()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        tracing::info!("Loading gateway config from {:?}", path.as_ref());
        Self::from_toml_str(&text)
    }

    /// Field-level and cross-field validation
    pub fn check(&self) -> Result<()> {
        self.validate()
            .map_err(|e| GatewayError::Config(e.to_string()))?;

        for bracket in &self.layout.brackets {
            if bracket.layout_id == 0 || bracket.layout_id > self.layout.max_layout_id {
                return Err(GatewayError::Config(format!(
                    "layout id {} outside 1..={}",
                    bracket.layout_id, self.layout.max_layout_id
                )));
            }
        }
        if self.instance.instance_id.is_empty() {
            return Err(GatewayError::Config("instance_id must not be empty".into()));
        }
        Ok(())
    }

    pub fn join_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.backend.join_wait_timeout_ms)
    }

    pub fn with_max_fragments(mut self, max_fragments: u32) -> Self {
        self.write.max_fragments = max_fragments;
        self
    }

    pub fn with_failures_before_fragment(mut self, failures: u32) -> Self {
        self.write.failures_before_fragment = failures;
        self
    }

    pub fn with_payload_units(mut self, units: u32) -> Self {
        self.write.payload_units = units;
        self
    }

    pub fn with_id_mode(mut self, mode: IdMode) -> Self {
        self.ids.mode = mode;
        self
    }

    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance.instance_id = instance_id.into();
        self
    }

    pub fn with_join_wait_timeout(mut self, timeout: Duration) -> Self {
        self.backend.join_wait_timeout_ms = timeout.as_millis().max(1) as u64;
        self
    }

    pub fn with_etimedout_threshold(mut self, threshold: u32, window_secs: u64) -> Self {
        self.backend.etimedout_max_threshold = threshold;
        self.backend.etimedout_window_secs = window_secs;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = GatewayConfig::default();
        assert!(config.check().is_ok());
        assert_eq!(config.ids.max_collision_retries, 20);
        assert_eq!(config.write.failures_before_fragment, 1);
        assert_eq!(config.write.max_fragments, 5);
        assert_eq!(config.ledger.index_id, DEFAULT_LEDGER_INDEX);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = GatewayConfig::from_toml_str(
            r#"
            [ids]
            mode = "random"

            [ledger]
            bucket_keys = false
            "#,
        )
        .unwrap();

        assert_eq!(config.ids.mode, IdMode::Random);
        assert_eq!(config.ids.max_collision_retries, 20);
        assert!(!config.ledger.bucket_keys);
        assert_eq!(config.write.payload_units, 4);
    }

    #[test]
    fn test_rejects_out_of_range_values() {
        let result = GatewayConfig::from_toml_str(
            r#"
            [write]
            max_fragments = 0
            "#,
        );
        assert!(matches!(result, Err(GatewayError::Config(_))));
    }

    #[test]
    fn test_rejects_layout_above_max() {
        let result = GatewayConfig::from_toml_str(
            r#"
            [layout]
            max_layout_id = 3
            size_cap = 8192
            brackets = [
                { max_size = 4096, layout_id = 1 },
                { max_size = 8192, layout_id = 7 },
            ]
            "#,
        );
        assert!(matches!(result, Err(GatewayError::Config(_))));
    }

    #[test]
    fn test_rejects_malformed_toml() {
        let result = GatewayConfig::from_toml_str("[write\nmax_fragments = 2");
        assert!(matches!(result, Err(GatewayError::ConfigParse(_))));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [instance]
            instance_id = "node-7"

            [ledger]
            index_id = "00000000000000000000000000000009"
            "#
        )
        .unwrap();

        let config = GatewayConfig::load(file.path()).unwrap();
        assert_eq!(config.instance.instance_id, "node-7");
        assert_eq!(config.ledger.index_id, ObjectId::from_parts(0, 9));
    }
}
