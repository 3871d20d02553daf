//! Configuration file support for poso.
//!
//! Configuration is loaded from `$XDG_CONFIG_HOME/poso/config.toml`.

use crate::age_weight::AgeWeightModel;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Application configuration
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub data: DataConfig,

    #[serde(default)]
    pub estimation: EstimationConfig,

    #[serde(default)]
    pub safety: SafetyConfig,

    #[serde(default)]
    pub display: DisplayConfig,
}

/// Data storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Drug catalog JSON; the built-in catalog is used when unset
    #[serde(default)]
    pub catalog: Option<PathBuf>,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            catalog: None,
        }
    }
}

/// Age/weight estimation configuration
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct EstimationConfig {
    #[serde(default)]
    pub model: AgeWeightModel,
}

/// Safety thresholds
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SafetyConfig {
    /// Volumes below this are flagged as hard to draw up accurately
    #[serde(default = "default_min_volume_ml")]
    pub min_volume_ml: f64,

    /// Treat overlapping override bands as catalog errors
    #[serde(default)]
    pub strict_overrides: bool,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            min_volume_ml: default_min_volume_ml(),
            strict_overrides: false,
        }
    }
}

/// Output formatting
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DisplayConfig {
    #[serde(default = "default_placeholder")]
    pub placeholder: String,

    #[serde(default = "default_digits")]
    pub digits: usize,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            placeholder: default_placeholder(),
            digits: default_digits(),
        }
    }
}

// Default value functions
fn default_data_dir() -> PathBuf {
    let base = dirs::data_local_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join(".local/share")))
        .unwrap_or_else(std::env::temp_dir);
    base.join("poso")
}

fn default_min_volume_ml() -> f64 {
    0.1
}

fn default_placeholder() -> String {
    crate::format::PLACEHOLDER.to_string()
}

fn default_digits() -> usize {
    2
}

impl Config {
    /// Load configuration from the standard config path
    pub fn load() -> Result<Self> {
        let config_path = Self::default_config_path();
        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            tracing::info!(
                "No config file found at {:?}, using defaults",
                config_path
            );
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        tracing::info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Reject values the engine cannot work with
    pub fn validate(&self) -> Result<()> {
        if !self.safety.min_volume_ml.is_finite() || self.safety.min_volume_ml < 0.0 {
            return Err(Error::Config(format!(
                "safety.min_volume_ml must be a non-negative number, got {}",
                self.safety.min_volume_ml
            )));
        }
        if self.display.digits > 6 {
            return Err(Error::Config(format!(
                "display.digits must be at most 6, got {}",
                self.display.digits
            )));
        }
        Ok(())
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        let base = dirs::config_dir()
            .or_else(|| dirs::home_dir().map(|home| home.join(".config")))
            .unwrap_or_else(std::env::temp_dir);
        base.join("poso").join("config.toml")
    }

    /// Path of the persisted patient context
    pub fn patient_path(&self) -> PathBuf {
        self.data.data_dir.join("patient.json")
    }

    /// Save the current configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, contents)?;
        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.estimation.model, AgeWeightModel::Table);
        assert_eq!(config.safety.min_volume_ml, 0.1);
        assert!(!config.safety.strict_overrides);
        assert_eq!(config.display.placeholder, "—");
        assert!(config.data.catalog.is_none());
    }

    #[test]
    fn test_config_roundtrip() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("config.toml");

        let mut config = Config::default();
        config.estimation.model = AgeWeightModel::Apls;
        config.safety.strict_overrides = true;
        config.save_to(&path).unwrap();

        let parsed = Config::load_from(&path).unwrap();
        assert_eq!(parsed.estimation.model, AgeWeightModel::Apls);
        assert!(parsed.safety.strict_overrides);
        assert_eq!(parsed.display.digits, config.display.digits);
    }

    #[test]
    fn test_partial_config() {
        let toml_str = r#"
[estimation]
model = "apls"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.estimation.model, AgeWeightModel::Apls);
        assert_eq!(config.safety.min_volume_ml, 0.1); // default
    }

    #[test]
    fn test_invalid_values_rejected() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("config.toml");
        std::fs::write(&path, "[safety]\nmin_volume_ml = -1.0\n").unwrap();

        assert!(matches!(Config::load_from(&path), Err(Error::Config(_))));
    }
}
