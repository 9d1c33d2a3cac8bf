use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::aabb::Shape3;
use crate::job::{PostProcessingParams, DEFAULT_MODEL_INPUT_SHAPE, DEFAULT_MODEL_OUTPUT_SHAPE};
use crate::runner::{DEFAULT_BATCH_SIZE, DEFAULT_PREFETCH};

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "VOLSEG_DATA_DIR";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub model: ModelConfig,
    pub pipeline: PipelineConfig,
    pub post_processing: PostProcessingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ModelConfig {
    pub input_shape: Shape3,
    pub output_shape: Shape3,
    pub batch_size: usize,
    pub gpu_memory_growth: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PipelineConfig {
    pub prefetch: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PostProcessingConfig {
    pub enabled: bool,
    pub high_threshold: f32,
    pub low_threshold: f32,
    pub small_region_probability_threshold: f32,
    pub small_region_size_threshold: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            input_shape: DEFAULT_MODEL_INPUT_SHAPE,
            output_shape: DEFAULT_MODEL_OUTPUT_SHAPE,
            batch_size: DEFAULT_BATCH_SIZE,
            gpu_memory_growth: false,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            prefetch: DEFAULT_PREFETCH,
        }
    }
}

impl Default for PostProcessingConfig {
    fn default() -> Self {
        let params = PostProcessingParams::default();
        Self {
            enabled: false,
            high_threshold: params.high_confidence_threshold,
            low_threshold: params.low_confidence_threshold,
            small_region_probability_threshold: params.small_region_probability_threshold,
            small_region_size_threshold: params.small_region_size_threshold,
        }
    }
}

impl PostProcessingConfig {
    pub fn params(&self) -> PostProcessingParams {
        PostProcessingParams {
            high_confidence_threshold: self.high_threshold,
            low_confidence_threshold: self.low_threshold,
            small_region_probability_threshold: self.small_region_probability_threshold,
            small_region_size_threshold: self.small_region_size_threshold,
        }
    }
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }
}

/// Resolve the data directory with 3-tier priority:
/// 1. CLI override if provided
/// 2. VOLSEG_DATA_DIR environment variable
/// 3. Default: ./data
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

/// Returns the path to config.toml within the given data directory.
pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = AppConfig::default();

        assert_eq!(cfg.model.input_shape, [220, 220, 220]);
        assert_eq!(cfg.model.output_shape, [132, 132, 132]);
        assert_eq!(cfg.model.batch_size, 1);
        assert!(!cfg.model.gpu_memory_growth);
        assert_eq!(cfg.pipeline.prefetch, 2);
        assert!(!cfg.post_processing.enabled);
        assert_eq!(cfg.post_processing.params(), PostProcessingParams::default());
    }

    #[test]
    fn toml_roundtrip_preserves_values() {
        let mut original = AppConfig::default();
        original.model.input_shape = [64, 64, 64];
        original.post_processing.enabled = true;
        original.post_processing.small_region_size_threshold = 10;

        let encoded = toml::to_string_pretty(&original).expect("serialize config");
        let decoded: AppConfig = toml::from_str(&encoded).expect("deserialize config");
        assert_eq!(decoded, original);
    }

    #[test]
    fn partial_sections_fall_back_to_defaults() {
        let decoded: AppConfig =
            toml::from_str("[model]\nbatch_size = 4\n\n[post_processing]\nlow_threshold = 0.3\n")
                .expect("deserialize partial config");

        assert_eq!(decoded.model.batch_size, 4);
        assert_eq!(decoded.model.input_shape, DEFAULT_MODEL_INPUT_SHAPE);
        assert_eq!(decoded.post_processing.low_threshold, 0.3);
        assert_eq!(decoded.post_processing.high_threshold, 0.98);
        assert_eq!(decoded.pipeline, PipelineConfig::default());
    }

    #[test]
    fn load_from_nonexistent_or_empty_file_returns_defaults() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        assert_eq!(AppConfig::load_from_path(&path).unwrap(), AppConfig::default());

        fs::write(&path, "  \n").expect("write empty config");
        assert_eq!(AppConfig::load_from_path(&path).unwrap(), AppConfig::default());
    }

    #[test]
    fn load_reports_malformed_toml() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        fs::write(&path, "[model\n").expect("write broken config");

        let err = AppConfig::load_from_path(&path).unwrap_err();
        assert!(err.to_string().contains("failed to parse config TOML"));
    }

    #[test]
    fn data_dir_uses_cli_override() {
        let cli_path = Path::new("/custom");
        let result = data_dir(Some(cli_path));
        assert_eq!(result, PathBuf::from("/custom"));
    }

    #[test]
    fn data_dir_env_then_default() {
        let previous = env::var_os(ENV_DATA_DIR);

        env::set_var(ENV_DATA_DIR, "/env/path");
        let from_env = data_dir(None);
        env::remove_var(ENV_DATA_DIR);
        let fallback = data_dir(None);

        if let Some(value) = previous {
            env::set_var(ENV_DATA_DIR, value);
        }

        assert_eq!(from_env, PathBuf::from("/env/path"));
        assert_eq!(fallback, PathBuf::from("data"));
    }

    #[test]
    fn config_path_is_data_dir_join_config_toml() {
        let result = config_path(Path::new("/data"));
        assert_eq!(result, PathBuf::from("/data/config.toml"));
    }
}
