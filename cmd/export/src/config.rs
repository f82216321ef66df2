//! Config file loading.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use giztoy_export::{ConverterConfig, PipelineConfig, WorkerConfig};
use serde::Deserialize;

/// Config file looked up in the working directory when `--config` is absent.
pub const DEFAULT_CONFIG_FILE: &str = "export.yaml";

/// Configuration file format.
///
/// ```yaml
/// worker:
///   program: python3
///   args: [worker.py, "{model_dir}"]
///   model_dir: yamnet
/// converter:
///   program: python3
///   args: [convert.py, "{export_dir}", "{inputs}", "{output}"]
/// pipeline:
///   export_dir: saved_yamnet_keras_model
///   converted_path: YAMNet.mlmodel
///   overwrite: refuse
/// ```
#[derive(Debug, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub worker: Option<WorkerConfig>,
    #[serde(default)]
    pub converter: Option<ConverterConfig>,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

/// Loads `path`, or the default config file if present, or defaults.
pub fn load(path: Option<&Path>) -> Result<ConfigFile> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => {
            let p = PathBuf::from(DEFAULT_CONFIG_FILE);
            if !p.exists() {
                return Ok(ConfigFile::default());
            }
            p
        }
    };

    let data = std::fs::read(&path).with_context(|| format!("read config {}", path.display()))?;
    let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("");
    let cfg = match ext {
        "json" => serde_json::from_slice(&data)
            .with_context(|| format!("parse config {}", path.display()))?,
        "yaml" | "yml" => serde_yaml::from_slice(&data)
            .with_context(|| format!("parse config {}", path.display()))?,
        _ => bail!("unsupported config format: {}", path.display()),
    };
    Ok(cfg)
}
