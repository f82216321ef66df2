//! Boundary to the external format converter.
//!
//! Conversion into a mobile runtime format is not done here. A
//! [`Converter`] reads an export artifact, checks its serving signature
//! against explicit input descriptors and hands back a
//! [`ConvertedModel`] that can be saved. Failures come back unmodified:
//! no retry, no cleanup of partial output.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tracing::{debug, info};

use crate::artifact::{ARTIFACT_FORMAT, ExportArtifact};
use crate::error::{ExportError, Result};
use crate::signature::{WAVEFORM_INPUT, WAVEFORM_SAMPLES};

/// Source-format tag identifying export artifacts to a converter.
pub const SOURCE_FORMAT: &str = ARTIFACT_FORMAT;

/// A named input with a fixed shape, as a converter expects it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputDescriptor {
    pub name: String,
    pub shape: Vec<usize>,
}

impl InputDescriptor {
    pub fn new(name: impl Into<String>, shape: &[usize]) -> Self {
        Self {
            name: name.into(),
            shape: shape.to_vec(),
        }
    }

    /// The `waveform` `(16000,)` descriptor.
    pub fn waveform() -> Self {
        Self::new(WAVEFORM_INPUT, &[WAVEFORM_SAMPLES])
    }

    /// Command-line form: `name:d0xd1x...`.
    pub fn to_arg(&self) -> String {
        let dims: Vec<String> = self.shape.iter().map(|d| d.to_string()).collect();
        format!("{}:{}", self.name, dims.join("x"))
    }
}

/// Converts export artifacts into a target runtime's model format.
pub trait Converter {
    fn convert(
        &self,
        export_dir: &Path,
        source: &str,
        inputs: &[InputDescriptor],
    ) -> Result<Box<dyn ConvertedModel>>;
}

/// An in-memory conversion result.
pub trait ConvertedModel {
    /// Writes the converted artifact to `path`.
    fn save(&self, path: &Path) -> Result<()>;
}

/// Checks that `inputs` describe exactly the inputs of the artifact's
/// `serving_default` signature.
pub fn validate_inputs(artifact: &ExportArtifact, inputs: &[InputDescriptor]) -> Result<()> {
    let serving = artifact
        .serving_default()
        .map_err(|e| ExportError::Conversion(e.to_string()))?;

    if inputs.len() != serving.inputs.len() {
        return Err(ExportError::Conversion(format!(
            "expected {} input descriptors, got {}",
            serving.inputs.len(),
            inputs.len()
        )));
    }
    for desc in inputs {
        let spec = serving
            .inputs
            .iter()
            .find(|s| s.name == desc.name)
            .ok_or_else(|| {
                ExportError::Conversion(format!("no serving input named {:?}", desc.name))
            })?;
        if spec.fixed_shape().as_deref() != Some(desc.shape.as_slice()) {
            return Err(ExportError::Conversion(format!(
                "input {:?}: descriptor shape {:?} does not match serving shape {spec}",
                desc.name, desc.shape
            )));
        }
    }
    Ok(())
}

/// How to invoke an external converter program.
///
/// `args` may contain the placeholders `{export_dir}`, `{source}`,
/// `{inputs}` (comma-separated [`InputDescriptor::to_arg`] forms) and
/// `{output}`, the file the program must write.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConverterConfig {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// [`Converter`] that runs an external program.
pub struct CommandConverter {
    cfg: ConverterConfig,
}

impl CommandConverter {
    pub fn new(cfg: ConverterConfig) -> Self {
        Self { cfg }
    }
}

impl Converter for CommandConverter {
    fn convert(
        &self,
        export_dir: &Path,
        source: &str,
        inputs: &[InputDescriptor],
    ) -> Result<Box<dyn ConvertedModel>> {
        if source != SOURCE_FORMAT {
            return Err(ExportError::Conversion(format!(
                "unsupported source format {source:?}"
            )));
        }
        let artifact = ExportArtifact::load(export_dir)?;
        validate_inputs(&artifact, inputs)?;

        let scratch = tempfile::Builder::new().prefix("giztoy-convert-").tempdir()?;
        let output = scratch.path().join("converted");

        let input_arg = inputs
            .iter()
            .map(InputDescriptor::to_arg)
            .collect::<Vec<_>>()
            .join(",");
        let args: Vec<String> = self
            .cfg
            .args
            .iter()
            .map(|a| {
                a.replace("{export_dir}", &export_dir.to_string_lossy())
                    .replace("{source}", source)
                    .replace("{inputs}", &input_arg)
                    .replace("{output}", &output.to_string_lossy())
            })
            .collect();

        debug!(program = %self.cfg.program, ?args, "running converter");
        let out = Command::new(&self.cfg.program)
            .args(&args)
            .envs(&self.cfg.env)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| {
                std::io::Error::new(
                    e.kind(),
                    format!("spawn converter {:?}: {e}", self.cfg.program),
                )
            })?;

        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            return Err(ExportError::Conversion(format!(
                "{} exited with {}: {}",
                self.cfg.program,
                out.status,
                stderr.trim()
            )));
        }
        if !output.is_file() {
            return Err(ExportError::Conversion(format!(
                "{} produced no output",
                self.cfg.program
            )));
        }

        Ok(Box::new(ConvertedFile {
            path: output,
            _scratch: scratch,
        }))
    }
}

/// Converter output waiting in a scratch directory.
struct ConvertedFile {
    path: PathBuf,
    _scratch: TempDir,
}

impl ConvertedModel for ConvertedFile {
    fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let n = fs::copy(&self.path, path)?;
        info!(path = %path.display(), bytes = n, "saved converted model");
        Ok(())
    }
}
