//! The export run: wrap, build, specialize, export, convert, save.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::artifact::{ExportWriter, OverwritePolicy};
use crate::convert::{Converter, InputDescriptor, SOURCE_FORMAT};
use crate::entry::EntryPoint;
use crate::error::Result;
use crate::model::OpaqueModel;
use crate::signature::{Signature, waveform_spec};
use crate::trace::specialize;

/// Default export artifact directory.
pub const DEFAULT_EXPORT_DIR: &str = "saved_yamnet_keras_model";

/// Default converted model file.
pub const DEFAULT_CONVERTED_PATH: &str = "YAMNet.mlmodel";

/// Where a run writes its artifacts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub export_dir: PathBuf,
    pub converted_path: PathBuf,
    pub overwrite: OverwritePolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            export_dir: PathBuf::from(DEFAULT_EXPORT_DIR),
            converted_path: PathBuf::from(DEFAULT_CONVERTED_PATH),
            overwrite: OverwritePolicy::default(),
        }
    }
}

/// Outcome of a successful run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineReport {
    pub model: String,
    pub export_dir: PathBuf,
    pub converted_path: PathBuf,
    pub signature: Signature,
}

/// Exports one model and converts the export.
///
/// Steps run strictly in sequence on the calling thread. The first
/// failure ends the run and is returned as is; artifacts already written
/// stay on disk.
pub struct Pipeline {
    model: Arc<dyn OpaqueModel>,
    cfg: PipelineConfig,
}

impl Pipeline {
    pub fn new(model: Arc<dyn OpaqueModel>, cfg: PipelineConfig) -> Self {
        Self { model, cfg }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.cfg
    }

    pub fn run(&self, converter: &dyn Converter) -> Result<PipelineReport> {
        let name = self.model.name().to_string();
        info!(model = %name, "exporting model");

        let entry = EntryPoint::wrap(Arc::clone(&self.model));

        entry.force_build()?;
        debug!("entry point built");

        let concrete = specialize(&entry, &waveform_spec())?;
        let signature = concrete.signature().clone();

        let artifact =
            ExportWriter::new(self.cfg.overwrite).export(&entry, &concrete, &self.cfg.export_dir)?;

        let converted = converter.convert(
            artifact.dir(),
            SOURCE_FORMAT,
            &[InputDescriptor::waveform()],
        )?;
        converted.save(&self.cfg.converted_path)?;

        info!(
            model = %name,
            export_dir = %self.cfg.export_dir.display(),
            converted = %self.cfg.converted_path.display(),
            "export finished"
        );

        Ok(PipelineReport {
            model: name,
            export_dir: self.cfg.export_dir.clone(),
            converted_path: self.cfg.converted_path.clone(),
            signature,
        })
    }
}
