//! Export artifacts: a directory holding model state and named signatures.
//!
//! ```text
//! <dir>/manifest.json        format, model, signatures, variable list
//! <dir>/variables/<path>     model state blobs
//! ```
//!
//! A consumer finds the serving entry point by the name
//! [`SERVING_DEFAULT`] alone; its shapes are recorded in the manifest and
//! never have to be re-derived.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::entry::EntryPoint;
use crate::error::{ExportError, Result};
use crate::signature::{SERVING_DEFAULT, Signature};
use crate::trace::ConcreteFunction;

/// Format tag written to every manifest.
pub const ARTIFACT_FORMAT: &str = "giztoy-export";

/// Manifest schema version.
pub const ARTIFACT_VERSION: u32 = 1;

pub const MANIFEST_FILE: &str = "manifest.json";
pub const VARIABLES_DIR: &str = "variables";

/// Contents of `manifest.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub format: String,
    pub version: u32,
    pub model: String,
    pub state_format: String,
    pub created_at: DateTime<Utc>,
    pub signatures: BTreeMap<String, Signature>,
    #[serde(default)]
    pub variables: Vec<String>,
}

/// What to do when the export destination already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverwritePolicy {
    /// Fail with [`ExportError::ArtifactExists`].
    #[default]
    Refuse,
    /// Replace an existing export artifact. Anything else at the
    /// destination fails with [`ExportError::IncompatibleDestination`].
    Replace,
}

/// Writes export artifacts.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExportWriter {
    policy: OverwritePolicy,
}

impl ExportWriter {
    pub fn new(policy: OverwritePolicy) -> Self {
        Self { policy }
    }

    /// Persists `entry`'s model state under `dest` and binds `concrete`
    /// as the `serving_default` signature.
    ///
    /// The artifact is assembled in a staging directory next to `dest`
    /// and renamed into place, so `dest` never holds a half-written
    /// artifact.
    pub fn export(
        &self,
        entry: &EntryPoint,
        concrete: &ConcreteFunction<'_>,
        dest: &Path,
    ) -> Result<ExportArtifact> {
        if !std::ptr::eq(concrete.entry(), entry) {
            return Err(ExportError::Specialization(
                "concrete function was traced from a different entry point".into(),
            ));
        }
        if !concrete.signature().is_fully_defined() {
            return Err(ExportError::Specialization(
                "serving signature has undefined shapes".into(),
            ));
        }

        let replacing = self.check_destination(dest)?;

        let state = entry.model().state()?;
        for path in state.blobs.keys() {
            check_relative(path)?;
        }

        let parent = match dest.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)?;

        let staging = tempfile::Builder::new()
            .prefix(".export-staging-")
            .tempdir_in(&parent)?;
        let vars = staging.path().join(VARIABLES_DIR);
        fs::create_dir_all(&vars)?;
        for (path, data) in &state.blobs {
            let file = vars.join(path);
            if let Some(dir) = file.parent() {
                fs::create_dir_all(dir)?;
            }
            fs::write(&file, data)?;
        }

        let manifest = Manifest {
            format: ARTIFACT_FORMAT.to_string(),
            version: ARTIFACT_VERSION,
            model: entry.model().name().to_string(),
            state_format: state.format,
            created_at: Utc::now(),
            signatures: BTreeMap::from([(
                SERVING_DEFAULT.to_string(),
                concrete.signature().clone(),
            )]),
            variables: state.blobs.keys().cloned().collect(),
        };
        fs::write(
            staging.path().join(MANIFEST_FILE),
            serde_json::to_vec_pretty(&manifest)?,
        )?;
        debug!(staging = %staging.path().display(), "staged export artifact");

        if replacing {
            warn!(path = %dest.display(), "replacing existing export artifact");
            let old = tempfile::Builder::new()
                .prefix(".export-previous-")
                .tempdir_in(&parent)?;
            let previous = old.path().join("artifact");
            fs::rename(dest, &previous)?;
            if let Err(e) = fs::rename(staging.path(), dest) {
                let _ = fs::rename(&previous, dest);
                return Err(e.into());
            }
        } else {
            fs::rename(staging.path(), dest)?;
        }

        info!(
            path = %dest.display(),
            model = %manifest.model,
            variables = manifest.variables.len(),
            "wrote export artifact"
        );

        Ok(ExportArtifact {
            dir: dest.to_path_buf(),
            manifest,
        })
    }

    /// Applies the overwrite policy. Returns true when an existing
    /// artifact is to be replaced.
    fn check_destination(&self, dest: &Path) -> Result<bool> {
        if !dest.exists() {
            return Ok(false);
        }
        match self.policy {
            OverwritePolicy::Refuse => Err(ExportError::ArtifactExists(dest.to_path_buf())),
            OverwritePolicy::Replace => {
                if dest.is_dir() && dest.join(MANIFEST_FILE).is_file() {
                    Ok(true)
                } else {
                    Err(ExportError::IncompatibleDestination(dest.to_path_buf()))
                }
            }
        }
    }
}

/// A written export artifact, loaded back from disk.
#[derive(Debug, Clone)]
pub struct ExportArtifact {
    dir: PathBuf,
    manifest: Manifest,
}

impl ExportArtifact {
    /// Loads and validates the manifest of the artifact at `dir`.
    pub fn load(dir: &Path) -> Result<Self> {
        let data = fs::read(dir.join(MANIFEST_FILE))?;
        let manifest: Manifest = serde_json::from_slice(&data)?;

        if manifest.format != ARTIFACT_FORMAT {
            return Err(ExportError::Manifest(format!(
                "unknown format {:?}",
                manifest.format
            )));
        }
        if manifest.version != ARTIFACT_VERSION {
            return Err(ExportError::Manifest(format!(
                "unsupported version {}",
                manifest.version
            )));
        }
        for (name, sig) in &manifest.signatures {
            if !sig.is_fully_defined() {
                return Err(ExportError::Manifest(format!(
                    "signature {name:?} has undefined shapes"
                )));
            }
        }
        for path in &manifest.variables {
            check_relative(path)?;
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            manifest,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn signature(&self, name: &str) -> Option<&Signature> {
        self.manifest.signatures.get(name)
    }

    /// The `serving_default` signature.
    pub fn serving_default(&self) -> Result<&Signature> {
        self.signature(SERVING_DEFAULT).ok_or_else(|| {
            ExportError::Manifest(format!("missing {SERVING_DEFAULT:?} signature"))
        })
    }

    /// Reads one state blob listed in the manifest.
    pub fn variable(&self, path: &str) -> Result<Vec<u8>> {
        if !self.manifest.variables.iter().any(|v| v == path) {
            return Err(ExportError::Manifest(format!(
                "variable {path:?} not listed"
            )));
        }
        Ok(fs::read(self.dir.join(VARIABLES_DIR).join(path))?)
    }
}

/// Rejects blob paths that are empty, absolute or climb out of `variables/`.
fn check_relative(path: &str) -> Result<()> {
    let p = Path::new(path);
    let ok = !path.is_empty() && p.components().all(|c| matches!(c, Component::Normal(_)));
    if ok {
        Ok(())
    } else {
        Err(ExportError::Manifest(format!("invalid variable path {path:?}")))
    }
}
