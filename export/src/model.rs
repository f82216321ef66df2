use std::collections::BTreeMap;

use crate::error::Result;
use crate::tensor::Tensor;

/// A pretrained inference function treated as a black box.
///
/// The model is only ever invoked; the pipeline never mutates it. Its
/// calling convention is loose: it accepts a waveform of whatever shape
/// it tolerates and returns positional outputs whose count is not
/// declared anywhere. [`EntryPoint`](crate::EntryPoint) is what pins
/// both down.
///
/// # Thread Safety
///
/// Implementations must be safe to share across threads, though the
/// pipeline itself drives them from a single thread.
pub trait OpaqueModel: Send + Sync {
    /// Short identifier recorded in export manifests.
    fn name(&self) -> &str;

    /// Runs inference on a waveform and returns the raw positional outputs.
    fn call(&self, waveform: &Tensor) -> Result<Vec<Tensor>>;

    /// Snapshots the state that must travel with an exported artifact.
    fn state(&self) -> Result<ModelState>;
}

/// Serializable model state.
///
/// `blobs` maps relative paths to file contents; the export writer
/// places them under the artifact's `variables/` directory.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelState {
    pub format: String,
    pub blobs: BTreeMap<String, Vec<u8>>,
}

impl ModelState {
    pub fn new(format: impl Into<String>) -> Self {
        Self {
            format: format.into(),
            blobs: BTreeMap::new(),
        }
    }

    /// Adds a blob, replacing any previous one at the same path.
    pub fn with_blob(mut self, path: impl Into<String>, data: Vec<u8>) -> Self {
        self.blobs.insert(path.into(), data);
        self
    }
}
