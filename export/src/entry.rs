//! Signature-fixing adapter around an [`OpaqueModel`].

use std::cell::Cell;
use std::sync::Arc;

use tracing::debug;

use crate::error::{ExportError, Result};
use crate::model::OpaqueModel;
use crate::probe;
use crate::signature::{OUTPUT_NAMES, Signature};
use crate::tensor::Tensor;

/// Named outputs of one entry point invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Outputs {
    pub scores: Tensor,
    pub embeddings: Tensor,
    pub spectrogram: Tensor,
}

impl Outputs {
    /// Takes the first three positional outputs as scores, embeddings and
    /// spectrogram. Fewer than three is an [`ExportError::OutputArity`].
    pub fn from_positional(raw: Vec<Tensor>) -> Result<Self> {
        let got = raw.len();
        let mut it = raw.into_iter();
        let (Some(scores), Some(embeddings), Some(spectrogram)) = (it.next(), it.next(), it.next())
        else {
            return Err(ExportError::OutputArity {
                expected: OUTPUT_NAMES.len(),
                got,
            });
        };

        let extra = it.count();
        if extra > 0 {
            debug!(extra, "ignoring trailing model outputs");
        }

        Ok(Self {
            scores,
            embeddings,
            spectrogram,
        })
    }

    /// Output names in contract order.
    pub fn names(&self) -> [&'static str; 3] {
        OUTPUT_NAMES
    }

    /// Iterates `(name, tensor)` pairs in contract order.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &Tensor)> {
        OUTPUT_NAMES
            .into_iter()
            .zip([&self.scores, &self.embeddings, &self.spectrogram])
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.iter().find(|(n, _)| *n == name).map(|(_, t)| t)
    }
}

/// A model presented through a single fixed calling convention.
///
/// The entry point accepts exactly one `[16000] float32` waveform and
/// returns [`Outputs`]. Its [`Signature`] is set at construction and never
/// changes. Build state lives in unsynchronized cells, so an entry point
/// is driven from one thread only.
pub struct EntryPoint {
    model: Arc<dyn OpaqueModel>,
    signature: Signature,
    built: Cell<bool>,
    calls: Cell<u64>,
}

impl EntryPoint {
    /// Wraps a model. Does not invoke it: an arity problem surfaces on the
    /// first call, not here.
    pub fn wrap(model: Arc<dyn OpaqueModel>) -> Self {
        Self {
            model,
            signature: Signature::waveform(),
            built: Cell::new(false),
            calls: Cell::new(0),
        }
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn model(&self) -> &dyn OpaqueModel {
        self.model.as_ref()
    }

    /// Invokes the wrapped model on one waveform.
    pub fn call(&self, waveform: &Tensor) -> Result<Outputs> {
        self.signature.input().check(waveform)?;

        let raw = self.model.call(waveform)?;
        self.calls.set(self.calls.get() + 1);

        let outputs = Outputs::from_positional(raw)?;
        for ((_, tensor), spec) in outputs.iter().zip(&self.signature.outputs) {
            spec.check(tensor)?;
        }
        Ok(outputs)
    }

    /// Invokes the entry point once on random input so that any lazy
    /// initialization in the adapter or model runs now. The result is
    /// discarded.
    pub fn force_build(&self) -> Result<()> {
        debug!(model = self.model.name(), "building entry point");
        self.call(&probe::random_waveform())?;
        self.built.set(true);
        Ok(())
    }

    pub fn is_built(&self) -> bool {
        self.built.get()
    }

    /// Number of successful model invocations so far.
    pub fn calls(&self) -> u64 {
        self.calls.get()
    }
}
