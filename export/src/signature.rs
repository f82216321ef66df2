//! The fixed calling convention exported models are bound to.

use serde::{Deserialize, Serialize};

use crate::tensor::{DType, TensorSpec};

/// Name of the single waveform input.
pub const WAVEFORM_INPUT: &str = "waveform";

/// Samples per waveform: one second of 16kHz mono audio.
pub const WAVEFORM_SAMPLES: usize = 16000;

/// Precision of the waveform input and of every output.
pub const WAVEFORM_DTYPE: DType = DType::Float32;

/// Signature name downstream consumers look the entry point up by.
pub const SERVING_DEFAULT: &str = "serving_default";

/// Output names, in the order they are taken from the model's positional outputs.
pub const OUTPUT_NAMES: [&str; 3] = ["scores", "embeddings", "spectrogram"];

/// A named set of input and output contracts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub inputs: Vec<TensorSpec>,
    pub outputs: Vec<TensorSpec>,
}

impl Signature {
    /// The waveform contract: `[16000] float32` in; scores, embeddings
    /// and spectrogram out, with shapes left for tracing to resolve.
    pub fn waveform() -> Self {
        Self {
            inputs: vec![waveform_spec()],
            outputs: OUTPUT_NAMES
                .iter()
                .map(|name| TensorSpec::dynamic(*name, WAVEFORM_DTYPE))
                .collect(),
        }
    }

    /// Returns the first input. Waveform signatures have exactly one.
    pub fn input(&self) -> &TensorSpec {
        &self.inputs[0]
    }

    pub fn output(&self, name: &str) -> Option<&TensorSpec> {
        self.outputs.iter().find(|s| s.name == name)
    }

    /// True when every input and output has a fully-defined shape.
    pub fn is_fully_defined(&self) -> bool {
        self.inputs
            .iter()
            .chain(self.outputs.iter())
            .all(TensorSpec::is_fully_defined)
    }
}

/// The `[16000] float32` waveform input contract.
pub fn waveform_spec() -> TensorSpec {
    TensorSpec::fixed(WAVEFORM_INPUT, &[WAVEFORM_SAMPLES], WAVEFORM_DTYPE)
}
