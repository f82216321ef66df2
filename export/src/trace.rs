//! Specialization of an entry point to one concrete input contract.
//!
//! Declaring a contract ([`Signature`]) and binding to it are separate
//! steps. [`specialize`] traces the entry point with deterministic probe
//! inputs and resolves every output to a concrete shape. The resulting
//! [`ConcreteFunction`] is the only form of the entry point that may be
//! exported as a serving signature.

use tracing::debug;

use crate::entry::{EntryPoint, Outputs};
use crate::error::{ExportError, Result};
use crate::probe;
use crate::signature::Signature;
use crate::tensor::{Tensor, TensorSpec};

/// Seed of the second tracing probe. Fixed so that tracing is repeatable.
const TRACE_SEED: u64 = 0x5eed_0f_7ace;

/// An entry point bound to one exact input shape and dtype.
pub struct ConcreteFunction<'a> {
    entry: &'a EntryPoint,
    signature: Signature,
}

impl<'a> ConcreteFunction<'a> {
    /// The fully-defined signature resolved by tracing.
    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn input(&self) -> &TensorSpec {
        self.signature.input()
    }

    pub fn entry(&self) -> &'a EntryPoint {
        self.entry
    }

    /// Calls the entry point. Anything but the traced input shape and
    /// dtype fails with [`ExportError::ShapeMismatch`]; an output that
    /// leaves its traced shape fails with [`ExportError::Specialization`].
    pub fn call(&self, waveform: &Tensor) -> Result<Outputs> {
        self.input().check(waveform)?;
        let outputs = self.entry.call(waveform)?;
        for ((name, tensor), spec) in outputs.iter().zip(&self.signature.outputs) {
            if spec.check(tensor).is_err() {
                return Err(ExportError::Specialization(format!(
                    "output {name:?} left its traced shape {spec}: got {:?} {}",
                    tensor.shape(),
                    tensor.dtype()
                )));
            }
        }
        Ok(outputs)
    }
}

/// Traces `entry` for the input contract `spec`.
///
/// `spec` must be fully defined and equal to the entry point's declared
/// input. The entry point is run on a silent probe and on a fixed-seed
/// noise probe; the two must produce identical output shapes, otherwise
/// the outputs depend on input values and no single concrete path
/// exists.
pub fn specialize<'a>(entry: &'a EntryPoint, spec: &TensorSpec) -> Result<ConcreteFunction<'a>> {
    if !spec.is_fully_defined() {
        return Err(ExportError::Specialization(format!(
            "input contract {spec} is not fully defined"
        )));
    }
    let declared = entry.signature().input();
    if spec.shape != declared.shape || spec.dtype != declared.dtype {
        return Err(ExportError::Specialization(format!(
            "input contract {spec} does not match declared {declared}"
        )));
    }

    let silent = trace_outputs(entry, &probe::zero_waveform())?;
    let noisy = trace_outputs(entry, &probe::uniform_waveform(TRACE_SEED))?;

    for (a, b) in silent.iter().zip(&noisy) {
        if a != b {
            return Err(ExportError::Specialization(format!(
                "output {:?} has input-dependent shape: {a} vs {b}",
                a.name
            )));
        }
    }

    debug!(
        outputs = ?silent.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
        "traced entry point"
    );

    Ok(ConcreteFunction {
        entry,
        signature: Signature {
            inputs: vec![TensorSpec {
                name: declared.name.clone(),
                shape: spec.shape.clone(),
                dtype: spec.dtype,
            }],
            outputs: silent,
        },
    })
}

fn trace_outputs(entry: &EntryPoint, probe: &Tensor) -> Result<Vec<TensorSpec>> {
    let outputs = entry.call(probe)?;
    Ok(outputs
        .iter()
        .map(|(name, tensor)| TensorSpec::of(name, tensor))
        .collect())
}
