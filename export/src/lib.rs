//! Export pipeline for waveform classification models.
//!
//! Takes a pretrained model with a loose calling convention and produces
//! a fixed-signature export artifact, then hands that artifact to an
//! external converter for the target runtime.
//!
//! # Pipeline
//!
//! 1. [`EntryPoint::wrap`]: model -> single `[16000] float32` entry point
//!    returning `scores`, `embeddings`, `spectrogram`
//! 2. [`EntryPoint::force_build`]: one call on random input
//! 3. [`specialize`]: entry point -> [`ConcreteFunction`] with every shape resolved
//! 4. [`ExportWriter::export`]: model state + `serving_default` signature -> directory
//! 5. [`Converter::convert`] + [`ConvertedModel::save`]: directory -> target format file
//!
//! [`Pipeline`] runs all five in order.
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use giztoy_export::{
//!     CommandConverter, ConverterConfig, Pipeline, PipelineConfig, WorkerConfig, WorkerModel,
//! };
//!
//! let model = WorkerModel::spawn(&WorkerConfig {
//!     program: "python3".into(),
//!     args: vec!["worker.py".into(), "{model_dir}".into()],
//!     model_dir: "yamnet".into(),
//!     ..Default::default()
//! })
//! .unwrap();
//! let converter = CommandConverter::new(ConverterConfig {
//!     program: "python3".into(),
//!     args: vec!["convert.py".into(), "{export_dir}".into(), "{output}".into()],
//!     ..Default::default()
//! });
//! let report = Pipeline::new(Arc::new(model), PipelineConfig::default())
//!     .run(&converter)
//!     .unwrap();
//! println!("{}", report.converted_path.display());
//! ```

pub mod artifact;
pub mod convert;
mod entry;
mod error;
mod model;
mod pipeline;
pub mod probe;
mod signature;
pub mod tensor;
mod trace;
pub mod worker;

pub use artifact::{ExportArtifact, ExportWriter, Manifest, OverwritePolicy};
pub use convert::{
    CommandConverter, ConvertedModel, Converter, ConverterConfig, InputDescriptor, SOURCE_FORMAT,
    validate_inputs,
};
pub use entry::{EntryPoint, Outputs};
pub use error::{ExportError, Result};
pub use model::{ModelState, OpaqueModel};
pub use pipeline::{
    DEFAULT_CONVERTED_PATH, DEFAULT_EXPORT_DIR, Pipeline, PipelineConfig, PipelineReport,
};
pub use signature::{
    OUTPUT_NAMES, SERVING_DEFAULT, Signature, WAVEFORM_DTYPE, WAVEFORM_INPUT, WAVEFORM_SAMPLES,
    waveform_spec,
};
pub use tensor::{DType, Tensor, TensorData, TensorSpec};
pub use trace::{ConcreteFunction, specialize};
pub use worker::{WorkerConfig, WorkerModel};
