//! End-to-end checks of the export pipeline against an in-process model
//! and converter.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use giztoy_export::{
    ConvertedModel, Converter, DType, EntryPoint, ExportArtifact, ExportError, InputDescriptor,
    ModelState, OUTPUT_NAMES, OpaqueModel, OverwritePolicy, Pipeline, PipelineConfig,
    SOURCE_FORMAT, Signature, Tensor, probe, specialize, validate_inputs, waveform_spec,
};
use serde::{Deserialize, Serialize};

const CLASSES: usize = 8;
const EMBED: usize = 4;
const BINS: usize = 4;
const HOP: usize = 160;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Params {
    gain: f32,
    bias: f32,
}

/// Small deterministic stand-in for a pretrained classifier.
///
/// Frames the waveform into 0.48s patches with 0.24s hop and derives
/// scores, embeddings and a coarse spectrogram from each patch.
struct ToyModel {
    params: Params,
    outputs: usize,
}

impl ToyModel {
    fn new(params: Params) -> Self {
        Self { params, outputs: 3 }
    }

    fn with_outputs(mut self, n: usize) -> Self {
        self.outputs = n;
        self
    }
}

impl OpaqueModel for ToyModel {
    fn name(&self) -> &str {
        "toy"
    }

    fn call(&self, waveform: &Tensor) -> giztoy_export::Result<Vec<Tensor>> {
        let x = waveform.to_f32_vec();
        let Params { gain, bias } = self.params;

        let frames = if x.len() < 7680 { 1 } else { (x.len() - 7680) / 3840 + 1 };
        let mut scores = Vec::with_capacity(frames * CLASSES);
        let mut embeddings = Vec::with_capacity(frames * EMBED);
        for f in 0..frames {
            let patch = &x[(f * 3840).min(x.len())..(f * 3840 + 7680).min(x.len())];
            let n = patch.len().max(1) as f32;
            let mean = patch.iter().sum::<f32>() / n;
            let energy = patch.iter().map(|v| v * v).sum::<f32>() / n;
            for c in 0..CLASSES {
                let z = gain * mean + bias * c as f32;
                scores.push(1.0 / (1.0 + (-z).exp()));
            }
            for k in 0..EMBED {
                embeddings.push(gain * energy * (k + 1) as f32 + bias);
            }
        }

        let rows = x.len() / HOP;
        let mut spectrogram = Vec::with_capacity(rows * BINS);
        for r in 0..rows {
            let level = x[r * HOP..(r + 1) * HOP].iter().map(|v| v.abs()).sum::<f32>() / HOP as f32;
            for b in 0..BINS {
                spectrogram.push((level + 1e-3).ln() * (b + 1) as f32);
            }
        }

        let mut out = vec![
            Tensor::from_f32(&[frames, CLASSES], scores)?,
            Tensor::from_f32(&[frames, EMBED], embeddings)?,
            Tensor::from_f32(&[rows, BINS], spectrogram)?,
        ];
        out.truncate(self.outputs);
        Ok(out)
    }

    fn state(&self) -> giztoy_export::Result<ModelState> {
        Ok(ModelState::new("toy-v1").with_blob("params.json", serde_json::to_vec(&self.params)?))
    }
}

fn toy() -> Arc<ToyModel> {
    Arc::new(ToyModel::new(Params {
        gain: 3.0,
        bias: 0.25,
    }))
}

/// Converted form: the serving signature plus the model parameters.
#[derive(Serialize, Deserialize)]
struct ToyConvertedFile {
    signature: Signature,
    params: Params,
}

struct ToyConverter;

struct ToyConverted(ToyConvertedFile);

impl Converter for ToyConverter {
    fn convert(
        &self,
        export_dir: &Path,
        source: &str,
        inputs: &[InputDescriptor],
    ) -> giztoy_export::Result<Box<dyn ConvertedModel>> {
        if source != SOURCE_FORMAT {
            return Err(ExportError::Conversion(format!("unknown source {source}")));
        }
        let artifact = ExportArtifact::load(export_dir)?;
        validate_inputs(&artifact, inputs)?;
        let params: Params = serde_json::from_slice(&artifact.variable("params.json")?)?;
        Ok(Box::new(ToyConverted(ToyConvertedFile {
            signature: artifact.serving_default()?.clone(),
            params,
        })))
    }
}

impl ConvertedModel for ToyConverted {
    fn save(&self, path: &Path) -> giztoy_export::Result<()> {
        fs::write(path, serde_json::to_vec(&self.0)?)?;
        Ok(())
    }
}

struct FailingConverter;

impl Converter for FailingConverter {
    fn convert(
        &self,
        _export_dir: &Path,
        _source: &str,
        _inputs: &[InputDescriptor],
    ) -> giztoy_export::Result<Box<dyn ConvertedModel>> {
        Err(ExportError::Conversion("unsupported op: Frame".into()))
    }
}

fn config_in(dir: &Path) -> PipelineConfig {
    PipelineConfig {
        export_dir: dir.join("saved_model"),
        converted_path: dir.join("model.converted"),
        overwrite: OverwritePolicy::Refuse,
    }
}

#[test]
fn outputs_are_exactly_the_named_three() {
    let entry = EntryPoint::wrap(toy());
    for seed in [1, 2, 3, 0xfeed] {
        let out = entry.call(&probe::uniform_waveform(seed)).unwrap();
        let names: Vec<&str> = out.iter().map(|(n, _)| n).collect();
        assert_eq!(names, OUTPUT_NAMES);
        assert_eq!(out.scores.shape(), &[3, CLASSES]);
        assert_eq!(out.embeddings.shape(), &[3, EMBED]);
        assert_eq!(out.spectrogram.shape(), &[100, BINS]);
    }
}

#[test]
fn specialized_callable_rejects_other_shapes() {
    let entry = EntryPoint::wrap(toy());
    let f = specialize(&entry, &waveform_spec()).unwrap();

    let bad = [
        Tensor::zeros(&[0], DType::Float32),
        Tensor::zeros(&[15999], DType::Float32),
        Tensor::zeros(&[32000], DType::Float32),
        Tensor::zeros(&[1, 16000], DType::Float32),
        Tensor::zeros(&[16000], DType::Float64),
        Tensor::zeros(&[16000], DType::Int16),
    ];
    let before = entry.calls();
    for t in &bad {
        match f.call(t) {
            Err(ExportError::ShapeMismatch { name, .. }) => assert_eq!(name, "waveform"),
            Err(e) => panic!("unexpected error for {:?}: {e}", t.shape()),
            Ok(_) => panic!("accepted {:?} {}", t.shape(), t.dtype()),
        }
    }
    assert_eq!(entry.calls(), before, "rejected input must not reach the model");
}

#[test]
fn specialization_is_deterministic() {
    let entry = EntryPoint::wrap(toy());
    let a = specialize(&entry, &waveform_spec()).unwrap();
    let b = specialize(&entry, &waveform_spec()).unwrap();
    assert_eq!(a.signature(), b.signature());

    let input = probe::uniform_waveform(99);
    assert_eq!(a.call(&input).unwrap(), b.call(&input).unwrap());
}

#[test]
fn artifact_reloads_with_declared_shapes() {
    let tmp = tempfile::tempdir().unwrap();
    let cfg = config_in(tmp.path());
    let report = Pipeline::new(toy(), cfg.clone()).run(&ToyConverter).unwrap();

    let artifact = ExportArtifact::load(&cfg.export_dir).unwrap();
    let serving = artifact.serving_default().unwrap();
    assert_eq!(serving, &report.signature);

    assert_eq!(serving.inputs, vec![waveform_spec()]);
    let outputs: Vec<(&str, Option<Vec<usize>>)> = serving
        .outputs
        .iter()
        .map(|s| (s.name.as_str(), s.fixed_shape()))
        .collect();
    assert_eq!(
        outputs,
        vec![
            ("scores", Some(vec![3, CLASSES])),
            ("embeddings", Some(vec![3, EMBED])),
            ("spectrogram", Some(vec![100, BINS])),
        ]
    );
    assert_eq!(artifact.manifest().model, "toy");
    assert_eq!(artifact.manifest().state_format, "toy-v1");
}

#[test]
fn converted_model_matches_direct_call_on_silence() {
    let tmp = tempfile::tempdir().unwrap();
    let cfg = config_in(tmp.path());
    let model = toy();
    Pipeline::new(model.clone(), cfg.clone()).run(&ToyConverter).unwrap();

    let converted: ToyConvertedFile =
        serde_json::from_slice(&fs::read(&cfg.converted_path).unwrap()).unwrap();
    assert!(converted.signature.is_fully_defined());

    let zeros = probe::zero_waveform();
    let reloaded = EntryPoint::wrap(Arc::new(ToyModel::new(converted.params)));
    let got = reloaded.call(&zeros).unwrap();
    let want = model.call(&zeros).unwrap();

    for ((name, got), want) in got.iter().zip(&want) {
        assert_eq!(got.shape(), want.shape(), "{name}");
        for (a, b) in got.to_f32_vec().iter().zip(want.to_f32_vec()) {
            assert!((a - b).abs() <= 1e-5, "{name}: {a} vs {b}");
        }
    }
}

#[test]
fn short_output_fails_on_first_call() {
    let entry = EntryPoint::wrap(Arc::new(toy_with_outputs(2)));
    let err = entry.call(&probe::zero_waveform()).unwrap_err();
    assert!(
        matches!(err, ExportError::OutputArity { expected: 3, got: 2 }),
        "{err}"
    );
}

fn toy_with_outputs(n: usize) -> ToyModel {
    ToyModel::new(Params {
        gain: 1.0,
        bias: 0.0,
    })
    .with_outputs(n)
}

#[test]
fn pipeline_aborts_on_short_output_before_writing() {
    let tmp = tempfile::tempdir().unwrap();
    let cfg = config_in(tmp.path());
    let err = Pipeline::new(Arc::new(toy_with_outputs(2)), cfg.clone())
        .run(&ToyConverter)
        .unwrap_err();
    assert!(matches!(err, ExportError::OutputArity { .. }), "{err}");
    assert!(!cfg.export_dir.exists());
    assert!(!cfg.converted_path.exists());
}

#[test]
fn conversion_failure_is_surfaced_and_export_kept() {
    let tmp = tempfile::tempdir().unwrap();
    let cfg = config_in(tmp.path());
    let err = Pipeline::new(toy(), cfg.clone())
        .run(&FailingConverter)
        .unwrap_err();
    match err {
        ExportError::Conversion(msg) => assert_eq!(msg, "unsupported op: Frame"),
        other => panic!("unexpected error: {other}"),
    }
    assert!(ExportArtifact::load(&cfg.export_dir).is_ok());
    assert!(!cfg.converted_path.exists());
}

#[test]
fn rerun_respects_overwrite_policy() {
    let tmp = tempfile::tempdir().unwrap();
    let mut cfg = config_in(tmp.path());
    Pipeline::new(toy(), cfg.clone()).run(&ToyConverter).unwrap();

    let err = Pipeline::new(toy(), cfg.clone())
        .run(&ToyConverter)
        .unwrap_err();
    assert!(matches!(err, ExportError::ArtifactExists(_)), "{err}");

    cfg.overwrite = OverwritePolicy::Replace;
    Pipeline::new(toy(), cfg.clone()).run(&ToyConverter).unwrap();
    assert!(ExportArtifact::load(&cfg.export_dir).is_ok());
}

#[test]
fn pipeline_config_from_yaml() {
    let cfg: PipelineConfig = serde_yaml::from_str("export_dir: out/saved\noverwrite: replace\n").unwrap();
    assert_eq!(cfg.export_dir, Path::new("out/saved"));
    assert_eq!(cfg.converted_path, Path::new("YAMNet.mlmodel"));
    assert_eq!(cfg.overwrite, OverwritePolicy::Replace);
}

#[test]
fn pipeline_config_defaults() {
    let cfg = PipelineConfig::default();
    assert_eq!(cfg.export_dir, Path::new("saved_yamnet_keras_model"));
    assert_eq!(cfg.converted_path, Path::new("YAMNet.mlmodel"));
    assert_eq!(cfg.overwrite, OverwritePolicy::Refuse);
}
