//! [`OpaqueModel`] backed by an out-of-process inference worker.
//!
//! The pretrained model lives in whatever runtime the worker embeds; this
//! side only speaks the frame [`protocol`] over the worker's stdin and
//! stdout. The worker is spawned once and serves every call, so any lazy
//! initialization it does is paid on the first request.

pub mod protocol;

use std::collections::BTreeMap;
use std::fs;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ExportError, Result};
use crate::model::{ModelState, OpaqueModel};
use crate::tensor::Tensor;
use crate::worker::protocol::{Frame, read_frame, write_frame};

/// State format tag for worker models.
pub const WORKER_STATE_FORMAT: &str = "worker-dir";

/// How to start an inference worker.
///
/// `args` may reference the model directory as `{model_dir}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Directory holding the pretrained model. Its files are the state
    /// persisted into export artifacts.
    pub model_dir: PathBuf,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Name recorded in manifests (default: the model directory's name).
    #[serde(default)]
    pub name: Option<String>,
}

/// [`OpaqueModel`] implementation using a worker process.
///
/// # Thread Safety
///
/// Calls are serialized through a mutex; the worker handles one request
/// at a time.
pub struct WorkerModel {
    name: String,
    model_dir: PathBuf,
    inner: Mutex<WorkerInner>,
}

struct WorkerInner {
    child: Child,
    stdin: Option<BufWriter<ChildStdin>>,
    stdout: BufReader<ChildStdout>,
    closed: bool,
}

impl WorkerModel {
    /// Starts the worker described by `cfg`.
    pub fn spawn(cfg: &WorkerConfig) -> Result<Self> {
        if !cfg.model_dir.is_dir() {
            return Err(ExportError::Model(format!(
                "model directory {:?} not found",
                cfg.model_dir
            )));
        }

        let model_dir = cfg.model_dir.to_string_lossy();
        let args: Vec<String> = cfg
            .args
            .iter()
            .map(|a| a.replace("{model_dir}", &model_dir))
            .collect();

        debug!(program = %cfg.program, ?args, "spawning inference worker");
        let mut child = Command::new(&cfg.program)
            .args(&args)
            .envs(&cfg.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| {
                std::io::Error::new(e.kind(), format!("spawn worker {:?}: {e}", cfg.program))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ExportError::Model("worker stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExportError::Model("worker stdout unavailable".into()))?;

        let name = cfg.name.clone().unwrap_or_else(|| {
            cfg.model_dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "model".to_string())
        });

        Ok(Self {
            name,
            model_dir: cfg.model_dir.clone(),
            inner: Mutex::new(WorkerInner {
                child,
                stdin: Some(BufWriter::new(stdin)),
                stdout: BufReader::new(stdout),
                closed: false,
            }),
        })
    }

    pub fn model_dir(&self) -> &Path {
        &self.model_dir
    }

    /// Closes the worker's stdin and waits for it to exit.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.lock()?;
        if inner.closed {
            return Ok(());
        }
        inner.closed = true;
        inner.stdin = None;
        let status = inner.child.wait()?;
        if !status.success() {
            warn!(%status, "inference worker exited with failure");
        }
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, WorkerInner>> {
        self.inner
            .lock()
            .map_err(|_| ExportError::Model("worker lock poisoned".into()))
    }
}

impl OpaqueModel for WorkerModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn call(&self, waveform: &Tensor) -> Result<Vec<Tensor>> {
        let mut inner = self.lock()?;
        if inner.closed {
            return Err(ExportError::Model("worker is closed".into()));
        }
        let stdin = inner
            .stdin
            .as_mut()
            .ok_or_else(|| ExportError::Model("worker is closed".into()))?;
        write_frame(stdin, &Frame::call(waveform))?;
        let reply = read_frame(&mut inner.stdout)?;
        reply.into_outputs()
    }

    fn state(&self) -> Result<ModelState> {
        let mut state = ModelState::new(WORKER_STATE_FORMAT);
        collect_files(&self.model_dir, &self.model_dir, &mut state.blobs)?;
        Ok(state)
    }
}

impl Drop for WorkerModel {
    fn drop(&mut self) {
        if let Ok(inner) = self.inner.get_mut() {
            if !inner.closed {
                inner.stdin = None;
                let _ = inner.child.kill();
                let _ = inner.child.wait();
            }
        }
    }
}

/// Reads every regular file under `dir` into `out`, keyed by its
/// `/`-separated path relative to `root`.
fn collect_files(root: &Path, dir: &Path, out: &mut BTreeMap<String, Vec<u8>>) -> Result<()> {
    let mut entries: Vec<_> = fs::read_dir(dir)?.collect::<std::io::Result<_>>()?;
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        let path = entry.path();
        let ty = entry.file_type()?;
        if ty.is_dir() {
            collect_files(root, &path, out)?;
        } else if ty.is_file() {
            let rel = path
                .strip_prefix(root)
                .map_err(|e| ExportError::Model(e.to_string()))?;
            let key = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            out.insert(key, fs::read(&path)?);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("saved_model.pb"), b"graph").unwrap();
        fs::create_dir(dir.path().join("variables")).unwrap();
        fs::write(dir.path().join("variables/variables.index"), b"idx").unwrap();
        dir
    }

    #[test]
    fn spawn_requires_model_dir() {
        let cfg = WorkerConfig {
            program: "cat".into(),
            model_dir: PathBuf::from("/nonexistent/yamnet"),
            ..Default::default()
        };
        assert!(matches!(WorkerModel::spawn(&cfg), Err(ExportError::Model(_))));
    }

    #[cfg(unix)]
    #[test]
    fn state_snapshots_model_dir() {
        let dir = model_dir();
        let cfg = WorkerConfig {
            program: "cat".into(),
            model_dir: dir.path().to_path_buf(),
            name: Some("yamnet".into()),
            ..Default::default()
        };
        let model = WorkerModel::spawn(&cfg).unwrap();
        assert_eq!(model.name(), "yamnet");

        let state = model.state().unwrap();
        assert_eq!(state.format, WORKER_STATE_FORMAT);
        let keys: Vec<&str> = state.blobs.keys().map(String::as_str).collect();
        assert_eq!(keys, ["saved_model.pb", "variables/variables.index"]);
        assert_eq!(state.blobs["saved_model.pb"], b"graph");
        model.close().unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn echo_worker_is_protocol_error() {
        // `cat` echoes the request back: a frame with a payload but no
        // output specs.
        let dir = model_dir();
        let cfg = WorkerConfig {
            program: "cat".into(),
            model_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let model = WorkerModel::spawn(&cfg).unwrap();
        let err = model.call(&Tensor::vector(vec![0.25; 16])).unwrap_err();
        assert!(matches!(err, ExportError::Protocol(_)), "{err}");
    }

    #[cfg(unix)]
    #[test]
    fn closed_worker_rejects_calls() {
        let dir = model_dir();
        let cfg = WorkerConfig {
            program: "cat".into(),
            model_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let model = WorkerModel::spawn(&cfg).unwrap();
        model.close().unwrap();
        model.close().unwrap();
        assert!(matches!(
            model.call(&Tensor::vector(vec![0.0; 4])),
            Err(ExportError::Model(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn exiting_worker_is_protocol_error() {
        let dir = model_dir();
        let cfg = WorkerConfig {
            program: "true".into(),
            model_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let model = WorkerModel::spawn(&cfg).unwrap();
        let err = model.call(&Tensor::vector(vec![0.0; 4])).unwrap_err();
        // Either the write hits a closed pipe or the read hits EOF.
        assert!(
            matches!(err, ExportError::Protocol(_) | ExportError::Io(_)),
            "{err}"
        );
    }
}
