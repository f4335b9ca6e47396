use std::{
    fs,
    path::{Path, PathBuf},
};

use burn::{
    prelude::*,
    record::{FullPrecisionSettings, NamedMpkBytesRecorder, Recorder},
};
use log::info;

pub const BEST_MODEL_FILE: &str = "best_model.model";

type ModelRecorder = NamedMpkBytesRecorder<FullPrecisionSettings>;

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot serialize model: {0}")]
    Record(String),
}

impl CheckpointError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Writes `model` to `<save_dir>/best_model.model`, replacing any earlier
/// file only once the new one is complete.
pub fn save_model<B: Backend, M: Module<B>>(
    model: M,
    save_dir: &Path,
) -> Result<PathBuf, CheckpointError> {
    let recorder = ModelRecorder::new();
    let bytes = <ModelRecorder as Recorder<B>>::record(&recorder, model.into_record(), ())
        .map_err(|e| CheckpointError::Record(format!("{e:?}")))?;

    fs::create_dir_all(save_dir).map_err(|e| CheckpointError::io(save_dir, e))?;

    let path = save_dir.join(BEST_MODEL_FILE);
    let partial = save_dir.join(format!("{BEST_MODEL_FILE}.partial"));

    fs::write(&partial, bytes).map_err(|e| CheckpointError::io(&partial, e))?;
    fs::rename(&partial, &path).map_err(|e| CheckpointError::io(&path, e))?;

    info!("Saved model to {}", path.display());

    Ok(path)
}

/// Restores parameters written by [`save_model`] into `model`.
pub fn load_model<B: Backend, M: Module<B>>(
    model: M,
    path: &Path,
    device: &B::Device,
) -> Result<M, CheckpointError> {
    let bytes = fs::read(path).map_err(|e| CheckpointError::io(path, e))?;

    let recorder = ModelRecorder::new();
    let record: <M as Module<B>>::Record =
        <ModelRecorder as Recorder<B>>::load(&recorder, bytes, device)
            .map_err(|e| CheckpointError::Record(format!("{e:?}")))?;

    Ok(model.load_record(record))
}
