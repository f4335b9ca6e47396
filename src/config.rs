use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
};

use burn::prelude::*;

use crate::{data::CorpusPaths, model::GenSenModelConfig};

pub const CONFIG_FILE: &str = "config.json";
pub const METRICS_FILE: &str = "metrics.jsonl";
pub const SRC_VOCAB_FILE: &str = "src_vocab.json";
pub const TRG_VOCAB_FILE: &str = "trg_vocab.json";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot load configuration {path}: {message}")]
    Load { path: PathBuf, message: String },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("{key} is {value}, must be at least {min}")]
    TooSmall {
        key: &'static str,
        value: usize,
        min: usize,
    },
    #[error("training.optimizer: unknown optimizer `{0}`, expected `adam` or `sgd`")]
    UnknownOptimizer(String),
    #[error("data.paths lists no tasks")]
    NoTasks,
    #[error("data.paths: task `{0}` is listed twice")]
    DuplicateTask(String),
    #[error("{0} is empty")]
    EmptyPath(String),
    #[error("data.buffer_size {buffer_size} is smaller than training.batch_size {batch_size}")]
    BufferTooSmall {
        buffer_size: usize,
        batch_size: usize,
    },
    #[error("model.dim_src {0} must be even for a bidirectional encoder")]
    OddBidirectional(usize),
}

/// Source/target training and validation files of one seq2seq task.
#[derive(Config, Debug)]
pub struct CorpusConfig {
    pub taskname: String,
    pub train_src: String,
    pub train_trg: String,
    pub val_src: String,
    pub val_trg: String,
}

#[derive(Config, Debug)]
pub struct DataConfig {
    pub save_dir: String,
    /// Run name, also the log file name under `<data_folder>/log`.
    pub task: String,
    pub max_src_length: usize,
    pub max_trg_length: usize,
    pub paths: Vec<CorpusConfig>,
    pub nli_train: String,
    pub nli_dev: String,
    pub nli_test: String,
    #[config(default = 1_000_000)]
    pub buffer_size: usize,
    #[config(default = true)]
    pub lowercase: bool,
}

#[derive(Config, Debug)]
pub struct TrainingConfig {
    pub batch_size: usize,
    pub n_gpus: usize,
    pub optimizer: String,
    pub lrate: f64,
    pub stop_patience: usize,
    /// Shared task-sampling seed; every worker draws its own when unset.
    #[config(default = "None")]
    pub seed: Option<u64>,
    #[config(default = true)]
    pub fp16_compression: bool,
}

#[derive(Config, Debug)]
pub struct ManagementConfig {
    /// Validation runs every time this many more examples have been seen.
    pub monitor_loss: usize,
    #[config(default = false)]
    pub save_on_improvement: bool,
}

#[derive(Config, Debug)]
pub struct GenSenConfig {
    pub data: DataConfig,
    pub model: GenSenModelConfig,
    pub training: TrainingConfig,
    pub management: ManagementConfig,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OptimizerKind {
    Adam,
    Sgd,
}

/// Every file location of a run, resolved against the data folder.
#[derive(Clone, Debug)]
pub struct RunPaths {
    pub save_dir: PathBuf,
    pub log_file: PathBuf,
    pub corpora: Vec<CorpusPaths>,
    pub nli_train: PathBuf,
    pub nli_dev: PathBuf,
    pub nli_test: PathBuf,
}

impl RunPaths {
    pub fn src_vocab(&self) -> PathBuf {
        self.save_dir.join(SRC_VOCAB_FILE)
    }

    pub fn trg_vocab(&self) -> PathBuf {
        self.save_dir.join(TRG_VOCAB_FILE)
    }

    pub fn config_copy(&self) -> PathBuf {
        self.save_dir.join(CONFIG_FILE)
    }

    pub fn metrics(&self) -> PathBuf {
        self.save_dir.join(METRICS_FILE)
    }
}

impl GenSenConfig {
    /// Loads and validates a JSON configuration.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let load_error = |message: String| ConfigError::Load {
            path: path.to_path_buf(),
            message,
        };

        let json = fs::read_to_string(path).map_err(|e| load_error(e.to_string()))?;
        let config: Self = serde_json::from_str(&json).map_err(|e| load_error(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let nonzero = [
            ("training.batch_size", self.training.batch_size),
            ("training.n_gpus", self.training.n_gpus),
            ("management.monitor_loss", self.management.monitor_loss),
            ("model.n_layers_src", self.model.n_layers_src),
            ("model.dim_src", self.model.dim_src),
            ("model.dim_trg", self.model.dim_trg),
        ];
        if let Some((key, _)) = nonzero.into_iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Zero(key));
        }

        self.optimizer_kind()?;

        for (key, value) in [
            ("data.max_src_length", self.data.max_src_length),
            ("data.max_trg_length", self.data.max_trg_length),
        ] {
            if value < 3 {
                return Err(ConfigError::TooSmall { key, value, min: 3 });
            }
        }

        if self.data.paths.is_empty() {
            return Err(ConfigError::NoTasks);
        }

        let mut seen = HashSet::new();
        for (i, corpus) in self.data.paths.iter().enumerate() {
            if !seen.insert(corpus.taskname.as_str()) {
                return Err(ConfigError::DuplicateTask(corpus.taskname.clone()));
            }

            for (field, value) in [
                ("taskname", &corpus.taskname),
                ("train_src", &corpus.train_src),
                ("train_trg", &corpus.train_trg),
                ("val_src", &corpus.val_src),
                ("val_trg", &corpus.val_trg),
            ] {
                if value.is_empty() {
                    return Err(ConfigError::EmptyPath(format!("data.paths[{i}].{field}")));
                }
            }
        }

        for (key, value) in [
            ("data.save_dir", &self.data.save_dir),
            ("data.task", &self.data.task),
            ("data.nli_train", &self.data.nli_train),
            ("data.nli_dev", &self.data.nli_dev),
            ("data.nli_test", &self.data.nli_test),
        ] {
            if value.is_empty() {
                return Err(ConfigError::EmptyPath(key.to_string()));
            }
        }

        if self.data.buffer_size < self.training.batch_size {
            return Err(ConfigError::BufferTooSmall {
                buffer_size: self.data.buffer_size,
                batch_size: self.training.batch_size,
            });
        }

        if self.model.bidirectional && self.model.dim_src % 2 != 0 {
            return Err(ConfigError::OddBidirectional(self.model.dim_src));
        }

        Ok(())
    }

    pub fn optimizer_kind(&self) -> Result<OptimizerKind, ConfigError> {
        match self.training.optimizer.to_lowercase().as_str() {
            "adam" => Ok(OptimizerKind::Adam),
            "sgd" => Ok(OptimizerKind::Sgd),
            _ => Err(ConfigError::UnknownOptimizer(
                self.training.optimizer.clone(),
            )),
        }
    }

    /// Base rate (the override when given) scaled by the number of workers.
    pub fn learning_rate(&self, override_rate: Option<f64>, world_size: usize) -> f64 {
        override_rate.unwrap_or(self.training.lrate) * world_size as f64
    }

    pub fn task_names(&self) -> Vec<String> {
        self.data.paths.iter().map(|p| p.taskname.clone()).collect()
    }

    /// Relative paths are taken from `data_folder`, absolute ones are kept.
    pub fn resolve_paths(&self, data_folder: &Path) -> RunPaths {
        let resolve = |path: &str| data_folder.join(path);

        RunPaths {
            save_dir: resolve(&self.data.save_dir),
            log_file: data_folder.join("log").join(&self.data.task),
            corpora: self
                .data
                .paths
                .iter()
                .map(|corpus| CorpusPaths {
                    taskname: corpus.taskname.clone(),
                    train_src: resolve(&corpus.train_src),
                    train_trg: resolve(&corpus.train_trg),
                    val_src: resolve(&corpus.val_src),
                    val_trg: resolve(&corpus.val_trg),
                })
                .collect(),
            nli_train: resolve(&self.data.nli_train),
            nli_dev: resolve(&self.data.nli_dev),
            nli_test: resolve(&self.data.nli_test),
        }
    }
}
