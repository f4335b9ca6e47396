pub mod batcher;
pub mod buffered;
pub mod nli;
pub mod vocab;

use std::path::{Path, PathBuf};

pub use batcher::{NliBatch, NliBatcher, NliItem, Seq2SeqBatch, Seq2SeqBatcher, Seq2SeqItem};
pub use buffered::{BufferedDataSource, CorpusPaths};
pub use nli::{NliDataSource, NliSplit};
pub use vocab::Vocabulary;

#[derive(Debug, thiserror::Error)]
pub enum DataError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("vocabulary: {0}")]
    Vocabulary(String),
    #[error("corpus {0} has no lines for this worker")]
    EmptyCorpus(PathBuf),
    #[error("task {task}: minibatch [{offset}, {end}) reads past buffer of {buffer_size}")]
    BufferOverrun {
        task: usize,
        offset: usize,
        end: usize,
        buffer_size: usize,
    },
    #[error("no task with index {0}")]
    UnknownTask(usize),
    #[error("NLI {0} split is empty")]
    EmptySplit(&'static str),
}

impl DataError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Which slice of every corpus a worker keeps: line `i` belongs to worker
/// `i % world_size`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Shard {
    pub rank: usize,
    pub world_size: usize,
}

impl Shard {
    pub fn new(rank: usize, world_size: usize) -> Self {
        Self { rank, world_size }
    }

    pub fn single() -> Self {
        Self::new(0, 1)
    }

    pub fn owns(&self, line_no: usize) -> bool {
        line_no % self.world_size == self.rank
    }
}
