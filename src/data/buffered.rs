use std::{
    fs::File,
    io::{BufRead, BufReader, Lines},
    path::{Path, PathBuf},
    sync::Arc,
};

use burn::{data::dataloader::batcher::Batcher, prelude::Backend};
use log::{debug, warn};

use super::{
    DataError, Seq2SeqBatch, Seq2SeqBatcher, Seq2SeqItem, Shard,
    vocab::{Vocabulary, frame},
};

/// On-disk location of one seq2seq task.
#[derive(Clone, Debug)]
pub struct CorpusPaths {
    pub taskname: String,
    pub train_src: PathBuf,
    pub train_trg: PathBuf,
    pub val_src: PathBuf,
    pub val_trg: PathBuf,
}

/// Line reader over a corpus file that restarts from the top on demand.
struct CorpusReader {
    path: PathBuf,
    lines: Lines<BufReader<File>>,
}

impl CorpusReader {
    fn open(path: &Path) -> Result<Self, DataError> {
        let file = File::open(path).map_err(|e| DataError::io(path, e))?;
        Ok(Self {
            path: path.to_path_buf(),
            lines: BufReader::new(file).lines(),
        })
    }

    fn next_line(&mut self) -> Result<Option<String>, DataError> {
        self.lines
            .next()
            .transpose()
            .map_err(|e| DataError::io(&self.path, e))
    }

    fn rewind(&mut self) -> Result<(), DataError> {
        *self = Self::open(&self.path)?;
        Ok(())
    }
}

/// Tokenized sentence pair as read from disk, without `<s>`/`</s>`.
#[derive(Clone, Debug)]
struct Pair {
    src: Vec<u32>,
    trg: Vec<u32>,
}

impl Pair {
    fn framed(&self, max_src_len: usize, max_trg_len: usize) -> Seq2SeqItem {
        Seq2SeqItem {
            src: frame(&self.src, max_src_len),
            trg: frame(&self.trg, max_trg_len),
        }
    }
}

/// In-memory window over one task's training corpus plus its read cursor.
struct TaskBuffer {
    name: String,
    src: CorpusReader,
    trg: CorpusReader,
    /// Line number of the next pair the readers will yield.
    line_no: usize,
    pairs: Vec<Pair>,
    cursor: usize,
    passes: usize,
    validation: Vec<Pair>,
}

/// Minibatch supplier for every translation/skip-thought task. Each task keeps
/// `buffer_size` pairs in memory and streams the rest of its corpus from disk.
pub struct BufferedDataSource {
    tasks: Vec<TaskBuffer>,
    src_vocab: Arc<Vocabulary>,
    trg_vocab: Arc<Vocabulary>,
    buffer_size: usize,
    shard: Shard,
    batcher: Seq2SeqBatcher,
}

impl BufferedDataSource {
    pub fn new(
        corpora: &[CorpusPaths],
        src_vocab: Arc<Vocabulary>,
        trg_vocab: Arc<Vocabulary>,
        buffer_size: usize,
        shard: Shard,
    ) -> Result<Self, DataError> {
        let mut tasks = Vec::with_capacity(corpora.len());

        for corpus in corpora {
            let validation = read_pairs(
                &corpus.val_src,
                &corpus.val_trg,
                &src_vocab,
                &trg_vocab,
                shard,
            )?;

            tasks.push(TaskBuffer {
                name: corpus.taskname.clone(),
                src: CorpusReader::open(&corpus.train_src)?,
                trg: CorpusReader::open(&corpus.train_trg)?,
                line_no: 0,
                pairs: Vec::new(),
                cursor: 0,
                passes: 0,
                validation,
            });
        }

        let mut source = Self {
            tasks,
            src_vocab,
            trg_vocab,
            buffer_size,
            shard,
            batcher: Seq2SeqBatcher,
        };

        for idx in 0..source.tasks.len() {
            source.fetch_buffer(idx)?;
        }

        Ok(source)
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn cursor(&self, task: usize) -> Option<usize> {
        self.tasks.get(task).map(|t| t.cursor)
    }

    /// Number of completed passes over the task's training corpus.
    pub fn passes(&self, task: usize) -> Option<usize> {
        self.tasks.get(task).map(|t| t.passes)
    }

    /// Replaces the task's buffer with the next `buffer_size` pairs of its
    /// shard, wrapping to the top of the corpus when the files run out.
    pub fn fetch_buffer(&mut self, task: usize) -> Result<(), DataError> {
        let buffer_size = self.buffer_size;
        let shard = self.shard;
        let src_vocab = self.src_vocab.clone();
        let trg_vocab = self.trg_vocab.clone();
        let state = self
            .tasks
            .get_mut(task)
            .ok_or(DataError::UnknownTask(task))?;

        let mut pairs = Vec::with_capacity(buffer_size);
        let mut from_top = state.line_no == 0;
        let mut kept_this_pass = 0;

        while pairs.len() < buffer_size {
            let (src, trg) = match (state.src.next_line()?, state.trg.next_line()?) {
                (Some(src), Some(trg)) => (src, trg),
                (src, trg) => {
                    if src.is_some() != trg.is_some() {
                        warn!(
                            "Task {}: source and target corpora have different lengths, rewinding both",
                            state.name
                        );
                    }
                    if from_top && kept_this_pass == 0 {
                        return Err(DataError::EmptyCorpus(state.src.path.clone()));
                    }

                    state.src.rewind()?;
                    state.trg.rewind()?;
                    state.line_no = 0;
                    state.passes += 1;
                    from_top = true;
                    kept_this_pass = 0;
                    debug!("Task {}: corpus pass {} done", state.name, state.passes);
                    continue;
                }
            };

            let line_no = state.line_no;
            state.line_no += 1;

            if !shard.owns(line_no) {
                continue;
            }

            pairs.push(Pair {
                src: src_vocab.encode(&src),
                trg: trg_vocab.encode(&trg),
            });
            kept_this_pass += 1;
        }

        state.pairs = pairs;
        state.cursor = 0;

        Ok(())
    }

    /// Builds the minibatch of `size` pairs starting at `offset` in the task's
    /// current buffer. Fails rather than reading past the buffer.
    pub fn get_parallel_minibatch<B: Backend>(
        &self,
        task: usize,
        offset: usize,
        size: usize,
        max_src_len: usize,
        max_trg_len: usize,
        device: &B::Device,
    ) -> Result<Seq2SeqBatch<B>, DataError> {
        let state = self.tasks.get(task).ok_or(DataError::UnknownTask(task))?;
        let end = offset + size;

        if end > state.pairs.len() {
            return Err(DataError::BufferOverrun {
                task,
                offset,
                end,
                buffer_size: state.pairs.len(),
            });
        }

        let items = state.pairs[offset..end]
            .iter()
            .map(|pair| pair.framed(max_src_len, max_trg_len))
            .collect();

        Ok(self.batcher.batch(items, device))
    }

    /// Reads the minibatch at the task's cursor, then advances the cursor and
    /// refills the buffer once another minibatch of `size` would not fit.
    pub fn next_minibatch<B: Backend>(
        &mut self,
        task: usize,
        size: usize,
        max_src_len: usize,
        max_trg_len: usize,
        device: &B::Device,
    ) -> Result<Seq2SeqBatch<B>, DataError> {
        let offset = self.cursor(task).ok_or(DataError::UnknownTask(task))?;
        let batch =
            self.get_parallel_minibatch(task, offset, size, max_src_len, max_trg_len, device)?;

        let cursor = offset + size;
        if cursor + size > self.buffer_size {
            self.fetch_buffer(task)?;
        } else {
            self.tasks[task].cursor = cursor;
        }

        Ok(batch)
    }

    pub fn validation_len(&self, task: usize) -> usize {
        self.tasks.get(task).map_or(0, |t| t.validation.len())
    }

    /// Validation pairs `[offset, offset + size)`, clamped to the split.
    pub fn validation_minibatch<B: Backend>(
        &self,
        task: usize,
        offset: usize,
        size: usize,
        max_src_len: usize,
        max_trg_len: usize,
        device: &B::Device,
    ) -> Result<Seq2SeqBatch<B>, DataError> {
        let state = self.tasks.get(task).ok_or(DataError::UnknownTask(task))?;
        let end = (offset + size).min(state.validation.len());

        let items = state.validation[offset.min(end)..end]
            .iter()
            .map(|pair| pair.framed(max_src_len, max_trg_len))
            .collect();

        Ok(self.batcher.batch(items, device))
    }
}

fn read_pairs(
    src_path: &Path,
    trg_path: &Path,
    src_vocab: &Vocabulary,
    trg_vocab: &Vocabulary,
    shard: Shard,
) -> Result<Vec<Pair>, DataError> {
    let mut src = CorpusReader::open(src_path)?;
    let mut trg = CorpusReader::open(trg_path)?;
    let mut pairs = Vec::new();
    let mut line_no = 0;

    while let (Some(s), Some(t)) = (src.next_line()?, trg.next_line()?) {
        if shard.owns(line_no) {
            pairs.push(Pair {
                src: src_vocab.encode(&s),
                trg: trg_vocab.encode(&t),
            });
        }
        line_no += 1;
    }

    Ok(pairs)
}
