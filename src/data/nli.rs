use std::{
    fs::File,
    io::{BufRead, BufReader},
    path::Path,
};

use burn::{data::dataloader::batcher::Batcher, prelude::Backend};
use log::{debug, info};
use rand::{Rng, seq::SliceRandom};

use super::{
    DataError, NliBatch, NliBatcher, NliItem, Shard,
    vocab::{Vocabulary, frame},
};

pub const NUM_CLASSES: usize = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum NliSplit {
    #[default]
    Train,
    Dev,
    Test,
}

impl NliSplit {
    pub fn name(&self) -> &'static str {
        match self {
            NliSplit::Train => "train",
            NliSplit::Dev => "dev",
            NliSplit::Test => "test",
        }
    }
}

fn label_id(label: &str) -> Option<u32> {
    match label.trim() {
        "entailment" => Some(0),
        "neutral" => Some(1),
        "contradiction" => Some(2),
        _ => None,
    }
}

#[derive(Clone, Debug)]
struct Example {
    premise: Vec<u32>,
    hypothesis: Vec<u32>,
    label: u32,
}

/// Sentence-pair classification data, fully resident in memory.
pub struct NliDataSource {
    train: Vec<Example>,
    dev: Vec<Example>,
    test: Vec<Example>,
    max_len: usize,
    batcher: NliBatcher,
}

impl NliDataSource {
    /// Reads `premise \t hypothesis \t label` files. The train split is
    /// shuffled once with `rng`.
    pub fn from_files<R: Rng>(
        train: &Path,
        dev: &Path,
        test: &Path,
        vocab: &Vocabulary,
        max_len: usize,
        shard: Shard,
        rng: &mut R,
    ) -> Result<Self, DataError> {
        let mut train_examples = read_split(train, vocab, shard)?;
        if train_examples.is_empty() {
            return Err(DataError::EmptySplit(NliSplit::Train.name()));
        }
        train_examples.shuffle(rng);

        let source = Self {
            train: train_examples,
            dev: read_split(dev, vocab, shard)?,
            test: read_split(test, vocab, shard)?,
            max_len,
            batcher: NliBatcher,
        };

        info!(
            "NLI examples: {} train, {} dev, {} test",
            source.train.len(),
            source.dev.len(),
            source.test.len()
        );

        Ok(source)
    }

    fn split(&self, split: NliSplit) -> &[Example] {
        match split {
            NliSplit::Train => &self.train,
            NliSplit::Dev => &self.dev,
            NliSplit::Test => &self.test,
        }
    }

    pub fn len(&self, split: NliSplit) -> usize {
        self.split(split).len()
    }

    /// Examples `[offset, offset + size)` of `split`, clamped to its end.
    pub fn get_parallel_minibatch<B: Backend>(
        &self,
        offset: usize,
        size: usize,
        split: NliSplit,
        device: &B::Device,
    ) -> NliBatch<B> {
        let examples = self.split(split);
        let end = (offset + size).min(examples.len());

        let items = examples[offset.min(end)..end]
            .iter()
            .map(|example| NliItem {
                premise: frame(&example.premise, self.max_len),
                hypothesis: frame(&example.hypothesis, self.max_len),
                label: example.label,
            })
            .collect();

        self.batcher.batch(items, device)
    }
}

fn read_split(path: &Path, vocab: &Vocabulary, shard: Shard) -> Result<Vec<Example>, DataError> {
    let file = File::open(path).map_err(|e| DataError::io(path, e))?;
    let mut examples = Vec::new();
    let mut skipped = 0;

    for (line_no, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| DataError::io(path, e))?;
        if !shard.owns(line_no) {
            continue;
        }

        let mut fields = line.split('\t');
        let parsed = match (fields.next(), fields.next(), fields.next()) {
            (Some(premise), Some(hypothesis), Some(label)) => {
                label_id(label).map(|label| Example {
                    premise: vocab.encode(premise),
                    hypothesis: vocab.encode(hypothesis),
                    label,
                })
            }
            _ => None,
        };

        match parsed {
            Some(example) => examples.push(example),
            None => skipped += 1,
        }
    }

    if skipped > 0 {
        debug!("{}: skipped {skipped} unlabeled or malformed lines", path.display());
    }

    Ok(examples)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use rand::{SeedableRng, rngs::StdRng};
    use std::io::Write;

    type TestBackend = NdArray<f32>;

    fn write(path: &Path, lines: &[&str]) {
        let mut file = File::create(path).unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
    }

    #[test]
    fn parses_labels_and_skips_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let dir = dir.path();
        write(
            &dir.join("train.txt"),
            &[
                "a man sleeps\ta person rests\tentailment",
                "a man sleeps\ta dog barks\tneutral",
                "a man sleeps\ta man runs\tcontradiction",
                "a man sleeps\tnobody knows\t-",
                "broken line",
            ],
        );
        write(&dir.join("dev.txt"), &["a b\tc d\tneutral"]);
        write(&dir.join("test.txt"), &[]);
        write(&dir.join("words.txt"), &["a man sleeps person rests dog"]);

        let vocab =
            Vocabulary::build(&dir.join("v.json"), &[dir.join("words.txt")], 100, true).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        let source = NliDataSource::from_files(
            &dir.join("train.txt"),
            &dir.join("dev.txt"),
            &dir.join("test.txt"),
            &vocab,
            16,
            Shard::single(),
            &mut rng,
        )
        .unwrap();

        assert_eq!(source.len(NliSplit::Train), 3);
        assert_eq!(source.len(NliSplit::Dev), 1);
        assert_eq!(source.len(NliSplit::Test), 0);

        let device = Default::default();
        let batch: NliBatch<TestBackend> =
            source.get_parallel_minibatch(2, 4, NliSplit::Train, &device);
        assert_eq!(batch.labels.dims(), [1]);

        let mut labels: Vec<i64> = source
            .get_parallel_minibatch::<TestBackend>(0, 3, NliSplit::Train, &device)
            .labels
            .into_data()
            .iter::<i64>()
            .collect();
        labels.sort();
        assert_eq!(labels, vec![0, 1, 2]);
    }

    #[test]
    fn empty_train_split_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let dir = dir.path();
        for name in ["train.txt", "dev.txt", "test.txt"] {
            write(&dir.join(name), &[]);
        }
        write(&dir.join("words.txt"), &["a"]);
        let vocab =
            Vocabulary::build(&dir.join("v.json"), &[dir.join("words.txt")], 10, true).unwrap();

        let result = NliDataSource::from_files(
            &dir.join("train.txt"),
            &dir.join("dev.txt"),
            &dir.join("test.txt"),
            &vocab,
            16,
            Shard::single(),
            &mut StdRng::seed_from_u64(0),
        );
        assert!(matches!(result, Err(DataError::EmptySplit("train"))));
    }
}
