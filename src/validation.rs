use burn::{prelude::*, tensor::ElementConversion};

use crate::{
    data::{BufferedDataSource, DataError, NliDataSource, NliSplit},
    loss::SequenceCriterion,
    model::MultitaskModel,
};

/// Starting value of the best validation loss; any real loss beats it.
pub const INITIAL_MIN_VAL_LOSS: f64 = 1e7;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Continue,
    Stop,
}

/// Result of feeding one task's validation loss to the selector.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Observation {
    pub improved: bool,
    pub verdict: Verdict,
}

/// Tracks the lowest validation loss seen so far, the monitoring interval it
/// was seen in and a snapshot of the parameters that produced it.
pub struct CheckpointSelector<S> {
    patience: usize,
    min_val_loss: f64,
    min_val_loss_epoch: i64,
    best: Option<S>,
}

impl<S> CheckpointSelector<S> {
    pub fn new(patience: usize) -> Self {
        Self {
            patience,
            min_val_loss: INITIAL_MIN_VAL_LOSS,
            min_val_loss_epoch: -1,
            best: None,
        }
    }

    pub fn min_val_loss(&self) -> f64 {
        self.min_val_loss
    }

    pub fn min_val_loss_epoch(&self) -> i64 {
        self.min_val_loss_epoch
    }

    pub fn best(&self) -> Option<&S> {
        self.best.as_ref()
    }

    pub fn take_best(&mut self) -> Option<S> {
        self.best.take()
    }

    /// Records `loss` measured at `monitor_epoch`. `snapshot` is only called
    /// when the loss is strictly lower than every earlier one.
    pub fn observe(
        &mut self,
        monitor_epoch: usize,
        loss: f64,
        snapshot: impl FnOnce() -> S,
    ) -> Observation {
        let improved = loss < self.min_val_loss;

        if improved {
            self.min_val_loss = loss;
            self.min_val_loss_epoch = monitor_epoch as i64;
            self.best = Some(snapshot());
        }

        let stale = monitor_epoch as i64 - self.min_val_loss_epoch;
        let verdict = if stale > self.patience as i64 {
            Verdict::Stop
        } else {
            Verdict::Continue
        };

        Observation { improved, verdict }
    }
}

/// Fraction of matching entries, NaN when there are none.
pub fn accuracy(predictions: &[i64], labels: &[i64]) -> f64 {
    let (correct, total) = count_correct(predictions, labels);
    accuracy_from_counts(correct, total)
}

pub fn accuracy_from_counts(correct: f64, total: f64) -> f64 {
    if total == 0.0 {
        f64::NAN
    } else {
        correct / total
    }
}

fn count_correct(predictions: &[i64], labels: &[i64]) -> (f64, f64) {
    let correct = predictions
        .iter()
        .zip(labels)
        .filter(|(pred, label)| pred == label)
        .count();

    (correct as f64, predictions.len().min(labels.len()) as f64)
}

/// Sum of per-minibatch losses and the number of minibatches it covers.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct LossSum {
    pub sum: f64,
    pub batches: f64,
}

impl LossSum {
    pub fn mean(&self) -> f64 {
        if self.batches == 0.0 {
            f64::NAN
        } else {
            self.sum / self.batches
        }
    }
}

/// Runs `model` over the task's whole validation split (this worker's shard)
/// in strides of `batch_size`.
#[allow(clippy::too_many_arguments)]
pub fn sequence_validation_loss<B: Backend, M: MultitaskModel<B>>(
    model: &M,
    data: &BufferedDataSource,
    criterion: &SequenceCriterion<B>,
    task: usize,
    batch_size: usize,
    max_src_len: usize,
    max_trg_len: usize,
    device: &B::Device,
) -> Result<LossSum, DataError> {
    let mut total = LossSum::default();

    for offset in (0..data.validation_len(task)).step_by(batch_size) {
        let batch = data.validation_minibatch::<B>(
            task,
            offset,
            batch_size,
            max_src_len,
            max_trg_len,
            device,
        )?;

        let logits = model.forward_seq2seq(task, &batch);
        let loss = criterion.forward(logits, batch.output_trg);

        total.sum += loss.into_scalar().elem::<f64>();
        total.batches += 1.0;
    }

    Ok(total)
}

/// `(correct, total)` predictions of the NLI head over a whole split.
pub fn nli_counts<B: Backend, M: MultitaskModel<B>>(
    model: &M,
    nli: &NliDataSource,
    split: NliSplit,
    batch_size: usize,
    device: &B::Device,
) -> (f64, f64) {
    let mut correct = 0.0;
    let mut total = 0.0;

    for offset in (0..nli.len(split)).step_by(batch_size) {
        let batch = nli.get_parallel_minibatch::<B>(offset, batch_size, split, device);
        let [rows, _] = batch.premise.dims();

        let predictions: Vec<i64> = model
            .forward_nli(&batch)
            .argmax(1)
            .reshape([rows])
            .into_data()
            .iter::<i64>()
            .collect();
        let labels: Vec<i64> = batch.labels.into_data().iter::<i64>().collect();

        let (c, t) = count_correct(&predictions, &labels);
        correct += c;
        total += t;
    }

    (correct, total)
}
