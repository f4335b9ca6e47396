use burn::{
    nn::loss::{CrossEntropyLoss, CrossEntropyLossConfig},
    prelude::*,
};

use crate::data::vocab::PAD_ID;

/// Token-level cross-entropy that ignores `<pad>` targets: the pad class gets
/// weight zero, so the loss is the mean over real target tokens only.
#[derive(Clone, Debug)]
pub struct SequenceCriterion<B: Backend> {
    loss: CrossEntropyLoss<B>,
}

impl<B: Backend> SequenceCriterion<B> {
    pub fn new(vocab_size: usize, device: &B::Device) -> Self {
        let weights = (0..vocab_size)
            .map(|id| if id == PAD_ID as usize { 0.0 } else { 1.0 })
            .collect();

        Self {
            loss: CrossEntropyLossConfig::new()
                .with_weights(Some(weights))
                .init(device),
        }
    }

    /// `logits` is `[batch, time, vocab]`, `targets` is `[batch, time]`.
    pub fn forward(&self, logits: Tensor<B, 3>, targets: Tensor<B, 2, Int>) -> Tensor<B, 1> {
        let logits = logits.flatten::<2>(0, 1);
        let targets = targets.reshape([-1]);

        self.loss.forward(logits, targets)
    }
}

/// Plain cross-entropy over the three NLI classes.
pub fn nli_criterion<B: Backend>(device: &B::Device) -> CrossEntropyLoss<B> {
    CrossEntropyLossConfig::new().init(device)
}
