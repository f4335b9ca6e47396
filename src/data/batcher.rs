use burn::{
    data::dataloader::batcher::Batcher,
    prelude::Backend,
    tensor::{Int, Tensor, TensorData},
};

use super::vocab::PAD_ID;

/// One framed source/target pair, `<s> .. </s>` on both sides.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Seq2SeqItem {
    pub src: Vec<u32>,
    pub trg: Vec<u32>,
}

#[derive(Clone, Debug)]
pub struct Seq2SeqBatch<B: Backend> {
    pub input_src: Tensor<B, 2, Int>,
    /// Decoder input, the target without its final token.
    pub input_trg: Tensor<B, 2, Int>,
    /// Decoder labels, the target without its leading `<s>`.
    pub output_trg: Tensor<B, 2, Int>,
    pub src_lens: Vec<usize>,
}

impl<B: Backend> Seq2SeqBatch<B> {
    pub fn len(&self) -> usize {
        self.src_lens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.src_lens.is_empty()
    }
}

#[derive(Clone, Default)]
pub struct Seq2SeqBatcher;

impl<B: Backend> Batcher<B, Seq2SeqItem, Seq2SeqBatch<B>> for Seq2SeqBatcher {
    fn batch(&self, mut items: Vec<Seq2SeqItem>, device: &B::Device) -> Seq2SeqBatch<B> {
        // Longest source first; stable so aligned corpora keep aligned rows.
        items.sort_by(|a, b| b.src.len().cmp(&a.src.len()));

        let src_lens: Vec<usize> = items.iter().map(|item| item.src.len()).collect();
        let input_src = pad_rows::<B>(items.iter().map(|item| &item.src[..]), device);
        let input_trg = pad_rows::<B>(
            items.iter().map(|item| &item.trg[..item.trg.len() - 1]),
            device,
        );
        let output_trg = pad_rows::<B>(items.iter().map(|item| &item.trg[1..]), device);

        Seq2SeqBatch {
            input_src,
            input_trg,
            output_trg,
            src_lens,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NliItem {
    pub premise: Vec<u32>,
    pub hypothesis: Vec<u32>,
    pub label: u32,
}

#[derive(Clone, Debug)]
pub struct NliBatch<B: Backend> {
    pub premise: Tensor<B, 2, Int>,
    pub hypothesis: Tensor<B, 2, Int>,
    pub labels: Tensor<B, 1, Int>,
}

#[derive(Clone, Default)]
pub struct NliBatcher;

impl<B: Backend> Batcher<B, NliItem, NliBatch<B>> for NliBatcher {
    fn batch(&self, items: Vec<NliItem>, device: &B::Device) -> NliBatch<B> {
        let premise = pad_rows::<B>(items.iter().map(|item| &item.premise[..]), device);
        let hypothesis = pad_rows::<B>(items.iter().map(|item| &item.hypothesis[..]), device);

        let labels: Vec<i64> = items.iter().map(|item| item.label as i64).collect();
        let n = labels.len();
        let labels = Tensor::from_data(TensorData::new(labels, [n]), device);

        NliBatch {
            premise,
            hypothesis,
            labels,
        }
    }
}

fn pad_rows<'a, B: Backend>(
    rows: impl ExactSizeIterator<Item = &'a [u32]> + Clone,
    device: &B::Device,
) -> Tensor<B, 2, Int> {
    let n_rows = rows.len();
    let width = rows.clone().map(|row| row.len()).max().unwrap_or(0);

    let mut data = Vec::with_capacity(n_rows * width);
    for row in rows {
        data.extend(row.iter().map(|&id| id as i64));
        data.extend(std::iter::repeat_n(PAD_ID as i64, width - row.len()));
    }

    Tensor::from_data(TensorData::new(data, [n_rows, width]), device)
}
