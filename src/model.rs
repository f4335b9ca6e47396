use burn::{
    nn::{
        Dropout, DropoutConfig, Embedding, EmbeddingConfig, Linear, LinearConfig, Lstm,
        LstmConfig, LstmState, Relu,
    },
    prelude::*,
};

use crate::data::{NliBatch, Seq2SeqBatch, nli::NUM_CLASSES, vocab::PAD_ID};

/// What the training loop needs from a model: one decoder per seq2seq task,
/// a paired forward pass for skip-thought and a sentence-pair classifier.
pub trait MultitaskModel<B: Backend> {
    /// Logits `[batch, time, trg_vocab]` for task `task`.
    fn forward_seq2seq(&self, task: usize, batch: &Seq2SeqBatch<B>) -> Tensor<B, 3>;

    /// Encodes `batch` once and decodes both its targets (with decoder
    /// `forward`) and `partner`'s targets (with decoder `backward`).
    fn forward_paired(
        &self,
        forward: usize,
        backward: usize,
        batch: &Seq2SeqBatch<B>,
        partner: &Seq2SeqBatch<B>,
    ) -> (Tensor<B, 3>, Tensor<B, 3>);

    /// Class logits `[batch, 3]`.
    fn forward_nli(&self, batch: &NliBatch<B>) -> Tensor<B, 2>;
}

/// Number of non-pad tokens per row, shaped `[batch, 1]`.
fn sequence_lengths<B: Backend>(tokens: &Tensor<B, 2, Int>) -> Tensor<B, 2, Int> {
    tokens
        .clone()
        .not_equal_elem(PAD_ID as i64)
        .int()
        .sum_dim(1)
}

/// Gather index that reverses each row within its length and leaves the
/// padded tail in place.
fn reverse_index<B: Backend>(lengths: &Tensor<B, 2, Int>, seq_len: usize) -> Tensor<B, 2, Int> {
    let [batch, _] = lengths.dims();
    let device = lengths.device();

    let positions = Tensor::<B, 1, Int>::arange(0..seq_len as i64, &device)
        .reshape([1, seq_len])
        .repeat_dim(0, batch);
    let lengths = lengths.clone().repeat_dim(1, seq_len);

    let reversed = lengths.clone().sub(positions.clone()).sub_scalar(1);
    let inside = positions.clone().lower(lengths);

    positions.mask_where(inside, reversed)
}

fn reverse_within<B: Backend>(x: Tensor<B, 3>, index: &Tensor<B, 2, Int>) -> Tensor<B, 3> {
    let [_, _, dim] = x.dims();
    x.gather(1, index.clone().unsqueeze_dim::<3>(2).repeat_dim(2, dim))
}

/// Output at the last real token of every row.
fn last_step<B: Backend>(x: Tensor<B, 3>, lengths: &Tensor<B, 2, Int>) -> Tensor<B, 2> {
    let [batch, _, dim] = x.dims();
    let index = lengths
        .clone()
        .sub_scalar(1)
        .unsqueeze_dim::<3>(2)
        .repeat_dim(2, dim);

    x.gather(1, index).reshape([batch, dim])
}

/// Stacked LSTM encoder. With a backward stack each layer reads the
/// concatenated outputs of both directions of the layer below.
#[derive(Module, Debug)]
pub struct Encoder<B: Backend> {
    forward: Vec<Lstm<B>>,
    backward: Vec<Lstm<B>>,
}

impl<B: Backend> Encoder<B> {
    /// Sentence code of every row: the top layer's state after the last real
    /// token, both directions concatenated.
    pub fn forward(&self, embedded: Tensor<B, 3>, lengths: Tensor<B, 2, Int>) -> Tensor<B, 2> {
        let [_, seq_len, _] = embedded.dims();
        let reverse = reverse_index(&lengths, seq_len);
        let top = self.forward.len().saturating_sub(1);

        let mut x = embedded;
        let mut code = Vec::with_capacity(2);

        for (layer, lstm) in self.forward.iter().enumerate() {
            let (fwd, _) = lstm.forward(x.clone(), None);
            if layer == top {
                code.push(last_step(fwd.clone(), &lengths));
            }

            x = match self.backward.get(layer) {
                Some(lstm) => {
                    let (bwd, _) = lstm.forward(reverse_within(x, &reverse), None);
                    if layer == top {
                        code.push(last_step(bwd.clone(), &lengths));
                    }
                    Tensor::cat(vec![fwd, reverse_within(bwd, &reverse)], 2)
                }
                None => fwd,
            };
        }

        Tensor::cat(code, 1)
    }
}

/// LSTM decoder conditioned on the sentence code at every step.
#[derive(Module, Debug)]
pub struct Decoder<B: Backend> {
    embedding: Embedding<B>,
    init_state: Linear<B>,
    lstm: Lstm<B>,
    to_vocab: Linear<B>,
}

impl<B: Backend> Decoder<B> {
    pub fn forward(&self, input_trg: Tensor<B, 2, Int>, code: Tensor<B, 2>) -> Tensor<B, 3> {
        let [_, steps] = input_trg.dims();

        let embedded = self.embedding.forward(input_trg);
        let context = code.clone().unsqueeze_dim::<3>(1).repeat_dim(1, steps);

        let hidden = self.init_state.forward(code).tanh();
        let cell = hidden.zeros_like();

        let (output, _) = self.lstm.forward(
            Tensor::cat(vec![embedded, context], 2),
            Some(LstmState::new(cell, hidden)),
        );

        self.to_vocab.forward(output)
    }
}

#[derive(Module, Debug)]
pub struct NliClassifier<B: Backend> {
    hidden: Linear<B>,
    activation: Relu,
    output: Linear<B>,
}

impl<B: Backend> NliClassifier<B> {
    /// Classifies the pair from `[u, v, |u - v|, u * v]`.
    pub fn forward(&self, u: Tensor<B, 2>, v: Tensor<B, 2>) -> Tensor<B, 2> {
        let features = Tensor::cat(
            vec![
                u.clone(),
                v.clone(),
                u.clone().sub(v.clone()).abs(),
                u.mul(v),
            ],
            1,
        );

        let x = self.activation.forward(self.hidden.forward(features));
        self.output.forward(x)
    }
}

/// Shared sentence encoder trained through several decoders and an NLI head.
#[derive(Module, Debug)]
pub struct GenSen<B: Backend> {
    src_embedding: Embedding<B>,
    encoder: Encoder<B>,
    dropout: Dropout,
    decoders: Vec<Decoder<B>>,
    nli: NliClassifier<B>,
}

impl<B: Backend> GenSen<B> {
    pub fn num_tasks(&self) -> usize {
        self.decoders.len()
    }

    /// Sentence codes `[batch, dim_src]` for `<s> .. </s>` framed, pad-filled rows.
    pub fn encode(&self, tokens: Tensor<B, 2, Int>) -> Tensor<B, 2> {
        let lengths = sequence_lengths(&tokens);
        let code = self
            .encoder
            .forward(self.src_embedding.forward(tokens), lengths);

        self.dropout.forward(code)
    }
}

impl<B: Backend> MultitaskModel<B> for GenSen<B> {
    fn forward_seq2seq(&self, task: usize, batch: &Seq2SeqBatch<B>) -> Tensor<B, 3> {
        let code = self.encode(batch.input_src.clone());
        self.decoders[task].forward(batch.input_trg.clone(), code)
    }

    fn forward_paired(
        &self,
        forward: usize,
        backward: usize,
        batch: &Seq2SeqBatch<B>,
        partner: &Seq2SeqBatch<B>,
    ) -> (Tensor<B, 3>, Tensor<B, 3>) {
        let code = self.encode(batch.input_src.clone());

        (
            self.decoders[forward].forward(batch.input_trg.clone(), code.clone()),
            self.decoders[backward].forward(partner.input_trg.clone(), code),
        )
    }

    fn forward_nli(&self, batch: &NliBatch<B>) -> Tensor<B, 2> {
        let u = self.encode(batch.premise.clone());
        let v = self.encode(batch.hypothesis.clone());

        self.nli.forward(u, v)
    }
}

#[derive(Config, Debug)]
pub struct GenSenModelConfig {
    pub n_words_src: usize,
    pub n_words_trg: usize,
    pub dim_word_src: usize,
    pub dim_word_trg: usize,
    pub dim_src: usize,
    pub dim_trg: usize,
    pub bidirectional: bool,
    pub n_layers_src: usize,
    pub dropout: f64,
    #[config(default = 512)]
    pub nli_hidden: usize,
}

impl GenSenModelConfig {
    fn init_encoder<B: Backend>(&self, device: &B::Device) -> Encoder<B> {
        let directions = if self.bidirectional { 2 } else { 1 };
        let hidden = self.dim_src / directions;

        let stack = || {
            (0..self.n_layers_src)
                .map(|layer| {
                    let d_input = if layer == 0 {
                        self.dim_word_src
                    } else {
                        hidden * directions
                    };
                    LstmConfig::new(d_input, hidden, true).init(device)
                })
                .collect::<Vec<_>>()
        };

        Encoder {
            forward: stack(),
            backward: if self.bidirectional {
                stack()
            } else {
                Vec::new()
            },
        }
    }

    fn init_decoder<B: Backend>(&self, trg_vocab: usize, device: &B::Device) -> Decoder<B> {
        Decoder {
            embedding: EmbeddingConfig::new(trg_vocab, self.dim_word_trg).init(device),
            init_state: LinearConfig::new(self.dim_src, self.dim_trg).init(device),
            lstm: LstmConfig::new(self.dim_word_trg + self.dim_src, self.dim_trg, true).init(device),
            to_vocab: LinearConfig::new(self.dim_trg, trg_vocab).init(device),
        }
    }

    /// Builds the model for vocabularies of `src_vocab` and `trg_vocab`
    /// entries and `num_tasks` decoders.
    pub fn init<B: Backend>(
        &self,
        src_vocab: usize,
        trg_vocab: usize,
        num_tasks: usize,
        device: &B::Device,
    ) -> GenSen<B> {
        let decoders = (0..num_tasks)
            .map(|_| self.init_decoder(trg_vocab, device))
            .collect();

        GenSen {
            src_embedding: EmbeddingConfig::new(src_vocab, self.dim_word_src).init(device),
            encoder: self.init_encoder(device),
            dropout: DropoutConfig::new(self.dropout).init(),
            decoders,
            nli: NliClassifier {
                hidden: LinearConfig::new(4 * self.dim_src, self.nli_hidden).init(device),
                activation: Relu::new(),
                output: LinearConfig::new(self.nli_hidden, NUM_CLASSES).init(device),
            },
        }
    }
}
