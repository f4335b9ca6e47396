use std::{
    fs::create_dir_all,
    path::{Path, PathBuf},
    sync::Arc,
    thread,
    time::Instant,
};

use anyhow::{Context, Result, anyhow};
use burn::{
    module::AutodiffModule,
    nn::loss::CrossEntropyLoss,
    optim::{AdamConfig, GradientsParams, Optimizer, SgdConfig},
    prelude::*,
    tensor::{ElementConversion, backend::AutodiffBackend},
};
use log::{debug, info, warn};
use rand::{SeedableRng, rngs::StdRng};

use crate::{
    checkpoint::save_model,
    config::{GenSenConfig, OptimizerKind, RunPaths},
    data::{BufferedDataSource, NliDataSource, NliSplit, Shard, Vocabulary},
    distributed::{
        CollectiveError, Communicator, GradientSynchronizer, LocalGroup, SingleProcess,
    },
    loss::{SequenceCriterion, nli_criterion},
    model::{GenSen, MultitaskModel},
    task::{Step, TaskScheduler, TaskSet},
    telemetry::{Fanout, JsonLinesTelemetry, LogTelemetry, NullTelemetry, Telemetry},
    validation::{
        CheckpointSelector, LossSum, Verdict, accuracy_from_counts, nli_counts,
        sequence_validation_loss,
    },
};

/// Loop parameters taken from the configuration.
#[derive(Clone, Debug)]
pub struct TrainerSettings {
    /// Examples per worker per step.
    pub batch_size: usize,
    pub max_src_length: usize,
    pub max_trg_length: usize,
    pub stop_patience: usize,
    pub monitor_loss: usize,
    pub learning_rate: f64,
    pub save_dir: PathBuf,
    pub save_on_improvement: bool,
}

impl TrainerSettings {
    pub fn from_config(config: &GenSenConfig, save_dir: &Path, learning_rate: f64) -> Self {
        Self {
            batch_size: config.training.batch_size,
            max_src_length: config.data.max_src_length,
            max_trg_length: config.data.max_trg_length,
            stop_patience: config.training.stop_patience,
            monitor_loss: config.management.monitor_loss,
            learning_rate,
            save_dir: save_dir.to_path_buf(),
            save_on_improvement: config.management.save_on_improvement,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StepCounters {
    /// Examples processed by the whole group.
    pub updates: usize,
    pub nli_ctr: usize,
    pub monitor_epoch: usize,
    /// Offset of the next NLI training minibatch in this worker's shard.
    pub nli_mbatch_ctr: usize,
    pub nli_epoch: usize,
}

/// `true` when going from `before` to `after` passes a multiple of `interval`.
pub fn crosses_boundary(before: usize, after: usize, interval: usize) -> bool {
    after / interval > before / interval
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        f64::NAN
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Losses and step latencies since the last monitoring point.
#[derive(Clone, Debug, Default)]
struct RunningLosses {
    tasks: Vec<Vec<f64>>,
    nli: Vec<f64>,
    step_times: Vec<f64>,
}

impl RunningLosses {
    fn new(num_tasks: usize) -> Self {
        Self {
            tasks: vec![Vec::new(); num_tasks],
            ..Default::default()
        }
    }

    fn reset(&mut self) {
        self.tasks.iter_mut().for_each(Vec::clear);
        self.nli.clear();
        self.step_times.clear();
    }
}

pub struct TrainingOutcome<M> {
    /// Parameters with the lowest validation loss (the final ones when no
    /// finite loss was ever measured).
    pub best_model: M,
    pub final_model: M,
    pub min_val_loss: f64,
    pub min_val_loss_epoch: i64,
    pub counters: StepCounters,
    /// Where rank 0 wrote the best model; `None` on other ranks.
    pub checkpoint: Option<PathBuf>,
}

fn scalar<B: Backend>(loss: &Tensor<B, 1>) -> f64 {
    loss.clone().into_scalar().elem::<f64>()
}

/// One worker's training loop: picks a task per step, trains on it, keeps
/// replicas in sync and validates at every monitoring boundary.
pub struct Trainer<'a, B: AutodiffBackend> {
    settings: TrainerSettings,
    sync: GradientSynchronizer<'a>,
    scheduler: TaskScheduler<StdRng>,
    data: BufferedDataSource,
    nli: NliDataSource,
    criterion: SequenceCriterion<B>,
    valid_criterion: SequenceCriterion<B::InnerBackend>,
    nli_criterion: CrossEntropyLoss<B>,
    telemetry: Box<dyn Telemetry>,
    device: B::Device,
    counters: StepCounters,
    losses: RunningLosses,
}

impl<'a, B: AutodiffBackend> Trainer<'a, B> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: TrainerSettings,
        sync: GradientSynchronizer<'a>,
        scheduler: TaskScheduler<StdRng>,
        data: BufferedDataSource,
        nli: NliDataSource,
        telemetry: Box<dyn Telemetry>,
        trg_vocab_size: usize,
        device: B::Device,
    ) -> Self {
        let num_tasks = scheduler.tasks().len();

        Self {
            criterion: SequenceCriterion::new(trg_vocab_size, &device),
            valid_criterion: SequenceCriterion::new(trg_vocab_size, &device),
            nli_criterion: nli_criterion(&device),
            losses: RunningLosses::new(num_tasks),
            counters: StepCounters::default(),
            settings,
            sync,
            scheduler,
            data,
            nli,
            telemetry,
            device,
        }
    }

    fn global_batch(&self) -> usize {
        self.settings.batch_size * self.sync.world_size()
    }

    /// Trains until validation stops improving for longer than the patience.
    pub fn fit<M, O>(mut self, model: M, mut optimizer: O) -> Result<TrainingOutcome<M>>
    where
        M: AutodiffModule<B> + MultitaskModel<B>,
        M::InnerModule: MultitaskModel<B::InnerBackend>,
        O: Optimizer<M, B>,
    {
        let mut selector = CheckpointSelector::new(self.settings.stop_patience);
        let mut model = model;

        info!("Commencing training ...");

        loop {
            let start = Instant::now();

            model = match self.scheduler.next_step(self.counters.nli_ctr) {
                Step::Nli => self.nli_step(model, &mut optimizer)?,
                Step::Task(task) => self.task_step(task, model, &mut optimizer)?,
                Step::PairedTask { forward, backward } => {
                    self.paired_step(forward, backward, model, &mut optimizer)?
                }
            };

            self.losses
                .step_times
                .push(start.elapsed().as_secs_f64());

            let before = self.counters.updates;
            self.counters.updates += self.global_batch();
            self.counters.nli_ctr += 1;
            debug!("Updates: {}", self.counters.updates);

            if !crosses_boundary(before, self.counters.updates, self.settings.monitor_loss) {
                continue;
            }

            self.counters.monitor_epoch += 1;
            self.report_running_losses();

            if self.validate(&model, &mut selector)? == Verdict::Stop {
                return self.stop(model, selector);
            }

            self.evaluate_nli(&model)?;
        }
    }

    fn optimize<M, O>(&self, model: M, optimizer: &mut O, loss: Tensor<B, 1>) -> Result<M>
    where
        M: AutodiffModule<B>,
        O: Optimizer<M, B>,
    {
        let grads = GradientsParams::from_grads(loss.backward(), &model);
        let synced = self.sync.synchronize(&model, grads)?;

        if synced.skipped {
            return Ok(model);
        }

        Ok(optimizer.step(self.settings.learning_rate, model, synced.grads))
    }

    fn nli_step<M, O>(&mut self, model: M, optimizer: &mut O) -> Result<M>
    where
        M: AutodiffModule<B> + MultitaskModel<B>,
        O: Optimizer<M, B>,
    {
        let batch = self.nli.get_parallel_minibatch::<B>(
            self.counters.nli_mbatch_ctr,
            self.settings.batch_size,
            NliSplit::Train,
            &self.device,
        );

        let logits = model.forward_nli(&batch);
        let loss = self.nli_criterion.forward(logits, batch.labels);

        let value = scalar(&loss);
        self.losses.nli.push(value);
        self.telemetry.report("nli_loss", value);

        let model = self.optimize(model, optimizer, loss)?;

        self.counters.nli_mbatch_ctr += self.settings.batch_size;
        if self.counters.nli_mbatch_ctr >= self.nli.len(NliSplit::Train) {
            self.counters.nli_mbatch_ctr = 0;
            self.counters.nli_epoch += 1;
        }

        Ok(model)
    }

    fn task_step<M, O>(&mut self, task: usize, model: M, optimizer: &mut O) -> Result<M>
    where
        M: AutodiffModule<B> + MultitaskModel<B>,
        O: Optimizer<M, B>,
    {
        let batch = self.data.next_minibatch::<B>(
            task,
            self.settings.batch_size,
            self.settings.max_src_length,
            self.settings.max_trg_length,
            &self.device,
        )?;

        let logits = model.forward_seq2seq(task, &batch);
        let loss = self.criterion.forward(logits, batch.output_trg);
        self.losses.tasks[task].push(scalar(&loss));

        self.optimize(model, optimizer, loss)
    }

    /// Both halves of a skip-thought pair advance together and share one
    /// backward pass and one optimizer step.
    fn paired_step<M, O>(
        &mut self,
        forward: usize,
        backward: usize,
        model: M,
        optimizer: &mut O,
    ) -> Result<M>
    where
        M: AutodiffModule<B> + MultitaskModel<B>,
        O: Optimizer<M, B>,
    {
        let (batch_size, max_src, max_trg) = (
            self.settings.batch_size,
            self.settings.max_src_length,
            self.settings.max_trg_length,
        );

        let batch =
            self.data
                .next_minibatch::<B>(forward, batch_size, max_src, max_trg, &self.device)?;
        let partner =
            self.data
                .next_minibatch::<B>(backward, batch_size, max_src, max_trg, &self.device)?;

        let (logits_f, logits_b) = model.forward_paired(forward, backward, &batch, &partner);
        let loss_f = self.criterion.forward(logits_f, batch.output_trg);
        let loss_b = self.criterion.forward(logits_b, partner.output_trg);

        self.losses.tasks[forward].push(scalar(&loss_f));
        self.losses.tasks[backward].push(scalar(&loss_b));

        self.optimize(model, optimizer, loss_f + loss_b)
    }

    fn report_running_losses(&mut self) {
        let tasks = self.scheduler.tasks().clone();

        for (idx, name) in tasks.names().iter().enumerate() {
            let losses = &self.losses.tasks[idx];
            let loss = mean(losses);

            info!(
                "Seq2Seq Examples Processed : {} {name} Loss : {loss:.5} Num {name} minibatches : {}",
                self.counters.updates,
                losses.len()
            );
            self.telemetry.report(&format!("{name}_loss"), loss);
        }

        let nli_loss = mean(&self.losses.nli);
        info!(
            "Round: {} NLI Epoch : {} NLI Examples Processed : {} NLI Loss : {nli_loss:.5}",
            self.counters.nli_ctr, self.counters.nli_epoch, self.counters.nli_mbatch_ctr
        );
        self.telemetry
            .report("nli_epoch", self.counters.nli_epoch as f64);

        let step_time = mean(&self.losses.step_times);
        info!("Average time per minibatch : {step_time:.5}");
        self.telemetry.report("step_time", step_time);

        self.losses.reset();
    }

    /// Validation loss of every non skip-thought task, reduced over the group
    /// so that every worker takes the same decision.
    fn validate<M>(&mut self, model: &M, selector: &mut CheckpointSelector<M>) -> Result<Verdict>
    where
        M: AutodiffModule<B> + MultitaskModel<B>,
        M::InnerModule: MultitaskModel<B::InnerBackend>,
    {
        info!("##### Evaluating model #####");

        let valid = model.valid();
        let tasks = self.scheduler.tasks().clone();

        for task in tasks.validation_tasks() {
            let local = sequence_validation_loss(
                &valid,
                &self.data,
                &self.valid_criterion,
                task,
                self.settings.batch_size,
                self.settings.max_src_length,
                self.settings.max_trg_length,
                &self.device,
            )?;

            let reduced = self
                .sync
                .all_reduce_sum(&[local.sum as f32, local.batches as f32])?;
            let loss = LossSum {
                sum: reduced[0] as f64,
                batches: reduced[1] as f64,
            }
            .mean();

            let name = tasks.name(task);
            info!("{name} Validation Loss : {loss:.3}");
            self.telemetry.report(&format!("{name}_val_loss"), loss);

            let observation = selector.observe(self.counters.monitor_epoch, loss, || model.clone());
            self.telemetry
                .report("best_val_loss", selector.min_val_loss());
            debug!(
                "monitor epoch {} best epoch {} best loss {}",
                self.counters.monitor_epoch,
                selector.min_val_loss_epoch(),
                selector.min_val_loss()
            );

            if observation.improved && self.settings.save_on_improvement && self.sync.is_root() {
                save_model(model.clone(), &self.settings.save_dir)?;
            }

            if observation.verdict == Verdict::Stop {
                return Ok(Verdict::Stop);
            }
        }

        Ok(Verdict::Continue)
    }

    /// Reporting only; never affects stopping.
    fn evaluate_nli<M>(&mut self, model: &M) -> Result<()>
    where
        M: AutodiffModule<B>,
        M::InnerModule: MultitaskModel<B::InnerBackend>,
    {
        info!("Evaluating on NLI");
        let valid = model.valid();

        for split in [NliSplit::Dev, NliSplit::Test] {
            let (correct, total) = nli_counts(
                &valid,
                &self.nli,
                split,
                self.settings.batch_size,
                &self.device,
            );
            let reduced = self
                .sync
                .all_reduce_sum(&[correct as f32, total as f32])?;
            let accuracy = accuracy_from_counts(reduced[0] as f64, reduced[1] as f64);

            info!("NLI {} Acc : {accuracy:.5}", split.name());
            self.telemetry
                .report(&format!("nli_{}_accuracy", split.name()), accuracy);
        }

        Ok(())
    }

    fn stop<M: AutodiffModule<B>>(
        self,
        model: M,
        mut selector: CheckpointSelector<M>,
    ) -> Result<TrainingOutcome<M>> {
        info!(
            "##### Training stopped at ##### {:.6}",
            selector.min_val_loss()
        );

        let best_model = match selector.take_best() {
            Some(best) => best,
            None => {
                warn!("No finite validation loss was measured, keeping the current parameters");
                model.clone()
            }
        };

        let checkpoint = if self.sync.is_root() {
            info!("Saving model ...");
            Some(save_model(best_model.clone(), &self.settings.save_dir)?)
        } else {
            None
        };

        Ok(TrainingOutcome {
            best_model,
            final_model: model,
            min_val_loss: selector.min_val_loss(),
            min_val_loss_epoch: selector.min_val_loss_epoch(),
            counters: self.counters,
            checkpoint,
        })
    }
}

/// State shared read-only by every worker of a run.
pub struct RunContext {
    pub config: GenSenConfig,
    pub paths: RunPaths,
    pub src_vocab: Arc<Vocabulary>,
    pub trg_vocab: Arc<Vocabulary>,
    pub learning_rate: f64,
}

/// Creates the save directory, records the effective configuration and loads
/// (or builds) both vocabularies.
pub fn prepare(
    config: GenSenConfig,
    data_folder: &Path,
    learning_rate: Option<f64>,
) -> Result<RunContext> {
    let paths = config.resolve_paths(data_folder);

    create_dir_all(&paths.save_dir)
        .with_context(|| format!("Could not create {}", paths.save_dir.display()))?;
    config
        .save(paths.config_copy())
        .with_context(|| format!("Could not save {}", paths.config_copy().display()))?;

    let train_src: Vec<&Path> = paths.corpora.iter().map(|c| c.train_src.as_path()).collect();
    let train_trg: Vec<&Path> = paths.corpora.iter().map(|c| c.train_trg.as_path()).collect();

    let src_vocab = Vocabulary::load_or_build(
        &paths.src_vocab(),
        &train_src,
        config.model.n_words_src,
        config.data.lowercase,
    )?;
    let trg_vocab = Vocabulary::load_or_build(
        &paths.trg_vocab(),
        &train_trg,
        config.model.n_words_trg,
        config.data.lowercase,
    )?;

    for corpus in &paths.corpora {
        info!(
            "Task {}: {} source words, {} target words",
            corpus.taskname,
            src_vocab.len(),
            trg_vocab.len()
        );
    }

    let learning_rate = config.learning_rate(learning_rate, config.training.n_gpus);

    info!("Model parameters: {}", config.model);
    info!(
        "Batch size {} per worker, {} workers",
        config.training.batch_size, config.training.n_gpus
    );
    info!("Optimizer: {}", config.training.optimizer);
    info!("Learning rate: {learning_rate}");

    Ok(RunContext {
        config,
        paths,
        src_vocab: Arc::new(src_vocab),
        trg_vocab: Arc::new(trg_vocab),
        learning_rate,
    })
}

fn worker_rng(seed: Option<u64>, stream: u64) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(stream)),
        None => StdRng::from_entropy(),
    }
}

/// Builds one worker's data, model and trainer and runs it to completion.
pub fn run_worker<B: AutodiffBackend>(
    ctx: &RunContext,
    comm: &dyn Communicator,
    device: B::Device,
) -> Result<TrainingOutcome<GenSen<B>>> {
    let config = &ctx.config;
    let rank = comm.rank();
    let shard = Shard::new(rank, comm.world_size());
    let seed = config.training.seed;

    if let Some(seed) = seed {
        B::seed(seed);
    }

    let data = BufferedDataSource::new(
        &ctx.paths.corpora,
        ctx.src_vocab.clone(),
        ctx.trg_vocab.clone(),
        config.data.buffer_size,
        shard,
    )?;
    let nli = NliDataSource::from_files(
        &ctx.paths.nli_train,
        &ctx.paths.nli_dev,
        &ctx.paths.nli_test,
        &ctx.src_vocab,
        config.data.max_src_length,
        shard,
        &mut worker_rng(seed, 1 + rank as u64),
    )?;

    let tasks = TaskSet::from_names(&config.task_names());
    let num_tasks = tasks.len();
    if rank == 0 && tasks.is_paired() {
        for &index in tasks.candidates() {
            if let Some(partner) = tasks.get(index).and_then(|task| task.partner()) {
                info!(
                    "Task {} shares each step with {}",
                    tasks.name(index),
                    tasks.name(partner)
                );
            }
        }
    }
    let scheduler = TaskScheduler::new(tasks, worker_rng(seed, 0));

    let sync = GradientSynchronizer::new(comm, config.training.fp16_compression);
    let model = config.model.init::<B>(
        ctx.src_vocab.len(),
        ctx.trg_vocab.len(),
        num_tasks,
        &device,
    );
    let model = sync.broadcast_parameters(model)?;

    let telemetry: Box<dyn Telemetry> = if rank == 0 {
        let metrics = JsonLinesTelemetry::create(&ctx.paths.metrics())
            .with_context(|| format!("Could not open {}", ctx.paths.metrics().display()))?;
        Box::new(Fanout::default().with(LogTelemetry).with(metrics))
    } else {
        Box::new(NullTelemetry)
    };

    let settings = TrainerSettings::from_config(config, &ctx.paths.save_dir, ctx.learning_rate);
    let trainer = Trainer::<B>::new(
        settings,
        sync,
        scheduler,
        data,
        nli,
        telemetry,
        ctx.trg_vocab.len(),
        device,
    );

    match config.optimizer_kind()? {
        OptimizerKind::Adam => trainer.fit(model, AdamConfig::new().init::<B, GenSen<B>>()),
        OptimizerKind::Sgd => trainer.fit(model, SgdConfig::new().init::<B, GenSen<B>>()),
    }
}

/// Aborts the group when a worker leaves with an error or a panic, so peers
/// blocked in a collective fail instead of waiting forever.
struct AbortGuard<'a> {
    comm: &'a dyn Communicator,
    armed: bool,
}

impl Drop for AbortGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.comm.abort();
        }
    }
}

fn is_abort(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<CollectiveError>(),
        Some(CollectiveError::Aborted)
    )
}

/// Runs one worker thread per device and returns rank 0's outcome. When a
/// worker fails, the whole run fails with its error.
pub fn launch<B: AutodiffBackend>(
    ctx: &RunContext,
    devices: Vec<B::Device>,
) -> Result<TrainingOutcome<GenSen<B>>> {
    match devices.len() {
        0 => return Err(anyhow!("No device to train on")),
        1 => {
            let device = devices.into_iter().next().ok_or_else(|| anyhow!("No device"))?;
            return run_worker::<B>(ctx, &SingleProcess, device);
        }
        _ => {}
    }

    let group = LocalGroup::new(devices.len());

    let results: Vec<Result<TrainingOutcome<GenSen<B>>>> = thread::scope(|s| {
        let handles: Vec<_> = group
            .iter()
            .zip(devices)
            .map(|(comm, device)| {
                s.spawn(move || {
                    let mut guard = AbortGuard { comm, armed: true };
                    let result = run_worker::<B>(ctx, comm, device);
                    guard.armed = result.is_err();
                    result
                })
            })
            .collect();

        handles
            .into_iter()
            .enumerate()
            .map(|(rank, handle)| {
                handle
                    .join()
                    .unwrap_or_else(|_| Err(anyhow!("Worker {rank} panicked")))
            })
            .collect()
    });

    let mut outcome = None;
    let mut failure: Option<anyhow::Error> = None;

    for result in results {
        match result {
            Ok(done) => {
                outcome.get_or_insert(done);
            }
            Err(err) => {
                if failure.as_ref().is_none_or(is_abort) {
                    failure = Some(err);
                }
            }
        }
    }

    match failure {
        Some(err) => Err(err),
        None => outcome.ok_or_else(|| anyhow!("No worker finished")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        checkpoint::load_model,
        data::CorpusPaths,
        distributed::sync::flatten_parameters,
        model::GenSenModelConfig,
        task::{SKIPTHOUGHT_NEXT, SKIPTHOUGHT_PREVIOUS},
    };
    use burn::backend::{Autodiff, NdArray, ndarray::NdArrayDevice};
    use std::{fs, io::Write};

    type TestBackend = Autodiff<NdArray<f32>>;

    #[test]
    fn boundary_crossing() {
        assert!(!crosses_boundary(0, 4, 8));
        assert!(crosses_boundary(4, 8, 8));
        assert!(crosses_boundary(6, 10, 8));
        assert!(!crosses_boundary(8, 12, 8));
        assert!(crosses_boundary(0, 24, 8));
    }

    #[test]
    fn mean_of_nothing_is_nan() {
        assert!(mean(&[]).is_nan());
        assert_eq!(mean(&[1.0, 2.0]), 1.5);
    }

    fn write_lines(path: &Path, lines: &[String]) {
        let mut file = fs::File::create(path).unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
    }

    fn fixture_model(vocab: &Vocabulary, device: &NdArrayDevice) -> GenSen<TestBackend> {
        GenSenModelConfig::new(20, 20, 4, 4, 6, 6, true, 1, 0.0)
            .with_nli_hidden(4)
            .init::<TestBackend>(vocab.len(), vocab.len(), 2, device)
    }

    /// Single-worker trainer over a skip-thought pair whose buffers hold five
    /// examples.
    fn skipthought_trainer(dir: &Path) -> (Trainer<'static, TestBackend>, Arc<Vocabulary>) {
        let sentences: Vec<String> = (0..12).map(|i| format!("w{} w{}", i % 5, i % 3)).collect();
        let mut corpora = Vec::new();
        for name in [SKIPTHOUGHT_NEXT, SKIPTHOUGHT_PREVIOUS] {
            for suffix in ["src", "trg", "val.src", "val.trg"] {
                write_lines(&dir.join(format!("{name}.{suffix}")), &sentences);
            }
            corpora.push(CorpusPaths {
                taskname: name.to_string(),
                train_src: dir.join(format!("{name}.src")),
                train_trg: dir.join(format!("{name}.trg")),
                val_src: dir.join(format!("{name}.val.src")),
                val_trg: dir.join(format!("{name}.val.trg")),
            });
        }
        let nli_lines = vec!["w1 w2\tw3\tneutral".to_string(); 4];
        for split in ["train", "dev", "test"] {
            write_lines(&dir.join(format!("nli.{split}")), &nli_lines);
        }

        let vocab = Arc::new(
            Vocabulary::build(&dir.join("vocab.json"), &[dir.join("skipthought_next.src")], 20, true)
                .unwrap(),
        );
        let data =
            BufferedDataSource::new(&corpora, vocab.clone(), vocab.clone(), 5, Shard::single())
                .unwrap();
        let nli = NliDataSource::from_files(
            &dir.join("nli.train"),
            &dir.join("nli.dev"),
            &dir.join("nli.test"),
            &vocab,
            8,
            Shard::single(),
            &mut StdRng::seed_from_u64(0),
        )
        .unwrap();

        let tasks = TaskSet::from_names(&[SKIPTHOUGHT_NEXT, SKIPTHOUGHT_PREVIOUS]);
        let settings = TrainerSettings {
            batch_size: 2,
            max_src_length: 8,
            max_trg_length: 8,
            stop_patience: 1,
            monitor_loss: 100,
            learning_rate: 1e-3,
            save_dir: dir.join("models"),
            save_on_improvement: false,
        };
        let trainer = Trainer::<TestBackend>::new(
            settings,
            GradientSynchronizer::new(&SingleProcess, false),
            TaskScheduler::new(tasks, StdRng::seed_from_u64(1)),
            data,
            nli,
            Box::new(NullTelemetry),
            vocab.len(),
            NdArrayDevice::Cpu,
        );

        (trainer, vocab)
    }

    #[test]
    fn paired_halves_advance_together() {
        let dir = tempfile::tempdir().unwrap();
        let (mut trainer, vocab) = skipthought_trainer(dir.path());

        let mut model = fixture_model(&vocab, &NdArrayDevice::Cpu);
        let mut optimizer = AdamConfig::new().init::<TestBackend, GenSen<TestBackend>>();

        for _ in 0..5 {
            model = trainer.paired_step(0, 1, model, &mut optimizer).unwrap();

            let forward = trainer.data.cursor(0).unwrap();
            let backward = trainer.data.cursor(1).unwrap();
            assert_eq!(forward, backward);
            assert!(forward + 2 <= 5);
        }

        assert_eq!(trainer.losses.tasks[0].len(), 5);
        assert_eq!(trainer.losses.tasks[1].len(), 5);
    }

    #[test]
    fn stop_persists_lowest_loss_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let (trainer, vocab) = skipthought_trainer(dir.path());
        let device = NdArrayDevice::Cpu;

        let early = fixture_model(&vocab, &device);
        let best = fixture_model(&vocab, &device);
        let current = fixture_model(&vocab, &device);

        let mut selector = CheckpointSelector::new(1);
        assert!(selector.observe(1, 3.0, || early.clone()).improved);
        assert!(selector.observe(2, 2.0, || best.clone()).improved);
        assert_eq!(
            selector.observe(3, 2.5, || unreachable!()).verdict,
            Verdict::Continue
        );
        assert_eq!(
            selector.observe(4, 2.5, || unreachable!()).verdict,
            Verdict::Stop
        );

        let outcome = trainer.stop(current.clone(), selector).unwrap();
        assert_eq!(outcome.min_val_loss, 2.0);
        assert_eq!(outcome.min_val_loss_epoch, 2);

        let restored = load_model(
            fixture_model(&vocab, &device),
            &outcome.checkpoint.unwrap(),
            &device,
        )
        .unwrap();
        assert_eq!(flatten_parameters(&restored), flatten_parameters(&best));
        assert_ne!(flatten_parameters(&restored), flatten_parameters(&current));
        assert_eq!(
            flatten_parameters(&outcome.final_model),
            flatten_parameters(&current)
        );
    }
}
