use crate::config::ExperimentConfig;
use crate::data::batch::PairedBatch;
use crate::data::pairing::TargetExample;
use crate::data::{load_experiment_data, AdaptationData};
use crate::error::{Error, Result};
use crate::metrics::{AdaptationMetric, StepMetrics};
use crate::model::{CoralLoss, MergedNetwork, ModelConfig};
use burn::config::Config;
use burn::data::dataloader::DataLoader;
use burn::module::{AutodiffModule, Ignored};
use burn::nn::loss::CrossEntropyLossConfig;
use burn::optim::adaptor::OptimizerAdaptor;
use burn::optim::lr_scheduler::LrScheduler;
use burn::optim::{Adam, AdamConfig};
use burn::prelude::*;
use burn::record::{CompactRecorder, HalfPrecisionSettings, NamedMpkFileRecorder, Record};
use burn::tensor::backend::AutodiffBackend;
use burn::train::checkpoint::{CheckpointingAction, CheckpointingStrategy};
use burn::train::metric::store::EventStoreClient;
use burn::train::{
    EventProcessorTraining,
    InferenceStep, Interrupter, Learner, LearnerEvent, LearnerItem, LearningComponentsMarker,
    SupervisedLearningStrategy, SupervisedTraining, SupervisedTrainingEventProcessor,
    TrainLoader, TrainOutput, TrainStep, TrainingComponents, TrainingStrategy, ValidLoader,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Merged network plus the weighted alignment term used as its objective.
#[derive(Module, Debug)]
pub struct DomainAdaptationModel<B: Backend> {
    network: MergedNetwork<B>,
    alignment: Ignored<CoralLoss>,
}

/// Loss terms for one paired batch.
#[derive(Debug)]
pub struct AdaptationLosses<B: Backend> {
    pub class_loss: Tensor<B, 1>,
    pub coral_loss: Tensor<B, 1>,
    pub total_loss: Tensor<B, 1>,
    pub logits: Tensor<B, 2>,
    pub labels: Tensor<B, 1, Int>,
}

impl<B: Backend> DomainAdaptationModel<B> {
    pub fn new(config: &ModelConfig, lambda: f64, device: &B::Device) -> Self {
        Self::from_network(config.init(device), lambda)
    }

    pub fn from_network(network: MergedNetwork<B>, lambda: f64) -> Self {
        Self {
            network,
            alignment: Ignored(CoralLoss::new(lambda)),
        }
    }

    pub fn network(&self) -> &MergedNetwork<B> {
        &self.network
    }

    pub fn lambda(&self) -> f64 {
        self.alignment.weight
    }

    /// Cross-entropy against the source labels plus `lambda * CORAL`.
    pub fn losses(&self, batch: PairedBatch<B>) -> AdaptationLosses<B> {
        let device = batch.labels.device();
        let output = self.network.forward(batch.source, batch.target);

        let class_loss = CrossEntropyLossConfig::new()
            .init(&device)
            .forward(output.logits.clone(), batch.labels.clone());
        let (coral_loss, weighted) = self
            .alignment
            .forward(output.source_map, output.target_map);
        let total_loss = class_loss.clone().add(weighted);

        AdaptationLosses {
            class_loss,
            coral_loss,
            total_loss,
            logits: output.logits,
            labels: batch.labels,
        }
    }
}

impl<B: AutodiffBackend> DomainAdaptationModel<B> {
    /// Width check on the inference copy, leaving batch-norm statistics untouched.
    pub fn check_feature_widths(
        &self,
        config: &ModelConfig,
        image_size: usize,
        device: &B::Device,
    ) -> Result<()> {
        self.valid()
            .network
            .check_feature_widths(config, image_size, device)
    }
}

impl<B: Backend> AdaptationLosses<B> {
    pub fn metrics(&self) -> StepMetrics {
        let batch_size = self.labels.dims()[0];
        let correct = self
            .logits
            .clone()
            .argmax(1)
            .squeeze_dim::<1>(1)
            .equal(self.labels.clone())
            .int()
            .sum()
            .into_scalar()
            .elem::<i64>();

        StepMetrics {
            batch_size,
            correct: correct.max(0) as usize,
            class_loss: self.class_loss.clone().into_scalar().elem::<f64>(),
            coral_loss: self.coral_loss.clone().into_scalar().elem::<f64>(),
            total_loss: self.total_loss.clone().into_scalar().elem::<f64>(),
        }
    }
}

impl<B: AutodiffBackend> TrainStep for DomainAdaptationModel<B> {
    type Input = PairedBatch<B>;
    type Output = StepMetrics;

    fn step(&self, item: Self::Input) -> TrainOutput<Self::Output> {
        let losses = self.losses(item);
        let metrics = losses.metrics();
        let grads = losses.total_loss.backward();
        TrainOutput::new(self, grads, metrics)
    }
}

impl<B: Backend> InferenceStep for DomainAdaptationModel<B> {
    type Input = PairedBatch<B>;
    type Output = StepMetrics;

    fn step(&self, item: Self::Input) -> Self::Output {
        self.losses(item).metrics()
    }
}

/// Batch-size weighted running means.
#[derive(Clone, Debug, Default)]
struct MetricsAccumulator {
    samples: usize,
    correct: usize,
    class_loss: f64,
    coral_loss: f64,
    total_loss: f64,
}

impl MetricsAccumulator {
    fn add(&mut self, metrics: &StepMetrics) {
        let weight = metrics.batch_size as f64;
        self.samples += metrics.batch_size;
        self.correct += metrics.correct;
        self.class_loss += metrics.class_loss * weight;
        self.coral_loss += metrics.coral_loss * weight;
        self.total_loss += metrics.total_loss * weight;
    }

    fn mean(&self, sum: f64) -> f64 {
        if self.samples == 0 {
            0.0
        } else {
            sum / self.samples as f64
        }
    }

    fn accuracy(&self) -> f64 {
        if self.samples == 0 {
            0.0
        } else {
            self.correct as f64 / self.samples as f64
        }
    }

    fn evaluation(&self) -> EvaluationSummary {
        EvaluationSummary {
            loss: self.mean(self.class_loss),
            accuracy: self.accuracy(),
            samples: self.samples,
        }
    }
}

/// Classification loss and accuracy over a labelled stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluationSummary {
    pub loss: f64,
    pub accuracy: f64,
    pub samples: usize,
}

/// What one epoch produced.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EpochReport {
    pub epoch: usize,
    pub steps: usize,
    pub class_loss: f64,
    pub coral_loss: f64,
    pub total_loss: f64,
    pub train_accuracy: f64,
    pub target: EvaluationSummary,
    pub custom_eval: Option<EvaluationSummary>,
    pub learning_rate: f64,
}

/// Evaluate on target-only batches, each sample filling both branch slots.
pub fn evaluate_target<B: Backend>(
    model: &DomainAdaptationModel<B>,
    loader: &Arc<dyn DataLoader<B, PairedBatch<B>>>,
) -> EvaluationSummary {
    let mut accumulator = MetricsAccumulator::default();
    for batch in loader.iter() {
        if batch.is_empty() {
            continue;
        }
        accumulator.add(&InferenceStep::step(model, batch));
    }
    accumulator.evaluation()
}

/// Post-epoch evaluation over a frozen snapshot of the model.
pub trait EpochHook<B: Backend>: Send {
    fn name(&self) -> &str;

    fn after_epoch(
        &mut self,
        epoch: usize,
        model: &DomainAdaptationModel<B>,
    ) -> Result<EvaluationSummary>;
}

/// Duplicated-slot forward pass over a held-out slice of the target domain.
pub struct CustomEvaluation<B: Backend> {
    data: AdaptationData,
    examples: Vec<TargetExample>,
    device: B::Device,
}

impl<B: Backend> CustomEvaluation<B> {
    pub fn new(data: AdaptationData, examples: Vec<TargetExample>, device: B::Device) -> Self {
        Self {
            data,
            examples,
            device,
        }
    }

    /// `(loss, accuracy)` of `model` on the held-out slice.
    pub fn evaluate(&self, model: &DomainAdaptationModel<B>) -> EvaluationSummary {
        let mut accumulator = MetricsAccumulator::default();
        for chunk in self.examples.chunks(self.data.config().batch_size) {
            let batch = self.data.target_batch::<B>(chunk.to_vec(), &self.device);
            if batch.is_empty() {
                continue;
            }
            accumulator.add(&InferenceStep::step(model, batch));
        }
        accumulator.evaluation()
    }
}

impl<B: Backend> EpochHook<B> for CustomEvaluation<B> {
    fn name(&self) -> &str {
        "custom_eval"
    }

    fn after_epoch(
        &mut self,
        _epoch: usize,
        model: &DomainAdaptationModel<B>,
    ) -> Result<EvaluationSummary> {
        Ok(self.evaluate(model))
    }
}

/// Slot through which the epoch loop hands the monitored loss to the scheduler.
#[derive(Clone, Debug, Default)]
pub struct PlateauMonitor {
    latest: Arc<Mutex<Option<f64>>>,
}

impl PlateauMonitor {
    pub fn report(&self, loss: f64) {
        if let Ok(mut latest) = self.latest.lock() {
            *latest = Some(loss);
        }
    }

    fn take(&self) -> Option<f64> {
        self.latest.lock().ok().and_then(|mut latest| latest.take())
    }
}

/// Multiplies the learning rate by `factor` once the monitored loss stops
/// improving for `patience` epochs, never going below `min_lr`.
///
/// Each [`LrScheduler::step`] consumes the loss last reported through its
/// [`PlateauMonitor`]; a step without a report keeps the current rate.
#[derive(Clone, Debug)]
pub struct PlateauScheduler {
    lr: f64,
    factor: f64,
    patience: usize,
    min_lr: f64,
    min_delta: f64,
    best: f64,
    wait: usize,
    monitor: PlateauMonitor,
}

#[derive(Record, Clone)]
pub struct PlateauRecord {
    lr: f64,
    best: f64,
    wait: usize,
}

impl PlateauScheduler {
    pub fn new(lr: f64) -> Self {
        Self {
            lr,
            factor: 0.2,
            patience: 1,
            min_lr: 1e-6,
            min_delta: 1e-4,
            best: f64::INFINITY,
            wait: 0,
            monitor: PlateauMonitor::default(),
        }
    }

    pub fn monitor(&self) -> PlateauMonitor {
        self.monitor.clone()
    }

    pub fn current(&self) -> f64 {
        self.lr
    }

    /// Feed the epoch's monitored loss and return the rate for the next epoch.
    pub fn observe(&mut self, loss: f64) -> f64 {
        if loss < self.best - self.min_delta {
            self.best = loss;
            self.wait = 0;
            return self.lr;
        }

        self.wait += 1;
        if self.wait >= self.patience && self.lr > self.min_lr {
            let reduced = (self.lr * self.factor).max(self.min_lr);
            info!(from = self.lr, to = reduced, "reducing learning rate on plateau");
            self.lr = reduced;
            self.wait = 0;
        }
        self.lr
    }
}

impl LrScheduler for PlateauScheduler {
    type Record<B: Backend> = PlateauRecord;

    fn step(&mut self) -> f64 {
        match self.monitor.take() {
            Some(loss) => self.observe(loss),
            None => self.lr,
        }
    }

    fn to_record<B: Backend>(&self) -> Self::Record<B> {
        PlateauRecord {
            lr: self.lr,
            best: self.best,
            wait: self.wait,
        }
    }

    fn load_record<B: Backend>(mut self, record: Self::Record<B>) -> Self {
        self.lr = record.lr;
        self.best = record.best;
        self.wait = record.wait;
        self
    }
}

/// Epoch and target accuracy of the best snapshot so far.
#[derive(Clone, Debug, Default)]
pub struct BestTarget {
    inner: Arc<Mutex<Option<(usize, f64)>>>,
}

impl BestTarget {
    /// Record `accuracy` for `epoch`; true when it beats every earlier epoch.
    pub fn observe(&self, epoch: usize, accuracy: f64) -> bool {
        let Ok(mut best) = self.inner.lock() else {
            return false;
        };
        if best.map_or(true, |(_, previous)| accuracy > previous) {
            *best = Some((epoch, accuracy));
            true
        } else {
            false
        }
    }

    pub fn get(&self) -> Option<(usize, f64)> {
        self.inner.lock().ok().and_then(|best| *best)
    }
}

/// Keeps a single checkpoint, the one of the best target epoch.
#[derive(Clone)]
struct KeepBestTarget {
    best: BestTarget,
    saved: Option<usize>,
}

impl KeepBestTarget {
    fn new(best: BestTarget) -> Self {
        Self { best, saved: None }
    }

    fn actions(&mut self, epoch: usize) -> Vec<CheckpointingAction> {
        let best_epoch = self.best.get().map(|(best, _)| best);
        if best_epoch != Some(epoch) || self.saved == Some(epoch) {
            return Vec::new();
        }
        let mut actions = Vec::new();
        if let Some(previous) = self.saved.replace(epoch) {
            actions.push(CheckpointingAction::Delete(previous));
        }
        actions.push(CheckpointingAction::Save);
        actions
    }
}

impl CheckpointingStrategy for KeepBestTarget {
    fn checkpointing(
        &mut self,
        epoch: usize,
        _collector: &EventStoreClient,
    ) -> Vec<CheckpointingAction> {
        self.actions(epoch)
    }
}

/// Lifecycle of a training run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunPhase {
    Built,
    Compiled,
    Training { epoch: usize },
    Evaluated,
    Saved,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunPhase::Built => f.write_str("built"),
            RunPhase::Compiled => f.write_str("compiled"),
            RunPhase::Training { epoch } => write!(f, "training (epoch {epoch})"),
            RunPhase::Evaluated => f.write_str("evaluated"),
            RunPhase::Saved => f.write_str("saved"),
        }
    }
}

/// Persisted progress, rewritten after every epoch.
#[derive(Serialize, Deserialize, Default, Clone, Debug, PartialEq)]
pub struct TrainingState {
    pub epoch: usize,
    pub step: usize,
    pub learning_rate: f64,
    /// Epoch whose weights sit in `checkpoint/model-{best_epoch}`.
    pub best_epoch: Option<usize>,
    pub best_target_accuracy: Option<f64>,
}

impl TrainingState {
    pub fn load(run_dir: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(run_dir.join("state.json"))?;
        Ok(serde_json::from_str(&contents)?)
    }

    fn write(&self, run_dir: &Path) -> Result<()> {
        let state_json = serde_json::to_string_pretty(self)?;
        std::fs::write(run_dir.join("state.json"), state_json)?;
        Ok(())
    }
}

/// Path of the checkpointed model for `epoch`, without the recorder extension.
pub fn checkpoint_path(run_dir: &Path, epoch: usize) -> PathBuf {
    run_dir.join("checkpoint").join(format!("model-{epoch}"))
}

type AdaptationOptimizer<B> = OptimizerAdaptor<Adam, DomainAdaptationModel<B>, B>;
type AdaptationComponents<B> =
    LearningComponentsMarker<B, PlateauScheduler, DomainAdaptationModel<B>, AdaptationOptimizer<B>>;

/// Everything the epoch loop hands back once the learner returns.
struct FitOutcome<B: AutodiffBackend> {
    model: DomainAdaptationModel<B>,
    reports: Vec<EpochReport>,
    state: TrainingState,
    error: Option<Error>,
}

/// Per-epoch repairing, paired steps, target pass, custom evaluation,
/// plateau feedback and best-target checkpointing.
struct AdaptationStrategy<B: AutodiffBackend> {
    data: AdaptationData,
    epochs: usize,
    run_dir: PathBuf,
    custom_eval: Mutex<Option<Box<dyn EpochHook<B::InnerBackend>>>>,
    monitor: PlateauMonitor,
    best: BestTarget,
    start: TrainingState,
    device: B::Device,
    outcome: Mutex<Option<FitOutcome<B>>>,
}

impl<B: AutodiffBackend> AdaptationStrategy<B> {
    fn take_outcome(&self) -> Option<FitOutcome<B>> {
        self.outcome.lock().ok().and_then(|mut outcome| outcome.take())
    }

    fn custom_evaluation(
        &self,
        epoch: usize,
        snapshot: &DomainAdaptationModel<B::InnerBackend>,
    ) -> Result<Option<EvaluationSummary>> {
        let mut hook = self
            .custom_eval
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(hook) = hook.as_mut() else {
            return Ok(None);
        };
        let summary = hook.after_epoch(epoch, snapshot)?;
        info!(
            epoch,
            hook = hook.name(),
            loss = summary.loss,
            accuracy = summary.accuracy,
            "custom evaluation"
        );
        Ok(Some(summary))
    }

    /// Custom evaluation, scheduler feedback, checkpointing and `state.json`.
    fn finish_epoch(
        &self,
        epoch: usize,
        learner: &Learner<AdaptationComponents<B>>,
        components: &mut TrainingComponents<AdaptationComponents<B>>,
        state: &mut TrainingState,
        target: EvaluationSummary,
    ) -> Result<Option<EvaluationSummary>> {
        let custom_eval = self.custom_evaluation(epoch, &learner.model().valid())?;

        self.monitor.report(target.loss);
        if self.best.observe(epoch, target.accuracy) {
            state.best_epoch = Some(epoch);
            state.best_target_accuracy = Some(target.accuracy);
            info!(epoch, accuracy = target.accuracy, "new best target accuracy");
        }
        if let Some(checkpointer) = components.checkpointer.as_mut() {
            checkpointer.checkpoint(learner, epoch, &components.event_store);
        }

        state.epoch = epoch;
        state.write(&self.run_dir)?;
        Ok(custom_eval)
    }
}

impl<B: AutodiffBackend> SupervisedLearningStrategy<AdaptationComponents<B>>
    for AdaptationStrategy<B>
{
    fn fit(
        &self,
        mut components: TrainingComponents<AdaptationComponents<B>>,
        mut learner: Learner<AdaptationComponents<B>>,
        dataloader_train: TrainLoader<AdaptationComponents<B>>,
        dataloader_valid: ValidLoader<AdaptationComponents<B>>,
        _starting_epoch: usize,
    ) -> (
        DomainAdaptationModel<B>,
        SupervisedTrainingEventProcessor<AdaptationComponents<B>>,
    ) {
        let mut state = self.start.clone();
        let mut reports = Vec::with_capacity(self.epochs);
        let mut error = None;

        for epoch in 1..=self.epochs {
            learner.lr_step();
            let lr = learner.lr_current();
            state.learning_rate = lr;

            // The learner's loader holds the first pairing; later epochs re-pair.
            let loader = if epoch == 1 {
                dataloader_train.clone()
            } else {
                self.data.train_loader::<B>(epoch - 1, &self.device)
            };
            let mut iterator = loader.iter();
            let mut accumulator = MetricsAccumulator::default();
            let mut iteration = 0;

            while let Some(batch) = iterator.next() {
                if batch.is_empty() {
                    warn!(epoch, "every pair in the batch failed to load, skipping step");
                    continue;
                }
                iteration += 1;
                state.step += 1;
                let progress = iterator.progress();

                let output = learner.train_step(batch);
                learner.optimizer_step(output.grads);
                accumulator.add(&output.item);
                debug!(
                    epoch,
                    step = state.step,
                    total_loss = output.item.total_loss,
                    coral_loss = output.item.coral_loss
                );

                let item = LearnerItem::new(
                    output.item,
                    progress,
                    epoch,
                    self.epochs,
                    iteration,
                    Some(lr),
                );
                components
                    .event_processor
                    .process_train(LearnerEvent::ProcessedItem(item));

                if components.interrupter.should_stop() {
                    break;
                }
            }
            components
                .event_processor
                .process_train(LearnerEvent::EndEpoch(epoch));

            let target = run_target_epoch::<B>(
                &learner.model().valid(),
                epoch,
                self.epochs,
                &dataloader_valid,
                &mut components.event_processor,
                &components.interrupter,
            );

            let custom_eval =
                match self.finish_epoch(epoch, &learner, &mut components, &mut state, target) {
                    Ok(custom_eval) => custom_eval,
                    Err(err) => {
                        error = Some(err);
                        break;
                    }
                };
            info!(
                epoch,
                steps = iteration,
                total_loss = accumulator.mean(accumulator.total_loss),
                target_accuracy = target.accuracy,
                "epoch finished"
            );
            reports.push(EpochReport {
                epoch,
                steps: iteration,
                class_loss: accumulator.mean(accumulator.class_loss),
                coral_loss: accumulator.mean(accumulator.coral_loss),
                total_loss: accumulator.mean(accumulator.total_loss),
                train_accuracy: accumulator.accuracy(),
                target,
                custom_eval,
                learning_rate: lr,
            });

            if components.interrupter.should_stop() {
                break;
            }
        }

        let model = learner.model();
        if let Ok(mut outcome) = self.outcome.lock() {
            *outcome = Some(FitOutcome {
                model: model.clone(),
                reports,
                state,
                error,
            });
        }
        (model, components.event_processor)
    }
}

/// Target stream through the `valid` split of the event processor.
fn run_target_epoch<B: AutodiffBackend>(
    model: &DomainAdaptationModel<B::InnerBackend>,
    epoch: usize,
    epoch_total: usize,
    dataloader_valid: &ValidLoader<AdaptationComponents<B>>,
    processor: &mut SupervisedTrainingEventProcessor<AdaptationComponents<B>>,
    interrupter: &Interrupter,
) -> EvaluationSummary {
    let mut accumulator = MetricsAccumulator::default();
    let mut iterator = dataloader_valid.iter();
    let mut iteration = 0;

    while let Some(batch) = iterator.next() {
        if batch.is_empty() {
            continue;
        }
        let progress = iterator.progress();
        iteration += 1;

        let output = InferenceStep::step(model, batch);
        accumulator.add(&output);
        let item = LearnerItem::new(output, progress, epoch, epoch_total, iteration, None);
        processor.process_valid(LearnerEvent::ProcessedItem(item));

        if interrupter.should_stop() {
            break;
        }
    }
    processor.process_valid(LearnerEvent::EndEpoch(epoch));
    accumulator.evaluation()
}

/// Owns a run from configuration to saved artifacts.
pub struct Trainer<B: AutodiffBackend> {
    config: ExperimentConfig,
    run_dir: PathBuf,
    data: AdaptationData,
    model: DomainAdaptationModel<B>,
    learner: Option<Learner<AdaptationComponents<B>>>,
    monitor: PlateauMonitor,
    custom_eval: Option<Box<dyn EpochHook<B::InnerBackend>>>,
    phase: RunPhase,
    state: TrainingState,
    device: B::Device,
}

impl<B: AutodiffBackend> Trainer<B> {
    /// Validate, index both domains, then allocate the network.
    ///
    /// Configuration and indexing errors surface before any model tensor
    /// exists, and an existing run directory is never reused.
    pub fn build(
        config: ExperimentConfig,
        experiment_dir: &Path,
        device: B::Device,
    ) -> Result<Self> {
        config.validate()?;
        let run_dir = experiment_dir.join(config.run_signature());
        if run_dir.exists() {
            return Err(Error::Configuration(format!(
                "run directory {} already exists",
                run_dir.display()
            )));
        }
        if config.use_multi_gpu {
            warn!("use_multi_gpu is set but runs are single-device; ignoring");
        }
        if config.prune {
            info!(
                prune_val = config.prune_val,
                "pruning requested, an export variant will be written on save"
            );
        }

        let data = load_experiment_data(&config, experiment_dir)?;

        B::seed(&device, config.seed);
        let model_config = config.model_config();
        let model =
            DomainAdaptationModel::<B>::new(&model_config, config.effective_lambda(), &device);
        model.check_feature_widths(&model_config, config.resize, &device)?;

        std::fs::create_dir_all(run_dir.join("checkpoint"))?;
        config.save(run_dir.join("config.json"))?;

        let validation = data.builder().validation_slice(config.validation_split);
        let custom_eval: Option<Box<dyn EpochHook<B::InnerBackend>>> = if validation.is_empty() {
            None
        } else {
            Some(Box::new(CustomEvaluation::<B::InnerBackend>::new(
                data.clone(),
                validation,
                device.clone(),
            )))
        };

        info!(
            run = %run_dir.display(),
            lambda = config.effective_lambda(),
            "run built"
        );
        Ok(Self {
            state: TrainingState {
                learning_rate: config.learning_rate,
                ..Default::default()
            },
            config,
            run_dir,
            data,
            model,
            learner: None,
            monitor: PlateauMonitor::default(),
            custom_eval,
            phase: RunPhase::Built,
            device,
        })
    }

    /// Replace the held-out custom evaluation.
    pub fn with_custom_eval(mut self, hook: impl EpochHook<B::InnerBackend> + 'static) -> Self {
        self.custom_eval = Some(Box::new(hook));
        self
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn model(&self) -> &DomainAdaptationModel<B> {
        &self.model
    }

    pub fn data(&self) -> &AdaptationData {
        &self.data
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    /// Attach Adam over every trainable parameter and the plateau schedule.
    pub fn compile(&mut self) -> Result<()> {
        self.expect_phase("compile", |phase| phase == RunPhase::Built)?;
        let optimizer = AdamConfig::new().init::<B, DomainAdaptationModel<B>>();
        let scheduler = PlateauScheduler::new(self.config.learning_rate);
        self.monitor = scheduler.monitor();
        self.learner = Some(Learner::<AdaptationComponents<B>>::new(
            self.model.clone(),
            optimizer,
            scheduler,
        ));
        self.phase = RunPhase::Compiled;
        info!(learning_rate = self.config.learning_rate, "optimizer ready");
        Ok(())
    }

    /// Run every epoch through the learner: fresh pairing, paired steps, then
    /// the target pass.
    pub fn fit(&mut self) -> Result<Vec<EpochReport>> {
        self.expect_phase("fit", |phase| phase == RunPhase::Compiled)?;
        let learner = self.learner.take().ok_or_else(|| Error::InvalidPhase {
            action: "fit",
            phase: self.phase.to_string(),
        })?;
        let epochs = self.config.epochs;
        let best = BestTarget::default();
        let strategy = Arc::new(AdaptationStrategy::<B> {
            data: self.data.clone(),
            epochs,
            run_dir: self.run_dir.clone(),
            custom_eval: Mutex::new(self.custom_eval.take()),
            monitor: self.monitor.clone(),
            best: best.clone(),
            start: self.state.clone(),
            device: self.device.clone(),
            outcome: Mutex::new(None),
        });

        let train_loader = self.data.train_loader::<B>(0, &self.device);
        let target_loader = self.data.target_loader::<B::InnerBackend>(&self.device);
        let mut training =
            SupervisedTraining::new(self.run_dir.clone(), train_loader, target_loader)
                .with_training_strategy(TrainingStrategy::Custom(strategy.clone()))
                .with_checkpointing_strategy(KeepBestTarget::new(best))
                .with_file_checkpointer(CompactRecorder::new())
                .num_epochs(epochs);
        for metric in AdaptationMetric::train_split() {
            training = training.metric_train_numeric(metric);
        }
        for metric in AdaptationMetric::target_split() {
            training = training.metric_valid_numeric(metric);
        }
        self.phase = RunPhase::Training { epoch: 1 };
        training.launch(learner);

        let outcome = strategy.take_outcome().ok_or_else(|| Error::InvalidPhase {
            action: "fit",
            phase: "interrupted before returning a model".to_string(),
        })?;
        self.model = outcome.model;
        self.state = outcome.state;
        self.phase = RunPhase::Training {
            epoch: self.state.epoch.max(1),
        };
        if let Some(err) = outcome.error {
            return Err(err);
        }
        Ok(outcome.reports)
    }

    /// Final pass over the whole target stream.
    pub fn evaluate(&mut self) -> Result<EvaluationSummary> {
        self.expect_phase("evaluate", |phase| {
            matches!(phase, RunPhase::Training { .. } | RunPhase::Evaluated)
        })?;
        let summary = evaluate_target(
            &self.model.valid(),
            &self.data.target_loader::<B::InnerBackend>(&self.device),
        );
        info!(
            loss = summary.loss,
            accuracy = summary.accuracy,
            samples = summary.samples,
            "target evaluation"
        );
        self.phase = RunPhase::Evaluated;
        Ok(summary)
    }

    /// Write `model` under the run directory, plus `export_model` when pruning was requested.
    pub fn save(&mut self) -> Result<PathBuf> {
        self.expect_phase("save", |phase| {
            matches!(phase, RunPhase::Evaluated | RunPhase::Saved)
        })?;
        let model = self.model.valid();
        let path = self.run_dir.join("model");
        model
            .clone()
            .save_file(path.clone(), &CompactRecorder::new())
            .map_err(|err| Error::Record(err.to_string()))?;

        if self.config.prune {
            model
                .save_file(
                    self.run_dir.join("export_model"),
                    &NamedMpkFileRecorder::<HalfPrecisionSettings>::new(),
                )
                .map_err(|err| Error::Record(err.to_string()))?;
        }

        info!(path = %path.display(), "model saved");
        self.phase = RunPhase::Saved;
        Ok(path)
    }

    fn expect_phase(
        &self,
        action: &'static str,
        allowed: impl Fn(RunPhase) -> bool,
    ) -> Result<()> {
        if allowed(self.phase) {
            Ok(())
        } else {
            Err(Error::InvalidPhase {
                action,
                phase: self.phase.to_string(),
            })
        }
    }
}

/// Outcome of [`run`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunReport {
    pub run_dir: PathBuf,
    pub epochs: Vec<EpochReport>,
    pub target: EvaluationSummary,
    pub model_path: Option<PathBuf>,
}

/// Build, compile, fit, evaluate and (when `save_model` is set) save.
pub fn run<B: AutodiffBackend>(
    config: ExperimentConfig,
    experiment_dir: &Path,
    device: B::Device,
) -> Result<RunReport> {
    let save = config.save_model;
    let mut trainer = Trainer::<B>::build(config, experiment_dir, device)?;
    trainer.compile()?;
    let epochs = trainer.fit()?;
    let target = trainer.evaluate()?;
    let model_path = if save { Some(trainer.save()?) } else { None };
    Ok(RunReport {
        run_dir: trainer.run_dir().to_path_buf(),
        epochs,
        target,
        model_path,
    })
}

/// Reload weights written by [`Trainer::save`] or the best-target checkpoint.
///
/// The alignment weight is not part of the record and is set from `lambda`.
pub fn load_model<B: Backend>(
    config: &ModelConfig,
    lambda: f64,
    path: &Path,
    device: &B::Device,
) -> Result<DomainAdaptationModel<B>> {
    DomainAdaptationModel::<B>::new(config, lambda, device)
        .load_file(path.to_path_buf(), &CompactRecorder::new(), device)
        .map_err(|err| Error::Record(format!("{}: {err}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Architecture, DataRoots, DomainPair};
    use crate::data::indexer::tests::write_domain;
    use burn::backend::{Autodiff, NdArray};
    use burn::optim::{GradientsParams, Optimizer};
    use burn::tensor::{Distribution, TensorData};

    type TestBackend = NdArray;
    type TestAutodiffBackend = Autodiff<TestBackend>;

    fn model_config() -> ModelConfig {
        ModelConfig::new(3, Architecture::AlexNet)
            .with_feature_width(4)
            .with_hidden_width(5)
    }

    fn random_batch<B: Backend>(device: &B::Device) -> PairedBatch<B> {
        PairedBatch {
            source: Tensor::random([4, 3, 8, 8], Distribution::Default, device),
            target: Tensor::random([4, 3, 8, 8], Distribution::Default, device),
            labels: Tensor::from_data(TensorData::new(vec![0i64, 1, 2, 1], [4]), device),
        }
    }

    fn experiment(root: &Path) -> ExperimentConfig {
        write_domain(&root.join("office").join("amazon"), &["a", "b"], 3);
        write_domain(&root.join("office").join("webcam"), &["a", "b"], 2);
        ExperimentConfig::new(
            DomainPair::AmazonToWebcam,
            Architecture::AlexNet,
            2,
            DataRoots::new().with_office("office".to_string()),
        )
        .with_resize(8)
        .with_batch_size(2)
        .with_epochs(2)
        .with_feature_width(4)
        .with_num_workers(1)
        .with_validation_split(0.5)
        .with_learning_rate(1e-3)
    }

    #[test]
    fn zero_lambda_total_equals_classification_loss() {
        let device = Default::default();
        let model = DomainAdaptationModel::<TestBackend>::new(&model_config(), 0.0, &device);
        let losses = model.losses(random_batch(&device));
        let metrics = losses.metrics();
        assert!(metrics.coral_loss >= 0.0);
        assert_eq!(metrics.total_loss, metrics.class_loss);
        assert_eq!(metrics.batch_size, 4);
        assert!(metrics.correct <= 4);
    }

    #[test]
    fn positive_lambda_adds_the_weighted_alignment_term() {
        let device = Default::default();
        let model = DomainAdaptationModel::<TestBackend>::new(&model_config(), 2.0, &device);
        let metrics = model.losses(random_batch(&device)).metrics();
        let expected = metrics.class_loss + 2.0 * metrics.coral_loss;
        assert!((metrics.total_loss - expected).abs() < 1e-4);
    }

    #[test]
    fn train_step_produces_gradients_and_updates_parameters() {
        let device = Default::default();
        let model =
            DomainAdaptationModel::<TestAutodiffBackend>::new(&model_config(), 0.5, &device);
        let mut optimizer = AdamConfig::new()
            .init::<TestAutodiffBackend, DomainAdaptationModel<TestAutodiffBackend>>();
        let output = TrainStep::step(&model, random_batch(&device));
        assert_eq!(output.item.batch_size, 4);

        let held_out = random_batch::<TestBackend>(&device);
        let before = model.valid().losses(held_out.clone()).metrics();
        let updated = optimizer.step(1e-2, model, output.grads);
        let after = updated.valid().losses(held_out).metrics();
        assert_ne!(before.total_loss, after.total_loss);
    }

    /// Per-epoch mean class loss of a fixed-seed run over `data`.
    fn class_loss_trajectory(
        model: DomainAdaptationModel<TestAutodiffBackend>,
        data: &AdaptationData,
        class_only: bool,
    ) -> Vec<f64> {
        let device = Default::default();
        let mut model = model;
        let mut optimizer = AdamConfig::new()
            .init::<TestAutodiffBackend, DomainAdaptationModel<TestAutodiffBackend>>();
        let mut trajectory = Vec::new();
        for epoch in 0..2 {
            let mut accumulator = MetricsAccumulator::default();
            for batch in data.train_loader::<TestAutodiffBackend>(epoch, &device).iter() {
                let losses = model.losses(batch);
                accumulator.add(&losses.metrics());
                let objective = if class_only {
                    losses.class_loss
                } else {
                    losses.total_loss
                };
                let grads = GradientsParams::from_grads(objective.backward(), &model);
                model = optimizer.step(1e-2, model, grads);
            }
            trajectory.push(accumulator.mean(accumulator.class_loss));
        }
        trajectory
    }

    #[test]
    fn zero_lambda_follows_the_classification_only_trajectory() {
        let dir = tempfile::tempdir().unwrap();
        let config = experiment(dir.path());
        let data = load_experiment_data(&config, dir.path()).unwrap();
        let device = Default::default();
        let network = ModelConfig::new(2, Architecture::AlexNet)
            .with_feature_width(4)
            .with_hidden_width(5)
            .with_dropout(0.0)
            .init::<TestAutodiffBackend>(&device);

        let adapted = DomainAdaptationModel::from_network(network.clone(), 0.0);
        let baseline = DomainAdaptationModel::from_network(network, 0.0);
        let with_alignment = class_loss_trajectory(adapted, &data, false);
        let class_only = class_loss_trajectory(baseline, &data, true);

        assert_eq!(with_alignment.len(), 2);
        for (a, b) in with_alignment.iter().zip(&class_only) {
            assert!((a - b).abs() < 1e-6, "{with_alignment:?} vs {class_only:?}");
        }
    }

    #[test]
    fn width_check_leaves_batch_norm_statistics_alone() {
        let device = Default::default();
        let config = model_config();
        let model = DomainAdaptationModel::<TestAutodiffBackend>::new(&config, 0.5, &device);
        let held_out = random_batch::<TestBackend>(&device);
        let before = model.valid().losses(held_out.clone()).metrics();

        model.check_feature_widths(&config, 8, &device).unwrap();
        let after = model.valid().losses(held_out).metrics();
        assert_eq!(before, after);
    }

    #[test]
    fn plateau_scheduler_reduces_after_patience_and_respects_floor() {
        let mut scheduler = PlateauScheduler::new(1e-5);
        assert_eq!(scheduler.observe(1.0), 1e-5);
        assert_eq!(scheduler.observe(0.5), 1e-5);
        assert!((scheduler.observe(0.6) - 2e-6).abs() < 1e-12);
        assert!((scheduler.observe(0.7) - 1e-6).abs() < 1e-12);
        assert_eq!(scheduler.observe(0.8), 1e-6);
    }

    #[test]
    fn scheduler_steps_on_reported_losses_and_restores_from_its_record() {
        let mut scheduler = PlateauScheduler::new(1e-3);
        let monitor = scheduler.monitor();
        assert_eq!(LrScheduler::step(&mut scheduler), 1e-3);

        monitor.report(0.4);
        assert_eq!(LrScheduler::step(&mut scheduler), 1e-3);
        monitor.report(0.9);
        assert!((LrScheduler::step(&mut scheduler) - 2e-4).abs() < 1e-12);
        // Nothing reported since the last step.
        assert!((LrScheduler::step(&mut scheduler) - 2e-4).abs() < 1e-12);

        let record = scheduler.to_record::<TestBackend>();
        let mut restored = PlateauScheduler::new(1e-3).load_record::<TestBackend>(record);
        assert!((restored.current() - 2e-4).abs() < 1e-12);
        assert!((restored.observe(0.45) - 4e-5).abs() < 1e-12);
    }

    #[test]
    fn best_target_keeps_only_the_best_checkpoint() {
        let best = BestTarget::default();
        let mut strategy = KeepBestTarget::new(best.clone());

        assert!(best.observe(1, 0.5));
        assert!(matches!(
            strategy.actions(1).as_slice(),
            [CheckpointingAction::Save]
        ));
        assert!(!best.observe(2, 0.4));
        assert!(strategy.actions(2).is_empty());
        assert!(best.observe(3, 0.75));
        assert!(matches!(
            strategy.actions(3).as_slice(),
            [CheckpointingAction::Delete(1), CheckpointingAction::Save]
        ));
        assert_eq!(best.get(), Some((3, 0.75)));
    }

    #[test]
    fn out_of_order_calls_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = experiment(dir.path());
        let mut trainer =
            Trainer::<TestAutodiffBackend>::build(config, dir.path(), Default::default()).unwrap();
        assert_eq!(trainer.phase(), RunPhase::Built);

        assert!(matches!(trainer.fit(), Err(Error::InvalidPhase { action: "fit", .. })));
        assert!(matches!(
            trainer.evaluate(),
            Err(Error::InvalidPhase { action: "evaluate", .. })
        ));
        assert!(matches!(trainer.save(), Err(Error::InvalidPhase { action: "save", .. })));

        trainer.compile().unwrap();
        assert!(matches!(
            trainer.compile(),
            Err(Error::InvalidPhase { action: "compile", .. })
        ));
        assert_eq!(trainer.phase(), RunPhase::Compiled);
    }

    #[test]
    fn bad_mode_fails_before_any_run_directory_exists() {
        let dir = tempfile::tempdir().unwrap();
        let config = experiment(dir.path()).with_mode("inference".to_string());
        let signature = config.run_signature();
        let result = Trainer::<TestAutodiffBackend>::build(config, dir.path(), Default::default());
        assert!(matches!(result, Err(Error::Configuration(_))));
        assert!(!dir.path().join(signature).exists());
    }

    #[test]
    fn existing_run_directory_is_not_reused() {
        let dir = tempfile::tempdir().unwrap();
        let config = experiment(dir.path());
        let run_dir = dir.path().join(config.run_signature());
        std::fs::create_dir_all(&run_dir).unwrap();
        std::fs::write(run_dir.join("state.json"), "{}").unwrap();

        let result = Trainer::<TestAutodiffBackend>::build(config, dir.path(), Default::default());
        assert!(matches!(result, Err(Error::Configuration(_))));
        assert_eq!(std::fs::read_to_string(run_dir.join("state.json")).unwrap(), "{}");
    }

    #[test]
    fn two_epoch_run_trains_evaluates_and_saves() {
        let dir = tempfile::tempdir().unwrap();
        let config = experiment(dir.path()).with_prune(true);
        let mut trainer =
            Trainer::<TestAutodiffBackend>::build(config.clone(), dir.path(), Default::default())
                .unwrap();
        trainer.compile().unwrap();

        let reports = trainer.fit().unwrap();
        assert_eq!(reports.len(), 2);
        // 6 source images repeated over 4 target images: 6 pairs, 3 batches.
        assert!(reports.iter().all(|report| report.steps == 3));
        assert!(reports.iter().all(|report| report.target.samples == 4));
        assert!(reports.iter().all(|report| report.custom_eval.is_some()));
        assert_eq!(trainer.phase(), RunPhase::Training { epoch: 2 });

        let state = TrainingState::load(trainer.run_dir()).unwrap();
        assert_eq!(&state, trainer.state());
        assert_eq!(state.epoch, 2);
        assert_eq!(state.step, 6);
        let best_epoch = state.best_epoch.unwrap();

        let summary = trainer.evaluate().unwrap();
        assert_eq!(summary.samples, 4);
        assert!((0.0..=1.0).contains(&summary.accuracy));
        let model_path = trainer.save().unwrap();
        assert_eq!(trainer.phase(), RunPhase::Saved);

        let run_dir = dir.path().join(config.run_signature());
        assert_eq!(trainer.run_dir(), run_dir.as_path());
        assert!(run_dir.join("config.json").exists());
        let entries: Vec<String> = std::fs::read_dir(&run_dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert!(entries.iter().any(|name| name.starts_with("model")));
        assert!(entries.iter().any(|name| name.starts_with("export_model")));

        let device = Default::default();
        let loader = trainer.data().target_loader::<TestBackend>(&device);
        for path in [model_path, checkpoint_path(&run_dir, best_epoch)] {
            let reloaded =
                load_model::<TestBackend>(&config.model_config(), 0.0, &path, &device).unwrap();
            let again = evaluate_target(&reloaded, &loader);
            assert_eq!(again.samples, 4);
        }
    }
}
