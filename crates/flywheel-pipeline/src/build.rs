//! Standard pipeline assembly.
//!
//! [`PipelineBuilder`] wires the collaborator seams into the stock
//! train/eval/predict trees. Node ids follow a fixed `{pipeline}_{stage}`
//! scheme (with a `_train`/`_val` tail where one pipeline carries both
//! scopes) so tooling and the distributed rewrite can address nodes by name.

use crate::launch::{self, LaunchMode};
use crate::node::{HandlerSpec, StageKind};
use crate::stages::{
    BackwardStage, Collective, DataProvider, DatasetStage, ForwardStage, LossStage, LrDecayStage,
    MeterInitStage, MeterStage, MetricsStage, ModeStage, OptimStepStage, ReportStage, StepDriver,
};
use crate::tree::HandlerTree;
use crate::wrapper::{MeterProfiler, ProfileProgressWrapper, ProgressWrapper};
use flywheel_types::{Context, Mode, Rank, RunPlan};
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Id factory
// ---------------------------------------------------------------------------

/// Mints ids for nodes whose spec did not name one: `handler_0`,
/// `handler_1`, … in materialization order. Owned by whoever builds trees
/// and threaded through explicitly, so numbering is predictable per builder
/// rather than global.
#[derive(Debug, Default)]
pub struct IdFactory {
    next: u64,
}

impl IdFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&mut self) -> String {
        let id = format!("handler_{}", self.next);
        self.next += 1;
        id
    }
}

// ---------------------------------------------------------------------------
// Pipeline builder
// ---------------------------------------------------------------------------

/// Assembles the standard pipelines around one set of collaborators.
pub struct PipelineBuilder {
    driver: Arc<dyn StepDriver>,
    provider: Arc<dyn DataProvider>,
    collective: Arc<dyn Collective>,
    plan: RunPlan,
    launch: LaunchMode,
    ids: IdFactory,
}

impl PipelineBuilder {
    pub fn new(
        driver: Arc<dyn StepDriver>,
        provider: Arc<dyn DataProvider>,
        collective: Arc<dyn Collective>,
    ) -> Self {
        Self {
            driver,
            provider,
            collective,
            plan: RunPlan::default(),
            launch: LaunchMode::default(),
            ids: IdFactory::new(),
        }
    }

    pub fn with_plan(mut self, plan: RunPlan) -> Self {
        self.plan = plan;
        self
    }

    pub fn with_launch(mut self, launch: LaunchMode) -> Self {
        self.launch = launch;
        self
    }

    /// A context pre-loaded with this builder's schedule.
    pub fn context(&self, rank: Rank, world_size: usize) -> Context {
        let mut ctx = Context::new(rank, world_size);
        ctx.schedule.total_epochs = self.plan.epochs;
        ctx
    }

    /// The training pipeline: an epoch loop alternating a train pass and a
    /// validation pass, with per-batch metering and reporting in each.
    pub fn build_train(&mut self) -> HandlerTree {
        let optimizer = HandlerSpec::sequence(vec![
            self.backward_stage("train_backward"),
            self.optim_step_stage("train_optim_step"),
        ])
        .with_id("train_optimizer");

        let epoch_round = vec![
            self.mode_stage(Mode::Train, "train_status_train"),
            self.dataset_stage("train_dataset_train"),
            self.meter_init_stage("train_average_init_train"),
            self.batch_loop(
                "train_iteration_train",
                vec![
                    self.forward_stage("train_forward_train"),
                    self.loss_stage("train_loss_train"),
                    optimizer,
                    self.metrics_stage("train_metrics_train"),
                    self.meter_stage("train_average_train"),
                    self.report_stage("train_display_train"),
                ],
            ),
            self.lr_decay_stage("train_lr_decay"),
            self.mode_stage(Mode::Val, "train_status_val"),
            self.dataset_stage("train_dataset_val"),
            self.meter_init_stage("train_average_init_val"),
            self.batch_loop(
                "train_iteration_val",
                vec![
                    self.forward_stage("train_forward_val"),
                    self.loss_stage("train_loss_val"),
                    self.metrics_stage("train_metrics_val"),
                    self.meter_stage("train_average_val"),
                    self.report_stage("train_display_val"),
                ],
            ),
        ];

        let spec = HandlerSpec::sequence(vec![
            self.epoch_loop("train_epoch_iteration", epoch_round)
        ])
        .with_id("train_container");
        self.finish(spec, true)
    }

    /// The evaluation pipeline: a single pass with metering and reporting.
    pub fn build_eval(&mut self) -> HandlerTree {
        let spec = HandlerSpec::sequence(vec![
            self.mode_stage(Mode::Eval, "eval_status"),
            self.dataset_stage("eval_dataset"),
            self.meter_init_stage("eval_average_init"),
            self.batch_loop(
                "eval_iteration",
                vec![
                    self.forward_stage("eval_forward"),
                    self.loss_stage("eval_loss"),
                    self.metrics_stage("eval_metrics"),
                    self.meter_stage("eval_average"),
                    self.report_stage("eval_display"),
                ],
            ),
        ])
        .with_id("eval_container");
        self.finish(spec, true)
    }

    /// The prediction pipeline: forward and report only, no loss, no meters.
    pub fn build_predict(&mut self) -> HandlerTree {
        let spec = HandlerSpec::sequence(vec![
            self.mode_stage(Mode::Predict, "predict_status"),
            self.dataset_stage("predict_dataset"),
            self.batch_loop(
                "predict_iteration",
                vec![
                    self.forward_stage("predict_forward"),
                    self.report_stage("predict_display"),
                ],
            ),
        ])
        .with_id("predict_container");
        self.finish(spec, false)
    }

    fn finish(&mut self, spec: HandlerSpec, rewrite: bool) -> HandlerTree {
        let mut tree = HandlerTree::materialize(spec, &mut self.ids);
        if rewrite && self.launch == LaunchMode::Distributed {
            launch::apply_distributed_rewrite(&mut tree, &self.collective, &mut self.ids);
        }
        tree
    }

    // --- leaf and group shorthands -------------------------------------

    fn mode_stage(&self, mode: Mode, id: &str) -> HandlerSpec {
        HandlerSpec::leaf(StageKind::Mode, ModeStage::new(mode, self.driver.clone())).with_id(id)
    }

    fn dataset_stage(&self, id: &str) -> HandlerSpec {
        HandlerSpec::leaf(StageKind::Dataset, DatasetStage::new(self.provider.clone())).with_id(id)
    }

    fn meter_init_stage(&self, id: &str) -> HandlerSpec {
        HandlerSpec::leaf(StageKind::MeterInit, MeterInitStage).with_id(id)
    }

    fn forward_stage(&self, id: &str) -> HandlerSpec {
        HandlerSpec::leaf(StageKind::Forward, ForwardStage::new(self.driver.clone())).with_id(id)
    }

    fn loss_stage(&self, id: &str) -> HandlerSpec {
        HandlerSpec::leaf(StageKind::Loss, LossStage::new(self.driver.clone())).with_id(id)
    }

    fn backward_stage(&self, id: &str) -> HandlerSpec {
        HandlerSpec::leaf(StageKind::Backward, BackwardStage::new(self.driver.clone())).with_id(id)
    }

    fn optim_step_stage(&self, id: &str) -> HandlerSpec {
        HandlerSpec::leaf(
            StageKind::OptimStep,
            OptimStepStage::new(self.driver.clone()),
        )
        .with_id(id)
    }

    fn metrics_stage(&self, id: &str) -> HandlerSpec {
        HandlerSpec::leaf(StageKind::Metrics, MetricsStage::new(self.driver.clone())).with_id(id)
    }

    fn meter_stage(&self, id: &str) -> HandlerSpec {
        HandlerSpec::leaf(StageKind::Meter, MeterStage).with_id(id)
    }

    fn report_stage(&self, id: &str) -> HandlerSpec {
        HandlerSpec::leaf(StageKind::Report, ReportStage).with_id(id)
    }

    fn lr_decay_stage(&self, id: &str) -> HandlerSpec {
        HandlerSpec::leaf(StageKind::LrDecay, LrDecayStage::new(self.driver.clone())).with_id(id)
    }

    /// Epoch loops carry a plain progress wrapper; totals come from the
    /// schedule at run time.
    fn epoch_loop(&self, id: &str, children: Vec<HandlerSpec>) -> HandlerSpec {
        HandlerSpec::group(StageKind::EpochLoop, children)
            .with_id(id)
            .with_wrapper(ProgressWrapper)
    }

    /// Batch loops carry the profiling variant so the bar shows live means.
    fn batch_loop(&self, id: &str, children: Vec<HandlerSpec>) -> HandlerSpec {
        HandlerSpec::group(StageKind::BatchLoop, children)
            .with_id(id)
            .with_wrapper(ProfileProgressWrapper::new(Arc::new(MeterProfiler)))
    }
}
