//! Stage bodies for the standard train/eval/predict pipelines.
//!
//! Each body is a thin shim: it moves values between the context and one of
//! the collaborator seams ([`StepDriver`], [`DataProvider`], [`Collective`])
//! and returns [`Control::Advance`]. The numerics live behind the seams; the
//! pipeline owns only sequencing, bookkeeping, and reporting.

use crate::node::StageAction;
use crate::signal::{Control, StageResult};
use crate::wrapper::{MeterProfiler, Profiler};
use flywheel_types::{Context, Mode};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Collaborator seams
// ---------------------------------------------------------------------------

/// The numeric backend a pipeline drives. One implementation per model
/// family; the pipeline never inspects what happens behind these calls.
pub trait StepDriver: Send + Sync {
    /// The pipeline is switching modes (train/val/eval/predict).
    fn set_mode(&self, mode: Mode);
    /// Run the model on one batch, returning its outputs.
    fn forward(&self, batch: &Value) -> anyhow::Result<Value>;
    /// Compute the scalar loss for one batch.
    fn compute_loss(&self, batch: &Value, outputs: &Value) -> anyhow::Result<f64>;
    /// Compute named metric values for one batch.
    fn compute_metrics(&self, batch: &Value, outputs: &Value)
        -> anyhow::Result<HashMap<String, f64>>;
    /// Propagate gradients for the given loss.
    fn backward(&self, loss: f64) -> anyhow::Result<()>;
    /// Apply one optimizer step.
    fn optim_step(&self) -> anyhow::Result<()>;
    /// Apply the learning-rate schedule once.
    fn decay_lr(&self) -> anyhow::Result<()>;
}

/// Supplies batch payloads for a mode.
pub trait DataProvider: Send + Sync {
    fn fetch(&self, mode: Mode) -> anyhow::Result<Vec<Value>>;
}

/// Cross-process reduction seam. Blocking; called from stage bodies only.
pub trait Collective: Send + Sync {
    /// Average each named value across all ranks.
    fn all_reduce_mean(&self, means: HashMap<String, f64>)
        -> anyhow::Result<HashMap<String, f64>>;
}

// ---------------------------------------------------------------------------
// Mode and data plumbing
// ---------------------------------------------------------------------------

/// Switches the context (and the driver) into a mode.
pub struct ModeStage {
    mode: Mode,
    driver: Arc<dyn StepDriver>,
}

impl ModeStage {
    pub fn new(mode: Mode, driver: Arc<dyn StepDriver>) -> Self {
        Self { mode, driver }
    }
}

impl StageAction for ModeStage {
    fn execute(&self, ctx: &mut Context) -> StageResult {
        ctx.mode = self.mode;
        self.driver.set_mode(self.mode);
        tracing::debug!(mode = self.mode.as_str(), "pipeline mode set");
        Ok(Control::Advance)
    }
}

/// Loads the current mode's batches into the context.
pub struct DatasetStage {
    provider: Arc<dyn DataProvider>,
}

impl DatasetStage {
    pub fn new(provider: Arc<dyn DataProvider>) -> Self {
        Self { provider }
    }
}

impl StageAction for DatasetStage {
    fn execute(&self, ctx: &mut Context) -> StageResult {
        let batches = self.provider.fetch(ctx.mode)?;
        tracing::debug!(
            mode = ctx.mode.as_str(),
            batches = batches.len(),
            "dataset loaded"
        );
        ctx.step.total = batches.len();
        ctx.dataset = batches;
        Ok(Control::Advance)
    }
}

/// Clears the running averages for the current mode.
pub struct MeterInitStage;

impl StageAction for MeterInitStage {
    fn execute(&self, ctx: &mut Context) -> StageResult {
        ctx.meters.reset(ctx.mode);
        Ok(Control::Advance)
    }
}

// ---------------------------------------------------------------------------
// Per-batch numerics
// ---------------------------------------------------------------------------

/// Runs the model forward on the current batch.
pub struct ForwardStage {
    driver: Arc<dyn StepDriver>,
}

impl ForwardStage {
    pub fn new(driver: Arc<dyn StepDriver>) -> Self {
        Self { driver }
    }
}

impl StageAction for ForwardStage {
    fn execute(&self, ctx: &mut Context) -> StageResult {
        ctx.step.outputs = self.driver.forward(&ctx.step.batch)?;
        Ok(Control::Advance)
    }
}

/// Computes the loss for the current batch.
pub struct LossStage {
    driver: Arc<dyn StepDriver>,
}

impl LossStage {
    pub fn new(driver: Arc<dyn StepDriver>) -> Self {
        Self { driver }
    }
}

impl StageAction for LossStage {
    fn execute(&self, ctx: &mut Context) -> StageResult {
        let loss = self.driver.compute_loss(&ctx.step.batch, &ctx.step.outputs)?;
        ctx.step.loss = Some(loss);
        Ok(Control::Advance)
    }
}

/// Propagates gradients. Requires a loss computed earlier in the round.
pub struct BackwardStage {
    driver: Arc<dyn StepDriver>,
}

impl BackwardStage {
    pub fn new(driver: Arc<dyn StepDriver>) -> Self {
        Self { driver }
    }
}

impl StageAction for BackwardStage {
    fn execute(&self, ctx: &mut Context) -> StageResult {
        let Some(loss) = ctx.step.loss else {
            anyhow::bail!("backward without a computed loss");
        };
        self.driver.backward(loss)?;
        Ok(Control::Advance)
    }
}

/// Applies one optimizer step.
pub struct OptimStepStage {
    driver: Arc<dyn StepDriver>,
}

impl OptimStepStage {
    pub fn new(driver: Arc<dyn StepDriver>) -> Self {
        Self { driver }
    }
}

impl StageAction for OptimStepStage {
    fn execute(&self, ctx: &mut Context) -> StageResult {
        self.driver.optim_step()?;
        Ok(Control::Advance)
    }
}

/// Computes named metrics for the current batch.
pub struct MetricsStage {
    driver: Arc<dyn StepDriver>,
}

impl MetricsStage {
    pub fn new(driver: Arc<dyn StepDriver>) -> Self {
        Self { driver }
    }
}

impl StageAction for MetricsStage {
    fn execute(&self, ctx: &mut Context) -> StageResult {
        ctx.step.metrics = self.driver.compute_metrics(&ctx.step.batch, &ctx.step.outputs)?;
        Ok(Control::Advance)
    }
}

// ---------------------------------------------------------------------------
// Aggregation and reporting
// ---------------------------------------------------------------------------

/// Folds the step's loss and metrics into the running averages.
pub struct MeterStage;

impl StageAction for MeterStage {
    fn execute(&self, ctx: &mut Context) -> StageResult {
        let mode = ctx.mode;
        if let Some(loss) = ctx.step.loss {
            ctx.meters.push(mode, "loss", loss);
        }
        let metrics = std::mem::take(&mut ctx.step.metrics);
        for (name, value) in &metrics {
            ctx.meters.push(mode, name, *value);
        }
        ctx.step.metrics = metrics;
        Ok(Control::Advance)
    }
}

/// Averages the current mode's means across ranks through the collective.
pub struct GatherAverageStage {
    collective: Arc<dyn Collective>,
}

impl GatherAverageStage {
    pub fn new(collective: Arc<dyn Collective>) -> Self {
        Self { collective }
    }
}

impl StageAction for GatherAverageStage {
    fn execute(&self, ctx: &mut Context) -> StageResult {
        let mode = ctx.mode;
        if ctx.meters.is_empty(mode) {
            return Ok(Control::Advance);
        }
        let reduced = self.collective.all_reduce_mean(ctx.meters.raw_means(mode))?;
        ctx.meters.apply_means(mode, &reduced);
        Ok(Control::Advance)
    }
}

/// Logs the current means through `tracing`.
pub struct ReportStage;

impl StageAction for ReportStage {
    fn execute(&self, ctx: &mut Context) -> StageResult {
        let summary = MeterProfiler.meter_profile(ctx);
        tracing::info!(
            mode = ctx.mode.as_str(),
            epoch = ctx.schedule.current_epoch,
            step = ctx.step.index,
            meters = %summary,
            "progress report"
        );
        Ok(Control::Advance)
    }
}

/// Applies the learning-rate schedule once per epoch.
pub struct LrDecayStage {
    driver: Arc<dyn StepDriver>,
}

impl LrDecayStage {
    pub fn new(driver: Arc<dyn StepDriver>) -> Self {
        Self { driver }
    }
}

impl StageAction for LrDecayStage {
    fn execute(&self, ctx: &mut Context) -> StageResult {
        self.driver.decay_lr()?;
        tracing::debug!(epoch = ctx.schedule.current_epoch, "learning rate decayed");
        Ok(Control::Advance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    /// Records every call and answers with canned values.
    struct RecordingDriver {
        calls: Mutex<Vec<String>>,
        loss: f64,
    }

    impl RecordingDriver {
        fn new(loss: f64) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                loss,
            })
        }

        fn record(&self, call: impl Into<String>) {
            self.calls.lock().unwrap().push(call.into());
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl StepDriver for RecordingDriver {
        fn set_mode(&self, mode: Mode) {
            self.record(format!("set_mode:{mode}"));
        }

        fn forward(&self, batch: &Value) -> anyhow::Result<Value> {
            self.record("forward");
            Ok(json!({ "echo": batch }))
        }

        fn compute_loss(&self, _batch: &Value, outputs: &Value) -> anyhow::Result<f64> {
            self.record("compute_loss");
            anyhow::ensure!(!outputs.is_null(), "loss before forward");
            Ok(self.loss)
        }

        fn compute_metrics(
            &self,
            _batch: &Value,
            _outputs: &Value,
        ) -> anyhow::Result<HashMap<String, f64>> {
            self.record("compute_metrics");
            Ok(HashMap::from([("acc".to_owned(), 0.5)]))
        }

        fn backward(&self, loss: f64) -> anyhow::Result<()> {
            self.record(format!("backward:{loss}"));
            Ok(())
        }

        fn optim_step(&self) -> anyhow::Result<()> {
            self.record("optim_step");
            Ok(())
        }

        fn decay_lr(&self) -> anyhow::Result<()> {
            self.record("decay_lr");
            Ok(())
        }
    }

    struct StaticProvider {
        batches: Vec<Value>,
    }

    impl DataProvider for StaticProvider {
        fn fetch(&self, _mode: Mode) -> anyhow::Result<Vec<Value>> {
            Ok(self.batches.clone())
        }
    }

    /// Pretends every other rank reported `value + 1`, shifting each mean.
    struct ShiftingCollective {
        calls: Mutex<usize>,
    }

    impl Collective for ShiftingCollective {
        fn all_reduce_mean(
            &self,
            means: HashMap<String, f64>,
        ) -> anyhow::Result<HashMap<String, f64>> {
            *self.calls.lock().unwrap() += 1;
            Ok(means.into_iter().map(|(k, v)| (k, v + 0.5)).collect())
        }
    }

    #[test]
    fn mode_stage_switches_context_and_driver() {
        let driver = RecordingDriver::new(0.0);
        let mut ctx = Context::single_process();

        let control = ModeStage::new(Mode::Val, driver.clone())
            .execute(&mut ctx)
            .unwrap();
        assert_eq!(control, Control::Advance);
        assert_eq!(ctx.mode, Mode::Val);
        assert_eq!(driver.calls(), vec!["set_mode:val"]);
    }

    #[test]
    fn dataset_stage_loads_batches_and_step_total() {
        let provider = Arc::new(StaticProvider {
            batches: vec![json!(1), json!(2)],
        });
        let mut ctx = Context::single_process();

        DatasetStage::new(provider).execute(&mut ctx).unwrap();
        assert_eq!(ctx.dataset, vec![json!(1), json!(2)]);
        assert_eq!(ctx.step.total, 2);
    }

    #[test]
    fn forward_loss_metrics_flow_through_the_step() {
        let driver = RecordingDriver::new(0.25);
        let mut ctx = Context::single_process();
        ctx.step.batch = json!([3, 4]);

        ForwardStage::new(driver.clone()).execute(&mut ctx).unwrap();
        LossStage::new(driver.clone()).execute(&mut ctx).unwrap();
        MetricsStage::new(driver.clone()).execute(&mut ctx).unwrap();

        assert_eq!(ctx.step.outputs, json!({ "echo": [3, 4] }));
        assert_eq!(ctx.step.loss, Some(0.25));
        assert_eq!(ctx.step.metrics.get("acc"), Some(&0.5));
        assert_eq!(driver.calls(), vec!["forward", "compute_loss", "compute_metrics"]);
    }

    #[test]
    fn backward_requires_a_computed_loss() {
        let driver = RecordingDriver::new(0.0);
        let mut ctx = Context::single_process();

        let err = BackwardStage::new(driver.clone())
            .execute(&mut ctx)
            .unwrap_err();
        assert!(err.to_string().contains("backward without a computed loss"));
        assert!(driver.calls().is_empty(), "the driver must not be touched");

        ctx.step.loss = Some(1.5);
        BackwardStage::new(driver.clone()).execute(&mut ctx).unwrap();
        OptimStepStage::new(driver.clone()).execute(&mut ctx).unwrap();
        assert_eq!(driver.calls(), vec!["backward:1.5", "optim_step"]);
    }

    #[test]
    fn meter_stage_accumulates_running_averages() {
        let mut ctx = Context::single_process();

        ctx.step.loss = Some(2.0);
        ctx.step.metrics = HashMap::from([("acc".to_owned(), 1.0)]);
        MeterStage.execute(&mut ctx).unwrap();

        ctx.step.loss = Some(4.0);
        ctx.step.metrics = HashMap::from([("acc".to_owned(), 0.0)]);
        MeterStage.execute(&mut ctx).unwrap();

        let means = ctx.meters.means(Mode::Train);
        assert_eq!(means.get("loss"), Some(&3.0));
        assert_eq!(means.get("acc"), Some(&0.5));
        assert_eq!(
            ctx.step.metrics.get("acc"),
            Some(&0.0),
            "the step keeps its metric values after metering"
        );
    }

    #[test]
    fn gather_average_reduces_and_applies_means() {
        let collective = Arc::new(ShiftingCollective {
            calls: Mutex::new(0),
        });
        let mut ctx = Context::single_process();
        ctx.meters.push(Mode::Train, "loss", 1.0);

        GatherAverageStage::new(collective.clone())
            .execute(&mut ctx)
            .unwrap();
        assert_eq!(ctx.meters.means(Mode::Train).get("loss"), Some(&1.5));
        assert_eq!(*collective.calls.lock().unwrap(), 1);
    }

    #[test]
    fn gather_average_skips_an_empty_scope() {
        let collective = Arc::new(ShiftingCollective {
            calls: Mutex::new(0),
        });
        let mut ctx = Context::single_process();

        GatherAverageStage::new(collective.clone())
            .execute(&mut ctx)
            .unwrap();
        assert_eq!(*collective.calls.lock().unwrap(), 0, "nothing to reduce");
    }

    #[test]
    fn report_and_lr_decay_advance() {
        let driver = RecordingDriver::new(0.0);
        let mut ctx = Context::single_process();
        ctx.meters.push(Mode::Train, "loss", 0.125);

        assert_eq!(ReportStage.execute(&mut ctx).unwrap(), Control::Advance);
        assert_eq!(
            LrDecayStage::new(driver.clone()).execute(&mut ctx).unwrap(),
            Control::Advance
        );
        assert_eq!(driver.calls(), vec!["decay_lr"]);
    }
}
