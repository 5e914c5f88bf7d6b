//! End-to-end tests for the Flywheel pipeline runner.
//!
//! Each test exercises the full surface: build a tree (standard or ad hoc)
//! -> run it -> verify control flow, meter state, and reports.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use flywheel_pipeline::{
    run, Collective, Control, DataProvider, ExecRanks, FnStage, HandlerSpec, HandlerTree,
    IdFactory, LaunchMode, PipelineBuilder, StageKind, StepDriver,
};
use flywheel_types::{Context, FlywheelError, Mode, RunPlan};
use serde_json::{json, Value};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}

/// Records every driver call and answers with fixed numbers.
struct CountingDriver {
    calls: Mutex<Vec<String>>,
}

impl CountingDriver {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
        })
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn count_of(&self, name: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| call.as_str() == name || call.starts_with(&format!("{name}:")))
            .count()
    }
}

impl StepDriver for CountingDriver {
    fn set_mode(&self, mode: Mode) {
        self.record(format!("set_mode:{mode}"));
    }

    fn forward(&self, batch: &Value) -> anyhow::Result<Value> {
        self.record("forward");
        Ok(json!({ "pred": batch }))
    }

    fn compute_loss(&self, _batch: &Value, _outputs: &Value) -> anyhow::Result<f64> {
        self.record("loss");
        Ok(0.5)
    }

    fn compute_metrics(
        &self,
        _batch: &Value,
        _outputs: &Value,
    ) -> anyhow::Result<HashMap<String, f64>> {
        self.record("metrics");
        Ok(HashMap::from([("acc".to_owned(), 0.75)]))
    }

    fn backward(&self, _loss: f64) -> anyhow::Result<()> {
        self.record("backward");
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

/// Fixed batches per mode: 3 train, 2 val, 2 eval, 1 predict.
struct SplitProvider;

impl DataProvider for SplitProvider {
    fn fetch(&self, mode: Mode) -> anyhow::Result<Vec<Value>> {
        Ok(match mode {
            Mode::Train => vec![json!(1), json!(2), json!(3)],
            Mode::Val => vec![json!(10), json!(20)],
            Mode::Eval => vec![json!(7), json!(8)],
            Mode::Predict => vec![json!(0)],
        })
    }
}

/// Counts reductions and shifts every mean by +1.0 so the effect is visible.
struct SpyCollective {
    calls: Mutex<usize>,
}

impl SpyCollective {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(0),
        })
    }

    fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

impl Collective for SpyCollective {
    fn all_reduce_mean(&self, means: HashMap<String, f64>) -> anyhow::Result<HashMap<String, f64>> {
        *self.calls.lock().unwrap() += 1;
        Ok(means.into_iter().map(|(k, v)| (k, v + 1.0)).collect())
    }
}

fn builder() -> (PipelineBuilder, Arc<CountingDriver>, Arc<SpyCollective>) {
    let driver = CountingDriver::new();
    let collective = SpyCollective::new();
    let b = PipelineBuilder::new(driver.clone(), Arc::new(SplitProvider), collective.clone());
    (b, driver, collective)
}

fn push_trace(ctx: &mut Context, tag: &str) {
    let mut entries = ctx
        .get("trace")
        .and_then(|v| v.as_array().cloned())
        .unwrap_or_default();
    entries.push(json!(tag));
    ctx.set("trace", Value::Array(entries));
}

fn trace(ctx: &Context) -> Vec<String> {
    ctx.get("trace")
        .and_then(|v| v.as_array().cloned())
        .unwrap_or_default()
        .iter()
        .filter_map(|v| v.as_str().map(str::to_owned))
        .collect()
}

fn tracer(tag: &'static str) -> HandlerSpec {
    HandlerSpec::leaf(
        StageKind::Task,
        FnStage::new(move |ctx: &mut Context| {
            push_trace(ctx, tag);
            Ok(Control::Advance)
        }),
    )
    .with_id(tag)
}

fn materialize(spec: HandlerSpec) -> HandlerTree {
    let mut ids = IdFactory::new();
    HandlerTree::materialize(spec, &mut ids)
}

// ---------------------------------------------------------------------------
// Test 1: Standard train pipeline, two epochs
// ---------------------------------------------------------------------------

#[test]
fn train_pipeline_runs_two_epochs_end_to_end() {
    init_tracing();
    let (mut b, driver, _) = builder();
    b = b.with_plan(RunPlan { epochs: 2 });
    let tree = b.build_train();
    let mut ctx = b.context(0, 1);

    let report = run(&tree, &mut ctx).expect("train run should succeed");

    let modes: Vec<String> = driver
        .calls()
        .into_iter()
        .filter(|c| c.starts_with("set_mode:"))
        .collect();
    assert_eq!(
        modes,
        vec!["set_mode:train", "set_mode:val", "set_mode:train", "set_mode:val"],
        "each epoch is one train pass then one val pass"
    );

    // 2 epochs x (3 train + 2 val) batches.
    assert_eq!(driver.count_of("forward"), 10);
    assert_eq!(driver.count_of("loss"), 10);
    assert_eq!(driver.count_of("metrics"), 10);
    // Gradients only flow in the train pass.
    assert_eq!(driver.count_of("backward"), 6);
    assert_eq!(driver.count_of("optim_step"), 6);
    assert_eq!(driver.count_of("decay_lr"), 2);

    let train_means = ctx.meters.means(Mode::Train);
    assert_eq!(train_means.get("loss"), Some(&0.5));
    assert_eq!(train_means.get("acc"), Some(&0.75));
    let val_means = ctx.meters.means(Mode::Val);
    assert_eq!(
        val_means.get("val_loss"),
        Some(&0.5),
        "val means carry the val_ prefix"
    );

    assert_eq!(ctx.mode, Mode::Val, "the run ends in the val pass");
    assert_eq!(ctx.schedule.current_epoch, 1);
    assert!(ctx.display.is_empty(), "all progress handles must be detached");
    assert_eq!(report.skipped, 0);
    assert!(report.invoked > 0);
}

// ---------------------------------------------------------------------------
// Test 2: Standard eval and predict pipelines
// ---------------------------------------------------------------------------

#[test]
fn eval_and_predict_pipelines_run_end_to_end() {
    init_tracing();
    let (mut b, driver, _) = builder();

    let tree = b.build_eval();
    let mut ctx = b.context(0, 1);
    run(&tree, &mut ctx).expect("eval run should succeed");

    assert_eq!(driver.count_of("forward"), 2);
    assert_eq!(driver.count_of("backward"), 0, "no gradients in eval");
    assert_eq!(
        ctx.meters.means(Mode::Eval).get("loss"),
        Some(&0.5),
        "eval means carry no prefix"
    );
    assert_eq!(ctx.mode, Mode::Eval);

    let tree = b.build_predict();
    let mut ctx = b.context(0, 1);
    run(&tree, &mut ctx).expect("predict run should succeed");

    assert_eq!(driver.count_of("forward"), 3, "one more batch from predict");
    assert_eq!(driver.count_of("loss"), 2, "prediction computes no loss");
    assert!(ctx.meters.is_empty(Mode::Predict));
    assert_eq!(ctx.mode, Mode::Predict);
}

// ---------------------------------------------------------------------------
// Test 3: Break and Continue across nested groups
// ---------------------------------------------------------------------------

#[test]
fn break_aborts_only_the_innermost_group() {
    init_tracing();
    let breaker = HandlerSpec::leaf(
        StageKind::Task,
        FnStage::new(|ctx: &mut Context| {
            push_trace(ctx, "breaker");
            Ok(Control::Break)
        }),
    )
    .with_id("breaker");

    let tree = materialize(HandlerSpec::sequence(vec![
        tracer("before"),
        HandlerSpec::sequence(vec![
            HandlerSpec::sequence(vec![breaker, tracer("unreached")]).with_id("innermost"),
            tracer("mid_sibling"),
        ])
        .with_id("middle"),
        tracer("after"),
    ]));
    let mut ctx = Context::single_process();

    run(&tree, &mut ctx).expect("break never fails a run");
    assert_eq!(
        trace(&ctx),
        vec!["before", "breaker", "mid_sibling", "after"],
        "only the innermost group is cut; both ancestors resume"
    );
}

#[test]
fn continue_skips_to_the_next_batch() {
    init_tracing();
    let skipper = HandlerSpec::leaf(
        StageKind::Task,
        FnStage::new(|ctx: &mut Context| {
            push_trace(ctx, &format!("seen_{}", ctx.step.index));
            if ctx.step.index == 0 {
                Ok(Control::Continue)
            } else {
                Ok(Control::Advance)
            }
        }),
    )
    .with_id("skipper");

    let tree = materialize(HandlerSpec::group(
        StageKind::BatchLoop,
        vec![skipper, tracer("tail")],
    ));
    let mut ctx = Context::single_process();
    ctx.dataset = vec![json!("a"), json!("b")];

    run(&tree, &mut ctx).expect("continue never fails a run");
    assert_eq!(
        trace(&ctx),
        vec!["seen_0", "seen_1", "tail"],
        "batch 0 skips its tail, batch 1 runs in full"
    );
}

// ---------------------------------------------------------------------------
// Test 4: Early stopping injected into the stock train tree
// ---------------------------------------------------------------------------

#[test]
fn injected_early_stop_terminates_the_run() {
    init_tracing();
    let (mut b, driver, _) = builder();
    b = b.with_plan(RunPlan { epochs: 5 });
    let mut tree = b.build_train();

    let stop = HandlerSpec::leaf(
        StageKind::Task,
        FnStage::new(|ctx: &mut Context| {
            if ctx.schedule.current_epoch >= 1 {
                Ok(Control::Terminate)
            } else {
                Ok(Control::Advance)
            }
        }),
    )
    .with_id("early_stop");

    let anchor = tree.find_by_id("train_iteration_val").expect("val loop exists");
    let mut ids = IdFactory::new();
    let stop = tree.create(stop, &mut ids);
    assert!(tree.insert_after(anchor, stop));

    let mut ctx = b.context(0, 1);
    let err = run(&tree, &mut ctx).expect_err("the stop node must abort the run");
    match err {
        FlywheelError::Terminated { origin } => assert_eq!(origin, "early_stop"),
        other => panic!("expected Terminated, got {other:?}"),
    }
    assert_eq!(driver.count_of("decay_lr"), 2, "epochs 2..4 never happen");
}

// ---------------------------------------------------------------------------
// Test 5: Distributed launch reduces meters through the collective
// ---------------------------------------------------------------------------

#[test]
fn distributed_train_run_reduces_running_means() {
    init_tracing();
    let (mut b, _, collective) = builder();
    b = b.with_launch(LaunchMode::Distributed);
    let tree = b.build_train();

    assert!(tree.find_by_id("gather_average_train").is_some());
    assert!(tree.find_by_id("gather_average_val").is_some());

    let mut ctx = b.context(0, 2);
    run(&tree, &mut ctx).expect("distributed run should succeed");

    // The gather before the first metered batch sees an empty scope and
    // skips; every later batch reduces once. 3 train + 2 val batches.
    assert_eq!(collective.calls(), 3);

    // Reduced means are folded back before each new batch lands, so the
    // final numbers differ from the vanilla 0.5/0.75 averages.
    let train_means = ctx.meters.means(Mode::Train);
    assert_eq!(train_means.get("loss"), Some(&1.25));
    assert_eq!(train_means.get("acc"), Some(&1.5));
    let val_means = ctx.meters.means(Mode::Val);
    assert_eq!(val_means.get("val_loss"), Some(&1.0));
}

// ---------------------------------------------------------------------------
// Test 6: Rank gating skips a subtree wholesale
// ---------------------------------------------------------------------------

#[test]
fn rank_gated_subtree_is_skipped_on_other_ranks() {
    init_tracing();
    let spec = || {
        HandlerSpec::sequence(vec![
            tracer("everywhere"),
            HandlerSpec::sequence(vec![tracer("rank0_only")])
                .with_id("gated")
                .with_exec_ranks(ExecRanks::only([0])),
        ])
    };

    let tree = materialize(spec());
    let mut ctx = Context::new(1, 2);
    let report = run(&tree, &mut ctx).expect("run should succeed");
    assert_eq!(trace(&ctx), vec!["everywhere"]);
    assert_eq!(report.skipped, 1, "the gated group is skipped as one unit");

    let tree = materialize(spec());
    let mut ctx = Context::new(0, 2);
    run(&tree, &mut ctx).expect("run should succeed");
    assert_eq!(trace(&ctx), vec!["everywhere", "rank0_only"]);
}

// ---------------------------------------------------------------------------
// Test 7: Failures surface the offending node
// ---------------------------------------------------------------------------

#[test]
fn stage_failure_names_the_failing_node() {
    init_tracing();
    let flaky = HandlerSpec::leaf(
        StageKind::Task,
        FnStage::new(|_: &mut Context| Err(anyhow::anyhow!("disk full"))),
    )
    .with_id("flaky");

    let tree = materialize(HandlerSpec::sequence(vec![
        tracer("ok"),
        flaky,
        tracer("unreached"),
    ]));
    let mut ctx = Context::single_process();

    let err = run(&tree, &mut ctx).expect_err("the flaky node must fail the run");
    assert_eq!(err.node(), Some("flaky"));
    assert!(!err.is_abort(), "a stage failure is a malfunction, not a requested abort");
    match err {
        FlywheelError::StageFailed { source, .. } => {
            assert_eq!(source.to_string(), "disk full");
        }
        other => panic!("expected StageFailed, got {other:?}"),
    }
    assert_eq!(trace(&ctx), vec!["ok"], "nothing runs past the failure");
}

// ---------------------------------------------------------------------------
// Test 8: Profile walk over a built tree
// ---------------------------------------------------------------------------

#[test]
fn profile_walk_lists_the_eval_tree_breadth_first() {
    init_tracing();
    let (mut b, _, _) = builder();
    let tree = b.build_eval();

    let rows: Vec<_> = tree.profile_walk().collect();
    assert_eq!(rows.len(), tree.node_count());

    let first = &rows[0];
    assert_eq!(first.depth, 0);
    assert_eq!(first.label, "Sequence");
    assert_eq!(
        first.attrs.get("id").and_then(Value::as_str),
        Some("eval_container")
    );

    let ids: Vec<_> = rows
        .iter()
        .filter_map(|row| row.attrs.get("id").and_then(Value::as_str))
        .collect();
    assert_eq!(
        ids,
        vec![
            "eval_container",
            "eval_status",
            "eval_dataset",
            "eval_average_init",
            "eval_iteration",
            "eval_forward",
            "eval_loss",
            "eval_metrics",
            "eval_average",
            "eval_display",
        ],
        "level by level, siblings before grandchildren"
    );
    assert!(rows.iter().all(|row| row.attrs.contains_key("exec_ranks")));
}
