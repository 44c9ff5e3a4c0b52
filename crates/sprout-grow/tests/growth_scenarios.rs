//! Growth cycles on small problems: one width step, one depth step, the
//! depth cost gate, and both regression policies.

use sprout_core::{Key, KeyStream, ModelTemplate, NullSink, RecordingSink, SproutError};
use sprout_grow::config::OptConfig;
use sprout_grow::growth::Modification;
use sprout_grow::proposer::verify_state;
use sprout_grow::{
    Batch, GrowthConfig, GrowthEngine, GrowthEvent, GrowthKind, RefineMethod, RegressionPolicy,
    SimpleGradient, Solver,
};
use sprout_net::{Labels, Mat, MeanSquared, Network, SoftmaxCrossEntropy};

/// Points on two rings, class 1 on the outer one.
fn rings(n: usize) -> Batch {
    let inputs = Mat::from_fn(n, 2, |i, j| {
        let radius = if i % 2 == 0 { 0.5 } else { 1.5 };
        let angle = i as f64 * 0.7;
        if j == 0 {
            radius * angle.cos()
        } else {
            radius * angle.sin()
        }
    });
    let classes = (0..n).map(|i| i % 2).collect();
    Batch::new(inputs, Labels::Classes(classes)).unwrap()
}

fn wave(n: usize) -> Batch {
    let inputs = Mat::from_fn(n, 2, |i, j| ((i * 3 + j * 5) as f64 * 0.13).sin());
    let targets = Mat::from_fn(n, 1, |i, _| (i as f64 * 0.21).cos());
    Batch::new(inputs, Labels::Targets(targets)).unwrap()
}

fn quick(config: GrowthConfig) -> GrowthConfig {
    GrowthConfig {
        proposals_per_site: 4,
        layer_proposals_per_site: 4,
        steps: 4,
        mala_steps_per_burst: 4,
        ..config
    }
}

fn width_solver() -> (Solver, Batch) {
    let template = ModelTemplate::with_output(vec![4], vec![Some(3)], 1).unwrap();
    let network = Network::init(&template, 2, Key::new(5)).unwrap();
    let mut solver = Solver::new(
        template,
        network,
        Box::new(MeanSquared),
        Box::new(SimpleGradient),
        &OptConfig::default(),
    )
    .unwrap();
    let data = wave(24);
    solver.train_batch(&data, true, &mut NullSink).unwrap();
    (solver, data)
}

#[test]
fn width_cycle_adds_one_unit_without_changing_loss() {
    let (mut solver, data) = width_solver();
    let old_null = solver.network().null(0).unwrap().to_vec();
    let mut engine = GrowthEngine::new(
        quick(GrowthConfig {
            allow_depth: false,
            thresh: -1.0,
            abs_thresh: -1.0,
            ..GrowthConfig::default()
        }),
        KeyStream::new(3),
    )
    .unwrap();
    let mut sink = RecordingSink::default();

    let event = engine
        .cycle(&mut solver, &data, &data, &data, 0, &mut sink)
        .unwrap()
        .expect("width growth");

    assert_eq!(event.kind, GrowthKind::Width);
    assert_eq!(event.site, 0);
    assert!(!event.rolled_back);
    assert_eq!(solver.template().contents(), &[Some(4), Some(1)]);
    let new_null = solver.network().null(0).unwrap();
    let flipped: Vec<usize> = (0..4).filter(|&i| old_null[i] != new_null[i]).collect();
    assert_eq!(flipped, vec![3]);
    assert!((event.loss_after - event.loss_before).abs() < 1e-12);
    assert!(event.ratio.is_finite());
    assert!(sink.get("best_proposal_0").is_some());
    assert!(sink.get("local_validation_baseline_0").is_some());
    verify_state(solver.template(), solver.network()).unwrap();
}

#[test]
fn width_cycle_respects_threshold() {
    let (mut solver, data) = width_solver();
    let before = solver.network().clone();
    let mut engine = GrowthEngine::new(
        quick(GrowthConfig {
            allow_depth: false,
            thresh: f64::MAX,
            ..GrowthConfig::default()
        }),
        KeyStream::new(3),
    )
    .unwrap();
    let event = engine
        .cycle(&mut solver, &data, &data, &data, 0, &mut NullSink)
        .unwrap();
    assert!(event.is_none());
    assert_eq!(solver.network(), &before);
}

fn depth_solver() -> (Solver, Batch) {
    let template = ModelTemplate::with_output(vec![4, 2], vec![Some(2), None], 2).unwrap();
    let network = Network::init(&template, 2, Key::new(9)).unwrap();
    let mut solver = Solver::new(
        template,
        network,
        Box::new(SoftmaxCrossEntropy),
        Box::new(SimpleGradient),
        &OptConfig::default(),
    )
    .unwrap();
    let data = rings(30);
    solver.train_batch(&data, true, &mut NullSink).unwrap();
    (solver, data)
}

fn depth_only(config: GrowthConfig) -> GrowthConfig {
    quick(GrowthConfig {
        allow_width: false,
        layer_abs_thresh: -1.0,
        depth_method: RefineMethod::Mala,
        ..config
    })
}

/// Runs one depth-only cycle on a fresh solver and returns the event and
/// the cost-adjusted ratio reported for the dormant slot.
fn depth_cycle(config: GrowthConfig) -> (Option<GrowthEvent>, f64) {
    let (mut solver, data) = depth_solver();
    let mut engine = GrowthEngine::new(depth_only(config), KeyStream::new(11)).unwrap();
    let mut sink = RecordingSink::default();
    let event = engine
        .cycle(&mut solver, &data, &data, &data, 0, &mut sink)
        .unwrap();
    (event, sink.get("adjusted_ratio_1").unwrap())
}

#[test]
fn depth_cycle_activates_dormant_slot() {
    let (mut solver, data) = depth_solver();
    let outputs_before = solver.network().forward(&data.inputs).unwrap();

    let mut engine = GrowthEngine::new(
        depth_only(GrowthConfig {
            thresh: -1.0,
            ..GrowthConfig::default()
        }),
        KeyStream::new(11),
    )
    .unwrap();
    let mut sink = RecordingSink::default();

    let event = engine
        .cycle(&mut solver, &data, &data, &data, 0, &mut sink)
        .unwrap()
        .expect("depth growth");

    assert_eq!(event.kind, GrowthKind::Depth);
    assert_eq!(event.site, 1);
    assert_eq!(solver.template().contents(), &[Some(2), Some(2), Some(2)]);
    assert!(event.loss_after / event.loss_before <= 1.2);
    assert!(sink.get("adjusted_ratio_1").is_some());
    assert!(sink.get("acceptance_rate_1").is_some());

    let outputs_after = solver.network().forward(&data.inputs).unwrap();
    assert!((outputs_after - outputs_before).abs().max() < 1e-7);
    verify_state(solver.template(), solver.network()).unwrap();
}

#[test]
fn depth_cost_scales_the_gate() {
    let (event, free) = depth_cycle(GrowthConfig {
        thresh: -1.0,
        ..GrowthConfig::default()
    });
    assert!(event.is_some());
    assert!(free > 0.0);

    // The slot reads 2 inputs, so size costing halves the ratio like a cost of 2.
    let thresh = 0.75 * free;
    let (event, ratio) = depth_cycle(GrowthConfig {
        thresh,
        ..GrowthConfig::default()
    });
    assert_eq!(event.map(|e| e.kind), Some(GrowthKind::Depth));
    assert_eq!(ratio, free);

    let (event, sized) = depth_cycle(GrowthConfig {
        thresh,
        size_costing: true,
        ..GrowthConfig::default()
    });
    assert!(event.is_none());
    assert!((sized - free / 2.0).abs() <= 1e-12 * free);

    let (event, scaled) = depth_cycle(GrowthConfig {
        thresh,
        layer_cost_mul: 2.0,
        ..GrowthConfig::default()
    });
    assert!(event.is_none());
    assert!((scaled - free / 2.0).abs() <= 1e-12 * free);
}

#[test]
fn cycle_needs_an_observed_gradient() {
    let template = ModelTemplate::with_output(vec![4], vec![Some(3)], 1).unwrap();
    let network = Network::init(&template, 2, Key::new(5)).unwrap();
    let mut solver = Solver::new(
        template,
        network,
        Box::new(MeanSquared),
        Box::new(SimpleGradient),
        &OptConfig::default(),
    )
    .unwrap();
    let data = wave(8);
    let mut engine = GrowthEngine::new(GrowthConfig::default(), KeyStream::new(0)).unwrap();
    let err = engine
        .cycle(&mut solver, &data, &data, &data, 0, &mut NullSink)
        .unwrap_err();
    assert!(matches!(err, SproutError::Invariant { .. }));
}

fn worse_modification(solver: &Solver) -> Modification {
    let mut network = solver.network().clone();
    if let Some(out) = network.layer_mut(1) {
        out.bias.add_scalar_mut(100.0);
    }
    Modification {
        kind: GrowthKind::Width,
        site: 0,
        ratio: 2.0,
        template: solver.template().clone(),
        network,
    }
}

#[test]
fn regression_aborts_by_default() {
    let (mut solver, data) = width_solver();
    let before_growth = solver.network().clone();
    let mut engine = GrowthEngine::new(GrowthConfig::default(), KeyStream::new(0)).unwrap();
    let m = worse_modification(&solver);
    let grown = m.network.clone();
    let err = engine.apply(&mut solver, m, &data, 4, &mut NullSink).unwrap_err();
    assert!(err.is_fatal());
    match err {
        SproutError::Regression {
            site,
            before,
            after,
            limit,
            before_state,
            after_state,
        } => {
            assert_eq!(site, 0);
            assert!(after > before);
            assert_eq!(limit, 1.001);

            let dumped: serde_json::Value = serde_json::from_str(&before_state).unwrap();
            assert_eq!(dumped["contents"], serde_json::json!([3, 1]));
            let network: Network = serde_json::from_value(dumped["network"].clone()).unwrap();
            assert_eq!(network, before_growth);

            let dumped: serde_json::Value = serde_json::from_str(&after_state).unwrap();
            let network: Network = serde_json::from_value(dumped["network"].clone()).unwrap();
            assert_eq!(network, grown);
        }
        other => panic!("expected a regression error, got {other:?}"),
    }
}

#[test]
fn rollback_restores_network_and_cools_site() {
    let (mut solver, data) = width_solver();
    let before_growth = solver.network().clone();
    let mut engine = GrowthEngine::new(
        GrowthConfig {
            on_regression: RegressionPolicy::Rollback,
            rollback_cooldown: 5,
            ..GrowthConfig::default()
        },
        KeyStream::new(0),
    )
    .unwrap();
    let m = worse_modification(&solver);

    let event = engine.apply(&mut solver, m, &data, 4, &mut NullSink).unwrap();

    assert!(event.rolled_back);
    assert!(event.loss_after > event.loss_before);
    assert_eq!(solver.network(), &before_growth);
    assert!(solver.last_ngrad().is_some());
    assert!(engine.is_cooling(0, 8));
    assert!(!engine.is_cooling(0, 9));
    assert!(!engine.is_cooling(1, 4));
}
