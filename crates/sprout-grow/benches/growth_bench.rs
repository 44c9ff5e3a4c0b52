use criterion::{black_box, criterion_group, criterion_main, Criterion};
use sprout_core::{Key, ModelTemplate};
use sprout_grow::ascent::refine_ascent;
use sprout_grow::curvature::{observe, SiteCurvature};
use sprout_grow::mala::refine_mala;
use sprout_grow::proposer::new_feature;
use sprout_grow::score::ScoreContext;
use sprout_grow::Batch;
use sprout_net::{Labels, LossFunction, Mat, MeanSquared, Network};

fn setup() -> (ModelTemplate, Network, Batch) {
    let template = ModelTemplate::with_output(vec![16, 16], vec![Some(8), None], 2).unwrap();
    let net = Network::init(&template, 4, Key::new(7)).unwrap();
    let inputs = Mat::from_fn(128, 4, |i, j| ((i * 7 + j * 3) as f64 * 0.1).sin());
    let targets = Mat::from_fn(128, 2, |i, j| ((i + j) as f64 * 0.05).cos());
    let batch = Batch::new(inputs, Labels::Targets(targets)).unwrap();
    (template, net, batch)
}

fn bench_observe(c: &mut Criterion) {
    let (_, net, batch) = setup();
    let zero = net.params.zeros_like();
    c.bench_function("observe (128 rows, 8 units)", |b| {
        b.iter(|| black_box(observe(&net, &MeanSquared, &zero, &batch).unwrap()))
    });
}

fn site(template: &ModelTemplate, net: &Network, batch: &Batch, index: usize) -> SiteCurvature {
    let zero = net.params.zeros_like();
    let snapshot = observe(net, &MeanSquared, &zero, batch).unwrap();
    let (_, out_index) = template.in_out_indices(index).unwrap();
    let trace = net.trace(&batch.inputs).unwrap();
    let (_, dloss) = MeanSquared.evaluate(&trace.output, &batch.labels).unwrap();
    let grads = net.backward(&trace, &(dloss / batch.len() as f64)).unwrap();
    let kernel_grad = grads.params.layers[out_index].as_ref().unwrap().kernel.clone();
    SiteCurvature::prepare(&snapshot, template, index, &kernel_grad, 0.1).unwrap()
}

fn bench_refine_ascent(c: &mut Criterion) {
    let (template, net, batch) = setup();
    let curvature = site(&template, &net, &batch, 0);
    let ctx = ScoreContext::new(&curvature, 0.0, curvature.baseline);
    let null = net.input_null(curvature.in_index).unwrap();
    let feature = new_feature(&null, net.input_width(0), 1, Key::new(1)).unwrap();
    c.bench_function("refine_ascent (10 steps)", |b| {
        b.iter(|| black_box(refine_ascent(&ctx, feature.clone(), 10, 0.1, 1e-2).unwrap()))
    });
}

fn bench_refine_mala(c: &mut Criterion) {
    let (template, net, batch) = setup();
    let curvature = site(&template, &net, &batch, 1);
    let ctx = ScoreContext::new(&curvature, 0.0, curvature.baseline);
    let null = net.input_null(curvature.in_index).unwrap();
    let width = net.input_width(1);
    let feature = new_feature(&null, width, width, Key::new(2)).unwrap();
    c.bench_function("refine_mala (10x10, 8x8 layer)", |b| {
        b.iter(|| black_box(refine_mala(&ctx, feature.clone(), 10, 10, 0.3, 1.0, Key::new(3)).unwrap()))
    });
}

criterion_group!(benches, bench_observe, bench_refine_ascent, bench_refine_mala);
criterion_main!(benches);
