use criterion::{criterion_group, criterion_main, Criterion};
use env_logger::{Builder, Env};
use geostat_gp::{FitParams, Graph, Model, ParamValues, PredictParams, GEOSTAT_LOG};
use ndarray::{Array2, Axis};
use ndarray_rand::rand::SeedableRng;
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand_xoshiro::Xoshiro256Plus;

fn model() -> Model {
    let mut g = Graph::new();
    let se = g.squared_exponential("sill", "range", None);
    let noise = g.noise("nugget");
    let kernel = g.combine_sum(se, noise);
    let nodes = g.gp(None, kernel);
    let gp = g.build(nodes).expect("GP build error");
    let params: ParamValues = [("sill", 1.), ("range", 0.3), ("nugget", 0.1)]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
    Model::new(gp, params).expect("Model error").verbose(false)
}

fn criterion_gp(c: &mut Criterion) {
    let env = Env::new().filter_or(GEOSTAT_LOG, "error");
    let mut builder = Builder::from_env(env);
    let builder = builder.target(env_logger::Target::Stdout);
    builder.try_init().ok();

    let nts = [100, 300];
    let mut group = c.benchmark_group("gp");
    group.sample_size(20);
    for nt in nts {
        let mut rng = Xoshiro256Plus::seed_from_u64(42);
        let locs = Array2::random_using((nt, 2), Uniform::new(-1., 1.), &mut rng);
        let vals = locs.map_axis(Axis(1), |x| (3f64 * x[0]).sin() * x[1]);
        let queries = Array2::random_using((nt, 2), Uniform::new(-1., 1.), &mut rng);
        let m = model();

        group.bench_function(format!("fit {nt}"), |b| {
            b.iter(|| {
                std::hint::black_box(
                    m.fit(&locs, &vals, None, &FitParams::new().iters(10))
                        .expect("GP fit error"),
                )
            });
        });

        let conditioned = m
            .clone()
            .with_data(locs.clone(), vals.clone(), None)
            .expect("GP data error");
        group.bench_function(format!("predict {nt}"), |b| {
            b.iter(|| {
                std::hint::black_box(
                    conditioned
                        .predict(&queries, None, &PredictParams::new())
                        .expect("GP predict error"),
                )
            });
        });
    }
    group.finish();
}

criterion_group!(benches, criterion_gp);
criterion_main!(benches);
