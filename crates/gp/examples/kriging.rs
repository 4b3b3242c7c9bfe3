use env_logger::{Builder, Env};
use geostat_gp::{FitParams, Graph, Model, PredictParams, GEOSTAT_LOG};
use ndarray::{arr1, arr2, Array, Axis};

fn main() {
    let env = Env::new().filter_or(GEOSTAT_LOG, "info");
    let mut builder = Builder::from_env(env);
    let builder = builder.target(env_logger::Target::Stdout);
    builder.try_init().ok();

    let xtrain = arr2(&[[0.0], [1.0], [2.0], [3.0], [4.0]]);
    let ytrain = arr1(&[0.0, 1.0, 1.5, 0.9, 1.0]);

    let mut g = Graph::new();
    let se = g.squared_exponential("sill", "range", None);
    let noise = g.noise("nugget");
    let kernel = g.combine_sum(se, noise);
    let nodes = g.gp(None, kernel);
    let gp = g.build(nodes).expect("GP build");

    let params = [("sill", 1.0), ("range", 1.0), ("nugget", 0.1)]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
    let model = Model::new(gp, params).expect("Model parameters");
    let fitted = model
        .fit(&xtrain, &ytrain, None, &FitParams::new().iters(200).step_size(0.05))
        .expect("Kriging fitting");
    println!("{fitted}");

    let xtest = Array::linspace(0., 4., 100).insert_axis(Axis(1));
    let (ytest, vtest) = fitted
        .predict(&xtest, None, &PredictParams::new())
        .expect("Kriging prediction");
    for i in (0..xtest.nrows()).step_by(10) {
        println!(
            "x = {:.2}: {:.3} +/- {:.3}",
            xtest[[i, 0]],
            ytest[i],
            2. * vtest[i].max(0.).sqrt()
        );
    }
}
