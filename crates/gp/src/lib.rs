//! This library implements composable [Gaussian Process](https://en.wikipedia.org/wiki/Gaussian_process)
//! models for geostatistics, fitted to scattered observations and queried with
//! [Kriging](https://en.wikipedia.org/wiki/Kriging).
//!
//! Covariance kernels and means are declared as nodes of a [`Graph`]: primitive
//! kernels (squared exponential, gamma exponential, Wiener, integrated kernels,
//! noise, delta, trend prior) are combined by sums, products, category mixing and
//! category multiplexing, on top of euclidean or hyperbolic metrics. Nodes refer to
//! named parameters with bounds; parameters shared by several nodes get the
//! intersection of their bounds.
//!
//! A [`Model`] couples a [`Gp`] with parameter values and supports:
//! * maximum likelihood fitting with Adam on unconstrained parameters ([`Model::fit`]),
//! * posterior sampling with replica exchange MCMC ([`Model::mcmc`]),
//! * batched kriging of values or pairs of values, with posterior mixtures ([`Model::predict`]),
//! * unconditional generation ([`Model::generate`]).
//!
//! ```
//! use geostat_gp::{Graph, Model, PredictParams};
//! use ndarray::array;
//!
//! let mut g = Graph::new();
//! let kernel = g.squared_exponential("sill", 1.0, None);
//! let nodes = g.gp(None, kernel);
//! let gp = g.build(nodes).unwrap();
//!
//! let params = [("sill".to_string(), 2.0)].into_iter().collect();
//! let model = Model::new(gp, params)
//!     .unwrap()
//!     .with_data(array![[0.], [1.], [2.]], array![1., -1., 0.5], None)
//!     .unwrap();
//! let (mean, var) = model
//!     .predict(&array![[1.]], None, &PredictParams::new())
//!     .unwrap();
//! assert!((mean[0] + 1.).abs() < 1e-6);
//! assert!(var[0].abs() < 1e-6);
//! ```
#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]
mod algorithm;
mod assembly;
mod dual;
mod errors;
mod graph;
pub mod kernels;
mod likelihood;
mod mcmc;
pub mod mean_models;
pub mod metrics;
mod optimization;
mod param;
mod parameters;
mod report;
mod utils;

pub use algorithm::*;
pub use assembly::{assemble, assemble_self, Evaluator};
pub use dual::{Dual, Dual1, Dual2, Scalar};
pub use errors::*;
pub use graph::{Gp, GpNodes, Graph, KernelId, MeanId, MetricId, Node, NodeId};
pub use kernels::Kernel;
pub use likelihood::{gaussian_log_likelihood, log_likelihood};
pub use mean_models::{Featurizer, Mean};
pub use metrics::{CoordinateTransform, Metric};
pub use param::*;
pub use parameters::*;
pub use report::*;

/// Environment variable controlling log levels of examples and benchmarks
pub const GEOSTAT_LOG: &str = "GEOSTAT_LOG";
