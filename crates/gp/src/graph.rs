//! Covariance and mean models are declared as a directed acyclic graph of
//! nodes stored in an arena ([`Graph`]) and referenced by index.
//!
//! A node refers to its inputs either through formal arguments (literals or
//! parameter names, see [`ParamRef`]), through other nodes of the same graph
//! (typed ids [`KernelId`], [`MeanId`], [`MetricId`]), or implicitly through
//! the values shared by a whole evaluation pass: the two location batches,
//! their categories, the index offset between them and the per-axis squared
//! distances computed once for every node (see [`crate::Evaluator`]).
//!
//! Nodes are immutable once added and may be shared by several parents: an
//! evaluation pass computes each node at most once whatever the number of
//! parents referring to it.
//!
//! ```
//! use geostat_gp::{params, Graph};
//!
//! let mut g = Graph::new();
//! let metric = g.euclidean(params![1., "yscale"]);
//! let se = g.squared_exponential("sill", "range", Some(metric));
//! let noise = g.noise("nugget");
//! let kernel = g.combine_sum(se, noise);
//! let nodes = g.gp(None, kernel);
//! let gp = g.build(nodes).unwrap();
//!
//! let names: Vec<String> = gp.gather_free_parameters().into_iter().map(|p| p.name).collect();
//! assert_eq!(names, vec!["nugget", "range", "sill", "yscale"]);
//! ```

use crate::dual::Scalar;
use crate::errors::{GpError, Result};
use crate::kernels::Kernel;
use crate::mean_models::{Featurizer, Mean};
use crate::metrics::{CoordinateTransform, Metric};
use crate::param::{ParamRef, ParamValues, Parameter};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

/// Index of a node in its [`Graph`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    /// Position of the node in the arena
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Id of a node computing a covariance matrix
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct KernelId(pub(crate) NodeId);

/// Id of a node computing a mean vector
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MeanId(pub(crate) NodeId);

/// Id of a node computing a squared distance matrix
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MetricId(pub(crate) NodeId);

/// A node of the graph
#[derive(Clone, Debug)]
pub enum Node {
    /// A squared distance between locations
    Metric(Metric),
    /// A covariance function
    Kernel(Kernel),
    /// A mean function
    Mean(Mean),
}

impl Node {
    fn kind(&self) -> &'static str {
        match self {
            Node::Metric(_) => "metric",
            Node::Kernel(_) => "kernel",
            Node::Mean(_) => "mean",
        }
    }

    /// Parameters referenced by the formal arguments of this node only
    pub fn own_parameters(&self) -> Vec<Parameter> {
        match self {
            Node::Metric(m) => m.parameters(),
            Node::Kernel(k) => k.parameters(),
            Node::Mean(m) => m.parameters(),
        }
    }

    /// Nodes this node takes as inputs
    pub fn children(&self) -> Vec<NodeId> {
        match self {
            Node::Metric(_) => vec![],
            Node::Kernel(k) => k.children(),
            Node::Mean(m) => m.children(),
        }
    }
}

/// A (mean, kernel) pair of nodes of the same graph
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GpNodes {
    /// Mean function
    pub mean: MeanId,
    /// Covariance function
    pub kernel: KernelId,
}

/// Arena of nodes, nodes only refer to nodes added before them
#[derive(Clone, Debug, Default)]
pub struct Graph {
    nodes: Vec<Node>,
}

impl Graph {
    /// An empty graph
    pub fn new() -> Self {
        Graph::default()
    }

    /// Number of nodes
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph has no node
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Node given its id
    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0)
    }

    fn push(&mut self, node: Node) -> NodeId {
        self.nodes.push(node);
        NodeId(self.nodes.len() - 1)
    }

    fn kernel(&mut self, kernel: Kernel) -> KernelId {
        KernelId(self.push(Node::Kernel(kernel)))
    }

    fn mean(&mut self, mean: Mean) -> MeanId {
        MeanId(self.push(Node::Mean(mean)))
    }

    /// Euclidean squared distance, axis `c` being scaled by `scale[c]`
    pub fn euclidean(&mut self, scale: Vec<ParamRef>) -> MetricId {
        MetricId(self.push(Node::Metric(Metric::Euclidean { scale })))
    }

    /// Hyperbolic squared distance computed on transformed coordinates,
    /// the first transformed axis being shifted by `zoff` (see [`Metric::Poincare`])
    pub fn poincare(
        &mut self,
        xform: CoordinateTransform,
        zoff: impl Into<ParamRef>,
        scale: Option<Vec<ParamRef>>,
    ) -> MetricId {
        MetricId(self.push(Node::Metric(Metric::Poincare {
            xform,
            zoff: zoff.into(),
            scale,
        })))
    }

    /// `sill * exp(-0.5 * d2 / range^2)`, unscaled euclidean distance when no metric is given
    pub fn squared_exponential(
        &mut self,
        sill: impl Into<ParamRef>,
        range: impl Into<ParamRef>,
        metric: Option<MetricId>,
    ) -> KernelId {
        self.kernel(Kernel::SquaredExponential {
            sill: sill.into(),
            range: range.into(),
            metric,
        })
    }

    /// `sill * exp(-(d2 / range^2)^(gamma / 2))`
    pub fn gamma_exponential(
        &mut self,
        sill: impl Into<ParamRef>,
        range: impl Into<ParamRef>,
        gamma: impl Into<ParamRef>,
        metric: Option<MetricId>,
    ) -> KernelId {
        self.kernel(Kernel::GammaExponential {
            sill: sill.into(),
            range: range.into(),
            gamma: gamma.into(),
            metric,
        })
    }

    /// Brownian motion covariance `min(x1, x2) - start` along `axis`
    pub fn wiener(&mut self, axis: usize, start: f64) -> KernelId {
        self.kernel(Kernel::Wiener { axis, start })
    }

    /// Covariance of the integral from `start` along `axis` of a squared exponential process
    pub fn int_squared_exponential(
        &mut self,
        axis: usize,
        start: f64,
        range: impl Into<ParamRef>,
    ) -> KernelId {
        self.kernel(Kernel::IntSquaredExponential {
            axis,
            start,
            range: range.into(),
        })
    }

    /// Covariance of the integral from `start` along `axis` of an exponential process
    pub fn int_exponential(
        &mut self,
        axis: usize,
        start: f64,
        range: impl Into<ParamRef>,
    ) -> KernelId {
        self.kernel(Kernel::IntExponential {
            axis,
            start,
            range: range.into(),
        })
    }

    /// Independent noise of variance `nugget`
    pub fn noise(&mut self, nugget: impl Into<ParamRef>) -> KernelId {
        self.kernel(Kernel::Noise {
            nugget: nugget.into(),
        })
    }

    /// `dsill` between points sharing the same coordinates on `axes` (all axes if none)
    pub fn delta(&mut self, dsill: impl Into<ParamRef>, axes: Option<Vec<usize>>) -> KernelId {
        self.kernel(Kernel::Delta {
            dsill: dsill.into(),
            axes,
        })
    }

    /// `alpha * <F(x1), F(x2)>`: covariance induced by a gaussian prior on trend coefficients
    pub fn trend_prior(&mut self, featurizer: Featurizer, alpha: impl Into<ParamRef>) -> KernelId {
        self.kernel(Kernel::TrendPrior {
            featurizer,
            alpha: alpha.into(),
        })
    }

    /// Sum of two kernels, nested sums are flattened
    pub fn combine_sum(&mut self, a: KernelId, b: KernelId) -> KernelId {
        let mut parts = match self.node(a.0) {
            Some(Node::Kernel(Kernel::Sum(parts))) => parts.clone(),
            _ => vec![a],
        };
        parts.push(b);
        self.kernel(Kernel::Sum(parts))
    }

    /// Elementwise product of two kernels, nested products are flattened
    pub fn combine_product(&mut self, a: KernelId, b: KernelId) -> KernelId {
        let mut parts = match self.node(a.0) {
            Some(Node::Kernel(Kernel::Product(parts))) => parts.clone(),
            _ => vec![a],
        };
        parts.push(b);
        self.kernel(Kernel::Product(parts))
    }

    /// `sum_h C_h(x_i, x_j) * w[cat_i][h] * w[cat_j][h]`, one weight row per category
    pub fn mix(&mut self, inputs: Vec<KernelId>, weights: Vec<Vec<ParamRef>>) -> KernelId {
        self.kernel(Kernel::Mix { inputs, weights })
    }

    /// Block diagonal covariance, category `c` being modeled by `inputs[c]`
    pub fn mux(&mut self, inputs: Vec<KernelId>) -> KernelId {
        self.kernel(Kernel::Mux(inputs))
    }

    /// Identically null mean
    pub fn zero_trend(&mut self) -> MeanId {
        self.mean(Mean::Zero)
    }

    /// `F(x) . beta`
    pub fn trend(&mut self, featurizer: Featurizer, beta: Vec<ParamRef>) -> MeanId {
        self.mean(Mean::Trend { featurizer, beta })
    }

    /// Sum of two means, nested sums are flattened
    pub fn mean_sum(&mut self, a: MeanId, b: MeanId) -> MeanId {
        let mut parts = match self.node(a.0) {
            Some(Node::Mean(Mean::Sum(parts))) => parts.clone(),
            _ => vec![a],
        };
        parts.push(b);
        self.mean(Mean::Sum(parts))
    }

    /// `sum_h w[cat_i][h] * m_h(x_i)`, one weight row per category
    pub fn mean_mix(&mut self, inputs: Vec<MeanId>, weights: Vec<Vec<ParamRef>>) -> MeanId {
        self.mean(Mean::Mix { inputs, weights })
    }

    /// Category `c` mean is given by `inputs[c]`
    pub fn mean_mux(&mut self, inputs: Vec<MeanId>) -> MeanId {
        self.mean(Mean::Mux(inputs))
    }

    /// Gaussian process given its kernel and its mean (null mean if none)
    pub fn gp(&mut self, mean: Option<MeanId>, kernel: KernelId) -> GpNodes {
        let mean = mean.unwrap_or_else(|| self.zero_trend());
        GpNodes { mean, kernel }
    }

    /// Sum of two gaussian processes: means and kernels add independently
    pub fn gp_sum(&mut self, a: GpNodes, b: GpNodes) -> GpNodes {
        GpNodes {
            mean: self.mean_sum(a.mean, b.mean),
            kernel: self.combine_sum(a.kernel, b.kernel),
        }
    }

    /// Categories share latent processes `inputs` with loadings given by weight rows.
    /// Without weights, category `c` loads `inputs[c]` alone with a unit weight.
    pub fn gp_mix(&mut self, inputs: &[GpNodes], weights: Option<Vec<Vec<ParamRef>>>) -> GpNodes {
        let weights = weights.unwrap_or_else(|| identity_weights(inputs.len()));
        let means = inputs.iter().map(|gp| gp.mean).collect();
        let kernels = inputs.iter().map(|gp| gp.kernel).collect();
        GpNodes {
            mean: self.mean_mix(means, weights.clone()),
            kernel: self.mix(kernels, weights),
        }
    }

    /// Category `c` follows the independent process `inputs[c]`
    pub fn gp_mux(&mut self, inputs: &[GpNodes]) -> GpNodes {
        let means = inputs.iter().map(|gp| gp.mean).collect();
        let kernels = inputs.iter().map(|gp| gp.kernel).collect();
        GpNodes {
            mean: self.mean_mux(means),
            kernel: self.mux(kernels),
        }
    }

    fn expect_kind(&self, parent: usize, child: NodeId, kind: &str) -> Result<()> {
        if child.0 >= parent {
            return Err(GpError::InvalidValueError(format!(
                "Node {parent} refers to node {} which is not defined before it",
                child.0
            )));
        }
        let found = self.nodes[child.0].kind();
        if found != kind {
            return Err(GpError::InvalidValueError(format!(
                "Node {parent} expects a {kind} node as input, node {} is a {found}",
                child.0
            )));
        }
        Ok(())
    }

    fn check_weights(i: usize, n_inputs: usize, weights: &[Vec<ParamRef>]) -> Result<()> {
        if n_inputs == 0 || weights.is_empty() {
            return Err(GpError::InvalidValueError(format!(
                "Mix node {i} needs at least one input and one weight row"
            )));
        }
        if let Some(row) = weights.iter().find(|row| row.len() != n_inputs) {
            return Err(GpError::InvalidValueError(format!(
                "Mix node {i} has {n_inputs} inputs but a weight row of length {}",
                row.len()
            )));
        }
        Ok(())
    }

    /// Checks node wiring: inputs defined before their parents and of the expected kind
    pub fn validate(&self) -> Result<()> {
        for (i, node) in self.nodes.iter().enumerate() {
            match node {
                Node::Metric(Metric::Euclidean { scale }) if scale.is_empty() => {
                    return Err(GpError::InvalidValueError(format!(
                        "Euclidean metric {i} has an empty scale"
                    )));
                }
                Node::Metric(_) => (),
                Node::Kernel(kernel) => {
                    match kernel {
                        Kernel::Sum(parts) | Kernel::Product(parts) | Kernel::Mux(parts)
                            if parts.is_empty() =>
                        {
                            return Err(GpError::InvalidValueError(format!(
                                "Kernel combinator {i} has no input"
                            )));
                        }
                        Kernel::Mix { inputs, weights } => {
                            Self::check_weights(i, inputs.len(), weights)?
                        }
                        _ => (),
                    }
                    if let Some(m) = kernel.metric() {
                        self.expect_kind(i, m.0, "metric")?;
                    }
                    for child in kernel.inputs() {
                        self.expect_kind(i, child.0, "kernel")?;
                    }
                }
                Node::Mean(mean) => {
                    match mean {
                        Mean::Sum(parts) | Mean::Mux(parts) if parts.is_empty() => {
                            return Err(GpError::InvalidValueError(format!(
                                "Mean combinator {i} has no input"
                            )));
                        }
                        Mean::Mix { inputs, weights } => {
                            Self::check_weights(i, inputs.len(), weights)?
                        }
                        _ => (),
                    }
                    for child in mean.inputs() {
                        self.expect_kind(i, child.0, "mean")?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Collects every parameter reference reachable from `roots`.
    /// Shared nodes are visited once.
    pub fn gather_free_parameters(&self, roots: &[NodeId]) -> Vec<Parameter> {
        let mut seen = HashSet::new();
        let mut params = vec![];
        for root in roots {
            self.gather(*root, &mut seen, &mut params);
        }
        params
    }

    fn gather(&self, id: NodeId, seen: &mut HashSet<NodeId>, params: &mut Vec<Parameter>) {
        if !seen.insert(id) {
            return;
        }
        if let Some(node) = self.node(id) {
            params.extend(node.own_parameters());
            for child in node.children() {
                self.gather(child, seen, params);
            }
        }
    }

    /// Freezes the graph into a gaussian process after checking its wiring
    pub fn build(self, nodes: GpNodes) -> Result<Gp> {
        self.validate()?;
        if !matches!(self.node(nodes.mean.0), Some(Node::Mean(_)))
            || !matches!(self.node(nodes.kernel.0), Some(Node::Kernel(_)))
        {
            return Err(GpError::InvalidValueError(
                "Gaussian process root nodes do not belong to the graph".to_string(),
            ));
        }
        Ok(Gp {
            graph: Arc::new(self),
            mean: nodes.mean,
            kernel: nodes.kernel,
        })
    }

    pub(crate) fn kernel_node(&self, id: KernelId) -> Result<&Kernel> {
        match self.node(id.0) {
            Some(Node::Kernel(k)) => Ok(k),
            _ => Err(GpError::InvalidValueError(format!(
                "Node {} is not a kernel",
                id.0 .0
            ))),
        }
    }

    pub(crate) fn mean_node(&self, id: MeanId) -> Result<&Mean> {
        match self.node(id.0) {
            Some(Node::Mean(m)) => Ok(m),
            _ => Err(GpError::InvalidValueError(format!(
                "Node {} is not a mean",
                id.0 .0
            ))),
        }
    }

    pub(crate) fn metric_node(&self, id: MetricId) -> Result<&Metric> {
        match self.node(id.0) {
            Some(Node::Metric(m)) => Ok(m),
            _ => Err(GpError::InvalidValueError(format!(
                "Node {} is not a metric",
                id.0 .0
            ))),
        }
    }

    /// Regularization penalty of the kernel `id`
    pub fn regularization(
        &self,
        id: KernelId,
        params: &ParamValues,
        with_grad: bool,
    ) -> Result<Scalar> {
        self.kernel_node(id)?.reg(self, params, with_grad)
    }
}

/// Unit loading of category `c` on input `c` only
fn identity_weights(n: usize) -> Vec<Vec<ParamRef>> {
    (0..n)
        .map(|c| (0..n).map(|h| ParamRef::from(if c == h { 1. } else { 0. })).collect())
        .collect()
}

/// Resolves a formal argument against parameter values.
/// Named parameters carry a unit derivative when `with_grad` is set.
pub(crate) fn resolve(p: &ParamRef, params: &ParamValues, with_grad: bool) -> Result<Scalar> {
    match p {
        ParamRef::Literal(v) => Ok(Scalar::constant(*v)),
        ParamRef::Named(name) => {
            let v = params
                .get(name)
                .copied()
                .ok_or_else(|| GpError::ParameterError(format!("Parameter `{name}` is missing")))?;
            Ok(if with_grad {
                Scalar::variable(name, v)
            } else {
                Scalar::constant(v)
            })
        }
    }
}

/// A gaussian process: a frozen graph with its mean and kernel roots
#[derive(Clone, Debug)]
pub struct Gp {
    graph: Arc<Graph>,
    mean: MeanId,
    kernel: KernelId,
}

impl Gp {
    /// Underlying graph
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Mean root
    pub fn mean(&self) -> MeanId {
        self.mean
    }

    /// Kernel root
    pub fn kernel(&self) -> KernelId {
        self.kernel
    }

    /// Every parameter reference of the mean and kernel trees
    pub fn gather_free_parameters(&self) -> Vec<Parameter> {
        let mut params = self
            .graph
            .gather_free_parameters(&[self.mean.0, self.kernel.0]);
        params.sort_by(|a, b| a.name.cmp(&b.name));
        params
    }

    /// Names of the parameters of the model
    pub fn parameter_names(&self) -> BTreeSet<String> {
        self.gather_free_parameters()
            .into_iter()
            .map(|p| p.name)
            .collect()
    }

    /// Regularization penalty, sum of the kernel ranges
    pub fn reg(&self, params: &ParamValues, with_grad: bool) -> Result<Scalar> {
        self.graph.regularization(self.kernel, params, with_grad)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params;
    use crate::param::Bound;

    #[test]
    fn test_sum_flattening() {
        let mut g = Graph::new();
        let a = g.noise("n1");
        let b = g.noise("n2");
        let c = g.noise("n3");
        let ab = g.combine_sum(a, b);
        let abc = g.combine_sum(ab, c);
        match g.node(abc.0) {
            Some(Node::Kernel(Kernel::Sum(parts))) => assert_eq!(parts, &vec![a, b, c]),
            _ => panic!("expected a flattened sum"),
        }
        // `ab` is left untouched as it may be shared
        match g.node(ab.0) {
            Some(Node::Kernel(Kernel::Sum(parts))) => assert_eq!(parts.len(), 2),
            _ => panic!("expected a sum"),
        }
        let p = g.combine_product(a, b);
        let pc = g.combine_product(p, c);
        match g.node(pc.0) {
            Some(Node::Kernel(Kernel::Product(parts))) => assert_eq!(parts.len(), 3),
            _ => panic!("expected a flattened product"),
        }
    }

    #[test]
    fn test_gather_shared_nodes() {
        let mut g = Graph::new();
        let metric = g.euclidean(params![1., "zscale"]);
        let k1 = g.squared_exponential("sill", "range", Some(metric));
        let k2 = g.gamma_exponential("sill", "range2", "gamma", Some(metric));
        let k = g.combine_sum(k1, k2);
        let nodes = g.gp(None, k);
        let gp = g.build(nodes).unwrap();
        let params = gp.gather_free_parameters();
        // `zscale` is only reported once although its metric is shared
        assert_eq!(params.iter().filter(|p| p.name == "zscale").count(), 1);
        // `sill` is referenced by two kernels
        assert_eq!(params.iter().filter(|p| p.name == "sill").count(), 2);
        let gamma = params.iter().find(|p| p.name == "gamma").unwrap();
        assert_eq!(gamma.bound, Bound::new(0., 2.));
        assert_eq!(
            gp.parameter_names().into_iter().collect::<Vec<_>>(),
            vec!["gamma", "range", "range2", "sill", "zscale"]
        );
    }

    #[test]
    fn test_invalid_wiring() {
        let mut g = Graph::new();
        let n = g.noise(1.);
        let _ = g.mix(vec![n], vec![params![1., 2.]]);
        let nodes = g.gp(None, n);
        assert!(g.build(nodes).is_err());

        let mut g = Graph::new();
        let m = g.euclidean(vec![]);
        let k = g.squared_exponential(1., 1., Some(m));
        let nodes = g.gp(None, k);
        assert!(g.build(nodes).is_err());
    }

    #[test]
    fn test_gp_composition() {
        let mut g = Graph::new();
        let k1 = g.noise("n1");
        let k2 = g.noise("n2");
        let a = g.gp(None, k1);
        let b = g.gp(None, k2);
        let mixed = g.gp_mix(&[a, b], Some(vec![params![1., 0.], params![0.5, "c"]]));
        let muxed = g.gp_mux(&[a, b]);
        let both = g.gp_sum(mixed, muxed);
        let gp = g.build(both).unwrap();
        assert_eq!(
            gp.parameter_names().into_iter().collect::<Vec<_>>(),
            vec!["c", "n1", "n2"]
        );
    }

    #[test]
    fn test_gp_mix_default_weights() {
        let mut g = Graph::new();
        let inputs: Vec<GpNodes> = ["n0", "n1", "n2"]
            .iter()
            .map(|&name| {
                let k = g.noise(name);
                g.gp(None, k)
            })
            .collect();
        let mixed = g.gp_mix(&inputs, None);
        let expected = vec![params![1., 0., 0.], params![0., 1., 0.], params![0., 0., 1.]];
        match g.node(mixed.kernel.0) {
            Some(Node::Kernel(Kernel::Mix { weights, .. })) => assert_eq!(weights, &expected),
            _ => panic!("expected a mix kernel"),
        }
        match g.node(mixed.mean.0) {
            Some(Node::Mean(Mean::Mix { weights, .. })) => assert_eq!(weights, &expected),
            _ => panic!("expected a mix mean"),
        }
        let gp = g.build(mixed).unwrap();
        assert_eq!(gp.parameter_names().len(), 3);
    }
}
