//! Evaluation of a gaussian process graph on two batches of locations.
//!
//! An [`Evaluator`] holds the values shared by every node of one evaluation
//! pass (locations, categories, offset, per-axis squared distances) and
//! caches node results by node id so that shared nodes are computed once.

use crate::dual::{Dual, Dual1, Dual2, Scalar};
use crate::errors::{GpError, Result};
use crate::graph::{resolve, Gp, Graph, KernelId, MeanId, MetricId, NodeId};
use crate::param::{ParamRef, ParamValues};
use crate::utils::{per_axis_dist2, zero_cats};
use ndarray::{s, Array3, ArrayView1, ArrayView2, Axis};
use std::cell::{OnceCell, RefCell};
use std::collections::HashMap;
use std::ops::Range;
use std::rc::Rc;

#[derive(Clone)]
enum Cached {
    Matrix(Rc<Dual2>),
    Vector(Rc<Dual1>),
}

/// Shared inputs and node cache of one evaluation pass.
///
/// Location `i` of the first batch and location `j` of the second batch
/// are the same point when `i == j + offset`.
pub struct Evaluator<'a> {
    graph: &'a Graph,
    params: &'a ParamValues,
    with_grad: bool,
    locs1: ArrayView2<'a, f64>,
    locs2: ArrayView2<'a, f64>,
    cats1: ArrayView1<'a, usize>,
    cats2: ArrayView1<'a, usize>,
    offset: isize,
    per_axis_dist2: OnceCell<Array3<f64>>,
    euclidean: OnceCell<Rc<Dual2>>,
    cache: RefCell<HashMap<NodeId, Cached>>,
}

impl<'a> Evaluator<'a> {
    /// Checks batch shapes and builds an evaluator with an empty cache.
    /// When `with_grad` is set, results carry derivatives with respect to every named parameter.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        graph: &'a Graph,
        params: &'a ParamValues,
        with_grad: bool,
        locs1: ArrayView2<'a, f64>,
        cats1: ArrayView1<'a, usize>,
        locs2: ArrayView2<'a, f64>,
        cats2: ArrayView1<'a, usize>,
        offset: isize,
    ) -> Result<Self> {
        if locs1.ncols() != locs2.ncols() {
            return Err(GpError::InvalidValueError(format!(
                "Location batches have {} and {} dimensions",
                locs1.ncols(),
                locs2.ncols()
            )));
        }
        if cats1.len() != locs1.nrows() || cats2.len() != locs2.nrows() {
            return Err(GpError::InvalidValueError(
                "Categories and locations have different lengths".to_string(),
            ));
        }
        Ok(Evaluator {
            graph,
            params,
            with_grad,
            locs1,
            locs2,
            cats1,
            cats2,
            offset,
            per_axis_dist2: OnceCell::new(),
            euclidean: OnceCell::new(),
            cache: RefCell::new(HashMap::new()),
        })
    }

    /// Evaluator restricted to rows `r1` of the first batch and `r2` of the second batch,
    /// with its own cache
    pub fn segment(&self, r1: Range<usize>, r2: Range<usize>, offset: isize) -> Evaluator<'a> {
        Evaluator {
            graph: self.graph,
            params: self.params,
            with_grad: self.with_grad,
            locs1: self.locs1.slice_move(s![r1.clone(), ..]),
            locs2: self.locs2.slice_move(s![r2.clone(), ..]),
            cats1: self.cats1.slice_move(s![r1]),
            cats2: self.cats2.slice_move(s![r2]),
            offset,
            per_axis_dist2: OnceCell::new(),
            euclidean: OnceCell::new(),
            cache: RefCell::new(HashMap::new()),
        }
    }

    /// Graph being evaluated
    pub fn graph(&self) -> &'a Graph {
        self.graph
    }

    /// First location batch
    pub fn locs1(&self) -> ArrayView2<'a, f64> {
        self.locs1
    }

    /// Second location batch
    pub fn locs2(&self) -> ArrayView2<'a, f64> {
        self.locs2
    }

    /// Categories of the first batch
    pub fn cats1(&self) -> ArrayView1<'a, usize> {
        self.cats1
    }

    /// Categories of the second batch
    pub fn cats2(&self) -> ArrayView1<'a, usize> {
        self.cats2
    }

    /// Index offset between batches
    pub fn offset(&self) -> isize {
        self.offset
    }

    /// Squared differences of shape (n1, n2, ndim), computed on first use
    pub fn per_axis_dist2(&self) -> &Array3<f64> {
        self.per_axis_dist2
            .get_or_init(|| per_axis_dist2(&self.locs1, &self.locs2))
    }

    /// Value of a formal argument
    pub fn param(&self, p: &ParamRef) -> Result<Scalar> {
        resolve(p, self.params, self.with_grad)
    }

    /// Squared distances given by `metric`, unscaled euclidean if none
    pub fn distance(&self, metric: Option<MetricId>) -> Result<Rc<Dual2>> {
        match metric {
            None => Ok(self
                .euclidean
                .get_or_init(|| {
                    Rc::new(Dual::constant(self.per_axis_dist2().sum_axis(Axis(2))))
                })
                .clone()),
            Some(id) => {
                if let Some(Cached::Matrix(d2)) = self.cache.borrow().get(&id.0) {
                    return Ok(d2.clone());
                }
                let d2 = Rc::new(self.graph.metric_node(id)?.evaluate(self)?);
                self.cache
                    .borrow_mut()
                    .insert(id.0, Cached::Matrix(d2.clone()));
                Ok(d2)
            }
        }
    }

    /// Covariance matrix of shape (n1, n2) given by kernel `id`
    pub fn kernel(&self, id: KernelId) -> Result<Rc<Dual2>> {
        if let Some(Cached::Matrix(k)) = self.cache.borrow().get(&id.0) {
            return Ok(k.clone());
        }
        let k = Rc::new(self.graph.kernel_node(id)?.evaluate(self)?);
        self.cache
            .borrow_mut()
            .insert(id.0, Cached::Matrix(k.clone()));
        Ok(k)
    }

    /// Mean vector of the first batch given by mean `id`
    pub fn mean(&self, id: MeanId) -> Result<Rc<Dual1>> {
        if let Some(Cached::Vector(m)) = self.cache.borrow().get(&id.0) {
            return Ok(m.clone());
        }
        let m = Rc::new(self.graph.mean_node(id)?.evaluate(self)?);
        self.cache
            .borrow_mut()
            .insert(id.0, Cached::Vector(m.clone()));
        Ok(m)
    }
}

fn unwrap_rc<T: Clone>(rc: Rc<T>) -> T {
    Rc::try_unwrap(rc).unwrap_or_else(|rc| (*rc).clone())
}

/// Mean of the first batch and covariance between both batches of the gaussian process.
///
/// Categories default to zero. Per-category nodes need categories sorted in
/// non descending order within each batch.
#[allow(clippy::too_many_arguments)]
pub fn assemble(
    gp: &Gp,
    locs1: &ArrayView2<f64>,
    cats1: Option<&ArrayView1<usize>>,
    locs2: &ArrayView2<f64>,
    cats2: Option<&ArrayView1<usize>>,
    offset: isize,
    params: &ParamValues,
    with_grad: bool,
) -> Result<(Dual1, Dual2)> {
    let default1 = zero_cats(locs1.nrows());
    let default2 = zero_cats(locs2.nrows());
    let cats1 = cats1.map(|c| c.view()).unwrap_or_else(|| default1.view());
    let cats2 = cats2.map(|c| c.view()).unwrap_or_else(|| default2.view());
    let ev = Evaluator::new(
        gp.graph(),
        params,
        with_grad,
        locs1.view(),
        cats1,
        locs2.view(),
        cats2,
        offset,
    )?;
    let mean = ev.mean(gp.mean())?;
    let cov = ev.kernel(gp.kernel())?;
    drop(ev);
    Ok((unwrap_rc(mean), unwrap_rc(cov)))
}

/// Mean and covariance of a single batch with itself
pub fn assemble_self(
    gp: &Gp,
    locs: &ArrayView2<f64>,
    cats: Option<&ArrayView1<usize>>,
    params: &ParamValues,
    with_grad: bool,
) -> Result<(Dual1, Dual2)> {
    assemble(gp, locs, cats, locs, cats, 0, params, with_grad)
}
