//! Forward mode derivatives for covariance graphs.
//!
//! A [`Dual`] array carries its value together with one tangent array per
//! surface parameter it depends on. Graph nodes combine their inputs with the
//! chain rule so that evaluating a mean or a kernel also yields its partial
//! derivatives with respect to every parameter referenced underneath.
//! Literal inputs and evaluations run without derivatives carry no tangent,
//! in which case every operation below only computes values.

use ndarray::{s, Array, Array1, Array2, Dimension, Ix1, Ix2, Zip};
use std::collections::BTreeMap;

/// A scalar value and its derivatives with respect to named parameters
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Scalar {
    /// Value
    pub value: f64,
    /// Partial derivatives indexed by parameter name
    pub tangents: BTreeMap<String, f64>,
}

impl Scalar {
    /// A constant, no derivative
    pub fn constant(value: f64) -> Self {
        Scalar {
            value,
            tangents: BTreeMap::new(),
        }
    }

    /// The parameter `name` itself, unit derivative
    pub fn variable(name: &str, value: f64) -> Self {
        let mut tangents = BTreeMap::new();
        tangents.insert(name.to_string(), 1.);
        Scalar { value, tangents }
    }

    /// Sum of two scalars
    pub fn add(&self, other: &Scalar) -> Scalar {
        let mut res = self.clone();
        res.value += other.value;
        for (name, t) in other.tangents.iter() {
            *res.tangents.entry(name.clone()).or_insert(0.) += t;
        }
        res
    }

    /// Product of two scalars
    pub fn mul(&self, other: &Scalar) -> Scalar {
        let mut res = Scalar::constant(self.value * other.value);
        for (name, t) in self.tangents.iter() {
            *res.tangents.entry(name.clone()).or_insert(0.) += t * other.value;
        }
        for (name, t) in other.tangents.iter() {
            *res.tangents.entry(name.clone()).or_insert(0.) += t * self.value;
        }
        res
    }

    /// Multiplication by a constant
    pub fn scale(&self, a: f64) -> Scalar {
        Scalar {
            value: a * self.value,
            tangents: self
                .tangents
                .iter()
                .map(|(name, t)| (name.clone(), a * t))
                .collect(),
        }
    }
}

/// An array value and its derivatives with respect to named parameters
#[derive(Clone, Debug, PartialEq)]
pub struct Dual<D: Dimension> {
    /// Value
    pub value: Array<f64, D>,
    /// Partial derivatives indexed by parameter name, same shape as `value`
    pub tangents: BTreeMap<String, Array<f64, D>>,
}

/// A vector with derivatives
pub type Dual1 = Dual<Ix1>;
/// A matrix with derivatives
pub type Dual2 = Dual<Ix2>;

impl<D: Dimension> Dual<D> {
    /// A constant array, no derivative
    pub fn constant(value: Array<f64, D>) -> Self {
        Dual {
            value,
            tangents: BTreeMap::new(),
        }
    }

    /// Whether any derivative is carried
    pub fn has_tangents(&self) -> bool {
        !self.tangents.is_empty()
    }

    fn tangent_mut(&mut self, name: &str) -> &mut Array<f64, D> {
        let dim = self.value.raw_dim();
        self.tangents
            .entry(name.to_string())
            .or_insert_with(|| Array::zeros(dim))
    }

    /// Adds `partial * d(input)` to the tangents of `self`
    pub fn accumulate(&mut self, partial: &Array<f64, D>, input: &Dual<D>) {
        for (name, t) in input.tangents.iter() {
            let acc = self.tangent_mut(name);
            Zip::from(acc)
                .and(partial)
                .and(t)
                .for_each(|a, &p, &t| *a += p * t);
        }
    }

    /// Adds `partial * d(input)` to the tangents of `self`
    pub fn accumulate_scalar(&mut self, partial: &Array<f64, D>, input: &Scalar) {
        for (name, &t) in input.tangents.iter() {
            let acc = self.tangent_mut(name);
            Zip::from(acc).and(partial).for_each(|a, &p| *a += p * t);
        }
    }

    /// Elementwise sum
    pub fn add(&self, other: &Dual<D>) -> Dual<D> {
        let mut res = Dual::constant(&self.value + &other.value);
        res.tangents = self.tangents.clone();
        for (name, t) in other.tangents.iter() {
            *res.tangent_mut(name) += t;
        }
        res
    }

    /// Elementwise product
    pub fn mul(&self, other: &Dual<D>) -> Dual<D> {
        let mut res = Dual::constant(&self.value * &other.value);
        if self.has_tangents() {
            res.accumulate(&other.value, self);
        }
        if other.has_tangents() {
            res.accumulate(&self.value, other);
        }
        res
    }

    /// Elementwise quotient
    pub fn div(&self, other: &Dual<D>) -> Dual<D> {
        let mut res = Dual::constant(&self.value / &other.value);
        if self.has_tangents() {
            res.accumulate(&other.value.mapv(|v| 1. / v), self);
        }
        if other.has_tangents() {
            let partial = Zip::from(&res.value)
                .and(&other.value)
                .map_collect(|&q, &d| -q / d);
            res.accumulate(&partial, other);
        }
        res
    }

    /// Product by a scalar
    pub fn scale(&self, s: &Scalar) -> Dual<D> {
        let mut res = Dual::constant(&self.value * s.value);
        res.tangents = self
            .tangents
            .iter()
            .map(|(name, t)| (name.clone(), t * s.value))
            .collect();
        res.accumulate_scalar(&self.value, s);
        res
    }

    /// Adds a scalar to every element
    pub fn shift(&self, s: &Scalar) -> Dual<D> {
        let mut res = self.clone();
        res.value += s.value;
        for (name, &t) in s.tangents.iter() {
            *res.tangent_mut(name) += t;
        }
        res
    }

    /// Elementwise function `f` with derivative `df`
    pub fn map(&self, f: impl Fn(f64) -> f64, df: impl Fn(f64) -> f64) -> Dual<D> {
        let mut res = Dual::constant(self.value.mapv(&f));
        if self.has_tangents() {
            res.accumulate(&self.value.mapv(&df), self);
        }
        res
    }
}

impl Dual1 {
    /// Outer product `a[i] * b[j]`
    pub fn outer(&self, other: &Dual1) -> Dual2 {
        let a = self.value.view().insert_axis(ndarray::Axis(1));
        let b = other.value.view().insert_axis(ndarray::Axis(0));
        let mut res = Dual::constant(&a * &b);
        for (name, t) in self.tangents.iter() {
            let t = t.view().insert_axis(ndarray::Axis(1));
            *res.tangent_mut(name) += &(&t * &b);
        }
        for (name, t) in other.tangents.iter() {
            let t = t.view().insert_axis(ndarray::Axis(0));
            *res.tangent_mut(name) += &(&a * &t);
        }
        res
    }

    /// Gathers `values[indices[i]]`
    pub fn gather(values: &[Scalar], indices: impl Iterator<Item = usize>) -> Dual1 {
        let indices: Vec<usize> = indices.collect();
        let mut res = Dual::constant(Array1::from_iter(indices.iter().map(|&i| values[i].value)));
        for (k, &i) in indices.iter().enumerate() {
            for (name, &t) in values[i].tangents.iter() {
                res.tangent_mut(name)[k] += t;
            }
        }
        res
    }

    /// Copies `segment` at position `start`
    pub fn assign_segment(&mut self, start: usize, segment: &Dual1) {
        let range = start..start + segment.value.len();
        self.value.slice_mut(s![range.clone()]).assign(&segment.value);
        for (name, t) in segment.tangents.iter() {
            self.tangent_mut(name).slice_mut(s![range.clone()]).assign(t);
        }
    }
}

impl Dual2 {
    /// A matrix of zeros, no derivative
    pub fn zeros(n1: usize, n2: usize) -> Dual2 {
        Dual::constant(Array2::zeros((n1, n2)))
    }

    /// Copies `block` into the sub-matrix whose upper left corner is (`row`, `col`)
    pub fn assign_block(&mut self, row: usize, col: usize, block: &Dual2) {
        let (n1, n2) = block.value.dim();
        let (rows, cols) = (row..row + n1, col..col + n2);
        self.value
            .slice_mut(s![rows.clone(), cols.clone()])
            .assign(&block.value);
        for (name, t) in block.tangents.iter() {
            self.tangent_mut(name)
                .slice_mut(s![rows.clone(), cols.clone()])
                .assign(t);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn var(name: &str, value: Array1<f64>) -> Dual1 {
        let mut d = Dual::constant(value.clone());
        d.tangents.insert(name.to_string(), Array1::ones(value.len()));
        d
    }

    #[test]
    fn test_product_rule() {
        let x = var("x", array![1., 2., 3.]);
        let y = var("y", array![4., 5., 6.]);
        let p = x.mul(&y);
        assert_abs_diff_eq!(p.value, array![4., 10., 18.]);
        assert_abs_diff_eq!(p.tangents["x"], array![4., 5., 6.]);
        assert_abs_diff_eq!(p.tangents["y"], array![1., 2., 3.]);

        let q = x.div(&y);
        assert_abs_diff_eq!(q.tangents["x"], array![0.25, 0.2, 1. / 6.]);
        assert_abs_diff_eq!(q.tangents["y"], array![-1. / 16., -2. / 25., -3. / 36.]);
    }

    #[test]
    fn test_scale_and_map() {
        let x = var("x", array![0., 1.]);
        let s = Scalar::variable("s", 3.);
        let y = x.scale(&s).map(f64::exp, f64::exp);
        assert_abs_diff_eq!(y.value, array![1., 3f64.exp()]);
        assert_abs_diff_eq!(y.tangents["x"], array![3., 3. * 3f64.exp()]);
        assert_abs_diff_eq!(y.tangents["s"], array![0., 3f64.exp()]);
    }

    #[test]
    fn test_outer_and_gather() {
        let w = vec![Scalar::variable("a", 2.), Scalar::constant(3.)];
        let g = Dual1::gather(&w, [0, 1, 0].into_iter());
        assert_abs_diff_eq!(g.value, array![2., 3., 2.]);
        assert_abs_diff_eq!(g.tangents["a"], array![1., 0., 1.]);

        let o = g.outer(&g);
        assert_abs_diff_eq!(o.value, array![[4., 6., 4.], [6., 9., 6.], [4., 6., 4.]]);
        // d(a*a)/da = 2a on the corners, d(3a)/da = 3 elsewhere
        assert_abs_diff_eq!(o.tangents["a"], array![[4., 3., 4.], [3., 0., 3.], [4., 3., 4.]]);
    }

    #[test]
    fn test_assign_block() {
        let mut m = Dual2::zeros(3, 3);
        let mut b = Dual2::zeros(1, 2);
        b.value.fill(2.);
        b.tangents.insert("x".to_string(), Array2::ones((1, 2)));
        m.assign_block(2, 1, &b);
        assert_abs_diff_eq!(m.value, array![[0., 0., 0.], [0., 0., 0.], [0., 2., 2.]]);
        assert_abs_diff_eq!(m.tangents["x"], array![[0., 0., 0.], [0., 0., 0.], [0., 1., 1.]]);
    }
}
