//! Named scalar parameters, their bounds and the reparametrization between
//! the bounded *surface* values seen by users and the unconstrained
//! *underlying* values handled by optimizers and samplers.
//!
//! | Bound          | underlying -> surface    |
//! |----------------|--------------------------|
//! | `(-inf, inf)`  | identity                 |
//! | `(lo, inf)`    | `lo + exp(u)`            |
//! | `(-inf, hi)`   | `hi - exp(u)`            |
//! | `(lo, hi)`     | `lo + (hi - lo) * expit(u)` |

use crate::errors::{GpError, Result};
use ndarray::Array1;
use std::collections::BTreeMap;
use std::fmt;

/// Parameter values indexed by parameter name
pub type ParamValues = BTreeMap<String, f64>;

/// Posterior draws of parameter values indexed by parameter name
pub type ParamDraws = BTreeMap<String, Array1<f64>>;

/// An interval `[lo, hi]` of admissible values, ends may be infinite
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Bound {
    /// Lower end
    pub lo: f64,
    /// Upper end
    pub hi: f64,
}

impl Bound {
    /// Constructor
    pub fn new(lo: f64, hi: f64) -> Self {
        Bound { lo, hi }
    }

    /// `(-inf, inf)`
    pub fn unbounded() -> Self {
        Bound::new(f64::NEG_INFINITY, f64::INFINITY)
    }

    /// `(0, inf)`
    pub fn positive() -> Self {
        Bound::new(0., f64::INFINITY)
    }

    /// Intersection of two bounds, may be empty
    pub fn intersect(&self, other: &Bound) -> Bound {
        Bound::new(self.lo.max(other.lo), self.hi.min(other.hi))
    }

    /// Whether no value satisfies the bound
    pub fn is_empty(&self) -> bool {
        self.lo > self.hi
    }

    /// Whether `v` lies in the closed interval `[lo, hi]`
    pub fn admits(&self, v: f64) -> bool {
        v.is_finite() && v >= self.lo && v <= self.hi
    }

    /// Whether `v` has a finite underlying representation, i.e. lies strictly inside the bound
    pub fn contains(&self, v: f64) -> bool {
        let above = if self.lo.is_finite() { v > self.lo } else { true };
        let below = if self.hi.is_finite() { v < self.hi } else { true };
        v.is_finite() && above && below
    }

    /// Maps a surface value to its underlying value
    pub fn underlying(&self, v: f64) -> f64 {
        match (self.lo.is_finite(), self.hi.is_finite()) {
            (false, false) => v,
            (true, false) => (v - self.lo).ln(),
            (false, true) => (self.hi - v).ln(),
            (true, true) => logit((v - self.lo) / (self.hi - self.lo)),
        }
    }

    /// Maps an underlying value to its surface value
    pub fn surface(&self, u: f64) -> f64 {
        match (self.lo.is_finite(), self.hi.is_finite()) {
            (false, false) => u,
            (true, false) => self.lo + u.exp(),
            (false, true) => self.hi - u.exp(),
            (true, true) => self.lo + (self.hi - self.lo) * expit(u),
        }
    }

    /// Derivative of the surface value with respect to the underlying value at `u`
    pub fn surface_derivative(&self, u: f64) -> f64 {
        match (self.lo.is_finite(), self.hi.is_finite()) {
            (false, false) => 1.,
            (true, false) => u.exp(),
            (false, true) => -u.exp(),
            (true, true) => {
                let s = expit(u);
                (self.hi - self.lo) * s * (1. - s)
            }
        }
    }
}

impl fmt::Display for Bound {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{}, {}]", self.lo, self.hi)
    }
}

fn logit(p: f64) -> f64 {
    (p / (1. - p)).ln()
}

fn expit(u: f64) -> f64 {
    if u >= 0. {
        1. / (1. + (-u).exp())
    } else {
        let e = u.exp();
        e / (1. + e)
    }
}

/// A reference to a parameter declared by a graph node
#[derive(Clone, Debug, PartialEq)]
pub struct Parameter {
    /// Parameter name, shared by every node referencing it
    pub name: String,
    /// Bound declared by the referencing node
    pub bound: Bound,
}

/// A formal argument of a graph node: either a constant or a named parameter
#[derive(Clone, Debug, PartialEq)]
pub enum ParamRef {
    /// Fixed value, not learnable
    Literal(f64),
    /// Learnable parameter looked up by name
    Named(String),
}

impl ParamRef {
    /// Name of the referenced parameter if any
    pub fn name(&self) -> Option<&str> {
        match self {
            ParamRef::Literal(_) => None,
            ParamRef::Named(name) => Some(name),
        }
    }

    /// Declared parameter for the given node bound, none for literals
    pub fn declare(&self, bound: Bound) -> Option<Parameter> {
        self.name().map(|name| Parameter {
            name: name.to_string(),
            bound,
        })
    }
}

impl From<f64> for ParamRef {
    fn from(v: f64) -> Self {
        ParamRef::Literal(v)
    }
}

impl From<&str> for ParamRef {
    fn from(name: &str) -> Self {
        ParamRef::Named(name.to_string())
    }
}

impl From<String> for ParamRef {
    fn from(name: String) -> Self {
        ParamRef::Named(name)
    }
}

/// Builds a list of parameter references, mixing literals and names
///
/// ```
/// use geostat_gp::{params, ParamRef};
/// let scale: Vec<ParamRef> = params![1., 1., "zscale"];
/// assert_eq!(scale[2], ParamRef::Named("zscale".to_string()));
/// ```
#[macro_export]
macro_rules! params {
    ($($p:expr),* $(,)?) => {
        vec![$($crate::ParamRef::from($p)),*]
    };
}

/// Intersects bounds of every reference to the same parameter name and checks
/// that every parameter has a value lying within its effective bound.
///
/// Fails if a bound intersection is empty, a parameter value is missing or
/// out of bound, or a value is given for a parameter nothing refers to.
pub fn check_parameters(
    declared: &[Parameter],
    values: &ParamValues,
) -> Result<BTreeMap<String, Bound>> {
    let mut bounds: BTreeMap<String, Bound> = BTreeMap::new();
    for p in declared {
        let bound = bounds
            .entry(p.name.clone())
            .or_insert_with(Bound::unbounded);
        *bound = bound.intersect(&p.bound);
    }

    for (name, bound) in bounds.iter() {
        if bound.is_empty() {
            return Err(GpError::ParameterError(format!(
                "Conflicting bounds for parameter `{name}`: {bound}"
            )));
        }
        match values.get(name) {
            None => {
                return Err(GpError::ParameterError(format!(
                    "Parameter `{name}` is missing"
                )))
            }
            Some(&v) if !bound.admits(v) => {
                return Err(GpError::ParameterError(format!(
                    "Parameter `{name}` = {v} is out of bounds {bound}"
                )))
            }
            _ => (),
        }
    }

    if let Some(name) = values.keys().find(|name| !bounds.contains_key(*name)) {
        return Err(GpError::ParameterError(format!(
            "Parameter `{name}` is not used by the model"
        )));
    }

    Ok(bounds)
}

/// Effective bounds of every parameter of a model and the
/// bidirectional surface/underlying mapping built on them
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParameterSpace {
    bounds: BTreeMap<String, Bound>,
}

impl ParameterSpace {
    /// Constructor from checked bounds
    pub fn new(bounds: BTreeMap<String, Bound>) -> Self {
        ParameterSpace { bounds }
    }

    /// Effective bounds indexed by name
    pub fn bounds(&self) -> &BTreeMap<String, Bound> {
        &self.bounds
    }

    /// Parameter names in a stable order
    pub fn names(&self) -> Vec<String> {
        self.bounds.keys().cloned().collect()
    }

    /// Number of parameters
    pub fn len(&self) -> usize {
        self.bounds.len()
    }

    /// Whether the space has no parameter
    pub fn is_empty(&self) -> bool {
        self.bounds.is_empty()
    }

    fn bound(&self, name: &str) -> Result<&Bound> {
        self.bounds
            .get(name)
            .ok_or_else(|| GpError::ParameterError(format!("Unknown parameter `{name}`")))
    }

    /// Maps surface values to underlying values
    pub fn underlying(&self, surface: &ParamValues) -> Result<ParamValues> {
        surface
            .iter()
            .map(|(name, &v)| {
                let bound = self.bound(name)?;
                if !bound.contains(v) {
                    return Err(GpError::ParameterError(format!(
                        "Parameter `{name}` = {v} has no underlying value in bounds {bound}"
                    )));
                }
                Ok((name.clone(), bound.underlying(v)))
            })
            .collect()
    }

    /// Maps underlying values to surface values
    pub fn surface(&self, underlying: &ParamValues) -> Result<ParamValues> {
        underlying
            .iter()
            .map(|(name, &u)| Ok((name.clone(), self.bound(name)?.surface(u))))
            .collect()
    }

    /// Derivatives of surface values with respect to underlying values
    pub fn surface_derivative(&self, underlying: &ParamValues) -> Result<ParamValues> {
        underlying
            .iter()
            .map(|(name, &u)| Ok((name.clone(), self.bound(name)?.surface_derivative(u))))
            .collect()
    }

    /// Maps underlying draws to surface draws
    pub fn surface_draws(&self, underlying: &ParamDraws) -> Result<ParamDraws> {
        underlying
            .iter()
            .map(|(name, u)| {
                let bound = self.bound(name)?;
                Ok((name.clone(), u.mapv(|v| bound.surface(v))))
            })
            .collect()
    }

    /// Flattens values in name order
    pub fn to_vec(&self, values: &ParamValues) -> Result<Array1<f64>> {
        self.bounds
            .keys()
            .map(|name| {
                values.get(name).copied().ok_or_else(|| {
                    GpError::ParameterError(format!("Parameter `{name}` is missing"))
                })
            })
            .collect::<Result<Vec<f64>>>()
            .map(Array1::from)
    }

    /// Rebuilds values from a vector flattened with [`ParameterSpace::to_vec`]
    pub fn from_vec(&self, x: &Array1<f64>) -> ParamValues {
        self.bounds
            .keys()
            .zip(x.iter())
            .map(|(name, &v)| (name.clone(), v))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use finitediff::FiniteDiff;
    use ndarray::array;

    fn values(pairs: &[(&str, f64)]) -> ParamValues {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_round_trip() {
        let bounds = [
            (Bound::unbounded(), vec![-3., 0., 2.5]),
            (Bound::positive(), vec![1e-3, 1., 40.]),
            (Bound::new(1., f64::INFINITY), vec![1.001, 2., 100.]),
            (Bound::new(f64::NEG_INFINITY, 2.), vec![-50., 0., 1.99]),
            (Bound::new(0., 2.), vec![0.01, 1., 1.99]),
            (Bound::new(-1., 3.), vec![-0.5, 0., 2.9]),
        ];
        for (bound, xs) in bounds.iter() {
            for &x in xs {
                let u = bound.underlying(x);
                assert!(u.is_finite());
                assert_abs_diff_eq!(bound.surface(u), x, epsilon = 1e-9);
            }
            for &u in &[-4., -0.3, 0., 1.7, 5.] {
                let y = bound.surface(u);
                assert_abs_diff_eq!(bound.underlying(y), u, epsilon = 1e-7);
            }
        }
    }

    #[test]
    fn test_surface_derivative() {
        for bound in [
            Bound::unbounded(),
            Bound::positive(),
            Bound::new(f64::NEG_INFINITY, 2.),
            Bound::new(0., 2.),
        ] {
            for &u in &[-1.5, 0., 0.7] {
                let fd = array![u].central_diff(&|p: &Array1<f64>| bound.surface(p[0]));
                assert_abs_diff_eq!(bound.surface_derivative(u), fd[0], epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn test_bounds_intersection() {
        let declared = vec![
            Parameter {
                name: "gamma".to_string(),
                bound: Bound::positive(),
            },
            Parameter {
                name: "gamma".to_string(),
                bound: Bound::new(0., 2.),
            },
            Parameter {
                name: "beta".to_string(),
                bound: Bound::unbounded(),
            },
        ];
        let bounds = check_parameters(&declared, &values(&[("gamma", 1.), ("beta", -3.)])).unwrap();
        assert_eq!(bounds["gamma"], Bound::new(0., 2.));
        assert_eq!(bounds["beta"], Bound::unbounded());
    }

    #[test]
    fn test_bound_violation() {
        let declared = vec![Parameter {
            name: "range".to_string(),
            bound: Bound::positive(),
        }];
        assert!(check_parameters(&declared, &values(&[("range", -1.)])).is_err());
        assert!(check_parameters(&declared, &values(&[("range", -1e-9)])).is_err());
        assert!(check_parameters(&declared, &values(&[("range", f64::NAN)])).is_err());
        assert!(check_parameters(&declared, &values(&[])).is_err());
        assert!(check_parameters(&declared, &values(&[("range", 1.), ("sill", 1.)])).is_err());
    }

    #[test]
    fn test_closed_ends_admitted() {
        let declared = vec![
            Parameter {
                name: "gamma".to_string(),
                bound: Bound::new(0., 2.),
            },
            Parameter {
                name: "nugget".to_string(),
                bound: Bound::positive(),
            },
            Parameter {
                name: "slope".to_string(),
                bound: Bound::new(f64::NEG_INFINITY, 1.),
            },
        ];
        let ok = |gamma: f64, nugget: f64, slope: f64| {
            check_parameters(
                &declared,
                &values(&[("gamma", gamma), ("nugget", nugget), ("slope", slope)]),
            )
            .is_ok()
        };
        assert!(ok(2., 0., 1.));
        assert!(ok(0., 3., -1e6));
        assert!(ok(1.5, 1e-12, 0.99));
        assert!(!ok(2.0001, 1., 0.));
        assert!(!ok(-1e-9, 1., 0.));
        assert!(!ok(1., -1e-9, 0.));
        assert!(!ok(1., 1., 1.0001));
        assert!(!ok(1., f64::INFINITY, 0.));
    }

    #[test]
    fn test_degenerate_intersection() {
        let declared = vec![
            Parameter {
                name: "a".to_string(),
                bound: Bound::new(0., 1.),
            },
            Parameter {
                name: "a".to_string(),
                bound: Bound::new(1., 3.),
            },
        ];
        let bounds = check_parameters(&declared, &values(&[("a", 1.)])).unwrap();
        assert_eq!(bounds["a"], Bound::new(1., 1.));
        assert!(check_parameters(&declared, &values(&[("a", 0.5)])).is_err());
    }

    #[test]
    fn test_boundary_has_no_underlying_value() {
        let bound = Bound::new(0., 2.);
        assert!(bound.admits(2.) && !bound.contains(2.));
        assert!(bound.admits(0.) && !bound.contains(0.));
        assert!(bound.contains(1.999));
        let mut bounds = BTreeMap::new();
        bounds.insert("gamma".to_string(), bound);
        let space = ParameterSpace::new(bounds);
        assert!(space.underlying(&values(&[("gamma", 2.)])).is_err());
        assert!(space.underlying(&values(&[("gamma", 1.)])).is_ok());
    }

    #[test]
    fn test_empty_intersection() {
        let declared = vec![
            Parameter {
                name: "a".to_string(),
                bound: Bound::new(0., 1.),
            },
            Parameter {
                name: "a".to_string(),
                bound: Bound::new(2., 3.),
            },
        ];
        let err = check_parameters(&declared, &values(&[("a", 0.5)])).unwrap_err();
        assert!(err.to_string().contains("Conflicting bounds"));
    }

    #[test]
    fn test_parameter_space() {
        let mut bounds = BTreeMap::new();
        bounds.insert("range".to_string(), Bound::positive());
        bounds.insert("beta".to_string(), Bound::unbounded());
        let space = ParameterSpace::new(bounds);
        let sp = values(&[("range", 2.), ("beta", -1.)]);
        let up = space.underlying(&sp).unwrap();
        assert_abs_diff_eq!(up["range"], 2f64.ln());
        assert_abs_diff_eq!(up["beta"], -1.);
        let x = space.to_vec(&up).unwrap();
        assert_eq!(space.names(), vec!["beta".to_string(), "range".to_string()]);
        let back = space.surface(&space.from_vec(&x)).unwrap();
        assert_abs_diff_eq!(back["range"], 2., epsilon = 1e-12);
        assert!(space.underlying(&values(&[("nugget", 1.)])).is_err());
    }
}
