use ndarray::{Array1, Zip};

/// Adam first-order optimizer state for minimizing a loss on unconstrained parameters
#[derive(Clone, Debug)]
pub(crate) struct Adam {
    step_size: f64,
    beta1: f64,
    beta2: f64,
    epsilon: f64,
    m: Array1<f64>,
    v: Array1<f64>,
    t: i32,
}

impl Adam {
    pub fn new(dim: usize, step_size: f64) -> Self {
        Adam {
            step_size,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-7,
            m: Array1::zeros(dim),
            v: Array1::zeros(dim),
            t: 0,
        }
    }

    /// Updates `x` in place given the loss gradient at `x`
    pub fn step(&mut self, x: &mut Array1<f64>, grad: &Array1<f64>) {
        self.t += 1;
        let (b1, b2) = (self.beta1, self.beta2);
        Zip::from(&mut self.m)
            .and(&mut self.v)
            .and(grad)
            .for_each(|m, v, &g| {
                *m = b1 * *m + (1. - b1) * g;
                *v = b2 * *v + (1. - b2) * g * g;
            });
        let lr = self.step_size * (1. - b2.powi(self.t)).sqrt() / (1. - b1.powi(self.t));
        let eps = self.epsilon;
        Zip::from(x)
            .and(&self.m)
            .and(&self.v)
            .for_each(|x, &m, &v| *x -= lr * m / (v.sqrt() + eps));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_adam_quadratic() {
        // minimize (x0 - 1)^2 + 10 (x1 + 2)^2
        let mut x = array![5., 5.];
        let mut adam = Adam::new(2, 0.1);
        for _ in 0..2000 {
            let grad = array![2. * (x[0] - 1.), 20. * (x[1] + 2.)];
            adam.step(&mut x, &grad);
        }
        assert_abs_diff_eq!(x, array![1., -2.], epsilon = 1e-2);
    }

    #[test]
    fn test_adam_first_step() {
        // First step moves every coordinate by about step_size against the gradient sign
        let mut x = array![0., 0.];
        let mut adam = Adam::new(2, 0.01);
        adam.step(&mut x, &array![3., -0.5]);
        assert_abs_diff_eq!(x, array![-0.01, 0.01], epsilon = 1e-6);
    }
}
