use crate::condition::EDGE_FEATURE_DIM;

/// Single-output linear model trained online by stochastic gradient
/// descent with an inverse-scaling learning rate and an L2 penalty.
///
/// Before the first `partial_fit` every prediction is zero; the caller
/// keeps an init phase around that anyway.
#[derive(Debug)]
pub struct SgdRegressor {
    weights: [f64; EDGE_FEATURE_DIM],
    bias: f64,
    alpha: f64,
    eta0: f64,
    power_t: f64,
    step: u64,
}

impl Default for SgdRegressor {
    fn default() -> Self {
        Self::new()
    }
}

impl SgdRegressor {
    pub fn new() -> Self {
        Self {
            weights: [0.0; EDGE_FEATURE_DIM],
            bias: 0.0,
            alpha: 1e-4,
            // Edge types reach the high forties, so the step size must
            // stay below 2 / max ||x||^2 to keep the updates stable.
            eta0: 1e-4,
            power_t: 0.25,
            step: 1,
        }
    }

    pub fn predict(&self, x: &[f64; EDGE_FEATURE_DIM]) -> f64 {
        self.weights
            .iter()
            .zip(x)
            .map(|(weight, value)| weight * value)
            .sum::<f64>()
            + self.bias
    }

    /// One pass of squared-loss SGD over the batch.
    pub fn partial_fit(&mut self, batch: &[([f64; EDGE_FEATURE_DIM], f64)]) {
        for (x, y) in batch {
            let eta = self.eta0 / (self.step as f64).powf(self.power_t);
            let err = self.predict(x) - y;
            for (weight, value) in self.weights.iter_mut().zip(x) {
                *weight -= eta * (err * value + self.alpha * *weight);
            }
            self.bias -= eta * err;
            self.step += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::SgdRegressor;

    #[test]
    fn untrained_model_predicts_zero() {
        let model = SgdRegressor::new();
        assert_eq!(model.predict(&[1.0, 2.0, 3.0, 4.0, 5.0]), 0.0);
    }

    #[test]
    fn fitting_reduces_prediction_error() {
        // Target: y = 2 * x0.
        let batch: Vec<_> = (0..8)
            .map(|i| {
                let x = f64::from(i % 4);
                ([x, 0.0, 0.0, 0.0, 0.0], 2.0 * x)
            })
            .collect();

        let mut model = SgdRegressor::new();
        let x_probe = [3.0, 0.0, 0.0, 0.0, 0.0];
        let before = (model.predict(&x_probe) - 6.0).abs();
        for _ in 0..500 {
            model.partial_fit(&batch);
        }
        let after = (model.predict(&x_probe) - 6.0).abs();
        assert!(after < before);
        assert!(after < 5.0);
    }

    #[test]
    fn higher_targets_rank_higher() {
        let mut model = SgdRegressor::new();
        let hot = [40.0, 5.0, 1.0, 2.0, 8.0];
        let cold = [0.0, 0.0, 1.0, 9.0, 0.0];
        for _ in 0..50 {
            model.partial_fit(&[(hot, 10.0), (cold, 0.0)]);
        }
        assert!(model.predict(&hot) > model.predict(&cold));
    }
}
