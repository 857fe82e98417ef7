use serde::{Serialize, Deserialize};

/// Element-wise nonlinearity applied by [`ActivationLayer`](crate::layers::ActivationLayer).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ActivationFunction {
    Sigmoid,
    ReLU,
    Identity,
    Tanh,
    /// clamp(x, -1, 1)
    HardTanh,
    /// Step at zero producing {0, 1}; the gradient is the hard-tanh
    /// straight-through estimator.
    Binarize,
}

impl ActivationFunction {
    pub fn function(&self, x: f32) -> f32 {
        match self {
            ActivationFunction::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            ActivationFunction::ReLU => x.max(0.0),
            ActivationFunction::Identity => x,
            ActivationFunction::Tanh => x.tanh(),
            ActivationFunction::HardTanh => x.clamp(-1.0, 1.0),
            ActivationFunction::Binarize => if x > 0.0 { 1.0 } else { 0.0 },
        }
    }

    /// Element-wise derivative evaluated at the pre-activation input `x`.
    pub fn derivative(&self, x: f32) -> f32 {
        match self {
            ActivationFunction::Sigmoid => {
                let fx = self.function(x);
                fx * (1.0 - fx)
            }
            ActivationFunction::ReLU => if x > 0.0 { 1.0 } else { 0.0 },
            ActivationFunction::Identity => 1.0,
            ActivationFunction::Tanh => {
                let t = x.tanh();
                1.0 - t * t
            }
            ActivationFunction::HardTanh | ActivationFunction::Binarize => {
                if x.abs() <= 1.0 { 1.0 } else { 0.0 }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derivatives_match_finite_differences() {
        let functions = [
            ActivationFunction::Sigmoid,
            ActivationFunction::Tanh,
            ActivationFunction::Identity,
        ];
        let h = 1e-2;
        for f in functions {
            for &x in &[-1.3f32, -0.2, 0.4, 1.7] {
                let numeric = (f.function(x + h) - f.function(x - h)) / (2.0 * h);
                assert!((numeric - f.derivative(x)).abs() < 1e-2, "{f:?} at {x}");
            }
        }
    }

    #[test]
    fn test_piecewise_functions() {
        let relu = ActivationFunction::ReLU;
        assert_eq!((relu.function(-2.0), relu.function(1.5)), (0.0, 1.5));
        assert_eq!((relu.derivative(-2.0), relu.derivative(1.5)), (0.0, 1.0));

        let hard_tanh = ActivationFunction::HardTanh;
        assert_eq!(hard_tanh.function(3.0), 1.0);
        assert_eq!(hard_tanh.function(-0.5), -0.5);
        assert_eq!(hard_tanh.derivative(-1.2), 0.0);
    }

    #[test]
    fn test_binarize_straight_through() {
        let f = ActivationFunction::Binarize;
        assert_eq!(f.function(0.3), 1.0);
        assert_eq!(f.function(-0.3), 0.0);
        assert_eq!(f.derivative(0.9), 1.0);
        assert_eq!(f.derivative(1.5), 0.0);
    }
}
