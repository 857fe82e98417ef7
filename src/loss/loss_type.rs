use serde::{Serialize, Deserialize};

use crate::loss::{LossCrossEntropyWithSoftmax, LossFunction, LossMeanSquaredError};

/// Selects which loss function the training runner uses.
///
/// - `Mse`: mean squared error; pair with a real-valued output.
/// - `CrossEntropy`: softmax folded into categorical cross-entropy; the last
///   layer emits raw logits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossType {
    #[default]
    Mse,
    CrossEntropy,
}

impl LossType {
    pub fn create(self) -> Box<dyn LossFunction> {
        match self {
            LossType::Mse => Box::new(LossMeanSquaredError::new()),
            LossType::CrossEntropy => Box::new(LossCrossEntropyWithSoftmax::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serde_names() {
        assert_eq!(serde_json::to_string(&LossType::CrossEntropy).unwrap(), "\"cross_entropy\"");
        let parsed: LossType = serde_json::from_str("\"mse\"").unwrap();
        assert_eq!(parsed, LossType::Mse);
    }
}
