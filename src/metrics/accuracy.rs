use crate::buffer::FrameBuffer;
use crate::metrics::MetricsFunction;

/// Fraction of frames whose highest output matches the highest target.
#[derive(Debug, Default)]
pub struct MetricsCategoricalAccuracy {
    correct: usize,
    frames: usize,
}

impl MetricsCategoricalAccuracy {
    pub fn new() -> MetricsCategoricalAccuracy {
        MetricsCategoricalAccuracy::default()
    }
}

/// Index of the maximum element; the first one wins ties.
pub fn argmax(v: &[f32]) -> usize {
    v.iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |(best, max), (i, &x)| if x > max { (i, x) } else { (best, max) })
        .0
}

impl MetricsFunction for MetricsCategoricalAccuracy {
    fn clear(&mut self) {
        self.correct = 0;
        self.frames = 0;
    }

    fn get_metrics(&self) -> f64 {
        if self.frames == 0 {
            return 0.0;
        }
        self.correct as f64 / self.frames as f64
    }

    fn calculate_metrics(&mut self, y: &FrameBuffer, t: &FrameBuffer) {
        assert_eq!(y.frame_size(), t.frame_size(), "output and target frame sizes differ");
        for frame in 0..y.frame_size() {
            if argmax(&y.frame_values(frame)) == argmax(&t.frame_values(frame)) {
                self.correct += 1;
            }
        }
        self.frames += y.frame_size();
    }

    fn metrics_string(&self) -> &'static str {
        "accuracy"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::DataType;

    #[test]
    fn test_argmax_first_wins() {
        assert_eq!(argmax(&[0.1, 0.7, 0.7]), 1);
        assert_eq!(argmax(&[]), 0);
    }

    #[test]
    fn test_accuracy_accumulates() {
        let mut y = FrameBuffer::new(3, &[2], DataType::Fp32);
        let mut t = FrameBuffer::new(3, &[2], DataType::Fp32);
        y.set_fp32(0, 0, 1.0);
        t.set_fp32(0, 0, 1.0);
        y.set_fp32(1, 1, 1.0);
        t.set_fp32(1, 0, 1.0);
        y.set_fp32(2, 1, 2.0);
        t.set_fp32(2, 1, 1.0);

        let mut acc = MetricsCategoricalAccuracy::new();
        acc.calculate_metrics(&y, &t);
        assert!((acc.get_metrics() - 2.0 / 3.0).abs() < 1e-12);
        acc.clear();
        assert_eq!(acc.get_metrics(), 0.0);
    }
}
