use rayon::prelude::*;

use crate::buffer::{DataType, FrameBuffer};
use crate::layers::rows::for_each_fp32_row;
use crate::loss::loss_function::{assert_same_geometry, LossFunction};

/// Softmax over the nodes of each frame followed by categorical
/// cross-entropy against the target distribution.
///
/// The softmax is folded into the loss, so the network's last layer emits
/// raw logits and the gradient is `(softmax - target) / frame_size`.
#[derive(Debug, Default)]
pub struct LossCrossEntropyWithSoftmax {
    loss_sum: f64,
    frames: usize,
}

impl LossCrossEntropyWithSoftmax {
    pub fn new() -> LossCrossEntropyWithSoftmax {
        LossCrossEntropyWithSoftmax::default()
    }

    /// Per frame: (loss, softmax over nodes). Uses log-sum-exp after
    /// subtracting the frame maximum, so large logits stay finite.
    fn frame_softmax(y: &FrameBuffer, t: &FrameBuffer) -> Vec<(f32, Vec<f32>)> {
        let y = y.convert(DataType::Fp32);
        let t = t.convert(DataType::Fp32);
        (0..y.frame_size())
            .into_par_iter()
            .map(|frame| {
                let logits = y.frame_values(frame);
                let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                let sum: f32 = logits.iter().map(|&v| (v - max).exp()).sum();
                let log_sum = max + sum.ln();
                let mut loss = 0.0;
                for (node, &v) in logits.iter().enumerate() {
                    loss -= t.get_fp32(frame, node) * (v - log_sum);
                }
                let softmax = logits.iter().map(|&v| (v - log_sum).exp()).collect();
                (loss, softmax)
            })
            .collect()
    }
}

impl LossFunction for LossCrossEntropyWithSoftmax {
    fn clear(&mut self) {
        self.loss_sum = 0.0;
        self.frames = 0;
    }

    fn get_loss(&self) -> f64 {
        if self.frames == 0 {
            return 0.0;
        }
        self.loss_sum / self.frames as f64
    }

    fn frame_loss(&self, y: &FrameBuffer, t: &FrameBuffer) -> Vec<f32> {
        assert_same_geometry(y, t);
        Self::frame_softmax(y, t).into_iter().map(|(loss, _)| loss).collect()
    }

    fn calculate_loss(&mut self, y: &FrameBuffer, t: &FrameBuffer) -> FrameBuffer {
        assert_same_geometry(y, t);
        let frame_size = y.frame_size();
        let per_frame = Self::frame_softmax(y, t);
        self.loss_sum += per_frame.iter().map(|(loss, _)| *loss as f64).sum::<f64>();
        self.frames += frame_size;

        let t = t.convert(DataType::Fp32);
        let scale = 1.0 / frame_size.max(1) as f32;
        let mut dy = FrameBuffer::new(frame_size, y.shape(), DataType::Fp32);
        for_each_fp32_row(&mut dy, |node, row| {
            let target = t.fp32_row(node);
            for (frame, d) in row.iter_mut().enumerate() {
                *d = (per_frame[frame].1[node] - target[frame]) * scale;
            }
        });
        dy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(values: &[&[f32]]) -> FrameBuffer {
        let mut buf = FrameBuffer::new(values.len(), &[values[0].len()], DataType::Fp32);
        for (frame, row) in values.iter().enumerate() {
            for (node, &v) in row.iter().enumerate() {
                buf.set_fp32(frame, node, v);
            }
        }
        buf
    }

    #[test]
    fn test_confident_correct_prediction_has_no_loss() {
        let mut loss = LossCrossEntropyWithSoftmax::new();
        let y = frames(&[&[100.0, 0.0, 0.0]]);
        let t = frames(&[&[1.0, 0.0, 0.0]]);
        let dy = loss.calculate_loss(&y, &t);
        assert!(loss.get_loss() < 1e-6);
        assert!(dy.frame_values(0).iter().all(|g| g.abs() < 1e-6));
    }

    #[test]
    fn test_uniform_logits() {
        let mut loss = LossCrossEntropyWithSoftmax::new();
        let y = frames(&[&[0.0, 0.0, 0.0, 0.0], &[0.0, 0.0, 0.0, 0.0]]);
        let t = frames(&[&[0.0, 1.0, 0.0, 0.0], &[0.0, 0.0, 0.0, 1.0]]);
        let dy = loss.calculate_loss(&y, &t);
        assert!((loss.get_loss() - (4.0f64).ln()).abs() < 1e-5);
        // (0.25 - 1) / 2
        assert!((dy.get_fp32(0, 1) + 0.375).abs() < 1e-6);
        assert!((dy.get_fp32(0, 0) - 0.125).abs() < 1e-6);

        loss.clear();
        assert_eq!(loss.get_loss(), 0.0);
    }

    #[test]
    fn test_running_average() {
        let mut loss = LossCrossEntropyWithSoftmax::new();
        let t = frames(&[&[1.0, 0.0]]);
        loss.calculate_loss(&frames(&[&[0.0, 0.0]]), &t);
        loss.calculate_loss(&frames(&[&[50.0, 0.0]]), &t);
        assert!((loss.get_loss() - (2.0f64).ln() / 2.0).abs() < 1e-5);
    }
}
