use crate::buffer::{DataType, FrameBuffer};
use crate::layers::rows::for_each_fp32_row;
use crate::loss::loss_function::{assert_same_geometry, LossFunction};

/// Mean squared error per frame, `mean((y - t)²)` over the nodes.
#[derive(Debug, Default)]
pub struct LossMeanSquaredError {
    loss_sum: f64,
    frames: usize,
}

impl LossMeanSquaredError {
    pub fn new() -> LossMeanSquaredError {
        LossMeanSquaredError::default()
    }
}

impl LossFunction for LossMeanSquaredError {
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
        let nodes = y.node_size().max(1) as f32;
        (0..y.frame_size())
            .map(|frame| {
                (0..y.node_size())
                    .map(|node| {
                        let d = y.get_fp32(frame, node) - t.get_fp32(frame, node);
                        d * d
                    })
                    .sum::<f32>()
                    / nodes
            })
            .collect()
    }

    fn calculate_loss(&mut self, y: &FrameBuffer, t: &FrameBuffer) -> FrameBuffer {
        let per_frame = self.frame_loss(y, t);
        self.loss_sum += per_frame.iter().map(|&v| v as f64).sum::<f64>();
        self.frames += y.frame_size();

        let y = y.convert(DataType::Fp32);
        let t = t.convert(DataType::Fp32);
        let scale = 2.0 / (y.frame_size() * y.node_size()).max(1) as f32;
        let mut dy = FrameBuffer::new(y.frame_size(), y.shape(), DataType::Fp32);
        for_each_fp32_row(&mut dy, |node, row| {
            for ((d, &yv), &tv) in row.iter_mut().zip(y.fp32_row(node)).zip(t.fp32_row(node)) {
                *d = (yv - tv) * scale;
            }
        });
        dy
    }
}
