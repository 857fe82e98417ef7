//! Stochastic real/binary conversion with frame multiplexing.
//!
//! [`RealToBinary`] turns every input frame into `mux_size` consecutive
//! binary frames; [`BinaryToReal`] averages each group back into one frame.
//! Layers in between treat every physical frame identically.

use std::cell::RefCell;
use std::io::{Read, Write};
use std::rc::Rc;

use rand::rngs::StdRng;
use rand::Rng;

use crate::buffer::{shape_size, DataType, FrameBuffer};
use crate::error::Result;
use crate::layers::rows::{for_each_bit_row, for_each_fp32_row, set_bit};
use crate::math::init::seeded_rng;
use crate::model::serialize::{read_name, read_u64, write_name, write_u64};
use crate::model::Model;

#[derive(Debug)]
pub struct RealToBinary {
    name: String,
    mux_size: usize,
    output_type: DataType,
    rng: StdRng,
    shape: Vec<usize>,
    input_frame_size: Option<usize>,
}

impl RealToBinary {
    pub fn new(mux_size: usize, seed: u64) -> RealToBinary {
        assert!(mux_size > 0, "mux size must be positive");
        RealToBinary {
            name: String::new(),
            mux_size,
            output_type: DataType::Bit,
            rng: seeded_rng(seed),
            shape: Vec::new(),
            input_frame_size: None,
        }
    }

    pub fn create(mux_size: usize, seed: u64) -> Rc<RefCell<RealToBinary>> {
        Rc::new(RefCell::new(Self::new(mux_size, seed)))
    }

    /// `Bit` (default) or `Fp32` 0/1 output.
    pub fn with_output_type(mut self, output_type: DataType) -> RealToBinary {
        assert!(
            matches!(output_type, DataType::Bit | DataType::Fp32),
            "unsupported output type {output_type:?}"
        );
        self.output_type = output_type;
        self
    }

    pub fn mux_size(&self) -> usize {
        self.mux_size
    }
}

impl Model for RealToBinary {
    fn class_name(&self) -> &'static str {
        "RealToBinary"
    }

    fn instance_name(&self) -> &str {
        &self.name
    }

    fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }

    fn set_input_shape(&mut self, shape: &[usize]) -> Vec<usize> {
        self.shape = shape.to_vec();
        self.input_frame_size = None;
        self.shape.clone()
    }

    fn input_shape(&self) -> Vec<usize> {
        self.shape.clone()
    }

    fn output_shape(&self) -> Vec<usize> {
        self.shape.clone()
    }

    /// Frame `f` becomes frames `f * mux .. (f + 1) * mux`. Thresholds are
    /// uniform random while training and evenly spaced otherwise.
    fn forward(&mut self, x: FrameBuffer, train: bool) -> FrameBuffer {
        assert_eq!(x.node_size(), shape_size(&self.shape), "{}: input node size mismatch", self.name());
        let x = x.convert(DataType::Fp32);
        let mux = self.mux_size;
        let nodes = x.node_size();
        let out_frames = x.frame_size() * mux;

        let thresholds: Vec<f32> = if train {
            (0..nodes * out_frames).map(|_| self.rng.gen::<f32>()).collect()
        } else {
            (0..nodes * out_frames)
                .map(|i| ((i % out_frames) % mux) as f32 / mux as f32 + 0.5 / mux as f32)
                .collect()
        };

        let mut y = FrameBuffer::new(out_frames, &self.shape, self.output_type);
        match self.output_type {
            DataType::Bit => for_each_bit_row(&mut y, |node, row| {
                let t = &thresholds[node * out_frames..(node + 1) * out_frames];
                for (frame, &v) in x.fp32_row(node).iter().enumerate() {
                    for m in 0..mux {
                        let out = frame * mux + m;
                        if v > t[out] {
                            set_bit(row, out);
                        }
                    }
                }
            }),
            _ => for_each_fp32_row(&mut y, |node, row| {
                let t = &thresholds[node * out_frames..(node + 1) * out_frames];
                for (frame, &v) in x.fp32_row(node).iter().enumerate() {
                    for m in 0..mux {
                        let out = frame * mux + m;
                        row[out] = if v > t[out] { 1.0 } else { 0.0 };
                    }
                }
            }),
        }
        self.input_frame_size = Some(x.frame_size());
        y
    }

    /// Straight-through: each input frame receives the sum of its group.
    fn backward(&mut self, dy: FrameBuffer) -> FrameBuffer {
        let Some(frame_size) = self.input_frame_size else {
            panic!("{}: backward called before forward", self.name());
        };
        let dy = dy.convert(DataType::Fp32);
        let mux = self.mux_size;
        assert_eq!(dy.frame_size(), frame_size * mux, "{}: gradient frame size mismatch", self.name());
        let mut dx = FrameBuffer::new(frame_size, &self.shape, DataType::Fp32);
        for_each_fp32_row(&mut dx, |node, row| {
            let g = dy.fp32_row(node);
            for (frame, d) in row.iter_mut().enumerate() {
                *d = g[frame * mux..(frame + 1) * mux].iter().sum();
            }
        });
        dx
    }

    fn save(&self, w: &mut dyn Write) -> Result<()> {
        write_name(w, &self.name)?;
        write_u64(w, self.mux_size as u64)
    }

    fn load(&mut self, r: &mut dyn Read) -> Result<()> {
        self.name = read_name(r)?;
        self.mux_size = read_u64(r)? as usize;
        Ok(())
    }
}

/// Averages mux groups back to real values and folds input nodes onto
/// output nodes: input node `i` contributes to output `i % output_nodes`.
#[derive(Debug)]
pub struct BinaryToReal {
    name: String,
    mux_size: usize,
    input_shape: Vec<usize>,
    output_shape: Vec<usize>,
    requested_shape: Vec<usize>,
    input_frame_size: Option<usize>,
}

impl BinaryToReal {
    /// An empty `output_shape` keeps the input shape.
    pub fn new(output_shape: &[usize], mux_size: usize) -> BinaryToReal {
        assert!(mux_size > 0, "mux size must be positive");
        BinaryToReal {
            name: String::new(),
            mux_size,
            input_shape: Vec::new(),
            output_shape: output_shape.to_vec(),
            requested_shape: output_shape.to_vec(),
            input_frame_size: None,
        }
    }

    pub fn create(output_shape: &[usize], mux_size: usize) -> Rc<RefCell<BinaryToReal>> {
        Rc::new(RefCell::new(Self::new(output_shape, mux_size)))
    }

    pub fn mux_size(&self) -> usize {
        self.mux_size
    }

    /// Number of (frame, input node) samples averaged into output node `o`.
    fn fold_count(&self, output: usize) -> usize {
        let inputs = shape_size(&self.input_shape);
        let outputs = shape_size(&self.output_shape);
        (inputs - output).div_ceil(outputs) * self.mux_size
    }
}

impl Model for BinaryToReal {
    fn class_name(&self) -> &'static str {
        "BinaryToReal"
    }

    fn instance_name(&self) -> &str {
        &self.name
    }

    fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }

    fn set_input_shape(&mut self, shape: &[usize]) -> Vec<usize> {
        self.input_shape = shape.to_vec();
        self.output_shape = if self.requested_shape.is_empty() {
            shape.to_vec()
        } else {
            self.requested_shape.clone()
        };
        assert!(
            shape_size(&self.output_shape) <= shape_size(shape),
            "{}: cannot fold {:?} onto a larger {:?}",
            self.name(),
            shape,
            self.output_shape
        );
        self.input_frame_size = None;
        self.output_shape.clone()
    }

    fn input_shape(&self) -> Vec<usize> {
        self.input_shape.clone()
    }

    fn output_shape(&self) -> Vec<usize> {
        self.output_shape.clone()
    }

    fn forward(&mut self, x: FrameBuffer, _train: bool) -> FrameBuffer {
        let inputs = shape_size(&self.input_shape);
        let outputs = shape_size(&self.output_shape);
        assert_eq!(x.node_size(), inputs, "{}: input node size mismatch", self.name());
        let mux = self.mux_size;
        assert_eq!(
            x.frame_size() % mux,
            0,
            "{}: {} frames are not a multiple of mux size {}",
            self.name(),
            x.frame_size(),
            mux
        );
        let x = x.convert(DataType::Fp32);
        let frame_size = x.frame_size() / mux;
        let counts: Vec<f32> = (0..outputs).map(|o| self.fold_count(o) as f32).collect();

        let mut y = FrameBuffer::new(frame_size, &self.output_shape, DataType::Fp32);
        for_each_fp32_row(&mut y, |out, row| {
            for input in (out..inputs).step_by(outputs) {
                let xs = x.fp32_row(input);
                for (frame, v) in row.iter_mut().enumerate() {
                    *v += xs[frame * mux..(frame + 1) * mux].iter().sum::<f32>();
                }
            }
            for v in row.iter_mut() {
                *v /= counts[out];
            }
        });
        self.input_frame_size = Some(x.frame_size());
        y
    }

    fn backward(&mut self, dy: FrameBuffer) -> FrameBuffer {
        let Some(input_frames) = self.input_frame_size else {
            panic!("{}: backward called before forward", self.name());
        };
        let dy = dy.convert(DataType::Fp32);
        let mux = self.mux_size;
        let outputs = shape_size(&self.output_shape);
        let counts: Vec<f32> = (0..outputs).map(|o| self.fold_count(o) as f32).collect();

        let mut dx = FrameBuffer::new(input_frames, &self.input_shape, DataType::Fp32);
        for_each_fp32_row(&mut dx, |input, row| {
            let out = input % outputs;
            let g = dy.fp32_row(out);
            for (frame, d) in row.iter_mut().enumerate() {
                *d = g[frame / mux] / counts[out];
            }
        });
        dx
    }

    fn save(&self, w: &mut dyn Write) -> Result<()> {
        write_name(w, &self.name)?;
        write_u64(w, self.mux_size as u64)
    }

    fn load(&mut self, r: &mut dyn Read) -> Result<()> {
        self.name = read_name(r)?;
        self.mux_size = read_u64(r)? as usize;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn real_input(values: &[f32]) -> FrameBuffer {
        let mut x = FrameBuffer::new(values.len(), &[1], DataType::Fp32);
        for (frame, &v) in values.iter().enumerate() {
            x.set_fp32(frame, 0, v);
        }
        x
    }

    #[test]
    fn test_inference_thresholds_are_even() {
        let mut r2b = RealToBinary::new(4, 1);
        r2b.set_input_shape(&[1]);
        let y = r2b.forward(real_input(&[0.5, 1.0, 0.0]), false);
        assert_eq!(y.frame_size(), 12);
        assert_eq!(y.data_type(), DataType::Bit);
        let ones = |f: usize| (0..4).filter(|&m| y.get_binary(f * 4 + m, 0)).count();
        assert_eq!(ones(0), 2);
        assert_eq!(ones(1), 4);
        assert_eq!(ones(2), 0);
    }

    #[test]
    fn test_mux_round_trip_recovers_level() {
        let mut r2b = RealToBinary::new(8, 1);
        let mut b2r = BinaryToReal::new(&[], 8);
        r2b.set_input_shape(&[1]);
        b2r.set_input_shape(&[1]);
        let y = b2r.forward(r2b.forward(real_input(&[0.25, 0.75]), false), false);
        assert_eq!(y.frame_size(), 2);
        assert!((y.get_fp32(0, 0) - 0.25).abs() < 1e-6);
        assert!((y.get_fp32(1, 0) - 0.75).abs() < 1e-6);
    }

    #[test]
    fn test_training_mux_is_stochastic_but_unbiased() {
        let mut r2b = RealToBinary::new(1000, 7);
        r2b.set_input_shape(&[1]);
        let y = r2b.forward(real_input(&[0.3]), true);
        let ones = (0..1000).filter(|&f| y.get_binary(f, 0)).count();
        assert!((250..350).contains(&ones), "{ones} ones");
    }

    #[test]
    fn test_fold_onto_output_nodes() {
        let mut b2r = BinaryToReal::new(&[2], 1);
        b2r.set_input_shape(&[6]);
        let mut x = FrameBuffer::new(1, &[6], DataType::Fp32);
        for node in 0..6 {
            x.set_fp32(0, node, node as f32);
        }
        let y = b2r.forward(x, true);
        // node 0 <- {0, 2, 4}, node 1 <- {1, 3, 5}
        assert_eq!(y.frame_values(0), vec![2.0, 3.0]);

        let mut dy = FrameBuffer::new(1, &[2], DataType::Fp32);
        dy.set_fp32(0, 0, 3.0);
        dy.set_fp32(0, 1, 6.0);
        let dx = b2r.backward(dy);
        assert_eq!(dx.frame_values(0), vec![1.0, 2.0, 1.0, 2.0, 1.0, 2.0]);
    }

    #[test]
    fn test_real_to_binary_backward_sums_group() {
        let mut r2b = RealToBinary::new(3, 1).with_output_type(DataType::Fp32);
        r2b.set_input_shape(&[1]);
        r2b.forward(real_input(&[0.5]), true);
        let mut dy = FrameBuffer::new(3, &[1], DataType::Fp32);
        for f in 0..3 {
            dy.set_fp32(f, 0, f as f32 + 1.0);
        }
        assert_eq!(r2b.backward(dy).get_fp32(0, 0), 6.0);
    }
}
