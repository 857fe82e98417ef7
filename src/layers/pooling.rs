use std::cell::RefCell;
use std::io::{Read, Write};
use std::rc::Rc;

use rayon::prelude::*;

use crate::buffer::{shape_size, DataType, FrameBuffer};
use crate::error::Result;
use crate::layers::rows::{for_each_bit_row, for_each_fp32_row, get_bit};
use crate::model::serialize::{read_name, write_name};
use crate::model::{Filter2d, Model};

/// Non-overlapping max pooling over `[w, h, c]`.
///
/// The output extent is rounded up, so edge windows may be partial. For
/// `Bit` inputs the maximum is the OR of the window. The gradient is routed
/// to the first input of each window that holds the maximum.
#[derive(Debug)]
pub struct MaxPooling {
    name: String,
    filter_h: usize,
    filter_w: usize,
    input_shape: Vec<usize>,
    output_shape: Vec<usize>,
    x: Option<FrameBuffer>,
    y: Option<FrameBuffer>,
}

impl MaxPooling {
    pub fn new(filter_h: usize, filter_w: usize) -> MaxPooling {
        assert!(filter_h > 0 && filter_w > 0, "filter must not be empty");
        MaxPooling {
            name: String::new(),
            filter_h,
            filter_w,
            input_shape: Vec::new(),
            output_shape: Vec::new(),
            x: None,
            y: None,
        }
    }

    pub fn create(filter_h: usize, filter_w: usize) -> Rc<RefCell<MaxPooling>> {
        Rc::new(RefCell::new(Self::new(filter_h, filter_w)))
    }

    /// Input nodes covered by output pixel `(c, oy, ox)`, row-major.
    fn window(&self, c: usize, oy: usize, ox: usize) -> Vec<usize> {
        let (iw, ih) = (self.input_shape[0], self.input_shape[1]);
        let mut nodes = Vec::with_capacity(self.filter_h * self.filter_w);
        for iy in oy * self.filter_h..((oy + 1) * self.filter_h).min(ih) {
            for ix in ox * self.filter_w..((ox + 1) * self.filter_w).min(iw) {
                nodes.push((c * ih + iy) * iw + ix);
            }
        }
        nodes
    }

    fn windows(&self) -> Vec<Vec<usize>> {
        let (ow, oh, oc) = (self.output_shape[0], self.output_shape[1], self.output_shape[2]);
        let mut windows = Vec::with_capacity(ow * oh * oc);
        for c in 0..oc {
            for oy in 0..oh {
                for ox in 0..ow {
                    windows.push(self.window(c, oy, ox));
                }
            }
        }
        windows
    }
}

impl Filter2d for MaxPooling {
    fn filter_height(&self) -> usize {
        self.filter_h
    }

    fn filter_width(&self) -> usize {
        self.filter_w
    }
}

impl Model for MaxPooling {
    fn class_name(&self) -> &'static str {
        "MaxPooling"
    }

    fn instance_name(&self) -> &str {
        &self.name
    }

    fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }

    fn set_input_shape(&mut self, shape: &[usize]) -> Vec<usize> {
        assert_eq!(shape.len(), 3, "{}: input must be [w, h, c], got {shape:?}", self.name());
        self.input_shape = shape.to_vec();
        self.output_shape = vec![
            shape[0].div_ceil(self.filter_w),
            shape[1].div_ceil(self.filter_h),
            shape[2],
        ];
        self.x = None;
        self.y = None;
        self.output_shape.clone()
    }

    fn input_shape(&self) -> Vec<usize> {
        self.input_shape.clone()
    }

    fn output_shape(&self) -> Vec<usize> {
        self.output_shape.clone()
    }

    fn forward(&mut self, x: FrameBuffer, _train: bool) -> FrameBuffer {
        assert_eq!(
            x.node_size(),
            shape_size(&self.input_shape),
            "{}: input node size mismatch",
            self.name()
        );
        let x = match x.data_type() {
            DataType::Bit | DataType::Fp32 => x,
            _ => x.convert(DataType::Fp32),
        };
        let windows = self.windows();
        let mut y = FrameBuffer::new(x.frame_size(), &self.output_shape, x.data_type());
        if x.data_type() == DataType::Bit {
            for_each_bit_row(&mut y, |node, row| {
                for &input in &windows[node] {
                    for (out, &word) in row.iter_mut().zip(x.bit_row(input)) {
                        *out |= word;
                    }
                }
            });
        } else {
            for_each_fp32_row(&mut y, |node, row| {
                row.fill(f32::NEG_INFINITY);
                for &input in &windows[node] {
                    for (out, &v) in row.iter_mut().zip(x.fp32_row(input)) {
                        *out = out.max(v);
                    }
                }
            });
        }
        self.x = Some(x);
        self.y = Some(y.clone());
        y
    }

    fn backward(&mut self, dy: FrameBuffer) -> FrameBuffer {
        let (Some(x), Some(y)) = (&self.x, &self.y) else {
            panic!("{}: backward called before forward", self.name());
        };
        let dy = dy.convert(DataType::Fp32);
        let frame_size = x.frame_size();
        let windows = self.windows();
        let (iw, ih) = (self.input_shape[0], self.input_shape[1]);
        let plane_outputs = self.output_shape[0] * self.output_shape[1];
        let bits = x.data_type() == DataType::Bit;

        let mut dx = FrameBuffer::new(frame_size, &self.input_shape, DataType::Fp32);
        let stride = dx.node_stride();
        if stride > 0 {
            // windows never cross channels, so each channel plane is independent
            dx.fp32_storage_mut()
                .par_chunks_mut(stride * ih * iw)
                .enumerate()
                .for_each(|(c, plane)| {
                    let base = c * ih * iw;
                    for out in c * plane_outputs..(c + 1) * plane_outputs {
                        let g = dy.fp32_row(out);
                        for frame in 0..frame_size {
                            let winner = windows[out].iter().copied().find(|&input| {
                                if bits {
                                    get_bit(x.bit_row(input), frame) == get_bit(y.bit_row(out), frame)
                                } else {
                                    x.fp32_row(input)[frame] == y.fp32_row(out)[frame]
                                }
                            });
                            if let Some(input) = winner {
                                plane[(input - base) * stride + frame] += g[frame];
                            }
                        }
                    }
                });
        }
        dx
    }

    fn save(&self, w: &mut dyn Write) -> Result<()> {
        write_name(w, &self.name)
    }

    fn load(&mut self, r: &mut dyn Read) -> Result<()> {
        self.name = read_name(r)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ceil_extent_and_max() {
        let mut pool = MaxPooling::new(2, 2);
        assert_eq!(pool.set_input_shape(&[3, 3, 1]), vec![2, 2, 1]);
        let mut x = FrameBuffer::new(1, &[3, 3, 1], DataType::Fp32);
        for node in 0..9 {
            x.set_fp32(0, node, [1.0, 5.0, 2.0, 3.0, 4.0, 9.0, 7.0, 0.0, 6.0][node]);
        }
        let y = pool.forward(x, true);
        assert_eq!(y.frame_values(0), vec![5.0, 9.0, 7.0, 6.0]);

        let mut dy = FrameBuffer::new(1, &[2, 2, 1], DataType::Fp32);
        for node in 0..4 {
            dy.set_fp32(0, node, node as f32 + 1.0);
        }
        let dx = pool.backward(dy);
        assert_eq!(dx.frame_values(0), vec![0.0, 1.0, 0.0, 0.0, 0.0, 2.0, 3.0, 0.0, 4.0]);
    }

    #[test]
    fn test_gradient_goes_to_first_maximum() {
        let mut pool = MaxPooling::new(1, 2);
        pool.set_input_shape(&[2, 1, 1]);
        let mut x = FrameBuffer::new(1, &[2, 1, 1], DataType::Fp32);
        x.set_fp32(0, 0, 1.0);
        x.set_fp32(0, 1, 1.0);
        pool.forward(x, true);
        let mut dy = FrameBuffer::new(1, &[1, 1, 1], DataType::Fp32);
        dy.set_fp32(0, 0, 1.0);
        assert_eq!(pool.backward(dy).frame_values(0), vec![1.0, 0.0]);
    }

    #[test]
    fn test_bit_pooling_is_or() {
        let mut pool = MaxPooling::new(2, 2);
        pool.set_input_shape(&[2, 2, 2]);
        let mut x = FrameBuffer::new(70, &[2, 2, 2], DataType::Bit);
        x.set_binary(69, 3, true);
        x.set_binary(5, 4, true);
        let y = pool.forward(x, false);
        assert_eq!(y.data_type(), DataType::Bit);
        assert!(y.get_binary(69, 0));
        assert!(!y.get_binary(69, 1));
        assert!(y.get_binary(5, 1));
        assert!(!y.get_binary(0, 0));
    }
}
