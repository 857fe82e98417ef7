use std::cell::RefCell;
use std::io::{Read, Write};
use std::rc::Rc;

use rayon::prelude::*;

use crate::buffer::{shape_size, DataType, FrameBuffer};
use crate::error::{Error, Result};
use crate::math::init::{he, seeded_rng};
use crate::model::command::parse_bool_command;
use crate::model::serialize::{
    read_bool, read_name, read_shape, read_tensor, write_bool, write_name, write_shape,
    write_tensor,
};
use crate::model::{Filter2d, Model};
use crate::variables::{tensor_ref, Tensor, TensorRef, Variables};

/// Extents of a valid-only convolution, all `(width, height, channels)`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Geometry {
    iw: usize,
    ih: usize,
    ic: usize,
    ow: usize,
    oh: usize,
    oc: usize,
    fw: usize,
    fh: usize,
}

impl Geometry {
    fn input_node(&self, c: usize, y: usize, x: usize) -> usize {
        (c * self.ih + y) * self.iw + x
    }

    fn weight(&self, n: usize, c: usize, fy: usize, fx: usize) -> usize {
        ((n * self.ic + c) * self.fh + fy) * self.fw + fx
    }
}

/// Direct 2D convolution over `[width, height, channels]` inputs.
///
/// `y[n, y, x] = b[n] + Σ W[n, c, fy, fx] · x[c, y + fy, x + fx]`, with an
/// output extent of `input - filter + 1` (no padding, stride 1).
/// `W` has shape `[out_channels, in_channels, filter_h, filter_w]`.
#[derive(Debug)]
pub struct Convolution {
    name: String,
    seed: u64,
    output_channels: usize,
    filter_h: usize,
    filter_w: usize,
    binary_mode: bool,
    input_shape: Vec<usize>,
    output_shape: Vec<usize>,
    geometry: Geometry,
    w: TensorRef,
    b: TensorRef,
    dw: TensorRef,
    db: TensorRef,
    x: Option<FrameBuffer>,
}

impl Convolution {
    pub fn new(output_channels: usize, filter_h: usize, filter_w: usize, seed: u64) -> Convolution {
        assert!(filter_h > 0 && filter_w > 0, "filter must not be empty");
        Convolution {
            name: String::new(),
            seed,
            output_channels,
            filter_h,
            filter_w,
            binary_mode: false,
            input_shape: Vec::new(),
            output_shape: Vec::new(),
            geometry: Geometry::default(),
            w: tensor_ref(Tensor::zeros(&[output_channels, 0, filter_h, filter_w])),
            b: tensor_ref(Tensor::zeros(&[output_channels])),
            dw: tensor_ref(Tensor::zeros(&[output_channels, 0, filter_h, filter_w])),
            db: tensor_ref(Tensor::zeros(&[output_channels])),
            x: None,
        }
    }

    pub fn create(
        output_channels: usize,
        filter_h: usize,
        filter_w: usize,
        seed: u64,
    ) -> Rc<RefCell<Convolution>> {
        Rc::new(RefCell::new(Self::new(output_channels, filter_h, filter_w, seed)))
    }

    pub fn w(&self) -> TensorRef {
        self.w.clone()
    }

    pub fn b(&self) -> TensorRef {
        self.b.clone()
    }

    pub fn dw(&self) -> TensorRef {
        self.dw.clone()
    }

    pub fn db(&self) -> TensorRef {
        self.db.clone()
    }

    pub fn set_binary_mode(&mut self, enable: bool) {
        self.binary_mode = enable;
    }

    pub fn binary_mode(&self) -> bool {
        self.binary_mode
    }
}

impl Filter2d for Convolution {
    fn filter_height(&self) -> usize {
        self.filter_h
    }

    fn filter_width(&self) -> usize {
        self.filter_w
    }
}

impl Model for Convolution {
    fn class_name(&self) -> &'static str {
        "Convolution"
    }

    fn instance_name(&self) -> &str {
        &self.name
    }

    fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }

    fn command_proc(&mut self, args: &[String]) {
        if let Some(enable) = parse_bool_command(args, "binary") {
            self.binary_mode = enable;
        }
    }

    fn get_parameters(&self) -> Variables {
        let mut vars = Variables::new();
        vars.push(self.w.clone());
        vars.push(self.b.clone());
        vars
    }

    fn get_gradients(&self) -> Variables {
        let mut vars = Variables::new();
        vars.push(self.dw.clone());
        vars.push(self.db.clone());
        vars
    }

    fn set_input_shape(&mut self, shape: &[usize]) -> Vec<usize> {
        assert_eq!(shape.len(), 3, "{}: input must be [w, h, c], got {shape:?}", self.name());
        if shape == self.input_shape.as_slice() {
            return self.output_shape.clone();
        }
        let (iw, ih, ic) = (shape[0], shape[1], shape[2]);
        assert!(
            iw >= self.filter_w && ih >= self.filter_h,
            "{}: input {iw}x{ih} is smaller than the {}x{} filter",
            self.name(),
            self.filter_w,
            self.filter_h
        );
        let geometry = Geometry {
            iw,
            ih,
            ic,
            ow: iw - self.filter_w + 1,
            oh: ih - self.filter_h + 1,
            oc: self.output_channels,
            fw: self.filter_w,
            fh: self.filter_h,
        };
        self.geometry = geometry;
        self.input_shape = shape.to_vec();
        self.output_shape = vec![geometry.ow, geometry.oh, geometry.oc];

        let w_shape = [geometry.oc, ic, geometry.fh, geometry.fw];
        let fan_in = ic * geometry.fh * geometry.fw;
        let mut rng = seeded_rng(self.seed);
        *self.w.borrow_mut() = Tensor::from_vec(&w_shape, he(&mut rng, shape_size(&w_shape), fan_in));
        *self.b.borrow_mut() = Tensor::zeros(&[geometry.oc]);
        *self.dw.borrow_mut() = Tensor::zeros(&w_shape);
        *self.db.borrow_mut() = Tensor::zeros(&[geometry.oc]);
        self.x = None;
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
        let x = x.convert(DataType::Fp32);
        let g = self.geometry;
        let frame_size = x.frame_size();
        let w = self.w.borrow();
        let b = self.b.borrow();
        let (w, b) = (w.data(), b.data());

        let mut y = FrameBuffer::new(frame_size, &self.output_shape, DataType::Fp32);
        let stride = y.node_stride();
        if stride > 0 {
            y.fp32_storage_mut()
                .par_chunks_mut(stride * g.oh * g.ow)
                .enumerate()
                .for_each(|(n, plane)| {
                    for oy in 0..g.oh {
                        for ox in 0..g.ow {
                            let start = (oy * g.ow + ox) * stride;
                            let row = &mut plane[start..start + frame_size];
                            row.fill(b[n]);
                            for c in 0..g.ic {
                                for fy in 0..g.fh {
                                    for fx in 0..g.fw {
                                        let weight = w[g.weight(n, c, fy, fx)];
                                        let xs = x.fp32_row(g.input_node(c, oy + fy, ox + fx));
                                        for (v, &xv) in row.iter_mut().zip(xs) {
                                            *v += weight * xv;
                                        }
                                    }
                                }
                            }
                        }
                    }
                });
        }
        self.x = Some(x);
        y
    }

    fn backward(&mut self, dy: FrameBuffer) -> FrameBuffer {
        let Some(x) = &self.x else {
            panic!("{}: backward called before forward", self.name());
        };
        let dy = dy.convert(DataType::Fp32);
        let g = self.geometry;
        let frame_size = x.frame_size();
        assert_eq!(dy.frame_size(), frame_size, "{}: gradient frame size mismatch", self.name());
        let output_node = |n: usize, oy: usize, ox: usize| (n * g.oh + oy) * g.ow + ox;

        let w = self.w.borrow();
        let w = w.data();

        // dW: correlation of the input with dy
        let mut dw = self.dw.borrow_mut();
        dw.data_mut()
            .par_chunks_mut(g.ic * g.fh * g.fw)
            .enumerate()
            .for_each(|(n, dw)| {
                for c in 0..g.ic {
                    for fy in 0..g.fh {
                        for fx in 0..g.fw {
                            let mut acc = 0.0f32;
                            for oy in 0..g.oh {
                                for ox in 0..g.ow {
                                    let gs = dy.fp32_row(output_node(n, oy, ox));
                                    let xs = x.fp32_row(g.input_node(c, oy + fy, ox + fx));
                                    acc += gs.iter().zip(xs).map(|(a, b)| a * b).sum::<f32>();
                                }
                            }
                            dw[(c * g.fh + fy) * g.fw + fx] += acc;
                        }
                    }
                }
            });

        let mut db = self.db.borrow_mut();
        db.data_mut().par_iter_mut().enumerate().for_each(|(n, db)| {
            for node in output_node(n, 0, 0)..output_node(n + 1, 0, 0) {
                *db += dy.fp32_row(node).iter().sum::<f32>();
            }
        });

        // dx: full convolution of dy with the flipped filter
        let mut dx = FrameBuffer::new(frame_size, &self.input_shape, DataType::Fp32);
        let stride = dx.node_stride();
        if stride > 0 {
            dx.fp32_storage_mut()
                .par_chunks_mut(stride * g.ih * g.iw)
                .enumerate()
                .for_each(|(c, plane)| {
                    for iy in 0..g.ih {
                        for ix in 0..g.iw {
                            let start = (iy * g.iw + ix) * stride;
                            let row = &mut plane[start..start + frame_size];
                            for n in 0..g.oc {
                                for fy in 0..g.fh {
                                    if iy < fy || iy - fy >= g.oh {
                                        continue;
                                    }
                                    for fx in 0..g.fw {
                                        if ix < fx || ix - fx >= g.ow {
                                            continue;
                                        }
                                        let weight = w[g.weight(n, c, fy, fx)];
                                        let gs = dy.fp32_row(output_node(n, iy - fy, ix - fx));
                                        for (d, &gv) in row.iter_mut().zip(gs) {
                                            *d += weight * gv;
                                        }
                                    }
                                }
                            }
                        }
                    }
                });
        }
        dx
    }

    fn after_update(&mut self) {
        if self.binary_mode {
            self.w.borrow_mut().clamp(-1.0, 1.0);
        }
    }

    fn save(&self, w: &mut dyn Write) -> Result<()> {
        write_name(w, &self.name)?;
        write_bool(w, self.binary_mode)?;
        write_shape(w, &self.input_shape)?;
        write_tensor(w, &self.w.borrow())?;
        write_tensor(w, &self.b.borrow())
    }

    fn load(&mut self, r: &mut dyn Read) -> Result<()> {
        self.name = read_name(r)?;
        self.binary_mode = read_bool(r)?;
        let input_shape = read_shape(r)?;
        self.input_shape.clear();
        if input_shape.is_empty() {
            // saved before shaping
            let (oc, fh, fw) = (self.output_channels, self.filter_h, self.filter_w);
            self.output_shape.clear();
            self.geometry = Geometry::default();
            *self.w.borrow_mut() = Tensor::zeros(&[oc, 0, fh, fw]);
            *self.b.borrow_mut() = Tensor::zeros(&[oc]);
            *self.dw.borrow_mut() = Tensor::zeros(&[oc, 0, fh, fw]);
            *self.db.borrow_mut() = Tensor::zeros(&[oc]);
            self.x = None;
        } else if input_shape.len() != 3
            || input_shape[0] < self.filter_w
            || input_shape[1] < self.filter_h
        {
            return Err(Error::InvalidFormat {
                message: format!("{}: cannot shape for input {:?}", self.name(), input_shape),
            });
        } else {
            self.set_input_shape(&input_shape);
        }
        read_tensor(r, &mut self.w.borrow_mut())?;
        read_tensor(r, &mut self.b.borrow_mut())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::init::{normal, seeded_rng};
    use crate::model::filter2d::{input_channels, output_height, output_width};

    fn random_buffer(frames: usize, shape: &[usize], seed: u64) -> FrameBuffer {
        let mut rng = seeded_rng(seed);
        let values = normal(&mut rng, frames * shape_size(shape), 0.0, 1.0);
        let mut buf = FrameBuffer::new(frames, shape, DataType::Fp32);
        for node in 0..shape_size(shape) {
            for f in 0..frames {
                buf.set_fp32(f, node, values[node * frames + f]);
            }
        }
        buf
    }

    /// Scalar reference for one frame.
    fn reference(conv: &Convolution, x: &FrameBuffer, frame: usize) -> Vec<f32> {
        let g = conv.geometry;
        let w = conv.w.borrow();
        let b = conv.b.borrow();
        let mut y = vec![0.0; g.oc * g.oh * g.ow];
        for n in 0..g.oc {
            for oy in 0..g.oh {
                for ox in 0..g.ow {
                    let mut sum = b[n];
                    for c in 0..g.ic {
                        for fy in 0..g.fh {
                            for fx in 0..g.fw {
                                sum += w[g.weight(n, c, fy, fx)]
                                    * x.get_fp32(frame, g.input_node(c, oy + fy, ox + fx));
                            }
                        }
                    }
                    y[(n * g.oh + oy) * g.ow + ox] = sum;
                }
            }
        }
        y
    }

    fn layer() -> Convolution {
        let mut conv = Convolution::new(2, 2, 3, 11);
        conv.set_input_shape(&[5, 4, 3]);
        conv.b.borrow_mut().data_mut().copy_from_slice(&[0.5, -0.25]);
        conv
    }

    #[test]
    fn test_geometry() {
        let conv = layer();
        assert_eq!(conv.output_shape(), vec![3, 3, 2]);
        assert_eq!(output_width(&conv), 3);
        assert_eq!(output_height(&conv), 3);
        assert_eq!(input_channels(&conv), 3);
        assert_eq!(conv.w.borrow().shape(), &[2, 3, 2, 3]);
    }

    #[test]
    fn test_forward_matches_reference() {
        let mut conv = layer();
        let x = random_buffer(3, &[5, 4, 3], 1);
        let y = conv.forward(x.clone(), false);
        for frame in 0..3 {
            let expected = reference(&conv, &x, frame);
            for (a, b) in y.frame_values(frame).iter().zip(&expected) {
                assert!((a - b).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn test_backward_matches_finite_differences() {
        let mut conv = layer();
        let x = random_buffer(2, &[5, 4, 3], 2);
        // L = Σ r · y is linear in both x and W
        let r = random_buffer(2, &[3, 3, 2], 3);
        let loss = |conv: &mut Convolution, x: &FrameBuffer| -> f32 {
            let y = conv.forward(x.clone(), false);
            (0..2)
                .map(|f| {
                    y.frame_values(f)
                        .iter()
                        .zip(r.frame_values(f))
                        .map(|(a, b)| a * b)
                        .sum::<f32>()
                })
                .sum()
        };

        conv.forward(x.clone(), true);
        let dx = conv.backward(r.clone());
        let h = 1e-2;
        for &(frame, node) in &[(0, 0), (1, 7), (0, 33), (1, 59)] {
            let mut xp = x.clone();
            xp.set_fp32(frame, node, x.get_fp32(frame, node) + h);
            let mut xm = x.clone();
            xm.set_fp32(frame, node, x.get_fp32(frame, node) - h);
            let numeric = (loss(&mut conv, &xp) - loss(&mut conv, &xm)) / (2.0 * h);
            assert!((numeric - dx.get_fp32(frame, node)).abs() < 1e-2, "dx at {frame},{node}");
        }

        let dw = conv.dw.borrow().clone();
        for &i in &[0usize, 5, 17, 35] {
            let original = conv.w.borrow()[i];
            conv.w.borrow_mut()[i] = original + h;
            let lp = loss(&mut conv, &x);
            conv.w.borrow_mut()[i] = original - h;
            let lm = loss(&mut conv, &x);
            conv.w.borrow_mut()[i] = original;
            assert!(((lp - lm) / (2.0 * h) - dw[i]).abs() < 1e-2, "dW at {i}");
        }

        let r_sum: f32 = (0..2).map(|f| r.frame_values(f)[..9].iter().sum::<f32>()).sum();
        assert!((conv.db.borrow()[0] - r_sum).abs() < 1e-4);
    }

    #[test]
    fn test_binary_mode_clamps_after_update() {
        let mut conv = layer();
        conv.w.borrow_mut()[0] = 3.0;
        conv.after_update();
        assert_eq!(conv.w.borrow()[0], 3.0);
        conv.send_command("binary true", "all");
        conv.after_update();
        assert_eq!(conv.w.borrow()[0], 1.0);
    }

    #[test]
    fn test_unshaped_save_load() {
        let conv = Convolution::new(2, 2, 3, 1);
        let mut bytes = Vec::new();
        conv.save(&mut bytes).unwrap();

        let mut copy = layer();
        copy.load(&mut bytes.as_slice()).unwrap();
        assert!(copy.input_shape().is_empty());
        assert!(copy.output_shape().is_empty());
        assert_eq!(copy.w.borrow().shape(), &[2, 0, 2, 3]);
    }

    #[test]
    fn test_load_rejects_bad_input_rank() {
        let mut bytes = Vec::new();
        write_name(&mut bytes, "conv").unwrap();
        write_bool(&mut bytes, false).unwrap();
        write_shape(&mut bytes, &[5, 5]).unwrap();
        let mut conv = Convolution::new(2, 3, 3, 1);
        assert!(matches!(conv.load(&mut bytes.as_slice()), Err(Error::InvalidFormat { .. })));

        let mut bytes = Vec::new();
        write_name(&mut bytes, "conv").unwrap();
        write_bool(&mut bytes, false).unwrap();
        write_shape(&mut bytes, &[2, 2, 1]).unwrap();
        assert!(matches!(conv.load(&mut bytes.as_slice()), Err(Error::InvalidFormat { .. })));
    }
}
