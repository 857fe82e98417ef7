use std::cell::RefCell;
use std::io::{Read, Write};
use std::rc::Rc;

use crate::buffer::{shape_size, DataType, FrameBuffer};
use crate::error::Result;
use crate::layers::rows::{for_each_bit_row, for_each_fp32_row, get_bit, set_bit};
use crate::model::command::{is_command_target, split_command};
use crate::model::serialize::{read_name, write_name};
use crate::model::{Filter2d, Model, ModelRef};
use crate::variables::Variables;

/// Convolution by lowering: every filter window becomes one frame of a
/// patch buffer (im2col), a shared sub-model maps patches
/// `[filter_w, filter_h, channels]` to output channels, and the results are
/// folded back into a `[w, h, channels]` image (col2im).
///
/// Any model works as the sub-model, which is how LUT networks act as
/// convolutions. `Bit` inputs stay packed through the lowering.
pub struct LoweringConvolution {
    name: String,
    layer: ModelRef,
    filter_h: usize,
    filter_w: usize,
    input_shape: Vec<usize>,
    output_shape: Vec<usize>,
    input_frame_size: Option<usize>,
}

impl LoweringConvolution {
    pub fn new(layer: ModelRef, filter_h: usize, filter_w: usize) -> LoweringConvolution {
        assert!(filter_h > 0 && filter_w > 0, "filter must not be empty");
        LoweringConvolution {
            name: String::new(),
            layer,
            filter_h,
            filter_w,
            input_shape: Vec::new(),
            output_shape: Vec::new(),
            input_frame_size: None,
        }
    }

    pub fn create(layer: ModelRef, filter_h: usize, filter_w: usize) -> Rc<RefCell<LoweringConvolution>> {
        Rc::new(RefCell::new(Self::new(layer, filter_h, filter_w)))
    }

    pub fn layer(&self) -> ModelRef {
        self.layer.clone()
    }

    fn dims(&self) -> (usize, usize, usize, usize, usize) {
        let (iw, ih, ic) = (self.input_shape[0], self.input_shape[1], self.input_shape[2]);
        (iw, ih, ic, iw - self.filter_w + 1, ih - self.filter_h + 1)
    }

    fn im2col(&self, x: &FrameBuffer) -> FrameBuffer {
        let (iw, ih, ic, ow, oh) = self.dims();
        let (fw, fh) = (self.filter_w, self.filter_h);
        let frames = x.frame_size();
        let col_frames = frames * oh * ow;
        let patch_shape = [fw, fh, ic];
        // patch node p = (c, fy, fx) reads input (c, oy + fy, ox + fx)
        let source = move |p: usize, oy: usize, ox: usize| {
            let (c, fy, fx) = (p / (fh * fw), (p / fw) % fh, p % fw);
            (c * ih + oy + fy) * iw + ox + fx
        };

        let mut col = FrameBuffer::new(col_frames, &patch_shape, x.data_type());
        match x.data_type() {
            DataType::Bit => for_each_bit_row(&mut col, |p, row| {
                for oy in 0..oh {
                    for ox in 0..ow {
                        let xs = x.bit_row(source(p, oy, ox));
                        for f in 0..frames {
                            if get_bit(xs, f) {
                                set_bit(row, (f * oh + oy) * ow + ox);
                            }
                        }
                    }
                }
            }),
            DataType::Fp32 => for_each_fp32_row(&mut col, |p, row| {
                for oy in 0..oh {
                    for ox in 0..ow {
                        let xs = x.fp32_row(source(p, oy, ox));
                        for (f, &v) in xs.iter().enumerate() {
                            row[(f * oh + oy) * ow + ox] = v;
                        }
                    }
                }
            }),
            other => panic!("{}: unsupported input type {other:?}", self.name()),
        }
        col
    }
}

impl Filter2d for LoweringConvolution {
    fn filter_height(&self) -> usize {
        self.filter_h
    }

    fn filter_width(&self) -> usize {
        self.filter_w
    }
}

impl Model for LoweringConvolution {
    fn class_name(&self) -> &'static str {
        "LoweringConvolution"
    }

    fn instance_name(&self) -> &str {
        &self.name
    }

    fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }

    fn send_command(&mut self, command: &str, send_to: &str) {
        if is_command_target(send_to, self.class_name(), &self.name()) {
            self.command_proc(&split_command(command));
        } else {
            self.layer.borrow_mut().send_command(command, send_to);
        }
    }

    /// Commands addressed to the wrapper reach the wrapped layer.
    fn command_proc(&mut self, args: &[String]) {
        self.layer.borrow_mut().command_proc(args);
    }

    fn get_parameters(&self) -> Variables {
        self.layer.borrow().get_parameters()
    }

    fn get_gradients(&self) -> Variables {
        self.layer.borrow().get_gradients()
    }

    fn set_input_shape(&mut self, shape: &[usize]) -> Vec<usize> {
        assert_eq!(shape.len(), 3, "{}: input must be [w, h, c], got {shape:?}", self.name());
        assert!(
            shape[0] >= self.filter_w && shape[1] >= self.filter_h,
            "{}: input {:?} is smaller than the filter",
            self.name(),
            shape
        );
        self.input_shape = shape.to_vec();
        let (_, _, ic, ow, oh) = self.dims();
        let patch_out = self
            .layer
            .borrow_mut()
            .set_input_shape(&[self.filter_w, self.filter_h, ic]);
        self.output_shape = vec![ow, oh, shape_size(&patch_out)];
        self.input_frame_size = None;
        self.output_shape.clone()
    }

    fn input_shape(&self) -> Vec<usize> {
        self.input_shape.clone()
    }

    fn output_shape(&self) -> Vec<usize> {
        self.output_shape.clone()
    }

    fn forward(&mut self, x: FrameBuffer, train: bool) -> FrameBuffer {
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
        let (_, _, _, ow, oh) = self.dims();
        let frames = x.frame_size();
        let col = self.im2col(&x);
        let y_col = self.layer.borrow_mut().forward(col, train);
        let y_col = match y_col.data_type() {
            DataType::Bit | DataType::Fp32 => y_col,
            _ => y_col.convert(DataType::Fp32),
        };

        // col2im: output node (n, oy, ox) frame f <- y_col[n][(f, oy, ox)]
        let plane = oh * ow;
        let mut y = FrameBuffer::new(frames, &self.output_shape, y_col.data_type());
        if y_col.data_type() == DataType::Bit {
            for_each_bit_row(&mut y, |node, row| {
                let ys = y_col.bit_row(node / plane);
                let pixel = node % plane;
                for f in 0..frames {
                    if get_bit(ys, f * plane + pixel) {
                        set_bit(row, f);
                    }
                }
            });
        } else {
            for_each_fp32_row(&mut y, |node, row| {
                let ys = y_col.fp32_row(node / plane);
                let pixel = node % plane;
                for (f, v) in row.iter_mut().enumerate() {
                    *v = ys[f * plane + pixel];
                }
            });
        }
        self.input_frame_size = Some(frames);
        y
    }

    fn backward(&mut self, dy: FrameBuffer) -> FrameBuffer {
        let Some(frames) = self.input_frame_size else {
            panic!("{}: backward called before forward", self.name());
        };
        let dy = dy.convert(DataType::Fp32);
        let (iw, ih, _, ow, oh) = self.dims();
        let (fw, fh) = (self.filter_w, self.filter_h);
        let plane = oh * ow;
        let patch_out = self.layer.borrow().output_shape();

        let mut dy_col = FrameBuffer::new(frames * plane, &patch_out, DataType::Fp32);
        for_each_fp32_row(&mut dy_col, |n, row| {
            for pixel in 0..plane {
                let gs = dy.fp32_row(n * plane + pixel);
                for (f, &g) in gs.iter().enumerate() {
                    row[f * plane + pixel] = g;
                }
            }
        });
        let dx_col = self.layer.borrow_mut().backward(dy_col).convert(DataType::Fp32);

        // scatter-add patches back; each input channel is independent
        let mut dx = FrameBuffer::new(frames, &self.input_shape, DataType::Fp32);
        for_each_fp32_row(&mut dx, |node, row| {
            let (c, iy, ix) = (node / (ih * iw), (node / iw) % ih, node % iw);
            for fy in 0..fh {
                if iy < fy || iy - fy >= oh {
                    continue;
                }
                for fx in 0..fw {
                    if ix < fx || ix - fx >= ow {
                        continue;
                    }
                    let pixel = (iy - fy) * ow + (ix - fx);
                    let gs = dx_col.fp32_row((c * fh + fy) * fw + fx);
                    for (f, d) in row.iter_mut().enumerate() {
                        *d += gs[f * plane + pixel];
                    }
                }
            }
        });
        dx
    }

    fn after_update(&mut self) {
        self.layer.borrow_mut().after_update();
    }

    fn save(&self, w: &mut dyn Write) -> Result<()> {
        write_name(w, &self.name)?;
        self.layer.borrow().save(w)
    }

    fn load(&mut self, r: &mut dyn Read) -> Result<()> {
        self.name = read_name(r)?;
        self.layer.borrow_mut().load(r)
    }

    fn info(&self, depth: usize, nest: usize) -> String {
        let indent = "  ".repeat(nest);
        let mut s = format!(
            "{indent}[{}] {}\n{indent}  filter       : {}x{}\n{indent}  input  shape : {:?}\n{indent}  output shape : {:?}\n",
            self.class_name(),
            self.name(),
            self.filter_w,
            self.filter_h,
            self.input_shape,
            self.output_shape,
        );
        if depth == 0 || nest + 1 < depth {
            s += &self.layer.borrow().info(depth, nest + 1);
        }
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::{BinaryLut, Convolution, DenseAffine};
    use crate::layers::sparse::SparseModel;

    fn image(frames: usize, shape: &[usize]) -> FrameBuffer {
        let mut x = FrameBuffer::new(frames, shape, DataType::Fp32);
        for node in 0..shape_size(shape) {
            for f in 0..frames {
                x.set_fp32(f, node, ((node * 7 + f * 3) % 11) as f32 / 11.0 - 0.4);
            }
        }
        x
    }

    #[test]
    fn test_matches_direct_convolution() {
        let conv = Convolution::create(2, 3, 2, 5);
        conv.borrow_mut().set_input_shape(&[4, 5, 2]);

        let dense = DenseAffine::create(&[2], 1);
        let mut lowering = LoweringConvolution::new(dense.clone(), 3, 2);
        assert_eq!(lowering.set_input_shape(&[4, 5, 2]), vec![3, 3, 2]);
        {
            // same weights: W[n, c, fy, fx] is patch node (c, fy, fx)
            let src = conv.borrow().w();
            dense.borrow().w().borrow_mut().data_mut().copy_from_slice(src.borrow().data());
        }

        let x = image(2, &[4, 5, 2]);
        let expected = conv.borrow_mut().forward(x.clone(), true);
        let y = lowering.forward(x.clone(), true);
        for f in 0..2 {
            for (a, b) in y.frame_values(f).iter().zip(expected.frame_values(f)) {
                assert!((a - b).abs() < 1e-5);
            }
        }

        let dy = image(2, &[3, 3, 2]);
        let dx_expected = conv.borrow_mut().backward(dy.clone());
        let dx = lowering.backward(dy);
        for f in 0..2 {
            for (a, b) in dx.frame_values(f).iter().zip(dx_expected.frame_values(f)) {
                assert!((a - b).abs() < 1e-4);
            }
        }
    }

    #[test]
    fn test_bit_lowering_with_lut() {
        let lut = BinaryLut::<2>::create(&[1], 3);
        let mut lowering = LoweringConvolution::new(lut.clone(), 1, 2);
        lowering.set_input_shape(&[3, 1, 1]);
        {
            let mut lut = lut.borrow_mut();
            lut.set_node_input(0, 0, 0);
            lut.set_node_input(0, 1, 1);
            // AND of horizontal neighbours
            for entry in 0..4 {
                lut.set_lut_table(0, entry, entry == 3);
            }
        }
        let mut x = FrameBuffer::new(2, &[3, 1, 1], DataType::Bit);
        x.set_binary(0, 0, true);
        x.set_binary(0, 1, true);
        x.set_binary(1, 1, true);
        x.set_binary(1, 2, true);
        let y = lowering.forward(x, false);
        assert_eq!(y.shape(), &[2, 1, 1]);
        assert_eq!(y.data_type(), DataType::Bit);
        assert!(y.get_binary(0, 0) && !y.get_binary(0, 1));
        assert!(!y.get_binary(1, 0) && y.get_binary(1, 1));
    }

    #[test]
    fn test_command_to_wrapper_reaches_layer() {
        let dense = DenseAffine::create(&[2], 1);
        let mut lowering = LoweringConvolution::new(dense.clone(), 3, 2);
        lowering.set_name("conv0");
        lowering.send_command("binary true", "conv0");
        assert!(dense.borrow().binary_mode());
        lowering.send_command("binary false", "LoweringConvolution");
        assert!(!dense.borrow().binary_mode());
        lowering.send_command("binary true", "other");
        assert!(!dense.borrow().binary_mode());
    }
}
