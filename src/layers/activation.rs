use std::cell::RefCell;
use std::io::{Read, Write};
use std::rc::Rc;

use crate::activation::ActivationFunction;
use crate::buffer::{shape_size, DataType, FrameBuffer};
use crate::error::Result;
use crate::layers::rows::{for_each_bit_row, for_each_fp32_row, set_bit};
use crate::model::command::parse_bool_command;
use crate::model::serialize::{read_bool, read_name, write_bool, write_name};
use crate::model::Model;

/// Element-wise activation.
///
/// In binary mode (`"binary true"`) any function is replaced by the
/// [`Binarize`](ActivationFunction::Binarize) step; the backward pass then
/// uses the hard-tanh straight-through estimator.
#[derive(Debug)]
pub struct ActivationLayer {
    name: String,
    function: ActivationFunction,
    binary_mode: bool,
    binary_type: DataType,
    shape: Vec<usize>,
    x: Option<FrameBuffer>,
}

impl ActivationLayer {
    pub fn new(function: ActivationFunction) -> ActivationLayer {
        ActivationLayer {
            name: String::new(),
            function,
            binary_mode: false,
            binary_type: DataType::Fp32,
            shape: Vec::new(),
            x: None,
        }
    }

    pub fn create(function: ActivationFunction) -> Rc<RefCell<ActivationLayer>> {
        Rc::new(RefCell::new(Self::new(function)))
    }

    /// Step activation emitting `output_type` (`Bit` for LUT networks).
    pub fn binarize(output_type: DataType) -> Rc<RefCell<ActivationLayer>> {
        let mut layer = Self::new(ActivationFunction::Binarize);
        layer.binary_type = output_type;
        Rc::new(RefCell::new(layer))
    }

    pub fn function(&self) -> ActivationFunction {
        self.function
    }

    pub fn set_binary_mode(&mut self, enable: bool) {
        self.binary_mode = enable;
    }

    pub fn binary_mode(&self) -> bool {
        self.binary_mode
    }

    /// Applies the active function (the step in binary mode) to one value.
    pub fn apply(&self, value: f32) -> f32 {
        self.effective_function().function(value)
    }

    fn effective_function(&self) -> ActivationFunction {
        if self.binary_mode {
            ActivationFunction::Binarize
        } else {
            self.function
        }
    }
}

impl Model for ActivationLayer {
    fn class_name(&self) -> &'static str {
        "ActivationLayer"
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

    fn set_input_shape(&mut self, shape: &[usize]) -> Vec<usize> {
        self.shape = shape.to_vec();
        self.x = None;
        self.shape.clone()
    }

    fn input_shape(&self) -> Vec<usize> {
        self.shape.clone()
    }

    fn output_shape(&self) -> Vec<usize> {
        self.shape.clone()
    }

    fn forward(&mut self, x: FrameBuffer, _train: bool) -> FrameBuffer {
        assert_eq!(
            x.node_size(),
            shape_size(&self.shape),
            "{}: input node size mismatch",
            self.name()
        );
        let x = x.convert(DataType::Fp32);
        let func = self.effective_function();
        let out_type = if func == ActivationFunction::Binarize {
            self.binary_type
        } else {
            DataType::Fp32
        };

        let mut y = FrameBuffer::new(x.frame_size(), &self.shape, out_type);
        match out_type {
            DataType::Fp32 => for_each_fp32_row(&mut y, |node, row| {
                for (v, &xv) in row.iter_mut().zip(x.fp32_row(node)) {
                    *v = func.function(xv);
                }
            }),
            DataType::Bit => for_each_bit_row(&mut y, |node, row| {
                for (frame, &xv) in x.fp32_row(node).iter().enumerate() {
                    if func.function(xv) > 0.5 {
                        set_bit(row, frame);
                    }
                }
            }),
            _ => {
                for node in 0..y.node_size() {
                    for frame in 0..y.frame_size() {
                        y.set_fp32(frame, node, func.function(x.get_fp32(frame, node)));
                    }
                }
            }
        }
        self.x = Some(x);
        y
    }

    fn backward(&mut self, dy: FrameBuffer) -> FrameBuffer {
        let Some(x) = &self.x else {
            panic!("{}: backward called before forward", self.name());
        };
        let dy = dy.convert(DataType::Fp32);
        let func = self.effective_function();
        let mut dx = FrameBuffer::new(x.frame_size(), &self.shape, DataType::Fp32);
        for_each_fp32_row(&mut dx, |node, row| {
            let xs = x.fp32_row(node);
            let dys = dy.fp32_row(node);
            for ((d, &xv), &g) in row.iter_mut().zip(xs).zip(dys) {
                *d = g * func.derivative(xv);
            }
        });
        dx
    }

    fn save(&self, w: &mut dyn Write) -> Result<()> {
        write_name(w, &self.name)?;
        write_bool(w, self.binary_mode)
    }

    fn load(&mut self, r: &mut dyn Read) -> Result<()> {
        self.name = read_name(r)?;
        self.binary_mode = read_bool(r)?;
        Ok(())
    }
}
