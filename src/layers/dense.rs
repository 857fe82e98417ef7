use std::cell::RefCell;
use std::io::{Read, Write};
use std::rc::Rc;

use rayon::prelude::*;

use crate::buffer::{shape_size, DataType, FrameBuffer};
use crate::error::Result;
use crate::layers::rows::for_each_fp32_row;
use crate::math::init::{seeded_rng, xavier};
use crate::model::command::parse_bool_command;
use crate::model::serialize::{
    read_bool, read_name, read_shape, read_tensor, write_bool, write_name, write_shape,
    write_tensor,
};
use crate::model::Model;
use crate::variables::{tensor_ref, Tensor, TensorRef, Variables};

/// Fully connected layer, `y = W x + b`.
///
/// `W` has shape `[output_nodes, input_nodes]`. Weights are drawn on the
/// first `set_input_shape` for a given input geometry; calling it again with
/// the same shape keeps the trained values.
#[derive(Debug)]
pub struct DenseAffine {
    name: String,
    seed: u64,
    binary_mode: bool,
    input_shape: Vec<usize>,
    output_shape: Vec<usize>,
    w: TensorRef,
    b: TensorRef,
    dw: TensorRef,
    db: TensorRef,
    x: Option<FrameBuffer>,
}

impl DenseAffine {
    pub fn new(output_shape: &[usize], seed: u64) -> DenseAffine {
        DenseAffine {
            name: String::new(),
            seed,
            binary_mode: false,
            input_shape: Vec::new(),
            output_shape: output_shape.to_vec(),
            w: tensor_ref(Tensor::zeros(&[0, 0])),
            b: tensor_ref(Tensor::zeros(&[0])),
            dw: tensor_ref(Tensor::zeros(&[0, 0])),
            db: tensor_ref(Tensor::zeros(&[0])),
            x: None,
        }
    }

    pub fn create(output_shape: &[usize], seed: u64) -> Rc<RefCell<DenseAffine>> {
        Rc::new(RefCell::new(Self::new(output_shape, seed)))
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

impl Model for DenseAffine {
    fn class_name(&self) -> &'static str {
        "DenseAffine"
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
        if shape == self.input_shape.as_slice() {
            return self.output_shape.clone();
        }
        self.input_shape = shape.to_vec();
        let input_nodes = shape_size(shape);
        let output_nodes = shape_size(&self.output_shape);

        let mut rng = seeded_rng(self.seed);
        let weights = xavier(&mut rng, output_nodes * input_nodes, input_nodes);
        *self.w.borrow_mut() = Tensor::from_vec(&[output_nodes, input_nodes], weights);
        *self.b.borrow_mut() = Tensor::zeros(&[output_nodes]);
        *self.dw.borrow_mut() = Tensor::zeros(&[output_nodes, input_nodes]);
        *self.db.borrow_mut() = Tensor::zeros(&[output_nodes]);
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
        let input_nodes = shape_size(&self.input_shape);
        assert_eq!(x.node_size(), input_nodes, "{}: input node size mismatch", self.name());
        let x = x.convert(DataType::Fp32);

        let w = self.w.borrow();
        let b = self.b.borrow();
        let (w, b) = (w.data(), b.data());
        let mut y = FrameBuffer::new(x.frame_size(), &self.output_shape, DataType::Fp32);
        for_each_fp32_row(&mut y, |out, row| {
            row.fill(b[out]);
            for (input, &weight) in w[out * input_nodes..(out + 1) * input_nodes].iter().enumerate() {
                if weight == 0.0 {
                    continue;
                }
                for (v, &xv) in row.iter_mut().zip(x.fp32_row(input)) {
                    *v += weight * xv;
                }
            }
        });
        self.x = Some(x);
        y
    }

    fn backward(&mut self, dy: FrameBuffer) -> FrameBuffer {
        let Some(x) = &self.x else {
            panic!("{}: backward called before forward", self.name());
        };
        let dy = dy.convert(DataType::Fp32);
        let input_nodes = shape_size(&self.input_shape);
        let output_nodes = shape_size(&self.output_shape);

        let w = self.w.borrow();
        let w = w.data();
        let mut dx = FrameBuffer::new(x.frame_size(), &self.input_shape, DataType::Fp32);
        for_each_fp32_row(&mut dx, |input, row| {
            for out in 0..output_nodes {
                let weight = w[out * input_nodes + input];
                for (d, &g) in row.iter_mut().zip(dy.fp32_row(out)) {
                    *d += weight * g;
                }
            }
        });

        let mut dw = self.dw.borrow_mut();
        dw.data_mut()
            .par_chunks_mut(input_nodes.max(1))
            .enumerate()
            .for_each(|(out, dw_row)| {
                let g = dy.fp32_row(out);
                for (input, dw) in dw_row.iter_mut().enumerate() {
                    *dw += g.iter().zip(x.fp32_row(input)).map(|(a, b)| a * b).sum::<f32>();
                }
            });

        let mut db = self.db.borrow_mut();
        db.data_mut()
            .par_iter_mut()
            .enumerate()
            .for_each(|(out, db)| *db += dy.fp32_row(out).iter().sum::<f32>());
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
        write_shape(w, &self.output_shape)?;
        write_tensor(w, &self.w.borrow())?;
        write_tensor(w, &self.b.borrow())
    }

    fn load(&mut self, r: &mut dyn Read) -> Result<()> {
        self.name = read_name(r)?;
        self.binary_mode = read_bool(r)?;
        let input_shape = read_shape(r)?;
        self.output_shape = read_shape(r)?;
        self.input_shape.clear();
        self.set_input_shape(&input_shape);
        read_tensor(r, &mut self.w.borrow_mut())?;
        read_tensor(r, &mut self.b.borrow_mut())
    }
}
