use std::cell::RefCell;
use std::io::{Read, Write};
use std::rc::Rc;

use rayon::prelude::*;

use crate::buffer::{shape_size, DataType, FrameBuffer};
use crate::error::Result;
use crate::layers::rows::for_each_fp32_row;
use crate::math::init::{seeded_rng, xavier};
use crate::model::serialize::{
    read_name, read_shape, read_tensor, write_name, write_shape, write_tensor,
};
use crate::model::Model;
use crate::variables::{tensor_ref, Tensor, TensorRef, Variables};

/// Affine layer where output node `n` only sees input nodes
/// `[n * depth, (n + 1) * depth)`, with `depth = input_nodes / output_nodes`.
#[derive(Debug)]
pub struct DepthwiseDenseAffine {
    name: String,
    seed: u64,
    input_shape: Vec<usize>,
    output_shape: Vec<usize>,
    depth: usize,
    w: TensorRef,
    b: TensorRef,
    dw: TensorRef,
    db: TensorRef,
    x: Option<FrameBuffer>,
}

impl DepthwiseDenseAffine {
    pub fn new(output_shape: &[usize], seed: u64) -> DepthwiseDenseAffine {
        DepthwiseDenseAffine {
            name: String::new(),
            seed,
            input_shape: Vec::new(),
            output_shape: output_shape.to_vec(),
            depth: 0,
            w: tensor_ref(Tensor::zeros(&[0, 0])),
            b: tensor_ref(Tensor::zeros(&[0])),
            dw: tensor_ref(Tensor::zeros(&[0, 0])),
            db: tensor_ref(Tensor::zeros(&[0])),
            x: None,
        }
    }

    pub fn create(output_shape: &[usize], seed: u64) -> Rc<RefCell<DepthwiseDenseAffine>> {
        Rc::new(RefCell::new(Self::new(output_shape, seed)))
    }

    pub fn depth(&self) -> usize {
        self.depth
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
}

impl Model for DepthwiseDenseAffine {
    fn class_name(&self) -> &'static str {
        "DepthwiseDenseAffine"
    }

    fn instance_name(&self) -> &str {
        &self.name
    }

    fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
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
        let input_nodes = shape_size(shape);
        let output_nodes = shape_size(&self.output_shape);
        assert!(
            output_nodes > 0 && input_nodes % output_nodes == 0,
            "{}: {} input nodes cannot be split over {} outputs",
            self.name(),
            input_nodes,
            output_nodes
        );
        self.input_shape = shape.to_vec();
        self.depth = input_nodes / output_nodes;

        let mut rng = seeded_rng(self.seed);
        let weights = xavier(&mut rng, output_nodes * self.depth, self.depth);
        *self.w.borrow_mut() = Tensor::from_vec(&[output_nodes, self.depth], weights);
        *self.b.borrow_mut() = Tensor::zeros(&[output_nodes]);
        *self.dw.borrow_mut() = Tensor::zeros(&[output_nodes, self.depth]);
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
        assert_eq!(
            x.node_size(),
            shape_size(&self.input_shape),
            "{}: input node size mismatch",
            self.name()
        );
        let x = x.convert(DataType::Fp32);
        let depth = self.depth;
        let w = self.w.borrow();
        let b = self.b.borrow();
        let (w, b) = (w.data(), b.data());

        let mut y = FrameBuffer::new(x.frame_size(), &self.output_shape, DataType::Fp32);
        for_each_fp32_row(&mut y, |out, row| {
            row.fill(b[out]);
            for d in 0..depth {
                let weight = w[out * depth + d];
                for (v, &xv) in row.iter_mut().zip(x.fp32_row(out * depth + d)) {
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
        let depth = self.depth;

        let w = self.w.borrow();
        let w = w.data();
        let mut dx = FrameBuffer::new(x.frame_size(), &self.input_shape, DataType::Fp32);
        for_each_fp32_row(&mut dx, |input, row| {
            let weight = w[input];
            for (d, &g) in row.iter_mut().zip(dy.fp32_row(input / depth)) {
                *d = weight * g;
            }
        });

        let mut dw = self.dw.borrow_mut();
        dw.data_mut().par_iter_mut().enumerate().for_each(|(i, dw)| {
            let g = dy.fp32_row(i / depth);
            *dw += g.iter().zip(x.fp32_row(i)).map(|(a, b)| a * b).sum::<f32>();
        });

        let mut db = self.db.borrow_mut();
        db.data_mut()
            .par_iter_mut()
            .enumerate()
            .for_each(|(out, db)| *db += dy.fp32_row(out).iter().sum::<f32>());
        dx
    }

    fn save(&self, w: &mut dyn Write) -> Result<()> {
        write_name(w, &self.name)?;
        write_shape(w, &self.input_shape)?;
        write_shape(w, &self.output_shape)?;
        write_tensor(w, &self.w.borrow())?;
        write_tensor(w, &self.b.borrow())
    }

    fn load(&mut self, r: &mut dyn Read) -> Result<()> {
        self.name = read_name(r)?;
        let input_shape = read_shape(r)?;
        self.output_shape = read_shape(r)?;
        self.input_shape.clear();
        self.set_input_shape(&input_shape);
        read_tensor(r, &mut self.w.borrow_mut())?;
        read_tensor(r, &mut self.b.borrow_mut())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_depthwise_affine() {
        let mut affine = DepthwiseDenseAffine::new(&[3], 1);
        affine.set_input_shape(&[2, 3]);
        assert_eq!(affine.depth(), 2);

        let mut x = FrameBuffer::new(1, &[2, 3], DataType::Fp32);
        for node in 0..6 {
            x.set_fp32(0, node, node as f32 + 1.0);
        }
        {
            let w = affine.w();
            let mut w = w.borrow_mut();
            w.data_mut().copy_from_slice(&[1.0, 2.0, 10.0, 20.0, 100.0, 200.0]);
            let b = affine.b();
            b.borrow_mut().data_mut().copy_from_slice(&[1000.0, 2000.0, 3000.0]);
        }

        let y = affine.forward(x, true);
        assert_eq!(y.get_fp32(0, 0), 1.0 * 1.0 + 2.0 * 2.0 + 1000.0);
        assert_eq!(y.get_fp32(0, 1), 3.0 * 10.0 + 4.0 * 20.0 + 2000.0);
        assert_eq!(y.get_fp32(0, 2), 5.0 * 100.0 + 6.0 * 200.0 + 3000.0);

        let mut dy = FrameBuffer::new(1, &[3], DataType::Fp32);
        dy.set_fp32(0, 0, 123.0);
        dy.set_fp32(0, 1, 456.0);
        dy.set_fp32(0, 2, 789.0);
        let dx = affine.backward(dy);
        assert_eq!(
            dx.frame_values(0),
            vec![123.0, 246.0, 4560.0, 9120.0, 78900.0, 157800.0]
        );

        assert_eq!(affine.db().borrow().data(), &[123.0, 456.0, 789.0]);
        assert_eq!(
            affine.dw().borrow().data(),
            &[123.0, 246.0, 3.0 * 456.0, 4.0 * 456.0, 5.0 * 789.0, 6.0 * 789.0]
        );
    }

    #[test]
    #[should_panic(expected = "cannot be split")]
    fn test_rejects_uneven_depth() {
        let mut affine = DepthwiseDenseAffine::new(&[4], 1);
        affine.set_input_shape(&[6]);
    }
}
