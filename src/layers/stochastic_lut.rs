use std::cell::RefCell;
use std::io::{Read, Write};
use std::rc::Rc;

use rayon::prelude::*;

use crate::buffer::{shape_size, DataType, FrameBuffer};
use crate::error::{Error, Result};
use crate::layers::rows::for_each_fp32_row;
use crate::layers::sparse::{random_connections, SparseModel};
use crate::math::init::{normal, seeded_rng};
use crate::model::serialize::{
    read_name, read_shape, read_tensor, read_u64, write_name, write_shape, write_tensor,
    write_u64,
};
use crate::model::Model;
use crate::variables::{tensor_ref, Tensor, TensorRef, Variables};

/// Differentiable LUT over input probabilities.
///
/// For a node with inputs `x_0..x_{N-1}` and table weights `W`:
/// `y = Σ_e W_e Π_i (e_i ? x_i : 1 - x_i)`, i.e. the expected table output
/// when every input is an independent Bernoulli variable. Weights stay in
/// [0, 1]; a trained layer is tabulated by
/// [`BinaryLut::import_layer`](super::BinaryLut::import_layer).
#[derive(Debug)]
pub struct StochasticLut<const N: usize = 6> {
    name: String,
    seed: u64,
    input_shape: Vec<usize>,
    output_shape: Vec<usize>,
    connections: Vec<usize>,
    w: TensorRef,
    dw: TensorRef,
    x: Option<FrameBuffer>,
}

pub type StochasticLut6 = StochasticLut<6>;

/// Probability of every table entry for one input combination.
fn entry_probabilities<const N: usize>(x: &[f32; N], probs: &mut [f32]) {
    probs[0] = 1.0;
    for (i, &xi) in x.iter().enumerate() {
        let half = 1 << i;
        for e in 0..half {
            let p = probs[e];
            probs[e | half] = p * xi;
            probs[e] = p * (1.0 - xi);
        }
    }
}

/// `∂y/∂x_i` for one node: pairs entries differing only in bit `i`.
fn input_gradient<const N: usize>(w: &[f32], x: &[f32; N], i: usize, probs: &mut [f32]) -> f32 {
    let mut others = [0.0f32; N];
    let mut k = 0;
    for (j, &xj) in x.iter().enumerate() {
        if j != i {
            others[k] = xj;
            k += 1;
        }
    }
    // Probabilities over the N-1 other inputs, indexed without bit i.
    probs[0] = 1.0;
    for (j, &xj) in others.iter().take(N - 1).enumerate() {
        let half = 1 << j;
        for e in 0..half {
            let p = probs[e];
            probs[e | half] = p * xj;
            probs[e] = p * (1.0 - xj);
        }
    }
    let low_mask = (1 << i) - 1;
    let mut grad = 0.0;
    for (rest, &p) in probs.iter().take(1 << (N - 1)).enumerate() {
        let e0 = (rest & low_mask) | ((rest & !low_mask) << 1);
        let e1 = e0 | (1 << i);
        grad += (w[e1] - w[e0]) * p;
    }
    grad
}

impl<const N: usize> StochasticLut<N> {
    pub const TABLE_SIZE: usize = 1 << N;

    pub fn new(output_shape: &[usize], seed: u64) -> StochasticLut<N> {
        assert!(N > 0 && N <= 16, "unsupported LUT input size {N}");
        StochasticLut {
            name: String::new(),
            seed,
            input_shape: Vec::new(),
            output_shape: output_shape.to_vec(),
            connections: Vec::new(),
            w: tensor_ref(Tensor::zeros(&[0, Self::TABLE_SIZE])),
            dw: tensor_ref(Tensor::zeros(&[0, Self::TABLE_SIZE])),
            x: None,
        }
    }

    pub fn create(output_shape: &[usize], seed: u64) -> Rc<RefCell<StochasticLut<N>>> {
        Rc::new(RefCell::new(Self::new(output_shape, seed)))
    }

    pub fn w(&self) -> TensorRef {
        self.w.clone()
    }

    pub fn dw(&self) -> TensorRef {
        self.dw.clone()
    }

    fn node_inputs<'a>(&self, x: &'a FrameBuffer, node: usize) -> [&'a [f32]; N] {
        std::array::from_fn(|i| x.fp32_row(self.connections[node * N + i]))
    }
}

impl<const N: usize> SparseModel for StochasticLut<N> {
    fn node_input_size(&self, _node: usize) -> usize {
        N
    }

    fn node_input(&self, node: usize, input_index: usize) -> usize {
        assert!(input_index < N, "input index {input_index} out of range");
        self.connections[node * N + input_index]
    }

    fn set_node_input(&mut self, node: usize, input_index: usize, input_node: usize) {
        assert!(input_index < N, "input index {input_index} out of range");
        let input_nodes = shape_size(&self.input_shape);
        assert!(
            input_node < input_nodes,
            "{}: connection {} out of range ({} inputs)",
            self.name(),
            input_node,
            input_nodes
        );
        self.connections[node * N + input_index] = input_node;
    }

    fn forward_node(&self, node: usize, x: &[f32]) -> f32 {
        let x: [f32; N] = std::array::from_fn(|i| x[i]);
        let mut probs = vec![0.0; Self::TABLE_SIZE];
        entry_probabilities(&x, &mut probs);
        let w = self.w.borrow();
        let w = &w.data()[node * Self::TABLE_SIZE..(node + 1) * Self::TABLE_SIZE];
        w.iter().zip(&probs).map(|(w, p)| w * p).sum()
    }
}

impl<const N: usize> Model for StochasticLut<N> {
    fn class_name(&self) -> &'static str {
        "StochasticLut"
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
        vars
    }

    fn get_gradients(&self) -> Variables {
        let mut vars = Variables::new();
        vars.push(self.dw.clone());
        vars
    }

    fn set_input_shape(&mut self, shape: &[usize]) -> Vec<usize> {
        if shape == self.input_shape.as_slice() {
            return self.output_shape.clone();
        }
        self.input_shape = shape.to_vec();
        let nodes = shape_size(&self.output_shape);

        let mut rng = seeded_rng(self.seed);
        self.connections = random_connections(&mut rng, shape_size(shape), nodes, N);
        let mut w = Tensor::from_vec(
            &[nodes, Self::TABLE_SIZE],
            normal(&mut rng, nodes * Self::TABLE_SIZE, 0.5, 0.01),
        );
        w.clamp(0.0, 1.0);
        *self.w.borrow_mut() = w;
        *self.dw.borrow_mut() = Tensor::zeros(&[nodes, Self::TABLE_SIZE]);
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
        let table_size = Self::TABLE_SIZE;
        let w = self.w.borrow();
        let w = w.data();

        let mut y = FrameBuffer::new(x.frame_size(), &self.output_shape, DataType::Fp32);
        let inputs: Vec<[&[f32]; N]> = (0..shape_size(&self.output_shape))
            .map(|node| self.node_inputs(&x, node))
            .collect();
        for_each_fp32_row(&mut y, |node, row| {
            let w = &w[node * table_size..(node + 1) * table_size];
            let mut probs = vec![0.0; table_size];
            for (frame, out) in row.iter_mut().enumerate() {
                let xs: [f32; N] = std::array::from_fn(|i| inputs[node][i][frame]);
                entry_probabilities(&xs, &mut probs);
                *out = w.iter().zip(&probs).map(|(w, p)| w * p).sum();
            }
        });
        drop(inputs);
        self.x = Some(x);
        y
    }

    fn backward(&mut self, dy: FrameBuffer) -> FrameBuffer {
        let Some(x) = &self.x else {
            panic!("{}: backward called before forward", self.name());
        };
        let dy = dy.convert(DataType::Fp32);
        let table_size = Self::TABLE_SIZE;
        let frame_size = x.frame_size();
        let nodes = shape_size(&self.output_shape);
        let inputs: Vec<[&[f32]; N]> = (0..nodes).map(|node| self.node_inputs(x, node)).collect();

        let w = self.w.borrow();
        let w = w.data();
        let mut dw = self.dw.borrow_mut();

        // dW in place, per-node input gradients gathered for the scatter below
        let node_dx: Vec<Vec<f32>> = dw
            .data_mut()
            .par_chunks_mut(table_size)
            .enumerate()
            .map(|(node, dw)| {
                let w = &w[node * table_size..(node + 1) * table_size];
                let g = dy.fp32_row(node);
                let mut probs = vec![0.0; table_size];
                let mut dx = vec![0.0; N * frame_size];
                for frame in 0..frame_size {
                    let xs: [f32; N] = std::array::from_fn(|i| inputs[node][i][frame]);
                    entry_probabilities(&xs, &mut probs);
                    for (d, &p) in dw.iter_mut().zip(&probs) {
                        *d += g[frame] * p;
                    }
                    for i in 0..N {
                        dx[i * frame_size + frame] =
                            g[frame] * input_gradient(w, &xs, i, &mut probs);
                    }
                }
                dx
            })
            .collect();

        let mut dx = FrameBuffer::new(frame_size, &self.input_shape, DataType::Fp32);
        let stride = dx.node_stride();
        let storage = dx.fp32_storage_mut();
        for (node, grads) in node_dx.iter().enumerate() {
            for i in 0..N {
                let input = self.connections[node * N + i];
                let row = &mut storage[input * stride..input * stride + frame_size];
                for (d, &g) in row.iter_mut().zip(&grads[i * frame_size..(i + 1) * frame_size]) {
                    *d += g;
                }
            }
        }
        dx
    }

    fn after_update(&mut self) {
        self.w.borrow_mut().clamp(0.0, 1.0);
    }

    fn save(&self, w: &mut dyn Write) -> Result<()> {
        write_name(w, &self.name)?;
        write_shape(w, &self.input_shape)?;
        write_shape(w, &self.output_shape)?;
        for &c in &self.connections {
            write_u64(w, c as u64)?;
        }
        write_tensor(w, &self.w.borrow())
    }

    fn load(&mut self, r: &mut dyn Read) -> Result<()> {
        self.name = read_name(r)?;
        let input_shape = read_shape(r)?;
        self.output_shape = read_shape(r)?;
        self.input_shape.clear();
        self.set_input_shape(&input_shape);
        let input_nodes = shape_size(&input_shape) as u64;
        for c in self.connections.iter_mut() {
            let input = read_u64(r)?;
            if input >= input_nodes {
                return Err(Error::InvalidFormat {
                    message: format!("connection {input} out of range"),
                });
            }
            *c = input as usize;
        }
        read_tensor(r, &mut self.w.borrow_mut())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_input_lut() -> StochasticLut<2> {
        let mut lut = StochasticLut::<2>::new(&[1], 3);
        lut.set_input_shape(&[2]);
        lut.set_node_input(0, 0, 0);
        lut.set_node_input(0, 1, 1);
        lut.w.borrow_mut().data_mut().copy_from_slice(&[0.1, 0.9, 0.4, 0.7]);
        lut
    }

    fn input(x0: f32, x1: f32) -> FrameBuffer {
        let mut x = FrameBuffer::new(1, &[2], DataType::Fp32);
        x.set_fp32(0, 0, x0);
        x.set_fp32(0, 1, x1);
        x
    }

    #[test]
    fn test_forward_is_expected_table_output() {
        let mut lut = two_input_lut();
        let y = lut.forward(input(0.3, 0.6), false);
        let expected = 0.1 * 0.28 + 0.9 * 0.12 + 0.4 * 0.42 + 0.7 * 0.18;
        assert!((y.get_fp32(0, 0) - expected).abs() < 1e-6);
        assert!((lut.forward_node(0, &[1.0, 0.0]) - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_gradients_match_finite_differences() {
        let mut lut = two_input_lut();
        let (x0, x1) = (0.3f32, 0.6f32);
        lut.forward(input(x0, x1), true);
        let mut dy = FrameBuffer::new(1, &[1], DataType::Fp32);
        dy.set_fp32(0, 0, 1.0);
        let dx = lut.backward(dy);

        let h = 1e-3;
        let mut f = |a: f32, b: f32| lut.forward(input(a, b), false).get_fp32(0, 0);
        let d0 = (f(x0 + h, x1) - f(x0 - h, x1)) / (2.0 * h);
        let d1 = (f(x0, x1 + h) - f(x0, x1 - h)) / (2.0 * h);
        assert!((dx.get_fp32(0, 0) - d0).abs() < 1e-3);
        assert!((dx.get_fp32(0, 1) - d1).abs() < 1e-3);

        let dw = lut.dw.borrow();
        assert!((dw[0] - 0.28).abs() < 1e-6);
        assert!((dw[3] - 0.18).abs() < 1e-6);
    }

    #[test]
    fn test_shared_input_gradients_add_up() {
        let mut lut = StochasticLut::<2>::new(&[2], 3);
        lut.set_input_shape(&[2]);
        for node in 0..2 {
            lut.set_node_input(node, 0, 0);
            lut.set_node_input(node, 1, 1);
        }
        lut.w.borrow_mut().data_mut().copy_from_slice(&[0.0, 1.0, 0.0, 1.0, 0.0, 1.0, 0.0, 1.0]);
        lut.forward(input(0.5, 0.5), true);
        let mut dy = FrameBuffer::new(1, &[2], DataType::Fp32);
        dy.set_fp32(0, 0, 1.0);
        dy.set_fp32(0, 1, 1.0);
        let dx = lut.backward(dy);
        // y = x0 for both nodes
        assert!((dx.get_fp32(0, 0) - 2.0).abs() < 1e-6);
        assert!(dx.get_fp32(0, 1).abs() < 1e-6);
    }

    #[test]
    fn test_after_update_clamps() {
        let mut lut = two_input_lut();
        lut.w.borrow_mut().data_mut()[0] = -0.5;
        lut.w.borrow_mut().data_mut()[1] = 1.5;
        lut.after_update();
        assert_eq!(&lut.w.borrow().data()[..2], &[0.0, 1.0]);
    }
}
