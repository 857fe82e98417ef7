use std::cell::RefCell;
use std::io::{Read, Write};
use std::rc::Rc;

use rayon::prelude::*;

use crate::activation::ActivationFunction;
use crate::buffer::{shape_size, DataType, FrameBuffer};
use crate::error::{Error, Result};
use crate::layers::activation::ActivationLayer;
use crate::layers::batch_norm::BatchNormalization;
use crate::layers::rows::for_each_fp32_row;
use crate::layers::sparse::{random_connections, SparseModel};
use crate::math::init::{he, seeded_rng, xavier};
use crate::model::command::{is_command_target, split_command};
use crate::model::serialize::{
    read_name, read_shape, read_tensor, read_u64, write_name, write_shape, write_tensor,
    write_u64,
};
use crate::model::Model;
use crate::variables::{tensor_ref, Tensor, TensorRef, Variables};

/// Per-node two-level perceptron over `N` sparse inputs.
///
/// Each output node owns `M` hidden units:
/// `y = b1 + Σ_m W1_m · relu(b0_m + Σ_i W0_{m,i} x_i)`.
#[derive(Debug)]
pub struct MicroMlpAffine<const N: usize = 6, const M: usize = 16> {
    name: String,
    seed: u64,
    input_shape: Vec<usize>,
    output_shape: Vec<usize>,
    connections: Vec<usize>,
    w0: TensorRef,
    b0: TensorRef,
    w1: TensorRef,
    b1: TensorRef,
    dw0: TensorRef,
    db0: TensorRef,
    dw1: TensorRef,
    db1: TensorRef,
    x: Option<FrameBuffer>,
}

/// Weights of one output node.
struct NodeWeights<'a> {
    w0: &'a [f32],
    b0: &'a [f32],
    w1: &'a [f32],
    b1: f32,
}

impl NodeWeights<'_> {
    /// Output and hidden pre-activations for one input combination.
    fn eval<const N: usize>(&self, xs: &[f32; N], hidden: &mut [f32]) -> f32 {
        let mut y = self.b1;
        for (m, h) in hidden.iter_mut().enumerate() {
            let mut v = self.b0[m];
            for (i, &xi) in xs.iter().enumerate() {
                v += self.w0[m * N + i] * xi;
            }
            *h = v;
            if v > 0.0 {
                y += self.w1[m] * v;
            }
        }
        y
    }
}

/// Gradients of one node, gathered in parallel and applied afterwards.
struct NodeGrads {
    dw0: Vec<f32>,
    db0: Vec<f32>,
    dw1: Vec<f32>,
    db1: f32,
    dx: Vec<f32>,
}

impl<const N: usize, const M: usize> MicroMlpAffine<N, M> {
    pub fn new(output_shape: &[usize], seed: u64) -> MicroMlpAffine<N, M> {
        assert!(N > 0 && M > 0, "unsupported micro MLP size {N}x{M}");
        MicroMlpAffine {
            name: String::new(),
            seed,
            input_shape: Vec::new(),
            output_shape: output_shape.to_vec(),
            connections: Vec::new(),
            w0: tensor_ref(Tensor::zeros(&[0, M, N])),
            b0: tensor_ref(Tensor::zeros(&[0, M])),
            w1: tensor_ref(Tensor::zeros(&[0, M])),
            b1: tensor_ref(Tensor::zeros(&[0])),
            dw0: tensor_ref(Tensor::zeros(&[0, M, N])),
            db0: tensor_ref(Tensor::zeros(&[0, M])),
            dw1: tensor_ref(Tensor::zeros(&[0, M])),
            db1: tensor_ref(Tensor::zeros(&[0])),
            x: None,
        }
    }

    pub fn create(output_shape: &[usize], seed: u64) -> Rc<RefCell<MicroMlpAffine<N, M>>> {
        Rc::new(RefCell::new(Self::new(output_shape, seed)))
    }

    pub fn w0(&self) -> TensorRef {
        self.w0.clone()
    }

    pub fn b0(&self) -> TensorRef {
        self.b0.clone()
    }

    pub fn w1(&self) -> TensorRef {
        self.w1.clone()
    }

    pub fn b1(&self) -> TensorRef {
        self.b1.clone()
    }

    fn node_inputs<'a>(&self, x: &'a FrameBuffer, node: usize) -> [&'a [f32]; N] {
        std::array::from_fn(|i| x.fp32_row(self.connections[node * N + i]))
    }
}

fn node_weights<'a, const N: usize, const M: usize>(
    w0: &'a [f32],
    b0: &'a [f32],
    w1: &'a [f32],
    b1: &[f32],
    node: usize,
) -> NodeWeights<'a> {
    NodeWeights {
        w0: &w0[node * M * N..(node + 1) * M * N],
        b0: &b0[node * M..(node + 1) * M],
        w1: &w1[node * M..(node + 1) * M],
        b1: b1[node],
    }
}

impl<const N: usize, const M: usize> SparseModel for MicroMlpAffine<N, M> {
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
        let xs: [f32; N] = std::array::from_fn(|i| x[i]);
        let (w0, b0, w1, b1) = (self.w0.borrow(), self.b0.borrow(), self.w1.borrow(), self.b1.borrow());
        let weights = node_weights::<N, M>(w0.data(), b0.data(), w1.data(), b1.data(), node);
        let mut hidden = [0.0f32; M];
        weights.eval(&xs, &mut hidden)
    }
}

impl<const N: usize, const M: usize> Model for MicroMlpAffine<N, M> {
    fn class_name(&self) -> &'static str {
        "MicroMlpAffine"
    }

    fn instance_name(&self) -> &str {
        &self.name
    }

    fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }

    fn get_parameters(&self) -> Variables {
        let mut vars = Variables::new();
        vars.push(self.w0.clone());
        vars.push(self.b0.clone());
        vars.push(self.w1.clone());
        vars.push(self.b1.clone());
        vars
    }

    fn get_gradients(&self) -> Variables {
        let mut vars = Variables::new();
        vars.push(self.dw0.clone());
        vars.push(self.db0.clone());
        vars.push(self.dw1.clone());
        vars.push(self.db1.clone());
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
        *self.w0.borrow_mut() = Tensor::from_vec(&[nodes, M, N], he(&mut rng, nodes * M * N, N));
        *self.b0.borrow_mut() = Tensor::zeros(&[nodes, M]);
        *self.w1.borrow_mut() = Tensor::from_vec(&[nodes, M], xavier(&mut rng, nodes * M, M));
        *self.b1.borrow_mut() = Tensor::zeros(&[nodes]);
        *self.dw0.borrow_mut() = Tensor::zeros(&[nodes, M, N]);
        *self.db0.borrow_mut() = Tensor::zeros(&[nodes, M]);
        *self.dw1.borrow_mut() = Tensor::zeros(&[nodes, M]);
        *self.db1.borrow_mut() = Tensor::zeros(&[nodes]);
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
        let (w0, b0, w1, b1) = (self.w0.borrow(), self.b0.borrow(), self.w1.borrow(), self.b1.borrow());
        let (w0, b0, w1, b1) = (w0.data(), b0.data(), w1.data(), b1.data());

        let mut y = FrameBuffer::new(x.frame_size(), &self.output_shape, DataType::Fp32);
        let inputs: Vec<[&[f32]; N]> = (0..shape_size(&self.output_shape))
            .map(|node| self.node_inputs(&x, node))
            .collect();
        for_each_fp32_row(&mut y, |node, row| {
            let weights = node_weights::<N, M>(w0, b0, w1, b1, node);
            let mut hidden = [0.0f32; M];
            for (frame, out) in row.iter_mut().enumerate() {
                let xs: [f32; N] = std::array::from_fn(|i| inputs[node][i][frame]);
                *out = weights.eval(&xs, &mut hidden);
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
        let frame_size = x.frame_size();
        let nodes = shape_size(&self.output_shape);
        let inputs: Vec<[&[f32]; N]> = (0..nodes).map(|node| self.node_inputs(x, node)).collect();

        let grads: Vec<NodeGrads> = {
            let (w0, b0, w1, b1) = (self.w0.borrow(), self.b0.borrow(), self.w1.borrow(), self.b1.borrow());
            let (w0, b0, w1, b1) = (w0.data(), b0.data(), w1.data(), b1.data());
            (0..nodes)
                .into_par_iter()
                .map(|node| {
                    let weights = node_weights::<N, M>(w0, b0, w1, b1, node);
                    let g = dy.fp32_row(node);
                    let mut grads = NodeGrads {
                        dw0: vec![0.0; M * N],
                        db0: vec![0.0; M],
                        dw1: vec![0.0; M],
                        db1: 0.0,
                        dx: vec![0.0; N * frame_size],
                    };
                    let mut hidden = [0.0f32; M];
                    for frame in 0..frame_size {
                        let xs: [f32; N] = std::array::from_fn(|i| inputs[node][i][frame]);
                        weights.eval(&xs, &mut hidden);
                        grads.db1 += g[frame];
                        for (m, &h) in hidden.iter().enumerate() {
                            if h <= 0.0 {
                                continue;
                            }
                            grads.dw1[m] += g[frame] * h;
                            let gh = g[frame] * weights.w1[m];
                            grads.db0[m] += gh;
                            for (i, &xi) in xs.iter().enumerate() {
                                grads.dw0[m * N + i] += gh * xi;
                                grads.dx[i * frame_size + frame] += gh * weights.w0[m * N + i];
                            }
                        }
                    }
                    grads
                })
                .collect()
        };

        let (mut dw0, mut db0, mut dw1, mut db1) =
            (self.dw0.borrow_mut(), self.db0.borrow_mut(), self.dw1.borrow_mut(), self.db1.borrow_mut());
        let mut dx = FrameBuffer::new(frame_size, &self.input_shape, DataType::Fp32);
        let stride = dx.node_stride();
        let storage = dx.fp32_storage_mut();
        for (node, g) in grads.iter().enumerate() {
            for (d, v) in dw0.data_mut()[node * M * N..(node + 1) * M * N].iter_mut().zip(&g.dw0) {
                *d += v;
            }
            for (d, v) in db0.data_mut()[node * M..(node + 1) * M].iter_mut().zip(&g.db0) {
                *d += v;
            }
            for (d, v) in dw1.data_mut()[node * M..(node + 1) * M].iter_mut().zip(&g.dw1) {
                *d += v;
            }
            db1[node] += g.db1;
            for i in 0..N {
                let input = self.connections[node * N + i];
                let row = &mut storage[input * stride..input * stride + frame_size];
                for (d, &v) in row.iter_mut().zip(&g.dx[i * frame_size..(i + 1) * frame_size]) {
                    *d += v;
                }
            }
        }
        dx
    }

    fn save(&self, w: &mut dyn Write) -> Result<()> {
        write_name(w, &self.name)?;
        write_shape(w, &self.input_shape)?;
        write_shape(w, &self.output_shape)?;
        for &c in &self.connections {
            write_u64(w, c as u64)?;
        }
        write_tensor(w, &self.w0.borrow())?;
        write_tensor(w, &self.b0.borrow())?;
        write_tensor(w, &self.w1.borrow())?;
        write_tensor(w, &self.b1.borrow())
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
        read_tensor(r, &mut self.w0.borrow_mut())?;
        read_tensor(r, &mut self.b0.borrow_mut())?;
        read_tensor(r, &mut self.w1.borrow_mut())?;
        read_tensor(r, &mut self.b1.borrow_mut())
    }
}

/// Trainable stand-in for a LUT: [`MicroMlpAffine`], then batch
/// normalization, then an activation (ReLU, or the step in binary mode).
///
/// After training, [`BinaryLut::import_layer`](super::BinaryLut::import_layer)
/// tabulates it node by node.
pub struct MicroMlp<const N: usize = 6, const M: usize = 16> {
    name: String,
    affine: MicroMlpAffine<N, M>,
    batch_norm: BatchNormalization,
    activation: ActivationLayer,
}

pub type MicroMlp6 = MicroMlp<6, 16>;

impl<const N: usize, const M: usize> MicroMlp<N, M> {
    pub fn new(output_shape: &[usize], seed: u64) -> MicroMlp<N, M> {
        MicroMlp {
            name: String::new(),
            affine: MicroMlpAffine::new(output_shape, seed),
            batch_norm: BatchNormalization::default(),
            activation: ActivationLayer::new(ActivationFunction::ReLU),
        }
    }

    pub fn create(output_shape: &[usize], seed: u64) -> Rc<RefCell<MicroMlp<N, M>>> {
        Rc::new(RefCell::new(Self::new(output_shape, seed)))
    }

    pub fn affine(&self) -> &MicroMlpAffine<N, M> {
        &self.affine
    }

    pub fn batch_norm(&self) -> &BatchNormalization {
        &self.batch_norm
    }

    pub fn activation(&self) -> &ActivationLayer {
        &self.activation
    }
}

impl<const N: usize, const M: usize> SparseModel for MicroMlp<N, M> {
    fn node_input_size(&self, node: usize) -> usize {
        self.affine.node_input_size(node)
    }

    fn node_input(&self, node: usize, input_index: usize) -> usize {
        self.affine.node_input(node, input_index)
    }

    fn set_node_input(&mut self, node: usize, input_index: usize, input_node: usize) {
        self.affine.set_node_input(node, input_index, input_node);
    }

    /// Inference-mode output: batch normalization uses its running statistics.
    fn forward_node(&self, node: usize, x: &[f32]) -> f32 {
        let a = self.affine.forward_node(node, x);
        self.activation.apply(self.batch_norm.normalize_node(node, a))
    }
}

impl<const N: usize, const M: usize> Model for MicroMlp<N, M> {
    fn class_name(&self) -> &'static str {
        "MicroMlp"
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
            self.affine.send_command(command, send_to);
            self.batch_norm.send_command(command, send_to);
            self.activation.send_command(command, send_to);
        }
    }

    /// Commands addressed to the block reach every part of it.
    fn command_proc(&mut self, args: &[String]) {
        self.affine.command_proc(args);
        self.batch_norm.command_proc(args);
        self.activation.command_proc(args);
    }

    fn get_parameters(&self) -> Variables {
        let mut vars = self.affine.get_parameters();
        vars.append(self.batch_norm.get_parameters());
        vars
    }

    fn get_gradients(&self) -> Variables {
        let mut vars = self.affine.get_gradients();
        vars.append(self.batch_norm.get_gradients());
        vars
    }

    fn set_input_shape(&mut self, shape: &[usize]) -> Vec<usize> {
        let shape = self.affine.set_input_shape(shape);
        let shape = self.batch_norm.set_input_shape(&shape);
        self.activation.set_input_shape(&shape)
    }

    fn input_shape(&self) -> Vec<usize> {
        self.affine.input_shape()
    }

    fn output_shape(&self) -> Vec<usize> {
        self.activation.output_shape()
    }

    fn forward(&mut self, x: FrameBuffer, train: bool) -> FrameBuffer {
        let x = self.affine.forward(x, train);
        let x = self.batch_norm.forward(x, train);
        self.activation.forward(x, train)
    }

    fn backward(&mut self, dy: FrameBuffer) -> FrameBuffer {
        let dy = self.activation.backward(dy);
        let dy = self.batch_norm.backward(dy);
        self.affine.backward(dy)
    }

    fn after_update(&mut self) {
        self.affine.after_update();
        self.batch_norm.after_update();
        self.activation.after_update();
    }

    fn save(&self, w: &mut dyn Write) -> Result<()> {
        write_name(w, &self.name)?;
        self.affine.save(w)?;
        self.batch_norm.save(w)?;
        self.activation.save(w)
    }

    fn load(&mut self, r: &mut dyn Read) -> Result<()> {
        self.name = read_name(r)?;
        self.affine.load(r)?;
        self.batch_norm.load(r)?;
        self.activation.load(r)?;
        let shape = self.batch_norm.input_shape();
        self.activation.set_input_shape(&shape);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn random_batch(frames: usize, nodes: usize) -> FrameBuffer {
        let mut x = FrameBuffer::new(frames, &[nodes], DataType::Fp32);
        for frame in 0..frames {
            for node in 0..nodes {
                x.set_fp32(frame, node, ((frame * 7 + node * 13) % 11) as f32 / 10.0);
            }
        }
        x
    }

    #[test]
    fn test_affine_forward_matches_forward_node() {
        let mut affine = MicroMlpAffine::<3, 4>::new(&[5], 2);
        affine.set_input_shape(&[8]);
        let x = random_batch(6, 8);
        let y = affine.forward(x.clone(), true);
        for node in 0..5 {
            for frame in 0..6 {
                let xs: Vec<f32> = (0..3).map(|i| x.get_fp32(frame, affine.node_input(node, i))).collect();
                assert_eq!(y.get_fp32(frame, node), affine.forward_node(node, &xs));
            }
        }
    }

    #[test]
    fn test_affine_backward_matches_finite_differences() {
        let mut affine = MicroMlpAffine::<2, 3>::new(&[1], 4);
        affine.set_input_shape(&[2]);
        affine.set_node_input(0, 0, 0);
        affine.set_node_input(0, 1, 1);
        affine.w0.borrow_mut().data_mut().copy_from_slice(&[0.5, -0.3, 0.8, 0.2, -0.6, 0.9]);
        affine.b0.borrow_mut().data_mut().copy_from_slice(&[0.1, 0.05, 0.2]);
        affine.w1.borrow_mut().data_mut().copy_from_slice(&[1.5, -0.7, 0.4]);

        let values = [0.7f32, 0.4];
        let mut x = FrameBuffer::new(1, &[2], DataType::Fp32);
        x.set_fp32(0, 0, values[0]);
        x.set_fp32(0, 1, values[1]);
        affine.forward(x, true);
        let mut dy = FrameBuffer::new(1, &[1], DataType::Fp32);
        dy.set_fp32(0, 0, 1.0);
        let dx = affine.backward(dy);

        let h = 1e-3;
        for i in 0..2 {
            let mut plus = values;
            plus[i] += h;
            let mut minus = values;
            minus[i] -= h;
            let numeric = (affine.forward_node(0, &plus) - affine.forward_node(0, &minus)) / (2.0 * h);
            assert!((numeric - dx.get_fp32(0, i)).abs() < 1e-2, "input {i}");
        }
        for k in 0..6 {
            let original = affine.w0.borrow()[k];
            affine.w0.borrow_mut()[k] = original + h;
            let plus = affine.forward_node(0, &values);
            affine.w0.borrow_mut()[k] = original - h;
            let minus = affine.forward_node(0, &values);
            affine.w0.borrow_mut()[k] = original;
            let numeric = (plus - minus) / (2.0 * h);
            assert!((numeric - affine.dw0.borrow()[k]).abs() < 1e-2, "w0[{k}]");
        }
        // dW1 holds the active hidden values, so they rebuild the output.
        assert_eq!(affine.db1.borrow()[0], 1.0);
        let dw1 = affine.dw1.borrow();
        let w1 = affine.w1.borrow();
        let rebuilt: f32 = dw1.data().iter().zip(w1.data()).map(|(h, w)| h * w).sum();
        assert!((affine.forward_node(0, &values) - rebuilt).abs() < 1e-5);
    }

    #[test]
    fn test_block_forward_node_matches_inference() {
        let mut mlp = MicroMlp::<4, 8>::new(&[6], 3);
        mlp.set_input_shape(&[10]);
        mlp.forward(random_batch(32, 10), true);

        let x = random_batch(5, 10);
        let y = mlp.forward(x.clone(), false);
        for node in 0..6 {
            for frame in 0..5 {
                let xs: Vec<f32> = (0..4).map(|i| x.get_fp32(frame, mlp.node_input(node, i))).collect();
                assert!((y.get_fp32(frame, node) - mlp.forward_node(node, &xs)).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn test_binary_command_reaches_activation() {
        let mut mlp = MicroMlp6::new(&[4], 1);
        mlp.send_command("binary true", "MicroMlp");
        assert!(mlp.activation().binary_mode());
        mlp.send_command("binary false", "all");
        assert!(!mlp.activation().binary_mode());
    }

    #[test]
    fn test_save_load_round_trip() {
        let mut mlp = MicroMlp::<4, 8>::new(&[6], 3);
        mlp.set_input_shape(&[10]);
        mlp.forward(random_batch(16, 10), true);
        let mut stream = Vec::new();
        mlp.save(&mut stream).unwrap();

        let mut copy = MicroMlp::<4, 8>::new(&[6], 99);
        copy.load(&mut stream.as_slice()).unwrap();
        let x = random_batch(4, 10);
        let expected = mlp.forward(x.clone(), false);
        let actual = copy.forward(x, false);
        for frame in 0..4 {
            assert_eq!(actual.frame_values(frame), expected.frame_values(frame));
        }
    }
}
