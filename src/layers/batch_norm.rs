use std::cell::RefCell;
use std::io::{Read, Write};
use std::rc::Rc;

use rayon::prelude::*;

use crate::buffer::{shape_size, DataType, FrameBuffer};
use crate::error::Result;
use crate::layers::rows::for_each_fp32_row;
use crate::model::serialize::{
    read_name, read_shape, read_tensor, write_name, write_shape, write_tensor,
};
use crate::model::Model;
use crate::variables::{tensor_ref, Tensor, TensorRef, Variables};

/// Per-node normalization across the frames of a batch.
///
/// Training batches are normalized with their own statistics and update the
/// running mean/variance; inference (`train == false`) uses the running
/// statistics, which then stay frozen.
#[derive(Debug)]
pub struct BatchNormalization {
    name: String,
    momentum: f32,
    epsilon: f32,
    shape: Vec<usize>,
    gamma: TensorRef,
    beta: TensorRef,
    dgamma: TensorRef,
    dbeta: TensorRef,
    running_mean: Tensor,
    running_var: Tensor,
    /// Normalized input and `1 / sqrt(var + eps)` per node of the last forward.
    x_hat: Option<FrameBuffer>,
    inv_std: Vec<f32>,
    batch_stats: bool,
}

impl BatchNormalization {
    pub fn new(momentum: f32) -> BatchNormalization {
        BatchNormalization {
            name: String::new(),
            momentum,
            epsilon: 1.0e-7,
            shape: Vec::new(),
            gamma: tensor_ref(Tensor::zeros(&[0])),
            beta: tensor_ref(Tensor::zeros(&[0])),
            dgamma: tensor_ref(Tensor::zeros(&[0])),
            dbeta: tensor_ref(Tensor::zeros(&[0])),
            running_mean: Tensor::zeros(&[0]),
            running_var: Tensor::zeros(&[0]),
            x_hat: None,
            inv_std: Vec::new(),
            batch_stats: false,
        }
    }

    pub fn create(momentum: f32) -> Rc<RefCell<BatchNormalization>> {
        Rc::new(RefCell::new(Self::new(momentum)))
    }

    pub fn gamma(&self) -> TensorRef {
        self.gamma.clone()
    }

    pub fn beta(&self) -> TensorRef {
        self.beta.clone()
    }

    pub fn running_mean(&self) -> &Tensor {
        &self.running_mean
    }

    pub fn running_var(&self) -> &Tensor {
        &self.running_var
    }

    /// Inference-mode output of one node for a single value.
    pub fn normalize_node(&self, node: usize, value: f32) -> f32 {
        let inv_std = 1.0 / (self.running_var[node] + self.epsilon).sqrt();
        let h = (value - self.running_mean[node]) * inv_std;
        self.gamma.borrow()[node] * h + self.beta.borrow()[node]
    }
}

impl Default for BatchNormalization {
    fn default() -> Self {
        BatchNormalization::new(0.9)
    }
}

impl Model for BatchNormalization {
    fn class_name(&self) -> &'static str {
        "BatchNormalization"
    }

    fn instance_name(&self) -> &str {
        &self.name
    }

    fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }

    fn get_parameters(&self) -> Variables {
        let mut vars = Variables::new();
        vars.push(self.gamma.clone());
        vars.push(self.beta.clone());
        vars
    }

    fn get_gradients(&self) -> Variables {
        let mut vars = Variables::new();
        vars.push(self.dgamma.clone());
        vars.push(self.dbeta.clone());
        vars
    }

    fn set_input_shape(&mut self, shape: &[usize]) -> Vec<usize> {
        if shape == self.shape.as_slice() {
            return self.shape.clone();
        }
        self.shape = shape.to_vec();
        let nodes = shape_size(shape);
        let mut gamma = Tensor::zeros(&[nodes]);
        gamma.fill(1.0);
        *self.gamma.borrow_mut() = gamma;
        *self.beta.borrow_mut() = Tensor::zeros(&[nodes]);
        *self.dgamma.borrow_mut() = Tensor::zeros(&[nodes]);
        *self.dbeta.borrow_mut() = Tensor::zeros(&[nodes]);
        self.running_mean = Tensor::zeros(&[nodes]);
        self.running_var = Tensor::zeros(&[nodes]);
        self.running_var.fill(1.0);
        self.x_hat = None;
        self.shape.clone()
    }

    fn input_shape(&self) -> Vec<usize> {
        self.shape.clone()
    }

    fn output_shape(&self) -> Vec<usize> {
        self.shape.clone()
    }

    fn forward(&mut self, x: FrameBuffer, train: bool) -> FrameBuffer {
        let nodes = shape_size(&self.shape);
        assert_eq!(x.node_size(), nodes, "{}: input node size mismatch", self.name());
        let x = x.convert(DataType::Fp32);
        let frames = x.frame_size();

        let (mean, inv_std): (Vec<f32>, Vec<f32>) = if train && frames > 0 {
            let stats: Vec<(f32, f32)> = (0..nodes)
                .into_par_iter()
                .map(|node| {
                    let row = x.fp32_row(node);
                    let mean = row.iter().sum::<f32>() / frames as f32;
                    let var = row.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / frames as f32;
                    (mean, var)
                })
                .collect();
            let m = self.momentum;
            for (node, &(mean, var)) in stats.iter().enumerate() {
                self.running_mean[node] = m * self.running_mean[node] + (1.0 - m) * mean;
                self.running_var[node] = m * self.running_var[node] + (1.0 - m) * var;
            }
            stats
                .iter()
                .map(|&(mean, var)| (mean, 1.0 / (var + self.epsilon).sqrt()))
                .unzip()
        } else {
            self.running_mean
                .data()
                .iter()
                .zip(self.running_var.data())
                .map(|(&mean, &var)| (mean, 1.0 / (var + self.epsilon).sqrt()))
                .unzip()
        };

        let mut x_hat = FrameBuffer::new(frames, &self.shape, DataType::Fp32);
        for_each_fp32_row(&mut x_hat, |node, row| {
            for (v, &xv) in row.iter_mut().zip(x.fp32_row(node)) {
                *v = (xv - mean[node]) * inv_std[node];
            }
        });

        let gamma = self.gamma.borrow();
        let beta = self.beta.borrow();
        let (gamma, beta) = (gamma.data(), beta.data());
        let mut y = FrameBuffer::new(frames, &self.shape, DataType::Fp32);
        for_each_fp32_row(&mut y, |node, row| {
            for (v, &h) in row.iter_mut().zip(x_hat.fp32_row(node)) {
                *v = gamma[node] * h + beta[node];
            }
        });

        self.x_hat = Some(x_hat);
        self.inv_std = inv_std;
        self.batch_stats = train;
        y
    }

    fn backward(&mut self, dy: FrameBuffer) -> FrameBuffer {
        let Some(x_hat) = &self.x_hat else {
            panic!("{}: backward called before forward", self.name());
        };
        let dy = dy.convert(DataType::Fp32);
        let frames = x_hat.frame_size() as f32;
        let nodes = shape_size(&self.shape);

        let sums: Vec<(f32, f32)> = (0..nodes)
            .into_par_iter()
            .map(|node| {
                let g = dy.fp32_row(node);
                let h = x_hat.fp32_row(node);
                (g.iter().sum::<f32>(), g.iter().zip(h).map(|(a, b)| a * b).sum::<f32>())
            })
            .collect();
        {
            let mut dgamma = self.dgamma.borrow_mut();
            let mut dbeta = self.dbeta.borrow_mut();
            for (node, &(sum_dy, sum_dy_xhat)) in sums.iter().enumerate() {
                dbeta[node] += sum_dy;
                dgamma[node] += sum_dy_xhat;
            }
        }

        let gamma = self.gamma.borrow();
        let gamma = gamma.data();
        let inv_std = &self.inv_std;
        let batch_stats = self.batch_stats;
        let mut dx = FrameBuffer::new(x_hat.frame_size(), &self.shape, DataType::Fp32);
        for_each_fp32_row(&mut dx, |node, row| {
            let g = dy.fp32_row(node);
            let h = x_hat.fp32_row(node);
            let scale = gamma[node] * inv_std[node];
            if batch_stats {
                let (sum_dy, sum_dy_xhat) = sums[node];
                for ((d, &gv), &hv) in row.iter_mut().zip(g).zip(h) {
                    *d = scale * (gv - sum_dy / frames - hv * sum_dy_xhat / frames);
                }
            } else {
                for (d, &gv) in row.iter_mut().zip(g) {
                    *d = scale * gv;
                }
            }
        });
        dx
    }

    fn save(&self, w: &mut dyn Write) -> Result<()> {
        write_name(w, &self.name)?;
        write_shape(w, &self.shape)?;
        write_tensor(w, &self.gamma.borrow())?;
        write_tensor(w, &self.beta.borrow())?;
        write_tensor(w, &self.running_mean)?;
        write_tensor(w, &self.running_var)
    }

    fn load(&mut self, r: &mut dyn Read) -> Result<()> {
        self.name = read_name(r)?;
        let shape = read_shape(r)?;
        self.shape.clear();
        self.set_input_shape(&shape);
        read_tensor(r, &mut self.gamma.borrow_mut())?;
        read_tensor(r, &mut self.beta.borrow_mut())?;
        read_tensor(r, &mut self.running_mean)?;
        read_tensor(r, &mut self.running_var)
    }
}
