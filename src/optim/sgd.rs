use crate::optim::optimizer::Optimizer;
use crate::variables::Variables;

pub struct Sgd {
    pub learning_rate: f32,
    params: Variables,
    grads: Variables,
}

impl Sgd {
    pub fn new(learning_rate: f32) -> Sgd {
        Sgd { learning_rate, params: Variables::new(), grads: Variables::new() }
    }
}

impl Optimizer for Sgd {
    fn set_variables(&mut self, params: Variables, grads: Variables) {
        Variables::assert_paired(&params, &grads);
        self.params = params;
        self.grads = grads;
    }

    /// p ← p − lr · g
    fn update(&mut self) {
        for (p, g) in self.params.iter().zip(self.grads.iter()) {
            let mut p = p.borrow_mut();
            let mut g = g.borrow_mut();
            for (pv, gv) in p.data_mut().iter_mut().zip(g.data().iter()) {
                *pv -= self.learning_rate * gv;
            }
            g.fill(0.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variables::{tensor_ref, Tensor};

    #[test]
    fn test_sgd_step_and_clear() {
        let p = tensor_ref(Tensor::from_vec(&[2], vec![1.0, 2.0]));
        let g = tensor_ref(Tensor::from_vec(&[2], vec![0.5, -1.0]));
        let mut params = Variables::new();
        params.push(p.clone());
        let mut grads = Variables::new();
        grads.push(g.clone());

        let mut opt = Sgd::new(0.1);
        opt.set_variables(params, grads);
        opt.update();

        assert!((p.borrow()[0] - 0.95).abs() < 1e-6);
        assert!((p.borrow()[1] - 2.1).abs() < 1e-6);
        assert_eq!(g.borrow().data(), &[0.0, 0.0]);
    }
}
