use crate::optim::optimizer::Optimizer;
use crate::variables::Variables;

/// Adam with bias-corrected moment estimates.
///
/// Moment buffers are sized from the bound variables and reset on every
/// `set_variables`, so one instance may be rebound to another network.
pub struct Adam {
    pub learning_rate: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
    step: i32,
    m: Vec<Vec<f32>>,
    v: Vec<Vec<f32>>,
    params: Variables,
    grads: Variables,
}

impl Default for Adam {
    fn default() -> Self {
        Adam::new(0.001, 0.9, 0.999)
    }
}

impl Adam {
    pub fn new(learning_rate: f32, beta1: f32, beta2: f32) -> Adam {
        Adam {
            learning_rate,
            beta1,
            beta2,
            epsilon: 1.0e-8,
            step: 0,
            m: Vec::new(),
            v: Vec::new(),
            params: Variables::new(),
            grads: Variables::new(),
        }
    }
}

impl Optimizer for Adam {
    fn set_variables(&mut self, params: Variables, grads: Variables) {
        Variables::assert_paired(&params, &grads);
        self.m = params.iter().map(|p| vec![0.0; p.borrow().len()]).collect();
        self.v = self.m.clone();
        self.step = 0;
        self.params = params;
        self.grads = grads;
    }

    fn update(&mut self) {
        self.step += 1;
        let lr_t = self.learning_rate * (1.0 - self.beta2.powi(self.step)).sqrt()
            / (1.0 - self.beta1.powi(self.step));

        for (i, (p, g)) in self.params.iter().zip(self.grads.iter()).enumerate() {
            let mut p = p.borrow_mut();
            let mut g = g.borrow_mut();
            let m = &mut self.m[i];
            let v = &mut self.v[i];
            for (j, (pv, &gv)) in p.data_mut().iter_mut().zip(g.data().iter()).enumerate() {
                m[j] += (1.0 - self.beta1) * (gv - m[j]);
                v[j] += (1.0 - self.beta2) * (gv * gv - v[j]);
                *pv -= lr_t * m[j] / (v[j].sqrt() + self.epsilon);
            }
            g.fill(0.0);
        }
    }
}
