use std::cell::RefCell;
use std::rc::Rc;

use super::tensor::Tensor;

/// Shared handle to a parameter or gradient tensor.
///
/// The layer that creates a tensor owns it; optimizers receive clones of the
/// handle for in-place updates.
pub type TensorRef = Rc<RefCell<Tensor>>;

pub fn tensor_ref(tensor: Tensor) -> TensorRef {
    Rc::new(RefCell::new(tensor))
}

/// Ordered collection of tensor handles.
///
/// A model returns its parameters and its gradients as two `Variables` of
/// identical length, order and shapes.
#[derive(Debug, Clone, Default)]
pub struct Variables {
    tensors: Vec<TensorRef>,
}

impl Variables {
    pub fn new() -> Variables {
        Variables::default()
    }

    pub fn push(&mut self, tensor: TensorRef) {
        self.tensors.push(tensor);
    }

    pub fn append(&mut self, other: Variables) {
        self.tensors.extend(other.tensors);
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn get(&self, index: usize) -> &TensorRef {
        &self.tensors[index]
    }

    pub fn iter(&self) -> impl Iterator<Item = &TensorRef> {
        self.tensors.iter()
    }

    pub fn shapes(&self) -> Vec<Vec<usize>> {
        self.tensors.iter().map(|t| t.borrow().shape().to_vec()).collect()
    }

    /// Total number of scalar elements.
    pub fn element_count(&self) -> usize {
        self.tensors.iter().map(|t| t.borrow().len()).sum()
    }

    pub fn fill_zero(&self) {
        for t in &self.tensors {
            t.borrow_mut().fill(0.0);
        }
    }

    /// Panics unless `grads` pairs one-to-one with `params`.
    pub fn assert_paired(params: &Variables, grads: &Variables) {
        assert_eq!(params.len(), grads.len(), "parameter/gradient count mismatch");
        for (i, (p, g)) in params.iter().zip(grads.iter()).enumerate() {
            assert_eq!(
                p.borrow().shape(),
                g.borrow().shape(),
                "gradient {i} does not match its parameter shape"
            );
        }
    }
}
