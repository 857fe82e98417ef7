use crate::variables::Variables;

/// Update rule applied to a bound parameter set.
///
/// `set_variables` binds the parameters and their gradients (and resets any
/// per-parameter state); `update` applies one step and clears the gradients
/// so layers can accumulate the next mini-batch.
pub trait Optimizer {
    fn set_variables(&mut self, params: Variables, grads: Variables);
    fn update(&mut self);
}
