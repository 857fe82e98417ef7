/// Number of nodes described by `shape` (product of all dimensions).
///
/// The empty shape describes a scalar and has size 1.
pub fn shape_size(shape: &[usize]) -> usize {
    shape.iter().product()
}

/// Linearizes a multi-index. The first dimension varies fastest.
pub fn linear_index(index: &[usize], shape: &[usize]) -> usize {
    assert_eq!(index.len(), shape.len(), "index rank does not match shape rank");
    let mut node = 0;
    for (i, (&idx, &dim)) in index.iter().zip(shape.iter()).enumerate().rev() {
        debug_assert!(idx < dim, "index {idx} out of range in dimension {i} (size {dim})");
        node = node * dim + idx;
    }
    node
}

/// Inverse of [`linear_index`].
pub fn unravel_index(mut node: usize, shape: &[usize]) -> Vec<usize> {
    let mut index = Vec::with_capacity(shape.len());
    for &dim in shape {
        index.push(node % dim);
        node /= dim;
    }
    index
}
