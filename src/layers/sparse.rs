use rand::seq::index::sample;
use rand::Rng;

use crate::model::Model;

/// Layers whose output nodes each read a small, explicit list of inputs.
///
/// `forward_node` evaluates a single node on a dense vector holding only
/// that node's inputs; [`BinaryLut::import_layer`](super::BinaryLut::import_layer)
/// tabulates trained sparse layers through it.
pub trait SparseModel: Model {
    fn node_input_size(&self, node: usize) -> usize;
    fn node_input(&self, node: usize, input_index: usize) -> usize;
    fn set_node_input(&mut self, node: usize, input_index: usize, input_node: usize);
    fn forward_node(&self, node: usize, x: &[f32]) -> f32;
}

/// Draws `fan_in` inputs for every output node, flattened as
/// `[node * fan_in + i]`. Inputs of one node are distinct whenever
/// `input_nodes >= fan_in`.
pub fn random_connections<R: Rng>(
    rng: &mut R,
    input_nodes: usize,
    output_nodes: usize,
    fan_in: usize,
) -> Vec<usize> {
    assert!(input_nodes > 0, "sparse layer needs at least one input node");
    let mut connections = Vec::with_capacity(output_nodes * fan_in);
    for _ in 0..output_nodes {
        if input_nodes >= fan_in {
            connections.extend(sample(rng, input_nodes, fan_in).into_iter());
        } else {
            connections.extend((0..fan_in).map(|_| rng.gen_range(0..input_nodes)));
        }
    }
    connections
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::init::seeded_rng;
    use std::collections::HashSet;

    #[test]
    fn test_connections_are_distinct_per_node() {
        let connections = random_connections(&mut seeded_rng(3), 20, 16, 6);
        assert_eq!(connections.len(), 16 * 6);
        for node in connections.chunks(6) {
            let unique: HashSet<_> = node.iter().collect();
            assert_eq!(unique.len(), 6);
            assert!(node.iter().all(|&c| c < 20));
        }
    }

    #[test]
    fn test_small_input_repeats() {
        let connections = random_connections(&mut seeded_rng(3), 2, 4, 6);
        assert!(connections.iter().all(|&c| c < 2));
    }
}
