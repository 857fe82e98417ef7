use std::cell::RefCell;
use std::io::{Read, Write};
use std::rc::Rc;

use crate::buffer::FrameBuffer;
use crate::error::Result;
use crate::model::command::{is_command_target, split_command};
use crate::model::serialize::{read_name, write_name};
use crate::model::{Model, ModelRef};
use crate::variables::Variables;

/// Ordered chain of shared models; itself a [`Model`].
///
/// Forward runs children in declaration order, backward in strict reverse
/// order. Commands, parameter queries and update hooks fan out to every
/// child; a command addressed to the container itself applies to all of
/// them.
#[derive(Default)]
pub struct Sequential {
    name: String,
    layers: Vec<ModelRef>,
    input_shape: Vec<usize>,
    output_shape: Vec<usize>,
}

impl Sequential {
    pub fn new() -> Sequential {
        Sequential::default()
    }

    pub fn create() -> Rc<RefCell<Sequential>> {
        Rc::new(RefCell::new(Sequential::new()))
    }

    /// Builds a container from layer handles in order.
    pub fn from_layers(layers: Vec<ModelRef>) -> Sequential {
        Sequential { layers, ..Sequential::default() }
    }

    pub fn add(&mut self, layer: ModelRef) {
        self.layers.push(layer);
    }

    pub fn layers(&self) -> &[ModelRef] {
        &self.layers
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

impl Model for Sequential {
    fn class_name(&self) -> &'static str {
        "Sequential"
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
            return;
        }
        for layer in &self.layers {
            layer.borrow_mut().send_command(command, send_to);
        }
    }

    /// Commands addressed to the container reach every child.
    fn command_proc(&mut self, args: &[String]) {
        for layer in &self.layers {
            layer.borrow_mut().command_proc(args);
        }
    }

    fn get_parameters(&self) -> Variables {
        let mut vars = Variables::new();
        for layer in &self.layers {
            vars.append(layer.borrow().get_parameters());
        }
        vars
    }

    fn get_gradients(&self) -> Variables {
        let mut vars = Variables::new();
        for layer in &self.layers {
            vars.append(layer.borrow().get_gradients());
        }
        vars
    }

    fn set_input_shape(&mut self, shape: &[usize]) -> Vec<usize> {
        self.input_shape = shape.to_vec();
        let mut shape = shape.to_vec();
        for layer in &self.layers {
            let mut layer = layer.borrow_mut();
            shape = layer.set_input_shape(&shape);
            log::debug!("{}: output shape {:?}", layer.name(), shape);
        }
        self.output_shape = shape.clone();
        shape
    }

    fn input_shape(&self) -> Vec<usize> {
        self.input_shape.clone()
    }

    fn output_shape(&self) -> Vec<usize> {
        self.output_shape.clone()
    }

    fn forward(&mut self, x: FrameBuffer, train: bool) -> FrameBuffer {
        let mut x = x;
        for layer in &self.layers {
            x = layer.borrow_mut().forward(x, train);
        }
        x
    }

    fn backward(&mut self, dy: FrameBuffer) -> FrameBuffer {
        let mut dy = dy;
        for layer in self.layers.iter().rev() {
            dy = layer.borrow_mut().backward(dy);
        }
        dy
    }

    fn forward_multi(&mut self, xs: Vec<FrameBuffer>, train: bool) -> Vec<FrameBuffer> {
        let mut xs = xs;
        for layer in &self.layers {
            xs = layer.borrow_mut().forward_multi(xs, train);
        }
        xs
    }

    fn backward_multi(&mut self, dys: Vec<FrameBuffer>) -> Vec<FrameBuffer> {
        let mut dys = dys;
        for layer in self.layers.iter().rev() {
            dys = layer.borrow_mut().backward_multi(dys);
        }
        dys
    }

    fn after_update(&mut self) {
        for layer in &self.layers {
            layer.borrow_mut().after_update();
        }
    }

    fn save(&self, w: &mut dyn Write) -> Result<()> {
        write_name(w, &self.name)?;
        for layer in &self.layers {
            layer.borrow().save(w)?;
        }
        Ok(())
    }

    fn load(&mut self, r: &mut dyn Read) -> Result<()> {
        self.name = read_name(r)?;
        for layer in &self.layers {
            layer.borrow_mut().load(r)?;
        }
        Ok(())
    }

    fn info(&self, depth: usize, nest: usize) -> String {
        let indent = "  ".repeat(nest);
        let mut s = format!(
            "{indent}[{}] {}\n{indent}  input  shape : {:?}\n{indent}  output shape : {:?}\n",
            self.class_name(),
            self.name(),
            self.input_shape,
            self.output_shape,
        );
        if depth == 0 || nest + 1 < depth {
            for layer in &self.layers {
                s += &layer.borrow().info(depth, nest + 1);
            }
        }
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activation::ActivationFunction;
    use crate::buffer::DataType;
    use crate::layers::{ActivationLayer, DenseAffine};

    fn input() -> FrameBuffer {
        let mut x = FrameBuffer::new(3, &[4], DataType::Fp32);
        for f in 0..3 {
            for node in 0..4 {
                x.set_fp32(f, node, (f * 4 + node) as f32 * 0.25 - 1.0);
            }
        }
        x
    }

    #[test]
    #[should_panic(expected = "takes exactly one input")]
    fn test_single_input_layer_rejects_no_buffers() {
        let mut layer = ActivationLayer::new(ActivationFunction::ReLU);
        layer.set_input_shape(&[4]);
        layer.forward_multi(Vec::new(), false);
    }

    #[test]
    #[should_panic(expected = "takes exactly one input")]
    fn test_single_input_layer_rejects_two_buffers() {
        let mut layer = ActivationLayer::new(ActivationFunction::ReLU);
        layer.set_input_shape(&[4]);
        layer.forward_multi(vec![input(), input()], false);
    }

    #[test]
    fn test_forward_multi_matches_forward() {
        let dense = DenseAffine::create(&[3], 7);
        let relu = ActivationLayer::create(ActivationFunction::ReLU);
        let layers: Vec<ModelRef> = vec![dense, relu];
        let mut net = Sequential::from_layers(layers);
        assert_eq!(net.set_input_shape(&[4]), vec![3]);

        let y = net.forward(input(), false);
        let ys = net.forward_multi(vec![input()], false);
        assert_eq!(ys.len(), 1);
        for f in 0..3 {
            assert_eq!(ys[0].frame_values(f), y.frame_values(f));
        }
    }

    #[test]
    fn test_command_to_container_reaches_children() {
        let first = DenseAffine::create(&[3], 1);
        let inner = Sequential::create();
        let second = DenseAffine::create(&[2], 2);
        inner.borrow_mut().add(second.clone());
        let layers: Vec<ModelRef> = vec![first.clone(), inner.clone()];
        let mut net = Sequential::from_layers(layers);
        net.set_name("net");

        net.send_command("binary true", "net");
        assert!(first.borrow().binary_mode());
        assert!(second.borrow().binary_mode());

        inner.borrow_mut().set_name("tail");
        net.send_command("binary false", "tail");
        assert!(first.borrow().binary_mode());
        assert!(!second.borrow().binary_mode());

        net.send_command("binary false", "Sequential");
        assert!(!first.borrow().binary_mode());
    }
}
