use std::cell::RefCell;
use std::io::{BufReader, BufWriter, Read, Write};
use std::rc::Rc;

use crate::buffer::{shape_size, FrameBuffer};
use crate::error::Result;
use crate::model::command::{is_command_target, split_command};
use crate::model::serialize::{read_name, write_name};
use crate::variables::Variables;

/// Shared handle to a model. The same layer may sit in several containers
/// (e.g. a trained layer and the LUT network imported from it).
pub type ModelRef = Rc<RefCell<dyn Model>>;

/// Differentiable graph node.
///
/// Call order per step: `set_input_shape` once per geometry, then
/// `forward` followed by the matching `backward`. Calling `backward` without
/// a preceding `forward` panics.
pub trait Model {
    /// Type name used for command targeting and reports.
    fn class_name(&self) -> &'static str;

    /// Instance name as set by [`set_name`](Model::set_name); may be empty.
    fn instance_name(&self) -> &str;

    fn set_name(&mut self, name: &str);

    /// Instance name, falling back to the class name.
    fn name(&self) -> String {
        let name = self.instance_name();
        if name.is_empty() {
            self.class_name().to_string()
        } else {
            name.to_string()
        }
    }

    /// Delivers `command` to this model when `send_to` is `"all"`, its class
    /// name or its instance name. Containers forward to their children.
    fn send_command(&mut self, command: &str, send_to: &str) {
        if is_command_target(send_to, self.class_name(), &self.name()) {
            self.command_proc(&split_command(command));
        }
    }

    /// Handles a tokenized command. Unknown commands are ignored.
    fn command_proc(&mut self, _args: &[String]) {}

    fn get_parameters(&self) -> Variables {
        Variables::new()
    }

    fn get_gradients(&self) -> Variables {
        Variables::new()
    }

    /// Negotiates geometry and returns the output shape. Re-invocation resets
    /// every size-dependent internal state.
    fn set_input_shape(&mut self, shape: &[usize]) -> Vec<usize>;

    fn input_shape(&self) -> Vec<usize>;

    fn output_shape(&self) -> Vec<usize>;

    fn input_node_size(&self) -> usize {
        shape_size(&self.input_shape())
    }

    fn output_node_size(&self) -> usize {
        shape_size(&self.output_shape())
    }

    fn forward(&mut self, x: FrameBuffer, train: bool) -> FrameBuffer;

    fn backward(&mut self, dy: FrameBuffer) -> FrameBuffer;

    /// Branch/merge entry point; single-input models take exactly one buffer.
    fn forward_multi(&mut self, xs: Vec<FrameBuffer>, train: bool) -> Vec<FrameBuffer> {
        assert_eq!(xs.len(), 1, "{} takes exactly one input", self.class_name());
        let x = xs.into_iter().next().unwrap_or_default();
        vec![self.forward(x, train)]
    }

    fn backward_multi(&mut self, dys: Vec<FrameBuffer>) -> Vec<FrameBuffer> {
        assert_eq!(dys.len(), 1, "{} takes exactly one gradient", self.class_name());
        let dy = dys.into_iter().next().unwrap_or_default();
        vec![self.backward(dy)]
    }

    /// Called after every optimizer step (weight clamping and the like).
    fn after_update(&mut self) {}

    fn save(&self, w: &mut dyn Write) -> Result<()> {
        write_name(w, self.instance_name())
    }

    fn load(&mut self, r: &mut dyn Read) -> Result<()> {
        let name = read_name(r)?;
        self.set_name(&name);
        Ok(())
    }

    fn save_binary(&self, path: &str) -> Result<()> {
        let mut writer = BufWriter::new(std::fs::File::create(path)?);
        self.save(&mut writer)?;
        writer.flush()?;
        Ok(())
    }

    fn load_binary(&mut self, path: &str) -> Result<()> {
        let mut reader = BufReader::new(std::fs::File::open(path)?);
        self.load(&mut reader)
    }

    /// One-paragraph description; containers nest children up to `depth`
    /// levels (0 = unlimited).
    fn info(&self, _depth: usize, nest: usize) -> String {
        let indent = "  ".repeat(nest);
        format!(
            "{indent}[{}] {}\n{indent}  input  shape : {:?}\n{indent}  output shape : {:?}\n{indent}  parameters   : {}\n",
            self.class_name(),
            self.name(),
            self.input_shape(),
            self.output_shape(),
            self.get_parameters().element_count(),
        )
    }
}
