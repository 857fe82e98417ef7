use std::cell::RefCell;
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::rc::Rc;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::buffer::{shape_size, DataType, FrameBuffer};
use crate::error::{Error, Result};
use crate::layers::rows::{for_each_bit_row, for_each_fp32_row};
use crate::layers::sparse::{random_connections, SparseModel};
use crate::math::init::seeded_rng;
use crate::model::serialize::{
    read_bool, read_name, read_shape, read_u64, write_bool, write_name, write_shape, write_u64,
};
use crate::model::Model;

/// Sweeps allowed per feedback search before it is cut off.
pub const DEFAULT_FEEDBACK_MAX_SWEEPS: usize = 64;

/// One output node of an exported LUT layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LutNodeData {
    pub connections: Vec<usize>,
    pub table: Vec<bool>,
}

/// Serializable snapshot of a [`BinaryLut`], the interchange format for
/// external (e.g. RTL) exporters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LutLayerData {
    pub name: String,
    pub lut_input_size: usize,
    pub input_shape: Vec<usize>,
    pub output_shape: Vec<usize>,
    pub nodes: Vec<LutNodeData>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Feedback {
    /// Nothing proposed yet since the last forward.
    Idle,
    /// A trial flip of `(node, entry)` is applied and awaits its verdict.
    Trial {
        node: usize,
        entry: usize,
        best_loss: f64,
        kept: usize,
        sweeps: usize,
    },
    Finished,
}

/// Binary look-up-table layer.
///
/// Every output node reads `N` inputs and owns a `2^N` entry truth table.
/// Bit `i` of the table index is the value of the node's `i`-th input.
/// `Bit` inputs produce `Bit` outputs evaluated 64 frames per word; any
/// other input type is thresholded at 0.5 and produces `Fp32` 0/1 values.
#[derive(Debug)]
pub struct BinaryLut<const N: usize = 6> {
    name: String,
    seed: u64,
    input_shape: Vec<usize>,
    output_shape: Vec<usize>,
    connections: Vec<usize>,
    tables: Vec<bool>,
    x: Option<FrameBuffer>,
    y: Option<FrameBuffer>,
    feedback: Feedback,
    feedback_max_sweeps: usize,
}

pub type BinaryLut6 = BinaryLut<6>;

impl<const N: usize> BinaryLut<N> {
    pub const TABLE_SIZE: usize = 1 << N;

    pub fn new(output_shape: &[usize], seed: u64) -> BinaryLut<N> {
        assert!(N > 0 && N <= 16, "unsupported LUT input size {N}");
        BinaryLut {
            name: String::new(),
            seed,
            input_shape: Vec::new(),
            output_shape: output_shape.to_vec(),
            connections: Vec::new(),
            tables: Vec::new(),
            x: None,
            y: None,
            feedback: Feedback::Idle,
            feedback_max_sweeps: DEFAULT_FEEDBACK_MAX_SWEEPS,
        }
    }

    pub fn create(output_shape: &[usize], seed: u64) -> Rc<RefCell<BinaryLut<N>>> {
        Rc::new(RefCell::new(Self::new(output_shape, seed)))
    }

    fn allocate(&mut self, input_shape: &[usize], output_shape: &[usize]) {
        self.input_shape = input_shape.to_vec();
        self.output_shape = output_shape.to_vec();
        let nodes = shape_size(output_shape);
        self.connections = vec![0; nodes * N];
        self.tables = vec![false; nodes * Self::TABLE_SIZE];
        self.x = None;
        self.y = None;
        self.feedback = Feedback::Idle;
    }

    pub fn lut_table(&self, node: usize, entry: usize) -> bool {
        assert!(entry < Self::TABLE_SIZE, "table entry {entry} out of range");
        self.tables[node * Self::TABLE_SIZE + entry]
    }

    pub fn set_lut_table(&mut self, node: usize, entry: usize, value: bool) {
        assert!(entry < Self::TABLE_SIZE, "table entry {entry} out of range");
        self.tables[node * Self::TABLE_SIZE + entry] = value;
    }

    pub fn feedback_max_sweeps(&self) -> usize {
        self.feedback_max_sweeps
    }

    pub fn set_feedback_max_sweeps(&mut self, sweeps: usize) {
        assert!(sweeps > 0, "feedback needs at least one sweep");
        self.feedback_max_sweeps = sweeps;
    }

    /// Output of the last forward pass, updated by every feedback trial.
    pub fn output(&self) -> FrameBuffer {
        match &self.y {
            Some(y) => y.clone(),
            None => panic!("{}: output requested before forward", self.name()),
        }
    }

    /// Abandons the feedback search, reverting a pending trial flip.
    pub fn reset_feedback(&mut self) {
        if let Feedback::Trial { node, entry, .. } = self.feedback {
            self.flip(node, entry);
        }
        self.feedback = Feedback::Idle;
    }

    /// Greedy table search driven by an external per-frame loss.
    ///
    /// `loss` describes the current output (`output()`). The pending trial
    /// flip is kept only if the summed loss strictly improved, otherwise it
    /// is reverted; then the next `(node, entry)` is flipped and the output
    /// recomputed. Returns `false` once a full sweep keeps nothing or the
    /// sweep cap is reached, and keeps returning `false` until the next
    /// `forward` or `reset_feedback`.
    ///
    /// A search in progress survives `forward`, which then evaluates the
    /// table with the trial flip applied. This lets the loss come from a
    /// whole network run between calls; the input must stay the same for
    /// the comparison to be meaningful.
    pub fn feedback(&mut self, loss: &[f32]) -> bool {
        let Some(y) = &self.y else {
            panic!("{}: feedback called before forward", self.name());
        };
        assert_eq!(loss.len(), y.frame_size(), "{}: loss must have one value per frame", self.name());
        let loss_sum: f64 = loss.iter().map(|&v| v as f64).sum();
        let nodes = shape_size(&self.output_shape);

        match self.feedback {
            Feedback::Finished => false,
            Feedback::Idle => {
                if nodes == 0 {
                    self.feedback = Feedback::Finished;
                    return false;
                }
                self.flip(0, 0);
                self.feedback = Feedback::Trial {
                    node: 0,
                    entry: 0,
                    best_loss: loss_sum,
                    kept: 0,
                    sweeps: 0,
                };
                true
            }
            Feedback::Trial {
                node,
                entry,
                mut best_loss,
                mut kept,
                mut sweeps,
            } => {
                if loss_sum < best_loss {
                    best_loss = loss_sum;
                    kept += 1;
                } else {
                    self.flip(node, entry);
                }

                let (mut node, mut entry) = (node, entry + 1);
                if entry == Self::TABLE_SIZE {
                    entry = 0;
                    node += 1;
                }
                if node == nodes {
                    node = 0;
                    sweeps += 1;
                    log::debug!(
                        "{}: feedback sweep {} kept {} flips (loss {:.6})",
                        self.name(),
                        sweeps,
                        kept,
                        best_loss
                    );
                    if kept == 0 {
                        self.feedback = Feedback::Finished;
                        return false;
                    }
                    if sweeps >= self.feedback_max_sweeps {
                        log::warn!(
                            "{}: feedback stopped after {} sweeps without converging",
                            self.name(),
                            sweeps
                        );
                        self.feedback = Feedback::Finished;
                        return false;
                    }
                    kept = 0;
                }

                self.flip(node, entry);
                self.feedback = Feedback::Trial {
                    node,
                    entry,
                    best_loss,
                    kept,
                    sweeps,
                };
                true
            }
        }
    }

    /// Toggles one table entry and re-evaluates that node's stored output.
    fn flip(&mut self, node: usize, entry: usize) {
        let index = node * Self::TABLE_SIZE + entry;
        self.tables[index] = !self.tables[index];

        let (Some(x), Some(y)) = (&self.x, &mut self.y) else {
            panic!("feedback called before forward");
        };
        let connections = &self.connections[node * N..(node + 1) * N];
        let table = &self.tables[node * Self::TABLE_SIZE..(node + 1) * Self::TABLE_SIZE];
        let frame_size = y.frame_size();
        let stride = y.node_stride();
        match y.data_type() {
            DataType::Bit => {
                let row = &mut y.bit_storage_mut()[node * stride..(node + 1) * stride];
                row.fill(0);
                eval_bit_row::<N>(connections, table, x, frame_size, row);
            }
            _ => {
                let row = &mut y.fp32_storage_mut()[node * stride..node * stride + frame_size];
                eval_fp32_row::<N>(connections, table, x, row);
            }
        }
    }

    /// Tabulates a trained sparse layer: connections are copied and every
    /// entry becomes `source.forward_node(node, combination) > 0.5`.
    pub fn import_layer(&mut self, source: &mut dyn SparseModel) {
        let input_shape = source.input_shape();
        let output_shape = source.output_shape();
        self.allocate(&input_shape, &output_shape);

        let input_nodes = shape_size(&input_shape);
        let mut x = vec![0.0f32; N];
        for node in 0..shape_size(&output_shape) {
            assert_eq!(
                source.node_input_size(node),
                N,
                "{}: source node {} has {} inputs, expected {}",
                self.name(),
                node,
                source.node_input_size(node),
                N
            );
            for i in 0..N {
                let input = source.node_input(node, i);
                assert!(input < input_nodes, "connection {input} out of range");
                self.connections[node * N + i] = input;
            }
            for entry in 0..Self::TABLE_SIZE {
                for (i, v) in x.iter_mut().enumerate() {
                    *v = if (entry >> i) & 1 != 0 { 1.0 } else { 0.0 };
                }
                self.tables[node * Self::TABLE_SIZE + entry] = source.forward_node(node, &x) > 0.5;
            }
        }
        log::debug!(
            "{}: imported {} nodes from {}",
            self.name(),
            shape_size(&output_shape),
            source.name()
        );
    }

    pub fn export_data(&self) -> LutLayerData {
        let nodes = (0..shape_size(&self.output_shape))
            .map(|node| LutNodeData {
                connections: self.connections[node * N..(node + 1) * N].to_vec(),
                table: self.tables[node * Self::TABLE_SIZE..(node + 1) * Self::TABLE_SIZE].to_vec(),
            })
            .collect();
        LutLayerData {
            name: self.name(),
            lut_input_size: N,
            input_shape: self.input_shape.clone(),
            output_shape: self.output_shape.clone(),
            nodes,
        }
    }

    /// Restores connections and tables from an exported snapshot.
    pub fn import_data(&mut self, data: &LutLayerData) -> Result<()> {
        if data.lut_input_size != N {
            return Err(Error::InvalidFormat {
                message: format!("LUT input size {} does not match {}", data.lut_input_size, N),
            });
        }
        if data.nodes.len() != shape_size(&data.output_shape) {
            return Err(Error::InvalidFormat {
                message: format!(
                    "{} nodes do not match output shape {:?}",
                    data.nodes.len(),
                    data.output_shape
                ),
            });
        }
        let input_nodes = shape_size(&data.input_shape);
        self.allocate(&data.input_shape, &data.output_shape);
        self.name = data.name.clone();
        for (node, node_data) in data.nodes.iter().enumerate() {
            if node_data.connections.len() != N
                || node_data.table.len() != Self::TABLE_SIZE
                || node_data.connections.iter().any(|&c| c >= input_nodes)
            {
                return Err(Error::InvalidFormat {
                    message: format!("node {node} is malformed"),
                });
            }
            self.connections[node * N..(node + 1) * N].copy_from_slice(&node_data.connections);
            self.tables[node * Self::TABLE_SIZE..(node + 1) * Self::TABLE_SIZE]
                .copy_from_slice(&node_data.table);
        }
        Ok(())
    }

    pub fn save_json(&self, path: &str) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(&mut writer, &self.export_data())?;
        writer.flush()?;
        Ok(())
    }

    pub fn load_json(&mut self, path: &str) -> Result<()> {
        let data: LutLayerData = serde_json::from_reader(File::open(path)?)?;
        self.import_data(&data)
    }
}

/// Bit-sliced evaluation of one node over packed frames: a word of output
/// is the OR over true table entries of the AND of matching input literals.
fn eval_bit_row<const N: usize>(
    connections: &[usize],
    table: &[bool],
    x: &FrameBuffer,
    frame_size: usize,
    row: &mut [u64],
) {
    let inputs: [&[u64]; N] = std::array::from_fn(|i| x.bit_row(connections[i]));
    let words = frame_size.div_ceil(64);
    for (w, out) in row.iter_mut().enumerate().take(words) {
        let literals: [u64; N] = std::array::from_fn(|i| inputs[i][w]);
        let mut acc = 0u64;
        for (entry, &t) in table.iter().enumerate() {
            if !t {
                continue;
            }
            let mut term = !0u64;
            for (i, &lit) in literals.iter().enumerate() {
                term &= if (entry >> i) & 1 != 0 { lit } else { !lit };
            }
            acc |= term;
        }
        let tail = frame_size - w * 64;
        if tail < 64 {
            acc &= (1u64 << tail) - 1;
        }
        *out = acc;
    }
}

fn eval_fp32_row<const N: usize>(
    connections: &[usize],
    table: &[bool],
    x: &FrameBuffer,
    row: &mut [f32],
) {
    let inputs: [&[f32]; N] = std::array::from_fn(|i| x.fp32_row(connections[i]));
    for (frame, out) in row.iter_mut().enumerate() {
        let mut index = 0;
        for (i, input) in inputs.iter().enumerate() {
            if input[frame] > 0.5 {
                index |= 1 << i;
            }
        }
        *out = if table[index] { 1.0 } else { 0.0 };
    }
}

impl<const N: usize> SparseModel for BinaryLut<N> {
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
        let mut index = 0;
        for (i, &v) in x.iter().take(N).enumerate() {
            if v > 0.5 {
                index |= 1 << i;
            }
        }
        if self.lut_table(node, index) { 1.0 } else { 0.0 }
    }
}

impl<const N: usize> Model for BinaryLut<N> {
    fn class_name(&self) -> &'static str {
        "BinaryLut"
    }

    fn instance_name(&self) -> &str {
        &self.name
    }

    fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }

    fn set_input_shape(&mut self, shape: &[usize]) -> Vec<usize> {
        if shape == self.input_shape.as_slice() {
            return self.output_shape.clone();
        }
        let output_shape = self.output_shape.clone();
        self.allocate(shape, &output_shape);

        let mut rng = seeded_rng(self.seed);
        let nodes = shape_size(&output_shape);
        self.connections = random_connections(&mut rng, shape_size(shape), nodes, N);
        for t in self.tables.iter_mut() {
            *t = rng.gen();
        }
        output_shape
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
        let x = match x.data_type() {
            DataType::Bit | DataType::Fp32 => x,
            _ => x.convert(DataType::Fp32),
        };
        let frame_size = x.frame_size();
        let connections = &self.connections;
        let tables = &self.tables;
        let table_size = Self::TABLE_SIZE;

        let mut y = FrameBuffer::new(frame_size, &self.output_shape, x.data_type());
        if x.data_type() == DataType::Bit {
            for_each_bit_row(&mut y, |node, row| {
                eval_bit_row::<N>(
                    &connections[node * N..(node + 1) * N],
                    &tables[node * table_size..(node + 1) * table_size],
                    &x,
                    frame_size,
                    row,
                )
            });
        } else {
            for_each_fp32_row(&mut y, |node, row| {
                eval_fp32_row::<N>(
                    &connections[node * N..(node + 1) * N],
                    &tables[node * table_size..(node + 1) * table_size],
                    &x,
                    row,
                )
            });
        }

        self.x = Some(x);
        self.y = Some(y.clone());
        if self.feedback == Feedback::Finished {
            self.feedback = Feedback::Idle;
        }
        y
    }

    /// LUTs are not differentiable; the input gradient is zero.
    fn backward(&mut self, dy: FrameBuffer) -> FrameBuffer {
        if self.x.is_none() {
            panic!("{}: backward called before forward", self.name());
        }
        FrameBuffer::new(dy.frame_size(), &self.input_shape, DataType::Fp32)
    }

    fn save(&self, w: &mut dyn Write) -> Result<()> {
        write_name(w, &self.name)?;
        write_shape(w, &self.input_shape)?;
        write_shape(w, &self.output_shape)?;
        for &c in &self.connections {
            write_u64(w, c as u64)?;
        }
        for &t in &self.tables {
            write_bool(w, t)?;
        }
        Ok(())
    }

    fn load(&mut self, r: &mut dyn Read) -> Result<()> {
        self.name = read_name(r)?;
        let input_shape = read_shape(r)?;
        let output_shape = read_shape(r)?;
        self.allocate(&input_shape, &output_shape);
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
        for t in self.tables.iter_mut() {
            *t = read_bool(r)?;
        }
        Ok(())
    }
}

/// Table index addressed by one input combination (bit `i` is `bits[i]`).
pub fn lut_index(bits: &[bool]) -> usize {
    bits.iter()
        .enumerate()
        .fold(0, |acc, (i, &b)| if b { acc | (1 << i) } else { acc })
}
