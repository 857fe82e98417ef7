use std::sync::Arc;

use super::accessor::{FrameAccessor, FrameAccessorMut};
use super::data_type::{DataType, Element, Fixed16};
use super::shape::shape_size;

/// Every node row is padded to this many bytes so per-node loops over the
/// frame axis can be vectorized.
const ROW_ALIGN_BYTES: usize = 32;

/// Frames padded per bit row (one 256-bit lane).
const BIT_ROW_ALIGN_FRAMES: usize = ROW_ALIGN_BYTES * 8;

#[derive(Debug, Clone, PartialEq)]
enum Storage {
    Bit(Vec<u64>),
    Uint8(Vec<u8>),
    Fixed16(Vec<i16>),
    Fp32(Vec<f32>),
}

impl Storage {
    fn alloc(data_type: DataType, len: usize) -> Storage {
        match data_type {
            DataType::Bit => Storage::Bit(vec![0; len]),
            DataType::Uint8 => Storage::Uint8(vec![0; len]),
            DataType::Fixed16 => Storage::Fixed16(vec![0; len]),
            DataType::Fp32 => Storage::Fp32(vec![0.0; len]),
        }
    }
}

fn round_up(value: usize, unit: usize) -> usize {
    value.div_ceil(unit) * unit
}

/// Storage units (words for `Bit`, elements otherwise) per node row.
fn row_len(data_type: DataType, frame_size: usize) -> usize {
    match data_type {
        DataType::Bit => round_up(frame_size, BIT_ROW_ALIGN_FRAMES) / 64,
        other => round_up(frame_size, ROW_ALIGN_BYTES * 8 / other.bit_size()),
    }
}

/// Frame-batched, node-major tensor.
///
/// Element `(frame, node)` lives at `storage[node_row(node) + frame]`, so the
/// frame is the fastest varying index and a whole batch of one node is a
/// contiguous row. Cloning is cheap: clones share the backing storage and a
/// write through any of them copies it first (copy-on-write), so a writer
/// always owns the full extent it writes.
///
/// A region of interest narrows the logical shape to a window of the backing
/// shape without moving storage; every logical accessor goes through it.
#[derive(Debug, Clone)]
pub struct FrameBuffer {
    data_type: DataType,
    frame_size: usize,
    row_len: usize,
    backing_shape: Vec<usize>,
    roi_offset: Vec<usize>,
    shape: Vec<usize>,
    has_roi: bool,
    storage: Arc<Storage>,
}

impl Default for FrameBuffer {
    fn default() -> Self {
        FrameBuffer::new(0, &[], DataType::Fp32)
    }
}

impl FrameBuffer {
    /// Allocates a zero-filled buffer.
    pub fn new(frame_size: usize, shape: &[usize], data_type: DataType) -> FrameBuffer {
        let row_len = row_len(data_type, frame_size);
        FrameBuffer {
            data_type,
            frame_size,
            row_len,
            backing_shape: shape.to_vec(),
            roi_offset: vec![0; shape.len()],
            shape: shape.to_vec(),
            has_roi: false,
            storage: Arc::new(Storage::alloc(data_type, row_len * shape_size(shape))),
        }
    }

    /// Reallocates storage, invalidating contents and dropping any ROI.
    pub fn resize(&mut self, data_type: DataType, frame_size: usize, shape: &[usize]) {
        *self = FrameBuffer::new(frame_size, shape, data_type);
    }

    /// Builds a buffer from flat samples, one frame per entry of `indices`.
    pub fn from_samples(
        samples: &[Vec<f32>],
        indices: &[usize],
        shape: &[usize],
        data_type: DataType,
    ) -> FrameBuffer {
        let node_size = shape_size(shape);
        let mut buf = FrameBuffer::new(indices.len(), shape, data_type);
        for (frame, &idx) in indices.iter().enumerate() {
            let sample = &samples[idx];
            assert_eq!(sample.len(), node_size, "sample {idx} does not match shape {shape:?}");
            for (node, &v) in sample.iter().enumerate() {
                buf.set_fp32(frame, node, v);
            }
        }
        buf
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Logical shape (the ROI extent when a ROI is set).
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn node_size(&self) -> usize {
        shape_size(&self.shape)
    }

    /// Bytes between consecutive node rows.
    pub fn frame_stride(&self) -> usize {
        match self.data_type {
            DataType::Bit => self.row_len * 8,
            other => self.row_len * other.bit_size() / 8,
        }
    }

    /// Storage units (words for `Bit`) between consecutive node rows.
    pub fn node_stride(&self) -> usize {
        self.row_len
    }

    pub fn has_roi(&self) -> bool {
        self.has_roi
    }

    /// Narrows the addressable shape to `extent` starting at `offset`,
    /// relative to the current logical shape.
    pub fn set_roi(&mut self, offset: &[usize], extent: &[usize]) {
        assert_eq!(offset.len(), self.shape.len(), "ROI offset rank mismatch");
        assert_eq!(extent.len(), self.shape.len(), "ROI extent rank mismatch");
        for d in 0..self.shape.len() {
            assert!(
                offset[d] + extent[d] <= self.shape[d],
                "ROI exceeds dimension {d}: {} + {} > {}",
                offset[d],
                extent[d],
                self.shape[d]
            );
            self.roi_offset[d] += offset[d];
        }
        self.shape = extent.to_vec();
        self.has_roi =
            self.shape != self.backing_shape || self.roi_offset.iter().any(|&o| o != 0);
    }

    /// Returns a view sharing this buffer's storage.
    pub fn roi(&self, offset: &[usize], extent: &[usize]) -> FrameBuffer {
        let mut view = self.clone();
        view.set_roi(offset, extent);
        view
    }

    pub fn clear_roi(&mut self) {
        self.shape = self.backing_shape.clone();
        self.roi_offset = vec![0; self.shape.len()];
        self.has_roi = false;
    }

    /// Reinterprets the node axis under a new shape of the same size.
    pub fn reshaped(&self, shape: &[usize]) -> FrameBuffer {
        assert!(!self.has_roi, "cannot reshape a ROI view");
        assert_eq!(shape_size(shape), self.node_size(), "reshape must keep the node count");
        let mut buf = self.clone();
        buf.backing_shape = shape.to_vec();
        buf.roi_offset = vec![0; shape.len()];
        buf.shape = shape.to_vec();
        buf
    }

    /// Maps a logical node index to its row in the backing storage.
    pub fn physical_node(&self, node: usize) -> usize {
        debug_assert!(node < self.node_size(), "node {node} out of range {}", self.node_size());
        if !self.has_roi {
            return node;
        }
        let mut rem = node;
        let mut phys = 0;
        let mut scale = 1;
        for d in 0..self.shape.len() {
            let idx = rem % self.shape[d];
            rem /= self.shape[d];
            phys += (idx + self.roi_offset[d]) * scale;
            scale *= self.backing_shape[d];
        }
        phys
    }

    #[inline]
    fn offset(&self, frame: usize, node: usize) -> usize {
        debug_assert!(frame < self.frame_size, "frame {frame} out of range {}", self.frame_size);
        self.physical_node(node) * self.row_len + frame
    }

    pub fn get_fp32(&self, frame: usize, node: usize) -> f32 {
        match &*self.storage {
            Storage::Fp32(v) => v[self.offset(frame, node)],
            Storage::Bit(_) => {
                if self.get_binary(frame, node) { 1.0 } else { 0.0 }
            }
            Storage::Uint8(v) => v[self.offset(frame, node)].to_fp32(),
            Storage::Fixed16(v) => Fixed16(v[self.offset(frame, node)]).to_f32(),
        }
    }

    pub fn set_fp32(&mut self, frame: usize, node: usize, value: f32) {
        if self.data_type == DataType::Bit {
            self.set_binary(frame, node, value > 0.5);
            return;
        }
        let index = self.offset(frame, node);
        match Arc::make_mut(&mut self.storage) {
            Storage::Fp32(v) => v[index] = value,
            Storage::Uint8(v) => v[index] = u8::from_fp32(value),
            Storage::Fixed16(v) => v[index] = Fixed16::from_f32(value).0,
            Storage::Bit(_) => unreachable!(),
        }
    }

    pub fn get_binary(&self, frame: usize, node: usize) -> bool {
        match &*self.storage {
            Storage::Bit(v) => {
                debug_assert!(frame < self.frame_size, "frame {frame} out of range");
                let word = v[self.physical_node(node) * self.row_len + frame / 64];
                (word >> (frame % 64)) & 1 != 0
            }
            _ => self.get_fp32(frame, node) > 0.5,
        }
    }

    pub fn set_binary(&mut self, frame: usize, node: usize, value: bool) {
        if self.data_type != DataType::Bit {
            self.set_fp32(frame, node, if value { 1.0 } else { 0.0 });
            return;
        }
        debug_assert!(frame < self.frame_size, "frame {frame} out of range");
        let index = self.physical_node(node) * self.row_len + frame / 64;
        let mask = 1u64 << (frame % 64);
        if let Storage::Bit(v) = Arc::make_mut(&mut self.storage) {
            if value {
                v[index] |= mask;
            } else {
                v[index] &= !mask;
            }
        }
    }

    /// Typed read; converts when `T` differs from the stored type.
    pub fn get<T: Element>(&self, frame: usize, node: usize) -> T {
        T::from_fp32(self.get_fp32(frame, node))
    }

    /// Typed write; converts when `T` differs from the stored type.
    pub fn set<T: Element>(&mut self, frame: usize, node: usize, value: T) {
        self.set_fp32(frame, node, value.to_fp32());
    }

    /// Read-only typed view. `T` must match the buffer's element type.
    pub fn lock_const<T: Element>(&self) -> FrameAccessor<'_, T> {
        assert_eq!(T::DATA_TYPE, self.data_type, "typed view does not match buffer type");
        FrameAccessor::new(self)
    }

    /// Read-write typed view. `T` must match the buffer's element type.
    pub fn lock<T: Element>(&mut self) -> FrameAccessorMut<'_, T> {
        assert_eq!(T::DATA_TYPE, self.data_type, "typed view does not match buffer type");
        FrameAccessorMut::new(self)
    }

    /// One node's batch as a contiguous slice of `frame_size` values.
    pub fn fp32_row(&self, node: usize) -> &[f32] {
        let start = self.physical_node(node) * self.row_len;
        match &*self.storage {
            Storage::Fp32(v) => &v[start..start + self.frame_size],
            _ => panic!("fp32_row on a {:?} buffer", self.data_type),
        }
    }

    /// One node's packed bits, including row padding words.
    pub fn bit_row(&self, node: usize) -> &[u64] {
        let start = self.physical_node(node) * self.row_len;
        match &*self.storage {
            Storage::Bit(v) => &v[start..start + self.row_len],
            _ => panic!("bit_row on a {:?} buffer", self.data_type),
        }
    }

    /// Whole float storage, rows `node_stride()` apart. ROI-free buffers only.
    pub fn fp32_storage_mut(&mut self) -> &mut [f32] {
        assert!(!self.has_roi, "whole-storage access on a ROI view");
        match Arc::make_mut(&mut self.storage) {
            Storage::Fp32(v) => v.as_mut_slice(),
            _ => panic!("fp32_storage_mut on a {:?} buffer", self.data_type),
        }
    }

    /// Whole bit storage, rows `node_stride()` words apart. ROI-free buffers only.
    pub fn bit_storage_mut(&mut self) -> &mut [u64] {
        assert!(!self.has_roi, "whole-storage access on a ROI view");
        match Arc::make_mut(&mut self.storage) {
            Storage::Bit(v) => v.as_mut_slice(),
            _ => panic!("bit_storage_mut on a {:?} buffer", self.data_type),
        }
    }

    /// Zeroes every logical element (only the ROI window of a view).
    pub fn fill_zero(&mut self) {
        let rows: Vec<usize> = (0..self.node_size()).map(|n| self.physical_node(n)).collect();
        let row_len = self.row_len;
        match Arc::make_mut(&mut self.storage) {
            Storage::Bit(v) => rows.iter().for_each(|&r| v[r * row_len..(r + 1) * row_len].fill(0)),
            Storage::Uint8(v) => rows.iter().for_each(|&r| v[r * row_len..(r + 1) * row_len].fill(0)),
            Storage::Fixed16(v) => rows.iter().for_each(|&r| v[r * row_len..(r + 1) * row_len].fill(0)),
            Storage::Fp32(v) => rows.iter().for_each(|&r| v[r * row_len..(r + 1) * row_len].fill(0.0)),
        }
    }

    /// Copy with another element type; a cheap clone when the type matches.
    pub fn convert(&self, data_type: DataType) -> FrameBuffer {
        if data_type == self.data_type {
            return self.clone();
        }
        let mut out = FrameBuffer::new(self.frame_size, &self.shape, data_type);
        for node in 0..self.node_size() {
            for frame in 0..self.frame_size {
                out.set_fp32(frame, node, self.get_fp32(frame, node));
            }
        }
        out
    }

    /// All node values of one frame.
    pub fn frame_values(&self, frame: usize) -> Vec<f32> {
        (0..self.node_size()).map(|node| self.get_fp32(frame, node)).collect()
    }
}
