//! Geometry helpers for 2D layers whose shapes are `[width, height, channels]`.

use crate::model::Model;

/// 2D layers that slide a filter window over their input.
pub trait Filter2d: Model {
    fn filter_height(&self) -> usize;
    fn filter_width(&self) -> usize;
}

fn dims(shape: &[usize]) -> [usize; 3] {
    assert_eq!(shape.len(), 3, "2D geometry requires a [w, h, c] shape, got {shape:?}");
    [shape[0], shape[1], shape[2]]
}

pub fn input_width<M: Model + ?Sized>(model: &M) -> usize {
    dims(&model.input_shape())[0]
}

pub fn input_height<M: Model + ?Sized>(model: &M) -> usize {
    dims(&model.input_shape())[1]
}

pub fn input_channels<M: Model + ?Sized>(model: &M) -> usize {
    dims(&model.input_shape())[2]
}

pub fn output_width<M: Model + ?Sized>(model: &M) -> usize {
    dims(&model.output_shape())[0]
}

pub fn output_height<M: Model + ?Sized>(model: &M) -> usize {
    dims(&model.output_shape())[1]
}

pub fn output_channels<M: Model + ?Sized>(model: &M) -> usize {
    dims(&model.output_shape())[2]
}
