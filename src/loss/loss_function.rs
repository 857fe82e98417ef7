use crate::buffer::FrameBuffer;

/// Loss over frame-batched outputs.
///
/// `calculate_loss` adds the batch to a running total and returns the
/// gradient with respect to `y`; `get_loss` is the mean per frame since the
/// last `clear`.
pub trait LossFunction {
    fn clear(&mut self);

    fn get_loss(&self) -> f64;

    /// Loss of every frame, without touching the running total.
    fn frame_loss(&self, y: &FrameBuffer, t: &FrameBuffer) -> Vec<f32>;

    fn calculate_loss(&mut self, y: &FrameBuffer, t: &FrameBuffer) -> FrameBuffer;
}

pub(crate) fn assert_same_geometry(y: &FrameBuffer, t: &FrameBuffer) {
    assert_eq!(y.frame_size(), t.frame_size(), "output and target frame sizes differ");
    assert_eq!(y.node_size(), t.node_size(), "output and target node sizes differ");
}
