use crate::buffer::FrameBuffer;

/// Evaluation metric accumulated over batches until `clear`.
pub trait MetricsFunction {
    fn clear(&mut self);

    fn get_metrics(&self) -> f64;

    fn calculate_metrics(&mut self, y: &FrameBuffer, t: &FrameBuffer);

    /// Short label for reports, e.g. `"accuracy"`.
    fn metrics_string(&self) -> &'static str;
}
