//! Row-parallel loops over freshly allocated (ROI-free) buffers.

use rayon::prelude::*;

use crate::buffer::FrameBuffer;

/// Runs `f(node, row)` over every float node row in parallel. `row` is
/// trimmed to `frame_size` values.
pub(crate) fn for_each_fp32_row<F>(buf: &mut FrameBuffer, f: F)
where
    F: Fn(usize, &mut [f32]) + Sync + Send,
{
    let frame_size = buf.frame_size();
    let stride = buf.node_stride();
    if stride == 0 {
        return;
    }
    buf.fp32_storage_mut()
        .par_chunks_mut(stride)
        .enumerate()
        .for_each(|(node, row)| f(node, &mut row[..frame_size]));
}

/// Runs `f(node, words)` over every packed bit row in parallel. `words`
/// includes the padding words of the row.
pub(crate) fn for_each_bit_row<F>(buf: &mut FrameBuffer, f: F)
where
    F: Fn(usize, &mut [u64]) + Sync + Send,
{
    let stride = buf.node_stride();
    if stride == 0 {
        return;
    }
    buf.bit_storage_mut()
        .par_chunks_mut(stride)
        .enumerate()
        .for_each(|(node, row)| f(node, row));
}

#[inline]
pub(crate) fn get_bit(words: &[u64], frame: usize) -> bool {
    (words[frame / 64] >> (frame % 64)) & 1 != 0
}

#[inline]
pub(crate) fn set_bit(words: &mut [u64], frame: usize) {
    words[frame / 64] |= 1 << (frame % 64);
}
