use std::marker::PhantomData;

use super::data_type::Element;
use super::frame_buffer::FrameBuffer;

/// Scoped read-only typed view over a [`FrameBuffer`].
pub struct FrameAccessor<'a, T: Element> {
    buf: &'a FrameBuffer,
    _element: PhantomData<T>,
}

impl<'a, T: Element> FrameAccessor<'a, T> {
    pub(super) fn new(buf: &'a FrameBuffer) -> Self {
        FrameAccessor { buf, _element: PhantomData }
    }

    #[inline]
    pub fn get(&self, frame: usize, node: usize) -> T {
        self.buf.get::<T>(frame, node)
    }

    pub fn frame_size(&self) -> usize {
        self.buf.frame_size()
    }

    pub fn node_size(&self) -> usize {
        self.buf.node_size()
    }
}

/// Scoped read-write typed view over a [`FrameBuffer`].
///
/// Writers to overlapping regions are not synchronized; the exclusive borrow
/// is the only guard.
pub struct FrameAccessorMut<'a, T: Element> {
    buf: &'a mut FrameBuffer,
    _element: PhantomData<T>,
}

impl<'a, T: Element> FrameAccessorMut<'a, T> {
    pub(super) fn new(buf: &'a mut FrameBuffer) -> Self {
        FrameAccessorMut { buf, _element: PhantomData }
    }

    #[inline]
    pub fn get(&self, frame: usize, node: usize) -> T {
        self.buf.get::<T>(frame, node)
    }

    #[inline]
    pub fn set(&mut self, frame: usize, node: usize, value: T) {
        self.buf.set::<T>(frame, node, value)
    }

    pub fn frame_size(&self) -> usize {
        self.buf.frame_size()
    }

    pub fn node_size(&self) -> usize {
        self.buf.node_size()
    }
}

#[cfg(test)]
mod tests {
    use crate::buffer::{DataType, FrameBuffer};

    #[test]
    fn test_typed_views() {
        let mut buf = FrameBuffer::new(4, &[2], DataType::Fp32);
        {
            let mut acc = buf.lock::<f32>();
            acc.set(3, 1, 2.5);
            assert_eq!(acc.get(3, 1), 2.5);
        }
        let acc = buf.lock_const::<f32>();
        assert_eq!(acc.frame_size(), 4);
        assert_eq!(acc.get(3, 1), 2.5);
    }

    #[test]
    #[should_panic(expected = "typed view does not match buffer type")]
    fn test_view_type_must_match() {
        let buf = FrameBuffer::new(1, &[1], DataType::Bit);
        let _ = buf.lock_const::<f32>();
    }
}
