//! Typed device buffers.

use std::fmt;
use std::marker::PhantomData;
use std::mem::size_of;

/// Device memory holding `len` elements of `T`.
///
/// Wraps the platform's untyped handle `B`. Dropping the buffer releases
/// the device memory.
pub struct Buffer<T, B> {
    raw: B,
    len: usize,
    _marker: PhantomData<T>,
}

impl<T, B> Buffer<T, B> {
    pub(crate) fn new(raw: B, len: usize) -> Self {
        Self {
            raw,
            len,
            _marker: PhantomData,
        }
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Size in bytes.
    pub fn byte_len(&self) -> usize {
        self.len * size_of::<T>()
    }

    pub fn raw(&self) -> &B {
        &self.raw
    }

    pub fn raw_mut(&mut self) -> &mut B {
        &mut self.raw
    }

    pub fn into_raw(self) -> B {
        self.raw
    }
}

impl<T, B> fmt::Debug for Buffer<T, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("element", &std::any::type_name::<T>())
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_len() {
        let buf: Buffer<f64, ()> = Buffer::new((), 10);
        assert_eq!(buf.len(), 10);
        assert_eq!(buf.byte_len(), 80);
        assert!(!buf.is_empty());
    }
}
