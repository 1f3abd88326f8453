//! Positional kernel arguments.

use crate::buffer::Buffer;
use bytemuck::Pod;
use std::mem::size_of;

/// One positional argument for a kernel dispatch.
///
/// `B` is the platform's raw buffer handle. The runtime never inspects an
/// argument; the platform validates it when it is bound.
#[derive(Debug)]
pub enum KernelArg<'a, B> {
    /// A device buffer, bound by handle.
    Buffer(&'a B),
    /// A plain value, bound by bytes.
    Scalar {
        type_name: &'static str,
        bytes: Vec<u8>,
    },
    /// Work-group local memory of the given size in bytes.
    Local(usize),
}

impl<'a, B> KernelArg<'a, B> {
    pub fn scalar<T: Pod>(value: T) -> Self {
        KernelArg::Scalar {
            type_name: std::any::type_name::<T>(),
            bytes: bytemuck::bytes_of(&value).to_vec(),
        }
    }

    /// Local memory for `count` elements of `T`. An overflowing size
    /// saturates and is left for the platform to reject.
    pub fn local<T>(count: usize) -> Self {
        KernelArg::Local(count.saturating_mul(size_of::<T>()))
    }

    /// Size of the argument as the platform sees it.
    pub fn size(&self) -> usize {
        match self {
            KernelArg::Buffer(_) => size_of::<usize>(),
            KernelArg::Scalar { bytes, .. } => bytes.len(),
            KernelArg::Local(bytes) => *bytes,
        }
    }
}

impl<'a, T, B> From<&'a Buffer<T, B>> for KernelArg<'a, B> {
    fn from(buffer: &'a Buffer<T, B>) -> Self {
        KernelArg::Buffer(buffer.raw())
    }
}

impl<'a, T, B> From<&'a mut Buffer<T, B>> for KernelArg<'a, B> {
    fn from(buffer: &'a mut Buffer<T, B>) -> Self {
        KernelArg::Buffer(buffer.raw())
    }
}

macro_rules! impl_scalar_arg {
    ($($t:ty),* $(,)?) => {
        $(
            impl<'a, B> From<$t> for KernelArg<'a, B> {
                fn from(value: $t) -> Self {
                    KernelArg::scalar(value)
                }
            }
        )*
    };
}

impl_scalar_arg!(i8, u8, i16, u16, i32, u32, i64, u64, f32, f64);

/// Builds a `Vec<KernelArg>` from buffers and scalars, in binding order.
///
/// ```
/// use kiln::prelude::*;
///
/// let mut rt = Runtime::new(HostPlatform::new());
/// let buf = rt.allocate::<f32>(4).unwrap();
/// let args = kernel_args![&buf, 2.0f32, 4u32];
/// assert_eq!(args.len(), 3);
/// ```
#[macro_export]
macro_rules! kernel_args {
    () => {
        ::std::vec::Vec::new()
    };
    ($($arg:expr),+ $(,)?) => {
        ::std::vec![$($crate::kernel::KernelArg::from($arg)),+]
    };
}
