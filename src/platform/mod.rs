//! The native compute layer beneath the runtime.
//!
//! [`Platform`] is the seam between the lazy resource cascade in
//! [`Runtime`](crate::runtime::Runtime) and whatever actually owns devices,
//! contexts, queues and memory. Every method reports failures as a raw
//! [`Status`] and the runtime decides which error kind it maps to.
//!
//! Two implementations ship with the crate:
//!
//! - [`host::HostPlatform`]: an in-process simulated platform, always built
//! - `opencl::OpenClPlatform`: the system OpenCL ICD (feature `opencl`)

pub mod host;

#[cfg(feature = "opencl")]
pub mod opencl;

pub use host::{HostDevice, HostInvocation, HostPlatform, HostPlatformBuilder, HostStats};

#[cfg(feature = "opencl")]
pub use opencl::OpenClPlatform;

use crate::device::{DeviceInfo, DeviceType};
use crate::grid::NdRange;
use crate::kernel::KernelArg;
use crate::status::NativeResult;

/// Abstract contract for a compute platform.
///
/// Handles are owned values; dropping one releases the native object.
/// `Kernel` handles must stay usable after the `Program` they came from has
/// been dropped, since programs are caller-held and short-lived.
pub trait Platform {
    /// One enumerated platform (driver / vendor runtime).
    type PlatformId;
    /// One compute device.
    type Device: Clone;
    type Context;
    type Queue;
    type Program;
    type Kernel;
    /// Untyped device memory.
    type Buffer;
    /// Completion/profiling handle of one enqueued command.
    type Event;

    /// Enumerates platforms in driver order.
    fn platforms(&self) -> NativeResult<Vec<Self::PlatformId>>;

    /// Devices of exactly one class on one platform, in enumeration order.
    fn devices(&self, platform: &Self::PlatformId, class: DeviceType) -> NativeResult<Vec<Self::Device>>;

    fn device_info(&self, device: &Self::Device) -> NativeResult<DeviceInfo>;

    /// Creates a context spanning all of `devices`, without a notification callback.
    fn create_context(&self, devices: &[Self::Device]) -> NativeResult<Self::Context>;

    /// Creates an in-order queue on `device` with profiling enabled.
    fn create_queue(&self, context: &Self::Context, device: &Self::Device) -> NativeResult<Self::Queue>;

    /// Creates a program object from source. `source` includes the trailing
    /// NUL terminator.
    fn create_program(&self, context: &Self::Context, source: &[u8]) -> NativeResult<Self::Program>;

    /// Compiles and links `program` for every device in `devices`.
    fn build_program(
        &self,
        program: &mut Self::Program,
        devices: &[Self::Device],
        options: Option<&str>,
    ) -> NativeResult<()>;

    fn build_log(&self, program: &Self::Program, device: &Self::Device) -> NativeResult<String>;

    fn create_kernel(&self, program: &Self::Program, name: &str) -> NativeResult<Self::Kernel>;

    /// Produces an independent handle whose argument bindings can change
    /// without affecting `kernel`.
    fn copy_kernel(&self, kernel: &Self::Kernel) -> NativeResult<Self::Kernel>;

    fn set_kernel_arg(
        &self,
        kernel: &mut Self::Kernel,
        index: u32,
        arg: &KernelArg<'_, Self::Buffer>,
    ) -> NativeResult<()>;

    /// Allocates `size` bytes of read/write device memory.
    fn create_buffer(&self, context: &Self::Context, size: usize) -> NativeResult<Self::Buffer>;

    /// Enqueues `kernel` over `global`, batching work-items by `local`.
    /// Returns immediately.
    fn enqueue_kernel(
        &self,
        queue: &Self::Queue,
        kernel: &Self::Kernel,
        global: &NdRange,
        local: &NdRange,
    ) -> NativeResult<Self::Event>;

    fn enqueue_write(
        &self,
        queue: &Self::Queue,
        buffer: &mut Self::Buffer,
        blocking: bool,
        data: &[u8],
    ) -> NativeResult<Self::Event>;

    fn enqueue_read(
        &self,
        queue: &Self::Queue,
        buffer: &Self::Buffer,
        blocking: bool,
        data: &mut [u8],
    ) -> NativeResult<Self::Event>;

    /// `(start, end)` device timestamps in nanoseconds.
    fn profiling_times(&self, event: &Self::Event) -> NativeResult<(u64, u64)>;

    /// Blocks until `event` has completed.
    fn wait(&self, event: &Self::Event) -> NativeResult<()>;
}
