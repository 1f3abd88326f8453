//! The system OpenCL installation, through `opencl3`.
//!
//! Device-class bits are shared with `cl_device_type`, and native error codes
//! pass through unchanged as [`Status`] values.

use super::Platform;
use crate::device::{DeviceInfo, DeviceType};
use crate::grid::NdRange;
use crate::kernel::KernelArg;
use crate::status::{NativeResult, Status};
use opencl3::command_queue::{CommandQueue, CL_QUEUE_PROFILING_ENABLE};
use opencl3::context::Context;
use opencl3::device::Device;
use opencl3::error_codes::ClError;
use opencl3::event::Event;
use opencl3::kernel::Kernel;
use opencl3::memory::{Buffer, ClMem, CL_MEM_READ_WRITE};
use opencl3::platform::{get_platforms, Platform as ClPlatform};
use opencl3::program::Program;
use opencl3::types::{cl_device_id, cl_program, cl_uint, CL_BLOCKING, CL_NON_BLOCKING};
use std::ffi::{c_void, CString};
use std::fmt;
use std::ptr;

fn status(err: ClError) -> Status {
    Status(err.0)
}

/// Kernel handle that can be re-created from its program.
///
/// Holds a retained reference to the program so copies stay possible after
/// the caller drops the [`Program`].
pub struct OpenClKernel {
    kernel: Kernel,
    program: cl_program,
    name: CString,
}

impl OpenClKernel {
    fn from_program(program: cl_program, name: CString) -> NativeResult<Self> {
        let kernel = Kernel::new(cl3::kernel::create_kernel(program, &name).map_err(Status)?);
        // SAFETY: `program` is a valid program handle; the retain is balanced in `Drop`.
        // On failure `kernel` is dropped here, which releases it.
        unsafe { cl3::program::retain_program(program) }.map_err(Status)?;
        Ok(Self {
            kernel,
            program,
            name,
        })
    }

    pub fn name(&self) -> &str {
        self.name.to_str().unwrap_or_default()
    }

    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }
}

impl Drop for OpenClKernel {
    fn drop(&mut self) {
        // SAFETY: balances the retain taken in `from_program`.
        let _ = unsafe { cl3::program::release_program(self.program) };
    }
}

impl fmt::Debug for OpenClKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenClKernel").field("name", &self.name).finish()
    }
}

/// The ICD-loaded OpenCL runtime.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenClPlatform;

impl OpenClPlatform {
    pub fn new() -> Self {
        OpenClPlatform
    }
}

impl Platform for OpenClPlatform {
    type PlatformId = ClPlatform;
    type Device = cl_device_id;
    type Context = Context;
    type Queue = CommandQueue;
    type Program = Program;
    type Kernel = OpenClKernel;
    type Buffer = Buffer<u8>;
    type Event = Event;

    fn platforms(&self) -> NativeResult<Vec<ClPlatform>> {
        get_platforms().map_err(status)
    }

    fn devices(&self, platform: &ClPlatform, class: DeviceType) -> NativeResult<Vec<cl_device_id>> {
        platform.get_devices(class.bits()).map_err(status)
    }

    fn device_info(&self, device: &cl_device_id) -> NativeResult<DeviceInfo> {
        let device = Device::new(*device);
        let class = device.dev_type().map_err(status)?;
        Ok(DeviceInfo {
            name: device.name().map_err(status)?,
            vendor: device.vendor().map_err(status)?,
            class: DeviceType::from_bits_retain(class),
            available: device.available().map_err(status)?,
            compiler_available: device.compiler_available().map_err(status)?,
            max_work_group_size: device.max_work_group_size().map_err(status)?,
        })
    }

    fn create_context(&self, devices: &[cl_device_id]) -> NativeResult<Context> {
        Context::from_devices(devices, &[], None, ptr::null_mut()).map_err(status)
    }

    fn create_queue(&self, context: &Context, device: &cl_device_id) -> NativeResult<CommandQueue> {
        // SAFETY: `device` belongs to `context`.
        #[allow(deprecated, unused_unsafe)]
        let queue = unsafe { CommandQueue::create(context, *device, CL_QUEUE_PROFILING_ENABLE) };
        queue.map_err(status)
    }

    fn create_program(&self, context: &Context, source: &[u8]) -> NativeResult<Program> {
        if source.last() != Some(&0) {
            return Err(Status::INVALID_VALUE);
        }
        // The NUL stays in the slice, so the length handed to the driver counts it.
        let source = std::str::from_utf8(source).map_err(|_| Status::INVALID_VALUE)?;
        Program::create_from_source(context, source).map_err(status)
    }

    fn build_program(&self, program: &mut Program, devices: &[cl_device_id], options: Option<&str>) -> NativeResult<()> {
        program.build(devices, options.unwrap_or("")).map_err(status)
    }

    fn build_log(&self, program: &Program, device: &cl_device_id) -> NativeResult<String> {
        program.get_build_log(*device).map_err(status)
    }

    fn create_kernel(&self, program: &Program, name: &str) -> NativeResult<OpenClKernel> {
        let name = CString::new(name).map_err(|_| Status::INVALID_KERNEL_NAME)?;
        OpenClKernel::from_program(program.get(), name)
    }

    fn copy_kernel(&self, kernel: &OpenClKernel) -> NativeResult<OpenClKernel> {
        OpenClKernel::from_program(kernel.program, kernel.name.clone())
    }

    fn set_kernel_arg(&self, kernel: &mut OpenClKernel, index: cl_uint, arg: &KernelArg<'_, Buffer<u8>>) -> NativeResult<()> {
        // SAFETY: argument kinds and sizes are checked by the OpenCL runtime.
        let result = unsafe {
            match arg {
                KernelArg::Buffer(buffer) => kernel.kernel.set_arg(index, &buffer.get()),
                KernelArg::Scalar { bytes, .. } => cl3::kernel::set_kernel_arg(
                    kernel.kernel.get(),
                    index,
                    bytes.len(),
                    bytes.as_ptr() as *const c_void,
                )
                .map_err(ClError),
                KernelArg::Local(size) => kernel.kernel.set_arg_local_buffer(index, *size),
            }
        };
        result.map_err(status)
    }

    fn create_buffer(&self, context: &Context, size: usize) -> NativeResult<Buffer<u8>> {
        // SAFETY: no host pointer is supplied.
        unsafe { Buffer::<u8>::create(context, CL_MEM_READ_WRITE, size, ptr::null_mut()) }.map_err(status)
    }

    fn enqueue_kernel(
        &self,
        queue: &CommandQueue,
        kernel: &OpenClKernel,
        global: &NdRange,
        local: &NdRange,
    ) -> NativeResult<Event> {
        // SAFETY: `local` holds at least as many components as `global`, which
        // decides the work dimension.
        unsafe {
            queue.enqueue_nd_range_kernel(
                kernel.kernel.get(),
                global.dimensions() as cl_uint,
                ptr::null(),
                global.as_slice().as_ptr(),
                local.as_slice().as_ptr(),
                &[],
            )
        }
        .map_err(status)
    }

    fn enqueue_write(&self, queue: &CommandQueue, buffer: &mut Buffer<u8>, blocking: bool, data: &[u8]) -> NativeResult<Event> {
        let blocking = if blocking { CL_BLOCKING } else { CL_NON_BLOCKING };
        // SAFETY: `data` outlives the blocking copy.
        unsafe { queue.enqueue_write_buffer(buffer, blocking, 0, data, &[]) }.map_err(status)
    }

    fn enqueue_read(&self, queue: &CommandQueue, buffer: &Buffer<u8>, blocking: bool, data: &mut [u8]) -> NativeResult<Event> {
        let blocking = if blocking { CL_BLOCKING } else { CL_NON_BLOCKING };
        // SAFETY: `data` outlives the blocking copy.
        unsafe { queue.enqueue_read_buffer(buffer, blocking, 0, data, &[]) }.map_err(status)
    }

    fn profiling_times(&self, event: &Event) -> NativeResult<(u64, u64)> {
        let start = event.profiling_command_start().map_err(status)?;
        let end = event.profiling_command_end().map_err(status)?;
        Ok((start, end))
    }

    fn wait(&self, event: &Event) -> NativeResult<()> {
        event.wait().map_err(status)
    }
}
