//! The lazily initialized device runtime.
//!
//! A [`Runtime`] owns at most one device list, one context over that list
//! and one in-order command queue on the selected device. Each is created on
//! first use by whichever operation needs it, strictly in that order, and
//! kept until the runtime is dropped.

use crate::buffer::Buffer;
use crate::config::{Config, Parameter};
use crate::device::{select_device, DeviceInfo, DeviceList, DeviceType};
use crate::error::{Error, Resource, Result};
use crate::grid::{self, Partition};
use crate::kernel::KernelArg;
use crate::platform::{HostPlatform, Platform};
use crate::status::Status;
use crate::telemetry::{Metrics, MetricsSnapshot};
use bytemuck::Pod;
use std::fmt;
use std::io::Read;
use std::mem::size_of;
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info, trace, warn};

/// Resource cascade. A later state always carries everything before it.
enum Lifecycle<P: Platform> {
    Unset,
    Devices(DeviceList<P::Device>),
    Context {
        devices: DeviceList<P::Device>,
        context: P::Context,
    },
    Queue {
        devices: DeviceList<P::Device>,
        context: P::Context,
        queue: P::Queue,
    },
}

impl<P: Platform> Lifecycle<P> {
    fn devices(&self) -> Option<&DeviceList<P::Device>> {
        match self {
            Lifecycle::Unset => None,
            Lifecycle::Devices(devices)
            | Lifecycle::Context { devices, .. }
            | Lifecycle::Queue { devices, .. } => Some(devices),
        }
    }

    fn context(&self) -> Option<&P::Context> {
        match self {
            Lifecycle::Context { context, .. } | Lifecycle::Queue { context, .. } => Some(context),
            _ => None,
        }
    }

    fn queue(&self) -> Option<&P::Queue> {
        match self {
            Lifecycle::Queue { queue, .. } => Some(queue),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Lifecycle::Unset => "unset",
            Lifecycle::Devices(_) => "devices",
            Lifecycle::Context { .. } => "context",
            Lifecycle::Queue { .. } => "queue",
        }
    }
}

fn elapsed_ns(start: Instant) -> u64 {
    start.elapsed().as_nanos() as u64
}

/// Compiles and dispatches kernels on one device of a [`Platform`].
///
/// Not `Clone`: the runtime is the sole owner of its native resources, which
/// are released when it is dropped.
pub struct Runtime<P: Platform = HostPlatform> {
    // Field order is release order: event, then queue/context/devices.
    last_event: Option<P::Event>,
    state: Lifecycle<P>,
    config: Config,
    metrics: Metrics,
    platform: P,
}

impl<P: Platform> Runtime<P> {
    pub fn new(platform: P) -> Self {
        Self {
            last_event: None,
            state: Lifecycle::Unset,
            config: Config::default(),
            metrics: Metrics::new(),
            platform,
        }
    }

    pub fn with_config(platform: P, config: Config) -> Result<Self> {
        config.validate()?;

        let mut runtime = Self::new(platform);
        runtime.config = config;
        Ok(runtime)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Whether `resource` has been created.
    pub fn is_initialized(&self, resource: Resource) -> bool {
        match resource {
            Resource::DeviceList => self.state.devices().is_some(),
            Resource::Context => self.state.context().is_some(),
            Resource::Queue => self.state.queue().is_some(),
        }
    }

    /// The device list, once selection has run.
    pub fn device_list(&self) -> Option<&DeviceList<P::Device>> {
        self.state.devices()
    }

    pub fn set_parameter(&mut self, parameter: Parameter) -> Result<()> {
        match parameter {
            Parameter::TargetDevice(target) => {
                if self.state.devices().is_some() {
                    return Err(Error::rejected(format!(
                        "target device cannot change to {} after a device was selected",
                        target
                    )));
                }
                if DeviceType::from_bits(target.bits()).is_none() {
                    return Err(Error::rejected(format!(
                        "{:#x} is not a device class mask",
                        target.bits()
                    )));
                }
                debug!(%target, "target device set");
                self.config.target_device = target;
            }
            Parameter::BuildOptions(options) => {
                debug!(%options, "build options set");
                self.config.build_options = options;
            }
        }
        Ok(())
    }

    /// Selects a device if none has been selected yet.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn ensure_devices(&mut self) -> Result<()> {
        if matches!(self.state, Lifecycle::Unset) {
            let devices = select_device(&self.platform, self.config.target_device)?;
            self.state = Lifecycle::Devices(devices);
        }
        Ok(())
    }

    /// Creates the context over the whole device list if it does not exist.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn ensure_context(&mut self) -> Result<()> {
        self.ensure_devices()?;

        let (next, result) = match std::mem::replace(&mut self.state, Lifecycle::Unset) {
            Lifecycle::Devices(devices) => match self.platform.create_context(devices.devices()) {
                Ok(context) => {
                    info!(devices = devices.len(), "context created");
                    (Lifecycle::Context { devices, context }, Ok(()))
                }
                Err(status) => {
                    warn!(%status, "context creation failed");
                    (Lifecycle::Devices(devices), Err(Error::context(status)))
                }
            },
            other => (other, Ok(())),
        };
        self.state = next;
        result
    }

    /// Creates the profiling command queue on the selected device if it does
    /// not exist.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn ensure_queue(&mut self) -> Result<()> {
        self.ensure_context()?;

        let (next, result) = match std::mem::replace(&mut self.state, Lifecycle::Unset) {
            Lifecycle::Context { devices, context } => {
                match self.platform.create_queue(&context, devices.selected()) {
                    Ok(queue) => {
                        info!(device = %devices.selected_info().name, "command queue created");
                        (Lifecycle::Queue { devices, context, queue }, Ok(()))
                    }
                    Err(status) => {
                        warn!(%status, "command queue creation failed");
                        (Lifecycle::Context { devices, context }, Err(Error::queue(status)))
                    }
                }
            }
            other => (other, Ok(())),
        };
        self.state = next;
        result
    }

    /// The device queues are bound to, selecting one if needed.
    pub fn used_device(&mut self) -> Result<DeviceInfo> {
        self.ensure_devices()?;
        self.state
            .devices()
            .map(|devices| devices.selected_info().clone())
            .ok_or(Error::Uninitialized(Resource::DeviceList))
    }

    pub fn build_program(&mut self, source: &str) -> Result<P::Program> {
        self.build_program_bytes(source.as_bytes())
    }

    /// Compiles `source` for every device in the device list with the
    /// current build options.
    pub fn build_program_bytes(&mut self, source: &[u8]) -> Result<P::Program> {
        self.ensure_context()?;
        let start = Instant::now();

        let devices = self
            .state
            .devices()
            .ok_or(Error::Uninitialized(Resource::DeviceList))?;
        let context = self
            .state
            .context()
            .ok_or(Error::Uninitialized(Resource::Context))?;

        let mut terminated = Vec::with_capacity(source.len() + 1);
        terminated.extend_from_slice(source);
        terminated.push(0);

        let mut program = self
            .platform
            .create_program(context, &terminated)
            .map_err(Error::BuildFailure)?;

        match self
            .platform
            .build_program(&mut program, devices.devices(), self.config.build_options())
        {
            Ok(()) => {
                debug!(bytes = source.len(), "program built");
                self.metrics.record_build(elapsed_ns(start), true);
                Ok(program)
            }
            Err(status) => {
                let log = self
                    .platform
                    .build_log(&program, devices.selected())
                    .unwrap_or_default();
                warn!(%status, "program build failed");
                debug!(%log, "build log");
                self.metrics.record_build(elapsed_ns(start), false);
                Err(Error::BuildFailure(status))
            }
        }
    }

    pub fn build_program_from_reader<R: Read>(&mut self, mut reader: R) -> Result<P::Program> {
        let mut source = Vec::new();
        reader.read_to_end(&mut source)?;
        self.build_program_bytes(&source)
    }

    /// Builds the file's contents. An unreadable file is built as empty
    /// source, so it fails at compilation.
    pub fn build_program_from_file<Q: AsRef<Path>>(&mut self, path: Q) -> Result<P::Program> {
        let path = path.as_ref();
        let source = match std::fs::read(path) {
            Ok(source) => source,
            Err(error) => {
                warn!(path = %path.display(), %error, "kernel file unreadable");
                Vec::new()
            }
        };
        self.build_program_bytes(&source)
    }

    /// Build log of `program` for the selected device.
    pub fn build_log(&self, program: &P::Program) -> Result<String> {
        let devices = self
            .state
            .devices()
            .ok_or(Error::Uninitialized(Resource::DeviceList))?;
        self.platform
            .build_log(program, devices.selected())
            .map_err(Error::BuildFailure)
    }

    pub fn kernel_from_program(&self, program: &P::Program, name: &str) -> Result<P::Kernel> {
        self.platform
            .create_kernel(program, name)
            .map_err(Error::BindingFailure)
    }

    pub fn kernel_from_source(&mut self, source: &str, name: &str) -> Result<P::Kernel> {
        let program = self.build_program(source)?;
        self.kernel_from_program(&program, name)
    }

    pub fn kernel_from_bytes(&mut self, source: &[u8], name: &str) -> Result<P::Kernel> {
        let program = self.build_program_bytes(source)?;
        self.kernel_from_program(&program, name)
    }

    pub fn kernel_from_reader<R: Read>(&mut self, reader: R, name: &str) -> Result<P::Kernel> {
        let program = self.build_program_from_reader(reader)?;
        self.kernel_from_program(&program, name)
    }

    pub fn kernel_from_file<Q: AsRef<Path>>(&mut self, path: Q, name: &str) -> Result<P::Kernel> {
        let program = self.build_program_from_file(path)?;
        self.kernel_from_program(&program, name)
    }

    /// Work partition used for a dispatch of `size` work-items.
    pub fn partition(&self, size: usize) -> Partition {
        grid::partition_with_ceiling(size, self.config.max_work_group_size)
    }

    /// Binds `args` to a private copy of `kernel` in order and enqueues it
    /// over `size` work-items. Returns without waiting for completion.
    pub fn execute(&mut self, kernel: &P::Kernel, size: usize, args: &[KernelArg<'_, P::Buffer>]) -> Result<()> {
        self.ensure_queue()?;
        let start = Instant::now();

        let queue = self.state.queue().ok_or(Error::Uninitialized(Resource::Queue))?;
        let mut local = self
            .platform
            .copy_kernel(kernel)
            .map_err(Error::BindingFailure)?;

        for (index, arg) in args.iter().enumerate() {
            let index = u32::try_from(index).map_err(|_| Error::BindingFailure(Status::INVALID_ARG_INDEX))?;
            self.platform
                .set_kernel_arg(&mut local, index, arg)
                .map_err(Error::BindingFailure)?;
        }

        let partition = grid::partition_with_ceiling(size, self.config.max_work_group_size);
        match self
            .platform
            .enqueue_kernel(queue, &local, &partition.global, &partition.local)
        {
            Ok(event) => {
                trace!(size, local = %partition.local, global = %partition.global, "kernel enqueued");
                self.last_event = Some(event);
                self.metrics.record_dispatch(elapsed_ns(start));
                Ok(())
            }
            Err(status) => {
                warn!(size, %status, "kernel enqueue failed");
                self.metrics.record_enqueue_failure();
                Err(Error::EnqueueFailure(status))
            }
        }
    }

    pub fn execute_from_program(
        &mut self,
        program: &P::Program,
        name: &str,
        size: usize,
        args: &[KernelArg<'_, P::Buffer>],
    ) -> Result<()> {
        let kernel = self.kernel_from_program(program, name)?;
        self.execute(&kernel, size, args)
    }

    pub fn execute_from_source(
        &mut self,
        source: &str,
        name: &str,
        size: usize,
        args: &[KernelArg<'_, P::Buffer>],
    ) -> Result<()> {
        let kernel = self.kernel_from_source(source, name)?;
        self.execute(&kernel, size, args)
    }

    pub fn execute_from_bytes(
        &mut self,
        source: &[u8],
        name: &str,
        size: usize,
        args: &[KernelArg<'_, P::Buffer>],
    ) -> Result<()> {
        let kernel = self.kernel_from_bytes(source, name)?;
        self.execute(&kernel, size, args)
    }

    pub fn execute_from_reader<R: Read>(
        &mut self,
        reader: R,
        name: &str,
        size: usize,
        args: &[KernelArg<'_, P::Buffer>],
    ) -> Result<()> {
        let kernel = self.kernel_from_reader(reader, name)?;
        self.execute(&kernel, size, args)
    }

    pub fn execute_from_file<Q: AsRef<Path>>(
        &mut self,
        path: Q,
        name: &str,
        size: usize,
        args: &[KernelArg<'_, P::Buffer>],
    ) -> Result<()> {
        let kernel = self.kernel_from_file(path, name)?;
        self.execute(&kernel, size, args)
    }

    /// Allocates read/write device memory for `count` elements of `T`.
    pub fn allocate<T: Pod>(&mut self, count: usize) -> Result<Buffer<T, P::Buffer>> {
        self.ensure_context()?;

        let context = self
            .state
            .context()
            .ok_or(Error::Uninitialized(Resource::Context))?;
        let bytes = count
            .checked_mul(size_of::<T>())
            .ok_or(Error::Allocation(Status::INVALID_BUFFER_SIZE))?;
        let raw = self
            .platform
            .create_buffer(context, bytes)
            .map_err(Error::Allocation)?;

        trace!(count, bytes, "buffer allocated");
        Ok(Buffer::new(raw, count))
    }

    /// Copies `data` to the start of `buffer`, blocking until done.
    pub fn write_buffer<T: Pod>(&mut self, buffer: &mut Buffer<T, P::Buffer>, data: &[T]) -> Result<()> {
        self.ensure_queue()?;
        let start = Instant::now();

        let queue = self.state.queue().ok_or(Error::Uninitialized(Resource::Queue))?;
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let event = self
            .platform
            .enqueue_write(queue, buffer.raw_mut(), true, bytes)
            .map_err(|status| {
                self.metrics.record_enqueue_failure();
                Error::EnqueueFailure(status)
            })?;

        trace!(bytes = bytes.len(), "buffer written");
        self.last_event = Some(event);
        self.metrics.record_write(bytes.len(), elapsed_ns(start));
        Ok(())
    }

    /// Fills `out` from the start of `buffer`, blocking until done.
    pub fn read_buffer<T: Pod>(&mut self, buffer: &Buffer<T, P::Buffer>, out: &mut [T]) -> Result<()> {
        self.ensure_queue()?;
        let start = Instant::now();

        let queue = self.state.queue().ok_or(Error::Uninitialized(Resource::Queue))?;
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(out);
        let len = bytes.len();
        let event = self
            .platform
            .enqueue_read(queue, buffer.raw(), true, bytes)
            .map_err(|status| {
                self.metrics.record_enqueue_failure();
                Error::EnqueueFailure(status)
            })?;

        trace!(bytes = len, "buffer read");
        self.last_event = Some(event);
        self.metrics.record_read(len, elapsed_ns(start));
        Ok(())
    }

    /// Device time between start and end of the most recent command.
    pub fn last_elapsed_ns(&self) -> Result<u64> {
        let event = self
            .last_event
            .as_ref()
            .ok_or(Error::Profiling(Status::INVALID_EVENT))?;
        let (start, end) = self
            .platform
            .profiling_times(event)
            .map_err(Error::Profiling)?;
        Ok(end.saturating_sub(start))
    }

    /// Blocks until the most recent command has completed. Returns at once
    /// when nothing has been enqueued.
    pub fn wait_for_last_event(&self) -> Result<()> {
        match &self.last_event {
            Some(event) => self.platform.wait(event).map_err(Error::EnqueueFailure),
            None => Ok(()),
        }
    }
}

impl<P: Platform> fmt::Debug for Runtime<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("state", &self.state.name())
            .field("config", &self.config)
            .field("has_event", &self.last_event.is_some())
            .finish()
    }
}
