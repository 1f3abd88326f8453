//! In-process simulated platform.
//!
//! `HostPlatform` models an OpenCL installation entirely in host memory:
//! a configurable set of platforms and devices, a signature-level compiler
//! for OpenCL C (kernel names and parameter kinds are parsed, bodies are
//! not executed), byte buffers, and profiling timestamps taken from a
//! monotonic clock.
//!
//! Kernels do nothing when dispatched unless a host body has been registered
//! under the kernel's name with [`HostPlatformBuilder::kernel`]. The body sees
//! the bound arguments through a [`HostInvocation`] and may rewrite buffers.
//!
//! Native objects are reference counted the way OpenCL counts them, and the
//! platform keeps live-object counters so leaks are observable through
//! [`HostPlatform::stats`].

use super::Platform;
use crate::device::{DeviceInfo, DeviceType};
use crate::grid::NdRange;
use crate::kernel::KernelArg;
use crate::status::{NativeResult, Status};
use bytemuck::Pod;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::mem::size_of;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

const DEFAULT_MAX_WORK_GROUP_SIZE: usize = 1024;
const DEFAULT_MAX_ALLOC: usize = 1 << 30;
/// Work-group local memory of every simulated device, in bytes.
const LOCAL_MEM_SIZE: usize = 64 * 1024;

/// Host body run when a kernel of the same name is dispatched.
pub type HostKernelFn = Arc<dyn Fn(&mut HostInvocation) -> NativeResult<()> + Send + Sync>;

/// Description of one simulated device.
#[derive(Debug, Clone)]
pub struct HostDevice {
    name: String,
    vendor: String,
    class: DeviceType,
    available: bool,
    compiler_available: bool,
    max_work_group_size: usize,
}

impl HostDevice {
    pub fn new(name: impl Into<String>, class: DeviceType) -> Self {
        Self {
            name: name.into(),
            vendor: "kiln".to_string(),
            class,
            available: true,
            compiler_available: true,
            max_work_group_size: DEFAULT_MAX_WORK_GROUP_SIZE,
        }
    }

    pub fn cpu(name: impl Into<String>) -> Self {
        Self::new(name, DeviceType::CPU)
    }

    pub fn gpu(name: impl Into<String>) -> Self {
        Self::new(name, DeviceType::GPU)
    }

    pub fn accelerator(name: impl Into<String>) -> Self {
        Self::new(name, DeviceType::ACCELERATOR)
    }

    pub fn vendor(mut self, vendor: impl Into<String>) -> Self {
        self.vendor = vendor.into();
        self
    }

    pub fn available(mut self, available: bool) -> Self {
        self.available = available;
        self
    }

    pub fn compiler_available(mut self, available: bool) -> Self {
        self.compiler_available = available;
        self
    }

    pub fn max_work_group_size(mut self, size: usize) -> Self {
        self.max_work_group_size = size;
        self
    }

    fn info(&self) -> DeviceInfo {
        DeviceInfo {
            name: self.name.clone(),
            vendor: self.vendor.clone(),
            class: self.class,
            available: self.available,
            compiler_available: self.compiler_available,
            max_work_group_size: self.max_work_group_size,
        }
    }
}

/// Handle of a simulated device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostDeviceId {
    platform: usize,
    index: usize,
}

/// Point-in-time copy of the platform's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostStats {
    pub contexts_created: u64,
    pub queues_created: u64,
    pub programs_built: u64,
    pub build_failures: u64,
    pub kernels_launched: u64,
    pub bytes_written: u64,
    pub bytes_read: u64,
    pub live_contexts: usize,
    pub live_queues: usize,
    pub live_buffers: usize,
}

#[derive(Debug, Default)]
struct Counters {
    contexts_created: AtomicU64,
    queues_created: AtomicU64,
    programs_built: AtomicU64,
    build_failures: AtomicU64,
    kernels_launched: AtomicU64,
    bytes_written: AtomicU64,
    bytes_read: AtomicU64,
    live_contexts: Arc<AtomicUsize>,
    live_queues: Arc<AtomicUsize>,
    live_buffers: Arc<AtomicUsize>,
}

/// Decrements a live-object counter when the owning handle is released.
#[derive(Debug)]
struct LiveGuard(Arc<AtomicUsize>);

impl LiveGuard {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        LiveGuard(Arc::clone(counter))
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Fails the next `remaining` calls with `status`.
#[derive(Debug)]
struct FailurePlan(Mutex<(usize, Status)>);

impl FailurePlan {
    fn new(remaining: usize, status: Status) -> Self {
        FailurePlan(Mutex::new((remaining, status)))
    }

    fn check(&self) -> NativeResult<()> {
        let mut plan = self.0.lock();
        if plan.0 > 0 {
            plan.0 -= 1;
            Err(plan.1)
        } else {
            Ok(())
        }
    }
}

struct Inner {
    platforms: Vec<(String, Vec<HostDevice>)>,
    kernels: HashMap<String, HostKernelFn>,
    context_failures: FailurePlan,
    queue_failures: FailurePlan,
    max_alloc: usize,
    counters: Counters,
    next_id: AtomicU64,
    epoch: Instant,
}

/// The simulated platform. Cloning shares the same installation.
#[derive(Clone)]
pub struct HostPlatform {
    inner: Arc<Inner>,
}

impl HostPlatform {
    /// One platform with a single usable CPU device.
    pub fn new() -> Self {
        Self::builder()
            .platform("kiln host", vec![HostDevice::cpu("host cpu")])
            .build()
    }

    pub fn builder() -> HostPlatformBuilder {
        HostPlatformBuilder::default()
    }

    pub fn stats(&self) -> HostStats {
        let c = &self.inner.counters;
        HostStats {
            contexts_created: c.contexts_created.load(Ordering::Relaxed),
            queues_created: c.queues_created.load(Ordering::Relaxed),
            programs_built: c.programs_built.load(Ordering::Relaxed),
            build_failures: c.build_failures.load(Ordering::Relaxed),
            kernels_launched: c.kernels_launched.load(Ordering::Relaxed),
            bytes_written: c.bytes_written.load(Ordering::Relaxed),
            bytes_read: c.bytes_read.load(Ordering::Relaxed),
            live_contexts: c.live_contexts.load(Ordering::Relaxed),
            live_queues: c.live_queues.load(Ordering::Relaxed),
            live_buffers: c.live_buffers.load(Ordering::Relaxed),
        }
    }

    fn device(&self, id: HostDeviceId) -> NativeResult<&HostDevice> {
        self.inner
            .platforms
            .get(id.platform)
            .and_then(|(_, devices)| devices.get(id.index))
            .ok_or(Status::INVALID_DEVICE)
    }

    fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn now_ns(&self) -> u64 {
        self.inner.epoch.elapsed().as_nanos() as u64
    }

    fn event(&self, start_ns: u64) -> HostEvent {
        HostEvent {
            start_ns,
            end_ns: self.now_ns(),
        }
    }
}

impl Default for HostPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HostPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.inner.platforms.iter().map(|(name, _)| name.as_str()).collect();
        let mut kernels: Vec<&str> = self.inner.kernels.keys().map(String::as_str).collect();
        kernels.sort_unstable();
        f.debug_struct("HostPlatform")
            .field("platforms", &names)
            .field("kernels", &kernels)
            .finish()
    }
}

/// Builder for [`HostPlatform`].
pub struct HostPlatformBuilder {
    platforms: Vec<(String, Vec<HostDevice>)>,
    kernels: HashMap<String, HostKernelFn>,
    context_failures: (usize, Status),
    queue_failures: (usize, Status),
    max_alloc: usize,
}

impl Default for HostPlatformBuilder {
    fn default() -> Self {
        Self {
            platforms: Vec::new(),
            kernels: HashMap::new(),
            context_failures: (0, Status::SUCCESS),
            queue_failures: (0, Status::SUCCESS),
            max_alloc: DEFAULT_MAX_ALLOC,
        }
    }
}

impl HostPlatformBuilder {
    /// Adds a platform; enumeration order follows insertion order.
    pub fn platform(mut self, name: impl Into<String>, devices: Vec<HostDevice>) -> Self {
        self.platforms.push((name.into(), devices));
        self
    }

    /// Registers a host body for kernels named `name`.
    pub fn kernel<F>(mut self, name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&mut HostInvocation) -> NativeResult<()> + Send + Sync + 'static,
    {
        self.kernels.insert(name.into(), Arc::new(body));
        self
    }

    /// Makes the next `count` context creations fail with `status`.
    pub fn context_failures(mut self, count: usize, status: Status) -> Self {
        self.context_failures = (count, status);
        self
    }

    /// Makes the next `count` queue creations fail with `status`.
    pub fn queue_failures(mut self, count: usize, status: Status) -> Self {
        self.queue_failures = (count, status);
        self
    }

    /// Largest single allocation, in bytes.
    pub fn max_alloc(mut self, bytes: usize) -> Self {
        self.max_alloc = bytes;
        self
    }

    pub fn build(self) -> HostPlatform {
        HostPlatform {
            inner: Arc::new(Inner {
                platforms: self.platforms,
                kernels: self.kernels,
                context_failures: FailurePlan::new(self.context_failures.0, self.context_failures.1),
                queue_failures: FailurePlan::new(self.queue_failures.0, self.queue_failures.1),
                max_alloc: self.max_alloc,
                counters: Counters::default(),
                next_id: AtomicU64::new(1),
                epoch: Instant::now(),
            }),
        }
    }
}

impl fmt::Debug for HostPlatformBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostPlatformBuilder")
            .field("platforms", &self.platforms.len())
            .field("kernels", &self.kernels.len())
            .finish()
    }
}

#[derive(Debug)]
pub struct HostContext {
    id: u64,
    devices: Vec<HostDeviceId>,
    _live: LiveGuard,
}

impl HostContext {
    pub fn devices(&self) -> &[HostDeviceId] {
        &self.devices
    }
}

#[derive(Debug)]
pub struct HostQueue {
    context: u64,
    device: HostDeviceId,
    _live: LiveGuard,
}

impl HostQueue {
    pub fn device(&self) -> HostDeviceId {
        self.device
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ParamKind {
    /// `__global` / `__constant` pointer.
    Global,
    /// `__local` pointer.
    Local,
    /// By-value argument; the size is known for built-in types.
    Scalar(Option<usize>),
}

#[derive(Debug, Clone)]
struct KernelSignature {
    name: String,
    params: Vec<ParamKind>,
}

#[derive(Debug)]
pub struct HostProgram {
    context: u64,
    context_devices: Vec<HostDeviceId>,
    source: String,
    options: Option<String>,
    kernels: Vec<KernelSignature>,
    log: String,
    built: bool,
}

impl HostProgram {
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Options used by the most recent build.
    pub fn build_options(&self) -> Option<&str> {
        self.options.as_deref()
    }

    pub fn is_built(&self) -> bool {
        self.built
    }

    pub fn kernel_names(&self) -> Vec<&str> {
        self.kernels.iter().map(|k| k.name.as_str()).collect()
    }
}

#[derive(Debug, Clone)]
enum BoundArg {
    Buffer(HostBuffer),
    Bytes(Vec<u8>),
    Local(usize),
}

pub struct HostKernel {
    context: u64,
    signature: Arc<KernelSignature>,
    args: Vec<Option<BoundArg>>,
    body: Option<HostKernelFn>,
}

impl HostKernel {
    pub fn name(&self) -> &str {
        &self.signature.name
    }

    pub fn num_args(&self) -> usize {
        self.signature.params.len()
    }

    /// Number of arguments bound so far.
    pub fn bound_args(&self) -> usize {
        self.args.iter().filter(|a| a.is_some()).count()
    }
}

impl fmt::Debug for HostKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostKernel")
            .field("name", &self.signature.name)
            .field("params", &self.signature.params)
            .field("args", &self.args)
            .field("has_body", &self.body.is_some())
            .finish()
    }
}

#[derive(Debug)]
struct BufferStorage {
    bytes: Mutex<Vec<u8>>,
    _live: LiveGuard,
}

/// Host-memory buffer. Clones refer to the same storage.
#[derive(Debug, Clone)]
pub struct HostBuffer {
    context: u64,
    storage: Arc<BufferStorage>,
}

impl HostBuffer {
    pub fn len(&self) -> usize {
        self.storage.bytes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the current contents.
    pub fn contents(&self) -> Vec<u8> {
        self.storage.bytes.lock().clone()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HostEvent {
    start_ns: u64,
    end_ns: u64,
}

enum InvocationArg {
    Buffer { bytes: Vec<u8>, dirty: bool },
    Bytes(Vec<u8>),
    Local(usize),
}

/// The view a host kernel body has of one dispatch.
///
/// Buffers are copied in before the body runs and copied back afterwards
/// only if the body wrote them.
pub struct HostInvocation {
    global: NdRange,
    local: NdRange,
    args: Vec<InvocationArg>,
}

impl HostInvocation {
    fn new(global: NdRange, local: NdRange, bound: &[BoundArg]) -> Self {
        let args = bound
            .iter()
            .map(|arg| match arg {
                BoundArg::Buffer(buffer) => InvocationArg::Buffer {
                    bytes: buffer.storage.bytes.lock().clone(),
                    dirty: false,
                },
                BoundArg::Bytes(bytes) => InvocationArg::Bytes(bytes.clone()),
                BoundArg::Local(size) => InvocationArg::Local(*size),
            })
            .collect();
        Self { global, local, args }
    }

    fn write_back(self, bound: &[BoundArg]) {
        for (arg, target) in self.args.into_iter().zip(bound) {
            if let (InvocationArg::Buffer { bytes, dirty: true }, BoundArg::Buffer(buffer)) = (arg, target) {
                *buffer.storage.bytes.lock() = bytes;
            }
        }
    }

    pub fn global(&self) -> NdRange {
        self.global
    }

    pub fn local(&self) -> NdRange {
        self.local
    }

    /// Total number of work-items.
    pub fn global_size(&self) -> usize {
        self.global.volume()
    }

    pub fn num_args(&self) -> usize {
        self.args.len()
    }

    /// Contents of the buffer bound at `index`.
    pub fn buffer<T: Pod>(&self, index: u32) -> NativeResult<Vec<T>> {
        if size_of::<T>() == 0 {
            return Err(Status::INVALID_VALUE);
        }
        match self.args.get(index as usize) {
            Some(InvocationArg::Buffer { bytes, .. }) => Ok(bytes
                .chunks_exact(size_of::<T>())
                .map(bytemuck::pod_read_unaligned)
                .collect()),
            Some(_) => Err(Status::INVALID_ARG_VALUE),
            None => Err(Status::INVALID_ARG_INDEX),
        }
    }

    /// Overwrites the start of the buffer bound at `index`.
    pub fn write_buffer<T: Pod>(&mut self, index: u32, data: &[T]) -> NativeResult<()> {
        let src: &[u8] = bytemuck::cast_slice(data);
        match self.args.get_mut(index as usize) {
            Some(InvocationArg::Buffer { bytes, dirty }) => {
                if src.len() > bytes.len() {
                    return Err(Status::INVALID_VALUE);
                }
                bytes[..src.len()].copy_from_slice(src);
                *dirty = true;
                Ok(())
            }
            Some(_) => Err(Status::INVALID_ARG_VALUE),
            None => Err(Status::INVALID_ARG_INDEX),
        }
    }

    pub fn scalar<T: Pod>(&self, index: u32) -> NativeResult<T> {
        match self.args.get(index as usize) {
            Some(InvocationArg::Bytes(bytes)) if bytes.len() == size_of::<T>() => {
                Ok(bytemuck::pod_read_unaligned(bytes))
            }
            Some(InvocationArg::Bytes(_)) => Err(Status::INVALID_ARG_SIZE),
            Some(_) => Err(Status::INVALID_ARG_VALUE),
            None => Err(Status::INVALID_ARG_INDEX),
        }
    }

    /// Size in bytes of the local memory bound at `index`.
    pub fn local_mem_size(&self, index: u32) -> NativeResult<usize> {
        match self.args.get(index as usize) {
            Some(InvocationArg::Local(size)) => Ok(*size),
            Some(_) => Err(Status::INVALID_ARG_VALUE),
            None => Err(Status::INVALID_ARG_INDEX),
        }
    }
}

impl fmt::Debug for HostInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostInvocation")
            .field("global", &self.global)
            .field("local", &self.local)
            .field("args", &self.args.len())
            .finish()
    }
}

impl Platform for HostPlatform {
    type PlatformId = usize;
    type Device = HostDeviceId;
    type Context = HostContext;
    type Queue = HostQueue;
    type Program = HostProgram;
    type Kernel = HostKernel;
    type Buffer = HostBuffer;
    type Event = HostEvent;

    fn platforms(&self) -> NativeResult<Vec<usize>> {
        if self.inner.platforms.is_empty() {
            return Err(Status::PLATFORM_NOT_FOUND_KHR);
        }
        Ok((0..self.inner.platforms.len()).collect())
    }

    fn devices(&self, platform: &usize, class: DeviceType) -> NativeResult<Vec<HostDeviceId>> {
        let (_, devices) = self.inner.platforms.get(*platform).ok_or(Status::INVALID_PLATFORM)?;
        let ids: Vec<HostDeviceId> = devices
            .iter()
            .enumerate()
            .filter(|(_, device)| class == DeviceType::ALL || class.contains(device.class))
            .map(|(index, _)| HostDeviceId {
                platform: *platform,
                index,
            })
            .collect();

        if ids.is_empty() {
            Err(Status::DEVICE_NOT_FOUND)
        } else {
            Ok(ids)
        }
    }

    fn device_info(&self, device: &HostDeviceId) -> NativeResult<DeviceInfo> {
        self.device(*device).map(HostDevice::info)
    }

    fn create_context(&self, devices: &[HostDeviceId]) -> NativeResult<HostContext> {
        if devices.is_empty() {
            return Err(Status::INVALID_VALUE);
        }
        for id in devices {
            self.device(*id)?;
        }
        self.inner.context_failures.check()?;

        self.inner.counters.contexts_created.fetch_add(1, Ordering::Relaxed);
        Ok(HostContext {
            id: self.next_id(),
            devices: devices.to_vec(),
            _live: LiveGuard::new(&self.inner.counters.live_contexts),
        })
    }

    fn create_queue(&self, context: &HostContext, device: &HostDeviceId) -> NativeResult<HostQueue> {
        if !context.devices.contains(device) {
            return Err(Status::INVALID_DEVICE);
        }
        self.inner.queue_failures.check()?;

        self.inner.counters.queues_created.fetch_add(1, Ordering::Relaxed);
        Ok(HostQueue {
            context: context.id,
            device: *device,
            _live: LiveGuard::new(&self.inner.counters.live_queues),
        })
    }

    fn create_program(&self, context: &HostContext, source: &[u8]) -> NativeResult<HostProgram> {
        // The declared length covers exactly one trailing NUL.
        let source = match source.split_last() {
            Some((0, text)) if !text.contains(&0) => text,
            _ => return Err(Status::INVALID_VALUE),
        };
        let source = std::str::from_utf8(source).map_err(|_| Status::INVALID_VALUE)?;

        Ok(HostProgram {
            context: context.id,
            context_devices: context.devices.clone(),
            source: source.to_string(),
            options: None,
            kernels: Vec::new(),
            log: String::new(),
            built: false,
        })
    }

    fn build_program(
        &self,
        program: &mut HostProgram,
        devices: &[HostDeviceId],
        options: Option<&str>,
    ) -> NativeResult<()> {
        if devices.is_empty() {
            return Err(Status::INVALID_VALUE);
        }
        if devices.iter().any(|d| !program.context_devices.contains(d)) {
            return Err(Status::INVALID_DEVICE);
        }

        program.options = options.map(str::to_owned);
        program.built = false;
        program.kernels.clear();

        let outcome = match options.map(check_options).unwrap_or(Ok(())) {
            Err(log) => Err((Status::INVALID_BUILD_OPTIONS, log)),
            Ok(()) => compile(&program.source).map_err(|log| (Status::BUILD_PROGRAM_FAILURE, log)),
        };

        match outcome {
            Ok(kernels) => {
                program.kernels = kernels;
                program.log.clear();
                program.built = true;
                self.inner.counters.programs_built.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err((status, log)) => {
                program.log = log;
                self.inner.counters.build_failures.fetch_add(1, Ordering::Relaxed);
                Err(status)
            }
        }
    }

    fn build_log(&self, program: &HostProgram, device: &HostDeviceId) -> NativeResult<String> {
        if !program.context_devices.contains(device) {
            return Err(Status::INVALID_DEVICE);
        }
        Ok(program.log.clone())
    }

    fn create_kernel(&self, program: &HostProgram, name: &str) -> NativeResult<HostKernel> {
        if !program.built {
            return Err(Status::INVALID_PROGRAM_EXECUTABLE);
        }
        let signature = program
            .kernels
            .iter()
            .find(|k| k.name == name)
            .ok_or(Status::INVALID_KERNEL_NAME)?;

        Ok(HostKernel {
            context: program.context,
            signature: Arc::new(signature.clone()),
            args: vec![None; signature.params.len()],
            body: self.inner.kernels.get(name).cloned(),
        })
    }

    fn copy_kernel(&self, kernel: &HostKernel) -> NativeResult<HostKernel> {
        Ok(HostKernel {
            context: kernel.context,
            signature: Arc::clone(&kernel.signature),
            args: vec![None; kernel.args.len()],
            body: kernel.body.clone(),
        })
    }

    fn set_kernel_arg(&self, kernel: &mut HostKernel, index: u32, arg: &KernelArg<'_, HostBuffer>) -> NativeResult<()> {
        let param = kernel
            .signature
            .params
            .get(index as usize)
            .ok_or(Status::INVALID_ARG_INDEX)?;

        let bound = match (param, arg) {
            (ParamKind::Global, KernelArg::Buffer(buffer)) => {
                if buffer.context != kernel.context {
                    return Err(Status::INVALID_MEM_OBJECT);
                }
                BoundArg::Buffer(HostBuffer::clone(buffer))
            }
            (ParamKind::Global, KernelArg::Scalar { .. }) => return Err(Status::INVALID_MEM_OBJECT),
            (ParamKind::Local, KernelArg::Local(0)) => return Err(Status::INVALID_ARG_SIZE),
            (ParamKind::Local, KernelArg::Local(size)) if *size > LOCAL_MEM_SIZE => {
                return Err(Status::INVALID_ARG_SIZE)
            }
            (ParamKind::Local, KernelArg::Local(size)) => BoundArg::Local(*size),
            (ParamKind::Scalar(Some(size)), KernelArg::Scalar { bytes, .. }) if bytes.len() != *size => {
                return Err(Status::INVALID_ARG_SIZE)
            }
            (ParamKind::Scalar(_), KernelArg::Scalar { bytes, .. }) => BoundArg::Bytes(bytes.clone()),
            _ => return Err(Status::INVALID_ARG_VALUE),
        };

        kernel.args[index as usize] = Some(bound);
        Ok(())
    }

    fn create_buffer(&self, context: &HostContext, size: usize) -> NativeResult<HostBuffer> {
        if size == 0 || size > self.inner.max_alloc {
            return Err(Status::INVALID_BUFFER_SIZE);
        }
        let mut bytes = Vec::new();
        bytes
            .try_reserve_exact(size)
            .map_err(|_| Status::MEM_OBJECT_ALLOCATION_FAILURE)?;
        bytes.resize(size, 0);

        Ok(HostBuffer {
            context: context.id,
            storage: Arc::new(BufferStorage {
                bytes: Mutex::new(bytes),
                _live: LiveGuard::new(&self.inner.counters.live_buffers),
            }),
        })
    }

    fn enqueue_kernel(
        &self,
        queue: &HostQueue,
        kernel: &HostKernel,
        global: &NdRange,
        local: &NdRange,
    ) -> NativeResult<HostEvent> {
        if queue.context != kernel.context {
            return Err(Status::INVALID_CONTEXT);
        }
        let device = self.device(queue.device)?;
        let bound: Vec<BoundArg> = kernel
            .args
            .iter()
            .cloned()
            .collect::<Option<Vec<_>>>()
            .ok_or(Status::INVALID_KERNEL_ARGS)?;

        let global_dims = global.as_slice();
        if global_dims.iter().any(|&g| g == 0) {
            return Err(Status::INVALID_GLOBAL_WORK_SIZE);
        }

        // Only as many local components as the global range has dimensions
        // take part in the launch.
        let local_dims: Vec<usize> = (0..global_dims.len())
            .map(|i| local.as_slice().get(i).copied().unwrap_or(1))
            .collect();
        let group: usize = local_dims.iter().product();
        let uneven = local_dims
            .iter()
            .zip(global_dims)
            .any(|(&l, &g)| l == 0 || g % l != 0);
        if uneven || group > device.max_work_group_size {
            return Err(Status::INVALID_WORK_GROUP_SIZE);
        }

        let start_ns = self.now_ns();
        if let Some(body) = &kernel.body {
            let mut invocation = HostInvocation::new(*global, range_of(&local_dims), &bound);
            (**body)(&mut invocation)?;
            invocation.write_back(&bound);
        }

        self.inner.counters.kernels_launched.fetch_add(1, Ordering::Relaxed);
        Ok(self.event(start_ns))
    }

    fn enqueue_write(&self, queue: &HostQueue, buffer: &mut HostBuffer, _blocking: bool, data: &[u8]) -> NativeResult<HostEvent> {
        if queue.context != buffer.context {
            return Err(Status::INVALID_CONTEXT);
        }
        let start_ns = self.now_ns();
        {
            let mut bytes = buffer.storage.bytes.lock();
            if data.len() > bytes.len() {
                return Err(Status::INVALID_VALUE);
            }
            bytes[..data.len()].copy_from_slice(data);
        }

        self.inner
            .counters
            .bytes_written
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(self.event(start_ns))
    }

    fn enqueue_read(&self, queue: &HostQueue, buffer: &HostBuffer, _blocking: bool, data: &mut [u8]) -> NativeResult<HostEvent> {
        if queue.context != buffer.context {
            return Err(Status::INVALID_CONTEXT);
        }
        let start_ns = self.now_ns();
        {
            let bytes = buffer.storage.bytes.lock();
            if data.len() > bytes.len() {
                return Err(Status::INVALID_VALUE);
            }
            data.copy_from_slice(&bytes[..data.len()]);
        }

        self.inner
            .counters
            .bytes_read
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(self.event(start_ns))
    }

    fn profiling_times(&self, event: &HostEvent) -> NativeResult<(u64, u64)> {
        Ok((event.start_ns, event.end_ns))
    }

    fn wait(&self, _event: &HostEvent) -> NativeResult<()> {
        // Commands complete before enqueue returns.
        Ok(())
    }
}

fn range_of(dims: &[usize]) -> NdRange {
    match *dims {
        [x] => NdRange::one(x),
        [x, y] => NdRange::two(x, y),
        [x, y, z, ..] => NdRange::three(x, y, z),
        [] => NdRange::one(1),
    }
}

/// Tokens that are not options are only allowed as the value of `-D`/`-I`.
fn check_options(options: &str) -> Result<(), String> {
    let mut expects_value = false;
    for token in options.split_whitespace() {
        if expects_value {
            expects_value = false;
            continue;
        }
        if !token.starts_with('-') {
            return Err(format!("error: invalid build option '{}'", token));
        }
        expects_value = token == "-D" || token == "-I";
    }
    Ok(())
}

/// Checks the program and extracts every kernel signature. The error is the
/// build log.
fn compile(source: &str) -> Result<Vec<KernelSignature>, String> {
    let source = strip_comments(source);
    if source.trim().is_empty() {
        return Err("error: empty program source".to_string());
    }

    for (line_no, line) in source.lines().enumerate() {
        if let Some(message) = line.trim_start().strip_prefix("#error") {
            return Err(format!("{}: error: {}", line_no + 1, message.trim()));
        }
    }
    check_balanced(&source)?;

    let mut kernels: Vec<KernelSignature> = Vec::new();
    let mut from = 0;
    while let Some(end) = next_kernel_keyword(&source, from) {
        let open = source[end..]
            .find('(')
            .map(|i| end + i)
            .ok_or_else(|| "error: expected '(' after kernel declaration".to_string())?;

        let header: Vec<&str> = source[end..open].split_whitespace().collect();
        let name = match header.as_slice() {
            ["void", name] if is_identifier(name) => *name,
            _ => {
                return Err(format!(
                    "error: kernel must be declared as 'void <name>(...)', found '{}'",
                    header.join(" ")
                ))
            }
        };

        let close = matching_paren(&source, open)
            .ok_or_else(|| format!("error: unterminated parameter list for '{}'", name))?;
        if kernels.iter().any(|k| k.name == name) {
            return Err(format!("error: redefinition of kernel '{}'", name));
        }

        kernels.push(KernelSignature {
            name: name.to_string(),
            params: parse_params(&source[open + 1..close])?,
        });
        from = close + 1;
    }

    Ok(kernels)
}

fn strip_comments(source: &str) -> String {
    let mut out = String::with_capacity(source.len());
    let mut chars = source.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '/' {
            match chars.peek() {
                Some('/') => {
                    while chars.peek().map_or(false, |&n| n != '\n') {
                        chars.next();
                    }
                    continue;
                }
                Some('*') => {
                    chars.next();
                    let mut prev = '\0';
                    for n in chars.by_ref() {
                        if prev == '*' && n == '/' {
                            break;
                        }
                        // Keep line numbers stable for the build log.
                        if n == '\n' {
                            out.push('\n');
                        }
                        prev = n;
                    }
                    out.push(' ');
                    continue;
                }
                _ => {}
            }
        }
        out.push(c);
    }
    out
}

fn check_balanced(source: &str) -> Result<(), String> {
    let mut stack: Vec<(char, usize)> = Vec::new();
    for (line_no, line) in source.lines().enumerate() {
        for c in line.chars() {
            match c {
                '(' | '{' | '[' => stack.push((c, line_no + 1)),
                ')' | '}' | ']' => {
                    let expected = match c {
                        ')' => '(',
                        '}' => '{',
                        _ => '[',
                    };
                    match stack.pop() {
                        Some((open, _)) if open == expected => {}
                        _ => return Err(format!("{}: error: unexpected '{}'", line_no + 1, c)),
                    }
                }
                _ => {}
            }
        }
    }
    match stack.pop() {
        Some((open, line)) => Err(format!("{}: error: unterminated '{}'", line, open)),
        None => Ok(()),
    }
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

fn is_identifier(word: &str) -> bool {
    let mut bytes = word.bytes();
    matches!(bytes.next(), Some(b) if b.is_ascii_alphabetic() || b == b'_') && bytes.all(is_ident_byte)
}

/// Byte offset just past the next `kernel` / `__kernel` keyword.
fn next_kernel_keyword(source: &str, from: usize) -> Option<usize> {
    let bytes = source.as_bytes();
    let mut search = from;
    while let Some(rel) = source[search..].find("kernel") {
        let start = search + rel;
        let end = start + "kernel".len();
        let keyword_start = if source[..start].ends_with("__") { start - 2 } else { start };
        let clear_before = keyword_start == 0 || !is_ident_byte(bytes[keyword_start - 1]);
        let clear_after = end < bytes.len() && !is_ident_byte(bytes[end]);
        if clear_before && clear_after {
            return Some(end);
        }
        search = end;
    }
    None
}

fn matching_paren(source: &str, open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (i, c) in source[open..].char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(open + i);
                }
            }
            _ => {}
        }
    }
    None
}

fn parse_params(list: &str) -> Result<Vec<ParamKind>, String> {
    let list = list.trim();
    if list.is_empty() || list == "void" {
        return Ok(Vec::new());
    }
    list.split(',').map(parse_param).collect()
}

fn parse_param(param: &str) -> Result<ParamKind, String> {
    let tokens: Vec<&str> = param
        .split(|c: char| c.is_whitespace() || c == '*')
        .filter(|t| !t.is_empty())
        .collect();
    if tokens.len() < 2 {
        return Err(format!("error: malformed parameter '{}'", param.trim()));
    }

    let has = |qualifier: &str| tokens.iter().any(|t| t.trim_start_matches("__") == qualifier);
    if has("local") {
        return Ok(ParamKind::Local);
    }
    if has("global") || has("constant") || param.contains('*') {
        return Ok(ParamKind::Global);
    }

    let ty: Vec<&str> = tokens[..tokens.len() - 1]
        .iter()
        .copied()
        .filter(|t| !matches!(t.trim_start_matches("__"), "const" | "private" | "restrict" | "volatile"))
        .collect();
    Ok(ParamKind::Scalar(scalar_size(&ty)))
}

/// Size of a built-in scalar or vector type; `None` for anything else.
fn scalar_size(ty: &[&str]) -> Option<usize> {
    let base = match ty {
        ["unsigned"] => "int",
        ["unsigned", base] | ["signed", base] | [base] => *base,
        _ => return None,
    };
    let (scalar, lanes) = base.split_at(base.trim_end_matches(|c: char| c.is_ascii_digit()).len());

    let width = match scalar {
        "char" | "uchar" | "bool" => 1,
        "short" | "ushort" | "half" => 2,
        "int" | "uint" | "float" => 4,
        "long" | "ulong" | "double" | "size_t" | "ptrdiff_t" | "intptr_t" | "uintptr_t" => 8,
        _ => return None,
    };
    let lanes = match lanes {
        "" => 1,
        "2" => 2,
        // 3-component vectors are sized like 4-component ones.
        "3" | "4" => 4,
        "8" => 8,
        "16" => 16,
        _ => return None,
    };
    Some(width * lanes)
}

#[cfg(test)]
mod tests {
    use super::*;

    const VADD: &str = r#"
        // element-wise sum
        __kernel void vadd(__global const float* a,
                           __global const float* b,
                           __global float* out,
                           const uint n)
        {
            size_t i = get_global_id(0);
            if (i < n) out[i] = a[i] + b[i];
        }
    "#;

    fn signatures(source: &str) -> Vec<KernelSignature> {
        compile(source).unwrap()
    }

    fn built_program(platform: &HostPlatform, context: &HostContext, source: &str) -> HostProgram {
        let mut bytes = source.as_bytes().to_vec();
        bytes.push(0);
        let mut program = platform.create_program(context, &bytes).unwrap();
        platform
            .build_program(&mut program, context.devices(), None)
            .unwrap();
        program
    }

    fn setup(platform: &HostPlatform) -> (HostContext, HostQueue) {
        let ids = platform.devices(&0, DeviceType::CPU).unwrap();
        let context = platform.create_context(&ids).unwrap();
        let queue = platform.create_queue(&context, &ids[0]).unwrap();
        (context, queue)
    }

    #[test]
    fn test_parse_signature() {
        let kernels = signatures(VADD);
        assert_eq!(kernels.len(), 1);
        assert_eq!(kernels[0].name, "vadd");
        assert_eq!(
            kernels[0].params,
            vec![ParamKind::Global, ParamKind::Global, ParamKind::Global, ParamKind::Scalar(Some(4))]
        );
    }

    #[test]
    fn test_parse_kinds_and_sizes() {
        let kernels = signatures(
            "kernel void k(__local float* tmp, float4 v, unsigned char c, double d, my_t s) {}\n\
             __kernel void empty(void) {}",
        );
        assert_eq!(kernels.len(), 2);
        assert_eq!(
            kernels[0].params,
            vec![
                ParamKind::Local,
                ParamKind::Scalar(Some(16)),
                ParamKind::Scalar(Some(1)),
                ParamKind::Scalar(Some(8)),
                ParamKind::Scalar(None),
            ]
        );
        assert!(kernels[1].params.is_empty());
    }

    #[test]
    fn test_commented_kernel_ignored() {
        let kernels = signatures("/* __kernel void old(int a) {} */\n__kernel void new_one(int a) {}");
        assert_eq!(kernels.len(), 1);
        assert_eq!(kernels[0].name, "new_one");
    }

    #[test]
    fn test_compile_failures() {
        assert!(compile("").unwrap_err().contains("empty"));
        assert!(compile("   \n  ").is_err());

        let log = compile("#error broken on purpose\n__kernel void k() {}").unwrap_err();
        assert_eq!(log, "1: error: broken on purpose");

        let log = compile("__kernel void k(int a) {\n  a = 1;\n").unwrap_err();
        assert!(log.contains("unterminated '{'"));

        assert!(compile("__kernel int k() {}").is_err());
        assert!(compile("__kernel void k() {}\n__kernel void k() {}").is_err());
    }

    #[test]
    fn test_helpers_only_program_builds() {
        assert!(signatures("float twice(float x) { return 2.0f * x; }").is_empty());
    }

    #[test]
    fn test_check_options() {
        assert!(check_options("-cl-fast-relaxed-math -D N=4 -I include").is_ok());
        assert!(check_options("fast").is_err());
    }

    #[test]
    fn test_enumeration() {
        let platform = HostPlatform::builder()
            .platform("p", vec![HostDevice::cpu("c"), HostDevice::gpu("g")])
            .build();
        assert_eq!(platform.platforms().unwrap(), vec![0]);
        assert_eq!(platform.devices(&0, DeviceType::GPU).unwrap().len(), 1);
        assert_eq!(platform.devices(&0, DeviceType::ACCELERATOR), Err(Status::DEVICE_NOT_FOUND));
        assert_eq!(platform.devices(&3, DeviceType::GPU), Err(Status::INVALID_PLATFORM));

        let empty = HostPlatform::builder().build();
        assert_eq!(empty.platforms(), Err(Status::PLATFORM_NOT_FOUND_KHR));
    }

    #[test]
    fn test_build_failure_keeps_log() {
        let platform = HostPlatform::new();
        let (context, _queue) = setup(&platform);
        let mut program = platform.create_program(&context, b"#error nope\0").unwrap();

        let status = platform
            .build_program(&mut program, context.devices(), None)
            .unwrap_err();
        assert_eq!(status, Status::BUILD_PROGRAM_FAILURE);
        assert!(!program.is_built());
        assert!(platform
            .build_log(&program, &context.devices()[0])
            .unwrap()
            .contains("nope"));
        assert_eq!(
            platform.create_kernel(&program, "k").unwrap_err(),
            Status::INVALID_PROGRAM_EXECUTABLE
        );
        assert_eq!(platform.stats().build_failures, 1);
    }

    #[test]
    fn test_arg_validation() {
        let platform = HostPlatform::new();
        let (context, _queue) = setup(&platform);
        let program = built_program(&platform, &context, VADD);
        let mut kernel = platform.create_kernel(&program, "vadd").unwrap();
        let buffer = platform.create_buffer(&context, 16).unwrap();

        assert!(platform.set_kernel_arg(&mut kernel, 0, &KernelArg::Buffer(&buffer)).is_ok());
        assert_eq!(
            platform.set_kernel_arg(&mut kernel, 1, &KernelArg::scalar(1u32)),
            Err(Status::INVALID_MEM_OBJECT)
        );
        assert_eq!(
            platform.set_kernel_arg(&mut kernel, 3, &KernelArg::scalar(1u64)),
            Err(Status::INVALID_ARG_SIZE)
        );
        assert_eq!(
            platform.set_kernel_arg(&mut kernel, 3, &KernelArg::Buffer(&buffer)),
            Err(Status::INVALID_ARG_VALUE)
        );
        assert_eq!(
            platform.set_kernel_arg(&mut kernel, 4, &KernelArg::scalar(1u32)),
            Err(Status::INVALID_ARG_INDEX)
        );
        assert_eq!(kernel.bound_args(), 1);
        assert_eq!(
            platform.create_kernel(&program, "missing").unwrap_err(),
            Status::INVALID_KERNEL_NAME
        );
    }

    #[test]
    fn test_local_arg_limits() {
        let platform = HostPlatform::new();
        let (context, _queue) = setup(&platform);
        let program = built_program(&platform, &context, "__kernel void k(__local float* tmp) {}");
        let mut kernel = platform.create_kernel(&program, "k").unwrap();

        assert!(platform
            .set_kernel_arg(&mut kernel, 0, &KernelArg::local::<f32>(256))
            .is_ok());
        assert_eq!(
            platform.set_kernel_arg(&mut kernel, 0, &KernelArg::local::<u64>(usize::MAX / 2)),
            Err(Status::INVALID_ARG_SIZE)
        );
        assert_eq!(
            platform.set_kernel_arg(&mut kernel, 0, &KernelArg::Local(0)),
            Err(Status::INVALID_ARG_SIZE)
        );
    }

    #[test]
    fn test_source_must_carry_one_terminator() {
        let platform = HostPlatform::new();
        let (context, _queue) = setup(&platform);

        let program = platform
            .create_program(&context, b"__kernel void k(void) {}\0")
            .unwrap();
        assert_eq!(program.source(), "__kernel void k(void) {}");

        assert_eq!(
            platform.create_program(&context, b"__kernel void k(void) {}").unwrap_err(),
            Status::INVALID_VALUE
        );
        assert_eq!(
            platform.create_program(&context, b"__kernel\0 void k(void) {}\0").unwrap_err(),
            Status::INVALID_VALUE
        );
        assert_eq!(platform.create_program(&context, b"").unwrap_err(), Status::INVALID_VALUE);
    }

    #[test]
    fn test_enqueue_checks_work_sizes() {
        let platform = HostPlatform::builder()
            .platform("p", vec![HostDevice::cpu("c").max_work_group_size(256)])
            .build();
        let (context, queue) = setup(&platform);
        let program = built_program(&platform, &context, "__kernel void noop(void) {}");
        let kernel = platform.create_kernel(&program, "noop").unwrap();

        assert!(platform
            .enqueue_kernel(&queue, &kernel, &NdRange::one(1024), &NdRange::two(256, 4))
            .is_ok());
        assert_eq!(
            platform
                .enqueue_kernel(&queue, &kernel, &NdRange::one(1024), &NdRange::two(512, 2))
                .unwrap_err(),
            Status::INVALID_WORK_GROUP_SIZE
        );
        assert_eq!(
            platform
                .enqueue_kernel(&queue, &kernel, &NdRange::one(100), &NdRange::one(30))
                .unwrap_err(),
            Status::INVALID_WORK_GROUP_SIZE
        );
        assert_eq!(
            platform
                .enqueue_kernel(&queue, &kernel, &NdRange::one(0), &NdRange::one(0))
                .unwrap_err(),
            Status::INVALID_GLOBAL_WORK_SIZE
        );
        assert_eq!(platform.stats().kernels_launched, 1);
    }

    #[test]
    fn test_unbound_args_rejected() {
        let platform = HostPlatform::new();
        let (context, queue) = setup(&platform);
        let program = built_program(&platform, &context, VADD);
        let kernel = platform.create_kernel(&program, "vadd").unwrap();

        assert_eq!(
            platform
                .enqueue_kernel(&queue, &kernel, &NdRange::one(4), &NdRange::one(4))
                .unwrap_err(),
            Status::INVALID_KERNEL_ARGS
        );
    }

    #[test]
    fn test_body_runs_and_writes_back() {
        let platform = HostPlatform::builder()
            .platform("p", vec![HostDevice::cpu("c")])
            .kernel("scale", |inv: &mut HostInvocation| {
                let factor: f32 = inv.scalar(1)?;
                let data: Vec<f32> = inv.buffer(0)?;
                let scaled: Vec<f32> = data.iter().map(|x| x * factor).collect();
                inv.write_buffer(0, &scaled)
            })
            .build();
        let (context, queue) = setup(&platform);
        let program = built_program(&platform, &context, "__kernel void scale(__global float* v, float f) {}");
        let mut kernel = platform.create_kernel(&program, "scale").unwrap();

        let mut buffer = platform.create_buffer(&context, 16).unwrap();
        platform
            .enqueue_write(&queue, &mut buffer, true, bytemuck::cast_slice(&[1.0f32, 2.0, 3.0, 4.0][..]))
            .unwrap();
        platform.set_kernel_arg(&mut kernel, 0, &KernelArg::Buffer(&buffer)).unwrap();
        platform.set_kernel_arg(&mut kernel, 1, &KernelArg::scalar(3.0f32)).unwrap();
        platform
            .enqueue_kernel(&queue, &kernel, &NdRange::one(4), &NdRange::one(4))
            .unwrap();

        let mut out = [0.0f32; 4];
        platform
            .enqueue_read(&queue, &buffer, true, bytemuck::cast_slice_mut(&mut out[..]))
            .unwrap();
        assert_eq!(out, [3.0, 6.0, 9.0, 12.0]);
    }

    #[test]
    fn test_copy_kernel_has_fresh_args() {
        let platform = HostPlatform::new();
        let (context, _queue) = setup(&platform);
        let program = built_program(&platform, &context, VADD);
        let mut kernel = platform.create_kernel(&program, "vadd").unwrap();
        platform.set_kernel_arg(&mut kernel, 3, &KernelArg::scalar(4u32)).unwrap();

        let copy = platform.copy_kernel(&kernel).unwrap();
        assert_eq!(copy.name(), "vadd");
        assert_eq!(copy.bound_args(), 0);
        assert_eq!(kernel.bound_args(), 1);
    }

    #[test]
    fn test_transfer_bounds() {
        let platform = HostPlatform::new();
        let (context, queue) = setup(&platform);
        let mut buffer = platform.create_buffer(&context, 4).unwrap();

        assert_eq!(
            platform.enqueue_write(&queue, &mut buffer, true, &[0u8; 8]).unwrap_err(),
            Status::INVALID_VALUE
        );
        assert_eq!(platform.create_buffer(&context, 0).unwrap_err(), Status::INVALID_BUFFER_SIZE);
    }

    #[test]
    fn test_profiling_times_are_ordered() {
        let platform = HostPlatform::new();
        let (context, queue) = setup(&platform);
        let mut buffer = platform.create_buffer(&context, 4).unwrap();

        let event = platform.enqueue_write(&queue, &mut buffer, true, &[1, 2, 3, 4]).unwrap();
        let (start, end) = platform.profiling_times(&event).unwrap();
        assert!(end >= start);
    }

    #[test]
    fn test_failure_injection_and_live_counts() {
        let platform = HostPlatform::builder()
            .platform("p", vec![HostDevice::cpu("c")])
            .context_failures(1, Status::OUT_OF_HOST_MEMORY)
            .build();
        let ids = platform.devices(&0, DeviceType::CPU).unwrap();

        assert_eq!(platform.create_context(&ids).unwrap_err(), Status::OUT_OF_HOST_MEMORY);
        assert_eq!(platform.stats().live_contexts, 0);

        let context = platform.create_context(&ids).unwrap();
        let buffer = platform.create_buffer(&context, 8).unwrap();
        assert_eq!(platform.stats().live_contexts, 1);
        assert_eq!(platform.stats().live_buffers, 1);

        drop(buffer);
        drop(context);
        let stats = platform.stats();
        assert_eq!(stats.live_contexts, 0);
        assert_eq!(stats.live_buffers, 0);
        assert_eq!(stats.contexts_created, 1);
    }
}
