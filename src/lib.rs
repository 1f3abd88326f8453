//! kiln - lazy device runtime for compiling and dispatching compute kernels
//!
//! A [`Runtime`] discovers a usable device on first use, then builds an
//! execution context and a profiling command queue behind it. Kernel source
//! is compiled into programs, arguments are bound positionally, problem
//! sizes are partitioned into work-groups, and typed buffers move between
//! host and device with a profiling event stamped on every command.
//!
//! # Quick Start
//!
//! ```
//! use kiln::prelude::*;
//!
//! let platform = HostPlatform::builder()
//!     .platform("host", vec![HostDevice::cpu("cpu0")])
//!     .kernel("twice", |inv: &mut HostInvocation| {
//!         let v: Vec<f32> = inv.buffer(0)?;
//!         let doubled: Vec<f32> = v.iter().map(|x| x * 2.0).collect();
//!         inv.write_buffer(0, &doubled)
//!     })
//!     .build();
//!
//! let mut rt = Runtime::new(platform);
//! let mut buf = rt.allocate::<f32>(4).unwrap();
//! rt.write_buffer(&mut buf, &[1.0, 2.0, 3.0, 4.0]).unwrap();
//!
//! let src = "__kernel void twice(__global float* v) { v[get_global_id(0)] *= 2.0f; }";
//! rt.execute_from_source(src, "twice", 4, &kernel_args![&buf]).unwrap();
//!
//! let mut out = [0.0f32; 4];
//! rt.read_buffer(&buf, &mut out).unwrap();
//! assert_eq!(out, [2.0, 4.0, 6.0, 8.0]);
//! ```
//!
//! # Features
//!
//! - **Lazy cascade**: device, context and queue are created once, on demand
//! - **Device priority**: accelerators, then GPUs, then CPUs
//! - **Host platform**: an in-process simulation for tests and benches
//! - **OpenCL**: the system ICD through `opencl3` (feature `opencl`)
//! - **Telemetry**: build/dispatch/transfer metrics (feature `telemetry`)

#![warn(missing_debug_implementations)]

pub mod buffer;
pub mod config;
pub mod device;
pub mod error;
pub mod grid;
pub mod kernel;
pub mod platform;
pub mod prelude;
pub mod runtime;
pub mod status;
pub mod telemetry;

pub use buffer::Buffer;
pub use config::{Config, ConfigBuilder, KernelDef, Parameter};
pub use device::{DeviceInfo, DeviceList, DeviceType};
pub use error::{Error, ErrorKind, Resource, Result};
pub use grid::{partition, NdRange, Partition, MAX_THREADS};
pub use kernel::KernelArg;
pub use platform::Platform;
pub use runtime::Runtime;
pub use status::Status;
