pub use crate::buffer::Buffer;
pub use crate::config::{Config, ConfigBuilder, KernelDef, Parameter};
pub use crate::device::{DeviceInfo, DeviceType};
pub use crate::error::{Error, ErrorKind, Result};
pub use crate::kernel::KernelArg;
pub use crate::kernel_args;
pub use crate::platform::{HostDevice, HostInvocation, HostPlatform, Platform};
pub use crate::runtime::Runtime;
pub use crate::status::Status;

#[cfg(feature = "opencl")]
pub use crate::platform::OpenClPlatform;

#[cfg(feature = "telemetry")]
pub use crate::telemetry::{Metrics, MetricsSnapshot};
