use crate::device::DeviceType;
use crate::status::Status;
use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

/// The lazily created resources, in cascade order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    DeviceList,
    Context,
    Queue,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Resource::DeviceList => "device list",
            Resource::Context => "context",
            Resource::Queue => "command queue",
        })
    }
}

/// Coarse failure taxonomy, for callers that branch on the kind of failure
/// rather than on the exact variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ResourceExhaustion,
    DeviceUnavailable,
    BuildFailure,
    BindingFailure,
    EnqueueFailure,
    ConfigurationRejected,
    /// Any other native failure (context, queue, allocation, profiling).
    Native,
    Config,
    Telemetry,
    Io,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("out of host memory while creating the {0}")]
    ResourceExhaustion(Resource),

    #[error("no available, compiler-capable device for target {0}")]
    DeviceUnavailable(DeviceType),

    #[error("context creation failed: {0}")]
    Context(Status),

    #[error("command queue creation failed: {0}")]
    Queue(Status),

    #[error("program build failed: {0}")]
    BuildFailure(Status),

    #[error("kernel binding failed: {0}")]
    BindingFailure(Status),

    #[error("buffer allocation failed: {0}")]
    Allocation(Status),

    #[error("enqueue failed: {0}")]
    EnqueueFailure(Status),

    #[error("profiling query failed: {0}")]
    Profiling(Status),

    #[error("configuration rejected: {0}")]
    ConfigurationRejected(String),

    #[error("{0} not initialized")]
    Uninitialized(Resource),

    #[error("config error: {0}")]
    Config(String),

    #[error("telemetry error: {0}")]
    Telemetry(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    #[cfg(feature = "telemetry")]
    pub fn telemetry<S: Into<String>>(msg: S) -> Self {
        Error::Telemetry(msg.into())
    }

    pub fn rejected<S: Into<String>>(msg: S) -> Self {
        Error::ConfigurationRejected(msg.into())
    }

    /// Context failure; out-of-host-memory is reported as exhaustion.
    pub(crate) fn context(status: Status) -> Self {
        if status == Status::OUT_OF_HOST_MEMORY {
            Error::ResourceExhaustion(Resource::Context)
        } else {
            Error::Context(status)
        }
    }

    /// Queue failure; out-of-host-memory is reported as exhaustion.
    pub(crate) fn queue(status: Status) -> Self {
        if status == Status::OUT_OF_HOST_MEMORY {
            Error::ResourceExhaustion(Resource::Queue)
        } else {
            Error::Queue(status)
        }
    }

    /// The underlying native status, when the failure came from the platform.
    pub fn status(&self) -> Option<Status> {
        match self {
            Error::ResourceExhaustion(_) => Some(Status::OUT_OF_HOST_MEMORY),
            Error::DeviceUnavailable(_) => Some(Status::DEVICE_NOT_FOUND),
            Error::ConfigurationRejected(_) => Some(Status::INVALID_OPERATION),
            Error::Context(status)
            | Error::Queue(status)
            | Error::BuildFailure(status)
            | Error::BindingFailure(status)
            | Error::Allocation(status)
            | Error::EnqueueFailure(status)
            | Error::Profiling(status) => Some(*status),
            Error::Uninitialized(_) | Error::Config(_) | Error::Telemetry(_) | Error::Io(_) => None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ResourceExhaustion(_) => ErrorKind::ResourceExhaustion,
            Error::DeviceUnavailable(_) => ErrorKind::DeviceUnavailable,
            Error::BuildFailure(_) => ErrorKind::BuildFailure,
            Error::BindingFailure(_) => ErrorKind::BindingFailure,
            Error::EnqueueFailure(_) => ErrorKind::EnqueueFailure,
            Error::ConfigurationRejected(_) => ErrorKind::ConfigurationRejected,
            Error::Context(_)
            | Error::Queue(_)
            | Error::Allocation(_)
            | Error::Profiling(_)
            | Error::Uninitialized(_) => ErrorKind::Native,
            Error::Config(_) => ErrorKind::Config,
            Error::Telemetry(_) => ErrorKind::Telemetry,
            Error::Io(_) => ErrorKind::Io,
        }
    }
}
