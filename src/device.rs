//! Device classes and device selection.

use crate::error::{Error, Resource, Result};
use crate::platform::Platform;
use std::fmt;
use std::ops::{BitAnd, BitOr};

/// Device-class bitmask.
///
/// Bit values match `cl_device_type`, so a mask can be handed to a native
/// platform without translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceType(u64);

impl DeviceType {
    pub const DEFAULT: DeviceType = DeviceType(1 << 0);
    pub const CPU: DeviceType = DeviceType(1 << 1);
    pub const GPU: DeviceType = DeviceType(1 << 2);
    pub const ACCELERATOR: DeviceType = DeviceType(1 << 3);
    pub const ALL: DeviceType = DeviceType(0xFFFF_FFFF);

    /// Largest combination accepted besides [`DeviceType::ALL`].
    const COMBINED: u64 = Self::DEFAULT.0 | Self::CPU.0 | Self::GPU.0 | Self::ACCELERATOR.0;

    /// Classes in the order selection scans them.
    pub const PRIORITY: [DeviceType; 3] = [Self::ACCELERATOR, Self::GPU, Self::CPU];

    /// Validates a raw mask: `ALL`, or any combination of the four classes.
    pub fn from_bits(bits: u64) -> Option<Self> {
        if bits == Self::ALL.0 || bits <= Self::COMBINED {
            Some(DeviceType(bits))
        } else {
            None
        }
    }

    /// Keeps `bits` as reported by a native platform, including classes
    /// outside the four known ones (e.g. `CL_DEVICE_TYPE_CUSTOM`).
    pub fn from_bits_retain(bits: u64) -> Self {
        DeviceType(bits)
    }

    pub fn bits(self) -> u64 {
        self.0
    }

    /// Maps a front-end target name (`cpu`, `gpu`, `accelerator`).
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "cpu" => Some(Self::CPU),
            "gpu" => Some(Self::GPU),
            "accelerator" => Some(Self::ACCELERATOR),
            _ => None,
        }
    }

    pub fn contains(self, other: DeviceType) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether selection under this mask scans `class`.
    ///
    /// `ALL` scans every class, and so does any mask carrying `DEFAULT`.
    pub fn admits(self, class: DeviceType) -> bool {
        self == Self::ALL || self.0 & (Self::DEFAULT.0 | class.0) != 0
    }
}

impl Default for DeviceType {
    fn default() -> Self {
        DeviceType::ALL
    }
}

impl BitOr for DeviceType {
    type Output = DeviceType;

    fn bitor(self, rhs: Self) -> Self::Output {
        DeviceType(self.0 | rhs.0)
    }
}

impl BitAnd for DeviceType {
    type Output = DeviceType;

    fn bitand(self, rhs: Self) -> Self::Output {
        DeviceType(self.0 & rhs.0)
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::ALL {
            return f.write_str("all");
        }
        let names: Vec<&str> = [
            (Self::DEFAULT, "default"),
            (Self::CPU, "cpu"),
            (Self::GPU, "gpu"),
            (Self::ACCELERATOR, "accelerator"),
        ]
        .iter()
        .filter(|(class, _)| self.contains(*class))
        .map(|(_, name)| *name)
        .collect();

        if names.is_empty() {
            write!(f, "none ({:#x})", self.0)
        } else {
            f.write_str(&names.join("|"))
        }
    }
}

/// Properties of one device as reported by its platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name: String,
    pub vendor: String,
    pub class: DeviceType,
    pub available: bool,
    pub compiler_available: bool,
    pub max_work_group_size: usize,
}

impl DeviceInfo {
    /// Usable for building and running kernels.
    pub fn is_usable(&self) -> bool {
        self.available && self.compiler_available
    }
}

/// The device list a runtime settled on.
///
/// Holds every device the chosen platform reported for the chosen class,
/// since contexts and builds span the whole list, and remembers which
/// entry queues are bound to.
#[derive(Debug, Clone)]
pub struct DeviceList<D> {
    devices: Vec<D>,
    selected: usize,
    info: DeviceInfo,
    platform_index: usize,
}

impl<D> DeviceList<D> {
    pub fn devices(&self) -> &[D] {
        &self.devices
    }

    /// The device queues are bound to.
    pub fn selected(&self) -> &D {
        &self.devices[self.selected]
    }

    pub fn selected_index(&self) -> usize {
        self.selected
    }

    pub fn selected_info(&self) -> &DeviceInfo {
        &self.info
    }

    /// Index of the platform the list was enumerated from.
    pub fn platform_index(&self) -> usize {
        self.platform_index
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

/// Scans every platform for the first usable device under `target`.
///
/// Accelerators beat GPUs, which beat CPUs, regardless of platform order.
/// A platform that fails to enumerate a class is treated as having none.
pub fn select_device<P: Platform>(platform: &P, target: DeviceType) -> Result<DeviceList<P::Device>> {
    let mut devices: Vec<P::Device> = Vec::new();
    devices
        .try_reserve(1)
        .map_err(|_| Error::ResourceExhaustion(Resource::DeviceList))?;

    let platforms = match platform.platforms() {
        Ok(platforms) => platforms,
        Err(status) => {
            tracing::warn!(%status, "platform enumeration failed");
            Vec::new()
        }
    };

    for class in DeviceType::PRIORITY {
        if !target.admits(class) {
            continue;
        }

        for (platform_index, id) in platforms.iter().enumerate() {
            devices = match platform.devices(id, class) {
                Ok(devices) => devices,
                Err(status) => {
                    tracing::trace!(platform_index, %class, %status, "no devices");
                    continue;
                }
            };

            for (index, device) in devices.iter().enumerate() {
                let info = match platform.device_info(device) {
                    Ok(info) => info,
                    Err(status) => {
                        tracing::trace!(platform_index, index, %status, "device info query failed");
                        continue;
                    }
                };

                if info.is_usable() {
                    tracing::info!(
                        platform_index,
                        index,
                        device = %info.name,
                        %class,
                        "selected device"
                    );
                    return Ok(DeviceList {
                        devices,
                        selected: index,
                        info,
                        platform_index,
                    });
                }
            }
        }
    }

    Err(Error::DeviceUnavailable(target))
}
