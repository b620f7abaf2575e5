//! Implementation of the device allocator.
//!
//! The allocator tracks which of the fixed set of exclusive accelerator
//! devices is bound to an active window. Its bindings are rebuilt from the
//! ledger's active collection with [`DeviceAllocator::sync`], so the
//! allocator never keeps counters that could drift from the ledger.

use std::process::Command;

use thiserror::Error;
use tracing::debug;

use crate::WindowId;

/// Identifies one accelerator device.
pub type DeviceId = u32;

/// The prefix of device lines printed by `nvidia-smi -L`.
const NVIDIA_SMI_DEVICE_PREFIX: &str = "GPU ";

/// Represents an error from binding a device.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AllocatorError {
    /// The device is not part of the pool.
    #[error("device {device} is not one of the scheduled devices")]
    UnknownDevice {
        /// The requested device.
        device: DeviceId,
    },
    /// The device is already bound to another window.
    #[error("device {device} is already bound to window `{window}`")]
    Busy {
        /// The requested device.
        device: DeviceId,
        /// The window currently bound to the device.
        window: WindowId,
    },
    /// The pool has no devices.
    #[error("the device pool must contain at least one device")]
    Empty,
    /// The device count does not fit the range of device ids.
    #[error("device count {count} exceeds the largest device id")]
    TooMany {
        /// The requested device count.
        count: usize,
    },
}

/// Represents an error from detecting the host's devices.
#[derive(Debug, Error)]
pub enum DetectError {
    /// The device-selection variable holds something other than device
    /// numbers.
    #[error(
        "environment variable `{var}` contains non-numeric device `{value}`; configure device \
         ids explicitly"
    )]
    NonNumeric {
        /// The name of the variable.
        var: String,
        /// The offending entry.
        value: String,
    },
    /// `nvidia-smi` could not be run.
    #[error("failed to run `nvidia-smi`: {0}")]
    Query(#[from] std::io::Error),
    /// No device was found.
    #[error(
        "no accelerator devices were detected; set `{var}` or configure the device count \
         explicitly"
    )]
    NoDevices {
        /// The name of the device-selection variable.
        var: String,
    },
    /// The device count does not fit the range of device ids.
    #[error("device count {count} exceeds the largest device id")]
    TooMany {
        /// The device count.
        count: usize,
    },
}

/// Tracks the binding of exclusive devices to active windows.
#[derive(Debug, Clone)]
pub struct DeviceAllocator {
    /// The device ids in ascending order.
    ids: Vec<DeviceId>,
    /// The window bound to each device, parallel to `ids`.
    slots: Vec<Option<WindowId>>,
}

impl DeviceAllocator {
    /// Constructs an allocator for the given device ids.
    ///
    /// Repeated ids name the same device.
    pub fn new(ids: impl IntoIterator<Item = DeviceId>) -> Result<Self, AllocatorError> {
        let mut ids: Vec<_> = ids.into_iter().collect();
        ids.sort_unstable();
        ids.dedup();
        if ids.is_empty() {
            return Err(AllocatorError::Empty);
        }

        let slots = vec![None; ids.len()];
        Ok(Self { ids, slots })
    }

    /// Constructs an allocator for devices numbered `0..count`.
    pub fn with_count(count: usize) -> Result<Self, AllocatorError> {
        let end = DeviceId::try_from(count).map_err(|_| AllocatorError::TooMany { count })?;
        Self::new(0..end)
    }

    /// Gets the number of devices in the pool.
    pub fn capacity(&self) -> usize {
        self.ids.len()
    }

    /// Gets the device ids in the pool, in ascending order.
    pub fn ids(&self) -> &[DeviceId] {
        &self.ids
    }

    /// Gets the number of bound devices.
    pub fn bound_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Gets the lowest-numbered device without a bound window.
    pub fn free_device(&self) -> Option<DeviceId> {
        self.ids
            .iter()
            .zip(&self.slots)
            .find(|(_, slot)| slot.is_none())
            .map(|(id, _)| *id)
    }

    /// Determines if the given device is part of the pool and unbound.
    pub fn is_free(&self, device: DeviceId) -> bool {
        self.slot(device).is_some_and(|i| self.slots[i].is_none())
    }

    /// Gets the window bound to the given device.
    pub fn bound_to(&self, device: DeviceId) -> Option<&WindowId> {
        self.slot(device).and_then(|i| self.slots[i].as_ref())
    }

    /// Binds a window to a device.
    pub fn bind(&mut self, device: DeviceId, window: WindowId) -> Result<(), AllocatorError> {
        let index = self
            .slot(device)
            .ok_or(AllocatorError::UnknownDevice { device })?;

        if let Some(existing) = &self.slots[index] {
            return Err(AllocatorError::Busy {
                device,
                window: existing.clone(),
            });
        }

        debug!(device, window = %window, "binding device");
        self.slots[index] = Some(window);
        Ok(())
    }

    /// Releases a device.
    ///
    /// Releasing an unbound or unknown device does nothing.
    pub fn release(&mut self, device: DeviceId) {
        if let Some(index) = self.slot(device)
            && let Some(window) = self.slots[index].take()
        {
            debug!(device, window = %window, "released device");
        }
    }

    /// Rebuilds every binding from the given active bindings.
    ///
    /// Fails without modifying the allocator if a binding names a device
    /// outside the pool or if two bindings name the same device.
    pub fn sync<'a>(
        &mut self,
        active: impl IntoIterator<Item = (DeviceId, &'a WindowId)>,
    ) -> Result<(), AllocatorError> {
        let mut slots: Vec<Option<WindowId>> = vec![None; self.ids.len()];
        for (device, window) in active {
            let index = self
                .slot(device)
                .ok_or(AllocatorError::UnknownDevice { device })?;

            if let Some(existing) = &slots[index] {
                return Err(AllocatorError::Busy {
                    device,
                    window: existing.clone(),
                });
            }

            slots[index] = Some(window.clone());
        }

        self.slots = slots;
        Ok(())
    }

    /// Gets the slot index of a device.
    fn slot(&self, device: DeviceId) -> Option<usize> {
        self.ids.binary_search(&device).ok()
    }
}

/// Detects the devices available to the scheduler.
///
/// If the device-selection variable is set and non-empty, its entries are the
/// devices; otherwise the devices listed by `nvidia-smi -L` are numbered from
/// zero.
pub fn detect_devices(var: &str) -> Result<Vec<DeviceId>, DetectError> {
    if let Some(value) = std::env::var_os(var) {
        let value = value.to_string_lossy();
        if !value.trim().is_empty() {
            let ids = parse_device_list(var, &value)?;
            debug!("detected {count} device(s) from `{var}`", count = ids.len());
            return Ok(ids);
        }
    }

    let count = match which::which("nvidia-smi") {
        Ok(path) => {
            let output = Command::new(path).arg("-L").output()?;
            count_listed_devices(&String::from_utf8_lossy(&output.stdout))
        }
        Err(_) => 0,
    };

    if count == 0 {
        return Err(DetectError::NoDevices {
            var: var.to_string(),
        });
    }

    debug!("detected {count} device(s) with `nvidia-smi`");
    numbered_devices(count)
}

/// Gets the device ids `0..count`.
pub(crate) fn numbered_devices(count: usize) -> Result<Vec<DeviceId>, DetectError> {
    let end = DeviceId::try_from(count).map_err(|_| DetectError::TooMany { count })?;
    Ok((0..end).collect())
}

/// Parses a comma-separated device list.
fn parse_device_list(var: &str, value: &str) -> Result<Vec<DeviceId>, DetectError> {
    let mut ids = value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<DeviceId>().map_err(|_| DetectError::NonNumeric {
                var: var.to_string(),
                value: s.to_string(),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    ids.sort_unstable();
    ids.dedup();
    if ids.is_empty() {
        return Err(DetectError::NoDevices {
            var: var.to_string(),
        });
    }

    Ok(ids)
}

/// Counts the devices listed in the output of `nvidia-smi -L`.
fn count_listed_devices(output: &str) -> usize {
    output
        .lines()
        .filter(|l| l.starts_with(NVIDIA_SMI_DEVICE_PREFIX))
        .count()
}
