//! Device discovery and capability reporting.

use std::fmt::Write as _;

use crate::driver::{DeviceAttributes, Driver, DriverError};
use crate::logging::human_size;
use crate::module::Architecture;

/// Lowest compute capability the kernels support.
pub const MIN_COMPUTE_MAJOR: u32 = 2;

/// Lowest compute capability with bindless textures.
pub const BINDLESS_COMPUTE_MAJOR: u32 = 3;

/// A usable device as presented to the renderer.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInfo {
    /// Driver ordinal.
    pub num: usize,
    /// Stable id derived from the PCI location.
    pub id: String,
    pub description: String,
    /// The device drives a display and is subject to a watchdog.
    pub display_device: bool,
    pub has_bindless_textures: bool,
    pub architecture: Architecture,
}

impl DeviceInfo {
    pub fn from_attributes(num: usize, attrs: &DeviceAttributes) -> Self {
        let display_device = attrs.kernel_exec_timeout && !attrs.compute_preemption;
        let description = if display_device {
            format!("{} (Display)", attrs.name)
        } else {
            attrs.name.clone()
        };

        Self {
            num,
            id: format!(
                "GPU_{}_{:04x}:{:02x}:{:02x}",
                attrs.name, attrs.pci_domain, attrs.pci_bus, attrs.pci_device
            ),
            description,
            display_device,
            has_bindless_textures: attrs.compute_major >= BINDLESS_COMPUTE_MAJOR,
            architecture: Architecture::new(attrs.compute_major, attrs.compute_minor),
        }
    }
}

/// Usable devices, display devices last.
///
/// Devices below compute capability 2.0 are skipped, as are devices whose
/// attributes cannot be queried.
pub fn enumerate_devices(driver: &dyn Driver) -> Result<Vec<DeviceInfo>, DriverError> {
    let count = driver.device_count()?;
    let mut devices = Vec::with_capacity(count);
    let mut display_devices = Vec::new();

    for num in 0..count {
        let attrs = match driver.device_attributes(num) {
            Ok(attrs) => attrs,
            Err(e) => {
                log::warn!("skipping device {num}: {e}");
                continue;
            }
        };
        if attrs.compute_major < MIN_COMPUTE_MAJOR {
            log::info!(
                "skipping device {num} ({}): compute capability {}.{} is not supported",
                attrs.name,
                attrs.compute_major,
                attrs.compute_minor
            );
            continue;
        }

        let info = DeviceInfo::from_attributes(num, &attrs);
        log::info!("found device {}: {}", info.id, info.description);
        if info.display_device {
            display_devices.push(info);
        } else {
            devices.push(info);
        }
    }

    devices.extend(display_devices);
    Ok(devices)
}

/// Human-readable attribute dump of every device.
pub fn capabilities_report(driver: &dyn Driver) -> Result<String, DriverError> {
    let count = driver.device_count()?;
    let mut report = String::new();

    for num in 0..count {
        let attrs = driver.device_attributes(num)?;
        let _ = writeln!(report, "{}", attrs.name);
        let rows: [(&str, String); 12] = [
            ("Compute capability", format!("{}.{}", attrs.compute_major, attrs.compute_minor)),
            (
                "PCI location",
                format!("{:04x}:{:02x}:{:02x}", attrs.pci_domain, attrs.pci_bus, attrs.pci_device),
            ),
            ("Multiprocessors", attrs.multiprocessor_count.to_string()),
            ("Max threads per block", attrs.max_threads_per_block.to_string()),
            ("Warp size", attrs.warp_size.to_string()),
            ("Shared memory per block", human_size(attrs.max_shared_memory_per_block)),
            ("Clock rate", format!("{} MHz", attrs.clock_rate_khz / 1000)),
            ("Total memory", human_size(attrs.total_memory)),
            ("Kernel exec timeout", yes_no(attrs.kernel_exec_timeout)),
            ("Compute preemption", yes_no(attrs.compute_preemption)),
            ("Bindless textures", yes_no(attrs.compute_major >= BINDLESS_COMPUTE_MAJOR)),
            ("Supported", yes_no(attrs.compute_major >= MIN_COMPUTE_MAJOR)),
        ];
        for (label, value) in rows {
            let _ = writeln!(report, "\t{label:<26}{value}");
        }
        report.push('\n');
    }

    Ok(report)
}

fn yes_no(value: bool) -> String {
    if value { "yes" } else { "no" }.to_string()
}
