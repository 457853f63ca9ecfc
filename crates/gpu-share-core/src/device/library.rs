//! Abstraction over the vendor device library (explicitly out of scope to
//! implement — spec §1). The Device Enumerator is generic over this trait
//! so construction and test code never depend on the real FFI binding.

use crate::error::CoreError;

/// Raw attributes of a whole physical device, as reported by the vendor
/// library before the Device Enumerator turns it into a [`crate::device::Device`].
#[derive(Clone, Debug)]
pub struct RawDeviceInfo {
    /// Vendor-assigned UUID.
    pub uuid: String,
    /// Product name, matched against `resources` pattern rules.
    pub product_name: String,
    /// Device-node paths (e.g. `/dev/nvidia0`).
    pub paths: Vec<String>,
    pub numa_node: Option<i32>,
    pub total_memory_bytes: u64,
    pub compute_capability: String,
    /// Whether hardware partitioning (MIG) is enabled on this device.
    pub partitioning_enabled: bool,
}

/// Raw attributes of a hardware partition of a physical device.
#[derive(Clone, Debug)]
pub struct RawPartitionInfo {
    /// Vendor-assigned UUID for the partition (distinct from the parent
    /// device's UUID).
    pub uuid: String,
    /// Partition profile name (e.g. `"1g.5gb"`), matched against MIG
    /// pattern rules.
    pub profile_name: String,
    /// The partition's own minor number, used to look up its two
    /// capability device-node paths under
    /// `/proc/driver/<vendor>-caps/<partition-minors>`.
    pub gi_minor: u32,
    pub ci_minor: u32,
    pub total_memory_bytes: u64,
    pub compute_capability: String,
}

/// The vendor device library interface: enumeration and query only. Event
/// subscription for the Health Monitor lives on [`crate::health::EventBus`]
/// as a separate, narrower trait, mirroring how `spec.md` §2 lists Device
/// Enumerator and Health Monitor as separate leaf components sharing one
/// underlying handle.
pub trait DeviceLibrary: Send + Sync {
    /// Number of physical devices visible to this process.
    fn device_count(&self) -> Result<usize, CoreError>;

    /// Attributes of physical device `index`.
    fn device_info(&self, index: usize) -> Result<RawDeviceInfo, CoreError>;

    /// Hardware partitions of physical device `index`, if partitioning is
    /// enabled on it. Empty if not.
    fn partitions(&self, index: usize) -> Result<Vec<RawPartitionInfo>, CoreError>;

    /// Reads the kernel-exported mapping from partition minor numbers to
    /// capability device-node paths under
    /// `/proc/driver/<vendor>-caps/<partition-minors>`. Returns the two
    /// paths (gi then ci) for the given minors.
    fn capability_paths(&self, gi_minor: u32, ci_minor: u32) -> Result<[String; 2], CoreError>;

    /// Sets compute mode for the device with the given UUID. `exclusive`
    /// selects `EXCLUSIVE_PROCESS` mode; `!exclusive` restores `DEFAULT`.
    fn set_compute_mode(&self, uuid: &str, exclusive: bool) -> Result<(), CoreError>;
}

/// An in-memory [`DeviceLibrary`] used by tests and by the Fake device
/// library's `fail-on-init-error: false` path. Mirrors the teacher's
/// `MockDevicePlugin` test-fake pattern.
#[derive(Clone, Debug, Default)]
pub struct FakeDeviceLibrary {
    pub devices: Vec<RawDeviceInfo>,
    pub partitions: std::collections::HashMap<usize, Vec<RawPartitionInfo>>,
}

impl FakeDeviceLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_device(mut self, device: RawDeviceInfo) -> Self {
        self.devices.push(device);
        self
    }

    pub fn with_partitions(mut self, index: usize, partitions: Vec<RawPartitionInfo>) -> Self {
        self.partitions.insert(index, partitions);
        self
    }
}

impl DeviceLibrary for FakeDeviceLibrary {
    fn device_count(&self) -> Result<usize, CoreError> {
        Ok(self.devices.len())
    }

    fn device_info(&self, index: usize) -> Result<RawDeviceInfo, CoreError> {
        self.devices
            .get(index)
            .cloned()
            .ok_or_else(|| CoreError::DeviceDiscovery(format!("no device at index {}", index)))
    }

    fn partitions(&self, index: usize) -> Result<Vec<RawPartitionInfo>, CoreError> {
        Ok(self.partitions.get(&index).cloned().unwrap_or_default())
    }

    fn capability_paths(&self, gi_minor: u32, ci_minor: u32) -> Result<[String; 2], CoreError> {
        Ok([
            format!("/dev/nvidia-caps/nvidia-cap{}", gi_minor),
            format!("/dev/nvidia-caps/nvidia-cap{}", ci_minor),
        ])
    }

    fn set_compute_mode(&self, _uuid: &str, _exclusive: bool) -> Result<(), CoreError> {
        Ok(())
    }
}
