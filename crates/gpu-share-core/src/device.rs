//! Device identity and health as seen by the resource map builder.

pub mod enumerator;
pub mod library;

use std::collections::HashSet;

/// Health of a device as last observed by the Health Monitor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Health {
    /// Allocatable.
    Healthy,
    /// Not allocatable; excluded from `preferred_allocation` availability
    /// sets by the (out-of-scope) plugin layer.
    Unhealthy,
}

/// A physical device or hardware partition as yielded by the Device
/// Enumerator. Immutable after enumeration except for `health`, which the
/// Health Monitor updates in place via [`Device::set_health`].
#[derive(Clone, Debug, PartialEq)]
pub struct Device {
    /// Vendor-assigned unique identifier.
    uuid: String,
    /// `"n"` for a whole device, `"n:m"` for partition `m` of device `n`.
    index: String,
    /// Device-node paths a container allocated this device must have
    /// bind-mounted.
    paths: Vec<String>,
    health: Health,
    /// NUMA node, when the topology is known.
    numa_node: Option<i32>,
    /// Total device memory, in bytes.
    total_memory_bytes: u64,
    /// e.g. `"7.5"`.
    compute_capability: String,
    /// The parent physical device's UUID, for a hardware partition. `None`
    /// for a whole device (its own UUID is the physical UUID).
    physical_uuid: Option<String>,
    /// GPU-instance minor number, for a hardware partition.
    partition_instance: Option<u32>,
    /// Compute-instance minor number, for a hardware partition.
    compute_instance: Option<u32>,
}

impl Device {
    /// Builds a new device record. Starts `Healthy`; the Health Monitor is
    /// the only thing that should ever flip this.
    pub fn new(
        uuid: impl Into<String>,
        index: impl Into<String>,
        paths: Vec<String>,
        numa_node: Option<i32>,
        total_memory_bytes: u64,
        compute_capability: impl Into<String>,
    ) -> Self {
        Device {
            uuid: uuid.into(),
            index: index.into(),
            paths,
            health: Health::Healthy,
            numa_node,
            total_memory_bytes,
            compute_capability: compute_capability.into(),
            physical_uuid: None,
            partition_instance: None,
            compute_instance: None,
        }
    }

    /// Marks this device as a hardware partition of `physical_uuid`,
    /// identified by the (partition-instance, compute-instance) pair the
    /// Health Monitor resolves vendor events against, per spec §4.5.
    pub fn with_partition_identity(
        mut self,
        physical_uuid: impl Into<String>,
        partition_instance: u32,
        compute_instance: u32,
    ) -> Self {
        self.physical_uuid = Some(physical_uuid.into());
        self.partition_instance = Some(partition_instance);
        self.compute_instance = Some(compute_instance);
        self
    }

    /// The physical device UUID: the parent's UUID for a hardware
    /// partition, or this device's own UUID otherwise.
    pub fn physical_uuid(&self) -> &str {
        self.physical_uuid.as_deref().unwrap_or(&self.uuid)
    }

    /// GPU-instance minor number, for a hardware partition.
    pub fn partition_instance(&self) -> Option<u32> {
        self.partition_instance
    }

    /// Compute-instance minor number, for a hardware partition.
    pub fn compute_instance(&self) -> Option<u32> {
        self.compute_instance
    }

    /// The vendor-assigned UUID.
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// `"n"` or `"n:m"`.
    pub fn index(&self) -> &str {
        &self.index
    }

    /// True if this is a hardware partition (index contains `:`) rather
    /// than a whole device.
    pub fn is_partition(&self) -> bool {
        self.index.contains(':')
    }

    /// The device-node paths required to use this device.
    pub fn paths(&self) -> &[String] {
        &self.paths
    }

    /// Current health.
    pub fn health(&self) -> Health {
        self.health
    }

    /// Updates health in place; called only by the Health Monitor.
    pub fn set_health(&mut self, health: Health) {
        self.health = health;
    }

    /// NUMA node, if known.
    pub fn numa_node(&self) -> Option<i32> {
        self.numa_node
    }

    /// Total device memory in bytes.
    pub fn total_memory_bytes(&self) -> u64 {
        self.total_memory_bytes
    }

    /// Compute-capability string, e.g. `"7.5"`.
    pub fn compute_capability(&self) -> &str {
        &self.compute_capability
    }

    /// Parses [`Device::compute_capability`] as a `(major, minor)` pair for
    /// comparison against the max-clients thresholds in spec §4.6. Falls
    /// back to `(0, 0)` if the string can't be parsed, which yields the
    /// more conservative (lower) client limit.
    pub fn compute_capability_value(&self) -> (u32, u32) {
        let mut parts = self.compute_capability.splitn(2, '.');
        let major = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
        let minor = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
        (major, minor)
    }
}

/// The maximum number of time-sharing/MPS clients supported at or above
/// compute capability 7.5, per spec §4.6.
pub const MAX_CLIENTS_HIGH_CAPABILITY: u32 = 48;
/// The maximum number of clients below compute capability 7.5.
pub const MAX_CLIENTS_LOW_CAPABILITY: u32 = 16;

/// The compute-capability threshold (major, minor) above which
/// [`MAX_CLIENTS_HIGH_CAPABILITY`] applies.
pub const HIGH_CAPABILITY_THRESHOLD: (u32, u32) = (7, 5);

/// Returns the maximum number of replicas this device's compute capability
/// supports, per spec §4.6's `InvalidReplicaCount` rule.
pub fn max_clients_for(device: &Device) -> u32 {
    if device.compute_capability_value() >= HIGH_CAPABILITY_THRESHOLD {
        MAX_CLIENTS_HIGH_CAPABILITY
    } else {
        MAX_CLIENTS_LOW_CAPABILITY
    }
}

/// Returns the subset of `uuids` that are not present in `known`.
pub fn missing_uuids<'a>(uuids: &'a [String], known: &HashSet<String>) -> Vec<&'a str> {
    uuids
        .iter()
        .filter(|u| !known.contains(u.as_str()))
        .map(String::as_str)
        .collect()
}
