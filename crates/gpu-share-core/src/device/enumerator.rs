//! Wraps a [`DeviceLibrary`] and yields `(index, Device)` pairs, expanding
//! hardware partitions when enabled. Spec §4.1.

use super::library::DeviceLibrary;
use super::Device;
use crate::config::PartitionStrategy;
use crate::error::CoreError;
use tracing::{debug, trace};

/// An enumerated device paired with its resource-map index (`"n"` or
/// `"n:m"`).
#[derive(Clone, Debug)]
pub struct EnumeratedDevice {
    pub index: String,
    pub device: Device,
    /// True if `device` is a hardware partition rather than a whole
    /// device.
    pub is_partition: bool,
    /// Product name (whole device) or partition profile name, matched
    /// against the configuration's resource pattern rules.
    pub product_name: String,
    /// True if the physical device this entry belongs to has hardware
    /// partitioning enabled (set on both the whole-device entry and any
    /// partition entries derived from it).
    pub partitioning_enabled: bool,
}

/// Enumerates all devices (and, if requested, their hardware partitions)
/// visible through `library`.
///
/// If a partition's capability-minor mapping can't be read, the whole
/// build fails with [`CoreError::DeviceDiscovery`], per spec §4.1.
pub fn enumerate(
    library: &dyn DeviceLibrary,
    partition_strategy: PartitionStrategy,
) -> Result<Vec<EnumeratedDevice>, CoreError> {
    let count = library.device_count()?;
    let mut out = Vec::with_capacity(count);

    for i in 0..count {
        let raw = library
            .device_info(i)
            .map_err(|e| wrap_query_error(i, e))?;
        trace!(index = i, uuid = %raw.uuid, "enumerated physical device");

        let device = Device::new(
            raw.uuid.clone(),
            i.to_string(),
            raw.paths.clone(),
            raw.numa_node,
            raw.total_memory_bytes,
            raw.compute_capability.clone(),
        );
        out.push(EnumeratedDevice {
            index: i.to_string(),
            device,
            is_partition: false,
            product_name: raw.product_name.clone(),
            partitioning_enabled: raw.partitioning_enabled,
        });

        if partition_strategy == PartitionStrategy::None || !raw.partitioning_enabled {
            continue;
        }

        let partitions = library.partitions(i)?;
        for partition in partitions {
            let caps = library
                .capability_paths(partition.gi_minor, partition.ci_minor)
                .map_err(|_| {
                    CoreError::DeviceDiscovery(format!(
                        "could not read partition-minor capability mapping for device {} partition {}",
                        raw.uuid, partition.uuid
                    ))
                })?;

            let mut paths = vec![raw.paths.first().cloned().unwrap_or_default()];
            paths.extend(caps.into_iter());

            let partition_index = format!("{}:{}", i, partition.gi_minor);
            debug!(index = %partition_index, uuid = %partition.uuid, "enumerated hardware partition");

            let device = Device::new(
                partition.uuid.clone(),
                partition_index.clone(),
                paths,
                None,
                partition.total_memory_bytes,
                partition.compute_capability.clone(),
            )
            .with_partition_identity(raw.uuid.clone(), partition.gi_minor, partition.ci_minor);
            out.push(EnumeratedDevice {
                index: partition_index,
                device,
                is_partition: true,
                product_name: partition.profile_name.clone(),
                partitioning_enabled: true,
            });
        }
    }

    Ok(out)
}

fn wrap_query_error(index: usize, err: CoreError) -> CoreError {
    match err {
        CoreError::DeviceDiscovery(_) | CoreError::LibraryUnavailable(_) => err,
        other => CoreError::DeviceQuery {
            uuid: index.to_string(),
            source: anyhow::anyhow!(other),
        },
    }
}
