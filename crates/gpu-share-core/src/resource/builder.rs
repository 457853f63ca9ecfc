//! Given a [`Configuration`] and the enumerated devices, produce a
//! [`ResourceMap`] or fail. Spec §4.2.

use super::{Resource, ResourceMap};
use crate::annotated_id::AnnotatedId;
use crate::config::{Configuration, DeviceSelector, PartitionStrategy, ReplicatedResource, ResourceRule};
use crate::device::enumerator::EnumeratedDevice;
use crate::device::Device;
use crate::error::CoreError;
use regex::Regex;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;

/// Builds the resource map from a configuration and a pre-enumerated device
/// list (the caller owns calling [`crate::device::enumerator::enumerate`]
/// against a [`crate::device::library::DeviceLibrary`] first, so build
/// failures and library failures can be told apart cleanly).
pub fn build(config: &Configuration, devices: Vec<EnumeratedDevice>) -> Result<ResourceMap, CoreError> {
    if config.partition_strategy == PartitionStrategy::Single {
        validate_uniform_partitioning(&devices)?;
    }

    let mut map: ResourceMap = BTreeMap::new();

    for entry in &devices {
        if entry.is_partition {
            continue;
        }
        if config.partition_strategy == PartitionStrategy::Single && entry.partitioning_enabled {
            // Under `single`, a device with partitioning enabled is
            // represented solely by its partition entries.
            continue;
        }
        assign(
            &mut map,
            &config.resources.gpus,
            entry,
            config.sharing_strategy,
        )?;
    }

    if config.partition_strategy != PartitionStrategy::None {
        for entry in &devices {
            if !entry.is_partition {
                continue;
            }
            assign(
                &mut map,
                &config.resources.migs,
                entry,
                config.sharing_strategy,
            )?;
        }
    }

    for replicated in &config.replicated_resources {
        apply_replication(&mut map, replicated, config.sharing_strategy)?;
    }

    validate_invariants(&map)?;

    Ok(map)
}

/// Verifies every physical device agrees on whether partitioning is
/// enabled, per spec §4.2 step 2's `MixedPartitionMode` rule.
fn validate_uniform_partitioning(devices: &[EnumeratedDevice]) -> Result<(), CoreError> {
    let mut states: HashMap<&str, bool> = HashMap::new();
    for entry in devices {
        if entry.is_partition {
            continue;
        }
        states.insert(entry.index.as_str(), entry.partitioning_enabled);
    }
    let mut values = states.values();
    let first = match values.next() {
        Some(v) => *v,
        None => return Ok(()),
    };
    if values.any(|v| *v != first) {
        return Err(CoreError::MixedPartitionMode(
            "devices disagree on whether hardware partitioning is enabled".to_string(),
        ));
    }
    Ok(())
}

fn assign(
    map: &mut ResourceMap,
    rules: &[ResourceRule],
    entry: &EnumeratedDevice,
    sharing_strategy: crate::config::SharingStrategy,
) -> Result<(), CoreError> {
    let rule = rules
        .iter()
        .find(|r| pattern_matches(&r.pattern, &entry.product_name))
        .ok_or_else(|| CoreError::UnmatchedDevice(entry.device.uuid().to_string()))?;

    let resource = map
        .entry(rule.name.clone())
        .or_insert_with(|| Resource::new(rule.name.clone(), sharing_strategy));
    resource.insert(AnnotatedId::whole(entry.device.uuid()), entry.device.clone());
    debug!(resource = %rule.name, uuid = %entry.device.uuid(), "assigned device to resource");
    Ok(())
}

/// Compiles a glob-style pattern (`*` matches any run of characters) into
/// an anchored regex and tests it against `name`.
fn pattern_matches(pattern: &str, name: &str) -> bool {
    let escaped = regex::escape(pattern).replace("\\*", ".*");
    match Regex::new(&format!("^{}$", escaped)) {
        Ok(re) => re.is_match(name),
        Err(_) => false,
    }
}

fn apply_replication(
    map: &mut ResourceMap,
    replicated: &ReplicatedResource,
    sharing_strategy: crate::config::SharingStrategy,
) -> Result<(), CoreError> {
    let base_ids = {
        let resource = map.get(&replicated.resource_name).ok_or_else(|| {
            CoreError::Configuration(format!(
                "replicated-resources entry names unknown resource {}",
                replicated.resource_name
            ))
        })?;
        resolve_selector(resource, &replicated.device_selector)?
    };

    let target_name = replicated
        .rename
        .clone()
        .unwrap_or_else(|| replicated.resource_name.clone());
    let renaming = replicated.rename.is_some();

    let mut moved: Vec<(AnnotatedId, Device)> = Vec::with_capacity(base_ids.len());
    {
        let source = map.get_mut(&replicated.resource_name).unwrap();
        for id in &base_ids {
            let device = source.remove(id).ok_or_else(|| {
                CoreError::Configuration(format!(
                    "device {} selected for replication vanished from resource {}",
                    id, replicated.resource_name
                ))
            })?;
            moved.push((id.clone(), device));
        }
    }

    let target = map
        .entry(target_name.clone())
        .or_insert_with(|| Resource::new(target_name.clone(), sharing_strategy));
    if replicated.fail_if_multi {
        target.fail_if_multi = true;
    }

    for (id, device) in moved {
        if replicated.replicas <= 1 {
            target.insert(AnnotatedId::whole(id.base()), device);
            continue;
        }
        for k in 0..replicated.replicas {
            target.insert(AnnotatedId::replica(id.base(), k), device.clone());
        }
    }

    if !renaming && target_name != replicated.resource_name {
        unreachable!("rename invariant");
    }

    Ok(())
}

/// Parses a device index (`"n"` or `"n:m"`) into a numeric sort key, so
/// physical device order is preserved instead of lexicographic string
/// order (which would place `"10"` before `"2"`).
fn numeric_index_key(index: &str) -> (u64, u64) {
    let mut parts = index.splitn(2, ':');
    let major = parts.next().and_then(|p| p.parse().ok()).unwrap_or(u64::MAX);
    let minor = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    (major, minor)
}

fn resolve_selector(
    resource: &Resource,
    selector: &DeviceSelector,
) -> Result<Vec<AnnotatedId>, CoreError> {
    let mut sorted: Vec<(&AnnotatedId, &Device)> = resource.devices().iter().collect();
    sorted.sort_by_key(|(_, d)| numeric_index_key(d.index()));

    match selector {
        DeviceSelector::All => Ok(sorted.into_iter().map(|(id, _)| id.clone()).collect()),
        DeviceSelector::FirstN(n) => {
            if *n > sorted.len() {
                return Err(CoreError::Configuration(format!(
                    "first-N selector requested {} devices but only {} available",
                    n,
                    sorted.len()
                )));
            }
            Ok(sorted
                .into_iter()
                .take(*n)
                .map(|(id, _)| id.clone())
                .collect())
        }
        DeviceSelector::Uuids(uuids) => {
            let known: HashSet<String> = sorted
                .iter()
                .map(|(_, d)| d.uuid().to_string())
                .collect();
            let missing = crate::device::missing_uuids(uuids, &known);
            if !missing.is_empty() {
                return Err(CoreError::Configuration(format!(
                    "explicit UUID selector names unknown device(s): {}",
                    missing.join(", ")
                )));
            }
            Ok(uuids.iter().map(|u| AnnotatedId::whole(u.clone())).collect())
        }
        DeviceSelector::Indices(indices) => {
            let by_index: HashMap<String, &AnnotatedId> = sorted
                .iter()
                .map(|(id, d)| (d.index().to_string(), *id))
                .collect();
            let mut out = Vec::with_capacity(indices.len());
            for i in indices {
                let key = i.to_string();
                let id = by_index.get(&key).ok_or_else(|| {
                    CoreError::Configuration(format!(
                        "explicit index selector names out-of-range device index {}",
                        i
                    ))
                })?;
                out.push((*id).clone());
            }
            Ok(out)
        }
    }
}

/// Checks spec §3 invariants (a) and (b): every AnnotatedId appears in
/// exactly one bucket (guaranteed by construction, since each bucket's
/// devices are keyed by AnnotatedId and moves are exclusive) and replica
/// suffixes for a given base device form a contiguous `[0, replicas)` run.
fn validate_invariants(map: &ResourceMap) -> Result<(), CoreError> {
    let mut replica_sets: HashMap<&str, HashSet<u32>> = HashMap::new();
    for resource in map.values() {
        for id in resource.devices().keys() {
            if let Some(r) = id.replica_index() {
                replica_sets.entry(id.base()).or_default().insert(r);
            }
        }
    }
    for (base, replicas) in replica_sets {
        let max = *replicas.iter().max().unwrap();
        for k in 0..=max {
            if !replicas.contains(&k) {
                return Err(CoreError::Configuration(format!(
                    "device {} is missing replica index {} (non-contiguous replica set)",
                    base, k
                )));
            }
        }
    }
    Ok(())
}
