//! Three allocation policies behind one interface (spec §4.3). Policy
//! selection happens once per call in [`preferred_allocation`]; the
//! per-iteration sort that both the packed and distributed policies share
//! reduces to comparing one scalar (the count of replicas of the same base
//! device already chosen), per the design note in spec §9.

pub mod distributed;
pub mod packed;

use crate::annotated_id::AnnotatedId;
use crate::config::AllocationPolicy;
use crate::error::CoreError;
use crate::resource::Resource;
use std::collections::{HashMap, HashSet};

/// External collaborator that knows device interconnect topology (NVLink,
/// PCIe switch locality, etc). Out of scope to implement for real — spec
/// §4.3 calls this out as an external collaborator the aligned policy
/// delegates to.
pub trait Topology: Send + Sync {
    /// Returns the best-connected subset of `size` devices from
    /// `available`, including every element of `required`.
    fn best_connected(
        &self,
        available: &[AnnotatedId],
        required: &[AnnotatedId],
        size: usize,
    ) -> Vec<AnnotatedId>;
}

/// A [`Topology`] with no actual link-locality knowledge: it satisfies the
/// aligned policy's contract (includes `required`, subset of `available`,
/// correct length) by taking lexicographically-smallest candidates. Used
/// when no real topology collaborator is wired in, and in tests.
#[derive(Default)]
pub struct FlatTopology;

impl Topology for FlatTopology {
    fn best_connected(
        &self,
        available: &[AnnotatedId],
        required: &[AnnotatedId],
        size: usize,
    ) -> Vec<AnnotatedId> {
        let required_set: HashSet<&AnnotatedId> = required.iter().collect();
        let mut candidates: Vec<AnnotatedId> = available
            .iter()
            .filter(|id| !required_set.contains(id))
            .cloned()
            .collect();
        candidates.sort();
        let mut chosen = required.to_vec();
        chosen.extend(candidates.into_iter().take(size.saturating_sub(chosen.len())));
        chosen
    }
}

/// `preferred_allocation(available, required, size) -> list`, spec §4.3.
/// `required ⊆ available` and `|required| ≤ size` are preconditions of the
/// (out-of-scope) plugin layer; this function still defends against
/// `size > |available|`.
pub fn preferred_allocation(
    resource: &Resource,
    topology: &dyn Topology,
    policy: AllocationPolicy,
    available: &[AnnotatedId],
    required: &[AnnotatedId],
    size: usize,
) -> Result<Vec<AnnotatedId>, CoreError> {
    if size > available.len() {
        return Err(CoreError::InsufficientDevices {
            requested: size,
            available: available.len(),
        });
    }

    if is_aligned_eligible(resource, available) {
        return Ok(topology.best_connected(available, required, size));
    }

    match policy {
        AllocationPolicy::Packed => Ok(packed::select(available, required, size)),
        AllocationPolicy::Distributed | AllocationPolicy::Aligned => {
            Ok(distributed::select(available, required, size))
        }
    }
}

/// The aligned policy applies only when every candidate is a whole,
/// non-partitioned device with no replica suffix (spec §4.3 step 1).
fn is_aligned_eligible(resource: &Resource, available: &[AnnotatedId]) -> bool {
    available.iter().all(|id| {
        !id.is_annotated()
            && resource
                .devices()
                .get(id)
                .map(|d| !d.is_partition())
                .unwrap_or(true)
    })
}

/// Shared selection loop for the packed and distributed policies: picks one
/// candidate at a time, ranking by the count of replicas already chosen
/// from the same base device (ascending for distributed, descending for
/// packed), breaking ties lexicographically by [`AnnotatedId`].
pub(crate) fn rank_select(
    available: &[AnnotatedId],
    required: &[AnnotatedId],
    size: usize,
    prefer_fewer_from_same_base: bool,
) -> Vec<AnnotatedId> {
    let required_set: HashSet<&AnnotatedId> = required.iter().collect();
    let mut candidates: Vec<AnnotatedId> = available
        .iter()
        .filter(|id| !required_set.contains(id))
        .cloned()
        .collect();

    let mut chosen: Vec<AnnotatedId> = required.to_vec();
    let mut counts: HashMap<String, usize> = HashMap::new();
    for id in &chosen {
        *counts.entry(id.base().to_string()).or_insert(0) += 1;
    }

    while chosen.len() < size && !candidates.is_empty() {
        candidates.sort_by(|a, b| {
            let ca = *counts.get(a.base()).unwrap_or(&0);
            let cb = *counts.get(b.base()).unwrap_or(&0);
            let by_count = if prefer_fewer_from_same_base {
                ca.cmp(&cb)
            } else {
                cb.cmp(&ca)
            };
            by_count.then_with(|| a.cmp(b))
        });
        let next = candidates.remove(0);
        *counts.entry(next.base().to_string()).or_insert(0) += 1;
        chosen.push(next);
    }

    chosen
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SharingStrategy;
    use crate::device::Device;

    fn resource_with_replicas(base_uuids: &[&str], replicas: u32) -> Resource {
        let mut resource = Resource::new("gpu", SharingStrategy::TimeSlicing);
        for uuid in base_uuids {
            for k in 0..replicas {
                let device = Device::new(*uuid, "0", vec![], None, 0, "7.5");
                resource.insert(AnnotatedId::replica(*uuid, k), device);
            }
        }
        resource
    }

    fn all_ids(resource: &Resource) -> Vec<AnnotatedId> {
        resource.devices().keys().cloned().collect()
    }

    #[test]
    fn result_always_has_required_length_and_contains_required() {
        let resource = resource_with_replicas(&["GPU-A", "GPU-B"], 4);
        let available = all_ids(&resource);
        let required = vec![available[0].clone()];
        let result = preferred_allocation(
            &resource,
            &FlatTopology,
            AllocationPolicy::Distributed,
            &available,
            &required,
            3,
        )
        .unwrap();
        assert_eq!(result.len(), 3);
        assert!(result.contains(&required[0]));
        for id in &result {
            assert!(available.contains(id));
        }
    }

    #[test]
    fn insufficient_devices_is_an_error() {
        let resource = resource_with_replicas(&["GPU-A"], 2);
        let available = all_ids(&resource);
        let err = preferred_allocation(
            &resource,
            &FlatTopology,
            AllocationPolicy::Distributed,
            &available,
            &[],
            5,
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::InsufficientDevices { .. }));
    }

    #[test]
    fn whole_unreplicated_devices_use_aligned_policy_via_topology() {
        let mut resource = Resource::new("gpu", SharingStrategy::None);
        resource.insert(AnnotatedId::whole("GPU-A"), Device::new("GPU-A", "0", vec![], None, 0, "7.5"));
        resource.insert(AnnotatedId::whole("GPU-B"), Device::new("GPU-B", "1", vec![], None, 0, "7.5"));
        let available = all_ids(&resource);
        let result = preferred_allocation(
            &resource,
            &FlatTopology,
            AllocationPolicy::Distributed,
            &available,
            &[],
            1,
        )
        .unwrap();
        assert_eq!(result.len(), 1);
    }
}
