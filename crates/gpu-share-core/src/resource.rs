//! A named bucket of devices and the mapping from resource name to bucket.
//! Spec §3.

pub mod builder;
pub mod manager;

use crate::annotated_id::AnnotatedId;
use crate::config::SharingStrategy;
use crate::device::Device;
use std::collections::BTreeMap;

/// A named bucket of devices sharing one sharing-strategy, keyed by
/// [`AnnotatedId`].
#[derive(Clone, Debug)]
pub struct Resource {
    name: String,
    devices: BTreeMap<AnnotatedId, Device>,
    sharing_strategy: SharingStrategy,
    /// Set when this resource was populated by a `replicated-resources`
    /// entry with `fail-if-multi: true`; consulted by
    /// [`manager::ResourceManager::validate_request`].
    pub(crate) fail_if_multi: bool,
}

impl Resource {
    pub fn new(name: impl Into<String>, sharing_strategy: SharingStrategy) -> Self {
        Resource {
            name: name.into(),
            devices: BTreeMap::new(),
            sharing_strategy,
            fail_if_multi: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sharing_strategy(&self) -> SharingStrategy {
        self.sharing_strategy
    }

    pub fn devices(&self) -> &BTreeMap<AnnotatedId, Device> {
        &self.devices
    }

    pub fn insert(&mut self, id: AnnotatedId, device: Device) {
        self.devices.insert(id, device);
    }

    pub fn remove(&mut self, id: &AnnotatedId) -> Option<Device> {
        self.devices.remove(id)
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Whether this resource's replicated-resources rule set
    /// `fail-if-multi: true`.
    pub fn fail_if_multi(&self) -> bool {
        self.fail_if_multi
    }

    /// True if every device in this bucket is a whole (non-partitioned)
    /// device and none carry a replica suffix — the condition that selects
    /// the aligned allocation policy, per spec §4.3.
    pub fn is_whole_and_unreplicated(&self) -> bool {
        self.devices
            .iter()
            .all(|(id, device)| !id.is_annotated() && !device.is_partition())
    }
}

/// Mapping from resource name to [`Resource`]. Spec §3 invariants:
/// (a) every [`AnnotatedId`] appears in exactly one bucket;
/// (b) replica suffix `::k` for device `d` appears exactly once per `k` in
///     `[0, replicas)`;
/// (c) under `partition-strategy: single`, whole-device and partition
///     entries are never mixed in the same map.
pub type ResourceMap = BTreeMap<String, Resource>;
