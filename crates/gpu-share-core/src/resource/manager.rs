//! Per-resource-name object exposing allocation, validation, and health
//! monitoring. Spec §4.4. One instance is built per entry of the resource
//! map; the Signal Loop owns the set (spec §5).

use super::Resource;
use crate::allocator::{self, Topology};
use crate::annotated_id::AnnotatedId;
use crate::config::{AllocationPolicy, HealthConfig, SharingStrategy};
use crate::error::CoreError;
use crate::health::{self, EventBus, HealthEvent, NoPeriodicChecks, PeriodicChecks};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// Builds the vendor event-bus subscription and periodic-check collaborator
/// for a resource's watched devices. External collaborator — out of scope
/// to implement for real; spec §4.5 names the event bus itself as external.
pub trait HealthCollaborators: Send + Sync {
    fn event_bus(&self, uuids: &[String]) -> Box<dyn EventBus>;
    fn periodic_checks(&self, uuids: &[String]) -> Box<dyn PeriodicChecks> {
        let _ = uuids;
        Box::new(NoPeriodicChecks)
    }
}

/// Control device-node paths required by any allocation from this
/// resource, regardless of which devices were chosen, per spec §4.4.
const CONTROL_PATHS: &[&str] = &["/dev/nvidiactl", "/dev/nvidia-uvm", "/dev/nvidia-uvm-tools"];

/// A resource bucket plus the allocation policy and topology collaborator
/// used to serve `preferred_allocation` for it.
pub struct ResourceManager {
    resource: Arc<Resource>,
    policy: AllocationPolicy,
    topology: Arc<dyn Topology>,
    health_config: HealthConfig,
    health_collaborators: Arc<dyn HealthCollaborators>,
}

impl ResourceManager {
    pub fn new(
        resource: Resource,
        policy: AllocationPolicy,
        topology: Arc<dyn Topology>,
        health_config: HealthConfig,
        health_collaborators: Arc<dyn HealthCollaborators>,
    ) -> Self {
        ResourceManager {
            resource: Arc::new(resource),
            policy,
            topology,
            health_config,
            health_collaborators,
        }
    }

    /// The resource name, e.g. `"gpu"` or `"mig-1g.5gb"`.
    pub fn name(&self) -> &str {
        self.resource.name()
    }

    /// An immutable snapshot of this resource's devices.
    pub fn devices(&self) -> Arc<Resource> {
        self.resource.clone()
    }

    /// The union of device-node paths for `ids`, plus the fixed control
    /// paths every allocation needs.
    pub fn device_paths(&self, ids: &[AnnotatedId]) -> Result<Vec<String>, CoreError> {
        self.validate_known(ids)?;
        let mut paths: Vec<String> = CONTROL_PATHS.iter().map(|p| p.to_string()).collect();
        for id in ids {
            if let Some(device) = self.resource.devices().get(id) {
                for path in device.paths() {
                    if !paths.contains(path) {
                        paths.push(path.clone());
                    }
                }
            }
        }
        Ok(paths)
    }

    /// Spec §4.3's `preferred_allocation`.
    pub fn preferred_allocation(
        &self,
        available: &[AnnotatedId],
        required: &[AnnotatedId],
        size: usize,
    ) -> Result<Vec<AnnotatedId>, CoreError> {
        allocator::preferred_allocation(
            &self.resource,
            self.topology.as_ref(),
            self.policy,
            available,
            required,
            size,
        )
    }

    /// Rejects unknown IDs; enforces the time-slicing `fail-if-multi` rule
    /// and the shared-server single-device-per-request rule, per spec
    /// §4.4.
    pub fn validate_request(&self, ids: &[AnnotatedId]) -> Result<(), CoreError> {
        self.validate_known(ids)?;

        match self.resource.sharing_strategy() {
            SharingStrategy::TimeSlicing if self.resource.fail_if_multi() => {
                if ids.len() > 1 && AnnotatedId::any_annotated(ids) {
                    return Err(CoreError::Configuration(format!(
                        "resource {} forbids multi-replica requests (fail-if-multi)",
                        self.name()
                    )));
                }
            }
            SharingStrategy::SharedServer => {
                if ids.len() > 1 && AnnotatedId::any_annotated(ids) {
                    return Err(CoreError::Configuration(format!(
                        "resource {} (shared-server) only allows one annotated device per request",
                        self.name()
                    )));
                }
            }
            _ => {}
        }

        Ok(())
    }

    fn validate_known(&self, ids: &[AnnotatedId]) -> Result<(), CoreError> {
        let devices = self.resource.devices();
        for id in ids {
            if !devices.contains_key(id) {
                return Err(CoreError::Configuration(format!(
                    "unknown device id {} requested from resource {}",
                    id,
                    self.name()
                )));
            }
        }
        Ok(())
    }

    /// Runs the Health Monitor's polling loop for this resource's devices
    /// until `stop` fires. Blocking/long-running — callers spawn this on
    /// its own task, per spec §5.
    pub async fn check_health(
        &self,
        stop: watch::Receiver<bool>,
        unhealthy_sink: mpsc::Sender<HealthEvent>,
    ) {
        let devices: BTreeMap<AnnotatedId, crate::device::Device> =
            self.resource.devices().clone();
        let uuids: Vec<String> = devices.values().map(|d| d.uuid().to_string()).collect();
        let event_bus = self.health_collaborators.event_bus(&uuids);
        let periodic = self.health_collaborators.periodic_checks(&uuids);
        health::monitor(
            devices,
            self.health_config.clone(),
            event_bus,
            periodic,
            stop,
            unhealthy_sink,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::FlatTopology;
    use crate::config::{CriticalEventPolicy, SharingStrategy};
    use crate::device::Device;
    use crate::health::EventOutcome;

    struct NoEventsBus;
    #[async_trait::async_trait]
    impl EventBus for NoEventsBus {
        async fn wait_event(&mut self, _timeout: std::time::Duration) -> EventOutcome {
            // Actually yields, so the stop signal can be observed promptly
            // instead of the fake resolving in a tight loop.
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            EventOutcome::Timeout
        }
    }

    struct TestCollaborators;
    impl HealthCollaborators for TestCollaborators {
        fn event_bus(&self, _uuids: &[String]) -> Box<dyn EventBus> {
            Box::new(NoEventsBus)
        }
    }

    fn manager(sharing: SharingStrategy, fail_if_multi: bool) -> ResourceManager {
        let mut resource = Resource::new("gpu", sharing);
        resource.insert(
            AnnotatedId::replica("GPU-A", 0),
            Device::new("GPU-A", "0", vec!["/dev/GPU-A".to_string()], None, 0, "7.5"),
        );
        resource.insert(
            AnnotatedId::replica("GPU-A", 1),
            Device::new("GPU-A", "0", vec!["/dev/GPU-A".to_string()], None, 0, "7.5"),
        );
        resource.fail_if_multi = fail_if_multi;
        ResourceManager::new(
            resource,
            AllocationPolicy::Distributed,
            Arc::new(FlatTopology),
            HealthConfig {
                disabled: false,
                ignored_event_codes: vec![],
                critical_events: CriticalEventPolicy::All,
            },
            Arc::new(TestCollaborators),
        )
    }

    #[test]
    fn device_paths_includes_control_paths_and_device_paths() {
        let mgr = manager(SharingStrategy::None, false);
        let ids = vec![AnnotatedId::replica("GPU-A", 0)];
        let paths = mgr.device_paths(&ids).unwrap();
        assert!(paths.contains(&"/dev/nvidiactl".to_string()));
        assert!(paths.contains(&"/dev/GPU-A".to_string()));
    }

    #[test]
    fn device_paths_rejects_unknown_id() {
        let mgr = manager(SharingStrategy::None, false);
        let ids = vec![AnnotatedId::whole("GPU-Z")];
        assert!(mgr.device_paths(&ids).is_err());
    }

    #[test]
    fn fail_if_multi_rejects_multi_replica_request() {
        let mgr = manager(SharingStrategy::TimeSlicing, true);
        let ids = vec![AnnotatedId::replica("GPU-A", 0), AnnotatedId::replica("GPU-A", 1)];
        assert!(mgr.validate_request(&ids).is_err());
    }

    #[test]
    fn shared_server_rejects_multi_replica_request_unconditionally() {
        let mgr = manager(SharingStrategy::SharedServer, false);
        let ids = vec![AnnotatedId::replica("GPU-A", 0), AnnotatedId::replica("GPU-A", 1)];
        assert!(mgr.validate_request(&ids).is_err());
    }

    #[test]
    fn plain_time_slicing_without_fail_if_multi_allows_multi_replica() {
        let mgr = manager(SharingStrategy::TimeSlicing, false);
        let ids = vec![AnnotatedId::replica("GPU-A", 0), AnnotatedId::replica("GPU-A", 1)];
        assert!(mgr.validate_request(&ids).is_ok());
    }

    #[tokio::test]
    async fn check_health_terminates_promptly_on_stop() {
        let mgr = manager(SharingStrategy::None, false);
        let (stop_tx, stop_rx) = watch::channel(false);
        let (sink_tx, _sink_rx) = mpsc::channel(4);
        let handle = tokio::spawn(async move {
            mgr.check_health(stop_rx, sink_tx).await;
        });
        stop_tx.send(true).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
