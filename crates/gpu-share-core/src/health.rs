//! Subscribes to the vendor event bus and classifies events against the
//! configured ignore list and critical-event policy. Spec §4.5.

use crate::config::{CriticalEventPolicy, HealthConfig};
use crate::device::Device;
use crate::annotated_id::AnnotatedId;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

/// How long the event-bus wait blocks before the polling loop checks the
/// stop channel again, per spec §4.5.
pub const POLL_TIMEOUT: Duration = Duration::from_secs(5);

/// Consecutive transport failures before every watched device is marked
/// unhealthy, per spec §4.5.
pub const CONSECUTIVE_FAILURE_THRESHOLD: u32 = 3;

/// A device marked unhealthy by the monitor, with the reason for the
/// sink to log or act on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HealthEvent {
    pub uuid: String,
    pub reason: String,
}

/// One event read off the vendor event bus.
#[derive(Clone, Debug)]
pub struct VendorEvent {
    /// Event/Xid code.
    pub code: u32,
    /// Physical device UUID the event pertains to, if the vendor library
    /// could resolve it. For a MIG-scoped event this is the parent
    /// physical device's UUID, not a partition's own UUID.
    pub uuid: Option<String>,
    /// GPU-instance minor number, when the event is scoped to a hardware
    /// partition of `uuid`.
    pub partition_instance: Option<u32>,
    /// Compute-instance minor number, when the event is scoped to a
    /// hardware partition of `uuid`.
    pub compute_instance: Option<u32>,
}

/// Outcome of one wait on the vendor event bus.
pub enum EventOutcome {
    Timeout,
    TransportFailure,
    Event(VendorEvent),
}

/// The vendor event bus subscription, scoped to a set of device UUIDs.
/// External collaborator — out of scope to implement for real.
#[async_trait]
pub trait EventBus: Send {
    /// Waits up to `timeout` for the next event.
    async fn wait_event(&mut self, timeout: Duration) -> EventOutcome;
}

/// Periodic (once-per-cycle) device checks beyond event-bus classification:
/// row-remap pending, retired-page pending, and temperature threshold.
/// External collaborator — out of scope to implement for real.
#[async_trait]
pub trait PeriodicChecks: Send {
    /// Returns a reason string for each device currently failing a
    /// periodic check.
    async fn check(&mut self, uuids: &[String]) -> Vec<HealthEvent>;
}

/// A [`PeriodicChecks`] that never reports anything; used when the vendor
/// library doesn't support the periodic checks on this device class.
#[derive(Default)]
pub struct NoPeriodicChecks;

#[async_trait]
impl PeriodicChecks for NoPeriodicChecks {
    async fn check(&mut self, _uuids: &[String]) -> Vec<HealthEvent> {
        Vec::new()
    }
}

/// Runs the polling loop described in spec §4.5 until `stop` fires.
/// Filters per-device registration to the UUIDs present in `devices`
/// (an unsupported device is marked unhealthy once and dropped from the
/// watch set, handled by the caller before invoking this with a narrowed
/// `devices` map).
pub async fn monitor(
    devices: BTreeMap<AnnotatedId, Device>,
    config: HealthConfig,
    mut event_bus: Box<dyn EventBus>,
    mut periodic: Box<dyn PeriodicChecks>,
    mut stop: watch::Receiver<bool>,
    sink: mpsc::Sender<HealthEvent>,
) {
    if config.disabled {
        debug!("health monitor disabled by configuration");
        return;
    }

    let watched: Vec<String> = devices.values().map(|d| d.uuid().to_string()).collect();
    // Resolves a vendor event's (physical UUID, partition-instance,
    // compute-instance) triple to the watched device's own UUID, per spec
    // §4.5. A whole device's key has both instance fields `None`.
    let by_identity: HashMap<(String, Option<u32>, Option<u32>), String> = devices
        .values()
        .map(|d| {
            (
                (d.physical_uuid().to_string(), d.partition_instance(), d.compute_instance()),
                d.uuid().to_string(),
            )
        })
        .collect();
    let mut consecutive_failures: u32 = 0;

    loop {
        if *stop.borrow() {
            break;
        }

        tokio::select! {
            _ = stop.changed() => {
                if *stop.borrow() {
                    break;
                }
            }
            outcome = event_bus.wait_event(POLL_TIMEOUT) => {
                match outcome {
                    EventOutcome::Timeout => {
                        trace!("health monitor poll timed out, no event");
                        for event in periodic.check(&watched).await {
                            let _ = sink.send(event).await;
                        }
                    }
                    EventOutcome::TransportFailure => {
                        consecutive_failures += 1;
                        warn!(count = consecutive_failures, "health monitor transport failure");
                        if consecutive_failures >= CONSECUTIVE_FAILURE_THRESHOLD {
                            for uuid in &watched {
                                let _ = sink
                                    .send(HealthEvent {
                                        uuid: uuid.clone(),
                                        reason: "consecutive transport failures".to_string(),
                                    })
                                    .await;
                            }
                            consecutive_failures = 0;
                        }
                    }
                    EventOutcome::Event(event) => {
                        consecutive_failures = 0;
                        handle_event(event, &config, &by_identity, &watched, &sink).await;
                    }
                }
            }
        }
    }
}

async fn handle_event(
    event: VendorEvent,
    config: &HealthConfig,
    by_identity: &HashMap<(String, Option<u32>, Option<u32>), String>,
    watched: &[String],
    sink: &mpsc::Sender<HealthEvent>,
) {
    if !is_critical(event.code, &config.critical_events) {
        debug!(code = event.code, "non-critical health event, continuing");
        return;
    }

    if config.ignored_event_codes.contains(&event.code) {
        debug!(code = event.code, "health event is in the ignore list");
        return;
    }

    let resolved = event.uuid.as_ref().and_then(|uuid| {
        by_identity
            .get(&(uuid.clone(), event.partition_instance, event.compute_instance))
            .cloned()
    });

    match resolved {
        Some(uuid) => {
            trace!(uuid = %uuid, code = event.code, "device matched by (uuid, partition-instance, compute-instance)");
            let _ = sink
                .send(HealthEvent {
                    uuid,
                    reason: format!("critical event code {}", event.code),
                })
                .await;
        }
        None => {
            // Event's (uuid, partition-instance, compute-instance) triple
            // couldn't be resolved to a watched device: conservative fault
            // isolation marks every watched device unhealthy, spec §4.5.
            warn!(code = event.code, "health event device could not be resolved, marking all watched devices unhealthy");
            for uuid in watched {
                let _ = sink
                    .send(HealthEvent {
                        uuid: uuid.clone(),
                        reason: format!("unresolvable event code {}", event.code),
                    })
                    .await;
            }
        }
    }
}

fn is_critical(code: u32, policy: &CriticalEventPolicy) -> bool {
    match policy {
        CriticalEventPolicy::All => true,
        CriticalEventPolicy::Explicit(codes) => codes.contains(&code),
    }
}
