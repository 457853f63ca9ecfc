//! Error kinds produced by resource-map construction, allocation, and
//! compute-server supervision.
//!
//! Configuration and map-building errors are meant to propagate to the
//! Signal Loop and end the process (exit code 1, see
//! [`crate::signal`]). Supervisor start errors also propagate to the
//! Signal Loop, but trigger a back-off restart rather than an exit.

use thiserror::Error;

/// Errors produced anywhere in the core control plane.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A configuration document failed to parse, or named a field that
    /// doesn't resolve (unknown selector, missing pattern, etc).
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// The vendor device library could not be loaded or initialized.
    #[error("vendor device library unavailable: {0}")]
    LibraryUnavailable(String),

    /// Enumerating a specific device's attributes failed.
    #[error("failed to query device {uuid}: {source}")]
    DeviceQuery {
        /// UUID of the device that failed to answer a query.
        uuid: String,
        /// Underlying cause.
        #[source]
        source: anyhow::Error,
    },

    /// Discovering the device set as a whole failed (e.g. the partition
    /// capability-minor mapping under `/proc` could not be read).
    #[error("device discovery failed: {0}")]
    DeviceDiscovery(String),

    /// A device matched no configured resource pattern.
    #[error("device {0} matched no resource pattern")]
    UnmatchedDevice(String),

    /// `partition-strategy: single` was set but devices disagree on
    /// whether hardware partitioning is enabled.
    #[error("mixed partition mode across devices: {0}")]
    MixedPartitionMode(String),

    /// A resource's configured replica count exceeds the device's
    /// compute-capability-derived client limit.
    #[error("invalid replica count {replicas} for device {uuid} (capability {capability}, max {max})")]
    InvalidReplicaCount {
        /// Device UUID.
        uuid: String,
        /// Requested replica count.
        replicas: u32,
        /// Compute-capability string used to derive `max`.
        capability: String,
        /// Maximum replicas permitted for this capability.
        max: u32,
    },

    /// The compute-server binary failed to start or exited non-zero.
    #[error("subprocess error for resource {resource}: {message}")]
    Subprocess {
        /// Resource this subprocess belongs to.
        resource: String,
        /// Description of the failure.
        message: String,
    },

    /// Writing to or reading from the compute-server's control pipe
    /// failed.
    #[error("control channel error for resource {resource}: {message}")]
    ControlChannel {
        /// Resource whose pipe failed.
        resource: String,
        /// Description of the failure.
        message: String,
    },

    /// The allocator was asked for more devices than are available.
    #[error("insufficient devices: requested {requested}, available {available}")]
    InsufficientDevices {
        /// Number of devices requested.
        requested: usize,
        /// Number of devices available to choose from.
        available: usize,
    },

    /// The vendor event bus returned a transient error below the
    /// consecutive-failure threshold.
    #[error("transient health monitor error: {0}")]
    TransientHealth(String),
}

/// Joins a list of errors collected during a teardown sequence into one
/// error, preserving each message, without masking earlier failures with
/// later ones. Mirrors the "errors are joined" requirement for Supervisor
/// Stop in spec §7.
pub fn join_errors(errors: Vec<anyhow::Error>) -> Option<anyhow::Error> {
    if errors.is_empty() {
        return None;
    }
    let joined = errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ");
    Some(anyhow::anyhow!(joined))
}
