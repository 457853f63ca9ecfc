//! The configuration document (spec §3, §6): partition/sharing strategy,
//! resource pattern rules, replication rules, allocation policy, and health
//! sub-configuration. Format-agnostic on disk (YAML or JSON); parsed with
//! `serde`.

use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, warn};

/// Whether hardware partitions are ignored, treated as the only resource
/// type, or coexist under distinct resource names.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PartitionStrategy {
    None,
    Single,
    Mixed,
}

impl Default for PartitionStrategy {
    fn default() -> Self {
        PartitionStrategy::None
    }
}

/// Whether (and how) a resource's devices are shared among multiple
/// client containers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SharingStrategy {
    None,
    TimeSlicing,
    SharedServer,
}

impl Default for SharingStrategy {
    fn default() -> Self {
        SharingStrategy::None
    }
}

/// Allocator policy selected when more than one is meaningful for the
/// shape of the request (spec §4.3).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AllocationPolicy {
    Aligned,
    Distributed,
    Packed,
}

impl Default for AllocationPolicy {
    fn default() -> Self {
        AllocationPolicy::Distributed
    }
}

/// A pattern -> resource-name rule. First match wins.
#[derive(Clone, Debug, Deserialize)]
pub struct ResourceRule {
    pub pattern: String,
    pub name: String,
}

/// A selector choosing which devices of a resource get replicated.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "value")]
pub enum DeviceSelector {
    All,
    FirstN(usize),
    Uuids(Vec<String>),
    Indices(Vec<usize>),
}

/// One `replicated-resources` entry.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicatedResource {
    pub resource_name: String,
    #[serde(default = "default_selector")]
    pub device_selector: DeviceSelector,
    pub replicas: u32,
    pub rename: Option<String>,
    #[serde(default)]
    pub fail_if_multi: bool,
}

/// The persisted shape of the readiness file's content: the
/// currently-effective `replicated-resources` section of the
/// configuration, per spec §3/§6.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicatedResourceDocument {
    pub replicated_resources: Vec<ReplicatedResource>,
}

impl From<&Configuration> for ReplicatedResourceDocument {
    fn from(config: &Configuration) -> Self {
        ReplicatedResourceDocument {
            replicated_resources: config.replicated_resources.clone(),
        }
    }
}

fn default_selector() -> DeviceSelector {
    DeviceSelector::All
}

/// Which event classes/codes the Health Monitor treats as non-fatal.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthConfig {
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub ignored_event_codes: Vec<u32>,
    #[serde(default)]
    pub critical_events: CriticalEventPolicy,
}

/// Which events are considered critical (i.e. cause a device to be marked
/// unhealthy rather than just logged).
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "value")]
pub enum CriticalEventPolicy {
    All,
    Explicit(Vec<u32>),
}

impl Default for CriticalEventPolicy {
    fn default() -> Self {
        CriticalEventPolicy::All
    }
}

/// Resource-name pattern groupings: whole-device patterns and
/// hardware-partition (MIG) patterns.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourcePatterns {
    #[serde(default)]
    pub gpus: Vec<ResourceRule>,
    #[serde(default)]
    pub migs: Vec<ResourceRule>,
}

/// Top-level configuration document (spec §3, §6).
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Configuration {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub partition_strategy: PartitionStrategy,
    #[serde(default)]
    pub sharing_strategy: SharingStrategy,
    #[serde(default)]
    pub resources: ResourcePatterns,
    #[serde(default)]
    pub replicated_resources: Vec<ReplicatedResource>,
    #[serde(default)]
    pub allocation_policy: AllocationPolicy,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub fail_on_init_error: bool,
}

impl Configuration {
    /// Loads and parses the document at `path`. YAML and JSON are both
    /// accepted (JSON is a YAML subset, so `serde_yaml` handles both).
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            CoreError::Configuration(format!("could not read {}: {}", path.display(), e))
        })?;
        Self::parse(&text)
    }

    /// Parses a configuration document from a string.
    pub fn parse(text: &str) -> Result<Self, CoreError> {
        serde_yaml::from_str(text)
            .map_err(|e| CoreError::Configuration(format!("invalid configuration: {}", e)))
    }

    /// Loads the path named by `CONFIG_FILE`, applying the environment
    /// overrides documented in spec §6 (`DP_DISABLE_HEALTHCHECKS`).
    pub fn load_from_env() -> Result<Self, CoreError> {
        let path = std::env::var("CONFIG_FILE")
            .map_err(|_| CoreError::Configuration("CONFIG_FILE is not set".to_string()))?;
        let mut config = Self::load(&path)?;
        if let Ok(raw) = std::env::var("DP_DISABLE_HEALTHCHECKS") {
            apply_health_env_override(&mut config.health, &raw);
        }
        Ok(config)
    }
}

/// Applies a `DP_DISABLE_HEALTHCHECKS` value over a parsed [`HealthConfig`],
/// per spec §6: the literal values `all` or `xids` disable the Health
/// Monitor outright; other comma-separated entries are parsed as numeric
/// event codes and added to the ignore list. Takes the raw value rather
/// than reading the environment directly so it's deterministically
/// testable.
pub fn apply_health_env_override(health: &mut HealthConfig, raw: &str) {
    for entry in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        if entry == "all" || entry == "xids" {
            debug!("DP_DISABLE_HEALTHCHECKS={} disables health monitor", entry);
            health.disabled = true;
            continue;
        }
        match entry.parse::<u32>() {
            Ok(code) => {
                if !health.ignored_event_codes.contains(&code) {
                    health.ignored_event_codes.push(code);
                }
            }
            Err(_) => warn!(
                "ignoring unrecognized DP_DISABLE_HEALTHCHECKS entry {:?}",
                entry
            ),
        }
    }
}

/// Parses an `MPS_DEV_SHM_SIZE`-style size spec (`[0-9]+[kmg%]?`), returning
/// the raw numeric value, its unit suffix (empty string if none), and
/// whether it was a percentage. Per spec §6/§9(c).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShmSize {
    /// A flat size with the given raw numeric value and unit suffix.
    Flat { value: u64, unit: char },
    /// A percentage of `MemTotal`.
    Percent(u64),
}

pub fn parse_shm_size(raw: &str) -> Result<ShmSize, CoreError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(CoreError::Configuration(
            "MPS_DEV_SHM_SIZE must not be empty".to_string(),
        ));
    }
    let (digits, suffix) = match raw.chars().last() {
        Some(c) if c.is_ascii_digit() => (raw, '\0'),
        Some(c) => (&raw[..raw.len() - c.len_utf8()], c),
        None => unreachable!(),
    };
    let value: u64 = digits
        .parse()
        .map_err(|_| CoreError::Configuration(format!("invalid MPS_DEV_SHM_SIZE {:?}", raw)))?;
    match suffix {
        '%' => Ok(ShmSize::Percent(value)),
        'k' | 'm' | 'g' | '\0' => Ok(ShmSize::Flat {
            value,
            unit: if suffix == '\0' { 'b' } else { suffix },
        }),
        other => Err(CoreError::Configuration(format!(
            "invalid MPS_DEV_SHM_SIZE unit {:?}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_document() {
        let doc = r#"
partitionStrategy: mixed
sharingStrategy: sharedServer
allocationPolicy: packed
resources:
  gpus:
    - pattern: "Test-*"
      name: gpu
replicatedResources:
  - resourceName: gpu
    replicas: 4
"#;
        let config = Configuration::parse(doc).unwrap();
        assert_eq!(config.partition_strategy, PartitionStrategy::Mixed);
        assert_eq!(config.sharing_strategy, SharingStrategy::SharedServer);
        assert_eq!(config.allocation_policy, AllocationPolicy::Packed);
        assert_eq!(config.resources.gpus.len(), 1);
        assert_eq!(config.replicated_resources[0].replicas, 4);
    }

    #[test]
    fn defaults_are_none_and_distributed() {
        let config = Configuration::parse("{}").unwrap();
        assert_eq!(config.partition_strategy, PartitionStrategy::None);
        assert_eq!(config.sharing_strategy, SharingStrategy::None);
        assert_eq!(config.allocation_policy, AllocationPolicy::Distributed);
        assert!(!config.fail_on_init_error);
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let doc = r#"
somethingFuture: true
partitionStrategy: single
"#;
        let config = Configuration::parse(doc).unwrap();
        assert_eq!(config.partition_strategy, PartitionStrategy::Single);
    }

    #[test]
    fn health_env_override_disables_monitor_on_all() {
        let mut health = HealthConfig::default();
        apply_health_env_override(&mut health, "all");
        assert!(health.disabled);
    }

    #[test]
    fn health_env_override_augments_ignore_list() {
        let mut health = HealthConfig::default();
        apply_health_env_override(&mut health, "13,48");
        assert!(!health.disabled);
        assert_eq!(health.ignored_event_codes, vec![13, 48]);
    }

    #[test]
    fn shm_size_parses_unit_suffix() {
        assert_eq!(
            parse_shm_size("65536k").unwrap(),
            ShmSize::Flat {
                value: 65536,
                unit: 'k'
            }
        );
        assert_eq!(parse_shm_size("50%").unwrap(), ShmSize::Percent(50));
    }

    #[test]
    fn shm_size_rejects_bad_unit() {
        assert!(parse_shm_size("10x").is_err());
    }
}
