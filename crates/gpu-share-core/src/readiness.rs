//! The `.ready` sentinel: an atomically-written JSON document encoding the
//! currently-effective `replicated-resources` configuration, consumed by an
//! external probe. Spec §3/§6.

use crate::config::ReplicatedResourceDocument;
use crate::error::CoreError;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Reads and writes the readiness file at a fixed path under the
/// configured root.
pub struct ReadinessFile {
    path: PathBuf,
}

impl ReadinessFile {
    pub fn new(root: impl AsRef<Path>) -> Self {
        ReadinessFile {
            path: root.as_ref().join(".ready"),
        }
    }

    /// True once `Start` has run at least once, regardless of content.
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Writes `document` to a temp file in the same directory, then renames
    /// it over the readiness path, so readers never observe a partial
    /// write.
    pub async fn write(&self, document: &ReplicatedResourceDocument) -> Result<(), CoreError> {
        let body = serde_json::to_vec_pretty(document).map_err(|e| {
            CoreError::Configuration(format!("could not serialize readiness document: {}", e))
        })?;

        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        tokio::fs::create_dir_all(dir).await.map_err(|e| {
            CoreError::Configuration(format!("could not create readiness directory: {}", e))
        })?;

        let tmp = dir.join(format!(".ready.tmp.{}", std::process::id()));
        tokio::fs::write(&tmp, &body).await.map_err(|e| {
            CoreError::Configuration(format!("could not write readiness temp file: {}", e))
        })?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(|e| {
            CoreError::Configuration(format!("could not publish readiness file: {}", e))
        })?;
        debug!(path = %self.path.display(), "wrote readiness file");
        Ok(())
    }

    /// Reads the current document, if the file exists and parses.
    pub async fn read(&self) -> Result<Option<ReplicatedResourceDocument>, CoreError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => {
                let doc = serde_json::from_slice(&bytes).map_err(|e| {
                    CoreError::Configuration(format!("could not parse readiness file: {}", e))
                })?;
                Ok(Some(doc))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CoreError::Configuration(format!(
                "could not read readiness file: {}",
                e
            ))),
        }
    }

    /// "Ready" per spec §3: the file exists and its content equals the
    /// live configuration's replicated-resources section.
    pub async fn is_ready(&self, live: &ReplicatedResourceDocument) -> Result<bool, CoreError> {
        Ok(self.read().await?.as_ref() == Some(live))
    }
}

/// Default tmpfs size when `/proc/meminfo` can't be read or parsed, or
/// `MPS_DEV_SHM_SIZE` isn't set, per spec §6.
pub const DEFAULT_SHM_SIZE: &str = "65536k";

/// Computes the `shm` tmpfs size from `/proc/meminfo`'s text: half of
/// `MemTotal`'s raw numeric value, *preserving its reported unit* rather
/// than converting it (spec §9 open question (c) — the source does this,
/// and we preserve the observed behavior rather than silently "fixing" a
/// unit conversion it never did).
pub fn shm_size_from_meminfo(meminfo: &str) -> String {
    for line in meminfo.lines() {
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("MemTotal:") => {
                let value: Option<u64> = parts.next().and_then(|v| v.parse().ok());
                let unit = parts.next().unwrap_or("kB");
                if let Some(value) = value {
                    return format!("{}{}", value / 2, unit_suffix(unit));
                }
                break;
            }
            _ => continue,
        }
    }
    warn!("could not parse MemTotal from /proc/meminfo, using default shm size");
    DEFAULT_SHM_SIZE.to_string()
}

fn unit_suffix(unit: &str) -> &'static str {
    match unit {
        "kB" | "KB" | "kb" => "k",
        "mB" | "MB" | "mb" => "m",
        "gB" | "GB" | "gb" => "g",
        _ => "k",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReplicatedResourceDocument;
    use tempfile::tempdir;

    fn doc(replicas: u32) -> ReplicatedResourceDocument {
        ReplicatedResourceDocument {
            replicated_resources: vec![crate::config::ReplicatedResource {
                resource_name: "gpu".to_string(),
                device_selector: crate::config::DeviceSelector::All,
                replicas,
                rename: None,
                fail_if_multi: false,
            }],
        }
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let root = tempdir().unwrap();
        let readiness = ReadinessFile::new(root.path());
        assert!(!readiness.exists());
        readiness.write(&doc(4)).await.unwrap();
        assert!(readiness.exists());
        let read_back = readiness.read().await.unwrap().unwrap();
        assert_eq!(read_back.replicated_resources[0].replicas, 4);
    }

    #[tokio::test]
    async fn is_ready_false_until_content_matches() {
        let root = tempdir().unwrap();
        let readiness = ReadinessFile::new(root.path());
        readiness.write(&doc(2)).await.unwrap();
        assert!(!readiness.is_ready(&doc(4)).await.unwrap());
        assert!(readiness.is_ready(&doc(2)).await.unwrap());
    }

    #[tokio::test]
    async fn missing_file_reads_as_none() {
        let root = tempdir().unwrap();
        let readiness = ReadinessFile::new(root.path());
        assert_eq!(readiness.read().await.unwrap(), None);
    }

    #[test]
    fn shm_size_halves_value_and_preserves_unit() {
        let meminfo = "MemTotal:       16384000 kB\nMemFree:        1000 kB\n";
        assert_eq!(shm_size_from_meminfo(meminfo), "8192000k");
    }

    #[test]
    fn shm_size_falls_back_on_unparseable_meminfo() {
        assert_eq!(shm_size_from_meminfo("garbage"), DEFAULT_SHM_SIZE);
    }
}
