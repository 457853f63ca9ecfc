//! Lifecycle of one compute-server process per shared-server resource.
//! Spec §4.6. One instance is owned exclusively by the Signal Loop; it in
//! turn owns the server subprocess, the log-tail subprocess, and the
//! per-resource pipe/log directories (spec §5 ownership rules).

pub mod control;

use crate::device::{max_clients_for, Device};
use crate::error::{join_errors, CoreError};
use control::ControlChannel;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, error, info, warn};

#[cfg(unix)]
use tokio::fs::DirBuilderExt;

/// `Created → Starting → Running → Stopping → Stopped`, with `Failed`
/// reachable from `Starting` or `Running`, per spec §3/§4.6.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SupervisorState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

/// One device this supervisor owns: identity, index, and total memory, the
/// subset of [`Device`] the start sequence's pipe commands need.
#[derive(Clone, Debug)]
pub struct OwnedDevice {
    pub uuid: String,
    pub index: String,
    pub total_memory_bytes: u64,
    pub compute_capability: (u32, u32),
}

impl OwnedDevice {
    pub fn from_device(device: &Device) -> Self {
        OwnedDevice {
            uuid: device.uuid().to_string(),
            index: device.index().to_string(),
            total_memory_bytes: device.total_memory_bytes(),
            compute_capability: device.compute_capability_value(),
        }
    }
}

/// Sets device compute mode via the vendor admin tool. External
/// collaborator — spec §6's `-i <UUID> -c {EXCLUSIVE_PROCESS|DEFAULT}`.
#[async_trait::async_trait]
pub trait ComputeModeAdmin: Send + Sync {
    async fn set_exclusive(&self, uuid: &str) -> Result<(), CoreError>;
    async fn set_default(&self, uuid: &str) -> Result<(), CoreError>;
}

/// Spawns the vendor server binary and the log-tail subprocess. External
/// collaborator — spec §4.6 step 3 and step 7.
#[async_trait::async_trait]
pub trait ServerProcessLauncher: Send + Sync {
    async fn spawn_server(&self, resource_name: &str, pipe_dir: &PathBuf, log_dir: &PathBuf) -> Result<(), CoreError>;
    async fn spawn_log_tail(&self, log_dir: &PathBuf) -> Result<Box<dyn LogTail>, CoreError>;
}

/// A running log-tail subprocess; dropping/stopping it should not error.
#[async_trait::async_trait]
pub trait LogTail: Send {
    async fn stop(&mut self);
}

/// Relabels the pipe directory for container-accessible class when a
/// mandatory-access-control profile is in enforcing mode, per spec §4.6
/// step 2 / §6. External collaborator: the default is a no-op, correct on
/// hosts with no MAC profile loaded or with one in permissive mode.
#[async_trait::async_trait]
pub trait PathLabeler: Send + Sync {
    async fn relabel_for_containers(&self, path: &Path) -> Result<(), CoreError>;
}

/// Default [`PathLabeler`]: does nothing.
pub struct NoopLabeler;

#[async_trait::async_trait]
impl PathLabeler for NoopLabeler {
    async fn relabel_for_containers(&self, _path: &Path) -> Result<(), CoreError> {
        Ok(())
    }
}

/// Default [`ServerProcessLauncher`] that shells out with `tokio::process`,
/// mirroring the vendor-binary invocation named in spec §4.6/§6.
pub struct SubprocessLauncher {
    pub server_binary: PathBuf,
    pub tail_binary: PathBuf,
    pub vendor_prefix: String,
}

#[async_trait::async_trait]
impl ServerProcessLauncher for SubprocessLauncher {
    async fn spawn_server(
        &self,
        _resource_name: &str,
        pipe_dir: &PathBuf,
        log_dir: &PathBuf,
    ) -> Result<(), CoreError> {
        let status = Command::new(&self.server_binary)
            .env(format!("{}_PIPE_DIRECTORY", self.vendor_prefix), pipe_dir)
            .env(format!("{}_LOG_DIRECTORY", self.vendor_prefix), log_dir)
            .status()
            .await
            .map_err(|e| CoreError::Subprocess {
                resource: pipe_dir.display().to_string(),
                message: format!("server binary spawn failed: {}", e),
            })?;
        if !status.success() {
            return Err(CoreError::Subprocess {
                resource: pipe_dir.display().to_string(),
                message: format!("server binary exited with {}", status),
            });
        }
        Ok(())
    }

    async fn spawn_log_tail(&self, log_dir: &PathBuf) -> Result<Box<dyn LogTail>, CoreError> {
        let child = Command::new(&self.tail_binary)
            .arg("-F")
            .arg(log_dir.join("control.log"))
            .stdout(std::process::Stdio::inherit())
            .spawn()
            .map_err(|e| CoreError::Subprocess {
                resource: log_dir.display().to_string(),
                message: format!("log tail spawn failed: {}", e),
            })?;
        Ok(Box::new(ChildLogTail { child: Some(child) }))
    }
}

struct ChildLogTail {
    child: Option<tokio::process::Child>,
}

#[async_trait::async_trait]
impl LogTail for ChildLogTail {
    async fn stop(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill().await {
                warn!("failed to kill log tail: {}", e);
            }
        }
    }
}

/// Per-resource filesystem layout under the configured root, spec §6.
pub struct SupervisorPaths {
    pub pipe_dir: PathBuf,
    pub log_dir: PathBuf,
    pub sentinel: PathBuf,
}

impl SupervisorPaths {
    pub fn new(root: &PathBuf, resource_name: &str) -> Self {
        let base = root.join(resource_name);
        SupervisorPaths {
            pipe_dir: base.join("pipe"),
            log_dir: base.join("log"),
            sentinel: base.join(".started"),
        }
    }
}

/// Owns one compute-server process for one shared-server resource.
pub struct Supervisor {
    resource_name: String,
    devices: Vec<OwnedDevice>,
    replicas: u32,
    paths: SupervisorPaths,
    admin: Box<dyn ComputeModeAdmin>,
    launcher: Box<dyn ServerProcessLauncher>,
    control: Box<dyn ControlChannel>,
    labeler: Box<dyn PathLabeler>,
    state: SupervisorState,
    log_tail: Option<Box<dyn LogTail>>,
}

impl Supervisor {
    pub fn new(
        resource_name: impl Into<String>,
        devices: Vec<OwnedDevice>,
        replicas: u32,
        paths: SupervisorPaths,
        admin: Box<dyn ComputeModeAdmin>,
        launcher: Box<dyn ServerProcessLauncher>,
        control: Box<dyn ControlChannel>,
        labeler: Box<dyn PathLabeler>,
    ) -> Self {
        Supervisor {
            resource_name: resource_name.into(),
            devices,
            replicas,
            paths,
            admin,
            launcher,
            control,
            labeler,
            state: SupervisorState::Created,
            log_tail: None,
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn resource_name(&self) -> &str {
        &self.resource_name
    }

    /// Asserts every owned device's compute capability supports `replicas`
    /// clients, per spec §4.6's `InvalidReplicaCount` rule. Called before
    /// `start`.
    pub fn validate_replica_count(&self) -> Result<(), CoreError> {
        for device in &self.devices {
            let max = max_clients_for_capability(device.compute_capability);
            if self.replicas > max {
                return Err(CoreError::InvalidReplicaCount {
                    uuid: device.uuid.clone(),
                    replicas: self.replicas,
                    capability: format!("{}.{}", device.compute_capability.0, device.compute_capability.1),
                    max,
                });
            }
        }
        Ok(())
    }

    /// Spec §4.6's seven-step start sequence. On any failure, state becomes
    /// `Failed` and the caller is responsible for invoking [`Supervisor::stop`]
    /// to unwind compute-mode changes already applied.
    pub async fn start(&mut self) -> Result<(), CoreError> {
        self.validate_replica_count()?;
        self.state = SupervisorState::Starting;
        info!(resource = %self.resource_name, "starting compute-server supervisor");

        if let Err(e) = self.set_all_compute_mode(true).await {
            self.state = SupervisorState::Failed;
            return Err(e);
        }

        if let Err(e) = self.create_directories().await {
            self.state = SupervisorState::Failed;
            return Err(e);
        }

        if let Err(e) = self
            .launcher
            .spawn_server(&self.resource_name, &self.paths.pipe_dir, &self.paths.log_dir)
            .await
        {
            self.state = SupervisorState::Failed;
            return Err(e);
        }

        if let Err(e) = self.configure_limits().await {
            self.state = SupervisorState::Failed;
            return Err(e);
        }

        if let Err(e) = self.touch_sentinel().await {
            self.state = SupervisorState::Failed;
            return Err(e);
        }

        match self.launcher.spawn_log_tail(&self.paths.log_dir).await {
            Ok(tail) => self.log_tail = Some(tail),
            Err(e) => {
                self.state = SupervisorState::Failed;
                return Err(e);
            }
        }

        self.state = SupervisorState::Running;
        info!(resource = %self.resource_name, "compute-server supervisor running");
        Ok(())
    }

    async fn set_all_compute_mode(&self, exclusive: bool) -> Result<(), CoreError> {
        for device in &self.devices {
            if exclusive {
                self.admin.set_exclusive(&device.uuid).await?;
            } else {
                self.admin.set_default(&device.uuid).await?;
            }
        }
        Ok(())
    }

    async fn create_directories(&self) -> Result<(), CoreError> {
        for dir in [&self.paths.pipe_dir, &self.paths.log_dir] {
            let mut builder = tokio::fs::DirBuilder::new();
            builder.recursive(true);
            #[cfg(unix)]
            builder.mode(0o755);
            builder.create(dir).await.map_err(|e| CoreError::Subprocess {
                resource: self.resource_name.clone(),
                message: format!("could not create {}: {}", dir.display(), e),
            })?;
        }
        self.labeler.relabel_for_containers(&self.paths.pipe_dir).await?;
        Ok(())
    }

    /// Spec §4.6 steps 4-5: per-device pinned-memory limit, then per-client
    /// thread percentage.
    async fn configure_limits(&self) -> Result<(), CoreError> {
        let replicas = self.replicas.max(1);
        for device in &self.devices {
            if device.total_memory_bytes == 0 {
                debug!(uuid = %device.uuid, "skipping pinned-mem limit for zero-memory device");
                continue;
            }
            let limit_mb = device.total_memory_bytes / u64::from(replicas) / 1_048_576;
            self.control
                .send(&format!(
                    "set_default_device_pinned_mem_limit {} {}M",
                    device.index, limit_mb
                ))
                .await?;
        }
        let percent = 100 / replicas;
        self.control
            .send(&format!("set_default_active_thread_percentage {}", percent))
            .await?;
        Ok(())
    }

    async fn touch_sentinel(&self) -> Result<(), CoreError> {
        tokio::fs::write(&self.paths.sentinel, []).await.map_err(|e| CoreError::Subprocess {
            resource: self.resource_name.clone(),
            message: format!("could not touch sentinel {}: {}", self.paths.sentinel.display(), e),
        })
    }

    /// Spec §4.6's health probe: succeeds iff the control channel responds.
    pub async fn probe(&self) -> Result<(), CoreError> {
        self.control.send("get_default_active_thread_percentage").await.map(|_| ())
    }

    /// Spec §4.6's stop sequence. Errors from later steps are collected but
    /// don't mask earlier ones, per spec §7's "errors are joined" rule.
    /// Stops the log tail only after `quit` is acknowledged (spec §9 open
    /// question (b)).
    pub async fn stop(&mut self) -> Result<(), CoreError> {
        self.state = SupervisorState::Stopping;
        info!(resource = %self.resource_name, "stopping compute-server supervisor");
        let mut errors = Vec::new();

        if let Err(e) = self.control.send("quit").await {
            errors.push(anyhow::Error::new(e));
        }

        if let Some(mut tail) = self.log_tail.take() {
            tail.stop().await;
        }

        for device in &self.devices {
            if let Err(e) = self.admin.set_default(&device.uuid).await {
                errors.push(anyhow::Error::new(e));
            }
        }

        if let Err(e) = tokio::fs::remove_file(&self.paths.sentinel).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                errors.push(anyhow::anyhow!("removing sentinel: {}", e));
            }
        }
        if let Err(e) = tokio::fs::remove_dir_all(&self.paths.log_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                errors.push(anyhow::anyhow!("removing log dir: {}", e));
            }
        }

        self.state = SupervisorState::Stopped;

        match join_errors(errors) {
            Some(joined) => {
                error!(resource = %self.resource_name, error = %joined, "stop completed with errors");
                Err(CoreError::ControlChannel {
                    resource: self.resource_name.clone(),
                    message: joined.to_string(),
                })
            }
            None => Ok(()),
        }
    }
}

fn max_clients_for_capability(capability: (u32, u32)) -> u32 {
    // Mirrors device::max_clients_for without requiring a full Device value.
    let placeholder = Device::new("", "0", vec![], None, 0, format!("{}.{}", capability.0, capability.1));
    max_clients_for(&placeholder)
}
