//! Entrypoint for the node-level device-plugin agent: installs the
//! tracing subscriber, loads configuration, and drives the Signal Loop
//! until a terminate signal arrives.

use gpu_share_core::config::{Configuration, ReplicatedResourceDocument};
use gpu_share_core::device::enumerator;
use gpu_share_core::device::library::DeviceLibrary;
use gpu_share_core::error::CoreError;
use gpu_share_core::resource::builder;
use gpu_share_core::signal::{Environment, LoopExit, OsSignalSource, SignalLoop};
use gpu_share_core::supervisor::control::SubprocessControlChannel;
use gpu_share_core::supervisor::{
    ComputeModeAdmin, NoopLabeler, OwnedDevice, Supervisor, SubprocessLauncher, SupervisorPaths,
};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const DEFAULT_ROOT: &str = "/nvidia-mps";
const ADMIN_BINARY: &str = "nvidia-smi";

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let exit_code = match run().await {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!("fatal error: {}", e);
            1
        }
    };
    std::process::exit(exit_code);
}

async fn run() -> anyhow::Result<()> {
    let root = std::env::var("GPU_SHARE_ROOT").unwrap_or_else(|_| DEFAULT_ROOT.to_string());
    let environment = ProductionEnvironment {
        root: PathBuf::from(root),
    };
    let signals = OsSignalSource::new()?;
    let mut signal_loop = SignalLoop::new(environment);

    match signal_loop
        .run(signals, |d| tokio::time::sleep(d))
        .await
    {
        LoopExit::Terminated => Ok(()),
        LoopExit::FatalBuildError(e) => Err(anyhow::anyhow!(e)),
    }
}

/// Wires the real configuration loader, vendor device library, and
/// subprocess-based supervisor collaborators together. The vendor device
/// library itself is explicitly out of scope (spec.md §1): production
/// deployments swap [`UnavailableDeviceLibrary`] for the real FFI binding.
struct ProductionEnvironment {
    root: PathBuf,
}

#[async_trait::async_trait]
impl Environment for ProductionEnvironment {
    async fn build_supervisors(&self) -> Result<BTreeMap<String, Supervisor>, CoreError> {
        let config = Configuration::load_from_env()?;
        let library = UnavailableDeviceLibrary;

        let devices = match enumerator::enumerate(&library, config.partition_strategy) {
            Ok(devices) => devices,
            Err(e) if !config.fail_on_init_error => {
                tracing::warn!("device enumeration failed, continuing with empty resource map: {}", e);
                Vec::new()
            }
            Err(e) => return Err(e),
        };

        let map = builder::build(&config, devices)?;

        let document = ReplicatedResourceDocument::from(&config);
        let readiness = gpu_share_core::readiness::ReadinessFile::new(&self.root);

        let mut supervisors = BTreeMap::new();
        for (name, resource) in map.into_iter() {
            if resource.sharing_strategy() != gpu_share_core::config::SharingStrategy::SharedServer {
                continue;
            }
            let replicas = replica_count(&resource);
            let owned_devices: Vec<OwnedDevice> = resource
                .devices()
                .values()
                .map(OwnedDevice::from_device)
                .collect();

            let paths = SupervisorPaths::new(&self.root, &name);
            let admin = NvidiaSmiAdmin;
            let launcher = SubprocessLauncher {
                server_binary: PathBuf::from("nvidia-cuda-mps-control"),
                tail_binary: PathBuf::from("tail"),
                vendor_prefix: "CUDA_MPS".to_string(),
            };
            let control = SubprocessControlChannel {
                control_binary: PathBuf::from("nvidia-cuda-mps-control"),
                pipe_dir: paths.pipe_dir.clone(),
                resource_name: name.clone(),
            };

            supervisors.insert(
                name.clone(),
                Supervisor::new(
                    name,
                    owned_devices,
                    replicas,
                    paths,
                    Box::new(admin),
                    Box::new(launcher),
                    Box::new(control),
                    Box::new(NoopLabeler),
                ),
            );
        }

        readiness.write(&document).await?;
        Ok(supervisors)
    }
}

fn replica_count(resource: &gpu_share_core::Resource) -> u32 {
    resource
        .devices()
        .keys()
        .filter_map(|id| id.replica_index())
        .max()
        .map(|m| m + 1)
        .unwrap_or(1)
}

/// Vendor device library placeholder: the real FFI binding is explicitly
/// out of scope (spec.md §1). Always reports unavailable, so
/// `fail-on-init-error` governs whether this is a startup-fatal condition
/// or an empty resource map.
struct UnavailableDeviceLibrary;

impl DeviceLibrary for UnavailableDeviceLibrary {
    fn device_count(&self) -> Result<usize, CoreError> {
        Err(CoreError::LibraryUnavailable(
            "vendor device library is not linked into this build".to_string(),
        ))
    }

    fn device_info(&self, _index: usize) -> Result<gpu_share_core::device::library::RawDeviceInfo, CoreError> {
        unreachable!("device_count already reported zero devices")
    }

    fn partitions(&self, _index: usize) -> Result<Vec<gpu_share_core::device::library::RawPartitionInfo>, CoreError> {
        Ok(Vec::new())
    }

    fn capability_paths(&self, _gi_minor: u32, _ci_minor: u32) -> Result<[String; 2], CoreError> {
        Err(CoreError::LibraryUnavailable(
            "vendor device library is not linked into this build".to_string(),
        ))
    }

    fn set_compute_mode(&self, _uuid: &str, _exclusive: bool) -> Result<(), CoreError> {
        Err(CoreError::LibraryUnavailable(
            "vendor device library is not linked into this build".to_string(),
        ))
    }
}

/// Sets compute mode via the vendor admin tool (`nvidia-smi -i <uuid> -c
/// {EXCLUSIVE_PROCESS|DEFAULT}`), per spec.md §6.
struct NvidiaSmiAdmin;

#[async_trait::async_trait]
impl ComputeModeAdmin for NvidiaSmiAdmin {
    async fn set_exclusive(&self, uuid: &str) -> Result<(), CoreError> {
        run_admin(uuid, "EXCLUSIVE_PROCESS").await
    }

    async fn set_default(&self, uuid: &str) -> Result<(), CoreError> {
        run_admin(uuid, "DEFAULT").await
    }
}

async fn run_admin(uuid: &str, mode: &str) -> Result<(), CoreError> {
    let status = tokio::process::Command::new(ADMIN_BINARY)
        .arg("-i")
        .arg(uuid)
        .arg("-c")
        .arg(mode)
        .status()
        .await
        .map_err(|e| CoreError::Subprocess {
            resource: uuid.to_string(),
            message: format!("{} invocation failed: {}", ADMIN_BINARY, e),
        })?;
    if !status.success() {
        return Err(CoreError::Subprocess {
            resource: uuid.to_string(),
            message: format!("{} exited with {}", ADMIN_BINARY, status),
        });
    }
    Ok(())
}
