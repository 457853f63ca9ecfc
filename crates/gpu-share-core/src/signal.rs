//! The outer build → start → park → (reload|terminate) loop that owns the
//! process lifetime. Spec §4.7/§9: modeled as an outer loop, not mutation
//! of a live map — every reload starts from a fresh enumeration.

use crate::error::CoreError;
use crate::supervisor::Supervisor;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{error, info, warn};

/// Back-off before retrying a failed supervisor bring-up, per spec §4.6/§4.7.
pub const RESTART_BACKOFF: Duration = Duration::from_secs(30);

/// The two signals the Signal Loop recognizes, per spec §6.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlSignal {
    /// SIGHUP: rebuild from a fresh enumeration.
    Reload,
    /// SIGINT/SIGTERM/SIGQUIT: stop everything and exit.
    Terminate,
}

/// Where the Signal Loop gets its control signals. External collaborator
/// in production (the OS); fully fake-able in tests.
#[async_trait]
pub trait SignalSource: Send {
    async fn next(&mut self) -> ControlSignal;
}

/// [`SignalSource`] backed by `tokio::signal`'s unix signal handlers.
#[cfg(unix)]
pub struct OsSignalSource {
    hangup: tokio::signal::unix::Signal,
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
    quit: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl OsSignalSource {
    pub fn new() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(OsSignalSource {
            hangup: signal(SignalKind::hangup())?,
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
            quit: signal(SignalKind::quit())?,
        })
    }
}

#[cfg(unix)]
#[async_trait]
impl SignalSource for OsSignalSource {
    async fn next(&mut self) -> ControlSignal {
        tokio::select! {
            _ = self.hangup.recv() => ControlSignal::Reload,
            _ = self.interrupt.recv() => ControlSignal::Terminate,
            _ = self.terminate.recv() => ControlSignal::Terminate,
            _ = self.quit.recv() => ControlSignal::Terminate,
        }
    }
}

/// Builds the resource map and the set of supervisors for the shared-server
/// resources within it, performing a fresh device enumeration each time
/// it's called. The Signal Loop treats every build as authoritative and
/// discards whatever it built last time, per spec §4.7's idempotency rule.
#[async_trait]
pub trait Environment: Send + Sync {
    async fn build_supervisors(&self) -> Result<BTreeMap<String, Supervisor>, CoreError>;
}

/// Outcome of one full run of the loop, for the binary entrypoint to map
/// onto an exit code (spec §6: 0 clean shutdown, 1 unrecoverable startup
/// error).
#[derive(Debug)]
pub enum LoopExit {
    Terminated,
    FatalBuildError(CoreError),
}

/// Drives the process lifetime: build, start all supervisors, park on the
/// signal source, and react to reload/terminate. Spec §4.7.
pub struct SignalLoop<E: Environment> {
    environment: E,
    supervisors: BTreeMap<String, Supervisor>,
}

impl<E: Environment> SignalLoop<E> {
    pub fn new(environment: E) -> Self {
        SignalLoop {
            environment,
            supervisors: BTreeMap::new(),
        }
    }

    /// Runs until a terminate signal is received or a build is fatally
    /// unrecoverable. `sleep` is injected so tests don't wait out the real
    /// 30s back-off.
    pub async fn run<S, F, Fut>(&mut self, mut signals: S, sleep: F) -> LoopExit
    where
        S: SignalSource,
        F: Fn(Duration) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        loop {
            match self.build_and_start().await {
                Ok(true) => {}
                Ok(false) => {
                    warn!("supervisor bring-up failed, backing off before retry");
                    sleep(RESTART_BACKOFF).await;
                    continue;
                }
                Err(e) => {
                    error!("fatal error building resource map: {}", e);
                    return LoopExit::FatalBuildError(e);
                }
            }

            match signals.next().await {
                ControlSignal::Reload => {
                    info!("reload signal received, rebuilding");
                    self.teardown().await;
                    continue;
                }
                ControlSignal::Terminate => {
                    info!("terminate signal received, shutting down");
                    self.teardown().await;
                    return LoopExit::Terminated;
                }
            }
        }
    }

    /// Builds a fresh supervisor set and starts every supervisor in it.
    /// Returns `Ok(false)` (not an error) when build succeeded but at least
    /// one supervisor failed to start, per spec §4.7 step 2's "stop the set
    /// and schedule a restart" policy — a build/library error is the only
    /// case that's `Err`.
    async fn build_and_start(&mut self) -> Result<bool, CoreError> {
        self.teardown().await;
        let mut supervisors = self.environment.build_supervisors().await?;

        let mut all_started = true;
        for (name, supervisor) in supervisors.iter_mut() {
            if let Err(e) = supervisor.start().await {
                error!(resource = %name, error = %e, "supervisor failed to start");
                all_started = false;
                break;
            }
        }

        if !all_started {
            for (_, supervisor) in supervisors.iter_mut() {
                let _ = supervisor.stop().await;
            }
            return Ok(false);
        }

        self.supervisors = supervisors;
        Ok(true)
    }

    async fn teardown(&mut self) {
        for (name, supervisor) in self.supervisors.iter_mut() {
            if let Err(e) = supervisor.stop().await {
                warn!(resource = %name, error = %e, "error stopping supervisor during teardown");
            }
        }
        self.supervisors.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::control::FakeControlChannel;
    use crate::supervisor::{ComputeModeAdmin, LogTail, OwnedDevice, ServerProcessLauncher, SupervisorPaths};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    struct NoopAdmin;
    #[async_trait]
    impl ComputeModeAdmin for NoopAdmin {
        async fn set_exclusive(&self, _uuid: &str) -> Result<(), CoreError> {
            Ok(())
        }
        async fn set_default(&self, _uuid: &str) -> Result<(), CoreError> {
            Ok(())
        }
    }

    struct NoopTail;
    #[async_trait]
    impl LogTail for NoopTail {
        async fn stop(&mut self) {}
    }

    struct NoopLauncher;
    #[async_trait]
    impl ServerProcessLauncher for NoopLauncher {
        async fn spawn_server(&self, _r: &str, _p: &PathBuf, _l: &PathBuf) -> Result<(), CoreError> {
            Ok(())
        }
        async fn spawn_log_tail(&self, _log_dir: &PathBuf) -> Result<Box<dyn LogTail>, CoreError> {
            Ok(Box::new(NoopTail))
        }
    }

    struct ScriptedSignalSource {
        signals: Vec<ControlSignal>,
        index: usize,
    }

    #[async_trait]
    impl SignalSource for ScriptedSignalSource {
        async fn next(&mut self) -> ControlSignal {
            let s = self.signals[self.index];
            self.index += 1;
            s
        }
    }

    struct FixedEnvironment {
        build_count: Arc<AtomicUsize>,
        root: PathBuf,
    }

    #[async_trait]
    impl Environment for FixedEnvironment {
        async fn build_supervisors(&self) -> Result<BTreeMap<String, Supervisor>, CoreError> {
            self.build_count.fetch_add(1, Ordering::SeqCst);
            let mut map = BTreeMap::new();
            map.insert(
                "gpu".to_string(),
                Supervisor::new(
                    "gpu",
                    vec![OwnedDevice {
                        uuid: "GPU-A".to_string(),
                        index: "0".to_string(),
                        total_memory_bytes: 1024 * 1024 * 1024,
                        compute_capability: (7, 5),
                    }],
                    1,
                    SupervisorPaths::new(&self.root, "gpu"),
                    Box::new(NoopAdmin),
                    Box::new(NoopLauncher),
                    Box::new(FakeControlChannel::new()),
                ),
            );
            Ok(map)
        }
    }

    #[tokio::test]
    async fn reload_rebuilds_then_terminate_exits_cleanly() {
        let root = tempfile::tempdir().unwrap();
        let build_count = Arc::new(AtomicUsize::new(0));
        let environment = FixedEnvironment {
            build_count: build_count.clone(),
            root: root.path().to_path_buf(),
        };
        let mut signal_loop = SignalLoop::new(environment);
        let signals = ScriptedSignalSource {
            signals: vec![ControlSignal::Reload, ControlSignal::Terminate],
            index: 0,
        };

        let exit = signal_loop.run(signals, |_| async {}).await;
        assert!(matches!(exit, LoopExit::Terminated));
        assert_eq!(build_count.load(Ordering::SeqCst), 2);
        assert!(signal_loop.supervisors.is_empty());
    }

    #[tokio::test]
    async fn fatal_build_error_returns_immediately() {
        struct FailingEnvironment;
        #[async_trait]
        impl Environment for FailingEnvironment {
            async fn build_supervisors(&self) -> Result<BTreeMap<String, Supervisor>, CoreError> {
                Err(CoreError::Configuration("bad config".to_string()))
            }
        }
        let mut signal_loop = SignalLoop::new(FailingEnvironment);
        let signals = ScriptedSignalSource {
            signals: vec![],
            index: 0,
        };
        let exit = signal_loop.run(signals, |_| async {}).await;
        assert!(matches!(exit, LoopExit::FatalBuildError(_)));
    }

    #[tokio::test]
    async fn failed_supervisor_start_backs_off_then_retries() {
        struct OnceFailingEnvironment {
            attempts: Arc<AtomicUsize>,
            root: PathBuf,
        }
        #[async_trait]
        impl Environment for OnceFailingEnvironment {
            async fn build_supervisors(&self) -> Result<BTreeMap<String, Supervisor>, CoreError> {
                let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
                let mut map = BTreeMap::new();
                let channel = if attempt == 0 {
                    FakeControlChannel::failing_on("set_default_active_thread_percentage 100")
                } else {
                    FakeControlChannel::new()
                };
                map.insert(
                    "gpu".to_string(),
                    Supervisor::new(
                        "gpu",
                        vec![OwnedDevice {
                            uuid: "GPU-A".to_string(),
                            index: "0".to_string(),
                            total_memory_bytes: 0,
                            compute_capability: (7, 5),
                        }],
                        1,
                        SupervisorPaths::new(&self.root, "gpu"),
                        Box::new(NoopAdmin),
                        Box::new(NoopLauncher),
                        Box::new(channel),
                    ),
                );
                Ok(map)
            }
        }

        let root = tempfile::tempdir().unwrap();
        let attempts = Arc::new(AtomicUsize::new(0));
        let environment = OnceFailingEnvironment {
            attempts: attempts.clone(),
            root: root.path().to_path_buf(),
        };
        let mut signal_loop = SignalLoop::new(environment);
        let signals = ScriptedSignalSource {
            signals: vec![ControlSignal::Terminate],
            index: 0,
        };
        let sleep_calls = Arc::new(Mutex::new(0));
        let sleep_calls2 = sleep_calls.clone();

        let exit = signal_loop
            .run(signals, move |_| {
                let sleep_calls = sleep_calls2.clone();
                async move {
                    *sleep_calls.lock().unwrap() += 1;
                }
            })
            .await;

        assert!(matches!(exit, LoopExit::Terminated));
        assert_eq!(*sleep_calls.lock().unwrap(), 1);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }
}
