//! The compute-server's line-command control channel. Spec §4.6/§6: the
//! vendor control binary is invoked with the command piped to its stdin;
//! this module only specifies the four commands, not the wire transport.

use crate::error::CoreError;
use async_trait::async_trait;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Sends one line command to the compute-server's control pipe and waits
/// for acknowledgement.
#[async_trait]
pub trait ControlChannel: Send + Sync {
    async fn send(&self, command: &str) -> Result<(), CoreError>;
}

/// Default [`ControlChannel`] that shells out to the vendor control binary
/// with the command piped to stdin, per spec §6.
pub struct SubprocessControlChannel {
    pub control_binary: std::path::PathBuf,
    pub pipe_dir: std::path::PathBuf,
    pub resource_name: String,
}

#[async_trait]
impl ControlChannel for SubprocessControlChannel {
    async fn send(&self, command: &str) -> Result<(), CoreError> {
        let mut child = Command::new(&self.control_binary)
            .arg("-d")
            .arg(&self.pipe_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .map_err(|e| CoreError::ControlChannel {
                resource: self.resource_name.clone(),
                message: format!("could not spawn control binary: {}", e),
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(format!("{}\n", command).as_bytes())
                .await
                .map_err(|e| CoreError::ControlChannel {
                    resource: self.resource_name.clone(),
                    message: format!("could not write command {:?}: {}", command, e),
                })?;
        }

        let status = child.wait().await.map_err(|e| CoreError::ControlChannel {
            resource: self.resource_name.clone(),
            message: format!("control binary wait failed: {}", e),
        })?;

        if !status.success() {
            return Err(CoreError::ControlChannel {
                resource: self.resource_name.clone(),
                message: format!("control binary exited with {} for command {:?}", status, command),
            });
        }
        Ok(())
    }
}

/// Records every command sent, for assertions in [`crate::supervisor`]
/// tests, mirroring the teacher's fake-collaborator test pattern.
pub struct FakeControlChannel {
    pub sent: Arc<Mutex<Vec<String>>>,
    pub fail_on: Option<String>,
}

impl FakeControlChannel {
    pub fn new() -> Self {
        FakeControlChannel {
            sent: Arc::new(Mutex::new(Vec::new())),
            fail_on: None,
        }
    }

    pub fn failing_on(command: impl Into<String>) -> Self {
        FakeControlChannel {
            sent: Arc::new(Mutex::new(Vec::new())),
            fail_on: Some(command.into()),
        }
    }
}

#[async_trait]
impl ControlChannel for FakeControlChannel {
    async fn send(&self, command: &str) -> Result<(), CoreError> {
        if self.fail_on.as_deref() == Some(command) {
            return Err(CoreError::ControlChannel {
                resource: "fake".to_string(),
                message: format!("forced failure on {:?}", command),
            });
        }
        self.sent.lock().unwrap().push(command.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_channel_records_commands_in_order() {
        let channel = FakeControlChannel::new();
        channel.send("set_default_active_thread_percentage 25").await.unwrap();
        channel.send("quit").await.unwrap();
        assert_eq!(
            *channel.sent.lock().unwrap(),
            vec![
                "set_default_active_thread_percentage 25".to_string(),
                "quit".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn fake_channel_fails_on_configured_command() {
        let channel = FakeControlChannel::failing_on("quit");
        assert!(channel.send("quit").await.is_err());
    }
}
