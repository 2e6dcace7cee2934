//! Service process runtime.
//!
//! The supervisor talks to instances only through [`ServiceRuntime`], so the
//! same control loop drives local processes and test doubles.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use tokio::process::Command;
use tokio::sync::{oneshot, watch, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::ServiceDescriptor;
use crate::error::SupervisorError;

/// Identifier of one running instance. A restart yields a new id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceId(Uuid);

impl InstanceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let id = self.0.simple().to_string();
        f.write_str(&id[..8])
    }
}

/// Starts, watches and stops service instances
#[async_trait]
pub trait ServiceRuntime: Send + Sync {
    /// Launch one instance of `service` with the given environment
    async fn start(&self, service: &ServiceDescriptor, env: &BTreeMap<String, String>) -> Result<InstanceId>;

    /// Wait for the instance to exit and return its exit code
    async fn wait_exit(&self, id: InstanceId) -> Result<Option<i32>>;

    /// Stop the instance. Stopping an unknown or exited instance is not an error.
    async fn stop(&self, id: InstanceId) -> Result<()>;
}

struct ProcessHandle {
    kill: Option<oneshot::Sender<()>>,
    exit: watch::Receiver<Option<Option<i32>>>,
}

/// Runs each instance as a local child process
#[derive(Default)]
pub struct ProcessRuntime {
    processes: Mutex<HashMap<InstanceId, ProcessHandle>>,
}

impl ProcessRuntime {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ServiceRuntime for ProcessRuntime {
    async fn start(&self, service: &ServiceDescriptor, env: &BTreeMap<String, String>) -> Result<InstanceId> {
        let (program, args) = service.command.split_first().ok_or_else(|| SupervisorError::StartFailed {
            service: service.name.clone(),
            message: "no command configured".to_string(),
        })?;

        let program = which::which(program).map_err(|e| SupervisorError::StartFailed {
            service: service.name.clone(),
            message: format!("{}: {}", program, e),
        })?;

        let mut child = Command::new(&program)
            .args(args)
            .envs(env)
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn {} for {}", program.display(), service.name))?;

        let id = InstanceId::new();
        debug!("Started {} as {} (pid {:?})", service.name, id, child.id());

        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let (exit_tx, exit_rx) = watch::channel(None);
        let name = service.name.clone();

        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx => {
                    if let Err(e) = child.start_kill() {
                        warn!("Failed to signal {} ({}): {}", name, id, e);
                    }
                    child.wait().await
                }
            };
            let code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!("Lost track of {} ({}): {}", name, id, e);
                    None
                }
            };
            let _ = exit_tx.send(Some(code));
        });

        self.processes.lock().await.insert(
            id,
            ProcessHandle {
                kill: Some(kill_tx),
                exit: exit_rx,
            },
        );
        Ok(id)
    }

    async fn wait_exit(&self, id: InstanceId) -> Result<Option<i32>> {
        let mut exit = {
            let processes = self.processes.lock().await;
            let handle = processes
                .get(&id)
                .ok_or_else(|| anyhow::anyhow!("Unknown instance {}", id))?;
            handle.exit.clone()
        };

        let code = *exit
            .wait_for(Option::is_some)
            .await
            .with_context(|| format!("Instance {} vanished before exiting", id))?;
        Ok(code.flatten())
    }

    async fn stop(&self, id: InstanceId) -> Result<()> {
        let Some(mut handle) = self.processes.lock().await.remove(&id) else {
            return Ok(());
        };

        if let Some(kill) = handle.kill.take() {
            let _ = kill.send(());
        }
        // The watcher task always publishes an exit status
        let _ = handle.exit.wait_for(Option::is_some).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ServiceRole;

    fn service(command: &[&str]) -> ServiceDescriptor {
        ServiceDescriptor::new("job", ServiceRole::Initializer, "local").with_command(command.iter().copied())
    }

    #[tokio::test]
    async fn test_exit_code_reported() {
        let runtime = ProcessRuntime::new();

        let ok = runtime.start(&service(&["true"]), &BTreeMap::new()).await.unwrap();
        assert_eq!(runtime.wait_exit(ok).await.unwrap(), Some(0));

        let failed = runtime.start(&service(&["false"]), &BTreeMap::new()).await.unwrap();
        assert_eq!(runtime.wait_exit(failed).await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_environment_passed() {
        let runtime = ProcessRuntime::new();
        let env = BTreeMap::from([("STACKGATE_EXPECTED".to_string(), "42".to_string())]);

        let id = runtime
            .start(&service(&["sh", "-c", "test \"$STACKGATE_EXPECTED\" = 42"]), &env)
            .await
            .unwrap();
        assert_eq!(runtime.wait_exit(id).await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn test_stop_kills_long_running_instance() {
        let runtime = ProcessRuntime::new();
        let id = runtime.start(&service(&["sleep", "30"]), &BTreeMap::new()).await.unwrap();

        runtime.stop(id).await.unwrap();
        // Second stop is a no-op
        runtime.stop(id).await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_command_rejected() {
        let runtime = ProcessRuntime::new();
        let err = runtime.start(&service(&[]), &BTreeMap::new()).await.unwrap_err();
        assert!(err.to_string().contains("no command configured"));

        let err = runtime
            .start(&service(&["stackgate-definitely-not-installed"]), &BTreeMap::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failed to start"));
    }
}
