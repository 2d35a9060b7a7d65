//! Sandbox adapter.
//!
//! The execution environment is opaque to the orchestrator: it can be woken,
//! asked to run shell commands, and dialed on internal TCP ports.  Container
//! bring-up, process supervision, and git plumbing all live behind this seam.
//! [`ProcessSandbox`] is the development implementation — commands run as
//! local child processes on the same host.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// The readiness poll exhausted its attempts.
    #[error("sandbox unavailable: {0}")]
    Unavailable(String),
    #[error("sandbox exec failed: {0}")]
    Exec(String),
}

#[derive(Debug, Clone)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// The primitives the orchestrator needs from any sandbox.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Wake the environment (start the container, resume the VM, …).  A
    /// no-op when it is already running.
    async fn wake(&self) -> Result<(), SandboxError>;

    /// Install environment secrets that every subsequent command (and the
    /// engine) should see.
    async fn install_env(&self, env: HashMap<String, String>) -> Result<(), SandboxError>;

    /// Run a shell command inside the sandbox with extra environment
    /// variables applied on top of the installed set.
    async fn exec(&self, command: &str, env: &HashMap<String, String>)
    -> Result<ExecResult, SandboxError>;

    /// URL of the bridge's WS-UPLINK port as reachable from the orchestrator.
    fn uplink_url(&self) -> String;
}

/// Poll `exec("echo ready")` until the sandbox answers, `attempts` times at
/// `interval`.  Exhaustion is [`SandboxError::Unavailable`].
pub async fn wait_ready(
    sandbox: &dyn Sandbox,
    attempts: u32,
    interval: Duration,
) -> Result<(), SandboxError> {
    let env = HashMap::new();
    for attempt in 1..=attempts {
        match sandbox.exec("echo ready", &env).await {
            Ok(result) if result.stdout.trim() == "ready" => {
                debug!(attempt, "sandbox ready");
                return Ok(());
            }
            Ok(result) => {
                debug!(attempt, exit = result.exit_code, "sandbox not ready yet");
            }
            Err(err) => {
                debug!(attempt, %err, "sandbox readiness probe failed");
            }
        }
        if attempt < attempts {
            tokio::time::sleep(interval).await;
        }
    }
    Err(SandboxError::Unavailable(format!(
        "readiness poll exhausted after {attempts} attempts"
    )))
}

/// Local-process sandbox: commands run on this host via `sh -c`.
pub struct ProcessSandbox {
    /// Working directory for executed commands.
    workdir: String,
    /// Host and port where the bridge's uplink listener is reachable.
    uplink_host: String,
    uplink_port: u16,
    installed_env: tokio::sync::Mutex<HashMap<String, String>>,
}

impl ProcessSandbox {
    pub fn new(workdir: impl Into<String>, uplink_host: impl Into<String>, uplink_port: u16) -> Self {
        Self {
            workdir: workdir.into(),
            uplink_host: uplink_host.into(),
            uplink_port,
            installed_env: tokio::sync::Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl Sandbox for ProcessSandbox {
    async fn wake(&self) -> Result<(), SandboxError> {
        // A local process environment is always awake.
        info!("sandbox wake requested (local process — nothing to do)");
        Ok(())
    }

    async fn install_env(&self, env: HashMap<String, String>) -> Result<(), SandboxError> {
        self.installed_env.lock().await.extend(env);
        Ok(())
    }

    async fn exec(
        &self,
        command: &str,
        env: &HashMap<String, String>,
    ) -> Result<ExecResult, SandboxError> {
        let installed = self.installed_env.lock().await.clone();
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.workdir)
            .envs(installed)
            .envs(env)
            .output()
            .await
            .map_err(|e| SandboxError::Exec(e.to_string()))?;

        let result = ExecResult {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        };
        if !result.success() {
            warn!(command, exit = result.exit_code, "sandbox command failed");
        }
        Ok(result)
    }

    fn uplink_url(&self) -> String {
        format!("ws://{}:{}/", self.uplink_host, self.uplink_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sandbox() -> ProcessSandbox {
        ProcessSandbox::new(".", "127.0.0.1", 9292)
    }

    #[tokio::test]
    async fn exec_captures_stdout_and_exit_code() {
        let result = sandbox().exec("echo hello", &HashMap::new()).await.unwrap();
        assert!(result.success());
        assert_eq!(result.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn exec_reports_failure_exit_codes() {
        let result = sandbox().exec("exit 3", &HashMap::new()).await.unwrap();
        assert_eq!(result.exit_code, 3);
        assert!(!result.success());
    }

    #[tokio::test]
    async fn exec_applies_extra_env() {
        let mut env = HashMap::new();
        env.insert("MINDER_TEST_VAR".to_string(), "42".to_string());
        let result = sandbox()
            .exec("echo $MINDER_TEST_VAR", &env)
            .await
            .unwrap();
        assert_eq!(result.stdout.trim(), "42");
    }

    #[tokio::test]
    async fn installed_env_persists_across_execs() {
        let sandbox = sandbox();
        sandbox
            .install_env(HashMap::from([(
                "MINDER_INSTALLED".to_string(),
                "yes".to_string(),
            )]))
            .await
            .unwrap();
        let result = sandbox
            .exec("echo $MINDER_INSTALLED", &HashMap::new())
            .await
            .unwrap();
        assert_eq!(result.stdout.trim(), "yes");
    }

    #[tokio::test]
    async fn wait_ready_succeeds_immediately_on_a_live_sandbox() {
        let sandbox = sandbox();
        wait_ready(&sandbox, 3, Duration::from_millis(10)).await.unwrap();
    }

    #[tokio::test]
    async fn uplink_url_shape() {
        assert_eq!(sandbox().uplink_url(), "ws://127.0.0.1:9292/");
    }
}
