//! Ephemeral per-job container lifecycle, over the Docker API.
//!
//! Each job gets a fresh container with git and the agent CLI in it;
//! the working copy lives at a stable path inside. `stop` removes the
//! container; `Drop` is a backstop that force-removes it if a job
//! unwinds without reaching the explicit stop, so no exit path leaks
//! a container.

use std::time::Duration;

use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, RemoveContainerOptions,
    StartContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::Docker;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use uuid::Uuid;

use crate::errors::JobError;

/// Stable path of the per-job working copy inside the container.
pub const REPO_DIR: &str = "/repo";

#[derive(Debug)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

fn docker_err(what: &str, e: bollard::errors::Error) -> JobError {
    JobError::Sandbox(format!("{}: {}", what, e))
}

pub struct Sandbox {
    docker: Docker,
    container_id: String,
    stopped: bool,
}

impl Sandbox {
    /// Start a container that idles until we exec into it.
    pub async fn start(image: &str) -> Result<Sandbox, JobError> {
        let docker = Docker::connect_with_socket_defaults()
            .map_err(|e| docker_err("cannot reach the Docker daemon", e))?;
        docker
            .ping()
            .await
            .map_err(|e| docker_err("Docker daemon did not answer ping", e))?;

        let name = format!("reviewd-{}", Uuid::new_v4());
        let created = docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    ..Default::default()
                }),
                Config {
                    image: Some(image.to_string()),
                    cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| docker_err("container creation failed", e))?;
        docker
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| docker_err("container start failed", e))?;

        info!("Started sandbox container {}", name);
        Ok(Sandbox {
            docker,
            container_id: created.id,
            stopped: false,
        })
    }

    async fn exec_inner(
        &self,
        argv: &[&str],
        stdin: Option<&[u8]>,
    ) -> Result<ExecOutput, JobError> {
        let exec = self
            .docker
            .create_exec(
                &self.container_id,
                CreateExecOptions {
                    cmd: Some(argv.iter().map(|s| s.to_string()).collect()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    attach_stdin: Some(stdin.is_some()),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| docker_err("exec creation failed", e))?;

        let mut stdout = String::new();
        let mut stderr = String::new();
        match self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| docker_err("exec start failed", e))?
        {
            StartExecResults::Attached {
                mut output,
                mut input,
            } => {
                if let Some(bytes) = stdin {
                    input
                        .write_all(bytes)
                        .await
                        .map_err(|e| JobError::Sandbox(format!("exec stdin write failed: {}", e)))?;
                    input.shutdown().await.map_err(|e| {
                        JobError::Sandbox(format!("exec stdin close failed: {}", e))
                    })?;
                }
                while let Some(chunk) = output.next().await {
                    use bollard::container::LogOutput;
                    match chunk.map_err(|e| docker_err("exec stream failed", e))? {
                        LogOutput::StdOut { message } => {
                            stdout.push_str(&String::from_utf8_lossy(&message));
                        }
                        LogOutput::StdErr { message } => {
                            stderr.push_str(&String::from_utf8_lossy(&message));
                        }
                        _ => {}
                    }
                }
            }
            StartExecResults::Detached => {}
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| docker_err("exec inspect failed", e))?;
        Ok(ExecOutput {
            stdout,
            stderr,
            exit_code: inspect.exit_code.unwrap_or(-1) as i32,
        })
    }

    /// Run a command inside the container and capture its output.
    pub async fn exec(&self, argv: &[&str]) -> Result<ExecOutput, JobError> {
        self.exec_inner(argv, None).await
    }

    /// Run a command under a hard wall clock. On expiry the container
    /// is killed and the job sees `SandboxTimeout`.
    pub async fn exec_with_timeout(
        &self,
        argv: &[&str],
        timeout: Duration,
    ) -> Result<ExecOutput, JobError> {
        match tokio::time::timeout(timeout, self.exec_inner(argv, None)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    "Sandbox exec exceeded {}s, killing container",
                    timeout.as_secs()
                );
                let _ = self
                    .docker
                    .kill_container(&self.container_id, None::<KillContainerOptions<String>>)
                    .await;
                Err(JobError::SandboxTimeout)
            }
        }
    }

    /// Run a shell command line inside the container.
    pub async fn exec_shell(&self, script: &str) -> Result<ExecOutput, JobError> {
        self.exec(&["sh", "-c", script]).await
    }

    /// Write a file inside the container by streaming the content over
    /// the exec's stdin. Avoids embedding the content in a shell
    /// command line, so prompt text can never collide with quoting.
    pub async fn write_file(&self, path: &str, content: &str) -> Result<(), JobError> {
        let script = format!("cat > '{}'", path);
        let output = self
            .exec_inner(&["sh", "-c", &script], Some(content.as_bytes()))
            .await?;
        if !output.success() {
            return Err(JobError::Sandbox(format!(
                "writing {} failed: {}",
                path,
                output.stderr.trim()
            )));
        }
        Ok(())
    }

    /// Remove the container. Called on every exit path; `Drop` covers
    /// paths that never get here.
    pub async fn stop(mut self) {
        self.stopped = true;
        let removed = self
            .docker
            .remove_container(
                &self.container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await;
        match removed {
            Ok(()) => info!("Removed sandbox container {}", self.container_id),
            Err(e) => warn!(
                "Failed to remove sandbox container {}: {}",
                self.container_id, e
            ),
        }
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        if self.stopped {
            return;
        }
        // Drop cannot await; hand the removal to the runtime.
        let docker = self.docker.clone();
        let container_id = self.container_id.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = docker
                    .remove_container(
                        &container_id,
                        Some(RemoveContainerOptions {
                            force: true,
                            ..Default::default()
                        }),
                    )
                    .await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_output_success() {
        let ok = ExecOutput {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: 0,
        };
        assert!(ok.success());

        let failed = ExecOutput {
            stdout: String::new(),
            stderr: "fatal: not a git repository".to_string(),
            exit_code: 128,
        };
        assert!(!failed.success());
    }

    #[tokio::test]
    async fn test_start_does_not_panic_without_docker() {
        // Passes with or without a reachable Docker daemon: a missing
        // daemon or missing image is an error, never a panic.
        if let Ok(sandbox) = Sandbox::start("reviewd-sandbox-test-image").await {
            sandbox.stop().await;
        }
    }
}
