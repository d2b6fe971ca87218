//! Docker implementation of the sandbox engine.

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogOutput,
        RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
        UploadToContainerOptions,
    },
    errors::Error as BollardError,
    exec::{CreateExecOptions, StartExecOptions, StartExecResults},
    image::CreateImageOptions,
    models::HostConfig,
    Docker,
};
use bytes::Bytes;
use execbox_utils::SANDBOX_RUNTIME_LABEL;
use futures::StreamExt;

use crate::{
    config::CPU_PERIOD_MICROS,
    engine::{
        AttachedProcess, ProcessOutput, SandboxEngine, SandboxSpec, SandboxState, SandboxSummary,
    },
    ExecboxError, ExecboxResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Keeps a sandbox alive between executions and lets it stop promptly.
const KEEP_ALIVE_SCRIPT: &str = "trap 'exit 0' TERM; while true; do sleep 1; done";

/// Where process pids are recorded. Kept out of the execution paths, which user code can write.
const PID_DIR: &str = "/run/execbox";

/// Records the shell's pid in the file `$1`, then replaces itself with a shell running `$2`.
const RUN_SCRIPT: &str = r#"mkdir -p "${1%/*}" && echo $$ > "$1" && exec /bin/sh -c "$2""#;

/// Kills the process tree whose root pid is stored in the file `$1` and removes the file.
const KILL_TREE_SCRIPT: &str = r#"pidfile="$1"
kill_tree() {
  for child in $(cat /proc/"$1"/task/*/children 2>/dev/null); do kill_tree "$child"; done
  kill -KILL "$1" 2>/dev/null
}
[ -f "$pidfile" ] && kill_tree "$(cat "$pidfile")"
rm -f "$pidfile"
exit 0"#;

/// How often and how long to wait for Docker to report an exec's exit code.
const EXIT_CODE_POLL_INTERVAL: Duration = Duration::from_millis(25);
const EXIT_CODE_POLL_ATTEMPTS: usize = 40;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A [`SandboxEngine`] backed by a Docker daemon. Each sandbox is a long-lived container and each
/// process is a `docker exec`.
#[derive(Debug, Clone)]
pub struct DockerEngine {
    docker: Docker,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl DockerEngine {
    /// Connects to the local Docker daemon using the platform defaults (`DOCKER_HOST` or the
    /// default socket).
    pub fn connect() -> ExecboxResult<Self> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker })
    }

    /// Wraps an existing Docker client.
    pub fn with_client(docker: Docker) -> Self {
        Self { docker }
    }

    /// Runs a command to completion and returns its exit code and stderr.
    async fn run_to_completion(
        &self,
        sandbox_id: &str,
        cmd: Vec<String>,
    ) -> ExecboxResult<(i64, String)> {
        let exec = self
            .docker
            .create_exec(
                sandbox_id,
                CreateExecOptions {
                    cmd: Some(cmd),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    tty: Some(false),
                    ..Default::default()
                },
            )
            .await?;

        let mut stderr = String::new();
        if let StartExecResults::Attached { mut output, .. } = self
            .docker
            .start_exec(&exec.id, Some(exec_start_options()))
            .await?
        {
            while let Some(chunk) = output.next().await {
                if let LogOutput::StdErr { message } = chunk? {
                    stderr.push_str(&String::from_utf8_lossy(&message));
                }
            }
        }

        let code = self.wait_exit_code(&exec.id).await?.unwrap_or(1);
        Ok((code, stderr))
    }

    async fn wait_exit_code(&self, exec_id: &str) -> ExecboxResult<Option<i64>> {
        for _ in 0..EXIT_CODE_POLL_ATTEMPTS {
            if let Some(code) = self.process_exit_code(exec_id).await? {
                return Ok(Some(code));
            }
            tokio::time::sleep(EXIT_CODE_POLL_INTERVAL).await;
        }
        Ok(None)
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl SandboxEngine for DockerEngine {
    async fn list_sandboxes(&self, runtime_id: &str) -> ExecboxResult<Vec<SandboxSummary>> {
        let filters = HashMap::from([(
            "label".to_string(),
            vec![format!("{}={}", SANDBOX_RUNTIME_LABEL, runtime_id)],
        )]);

        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                filters,
                ..Default::default()
            }))
            .await?;

        Ok(containers
            .into_iter()
            .filter_map(|container| {
                Some(SandboxSummary {
                    id: container.id?,
                    image: container.image.unwrap_or_default(),
                    state: state_from_status(container.state.as_deref().unwrap_or_default()),
                })
            })
            .collect())
    }

    async fn inspect_sandbox(&self, sandbox_id: &str) -> ExecboxResult<SandboxState> {
        let response = self
            .docker
            .inspect_container(sandbox_id, None::<InspectContainerOptions>)
            .await?;

        let Some(state) = response.state else {
            return Ok(SandboxState::Stopped);
        };

        Ok(if state.paused == Some(true) {
            SandboxState::Paused
        } else if state.restarting == Some(true) {
            SandboxState::Starting
        } else if state.running == Some(true) {
            SandboxState::Running
        } else {
            SandboxState::Stopped
        })
    }

    async fn start_sandbox(&self, sandbox_id: &str) -> ExecboxResult<()> {
        self.docker
            .start_container(sandbox_id, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn unpause_sandbox(&self, sandbox_id: &str) -> ExecboxResult<()> {
        self.docker.unpause_container(sandbox_id).await?;
        Ok(())
    }

    async fn ensure_image(&self, image: &str) -> ExecboxResult<()> {
        match self.docker.inspect_image(image).await {
            Ok(_) => {
                tracing::debug!("image {} already exists", image);
                return Ok(());
            }
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => {}
            Err(e) => return Err(e.into()),
        }

        tracing::info!("pulling image {}", image);
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };

        let mut progress = self.docker.create_image(Some(options), None, None);
        while let Some(info) = progress.next().await {
            if let Some(status) = info?.status {
                tracing::debug!("{}: {}", image, status);
            }
        }

        tracing::info!("successfully pulled {}", image);
        Ok(())
    }

    async fn create_sandbox(&self, spec: &SandboxSpec) -> ExecboxResult<String> {
        let network_enabled = spec.limits.get_network_enabled();
        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                KEEP_ALIVE_SCRIPT.to_string(),
            ]),
            labels: Some(HashMap::from([(
                SANDBOX_RUNTIME_LABEL.to_string(),
                spec.runtime.clone(),
            )])),
            tty: Some(false),
            open_stdin: Some(true),
            network_disabled: Some(!network_enabled),
            host_config: Some(HostConfig {
                auto_remove: Some(false),
                memory: Some(spec.limits.memory_bytes()),
                cpu_period: Some(CPU_PERIOD_MICROS),
                cpu_quota: Some(spec.limits.cpu_quota_micros()),
                network_mode: (!network_enabled).then(|| "none".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };

        let response = self
            .docker
            .create_container(None::<CreateContainerOptions<String>>, config)
            .await?;

        for warning in &response.warnings {
            tracing::warn!("sandbox {} created with warning: {}", response.id, warning);
        }

        Ok(response.id)
    }

    async fn remove_sandbox(&self, sandbox_id: &str) -> ExecboxResult<()> {
        if let Err(e) = self
            .docker
            .stop_container(sandbox_id, Some(StopContainerOptions { t: 1 }))
            .await
        {
            tracing::debug!("stopping sandbox {} failed: {}", sandbox_id, e);
        }

        self.docker
            .remove_container(
                sandbox_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await?;
        Ok(())
    }

    async fn make_dir(&self, sandbox_id: &str, path: &str) -> ExecboxResult<()> {
        let cmd = vec!["mkdir".to_string(), "-p".to_string(), path.to_string()];
        match self.run_to_completion(sandbox_id, cmd).await? {
            (0, _) => Ok(()),
            (code, stderr) => Err(ExecboxError::Engine(format!(
                "mkdir {} exited with {}: {}",
                path,
                code,
                stderr.trim()
            ))),
        }
    }

    async fn remove_dir(&self, sandbox_id: &str, path: &str) -> ExecboxResult<()> {
        let cmd = vec!["rm".to_string(), "-rf".to_string(), path.to_string()];
        match self.run_to_completion(sandbox_id, cmd).await? {
            (0, _) => Ok(()),
            (code, stderr) => Err(ExecboxError::Engine(format!(
                "rm {} exited with {}: {}",
                path,
                code,
                stderr.trim()
            ))),
        }
    }

    async fn upload_archive(
        &self,
        sandbox_id: &str,
        path: &str,
        archive: Bytes,
    ) -> ExecboxResult<()> {
        let options = UploadToContainerOptions {
            path: path.to_string(),
            ..Default::default()
        };
        self.docker
            .upload_to_container(sandbox_id, Some(options), archive)
            .await?;
        Ok(())
    }

    async fn spawn_attached(
        &self,
        sandbox_id: &str,
        workdir: &str,
        command: &str,
    ) -> ExecboxResult<AttachedProcess> {
        let cmd = vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            RUN_SCRIPT.to_string(),
            "execbox-run".to_string(),
            pid_file(workdir),
            command.to_string(),
        ];

        let exec = self
            .docker
            .create_exec(
                sandbox_id,
                CreateExecOptions {
                    cmd: Some(cmd),
                    working_dir: Some(workdir.to_string()),
                    attach_stdin: Some(true),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    tty: Some(false),
                    ..Default::default()
                },
            )
            .await?;

        match self
            .docker
            .start_exec(&exec.id, Some(exec_start_options()))
            .await?
        {
            StartExecResults::Attached { output, input } => {
                let output = output
                    .filter_map(|chunk| async move {
                        match chunk {
                            Ok(LogOutput::StdOut { message })
                            | Ok(LogOutput::Console { message }) => {
                                Some(Ok(ProcessOutput::Stdout(message)))
                            }
                            Ok(LogOutput::StdErr { message }) => {
                                Some(Ok(ProcessOutput::Stderr(message)))
                            }
                            Ok(LogOutput::StdIn { .. }) => None,
                            Err(e) => Some(Err(ExecboxError::from(e))),
                        }
                    })
                    .boxed();

                Ok(AttachedProcess {
                    id: exec.id,
                    output,
                    stdin: input,
                })
            }
            StartExecResults::Detached => Err(ExecboxError::Engine(format!(
                "exec {} started detached",
                exec.id
            ))),
        }
    }

    async fn process_exit_code(&self, process_id: &str) -> ExecboxResult<Option<i64>> {
        let inspect = self.docker.inspect_exec(process_id).await?;
        if inspect.running == Some(true) {
            return Ok(None);
        }
        Ok(inspect.exit_code)
    }

    async fn terminate(
        &self,
        sandbox_id: &str,
        workdir: &str,
        process_id: &str,
    ) -> ExecboxResult<()> {
        if self.process_exit_code(process_id).await?.is_some() {
            return Ok(());
        }

        let cmd = vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            KILL_TREE_SCRIPT.to_string(),
            "execbox-kill".to_string(),
            pid_file(workdir),
        ];
        let (code, stderr) = self.run_to_completion(sandbox_id, cmd).await?;
        if code != 0 {
            tracing::warn!(
                "killing process {} in sandbox {} exited with {}: {}",
                process_id,
                sandbox_id,
                code,
                stderr.trim()
            );
        }
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

fn exec_start_options() -> StartExecOptions {
    StartExecOptions {
        detach: false,
        tty: false,
        output_capacity: None,
    }
}

/// The pid file of the process running in `workdir`, named after the session directory.
fn pid_file(workdir: &str) -> String {
    let name = workdir.trim_end_matches('/').rsplit('/').next().unwrap_or_default();
    format!("{}/{}.pid", PID_DIR, name)
}

/// Maps Docker's container status string onto the sandbox lifecycle.
fn state_from_status(status: &str) -> SandboxState {
    match status {
        "running" => SandboxState::Running,
        "paused" => SandboxState::Paused,
        "restarting" => SandboxState::Starting,
        _ => SandboxState::Stopped,
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::is_within;

    #[test]
    fn test_pid_file_lives_outside_the_execution_path() {
        assert_eq!(pid_file("/code/abc"), "/run/execbox/abc.pid");
        assert_eq!(pid_file("/code/abc/"), "/run/execbox/abc.pid");
        assert!(!is_within(&pid_file("/code/abc"), "/code/abc"));
        assert_ne!(pid_file("/code/a"), pid_file("/code/b"));
    }

    #[test]
    fn test_state_from_status() {
        assert_eq!(state_from_status("running"), SandboxState::Running);
        assert_eq!(state_from_status("paused"), SandboxState::Paused);
        assert_eq!(state_from_status("restarting"), SandboxState::Starting);
        assert_eq!(state_from_status("exited"), SandboxState::Stopped);
        assert_eq!(state_from_status("created"), SandboxState::Stopped);
    }
}
