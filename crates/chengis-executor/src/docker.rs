//! Containerised step executor backed by the local Docker daemon.
//!
//! The workspace is mounted into the container (default `/workspace`).
//! The image policy is consulted before any pull, the effective pull
//! policy decides whether to pull, and `docker stop` provides the
//! graceful half of the termination ladder.

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use chengis_core::build::{StepOutput, StepStatus};
use chengis_core::executor::{KILL_GRACE_SECONDS, LogSource, StepContext, StepExecutor};
use chengis_core::pipeline::{PullPolicy, Step};
use chengis_core::policy::ImagePolicyCheck;
use chengis_core::{Error, Result};

use crate::sink::mask_secrets;

pub const DEFAULT_WORKDIR: &str = "/workspace";

pub struct DockerExecutor {
    docker: Docker,
    image_policy: Arc<dyn ImagePolicyCheck>,
}

impl DockerExecutor {
    /// Connect to the local Docker daemon.
    pub fn new(image_policy: Arc<dyn ImagePolicyCheck>) -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().map_err(|e| Error::Internal(e.to_string()))?;
        Ok(Self {
            docker,
            image_policy,
        })
    }

    pub fn with_client(docker: Docker, image_policy: Arc<dyn ImagePolicyCheck>) -> Self {
        Self {
            docker,
            image_policy,
        }
    }

    fn container_name(step_id: &chengis_core::ResourceId) -> String {
        format!("chengis-step-{step_id}")
    }

    async fn ensure_image(&self, image: &str, pull_policy: PullPolicy) -> Result<()> {
        let should_pull = match pull_policy {
            PullPolicy::Always => true,
            PullPolicy::Never => false,
            PullPolicy::IfNotPresent => self.docker.inspect_image(image).await.is_err(),
        };
        if !should_pull {
            return Ok(());
        }

        info!(image = %image, "pulling image");
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut pull_stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = pull_stream.next().await {
            match result {
                Ok(progress) => {
                    if let Some(status) = progress.status {
                        debug!(status = %status, "pull progress");
                    }
                }
                Err(e) => {
                    return Err(Error::ExecutionFailed(format!("pull {image}: {e}")));
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl StepExecutor for DockerExecutor {
    fn kind(&self) -> &'static str {
        "container"
    }

    async fn execute(&self, ctx: &StepContext, step: &Step) -> Result<StepOutput> {
        let Step::Container { common, container } = step else {
            return Err(Error::InvalidInput(format!(
                "container executor got a {} step",
                step.kind()
            )));
        };

        self.image_policy
            .allow_image(ctx.org_id, &container.image)
            .await?;
        self.ensure_image(&container.image, container.pull_policy)
            .await?;

        let name = Self::container_name(&ctx.step_id);
        let workdir = container.workdir.as_deref().unwrap_or(DEFAULT_WORKDIR);
        let working_dir = match &common.dir {
            Some(dir) => format!("{}/{}", workdir.trim_end_matches('/'), dir),
            None => workdir.to_string(),
        };

        // Precedence: process < job/stage < container < step < secrets.
        let mut env_map: std::collections::HashMap<String, String> = std::env::vars().collect();
        env_map.extend(ctx.env.clone());
        env_map.extend(container.env.clone());
        env_map.extend(step.common().env.clone());
        env_map.extend(ctx.secrets.clone());
        let env: Vec<String> = env_map
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();

        let mut binds = vec![format!(
            "{}:{}",
            ctx.workspace_dir.display(),
            workdir
        )];
        binds.extend(container.volumes.iter().cloned());

        let host_config = HostConfig {
            binds: Some(binds),
            network_mode: container.network.clone(),
            ..Default::default()
        };

        let config = Config {
            image: Some(container.image.clone()),
            cmd: Some(vec![
                "sh".to_string(),
                "-c".to_string(),
                common.command.clone(),
            ]),
            env: Some(env),
            working_dir: Some(working_dir),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            host_config: Some(host_config),
            ..Default::default()
        };

        debug!(container = %name, image = %container.image, "creating step container");
        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|e| Error::ExecutionFailed(format!("create container: {e}")))?;

        let result = self.run_to_completion(ctx, &name, common.timeout_ms).await;

        // Remove the container regardless of how the step ended.
        let remove = self
            .docker
            .remove_container(
                &name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await;
        if let Err(e) = remove {
            warn!(container = %name, error = %e, "failed to remove step container");
        }

        result
    }
}

impl DockerExecutor {
    async fn run_to_completion(
        &self,
        ctx: &StepContext,
        name: &str,
        timeout_ms: Option<u64>,
    ) -> Result<StepOutput> {
        self.docker
            .start_container(name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| Error::ExecutionFailed(format!("start container: {e}")))?;

        let secrets: Vec<String> = ctx.secrets.values().cloned().collect();
        let mut stdout = String::new();
        let mut stderr = String::new();

        let mut logs = self.docker.logs(
            name,
            Some(LogsOptions::<String> {
                follow: true,
                stdout: true,
                stderr: true,
                ..Default::default()
            }),
        );

        let deadline = async {
            match timeout_ms {
                Some(ms) => sleep(Duration::from_millis(ms)).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(deadline);

        let mut interruption: Option<StepStatus> = None;

        // The log stream ends when the container exits; stop requests
        // give Docker the graceful-then-kill ladder with our grace
        // window.
        loop {
            tokio::select! {
                log = logs.next() => match log {
                    Some(Ok(output)) => {
                        let (source, message) = match output {
                            LogOutput::StdErr { message } => (LogSource::Stderr, message),
                            LogOutput::StdOut { message }
                            | LogOutput::Console { message }
                            | LogOutput::StdIn { message } => (LogSource::Stdout, message),
                        };
                        let text = String::from_utf8_lossy(&message);
                        for line in text.lines() {
                            let masked = mask_secrets(line, &secrets);
                            ctx.line_sink.line(source, &masked);
                            match source {
                                LogSource::Stdout => {
                                    stdout.push_str(&masked);
                                    stdout.push('\n');
                                }
                                LogSource::Stderr => {
                                    stderr.push_str(&masked);
                                    stderr.push('\n');
                                }
                            }
                        }
                    }
                    Some(Err(e)) => {
                        warn!(container = %name, error = %e, "log stream error");
                    }
                    None => break,
                },
                _ = &mut deadline, if interruption.is_none() => {
                    interruption = Some(StepStatus::TimedOut);
                    self.stop_with_grace(name).await;
                }
                _ = ctx.cancel.cancelled(), if interruption.is_none() => {
                    interruption = Some(StepStatus::Aborted);
                    self.stop_with_grace(name).await;
                }
            }
        }

        let exit_code = self.exit_code(name).await;
        let status = match interruption {
            Some(status) => status,
            None => match exit_code {
                Some(0) => StepStatus::Success,
                _ => StepStatus::Failure,
            },
        };

        Ok(StepOutput {
            status,
            exit_code,
            stdout,
            stderr,
        })
    }

    async fn stop_with_grace(&self, name: &str) {
        // `docker stop` sends the graceful signal, waits `t`, then kills.
        let result = self
            .docker
            .stop_container(
                name,
                Some(StopContainerOptions {
                    t: KILL_GRACE_SECONDS as i64,
                }),
            )
            .await;
        if let Err(e) = result {
            warn!(container = %name, error = %e, "failed to stop container");
        }
    }

    async fn exit_code(&self, name: &str) -> Option<i32> {
        let inspect = self.docker.inspect_container(name, None).await.ok()?;
        inspect.state?.exit_code.map(|code| code as i32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_name_is_deterministic_per_step() {
        let id = chengis_core::ResourceId::new();
        assert_eq!(
            DockerExecutor::container_name(&id),
            DockerExecutor::container_name(&id)
        );
        assert!(DockerExecutor::container_name(&id).starts_with("chengis-step-"));
    }
}

/// Integration tests that require a Docker daemon.
/// Run with: cargo test -- --ignored
#[cfg(test)]
mod integration_tests {
    use super::*;
    use chengis_core::ResourceId;
    use chengis_core::executor::NullSink;
    use chengis_core::pipeline::{ContainerSpec, StepCommon};
    use chengis_core::policy::AllowAllImages;
    use std::collections::HashMap;
    use tokio_util::sync::CancellationToken;

    fn container_step(command: &str, timeout_ms: Option<u64>) -> Step {
        Step::Container {
            common: StepCommon {
                name: "t".into(),
                command: command.into(),
                env: HashMap::new(),
                dir: None,
                timeout_ms,
                condition: None,
                continue_on_error: false,
                secrets: vec![],
            },
            container: ContainerSpec {
                image: "alpine:latest".into(),
                pull_policy: PullPolicy::IfNotPresent,
                workdir: None,
                network: None,
                volumes: vec![],
                env: HashMap::new(),
            },
        }
    }

    fn context(dir: &std::path::Path) -> StepContext {
        StepContext {
            build_id: ResourceId::new(),
            step_id: ResourceId::new(),
            org_id: ResourceId::new(),
            workspace_dir: dir.to_path_buf(),
            env: HashMap::new(),
            secrets: HashMap::new(),
            cancel: CancellationToken::new(),
            line_sink: Arc::new(NullSink),
        }
    }

    #[tokio::test]
    #[ignore]
    async fn runs_a_container_step() {
        let executor = DockerExecutor::new(Arc::new(AllowAllImages)).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let out = executor
            .execute(&ctx, &container_step("echo hello", None))
            .await
            .unwrap();
        assert_eq!(out.status, StepStatus::Success);
        assert!(out.stdout.contains("hello"));
    }

    #[tokio::test]
    #[ignore]
    async fn container_timeout_reports_timed_out() {
        let executor = DockerExecutor::new(Arc::new(AllowAllImages)).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let out = executor
            .execute(&ctx, &container_step("sleep 60", Some(2000)))
            .await
            .unwrap();
        assert_eq!(out.status, StepStatus::TimedOut);
    }
}
