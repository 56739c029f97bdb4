//! Compose step executor.
//!
//! Runs the step command inside a service defined by a compose file in
//! the workspace, via `docker compose run`. Each step gets its own
//! project name so concurrent builds never share compose state, and the
//! project is torn down afterwards.

use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

use chengis_core::build::{StepOutput, StepStatus};
use chengis_core::executor::{LogSource, StepContext, StepExecutor};
use chengis_core::pipeline::Step;
use chengis_core::{Error, Result};

use crate::shell::{Interruption, wait_with_ladder};
use crate::sink::collect_stream;

pub struct ComposeExecutor;

impl ComposeExecutor {
    fn project_name(ctx: &StepContext) -> String {
        // Compose project names must be lowercase alphanumeric.
        format!("chengis-{}", ctx.step_id.as_uuid().simple())
    }
}

#[async_trait]
impl StepExecutor for ComposeExecutor {
    fn kind(&self) -> &'static str {
        "container-compose"
    }

    async fn execute(&self, ctx: &StepContext, step: &Step) -> Result<StepOutput> {
        let Step::Compose {
            common,
            compose_file,
            service,
        } = step
        else {
            return Err(Error::InvalidInput(format!(
                "compose executor got a {} step",
                step.kind()
            )));
        };

        let project = Self::project_name(ctx);
        let mut command = Command::new("docker");
        command
            .args(["compose", "-f", compose_file, "-p", &project])
            .args(["run", "--rm", service, "sh", "-c", &common.command])
            .current_dir(&ctx.workspace_dir)
            .env_clear()
            .envs(ctx.merged_env(step))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        debug!(step = %common.name, project = %project, "spawning compose step");
        let mut child = command
            .spawn()
            .map_err(|e| Error::ExecutionFailed(format!("spawn compose: {e}")))?;

        let secrets: Arc<Vec<String>> = Arc::new(ctx.secrets.values().cloned().collect());
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Internal("compose stdout not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Internal("compose stderr not captured".into()))?;

        let stdout_task = tokio::spawn(collect_stream(
            stdout,
            LogSource::Stdout,
            ctx.line_sink.clone(),
            secrets.clone(),
        ));
        let stderr_task = tokio::spawn(collect_stream(
            stderr,
            LogSource::Stderr,
            ctx.line_sink.clone(),
            secrets,
        ));

        let timeout = common.timeout_ms.map(Duration::from_millis);
        let (exit, interruption) = wait_with_ladder(&mut child, timeout, &ctx.cancel).await;

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();

        self.teardown(ctx, compose_file, &project).await;

        let exit_code = exit.and_then(|status| status.code());
        let status = match interruption {
            Interruption::TimedOut => StepStatus::TimedOut,
            Interruption::Cancelled => StepStatus::Aborted,
            Interruption::None => match exit_code {
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
}

impl ComposeExecutor {
    async fn teardown(&self, ctx: &StepContext, compose_file: &str, project: &str) {
        let result = Command::new("docker")
            .args([
                "compose",
                "-f",
                compose_file,
                "-p",
                project,
                "down",
                "--remove-orphans",
            ])
            .current_dir(&ctx.workspace_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        if let Err(e) = result {
            warn!(project = %project, error = %e, "compose teardown failed");
        }
    }
}
