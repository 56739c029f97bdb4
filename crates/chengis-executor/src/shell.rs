//! Shell step executor.
//!
//! Runs the step command through `sh -c` in the build workspace. The
//! timeout and cancellation ladder sends a graceful termination signal
//! first and a forced kill after the grace window.

use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use chengis_core::build::{StepOutput, StepStatus};
use chengis_core::executor::{KILL_GRACE_SECONDS, LogSource, StepContext, StepExecutor};
use chengis_core::pipeline::Step;
use chengis_core::{Error, Result};

use crate::sink::collect_stream;

/// Why a wait ended early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Interruption {
    None,
    TimedOut,
    Cancelled,
}

pub struct ShellExecutor;

#[async_trait]
impl StepExecutor for ShellExecutor {
    fn kind(&self) -> &'static str {
        "shell"
    }

    async fn execute(&self, ctx: &StepContext, step: &Step) -> Result<StepOutput> {
        let common = step.common();
        let dir = match &common.dir {
            Some(dir) => ctx.workspace_dir.join(dir),
            None => ctx.workspace_dir.clone(),
        };

        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&common.command)
            .current_dir(&dir)
            .env_clear()
            .envs(ctx.merged_env(step))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so the termination ladder reaches
        // grandchildren that would otherwise hold the output pipes open.
        #[cfg(unix)]
        command.process_group(0);

        debug!(step = %common.name, dir = %dir.display(), "spawning shell step");
        let mut child = command
            .spawn()
            .map_err(|e| Error::ExecutionFailed(format!("spawn {}: {e}", common.name)))?;

        let secrets: Arc<Vec<String>> = Arc::new(ctx.secrets.values().cloned().collect());
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Internal("child stdout not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Internal("child stderr not captured".into()))?;

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

/// Wait for the child, applying the termination ladder when the timeout
/// fires or the build is cancelled: graceful signal, a grace window,
/// then a forced kill.
pub(crate) async fn wait_with_ladder(
    child: &mut Child,
    timeout: Option<Duration>,
    cancel: &CancellationToken,
) -> (Option<std::process::ExitStatus>, Interruption) {
    let deadline = async {
        match timeout {
            Some(duration) => sleep(duration).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    let interruption = tokio::select! {
        status = child.wait() => return (status.ok(), Interruption::None),
        _ = &mut deadline => Interruption::TimedOut,
        _ = cancel.cancelled() => Interruption::Cancelled,
    };

    signal_group(child, Signal::Term);
    let exit = match tokio::time::timeout(
        Duration::from_secs(KILL_GRACE_SECONDS),
        child.wait(),
    )
    .await
    {
        Ok(status) => status.ok(),
        Err(_) => {
            warn!("grace window elapsed, killing process group");
            signal_group(child, Signal::Kill);
            let _ = child.kill().await;
            child.wait().await.ok()
        }
    };
    (exit, interruption)
}

enum Signal {
    Term,
    Kill,
}

#[cfg(unix)]
fn signal_group(child: &Child, signal: Signal) {
    let Some(pid) = child.id() else { return };
    let signal = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // SAFETY: signalling the process group we created at spawn.
    unsafe {
        libc::kill(-(pid as libc::pid_t), signal);
    }
}

#[cfg(not(unix))]
fn signal_group(child: &Child, signal: Signal) {
    // No graceful group signal available; the forced kill after the
    // grace window is the only ladder rung.
    let (_, _) = (child, signal);
}

#[cfg(test)]
mod tests {
    use super::*;
    use chengis_core::ResourceId;
    use chengis_core::executor::NullSink;
    use chengis_core::pipeline::StepCommon;
    use std::collections::HashMap;

    fn shell_step(command: &str, timeout_ms: Option<u64>) -> Step {
        Step::Shell(StepCommon {
            name: "t".into(),
            command: command.into(),
            env: HashMap::new(),
            dir: None,
            timeout_ms,
            condition: None,
            continue_on_error: false,
            secrets: vec![],
        })
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
    async fn exit_zero_is_success() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let out = ShellExecutor
            .execute(&ctx, &shell_step("exit 0", None))
            .await
            .unwrap();
        assert_eq!(out.status, StepStatus::Success);
        assert_eq!(out.exit_code, Some(0));
    }

    #[tokio::test]
    async fn nonzero_exit_is_failure_with_code() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let out = ShellExecutor
            .execute(&ctx, &shell_step("exit 7", None))
            .await
            .unwrap();
        assert_eq!(out.status, StepStatus::Failure);
        assert_eq!(out.exit_code, Some(7));
    }

    #[tokio::test]
    async fn captures_stdout_and_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let out = ShellExecutor
            .execute(&ctx, &shell_step("echo out; echo err >&2", None))
            .await
            .unwrap();
        assert_eq!(out.stdout, "out\n");
        assert_eq!(out.stderr, "err\n");
    }

    #[tokio::test]
    async fn step_env_overrides_context_env() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path());
        ctx.env.insert("WHO".into(), "job".into());
        let mut step = shell_step("echo $WHO", None);
        step.common_mut().env.insert("WHO".into(), "step".into());
        let out = ShellExecutor.execute(&ctx, &step).await.unwrap();
        assert_eq!(out.stdout, "step\n");
    }

    #[tokio::test]
    async fn secret_values_masked_in_output() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path());
        ctx.secrets.insert("API_KEY".into(), "tops3cret".into());
        let out = ShellExecutor
            .execute(&ctx, &shell_step("echo key is $API_KEY", None))
            .await
            .unwrap();
        assert_eq!(out.stdout, "key is ***\n");
    }

    #[tokio::test]
    async fn timeout_reports_timed_out() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let started = std::time::Instant::now();
        let out = ShellExecutor
            .execute(&ctx, &shell_step("sleep 30", Some(200)))
            .await
            .unwrap();
        assert_eq!(out.status, StepStatus::TimedOut);
        // Far less than the sleep; the ladder cut it short.
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn cancellation_reports_aborted() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let cancel = ctx.cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        });
        let out = ShellExecutor
            .execute(&ctx, &shell_step("sleep 30", None))
            .await
            .unwrap();
        assert_eq!(out.status, StepStatus::Aborted);
    }

    #[tokio::test]
    async fn output_captured_up_to_termination() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let out = ShellExecutor
            .execute(&ctx, &shell_step("echo before; sleep 30; echo after", Some(300)))
            .await
            .unwrap();
        assert_eq!(out.status, StepStatus::TimedOut);
        assert!(out.stdout.contains("before"));
        assert!(!out.stdout.contains("after"));
    }
}
