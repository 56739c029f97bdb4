//! Step executor trait and execution context.
//!
//! Executors run steps in isolated environments (subprocesses,
//! containers). Implementations live in `chengis-executor`; the registry
//! dispatches on a step's kind.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::build::StepOutput;
use crate::pipeline::Step;
use crate::{ResourceId, Result};

/// Grace window between the graceful termination signal and the forced
/// kill, for both timeouts and cancellation.
pub const KILL_GRACE_SECONDS: u64 = 5;

/// Which stream a log line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSource {
    Stdout,
    Stderr,
}

impl LogSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogSource::Stdout => "stdout",
            LogSource::Stderr => "stderr",
        }
    }
}

/// Receives output lines as a step produces them.
pub trait LineSink: Send + Sync {
    fn line(&self, source: LogSource, line: &str);
}

/// Sink that discards all output; useful in tests.
pub struct NullSink;

impl LineSink for NullSink {
    fn line(&self, _source: LogSource, _line: &str) {}
}

/// Everything an executor needs to run one step.
pub struct StepContext {
    pub build_id: ResourceId,
    pub step_id: ResourceId,
    pub org_id: ResourceId,
    pub workspace_dir: PathBuf,
    /// Job + stage-container env, merged by the runner. Step env is
    /// layered on top by the executor.
    pub env: HashMap<String, String>,
    /// Resolved secret values, injected as env and masked from output.
    pub secrets: HashMap<String, String>,
    pub cancel: CancellationToken,
    pub line_sink: Arc<dyn LineSink>,
}

impl StepContext {
    /// Final env for a step: process < job/stage (ctx) < step.
    pub fn merged_env(&self, step: &Step) -> HashMap<String, String> {
        let mut env: HashMap<String, String> = std::env::vars().collect();
        env.extend(self.env.clone());
        env.extend(step.common().env.clone());
        env.extend(self.secrets.clone());
        env
    }
}

/// Runs steps of one kind.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Registry key, e.g. "shell" or "container".
    fn kind(&self) -> &'static str;

    /// Execute the step to completion, streaming output to the context's
    /// line sink. Timeout and cancellation are handled inside: the result
    /// carries `timed-out` or `aborted` rather than an error.
    async fn execute(&self, ctx: &StepContext, step: &Step) -> Result<StepOutput>;
}
