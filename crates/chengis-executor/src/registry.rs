//! Executor registry.
//!
//! Dispatches from a step's kind to an implementation. Registries are
//! built at startup and passed through the system object; a kind with
//! no registered executor fails the step, never the runner.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

use chengis_core::build::StepOutput;
use chengis_core::executor::{StepContext, StepExecutor};
use chengis_core::pipeline::Step;
use chengis_core::policy::ImagePolicyCheck;
use chengis_core::{Error, Result};

use crate::compose::ComposeExecutor;
use crate::docker::DockerExecutor;
use crate::shell::ShellExecutor;

#[derive(Default)]
pub struct ExecutorRegistry {
    executors: HashMap<&'static str, Arc<dyn StepExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in executors. The Docker executor is
    /// skipped when no daemon is reachable; shell and compose steps
    /// still run.
    pub fn standard(image_policy: Arc<dyn ImagePolicyCheck>) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ShellExecutor));
        registry.register(Arc::new(ComposeExecutor));
        match DockerExecutor::new(image_policy) {
            Ok(docker) => registry.register(Arc::new(docker)),
            Err(e) => warn!(error = %e, "docker unavailable, container steps will fail"),
        }
        registry
    }

    pub fn register(&mut self, executor: Arc<dyn StepExecutor>) {
        self.executors.insert(executor.kind(), executor);
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn StepExecutor>> {
        self.executors.get(kind).cloned()
    }

    /// Execute a step with the executor registered for its kind.
    pub async fn execute(&self, ctx: &StepContext, step: &Step) -> Result<StepOutput> {
        let executor = self
            .get(step.kind())
            .ok_or_else(|| Error::UnknownStepKind(step.kind().to_string()))?;
        executor.execute(ctx, step).await
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        let mut kinds: Vec<&'static str> = self.executors.keys().copied().collect();
        kinds.sort_unstable();
        kinds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chengis_core::ResourceId;
    use chengis_core::build::StepStatus;
    use chengis_core::executor::NullSink;
    use chengis_core::pipeline::StepCommon;
    use std::collections::HashMap as StdHashMap;
    use tokio_util::sync::CancellationToken;

    struct FixedExecutor;

    #[async_trait]
    impl StepExecutor for FixedExecutor {
        fn kind(&self) -> &'static str {
            "shell"
        }

        async fn execute(&self, _ctx: &StepContext, _step: &Step) -> Result<StepOutput> {
            Ok(StepOutput {
                status: StepStatus::Success,
                exit_code: Some(0),
                stdout: String::new(),
                stderr: String::new(),
            })
        }
    }

    fn shell_step() -> Step {
        Step::Shell(StepCommon {
            name: "s".into(),
            command: "true".into(),
            env: StdHashMap::new(),
            dir: None,
            timeout_ms: None,
            condition: None,
            continue_on_error: false,
            secrets: vec![],
        })
    }

    fn context() -> StepContext {
        StepContext {
            build_id: ResourceId::new(),
            step_id: ResourceId::new(),
            org_id: ResourceId::new(),
            workspace_dir: std::env::temp_dir(),
            env: StdHashMap::new(),
            secrets: StdHashMap::new(),
            cancel: CancellationToken::new(),
            line_sink: std::sync::Arc::new(NullSink),
        }
    }

    #[tokio::test]
    async fn dispatches_by_kind() {
        let mut registry = ExecutorRegistry::new();
        registry.register(Arc::new(FixedExecutor));
        let out = registry.execute(&context(), &shell_step()).await.unwrap();
        assert_eq!(out.status, StepStatus::Success);
    }

    #[tokio::test]
    async fn unknown_kind_is_an_error() {
        let registry = ExecutorRegistry::new();
        let err = registry.execute(&context(), &shell_step()).await.unwrap_err();
        assert!(matches!(err, Error::UnknownStepKind(_)));
    }

    #[test]
    fn kinds_are_sorted() {
        let mut registry = ExecutorRegistry::new();
        registry.register(Arc::new(ShellExecutor));
        registry.register(Arc::new(ComposeExecutor));
        assert_eq!(registry.kinds(), vec!["container-compose", "shell"]);
    }
}
