//! The build runner.
//!
//! Turns a stored pipeline definition into a completed, durably-recorded
//! build: pipeline resolution, the pre-build policy gate, the stage loop
//! with conditions and approval gates, sequential and parallel step
//! execution, post-actions, artifacts, notifications and finalization.
//! Policy denials, approval rejections and cancellation flow back as
//! result values; finalization happens in exactly one place.

use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use chengis_core::approval::{ApprovalGate, GateStatus};
use chengis_core::build::{
    Build, BuildResult, BuildStatus, StageOutcome, StageStatus, StepResult, StepStatus,
    TriggerDescriptor, TriggerKind, stage_status_from_steps,
};
use chengis_core::bus::EventBus;
use chengis_core::event::{BuildEvent, EventType};
use chengis_core::executor::{LineSink, LogSource, StepContext};
use chengis_core::notify::Notification;
use chengis_core::pipeline::{Pipeline, Stage, Step};
use chengis_core::template::resolve_extends;
use chengis_core::{Error, ResourceId, Result};
use chengis_db::{
    ApprovalRepo, ArtifactRepo, AuditRepo, BuildRepo, EventRepo, JobRecord, JobRepo, NewBuild,
    TemplateRepo,
};
use chengis_executor::ExecutorRegistry;
use chengis_secrets::SecretResolver;

use crate::artifact::ArtifactStore;
use crate::notify::NotifierRegistry;
use crate::policy::{PolicyGate, PolicyInput};
use crate::workspace::WorkspaceManager;

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub max_parallel_steps: usize,
    pub stage_timeout_slack_ms: u64,
    pub build_timeout_ms: u64,
    pub approval_poll_ms: u64,
    /// Base URL for build links in notifications.
    pub external_url: String,
    /// Keep workspaces after the build instead of deleting them.
    pub retain_workspaces: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_parallel_steps: 16,
            stage_timeout_slack_ms: 10_000,
            build_timeout_ms: 4 * 60 * 60 * 1000,
            approval_poll_ms: 1000,
            external_url: "http://localhost:3000".into(),
            retain_workspaces: false,
        }
    }
}

#[derive(Clone)]
pub struct BuildRunner {
    pub jobs: Arc<JobRepo>,
    pub builds: Arc<BuildRepo>,
    pub events: Arc<EventRepo>,
    pub templates: Arc<TemplateRepo>,
    pub approvals: Arc<ApprovalRepo>,
    pub audit: Arc<AuditRepo>,
    pub artifact_repo: Arc<ArtifactRepo>,
    pub bus: Arc<EventBus>,
    pub executors: Arc<ExecutorRegistry>,
    pub secrets: Arc<SecretResolver>,
    pub workspace: Arc<WorkspaceManager>,
    pub artifacts: Arc<ArtifactStore>,
    pub policy: Arc<PolicyGate>,
    pub notifiers: Arc<NotifierRegistry>,
    pub config: RunnerConfig,
}

/// Internal result of the stage phase.
struct StagePhase {
    status: BuildStatus,
    stages: Vec<StageOutcome>,
    failed_step: Option<String>,
    exit_code: Option<i32>,
    error_message: Option<String>,
    /// The effective pipeline, once resolution succeeded.
    pipeline: Option<Pipeline>,
}

impl StagePhase {
    fn success(stages: Vec<StageOutcome>, pipeline: Option<Pipeline>) -> Self {
        Self {
            status: BuildStatus::Success,
            stages,
            failed_step: None,
            exit_code: None,
            error_message: None,
            pipeline,
        }
    }
}

impl BuildRunner {
    /// Create a build row for a trigger and announce it. The dispatcher
    /// picks queued builds up from storage.
    pub async fn trigger(&self, job: &JobRecord, trigger: TriggerDescriptor) -> Result<Build> {
        let pipeline = job.pipeline().map_err(chengis_core::Error::from)?;
        let mut parameters = pipeline.parameters.clone();
        parameters.extend(trigger.parameters.clone());
        let branch = trigger
            .branch
            .clone()
            .or_else(|| pipeline.source.as_ref().and_then(|s| s.branch.clone()));

        let build = self
            .builds
            .create(&NewBuild {
                job_id: job.id.into(),
                org_id: job.org_id.into(),
                trigger: trigger.kind,
                parameters,
                branch,
                required_labels: pipeline.labels.clone(),
                priority: job.priority,
                parent_build_id: trigger.parent_build_id,
            })
            .await
            .map_err(chengis_core::Error::from)?;

        info!(
            job = %job.name,
            build = build.build_number,
            trigger = %trigger.kind,
            "build queued"
        );
        // Announced on the bus only: the durable log starts at
        // build-started so the terminal events delimit everything else.
        self.bus.publish(
            BuildEvent::new(build.id, EventType::BuildQueued).with_data(json!({
                "trigger": trigger.kind.as_str(),
                "build_number": build.build_number,
                "attempt": build.attempt_number,
            })),
        );
        Ok(build)
    }

    /// Queue a retry of an existing build: same parameters, incremented
    /// attempt, root pointing at the first attempt.
    pub async fn retry(&self, build_id: ResourceId, actor: Option<String>) -> Result<Build> {
        let original = self.builds.get(build_id).await.map_err(chengis_core::Error::from)?;
        let job = self
            .jobs
            .get(original.job_id)
            .await
            .map_err(chengis_core::Error::from)?;
        self.trigger(
            &job,
            TriggerDescriptor {
                kind: TriggerKind::Retry,
                parameters: original.parameters.clone(),
                branch: original.branch.clone(),
                parent_build_id: Some(original.id),
                actor,
            },
        )
        .await
    }

    /// Drive one already-claimed build (status `running`) to completion.
    pub async fn execute(&self, build_id: ResourceId) -> Result<BuildResult> {
        let build = self.builds.get(build_id).await.map_err(chengis_core::Error::from)?;
        let job = self
            .jobs
            .get(build.job_id)
            .await
            .map_err(chengis_core::Error::from)?;

        self.emit(
            BuildEvent::new(build.id, EventType::BuildStarted)
                .with_data(json!({ "build_number": build.build_number })),
        )
        .await?;

        let workspace = self.workspace.create(&job.name, build.id).await?;
        let phase = match self.run_pipeline(&job, &build, &workspace).await {
            Ok(phase) => phase,
            Err(e) => {
                // Unhandled errors become a build failure, never a crash.
                error!(build = %build.id, error = %e, "build errored");
                StagePhase {
                    status: BuildStatus::Failure,
                    stages: Vec::new(),
                    failed_step: None,
                    exit_code: None,
                    error_message: Some(e.to_string()),
                    pipeline: None,
                }
            }
        };

        // Artifacts and notifications are best-effort; failures here are
        // logged and never reclassify the build.
        let pipeline = phase.pipeline.clone().or_else(|| job.pipeline().ok());
        if let Some(pipeline) = &pipeline {
            if !pipeline.artifacts.is_empty() {
                if let Err(e) = self
                    .artifacts
                    .save(build.id, &workspace, &pipeline.artifacts)
                    .await
                {
                    warn!(build = %build.id, error = %e, "artifact collection failed");
                }
            }
        }

        let finalized = self
            .builds
            .finalize(
                build.id,
                phase.status,
                phase.failed_step.as_deref(),
                phase.error_message.as_deref(),
            )
            .await
            .map_err(chengis_core::Error::from)?;
        if !finalized {
            warn!(build = %build.id, "build was already terminal at finalization");
        }
        self.emit(
            BuildEvent::new(build.id, EventType::BuildCompleted)
                .with_data(json!({ "status": phase.status.as_str() })),
        )
        .await?;

        if let Some(pipeline) = &pipeline {
            let notification = Notification {
                build_id: build.id,
                job_name: job.name.clone(),
                build_number: build.build_number,
                status: phase.status,
                link: format!(
                    "{}/jobs/{}/builds/{}",
                    self.config.external_url, job.id, build.build_number
                ),
            };
            self.notifiers.dispatch(&pipeline.notify, &notification).await;
        }

        self.workspace
            .cleanup(&workspace, self.config.retain_workspaces)
            .await;

        if phase.status == BuildStatus::Success {
            self.trigger_dependents(&job).await;
        }

        info!(build = %build.id, status = %phase.status, "build finished");
        Ok(BuildResult {
            build_id: build.id,
            status: phase.status,
            stages: phase.stages,
            failed_step: phase.failed_step,
            exit_code: phase.exit_code,
            error_message: phase.error_message,
        })
    }

    async fn run_pipeline(
        &self,
        job: &JobRecord,
        build: &Build,
        workspace: &Path,
    ) -> Result<StagePhase> {
        let pipeline = self.resolve_pipeline(job, build, workspace).await?;

        // Pre-build policy gate: first deny stops the build.
        let input = PolicyInput {
            branch: build.branch.as_deref(),
            images: pipeline.referenced_images(),
            plugins: vec![],
        };
        if let Some(denial) = self.policy.evaluate(build.org_id, &input).await? {
            self.audit
                .append(
                    build.org_id,
                    None,
                    "policy-denied",
                    "build",
                    &build.id.to_string(),
                    json!({ "policy_id": denial.policy_id.to_string(), "reason": denial.reason }),
                )
                .await
                .map_err(chengis_core::Error::from)?;
            return Ok(StagePhase {
                status: BuildStatus::Failure,
                stages: Vec::new(),
                failed_step: None,
                exit_code: None,
                error_message: Some(denial.reason),
                pipeline: Some(pipeline),
            });
        }

        let cancel = CancellationToken::new();
        let runner = self.clone();
        let build_owned = build.clone();
        let pipeline_owned = pipeline.clone();
        let workspace_owned = workspace.to_path_buf();
        let stage_cancel = cancel.clone();
        let mut stage_task = tokio::spawn(async move {
            runner
                .run_stages(&build_owned, &pipeline_owned, &workspace_owned, stage_cancel)
                .await
        });

        let ceiling = Duration::from_millis(self.config.build_timeout_ms);
        let mut phase = match tokio::time::timeout(ceiling, &mut stage_task).await {
            Ok(joined) => joined.map_err(|e| Error::Internal(format!("stage task: {e}")))?,
            Err(_) => {
                // Build-level ceiling: cancel in-flight work and wait for
                // the stage task to observe it.
                warn!(build = %build.id, "build exceeded its time ceiling");
                cancel.cancel();
                let mut phase = stage_task
                    .await
                    .map_err(|e| Error::Internal(format!("stage task: {e}")))?;
                phase.status = BuildStatus::TimedOut;
                phase.error_message = Some("build exceeded its time ceiling".into());
                phase
            }
        };

        self.run_post_actions(build, &pipeline, workspace, phase.status)
            .await;

        // Post-actions never reclassify the build.
        if phase.status == BuildStatus::Success {
            phase = StagePhase::success(phase.stages, None);
        }
        phase.pipeline = Some(pipeline);
        Ok(phase)
    }

    /// Effective pipeline for a build: the stored definition with
    /// `extends` resolved, replaced by an in-repo workflow file when the
    /// checked-out source carries one.
    async fn resolve_pipeline(
        &self,
        job: &JobRecord,
        build: &Build,
        workspace: &Path,
    ) -> Result<Pipeline> {
        let templates = self
            .templates
            .load_all(build.org_id)
            .await
            .map_err(chengis_core::Error::from)?;
        let stored = job.pipeline().map_err(chengis_core::Error::from)?;
        let mut pipeline = resolve_extends(stored, &templates)?;

        if let Some(source) = pipeline.source.clone() {
            self.workspace.checkout(workspace, &source).await?;
            if let Some(found) = self.workspace.discover_pipeline(workspace).await? {
                let mut found = resolve_extends(found, &templates)?;
                // The checkout that produced the file stays the source
                // of record for this build.
                found.source = Some(source);
                pipeline = found;
            }
        }

        pipeline.validate()?;
        Ok(pipeline)
    }

    async fn run_stages(
        &self,
        build: &Build,
        pipeline: &Pipeline,
        workspace: &Path,
        cancel: CancellationToken,
    ) -> StagePhase {
        let mut stages_out: Vec<StageOutcome> = Vec::new();

        for (position, stage) in pipeline.stages.iter().enumerate() {
            // Cancellation intent is observed at stage boundaries.
            if self.builds.cancel_requested(build.id).await.unwrap_or(false) {
                cancel.cancel();
            }
            if cancel.is_cancelled() {
                return StagePhase {
                    status: BuildStatus::Aborted,
                    stages: stages_out,
                    failed_step: None,
                    exit_code: None,
                    error_message: Some(format!("cancelled before stage {}", stage.name)),
                    pipeline: None,
                };
            }

            if let Some(condition) = &stage.condition {
                if !condition.evaluate(build.branch.as_deref(), &build.parameters) {
                    let outcome = StageOutcome {
                        name: stage.name.clone(),
                        status: StageStatus::Skipped,
                        steps: Vec::new(),
                        started_at: None,
                        completed_at: None,
                    };
                    let _ = self
                        .emit(
                            BuildEvent::new(build.id, EventType::StageSkipped)
                                .with_stage(&stage.name),
                        )
                        .await;
                    let _ = self
                        .builds
                        .record_stage(build.id, &outcome, position as i32)
                        .await;
                    stages_out.push(outcome);
                    continue;
                }
            }

            if let Some(spec) = &stage.approval {
                match self.wait_for_approval(build, stage, spec).await {
                    Ok(GateStatus::Approved) => {}
                    Ok(terminal) => {
                        let _ = self
                            .audit
                            .append(
                                build.org_id,
                                None,
                                "approval-rejected",
                                "build",
                                &build.id.to_string(),
                                json!({ "stage": stage.name, "gate_status": terminal.as_str() }),
                            )
                            .await;
                        return StagePhase {
                            status: BuildStatus::Failure,
                            stages: stages_out,
                            failed_step: None,
                            exit_code: None,
                            error_message: Some(format!(
                                "approval for stage {} {}",
                                stage.name, terminal
                            )),
                            pipeline: None,
                        };
                    }
                    Err(e) => {
                        return StagePhase {
                            status: BuildStatus::Failure,
                            stages: stages_out,
                            failed_step: None,
                            exit_code: None,
                            error_message: Some(e.to_string()),
                            pipeline: None,
                        };
                    }
                }
            }

            let _ = self
                .emit(BuildEvent::new(build.id, EventType::StageStarted).with_stage(&stage.name))
                .await;
            let started_at = Utc::now();

            let (steps, effective) = self
                .run_stage_steps(build, pipeline, stage, workspace, &cancel)
                .await;

            let status = stage_status_from_steps(&effective);
            let outcome = StageOutcome {
                name: stage.name.clone(),
                status: status.clone(),
                steps,
                started_at: Some(started_at),
                completed_at: Some(Utc::now()),
            };
            let _ = self
                .emit(
                    BuildEvent::new(build.id, EventType::StageCompleted)
                        .with_stage(&stage.name)
                        .with_data(json!({ "status": outcome.status.as_str() })),
                )
                .await;
            let _ = self
                .builds
                .record_stage(build.id, &outcome, position as i32)
                .await;

            // The causing failure, not a sibling aborted by it.
            let failed = outcome
                .steps
                .iter()
                .find(|s| s.status == StepStatus::Failure)
                .or_else(|| outcome.steps.iter().find(|s| s.status != StepStatus::Success));
            let failed_step = failed.map(|s| s.name.clone());
            let exit_code = failed.and_then(|s| s.exit_code);
            stages_out.push(outcome);

            match status {
                StageStatus::Success | StageStatus::Skipped => {}
                StageStatus::Failure => {
                    return StagePhase {
                        status: BuildStatus::Failure,
                        stages: stages_out,
                        failed_step,
                        exit_code,
                        error_message: Some(format!("stage {} failed", stage.name)),
                        pipeline: None,
                    };
                }
                StageStatus::Aborted => {
                    return StagePhase {
                        status: BuildStatus::Aborted,
                        stages: stages_out,
                        failed_step,
                        exit_code,
                        error_message: Some(format!("stage {} aborted", stage.name)),
                        pipeline: None,
                    };
                }
                StageStatus::TimedOut => {
                    return StagePhase {
                        status: BuildStatus::TimedOut,
                        stages: stages_out,
                        failed_step,
                        exit_code,
                        error_message: Some(format!("stage {} timed out", stage.name)),
                        pipeline: None,
                    };
                }
            }
        }

        StagePhase::success(stages_out, None)
    }

    /// Run a stage's steps, honouring the stage budget (sum of step
    /// timeouts plus slack) when every step declares a timeout.
    async fn run_stage_steps(
        &self,
        build: &Build,
        pipeline: &Pipeline,
        stage: &Stage,
        workspace: &Path,
        cancel: &CancellationToken,
    ) -> (Vec<StepResult>, Vec<StepStatus>) {
        let budget: Option<u64> = stage
            .steps
            .iter()
            .map(|s| s.common().timeout_ms)
            .try_fold(0u64, |acc, t| t.map(|t| acc + t));

        let stage_cancel = cancel.child_token();
        let runner = self.clone();
        let build_owned = build.clone();
        let pipeline_owned = pipeline.clone();
        let stage_owned = stage.clone();
        let workspace_owned = workspace.to_path_buf();
        let task_cancel = stage_cancel.clone();
        let mut task = tokio::spawn(async move {
            if stage_owned.parallel {
                runner
                    .run_parallel_steps(
                        &build_owned,
                        &pipeline_owned,
                        &stage_owned,
                        &workspace_owned,
                        task_cancel,
                    )
                    .await
            } else {
                runner
                    .run_sequential_steps(
                        &build_owned,
                        &pipeline_owned,
                        &stage_owned,
                        &workspace_owned,
                        task_cancel,
                    )
                    .await
            }
        });

        let joined = match budget {
            Some(total_ms) => {
                let deadline =
                    Duration::from_millis(total_ms + self.config.stage_timeout_slack_ms);
                match tokio::time::timeout(deadline, &mut task).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        warn!(stage = %stage.name, "stage exceeded its time budget");
                        stage_cancel.cancel();
                        let joined = task.await;
                        return match joined {
                            Ok((steps, mut effective)) => {
                                // The budget overrun is the stage's story
                                // even though individual steps report
                                // their own abort.
                                effective.push(StepStatus::TimedOut);
                                (steps, effective)
                            }
                            Err(_) => (Vec::new(), vec![StepStatus::TimedOut]),
                        };
                    }
                }
            }
            None => task.await,
        };

        match joined {
            Ok(result) => result,
            Err(e) => {
                error!(stage = %stage.name, error = %e, "stage task crashed");
                (Vec::new(), vec![StepStatus::Failure])
            }
        }
    }

    async fn run_sequential_steps(
        &self,
        build: &Build,
        pipeline: &Pipeline,
        stage: &Stage,
        workspace: &Path,
        cancel: CancellationToken,
    ) -> (Vec<StepResult>, Vec<StepStatus>) {
        let mut results = Vec::new();
        let mut effective = Vec::new();

        for step in &stage.steps {
            if cancel.is_cancelled() {
                break;
            }
            if let Some(condition) = &step.common().condition {
                if !condition.evaluate(build.branch.as_deref(), &build.parameters) {
                    continue;
                }
            }
            let result = self
                .run_step(build, pipeline, stage, step, workspace, &cancel)
                .await;
            let step_effective = effective_status(result.status, step.common().continue_on_error);
            results.push(result);
            effective.push(step_effective);
            if step_effective != StepStatus::Success {
                // First failure fails the stage; later steps never start.
                break;
            }
        }
        (results, effective)
    }

    async fn run_parallel_steps(
        &self,
        build: &Build,
        pipeline: &Pipeline,
        stage: &Stage,
        workspace: &Path,
        cancel: CancellationToken,
    ) -> (Vec<StepResult>, Vec<StepStatus>) {
        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel_steps));
        let mut handles = Vec::new();

        for (index, step) in stage.steps.iter().enumerate() {
            if let Some(condition) = &step.common().condition {
                if !condition.evaluate(build.branch.as_deref(), &build.parameters) {
                    continue;
                }
            }
            let runner = self.clone();
            let build = build.clone();
            let pipeline = pipeline.clone();
            let stage = stage.clone();
            let step = step.clone();
            let workspace = workspace.to_path_buf();
            let cancel = cancel.clone();
            let semaphore = semaphore.clone();

            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire().await;
                let result = runner
                    .run_step(&build, &pipeline, &stage, &step, &workspace, &cancel)
                    .await;
                let step_effective =
                    effective_status(result.status, step.common().continue_on_error);
                if step_effective != StepStatus::Success {
                    // Any failing step cancels its running siblings.
                    cancel.cancel();
                }
                (index, result, step_effective)
            }));
        }

        let mut indexed: Vec<(usize, StepResult, StepStatus)> = Vec::new();
        for handle in handles {
            match handle.await {
                Ok(entry) => indexed.push(entry),
                Err(e) => error!(stage = %stage.name, error = %e, "parallel step task crashed"),
            }
        }
        indexed.sort_by_key(|(index, _, _)| *index);

        let mut results = Vec::new();
        let mut effective = Vec::new();
        for (_, result, step_effective) in indexed {
            results.push(result);
            effective.push(step_effective);
        }
        (results, effective)
    }

    /// Execute one step: secrets, context, registry dispatch, events.
    /// Executor errors and panics surface as a failed step result.
    async fn run_step(
        &self,
        build: &Build,
        pipeline: &Pipeline,
        stage: &Stage,
        step: &Step,
        workspace: &Path,
        cancel: &CancellationToken,
    ) -> StepResult {
        let step_name = step.name().to_string();
        let step_id = ResourceId::new();
        let started_at = Utc::now();

        let _ = self
            .emit(
                BuildEvent::new(build.id, EventType::StepStarted)
                    .with_stage(&stage.name)
                    .with_step(&step_name),
            )
            .await;

        let secrets = match self
            .secrets
            .resolve_for_step(build.org_id, build.job_id, &step.common().secrets)
            .await
        {
            Ok(secrets) => secrets,
            Err(e) => {
                return self
                    .complete_step(build, stage, &step_name, started_at, failed_output(&e))
                    .await;
            }
        };

        // Job-level env plus stage-container defaults; the executor
        // layers step env and secrets on top.
        let mut env = pipeline.env.clone();
        if let Some(container) = &stage.container {
            env.extend(container.env.clone());
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let pump = tokio::spawn(pump_step_output(
            rx,
            self.events.clone(),
            self.bus.clone(),
            build.id,
            stage.name.clone(),
            step_name.clone(),
        ));

        let ctx = StepContext {
            build_id: build.id,
            step_id,
            org_id: build.org_id,
            workspace_dir: workspace.to_path_buf(),
            env,
            secrets,
            cancel: cancel.clone(),
            line_sink: Arc::new(ChannelSink { tx }),
        };

        let executors = self.executors.clone();
        let step_owned = apply_stage_container(step.clone(), stage);
        let execution = tokio::spawn(async move { executors.execute(&ctx, &step_owned).await });

        let output = match execution.await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => failed_output(&e),
            Err(e) => {
                error!(step = %step_name, error = %e, "step executor crashed");
                chengis_core::build::StepOutput::failed(format!("step executor crashed: {e}"))
            }
        };

        // The context (and with it the sink sender) is gone; wait for
        // the pump so step-output events precede step-completed.
        let _ = pump.await;

        self.complete_step(build, stage, &step_name, started_at, output)
            .await
    }

    async fn complete_step(
        &self,
        build: &Build,
        stage: &Stage,
        step_name: &str,
        started_at: chrono::DateTime<Utc>,
        output: chengis_core::build::StepOutput,
    ) -> StepResult {
        let completed_at = Utc::now();
        let _ = self
            .emit(
                BuildEvent::new(build.id, EventType::StepCompleted)
                    .with_stage(&stage.name)
                    .with_step(step_name)
                    .with_data(json!({
                        "status": output.status.as_str(),
                        "exit_code": output.exit_code,
                    })),
            )
            .await;
        StepResult {
            name: step_name.to_string(),
            status: output.status,
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
            duration_ms: (completed_at - started_at).num_milliseconds(),
            started_at,
            completed_at,
        }
    }

    /// Suspend on an approval gate until it resolves or times out.
    async fn wait_for_approval(
        &self,
        build: &Build,
        stage: &Stage,
        spec: &chengis_core::pipeline::ApprovalSpec,
    ) -> Result<GateStatus> {
        let gate = ApprovalGate::new(build.id, &stage.name, spec);
        let gate = self
            .approvals
            .create_or_get(&gate)
            .await
            .map_err(chengis_core::Error::from)?;
        if gate.status.is_terminal() {
            return Ok(gate.status);
        }

        self.builds
            .set_waiting_approval(build.id)
            .await
            .map_err(chengis_core::Error::from)?;
        self.emit(
            BuildEvent::new(build.id, EventType::WaitingApproval)
                .with_stage(&stage.name)
                .with_data(json!({
                    "min_approvals": gate.min_approvals,
                    "timeout_minutes": gate.timeout_minutes,
                })),
        )
        .await?;
        info!(build = %build.id, stage = %stage.name, "waiting for approval");

        loop {
            sleep(Duration::from_millis(self.config.approval_poll_ms)).await;
            let mut current = self
                .approvals
                .get(build.id, &stage.name)
                .await
                .map_err(chengis_core::Error::from)?
                .ok_or_else(|| Error::NotFound(format!("gate for stage {}", stage.name)))?;

            if current.status == GateStatus::Pending && current.check_timeout(Utc::now()) {
                self.approvals
                    .resolve(current.id, GateStatus::TimedOut)
                    .await
                    .map_err(chengis_core::Error::from)?;
            }

            if current.status.is_terminal() {
                self.emit(
                    BuildEvent::new(build.id, EventType::ApprovalResolved)
                        .with_stage(&stage.name)
                        .with_data(json!({ "status": current.status.as_str() })),
                )
                .await?;
                if current.status == GateStatus::Approved {
                    self.builds
                        .resume_running(build.id)
                        .await
                        .map_err(chengis_core::Error::from)?;
                }
                return Ok(current.status);
            }
        }
    }

    /// Post-action groups: `always` first, then `on-success` or
    /// `on-failure`. Failures are logged and audited only.
    async fn run_post_actions(
        &self,
        build: &Build,
        pipeline: &Pipeline,
        workspace: &Path,
        phase_status: BuildStatus,
    ) {
        if pipeline.post_actions.is_empty() {
            return;
        }
        let conditional = if phase_status == BuildStatus::Success {
            &pipeline.post_actions.on_success
        } else {
            &pipeline.post_actions.on_failure
        };
        let post_stage = Stage {
            name: "post".into(),
            parallel: false,
            condition: None,
            container: None,
            approval: None,
            steps: Vec::new(),
        };

        for step in pipeline.post_actions.always.iter().chain(conditional) {
            // Post-actions run on a fresh token so they still execute
            // after cancellation.
            let result = self
                .run_step(
                    build,
                    pipeline,
                    &post_stage,
                    step,
                    workspace,
                    &CancellationToken::new(),
                )
                .await;
            if result.status != StepStatus::Success {
                warn!(step = %result.name, status = %result.status, "post-action failed");
                let _ = self
                    .audit
                    .append(
                        build.org_id,
                        None,
                        "post-action-failed",
                        "build",
                        &build.id.to_string(),
                        json!({ "step": result.name, "status": result.status.as_str() }),
                    )
                    .await;
            }
        }
    }

    async fn trigger_dependents(&self, job: &JobRecord) {
        let dependents = match self.jobs.dependents(job.id.into()).await {
            Ok(dependents) => dependents,
            Err(e) => {
                warn!(job = %job.name, error = %e, "failed to load dependent jobs");
                return;
            }
        };
        for dependent in dependents {
            let trigger = TriggerDescriptor {
                kind: TriggerKind::Dependency,
                parameters: HashMap::new(),
                branch: None,
                parent_build_id: None,
                actor: Some(format!("job:{}", job.name)),
            };
            if let Err(e) = self.trigger(&dependent, trigger).await {
                warn!(job = %dependent.name, error = %e, "failed to trigger dependent job");
            }
        }
    }

    async fn emit(&self, event: BuildEvent) -> Result<()> {
        self.events
            .append(&event)
            .await
            .map_err(chengis_core::Error::from)?;
        self.bus.publish(event);
        Ok(())
    }
}

/// A `continue-on-error` failure does not gate later steps or fail the
/// stage; the recorded step result still says failure.
fn effective_status(status: StepStatus, continue_on_error: bool) -> StepStatus {
    match status {
        StepStatus::Failure if continue_on_error => StepStatus::Success,
        other => other,
    }
}

fn failed_output(error: &Error) -> chengis_core::build::StepOutput {
    chengis_core::build::StepOutput::failed(error.to_string())
}

/// Shell steps inside a stage that declares a container become
/// containerised with the stage's settings; containerised steps merge
/// missing fields from the stage default.
fn apply_stage_container(step: Step, stage: &Stage) -> Step {
    let Some(stage_container) = &stage.container else {
        return step;
    };
    match step {
        Step::Shell(common) => Step::Container {
            common,
            container: stage_container.clone(),
        },
        Step::Container { common, mut container } => {
            if container.workdir.is_none() {
                container.workdir = stage_container.workdir.clone();
            }
            if container.network.is_none() {
                container.network = stage_container.network.clone();
            }
            for (k, v) in &stage_container.env {
                container.env.entry(k.clone()).or_insert_with(|| v.clone());
            }
            Step::Container { common, container }
        }
        other => other,
    }
}

struct ChannelSink {
    tx: mpsc::UnboundedSender<(LogSource, String)>,
}

impl LineSink for ChannelSink {
    fn line(&self, source: LogSource, line: &str) {
        let _ = self.tx.send((source, line.to_string()));
    }
}

/// Drain step output into coalesced `step-output` events. A single
/// drainer per step keeps lines in order; multiple lines may share one
/// event.
async fn pump_step_output(
    mut rx: mpsc::UnboundedReceiver<(LogSource, String)>,
    events: Arc<EventRepo>,
    bus: Arc<EventBus>,
    build_id: ResourceId,
    stage_name: String,
    step_name: String,
) {
    let mut buffer: Vec<(LogSource, String)> = Vec::new();
    loop {
        let received = rx.recv_many(&mut buffer, 64).await;
        if received == 0 {
            break;
        }
        let lines: Vec<serde_json::Value> = buffer
            .drain(..)
            .map(|(source, line)| json!({ "stream": source.as_str(), "line": line }))
            .collect();
        let event = BuildEvent::new(build_id, EventType::StepOutput)
            .with_stage(&stage_name)
            .with_step(&step_name)
            .with_data(json!({ "lines": lines }));
        if let Err(e) = events.append(&event).await {
            warn!(build = %build_id, error = %e, "failed to append step output");
        }
        bus.publish(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chengis_core::pipeline::{ContainerSpec, PullPolicy, StepCommon};

    #[test]
    fn continue_on_error_masks_failure_only() {
        assert_eq!(
            effective_status(StepStatus::Failure, true),
            StepStatus::Success
        );
        assert_eq!(
            effective_status(StepStatus::Failure, false),
            StepStatus::Failure
        );
        assert_eq!(
            effective_status(StepStatus::Aborted, true),
            StepStatus::Aborted
        );
        assert_eq!(
            effective_status(StepStatus::TimedOut, true),
            StepStatus::TimedOut
        );
    }

    fn common(name: &str) -> StepCommon {
        StepCommon {
            name: name.into(),
            command: "true".into(),
            env: HashMap::new(),
            dir: None,
            timeout_ms: None,
            condition: None,
            continue_on_error: false,
            secrets: vec![],
        }
    }

    fn stage_with_container(image: &str) -> Stage {
        Stage {
            name: "s".into(),
            parallel: false,
            condition: None,
            container: Some(ContainerSpec {
                image: image.into(),
                pull_policy: PullPolicy::default(),
                workdir: Some("/build".into()),
                network: None,
                volumes: vec![],
                env: HashMap::from([("STAGE".into(), "yes".into())]),
            }),
            approval: None,
            steps: vec![],
        }
    }

    #[test]
    fn stage_container_wraps_shell_steps() {
        let step = apply_stage_container(Step::Shell(common("a")), &stage_with_container("tool:1"));
        match step {
            Step::Container { container, .. } => {
                assert_eq!(container.image, "tool:1");
                assert_eq!(container.workdir.as_deref(), Some("/build"));
            }
            other => panic!("expected container step, got {}", other.kind()),
        }
    }

    #[test]
    fn step_container_keeps_its_own_image() {
        let step = Step::Container {
            common: common("a"),
            container: ContainerSpec {
                image: "mine:2".into(),
                pull_policy: PullPolicy::default(),
                workdir: None,
                network: None,
                volumes: vec![],
                env: HashMap::new(),
            },
        };
        let merged = apply_stage_container(step, &stage_with_container("tool:1"));
        match merged {
            Step::Container { container, .. } => {
                assert_eq!(container.image, "mine:2");
                // Missing fields filled from the stage default.
                assert_eq!(container.workdir.as_deref(), Some("/build"));
                assert_eq!(container.env.get("STAGE").map(String::as_str), Some("yes"));
            }
            other => panic!("expected container step, got {}", other.kind()),
        }
    }

    #[test]
    fn stage_without_container_leaves_steps_alone() {
        let stage = Stage {
            name: "s".into(),
            parallel: false,
            condition: None,
            container: None,
            approval: None,
            steps: vec![],
        };
        let step = apply_stage_container(Step::Shell(common("a")), &stage);
        assert_eq!(step.kind(), "shell");
    }
}

/// End-to-end scenarios against a live PostgreSQL.
/// Run with: DATABASE_URL=postgres://... cargo test -- --ignored
#[cfg(test)]
mod integration_tests {
    use super::*;
    use chengis_core::bus::EventBus;
    use chengis_db::{OrgRepo, RoutedDatasource, SecretRepo};
    use chengis_executor::ShellExecutor;
    use chengis_secrets::{LocalBackend, MasterKey, NullAccessAudit, SecretResolver};

    struct Harness {
        runner: Arc<BuildRunner>,
        jobs: Arc<JobRepo>,
        orgs: Arc<OrgRepo>,
        _workspaces: tempfile::TempDir,
        _artifacts: tempfile::TempDir,
    }

    async fn harness() -> Harness {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must point at a test database");
        let pool = chengis_db::create_pool(&url).await.unwrap();
        chengis_db::run_migrations(&pool).await.unwrap();
        let db = RoutedDatasource::primary_only(pool);

        let jobs = Arc::new(JobRepo::new(db.clone()));
        let builds = Arc::new(BuildRepo::new(db.clone()));
        let events = Arc::new(EventRepo::new(db.clone()));
        let templates = Arc::new(TemplateRepo::new(db.clone()));
        let approvals = Arc::new(ApprovalRepo::new(db.clone()));
        let audit = Arc::new(AuditRepo::new(db.clone()));
        let artifact_repo = Arc::new(ArtifactRepo::new(db.clone()));
        let secret_repo = Arc::new(SecretRepo::new(db.clone()));
        let policy_repo = Arc::new(chengis_db::PolicyRepo::new(db.clone()));
        let orgs = Arc::new(OrgRepo::new(db.clone()));

        let mut executors = ExecutorRegistry::new();
        executors.register(Arc::new(ShellExecutor));

        let key = MasterKey::from_hex(&"ab".repeat(32)).unwrap();
        let local: Arc<dyn chengis_core::secret::SecretBackend> =
            Arc::new(LocalBackend::new(secret_repo, key));
        let secrets = Arc::new(SecretResolver::new(
            local,
            None,
            false,
            Arc::new(NullAccessAudit),
        ));

        let workspaces = tempfile::tempdir().unwrap();
        let artifacts_dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(BuildRunner {
            jobs: jobs.clone(),
            builds,
            events,
            templates,
            approvals,
            audit,
            artifact_repo: artifact_repo.clone(),
            bus: Arc::new(EventBus::default()),
            executors: Arc::new(executors),
            secrets,
            workspace: Arc::new(WorkspaceManager::new(workspaces.path())),
            artifacts: Arc::new(ArtifactStore::new(artifacts_dir.path(), artifact_repo)),
            policy: Arc::new(PolicyGate::new(policy_repo)),
            notifiers: Arc::new(NotifierRegistry::standard()),
            config: RunnerConfig {
                approval_poll_ms: 100,
                ..RunnerConfig::default()
            },
        });

        Harness {
            runner,
            jobs,
            orgs,
            _workspaces: workspaces,
            _artifacts: artifacts_dir,
        }
    }

    fn shell(name: &str, command: &str, timeout_ms: Option<u64>) -> Step {
        Step::Shell(chengis_core::pipeline::StepCommon {
            name: name.into(),
            command: command.into(),
            env: HashMap::new(),
            dir: None,
            timeout_ms,
            condition: None,
            continue_on_error: false,
            secrets: vec![],
        })
    }

    fn pipeline(name: &str, stages: Vec<Stage>) -> Pipeline {
        Pipeline {
            name: name.into(),
            description: None,
            parameters: HashMap::new(),
            triggers: vec![],
            source: None,
            stages,
            post_actions: Default::default(),
            artifacts: vec![],
            notify: vec![],
            container: None,
            env: HashMap::new(),
            labels: vec![],
            extends: None,
        }
    }

    async fn run_build(h: &Harness, job: &JobRecord) -> (Build, BuildResult) {
        let build = h
            .runner
            .trigger(job, TriggerDescriptor::manual(HashMap::new(), None))
            .await
            .unwrap();
        assert!(h.runner.builds.try_start(build.id, None).await.unwrap());
        let result = h.runner.execute(build.id).await.unwrap();
        (build, result)
    }

    #[tokio::test]
    #[ignore]
    async fn sequential_success_emits_ordered_events() {
        let h = harness().await;
        let org = h.orgs.ensure("it-seq").await.unwrap();
        let job = h
            .jobs
            .create(
                org.id.into(),
                &format!("seq-{}", uuid::Uuid::now_v7()),
                &pipeline(
                    "seq",
                    vec![Stage {
                        name: "S".into(),
                        parallel: false,
                        condition: None,
                        container: None,
                        approval: None,
                        steps: vec![shell("A", "exit 0", None), shell("B", "exit 0", None)],
                    }],
                ),
            )
            .await
            .unwrap();

        let (build, result) = run_build(&h, &job).await;
        assert_eq!(result.status, BuildStatus::Success);

        let events = h.runner.events.list(build.id, None, 100).await.unwrap();
        let kinds: Vec<(EventType, Option<String>)> = events
            .iter()
            .filter(|e| e.event_type != EventType::StepOutput)
            .map(|e| (e.event_type, e.step_name.clone()))
            .collect();
        assert_eq!(
            kinds,
            vec![
                (EventType::BuildStarted, None),
                (EventType::StageStarted, None),
                (EventType::StepStarted, Some("A".into())),
                (EventType::StepCompleted, Some("A".into())),
                (EventType::StepStarted, Some("B".into())),
                (EventType::StepCompleted, Some("B".into())),
                (EventType::StageCompleted, None),
                (EventType::BuildCompleted, None),
            ]
        );
    }

    #[tokio::test]
    #[ignore]
    async fn parallel_failure_short_circuits_and_fails_build() {
        let h = harness().await;
        let org = h.orgs.ensure("it-par").await.unwrap();
        let job = h
            .jobs
            .create(
                org.id.into(),
                &format!("par-{}", uuid::Uuid::now_v7()),
                &pipeline(
                    "par",
                    vec![Stage {
                        name: "P".into(),
                        parallel: true,
                        condition: None,
                        container: None,
                        approval: None,
                        steps: vec![shell("ok", "sleep 5", None), shell("fail", "exit 7", None)],
                    }],
                ),
            )
            .await
            .unwrap();

        let (_, result) = run_build(&h, &job).await;
        assert_eq!(result.status, BuildStatus::Failure);
        assert_eq!(result.failed_step.as_deref(), Some("fail"));
        assert_eq!(result.exit_code, Some(7));

        let stage = &result.stages[0];
        let fail = stage.steps.iter().find(|s| s.name == "fail").unwrap();
        let ok = stage.steps.iter().find(|s| s.name == "ok").unwrap();
        assert_eq!(fail.status, StepStatus::Failure);
        assert_eq!(fail.exit_code, Some(7));
        assert_eq!(ok.status, StepStatus::Aborted);
        assert_eq!(stage.status, chengis_core::build::StageStatus::Failure);
    }

    #[tokio::test]
    #[ignore]
    async fn step_timeout_reports_timed_out_build() {
        let h = harness().await;
        let org = h.orgs.ensure("it-timeout").await.unwrap();
        let job = h
            .jobs
            .create(
                org.id.into(),
                &format!("to-{}", uuid::Uuid::now_v7()),
                &pipeline(
                    "to",
                    vec![Stage {
                        name: "S".into(),
                        parallel: false,
                        condition: None,
                        container: None,
                        approval: None,
                        steps: vec![shell("slow", "sleep 60", Some(2000))],
                    }],
                ),
            )
            .await
            .unwrap();

        let started = std::time::Instant::now();
        let (_, result) = run_build(&h, &job).await;
        assert_eq!(result.status, BuildStatus::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(30));
    }
}
