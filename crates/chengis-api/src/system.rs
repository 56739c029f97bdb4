//! System assembly.
//!
//! Everything with process lifetime lives in the `System` value built
//! here at startup and torn down at shutdown: pools, repositories, the
//! event bus, registries, and the background tasks (dispatcher,
//! schedule runner, retention sweeper, approval-gate sweeper). No
//! thread touches shared state before assembly or after teardown.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use chengis_config::SystemConfig;
use chengis_core::approval::GateStatus;
use chengis_core::bus::EventBus;
use chengis_core::event::EventType;
use chengis_core::secret::SecretBackend;
use chengis_db::retention::{RetentionConfig, RetentionSweeper};
use chengis_db::{
    ApprovalRepo, ArtifactRepo, AuditRepo, BuildRepo, EventRepo, JobRepo, PolicyRepo,
    RoutedDatasource, ScheduleRepo, SecretRepo, TemplateRepo, WebhookEventRepo, create_pool,
    run_migrations,
};
use chengis_dispatcher::{
    AgentClient, AgentRegistry, BreakerConfig, Dispatcher, DispatcherConfig, ScheduleRunner,
};
use chengis_executor::ExecutorRegistry;
use chengis_runner::{
    ArtifactStore, BuildRunner, NotifierRegistry, PolicyGate, RunnerConfig, WorkspaceManager,
};
use chengis_secrets::{DbAccessAudit, LocalBackend, MasterKey, SecretResolver};

use crate::metrics::Metrics;
use crate::state::AppState;

pub struct System {
    pub state: AppState,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl System {
    pub async fn start(config: SystemConfig) -> anyhow::Result<System> {
        let primary = create_pool(&config.database_url).await?;
        run_migrations(&primary).await?;
        let replica = match &config.replica_url {
            Some(url) => Some(create_pool(url).await?),
            None => None,
        };
        let db = RoutedDatasource::new(primary, replica);

        let jobs = Arc::new(JobRepo::new(db.clone()));
        let builds = Arc::new(BuildRepo::new(db.clone()));
        let events = Arc::new(EventRepo::new(db.clone()));
        let templates = Arc::new(TemplateRepo::new(db.clone()));
        let approvals = Arc::new(ApprovalRepo::new(db.clone()));
        let audit = Arc::new(AuditRepo::new(db.clone()));
        let artifacts = Arc::new(ArtifactRepo::new(db.clone()));
        let secrets_repo = Arc::new(SecretRepo::new(db.clone()));
        let policies = Arc::new(PolicyRepo::new(db.clone()));
        let webhook_events = Arc::new(WebhookEventRepo::new(db.clone()));
        let schedules = Arc::new(ScheduleRepo::new(db.clone()));
        let agents = Arc::new(chengis_db::AgentRepo::new(db.clone()));

        let bus = Arc::new(EventBus::new(config.event_bus_capacity));
        let metrics = Arc::new(Metrics::new()?);

        let policy_gate = Arc::new(PolicyGate::new(policies.clone()));
        let executors = Arc::new(ExecutorRegistry::standard(policy_gate.clone()));

        let master_key = match &config.secret_master_key {
            Some(hex_key) => MasterKey::from_hex(hex_key)
                .map_err(|e| anyhow::anyhow!("CHENGIS_SECRET_MASTER_KEY: {e}"))?,
            None => {
                warn!("no secret master key configured; using an ephemeral key");
                MasterKey::ephemeral()
            }
        };
        let local_backend: Arc<dyn SecretBackend> =
            Arc::new(LocalBackend::new(secrets_repo.clone(), master_key));
        let secret_resolver = Arc::new(SecretResolver::new(
            local_backend.clone(),
            Some(local_backend),
            config.secret_fallback_to_local,
            Arc::new(DbAccessAudit::new(secrets_repo, audit.clone())),
        ));

        let runner = Arc::new(BuildRunner {
            jobs: jobs.clone(),
            builds: builds.clone(),
            events: events.clone(),
            templates,
            approvals: approvals.clone(),
            audit: audit.clone(),
            artifact_repo: artifacts.clone(),
            bus: bus.clone(),
            executors,
            secrets: secret_resolver,
            workspace: Arc::new(WorkspaceManager::new(&config.workspace_root)),
            artifacts: Arc::new(ArtifactStore::new(&config.artifact_root, artifacts.clone())),
            policy: policy_gate,
            notifiers: Arc::new(NotifierRegistry::standard()),
            config: RunnerConfig {
                max_parallel_steps: config.max_parallel_steps,
                stage_timeout_slack_ms: config.stage_timeout_slack_ms,
                build_timeout_ms: config.build_timeout_ms,
                external_url: config.external_url.clone(),
                ..RunnerConfig::default()
            },
        });

        let registry = Arc::new(AgentRegistry::new(
            agents,
            BreakerConfig {
                failure_threshold: config.breaker_failure_threshold,
                window: Duration::from_secs(config.breaker_window_secs),
                cooldown: Duration::from_secs(config.breaker_cooldown_secs),
                ..BreakerConfig::default()
            },
        ));
        registry.load_from_store().await?;

        let dispatcher = Arc::new(Dispatcher::new(
            builds.clone(),
            jobs.clone(),
            events.clone(),
            registry.clone(),
            Arc::new(AgentClient::new()),
            Some(runner.clone()),
            bus.clone(),
            DispatcherConfig {
                tick: Duration::from_millis(config.dispatch_tick_ms),
                batch_size: config.dispatch_batch_size,
                heartbeat_interval: Duration::from_secs(config.heartbeat_interval_secs),
                ..DispatcherConfig::default()
            },
        ));

        let shutdown = CancellationToken::new();
        let mut tasks = Vec::new();

        tasks.push(tokio::spawn(
            dispatcher.clone().run(shutdown.child_token()),
        ));

        let schedule_runner = Arc::new(ScheduleRunner::new(
            schedules,
            jobs.clone(),
            runner.clone(),
        ));
        // Re-derive schedules from stored pipelines so declared schedule
        // triggers survive restarts and pipeline edits.
        match jobs.list_all().await {
            Ok(all_jobs) => {
                for job in &all_jobs {
                    if let Err(e) = schedule_runner.sync_job(job).await {
                        warn!(job = %job.name, error = %e, "failed to sync schedules");
                    }
                }
            }
            Err(e) => warn!(error = %e, "failed to load jobs for schedule sync"),
        }
        tasks.push(tokio::spawn(
            schedule_runner.run(shutdown.child_token()),
        ));

        tasks.push(tokio::spawn(retention_loop(
            RetentionSweeper::new(
                db.clone(),
                RetentionConfig {
                    audit_days: Some(config.audit_retention_days),
                    builds_days: Some(config.build_retention_days),
                    webhook_events_days: Some(config.webhook_event_retention_days),
                    ..RetentionConfig::default()
                },
            ),
            Duration::from_secs(config.retention_sweep_interval_secs),
            metrics.clone(),
            shutdown.child_token(),
        )));

        tasks.push(tokio::spawn(gate_sweeper_loop(
            approvals.clone(),
            shutdown.child_token(),
        )));

        tasks.push(tokio::spawn(completion_metrics_loop(
            bus.clone(),
            metrics.clone(),
            shutdown.child_token(),
        )));

        info!("system assembled");
        Ok(System {
            state: AppState {
                config: Arc::new(config),
                jobs,
                builds,
                events,
                approvals,
                audit,
                webhook_events,
                registry,
                dispatcher,
                runner,
                bus,
                metrics,
            },
            shutdown,
            tasks,
        })
    }

    /// Stop background tasks and wait for them.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
        info!("system stopped");
    }
}

async fn retention_loop(
    sweeper: RetentionSweeper,
    interval: Duration,
    metrics: Arc<Metrics>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.cancelled() => return,
        }
        match sweeper.sweep_once().await {
            Ok(counts) => {
                for (resource, count) in counts {
                    metrics
                        .retention_cleaned_total
                        .with_label_values(&[resource])
                        .inc_by(count);
                }
            }
            Err(e) => error!(error = %e, "retention sweep failed"),
        }
    }
}

/// Times out pending approval gates even when no runner is polling them
/// (e.g. after a master restart).
async fn gate_sweeper_loop(approvals: Arc<ApprovalRepo>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(30)) => {}
            _ = shutdown.cancelled() => return,
        }
        let pending = match approvals.pending().await {
            Ok(pending) => pending,
            Err(e) => {
                error!(error = %e, "gate sweep failed");
                continue;
            }
        };
        for mut gate in pending {
            if gate.check_timeout(chrono::Utc::now()) {
                if let Err(e) = approvals.resolve(gate.id, GateStatus::TimedOut).await {
                    error!(gate = %gate.id, error = %e, "failed to time out gate");
                } else {
                    warn!(build = %gate.build_id, stage = %gate.stage_name, "approval gate timed out");
                }
            }
        }
    }
}

/// Mirrors terminal build events into the completion counter.
async fn completion_metrics_loop(
    bus: Arc<EventBus>,
    metrics: Arc<Metrics>,
    shutdown: CancellationToken,
) {
    let mut rx = bus.subscribe();
    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else { return };
                if event.event_type == EventType::BuildCompleted {
                    let status = event
                        .data
                        .get("status")
                        .and_then(|s| s.as_str())
                        .unwrap_or("unknown")
                        .to_string();
                    metrics
                        .builds_completed_total
                        .with_label_values(&[&status])
                        .inc();
                }
            }
            _ = shutdown.cancelled() => return,
        }
    }
}
