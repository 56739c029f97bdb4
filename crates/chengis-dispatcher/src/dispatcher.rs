//! The dispatch loop.
//!
//! On every tick (and on new-build / heartbeat wakeups): recover builds
//! orphaned by dead agents, then translate queued builds into agent
//! assignments. Assignment is a CAS on the build row; losing the race is
//! not an error. Builds with no eligible agent stay queued and age the
//! pending gauge.

use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use chengis_core::agent::AgentStatus;
use chengis_core::build::Build;
use chengis_core::bus::EventBus;
use chengis_core::event::{BuildEvent, EventType};
use chengis_db::{BuildRepo, EventRepo, JobRepo};
use chengis_runner::BuildRunner;

use crate::client::{AgentClient, BuildDispatch};
use crate::registry::AgentRegistry;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub tick: Duration,
    pub batch_size: i64,
    pub heartbeat_interval: Duration,
    /// Ceiling on builds executed in the master process.
    pub max_local_builds: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(500),
            batch_size: 32,
            heartbeat_interval: Duration::from_secs(15),
            max_local_builds: 4,
        }
    }
}

pub struct Dispatcher {
    pub builds: Arc<BuildRepo>,
    pub jobs: Arc<JobRepo>,
    pub events: Arc<EventRepo>,
    pub registry: Arc<AgentRegistry>,
    pub client: Arc<AgentClient>,
    /// In-process execution when no agent fits.
    pub runner: Option<Arc<BuildRunner>>,
    pub bus: Arc<EventBus>,
    pub config: DispatcherConfig,
    wake: Arc<Notify>,
    local_slots: Arc<Semaphore>,
}

impl Dispatcher {
    pub fn new(
        builds: Arc<BuildRepo>,
        jobs: Arc<JobRepo>,
        events: Arc<EventRepo>,
        registry: Arc<AgentRegistry>,
        client: Arc<AgentClient>,
        runner: Option<Arc<BuildRunner>>,
        bus: Arc<EventBus>,
        config: DispatcherConfig,
    ) -> Self {
        let local_slots = Arc::new(Semaphore::new(config.max_local_builds));
        Self {
            builds,
            jobs,
            events,
            registry,
            client,
            runner,
            bus,
            config,
            wake: Arc::new(Notify::new()),
            local_slots,
        }
    }

    /// Wake the loop early (new build queued, heartbeat arrived).
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// The single dispatcher task. Runs until shutdown.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(tick_ms = self.config.tick.as_millis() as u64, "dispatcher started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.tick) => {}
                _ = self.wake.notified() => {}
                _ = shutdown.cancelled() => {
                    info!("dispatcher stopping");
                    return;
                }
            }
            if let Err(e) = self.recover_orphans().await {
                error!(error = %e, "orphan recovery failed");
            }
            if let Err(e) = self.dispatch_batch().await {
                error!(error = %e, "dispatch failed");
            }
        }
    }

    async fn dispatch_batch(&self) -> chengis_core::Result<()> {
        let queued = self
            .builds
            .queued_batch(self.config.batch_size)
            .await
            .map_err(chengis_core::Error::from)?;
        for build in queued {
            self.dispatch_one(build).await;
        }
        Ok(())
    }

    async fn dispatch_one(&self, build: Build) {
        let now = Instant::now();
        let selected = self
            .registry
            .select_and_reserve(build.org_id, &build.required_labels, now)
            .await;

        match selected {
            Some(agent) => {
                // CAS queued → running; a racing dispatcher may win.
                match self.builds.try_start(build.id, Some(agent.id)).await {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!(build = %build.id, "lost dispatch race");
                        self.registry.release(agent.id).await;
                        return;
                    }
                    Err(e) => {
                        warn!(build = %build.id, error = %e, "failed to claim build");
                        self.registry.release(agent.id).await;
                        return;
                    }
                }

                let dispatch = match self.build_dispatch(&build).await {
                    Ok(dispatch) => dispatch,
                    Err(e) => {
                        warn!(build = %build.id, error = %e, "failed to prepare dispatch");
                        let _ = self.builds.requeue_orphan(build.id, agent.id).await;
                        self.registry.release(agent.id).await;
                        return;
                    }
                };

                match self.client.send_build(&agent, &dispatch).await {
                    Ok(()) => {
                        info!(build = %build.id, agent = %agent.name, "build dispatched");
                        self.registry.record_send_success(agent.id).await;
                    }
                    Err(e) => {
                        // Network failure: the build goes back to the
                        // queue and the breaker counts the failure.
                        warn!(build = %build.id, agent = %agent.name, error = %e, "dispatch send failed");
                        let _ = self.builds.requeue_orphan(build.id, agent.id).await;
                        self.registry.release(agent.id).await;
                        self.registry.record_send_failure(agent.id, now).await;
                    }
                }
            }
            None => {
                if let Some(runner) = &self.runner {
                    self.run_locally(runner.clone(), build).await;
                }
                // Otherwise the build stays queued; the oldest-pending
                // gauge keeps advancing.
            }
        }
    }

    /// Execute a build in the master process when capacity allows.
    async fn run_locally(&self, runner: Arc<BuildRunner>, build: Build) {
        let Ok(permit) = self.local_slots.clone().try_acquire_owned() else {
            return;
        };
        match self.builds.try_start(build.id, None).await {
            Ok(true) => {}
            Ok(false) | Err(_) => return,
        }
        let build_id = build.id;
        let wake = self.wake.clone();
        tokio::spawn(async move {
            let _permit = permit;
            if let Err(e) = runner.execute(build_id).await {
                error!(build = %build_id, error = %e, "in-process build errored");
            }
            wake.notify_one();
        });
    }

    async fn build_dispatch(&self, build: &Build) -> chengis_core::Result<BuildDispatch> {
        let job = self
            .jobs
            .get(build.job_id)
            .await
            .map_err(chengis_core::Error::from)?;
        let pipeline = job.pipeline().map_err(chengis_core::Error::from)?;
        Ok(BuildDispatch {
            build_id: build.id,
            org_id: build.org_id,
            job_name: job.name,
            build_number: build.build_number,
            pipeline,
            parameters: build.parameters.clone(),
            branch: build.branch.clone(),
        })
    }

    /// Declare agents dead after two missed heartbeat intervals and roll
    /// their running builds back to queued, unless the event log already
    /// shows completion.
    async fn recover_orphans(&self) -> chengis_core::Result<()> {
        let dead_after = chrono::Duration::from_std(self.config.heartbeat_interval * 2)
            .unwrap_or_else(|_| chrono::Duration::seconds(30));
        for agent in self.registry.dead_agents(dead_after).await {
            warn!(agent = %agent.name, "agent missed heartbeats, declaring dead");
            self.registry
                .set_status(agent.id, AgentStatus::Offline)
                .await?;

            let running = self
                .builds
                .running_for_agent(agent.id)
                .await
                .map_err(chengis_core::Error::from)?;
            for build in running {
                let completed = self
                    .events
                    .has_terminal_event(build.id)
                    .await
                    .map_err(chengis_core::Error::from)?;
                if completed {
                    continue;
                }
                if self
                    .builds
                    .requeue_orphan(build.id, agent.id)
                    .await
                    .map_err(chengis_core::Error::from)?
                {
                    info!(build = %build.id, agent = %agent.name, "orphaned build requeued");
                    let event = BuildEvent::new(build.id, EventType::OrphanRecovered)
                        .with_data(json!({ "agent": agent.name }));
                    self.events
                        .append(&event)
                        .await
                        .map_err(chengis_core::Error::from)?;
                    self.bus.publish(event);
                    self.registry.release(agent.id).await;
                }
            }
        }
        Ok(())
    }
}
