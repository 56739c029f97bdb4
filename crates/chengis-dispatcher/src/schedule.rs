//! Interval schedule runner.
//!
//! Jobs declare schedule triggers as intervals; this task enqueues a
//! build whenever one comes due and advances its next-run time past any
//! missed windows.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use chengis_core::ResourceId;
use chengis_core::build::{TriggerDescriptor, TriggerKind};
use chengis_core::pipeline::Trigger;
use chengis_db::{JobRecord, JobRepo, ScheduleRepo};
use chengis_runner::BuildRunner;

pub struct ScheduleRunner {
    pub schedules: Arc<ScheduleRepo>,
    pub jobs: Arc<JobRepo>,
    pub runner: Arc<BuildRunner>,
    pub poll_interval: Duration,
}

impl ScheduleRunner {
    pub fn new(
        schedules: Arc<ScheduleRepo>,
        jobs: Arc<JobRepo>,
        runner: Arc<BuildRunner>,
    ) -> Self {
        Self {
            schedules,
            jobs,
            runner,
            poll_interval: Duration::from_secs(30),
        }
    }

    /// Mirror a job's declared schedule triggers into the schedule
    /// table. Called when a job is created or its pipeline changes.
    pub async fn sync_job(&self, job: &JobRecord) -> chengis_core::Result<()> {
        let pipeline = job.pipeline().map_err(chengis_core::Error::from)?;
        let intervals: Vec<i64> = pipeline
            .triggers
            .iter()
            .filter_map(|trigger| match trigger {
                Trigger::Schedule { interval_seconds } => Some(*interval_seconds as i64),
                _ => None,
            })
            .collect();
        for interval in &intervals {
            self.schedules
                .upsert(ResourceId::from_uuid(job.id), *interval)
                .await
                .map_err(chengis_core::Error::from)?;
        }
        self.schedules
            .prune(ResourceId::from_uuid(job.id), &intervals)
            .await
            .map_err(chengis_core::Error::from)?;
        Ok(())
    }

    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(poll_secs = self.poll_interval.as_secs(), "schedule runner started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = shutdown.cancelled() => {
                    info!("schedule runner stopping");
                    return;
                }
            }
            if let Err(e) = self.tick().await {
                error!(error = %e, "schedule tick failed");
            }
        }
    }

    async fn tick(&self) -> chengis_core::Result<()> {
        let now = Utc::now();
        let due = self
            .schedules
            .due(now)
            .await
            .map_err(chengis_core::Error::from)?;
        for schedule in due {
            let job = match self.jobs.get(schedule.job_id.into()).await {
                Ok(job) => job,
                Err(e) => {
                    warn!(job = %schedule.job_id, error = %e, "scheduled job missing");
                    self.schedules
                        .mark_ran(schedule.id, now)
                        .await
                        .map_err(chengis_core::Error::from)?;
                    continue;
                }
            };
            let trigger = TriggerDescriptor {
                kind: TriggerKind::Scheduled,
                parameters: HashMap::new(),
                branch: None,
                parent_build_id: None,
                actor: Some("scheduler".into()),
            };
            if let Err(e) = self.runner.trigger(&job, trigger).await {
                warn!(job = %job.name, error = %e, "failed to enqueue scheduled build");
            }
            self.schedules
                .mark_ran(schedule.id, now)
                .await
                .map_err(chengis_core::Error::from)?;
        }
        Ok(())
    }
}
