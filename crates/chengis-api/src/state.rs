//! Application state shared across routes.

use std::sync::Arc;

use chengis_config::SystemConfig;
use chengis_core::bus::EventBus;
use chengis_db::{ApprovalRepo, AuditRepo, BuildRepo, EventRepo, JobRepo, WebhookEventRepo};
use chengis_dispatcher::{AgentRegistry, Dispatcher};
use chengis_runner::BuildRunner;

use crate::metrics::Metrics;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<SystemConfig>,
    pub jobs: Arc<JobRepo>,
    pub builds: Arc<BuildRepo>,
    pub events: Arc<EventRepo>,
    pub approvals: Arc<ApprovalRepo>,
    pub audit: Arc<AuditRepo>,
    pub webhook_events: Arc<WebhookEventRepo>,
    pub registry: Arc<AgentRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    pub runner: Arc<BuildRunner>,
    pub bus: Arc<EventBus>,
    pub metrics: Arc<Metrics>,
}
