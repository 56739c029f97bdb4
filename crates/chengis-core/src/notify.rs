//! Notifier abstraction.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::ResourceId;
use crate::build::BuildStatus;
use crate::pipeline::NotifySpec;
use crate::Result;

/// Payload handed to every notifier at build finalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub build_id: ResourceId,
    pub job_name: String,
    pub build_number: i64,
    pub status: BuildStatus,
    /// Link to the build in the web UI.
    pub link: String,
}

/// Delivers build notifications of one kind (console, slack, email, ...).
/// Failures are logged by the caller and never affect the build.
#[async_trait]
pub trait Notifier: Send + Sync {
    fn kind(&self) -> &'static str;

    async fn notify(&self, spec: &NotifySpec, notification: &Notification) -> Result<()>;
}
