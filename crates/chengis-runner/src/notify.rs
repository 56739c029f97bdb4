//! Notifier registry and the built-in notifiers.
//!
//! Notifiers run at build finalization. A failing or unknown notifier is
//! logged and never affects the build result.

use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use chengis_core::notify::{Notification, Notifier};
use chengis_core::pipeline::NotifySpec;
use chengis_core::{Error, Result};

#[derive(Default)]
pub struct NotifierRegistry {
    notifiers: HashMap<&'static str, Arc<dyn Notifier>>,
}

impl NotifierRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ConsoleNotifier));
        registry.register(Arc::new(SlackNotifier::new()));
        registry.register(Arc::new(EmailNotifier));
        registry
    }

    pub fn register(&mut self, notifier: Arc<dyn Notifier>) {
        self.notifiers.insert(notifier.kind(), notifier);
    }

    /// Invoke every declared notifier; log failures and move on.
    pub async fn dispatch(&self, specs: &[NotifySpec], notification: &Notification) {
        for spec in specs {
            match self.notifiers.get(spec.kind.as_str()) {
                Some(notifier) => {
                    if let Err(e) = notifier.notify(spec, notification).await {
                        warn!(kind = %spec.kind, error = %e, "notifier failed");
                    }
                }
                None => {
                    warn!(kind = %spec.kind, "unknown notifier type");
                }
            }
        }
    }
}

/// Logs the notification; the default sink.
pub struct ConsoleNotifier;

#[async_trait]
impl Notifier for ConsoleNotifier {
    fn kind(&self) -> &'static str {
        "console"
    }

    async fn notify(&self, _spec: &NotifySpec, notification: &Notification) -> Result<()> {
        info!(
            job = %notification.job_name,
            build = notification.build_number,
            status = %notification.status,
            link = %notification.link,
            "build finished"
        );
        Ok(())
    }
}

/// Posts to a Slack incoming webhook.
pub struct SlackNotifier {
    client: reqwest::Client,
}

impl SlackNotifier {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for SlackNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Notifier for SlackNotifier {
    fn kind(&self) -> &'static str {
        "slack"
    }

    async fn notify(&self, spec: &NotifySpec, notification: &Notification) -> Result<()> {
        let url = spec
            .settings
            .get("webhook-url")
            .ok_or_else(|| Error::InvalidInput("slack notifier needs webhook-url".into()))?;
        let text = format!(
            "{} #{} finished: {} — {}",
            notification.job_name,
            notification.build_number,
            notification.status,
            notification.link
        );
        let response = self
            .client
            .post(url)
            .json(&json!({ "text": text }))
            .send()
            .await
            .map_err(|e| Error::Internal(format!("slack: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::Internal(format!("slack: {}", response.status())));
        }
        Ok(())
    }
}

/// Records an outbound mail; delivery is delegated to the host's relay.
pub struct EmailNotifier;

#[async_trait]
impl Notifier for EmailNotifier {
    fn kind(&self) -> &'static str {
        "email"
    }

    async fn notify(&self, spec: &NotifySpec, notification: &Notification) -> Result<()> {
        let to = spec
            .settings
            .get("to")
            .ok_or_else(|| Error::InvalidInput("email notifier needs to".into()))?;
        info!(
            to = %to,
            job = %notification.job_name,
            build = notification.build_number,
            status = %notification.status,
            "email notification queued"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chengis_core::ResourceId;
    use chengis_core::build::BuildStatus;
    use std::sync::Mutex;

    struct CountingNotifier {
        calls: Mutex<u32>,
        fail: bool,
    }

    #[async_trait]
    impl Notifier for CountingNotifier {
        fn kind(&self) -> &'static str {
            "counting"
        }

        async fn notify(&self, _spec: &NotifySpec, _n: &Notification) -> Result<()> {
            *self.calls.lock().unwrap() += 1;
            if self.fail {
                return Err(Error::Internal("boom".into()));
            }
            Ok(())
        }
    }

    fn notification() -> Notification {
        Notification {
            build_id: ResourceId::new(),
            job_name: "demo".into(),
            build_number: 3,
            status: BuildStatus::Success,
            link: "http://localhost/builds/x".into(),
        }
    }

    fn spec(kind: &str) -> NotifySpec {
        NotifySpec {
            kind: kind.into(),
            settings: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn dispatch_ignores_unknown_kinds() {
        let registry = NotifierRegistry::new();
        // Must not panic or error.
        registry.dispatch(&[spec("nonexistent")], &notification()).await;
    }

    #[tokio::test]
    async fn failing_notifier_does_not_stop_others() {
        let mut registry = NotifierRegistry::new();
        let failing = Arc::new(CountingNotifier {
            calls: Mutex::new(0),
            fail: true,
        });
        registry.register(failing.clone());
        registry
            .dispatch(&[spec("counting"), spec("counting")], &notification())
            .await;
        assert_eq!(*failing.calls.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn console_notifier_always_succeeds() {
        assert!(
            ConsoleNotifier
                .notify(&spec("console"), &notification())
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn email_requires_recipient() {
        assert!(
            EmailNotifier
                .notify(&spec("email"), &notification())
                .await
                .is_err()
        );
    }
}
