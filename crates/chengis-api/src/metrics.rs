//! Prometheus metrics.

use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

pub struct Metrics {
    registry: Registry,
    pub builds_completed_total: IntCounterVec,
    pub webhook_events_total: IntCounterVec,
    pub retention_cleaned_total: IntCounterVec,
    pub queue_oldest_pending_seconds: IntGauge,
    pub agents_online: IntGauge,
    pub event_bus_dropped_total: IntGauge,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let builds_completed_total = IntCounterVec::new(
            Opts::new("chengis_builds_completed_total", "Builds by terminal status"),
            &["status"],
        )?;
        let webhook_events_total = IntCounterVec::new(
            Opts::new("chengis_webhook_events_total", "Webhook events by provider and outcome"),
            &["provider", "status"],
        )?;
        let retention_cleaned_total = IntCounterVec::new(
            Opts::new("chengis_retention_cleaned_total", "Rows removed by the retention sweeper"),
            &["resource"],
        )?;
        let queue_oldest_pending_seconds = IntGauge::with_opts(Opts::new(
            "chengis_queue_oldest_pending_seconds",
            "Age of the oldest queued build",
        ))?;
        let agents_online = IntGauge::with_opts(Opts::new(
            "chengis_agents_online",
            "Agents currently online",
        ))?;
        let event_bus_dropped_total = IntGauge::with_opts(Opts::new(
            "chengis_event_bus_dropped_total",
            "Events dropped by the in-process bus",
        ))?;

        registry.register(Box::new(builds_completed_total.clone()))?;
        registry.register(Box::new(webhook_events_total.clone()))?;
        registry.register(Box::new(retention_cleaned_total.clone()))?;
        registry.register(Box::new(queue_oldest_pending_seconds.clone()))?;
        registry.register(Box::new(agents_online.clone()))?;
        registry.register(Box::new(event_bus_dropped_total.clone()))?;

        Ok(Self {
            registry,
            builds_completed_total,
            webhook_events_total,
            retention_cleaned_total,
            queue_oldest_pending_seconds,
            agents_online,
            event_bus_dropped_total,
        })
    }

    /// Text exposition for `GET /metrics`.
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if encoder
            .encode(&self.registry.gather(), &mut buffer)
            .is_err()
        {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_registered_metrics() {
        let metrics = Metrics::new().unwrap();
        metrics
            .builds_completed_total
            .with_label_values(&["success"])
            .inc();
        metrics.queue_oldest_pending_seconds.set(42);
        let text = metrics.render();
        assert!(text.contains("chengis_builds_completed_total"));
        assert!(text.contains("chengis_queue_oldest_pending_seconds 42"));
    }
}
