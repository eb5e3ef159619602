use crate::error::Result;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

/// Prometheus collectors for the orchestrator.
pub struct RuntimeMetrics {
    registry: Registry,

    pub tasks_scheduled: IntCounterVec,
    pub tasks_in_flight: IntGauge,

    pub runs_completed: IntCounter,
    pub runs_failed: IntCounter,
    pub run_duration: Histogram,
    pub resolves_issued: IntCounter,

    pub chain_events: IntCounterVec,
    pub chain_event_errors: IntCounterVec,
    pub subscription_restarts: IntCounterVec,

    pub dataset_versions: IntGauge,
}

impl RuntimeMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let tasks_scheduled = IntCounterVec::new(
            Opts::new("labchain_tasks_scheduled_total", "Tasks enqueued on the scheduler"),
            &["kind"],
        )?;
        let tasks_in_flight =
            IntGauge::new("labchain_tasks_in_flight", "Scheduler tasks currently running")?;

        let runs_completed =
            IntCounter::new("labchain_runs_completed_total", "Executions marked COMPLETED")?;
        let runs_failed =
            IntCounter::new("labchain_runs_failed_total", "Executions marked FAILED")?;
        let run_duration = Histogram::with_opts(
            HistogramOpts::new(
                "labchain_run_duration_seconds",
                "Wall time of the run pipeline",
            )
            .buckets(vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0]),
        )?;
        let resolves_issued =
            IntCounter::new("labchain_resolves_issued_total", "Resolve calls sent to the chain")?;

        let chain_events = IntCounterVec::new(
            Opts::new("labchain_chain_events_total", "Chain events processed"),
            &["event"],
        )?;
        let chain_event_errors = IntCounterVec::new(
            Opts::new(
                "labchain_chain_event_errors_total",
                "Chain events that failed processing",
            ),
            &["event"],
        )?;
        let subscription_restarts = IntCounterVec::new(
            Opts::new(
                "labchain_subscription_restarts_total",
                "Event subscriptions re-established after loss",
            ),
            &["event"],
        )?;

        let dataset_versions =
            IntGauge::new("labchain_dataset_versions", "Dataset versions tracked by the cache")?;

        registry.register(Box::new(tasks_scheduled.clone()))?;
        registry.register(Box::new(tasks_in_flight.clone()))?;
        registry.register(Box::new(runs_completed.clone()))?;
        registry.register(Box::new(runs_failed.clone()))?;
        registry.register(Box::new(run_duration.clone()))?;
        registry.register(Box::new(resolves_issued.clone()))?;
        registry.register(Box::new(chain_events.clone()))?;
        registry.register(Box::new(chain_event_errors.clone()))?;
        registry.register(Box::new(subscription_restarts.clone()))?;
        registry.register(Box::new(dataset_versions.clone()))?;

        Ok(Self {
            registry,
            tasks_scheduled,
            tasks_in_flight,
            runs_completed,
            runs_failed,
            run_duration,
            resolves_issued,
            chain_events,
            chain_event_errors,
            subscription_restarts,
            dataset_versions,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render all collectors in the Prometheus text format.
    pub fn gather_text(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_render() {
        let metrics = RuntimeMetrics::new().unwrap();
        metrics.tasks_scheduled.with_label_values(&["run"]).inc();
        metrics.runs_completed.inc();
        metrics.dataset_versions.set(3);

        let text = metrics.gather_text().unwrap();
        assert!(text.contains("labchain_tasks_scheduled_total{kind=\"run\"} 1"));
        assert!(text.contains("labchain_runs_completed_total 1"));
        assert!(text.contains("labchain_dataset_versions 3"));
    }
}
