use prometheus_client::{
    metrics::{counter::Counter, gauge::Gauge},
    registry::Registry,
};

#[derive(Clone, Debug, Default)]
pub struct ControllerMetrics {
    pub(crate) ticks: Counter,
    pub(crate) skipped_ticks: Counter,
    pub(crate) evaluations: Counter,
    pub(crate) suppressed: Counter,
    pub(crate) status_updates: Counter,
    pub(crate) status_update_failures: Counter,
    pub(crate) registered_policies: Gauge,
}

impl ControllerMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let metrics = Self::default();

        prom.register(
            "ticks",
            "Count of background evaluation ticks",
            metrics.ticks.clone(),
        );
        prom.register(
            "skipped_ticks",
            "Count of ticks skipped because bindings could not be listed",
            metrics.skipped_ticks.clone(),
        );
        prom.register(
            "evaluations",
            "Count of policy evaluations",
            metrics.evaluations.clone(),
        );
        prom.register(
            "suppressed_evaluations",
            "Count of evaluations whose result was indeterminate and not recorded",
            metrics.suppressed.clone(),
        );
        prom.register(
            "status_updates",
            "Count of policy status updates",
            metrics.status_updates.clone(),
        );
        prom.register(
            "status_update_failures",
            "Count of policy status updates that failed",
            metrics.status_update_failures.clone(),
        );
        prom.register(
            "registered_policies",
            "Gauge of the number of registered policies",
            metrics.registered_policies.clone(),
        );

        metrics
    }
}
