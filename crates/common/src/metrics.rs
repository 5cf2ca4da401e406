use std::sync::{Arc, OnceLock};

use prometheus::{Counter, Encoder, Gauge, GaugeVec, Opts, Registry, TextEncoder};

#[derive(Clone, Debug)]
pub struct MetricsRegistry {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    registry: Registry,
    tasks_by_state: GaugeVec,
    running_drivers: Gauge,
    blocked_drivers: Gauge,
    pending_result_requests: Gauge,
    tasks_created: Counter,
    error_tasks_created: Counter,
    tasks_cleaned: Counter,
    driver_yields_requested: Counter,
    long_poll_timeouts: Counter,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::new()),
        }
    }

    pub fn set_tasks_in_state(&self, state: &str, count: u64) {
        self.inner
            .tasks_by_state
            .with_label_values(&[state])
            .set(count as f64);
    }

    pub fn set_driver_counts(&self, running: u64, blocked: u64) {
        self.inner.running_drivers.set(running as f64);
        self.inner.blocked_drivers.set(blocked as f64);
    }

    pub fn set_pending_result_requests(&self, pending: u64) {
        self.inner.pending_result_requests.set(pending as f64);
    }

    pub fn inc_tasks_created(&self) {
        self.inner.tasks_created.inc();
    }

    pub fn inc_error_tasks_created(&self) {
        self.inner.error_tasks_created.inc();
    }

    pub fn inc_tasks_cleaned(&self, count: u64) {
        self.inner.tasks_cleaned.inc_by(count as f64);
    }

    pub fn inc_driver_yields_requested(&self, count: u64) {
        self.inner.driver_yields_requested.inc_by(count as f64);
    }

    pub fn inc_long_poll_timeouts(&self) {
        self.inner.long_poll_timeouts.inc();
    }

    pub fn render_prometheus(&self) -> String {
        let metric_families = self.inner.registry.gather();
        let mut out = Vec::new();
        let enc = TextEncoder::new();
        if enc.encode(&metric_families, &mut out).is_err() {
            return String::new();
        }
        String::from_utf8_lossy(&out).to_string()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsInner {
    fn new() -> Self {
        let registry = Registry::new();

        let tasks_by_state = gauge_vec(
            &registry,
            "flq_worker_tasks",
            "Tasks currently tracked by the registry, per lifecycle state",
            &["state"],
        );
        let running_drivers = gauge(
            &registry,
            "flq_worker_running_drivers",
            "Drivers currently on an execution thread across non-terminal tasks",
        );
        let blocked_drivers = gauge(
            &registry,
            "flq_worker_blocked_drivers",
            "Drivers currently blocked across non-terminal tasks",
        );
        let pending_result_requests = gauge(
            &registry,
            "flq_worker_pending_result_requests",
            "Result polls parked waiting for buffer data",
        );
        let tasks_created = counter(
            &registry,
            "flq_worker_tasks_created_total",
            "Tasks created by create-or-update calls",
        );
        let error_tasks_created = counter(
            &registry,
            "flq_worker_error_tasks_created_total",
            "Tasks synthesized directly into Failed state",
        );
        let tasks_cleaned = counter(
            &registry,
            "flq_worker_tasks_cleaned_total",
            "Terminal tasks removed by the cleanup sweep",
        );
        let driver_yields_requested = counter(
            &registry,
            "flq_worker_driver_yields_requested_total",
            "Cooperative yields requested from driver threads",
        );
        let long_poll_timeouts = counter(
            &registry,
            "flq_worker_long_poll_timeouts_total",
            "Status/info long polls resolved by max-wait expiry",
        );

        Self {
            registry,
            tasks_by_state,
            running_drivers,
            blocked_drivers,
            pending_result_requests,
            tasks_created,
            error_tasks_created,
            tasks_cleaned,
            driver_yields_requested,
            long_poll_timeouts,
        }
    }
}

fn counter(registry: &Registry, name: &str, help: &str) -> Counter {
    let c = Counter::with_opts(Opts::new(name, help)).expect("counter");
    registry
        .register(Box::new(c.clone()))
        .expect("register counter");
    c
}

fn gauge(registry: &Registry, name: &str, help: &str) -> Gauge {
    let g = Gauge::with_opts(Opts::new(name, help)).expect("gauge");
    registry
        .register(Box::new(g.clone()))
        .expect("register gauge");
    g
}

fn gauge_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> GaugeVec {
    let g = GaugeVec::new(Opts::new(name, help), labels).expect("gauge vec");
    registry
        .register(Box::new(g.clone()))
        .expect("register gauge");
    g
}

static GLOBAL_METRICS: OnceLock<MetricsRegistry> = OnceLock::new();

pub fn global_metrics() -> &'static MetricsRegistry {
    GLOBAL_METRICS.get_or_init(MetricsRegistry::new)
}

#[cfg(test)]
mod tests {
    use super::MetricsRegistry;

    #[test]
    fn renders_prometheus_text() {
        let m = MetricsRegistry::new();
        m.set_tasks_in_state("running", 3);
        m.inc_tasks_created();
        let text = m.render_prometheus();
        assert!(text.contains("flq_worker_tasks"));
        assert!(text.contains("running"));
    }

    #[test]
    fn renders_all_metric_families() {
        let m = MetricsRegistry::new();
        m.set_tasks_in_state("finished", 1);
        m.set_driver_counts(4, 2);
        m.set_pending_result_requests(1);
        m.inc_tasks_created();
        m.inc_error_tasks_created();
        m.inc_tasks_cleaned(2);
        m.inc_driver_yields_requested(3);
        m.inc_long_poll_timeouts();
        let text = m.render_prometheus();

        assert!(text.contains("flq_worker_tasks"));
        assert!(text.contains("flq_worker_running_drivers"));
        assert!(text.contains("flq_worker_blocked_drivers"));
        assert!(text.contains("flq_worker_pending_result_requests"));
        assert!(text.contains("flq_worker_tasks_created_total"));
        assert!(text.contains("flq_worker_error_tasks_created_total"));
        assert!(text.contains("flq_worker_tasks_cleaned_total"));
        assert!(text.contains("flq_worker_driver_yields_requested_total"));
        assert!(text.contains("flq_worker_long_poll_timeouts_total"));
    }
}
