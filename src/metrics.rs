//! Metrics exporter.
//!
//! The metrics exporter is an external collaborator elsewhere in this
//! design; this module is the concrete implementation, built on
//! `prometheus = "0.14"` and grounded on the family shape of
//! `original_source/src/metric-proxy.cpp` (`reportJobSuccess`,
//! `reportHttpJobError`, `reportJobTimeout`, `reportJobError`).

use prometheus::{HistogramVec, IntCounterVec, Opts, Registry};

/// Counters and a duration histogram, all labeled by pool and/or function
/// the way `metric-proxy.cpp`'s families are.
pub struct Metrics {
    registry: Registry,
    job_duration: HistogramVec,
    http_errors: IntCounterVec,
    timeouts: IntCounterVec,
    errors: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let job_duration = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "job_duration_seconds",
                "time spent dispatching one job over HTTP",
            ),
            &["pool", "function"],
        )
        .expect("valid histogram opts");

        let http_errors = IntCounterVec::new(
            Opts::new("http_error", "non-200 HTTP responses from a processing URI"),
            &["pool", "function", "status"],
        )
        .expect("valid counter opts");

        let timeouts = IntCounterVec::new(
            Opts::new("timeout", "jobs aborted for exceeding max_job_running_time"),
            &["pool", "function"],
        )
        .expect("valid counter opts");

        let errors = IntCounterVec::new(
            Opts::new("error", "jobs that failed dispatch for any other reason"),
            &["pool", "function"],
        )
        .expect("valid counter opts");

        registry
            .register(Box::new(job_duration.clone()))
            .expect("register job_duration");
        registry
            .register(Box::new(http_errors.clone()))
            .expect("register http_errors");
        registry
            .register(Box::new(timeouts.clone()))
            .expect("register timeouts");
        registry
            .register(Box::new(errors.clone()))
            .expect("register errors");

        Self {
            registry,
            job_duration,
            http_errors,
            timeouts,
            errors,
        }
    }

    pub fn job_success(&self, pool: &str, function: &str, duration_secs: f64) {
        self.job_duration
            .with_label_values(&[pool, function])
            .observe(duration_secs);
    }

    pub fn http_error(&self, pool: &str, function: &str, status: u16) {
        self.http_errors
            .with_label_values(&[pool, function, &status.to_string()])
            .inc();
    }

    pub fn timeout(&self, pool: &str, function: &str) {
        self.timeouts.with_label_values(&[pool, function]).inc();
    }

    pub fn error(&self, pool: &str, function: &str) {
        self.errors.with_label_values(&[pool, function]).inc();
    }

    /// Flatten every counter family into `(name{labels}, value)` pairs for
    /// the status server's `counters` command. Histograms
    /// are counters too as far as Prometheus's text model is concerned
    /// (`_count`/`_sum` per bucket), so they show up here naturally via
    /// `gather()`.
    pub fn counters_snapshot(&self) -> Vec<(String, f64)> {
        let mut out = Vec::new();
        for family in self.registry.gather() {
            for metric in family.get_metric() {
                let labels: String = metric
                    .get_label()
                    .iter()
                    .map(|l| format!("{}={}", l.name(), l.value()))
                    .collect::<Vec<_>>()
                    .join(",");
                let name = if labels.is_empty() {
                    family.name().to_string()
                } else {
                    format!("{}{{{}}}", family.name(), labels)
                };

                if metric.has_counter() {
                    out.push((name, metric.get_counter().value()));
                } else if metric.has_histogram() {
                    let h = metric.get_histogram();
                    out.push((format!("{name}_count"), h.get_sample_count() as f64));
                    out.push((format!("{name}_sum"), h.get_sample_sum()));
                }
            }
        }
        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_success_is_observable_in_snapshot() {
        let m = Metrics::new();
        m.job_success("p1", "Sum", 0.25);
        let snap = m.counters_snapshot();
        assert!(snap.iter().any(|(name, _)| name.contains("job_duration_seconds_count")));
    }

    #[test]
    fn http_error_increments_labeled_counter() {
        let m = Metrics::new();
        m.http_error("p1", "Sum", 502);
        let snap = m.counters_snapshot();
        assert!(snap
            .iter()
            .any(|(name, v)| name.contains("status=502") && *v == 1.0));
    }
}
