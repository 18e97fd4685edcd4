//! C9: Prometheus metrics for the matching engine.
//!
//! A single process-wide registry, mirroring the lazy-static singleton the
//! teacher crate uses for its own request counters.

use prometheus::{Encoder, GaugeVec, HistogramVec, IntCounterVec, Registry, TextEncoder};

lazy_static::lazy_static! {
    pub static ref METRICS: Metrics = Metrics::new();
}

pub struct Metrics {
    registry: Registry,
    pub requests_total: IntCounterVec,
    pub rule_matches_total: IntCounterVec,
    pub rules_disabled: GaugeVec,
    pub watch_callbacks_total: IntCounterVec,
    pub rule_errors_total: IntCounterVec,
    pub match_duration_seconds: HistogramVec,
}

impl Metrics {
    fn new() -> Self {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            prometheus::Opts::new(
                "waypoint_requests_total",
                "Requests resolved to an upstream (or to no match), partitioned by router and outcome",
            ),
            &["router", "outcome"],
        )
        .expect("valid metric");

        let rule_matches_total = IntCounterVec::new(
            prometheus::Opts::new(
                "waypoint_rule_matches_total",
                "Requests resolved by a rule (as opposed to an override or the default upstream)",
            ),
            &["router"],
        )
        .expect("valid metric");

        let rules_disabled = GaugeVec::new(
            prometheus::Opts::new(
                "waypoint_rules_disabled",
                "Rules currently auto-disabled for a router",
            ),
            &["router"],
        )
        .expect("valid metric");

        let watch_callbacks_total = IntCounterVec::new(
            prometheus::Opts::new(
                "waypoint_watch_callbacks_total",
                "Dynamic backend change notifications delivered, partitioned by router and backend",
            ),
            &["router", "backend"],
        )
        .expect("valid metric");

        let rule_errors_total = IntCounterVec::new(
            prometheus::Opts::new(
                "waypoint_rule_errors_total",
                "Rule evaluation failures, partitioned by router",
            ),
            &["router"],
        )
        .expect("valid metric");

        let match_duration_seconds = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "waypoint_match_duration_seconds",
                "Time spent resolving an upstream for a request",
            ),
            &["router"],
        )
        .expect("valid metric");

        registry.register(Box::new(requests_total.clone())).expect("register");
        registry.register(Box::new(rule_matches_total.clone())).expect("register");
        registry.register(Box::new(rules_disabled.clone())).expect("register");
        registry.register(Box::new(watch_callbacks_total.clone())).expect("register");
        registry.register(Box::new(rule_errors_total.clone())).expect("register");
        registry.register(Box::new(match_duration_seconds.clone())).expect("register");

        Metrics {
            registry,
            requests_total,
            rule_matches_total,
            rules_disabled,
            watch_callbacks_total,
            rule_errors_total,
            match_duration_seconds,
        }
    }

    /// `outcome` is one of `override`, `rule`, `default`, or `none`.
    pub fn record_match(&self, router: &str, outcome: &str) {
        self.requests_total.with_label_values(&[router, outcome]).inc();
        if outcome == "rule" {
            self.rule_matches_total.with_label_values(&[router]).inc();
        }
    }

    pub fn set_rules_disabled(&self, router: &str, count: usize) {
        self.rules_disabled.with_label_values(&[router]).set(count as f64);
    }

    pub fn record_watch_callback(&self, router: &str, backend: &str) {
        self.watch_callbacks_total.with_label_values(&[router, backend]).inc();
    }

    pub fn record_rule_error(&self, router: &str) {
        self.rule_errors_total.with_label_values(&[router]).inc();
    }

    /// Render the registry in Prometheus text exposition format.
    pub fn collect(&self) -> String {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buf = Vec::new();
        encoder.encode(&families, &mut buf).expect("encode metrics");
        String::from_utf8(buf).expect("prometheus text output is utf8")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_and_renders_a_match() {
        let m = Metrics::new();
        m.record_match("api", "rule");
        let text = m.collect();
        assert!(text.contains("waypoint_requests_total"));
        assert!(text.contains("waypoint_rule_matches_total"));
    }

    #[test]
    fn non_rule_outcomes_do_not_count_as_rule_matches() {
        let m = Metrics::new();
        m.record_match("api", "default");
        let text = m.collect();
        assert!(text.contains("waypoint_rule_matches_total"));
        assert!(!text.contains("waypoint_rule_matches_total{router=\"api\"} 1"));
    }

    #[test]
    fn records_rule_errors_separately() {
        let m = Metrics::new();
        m.record_rule_error("api");
        let text = m.collect();
        assert!(text.contains("waypoint_rule_errors_total"));
    }

    #[test]
    fn tracks_disabled_rule_gauge_and_watch_callbacks() {
        let m = Metrics::new();
        m.set_rules_disabled("api", 2);
        m.record_watch_callback("api", "redis");
        let text = m.collect();
        assert!(text.contains("waypoint_rules_disabled"));
        assert!(text.contains("waypoint_watch_callbacks_total"));
    }
}
