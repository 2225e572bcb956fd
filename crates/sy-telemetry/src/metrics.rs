use ahash::AHashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::RwLock;

// ---------------------------------------------------------------------------
// Well-known metric names
// ---------------------------------------------------------------------------

/// Counter: envelopes accepted onto a queue. Labels: `queue`.
pub const ENVELOPES_ENQUEUED: &str = "envelopes_enqueued_total";
/// Counter: envelopes acknowledged after processing. Labels: `queue`, `outcome`.
pub const ENVELOPES_ACKED: &str = "envelopes_acked_total";
/// Counter: envelopes moved to a dead-letter queue. Labels: `queue`.
pub const ENVELOPES_DEAD_LETTERED: &str = "envelopes_dead_lettered_total";
/// Counter: redeliveries after retryable failures. Labels: `queue`.
pub const WORKER_RETRIES: &str = "worker_retries_total";
/// Counter: review requests raised. Labels: `urgency`.
pub const ESCALATIONS_RAISED: &str = "escalations_raised_total";
/// Counter: reviewer verdicts applied. Labels: `decision`.
pub const DECISIONS_SUBMITTED: &str = "decisions_submitted_total";
/// Histogram: HTTP request latency in seconds.
pub const HTTP_REQUEST_DURATION: &str = "http_request_duration_seconds";

// ---------------------------------------------------------------------------
// Histogram
// ---------------------------------------------------------------------------

/// A histogram tracking the distribution of observed values across buckets.
#[derive(Debug)]
pub struct Histogram {
    pub buckets: Vec<f64>,
    pub counts: Vec<AtomicU64>,
    pub sum: AtomicU64,
    pub count: AtomicU64,
}

impl Histogram {
    pub fn new(buckets: Vec<f64>) -> Self {
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Record a value into the histogram.
    pub fn observe(&self, value: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        // The sum is stored as f64 bits so it can be updated atomically.
        loop {
            let current = self.sum.load(Ordering::Relaxed);
            let next = (f64::from_bits(current) + value).to_bits();
            if self
                .sum
                .compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
        for (i, boundary) in self.buckets.iter().enumerate() {
            if value <= *boundary {
                self.counts[i].fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn get_sum(&self) -> f64 {
        f64::from_bits(self.sum.load(Ordering::Relaxed))
    }

    pub fn get_count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

fn default_duration_buckets() -> Vec<f64> {
    vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
}

// ---------------------------------------------------------------------------
// Labels
// ---------------------------------------------------------------------------

/// A sorted list of key=value pairs distinguishing counter families.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Labels(Vec<(String, String)>);

impl Labels {
    pub fn new(pairs: &[(&str, &str)]) -> Self {
        let mut v: Vec<(String, String)> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        v.sort_by(|a, b| a.0.cmp(&b.0));
        Self(v)
    }

    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// Format as `{key="value",key2="value2"}` for Prometheus output.
    pub fn prometheus_str(&self) -> String {
        if self.0.is_empty() {
            return String::new();
        }
        let inner: Vec<String> = self
            .0
            .iter()
            .map(|(k, v)| format!("{}=\"{}\"", k, v))
            .collect();
        format!("{{{}}}", inner.join(","))
    }
}

// ---------------------------------------------------------------------------
// MetricsCollector
// ---------------------------------------------------------------------------

/// Central metrics collector supporting counters, gauges, and histograms.
/// Thread-safe: `RwLock` for registration, atomics for the hot path.
#[derive(Debug)]
pub struct MetricsCollector {
    counters: RwLock<AHashMap<(String, Labels), AtomicU64>>,
    gauges: RwLock<AHashMap<String, AtomicI64>>,
    histograms: RwLock<AHashMap<String, Histogram>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            counters: RwLock::new(AHashMap::new()),
            gauges: RwLock::new(AHashMap::new()),
            histograms: RwLock::new(AHashMap::new()),
        }
    }

    /// A collector pre-loaded with the engine's latency histogram.
    pub fn with_defaults() -> Self {
        let collector = Self::new();
        {
            let mut h = collector.histograms.write().unwrap();
            h.insert(
                HTTP_REQUEST_DURATION.to_string(),
                Histogram::new(default_duration_buckets()),
            );
        }
        collector
    }

    // -- Counters -----------------------------------------------------------

    pub fn increment_counter(&self, name: &str, labels: &[(&str, &str)]) {
        self.increment_counter_by(name, labels, 1);
    }

    pub fn increment_counter_by(&self, name: &str, labels: &[(&str, &str)], amount: u64) {
        let key = (name.to_string(), Labels::new(labels));
        {
            let map = self.counters.read().unwrap();
            if let Some(c) = map.get(&key) {
                c.fetch_add(amount, Ordering::Relaxed);
                return;
            }
        }
        let mut map = self.counters.write().unwrap();
        let c = map.entry(key).or_insert_with(|| AtomicU64::new(0));
        c.fetch_add(amount, Ordering::Relaxed);
    }

    pub fn get_counter(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = (name.to_string(), Labels::new(labels));
        let map = self.counters.read().unwrap();
        map.get(&key).map(|c| c.load(Ordering::Relaxed)).unwrap_or(0)
    }

    // -- Gauges -------------------------------------------------------------

    pub fn set_gauge(&self, name: &str, value: i64) {
        {
            let map = self.gauges.read().unwrap();
            if let Some(g) = map.get(name) {
                g.store(value, Ordering::Relaxed);
                return;
            }
        }
        let mut map = self.gauges.write().unwrap();
        let g = map.entry(name.to_string()).or_insert_with(|| AtomicI64::new(0));
        g.store(value, Ordering::Relaxed);
    }

    pub fn get_gauge(&self, name: &str) -> i64 {
        let map = self.gauges.read().unwrap();
        map.get(name).map(|g| g.load(Ordering::Relaxed)).unwrap_or(0)
    }

    // -- Histograms ---------------------------------------------------------

    /// Record a value; an unknown histogram is created with the default
    /// duration buckets.
    pub fn record_histogram(&self, name: &str, value: f64) {
        {
            let map = self.histograms.read().unwrap();
            if let Some(h) = map.get(name) {
                h.observe(value);
                return;
            }
        }
        let mut map = self.histograms.write().unwrap();
        let h = map
            .entry(name.to_string())
            .or_insert_with(|| Histogram::new(default_duration_buckets()));
        h.observe(value);
    }

    // -- Export --------------------------------------------------------------

    /// All metrics in Prometheus text exposition format.
    pub fn export_prometheus(&self) -> String {
        let mut out = String::new();

        {
            let map = self.counters.read().unwrap();
            let mut grouped: AHashMap<&str, Vec<(&Labels, u64)>> = AHashMap::new();
            for ((name, labels), val) in map.iter() {
                grouped
                    .entry(name.as_str())
                    .or_default()
                    .push((labels, val.load(Ordering::Relaxed)));
            }
            let mut names: Vec<&&str> = grouped.keys().collect();
            names.sort();
            for name in names {
                out.push_str(&format!("# TYPE {} counter\n", name));
                for (labels, value) in &grouped[name] {
                    out.push_str(&format!("{}{} {}\n", name, labels.prometheus_str(), value));
                }
            }
        }

        {
            let map = self.gauges.read().unwrap();
            let mut names: Vec<&String> = map.keys().collect();
            names.sort();
            for name in names {
                let val = map[name].load(Ordering::Relaxed);
                out.push_str(&format!("# TYPE {} gauge\n{} {}\n", name, name, val));
            }
        }

        {
            let map = self.histograms.read().unwrap();
            let mut names: Vec<&String> = map.keys().collect();
            names.sort();
            for name in names {
                let h = &map[name];
                out.push_str(&format!("# TYPE {} histogram\n", name));
                let mut cumulative = 0u64;
                for (i, boundary) in h.buckets.iter().enumerate() {
                    cumulative += h.counts[i].load(Ordering::Relaxed);
                    out.push_str(&format!(
                        "{}_bucket{{le=\"{}\"}} {}\n",
                        name, boundary, cumulative
                    ));
                }
                out.push_str(&format!("{}_bucket{{le=\"+Inf\"}} {}\n", name, h.get_count()));
                out.push_str(&format!("{}_sum {}\n", name, h.get_sum()));
                out.push_str(&format!("{}_count {}\n", name, h.get_count()));
            }
        }

        out
    }

    /// All metrics as a JSON value.
    pub fn export_json(&self) -> serde_json::Value {
        let mut counters_json = serde_json::Map::new();
        {
            let map = self.counters.read().unwrap();
            for ((name, labels), val) in map.iter() {
                let key = if labels.0.is_empty() {
                    name.clone()
                } else {
                    format!("{}{}", name, labels.prometheus_str())
                };
                counters_json.insert(key, serde_json::json!(val.load(Ordering::Relaxed)));
            }
        }

        let mut gauges_json = serde_json::Map::new();
        {
            let map = self.gauges.read().unwrap();
            for (name, val) in map.iter() {
                gauges_json.insert(name.clone(), serde_json::json!(val.load(Ordering::Relaxed)));
            }
        }

        let mut histograms_json = serde_json::Map::new();
        {
            let map = self.histograms.read().unwrap();
            for (name, h) in map.iter() {
                histograms_json.insert(
                    name.clone(),
                    serde_json::json!({
                        "sum": h.get_sum(),
                        "count": h.get_count(),
                    }),
                );
            }
        }

        serde_json::json!({
            "counters": counters_json,
            "gauges": gauges_json,
            "histograms": histograms_json,
        })
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::with_defaults()
    }
}

// ---------------------------------------------------------------------------
// Global singleton
// ---------------------------------------------------------------------------

/// The process-wide `MetricsCollector`, created on first use.
pub fn global_metrics() -> &'static MetricsCollector {
    use std::sync::OnceLock;
    static INSTANCE: OnceLock<MetricsCollector> = OnceLock::new();
    INSTANCE.get_or_init(MetricsCollector::with_defaults)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_families_are_label_scoped() {
        let m = MetricsCollector::new();
        m.increment_counter(ENVELOPES_ACKED, &[("queue", "order.auto"), ("outcome", "completed")]);
        m.increment_counter(ENVELOPES_ACKED, &[("queue", "order.auto"), ("outcome", "completed")]);
        m.increment_counter(ENVELOPES_ACKED, &[("queue", "order.auto"), ("outcome", "failed")]);

        assert_eq!(
            m.get_counter(ENVELOPES_ACKED, &[("queue", "order.auto"), ("outcome", "completed")]),
            2
        );
        assert_eq!(
            m.get_counter(ENVELOPES_ACKED, &[("queue", "order.auto"), ("outcome", "failed")]),
            1
        );
        assert_eq!(m.get_counter(ENVELOPES_ACKED, &[("queue", "content.auto")]), 0);
    }

    #[test]
    fn label_order_does_not_matter() {
        let m = MetricsCollector::new();
        m.increment_counter("x_total", &[("a", "1"), ("b", "2")]);
        assert_eq!(m.get_counter("x_total", &[("b", "2"), ("a", "1")]), 1);
    }

    #[test]
    fn gauge_set_overwrites() {
        let m = MetricsCollector::new();
        m.set_gauge("queue_depth", 5);
        m.set_gauge("queue_depth", 3);
        assert_eq!(m.get_gauge("queue_depth"), 3);
    }

    #[test]
    fn histogram_records_sum_and_count() {
        let m = MetricsCollector::with_defaults();
        m.record_histogram(HTTP_REQUEST_DURATION, 0.05);
        m.record_histogram(HTTP_REQUEST_DURATION, 0.5);
        m.record_histogram(HTTP_REQUEST_DURATION, 2.0);

        let map = m.histograms.read().unwrap();
        let h = map.get(HTTP_REQUEST_DURATION).unwrap();
        assert_eq!(h.get_count(), 3);
        assert!((h.get_sum() - 2.55).abs() < 0.001);
    }

    #[test]
    fn prometheus_export_contains_all_families() {
        let m = MetricsCollector::new();
        m.increment_counter(ENVELOPES_DEAD_LETTERED, &[("queue", "order.auto")]);
        m.set_gauge("workers_running", 2);
        m.record_histogram(HTTP_REQUEST_DURATION, 0.1);

        let output = m.export_prometheus();
        assert!(output.contains("# TYPE envelopes_dead_lettered_total counter"));
        assert!(output.contains("envelopes_dead_lettered_total{queue=\"order.auto\"} 1"));
        assert!(output.contains("# TYPE workers_running gauge"));
        assert!(output.contains("workers_running 2"));
        assert!(output.contains("http_request_duration_seconds_count 1"));
    }

    #[test]
    fn json_export_shape() {
        let m = MetricsCollector::new();
        m.increment_counter(DECISIONS_SUBMITTED, &[("decision", "approve")]);
        m.set_gauge("workers_running", 4);

        let json = m.export_json();
        assert_eq!(json["gauges"]["workers_running"], 4);
        assert!(json["counters"].is_object());
    }

    #[test]
    fn global_metrics_is_a_singleton() {
        assert!(std::ptr::eq(global_metrics(), global_metrics()));
    }
}
