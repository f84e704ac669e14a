use prometheus::{Counter, CounterVec, Histogram, HistogramOpts, Opts, Registry};
use std::sync::Arc;

/// Metrics collector for the admission layer
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,

    // Decision metrics
    requests: CounterVec,
    rejections: CounterVec,
    store_failures: Counter,
    decision_duration: Histogram,

    // Store maintenance
    sweeps: Counter,
    swept_entries: Counter,
}

impl Metrics {
    /// Create a new metrics instance
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let requests = CounterVec::new(
            Opts::new(
                "admission_requests_total",
                "Requests seen by the admission layer, by outcome",
            ),
            &["outcome"],
        )?;

        let rejections = CounterVec::new(
            Opts::new(
                "admission_rejections_total",
                "Rejected requests by violated limit type",
            ),
            &["limit_type"],
        )?;

        let store_failures = Counter::new(
            "admission_store_failures_total",
            "Counter store errors that let a request through unchecked",
        )?;

        let decision_duration = Histogram::with_opts(HistogramOpts::new(
            "admission_decision_duration_seconds",
            "Time spent deciding whether to admit a request",
        ))?;

        let sweeps = Counter::new("admission_sweeps_total", "Counter store sweeps performed")?;

        let swept_entries = Counter::new(
            "admission_swept_entries_total",
            "Expired counter entries removed by sweeps",
        )?;

        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(rejections.clone()))?;
        registry.register(Box::new(store_failures.clone()))?;
        registry.register(Box::new(decision_duration.clone()))?;
        registry.register(Box::new(sweeps.clone()))?;
        registry.register(Box::new(swept_entries.clone()))?;

        Ok(Self {
            registry,
            requests,
            rejections,
            store_failures,
            decision_duration,
            sweeps,
            swept_entries,
        })
    }

    /// Get the Prometheus registry for this metrics instance
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_admitted(&self) {
        self.requests.with_label_values(&["admitted"]).inc();
    }

    pub fn record_rejected(&self, limit_type: &str) {
        self.requests.with_label_values(&["rejected"]).inc();
        self.rejections.with_label_values(&[limit_type]).inc();
    }

    pub fn record_store_failure(&self) {
        self.requests.with_label_values(&["unchecked"]).inc();
        self.store_failures.inc();
    }

    pub fn record_sweep(&self, removed: usize) {
        self.sweeps.inc();
        self.swept_entries.inc_by(removed as f64);
    }

    /// Create a timer for measuring decision duration
    pub fn start_decision_timer(&self) -> prometheus::HistogramTimer {
        self.decision_duration.start_timer()
    }

    pub fn admitted(&self) -> u64 {
        self.requests.with_label_values(&["admitted"]).get() as u64
    }

    pub fn rejected(&self, limit_type: &str) -> u64 {
        self.rejections.with_label_values(&[limit_type]).get() as u64
    }

    pub fn sweeps(&self) -> u64 {
        self.sweeps.get() as u64
    }

    pub fn swept_entries(&self) -> u64 {
        self.swept_entries.get() as u64
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new().expect("Failed to create default metrics")
    }
}
