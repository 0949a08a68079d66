use anyhow::Result;
use prometheus::{CounterVec, GaugeVec, HistogramVec, IntGauge, Opts, Registry};
use std::time::Instant;

/// Per query group scrape performance, plus `pg_up`.
#[derive(Clone)]
pub struct ScraperCollector {
    query_duration_seconds: HistogramVec,
    query_errors_total: CounterVec,
    conversion_errors_total: CounterVec,
    last_scrape_timestamp: GaugeVec,
    last_scrape_success: GaugeVec,

    metrics_total: IntGauge,
    scrapes_total: IntGauge,
    up: IntGauge,
}

impl Default for ScraperCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl ScraperCollector {
    #[must_use]
    #[allow(clippy::expect_used)]
    ///
    /// # Panics
    ///
    /// Panics if metric creation fails.
    pub fn new() -> Self {
        let query_duration_seconds = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "pg_query_exporter_query_duration_seconds",
                "Time spent executing each query group in seconds",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
            &["query"],
        )
        .expect("pg_query_exporter_query_duration_seconds");

        let query_errors_total = CounterVec::new(
            Opts::new(
                "pg_query_exporter_query_errors_total",
                "Total number of failed executions per query group (timeouts and database errors)",
            ),
            &["query"],
        )
        .expect("pg_query_exporter_query_errors_total");

        let conversion_errors_total = CounterVec::new(
            Opts::new(
                "pg_query_exporter_conversion_errors_total",
                "Total number of values that could not be converted per query group",
            ),
            &["query"],
        )
        .expect("pg_query_exporter_conversion_errors_total");

        let last_scrape_timestamp = GaugeVec::new(
            Opts::new(
                "pg_query_exporter_query_last_scrape_timestamp_seconds",
                "Unix timestamp of the last execution attempt per query group",
            ),
            &["query"],
        )
        .expect("pg_query_exporter_query_last_scrape_timestamp_seconds");

        let last_scrape_success = GaugeVec::new(
            Opts::new(
                "pg_query_exporter_query_last_success",
                "Whether the last execution of the query group succeeded (1=success, 0=failure)",
            ),
            &["query"],
        )
        .expect("pg_query_exporter_query_last_success");

        let metrics_total = IntGauge::with_opts(Opts::new(
            "pg_query_exporter_metrics_total",
            "Number of samples produced by the last scrape (for cardinality monitoring)",
        ))
        .expect("pg_query_exporter_metrics_total");

        let scrapes_total = IntGauge::with_opts(Opts::new(
            "pg_query_exporter_scrapes_total",
            "Total number of scrapes performed since start",
        ))
        .expect("pg_query_exporter_scrapes_total");

        let up = IntGauge::with_opts(Opts::new(
            "pg_up",
            "Whether the last scrape could talk to the database (1=up, 0=down)",
        ))
        .expect("pg_up");

        Self {
            query_duration_seconds,
            query_errors_total,
            conversion_errors_total,
            last_scrape_timestamp,
            last_scrape_success,
            metrics_total,
            scrapes_total,
            up,
        }
    }

    #[must_use]
    pub fn start_scrape(&self, query: &str) -> ScrapeTimer {
        ScrapeTimer {
            query: query.to_string(),
            start: Instant::now(),
            scraper: self.clone(),
        }
    }

    pub fn update_metrics_count(&self, count: usize) {
        self.metrics_total.set(i64::try_from(count).unwrap_or(i64::MAX));
    }

    pub fn increment_scrapes(&self) {
        self.scrapes_total.inc();
    }

    #[must_use]
    pub fn is_up(&self) -> bool {
        self.up.get() == 1
    }

    pub fn set_up(&self, up: bool) {
        self.up.set(i64::from(up));
    }

    pub fn record_conversion_errors(&self, query: &str, count: usize) {
        if count == 0 {
            return;
        }
        #[allow(clippy::cast_precision_loss)]
        let count = count as f64;
        self.conversion_errors_total
            .with_label_values(&[query])
            .inc_by(count);
    }

    fn record_success(&self, query: &str, duration: f64) {
        self.query_duration_seconds
            .with_label_values(&[query])
            .observe(duration);

        self.last_scrape_timestamp
            .with_label_values(&[query])
            .set(unix_now());

        self.last_scrape_success.with_label_values(&[query]).set(1.0);
    }

    fn record_error(&self, query: &str, duration: f64) {
        self.query_duration_seconds
            .with_label_values(&[query])
            .observe(duration);

        self.query_errors_total.with_label_values(&[query]).inc();

        self.last_scrape_timestamp
            .with_label_values(&[query])
            .set(unix_now());

        self.last_scrape_success.with_label_values(&[query]).set(0.0);
    }

    ///
    /// # Errors
    ///
    /// Returns an error if metric registration fails.
    pub fn register(&self, registry: &Registry) -> Result<()> {
        registry.register(Box::new(self.query_duration_seconds.clone()))?;
        registry.register(Box::new(self.query_errors_total.clone()))?;
        registry.register(Box::new(self.conversion_errors_total.clone()))?;
        registry.register(Box::new(self.last_scrape_timestamp.clone()))?;
        registry.register(Box::new(self.last_scrape_success.clone()))?;
        registry.register(Box::new(self.metrics_total.clone()))?;
        registry.register(Box::new(self.scrapes_total.clone()))?;
        registry.register(Box::new(self.up.clone()))?;
        Ok(())
    }
}

fn unix_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Times one query group execution. A timer dropped before `success` or
/// `error` (the scrape was cancelled) records nothing.
pub struct ScrapeTimer {
    query: String,
    start: Instant,
    scraper: ScraperCollector,
}

impl ScrapeTimer {
    pub fn success(self) {
        let duration = self.start.elapsed().as_secs_f64();
        self.scraper.record_success(&self.query, duration);
    }

    pub fn error(self) {
        let duration = self.start.elapsed().as_secs_f64();
        self.scraper.record_error(&self.query, duration);
    }
}
