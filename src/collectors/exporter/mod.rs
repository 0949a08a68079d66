mod process;
mod scraper;

pub use process::ProcessCollector;
pub use scraper::{ScrapeTimer, ScraperCollector};

use anyhow::Result;
use prometheus::Registry;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Exporter self-monitoring: process resources and per query group scrape
/// statistics.
#[derive(Clone)]
pub struct ExporterCollector {
    process: ProcessCollector,
    scraper: Arc<ScraperCollector>,
}

impl Default for ExporterCollector {
    fn default() -> Self {
        Self::new(Arc::new(ScraperCollector::new()))
    }
}

impl ExporterCollector {
    #[must_use]
    pub fn new(scraper: Arc<ScraperCollector>) -> Self {
        Self {
            process: ProcessCollector::new(),
            scraper,
        }
    }

    #[must_use]
    pub const fn scraper(&self) -> &Arc<ScraperCollector> {
        &self.scraper
    }

    /// # Errors
    ///
    /// Returns an error if any self-monitoring metric fails to register.
    #[instrument(skip(self, registry), level = "info", err, fields(collector = "exporter"))]
    pub fn register_metrics(&self, registry: &Registry) -> Result<()> {
        if let Err(e) = self.process.register(registry) {
            warn!(collector = "process", error = %e, "failed to register exporter metrics");
            return Err(e);
        }
        debug!(collector = "process", "registered exporter metrics");

        if let Err(e) = self.scraper.register(registry) {
            warn!(collector = "scraper", error = %e, "failed to register exporter metrics");
            return Err(e);
        }
        debug!(collector = "scraper", "registered exporter metrics");

        Ok(())
    }

    /// Refresh the sampled gauges before the registry is gathered.
    pub fn collect(&self) {
        self.process.collect_stats();
    }
}
