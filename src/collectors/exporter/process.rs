use anyhow::Result;
use prometheus::{Gauge, IntGauge, Opts, Registry, core::Collector};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use sysinfo::{Pid, Process, ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::debug;

const PREFIX: &str = "pg_query_exporter_process";

/// Resource usage of the exporter process itself
#[derive(Clone)]
pub struct ProcessCollector {
    cpu_percent: Gauge,
    cpu_cores: IntGauge,
    resident_memory_bytes: IntGauge,
    virtual_memory_bytes: IntGauge,
    open_fds: IntGauge,
    start_time_seconds: Gauge,
    sampler: Arc<Mutex<Sampler>>,
}

struct Sampler {
    system: System,
    pid: Pid,
    last_cpu_sample: Option<Instant>,
}

impl Sampler {
    /// Refresh our own process. CPU usage needs two samples at least
    /// `MINIMUM_CPU_UPDATE_INTERVAL` apart, so faster calls only read memory.
    fn refresh(&mut self, now: Instant) -> (Option<&Process>, bool) {
        let cpu_due = self
            .last_cpu_sample
            .is_none_or(|last| now.duration_since(last) >= sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);

        let kind = if cpu_due {
            self.last_cpu_sample = Some(now);
            ProcessRefreshKind::everything()
        } else {
            ProcessRefreshKind::nothing().with_memory()
        };
        self.system
            .refresh_processes_specifics(ProcessesToUpdate::Some(&[self.pid]), true, kind);

        (self.system.process(self.pid), cpu_due)
    }
}

impl Default for ProcessCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[allow(clippy::expect_used)]
fn int_gauge(name: &str, help: &str) -> IntGauge {
    IntGauge::with_opts(Opts::new(format!("{PREFIX}_{name}"), help)).expect("valid process gauge")
}

#[allow(clippy::expect_used)]
fn float_gauge(name: &str, help: &str) -> Gauge {
    Gauge::with_opts(Opts::new(format!("{PREFIX}_{name}"), help)).expect("valid process gauge")
}

fn saturating_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

impl ProcessCollector {
    #[must_use]
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_all();

        Self {
            cpu_percent: float_gauge(
                "cpu_percent",
                "Current CPU usage percentage (matches ps %cpu, can exceed 100%)",
            ),
            cpu_cores: int_gauge("cpu_cores", "Number of CPU cores available on the system"),
            resident_memory_bytes: int_gauge(
                "resident_memory_bytes",
                "Resident memory size in bytes (RSS)",
            ),
            virtual_memory_bytes: int_gauge(
                "virtual_memory_bytes",
                "Virtual memory size in bytes (VSZ)",
            ),
            open_fds: int_gauge("open_fds", "Number of open file descriptors"),
            start_time_seconds: float_gauge(
                "start_time_seconds",
                "Start time of the process since unix epoch in seconds",
            ),
            sampler: Arc::new(Mutex::new(Sampler {
                system,
                pid: Pid::from_u32(std::process::id()),
                last_cpu_sample: None,
            })),
        }
    }

    fn gauges(&self) -> [Box<dyn Collector>; 6] {
        [
            Box::new(self.cpu_percent.clone()),
            Box::new(self.cpu_cores.clone()),
            Box::new(self.resident_memory_bytes.clone()),
            Box::new(self.virtual_memory_bytes.clone()),
            Box::new(self.open_fds.clone()),
            Box::new(self.start_time_seconds.clone()),
        ]
    }

    ///
    /// # Errors
    ///
    /// Returns an error if metric registration fails.
    pub fn register(&self, registry: &Registry) -> Result<()> {
        for gauge in self.gauges() {
            registry.register(gauge)?;
        }
        Ok(())
    }

    /// Refresh the process gauges.
    pub fn collect_stats(&self) {
        let mut sampler = self.sampler.lock().unwrap_or_else(PoisonError::into_inner);
        let cores = sampler.system.cpus().len().max(1);
        self.cpu_cores.set(i64::try_from(cores).unwrap_or(1));

        let (Some(process), cpu_due) = sampler.refresh(Instant::now()) else {
            debug!("own process not found");
            return;
        };

        let rss = process.memory();
        let vsz = process.virtual_memory();
        self.resident_memory_bytes.set(saturating_i64(rss));
        self.virtual_memory_bytes.set(saturating_i64(vsz));
        #[allow(clippy::cast_precision_loss)]
        self.start_time_seconds.set(process.start_time() as f64);

        if cpu_due {
            self.cpu_percent.set(f64::from(process.cpu_usage()));
        }

        #[cfg(target_os = "linux")]
        if let Ok(entries) = std::fs::read_dir("/proc/self/fd") {
            self.open_fds.set(i64::try_from(entries.count()).unwrap_or(0));
        }

        debug!(
            cpu_percent = self.cpu_percent.get(),
            rss_mb = rss / 1024 / 1024,
            fds = self.open_fds.get(),
            "collected process metrics"
        );
    }
}
