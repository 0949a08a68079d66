use anyhow::Result;
use prometheus::{CounterVec, GaugeVec, Opts, Registry};
use std::collections::HashMap;
use tracing::warn;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MetricKind {
    Gauge,
    Counter,
    /// Undeclared column; exposed as a gauge.
    Untyped,
}

/// One sample produced from one row and one value column.
#[derive(Clone, Debug, PartialEq)]
pub struct MetricObservation {
    pub name: String,
    pub help: String,
    /// Label names and values, `server` first.
    pub labels: Vec<(String, String)>,
    pub value: f64,
    pub kind: MetricKind,
}

impl MetricObservation {
    #[must_use]
    pub fn label(&self, name: &str) -> Option<&str> {
        self.labels
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    fn label_names(&self) -> Vec<&str> {
        self.labels.iter().map(|(k, _)| k.as_str()).collect()
    }

    fn label_values(&self) -> Vec<&str> {
        self.labels.iter().map(|(_, v)| v.as_str()).collect()
    }
}

enum Family {
    Gauge(GaugeVec),
    Counter(CounterVec),
}

/// Build a fresh registry holding `observations`.
///
/// Samples whose family cannot be registered, or whose label set differs
/// from the first sample of the same name, are skipped with a warning.
#[must_use]
pub fn render(observations: &[MetricObservation]) -> Registry {
    let registry = Registry::new();
    let mut families: HashMap<&str, Option<(Family, usize)>> = HashMap::new();

    for obs in observations {
        let entry = families
            .entry(obs.name.as_str())
            .or_insert_with(|| match new_family(&registry, obs) {
                Ok(family) => Some((family, obs.labels.len())),
                Err(e) => {
                    warn!(metric = %obs.name, error = %e, "failed to register metric family");
                    None
                }
            });

        let Some((family, arity)) = entry else {
            continue;
        };
        if *arity != obs.labels.len() {
            warn!(metric = %obs.name, "inconsistent label set, sample skipped");
            continue;
        }

        let values = obs.label_values();
        match family {
            Family::Gauge(vec) => match vec.get_metric_with_label_values(values.as_slice()) {
                Ok(gauge) => gauge.set(obs.value),
                Err(e) => warn!(metric = %obs.name, error = %e, "sample skipped"),
            },
            Family::Counter(vec) => {
                if !obs.value.is_finite() || obs.value < 0.0 {
                    warn!(metric = %obs.name, value = obs.value, "counter sample must be non-negative");
                    continue;
                }
                match vec.get_metric_with_label_values(values.as_slice()) {
                    Ok(counter) => {
                        counter.reset();
                        counter.inc_by(obs.value);
                    }
                    Err(e) => warn!(metric = %obs.name, error = %e, "sample skipped"),
                }
            }
        }
    }

    registry
}

fn new_family(registry: &Registry, obs: &MetricObservation) -> Result<Family> {
    let opts = Opts::new(obs.name.clone(), help_text(obs));
    let names = obs.label_names();

    let family = match obs.kind {
        MetricKind::Counter => {
            let vec = CounterVec::new(opts, names.as_slice())?;
            registry.register(Box::new(vec.clone()))?;
            Family::Counter(vec)
        }
        MetricKind::Gauge | MetricKind::Untyped => {
            let vec = GaugeVec::new(opts, names.as_slice())?;
            registry.register(Box::new(vec.clone()))?;
            Family::Gauge(vec)
        }
    };

    Ok(family)
}

fn help_text(obs: &MetricObservation) -> String {
    if obs.help.is_empty() {
        obs.name.clone()
    } else {
        obs.help.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::{Encoder, TextEncoder};

    fn obs(name: &str, labels: &[(&str, &str)], value: f64, kind: MetricKind) -> MetricObservation {
        MetricObservation {
            name: name.to_string(),
            help: "help".to_string(),
            labels: labels
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
            value,
            kind,
        }
    }

    fn encode(registry: &Registry) -> String {
        let mut buf = Vec::new();
        let _ = TextEncoder::new().encode(&registry.gather(), &mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    }

    fn has_sample(text: &str, name: &str, label: &str, value: &str) -> bool {
        text.lines().any(|line| {
            line.starts_with(&format!("{name}{{"))
                && line.contains(label)
                && line.ends_with(&format!(" {value}"))
        })
    }

    #[test]
    fn test_label_lookup() {
        let o = obs("m", &[("server", "h:1"), ("datname", "db")], 1.0, MetricKind::Gauge);
        assert_eq!(o.label("datname"), Some("db"));
        assert_eq!(o.label("mode"), None);
    }

    #[test]
    fn test_render_gauges_and_counters() {
        let registry = render(&[
            obs("pg_lock_count", &[("server", "h:1"), ("mode", "a")], 4.0, MetricKind::Gauge),
            obs("pg_lock_count", &[("server", "h:1"), ("mode", "b")], 0.0, MetricKind::Gauge),
            obs("pg_db_commits", &[("server", "h:1")], 12.0, MetricKind::Counter),
        ]);

        let text = encode(&registry);
        assert!(text.contains("# TYPE pg_lock_count gauge"));
        assert!(has_sample(&text, "pg_lock_count", "mode=\"a\"", "4"));
        assert!(has_sample(&text, "pg_lock_count", "mode=\"b\"", "0"));
        assert!(text.contains("# TYPE pg_db_commits counter"));
        assert!(has_sample(&text, "pg_db_commits", "server=\"h:1\"", "12"));
    }

    #[test]
    fn test_render_skips_inconsistent_and_negative_samples() {
        let registry = render(&[
            obs("m", &[("server", "h:1")], 1.0, MetricKind::Counter),
            obs("m", &[("server", "h:1"), ("x", "y")], 2.0, MetricKind::Counter),
            obs("c", &[("server", "h:1")], -1.0, MetricKind::Counter),
            obs("bad name", &[("server", "h:1")], 1.0, MetricKind::Gauge),
        ]);

        let text = encode(&registry);
        assert!(has_sample(&text, "m", "server=\"h:1\"", "1"));
        assert!(!text.contains("x=\"y\""));
        assert!(!text.contains("c{server"));
        assert!(!text.contains("bad name"));
    }
}
