//! Query groups: the SQL variants to run and the shape of the metrics they
//! produce, plus the hot-swappable map of all configured groups.

use super::util::normalize_version;
use anyhow::{Context, Result, anyhow, bail};
use arc_swap::ArcSwap;
use once_cell::sync::OnceCell;
use regex::Regex;
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Label every metric carries; columns may not reuse it.
pub const SERVER_LABEL: &str = "server";

/// What a result column turns into.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum ColumnUsage {
    Label,
    Gauge,
    Counter,
    Discard,
}

/// Column descriptor of a query group.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Column {
    pub name: String,
    pub usage: ColumnUsage,
    #[serde(default)]
    pub desc: String,
    /// Metric (or label) name to expose instead of the column name.
    #[serde(default)]
    pub rename: Option<String>,
}

impl Column {
    #[must_use]
    pub fn new(name: &str, usage: ColumnUsage, desc: &str) -> Self {
        Self {
            name: name.to_string(),
            usage,
            desc: desc.to_string(),
            rename: None,
        }
    }

    #[must_use]
    pub fn with_rename(mut self, rename: &str) -> Self {
        self.rename = Some(rename.to_string());
        self
    }

    /// Name exposed for this column (label name or metric suffix).
    #[must_use]
    pub fn output_name(&self) -> &str {
        self.rename.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum QueryStatus {
    #[default]
    Enable,
    Disable,
}

/// Server role a variant is restricted to.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DbRole {
    Primary,
    Standby,
}

/// One SQL variant of a query group.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct Query {
    pub sql: String,
    /// Lowest server version (inclusive) this variant runs on.
    #[serde(default)]
    pub min_version: Option<String>,
    /// First server version (exclusive) this variant no longer runs on.
    #[serde(default)]
    pub max_version: Option<String>,
    /// Seconds; `<= 0` runs unbounded, absent falls back to the engine default.
    #[serde(default)]
    pub timeout: Option<f64>,
    #[serde(default)]
    pub db_role: Option<DbRole>,
    #[serde(default)]
    pub status: QueryStatus,
}

impl Query {
    #[must_use]
    pub fn new(sql: &str) -> Self {
        Self {
            sql: sql.to_string(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_min_version(mut self, version: &str) -> Self {
        self.min_version = Some(version.to_string());
        self
    }

    #[must_use]
    pub fn with_max_version(mut self, version: &str) -> Self {
        self.max_version = Some(version.to_string());
        self
    }

    #[must_use]
    pub const fn with_timeout(mut self, seconds: f64) -> Self {
        self.timeout = Some(seconds);
        self
    }

    #[must_use]
    pub const fn with_db_role(mut self, role: DbRole) -> Self {
        self.db_role = Some(role);
        self
    }

    /// Whether this variant may run against a server of `version` and role.
    #[must_use]
    pub fn supports(&self, version: i64, primary: bool) -> bool {
        if self.status == QueryStatus::Disable {
            return false;
        }

        let role_ok = match self.db_role {
            Some(DbRole::Primary) => primary,
            Some(DbRole::Standby) => !primary,
            None => true,
        };

        let min_ok = self
            .min_version
            .as_deref()
            .is_none_or(|v| normalize_version(v).is_some_and(|(_, min)| version >= min));

        let max_ok = self
            .max_version
            .as_deref()
            .is_none_or(|v| normalize_version(v).is_some_and(|(_, max)| version < max));

        role_ok && min_ok && max_ok
    }

    /// Execution bound for this variant; `None` means unbounded.
    #[must_use]
    pub fn timeout(&self, default: Duration) -> Option<Duration> {
        match self.timeout {
            Some(secs) if secs > 0.0 => Duration::try_from_secs_f64(secs).ok(),
            Some(_) => None,
            None if default.is_zero() => None,
            None => Some(default),
        }
    }
}

/// A named query group.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct QueryInstance {
    /// Group name, also the metric name prefix.
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub desc: String,
    #[serde(default)]
    pub queries: Vec<Query>,
    #[serde(default)]
    pub metrics: Vec<Column>,
    /// Cache TTL override in seconds.
    #[serde(default)]
    pub ttl: Option<f64>,
}

impl QueryInstance {
    #[must_use]
    pub fn new(name: &str, desc: &str) -> Self {
        Self {
            name: name.to_string(),
            desc: desc.to_string(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_query(mut self, query: Query) -> Self {
        self.queries.push(query);
        self
    }

    #[must_use]
    pub fn with_column(mut self, column: Column) -> Self {
        self.metrics.push(column);
        self
    }

    #[must_use]
    pub const fn with_ttl(mut self, seconds: f64) -> Self {
        self.ttl = Some(seconds);
        self
    }

    /// First variant the server can run, if any.
    #[must_use]
    pub fn select_query(&self, version: i64, primary: bool) -> Option<&Query> {
        self.queries.iter().find(|q| q.supports(version, primary))
    }

    #[must_use]
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.metrics
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn label_columns(&self) -> impl Iterator<Item = &Column> {
        self.metrics.iter().filter(|c| c.usage == ColumnUsage::Label)
    }

    /// Label names of every metric of this group, `server` first.
    #[must_use]
    pub fn label_names(&self) -> Vec<String> {
        std::iter::once(SERVER_LABEL.to_string())
            .chain(self.label_columns().map(|c| c.output_name().to_string()))
            .collect()
    }

    #[must_use]
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
            .filter(|secs| *secs >= 0.0)
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
    }

    /// Check that the group can be turned into well-formed metrics.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if !is_valid_name(&self.name) {
            bail!("invalid query group name {:?}", self.name);
        }

        let mut seen = HashSet::new();
        let mut outputs = HashSet::new();
        for column in &self.metrics {
            if !seen.insert(column.name.to_ascii_lowercase()) {
                bail!("{}: duplicate column {}", self.name, column.name);
            }
            // labels and metric suffixes are separate namespaces
            let is_label = column.usage == ColumnUsage::Label;
            if column.usage != ColumnUsage::Discard
                && !outputs.insert((is_label, column.output_name().to_string()))
            {
                bail!("{}: duplicate output name {}", self.name, column.output_name());
            }
            if !is_valid_name(column.output_name()) {
                bail!("{}: invalid column name {:?}", self.name, column.output_name());
            }
            if column.usage == ColumnUsage::Label && column.output_name() == SERVER_LABEL {
                bail!("{}: label {SERVER_LABEL:?} is reserved", self.name);
            }
        }

        for (idx, query) in self.queries.iter().enumerate() {
            if query.sql.trim().is_empty() {
                bail!("{}: query #{idx} has no sql", self.name);
            }
            for version in [&query.min_version, &query.max_version].into_iter().flatten() {
                if normalize_version(version).is_none() {
                    bail!("{}: query #{idx} has invalid version {version:?}", self.name);
                }
            }
        }

        if self.ttl.is_some_and(|ttl| ttl.is_nan() || ttl < 0.0) {
            bail!("{}: ttl must not be negative", self.name);
        }

        Ok(())
    }
}

fn is_valid_name(name: &str) -> bool {
    static RE: OnceCell<Regex> = OnceCell::new();
    let re = RE.get_or_init(|| {
        #[allow(clippy::expect_used)]
        Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]*$").expect("Invalid regex")
    });
    re.is_match(name)
}

/// Query groups by name.
pub type QueryInstances = BTreeMap<String, Arc<QueryInstance>>;

/// Read-mostly holder of the configured query groups. Readers get an
/// immutable snapshot; a reload publishes a whole new map at once.
pub struct QueryInstanceMap {
    inner: ArcSwap<QueryInstances>,
}

impl QueryInstanceMap {
    #[must_use]
    pub fn new(instances: QueryInstances) -> Self {
        Self {
            inner: ArcSwap::from_pointee(instances),
        }
    }

    /// Current snapshot.
    #[must_use]
    pub fn load(&self) -> Arc<QueryInstances> {
        self.inner.load_full()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<QueryInstance>> {
        self.inner.load().get(name).cloned()
    }

    /// Atomically swap in a new set of query groups.
    pub fn replace(&self, instances: QueryInstances) {
        self.inner.store(Arc::new(instances));
    }
}

impl Default for QueryInstanceMap {
    fn default() -> Self {
        Self::new(QueryInstances::new())
    }
}

impl FromIterator<QueryInstance> for QueryInstanceMap {
    fn from_iter<I: IntoIterator<Item = QueryInstance>>(iter: I) -> Self {
        Self::new(into_instances(iter))
    }
}

/// Index query groups by name.
pub fn into_instances<I: IntoIterator<Item = QueryInstance>>(iter: I) -> QueryInstances {
    iter.into_iter()
        .map(|instance| (instance.name.clone(), Arc::new(instance)))
        .collect()
}

/// Parse a JSON document of the form `{"<group>": {...}, ...}`.
/// A group without a `name` takes its key as name.
///
/// # Errors
///
/// Returns an error if the JSON is malformed or a group fails validation.
pub fn parse_query_instances(json: &str) -> Result<QueryInstances> {
    let raw: BTreeMap<String, QueryInstance> =
        serde_json::from_str(json).context("failed to parse query definitions")?;

    let mut instances = QueryInstances::new();
    for (key, mut instance) in raw {
        if instance.name.is_empty() {
            instance.name.clone_from(&key);
        }
        instance.validate()?;
        if instances
            .insert(instance.name.clone(), Arc::new(instance))
            .is_some()
        {
            return Err(anyhow!("duplicate query group {key}"));
        }
    }

    Ok(instances)
}

/// Read and parse a query definition file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed.
pub fn load_query_file(path: &Path) -> Result<QueryInstances> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    parse_query_instances(&json)
}

/// Drop the groups named in `disabled`.
#[must_use]
pub fn without_disabled(mut instances: QueryInstances, disabled: &[String]) -> QueryInstances {
    instances.retain(|name, _| !disabled.iter().any(|d| d == name));
    instances
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lock_instance() -> QueryInstance {
        QueryInstance::new("pg_lock", "Lock counts")
            .with_query(Query::new("SELECT 1").with_min_version("10.0").with_timeout(1.0))
            .with_query(Query::new("SELECT 2").with_min_version("9.0").with_max_version("10.0"))
            .with_column(Column::new("datname", ColumnUsage::Label, "database"))
            .with_column(Column::new("mode", ColumnUsage::Label, "lock mode"))
            .with_column(Column::new("count", ColumnUsage::Gauge, "lock count"))
    }

    #[test]
    fn test_select_query_by_version() {
        let instance = lock_instance();
        assert_eq!(
            instance.select_query(130_000, true).map(|q| q.sql.as_str()),
            Some("SELECT 1")
        );
        assert_eq!(
            instance.select_query(90_204, true).map(|q| q.sql.as_str()),
            Some("SELECT 2")
        );
        assert!(instance.select_query(80_400, true).is_none());
    }

    #[test]
    fn test_select_query_by_role_and_status() {
        let mut disabled = Query::new("SELECT 0");
        disabled.status = QueryStatus::Disable;

        let instance = QueryInstance::new("pg_repl", "")
            .with_query(disabled)
            .with_query(Query::new("SELECT 1").with_db_role(DbRole::Primary))
            .with_query(Query::new("SELECT 2").with_db_role(DbRole::Standby));

        assert_eq!(
            instance.select_query(0, true).map(|q| q.sql.as_str()),
            Some("SELECT 1")
        );
        assert_eq!(
            instance.select_query(0, false).map(|q| q.sql.as_str()),
            Some("SELECT 2")
        );
    }

    #[test]
    fn test_query_timeout() {
        let default = Duration::from_secs(10);
        assert_eq!(Query::new("x").timeout(default), Some(default));
        assert_eq!(Query::new("x").timeout(Duration::ZERO), None);
        assert_eq!(Query::new("x").with_timeout(0.0).timeout(default), None);
        assert_eq!(Query::new("x").with_timeout(-1.0).timeout(default), None);
        assert_eq!(
            Query::new("x").with_timeout(0.1).timeout(default),
            Some(Duration::from_millis(100))
        );
    }

    #[test]
    fn test_label_names() {
        let instance = lock_instance().with_column(
            Column::new("usename", ColumnUsage::Label, "user").with_rename("user"),
        );
        assert_eq!(instance.label_names(), vec!["server", "datname", "mode", "user"]);
        assert_eq!(instance.column("COUNT").map(|c| c.usage), Some(ColumnUsage::Gauge));
    }

    #[test]
    fn test_validate() {
        assert!(lock_instance().validate().is_ok());
        assert!(QueryInstance::default().validate().is_err());
        assert!(
            lock_instance()
                .with_column(Column::new("mode", ColumnUsage::Label, ""))
                .validate()
                .is_err()
        );
        assert!(
            lock_instance()
                .with_column(Column::new("server", ColumnUsage::Label, ""))
                .validate()
                .is_err()
        );
        assert!(
            QueryInstance::new("x", "")
                .with_query(Query::new("SELECT 1").with_min_version("abc"))
                .validate()
                .is_err()
        );
        assert!(QueryInstance::new("x", "").with_ttl(-1.0).validate().is_err());
    }

    #[test]
    fn test_validate_rejects_colliding_renames() {
        let labels = lock_instance()
            .with_column(Column::new("usename", ColumnUsage::Label, "").with_rename("mode"));
        assert!(labels.validate().is_err());

        let values = lock_instance()
            .with_column(Column::new("granted", ColumnUsage::Gauge, "").with_rename("count"));
        assert!(values.validate().is_err());

        // discarded columns produce nothing, a label may share a metric suffix
        let fine = lock_instance()
            .with_column(Column::new("pid", ColumnUsage::Discard, "").with_rename("count"))
            .with_column(Column::new("granted", ColumnUsage::Gauge, "").with_rename("mode"));
        assert!(fine.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_oversized_version() {
        let instance = QueryInstance::new("x", "")
            .with_query(Query::new("SELECT 1").with_min_version("99999999999999999999.0"));
        assert!(instance.validate().is_err());
        assert!(!instance.queries.iter().any(|q| q.supports(90_000, true)));
    }

    #[test]
    fn test_parse_query_instances() {
        let json = r#"{
            "pg_up": {
                "desc": "liveness",
                "queries": [{"sql": "SELECT 1 AS up", "timeout": 0.5, "db_role": "primary"}],
                "metrics": [{"name": "up", "usage": "GAUGE"}],
                "ttl": 30
            }
        }"#;

        let instances = parse_query_instances(json);
        assert!(instances.is_ok());
        let instances = instances.unwrap_or_default();
        let up = instances.get("pg_up");
        assert!(up.is_some_and(|up| up.name == "pg_up"
            && up.queries.len() == 1
            && up.ttl() == Some(Duration::from_secs(30))));
    }

    #[test]
    fn test_parse_query_instances_rejects_bad_usage() {
        let json = r#"{"x": {"metrics": [{"name": "a", "usage": "HISTOGRAM"}]}}"#;
        assert!(parse_query_instances(json).is_err());
    }

    #[test]
    fn test_query_instance_map_replace() {
        let map: QueryInstanceMap = vec![lock_instance()].into_iter().collect();
        let before = map.load();
        assert!(map.get("pg_lock").is_some());

        map.replace(into_instances(vec![QueryInstance::new("pg_other", "")]));

        // old snapshot is untouched
        assert!(before.contains_key("pg_lock"));
        assert!(map.get("pg_lock").is_none());
        assert!(map.get("pg_other").is_some());
    }

    #[test]
    fn test_without_disabled() {
        let instances = into_instances(vec![lock_instance(), QueryInstance::new("pg_other", "")]);
        let kept = without_disabled(instances, &["pg_lock".to_string()]);
        assert_eq!(kept.keys().collect::<Vec<_>>(), vec!["pg_other"]);
    }
}
