//! The collection engine: runs query groups against the current connection,
//! turns rows into [`MetricObservation`]s and caches the results.

use super::cache::{CacheEntry, MetricCache};
use super::config::ServerConfig;
use super::database::{Database, PgDatabase};
use super::error::{QueryError, RowConversionError};
use super::exporter::ScraperCollector;
use super::fingerprint::parse_fingerprint;
use super::instance::{ColumnUsage, Query, QueryInstance, QueryInstanceMap, SERVER_LABEL};
use super::metric::{MetricKind, MetricObservation};
use super::util::normalize_version;
use super::value::{ColumnValue, RawRow};
use futures::TryStreamExt;
use futures::stream::{FuturesUnordered, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, info_span, instrument, warn};
use tracing_futures::Instrument as _;

const POOL_SIZE: u32 = 4;

const SERVER_VERSION_SQL: &str = "SHOW server_version";
const IN_RECOVERY_SQL: &str = "SELECT pg_is_in_recovery()";
const DATABASES_SQL: &str = "SELECT datname FROM pg_database \
WHERE datistemplate = false AND datallowconn = true ORDER BY datname";

/// A live database handle and the `host:port` it points at.
pub struct ConnectionTarget {
    db: Arc<dyn Database>,
    fingerprint: String,
}

impl ConnectionTarget {
    #[must_use]
    pub fn new(db: Arc<dyn Database>, fingerprint: String) -> Self {
        Self { db, fingerprint }
    }

    #[must_use]
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

/// Metrics of one query group plus the rows or columns that could not be
/// converted.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueryOutcome {
    pub metrics: Vec<MetricObservation>,
    pub errors: Vec<RowConversionError>,
}

/// Merged result of one pass over every configured query group.
#[derive(Debug, Default)]
pub struct ScrapeReport {
    pub metrics: Vec<MetricObservation>,
    pub errors: Vec<RowConversionError>,
    /// Groups that failed, with the reason.
    pub failures: Vec<(String, QueryError)>,
}

pub struct Server {
    target: RwLock<Option<Arc<ConnectionTarget>>>,
    config: ServerConfig,
    instances: Arc<QueryInstanceMap>,
    cache: MetricCache,
    version: AtomicI64,
    primary: AtomicBool,
    scraper: Arc<ScraperCollector>,
}

impl Server {
    /// Engine without a connection; see [`Server::attach`].
    #[must_use]
    pub fn new(config: ServerConfig, instances: Arc<QueryInstanceMap>) -> Self {
        let cache = MetricCache::new(!config.disable_cache);
        Self {
            target: RwLock::new(None),
            config,
            instances,
            cache,
            version: AtomicI64::new(0),
            primary: AtomicBool::new(true),
            scraper: Arc::new(ScraperCollector::new()),
        }
    }

    /// Engine backed by a lazily connecting pool for `dsn`.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::InvalidConnectionString`] if the DSN cannot be
    /// fingerprinted or turned into connect options.
    pub fn connect(
        dsn: &SecretString,
        config: ServerConfig,
        instances: Arc<QueryInstanceMap>,
    ) -> Result<Self, QueryError> {
        let fingerprint = parse_fingerprint(dsn.expose_secret())?;
        let db = PgDatabase::connect_lazy(dsn, POOL_SIZE)?;

        let server = Self::new(config, instances);
        server.attach(Arc::new(db), fingerprint);
        Ok(server)
    }

    /// Replace the connection. Cached results of the previous target are
    /// dropped.
    pub fn attach(&self, db: Arc<dyn Database>, fingerprint: String) {
        info!(server = %fingerprint, "attached database");
        let target = Arc::new(ConnectionTarget::new(db, fingerprint));
        *self.target.write().unwrap_or_else(PoisonError::into_inner) = Some(target);
        self.cache.clear();
    }

    #[must_use]
    pub const fn config(&self) -> &ServerConfig {
        &self.config
    }

    #[must_use]
    pub const fn instances(&self) -> &Arc<QueryInstanceMap> {
        &self.instances
    }

    #[must_use]
    pub const fn scraper(&self) -> &Arc<ScraperCollector> {
        &self.scraper
    }

    #[must_use]
    pub fn fingerprint(&self) -> Option<String> {
        self.current_target().map(|t| t.fingerprint.clone())
    }

    /// Normalized server version, `0` until the first successful refresh.
    #[must_use]
    pub fn version(&self) -> i64 {
        self.version.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_primary(&self) -> bool {
        self.primary.load(Ordering::Relaxed)
    }

    /// Override the server version and role used for variant selection.
    pub fn set_server_info(&self, version: i64, primary: bool) {
        self.version.store(version, Ordering::Relaxed);
        self.primary.store(primary, Ordering::Relaxed);
    }

    pub fn invalidate_cache(&self) {
        self.cache.clear();
    }

    fn current_target(&self) -> Option<Arc<ConnectionTarget>> {
        self.target
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn target(&self) -> Result<Arc<ConnectionTarget>, QueryError> {
        self.current_target().ok_or(QueryError::NotConnected)
    }

    fn is_current(&self, target: &Arc<ConnectionTarget>) -> bool {
        self.current_target()
            .is_some_and(|current| Arc::ptr_eq(&current, target))
    }

    /// Bound for the engine's own statements (server info, database list).
    async fn bounded<T, F>(&self, name: &str, statement: F) -> Result<T, QueryError>
    where
        F: Future<Output = Result<T, QueryError>>,
    {
        if self.config.default_timeout.is_zero() {
            statement.await
        } else {
            with_timeout(name, self.config.default_timeout, statement).await
        }
    }

    /// Run query group `name`, or serve it from the cache while fresh.
    ///
    /// Row and column conversion problems are returned in
    /// [`QueryOutcome::errors`]; only timeouts and driver failures are errors.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::Timeout`] when the variant's bound elapses,
    /// [`QueryError::Execution`] when the statement fails and
    /// [`QueryError::NotConnected`] without a connection.
    #[instrument(skip(self, instance), level = "debug", err)]
    pub async fn query_metric(
        &self,
        name: &str,
        instance: &QueryInstance,
    ) -> Result<QueryOutcome, QueryError> {
        let Some(query) = instance.select_query(self.version(), self.is_primary()) else {
            debug!(query = name, version = self.version(), "no runnable variant, skipped");
            return Ok(QueryOutcome::default());
        };

        let ttl = instance.ttl().unwrap_or(self.config.cache_ttl);
        if let Some(entry) = self.cache.get(name)
            && entry.is_fresh(ttl, Instant::now())
        {
            debug!(query = name, "served from cache");
            return Ok(QueryOutcome {
                metrics: entry.metrics.clone(),
                errors: entry.errors.clone(),
            });
        }

        // only executions are timed, cache hits are not
        let timer = self.scraper.start_scrape(name);
        let result = self.run(name, instance, query).await;
        match &result {
            Ok(_) => timer.success(),
            Err(_) => timer.error(),
        }
        result
    }

    async fn run(
        &self,
        name: &str,
        instance: &QueryInstance,
        query: &Query,
    ) -> Result<QueryOutcome, QueryError> {
        let target = self.target()?;
        let execution = self.execute(name, instance, query, &target);
        let outcome = match query.timeout(self.config.default_timeout) {
            Some(limit) => with_timeout(name, limit, execution).await?,
            None => execution.await?,
        };

        // a result of a replaced target would be served under the old label
        if self.is_current(&target) {
            self.cache.put(
                name,
                CacheEntry::new(outcome.metrics.clone(), outcome.errors.clone()),
            );
        } else {
            debug!(query = name, server = %target.fingerprint, "target replaced, result not cached");
        }

        Ok(outcome)
    }

    async fn execute(
        &self,
        name: &str,
        instance: &QueryInstance,
        query: &Query,
        target: &ConnectionTarget,
    ) -> Result<QueryOutcome, QueryError> {
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = %query.sql,
            query = name,
            server = %target.fingerprint,
            otel.kind = "client"
        );

        async {
            let mut rows = target.db.fetch(&query.sql);
            let mut outcome = QueryOutcome::default();

            while let Some(row) = rows.try_next().await.map_err(|source| QueryError::Execution {
                name: name.to_string(),
                source,
            })? {
                self.convert_row(name, instance, &target.fingerprint, &row, &mut outcome);
            }

            debug!(
                metrics = outcome.metrics.len(),
                errors = outcome.errors.len(),
                "query finished"
            );
            Ok::<_, QueryError>(outcome)
        }
        .instrument(span)
        .await
    }

    fn convert_row(
        &self,
        name: &str,
        instance: &QueryInstance,
        fingerprint: &str,
        row: &RawRow,
        outcome: &mut QueryOutcome,
    ) {
        let mut labels = vec![(SERVER_LABEL.to_string(), fingerprint.to_string())];

        for column in instance.label_columns() {
            // a label column missing from the result renders empty
            let value = match row.get(&column.name) {
                None => String::new(),
                Some(value) => {
                    let Some(label) = value.to_label() else {
                        outcome.errors.push(RowConversionError::Label {
                            query: name.to_string(),
                            column: column.name.clone(),
                            kind: value.kind(),
                        });
                        return;
                    };
                    label
                }
            };
            labels.push((column.output_name().to_string(), value));
        }

        for (column_name, value) in row.iter() {
            let (metric, help, kind) = match instance.column(column_name) {
                Some(column) => match column.usage {
                    ColumnUsage::Label | ColumnUsage::Discard => continue,
                    ColumnUsage::Gauge => (
                        self.config.metric_name(name, column.output_name()),
                        column.desc.clone(),
                        MetricKind::Gauge,
                    ),
                    ColumnUsage::Counter => (
                        self.config.metric_name(name, column.output_name()),
                        column.desc.clone(),
                        MetricKind::Counter,
                    ),
                },
                None => (
                    self.config.metric_name(name, &sanitize_name(column_name)),
                    format!("Unknown metric from {name}"),
                    MetricKind::Untyped,
                ),
            };

            let Some(sample) = value.to_f64() else {
                outcome.errors.push(RowConversionError::Value {
                    query: name.to_string(),
                    column: column_name.to_string(),
                    value: value.to_string(),
                });
                continue;
            };

            outcome.metrics.push(MetricObservation {
                name: metric,
                help,
                labels: labels.clone(),
                value: sample,
                kind,
            });
        }
    }

    /// # Errors
    ///
    /// Returns the driver error, or [`QueryError::NotConnected`].
    #[instrument(skip(self), level = "debug", err)]
    pub async fn ping(&self) -> Result<(), QueryError> {
        let target = self.target()?;
        target.db.ping().await?;
        Ok(())
    }

    /// Release the connection. Closing an engine without one is a no-op.
    ///
    /// # Errors
    ///
    /// Currently infallible; kept fallible for driver parity.
    pub async fn close(&self) -> Result<(), QueryError> {
        let target = self
            .target
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(target) = target {
            info!(server = %target.fingerprint, "closing database");
            target.db.close().await;
        }

        Ok(())
    }

    /// Names of the databases that accept connections.
    ///
    /// # Errors
    ///
    /// Returns the driver error, or [`QueryError::NotConnected`].
    #[instrument(skip(self), level = "debug", err)]
    pub async fn query_databases(&self) -> Result<Vec<String>, QueryError> {
        let target = self.target()?;
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = DATABASES_SQL,
            otel.kind = "client"
        );

        let fetch = async {
            let rows: Vec<RawRow> = target.db.fetch(DATABASES_SQL).try_collect().await?;
            Ok::<_, QueryError>(rows)
        };
        let rows = self.bounded("pg_database", fetch.instrument(span)).await?;

        Ok(rows
            .iter()
            .filter_map(|row| row.iter().next().and_then(|(_, value)| value.to_label()))
            .collect())
    }

    /// Read the server version and recovery state. On failure the previous
    /// values are kept.
    ///
    /// # Errors
    ///
    /// Returns the driver error, or [`QueryError::NotConnected`].
    #[instrument(skip(self), level = "debug", err)]
    pub async fn refresh_server_info(&self) -> Result<(), QueryError> {
        let target = self.target()?;

        let version = self
            .bounded("server_version", first_value(target.db.as_ref(), SERVER_VERSION_SQL))
            .await?;
        match version
            .as_ref()
            .and_then(ColumnValue::to_label)
            .and_then(|v| normalize_version(&v))
        {
            Some((normalized, number)) => {
                debug!(version = %normalized, "server version");
                self.version.store(number, Ordering::Relaxed);
            }
            None => warn!(value = ?version, "unparsable server version, keeping previous"),
        }

        let recovery = self
            .bounded("pg_is_in_recovery", first_value(target.db.as_ref(), IN_RECOVERY_SQL))
            .await?;
        if let Some(in_recovery) = recovery.as_ref().and_then(ColumnValue::to_f64) {
            self.primary.store(in_recovery < 0.5, Ordering::Relaxed);
        }

        Ok(())
    }

    /// Run every group of the current map snapshot concurrently.
    ///
    /// A failing group is logged and reported in
    /// [`ScrapeReport::failures`]; it never hides the other groups.
    #[instrument(skip(self), level = "info", fields(otel.kind = "internal"))]
    pub async fn scrape(&self) -> ScrapeReport {
        self.scraper.increment_scrapes();

        match self.refresh_server_info().await {
            Ok(()) => self.scraper.set_up(true),
            Err(e) => {
                warn!(error = %e, "failed to read server info");
                self.scraper.set_up(false);
            }
        }

        let snapshot = self.instances.load();
        let mut tasks: FuturesUnordered<_> = snapshot
            .iter()
            .map(|(name, instance)| async move { (name, self.query_metric(name, instance).await) })
            .collect();

        let mut report = ScrapeReport::default();
        while let Some((name, res)) = tasks.next().await {
            match res {
                Ok(outcome) => {
                    self.scraper
                        .record_conversion_errors(name, outcome.errors.len());
                    for error in &outcome.errors {
                        debug!(error = %error, "conversion error");
                    }
                    report.metrics.extend(outcome.metrics);
                    report.errors.extend(outcome.errors);
                }
                Err(e) => {
                    warn!(query = %name, error = %e, "query group failed");
                    report.failures.push((name.clone(), e));
                }
            }
        }

        self.scraper.update_metrics_count(report.metrics.len());
        report
    }
}

async fn with_timeout<T, F>(name: &str, limit: Duration, execution: F) -> Result<T, QueryError>
where
    F: Future<Output = Result<T, QueryError>>,
{
    // dropping `execution` drops the row stream, which abandons the statement
    tokio::time::timeout(limit, execution)
        .await
        .map_err(|_| QueryError::Timeout {
            name: name.to_string(),
            timeout: limit,
        })?
}

async fn first_value(db: &dyn Database, sql: &str) -> Result<Option<ColumnValue>, QueryError> {
    let mut rows = db.fetch(sql);
    let row = rows.try_next().await?;
    Ok(row.and_then(|row| row.iter().next().map(|(_, value)| value.clone())))
}

fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect()
}
