//! Scripted in-memory [`Database`] for tests and dry runs.
//!
//! Rules are matched against the SQL text in registration order; the first
//! rule whose pattern occurs in the statement answers it.

use super::database::Database;
use super::value::{ColumnValue, RawRow};
use futures::future::{self, BoxFuture};
use futures::stream::{self, BoxStream, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Clone, Debug)]
enum Response {
    Rows(Vec<RawRow>),
    Error(String),
    /// Rows followed by a driver error, as when a connection drops mid-result.
    RowsThenError(Vec<RawRow>, String),
}

#[derive(Debug)]
struct Rule {
    pattern: String,
    response: Response,
    delay: Option<Duration>,
    hits: Arc<AtomicUsize>,
    completed: Arc<AtomicUsize>,
}

#[derive(Debug, Default)]
pub struct MockDatabase {
    rules: Mutex<Vec<Rule>>,
    ping_error: Mutex<Option<String>>,
    pings: AtomicUsize,
    closed: AtomicBool,
}

impl MockDatabase {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer statements containing `pattern` with `rows`.
    #[must_use]
    pub fn with_rows(self, pattern: &str, rows: Vec<RawRow>) -> Self {
        self.push(pattern, Response::Rows(rows), None);
        self
    }

    /// Answer statements containing `pattern` with `rows` after `delay`.
    #[must_use]
    pub fn with_delayed_rows(self, pattern: &str, rows: Vec<RawRow>, delay: Duration) -> Self {
        self.push(pattern, Response::Rows(rows), Some(delay));
        self
    }

    /// Fail statements containing `pattern` with a driver error.
    #[must_use]
    pub fn with_error(self, pattern: &str, message: &str) -> Self {
        self.push(pattern, Response::Error(message.to_string()), None);
        self
    }

    /// Stream `rows` for statements containing `pattern`, then fail.
    #[must_use]
    pub fn with_rows_then_error(self, pattern: &str, rows: Vec<RawRow>, message: &str) -> Self {
        self.push(
            pattern,
            Response::RowsThenError(rows, message.to_string()),
            None,
        );
        self
    }

    #[must_use]
    pub fn with_ping_error(self, message: &str) -> Self {
        *lock(&self.ping_error) = Some(message.to_string());
        self
    }

    /// Answer the server info statements as a server of `version`.
    #[must_use]
    pub fn with_server_info(self, version: &str, in_recovery: bool) -> Self {
        self.with_rows(
            "server_version",
            vec![RawRow::new(vec![(
                "server_version".to_string(),
                ColumnValue::Text(version.to_string()),
            )])],
        )
        .with_rows(
            "pg_is_in_recovery",
            vec![RawRow::new(vec![(
                "pg_is_in_recovery".to_string(),
                ColumnValue::Bool(in_recovery),
            )])],
        )
    }

    /// Number of statements that matched `pattern`.
    #[must_use]
    pub fn hits(&self, pattern: &str) -> usize {
        lock(&self.rules)
            .iter()
            .filter(|r| r.pattern == pattern)
            .map(|r| r.hits.load(Ordering::SeqCst))
            .sum()
    }

    /// Number of statements matching `pattern` that ran to completion
    /// (were not dropped while waiting on their delay).
    #[must_use]
    pub fn completed(&self, pattern: &str) -> usize {
        lock(&self.rules)
            .iter()
            .filter(|r| r.pattern == pattern)
            .map(|r| r.completed.load(Ordering::SeqCst))
            .sum()
    }

    #[must_use]
    pub fn pings(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn push(&self, pattern: &str, response: Response, delay: Option<Duration>) {
        lock(&self.rules).push(Rule {
            pattern: pattern.to_string(),
            response,
            delay,
            hits: Arc::new(AtomicUsize::new(0)),
            completed: Arc::new(AtomicUsize::new(0)),
        });
    }
}

impl Database for MockDatabase {
    fn fetch<'a>(&'a self, sql: &'a str) -> BoxStream<'a, Result<RawRow, sqlx::Error>> {
        let matched = lock(&self.rules).iter().find(|r| sql.contains(&r.pattern)).map(|r| {
            r.hits.fetch_add(1, Ordering::SeqCst);
            (r.response.clone(), r.delay, Arc::clone(&r.completed))
        });

        let Some((response, delay, completed)) = matched else {
            let err = sqlx::Error::Protocol(format!("unexpected statement: {sql}"));
            return stream::once(future::ready(Err(err))).boxed();
        };

        let rows = async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            completed.fetch_add(1, Ordering::SeqCst);

            let (rows, failure) = match response {
                Response::Rows(rows) => (rows, None),
                Response::Error(message) => (Vec::new(), Some(message)),
                Response::RowsThenError(rows, message) => (rows, Some(message)),
            };
            stream::iter(rows.into_iter().map(Ok)).chain(stream::iter(
                failure.map(|message| Err(sqlx::Error::Protocol(message))),
            ))
        };

        stream::once(rows).flatten().boxed()
    }

    fn ping(&self) -> BoxFuture<'_, Result<(), sqlx::Error>> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        let result = lock(&self.ping_error)
            .clone()
            .map_or(Ok(()), |message| Err(sqlx::Error::Protocol(message)));
        Box::pin(future::ready(result))
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        self.closed.store(true, Ordering::SeqCst);
        Box::pin(future::ready(()))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Build rows from CSV-like text: one row per line, values split on `,`.
/// Values that parse as integers become [`ColumnValue::Int`], the rest text.
#[must_use]
pub fn rows_from_csv(columns: &[&str], csv: &str) -> Vec<RawRow> {
    csv.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            columns
                .iter()
                .zip(line.split(','))
                .map(|(name, raw)| {
                    let raw = raw.trim();
                    let value = raw
                        .parse::<i64>()
                        .map_or_else(|_| ColumnValue::Text(raw.to_string()), ColumnValue::Int);
                    ((*name).to_string(), value)
                })
                .collect()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    #[tokio::test]
    async fn test_rule_matching_and_hits() {
        let db = MockDatabase::new().with_rows(
            "pg_database",
            rows_from_csv(&["datname"], "postgres\nomm"),
        );

        let rows: Vec<RawRow> = db
            .fetch("SELECT datname FROM pg_database")
            .try_collect()
            .await
            .unwrap_or_default();

        assert_eq!(rows.len(), 2);
        assert_eq!(db.hits("pg_database"), 1);
        assert_eq!(db.completed("pg_database"), 1);
    }

    #[tokio::test]
    async fn test_unexpected_statement_fails() {
        let db = MockDatabase::new();
        let res: Result<Vec<RawRow>, _> = db.fetch("SELECT 1").try_collect().await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn test_ping_and_close() {
        let db = MockDatabase::new().with_ping_error("ping error");
        assert!(db.ping().await.is_err());
        assert_eq!(db.pings(), 1);

        db.close().await;
        assert!(db.is_closed());
    }

    #[test]
    fn test_rows_from_csv() {
        let rows = rows_from_csv(&["datname", "mode", "count"], "postgres,AccessShareLock,4\n");
        assert_eq!(rows.len(), 1);
        assert!(rows.first().is_some_and(|row| {
            row.get("count") == Some(&ColumnValue::Int(4))
                && row.get("mode") == Some(&ColumnValue::Text("AccessShareLock".into()))
        }));
    }
}
