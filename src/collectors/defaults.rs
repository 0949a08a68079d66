//! Query groups shipped with the exporter, used when no query file is given.

use super::instance::{Column, ColumnUsage, DbRole, Query, QueryInstance, QueryInstances, into_instances};

const PG_LOCK_SQL: &str = "SELECT pg_database.datname AS datname, tmp.mode AS mode, \
COALESCE(count, 0) AS count \
FROM (VALUES ('accesssharelock'), ('rowsharelock'), ('rowexclusivelock'), \
('shareupdateexclusivelock'), ('sharelock'), ('sharerowexclusivelock'), \
('exclusivelock'), ('accessexclusivelock')) AS tmp(mode) \
CROSS JOIN pg_database \
LEFT JOIN (SELECT database, lower(mode) AS mode, count(*) AS count \
FROM pg_locks WHERE database IS NOT NULL GROUP BY database, lower(mode)) AS tmp2 \
ON tmp.mode = tmp2.mode AND pg_database.oid = tmp2.database \
ORDER BY 1";

const PG_DATABASE_SQL: &str = "SELECT datname, pg_database_size(datname) AS size_bytes \
FROM pg_database WHERE datallowconn";

const PG_STAT_DATABASE_SQL: &str = "SELECT datname, numbackends, xact_commit, xact_rollback, \
blks_read, blks_hit, tup_returned, tup_fetched, tup_inserted, tup_updated, tup_deleted, \
conflicts, temp_files, temp_bytes, deadlocks \
FROM pg_stat_database WHERE datname IS NOT NULL";

const PG_STAT_ACTIVITY_SQL: &str = "SELECT datname, COALESCE(state, 'unknown') AS state, \
count(*) AS count, \
COALESCE(max(EXTRACT(EPOCH FROM now() - xact_start)), 0) AS max_tx_duration \
FROM pg_stat_activity WHERE datname IS NOT NULL GROUP BY datname, state";

const PG_STAT_REPLICATION_SQL: &str = "SELECT application_name, client_addr::text AS client_addr, \
state, pg_wal_lsn_diff(pg_current_wal_lsn(), replay_lsn) AS lag_bytes \
FROM pg_stat_replication";

const PG_STAT_REPLICATION_SQL_9: &str = "SELECT application_name, client_addr::text AS client_addr, \
state, pg_xlog_location_diff(pg_current_xlog_location(), replay_location) AS lag_bytes \
FROM pg_stat_replication";

const PG_POSTMASTER_SQL: &str =
    "SELECT EXTRACT(EPOCH FROM pg_postmaster_start_time()) AS start_time_seconds";

fn pg_lock() -> QueryInstance {
    QueryInstance::new("pg_lock", "Number of locks held per database and mode")
        .with_query(Query::new(PG_LOCK_SQL).with_timeout(1.0))
        .with_column(Column::new("datname", ColumnUsage::Label, "Name of this database"))
        .with_column(Column::new("mode", ColumnUsage::Label, "Type of lock"))
        .with_column(Column::new("count", ColumnUsage::Gauge, "Number of locks"))
}

fn pg_database() -> QueryInstance {
    QueryInstance::new("pg_database", "Database size")
        .with_query(Query::new(PG_DATABASE_SQL).with_timeout(5.0))
        .with_column(Column::new("datname", ColumnUsage::Label, "Name of this database"))
        .with_column(Column::new(
            "size_bytes",
            ColumnUsage::Gauge,
            "Disk space used by the database",
        ))
        .with_ttl(300.0)
}

fn pg_stat_database() -> QueryInstance {
    let counter = |name: &str, desc: &str| Column::new(name, ColumnUsage::Counter, desc);

    QueryInstance::new("pg_stat_database", "Per database statistics")
        .with_query(Query::new(PG_STAT_DATABASE_SQL).with_timeout(1.0))
        .with_column(Column::new("datname", ColumnUsage::Label, "Name of this database"))
        .with_column(Column::new(
            "numbackends",
            ColumnUsage::Gauge,
            "Number of backends currently connected to this database",
        ))
        .with_column(counter("xact_commit", "Transactions committed"))
        .with_column(counter("xact_rollback", "Transactions rolled back"))
        .with_column(counter("blks_read", "Disk blocks read"))
        .with_column(counter("blks_hit", "Disk blocks found in the buffer cache"))
        .with_column(counter("tup_returned", "Rows returned by queries"))
        .with_column(counter("tup_fetched", "Rows fetched by queries"))
        .with_column(counter("tup_inserted", "Rows inserted by queries"))
        .with_column(counter("tup_updated", "Rows updated by queries"))
        .with_column(counter("tup_deleted", "Rows deleted by queries"))
        .with_column(counter("conflicts", "Queries canceled due to recovery conflicts"))
        .with_column(counter("temp_files", "Temporary files created by queries"))
        .with_column(counter("temp_bytes", "Data written to temporary files"))
        .with_column(counter("deadlocks", "Deadlocks detected"))
}

fn pg_stat_activity() -> QueryInstance {
    QueryInstance::new("pg_stat_activity", "Connections per database and state")
        .with_query(Query::new(PG_STAT_ACTIVITY_SQL).with_timeout(1.0))
        .with_column(Column::new("datname", ColumnUsage::Label, "Name of this database"))
        .with_column(Column::new("state", ColumnUsage::Label, "Connection state"))
        .with_column(Column::new("count", ColumnUsage::Gauge, "Number of connections"))
        .with_column(Column::new(
            "max_tx_duration",
            ColumnUsage::Gauge,
            "Longest running transaction in seconds",
        ))
}

fn pg_stat_replication() -> QueryInstance {
    QueryInstance::new("pg_stat_replication", "Replication lag per standby")
        .with_query(
            Query::new(PG_STAT_REPLICATION_SQL)
                .with_min_version("10.0")
                .with_db_role(DbRole::Primary)
                .with_timeout(1.0),
        )
        .with_query(
            Query::new(PG_STAT_REPLICATION_SQL_9)
                .with_min_version("9.2")
                .with_max_version("10.0")
                .with_db_role(DbRole::Primary)
                .with_timeout(1.0),
        )
        .with_column(Column::new(
            "application_name",
            ColumnUsage::Label,
            "Name of the standby",
        ))
        .with_column(Column::new("client_addr", ColumnUsage::Label, "Standby address"))
        .with_column(Column::new("state", ColumnUsage::Label, "WAL sender state"))
        .with_column(Column::new(
            "lag_bytes",
            ColumnUsage::Gauge,
            "Replay lag behind the primary in bytes",
        ))
}

fn pg_postmaster() -> QueryInstance {
    QueryInstance::new("pg_postmaster", "Server start time")
        .with_query(Query::new(PG_POSTMASTER_SQL).with_timeout(1.0))
        .with_column(Column::new(
            "start_time_seconds",
            ColumnUsage::Gauge,
            "Time at which postmaster started",
        ))
        .with_ttl(300.0)
}

/// Built-in monitoring list.
#[must_use]
pub fn default_query_instances() -> QueryInstances {
    into_instances([
        pg_lock(),
        pg_database(),
        pg_stat_database(),
        pg_stat_activity(),
        pg_stat_replication(),
        pg_postmaster(),
    ])
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let instances = default_query_instances();
        assert_eq!(instances.len(), 6);
        for instance in instances.values() {
            assert!(instance.validate().is_ok(), "{} is invalid", instance.name);
        }
    }

    #[test]
    fn test_pg_lock_shape() {
        let instances = default_query_instances();
        let lock = instances.get("pg_lock");
        assert!(lock.is_some_and(|l| l.label_names() == ["server", "datname", "mode"]));
        // runs before the server version is known
        assert!(lock.is_some_and(|l| l.select_query(0, false).is_some()));
    }

    #[test]
    fn test_replication_primary_only() {
        let instances = default_query_instances();
        let Some(replication) = instances.get("pg_stat_replication") else {
            panic!("pg_stat_replication missing");
        };
        assert!(replication.select_query(130_000, false).is_none());
        assert!(
            replication
                .select_query(130_000, true)
                .is_some_and(|q| q.sql.contains("pg_wal_lsn_diff"))
        );
        assert!(
            replication
                .select_query(90_600, true)
                .is_some_and(|q| q.sql.contains("pg_xlog_location_diff"))
        );
    }
}
