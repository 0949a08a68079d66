//! Query-to-metric engine: query group definitions, value coercion, the
//! metric cache and the [`Server`] that ties them to a database connection.

pub mod cache;
pub mod config;
pub mod database;
pub mod defaults;
pub mod error;
pub mod exporter;
pub mod fingerprint;
pub mod instance;
pub mod metric;
pub mod mock;
pub mod server;
pub mod util;
pub mod value;

pub use config::ServerConfig;
pub use database::{Database, PgDatabase};
pub use error::{QueryError, RowConversionError};
pub use instance::{QueryInstance, QueryInstanceMap};
pub use metric::{MetricKind, MetricObservation};
pub use server::{QueryOutcome, ScrapeReport, Server};
pub use value::{ColumnValue, RawRow};
