use clap::{
    Arg, ArgAction, ColorChoice, Command,
    builder::{
        ValueParser,
        styling::{AnsiColor, Effects, Styles},
    },
};
use std::path::PathBuf;

pub mod built_info {
    #![allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const DEFAULT_PORT: u16 = 9187;

fn version() -> &'static str {
    match built_info::GIT_COMMIT_HASH_SHORT {
        Some(hash) => Box::leak(format!("{} - {hash}", built_info::PKG_VERSION).into_boxed_str()),
        None => built_info::PKG_VERSION,
    }
}

fn validator_seconds() -> ValueParser {
    ValueParser::from(|s: &str| -> Result<f64, String> {
        match s.parse::<f64>() {
            Ok(secs) if secs.is_finite() && secs >= 0.0 => Ok(secs),
            _ => Err(format!("invalid number of seconds: {s}")),
        }
    })
}

#[must_use]
pub fn new() -> Command {
    let styles = Styles::styled()
        .header(AnsiColor::Yellow.on_default() | Effects::BOLD)
        .usage(AnsiColor::Green.on_default() | Effects::BOLD)
        .literal(AnsiColor::Blue.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Green.on_default());

    Command::new(env!("CARGO_PKG_NAME"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .version(version())
        .color(ColorChoice::Auto)
        .styles(styles)
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .help("Port to listen on")
                .default_value("9187")
                .env("PG_QUERY_EXPORTER_PORT")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new("listen")
                .short('l')
                .long("listen")
                .help("IP address to bind to (default: [::]:port, falls back to 0.0.0.0)")
                .env("PG_QUERY_EXPORTER_LISTEN")
                .value_name("IP"),
        )
        .arg(
            Arg::new("dsn")
                .long("dsn")
                .help("Database connection string (URL or key=value form)")
                .default_value("postgresql://postgres@localhost:5432/postgres?sslmode=disable")
                .env("PG_QUERY_EXPORTER_DSN")
                .hide_env_values(true),
        )
        .arg(
            Arg::new("queries")
                .short('q')
                .long("queries")
                .help("JSON file with query group definitions (built-in groups when absent)")
                .env("PG_QUERY_EXPORTER_QUERIES")
                .value_name("FILE")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("disable-cache")
                .long("disable-cache")
                .help("Always query the database instead of serving cached results")
                .env("PG_QUERY_EXPORTER_DISABLE_CACHE")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("cache-ttl")
                .long("cache-ttl")
                .help("Seconds a query group result is served from cache")
                .default_value("60")
                .env("PG_QUERY_EXPORTER_CACHE_TTL")
                .value_parser(validator_seconds()),
        )
        .arg(
            Arg::new("timeout")
                .long("timeout")
                .help("Default per-query timeout in seconds, 0 for none")
                .default_value("10")
                .env("PG_QUERY_EXPORTER_TIMEOUT")
                .value_parser(validator_seconds()),
        )
        .arg(
            Arg::new("namespace")
                .long("namespace")
                .help("Prefix for every exported query metric")
                .env("PG_QUERY_EXPORTER_NAMESPACE"),
        )
        .arg(
            Arg::new("disable-query")
                .long("disable-query")
                .help("Query groups to skip, comma separated")
                .env("PG_QUERY_EXPORTER_DISABLE_QUERY")
                .value_delimiter(',')
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new("verbosity")
                .short('v')
                .long("verbose")
                .help("Increase verbosity, -vv for debug")
                .action(ArgAction::Count),
        )
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn test_command_defaults() {
        let matches = new().try_get_matches_from(vec!["pg_query_exporter"]);
        let Ok(matches) = matches else {
            panic!("default arguments must parse");
        };

        assert_eq!(matches.get_one::<u16>("port").copied(), Some(DEFAULT_PORT));
        assert_eq!(matches.get_one::<f64>("cache-ttl").copied(), Some(60.0));
        assert_eq!(matches.get_one::<f64>("timeout").copied(), Some(10.0));
        assert!(!matches.get_flag("disable-cache"));
        assert!(matches.get_one::<PathBuf>("queries").is_none());
        assert_eq!(matches.get_count("verbosity"), 0);
    }

    #[test]
    fn test_command_flags() {
        let matches = new().try_get_matches_from(vec![
            "pg_query_exporter",
            "--port",
            "9999",
            "--queries",
            "/etc/pg_query_exporter/queries.json",
            "--disable-query",
            "pg_lock,pg_database",
            "--timeout",
            "0",
            "-vv",
        ]);
        let Ok(matches) = matches else {
            panic!("arguments must parse");
        };

        assert_eq!(matches.get_one::<u16>("port").copied(), Some(9999));
        let disabled: Vec<&String> = matches
            .get_many::<String>("disable-query")
            .map(Iterator::collect)
            .unwrap_or_default();
        assert_eq!(disabled, ["pg_lock", "pg_database"]);
        assert_eq!(matches.get_one::<f64>("timeout").copied(), Some(0.0));
        assert_eq!(matches.get_count("verbosity"), 2);
    }

    #[test]
    fn test_command_rejects_negative_seconds() {
        let result = new().try_get_matches_from(vec!["pg_query_exporter", "--cache-ttl", "-1"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_command_rejects_invalid_port() {
        let result = new().try_get_matches_from(vec!["pg_query_exporter", "--port", "70000"]);
        assert!(result.is_err());
    }
}
