use crate::{cli::actions::Action, collectors::ServerConfig};
use anyhow::{Result, anyhow};
use clap::ArgMatches;
use secrecy::SecretString;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

/// # Errors
///
/// Returns an error if required arguments are missing or out of range
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    // Get the port or return an error
    let port = matches
        .get_one::<u16>("port")
        .copied()
        .ok_or_else(|| anyhow!("Port is required. Please provide it using the --port flag."))?;

    // Get the listen address (None means auto-detect)
    let listen = matches
        .get_one::<String>("listen")
        .map(std::string::ToString::to_string);

    // Get the DSN or return an error
    let dsn = SecretString::from(
        matches
            .get_one::<String>("dsn")
            .cloned()
            .ok_or_else(|| anyhow!("DSN is required. Please provide it using the --dsn flag."))?,
    );

    let queries = matches.get_one::<PathBuf>("queries").cloned();
    let disabled_queries = get_disabled_queries(matches);

    if !disabled_queries.is_empty() {
        info!("Disabled query groups: {:?}", disabled_queries);
    }

    Ok(Action::Run {
        port,
        listen,
        dsn,
        queries,
        disabled_queries,
        config: server_config(matches)?,
    })
}

fn server_config(matches: &ArgMatches) -> Result<ServerConfig> {
    let seconds = |name: &str| -> Result<Duration> {
        let secs = matches.get_one::<f64>(name).copied().unwrap_or_default();
        Duration::try_from_secs_f64(secs).map_err(|e| anyhow!("invalid --{name}: {e}"))
    };

    Ok(ServerConfig::new()
        .with_cache_disabled(matches.get_flag("disable-cache"))
        .with_cache_ttl(seconds("cache-ttl")?)
        .with_default_timeout(seconds("timeout")?)
        .with_namespace(matches.get_one::<String>("namespace").cloned()))
}

#[must_use]
pub fn get_disabled_queries(matches: &ArgMatches) -> Vec<String> {
    matches
        .get_many::<String>("disable-query")
        .map(|vals| {
            vals.map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}
