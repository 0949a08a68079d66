//! `host:port` identity of a connection target, attached to every metric as
//! the `server` label.

use super::error::QueryError;
use url::Url;

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 5432;

const URL_SCHEMES: &[&str] = &["postgres", "postgresql", "opengauss"];

/// Derive the `host:port` fingerprint of a DSN in URL or keyword form.
///
/// # Errors
///
/// Returns [`QueryError::InvalidConnectionString`] when the DSN matches
/// neither form.
pub fn parse_fingerprint(dsn: &str) -> Result<String, QueryError> {
    if let Ok(url) = Url::parse(dsn)
        && URL_SCHEMES.contains(&url.scheme())
    {
        return Ok(from_url(&url));
    }

    from_keywords(dsn)
}

fn from_url(url: &Url) -> String {
    // unix socket DSNs carry host/port in the query string
    let param = |key: &str| {
        url.query_pairs()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
            .filter(|v| !v.is_empty())
    };

    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .map(str::to_string)
        .or_else(|| param("host"))
        .unwrap_or_else(|| DEFAULT_HOST.to_string());

    let port = url
        .port()
        .map(|p| p.to_string())
        .or_else(|| param("port"))
        .unwrap_or_else(|| DEFAULT_PORT.to_string());

    format!("{host}:{port}")
}

fn from_keywords(dsn: &str) -> Result<String, QueryError> {
    let mut host = None;
    let mut port = None;
    let mut pairs = 0;

    for token in dsn.split_whitespace() {
        let Some((key, value)) = token.split_once('=') else {
            return Err(QueryError::InvalidConnectionString(format!(
                "malformed token {token:?}"
            )));
        };
        pairs += 1;

        let value = value.trim_matches('\'');
        match key {
            "host" if !value.is_empty() => host = Some(value),
            "port" if !value.is_empty() => port = Some(value),
            _ => {}
        }
    }

    if pairs == 0 {
        return Err(QueryError::InvalidConnectionString(
            "empty connection string".to_string(),
        ));
    }

    let host = host.unwrap_or(DEFAULT_HOST);
    Ok(port.map_or_else(
        || format!("{host}:{DEFAULT_PORT}"),
        |port| format!("{host}:{port}"),
    ))
}
