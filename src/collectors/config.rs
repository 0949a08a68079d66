use std::time::Duration;

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60);
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Global knobs of the collection engine.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub disable_cache: bool,
    pub cache_ttl: Duration,
    /// Bound for variants that do not set their own timeout; zero is unbounded.
    pub default_timeout: Duration,
    /// Optional prefix for every metric name.
    pub namespace: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            disable_cache: false,
            cache_ttl: DEFAULT_CACHE_TTL,
            default_timeout: DEFAULT_QUERY_TIMEOUT,
            namespace: None,
        }
    }
}

impl ServerConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn with_cache_disabled(mut self, disabled: bool) -> Self {
        self.disable_cache = disabled;
        self
    }

    #[must_use]
    pub const fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    #[must_use]
    pub const fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_namespace(mut self, namespace: Option<String>) -> Self {
        self.namespace = namespace.filter(|ns| !ns.is_empty());
        self
    }

    /// Full metric name for `group` and `suffix`.
    #[must_use]
    pub fn metric_name(&self, group: &str, suffix: &str) -> String {
        match &self.namespace {
            Some(ns) => format!("{ns}_{group}_{suffix}"),
            None => format!("{group}_{suffix}"),
        }
    }
}
