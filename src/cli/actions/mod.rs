pub mod run;

use crate::collectors::ServerConfig;
use secrecy::SecretString;
use std::path::PathBuf;

#[derive(Debug)]
pub enum Action {
    Run {
        port: u16,
        listen: Option<String>,
        dsn: SecretString,
        queries: Option<PathBuf>,
        disabled_queries: Vec<String>,
        config: ServerConfig,
    },
}
