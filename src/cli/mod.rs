pub mod actions;
pub mod commands;
pub mod dispatch;
pub mod telemetry;

use crate::cli::actions::Action;
use anyhow::Result;

/// Parse the command line, set up logging and tracing, and return the
/// action to run.
///
/// # Errors
///
/// Returns an error if telemetry cannot be initialized or an argument is
/// invalid.
pub fn start() -> Result<Action> {
    let matches = commands::new().get_matches();

    let verbosity = matches.get_count("verbosity");
    telemetry::init(telemetry::level_from_verbosity(verbosity))?;

    dispatch::handler(&matches)
}
