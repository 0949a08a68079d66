use crate::cli::actions::Action;
use crate::exporter::{ExporterOptions, new};
use anyhow::Result;

/// Handle the run action
///
/// # Errors
///
/// Returns an error if the exporter fails to start
pub async fn handle(action: Action) -> Result<()> {
    match action {
        Action::Run {
            port,
            listen,
            dsn,
            queries,
            disabled_queries,
            config,
        } => {
            let options = ExporterOptions {
                config,
                queries,
                disabled_queries,
            };
            new(port, listen, dsn, options).await?;
        }
    }

    Ok(())
}
