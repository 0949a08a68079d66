use anyhow::Result;
use pg_query_exporter::cli::{actions, start, telemetry};

#[tokio::main]
async fn main() -> Result<()> {
    let action = start()?;

    let result = actions::run::handle(action).await;

    telemetry::shutdown_tracer();

    result
}
