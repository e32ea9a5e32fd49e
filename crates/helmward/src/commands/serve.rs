use common::config::Config;
use db::DatabaseConnection;
use tracing::{info, instrument};

/// Run the reconciler and pruner until interrupted.
#[instrument(skip_all, err)]
pub(crate) async fn serve(config: Config, database: DatabaseConnection) -> Result<(), anyhow::Error> {
    let engine = super::build_engine(config, database)?;

    let jobs = engine.start_jobs();

    info!("deployment engine started");

    tokio::signal::ctrl_c().await?;

    info!("shutting down");
    jobs.stop();

    Ok(())
}
