use common::config::Config;
use db::DatabaseConnection;
use tracing::{info, instrument, warn};

/// Run a single scheduled-mode prune pass.
#[instrument(skip_all, err)]
pub(crate) async fn prune(config: Config, database: DatabaseConnection) -> Result<(), anyhow::Error> {
    let engine = super::build_engine(config, database)?;

    let summary = engine.prune_all_untagged().await?;

    info!(
        total = summary.total_found,
        succeeded = summary.success_count,
        failed = summary.error_count,
        "prune finished"
    );

    for error in &summary.errors {
        warn!(%error, "prune error");
    }

    Ok(())
}
