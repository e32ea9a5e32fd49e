use common::config::Config;
use db::DatabaseConnection;
use tracing::{info, instrument};

use crate::cli::MigrateContainerArgs;

/// Adopt a foreign container into the control plane.
#[instrument(skip_all, err)]
pub(crate) async fn migrate_container(
    config: Config,
    database: DatabaseConnection,
    args: MigrateContainerArgs,
) -> Result<(), anyhow::Error> {
    let engine = super::build_engine(config, database)?;

    let report = engine
        .migrate_project_container(&args.name, args.team_id, args.github_url, args.deployed_by)
        .await?;

    info!(
        project = report.project.id,
        alias = %report.alias,
        created = report.created,
        "container adopted"
    );

    Ok(())
}
