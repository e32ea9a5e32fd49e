/// Background job runner.
mod serve;

/// One-shot prune.
mod prune;

/// Foreign container adoption.
mod migrate;

use std::sync::Arc;

use common::config::Config;
use db::DatabaseConnection;
use engine::{docker, Engine};

pub(crate) use migrate::migrate_container;
pub(crate) use prune::prune;
pub(crate) use serve::serve;

fn build_engine(config: Config, database: DatabaseConnection) -> Result<Engine, anyhow::Error> {
    let docker = Arc::new(docker::Client::connect()?);

    Ok(Engine::new(docker, Arc::new(database), config.engine))
}
