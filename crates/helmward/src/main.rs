mod cli;
mod commands;

use clap::Parser;
use cli::{Cli, Command};
use common::{config::Config, logging};
use db::Database;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    let config = Config::new(cli.config)?;

    logging::init(&config);

    info!("connecting to database");
    let database = Database::connect(&config.database.url).await?;

    match cli.command {
        Command::Serve => commands::serve(config, database).await?,
        Command::Prune => commands::prune(config, database).await?,
        Command::MigrateContainer(args) => {
            commands::migrate_container(config, database, args).await?
        }
    }

    Ok(())
}
