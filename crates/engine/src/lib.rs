//! # Deployment engine
//!
//! Control plane for containerized classroom projects on a single shared
//! container host. Given a team and a Git repository, the engine clones,
//! builds, runs, exposes, monitors, reclaims, and tags the team's
//! application while keeping the persisted project records consistent with
//! the daemon's world state.
//!
//! The [`Engine`] value owns every external handle (container daemon,
//! database, configuration, repository fetcher) and is cheap to clone;
//! periodic jobs are started from it explicitly via [`Engine::start_jobs`].

pub mod adopt;
pub mod deploy;
pub mod docker;
pub mod events;
pub mod fetch;
pub mod jobs;
pub mod logmux;
pub mod logs;
pub mod naming;
pub mod prune;
pub mod reconcile;
pub mod tags;

mod auth;
mod error;
mod store;

#[cfg(test)]
mod testing;

use std::sync::Arc;

use common::config;
use db::DatabaseConnection;

pub use error::Error;

/// Deployment engine handle.
#[derive(Clone)]
pub struct Engine {
    docker: Arc<dyn docker::ContainerDaemon>,
    db: Arc<DatabaseConnection>,
    config: Arc<config::Engine>,
    fetcher: Arc<dyn fetch::SourceFetcher>,
}

impl Engine {
    /// Create an engine over the given daemon and database, fetching
    /// repositories with `git`.
    pub fn new(
        docker: Arc<dyn docker::ContainerDaemon>,
        db: Arc<DatabaseConnection>,
        config: config::Engine,
    ) -> Self {
        Self {
            docker,
            db,
            config: Arc::new(config),
            fetcher: Arc::new(fetch::GitFetcher),
        }
    }

    /// Replace the repository fetcher.
    pub fn with_fetcher(mut self, fetcher: Arc<dyn fetch::SourceFetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }
}
