use db::DbErr;
use derive_more::{Display, Error, From};

use crate::{docker, fetch::FetchError};

/// Deployment engine errors.
///
/// These are kinds, not transports: the HTTP façade maps them onto status
/// codes, the engine itself never sees a request.
#[derive(Debug, Display, Error, From)]
pub enum Error {
    /// Database-related error.
    Database(DbErr),

    /// Container daemon error that no other kind accounts for.
    Daemon(docker::Error),

    /// Repository fetch error.
    Fetch(FetchError),

    /// The named entity does not exist.
    #[display(fmt = "{} not found", _0)]
    #[from(ignore)]
    NotFound(#[error(not(source))] &'static str),

    /// The caller is not permitted to perform the operation.
    #[display(fmt = "forbidden")]
    Forbidden,

    /// Unique-name or duplicate-label collision.
    #[display(fmt = "conflict: {}", _0)]
    #[from(ignore)]
    Conflict(#[error(not(source))] String),

    /// Structurally invalid input.
    #[display(fmt = "bad request: {}", _0)]
    #[from(ignore)]
    BadRequest(#[error(not(source))] String),

    /// The image build ended in an error event.
    ///
    /// Carries the accumulated build output alongside the daemon's message
    /// so callers can surface both.
    #[display(fmt = "build failed: {}", message)]
    BuildFailure { message: String, logs: String },
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
            || matches!(self, Self::Daemon(err) if err.is_not_found())
    }
}
