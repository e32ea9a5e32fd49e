//! Typed adapter over the container daemon API.
//!
//! The engine talks to the daemon exclusively through the [`ContainerDaemon`]
//! trait, which exposes only the operations the control plane needs. The
//! production implementation is [`Client`], backed by [`bollard`]; tests swap
//! in an in-memory daemon.

/// Bollard-backed daemon client.
mod client;

use std::{collections::HashMap, io, path::Path};

use async_trait::async_trait;
use bytes::Bytes;
use derive_more::{Display, Error};
use futures_util::stream::BoxStream;

pub use client::Client;

/// Daemon operation errors.
///
/// The variants the engine discriminates on are explicit: an absent resource
/// is not the same failure as a name collision or a redundant state change,
/// and several call sites treat the first and last as success.
#[derive(Debug, Display, Error)]
pub enum Error {
    /// The referenced image, container, or network does not exist.
    #[display(fmt = "not found: {}", _0)]
    NotFound(#[error(not(source))] String),

    /// Name collision or resource still in use.
    #[display(fmt = "conflict: {}", _0)]
    Conflict(#[error(not(source))] String),

    /// The container is already in the requested state.
    #[display(fmt = "already in desired state")]
    AlreadyInDesiredState,

    /// Any other daemon-side failure.
    #[display(fmt = "daemon error: {}", _0)]
    Api(#[error(not(source))] String),

    /// IO-related error.
    Io(io::Error),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// Whether a stop or kill failed only because there is nothing to stop.
    pub fn is_benign_stop(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::AlreadyInDesiredState)
            || matches!(self, Self::Conflict(message) if message.contains("not running"))
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

/// A single event of an image build stream.
///
/// The stream terminates on success or error; the final event of a failed
/// build carries the daemon's message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BuildEvent {
    /// Verbatim build output.
    Stream(String),

    /// Step status, e.g. layer download progress.
    Status {
        status: String,
        progress: Option<String>,
    },

    /// Build failure message.
    Error(String),
}

impl BuildEvent {
    /// Render the event the way it is accumulated into persisted build logs
    /// and relayed to streaming clients.
    pub fn log_text(&self) -> String {
        match self {
            Self::Stream(text) => text.clone(),
            Self::Status { status, progress } => match progress {
                Some(progress) => format!("{status} {progress}\n"),
                None => format!("{status}\n"),
            },
            Self::Error(message) => format!("ERROR: {message}"),
        }
    }
}

/// Image metadata.
#[derive(Clone, Debug)]
pub struct ImageInfo {
    /// Content identifier, e.g. `sha256:…`.
    pub id: String,
}

/// One entry of a container listing.
#[derive(Clone, Debug)]
pub struct ContainerSummary {
    pub id: String,
    /// Names as reported by the daemon, each with a leading `/`.
    pub names: Vec<String>,
    /// Image reference the container was created from.
    pub image: String,
    /// Content identifier of that image.
    pub image_id: String,
    pub running: bool,
}

/// Inspected container state.
#[derive(Clone, Debug)]
pub struct ContainerInfo {
    pub id: String,
    /// Daemon-reported name, with a leading `/`.
    pub name: String,
    pub running: bool,
    /// Image reference from the container configuration.
    pub image: String,
    /// Content identifier of the backing image.
    pub image_id: String,
    /// Creation timestamp as reported by the daemon (RFC 3339).
    pub created_at: Option<String>,
    /// Port mapping snapshot.
    pub ports: Option<serde_json::Value>,
    /// Network aliases, keyed by network name.
    pub network_aliases: HashMap<String, Vec<String>>,
}

impl ContainerInfo {
    /// Container name without the daemon's leading slash.
    pub fn short_name(&self) -> &str {
        self.name.strip_prefix('/').unwrap_or(&self.name)
    }
}

/// Inspected network state.
#[derive(Clone, Debug)]
pub struct NetworkInfo {
    pub name: String,
    /// Identifiers of every connected container.
    pub container_ids: Vec<String>,
}

/// Container creation parameters.
#[derive(Clone, Debug, Default)]
pub struct ContainerSpec {
    pub name: String,
    /// Image reference or content identifier to run.
    pub image: String,
    /// Environment in `KEY=VALUE` form.
    pub env: Vec<String>,
    /// Command override.
    pub cmd: Option<Vec<String>>,
    /// Memory cap in bytes.
    pub memory_limit: i64,
    /// Network to attach at creation time.
    pub network: String,
    /// DNS aliases on that network.
    pub aliases: Vec<String>,
    /// Bind mounts in `host:container:mode` form.
    pub binds: Vec<String>,
}

/// Options for [`ContainerDaemon::container_logs`].
#[derive(Clone, Copy, Debug, Default)]
pub struct LogStreamOptions {
    pub follow: bool,
    /// Number of trailing lines to include; `None` requests the full log.
    pub tail: Option<u32>,
    /// Unix timestamp lower bound.
    pub since: Option<i64>,
    pub timestamps: bool,
}

/// Stream of build events.
pub type BuildEventStream = BoxStream<'static, Result<BuildEvent, Error>>;

/// Multiplexed log bytes as framed on the daemon connection.
pub type ByteStream = BoxStream<'static, Result<Bytes, Error>>;

/// The daemon operations the control plane depends on.
#[async_trait]
pub trait ContainerDaemon: Send + Sync {
    /// Build an image from a local context directory, streaming build events.
    async fn build_image(
        &self,
        context: &Path,
        tag: &str,
        build_args: &HashMap<String, String>,
    ) -> Result<BuildEventStream, Error>;

    async fn inspect_image(&self, reference: &str) -> Result<ImageInfo, Error>;

    /// Apply `repo:tag` to an existing image.
    async fn tag_image(&self, reference: &str, repo: &str, tag: &str) -> Result<(), Error>;

    async fn remove_image(&self, reference: &str) -> Result<(), Error>;

    async fn list_containers(&self, include_stopped: bool)
        -> Result<Vec<ContainerSummary>, Error>;

    async fn create_container(&self, spec: ContainerSpec) -> Result<String, Error>;

    async fn start_container(&self, id: &str) -> Result<(), Error>;

    /// Graceful stop with the daemon's default grace period.
    async fn stop_container(&self, id: &str) -> Result<(), Error>;

    /// Immediate kill.
    async fn kill_container(&self, id: &str) -> Result<(), Error>;

    async fn remove_container(&self, id: &str) -> Result<(), Error>;

    async fn inspect_container(&self, id: &str) -> Result<ContainerInfo, Error>;

    /// Raw multiplexed log stream, framed as described in [`crate::logmux`].
    async fn container_logs(
        &self,
        id: &str,
        options: LogStreamOptions,
    ) -> Result<ByteStream, Error>;

    async fn inspect_network(&self, name: &str) -> Result<NetworkInfo, Error>;

    /// Create a non-internal, attachable bridge network with default IPAM.
    async fn create_network(&self, name: &str) -> Result<(), Error>;

    async fn connect_network(
        &self,
        name: &str,
        container: &str,
        aliases: &[String],
    ) -> Result<(), Error>;

    async fn disconnect_network(&self, name: &str, container: &str) -> Result<(), Error>;
}
