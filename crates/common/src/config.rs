use std::path::PathBuf;

use byte_unit::n_mib_bytes;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;

#[cfg(feature = "logging")]
use tracing_subscriber::filter::LevelFilter;

/// Database configuration.
#[derive(Deserialize)]
pub struct Database {
    /// Database URL string.
    pub url: String,
}

/// Implementation of [`serde`]'s deserializer for [`FromStr`] types.
#[cfg(feature = "logging")]
fn deserialize_from_str<'de, T, D>(deserializer: D) -> Result<T, D::Error>
where
    T: std::str::FromStr,
    T::Err: std::error::Error,
    D: serde::de::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    std::str::FromStr::from_str(&s).map_err(serde::de::Error::custom)
}

/// Logging configuration.
#[cfg(feature = "logging")]
#[derive(Deserialize)]
pub struct Logging {
    /// Log level.
    #[serde(deserialize_with = "deserialize_from_str")]
    pub level: LevelFilter,
}

#[cfg(feature = "logging")]
impl Default for Logging {
    fn default() -> Self {
        Self {
            level: LevelFilter::WARN,
        }
    }
}

/// Deployment engine configuration.
#[derive(Deserialize)]
pub struct Engine {
    /// Name of the shared bridge network hosting all deployed containers.
    #[serde(default = "default_projects_network")]
    pub projects_network: String,

    /// In-container directory under which uploaded data files are mounted.
    #[serde(default = "default_data_mount_path")]
    pub data_mount_path: String,

    /// Directory in which this process observes uploaded data files.
    #[serde(default = "default_container_data_dir")]
    pub container_data_dir: PathBuf,

    /// Directory in which the container host observes the same data files.
    ///
    /// Set this when the engine itself runs inside a container and passes
    /// bind-mount paths to a daemon that resolves them on the host.
    #[serde(default)]
    pub host_data_dir: Option<PathBuf>,

    /// Seconds between lifecycle reconciliation passes.
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval: u64,

    /// Local wall-clock time (`HH:MM`) of the daily prune run.
    #[serde(default = "default_prune_at")]
    pub prune_at: String,

    /// Memory cap applied to every deployed container, in bytes.
    #[serde(default = "default_memory_limit")]
    pub memory_limit: i64,

    /// Directory in which repository clones are staged.
    ///
    /// Defaults to the system temporary directory.
    #[serde(default)]
    pub clone_root: Option<PathBuf>,

    /// Sidecar database image for legacy two-container deploys, json variant.
    #[serde(default = "default_json_db_image")]
    pub json_db_image: String,

    /// Sidecar database image for legacy two-container deploys, sql variant.
    #[serde(default = "default_sql_db_image")]
    pub sql_db_image: String,
}

// Default values used for engine configuration.
fn default_projects_network() -> String {
    String::from("projects_network")
}

fn default_data_mount_path() -> String {
    String::from("/var/www")
}

fn default_container_data_dir() -> PathBuf {
    PathBuf::from("/app/data/project-data-files")
}

fn default_reconcile_interval() -> u64 {
    30
}

fn default_prune_at() -> String {
    String::from("02:00")
}

fn default_memory_limit() -> i64 {
    n_mib_bytes!(800) as i64
}

fn default_json_db_image() -> String {
    String::from("helmward/json-db:latest")
}

fn default_sql_db_image() -> String {
    String::from("helmward/sql-db:latest")
}

impl Default for Engine {
    fn default() -> Self {
        Self {
            projects_network: default_projects_network(),
            data_mount_path: default_data_mount_path(),
            container_data_dir: default_container_data_dir(),
            host_data_dir: None,
            reconcile_interval: default_reconcile_interval(),
            prune_at: default_prune_at(),
            memory_limit: default_memory_limit(),
            clone_root: None,
            json_db_image: default_json_db_image(),
            sql_db_image: default_sql_db_image(),
        }
    }
}

/// General configuration.
#[derive(Deserialize)]
pub struct Config {
    /// General database configuration.
    pub database: Database,

    /// Logging configuration.
    #[cfg(feature = "logging")]
    #[serde(default)]
    pub logging: Logging,

    /// Deployment engine configuration.
    #[serde(default)]
    pub engine: Engine,
}

impl Config {
    /// Create new config using default configuration file or environment variables.
    ///
    /// See [`Env`] for more details on how to use environment variables configuration.
    ///
    /// [`Env`]: figment::providers::Env
    pub fn new(path: Option<PathBuf>) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path.unwrap_or(PathBuf::from("Config.toml"))))
            .merge(Env::prefixed("CONFIG_").split("_"))
            .extract()
    }
}
