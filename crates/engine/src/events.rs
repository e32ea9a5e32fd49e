//! Client-visible event records.
//!
//! The HTTP façade relays these as-is; the engine itself knows nothing about
//! transport framing beyond the serialized shape.

use db::project;
use serde::Serialize;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

/// Events emitted by a streaming deploy.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DeployEvent {
    /// The deploy was accepted and the build is about to begin.
    Start { project: project::Model },

    /// One chunk of build output.
    Log { data: String },

    /// The container is running; carries the final project state.
    Complete { project: project::Model },

    /// The deploy failed.
    Error { message: String },
}

/// Events emitted by a runtime log stream.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LogEvent {
    /// One decoded log frame, attributed to its source stream.
    Log {
        stream: &'static str,
        data: String,
        timestamp: String,
    },

    /// The container's log stream ended.
    End,

    /// The upstream connection failed.
    Error { message: String },
}

impl LogEvent {
    /// Build a log event stamped with the current wall-clock time.
    pub(crate) fn frame(stream: &'static str, data: String) -> Self {
        let timestamp = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_default();

        Self::Log {
            stream,
            data,
            timestamp,
        }
    }
}
