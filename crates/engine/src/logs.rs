//! Log transport.
//!
//! Adapts the daemon's multiplexed log framing onto the client-visible event
//! records of [`crate::events`]. Frames are delivered in daemon-emission
//! order; stdout and stderr keep the daemon's interleaving.

use std::{
    pin::Pin,
    task::{Context, Poll},
};

use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;

use crate::{
    docker::LogStreamOptions, error::Error, events::LogEvent, logmux::Demuxer, store, Engine,
};

/// Trailing lines included when the caller does not ask for a count.
pub const TAIL_DEFAULT: u32 = 100;

/// Upper bound on the requested tail.
pub const TAIL_MAX: u32 = 10_000;

/// Options of a runtime log stream request.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogStreamRequest {
    /// Trailing lines to start from. Clamped to [`TAIL_MAX`].
    pub tail: Option<u32>,

    /// Unix timestamp lower bound.
    pub since: Option<i64>,

    /// Ask the daemon to prefix each line with its own timestamp.
    pub timestamps: bool,
}

/// Live runtime log stream of one container.
///
/// Dropping the stream tears down the underlying daemon connection.
#[derive(Debug)]
pub struct RuntimeLogStream {
    events: mpsc::UnboundedReceiver<LogEvent>,
}

impl RuntimeLogStream {
    pub async fn next_event(&mut self) -> Option<LogEvent> {
        self.events.recv().await
    }
}

impl Stream for RuntimeLogStream {
    type Item = LogEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_recv(cx)
    }
}

impl Engine {
    /// Follow a project's container output as decoded log events.
    pub async fn stream_runtime_logs(
        &self,
        project_id: i64,
        request: LogStreamRequest,
    ) -> Result<RuntimeLogStream, Error> {
        let project = store::by_id(&*self.db, project_id)
            .await?
            .ok_or(Error::NotFound("project"))?;

        let container_id = project
            .container_id
            .ok_or_else(|| Error::BadRequest(String::from("project has no container")))?;

        let tail = request.tail.unwrap_or(TAIL_DEFAULT).min(TAIL_MAX);

        let mut upstream = self
            .docker
            .container_logs(
                &container_id,
                LogStreamOptions {
                    follow: true,
                    tail: Some(tail),
                    since: request.since,
                    timestamps: request.timestamps,
                },
            )
            .await?;

        let (sender, events) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut demuxer = Demuxer::new();

            while let Some(item) = upstream.next().await {
                let chunk = match item {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        let _ = sender.send(LogEvent::Error {
                            message: err.to_string(),
                        });
                        return;
                    }
                };

                let frames = match demuxer.feed(&chunk) {
                    Ok(frames) => frames,
                    Err(err) => {
                        let _ = sender.send(LogEvent::Error {
                            message: err.to_string(),
                        });
                        return;
                    }
                };

                for frame in frames {
                    let event = LogEvent::frame(
                        frame.kind.as_str(),
                        String::from_utf8_lossy(&frame.payload).into_owned(),
                    );

                    if sender.send(event).is_err() {
                        // Consumer disconnected. Returning drops the upstream
                        // byte stream and with it the daemon connection.
                        return;
                    }
                }
            }

            let _ = sender.send(LogEvent::End);
        });

        Ok(RuntimeLogStream { events })
    }

    /// Stored build output of a past deploy.
    pub async fn build_logs(&self, project_id: i64) -> Result<String, Error> {
        let project = store::by_id(&*self.db, project_id)
            .await?
            .ok_or(Error::NotFound("project"))?;

        Ok(project.build_logs.unwrap_or_default())
    }
}
