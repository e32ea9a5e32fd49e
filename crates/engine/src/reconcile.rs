//! Lifecycle reconciler.
//!
//! Persisted `running` rows are only a claim about the world; containers die,
//! get OOM-killed, or are removed behind the control plane's back. Each pass
//! inspects every claimed container concurrently and demotes rows whose
//! container is gone or no longer running. The state machine forbids
//! resurrection, so racing a concurrent deploy is safe: both writers can only
//! move the row forward.

use db::project;
use futures_util::{stream::FuturesUnordered, StreamExt};
use tracing::{error, info, instrument, warn};

use crate::{error::Error, store, Engine};

/// Result of one reconciliation pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    /// Projects that claimed to be running.
    pub checked: usize,

    /// Projects demoted to `stopped` this pass.
    pub stopped: usize,
}

impl Engine {
    /// Run a single reconciliation pass.
    #[instrument(skip_all)]
    pub async fn reconcile(&self) -> Result<ReconcileSummary, Error> {
        let running = store::running(&*self.db).await?;
        let checked = running.len();

        let mut outcomes = running
            .into_iter()
            .map(|project| {
                let engine = self.clone();
                async move { engine.reconcile_project(project).await }
            })
            .collect::<FuturesUnordered<_>>();

        let mut stopped = 0;

        while let Some(demoted) = outcomes.next().await {
            if demoted {
                stopped += 1;
            }
        }

        if stopped > 0 {
            info!(checked, stopped, "reconciliation pass demoted projects");
        }

        Ok(ReconcileSummary { checked, stopped })
    }

    /// Returns whether the project was demoted to `stopped`.
    async fn reconcile_project(&self, project: project::Model) -> bool {
        let gone = match project.container_id.as_deref() {
            Some(container_id) => match self.docker.inspect_container(container_id).await {
                Ok(info) => !info.running,
                Err(err) if err.is_not_found() => true,
                Err(err) => {
                    // Anything else is a daemon hiccup; keep the row as-is.
                    warn!(project = project.id, %err, "unable to inspect container");
                    return false;
                }
            },
            None => true,
        };

        if !gone {
            return false;
        }

        match store::mark_stopped(&*self.db, project.id).await {
            Ok(()) => {
                info!(project = project.id, "container no longer running, marked stopped");
                true
            }
            Err(err) => {
                error!(project = project.id, %err, "unable to mark project stopped");
                false
            }
        }
    }
}
