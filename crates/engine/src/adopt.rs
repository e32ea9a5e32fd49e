//! Foreign container adoption.
//!
//! Containers started outside the control plane (instructor demos, manually
//! launched services) can be brought under management: the container is
//! attached to the shared network under a unique team-derived alias and a
//! project row is upserted from its observed state, keyed by container id.

use std::collections::HashSet;

use db::{
    project::{self, Status},
    sea_query::Expr,
    team, ActiveValue, ColumnTrait, EntityTrait, PrimitiveDateTime, QueryFilter,
};
use time::{format_description::well_known::Rfc3339, OffsetDateTime, UtcOffset};
use tracing::{info, instrument, warn};

use crate::{
    docker::{ContainerInfo, ContainerSummary},
    error::Error,
    naming, store, Engine,
};

/// Result of adopting a foreign container.
#[derive(Clone, Debug)]
pub struct AdoptionReport {
    /// The upserted project row.
    pub project: project::Model,

    /// Alias the container answers to on the shared network.
    pub alias: String,

    /// Whether a new project row was inserted rather than updated.
    pub created: bool,
}

fn parse_created_at(created_at: Option<&str>) -> PrimitiveDateTime {
    created_at
        .and_then(|ts| OffsetDateTime::parse(ts, &Rfc3339).ok())
        .map(|ts| {
            let utc = ts.to_offset(UtcOffset::UTC);
            PrimitiveDateTime::new(utc.date(), utc.time())
        })
        .unwrap_or_else(store::now)
}

impl Engine {
    /// Adopt the container named `project_name` into `team_id`.
    #[instrument(skip_all, fields(container = project_name, team = team_id))]
    pub async fn migrate_project_container(
        &self,
        project_name: &str,
        team_id: i64,
        github_url: Option<String>,
        deployed_by_id: Option<i64>,
    ) -> Result<AdoptionReport, Error> {
        let team = team::Entity::find_by_id(team_id)
            .one(&*self.db)
            .await?
            .ok_or(Error::NotFound("team"))?;

        let summary = self
            .find_container_by_name(project_name)
            .await?
            .ok_or(Error::NotFound("container"))?;

        self.ensure_network().await?;

        let base = naming::normalized_team_name(&team.name);
        let alias = self.allocate_alias(&base, &summary.id).await?;

        self.attach_with_alias(&summary.id, &alias).await?;

        let info = self.docker.inspect_container(&summary.id).await?;

        // Resolve the configured reference to a content hash; an image that
        // was since untagged still has its raw id.
        let image_hash = match self.docker.inspect_image(&info.image).await {
            Ok(image) => image.id,
            Err(_) => info.image_id.clone(),
        };

        let (project, created) = self
            .upsert_adopted(&team, &info, image_hash, github_url, deployed_by_id)
            .await?;

        info!(project = project.id, alias = %alias, "container adopted");

        Ok(AdoptionReport {
            project,
            alias,
            created,
        })
    }

    async fn find_container_by_name(
        &self,
        name: &str,
    ) -> Result<Option<ContainerSummary>, Error> {
        let wanted = name.trim_start_matches('/');

        let containers = self.docker.list_containers(true).await?;

        Ok(containers.into_iter().find(|container| {
            container
                .names
                .iter()
                .any(|candidate| candidate.trim_start_matches('/') == wanted)
        }))
    }

    /// Pick `base`, or `base-{4 hex}` when taken, scanning the alias lists of
    /// every other container on the shared network.
    async fn allocate_alias(&self, base: &str, container_id: &str) -> Result<String, Error> {
        let in_use = self.network_aliases_in_use(container_id).await?;

        if !in_use.contains(base) {
            return Ok(base.to_string());
        }

        for _ in 0..10 {
            let candidate = format!("{base}-{}", naming::alias_suffix());

            if !in_use.contains(&candidate) {
                return Ok(candidate);
            }
        }

        Err(Error::Conflict(format!(
            "unable to allocate a unique alias for {base}"
        )))
    }

    async fn network_aliases_in_use(&self, exclude: &str) -> Result<HashSet<String>, Error> {
        let network = match self
            .docker
            .inspect_network(&self.config.projects_network)
            .await
        {
            Ok(network) => network,
            Err(err) if err.is_not_found() => return Ok(HashSet::new()),
            Err(err) => return Err(Error::Daemon(err)),
        };

        let mut aliases = HashSet::new();

        for container_id in network.container_ids {
            if container_id == exclude {
                continue;
            }

            match self.docker.inspect_container(&container_id).await {
                Ok(info) => {
                    if let Some(list) = info.network_aliases.get(&self.config.projects_network) {
                        aliases.extend(list.iter().cloned());
                    }
                }
                // Disappeared mid-scan; its aliases went with it.
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(Error::Daemon(err)),
            }
        }

        Ok(aliases)
    }

    /// Connect the container under `alias`, reconnecting when it is already
    /// attached under some other alias.
    async fn attach_with_alias(&self, container_id: &str, alias: &str) -> Result<(), Error> {
        let network = &self.config.projects_network;

        let info = self.docker.inspect_container(container_id).await?;

        match info.network_aliases.get(network) {
            None => {
                self.docker
                    .connect_network(network, container_id, &[alias.to_string()])
                    .await?;
            }
            Some(aliases) if aliases.iter().any(|current| current == alias) => {}
            Some(_) => {
                if let Err(err) = self.docker.disconnect_network(network, container_id).await {
                    warn!(container = container_id, %err, "unable to disconnect before realiasing");
                }

                self.docker
                    .connect_network(network, container_id, &[alias.to_string()])
                    .await?;
            }
        }

        Ok(())
    }

    async fn upsert_adopted(
        &self,
        team: &team::Model,
        info: &ContainerInfo,
        image_hash: String,
        github_url: Option<String>,
        deployed_by_id: Option<i64>,
    ) -> Result<(project::Model, bool), Error> {
        let status = if info.running {
            Status::Running
        } else {
            Status::Stopped
        };

        if let Some(existing) = store::by_container_id(&*self.db, &info.id).await? {
            // Re-adoption: refresh observed state, keep the original
            // deployment timestamp, and move teams when asked to.
            let mut update = project::Entity::update_many()
                .filter(project::Column::Id.eq(existing.id))
                .col_expr(project::Column::TeamId, team.id.into())
                .col_expr(project::Column::ImageHash, image_hash.into())
                .col_expr(
                    project::Column::ContainerName,
                    Expr::value(Some(info.name.clone())),
                )
                .col_expr(project::Column::Ports, Expr::value(info.ports.clone()))
                .col_expr(project::Column::Status, status.into());

            if let Some(deployed_by) = deployed_by_id {
                update = update.col_expr(
                    project::Column::DeployedById,
                    Expr::value(Some(deployed_by)),
                );
            }

            if let Some(github_url) = github_url {
                update = update.col_expr(project::Column::GithubUrl, github_url.into());
            }

            if status == Status::Running {
                update = update.col_expr(
                    project::Column::StoppedAt,
                    Expr::value(Option::<PrimitiveDateTime>::None),
                );
            }

            update.exec(&*self.db).await?;

            let project = store::by_id(&*self.db, existing.id)
                .await?
                .ok_or(Error::NotFound("project"))?;

            return Ok((project, false));
        }

        let project = project::Entity::insert(project::ActiveModel {
            team_id: ActiveValue::Set(team.id),
            deployed_by_id: ActiveValue::Set(deployed_by_id),
            github_url: ActiveValue::Set(github_url.unwrap_or_default()),
            image_hash: ActiveValue::Set(image_hash),
            container_id: ActiveValue::Set(Some(info.id.clone())),
            container_name: ActiveValue::Set(Some(info.name.clone())),
            status: ActiveValue::Set(status),
            ports: ActiveValue::Set(info.ports.clone()),
            build_args: ActiveValue::Set(serde_json::json!({})),
            env_vars: ActiveValue::Set(serde_json::json!({})),
            deployed_at: ActiveValue::Set(parse_created_at(info.created_at.as_deref())),
            ..Default::default()
        })
        .exec_with_returning(&*self.db)
        .await?;

        Ok((project, true))
    }
}
