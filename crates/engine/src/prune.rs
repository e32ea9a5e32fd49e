//! Pruning engine.
//!
//! Untagged projects that are no longer running accumulate containers,
//! images, and data files on the shared host. The pruner reclaims them while
//! protecting every image still referenced by a running or tagged project.
//! Candidates are pruned concurrently; one failure never affects another.

use std::{collections::HashSet, path::Path, sync::Arc};

use db::{
    project::{self, Status},
    sea_orm::Condition,
    ColumnTrait, ConnectionTrait, DbErr, EntityTrait, QueryFilter, QuerySelect, SelectExt,
};
use futures_util::{stream::FuturesUnordered, StreamExt};
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::{deploy::resolve_host_path, docker, error::Error, store, Engine};

/// Aggregate result of a prune run.
#[derive(Clone, Debug, Default, Serialize)]
pub struct PruneSummary {
    pub total_found: usize,
    pub success_count: usize,
    pub error_count: usize,
    pub errors: Vec<String>,
}

/// Whether one identifier is a prefix of the other, in either direction.
///
/// The daemon reports image identity inconsistently between listings and
/// inspections (`sha256:`-prefixed, truncated, or bare), so reference
/// comparison is by mutual prefix.
fn hash_prefix_match(left: &str, right: &str) -> bool {
    !left.is_empty() && !right.is_empty() && (left.starts_with(right) || right.starts_with(left))
}

/// Whether any other project still pins this image right now.
///
/// Re-checked after the protected-set snapshot so a deploy that raced the
/// pruner does not lose its image.
async fn image_protected_elsewhere<C: ConnectionTrait + Send>(
    db: &C,
    project_id: i64,
    image_hash: &str,
) -> Result<bool, DbErr> {
    project::Entity::find()
        .select_only()
        .filter(project::Column::Id.ne(project_id))
        .filter(project::Column::ImageHash.eq(image_hash))
        .filter(
            Condition::any()
                .add(project::Column::Status.eq(Status::Running))
                .add(
                    Condition::all()
                        .add(project::Column::Tag.is_not_null())
                        .add(project::Column::Status.ne(Status::Pruned)),
                ),
        )
        .exists(db)
        .await
}

impl Engine {
    /// Scheduled-mode prune: reclaim every untagged, non-running project.
    #[instrument(skip_all)]
    pub async fn prune_all_untagged(&self) -> Result<PruneSummary, Error> {
        let candidates = store::prune_candidates(&*self.db).await?;
        let protected = Arc::new(self.protected_images(None).await?);

        let total_found = candidates.len();

        let mut runs = candidates
            .into_iter()
            .map(|candidate| {
                let engine = self.clone();
                let protected = protected.clone();
                async move { engine.prune_one(&candidate, &protected).await }
            })
            .collect::<FuturesUnordered<_>>();

        let mut summary = PruneSummary {
            total_found,
            ..Default::default()
        };

        while let Some(errors) = runs.next().await {
            if errors.is_empty() {
                summary.success_count += 1;
            } else {
                summary.error_count += 1;
                summary.errors.extend(errors);
            }
        }

        info!(
            total = summary.total_found,
            succeeded = summary.success_count,
            failed = summary.error_count,
            "prune run finished"
        );

        Ok(summary)
    }

    /// On-demand prune of a single project.
    ///
    /// The project itself is excluded from the protected set, so its image
    /// falls unless some other project still pins it.
    #[instrument(skip_all, fields(project = project_id))]
    pub async fn prune_project(&self, project_id: i64) -> Result<PruneSummary, Error> {
        let project = store::by_id(&*self.db, project_id)
            .await?
            .ok_or(Error::NotFound("project"))?;

        if project.status == Status::Pruned {
            return Err(Error::BadRequest(String::from("project already pruned")));
        }

        let protected = self.protected_images(Some(project.id)).await?;

        let errors = self.prune_one(&project, &protected).await;

        Ok(PruneSummary {
            total_found: 1,
            success_count: usize::from(errors.is_empty()),
            error_count: usize::from(!errors.is_empty()),
            errors,
        })
    }

    /// Image hashes pinned by running or tagged projects.
    async fn protected_images(&self, exclude: Option<i64>) -> Result<HashSet<String>, Error> {
        let mut protected = HashSet::new();

        let pinned = store::running(&*self.db)
            .await?
            .into_iter()
            .chain(store::tagged_unpruned(&*self.db).await?);

        for project in pinned {
            if exclude != Some(project.id) && !project.image_hash.is_empty() {
                protected.insert(project.image_hash);
            }
        }

        Ok(protected)
    }

    /// The per-project routine shared by both modes. Returns the errors
    /// encountered; an empty list means the project is now pruned.
    async fn prune_one(&self, project: &project::Model, protected: &HashSet<String>) -> Vec<String> {
        let mut errors = Vec::new();
        let mut container_removed = true;

        if let Some(container_id) = project.container_id.as_deref() {
            if let Err(err) = self.docker.stop_container(container_id).await {
                if !err.is_benign_stop() {
                    warn!(container = container_id, %err, "unable to stop container before removal");
                }
            }

            match self.docker.remove_container(container_id).await {
                Ok(()) | Err(docker::Error::NotFound(_)) => {}
                Err(err) => {
                    container_removed = false;
                    errors.push(format!("unable to remove container {container_id}: {err}"));
                }
            }
        }

        if !project.image_hash.is_empty() && !protected.contains(&project.image_hash) {
            match image_protected_elsewhere(&*self.db, project.id, &project.image_hash).await {
                Ok(true) => {}
                Ok(false) => {
                    if let Err(err) = self.remove_image_with_retry(&project.image_hash).await {
                        errors.push(format!(
                            "unable to remove image {}: {err}",
                            project.image_hash
                        ));
                    }
                }
                Err(err) => {
                    errors.push(format!("unable to re-check image protection: {err}"));
                }
            }
        }

        if let Some(data_file) = project.data_file.as_deref() {
            let path = resolve_host_path(&self.config, Path::new(data_file));

            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                if let Err(err) = tokio::fs::remove_file(&path).await {
                    errors.push(format!("unable to remove data file {}: {err}", path.display()));
                }
            }
        }

        // The terminal transition happens only once the daemon is known to
        // hold no container for this project.
        if container_removed {
            if project.status == Status::Running {
                if let Err(err) = store::mark_stopped(&*self.db, project.id).await {
                    errors.push(format!("unable to mark project stopped: {err}"));
                }
            }

            if let Err(err) = store::mark_pruned(&*self.db, project.id).await {
                errors.push(format!("unable to mark project pruned: {err}"));
            }
        }

        errors
    }

    /// Remove an image, evicting any containers that still reference it on a
    /// conflict and retrying once. An already-absent image counts as removed.
    async fn remove_image_with_retry(&self, image_hash: &str) -> Result<(), docker::Error> {
        match self.docker.remove_image(image_hash).await {
            Ok(()) | Err(docker::Error::NotFound(_)) => Ok(()),
            Err(err) if err.is_conflict() => {
                self.remove_referencing_containers(image_hash).await;

                match self.docker.remove_image(image_hash).await {
                    Ok(()) | Err(docker::Error::NotFound(_)) => Ok(()),
                    Err(err) => Err(err),
                }
            }
            Err(err) => Err(err),
        }
    }

    async fn remove_referencing_containers(&self, image_hash: &str) {
        let containers = match self.docker.list_containers(true).await {
            Ok(containers) => containers,
            Err(err) => {
                warn!(%err, "unable to list containers referencing image");
                return;
            }
        };

        for container in containers {
            if hash_prefix_match(&container.image_id, image_hash)
                || hash_prefix_match(&container.image, image_hash)
            {
                if let Err(err) = self.docker.stop_container(&container.id).await {
                    if !err.is_benign_stop() {
                        warn!(container = %container.id, %err, "unable to stop referencing container");
                    }
                }

                if let Err(err) = self.docker.remove_container(&container.id).await {
                    if !err.is_not_found() {
                        warn!(container = %container.id, %err, "unable to remove referencing container");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use db::{
        project::{self, Status},
        EntityTrait,
    };
    use serde_json::json;

    use crate::{
        error::Error,
        testing::{
            seed_offering, seed_project, seed_team, world, world_with, FakeContainer, ProjectSeed,
        },
    };

    use super::hash_prefix_match;

    #[test]
    fn prefix_match_is_bidirectional() {
        assert!(hash_prefix_match("sha256:abcdef", "sha256:abc"));
        assert!(hash_prefix_match("sha256:abc", "sha256:abcdef"));
        assert!(!hash_prefix_match("sha256:abc", "sha256:def"));
        assert!(!hash_prefix_match("", "sha256:abc"));
    }

    #[tokio::test]
    async fn reclaims_stopped_untagged_projects() {
        let world = world().await;

        let offering = seed_offering(&world.db, json!({})).await;
        let team = seed_team(&world.db, offering, "Team A").await;

        world.docker.register_image("sha256:aaa", &["team-a:latest"]);
        world.docker.add_container(FakeContainer {
            running: false,
            ..FakeContainer::foreign("ctr-a", "team-a", "team-a:latest", "sha256:aaa")
        });

        let project = seed_project(&world.db, {
            let mut seed = ProjectSeed::new(team, Status::Stopped);
            seed.image_hash = String::from("sha256:aaa");
            seed.container_id = Some(String::from("ctr-a"));
            seed.container_name = Some(String::from("/team-a"));
            seed
        })
        .await;

        let summary = world
            .engine
            .prune_all_untagged()
            .await
            .expect("prune failed");

        assert_eq!(summary.total_found, 1);
        assert_eq!(summary.success_count, 1);
        assert_eq!(summary.error_count, 0);

        assert!(world.docker.container("ctr-a").is_none());
        assert!(!world.docker.has_image("sha256:aaa"));

        let stored = project::Entity::find_by_id(project)
            .one(&*world.db)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(stored.status, Status::Pruned);
        assert!(stored.container_id.is_none());
        assert!(stored.container_name.is_none());
        assert!(stored.data_file.is_none());
    }

    #[tokio::test]
    async fn shared_images_survive_when_another_project_runs_them() {
        let world = world().await;

        let offering = seed_offering(&world.db, json!({})).await;
        let team_a = seed_team(&world.db, offering, "Team A").await;
        let team_b = seed_team(&world.db, offering, "Team B").await;

        world.docker.register_image("sha256:shared", &[]);
        world.docker.add_container(FakeContainer {
            running: false,
            ..FakeContainer::foreign("ctr-a", "team-a", "team-a:latest", "sha256:shared")
        });
        world.docker.add_container(FakeContainer::foreign(
            "ctr-b",
            "team-b",
            "team-b:latest",
            "sha256:shared",
        ));

        let stopped = seed_project(&world.db, {
            let mut seed = ProjectSeed::new(team_a, Status::Stopped);
            seed.image_hash = String::from("sha256:shared");
            seed.container_id = Some(String::from("ctr-a"));
            seed
        })
        .await;

        seed_project(&world.db, {
            let mut seed = ProjectSeed::new(team_b, Status::Running);
            seed.image_hash = String::from("sha256:shared");
            seed.container_id = Some(String::from("ctr-b"));
            seed
        })
        .await;

        let summary = world
            .engine
            .prune_all_untagged()
            .await
            .expect("prune failed");

        assert_eq!(summary.total_found, 1);
        assert_eq!(summary.success_count, 1);

        // The stopped project's container is reclaimed, the shared image is not.
        assert!(world.docker.container("ctr-a").is_none());
        assert!(world.docker.has_image("sha256:shared"));

        let stored = project::Entity::find_by_id(stopped)
            .one(&*world.db)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(stored.status, Status::Pruned);
    }

    #[tokio::test]
    async fn tagged_projects_are_not_candidates() {
        let world = world().await;

        let offering = seed_offering(&world.db, json!({})).await;
        let team = seed_team(&world.db, offering, "Team A").await;

        world.docker.register_image("sha256:pinned", &[]);

        let tagged = seed_project(&world.db, {
            let mut seed = ProjectSeed::new(team, Status::Stopped);
            seed.image_hash = String::from("sha256:pinned");
            seed.tag = Some(String::from("v1"));
            seed
        })
        .await;

        let summary = world
            .engine
            .prune_all_untagged()
            .await
            .expect("prune failed");

        assert_eq!(summary.total_found, 0);
        assert!(world.docker.has_image("sha256:pinned"));

        let stored = project::Entity::find_by_id(tagged)
            .one(&*world.db)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(stored.status, Status::Stopped);
    }

    #[tokio::test]
    async fn pruning_twice_is_rejected() {
        let world = world().await;

        let offering = seed_offering(&world.db, json!({})).await;
        let team = seed_team(&world.db, offering, "Team A").await;

        let project = seed_project(&world.db, ProjectSeed::new(team, Status::Failed)).await;

        let summary = world
            .engine
            .prune_project(project)
            .await
            .expect("prune failed");

        assert_eq!(summary.success_count, 1);

        let err = world
            .engine
            .prune_project(project)
            .await
            .expect_err("second prune should fail");

        assert!(matches!(err, Error::BadRequest(_)));
    }

    #[tokio::test]
    async fn on_demand_prune_releases_the_projects_own_pin() {
        let world = world().await;

        let offering = seed_offering(&world.db, json!({})).await;
        let team = seed_team(&world.db, offering, "Team A").await;

        world.docker.register_image("sha256:own", &[]);

        // Tagged, so the scheduled pruner would protect the image; the
        // on-demand prune of the same project must not.
        let project = seed_project(&world.db, {
            let mut seed = ProjectSeed::new(team, Status::Stopped);
            seed.image_hash = String::from("sha256:own");
            seed.tag = Some(String::from("v1"));
            seed
        })
        .await;

        let summary = world
            .engine
            .prune_project(project)
            .await
            .expect("prune failed");

        assert_eq!(summary.success_count, 1);
        assert!(!world.docker.has_image("sha256:own"));
    }

    #[tokio::test]
    async fn image_conflicts_evict_referencing_containers_and_retry() {
        let world = world().await;

        let offering = seed_offering(&world.db, json!({})).await;
        let team = seed_team(&world.db, offering, "Team A").await;

        world.docker.register_image("sha256:busy", &[]);

        // A container the repository knows nothing about still runs the image.
        world.docker.add_container(FakeContainer::foreign(
            "stray",
            "forgotten",
            "team-a:latest",
            "sha256:busy",
        ));

        let project = seed_project(&world.db, {
            let mut seed = ProjectSeed::new(team, Status::Stopped);
            seed.image_hash = String::from("sha256:busy");
            seed
        })
        .await;

        let summary = world
            .engine
            .prune_all_untagged()
            .await
            .expect("prune failed");

        assert_eq!(summary.success_count, 1, "errors: {:?}", summary.errors);
        assert!(world.docker.container("stray").is_none());
        assert!(!world.docker.has_image("sha256:busy"));

        let stored = project::Entity::find_by_id(project)
            .one(&*world.db)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(stored.status, Status::Pruned);
    }

    #[tokio::test]
    async fn data_files_are_deleted_with_the_project() {
        let dir = tempfile::tempdir().expect("unable to create temp dir");
        let data_file = dir.path().join("cities.csv");
        tokio::fs::write(&data_file, "a,b\n").await.unwrap();

        let mut config = common::config::Engine::default();
        config.container_data_dir = dir.path().to_owned();

        let world = world_with(config).await;

        let offering = seed_offering(&world.db, json!({})).await;
        let team = seed_team(&world.db, offering, "Team A").await;

        let project = seed_project(&world.db, {
            let mut seed = ProjectSeed::new(team, Status::Stopped);
            seed.data_file = Some(data_file.display().to_string());
            seed
        })
        .await;

        world
            .engine
            .prune_project(project)
            .await
            .expect("prune failed");

        assert!(!data_file.exists());
    }
}
