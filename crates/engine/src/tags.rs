//! Tag engine.
//!
//! A tag pins the preferred build of every team in a course offering under a
//! named label: the daemon image gets a `{team}:{label}` reference and the
//! project row records the label, which shields both from pruning. The
//! offering's settings track every label ever applied.

use db::{
    course_offering, sea_query::Expr, team, ColumnTrait, EntityTrait, QueryFilter, QuerySelect,
};
use serde::Serialize;
use tracing::{info, instrument};

use crate::{error::Error, naming, store, Engine};

/// Result of tagging a course offering.
#[derive(Clone, Debug, Default, Serialize)]
pub struct TagSummary {
    /// Projects that received the label.
    pub tagged: usize,

    /// Teams skipped for want of a taggable project or image.
    pub skipped: usize,

    pub errors: Vec<String>,
}

/// Result of removing a label from a course offering.
#[derive(Clone, Debug, Default, Serialize)]
pub struct UntagSummary {
    /// Projects whose label was cleared.
    pub untagged: usize,

    pub errors: Vec<String>,
}

impl Engine {
    /// Pin every team's preferred project in the offering under `label`.
    #[instrument(skip_all, fields(offering = offering_id, label = label))]
    pub async fn tag_course_offering(
        &self,
        offering_id: i64,
        label: &str,
    ) -> Result<TagSummary, Error> {
        let offering = course_offering::Entity::find_by_id(offering_id)
            .one(&*self.db)
            .await?
            .ok_or(Error::NotFound("course offering"))?;

        let mut settings = offering.settings();

        if settings.project_tags.iter().any(|tag| tag == label) {
            return Err(Error::Conflict(format!(
                "label {label} was already applied to this offering"
            )));
        }

        let teams = team::Entity::find()
            .filter(team::Column::CourseOfferingId.eq(offering_id))
            .all(&*self.db)
            .await?;

        let mut summary = TagSummary::default();

        for team in teams {
            let preferred = match store::preferred_for_team(&*self.db, team.id).await {
                Ok(preferred) => preferred,
                Err(err) => {
                    summary.errors.push(format!("team {}: {err}", team.name));
                    continue;
                }
            };

            let Some(project) = preferred else {
                summary.skipped += 1;
                continue;
            };

            if project.image_hash.is_empty() {
                summary.skipped += 1;
                continue;
            }

            match self.docker.inspect_image(&project.image_hash).await {
                Ok(_) => {}
                Err(err) if err.is_not_found() => {
                    summary.skipped += 1;
                    continue;
                }
                Err(err) => {
                    summary.errors.push(format!("team {}: {err}", team.name));
                    continue;
                }
            }

            let repo = naming::normalized_team_name(&team.name);

            if let Err(err) = self
                .docker
                .tag_image(&project.image_hash, &repo, label)
                .await
            {
                summary.errors.push(format!("team {}: {err}", team.name));
                continue;
            }

            if let Err(err) = store::set_tag(&*self.db, project.id, Some(label)).await {
                summary.errors.push(format!("team {}: {err}", team.name));
                continue;
            }

            summary.tagged += 1;
        }

        settings.project_tags.push(label.to_string());
        self.save_settings(&offering, &settings).await?;

        info!(
            tagged = summary.tagged,
            skipped = summary.skipped,
            "offering tagged"
        );

        Ok(summary)
    }

    /// Remove `label` from the offering's projects and settings.
    ///
    /// Idempotent on settings: a label that was never applied still succeeds
    /// and leaves the tag list unchanged. The daemon-side image reference is
    /// deliberately kept; pruning reclaims the image once nothing pins it.
    #[instrument(skip_all, fields(offering = offering_id, label = label))]
    pub async fn untag_course_offering(
        &self,
        offering_id: i64,
        label: &str,
    ) -> Result<UntagSummary, Error> {
        let offering = course_offering::Entity::find_by_id(offering_id)
            .one(&*self.db)
            .await?
            .ok_or(Error::NotFound("course offering"))?;

        let mut settings = offering.settings();
        settings.project_tags.retain(|tag| tag != label);
        self.save_settings(&offering, &settings).await?;

        let team_ids: Vec<i64> = team::Entity::find()
            .select_only()
            .column(team::Column::Id)
            .filter(team::Column::CourseOfferingId.eq(offering_id))
            .into_tuple()
            .all(&*self.db)
            .await?;

        let cleared = db::project::Entity::update_many()
            .filter(db::project::Column::TeamId.is_in(team_ids))
            .filter(db::project::Column::Tag.eq(label))
            .col_expr(db::project::Column::Tag, Expr::value(Option::<String>::None))
            .exec(&*self.db)
            .await?;

        Ok(UntagSummary {
            untagged: cleared.rows_affected as usize,
            errors: Vec::new(),
        })
    }

    async fn save_settings(
        &self,
        offering: &course_offering::Model,
        settings: &course_offering::Settings,
    ) -> Result<(), Error> {
        course_offering::Entity::update_many()
            .filter(course_offering::Column::Id.eq(offering.id))
            .col_expr(
                course_offering::Column::Settings,
                Expr::value(offering.settings_with(settings)),
            )
            .exec(&*self.db)
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use db::{
        course_offering,
        project::{self, Status},
        EntityTrait,
    };
    use serde_json::json;

    use crate::{
        deploy::DeployRequest,
        error::Error,
        testing::{seed_offering, seed_project, seed_team, seed_user, world, ProjectSeed},
    };

    async fn offering_settings(
        db: &db::DatabaseConnection,
        offering_id: i64,
    ) -> course_offering::Settings {
        course_offering::Entity::find_by_id(offering_id)
            .one(db)
            .await
            .unwrap()
            .unwrap()
            .settings()
    }

    #[tokio::test]
    async fn tags_every_team_with_a_taggable_project() {
        let world = world().await;

        let offering = seed_offering(&world.db, json!({})).await;
        let team_a = seed_team(&world.db, offering, "Team A").await;
        let team_b = seed_team(&world.db, offering, "Team B").await;
        seed_team(&world.db, offering, "Team C").await;
        let alice = seed_user(&world.db, "alice", false).await;

        // A runs a fresh deploy; B only has a stopped build; C has nothing.
        let project_a = world
            .engine
            .deploy(DeployRequest::new(team_a, "https://github.com/u/a", alice))
            .await
            .expect("deploy failed");

        world.docker.register_image("sha256:bbb", &[]);
        let project_b = seed_project(&world.db, {
            let mut seed = ProjectSeed::new(team_b, Status::Stopped);
            seed.image_hash = String::from("sha256:bbb");
            seed
        })
        .await;

        let summary = world
            .engine
            .tag_course_offering(offering, "v1")
            .await
            .expect("tagging failed");

        assert_eq!(summary.tagged, 2);
        assert_eq!(summary.skipped, 1);
        assert!(summary.errors.is_empty());

        for id in [project_a.id, project_b] {
            let stored = project::Entity::find_by_id(id)
                .one(&*world.db)
                .await
                .unwrap()
                .unwrap();

            assert_eq!(stored.tag.as_deref(), Some("v1"));
        }

        let references = world.docker.image_references();
        assert!(references.contains(&String::from("team-a:v1")));
        assert!(references.contains(&String::from("team-b:v1")));

        let settings = offering_settings(&world.db, offering).await;
        assert_eq!(settings.project_tags, vec![String::from("v1")]);
    }

    #[tokio::test]
    async fn duplicate_labels_conflict() {
        let world = world().await;

        let offering = seed_offering(&world.db, json!({ "project_tags": ["v1"] })).await;

        let err = world
            .engine
            .tag_course_offering(offering, "v1")
            .await
            .expect_err("tagging should conflict");

        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn teams_with_vanished_images_are_skipped() {
        let world = world().await;

        let offering = seed_offering(&world.db, json!({})).await;
        let team = seed_team(&world.db, offering, "Team A").await;

        seed_project(&world.db, {
            let mut seed = ProjectSeed::new(team, Status::Stopped);
            seed.image_hash = String::from("sha256:gone");
            seed
        })
        .await;

        let summary = world
            .engine
            .tag_course_offering(offering, "v1")
            .await
            .expect("tagging failed");

        assert_eq!(summary.tagged, 0);
        assert_eq!(summary.skipped, 1);

        // The label still lands in the settings history.
        let settings = offering_settings(&world.db, offering).await;
        assert_eq!(settings.project_tags, vec![String::from("v1")]);
    }

    #[tokio::test]
    async fn untag_clears_labels_but_keeps_daemon_references() {
        let world = world().await;

        let offering = seed_offering(&world.db, json!({})).await;
        let team = seed_team(&world.db, offering, "Team A").await;
        let alice = seed_user(&world.db, "alice", false).await;

        let project = world
            .engine
            .deploy(DeployRequest::new(team, "https://github.com/u/r", alice))
            .await
            .expect("deploy failed");

        world
            .engine
            .tag_course_offering(offering, "v1")
            .await
            .expect("tagging failed");

        let summary = world
            .engine
            .untag_course_offering(offering, "v1")
            .await
            .expect("untagging failed");

        assert_eq!(summary.untagged, 1);

        let stored = project::Entity::find_by_id(project.id)
            .one(&*world.db)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(stored.tag, None);

        let settings = offering_settings(&world.db, offering).await;
        assert!(settings.project_tags.is_empty());

        // The daemon-side reference stays until pruning reclaims the image.
        assert!(world
            .docker
            .image_references()
            .contains(&String::from("team-a:v1")));
    }

    #[tokio::test]
    async fn untag_is_idempotent_on_settings() {
        let world = world().await;

        let offering =
            seed_offering(&world.db, json!({ "project_tags": ["v1"], "theme": "dark" })).await;

        let summary = world
            .engine
            .untag_course_offering(offering, "v2")
            .await
            .expect("untagging failed");

        assert_eq!(summary.untagged, 0);

        // Unrelated settings keys and labels are untouched.
        let stored = course_offering::Entity::find_by_id(offering)
            .one(&*world.db)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(stored.settings["project_tags"], json!(["v1"]));
        assert_eq!(stored.settings["theme"], json!("dark"));
    }
}
