//! Deployed project.
//!
//! A project row is created at the start of every deploy attempt and is the
//! only state the deployment engine persists; everything else is derived from
//! the container daemon. Rows are never resurrected: a redeploy inserts a new
//! row and the old one ages through `stopped` into `pruned`.

use sea_orm::entity::prelude::*;
use serde::Serialize;

/// Project model.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize)]
#[sea_orm(table_name = "projects")]
pub struct Model {
    /// Unique project identifier.
    #[sea_orm(primary_key)]
    pub id: i64,

    /// Team that owns this project.
    pub team_id: i64,

    /// User that initiated the deploy, if still registered.
    pub deployed_by_id: Option<i64>,

    /// Git repository the project was built from.
    pub github_url: String,

    /// Image content identifier reported by the daemon.
    ///
    /// Empty until the build has completed.
    pub image_hash: String,

    /// Pinned label, if any. Tagged projects are never pruned automatically.
    pub tag: Option<String>,

    /// Daemon container identifier. Unique across all projects when set.
    #[sea_orm(unique)]
    pub container_id: Option<String>,

    /// Daemon-assigned container name.
    pub container_name: Option<String>,

    /// Lifecycle status.
    pub status: Status,

    /// Port mapping snapshot taken when the container was started.
    pub ports: Option<Json>,

    /// Accumulated build output.
    pub build_logs: Option<String>,

    /// Image build arguments.
    pub build_args: Json,

    /// Container environment variables.
    pub env_vars: Json,

    /// Host path of a read-only data file bind-mounted into the container.
    pub data_file: Option<String>,

    /// Filename the data file had when uploaded, preserved inside the container.
    pub original_data_file_name: Option<String>,

    /// Set on successful container start.
    pub deployed_at: TimeDateTime,

    /// Set on transition to `stopped`.
    pub stopped_at: Option<TimeDateTime>,

    /// Consecutive failed reconciliation checks.
    pub failed_check_count: i32,

    /// Last reconciliation check, if any.
    pub last_checked_at: Option<TimeDateTime>,
}

/// Project lifecycle status.
///
/// Transitions are enforced by the deploy pipeline, not by the store:
/// `building`/`deploying` resolve to `running` or `failed`; `running`
/// demotes to `stopped`; `stopped` and `failed` end in the terminal
/// `pruned` state.
#[derive(Copy, Clone, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize)]
#[sea_orm(rs_type = "i16", db_type = "Integer")]
#[serde(rename_all = "snake_case")]
pub enum Status {
    #[sea_orm(num_value = 0)]
    Building,
    #[sea_orm(num_value = 1)]
    Running,
    #[sea_orm(num_value = 2)]
    Stopped,
    #[sea_orm(num_value = 3)]
    Failed,
    #[sea_orm(num_value = 4)]
    Pruned,
    #[sea_orm(num_value = 5)]
    Deploying,
}

/// Project model relations.
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::team::Entity",
        from = "Column::TeamId",
        to = "super::team::Column::Id"
    )]
    Team,

    #[sea_orm(
        belongs_to = "super::user::Entity",
        from = "Column::DeployedById",
        to = "super::user::Column::Id"
    )]
    DeployedBy,
}

impl Related<super::team::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Team.def()
    }
}

impl Related<super::user::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::DeployedBy.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
