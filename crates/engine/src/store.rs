//! Project repository.
//!
//! All reads and writes of persisted project state go through this module.
//! Status transitions are advisory here; the deploy pipeline owns the state
//! machine and these helpers only ever write the fields a transition names,
//! leaving everything else untouched.

use db::{
    project::{self, Status},
    sea_query::Expr,
    ColumnTrait, ConnectionTrait, DbErr, EntityTrait, PrimitiveDateTime, QueryFilter, QueryOrder,
};

use crate::docker::ContainerInfo;

/// Current wall-clock time in the column representation.
pub(crate) fn now() -> PrimitiveDateTime {
    let now = db::OffsetDateTime::now_utc();

    PrimitiveDateTime::new(now.date(), now.time())
}

pub(crate) async fn by_id<C: ConnectionTrait>(
    db: &C,
    id: i64,
) -> Result<Option<project::Model>, DbErr> {
    project::Entity::find_by_id(id).one(db).await
}

pub(crate) async fn by_container_id<C: ConnectionTrait>(
    db: &C,
    container_id: &str,
) -> Result<Option<project::Model>, DbErr> {
    project::Entity::find()
        .filter(project::Column::ContainerId.eq(container_id))
        .one(db)
        .await
}

/// Running projects of one team, newest deploy first.
pub(crate) async fn running_for_team<C: ConnectionTrait>(
    db: &C,
    team_id: i64,
) -> Result<Vec<project::Model>, DbErr> {
    project::Entity::find()
        .filter(project::Column::TeamId.eq(team_id))
        .filter(project::Column::Status.eq(Status::Running))
        .order_by_desc(project::Column::DeployedAt)
        .all(db)
        .await
}

/// All projects the reconciler watches.
pub(crate) async fn running<C: ConnectionTrait>(db: &C) -> Result<Vec<project::Model>, DbErr> {
    project::Entity::find()
        .filter(project::Column::Status.eq(Status::Running))
        .all(db)
        .await
}

/// Untagged projects that are neither running nor already pruned.
pub(crate) async fn prune_candidates<C: ConnectionTrait>(
    db: &C,
) -> Result<Vec<project::Model>, DbErr> {
    project::Entity::find()
        .filter(project::Column::Status.ne(Status::Running))
        .filter(project::Column::Status.ne(Status::Pruned))
        .filter(project::Column::Tag.is_null())
        .all(db)
        .await
}

/// Tagged projects that still exist, whatever their runtime state.
pub(crate) async fn tagged_unpruned<C: ConnectionTrait>(
    db: &C,
) -> Result<Vec<project::Model>, DbErr> {
    project::Entity::find()
        .filter(project::Column::Tag.is_not_null())
        .filter(project::Column::Status.ne(Status::Pruned))
        .all(db)
        .await
}

/// The team's newest running project, else its newest project outright.
pub(crate) async fn preferred_for_team<C: ConnectionTrait>(
    db: &C,
    team_id: i64,
) -> Result<Option<project::Model>, DbErr> {
    let running = project::Entity::find()
        .filter(project::Column::TeamId.eq(team_id))
        .filter(project::Column::Status.eq(Status::Running))
        .order_by_desc(project::Column::DeployedAt)
        .one(db)
        .await?;

    if running.is_some() {
        return Ok(running);
    }

    project::Entity::find()
        .filter(project::Column::TeamId.eq(team_id))
        .order_by_desc(project::Column::DeployedAt)
        .one(db)
        .await
}

/// `running → stopped`, resetting the reconciler bookkeeping.
pub(crate) async fn mark_stopped<C: ConnectionTrait>(db: &C, id: i64) -> Result<(), DbErr> {
    project::Entity::update_many()
        .filter(project::Column::Id.eq(id))
        .col_expr(project::Column::Status, Status::Stopped.into())
        .col_expr(project::Column::StoppedAt, Expr::value(Some(now())))
        .col_expr(project::Column::FailedCheckCount, 0.into())
        .col_expr(
            project::Column::LastCheckedAt,
            Expr::value(Option::<PrimitiveDateTime>::None),
        )
        .exec(db)
        .await?;

    Ok(())
}

pub(crate) async fn mark_failed<C: ConnectionTrait>(db: &C, id: i64) -> Result<(), DbErr> {
    project::Entity::update_many()
        .filter(project::Column::Id.eq(id))
        .col_expr(project::Column::Status, Status::Failed.into())
        .exec(db)
        .await?;

    Ok(())
}

/// Persist build output without touching the image hash, for failed builds.
pub(crate) async fn set_build_logs<C: ConnectionTrait>(
    db: &C,
    id: i64,
    logs: &str,
) -> Result<(), DbErr> {
    project::Entity::update_many()
        .filter(project::Column::Id.eq(id))
        .col_expr(
            project::Column::BuildLogs,
            Expr::value(Some(logs.to_string())),
        )
        .exec(db)
        .await?;

    Ok(())
}

/// Persist build output and the resolved image hash together.
pub(crate) async fn set_build_result<C: ConnectionTrait>(
    db: &C,
    id: i64,
    logs: &str,
    image_hash: &str,
) -> Result<(), DbErr> {
    project::Entity::update_many()
        .filter(project::Column::Id.eq(id))
        .col_expr(
            project::Column::BuildLogs,
            Expr::value(Some(logs.to_string())),
        )
        .col_expr(project::Column::ImageHash, image_hash.into())
        .exec(db)
        .await?;

    Ok(())
}

/// Persist the started container's identity and promote to `running`.
pub(crate) async fn mark_running<C: ConnectionTrait>(
    db: &C,
    id: i64,
    container: &ContainerInfo,
) -> Result<(), DbErr> {
    project::Entity::update_many()
        .filter(project::Column::Id.eq(id))
        .col_expr(
            project::Column::ContainerId,
            Expr::value(Some(container.id.clone())),
        )
        .col_expr(
            project::Column::ContainerName,
            Expr::value(Some(container.name.clone())),
        )
        .col_expr(project::Column::Ports, Expr::value(container.ports.clone()))
        .col_expr(project::Column::Status, Status::Running.into())
        .col_expr(project::Column::DeployedAt, now().into())
        .exec(db)
        .await?;

    Ok(())
}

/// Terminal transition: clear every daemon-derived field.
pub(crate) async fn mark_pruned<C: ConnectionTrait>(db: &C, id: i64) -> Result<(), DbErr> {
    project::Entity::update_many()
        .filter(project::Column::Id.eq(id))
        .col_expr(project::Column::Status, Status::Pruned.into())
        .col_expr(
            project::Column::ContainerId,
            Expr::value(Option::<String>::None),
        )
        .col_expr(
            project::Column::ContainerName,
            Expr::value(Option::<String>::None),
        )
        .col_expr(
            project::Column::DataFile,
            Expr::value(Option::<String>::None),
        )
        .exec(db)
        .await?;

    Ok(())
}

pub(crate) async fn set_tag<C: ConnectionTrait>(
    db: &C,
    id: i64,
    tag: Option<&str>,
) -> Result<(), DbErr> {
    project::Entity::update_many()
        .filter(project::Column::Id.eq(id))
        .col_expr(project::Column::Tag, Expr::value(tag.map(str::to_string)))
        .exec(db)
        .await?;

    Ok(())
}
