//! Authorization predicates.
//!
//! The engine consults these before any operation that changes container
//! state; everything else about users and enrollment is owned by the
//! surrounding application.

use db::{
    course_offering, enrollment, team_member, user, ColumnTrait, ConnectionTrait, DbErr,
    EntityTrait, QueryFilter, QuerySelect, SelectExt,
};

pub(crate) async fn is_admin<C: ConnectionTrait + Send>(
    db: &C,
    user_id: i64,
) -> Result<bool, DbErr> {
    user::Entity::find_by_id(user_id)
        .select_only()
        .filter(user::Column::Admin.eq(true))
        .exists(db)
        .await
}

pub(crate) async fn is_instructor<C: ConnectionTrait + Send>(
    db: &C,
    user_id: i64,
    course_offering_id: i64,
) -> Result<bool, DbErr> {
    enrollment::Entity::find()
        .select_only()
        .filter(enrollment::Column::UserId.eq(user_id))
        .filter(enrollment::Column::CourseOfferingId.eq(course_offering_id))
        .filter(enrollment::Column::Role.eq(enrollment::Role::Instructor))
        .exists(db)
        .await
}

pub(crate) async fn is_member<C: ConnectionTrait + Send>(
    db: &C,
    user_id: i64,
    team_id: i64,
) -> Result<bool, DbErr> {
    team_member::Entity::find()
        .select_only()
        .filter(team_member::Column::UserId.eq(user_id))
        .filter(team_member::Column::TeamId.eq(team_id))
        .exists(db)
        .await
}

/// Deploy gate: a locked offering accepts deploys only from admins and
/// instructors.
pub(crate) async fn may_deploy<C: ConnectionTrait + Send>(
    db: &C,
    caller: i64,
    offering: &course_offering::Model,
) -> Result<bool, DbErr> {
    if !offering.settings().server_locked {
        return Ok(true);
    }

    Ok(is_admin(db, caller).await? || is_instructor(db, caller, offering.id).await?)
}

/// Stop gate: admins always; instructors always; team members only while the
/// offering is unlocked.
pub(crate) async fn may_stop<C: ConnectionTrait + Send>(
    db: &C,
    caller: i64,
    offering: &course_offering::Model,
    team_id: i64,
) -> Result<bool, DbErr> {
    if is_admin(db, caller).await? {
        return Ok(true);
    }

    if offering.settings().server_locked {
        is_instructor(db, caller, offering.id).await
    } else {
        Ok(is_instructor(db, caller, offering.id).await? || is_member(db, caller, team_id).await?)
    }
}
