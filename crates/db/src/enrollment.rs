//! Enrollment of a user into a course offering.

use sea_orm::entity::prelude::*;

/// Enrollment model.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "enrollments")]
pub struct Model {
    /// Unique enrollment identifier.
    #[sea_orm(primary_key)]
    pub id: i64,

    /// Enrolled user.
    pub user_id: i64,

    /// Course offering the user is enrolled in.
    pub course_offering_id: i64,

    /// Role the user holds within the offering.
    pub role: Role,
}

/// Enrollment role.
#[derive(Copy, Clone, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "i16", db_type = "Integer")]
pub enum Role {
    #[sea_orm(num_value = 0)]
    Student,
    #[sea_orm(num_value = 1)]
    Instructor,
}

/// Enrollment model relations.
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::user::Entity",
        from = "Column::UserId",
        to = "super::user::Column::Id"
    )]
    User,

    #[sea_orm(
        belongs_to = "super::course_offering::Entity",
        from = "Column::CourseOfferingId",
        to = "super::course_offering::Column::Id"
    )]
    CourseOffering,
}

impl Related<super::user::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::User.def()
    }
}

impl Related<super::course_offering::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::CourseOffering.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
