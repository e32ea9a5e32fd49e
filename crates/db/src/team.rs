//! Team of users that projects belong to.

use sea_orm::entity::prelude::*;

/// Team model.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "teams")]
pub struct Model {
    /// Unique team identifier.
    #[sea_orm(primary_key)]
    pub id: i64,

    /// Course offering this team belongs to.
    pub course_offering_id: i64,

    /// Display name. Its normalized form names the team's container,
    /// image repository, and network alias.
    pub name: String,
}

/// Team model relations.
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::course_offering::Entity",
        from = "Column::CourseOfferingId",
        to = "super::course_offering::Column::Id"
    )]
    CourseOffering,

    #[sea_orm(has_many = "super::project::Entity")]
    Projects,

    #[sea_orm(has_many = "super::team_member::Entity")]
    Members,
}

impl Related<super::course_offering::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::CourseOffering.def()
    }
}

impl Related<super::project::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Projects.def()
    }
}

impl Related<super::team_member::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Members.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
