pub use sea_orm_migration::prelude::*;

mod m20240101_000001_create_users_table;
mod m20240101_000002_create_course_offerings_table;
mod m20240101_000003_create_teams_table;
mod m20240101_000004_create_enrollments_table;
mod m20240101_000005_create_team_members_table;
mod m20240101_000006_create_projects_table;

pub(crate) use m20240101_000001_create_users_table::Users;
pub(crate) use m20240101_000002_create_course_offerings_table::CourseOfferings;
pub(crate) use m20240101_000003_create_teams_table::Teams;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20240101_000001_create_users_table::Migration),
            Box::new(m20240101_000002_create_course_offerings_table::Migration),
            Box::new(m20240101_000003_create_teams_table::Migration),
            Box::new(m20240101_000004_create_enrollments_table::Migration),
            Box::new(m20240101_000005_create_team_members_table::Migration),
            Box::new(m20240101_000006_create_projects_table::Migration),
        ]
    }
}
