use db::project::Status;
use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Projects::Table)
                    .col(
                        ColumnDef::new(Projects::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Projects::TeamId).big_integer().not_null())
                    .col(ColumnDef::new(Projects::DeployedById).big_integer())
                    .col(ColumnDef::new(Projects::GithubUrl).string().not_null())
                    .col(
                        ColumnDef::new(Projects::ImageHash)
                            .string()
                            .not_null()
                            .default(""),
                    )
                    .col(ColumnDef::new(Projects::Tag).string())
                    .col(ColumnDef::new(Projects::ContainerId).string().unique_key())
                    .col(ColumnDef::new(Projects::ContainerName).string())
                    .col(
                        ColumnDef::new(Projects::Status)
                            .small_integer()
                            .not_null()
                            .default(Status::Building),
                    )
                    .col(ColumnDef::new(Projects::Ports).json())
                    .col(ColumnDef::new(Projects::BuildLogs).text())
                    .col(ColumnDef::new(Projects::BuildArgs).json().not_null())
                    .col(ColumnDef::new(Projects::EnvVars).json().not_null())
                    .col(ColumnDef::new(Projects::DataFile).string())
                    .col(ColumnDef::new(Projects::OriginalDataFileName).string())
                    .col(
                        ColumnDef::new(Projects::DeployedAt)
                            .timestamp()
                            .not_null()
                            .extra("DEFAULT CURRENT_TIMESTAMP".to_string()),
                    )
                    .col(ColumnDef::new(Projects::StoppedAt).timestamp())
                    .col(
                        ColumnDef::new(Projects::FailedCheckCount)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(Projects::LastCheckedAt).timestamp())
                    .foreign_key(
                        ForeignKey::create()
                            .from(Projects::Table, Projects::TeamId)
                            .to(crate::Teams::Table, crate::Teams::Id)
                            .on_delete(ForeignKeyAction::Cascade)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .from(Projects::Table, Projects::DeployedById)
                            .to(crate::Users::Table, crate::Users::Id)
                            .on_delete(ForeignKeyAction::SetNull)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-projects-status")
                    .table(Projects::Table)
                    .col(Projects::Status)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-projects-team-id-status")
                    .table(Projects::Table)
                    .col(Projects::TeamId)
                    .col(Projects::Status)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Projects::Table).to_owned())
            .await
    }
}

/// Learn more at https://docs.rs/sea-query#iden
#[derive(Iden)]
pub(crate) enum Projects {
    Table,
    Id,
    TeamId,
    DeployedById,
    GithubUrl,
    ImageHash,
    Tag,
    ContainerId,
    ContainerName,
    Status,
    Ports,
    BuildLogs,
    BuildArgs,
    EnvVars,
    DataFile,
    OriginalDataFileName,
    DeployedAt,
    StoppedAt,
    FailedCheckCount,
    LastCheckedAt,
}
