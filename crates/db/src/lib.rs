//! # Database models and interaction utilities
//!
//! This crate provides definitions for database models that can be used, in conjunction
//! with [`sea_orm`], to interact with the database in a typed manner.
//!
//! Additionally, this crate provides other crates with commonly used `SELECT` query
//! utilities [`SelectExt`].

pub mod course_offering;
pub mod enrollment;
pub mod project;
pub mod team;
pub mod team_member;
pub mod user;

use async_trait::async_trait;
pub use sea_orm::{
    self, sea_query, ActiveModelTrait, ActiveValue, ColumnTrait, ConnectionTrait, Database,
    DatabaseConnection, DbErr, EntityTrait, FromQueryResult, QueryFilter, QueryOrder, QuerySelect,
    QueryTrait, StatementBuilder, TryGetableMany,
};
pub use time::{OffsetDateTime, PrimitiveDateTime};

/// Utility methods for SELECT queries.
#[async_trait]
pub trait SelectExt {
    /// Check if at least one record that satisfies a query.
    ///
    /// # Example
    ///
    /// ```ignore
    /// // Determine if at least one record of entity exists in the database
    /// let exists = Entity::find()
    ///     .select_only()
    ///     .exists(&db)
    ///     .await?;
    /// ```
    async fn exists<C: ConnectionTrait + Send>(self, db: &C) -> Result<bool, DbErr>;
}

#[async_trait]
impl<T> SelectExt for T
where
    T: QueryTrait<QueryStatement = sea_query::SelectStatement> + Send,
{
    async fn exists<C: ConnectionTrait + Send>(self, db: &C) -> Result<bool, DbErr> {
        use sea_query::{Expr, Query};

        let mut query = self.into_query();

        // Fix failing tests with SQLite by returning at least some expr
        query.expr(1);

        let stmt = StatementBuilder::build(
            Query::select().expr(Expr::exists(query)),
            &db.get_database_backend(),
        );

        db.query_one(stmt).await?.unwrap().try_get_by_index(0)
    }
}
