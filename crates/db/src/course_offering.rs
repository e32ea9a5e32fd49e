//! Semester-scoped course offering grouping teams under shared settings.
//!
//! Settings are stored as an opaque JSON object; the deployment engine reads
//! exactly two keys out of it (`serverLocked` and `project_tags`) through the
//! typed [`Settings`] view and writes the whole object back on the store
//! boundary, preserving keys it does not recognize.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Course offering model.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "course_offerings")]
pub struct Model {
    /// Unique course offering identifier.
    #[sea_orm(primary_key)]
    pub id: i64,

    /// Display name, e.g. `"CS312 2026S1"`.
    pub name: String,

    /// Opaque settings object.
    pub settings: Json,
}

/// The settings keys consulted by the deployment engine.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// When locked, only admins and instructors may deploy or stop.
    #[serde(rename = "serverLocked")]
    pub server_locked: bool,

    /// Every label ever applied to this offering's teams, in application order.
    pub project_tags: Vec<String>,
}

impl Model {
    /// Typed view over the recognized settings keys.
    ///
    /// Unknown or malformed settings degrade to defaults rather than failing
    /// the surrounding operation.
    pub fn settings(&self) -> Settings {
        serde_json::from_value(self.settings.clone()).unwrap_or_default()
    }

    /// Merge the recognized keys back into the stored settings object,
    /// preserving keys the engine does not interpret.
    pub fn settings_with(&self, settings: &Settings) -> Json {
        let mut value = self.settings.clone();

        if let Some(object) = value.as_object_mut() {
            object.insert(
                String::from("serverLocked"),
                Json::from(settings.server_locked),
            );
            object.insert(
                String::from("project_tags"),
                serde_json::to_value(&settings.project_tags).unwrap_or_default(),
            );

            value
        } else {
            serde_json::to_value(settings).unwrap_or_default()
        }
    }
}

/// Course offering model relations.
#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::team::Entity")]
    Teams,

    #[sea_orm(has_many = "super::enrollment::Entity")]
    Enrollments,
}

impl Related<super::team::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Teams.def()
    }
}

impl Related<super::enrollment::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Enrollments.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
