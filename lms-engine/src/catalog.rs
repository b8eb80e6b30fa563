//! Course catalog reads
//!
//! Read-only collaborator supplying the authoritative lecture sequence and
//! pricing. Course and lecture writes happen outside this crate.

use crate::parse_db_uuid;
use lms_common::db::models::CourseSummary;
use lms_common::Result;
use sqlx::SqlitePool;
use uuid::Uuid;

#[derive(Clone)]
pub struct CourseCatalog {
    db: SqlitePool,
}

impl CourseCatalog {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    pub async fn course_exists(&self, course_id: Uuid) -> Result<bool> {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM courses WHERE guid = ?)")
            .bind(course_id.to_string())
            .fetch_one(&self.db)
            .await?;

        Ok(exists)
    }

    /// Course price in whole currency units; `None` when the course is missing
    pub async fn price(&self, course_id: Uuid) -> Result<Option<i64>> {
        let price: Option<i64> = sqlx::query_scalar("SELECT price FROM courses WHERE guid = ?")
            .bind(course_id.to_string())
            .fetch_optional(&self.db)
            .await?;

        Ok(price)
    }

    /// Total lecture count, read fresh on every call
    pub async fn lecture_count(&self, course_id: Uuid) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM lectures WHERE course_id = ?")
            .bind(course_id.to_string())
            .fetch_one(&self.db)
            .await?;

        Ok(count)
    }

    /// Ordered lecture sequence of a course
    pub async fn lecture_ids(&self, course_id: Uuid) -> Result<Vec<Uuid>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT guid FROM lectures WHERE course_id = ? ORDER BY position")
                .bind(course_id.to_string())
                .fetch_all(&self.db)
                .await?;

        rows.iter().map(|(guid,)| parse_db_uuid(guid)).collect()
    }

    pub async fn lecture_belongs_to(&self, course_id: Uuid, lecture_id: Uuid) -> Result<bool> {
        let belongs: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM lectures WHERE guid = ? AND course_id = ?)",
        )
        .bind(lecture_id.to_string())
        .bind(course_id.to_string())
        .fetch_one(&self.db)
        .await?;

        Ok(belongs)
    }

    pub async fn course_summary(&self, course_id: Uuid) -> Result<Option<CourseSummary>> {
        let row: Option<(String, String, Option<String>, i64, String)> = sqlx::query_as(
            "SELECT guid, title, category, price, currency FROM courses WHERE guid = ?",
        )
        .bind(course_id.to_string())
        .fetch_optional(&self.db)
        .await?;

        match row {
            None => Ok(None),
            Some((guid, title, category, price, currency)) => Ok(Some(CourseSummary {
                guid: parse_db_uuid(&guid)?,
                title,
                category,
                price,
                currency,
            })),
        }
    }
}
