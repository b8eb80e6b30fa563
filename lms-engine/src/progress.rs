//! Lecture progress store
//!
//! One progress record per (user, course), holding a map of per-lecture
//! completion entries keyed by lecture id. The key lives in the
//! `lecture_progress` primary key, so marking the same lecture watched any
//! number of times converges to a single entry; there is no list to
//! deduplicate after the fact.
//!
//! The completion percentage is derived state: it is recomputed against
//! the live lecture count on every write and on every read, so a course
//! whose lecture list changed never yields a stale figure.

use crate::catalog::CourseCatalog;
use crate::parse_db_uuid;
use crate::retry::{retry_on_busy, RetryPolicy};
use chrono::{DateTime, Utc};
use lms_common::db::models::{LectureProgressEntry, ProgressSnapshot};
use lms_common::{Error, Result};
use sqlx::{Sqlite, SqlitePool, Transaction};
use uuid::Uuid;

pub struct ProgressStore {
    db: SqlitePool,
    catalog: CourseCatalog,
}

impl ProgressStore {
    pub fn new(db: SqlitePool, catalog: CourseCatalog) -> Self {
        Self { db, catalog }
    }

    /// Record that a user finished watching a lecture.
    ///
    /// Upserts the (user, course) progress record and the per-lecture
    /// entry, then recomputes the completion percentage inside the same
    /// transaction. Idempotent: repeating the call refreshes
    /// `last_watched` and changes nothing else.
    pub async fn record_lecture_watched(
        &self,
        user_id: Uuid,
        course_id: Uuid,
        lecture_id: Uuid,
    ) -> Result<ProgressSnapshot> {
        if !self.catalog.course_exists(course_id).await? {
            return Err(Error::NotFound(format!("course {}", course_id)));
        }
        if !self.catalog.lecture_belongs_to(course_id, lecture_id).await? {
            return Err(Error::NotFound(format!(
                "lecture {} in course {}",
                lecture_id, course_id
            )));
        }

        let policy = RetryPolicy::load(&self.db).await;
        retry_on_busy("record lecture watched", policy, || async move {
            self.apply_watch(user_id, course_id, lecture_id).await
        })
        .await?;

        tracing::debug!(
            user_id = %user_id,
            course_id = %course_id,
            lecture_id = %lecture_id,
            "Recorded lecture watched"
        );

        self.get_progress(user_id, course_id).await
    }

    /// Progress snapshot for a (user, course) pair.
    ///
    /// A user who has not started the course gets the zero snapshot, not
    /// an error; only a missing course is `NotFound`.
    pub async fn get_progress(&self, user_id: Uuid, course_id: Uuid) -> Result<ProgressSnapshot> {
        if !self.catalog.course_exists(course_id).await? {
            return Err(Error::NotFound(format!("course {}", course_id)));
        }

        let rows: Vec<(String, i64, DateTime<Utc>, DateTime<Utc>)> = sqlx::query_as(
            "SELECT lecture_id, is_completed, watch_time, last_watched
             FROM lecture_progress
             WHERE user_id = ? AND course_id = ?
             ORDER BY watch_time, lecture_id",
        )
        .bind(user_id.to_string())
        .bind(course_id.to_string())
        .fetch_all(&self.db)
        .await?;

        if rows.is_empty() {
            return Ok(ProgressSnapshot::empty(user_id, course_id));
        }

        let lecture_progress = rows
            .into_iter()
            .map(|(lecture_id, is_completed, watch_time, last_watched)| {
                Ok(LectureProgressEntry {
                    lecture_id: parse_db_uuid(&lecture_id)?,
                    is_completed: is_completed != 0,
                    watch_time,
                    last_watched,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        // Recompute against the live lecture list; entries for lectures
        // removed from the course stay in the map but stop counting.
        let completed = self.completed_count(user_id, course_id).await?;
        let total = self.catalog.lecture_count(course_id).await?;

        Ok(ProgressSnapshot {
            user_id,
            course_id,
            lecture_progress,
            completion_percentage: completion_percentage(completed, total),
            is_completed: completed == total && total > 0,
        })
    }

    /// Clear all lecture entries and zero the percentage; used for
    /// re-taking a course. Idempotent.
    pub async fn reset_progress(&self, user_id: Uuid, course_id: Uuid) -> Result<()> {
        let policy = RetryPolicy::load(&self.db).await;
        retry_on_busy("reset progress", policy, || async move {
            let mut tx = self.db.begin().await?;

            sqlx::query("DELETE FROM lecture_progress WHERE user_id = ? AND course_id = ?")
                .bind(user_id.to_string())
                .bind(course_id.to_string())
                .execute(&mut *tx)
                .await?;

            sqlx::query(
                "UPDATE course_progress
                 SET completion_percentage = 0, is_completed = 0, updated_at = CURRENT_TIMESTAMP
                 WHERE user_id = ? AND course_id = ?",
            )
            .bind(user_id.to_string())
            .bind(course_id.to_string())
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;
            Ok(())
        })
        .await?;

        tracing::info!(user_id = %user_id, course_id = %course_id, "Progress reset");
        Ok(())
    }

    async fn apply_watch(&self, user_id: Uuid, course_id: Uuid, lecture_id: Uuid) -> Result<()> {
        let mut tx = self.db.begin().await?;

        // Lazily create the course-level record
        sqlx::query("INSERT OR IGNORE INTO course_progress (user_id, course_id) VALUES (?, ?)")
            .bind(user_id.to_string())
            .bind(course_id.to_string())
            .execute(&mut *tx)
            .await?;

        // Keyed upsert: never a second entry for the same lecture.
        // watch_time is set on first insert only; last_watched refreshes.
        sqlx::query(
            "INSERT INTO lecture_progress (user_id, course_id, lecture_id, is_completed)
             VALUES (?, ?, ?, 1)
             ON CONFLICT(user_id, course_id, lecture_id)
             DO UPDATE SET is_completed = 1, last_watched = CURRENT_TIMESTAMP",
        )
        .bind(user_id.to_string())
        .bind(course_id.to_string())
        .bind(lecture_id.to_string())
        .execute(&mut *tx)
        .await?;

        let completed = completed_count_tx(&mut tx, user_id, course_id).await?;
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM lectures WHERE course_id = ?")
            .bind(course_id.to_string())
            .fetch_one(&mut *tx)
            .await?;

        // Unreachable given the join above; guarded anyway.
        if completed > total {
            return Err(Error::InvariantViolation(format!(
                "{} completed entries against {} lectures for course {}",
                completed, total, course_id
            )));
        }

        sqlx::query(
            "UPDATE course_progress
             SET completion_percentage = ?, is_completed = ?, updated_at = CURRENT_TIMESTAMP
             WHERE user_id = ? AND course_id = ?",
        )
        .bind(completion_percentage(completed, total))
        .bind(completed == total && total > 0)
        .bind(user_id.to_string())
        .bind(course_id.to_string())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn completed_count(&self, user_id: Uuid, course_id: Uuid) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(COMPLETED_COUNT_SQL)
            .bind(user_id.to_string())
            .bind(course_id.to_string())
            .fetch_one(&self.db)
            .await?;

        Ok(count)
    }
}

// Entries only count while their lecture is still part of the course.
const COMPLETED_COUNT_SQL: &str = "SELECT COUNT(*)
     FROM lecture_progress lp
     INNER JOIN lectures l ON l.guid = lp.lecture_id AND l.course_id = lp.course_id
     WHERE lp.user_id = ? AND lp.course_id = ? AND lp.is_completed = 1";

async fn completed_count_tx(
    tx: &mut Transaction<'_, Sqlite>,
    user_id: Uuid,
    course_id: Uuid,
) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(COMPLETED_COUNT_SQL)
        .bind(user_id.to_string())
        .bind(course_id.to_string())
        .fetch_one(&mut **tx)
        .await?;

    Ok(count)
}

/// `round(100 * completed / total)`, 0 for an empty course
fn completion_percentage(completed: i64, total: i64) -> i64 {
    if total <= 0 {
        0
    } else {
        ((100.0 * completed as f64) / total as f64).round() as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lms_common::db::init::init_database;
    use tempfile::TempDir;

    async fn test_store() -> (TempDir, SqlitePool, ProgressStore) {
        let dir = TempDir::new().unwrap();
        let pool = init_database(&dir.path().join("lms.db")).await.unwrap();
        let store = ProgressStore::new(pool.clone(), CourseCatalog::new(pool.clone()));
        (dir, pool, store)
    }

    async fn insert_course_with_lectures(pool: &SqlitePool, lectures: i64) -> (Uuid, Vec<Uuid>) {
        let course_id = Uuid::new_v4();
        sqlx::query("INSERT INTO courses (guid, title, price) VALUES (?, 'Course', 0)")
            .bind(course_id.to_string())
            .execute(pool)
            .await
            .unwrap();

        let mut lecture_ids = Vec::new();
        for position in 0..lectures {
            let guid = Uuid::new_v4();
            sqlx::query("INSERT INTO lectures (guid, course_id, title, position) VALUES (?, ?, ?, ?)")
                .bind(guid.to_string())
                .bind(course_id.to_string())
                .bind(format!("Lecture {}", position))
                .bind(position)
                .execute(pool)
                .await
                .unwrap();
            lecture_ids.push(guid);
        }
        (course_id, lecture_ids)
    }

    #[test]
    fn test_completion_percentage_rounding() {
        assert_eq!(completion_percentage(0, 0), 0);
        assert_eq!(completion_percentage(0, 3), 0);
        assert_eq!(completion_percentage(1, 2), 50);
        assert_eq!(completion_percentage(1, 3), 33);
        assert_eq!(completion_percentage(2, 3), 67);
        assert_eq!(completion_percentage(3, 3), 100);
    }

    #[tokio::test]
    async fn test_repeated_watch_keeps_single_entry() {
        let (_dir, pool, store) = test_store().await;
        let (course_id, lectures) = insert_course_with_lectures(&pool, 2).await;
        let user_id = Uuid::new_v4();

        store.record_lecture_watched(user_id, course_id, lectures[0]).await.unwrap();
        let snapshot = store
            .record_lecture_watched(user_id, course_id, lectures[0])
            .await
            .unwrap();

        assert_eq!(snapshot.lecture_progress.len(), 1);
        assert!(snapshot.lecture_progress[0].is_completed);
        assert_eq!(snapshot.completion_percentage, 50);
        assert!(!snapshot.is_completed);

        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM lecture_progress WHERE user_id = ? AND course_id = ?",
        )
        .bind(user_id.to_string())
        .bind(course_id.to_string())
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_unknown_lecture_is_not_found() {
        let (_dir, pool, store) = test_store().await;
        let (course_id, _) = insert_course_with_lectures(&pool, 1).await;
        let (_other_course, other_lectures) = insert_course_with_lectures(&pool, 1).await;
        let user_id = Uuid::new_v4();

        // A lecture from another course does not belong here
        let result = store
            .record_lecture_watched(user_id, course_id, other_lectures[0])
            .await;
        assert!(matches!(result, Err(Error::NotFound(_))));

        // Neither does a missing course
        let result = store
            .record_lecture_watched(user_id, Uuid::new_v4(), other_lectures[0])
            .await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_get_progress_defaults_to_zero() {
        let (_dir, pool, store) = test_store().await;
        let (course_id, _) = insert_course_with_lectures(&pool, 3).await;
        let user_id = Uuid::new_v4();

        let snapshot = store.get_progress(user_id, course_id).await.unwrap();
        assert!(snapshot.lecture_progress.is_empty());
        assert_eq!(snapshot.completion_percentage, 0);
        assert!(!snapshot.is_completed);
    }

    #[tokio::test]
    async fn test_reset_progress() {
        let (_dir, pool, store) = test_store().await;
        let (course_id, lectures) = insert_course_with_lectures(&pool, 2).await;
        let user_id = Uuid::new_v4();

        for lecture_id in &lectures {
            store.record_lecture_watched(user_id, course_id, *lecture_id).await.unwrap();
        }

        store.reset_progress(user_id, course_id).await.unwrap();

        let snapshot = store.get_progress(user_id, course_id).await.unwrap();
        assert!(snapshot.lecture_progress.is_empty());
        assert_eq!(snapshot.completion_percentage, 0);
        assert!(!snapshot.is_completed);

        // Resetting a pair that never started is a no-op
        store.reset_progress(Uuid::new_v4(), course_id).await.unwrap();
    }
}
