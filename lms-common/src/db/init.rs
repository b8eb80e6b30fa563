//! Database initialization
//!
//! Creates the database on first run and brings an existing one up to the
//! expected schema. Safe to call from multiple processes concurrently; all
//! statements are idempotent.
//!
//! Two constraints here carry the enrollment/progress consistency rules:
//! - `lecture_progress` is keyed by `(user_id, course_id, lecture_id)`, so
//!   at most one entry can exist per lecture of a user's course progress.
//! - a partial unique index on `purchases` admits at most one `completed`
//!   purchase per (user, course) pair.

use crate::Result;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::path::Path;
use tracing::{info, warn};

/// Initialize database connection and create tables if needed
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    // Create parent directory if it doesn't exist
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .min_connections(1)
        .connect(&db_url)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    // Enforce declared foreign keys (lectures -> courses)
    sqlx::query("PRAGMA foreign_keys = ON").execute(&pool).await?;

    // WAL allows concurrent readers while one writer holds the lock;
    // enrollment and progress writes are frequent and small.
    sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;

    // Initial busy timeout; re-applied from settings once they exist
    sqlx::query("PRAGMA busy_timeout = 5000").execute(&pool).await?;

    create_settings_table(&pool).await?;
    create_users_table(&pool).await?;
    create_courses_table(&pool).await?;
    create_lectures_table(&pool).await?;
    create_purchases_table(&pool).await?;
    create_enrollment_backref_tables(&pool).await?;
    create_progress_tables(&pool).await?;
    create_enrollment_repairs_table(&pool).await?;

    init_default_settings(&pool).await?;

    // Apply configurable busy timeout from settings
    let timeout_ms: i64 =
        sqlx::query_scalar("SELECT CAST(value AS INTEGER) FROM settings WHERE key = 'db_busy_timeout_ms'")
            .fetch_optional(&pool)
            .await?
            .unwrap_or(5000);

    let pragma_sql = format!("PRAGMA busy_timeout = {}", timeout_ms);
    sqlx::query(&pragma_sql).execute(&pool).await?;

    Ok(pool)
}

/// Create the settings table
///
/// Stores runtime tunables as key-value pairs.
pub async fn create_settings_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_users_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            guid TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            email TEXT NOT NULL UNIQUE,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_courses_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS courses (
            guid TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            description TEXT,
            category TEXT,
            price INTEGER NOT NULL DEFAULT 0,
            currency TEXT NOT NULL DEFAULT 'INR',
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            CHECK (price >= 0)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_courses_title ON courses(title)")
        .execute(pool)
        .await?;

    Ok(())
}

/// Create the lectures table
///
/// The ordered lecture sequence of a course; authoritative for lecture
/// counts and membership checks.
pub async fn create_lectures_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS lectures (
            guid TEXT PRIMARY KEY,
            course_id TEXT NOT NULL REFERENCES courses(guid) ON DELETE CASCADE,
            title TEXT NOT NULL,
            position INTEGER NOT NULL,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            UNIQUE (course_id, position),
            CHECK (position >= 0)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_lectures_course ON lectures(course_id)")
        .execute(pool)
        .await?;

    Ok(())
}

/// Create the purchases table (the enrollment ledger)
///
/// No foreign keys into users/courses: the ledger must survive catalog
/// deletions, and listings filter orphaned records instead.
pub async fn create_purchases_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS purchases (
            guid TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            course_id TEXT NOT NULL,
            amount INTEGER NOT NULL DEFAULT 0,
            currency TEXT NOT NULL DEFAULT 'INR',
            status TEXT NOT NULL DEFAULT 'pending' CHECK (status IN ('pending', 'completed', 'failed')),
            payment_method TEXT NOT NULL CHECK (payment_method IN ('stripe', 'razorpay', 'free', 'manual')),
            payment_id TEXT NOT NULL UNIQUE,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            CHECK (amount >= 0)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // At most one completed purchase per (user, course) pair
    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_purchases_completed_pair
        ON purchases(user_id, course_id) WHERE status = 'completed'
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_purchases_user ON purchases(user_id, status)")
        .execute(pool)
        .await?;

    Ok(())
}

/// Create the back-reference set tables
///
/// Denormalized caches of enrollment for fast listing; the purchases
/// ledger stays authoritative. Primary keys give both tables set
/// semantics under `INSERT OR IGNORE`.
pub async fn create_enrollment_backref_tables(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS user_enrolled_courses (
            user_id TEXT NOT NULL,
            course_id TEXT NOT NULL,
            added_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            PRIMARY KEY (user_id, course_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS course_enrolled_students (
            course_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            added_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            PRIMARY KEY (course_id, user_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the progress tables
///
/// `lecture_progress` is a keyed map: the primary key is the lecture-id
/// index, so a second entry for the same lecture is a constraint
/// violation rather than a latent duplicate.
pub async fn create_progress_tables(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS course_progress (
            user_id TEXT NOT NULL,
            course_id TEXT NOT NULL,
            completion_percentage INTEGER NOT NULL DEFAULT 0,
            is_completed INTEGER NOT NULL DEFAULT 0,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            PRIMARY KEY (user_id, course_id),
            CHECK (completion_percentage >= 0 AND completion_percentage <= 100)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS lecture_progress (
            user_id TEXT NOT NULL,
            course_id TEXT NOT NULL,
            lecture_id TEXT NOT NULL,
            is_completed INTEGER NOT NULL DEFAULT 0,
            watch_time TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            last_watched TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            PRIMARY KEY (user_id, course_id, lecture_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_lecture_progress_course ON lecture_progress(course_id, lecture_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the enrollment repairs queue
///
/// Pairs whose back-reference writes failed after a purchase completed;
/// drained by reconciliation. The purchase itself is never rolled back.
pub async fn create_enrollment_repairs_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS enrollment_repairs (
            user_id TEXT NOT NULL,
            course_id TEXT NOT NULL,
            recorded_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            PRIMARY KEY (user_id, course_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Initialize or update default settings
async fn init_default_settings(pool: &SqlitePool) -> Result<()> {
    // Purchase records carry this currency unless the course says otherwise
    ensure_setting(pool, "currency", "INR").await?;

    // Write-conflict retry budget
    ensure_setting(pool, "db_max_lock_attempts", "5").await?;
    ensure_setting(pool, "db_lock_retry_ms", "10").await?;
    ensure_setting(pool, "db_busy_timeout_ms", "5000").await?;

    info!("Default settings initialized");
    Ok(())
}

/// Ensure a setting exists with the specified default value
///
/// If the setting doesn't exist, it will be created with the default.
/// If the setting exists but has a NULL value, it will be reset to the default.
pub async fn ensure_setting(pool: &SqlitePool, key: &str, default_value: &str) -> Result<()> {
    let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM settings WHERE key = ?)")
        .bind(key)
        .fetch_one(pool)
        .await?;

    if !exists {
        // Multiple processes may pass the exists check simultaneously
        sqlx::query("INSERT OR IGNORE INTO settings (key, value) VALUES (?, ?)")
            .bind(key)
            .bind(default_value)
            .execute(pool)
            .await?;

        info!("Initialized setting '{}' with default value: {}", key, default_value);
        return Ok(());
    }

    let value: Option<String> = sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
        .bind(key)
        .fetch_one(pool)
        .await?;

    if value.is_none() {
        sqlx::query("UPDATE settings SET value = ? WHERE key = ?")
            .bind(default_value)
            .bind(key)
            .execute(pool)
            .await?;

        warn!("Setting '{}' was NULL, reset to default: {}", key, default_value);
    }

    Ok(())
}

/// Read an integer setting, falling back to a default when absent
pub async fn setting_i64(pool: &SqlitePool, key: &str, default: i64) -> Result<i64> {
    let value: Option<i64> =
        sqlx::query_scalar("SELECT CAST(value AS INTEGER) FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(pool)
            .await?;

    Ok(value.unwrap_or(default))
}

/// Read a string setting, falling back to a default when absent
pub async fn setting_string(pool: &SqlitePool, key: &str, default: &str) -> Result<String> {
    let value: Option<String> = sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await?;

    Ok(value.unwrap_or_else(|| default.to_string()))
}
