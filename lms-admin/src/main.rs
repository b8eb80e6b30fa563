//! lms-admin - Operator maintenance CLI
//!
//! Seeding, manual enrollment, and consistency checks over the LMS
//! database. Every mutation goes through the enrollment engine so the
//! ledger invariants hold for operator actions exactly as they do for
//! request traffic.

use anyhow::Result;
use clap::{Parser, Subcommand};
use lms_common::config::{database_path, resolve_data_folder};
use lms_common::db::init::init_database;
use lms_engine::coordinator::EnrollOutcome;
use lms_engine::EnrollmentEngine;
use sqlx::SqlitePool;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "lms-admin", version, about = "LMS operator maintenance tool")]
struct Cli {
    /// Data folder containing lms.db (overrides env var and config file)
    #[arg(long)]
    data_folder: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Insert demo users, courses, and lectures (idempotent)
    Seed,
    /// List courses with lecture and enrollment counts
    Courses,
    /// Enroll a user in a course without a payment flow
    Enroll {
        /// Email of the user to enroll
        #[arg(long)]
        email: String,
        /// Title of the course to enroll into
        #[arg(long)]
        course: String,
    },
    /// Check ledger / back-reference / progress agreement (read-only)
    Audit,
    /// Re-apply enrollment back-reference writes that failed earlier
    Reconcile,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    info!("Starting LMS admin tool v{}", env!("CARGO_PKG_VERSION"));

    let cli = Cli::parse();
    let data_folder = resolve_data_folder(cli.data_folder.as_deref())?;
    let db_path = database_path(&data_folder);
    info!("Database path: {}", db_path.display());

    let pool = init_database(&db_path).await?;
    let engine = EnrollmentEngine::new(pool.clone());

    match cli.command {
        Command::Seed => seed(&pool).await?,
        Command::Courses => list_courses(&pool).await?,
        Command::Enroll { email, course } => enroll(&pool, &engine, &email, &course).await?,
        Command::Audit => audit(&engine).await?,
        Command::Reconcile => reconcile(&engine).await?,
    }

    Ok(())
}

async fn enroll(
    pool: &SqlitePool,
    engine: &EnrollmentEngine,
    email: &str,
    course_title: &str,
) -> Result<()> {
    let user: Option<(String, String)> = sqlx::query_as("SELECT guid, name FROM users WHERE email = ?")
        .bind(email)
        .fetch_optional(pool)
        .await?;
    let Some((user_guid, user_name)) = user else {
        anyhow::bail!("No user with email '{}'", email);
    };

    let course: Option<(String,)> = sqlx::query_as("SELECT guid FROM courses WHERE title = ?")
        .bind(course_title)
        .fetch_optional(pool)
        .await?;
    let Some((course_guid,)) = course else {
        anyhow::bail!("No course titled '{}'", course_title);
    };

    let user_id = Uuid::parse_str(&user_guid)?;
    let course_id = Uuid::parse_str(&course_guid)?;

    match engine.enroll_manual(user_id, course_id).await? {
        EnrollOutcome::Enrolled(purchase) => {
            info!(
                purchase_id = %purchase.guid,
                amount = purchase.amount,
                "Enrolled '{}' in '{}'",
                user_name,
                course_title
            );
        }
        EnrollOutcome::AlreadyEnrolled => {
            info!("'{}' is already enrolled in '{}'", user_name, course_title);
        }
    }

    Ok(())
}

async fn list_courses(pool: &SqlitePool) -> Result<()> {
    let rows: Vec<(String, String, i64, i64, i64, i64)> = sqlx::query_as(
        "SELECT c.guid, c.title, c.price,
                (SELECT COUNT(*) FROM lectures l WHERE l.course_id = c.guid),
                (SELECT COUNT(*) FROM course_enrolled_students s WHERE s.course_id = c.guid),
                (SELECT COUNT(*) FROM purchases p WHERE p.course_id = c.guid AND p.status = 'completed')
         FROM courses c
         ORDER BY c.title",
    )
    .fetch_all(pool)
    .await?;

    if rows.is_empty() {
        info!("No courses in database");
        return Ok(());
    }

    for (guid, title, price, lectures, enrolled_cached, enrolled_ledger) in rows {
        info!(
            course_id = %guid,
            price,
            lectures,
            enrolled = enrolled_ledger,
            "{}",
            title
        );

        if enrolled_cached != enrolled_ledger {
            warn!(
                course_id = %guid,
                cached = enrolled_cached,
                ledger = enrolled_ledger,
                "Enrolled-students cache disagrees with ledger; run `lms-admin reconcile`"
            );
        }
    }

    Ok(())
}

async fn audit(engine: &EnrollmentEngine) -> Result<()> {
    let report = engine.audit_consistency().await?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if report.is_clean() {
        info!("No inconsistencies found");
    } else {
        warn!("Inconsistencies found; see report above");
    }

    Ok(())
}

async fn reconcile(engine: &EnrollmentEngine) -> Result<()> {
    let report = engine.reconcile_enrollments().await?;
    info!(
        repaired = report.repaired,
        remaining = report.remaining,
        "Enrollment reconciliation finished"
    );

    Ok(())
}

async fn seed(pool: &SqlitePool) -> Result<()> {
    ensure_user(pool, "student@example.com", "Demo Student").await?;
    ensure_user(pool, "learner@example.com", "Second Learner").await?;

    let web = ensure_course(
        pool,
        "Full Stack Web Development",
        499,
        Some("Development"),
        Some("Build and deploy a complete web application."),
    )
    .await?;
    for (position, title) in ["Environment Setup", "Backend Fundamentals", "Shipping to Production"]
        .iter()
        .enumerate()
    {
        ensure_lecture(pool, web, position as i64, title).await?;
    }

    let intro = ensure_course(
        pool,
        "Introduction to Programming",
        0,
        Some("Basics"),
        Some("A free starter course, no prerequisites."),
    )
    .await?;
    for (position, title) in ["Thinking in Programs", "Your First Project"].iter().enumerate() {
        ensure_lecture(pool, intro, position as i64, title).await?;
    }

    info!("Seed data ready");
    Ok(())
}

async fn ensure_user(pool: &SqlitePool, email: &str, name: &str) -> Result<Uuid> {
    let existing: Option<(String,)> = sqlx::query_as("SELECT guid FROM users WHERE email = ?")
        .bind(email)
        .fetch_optional(pool)
        .await?;

    if let Some((guid,)) = existing {
        return Ok(Uuid::parse_str(&guid)?);
    }

    let guid = Uuid::new_v4();
    sqlx::query("INSERT INTO users (guid, name, email) VALUES (?, ?, ?)")
        .bind(guid.to_string())
        .bind(name)
        .bind(email)
        .execute(pool)
        .await?;

    info!(user_id = %guid, email, "Created user");
    Ok(guid)
}

async fn ensure_course(
    pool: &SqlitePool,
    title: &str,
    price: i64,
    category: Option<&str>,
    description: Option<&str>,
) -> Result<Uuid> {
    let existing: Option<(String,)> = sqlx::query_as("SELECT guid FROM courses WHERE title = ?")
        .bind(title)
        .fetch_optional(pool)
        .await?;

    if let Some((guid,)) = existing {
        return Ok(Uuid::parse_str(&guid)?);
    }

    let guid = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO courses (guid, title, description, category, price) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(guid.to_string())
    .bind(title)
    .bind(description)
    .bind(category)
    .bind(price)
    .execute(pool)
    .await?;

    info!(course_id = %guid, price, "Created course '{}'", title);
    Ok(guid)
}

async fn ensure_lecture(pool: &SqlitePool, course_id: Uuid, position: i64, title: &str) -> Result<()> {
    // UNIQUE(course_id, position) makes repeated seeding a no-op
    sqlx::query(
        "INSERT OR IGNORE INTO lectures (guid, course_id, title, position) VALUES (?, ?, ?, ?)",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(course_id.to_string())
    .bind(title)
    .bind(position)
    .execute(pool)
    .await?;

    Ok(())
}
