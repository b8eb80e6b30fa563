//! Enrollment flow tests: checkout, webhook finalization, free enrollment

use lms_common::db::init::init_database;
use lms_common::db::models::{PaymentMethod, PurchaseStatus};
use lms_common::Error;
use lms_engine::coordinator::EnrollOutcome;
use lms_engine::ledger::{FinalizeOutcome, NewPendingPurchase};
use lms_engine::EnrollmentEngine;
use sqlx::SqlitePool;
use std::sync::Arc;
use tempfile::TempDir;
use uuid::Uuid;

async fn setup() -> (TempDir, SqlitePool, EnrollmentEngine) {
    let dir = TempDir::new().unwrap();
    let pool = init_database(&dir.path().join("lms.db")).await.unwrap();
    let engine = EnrollmentEngine::new(pool.clone());
    (dir, pool, engine)
}

async fn insert_course(pool: &SqlitePool, title: &str, price: i64) -> Uuid {
    let guid = Uuid::new_v4();
    sqlx::query("INSERT INTO courses (guid, title, price) VALUES (?, ?, ?)")
        .bind(guid.to_string())
        .bind(title)
        .bind(price)
        .execute(pool)
        .await
        .unwrap();
    guid
}

async fn backref_counts(pool: &SqlitePool, user_id: Uuid, course_id: Uuid) -> (i64, i64) {
    let user_side: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM user_enrolled_courses WHERE user_id = ? AND course_id = ?",
    )
    .bind(user_id.to_string())
    .bind(course_id.to_string())
    .fetch_one(pool)
    .await
    .unwrap();

    let course_side: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM course_enrolled_students WHERE course_id = ? AND user_id = ?",
    )
    .bind(course_id.to_string())
    .bind(user_id.to_string())
    .fetch_one(pool)
    .await
    .unwrap();

    (user_side, course_side)
}

#[tokio::test]
async fn test_paid_flow_checkout_to_finalization() {
    let (_dir, pool, engine) = setup().await;
    let user_id = Uuid::new_v4();
    let course_id = insert_course(&pool, "Full Stack Web Development", 499).await;

    let purchase = engine
        .create_pending_purchase(NewPendingPurchase {
            user_id,
            course_id,
            amount: 499,
            payment_method: PaymentMethod::Stripe,
            payment_id: "cs_session_1".to_string(),
        })
        .await
        .unwrap();

    assert_eq!(purchase.status, PurchaseStatus::Pending);
    assert!(!engine.has_completed_purchase(user_id, course_id).await.unwrap());
    assert_eq!(backref_counts(&pool, user_id, course_id).await, (0, 0));

    let outcome = engine.finalize_purchase("cs_session_1", Some(499)).await.unwrap();
    assert!(matches!(outcome, FinalizeOutcome::Completed(_)));

    assert!(engine.has_completed_purchase(user_id, course_id).await.unwrap());
    assert_eq!(backref_counts(&pool, user_id, course_id).await, (1, 1));

    let purchases = engine.get_completed_purchases(user_id).await.unwrap();
    assert_eq!(purchases.len(), 1);
    assert_eq!(purchases[0].course.title, "Full Stack Web Development");
}

#[tokio::test]
async fn test_webhook_delivered_twice() {
    // At-least-once delivery: the second webhook must be a harmless no-op.
    let (_dir, pool, engine) = setup().await;
    let user_id = Uuid::new_v4();
    let course_id = insert_course(&pool, "Course", 499).await;

    engine
        .create_pending_purchase(NewPendingPurchase {
            user_id,
            course_id,
            amount: 499,
            payment_method: PaymentMethod::Stripe,
            payment_id: "cs_x".to_string(),
        })
        .await
        .unwrap();

    let first = engine.finalize_purchase("cs_x", Some(450)).await.unwrap();
    assert!(matches!(first, FinalizeOutcome::Completed(_)));

    let second = engine.finalize_purchase("cs_x", Some(450)).await.unwrap();
    assert!(matches!(second, FinalizeOutcome::AlreadyCompleted(_)));

    let completed: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM purchases WHERE payment_id = 'cs_x' AND status = 'completed'",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(completed, 1);

    // Back-references added exactly once
    assert_eq!(backref_counts(&pool, user_id, course_id).await, (1, 1));
}

#[tokio::test]
async fn test_finalize_unknown_payment_id() {
    let (_dir, _pool, engine) = setup().await;

    let result = engine.finalize_purchase("cs_never_created", None).await;
    assert!(matches!(result, Err(Error::NotFound(_))));
}

#[tokio::test]
async fn test_free_enrollment_creates_completed_purchase() {
    let (_dir, pool, engine) = setup().await;
    let user_id = Uuid::new_v4();
    let course_id = insert_course(&pool, "Free Course", 0).await;

    let outcome = engine.enroll_free(user_id, course_id).await.unwrap();
    match outcome {
        EnrollOutcome::Enrolled(p) => {
            assert_eq!(p.status, PurchaseStatus::Completed);
            assert_eq!(p.amount, 0);
            assert_eq!(p.payment_method, PaymentMethod::Free);
        }
        other => panic!("Expected Enrolled, got {:?}", other),
    }

    assert!(engine.has_completed_purchase(user_id, course_id).await.unwrap());
}

#[tokio::test]
async fn test_free_enrollment_is_idempotent() {
    let (_dir, pool, engine) = setup().await;
    let user_id = Uuid::new_v4();
    let course_id = insert_course(&pool, "Free Course", 0).await;

    let first = engine.enroll_free(user_id, course_id).await.unwrap();
    assert!(matches!(first, EnrollOutcome::Enrolled(_)));

    let second = engine.enroll_free(user_id, course_id).await.unwrap();
    assert!(matches!(second, EnrollOutcome::AlreadyEnrolled));

    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM purchases WHERE user_id = ? AND course_id = ?",
    )
    .bind(user_id.to_string())
    .bind(course_id.to_string())
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(count, 1, "Repeated free enrollment must never create a second purchase");
}

#[tokio::test]
async fn test_pending_purchase_rejected_when_already_enrolled() {
    let (_dir, pool, engine) = setup().await;
    let user_id = Uuid::new_v4();
    let course_id = insert_course(&pool, "Free Course", 0).await;

    engine.enroll_free(user_id, course_id).await.unwrap();

    let result = engine
        .create_pending_purchase(NewPendingPurchase {
            user_id,
            course_id,
            amount: 499,
            payment_method: PaymentMethod::Stripe,
            payment_id: "cs_dup".to_string(),
        })
        .await;

    assert!(matches!(result, Err(Error::AlreadyEnrolled { .. })));
}

#[tokio::test]
async fn test_concurrent_free_enrollment_single_purchase() {
    let (_dir, pool, engine) = setup().await;
    let user_id = Uuid::new_v4();
    let course_id = insert_course(&pool, "Free Course", 0).await;

    let engine = Arc::new(engine);
    let mut handles = vec![];
    for _ in 0..5 {
        let engine = Arc::clone(&engine);
        handles.push(tokio::spawn(async move { engine.enroll_free(user_id, course_id).await }));
    }

    let mut enrolled = 0;
    for handle in handles {
        match handle.await.unwrap().unwrap() {
            EnrollOutcome::Enrolled(_) => enrolled += 1,
            EnrollOutcome::AlreadyEnrolled => {}
        }
    }

    assert_eq!(enrolled, 1, "Exactly one request should create the purchase");

    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM purchases WHERE user_id = ? AND course_id = ?",
    )
    .bind(user_id.to_string())
    .bind(course_id.to_string())
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(count, 1);

    assert_eq!(backref_counts(&pool, user_id, course_id).await, (1, 1));
}
