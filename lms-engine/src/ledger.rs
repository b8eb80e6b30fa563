//! Enrollment ledger
//!
//! Purchase records are the authoritative enrollment truth. The schema
//! enforces at most one `completed` purchase per (user, course) pair, so
//! every operation here treats a duplicate-completion race as a normal
//! branch rather than an error path.

use crate::catalog::CourseCatalog;
use crate::parse_db_uuid;
use chrono::{DateTime, Utc};
use lms_common::db::init::setting_string;
use lms_common::db::models::{
    CompletedPurchase, CourseSummary, PaymentMethod, Purchase, PurchaseStatus,
};
use lms_common::{Error, Result};
use sqlx::SqlitePool;
use uuid::Uuid;

const PURCHASE_COLUMNS: &str =
    "guid, user_id, course_id, amount, currency, status, payment_method, payment_id, created_at";

type PurchaseRow = (
    String,
    String,
    String,
    i64,
    String,
    String,
    String,
    String,
    DateTime<Utc>,
);

/// Input for a pending (paid-flow) purchase record
#[derive(Debug, Clone)]
pub struct NewPendingPurchase {
    pub user_id: Uuid,
    pub course_id: Uuid,
    /// Quoted price at checkout time, in whole currency units
    pub amount: i64,
    pub payment_method: PaymentMethod,
    /// Gateway checkout/session id; unique per payment attempt
    pub payment_id: String,
}

/// Result of finalizing a purchase by payment id.
///
/// Payment webhooks are delivered at least once; the redelivery and the
/// lost-race cases are ordinary outcomes here, not exceptions.
#[derive(Debug, Clone)]
pub enum FinalizeOutcome {
    /// This call transitioned the purchase to completed
    Completed(Purchase),
    /// The purchase was already completed (webhook redelivery, or a
    /// concurrent finalization won)
    AlreadyCompleted(Purchase),
    /// A different purchase already completed this (user, course) pair;
    /// the record is left pending and the user is simply enrolled
    SupersededByExistingEnrollment(Purchase),
}

/// Course view with the caller's enrollment state attached
#[derive(Debug, Clone, serde::Serialize)]
pub struct PurchaseStatusView {
    pub course: CourseSummary,
    pub is_purchased: bool,
}

pub struct EnrollmentLedger {
    db: SqlitePool,
    catalog: CourseCatalog,
}

impl EnrollmentLedger {
    pub fn new(db: SqlitePool, catalog: CourseCatalog) -> Self {
        Self { db, catalog }
    }

    /// Authoritative enrollment check: does a completed purchase exist?
    pub async fn has_completed_purchase(&self, user_id: Uuid, course_id: Uuid) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM purchases WHERE user_id = ? AND course_id = ? AND status = 'completed')",
        )
        .bind(user_id.to_string())
        .bind(course_id.to_string())
        .fetch_one(&self.db)
        .await?;

        Ok(exists)
    }

    pub async fn find_by_payment_id(&self, payment_id: &str) -> Result<Option<Purchase>> {
        let sql = format!("SELECT {} FROM purchases WHERE payment_id = ?", PURCHASE_COLUMNS);
        let row: Option<PurchaseRow> = sqlx::query_as(&sql)
            .bind(payment_id)
            .fetch_optional(&self.db)
            .await?;

        row.map(purchase_from_row).transpose()
    }

    /// Record a pending purchase for the paid flow.
    ///
    /// Fails with [`Error::AlreadyEnrolled`] when a completed purchase
    /// already exists for the pair, and [`Error::NotFound`] when the
    /// course is missing.
    pub async fn create_pending_purchase(&self, input: NewPendingPurchase) -> Result<Purchase> {
        if !self.catalog.course_exists(input.course_id).await? {
            return Err(Error::NotFound(format!("course {}", input.course_id)));
        }

        if self.has_completed_purchase(input.user_id, input.course_id).await? {
            return Err(Error::AlreadyEnrolled {
                user_id: input.user_id,
                course_id: input.course_id,
            });
        }

        let currency = setting_string(&self.db, "currency", "INR").await?;
        let guid = Uuid::new_v4();

        sqlx::query(
            "INSERT INTO purchases (guid, user_id, course_id, amount, currency, status, payment_method, payment_id)
             VALUES (?, ?, ?, ?, ?, 'pending', ?, ?)",
        )
        .bind(guid.to_string())
        .bind(input.user_id.to_string())
        .bind(input.course_id.to_string())
        .bind(input.amount)
        .bind(&currency)
        .bind(input.payment_method.as_str())
        .bind(&input.payment_id)
        .execute(&self.db)
        .await?;

        tracing::info!(
            purchase_id = %guid,
            user_id = %input.user_id,
            course_id = %input.course_id,
            payment_id = %input.payment_id,
            "Created pending purchase"
        );

        self.fetch_by_payment_id(&input.payment_id).await
    }

    /// Transition a purchase to completed by its payment id.
    ///
    /// Idempotent under at-least-once webhook delivery: the transition is
    /// a compare-and-set, and a record that is already completed reports
    /// [`FinalizeOutcome::AlreadyCompleted`] without touching anything.
    /// When the confirmed amount is present it replaces the quoted one.
    pub async fn complete_by_payment_id(
        &self,
        payment_id: &str,
        confirmed_amount: Option<i64>,
    ) -> Result<FinalizeOutcome> {
        let purchase = self
            .find_by_payment_id(payment_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("purchase with payment id {}", payment_id)))?;

        if purchase.status == PurchaseStatus::Completed {
            tracing::debug!(payment_id, "Purchase already completed, finalization is a no-op");
            return Ok(FinalizeOutcome::AlreadyCompleted(purchase));
        }

        let amount = confirmed_amount.unwrap_or(purchase.amount);
        let update = sqlx::query(
            "UPDATE purchases SET status = 'completed', amount = ?, updated_at = CURRENT_TIMESTAMP
             WHERE payment_id = ? AND status != 'completed'",
        )
        .bind(amount)
        .bind(payment_id)
        .execute(&self.db)
        .await;

        match update {
            Ok(done) if done.rows_affected() == 1 => {
                let completed = self.fetch_by_payment_id(payment_id).await?;
                tracing::info!(
                    payment_id,
                    user_id = %completed.user_id,
                    course_id = %completed.course_id,
                    amount,
                    "Purchase completed"
                );
                Ok(FinalizeOutcome::Completed(completed))
            }
            Ok(_) => {
                // A concurrent finalization won the compare-and-set
                let completed = self.fetch_by_payment_id(payment_id).await?;
                tracing::debug!(payment_id, "Concurrent finalization already completed purchase");
                Ok(FinalizeOutcome::AlreadyCompleted(completed))
            }
            Err(e) => {
                let err = Error::from(e);
                if err.is_unique_violation() {
                    // A different purchase already completed this pair
                    tracing::warn!(
                        payment_id,
                        user_id = %purchase.user_id,
                        course_id = %purchase.course_id,
                        "Pair already enrolled through another purchase; record left pending"
                    );
                    Ok(FinalizeOutcome::SupersededByExistingEnrollment(purchase))
                } else {
                    Err(err)
                }
            }
        }
    }

    /// Insert a directly-completed purchase (free or manual enrollment).
    ///
    /// Returns `None` when the partial unique index rejects the insert
    /// because the pair already holds a completed purchase.
    pub(crate) async fn insert_completed(
        &self,
        user_id: Uuid,
        course_id: Uuid,
        amount: i64,
        payment_method: PaymentMethod,
        payment_id: &str,
    ) -> Result<Option<Purchase>> {
        let currency = setting_string(&self.db, "currency", "INR").await?;
        let guid = Uuid::new_v4();

        let insert = sqlx::query(
            "INSERT INTO purchases (guid, user_id, course_id, amount, currency, status, payment_method, payment_id)
             VALUES (?, ?, ?, ?, ?, 'completed', ?, ?)",
        )
        .bind(guid.to_string())
        .bind(user_id.to_string())
        .bind(course_id.to_string())
        .bind(amount)
        .bind(&currency)
        .bind(payment_method.as_str())
        .bind(payment_id)
        .execute(&self.db)
        .await;

        match insert {
            Ok(_) => {
                tracing::info!(
                    purchase_id = %guid,
                    user_id = %user_id,
                    course_id = %course_id,
                    method = payment_method.as_str(),
                    "Created completed purchase"
                );
                Ok(Some(self.fetch_by_payment_id(payment_id).await?))
            }
            Err(e) => {
                let err = Error::from(e);
                if err.is_unique_violation() {
                    tracing::debug!(
                        user_id = %user_id,
                        course_id = %course_id,
                        "Completed purchase already exists for pair"
                    );
                    Ok(None)
                } else {
                    Err(err)
                }
            }
        }
    }

    /// All completed purchases of a user, resolved against the catalog.
    ///
    /// Purchases whose course has been deleted are filtered out rather
    /// than surfaced as broken records.
    pub async fn get_completed_purchases(&self, user_id: Uuid) -> Result<Vec<CompletedPurchase>> {
        let rows: Vec<(
            String,
            String,
            String,
            i64,
            String,
            String,
            String,
            String,
            DateTime<Utc>,
            String,
            Option<String>,
            i64,
            String,
        )> = sqlx::query_as(
            "SELECT p.guid, p.user_id, p.course_id, p.amount, p.currency, p.status,
                    p.payment_method, p.payment_id, p.created_at,
                    c.title, c.category, c.price, c.currency
             FROM purchases p
             INNER JOIN courses c ON c.guid = p.course_id
             WHERE p.user_id = ? AND p.status = 'completed'
             ORDER BY p.created_at DESC",
        )
        .bind(user_id.to_string())
        .fetch_all(&self.db)
        .await?;

        rows.into_iter()
            .map(|row| {
                let (
                    guid,
                    user,
                    course,
                    amount,
                    currency,
                    status,
                    method,
                    payment_id,
                    created_at,
                    title,
                    category,
                    price,
                    course_currency,
                ) = row;
                let purchase = purchase_from_row((
                    guid, user, course, amount, currency, status, method, payment_id, created_at,
                ))?;
                let course = CourseSummary {
                    guid: purchase.course_id,
                    title,
                    category,
                    price,
                    currency: course_currency,
                };
                Ok(CompletedPurchase { purchase, course })
            })
            .collect()
    }

    /// Course summary plus the caller's enrollment flag
    pub async fn purchase_status(&self, user_id: Uuid, course_id: Uuid) -> Result<PurchaseStatusView> {
        let course = self
            .catalog
            .course_summary(course_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("course {}", course_id)))?;

        let is_purchased = self.has_completed_purchase(user_id, course_id).await?;

        Ok(PurchaseStatusView { course, is_purchased })
    }

    async fn fetch_by_payment_id(&self, payment_id: &str) -> Result<Purchase> {
        self.find_by_payment_id(payment_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("purchase with payment id {}", payment_id)))
    }
}

fn purchase_from_row(row: PurchaseRow) -> Result<Purchase> {
    let (guid, user_id, course_id, amount, currency, status, method, payment_id, created_at) = row;

    Ok(Purchase {
        guid: parse_db_uuid(&guid)?,
        user_id: parse_db_uuid(&user_id)?,
        course_id: parse_db_uuid(&course_id)?,
        amount,
        currency,
        status: PurchaseStatus::parse(&status)
            .ok_or_else(|| Error::Internal(format!("Invalid purchase status in database: {}", status)))?,
        payment_method: PaymentMethod::parse(&method)
            .ok_or_else(|| Error::Internal(format!("Invalid payment method in database: {}", method)))?,
        payment_id,
        created_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use lms_common::db::init::init_database;
    use tempfile::TempDir;

    async fn test_ledger() -> (TempDir, SqlitePool, EnrollmentLedger) {
        let dir = TempDir::new().unwrap();
        let pool = init_database(&dir.path().join("lms.db")).await.unwrap();
        let ledger = EnrollmentLedger::new(pool.clone(), CourseCatalog::new(pool.clone()));
        (dir, pool, ledger)
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

    fn pending(user_id: Uuid, course_id: Uuid, payment_id: &str) -> NewPendingPurchase {
        NewPendingPurchase {
            user_id,
            course_id,
            amount: 499,
            payment_method: PaymentMethod::Stripe,
            payment_id: payment_id.to_string(),
        }
    }

    #[tokio::test]
    async fn test_create_pending_purchase() {
        let (_dir, pool, ledger) = test_ledger().await;
        let user_id = Uuid::new_v4();
        let course_id = insert_course(&pool, "Rust", 499).await;

        let purchase = ledger
            .create_pending_purchase(pending(user_id, course_id, "cs_1"))
            .await
            .unwrap();

        assert_eq!(purchase.status, PurchaseStatus::Pending);
        assert_eq!(purchase.amount, 499);
        assert_eq!(purchase.currency, "INR");
        assert!(!ledger.has_completed_purchase(user_id, course_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_create_pending_requires_course() {
        let (_dir, _pool, ledger) = test_ledger().await;

        let result = ledger
            .create_pending_purchase(pending(Uuid::new_v4(), Uuid::new_v4(), "cs_1"))
            .await;

        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_create_pending_rejects_enrolled_pair() {
        let (_dir, pool, ledger) = test_ledger().await;
        let user_id = Uuid::new_v4();
        let course_id = insert_course(&pool, "Rust", 499).await;

        ledger
            .insert_completed(user_id, course_id, 499, PaymentMethod::Stripe, "cs_done")
            .await
            .unwrap()
            .unwrap();

        let result = ledger
            .create_pending_purchase(pending(user_id, course_id, "cs_again"))
            .await;

        assert!(matches!(result, Err(Error::AlreadyEnrolled { .. })));
    }

    #[tokio::test]
    async fn test_complete_by_payment_id_is_idempotent() {
        let (_dir, pool, ledger) = test_ledger().await;
        let user_id = Uuid::new_v4();
        let course_id = insert_course(&pool, "Rust", 499).await;

        ledger
            .create_pending_purchase(pending(user_id, course_id, "cs_1"))
            .await
            .unwrap();

        let first = ledger.complete_by_payment_id("cs_1", Some(450)).await.unwrap();
        match first {
            FinalizeOutcome::Completed(p) => {
                assert_eq!(p.status, PurchaseStatus::Completed);
                assert_eq!(p.amount, 450, "confirmed amount should replace the quote");
            }
            other => panic!("Expected Completed, got {:?}", other),
        }

        let second = ledger.complete_by_payment_id("cs_1", Some(450)).await.unwrap();
        assert!(matches!(second, FinalizeOutcome::AlreadyCompleted(_)));

        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM purchases WHERE payment_id = 'cs_1' AND status = 'completed'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_complete_unknown_payment_id() {
        let (_dir, _pool, ledger) = test_ledger().await;

        let result = ledger.complete_by_payment_id("cs_missing", None).await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_complete_superseded_by_existing_enrollment() {
        let (_dir, pool, ledger) = test_ledger().await;
        let user_id = Uuid::new_v4();
        let course_id = insert_course(&pool, "Rust", 499).await;

        // The pair enrolls through one purchase while another is pending
        ledger
            .create_pending_purchase(pending(user_id, course_id, "cs_slow"))
            .await
            .unwrap();
        ledger
            .insert_completed(user_id, course_id, 0, PaymentMethod::Free, "free_1")
            .await
            .unwrap()
            .unwrap();

        let outcome = ledger.complete_by_payment_id("cs_slow", Some(499)).await.unwrap();
        match outcome {
            FinalizeOutcome::SupersededByExistingEnrollment(p) => {
                assert_eq!(p.payment_id, "cs_slow");
            }
            other => panic!("Expected SupersededByExistingEnrollment, got {:?}", other),
        }

        // The redundant record stays pending
        let status: String =
            sqlx::query_scalar("SELECT status FROM purchases WHERE payment_id = 'cs_slow'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(status, "pending");
    }

    #[tokio::test]
    async fn test_insert_completed_collapses_duplicates() {
        let (_dir, pool, ledger) = test_ledger().await;
        let user_id = Uuid::new_v4();
        let course_id = insert_course(&pool, "Rust", 0).await;

        let first = ledger
            .insert_completed(user_id, course_id, 0, PaymentMethod::Free, "free_1")
            .await
            .unwrap();
        assert!(first.is_some());

        let second = ledger
            .insert_completed(user_id, course_id, 0, PaymentMethod::Free, "free_2")
            .await
            .unwrap();
        assert!(second.is_none(), "Second completed insert must collapse onto the first");

        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM purchases WHERE user_id = ? AND course_id = ?",
        )
        .bind(user_id.to_string())
        .bind(course_id.to_string())
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_completed_purchases_filter_deleted_courses() {
        let (_dir, pool, ledger) = test_ledger().await;
        let user_id = Uuid::new_v4();
        let kept = insert_course(&pool, "Kept", 0).await;
        let deleted = insert_course(&pool, "Deleted", 0).await;

        ledger
            .insert_completed(user_id, kept, 0, PaymentMethod::Free, "free_kept")
            .await
            .unwrap()
            .unwrap();
        ledger
            .insert_completed(user_id, deleted, 0, PaymentMethod::Free, "free_deleted")
            .await
            .unwrap()
            .unwrap();

        sqlx::query("DELETE FROM courses WHERE guid = ?")
            .bind(deleted.to_string())
            .execute(&pool)
            .await
            .unwrap();

        let purchases = ledger.get_completed_purchases(user_id).await.unwrap();
        assert_eq!(purchases.len(), 1);
        assert_eq!(purchases[0].course.guid, kept);
        assert_eq!(purchases[0].course.title, "Kept");

        // The ledger row itself survives; only the listing filters it
        let raw: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM purchases WHERE user_id = ?")
            .bind(user_id.to_string())
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(raw, 2);
    }

    #[tokio::test]
    async fn test_purchase_status_view() {
        let (_dir, pool, ledger) = test_ledger().await;
        let user_id = Uuid::new_v4();
        let course_id = insert_course(&pool, "Rust", 499).await;

        let before = ledger.purchase_status(user_id, course_id).await.unwrap();
        assert!(!before.is_purchased);

        ledger
            .insert_completed(user_id, course_id, 499, PaymentMethod::Manual, "manual_1")
            .await
            .unwrap()
            .unwrap();

        let after = ledger.purchase_status(user_id, course_id).await.unwrap();
        assert!(after.is_purchased);
        assert_eq!(after.course.title, "Rust");

        let missing = ledger.purchase_status(user_id, Uuid::new_v4()).await;
        assert!(matches!(missing, Err(Error::NotFound(_))));
    }
}
