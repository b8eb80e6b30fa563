//! Consistency coordinator
//!
//! [`EnrollmentEngine`] is the public face of this crate: it wires the
//! catalog, ledger, and progress store over one injected pool and owns
//! every update that spans more than one of them.
//!
//! Enrollment truth lives in the purchases ledger. The back-reference
//! sets (`user_enrolled_courses`, `course_enrolled_students`) are caches
//! for fast listing; when one of their writes fails after a purchase has
//! completed, the purchase stands, the failure is logged, and the pair is
//! queued for reconciliation. Access gating must always ask
//! [`EnrollmentEngine::has_completed_purchase`], never the caches.

use crate::catalog::CourseCatalog;
use crate::ledger::{EnrollmentLedger, FinalizeOutcome, NewPendingPurchase, PurchaseStatusView};
use crate::progress::ProgressStore;
use crate::retry::{retry_on_busy, RetryPolicy};
use lms_common::db::models::{CompletedPurchase, PaymentMethod, ProgressSnapshot, Purchase};
use lms_common::{Error, Result};
use sqlx::SqlitePool;
use uuid::Uuid;

/// Result of a free or manual enrollment request.
///
/// Enrollment is a desired-state operation: asking twice succeeds twice.
#[derive(Debug, Clone)]
pub enum EnrollOutcome {
    /// A new completed purchase was created
    Enrolled(Purchase),
    /// A completed purchase already existed for the pair
    AlreadyEnrolled,
}

/// Outcome of draining the enrollment repair queue
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct ReconcileReport {
    pub repaired: u64,
    pub remaining: u64,
}

/// Read-only consistency audit across the three entity families
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct AuditReport {
    pub completed_purchases: i64,
    /// Completed purchases whose user-side back-reference is missing
    pub missing_user_backrefs: i64,
    /// Completed purchases whose course-side back-reference is missing
    pub missing_course_backrefs: i64,
    /// User-side back-references with no completed purchase behind them
    pub orphaned_user_backrefs: i64,
    /// Course-side back-references with no completed purchase behind them
    pub orphaned_course_backrefs: i64,
    /// Progress records whose stored percentage or flag disagrees with a
    /// fresh recomputation
    pub stale_progress_records: i64,
    pub queued_repairs: i64,
}

impl AuditReport {
    pub fn is_clean(&self) -> bool {
        self.missing_user_backrefs == 0
            && self.missing_course_backrefs == 0
            && self.orphaned_user_backrefs == 0
            && self.orphaned_course_backrefs == 0
            && self.stale_progress_records == 0
            && self.queued_repairs == 0
    }
}

pub struct EnrollmentEngine {
    db: SqlitePool,
    catalog: CourseCatalog,
    ledger: EnrollmentLedger,
    progress: ProgressStore,
}

impl EnrollmentEngine {
    /// Build the engine over an initialized pool. All collaborators share
    /// the pool; nothing here is process-global.
    pub fn new(db: SqlitePool) -> Self {
        let catalog = CourseCatalog::new(db.clone());
        let ledger = EnrollmentLedger::new(db.clone(), catalog.clone());
        let progress = ProgressStore::new(db.clone(), catalog.clone());

        Self {
            db,
            catalog,
            ledger,
            progress,
        }
    }

    pub fn catalog(&self) -> &CourseCatalog {
        &self.catalog
    }

    // --- Enrollment ledger operations ---

    /// Record a pending purchase for a gateway checkout (paid flow)
    pub async fn create_pending_purchase(&self, input: NewPendingPurchase) -> Result<Purchase> {
        self.ledger.create_pending_purchase(input).await
    }

    /// Complete a purchase from a payment confirmation.
    ///
    /// Safe under webhook redelivery; on a fresh completion the
    /// enrollment back-references are brought in line.
    pub async fn finalize_purchase(
        &self,
        payment_id: &str,
        confirmed_amount: Option<i64>,
    ) -> Result<FinalizeOutcome> {
        let outcome = self.ledger.complete_by_payment_id(payment_id, confirmed_amount).await?;

        if let FinalizeOutcome::Completed(purchase) = &outcome {
            self.finalize_enrollment(purchase).await?;
        }

        Ok(outcome)
    }

    /// Enroll a user in a free course
    pub async fn enroll_free(&self, user_id: Uuid, course_id: Uuid) -> Result<EnrollOutcome> {
        let price = self
            .catalog
            .price(course_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("course {}", course_id)))?;

        if price > 0 {
            return Err(Error::NotFree { course_id });
        }

        let payment_id = format!("free-{}", Uuid::new_v4());
        self.enroll_directly(user_id, course_id, 0, PaymentMethod::Free, &payment_id)
            .await
    }

    /// Operator-driven enrollment at the course's current price, without
    /// a payment flow
    pub async fn enroll_manual(&self, user_id: Uuid, course_id: Uuid) -> Result<EnrollOutcome> {
        let price = self
            .catalog
            .price(course_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("course {}", course_id)))?;

        let payment_id = format!("manual-{}", Uuid::new_v4());
        self.enroll_directly(user_id, course_id, price, PaymentMethod::Manual, &payment_id)
            .await
    }

    pub async fn has_completed_purchase(&self, user_id: Uuid, course_id: Uuid) -> Result<bool> {
        self.ledger.has_completed_purchase(user_id, course_id).await
    }

    pub async fn get_completed_purchases(&self, user_id: Uuid) -> Result<Vec<CompletedPurchase>> {
        self.ledger.get_completed_purchases(user_id).await
    }

    pub async fn purchase_status(&self, user_id: Uuid, course_id: Uuid) -> Result<PurchaseStatusView> {
        self.ledger.purchase_status(user_id, course_id).await
    }

    // --- Progress operations ---

    pub async fn record_lecture_watched(
        &self,
        user_id: Uuid,
        course_id: Uuid,
        lecture_id: Uuid,
    ) -> Result<ProgressSnapshot> {
        self.progress.record_lecture_watched(user_id, course_id, lecture_id).await
    }

    pub async fn get_progress(&self, user_id: Uuid, course_id: Uuid) -> Result<ProgressSnapshot> {
        self.progress.get_progress(user_id, course_id).await
    }

    pub async fn reset_progress(&self, user_id: Uuid, course_id: Uuid) -> Result<()> {
        self.progress.reset_progress(user_id, course_id).await
    }

    // --- Cross-entity consistency ---

    async fn enroll_directly(
        &self,
        user_id: Uuid,
        course_id: Uuid,
        amount: i64,
        method: PaymentMethod,
        payment_id: &str,
    ) -> Result<EnrollOutcome> {
        if self.ledger.has_completed_purchase(user_id, course_id).await? {
            return Ok(EnrollOutcome::AlreadyEnrolled);
        }

        match self
            .ledger
            .insert_completed(user_id, course_id, amount, method, payment_id)
            .await?
        {
            Some(purchase) => {
                self.finalize_enrollment(&purchase).await?;
                Ok(EnrollOutcome::Enrolled(purchase))
            }
            // Lost a race against a concurrent enrollment of the same pair
            None => Ok(EnrollOutcome::AlreadyEnrolled),
        }
    }

    /// Bring the back-reference sets in line with a completed purchase.
    ///
    /// Both writes are set-unions and tolerate any number of repeats. A
    /// failure after the purchase has completed leaves a recoverable gap:
    /// it is logged, queued in `enrollment_repairs`, and the purchase is
    /// never rolled back.
    async fn finalize_enrollment(&self, purchase: &Purchase) -> Result<()> {
        let user_id = purchase.user_id;
        let course_id = purchase.course_id;

        let applied = self.apply_backrefs(user_id, course_id).await;

        if let Err(err) = applied {
            tracing::error!(
                user_id = %user_id,
                course_id = %course_id,
                purchase_id = %purchase.guid,
                error = %err,
                "Back-reference update failed after purchase completion; queued for reconciliation"
            );
            self.queue_repair(user_id, course_id).await?;
        }

        Ok(())
    }

    async fn apply_backrefs(&self, user_id: Uuid, course_id: Uuid) -> Result<()> {
        let policy = RetryPolicy::load(&self.db).await;

        retry_on_busy("add user enrollment back-reference", policy, || async move {
            sqlx::query("INSERT OR IGNORE INTO user_enrolled_courses (user_id, course_id) VALUES (?, ?)")
                .bind(user_id.to_string())
                .bind(course_id.to_string())
                .execute(&self.db)
                .await?;
            Ok(())
        })
        .await?;

        retry_on_busy("add course enrollment back-reference", policy, || async move {
            sqlx::query("INSERT OR IGNORE INTO course_enrolled_students (course_id, user_id) VALUES (?, ?)")
                .bind(course_id.to_string())
                .bind(user_id.to_string())
                .execute(&self.db)
                .await?;
            Ok(())
        })
        .await?;

        Ok(())
    }

    async fn queue_repair(&self, user_id: Uuid, course_id: Uuid) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO enrollment_repairs (user_id, course_id) VALUES (?, ?)")
            .bind(user_id.to_string())
            .bind(course_id.to_string())
            .execute(&self.db)
            .await?;

        Ok(())
    }

    /// Drain the repair queue, re-applying back-reference writes for
    /// pairs that failed during finalization
    pub async fn reconcile_enrollments(&self) -> Result<ReconcileReport> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT user_id, course_id FROM enrollment_repairs ORDER BY recorded_at")
                .fetch_all(&self.db)
                .await?;

        let mut repaired = 0u64;
        let mut remaining = 0u64;

        for (user_id, course_id) in rows {
            let user = crate::parse_db_uuid(&user_id)?;
            let course = crate::parse_db_uuid(&course_id)?;

            match self.apply_backrefs(user, course).await {
                Ok(()) => {
                    sqlx::query("DELETE FROM enrollment_repairs WHERE user_id = ? AND course_id = ?")
                        .bind(&user_id)
                        .bind(&course_id)
                        .execute(&self.db)
                        .await?;
                    repaired += 1;
                }
                Err(err) => {
                    tracing::warn!(
                        user_id = %user,
                        course_id = %course,
                        error = %err,
                        "Enrollment repair still failing"
                    );
                    remaining += 1;
                }
            }
        }

        tracing::info!(repaired, remaining, "Enrollment reconciliation finished");
        Ok(ReconcileReport { repaired, remaining })
    }

    /// Read-only audit of ledger/back-reference/progress agreement
    pub async fn audit_consistency(&self) -> Result<AuditReport> {
        let completed_purchases: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM purchases WHERE status = 'completed'")
                .fetch_one(&self.db)
                .await?;

        let missing_user_backrefs: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM purchases p
             WHERE p.status = 'completed'
               AND NOT EXISTS (SELECT 1 FROM user_enrolled_courses b
                               WHERE b.user_id = p.user_id AND b.course_id = p.course_id)",
        )
        .fetch_one(&self.db)
        .await?;

        let missing_course_backrefs: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM purchases p
             WHERE p.status = 'completed'
               AND NOT EXISTS (SELECT 1 FROM course_enrolled_students b
                               WHERE b.course_id = p.course_id AND b.user_id = p.user_id)",
        )
        .fetch_one(&self.db)
        .await?;

        let orphaned_user_backrefs: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM user_enrolled_courses b
             WHERE NOT EXISTS (SELECT 1 FROM purchases p
                               WHERE p.user_id = b.user_id AND p.course_id = b.course_id
                                 AND p.status = 'completed')",
        )
        .fetch_one(&self.db)
        .await?;

        let orphaned_course_backrefs: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM course_enrolled_students b
             WHERE NOT EXISTS (SELECT 1 FROM purchases p
                               WHERE p.user_id = b.user_id AND p.course_id = b.course_id
                                 AND p.status = 'completed')",
        )
        .fetch_one(&self.db)
        .await?;

        let progress_rows: Vec<(i64, i64, i64, i64)> = sqlx::query_as(
            "SELECT cp.completion_percentage, cp.is_completed,
                    (SELECT COUNT(*) FROM lecture_progress lp
                     INNER JOIN lectures l ON l.guid = lp.lecture_id AND l.course_id = lp.course_id
                     WHERE lp.user_id = cp.user_id AND lp.course_id = cp.course_id
                       AND lp.is_completed = 1),
                    (SELECT COUNT(*) FROM lectures WHERE course_id = cp.course_id)
             FROM course_progress cp",
        )
        .fetch_all(&self.db)
        .await?;

        let stale_progress_records = progress_rows
            .into_iter()
            .filter(|(stored_pct, stored_flag, completed, total)| {
                let expected_pct = if *total <= 0 {
                    0
                } else {
                    ((100.0 * *completed as f64) / *total as f64).round() as i64
                };
                let expected_flag = (*completed == *total && *total > 0) as i64;
                *stored_pct != expected_pct || *stored_flag != expected_flag
            })
            .count() as i64;

        let queued_repairs: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM enrollment_repairs")
            .fetch_one(&self.db)
            .await?;

        Ok(AuditReport {
            completed_purchases,
            missing_user_backrefs,
            missing_course_backrefs,
            orphaned_user_backrefs,
            orphaned_course_backrefs,
            stale_progress_records,
            queued_repairs,
        })
    }
}
