//! Database models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub guid: Uuid,
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Course {
    pub guid: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub category: Option<String>,
    /// Price in whole currency units; 0 means the course is free
    pub price: i64,
    pub currency: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lecture {
    pub guid: Uuid,
    pub course_id: Uuid,
    pub title: String,
    pub position: i64,
}

/// Terminal lifecycle of a purchase record: `pending` on creation (paid
/// flow), `completed` on confirmation, no transitions out of `completed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PurchaseStatus {
    Pending,
    Completed,
    Failed,
}

impl PurchaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PurchaseStatus::Pending => "pending",
            PurchaseStatus::Completed => "completed",
            PurchaseStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(PurchaseStatus::Pending),
            "completed" => Some(PurchaseStatus::Completed),
            "failed" => Some(PurchaseStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    Stripe,
    Razorpay,
    Free,
    Manual,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Stripe => "stripe",
            PaymentMethod::Razorpay => "razorpay",
            PaymentMethod::Free => "free",
            PaymentMethod::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "stripe" => Some(PaymentMethod::Stripe),
            "razorpay" => Some(PaymentMethod::Razorpay),
            "free" => Some(PaymentMethod::Free),
            "manual" => Some(PaymentMethod::Manual),
            _ => None,
        }
    }
}

/// One enrollment/payment attempt. The ledger is the authoritative record
/// of enrollment; the back-reference sets on users and courses are caches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Purchase {
    pub guid: Uuid,
    pub user_id: Uuid,
    pub course_id: Uuid,
    pub amount: i64,
    pub currency: String,
    pub status: PurchaseStatus,
    pub payment_method: PaymentMethod,
    /// Unique per payment attempt (gateway session id, or synthetic for
    /// free/manual enrollments)
    pub payment_id: String,
    pub created_at: DateTime<Utc>,
}

/// Completion state of one lecture within one user's course progress
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LectureProgressEntry {
    pub lecture_id: Uuid,
    pub is_completed: bool,
    /// Set when the lecture is first recorded watched, never refreshed
    pub watch_time: DateTime<Utc>,
    /// Refreshed on every repeated watch of the same lecture
    pub last_watched: DateTime<Utc>,
}

/// Full progress view for one (user, course) pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub user_id: Uuid,
    pub course_id: Uuid,
    pub lecture_progress: Vec<LectureProgressEntry>,
    /// `round(100 * completed / total)` against the live lecture count
    pub completion_percentage: i64,
    pub is_completed: bool,
}

impl ProgressSnapshot {
    /// Zero snapshot for a user who has not started the course
    pub fn empty(user_id: Uuid, course_id: Uuid) -> Self {
        Self {
            user_id,
            course_id,
            lecture_progress: Vec::new(),
            completion_percentage: 0,
            is_completed: false,
        }
    }
}

/// Course fields surfaced alongside purchase listings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CourseSummary {
    pub guid: Uuid,
    pub title: String,
    pub category: Option<String>,
    pub price: i64,
    pub currency: String,
}

/// A completed purchase resolved against the course catalog
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletedPurchase {
    pub purchase: Purchase,
    pub course: CourseSummary,
}
