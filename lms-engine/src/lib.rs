//! # Enrollment & Progress Engine
//!
//! The consistency core of the LMS backend: purchase/enrollment ledger,
//! per-lecture progress store, and the coordinator that keeps purchases,
//! enrollment back-references, and progress records mutually consistent.
//!
//! The HTTP layer is a thin consumer of [`EnrollmentEngine`]; nothing in
//! this crate knows about routes, sessions, or payment-gateway wire
//! formats.

pub mod catalog;
pub mod coordinator;
pub mod ledger;
pub mod progress;
pub mod retry;

pub use coordinator::EnrollmentEngine;

use lms_common::{Error, Result};
use uuid::Uuid;

/// Parse a UUID column value, mapping corruption to an internal error
pub(crate) fn parse_db_uuid(value: &str) -> Result<Uuid> {
    Uuid::parse_str(value).map_err(|e| Error::Internal(format!("Invalid UUID in database: {}", e)))
}
