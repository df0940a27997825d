//! Admin review state machine.
//!
//! `PENDING -> APPROVED` or `PENDING -> REJECTED`, both terminal. A review can
//! only be opened from a pending record, and only an opened review can be turned
//! into an approval or rejection, so the store never receives a transition that
//! skipped the state check. Storage still guards on `status = 'PENDING'` to
//! catch concurrent reviewers.

use crate::errors::{CrmError, Result};
use crate::models::{ReviewStatus, TransactionStatus};
use std::marker::PhantomData;
use uuid::Uuid;

#[derive(Debug)]
pub struct Pending;
#[derive(Debug)]
pub struct Approved;
#[derive(Debug)]
pub struct Rejected;

#[derive(Debug)]
pub struct Review<S> {
    id: Uuid,
    reviewer: Uuid,
    notes: Option<String>,
    _state: PhantomData<S>,
}

impl<S> Review<S> {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn reviewer(&self) -> Uuid {
        self.reviewer
    }

    pub fn notes(&self) -> Option<&str> {
        self.notes.as_deref()
    }

    fn into_state<T>(self) -> Review<T> {
        Review {
            id: self.id,
            reviewer: self.reviewer,
            notes: self.notes,
            _state: PhantomData,
        }
    }
}

/// Persisted states a review can be opened from
pub trait Reviewable {
    fn is_pending(&self) -> bool;
    fn label(&self) -> &'static str;
}

impl Reviewable for ReviewStatus {
    fn is_pending(&self) -> bool {
        *self == ReviewStatus::Pending
    }

    fn label(&self) -> &'static str {
        match self {
            ReviewStatus::Pending => "pending",
            ReviewStatus::Approved => "approved",
            ReviewStatus::Rejected => "rejected",
        }
    }
}

impl Reviewable for TransactionStatus {
    fn is_pending(&self) -> bool {
        *self == TransactionStatus::Pending
    }

    fn label(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Completed => "completed",
            TransactionStatus::Failed => "failed",
            TransactionStatus::Rejected => "rejected",
        }
    }
}

impl Review<Pending> {
    pub fn open(
        entity: &'static str,
        id: Uuid,
        status: impl Reviewable,
        reviewer: Uuid,
        notes: Option<String>,
    ) -> Result<Self> {
        if !status.is_pending() {
            return Err(already(entity, status.label()));
        }

        Ok(Review {
            id,
            reviewer,
            notes,
            _state: PhantomData,
        })
    }

    pub fn approve(self) -> Review<Approved> {
        self.into_state()
    }

    pub fn reject(self) -> Review<Rejected> {
        self.into_state()
    }
}

pub fn already(entity: &str, state: &str) -> CrmError {
    CrmError::Conflict(format!("{} already {}", entity, state))
}
