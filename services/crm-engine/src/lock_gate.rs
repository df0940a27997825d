use crate::errors::{CrmError, Result};
use chrono::{DateTime, Months, Utc};

const SECONDS_PER_DAY: i64 = 86_400;

/// `start + months`, clamped to the last day of the month when needed
/// (a lock started on Feb 29 matures on Feb 28).
pub fn maturity(start: DateTime<Utc>, months: u32) -> DateTime<Utc> {
    start
        .checked_add_months(Months::new(months))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Whole days left until `unlock_at`, rounded up. Zero once matured.
pub fn remaining_days(unlock_at: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    let seconds = (unlock_at - now).num_seconds();
    if seconds <= 0 {
        0
    } else {
        (seconds + SECONDS_PER_DAY - 1) / SECONDS_PER_DAY
    }
}

pub fn is_unlocked(unlock_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    now >= unlock_at
}

pub fn ensure_unlocked(unlock_at: DateTime<Utc>, now: DateTime<Utc>) -> Result<()> {
    if is_unlocked(unlock_at, now) {
        return Ok(());
    }

    Err(CrmError::LockPeriodActive {
        remaining_days: remaining_days(unlock_at, now),
        unlock_at,
    })
}
