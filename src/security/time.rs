use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::{
  security::{SecurityError, SecurityResult},
  security_error,
};

pub fn utc_now() -> DateTime<Utc> {
  Utc::now()
}

// Conversion saturates instead of failing: configured "infinite" durations
// (Duration::MAX) are legal and common.
pub fn to_chrono_duration(d: Duration) -> chrono::Duration {
  chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(365 * 1000))
}

/// `t + d`, or the latest representable time when `d` does not fit.
pub fn add_saturating(t: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
  chrono::Duration::from_std(d)
    .ok()
    .and_then(|d| t.checked_add_signed(d))
    .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// `t - d`, or the earliest representable time when `d` does not fit.
pub fn sub_saturating(t: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
  chrono::Duration::from_std(d)
    .ok()
    .and_then(|d| t.checked_sub_signed(d))
    .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Remaining-time budget for one blocking operation.
///
/// Created from the caller's timeout at the start of the operation and
/// threaded down through every call that may block, so that nested calls
/// share one deadline.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutHelper {
  original_timeout: Duration,
  deadline: Option<Instant>, // None = infinite
}

impl TimeoutHelper {
  pub fn new(timeout: Duration) -> Self {
    TimeoutHelper {
      original_timeout: timeout,
      deadline: Instant::now().checked_add(timeout),
    }
  }

  pub fn original_timeout(&self) -> Duration {
    self.original_timeout
  }

  pub fn remaining_time(&self) -> Duration {
    match self.deadline {
      None => Duration::MAX,
      Some(deadline) => deadline.saturating_duration_since(Instant::now()),
    }
  }

  pub fn is_expired(&self) -> bool {
    matches!(self.deadline, Some(deadline) if Instant::now() >= deadline)
  }

  /// Returns the remaining time, or a timeout error naming `operation` when
  /// the budget is spent.
  pub fn check(&self, operation: &str) -> SecurityResult<Duration> {
    if self.is_expired() {
      Err(timeout_error(operation, self.original_timeout))
    } else {
      Ok(self.remaining_time())
    }
  }
}

pub fn timeout_error(operation: &str, timeout: Duration) -> SecurityError {
  security_error!(
    Timeout,
    "The operation '{}' did not complete within the allotted timeout of {:?}",
    operation,
    timeout
  )
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn infinite_timeout_never_expires() {
    let helper = TimeoutHelper::new(Duration::MAX);
    assert!(!helper.is_expired());
    assert_eq!(helper.remaining_time(), Duration::MAX);
    assert!(helper.check("op").is_ok());
  }

  #[test]
  fn spent_budget_is_a_timeout() {
    let helper = TimeoutHelper::new(Duration::ZERO);
    assert!(helper.is_expired());
    assert_eq!(helper.remaining_time(), Duration::ZERO);
    let e = helper.check("token acquisition").unwrap_err();
    assert!(e.is_timeout());
    assert!(e.message().contains("token acquisition"));
  }

  #[test]
  fn saturating_arithmetic() {
    let now = utc_now();
    assert_eq!(add_saturating(now, Duration::MAX), DateTime::<Utc>::MAX_UTC);
    assert!(sub_saturating(now, Duration::from_secs(10)) < now);
    assert_eq!(sub_saturating(now, Duration::MAX), DateTime::<Utc>::MIN_UTC);
    // representable but past the end of the calendar
    let far = Duration::from_secs(400_000 * 365 * 24 * 3600);
    assert_eq!(add_saturating(now, far), DateTime::<Utc>::MAX_UTC);
    assert_eq!(
      add_saturating(now, Duration::from_secs(60)),
      now + chrono::Duration::seconds(60)
    );
  }
}
