use crate::conditions::ConditionType;
use crate::crd::ImageStatus;
use chrono::{DateTime, Utc};
use std::time::Duration;

pub const MIN_RETRY_DELAY: Duration = Duration::from_secs(10);
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(10 * 60);

/// Delay before re-checking a failed image, derived from how long the Error condition has been
/// true. Returns zero when there is no active error.
///
/// The delay grows with wall-clock time instead of an attempt counter, so nothing has to be
/// persisted and a controller restart does not reset it. Skew between replicas shifts the delay
/// but the bounds still hold.
pub fn delay_for(status: &ImageStatus, now: DateTime<Utc>) -> Duration {
    let Some(error) = status.conditions.get(ConditionType::Error) else {
        return Duration::ZERO;
    };
    if !error.status {
        return Duration::ZERO;
    }

    // a transition time in the future counts as no elapsed time
    let elapsed = (now - error.last_transition_time)
        .to_std()
        .unwrap_or(Duration::ZERO);

    (elapsed + MIN_RETRY_DELAY).min(MAX_RETRY_DELAY)
}
