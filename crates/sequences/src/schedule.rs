//! Send-time math for step delays.

use chrono::{DateTime, Duration, Utc};

use drip_core::{DripError, DripResult};

use crate::types::StepDelay;

/// When a step scheduled at `from` should go out: `from` plus the step's
/// day and hour delay, then snapped to its fixed send time if it has one.
/// Snapping keeps the computed date; if that lands before the unsnapped
/// instant it moves to the following day, so a send never goes out earlier
/// than its delay allows.
///
/// Fails with `InvalidDefinition` if the result is not representable.
pub fn next_send_at(delay: &StepDelay, from: DateTime<Utc>) -> DripResult<DateTime<Utc>> {
    let out_of_range = || {
        DripError::InvalidDefinition(format!(
            "step delay of {}d {}h overflows the schedule",
            delay.days, delay.hours
        ))
    };
    let base = from
        .checked_add_signed(Duration::days(i64::from(delay.days)))
        .and_then(|t| t.checked_add_signed(Duration::hours(i64::from(delay.hours))))
        .ok_or_else(out_of_range)?;

    match delay.send_time {
        None => Ok(base),
        Some(time) => {
            let snapped = base.date_naive().and_time(time).and_utc();
            if snapped < base {
                snapped
                    .checked_add_signed(Duration::days(1))
                    .ok_or_else(out_of_range)
            } else {
                Ok(snapped)
            }
        }
    }
}
