use chrono_tz::Tz;

use crate::calendar::{week_of, Week};
use crate::model::Ms;

use super::EngineError;

/// Whether an owner with `active_count` reservations in a week may add one more.
pub fn within_weekly_quota(active_count: usize, limit: u32) -> bool {
    active_count < limit as usize
}

/// Week of a reservation starting at `start`, never of "now".
pub(crate) fn week_for_start(start: Ms, tz: Tz) -> Result<Week, EngineError> {
    week_of(start, tz).ok_or_else(|| EngineError::Validation("start outside calendar range".into()))
}
