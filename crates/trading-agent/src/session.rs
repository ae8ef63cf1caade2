use chrono::{DateTime, Datelike, NaiveDate, Timelike, Utc, Weekday};
use chrono_tz::America::New_York;

/// Fires once per US equity session, at or after the 09:30 ET open.
#[derive(Debug, Default)]
pub struct DailyReset {
    last_reset: Option<NaiveDate>,
}

fn session_date(now: DateTime<Utc>) -> Option<NaiveDate> {
    let local = now.with_timezone(&New_York);
    if matches!(local.weekday(), Weekday::Sat | Weekday::Sun) {
        return None;
    }
    if (local.hour(), local.minute()) < (9, 30) {
        return None;
    }
    Some(local.date_naive())
}

impl DailyReset {
    /// A tracker that treats a session already open at startup as reset.
    pub fn starting_at(now: DateTime<Utc>) -> Self {
        Self {
            last_reset: session_date(now),
        }
    }

    pub fn due(&mut self, now: DateTime<Utc>) -> bool {
        match session_date(now) {
            Some(date) if self.last_reset != Some(date) => {
                self.last_reset = Some(date);
                true
            }
            _ => false,
        }
    }
}
