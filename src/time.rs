use chrono::{DateTime, Utc};

/// Source of "now" for the scheduling loops. Tests swap in a manual clock.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn now_minute(&self) -> i64 {
        epoch_minute(self.now())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Whole minutes since the Unix epoch; collection minutes use this scale.
pub fn epoch_minute(at: DateTime<Utc>) -> i64 {
    at.timestamp().div_euclid(60)
}

pub fn minute_start(minute: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(minute.saturating_mul(60), 0).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn epoch_minute_floors_seconds() {
        let at = Utc.with_ymd_and_hms(1970, 1, 1, 0, 2, 59).unwrap();
        assert_eq!(epoch_minute(at), 2);
        assert_eq!(minute_start(2), Utc.with_ymd_and_hms(1970, 1, 1, 0, 2, 0).unwrap());
    }

    #[test]
    fn epoch_minute_floors_before_epoch() {
        let at = Utc.with_ymd_and_hms(1969, 12, 31, 23, 59, 30).unwrap();
        assert_eq!(epoch_minute(at), -1);
    }
}
