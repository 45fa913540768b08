use std::cmp::Ordering;

use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;

    fn now_rfc3339(&self) -> String {
        format_rfc3339(self.now())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

pub fn format_rfc3339(instant: OffsetDateTime) -> String {
    instant
        .format(&Rfc3339)
        .unwrap_or_else(|_| instant.unix_timestamp().to_string())
}

pub fn parse_rfc3339(raw: &str) -> Option<OffsetDateTime> {
    OffsetDateTime::parse(raw, &Rfc3339).ok()
}

/// Orders two RFC 3339 timestamps by instant. Unparseable values sort first so
/// a well-formed timestamp always wins a comparison against garbage.
pub fn compare_timestamps(left: &str, right: &str) -> Ordering {
    match (parse_rfc3339(left), parse_rfc3339(right)) {
        (Some(l), Some(r)) => l.cmp(&r),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => left.cmp(right),
    }
}

pub fn later_of<'a>(left: &'a str, right: &'a str) -> &'a str {
    if compare_timestamps(left, right) == Ordering::Less {
        right
    } else {
        left
    }
}

#[cfg(test)]
pub use manual::ManualClock;

#[cfg(test)]
mod manual {
    use std::sync::Mutex;

    use time::{Duration, OffsetDateTime};

    use super::{parse_rfc3339, Clock};

    #[derive(Debug)]
    pub struct ManualClock {
        now: Mutex<OffsetDateTime>,
    }

    impl ManualClock {
        pub fn at(raw: &str) -> Self {
            Self {
                now: Mutex::new(parse_rfc3339(raw).expect("manual clock needs an RFC 3339 seed")),
            }
        }

        pub fn set(&self, raw: &str) {
            *self.now.lock().expect("clock lock") =
                parse_rfc3339(raw).expect("manual clock needs an RFC 3339 value");
        }

        pub fn advance_secs(&self, secs: i64) {
            let mut now = self.now.lock().expect("clock lock");
            *now += Duration::seconds(secs);
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> OffsetDateTime {
            *self.now.lock().expect("clock lock")
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cmp::Ordering;

    use super::{compare_timestamps, later_of};

    #[test]
    fn compares_by_instant_not_text() {
        assert_eq!(
            compare_timestamps("2024-01-01T10:00:00+02:00", "2024-01-01T09:00:00Z"),
            Ordering::Less
        );
        assert_eq!(
            compare_timestamps("2024-01-01T10:00:00.5Z", "2024-01-01T10:00:00Z"),
            Ordering::Greater
        );
    }

    #[test]
    fn garbage_never_wins() {
        assert_eq!(
            compare_timestamps("not-a-time", "2024-01-01T00:00:00Z"),
            Ordering::Less
        );
        assert_eq!(
            later_of("2024-01-01T00:00:00Z", "zzz"),
            "2024-01-01T00:00:00Z"
        );
    }
}
