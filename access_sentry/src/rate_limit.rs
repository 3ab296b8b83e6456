//! Per-subject suppression of repeated audit entries.
//!
//! Owned by the pipeline worker, never shared, so no locking.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Faces and plates live in separate key spaces: an unmatched face logged
/// as "Unknown" never hides an unregistered plate, and the other way round.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum SubjectKey {
    Face(String),
    Plate(String),
}

/// Result of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateCheck {
    /// First sighting, or the window has elapsed.
    Log,
    /// Logged too recently.
    Suppressed,
}

/// Checks between sweeps of expired keys.
const PRUNE_EVERY: u64 = 64;

pub struct SubjectRateLimiter {
    window: chrono::Duration,
    last_logged: HashMap<SubjectKey, DateTime<Utc>>,
    checks: u64,
}

impl SubjectRateLimiter {
    pub fn new(window: Duration) -> Self {
        Self {
            window: chrono::Duration::milliseconds(window.as_millis() as i64),
            last_logged: HashMap::new(),
            checks: 0,
        }
    }

    /// Records `now` for `key` when the subject may be logged again.
    pub fn check(&mut self, key: SubjectKey, now: DateTime<Utc>) -> RateCheck {
        self.checks += 1;
        if self.checks % PRUNE_EVERY == 0 {
            self.prune(now);
        }
        let due = self
            .last_logged
            .get(&key)
            .map_or(true, |last| now.signed_duration_since(*last) >= self.window);
        if due {
            self.last_logged.insert(key, now);
            RateCheck::Log
        } else {
            RateCheck::Suppressed
        }
    }

    /// Drops subjects whose window has run out. They would be logged on
    /// their next sighting anyway; misread plates otherwise pile up.
    fn prune(&mut self, now: DateTime<Utc>) {
        let window = self.window;
        self.last_logged
            .retain(|_, last| now.signed_duration_since(*last) < window);
    }

    pub fn tracked(&self) -> usize {
        self.last_logged.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + seconds, 0).unwrap()
    }

    fn face(name: &str) -> SubjectKey {
        SubjectKey::Face(name.to_string())
    }

    #[test]
    fn same_subject_within_window_is_suppressed() {
        let mut limiter = SubjectRateLimiter::new(Duration::from_secs(60));
        assert_eq!(limiter.check(face("Asha"), at(0)), RateCheck::Log);
        assert_eq!(limiter.check(face("Asha"), at(30)), RateCheck::Suppressed);
    }

    #[test]
    fn same_subject_after_window_is_logged_again() {
        let mut limiter = SubjectRateLimiter::new(Duration::from_secs(60));
        assert_eq!(limiter.check(face("Asha"), at(0)), RateCheck::Log);
        assert_eq!(limiter.check(face("Asha"), at(61)), RateCheck::Log);
        // The window restarts from the last log, not the first sighting.
        assert_eq!(limiter.check(face("Asha"), at(100)), RateCheck::Suppressed);
        assert_eq!(limiter.check(face("Asha"), at(121)), RateCheck::Log);
    }

    #[test]
    fn suppressed_attempts_do_not_extend_the_window() {
        let mut limiter = SubjectRateLimiter::new(Duration::from_secs(60));
        limiter.check(face("Asha"), at(0));
        limiter.check(face("Asha"), at(59));
        assert_eq!(limiter.check(face("Asha"), at(60)), RateCheck::Log);
    }

    #[test]
    fn faces_and_plates_do_not_share_keys() {
        let mut limiter = SubjectRateLimiter::new(Duration::from_secs(60));
        assert_eq!(limiter.check(face("Unknown"), at(0)), RateCheck::Log);
        assert_eq!(
            limiter.check(SubjectKey::Plate("Unknown".into()), at(1)),
            RateCheck::Log
        );
        assert_eq!(limiter.check(face("Ravi"), at(2)), RateCheck::Log);
        assert_eq!(limiter.tracked(), 3);
    }

    #[test]
    fn expired_subjects_are_forgotten() {
        let mut limiter = SubjectRateLimiter::new(Duration::from_secs(60));
        for n in 0..10 {
            let plate = SubjectKey::Plate(format!("MH12X{n}"));
            assert_eq!(limiter.check(plate, at(n)), RateCheck::Log);
        }
        assert_eq!(limiter.tracked(), 10);

        // Keeps checking one live subject until the next sweep.
        for _ in 10..PRUNE_EVERY {
            limiter.check(face("Asha"), at(65));
        }
        assert_eq!(limiter.tracked(), 5);

        for _ in 0..PRUNE_EVERY {
            limiter.check(face("Asha"), at(100));
        }
        assert_eq!(limiter.tracked(), 1);
        assert_eq!(
            limiter.check(SubjectKey::Plate("MH12X9".into()), at(101)),
            RateCheck::Log
        );
    }
}
