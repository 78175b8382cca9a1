//! Backoff bookkeeping for outbound sends that the provider rejected.

use chrono::{DateTime, Duration, Utc};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay_secs: i64,
    pub max_delay_secs: i64,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { base_delay_secs: 300, max_delay_secs: 86_400, max_attempts: 5 }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Try again at `next_retry_at`; `attempts` already counts the failed send.
    Retry { attempts: u32, next_retry_at: DateTime<Utc> },
    /// Ceiling reached, the message is permanently failed.
    Exhausted { attempts: u32 },
}

impl RetryPolicy {
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.min(30);
        let multiplier = 1_i64 << exponent;
        let delay = self.base_delay_secs.max(1).saturating_mul(multiplier).min(self.max_delay_secs);
        Duration::seconds(delay)
    }

    pub fn first_retry_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + Duration::seconds(self.base_delay_secs.max(1))
    }

    pub fn outcome_after_failure(&self, attempts_so_far: u32, now: DateTime<Utc>) -> RetryOutcome {
        let attempts = attempts_so_far.saturating_add(1);
        if attempts >= self.max_attempts {
            return RetryOutcome::Exhausted { attempts };
        }
        RetryOutcome::Retry { attempts, next_retry_at: now + self.next_delay(attempts_so_far) }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use super::{RetryOutcome, RetryPolicy};

    #[test]
    fn delay_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.next_delay(0), Duration::seconds(300));
        assert_eq!(policy.next_delay(1), Duration::seconds(600));
        assert_eq!(policy.next_delay(3), Duration::seconds(2_400));
        assert_eq!(policy.next_delay(20), Duration::seconds(86_400));
    }

    #[test]
    fn first_retry_is_one_base_delay_out() {
        let policy = RetryPolicy::default();
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
        assert_eq!(policy.first_retry_at(now), now + Duration::minutes(5));
    }

    #[test]
    fn ceiling_marks_message_exhausted() {
        let policy = RetryPolicy { max_attempts: 3, ..RetryPolicy::default() };
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();

        assert_eq!(
            policy.outcome_after_failure(1, now),
            RetryOutcome::Retry { attempts: 2, next_retry_at: now + Duration::seconds(600) }
        );
        assert_eq!(policy.outcome_after_failure(2, now), RetryOutcome::Exhausted { attempts: 3 });
    }
}
