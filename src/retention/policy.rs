//! Turns stored settings and the trigger into the policy for one run.

use chrono::{DateTime, SubsecRound, Utc};
use parking_lot::Mutex;

use super::model::{Frequency, RetentionPolicyConfig, RunTrigger};
use crate::db::ExpiryFilter;

/// Source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock() = now;
    }

    pub fn advance(&self, by: chrono::Duration) {
        *self.now.lock() += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Fully resolved policy for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPolicy {
    /// Records strictly older than this are eligible.
    pub cutoff: DateTime<Utc>,
    pub frequency: Frequency,
    pub range: String,
    pub include_chats: bool,
    pub include_announcements: bool,
    pub include_object_storage: bool,
    /// Ignore the cutoff and purge everything in scope.
    pub unconditional: bool,
}

impl RunPolicy {
    pub fn filter(&self) -> ExpiryFilter {
        if self.unconditional {
            ExpiryFilter::All
        } else {
            ExpiryFilter::Before(self.cutoff)
        }
    }
}

/// Resolves a [`RunPolicy`]. Never fails: malformed settings have already
/// been replaced by defaults when the document was parsed.
#[derive(Debug, Clone, Copy, Default)]
pub struct PolicyResolver {
    allow_unconditional: bool,
}

impl PolicyResolver {
    pub fn new(allow_unconditional: bool) -> Self {
        Self {
            allow_unconditional,
        }
    }

    pub fn resolve(
        &self,
        config: &RetentionPolicyConfig,
        trigger: &RunTrigger,
        now: DateTime<Utc>,
    ) -> RunPolicy {
        // Stored timestamps carry millisecond precision at most.
        let cutoff = now
            .checked_sub_signed(config.frequency.window(config.custom_days))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
            .trunc_subsecs(3);

        let (include_chats, include_announcements, include_object_storage, unconditional) =
            match trigger {
                RunTrigger::Scheduled => (
                    config.include_chats,
                    config.include_announcements,
                    config.include_object_storage,
                    false,
                ),
                RunTrigger::Manual(manual) => {
                    if manual.full_reset && !self.allow_unconditional {
                        tracing::warn!(
                            "Full reset requested but retention.safety.allow_unconditional is off; \
                            using the configured cutoff"
                        );
                    }
                    (
                        manual.include_chats.unwrap_or(true),
                        manual.include_announcements.unwrap_or(true),
                        manual.include_object_storage,
                        manual.full_reset && self.allow_unconditional,
                    )
                }
            };

        RunPolicy {
            cutoff,
            frequency: config.frequency,
            range: config.range_label(),
            include_chats,
            include_announcements,
            include_object_storage,
            unconditional,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Timelike};
    use rstest::rstest;

    use super::*;
    use crate::retention::model::{MAX_CUSTOM_DAYS, ManualTrigger};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 15, 2, 0, 0).unwrap()
    }

    fn config(frequency: Frequency, custom_days: u32) -> RetentionPolicyConfig {
        RetentionPolicyConfig {
            frequency,
            custom_days,
            ..Default::default()
        }
    }

    #[rstest]
    #[case::daily(Frequency::Daily, 1)]
    #[case::weekly(Frequency::Weekly, 7)]
    #[case::monthly(Frequency::Monthly, 30)]
    fn test_cutoff_per_frequency(#[case] frequency: Frequency, #[case] days: i64) {
        let policy = PolicyResolver::default().resolve(
            &config(frequency, 1),
            &RunTrigger::Scheduled,
            now(),
        );
        assert_eq!(policy.cutoff, now() - Duration::days(days));
        assert_eq!(policy.filter(), ExpiryFilter::Before(policy.cutoff));
    }

    #[rstest]
    #[case(1)]
    #[case(5)]
    #[case(14)]
    fn test_custom_cutoff(#[case] days: u32) {
        let policy = PolicyResolver::default().resolve(
            &config(Frequency::Custom, days),
            &RunTrigger::Scheduled,
            now(),
        );
        assert_eq!(policy.cutoff, now() - Duration::days(i64::from(days)));
    }

    #[rstest]
    #[case::at_limit(MAX_CUSTOM_DAYS)]
    #[case::beyond_limit(u32::MAX)]
    fn test_huge_custom_window_is_capped(#[case] days: u32) {
        let policy = PolicyResolver::default().resolve(
            &config(Frequency::Custom, days),
            &RunTrigger::Scheduled,
            now(),
        );
        assert_eq!(
            policy.cutoff,
            now() - Duration::days(i64::from(MAX_CUSTOM_DAYS))
        );
    }

    #[test]
    fn test_cutoff_saturates_near_the_calendar_start() {
        let early = DateTime::<Utc>::MIN_UTC + Duration::days(3);
        let policy = PolicyResolver::default().resolve(
            &config(Frequency::Weekly, 1),
            &RunTrigger::Scheduled,
            early,
        );
        assert_eq!(policy.cutoff, DateTime::<Utc>::MIN_UTC);
    }

    #[test]
    fn test_cutoff_drops_sub_millisecond_precision() {
        let precise = now() + Duration::microseconds(700);
        let policy = PolicyResolver::default().resolve(
            &config(Frequency::Daily, 1),
            &RunTrigger::Scheduled,
            precise,
        );
        assert_eq!(policy.cutoff, now() - Duration::days(1));
        assert_eq!(policy.cutoff.nanosecond() % 1_000_000, 0);
    }

    #[test]
    fn test_scheduled_flags_come_from_settings() {
        let settings = RetentionPolicyConfig {
            include_chats: false,
            include_object_storage: false,
            ..Default::default()
        };
        let policy = PolicyResolver::default().resolve(&settings, &RunTrigger::Scheduled, now());
        assert!(!policy.include_chats);
        assert!(policy.include_announcements);
        assert!(!policy.include_object_storage);
        assert!(!policy.unconditional);
    }

    #[test]
    fn test_manual_flags_come_from_trigger() {
        let settings = RetentionPolicyConfig {
            include_chats: false,
            include_object_storage: true,
            ..Default::default()
        };
        let trigger = RunTrigger::Manual(ManualTrigger {
            trigger_requested: true,
            include_announcements: Some(false),
            ..Default::default()
        });
        let policy = PolicyResolver::default().resolve(&settings, &trigger, now());
        assert!(policy.include_chats);
        assert!(!policy.include_announcements);
        assert!(!policy.include_object_storage);
    }

    #[rstest]
    #[case::allowed(true, true)]
    #[case::refused(false, false)]
    fn test_full_reset_requires_opt_in(#[case] allow: bool, #[case] expected: bool) {
        let trigger = RunTrigger::Manual(ManualTrigger {
            full_reset: true,
            ..Default::default()
        });
        let policy =
            PolicyResolver::new(allow).resolve(&RetentionPolicyConfig::default(), &trigger, now());
        assert_eq!(policy.unconditional, expected);
        assert_eq!(
            policy.filter() == ExpiryFilter::All,
            expected,
            "filter should follow the unconditional flag"
        );
    }

    #[test]
    fn test_fixed_clock_advances() {
        let clock = FixedClock::new(now());
        clock.advance(Duration::hours(3));
        assert_eq!(clock.now(), now() + Duration::hours(3));
        clock.set(now());
        assert_eq!(clock.now(), now());
    }
}
