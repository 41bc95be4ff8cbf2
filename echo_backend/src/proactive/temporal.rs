use chrono::{DateTime, Duration as ChronoDuration, Local, Timelike, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeOfDay {
    Morning,
    Afternoon,
    Evening,
    Night,
}

impl TimeOfDay {
    /// Morning [5,12), afternoon [12,17), evening [17,22), night otherwise.
    pub fn from_hour(hour: u32) -> Self {
        match hour {
            5..=11 => TimeOfDay::Morning,
            12..=16 => TimeOfDay::Afternoon,
            17..=21 => TimeOfDay::Evening,
            _ => TimeOfDay::Night,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TimeOfDay::Morning => "morning",
            TimeOfDay::Afternoon => "afternoon",
            TimeOfDay::Evening => "evening",
            TimeOfDay::Night => "night",
        }
    }
}

/// Recomputed every cycle from the conversation source; never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemporalContext {
    pub now: DateTime<Utc>,
    pub last_interaction: Option<DateTime<Utc>>,
    pub since_last_interaction_secs: i64,
    pub time_of_day: TimeOfDay,
    pub days_since_last_chat: i64,
}

impl TemporalContext {
    /// With no recorded interaction the elapsed time is zero.
    pub fn compute(
        now: DateTime<Utc>,
        last_interaction: Option<DateTime<Utc>>,
        local_hour: u32,
    ) -> Self {
        let elapsed = last_interaction
            .map(|last| now - last)
            .unwrap_or_else(ChronoDuration::zero)
            .max(ChronoDuration::zero());

        Self {
            now,
            last_interaction,
            since_last_interaction_secs: elapsed.num_seconds(),
            time_of_day: TimeOfDay::from_hour(local_hour),
            days_since_last_chat: elapsed.num_days(),
        }
    }

    pub fn hours_since_last_interaction(&self) -> f64 {
        self.since_last_interaction_secs as f64 / 3600.0
    }

    /// Stable identifier of the current absence, used in time-based trigger keys.
    pub fn anchor(&self) -> i64 {
        self.last_interaction
            .map(|last| last.timestamp())
            .unwrap_or_else(|| self.now.timestamp())
    }
}

/// Hour of `now` on the local wall clock.
pub fn local_hour(now: DateTime<Utc>) -> u32 {
    now.with_timezone(&Local).hour()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hour_boundaries_match_buckets() {
        assert_eq!(TimeOfDay::from_hour(4), TimeOfDay::Night);
        assert_eq!(TimeOfDay::from_hour(5), TimeOfDay::Morning);
        assert_eq!(TimeOfDay::from_hour(11), TimeOfDay::Morning);
        assert_eq!(TimeOfDay::from_hour(12), TimeOfDay::Afternoon);
        assert_eq!(TimeOfDay::from_hour(16), TimeOfDay::Afternoon);
        assert_eq!(TimeOfDay::from_hour(17), TimeOfDay::Evening);
        assert_eq!(TimeOfDay::from_hour(21), TimeOfDay::Evening);
        assert_eq!(TimeOfDay::from_hour(22), TimeOfDay::Night);
        assert_eq!(TimeOfDay::from_hour(0), TimeOfDay::Night);
    }

    #[test]
    fn two_day_absence_reports_two_days() {
        let now = Utc::now();
        let last = now - ChronoDuration::hours(49);
        let ctx = TemporalContext::compute(now, Some(last), 14);
        assert_eq!(ctx.days_since_last_chat, 2);
        assert_eq!(ctx.time_of_day, TimeOfDay::Afternoon);
        assert_eq!(ctx.anchor(), last.timestamp());
        assert!(ctx.hours_since_last_interaction() > 48.9);
    }

    #[test]
    fn missing_interaction_means_no_elapsed_time() {
        let now = Utc::now();
        let ctx = TemporalContext::compute(now, None, 9);
        assert_eq!(ctx.since_last_interaction_secs, 0);
        assert_eq!(ctx.days_since_last_chat, 0);
        assert_eq!(ctx.anchor(), now.timestamp());
    }

    #[test]
    fn future_interaction_is_clamped_to_zero() {
        let now = Utc::now();
        let ctx = TemporalContext::compute(now, Some(now + ChronoDuration::minutes(5)), 9);
        assert_eq!(ctx.since_last_interaction_secs, 0);
    }

    #[test]
    fn local_hour_is_a_valid_hour() {
        assert!(local_hour(Utc::now()) < 24);
    }
}
