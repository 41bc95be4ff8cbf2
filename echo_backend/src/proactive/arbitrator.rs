use chrono::{DateTime, Duration as ChronoDuration, Utc};

use super::candidate::Candidate;
use super::EmissionSink;

pub const DEFAULT_COOLDOWN_MINS: i64 = 30;
pub const DEFAULT_RETENTION_HOURS: i64 = 24;

#[derive(Debug, Clone)]
pub struct ArbitratorPolicy {
    pub cooldown: ChronoDuration,
    pub retention: ChronoDuration,
    /// Emitted candidates are flagged dismissed right away so they cannot resurface.
    pub dismiss_on_emit: bool,
}

impl Default for ArbitratorPolicy {
    fn default() -> Self {
        Self {
            cooldown: ChronoDuration::minutes(DEFAULT_COOLDOWN_MINS),
            retention: ChronoDuration::hours(DEFAULT_RETENTION_HOURS),
            dismiss_on_emit: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted { id: String },
    Duplicate { existing_id: String },
}

impl SubmitOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, SubmitOutcome::Accepted { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    Emitted(Candidate),
    CoolingDown { remaining_secs: i64 },
    NothingPending,
}

impl CycleOutcome {
    pub fn emitted(&self) -> Option<&Candidate> {
        match self {
            CycleOutcome::Emitted(candidate) => Some(candidate),
            _ => None,
        }
    }
}

/// Owns the pending-candidate set and the last emission time.
///
/// Invariants held here:
/// - at most one non-dismissed candidate per trigger key;
/// - no two emissions closer together than `policy.cooldown`.
#[derive(Debug)]
pub struct Arbitrator {
    policy: ArbitratorPolicy,
    pending: Vec<Candidate>,
    last_emission_at: Option<DateTime<Utc>>,
}

impl Arbitrator {
    pub fn new(policy: ArbitratorPolicy) -> Self {
        Self {
            policy,
            pending: Vec::new(),
            last_emission_at: None,
        }
    }

    /// Rebuild from persisted state. Later duplicates of a live trigger key are dropped.
    pub fn restore(
        policy: ArbitratorPolicy,
        candidates: Vec<Candidate>,
        last_emission_at: Option<DateTime<Utc>>,
    ) -> Self {
        let mut arbitrator = Self {
            policy,
            pending: Vec::with_capacity(candidates.len()),
            last_emission_at,
        };
        for candidate in candidates {
            if candidate.is_live() && arbitrator.has_live(&candidate.trigger_key) {
                continue;
            }
            arbitrator.pending.push(candidate);
        }
        arbitrator
    }

    pub fn last_emission_at(&self) -> Option<DateTime<Utc>> {
        self.last_emission_at
    }

    pub fn has_live(&self, trigger_key: &str) -> bool {
        self.live_with_key(trigger_key).is_some()
    }

    /// True if a retained candidate with this key was shown and the user has not dismissed it.
    pub fn was_emitted(&self, trigger_key: &str) -> bool {
        self.pending.iter().any(|candidate| {
            candidate.trigger_key == trigger_key
                && candidate.emitted_at.is_some()
                && !candidate.dismissed_by_user
        })
    }

    fn live_with_key(&self, trigger_key: &str) -> Option<&Candidate> {
        self.pending
            .iter()
            .find(|candidate| candidate.is_live() && candidate.trigger_key == trigger_key)
    }

    /// Insert a candidate unless a live one with the same trigger key exists.
    pub fn submit(&mut self, candidate: Candidate) -> SubmitOutcome {
        if let Some(existing) = self.live_with_key(&candidate.trigger_key) {
            tracing::debug!(
                "Skipping duplicate proactive candidate for trigger '{}'",
                candidate.trigger_key
            );
            return SubmitOutcome::Duplicate {
                existing_id: existing.id.clone(),
            };
        }

        let id = candidate.id.clone();
        tracing::info!(
            "Queued proactive candidate: {} (priority: {}, trigger: {})",
            candidate.category.as_db_str(),
            candidate.priority,
            candidate.trigger_key
        );
        self.pending.push(candidate);
        SubmitOutcome::Accepted { id }
    }

    pub fn cooldown_remaining(&self, now: DateTime<Utc>) -> Option<ChronoDuration> {
        let last = self.last_emission_at?;
        let elapsed = now - last;
        if elapsed < self.policy.cooldown {
            Some(self.policy.cooldown - elapsed)
        } else {
            None
        }
    }

    /// Emit the best live candidate if the cooldown has elapsed.
    ///
    /// Highest priority wins; equal priorities go to the oldest `created_at`,
    /// then to insertion order.
    pub fn evaluate_cycle(&mut self, now: DateTime<Utc>, sink: &dyn EmissionSink) -> CycleOutcome {
        if let Some(remaining) = self.cooldown_remaining(now) {
            return CycleOutcome::CoolingDown {
                remaining_secs: remaining.num_seconds().max(0),
            };
        }

        let Some(index) = self.select_index() else {
            return CycleOutcome::NothingPending;
        };

        let dismiss_on_emit = self.policy.dismiss_on_emit;
        let candidate = &mut self.pending[index];
        candidate.emitted_at = Some(now);
        if dismiss_on_emit {
            candidate.dismissed = true;
        }
        let emitted = candidate.clone();
        self.last_emission_at = Some(now);

        tracing::info!(
            "Emitting proactive message: {} (priority: {})",
            emitted.category.as_db_str(),
            emitted.priority
        );
        sink.on_emit(&emitted);
        CycleOutcome::Emitted(emitted)
    }

    fn select_index(&self) -> Option<usize> {
        self.pending
            .iter()
            .enumerate()
            .filter(|(_, candidate)| candidate.is_live())
            .min_by(|(_, a), (_, b)| {
                b.priority
                    .cmp(&a.priority)
                    .then_with(|| a.created_at.cmp(&b.created_at))
            })
            .map(|(index, _)| index)
    }

    /// User dismiss. Unknown ids are ignored.
    pub fn dismiss(&mut self, id: &str) -> bool {
        match self.pending.iter_mut().find(|candidate| candidate.id == id) {
            Some(candidate) => {
                candidate.dismissed_by_user = true;
                if !candidate.dismissed {
                    candidate.dismissed = true;
                    tracing::info!(
                        "Dismissed proactive message: {}",
                        candidate.category.as_db_str()
                    );
                }
                true
            }
            None => false,
        }
    }

    /// Live candidates, most recent first.
    pub fn pending_candidates(&self) -> Vec<Candidate> {
        let mut live = self
            .pending
            .iter()
            .filter(|candidate| candidate.is_live())
            .cloned()
            .collect::<Vec<_>>();
        live.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        live
    }

    pub fn live_count(&self) -> usize {
        self.pending.iter().filter(|c| c.is_live()).count()
    }

    /// Drop every candidate created before the retention window, dismissed or not.
    pub fn cleanup(&mut self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.policy.retention;
        let before = self.pending.len();
        self.pending.retain(|candidate| candidate.created_at > cutoff);
        before - self.pending.len()
    }

    /// Every retained candidate in insertion order, for persistence.
    pub fn snapshot(&self) -> Vec<Candidate> {
        self.pending.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proactive::candidate::{CandidateCategory, CandidateDraft};
    use crate::proactive::testing::RecordingSink;

    fn candidate(priority: u8, key: &str, created_at: DateTime<Utc>) -> Candidate {
        Candidate::from_draft(
            CandidateDraft::new(CandidateCategory::Greeting, format!("msg {key}"), priority, key),
            created_at,
        )
    }

    fn literal_policy() -> ArbitratorPolicy {
        ArbitratorPolicy {
            dismiss_on_emit: false,
            ..ArbitratorPolicy::default()
        }
    }

    #[test]
    fn duplicate_trigger_key_leaves_pending_set_unchanged() {
        let now = Utc::now();
        let mut arbitrator = Arbitrator::new(ArbitratorPolicy::default());
        let first = candidate(7, "dream_42", now);
        let first_id = first.id.clone();
        assert!(arbitrator.submit(first).is_accepted());
        let before = arbitrator.snapshot();

        let outcome = arbitrator.submit(candidate(9, "dream_42", now));
        assert_eq!(
            outcome,
            SubmitOutcome::Duplicate {
                existing_id: first_id
            }
        );
        assert_eq!(arbitrator.snapshot(), before);
    }

    #[test]
    fn dismissed_trigger_key_can_be_submitted_again() {
        let now = Utc::now();
        let mut arbitrator = Arbitrator::new(ArbitratorPolicy::default());
        let first = candidate(7, "dream_42", now);
        let first_id = first.id.clone();
        arbitrator.submit(first);
        assert!(arbitrator.dismiss(&first_id));

        let again = arbitrator.submit(candidate(7, "dream_42", now));
        assert!(again.is_accepted());
        assert_eq!(arbitrator.live_count(), 1);
    }

    #[test]
    fn highest_priority_is_emitted_first() {
        let now = Utc::now();
        let sink = RecordingSink::default();
        let mut arbitrator = Arbitrator::new(ArbitratorPolicy::default());
        arbitrator.submit(candidate(7, "b", now));
        arbitrator.submit(candidate(5, "c", now));
        arbitrator.submit(candidate(9, "a", now));

        let outcome = arbitrator.evaluate_cycle(now, &sink);
        assert_eq!(outcome.emitted().map(|c| c.priority), Some(9));
        assert_eq!(sink.emitted_keys(), vec!["a".to_string()]);
    }

    #[test]
    fn equal_priority_prefers_oldest_candidate() {
        let now = Utc::now();
        let sink = RecordingSink::default();
        let mut arbitrator = Arbitrator::new(ArbitratorPolicy::default());
        arbitrator.submit(candidate(6, "newer", now));
        arbitrator.submit(candidate(6, "older", now - ChronoDuration::minutes(10)));

        let outcome = arbitrator.evaluate_cycle(now, &sink);
        assert_eq!(
            outcome.emitted().map(|c| c.trigger_key.as_str()),
            Some("older")
        );
    }

    #[test]
    fn cooldown_blocks_second_emission_inside_window() {
        let t1 = Utc::now();
        let sink = RecordingSink::default();
        let mut arbitrator = Arbitrator::new(ArbitratorPolicy::default());
        arbitrator.submit(candidate(9, "a", t1));
        arbitrator.submit(candidate(8, "b", t1));

        assert!(arbitrator.evaluate_cycle(t1, &sink).emitted().is_some());
        let t2 = t1 + ChronoDuration::minutes(29);
        assert_eq!(
            arbitrator.evaluate_cycle(t2, &sink),
            CycleOutcome::CoolingDown {
                remaining_secs: 60
            }
        );
        assert_eq!(sink.emitted_keys().len(), 1);

        let t3 = t1 + ChronoDuration::minutes(30);
        assert_eq!(
            arbitrator.evaluate_cycle(t3, &sink).emitted().map(|c| c.trigger_key.as_str()),
            Some("b")
        );
    }

    #[test]
    fn emission_dismisses_candidate_by_default() {
        let now = Utc::now();
        let sink = RecordingSink::default();
        let mut arbitrator = Arbitrator::new(ArbitratorPolicy::default());
        arbitrator.submit(candidate(9, "a", now));

        let emitted = arbitrator.evaluate_cycle(now, &sink);
        let emitted = emitted.emitted().expect("emitted");
        assert!(emitted.dismissed);
        assert_eq!(emitted.emitted_at, Some(now));
        assert!(arbitrator.pending_candidates().is_empty());

        let later = now + ChronoDuration::hours(1);
        assert_eq!(
            arbitrator.evaluate_cycle(later, &sink),
            CycleOutcome::NothingPending
        );
    }

    #[test]
    fn emitted_keys_are_remembered_until_cleanup() {
        let now = Utc::now();
        let sink = RecordingSink::default();
        let mut arbitrator = Arbitrator::new(ArbitratorPolicy::default());
        arbitrator.submit(candidate(7, "dream_42", now));
        assert!(!arbitrator.was_emitted("dream_42"));

        arbitrator.evaluate_cycle(now, &sink);
        assert!(arbitrator.was_emitted("dream_42"));
        assert!(!arbitrator.has_live("dream_42"));

        arbitrator.cleanup(now + ChronoDuration::hours(25));
        assert!(!arbitrator.was_emitted("dream_42"));
    }

    #[test]
    fn user_dismiss_of_emitted_candidate_releases_its_key() {
        let now = Utc::now();
        let sink = RecordingSink::default();
        let mut arbitrator = Arbitrator::new(ArbitratorPolicy::default());
        arbitrator.submit(candidate(9, "dream_42", now));
        let emitted = arbitrator.evaluate_cycle(now, &sink);
        let emitted = emitted.emitted().expect("emitted");
        assert!(!emitted.dismissed_by_user);
        assert!(arbitrator.was_emitted("dream_42"));

        assert!(arbitrator.dismiss(&emitted.id));
        assert!(!arbitrator.was_emitted("dream_42"));
        assert!(arbitrator.submit(candidate(9, "dream_42", now)).is_accepted());
    }

    #[test]
    fn literal_policy_keeps_emitted_candidate_pending() {
        let now = Utc::now();
        let sink = RecordingSink::default();
        let mut arbitrator = Arbitrator::new(literal_policy());
        arbitrator.submit(candidate(9, "a", now));

        arbitrator.evaluate_cycle(now, &sink);
        assert_eq!(arbitrator.pending_candidates().len(), 1);
        assert!(!arbitrator.submit(candidate(9, "a", now)).is_accepted());
    }

    #[test]
    fn dismiss_unknown_id_is_a_no_op() {
        let mut arbitrator = Arbitrator::new(ArbitratorPolicy::default());
        arbitrator.submit(candidate(5, "a", Utc::now()));
        assert!(!arbitrator.dismiss("missing"));
        assert_eq!(arbitrator.live_count(), 1);
    }

    #[test]
    fn dismiss_is_idempotent() {
        let mut arbitrator = Arbitrator::new(ArbitratorPolicy::default());
        let c = candidate(5, "a", Utc::now());
        let id = c.id.clone();
        arbitrator.submit(c);
        assert!(arbitrator.dismiss(&id));
        assert!(arbitrator.dismiss(&id));
        assert_eq!(arbitrator.live_count(), 0);
        assert_eq!(arbitrator.snapshot().len(), 1);
    }

    #[test]
    fn pending_candidates_are_most_recent_first() {
        let now = Utc::now();
        let mut arbitrator = Arbitrator::new(ArbitratorPolicy::default());
        arbitrator.submit(candidate(5, "old", now - ChronoDuration::hours(2)));
        arbitrator.submit(candidate(5, "new", now));
        arbitrator.submit(candidate(5, "mid", now - ChronoDuration::hours(1)));

        let keys = arbitrator
            .pending_candidates()
            .into_iter()
            .map(|c| c.trigger_key)
            .collect::<Vec<_>>();
        assert_eq!(keys, vec!["new", "mid", "old"]);
    }

    #[test]
    fn cleanup_purges_expired_candidates_and_is_idempotent() {
        let now = Utc::now();
        let mut arbitrator = Arbitrator::new(ArbitratorPolicy::default());
        arbitrator.submit(candidate(5, "stale", now - ChronoDuration::hours(25)));
        let dismissed = candidate(5, "stale_dismissed", now - ChronoDuration::hours(30));
        let dismissed_id = dismissed.id.clone();
        arbitrator.submit(dismissed);
        arbitrator.dismiss(&dismissed_id);
        arbitrator.submit(candidate(5, "fresh", now - ChronoDuration::hours(1)));

        assert_eq!(arbitrator.cleanup(now), 2);
        let once = arbitrator.snapshot();
        assert_eq!(arbitrator.cleanup(now), 0);
        assert_eq!(arbitrator.snapshot(), once);
        assert_eq!(once.len(), 1);
        assert_eq!(once[0].trigger_key, "fresh");
    }

    #[test]
    fn restore_drops_later_live_duplicates() {
        let now = Utc::now();
        let a = candidate(5, "same", now);
        let b = candidate(6, "same", now);
        let arbitrator = Arbitrator::restore(
            ArbitratorPolicy::default(),
            vec![a.clone(), b],
            Some(now),
        );
        assert_eq!(arbitrator.snapshot(), vec![a]);
        assert_eq!(arbitrator.last_emission_at(), Some(now));
    }
}
