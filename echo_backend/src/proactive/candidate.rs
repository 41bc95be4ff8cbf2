use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const MIN_PRIORITY: u8 = 1;
pub const MAX_PRIORITY: u8 = 10;

/// Why a proactive message exists. Closed set so the trigger table stays exhaustive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateCategory {
    Greeting,
    InsightShare,
    DreamShare,
    Question,
    CheckIn,
    Reflection,
    Curiosity,
    InnerThoughts,
}

impl CandidateCategory {
    pub const ALL: [CandidateCategory; 8] = [
        CandidateCategory::Greeting,
        CandidateCategory::InsightShare,
        CandidateCategory::DreamShare,
        CandidateCategory::Question,
        CandidateCategory::CheckIn,
        CandidateCategory::Reflection,
        CandidateCategory::Curiosity,
        CandidateCategory::InnerThoughts,
    ];

    pub fn as_db_str(self) -> &'static str {
        match self {
            CandidateCategory::Greeting => "greeting",
            CandidateCategory::InsightShare => "insight_share",
            CandidateCategory::DreamShare => "dream_share",
            CandidateCategory::Question => "question",
            CandidateCategory::CheckIn => "check_in",
            CandidateCategory::Reflection => "reflection",
            CandidateCategory::Curiosity => "curiosity",
            CandidateCategory::InnerThoughts => "inner_thoughts",
        }
    }

    pub fn from_db(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        Self::ALL
            .into_iter()
            .find(|category| category.as_db_str() == normalized)
    }
}

/// What an evaluator proposes before enhancement and submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateDraft {
    pub category: CandidateCategory,
    pub payload: String,
    pub priority: u8,
    pub trigger_key: String,
}

impl CandidateDraft {
    pub fn new(
        category: CandidateCategory,
        payload: impl Into<String>,
        priority: u8,
        trigger_key: impl Into<String>,
    ) -> Self {
        Self {
            category,
            payload: payload.into(),
            priority: priority.clamp(MIN_PRIORITY, MAX_PRIORITY),
            trigger_key: trigger_key.into(),
        }
    }
}

/// A proactive message competing for emission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: String,
    pub category: CandidateCategory,
    pub payload: String,
    pub priority: u8,
    pub created_at: DateTime<Utc>,
    pub trigger_key: String,
    #[serde(default)]
    pub dismissed: bool,
    #[serde(default)]
    pub emitted_at: Option<DateTime<Utc>>,
    /// Set only by an explicit user dismiss, never by dismiss-on-emit.
    #[serde(default)]
    pub dismissed_by_user: bool,
}

impl Candidate {
    pub fn from_draft(draft: CandidateDraft, created_at: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            category: draft.category,
            payload: draft.payload,
            priority: draft.priority.clamp(MIN_PRIORITY, MAX_PRIORITY),
            created_at,
            trigger_key: draft.trigger_key,
            dismissed: false,
            emitted_at: None,
            dismissed_by_user: false,
        }
    }

    pub fn is_live(&self) -> bool {
        !self.dismissed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_db_strings_round_trip_for_every_variant() {
        for category in CandidateCategory::ALL {
            assert_eq!(
                CandidateCategory::from_db(category.as_db_str()),
                Some(category)
            );
        }
    }

    #[test]
    fn category_parsing_accepts_loose_spelling() {
        assert_eq!(
            CandidateCategory::from_db(" Inner-Thoughts "),
            Some(CandidateCategory::InnerThoughts)
        );
        assert_eq!(
            CandidateCategory::from_db("check in"),
            Some(CandidateCategory::CheckIn)
        );
        assert_eq!(CandidateCategory::from_db("weather"), None);
    }

    #[test]
    fn draft_priority_is_clamped_to_valid_range() {
        let high = CandidateDraft::new(CandidateCategory::Greeting, "hi", 42, "k");
        let low = CandidateDraft::new(CandidateCategory::Greeting, "hi", 0, "k");
        assert_eq!(high.priority, MAX_PRIORITY);
        assert_eq!(low.priority, MIN_PRIORITY);
    }

    #[test]
    fn candidate_from_draft_starts_live_with_fresh_id() {
        let now = Utc::now();
        let draft = CandidateDraft::new(CandidateCategory::DreamShare, "dream", 7, "dream_1");
        let a = Candidate::from_draft(draft.clone(), now);
        let b = Candidate::from_draft(draft, now);
        assert!(a.is_live());
        assert!(a.emitted_at.is_none());
        assert!(!a.dismissed_by_user);
        assert_ne!(a.id, b.id);
        assert_eq!(a.trigger_key, "dream_1");
        assert_eq!(a.created_at, now);
    }

    #[test]
    fn category_serializes_snake_case() {
        let json = serde_json::to_string(&CandidateCategory::InsightShare).expect("serialize");
        assert_eq!(json, "\"insight_share\"");
    }
}
