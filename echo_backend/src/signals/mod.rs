//! Signal sources: time-stamped records produced elsewhere in the companion
//! (conversation, background insights, dreams, personality events, curiosity
//! topics, self-reflections). The proactive engine only ever reads them.

pub mod store;

use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub use store::{MemorySignalStore, SqliteSignalStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Interaction,
    Insight,
    Dream,
    PersonalityEvent,
    CuriosityTopic,
    SelfReflection,
}

impl SignalKind {
    pub const ALL: [SignalKind; 6] = [
        SignalKind::Interaction,
        SignalKind::Insight,
        SignalKind::Dream,
        SignalKind::PersonalityEvent,
        SignalKind::CuriosityTopic,
        SignalKind::SelfReflection,
    ];

    pub fn as_db_str(self) -> &'static str {
        match self {
            SignalKind::Interaction => "interaction",
            SignalKind::Insight => "insight",
            SignalKind::Dream => "dream",
            SignalKind::PersonalityEvent => "personality_event",
            SignalKind::CuriosityTopic => "curiosity_topic",
            SignalKind::SelfReflection => "self_reflection",
        }
    }

    pub fn from_db(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_ascii_lowercase().replace('-', "_");
        match normalized.as_str() {
            "interaction" | "interactions" | "conversation" => Some(SignalKind::Interaction),
            "insight" | "insights" => Some(SignalKind::Insight),
            "dream" | "dreams" => Some(SignalKind::Dream),
            "personality_event" | "personality_events" | "personality" => {
                Some(SignalKind::PersonalityEvent)
            }
            "curiosity_topic" | "curiosity_topics" | "curiosity" => {
                Some(SignalKind::CuriosityTopic)
            }
            "self_reflection" | "self_reflections" | "reflection" | "reflections" => {
                Some(SignalKind::SelfReflection)
            }
            _ => None,
        }
    }

    /// How long records of this kind are kept before the retention job purges them.
    pub fn retention(self) -> ChronoDuration {
        match self {
            SignalKind::Insight | SignalKind::Dream => ChronoDuration::days(7),
            SignalKind::Interaction
            | SignalKind::PersonalityEvent
            | SignalKind::CuriosityTopic
            | SignalKind::SelfReflection => ChronoDuration::days(30),
        }
    }
}

/// One record from a signal source.
///
/// `score` is source specific: insight confidence (0..1), dream vividness,
/// event significance and reflection depth (1..10). `label` carries the
/// record's sub-type where one exists (e.g. `synthesis` for insights).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalRecord {
    pub id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub score: f32,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
}

impl SignalRecord {
    pub fn new(created_at: DateTime<Utc>, title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            created_at,
            score: 0.0,
            label: None,
            title: title.into(),
            content: content.into(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_score(mut self, score: f32) -> Self {
        self.score = score;
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// Read side of a store, as seen by trigger evaluators.
pub trait SignalSource: Send + Sync {
    fn kind(&self) -> SignalKind;

    /// Records created strictly after `cutoff`, newest first.
    fn recent_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<SignalRecord>>;
}

impl<T: SignalSource + ?Sized> SignalSource for Arc<T> {
    fn kind(&self) -> SignalKind {
        (**self).kind()
    }

    fn recent_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<SignalRecord>> {
        (**self).recent_since(cutoff)
    }
}

/// Full store used by the composition root: evaluators get the read side only.
pub trait SignalStore: SignalSource {
    fn record(&self, record: SignalRecord) -> Result<()>;

    fn latest(&self) -> Result<Option<SignalRecord>>;

    /// Remove records created at or before `cutoff`; returns how many were removed.
    fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}

/// Temporal anchor read from the conversation source.
pub trait InteractionSource: Send + Sync {
    fn last_interaction_time(&self) -> Result<Option<DateTime<Utc>>>;
}

/// Last interaction = newest record in the interaction store.
pub struct InteractionAnchor {
    store: Arc<dyn SignalStore>,
}

impl InteractionAnchor {
    pub fn new(store: Arc<dyn SignalStore>) -> Self {
        Self { store }
    }
}

impl InteractionSource for InteractionAnchor {
    fn last_interaction_time(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self.store.latest()?.map(|record| record.created_at))
    }
}

/// The six stores the runtime wires together.
#[derive(Clone)]
pub struct SignalStores {
    pub interactions: Arc<dyn SignalStore>,
    pub insights: Arc<dyn SignalStore>,
    pub dreams: Arc<dyn SignalStore>,
    pub personality_events: Arc<dyn SignalStore>,
    pub curiosity_topics: Arc<dyn SignalStore>,
    pub self_reflections: Arc<dyn SignalStore>,
}

impl SignalStores {
    pub fn in_memory() -> Self {
        Self::from_factory(|kind| Arc::new(MemorySignalStore::new(kind)))
    }

    pub fn sqlite(db: Arc<crate::database::EchoDatabase>) -> Self {
        Self::from_factory(|kind| Arc::new(SqliteSignalStore::new(kind, db.clone())))
    }

    fn from_factory<F>(mut make: F) -> Self
    where
        F: FnMut(SignalKind) -> Arc<dyn SignalStore>,
    {
        Self {
            interactions: make(SignalKind::Interaction),
            insights: make(SignalKind::Insight),
            dreams: make(SignalKind::Dream),
            personality_events: make(SignalKind::PersonalityEvent),
            curiosity_topics: make(SignalKind::CuriosityTopic),
            self_reflections: make(SignalKind::SelfReflection),
        }
    }

    pub fn get(&self, kind: SignalKind) -> Arc<dyn SignalStore> {
        match kind {
            SignalKind::Interaction => self.interactions.clone(),
            SignalKind::Insight => self.insights.clone(),
            SignalKind::Dream => self.dreams.clone(),
            SignalKind::PersonalityEvent => self.personality_events.clone(),
            SignalKind::CuriosityTopic => self.curiosity_topics.clone(),
            SignalKind::SelfReflection => self.self_reflections.clone(),
        }
    }

    /// Read-only view handed to trigger evaluators.
    pub fn source(&self, kind: SignalKind) -> Arc<dyn SignalSource> {
        Arc::new(self.get(kind))
    }

    pub fn interaction_anchor(&self) -> InteractionAnchor {
        InteractionAnchor::new(self.interactions.clone())
    }

    pub fn record_interaction(&self, at: DateTime<Utc>, summary: &str) -> Result<()> {
        self.interactions
            .record(SignalRecord::new(at, "interaction", summary.trim()))
    }

    /// Apply each kind's retention window. Failures are logged per store.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let mut removed = 0;
        for kind in SignalKind::ALL {
            match self.get(kind).purge_before(now - kind.retention()) {
                Ok(count) => removed += count,
                Err(error) => {
                    tracing::warn!("Failed to purge {} records: {}", kind.as_db_str(), error);
                }
            }
        }
        if removed > 0 {
            tracing::info!("Signal retention removed {} record(s)", removed);
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_parsing_accepts_route_aliases() {
        for kind in SignalKind::ALL {
            assert_eq!(SignalKind::from_db(kind.as_db_str()), Some(kind));
        }
        assert_eq!(SignalKind::from_db("dreams"), Some(SignalKind::Dream));
        assert_eq!(
            SignalKind::from_db("Self-Reflection"),
            Some(SignalKind::SelfReflection)
        );
        assert_eq!(SignalKind::from_db("weather"), None);
    }

    #[test]
    fn interaction_anchor_tracks_newest_interaction() {
        let stores = SignalStores::in_memory();
        let anchor = stores.interaction_anchor();
        assert_eq!(anchor.last_interaction_time().expect("read"), None);

        let now = Utc::now();
        stores
            .record_interaction(now - ChronoDuration::hours(3), "older")
            .expect("record");
        stores.record_interaction(now, "newer").expect("record");
        assert_eq!(anchor.last_interaction_time().expect("read"), Some(now));
    }

    #[test]
    fn purge_expired_respects_per_kind_retention() {
        let stores = SignalStores::in_memory();
        let now = Utc::now();
        stores
            .dreams
            .record(SignalRecord::new(now - ChronoDuration::days(8), "old dream", ""))
            .expect("record");
        stores
            .personality_events
            .record(SignalRecord::new(now - ChronoDuration::days(8), "event", ""))
            .expect("record");

        assert_eq!(stores.purge_expired(now), 1);
        assert!(stores.dreams.latest().expect("latest").is_none());
        assert!(stores.personality_events.latest().expect("latest").is_some());
    }
}
