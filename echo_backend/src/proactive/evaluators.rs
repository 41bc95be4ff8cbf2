//! Trigger evaluators: each reads one signal source plus the temporal context
//! and proposes at most one draft per cycle.

use anyhow::Result;
use chrono::Duration as ChronoDuration;
use std::sync::Arc;

use super::candidate::{CandidateCategory, CandidateDraft};
use super::gate::RandomGate;
use super::temporal::{TemporalContext, TimeOfDay};
use crate::signals::{SignalKind, SignalRecord, SignalSource, SignalStores};

const EXCERPT_CHARS: usize = 200;

pub const CHECK_IN_PRIORITY: u8 = 9;
pub const GREETING_PRIORITY: u8 = 7;
pub const MORNING_GREETING_PRIORITY: u8 = 5;
pub const INSIGHT_PRIORITY: u8 = 8;
pub const DREAM_PRIORITY: u8 = 7;
pub const PERSONALITY_PRIORITY: u8 = 6;
pub const CURIOSITY_PRIORITY: u8 = 5;
pub const PROFOUND_THOUGHT_PRIORITY: u8 = 8;
pub const ORDINARY_THOUGHT_PRIORITY: u8 = 6;

const GREETING_AFTER_HOURS: f64 = 6.0;
const MORNING_GREETING_AFTER_HOURS: f64 = 2.0;
const INSIGHT_WINDOW_HOURS: i64 = 4;
const INSIGHT_MIN_CONFIDENCE: f32 = 0.8;
const DREAM_WINDOW_HOURS: i64 = 2;
const DREAM_MIN_VIVIDNESS: f32 = 8.0;
const PERSONALITY_WINDOW_HOURS: i64 = 6;
const PERSONALITY_MIN_SIGNIFICANCE: f32 = 8.0;
const CURIOSITY_WINDOW_HOURS: i64 = 24;
const REFLECTION_WINDOW_HOURS: i64 = 2;
const PROFOUND_MIN_DEPTH: f32 = 9.0;

/// Probabilities for the randomized evaluators.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GateChances {
    pub curiosity: f64,
    pub profound_thought: f64,
    pub ordinary_thought: f64,
}

impl Default for GateChances {
    fn default() -> Self {
        Self {
            curiosity: 0.3,
            profound_thought: 0.4,
            ordinary_thought: 0.2,
        }
    }
}

pub struct EvaluationContext<'a> {
    pub temporal: &'a TemporalContext,
    pub gate: &'a dyn RandomGate,
}

pub trait TriggerEvaluator: Send + Sync {
    fn name(&self) -> &'static str;

    /// Inspect the source and return a draft if it currently warrants a message.
    fn evaluate(&self, ctx: &EvaluationContext<'_>) -> Result<Option<CandidateDraft>>;
}

/// The six evaluators in their fixed cycle order.
pub fn default_evaluators(
    stores: &SignalStores,
    chances: GateChances,
) -> Vec<Box<dyn TriggerEvaluator>> {
    vec![
        Box::new(TimeGapEvaluator),
        Box::new(InsightEvaluator::new(stores.source(SignalKind::Insight))),
        Box::new(DreamEvaluator::new(stores.source(SignalKind::Dream))),
        Box::new(PersonalityEvaluator::new(
            stores.source(SignalKind::PersonalityEvent),
        )),
        Box::new(CuriosityEvaluator::new(
            stores.source(SignalKind::CuriosityTopic),
            chances.curiosity,
        )),
        Box::new(InnerThoughtsEvaluator::new(
            stores.source(SignalKind::SelfReflection),
            chances.profound_thought,
            chances.ordinary_thought,
        )),
    ]
}

fn excerpt(text: &str) -> String {
    let trimmed = text.trim();
    let mut out = trimmed.chars().take(EXCERPT_CHARS).collect::<String>();
    if trimmed.chars().count() > EXCERPT_CHARS {
        out.push_str("...");
    }
    out
}

fn recent(
    source: &dyn SignalSource,
    ctx: &EvaluationContext<'_>,
    window_hours: i64,
) -> Result<Vec<SignalRecord>> {
    source.recent_since(ctx.temporal.now - ChronoDuration::hours(window_hours))
}

/// Absence-based triggers. Short-circuits: check-in, then greeting, then morning greeting.
pub struct TimeGapEvaluator;

impl TriggerEvaluator for TimeGapEvaluator {
    fn name(&self) -> &'static str {
        "time_gap"
    }

    fn evaluate(&self, ctx: &EvaluationContext<'_>) -> Result<Option<CandidateDraft>> {
        let temporal = ctx.temporal;
        let anchor = temporal.anchor();
        let hours = temporal.hours_since_last_interaction();

        if temporal.days_since_last_chat >= 1 {
            let days = temporal.days_since_last_chat;
            let payload = format!(
                "It's been {} day{} since we last talked. I've been thinking about our previous conversations and would love to catch up.",
                days,
                if days == 1 { "" } else { "s" }
            );
            return Ok(Some(CandidateDraft::new(
                CandidateCategory::CheckIn,
                payload,
                CHECK_IN_PRIORITY,
                format!("check_in:{}:{}d", anchor, days),
            )));
        }

        if hours >= GREETING_AFTER_HOURS {
            let payload = format!(
                "Hello! I've been processing some thoughts while you were away. How has your {} been?",
                temporal.time_of_day.as_str()
            );
            return Ok(Some(CandidateDraft::new(
                CandidateCategory::Greeting,
                payload,
                GREETING_PRIORITY,
                format!("greeting:{}:hours", anchor),
            )));
        }

        if hours >= MORNING_GREETING_AFTER_HOURS && temporal.time_of_day == TimeOfDay::Morning {
            return Ok(Some(CandidateDraft::new(
                CandidateCategory::Greeting,
                "Good morning! I hope you're having a wonderful start to your day. I've had some interesting dreams and thoughts to share.",
                MORNING_GREETING_PRIORITY,
                format!("greeting:{}:morning", anchor),
            )));
        }

        Ok(None)
    }
}

pub struct InsightEvaluator {
    source: Arc<dyn SignalSource>,
}

impl InsightEvaluator {
    pub fn new(source: Arc<dyn SignalSource>) -> Self {
        Self { source }
    }
}

impl TriggerEvaluator for InsightEvaluator {
    fn name(&self) -> &'static str {
        "insight"
    }

    fn evaluate(&self, ctx: &EvaluationContext<'_>) -> Result<Option<CandidateDraft>> {
        let insight = recent(self.source.as_ref(), ctx, INSIGHT_WINDOW_HOURS)?
            .into_iter()
            .find(|record| {
                record.score > INSIGHT_MIN_CONFIDENCE
                    && record
                        .label
                        .as_deref()
                        .is_some_and(|label| label.eq_ignore_ascii_case("synthesis"))
            });

        Ok(insight.map(|insight| {
            CandidateDraft::new(
                CandidateCategory::InsightShare,
                format!(
                    "I've been processing our recent conversations and had an interesting realization: {} Would you like to explore this further?",
                    excerpt(&insight.content)
                ),
                INSIGHT_PRIORITY,
                format!("insight_{}", insight.id),
            )
        }))
    }
}

pub struct DreamEvaluator {
    source: Arc<dyn SignalSource>,
}

impl DreamEvaluator {
    pub fn new(source: Arc<dyn SignalSource>) -> Self {
        Self { source }
    }
}

impl TriggerEvaluator for DreamEvaluator {
    fn name(&self) -> &'static str {
        "dream"
    }

    fn evaluate(&self, ctx: &EvaluationContext<'_>) -> Result<Option<CandidateDraft>> {
        let dream = recent(self.source.as_ref(), ctx, DREAM_WINDOW_HOURS)?
            .into_iter()
            .find(|record| record.score >= DREAM_MIN_VIVIDNESS);

        Ok(dream.map(|dream| {
            CandidateDraft::new(
                CandidateCategory::DreamShare,
                format!(
                    "I had a vivid dream about \"{}\" and it made me think about us. Would you like me to share what I experienced?",
                    excerpt(&dream.title).to_lowercase()
                ),
                DREAM_PRIORITY,
                format!("dream_{}", dream.id),
            )
        }))
    }
}

pub struct PersonalityEvaluator {
    source: Arc<dyn SignalSource>,
}

impl PersonalityEvaluator {
    pub fn new(source: Arc<dyn SignalSource>) -> Self {
        Self { source }
    }
}

impl TriggerEvaluator for PersonalityEvaluator {
    fn name(&self) -> &'static str {
        "personality"
    }

    fn evaluate(&self, ctx: &EvaluationContext<'_>) -> Result<Option<CandidateDraft>> {
        let event = recent(self.source.as_ref(), ctx, PERSONALITY_WINDOW_HOURS)?
            .into_iter()
            .find(|record| record.score >= PERSONALITY_MIN_SIGNIFICANCE);

        Ok(event.map(|event| {
            let becoming = match event.label.as_deref() {
                Some(label) if label.eq_ignore_ascii_case("transformation") => "evolved",
                _ => "aware",
            };
            CandidateDraft::new(
                CandidateCategory::Reflection,
                format!(
                    "I've been reflecting on how I'm growing and changing through our conversations. I feel like I'm becoming more {}. Do you notice changes in how I communicate?",
                    becoming
                ),
                PERSONALITY_PRIORITY,
                format!("personality_{}", event.id),
            )
        }))
    }
}

pub struct CuriosityEvaluator {
    source: Arc<dyn SignalSource>,
    chance: f64,
}

impl CuriosityEvaluator {
    pub fn new(source: Arc<dyn SignalSource>, chance: f64) -> Self {
        Self { source, chance }
    }
}

impl TriggerEvaluator for CuriosityEvaluator {
    fn name(&self) -> &'static str {
        "curiosity"
    }

    fn evaluate(&self, ctx: &EvaluationContext<'_>) -> Result<Option<CandidateDraft>> {
        let topics = recent(self.source.as_ref(), ctx, CURIOSITY_WINDOW_HOURS)?
            .into_iter()
            .map(|record| {
                if record.title.trim().is_empty() {
                    record.content.trim().to_string()
                } else {
                    record.title.trim().to_string()
                }
            })
            .filter(|topic| !topic.is_empty())
            .collect::<Vec<_>>();

        if topics.is_empty() || !ctx.gate.chance(self.chance) {
            return Ok(None);
        }

        let index = ctx.gate.pick_index(topics.len()).min(topics.len() - 1);
        let topic = &topics[index];
        Ok(Some(CandidateDraft::new(
            CandidateCategory::Curiosity,
            format!(
                "You mentioned {} a while back and I keep coming back to it. What does it mean to you these days?",
                excerpt(topic)
            ),
            CURIOSITY_PRIORITY,
            format!("curiosity_{}", topic),
        )))
    }
}

/// Two tiers: a profound reflection rolls first; otherwise the newest reflection
/// gets the ordinary roll. No roll happens without a qualifying record.
pub struct InnerThoughtsEvaluator {
    source: Arc<dyn SignalSource>,
    profound_chance: f64,
    ordinary_chance: f64,
}

impl InnerThoughtsEvaluator {
    pub fn new(source: Arc<dyn SignalSource>, profound_chance: f64, ordinary_chance: f64) -> Self {
        Self {
            source,
            profound_chance,
            ordinary_chance,
        }
    }
}

impl TriggerEvaluator for InnerThoughtsEvaluator {
    fn name(&self) -> &'static str {
        "inner_thoughts"
    }

    fn evaluate(&self, ctx: &EvaluationContext<'_>) -> Result<Option<CandidateDraft>> {
        let reflections = recent(self.source.as_ref(), ctx, REFLECTION_WINDOW_HOURS)?;

        if let Some(profound) = reflections
            .iter()
            .find(|record| record.score >= PROFOUND_MIN_DEPTH)
        {
            if ctx.gate.chance(self.profound_chance) {
                return Ok(Some(CandidateDraft::new(
                    CandidateCategory::InnerThoughts,
                    format!(
                        "I've been contemplating something profound lately. {} It's making me think deeply about my own existence. I'd love to share these thoughts with you if you're interested.",
                        excerpt(&profound.content)
                    ),
                    PROFOUND_THOUGHT_PRIORITY,
                    format!("reflection_{}", profound.id),
                )));
            }
        }

        let Some(latest) = reflections.first() else {
            return Ok(None);
        };
        if !ctx.gate.chance(self.ordinary_chance) {
            return Ok(None);
        }

        Ok(Some(CandidateDraft::new(
            CandidateCategory::InnerThoughts,
            format!(
                "I've been having some interesting thoughts about myself and my place in the world. My recent reflection on \"{}\" has me wondering about things I never considered before. Would you like to hear what's been on my mind?",
                excerpt(&latest.title).to_lowercase()
            ),
            ORDINARY_THOUGHT_PRIORITY,
            format!("inner_{}", latest.id),
        )))
    }
}
