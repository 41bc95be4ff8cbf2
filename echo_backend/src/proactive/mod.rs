//! Proactive messaging: trigger evaluation, arbitration and emission.

pub mod arbitrator;
pub mod candidate;
pub mod enhancer;
pub mod evaluators;
pub mod gate;
pub mod temporal;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flume::Sender;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;

use crate::database::EchoDatabase;
use crate::scheduler::{PeriodicJob, ScheduledTask, Scheduler, SchedulerHandle};
use crate::signals::InteractionSource;
use arbitrator::{Arbitrator, ArbitratorPolicy, CycleOutcome, SubmitOutcome};
use candidate::{Candidate, CandidateCategory, CandidateDraft};
use enhancer::MessageEnhancer;
use evaluators::{EvaluationContext, TriggerEvaluator};
use gate::RandomGate;
use temporal::{local_hour, TemporalContext};

pub const MANUAL_TRIGGER_KEY: &str = "manual_trigger";
pub const MANUAL_TRIGGER_PRIORITY: u8 = 5;
const MANUAL_TRIGGER_MESSAGE: &str =
    "I wanted to reach out and see how you're doing. I've been thinking about our conversations.";

/// Receives emitted candidates (the UI side).
pub trait EmissionSink: Send + Sync {
    fn on_emit(&self, candidate: &Candidate);

    fn on_dismiss(&self, _id: &str) {}
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    ProactiveMessage(Candidate),
    CandidateDismissed { id: String },
}

/// Forwards engine events to the server's event bridge.
pub struct ChannelSink {
    tx: Sender<EngineEvent>,
}

impl ChannelSink {
    pub fn new(tx: Sender<EngineEvent>) -> Self {
        Self { tx }
    }
}

impl EmissionSink for ChannelSink {
    fn on_emit(&self, candidate: &Candidate) {
        if self
            .tx
            .send(EngineEvent::ProactiveMessage(candidate.clone()))
            .is_err()
        {
            tracing::debug!("No listener for proactive message {}", candidate.id);
        }
    }

    fn on_dismiss(&self, id: &str) {
        let _ = self.tx.send(EngineEvent::CandidateDismissed { id: id.to_string() });
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineStatus {
    pub running: bool,
    pub enhancement_enabled: bool,
    pub last_emission_at: Option<DateTime<Utc>>,
    pub cooldown_remaining_secs: i64,
    pub pending_count: usize,
    pub consecutive_enhancement_failures: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForceOutcome {
    pub submit: SubmitOutcome,
    pub cycle: CycleOutcome,
}

/// Intervals for the engine's own jobs plus any jobs the caller wants on the same loop.
pub struct EngineSchedule {
    pub cycle_interval: Duration,
    pub cleanup_interval: Duration,
    pub extra_jobs: Vec<PeriodicJob>,
}

/// Rebuild the arbitrator from the database, starting empty if that fails.
pub fn load_arbitrator(db: &EchoDatabase, policy: ArbitratorPolicy) -> Arbitrator {
    let candidates = match db.load_candidates() {
        Ok(candidates) => candidates,
        Err(e) => {
            tracing::warn!("Failed to load proactive candidates: {}", e);
            Vec::new()
        }
    };
    let last_emission = match db.get_last_emission_time() {
        Ok(last) => last,
        Err(e) => {
            tracing::warn!("Failed to load last proactive emission time: {}", e);
            None
        }
    };
    tracing::info!(
        "Restored {} proactive candidate(s) from database",
        candidates.len()
    );
    Arbitrator::restore(policy, candidates, last_emission)
}

pub struct ProactiveEngine {
    arbitrator: Mutex<Arbitrator>,
    evaluators: Vec<Box<dyn TriggerEvaluator>>,
    interactions: Arc<dyn InteractionSource>,
    enhancer: MessageEnhancer,
    gate: Arc<dyn RandomGate>,
    sink: Arc<dyn EmissionSink>,
    db: Option<Arc<EchoDatabase>>,
    scheduler: Mutex<Option<SchedulerHandle>>,
}

impl ProactiveEngine {
    pub fn new(
        arbitrator: Arbitrator,
        evaluators: Vec<Box<dyn TriggerEvaluator>>,
        interactions: Arc<dyn InteractionSource>,
        enhancer: MessageEnhancer,
        gate: Arc<dyn RandomGate>,
        sink: Arc<dyn EmissionSink>,
    ) -> Self {
        Self {
            arbitrator: Mutex::new(arbitrator),
            evaluators,
            interactions,
            enhancer,
            gate,
            sink,
            db: None,
            scheduler: Mutex::new(None),
        }
    }

    /// Persist the candidate set and last emission time after every change.
    pub fn with_database(mut self, db: Arc<EchoDatabase>) -> Self {
        self.db = Some(db);
        self
    }

    pub async fn run_cycle(&self) -> CycleOutcome {
        let now = Utc::now();
        self.run_cycle_at(now, local_hour(now)).await
    }

    /// One evaluation cycle: evaluate, enhance, submit, then try to emit.
    pub async fn run_cycle_at(&self, now: DateTime<Utc>, local_hour: u32) -> CycleOutcome {
        let last_interaction = match self.interactions.last_interaction_time() {
            Ok(last) => last,
            Err(e) => {
                tracing::warn!("Failed to read last interaction time: {}", e);
                None
            }
        };
        let temporal = TemporalContext::compute(now, last_interaction, local_hour);
        tracing::debug!(
            "Proactive cycle: {:.1}h since last interaction, {} day(s), {}",
            temporal.hours_since_last_interaction(),
            temporal.days_since_last_chat,
            temporal.time_of_day.as_str()
        );

        let drafts = self.evaluate_all(&temporal);
        let drafts = self.fresh_drafts(drafts).await;

        let enhanced = join_all(drafts.into_iter().map(|draft| async move {
            let payload = self.enhancer.enhance(&draft.payload).await;
            CandidateDraft { payload, ..draft }
        }))
        .await;

        let (outcome, snapshot, last_emission) = {
            let mut arbitrator = self.arbitrator.lock().await;
            for draft in enhanced {
                arbitrator.submit(Candidate::from_draft(draft, now));
            }
            let outcome = arbitrator.evaluate_cycle(now, self.sink.as_ref());
            (outcome, arbitrator.snapshot(), arbitrator.last_emission_at())
        };

        match &outcome {
            CycleOutcome::Emitted(_) => {}
            CycleOutcome::CoolingDown { remaining_secs } => {
                tracing::debug!("Proactive cooldown active ({}s remaining)", remaining_secs);
            }
            CycleOutcome::NothingPending => tracing::debug!("No proactive candidates pending"),
        }

        self.persist(&snapshot, last_emission);
        outcome
    }

    fn evaluate_all(&self, temporal: &TemporalContext) -> Vec<CandidateDraft> {
        let ctx = EvaluationContext {
            temporal,
            gate: self.gate.as_ref(),
        };
        let mut drafts = Vec::new();
        for evaluator in &self.evaluators {
            match evaluator.evaluate(&ctx) {
                Ok(Some(draft)) => {
                    tracing::debug!(
                        "Evaluator '{}' proposed {} (trigger: {})",
                        evaluator.name(),
                        draft.category.as_db_str(),
                        draft.trigger_key
                    );
                    drafts.push(draft);
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!("Trigger evaluator '{}' failed: {}", evaluator.name(), e);
                }
            }
        }
        drafts
    }

    /// Skip drafts that would be rejected or that were already shown, before paying for enhancement.
    async fn fresh_drafts(&self, drafts: Vec<CandidateDraft>) -> Vec<CandidateDraft> {
        let arbitrator = self.arbitrator.lock().await;
        let mut seen = HashSet::new();
        drafts
            .into_iter()
            .filter(|draft| {
                !arbitrator.has_live(&draft.trigger_key)
                    && !arbitrator.was_emitted(&draft.trigger_key)
                    && seen.insert(draft.trigger_key.clone())
            })
            .collect()
    }

    /// Queue a manual candidate and attempt emission right away, cooldown permitting.
    pub async fn force_candidate(&self, category: CandidateCategory) -> ForceOutcome {
        self.force_candidate_at(category, Utc::now()).await
    }

    pub async fn force_candidate_at(
        &self,
        category: CandidateCategory,
        now: DateTime<Utc>,
    ) -> ForceOutcome {
        let mut draft = CandidateDraft::new(
            category,
            MANUAL_TRIGGER_MESSAGE,
            MANUAL_TRIGGER_PRIORITY,
            MANUAL_TRIGGER_KEY,
        );
        let duplicate = self.arbitrator.lock().await.has_live(MANUAL_TRIGGER_KEY);
        if !duplicate {
            draft.payload = self.enhancer.enhance(&draft.payload).await;
        }

        let (submit, cycle, snapshot, last_emission) = {
            let mut arbitrator = self.arbitrator.lock().await;
            let submit = arbitrator.submit(Candidate::from_draft(draft, now));
            let cycle = arbitrator.evaluate_cycle(now, self.sink.as_ref());
            (submit, cycle, arbitrator.snapshot(), arbitrator.last_emission_at())
        };
        tracing::info!("Forced proactive {} candidate", category.as_db_str());
        self.persist(&snapshot, last_emission);
        ForceOutcome { submit, cycle }
    }

    /// Flag a candidate dismissed. Unknown ids are a no-op.
    pub async fn dismiss(&self, id: &str) -> bool {
        let (found, snapshot) = {
            let mut arbitrator = self.arbitrator.lock().await;
            let found = arbitrator.dismiss(id);
            (found, arbitrator.snapshot())
        };
        if found {
            self.sink.on_dismiss(id);
            self.persist(&snapshot, None);
        } else {
            tracing::debug!("Dismiss for unknown proactive candidate {}", id);
        }
        found
    }

    pub async fn pending_candidates(&self) -> Vec<Candidate> {
        self.arbitrator.lock().await.pending_candidates()
    }

    pub async fn cleanup(&self) -> usize {
        self.cleanup_at(Utc::now()).await
    }

    pub async fn cleanup_at(&self, now: DateTime<Utc>) -> usize {
        let (removed, snapshot) = {
            let mut arbitrator = self.arbitrator.lock().await;
            let removed = arbitrator.cleanup(now);
            (removed, arbitrator.snapshot())
        };
        if removed > 0 {
            tracing::info!("Purged {} expired proactive candidate(s)", removed);
            self.persist(&snapshot, None);
        }
        removed
    }

    pub async fn status(&self) -> EngineStatus {
        self.status_at(Utc::now()).await
    }

    pub async fn status_at(&self, now: DateTime<Utc>) -> EngineStatus {
        let running = self.is_running().await;
        let arbitrator = self.arbitrator.lock().await;
        EngineStatus {
            running,
            enhancement_enabled: self.enhancer.is_enabled(),
            last_emission_at: arbitrator.last_emission_at(),
            cooldown_remaining_secs: arbitrator
                .cooldown_remaining(now)
                .map(|remaining| remaining.num_seconds().max(0))
                .unwrap_or(0),
            pending_count: arbitrator.live_count(),
            consecutive_enhancement_failures: self.enhancer.consecutive_failures(),
        }
    }

    pub async fn is_running(&self) -> bool {
        self.scheduler
            .lock()
            .await
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Start the ticking loop. Returns false if it is already running.
    pub async fn start(self: &Arc<Self>, schedule: EngineSchedule) -> bool {
        let mut slot = self.scheduler.lock().await;
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            tracing::debug!("Proactive engine already running");
            return false;
        }

        let mut scheduler = Scheduler::new()
            .with_job(PeriodicJob::new(
                "proactive_cycle",
                schedule.cycle_interval,
                Arc::new(CycleTask(Arc::downgrade(self))),
            ))
            .with_job(PeriodicJob::new(
                "candidate_cleanup",
                schedule.cleanup_interval,
                Arc::new(CleanupTask(Arc::downgrade(self))),
            ));
        for job in schedule.extra_jobs {
            scheduler.add_job(job);
        }

        *slot = Some(scheduler.spawn());
        tracing::info!("Proactive engine started");
        true
    }

    /// Stop the ticking loop; in-flight work is dropped. Returns false if not running.
    pub async fn stop(&self) -> bool {
        let handle = self.scheduler.lock().await.take();
        match handle {
            Some(handle) => {
                handle.stop().await;
                tracing::info!("Proactive engine stopped");
                true
            }
            None => false,
        }
    }

    fn persist(&self, snapshot: &[Candidate], last_emission: Option<DateTime<Utc>>) {
        let Some(db) = self.db.as_ref() else {
            return;
        };
        if let Err(e) = db.replace_candidates(snapshot) {
            tracing::warn!("Failed to persist proactive candidates: {}", e);
        }
        if let Some(at) = last_emission {
            if let Err(e) = db.set_last_emission_time(at) {
                tracing::warn!("Failed to persist last proactive emission: {}", e);
            }
        }
    }
}

struct CycleTask(Weak<ProactiveEngine>);

#[async_trait]
impl ScheduledTask for CycleTask {
    async fn run(&self) {
        if let Some(engine) = self.0.upgrade() {
            engine.run_cycle().await;
        }
    }
}

struct CleanupTask(Weak<ProactiveEngine>);

#[async_trait]
impl ScheduledTask for CleanupTask {
    async fn run(&self) {
        if let Some(engine) = self.0.upgrade() {
            engine.cleanup().await;
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::llm_client::{TextGenerator, TextStream};
    use anyhow::Result;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    pub struct RecordingSink {
        emitted: StdMutex<Vec<Candidate>>,
        dismissed: StdMutex<Vec<String>>,
    }

    impl RecordingSink {
        pub fn emitted(&self) -> Vec<Candidate> {
            self.emitted.lock().expect("sink lock").clone()
        }

        pub fn emitted_keys(&self) -> Vec<String> {
            self.emitted()
                .into_iter()
                .map(|candidate| candidate.trigger_key)
                .collect()
        }

        pub fn dismissed(&self) -> Vec<String> {
            self.dismissed.lock().expect("sink lock").clone()
        }
    }

    impl EmissionSink for RecordingSink {
        fn on_emit(&self, candidate: &Candidate) {
            self.emitted
                .lock()
                .expect("sink lock")
                .push(candidate.clone());
        }

        fn on_dismiss(&self, id: &str) {
            self.dismissed.lock().expect("sink lock").push(id.to_string());
        }
    }

    /// Replays scripted chance outcomes, then falls back to a fixed answer.
    pub struct ScriptedGate {
        chances: StdMutex<VecDeque<bool>>,
        picks: StdMutex<VecDeque<usize>>,
        requested: StdMutex<Vec<f64>>,
        fallback: bool,
    }

    impl ScriptedGate {
        pub fn new(chances: Vec<bool>) -> Self {
            Self {
                chances: StdMutex::new(chances.into()),
                picks: StdMutex::new(VecDeque::new()),
                requested: StdMutex::new(Vec::new()),
                fallback: false,
            }
        }

        pub fn never() -> Self {
            Self::new(Vec::new())
        }

        pub fn always() -> Self {
            Self {
                fallback: true,
                ..Self::never()
            }
        }

        pub fn with_picks(self, picks: Vec<usize>) -> Self {
            *self.picks.lock().expect("gate lock") = picks.into();
            self
        }

        pub fn requested(&self) -> Vec<f64> {
            self.requested.lock().expect("gate lock").clone()
        }
    }

    impl RandomGate for ScriptedGate {
        fn chance(&self, probability: f64) -> bool {
            self.requested.lock().expect("gate lock").push(probability);
            self.chances
                .lock()
                .expect("gate lock")
                .pop_front()
                .unwrap_or(self.fallback)
        }

        fn pick_index(&self, _len: usize) -> usize {
            self.picks
                .lock()
                .expect("gate lock")
                .pop_front()
                .unwrap_or(0)
        }
    }

    pub struct FixedGenerator {
        chunks: Vec<String>,
        prompts: StdMutex<Vec<String>>,
    }

    impl FixedGenerator {
        pub fn new(chunks: &[&str]) -> Self {
            Self {
                chunks: chunks.iter().map(|chunk| chunk.to_string()).collect(),
                prompts: StdMutex::new(Vec::new()),
            }
        }

        pub fn prompts(&self) -> Vec<String> {
            self.prompts.lock().expect("prompt lock").clone()
        }
    }

    #[async_trait]
    impl TextGenerator for FixedGenerator {
        async fn generate(&self, prompt: &str) -> Result<TextStream> {
            self.prompts
                .lock()
                .expect("prompt lock")
                .push(prompt.to_string());
            let chunks = self.chunks.clone();
            Ok(Box::pin(futures_util::stream::iter(
                chunks.into_iter().map(Ok::<String, anyhow::Error>),
            )))
        }
    }

    pub struct FailingGenerator;

    #[async_trait]
    impl TextGenerator for FailingGenerator {
        async fn generate(&self, _prompt: &str) -> Result<TextStream> {
            anyhow::bail!("connection refused")
        }
    }

    pub struct BrokenStreamGenerator;

    #[async_trait]
    impl TextGenerator for BrokenStreamGenerator {
        async fn generate(&self, _prompt: &str) -> Result<TextStream> {
            Ok(Box::pin(futures_util::stream::iter(vec![
                Ok("partial".to_string()),
                Err(anyhow::anyhow!("connection reset")),
            ])))
        }
    }

    pub struct StallingGenerator;

    #[async_trait]
    impl TextGenerator for StallingGenerator {
        async fn generate(&self, _prompt: &str) -> Result<TextStream> {
            Ok(Box::pin(futures_util::stream::pending()))
        }
    }

    pub struct FixedInteraction(pub Option<DateTime<Utc>>);

    impl InteractionSource for FixedInteraction {
        fn last_interaction_time(&self) -> Result<Option<DateTime<Utc>>> {
            Ok(self.0)
        }
    }

    pub struct FailingInteraction;

    impl InteractionSource for FailingInteraction {
        fn last_interaction_time(&self) -> Result<Option<DateTime<Utc>>> {
            anyhow::bail!("conversation store unavailable")
        }
    }
}
