//! One cooperative loop that dispatches named periodic jobs.
//!
//! Jobs run one at a time on the loop's task, so two jobs never overlap.
//! Each job is first due one interval after the loop starts; ties go to the
//! job registered first. A tick missed because another job ran long is
//! skipped, not replayed. Stopping interrupts a running job without waiting
//! for it to finish.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

const MIN_INTERVAL: Duration = Duration::from_millis(1);

#[async_trait]
pub trait ScheduledTask: Send + Sync {
    async fn run(&self);
}

pub struct PeriodicJob {
    name: String,
    interval: Duration,
    task: Arc<dyn ScheduledTask>,
}

impl PeriodicJob {
    pub fn new(name: impl Into<String>, interval: Duration, task: Arc<dyn ScheduledTask>) -> Self {
        Self {
            name: name.into(),
            interval: interval.max(MIN_INTERVAL),
            task,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

#[derive(Default)]
pub struct Scheduler {
    jobs: Vec<PeriodicJob>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_job(mut self, job: PeriodicJob) -> Self {
        self.jobs.push(job);
        self
    }

    pub fn add_job(&mut self, job: PeriodicJob) {
        self.jobs.push(job);
    }

    pub fn job_names(&self) -> Vec<String> {
        self.jobs.iter().map(|job| job.name.clone()).collect()
    }

    pub fn spawn(self) -> SchedulerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let names = self.job_names();
        tracing::info!("Scheduler starting with jobs: {}", names.join(", "));
        let join = tokio::spawn(run_loop(self.jobs, shutdown_rx));
        SchedulerHandle { shutdown_tx, join }
    }
}

pub struct SchedulerHandle {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl SchedulerHandle {
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Signal shutdown and wait for the loop to exit.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.join.await {
            tracing::warn!("Scheduler task ended abnormally: {}", e);
        }
        tracing::info!("Scheduler stopped");
    }
}

async fn run_loop(jobs: Vec<PeriodicJob>, mut shutdown_rx: watch::Receiver<bool>) {
    let started = Instant::now();
    let mut due = jobs
        .iter()
        .map(|job| started + job.interval)
        .collect::<Vec<_>>();

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let Some((index, next_due)) = due
            .iter()
            .copied()
            .enumerate()
            .min_by_key(|(_, at)| *at)
        else {
            // Nothing to run; idle until shutdown.
            let _ = shutdown_rx.changed().await;
            break;
        };

        tokio::select! {
            _ = shutdown_rx.changed() => break,
            _ = tokio::time::sleep_until(next_due) => {}
        }

        let job = &jobs[index];
        tracing::debug!("Running scheduled job '{}'", job.name);
        tokio::select! {
            _ = shutdown_rx.changed() => {
                tracing::info!("Scheduler interrupted job '{}' for shutdown", job.name);
                break;
            }
            _ = job.task.run() => {}
        }

        let now = Instant::now();
        let mut following = next_due + job.interval;
        while following <= now {
            following += job.interval;
        }
        due[index] = following;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Journal {
        entries: Mutex<Vec<(String, Duration)>>,
    }

    impl Journal {
        fn names(&self) -> Vec<String> {
            self.entries
                .lock()
                .expect("journal lock")
                .iter()
                .map(|(name, _)| name.clone())
                .collect()
        }
    }

    struct Recorder {
        name: &'static str,
        started: Instant,
        journal: Arc<Journal>,
        work: Duration,
    }

    #[async_trait]
    impl ScheduledTask for Recorder {
        async fn run(&self) {
            self.journal
                .entries
                .lock()
                .expect("journal lock")
                .push((self.name.to_string(), self.started.elapsed()));
            if !self.work.is_zero() {
                tokio::time::sleep(self.work).await;
            }
        }
    }

    fn job(
        name: &'static str,
        every_secs: u64,
        journal: &Arc<Journal>,
        started: Instant,
        work: Duration,
    ) -> PeriodicJob {
        PeriodicJob::new(
            name,
            Duration::from_secs(every_secs),
            Arc::new(Recorder {
                name,
                started,
                journal: journal.clone(),
                work,
            }),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn jobs_fire_on_their_own_intervals() {
        let journal = Arc::new(Journal::default());
        let started = Instant::now();
        let handle = Scheduler::new()
            .with_job(job("fast", 10, &journal, started, Duration::ZERO))
            .with_job(job("slow", 25, &journal, started, Duration::ZERO))
            .spawn();

        tokio::time::sleep(Duration::from_secs(51)).await;
        handle.stop().await;

        assert_eq!(
            journal.names(),
            vec!["fast", "fast", "slow", "fast", "fast", "fast", "slow"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn nothing_runs_before_first_interval() {
        let journal = Arc::new(Journal::default());
        let started = Instant::now();
        let handle = Scheduler::new()
            .with_job(job("cycle", 300, &journal, started, Duration::ZERO))
            .spawn();

        tokio::time::sleep(Duration::from_secs(299)).await;
        assert!(journal.names().is_empty());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(journal.names(), vec!["cycle"]);
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_interrupts_a_running_job() {
        let journal = Arc::new(Journal::default());
        let started = Instant::now();
        let handle = Scheduler::new()
            .with_job(job("long", 1, &journal, started, Duration::from_secs(3600)))
            .spawn();

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(journal.names(), vec!["long"]);
        handle.stop().await;
        assert_eq!(journal.names(), vec!["long"]);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_scheduler_stops_cleanly() {
        let handle = Scheduler::new().spawn();
        assert!(!handle.is_finished());
        handle.stop().await;
    }

    #[tokio::test]
    async fn zero_interval_is_clamped() {
        let journal = Arc::new(Journal::default());
        let started = Instant::now();
        let job = job("zero", 0, &journal, started, Duration::ZERO);
        assert_eq!(job.interval(), MIN_INTERVAL);
        assert_eq!(job.name(), "zero");
    }
}
