//! Cron-driven job scheduler.
//!
//! Ticks at a fixed interval, evaluates each job's cron expression against
//! its last run, and spawns due jobs as Tokio tasks. A job never overlaps
//! itself: a trigger that arrives while the previous run is still going is
//! skipped with a warning. Different jobs run concurrently.
//!
//! A job reporting [`JobOutcome::Terminal`] stops the scheduler with
//! [`SchedulerError::Terminal`]; the binary turns that into a non-zero exit.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::reconcile::RosterReconciler;
use crate::selfupdate::{SelfUpdater, UpdateOutcome};

/// How a job run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Finished; carries a short summary.
    Completed(String),
    /// Failed; retried on the next trigger.
    Failed(String),
    /// Failed in a way that requires the process to exit.
    Terminal(String),
}

/// A unit of scheduled work.
#[async_trait]
pub trait Job: Send + Sync {
    /// Stable job name used in logs and scheduler state.
    fn name(&self) -> &str;

    /// Run one pass.
    async fn run(&self) -> JobOutcome;
}

#[async_trait]
impl Job for RosterReconciler {
    fn name(&self) -> &str {
        "roster-sync"
    }

    async fn run(&self) -> JobOutcome {
        match self.reconcile().await {
            Ok(report) => JobOutcome::Completed(report.to_string()),
            Err(e) => JobOutcome::Failed(e.to_string()),
        }
    }
}

#[async_trait]
impl Job for SelfUpdater {
    fn name(&self) -> &str {
        "self-update"
    }

    async fn run(&self) -> JobOutcome {
        match self.check_and_apply().await {
            Ok(UpdateOutcome::UpToDate) => JobOutcome::Completed("up to date".to_owned()),
            Ok(UpdateOutcome::Restarted { container_id }) => {
                JobOutcome::Completed(format!("restarted container {container_id}"))
            }
            Err(e) if e.is_terminal() => JobOutcome::Terminal(e.to_string()),
            Err(e) => JobOutcome::Failed(e.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduled jobs
// ---------------------------------------------------------------------------

/// A job bound to a cron schedule.
pub struct ScheduledJob {
    job: Arc<dyn Job>,
    cron: String,
    schedule: cron::Schedule,
    run_on_start: bool,
    running: Arc<AtomicBool>,
}

impl std::fmt::Debug for ScheduledJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduledJob")
            .field("name", &self.job.name())
            .field("cron", &self.cron)
            .field("run_on_start", &self.run_on_start)
            .field("running", &self.is_running())
            .finish()
    }
}

/// Marks a job as running until dropped.
#[derive(Debug)]
pub struct RunningGuard {
    flag: Arc<AtomicBool>,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

impl ScheduledJob {
    /// Bind `job` to a cron expression (seconds field included).
    ///
    /// # Errors
    ///
    /// Returns an error if the cron expression does not parse.
    pub fn new(job: Arc<dyn Job>, cron: &str) -> anyhow::Result<Self> {
        let schedule = cron::Schedule::from_str(cron)
            .with_context(|| format!("invalid cron expression for {}: {cron}", job.name()))?;
        Ok(Self {
            job,
            cron: cron.to_owned(),
            schedule,
            run_on_start: false,
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Also run once as soon as the scheduler starts.
    #[must_use]
    pub fn run_on_start(mut self, enabled: bool) -> Self {
        self.run_on_start = enabled;
        self
    }

    /// Job name.
    pub fn name(&self) -> &str {
        self.job.name()
    }

    /// Whether a run is currently in progress.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Claim the in-progress flag, or `None` if a run is already going.
    pub fn try_begin(&self) -> Option<RunningGuard> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunningGuard {
                flag: Arc::clone(&self.running),
            })
    }

    /// True if the schedule fires in `(after, now]`.
    pub fn is_due(&self, after: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        self.schedule.after(&after).take(1).any(|next| next <= now)
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Last trigger time per job.
#[derive(Debug, Default)]
pub struct SchedulerState {
    last_run: HashMap<String, DateTime<Utc>>,
}

impl SchedulerState {
    /// Empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `name` was triggered at `at`.
    pub fn record_run(&mut self, name: &str, at: DateTime<Utc>) {
        self.last_run.insert(name.to_owned(), at);
    }

    /// Last trigger time for `name`.
    pub fn last_run_for(&self, name: &str) -> Option<&DateTime<Utc>> {
        self.last_run.get(name)
    }
}

/// Jobs whose cron fires between their last run and `now`.
///
/// Never-run jobs are measured from the epoch, so they are due at once.
pub fn due_jobs<'a>(
    jobs: &'a [ScheduledJob],
    state: &SchedulerState,
    now: DateTime<Utc>,
) -> Vec<&'a ScheduledJob> {
    jobs.iter()
        .filter(|job| {
            let after = state
                .last_run_for(job.name())
                .copied()
                .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
            job.is_due(after, now)
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// Scheduler stop reasons other than a clean shutdown.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// A job failed terminally.
    #[error("job {job} failed terminally: {reason}")]
    Terminal {
        /// Job name.
        job: String,
        /// Failure description.
        reason: String,
    },
}

/// Runs a fixed set of jobs until shutdown or a terminal failure.
#[derive(Debug)]
pub struct Scheduler {
    jobs: Vec<ScheduledJob>,
    tick: Duration,
}

impl Scheduler {
    /// Create a scheduler ticking every `tick`.
    pub fn new(jobs: Vec<ScheduledJob>, tick: Duration) -> Self {
        Self {
            jobs,
            tick: tick.max(Duration::from_millis(10)),
        }
    }

    /// Run until `shutdown` fires or a job reports a terminal outcome.
    ///
    /// Jobs still running at shutdown are aborted.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Terminal`] for the first terminal outcome.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), SchedulerError> {
        let tick_ms = u64::try_from(self.tick.as_millis()).unwrap_or(u64::MAX);
        info!(jobs = self.jobs.len(), tick_ms, "scheduler started");

        let mut state = SchedulerState::new();
        let mut tasks: JoinSet<(String, JobOutcome, Duration)> = JoinSet::new();

        let started = Utc::now();
        for job in &self.jobs {
            state.record_run(job.name(), started);
            if job.run_on_start {
                info!(job = %job.name(), "running job at startup");
                spawn_job(job, &mut tasks);
            }
        }

        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        interval.tick().await;

        let result = loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    info!("scheduler shutting down");
                    break Ok(());
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    match joined {
                        Ok((name, JobOutcome::Terminal(reason), _)) => {
                            error!(job = %name, reason = %reason, "job failed terminally");
                            break Err(SchedulerError::Terminal { job: name, reason });
                        }
                        Ok((name, outcome, elapsed)) => log_outcome(&name, &outcome, elapsed),
                        Err(e) => error!(error = %e, "job task panicked"),
                    }
                }
                _ = interval.tick() => {
                    let now = Utc::now();
                    for job in due_jobs(&self.jobs, &state, now) {
                        state.record_run(job.name(), now);
                        spawn_job(job, &mut tasks);
                    }
                }
            }
        };

        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
        info!("scheduler stopped");
        result
    }
}

fn spawn_job(job: &ScheduledJob, tasks: &mut JoinSet<(String, JobOutcome, Duration)>) {
    let Some(guard) = job.try_begin() else {
        warn!(job = %job.name(), "previous run still in progress, skipping trigger");
        return;
    };

    let runner = Arc::clone(&job.job);
    tasks.spawn(async move {
        let _guard = guard;
        let start = Instant::now();
        let name = runner.name().to_owned();
        info!(job = %name, "job started");
        let outcome = runner.run().await;
        (name, outcome, start.elapsed())
    });
}

fn log_outcome(name: &str, outcome: &JobOutcome, elapsed: Duration) {
    let duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
    match outcome {
        JobOutcome::Completed(summary) => {
            info!(job = %name, duration_ms, summary = %summary, "job completed");
        }
        JobOutcome::Failed(reason) => {
            warn!(job = %name, duration_ms, reason = %reason, "job failed, will retry on next trigger");
        }
        JobOutcome::Terminal(reason) => {
            error!(job = %name, duration_ms, reason = %reason, "job failed terminally");
        }
    }
}
