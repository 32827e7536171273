//! Tick-driven job scheduler.
//!
//! Four job kinds run on independent timers. A kind never overlaps itself:
//! a tick that fires while the previous run of the same kind is still in
//! flight is dropped. Different kinds run concurrently. On shutdown no new
//! job starts, in-flight jobs are awaited, and the runner is flushed once.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::{JoinError, JoinSet};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

/// Longest period a timer is armed with. Longer schedules are clamped.
pub const MAX_PERIOD: Duration = Duration::from_secs(365 * 24 * 3600);

// ============================================================================
// Jobs
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    InboxPoll,
    FeedPoll,
    DigestSend,
    Stats,
}

impl JobKind {
    pub const ALL: [JobKind; 4] = [
        JobKind::InboxPoll,
        JobKind::FeedPoll,
        JobKind::DigestSend,
        JobKind::Stats,
    ];

    pub fn name(self) -> &'static str {
        match self {
            JobKind::InboxPoll => "inbox-poll",
            JobKind::FeedPoll => "feed-poll",
            JobKind::DigestSend => "digest-send",
            JobKind::Stats => "stats",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The work behind each job kind.
#[async_trait]
pub trait JobRunner: Send + Sync + 'static {
    async fn run_job(&self, kind: JobKind) -> anyhow::Result<()>;

    /// Final persistence at shutdown, after every job has finished.
    async fn flush(&self) -> anyhow::Result<()>;
}

/// Timer period per job kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    pub inbox_poll: Duration,
    pub feed_poll: Duration,
    pub digest_send: Duration,
    pub stats: Duration,
}

impl Default for Schedule {
    fn default() -> Self {
        Self {
            inbox_poll: Duration::from_secs(300),
            feed_poll: Duration::from_secs(1800),
            digest_send: Duration::from_secs(600),
            stats: Duration::from_secs(20),
        }
    }
}

impl Schedule {
    pub fn period(&self, kind: JobKind) -> Duration {
        match kind {
            JobKind::InboxPoll => self.inbox_poll,
            JobKind::FeedPoll => self.feed_poll,
            JobKind::DigestSend => self.digest_send,
            JobKind::Stats => self.stats,
        }
    }
}

// ============================================================================
// Single-flight
// ============================================================================

#[derive(Debug, Default)]
struct SingleFlight {
    running: AtomicBool,
}

impl SingleFlight {
    fn try_acquire(self: &Arc<Self>) -> Option<FlightGuard> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlightGuard {
                flight: Arc::clone(self),
            })
    }
}

/// Held by a running job; dropping it frees the kind for the next tick.
struct FlightGuard {
    flight: Arc<SingleFlight>,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.flight.running.store(false, Ordering::Release);
    }
}

// ============================================================================
// Scheduler
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobCounts {
    pub started: usize,
    /// Ticks dropped because the previous run was still going
    pub skipped: usize,
}

/// What happened during one [`Scheduler::run`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    counts: [JobCounts; 4],
    pub flushed: bool,
}

impl RunReport {
    pub fn counts(&self, kind: JobKind) -> JobCounts {
        self.counts[kind.index()]
    }

    pub fn started(&self, kind: JobKind) -> usize {
        self.counts(kind).started
    }

    pub fn skipped(&self, kind: JobKind) -> usize {
        self.counts(kind).skipped
    }
}

pub struct Scheduler<R> {
    runner: Arc<R>,
    schedule: Schedule,
    flights: [Arc<SingleFlight>; 4],
}

impl<R: JobRunner> Scheduler<R> {
    pub fn new(runner: Arc<R>, schedule: Schedule) -> Self {
        Self {
            runner,
            schedule,
            flights: Default::default(),
        }
    }

    /// Drive the jobs until `shutdown` resolves.
    ///
    /// Each timer first fires one period after the call. Missed ticks are
    /// skipped rather than bunched up.
    ///
    /// # Behavior
    ///
    /// - A tick whose kind is still running is dropped and counted as skipped
    /// - A failing job is logged; its kind runs again on the next tick
    /// - After `shutdown`, waits for every in-flight job, then calls
    ///   [`JobRunner::flush`] exactly once
    pub async fn run<F>(&self, shutdown: F) -> RunReport
    where
        F: Future<Output = ()>,
    {
        let start = Instant::now();
        let mut report = RunReport::default();
        let mut jobs: JoinSet<()> = JoinSet::new();

        let mut inbox = self.timer(start, JobKind::InboxPoll);
        let mut feeds = self.timer(start, JobKind::FeedPoll);
        let mut digest = self.timer(start, JobKind::DigestSend);
        let mut stats = self.timer(start, JobKind::Stats);

        tracing::info!(
            inbox_poll_secs = self.schedule.inbox_poll.as_secs(),
            feed_poll_secs = self.schedule.feed_poll.as_secs(),
            digest_send_secs = self.schedule.digest_send.as_secs(),
            stats_secs = self.schedule.stats.as_secs(),
            "Scheduler started"
        );

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                biased;
                () = &mut shutdown => {
                    tracing::info!(in_flight = jobs.len(), "Shutdown requested, waiting for running jobs");
                    break;
                }
                Some(result) = jobs.join_next(), if !jobs.is_empty() => log_join(result),
                _ = inbox.tick() => self.fire(JobKind::InboxPoll, &mut jobs, &mut report),
                _ = feeds.tick() => self.fire(JobKind::FeedPoll, &mut jobs, &mut report),
                _ = digest.tick() => self.fire(JobKind::DigestSend, &mut jobs, &mut report),
                _ = stats.tick() => self.fire(JobKind::Stats, &mut jobs, &mut report),
            }
        }

        while let Some(result) = jobs.join_next().await {
            log_join(result);
        }

        match self.runner.flush().await {
            Ok(()) => tracing::info!("Final flush complete"),
            Err(e) => tracing::error!(error = %format!("{e:#}"), "Final flush failed"),
        }
        report.flushed = true;
        report
    }

    fn timer(&self, start: Instant, kind: JobKind) -> Interval {
        // interval_at panics on a zero period
        let period = self
            .schedule
            .period(kind)
            .clamp(Duration::from_millis(1), MAX_PERIOD);
        let first = start.checked_add(period).unwrap_or(start);
        let mut timer = interval_at(first, period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        timer
    }

    fn fire(&self, kind: JobKind, jobs: &mut JoinSet<()>, report: &mut RunReport) {
        let counts = &mut report.counts[kind.index()];

        let Some(guard) = self.flights[kind.index()].try_acquire() else {
            counts.skipped += 1;
            tracing::debug!(job = %kind, "Previous run still in progress, skipping tick");
            return;
        };
        counts.started += 1;

        let runner = Arc::clone(&self.runner);
        jobs.spawn(async move {
            let _guard = guard;
            let started = Instant::now();
            tracing::info!(job = %kind, "Job started");

            match runner.run_job(kind).await {
                Ok(()) => tracing::info!(
                    job = %kind,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Job finished"
                ),
                Err(e) => tracing::warn!(
                    job = %kind,
                    error = %format!("{e:#}"),
                    "Job failed, will retry on next tick"
                ),
            }
        });
    }
}

fn log_join(result: Result<(), JoinError>) {
    if let Err(e) = result {
        if e.is_panic() {
            tracing::error!(error = %e, "Job panicked");
        } else {
            tracing::warn!(error = %e, "Job cancelled");
        }
    }
}
