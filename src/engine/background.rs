// Aviary Engine — Background Task Manager
// Activity-aware priority queue + cooperative worker pool + periodic
// scheduler. Drives extraction, summary refresh, and learning maintenance
// off the event log without ever blocking a user turn. Failures here are
// logged and counted — never surfaced to the user mid-conversation.

use crate::atoms::error::{EngineError, EngineResult};
use log::{info, warn};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

// ── Activity tracking ──────────────────────────────────────────────────────

/// Plain timestamp under the cooperative model — no locking needed beyond
/// the atomic itself. Quiet-requiring jobs defer while the user is active.
pub struct ActivityTracker {
    last_user_event_ms: AtomicU64,
    quiet_threshold: Duration,
}

impl ActivityTracker {
    pub fn new(quiet_threshold: Duration) -> Self {
        ActivityTracker { last_user_event_ms: AtomicU64::new(0), quiet_threshold }
    }

    /// Called on every inbound user event.
    pub fn pulse(&self) {
        self.last_user_event_ms.store(now_ms(), Ordering::Relaxed);
    }

    pub fn is_user_active(&self) -> bool {
        let last = self.last_user_event_ms.load(Ordering::Relaxed);
        if last == 0 {
            return false;
        }
        now_ms().saturating_sub(last) < self.quiet_threshold.as_millis() as u64
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ── Jobs ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    Extraction,
    SummaryRefresh,
    LearningMaintenance,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Extraction => "extraction",
            JobKind::SummaryRefresh => "summary_refresh",
            JobKind::LearningMaintenance => "learning_maintenance",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone)]
pub struct Job {
    pub kind: JobKind,
    pub priority: Priority,
    pub args: String,
    pub requires_quiet: bool,
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_count: u32,
}

impl Job {
    pub fn new(kind: JobKind, priority: Priority) -> Self {
        Job {
            kind,
            priority,
            args: String::new(),
            requires_quiet: false,
            timeout: Duration::from_secs(300),
            max_retries: 3,
            retry_count: 0,
        }
    }

    fn dedup_key(&self) -> (JobKind, String) {
        (self.kind, self.args.clone())
    }
}

/// The registered periodic set:
/// extraction HIGH/60 s/quiet, summary refresh MEDIUM/300 s/quiet,
/// learning maintenance LOW/3600 s/anytime.
pub fn registered_periodics() -> Vec<(Job, Duration)> {
    vec![
        (
            Job {
                requires_quiet: true,
                timeout: Duration::from_secs(120),
                ..Job::new(JobKind::Extraction, Priority::High)
            },
            Duration::from_secs(60),
        ),
        (
            Job {
                requires_quiet: true,
                timeout: Duration::from_secs(300),
                ..Job::new(JobKind::SummaryRefresh, Priority::Medium)
            },
            Duration::from_secs(300),
        ),
        (
            Job {
                requires_quiet: false,
                timeout: Duration::from_secs(60),
                ..Job::new(JobKind::LearningMaintenance, Priority::Low)
            },
            Duration::from_secs(3600),
        ),
    ]
}

// ── Runner seam ────────────────────────────────────────────────────────────

/// What actually executes a job. The engine wires this to extraction,
/// summary refresh, and learning maintenance; tests plug in probes.
#[async_trait::async_trait]
pub trait JobRunner: Send + Sync + 'static {
    async fn run(&self, job: &Job) -> EngineResult<()>;
}

// ── Metrics ────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct TaskMetrics {
    pub runs: AtomicU64,
    pub retries: AtomicU64,
    pub timeouts: AtomicU64,
    pub permanent_failures: AtomicU64,
    pub deferred_for_activity: AtomicU64,
}

impl TaskMetrics {
    pub fn snapshot(&self) -> (u64, u64, u64, u64) {
        (
            self.runs.load(Ordering::Relaxed),
            self.retries.load(Ordering::Relaxed),
            self.timeouts.load(Ordering::Relaxed),
            self.permanent_failures.load(Ordering::Relaxed),
        )
    }
}

// ── Manager ────────────────────────────────────────────────────────────────

struct QueueState {
    high: VecDeque<Job>,
    medium: VecDeque<Job>,
    low: VecDeque<Job>,
    /// Jobs waiting for a later due time (retries, quiet deferral).
    delayed: Vec<(Instant, Job)>,
    enqueued: HashSet<(JobKind, String)>,
    periodics: Vec<(Job, Duration, Instant)>,
}

impl QueueState {
    fn len(&self) -> usize {
        self.high.len() + self.medium.len() + self.low.len() + self.delayed.len()
    }
}

pub struct BackgroundManager {
    queue: Mutex<QueueState>,
    notify: Notify,
    pub activity: Arc<ActivityTracker>,
    pub metrics: Arc<TaskMetrics>,
    capacity: usize,
    tick: Duration,
    shutdown: AtomicBool,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl BackgroundManager {
    pub fn new(capacity: usize, quiet_threshold: Duration) -> Arc<Self> {
        Self::with_tick(capacity, quiet_threshold, Duration::from_secs(10))
    }

    /// Tests shrink the scheduler tick to keep wall-clock down.
    pub fn with_tick(capacity: usize, quiet_threshold: Duration, tick: Duration) -> Arc<Self> {
        Arc::new(BackgroundManager {
            queue: Mutex::new(QueueState {
                high: VecDeque::new(),
                medium: VecDeque::new(),
                low: VecDeque::new(),
                delayed: Vec::new(),
                enqueued: HashSet::new(),
                periodics: Vec::new(),
            }),
            notify: Notify::new(),
            activity: Arc::new(ActivityTracker::new(quiet_threshold)),
            metrics: Arc::new(TaskMetrics::default()),
            capacity,
            tick,
            shutdown: AtomicBool::new(false),
            handles: Mutex::new(Vec::new()),
        })
    }

    /// Push a job now. Duplicate `(kind, args)` pushes are dropped; a full
    /// queue is backpressure (`Busy`) — connectors never see this, only the
    /// engine's own periodic scheduler and explicit kicks.
    pub fn push(&self, job: Job) -> EngineResult<bool> {
        let mut queue = self.queue.lock();
        if queue.len() >= self.capacity {
            return Err(EngineError::busy("background queue"));
        }
        if !queue.enqueued.insert(job.dedup_key()) {
            return Ok(false);
        }
        match job.priority {
            Priority::High => queue.high.push_back(job),
            Priority::Medium => queue.medium.push_back(job),
            Priority::Low => queue.low.push_back(job),
        }
        drop(queue);
        self.notify.notify_one();
        Ok(true)
    }

    pub fn register_periodic(&self, job: Job, interval: Duration) {
        let mut queue = self.queue.lock();
        let next = Instant::now() + interval;
        queue.periodics.push((job, interval, next));
    }

    /// Ask for a job kind to run as soon as a worker frees up.
    pub fn kick(&self, kind: JobKind) {
        let template = registered_periodics()
            .into_iter()
            .map(|(job, _)| job)
            .find(|job| job.kind == kind);
        if let Some(job) = template {
            let _ = self.push(job);
        }
    }

    fn pop(&self) -> Option<Job> {
        let mut queue = self.queue.lock();
        let job = queue
            .high
            .pop_front()
            .or_else(|| queue.medium.pop_front())
            .or_else(|| queue.low.pop_front())?;
        queue.enqueued.remove(&job.dedup_key());
        Some(job)
    }

    fn schedule_later(&self, job: Job, delay: Duration) {
        let mut queue = self.queue.lock();
        queue.delayed.push((Instant::now() + delay, job));
    }

    /// Move due delayed jobs and due periodics onto the live queues.
    fn promote_due(&self) {
        let now = Instant::now();
        let mut due: Vec<Job> = Vec::new();
        {
            let mut queue = self.queue.lock();
            let mut keep = Vec::new();
            for (when, job) in queue.delayed.drain(..) {
                if when <= now {
                    due.push(job);
                } else {
                    keep.push((when, job));
                }
            }
            queue.delayed = keep;
            for (job, interval, next_run) in queue.periodics.iter_mut() {
                if now >= *next_run {
                    due.push(job.clone());
                    *next_run = now + *interval;
                }
            }
        }
        for job in due {
            let _ = self.push(job);
        }
    }

    /// Start `workers` worker tasks plus the periodic scheduler.
    pub fn start(self: Arc<Self>, workers: usize, runner: Arc<dyn JobRunner>) {
        for worker_id in 0..workers {
            let manager = Arc::clone(&self);
            let runner = Arc::clone(&runner);
            let handle = tokio::spawn(async move {
                manager.worker_loop(worker_id, runner).await;
            });
            self.handles.lock().push(handle);
        }

        let manager = Arc::clone(&self);
        let handle = tokio::spawn(async move {
            while !manager.shutdown.load(Ordering::Relaxed) {
                tokio::time::sleep(manager.tick).await;
                manager.promote_due();
                manager.notify.notify_waiters();
            }
        });
        self.handles.lock().push(handle);
        info!("[background] Started {} workers (tick {:?})", workers, self.tick);
    }

    async fn worker_loop(&self, worker_id: usize, runner: Arc<dyn JobRunner>) {
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                return;
            }
            let Some(job) = self.pop() else {
                // Wait for a push or the next scheduler tick.
                let _ = tokio::time::timeout(self.tick, self.notify.notified()).await;
                continue;
            };

            if job.requires_quiet && self.activity.is_user_active() {
                self.metrics.deferred_for_activity.fetch_add(1, Ordering::Relaxed);
                self.schedule_later(job, Duration::from_secs(30));
                continue;
            }

            self.metrics.runs.fetch_add(1, Ordering::Relaxed);
            let outcome = tokio::time::timeout(job.timeout, runner.run(&job)).await;
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_retryable() => self.retry(worker_id, job, &e.to_string()),
                Ok(Err(e)) => {
                    self.metrics.permanent_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "[background] Worker {}: {} failed permanently: {}",
                        worker_id,
                        job.kind.as_str(),
                        e
                    );
                }
                Err(_elapsed) => {
                    self.metrics.timeouts.fetch_add(1, Ordering::Relaxed);
                    self.retry(worker_id, job, "timeout");
                }
            }
        }
    }

    fn retry(&self, worker_id: usize, mut job: Job, reason: &str) {
        job.retry_count += 1;
        if job.retry_count < job.max_retries {
            self.metrics.retries.fetch_add(1, Ordering::Relaxed);
            let backoff = Duration::from_secs(2u64.pow(job.retry_count));
            warn!(
                "[background] Worker {}: {} retry {}/{} in {:?} ({})",
                worker_id,
                job.kind.as_str(),
                job.retry_count,
                job.max_retries,
                backoff,
                reason
            );
            self.schedule_later(job, backoff);
        } else {
            self.metrics.permanent_failures.fetch_add(1, Ordering::Relaxed);
            warn!(
                "[background] Worker {}: {} failed permanently after {} retries ({})",
                worker_id,
                job.kind.as_str(),
                job.retry_count,
                reason
            );
        }
    }

    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.notify.notify_waiters();
        for handle in self.handles.lock().drain(..) {
            handle.abort();
        }
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingRunner {
        ran: AtomicUsize,
        fail_first: AtomicBool,
    }

    #[async_trait::async_trait]
    impl JobRunner for CountingRunner {
        async fn run(&self, _job: &Job) -> EngineResult<()> {
            if self.fail_first.swap(false, Ordering::SeqCst) {
                return Err(EngineError::busy("simulated"));
            }
            self.ran.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn duplicate_pushes_are_dropped() {
        let manager = BackgroundManager::new(10, Duration::from_secs(30));
        assert!(manager.push(Job::new(JobKind::Extraction, Priority::High)).unwrap());
        assert!(!manager.push(Job::new(JobKind::Extraction, Priority::High)).unwrap());
        assert_eq!(manager.queue_depth(), 1);
    }

    #[tokio::test]
    async fn capacity_is_backpressure() {
        let manager = BackgroundManager::new(1, Duration::from_secs(30));
        manager.push(Job::new(JobKind::Extraction, Priority::High)).unwrap();
        let mut other = Job::new(JobKind::SummaryRefresh, Priority::Low);
        other.args = "x".into();
        let err = manager.push(other).unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn workers_run_jobs_and_retry_transients() {
        let manager = BackgroundManager::with_tick(
            100,
            Duration::from_secs(30),
            Duration::from_millis(20),
        );
        let runner = Arc::new(CountingRunner {
            ran: AtomicUsize::new(0),
            fail_first: AtomicBool::new(true),
        });
        Arc::clone(&manager).start(2, runner.clone());

        manager.push(Job::new(JobKind::Extraction, Priority::High)).unwrap();
        // First attempt fails retryably; backoff is 2s — too slow for a unit
        // test, so push a second distinct job to verify normal completion.
        let mut second = Job::new(JobKind::SummaryRefresh, Priority::Medium);
        second.args = "now".into();
        manager.push(second).unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(runner.ran.load(Ordering::SeqCst) >= 1);
        assert_eq!(manager.metrics.retries.load(Ordering::Relaxed), 1);
        manager.stop();
    }

    #[tokio::test]
    async fn quiet_jobs_defer_while_user_active() {
        let manager = BackgroundManager::with_tick(
            100,
            Duration::from_secs(60),
            Duration::from_millis(20),
        );
        let runner = Arc::new(CountingRunner {
            ran: AtomicUsize::new(0),
            fail_first: AtomicBool::new(false),
        });
        manager.activity.pulse(); // user is active
        Arc::clone(&manager).start(1, runner.clone());

        let mut job = Job::new(JobKind::Extraction, Priority::High);
        job.requires_quiet = true;
        manager.push(job).unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(runner.ran.load(Ordering::SeqCst), 0);
        assert!(manager.metrics.deferred_for_activity.load(Ordering::Relaxed) >= 1);
        manager.stop();
    }

    #[tokio::test]
    async fn periodics_fire_on_tick() {
        let manager = BackgroundManager::with_tick(
            100,
            Duration::from_secs(30),
            Duration::from_millis(10),
        );
        let runner = Arc::new(CountingRunner {
            ran: AtomicUsize::new(0),
            fail_first: AtomicBool::new(false),
        });
        manager.register_periodic(
            Job::new(JobKind::LearningMaintenance, Priority::Low),
            Duration::from_millis(30),
        );
        Arc::clone(&manager).start(1, runner.clone());
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(runner.ran.load(Ordering::SeqCst) >= 2);
        manager.stop();
    }
}
