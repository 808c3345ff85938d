use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::notify::{Notification, NotificationSink};

// ============================================================================
// BACKGROUND JOBS — coalescing queue of derived-artifact recomputations
// ============================================================================

/// Identity of a derived artifact (an outline, a thumbnail, ...).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArtifactId(Uuid);

impl ArtifactId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ArtifactId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A low-priority recomputation of one artifact.
pub trait BackgroundJob: Send {
    fn artifact(&self) -> ArtifactId;

    /// Short tag identifying the job type; `overrides` usually compares it.
    fn kind(&self) -> &'static str;

    /// Whether this job makes the pending job `other` (same artifact)
    /// redundant.
    fn overrides(&self, other: &dyn BackgroundJob) -> bool;

    /// Recompute the artifact and report through `sink`.
    fn run(&mut self, sink: &dyn NotificationSink);

    /// Detail level targeted by this job (0 = full resolution).
    fn level_of_detail(&self) -> u32 {
        0
    }

    fn debug_name(&self) -> String {
        format!("{} for {}", self.kind(), self.artifact())
    }
}

/// What `enqueue` did with the new job.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Nothing was pending for the artifact.
    Added,
    /// The pending job was discarded in favour of the new one.
    Replaced,
    /// A job was already pending and the new one did not override it.
    Dropped,
}

#[derive(Default)]
struct QueueState {
    /// FIFO of artifacts that have a pending job.
    order: VecDeque<ArtifactId>,
    pending: HashMap<ArtifactId, Box<dyn BackgroundJob>>,
}

/// At most one pending job per artifact.  The override check and the
/// replacement happen under a single lock, so concurrent `enqueue` calls for
/// the same artifact can never both survive.
#[derive(Default)]
pub struct JobQueue {
    state: Mutex<QueueState>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, job: Box<dyn BackgroundJob>) -> EnqueueOutcome {
        let Ok(mut state) = self.state.lock() else {
            crate::log_err!("JobQueue: lock poisoned, dropping {}", job.debug_name());
            return EnqueueOutcome::Dropped;
        };
        let artifact = job.artifact();
        let outcome = match state.pending.get(&artifact) {
            None => EnqueueOutcome::Added,
            Some(current) if job.overrides(current.as_ref()) => EnqueueOutcome::Replaced,
            Some(current) => {
                crate::log_info!(
                    "JobQueue: {} kept, {} dropped",
                    current.debug_name(),
                    job.debug_name()
                );
                return EnqueueOutcome::Dropped;
            }
        };
        if outcome == EnqueueOutcome::Replaced {
            // The replacement queues behind everything already waiting.
            state.order.retain(|a| *a != artifact);
        }
        state.order.push_back(artifact);
        state.pending.insert(artifact, job);
        outcome
    }

    /// Remove and return the oldest pending job.
    pub fn take_next(&self) -> Option<Box<dyn BackgroundJob>> {
        let mut state = self.state.lock().ok()?;
        while let Some(artifact) = state.order.pop_front() {
            if let Some(job) = state.pending.remove(&artifact) {
                return Some(job);
            }
        }
        None
    }

    /// Run the oldest pending job, then report its completion.  Returns
    /// false when nothing was pending.  The lock is not held while the job
    /// runs, so jobs may enqueue follow-up work.
    pub fn run_next(&self, sink: &dyn NotificationSink) -> bool {
        let Some(mut job) = self.take_next() else { return false };
        let artifact = job.artifact();
        job.run(sink);
        sink.notify(Notification::JobCompleted { artifact });
        true
    }

    /// Run every pending job (including ones enqueued while draining).
    /// Returns how many ran.
    pub fn drain(&self, sink: &dyn NotificationSink) -> usize {
        let mut ran = 0;
        while self.run_next(sink) {
            ran += 1;
        }
        ran
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().map(|s| s.pending.len()).unwrap_or(0)
    }

    pub fn is_pending(&self, artifact: ArtifactId) -> bool {
        self.state
            .lock()
            .map(|s| s.pending.contains_key(&artifact))
            .unwrap_or(false)
    }

    /// Kind of the job pending for `artifact`.
    pub fn pending_kind(&self, artifact: ArtifactId) -> Option<&'static str> {
        let state = self.state.lock().ok()?;
        state.pending.get(&artifact).map(|j| j.kind())
    }

    /// Discard everything pending.  Returns how many jobs were dropped.
    pub fn clear(&self) -> usize {
        let Ok(mut state) = self.state.lock() else { return 0 };
        let dropped = state.pending.len();
        state.pending.clear();
        state.order.clear();
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::RecordingSink;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingJob {
        artifact: ArtifactId,
        tag: &'static str,
        wins: bool,
        runs: Arc<AtomicUsize>,
    }

    impl BackgroundJob for CountingJob {
        fn artifact(&self) -> ArtifactId {
            self.artifact
        }
        fn kind(&self) -> &'static str {
            self.tag
        }
        fn overrides(&self, _other: &dyn BackgroundJob) -> bool {
            self.wins
        }
        fn run(&mut self, _sink: &dyn NotificationSink) {
            self.runs.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counting_job(artifact: ArtifactId, tag: &'static str, wins: bool, runs: &Arc<AtomicUsize>) -> Box<CountingJob> {
        Box::new(CountingJob { artifact, tag, wins, runs: runs.clone() })
    }

    #[test]
    fn override_replaces_and_requeues_at_back() {
        let q = JobQueue::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let (a, b) = (ArtifactId::new(), ArtifactId::new());
        assert_eq!(q.enqueue(counting_job(a, "first", false, &runs)), EnqueueOutcome::Added);
        assert_eq!(q.enqueue(counting_job(b, "other", false, &runs)), EnqueueOutcome::Added);
        assert_eq!(q.enqueue(counting_job(a, "second", true, &runs)), EnqueueOutcome::Replaced);
        assert_eq!(q.pending_count(), 2);
        assert_eq!(q.take_next().unwrap().kind(), "other");
        assert_eq!(q.take_next().unwrap().kind(), "second");
        assert!(q.take_next().is_none());
    }

    #[test]
    fn non_overriding_job_is_dropped() {
        let q = JobQueue::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let a = ArtifactId::new();
        q.enqueue(counting_job(a, "first", false, &runs));
        assert_eq!(q.enqueue(counting_job(a, "late", false, &runs)), EnqueueOutcome::Dropped);
        assert_eq!(q.pending_kind(a), Some("first"));
    }

    #[test]
    fn drain_runs_each_job_once_and_notifies() {
        let q = JobQueue::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let a = ArtifactId::new();
        q.enqueue(counting_job(a, "job", false, &runs));
        let sink = RecordingSink::new();
        assert_eq!(q.drain(&sink), 1);
        assert_eq!(q.drain(&sink), 0);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(sink.take(), vec![Notification::JobCompleted { artifact: a }]);
        assert!(!q.is_pending(a));
    }

    #[test]
    fn concurrent_enqueues_leave_one_job_per_artifact() {
        let q = Arc::new(JobQueue::new());
        let runs = Arc::new(AtomicUsize::new(0));
        let a = ArtifactId::new();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let q = q.clone();
                let runs = runs.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        q.enqueue(counting_job(a, "racer", i % 2 == 0, &runs));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(q.pending_count(), 1);
        assert_eq!(q.drain(&crate::notify::NullSink), 1);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn artifact_ids_are_serde_values() {
        fn assert_serde<T: Serialize + for<'de> Deserialize<'de>>() {}
        assert_serde::<ArtifactId>();
        assert_ne!(ArtifactId::new(), ArtifactId::new());
    }

    #[test]
    fn clear_drops_pending() {
        let q = JobQueue::new();
        let runs = Arc::new(AtomicUsize::new(0));
        q.enqueue(counting_job(ArtifactId::new(), "x", false, &runs));
        assert_eq!(q.clear(), 1);
        assert_eq!(q.pending_count(), 0);
    }
}
