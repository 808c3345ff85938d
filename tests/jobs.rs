use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use image::Rgba;

use strata::{
    ArtifactId, BackgroundJob, EnqueueOutcome, JobQueue, Notification, NotificationSink, Rect,
    RecordingSink, Selection, UpdateOutlineJob,
};

const COLORS: [Rgba<u8>; 2] = [Rgba([255, 255, 255, 255]), Rgba([0, 0, 0, 255])];

/// Recomputes a counter; never supersedes a pending job.
struct Stubborn {
    artifact: ArtifactId,
    runs: Arc<AtomicUsize>,
}

impl BackgroundJob for Stubborn {
    fn artifact(&self) -> ArtifactId {
        self.artifact
    }

    fn kind(&self) -> &'static str {
        "stubborn"
    }

    fn overrides(&self, _other: &dyn BackgroundJob) -> bool {
        false
    }

    fn run(&mut self, _sink: &dyn NotificationSink) {
        self.runs.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn thumbnail_job_replaced_by_outline_only_job() {
    let selection = Arc::new(Selection::new(128, 128));
    selection.select_rect(Rect::new(10, 10, 30, 30));
    let queue = JobQueue::new();

    let first = UpdateOutlineJob::new(selection.clone(), true, COLORS);
    let second = UpdateOutlineJob::new(selection.clone(), false, COLORS);
    assert_eq!(queue.enqueue(Box::new(first)), EnqueueOutcome::Added);
    assert_eq!(queue.enqueue(Box::new(second)), EnqueueOutcome::Replaced);

    let sink = RecordingSink::new();
    assert_eq!(queue.drain(&sink), 1);
    assert_eq!(selection.outline_builds(), 1);
    assert_eq!(selection.thumbnail_builds(), 0);
    assert!(selection.thumbnail().is_none());
    assert_eq!(selection.outline().unwrap().perimeter(), 120);
    let artifact = selection.artifact();
    assert_eq!(
        sink.take(),
        vec![
            Notification::SelectionChanged { artifact },
            Notification::JobCompleted { artifact },
        ]
    );
}

#[test]
fn pending_job_survives_when_not_overridden() {
    let queue = JobQueue::new();
    let runs = Arc::new(AtomicUsize::new(0));
    let artifact = ArtifactId::new();
    let job = || Box::new(Stubborn { artifact, runs: runs.clone() });
    assert_eq!(queue.enqueue(job()), EnqueueOutcome::Added);
    assert_eq!(queue.enqueue(job()), EnqueueOutcome::Dropped);
    assert_eq!(queue.pending_count(), 1);
    queue.drain(&strata::NullSink);
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[test]
fn jobs_for_different_artifacts_run_in_fifo_order() {
    let queue = JobQueue::new();
    let a = Arc::new(Selection::new(16, 16));
    let b = Arc::new(Selection::new(16, 16));
    queue.enqueue(Box::new(UpdateOutlineJob::new(a.clone(), false, COLORS)));
    queue.enqueue(Box::new(UpdateOutlineJob::new(b.clone(), false, COLORS)));
    let sink = RecordingSink::new();
    queue.drain(&sink);
    let completed: Vec<_> = sink
        .take()
        .into_iter()
        .filter_map(|n| match n {
            Notification::JobCompleted { artifact } => Some(artifact),
            _ => None,
        })
        .collect();
    assert_eq!(completed, vec![a.artifact(), b.artifact()]);
}

#[test]
fn queue_is_shared_across_threads() {
    let queue = Arc::new(JobQueue::new());
    let selection = Arc::new(Selection::new(32, 32));
    selection.select_rect(Rect::new(0, 0, 8, 8));
    let producers: Vec<_> = (0..4)
        .map(|i| {
            let queue = queue.clone();
            let selection = selection.clone();
            std::thread::spawn(move || {
                for _ in 0..25 {
                    queue.enqueue(Box::new(UpdateOutlineJob::new(selection.clone(), i % 2 == 0, COLORS)));
                }
            })
        })
        .collect();
    for p in producers {
        p.join().unwrap();
    }
    assert_eq!(queue.pending_count(), 1);
    let (tx, rx) = std::sync::mpsc::channel::<Notification>();
    assert_eq!(queue.drain(&tx), 1);
    drop(tx);
    assert_eq!(rx.iter().count(), 2);
    assert_eq!(selection.outline_builds(), 1);
}
