use std::sync::Mutex;
use std::sync::mpsc::Sender;

use crate::components::jobs::ArtifactId;
use crate::components::layers::LayerId;
use crate::geometry::Rect;

/// Events raised by the engine for observers such as a UI.  Delivery thread
/// is unspecified: jobs may notify from whichever thread drains the queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Notification {
    /// The projection of `node` was regenerated over `rect`.
    ProjectionChanged { node: LayerId, rect: Rect },
    /// A background job for `artifact` finished running.
    JobCompleted { artifact: ArtifactId },
    /// The selection's outline (and possibly thumbnail) was rebuilt.
    SelectionChanged { artifact: ArtifactId },
    /// The history cursor moved by `delta` entries and now sits at `index`.
    HistoryChanged { index: usize, delta: isize },
    /// The document crossed into or out of its saved state.
    CleanChanged { clean: bool },
}

pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: Notification);
}

impl NotificationSink for Sender<Notification> {
    fn notify(&self, notification: Notification) {
        // A closed receiver just means nobody is listening any more.
        let _ = self.send(notification);
    }
}

/// Discards everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSink;

impl NotificationSink for NullSink {
    fn notify(&self, _notification: Notification) {}
}

/// Keeps every notification in memory, in arrival order.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<Notification>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove and return everything recorded so far.
    pub fn take(&self) -> Vec<Notification> {
        self.events
            .lock()
            .map(|mut events| std::mem::take(&mut *events))
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.events.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl NotificationSink for RecordingSink {
    fn notify(&self, notification: Notification) {
        if let Ok(mut events) = self.events.lock() {
            events.push(notification);
        }
    }
}

impl<T: NotificationSink + ?Sized> NotificationSink for std::sync::Arc<T> {
    fn notify(&self, notification: Notification) {
        (**self).notify(notification);
    }
}
