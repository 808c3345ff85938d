use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::notify::{Notification, NotificationSink, NullSink};
use crate::settings::EngineSettings;

// ============================================================================
// COMMAND TRAIT
// ============================================================================

/// Result of offering a later command to an earlier one.
pub enum MergeResult<C> {
    /// The earlier command now carries both effects.
    Merged,
    /// Not absorbed; the later command is handed back untouched.
    NotMergeable(C),
}

/// A reversible operation on `Target`.
pub trait Command: Send {
    type Target: ?Sized;

    fn redo(&self, target: &mut Self::Target);
    fn undo(&self, target: &mut Self::Target);
    fn description(&self) -> String;
    fn memory_size(&self) -> usize;

    /// Only commands of the same kind are ever considered for merging.
    fn kind(&self) -> &'static str;

    /// Semantic compatibility with the command committed just before
    /// (e.g. two moves of the same layer).
    fn can_merge_with(&self, _earlier: &Self) -> bool {
        false
    }

    /// Whether rapid repeats of this command may be folded together.
    fn timed_mergeable(&self) -> bool {
        false
    }

    /// Fold `later` into `self`.  Only called once a merge trigger fired.
    fn absorb(&mut self, later: Self) -> MergeResult<Self>
    where
        Self: Sized,
    {
        MergeResult::NotMergeable(later)
    }
}

// ============================================================================
// HISTORY ENTRIES
// ============================================================================

enum Entry<C> {
    Command {
        command: C,
        depth: usize,
        stamp: Instant,
    },
    Group {
        description: String,
        children: Vec<Entry<C>>,
        depth: usize,
    },
}

impl<C: Command> Entry<C> {
    fn redo(&self, target: &mut C::Target) {
        match self {
            Entry::Command { command, .. } => command.redo(target),
            Entry::Group { children, .. } => {
                for child in children {
                    child.redo(target);
                }
            }
        }
    }

    fn undo(&self, target: &mut C::Target) {
        match self {
            Entry::Command { command, .. } => command.undo(target),
            Entry::Group { children, .. } => {
                for child in children.iter().rev() {
                    child.undo(target);
                }
            }
        }
    }

    fn description(&self) -> String {
        match self {
            Entry::Command { command, .. } => command.description(),
            Entry::Group { description, .. } => description.clone(),
        }
    }

    fn memory_size(&self) -> usize {
        match self {
            Entry::Command { command, .. } => command.memory_size(),
            Entry::Group { children, description, .. } => {
                description.len() + children.iter().map(|c| c.memory_size()).sum::<usize>()
            }
        }
    }
}

struct OpenGroup<C> {
    description: String,
    children: Vec<Entry<C>>,
}

/// What `push` did with a command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Recorded as a new entry (or a new child of the open group).
    Appended,
    /// Folded into the previous entry.
    Merged,
}

// ============================================================================
// HISTORY — undo/redo with merge-on-commit, groups and a clean index
// ============================================================================

/// Ordered list of applied commands with a cursor.  Entries below the cursor
/// are undoable, entries above it redoable.  Committing merges into the top
/// entry when both share kind and nesting depth and either the commands are
/// semantically compatible or they arrived within the merge timeout.
pub struct History<C: Command> {
    entries: Vec<Entry<C>>,
    cursor: usize,
    clean_index: Option<usize>,
    open_groups: Vec<OpenGroup<C>>,
    max_steps: usize,
    max_memory_bytes: Option<usize>,
    merge_timeout: Duration,
    total_memory: usize,
    sink: Arc<dyn NotificationSink>,
}

impl<C: Command> Default for History<C> {
    fn default() -> Self {
        Self::from_settings(&EngineSettings::default())
    }
}

impl<C: Command> History<C> {
    pub fn new(max_steps: usize, max_memory_bytes: Option<usize>, merge_timeout: Duration) -> Self {
        Self {
            entries: Vec::new(),
            cursor: 0,
            clean_index: Some(0),
            open_groups: Vec::new(),
            max_steps,
            max_memory_bytes,
            merge_timeout,
            total_memory: 0,
            sink: Arc::new(NullSink),
        }
    }

    pub fn from_settings(settings: &EngineSettings) -> Self {
        Self::new(
            settings.max_undo_steps,
            settings.max_history_memory_bytes,
            settings.merge_timeout(),
        )
    }

    pub fn set_sink(&mut self, sink: Arc<dyn NotificationSink>) {
        self.sink = sink;
    }

    // ---- committing ---------------------------------------------------------

    /// Apply `command` to `target` and record it.
    pub fn push(&mut self, command: C, target: &mut C::Target) -> CommitOutcome {
        self.push_at(command, target, Instant::now())
    }

    /// Like [`push`](Self::push) with an explicit timestamp.
    pub fn push_at(&mut self, command: C, target: &mut C::Target, stamp: Instant) -> CommitOutcome {
        command.redo(target);
        self.commit_at(command, stamp)
    }

    /// Record a command whose effect is already applied.
    pub fn commit(&mut self, command: C) -> CommitOutcome {
        self.commit_at(command, Instant::now())
    }

    pub fn commit_at(&mut self, command: C, stamp: Instant) -> CommitOutcome {
        let was_clean = self.is_clean();
        let depth = self.open_groups.len();
        let timeout = self.merge_timeout;

        if depth == 0 {
            self.discard_redo_tail();
        }
        // Merging into the entry at the clean index would make the saved
        // state unreachable.
        let protect_top = depth == 0 && self.clean_index == Some(self.cursor);
        let siblings = match self.open_groups.last_mut() {
            Some(group) => &mut group.children,
            None => &mut self.entries,
        };

        let mut command = command;
        if !protect_top {
            if let Some(Entry::Command { command: top, depth: top_depth, stamp: top_stamp }) = siblings.last_mut() {
                if *top_depth == depth && top.kind() == command.kind() {
                    let semantic = command.can_merge_with(top);
                    let timed = !semantic
                        && top.timed_mergeable()
                        && command.timed_mergeable()
                        && stamp.saturating_duration_since(*top_stamp) < timeout;
                    if semantic || timed {
                        let before = top.memory_size();
                        match top.absorb(command) {
                            MergeResult::Merged => {
                                *top_stamp = stamp;
                                let after = top.memory_size();
                                self.total_memory = (self.total_memory + after).saturating_sub(before);
                                if depth == 0 {
                                    self.announce(was_clean, 0);
                                    self.prune();
                                }
                                return CommitOutcome::Merged;
                            }
                            MergeResult::NotMergeable(back) => command = back,
                        }
                    }
                }
            }
        }

        self.total_memory += command.memory_size();
        siblings.push(Entry::Command { command, depth, stamp });
        if depth == 0 {
            self.cursor += 1;
            self.announce(was_clean, 1);
            self.prune();
        } else if was_clean {
            self.sink.notify(Notification::CleanChanged { clean: false });
        }
        CommitOutcome::Appended
    }

    fn discard_redo_tail(&mut self) {
        if self.cursor < self.entries.len() {
            for entry in self.entries.drain(self.cursor..) {
                self.total_memory = self.total_memory.saturating_sub(entry.memory_size());
            }
            if self.clean_index.is_some_and(|i| i > self.cursor) {
                self.clean_index = None;
            }
        }
    }

    // ---- groups -------------------------------------------------------------

    /// Open a grouping command.  Until the matching [`end_group`], pushed
    /// commands become its children (depth = number of open groups) and
    /// undo/redo are refused.
    ///
    /// [`end_group`]: Self::end_group
    pub fn begin_group(&mut self, description: impl Into<String>) {
        self.open_groups.push(OpenGroup { description: description.into(), children: Vec::new() });
    }

    /// Close the innermost group.  Empty groups leave no trace.  Returns
    /// false when no group was open.
    pub fn end_group(&mut self) -> bool {
        let was_clean = self.is_clean();
        let Some(group) = self.open_groups.pop() else {
            crate::log_warn!("History: end_group without matching begin_group");
            return false;
        };
        if group.children.is_empty() {
            return true;
        }
        let depth = self.open_groups.len();
        self.total_memory += group.description.len();
        let entry = Entry::Group { description: group.description, children: group.children, depth };
        match self.open_groups.last_mut() {
            Some(parent) => parent.children.push(entry),
            None => {
                self.discard_redo_tail();
                self.entries.push(entry);
                self.cursor += 1;
                self.announce(was_clean, 1);
                self.prune();
            }
        }
        true
    }

    pub fn group_depth(&self) -> usize {
        self.open_groups.len()
    }

    // ---- undo / redo --------------------------------------------------------

    pub fn undo(&mut self, target: &mut C::Target) -> Option<String> {
        if !self.open_groups.is_empty() {
            crate::log_warn!("History: undo refused while a group is open");
            return None;
        }
        if self.cursor == 0 {
            return None;
        }
        let was_clean = self.is_clean();
        self.cursor -= 1;
        let entry = &self.entries[self.cursor];
        entry.undo(target);
        let description = entry.description();
        self.announce(was_clean, -1);
        Some(description)
    }

    pub fn redo(&mut self, target: &mut C::Target) -> Option<String> {
        if !self.open_groups.is_empty() {
            crate::log_warn!("History: redo refused while a group is open");
            return None;
        }
        let entry = self.entries.get(self.cursor)?;
        let was_clean = self.is_clean();
        entry.redo(target);
        let description = entry.description();
        self.cursor += 1;
        self.announce(was_clean, 1);
        Some(description)
    }

    /// Undo `count` steps (0 = most recent entry stays applied).
    pub fn undo_to(&mut self, count: usize, target: &mut C::Target) {
        for _ in 0..count {
            if self.undo(target).is_none() {
                break;
            }
        }
    }

    fn announce(&self, was_clean: bool, delta: isize) {
        self.sink.notify(Notification::HistoryChanged { index: self.cursor, delta });
        let clean = self.is_clean();
        if clean != was_clean {
            self.sink.notify(Notification::CleanChanged { clean });
        }
    }

    // ---- clean index --------------------------------------------------------

    /// Mark the current position as the saved state.
    pub fn set_clean(&mut self) {
        let was_clean = self.is_clean();
        self.clean_index = Some(self.cursor);
        if !was_clean && self.is_clean() {
            self.sink.notify(Notification::CleanChanged { clean: true });
        }
    }

    pub fn is_clean(&self) -> bool {
        self.clean_index == Some(self.cursor) && self.open_groups.iter().all(|g| g.children.is_empty())
    }

    pub fn clean_index(&self) -> Option<usize> {
        self.clean_index
    }

    // ---- queries ------------------------------------------------------------

    pub fn can_undo(&self) -> bool {
        self.open_groups.is_empty() && self.cursor > 0
    }

    pub fn can_redo(&self) -> bool {
        self.open_groups.is_empty() && self.cursor < self.entries.len()
    }

    pub fn index(&self) -> usize {
        self.cursor
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn undo_count(&self) -> usize {
        self.cursor
    }

    pub fn redo_count(&self) -> usize {
        self.entries.len() - self.cursor
    }

    /// Descriptions of the undoable entries, most recent first.
    pub fn undo_descriptions(&self) -> Vec<String> {
        self.entries[..self.cursor].iter().rev().map(|e| e.description()).collect()
    }

    /// Bytes held by all entries, kept as a running total.
    pub fn memory_usage(&self) -> usize {
        self.total_memory
    }

    /// Nesting depth each top-level entry was recorded at.
    pub fn entry_depths(&self) -> Vec<usize> {
        self.entries
            .iter()
            .map(|e| match e {
                Entry::Command { depth, .. } | Entry::Group { depth, .. } => *depth,
            })
            .collect()
    }

    /// Number of direct children of the entry at `index`, if it is a group.
    pub fn group_len(&self, index: usize) -> Option<usize> {
        match self.entries.get(index)? {
            Entry::Group { children, .. } => Some(children.len()),
            Entry::Command { .. } => None,
        }
    }

    /// Prune old entries to stay within limits
    fn prune(&mut self) {
        let mut dropped = 0;
        // Prune by count
        while self.max_steps > 0 && self.cursor > self.max_steps {
            self.drop_oldest();
            dropped += 1;
        }
        // Prune by memory if limit is set
        if let Some(max_bytes) = self.max_memory_bytes {
            while self.total_memory > max_bytes && self.cursor > 1 {
                self.drop_oldest();
                dropped += 1;
            }
        }
        if dropped > 0 {
            crate::log_info!("History: pruned {} oldest entries", dropped);
        }
    }

    fn drop_oldest(&mut self) {
        let removed = self.entries.remove(0);
        self.total_memory = self.total_memory.saturating_sub(removed.memory_size());
        self.cursor -= 1;
        self.clean_index = match self.clean_index {
            Some(0) | None => None,
            Some(i) => Some(i - 1),
        };
    }

    /// Drop every entry.  The empty history counts as the saved state.
    pub fn clear(&mut self) {
        let was_clean = self.is_clean();
        let delta = -(self.cursor as isize);
        self.entries.clear();
        self.open_groups.clear();
        self.cursor = 0;
        self.clean_index = Some(0);
        self.total_memory = 0;
        self.announce(was_clean, delta);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::RecordingSink;

    /// Test command over a vector of integers.
    #[derive(Debug)]
    enum Op {
        Set { slot: usize, old: i32, new: i32 },
        Add { slot: usize, amount: i32 },
    }

    impl Command for Op {
        type Target = Vec<i32>;

        fn redo(&self, t: &mut Vec<i32>) {
            match *self {
                Op::Set { slot, new, .. } => t[slot] = new,
                Op::Add { slot, amount } => t[slot] += amount,
            }
        }

        fn undo(&self, t: &mut Vec<i32>) {
            match *self {
                Op::Set { slot, old, .. } => t[slot] = old,
                Op::Add { slot, amount } => t[slot] -= amount,
            }
        }

        fn description(&self) -> String {
            format!("{:?}", self)
        }

        fn memory_size(&self) -> usize {
            16
        }

        fn kind(&self) -> &'static str {
            match self {
                Op::Set { .. } => "set",
                Op::Add { .. } => "add",
            }
        }

        fn can_merge_with(&self, earlier: &Self) -> bool {
            matches!((self, earlier), (Op::Add { slot: a, .. }, Op::Add { slot: b, .. }) if a == b)
        }

        fn timed_mergeable(&self) -> bool {
            matches!(self, Op::Set { .. })
        }

        fn absorb(&mut self, later: Self) -> MergeResult<Self> {
            match (self, later) {
                (Op::Add { slot, amount }, Op::Add { slot: s, amount: a }) if *slot == s => {
                    *amount += a;
                    MergeResult::Merged
                }
                (Op::Set { slot, new, .. }, Op::Set { slot: s, new: n, .. }) if *slot == s => {
                    *new = n;
                    MergeResult::Merged
                }
                (_, later) => MergeResult::NotMergeable(later),
            }
        }
    }

    fn history() -> History<Op> {
        History::new(0, None, Duration::from_millis(1000))
    }

    #[test]
    fn semantic_merge_keeps_one_entry() {
        let mut h = history();
        let mut t = vec![0; 2];
        assert_eq!(h.push(Op::Add { slot: 0, amount: 2 }, &mut t), CommitOutcome::Appended);
        assert_eq!(h.push(Op::Add { slot: 0, amount: 3 }, &mut t), CommitOutcome::Merged);
        assert_eq!(h.push(Op::Add { slot: 1, amount: 1 }, &mut t), CommitOutcome::Appended);
        assert_eq!(h.len(), 2);
        h.undo(&mut t);
        h.undo(&mut t);
        assert_eq!(t, vec![0, 0]);
        h.redo(&mut t);
        assert_eq!(t, vec![5, 0]);
    }

    #[test]
    fn timed_merge_respects_boundary() {
        let mut h = history();
        let mut t = vec![0];
        let t0 = Instant::now();
        h.push_at(Op::Set { slot: 0, old: 0, new: 1 }, &mut t, t0);
        h.push_at(Op::Set { slot: 0, old: 1, new: 2 }, &mut t, t0 + Duration::from_millis(999));
        assert_eq!(h.len(), 1);
        // Chained: the merged entry carries the later stamp.
        h.push_at(Op::Set { slot: 0, old: 2, new: 3 }, &mut t, t0 + Duration::from_millis(1998));
        assert_eq!(h.len(), 1);
        h.push_at(Op::Set { slot: 0, old: 3, new: 4 }, &mut t, t0 + Duration::from_millis(2998));
        assert_eq!(h.len(), 2);
        h.undo(&mut t);
        assert_eq!(t, vec![3]);
        h.undo(&mut t);
        assert_eq!(t, vec![0]);
    }

    #[test]
    fn different_kinds_never_merge() {
        let mut h = history();
        let mut t = vec![0];
        let t0 = Instant::now();
        h.push_at(Op::Set { slot: 0, old: 0, new: 1 }, &mut t, t0);
        h.push_at(Op::Add { slot: 0, amount: 1 }, &mut t, t0);
        assert_eq!(h.len(), 2);
    }

    #[test]
    fn no_merge_into_clean_entry() {
        let mut h = history();
        let mut t = vec![0];
        h.push(Op::Add { slot: 0, amount: 1 }, &mut t);
        h.set_clean();
        assert_eq!(h.push(Op::Add { slot: 0, amount: 1 }, &mut t), CommitOutcome::Appended);
        h.undo(&mut t);
        assert!(h.is_clean());
        assert_eq!(t, vec![1]);
    }

    #[test]
    fn commit_after_undo_drops_redo_tail_and_clean_point() {
        let mut h = history();
        let mut t = vec![0, 0];
        h.push(Op::Add { slot: 0, amount: 1 }, &mut t);
        h.push(Op::Add { slot: 1, amount: 1 }, &mut t);
        h.set_clean();
        h.undo(&mut t);
        h.push(Op::Set { slot: 0, old: 1, new: 9 }, &mut t);
        assert_eq!(h.redo_count(), 0);
        assert_eq!(h.clean_index(), None);
        assert!(!h.is_clean());
    }

    #[test]
    fn groups_undo_as_one_and_block_undo_while_open() {
        let mut h = history();
        let mut t = vec![0, 0];
        h.begin_group("both");
        h.push(Op::Add { slot: 0, amount: 1 }, &mut t);
        assert!(h.undo(&mut t).is_none());
        h.push(Op::Add { slot: 1, amount: 1 }, &mut t);
        assert!(h.end_group());
        assert_eq!(h.len(), 1);
        assert_eq!(h.group_len(0), Some(2));
        assert_eq!(h.undo(&mut t).as_deref(), Some("both"));
        assert_eq!(t, vec![0, 0]);
        h.redo(&mut t);
        assert_eq!(t, vec![1, 1]);
    }

    #[test]
    fn empty_group_leaves_no_entry() {
        let mut h = history();
        h.begin_group("nothing");
        assert!(h.end_group());
        assert!(h.is_empty());
        assert!(!h.end_group());
    }

    #[test]
    fn pruning_shifts_clean_index() {
        let mut h: History<Op> = History::new(2, None, Duration::from_millis(0));
        let mut t = vec![0; 4];
        h.push(Op::Add { slot: 0, amount: 1 }, &mut t);
        h.push(Op::Add { slot: 1, amount: 1 }, &mut t);
        h.set_clean();
        h.push(Op::Add { slot: 2, amount: 1 }, &mut t);
        assert_eq!(h.len(), 2);
        assert_eq!(h.clean_index(), Some(1));
        h.push(Op::Add { slot: 3, amount: 1 }, &mut t);
        h.push(Op::Add { slot: 0, amount: 1 }, &mut t);
        assert_eq!(h.clean_index(), None);
    }

    #[test]
    fn memory_limit_prunes_oldest() {
        let mut h: History<Op> = History::new(0, Some(40), Duration::from_millis(0));
        let mut t = vec![0; 4];
        for slot in 0..4 {
            h.push(Op::Add { slot, amount: 1 }, &mut t);
        }
        assert_eq!(h.len(), 2);
        assert_eq!(h.memory_usage(), 32);
    }

    #[test]
    fn notifications_track_cursor_and_clean_state() {
        let sink = Arc::new(RecordingSink::new());
        let mut h = history();
        h.set_sink(sink.clone());
        let mut t = vec![0];
        h.push(Op::Add { slot: 0, amount: 1 }, &mut t);
        h.undo(&mut t);
        assert_eq!(
            sink.take(),
            vec![
                Notification::HistoryChanged { index: 1, delta: 1 },
                Notification::CleanChanged { clean: false },
                Notification::HistoryChanged { index: 0, delta: -1 },
                Notification::CleanChanged { clean: true },
            ]
        );
    }

    #[test]
    fn clear_returns_to_the_saved_state() {
        let sink = Arc::new(RecordingSink::new());
        let mut h = history();
        let mut t = vec![0, 0];
        h.push(Op::Add { slot: 0, amount: 1 }, &mut t);
        h.push(Op::Set { slot: 1, old: 0, new: 4 }, &mut t);
        assert_eq!(h.undo_descriptions().len(), 2);
        assert!(h.undo_descriptions()[0].starts_with("Set"));
        h.set_sink(sink.clone());
        h.clear();
        assert!(h.is_clean());
        assert_eq!(h.clean_index(), Some(0));
        assert_eq!(h.memory_usage(), 0);
        assert!(h.undo_descriptions().is_empty());
        assert_eq!(
            sink.take(),
            vec![
                Notification::HistoryChanged { index: 0, delta: -2 },
                Notification::CleanChanged { clean: true },
            ]
        );
        h.push(Op::Add { slot: 0, amount: 1 }, &mut t);
        h.undo(&mut t);
        assert!(h.is_clean());
    }
}
