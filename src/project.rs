use std::sync::Arc;

use image::Rgba;
use uuid::Uuid;

use crate::canvas::TiledImage;
use crate::components::commands::LayerCommand;
use crate::components::history::{CommitOutcome, History};
use crate::components::jobs::JobQueue;
use crate::components::layers::{LayerId, LayerTree, NodeKind};
use crate::components::selection::{Selection, UpdateOutlineJob};
use crate::error::EngineResult;
use crate::geometry::Rect;
use crate::notify::{Notification, NotificationSink};
use crate::settings::EngineSettings;

/// Colours used when an outline job renders the selection thumbnail.
const MASK_COLORS: [Rgba<u8>; 2] = [Rgba([255, 255, 255, 255]), Rgba([0, 0, 0, 255])];

/// Single open document: the layer tree plus everything that used to be a
/// process-wide manager (undo stack, update queue).  Created on open,
/// consumed on close.
pub struct Project {
    pub id: Uuid,
    /// Display name ("Untitled-1", a file name, ...).
    pub name: String,
    tree: LayerTree,
    history: History<LayerCommand>,
    jobs: JobQueue,
    selection: Arc<Selection>,
    settings: EngineSettings,
    sink: Arc<dyn NotificationSink>,
}

impl Project {
    pub fn open(
        name: impl Into<String>,
        width: u32,
        height: u32,
        settings: EngineSettings,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        let name = name.into();
        let mut history = History::from_settings(&settings);
        history.set_sink(sink.clone());
        let project = Self {
            id: Uuid::new_v4(),
            tree: LayerTree::new(width, height, settings.clone()),
            history,
            jobs: JobQueue::new(),
            selection: Arc::new(Selection::new(width, height)),
            settings,
            sink,
            name,
        };
        crate::log_info!("Project '{}' opened ({}x{}, id {})", project.name, width, height, project.id);
        project
    }

    /// Drop pending jobs and release the document.
    pub fn close(self) {
        let dropped = self.jobs.clear();
        crate::log_info!(
            "Project '{}' closed ({} pending job(s) dropped, {} history step(s))",
            self.name,
            dropped,
            self.history.len()
        );
    }

    pub fn tree(&self) -> &LayerTree {
        &self.tree
    }

    pub fn history(&self) -> &History<LayerCommand> {
        &self.history
    }

    pub fn jobs(&self) -> &JobQueue {
        &self.jobs
    }

    pub fn selection(&self) -> &Arc<Selection> {
        &self.selection
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn root(&self) -> LayerId {
        self.tree.root()
    }

    // ---- editing ------------------------------------------------------------

    /// Apply `cmd` and record it.  A refused edit leaves both the tree and
    /// the history untouched.
    pub fn execute(&mut self, cmd: LayerCommand) -> EngineResult<CommitOutcome> {
        cmd.try_redo(&mut self.tree)?;
        Ok(self.history.commit(cmd))
    }

    /// Create a node of `kind` on top of `parent`, recorded as an undoable add.
    pub fn add_layer(&mut self, name: impl Into<String>, kind: NodeKind, parent: LayerId) -> EngineResult<LayerId> {
        let layer = self.tree.create_node(name, kind)?;
        let index = self.tree.children(parent).len();
        self.execute(LayerCommand::Add { layer, parent, index })?;
        Ok(layer)
    }

    pub fn add_paint_layer(&mut self, name: impl Into<String>, parent: LayerId) -> EngineResult<LayerId> {
        let kind = NodeKind::paint(self.tree.width(), self.tree.height());
        self.add_layer(name, kind, parent)
    }

    pub fn remove_layer(&mut self, layer: LayerId) -> EngineResult<()> {
        let cmd = LayerCommand::remove(&self.tree, layer)?;
        self.execute(cmd).map(|_| ())
    }

    /// Record a pixel edit of `layer` limited to `rect`.
    pub fn paint(
        &mut self,
        layer: LayerId,
        rect: Rect,
        edit: impl FnOnce(&mut TiledImage),
    ) -> EngineResult<CommitOutcome> {
        let cmd = LayerCommand::paint_with(&self.tree, layer, rect, edit)?;
        self.execute(cmd)
    }

    pub fn undo(&mut self) -> Option<String> {
        self.history.undo(&mut self.tree)
    }

    pub fn redo(&mut self) -> Option<String> {
        self.history.redo(&mut self.tree)
    }

    pub fn begin_group(&mut self, description: impl Into<String>) {
        self.history.begin_group(description);
    }

    pub fn end_group(&mut self) -> bool {
        self.history.end_group()
    }

    /// The current history position becomes the saved state.
    pub fn mark_saved(&mut self) {
        self.history.set_clean();
    }

    pub fn is_clean(&self) -> bool {
        self.history.is_clean()
    }

    // ---- selection ----------------------------------------------------------

    pub fn select_rect(&mut self, rect: Rect) {
        self.selection.select_rect(rect);
        self.schedule_outline();
    }

    pub fn deselect_rect(&mut self, rect: Rect) {
        self.selection.deselect_rect(rect);
        self.schedule_outline();
    }

    pub fn clear_selection(&mut self) {
        self.selection.clear();
        self.schedule_outline();
    }

    fn schedule_outline(&self) {
        let job = UpdateOutlineJob::new(self.selection.clone(), self.settings.outline_thumbnail, MASK_COLORS)
            .with_thumbnail_max_edge(self.settings.thumbnail_max_edge);
        self.jobs.enqueue(Box::new(job));
    }

    // ---- scheduling ---------------------------------------------------------

    /// Bring the root projection up to date, then run pending jobs.  Jobs
    /// always see clean projections.  Returns the region recomputed.
    pub fn refresh(&mut self) -> Rect {
        let root = self.tree.root();
        let stale = self.tree.node(root).map(|n| n.stale().bounds()).unwrap_or(Rect::EMPTY);
        let updated = if stale.is_empty() {
            Rect::EMPTY
        } else {
            self.tree.recalculate(root, stale, None)
        };
        if !updated.is_empty() {
            self.sink.notify(Notification::ProjectionChanged { node: root, rect: updated });
        }
        self.jobs.drain(self.sink.as_ref());
        updated
    }

    /// The composited document, if anything has been rendered yet.
    pub fn composite(&self) -> Option<&TiledImage> {
        self.tree.projection(self.tree.root())
    }
}
