//! Strata: incremental layer compositing, coalescing background jobs and a
//! mergeable undo history for raster documents.
//!
//! A [`Project`] owns one document.  Edits are [`LayerCommand`]s recorded in
//! its [`History`]; they mark layers dirty, [`Project::refresh`] recomputes
//! the stale projections bottom-up and then drains the [`JobQueue`].
#![allow(clippy::too_many_arguments)]
#![allow(clippy::type_complexity)]

pub mod logger;

pub mod canvas;
pub mod components;
pub mod error;
pub mod geometry;
pub mod notify;
pub mod ops;
pub mod pool;
pub mod project;
pub mod settings;

pub use canvas::{ThresholdMode, TiledImage};
pub use components::commands::{LayerCommand, PixelPatch};
pub use components::history::{Command, CommitOutcome, History, MergeResult};
pub use components::jobs::{ArtifactId, BackgroundJob, EnqueueOutcome, JobQueue};
pub use components::layers::{ChannelFlags, LayerId, LayerNode, LayerTree, NodeKind};
pub use components::projection::ProjectionPlane;
pub use components::selection::{Outline, Selection, UpdateOutlineJob};
pub use error::{EngineError, EngineResult};
pub use geometry::Rect;
pub use notify::{Notification, NotificationSink, NullSink, RecordingSink};
pub use ops::composite::CompositeOp;
pub use project::Project;
pub use settings::{EngineSettings, Spread};
