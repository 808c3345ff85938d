use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::ops::composite::CompositeOp;

/// How far a change can leak out of the painted area when a layer using a
/// given composite operator is merged into its parent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Spread {
    /// Grow the dirty rect by this many pixels on every side.
    Pixels(u32),
    /// The operator touches every pixel of the parent (e.g. `destination-in`
    /// erases whatever lies outside the layer).
    FullExtent,
}

/// Engine settings, one instance per open document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Two same-kind commands closer than this merge into one history entry.
    pub merge_timeout_ms: u64,
    /// Maximum number of undo steps (0 = unlimited)
    pub max_undo_steps: usize,
    /// Optional history memory cap in bytes.
    pub max_history_memory_bytes: Option<usize>,
    /// Buffers kept warm by the thresholding scratch pool.
    pub scratch_pool_capacity: usize,
    /// Whether selection outline jobs also rebuild the thumbnail.
    pub outline_thumbnail: bool,
    /// Longest edge of selection thumbnails.
    pub thumbnail_max_edge: u32,
    /// Per-operator dirty-region growth, keyed by operator id.
    pub operator_spread: BTreeMap<String, Spread>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        let mut operator_spread = BTreeMap::new();
        for op in CompositeOp::full_coverage() {
            operator_spread.insert(op.id().to_string(), Spread::FullExtent);
        }
        Self {
            merge_timeout_ms: 1000,
            max_undo_steps: 50,
            max_history_memory_bytes: Some(100 * 1024 * 1024), // 100 MB default limit
            scratch_pool_capacity: 4,
            outline_thumbnail: true,
            thumbnail_max_edge: 256,
            operator_spread,
        }
    }
}

impl EngineSettings {
    pub fn merge_timeout(&self) -> Duration {
        Duration::from_millis(self.merge_timeout_ms)
    }

    /// Growth rule for `op`; operators without an entry do not spread.
    pub fn spread_for(&self, op: CompositeOp) -> Spread {
        self.operator_spread
            .get(op.id())
            .copied()
            .unwrap_or(Spread::Pixels(0))
    }

    /// Serialize as `key=value` lines.
    pub fn to_config_string(&self) -> String {
        let mut out = format!(
            "merge_timeout_ms={}\n\
             max_undo_steps={}\n\
             max_history_memory_bytes={}\n\
             scratch_pool_capacity={}\n\
             outline_thumbnail={}\n\
             thumbnail_max_edge={}\n",
            self.merge_timeout_ms,
            self.max_undo_steps,
            self.max_history_memory_bytes
                .map_or_else(|| "none".to_string(), |b| b.to_string()),
            self.scratch_pool_capacity,
            self.outline_thumbnail,
            self.thumbnail_max_edge,
        );
        for (op, spread) in &self.operator_spread {
            let value = match spread {
                Spread::FullExtent => "full".to_string(),
                Spread::Pixels(n) => n.to_string(),
            };
            out.push_str(&format!("spread.{}={}\n", op, value));
        }
        out
    }

    /// Parse `key=value` lines on top of the defaults.  Unknown keys and
    /// comment lines are ignored; malformed values are errors.
    pub fn from_config_str(content: &str) -> EngineResult<Self> {
        let mut settings = Self::default();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else { continue };
            let (key, value) = (key.trim(), value.trim());
            let bad = || EngineError::InvalidSetting {
                key: key.to_string(),
                value: value.to_string(),
            };
            match key {
                "merge_timeout_ms" => settings.merge_timeout_ms = value.parse().map_err(|_| bad())?,
                "max_undo_steps" => settings.max_undo_steps = value.parse().map_err(|_| bad())?,
                "max_history_memory_bytes" => {
                    settings.max_history_memory_bytes = if value == "none" {
                        None
                    } else {
                        Some(value.parse().map_err(|_| bad())?)
                    };
                }
                "scratch_pool_capacity" => {
                    settings.scratch_pool_capacity = value.parse().map_err(|_| bad())?
                }
                "outline_thumbnail" => settings.outline_thumbnail = value.parse().map_err(|_| bad())?,
                "thumbnail_max_edge" => settings.thumbnail_max_edge = value.parse().map_err(|_| bad())?,
                _ => {
                    if let Some(op) = key.strip_prefix("spread.") {
                        if CompositeOp::from_id(op).is_none() {
                            return Err(bad());
                        }
                        let spread = if value == "full" {
                            Spread::FullExtent
                        } else {
                            Spread::Pixels(value.parse().map_err(|_| bad())?)
                        };
                        settings.operator_spread.insert(op.to_string(), spread);
                    }
                }
            }
        }
        Ok(settings)
    }

    pub fn load_from(path: &Path) -> EngineResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_config_str(&content)
    }

    pub fn save_to(&self, path: &Path) -> EngineResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_config_string())?;
        Ok(())
    }
}
