use crate::components::layers::LayerId;

/// Error type for fallible engine operations (configuration and tree
/// restructuring).  Empty or absent data is never an error; see the
/// individual operations for their "nothing happened" return values.
#[derive(Debug)]
pub enum EngineError {
    Io(std::io::Error),
    InvalidSetting { key: String, value: String },
    UnknownLayer(LayerId),
    InvalidTopology(String),
    UnsupportedEdit { layer: LayerId, edit: &'static str },
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Io(e) => write!(f, "I/O error: {}", e),
            EngineError::InvalidSetting { key, value } => {
                write!(f, "Invalid value {:?} for setting '{}'", value, key)
            }
            EngineError::UnknownLayer(id) => write!(f, "Unknown layer {}", id),
            EngineError::InvalidTopology(e) => write!(f, "Invalid layer topology: {}", e),
            EngineError::UnsupportedEdit { layer, edit } => {
                write!(f, "Layer {} does not support '{}'", layer, edit)
            }
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::Io(e)
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
