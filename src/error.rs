// error.rs — Crate-wide error taxonomy.
//
// Four kinds of failure exist in a depth-map pass:
//
//   ┌──────────────────┬──────────────────────────────────────────────┐
//   │ Configuration    │ bad parameters, missing/invalid tile metadata │
//   │ Resource         │ device allocation, async kernel failure       │
//   │ Data             │ unreadable or corrupt map file                │
//   │ Io               │ filesystem errors                             │
//   └──────────────────┴──────────────────────────────────────────────┘
//
// An empty result (no valid depth) is NOT an error: engines return an
// all-sentinel map and the merge returns an all-zero map.

use std::path::PathBuf;

use thiserror::Error;

use crate::gpu::device::GpuError;

#[derive(Debug, Error)]
pub enum DepthMapError {
    /// Invalid parameters or missing/invalid metadata.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Device allocation failure or asynchronous kernel error.
    #[error("resource error: {0}")]
    Resource(#[from] GpuError),

    /// A map file exists but cannot be decoded.
    #[error("data error in {}: {reason}", path.display())]
    Data { path: PathBuf, reason: String },

    #[error("i/o error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl DepthMapError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        DepthMapError::Configuration(msg.into())
    }

    pub(crate) fn data(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        DepthMapError::Data {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        DepthMapError::Io {
            path: path.into(),
            source,
        }
    }

    /// True for the configuration class (used by the merge to decide how
    /// loudly a skipped tile is reported).
    pub fn is_configuration(&self) -> bool {
        matches!(self, DepthMapError::Configuration(_))
    }
}

pub type Result<T, E = DepthMapError> = std::result::Result<T, E>;
