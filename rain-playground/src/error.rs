use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlaygroundError {
    #[error("failed to read compiler module {path}: {source}")]
    Fetch {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to instantiate compiler module: {0}")]
    Instantiation(#[source] wasmi::Error),
    #[error("failed to define host import {module}.{name}: {message}")]
    Link {
        module: &'static str,
        name: &'static str,
        message: String,
    },
    #[error("compiler module does not export `{name}` with the expected signature")]
    MissingExport { name: String },
    #[error("memory range {start}..{end} is outside linear memory of {size} bytes")]
    OutOfBounds { start: u64, end: u64, size: usize },
    #[error("compiler module could not allocate {size} bytes")]
    AllocationFailed { size: u64 },
    #[error("`{export}` trapped: {source}")]
    Trap {
        export: &'static str,
        source: wasmi::Error,
    },
}

impl PlaygroundError {
    /// Whether the error happened while bringing the module up, as opposed
    /// to during a call into an already loaded module.
    pub fn is_load_failure(&self) -> bool {
        matches!(
            self,
            PlaygroundError::Fetch { .. }
                | PlaygroundError::Instantiation(_)
                | PlaygroundError::Link { .. }
                | PlaygroundError::MissingExport { .. }
        )
    }
}
