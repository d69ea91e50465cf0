//! Bridge configuration.

use crate::memory::GuardRegion;

/// Name under which the compiler exports its linear memory.
pub const DEFAULT_MEMORY_EXPORT: &str = "memory";

/// File name the compiler reports for sources it was handed without one.
/// Only errors carrying this marker point into the editor buffer.
pub const DEFAULT_LOCATABLE_MARKER: &str = "<unknown>";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Export name of the module's linear memory.
    pub memory_export: String,

    /// Leading marker of diagnostics that can be mapped onto the source.
    pub locatable_marker: String,

    /// Zeroed bytes appended after the encoded source on every compile.
    pub guard: GuardRegion,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            memory_export: DEFAULT_MEMORY_EXPORT.to_string(),
            locatable_marker: DEFAULT_LOCATABLE_MARKER.to_string(),
            guard: GuardRegion::DEFAULT,
        }
    }
}

impl BridgeConfig {
    pub fn with_memory_export(mut self, name: impl Into<String>) -> Self {
        self.memory_export = name.into();
        self
    }

    pub fn with_locatable_marker(mut self, marker: impl Into<String>) -> Self {
        self.locatable_marker = marker.into();
        self
    }

    pub fn with_guard(mut self, guard: GuardRegion) -> Self {
        self.guard = guard;
        self
    }
}
