//! Host bridge for the Rain playground.
//!
//! The playground does not compile anything itself. It loads the prebuilt
//! `rainc.wasm` compiler module and drives it across the linear-memory
//! boundary:
//!
//!   Loader        (fetch + instantiate, host imports)
//!     -> ModuleHandle
//!     -> CompileSession::compile
//!          encode source -> compile(start, end, optimize) -> free
//!          env.callback(tag, start, end)  (zero or more, synchronous)
//!            -> Dispatcher -> EventHandler
//!                 Error payloads -> DiagnosticParser -> Diagnostic
//!
//! Front ends (the CLI, an editor integration) consume the typed results:
//! IR and WAT text, the linked binary as an `Artifact`, and diagnostics as
//! editor markers.

// ---------------------------------------------------------------------
// Errors and configuration
// ---------------------------------------------------------------------

pub mod config;
pub mod error;

// ---------------------------------------------------------------------
// Boundary: linear memory and the host import surface
// ---------------------------------------------------------------------

pub mod imports;
pub mod memory;

// ---------------------------------------------------------------------
// Module lifecycle
// ---------------------------------------------------------------------

pub mod loader;

// ---------------------------------------------------------------------
// Events and diagnostics
// ---------------------------------------------------------------------

pub mod diagnostic;
pub mod dispatch;
pub mod event;

// ---------------------------------------------------------------------
// Compile orchestration and results
// ---------------------------------------------------------------------

pub mod artifact;
pub mod session;

// ---------------------------------------------------------------------
// Public API re-exports
// ---------------------------------------------------------------------

pub use artifact::Artifact;
pub use config::BridgeConfig;
pub use diagnostic::{Diagnostic, DiagnosticParser, EditorMarker, SourceSpan};
pub use dispatch::{Callback, Dispatcher, EventHandler, Unregistered};
pub use error::PlaygroundError;
pub use event::{Event, EventTag};
pub use loader::{Loader, ModuleHandle};
pub use memory::{GuardRegion, GuestBuffer, MemoryRegion};
pub use session::{CompileOutcome, CompileRequest, CompileSession, CompileStatus, SessionHandler};

/// `tracing` target for bridge events.
pub const LOG_TARGET: &str = "rainc";

/// `tracing` target for lines the module prints through `console.*`.
pub const CONSOLE_TARGET: &str = "rainc::console";
