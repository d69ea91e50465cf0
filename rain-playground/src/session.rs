//! One compile per request against a long-lived module handle.

use std::path::Path;

use tracing::{debug, info};

use crate::LOG_TARGET;
use crate::artifact::Artifact;
use crate::config::BridgeConfig;
use crate::diagnostic::Diagnostic;
use crate::dispatch::{Dispatcher, EventHandler};
use crate::error::PlaygroundError;
use crate::loader::{Loader, ModuleHandle};
use crate::memory::GuardRegion;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileRequest {
    pub source: String,
    pub optimize: bool,
}

impl CompileRequest {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            optimize: false,
        }
    }

    pub fn optimized(mut self, optimize: bool) -> Self {
        self.optimize = optimize;
        self
    }
}

/// Results of the most recent compile.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompileOutcome {
    ir: Option<String>,
    disassembly: Option<String>,
    binary: Option<Vec<u8>>,
    diagnostic: Option<Diagnostic>,
    ignored: usize,
}

impl CompileOutcome {
    pub fn ir(&self) -> Option<&str> {
        self.ir.as_deref()
    }

    pub fn disassembly(&self) -> Option<&str> {
        self.disassembly.as_deref()
    }

    pub fn binary(&self) -> Option<&[u8]> {
        self.binary.as_deref()
    }

    pub fn diagnostic(&self) -> Option<&Diagnostic> {
        self.diagnostic.as_ref()
    }

    /// Events with unknown tags seen during the compile.
    pub fn ignored_events(&self) -> usize {
        self.ignored
    }

    pub fn status(&self) -> CompileStatus {
        if self.diagnostic.is_some() {
            CompileStatus::Failed
        } else if self.ir.is_some() || self.disassembly.is_some() || self.binary.is_some() {
            CompileStatus::Succeeded
        } else {
            CompileStatus::Idle
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

impl EventHandler for CompileOutcome {
    fn on_compile(&mut self, ir: &str) {
        self.ir = Some(ir.to_string());
    }

    fn on_link(&mut self, binary: &[u8]) {
        self.binary = Some(binary.to_vec());
    }

    fn on_decompile(&mut self, disassembly: &str) {
        self.disassembly = Some(disassembly.to_string());
    }

    fn on_error(&mut self, diagnostic: &Diagnostic) {
        self.diagnostic = Some(diagnostic.clone());
    }

    fn on_unknown(&mut self, _tag: i32, _len: usize) {
        self.ignored += 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileStatus {
    /// Nothing reported yet.
    Idle,
    Succeeded,
    Failed,
}

/// Records every event into a `CompileOutcome`, then forwards it to the
/// caller's observer.
#[derive(Debug, Default)]
pub struct SessionHandler<H> {
    outcome: CompileOutcome,
    observer: H,
}

impl<H> SessionHandler<H> {
    pub fn new(observer: H) -> Self {
        Self {
            outcome: CompileOutcome::default(),
            observer,
        }
    }

    pub fn outcome(&self) -> &CompileOutcome {
        &self.outcome
    }

    pub fn observer(&self) -> &H {
        &self.observer
    }
}

impl<H: EventHandler> EventHandler for SessionHandler<H> {
    fn on_compile(&mut self, ir: &str) {
        self.outcome.on_compile(ir);
        self.observer.on_compile(ir);
    }

    fn on_link(&mut self, binary: &[u8]) {
        self.outcome.on_link(binary);
        self.observer.on_link(binary);
    }

    fn on_decompile(&mut self, disassembly: &str) {
        self.outcome.on_decompile(disassembly);
        self.observer.on_decompile(disassembly);
    }

    fn on_error(&mut self, diagnostic: &Diagnostic) {
        self.outcome.on_error(diagnostic);
        self.observer.on_error(diagnostic);
    }

    fn on_unknown(&mut self, tag: i32, len: usize) {
        self.outcome.on_unknown(tag, len);
        self.observer.on_unknown(tag, len);
    }
}

type SessionModule<H> = ModuleHandle<Dispatcher<SessionHandler<H>>>;

/// Owns the module handle and the latest results.
///
/// There is no way to cancel a compile: `compile` returns only once the
/// module does, so a module stuck in a loop blocks the caller.
pub struct CompileSession<H = ()> {
    handle: SessionModule<H>,
    guard: GuardRegion,
}

impl<H: EventHandler + 'static> CompileSession<H> {
    /// Load the compiler from `path` and run its `init`.
    pub async fn load(
        path: impl AsRef<Path>,
        config: BridgeConfig,
        observer: H,
    ) -> Result<Self, PlaygroundError> {
        let guard = config.guard;
        let handle = Loader::new(config)
            .with_dispatcher(SessionHandler::new(observer))
            .load(path)
            .await?;
        Self::start(handle, guard)
    }

    /// Same as `load`, for a module already in memory.
    pub fn from_bytes(
        wasm: &[u8],
        config: BridgeConfig,
        observer: H,
    ) -> Result<Self, PlaygroundError> {
        let guard = config.guard;
        let handle = Loader::new(config)
            .with_dispatcher(SessionHandler::new(observer))
            .load_bytes(wasm)?;
        Self::start(handle, guard)
    }

    fn start(mut handle: SessionModule<H>, guard: GuardRegion) -> Result<Self, PlaygroundError> {
        handle.initialize()?;
        debug!(target: LOG_TARGET, guard = guard.bytes(), "compiler initialized");
        Ok(Self { handle, guard })
    }

    /// Compile `request`.
    ///
    /// Whatever the previous request produced is dropped first, so a binary
    /// from an earlier success is never offered after a later failure. The
    /// returned outcome is exactly what the module reported during this
    /// call. A trap inside the module is returned as an error after the
    /// source buffer has been released.
    pub fn compile(&mut self, request: &CompileRequest) -> Result<&CompileOutcome, PlaygroundError> {
        self.handler_mut().outcome.reset();

        info!(
            target: LOG_TARGET,
            bytes = request.source.len(),
            optimize = request.optimize,
            "compiling source"
        );
        debug!(target: LOG_TARGET, "{}", request.source);

        let optimize = request.optimize;
        self.handle
            .with_encoded(&request.source, self.guard, |handle, buffer| {
                handle.invoke_compile(buffer, optimize)
            })?;

        Ok(self.outcome())
    }

    pub fn outcome(&self) -> &CompileOutcome {
        self.handle.callback().handler().outcome()
    }

    pub fn status(&self) -> CompileStatus {
        self.outcome().status()
    }

    /// The linked binary of the latest compile, if it linked.
    pub fn artifact(&self) -> Option<Artifact<'_>> {
        self.outcome().binary().map(Artifact::new)
    }

    pub fn observer(&self) -> &H {
        self.handle.callback().handler().observer()
    }

    pub fn observer_mut(&mut self) -> &mut H {
        &mut self.handler_mut().observer
    }

    pub fn guard(&self) -> GuardRegion {
        self.guard
    }

    pub fn handle(&self) -> &SessionModule<H> {
        &self.handle
    }

    fn handler_mut(&mut self) -> &mut SessionHandler<H> {
        self.handle.callback_mut().handler_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostic::DiagnosticParser;

    #[test]
    fn outcome_status_tracks_results() {
        let mut outcome = CompileOutcome::default();
        assert_eq!(outcome.status(), CompileStatus::Idle);

        outcome.on_compile("ir");
        assert_eq!(outcome.status(), CompileStatus::Succeeded);

        outcome.on_error(&DiagnosticParser::default().parse("boom"));
        assert_eq!(outcome.status(), CompileStatus::Failed);

        outcome.reset();
        assert_eq!(outcome, CompileOutcome::default());
    }

    #[test]
    fn session_handler_records_and_forwards() {
        #[derive(Default)]
        struct Count(usize);
        impl EventHandler for Count {
            fn on_link(&mut self, _binary: &[u8]) {
                self.0 += 1;
            }
        }

        let mut handler = SessionHandler::new(Count::default());
        handler.on_link(b"\0asm");
        assert_eq!(handler.outcome().binary(), Some(&b"\0asm"[..]));
        assert_eq!(handler.observer().0, 1);
    }

    #[test]
    fn request_builder() {
        let request = CompileRequest::new("fn main() {}").optimized(true);
        assert_eq!(request.source, "fn main() {}");
        assert!(request.optimize);
    }
}
