//! Routing `env.callback` invocations.
//!
//! The module calls `env.callback(tag, start, end)` synchronously from inside
//! `compile`, so whatever runs here runs on the module's call stack. The
//! import resolves `[start, end)` to a borrowed slice and hands it to the
//! store's `Callback`; a `Dispatcher` copies it into an `Event` and calls the
//! matching `EventHandler` method before returning control to the module.
//!
//! Handlers only ever see owned payloads and never a `ModuleHandle`, so they
//! cannot call `compile`, `malloc` or `free` while the module is mid-call.

use tracing::{debug, info, warn};

use crate::diagnostic::{Diagnostic, DiagnosticParser};
use crate::event::Event;
use crate::{CONSOLE_TARGET, LOG_TARGET};

/// Receives the four kinds of compiler results. Every method defaults to a
/// no-op so implementors only override what they care about.
pub trait EventHandler {
    /// LLVM IR was produced.
    fn on_compile(&mut self, _ir: &str) {}

    /// The linked binary. The slice is a host copy; retain it with `to_vec`.
    fn on_link(&mut self, _binary: &[u8]) {}

    /// WAT disassembly of the linked binary.
    fn on_decompile(&mut self, _disassembly: &str) {}

    /// The compiler rejected the source.
    fn on_error(&mut self, _diagnostic: &Diagnostic) {}

    /// An event with a tag this host does not know. Only for bookkeeping;
    /// the payload itself is not passed on.
    fn on_unknown(&mut self, _tag: i32, _len: usize) {}
}

impl EventHandler for () {}

/// What the `env.callback` import forwards to.
pub trait Callback: 'static {
    fn on_callback(&mut self, tag: i32, payload: &[u8]);
}

/// No dispatcher registered: payloads are treated as log lines.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unregistered;

impl Callback for Unregistered {
    fn on_callback(&mut self, tag: i32, payload: &[u8]) {
        info!(target: CONSOLE_TARGET, tag, "{}", String::from_utf8_lossy(payload));
    }
}

pub struct Dispatcher<H> {
    handler: H,
    parser: DiagnosticParser,
}

impl<H: EventHandler> Dispatcher<H> {
    pub fn new(handler: H, parser: DiagnosticParser) -> Self {
        Self { handler, parser }
    }

    /// Decode one callback and route it. Unknown tags are logged and
    /// dropped. Returns the decoded event.
    pub fn dispatch(&mut self, tag: i32, payload: &[u8]) -> Event {
        let event = Event::decode(tag, payload);
        match &event {
            Event::Compile(ir) => {
                debug!(target: LOG_TARGET, bytes = ir.len(), "compiled LLVM IR:\n{ir}");
                self.handler.on_compile(ir);
            }
            Event::Link(binary) => {
                info!(target: LOG_TARGET, bytes = binary.len(), "linked WebAssembly binary");
                self.handler.on_link(binary);
            }
            Event::Decompile(disassembly) => {
                debug!(target: LOG_TARGET, bytes = disassembly.len(), "compiled WAT:\n{disassembly}");
                self.handler.on_decompile(disassembly);
                info!(target: LOG_TARGET, "compilation succeeded");
            }
            Event::Error(text) => {
                let diagnostic = self.parser.parse(text);
                warn!(target: LOG_TARGET, located = diagnostic.is_located(), "compiler error: {diagnostic}");
                self.handler.on_error(&diagnostic);
            }
            Event::Unknown { tag, len } => {
                warn!(target: LOG_TARGET, tag, len, "ignoring compiler event with unknown tag");
                self.handler.on_unknown(*tag, *len);
            }
        }
        event
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    pub fn parser(&self) -> &DiagnosticParser {
        &self.parser
    }

    pub fn into_handler(self) -> H {
        self.handler
    }
}

impl<H: EventHandler + 'static> Callback for Dispatcher<H> {
    fn on_callback(&mut self, tag: i32, payload: &[u8]) {
        self.dispatch(tag, payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recording {
        calls: Vec<String>,
        binary: Option<Vec<u8>>,
        diagnostic: Option<Diagnostic>,
    }

    impl EventHandler for Recording {
        fn on_compile(&mut self, ir: &str) {
            self.calls.push(format!("compile:{ir}"));
        }

        fn on_link(&mut self, binary: &[u8]) {
            self.calls.push("link".to_string());
            self.binary = Some(binary.to_vec());
        }

        fn on_decompile(&mut self, disassembly: &str) {
            self.calls.push(format!("decompile:{disassembly}"));
        }

        fn on_error(&mut self, diagnostic: &Diagnostic) {
            self.calls.push("error".to_string());
            self.diagnostic = Some(diagnostic.clone());
        }
    }

    fn dispatcher() -> Dispatcher<Recording> {
        Dispatcher::new(Recording::default(), DiagnosticParser::default())
    }

    #[test]
    fn routes_each_tag_to_its_handler_in_order() {
        let mut dispatcher = dispatcher();
        dispatcher.dispatch(1, b"ir");
        dispatcher.dispatch(3, b"wat");
        dispatcher.dispatch(2, b"\0asm");
        assert_eq!(
            dispatcher.handler().calls,
            vec!["compile:ir", "decompile:wat", "link"]
        );
    }

    #[test]
    fn link_bytes_survive_source_mutation() {
        let mut dispatcher = dispatcher();
        let mut memory = b"\0asm\x01\0\0\0".to_vec();
        dispatcher.dispatch(2, &memory);
        memory.fill(0);
        assert_eq!(
            dispatcher.handler().binary.as_deref(),
            Some(&b"\0asm\x01\0\0\0"[..])
        );
    }

    #[test]
    fn error_goes_through_the_parser() {
        let mut dispatcher = dispatcher();
        let event = dispatcher.dispatch(-1, b"<unknown>:2:3: error: nope\nabcdef\n  ^~\n");
        assert!(matches!(event, Event::Error(_)));
        let diagnostic = dispatcher.into_handler().diagnostic.expect("diagnostic");
        assert_eq!(diagnostic.message, "nope");
        let span = diagnostic.span.expect("located");
        assert_eq!((span.line, span.column, span.end_column), (2, 3, 5));
    }

    #[test]
    fn unknown_tags_reach_no_handler() {
        let mut dispatcher = dispatcher();
        for tag in [0, 4, 99, -7] {
            let event = dispatcher.dispatch(tag, b"future payload");
            assert_eq!(event, Event::Unknown { tag, len: 14 });
        }
        assert!(dispatcher.handler().calls.is_empty());
    }

    #[test]
    fn unit_handler_ignores_everything() {
        let mut dispatcher = Dispatcher::new((), DiagnosticParser::default());
        dispatcher.dispatch(1, b"ir");
        dispatcher.dispatch(-1, b"boom");
    }
}
