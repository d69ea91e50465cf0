//! Events the compiler reports through `env.callback`.

use std::fmt;

/// Wire value of the first `env.callback` argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum EventTag {
    /// The compiler rejected the source. Payload: error text.
    Error = -1,
    /// Reserved, and what every unrecognized tag maps to.
    Unknown = 0,
    /// LLVM IR was produced. Payload: IR text.
    Compile = 1,
    /// The module was linked. Payload: wasm binary.
    Link = 2,
    /// The binary was disassembled. Payload: WAT text.
    Decompile = 3,
}

impl EventTag {
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            -1 => EventTag::Error,
            1 => EventTag::Compile,
            2 => EventTag::Link,
            3 => EventTag::Decompile,
            _ => EventTag::Unknown,
        }
    }

    pub fn raw(self) -> i32 {
        self as i32
    }
}

impl fmt::Display for EventTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventTag::Error => "error",
            EventTag::Unknown => "unknown",
            EventTag::Compile => "compile",
            EventTag::Link => "link",
            EventTag::Decompile => "decompile",
        };
        f.write_str(name)
    }
}

/// One decoded callback. Every variant owns its payload; nothing here points
/// back into module memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Compile(String),
    Link(Vec<u8>),
    Decompile(String),
    Error(String),
    Unknown { tag: i32, len: usize },
}

impl Event {
    /// Decode a raw callback payload, copying it out of `payload`.
    pub fn decode(tag: i32, payload: &[u8]) -> Self {
        match EventTag::from_raw(tag) {
            EventTag::Compile => Event::Compile(text(payload)),
            EventTag::Link => Event::Link(payload.to_vec()),
            EventTag::Decompile => Event::Decompile(text(payload)),
            EventTag::Error => Event::Error(text(payload)),
            EventTag::Unknown => Event::Unknown {
                tag,
                len: payload.len(),
            },
        }
    }

    pub fn tag(&self) -> EventTag {
        match self {
            Event::Compile(_) => EventTag::Compile,
            Event::Link(_) => EventTag::Link,
            Event::Decompile(_) => EventTag::Decompile,
            Event::Error(_) => EventTag::Error,
            Event::Unknown { .. } => EventTag::Unknown,
        }
    }
}

fn text(payload: &[u8]) -> String {
    String::from_utf8_lossy(payload).into_owned()
}
