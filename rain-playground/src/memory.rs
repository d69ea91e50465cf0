//! Moving text and bytes across the linear-memory boundary.
//!
//! Pointers handed to the host by the module are only valid for the call
//! that produced them, so everything here either copies out of memory into
//! an owned value or writes into a block the host allocated itself. Raw
//! pointers stay inside this module and the loader: callers see
//! `MemoryRegion` (validated, transient) and `GuestBuffer` (an allocation
//! that must be handed back exactly once).

use crate::dispatch::Callback;
use crate::error::PlaygroundError;
use crate::loader::ModuleHandle;

/// A `[start, end)` byte range inside linear memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    start: u32,
    end: u32,
}

impl MemoryRegion {
    /// Build a region from the two pointers a wasm32 module passes.
    ///
    /// Pointers arrive as `i32` but are unsigned offsets, so they are
    /// reinterpreted rather than rejected when the high bit is set.
    pub fn new(start: i32, end: i32) -> Result<Self, PlaygroundError> {
        let (start, end) = (start as u32, end as u32);
        if start > end {
            return Err(PlaygroundError::OutOfBounds {
                start: u64::from(start),
                end: u64::from(end),
                size: 0,
            });
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> u32 {
        self.start
    }

    pub fn end(&self) -> u32 {
        self.end
    }

    pub fn len(&self) -> usize {
        (self.end - self.start) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Borrow the bytes of this region out of `memory`.
    pub fn resolve<'m>(&self, memory: &'m [u8]) -> Result<&'m [u8], PlaygroundError> {
        memory
            .get(self.start as usize..self.end as usize)
            .ok_or_else(|| self.out_of_bounds(memory.len()))
    }

    pub fn resolve_mut<'m>(&self, memory: &'m mut [u8]) -> Result<&'m mut [u8], PlaygroundError> {
        let size = memory.len();
        memory
            .get_mut(self.start as usize..self.end as usize)
            .ok_or_else(|| self.out_of_bounds(size))
    }

    fn out_of_bounds(&self, size: usize) -> PlaygroundError {
        PlaygroundError::OutOfBounds {
            start: u64::from(self.start),
            end: u64::from(self.end),
            size,
        }
    }
}

/// Copy `region` out of `memory` and decode it as UTF-8.
///
/// Invalid sequences are replaced with U+FFFD, the same way the browser's
/// `TextDecoder` treats them.
pub fn decode(memory: &[u8], region: MemoryRegion) -> Result<String, PlaygroundError> {
    let bytes = region.resolve(memory)?;
    Ok(String::from_utf8_lossy(bytes).into_owned())
}

/// Copy `region` out of `memory` as raw bytes.
pub fn copy_out(memory: &[u8], region: MemoryRegion) -> Result<Vec<u8>, PlaygroundError> {
    Ok(region.resolve(memory)?.to_vec())
}

/// Zeroed bytes appended after an encoded string.
///
/// The compiler takes `[start, end)` and should never read `*end`, but the
/// playground has always padded the source so an off-by-one read inside the
/// compiler sees zeros instead of whatever the allocator left behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct GuardRegion(u32);

impl GuardRegion {
    pub const NONE: GuardRegion = GuardRegion(0);

    /// Padding the web playground uses.
    pub const DEFAULT: GuardRegion = GuardRegion(16);

    pub const fn new(bytes: u32) -> Self {
        Self(bytes)
    }

    pub const fn bytes(self) -> u32 {
        self.0
    }
}

/// A block allocated inside the module holding an encoded string.
///
/// Not `Clone`: `ModuleHandle::release` takes it by value, so each buffer is
/// freed at most once.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a guest buffer must be released back to the module"]
pub struct GuestBuffer {
    ptr: u32,
    len: u32,
    guard: u32,
}

impl GuestBuffer {
    /// Length of the encoded text, without the guard region.
    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn guard(&self) -> GuardRegion {
        GuardRegion(self.guard)
    }

    /// The encoded text.
    pub fn region(&self) -> MemoryRegion {
        MemoryRegion {
            start: self.ptr,
            end: self.ptr + self.len,
        }
    }

    /// The zero padding after the text.
    pub fn guard_region(&self) -> MemoryRegion {
        MemoryRegion {
            start: self.ptr + self.len,
            end: self.ptr + self.len + self.guard,
        }
    }

    /// `(start, end)` as the module's `compile` expects them.
    pub(crate) fn bounds(&self) -> (i32, i32) {
        (self.ptr as i32, (self.ptr + self.len) as i32)
    }

    pub(crate) fn ptr(&self) -> u32 {
        self.ptr
    }
}

impl<C: Callback> ModuleHandle<C> {
    /// Allocate a block for `text` plus `guard`, copy the UTF-8 bytes in and
    /// zero the guard.
    pub fn encode(&mut self, text: &str, guard: GuardRegion) -> Result<GuestBuffer, PlaygroundError> {
        let bytes = text.as_bytes();
        let total = bytes.len() as u64 + u64::from(guard.bytes());
        let (len, size) = match (u32::try_from(bytes.len()), u32::try_from(total)) {
            (Ok(len), Ok(size)) => (len, size),
            _ => return Err(PlaygroundError::AllocationFailed { size: total }),
        };

        let ptr = self.allocate(size)?;
        let buffer = GuestBuffer {
            ptr,
            len,
            guard: guard.bytes(),
        };

        let written = {
            let memory = self.memory_mut();
            MemoryRegion {
                start: ptr,
                end: ptr.saturating_add(size),
            }
            .resolve_mut(memory)
            .map(|block| {
                let (text_part, guard_part) = block.split_at_mut(bytes.len());
                text_part.copy_from_slice(bytes);
                guard_part.fill(0);
            })
        };
        if let Err(err) = written {
            self.release(buffer)?;
            return Err(err);
        }
        Ok(buffer)
    }

    /// Read the text of `buffer` back out of module memory.
    pub fn decode(&self, buffer: &GuestBuffer) -> Result<String, PlaygroundError> {
        decode(self.memory(), buffer.region())
    }

    /// Copy an arbitrary region out of module memory.
    pub fn copy_out(&self, region: MemoryRegion) -> Result<Vec<u8>, PlaygroundError> {
        copy_out(self.memory(), region)
    }

    /// Hand `buffer` back to the module's allocator.
    pub fn release(&mut self, buffer: GuestBuffer) -> Result<(), PlaygroundError> {
        self.free(buffer.ptr())
    }

    /// Encode `text`, run `f` with the buffer, then release it.
    ///
    /// The buffer is released after `f` returns whether or not `f` failed;
    /// an error from `f` takes precedence over one from the release.
    pub fn with_encoded<R>(
        &mut self,
        text: &str,
        guard: GuardRegion,
        f: impl FnOnce(&mut Self, &GuestBuffer) -> Result<R, PlaygroundError>,
    ) -> Result<R, PlaygroundError> {
        let buffer = self.encode(text, guard)?;
        let result = f(self, &buffer);
        let released = self.release(buffer);
        let value = result?;
        released?;
        Ok(value)
    }
}
