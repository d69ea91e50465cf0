//! The linked binary, as offered for download.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub const MIME_TYPE: &str = "application/wasm";
pub const DEFAULT_FILE_NAME: &str = "out.wasm";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Artifact<'a> {
    bytes: &'a [u8],
}

impl<'a> Artifact<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn file_name(&self) -> &'static str {
        DEFAULT_FILE_NAME
    }

    pub fn mime_type(&self) -> &'static str {
        MIME_TYPE
    }

    /// Size shown next to the download button.
    pub fn size_label(&self) -> String {
        human_readable_bytes(self.bytes.len())
    }

    /// Write the binary and return the path written.
    ///
    /// An existing directory gets `file_name()` joined onto it; anything else
    /// is the file to write, with missing parent directories created.
    pub fn save(&self, dir_or_path: impl AsRef<Path>) -> io::Result<PathBuf> {
        let target = dir_or_path.as_ref();
        let path = if target.is_dir() {
            target.join(self.file_name())
        } else {
            target.to_path_buf()
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(&path, self.bytes)?;
        Ok(path)
    }
}

/// `"N bytes"`, or KiB/MiB with two decimals once past 1 KiB/1 MiB.
pub fn human_readable_bytes(size: usize) -> String {
    const KIB: usize = 1024;
    const MIB: usize = 1024 * 1024;
    if size > MIB {
        format!("{:.2} MiB", size as f64 / MIB as f64)
    } else if size > KIB {
        format!("{:.2} KiB", size as f64 / KIB as f64)
    } else {
        format!("{size} bytes")
    }
}
