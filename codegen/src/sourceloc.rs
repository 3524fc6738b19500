//! Source locations attached to instructions for debug info.

use std::fmt;
use std::sync::Arc;

/// A source position: file, line number, and byte offset of the line
/// start within the file. Attached to every emitted instruction when
/// debug info generation is on; the backend folds these into the image's
/// line table.
///
/// File paths are reference-counted: thousands of instructions share a
/// handful of paths.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SourceLoc {
    /// Absolute path of the originating file. `None` for compiler
    /// generated instructions with no source counterpart.
    pub path: Option<Arc<str>>,
    /// 1-based line number.
    pub line: u32,
    /// Byte offset of the line within the file.
    pub line_offset: u32,
}

impl SourceLoc {
    /// An unknown location.
    pub fn unknown() -> Self {
        Self::default()
    }

    /// Is this the unknown location?
    pub fn is_unknown(&self) -> bool {
        self.path.is_none()
    }
}

impl fmt::Display for SourceLoc {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.path {
            Some(p) => write!(f, "{}:{}", p, self.line),
            None => write!(f, "<unknown>"),
        }
    }
}

impl fmt::Debug for SourceLoc {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
