use std::path::Path;

use thiserror::Error;

/// Errors produced while reading, parsing, or merging environment
/// descriptors. Every variant carries the source file name so callers can
/// point an operator at the offending document.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DescriptorError {
    #[error("{file}: cannot read descriptor: {reason}")]
    Read { file: String, reason: String },
    #[error("{file}: invalid descriptor: {reason}")]
    Parse { file: String, reason: String },
    #[error("{file}: conflicting pins for {package}: {left:?} vs {right:?}")]
    Conflict {
        file: String,
        package: String,
        left: String,
        right: String,
    },
}

pub(crate) const UNKNOWN_FILE: &str = "<descriptor>";

impl DescriptorError {
    pub(crate) fn parse(reason: impl Into<String>) -> Self {
        Self::Parse {
            file: UNKNOWN_FILE.to_string(),
            reason: reason.into(),
        }
    }

    /// Attach the originating file name to an error raised while the file
    /// was not yet known (parse of raw bytes, merge of two documents).
    #[must_use]
    pub fn with_file(self, file: &Path) -> Self {
        let name = file.display().to_string();
        match self {
            Self::Read { reason, .. } => Self::Read { file: name, reason },
            Self::Parse { reason, .. } => Self::Parse { file: name, reason },
            Self::Conflict {
                package,
                left,
                right,
                ..
            } => Self::Conflict {
                file: name,
                package,
                left,
                right,
            },
        }
    }
}
