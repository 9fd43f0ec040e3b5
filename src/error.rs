use std::path::PathBuf;

use thiserror::Error;

use crate::command::CommandKind;

/// Coarse classification of a [`PatchError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// The container itself is malformed or of an unknown version.
    Format,
    /// A hash check failed before or after decoding.
    Integrity,
    /// The filesystem does not look the way the command expects.
    Precondition,
    /// A delta codec is missing or failed.
    Codec,
    /// Plain I/O failure.
    Resource,
}

#[derive(Debug, Error)]
pub enum PatchError {
    #[error("incorrect patch file header: {0}")]
    CorruptHeader(String),

    #[error("unsupported patch format version {0}")]
    UnsupportedVersion(i32),

    #[error("patch file is too short: {len} bytes, header needs {needed}")]
    TruncatedHeader { len: u64, needed: u64 },

    #[error("invalid command tag {0}")]
    InvalidCommandTag(i32),

    #[error("invalid length-prefixed string: {0}")]
    InvalidString(String),

    #[error("original file hash mismatch for {path}: expected {expected}, found {actual}")]
    OriginalHashMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("output file hash mismatch for {path}: expected {expected}, found {actual}")]
    OutputHashMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("file already exists: {0}")]
    FileAlreadyExists(String),

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("path escapes the target directory: {0}")]
    UnsafePath(String),

    #[error("patch output already exists: {}", .0.display())]
    OutputExists(PathBuf),

    #[error("unsupported codec tag {tag} for {path}")]
    UnsupportedCodec { tag: u8, path: String },

    #[error("no codec registered for tag {0}")]
    CodecNotFound(u8),

    #[error("codec {tag} failed: {message}")]
    CodecFailure {
        tag: u8,
        message: String,
        diagnostics: Option<String>,
    },

    #[error("unsupported interpreter tag {0}")]
    UnsupportedInterpreter(u8),

    #[error("patch applier is in state {0:?}, expected {1:?}")]
    InvalidState(crate::applier::ApplierState, crate::applier::ApplierState),

    #[error("command #{index} ({kind} {path}) failed: {source}")]
    Command {
        index: usize,
        kind: CommandKind,
        path: String,
        #[source]
        source: Box<PatchError>,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PatchError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            PatchError::CorruptHeader(_)
            | PatchError::UnsupportedVersion(_)
            | PatchError::TruncatedHeader { .. }
            | PatchError::InvalidCommandTag(_)
            | PatchError::InvalidString(_) => ErrorCategory::Format,
            PatchError::OriginalHashMismatch { .. } | PatchError::OutputHashMismatch { .. } => {
                ErrorCategory::Integrity
            }
            PatchError::FileAlreadyExists(_)
            | PatchError::FileNotFound(_)
            | PatchError::UnsafePath(_)
            | PatchError::OutputExists(_)
            | PatchError::InvalidState(..) => ErrorCategory::Precondition,
            PatchError::UnsupportedCodec { .. }
            | PatchError::CodecNotFound(_)
            | PatchError::CodecFailure { .. }
            | PatchError::UnsupportedInterpreter(_) => ErrorCategory::Codec,
            PatchError::Command { source, .. } => source.category(),
            PatchError::Io(_) => ErrorCategory::Resource,
        }
    }

    /// Strip any [`PatchError::Command`] context and return the underlying error.
    pub fn root(&self) -> &PatchError {
        match self {
            PatchError::Command { source, .. } => source.root(),
            other => other,
        }
    }

    pub(crate) fn in_command(self, index: usize, kind: CommandKind, path: &str) -> Self {
        PatchError::Command {
            index,
            kind,
            path: path.to_string(),
            source: Box::new(self),
        }
    }
}

/// Failure reported by a delta codec implementation.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("codec does not support encoding")]
    EncodeUnsupported,

    #[error("{message}")]
    Failed {
        message: String,
        diagnostics: Option<String>,
    },

    #[error("malformed delta: {0}")]
    Malformed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CodecError {
    pub(crate) fn into_patch_error(self, tag: u8) -> PatchError {
        match self {
            CodecError::Failed {
                message,
                diagnostics,
            } => PatchError::CodecFailure {
                tag,
                message,
                diagnostics,
            },
            other => PatchError::CodecFailure {
                tag,
                message: other.to_string(),
                diagnostics: None,
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, PatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        assert_eq!(
            PatchError::CorruptHeader("bad magic".into()).category(),
            ErrorCategory::Format
        );
        assert_eq!(
            PatchError::FileNotFound("a".into()).category(),
            ErrorCategory::Precondition
        );
        assert_eq!(PatchError::CodecNotFound(9).category(), ErrorCategory::Codec);
    }

    #[test]
    fn test_command_context_keeps_root_category() {
        let err = PatchError::OriginalHashMismatch {
            path: "a.txt".into(),
            expected: "x".into(),
            actual: "y".into(),
        }
        .in_command(3, CommandKind::ModifyFile, "a.txt");

        assert_eq!(err.category(), ErrorCategory::Integrity);
        assert!(matches!(err.root(), PatchError::OriginalHashMismatch { .. }));
        assert!(err.to_string().contains("#3"));
    }

    #[test]
    fn test_codec_error_conversion() {
        let err = CodecError::Failed {
            message: "exit 2".into(),
            diagnostics: Some("bad input".into()),
        }
        .into_patch_error(2);
        match err {
            PatchError::CodecFailure {
                tag, diagnostics, ..
            } => {
                assert_eq!(tag, 2);
                assert_eq!(diagnostics.as_deref(), Some("bad input"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
