//! Build and apply binary patch containers that turn one directory tree into
//! another.
//!
//! Building: [`DiffEngine`] compares two trees, [`PatchBuilder`] maps the
//! entries to commands, compiles their payloads through a [`DeltaCodec`] and
//! serializes the container. Applying: [`PatchApplier`] validates the header
//! and replays each command with hash checks on both sides of the write.

pub mod applier;
pub mod apply;
pub mod builder;
pub mod codec;
pub mod command;
pub mod create;
pub mod diff;
pub mod error;
pub mod execute;
pub mod hash;
pub mod patch_format;
pub mod scan;
pub mod scratch;

pub use applier::{ApplierState, ApplyEvent, ApplySteps, PatchApplier};
pub use builder::{BuilderOptions, CompileEvent, PatchBuilder, PlannedCommand};
pub use codec::{BlockDeltaCodec, CodecRegistry, DeltaCodec, Xdelta3Codec};
pub use command::{AddFile, Command, CommandKind, ExecuteStep, ModifyFile, RemoveFile};
pub use diff::{DiffEngine, DiffEntry, DiffKind};
pub use error::{CodecError, ErrorCategory, PatchError, Result};
pub use execute::ExecContext;
pub use patch_format::{PatchHeader, TextEncoding};
pub use scan::TreeScanner;
