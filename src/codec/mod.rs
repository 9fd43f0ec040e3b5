//! Delta codecs and the tag-keyed registry the builder and applier consult.

mod block;
mod rolling_hash;
mod xdelta;

use std::collections::HashMap;
use std::fmt;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;

use crate::error::{CodecError, PatchError, Result};

pub use block::{BlockDeltaCodec, BLOCK_DELTA_TAG};
pub use xdelta::{Xdelta3Codec, XDELTA3_TAG};

/// A delta encoding implementation identified by a one-byte tag.
///
/// `encode` is optional: apply-only codecs keep the default, which reports
/// [`CodecError::EncodeUnsupported`].
pub trait DeltaCodec: Send + Sync {
    fn tag(&self) -> u8;

    fn name(&self) -> &str;

    /// Write a delta that turns `source` (or nothing) into `target` to `output`.
    fn encode(
        &self,
        source: Option<&Path>,
        target: &Path,
        output: &Path,
    ) -> std::result::Result<(), CodecError> {
        let _ = (source, target, output);
        Err(CodecError::EncodeUnsupported)
    }

    /// Reconstruct the target from `source` (or nothing) and the delta bytes.
    ///
    /// `delta` is bounded to exactly the payload; implementations may leave
    /// part of it unread.
    fn decode(
        &self,
        source: Option<&Path>,
        delta: &mut dyn Read,
        output: &mut dyn Write,
    ) -> std::result::Result<(), CodecError>;
}

/// Tag to codec mapping. Last registration for a tag wins.
#[derive(Clone, Default)]
pub struct CodecRegistry {
    codecs: HashMap<u8, Arc<dyn DeltaCodec>>,
}

impl CodecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in block codec only.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(BlockDeltaCodec::default());
        registry
    }

    pub fn register<C: DeltaCodec + 'static>(&mut self, codec: C) -> &mut Self {
        self.register_arc(Arc::new(codec))
    }

    pub fn register_arc(&mut self, codec: Arc<dyn DeltaCodec>) -> &mut Self {
        let tag = codec.tag();
        if let Some(previous) = self.codecs.insert(tag, codec) {
            tracing::debug!(tag, previous = previous.name(), "codec binding replaced");
        }
        self
    }

    pub fn resolve(&self, tag: u8) -> Result<Arc<dyn DeltaCodec>> {
        self.codecs
            .get(&tag)
            .cloned()
            .ok_or(PatchError::CodecNotFound(tag))
    }

    pub fn contains(&self, tag: u8) -> bool {
        self.codecs.contains_key(&tag)
    }

    pub fn tags(&self) -> Vec<u8> {
        let mut tags: Vec<u8> = self.codecs.keys().copied().collect();
        tags.sort_unstable();
        tags
    }
}

impl fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.tags().into_iter().map(|t| (t, self.codecs[&t].name())))
            .finish()
    }
}
