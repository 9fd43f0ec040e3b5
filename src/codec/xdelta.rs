use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

use tracing::debug;

use super::DeltaCodec;
use crate::error::CodecError;

pub const XDELTA3_TAG: u8 = 2;

/// Delegates to an external `xdelta3` executable.
#[derive(Debug, Clone)]
pub struct Xdelta3Codec {
    program: PathBuf,
    compression_level: u8,
    tag: u8,
}

impl Default for Xdelta3Codec {
    fn default() -> Self {
        Self {
            program: PathBuf::from("xdelta3"),
            compression_level: 9,
            tag: XDELTA3_TAG,
        }
    }
}

impl Xdelta3Codec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    /// Levels run from 0 (store) to 9.
    pub fn with_compression_level(mut self, level: u8) -> Result<Self, CodecError> {
        if level > 9 {
            return Err(CodecError::Failed {
                message: format!("compression level {level} is outside 0..=9"),
                diagnostics: None,
            });
        }
        self.compression_level = level;
        Ok(self)
    }

    /// Register under another tag. Containers written by older tools carry
    /// VCDIFF payloads under tag 1, which the built-in block codec uses here.
    pub fn with_tag(mut self, tag: u8) -> Self {
        self.tag = tag;
        self
    }

    fn run(&self, command: &mut Command, what: &Path) -> Result<Output, CodecError> {
        debug!(program = %self.program.display(), file = %what.display(), "running xdelta3");
        let output = command.output().map_err(|e| CodecError::Failed {
            message: format!("failed to start {}: {e}", self.program.display()),
            diagnostics: None,
        })?;
        if !output.status.success() {
            return Err(CodecError::Failed {
                message: format!(
                    "{} exited with {} for {}",
                    self.program.display(),
                    output.status,
                    what.display()
                ),
                diagnostics: Some(diagnostics(&output)),
            });
        }
        Ok(output)
    }
}

fn diagnostics(output: &Output) -> String {
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    text.replace('\r', "").replace('\n', " ").trim().to_string()
}

impl DeltaCodec for Xdelta3Codec {
    fn tag(&self) -> u8 {
        self.tag
    }

    fn name(&self) -> &str {
        "xdelta3"
    }

    fn encode(&self, source: Option<&Path>, target: &Path, output: &Path) -> Result<(), CodecError> {
        let mut command = Command::new(&self.program);
        command
            .arg("-e")
            .arg("-f")
            .arg("-n")
            .arg("-A=")
            .arg(format!("-{}", self.compression_level));
        if let Some(source) = source {
            command.arg("-s").arg(source);
        }
        command
            .arg(target)
            .arg(output)
            .stdin(Stdio::null());
        self.run(&mut command, target)?;
        Ok(())
    }

    fn decode(
        &self,
        source: Option<&Path>,
        delta: &mut dyn Read,
        output: &mut dyn Write,
    ) -> Result<(), CodecError> {
        // xdelta3 wants a seekable delta file, so spool the payload first.
        let mut spooled = tempfile::NamedTempFile::new()?;
        std::io::copy(delta, spooled.as_file_mut())?;
        spooled.as_file_mut().flush()?;

        let mut command = Command::new(&self.program);
        command.arg("-d").arg("-c");
        if let Some(source) = source {
            command.arg("-s").arg(source);
        }
        command.arg(spooled.path()).stdin(Stdio::null());

        let result = self.run(&mut command, spooled.path())?;
        output.write_all(&result.stdout)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_bounds() {
        assert!(Xdelta3Codec::default().with_compression_level(9).is_ok());
        assert!(Xdelta3Codec::default().with_compression_level(10).is_err());
    }

    #[test]
    fn test_rebinding_tag_replaces_block_codec() {
        use crate::codec::{CodecRegistry, BLOCK_DELTA_TAG};

        let mut registry = CodecRegistry::with_defaults();
        assert_eq!(registry.resolve(BLOCK_DELTA_TAG).unwrap().name(), "block");

        registry.register(Xdelta3Codec::default().with_tag(BLOCK_DELTA_TAG));
        assert_eq!(registry.resolve(BLOCK_DELTA_TAG).unwrap().name(), "xdelta3");
        assert_eq!(Xdelta3Codec::default().tag(), XDELTA3_TAG);
    }

    #[test]
    fn test_missing_program_is_codec_failure() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("t.bin");
        std::fs::write(&target, b"x").unwrap();

        let codec = Xdelta3Codec::new(dir.path().join("no-such-xdelta3"));
        let err = codec
            .encode(None, &target, &dir.path().join("out.delta"))
            .unwrap_err();
        match err {
            CodecError::Failed { message, .. } => assert!(message.contains("failed to start")),
            other => panic!("unexpected error: {other}"),
        }
    }
}
