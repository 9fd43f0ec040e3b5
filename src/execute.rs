//! Apply-side behaviour of each command.

use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::process::{Command as Process, Stdio};

use tracing::{debug, warn};

use crate::codec::{CodecRegistry, DeltaCodec};
use crate::command::{AddFile, Command, ExecuteStep, ModifyFile, RemoveFile, SHELL_INTERPRETER};
use crate::error::{PatchError, Result};
use crate::hash;

/// Everything a command needs besides its own fields and payload.
#[derive(Debug, Clone, Copy)]
pub struct ExecContext<'a> {
    pub target_root: &'a Path,
    pub scratch: &'a Path,
    pub registry: &'a CodecRegistry,
}

impl Command {
    /// Perform the filesystem mutation. `payload` must be positioned at the
    /// start of this command's payload; on success exactly `payload_len`
    /// bytes have been consumed.
    pub fn execute<R: Read + ?Sized>(&self, payload: &mut R, ctx: &ExecContext<'_>) -> Result<()> {
        match self {
            Command::AddFile(c) => c.execute(payload, ctx),
            Command::RemoveFile(c) => c.execute(ctx),
            Command::ModifyFile(c) => c.execute(payload, ctx),
            Command::ExecuteStep(c) => c.execute(ctx),
        }
    }
}

impl AddFile {
    fn execute<R: Read + ?Sized>(&self, payload: &mut R, ctx: &ExecContext<'_>) -> Result<()> {
        let dest = resolve_target(ctx.target_root, &self.path)?;
        let codec = resolve_codec(ctx.registry, self.codec_tag, &self.path)?;

        if dest.exists() && !self.overwrite {
            return Err(PatchError::FileAlreadyExists(self.path.clone()));
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp = scratch_file(ctx.scratch, &self.path);
        decode_payload(codec.as_ref(), None, payload, self.payload_len, &tmp)?;
        verify_output(&tmp, &self.path, &self.target_hash)?;

        move_into_place(&tmp, &dest)
    }
}

impl ModifyFile {
    fn execute<R: Read + ?Sized>(&self, payload: &mut R, ctx: &ExecContext<'_>) -> Result<()> {
        let dest = resolve_target(ctx.target_root, &self.path)?;
        if !dest.is_file() {
            return Err(PatchError::FileNotFound(self.path.clone()));
        }

        let current = hash::hash_file(&dest)?;
        if !current.eq_ignore_ascii_case(&self.source_hash) {
            return Err(PatchError::OriginalHashMismatch {
                path: self.path.clone(),
                expected: self.source_hash.clone(),
                actual: current,
            });
        }

        let codec = resolve_codec(ctx.registry, self.codec_tag, &self.path)?;
        let tmp = scratch_file(ctx.scratch, &self.path);
        decode_payload(codec.as_ref(), Some(&dest), payload, self.payload_len, &tmp)?;
        verify_output(&tmp, &self.path, &self.target_hash)?;

        move_into_place(&tmp, &dest)
    }
}

impl RemoveFile {
    fn execute(&self, ctx: &ExecContext<'_>) -> Result<()> {
        let dest = resolve_target(ctx.target_root, &self.path)?;
        match fs::remove_file(&dest) {
            Ok(()) => {
                prune_empty_parents(ctx.target_root, &dest);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if self.ignore_missing {
                    Ok(())
                } else {
                    Err(PatchError::FileNotFound(self.path.clone()))
                }
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl ExecuteStep {
    /// Launches the interpreter and returns without waiting for it.
    fn execute(&self, ctx: &ExecContext<'_>) -> Result<()> {
        if self.interpreter_tag != SHELL_INTERPRETER {
            return Err(PatchError::UnsupportedInterpreter(self.interpreter_tag));
        }

        let mut process = shell(&self.statement);
        let child = process
            .current_dir(ctx.target_root)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .spawn()?;
        debug!(pid = child.id(), statement = %self.statement, "execute step launched");
        Ok(())
    }
}

#[cfg(windows)]
fn shell(statement: &str) -> Process {
    let mut process = Process::new("cmd");
    process.arg("/C").arg(statement);
    process
}

#[cfg(not(windows))]
fn shell(statement: &str) -> Process {
    let mut process = Process::new("sh");
    process.arg("-c").arg(statement);
    process
}

/// Join a relative command path onto the target root, refusing anything that
/// could land outside it.
pub fn resolve_target(root: &Path, relative: &str) -> Result<PathBuf> {
    let path = Path::new(relative);
    let only_normal = path
        .components()
        .all(|component| matches!(component, Component::Normal(_)));
    if relative.is_empty() || !only_normal {
        return Err(PatchError::UnsafePath(relative.to_string()));
    }
    Ok(root.join(path))
}

fn resolve_codec(
    registry: &CodecRegistry,
    tag: u8,
    path: &str,
) -> Result<std::sync::Arc<dyn DeltaCodec>> {
    registry.resolve(tag).map_err(|_| PatchError::UnsupportedCodec {
        tag,
        path: path.to_string(),
    })
}

fn scratch_file(scratch: &Path, relative: &str) -> PathBuf {
    scratch.join(format!("{relative}.~tmp"))
}

/// Run the codec over exactly `len` payload bytes into `tmp`, then drain
/// whatever the codec left unread so the stream lands on the next command.
fn decode_payload<R: Read + ?Sized>(
    codec: &dyn DeltaCodec,
    source: Option<&Path>,
    payload: &mut R,
    len: u64,
    tmp: &Path,
) -> Result<()> {
    if let Some(parent) = tmp.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut out = BufWriter::new(File::create(tmp)?);
    let mut delta = payload.take(len);
    codec
        .decode(source, &mut delta, &mut out)
        .map_err(|e| e.into_patch_error(codec.tag()))?;

    let leftover = std::io::copy(&mut delta, &mut std::io::sink())?;
    if leftover > 0 {
        debug!(leftover, codec = codec.name(), "codec left payload bytes unread");
    }
    if delta.limit() > 0 {
        return Err(PatchError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("payload truncated: {} of {len} bytes missing", delta.limit()),
        )));
    }

    out.flush()?;
    Ok(())
}

fn verify_output(tmp: &Path, path: &str, expected: &str) -> Result<()> {
    let actual = hash::hash_file(tmp)?;
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(PatchError::OutputHashMismatch {
            path: path.to_string(),
            expected: expected.to_string(),
            actual,
        })
    }
}

/// Remove directories left empty by a removal, walking up to but never
/// including `root`. Stops at the first directory that still has entries.
fn prune_empty_parents(root: &Path, removed: &Path) {
    let mut dir = removed.parent();
    while let Some(current) = dir {
        if current == root || !current.starts_with(root) {
            break;
        }
        if fs::remove_dir(current).is_err() {
            break;
        }
        debug!(dir = %current.display(), "pruned empty directory");
        dir = current.parent();
    }
}

/// Swap the verified temp file into place. A rename replaces the target in one
/// step; only when the scratch area sits on another filesystem is the file
/// copied next to the target first and renamed from there.
fn move_into_place(tmp: &Path, dest: &Path) -> Result<()> {
    match fs::rename(tmp, dest) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::CrossesDevices => {
            warn!(from = %tmp.display(), to = %dest.display(), "scratch is on another device, copying");
            let mut staged = dest.as_os_str().to_owned();
            staged.push(".~tmp");
            let staged = PathBuf::from(staged);
            fs::copy(tmp, &staged)?;
            if let Err(e) = fs::rename(&staged, dest) {
                let _ = fs::remove_file(&staged);
                return Err(e.into());
            }
            fs::remove_file(tmp)?;
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::BLOCK_DELTA_TAG;
    use crate::error::CodecError;

    /// Payload is the literal output; the source is ignored.
    struct Literal;

    impl DeltaCodec for Literal {
        fn tag(&self) -> u8 {
            BLOCK_DELTA_TAG
        }

        fn name(&self) -> &str {
            "literal"
        }

        fn decode(
            &self,
            _source: Option<&Path>,
            delta: &mut dyn Read,
            output: &mut dyn Write,
        ) -> std::result::Result<(), CodecError> {
            std::io::copy(delta, output)?;
            Ok(())
        }
    }

    struct Fixture {
        target: tempfile::TempDir,
        scratch: tempfile::TempDir,
        registry: CodecRegistry,
    }

    impl Fixture {
        fn new() -> Self {
            let mut registry = CodecRegistry::new();
            registry.register(Literal);
            Self {
                target: tempfile::tempdir().unwrap(),
                scratch: tempfile::tempdir().unwrap(),
                registry,
            }
        }

        fn ctx(&self) -> ExecContext<'_> {
            ExecContext {
                target_root: self.target.path(),
                scratch: self.scratch.path(),
                registry: &self.registry,
            }
        }

        fn write(&self, rel: &str, content: &[u8]) {
            let full = self.target.path().join(rel);
            fs::create_dir_all(full.parent().unwrap()).unwrap();
            fs::write(full, content).unwrap();
        }

        fn read(&self, rel: &str) -> Vec<u8> {
            fs::read(self.target.path().join(rel)).unwrap()
        }
    }

    fn add(path: &str, content: &[u8], overwrite: bool) -> Command {
        Command::AddFile(AddFile {
            path: path.into(),
            target_hash: hash::hash_bytes(content),
            overwrite,
            codec_tag: BLOCK_DELTA_TAG,
            payload_len: content.len() as u64,
        })
    }

    #[test]
    fn test_add_creates_parents() {
        let fx = Fixture::new();
        add("deep/dir/new.txt", b"hello", false)
            .execute(&mut &b"hello"[..], &fx.ctx())
            .unwrap();
        assert_eq!(fx.read("deep/dir/new.txt"), b"hello");
    }

    #[test]
    fn test_add_overwrite_gate() {
        let fx = Fixture::new();
        fx.write("a.txt", b"keep me");

        let err = add("a.txt", b"replaced", false)
            .execute(&mut &b"replaced"[..], &fx.ctx())
            .unwrap_err();
        assert!(matches!(err, PatchError::FileAlreadyExists(_)));
        assert_eq!(fx.read("a.txt"), b"keep me");

        add("a.txt", b"replaced", true)
            .execute(&mut &b"replaced"[..], &fx.ctx())
            .unwrap();
        assert_eq!(fx.read("a.txt"), b"replaced");
    }

    #[test]
    fn test_add_output_hash_mismatch() {
        let fx = Fixture::new();
        let mut command = add("a.txt", b"expected", false);
        if let Command::AddFile(c) = &mut command {
            c.payload_len = 5;
        }
        let err = command.execute(&mut &b"wrong"[..], &fx.ctx()).unwrap_err();
        assert!(matches!(err, PatchError::OutputHashMismatch { .. }));
        assert!(!fx.target.path().join("a.txt").exists());
    }

    #[test]
    fn test_unknown_codec_before_temp_file() {
        let fx = Fixture::new();
        let command = Command::AddFile(AddFile {
            path: "x.bin".into(),
            target_hash: String::new(),
            overwrite: true,
            codec_tag: 0,
            payload_len: 0,
        });
        let err = command.execute(&mut &b""[..], &fx.ctx()).unwrap_err();
        assert!(matches!(err, PatchError::UnsupportedCodec { tag: 0, .. }));
        assert_eq!(fs::read_dir(fx.scratch.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_modify_requires_matching_source() {
        let fx = Fixture::new();
        fx.write("cfg.ini", b"drifted");

        let command = Command::ModifyFile(ModifyFile {
            path: "cfg.ini".into(),
            source_hash: hash::hash_bytes(b"original"),
            target_hash: hash::hash_bytes(b"updated"),
            codec_tag: BLOCK_DELTA_TAG,
            payload_len: 7,
        });
        let err = command.execute(&mut &b"updated"[..], &fx.ctx()).unwrap_err();
        assert!(matches!(err, PatchError::OriginalHashMismatch { .. }));
        assert_eq!(fx.read("cfg.ini"), b"drifted");
    }

    #[test]
    fn test_modify_missing_file() {
        let fx = Fixture::new();
        let command = Command::ModifyFile(ModifyFile {
            path: "gone.txt".into(),
            source_hash: "00".into(),
            target_hash: "11".into(),
            codec_tag: BLOCK_DELTA_TAG,
            payload_len: 0,
        });
        let err = command.execute(&mut &b""[..], &fx.ctx()).unwrap_err();
        assert!(matches!(err, PatchError::FileNotFound(_)));
    }

    #[test]
    fn test_modify_replaces_content() {
        let fx = Fixture::new();
        fx.write("cfg.ini", b"original");

        let command = Command::ModifyFile(ModifyFile {
            path: "cfg.ini".into(),
            source_hash: hash::hash_bytes(b"original"),
            target_hash: hash::hash_bytes(b"updated"),
            codec_tag: BLOCK_DELTA_TAG,
            payload_len: 7,
        });
        command.execute(&mut &b"updated"[..], &fx.ctx()).unwrap();
        assert_eq!(fx.read("cfg.ini"), b"updated");
    }

    #[test]
    fn test_remove_ignore_missing() {
        let fx = Fixture::new();
        let strict = Command::RemoveFile(RemoveFile {
            path: "nope.txt".into(),
            ignore_missing: false,
        });
        assert!(matches!(
            strict.execute(&mut &b""[..], &fx.ctx()),
            Err(PatchError::FileNotFound(_))
        ));

        let lenient = Command::RemoveFile(RemoveFile {
            path: "nope.txt".into(),
            ignore_missing: true,
        });
        lenient.execute(&mut &b""[..], &fx.ctx()).unwrap();

        fx.write("nope.txt", b"now here");
        lenient.execute(&mut &b""[..], &fx.ctx()).unwrap();
        assert!(!fx.target.path().join("nope.txt").exists());
    }

    #[test]
    fn test_remove_prunes_emptied_directories() {
        let fx = Fixture::new();
        fx.write("x/y/only.txt", b"1");
        fx.write("x/keep.txt", b"2");

        let remove = Command::RemoveFile(RemoveFile {
            path: "x/y/only.txt".into(),
            ignore_missing: false,
        });
        remove.execute(&mut &b""[..], &fx.ctx()).unwrap();

        assert!(!fx.target.path().join("x/y").exists());
        assert_eq!(fx.read("x/keep.txt"), b"2");
        assert!(fx.target.path().exists());
    }

    #[test]
    fn test_failed_rename_keeps_destination() {
        let fx = Fixture::new();
        fx.write("app.bin", b"original");

        let missing = fx.scratch.path().join("never-written.~tmp");
        let dest = fx.target.path().join("app.bin");
        let err = move_into_place(&missing, &dest).unwrap_err();

        assert!(matches!(err, PatchError::Io(ref e) if e.kind() == std::io::ErrorKind::NotFound));
        assert_eq!(fx.read("app.bin"), b"original");
    }

    #[test]
    fn test_payload_fully_consumed() {
        let fx = Fixture::new();
        let mut stream: &[u8] = b"helloNEXT";
        add("a.txt", b"hello", false)
            .execute(&mut stream, &fx.ctx())
            .unwrap();
        assert_eq!(stream, b"NEXT");
    }

    #[test]
    fn test_unsafe_paths_rejected() {
        let root = Path::new("/target");
        assert!(resolve_target(root, "ok/file.txt").is_ok());
        for bad in ["", "../escape", "a/../../b", "/etc/passwd", "./a"] {
            assert!(
                matches!(resolve_target(root, bad), Err(PatchError::UnsafePath(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_unknown_interpreter() {
        let fx = Fixture::new();
        let command = Command::ExecuteStep(ExecuteStep {
            interpreter_tag: 7,
            statement: "true".into(),
            ignore_errors: true,
        });
        assert!(matches!(
            command.execute(&mut &b""[..], &fx.ctx()),
            Err(PatchError::UnsupportedInterpreter(7))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_shell_step_launches() {
        let fx = Fixture::new();
        Command::ExecuteStep(ExecuteStep::shell("exit 0"))
            .execute(&mut &b""[..], &fx.ctx())
            .unwrap();
    }
}
