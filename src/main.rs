use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

use dirpatch::apply::{self, ApplyOptions};
use dirpatch::codec::{BLOCK_DELTA_TAG, XDELTA3_TAG};
use dirpatch::create::{self, CreateOptions};
use dirpatch::{BlockDeltaCodec, BuilderOptions, CodecRegistry, TextEncoding, Xdelta3Codec};

#[derive(Parser)]
#[command(name = "dirpatch", about = "Binary directory patch creator and applier")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum CodecArg {
    /// Built-in rolling-hash block delta
    Block,
    /// External xdelta3 executable
    Xdelta3,
}

impl CodecArg {
    fn tag(self) -> u8 {
        match self {
            CodecArg::Block => BLOCK_DELTA_TAG,
            CodecArg::Xdelta3 => XDELTA3_TAG,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Create a patch by comparing old and new directories
    Create {
        /// Path to the old (original) directory
        #[arg(long)]
        old: PathBuf,
        /// Path to the new (updated) directory
        #[arg(long)]
        new: PathBuf,
        /// Output path for the patch file
        #[arg(long, short)]
        output: PathBuf,
        /// Relative path to leave out (repeatable)
        #[arg(long)]
        exclude: Vec<String>,
        /// Relative path to keep even when excluded (repeatable)
        #[arg(long)]
        include: Vec<String>,
        /// Shell statement to run after all file commands (repeatable)
        #[arg(long)]
        execute: Vec<String>,
        /// Replace the output file if it exists
        #[arg(long)]
        overwrite: bool,
        /// Directory for temporary files
        #[arg(long)]
        tmp: Option<PathBuf>,
        /// Do not embed the contents of added files
        #[arg(long)]
        no_contents: bool,
        /// Delta codec for payloads
        #[arg(long, value_enum, default_value = "block")]
        codec: CodecArg,
        /// xdelta3 executable
        #[arg(long, env = "DIRPATCH_XDELTA3", default_value = "xdelta3")]
        xdelta3: PathBuf,
        /// Write a patch info report to this file
        #[arg(long)]
        log_file: Option<PathBuf>,
    },
    /// Apply a patch to a target directory
    Apply {
        /// Path to the target directory to patch
        #[arg(long)]
        target: PathBuf,
        /// Path to the patch file
        #[arg(long, short)]
        patch: PathBuf,
        /// Directory for temporary files
        #[arg(long)]
        tmp: Option<PathBuf>,
        /// Number of leading commands to skip when resuming
        #[arg(long, default_value_t = 0)]
        skip: usize,
        /// xdelta3 executable
        #[arg(long, env = "DIRPATCH_XDELTA3", default_value = "xdelta3")]
        xdelta3: PathBuf,
    },
    /// List the header and commands of a patch without applying it
    Inspect {
        /// Path to the patch file
        #[arg(long, short)]
        patch: PathBuf,
    },
}

fn registry(xdelta3: PathBuf) -> CodecRegistry {
    let mut registry = CodecRegistry::new();
    registry
        .register(BlockDeltaCodec::default())
        .register(Xdelta3Codec::new(xdelta3));
    registry
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Create {
            old,
            new,
            output,
            exclude,
            include,
            execute,
            overwrite,
            tmp,
            no_contents,
            codec,
            xdelta3,
            log_file,
        } => {
            println!("Creating patch...");
            println!("  Old: {}", old.display());
            println!("  New: {}", new.display());
            println!("  Output: {}", output.display());

            let start = Instant::now();
            let summary = create::create_patch(CreateOptions {
                old_dir: old,
                new_dir: new,
                output,
                excludes: exclude,
                includes: include,
                execute,
                overwrite,
                temp_dir: tmp,
                builder: BuilderOptions {
                    include_added_contents: !no_contents,
                    codec_tag: codec.tag(),
                    ..BuilderOptions::default()
                },
                registry: registry(xdelta3),
            })
            .await?;
            let elapsed = start.elapsed();

            if let Some(path) = &log_file {
                create::write_report(&summary, path)?;
            }

            println!("\nPatch created successfully!");
            for command in &summary.commands {
                println!("  {:<15}{}", command.kind().to_string(), command.subject());
            }
            println!("  Files added: {}", summary.files_added);
            println!("  Files modified: {}", summary.files_modified);
            println!("  Files removed: {}", summary.files_removed);
            println!("  Statements: {}", summary.statements);
            println!("  Patch size: {} bytes", summary.patch_size);
            println!("  Time elapsed: {:.3}s", elapsed.as_secs_f64());
        }
        Commands::Apply {
            target,
            patch,
            tmp,
            skip,
            xdelta3,
        } => {
            println!("Applying patch...");
            println!("  Target: {}", target.display());
            println!("  Patch: {}", patch.display());

            let start = Instant::now();
            let summary = apply::apply_patch(ApplyOptions {
                target_dir: target,
                patch_path: patch,
                temp_dir: tmp,
                skip,
                registry: registry(xdelta3),
                encoding: TextEncoding::default(),
            })
            .await?;
            let elapsed = start.elapsed();

            println!("\nPatch applied successfully!");
            println!("  Commands skipped: {}", summary.skipped);
            println!("  Files added: {}", summary.files_added);
            println!("  Files modified: {}", summary.files_modified);
            println!("  Files removed: {}", summary.files_removed);
            println!("  Statements: {}", summary.statements);
            println!("  Time elapsed: {:.3}s", elapsed.as_secs_f64());
        }
        Commands::Inspect { patch } => {
            let listing = apply::inspect_patch(patch.clone(), TextEncoding::default()).await?;

            println!("Patch: {}", patch.display());
            println!("  Version: {}", listing.header.version);
            println!("  Custom header: {} bytes", listing.custom_header.len());
            println!("  Commands: {}", listing.header.command_count);
            for (index, command) in listing.commands.iter().enumerate() {
                println!(
                    "  {index:>5}  {:<15}{} ({} bytes)",
                    command.kind().to_string(),
                    command.subject(),
                    command.payload_len()
                );
            }
        }
    }

    Ok(())
}
