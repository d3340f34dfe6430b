//! Main entry point for the wpack CLI app

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use tracing::Level;
use worldpack::cli::{self, Commands};
use worldpack::common::{display_size, EntryKind, Summary};
use worldpack::workers::CancelToken;
use worldpack::{extract, logging, ArchiverError};

/// Exit status when the run finished but some entries were skipped or failed.
const EXIT_PARTIAL: u8 = 2;

fn main() -> ExitCode {
    let args = cli::run();
    let level = if args.verbose {
        Level::DEBUG
    } else if args.quiet {
        Level::WARN
    } else {
        Level::INFO
    };
    logging::setup_logger(level);

    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || handler_token.cancel()) {
        tracing::warn!(error = %e, "cannot install the Ctrl-C handler");
    }

    match run_app(&args.command, &cancel) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(EXIT_PARTIAL),
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Runs one command. `Ok(false)` means it completed with per-entry problems.
fn run_app(command: &Commands, cancel: &CancelToken) -> Result<bool, Box<dyn std::error::Error>> {
    match command {
        Commands::Pack { root, output, .. } => {
            let opts = cli::pack_options(command, cancel).ok_or("pack options")?;
            let summary = worldpack::pack(root, output, &opts)?;
            report(&summary);
            Ok(summary.is_clean())
        }
        Commands::Unpack { archive, selection, output, .. } => {
            let opts = cli::unpack_options(command, cancel).ok_or("unpack options")?;
            let dest = output.clone().unwrap_or_else(|| PathBuf::from("."));
            let summary = worldpack::unpack(archive, &dest, selection, &opts)?;
            report(&summary);
            Ok(summary.is_clean())
        }
        Commands::List { archive, json } => {
            let entries = worldpack::list(archive)?;
            let mut out = std::io::stdout().lock();
            if *json {
                serde_json::to_writer_pretty(&mut out, &entries)?;
                writeln!(out)?;
            } else {
                for e in &entries {
                    let kind = match e.kind {
                        EntryKind::File => '-',
                        EntryKind::Directory => 'd',
                        EntryKind::Symlink => 'l',
                    };
                    writeln!(
                        out,
                        "{kind} {:>12} {:>12} {:<7} {}",
                        display_size(e.size),
                        display_size(e.compressed_size),
                        e.codec,
                        e.path
                    )?;
                }
            }
            Ok(true)
        }
        Commands::Verify { archive, .. } => {
            let opts = cli::unpack_options(command, cancel).ok_or("verify options")?;
            let verification = worldpack::verify(archive, &opts)?;
            report(&verification.summary);
            if !verification.container_checksum_ok {
                return Err(ArchiverError::InvalidArchive("container checksum mismatch".into()).into());
            }
            Ok(verification.is_ok())
        }
        Commands::Digest { archive } => {
            let mut out = std::io::stdout().lock();
            for (path, digest) in extract::digests(archive)? {
                writeln!(out, "{digest}  {path}")?;
            }
            Ok(true)
        }
    }
}

fn report(summary: &Summary) {
    for problem in &summary.problems {
        eprintln!("  {}: {}", problem.path, problem.reason);
    }
    if !summary.is_clean() {
        eprintln!(
            "{} entries processed, {} skipped, {} failed",
            summary.processed, summary.skipped, summary.failed
        );
    }
}
