use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

use crate::common::{ErrorPolicy, SymlinkPolicy};
use crate::compress::block::{DEFAULT_MAX_ENTRY_SIZE, MAX_LEVEL};
use crate::compress::{PackOptions, DEFAULT_LEVEL};
use crate::extract::UnpackOptions;
use crate::workers::{CancelToken, DEFAULT_MAX_THREADS};

#[derive(Parser, Debug)]
#[command(name = "wpack", author, version, about, long_about = None)]
pub struct Args {
    /// More log output (debug level).
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Only warnings and errors.
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Options shared by every command that runs the worker pool.
#[derive(clap::Args, Clone, Debug)]
pub struct PoolArgs {
    /// Number of worker threads. [0 = one per CPU core]
    #[arg(long, env = "WPACK_THREADS", default_value_t = 0)]
    pub threads: usize,

    /// Upper bound on worker threads, whatever `--threads` says.
    #[arg(long, default_value_t = DEFAULT_MAX_THREADS, hide = true)]
    pub max_threads: usize,

    /// `[ADVANCED]` Blocks allowed in flight at once. [0 = twice the thread count]
    #[arg(long, default_value_t = 0, hide = true)]
    pub window: usize,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Commands {
    /// Pack a directory tree into a new archive.
    #[command(alias = "c")]
    Pack {
        /// Root directory of the tree to pack.
        root: PathBuf,

        /// The path for the output archive file (e.g., world.wpack).
        #[arg(short, long)]
        output: PathBuf,

        /// DEFLATE level (0-9). 0 stores everything uncompressed.
        #[arg(long, env = "WPACK_LEVEL", default_value_t = DEFAULT_LEVEL,
              value_parser = clap::value_parser!(u32).range(0..=MAX_LEVEL as i64))]
        level: u32,

        /// Store symlinks as links, or archive what they point at.
        #[arg(long, value_enum, default_value_t = SymlinkPolicy::Preserve)]
        symlinks: SymlinkPolicy,

        /// What to do with files that cannot be read.
        #[arg(long, value_enum, default_value_t = ErrorPolicy::SkipAndReport)]
        on_unreadable: ErrorPolicy,

        #[command(flatten)]
        pool: PoolArgs,
    },

    /// Extract entries from an archive.
    #[command(alias = "x")]
    Unpack {
        /// The archive file to extract.
        archive: PathBuf,

        /// Entries or directories to extract. If empty, everything is extracted.
        selection: Vec<String>,

        /// The directory to extract into. Defaults to the current directory.
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// What to do with entries that fail their integrity check.
        #[arg(long, value_enum, default_value_t = ErrorPolicy::SkipAndReport)]
        on_mismatch: ErrorPolicy,

        /// Do not apply the permission bits recorded in the archive.
        #[arg(long = "no-permissions", action = ArgAction::SetFalse, default_value_t = true)]
        permissions: bool,

        /// Refuse to inflate any single entry beyond this many bytes.
        #[arg(long, default_value_t = DEFAULT_MAX_ENTRY_SIZE, hide = true)]
        max_entry_size: u64,

        #[command(flatten)]
        pool: PoolArgs,
    },

    /// List the contents of an archive without extracting it.
    #[command(alias = "l")]
    List {
        archive: PathBuf,

        /// Print the index as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Check the container checksum and every entry of an archive.
    Verify {
        archive: PathBuf,

        #[command(flatten)]
        pool: PoolArgs,
    },

    /// Print SHA-256 digests of every file, in `sha256sum` format.
    Digest { archive: PathBuf },
}

impl PoolArgs {
    fn apply(&self, threads: &mut usize, max_threads: &mut usize, window: &mut usize) {
        *threads = self.threads;
        *max_threads = self.max_threads;
        *window = self.window;
    }
}

/// Builds pack options from the `pack` arguments. Returns `None` for other commands.
pub fn pack_options(command: &Commands, cancel: &CancelToken) -> Option<PackOptions> {
    let Commands::Pack { level, symlinks, on_unreadable, pool, .. } = command else {
        return None;
    };
    let mut opts = PackOptions {
        level: *level,
        symlinks: *symlinks,
        on_unreadable: *on_unreadable,
        cancel: cancel.clone(),
        ..Default::default()
    };
    pool.apply(&mut opts.threads, &mut opts.max_threads, &mut opts.window);
    Some(opts)
}

/// Builds unpack options from the `unpack` or `verify` arguments.
pub fn unpack_options(command: &Commands, cancel: &CancelToken) -> Option<UnpackOptions> {
    let mut opts = UnpackOptions { cancel: cancel.clone(), ..Default::default() };
    match command {
        Commands::Unpack { on_mismatch, permissions, max_entry_size, pool, .. } => {
            opts.on_mismatch = *on_mismatch;
            opts.restore_permissions = *permissions;
            opts.max_entry_size = *max_entry_size;
            pool.apply(&mut opts.threads, &mut opts.max_threads, &mut opts.window);
        }
        Commands::Verify { pool, .. } => {
            pool.apply(&mut opts.threads, &mut opts.max_threads, &mut opts.window);
        }
        _ => return None,
    }
    Some(opts)
}

/// Parses command-line arguments using `clap`.
pub fn run() -> Args {
    Args::parse()
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn pack_arguments_become_options() {
        let args = Args::try_parse_from(["wpack", "c", "world", "-o", "w.wpack", "--level", "9", "--threads", "3"]).unwrap();
        let opts = pack_options(&args.command, &CancelToken::new()).unwrap();
        assert_eq!(opts.level, 9);
        assert_eq!(opts.threads, 3);
        assert!(unpack_options(&args.command, &CancelToken::new()).is_none());
    }

    #[test]
    fn level_out_of_range_is_a_usage_error() {
        assert!(Args::try_parse_from(["wpack", "pack", "w", "-o", "o", "--level", "12"]).is_err());
    }

    #[test]
    fn unpack_flags() {
        let args = Args::try_parse_from(["wpack", "x", "a.wpack", "b", "--no-permissions", "--on-mismatch", "abort"]).unwrap();
        let opts = unpack_options(&args.command, &CancelToken::new()).unwrap();
        assert!(!opts.restore_permissions);
        assert_eq!(opts.on_mismatch, ErrorPolicy::Abort);
    }
}
