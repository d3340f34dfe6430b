//! # worldpack Core Library
//!
//! This crate packs a directory tree (a "world") into a single deterministic,
//! integrity-checked `.wpack` archive and restores it again.
//!
//! It is designed to be used by the `wpack` command-line application, but its public API
//! can also be used to programmatically create, inspect, verify and extract archives.
//!
//! ## Key Modules
//!
//! - [`archive`]: The container byte layout and the [`archive::ArchiveWriter`].
//! - [`compress`]: The pack pipeline, plus the DEFLATE block codec in [`compress::block`].
//! - [`extract`]: Unpacking, listing and verification, and the random-access [`extract::ArchiveReader`].
//! - [`walk`] and [`path`]: Deterministic traversal and path containment.
//! - [`workers`]: The bounded, order-preserving worker pool.
//!
//! ## Examples
//!
//! ```no_run
//! use worldpack::{pack, unpack, PackOptions, UnpackOptions};
//!
//! # fn main() -> Result<(), worldpack::ArchiverError> {
//! let summary = pack("saves/world", "world.wpack", &PackOptions::default())?;
//! println!("stored {} entries", summary.processed);
//! unpack("world.wpack", "restored", &[], &UnpackOptions::default())?;
//! # Ok(())
//! # }
//! ```

pub mod archive;
pub mod cli;
pub mod common;
pub mod compress;
pub mod error;
pub mod extract;
pub mod logging;
pub mod path;
pub mod walk;
pub mod workers;

// Cross-platform filesystem wrapper
pub mod fsx;

pub use compress::{pack, PackOptions};
pub use error::ArchiverError;
pub use extract::{list, unpack, verify, UnpackOptions, Verification};
