//! # dexpatch
//!
//! A library for locating, deobfuscating and patching methods inside Android
//! DEX files.
//!
//! The `dex` module owns the container: parsing into typed records, string
//! interning, serialization and integrity-field refresh. The `patch` module
//! is the engine on top: it inventories methods, searches their instruction
//! streams for byte patterns, grows the string pool while keeping every
//! cached file offset honest, and rewrites call sites in the persisted copy.
//!
//! The typical entry point is the deobfuscation pipeline:
//!
//! ```no_run
//! use std::path::Path;
//! use dexpatch::dex::{DexFile, DexIntegrity};
//! use dexpatch::patch::{DeobfuscationPipeline, XorStringRule};
//!
//! let input = Path::new("classes.dex");
//! let mut dex = DexFile::from_file(input).unwrap();
//! let integrity = DexIntegrity;
//! let summary = DeobfuscationPipeline::new(&mut dex, input, &integrity)
//!     .unwrap()
//!     .with_rule(Box::new(XorStringRule))
//!     .run()
//!     .unwrap();
//! println!("{} caller(s) patched into {}", summary.callers_patched, summary.output_path.display());
//! ```

pub mod dex;
pub mod patch;
mod tests;

pub use dex::{DexFile, DexIntegrity, IntegrityService};
pub use patch::{DeobfuscationPipeline, PatchError, XorStringRule};
