//! The patch engine: method inventory, pattern search, string-pool growth
//! with offset correction, raw patching, and the deobfuscation workflow
//! tying them together.

pub mod catalog;
pub mod error;
pub mod offsets;
pub mod pattern;
pub mod pipeline;
pub mod rewrite;
pub mod strings;

pub use catalog::{build_catalog, MethodRecord};
pub use error::PatchError;
pub use pattern::BytePattern;
pub use pipeline::{DeobfuscationPipeline, DeobfuscationRule, ObfuscatedPayload, PatchSummary, XorStringRule};
pub use strings::{SizeShift, StringTablePatcher};
