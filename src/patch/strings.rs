//! Growing the container's string pool.
//!
//! Interning is the only operation here that changes the container's size,
//! and every byte it adds lands in front of the code items. The returned
//! [`SizeShift`] is therefore the exact amount every cached method offset has
//! drifted by, and the single most important contract in this crate is that
//! callers push that shift through [`crate::patch::offsets::apply`] before
//! any byte-level patch that uses those offsets.

use crate::dex::dex_file::{DexFile, DexString, InternKind};
use crate::dex::integrity::IntegrityService;
use crate::patch::error::PatchError;
use log::info;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// Signed byte-count growth of the container caused by a pool mutation.
/// Zero means nothing grew.
pub type SizeShift = i64;

/// Interns batches of strings and persists the result as a new copy.
pub struct StringTablePatcher<'a>
{
    dex: &'a mut DexFile,
    output_path: &'a Path,
    integrity: &'a dyn IntegrityService,
}

impl<'a> StringTablePatcher<'a>
{
    pub fn new(dex: &'a mut DexFile, output_path: &'a Path, integrity: &'a dyn IntegrityService) -> StringTablePatcher<'a>
    {
        StringTablePatcher { dex, output_path, integrity }
    }

    /// Intern every value of the batch, then save the container to the
    /// output path and refresh its integrity fields.
    ///
    /// The batch is deduplicated and brought into a canonical order first, so
    /// equivalent input sets always grow the pool with an identical layout.
    /// Values already present contribute nothing to the returned shift; the
    /// mapping carries the pool index of every requested value either way.
    pub fn add_strings(&mut self, values: &[String]) -> Result<(BTreeMap<String, u32>, SizeShift), PatchError>
    {
        let canonical: BTreeSet<&String> = values.iter().collect();

        let mut ids = BTreeMap::new();
        let mut shift: SizeShift = 0;

        for value in canonical
        {
            let result = self.dex.intern_string(value)?;
            if result.kind == InternKind::New
            {
                shift += pool_growth(value);
                info!("added string {:?} at pool index {}", value, result.index);
            }
            ids.insert(value.clone(), result.index);
        }

        self.dex.save(self.output_path)?;
        self.integrity.refresh_signature(self.output_path).map_err(PatchError::Integrity)?;
        self.integrity.refresh_checksum(self.output_path).map_err(PatchError::Integrity)?;

        Ok((ids, shift))
    }
}

/// Bytes the container grows by for one newly interned value: a string_id
/// slot plus the framed string data (length prefix, MUTF-8 bytes,
/// terminator).
fn pool_growth(value: &str) -> SizeShift
{
    4 + DexString::from_string(value).encoded_len() as SizeShift
}
