//! Raw byte-level patching of the persisted copy.

use crate::dex::integrity::IntegrityService;
use crate::patch::error::PatchError;
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

/// Overwrite `new_bytecode` at `file_offset` in the copy file, then refresh
/// its integrity fields.
///
/// The caller must ensure the new bytes do not exceed the byte span of the
/// code item originally at that offset, or whatever follows it is corrupted;
/// this is not validated here. A copy that cannot be opened is reported as
/// the recoverable [`PatchError::FileAccess`] so one failed patch does not
/// end the run; a failed write or integrity refresh is fatal.
pub fn patch_method(path: &Path, file_offset: u32, new_bytecode: &[u8], integrity: &dyn IntegrityService) -> Result<(), PatchError>
{
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| PatchError::FileAccess { path: path.to_path_buf(), source: e })?;

    file.seek(SeekFrom::Start(u64::from(file_offset)))?;
    file.write_all(new_bytecode)?;
    // Handle closed before the refresh re-opens the path
    drop(file);

    integrity.refresh_signature(path).map_err(PatchError::Integrity)?;
    integrity.refresh_checksum(path).map_err(PatchError::Integrity)?;

    Ok(())
}
