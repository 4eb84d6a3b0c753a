//! Recomputation of the header integrity fields.
//!
//! A DEX header carries a SHA-1 signature over bytes `[32..]` and an Adler-32
//! checksum over bytes `[12..]`; the checksum covers the signature, so the
//! signature must be refreshed first. Both operations are idempotent and must
//! run after every structural save and after every raw byte patch.

use crate::dex::dex_file::HEADER_SIZE;
use crate::dex::error::DexError;
use adler::adler32_slice;
use sha1::{Digest, Sha1};
use std::fs;
use std::path::Path;

/// The integrity collaborator, injected wherever a mutation needs a follow-up
/// refresh so tests can substitute a stub.
pub trait IntegrityService
{
    fn refresh_signature(&self, path: &Path) -> Result<(), DexError>;
    fn refresh_checksum(&self, path: &Path) -> Result<(), DexError>;
}

/// Production implementation operating on the file at `path`.
pub struct DexIntegrity;

impl IntegrityService for DexIntegrity
{
    fn refresh_signature(&self, path: &Path) -> Result<(), DexError>
    {
        let mut file = fs::read(path)?;
        if file.len() < HEADER_SIZE as usize
        {
            fail!("file too short for a DEX header: {}", path.display());
        }
        let signature = compute_sha1(&file[32..]);
        file[12..32].copy_from_slice(&signature);
        fs::write(path, file)?;
        Ok(())
    }

    fn refresh_checksum(&self, path: &Path) -> Result<(), DexError>
    {
        let mut file = fs::read(path)?;
        if file.len() < HEADER_SIZE as usize
        {
            fail!("file too short for a DEX header: {}", path.display());
        }
        let checksum = adler32_slice(&file[12..]);
        file[8..12].copy_from_slice(&checksum.to_le_bytes());
        fs::write(path, file)?;
        Ok(())
    }
}

fn compute_sha1(data: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    let digest = hasher.finalize();
    let mut out = [0u8; 20];
    out.copy_from_slice(&digest);
    out
}
