use crate::dex::error::DexError;
use std::fmt;
use std::io;
use std::path::PathBuf;

/// Failures raised by the patch engine.
///
/// `FileAccess` is the one recoverable case: the copy file could not be
/// opened for a byte-level patch, so that single patch is skipped and the run
/// carries on. Everything else either aborts the helper being processed
/// (`MalformedPayload`, `EmptyKey`, `StringIdOverflow`) or the whole run
/// (`Io`, `Container`, `Integrity`), depending on where the caller sits.
#[derive(Debug)]
pub enum PatchError
{
    FileAccess { path: PathBuf, source: io::Error },
    MalformedPayload(String),
    EmptyKey,
    StringIdOverflow(u32),
    Io(io::Error),
    Container(DexError),
    Integrity(DexError),
}

impl fmt::Display for PatchError
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self
        {
            PatchError::FileAccess { path, source } =>
                write!(f, "cannot open {} for patching: {}", path.display(), source),
            PatchError::MalformedPayload(what) =>
                write!(f, "malformed obfuscated payload: {}", what),
            PatchError::EmptyKey =>
                write!(f, "obfuscated payload carries an empty key"),
            PatchError::StringIdOverflow(id) =>
                write!(f, "string pool index {} does not fit a const-string operand", id),
            PatchError::Io(e) =>
                write!(f, "io error: {}", e),
            PatchError::Container(e) =>
                write!(f, "container error: {}", e),
            PatchError::Integrity(e) =>
                write!(f, "integrity refresh failed: {}", e),
        }
    }
}

impl std::error::Error for PatchError
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)>
    {
        match self
        {
            PatchError::FileAccess { source, .. } => Some(source),
            PatchError::Io(e) => Some(e),
            PatchError::Container(e) | PatchError::Integrity(e) => Some(e),
            _ => None,
        }
    }
}

impl From<DexError> for PatchError
{
    fn from(e: DexError) -> Self
    {
        PatchError::Container(e)
    }
}

impl From<io::Error> for PatchError
{
    fn from(e: io::Error) -> Self
    {
        PatchError::Io(e)
    }
}
