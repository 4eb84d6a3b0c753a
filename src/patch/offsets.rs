//! Propagating pool growth to cached file offsets.
//!
//! Every record offset handed out by the catalog is only valid for the
//! container layout it was taken from. Once the string pool grows, the real
//! positions move and the records go stale until the shift is applied here.
//! The ordering is global: apply exactly once per growth event, after the
//! growth and before any byte-level write that uses the offsets. Applying
//! the same non-zero shift twice is a caller error and is not detected.

use crate::patch::catalog::MethodRecord;
use crate::patch::strings::SizeShift;

/// Add `shift` to every record's file offset, in place. A zero shift leaves
/// the records untouched.
pub fn apply(methods: &mut [MethodRecord], shift: SizeShift)
{
    if shift == 0 { return; }

    for method in methods
    {
        method.offset = (i64::from(method.offset) + shift) as u32;
    }
}
