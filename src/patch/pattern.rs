//! Byte-level pattern matching over raw instruction streams.
//!
//! This is deliberately not a regular-expression engine. The patch engine
//! only ever needs three shapes: an exact byte subsequence, the same with a
//! 2-byte little-endian value substituted in before the search (a call-site
//! template takes the target's method_idx), and "everything after a fixed
//! marker" for payloads whose length is not otherwise known. A
//! [`BytePattern`] is an ordered list of those segments.

use crate::patch::catalog::MethodRecord;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment
{
    /// A literal byte run.
    Literal(Vec<u8>),
    /// A 2-byte little-endian value filled in by [`BytePattern::resolve`].
    IndexU16,
    /// Capture every byte from here to the end of the buffer. At most one,
    /// in the final position.
    CaptureToEnd,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BytePattern
{
    segments: Vec<Segment>,
}

impl BytePattern
{
    pub fn new() -> BytePattern
    {
        BytePattern { segments: vec![] }
    }

    pub fn lit(mut self, bytes: &[u8]) -> BytePattern
    {
        self.segments.push(Segment::Literal(bytes.to_vec()));
        self
    }

    pub fn index_u16(mut self) -> BytePattern
    {
        self.segments.push(Segment::IndexU16);
        self
    }

    pub fn capture_rest(mut self) -> BytePattern
    {
        self.segments.push(Segment::CaptureToEnd);
        self
    }

    /// Concrete needle bytes with every `IndexU16` placeholder substituted
    /// with `index`, little-endian. A trailing capture segment contributes
    /// nothing; it only matters to [`BytePattern::capture`].
    pub fn resolve(&self, index: u16) -> Vec<u8>
    {
        let mut needle = vec![];
        for segment in &self.segments
        {
            match segment
            {
                Segment::Literal(bytes) => needle.extend_from_slice(bytes),
                Segment::IndexU16 => needle.extend_from_slice(&index.to_le_bytes()),
                Segment::CaptureToEnd => {}
            }
        }
        needle
    }

    /// Needle bytes of a pattern without placeholders.
    pub fn as_bytes(&self) -> Vec<u8>
    {
        self.resolve(0)
    }

    /// Anchor on the pattern's literal prefix and return everything after
    /// the first occurrence, to the end of the buffer. `None` when the
    /// anchor does not occur.
    pub fn capture<'a>(&self, buffer: &'a [u8]) -> Option<&'a [u8]>
    {
        let anchor = self.as_bytes();
        capture_to_end(buffer, &anchor)
    }
}

impl Default for BytePattern
{
    fn default() -> Self
    {
        BytePattern::new()
    }
}

/// Exact byte-subsequence containment.
pub fn contains(haystack: &[u8], needle: &[u8]) -> bool
{
    find(haystack, needle).is_some()
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize>
{
    if needle.is_empty() || needle.len() > haystack.len() { return None; }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Every byte following the first occurrence of `anchor`, to the end of the
/// buffer.
pub fn capture_to_end<'a>(buffer: &'a [u8], anchor: &[u8]) -> Option<&'a [u8]>
{
    find(buffer, anchor).map(|pos| &buffer[pos + anchor.len()..])
}

/// Indices of the records whose bytecode contains `needle`. No match is an
/// empty list, never an error.
pub fn find_methods(methods: &[MethodRecord], needle: &[u8]) -> Vec<usize>
{
    methods.iter()
        .enumerate()
        .filter(|(_, m)| contains(&m.bytecode, needle))
        .map(|(i, _)| i)
        .collect()
}

/// Split `buffer` on every occurrence of `separator`.
pub fn split_on<'a>(buffer: &'a [u8], separator: &[u8]) -> Vec<&'a [u8]>
{
    let mut parts = vec![];
    let mut rest = buffer;
    while let Some(pos) = find(rest, separator)
    {
        parts.push(&rest[..pos]);
        rest = &rest[pos + separator.len()..];
    }
    parts.push(rest);
    parts
}
