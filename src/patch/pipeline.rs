//! The end-to-end deobfuscation workflow.
//!
//! The flow is a straight line: locate the obfuscated helper methods, locate
//! their callers, pull the hidden payload out of each helper and decode it,
//! intern every decoded string in one batch, push the resulting size shift
//! into the cached offsets, and overwrite each caller's code body so it
//! returns the decoded string directly. The copy file on disk is the only
//! output; the input container is never written back.

use crate::dex::dex_file::DexFile;
use crate::dex::integrity::IntegrityService;
use crate::patch::catalog::{build_catalog, MethodRecord};
use crate::patch::error::PatchError;
use crate::patch::offsets;
use crate::patch::pattern::{self, BytePattern};
use crate::patch::rewrite;
use crate::patch::strings::StringTablePatcher;
use log::{error, info, warn};
use once_cell::sync::Lazy;
use std::path::{Path, PathBuf};

/// Bytes of a code_item before its instruction stream begins.
const CODE_ITEM_HEADER_SIZE: usize = 16;

/// Ciphertext and key pulled out of one helper's code body.
pub struct ObfuscatedPayload
{
    pub ciphertext: Vec<u8>,
    pub key: Vec<u8>,
}

/// One deobfuscation scheme: how to recognise the helper methods, how to
/// recognise their call sites, how to pull the hidden payload out of a
/// helper body, and what to overwrite a call site with.
pub trait DeobfuscationRule
{
    fn name(&self) -> &'static str;

    /// Pattern identifying an obfuscated helper's code body.
    fn helper_pattern(&self) -> &BytePattern;

    /// Call-site template; its placeholder takes the helper's method_idx.
    fn call_site_pattern(&self) -> &BytePattern;

    /// Pull ciphertext and key out of a helper's bytecode.
    fn extract(&self, bytecode: &[u8]) -> Result<ObfuscatedPayload, PatchError>;

    /// Replacement code item returning the pool string at `string_id`.
    fn rewrite(&self, string_id: u16) -> Vec<u8>;
}

/// fill-array-data payload marker, doubling as the segment separator.
const ARRAY_MARKER: &[u8] = &[0x03, 0x01, 0x00];

static HELPER_SIGNATURE: Lazy<BytePattern> = Lazy::new(|| {
    BytePattern::new().lit(&[
        0xdf, 0x04, 0x04, 0x01, 0xb0, 0x4b, 0xb4, 0x11, 0xb0, 0x1b,
        0x97, 0x01, 0x0b, 0x08, 0x8d, 0x11, 0x4f, 0x01, 0x05, 0x07,
    ])
});

static CALL_SITE: Lazy<BytePattern> = Lazy::new(|| {
    // invoke-static {}, method@idx; move-result-object v0; return-object v0
    BytePattern::new()
        .lit(&[0x71, 0x00])
        .index_u16()
        .lit(&[0x00, 0x00, 0x0c, 0x00, 0x11, 0x00])
});

static PAYLOAD: Lazy<BytePattern> = Lazy::new(|| {
    BytePattern::new().lit(ARRAY_MARKER).capture_rest()
});

/// code_item header declaring one register, one in-arg, no outs, no tries
/// and three instruction code units, followed below by const-string plus
/// return-object.
const PATCH_PREFACE: [u8; CODE_ITEM_HEADER_SIZE] = [
    0x01, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x03, 0x00, 0x00, 0x00,
];

/// The known XOR string-obfuscation scheme: a static helper whose body
/// carries ciphertext and key as zero-padded byte arrays behind a shared
/// fill-array-data marker.
pub struct XorStringRule;

impl DeobfuscationRule for XorStringRule
{
    fn name(&self) -> &'static str
    {
        "xor-string"
    }

    fn helper_pattern(&self) -> &BytePattern
    {
        &HELPER_SIGNATURE
    }

    fn call_site_pattern(&self) -> &BytePattern
    {
        &CALL_SITE
    }

    /// The payload follows the first marker and packs, marker-separated, a
    /// framing byte plus the ciphertext and a framing byte plus the key,
    /// both zero-padded at the tail. A ciphertext or key byte run that
    /// collides with the marker itself cannot be told apart from a
    /// separator; such a payload splits into the wrong segments and is
    /// reported as malformed rather than silently misdecoded.
    fn extract(&self, bytecode: &[u8]) -> Result<ObfuscatedPayload, PatchError>
    {
        let payload = PAYLOAD.capture(bytecode)
            .ok_or_else(|| PatchError::MalformedPayload("array marker not found".to_string()))?;

        let segments = pattern::split_on(payload, ARRAY_MARKER);
        if segments.len() < 2
        {
            return Err(PatchError::MalformedPayload(
                format!("expected ciphertext and key segments, found {}", segments.len())));
        }

        Ok(ObfuscatedPayload {
            ciphertext: strip_segment(segments[0])?,
            key: strip_segment(segments[1])?,
        })
    }

    fn rewrite(&self, string_id: u16) -> Vec<u8>
    {
        let mut code = PATCH_PREFACE.to_vec();
        code.extend_from_slice(&[0x1a, 0x00]); // const-string v0, string@id
        code.extend_from_slice(&string_id.to_le_bytes());
        code.extend_from_slice(&[0x11, 0x00]); // return-object v0
        code
    }
}

/// Drop the framing byte, then the trailing zero padding.
fn strip_segment(segment: &[u8]) -> Result<Vec<u8>, PatchError>
{
    if segment.is_empty()
    {
        return Err(PatchError::MalformedPayload("empty payload segment".to_string()));
    }
    let data = &segment[1..];
    let end = data.iter().rposition(|&b| b != 0).map(|p| p + 1).unwrap_or(0);
    Ok(data[..end].to_vec())
}

/// Reverse the obfuscation: `decoded[i] = ciphertext[i] ^ key[i % key.len()]`.
/// An empty key makes the cycle undefined and is an explicit error.
pub fn xor_decode(ciphertext: &[u8], key: &[u8]) -> Result<Vec<u8>, PatchError>
{
    if key.is_empty()
    {
        return Err(PatchError::EmptyKey);
    }
    Ok(ciphertext.iter().enumerate().map(|(i, &b)| b ^ key[i % key.len()]).collect())
}

/// The sibling path the patched copy is written to.
pub fn copy_path(input: &Path) -> PathBuf
{
    let name = input.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "out.dex".to_string());
    input.with_file_name(format!("copy_{}", name))
}

#[derive(Debug)]
pub struct PatchSummary
{
    pub helpers_found: usize,
    pub strings_interned: usize,
    pub callers_patched: usize,
    pub output_path: PathBuf,
}

struct PlannedRewrite
{
    rule: usize,
    caller: usize,
    value: String,
}

pub struct DeobfuscationPipeline<'a>
{
    dex: &'a mut DexFile,
    integrity: &'a dyn IntegrityService,
    catalog: Vec<MethodRecord>,
    output_path: PathBuf,
    rules: Vec<Box<dyn DeobfuscationRule>>,
}

impl<'a> DeobfuscationPipeline<'a>
{
    /// Take the method inventory once, up front, and derive the copy path
    /// from the input path. The input file itself is never modified.
    pub fn new(dex: &'a mut DexFile, input_path: &Path, integrity: &'a dyn IntegrityService) -> Result<DeobfuscationPipeline<'a>, PatchError>
    {
        let catalog = build_catalog(dex)?;
        let output_path = copy_path(input_path);
        Ok(DeobfuscationPipeline { dex, integrity, catalog, output_path, rules: vec![] })
    }

    pub fn with_rule(mut self, rule: Box<dyn DeobfuscationRule>) -> Self
    {
        self.rules.push(rule);
        self
    }

    pub fn output_path(&self) -> &Path
    {
        &self.output_path
    }

    /// Run every rule to completion. The copy file is always produced, even
    /// when nothing matched.
    ///
    /// All rules are planned before anything mutates, then the decoded
    /// strings of every rule go through the pool in a single batch; the one
    /// resulting shift is pushed into the catalog before the first byte-level
    /// rewrite. Interleaving a save between rewrites would throw the earlier
    /// rewrites away, since a save re-emits the in-memory container.
    pub fn run(mut self) -> Result<PatchSummary, PatchError>
    {
        let mut summary = PatchSummary {
            helpers_found: 0,
            strings_interned: 0,
            callers_patched: 0,
            output_path: self.output_path.clone(),
        };

        // 1.-4. Locate helpers and callers, extract and decode, per rule
        let rules = std::mem::take(&mut self.rules);
        let mut plan: Vec<PlannedRewrite> = vec![];
        let mut values: Vec<String> = vec![];
        for (rule_idx, rule) in rules.iter().enumerate()
        {
            self.plan_rule(rule.as_ref(), rule_idx, &mut plan, &mut values, &mut summary);
        }

        // 5. Intern the whole batch and persist the copy. A failed growth
        // poisons every offset computed below, so this is fatal to the run.
        let (ids, shift) = StringTablePatcher::new(self.dex, &self.output_path, self.integrity)
            .add_strings(&values)?;
        summary.strings_interned = ids.len();

        // 6. Every cached offset must absorb the growth before any rewrite
        offsets::apply(&mut self.catalog, shift);

        // 7. Rewrite each caller to return its helper's decoded string
        for item in plan
        {
            let rule = rules[item.rule].as_ref();
            let record = &self.catalog[item.caller];
            let string_id = ids[&item.value];
            if string_id > u16::MAX as u32
            {
                let e = PatchError::StringIdOverflow(string_id);
                warn!("[{}] caller {} skipped: {}", rule.name(), record.name, e);
                continue;
            }

            let code = rule.rewrite(string_id as u16);
            if code.len() > CODE_ITEM_HEADER_SIZE + record.bytecode.len()
            {
                warn!("[{}] replacement code ({} bytes) exceeds the span of caller {}, skipped",
                    rule.name(), code.len(), record.name);
                continue;
            }

            match rewrite::patch_method(&self.output_path, record.offset, &code, self.integrity)
            {
                Ok(()) =>
                {
                    info!("[{}] patched caller {} at 0x{:x}", rule.name(), record.name, record.offset);
                    summary.callers_patched += 1;
                }
                Err(PatchError::FileAccess { path, source }) =>
                {
                    error!("[{}] cannot open {} for patching: {}", rule.name(), path.display(), source);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(summary)
    }

    /// Steps 1-4 for one rule. Failures are local to the helper being
    /// examined; unrelated helpers still get planned.
    fn plan_rule(
        &self,
        rule: &dyn DeobfuscationRule,
        rule_idx: usize,
        plan: &mut Vec<PlannedRewrite>,
        values: &mut Vec<String>,
        summary: &mut PatchSummary,
    )
    {
        let helpers = pattern::find_methods(&self.catalog, &rule.helper_pattern().as_bytes());
        info!("[{}] {} helper methods found", rule.name(), helpers.len());
        summary.helpers_found += helpers.len();

        for &helper in &helpers
        {
            let record = &self.catalog[helper];

            let method_idx = match u16::try_from(record.method_idx)
            {
                Ok(idx) => idx,
                Err(_) =>
                {
                    warn!("[{}] helper {} has method_idx {} past the call-site operand range, skipped",
                        rule.name(), record.name, record.method_idx);
                    continue;
                }
            };
            let callers = pattern::find_methods(&self.catalog, &rule.call_site_pattern().resolve(method_idx));

            let payload = match rule.extract(&record.bytecode)
            {
                Ok(p) => p,
                Err(e) =>
                {
                    warn!("[{}] helper {} skipped: {}", rule.name(), record.name, e);
                    continue;
                }
            };
            let decoded = match xor_decode(&payload.ciphertext, &payload.key)
            {
                Ok(d) => d,
                Err(e) =>
                {
                    warn!("[{}] helper {} skipped: {}", rule.name(), record.name, e);
                    continue;
                }
            };
            let value = match String::from_utf8(decoded)
            {
                Ok(v) => v,
                Err(_) =>
                {
                    warn!("[{}] helper {} decodes to non-UTF-8 data, skipped", rule.name(), record.name);
                    continue;
                }
            };

            info!("[{}] helper {} decodes to {:?}, {} caller(s)",
                rule.name(), record.name, value, callers.len());

            values.push(value.clone());
            for caller in callers
            {
                plan.push(PlannedRewrite { rule: rule_idx, caller, value: value.clone() });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn xor_decode_round_trip()
    {
        let mut rng = rand::thread_rng();
        let key: Vec<u8> = (0..rng.gen_range(1..9)).map(|_| rng.gen()).collect();
        let plain: Vec<u8> = (0..64).map(|_| rng.gen()).collect();

        let encoded = xor_decode(&plain, &key).unwrap();
        let decoded = xor_decode(&encoded, &key).unwrap();
        assert_eq!(decoded, plain);
    }

    #[test]
    fn xor_decode_cycles_short_keys()
    {
        let decoded = xor_decode(&[0x41, 0x42, 0x43], &[0x01]).unwrap();
        assert_eq!(decoded, vec![0x40, 0x43, 0x42]);
    }

    #[test]
    fn xor_decode_rejects_empty_key()
    {
        assert!(matches!(xor_decode(&[0x41], &[]), Err(PatchError::EmptyKey)));
    }

    #[test]
    fn extract_splits_ciphertext_and_key()
    {
        // signature, then marker / framed ciphertext / marker / framed key
        let mut bytecode = HELPER_SIGNATURE.as_bytes();
        bytecode.extend_from_slice(ARRAY_MARKER);
        bytecode.extend_from_slice(&[0x02, 0x41, 0x43, 0x00, 0x00]);
        bytecode.extend_from_slice(ARRAY_MARKER);
        bytecode.extend_from_slice(&[0x01, 0x02, 0x00, 0x00]);

        let payload = XorStringRule.extract(&bytecode).expect("payload extracts");
        assert_eq!(payload.ciphertext, vec![0x41, 0x43]);
        assert_eq!(payload.key, vec![0x02]);
    }

    #[test]
    fn extract_keeps_embedded_zero_bytes()
    {
        let mut bytecode = HELPER_SIGNATURE.as_bytes();
        bytecode.extend_from_slice(ARRAY_MARKER);
        bytecode.extend_from_slice(&[0x04, 0x41, 0x00, 0x42, 0x00]);
        bytecode.extend_from_slice(ARRAY_MARKER);
        bytecode.extend_from_slice(&[0x01, 0x07, 0x00]);

        let payload = XorStringRule.extract(&bytecode).expect("payload extracts");
        assert_eq!(payload.ciphertext, vec![0x41, 0x00, 0x42]);
    }

    #[test]
    fn extract_without_marker_is_malformed()
    {
        let bytecode = HELPER_SIGNATURE.as_bytes();
        assert!(matches!(
            XorStringRule.extract(&bytecode),
            Err(PatchError::MalformedPayload(_))
        ));
    }

    #[test]
    fn rewrite_emits_preface_and_return_string_pair()
    {
        let code = XorStringRule.rewrite(0x0104);
        assert_eq!(code.len(), 22);
        assert_eq!(&code[..16], &PATCH_PREFACE);
        assert_eq!(&code[16..], &[0x1a, 0x00, 0x04, 0x01, 0x11, 0x00]);
    }

    #[test]
    fn copy_path_prefixes_the_file_name()
    {
        let p = copy_path(Path::new("/tmp/work/classes.dex"));
        assert_eq!(p, PathBuf::from("/tmp/work/copy_classes.dex"));
    }
}
