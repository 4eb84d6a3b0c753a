use super::fixtures::{sample_dex, sample_dex_with_caller, temp_path};
use crate::dex::dex_file::{DexFile, DexString};
use crate::dex::integrity::{DexIntegrity, IntegrityService};
use crate::patch::catalog::build_catalog;
use crate::patch::pipeline::{DeobfuscationPipeline, XorStringRule};
use std::fs;

#[test]
fn end_to_end_deobfuscation_rewrites_the_caller()
{
    let input = temp_path("e2e-input.dex");
    sample_dex().save(&input).expect("write input");
    DexIntegrity.refresh_signature(&input).expect("sign input");
    DexIntegrity.refresh_checksum(&input).expect("checksum input");
    let original_bytes = fs::read(&input).expect("read input");

    // load from disk like the tool does and capture the caller's offset as
    // of catalog construction, before any pool growth
    let mut dex = DexFile::from_file(&input).expect("parse input");
    let catalog = build_catalog(&dex).expect("catalog");
    let caller_offset = catalog.iter().find(|m| m.name == "fetch").expect("caller present").offset;

    let integrity = DexIntegrity;
    let summary = DeobfuscationPipeline::new(&mut dex, &input, &integrity)
        .expect("pipeline")
        .with_rule(Box::new(XorStringRule))
        .run()
        .expect("run");

    assert_eq!(summary.helpers_found, 1);
    assert_eq!(summary.strings_interned, 1);
    assert_eq!(summary.callers_patched, 1);
    assert!(summary.output_path.file_name().unwrap().to_string_lossy().starts_with("copy_"));

    // the input file is untouched
    assert_eq!(fs::read(&input).unwrap(), original_bytes);

    // (a) the copy's pool gained the decoded string: 0x41 XOR 0x01 = "@"
    let copy = DexFile::from_file(&summary.output_path).expect("copy parses");
    let decoded_index = copy.strings.iter()
        .position(|s| s.value == DexString::from_string("@"))
        .expect("decoded string present") as u16;

    // (b) the caller's code body at its shift-corrected offset is the fixed
    // preface plus const-string/return-object pair referencing that string
    let copy_bytes = fs::read(&summary.output_path).expect("read copy");
    let corrected = caller_offset as usize + 7;
    let mut expected = vec![
        0x01, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x03, 0x00, 0x00, 0x00,
        0x1a, 0x00,
    ];
    expected.extend_from_slice(&decoded_index.to_le_bytes());
    expected.extend_from_slice(&[0x11, 0x00]);
    assert_eq!(&copy_bytes[corrected..corrected + expected.len()], &expected[..]);

    // (c) the copy's checksum differs from the input's
    assert_ne!(copy_bytes[8..12], original_bytes[8..12]);

    let _ = fs::remove_file(&input);
    let _ = fs::remove_file(&summary.output_path);
}

#[test]
fn helper_with_no_callers_still_produces_a_copy()
{
    let input = temp_path("no-callers.dex");
    // the caller method carries unrelated instructions: return-void
    sample_dex_with_caller(vec![0x0e, 0x00]).save(&input).expect("write input");
    DexIntegrity.refresh_signature(&input).expect("sign input");
    DexIntegrity.refresh_checksum(&input).expect("checksum input");

    let mut dex = DexFile::from_file(&input).expect("parse input");
    let integrity = DexIntegrity;
    let summary = DeobfuscationPipeline::new(&mut dex, &input, &integrity)
        .expect("pipeline")
        .with_rule(Box::new(XorStringRule))
        .run()
        .expect("run");

    assert_eq!(summary.helpers_found, 1);
    assert_eq!(summary.strings_interned, 1);
    assert_eq!(summary.callers_patched, 0);

    // the decoded string was still interned and the copy persisted
    let copy = DexFile::from_file(&summary.output_path).expect("copy parses");
    assert!(copy.strings.iter().any(|s| s.value == DexString::from_string("@")));

    let _ = fs::remove_file(&input);
    let _ = fs::remove_file(&summary.output_path);
}

#[test]
fn clean_container_passes_through_unpatched()
{
    let input = temp_path("clean.dex");
    // neither method carries the helper signature
    let mut dex = sample_dex_with_caller(vec![0x0e, 0x00]);
    {
        let helper = &mut dex.code_list[0];
        helper.insns = vec![0x000e]; // return-void
    }
    dex.relayout().expect("layout");
    dex.save(&input).expect("write input");
    DexIntegrity.refresh_signature(&input).expect("sign input");
    DexIntegrity.refresh_checksum(&input).expect("checksum input");

    let mut dex = DexFile::from_file(&input).expect("parse input");
    let integrity = DexIntegrity;
    let summary = DeobfuscationPipeline::new(&mut dex, &input, &integrity)
        .expect("pipeline")
        .with_rule(Box::new(XorStringRule))
        .run()
        .expect("run");

    assert_eq!(summary.helpers_found, 0);
    assert_eq!(summary.callers_patched, 0);
    assert!(summary.output_path.exists());

    let _ = fs::remove_file(&input);
    let _ = fs::remove_file(&summary.output_path);
}

#[test]
fn integrity_fields_match_the_copy_bytes()
{
    let input = temp_path("integrity.dex");
    sample_dex().save(&input).expect("write input");
    DexIntegrity.refresh_signature(&input).expect("sign");
    DexIntegrity.refresh_checksum(&input).expect("checksum");

    // refresh is idempotent: running both again changes nothing
    let first = fs::read(&input).unwrap();
    DexIntegrity.refresh_signature(&input).expect("sign again");
    DexIntegrity.refresh_checksum(&input).expect("checksum again");
    assert_eq!(first, fs::read(&input).unwrap());

    let _ = fs::remove_file(&input);
}
