use super::fixtures::{sample_dex, units, helper_bytecode};
use crate::dex::dex_file::{DexFile, DexString, InternKind};
use crate::patch::catalog::build_catalog;

#[test]
fn emit_then_parse_is_stable()
{
    let dex = sample_dex();
    let bytes = dex.to_bytes().expect("emit");

    let reparsed = DexFile::from_bytes(&bytes).expect("parse own output");
    assert_eq!(reparsed.strings.len(), 4);
    assert_eq!(reparsed.types.len(), 2);
    assert_eq!(reparsed.methods.len(), 2);
    assert_eq!(reparsed.class_defs.len(), 1);
    assert_eq!(reparsed.code_list.len(), 2);
    assert_eq!(reparsed.code_list[0].insns, units(&helper_bytecode()));

    // Canonical layout is deterministic, so a second emit is byte-identical
    let bytes2 = reparsed.to_bytes().expect("emit again");
    assert_eq!(bytes, bytes2);
}

#[test]
fn parse_resolves_method_names()
{
    let dex = sample_dex();
    let bytes = dex.to_bytes().expect("emit");
    let reparsed = DexFile::from_bytes(&bytes).expect("parse");

    assert_eq!(reparsed.string_value(reparsed.methods[0].name_idx).unwrap(), "decode");
    assert_eq!(reparsed.string_value(reparsed.methods[1].name_idx).unwrap(), "fetch");
}

#[test]
fn intern_new_string_grows_by_exact_byte_count()
{
    let mut dex = sample_dex();
    let before = dex.to_bytes().expect("emit").len();
    let code_offsets_before: Vec<u32> = dex.code_list.iter().map(|c| c.offset).collect();

    let result = dex.intern_string("@").expect("intern");
    assert_eq!(result.kind, InternKind::New);
    assert_eq!(result.index, 4);

    // 4-byte id slot + 3 bytes of framed data
    let after = dex.to_bytes().expect("emit").len();
    assert_eq!(after, before + 7);

    // every code item sits exactly 7 bytes further down
    for (code, old) in dex.code_list.iter().zip(code_offsets_before)
    {
        assert_eq!(code.offset, old + 7);
    }
}

#[test]
fn intern_existing_string_changes_nothing()
{
    let mut dex = sample_dex();
    let before = dex.to_bytes().expect("emit");

    let result = dex.intern_string("decode").expect("intern");
    assert_eq!(result.kind, InternKind::AlreadyPresent);
    assert_eq!(result.index, 2);

    let after = dex.to_bytes().expect("emit");
    assert_eq!(before, after);
}

#[test]
fn intern_twice_reports_already_present()
{
    let mut dex = sample_dex();
    assert_eq!(dex.intern_string("secret").unwrap().kind, InternKind::New);
    let second = dex.intern_string("secret").unwrap();
    assert_eq!(second.kind, InternKind::AlreadyPresent);
    assert_eq!(second.index, 4);
}

#[test]
fn grown_container_still_parses()
{
    let mut dex = sample_dex();
    dex.intern_string("@").expect("intern");

    let bytes = dex.to_bytes().expect("emit");
    let reparsed = DexFile::from_bytes(&bytes).expect("parse grown container");

    assert_eq!(reparsed.strings.len(), 5);
    let appended = &reparsed.strings[4].value;
    assert_eq!(appended, &DexString::from_string("@"));
    // pre-existing pool indices are untouched by the append
    assert_eq!(reparsed.string_value(2).unwrap(), "decode");
}

#[test]
fn catalog_joins_identity_bytecode_and_names()
{
    let dex = sample_dex();
    let catalog = build_catalog(&dex).expect("catalog");

    assert_eq!(catalog.len(), 2);
    // sorted by file offset: the helper's code item is laid out first
    assert_eq!(catalog[0].name, "decode");
    assert_eq!(catalog[0].method_idx, 0);
    assert_eq!(catalog[0].bytecode, helper_bytecode());
    assert_eq!(catalog[1].name, "fetch");
    assert_eq!(catalog[1].method_idx, 1);
    assert!(catalog[0].offset < catalog[1].offset);
    assert_eq!(catalog[0].offset, dex.code_list[0].offset);
}

#[test]
fn catalog_excludes_methods_without_code()
{
    let mut dex = sample_dex();
    // turn the caller abstract: no code body, no file offset to report
    {
        let cd = dex.class_defs[0].class_data.as_mut().unwrap();
        cd.direct_methods[1].code_off = 0;
    }
    dex.code_list.pop();

    let catalog = build_catalog(&dex).expect("catalog");
    assert_eq!(catalog.len(), 1);
    assert_eq!(catalog[0].name, "decode");
}

#[test]
fn catalog_rejects_dangling_code_offset()
{
    let mut dex = sample_dex();
    // identity view points at a code offset with no code item behind it
    dex.code_list.pop();

    assert!(build_catalog(&dex).is_err());
}
