use super::fixtures::{sample_dex, temp_path, NoopIntegrity};
use crate::dex::dex_file::DexFile;
use crate::patch::strings::StringTablePatcher;
use std::fs;

#[test]
fn fully_present_batch_reports_zero_shift_and_existing_offsets()
{
    let mut dex = sample_dex();
    let out = temp_path("present-batch.dex");

    let values = vec!["decode".to_string(), "V".to_string()];
    let (ids, shift) = StringTablePatcher::new(&mut dex, &out, &NoopIntegrity)
        .add_strings(&values)
        .expect("add_strings");

    assert_eq!(shift, 0);
    assert_eq!(ids["decode"], 2);
    assert_eq!(ids["V"], 1);

    let _ = fs::remove_file(&out);
}

#[test]
fn input_order_does_not_change_the_result()
{
    let out_a = temp_path("order-a.dex");
    let out_b = temp_path("order-b.dex");

    let mut dex_a = sample_dex();
    let (ids_a, shift_a) = StringTablePatcher::new(&mut dex_a, &out_a, &NoopIntegrity)
        .add_strings(&["alpha".to_string(), "beta".to_string()])
        .expect("add_strings");

    let mut dex_b = sample_dex();
    let (ids_b, shift_b) = StringTablePatcher::new(&mut dex_b, &out_b, &NoopIntegrity)
        .add_strings(&["beta".to_string(), "alpha".to_string()])
        .expect("add_strings");

    assert_eq!(ids_a, ids_b);
    assert_eq!(shift_a, shift_b);
    assert_eq!(fs::read(&out_a).unwrap(), fs::read(&out_b).unwrap());

    let _ = fs::remove_file(&out_a);
    let _ = fs::remove_file(&out_b);
}

#[test]
fn duplicates_in_the_batch_are_interned_once()
{
    let mut dex = sample_dex();
    let out = temp_path("dupes.dex");

    let values = vec!["secret".to_string(), "secret".to_string()];
    let (ids, shift) = StringTablePatcher::new(&mut dex, &out, &NoopIntegrity)
        .add_strings(&values)
        .expect("add_strings");

    // one id slot + length byte + 6 data bytes + terminator
    assert_eq!(shift, 12);
    assert_eq!(ids.len(), 1);
    assert_eq!(dex.strings.len(), 5);

    let _ = fs::remove_file(&out);
}

#[test]
fn mixed_batch_counts_only_new_values()
{
    let mut dex = sample_dex();
    let out = temp_path("mixed.dex");

    let values = vec!["@".to_string(), "decode".to_string()];
    let (ids, shift) = StringTablePatcher::new(&mut dex, &out, &NoopIntegrity)
        .add_strings(&values)
        .expect("add_strings");

    assert_eq!(shift, 7);
    assert_eq!(ids["@"], 4);
    assert_eq!(ids["decode"], 2);

    let _ = fs::remove_file(&out);
}

#[test]
fn persisted_copy_parses_and_carries_the_new_strings()
{
    let mut dex = sample_dex();
    let out = temp_path("persisted.dex");

    StringTablePatcher::new(&mut dex, &out, &NoopIntegrity)
        .add_strings(&["secret".to_string()])
        .expect("add_strings");

    let copy = DexFile::from_file(&out).expect("copy parses");
    assert_eq!(copy.string_value(4).unwrap(), "secret");

    let _ = fs::remove_file(&out);
}
