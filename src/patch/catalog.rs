//! The method inventory.
//!
//! A [`MethodRecord`] ties together the three facts the patch engine needs
//! about a method: which identity-table slot it occupies, where its code item
//! sits in the file, and what its instruction stream looked like when the
//! inventory was taken. None of these are stored together in the container,
//! so the inventory is reconstructed by joining three structural views on the
//! code offset and the identity-table offset.
//!
//! The bytecode field is a snapshot: it is never re-read, and the offset is
//! only as fresh as the last [`crate::patch::offsets::apply`] call after a
//! pool growth.

use crate::dex::dex_file::{DexFile, Header};
use crate::dex::error::DexError;
use std::collections::HashMap;

/// Width of one method_id_item in the identity table.
const METHOD_ID_SIZE: u32 = 8;

#[derive(Debug, Clone)]
pub struct MethodRecord
{
    pub method_idx: u32,
    pub offset: u32,
    pub name: String,
    pub bytecode: Vec<u8>,
}

/// Start of the method_ids section, derived from the header's section sizes.
fn method_ids_start(header: &Header) -> u32
{
    header.header_size
        + header.string_ids_size * 4
        + header.type_ids_size * 4
        + header.proto_ids_size * 12
        + header.field_ids_size * 8
}

/// Map each method's code offset to the file offset of its identity-table
/// entry. Entries encode their method_idx as a delta against the previous
/// entry of the same list, so indices are accumulated per list; methods
/// without a code body (abstract, native) carry a zero code offset and are
/// skipped.
fn identity_offsets(dex: &DexFile) -> HashMap<u32, u32>
{
    let start = method_ids_start(&dex.header);
    let mut mapping = HashMap::new();

    for class in &dex.class_defs
    {
        let class_data = match &class.class_data
        {
            Some(cd) => cd,
            None => continue,
        };

        for list in [&class_data.direct_methods, &class_data.virtual_methods]
        {
            let mut method_idx: u32 = 0;
            for (i, entry) in list.iter().enumerate()
            {
                if i == 0 { method_idx = entry.method_idx_diff; }
                else { method_idx += entry.method_idx_diff; }

                if entry.code_off != 0
                {
                    mapping.insert(entry.code_off, start + method_idx * METHOD_ID_SIZE);
                }
            }
        }
    }

    mapping
}

/// Map each code offset to the raw instruction stream at that offset.
fn bytecode_offsets(dex: &DexFile) -> HashMap<u32, Vec<u8>>
{
    let mut mapping = HashMap::new();
    for code in &dex.code_list
    {
        mapping.insert(code.offset, code.insns_bytes());
    }
    mapping
}

/// Map each identity-table entry offset to the method's name.
fn method_names(dex: &DexFile) -> Result<HashMap<u32, String>, DexError>
{
    let start = method_ids_start(&dex.header);
    let mut mapping = HashMap::new();
    for (i, method) in dex.methods.iter().enumerate()
    {
        let name = dex.string_value(method.name_idx)
            .map_err(|e| DexError::with_context(e, format!("name of method_id #{}", i)))?;
        mapping.insert(start + i as u32 * METHOD_ID_SIZE, name);
    }
    Ok(mapping)
}

/// Build one record per method that has a code body, joining the identity,
/// bytecode and name views. A code offset in the identity view with no code
/// item behind it means the container is structurally inconsistent, which is
/// fatal. Records come back sorted by file offset so runs are deterministic.
pub fn build_catalog(dex: &DexFile) -> Result<Vec<MethodRecord>, DexError>
{
    let start = method_ids_start(&dex.header);
    let identity = identity_offsets(dex);
    let bytecode = bytecode_offsets(dex);
    let names = method_names(dex)?;

    let mut records = Vec::with_capacity(identity.len());
    for (&code_off, &id_off) in &identity
    {
        let bc = bytecode.get(&code_off)
            .ok_or_else(|| DexError::new(&format!("method code offset 0x{:x} has no code item", code_off)))?;
        let name = names.get(&id_off)
            .ok_or_else(|| DexError::new(&format!("identity table offset 0x{:x} is out of range", id_off)))?;

        records.push(MethodRecord {
            method_idx: (id_off - start) / METHOD_ID_SIZE,
            offset: code_off,
            name: name.clone(),
            bytecode: bc.clone(),
        });
    }

    records.sort_by_key(|r| r.offset);
    Ok(records)
}
