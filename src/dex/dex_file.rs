/* Dex file format structures */

use crate::dex::error::DexError;
use crate::dex::{read_u1, read_u2, read_u4, read_uleb128, read_sleb128, read_x, write_u1, write_u2, write_u4, write_uleb128, write_sleb128, write_x};
use cesu8::to_java_cesu8;
use log::{error, warn};

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::Path;

/* Constants */
pub const DEX_FILE_MAGIC: [u8; 8] = [ 0x64, 0x65, 0x78, 0x0a, 0x30, 0x33, 0x35, 0x00 ];
pub const ENDIAN_CONSTANT: u32 = 0x12345678;
pub const NO_INDEX: usize = 0xffffffff;
pub const HEADER_SIZE: u32 = 0x70;

/* Access flags */
pub const ACC_PUBLIC: u32 = 0x1;
pub const ACC_STATIC: u32 = 0x8;

/* map_list item type codes */
const TYPE_HEADER_ITEM: u16 = 0x0000;
const TYPE_STRING_ID_ITEM: u16 = 0x0001;
const TYPE_TYPE_ID_ITEM: u16 = 0x0002;
const TYPE_PROTO_ID_ITEM: u16 = 0x0003;
const TYPE_FIELD_ID_ITEM: u16 = 0x0004;
const TYPE_METHOD_ID_ITEM: u16 = 0x0005;
const TYPE_CLASS_DEF_ITEM: u16 = 0x0006;
const TYPE_MAP_LIST: u16 = 0x1000;
const TYPE_TYPE_LIST: u16 = 0x1001;
const TYPE_CLASS_DATA_ITEM: u16 = 0x2000;
const TYPE_CODE_ITEM: u16 = 0x2001;
const TYPE_STRING_DATA_ITEM: u16 = 0x2002;

pub type StringId = usize;
pub type TypeId = StringId;
pub type ProtoId = usize;

fn align4(pos: u32) -> u32
{
    (pos + 3) & !3
}

fn put_bytes(file: &mut [u8], off: usize, bytes: &[u8]) -> Result<(), DexError>
{
    if off + bytes.len() > file.len()
    {
        fail!("write at 0x{:x} overruns the laid-out file size 0x{:x}", off, file.len());
    }
    file[off..off + bytes.len()].copy_from_slice(bytes);
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeList(pub Vec<TypeId>);

impl TypeList
{
    pub fn read(bytes: &[u8], ix: &mut usize) -> Result<TypeList, DexError>
    {
        let mut v = vec![];
        let size = read_u4(bytes, ix)?;
        for _ in 0..size { v.push(read_u2(bytes, ix)? as TypeId); }
        Ok(TypeList(v))
    }

    pub fn write(&self, bytes: &mut Vec<u8>) -> usize
    {
        let mut c = 0;
        c += write_u4(bytes, self.0.len() as u32);
        for i in &self.0 { c += write_u2(bytes, *i as u16); }
        c
    }
}

#[derive(Debug)]
pub struct PrototypeItem {
    pub shorty_idx: StringId,
    pub return_type_idx: TypeId,
    pub parameters: TypeList,
    pub parameters_off: u32,
}

#[derive(Debug, PartialEq, Eq)]
pub struct FieldItem {
    pub class_idx: TypeId,
    pub type_idx: TypeId,
    pub name_idx: StringId,
}

impl FieldItem
{
    pub fn read(bytes: &[u8], ix: &mut usize) -> Result<FieldItem, DexError>
    {
        Ok(FieldItem {
            class_idx: read_u2(bytes, ix)? as TypeId,
            type_idx: read_u2(bytes, ix)? as TypeId,
            name_idx: read_u4(bytes, ix)? as StringId,
        })
    }

    pub fn write(&self, bytes: &mut Vec<u8>) -> usize
    {
        let mut c = 0;
        c += write_u2(bytes, self.class_idx as u16);
        c += write_u2(bytes, self.type_idx as u16);
        c += write_u4(bytes, self.name_idx as u32);
        c
    }
}

/// A method_id_item: the container's identity-table entry for one method.
#[derive(Debug, PartialEq, Eq)]
pub struct MethodItem {
    pub class_idx: TypeId,
    pub proto_idx: ProtoId,
    pub name_idx: StringId,
}

impl MethodItem
{
    pub fn read(bytes: &[u8], ix: &mut usize) -> Result<MethodItem, DexError>
    {
        Ok(MethodItem {
            class_idx: read_u2(bytes, ix)? as TypeId,
            proto_idx: read_u2(bytes, ix)? as ProtoId,
            name_idx: read_u4(bytes, ix)? as StringId,
        })
    }

    pub fn write(&self, bytes: &mut Vec<u8>) -> usize
    {
        let mut c = 0;
        c += write_u2(bytes, self.class_idx as u16);
        c += write_u2(bytes, self.proto_idx as u16);
        c += write_u4(bytes, self.name_idx as u32);
        c
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFieldEntry
{
    pub field_idx_diff: u32,
    pub access_flags: u32,
}

/// One entry of a class's direct or virtual method list, kept exactly as
/// encoded: `method_idx_diff` is a delta against the previous entry of the
/// same list (the first entry carries the absolute index).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassMethodEntry
{
    pub method_idx_diff: u32,
    pub access_flags: u32,
    pub code_off: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassDataItem {
    pub static_fields: Vec<EncodedFieldEntry>,
    pub instance_fields: Vec<EncodedFieldEntry>,
    pub direct_methods: Vec<ClassMethodEntry>,
    pub virtual_methods: Vec<ClassMethodEntry>,
}

impl ClassDataItem
{
    pub fn read(bytes: &[u8], ix: &mut usize) -> Result<ClassDataItem, DexError>
    {
        let static_field_size = read_uleb128(bytes, ix)?;
        let instance_field_size = read_uleb128(bytes, ix)?;
        let direct_method_size = read_uleb128(bytes, ix)?;
        let virtual_method_size = read_uleb128(bytes, ix)?;

        let mut static_fields = vec![];
        let mut instance_fields = vec![];
        let mut direct_methods = vec![];
        let mut virtual_methods = vec![];

        for _ in 0..static_field_size {
            static_fields.push( EncodedFieldEntry { field_idx_diff: read_uleb128(bytes, ix)?, access_flags: read_uleb128(bytes, ix)? } );
        }

        for _ in 0..instance_field_size {
            instance_fields.push( EncodedFieldEntry { field_idx_diff: read_uleb128(bytes, ix)?, access_flags: read_uleb128(bytes, ix)? } );
        }

        for _ in 0..direct_method_size {
            direct_methods.push( ClassMethodEntry {
                method_idx_diff: read_uleb128(bytes, ix)?,
                access_flags: read_uleb128(bytes, ix)?,
                code_off: read_uleb128(bytes, ix)?,
            } );
        }

        for _ in 0..virtual_method_size {
            virtual_methods.push( ClassMethodEntry {
                method_idx_diff: read_uleb128(bytes, ix)?,
                access_flags: read_uleb128(bytes, ix)?,
                code_off: read_uleb128(bytes, ix)?,
            } );
        }

        Ok(ClassDataItem { static_fields, instance_fields, direct_methods, virtual_methods })
    }

    pub fn write(&self, bytes: &mut Vec<u8>) -> usize
    {
        let mut c = 0;
        c += write_uleb128(bytes, self.static_fields.len() as u32);
        c += write_uleb128(bytes, self.instance_fields.len() as u32);
        c += write_uleb128(bytes, self.direct_methods.len() as u32);
        c += write_uleb128(bytes, self.virtual_methods.len() as u32);

        for f in &self.static_fields {
            c += write_uleb128(bytes, f.field_idx_diff);
            c += write_uleb128(bytes, f.access_flags);
        }

        for f in &self.instance_fields {
            c += write_uleb128(bytes, f.field_idx_diff);
            c += write_uleb128(bytes, f.access_flags);
        }

        for m in &self.direct_methods {
            c += write_uleb128(bytes, m.method_idx_diff);
            c += write_uleb128(bytes, m.access_flags);
            c += write_uleb128(bytes, m.code_off);
        }

        for m in &self.virtual_methods {
            c += write_uleb128(bytes, m.method_idx_diff);
            c += write_uleb128(bytes, m.access_flags);
            c += write_uleb128(bytes, m.code_off);
        }

        c
    }

    pub fn byte_len(&self) -> usize
    {
        let mut scratch = vec![];
        self.write(&mut scratch)
    }

    pub fn method_entries(&self) -> impl Iterator<Item = &ClassMethodEntry>
    {
        self.direct_methods.iter().chain(self.virtual_methods.iter())
    }

    fn method_entries_mut(&mut self) -> impl Iterator<Item = &mut ClassMethodEntry>
    {
        self.direct_methods.iter_mut().chain(self.virtual_methods.iter_mut())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedTypeAddrPair {
    pub type_idx: TypeId,
    pub addr: u32,
}

impl EncodedTypeAddrPair {
    pub fn read(bytes: &[u8], ix: &mut usize) -> Result<EncodedTypeAddrPair, DexError> {
        let type_idx = read_uleb128(bytes, ix)? as usize;
        let addr = read_uleb128(bytes, ix)?;
        Ok(EncodedTypeAddrPair { type_idx, addr })
    }

    pub fn write(&self, bytes: &mut Vec<u8>) -> usize {
        let mut c = 0;
        c += write_uleb128(bytes, self.type_idx as u32);
        c += write_uleb128(bytes, self.addr);
        c
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TryItem {
    pub start_addr: u32,
    pub insn_count: u16,
    pub handler_off: u16, // offset (in bytes) into the encoded_catch_handler_list
}

impl TryItem {
    pub fn read(bytes: &[u8], ix: &mut usize) -> Result<TryItem, DexError> {
        Ok(TryItem {
            start_addr: read_u4(bytes, ix)?,
            insn_count: read_u2(bytes, ix)?,
            handler_off: read_u2(bytes, ix)?,
        })
    }

    pub fn write(&self, bytes: &mut Vec<u8>) -> usize {
        let mut c = 0;
        c += write_u4(bytes, self.start_addr);
        c += write_u2(bytes, self.insn_count);
        c += write_u2(bytes, self.handler_off);
        c
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedCatchHandler {
    pub handlers: Vec<EncodedTypeAddrPair>,
    pub catch_all_addr: Option<u32>,
}

impl EncodedCatchHandler {
    pub fn read(bytes: &[u8], ix: &mut usize) -> Result<EncodedCatchHandler, DexError> {
        let size = read_sleb128(bytes, ix)?;
        let count = if size >= 0 { size as usize } else { (-size) as usize };
        let mut pairs = Vec::with_capacity(count);
        for _ in 0..count { pairs.push(EncodedTypeAddrPair::read(bytes, ix)?); }
        let catch_all_addr = if size < 0 { Some(read_uleb128(bytes, ix)?) } else { None };
        Ok(EncodedCatchHandler { handlers: pairs, catch_all_addr })
    }

    pub fn write(&self, bytes: &mut Vec<u8>) -> usize {
        let mut c = 0;
        let size: i32 = if self.catch_all_addr.is_some() { -(self.handlers.len() as i32) } else { self.handlers.len() as i32 };
        c += write_sleb128(bytes, size);
        for p in &self.handlers { c += p.write(bytes); }
        if let Some(addr) = self.catch_all_addr { c += write_uleb128(bytes, addr); }
        c
    }
}

/// A method's code item. `offset` is the item's canonical file offset (see
/// [`DexFile`]); debug info streams are not carried and re-emit with a zero
/// debug_info_off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeItem
{
    pub registers_size: u16,
    pub ins_size: u16,
    pub outs_size: u16,
    pub insns: Vec<u16>,
    pub tries: Vec<TryItem>,
    pub handlers: Vec<EncodedCatchHandler>,
    pub offset: u32,
}

impl CodeItem
{
    pub fn read(bytes: &[u8], ix: &mut usize) -> Result<CodeItem, DexError>
    {
        let registers_size = read_u2(bytes, ix)?;
        let ins_size = read_u2(bytes, ix)?;
        let outs_size = read_u2(bytes, ix)?;
        let tries_size = read_u2(bytes, ix)?;
        let _debug_info_off = read_u4(bytes, ix)?;

        let insns_size = read_u4(bytes, ix)?;
        let mut insns = vec![];
        for _ in 0..insns_size { insns.push(read_u2(bytes, ix)?); }

        let mut tries: Vec<TryItem> = vec![];
        let mut handlers: Vec<EncodedCatchHandler> = vec![];

        if tries_size > 0 {
            // 2-byte padding if there are tries and insns_size is odd
            if (insns_size & 1) != 0 {
                let padding = read_u2(bytes, ix)?;
                if padding != 0 {
                    warn!("[codeitem] non-zero padding 0x{:04x} at 0x{:x}", padding, *ix - 2);
                }
            }
            for _ in 0..tries_size { tries.push(TryItem::read(bytes, ix)?); }
            let handlers_size = read_uleb128(bytes, ix)? as usize;
            if handlers_size > 1_000_000 {
                return Err(DexError::new("encoded_catch_handler_list size is implausibly large"));
            }
            for i in 0..handlers_size {
                let entry_off = *ix;
                let h = EncodedCatchHandler::read(bytes, ix)
                    .map_err(|e| DexError::with_context(e, format!("while reading EncodedCatchHandler #{}/{}", i + 1, handlers_size)))?;
                if *ix <= entry_off {
                    return Err(DexError::new("EncodedCatchHandler did not advance cursor (corrupt data)"));
                }
                handlers.push(h);
            }
        }

        Ok(CodeItem { registers_size, ins_size, outs_size, insns, tries, handlers, offset: 0 })
    }

    pub fn write(&self, bytes: &mut Vec<u8>) -> usize
    {
        let mut c = 0;
        c += write_u2(bytes, self.registers_size);
        c += write_u2(bytes, self.ins_size);
        c += write_u2(bytes, self.outs_size);
        c += write_u2(bytes, self.tries.len() as u16);
        c += write_u4(bytes, 0); // debug_info_off
        c += write_u4(bytes, self.insns.len() as u32);
        for i in &self.insns { c += write_u2(bytes, *i); }

        if !self.tries.is_empty() {
            if (self.insns.len() & 1) != 0 { c += write_u2(bytes, 0); }
            for t in &self.tries { c += t.write(bytes); }
            c += write_uleb128(bytes, self.handlers.len() as u32);
            for h in &self.handlers { c += h.write(bytes); }
        }

        c
    }

    pub fn byte_len(&self) -> usize
    {
        let mut scratch = vec![];
        self.write(&mut scratch)
    }

    /// The instruction stream rendered back to bytes, one code unit at a
    /// time, little-endian.
    pub fn insns_bytes(&self) -> Vec<u8>
    {
        let mut bc = Vec::with_capacity(self.insns.len() * 2);
        for &u in &self.insns {
            bc.push((u & 0x00FF) as u8);
            bc.push((u >> 8) as u8);
        }
        bc
    }
}

#[derive(Debug)]
pub struct ClassDefItem {
    pub class_idx: TypeId,
    pub access_flags: u32,
    pub superclass_idx: TypeId,
    pub interfaces: Option<TypeList>,
    pub interfaces_off: u32,
    pub source_file_idx: StringId,
    pub class_data: Option<ClassDataItem>,
    pub class_data_off: u32,
}

impl ClassDefItem
{
    pub fn read(bytes: &[u8], ix: &mut usize) -> Result<ClassDefItem, DexError>
    {
        let class_idx = read_u4(bytes, ix)? as TypeId;
        let access_flags = read_u4(bytes, ix)?;
        let superclass_idx = read_u4(bytes, ix)? as TypeId;
        let mut interface_offset = read_u4(bytes, ix)? as usize;
        let interfaces_off = interface_offset as u32;
        let interfaces = if interface_offset > 0 { Some(TypeList::read(bytes, &mut interface_offset)?) }
            else { None };
        let source_file_idx = read_u4(bytes, ix)? as StringId;
        let _annotations_off = read_u4(bytes, ix)?;       // annotation directories are not modelled
        let mut class_data_offset = read_u4(bytes, ix)? as usize;
        let class_data_off = class_data_offset as u32;
        let class_data = if class_data_offset > 0 {
            match ClassDataItem::read(bytes, &mut class_data_offset) {
                Ok(cd) => Some(cd),
                Err(e) => {
                    error!("Error reading ClassDataItem: {:?}", e);
                    None
                }
            }
        }
            else { None };
        let _static_values_off = read_u4(bytes, ix)?;     // static value arrays are not modelled

        Ok(ClassDefItem {
            class_idx,
            access_flags,
            superclass_idx,
            interfaces,
            interfaces_off,
            source_file_idx,
            class_data,
            class_data_off,
        })
    }

    pub fn write(&self, bytes: &mut Vec<u8>) -> usize
    {
        let mut c = 0;
        c += write_u4(bytes, self.class_idx as u32);
        c += write_u4(bytes, self.access_flags);
        c += write_u4(bytes, self.superclass_idx as u32);
        c += write_u4(bytes, self.interfaces_off);
        c += write_u4(bytes, self.source_file_idx as u32);
        c += write_u4(bytes, 0); // annotations_off
        c += write_u4(bytes, self.class_data_off);
        c += write_u4(bytes, 0); // static_values_off
        c
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Header {
    pub magic: [u8; 8],
    pub checksum: u32,
    pub signature: [u8; 20],
    pub file_size: u32,
    pub header_size: u32,
    pub endian_tag: u32,
    pub link_size: u32,
    pub link_off: u32,
    pub map_off: u32,
    pub string_ids_size: u32,
    pub string_ids_off: u32,
    pub type_ids_size: u32,
    pub type_ids_off: u32,
    pub proto_ids_size: u32,
    pub proto_ids_off: u32,
    pub field_ids_size: u32,
    pub field_ids_off: u32,
    pub method_ids_size: u32,
    pub method_ids_off: u32,
    pub class_defs_size: u32,
    pub class_defs_off: u32,
    pub data_size: u32,
    pub data_off: u32,
}

impl Header
{
    pub fn read(bytes: &[u8], ix: &mut usize) -> Result<Header, DexError>
    {
        if bytes.len() < HEADER_SIZE as usize {
            return Err(DexError::new("Not enough bytes for header"));
        }

        let magic = <[u8; 8]>::try_from(read_x(bytes, ix, 8)?).unwrap();
        if magic[0] != 0x64 || magic[1] != 0x65 || magic[2] != 0x78 { return Err(DexError::new("Invalid magic value")); }

        Ok(Header {
            magic,
            checksum: read_u4(bytes, ix)?,
            signature: <[u8; 20]>::try_from(read_x(bytes, ix, 20)?).unwrap(),
            file_size: read_u4(bytes, ix)?,
            header_size: read_u4(bytes, ix)?,
            endian_tag: read_u4(bytes, ix)?,
            link_size: read_u4(bytes, ix)?,
            link_off: read_u4(bytes, ix)?,
            map_off: read_u4(bytes, ix)?,
            string_ids_size: read_u4(bytes, ix)?,
            string_ids_off: read_u4(bytes, ix)?,
            type_ids_size: read_u4(bytes, ix)?,
            type_ids_off: read_u4(bytes, ix)?,
            proto_ids_size: read_u4(bytes, ix)?,
            proto_ids_off: read_u4(bytes, ix)?,
            field_ids_size: read_u4(bytes, ix)?,
            field_ids_off: read_u4(bytes, ix)?,
            method_ids_size: read_u4(bytes, ix)?,
            method_ids_off: read_u4(bytes, ix)?,
            class_defs_size: read_u4(bytes, ix)?,
            class_defs_off: read_u4(bytes, ix)?,
            data_size: read_u4(bytes, ix)?,
            data_off: read_u4(bytes, ix)?,
        })
    }

    pub fn write(&self, bytes: &mut Vec<u8>) -> usize
    {
        let mut c = 0;
        c += write_x(bytes, &self.magic);
        c += write_u4(bytes, self.checksum);
        c += write_x(bytes, &self.signature);
        c += write_u4(bytes, self.file_size);
        c += write_u4(bytes, self.header_size);
        c += write_u4(bytes, self.endian_tag);
        c += write_u4(bytes, self.link_size);
        c += write_u4(bytes, self.link_off);
        c += write_u4(bytes, self.map_off);
        c += write_u4(bytes, self.string_ids_size);
        c += write_u4(bytes, self.string_ids_off);
        c += write_u4(bytes, self.type_ids_size);
        c += write_u4(bytes, self.type_ids_off);
        c += write_u4(bytes, self.proto_ids_size);
        c += write_u4(bytes, self.proto_ids_off);
        c += write_u4(bytes, self.field_ids_size);
        c += write_u4(bytes, self.field_ids_off);
        c += write_u4(bytes, self.method_ids_size);
        c += write_u4(bytes, self.method_ids_off);
        c += write_u4(bytes, self.class_defs_size);
        c += write_u4(bytes, self.class_defs_off);
        c += write_u4(bytes, self.data_size);
        c += write_u4(bytes, self.data_off);
        c
    }
}

#[derive(Debug, Eq, PartialEq, Clone)]
pub enum DexString
{
    Decoded(String),
    Raw(u32, Vec<u8>),
}

impl DexString
{
    pub fn from_string(s: &str) -> DexString
    {
        DexString::Decoded(s.to_string())
    }

    pub fn to_string(&self) -> Result<String, DexError>
    {
        match &self
        {
            DexString::Decoded(s) => Ok(s.to_string()),
            DexString::Raw(_,_) => Err(DexError::new(
                "DexString failed conversion",
            )),
        }
    }

    pub fn read(bytes: &[u8], ix: &mut usize) -> Result<DexString, DexError>
    {
        let utf16_size = read_uleb128(bytes, ix)?;
        let mut v = vec![];

        loop
        {
            let u = read_u1(bytes, ix)?;
            if u != 0 { v.push(u); }
            else { break; }
        }

        Ok(match cesu8::from_java_cesu8(v.as_slice())
        {
            Ok(converted_str) => DexString::Decoded(converted_str.to_string()),
            _ => DexString::Raw(utf16_size, v)
        })
    }

    pub fn write(&self, bytes: &mut Vec<u8>) -> usize
    {
        let mut c = 0;

        match self
        {
            DexString::Raw(utf16_size, v) => {
                c += write_uleb128(bytes, *utf16_size);
                c += write_x(bytes, v);
                c += write_u1(bytes, 0);
            },

            DexString::Decoded(s) => {
                let encoded = to_java_cesu8(s).to_vec();
                c += write_uleb128(bytes, s.chars().count() as u32);
                c += write_x(bytes, encoded.as_slice());
                c += write_u1(bytes, 0);
            }
        }
        c
    }

    /// Serialized size of this entry in the string-data section, framing
    /// (length prefix and terminator) included.
    pub fn encoded_len(&self) -> usize
    {
        let mut scratch = vec![];
        self.write(&mut scratch)
    }
}

/// One string pool entry together with its file offset.
#[derive(Debug, Clone)]
pub struct StringEntry
{
    pub value: DexString,
    pub data_off: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InternKind
{
    New,
    AlreadyPresent,
}

/// Outcome of [`DexFile::intern_string`]: whether the pool grew, and the pool
/// index the value lives at (the index a `const-string` instruction takes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InternResult
{
    pub kind: InternKind,
    pub index: u32,
}

/// An in-memory DEX container.
///
/// `from_bytes` deserializes the input into owned records and assigns every
/// item a canonical file offset (id tables in header order, then string data,
/// type lists, code items, class data and the map). All offsets exposed from
/// here on are canonical ones, and `save` emits items at exactly their stored
/// offsets, so growing the string pool shifts downstream offsets by the exact
/// number of inserted bytes and nothing else.
///
/// Annotation directories, static value arrays and debug info streams are not
/// modelled; they are skipped on read and re-emitted as zero offsets.
#[derive(Debug)]
pub struct DexFile {
    pub header: Header,
    pub strings: Vec<StringEntry>,
    pub types: Vec<StringId>,
    pub prototypes: Vec<PrototypeItem>,
    pub fields: Vec<FieldItem>,
    pub methods: Vec<MethodItem>,
    pub class_defs: Vec<ClassDefItem>,
    pub code_list: Vec<CodeItem>,
}

impl DexFile {

    fn read(bytes: &[u8], ix: &mut usize) -> Result<DexFile, DexError>
    {
        let header = Header::read(bytes, ix)?;

        let mut dex = DexFile {
            header,
            strings: vec![],
            types: vec![],
            prototypes: vec![],
            fields: vec![],
            methods: vec![],
            class_defs: vec![],
            code_list: vec![],
        };

        // Read the strings
        *ix = dex.header.string_ids_off as usize;
        for _ in 0..dex.header.string_ids_size
        {
            let data_off = read_u4(bytes, ix)?;
            let mut string_ix = data_off as usize;
            let value = DexString::read(bytes, &mut string_ix)?;
            dex.strings.push(StringEntry { value, data_off });
        }

        // Read the type_ids
        *ix = dex.header.type_ids_off as usize;
        for _ in 0..dex.header.type_ids_size
        {
            let type_id: TypeId = read_u4(bytes, ix)? as usize;
            match dex.strings.get(type_id)
            {
                Some(StringEntry { value: DexString::Decoded(_), .. }) => dex.types.push(type_id),
                Some(s) => fail!("Invalid type description: {:?}", s),
                None => fail!("Type descriptor index {} out of range", type_id),
            }
        }

        // Read the prototypes
        *ix = dex.header.proto_ids_off as usize;
        for _ in 0..dex.header.proto_ids_size
        {
            let shorty_idx = read_u4(bytes, ix)? as StringId;
            let return_type_idx = read_u4(bytes, ix)? as TypeId;
            let mut parameter_offset = read_u4(bytes, ix)? as usize;
            let parameters_off = parameter_offset as u32;
            let p = PrototypeItem {
                shorty_idx, return_type_idx, parameters_off,
                parameters: if parameter_offset == 0 { TypeList(vec![]) }
                else { TypeList::read(bytes, &mut parameter_offset)? },
            };
            dex.prototypes.push(p);
        }

        // Read the Field ids
        *ix = dex.header.field_ids_off as usize;
        for _ in 0..dex.header.field_ids_size
        {
            dex.fields.push(FieldItem::read(bytes, ix)?);
        }

        // Read the Method ids
        *ix = dex.header.method_ids_off as usize;
        for _ in 0..dex.header.method_ids_size
        {
            dex.methods.push(MethodItem::read(bytes, ix)?);
        }

        // Read the Class Defs
        *ix = dex.header.class_defs_off as usize;
        for _ in 0..dex.header.class_defs_size
        {
            dex.class_defs.push(ClassDefItem::read(bytes, ix)?);
        }

        // Read the code items referenced from class data, once per offset
        let mut code_offsets: BTreeSet<u32> = BTreeSet::new();
        for c in &dex.class_defs
        {
            if let Some(cd) = &c.class_data
            {
                for m in cd.method_entries()
                {
                    if m.code_off != 0 { code_offsets.insert(m.code_off); }
                }
            }
        }
        for off in code_offsets
        {
            let mut code_ix = off as usize;
            let mut item = CodeItem::read(bytes, &mut code_ix)
                .map_err(|e| DexError::with_context(e, format!("while reading code item at 0x{:x}", off)))?;
            item.offset = off;
            dex.code_list.push(item);
        }

        dex.relayout()?;

        Ok(dex)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<DexFile, DexError>
    {
        let mut ix = 0;
        DexFile::read(bytes, &mut ix)
    }

    pub fn from_file(path: &Path) -> Result<DexFile, DexError>
    {
        let bytes = fs::read(path).map_err(|e| DexError::new(&format!("io Error: {}", e)))?;
        DexFile::from_bytes(&bytes)
    }

    /// Resolve a string pool index to its decoded value.
    pub fn string_value(&self, id: StringId) -> Result<String, DexError>
    {
        match self.strings.get(id)
        {
            Some(entry) => entry.value.to_string(),
            None => Err(DexError::new(&format!("string index {} out of range", id))),
        }
    }

    /// Assign every item its canonical file offset and refresh the header's
    /// section table. Called once after parsing; pool growth afterwards moves
    /// the stored offsets by exact deltas instead of re-running this.
    pub(crate) fn relayout(&mut self) -> Result<(), DexError>
    {
        fn section(pos: &mut u32, count: usize, entry_size: u32) -> u32
        {
            if count == 0 { return 0; }
            let off = *pos;
            *pos += count as u32 * entry_size;
            off
        }

        let mut pos = HEADER_SIZE;
        self.header.header_size = HEADER_SIZE;
        self.header.endian_tag = ENDIAN_CONSTANT;
        self.header.link_size = 0;
        self.header.link_off = 0;

        self.header.string_ids_size = self.strings.len() as u32;
        self.header.string_ids_off = section(&mut pos, self.strings.len(), 4);
        self.header.type_ids_size = self.types.len() as u32;
        self.header.type_ids_off = section(&mut pos, self.types.len(), 4);
        self.header.proto_ids_size = self.prototypes.len() as u32;
        self.header.proto_ids_off = section(&mut pos, self.prototypes.len(), 12);
        self.header.field_ids_size = self.fields.len() as u32;
        self.header.field_ids_off = section(&mut pos, self.fields.len(), 8);
        self.header.method_ids_size = self.methods.len() as u32;
        self.header.method_ids_off = section(&mut pos, self.methods.len(), 8);
        self.header.class_defs_size = self.class_defs.len() as u32;
        self.header.class_defs_off = section(&mut pos, self.class_defs.len(), 32);

        self.header.data_off = pos;

        // String data, in pool index order
        for s in &mut self.strings
        {
            s.data_off = pos;
            pos += s.value.encoded_len() as u32;
        }

        // Type lists: prototype parameters, then class interfaces
        for p in &mut self.prototypes
        {
            if p.parameters.0.is_empty() { p.parameters_off = 0; }
            else
            {
                pos = align4(pos);
                p.parameters_off = pos;
                pos += 4 + 2 * p.parameters.0.len() as u32;
            }
        }
        for c in &mut self.class_defs
        {
            match &c.interfaces
            {
                Some(tl) if !tl.0.is_empty() =>
                {
                    pos = align4(pos);
                    c.interfaces_off = pos;
                    pos += 4 + 2 * tl.0.len() as u32;
                }
                _ => c.interfaces_off = 0,
            }
        }

        // Code items; remember old offsets so class data can be re-pointed
        let mut remap: HashMap<u32, u32> = HashMap::new();
        for code in &mut self.code_list
        {
            pos = align4(pos);
            remap.insert(code.offset, pos);
            code.offset = pos;
            pos += code.byte_len() as u32;
        }
        for c in &mut self.class_defs
        {
            if let Some(cd) = &mut c.class_data
            {
                for m in cd.method_entries_mut()
                {
                    if m.code_off != 0
                    {
                        m.code_off = *remap.get(&m.code_off)
                            .ok_or_else(|| DexError::new(&format!("method code offset 0x{:x} has no code item", m.code_off)))?;
                    }
                }
            }
        }

        // Class data items (after code so the code_off ulebs are final)
        for c in &mut self.class_defs
        {
            match &c.class_data
            {
                Some(cd) =>
                {
                    c.class_data_off = pos;
                    pos += cd.byte_len() as u32;
                }
                None => c.class_data_off = 0,
            }
        }

        pos = align4(pos);
        self.header.map_off = pos;
        pos += 4 + 12 * self.map_items().len() as u32;

        self.header.file_size = pos;
        self.header.data_size = pos - self.header.data_off;

        Ok(())
    }

    fn map_items(&self) -> Vec<(u16, u32, u32)>
    {
        let mut items = vec![(TYPE_HEADER_ITEM, 1, 0)];
        if !self.strings.is_empty()
        {
            items.push((TYPE_STRING_ID_ITEM, self.strings.len() as u32, self.header.string_ids_off));
        }
        if !self.types.is_empty()
        {
            items.push((TYPE_TYPE_ID_ITEM, self.types.len() as u32, self.header.type_ids_off));
        }
        if !self.prototypes.is_empty()
        {
            items.push((TYPE_PROTO_ID_ITEM, self.prototypes.len() as u32, self.header.proto_ids_off));
        }
        if !self.fields.is_empty()
        {
            items.push((TYPE_FIELD_ID_ITEM, self.fields.len() as u32, self.header.field_ids_off));
        }
        if !self.methods.is_empty()
        {
            items.push((TYPE_METHOD_ID_ITEM, self.methods.len() as u32, self.header.method_ids_off));
        }
        if !self.class_defs.is_empty()
        {
            items.push((TYPE_CLASS_DEF_ITEM, self.class_defs.len() as u32, self.header.class_defs_off));
        }
        if let Some(first) = self.strings.first()
        {
            items.push((TYPE_STRING_DATA_ITEM, self.strings.len() as u32, first.data_off));
        }
        let type_list_offs: Vec<u32> = self.prototypes.iter().map(|p| p.parameters_off)
            .chain(self.class_defs.iter().map(|c| c.interfaces_off))
            .filter(|&o| o != 0)
            .collect();
        if let Some(&first) = type_list_offs.iter().min()
        {
            items.push((TYPE_TYPE_LIST, type_list_offs.len() as u32, first));
        }
        if let Some(first) = self.code_list.iter().map(|c| c.offset).min()
        {
            items.push((TYPE_CODE_ITEM, self.code_list.len() as u32, first));
        }
        let class_data_offs: Vec<u32> = self.class_defs.iter().map(|c| c.class_data_off).filter(|&o| o != 0).collect();
        if let Some(&first) = class_data_offs.iter().min()
        {
            items.push((TYPE_CLASS_DATA_ITEM, class_data_offs.len() as u32, first));
        }
        items.push((TYPE_MAP_LIST, 1, self.header.map_off));
        items.sort_by_key(|&(_, _, off)| off);
        items
    }

    /// Shift every stored offset at or past `watermark` by `delta` bytes.
    /// Zero-valued offset fields mean "absent" and are left alone.
    fn shift_offsets(&mut self, watermark: u32, delta: u32)
    {
        fn bump(v: &mut u32, watermark: u32, delta: u32)
        {
            if *v != 0 && *v >= watermark { *v += delta; }
        }

        bump(&mut self.header.string_ids_off, watermark, delta);
        bump(&mut self.header.type_ids_off, watermark, delta);
        bump(&mut self.header.proto_ids_off, watermark, delta);
        bump(&mut self.header.field_ids_off, watermark, delta);
        bump(&mut self.header.method_ids_off, watermark, delta);
        bump(&mut self.header.class_defs_off, watermark, delta);
        bump(&mut self.header.data_off, watermark, delta);
        bump(&mut self.header.map_off, watermark, delta);

        for s in &mut self.strings { bump(&mut s.data_off, watermark, delta); }
        for p in &mut self.prototypes { bump(&mut p.parameters_off, watermark, delta); }
        for c in &mut self.class_defs
        {
            bump(&mut c.interfaces_off, watermark, delta);
            bump(&mut c.class_data_off, watermark, delta);
            if let Some(cd) = &mut c.class_data
            {
                for m in cd.method_entries_mut() { bump(&mut m.code_off, watermark, delta); }
            }
        }
        for code in &mut self.code_list { bump(&mut code.offset, watermark, delta); }
    }

    /// Intern a string into the pool.
    ///
    /// An already-present value is reported with its existing index and the
    /// container is left untouched. A new value is appended at the pool tail
    /// (its id slot at the end of the string_ids table, its data at the end of
    /// the string-data region) and every downstream offset is shifted by the
    /// exact inserted byte count. Appending keeps all pre-existing string
    /// indices stable, so instruction operands never need rewriting; the
    /// trade-off is that appended entries break the table's sort order.
    pub fn intern_string(&mut self, value: &str) -> Result<InternResult, DexError>
    {
        for (i, s) in self.strings.iter().enumerate()
        {
            if let DexString::Decoded(existing) = &s.value
            {
                if existing == value
                {
                    return Ok(InternResult { kind: InternKind::AlreadyPresent, index: i as u32 });
                }
            }
        }

        if self.strings.is_empty()
        {
            fail!("cannot intern into a container with an empty string pool");
        }

        let entry = DexString::from_string(value);
        let data_len = entry.encoded_len() as u32;

        // New id slot at the end of the string_ids table
        let id_watermark = self.header.string_ids_off + 4 * self.header.string_ids_size;
        self.shift_offsets(id_watermark, 4);

        // New string data at the end of the string-data region
        let last = self.strings.last().unwrap();
        let data_watermark = last.data_off + last.value.encoded_len() as u32;
        self.shift_offsets(data_watermark, data_len);

        let index = self.strings.len() as u32;
        self.strings.push(StringEntry { value: entry, data_off: data_watermark });
        self.header.string_ids_size += 1;
        self.header.file_size += 4 + data_len;
        self.header.data_size += data_len;

        Ok(InternResult { kind: InternKind::New, index })
    }

    /// Serialize the container, emitting every item at its stored offset.
    /// Checksum and signature header fields are written as-is; callers
    /// refresh them through the integrity service after saving.
    pub fn to_bytes(&self) -> Result<Vec<u8>, DexError>
    {
        let mut file = vec![0u8; self.header.file_size as usize];

        let mut hb = Vec::with_capacity(HEADER_SIZE as usize);
        self.header.write(&mut hb);
        put_bytes(&mut file, 0, &hb)?;

        for (i, s) in self.strings.iter().enumerate()
        {
            let mut id = vec![];
            write_u4(&mut id, s.data_off);
            put_bytes(&mut file, (self.header.string_ids_off + 4 * i as u32) as usize, &id)?;
            let mut data = vec![];
            s.value.write(&mut data);
            put_bytes(&mut file, s.data_off as usize, &data)?;
        }

        for (i, t) in self.types.iter().enumerate()
        {
            let mut b = vec![];
            write_u4(&mut b, *t as u32);
            put_bytes(&mut file, (self.header.type_ids_off + 4 * i as u32) as usize, &b)?;
        }

        for (i, p) in self.prototypes.iter().enumerate()
        {
            let mut b = vec![];
            write_u4(&mut b, p.shorty_idx as u32);
            write_u4(&mut b, p.return_type_idx as u32);
            write_u4(&mut b, p.parameters_off);
            put_bytes(&mut file, (self.header.proto_ids_off + 12 * i as u32) as usize, &b)?;
            if p.parameters_off != 0
            {
                let mut tl = vec![];
                p.parameters.write(&mut tl);
                put_bytes(&mut file, p.parameters_off as usize, &tl)?;
            }
        }

        for (i, f) in self.fields.iter().enumerate()
        {
            let mut b = vec![];
            f.write(&mut b);
            put_bytes(&mut file, (self.header.field_ids_off + 8 * i as u32) as usize, &b)?;
        }

        for (i, m) in self.methods.iter().enumerate()
        {
            let mut b = vec![];
            m.write(&mut b);
            put_bytes(&mut file, (self.header.method_ids_off + 8 * i as u32) as usize, &b)?;
        }

        for (i, c) in self.class_defs.iter().enumerate()
        {
            let mut b = vec![];
            c.write(&mut b);
            put_bytes(&mut file, (self.header.class_defs_off + 32 * i as u32) as usize, &b)?;
            if c.interfaces_off != 0
            {
                if let Some(tl) = &c.interfaces
                {
                    let mut ib = vec![];
                    tl.write(&mut ib);
                    put_bytes(&mut file, c.interfaces_off as usize, &ib)?;
                }
            }
            if let Some(cd) = &c.class_data
            {
                let mut cb = vec![];
                cd.write(&mut cb);
                put_bytes(&mut file, c.class_data_off as usize, &cb)?;
            }
        }

        for code in &self.code_list
        {
            let mut b = vec![];
            code.write(&mut b);
            put_bytes(&mut file, code.offset as usize, &b)?;
        }

        let items = self.map_items();
        let mut mb = vec![];
        write_u4(&mut mb, items.len() as u32);
        for (item_type, size, off) in items
        {
            write_u2(&mut mb, item_type);
            write_u2(&mut mb, 0);
            write_u4(&mut mb, size);
            write_u4(&mut mb, off);
        }
        put_bytes(&mut file, self.header.map_off as usize, &mb)?;

        Ok(file)
    }

    /// Persist the container to `path`. The caller owns the follow-up
    /// integrity refresh.
    pub fn save(&self, path: &Path) -> Result<(), DexError>
    {
        let bytes = self.to_bytes()?;
        fs::write(path, bytes)?;
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> Header
    {
        Header {
            magic: DEX_FILE_MAGIC,
            checksum: 0,
            signature: [0; 20],
            file_size: 0x200,
            header_size: HEADER_SIZE,
            endian_tag: ENDIAN_CONSTANT,
            link_size: 0,
            link_off: 0,
            map_off: 0x1f0,
            string_ids_size: 4,
            string_ids_off: 0x70,
            type_ids_size: 2,
            type_ids_off: 0x80,
            proto_ids_size: 1,
            proto_ids_off: 0x88,
            field_ids_size: 0,
            field_ids_off: 0,
            method_ids_size: 2,
            method_ids_off: 0x94,
            class_defs_size: 1,
            class_defs_off: 0xa4,
            data_size: 0x12c,
            data_off: 0xc4,
        }
    }

    #[test]
    fn test_header_roundtrip()
    {
        let header = sample_header();
        let mut encoded = vec![];
        header.write(&mut encoded);
        assert_eq!(encoded.len(), HEADER_SIZE as usize);

        let mut ix = 0;
        let decoded = Header::read(&encoded, &mut ix).expect("header read failed");
        assert_eq!(header, decoded);
    }

    #[test]
    fn test_dex_string_roundtrip()
    {
        let s = DexString::from_string("Lcom/example/Secrets;");
        let mut bytes = vec![];
        let written = s.write(&mut bytes);
        assert_eq!(written, s.encoded_len());

        let mut ix = 0;
        let back = DexString::read(&bytes, &mut ix).expect("string read failed");
        assert_eq!(s, back);
        assert_eq!(ix, bytes.len());
    }

    #[test]
    fn test_class_data_preserves_raw_deltas()
    {
        let cd = ClassDataItem {
            static_fields: vec![],
            instance_fields: vec![ EncodedFieldEntry { field_idx_diff: 3, access_flags: 2 } ],
            direct_methods: vec![
                ClassMethodEntry { method_idx_diff: 7, access_flags: ACC_PUBLIC | ACC_STATIC, code_off: 0x1000 },
                ClassMethodEntry { method_idx_diff: 2, access_flags: ACC_PUBLIC, code_off: 0x1040 },
            ],
            virtual_methods: vec![
                ClassMethodEntry { method_idx_diff: 4, access_flags: ACC_PUBLIC, code_off: 0 },
            ],
        };

        let mut bytes = vec![];
        let written = cd.write(&mut bytes);
        assert_eq!(written, cd.byte_len());

        let mut ix = 0;
        let back = ClassDataItem::read(&bytes, &mut ix).expect("class data read failed");
        assert_eq!(ix, bytes.len());
        assert_eq!(cd, back);
    }

    #[test]
    fn test_code_item_roundtrip()
    {
        let code = CodeItem {
            registers_size: 3,
            ins_size: 1,
            outs_size: 1,
            insns: vec![0x0071, 0x0000, 0x000c, 0x0011, 0x1234],
            tries: vec![ TryItem { start_addr: 0, insn_count: 4, handler_off: 1 } ],
            handlers: vec![ EncodedCatchHandler {
                handlers: vec![ EncodedTypeAddrPair { type_idx: 1, addr: 4 } ],
                catch_all_addr: None,
            } ],
            offset: 0,
        };

        let mut bytes = vec![];
        let written = code.write(&mut bytes);
        assert_eq!(written, code.byte_len());

        let mut ix = 0;
        let back = CodeItem::read(&bytes, &mut ix).expect("code item read failed");
        assert_eq!(ix, bytes.len());
        assert_eq!(code.insns, back.insns);
        assert_eq!(code.tries, back.tries);
        assert_eq!(code.handlers, back.handlers);
    }

    #[test]
    fn test_insns_bytes_little_endian()
    {
        let code = CodeItem {
            registers_size: 1, ins_size: 0, outs_size: 0,
            insns: vec![0x0011, 0xbeef],
            tries: vec![], handlers: vec![],
            offset: 0,
        };
        assert_eq!(code.insns_bytes(), vec![0x11, 0x00, 0xef, 0xbe]);
    }

    #[test]
    fn test_encoded_catch_handler_roundtrip_with_catch_all() {
        let h = EncodedCatchHandler {
            handlers: vec![ EncodedTypeAddrPair { type_idx: 42, addr: 0x0000ABCD } ],
            catch_all_addr: Some(0x00001234),
        };

        let mut bytes = vec![];
        let _ = h.write(&mut bytes);

        let mut ix = 0;
        let h2 = EncodedCatchHandler::read(&bytes, &mut ix).expect("EncodedCatchHandler read failed");
        assert_eq!(ix, bytes.len());
        assert_eq!(h, h2);
    }
}
