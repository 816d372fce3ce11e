//! Typed record schemas and their on-disk form.
//!
//! A schema is a fixed 3,632-byte structure:
//! - Bytes 0-1: entry size (u16)
//! - Bytes 2-3: field count (u16)
//! - Bytes 4-15: reserved
//! - Bytes 16-3599: 64 field descriptors, 56 bytes each
//!   (32-byte NUL-padded name, type u64, size u64, offset u64)
//! - Bytes 3600-3631: 32-byte NUL-padded schema name
//!
//! Schemas are built explicitly: callers list fields with declared types and
//! sizes and the builder assigns contiguous offsets. Records are fixed-width;
//! strings are NUL-terminated inside their field and padded with zeros.

use std::io::Cursor;

use binrw::{binrw, BinReaderExt, BinWrite};
use serde::Serialize;

use crate::error::{Error, Result};
use crate::layout::PAGE_SIZE;

/// Byte size of the schema blob.
pub const SCHEMA_SIZE: usize = 3632;

/// Maximum fields per schema.
pub const MAX_FIELDS: usize = 64;

/// Fixed width of field and schema names, including the terminating NUL.
pub const NAME_SIZE: usize = 32;

const FIELD_DESC_SIZE: usize = 56;

/// Field types. Boolean, start-time and end-time are extension types on V1
/// files (format flag 0x10).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FieldType {
    /// Stored as 4 bytes, zero or one.
    Boolean,
    /// Signed little-endian integer of 1, 2, 4 or 8 bytes.
    Int,
    /// IEEE float of 4 or 8 bytes.
    Float,
    /// Fixed-width byte array, NUL-terminated, surplus bytes zero.
    String,
    /// Nanosecond time stamp opening an interval (i64).
    StartTime,
    /// Nanosecond time stamp closing an interval (i64).
    EndTime,
    /// Enumerable, sized like an integer.
    Enum,
}

impl FieldType {
    fn to_raw(self) -> u64 {
        match self {
            FieldType::Boolean => 0,
            FieldType::Int => 1,
            FieldType::Float => 2,
            FieldType::String => 3,
            FieldType::StartTime => 4,
            FieldType::EndTime => 5,
            FieldType::Enum => 6,
        }
    }

    fn from_raw(raw: u64) -> Result<Self> {
        Ok(match raw {
            0 => FieldType::Boolean,
            1 => FieldType::Int,
            2 => FieldType::Float,
            3 => FieldType::String,
            4 => FieldType::StartTime,
            5 => FieldType::EndTime,
            6 => FieldType::Enum,
            other => return Err(Error::Schema(format!("unknown field type {other}"))),
        })
    }

    /// Valid byte sizes for this type.
    fn size_valid(self, size: usize) -> bool {
        match self {
            FieldType::Boolean => size == 4,
            FieldType::Int | FieldType::Enum => matches!(size, 1 | 2 | 4 | 8),
            FieldType::Float => matches!(size, 4 | 8),
            FieldType::String => size >= 1,
            FieldType::StartTime | FieldType::EndTime => size == 8,
        }
    }

    fn is_extension(self) -> bool {
        matches!(
            self,
            FieldType::Boolean | FieldType::StartTime | FieldType::EndTime
        )
    }
}

#[binrw]
#[brw(little)]
#[derive(Debug, Default, Clone, Copy)]
struct RawField {
    name: [u8; NAME_SIZE],
    ftype: u64,
    size: u64,
    offset: u64,
}

#[binrw]
#[brw(little)]
struct RawSchema {
    entry_size: u16,
    field_count: u16,
    reserved: [u8; 12],
    fields: [RawField; MAX_FIELDS],
    name: [u8; NAME_SIZE],
}

fn encode_name(name: &str) -> Result<[u8; NAME_SIZE]> {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.len() >= NAME_SIZE {
        return Err(Error::Schema(format!(
            "name {name:?} must be 1..{} bytes",
            NAME_SIZE - 1
        )));
    }
    let mut out = [0u8; NAME_SIZE];
    out[..bytes.len()].copy_from_slice(bytes);
    Ok(out)
}

fn decode_name(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

/// One field of a schema.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Field {
    pub name: String,
    pub ftype: FieldType,
    pub size: usize,
    pub offset: usize,
}

/// A typed, fixed-width record description. Immutable once added to a file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Schema {
    pub name: String,
    pub entry_size: usize,
    pub fields: Vec<Field>,
}

impl Schema {
    pub fn builder(name: impl Into<String>) -> SchemaBuilder {
        SchemaBuilder { name: name.into(), fields: Vec::new() }
    }

    /// Reject any field whose size is invalid for its type, empty or
    /// oversized schemas, and non-contiguous offsets.
    pub fn check(&self) -> Result<()> {
        if self.fields.is_empty() {
            return Err(Error::Schema(format!("schema {:?} has no fields", self.name)));
        }
        if self.fields.len() > MAX_FIELDS {
            return Err(Error::Schema(format!(
                "schema {:?} has {} fields, max {MAX_FIELDS}",
                self.name,
                self.fields.len()
            )));
        }
        if self.entry_size == 0 || self.entry_size > PAGE_SIZE {
            return Err(Error::Schema(format!(
                "schema {:?} entry size {} does not fit a page",
                self.name, self.entry_size
            )));
        }
        encode_name(&self.name)?;

        let mut offset = 0usize;
        for field in &self.fields {
            encode_name(&field.name)?;
            if !field.ftype.size_valid(field.size) {
                return Err(Error::Schema(format!(
                    "field {:?}: size {} invalid for {:?}",
                    field.name, field.size, field.ftype
                )));
            }
            if field.offset != offset {
                return Err(Error::Schema(format!(
                    "field {:?}: offset {} is not contiguous (expected {offset})",
                    field.name, field.offset
                )));
            }
            offset += field.size;
        }
        if offset != self.entry_size {
            return Err(Error::Schema(format!(
                "schema {:?}: fields cover {offset} bytes, entry size is {}",
                self.name, self.entry_size
            )));
        }
        Ok(())
    }

    /// Require `other` to be byte-compatible: identical entry size, field
    /// count, and field-by-field name/type/size/offset.
    pub fn validate(&self, other: &Schema) -> Result<()> {
        if self.entry_size != other.entry_size {
            return Err(Error::Schema(format!(
                "entry size mismatch: {} vs {}",
                self.entry_size, other.entry_size
            )));
        }
        if self.fields.len() != other.fields.len() {
            return Err(Error::Schema(format!(
                "field count mismatch: {} vs {}",
                self.fields.len(),
                other.fields.len()
            )));
        }
        for (a, b) in self.fields.iter().zip(&other.fields) {
            if a != b {
                return Err(Error::Schema(format!(
                    "field mismatch: {a:?} vs {b:?}"
                )));
            }
        }
        Ok(())
    }

    /// True if any field needs the V1 extension flag.
    pub fn requires_extension(&self) -> bool {
        self.fields.iter().any(|f| f.ftype.is_extension())
    }

    pub fn encode_blob(&self) -> Result<Vec<u8>> {
        self.check()?;
        let mut raw = RawSchema {
            entry_size: self.entry_size as u16,
            field_count: self.fields.len() as u16,
            reserved: [0; 12],
            fields: [RawField::default(); MAX_FIELDS],
            name: encode_name(&self.name)?,
        };
        for (slot, field) in raw.fields.iter_mut().zip(&self.fields) {
            slot.name = encode_name(&field.name)?;
            slot.ftype = field.ftype.to_raw();
            slot.size = field.size as u64;
            slot.offset = field.offset as u64;
        }
        let mut buf = vec![0u8; SCHEMA_SIZE];
        let mut cursor = Cursor::new(&mut buf[..]);
        raw.write_le(&mut cursor)?;
        Ok(buf)
    }

    pub fn decode_blob(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < SCHEMA_SIZE {
            return Err(Error::Format(format!(
                "schema blob truncated: {} bytes",
                bytes.len()
            )));
        }
        let mut cursor = Cursor::new(bytes);
        let raw: RawSchema = cursor.read_le()?;
        if raw.field_count as usize > MAX_FIELDS {
            return Err(Error::Schema(format!(
                "schema declares {} fields, max {MAX_FIELDS}",
                raw.field_count
            )));
        }
        let mut fields = Vec::with_capacity(raw.field_count as usize);
        for slot in &raw.fields[..raw.field_count as usize] {
            fields.push(Field {
                name: decode_name(&slot.name),
                ftype: FieldType::from_raw(slot.ftype)?,
                size: slot.size as usize,
                offset: slot.offset as usize,
            });
        }
        let schema = Schema {
            name: decode_name(&raw.name),
            entry_size: raw.entry_size as usize,
            fields,
        };
        schema.check()?;
        Ok(schema)
    }

    /// Binary-encode one typed row into `out` (exactly `entry_size` bytes).
    pub fn encode_entry(&self, row: &[FieldValue], out: &mut [u8]) -> Result<()> {
        if row.len() != self.fields.len() {
            return Err(Error::InvalidArgument(format!(
                "row has {} values, schema {:?} has {} fields",
                row.len(),
                self.name,
                self.fields.len()
            )));
        }
        if out.len() < self.entry_size {
            return Err(Error::InvalidArgument(format!(
                "output buffer {} bytes, entry size {}",
                out.len(),
                self.entry_size
            )));
        }
        for (field, value) in self.fields.iter().zip(row) {
            let dst = &mut out[field.offset..field.offset + field.size];
            encode_value(field, value, dst)?;
        }
        Ok(())
    }
}

fn encode_value(field: &Field, value: &FieldValue, dst: &mut [u8]) -> Result<()> {
    let mismatch = || {
        Error::InvalidArgument(format!(
            "value {value:?} does not fit field {:?} ({:?})",
            field.name, field.ftype
        ))
    };
    match (field.ftype, value) {
        (FieldType::Boolean, FieldValue::Bool(b)) => {
            dst.copy_from_slice(&(*b as u32).to_le_bytes());
        }
        (FieldType::Int | FieldType::Enum, FieldValue::Int(i)) => {
            encode_int(*i, dst).ok_or_else(mismatch)?;
        }
        (FieldType::Float, FieldValue::Float(f)) => match field.size {
            4 => dst.copy_from_slice(&(*f as f32).to_le_bytes()),
            8 => dst.copy_from_slice(&f.to_le_bytes()),
            _ => return Err(mismatch()),
        },
        (FieldType::String, FieldValue::Str(s)) => {
            let bytes = s.as_bytes();
            // Strictly shorter than the field so the NUL terminator fits.
            if bytes.len() >= field.size {
                return Err(mismatch());
            }
            dst[..bytes.len()].copy_from_slice(bytes);
            dst[bytes.len()..].fill(0);
        }
        (FieldType::StartTime | FieldType::EndTime, FieldValue::Time(t))
        | (FieldType::StartTime | FieldType::EndTime, FieldValue::Int(t)) => {
            dst.copy_from_slice(&t.to_le_bytes());
        }
        _ => return Err(mismatch()),
    }
    Ok(())
}

fn encode_int(value: i64, dst: &mut [u8]) -> Option<()> {
    match dst.len() {
        1 => dst.copy_from_slice(&i8::try_from(value).ok()?.to_le_bytes()),
        2 => dst.copy_from_slice(&i16::try_from(value).ok()?.to_le_bytes()),
        4 => dst.copy_from_slice(&i32::try_from(value).ok()?.to_le_bytes()),
        8 => dst.copy_from_slice(&value.to_le_bytes()),
        _ => return None,
    }
    Some(())
}

/// Builder assigning contiguous offsets; `build` runs `check`.
pub struct SchemaBuilder {
    name: String,
    fields: Vec<Field>,
}

impl SchemaBuilder {
    pub fn field(mut self, name: impl Into<String>, ftype: FieldType, size: usize) -> Self {
        let offset = self.fields.iter().map(|f| f.size).sum();
        self.fields.push(Field { name: name.into(), ftype, size, offset });
        self
    }

    pub fn boolean(self, name: impl Into<String>) -> Self {
        self.field(name, FieldType::Boolean, 4)
    }

    pub fn int32(self, name: impl Into<String>) -> Self {
        self.field(name, FieldType::Int, 4)
    }

    pub fn int64(self, name: impl Into<String>) -> Self {
        self.field(name, FieldType::Int, 8)
    }

    pub fn float64(self, name: impl Into<String>) -> Self {
        self.field(name, FieldType::Float, 8)
    }

    /// Fixed-width string field of `width` bytes (NUL included).
    pub fn string(self, name: impl Into<String>, width: usize) -> Self {
        self.field(name, FieldType::String, width)
    }

    pub fn start_time(self, name: impl Into<String>) -> Self {
        self.field(name, FieldType::StartTime, 8)
    }

    pub fn end_time(self, name: impl Into<String>) -> Self {
        self.field(name, FieldType::EndTime, 8)
    }

    pub fn build(self) -> Result<Schema> {
        let schema = Schema {
            name: self.name,
            entry_size: self.fields.iter().map(|f| f.size).sum(),
            fields: self.fields,
        };
        schema.check()?;
        Ok(schema)
    }
}

/// A decoded field value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum FieldValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Time(i64),
}

#[derive(Debug, Clone, Copy)]
enum Decoder {
    Bool,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
    Str(usize),
    Time,
}

/// Runtime deserializer: one decoder bound per field from (type, size).
pub struct Deserializer {
    fields: Vec<(String, usize, Decoder)>,
    entry_size: usize,
    start_time: Option<usize>,
    end_time: Option<usize>,
}

impl Deserializer {
    pub fn new(schema: &Schema) -> Result<Self> {
        schema.check()?;
        let mut fields = Vec::with_capacity(schema.fields.len());
        let mut start_time = None;
        let mut end_time = None;
        for (idx, field) in schema.fields.iter().enumerate() {
            let decoder = match (field.ftype, field.size) {
                (FieldType::Boolean, 4) => Decoder::Bool,
                (FieldType::Int | FieldType::Enum, 1) => Decoder::I8,
                (FieldType::Int | FieldType::Enum, 2) => Decoder::I16,
                (FieldType::Int | FieldType::Enum, 4) => Decoder::I32,
                (FieldType::Int | FieldType::Enum, 8) => Decoder::I64,
                (FieldType::Float, 4) => Decoder::F32,
                (FieldType::Float, 8) => Decoder::F64,
                (FieldType::String, n) => Decoder::Str(n),
                (FieldType::StartTime | FieldType::EndTime, 8) => Decoder::Time,
                (ftype, size) => {
                    return Err(Error::Schema(format!(
                        "no decoder for {ftype:?} of {size} bytes"
                    )))
                }
            };
            match field.ftype {
                FieldType::StartTime => start_time = Some(idx),
                FieldType::EndTime => end_time = Some(idx),
                _ => {}
            }
            fields.push((field.name.clone(), field.offset, decoder));
        }
        Ok(Self { fields, entry_size: schema.entry_size, start_time, end_time })
    }

    /// Index of the start-time field, if the schema has one.
    pub fn start_time_field(&self) -> Option<usize> {
        self.start_time
    }

    /// Index of the end-time field, if the schema has one.
    pub fn end_time_field(&self) -> Option<usize> {
        self.end_time
    }

    /// Decode field `idx` out of one record buffer.
    pub fn get<'a>(&'a self, buf: &[u8], idx: usize) -> Result<(&'a str, FieldValue)> {
        let (name, offset, decoder) = self
            .fields
            .get(idx)
            .ok_or_else(|| Error::InvalidArgument(format!("no field {idx}")))?;
        if buf.len() < self.entry_size {
            return Err(Error::InvalidArgument(format!(
                "record buffer {} bytes, entry size {}",
                buf.len(),
                self.entry_size
            )));
        }
        let at = &buf[*offset..];
        let value = match decoder {
            Decoder::Bool => {
                FieldValue::Bool(u32::from_le_bytes(at[..4].try_into().unwrap()) != 0)
            }
            Decoder::I8 => FieldValue::Int(at[0] as i8 as i64),
            Decoder::I16 => {
                FieldValue::Int(i16::from_le_bytes(at[..2].try_into().unwrap()) as i64)
            }
            Decoder::I32 => {
                FieldValue::Int(i32::from_le_bytes(at[..4].try_into().unwrap()) as i64)
            }
            Decoder::I64 => FieldValue::Int(i64::from_le_bytes(at[..8].try_into().unwrap())),
            Decoder::F32 => {
                FieldValue::Float(f32::from_le_bytes(at[..4].try_into().unwrap()) as f64)
            }
            Decoder::F64 => FieldValue::Float(f64::from_le_bytes(at[..8].try_into().unwrap())),
            Decoder::Str(width) => FieldValue::Str(decode_name(&at[..*width])),
            Decoder::Time => FieldValue::Time(i64::from_le_bytes(at[..8].try_into().unwrap())),
        };
        Ok((name.as_str(), value))
    }

    /// Decode a whole record.
    pub fn decode(&self, buf: &[u8]) -> Result<Vec<FieldValue>> {
        (0..self.fields.len())
            .map(|idx| self.get(buf, idx).map(|(_, v)| v))
            .collect()
    }
}
