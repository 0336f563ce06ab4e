//! The self-describing metadata schema blob.
//!
//! The schema describes the bit-level layout of the frozen metadata: one
//! [`SchemaLayout`] per distinct type, each either a primitive (a plain
//! bit-packed integer of `bits` bits) or a struct (a set of fields, each
//! referring to another layout at a bit offset). Field *names* are never
//! stored; readers address fields by numeric id, so the data blob stays
//! compact and forward-compatible.
//!
//! The wire format is a flat stream of unsigned LEB128 integers:
//!
//! ```text
//! version(=1) root_layout layout_count
//!   { bits field_count { field_id layout_id bit_offset }* }*
//! ```
use std::fmt;

type Result<T, E = Error> = std::result::Result<T, E>;

const FILE_VERSION: u64 = 1;

/// An error raised from decoding or validating a schema blob.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    Eof,
    VarintTooLong,
    Overflow,
    UnsupportedVersion(u64),
    TrailingBytes,
    MissingRootLayout,
    LayoutOutOfRange,
    FieldOrder,
    PrimitiveTooWide,
    OffsetOverflow,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            Error::Eof => "unexpected end of schema",
            Error::VarintTooLong => "overlong varint",
            Error::Overflow => "varint value out of range",
            Error::UnsupportedVersion(_) => "unsupported schema version",
            Error::TrailingBytes => "trailing bytes after schema",
            Error::MissingRootLayout => "root layout out of range",
            Error::LayoutOutOfRange => "field layout id out of range",
            Error::FieldOrder => "field ids not strictly ascending",
            Error::PrimitiveTooWide => "primitive layout wider than 64 bits",
            Error::OffsetOverflow => "field bit offset overflows",
        })
    }
}

impl std::error::Error for Error {}

/// The schema of a frozen metadata blob.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Schema {
    /// Index of the root layout in `layouts`.
    pub root_layout: u16,
    /// All layouts, referenced by index.
    pub layouts: Vec<SchemaLayout>,
}

/// One layout: a primitive (no fields) or a struct (one or more fields).
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash)]
pub struct SchemaLayout {
    /// The inline width of a value of this layout, in bits.
    pub bits: u32,
    /// Struct fields, sorted by ascending `field_id`. Empty for primitives.
    pub fields: Vec<SchemaField>,
}

/// One struct field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SchemaField {
    /// The 1-based field id.
    pub field_id: u16,
    /// The layout of the field value.
    pub layout_id: u16,
    /// Offset of the field from the start of the struct, in bits.
    pub bit_offset: u32,
}

impl SchemaLayout {
    /// Look up a field by id.
    pub fn field(&self, field_id: u16) -> Option<SchemaField> {
        self.fields
            .iter()
            .find(|f| f.field_id == field_id)
            .copied()
    }
}

impl Schema {
    /// Get a layout by index.
    pub fn layout(&self, id: u16) -> Option<&SchemaLayout> {
        self.layouts.get(usize::from(id))
    }

    pub(crate) fn root(&self) -> Option<&SchemaLayout> {
        self.layout(self.root_layout)
    }

    /// Parse and validate a schema blob.
    pub fn parse(src: &[u8]) -> Result<Self> {
        let mut de = Decoder { rest: src };

        let version = de.uint::<u64>()?;
        if version != FILE_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        let root_layout = de.uint::<u16>()?;
        let layout_cnt = de.uint::<usize>()?;
        // An upper bound from the remaining input: every layout costs at
        // least two bytes. Guards the allocation below.
        if layout_cnt > de.rest.len() / 2 + 1 {
            return Err(Error::Overflow);
        }
        let mut layouts = Vec::with_capacity(layout_cnt);
        for _ in 0..layout_cnt {
            let bits = de.uint::<u32>()?;
            let field_cnt = de.uint::<usize>()?;
            if field_cnt > de.rest.len() / 3 + 1 {
                return Err(Error::Overflow);
            }
            let mut fields = Vec::with_capacity(field_cnt);
            for _ in 0..field_cnt {
                fields.push(SchemaField {
                    field_id: de.uint::<u16>()?,
                    layout_id: de.uint::<u16>()?,
                    bit_offset: de.uint::<u32>()?,
                });
            }
            layouts.push(SchemaLayout { bits, fields });
        }
        if !de.rest.is_empty() {
            return Err(Error::TrailingBytes);
        }

        let this = Self {
            root_layout,
            layouts,
        };
        this.validate()?;
        Ok(this)
    }

    /// Serialize the schema, the reverse of [`Schema::parse`].
    ///
    /// The encoding is canonical: equal schemas serialize to equal bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + self.layouts.len() * 8);
        put_varint(&mut out, FILE_VERSION);
        put_varint(&mut out, self.root_layout.into());
        put_varint(&mut out, self.layouts.len() as u64);
        for layout in &self.layouts {
            put_varint(&mut out, layout.bits.into());
            put_varint(&mut out, layout.fields.len() as u64);
            for f in &layout.fields {
                put_varint(&mut out, f.field_id.into());
                put_varint(&mut out, f.layout_id.into());
                put_varint(&mut out, f.bit_offset.into());
            }
        }
        out
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.layout(self.root_layout).is_none() {
            return Err(Error::MissingRootLayout);
        }
        for layout in &self.layouts {
            if layout.fields.is_empty() {
                if layout.bits > 64 {
                    return Err(Error::PrimitiveTooWide);
                }
                continue;
            }
            if !layout.fields.windows(2).all(|w| w[0].field_id < w[1].field_id) {
                return Err(Error::FieldOrder);
            }
            for f in &layout.fields {
                let field_layout = self.layout(f.layout_id).ok_or(Error::LayoutOutOfRange)?;
                f.bit_offset
                    .checked_add(field_layout.bits)
                    .ok_or(Error::OffsetOverflow)?;
            }
        }
        Ok(())
    }
}

struct Decoder<'a> {
    rest: &'a [u8],
}

impl Decoder<'_> {
    fn varint(&mut self) -> Result<u64> {
        let mut x = 0u64;
        for i in 0..10 {
            let (&b, rest) = self.rest.split_first().ok_or(Error::Eof)?;
            self.rest = rest;
            x |= u64::from(b & 0x7F) << (i * 7);
            if b & 0x80 == 0 {
                return Ok(x);
            }
        }
        Err(Error::VarintTooLong)
    }

    fn uint<T: TryFrom<u64>>(&mut self) -> Result<T> {
        self.varint()?.try_into().map_err(|_| Error::Overflow)
    }
}

fn put_varint(out: &mut Vec<u8>, mut v: u64) {
    loop {
        let more = v >> 7;
        out.push((v as u8 & 0x7F) | if more != 0 { 0x80 } else { 0 });
        v = more;
        if more == 0 {
            break;
        }
    }
}
