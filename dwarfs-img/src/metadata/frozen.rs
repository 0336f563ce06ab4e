//! The bit-packed "frozen" value encoding.
//!
//! A frozen blob is a tree of regions. The root region holds the inline
//! bit-packed fields of the root struct; collections (byte strings and
//! lists) store a 32-bit byte `distance` to an out-of-line region, relative
//! to the start of the *parent* region, plus an element `count`. List
//! elements are bit-packed back to back at a fixed stride.
//!
//! Freezing happens in two passes. The plan pass walks the value and records,
//! per field, the maximum observed integer so that the emit pass can assign
//! each field the minimum bit width that fits. Fields whose values are all
//! zero (or all empty) are elided entirely: they get no layout in the schema
//! and no bits in the blob, and thaw back as zero/empty.
//!
//! Thawing is driven by the [`Schema`]: a [`RawView`] resolves a field id to
//! a (layout, bit offset) pair and loads bits directly out of the mapped
//! bytes, so any single field is randomly accessible without decoding its
//! siblings.
use bstr::BString;

use super::schema::{Schema, SchemaField, SchemaLayout};
use super::Error;

type Result<T, E = Error> = std::result::Result<T, E>;

/// Byte distances are relaxed to a fixed 32 bits so that layout sizes do not
/// depend on the data they point at.
const DISTANCE_BITS: u32 = 32;

fn err(msg: &str) -> Error {
    Error(msg.into())
}

fn int_bits(v: u64) -> u32 {
    64 - v.leading_zeros()
}

//// Planning ////

/// A node of the layout plan, merged over every value that will be stored
/// under the same field.
#[derive(Debug, Default, PartialEq)]
pub(crate) enum PlanNode {
    /// Nothing observed, or only zeros/empties: the field is elided.
    #[default]
    None,
    Int {
        bits: u32,
    },
    Struct {
        fields: Vec<PlanNode>,
    },
    Bytes {
        count_bits: u32,
    },
    List {
        count_bits: u32,
        elem: Box<PlanNode>,
    },
    Opt {
        /// Whether any `Some` value was observed; a field that only ever held
        /// `None` is elided.
        some: bool,
        inner: Box<PlanNode>,
    },
}

impl PlanNode {
    pub(crate) fn put_int(&mut self, v: u64) -> Result<()> {
        match self {
            PlanNode::None => {
                if v != 0 {
                    *self = PlanNode::Int { bits: int_bits(v) };
                }
                Ok(())
            }
            PlanNode::Int { bits } => {
                *bits = (*bits).max(int_bits(v));
                Ok(())
            }
            _ => Err(err("plan type mismatch: expected an integer")),
        }
    }

    pub(crate) fn as_struct(&mut self, field_cnt: usize) -> Result<&mut [PlanNode]> {
        if let PlanNode::None = self {
            *self = PlanNode::Struct {
                fields: std::iter::repeat_with(PlanNode::default)
                    .take(field_cnt)
                    .collect(),
            };
        }
        match self {
            PlanNode::Struct { fields } if fields.len() == field_cnt => Ok(fields),
            _ => Err(err("plan type mismatch: expected a struct")),
        }
    }

    fn put_bytes(&mut self, len: usize) -> Result<()> {
        let len = u32::try_from(len).map_err(|_| err("byte string length overflows u32"))?;
        if let PlanNode::None = self {
            *self = PlanNode::Bytes { count_bits: 0 };
        }
        match self {
            PlanNode::Bytes { count_bits } => {
                *count_bits = (*count_bits).max(int_bits(len.into()));
                Ok(())
            }
            _ => Err(err("plan type mismatch: expected a byte string")),
        }
    }

    fn as_list(&mut self, len: usize) -> Result<&mut PlanNode> {
        let len = u32::try_from(len).map_err(|_| err("list length overflows u32"))?;
        if let PlanNode::None = self {
            *self = PlanNode::List {
                count_bits: 0,
                elem: Box::new(PlanNode::None),
            };
        }
        match self {
            PlanNode::List { count_bits, elem } => {
                *count_bits = (*count_bits).max(int_bits(len.into()));
                Ok(elem)
            }
            _ => Err(err("plan type mismatch: expected a list")),
        }
    }

    fn as_opt(&mut self, is_some: bool) -> Result<&mut PlanNode> {
        if let PlanNode::None = self {
            *self = PlanNode::Opt {
                some: false,
                inner: Box::new(PlanNode::None),
            };
        }
        match self {
            PlanNode::Opt { some, inner } => {
                *some |= is_some;
                Ok(inner)
            }
            _ => Err(err("plan type mismatch: expected an optional")),
        }
    }

    /// The inline width of this node in bits.
    pub(crate) fn bit_size(&self) -> u64 {
        match self {
            PlanNode::None => 0,
            PlanNode::Int { bits } => (*bits).into(),
            PlanNode::Struct { fields } => fields.iter().map(PlanNode::bit_size).sum(),
            PlanNode::Bytes { count_bits } => {
                if *count_bits == 0 {
                    0
                } else {
                    u64::from(DISTANCE_BITS + *count_bits)
                }
            }
            PlanNode::List { count_bits, elem } => {
                if *count_bits == 0 {
                    0
                } else if elem.bit_size() == 0 {
                    (*count_bits).into()
                } else {
                    u64::from(DISTANCE_BITS + *count_bits)
                }
            }
            PlanNode::Opt { some, inner } => {
                // An optional that was only ever `None` is elided, but one
                // holding an all-zero value still needs its presence bit.
                if *some {
                    1 + inner.bit_size()
                } else {
                    0
                }
            }
        }
    }
}

//// Freezing ////

/// Types that can be frozen.
pub(crate) trait Freeze {
    fn plan(&self, node: &mut PlanNode) -> Result<()>;
    fn emit(&self, out: &mut Vec<u8>, storage: u64, bit: u64, node: &PlanNode) -> Result<()>;
}

/// Set `bits` bits at absolute bit position `pos` to `value`.
///
/// The target range must already be zero-initialized.
fn put_bits(out: &mut [u8], pos: u64, bits: u32, value: u64) {
    debug_assert!(bits == 64 || value >> bits == 0, "value wider than planned");
    for i in 0..u64::from(bits) {
        if (value >> i) & 1 != 0 {
            let p = pos + i;
            out[(p / 8) as usize] |= 1 << (p % 8);
        }
    }
}

fn emit_int(out: &mut [u8], storage: u64, bit: u64, node: &PlanNode, v: u64) -> Result<()> {
    match node {
        PlanNode::None => Ok(()),
        PlanNode::Int { bits } => {
            put_bits(out, storage * 8 + bit, *bits, v);
            Ok(())
        }
        _ => Err(err("emit type mismatch: expected an integer")),
    }
}

macro_rules! impl_freeze_int {
    ($($ty:ty),*) => {
        $(impl Freeze for $ty {
            fn plan(&self, node: &mut PlanNode) -> Result<()> {
                node.put_int(u64::from(*self))
            }
            fn emit(&self, out: &mut Vec<u8>, storage: u64, bit: u64, node: &PlanNode) -> Result<()> {
                emit_int(out, storage, bit, node, u64::from(*self))
            }
        })*
    };
}

impl_freeze_int!(bool, u32, u64);

impl Freeze for BString {
    fn plan(&self, node: &mut PlanNode) -> Result<()> {
        node.put_bytes(self.len())
    }

    fn emit(&self, out: &mut Vec<u8>, storage: u64, bit: u64, node: &PlanNode) -> Result<()> {
        let count_bits = match node {
            PlanNode::None => return Ok(()),
            PlanNode::Bytes { count_bits } => *count_bits,
            _ => return Err(err("emit type mismatch: expected a byte string")),
        };
        let distance = (out.len() as u64)
            .checked_sub(storage)
            .filter(|&d| d <= u64::from(u32::MAX))
            .ok_or_else(|| err("out-of-line distance overflows u32"))?;
        let pos = storage * 8 + bit;
        put_bits(out, pos, DISTANCE_BITS, distance);
        put_bits(out, pos + u64::from(DISTANCE_BITS), count_bits, self.len() as u64);
        out.extend_from_slice(self);
        Ok(())
    }
}

impl<T: Freeze> Freeze for Vec<T> {
    fn plan(&self, node: &mut PlanNode) -> Result<()> {
        let elem_node = node.as_list(self.len())?;
        for elem in self {
            elem.plan(elem_node)?;
        }
        Ok(())
    }

    fn emit(&self, out: &mut Vec<u8>, storage: u64, bit: u64, node: &PlanNode) -> Result<()> {
        let (count_bits, elem_node) = match node {
            PlanNode::None => return Ok(()),
            PlanNode::List { count_bits, elem } => (*count_bits, &**elem),
            _ => return Err(err("emit type mismatch: expected a list")),
        };
        let elem_bits = elem_node.bit_size();
        let pos = storage * 8 + bit;
        if elem_bits == 0 {
            // All elements are zero; only the count is stored.
            put_bits(out, pos, count_bits, self.len() as u64);
            return Ok(());
        }

        let region = out.len() as u64;
        let distance = region
            .checked_sub(storage)
            .filter(|&d| d <= u64::from(u32::MAX))
            .ok_or_else(|| err("out-of-line distance overflows u32"))?;
        put_bits(out, pos, DISTANCE_BITS, distance);
        put_bits(out, pos + u64::from(DISTANCE_BITS), count_bits, self.len() as u64);

        let data_bytes = (self.len() as u64)
            .checked_mul(elem_bits)
            .map(|bits| bits.div_ceil(8))
            .and_then(|n| usize::try_from(n).ok())
            .ok_or_else(|| err("list storage size overflows"))?;
        out.resize(out.len() + data_bytes, 0);
        for (i, elem) in self.iter().enumerate() {
            elem.emit(out, region, i as u64 * elem_bits, elem_node)?;
        }
        Ok(())
    }
}

impl<T: Freeze> Freeze for Option<T> {
    fn plan(&self, node: &mut PlanNode) -> Result<()> {
        match self {
            // Reserve the node kind, but width stays zero until a `Some`
            // value is observed.
            None => node.as_opt(false).map(drop),
            Some(v) => v.plan(node.as_opt(true)?),
        }
    }

    fn emit(&self, out: &mut Vec<u8>, storage: u64, bit: u64, node: &PlanNode) -> Result<()> {
        let inner_node = match node {
            PlanNode::Opt { inner, .. } => &**inner,
            PlanNode::None => return Ok(()),
            _ => return Err(err("emit type mismatch: expected an optional")),
        };
        if node.bit_size() == 0 {
            return Ok(());
        }
        if let Some(v) = self {
            put_bits(out, storage * 8 + bit, 1, 1);
            v.emit(out, storage, bit + 1, inner_node)?;
        }
        Ok(())
    }
}

/// Freeze `value`, returning the schema and the data blob.
pub(crate) fn freeze<T: Freeze>(value: &T) -> Result<(Schema, Vec<u8>)> {
    let mut root = PlanNode::None;
    value.plan(&mut root)?;
    let schema = plan_to_schema(&root);
    let mut buf = vec![0u8; root.bit_size().div_ceil(8) as usize];
    value.emit(&mut buf, 0, 0, &root)?;
    Ok((schema, buf))
}

//// Plan -> schema ////

fn plan_to_schema(root: &PlanNode) -> Schema {
    let mut layouts = indexmap::IndexSet::new();
    let root_layout = match cvt_layout(root, &mut layouts) {
        Some(id) => id,
        // A fully-elided root (every field zero). Keep a single empty layout
        // so the schema stays well-formed.
        None => {
            layouts.insert(SchemaLayout::default());
            0
        }
    };
    Schema {
        root_layout,
        layouts: layouts.into_iter().collect(),
    }
}

fn intern(layouts: &mut indexmap::IndexSet<SchemaLayout>, layout: SchemaLayout) -> u16 {
    let (id, _) = layouts.insert_full(layout);
    u16::try_from(id).expect("layout count bounded by plan size")
}

fn cvt_layout(node: &PlanNode, layouts: &mut indexmap::IndexSet<SchemaLayout>) -> Option<u16> {
    if node.bit_size() == 0 {
        return None;
    }
    let layout = match node {
        PlanNode::None => return None,
        PlanNode::Int { bits } => SchemaLayout {
            bits: *bits,
            fields: Vec::new(),
        },
        PlanNode::Struct { fields } => {
            let mut out_fields = Vec::new();
            let mut offset = 0u64;
            for (idx, field) in fields.iter().enumerate() {
                if let Some(layout_id) = cvt_layout(field, layouts) {
                    out_fields.push(SchemaField {
                        field_id: idx as u16 + 1,
                        layout_id,
                        bit_offset: offset as u32,
                    });
                }
                offset += field.bit_size();
            }
            SchemaLayout {
                bits: offset as u32,
                fields: out_fields,
            }
        }
        PlanNode::Bytes { count_bits } => collection_layout(layouts, *count_bits, None, true),
        PlanNode::List { count_bits, elem } => {
            let elem_id = cvt_layout(elem, layouts);
            if *count_bits == 0 {
                return None;
            }
            collection_layout(layouts, *count_bits, elem_id, elem_id.is_some())
        }
        PlanNode::Opt { inner, .. } => {
            let flag_id = intern(
                layouts,
                SchemaLayout {
                    bits: 1,
                    fields: Vec::new(),
                },
            );
            let mut fields = vec![SchemaField {
                field_id: 1,
                layout_id: flag_id,
                bit_offset: 0,
            }];
            if let Some(inner_id) = cvt_layout(inner, layouts) {
                fields.push(SchemaField {
                    field_id: 2,
                    layout_id: inner_id,
                    bit_offset: 1,
                });
            }
            SchemaLayout {
                bits: node.bit_size() as u32,
                fields,
            }
        }
    };
    Some(intern(layouts, layout))
}

/// Build the struct layout shared by byte strings and lists:
/// field 1 = distance, field 2 = count, field 3 = element layout (lists with
/// stored elements only).
fn collection_layout(
    layouts: &mut indexmap::IndexSet<SchemaLayout>,
    count_bits: u32,
    elem_id: Option<u16>,
    store_distance: bool,
) -> SchemaLayout {
    let count_id = intern(
        layouts,
        SchemaLayout {
            bits: count_bits,
            fields: Vec::new(),
        },
    );
    let mut fields = Vec::new();
    let mut bits = count_bits;
    // Byte strings always store a distance; lists elide it together with the
    // element layout when every element is zero.
    if store_distance {
        let dist_id = intern(
            layouts,
            SchemaLayout {
                bits: DISTANCE_BITS,
                fields: Vec::new(),
            },
        );
        fields.push(SchemaField {
            field_id: 1,
            layout_id: dist_id,
            bit_offset: 0,
        });
        bits += DISTANCE_BITS;
    }
    fields.push(SchemaField {
        field_id: 2,
        layout_id: count_id,
        bit_offset: if store_distance { DISTANCE_BITS } else { 0 },
    });
    if let Some(elem_id) = elem_id {
        fields.push(SchemaField {
            field_id: 3,
            layout_id: elem_id,
            bit_offset: 0,
        });
    }
    SchemaLayout { bits, fields }
}

//// Thawing ////

/// The raw frozen bytes with their schema.
#[derive(Clone, Copy)]
pub(crate) struct Source<'a> {
    pub schema: &'a Schema,
    pub bytes: &'a [u8],
}

impl<'a> Source<'a> {
    pub(crate) fn root(&self) -> Result<RawView<'a>> {
        let layout = self
            .schema
            .root()
            .ok_or_else(|| err("missing root layout"))?;
        Ok(RawView {
            src: *self,
            layout: Some(layout),
            storage: 0,
            bit: 0,
        })
    }

    /// Load `bits` bits at absolute bit position `pos`, little-endian.
    fn load_bits(&self, pos: u64, bits: u32) -> Result<u64> {
        debug_assert!(bits <= 64, "checked by schema validation");
        if bits == 0 {
            return Ok(0);
        }
        let last_byte = (pos + u64::from(bits) - 1) / 8;
        if last_byte >= self.bytes.len() as u64 {
            return Err(err("bit range out of bounds"));
        }
        let (byte_idx, bit_start) = ((pos / 8) as usize, (pos % 8) as u32);

        // Load an 8-byte chunk; spill into a ninth byte when the field
        // straddles it.
        let rest = &self.bytes[byte_idx..];
        let x = if let Some(chunk) = rest.first_chunk::<8>() {
            u64::from_le_bytes(*chunk)
        } else {
            let mut buf = [0u8; 8];
            buf[..rest.len()].copy_from_slice(rest);
            u64::from_le_bytes(buf)
        };

        let end = bit_start + bits;
        Ok(if end <= 64 {
            x << (64 - end) >> (64 - bits)
        } else {
            let hi = u64::from(rest[8]);
            let overshoot = end - 64;
            x >> bit_start | hi << (64 - overshoot) >> (64 - bits)
        })
    }
}

/// A lazily-resolved view of one frozen value.
///
/// `layout == None` represents an elided field; all loads return zero/empty.
#[derive(Clone, Copy)]
pub(crate) struct RawView<'a> {
    src: Source<'a>,
    layout: Option<&'a SchemaLayout>,
    /// Byte offset of the containing region.
    storage: u64,
    /// Bit offset within the region.
    bit: u64,
}

impl<'a> RawView<'a> {
    /// Resolve a struct field by id.
    pub(crate) fn field(&self, field_id: u16) -> RawView<'a> {
        let (layout, offset) = match self.layout.and_then(|l| l.field(field_id)) {
            Some(f) => (self.src.schema.layout(f.layout_id), u64::from(f.bit_offset)),
            None => (None, 0),
        };
        RawView {
            src: self.src,
            layout,
            storage: self.storage,
            bit: self.bit + offset,
        }
    }

    fn load_int(&self) -> Result<u64> {
        let Some(layout) = self.layout else {
            return Ok(0);
        };
        if !layout.fields.is_empty() {
            return Err(err("expected a primitive layout"));
        }
        self.src.load_bits(self.storage * 8 + self.bit, layout.bits)
    }

    pub(crate) fn load<T: Thaw<'a>>(&self) -> Result<T> {
        T::thaw(*self)
    }

    fn out_of_line(&self) -> Result<(u64, u64)> {
        let distance = self.field(1).load_int()?;
        let count = self.field(2).load_int()?;
        let region = self
            .storage
            .checked_add(distance)
            .ok_or_else(|| err("out-of-line distance overflows"))?;
        Ok((region, count))
    }
}

/// Types that can be thawed from a frozen view.
pub(crate) trait Thaw<'a>: Sized {
    fn thaw(view: RawView<'a>) -> Result<Self>;
}

impl<'a> Thaw<'a> for bool {
    fn thaw(view: RawView<'a>) -> Result<Self> {
        Ok(view.load_int()? != 0)
    }
}

impl<'a> Thaw<'a> for u32 {
    fn thaw(view: RawView<'a>) -> Result<Self> {
        view.load_int()?
            .try_into()
            .map_err(|_| err("integer value out of u32 range"))
    }
}

impl<'a> Thaw<'a> for u64 {
    fn thaw(view: RawView<'a>) -> Result<Self> {
        view.load_int()
    }
}

impl<'a> Thaw<'a> for BString {
    fn thaw(view: RawView<'a>) -> Result<Self> {
        if view.layout.is_none() {
            return Ok(BString::default());
        }
        let (region, count) = view.out_of_line()?;
        let bytes = usize::try_from(region)
            .ok()
            .zip(usize::try_from(count).ok())
            .and_then(|(start, len)| view.src.bytes.get(start..start.checked_add(len)?))
            .ok_or_else(|| err("byte string out of bounds"))?;
        Ok(bytes.into())
    }
}

impl<'a, T: Thaw<'a>> Thaw<'a> for Vec<T> {
    fn thaw(view: RawView<'a>) -> Result<Self> {
        let Some(layout) = view.layout else {
            return Ok(Vec::new());
        };
        let (region, count) = view.out_of_line()?;
        let total_bits = view.src.bytes.len() as u64 * 8;
        if count > total_bits {
            return Err(err("list count out of bounds"));
        }
        let elem_layout = layout
            .field(3)
            .and_then(|f| view.src.schema.layout(f.layout_id));
        let elem_bits = elem_layout.map_or(0, |l| l.bits);
        if elem_bits != 0 {
            let end_bit = count
                .checked_mul(elem_bits.into())
                .and_then(|bits| (region * 8).checked_add(bits))
                .ok_or_else(|| err("list storage overflows"))?;
            if end_bit > total_bits {
                return Err(err("list storage out of bounds"));
            }
        }
        let mut out = Vec::with_capacity(count as usize);
        for i in 0..count {
            let elem_view = RawView {
                src: view.src,
                layout: elem_layout,
                storage: region,
                bit: i * u64::from(elem_bits),
            };
            out.push(T::thaw(elem_view)?);
        }
        Ok(out)
    }
}

impl<'a, T: Thaw<'a>> Thaw<'a> for Option<T> {
    fn thaw(view: RawView<'a>) -> Result<Self> {
        if view.layout.is_none() || !view.field(1).load::<bool>()? {
            return Ok(None);
        }
        Ok(Some(view.field(2).load()?))
    }
}

/// Thaw a value of type `T` from a schema and a frozen blob.
pub(crate) fn thaw<'a, T: Thaw<'a>>(schema: &'a Schema, bytes: &'a [u8]) -> Result<T> {
    Source { schema, bytes }.root()?.load()
}

/// Implement [`Freeze`] and [`Thaw`] for a struct with consecutive 1-based
/// field ids.
macro_rules! impl_frozen_struct {
    ($ty:ident { $($id:tt => $field:ident,)* }) => {
        impl crate::metadata::frozen::Freeze for $ty {
            fn plan(
                &self,
                node: &mut crate::metadata::frozen::PlanNode,
            ) -> std::result::Result<(), crate::metadata::Error> {
                const FIELD_CNT: usize = [$($id),*].len();
                let fields = node.as_struct(FIELD_CNT)?;
                $(self.$field.plan(&mut fields[$id - 1])?;)*
                Ok(())
            }

            fn emit(
                &self,
                out: &mut Vec<u8>,
                storage: u64,
                bit: u64,
                node: &crate::metadata::frozen::PlanNode,
            ) -> std::result::Result<(), crate::metadata::Error> {
                use crate::metadata::frozen::PlanNode;
                let fields = match node {
                    PlanNode::None => return Ok(()),
                    PlanNode::Struct { fields } => fields,
                    _ => return Err(crate::metadata::Error(
                        "emit type mismatch: expected a struct".into(),
                    )),
                };
                let mut offset = 0u64;
                $(
                    self.$field.emit(out, storage, bit + offset, &fields[$id - 1])?;
                    offset += fields[$id - 1].bit_size();
                )*
                let _ = offset;
                Ok(())
            }
        }

        impl<'a> crate::metadata::frozen::Thaw<'a> for $ty {
            fn thaw(
                view: crate::metadata::frozen::RawView<'a>,
            ) -> std::result::Result<Self, crate::metadata::Error> {
                Ok(Self {
                    $($field: view.field($id).load()?,)*
                })
            }
        }
    };
}

pub(crate) use impl_frozen_struct;
