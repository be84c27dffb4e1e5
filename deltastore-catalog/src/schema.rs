use crate::{Error, Result};
use bitflags::bitflags;

/// Type of a single field.
///
/// Fixed-size types occupy a constant number of bytes inside the
/// fixed region of a tuple. Var-size types are stored in the
/// length-prefixed tail of the tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FieldType {
    SmallInt = 1,
    Int = 2,
    BigInt = 3,
    Float = 4,
    Double = 5,
    Text = 6,
    Blob = 7,
}

impl FieldType {
    /// Returns the inline length of a fixed-size type, None for
    /// var-size types.
    #[inline]
    pub fn fixed_len(self) -> Option<usize> {
        match self {
            FieldType::SmallInt => Some(2),
            FieldType::Int | FieldType::Float => Some(4),
            FieldType::BigInt | FieldType::Double => Some(8),
            FieldType::Text | FieldType::Blob => None,
        }
    }

    #[inline]
    pub fn is_fixed(self) -> bool {
        self.fixed_len().is_some()
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FieldAttributes: u32 {
        // whether value can be null.
        const NULLABLE = 0x01;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub field_type: FieldType,
    pub attributes: FieldAttributes,
}

impl Field {
    #[inline]
    pub fn new(name: &str, field_type: FieldType) -> Self {
        Field {
            name: String::from(name),
            field_type,
            attributes: FieldAttributes::empty(),
        }
    }

    #[inline]
    pub fn nullable(name: &str, field_type: FieldType) -> Self {
        Field {
            name: String::from(name),
            field_type,
            attributes: FieldAttributes::NULLABLE,
        }
    }
}

/// Location of a declared field inside the tuple layout.
#[derive(Debug, Clone, Copy)]
pub(crate) enum FieldSlot {
    /// Index into the fixed field list.
    Fixed(usize),
    /// Index into the var field list.
    Var(usize),
}

/// A fixed-size field resolved to its slot in the fixed region.
#[derive(Debug, Clone, Copy)]
pub struct FixedField {
    /// Index of the field in declaration order.
    pub field_idx: usize,
    /// Byte offset inside the fixed region.
    pub offset: usize,
    /// Inline length in bytes.
    pub len: usize,
}

/// Immutable table schema.
///
/// Tuple wire layout:
///
/// |--------------|----------------------------------------------------|
/// | region       | content                                            |
/// |--------------|----------------------------------------------------|
/// | fixed region | fixed-size fields packed in descending size order  |
/// | padding      | zero bytes up to 4-byte alignment                  |
/// | var region   | per var field: u32 length + bytes, 4-byte aligned  |
/// |--------------|----------------------------------------------------|
///
/// Sorting fixed fields by descending size keeps every field naturally
/// aligned without padding between fields.
#[derive(Debug, Clone)]
pub struct Schema {
    fields: Vec<Field>,
    slots: Vec<FieldSlot>,
    fixed: Vec<FixedField>,
    var: Vec<usize>,
    fixed_len: usize,
}

impl Schema {
    pub fn new(fields: Vec<Field>) -> Result<Self> {
        if fields.is_empty() {
            return Err(Error::EmptySchema);
        }
        let mut fixed: Vec<FixedField> = vec![];
        let mut var: Vec<usize> = vec![];
        for (field_idx, field) in fields.iter().enumerate() {
            match field.field_type.fixed_len() {
                Some(len) => fixed.push(FixedField {
                    field_idx,
                    offset: 0,
                    len,
                }),
                None => var.push(field_idx),
            }
        }
        // stable sort by descending size, ties keep declaration order.
        fixed.sort_by(|a, b| b.len.cmp(&a.len));
        let mut offset = 0usize;
        for f in &mut fixed {
            f.offset = offset;
            offset += f.len;
        }
        let fixed_len = offset;
        let mut slots = vec![FieldSlot::Fixed(0); fields.len()];
        for (slot, f) in fixed.iter().enumerate() {
            slots[f.field_idx] = FieldSlot::Fixed(slot);
        }
        for (slot, &field_idx) in var.iter().enumerate() {
            slots[field_idx] = FieldSlot::Var(slot);
        }
        Ok(Schema {
            fields,
            slots,
            fixed,
            var,
            fixed_len,
        })
    }

    #[inline]
    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    #[inline]
    pub fn field(&self, idx: usize) -> &Field {
        &self.fields[idx]
    }

    #[inline]
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Fixed fields in layout order (descending size).
    #[inline]
    pub fn fixed_fields(&self) -> &[FixedField] {
        &self.fixed
    }

    /// Declaration indexes of var-size fields in layout order.
    #[inline]
    pub fn var_fields(&self) -> &[usize] {
        &self.var
    }

    /// Total length of the fixed region, without trailing padding.
    #[inline]
    pub fn fixed_len(&self) -> usize {
        self.fixed_len
    }

    #[inline]
    pub fn var_field_count(&self) -> usize {
        self.var.len()
    }

    /// Byte offset of the var region inside a tuple.
    #[inline]
    pub fn var_offset(&self) -> usize {
        crate::tuple::align4(self.fixed_len)
    }

    /// Smallest possible tuple length under this schema.
    ///
    /// A schema without var fields produces tuples of exactly the
    /// fixed region length, without trailing padding.
    #[inline]
    pub fn min_tuple_len(&self) -> usize {
        if self.var.is_empty() {
            self.fixed_len
        } else {
            self.var_offset() + self.var.len() * 4
        }
    }

    #[inline]
    pub(crate) fn slot(&self, field_idx: usize) -> Result<FieldSlot> {
        self.slots
            .get(field_idx)
            .copied()
            .ok_or(Error::FieldIndexOutOfBound)
    }

    /// Position of a var field within the var region walk, given its
    /// declaration index.
    #[inline]
    pub(crate) fn var_slot(&self, field_idx: usize) -> Result<usize> {
        match self.slot(field_idx)? {
            FieldSlot::Var(slot) => Ok(slot),
            FieldSlot::Fixed(_) => Err(Error::ValueTypeMismatch),
        }
    }

    /// Build a sub-schema from a list of declared field indexes.
    pub fn project(&self, field_idxs: &[usize]) -> Result<Schema> {
        let mut fields = Vec::with_capacity(field_idxs.len());
        for &idx in field_idxs {
            let field = self.fields.get(idx).ok_or(Error::FieldIndexOutOfBound)?;
            fields.push(field.clone());
        }
        Schema::new(fields)
    }
}
