use crate::schema::{FieldSlot, Schema};
use crate::value::Value;
use crate::{Error, Result};

#[inline]
pub fn align4(n: usize) -> usize {
    (n + 3) & !3
}

#[inline]
pub fn align8(n: usize) -> usize {
    (n + 7) & !7
}

/// Assembles a tuple in the wire layout described on [`Schema`].
///
/// Values are set by declared field index. Unset fields encode as
/// zero bytes (fixed) or empty (var).
pub struct TupleBuilder<'a> {
    schema: &'a Schema,
    values: Vec<Option<Value>>,
}

impl<'a> TupleBuilder<'a> {
    #[inline]
    pub fn new(schema: &'a Schema) -> Self {
        TupleBuilder {
            values: vec![None; schema.field_count()],
            schema,
        }
    }

    /// Build a tuple from all field values in declaration order.
    pub fn from_values(schema: &'a Schema, values: &[Value]) -> Result<Vec<u8>> {
        if values.len() != schema.field_count() {
            return Err(Error::ValueCountMismatch);
        }
        let mut b = TupleBuilder::new(schema);
        for (idx, v) in values.iter().enumerate() {
            b.set(idx, v.clone())?;
        }
        b.finish()
    }

    #[inline]
    pub fn set(&mut self, field_idx: usize, value: Value) -> Result<&mut Self> {
        let field = self
            .schema
            .fields()
            .get(field_idx)
            .ok_or(Error::FieldIndexOutOfBound)?;
        if value.field_type() != field.field_type {
            return Err(Error::ValueTypeMismatch);
        }
        self.values[field_idx] = Some(value);
        Ok(self)
    }

    pub fn finish(self) -> Result<Vec<u8>> {
        let schema = self.schema;
        let mut var_len = 0usize;
        for &field_idx in schema.var_fields() {
            let len = match &self.values[field_idx] {
                Some(Value::Text(s)) => s.len(),
                Some(Value::Blob(b)) => b.len(),
                None => 0,
                Some(_) => return Err(Error::ValueTypeMismatch),
            };
            var_len += 4 + align4(len);
        }
        let total = if schema.var_field_count() == 0 {
            schema.fixed_len()
        } else {
            schema.var_offset() + var_len
        };
        let mut out = vec![0u8; total];
        for f in schema.fixed_fields() {
            let dst = &mut out[f.offset..f.offset + f.len];
            match &self.values[f.field_idx] {
                None => {}
                Some(Value::SmallInt(v)) => dst.copy_from_slice(&v.to_le_bytes()),
                Some(Value::Int(v)) => dst.copy_from_slice(&v.to_le_bytes()),
                Some(Value::BigInt(v)) => dst.copy_from_slice(&v.to_le_bytes()),
                Some(Value::Float(v)) => dst.copy_from_slice(&v.to_le_bytes()),
                Some(Value::Double(v)) => dst.copy_from_slice(&v.to_le_bytes()),
                Some(_) => return Err(Error::ValueTypeMismatch),
            }
        }
        let mut off = schema.var_offset();
        for &field_idx in schema.var_fields() {
            let bytes: &[u8] = match &self.values[field_idx] {
                Some(Value::Text(s)) => s.as_bytes(),
                Some(Value::Blob(b)) => b,
                None => &[],
                Some(_) => return Err(Error::ValueTypeMismatch),
            };
            out[off..off + 4].copy_from_slice(&(bytes.len() as u32).to_le_bytes());
            off += 4;
            out[off..off + bytes.len()].copy_from_slice(bytes);
            off += align4(bytes.len());
        }
        debug_assert_eq!(off, total.max(schema.var_offset()));
        Ok(out)
    }
}

/// Read-only view over a tuple in wire layout.
pub struct TupleReader<'a> {
    schema: &'a Schema,
    data: &'a [u8],
}

impl<'a> TupleReader<'a> {
    #[inline]
    pub fn new(schema: &'a Schema, data: &'a [u8]) -> Result<Self> {
        if data.len() < schema.min_tuple_len() {
            return Err(Error::InvalidFormat);
        }
        Ok(TupleReader { schema, data })
    }

    #[inline]
    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    /// Raw bytes of a var-size field.
    pub fn var_bytes(&self, field_idx: usize) -> Result<&'a [u8]> {
        let target = self.schema.var_slot(field_idx)?;
        let mut off = self.schema.var_offset();
        for slot in 0..=target {
            if off + 4 > self.data.len() {
                return Err(Error::InvalidFormat);
            }
            let len =
                u32::from_le_bytes(self.data[off..off + 4].try_into().unwrap()) as usize;
            off += 4;
            if off + len > self.data.len() {
                return Err(Error::InvalidFormat);
            }
            if slot == target {
                return Ok(&self.data[off..off + len]);
            }
            off += align4(len);
        }
        unreachable!()
    }

    /// Decode the value of a declared field.
    pub fn value(&self, field_idx: usize) -> Result<Value> {
        let field = self
            .schema
            .fields()
            .get(field_idx)
            .ok_or(Error::FieldIndexOutOfBound)?;
        match self.schema.slot(field_idx)? {
            FieldSlot::Fixed(slot) => {
                let f = self.schema.fixed_fields()[slot];
                let raw = self
                    .data
                    .get(f.offset..f.offset + f.len)
                    .ok_or(Error::InvalidFormat)?;
                let v = match field.field_type {
                    crate::FieldType::SmallInt => {
                        Value::SmallInt(i16::from_le_bytes(raw.try_into().unwrap()))
                    }
                    crate::FieldType::Int => {
                        Value::Int(i32::from_le_bytes(raw.try_into().unwrap()))
                    }
                    crate::FieldType::BigInt => {
                        Value::BigInt(i64::from_le_bytes(raw.try_into().unwrap()))
                    }
                    crate::FieldType::Float => {
                        Value::Float(f32::from_le_bytes(raw.try_into().unwrap()))
                    }
                    crate::FieldType::Double => {
                        Value::Double(f64::from_le_bytes(raw.try_into().unwrap()))
                    }
                    _ => unreachable!("var type in fixed slot"),
                };
                Ok(v)
            }
            FieldSlot::Var(_) => {
                let bytes = self.var_bytes(field_idx)?;
                match field.field_type {
                    crate::FieldType::Text => std::str::from_utf8(bytes)
                        .map(|s| Value::Text(String::from(s)))
                        .map_err(|_| Error::InvalidFormat),
                    crate::FieldType::Blob => Ok(Value::Blob(bytes.to_vec())),
                    _ => unreachable!("fixed type in var slot"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Field, FieldType};

    fn sample_schema() -> Schema {
        Schema::new(vec![
            Field::new("number", FieldType::Int),
            Field::new("text1", FieldType::Text),
            Field::new("largenumber", FieldType::BigInt),
            Field::new("text2", FieldType::Text),
        ])
        .unwrap()
    }

    #[test]
    fn test_tuple_round_trip() {
        let schema = sample_schema();
        let data = TupleBuilder::from_values(
            &schema,
            &[
                Value::Int(12),
                Value::from("hello"),
                Value::BigInt(0x7FFF_FFFF_0000_0001),
                Value::from("world"),
            ],
        )
        .unwrap();
        // fixed 12 + (4 + 8) + (4 + 8)
        assert_eq!(data.len(), 36);
        let reader = TupleReader::new(&schema, &data).unwrap();
        assert_eq!(reader.value(0).unwrap(), Value::Int(12));
        assert_eq!(reader.value(1).unwrap(), Value::from("hello"));
        assert_eq!(
            reader.value(2).unwrap(),
            Value::BigInt(0x7FFF_FFFF_0000_0001)
        );
        assert_eq!(reader.value(3).unwrap(), Value::from("world"));
        assert_eq!(reader.var_bytes(1).unwrap(), b"hello");
    }

    #[test]
    fn test_tuple_empty_var_field() {
        let schema = sample_schema();
        let data = TupleBuilder::from_values(
            &schema,
            &[
                Value::Int(1),
                Value::from(""),
                Value::BigInt(2),
                Value::from("x"),
            ],
        )
        .unwrap();
        assert_eq!(data.len(), 12 + 4 + 4 + 4);
        let reader = TupleReader::new(&schema, &data).unwrap();
        assert_eq!(reader.var_bytes(1).unwrap(), b"");
        assert_eq!(reader.var_bytes(3).unwrap(), b"x");
    }

    #[test]
    fn test_tuple_fixed_only() {
        let schema = Schema::new(vec![
            Field::new("a", FieldType::SmallInt),
            Field::new("b", FieldType::Double),
        ])
        .unwrap();
        let data =
            TupleBuilder::from_values(&schema, &[Value::SmallInt(-5), Value::Double(2.5)])
                .unwrap();
        assert_eq!(data.len(), 10);
        let reader = TupleReader::new(&schema, &data).unwrap();
        assert_eq!(reader.value(0).unwrap(), Value::SmallInt(-5));
        assert_eq!(reader.value(1).unwrap(), Value::Double(2.5));
    }

    #[test]
    fn test_tuple_type_mismatch() {
        let schema = sample_schema();
        let mut b = TupleBuilder::new(&schema);
        assert!(b.set(0, Value::BigInt(1)).is_err());
        assert!(b.set(9, Value::Int(1)).is_err());
    }

    #[test]
    fn test_tuple_value_count_mismatch() {
        let schema = sample_schema();
        assert!(TupleBuilder::from_values(&schema, &[Value::Int(1)]).is_err());
    }
}
