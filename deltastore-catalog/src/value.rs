use crate::schema::FieldType;
use std::cmp::Ordering;

/// A single field value, used to build tuples and to evaluate scan
/// predicates.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    SmallInt(i16),
    Int(i32),
    BigInt(i64),
    Float(f32),
    Double(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl Value {
    #[inline]
    pub fn field_type(&self) -> FieldType {
        match self {
            Value::SmallInt(_) => FieldType::SmallInt,
            Value::Int(_) => FieldType::Int,
            Value::BigInt(_) => FieldType::BigInt,
            Value::Float(_) => FieldType::Float,
            Value::Double(_) => FieldType::Double,
            Value::Text(_) => FieldType::Text,
            Value::Blob(_) => FieldType::Blob,
        }
    }

    /// Compare two values of the same type.
    /// Returns None if the types differ or a float comparison is
    /// undefined.
    #[inline]
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::SmallInt(a), Value::SmallInt(b)) => Some(a.cmp(b)),
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::BigInt(a), Value::BigInt(b)) => Some(a.cmp(b)),
            (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
            (Value::Double(a), Value::Double(b)) => a.partial_cmp(b),
            (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
            (Value::Blob(a), Value::Blob(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Numeric addition for aggregation. Integers widen to BigInt,
    /// floats widen to Double.
    #[inline]
    pub fn checked_add(&self, other: &Value) -> Option<Value> {
        let a = self.as_f64_or_i64()?;
        let b = other.as_f64_or_i64()?;
        match (a, b) {
            (Num::Int(a), Num::Int(b)) => a.checked_add(b).map(Value::BigInt),
            (a, b) => Some(Value::Double(a.as_f64() + b.as_f64())),
        }
    }

    #[inline]
    fn as_f64_or_i64(&self) -> Option<Num> {
        match self {
            Value::SmallInt(v) => Some(Num::Int(*v as i64)),
            Value::Int(v) => Some(Num::Int(*v as i64)),
            Value::BigInt(v) => Some(Num::Int(*v)),
            Value::Float(v) => Some(Num::Float(*v as f64)),
            Value::Double(v) => Some(Num::Float(*v)),
            Value::Text(_) | Value::Blob(_) => None,
        }
    }
}

#[derive(Clone, Copy)]
enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    #[inline]
    fn as_f64(self) -> f64 {
        match self {
            Num::Int(v) => v as f64,
            Num::Float(v) => v,
        }
    }
}

impl From<i16> for Value {
    #[inline]
    fn from(v: i16) -> Self {
        Value::SmallInt(v)
    }
}

impl From<i32> for Value {
    #[inline]
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<i64> for Value {
    #[inline]
    fn from(v: i64) -> Self {
        Value::BigInt(v)
    }
}

impl From<f32> for Value {
    #[inline]
    fn from(v: f32) -> Self {
        Value::Float(v)
    }
}

impl From<f64> for Value {
    #[inline]
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<&str> for Value {
    #[inline]
    fn from(v: &str) -> Self {
        Value::Text(String::from(v))
    }
}

impl From<&[u8]> for Value {
    #[inline]
    fn from(v: &[u8]) -> Self {
        Value::Blob(v.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_compare_same_type() {
        assert_eq!(
            Value::Int(1).compare(&Value::Int(2)),
            Some(Ordering::Less)
        );
        assert_eq!(
            Value::Text("b".into()).compare(&Value::Text("a".into())),
            Some(Ordering::Greater)
        );
        assert_eq!(Value::Int(1).compare(&Value::BigInt(1)), None);
    }

    #[test]
    fn test_value_checked_add() {
        assert_eq!(
            Value::Int(1).checked_add(&Value::Int(2)),
            Some(Value::BigInt(3))
        );
        assert_eq!(
            Value::Double(1.5).checked_add(&Value::Int(2)),
            Some(Value::Double(3.5))
        );
        assert_eq!(Value::Text("x".into()).checked_add(&Value::Int(1)), None);
    }
}
