use std::cmp::Ordering;

/// Length prefix marking a null varchar payload.
pub const NULL_SENTINEL: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeId {
    Boolean,
    Integer,
    Decimal,
    Varchar,
}

impl TypeId {
    /// Bytes occupied in the fixed-length region of a tuple. Varchar slots
    /// hold a 4-byte offset into the variable-length region.
    pub fn size(&self) -> usize {
        match self {
            TypeId::Boolean => 1,
            TypeId::Integer => 4,
            TypeId::Decimal => 8,
            TypeId::Varchar => 4,
        }
    }

    pub fn is_inlined(&self) -> bool {
        !matches!(self, TypeId::Varchar)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Boolean(bool),
    Integer(i32),
    Decimal(f64),
    Varchar(String),
    Null,
}

impl Value {
    pub fn type_id(&self) -> TypeId {
        match self {
            Value::Boolean(_) => TypeId::Boolean,
            Value::Integer(_) => TypeId::Integer,
            Value::Decimal(_) => TypeId::Decimal,
            Value::Varchar(_) | Value::Null => TypeId::Varchar,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Fixed-region bytes of an inlined value.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Value::Boolean(b) => vec![*b as u8],
            Value::Integer(i) => i.to_le_bytes().to_vec(),
            Value::Decimal(d) => d.to_le_bytes().to_vec(),
            Value::Varchar(_) | Value::Null => {
                unreachable!("varchar values are serialized through the tuple layout")
            }
        }
    }

    pub fn from_bytes(type_id: TypeId, bytes: &[u8]) -> Self {
        match type_id {
            TypeId::Boolean => Value::Boolean(bytes[0] != 0),
            TypeId::Integer => Value::Integer(i32::from_le_bytes(bytes[..4].try_into().unwrap())),
            TypeId::Decimal => Value::Decimal(f64::from_le_bytes(bytes[..8].try_into().unwrap())),
            TypeId::Varchar => {
                unreachable!("varchar values are deserialized through the tuple layout")
            }
        }
    }

    /// Total order within one type. Comparing across types is a coding error.
    pub fn compare(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Boolean(a), Value::Boolean(b)) => a.cmp(b),
            (Value::Integer(a), Value::Integer(b)) => a.cmp(b),
            (Value::Decimal(a), Value::Decimal(b)) => {
                a.partial_cmp(b).expect("NaN is not storable")
            }
            (Value::Varchar(a), Value::Varchar(b)) => a.cmp(b),
            (Value::Null, Value::Null) => Ordering::Equal,
            // nulls sort first
            (Value::Null, _) => Ordering::Less,
            (_, Value::Null) => Ordering::Greater,
            _ => unreachable!("comparison across types: {:?} vs {:?}", self, other),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Boolean(b) => write!(f, "{b}"),
            Value::Integer(i) => write!(f, "{i}"),
            Value::Decimal(d) => write!(f, "{d}"),
            Value::Varchar(s) => write!(f, "{s}"),
            Value::Null => write!(f, "NULL"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_round_trip() {
        for v in [
            Value::Boolean(true),
            Value::Integer(-42),
            Value::Decimal(3.25),
        ] {
            let bytes = v.to_bytes();
            assert_eq!(bytes.len(), v.type_id().size());
            assert_eq!(Value::from_bytes(v.type_id(), &bytes), v);
        }
    }

    #[test]
    fn test_ordering() {
        assert_eq!(
            Value::Integer(1).compare(&Value::Integer(2)),
            Ordering::Less
        );
        assert_eq!(
            Value::Varchar("b".into()).compare(&Value::Varchar("a".into())),
            Ordering::Greater
        );
        assert_eq!(
            Value::Decimal(1.5).compare(&Value::Decimal(1.5)),
            Ordering::Equal
        );
        assert_eq!(Value::Null.compare(&Value::Varchar("".into())), Ordering::Less);
    }
}
