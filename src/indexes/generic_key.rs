use std::cmp::Ordering;

use crate::tuple::schema::Schema;
use crate::tuple::Tuple;
use crate::types::{TypeId, Value, NULL_SENTINEL};

/// Fixed-width key holding the zero-padded bytes of a key tuple. The width
/// is a compile-time parameter so index pages can lay pairs out at fixed
/// offsets; 8/16/32/64 cover every key schema the builder accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenericKey<const N: usize> {
    data: [u8; N],
}

impl<const N: usize> Default for GenericKey<N> {
    fn default() -> Self {
        Self { data: [0u8; N] }
    }
}

impl<const N: usize> GenericKey<N> {
    pub fn from_tuple(tuple: &Tuple) -> Self {
        assert!(
            tuple.size() <= N,
            "key tuple of {} bytes does not fit the {} byte key",
            tuple.size(),
            N
        );
        let mut data = [0u8; N];
        data[..tuple.size()].copy_from_slice(tuple.data());
        Self { data }
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut data = [0u8; N];
        data.copy_from_slice(&bytes[..N]);
        Self { data }
    }

    pub fn as_bytes(&self) -> &[u8; N] {
        &self.data
    }

    /// Decode one key column. Mirrors the tuple layout: inlined columns at
    /// their schema offset, varchar through the u32 offset indirection.
    pub fn to_value(&self, schema: &Schema, idx: usize) -> Value {
        let col = schema.column(idx);
        match col.type_id {
            TypeId::Varchar => {
                let slot = col.offset();
                let payload =
                    u32::from_le_bytes(self.data[slot..slot + 4].try_into().unwrap()) as usize;
                let len = u32::from_le_bytes(self.data[payload..payload + 4].try_into().unwrap());
                if len == NULL_SENTINEL {
                    return Value::Null;
                }
                let start = payload + 4;
                Value::Varchar(
                    String::from_utf8(self.data[start..start + len as usize].to_vec())
                        .expect("invalid utf8 payload"),
                )
            }
            ty => Value::from_bytes(ty, &self.data[col.offset()..]),
        }
    }
}

/// Lexicographic order over the key schema's columns, each compared through
/// the type subsystem.
#[derive(Debug, Clone)]
pub struct KeyComparator {
    key_schema: Schema,
}

impl KeyComparator {
    pub fn new(key_schema: Schema) -> Self {
        Self { key_schema }
    }

    pub fn key_schema(&self) -> &Schema {
        &self.key_schema
    }

    pub fn compare<const N: usize>(&self, lhs: &GenericKey<N>, rhs: &GenericKey<N>) -> Ordering {
        for i in 0..self.key_schema.column_count() {
            let l = lhs.to_value(&self.key_schema, i);
            let r = rhs.to_value(&self.key_schema, i);
            match l.compare(&r) {
                Ordering::Equal => continue,
                order => return order,
            }
        }
        Ordering::Equal
    }
}
