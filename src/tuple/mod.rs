pub mod schema;

use crate::pages::{PageId, INVALID_PAGE_ID};
use crate::types::{TypeId, Value, NULL_SENTINEL};
use schema::Schema;

pub type SlotId = u32;

/// Record id: the logical pointer to a tuple, stable across in-place
/// updates and invalidated by apply-delete.
pub type Rid = (PageId, SlotId);

pub const INVALID_RID: Rid = (INVALID_PAGE_ID, 0);
pub const RID_SIZE: usize = 8;

pub trait RidExt {
    fn to_bytes(&self) -> [u8; RID_SIZE];
    fn from_bytes(bytes: &[u8]) -> Self;
    fn is_valid(&self) -> bool;
}

impl RidExt for Rid {
    fn to_bytes(&self) -> [u8; RID_SIZE] {
        let mut bytes = [0u8; RID_SIZE];
        bytes[0..4].copy_from_slice(&self.0.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.1.to_le_bytes());
        bytes
    }

    fn from_bytes(bytes: &[u8]) -> Self {
        let page_id = PageId::from_le_bytes(bytes[0..4].try_into().unwrap());
        let slot_id = SlotId::from_le_bytes(bytes[4..8].try_into().unwrap());
        (page_id, slot_id)
    }

    fn is_valid(&self) -> bool {
        self.0 != INVALID_PAGE_ID
    }
}

/// A serialized row. The fixed-length region holds one slot per column at
/// its schema offset; varchar slots hold a u32 offset to a u32
/// length-prefixed payload behind the fixed region. A payload length of
/// [`NULL_SENTINEL`] marks a null.
#[derive(Debug, Clone)]
pub struct Tuple {
    data: Box<[u8]>,
    rid: Rid,
}

impl PartialEq for Tuple {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

impl Tuple {
    pub fn new(values: Vec<Value>, schema: &Schema) -> Self {
        assert_eq!(values.len(), schema.column_count());

        let fixed_len = schema.length();
        let mut data = vec![0u8; fixed_len];

        for (i, value) in values.iter().enumerate() {
            let col = schema.column(i);
            if col.is_inlined() {
                assert_eq!(value.type_id(), col.type_id, "value does not match column type");
                data[col.offset()..col.offset() + col.type_id.size()]
                    .copy_from_slice(&value.to_bytes());
            } else {
                let payload_offset = data.len() as u32;
                data[col.offset()..col.offset() + 4]
                    .copy_from_slice(&payload_offset.to_le_bytes());
                match value {
                    Value::Varchar(s) => {
                        data.extend_from_slice(&(s.len() as u32).to_le_bytes());
                        data.extend_from_slice(s.as_bytes());
                    }
                    Value::Null => data.extend_from_slice(&NULL_SENTINEL.to_le_bytes()),
                    _ => unreachable!("value does not match column type"),
                }
            }
        }

        Self {
            data: data.into_boxed_slice(),
            rid: INVALID_RID,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            data: bytes.to_vec().into_boxed_slice(),
            rid: INVALID_RID,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn rid(&self) -> Rid {
        self.rid
    }

    pub fn set_rid(&mut self, rid: Rid) {
        self.rid = rid;
    }

    pub fn value_at(&self, schema: &Schema, idx: usize) -> Value {
        let col = schema.column(idx);
        match col.type_id {
            TypeId::Varchar => {
                let slot = col.offset();
                let payload =
                    u32::from_le_bytes(self.data[slot..slot + 4].try_into().unwrap()) as usize;
                let len =
                    u32::from_le_bytes(self.data[payload..payload + 4].try_into().unwrap());
                if len == NULL_SENTINEL {
                    return Value::Null;
                }
                let start = payload + 4;
                let bytes = &self.data[start..start + len as usize];
                Value::Varchar(String::from_utf8(bytes.to_vec()).expect("invalid utf8 payload"))
            }
            ty => Value::from_bytes(ty, &self.data[col.offset()..]),
        }
    }

    pub fn values(&self, schema: &Schema) -> Vec<Value> {
        (0..schema.column_count())
            .map(|i| self.value_at(schema, i))
            .collect()
    }

    /// Project the key columns out of a table tuple into a key tuple laid
    /// out by `key_schema`. The result is what generic keys are built from.
    pub fn key_from_tuple(&self, schema: &Schema, key_schema: &Schema, key_attrs: &[usize]) -> Tuple {
        let values = key_attrs
            .iter()
            .map(|&i| self.value_at(schema, i))
            .collect();
        Tuple::new(values, key_schema)
    }
}
