pub mod b_plus_tree;
pub mod generic_key;

use std::sync::Arc;

use anyhow::Result;

use crate::buffer_pool::BufferPoolManager;
use crate::tuple::schema::Schema;
use crate::tuple::{Rid, Tuple};
use b_plus_tree::BPlusTree;
use generic_key::{GenericKey, KeyComparator};

/// What an index is built over: the key columns of a table schema.
#[derive(Debug, Clone)]
pub struct IndexMetadata {
    pub name: String,
    pub key_attrs: Vec<usize>,
    pub key_schema: Schema,
    pub table_schema: Schema,
}

impl IndexMetadata {
    pub fn new(name: &str, table_schema: Schema, key_attrs: Vec<usize>) -> Self {
        let key_schema = table_schema.project(&key_attrs);
        Self {
            name: name.to_string(),
            key_attrs,
            key_schema,
            table_schema,
        }
    }
}

/// The four key widths the tree is instantiated at. The builder picks the
/// smallest one the key schema fits in.
enum TreeVariant {
    Key8(BPlusTree<8>),
    Key16(BPlusTree<16>),
    Key32(BPlusTree<32>),
    Key64(BPlusTree<64>),
}

/// Secondary index over a table heap: projects the key columns out of full
/// table tuples and maintains the B+tree mapping keys to RIDs.
pub struct BPlusTreeIndex {
    metadata: IndexMetadata,
    tree: TreeVariant,
}

impl BPlusTreeIndex {
    pub fn new(metadata: IndexMetadata, bpm: Arc<BufferPoolManager>) -> Self {
        let comparator = KeyComparator::new(metadata.key_schema.clone());
        let fixed_len = metadata.key_schema.length();
        let has_varchar = metadata
            .key_schema
            .columns()
            .iter()
            .any(|c| !c.is_inlined());

        // varchar keys carry inline payloads of unknown size; give them the
        // widest key
        let tree = if has_varchar || fixed_len > 32 {
            assert!(fixed_len <= 64, "key schema too wide for a generic key");
            TreeVariant::Key64(BPlusTree::new(bpm, comparator))
        } else if fixed_len > 16 {
            TreeVariant::Key32(BPlusTree::new(bpm, comparator))
        } else if fixed_len > 8 {
            TreeVariant::Key16(BPlusTree::new(bpm, comparator))
        } else {
            TreeVariant::Key8(BPlusTree::new(bpm, comparator))
        };

        Self { metadata, tree }
    }

    pub fn metadata(&self) -> &IndexMetadata {
        &self.metadata
    }

    /// Key tuple projected from a full table tuple.
    pub fn key_of(&self, tuple: &Tuple) -> Tuple {
        tuple.key_from_tuple(
            &self.metadata.table_schema,
            &self.metadata.key_schema,
            &self.metadata.key_attrs,
        )
    }

    /// Insert the entry for a table tuple. `false` on a duplicate key.
    pub fn insert_entry(&self, tuple: &Tuple, rid: Rid) -> Result<bool> {
        let key = self.key_of(tuple);
        match &self.tree {
            TreeVariant::Key8(t) => t.insert(&GenericKey::from_tuple(&key), rid),
            TreeVariant::Key16(t) => t.insert(&GenericKey::from_tuple(&key), rid),
            TreeVariant::Key32(t) => t.insert(&GenericKey::from_tuple(&key), rid),
            TreeVariant::Key64(t) => t.insert(&GenericKey::from_tuple(&key), rid),
        }
    }

    /// Remove the entry for a table tuple. `false` when absent.
    pub fn delete_entry(&self, tuple: &Tuple) -> Result<bool> {
        let key = self.key_of(tuple);
        match &self.tree {
            TreeVariant::Key8(t) => t.remove(&GenericKey::from_tuple(&key)),
            TreeVariant::Key16(t) => t.remove(&GenericKey::from_tuple(&key)),
            TreeVariant::Key32(t) => t.remove(&GenericKey::from_tuple(&key)),
            TreeVariant::Key64(t) => t.remove(&GenericKey::from_tuple(&key)),
        }
    }

    /// Point lookup by key tuple (already in key-schema layout).
    pub fn scan_key(&self, key: &Tuple) -> Result<Option<Rid>> {
        match &self.tree {
            TreeVariant::Key8(t) => t.get_value(&GenericKey::from_tuple(key)),
            TreeVariant::Key16(t) => t.get_value(&GenericKey::from_tuple(key)),
            TreeVariant::Key32(t) => t.get_value(&GenericKey::from_tuple(key)),
            TreeVariant::Key64(t) => t.get_value(&GenericKey::from_tuple(key)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk_manager::DiskManager;
    use crate::test_utils::test_path;
    use crate::tuple::schema::Column;
    use crate::types::{TypeId, Value};

    fn table_schema() -> Schema {
        Schema::new(vec![
            Column::new("id", TypeId::Integer),
            Column::new("name", TypeId::Varchar),
        ])
    }

    fn setup(path: &str) -> BPlusTreeIndex {
        let disk = Arc::new(DiskManager::new(format!("{path}/test.db")).unwrap());
        let bpm = BufferPoolManager::new(32, disk, None);
        let metadata = IndexMetadata::new("pk_id", table_schema(), vec![0]);
        BPlusTreeIndex::new(metadata, bpm)
    }

    fn row(id: i32, name: &str) -> Tuple {
        Tuple::new(
            vec![Value::Integer(id), Value::Varchar(name.into())],
            &table_schema(),
        )
    }

    #[test]
    fn test_insert_then_scan() -> Result<()> {
        let path = test_path();
        let index = setup(&path);

        let tuple = row(7, "alice");
        assert!(index.insert_entry(&tuple, (3, 1))?);

        let key = index.key_of(&tuple);
        assert_eq!(index.scan_key(&key)?, Some((3, 1)));

        std::fs::remove_dir_all(path)?;
        Ok(())
    }

    #[test]
    fn test_duplicate_key() -> Result<()> {
        let path = test_path();
        let index = setup(&path);

        assert!(index.insert_entry(&row(1, "a"), (0, 0))?);
        // same key column, different payload
        assert!(!index.insert_entry(&row(1, "b"), (0, 1))?);

        std::fs::remove_dir_all(path)?;
        Ok(())
    }

    #[test]
    fn test_delete_entry() -> Result<()> {
        let path = test_path();
        let index = setup(&path);

        let tuple = row(2, "bob");
        index.insert_entry(&tuple, (1, 0))?;
        assert!(index.delete_entry(&tuple)?);
        assert_eq!(index.scan_key(&index.key_of(&tuple))?, None);
        assert!(!index.delete_entry(&tuple)?);

        std::fs::remove_dir_all(path)?;
        Ok(())
    }

    #[test]
    fn test_width_selection_by_schema() {
        let path = test_path();
        let disk = Arc::new(DiskManager::new(format!("{path}/test.db")).unwrap());
        let bpm = BufferPoolManager::new(8, disk, None);

        let wide = Schema::new(vec![
            Column::new("a", TypeId::Integer),
            Column::new("b", TypeId::Decimal),
        ]);
        let metadata = IndexMetadata::new("ab", wide, vec![0, 1]);
        let index = BPlusTreeIndex::new(metadata, bpm);
        assert!(matches!(index.tree, TreeVariant::Key16(_)));

        std::fs::remove_dir_all(path).unwrap();
    }
}
