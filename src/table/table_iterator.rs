use std::sync::Arc;

use crate::tuple::{RidExt, Rid, Tuple, INVALID_RID};

use super::TableHeap;

/// Forward scan over the heap's live tuples. Deleted slots are skipped;
/// the end is the invalid rid sentinel.
pub struct TableIterator {
    heap: Arc<TableHeap>,
    rid: Rid,
}

impl TableIterator {
    pub(super) fn new(heap: Arc<TableHeap>) -> Self {
        let rid = heap.first_rid().unwrap_or(INVALID_RID);
        Self { heap, rid }
    }
}

impl Iterator for TableIterator {
    type Item = Tuple;

    fn next(&mut self) -> Option<Tuple> {
        while self.rid.is_valid() {
            let tuple = self.heap.get_tuple(self.rid).ok().flatten();
            self.rid = self.heap.next_rid(self.rid).unwrap_or(INVALID_RID);
            // a tuple deleted between positioning and reading is skipped
            if tuple.is_some() {
                return tuple;
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{int_schema, int_tuple, test_heap};
    use crate::test_utils::test_path;
    use crate::txn_manager::transaction::{IsolationLevel, Transaction};
    use crate::types::Value;
    use anyhow::Result;

    #[test]
    fn test_scan_skips_deleted() -> Result<()> {
        let path = test_path();
        let heap = test_heap(4, &path);
        let mut txn = Transaction::new(0, IsolationLevel::RepeatableRead);

        let mut rids = Vec::new();
        for i in 0..10 {
            rids.push(heap.insert_tuple(&int_tuple(i), &mut txn, None)?);
        }
        for rid in rids.iter().step_by(2) {
            assert!(heap.mark_delete(*rid, &mut txn)?);
        }

        let seen: Vec<i32> = heap
            .iter()
            .map(|t| match t.value_at(&int_schema(), 0) {
                Value::Integer(v) => v,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(seen, vec![1, 3, 5, 7, 9]);

        std::fs::remove_dir_all(path)?;
        Ok(())
    }

    #[test]
    fn test_scan_empty_heap() -> Result<()> {
        let path = test_path();
        let heap = test_heap(4, &path);

        assert_eq!(heap.iter().count(), 0);

        std::fs::remove_dir_all(path)?;
        Ok(())
    }

    #[test]
    fn test_scan_crosses_pages() -> Result<()> {
        let path = test_path();
        let heap = test_heap(8, &path);
        let mut txn = Transaction::new(0, IsolationLevel::RepeatableRead);

        // enough tuples for several pages
        let total = 1200;
        for i in 0..total {
            heap.insert_tuple(&int_tuple(i), &mut txn, None)?;
        }

        let mut expected = 0;
        for tuple in heap.iter() {
            assert_eq!(tuple.value_at(&int_schema(), 0), Value::Integer(expected));
            expected += 1;
        }
        assert_eq!(expected, total);

        std::fs::remove_dir_all(path)?;
        Ok(())
    }
}
