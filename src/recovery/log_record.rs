use crate::pages::{Lsn, PageId, INVALID_LSN};
use crate::tuple::{Rid, RidExt, Tuple, RID_SIZE};
use crate::txn_manager::TxnId;

/// Fixed header preceding every record:
///
/// ```text
/// | size(u32) | lsn(i32) | txn_id(i32) | prev_lsn(i32) | type(u32) |
/// ```
///
/// Payloads follow the header: RIDs as two i32, tuples as u32 size plus
/// data. The reader detects the end of a buffer by a zero size field.
pub const LOG_HEADER_SIZE: usize = 20;

#[derive(Debug, Clone, PartialEq)]
pub enum LogPayload {
    Begin,
    Commit,
    Abort,
    Insert { rid: Rid, tuple: Tuple },
    MarkDelete { rid: Rid, tuple: Tuple },
    ApplyDelete { rid: Rid, tuple: Tuple },
    RollbackDelete { rid: Rid, tuple: Tuple },
    Update { rid: Rid, old_tuple: Tuple, new_tuple: Tuple },
    InitPage { page_id: PageId, prev_page_id: PageId },
}

impl LogPayload {
    fn type_code(&self) -> u32 {
        match self {
            LogPayload::Insert { .. } => 1,
            LogPayload::MarkDelete { .. } => 2,
            LogPayload::ApplyDelete { .. } => 3,
            LogPayload::RollbackDelete { .. } => 4,
            LogPayload::Update { .. } => 5,
            LogPayload::Begin => 6,
            LogPayload::Commit => 7,
            LogPayload::Abort => 8,
            LogPayload::InitPage { .. } => 9,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub lsn: Lsn,
    pub txn_id: TxnId,
    pub prev_lsn: Lsn,
    pub payload: LogPayload,
}

impl LogRecord {
    pub fn new(txn_id: TxnId, prev_lsn: Lsn, payload: LogPayload) -> Self {
        Self {
            lsn: INVALID_LSN,
            txn_id,
            prev_lsn,
            payload,
        }
    }

    /// Serialized size in bytes.
    pub fn size(&self) -> u32 {
        let payload = match &self.payload {
            LogPayload::Begin | LogPayload::Commit | LogPayload::Abort => 0,
            LogPayload::Insert { tuple, .. }
            | LogPayload::MarkDelete { tuple, .. }
            | LogPayload::ApplyDelete { tuple, .. }
            | LogPayload::RollbackDelete { tuple, .. } => RID_SIZE + 4 + tuple.size(),
            LogPayload::Update {
                old_tuple,
                new_tuple,
                ..
            } => RID_SIZE + 4 + old_tuple.size() + 4 + new_tuple.size(),
            LogPayload::InitPage { .. } => RID_SIZE + 4,
        };
        (LOG_HEADER_SIZE + payload) as u32
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.size() as usize);
        buf.extend_from_slice(&self.size().to_le_bytes());
        buf.extend_from_slice(&self.lsn.to_le_bytes());
        buf.extend_from_slice(&self.txn_id.to_le_bytes());
        buf.extend_from_slice(&self.prev_lsn.to_le_bytes());
        buf.extend_from_slice(&self.payload.type_code().to_le_bytes());

        let put_tuple = |buf: &mut Vec<u8>, tuple: &Tuple| {
            buf.extend_from_slice(&(tuple.size() as u32).to_le_bytes());
            buf.extend_from_slice(tuple.data());
        };

        match &self.payload {
            LogPayload::Begin | LogPayload::Commit | LogPayload::Abort => {}
            LogPayload::Insert { rid, tuple }
            | LogPayload::MarkDelete { rid, tuple }
            | LogPayload::ApplyDelete { rid, tuple }
            | LogPayload::RollbackDelete { rid, tuple } => {
                buf.extend_from_slice(&rid.to_bytes());
                put_tuple(&mut buf, tuple);
            }
            LogPayload::Update {
                rid,
                old_tuple,
                new_tuple,
            } => {
                buf.extend_from_slice(&rid.to_bytes());
                put_tuple(&mut buf, old_tuple);
                put_tuple(&mut buf, new_tuple);
            }
            LogPayload::InitPage {
                page_id,
                prev_page_id,
            } => {
                let rid: Rid = (*page_id, 0);
                buf.extend_from_slice(&rid.to_bytes());
                buf.extend_from_slice(&prev_page_id.to_le_bytes());
            }
        }

        debug_assert_eq!(buf.len(), self.size() as usize);
        buf
    }

    /// Parse one record at the start of `bytes`. `None` on a zero size
    /// field or a record that does not fit in `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Option<LogRecord> {
        if bytes.len() < LOG_HEADER_SIZE {
            return None;
        }
        let size = u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize;
        if size < LOG_HEADER_SIZE || size > bytes.len() {
            return None;
        }

        let lsn = Lsn::from_le_bytes(bytes[4..8].try_into().unwrap());
        let txn_id = TxnId::from_le_bytes(bytes[8..12].try_into().unwrap());
        let prev_lsn = Lsn::from_le_bytes(bytes[12..16].try_into().unwrap());
        let type_code = u32::from_le_bytes(bytes[16..20].try_into().unwrap());

        let get_rid = |at: usize| Rid::from_bytes(&bytes[at..at + RID_SIZE]);
        let get_tuple = |at: usize| -> (Tuple, usize) {
            let len = u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap()) as usize;
            (Tuple::from_bytes(&bytes[at + 4..at + 4 + len]), at + 4 + len)
        };

        let body = LOG_HEADER_SIZE;
        let payload = match type_code {
            1..=4 => {
                let rid = get_rid(body);
                let (tuple, _) = get_tuple(body + RID_SIZE);
                match type_code {
                    1 => LogPayload::Insert { rid, tuple },
                    2 => LogPayload::MarkDelete { rid, tuple },
                    3 => LogPayload::ApplyDelete { rid, tuple },
                    _ => LogPayload::RollbackDelete { rid, tuple },
                }
            }
            5 => {
                let rid = get_rid(body);
                let (old_tuple, next) = get_tuple(body + RID_SIZE);
                let (new_tuple, _) = get_tuple(next);
                LogPayload::Update {
                    rid,
                    old_tuple,
                    new_tuple,
                }
            }
            6 => LogPayload::Begin,
            7 => LogPayload::Commit,
            8 => LogPayload::Abort,
            9 => {
                let rid = get_rid(body);
                let prev_page_id =
                    PageId::from_le_bytes(bytes[body + RID_SIZE..body + RID_SIZE + 4].try_into().unwrap());
                LogPayload::InitPage {
                    page_id: rid.0,
                    prev_page_id,
                }
            }
            _ => return None,
        };

        Some(LogRecord {
            lsn,
            txn_id,
            prev_lsn,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuple::schema::{Column, Schema};
    use crate::types::{TypeId, Value};

    fn sample_tuple() -> Tuple {
        let schema = Schema::new(vec![
            Column::new("id", TypeId::Integer),
            Column::new("name", TypeId::Varchar),
        ]);
        Tuple::new(vec![Value::Integer(1), Value::Varchar("x".into())], &schema)
    }

    fn round_trip(record: LogRecord) {
        let mut bytes = record.to_bytes();
        assert_eq!(bytes.len(), record.size() as usize);
        // trailing zeroes must not confuse the parser
        bytes.extend_from_slice(&[0u8; 32]);
        let parsed = LogRecord::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn test_round_trip_all_types() {
        let tuple = sample_tuple();
        let rid: Rid = (3, 2);

        let mut records = vec![
            LogRecord::new(1, INVALID_LSN, LogPayload::Begin),
            LogRecord::new(1, 0, LogPayload::Commit),
            LogRecord::new(2, 5, LogPayload::Abort),
            LogRecord::new(
                1,
                0,
                LogPayload::Insert {
                    rid,
                    tuple: tuple.clone(),
                },
            ),
            LogRecord::new(
                1,
                1,
                LogPayload::MarkDelete {
                    rid,
                    tuple: tuple.clone(),
                },
            ),
            LogRecord::new(
                1,
                2,
                LogPayload::ApplyDelete {
                    rid,
                    tuple: tuple.clone(),
                },
            ),
            LogRecord::new(
                1,
                3,
                LogPayload::RollbackDelete {
                    rid,
                    tuple: tuple.clone(),
                },
            ),
            LogRecord::new(
                1,
                4,
                LogPayload::Update {
                    rid,
                    old_tuple: tuple.clone(),
                    new_tuple: sample_tuple(),
                },
            ),
            LogRecord::new(
                1,
                5,
                LogPayload::InitPage {
                    page_id: 9,
                    prev_page_id: 8,
                },
            ),
        ];
        for (i, record) in records.iter_mut().enumerate() {
            record.lsn = i as Lsn;
        }

        for record in records {
            round_trip(record);
        }
    }

    #[test]
    fn test_zero_size_terminates() {
        assert!(LogRecord::from_bytes(&[0u8; 64]).is_none());
    }
}
