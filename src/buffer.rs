//! In-memory accumulator of records that have not reached disk yet.

use crate::core::{RecordId, Result};
use crate::ledger::ResponseRecord;
use std::collections::VecDeque;
use std::sync::Mutex;

struct BufferState {
    records: VecDeque<ResponseRecord>,
    next_record_id: RecordId,
}

/// Appends never touch the disk: they take a short in-process lock, assign the
/// next record id and return. Id order therefore equals append order.
pub struct WriteBuffer {
    state: Mutex<BufferState>,
}

impl WriteBuffer {
    pub fn new(next_record_id: RecordId) -> Self {
        Self {
            state: Mutex::new(BufferState {
                records: VecDeque::new(),
                next_record_id: next_record_id.max(1),
            }),
        }
    }

    /// Build a record with the next id and append it, atomically.
    pub fn append_with(
        &self,
        build: impl FnOnce(RecordId) -> ResponseRecord,
    ) -> Result<ResponseRecord> {
        let mut state = self.state.lock()?;
        let record = build(state.next_record_id);
        state.next_record_id = record.record_id + 1;
        state.records.push_back(record.clone());
        Ok(record)
    }

    /// Append a record that already carries an id (recovered from disk).
    pub fn push_existing(&self, record: ResponseRecord) -> Result<()> {
        let mut state = self.state.lock()?;
        state.next_record_id = state.next_record_id.max(record.record_id + 1);
        state.records.push_back(record);
        Ok(())
    }

    /// Swap out everything buffered so far, oldest first.
    pub fn take_all(&self) -> Result<Vec<ResponseRecord>> {
        let mut state = self.state.lock()?;
        Ok(state.records.drain(..).collect())
    }

    /// Put a batch whose flush failed back ahead of anything appended since.
    pub fn restore_front(&self, batch: Vec<ResponseRecord>) -> Result<()> {
        let mut state = self.state.lock()?;
        for record in batch.into_iter().rev() {
            state.records.push_front(record);
        }
        Ok(())
    }

    /// Drop buffered records that fail `keep`; returns how many were dropped.
    pub fn retain(&self, keep: impl Fn(&ResponseRecord) -> bool) -> Result<usize> {
        let mut state = self.state.lock()?;
        let before = state.records.len();
        state.records.retain(|record| keep(record));
        Ok(before - state.records.len())
    }

    /// Copy of the buffered records, oldest first.
    pub fn snapshot(&self) -> Result<Vec<ResponseRecord>> {
        let state = self.state.lock()?;
        Ok(state.records.iter().cloned().collect())
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.state.lock()?.records.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.state.lock()?.records.is_empty())
    }

    pub fn next_record_id(&self) -> Result<RecordId> {
        Ok(self.state.lock()?.next_record_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;

    fn record(record_id: RecordId) -> ResponseRecord {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        ResponseRecord {
            record_id,
            target_user_id: 1,
            target_username: None,
            chat_id: 1,
            original_message_id: record_id as i64,
            original_sender_id: None,
            original_timestamp: at,
            reply_timestamp: at,
            latency_seconds: 0.0,
            original_text: String::new(),
            reply_text: String::new(),
        }
    }

    #[test]
    fn test_ids_follow_append_order() {
        let buffer = WriteBuffer::new(5);
        let a = buffer.append_with(record).unwrap();
        let b = buffer.append_with(record).unwrap();
        assert_eq!((a.record_id, b.record_id), (5, 6));
        assert_eq!(buffer.next_record_id().unwrap(), 7);
    }

    #[test]
    fn test_restore_front_keeps_order_ahead_of_new_appends() {
        let buffer = WriteBuffer::new(1);
        buffer.append_with(record).unwrap();
        buffer.append_with(record).unwrap();

        let batch = buffer.take_all().unwrap();
        assert!(buffer.is_empty().unwrap());
        buffer.append_with(record).unwrap();
        buffer.restore_front(batch).unwrap();

        let ids = buffer
            .snapshot()
            .unwrap()
            .iter()
            .map(|r| r.record_id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_push_existing_advances_next_id() {
        let buffer = WriteBuffer::new(1);
        buffer.push_existing(record(41)).unwrap();
        assert_eq!(buffer.append_with(record).unwrap().record_id, 42);
    }

    #[test]
    fn test_concurrent_appends_get_unique_ids() {
        let buffer = Arc::new(WriteBuffer::new(1));
        let handles = (0..4)
            .map(|_| {
                let buffer = buffer.clone();
                std::thread::spawn(move || {
                    for _ in 0..250 {
                        buffer.append_with(record).unwrap();
                    }
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().unwrap();
        }

        let ids = buffer
            .take_all()
            .unwrap()
            .into_iter()
            .map(|r| r.record_id)
            .collect::<Vec<_>>();
        assert_eq!(ids, (1..=1000).collect::<Vec<_>>());
    }
}
