//! Connection table
//!
//! Maps logical stream ids to their input/output streams. One lock covers
//! the map, the live count, the id counter and the `alive` flag, so id
//! allocation, ceiling checks and shutdown never race each other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use vmux_core::{MuxError, ProtocolViolation};
use vmux_protocol::{OpCode, StreamId};

use crate::lock;
use crate::stream::{VirtualInputStream, VirtualOutputStream};

/// One open logical stream
pub struct ConnectionRecord {
    /// Stream id
    pub id: StreamId,
    /// Receive side
    pub input: Arc<VirtualInputStream>,
    /// Send side
    pub output: Arc<VirtualOutputStream>,
    /// A CLOSE or CLOSEACK has been written for this id
    pub closed_sent: bool,
}

impl ConnectionRecord {
    /// Create a record for a freshly opened stream
    pub fn new(
        id: StreamId,
        input: Arc<VirtualInputStream>,
        output: Arc<VirtualOutputStream>,
    ) -> Self {
        Self {
            id,
            input,
            output,
            closed_sent: false,
        }
    }

    /// Wake everything blocked on either direction
    ///
    /// `graceful` lets readers drain buffered bytes and then see end of
    /// stream; otherwise reads fail with `ConnectionClosed`.
    pub fn disconnect(&self, graceful: bool) {
        self.input.disconnect(graceful);
        self.output.disconnect();
    }
}

/// Outcome of inserting a peer-opened stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Below the ceiling; hand the connection to the acceptor
    Accepted,
    /// At the ceiling; the record is kept only until the CLOSE we send back
    /// is acknowledged
    Refused,
}

struct TableInner {
    records: HashMap<StreamId, ConnectionRecord>,
    last_counter: u16,
    alive: bool,
}

/// Table of open logical streams for one multiplexer
pub struct ConnectionTable {
    inner: Mutex<TableInner>,
    max_connections: usize,
}

impl ConnectionTable {
    /// Create an empty table with the given live-connection ceiling
    pub fn new(max_connections: usize) -> Self {
        Self {
            inner: Mutex::new(TableInner {
                records: HashMap::new(),
                last_counter: 0,
                alive: true,
            }),
            max_connections,
        }
    }

    /// Allocate a fresh local id and insert the record built for it
    ///
    /// Ids are `counter | origin bit`, with the counter advancing modulo
    /// 0x8000 and skipping ids still in use. At most one full lap of the
    /// counter space is searched.
    pub fn allocate<F>(&self, originator: bool, build: F) -> Result<StreamId, MuxError>
    where
        F: FnOnce(StreamId) -> ConnectionRecord,
    {
        let mut inner = lock(&self.inner);
        if !inner.alive {
            return Err(MuxError::ConnectionClosed);
        }
        if inner.records.len() >= self.max_connections {
            return Err(MuxError::CapacityExceeded {
                max: self.max_connections,
            });
        }

        for _ in 0..StreamId::COUNTER_SPACE {
            inner.last_counter = (inner.last_counter + 1) % StreamId::COUNTER_SPACE;
            let id = StreamId::from_counter(inner.last_counter, originator);
            if !inner.records.contains_key(&id) {
                inner.records.insert(id, build(id));
                return Ok(id);
            }
        }

        Err(MuxError::CapacityExceeded {
            max: self.max_connections,
        })
    }

    /// Insert a record for a stream the peer opened
    ///
    /// Above the ceiling the record is still inserted, with `closed_sent`
    /// set, so the CLOSE/CLOSEACK exchange that refuses it has a row to
    /// land on.
    pub fn insert_remote(&self, mut record: ConnectionRecord) -> Result<Admission, MuxError> {
        let mut inner = lock(&self.inner);
        if !inner.alive {
            return Err(MuxError::ConnectionClosed);
        }
        if inner.records.contains_key(&record.id) {
            return Err(ProtocolViolation::DuplicateOpen(record.id).into());
        }

        let admission = if inner.records.len() >= self.max_connections {
            record.closed_sent = true;
            Admission::Refused
        } else {
            Admission::Accepted
        };
        inner.records.insert(record.id, record);
        Ok(admission)
    }

    /// Streams for an open id
    pub fn get(
        &self,
        id: StreamId,
    ) -> Option<(Arc<VirtualInputStream>, Arc<VirtualOutputStream>)> {
        lock(&self.inner)
            .records
            .get(&id)
            .map(|r| (Arc::clone(&r.input), Arc::clone(&r.output)))
    }

    /// Same as [`get`](Self::get), reporting a missing id as a protocol
    /// violation for the frame that named it
    pub fn expect(
        &self,
        op: OpCode,
        id: StreamId,
    ) -> Result<(Arc<VirtualInputStream>, Arc<VirtualOutputStream>), ProtocolViolation> {
        self.get(id)
            .ok_or(ProtocolViolation::UnknownStream { op, id })
    }

    /// Whether `id` is present and no CLOSE/CLOSEACK has been written for it
    pub fn is_open(&self, id: StreamId) -> bool {
        lock(&self.inner)
            .records
            .get(&id)
            .is_some_and(|record| !record.closed_sent)
    }

    /// Mark that a CLOSE is about to be written for `id`
    ///
    /// Returns true only for the call that flips the flag. Missing ids and
    /// ids that already had CLOSE/CLOSEACK written return false.
    pub fn mark_close_sent(&self, id: StreamId) -> bool {
        let mut inner = lock(&self.inner);
        match inner.records.get_mut(&id) {
            Some(record) if !record.closed_sent => {
                record.closed_sent = true;
                true
            }
            _ => false,
        }
    }

    /// Remove a record
    pub fn remove(&self, id: StreamId) -> Option<ConnectionRecord> {
        lock(&self.inner).records.remove(&id)
    }

    /// Remove a record in answer to CLOSEACK
    ///
    /// Fails if the id is unknown or no CLOSE was sent for it.
    pub fn remove_acknowledged(&self, id: StreamId) -> Result<ConnectionRecord, ProtocolViolation> {
        let mut inner = lock(&self.inner);
        match inner.records.get(&id) {
            None => Err(ProtocolViolation::UnknownStream {
                op: OpCode::CloseAck,
                id,
            }),
            Some(record) if !record.closed_sent => Err(ProtocolViolation::UnsolicitedCloseAck(id)),
            Some(_) => inner
                .records
                .remove(&id)
                .ok_or(ProtocolViolation::UnknownStream {
                    op: OpCode::CloseAck,
                    id,
                }),
        }
    }

    /// Mark the table dead and hand back every record
    ///
    /// Only the first call returns `Some`.
    pub fn shut_down(&self) -> Option<Vec<ConnectionRecord>> {
        let mut inner = lock(&self.inner);
        if !inner.alive {
            return None;
        }
        inner.alive = false;
        Some(inner.records.drain().map(|(_, record)| record).collect())
    }

    /// Whether the owning multiplexer is still running
    pub fn is_alive(&self) -> bool {
        lock(&self.inner).alive
    }

    /// Live-connection ceiling
    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Number of open records
    pub fn len(&self) -> usize {
        lock(&self.inner).records.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Weak;

    fn record(id: StreamId) -> ConnectionRecord {
        ConnectionRecord::new(
            id,
            Arc::new(VirtualInputStream::new(id, 64, Weak::new())),
            Arc::new(VirtualOutputStream::new(id, 64, 64, Weak::new())),
        )
    }

    #[test]
    fn test_allocate_sets_origin_bit() {
        let table = ConnectionTable::new(4);
        let a = table.allocate(true, record).unwrap();
        let b = table.allocate(true, record).unwrap();
        assert_eq!(a, StreamId::new(0x8001));
        assert_eq!(b, StreamId::new(0x8002));

        let table = ConnectionTable::new(4);
        assert_eq!(table.allocate(false, record).unwrap(), StreamId::new(1));
    }

    #[test]
    fn test_allocate_skips_ids_in_use() {
        let table = ConnectionTable::new(4);
        // Peer-opened stream squatting on the id we would pick next
        table.insert_remote(record(StreamId::new(1))).unwrap();
        assert_eq!(table.allocate(false, record).unwrap(), StreamId::new(2));
    }

    #[test]
    fn test_allocate_wraps_counter() {
        let table = ConnectionTable::new(4);
        lock(&table.inner).last_counter = 0x7FFF;
        assert_eq!(table.allocate(false, record).unwrap(), StreamId::new(0));
        assert_eq!(table.allocate(false, record).unwrap(), StreamId::new(1));
    }

    #[test]
    fn test_allocate_respects_ceiling() {
        let table = ConnectionTable::new(2);
        table.allocate(true, record).unwrap();
        table.allocate(true, record).unwrap();
        assert!(matches!(
            table.allocate(true, record),
            Err(MuxError::CapacityExceeded { max: 2 })
        ));

        let removed = table.remove(StreamId::new(0x8001));
        assert!(removed.is_some());
        assert!(table.allocate(true, record).is_ok());
    }

    #[test]
    fn test_insert_remote_duplicate() {
        let table = ConnectionTable::new(4);
        let id = StreamId::new(0x8001);
        assert_eq!(table.insert_remote(record(id)).unwrap(), Admission::Accepted);
        assert!(matches!(
            table.insert_remote(record(id)),
            Err(MuxError::Protocol(ProtocolViolation::DuplicateOpen(_)))
        ));
    }

    #[test]
    fn test_insert_remote_over_ceiling_is_refused() {
        let table = ConnectionTable::new(1);
        table.insert_remote(record(StreamId::new(0x8001))).unwrap();
        let admission = table.insert_remote(record(StreamId::new(0x8002))).unwrap();
        assert_eq!(admission, Admission::Refused);
        assert_eq!(table.len(), 2);

        // The refusal counts as our CLOSE, so the peer's CLOSEACK is legal
        assert!(table.remove_acknowledged(StreamId::new(0x8002)).is_ok());
    }

    #[test]
    fn test_close_sent_flag() {
        let table = ConnectionTable::new(4);
        let id = table.allocate(false, record).unwrap();

        assert!(matches!(
            table.remove_acknowledged(id),
            Err(ProtocolViolation::UnsolicitedCloseAck(_))
        ));
        assert!(table.is_open(id));
        assert!(table.mark_close_sent(id));
        assert!(!table.mark_close_sent(id));
        assert!(!table.is_open(id));
        assert!(table.remove_acknowledged(id).is_ok());
        assert!(table.is_empty());
        assert!(!table.mark_close_sent(id));
    }

    #[test]
    fn test_shut_down_once() {
        let table = ConnectionTable::new(4);
        table.allocate(false, record).unwrap();
        table.allocate(false, record).unwrap();

        let drained = table.shut_down().unwrap();
        assert_eq!(drained.len(), 2);
        assert!(table.is_empty());
        assert!(!table.is_alive());
        assert!(table.shut_down().is_none());
        assert!(matches!(
            table.allocate(false, record),
            Err(MuxError::ConnectionClosed)
        ));
    }
}
