use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::BuildHasherDefault;

use parking_lot::Mutex;

use crate::callstack::CallStack;
use crate::hook::RequestId;

type LedgerMap = HashMap<RequestId, BlockRecord, BuildHasherDefault<DefaultHasher>>;

/// A tracked, still-unfreed allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRecord {
    pub request: RequestId,
    pub address: usize,
    pub size: usize,
    pub stack: CallStack,
}

/// Live allocations observed by the engine, keyed by request id.
///
/// A key is present exactly while the block it names has been seen allocated
/// and not yet seen freed or reported. Every operation takes the lock for a
/// single insert, erase or lookup; records leaving the map are dropped after
/// the lock is released.
pub struct BlockLedger {
    records: Mutex<LedgerMap>,
}

impl BlockLedger {
    pub const fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::with_hasher(BuildHasherDefault::new())),
        }
    }

    /// Tracks `record`, replacing any record with the same request id.
    pub fn insert(&self, record: BlockRecord) {
        let previous = self.records.lock().insert(record.request, record);
        drop(previous);
    }

    /// Stops tracking `request`. Returns whether it was tracked.
    pub fn erase(&self, request: RequestId) -> bool {
        let removed = self.records.lock().remove(&request);
        removed.is_some()
    }

    /// Returns a copy of the record for `request`, if tracked.
    pub fn get(&self, request: RequestId) -> Option<BlockRecord> {
        self.records.lock().get(&request).cloned()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every tracked request id, in no particular order.
    pub fn requests(&self) -> Vec<RequestId> {
        self.records.lock().keys().copied().collect()
    }

    /// Stops tracking each of `requests`.
    pub fn erase_all(&self, requests: &[RequestId]) {
        let mut removed = Vec::with_capacity(requests.len());
        {
            let mut records = self.records.lock();
            removed.extend(requests.iter().filter_map(|request| records.remove(request)));
        }
        drop(removed);
    }
}

impl Default for BlockLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {

    use super::*;

    fn record(id: u64) -> BlockRecord {
        BlockRecord {
            request: RequestId(id),
            address: 0x1000 + id as usize,
            size: 16,
            stack: CallStack::from(vec![0xdead, 0xbeef]),
        }
    }

    #[test]
    fn test_should_insert_and_erase() {
        let ledger = BlockLedger::new();
        ledger.insert(record(1));
        ledger.insert(record(2));
        assert_eq!(ledger.len(), 2);
        assert!(ledger.get(RequestId(1)).is_some());

        assert!(ledger.erase(RequestId(1)));
        // double free is a no-op
        assert!(!ledger.erase(RequestId(1)));
        assert_eq!(ledger.requests(), vec![RequestId(2)]);
        assert_eq!(ledger.get(RequestId(2)).unwrap().stack.frames(), &[0xdead, 0xbeef]);
    }

    #[test]
    fn test_should_keep_unfreed_ids_regardless_of_order() {
        let ledger = BlockLedger::new();
        for id in 1..=20 {
            ledger.insert(record(id));
        }
        for id in (1..=20).rev().filter(|id| id % 3 != 0) {
            ledger.erase(RequestId(id));
        }
        let mut left = ledger.requests();
        left.sort();
        let expected: Vec<_> = (1..=20).filter(|id| id % 3 == 0).map(RequestId).collect();
        assert_eq!(left, expected);
    }

    #[test]
    fn test_should_erase_all() {
        let ledger = BlockLedger::new();
        for id in 1..=4 {
            ledger.insert(record(id));
        }
        ledger.erase_all(&[RequestId(1), RequestId(3), RequestId(9)]);
        assert_eq!(ledger.len(), 2);
        ledger.erase_all(&[RequestId(2), RequestId(4)]);
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_should_be_usable_from_static() {
        static LEDGER: BlockLedger = BlockLedger::new();
        std::thread::scope(|scope| {
            for thread in 0..4u64 {
                scope.spawn(move || {
                    for id in 0..100 {
                        LEDGER.insert(record(thread * 1000 + id));
                    }
                });
            }
        });
        assert_eq!(LEDGER.len(), 400);
    }
}
