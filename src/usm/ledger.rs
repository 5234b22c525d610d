//! The allocation ledger: every USM range the traced program currently owns,
//! plus a bounded history of ranges it has released.
//!
//! Live records are keyed by base address, so "which allocation holds this
//! pointer" is a predecessor lookup. Live ranges never overlap, which means
//! the only candidate is the record with the greatest base `<= address`.
//!
//! Freed records are kept around after release so that a later access can be
//! told apart as a use-after-free instead of a wild pointer. Allocators reuse
//! addresses, so the history is bounded: once it holds `freed_retention`
//! records, the oldest one is recycled, and a new allocation drops every
//! retained record it overlaps. Retained records never overlap each other,
//! so they are searched the same way as live ones; a queue of
//! `(sequence, base)` pairs remembers the order they were freed in.

use std::collections::{BTreeMap, VecDeque};

use log::debug;

use crate::{
    error::LedgerError,
    trace::CodeLocation,
    usm::record::{AllocKind, AllocationRecord, Liveness, Owner},
};

/// Freed records retained when the configuration does not say otherwise
pub const DEFAULT_FREED_RETENTION: usize = 4096;

#[derive(Debug)]
struct FreedRecord {
    seq: u64,
    record: AllocationRecord,
}

#[derive(Debug)]
pub struct Ledger {
    live: BTreeMap<u64, AllocationRecord>,
    freed: BTreeMap<u64, FreedRecord>,
    /// Oldest first. Entries whose record was evicted early go stale and are
    /// skipped.
    freed_order: VecDeque<(u64, u64)>,
    next_seq: u64,
    freed_retention: usize,
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new(DEFAULT_FREED_RETENTION)
    }
}

impl Ledger {
    pub fn new(freed_retention: usize) -> Self {
        Self {
            live: BTreeMap::new(),
            freed: BTreeMap::new(),
            freed_order: VecDeque::new(),
            next_seq: 0,
            freed_retention,
        }
    }

    /// Track a new live allocation. The ledger is left untouched if the range
    /// overlaps a live record.
    pub fn record_allocation(
        &mut self,
        base: u64,
        length: u64,
        owner: Owner,
        kind: AllocKind,
        location: Option<CodeLocation>,
    ) -> Result<(), LedgerError> {
        let record = AllocationRecord {
            base,
            length,
            owner,
            kind,
            state: Liveness::Live,
            location,
        };
        let end = record.end();

        if let Some((_, existing)) = self.live.range(..end).next_back() {
            if existing.overlaps(base, end) {
                return Err(LedgerError::Overlap {
                    base,
                    end,
                    existing_base: existing.base,
                    existing_end: existing.end(),
                });
            }
        }

        self.evict_freed(base, end);
        debug!("ledger: live [{base:#x}, {end:#x}) {kind:?} in context {:#x}", owner.context);
        self.live.insert(base, record);
        Ok(())
    }

    /// Release the live allocation based at exactly `address`. Interior
    /// pointers are not accepted.
    pub fn record_free(&mut self, address: u64) -> Result<(), LedgerError> {
        let Some(mut record) = self.live.remove(&address) else {
            return Err(LedgerError::DoubleFreeOrUnknownAddress { address });
        };
        debug!("ledger: freed [{:#x}, {:#x})", record.base, record.end());
        record.state = Liveness::Freed;
        if self.freed_retention == 0 {
            return Ok(());
        }
        let (base, seq) = (record.base, self.next_seq);
        self.next_seq += 1;
        self.freed.insert(base, FreedRecord { seq, record });
        self.freed_order.push_back((seq, base));

        while self.freed.len() > self.freed_retention {
            let Some((seq, base)) = self.freed_order.pop_front() else {
                break;
            };
            if self.freed.get(&base).is_some_and(|freed| freed.seq == seq) {
                self.freed.remove(&base);
            }
        }
        if self.freed_order.len() > 2 * self.freed_retention {
            let freed = &self.freed;
            self.freed_order
                .retain(|(seq, base)| freed.get(base).is_some_and(|freed| freed.seq == *seq));
        }
        Ok(())
    }

    /// Drop every retained freed record overlapping `[base, end)`
    fn evict_freed(&mut self, base: u64, end: u64) {
        let before = self
            .freed
            .range(..base)
            .next_back()
            .filter(|(_, freed)| freed.record.overlaps(base, end))
            .map(|(&key, _)| key);
        let stale: Vec<u64> = before
            .into_iter()
            .chain(self.freed.range(base..end).map(|(&key, _)| key))
            .collect();
        for key in stale {
            self.freed.remove(&key);
        }
    }

    /// The live record whose range contains `address`
    pub fn query_contains(&self, address: u64) -> Option<&AllocationRecord> {
        self.live
            .range(..=address)
            .next_back()
            .map(|(_, record)| record)
            .filter(|record| record.contains(address))
    }

    /// Was `address` inside an allocation that has since been freed (and is
    /// still retained)?
    pub fn is_freed(&self, address: u64) -> bool {
        self.freed
            .range(..=address)
            .next_back()
            .is_some_and(|(_, freed)| freed.record.contains(address))
    }

    pub fn live_records(&self) -> impl Iterator<Item = &AllocationRecord> {
        self.live.values()
    }

    /// Number of live records
    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    pub fn freed_len(&self) -> usize {
        self.freed.len()
    }

    /// Walk the live table and confirm no two records overlap. This can only
    /// fail if the ledger's own bookkeeping is broken.
    pub fn check_invariants(&self) -> Result<(), LedgerError> {
        let mut records = self.live.values();
        let Some(mut previous) = records.next() else {
            return Ok(());
        };
        for record in records {
            if previous.end() > record.base {
                return Err(LedgerError::Corrupted {
                    first: previous.base,
                    second: record.base,
                });
            }
            previous = record;
        }
        Ok(())
    }
}
