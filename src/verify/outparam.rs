//! Reading values the callee wrote through an out-parameter.
//!
//! Allocation entry points hand their result back through a `void **` slot,
//! and kernel arguments pass USM pointers by reference. Both need a read of
//! host memory at an address that came out of the argument buffer.

use std::{ptr, sync::Arc, sync::Mutex};

use hashbrown::HashMap;

pub trait OutParamReader: Send + Sync {
    /// Read the pointer-sized value stored at `slot`. `None` if it cannot be
    /// read.
    fn read_pointer(&self, slot: u64) -> Option<u64>;
}

impl<T> OutParamReader for Arc<T>
where
    T: OutParamReader + ?Sized,
{
    fn read_pointer(&self, slot: u64) -> Option<u64> {
        (**self).read_pointer(slot)
    }
}

/// Reads slots straight out of this process's memory
#[derive(Debug)]
pub struct ProcessMemory(());

impl ProcessMemory {
    /// # Safety
    ///
    /// - Every slot this reader is asked about must be valid for reads of a
    ///   `usize` at the time of the read. This holds when the slots come from
    ///   argument buffers the host delivered for calls in this process, and
    ///   the read happens inside the callback for that call.
    pub const unsafe fn new() -> Self {
        Self(())
    }
}

impl OutParamReader for ProcessMemory {
    fn read_pointer(&self, slot: u64) -> Option<u64> {
        let slot = usize::try_from(slot).ok()?;
        if slot == 0 {
            return None;
        }
        // SAFETY:
        // - Non-null, checked above
        // - Constructor contract: the slot is readable for a `usize`
        // - Slots inside packed structures need not be aligned
        let value = unsafe { ptr::read_unaligned(slot as *const usize) };
        Some(value as u64)
    }
}

/// Slots backed by a map. For hosts that copy results out of the call
/// themselves, and for driving the verifier without real memory.
#[derive(Debug, Default)]
pub struct SlotMap {
    slots: Mutex<HashMap<u64, u64>>,
}

impl SlotMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&self, slot: u64, value: u64) {
        self.slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(slot, value);
    }
}

impl OutParamReader for SlotMap {
    fn read_pointer(&self, slot: u64) -> Option<u64> {
        self.slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&slot)
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_memory_reads_a_live_slot() {
        let value: usize = 0xfeed_f00d;
        let slot = &value as *const usize as u64;
        // SAFETY: `slot` is a live local for the duration of the read
        let reader = unsafe { ProcessMemory::new() };
        assert_eq!(reader.read_pointer(slot), Some(0xfeed_f00d));
        assert_eq!(reader.read_pointer(0), None);
    }

    #[test]
    fn slot_map_reads_back_writes() {
        let slots = Arc::new(SlotMap::new());
        slots.write(0x80, 0x1000);
        assert_eq!(slots.read_pointer(0x80), Some(0x1000));
        assert_eq!(slots.read_pointer(0x88), None);
    }
}
