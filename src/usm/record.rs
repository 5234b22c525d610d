use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::trace::CodeLocation;

/// Where a USM allocation lives
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocKind {
    Host,
    Device,
    Shared,
}

/// The context (and, for device and shared memory, the device) an allocation
/// was made against
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
pub struct Owner {
    pub context: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<u64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Liveness {
    Live,
    Freed,
}

/// One tracked allocation
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AllocationRecord {
    pub base: u64,
    /// The exact requested size
    pub length: u64,
    pub owner: Owner,
    pub kind: AllocKind,
    pub state: Liveness,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<CodeLocation>,
}

impl AllocationRecord {
    /// Number of addresses this record covers. A zero-sized allocation still
    /// owns its base address, otherwise it would be indistinguishable from a
    /// wild pointer.
    pub fn extent(&self) -> u64 {
        self.length.max(1)
    }

    /// One past the last covered address (saturating at the top of the
    /// address space)
    pub fn end(&self) -> u64 {
        self.base.saturating_add(self.extent())
    }

    /// Tests if `address` is interior to this allocation. `Less` means the
    /// address is below the base, `Greater` means it is at or past the end.
    pub fn test_interior_ptr(&self, address: u64) -> Ordering {
        if address < self.base {
            Ordering::Less
        } else if address >= self.end() {
            Ordering::Greater
        } else {
            Ordering::Equal
        }
    }

    pub fn contains(&self, address: u64) -> bool {
        self.test_interior_ptr(address) == Ordering::Equal
    }

    /// Does `[base, end)` share any address with this record?
    pub fn overlaps(&self, base: u64, end: u64) -> bool {
        base < self.end() && self.base < end
    }

    /// Is `[address, address + size)` fully inside this record? Uses the
    /// requested length, so a zero-sized allocation admits no accesses.
    pub fn fits(&self, address: u64, size: u64) -> bool {
        match (address.checked_sub(self.base), self.base.checked_add(self.length)) {
            (Some(_), Some(limit)) => address
                .checked_add(size)
                .is_some_and(|access_end| access_end <= limit),
            _ => false,
        }
    }
}
