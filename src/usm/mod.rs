//! Unified shared memory bookkeeping

pub mod ledger;
pub mod record;

pub use ledger::{Ledger, DEFAULT_FREED_RETENTION};
pub use record::{AllocKind, AllocationRecord, Liveness, Owner};
