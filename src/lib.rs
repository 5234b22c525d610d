//! Runtime verification of unified shared memory (USM) use through a compute
//! runtime's plugin interface.
//!
//! The host intercepts every plugin call and reports it twice, before and
//! after it runs, with the call's packed argument buffer. From that stream
//! the [`Engine`] keeps a ledger of USM allocations and checks every pointer
//! argument against it: freed memory, memory never allocated, accesses past
//! the end of an allocation, double frees and overlapping allocations are all
//! reported as [`Finding`]s.

pub mod args;
pub mod config;
pub mod diag;
pub mod engine;
pub mod error;
pub mod externc;
pub mod serialize;
pub mod sync;
pub mod trace;
pub mod usm;
pub mod verify;

pub use config::Config;
pub use engine::Engine;
pub use error::{Error, Result};
pub use verify::{Finding, FindingKind, Severity};
