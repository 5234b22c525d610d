//! Trace events delivered by the host and the begin/end correlation state

pub mod correlator;
pub mod event;

pub use correlator::{Correlator, InFlightCall};
pub use event::{BeginEvent, CallToken, CodeLocation, EndEvent, Phase, Status};
