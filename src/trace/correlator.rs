//! Pairs "call begin" events with their "call end" events.
//!
//! A call moves `NotStarted -> Began -> Ended`. Beginning inserts an
//! [`InFlightCall`] keyed by the host's token, ending removes it again, so a
//! token absent from the table is either not started or already ended. The
//! function id is never used as a key: the same function can be in flight on
//! many threads at once.

use hashbrown::HashMap;
use log::warn;

use crate::{
    args::{DecodedArgs, FunctionId},
    error::CorrelationError,
    trace::{CallToken, CodeLocation},
};

/// Begin-phase state of a call that has not ended yet
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InFlightCall {
    pub function_id: FunctionId,
    /// `None` when the pre-call arguments could not be decoded
    pub args: Option<DecodedArgs>,
    pub location: Option<CodeLocation>,
}

#[derive(Debug, Default)]
pub struct Correlator {
    calls: HashMap<CallToken, InFlightCall, ahash::RandomState>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the begin of a call. If `token` is already in flight the old
    /// entry is replaced and [`CorrelationError::DuplicateBegin`] returned;
    /// the new call is tracked either way.
    pub fn begin(&mut self, token: CallToken, call: InFlightCall) -> Result<(), CorrelationError> {
        match self.calls.insert(token, call) {
            None => Ok(()),
            Some(previous) => {
                warn!(
                    "call {token} began twice, dropping in-flight function id {}",
                    previous.function_id
                );
                Err(CorrelationError::DuplicateBegin { token })
            }
        }
    }

    /// Consume the in-flight entry for `token`
    pub fn end(&mut self, token: CallToken) -> Result<InFlightCall, CorrelationError> {
        self.calls
            .remove(&token)
            .ok_or(CorrelationError::UnmatchedEndEvent { token })
    }

    /// Calls that began and have not ended
    pub fn outstanding(&self) -> usize {
        self.calls.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(function_id: FunctionId) -> InFlightCall {
        InFlightCall {
            function_id,
            args: None,
            location: None,
        }
    }

    #[test]
    fn end_consumes_exactly_one_entry() {
        let mut correlator = Correlator::new();
        let token = CallToken::new(0xe7, 1);
        correlator.begin(token, call(7)).unwrap();
        correlator.begin(CallToken::new(0xe7, 2), call(7)).unwrap();
        assert_eq!(correlator.outstanding(), 2);

        assert_eq!(correlator.end(token).unwrap().function_id, 7);
        assert_eq!(correlator.outstanding(), 1);
        assert_eq!(
            correlator.end(token),
            Err(CorrelationError::UnmatchedEndEvent { token })
        );
    }

    #[test]
    fn duplicate_begin_overwrites_and_reports() {
        let mut correlator = Correlator::new();
        let token = CallToken::new(1, 1);
        correlator.begin(token, call(1)).unwrap();
        assert_eq!(
            correlator.begin(token, call(2)),
            Err(CorrelationError::DuplicateBegin { token })
        );
        assert_eq!(correlator.outstanding(), 1);
        assert_eq!(correlator.end(token).unwrap().function_id, 2);
    }

    #[test]
    fn end_without_begin_is_unmatched() {
        let mut correlator = Correlator::new();
        let token = CallToken::new(9, 9);
        assert_eq!(
            correlator.end(token),
            Err(CorrelationError::UnmatchedEndEvent { token })
        );
    }
}
