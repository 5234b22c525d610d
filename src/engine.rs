//! The verifier as one explicit context object.
//!
//! An [`Engine`] owns the decoder registry, the verification policy, the
//! output sink and, behind a single [`Guard`], all mutable state. Every
//! callback runs the same sequence:
//!
//! 1. decode the argument buffer (no lock needed, the registry is read-only)
//! 2. lock the state
//! 3. correlate, verify, update the ledger
//! 4. emit findings, each one flushed
//! 5. unlock
//! 6. terminate, if a finding asked for it

use std::{io::Write, process, sync::Arc};

use hashbrown::HashSet;
use log::{trace, warn};

use crate::{
    args::{Catalog, DecodedArgs, FunctionEntry, FunctionId, Registry},
    config::Config,
    diag::Sink,
    error::{CorrelationError, DecodeError, Result},
    sync::{internal_failure, Guard, GuardRef},
    trace::{BeginEvent, Correlator, EndEvent, InFlightCall, Phase},
    usm::{AllocationRecord, Ledger},
    verify::{Call, Finding, FindingKind, OutParamReader, ProcessMemory, Verifier},
};

#[derive(Debug)]
struct EngineState {
    ledger: Ledger,
    calls: Correlator,
    /// Unknown ids are reported on first sight only
    unknown_reported: HashSet<FunctionId, ahash::RandomState>,
}

type TerminateHook = Box<dyn Fn() + Send + Sync>;

pub struct Engine {
    registry: Registry,
    verifier: Verifier,
    sink: Sink,
    state: Guard<EngineState>,
    terminate: TerminateHook,
}

impl Engine {
    pub fn new(
        config: &Config,
        catalog: Catalog,
        reader: Box<dyn OutParamReader>,
        out: Box<dyn Write + Send>,
    ) -> Self {
        let sink = Sink::new(config.format, out, config.terminate_at);
        Self::with_sink(config, catalog, reader, sink)
    }

    fn with_sink(
        config: &Config,
        catalog: Catalog,
        reader: Box<dyn OutParamReader>,
        sink: Sink,
    ) -> Self {
        let (registry, primitives) = catalog.into_parts();
        Self {
            registry,
            verifier: Verifier::new(primitives, reader),
            sink,
            state: Guard::new(EngineState {
                ledger: Ledger::new(config.freed_retention),
                calls: Correlator::new(),
                unknown_reported: HashSet::default(),
            }),
            terminate: Box::new(|| process::abort()),
        }
    }

    /// The engine a host process gets: catalog from the configuration,
    /// out-parameters read from process memory, findings on stderr.
    pub fn from_config(config: &Config) -> Result<Self> {
        let catalog = match &config.catalog_path {
            Some(path) => Catalog::from_path(path)?,
            None => Catalog::builtin()?,
        };
        // SAFETY: slots are only read while handling the callback for the
        // call whose argument buffer named them
        let reader = unsafe { ProcessMemory::new() };
        let sink = Sink::stderr(config.format, config.terminate_at);
        Ok(Self::with_sink(config, catalog, Box::new(reader), sink))
    }

    /// Replace what happens when a finding reaches the termination
    /// threshold. The default aborts the process.
    pub fn with_terminate_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.terminate = Box::new(hook);
        self
    }

    pub fn on_begin(&self, event: &BeginEvent<'_>) -> Vec<Finding> {
        trace!("begin {} function id {}", event.token, event.function_id);
        let entry = self.registry.resolve(event.function_id, event.function_name);
        let decoded = decode(entry.as_ref(), event.function_id, event.args, Phase::PreCall);
        let function = entry.as_deref().map(FunctionEntry::name).or(event.function_name);

        let mut state = self.state.lock();
        let mut findings = Vec::new();

        let args = match decoded {
            Ok(args) => {
                let call = Call {
                    function_id: event.function_id,
                    function: function.unwrap_or_default(),
                    args: &args,
                    status: None,
                    location: event.location,
                };
                findings.extend(
                    self.verifier
                        .verify(&mut state.ledger, &call, Phase::PreCall),
                );
                Some(args)
            }
            Err(err) => {
                findings.extend(self.decode_failure(&mut state, event.function_id, function, err));
                None
            }
        };

        let in_flight = InFlightCall {
            function_id: event.function_id,
            args,
            location: event.location.cloned(),
        };
        if let Err(err @ CorrelationError::DuplicateBegin { .. }) =
            state.calls.begin(event.token, in_flight)
        {
            findings.push(
                Finding::new(FindingKind::DuplicateBegin, err.to_string())
                    .in_function(event.function_id, function)
                    .at(event.location),
            );
        }

        self.finish_event(state, findings)
    }

    pub fn on_end(&self, event: &EndEvent<'_>) -> Vec<Finding> {
        trace!("end {} function id {}", event.token, event.function_id);
        let entry = self.registry.resolve(event.function_id, event.function_name);
        let decoded = decode(entry.as_ref(), event.function_id, event.args, Phase::PostCall).ok();
        let function = entry.as_deref().map(FunctionEntry::name).or(event.function_name);

        let mut state = self.state.lock();
        let mut findings = Vec::new();

        match state.calls.end(event.token) {
            Err(err) => findings.push(
                Finding::new(FindingKind::UnmatchedEndEvent, err.to_string())
                    .in_function(event.function_id, function),
            ),
            Ok(began) => {
                if began.function_id != event.function_id {
                    warn!(
                        "call {} began as function id {} but ended as {}",
                        event.token, began.function_id, event.function_id
                    );
                }
                let args: Option<&DecodedArgs> = decoded.as_ref().or(began.args.as_ref());
                if let (Some(args), Some(function)) = (args, function) {
                    let call = Call {
                        function_id: event.function_id,
                        function,
                        args,
                        status: event.status,
                        location: began.location.as_ref(),
                    };
                    findings.extend(
                        self.verifier
                            .verify(&mut state.ledger, &call, Phase::PostCall),
                    );
                }
            }
        }

        self.finish_event(state, findings)
    }

    /// Report every allocation that is still live, and any calls that never
    /// ended. Leak reports never terminate.
    pub fn finish(&self) -> Vec<Finding> {
        let state = self.state.lock();
        if state.calls.outstanding() > 0 {
            warn!(
                "{} calls began and never ended",
                state.calls.outstanding()
            );
        }
        let findings: Vec<_> = state
            .ledger
            .live_records()
            .map(|record| {
                Finding::new(
                    FindingKind::Leak,
                    format!(
                        "{} bytes of {:?} memory at {:#x} were never freed",
                        record.length, record.kind, record.base
                    ),
                )
                .address(record.base)
                .at(record.location.as_ref())
            })
            .collect();
        for finding in &findings {
            self.sink.emit(finding);
        }
        self.sink.flush();
        findings
    }

    /// Snapshot of the live allocations, ordered by base address
    pub fn live_allocations(&self) -> Vec<AllocationRecord> {
        self.state.lock().ledger.live_records().cloned().collect()
    }

    /// Bytes the host must hand over for a call of `function_id`. `name`
    /// binds the id if this is its first call.
    pub fn packed_size(&self, function_id: FunctionId, name: Option<&str>) -> Option<usize> {
        self.registry
            .resolve(function_id, name)
            .map(|entry| entry.descriptor().packed_size())
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn decode_failure(
        &self,
        state: &mut EngineState,
        function_id: FunctionId,
        function: Option<&str>,
        err: DecodeError,
    ) -> Option<Finding> {
        let kind = match err {
            DecodeError::UnknownFunctionId { .. } => {
                if !state.unknown_reported.insert(function_id) {
                    return None;
                }
                FindingKind::UnknownFunctionId
            }
            DecodeError::Truncated { .. } | DecodeError::Malformed { .. } => {
                FindingKind::UndecodableArguments
            }
        };
        Some(Finding::new(kind, err.to_string()).in_function(function_id, function))
    }

    fn finish_event(
        &self,
        state: GuardRef<'_, EngineState>,
        findings: Vec<Finding>,
    ) -> Vec<Finding> {
        if cfg!(debug_assertions) {
            if let Err(err) = state.ledger.check_invariants() {
                internal_failure(&err.to_string());
            }
        }
        let mut terminate = false;
        for finding in &findings {
            terminate |= self.sink.emit(finding);
        }
        drop(state);
        if terminate {
            (self.terminate)();
        }
        findings
    }
}

fn decode(
    entry: Option<&Arc<FunctionEntry>>,
    function_id: FunctionId,
    raw: &[u8],
    phase: Phase,
) -> Result<DecodedArgs, DecodeError> {
    entry
        .ok_or(DecodeError::UnknownFunctionId { function_id })?
        .decode(function_id, raw, phase)
}
