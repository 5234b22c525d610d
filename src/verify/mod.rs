//! The verification policy: what each decoded call means for the ledger, and
//! which findings it produces.
//!
//! Before a call runs, every pointer-in/pointer-out argument is looked up in
//! the ledger:
//!
//! | ledger says                          | finding          |
//! |--------------------------------------|------------------|
//! | null, and the argument is nullable   | none             |
//! | null, and the argument is non-null   | `NullPointer`    |
//! | inside a live allocation             | bounds + context |
//! | inside a retained freed allocation   | `UseAfterFree`   |
//! | anything else                        | `WildPointer`    |
//!
//! Frees are applied pre-call, since the pointer cannot be trusted once the
//! callee has released it. Allocations are applied post-call, and only when
//! the call reported success.

pub mod finding;
pub mod outparam;

use log::debug;

use crate::{
    args::{catalog::PrimitiveTable, ArgValue, DecodedArgs, FunctionId, Primitive, SemanticType},
    error::LedgerError,
    trace::{CodeLocation, Phase, Status},
    usm::{AllocKind, AllocationRecord, Ledger, Owner},
};

pub use finding::{Category, Finding, FindingKind, Severity};
pub use outparam::{OutParamReader, ProcessMemory, SlotMap};

/// Everything the verifier needs to know about one phase of one call
#[derive(Clone, Copy, Debug)]
pub struct Call<'a> {
    pub function_id: FunctionId,
    pub function: &'a str,
    pub args: &'a DecodedArgs,
    /// Only meaningful post-call
    pub status: Option<Status>,
    pub location: Option<&'a CodeLocation>,
}

impl Call<'_> {
    fn finding(&self, kind: FindingKind, message: String) -> Finding {
        Finding::new(kind, message)
            .in_function(self.function_id, Some(self.function))
            .at(self.location)
    }

    /// Value of the first context-typed argument, if the function takes one
    fn context(&self) -> Option<u64> {
        self.args
            .iter()
            .find(|(spec, _)| spec.ty == SemanticType::Context)
            .map(|(_, value)| value.bits())
    }

    fn argument_name(&self, index: usize) -> &str {
        self.args
            .descriptor()
            .get(index)
            .map(|spec| spec.name.as_str())
            .unwrap_or_default()
    }

    /// Bytes the size argument bound to pointer `index` says are accessed
    fn access_size(&self, index: usize) -> Option<u64> {
        match self
            .args
            .descriptor()
            .size_of(index)
            .and_then(|size| self.args.get(size))
        {
            Some(ArgValue::Size(bytes)) => Some(bytes),
            _ => None,
        }
    }
}

pub struct Verifier {
    primitives: PrimitiveTable,
    reader: Box<dyn OutParamReader>,
}

impl Verifier {
    pub fn new(primitives: PrimitiveTable, reader: Box<dyn OutParamReader>) -> Self {
        Self { primitives, reader }
    }

    pub fn primitives(&self, function: &str) -> &[Primitive] {
        self.primitives
            .get(function)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Check one phase of a call, updating `ledger` if the call allocates or
    /// frees. Findings are returned, not emitted.
    pub fn verify(&self, ledger: &mut Ledger, call: &Call<'_>, phase: Phase) -> Vec<Finding> {
        let mut findings = Vec::new();
        let primitives = self.primitives(call.function);
        match phase {
            Phase::PreCall => {
                let freed_arg = primitives.iter().find_map(|primitive| match primitive {
                    Primitive::Free { pointer, .. } => Some(*pointer),
                    _ => None,
                });
                for (index, (spec, value)) in call.args.iter().enumerate() {
                    if Some(index) == freed_arg {
                        continue;
                    }
                    let Some(address) = value.pointer() else {
                        continue;
                    };
                    self.check_pointer(
                        ledger,
                        call,
                        &spec.name,
                        address,
                        call.access_size(index),
                        spec.nullable,
                        &mut findings,
                    );
                }
                for primitive in primitives {
                    match *primitive {
                        Primitive::Free { pointer, context } => {
                            self.apply_free(ledger, call, pointer, context, &mut findings)
                        }
                        Primitive::IndirectPointer { slot } => {
                            self.check_indirect(ledger, call, slot, &mut findings)
                        }
                        Primitive::Extent2D {
                            pointer,
                            pitch,
                            width,
                            height,
                        } => {
                            let bytes = Primitive::extent_2d(
                                call.args.bits(pitch).unwrap_or(0),
                                call.args.bits(width).unwrap_or(0),
                                call.args.bits(height).unwrap_or(0),
                            );
                            self.check_region(ledger, call, pointer, bytes, &mut findings);
                        }
                        Primitive::HostBuffer {
                            pointer,
                            size,
                            flags,
                            mask,
                        } => {
                            let uses_host_ptr =
                                call.args.bits(flags).map_or(false, |flags| flags & mask != 0);
                            if uses_host_ptr {
                                let bytes = call.args.bits(size).unwrap_or(0);
                                self.check_region(ledger, call, pointer, bytes, &mut findings);
                            }
                        }
                        Primitive::Allocation { .. } => {}
                    }
                }
            }
            Phase::PostCall => {
                for primitive in primitives {
                    if let Primitive::Allocation {
                        kind,
                        result,
                        size,
                        context,
                        device,
                    } = *primitive
                    {
                        let owner = Owner {
                            context: context.and_then(|index| call.args.bits(index)).unwrap_or(0),
                            device: device.and_then(|index| call.args.bits(index)),
                        };
                        self.apply_allocation(ledger, call, result, size, owner, kind, &mut findings);
                    }
                }
            }
        }
        findings
    }

    #[allow(clippy::too_many_arguments)]
    fn check_pointer(
        &self,
        ledger: &Ledger,
        call: &Call<'_>,
        argument: &str,
        address: u64,
        access: Option<u64>,
        nullable: bool,
        findings: &mut Vec<Finding>,
    ) {
        if address == 0 {
            if !nullable {
                findings.push(
                    call.finding(FindingKind::NullPointer, format!("`{argument}` is null"))
                        .argument(argument)
                        .address(0),
                );
            }
            return;
        }

        let Some(record) = ledger.query_contains(address) else {
            let finding = if ledger.is_freed(address) {
                call.finding(
                    FindingKind::UseAfterFree,
                    format!("`{argument}` = {address:#x} points into USM memory that was already freed"),
                )
            } else {
                call.finding(
                    FindingKind::WildPointer,
                    format!(
                        "`{argument}` = {address:#x} is not inside any known USM allocation \
                         (never allocated as USM, or released long ago)"
                    ),
                )
            };
            findings.push(finding.argument(argument).address(address));
            return;
        };

        if let Some(bytes) = access {
            check_bounds(call, record, argument, address, bytes, findings);
        }

        if let Some(context) = call.context() {
            if context != record.owner.context {
                findings.push(
                    call.finding(
                        FindingKind::ContextMismatch,
                        format!(
                            "`{argument}` = {address:#x} was allocated in context {:#x} but is \
                             used with context {context:#x}",
                            record.owner.context
                        ),
                    )
                    .argument(argument)
                    .address(address),
                );
            }
        }
    }

    /// Bounds-check a computed access through argument `pointer`. Pointers
    /// outside the live ledger are left to the per-argument check.
    fn check_region(
        &self,
        ledger: &Ledger,
        call: &Call<'_>,
        pointer: usize,
        bytes: u64,
        findings: &mut Vec<Finding>,
    ) {
        let Some(address) = call.args.bits(pointer).filter(|&address| address != 0) else {
            return;
        };
        if let Some(record) = ledger.query_contains(address) {
            check_bounds(call, record, call.argument_name(pointer), address, bytes, findings);
        }
    }

    fn check_indirect(
        &self,
        ledger: &Ledger,
        call: &Call<'_>,
        slot: usize,
        findings: &mut Vec<Finding>,
    ) {
        let Some(slot_address) = call.args.bits(slot).filter(|&address| address != 0) else {
            return;
        };
        let Some(address) = self.reader.read_pointer(slot_address) else {
            debug!("verify: could not read pointer slot {slot_address:#x}");
            return;
        };
        let name = format!("*{}", call.argument_name(slot));
        self.check_pointer(ledger, call, &name, address, None, true, findings);
    }

    fn apply_free(
        &self,
        ledger: &mut Ledger,
        call: &Call<'_>,
        pointer: usize,
        context: Option<usize>,
        findings: &mut Vec<Finding>,
    ) {
        let Some(address) = call.args.bits(pointer).filter(|&address| address != 0) else {
            return;
        };
        let argument = call.argument_name(pointer);

        if let (Some(record), Some(context)) = (
            ledger.query_contains(address),
            context.and_then(|index| call.args.bits(index)),
        ) {
            if record.base == address && record.owner.context != context {
                findings.push(
                    call.finding(
                        FindingKind::ContextMismatch,
                        format!(
                            "{address:#x} was allocated in context {:#x} but is freed with \
                             context {context:#x}",
                            record.owner.context
                        ),
                    )
                    .argument(argument)
                    .address(address),
                );
            }
        }

        let reason = match ledger.query_contains(address) {
            Some(record) if record.base != address => format!(
                "{address:#x} is inside the allocation at {:#x} but is not its start",
                record.base
            ),
            _ if ledger.is_freed(address) => format!("{address:#x} was already freed"),
            _ => format!("{address:#x} was never allocated as USM"),
        };
        if let Err(LedgerError::DoubleFreeOrUnknownAddress { .. }) = ledger.record_free(address) {
            findings.push(
                call.finding(FindingKind::DoubleFree, format!("invalid free: {reason}"))
                    .argument(argument)
                    .address(address),
            );
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_allocation(
        &self,
        ledger: &mut Ledger,
        call: &Call<'_>,
        result: usize,
        size: usize,
        owner: Owner,
        kind: AllocKind,
        findings: &mut Vec<Finding>,
    ) {
        match call.status {
            Some(status) if status.is_success() => {}
            status => {
                debug!(
                    "verify: {} did not succeed ({status:?}), nothing allocated",
                    call.function
                );
                return;
            }
        }
        let Some(slot) = call.args.bits(result).filter(|&slot| slot != 0) else {
            return;
        };
        let Some(base) = self.reader.read_pointer(slot).filter(|&base| base != 0) else {
            debug!("verify: allocation result slot {slot:#x} holds no pointer");
            return;
        };
        let length = call.args.bits(size).unwrap_or(0);

        if let Err(err) =
            ledger.record_allocation(base, length, owner, kind, call.location.cloned())
        {
            findings.push(
                call.finding(
                    FindingKind::AllocationConflict,
                    format!("new {kind:?} allocation rejected: {err}"),
                )
                .address(base),
            );
        }
    }
}

fn check_bounds(
    call: &Call<'_>,
    record: &AllocationRecord,
    argument: &str,
    address: u64,
    bytes: u64,
    findings: &mut Vec<Finding>,
) {
    if !record.fits(address, bytes) {
        findings.push(
            call.finding(
                FindingKind::OutOfBounds,
                format!(
                    "`{argument}` accesses {bytes} bytes at {address:#x}, past the end of the \
                     {}-byte allocation at {:#x}",
                    record.length, record.base
                ),
            )
            .argument(argument)
            .address(address),
        );
    }
}
