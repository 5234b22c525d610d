use std::fmt;

use serde::Serialize;

use crate::{args::FunctionId, serialize::hex_address, trace::CodeLocation};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        })
    }
}

/// What a finding is about. Only memory-safety findings can terminate the
/// process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Category {
    MemorySafety,
    Protocol,
    Report,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    UseAfterFree,
    WildPointer,
    OutOfBounds,
    DoubleFree,
    AllocationConflict,
    NullPointer,
    ContextMismatch,
    Leak,
    UnmatchedEndEvent,
    DuplicateBegin,
    UnknownFunctionId,
    UndecodableArguments,
}

impl FindingKind {
    pub const fn category(self) -> Category {
        match self {
            FindingKind::UseAfterFree
            | FindingKind::WildPointer
            | FindingKind::OutOfBounds
            | FindingKind::DoubleFree
            | FindingKind::AllocationConflict
            | FindingKind::NullPointer
            | FindingKind::ContextMismatch => Category::MemorySafety,
            FindingKind::UnmatchedEndEvent
            | FindingKind::DuplicateBegin
            | FindingKind::UnknownFunctionId
            | FindingKind::UndecodableArguments => Category::Protocol,
            FindingKind::Leak => Category::Report,
        }
    }

    /// Wild pointers may be memory the program got from somewhere the
    /// verifier cannot see, so they stay warnings.
    pub const fn severity(self) -> Severity {
        match self {
            FindingKind::UseAfterFree
            | FindingKind::OutOfBounds
            | FindingKind::DoubleFree
            | FindingKind::AllocationConflict
            | FindingKind::NullPointer => Severity::Error,
            FindingKind::WildPointer
            | FindingKind::ContextMismatch
            | FindingKind::Leak
            | FindingKind::UnmatchedEndEvent
            | FindingKind::DuplicateBegin
            | FindingKind::UndecodableArguments => Severity::Warning,
            FindingKind::UnknownFunctionId => Severity::Info,
        }
    }

    pub const fn title(self) -> &'static str {
        match self {
            FindingKind::UseAfterFree => "use after free",
            FindingKind::WildPointer => "unknown USM pointer",
            FindingKind::OutOfBounds => "out of bounds access",
            FindingKind::DoubleFree => "invalid free",
            FindingKind::AllocationConflict => "conflicting allocation",
            FindingKind::NullPointer => "null pointer",
            FindingKind::ContextMismatch => "context mismatch",
            FindingKind::Leak => "leaked allocation",
            FindingKind::UnmatchedEndEvent => "unmatched end event",
            FindingKind::DuplicateBegin => "duplicate begin event",
            FindingKind::UnknownFunctionId => "unknown function",
            FindingKind::UndecodableArguments => "undecodable arguments",
        }
    }
}

/// One verification result
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Finding {
    pub severity: Severity,
    pub kind: FindingKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_id: Option<FunctionId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub argument: Option<String>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        serialize_with = "hex_address::option::serialize"
    )]
    pub address: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<CodeLocation>,
}

impl Finding {
    pub fn new(kind: FindingKind, message: impl Into<String>) -> Self {
        Self {
            severity: kind.severity(),
            kind,
            message: message.into(),
            function_id: None,
            function: None,
            argument: None,
            address: None,
            location: None,
        }
    }

    pub fn in_function(mut self, function_id: FunctionId, name: Option<&str>) -> Self {
        self.function_id = Some(function_id);
        self.function = name.map(str::to_owned);
        self
    }

    pub fn argument(mut self, name: &str) -> Self {
        self.argument = Some(name.to_owned());
        self
    }

    pub fn address(mut self, address: u64) -> Self {
        self.address = Some(address);
        self
    }

    pub fn at(mut self, location: Option<&CodeLocation>) -> Self {
        self.location = location.cloned();
        self
    }

    pub const fn category(&self) -> Category {
        self.kind.category()
    }
}
