//! Error types for every layer of the verifier

use std::{io, path::PathBuf};

use thiserror::Error;

use crate::{args::FunctionId, trace::CallToken};

/// Ledger bookkeeping failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error(
        "range [{base:#x}, {end:#x}) overlaps live allocation [{existing_base:#x}, {existing_end:#x})"
    )]
    Overlap {
        base: u64,
        end: u64,
        existing_base: u64,
        existing_end: u64,
    },

    #[error("{address:#x} is not the base of a live allocation")]
    DoubleFreeOrUnknownAddress { address: u64 },

    #[error("live allocations at {first:#x} and {second:#x} overlap")]
    Corrupted { first: u64, second: u64 },
}

/// Failures turning a raw argument buffer into values
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("no decoder registered for function id {function_id}")]
    UnknownFunctionId { function_id: FunctionId },

    #[error("argument buffer of function id {function_id} holds {available} bytes, {needed} needed")]
    Truncated {
        function_id: FunctionId,
        needed: usize,
        available: usize,
    },

    #[error("malformed arguments for function id {function_id}: {reason}")]
    Malformed {
        function_id: FunctionId,
        reason: String,
    },
}

/// A descriptor or registration was rejected at setup time
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("function id {function_id} is already registered")]
    DuplicateFunctionId { function_id: FunctionId },

    #[error("function `{name}` is already registered")]
    DuplicateFunctionName { name: String },

    #[error("no function named `{name}` is registered")]
    UnknownFunctionName { name: String },

    #[error("function id {function_id} is bound to `{bound}`, not `{requested}`")]
    ConflictingBinding {
        function_id: FunctionId,
        bound: String,
        requested: String,
    },

    #[error("argument #{index} has an empty name")]
    EmptyArgumentName { index: usize },

    #[error("argument name `{name}` appears more than once")]
    DuplicateArgumentName { name: String },

    #[error("argument `{name}` has a pointer role but is not a pointer")]
    PointerRoleOnNonPointer { name: String },

    #[error("size argument `{name}` does not name the pointers it bounds")]
    DanglingSize { name: String },

    #[error("size argument `{name}` bounds `{pointer}`, which is not a checked pointer")]
    SizeOfNonPointer { name: String, pointer: String },

    #[error("argument `{name}` lists pointers to bound but is not a size")]
    BoundsOnNonSize { name: String },

    #[error("pointer `{pointer}` is bounded by more than one size argument")]
    AmbiguousSize { pointer: String },

    #[error("size argument `{name}` is not an integer")]
    SizeNotInteger { name: String },

    #[error("argument `{name}` is marked non-nullable but is not a checked pointer")]
    NonNullableNotPointer { name: String },
}

/// The function catalog could not be loaded
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("could not read catalog {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("catalog is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("catalog version {found} is not supported (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },

    #[error("function `{function}` has no argument named `{argument}`")]
    UnknownArgument { function: String, argument: String },

    #[error("argument `{argument}` of `{function}` cannot act as {expected}")]
    ArgumentMismatch {
        function: String,
        argument: String,
        expected: &'static str,
    },

    #[error("function `{function}`: {source}")]
    Registry {
        function: String,
        #[source]
        source: RegistryError,
    },
}

/// Invalid environment configuration
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{var} must be a non-negative integer, got `{value}`")]
    InvalidNumber { var: &'static str, value: String },
}

/// Begin/end events that do not pair up
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CorrelationError {
    #[error("end event {token} has no matching begin event")]
    UnmatchedEndEvent { token: CallToken },

    #[error("begin event {token} arrived while a call with the same token was in flight")]
    DuplicateBegin { token: CallToken },
}

/// Errors surfaced while setting the verifier up
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
