use std::fmt;

use serde::Serialize;

use crate::args::FunctionId;

/// Opaque identity of one logical call, as handed out by the host. The host
/// reuses its event object for every call of the same tracepoint, so the
/// instance number is part of the identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CallToken {
    pub event: u64,
    pub instance: u64,
}

impl CallToken {
    pub const fn new(event: u64, instance: u64) -> Self {
        Self { event, instance }
    }
}

impl fmt::Display for CallToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}/{}", self.event, self.instance)
    }
}

/// Which side of the intercepted call an event belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    PreCall,
    PostCall,
}

/// Return value of a plugin call. `0` is success, everything else is an
/// error code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Status(pub i32);

impl Status {
    pub const SUCCESS: Status = Status(0);

    pub const fn is_success(self) -> bool {
        self.0 == Self::SUCCESS.0
    }
}

/// User code location attached to a tracepoint, when the host knows it
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize)]
pub struct CodeLocation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    pub line: u32,
    pub column: u32,
}

impl fmt::Display for CodeLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.function {
            Some(function) => write!(f, "{function} at ")?,
            None => write!(f, "<unknown function> at ")?,
        }
        match &self.file {
            Some(file) => write!(f, "{file}:{}:{}", self.line, self.column),
            None => write!(f, "<unknown source>"),
        }
    }
}

/// A "call begin" notification
#[derive(Clone, Copy, Debug)]
pub struct BeginEvent<'a> {
    pub token: CallToken,
    pub function_id: FunctionId,
    /// Binds `function_id` to a catalog entry the first time it is seen
    pub function_name: Option<&'a str>,
    /// Packed argument buffer, see [`crate::args::decode`]
    pub args: &'a [u8],
    pub location: Option<&'a CodeLocation>,
}

/// A "call end" notification. `status` is `None` when the host did not
/// provide a return value.
#[derive(Clone, Copy, Debug)]
pub struct EndEvent<'a> {
    pub token: CallToken,
    pub function_id: FunctionId,
    pub function_name: Option<&'a str>,
    pub args: &'a [u8],
    pub status: Option<Status>,
}
