//! The packed argument buffer.
//!
//! The host copies every argument of a call into one byte array, back to back
//! in declaration order, with no padding:
//!
//! ```plaintext
//! +--------+--------+----+--------+
//! | arg 0  | arg 1  | .. | arg n  |
//! +--------+--------+----+--------+
//!  width(0) width(1)      width(n)
//! ```
//!
//! Nothing in the buffer is aligned, so every read is an unaligned copy.

use bytemuck::Pod;

use crate::{
    args::{
        descriptor::{ArgDescriptor, Role, SemanticType},
        value::{ArgValue, Scalar},
        FunctionId,
    },
    error::DecodeError,
    trace::Phase,
};

/// Turns a packed buffer into one value per descriptor entry. The buffer is
/// at least `descriptor.packed_size()` bytes long when this is called.
pub type DecodeFn =
    fn(FunctionId, &ArgDescriptor, &[u8], Phase) -> Result<Vec<ArgValue>, DecodeError>;

/// Sequential unaligned reader over a packed buffer
pub struct PackedReader<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> PackedReader<'a> {
    pub const fn new(buf: &'a [u8]) -> Self {
        Self { buf, offset: 0 }
    }

    pub fn read<T: Pod>(&mut self) -> Option<T> {
        let end = self.offset.checked_add(std::mem::size_of::<T>())?;
        let bytes = self.buf.get(self.offset..end)?;
        self.offset = end;
        Some(bytemuck::pod_read_unaligned(bytes))
    }

    pub fn read_scalar(&mut self, ty: SemanticType) -> Option<Scalar> {
        let scalar = match ty {
            SemanticType::Pointer
            | SemanticType::PointerSlot
            | SemanticType::Handle
            | SemanticType::Context
            | SemanticType::Device
            | SemanticType::Queue => Scalar::Address(self.read::<usize>()? as u64),
            SemanticType::Usize => Scalar::Unsigned(self.read::<usize>()? as u64),
            SemanticType::U32 => Scalar::Unsigned(self.read::<u32>()? as u64),
            SemanticType::I32 => Scalar::Signed(self.read::<i32>()? as i64),
            SemanticType::U64 => Scalar::Unsigned(self.read::<u64>()?),
        };
        Some(scalar)
    }

    pub const fn offset(&self) -> usize {
        self.offset
    }
}

/// Decoder for any descriptor: reads each argument by its semantic type and
/// tags it with its role. Both phases share the buffer layout; post-call the
/// slots behind `PointerSlot` arguments have been written by the callee.
pub fn decode_packed(
    function_id: FunctionId,
    descriptor: &ArgDescriptor,
    buf: &[u8],
    _phase: Phase,
) -> Result<Vec<ArgValue>, DecodeError> {
    let mut reader = PackedReader::new(buf);
    let mut values = Vec::with_capacity(descriptor.len());
    for arg in descriptor.args() {
        let scalar = reader
            .read_scalar(arg.ty)
            .ok_or_else(|| DecodeError::Truncated {
                function_id,
                needed: descriptor.packed_size(),
                available: buf.len(),
            })?;
        values.push(match arg.role {
            Role::Plain => ArgValue::Plain(scalar),
            Role::PointerIn => ArgValue::PointerIn(scalar.bits()),
            Role::PointerOut => ArgValue::PointerOut(scalar.bits()),
            Role::Size => match scalar {
                Scalar::Signed(value) if value < 0 => {
                    return Err(DecodeError::Malformed {
                        function_id,
                        reason: format!("size argument `{}` is negative ({value})", arg.name),
                    })
                }
                _ => ArgValue::Size(scalar.bits()),
            },
        });
    }
    Ok(values)
}

/// Builds packed buffers the way the host does. Hosts written in Rust and
/// tests use this to produce events.
#[derive(Clone, Debug, Default)]
pub struct ArgPacker {
    buf: Vec<u8>,
}

impl ArgPacker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<T: Pod>(mut self, value: T) -> Self {
        self.buf.extend_from_slice(bytemuck::bytes_of(&value));
        self
    }

    /// A pointer, slot or handle
    pub fn address(self, value: u64) -> Self {
        self.push(value as usize)
    }

    pub fn size(self, value: u64) -> Self {
        self.push(value as usize)
    }

    pub fn u32(self, value: u32) -> Self {
        self.push(value)
    }

    pub fn i32(self, value: i32) -> Self {
        self.push(value)
    }

    pub fn u64(self, value: u64) -> Self {
        self.push(value)
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}
