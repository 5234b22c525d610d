use std::sync::Arc;

use crate::args::descriptor::{ArgDescriptor, ArgSpec};

/// A decoded argument that the verifier does not look through
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scalar {
    /// Pointers, pointer slots and handles
    Address(u64),
    Unsigned(u64),
    Signed(i64),
}

impl Scalar {
    /// The raw bits widened to 64, for comparisons between handles and sizes
    pub const fn bits(self) -> u64 {
        match self {
            Scalar::Address(value) | Scalar::Unsigned(value) => value,
            Scalar::Signed(value) => value as u64,
        }
    }
}

/// One decoded argument, tagged with the role its descriptor gives it
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArgValue {
    Plain(Scalar),
    PointerIn(u64),
    PointerOut(u64),
    /// Byte count for the pointer argument right before it
    Size(u64),
}

impl ArgValue {
    pub const fn bits(self) -> u64 {
        match self {
            ArgValue::Plain(scalar) => scalar.bits(),
            ArgValue::PointerIn(value) | ArgValue::PointerOut(value) | ArgValue::Size(value) => {
                value
            }
        }
    }

    /// The address of a checked pointer argument
    pub const fn pointer(self) -> Option<u64> {
        match self {
            ArgValue::PointerIn(address) | ArgValue::PointerOut(address) => Some(address),
            _ => None,
        }
    }
}

/// The decoded argument list of one call, kept together with the descriptor
/// that names each entry
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodedArgs {
    descriptor: Arc<ArgDescriptor>,
    values: Vec<ArgValue>,
}

impl DecodedArgs {
    /// `values` must line up with `descriptor`, one value per argument
    pub fn new(descriptor: Arc<ArgDescriptor>, values: Vec<ArgValue>) -> Self {
        debug_assert_eq!(descriptor.len(), values.len());
        Self { descriptor, values }
    }

    pub fn descriptor(&self) -> &ArgDescriptor {
        &self.descriptor
    }

    pub fn values(&self) -> &[ArgValue] {
        &self.values
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ArgSpec, ArgValue)> + '_ {
        self.descriptor.args().iter().zip(self.values.iter().copied())
    }

    pub fn get(&self, index: usize) -> Option<ArgValue> {
        self.values.get(index).copied()
    }

    pub fn by_name(&self, name: &str) -> Option<ArgValue> {
        self.get(self.descriptor.index_of(name)?)
    }

    /// Raw bits of argument `index`, whatever its role
    pub fn bits(&self, index: usize) -> Option<u64> {
        self.get(index).map(ArgValue::bits)
    }
}
