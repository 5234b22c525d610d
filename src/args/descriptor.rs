//! Static per-function argument schemas

use std::mem;

use hashbrown::HashSet;
use serde::{Deserialize, Serialize};

use crate::error::RegistryError;

/// What an argument's bits mean. This also fixes how many bytes the argument
/// takes in the packed buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SemanticType {
    /// Address the callee reads or writes
    Pointer,
    /// Address of a pointer-sized variable the callee writes a result into
    PointerSlot,
    /// Any opaque plugin object (kernel, event, program, ...)
    Handle,
    Context,
    Device,
    Queue,
    Usize,
    U32,
    I32,
    U64,
}

impl SemanticType {
    /// Bytes the type occupies in a packed argument buffer
    pub const fn width(self) -> usize {
        match self {
            SemanticType::Pointer
            | SemanticType::PointerSlot
            | SemanticType::Handle
            | SemanticType::Context
            | SemanticType::Device
            | SemanticType::Queue => mem::size_of::<*const ()>(),
            SemanticType::Usize => mem::size_of::<usize>(),
            SemanticType::U32 | SemanticType::I32 => 4,
            SemanticType::U64 => 8,
        }
    }

    pub const fn is_integer(self) -> bool {
        matches!(
            self,
            SemanticType::Usize | SemanticType::U32 | SemanticType::I32 | SemanticType::U64
        )
    }

    /// Handles and pointers of any kind
    pub const fn is_address(self) -> bool {
        !self.is_integer()
    }
}

/// How the verifier treats an argument
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Plain,
    /// USM memory the callee reads
    PointerIn,
    /// USM memory the callee writes
    PointerOut,
    /// Byte count of the access through every pointer named in
    /// [`ArgSpec::of`]
    Size,
}

impl Role {
    pub const fn is_pointer(self) -> bool {
        matches!(self, Role::PointerIn | Role::PointerOut)
    }
}

const fn default_nullable() -> bool {
    true
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: SemanticType,
    #[serde(default = "default_role")]
    pub role: Role,
    /// A null value for a pointer argument is only an error if this is false
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    /// For a size argument, the pointer arguments it bounds
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub of: Vec<String>,
}

const fn default_role() -> Role {
    Role::Plain
}

impl ArgSpec {
    pub fn new(name: impl Into<String>, ty: SemanticType, role: Role) -> Self {
        Self {
            name: name.into(),
            ty,
            role,
            nullable: true,
            of: Vec::new(),
        }
    }

    /// A size argument bounding the pointers named in `of`
    pub fn size<I, S>(name: impl Into<String>, ty: SemanticType, of: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            of: of.into_iter().map(Into::into).collect(),
            ..Self::new(name, ty, Role::Size)
        }
    }

    pub fn non_null(mut self) -> Self {
        self.nullable = false;
        self
    }
}

/// The ordered argument list of one plugin function
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArgDescriptor {
    args: Vec<ArgSpec>,
}

impl ArgDescriptor {
    pub fn new(args: Vec<ArgSpec>) -> Self {
        Self { args }
    }

    pub fn args(&self) -> &[ArgSpec] {
        &self.args
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&ArgSpec> {
        self.args.get(index)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.args.iter().position(|arg| arg.name == name)
    }

    /// Position of the size argument that bounds the pointer at `pointer`
    pub fn size_of(&self, pointer: usize) -> Option<usize> {
        let name = &self.args.get(pointer)?.name;
        self.args
            .iter()
            .position(|arg| arg.role == Role::Size && arg.of.contains(name))
    }

    /// Total bytes of the packed argument buffer
    pub fn packed_size(&self) -> usize {
        self.args.iter().map(|arg| arg.ty.width()).sum()
    }

    /// Check the schema rules every registered descriptor must follow
    pub fn validate(&self) -> Result<(), RegistryError> {
        let mut names = HashSet::with_capacity(self.args.len());
        for (index, arg) in self.args.iter().enumerate() {
            if arg.name.is_empty() {
                return Err(RegistryError::EmptyArgumentName { index });
            }
            if !names.insert(arg.name.as_str()) {
                return Err(RegistryError::DuplicateArgumentName {
                    name: arg.name.clone(),
                });
            }
            if arg.role.is_pointer() && arg.ty != SemanticType::Pointer {
                return Err(RegistryError::PointerRoleOnNonPointer {
                    name: arg.name.clone(),
                });
            }
            if !arg.nullable && !arg.role.is_pointer() {
                return Err(RegistryError::NonNullableNotPointer {
                    name: arg.name.clone(),
                });
            }
            if arg.role == Role::Size {
                if !arg.ty.is_integer() {
                    return Err(RegistryError::SizeNotInteger {
                        name: arg.name.clone(),
                    });
                }
                if arg.of.is_empty() {
                    return Err(RegistryError::DanglingSize {
                        name: arg.name.clone(),
                    });
                }
                for pointer in &arg.of {
                    let bounds_pointer = self
                        .args
                        .iter()
                        .any(|other| other.name == *pointer && other.role.is_pointer());
                    if !bounds_pointer {
                        return Err(RegistryError::SizeOfNonPointer {
                            name: arg.name.clone(),
                            pointer: pointer.clone(),
                        });
                    }
                }
            } else if !arg.of.is_empty() {
                return Err(RegistryError::BoundsOnNonSize {
                    name: arg.name.clone(),
                });
            }
        }
        // a pointer takes its bound from one size argument only
        for arg in &self.args {
            let sizes = self
                .args
                .iter()
                .filter(|size| size.of.contains(&arg.name))
                .count();
            if sizes > 1 {
                return Err(RegistryError::AmbiguousSize {
                    pointer: arg.name.clone(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use super::SemanticType::*;

    fn memset() -> ArgDescriptor {
        ArgDescriptor::new(vec![
            ArgSpec::new("queue", Queue, Role::Plain),
            ArgSpec::new("ptr", Pointer, Role::PointerOut).non_null(),
            ArgSpec::new("value", I32, Role::Plain),
            ArgSpec::size("count", Usize, ["ptr"]),
        ])
    }

    #[test]
    fn packed_size_sums_widths() {
        let ptr = mem::size_of::<*const ()>();
        assert_eq!(memset().packed_size(), ptr * 2 + 4 + mem::size_of::<usize>());
    }

    #[test]
    fn valid_descriptor_passes() {
        assert_eq!(memset().validate(), Ok(()));
        assert_eq!(memset().index_of("count"), Some(3));
    }

    #[test]
    fn size_need_not_be_adjacent() {
        assert_eq!(memset().size_of(1), Some(3));
        assert_eq!(memset().size_of(0), None);
        assert_eq!(memset().size_of(9), None);
    }

    #[test]
    fn one_size_bounds_several_pointers() {
        let memcpy = ArgDescriptor::new(vec![
            ArgSpec::new("dst", Pointer, Role::PointerOut),
            ArgSpec::new("src", Pointer, Role::PointerIn),
            ArgSpec::size("size", Usize, ["dst", "src"]),
        ]);
        assert_eq!(memcpy.validate(), Ok(()));
        assert_eq!(memcpy.size_of(0), Some(2));
        assert_eq!(memcpy.size_of(1), Some(2));
    }

    #[test]
    fn size_must_name_a_checked_pointer() {
        let unnamed = ArgDescriptor::new(vec![
            ArgSpec::new("ptr", Pointer, Role::PointerIn),
            ArgSpec::size("count", Usize, Vec::<String>::new()),
        ]);
        assert_eq!(
            unnamed.validate(),
            Err(RegistryError::DanglingSize {
                name: "count".into()
            })
        );

        let plain = ArgDescriptor::new(vec![
            ArgSpec::new("ptr", Pointer, Role::Plain),
            ArgSpec::size("count", Usize, ["ptr"]),
        ]);
        assert_eq!(
            plain.validate(),
            Err(RegistryError::SizeOfNonPointer {
                name: "count".into(),
                pointer: "ptr".into()
            })
        );

        let missing = ArgDescriptor::new(vec![ArgSpec::size("count", Usize, ["nope"])]);
        assert!(matches!(
            missing.validate(),
            Err(RegistryError::SizeOfNonPointer { .. })
        ));
    }

    #[test]
    fn pointer_with_two_sizes_is_ambiguous() {
        let descriptor = ArgDescriptor::new(vec![
            ArgSpec::new("ptr", Pointer, Role::PointerIn),
            ArgSpec::size("a", Usize, ["ptr"]),
            ArgSpec::size("b", Usize, ["ptr"]),
        ]);
        assert_eq!(
            descriptor.validate(),
            Err(RegistryError::AmbiguousSize {
                pointer: "ptr".into()
            })
        );
    }

    #[test]
    fn schema_violations_are_named() {
        let cases = [
            (
                vec![ArgSpec::new("", Pointer, Role::Plain)],
                RegistryError::EmptyArgumentName { index: 0 },
            ),
            (
                vec![
                    ArgSpec::new("a", U32, Role::Plain),
                    ArgSpec::new("a", U32, Role::Plain),
                ],
                RegistryError::DuplicateArgumentName { name: "a".into() },
            ),
            (
                vec![ArgSpec::new("q", Queue, Role::PointerIn)],
                RegistryError::PointerRoleOnNonPointer { name: "q".into() },
            ),
            (
                vec![
                    ArgSpec::new("p", Pointer, Role::PointerIn),
                    ArgSpec::size("n", Handle, ["p"]),
                ],
                RegistryError::SizeNotInteger { name: "n".into() },
            ),
            (
                vec![ArgSpec::new("p", Pointer, Role::Plain).non_null()],
                RegistryError::NonNullableNotPointer { name: "p".into() },
            ),
            (
                vec![
                    ArgSpec::new("p", Pointer, Role::PointerIn),
                    ArgSpec {
                        of: vec!["p".into()],
                        ..ArgSpec::new("n", Usize, Role::Plain)
                    },
                ],
                RegistryError::BoundsOnNonSize { name: "n".into() },
            ),
        ];
        for (args, expected) in cases {
            assert_eq!(ArgDescriptor::new(args).validate(), Err(expected));
        }
    }

    #[test]
    fn descriptors_read_from_json() {
        let descriptor: ArgDescriptor = serde_json::from_str(
            r#"[
                {"name": "ptr", "type": "pointer", "role": "pointer_in", "nullable": false},
                {"name": "size", "type": "usize", "role": "size", "of": ["ptr"]},
                {"name": "event", "type": "handle"}
            ]"#,
        )
        .unwrap();
        assert_eq!(descriptor.len(), 3);
        assert!(!descriptor.args()[0].nullable);
        assert_eq!(descriptor.args()[2].role, Role::Plain);
        assert!(descriptor.args()[2].nullable);
        assert_eq!(descriptor.size_of(0), Some(1));
        descriptor.validate().unwrap();
    }
}
