//! The function catalog: which plugin entry points exist, how their argument
//! buffers are laid out, and which of them allocate, free or otherwise touch
//! USM memory in ways the argument roles alone cannot express.
//!
//! The catalog is data, not code. A JSON document ships with the crate and
//! can be swapped for another one at init:
//!
//! ```json
//! {
//!   "version": 2,
//!   "pi_version": "12.0",
//!   "functions": [
//!     {
//!       "name": "piextUSMFree",
//!       "args": [
//!         { "name": "context", "type": "context" },
//!         { "name": "ptr", "type": "pointer" }
//!       ],
//!       "primitives": [{ "free": { "pointer": "ptr", "context": "context" } }]
//!     }
//!   ]
//! }
//! ```
//!
//! Functions are keyed by name. The host's numeric ids depend on the plugin
//! interface version, so an entry only carries an `id` when it is pinned to
//! one; otherwise the id is bound the first time the host reports the call
//! by name. Primitives refer to arguments by name; names are resolved to
//! positions and type-checked while loading.

use std::{fs, path::Path};

use hashbrown::HashMap;
use log::debug;
use once_cell::sync::OnceCell;
use serde::Deserialize;

use crate::{
    args::{
        decode::decode_packed,
        descriptor::{ArgDescriptor, SemanticType},
        FunctionId, Registry,
    },
    error::CatalogError,
    usm::AllocKind,
};

/// The catalog format this build understands
pub const CATALOG_VERSION: u32 = 2;

const BUILTIN_JSON: &str = include_str!("pi_catalog.json");

static BUILTIN: OnceCell<CatalogFile> = OnceCell::new();

/// Something a call does to, or requires of, the ledger. Fields are argument
/// positions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Primitive {
    /// Post-call, the callee has written the new allocation's address into
    /// the `result` slot
    Allocation {
        kind: AllocKind,
        result: usize,
        size: usize,
        context: Option<usize>,
        device: Option<usize>,
    },
    Free {
        pointer: usize,
        context: Option<usize>,
    },
    /// A USM pointer passed by reference, e.g. a kernel argument. Checked like
    /// a pointer-in argument after reading it out of `slot`.
    IndirectPointer { slot: usize },
    /// A pitched region: `height` rows of `width` bytes, `pitch` bytes apart
    Extent2D {
        pointer: usize,
        pitch: usize,
        width: usize,
        height: usize,
    },
    /// A host pointer the callee reads `size` bytes from when any bit of
    /// `mask` is set in `flags`. Only bounds-checked when it points into a
    /// USM allocation.
    HostBuffer {
        pointer: usize,
        size: usize,
        flags: usize,
        mask: u64,
    },
}

impl Primitive {
    /// Bytes a pitched region spans from its first byte
    pub fn extent_2d(pitch: u64, width: u64, height: u64) -> u64 {
        match height {
            0 => 0,
            rows => pitch.saturating_mul(rows - 1).saturating_add(width),
        }
    }
}

/// Primitives by function name
pub type PrimitiveTable = HashMap<String, Vec<Primitive>, ahash::RandomState>;

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CatalogFile {
    version: u32,
    /// Plugin interface version the entries were written against
    pi_version: String,
    functions: Vec<FunctionSpec>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FunctionSpec {
    #[serde(default)]
    id: Option<FunctionId>,
    name: String,
    args: ArgDescriptor,
    #[serde(default)]
    primitives: Vec<PrimitiveSpec>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
enum PrimitiveSpec {
    Allocation {
        kind: AllocKind,
        result: String,
        size: String,
        #[serde(default)]
        context: Option<String>,
        #[serde(default)]
        device: Option<String>,
    },
    Free {
        pointer: String,
        #[serde(default)]
        context: Option<String>,
    },
    IndirectPointer {
        slot: String,
    },
    #[serde(rename = "extent_2d")]
    Extent2D {
        pointer: String,
        pitch: String,
        width: String,
        height: String,
    },
    HostBuffer {
        pointer: String,
        size: String,
        flags: String,
        mask: u64,
    },
}

/// A loaded catalog: a populated [`Registry`] plus the primitive table
#[derive(Debug)]
pub struct Catalog {
    pi_version: String,
    registry: Registry,
    primitives: PrimitiveTable,
}

impl Catalog {
    /// The catalog shipped with the crate
    pub fn builtin() -> Result<Self, CatalogError> {
        let file = BUILTIN.get_or_try_init(|| serde_json::from_str(BUILTIN_JSON))?;
        Self::from_file(file)
    }

    pub fn from_json(json: &str) -> Result<Self, CatalogError> {
        Self::from_file(&serde_json::from_str(json)?)
    }

    pub fn from_path<P>(path: P) -> Result<Self, CatalogError>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&json)
    }

    fn from_file(file: &CatalogFile) -> Result<Self, CatalogError> {
        if file.version != CATALOG_VERSION {
            return Err(CatalogError::UnsupportedVersion {
                found: file.version,
                expected: CATALOG_VERSION,
            });
        }
        let mut registry = Registry::new();
        let mut primitives = PrimitiveTable::default();
        for function in &file.functions {
            let resolved = function
                .primitives
                .iter()
                .map(|spec| resolve(function, spec))
                .collect::<Result<Vec<_>, _>>()?;
            registry
                .register(function.id, &function.name, function.args.clone(), decode_packed)
                .map_err(|source| CatalogError::Registry {
                    function: function.name.clone(),
                    source,
                })?;
            if !resolved.is_empty() {
                primitives.insert(function.name.clone(), resolved);
            }
        }
        debug!(
            "catalog: {} functions, {} with primitives, plugin interface {}",
            registry.len(),
            primitives.len(),
            file.pi_version
        );
        Ok(Self {
            pi_version: file.pi_version.clone(),
            registry,
            primitives,
        })
    }

    pub fn pi_version(&self) -> &str {
        &self.pi_version
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn primitives(&self) -> &PrimitiveTable {
        &self.primitives
    }

    /// The id `name` is bound to, if any
    pub fn function_id(&self, name: &str) -> Option<FunctionId> {
        self.registry.function_id(name)
    }

    pub fn into_parts(self) -> (Registry, PrimitiveTable) {
        (self.registry, self.primitives)
    }
}

fn resolve(function: &FunctionSpec, spec: &PrimitiveSpec) -> Result<Primitive, CatalogError> {
    let arg = |name: &str,
               expected: &'static str,
               ok: fn(SemanticType) -> bool|
     -> Result<usize, CatalogError> {
        let index = function
            .args
            .index_of(name)
            .ok_or_else(|| CatalogError::UnknownArgument {
                function: function.name.clone(),
                argument: name.to_owned(),
            })?;
        match function.args.get(index) {
            Some(spec) if ok(spec.ty) => Ok(index),
            _ => Err(CatalogError::ArgumentMismatch {
                function: function.name.clone(),
                argument: name.to_owned(),
                expected,
            }),
        }
    };
    let context = |name: &Option<String>| {
        name.as_deref()
            .map(|name| arg(name, "a context", |ty| ty == SemanticType::Context))
            .transpose()
    };
    let pointer = |name: &str| arg(name, "a pointer", |ty| ty == SemanticType::Pointer);
    let integer = |name: &str| arg(name, "an integer", SemanticType::is_integer);

    Ok(match spec {
        PrimitiveSpec::Allocation {
            kind,
            result,
            size,
            context: context_name,
            device,
        } => Primitive::Allocation {
            kind: *kind,
            result: arg(result, "a result slot", |ty| ty == SemanticType::PointerSlot)?,
            size: arg(size, "a size", SemanticType::is_integer)?,
            context: context(context_name)?,
            device: device
                .as_deref()
                .map(|name| arg(name, "a device", |ty| ty == SemanticType::Device))
                .transpose()?,
        },
        PrimitiveSpec::Free {
            pointer: name,
            context: context_name,
        } => Primitive::Free {
            pointer: pointer(name)?,
            context: context(context_name)?,
        },
        PrimitiveSpec::IndirectPointer { slot } => Primitive::IndirectPointer {
            slot: arg(slot, "a pointer slot", |ty| ty == SemanticType::PointerSlot)?,
        },
        PrimitiveSpec::Extent2D {
            pointer: name,
            pitch,
            width,
            height,
        } => Primitive::Extent2D {
            pointer: pointer(name)?,
            pitch: integer(pitch)?,
            width: integer(width)?,
            height: integer(height)?,
        },
        PrimitiveSpec::HostBuffer {
            pointer: name,
            size,
            flags,
            mask,
        } => Primitive::HostBuffer {
            pointer: pointer(name)?,
            size: integer(size)?,
            flags: integer(flags)?,
            mask: *mask,
        },
    })
}
