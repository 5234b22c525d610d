//! Argument decoding: descriptors, the decoder registry and the function
//! catalog that populates it.

pub mod catalog;
pub mod decode;
pub mod descriptor;
pub mod value;

use std::sync::{Arc, RwLock};

use hashbrown::HashMap;
use log::debug;

use crate::{
    error::{DecodeError, RegistryError},
    trace::Phase,
};

pub use catalog::{Catalog, Primitive};
pub use decode::{decode_packed, ArgPacker, DecodeFn};
pub use descriptor::{ArgDescriptor, ArgSpec, Role, SemanticType};
pub use value::{ArgValue, DecodedArgs, Scalar};

/// Identifier the host assigns to each plugin entry point. Ids are the
/// host's plugin API enum values, so they change between plugin interface
/// versions; names do not.
pub type FunctionId = u32;

/// One catalogued function
#[derive(Debug)]
pub struct FunctionEntry {
    name: String,
    descriptor: Arc<ArgDescriptor>,
    decode: DecodeFn,
}

impl FunctionEntry {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn descriptor(&self) -> &ArgDescriptor {
        &self.descriptor
    }

    pub fn decode(
        &self,
        function_id: FunctionId,
        raw: &[u8],
        phase: Phase,
    ) -> Result<DecodedArgs, DecodeError> {
        let needed = self.descriptor.packed_size();
        if raw.len() < needed {
            return Err(DecodeError::Truncated {
                function_id,
                needed,
                available: raw.len(),
            });
        }
        let values = (self.decode)(function_id, &self.descriptor, &raw[..needed], phase)?;
        if values.len() != self.descriptor.len() {
            return Err(DecodeError::Malformed {
                function_id,
                reason: format!(
                    "decoder produced {} values for {} arguments",
                    values.len(),
                    self.descriptor.len()
                ),
            });
        }
        Ok(DecodedArgs::new(Arc::clone(&self.descriptor), values))
    }
}

type IdTable = HashMap<FunctionId, Arc<FunctionEntry>, ahash::RandomState>;

/// Decoders by function name, plus the id each name has been bound to.
///
/// Names are registered once during setup. Ids are either pinned by the
/// catalog or bound the first time the host reports a call by name, see
/// [`Registry::resolve`].
#[derive(Debug, Default)]
pub struct Registry {
    functions: HashMap<String, Arc<FunctionEntry>, ahash::RandomState>,
    ids: RwLock<IdTable>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the decoder for `name`, optionally pinned to `function_id`.
    /// The descriptor is validated here, so decoding never sees a malformed
    /// schema.
    pub fn register(
        &mut self,
        function_id: Option<FunctionId>,
        name: impl Into<String>,
        descriptor: ArgDescriptor,
        decode: DecodeFn,
    ) -> Result<(), RegistryError> {
        let name = name.into();
        descriptor.validate()?;
        if self.functions.contains_key(&name) {
            return Err(RegistryError::DuplicateFunctionName { name });
        }
        let ids = self.ids.get_mut().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(function_id) = function_id {
            if ids.contains_key(&function_id) {
                return Err(RegistryError::DuplicateFunctionId { function_id });
            }
        }
        let entry = Arc::new(FunctionEntry {
            name: name.clone(),
            descriptor: Arc::new(descriptor),
            decode,
        });
        if let Some(function_id) = function_id {
            ids.insert(function_id, Arc::clone(&entry));
        }
        self.functions.insert(name, entry);
        Ok(())
    }

    /// Bind `function_id` to the function called `name`. Binding the same
    /// pair twice is fine; rebinding an id to another name is not.
    pub fn bind(&self, function_id: FunctionId, name: &str) -> Result<(), RegistryError> {
        let entry = self
            .functions
            .get(name)
            .ok_or_else(|| RegistryError::UnknownFunctionName {
                name: name.to_owned(),
            })?;
        let mut ids = self.ids.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        match ids.get(&function_id) {
            Some(bound) if bound.name == name => Ok(()),
            Some(bound) => Err(RegistryError::ConflictingBinding {
                function_id,
                bound: bound.name.clone(),
                requested: name.to_owned(),
            }),
            None => {
                debug!("registry: function id {function_id} is {name}");
                ids.insert(function_id, Arc::clone(entry));
                Ok(())
            }
        }
    }

    pub fn lookup(&self, function_id: FunctionId) -> Option<Arc<FunctionEntry>> {
        self.ids
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&function_id)
            .cloned()
    }

    /// The entry for `function_id`, binding it on first sight when the host
    /// also reported the function's name
    pub fn resolve(
        &self,
        function_id: FunctionId,
        name: Option<&str>,
    ) -> Option<Arc<FunctionEntry>> {
        if let Some(entry) = self.lookup(function_id) {
            return Some(entry);
        }
        let name = name?;
        if let Err(err) = self.bind(function_id, name) {
            debug!("registry: cannot bind function id {function_id}: {err}");
            return None;
        }
        self.lookup(function_id)
    }

    pub fn decode(
        &self,
        function_id: FunctionId,
        raw: &[u8],
        phase: Phase,
    ) -> Result<DecodedArgs, DecodeError> {
        self.lookup(function_id)
            .ok_or(DecodeError::UnknownFunctionId { function_id })?
            .decode(function_id, raw, phase)
    }

    /// Size of the packed buffer the host hands over for `function_id`
    pub fn packed_size(&self, function_id: FunctionId) -> Option<usize> {
        self.lookup(function_id)
            .map(|entry| entry.descriptor.packed_size())
    }

    /// The catalogued function called `name`, bound or not
    pub fn entry(&self, name: &str) -> Option<&Arc<FunctionEntry>> {
        self.functions.get(name)
    }

    /// The id `name` is currently bound to
    pub fn function_id(&self, name: &str) -> Option<FunctionId> {
        self.ids
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .find(|(_, entry)| entry.name == name)
            .map(|(&function_id, _)| function_id)
    }

    /// Number of catalogued functions
    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}
