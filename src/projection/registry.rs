//! Explicit registry of read-model types
//!
//! Built at startup and passed to the components that need it; maps each
//! read-model name to the type that claimed it and its signature.

use std::any::{type_name, TypeId};
use std::collections::BTreeMap;

use crate::domain::{ReadModel, Signature};
use crate::infra::{ProjectionError, Result};

/// Name, signature and identity of one read-model type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadModelDescriptor {
    pub name: String,
    pub signature: Signature,
    pub type_id: TypeId,
    pub type_name: &'static str,
}

impl ReadModelDescriptor {
    pub fn of<M: ReadModel>() -> Self {
        Self {
            name: M::NAME.to_string(),
            signature: M::SIGNATURE,
            type_id: TypeId::of::<M>(),
            type_name: type_name::<M>(),
        }
    }
}

/// Read-model types known to this process, keyed by name
#[derive(Debug, Default, Clone)]
pub struct ReadModelRegistry {
    descriptors: BTreeMap<String, ReadModelDescriptor>,
}

impl ReadModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<M: ReadModel>(&mut self) -> Result<&ReadModelDescriptor> {
        self.register_descriptor(ReadModelDescriptor::of::<M>())
    }

    /// Registering the same type twice is a no-op; a second type claiming an
    /// existing name is a configuration error.
    pub fn register_descriptor(
        &mut self,
        descriptor: ReadModelDescriptor,
    ) -> Result<&ReadModelDescriptor> {
        if descriptor.name.is_empty() {
            return Err(ProjectionError::Configuration(format!(
                "read model {} has an empty name",
                descriptor.type_name
            )));
        }

        if let Some(existing) = self.descriptors.get(&descriptor.name) {
            if existing.type_id != descriptor.type_id {
                return Err(ProjectionError::DuplicateReadModelName {
                    name: descriptor.name,
                    existing: existing.type_name.to_string(),
                    conflicting: descriptor.type_name.to_string(),
                });
            }
        }

        let name = descriptor.name.clone();
        Ok(self.descriptors.entry(name).or_insert(descriptor))
    }

    pub fn get(&self, name: &str) -> Option<&ReadModelDescriptor> {
        self.descriptors.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.descriptors.contains_key(name)
    }

    pub fn signature(&self, name: &str) -> Option<Signature> {
        self.get(name).map(|d| d.signature)
    }

    /// Registered names in sorted order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.descriptors.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}
