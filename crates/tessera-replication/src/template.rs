//! Name to prototype map shared by server and client.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::behaviour::NetworkBehaviour;
use crate::error::SpawnError;

type Factory = dyn Fn() -> Vec<Box<dyn NetworkBehaviour>> + Send + Sync;

/// Read-only set of templates, cheap to clone.
///
/// Both sides must be built from the same registrations so a template name
/// yields the same field layout and request order everywhere.
#[derive(Clone, Default)]
pub struct TemplateRegistry {
    templates: Arc<HashMap<String, Arc<Factory>>>,
}

impl TemplateRegistry {
    pub fn builder() -> TemplateRegistryBuilder {
        TemplateRegistryBuilder::default()
    }

    /// Build a fresh behaviour list for `name`.
    pub fn instantiate(&self, name: &str) -> Result<Vec<Box<dyn NetworkBehaviour>>, SpawnError> {
        let factory = self
            .templates
            .get(name)
            .ok_or_else(|| SpawnError::UnknownTemplate(name.to_owned()))?;
        Ok(factory())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.templates.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.templates.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

impl fmt::Debug for TemplateRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TemplateRegistry")
            .field("templates", &self.names())
            .finish()
    }
}

/// Collects templates at startup.
#[derive(Default)]
pub struct TemplateRegistryBuilder {
    templates: HashMap<String, Arc<Factory>>,
}

impl TemplateRegistryBuilder {
    /// Register `factory` under `name`. A later registration under the same
    /// name replaces the earlier one.
    pub fn register<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Vec<Box<dyn NetworkBehaviour>> + Send + Sync + 'static,
    {
        let name = name.into();
        if self.templates.insert(name.clone(), Arc::new(factory)).is_some() {
            tracing::warn!(template = %name, "template registered twice, keeping the last");
        }
        self
    }

    pub fn build(self) -> TemplateRegistry {
        TemplateRegistry {
            templates: Arc::new(self.templates),
        }
    }
}
