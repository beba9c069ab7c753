//! Name → factory registry for discovery sources.
//!
//! The registry is built once at startup and handed to the service. Built-in
//! sources are added by [`Registry::with_builtins`]; anything else can be
//! added with [`Registry::register`] before sources are created.
//!
//! ```text
//! config.yaml                     Registry
//! discoveries:                    ┌──────────────────────────┐
//!   ironic:   {...}   ──create──▶ │ ironic  → IronicFactory  │ ──▶ Arc<dyn Discovery>
//!   netbox:   {...}   ──create──▶ │ netbox  → NetboxFactory  │
//!   switches: {type: switch}  ──▶ │ switch  → SwitchFactory  │
//!                                 └──────────────────────────┘
//! ```

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

use crate::config::{Options, TemplateValues};
use crate::discovery::Discovery;
use crate::error::DiscoveryError;

/// Process-wide values every factory may need.
#[derive(Debug, Clone)]
pub struct SharedDeps {
    pub options: Options,
    pub template: TemplateValues,
}

impl SharedDeps {
    pub fn new(options: Options) -> Self {
        let template = TemplateValues::from_options(&options);
        Self { options, template }
    }
}

/// Builds one kind of discovery source from its raw config fragment.
#[async_trait]
pub trait DiscoveryFactory: Send + Sync {
    async fn create(
        &self,
        name: &str,
        raw: &serde_yaml::Value,
        deps: &SharedDeps,
    ) -> Result<Arc<dyn Discovery>, DiscoveryError>;
}

pub struct Registry {
    factories: BTreeMap<String, Arc<dyn DiscoveryFactory>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Registry with the `ironic`, `netbox` and `switch` sources.
    pub fn with_builtins() -> Self {
        use crate::discovery_ironic::IronicFactory;
        use crate::discovery_netbox::NetboxFactory;
        use crate::discovery_switch::SwitchFactory;

        let mut registry = Self::new();
        registry.register("ironic", Arc::new(IronicFactory));
        registry.register("netbox", Arc::new(NetboxFactory));
        registry.register("switch", Arc::new(SwitchFactory));
        registry
    }

    /// Adds a factory. A second registration under the same name replaces
    /// the first.
    pub fn register(&mut self, name: impl Into<String>, factory: Arc<dyn DiscoveryFactory>) {
        let name = name.into();
        if self.factories.insert(name.clone(), factory).is_some() {
            warn!(discovery = %name, "discovery factory registered twice, replacing");
        }
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    /// Creates the source named `name` with the factory registered as `kind`.
    pub async fn create(
        &self,
        kind: &str,
        name: &str,
        raw: &serde_yaml::Value,
        deps: &SharedDeps,
    ) -> Result<Arc<dyn Discovery>, DiscoveryError> {
        let factory = self
            .factories
            .get(kind)
            .ok_or_else(|| DiscoveryError::UnknownSource {
                name: kind.to_string(),
                available: self.names(),
            })?;
        factory.create(name, raw, deps).await
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
