//! Provider tables backing the capability factories.
//!
//! A `ProviderTable` maps a provider name to the constructor of its adapter.
//! Tables are assembled once with a [`ProviderTableBuilder`] and are read-only
//! afterwards; lookup is exact and case-sensitive, with no fallback.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{Capability, ServiceError, ServiceResult};

/// Constructor stored in a provider table.
///
/// Receives the capability configuration and returns the adapter. It may
/// validate and prepare state but must not touch the network.
pub type Constructor<S, C> = fn(&C) -> ServiceResult<Arc<S>>;

/// A fixed mapping from provider name to adapter constructor.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use servicekit::{Capability, ErrorKind, Provider, ProviderTableBuilder};
///
/// #[derive(Debug)]
/// struct Stdout;
///
/// impl Provider for Stdout {
///     fn name(&self) -> &str { "stdout" }
///     fn capability(&self) -> Capability { Capability::Monitoring }
/// }
///
/// let table = ProviderTableBuilder::<dyn Provider, ()>::new(Capability::Monitoring)
///     .with("stdout", |_| Ok(Arc::new(Stdout) as Arc<dyn Provider>))
///     .build();
///
/// assert!(table.resolve("stdout", &()).is_ok());
/// let err = table.resolve("Stdout", &()).unwrap_err();
/// assert_eq!(err.kind(), ErrorKind::UnknownProvider);
/// ```
pub struct ProviderTable<S: ?Sized, C> {
    capability: Capability,
    constructors: HashMap<String, Constructor<S, C>>,
    ordered: Vec<String>,
}

impl<S: ?Sized, C> ProviderTable<S, C> {
    /// Create an empty table for `capability`.
    pub fn new(capability: Capability) -> Self {
        Self {
            capability,
            constructors: HashMap::new(),
            ordered: Vec::new(),
        }
    }

    /// The capability this table serves.
    pub fn capability(&self) -> Capability {
        self.capability
    }

    /// Register a constructor, returning an error if the name is taken.
    pub fn register_unique(
        &mut self,
        name: impl Into<String>,
        constructor: Constructor<S, C>,
    ) -> ServiceResult<()> {
        let name = name.into();
        if self.constructors.contains_key(&name) {
            return Err(ServiceError::invalid_config(
                self.capability.domain(),
                format!("{} provider already registered: {}", self.capability, name),
            ));
        }
        self.ordered.push(name.clone());
        self.constructors.insert(name, constructor);
        Ok(())
    }

    /// Construct the adapter registered as `name`.
    ///
    /// Fails with `UnknownProvider` when `name` has no entry. No constructor is
    /// invoked in that case.
    pub fn resolve(&self, name: &str, config: &C) -> ServiceResult<Arc<S>> {
        let constructor = self.constructors.get(name).ok_or_else(|| {
            tracing::warn!(capability = %self.capability, provider = name, "unknown provider");
            ServiceError::unknown_provider(self.capability, name)
        })?;

        tracing::debug!(capability = %self.capability, provider = name, "constructing adapter");
        constructor(config)
    }

    /// Check if a provider with the given name is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    /// Registered provider names in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.ordered.iter().map(|s| s.as_str()).collect()
    }

    /// Get the number of registered providers.
    pub fn len(&self) -> usize {
        self.constructors.len()
    }

    /// Check if the table is empty.
    pub fn is_empty(&self) -> bool {
        self.constructors.is_empty()
    }
}

impl<S: ?Sized, C> fmt::Debug for ProviderTable<S, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderTable")
            .field("capability", &self.capability)
            .field("providers", &self.ordered)
            .finish()
    }
}

/// Builder for assembling provider tables with a fluent API.
pub struct ProviderTableBuilder<S: ?Sized, C> {
    table: ProviderTable<S, C>,
}

impl<S: ?Sized, C> ProviderTableBuilder<S, C> {
    /// Create a new builder for `capability`.
    pub fn new(capability: Capability) -> Self {
        Self {
            table: ProviderTable::new(capability),
        }
    }

    /// Add a constructor. A later entry with the same name replaces the
    /// earlier one while keeping its position.
    pub fn with(mut self, name: impl Into<String>, constructor: Constructor<S, C>) -> Self {
        let name = name.into();
        if !self.table.constructors.contains_key(&name) {
            self.table.ordered.push(name.clone());
        }
        self.table.constructors.insert(name, constructor);
        self
    }

    /// Build the table.
    pub fn build(self) -> ProviderTable<S, C> {
        self.table
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::provider::Provider;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct TestProvider {
        name: &'static str,
    }

    impl Provider for TestProvider {
        fn name(&self) -> &str {
            self.name
        }

        fn capability(&self) -> Capability {
            Capability::Workflow
        }
    }

    static CONSTRUCTED: AtomicUsize = AtomicUsize::new(0);

    fn build_alpha(_: &()) -> ServiceResult<Arc<dyn Provider>> {
        CONSTRUCTED.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(TestProvider { name: "alpha" }))
    }

    fn build_beta(_: &()) -> ServiceResult<Arc<dyn Provider>> {
        Ok(Arc::new(TestProvider { name: "beta" }))
    }

    fn table() -> ProviderTable<dyn Provider, ()> {
        ProviderTableBuilder::new(Capability::Workflow)
            .with("alpha", build_alpha)
            .with("beta", build_beta)
            .build()
    }

    #[test]
    fn test_table_resolve() {
        let table = table();
        let provider = table.resolve("beta", &()).unwrap();
        assert_eq!(provider.name(), "beta");
    }

    #[test]
    fn test_table_unknown_provider_constructs_nothing() {
        let table = table();
        let before = CONSTRUCTED.load(Ordering::SeqCst);

        let err = table.resolve("gamma", &()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownProvider);
        assert!(err.message().contains("workflow"));
        assert!(err.message().contains("gamma"));
        assert_eq!(CONSTRUCTED.load(Ordering::SeqCst), before);
    }

    #[test]
    fn test_table_lookup_is_case_sensitive() {
        let table = table();
        assert!(table.contains("alpha"));
        assert!(!table.contains("Alpha"));
        assert!(table.resolve("ALPHA", &()).is_err());
    }

    #[test]
    fn test_table_names_keep_registration_order() {
        let table = table();
        assert_eq!(table.names(), vec!["alpha", "beta"]);
        assert_eq!(table.len(), 2);
        assert!(!table.is_empty());
    }

    #[test]
    fn test_register_unique_rejects_duplicates() {
        let mut table: ProviderTable<dyn Provider, ()> = ProviderTable::new(Capability::Workflow);
        assert!(table.register_unique("alpha", build_alpha).is_ok());

        let err = table.register_unique("alpha", build_beta).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfiguration);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_builder_replaces_in_place() {
        let table: ProviderTable<dyn Provider, ()> = ProviderTableBuilder::new(Capability::Workflow)
            .with("alpha", build_alpha)
            .with("beta", build_beta)
            .with("alpha", build_beta)
            .build();

        assert_eq!(table.names(), vec!["alpha", "beta"]);
        assert_eq!(table.resolve("alpha", &()).unwrap().name(), "beta");
    }
}
