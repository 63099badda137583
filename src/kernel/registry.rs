//! Name-to-binding registry and the per-context import cache.
//!
//! The [`Registry`] is filled while modules install and sealed before the
//! kernel accepts calls. After sealing, the only mutations are guest
//! entry-point registration and explicit host rebinding, both performed by
//! the kernel while holding its execution guard.
//!
//! The [`ImportCache`] memoizes specifier resolution for one context's
//! lifetime and is cleared wholesale when the context is torn down.

use std::collections::HashMap;

use crate::capabilities::Binding;

/// Registry mutation failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// Host bindings cannot be added after installation.
    #[error("registry is sealed; cannot install `{0}`")]
    Sealed(String),
    /// A guest tried to export over a host binding.
    #[error("`{0}` is a host binding and cannot be exported by guest code")]
    HostCollision(String),
    /// Only host bindings can be re-registered by the host.
    #[error("`{0}` is not a host binding")]
    NotHost(String),
}

/// Mapping from binding name to runtime value handle.
#[derive(Debug, Default)]
pub struct Registry {
    bindings: HashMap<String, Binding>,
    sealed: bool,
}

impl Registry {
    /// Empty, unsealed registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a host binding. A binding already present under the same name
    /// is replaced and returned (later modules shadow earlier ones).
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Sealed`] after [`seal`](Self::seal).
    pub fn install(&mut self, binding: Binding) -> Result<Option<Binding>, RegistryError> {
        if self.sealed {
            return Err(RegistryError::Sealed(binding.name().to_owned()));
        }
        Ok(self.bindings.insert(binding.name().to_owned(), binding))
    }

    /// Replace or add a host binding after sealing. The caller must hold the
    /// kernel's execution guard and invalidate the import cache entry.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotHost`] for guest entry points.
    pub fn rebind(&mut self, binding: Binding) -> Result<Option<Binding>, RegistryError> {
        if !binding.is_host() {
            return Err(RegistryError::NotHost(binding.name().to_owned()));
        }
        Ok(self.bindings.insert(binding.name().to_owned(), binding))
    }

    /// Freeze the host binding set.
    pub fn seal(&mut self) {
        self.sealed = true;
    }

    /// Whether installation has finished.
    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Look up a binding by name.
    pub fn resolve(&self, name: &str) -> Option<Binding> {
        self.bindings.get(name).cloned()
    }

    /// Publish a guest entry point. Re-exporting a guest name replaces it.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::HostCollision`] if a host binding owns the name.
    pub fn register_export(&mut self, name: &str, origin: &str) -> Result<(), RegistryError> {
        if self.bindings.get(name).is_some_and(Binding::is_host) {
            return Err(RegistryError::HostCollision(name.to_owned()));
        }
        self.bindings
            .insert(name.to_owned(), Binding::export(origin, name));
        Ok(())
    }

    /// Number of registered names.
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.bindings.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Memoized import resolution for one context.
#[derive(Debug, Default)]
pub struct ImportCache {
    entries: HashMap<String, Binding>,
    hits: u64,
    misses: u64,
}

impl ImportCache {
    /// Empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached binding for `specifier`, or resolve it once with
    /// `resolve` and remember the result. Failed resolutions are not cached.
    ///
    /// # Errors
    ///
    /// Propagates the resolver's error.
    pub fn resolve_with<E, F>(&mut self, specifier: &str, resolve: F) -> Result<Binding, E>
    where
        F: FnOnce(&str) -> Result<Binding, E>,
    {
        if let Some(binding) = self.entries.get(specifier) {
            self.hits = self.hits.saturating_add(1);
            return Ok(binding.clone());
        }
        let binding = resolve(specifier)?;
        self.misses = self.misses.saturating_add(1);
        self.entries.insert(specifier.to_owned(), binding.clone());
        Ok(binding)
    }

    /// Whether `specifier` has been resolved already.
    pub fn contains(&self, specifier: &str) -> bool {
        self.entries.contains_key(specifier)
    }

    /// Number of cached specifiers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Lookups answered from the cache.
    pub fn hits(&self) -> u64 {
        self.hits
    }

    /// Lookups that had to resolve.
    pub fn misses(&self) -> u64 {
        self.misses
    }

    /// Drop one entry so the next lookup resolves again.
    pub fn invalidate(&mut self, specifier: &str) -> bool {
        self.entries.remove(specifier).is_some()
    }

    /// Forget every entry. Called on context teardown.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
