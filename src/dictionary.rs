//! Swappable Information Element dictionary (spec §1, §5, §6).
//!
//! The dictionary is treated as an external, read-mostly collaborator: every
//! parser consults it to resolve `(enterprise, id)` pairs into names/types
//! for logging and NetFlow conversion, but the pipeline must also be able to
//! hot-swap it at runtime without stopping the world. `parking_lot::RwLock`
//! gives readers (every parser, on every message) an uncontended fast path;
//! the rare writer (an operator-triggered reload) takes the write lock only
//! for the instant it takes to replace the `Arc`.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::ie::{self, IeId};

/// Read-only view onto Information Element metadata. The built-in
/// [`StaticDictionary`] is backed by the [`ie`] module's compiled-in subset
/// of the IANA registry; a deployment that needs the full registry (or
/// enterprise-specific elements loaded from an external file) implements
/// this trait itself and installs it via [`SharedDictionary::swap`].
pub trait IeDictionary: Send + Sync {
    /// Human-readable name, if known.
    fn name(&self, id: IeId) -> Option<&str>;

    /// True if this dictionary has an entry for `id` at all. NetFlow
    /// converters and the generic data-record printer use this to decide
    /// whether a field can be named or must be reported as raw bytes.
    fn contains(&self, id: IeId) -> bool {
        self.name(id).is_some()
    }
}

/// The compiled-in IE catalog (spec §6 "a representative subset of the
/// well-known IANA registry").
#[derive(Debug, Default, Clone, Copy)]
pub struct StaticDictionary;

impl IeDictionary for StaticDictionary {
    fn name(&self, id: IeId) -> Option<&str> {
        ie::name(id)
    }
}

/// Thread-safe handle to the dictionary currently in effect. Cloning is
/// cheap (an `Arc` of the lock); every clone observes the same dictionary
/// and the same swaps.
#[derive(Clone)]
pub struct SharedDictionary {
    inner: Arc<RwLock<Arc<dyn IeDictionary>>>,
}

impl SharedDictionary {
    pub fn new(dict: Arc<dyn IeDictionary>) -> Self {
        SharedDictionary { inner: Arc::new(RwLock::new(dict)) }
    }

    pub fn static_default() -> Self {
        Self::new(Arc::new(StaticDictionary))
    }

    /// Returns the dictionary currently in effect. The returned `Arc` stays
    /// valid (and consistent) even if a concurrent [`SharedDictionary::swap`]
    /// installs a new one immediately after this call returns.
    pub fn current(&self) -> Arc<dyn IeDictionary> {
        Arc::clone(&self.inner.read())
    }

    /// Installs a new dictionary, returning the one it replaced. Every
    /// Template manager in the pipeline is expected to react to this by
    /// draining its snapshots as garbage and starting over empty (spec §5),
    /// since a swapped dictionary may change how existing templates'
    /// elements are interpreted.
    pub fn swap(&self, dict: Arc<dyn IeDictionary>) -> Arc<dyn IeDictionary> {
        std::mem::replace(&mut *self.inner.write(), dict)
    }
}

impl Default for SharedDictionary {
    fn default() -> Self {
        Self::static_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EmptyDictionary;
    impl IeDictionary for EmptyDictionary {
        fn name(&self, _id: IeId) -> Option<&str> {
            None
        }
    }

    #[test]
    fn static_dictionary_knows_well_known_elements() {
        let d = StaticDictionary;
        assert_eq!(d.name(ie::SOURCE_IPV4_ADDRESS), Some("sourceIPv4Address"));
        assert!(!d.contains((0, 65000)));
    }

    #[test]
    fn swap_replaces_and_returns_previous() {
        let shared = SharedDictionary::static_default();
        assert!(shared.current().contains(ie::SOURCE_IPV4_ADDRESS));

        let previous = shared.swap(Arc::new(EmptyDictionary));
        assert!(previous.contains(ie::SOURCE_IPV4_ADDRESS));
        assert!(!shared.current().contains(ie::SOURCE_IPV4_ADDRESS));
    }
}
