//! Pin registry: name → pin and handle → pin lookups (spec.md §3, §4.E).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::pin::Pin;

struct Inner {
    by_name: HashMap<String, Arc<Pin>>,
    by_handle: HashMap<u32, Arc<Pin>>,
}

/// Owns the name-indexed and handle-indexed pin maps for one component.
///
/// Both maps live behind a single lock: every mutation that touches one
/// (declaring a pin, rebuilding on a full update) touches the other too,
/// so splitting the locks would only add an ordering hazard for no benefit
/// (spec.md §5's lock-ordering rules have nothing to say about these two
/// maps precisely because they are never locked independently).
pub struct PinRegistry {
    inner: Mutex<Inner>,
}

impl PinRegistry {
    pub fn new() -> Self {
        PinRegistry {
            inner: Mutex::new(Inner {
                by_name: HashMap::new(),
                by_handle: HashMap::new(),
            }),
        }
    }

    /// Declare a new pin. Errors if `name` is already declared
    /// (spec.md: "name: local identifier, unique within the component").
    pub fn declare(&self, pin: Arc<Pin>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.by_name.contains_key(pin.name()) {
            return Err(Error::DuplicatePin(pin.name().to_string()));
        }
        inner.by_name.insert(pin.name().to_string(), pin);
        Ok(())
    }

    pub fn by_name(&self, name: &str) -> Option<Arc<Pin>> {
        self.inner.lock().unwrap().by_name.get(name).cloned()
    }

    /// Look up by broker handle. `None` on an unknown handle — the caller
    /// (the protocol engine) treats that as a dropped, malformed message
    /// rather than a panic (spec.md §7).
    pub fn by_handle(&self, handle: u32) -> Option<Arc<Pin>> {
        self.inner.lock().unwrap().by_handle.get(&handle).cloned()
    }

    /// Rebuild the handle index to exactly the `(local pin name, handle)`
    /// pairs present in a full update (spec.md §3 invariant: "the handle
    /// index is rebuilt to exactly the set present in the update").
    /// Entries for names not found locally are skipped (malformed per
    /// spec.md §7) rather than aborting the whole update.
    pub fn rebuild_handles(&self, entries: &[(String, u32)]) -> Vec<Arc<Pin>> {
        let mut inner = self.inner.lock().unwrap();
        inner.by_handle.clear();
        let mut updated = Vec::with_capacity(entries.len());
        for (name, handle) in entries {
            if let Some(pin) = inner.by_name.get(name).cloned() {
                pin.set_handle(*handle);
                inner.by_handle.insert(*handle, Arc::clone(&pin));
                updated.push(pin);
            }
        }
        updated
    }

    /// All declared pins, in no particular order. Used by `unsync()` on
    /// disconnect and by bind-message construction.
    pub fn all(&self) -> Vec<Arc<Pin>> {
        self.inner.lock().unwrap().by_name.values().cloned().collect()
    }
}

impl Default for PinRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pin::{PinDirection, PinType};

    fn pin(name: &str) -> Arc<Pin> {
        Arc::new(Pin::new(name.to_string(), PinType::Bit, PinDirection::Out))
    }

    #[test]
    fn declare_duplicate_name_errors() {
        let reg = PinRegistry::new();
        reg.declare(pin("a")).unwrap();
        assert!(matches!(reg.declare(pin("a")), Err(Error::DuplicatePin(_))));
    }

    #[test]
    fn unknown_handle_lookup_returns_none() {
        let reg = PinRegistry::new();
        reg.declare(pin("a")).unwrap();
        assert!(reg.by_handle(99).is_none());
    }

    #[test]
    fn rebuild_handles_replaces_prior_index_exactly() {
        let reg = PinRegistry::new();
        reg.declare(pin("a")).unwrap();
        reg.declare(pin("b")).unwrap();

        reg.rebuild_handles(&[("a".to_string(), 1), ("b".to_string(), 2)]);
        assert!(reg.by_handle(1).is_some());
        assert!(reg.by_handle(2).is_some());

        // Second full update only mentions "a" under a new handle: "b"'s
        // old handle entry must disappear.
        reg.rebuild_handles(&[("a".to_string(), 7)]);
        assert!(reg.by_handle(1).is_none());
        assert!(reg.by_handle(2).is_none());
        assert!(reg.by_handle(7).is_some());
    }

    #[test]
    fn rebuild_skips_unknown_names() {
        let reg = PinRegistry::new();
        reg.declare(pin("a")).unwrap();
        let updated = reg.rebuild_handles(&[("a".to_string(), 1), ("nope".to_string(), 2)]);
        assert_eq!(updated.len(), 1);
        assert!(reg.by_handle(2).is_none());
    }
}
