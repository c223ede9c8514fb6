//! Logical pins of a remote component (spec.md §3, "Pin").

use std::sync::mpsc::Sender;
use std::sync::{Mutex, RwLock};

/// The four wire-level value types a pin can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PinType {
    Bit,
    S32,
    U32,
    Float,
}

/// Pin direction, frozen at creation (spec.md §3 invariants).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PinDirection {
    /// Driven by the broker; local `set()` is a programmer error.
    In,
    /// Driven locally, mirrored to the broker.
    Out,
    /// Behaves as `Out` for the purpose of outbound change propagation.
    Io,
}

impl PinDirection {
    /// True for any direction whose local changes must be sent to the
    /// broker (spec.md §4.F: "pin direction is not IN").
    pub fn propagates_local_changes(self) -> bool {
        !matches!(self, PinDirection::In)
    }
}

/// A pin's current value, tagged by [`PinType`]. Carrying the tag in the
/// type itself (rather than four `Option` fields as the wire schema does)
/// makes "exactly one payload field" a property of the type instead of a
/// runtime invariant to check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PinValue {
    Bit(bool),
    S32(i32),
    U32(u32),
    Float(f32),
}

impl PinValue {
    pub fn pintype(&self) -> PinType {
        match self {
            PinValue::Bit(_) => PinType::Bit,
            PinValue::S32(_) => PinType::S32,
            PinValue::U32(_) => PinType::U32,
            PinValue::Float(_) => PinType::Float,
        }
    }

    /// Zero value of `pintype` (spec.md §3: "default = zero of type").
    pub fn zero(pintype: PinType) -> Self {
        match pintype {
            PinType::Bit => PinValue::Bit(false),
            PinType::S32 => PinValue::S32(0),
            PinType::U32 => PinValue::U32(0),
            PinType::Float => PinValue::Float(0.0),
        }
    }
}

type ValueObserver = Box<dyn Fn(PinValue) + Send + Sync>;
type SyncedObserver = Box<dyn Fn(bool) + Send + Sync>;

struct Inner {
    handle: Option<u32>,
    value: PinValue,
    synced: bool,
    value_observers: Vec<ValueObserver>,
    synced_observers: Vec<SyncedObserver>,
}

/// A named, typed, directional signal belonging to a
/// [`crate::component::RemoteComponent`].
///
/// The component back-reference described in spec.md §9 ("Pin back-pointer
/// to component") is modeled as a send-only channel of pin names rather
/// than shared ownership: `set()` pushes this pin's name onto the channel
/// and the engine looks the pin back up in its registry. This keeps `Pin`
/// free of any lifetime tied to the owning component.
pub struct Pin {
    name: String,
    pintype: PinType,
    direction: PinDirection,
    inner: Mutex<Inner>,
    /// Installed by the component at `newpin()` time; `None` before the
    /// pin has been attached (never observable by users of the public API).
    change_notify: RwLock<Option<Sender<String>>>,
}

impl Pin {
    pub(crate) fn new(name: String, pintype: PinType, direction: PinDirection) -> Self {
        Pin {
            name,
            pintype,
            direction,
            inner: Mutex::new(Inner {
                handle: None,
                value: PinValue::zero(pintype),
                synced: false,
                value_observers: Vec::new(),
                synced_observers: Vec::new(),
            }),
            change_notify: RwLock::new(None),
        }
    }

    pub(crate) fn attach(&self, tx: Sender<String>) {
        *self.change_notify.write().unwrap() = Some(tx);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pintype(&self) -> PinType {
        self.pintype
    }

    pub fn direction(&self) -> PinDirection {
        self.direction
    }

    pub fn handle(&self) -> Option<u32> {
        self.inner.lock().unwrap().handle
    }

    /// Assign (or reassign) the broker handle. Called only by the
    /// registry on full updates (spec.md §3: "assigned on first full
    /// update, stable thereafter").
    pub(crate) fn set_handle(&self, handle: u32) {
        self.inner.lock().unwrap().handle = handle.into();
    }

    pub fn get(&self) -> PinValue {
        self.inner.lock().unwrap().value
    }

    pub fn synced(&self) -> bool {
        self.inner.lock().unwrap().synced
    }

    /// Locally-driven change (spec.md §4.F "Outbound pin changes").
    /// A no-op if `value` equals the current value. Otherwise updates the
    /// value, clears `synced`, fires `on_value_changed`/`on_synced_changed`
    /// as appropriate, and notifies the owning component so it can decide
    /// whether to emit a `HALRCOMP_SET`.
    pub fn set(&self, value: PinValue) {
        let mut changed = false;
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.value != value {
                inner.value = value;
                changed = true;
                if inner.synced {
                    inner.synced = false;
                    for obs in &inner.synced_observers {
                        obs(false);
                    }
                }
                for obs in &inner.value_observers {
                    obs(value);
                }
            }
        }
        if changed {
            if let Some(tx) = self.change_notify.read().unwrap().as_ref() {
                let _ = tx.send(self.name.clone());
            }
        }
    }

    /// Apply a value received from the broker (incremental/full update).
    /// Always marks the pin synced, regardless of whether the value
    /// actually changed (spec.md §4.F: "Setting a value from the wire
    /// additionally marks the pin `synced = true`").
    pub(crate) fn apply_wire_value(&self, value: PinValue) {
        let mut inner = self.inner.lock().unwrap();
        if inner.value != value {
            inner.value = value;
            for obs in &inner.value_observers {
                obs(value);
            }
        }
        if !inner.synced {
            inner.synced = true;
            for obs in &inner.synced_observers {
                obs(true);
            }
        }
    }

    /// Clear `synced` on disconnect (spec.md §4.F "Unsync on disconnect").
    /// A no-op (and fires no observer) if already unsynced.
    pub(crate) fn unsync(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.synced {
            inner.synced = false;
            for obs in &inner.synced_observers {
                obs(false);
            }
        }
    }

    pub fn on_value_changed<F>(&self, f: F)
    where
        F: Fn(PinValue) + Send + Sync + 'static,
    {
        self.inner.lock().unwrap().value_observers.push(Box::new(f));
    }

    pub fn on_synced_changed<F>(&self, f: F)
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.inner.lock().unwrap().synced_observers.push(Box::new(f));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;

    #[test]
    fn set_is_noop_when_value_unchanged() {
        let pin = Pin::new("p".to_string(), PinType::Bit, PinDirection::Out);
        let (tx, rx) = channel();
        pin.attach(tx);
        pin.set(PinValue::Bit(false)); // equals zero-default, no-op
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn set_notifies_change_channel_and_unsyncs() {
        let pin = Pin::new("p".to_string(), PinType::Bit, PinDirection::Out);
        let (tx, rx) = channel();
        pin.attach(tx);
        pin.apply_wire_value(PinValue::Bit(false));
        assert!(pin.synced());

        pin.set(PinValue::Bit(true));
        assert_eq!(pin.get(), PinValue::Bit(true));
        assert!(!pin.synced());
        assert_eq!(rx.recv().unwrap(), "p");
    }

    #[test]
    fn apply_wire_value_always_syncs() {
        let pin = Pin::new("p".to_string(), PinType::S32, PinDirection::In);
        pin.apply_wire_value(PinValue::S32(0)); // same as default, still syncs
        assert!(pin.synced());
    }

    #[test]
    fn pintype_and_direction_are_frozen() {
        let pin = Pin::new("p".to_string(), PinType::Float, PinDirection::Io);
        assert_eq!(pin.pintype(), PinType::Float);
        assert_eq!(pin.direction(), PinDirection::Io);
        pin.set(PinValue::Float(1.0));
        assert_eq!(pin.pintype(), PinType::Float);
        assert_eq!(pin.direction(), PinDirection::Io);
    }

    #[test]
    fn handle_assigned_once_and_stable() {
        let pin = Pin::new("p".to_string(), PinType::U32, PinDirection::Out);
        assert_eq!(pin.handle(), None);
        pin.set_handle(5);
        assert_eq!(pin.handle(), Some(5));
        pin.set_handle(5);
        assert_eq!(pin.handle(), Some(5));
    }

    #[test]
    fn value_observer_fires_only_on_real_change() {
        let pin = Pin::new("p".to_string(), PinType::Bit, PinDirection::Out);
        let seen = std::sync::Arc::new(Mutex::new(Vec::new()));
        let seen_cloned = std::sync::Arc::clone(&seen);
        pin.on_value_changed(move |v| seen_cloned.lock().unwrap().push(v));
        pin.set(PinValue::Bit(false)); // no-op, equals default
        pin.set(PinValue::Bit(true)); // real change
        pin.set(PinValue::Bit(true)); // no-op
        assert_eq!(seen.lock().unwrap().len(), 1);
    }
}
