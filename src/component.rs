//! Public API: create a remote component, declare pins, connect (spec.md §4.G, §6).

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::discovery::ServiceDiscovery;
use crate::engine::RemoteComponentEngine;
use crate::error::{ComponentError, Error, Result};
use crate::pin::{Pin, PinDirection, PinType, PinValue};
use crate::registry::PinRegistry;
use crate::service_data::ServiceData;

struct Uris {
    halrcmd: Option<String>,
    halrcomp: Option<String>,
}

/// A local stand-in for a remote HAL component: owns a pin registry and a
/// [`RemoteComponentEngine`], and optionally a [`ServiceDiscovery`] browser
/// used to locate the broker.
pub struct RemoteComponent {
    name: String,
    registry: Arc<PinRegistry>,
    engine: Arc<RemoteComponentEngine>,
    uris: Arc<Mutex<Uris>>,
    discovery: Mutex<Option<Arc<ServiceDiscovery>>>,
}

impl RemoteComponent {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let registry = Arc::new(PinRegistry::new());
        let engine = RemoteComponentEngine::new(name.clone(), Arc::clone(&registry))?;
        Ok(RemoteComponent {
            name,
            registry,
            engine,
            uris: Arc::new(Mutex::new(Uris { halrcmd: None, halrcomp: None })),
            discovery: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declare a new pin. Errors if `name` is already declared on this
    /// component (spec.md §3 invariant).
    pub fn newpin(&self, name: impl Into<String>, pintype: PinType, direction: PinDirection) -> Result<Arc<Pin>> {
        let pin = Arc::new(Pin::new(name.into(), pintype, direction));
        pin.attach(self.engine.change_sender());
        self.registry.declare(Arc::clone(&pin))?;
        Ok(pin)
    }

    pub fn pin(&self, name: &str) -> Option<Arc<Pin>> {
        self.registry.by_name(name)
    }

    /// Sugar for `pin(name).get()`.
    pub fn get(&self, name: &str) -> Result<PinValue> {
        self.pin(name).map(|p| p.get()).ok_or_else(|| Error::UnknownPin(name.to_string()))
    }

    /// Sugar for `pin(name).set(value)`.
    pub fn set(&self, name: &str, value: PinValue) -> Result<()> {
        let pin = self.pin(name).ok_or_else(|| Error::UnknownPin(name.to_string()))?;
        pin.set(value);
        Ok(())
    }

    /// Must be called before [`RemoteComponent::ready`].
    pub fn set_halrcmd_uri(&self, uri: impl Into<String>) {
        self.uris.lock().unwrap().halrcmd = Some(uri.into());
    }

    /// Must be called before [`RemoteComponent::ready`].
    pub fn set_halrcomp_uri(&self, uri: impl Into<String>) {
        self.uris.lock().unwrap().halrcomp = Some(uri.into());
    }

    /// `no_create`: ask the broker not to create this component if it
    /// does not already exist (supplemented from `original_source`'s
    /// `halremote.py`; part of the `HALRCOMP_BIND` descriptor, spec.md §4.F).
    pub fn set_no_create(&self, flag: bool) {
        self.engine.set_no_create(flag);
    }

    /// Attach a discovery browser whose resolved `ServiceData` will be
    /// used to fill in the halrcmd/halrcomp URIs before `ready()`, keyed
    /// by the `service=` TXT value (`"halrcmd"` / `"halrcomp"`).
    pub fn use_discovery(&self, discovery: Arc<ServiceDiscovery>) {
        let uris = Arc::clone(&self.uris);
        discovery.on_discovered(move |data: &ServiceData| apply_discovered(&uris, data));
        *self.discovery.lock().unwrap() = Some(discovery);
    }

    pub fn start_discovery(&self) {
        if let Some(discovery) = self.discovery.lock().unwrap().as_ref() {
            discovery.start();
        }
    }

    pub fn on_discovered<F>(&self, f: F)
    where
        F: Fn(&ServiceData) + Send + Sync + 'static,
    {
        if let Some(discovery) = self.discovery.lock().unwrap().as_ref() {
            discovery.on_discovered(f);
        }
    }

    pub fn on_disappeared<F>(&self, f: F)
    where
        F: Fn(&ServiceData) + Send + Sync + 'static,
    {
        if let Some(discovery) = self.discovery.lock().unwrap().as_ref() {
            discovery.on_disappeared(f);
        }
    }

    pub fn on_connected_changed<F>(&self, f: F)
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.engine.on_connected_changed(f);
    }

    pub fn on_error<F>(&self, f: F)
    where
        F: Fn(&ComponentError) + Send + Sync + 'static,
    {
        self.engine.on_error(f);
    }

    /// Idempotent; initiates connection using the URIs set via
    /// `set_halrcmd_uri`/`set_halrcomp_uri` (spec.md §6).
    pub fn ready(&self) -> Result<()> {
        let uris = self.uris.lock().unwrap();
        let halrcmd = uris.halrcmd.as_deref().ok_or(Error::NotReady)?;
        let halrcomp = uris.halrcomp.as_deref().ok_or(Error::NotReady)?;
        self.engine.start(halrcmd, halrcomp)
    }

    pub fn wait_connected(&self, timeout: Option<Duration>) -> bool {
        self.engine.wait_connected(timeout)
    }

    pub fn is_connected(&self) -> bool {
        self.engine.is_connected()
    }

    /// Idempotent.
    pub fn stop(&self) {
        self.engine.stop();
        if let Some(discovery) = self.discovery.lock().unwrap().as_ref() {
            discovery.stop();
        }
    }
}

fn apply_discovered(uris: &Mutex<Uris>, data: &ServiceData) {
    let Some(dsn) = &data.dsn else { return };
    let Some(service) = &data.service_type else { return };
    let mut guard = uris.lock().unwrap();
    match service.as_str() {
        "halrcmd" => guard.halrcmd = Some(dsn.clone()),
        "halrcomp" => guard.halrcomp = Some(dsn.clone()),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newpin_rejects_duplicate_names() {
        let c = RemoteComponent::new("anddemo").unwrap();
        c.newpin("button0", PinType::Bit, PinDirection::Out).unwrap();
        assert!(matches!(c.newpin("button0", PinType::Bit, PinDirection::Out), Err(Error::DuplicatePin(_))));
    }

    #[test]
    fn ready_without_uris_is_not_ready() {
        let c = RemoteComponent::new("anddemo").unwrap();
        assert!(matches!(c.ready(), Err(Error::NotReady)));
    }

    #[test]
    fn set_and_get_round_trip_regardless_of_connection_state() {
        let c = RemoteComponent::new("anddemo").unwrap();
        c.newpin("button0", PinType::Bit, PinDirection::Out).unwrap();
        c.set("button0", PinValue::Bit(true)).unwrap();
        assert_eq!(c.get("button0").unwrap(), PinValue::Bit(true));
    }

    #[test]
    fn get_on_unknown_pin_is_a_lookup_error() {
        let c = RemoteComponent::new("anddemo").unwrap();
        assert!(matches!(c.get("nope"), Err(Error::UnknownPin(_))));
    }
}
