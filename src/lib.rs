//! Client library for participating as a remote HAL component in a
//! machinetalk-style control fabric.
//!
//! A [`component::RemoteComponent`] publishes named, typed
//! [`pin::Pin`]s to a broker located via mDNS/DNS-SD
//! ([`discovery::ServiceDiscovery`]) and kept in sync by the
//! [`engine::RemoteComponentEngine`] protocol state machine.

pub mod component;
pub mod config;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod heartbeat;
pub mod pin;
pub mod proto;
pub mod registry;
pub mod service_data;
pub mod transport;

pub use component::RemoteComponent;
pub use discovery::ServiceDiscovery;
pub use error::{ComponentError, Error, ErrorKind, Result};
pub use pin::{Pin, PinDirection, PinType, PinValue};
pub use service_data::ServiceData;
