//! The protocol engine: two coupled channel state machines driving an
//! aggregate connection state (spec.md §4.F, the heart of the core).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::Duration;

use prost::Message as _;

use crate::config;
use crate::error::{ComponentError, Error, ErrorKind, Result};
use crate::heartbeat::HeartbeatTimer;
use crate::pin::{PinDirection, PinType, PinValue};
use crate::proto::{Comp, Container, ContainerType, WireHalDirection, WireHalType, WirePin};
use crate::registry::PinRegistry;
use crate::transport::{CommandChannel, Poller, SubscriptionChannel};

/// Per-channel connection state (spec.md §4.F).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Down,
    Trying,
    Up,
}

/// Observable aggregate connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateState {
    Disconnected,
    Connecting,
    Timeout,
    Error,
    Connected,
}

type ConnectedObserver = Box<dyn Fn(bool) + Send + Sync>;
type ErrorObserver = Box<dyn Fn(&ComponentError) + Send + Sync>;

/// Drives bind → subscribe → steady-state for one remote component.
///
/// Owns both transport channels, both heartbeat timers, the transmit lock,
/// and the two coupled state machines. The public API
/// ([`crate::component::RemoteComponent`]) is a thin front door onto this.
pub struct RemoteComponentEngine {
    name: String,
    registry: Arc<PinRegistry>,
    no_create: AtomicBool,

    cmd: Mutex<CommandChannel>,
    sub: Mutex<SubscriptionChannel>,
    subscribed: AtomicBool,

    cmd_heartbeat: Mutex<Option<HeartbeatTimer>>,
    sub_watchdog: Mutex<Option<HeartbeatTimer>>,
    watchdog_period_ms: AtomicU64,

    halrcmd_state: Mutex<ChannelState>,
    halrcomp_state: Mutex<ChannelState>,
    aggregate: Mutex<AggregateState>,
    aggregate_cond: Condvar,

    ping_outstanding: AtomicBool,

    /// Guards "build + send" as one atomic step (spec.md §5's transmit
    /// lock). Innermost lock: never held while acquiring a pin or state
    /// lock.
    tx_lock: Mutex<()>,

    change_tx: Sender<String>,
    change_rx: Mutex<Option<Receiver<String>>>,

    shutdown: Arc<AtomicBool>,
    worker: Mutex<Option<thread::JoinHandle<Receiver<String>>>>,
    is_ready: AtomicBool,

    on_connected_changed: Mutex<Vec<ConnectedObserver>>,
    on_error: Mutex<Vec<ErrorObserver>>,
}

impl RemoteComponentEngine {
    pub fn new(name: impl Into<String>, registry: Arc<PinRegistry>) -> Result<Arc<Self>> {
        let name = name.into();
        let ctx = zmq::Context::new();
        let identity = config::command_identity();
        let cmd = CommandChannel::new(&ctx, &identity)?;
        let sub = SubscriptionChannel::new(&ctx)?;
        let (change_tx, change_rx) = mpsc::channel();

        let engine = Arc::new(RemoteComponentEngine {
            name,
            registry,
            no_create: AtomicBool::new(false),
            cmd: Mutex::new(cmd),
            sub: Mutex::new(sub),
            subscribed: AtomicBool::new(false),
            cmd_heartbeat: Mutex::new(None),
            sub_watchdog: Mutex::new(None),
            watchdog_period_ms: AtomicU64::new(0),
            halrcmd_state: Mutex::new(ChannelState::Down),
            halrcomp_state: Mutex::new(ChannelState::Down),
            aggregate: Mutex::new(AggregateState::Disconnected),
            aggregate_cond: Condvar::new(),
            ping_outstanding: AtomicBool::new(false),
            tx_lock: Mutex::new(()),
            change_tx,
            change_rx: Mutex::new(Some(change_rx)),
            shutdown: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
            is_ready: AtomicBool::new(false),
            on_connected_changed: Mutex::new(Vec::new()),
            on_error: Mutex::new(Vec::new()),
        });

        let cmd_hb_weak = Arc::downgrade(&engine);
        *engine.cmd_heartbeat.lock().unwrap() = Some(HeartbeatTimer::new("cmd", move || {
            if let Some(engine) = cmd_hb_weak.upgrade() {
                engine.on_command_heartbeat();
            }
        }));

        let sub_wd_weak: Weak<RemoteComponentEngine> = Arc::downgrade(&engine);
        *engine.sub_watchdog.lock().unwrap() = Some(HeartbeatTimer::new("sub", move || {
            if let Some(engine) = sub_wd_weak.upgrade() {
                engine.on_subscription_watchdog();
            }
        }));

        Ok(engine)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_no_create(&self, flag: bool) {
        self.no_create.store(flag, Ordering::SeqCst);
    }

    /// Clone to hand to newly declared pins, so `Pin::set` can notify this
    /// engine without holding a reference back to it (spec.md §9 "Pin
    /// back-pointer to component").
    pub fn change_sender(&self) -> Sender<String> {
        self.change_tx.clone()
    }

    pub fn is_connected(&self) -> bool {
        *self.aggregate.lock().unwrap() == AggregateState::Connected
    }

    pub fn on_connected_changed<F>(&self, f: F)
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.on_connected_changed.lock().unwrap().push(Box::new(f));
    }

    pub fn on_error<F>(&self, f: F)
    where
        F: Fn(&ComponentError) + Send + Sync + 'static,
    {
        self.on_error.lock().unwrap().push(Box::new(f));
    }

    /// `wait_connected(None)` blocks indefinitely; `Some(Duration::ZERO)`
    /// returns the current state without blocking (spec.md §8 boundary
    /// behavior).
    pub fn wait_connected(&self, timeout: Option<Duration>) -> bool {
        let guard = self.aggregate.lock().unwrap();
        match timeout {
            None => {
                let guard = self
                    .aggregate_cond
                    .wait_while(guard, |s| *s != AggregateState::Connected)
                    .unwrap();
                *guard == AggregateState::Connected
            }
            Some(d) if d.is_zero() => *guard == AggregateState::Connected,
            Some(d) => {
                let (guard, _) = self
                    .aggregate_cond
                    .wait_timeout_while(guard, d, |s| *s != AggregateState::Connected)
                    .unwrap();
                *guard == AggregateState::Connected
            }
        }
    }

    /// Startup sequence (spec.md §4.F). Idempotent: a second call while
    /// already ready is a no-op.
    pub fn start(self: &Arc<Self>, halrcmd_uri: &str, halrcomp_uri: &str) -> Result<()> {
        if self.is_ready.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown.store(false, Ordering::SeqCst);

        *self.halrcmd_state.lock().unwrap() = ChannelState::Trying;
        self.set_aggregate(AggregateState::Connecting);

        self.cmd.lock().unwrap().connect(halrcmd_uri)?;
        self.sub.lock().unwrap().connect(halrcomp_uri)?;

        let change_rx = self
            .change_rx
            .lock()
            .unwrap()
            .take()
            .expect("engine already running");
        let worker_engine = Arc::clone(self);
        let shutdown = Arc::clone(&self.shutdown);
        let handle = thread::Builder::new()
            .name(format!("hal-remote-engine-{}", self.name))
            .spawn(move || worker_engine.run_worker(shutdown, change_rx))
            .expect("failed to spawn protocol engine thread");
        *self.worker.lock().unwrap() = Some(handle);

        if let Some(hb) = self.cmd_heartbeat.lock().unwrap().as_ref() {
            hb.arm(config::DEFAULT_COMMAND_HEARTBEAT);
        }
        self.ping_outstanding.store(true, Ordering::SeqCst);
        self.send_ping()?;

        Ok(())
    }

    /// Shutdown (spec.md §4.F). Idempotent.
    pub fn stop(&self) {
        if !self.is_ready.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shutdown.store(true, Ordering::SeqCst);

        if let Some(handle) = self.worker.lock().unwrap().take() {
            match handle.join() {
                Ok(rx) => *self.change_rx.lock().unwrap() = Some(rx),
                Err(_) => log::warn!("protocol engine worker thread for '{}' panicked", self.name),
            }
        }

        if self.subscribed.swap(false, Ordering::SeqCst) {
            let sub = self.sub.lock().unwrap();
            let _ = sub.unsubscribe(&self.name);
        }
        if let Some(hb) = self.cmd_heartbeat.lock().unwrap().as_ref() {
            hb.cancel();
        }
        if let Some(wd) = self.sub_watchdog.lock().unwrap().as_ref() {
            wd.cancel();
        }
        {
            let mut cmd = self.cmd.lock().unwrap();
            let _ = cmd.disconnect();
        }
        {
            let mut sub = self.sub.lock().unwrap();
            let _ = sub.disconnect();
        }

        *self.halrcmd_state.lock().unwrap() = ChannelState::Down;
        *self.halrcomp_state.lock().unwrap() = ChannelState::Down;
        self.ping_outstanding.store(false, Ordering::SeqCst);
        self.watchdog_period_ms.store(0, Ordering::SeqCst);
        self.set_aggregate(AggregateState::Disconnected);
    }

    fn run_worker(self: Arc<Self>, shutdown: Arc<AtomicBool>, change_rx: Receiver<String>) -> Receiver<String> {
        while !shutdown.load(Ordering::SeqCst) {
            let readiness = {
                let cmd = self.cmd.lock().unwrap();
                let sub = self.sub.lock().unwrap();
                match Poller::poll(&cmd, &sub) {
                    Ok(r) => r,
                    Err(e) => {
                        log::warn!("socket poll failed: {e}");
                        continue;
                    }
                }
            };

            if readiness.command_readable {
                self.handle_command_frame();
            }
            if readiness.subscription_readable {
                self.handle_subscription_frame();
            }
            while let Ok(pin_name) = change_rx.try_recv() {
                self.handle_local_pin_change(&pin_name);
            }
        }
        change_rx
    }

    fn handle_command_frame(&self) {
        let bytes = {
            let cmd = self.cmd.lock().unwrap();
            match cmd.recv() {
                Ok(b) => b,
                Err(e) => {
                    log::debug!("command channel recv failed: {e}");
                    return;
                }
            }
        };
        match Container::decode(bytes.as_slice()) {
            Ok(container) => self.dispatch_command(container),
            Err(e) => log::warn!("malformed command-channel message: {e}"),
        }
    }

    fn dispatch_command(&self, container: Container) {
        match container.container_type() {
            ContainerType::PingAcknowledge => {
                self.ping_outstanding.store(false, Ordering::SeqCst);
                let was_trying = *self.halrcmd_state.lock().unwrap() == ChannelState::Trying;
                if was_trying {
                    if let Err(e) = self.send_bind() {
                        log::warn!("failed to send bind request: {e}");
                    }
                }
            }
            ContainerType::HalrcompBindConfirm => {
                *self.halrcmd_state.lock().unwrap() = ChannelState::Up;
                if let Err(e) = self.resubscribe() {
                    log::warn!("resubscribe after bind confirm failed: {e}");
                }
            }
            ContainerType::HalrcompBindReject => {
                *self.halrcmd_state.lock().unwrap() = ChannelState::Down;
                self.set_aggregate(AggregateState::Error);
                self.fire_error(ErrorKind::Bind, container.note.unwrap_or_default());
            }
            ContainerType::HalrcompSetReject => {
                *self.halrcmd_state.lock().unwrap() = ChannelState::Down;
                self.set_aggregate(AggregateState::Error);
                self.fire_error(ErrorKind::Pinchange, container.note.unwrap_or_default());
            }
            other => log::debug!("ignoring unsupported command-channel message kind {other:?}"),
        }
    }

    fn handle_subscription_frame(&self) {
        let (topic, body) = {
            let sub = self.sub.lock().unwrap();
            match sub.recv_multipart() {
                Ok(tb) => tb,
                Err(e) => {
                    log::debug!("subscription channel recv failed: {e}");
                    return;
                }
            }
        };
        if topic != self.name.as_bytes() {
            return;
        }
        match Container::decode(body.as_slice()) {
            Ok(container) => self.dispatch_subscription(container),
            Err(e) => log::warn!("malformed subscription-channel message: {e}"),
        }
    }

    fn dispatch_subscription(&self, container: Container) {
        match container.container_type() {
            ContainerType::HalrcompFullUpdate => self.apply_full_update(container),
            ContainerType::HalrcompIncrementalUpdate => self.apply_incremental_update(&container),
            ContainerType::Ping => self.handle_subscription_ping(),
            ContainerType::HalrcommandError => {
                *self.halrcomp_state.lock().unwrap() = ChannelState::Down;
                self.set_aggregate(AggregateState::Error);
                self.fire_error(ErrorKind::Halrcomp, container.note.unwrap_or_default());
            }
            other => log::debug!("ignoring unsupported subscription-channel message kind {other:?}"),
        }
    }

    fn apply_full_update(&self, container: Container) {
        let Some(comp) = container.comp.into_iter().next() else {
            log::warn!("full update for '{}' carried no component entry", self.name);
            return;
        };

        let prefix = format!("{}.", self.name);
        let entries: Vec<(String, u32)> = comp
            .pin
            .iter()
            .filter_map(|w| w.name.as_deref().and_then(|n| n.strip_prefix(prefix.as_str())).map(|local| (local.to_string(), w.handle)))
            .collect();
        self.registry.rebuild_handles(&entries);

        for wire in &comp.pin {
            let Some(local_name) = wire.name.as_deref().and_then(|n| n.strip_prefix(prefix.as_str())) else {
                continue;
            };
            let Some(pin) = self.registry.by_name(local_name) else {
                log::debug!("full update names unknown pin '{local_name}'");
                continue;
            };
            if let Some(value) = decode_payload(pin.pintype(), wire) {
                pin.apply_wire_value(value);
            }
        }

        *self.halrcomp_state.lock().unwrap() = ChannelState::Up;
        if *self.halrcmd_state.lock().unwrap() == ChannelState::Up {
            self.set_aggregate(AggregateState::Connected);
        }

        if let Some(ms) = container.pparams.and_then(|p| p.keepalive_timer) {
            let period_ms = u64::from(ms) * u64::from(config::WATCHDOG_MULTIPLIER);
            self.watchdog_period_ms.store(period_ms, Ordering::SeqCst);
            self.arm_subscription_watchdog(period_ms);
        }
    }

    fn apply_incremental_update(&self, container: &Container) {
        for wire in &container.pin {
            let Some(pin) = self.registry.by_handle(wire.handle) else {
                log::debug!("incremental update for unknown handle {}", wire.handle);
                continue;
            };
            if let Some(value) = decode_payload(pin.pintype(), wire) {
                pin.apply_wire_value(value);
            }
        }
        self.refresh_subscription_watchdog();
    }

    fn handle_subscription_ping(&self) {
        let up = *self.halrcomp_state.lock().unwrap() == ChannelState::Up;
        if up {
            self.refresh_subscription_watchdog();
        } else {
            if let Err(e) = self.resubscribe() {
                log::warn!("resubscribe on keepalive ping failed: {e}");
            }
            self.set_aggregate(AggregateState::Connecting);
        }
    }

    fn refresh_subscription_watchdog(&self) {
        let ms = self.watchdog_period_ms.load(Ordering::SeqCst);
        if ms > 0 {
            self.arm_subscription_watchdog(ms);
        }
    }

    fn arm_subscription_watchdog(&self, period_ms: u64) {
        if let Some(wd) = self.sub_watchdog.lock().unwrap().as_ref() {
            wd.arm(Duration::from_millis(period_ms));
        }
    }

    fn resubscribe(&self) -> Result<()> {
        let sub = self.sub.lock().unwrap();
        sub.unsubscribe(&self.name)?;
        sub.subscribe(&self.name)?;
        self.subscribed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn on_command_heartbeat(&self) {
        if self.ping_outstanding.load(Ordering::SeqCst) {
            *self.halrcmd_state.lock().unwrap() = ChannelState::Trying;
            self.set_aggregate(AggregateState::Timeout);
        }
        self.ping_outstanding.store(true, Ordering::SeqCst);
        if let Err(e) = self.send_ping() {
            log::warn!("failed to send heartbeat ping: {e}");
        }
        if let Some(hb) = self.cmd_heartbeat.lock().unwrap().as_ref() {
            hb.arm(config::DEFAULT_COMMAND_HEARTBEAT);
        }
    }

    fn on_subscription_watchdog(&self) {
        *self.halrcomp_state.lock().unwrap() = ChannelState::Down;
        self.set_aggregate(AggregateState::Timeout);
    }

    fn send_ping(&self) -> Result<()> {
        self.send_command(Container::of_type(ContainerType::Ping))
    }

    fn send_bind(&self) -> Result<()> {
        let pins = self.registry.all();
        let mut comp = Comp {
            name: self.name.clone(),
            no_create: self.no_create.load(Ordering::SeqCst),
            pin: Vec::with_capacity(pins.len()),
        };
        for pin in &pins {
            let mut wire = WirePin::new(pin.handle().unwrap_or(0), wire_type(pin.pintype()));
            wire.name = Some(format!("{}.{}", self.name, pin.name()));
            wire.dir = Some(wire_direction(pin.direction()) as i32);
            set_payload(&mut wire, pin.get());
            comp.pin.push(wire);
        }
        let mut container = Container::of_type(ContainerType::HalrcompBind);
        container.comp.push(comp);
        self.send_command(container)
    }

    /// Outbound pin changes (spec.md §4.F step 3-4): a no-op unless state
    /// is `Connected` and the pin's direction propagates local changes.
    fn handle_local_pin_change(&self, pin_name: &str) {
        let Some(pin) = self.registry.by_name(pin_name) else {
            log::debug!("change notification for unknown pin '{pin_name}'");
            return;
        };
        if !pin.direction().propagates_local_changes() {
            return;
        }
        if *self.aggregate.lock().unwrap() != AggregateState::Connected {
            return;
        }
        let Some(handle) = pin.handle() else {
            log::debug!("pin '{pin_name}' has no broker handle yet, dropping local change");
            return;
        };

        let mut wire = WirePin::new(handle, wire_type(pin.pintype()));
        set_payload(&mut wire, pin.get());
        let mut container = Container::of_type(ContainerType::HalrcompSet);
        container.pin.push(wire);
        if let Err(e) = self.send_command(container) {
            log::warn!("failed to send HALRCOMP_SET for '{pin_name}': {e}");
        }
    }

    /// Build-then-send under the transmit lock; the container itself is
    /// local to each call so there is nothing left to clear afterwards.
    fn send_command(&self, container: Container) -> Result<()> {
        let _guard = self.tx_lock.lock().unwrap();
        let bytes = container.encode_to_vec();
        let cmd = self.cmd.lock().unwrap();
        match cmd.send(&bytes) {
            Ok(()) => Ok(()),
            Err(Error::SendWouldBlock(e)) => {
                log::debug!("command send would block: {e}");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn set_aggregate(&self, new_state: AggregateState) {
        let mut guard = self.aggregate.lock().unwrap();
        if *guard == new_state {
            return;
        }
        let was_connected = *guard == AggregateState::Connected;
        let now_connected = new_state == AggregateState::Connected;
        *guard = new_state;
        drop(guard);
        self.aggregate_cond.notify_all();

        if was_connected && !now_connected {
            for pin in self.registry.all() {
                pin.unsync();
            }
        }
        if was_connected != now_connected {
            for obs in self.on_connected_changed.lock().unwrap().iter() {
                obs(now_connected);
            }
        }
    }

    fn fire_error(&self, kind: ErrorKind, message: String) {
        let error = ComponentError { kind, message };
        log::warn!("{error}");
        for obs in self.on_error.lock().unwrap().iter() {
            obs(&error);
        }
    }
}

fn wire_type(t: PinType) -> i32 {
    match t {
        PinType::Bit => WireHalType::Bit as i32,
        PinType::Float => WireHalType::Float as i32,
        PinType::S32 => WireHalType::S32 as i32,
        PinType::U32 => WireHalType::U32 as i32,
    }
}

fn wire_direction(d: PinDirection) -> WireHalDirection {
    match d {
        PinDirection::In => WireHalDirection::In,
        PinDirection::Out => WireHalDirection::Out,
        PinDirection::Io => WireHalDirection::Io,
    }
}

fn set_payload(wire: &mut WirePin, value: PinValue) {
    match value {
        PinValue::Bit(b) => wire.halbit = Some(b),
        PinValue::Float(f) => wire.halfloat = Some(f),
        PinValue::S32(i) => wire.hals32 = Some(i),
        PinValue::U32(u) => wire.halu32 = Some(u),
    }
}

/// `None` if the wire pin's payload doesn't carry exactly one value field
/// (spec.md §3/§4.A's "exactly one payload field" invariant, enforced here
/// at the proto boundary) or if that field doesn't match `pintype`.
fn decode_payload(pintype: PinType, wire: &WirePin) -> Option<PinValue> {
    if wire.payload_field_count() != 1 {
        log::warn!("wire pin handle {} carries {} payload fields, expected 1", wire.handle, wire.payload_field_count());
        return None;
    }
    match pintype {
        PinType::Bit => wire.halbit.map(PinValue::Bit),
        PinType::Float => wire.halfloat.map(PinValue::Float),
        PinType::S32 => wire.hals32.map(PinValue::S32),
        PinType::U32 => wire.halu32.map(PinValue::U32),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pin::Pin;

    fn test_engine() -> Arc<RemoteComponentEngine> {
        RemoteComponentEngine::new("anddemo", Arc::new(PinRegistry::new())).unwrap()
    }

    #[test]
    fn wire_payload_round_trips_each_type() {
        for t in [PinType::Bit, PinType::S32, PinType::U32, PinType::Float] {
            let mut wire = WirePin::new(1, wire_type(t));
            set_payload(&mut wire, PinValue::zero(t));
            assert_eq!(decode_payload(t, &wire), Some(PinValue::zero(t)));
        }
    }

    #[test]
    fn set_aggregate_fires_connected_observer_exactly_once_per_edge() {
        let engine = test_engine();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_cloned = Arc::clone(&seen);
        engine.on_connected_changed(move |c| seen_cloned.lock().unwrap().push(c));

        engine.set_aggregate(AggregateState::Connecting); // no edge
        engine.set_aggregate(AggregateState::Connected); // false -> true
        engine.set_aggregate(AggregateState::Connected); // no-op
        engine.set_aggregate(AggregateState::Timeout); // true -> false

        assert_eq!(*seen.lock().unwrap(), vec![true, false]);
    }

    #[test]
    fn leaving_connected_unsyncs_every_pin() {
        let engine = test_engine();
        let pin = Arc::new(Pin::new("p".to_string(), PinType::Bit, PinDirection::Out));
        pin.apply_wire_value(PinValue::Bit(true));
        assert!(pin.synced());
        engine.registry.declare(Arc::clone(&pin)).unwrap();

        engine.set_aggregate(AggregateState::Connected);
        engine.set_aggregate(AggregateState::Disconnected);
        assert!(!pin.synced());
    }

    #[test]
    fn local_change_on_in_pin_never_sends() {
        let engine = test_engine();
        let pin = Arc::new(Pin::new("led".to_string(), PinType::Bit, PinDirection::In));
        pin.set_handle(3);
        engine.registry.declare(Arc::clone(&pin)).unwrap();
        engine.set_aggregate(AggregateState::Connected);
        // An IN pin never propagates locally; this must return without
        // attempting a socket send (no peer is connected in this test).
        engine.handle_local_pin_change("led");
    }

    #[test]
    fn wait_connected_zero_timeout_does_not_block() {
        let engine = test_engine();
        assert!(!engine.wait_connected(Some(Duration::ZERO)));
    }
}
