//! Two asynchronous message sockets over ZeroMQ (spec.md §4.B).
//!
//! `CommandChannel` is a `DEALER` socket (bidirectional, identity-tagged);
//! `SubscriptionChannel` is a `SUB` socket (receive-only, topic filtered).
//! Both are driven from one dedicated I/O worker thread
//! ([`crate::engine::RemoteComponentEngine`]) using [`Poller`] so that
//! shutdown can be observed within the 200 ms deadline spec.md §5 calls for.

use std::time::Duration;

use crate::error::{Error, Result};

const POLL_TIMEOUT: Duration = Duration::from_millis(200);

/// Bidirectional command channel (`HALRCMD`): `PING`/`HALRCOMP_BIND`/
/// `HALRCOMP_SET` out, `PING_ACKNOWLEDGE`/`HALRCOMP_BIND_CONFIRM`/
/// `HALRCOMP_BIND_REJECT`/`HALRCOMP_SET_REJECT` in.
pub struct CommandChannel {
    socket: zmq::Socket,
    uri: Option<String>,
}

impl CommandChannel {
    pub fn new(ctx: &zmq::Context, identity: &str) -> Result<Self> {
        let socket = ctx.socket(zmq::DEALER)?;
        socket.set_linger(0)?;
        socket.set_identity(identity.as_bytes())?;
        Ok(CommandChannel { socket, uri: None })
    }

    pub fn connect(&mut self, uri: &str) -> Result<()> {
        self.socket.connect(uri)?;
        self.uri = Some(uri.to_string());
        Ok(())
    }

    pub fn disconnect(&mut self) -> Result<()> {
        if let Some(uri) = self.uri.take() {
            // The peer may already be gone (e.g. broker restart); a
            // disconnect failure here is not actionable, only logged.
            if let Err(e) = self.socket.disconnect(&uri) {
                log::debug!("command channel disconnect({uri}) failed: {e}");
            }
        }
        Ok(())
    }

    /// Non-blocking send. Backpressure or a missing peer surfaces as
    /// `Error::SendWouldBlock` and never changes engine state directly —
    /// the heartbeat is the liveness signal (spec.md §4.B, §7 "Send
    /// failure").
    pub fn send(&self, bytes: &[u8]) -> Result<()> {
        match self.socket.send(bytes, zmq::DONTWAIT) {
            Ok(()) => Ok(()),
            Err(zmq::Error::EAGAIN) => Err(Error::SendWouldBlock(zmq::Error::EAGAIN)),
            Err(e) => Err(e.into()),
        }
    }

    pub fn recv(&self) -> Result<Vec<u8>> {
        Ok(self.socket.recv_bytes(0)?)
    }

    fn as_poll_item(&self) -> zmq::PollItem<'_> {
        self.socket.as_poll_item(zmq::POLLIN)
    }
}

/// Receive-only subscription channel (`HALRCOMP`): topic-filtered
/// `HALRCOMP_FULL_UPDATE`/`HALRCOMP_INCREMENTAL_UPDATE`/`PING`/
/// `HALRCOMMAND_ERROR`.
pub struct SubscriptionChannel {
    socket: zmq::Socket,
    uri: Option<String>,
}

impl SubscriptionChannel {
    pub fn new(ctx: &zmq::Context) -> Result<Self> {
        let socket = ctx.socket(zmq::SUB)?;
        socket.set_linger(0)?;
        Ok(SubscriptionChannel { socket, uri: None })
    }

    pub fn connect(&mut self, uri: &str) -> Result<()> {
        self.socket.connect(uri)?;
        self.uri = Some(uri.to_string());
        Ok(())
    }

    pub fn disconnect(&mut self) -> Result<()> {
        if let Some(uri) = self.uri.take() {
            if let Err(e) = self.socket.disconnect(&uri) {
                log::debug!("subscription channel disconnect({uri}) failed: {e}");
            }
        }
        Ok(())
    }

    pub fn subscribe(&self, topic: &str) -> Result<()> {
        Ok(self.socket.set_subscribe(topic.as_bytes())?)
    }

    pub fn unsubscribe(&self, topic: &str) -> Result<()> {
        Ok(self.socket.set_unsubscribe(topic.as_bytes())?)
    }

    /// Receive one `[topic, body]` multipart message. Returns
    /// `Error::MalformedMessage` if the peer sent anything other than
    /// exactly two frames (spec.md §4.F: "Each inbound message is a
    /// two-frame multipart").
    pub fn recv_multipart(&self) -> Result<(Vec<u8>, Vec<u8>)> {
        let parts = self.socket.recv_multipart(0)?;
        let mut iter = parts.into_iter();
        let topic = iter
            .next()
            .ok_or_else(|| Error::MalformedMessage("missing topic frame".to_string()))?;
        let body = iter
            .next()
            .ok_or_else(|| Error::MalformedMessage("missing body frame".to_string()))?;
        if iter.next().is_some() {
            return Err(Error::MalformedMessage("more than two frames".to_string()));
        }
        Ok((topic, body))
    }

    fn as_poll_item(&self) -> zmq::PollItem<'_> {
        self.socket.as_poll_item(zmq::POLLIN)
    }
}

/// Which channel(s) are readable after a [`Poller::poll`] call.
#[derive(Debug, Clone, Copy, Default)]
pub struct Readiness {
    pub command_readable: bool,
    pub subscription_readable: bool,
}

/// Polls both sockets with the 200 ms deadline described in spec.md §5 —
/// what gives the I/O worker a chance to observe a shutdown request on
/// every iteration even with no traffic arriving.
pub struct Poller;

impl Poller {
    pub fn poll(cmd: &CommandChannel, sub: &SubscriptionChannel) -> Result<Readiness> {
        let mut items = [cmd.as_poll_item(), sub.as_poll_item()];
        zmq::poll(&mut items, POLL_TIMEOUT.as_millis() as i64)?;
        Ok(Readiness {
            command_readable: items[0].is_readable(),
            subscription_readable: items[1].is_readable(),
        })
    }
}
