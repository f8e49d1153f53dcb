//! Transport-agnostic seams between the [`crate::hub::Hub`] and whatever
//! carries bytes to peripherals (UDP/NetSIO or a serial line) and to the
//! emulator host (TCP custom-device channel).
//!
//! The hub talks to both sides entirely through these traits; `udp.rs` and
//! `serial.rs` are the only modules that know about sockets, and
//! `host/*.rs` is the only module that knows about the custom-device wire.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::codec::NetSioMsg;
use crate::hub::Hub;

/// A transport that moves [`NetSioMsg`] events to and from NetSIO
/// peripherals — implemented by [`crate::udp::UdpBackend`] and
/// [`crate::serial::SerialBackend`].
pub trait PeripheralBackend: Send + Sync {
    /// Start whatever background threads the backend needs, feeding decoded
    /// events into `hub`. Returns once those threads are spawned; does not
    /// block for the transport's lifetime.
    fn start(self: Arc<Self>, hub: Arc<Hub>) -> Result<()>;

    /// Stop all background threads and release the transport.
    fn stop(&self);

    /// Send `msg` to every connected peripheral.
    fn send_to_all(&self, msg: NetSioMsg);

    /// Whether at least one peripheral is currently registered.
    fn connected(&self) -> bool;

    /// Re-credit every registered client whose credit has dropped to zero.
    /// `host_queue_len` is the current depth of the hub's host-bound queue,
    /// used to compute the new credit value (`DEFAULT_CREDIT - host_queue_len`).
    fn credit_clients(&self, host_queue_len: usize);

    /// How long a synchronous request should wait for this transport's
    /// response before timing out (100 ms for UDP, 80 ms for serial).
    fn sync_timeout(&self) -> Duration;
}

/// The emulator-facing custom-device channel — implemented by
/// [`crate::host::HostChannel`].
pub trait HostBackend: Send + Sync {
    /// Accept the host connection and run the session/pump threads until
    /// `stop` is called or the connection drops. Blocks the calling thread.
    fn run(&self, hub: Arc<Hub>) -> Result<()>;

    /// Request that `run` return as soon as possible.
    fn stop(&self);
}
