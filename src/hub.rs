//! The hub: wires the host channel to a peripheral backend, and owns the
//! synchronous request/response rendezvous used by script-call SIO commands.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use log::{debug, trace};

use crate::backend::PeripheralBackend;
use crate::codec::id;
use crate::codec::NetSioMsg;
use crate::queue::BoundedQueue;
use crate::registry::DeviceClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncOutcome {
    Idle,
    Pending,
    Answered,
}

/// Rendezvous for a single in-flight synchronous request. Only one request
/// may be outstanding at a time, matching the original's single in-flight
/// sync call.
struct SyncSlotState {
    seq: u8,
    outcome: SyncOutcome,
    response: i32,
}

pub struct SyncSlot {
    state: Mutex<SyncSlotState>,
    cv: Condvar,
    next_seq: AtomicU8,
}

impl SyncSlot {
    fn new() -> Self {
        Self {
            state: Mutex::new(SyncSlotState { seq: 0, outcome: SyncOutcome::Idle, response: id::ATDEV_EMPTY_SYNC }),
            cv: Condvar::new(),
            next_seq: AtomicU8::new(0),
        }
    }

    fn next_seq(&self) -> u8 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    fn arm(&self, seq: u8) {
        let mut state = self.state.lock().expect("sync slot mutex poisoned");
        state.seq = seq;
        state.outcome = SyncOutcome::Pending;
    }

    fn is_pending(&self, seq: u8) -> bool {
        let state = self.state.lock().expect("sync slot mutex poisoned");
        state.outcome == SyncOutcome::Pending && state.seq == seq
    }

    fn has_pending(&self) -> bool {
        self.state.lock().expect("sync slot mutex poisoned").outcome == SyncOutcome::Pending
    }

    /// Deliver the packed response for `seq`. Returns whether it matched the
    /// currently armed request.
    fn resolve(&self, seq: u8, response: i32) -> bool {
        let mut state = self.state.lock().expect("sync slot mutex poisoned");
        if state.outcome != SyncOutcome::Pending || state.seq != seq {
            return false;
        }
        state.outcome = SyncOutcome::Answered;
        state.response = response;
        self.cv.notify_all();
        true
    }

    fn wait(&self, timeout: Duration) -> i32 {
        let mut state = self.state.lock().expect("sync slot mutex poisoned");
        let deadline = Instant::now() + timeout;
        while state.outcome == SyncOutcome::Pending {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let (next, result) = self.cv.wait_timeout(state, remaining).expect("sync slot mutex poisoned");
            state = next;
            if result.timed_out() && state.outcome == SyncOutcome::Pending {
                break;
            }
        }
        let response = if state.outcome == SyncOutcome::Answered { state.response } else { id::ATDEV_EMPTY_SYNC };
        state.outcome = SyncOutcome::Idle;
        response
    }
}

/// Central coordinator between the host channel and a peripheral backend.
pub struct Hub {
    peripheral: Arc<dyn PeripheralBackend>,
    host_queue: Arc<BoundedQueue<NetSioMsg>>,
    host_connected: AtomicBool,
    sync: SyncSlot,
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("host_connected", &self.host_connected.load(Ordering::Relaxed))
            .field("host_queue_len", &self.host_queue.len())
            .finish_non_exhaustive()
    }
}

impl Hub {
    pub fn new(peripheral: Arc<dyn PeripheralBackend>, host_queue: Arc<BoundedQueue<NetSioMsg>>) -> Arc<Self> {
        Arc::new(Self { peripheral, host_queue, host_connected: AtomicBool::new(false), sync: SyncSlot::new() })
    }

    pub fn host_queue(&self) -> &Arc<BoundedQueue<NetSioMsg>> {
        &self.host_queue
    }

    pub fn peripheral(&self) -> &Arc<dyn PeripheralBackend> {
        &self.peripheral
    }

    pub fn host_connect(&self) {
        self.host_connected.store(true, Ordering::Release);
    }

    pub fn host_disconnect(&self) {
        self.host_connected.store(false, Ordering::Release);
        self.host_queue.clear();
    }

    pub fn host_connected(&self) -> bool {
        self.host_connected.load(Ordering::Acquire)
    }

    /// Fire-and-forget event from the emulator (resets, command/motor state,
    /// a fully-buffered write). Always forwarded to the peripheral backend.
    pub fn handle_host_msg(&self, msg: NetSioMsg) {
        trace!("host -> peripheral: id={:#x} len={}", msg.id, msg.arg.len());
        self.peripheral.send_to_all(msg);
    }

    /// Synchronous request from the emulator. Returns the packed `param2`
    /// value the custom-device ABI expects, or `ATDEV_EMPTY_SYNC` on timeout
    /// or when no peripheral is connected.
    pub fn handle_host_msg_sync(&self, mut msg: NetSioMsg) -> i32 {
        if msg.id == id::DATA_BLOCK {
            self.peripheral.send_to_all(msg);
            return id::ATDEV_EMPTY_SYNC;
        }

        let seq = self.sync.next_seq();
        msg.arg.push(seq);
        self.host_queue.clear();

        if !self.peripheral.connected() {
            return id::ATDEV_EMPTY_SYNC;
        }

        self.sync.arm(seq);
        self.peripheral.send_to_all(msg);

        let response = self.sync.wait(self.peripheral.sync_timeout());
        if response == id::ATDEV_EMPTY_SYNC {
            debug!("sync request seq={seq} timed out or returned empty");
        }
        response
    }

    /// Pack a NETSIO_SYNC_RESPONSE payload (`<sn><kind>[<ack><size_lo><size_hi>]`)
    /// into the custom-device ABI's `param2` layout: low byte
    /// NETSIO_SYNC_RESPONSE, bytes 1..3 the ack/nak byte and 16-bit size.
    fn pack_sync_response(arg: &[u8]) -> i32 {
        let ack_byte = arg.get(2).copied().unwrap_or(0);
        let size_lo = arg.get(3).copied().unwrap_or(0);
        let size_hi = arg.get(4).copied().unwrap_or(0);
        i32::from(id::SYNC_RESPONSE) | (i32::from(ack_byte) << 8) | (i32::from(size_lo) << 16) | (i32::from(size_hi) << 24)
    }

    /// Event arriving from a peripheral. `client` is `None` for events
    /// flushed out of the shared coalescing buffer, which carries no single
    /// client identity.
    pub fn handle_device_msg(&self, msg: NetSioMsg, client: Option<&Arc<DeviceClient>>) {
        if !self.host_connected() {
            trace!("no host attached, dropping peripheral event id={:#x}", msg.id);
            return;
        }
        if let Some(client) = client {
            client.refresh();
        }

        if msg.id == id::SYNC_RESPONSE {
            self.handle_sync_response(&msg);
            return;
        }

        if self.sync.has_pending() && matches!(msg.id, id::DATA_BYTE | id::DATA_BLOCK) {
            trace!("dropping data event while a sync request is in flight");
            return;
        }

        self.host_queue.push(msg);
    }

    fn handle_sync_response(&self, msg: &NetSioMsg) {
        let Some(&seq) = msg.arg.first() else {
            debug!("malformed sync response (no sequence byte), dropping");
            return;
        };
        let kind = msg.arg.get(1).copied().unwrap_or(id::EMPTY_SYNC);

        if self.sync.is_pending(seq) {
            let response = if kind == id::EMPTY_SYNC { id::ATDEV_EMPTY_SYNC } else { Self::pack_sync_response(&msg.arg) };
            self.sync.resolve(seq, response);
            return;
        }

        // No matching in-flight request: the host wasn't waiting for this.
        // If it carries an ACK/NAK byte, don't lose it — rewrite as a plain
        // DATA_BYTE so it still reaches the emulator.
        if kind != id::EMPTY_SYNC {
            if let Some(&ack_byte) = msg.arg.get(2) {
                self.host_queue.push(NetSioMsg::with_byte(id::DATA_BYTE, ack_byte));
                return;
            }
        }
        debug!("stray sync response (seq={seq}), dropping");
    }

    pub fn credit_clients(&self) {
        self.peripheral.credit_clients(self.host_queue.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    struct NullBackend {
        connected: AtomicBool,
        sent: Mutex<Vec<NetSioMsg>>,
    }

    impl PeripheralBackend for NullBackend {
        fn start(self: Arc<Self>, _hub: Arc<Hub>) -> anyhow::Result<()> {
            Ok(())
        }
        fn stop(&self) {}
        fn send_to_all(&self, msg: NetSioMsg) {
            self.sent.lock().expect("mutex").push(msg);
        }
        fn connected(&self) -> bool {
            self.connected.load(Ordering::Relaxed)
        }
        fn credit_clients(&self, _host_queue_len: usize) {}
        fn sync_timeout(&self) -> StdDuration {
            StdDuration::from_millis(30)
        }
    }

    fn hub_with(connected: bool) -> (Arc<Hub>, Arc<NullBackend>) {
        let backend = Arc::new(NullBackend { connected: AtomicBool::new(connected), sent: Mutex::new(Vec::new()) });
        let hub = Hub::new(backend.clone(), Arc::new(BoundedQueue::new(8)));
        hub.host_connect();
        (hub, backend)
    }

    #[test]
    fn test_sync_request_times_out_without_peripheral() {
        let (hub, _backend) = hub_with(false);
        let result = hub.handle_host_msg_sync(NetSioMsg::new(id::COMMAND_OFF_SYNC));
        assert_eq!(result, id::ATDEV_EMPTY_SYNC);
    }

    #[test]
    fn test_sync_request_resolves_from_peripheral_response() {
        let (hub, backend) = hub_with(true);
        let hub2 = Arc::clone(&hub);
        let handle = std::thread::spawn(move || hub2.handle_host_msg_sync(NetSioMsg::new(id::DATA_BYTE_SYNC)));

        let seq = loop {
            let sent = backend.sent.lock().expect("mutex");
            if let Some(msg) = sent.last() {
                break *msg.arg.last().expect("seq appended");
            }
            drop(sent);
            std::thread::sleep(StdDuration::from_millis(1));
        };

        let response = NetSioMsg::with_arg(id::SYNC_RESPONSE, vec![seq, id::ACK_SYNC, 0x41, 0, 0]);
        hub.handle_device_msg(response, None);

        let packed = handle.join().expect("sync thread panicked");
        assert_eq!(packed & 0xFF, i32::from(id::SYNC_RESPONSE));
        assert_eq!((packed >> 8) & 0xFF, 0x41);
    }

    #[test]
    fn test_sync_request_empty_response_yields_empty_sync() {
        let (hub, backend) = hub_with(true);
        let hub2 = Arc::clone(&hub);
        let handle = std::thread::spawn(move || hub2.handle_host_msg_sync(NetSioMsg::new(id::COMMAND_OFF_SYNC)));
        let seq = loop {
            let sent = backend.sent.lock().expect("mutex");
            if let Some(msg) = sent.last() {
                break *msg.arg.last().expect("seq appended");
            }
            drop(sent);
            std::thread::sleep(StdDuration::from_millis(1));
        };
        hub.handle_device_msg(NetSioMsg::with_arg(id::SYNC_RESPONSE, vec![seq, id::EMPTY_SYNC]), None);
        assert_eq!(handle.join().expect("sync thread panicked"), id::ATDEV_EMPTY_SYNC);
    }

    #[test]
    fn test_data_event_dropped_while_sync_in_flight() {
        let (hub, _backend) = hub_with(true);
        let hub2 = Arc::clone(&hub);
        let handle = std::thread::spawn(move || hub2.handle_host_msg_sync(NetSioMsg::new(id::COMMAND_OFF_SYNC)));
        std::thread::sleep(StdDuration::from_millis(5));
        hub.handle_device_msg(NetSioMsg::with_byte(id::DATA_BYTE, 0x99), None);
        assert!(hub.host_queue().is_empty());
        let _ = handle.join();
    }

    #[test]
    fn test_handle_device_msg_enqueues_to_host_queue() {
        let (hub, _backend) = hub_with(true);
        hub.handle_device_msg(NetSioMsg::with_byte(id::DATA_BYTE, 0x42), None);
        assert_eq!(hub.host_queue().len(), 1);
    }

    #[test]
    fn test_host_disconnect_clears_queue_and_drops_future_events() {
        let (hub, _backend) = hub_with(true);
        hub.host_queue().push(NetSioMsg::new(id::DATA_BYTE));
        hub.host_disconnect();
        assert!(hub.host_queue().is_empty());
        hub.handle_device_msg(NetSioMsg::new(id::DATA_BYTE), None);
        assert!(hub.host_queue().is_empty());
    }
}
