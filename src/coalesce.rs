//! Single-byte-to-block coalescing buffer.
//!
//! One instance lives per UDP transport (not per client — see Open Question
//! 3 in `DESIGN.md`). `extend` appends incoming DATA_BYTE payloads; once 130
//! bytes accumulate, or 5 ms pass since the last extend, the buffer flushes
//! upstream as a single DATA_BLOCK (or DATA_BYTE, for a lone byte). Any other
//! inbound event must call `flush` first so per-device ordering holds.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crate::codec::{id, NetSioMsg};
use crate::constants::{COALESCE_BUFFER_MAX_AGE, COALESCE_BUFFER_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerState {
    Idle,
    Armed,
    Stopped,
}

struct Shared {
    data: Mutex<Vec<u8>>,
    timer: Mutex<(TimerState, Instant)>,
    cv: Condvar,
    emit: Box<dyn Fn(NetSioMsg) + Send + Sync>,
}

impl Shared {
    fn flush(&self) {
        let bytes = {
            let mut data = self.data.lock().expect("buffer mutex poisoned");
            if data.is_empty() {
                return;
            }
            std::mem::take(&mut *data)
        };
        let msg = if bytes.len() == 1 {
            NetSioMsg::with_arg(id::DATA_BYTE, bytes)
        } else {
            NetSioMsg::with_arg(id::DATA_BLOCK, bytes)
        };
        (self.emit)(msg);
    }
}

/// Aggregates single SIO bytes into blocks, flushing by size or by age.
pub struct CoalescingBuffer {
    shared: Arc<Shared>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for CoalescingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoalescingBuffer").finish_non_exhaustive()
    }
}

impl CoalescingBuffer {
    /// `emit` is called with the flushed event (DATA_BYTE or DATA_BLOCK).
    pub fn new(emit: impl Fn(NetSioMsg) + Send + Sync + 'static) -> Arc<Self> {
        let shared = Arc::new(Shared {
            data: Mutex::new(Vec::new()),
            timer: Mutex::new((TimerState::Idle, Instant::now())),
            cv: Condvar::new(),
            emit: Box::new(emit),
        });

        let monitor_shared = Arc::clone(&shared);
        let handle = thread::spawn(move || Self::run_monitor(&monitor_shared));

        Arc::new(Self { shared, monitor: Mutex::new(Some(handle)) })
    }

    fn run_monitor(shared: &Arc<Shared>) {
        loop {
            let mut guard = shared.timer.lock().expect("timer mutex poisoned");
            loop {
                match guard.0 {
                    TimerState::Stopped => return,
                    TimerState::Idle => {
                        guard = shared.cv.wait(guard).expect("timer mutex poisoned");
                    }
                    TimerState::Armed => {
                        let deadline = guard.1;
                        let now = Instant::now();
                        if now >= deadline {
                            guard.0 = TimerState::Idle;
                            drop(guard);
                            shared.flush();
                            break;
                        }
                        let (next_guard, timeout) = shared
                            .cv
                            .wait_timeout(guard, deadline - now)
                            .expect("timer mutex poisoned");
                        guard = next_guard;
                        if timeout.timed_out()
                            && guard.0 == TimerState::Armed
                            && guard.1 <= Instant::now()
                        {
                            guard.0 = TimerState::Idle;
                            drop(guard);
                            shared.flush();
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Append bytes from a DATA_BYTE event. Flushes immediately if the
    /// buffer has reached [`COALESCE_BUFFER_SIZE`], otherwise (re)arms the
    /// age-based timer.
    pub fn extend(&self, bytes: &[u8]) {
        let len = {
            let mut data = self.shared.data.lock().expect("buffer mutex poisoned");
            data.extend_from_slice(bytes);
            data.len()
        };
        if len >= COALESCE_BUFFER_SIZE {
            self.cancel_timer();
            self.shared.flush();
        } else {
            self.arm_timer();
        }
    }

    /// Flush whatever is buffered right now. Every inbound event other than
    /// DATA_BYTE must call this first, to preserve wire ordering.
    pub fn flush(&self) {
        self.cancel_timer();
        self.shared.flush();
    }

    fn arm_timer(&self) {
        let mut guard = self.shared.timer.lock().expect("timer mutex poisoned");
        if guard.0 == TimerState::Stopped {
            return;
        }
        guard.0 = TimerState::Armed;
        guard.1 = Instant::now() + COALESCE_BUFFER_MAX_AGE;
        self.shared.cv.notify_all();
    }

    fn cancel_timer(&self) {
        let mut guard = self.shared.timer.lock().expect("timer mutex poisoned");
        if guard.0 == TimerState::Armed {
            guard.0 = TimerState::Idle;
        }
    }

    pub fn stop(&self) {
        {
            let mut guard = self.shared.timer.lock().expect("timer mutex poisoned");
            guard.0 = TimerState::Stopped;
            self.shared.cv.notify_all();
        }
        if let Some(handle) = self.monitor.lock().expect("monitor mutex poisoned").take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    fn buffer_with_sink() -> (Arc<CoalescingBuffer>, mpsc::Receiver<NetSioMsg>) {
        let (tx, rx) = mpsc::channel();
        let buffer = CoalescingBuffer::new(move |msg| {
            let _ = tx.send(msg);
        });
        (buffer, rx)
    }

    #[test]
    fn test_flush_on_size_threshold() {
        let (buffer, rx) = buffer_with_sink();
        let bytes = vec![0x41u8; COALESCE_BUFFER_SIZE];
        buffer.extend(&bytes);
        let msg = rx.recv_timeout(Duration::from_millis(200)).expect("flush expected");
        assert_eq!(msg.id, id::DATA_BLOCK);
        assert_eq!(msg.arg.len(), COALESCE_BUFFER_SIZE);
        buffer.stop();
    }

    #[test]
    fn test_flush_on_age_single_byte_is_data_byte() {
        let (buffer, rx) = buffer_with_sink();
        buffer.extend(&[0x41]);
        let msg = rx.recv_timeout(Duration::from_millis(200)).expect("flush expected");
        assert_eq!(msg.id, id::DATA_BYTE);
        assert_eq!(msg.arg, vec![0x41]);
        buffer.stop();
    }

    #[test]
    fn test_flush_on_age_multi_byte_is_data_block() {
        let (buffer, rx) = buffer_with_sink();
        buffer.extend(&[0x41]);
        buffer.extend(&[0x42]);
        buffer.extend(&[0x43]);
        buffer.extend(&[0x44]);
        let msg = rx.recv_timeout(Duration::from_millis(200)).expect("flush expected");
        assert_eq!(msg.id, id::DATA_BLOCK);
        assert_eq!(msg.arg, vec![0x41, 0x42, 0x43, 0x44]);
        buffer.stop();
    }

    #[test]
    fn test_manual_flush_emits_partial_buffer_immediately() {
        let (buffer, rx) = buffer_with_sink();
        buffer.extend(&[0x41, 0x42]);
        buffer.flush();
        let msg = rx.recv_timeout(Duration::from_millis(50)).expect("flush expected");
        assert_eq!(msg.arg, vec![0x41, 0x42]);
        buffer.stop();
    }

    #[test]
    fn test_flush_on_empty_buffer_emits_nothing() {
        let (buffer, rx) = buffer_with_sink();
        buffer.flush();
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        buffer.stop();
    }

    #[test]
    fn test_stop_is_idempotent() {
        let (buffer, _rx) = buffer_with_sink();
        buffer.stop();
        buffer.stop();
    }
}
