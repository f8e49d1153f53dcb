//! NetSIO-over-serial peripheral backend, for a direct serial connection to
//! a single FujiNet-style device in place of the UDP/NetSIO protocol.
//!
//! The wire here carries raw SIO data bytes only — there is no per-event id
//! prefix and no datagram boundary, so a run of bytes is coalesced the same
//! way the UDP backend coalesces DATA_BYTE. Everything that isn't data
//! (COMMAND_ON/OFF, speed changes) is conveyed out of band via UART control
//! lines and baud rate instead of wire bytes. A dedicated reader thread and
//! writer thread share the port, pausing each other briefly whenever the
//! line configuration needs to change.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serialport::SerialPort;

use crate::backend::PeripheralBackend;
use crate::coalesce::CoalescingBuffer;
use crate::codec::{id, NetSioMsg};
use crate::constants::{
    SERIAL_BAUD_ADJUSTMENT, SERIAL_ERROR_COOLDOWN, SERIAL_ERROR_COOLDOWN_THRESHOLD, SERIAL_SYNC_TIMEOUT,
};
use crate::hub::Hub;
use crate::queue::BoundedQueue;

/// Which UART line the emulator's COMMAND_ON/OFF signal drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandLine {
    Rts,
    Dtr,
}

impl Default for CommandLine {
    fn default() -> Self {
        Self::Rts
    }
}

/// Which UART line the peripheral's PROCEED_ON/OFF signal is read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProceedLine {
    Cts,
    Dsr,
}

impl Default for ProceedLine {
    fn default() -> Self {
        Self::Cts
    }
}

/// Coordination point between the reader and writer threads: either side
/// may need to reconfigure the port (baud rate change, command line toggle)
/// and must briefly own it exclusively while doing so.
#[derive(Default)]
struct PortGate {
    paused_readers: Mutex<u32>,
    cv: Condvar,
}

impl PortGate {
    fn pause_for_reconfigure(&self) {
        let mut count = self.paused_readers.lock().expect("gate mutex poisoned");
        *count += 1;
        self.cv.notify_all();
    }

    fn resume_after_reconfigure(&self) {
        let mut count = self.paused_readers.lock().expect("gate mutex poisoned");
        *count = count.saturating_sub(1);
        self.cv.notify_all();
    }

    /// Block while a reconfigure is in progress. The reader calls this
    /// before every read attempt so it yields the port promptly instead of
    /// racing the writer back onto it.
    fn wait_while_paused(&self) {
        let mut count = self.paused_readers.lock().expect("gate mutex poisoned");
        while *count > 0 {
            count = self.cv.wait(count).expect("gate mutex poisoned");
        }
    }
}

pub struct SerialBackend {
    port: Mutex<Box<dyn SerialPort>>,
    gate: Arc<PortGate>,
    command_line: CommandLine,
    proceed_line: ProceedLine,
    connected: AtomicBool,
    running: AtomicBool,
    consecutive_errors: AtomicU32,
    queue: Arc<BoundedQueue<NetSioMsg>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for SerialBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialBackend")
            .field("connected", &self.connected.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl SerialBackend {
    pub fn open(
        path: &str,
        baud: u32,
        command_line: CommandLine,
        proceed_line: ProceedLine,
    ) -> Result<Arc<Self>> {
        let adjusted = (f64::from(baud) * SERIAL_BAUD_ADJUSTMENT).round() as u32;
        let port = serialport::new(path, adjusted)
            .timeout(Duration::from_millis(50))
            .open()
            .with_context(|| format!("opening serial port {path} at {adjusted} baud"))?;

        Ok(Arc::new(Self {
            port: Mutex::new(port),
            gate: Arc::new(PortGate::default()),
            command_line,
            proceed_line,
            connected: AtomicBool::new(true),
            running: AtomicBool::new(false),
            consecutive_errors: AtomicU32::new(0),
            queue: Arc::new(BoundedQueue::new(crate::constants::PERIPHERAL_QUEUE_CAPACITY)),
            threads: Mutex::new(Vec::new()),
        }))
    }

    fn reader_loop(self: &Arc<Self>, hub: Arc<Hub>) {
        let coalesce = {
            let hub_for_sink = Arc::clone(&hub);
            CoalescingBuffer::new(move |msg| hub_for_sink.handle_device_msg(msg, None))
        };

        let mut byte = [0u8; 1];
        while self.running.load(Ordering::Acquire) {
            self.gate.wait_while_paused();
            let read_result = {
                let mut port = self.port.lock().expect("port mutex poisoned");
                port.read_exact(&mut byte)
            };

            match read_result {
                Ok(()) => {
                    self.consecutive_errors.store(0, Ordering::Relaxed);
                    coalesce.extend(&byte);
                }
                Err(err) if err.kind() == std::io::ErrorKind::TimedOut => {
                    coalesce.flush();
                }
                Err(err) => {
                    let errors = self.consecutive_errors.fetch_add(1, Ordering::Relaxed) + 1;
                    warn!("serial read error: {err}");
                    if errors >= SERIAL_ERROR_COOLDOWN_THRESHOLD {
                        thread::sleep(SERIAL_ERROR_COOLDOWN);
                        self.consecutive_errors.store(0, Ordering::Relaxed);
                    }
                }
            }
        }
        coalesce.stop();
    }

    fn writer_loop(self: &Arc<Self>, hub: Arc<Hub>) {
        let _ = &hub;
        while self.running.load(Ordering::Acquire) {
            let Some(msg) = self.queue.pop_timeout(Duration::from_millis(200)) else {
                continue;
            };
            self.write_event(&msg);
        }
    }

    fn write_event(&self, msg: &NetSioMsg) {
        match msg.id {
            id::COMMAND_ON | id::COMMAND_OFF => {
                self.set_command_line(msg.id == id::COMMAND_ON);
            }
            id::SPEED_CHANGE => {
                self.reconfigure_baud(msg.arg.as_slice());
            }
            _ => {
                let mut port = self.port.lock().expect("port mutex poisoned");
                if let Err(err) = port.write_all(&msg.arg) {
                    warn!("serial write error: {err}");
                }
            }
        }
    }

    fn set_command_line(&self, asserted: bool) {
        self.gate.pause_for_reconfigure();
        {
            let mut port = self.port.lock().expect("port mutex poisoned");
            let result = match self.command_line {
                CommandLine::Rts => port.write_request_to_send(asserted),
                CommandLine::Dtr => port.write_data_terminal_ready(asserted),
            };
            if let Err(err) = result {
                warn!("failed to set command line: {err}");
            }
        }
        self.gate.resume_after_reconfigure();
    }

    fn reconfigure_baud(&self, arg: &[u8]) {
        if arg.len() < 4 {
            return;
        }
        let raw = u32::from_le_bytes([arg[0], arg[1], arg[2], arg[3]]);
        let adjusted = (f64::from(raw) * SERIAL_BAUD_ADJUSTMENT).round() as u32;
        self.gate.pause_for_reconfigure();
        {
            let mut port = self.port.lock().expect("port mutex poisoned");
            if let Err(err) = port.set_baud_rate(adjusted) {
                warn!("failed to set baud rate to {adjusted}: {err}");
            } else {
                debug!("baud rate changed to {adjusted}");
            }
        }
        self.gate.resume_after_reconfigure();
    }

    fn poll_proceed_line(&self) -> bool {
        let mut port = self.port.lock().expect("port mutex poisoned");
        let result = match self.proceed_line {
            ProceedLine::Cts => port.read_clear_to_send(),
            ProceedLine::Dsr => port.read_data_set_ready(),
        };
        result.unwrap_or(false)
    }
}

impl PeripheralBackend for SerialBackend {
    fn start(self: Arc<Self>, hub: Arc<Hub>) -> Result<()> {
        self.running.store(true, Ordering::Release);

        let reader_self = Arc::clone(&self);
        let reader_hub = Arc::clone(&hub);
        let reader = thread::spawn(move || reader_self.reader_loop(reader_hub));

        let writer_self = Arc::clone(&self);
        let writer_hub = Arc::clone(&hub);
        let writer = thread::spawn(move || writer_self.writer_loop(writer_hub));

        *self.threads.lock().expect("threads mutex poisoned") = vec![reader, writer];
        info!("serial backend started");
        Ok(())
    }

    fn stop(&self) {
        self.running.store(false, Ordering::Release);
        self.queue.clear();
        for handle in self.threads.lock().expect("threads mutex poisoned").drain(..) {
            let _ = handle.join();
        }
    }

    fn send_to_all(&self, msg: NetSioMsg) {
        if matches!(msg.id, id::COLD_RESET | id::WARM_RESET) {
            self.queue.clear();
        }
        self.queue.push(msg);
    }

    fn connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn credit_clients(&self, _host_queue_len: usize) {
        // A direct serial line has exactly one peripheral and no credit
        // protocol; presence is tracked by `connected` alone.
        let _ = self.poll_proceed_line();
    }

    fn sync_timeout(&self) -> Duration {
        SERIAL_SYNC_TIMEOUT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_line_and_proceed_line_are_distinct_defaults() {
        assert_ne!(
            matches!(CommandLine::Rts, CommandLine::Rts),
            matches!(CommandLine::Dtr, CommandLine::Rts)
        );
        assert_ne!(
            matches!(ProceedLine::Cts, ProceedLine::Cts),
            matches!(ProceedLine::Dsr, ProceedLine::Cts)
        );
    }

    #[test]
    fn test_port_gate_tracks_pause_count() {
        let gate = PortGate::default();
        gate.pause_for_reconfigure();
        gate.pause_for_reconfigure();
        assert_eq!(*gate.paused_readers.lock().expect("mutex"), 2);
        gate.resume_after_reconfigure();
        assert_eq!(*gate.paused_readers.lock().expect("mutex"), 1);
    }

    #[test]
    fn test_wait_while_paused_blocks_until_fully_resumed() {
        let gate = Arc::new(PortGate::default());
        gate.pause_for_reconfigure();
        gate.pause_for_reconfigure();

        let waiter_gate = Arc::clone(&gate);
        let waiter = thread::spawn(move || waiter_gate.wait_while_paused());

        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());

        gate.resume_after_reconfigure();
        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());

        gate.resume_after_reconfigure();
        waiter.join().expect("waiter thread panicked");
    }
}
