//! Host custom-device channel: TCP session with the emulator plus the
//! outbound pump that drains the hub's host-bound queue.

mod conn;
mod pump;
mod session;

pub use conn::HostConn;
pub use session::HostSession;

use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use log::{info, warn};

use crate::backend::HostBackend;
use crate::hub::Hub;
use pump::HostPump;

/// Binary ready-to-receive signal shared between the session (which clears
/// it before a payload send and sets it on `ATDEV_READY`) and the outbound
/// pump (which waits on it before every send).
pub struct ReadyGate {
    ready: Mutex<bool>,
    cv: Condvar,
}

impl ReadyGate {
    fn new() -> Arc<Self> {
        Arc::new(Self { ready: Mutex::new(true), cv: Condvar::new() })
    }

    pub fn clear(&self) {
        *self.ready.lock().expect("ready gate mutex poisoned") = false;
    }

    pub fn set(&self) {
        *self.ready.lock().expect("ready gate mutex poisoned") = true;
        self.cv.notify_all();
    }

    /// Wait up to `timeout` for the flag to be set. Returns whether it was
    /// observed set before the deadline.
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut guard = self.ready.lock().expect("ready gate mutex poisoned");
        let deadline = Instant::now() + timeout;
        while !*guard {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let (next, result) = self.cv.wait_timeout(guard, remaining).expect("ready gate mutex poisoned");
            guard = next;
            if result.timed_out() && !*guard {
                return false;
            }
        }
        true
    }
}

/// The emulator-facing custom-device TCP channel.
pub struct HostChannel {
    listener: TcpListener,
    running: AtomicBool,
}

impl std::fmt::Debug for HostChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostChannel").finish_non_exhaustive()
    }
}

impl HostChannel {
    pub fn bind(port: u16) -> Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", port))
            .with_context(|| format!("binding custom-device TCP listener on port {port}"))?;
        listener.set_nonblocking(true).context("setting listener nonblocking")?;
        Ok(Self { listener, running: AtomicBool::new(false) })
    }
}

impl HostBackend for HostChannel {
    fn run(&self, hub: Arc<Hub>) -> Result<()> {
        self.running.store(true, Ordering::Release);
        info!("custom-device channel listening");

        while self.running.load(Ordering::Acquire) {
            let (stream, peer) = match self.listener.accept() {
                Ok(pair) => pair,
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(200));
                    continue;
                }
                Err(err) => {
                    warn!("accept failed: {err}");
                    continue;
                }
            };
            stream.set_nonblocking(false).context("setting accepted stream blocking")?;
            info!("emulator connected from {peer} at {}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"));

            let read_stream = stream.try_clone().context("cloning host stream for reads")?;
            let conn = HostConn::new(stream);
            let ready = ReadyGate::new();

            let pump = HostPump::new(Arc::clone(&conn), Arc::clone(&ready), Arc::clone(&hub));
            let pump_handle = thread::spawn(move || pump.run());

            let session = HostSession::new(read_stream, conn, Arc::clone(&ready), Arc::clone(&hub));
            if let Err(err) = session.run() {
                warn!("host session ended: {err:#}");
            }

            hub.host_disconnect();
            let _ = pump_handle.join();
            info!("emulator disconnected");
        }

        Ok(())
    }

    fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }
}
