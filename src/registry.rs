//! Device registry: per-client connection state keyed by remote UDP address.
//!
//! The registry is mutated under a single lock; each client's mutable fields
//! (credit, expiration deadline) live behind their own lock so a long-running
//! registry operation never has to hold the membership lock across I/O.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::constants::ALIVE_EXPIRATION;

#[derive(Debug)]
struct ClientState {
    credit: u8,
    expire_at: Instant,
}

/// A single connected (or recently connected) NetSIO peripheral.
#[derive(Debug)]
pub struct DeviceClient {
    pub addr: SocketAddr,
    state: Mutex<ClientState>,
}

impl DeviceClient {
    fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            state: Mutex::new(ClientState { credit: 0, expire_at: Instant::now() + ALIVE_EXPIRATION }),
        }
    }

    pub fn expired(&self) -> bool {
        self.expired_at(Instant::now())
    }

    fn expired_at(&self, now: Instant) -> bool {
        self.state.lock().expect("client mutex poisoned").expire_at < now
    }

    pub fn refresh(&self) {
        self.state.lock().expect("client mutex poisoned").expire_at = Instant::now() + ALIVE_EXPIRATION;
    }

    /// Set credit to `credit` only if current credit is `<= threshold`.
    /// Returns whether the update happened.
    pub fn update_credit(&self, credit: u8, threshold: u8) -> bool {
        let mut state = self.state.lock().expect("client mutex poisoned");
        if state.credit <= threshold {
            state.credit = credit;
            true
        } else {
            false
        }
    }

    pub fn credit(&self) -> u8 {
        self.state.lock().expect("client mutex poisoned").credit
    }
}

/// Registry of connected NetSIO peripherals, keyed by remote address.
#[derive(Debug, Default)]
pub struct Registry {
    clients: Mutex<HashMap<SocketAddr, Arc<DeviceClient>>>,
}

/// Outcome of [`Registry::register`].
pub struct Registration {
    pub client: Arc<DeviceClient>,
    pub reconnect: bool,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `addr`, idempotently. If the client already exists its
    /// expiration is refreshed (a reconnect); otherwise a new entry is
    /// created.
    pub fn register(&self, addr: SocketAddr) -> Registration {
        let mut clients = self.clients.lock().expect("registry mutex poisoned");
        if let Some(existing) = clients.get(&addr) {
            existing.refresh();
            Registration { client: Arc::clone(existing), reconnect: true }
        } else {
            let client = Arc::new(DeviceClient::new(addr));
            clients.insert(addr, Arc::clone(&client));
            Registration { client, reconnect: false }
        }
    }

    pub fn deregister(&self, addr: SocketAddr) -> Option<Arc<DeviceClient>> {
        self.clients.lock().expect("registry mutex poisoned").remove(&addr)
    }

    pub fn get(&self, addr: SocketAddr) -> Option<Arc<DeviceClient>> {
        self.clients.lock().expect("registry mutex poisoned").get(&addr).cloned()
    }

    pub fn len(&self) -> usize {
        self.clients.lock().expect("registry mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every currently registered client, for broadcast.
    pub fn snapshot(&self) -> Vec<Arc<DeviceClient>> {
        self.clients.lock().expect("registry mutex poisoned").values().cloned().collect()
    }

    /// Remove every client whose deadline has passed, returning them so the
    /// caller can emit a disconnect event for each.
    pub fn expire_all(&self) -> Vec<Arc<DeviceClient>> {
        let mut clients = self.clients.lock().expect("registry mutex poisoned");
        let expired_addrs: Vec<SocketAddr> =
            clients.iter().filter(|(_, c)| c.expired()).map(|(addr, _)| *addr).collect();
        expired_addrs.iter().filter_map(|addr| clients.remove(addr)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use std::thread;
    use std::time::Duration;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), port)
    }

    #[test]
    fn test_register_is_idempotent() {
        let registry = Registry::new();
        let first = registry.register(addr(40000));
        assert!(!first.reconnect);
        let second = registry.register(addr(40000));
        assert!(second.reconnect);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_deregister_removes_client() {
        let registry = Registry::new();
        registry.register(addr(40000));
        assert!(registry.deregister(addr(40000)).is_some());
        assert!(registry.is_empty());
        assert!(registry.deregister(addr(40000)).is_none());
    }

    #[test]
    fn test_update_credit_respects_threshold() {
        let registry = Registry::new();
        let reg = registry.register(addr(40000));
        assert!(reg.client.update_credit(3, 0)); // 0 <= 0
        assert_eq!(reg.client.credit(), 3);
        assert!(!reg.client.update_credit(5, 0)); // current credit 3 > 0
        assert_eq!(reg.client.credit(), 3);
        assert!(reg.client.update_credit(5, 10)); // forced via high threshold
        assert_eq!(reg.client.credit(), 5);
    }

    #[test]
    fn test_expire_all_removes_only_expired() {
        let registry = Registry::new();
        let reg = registry.register(addr(40000));
        // Force expiration without waiting the real 30s.
        reg.client.refresh();
        {
            let clients = registry.clients.lock().expect("mutex");
            let client = clients.get(&addr(40000)).expect("client present");
            let mut state = client.state.lock().expect("mutex");
            state.expire_at = Instant::now() - Duration::from_millis(1);
        }
        registry.register(addr(40001));

        let expired = registry.expire_all();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].addr, addr(40000));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_refresh_extends_deadline() {
        let registry = Registry::new();
        let reg = registry.register(addr(40000));
        thread::sleep(Duration::from_millis(5));
        reg.client.refresh();
        assert!(!reg.client.expired());
    }
}
