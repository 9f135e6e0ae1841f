//! Client process bookkeeping: registration, keepalives, liveness.
//!
//! The broker learns about clients through the control socket (REGISTER)
//! and declares them dead when the socket closes, the keepalive goes
//! silent, or the pid stops existing. Dead clients get their ports reaped
//! through the discovery engine, which synthesizes the STOP_OFFER/UNSUB
//! traffic they can no longer send.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// One registered client process.
#[derive(Debug)]
pub struct ClientInfo {
    pub name: String,
    pub last_seen: Instant,
}

/// Registry of live client processes, keyed by pid. Owned by the broker's
/// main loop; updates arrive as control events.
#[derive(Default)]
pub struct ClientRegistry {
    clients: HashMap<u32, ClientInfo>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, pid: u32, name: String) {
        log::info!("client '{name}' registered (pid {pid})");
        self.clients.insert(
            pid,
            ClientInfo {
                name,
                last_seen: Instant::now(),
            },
        );
    }

    pub fn keepalive(&mut self, pid: u32) {
        if let Some(client) = self.clients.get_mut(&pid) {
            client.last_seen = Instant::now();
        }
    }

    /// Remove a client that deregistered or whose socket closed.
    /// Returns whether it was known.
    pub fn remove(&mut self, pid: u32) -> bool {
        if let Some(client) = self.clients.remove(&pid) {
            log::info!("client '{}' gone (pid {pid})", client.name);
            true
        } else {
            false
        }
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Pids whose keepalive went silent or whose process vanished.
    pub fn stale_clients(&self, timeout: Duration) -> Vec<u32> {
        let now = Instant::now();
        self.clients
            .iter()
            .filter(|(pid, info)| {
                now.duration_since(info.last_seen) > timeout || !process_exists(**pid)
            })
            .map(|(pid, _)| *pid)
            .collect()
    }
}

/// Probe whether a process exists (signal 0).
pub fn process_exists(pid: u32) -> bool {
    // SAFETY: kill with signal 0 performs no action, only an existence and
    // permission check.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_process_exists() {
        assert!(process_exists(std::process::id()));
        assert!(!process_exists(u32::MAX - 1), "absurd pid should not exist");
    }

    #[test]
    fn stale_detection() {
        let mut reg = ClientRegistry::new();
        reg.register(std::process::id(), "self".to_string());
        assert!(reg.stale_clients(Duration::from_secs(60)).is_empty());

        // Shrink the timeout to zero: the client is immediately stale.
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(
            reg.stale_clients(Duration::ZERO),
            vec![std::process::id()]
        );
    }

    #[test]
    fn dead_pid_is_stale_even_with_fresh_keepalive() {
        let mut reg = ClientRegistry::new();
        reg.register(u32::MAX - 1, "ghost".to_string());
        reg.keepalive(u32::MAX - 1);
        assert_eq!(
            reg.stale_clients(Duration::from_secs(3600)),
            vec![u32::MAX - 1]
        );
    }
}
