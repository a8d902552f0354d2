//! Recently used servers.
//!
//! The store is an explicit collaborator handed to the auto-connect policy
//! at construction; persistence backends live outside the core. The bundled
//! implementation keeps a bounded in-memory list.

use parking_lot::Mutex;
use std::time::SystemTime;

use crate::discovery::ServerInfo;

/// Maximum entries a store needs to retain.
pub const MAX_RECENT_SERVERS: usize = 10;

/// One remembered server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecentServer {
    // ---
    pub server: ServerInfo,
    pub last_seen: SystemTime,
}

/// Storage for the recent-servers list.
pub trait RecentServersStore: Send + Sync {
    // ---
    /// Returns entries most-recent first.
    fn load(&self) -> Vec<RecentServer>;

    /// Records a connection to `server` at `seen`.
    fn add(&self, server: &ServerInfo, seen: SystemTime);
}

/// Bounded in-memory recent-servers list, most-recent first.
#[derive(Default)]
pub struct MemoryRecentServers {
    // ---
    entries: Mutex<Vec<RecentServer>>,
}

impl MemoryRecentServers {
    // ---
    pub fn new() -> Self {
        // ---
        Self::default()
    }
}

impl RecentServersStore for MemoryRecentServers {
    // ---
    fn load(&self) -> Vec<RecentServer> {
        // ---
        self.entries.lock().clone()
    }

    fn add(&self, server: &ServerInfo, seen: SystemTime) {
        // ---
        let mut entries = self.entries.lock();

        entries.retain(|entry| entry.server.address != server.address);
        entries.insert(
            0,
            RecentServer {
                server: server.clone(),
                last_seen: seen,
            },
        );
        entries.truncate(MAX_RECENT_SERVERS);
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn server(address: &str) -> ServerInfo {
        ServerInfo {
            name: format!("{address}._sendspin-server._tcp.local."),
            address: address.to_string(),
            path: "/sendspin".to_string(),
        }
    }

    #[test]
    fn test_most_recent_first() {
        // ---
        let store = MemoryRecentServers::new();

        store.add(&server("10.0.0.1:8927"), SystemTime::UNIX_EPOCH);
        store.add(&server("10.0.0.2:8927"), SystemTime::now());

        let entries = store.load();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].server.address, "10.0.0.2:8927");
    }

    #[test]
    fn test_reconnect_moves_to_front_without_duplicates() {
        // ---
        let store = MemoryRecentServers::new();

        store.add(&server("10.0.0.1:8927"), SystemTime::UNIX_EPOCH);
        store.add(&server("10.0.0.2:8927"), SystemTime::UNIX_EPOCH);
        store.add(&server("10.0.0.1:8927"), SystemTime::now());

        let entries = store.load();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].server.address, "10.0.0.1:8927");
    }

    #[test]
    fn test_list_is_bounded() {
        // ---
        let store = MemoryRecentServers::new();

        for i in 0..15 {
            store.add(&server(&format!("10.0.0.{i}:8927")), SystemTime::now());
        }

        assert_eq!(store.load().len(), MAX_RECENT_SERVERS);
    }
}
