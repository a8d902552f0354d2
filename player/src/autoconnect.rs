//! Auto-connect policy.
//!
//! Bridges discovery events to the session: the first server found while in
//! AUTO mode is connected automatically, exactly once. Any manual action
//! moves the policy to MANUAL and discovery stops driving connections.
//! Reconnection after a transport loss belongs to the session alone; a lost
//! mDNS announcement never makes the policy jump to a different server.

use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, info};

use crate::discovery::{DiscoveryEvent, ServerInfo};
use crate::recent_servers::RecentServersStore;
use crate::session::SessionHandle;

/// Narrow seam to the session so the policy can be tested without a network.
pub trait SessionControl {
    // ---
    fn connect(&self, url: &str);
    fn disconnect(&self);
}

impl SessionControl for SessionHandle {
    // ---
    fn connect(&self, url: &str) {
        // ---
        SessionHandle::connect(self, url);
    }

    fn disconnect(&self) {
        // ---
        SessionHandle::disconnect(self);
    }
}

/// Whether connections are chosen by discovery or by the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectMode {
    Auto,
    Manual,
}

/// Decides which server the session talks to.
pub struct AutoConnectPolicy<C: SessionControl> {
    // ---
    session: C,
    recent: Arc<dyn RecentServersStore>,
    mode: ConnectMode,
    has_auto_connected: bool,
}

impl<C: SessionControl> AutoConnectPolicy<C> {
    // ---
    /// Creates a policy in AUTO mode.
    pub fn new(session: C, recent: Arc<dyn RecentServersStore>) -> Self {
        // ---
        Self {
            session,
            recent,
            mode: ConnectMode::Auto,
            has_auto_connected: false,
        }
    }

    /// Feeds one discovery event through the policy.
    pub fn on_event(&mut self, event: DiscoveryEvent) {
        // ---
        match event {
            DiscoveryEvent::Discovered(server) => self.on_discovered(&server),
            DiscoveryEvent::Lost(name) => self.on_lost(&name),
        }
    }

    /// First discovery in AUTO mode connects; everything else is ignored.
    pub fn on_discovered(&mut self, server: &ServerInfo) {
        // ---
        if self.mode != ConnectMode::Auto || self.has_auto_connected {
            debug!("ignoring discovered server {} ({:?})", server.name, self.mode);
            return;
        }

        info!("auto-connecting to {}", server.name);
        self.has_auto_connected = true;
        self.session.connect(&server.url());
        self.recent.add(server, SystemTime::now());
    }

    /// A lost announcement never changes the active connection; the
    /// session's own reconnect logic handles outages.
    pub fn on_lost(&mut self, name: &str) {
        // ---
        debug!("server {} disappeared from discovery", name);
    }

    /// Connects to a user-chosen server and pins the policy to MANUAL.
    pub fn connect_manually(&mut self, server: &ServerInfo) {
        // ---
        self.mode = ConnectMode::Manual;
        self.session.disconnect();
        self.session.connect(&server.url());
        self.recent.add(server, SystemTime::now());
    }

    /// User-requested disconnect; pins the policy to MANUAL so discovery
    /// does not immediately reconnect.
    pub fn disconnect(&mut self) {
        // ---
        self.mode = ConnectMode::Manual;
        self.session.disconnect();
    }

    /// Current mode.
    pub fn mode(&self) -> ConnectMode {
        // ---
        self.mode
    }
}
