//! Automatic server discovery via mDNS.
//!
//! Browses for `_sendspin-server._tcp.` services and resolves each into a
//! connectable [`ServerInfo`]. The mdns-sd daemon runs its own threads; this
//! adapter bridges its events onto a tokio channel for the auto-connect
//! policy.

use mdns_sd::{ServiceDaemon, ServiceEvent};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::PlayerError;

/// Service type announced by Sendspin servers.
pub const SERVICE_TYPE: &str = "_sendspin-server._tcp.local.";

/// TXT record key carrying the WebSocket path.
const PATH_TXT_KEY: &str = "path";

/// Default WebSocket path when the TXT record omits one.
const DEFAULT_PATH: &str = "/sendspin";

/// A discovered (or manually entered) server endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    // ---
    /// Service instance name (also the key for loss events).
    pub name: String,

    /// `host:port` of the WebSocket endpoint.
    pub address: String,

    /// WebSocket path, with leading slash.
    pub path: String,
}

impl ServerInfo {
    // ---
    /// The connectable WebSocket URL for this server.
    pub fn url(&self) -> String {
        // ---
        format!("ws://{}{}", self.address, self.path)
    }
}

/// Discovery events delivered to the auto-connect policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    Discovered(ServerInfo),
    Lost(String),
}

/// Bridges the platform mDNS browser onto an async event stream.
pub struct DiscoveryAdapter {
    // ---
    daemon: ServiceDaemon,
    rx: mpsc::UnboundedReceiver<DiscoveryEvent>,
}

impl DiscoveryAdapter {
    // ---
    /// Starts browsing for Sendspin servers.
    ///
    /// # Errors
    ///
    /// Returns error if the mDNS daemon cannot start or the browse request
    /// is refused.
    pub fn start() -> Result<Self, PlayerError> {
        // ---
        let daemon = ServiceDaemon::new()
            .map_err(|e| PlayerError::Transport(format!("mDNS daemon failed to start: {e}")))?;

        let events = daemon
            .browse(SERVICE_TYPE)
            .map_err(|e| PlayerError::Transport(format!("mDNS browse failed: {e}")))?;

        info!("browsing for {}", SERVICE_TYPE);

        let (tx, rx) = mpsc::unbounded_channel();

        // The mdns-sd receiver blocks, so it gets its own thread.
        std::thread::Builder::new()
            .name("sendspin-mdns".to_string())
            .spawn(move || {
                while let Ok(event) = events.recv() {
                    match event {
                        ServiceEvent::ServiceResolved(service) => {
                            let Some(address) = service.get_addresses().iter().next() else {
                                warn!(
                                    "resolved service {} has no address",
                                    service.get_fullname()
                                );
                                continue;
                            };

                            let path = service
                                .get_property_val_str(PATH_TXT_KEY)
                                .unwrap_or(DEFAULT_PATH)
                                .to_string();

                            let server = ServerInfo {
                                name: service.get_fullname().to_string(),
                                address: format!("{}:{}", address, service.get_port()),
                                path,
                            };

                            debug!("discovered {} at {}", server.name, server.address);
                            if tx.send(DiscoveryEvent::Discovered(server)).is_err() {
                                break;
                            }
                        }
                        ServiceEvent::ServiceRemoved(_, fullname) => {
                            debug!("lost {}", fullname);
                            if tx.send(DiscoveryEvent::Lost(fullname)).is_err() {
                                break;
                            }
                        }
                        _ => {}
                    }
                }
                debug!("mDNS bridge terminated");
            })
            .map_err(|e| PlayerError::Transport(format!("failed to spawn mDNS bridge: {e}")))?;

        Ok(Self { daemon, rx })
    }

    /// Next discovery event; `None` once the browser shut down.
    pub async fn recv(&mut self) -> Option<DiscoveryEvent> {
        // ---
        self.rx.recv().await
    }

    /// Stops browsing and shuts the daemon down.
    pub fn shutdown(self) {
        // ---
        if let Err(e) = self.daemon.shutdown() {
            warn!("mDNS shutdown failed: {}", e);
        }
    }
}
