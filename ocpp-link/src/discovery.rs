//! Central system discovery
//!
//! A charging station without a fixed address asks a [`Discovery`] for
//! candidate hosts and tries them in order. Central systems can announce
//! themselves over mDNS as `_ocpp._tcp.local.`.

use std::collections::HashMap;
use std::future::Future;
use std::net::IpAddr;
use std::time::Duration;

use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// mDNS service type for OCPP central systems
pub const SERVICE_TYPE: &str = "_ocpp._tcp.local.";

/// Candidate used when nothing else is found
pub const FALLBACK_HOST: &str = "localhost";

/// Source of candidate central system hosts
pub trait Discovery: Send + Sync + 'static {
    /// Candidate hosts, best first; never empty
    fn discover(&self) -> impl Future<Output = Vec<String>> + Send;
}

/// Keep the first occurrence of each host, fall back to localhost when empty
fn candidates(hosts: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut seen = Vec::new();
    for host in hosts {
        if !host.is_empty() && !seen.contains(&host) {
            seen.push(host);
        }
    }

    if seen.is_empty() {
        seen.push(FALLBACK_HOST.to_string());
    }
    seen
}

/// Fixed list of hosts
#[derive(Debug, Clone)]
pub struct StaticDiscovery {
    hosts: Vec<String>,
}

impl StaticDiscovery {
    pub fn new(hosts: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            hosts: hosts.into_iter().map(Into::into).collect(),
        }
    }
}

impl Discovery for StaticDiscovery {
    async fn discover(&self) -> Vec<String> {
        candidates(self.hosts.iter().cloned())
    }
}

/// Browses for announced central systems
pub struct MdnsDiscovery {
    daemon: ServiceDaemon,
    window: Duration,
}

impl MdnsDiscovery {
    pub fn new() -> Result<Self, mdns_sd::Error> {
        Ok(Self {
            daemon: ServiceDaemon::new()?,
            window: Duration::from_secs(3),
        })
    }

    /// How long each `discover()` listens for answers
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }
}

impl Discovery for MdnsDiscovery {
    async fn discover(&self) -> Vec<String> {
        let receiver = match self.daemon.browse(SERVICE_TYPE) {
            Ok(receiver) => receiver,
            Err(e) => {
                warn!("mDNS: browse failed: {}", e);
                return candidates(None);
            }
        };

        let deadline = Instant::now() + self.window;
        let mut found = Vec::new();

        loop {
            match tokio::time::timeout_at(deadline, receiver.recv_async()).await {
                Ok(Ok(ServiceEvent::ServiceResolved(info))) => {
                    let mut addresses: Vec<IpAddr> = info.get_addresses().iter().copied().collect();
                    // IPv4 first
                    addresses.sort_by_key(|a| !a.is_ipv4());

                    for addr in addresses {
                        info!("mDNS: Discovered {} at {}", info.get_fullname(), addr);
                        found.push(addr.to_string());
                    }
                }
                Ok(Ok(event)) => debug!("mDNS: {:?}", event),
                Ok(Err(e)) => {
                    warn!("mDNS browse error: {}", e);
                    break;
                }
                Err(_) => break,
            }
        }

        if let Err(e) = self.daemon.stop_browse(SERVICE_TYPE) {
            debug!("mDNS: stop browse: {}", e);
        }

        if found.is_empty() {
            info!("mDNS: No central system found, trying {}", FALLBACK_HOST);
        }
        candidates(found)
    }
}

impl Drop for MdnsDiscovery {
    fn drop(&mut self) {
        let _ = self.daemon.shutdown();
    }
}

/// mDNS registration of a central system; withdrawn on drop
pub struct MdnsAnnouncement {
    daemon: ServiceDaemon,
    fullname: String,
}

impl MdnsAnnouncement {
    /// Announce `instance` listening on `port`
    pub fn announce(instance: &str, port: u16) -> Result<Self, mdns_sd::Error> {
        let daemon = ServiceDaemon::new()?;
        let host = format!("{}.local.", instance);

        let mut properties = HashMap::new();
        properties.insert("subprotocol".to_string(), crate::rpc::OCPP_SUBPROTOCOL.to_string());
        properties.insert("version".to_string(), env!("CARGO_PKG_VERSION").to_string());

        let service_info = ServiceInfo::new(SERVICE_TYPE, instance, &host, (), port, properties)?
            .enable_addr_auto();
        let fullname = service_info.get_fullname().to_string();

        daemon.register(service_info)?;
        info!("mDNS: Announcing {} on {} port {}", instance, SERVICE_TYPE, port);

        Ok(Self { daemon, fullname })
    }
}

impl Drop for MdnsAnnouncement {
    fn drop(&mut self) {
        if self.daemon.unregister(&self.fullname).is_err() {
            debug!("mDNS: {} already unregistered", self.fullname);
        }
        let _ = self.daemon.shutdown();
    }
}
