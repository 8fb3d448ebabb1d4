use anyhow::{Context, Result};
use local_ip_address::local_ip;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::onboard::Onboarding;
use crate::peer::{PeerAddress, PeerId};
use crate::transport::ProtocolBook;

pub const SERVICE_TYPE: &str = "_datapeer._udp.local.";

pub struct Discovery {
    daemon: ServiceDaemon,
    registered_service: Option<String>, // Stores fullname of registered service
}

impl Discovery {
    pub fn new() -> Result<Self> {
        let daemon = ServiceDaemon::new().context("failed to create mDNS daemon")?;
        Ok(Self {
            daemon,
            registered_service: None,
        })
    }

    /// Announces this node, its port and the protocols it speaks.
    pub fn register(&mut self, peer_id: &PeerId, port: u16, protocols: &[String]) -> Result<()> {
        if let Some(fullname) = &self.registered_service {
            tracing::info!("Unregistering old service: {}", fullname);
            let _ = self.daemon.unregister(fullname);
        }

        let ip = local_ip().context("failed to determine local ip")?;
        let m_hostname = format!("{}.local.", peer_id);
        let protocols_json = serde_json::to_string(protocols).unwrap_or_else(|_| "[]".to_string());

        let properties = [
            ("version", env!("CARGO_PKG_VERSION")),
            ("id", peer_id.as_str()),
            ("protocols", protocols_json.as_str()),
        ];

        let service_info = ServiceInfo::new(
            SERVICE_TYPE,
            peer_id.as_str(),
            &m_hostname,
            &ip.to_string(),
            port,
            &properties[..],
        )
        .context("invalid mDNS service info")?;

        let fullname = service_info.get_fullname().to_string();
        self.daemon
            .register(service_info)
            .context("failed to register mDNS service")?;
        tracing::info!(peer = %peer_id, %ip, port, "registered mDNS service");

        self.registered_service = Some(fullname);
        Ok(())
    }

    pub fn browse(&self) -> Result<mdns_sd::Receiver<ServiceEvent>> {
        self.daemon
            .browse(SERVICE_TYPE)
            .context("failed to browse for peers")
    }
}

impl Drop for Discovery {
    fn drop(&mut self) {
        if let Some(fullname) = &self.registered_service {
            tracing::info!("Unregistering service: {}", fullname);
            if let Err(e) = self.daemon.unregister(fullname) {
                tracing::error!("Failed to unregister service: {}", e);
            }
            // Give the daemon time to send the goodbye packet before it shuts down.
            std::thread::sleep(std::time::Duration::from_millis(300));
        }
    }
}

/// Parse the `protocols` TXT property (a JSON array).
pub fn parse_protocols(raw: Option<&str>) -> Vec<String> {
    raw.and_then(|s| serde_json::from_str::<Vec<String>>(s).ok())
        .unwrap_or_default()
}

/// Entry point the discovery notifier calls for every sighting.
///
/// Never blocks: events are queued and each one is onboarded on its own task.
#[derive(Clone)]
pub struct DiscoveryAdapter {
    tx: mpsc::UnboundedSender<PeerAddress>,
}

impl DiscoveryAdapter {
    pub fn on_peer_found(&self, peer: PeerAddress) {
        if let Err(e) = self.tx.send(peer) {
            tracing::warn!(peer = %e.0.id, "discovery worker gone, dropping peer-found event");
        }
    }
}

pub(crate) fn spawn_workers(onboarding: Arc<Onboarding>) -> (DiscoveryAdapter, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<PeerAddress>();
    let handle = tokio::spawn(async move {
        while let Some(peer) = rx.recv().await {
            let onboarding = onboarding.clone();
            tokio::spawn(async move {
                onboarding.onboard(peer).await;
            });
        }
    });
    (DiscoveryAdapter { tx }, handle)
}

/// Feeds resolved mDNS services into `adapter`, skipping our own announcement.
pub fn spawn_mdns_notifier(
    receiver: mdns_sd::Receiver<ServiceEvent>,
    local_id: PeerId,
    protocols: Arc<ProtocolBook>,
    adapter: DiscoveryAdapter,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Ok(event) = receiver.recv_async().await {
            match event {
                ServiceEvent::ServiceResolved(info) => {
                    let Some(id) = info.get_property_val_str("id").map(PeerId::from) else {
                        tracing::debug!(service = %info.get_fullname(), "service without id");
                        continue;
                    };
                    if id == local_id {
                        continue;
                    }

                    let port = info.get_port();
                    let mut addrs: Vec<SocketAddr> = info
                        .get_addresses()
                        .iter()
                        .filter_map(|ip| ip.to_string().parse::<IpAddr>().ok())
                        .map(|ip| SocketAddr::new(ip, port))
                        .collect();
                    addrs.sort();
                    if addrs.is_empty() {
                        continue;
                    }

                    let advertised = parse_protocols(info.get_property_val_str("protocols"));
                    tracing::debug!(peer = %id, ?addrs, protocols = ?advertised, "discovered peer");
                    protocols.record(&id, advertised);
                    adapter.on_peer_found(PeerAddress { id, addrs });
                }
                ServiceEvent::ServiceRemoved(_ty, fullname) => {
                    tracing::debug!(service = %fullname, "peer service removed");
                }
                _ => {}
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_protocols() {
        assert_eq!(
            parse_protocols(Some(r#"["/datapeer/0.1.0","/x/1"]"#)),
            vec!["/datapeer/0.1.0".to_string(), "/x/1".to_string()]
        );
        assert!(parse_protocols(Some("not json")).is_empty());
        assert!(parse_protocols(None).is_empty());
    }
}
