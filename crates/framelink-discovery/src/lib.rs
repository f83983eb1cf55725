//! mDNS service advertisement and resolution for FrameLink.
//!
//! The server calls [`ServerAdvertiser::register`] at startup so push and
//! play clients on the same subnet can find it without manual IP entry;
//! clients call [`resolve`] with either an instance name or a raw IP.
//!
//! # TXT record keys
//!
//! | Key       | Value                                   |
//! |-----------|-----------------------------------------|
//! | `version` | Protocol version (`"1"`)                |
//! | `data`    | UDP data port (push fragments in)       |
//! | `control` | TCP control port                        |
//! | `relay`   | UDP relay port (play punch target)      |
//! | `host`    | Advertised LAN IP address               |

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tracing::{debug, info, warn};

pub const SERVICE_TYPE: &str = "_framelink._tcp.local.";

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("mDNS daemon failed to start: {0}")]
    DaemonFailed(String),

    #[error("Failed to browse service: {0}")]
    BrowseFailed(String),

    #[error("Failed to register service: {0}")]
    RegisterFailed(String),

    #[error("No server named '{0}' found before timeout")]
    NotFound(String),
}

// ── ServerAdvertiser ──────────────────────────────────────────────────────────

/// Active mDNS advertisement of a FrameLink server. Drop or call
/// [`unregister`](ServerAdvertiser::unregister) to stop.
pub struct ServerAdvertiser {
    daemon: ServiceDaemon,
    fullname: String,
}

impl ServerAdvertiser {
    /// Register the server on the local mDNS domain.
    pub fn register(
        instance_name: &str,
        host_ip: IpAddr,
        data_port: u16,
        control_port: u16,
        relay_port: u16,
    ) -> Result<Self, DiscoveryError> {
        let daemon = ServiceDaemon::new().map_err(|e| DiscoveryError::DaemonFailed(e.to_string()))?;

        let raw_host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "framelink-server".to_owned());
        let host = format!("{raw_host}.local.");

        let mut properties = HashMap::new();
        properties.insert("version".to_owned(), "1".to_owned());
        properties.insert("data".to_owned(), data_port.to_string());
        properties.insert("control".to_owned(), control_port.to_string());
        properties.insert("relay".to_owned(), relay_port.to_string());
        properties.insert("host".to_owned(), host_ip.to_string());

        let service = ServiceInfo::new(
            SERVICE_TYPE,
            instance_name,
            &host,
            host_ip,
            control_port,
            Some(properties),
        )
        .map_err(|e| DiscoveryError::RegisterFailed(e.to_string()))?;

        let fullname = service.get_fullname().to_owned();
        daemon
            .register(service)
            .map_err(|e| DiscoveryError::RegisterFailed(e.to_string()))?;

        info!(
            "[mDNS] Advertising '{}' at {} (control={})",
            instance_name, host_ip, control_port
        );
        Ok(Self { daemon, fullname })
    }

    /// Remove the advertisement.
    pub fn unregister(self) {
        if let Err(e) = self.daemon.unregister(&self.fullname) {
            warn!("[mDNS] Failed to unregister '{}': {}", self.fullname, e);
        } else {
            info!("[mDNS] Advertisement '{}' removed.", self.fullname);
        }
    }
}

// ── Resolution ────────────────────────────────────────────────────────────────

/// Resolve a server by instance/host name, browsing for up to `timeout`.
///
/// A literal IPv4 address short-circuits the browse — handy for setups
/// where mDNS is filtered.
pub async fn resolve(name: &str, timeout: Duration) -> Result<IpAddr, DiscoveryError> {
    if let Ok(ip) = name.parse::<IpAddr>() {
        return Ok(ip);
    }

    let daemon = ServiceDaemon::new().map_err(|e| DiscoveryError::DaemonFailed(e.to_string()))?;
    let receiver = daemon
        .browse(SERVICE_TYPE)
        .map_err(|e| DiscoveryError::BrowseFailed(e.to_string()))?;

    let deadline = tokio::time::Instant::now() + timeout;
    let found = loop {
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .ok_or_else(|| DiscoveryError::NotFound(name.to_owned()))?;
        let event = tokio::time::timeout(remaining, receiver.recv_async())
            .await
            .map_err(|_| DiscoveryError::NotFound(name.to_owned()))?;

        match event {
            Ok(ServiceEvent::ServiceResolved(info)) => {
                debug!("[mDNS] Resolved {}", info.get_fullname());
                let matches = info.get_fullname().starts_with(name)
                    || info.get_hostname().trim_end_matches('.') == name;
                if matches {
                    if let Some(addr) = info.get_addresses().iter().next() {
                        break *addr;
                    }
                }
            }
            Ok(other) => debug!("[mDNS] event: {:?}", other),
            Err(_) => return Err(DiscoveryError::NotFound(name.to_owned())),
        }
    };

    let _ = daemon.shutdown();
    Ok(found)
}

/// Detect the primary LAN IPv4 address by probing an external socket.
///
/// No packets are actually sent — this just queries the OS routing table.
pub fn detect_local_ip() -> IpAddr {
    std::net::UdpSocket::bind("0.0.0.0:0")
        .and_then(|s| {
            s.connect("8.8.8.8:80")?;
            s.local_addr()
        })
        .map(|a| a.ip())
        .unwrap_or_else(|_| IpAddr::V4(std::net::Ipv4Addr::new(127, 0, 0, 1)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn literal_ip_short_circuits_browse() {
        let ip = resolve("192.168.1.50", Duration::from_millis(1))
            .await
            .unwrap();
        assert_eq!(ip, "192.168.1.50".parse::<IpAddr>().unwrap());
    }
}
