//! DNS-SD advertising and discovery on the local link.
//!
//! One [`Discovery`] wraps one long-lived mDNS daemon. Advertising is
//! idempotent and tied to the sender lifecycle by the caller; browsing
//! accumulates `up`/`down` events over a bounded window and returns a
//! snapshot. Discovery is best-effort throughout: browse failures log
//! and yield whatever was collected.

use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tracing::{debug, info, warn};

use drift_types::EngineError;
use drift_types::config::{PROTOCOL_VERSION, SERVICE_TYPE};

/// A peer seen during a browse window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredService {
    /// Instance name (the peer's advertised display name).
    pub name: String,
    /// mDNS host the record resolved to.
    pub host: String,
    pub addresses: Vec<IpAddr>,
    pub port: u16,
    /// `hostname` TXT key, when the peer published one.
    pub hostname: String,
}

/// Handle for a published advertisement.
#[derive(Debug, Clone)]
pub struct Advertisement {
    fullname: String,
}

/// Long-lived discovery resource around one mDNS daemon.
#[derive(Clone)]
pub struct Discovery {
    inner: Arc<DiscoveryInner>,
}

struct DiscoveryInner {
    daemon: ServiceDaemon,
    published: Mutex<Option<Advertisement>>,
}

impl Discovery {
    pub fn new() -> Result<Self, EngineError> {
        let daemon = ServiceDaemon::new()
            .map_err(|e| EngineError::Io(std::io::Error::other(e)))?;
        Ok(Self {
            inner: Arc::new(DiscoveryInner {
                daemon,
                published: Mutex::new(None),
            }),
        })
    }

    /// Publish this host's service record. Idempotent: a second call
    /// without an intervening [`unpublish`](Self::unpublish) returns
    /// the existing handle.
    pub fn publish(
        &self,
        instance_name: &str,
        port: u16,
        hostname: &str,
    ) -> Result<Advertisement, EngineError> {
        let mut published = self.inner.published.lock().expect("published lock");
        if let Some(existing) = published.as_ref() {
            debug!(fullname = %existing.fullname, "advertisement already live");
            return Ok(existing.clone());
        }

        let props = [("hostname", hostname), ("version", PROTOCOL_VERSION)];
        let info = ServiceInfo::new(
            &service_domain(),
            instance_name,
            &format!("{hostname}.local."),
            "",
            port,
            &props[..],
        )
        .map_err(|e| EngineError::Io(std::io::Error::other(e)))?
        .enable_addr_auto();

        let fullname = info.get_fullname().to_string();
        self.inner
            .daemon
            .register(info)
            .map_err(|e| EngineError::Io(std::io::Error::other(e)))?;

        info!(%fullname, port, "mDNS advertisement published");
        let handle = Advertisement { fullname };
        *published = Some(handle.clone());
        Ok(handle)
    }

    /// Release the current advertisement. Safe to call when nothing
    /// is published and safe during shutdown.
    pub fn unpublish(&self) {
        let handle = self.inner.published.lock().expect("published lock").take();
        if let Some(Advertisement { fullname }) = handle {
            match self.inner.daemon.unregister(&fullname) {
                Ok(_) => info!(%fullname, "mDNS advertisement withdrawn"),
                Err(e) => warn!(%fullname, "failed to withdraw advertisement: {e}"),
            }
        }
    }

    /// Whether an advertisement is currently live.
    pub fn is_published(&self) -> bool {
        self.inner.published.lock().expect("published lock").is_some()
    }

    /// Browse for peers over a bounded window and return the final
    /// set, in first-seen order. Never fails; errors degrade to a
    /// partial (possibly empty) set.
    pub async fn browse(&self, window: Duration) -> Vec<DiscoveredService> {
        let domain = service_domain();
        let events = match self.inner.daemon.browse(&domain) {
            Ok(rx) => rx,
            Err(e) => {
                warn!("mDNS browse failed to start: {e}");
                return Vec::new();
            }
        };

        let deadline = tokio::time::Instant::now() + window;
        let mut peers: Vec<DiscoveredService> = Vec::new();

        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, events.recv_async()).await {
                Ok(Ok(event)) => apply_event(&mut peers, event),
                Ok(Err(e)) => {
                    warn!("mDNS browse channel closed: {e}");
                    break;
                }
                Err(_) => break,
            }
        }

        if let Err(e) = self.inner.daemon.stop_browse(&domain) {
            debug!("stop_browse: {e}");
        }
        peers
    }

    /// Tear the daemon down. Any live advertisement is withdrawn
    /// first.
    pub fn shutdown(&self) {
        self.unpublish();
        let _ = self.inner.daemon.shutdown();
    }
}

/// This machine's host name, used for the instance name and the TXT
/// record.
pub fn host_name() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string())
}

fn service_domain() -> String {
    format!("_{SERVICE_TYPE}._tcp.local.")
}

/// Fold one browse event into the accumulated peer set: resolved
/// peers append (or refresh in place), removals drop by name.
fn apply_event(peers: &mut Vec<DiscoveredService>, event: ServiceEvent) {
    match event {
        ServiceEvent::ServiceResolved(info) => {
            let name = instance_name(info.get_fullname());
            let service = DiscoveredService {
                name: name.clone(),
                host: info.get_hostname().to_string(),
                addresses: {
                    let mut addrs: Vec<IpAddr> = info.get_addresses().iter().copied().collect();
                    addrs.sort();
                    addrs
                },
                port: info.get_port(),
                hostname: info
                    .get_property_val_str("hostname")
                    .unwrap_or_default()
                    .to_string(),
            };
            debug!(name = %service.name, port = service.port, "peer up");
            match peers.iter_mut().find(|p| p.name == name) {
                Some(existing) => *existing = service,
                None => peers.push(service),
            }
        }
        ServiceEvent::ServiceRemoved(_, fullname) => {
            let name = instance_name(&fullname);
            debug!(%name, "peer down");
            peers.retain(|p| p.name != name);
        }
        ServiceEvent::SearchStarted(_)
        | ServiceEvent::ServiceFound(_, _)
        | ServiceEvent::SearchStopped(_) => {}
    }
}

fn instance_name(fullname: &str) -> String {
    fullname
        .strip_suffix(&format!(".{}", service_domain()))
        .unwrap_or(fullname)
        .to_string()
}
