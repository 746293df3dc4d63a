//! DNS-SD advertisement of this node.
//!
//! One record per node under `_cyberchat._tcp` with TXT fields
//! `id|port|name|ip`. The record is rebuilt whenever the chosen IPv4
//! or the display name changes.

use std::net::Ipv4Addr;

use mdns_sd::{ServiceDaemon, ServiceInfo};
use tracing::{debug, info};
use uuid::Uuid;

use cyberchat_shared::constants::SERVICE_TYPE;

use crate::error::{DiscoveryError, Result};

pub struct Advertiser {
    daemon: ServiceDaemon,
    guid: Uuid,
    port: u16,
    instance_name: String,
    registered: Option<String>,
}

impl Advertiser {
    pub fn new(daemon: ServiceDaemon, guid: Uuid, port: u16) -> Self {
        Self {
            daemon,
            guid,
            port,
            instance_name: format!("cyberchat-{}", &guid.to_string()[..8]),
            registered: None,
        }
    }

    /// Tear down any existing registration and publish a fresh record
    /// bound to `ip` with the current display name.
    pub fn rebind(&mut self, ip: Ipv4Addr, name: &str) -> Result<()> {
        self.unregister();

        let guid = self.guid.to_string();
        let port = self.port.to_string();
        let ip_str = ip.to_string();
        let properties = [
            ("id", guid.as_str()),
            ("port", port.as_str()),
            ("name", name),
            ("ip", ip_str.as_str()),
        ];

        let host_name = format!("{}.local.", self.instance_name);
        let service = ServiceInfo::new(
            SERVICE_TYPE,
            &self.instance_name,
            &host_name,
            std::net::IpAddr::V4(ip),
            self.port,
            &properties[..],
        )
        .map_err(|e| DiscoveryError::Rebind(e.to_string()))?;

        let fullname = service.get_fullname().to_string();
        self.daemon
            .register(service)
            .map_err(|e| DiscoveryError::Rebind(e.to_string()))?;

        info!(ip = %ip, port = self.port, "advertising on the local link");
        self.registered = Some(fullname);
        Ok(())
    }

    /// Withdraw the current record, if any. Best effort: the daemon
    /// may already have dropped it.
    pub fn unregister(&mut self) {
        if let Some(fullname) = self.registered.take() {
            debug!(service = %fullname, "withdrawing advertisement");
            if let Err(e) = self.daemon.unregister(&fullname) {
                debug!(error = %e, "unregister failed");
            }
        }
    }
}
