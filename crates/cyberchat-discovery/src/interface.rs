//! Local interface selection for the advertiser.

use std::net::{IpAddr, Ipv4Addr};

use crate::error::{DiscoveryError, Result};

/// Pick the IPv4 address to advertise: the first non-loopback,
/// non-link-local IPv4 on an interface that is up.
///
/// Re-run every interface-check tick; a changed result triggers an
/// advertiser rebind.
pub fn select_local_ipv4() -> Result<Ipv4Addr> {
    let interfaces = if_addrs::get_if_addrs()?;
    first_routable(
        interfaces
            .iter()
            .filter(|iface| !iface.is_loopback())
            .map(|iface| iface.ip()),
    )
    .ok_or(DiscoveryError::NoInterface)
}

fn first_routable(mut addrs: impl Iterator<Item = IpAddr>) -> Option<Ipv4Addr> {
    addrs.find_map(|addr| match addr {
        IpAddr::V4(v4) if !v4.is_loopback() && !v4.is_link_local() && !v4.is_unspecified() => {
            Some(v4)
        }
        _ => None,
    })
}
