//! Local network interface enumeration.
//!
//! Discovery opens one probe socket per usable IPv4 interface and rebuilds
//! them whenever this list changes; the connector uses the interface kind to
//! decide whether time-sync pings need to run at the Wi-Fi rate.

use std::io;
use std::net::{IpAddr, Ipv4Addr};

/// Coarse link classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InterfaceKind {
    Loopback,
    /// Radio links power down between packets, which inflates round-trip
    /// samples unless traffic keeps them awake.
    Wireless,
    Wired,
}

impl InterfaceKind {
    /// Classifies by OS interface name.
    #[must_use]
    pub fn classify(name: &str, loopback: bool) -> Self {
        const WIRELESS_PREFIXES: &[&str] = &["wl", "wlan", "wifi", "ath", "ra", "awdl"];
        if loopback {
            Self::Loopback
        } else if WIRELESS_PREFIXES.iter().any(|p| name.starts_with(p)) {
            Self::Wireless
        } else {
            Self::Wired
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LocalInterface {
    pub name: String,
    pub addr: Ipv4Addr,
    pub kind: InterfaceKind,
}

/// Lists the IPv4 interfaces discovery can probe from, sorted by address so
/// two snapshots compare equal when nothing changed.
///
/// # Errors
///
/// Returns an error if the OS interface list cannot be read.
pub fn enumerate() -> io::Result<Vec<LocalInterface>> {
    let mut out: Vec<LocalInterface> = if_addrs::get_if_addrs()?
        .into_iter()
        .filter_map(|iface| match iface.ip() {
            IpAddr::V4(addr) if !addr.is_unspecified() && !addr.is_link_local() => {
                Some(LocalInterface {
                    kind: InterfaceKind::classify(&iface.name, iface.is_loopback()),
                    name: iface.name,
                    addr,
                })
            }
            _ => None,
        })
        .collect();
    out.sort_by_key(|i| i.addr);
    out.dedup_by_key(|i| i.addr);
    Ok(out)
}

/// Finds the interface owning `addr`, if any.
#[must_use]
pub fn interface_for(addr: IpAddr) -> Option<LocalInterface> {
    let IpAddr::V4(v4) = addr else {
        return None;
    };
    enumerate().ok()?.into_iter().find(|i| i.addr == v4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_by_name() {
        assert_eq!(InterfaceKind::classify("lo", true), InterfaceKind::Loopback);
        assert_eq!(InterfaceKind::classify("wlan0", false), InterfaceKind::Wireless);
        assert_eq!(InterfaceKind::classify("wlp3s0", false), InterfaceKind::Wireless);
        assert_eq!(InterfaceKind::classify("eth0", false), InterfaceKind::Wired);
    }

    #[test]
    fn enumerate_is_sorted_and_unique() {
        let ifaces = enumerate().unwrap();
        assert!(ifaces.windows(2).all(|w| w[0].addr < w[1].addr));
    }
}
