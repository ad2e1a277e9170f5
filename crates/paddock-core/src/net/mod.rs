//! Network: link provisioning and the traffic shaper.

pub mod netlink;
pub mod shaper;

use std::net::IpAddr;

pub use shaper::{Network, Tclass, TclassStat};

use crate::error::{Error, Result};

/// Network configuration of one container, parsed from the `net` property.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetCfg {
    /// Share the host (or parent) network namespace.
    pub share_host: bool,
    /// New namespace with only loopback.
    pub none: bool,
    /// Host interfaces to move into the container namespace.
    pub host: Vec<String>,
    /// Macvlan interfaces to create on a master.
    pub macvlan: Vec<MacVlanCfg>,
    /// Veth pairs bridged on the host side.
    pub veth: Vec<VethCfg>,
}

impl NetCfg {
    /// Host-shared configuration, the default.
    #[must_use]
    pub fn host_shared() -> Self {
        Self {
            share_host: true,
            ..Self::default()
        }
    }

    /// Whether starting this configuration needs a new network namespace.
    #[must_use]
    pub fn new_namespace(&self) -> bool {
        !self.share_host
    }

    /// Whether the parent must provision interfaces after the fork.
    #[must_use]
    pub fn needs_provisioning(&self) -> bool {
        !self.host.is_empty() || !self.macvlan.is_empty() || !self.veth.is_empty()
    }
}

/// A macvlan interface specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacVlanCfg {
    /// Host master interface.
    pub master: String,
    /// Interface name inside the container.
    pub name: String,
    /// Macvlan mode: bridge, private, vepa or passthru.
    pub mode: String,
    /// Optional MTU override.
    pub mtu: Option<u32>,
    /// Optional hardware address.
    pub hw: Option<[u8; 6]>,
}

/// A veth pair specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VethCfg {
    /// Interface name inside the container.
    pub name: String,
    /// Host bridge the peer is enslaved to.
    pub bridge: String,
    /// Host-side peer name.
    pub peer: String,
    /// Optional MTU override.
    pub mtu: Option<u32>,
    /// Optional hardware address of the container side.
    pub hw: Option<[u8; 6]>,
}

/// An address assignment from the `ip` property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpSpec {
    /// Interface name inside the container.
    pub iface: String,
    /// Address to assign.
    pub addr: IpAddr,
    /// Prefix length.
    pub prefix: u8,
}

/// Parse an `aa:bb:cc:dd:ee:ff` hardware address.
///
/// # Errors
///
/// Returns `InvalidValue` for anything that is not six hex octets.
pub fn parse_mac(text: &str) -> Result<[u8; 6]> {
    let mut mac = [0u8; 6];
    let mut parts = text.split(':');
    for byte in &mut mac {
        let part = parts
            .next()
            .ok_or_else(|| Error::invalid_value(format!("invalid hardware address {text}")))?;
        *byte = u8::from_str_radix(part, 16)
            .map_err(|_| Error::invalid_value(format!("invalid hardware address {text}")))?;
    }
    if parts.next().is_some() {
        return Err(Error::invalid_value(format!("invalid hardware address {text}")));
    }
    Ok(mac)
}

/// Parse an `addr/prefix` string.
///
/// # Errors
///
/// Returns `InvalidValue` on a malformed address or prefix.
pub fn parse_ip_prefix(text: &str) -> Result<(IpAddr, u8)> {
    let (addr, prefix) = match text.split_once('/') {
        Some((addr, prefix)) => {
            let prefix: u8 = prefix
                .parse()
                .map_err(|_| Error::invalid_value(format!("invalid prefix in {text}")))?;
            (addr, prefix)
        }
        None => (text, 32),
    };
    let addr: IpAddr = addr
        .parse()
        .map_err(|_| Error::invalid_value(format!("invalid address {text}")))?;
    let max = if addr.is_ipv4() { 32 } else { 128 };
    if prefix > max {
        return Err(Error::invalid_value(format!("invalid prefix in {text}")));
    }
    Ok((addr, prefix))
}

/// Valid macvlan modes.
#[must_use]
pub fn valid_macvlan_mode(mode: &str) -> bool {
    matches!(mode, "bridge" | "private" | "vepa" | "passthru")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mac() {
        assert_eq!(
            parse_mac("aa:bb:cc:00:11:22").unwrap(),
            [0xaa, 0xbb, 0xcc, 0x00, 0x11, 0x22]
        );
        assert!(parse_mac("aa:bb").is_err());
        assert!(parse_mac("aa:bb:cc:00:11:zz").is_err());
        assert!(parse_mac("aa:bb:cc:00:11:22:33").is_err());
    }

    #[test]
    fn test_parse_ip_prefix() {
        let (addr, prefix) = parse_ip_prefix("192.168.1.10/24").unwrap();
        assert_eq!(addr.to_string(), "192.168.1.10");
        assert_eq!(prefix, 24);

        let (_, prefix) = parse_ip_prefix("10.0.0.1").unwrap();
        assert_eq!(prefix, 32);

        assert!(parse_ip_prefix("10.0.0.1/33").is_err());
        assert!(parse_ip_prefix("not-an-ip/8").is_err());

        let (addr, prefix) = parse_ip_prefix("fd00::1/64").unwrap();
        assert!(addr.is_ipv6());
        assert_eq!(prefix, 64);
    }

    #[test]
    fn test_netcfg_namespace_decisions() {
        assert!(!NetCfg::host_shared().new_namespace());
        let mut cfg = NetCfg {
            none: true,
            ..NetCfg::default()
        };
        assert!(cfg.new_namespace());
        assert!(!cfg.needs_provisioning());

        cfg.none = false;
        cfg.macvlan.push(MacVlanCfg {
            master: "eth0".into(),
            name: "eth0".into(),
            mode: "bridge".into(),
            mtu: None,
            hw: None,
        });
        assert!(cfg.needs_provisioning());
    }
}
