//! HTB shaper and link provisioning.
//!
//! Every running non-loopback interface carries the same tree:
//!
//! ```text
//! qdisc 1:0  htb, default -> 1:ffff
//!   class 1:1          host root, parent of everything
//!     class 1:ffff     unclassified catch-all
//!     class 1:2        supervisor subtree
//!       class 1:<id>   one per container, mirroring the hierarchy
//! ```
//!
//! Packets are classified by a single cgroup-match filter at the qdisc;
//! the classid each container writes into its `net_cls` cgroup selects the
//! class. All mutation here happens behind the caller's network lock.

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use super::netlink::{
    self, MessageBuilder, NetlinkSocket, IFA_ADDRESS, IFA_LOCAL, IFF_LOOPBACK, IFF_RUNNING,
    IFF_UP, IFLA_ADDRESS, IFLA_IFNAME, IFLA_INFO_DATA, IFLA_INFO_KIND, IFLA_LINK, IFLA_LINKINFO,
    IFLA_MACVLAN_MODE, IFLA_MASTER, IFLA_MTU, IFLA_NET_NS_PID, IFINFOMSG_LEN, NLM_F_ACK,
    NLM_F_CREATE, NLM_F_DUMP, NLM_F_EXCL, NLM_F_REPLACE, RTA_GATEWAY, RTM_DELQDISC,
    RTM_DELTCLASS, RTM_GETLINK, RTM_GETTCLASS, RTM_NEWADDR, RTM_NEWLINK, RTM_NEWQDISC,
    RTM_NEWROUTE, RTM_NEWTCLASS, RTM_NEWTFILTER, TCA_HTB_CTAB, TCA_HTB_INIT, TCA_HTB_PARMS,
    TCA_HTB_RTAB, TCA_KIND, TCA_OPTIONS, TCA_STATS, TCMSG_LEN, VETH_INFO_PEER,
};
use super::{IpSpec, MacVlanCfg, VethCfg};
use crate::config::NetworkSection;
use crate::error::{Error, Result};

/// Major number of every handle the supervisor owns.
pub const ROOT_TC_MAJOR: u16 = 1;
/// Minor of the host root class, equal to the root container id.
pub const ROOT_TC_MINOR: u16 = 1;
/// Minor of the unclassified catch-all class.
pub const DEFAULT_TC_MINOR: u16 = 0xffff;

/// `TC_H_ROOT`.
const TC_H_ROOT: u32 = 0xffff_ffff;
/// `ETH_P_ALL` in network byte order, in the low 16 bits of `tcm_info`.
const FILTER_PROTO: u32 = 0x0003u16.to_be() as u32;
/// HTB quantum applied to every class.
const HTB_QUANTUM: u32 = 10_000;

/// Compose a (major, minor) handle.
#[must_use]
pub const fn tc_handle(major: u16, minor: u16) -> u32 {
    ((major as u32) << 16) | minor as u32
}

/// The qdisc handle, 1:0.
const QDISC_HANDLE: u32 = tc_handle(ROOT_TC_MAJOR, 0);

/// A running, shapeable interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    /// Interface name.
    pub name: String,
    /// Kernel interface index.
    pub index: i32,
}

/// Per-class counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TclassStat {
    /// Bytes sent.
    Bytes,
    /// Packets sent.
    Packets,
    /// Packets dropped.
    Drops,
    /// Over-limit events.
    Overlimits,
}

/// The shaper: one netlink socket plus the known link set.
#[derive(Debug)]
pub struct Network {
    sock: NetlinkSocket,
    links: Vec<Link>,
    config: NetworkSection,
}

impl Network {
    /// Connect the shared rtnetlink socket.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be created.
    pub fn connect(config: NetworkSection) -> Result<Self> {
        Ok(Self {
            sock: NetlinkSocket::connect()?,
            links: Vec::new(),
            config,
        })
    }

    /// The currently known links.
    #[must_use]
    pub fn links(&self) -> &[Link] {
        &self.links
    }

    /// Whether `name` is a known shapeable link.
    #[must_use]
    pub fn valid_link(&self, name: &str) -> bool {
        self.links.iter().any(|l| l.name == name)
    }

    /// The shared netlink socket, for provisioning helpers.
    #[must_use]
    pub fn socket(&self) -> &NetlinkSocket {
        &self.sock
    }

    /// Scan links and install the qdisc, filter and base classes on each.
    ///
    /// # Errors
    ///
    /// Returns an error if the link dump or any install step fails.
    pub fn prepare(&mut self) -> Result<()> {
        self.links = running_links(&self.sock)?;
        info!(links = self.links.len(), "preparing shaper");
        for link in self.links.clone() {
            self.prepare_link(&link)?;
        }
        Ok(())
    }

    /// Rescan links; install the tree on new ones, keep existing ones.
    ///
    /// # Errors
    ///
    /// Returns an error if the link dump or an install step fails.
    pub fn update(&mut self) -> Result<()> {
        let fresh = running_links(&self.sock)?;
        for link in &fresh {
            if self.links.iter().any(|l| l.name == link.name) {
                debug!(link = %link.name, "existing link");
            } else {
                info!(link = %link.name, "new link");
                self.prepare_link(link)?;
            }
        }
        self.links = fresh;
        Ok(())
    }

    /// Remove the qdisc (and with it the whole class tree) from every link.
    ///
    /// # Errors
    ///
    /// Returns the first netlink error.
    pub fn destroy(&mut self) -> Result<()> {
        info!("removing shaper");
        for link in &self.links {
            let mut msg = MessageBuilder::new(RTM_DELQDISC, NLM_F_ACK);
            msg.payload(&netlink::tcmsg(link.index, QDISC_HANDLE, TC_H_ROOT, 0));
            msg.attr_str(TCA_KIND, "htb");
            self.sock.request(msg)?;
        }
        self.links.clear();
        Ok(())
    }

    fn prepare_link(&self, link: &Link) -> Result<()> {
        debug!(link = %link.name, index = link.index, "prepare link");

        // Root HTB qdisc, replacing whatever was there.
        let mut msg = MessageBuilder::new(RTM_NEWQDISC, NLM_F_ACK | NLM_F_CREATE | NLM_F_REPLACE);
        msg.payload(&netlink::tcmsg(link.index, QDISC_HANDLE, TC_H_ROOT, 0));
        msg.attr_str(TCA_KIND, "htb");
        msg.nested(TCA_OPTIONS, |m| {
            m.attr(TCA_HTB_INIT, &htb_glob(DEFAULT_TC_MINOR as u32));
        });
        self.sock.request(msg)?;

        // Cgroup-match filter at the qdisc.
        let info = (1u32 << 16) | FILTER_PROTO;
        let mut msg = MessageBuilder::new(RTM_NEWTFILTER, NLM_F_ACK | NLM_F_CREATE | NLM_F_REPLACE);
        msg.payload(&netlink::tcmsg(link.index, 1, QDISC_HANDLE, info));
        msg.attr_str(TCA_KIND, "cgroup");
        self.sock.request(msg)?;

        let prio = self.config.default_prio;
        let rate = self.config.default_max_guarantee;
        let ceil = self.config.default_limit;

        // Host root class, the parent of everything.
        self.add_class(
            link.index,
            QDISC_HANDLE,
            tc_handle(ROOT_TC_MAJOR, ROOT_TC_MINOR),
            prio,
            rate,
            ceil,
        )?;
        // Unclassified catch-all.
        self.add_class(
            link.index,
            tc_handle(ROOT_TC_MAJOR, ROOT_TC_MINOR),
            tc_handle(ROOT_TC_MAJOR, DEFAULT_TC_MINOR),
            prio,
            rate,
            ceil,
        )?;
        // Supervisor subtree.
        self.add_class(
            link.index,
            tc_handle(ROOT_TC_MAJOR, ROOT_TC_MINOR),
            tc_handle(ROOT_TC_MAJOR, crate::PADDOCK_ROOT_ID.0),
            prio,
            rate,
            ceil,
        )?;
        Ok(())
    }

    /// Add or replace one HTB class.
    ///
    /// Rate 0 is rewritten to 1: the semantic here is a guarantee, which
    /// admits zero, but HTB rejects a zero rate.
    ///
    /// # Errors
    ///
    /// Returns the netlink error.
    pub fn add_class(
        &self,
        ifindex: i32,
        parent: u32,
        handle: u32,
        prio: u64,
        rate: u64,
        ceil: u64,
    ) -> Result<()> {
        let rate = if rate == 0 { 1 } else { rate };
        debug!(ifindex, parent, handle, rate, ceil, "add tclass");

        let mut msg = MessageBuilder::new(RTM_NEWTCLASS, NLM_F_ACK | NLM_F_CREATE | NLM_F_REPLACE);
        msg.payload(&netlink::tcmsg(ifindex, handle, parent, 0));
        msg.attr_str(TCA_KIND, "htb");
        msg.nested(TCA_OPTIONS, |m| {
            m.attr(TCA_HTB_PARMS, &htb_opt(rate, ceil, prio));
            m.attr(TCA_HTB_RTAB, &rate_table(rate));
            m.attr(TCA_HTB_CTAB, &rate_table(if ceil == 0 { rate } else { ceil }));
        });
        self.sock
            .request(msg)
            .map_err(|e| Error::with_errno(e.kind, e.errno(), format!("cannot add traffic class to {ifindex}: {}", e.message)))
    }

    /// Delete one HTB class; on `EBUSY` descend and delete children first.
    ///
    /// # Errors
    ///
    /// Returns the netlink error.
    pub fn del_class(&self, ifindex: i32, handle: u32) -> Result<()> {
        debug!(ifindex, handle, "del tclass");
        match self.del_class_once(ifindex, handle) {
            Err(e) if e.errno() == libc::EBUSY => {
                // Enumerate the subtree: children are classes whose parent
                // is already collected. Delete leaves first.
                let classes = self.dump_classes(ifindex)?;
                let mut handles = vec![handle];
                let mut i = 0;
                while i < handles.len() {
                    for (child, parent) in &classes {
                        if *parent == handles[i] && !handles.contains(child) {
                            handles.push(*child);
                        }
                    }
                    i += 1;
                }
                for handle in handles.iter().rev() {
                    self.del_class_once(ifindex, *handle)?;
                }
                Ok(())
            }
            other => other,
        }
    }

    fn del_class_once(&self, ifindex: i32, handle: u32) -> Result<()> {
        let mut msg = MessageBuilder::new(RTM_DELTCLASS, NLM_F_ACK);
        msg.payload(&netlink::tcmsg(ifindex, handle, 0, 0));
        self.sock.request(msg)
    }

    fn dump_classes(&self, ifindex: i32) -> Result<Vec<(u32, u32)>> {
        let mut msg = MessageBuilder::new(RTM_GETTCLASS, NLM_F_DUMP);
        msg.payload(&netlink::tcmsg(ifindex, 0, 0, 0));
        let replies = self.sock.dump(msg)?;
        Ok(replies
            .iter()
            .filter_map(|r| netlink::parse_tcmsg(&r.payload))
            .map(|(_, handle, parent)| (handle, parent))
            .collect())
    }

    /// Read one counter of a class on every link.
    ///
    /// # Errors
    ///
    /// Returns an error if a class dump fails or the class is missing.
    pub fn class_stats(&self, handle: u32, stat: TclassStat) -> Result<BTreeMap<String, u64>> {
        let mut out = BTreeMap::new();
        for link in &self.links {
            let mut msg = MessageBuilder::new(RTM_GETTCLASS, NLM_F_DUMP);
            msg.payload(&netlink::tcmsg(link.index, 0, 0, 0));
            let replies = self.sock.dump(msg)?;

            let mut found = false;
            for reply in &replies {
                let Some((_, h, _)) = netlink::parse_tcmsg(&reply.payload) else {
                    continue;
                };
                if h != handle {
                    continue;
                }
                for (kind, value) in reply.attrs(TCMSG_LEN) {
                    if kind == TCA_STATS {
                        out.insert(link.name.clone(), parse_tc_stats(value, stat));
                        found = true;
                    }
                }
            }
            if !found {
                return Err(Error::unknown(format!(
                    "cannot find class statistics for {}",
                    link.name
                )));
            }
        }
        Ok(out)
    }
}

/// One container's class: a handle plus per-interface shaping maps.
#[derive(Debug, Clone)]
pub struct Tclass {
    parent: u32,
    handle: u32,
    prio: BTreeMap<String, u64>,
    rate: BTreeMap<String, u64>,
    ceil: BTreeMap<String, u64>,
}

impl Tclass {
    /// Build a class description attached to `parent`.
    #[must_use]
    pub fn new(
        parent: u32,
        handle: u32,
        prio: BTreeMap<String, u64>,
        rate: BTreeMap<String, u64>,
        ceil: BTreeMap<String, u64>,
    ) -> Self {
        Self {
            parent,
            handle,
            prio,
            rate,
            ceil,
        }
    }

    /// The class handle.
    #[must_use]
    pub const fn handle(&self) -> u32 {
        self.handle
    }

    /// The parent handle.
    #[must_use]
    pub const fn parent(&self) -> u32 {
        self.parent
    }

    fn map_value(map: &BTreeMap<String, u64>, link: &str) -> u64 {
        map.get(link)
            .or_else(|| map.get("default"))
            .copied()
            .unwrap_or(0)
    }

    /// Install the class on every known link.
    ///
    /// # Errors
    ///
    /// Returns the first netlink error.
    pub fn create(&self, net: &Network) -> Result<()> {
        for link in net.links() {
            net.add_class(
                link.index,
                self.parent,
                self.handle,
                Self::map_value(&self.prio, &link.name),
                Self::map_value(&self.rate, &link.name),
                Self::map_value(&self.ceil, &link.name),
            )?;
        }
        Ok(())
    }

    /// Remove the class from every link. Per-link failures are logged and
    /// do not stop the sweep.
    pub fn remove(&self, net: &Network) {
        for link in net.links() {
            if let Err(e) = net.del_class(link.index, self.handle) {
                warn!(link = %link.name, handle = self.handle, error = %e, "cannot remove tclass");
            }
        }
    }

    /// Read one counter on every link.
    ///
    /// # Errors
    ///
    /// Returns an error if the statistics cannot be read.
    pub fn stats(&self, net: &Network, stat: TclassStat) -> Result<BTreeMap<String, u64>> {
        net.class_stats(self.handle, stat)
    }
}

// HTB option encoding. Layouts follow the kernel's pkt_sched.h.

fn ratespec(rate: u32, cell_log: u8) -> Vec<u8> {
    let mut buf = Vec::with_capacity(12);
    buf.push(cell_log);
    buf.push(1); // TC_LINKLAYER_ETHERNET
    buf.extend_from_slice(&0u16.to_ne_bytes()); // overhead
    buf.extend_from_slice(&0i16.to_ne_bytes()); // cell_align
    buf.extend_from_slice(&0u16.to_ne_bytes()); // mpu
    buf.extend_from_slice(&rate.to_ne_bytes());
    buf
}

fn clamp_rate(rate: u64) -> u32 {
    u32::try_from(rate).unwrap_or(u32::MAX)
}

/// `tc_htb_opt` for a class.
fn htb_opt(rate: u64, ceil: u64, prio: u64) -> Vec<u8> {
    let rate = clamp_rate(rate);
    let ceil = if ceil == 0 { rate } else { clamp_rate(ceil) };
    let mut buf = Vec::with_capacity(44);
    buf.extend_from_slice(&ratespec(rate, RATE_CELL_LOG));
    buf.extend_from_slice(&ratespec(ceil, RATE_CELL_LOG));
    buf.extend_from_slice(&transmit_time(rate, HTB_MTU).to_ne_bytes()); // buffer
    buf.extend_from_slice(&transmit_time(ceil, HTB_MTU).to_ne_bytes()); // cbuffer
    buf.extend_from_slice(&HTB_QUANTUM.to_ne_bytes());
    buf.extend_from_slice(&0u32.to_ne_bytes()); // level
    buf.extend_from_slice(&(prio as u32).to_ne_bytes());
    buf
}

/// `tc_htb_glob` for the qdisc.
fn htb_glob(defcls: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(20);
    buf.extend_from_slice(&3u32.to_ne_bytes()); // version
    buf.extend_from_slice(&10u32.to_ne_bytes()); // rate2quantum
    buf.extend_from_slice(&defcls.to_ne_bytes());
    buf.extend_from_slice(&0u32.to_ne_bytes()); // debug
    buf.extend_from_slice(&0u32.to_ne_bytes()); // direct_pkts
    buf
}

/// Cell log covering packet sizes up to 64 KiB in 256 cells.
const RATE_CELL_LOG: u8 = 8;
/// Packet size used for burst buffers.
const HTB_MTU: u32 = 1600;
/// Scheduler ticks per second assumed by the rate tables.
const TIME_UNITS_PER_SEC: u64 = 1_000_000;

fn transmit_time(rate: u32, size: u32) -> u32 {
    if rate == 0 {
        return u32::MAX;
    }
    let ticks = u64::from(size) * TIME_UNITS_PER_SEC / u64::from(rate);
    u32::try_from(ticks).unwrap_or(u32::MAX)
}

/// The 256-cell transmit-time table HTB consumes alongside the rate spec.
fn rate_table(rate: u64) -> Vec<u8> {
    let rate = clamp_rate(if rate == 0 { 1 } else { rate });
    let mut buf = Vec::with_capacity(256 * 4);
    for cell in 0u32..256 {
        let size = (cell + 1) << RATE_CELL_LOG;
        buf.extend_from_slice(&transmit_time(rate, size).to_ne_bytes());
    }
    buf
}

/// Dump links and keep the running, non-loopback ones.
fn running_links(sock: &NetlinkSocket) -> Result<Vec<Link>> {
    let mut msg = MessageBuilder::new(RTM_GETLINK, NLM_F_DUMP);
    msg.payload(&netlink::ifinfomsg(0, 0, 0));
    let replies = sock.dump(msg)?;

    let mut links = Vec::new();
    for reply in &replies {
        let Some((index, flags)) = netlink::parse_ifinfomsg(&reply.payload) else {
            continue;
        };
        if flags & IFF_LOOPBACK != 0 || flags & IFF_RUNNING == 0 {
            continue;
        }
        for (kind, value) in reply.attrs(IFINFOMSG_LEN) {
            if kind == IFLA_IFNAME {
                let bytes = value.strip_suffix(&[0]).unwrap_or(value);
                links.push(Link {
                    name: String::from_utf8_lossy(bytes).to_string(),
                    index,
                });
            }
        }
    }
    Ok(links)
}

/// Find a link's index by name, running or not.
///
/// # Errors
///
/// Returns `InvalidValue` when no such link exists.
pub fn link_index(sock: &NetlinkSocket, name: &str) -> Result<i32> {
    let mut msg = MessageBuilder::new(RTM_GETLINK, NLM_F_DUMP);
    msg.payload(&netlink::ifinfomsg(0, 0, 0));
    let replies = sock.dump(msg)?;

    for reply in &replies {
        let Some((index, _)) = netlink::parse_ifinfomsg(&reply.payload) else {
            continue;
        };
        for (kind, value) in reply.attrs(IFINFOMSG_LEN) {
            if kind == IFLA_IFNAME && value.strip_suffix(&[0]).unwrap_or(value) == name.as_bytes() {
                return Ok(index);
            }
        }
    }
    Err(Error::invalid_value(format!("interface {name} doesn't exist")))
}

fn parse_tc_stats(value: &[u8], stat: TclassStat) -> u64 {
    // struct tc_stats: u64 bytes; u32 packets, drops, overlimits, ...
    let read_u32 = |off: usize| -> u64 {
        value
            .get(off..off + 4)
            .map_or(0, |b| u64::from(u32::from_ne_bytes([b[0], b[1], b[2], b[3]])))
    };
    match stat {
        TclassStat::Bytes => value
            .get(0..8)
            .map_or(0, |b| u64::from_ne_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])),
        TclassStat::Packets => read_u32(8),
        TclassStat::Drops => read_u32(12),
        TclassStat::Overlimits => read_u32(16),
    }
}

/// Create a macvlan on `master_index`, born inside `ns_pid`'s namespace.
///
/// # Errors
///
/// Returns the netlink error.
pub fn create_macvlan(
    sock: &NetlinkSocket,
    cfg: &MacVlanCfg,
    master_index: i32,
    ns_pid: u32,
) -> Result<()> {
    let mode = macvlan_mode_bits(&cfg.mode)?;
    let mut msg = MessageBuilder::new(RTM_NEWLINK, NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL);
    msg.payload(&netlink::ifinfomsg(0, 0, 0));
    msg.attr_str(IFLA_IFNAME, &cfg.name);
    msg.attr_u32(IFLA_LINK, master_index as u32);
    msg.attr_u32(IFLA_NET_NS_PID, ns_pid);
    if let Some(mtu) = cfg.mtu {
        msg.attr_u32(IFLA_MTU, mtu);
    }
    if let Some(hw) = cfg.hw {
        msg.attr(IFLA_ADDRESS, &hw);
    }
    msg.nested(IFLA_LINKINFO, |m| {
        m.attr_str(IFLA_INFO_KIND, "macvlan");
        m.nested(IFLA_INFO_DATA, |m| {
            m.attr_u32(IFLA_MACVLAN_MODE, mode);
        });
    });
    sock.request(msg)
}

/// Create a veth pair: `cfg.name` inside `ns_pid`'s namespace, the peer on
/// the host enslaved to `bridge_index`.
///
/// # Errors
///
/// Returns the netlink error.
pub fn create_veth(
    sock: &NetlinkSocket,
    cfg: &VethCfg,
    bridge_index: i32,
    ns_pid: u32,
) -> Result<()> {
    let mut msg = MessageBuilder::new(RTM_NEWLINK, NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL);
    msg.payload(&netlink::ifinfomsg(0, 0, 0));
    msg.attr_str(IFLA_IFNAME, &cfg.name);
    msg.attr_u32(IFLA_NET_NS_PID, ns_pid);
    if let Some(mtu) = cfg.mtu {
        msg.attr_u32(IFLA_MTU, mtu);
    }
    if let Some(hw) = cfg.hw {
        msg.attr(IFLA_ADDRESS, &hw);
    }
    msg.nested(IFLA_LINKINFO, |m| {
        m.attr_str(IFLA_INFO_KIND, "veth");
        m.nested(IFLA_INFO_DATA, |m| {
            m.nested(VETH_INFO_PEER, |m| {
                m.payload(&netlink::ifinfomsg(0, 0, 0));
                m.attr_str(IFLA_IFNAME, &cfg.peer);
                m.attr_u32(IFLA_MASTER, bridge_index as u32);
            });
        });
    });
    sock.request(msg)
}

/// Move an existing host link into `ns_pid`'s namespace.
///
/// # Errors
///
/// Returns the netlink error.
pub fn move_link(sock: &NetlinkSocket, index: i32, ns_pid: u32) -> Result<()> {
    let mut msg = MessageBuilder::new(RTM_NEWLINK, NLM_F_ACK);
    msg.payload(&netlink::ifinfomsg(index, 0, 0));
    msg.attr_u32(IFLA_NET_NS_PID, ns_pid);
    sock.request(msg)
}

/// Bring a link administratively up.
///
/// # Errors
///
/// Returns the netlink error.
pub fn set_link_up(sock: &NetlinkSocket, index: i32) -> Result<()> {
    let mut msg = MessageBuilder::new(RTM_NEWLINK, NLM_F_ACK);
    msg.payload(&netlink::ifinfomsg(index, IFF_UP, IFF_UP));
    sock.request(msg)
}

/// Assign an address to a link.
///
/// # Errors
///
/// Returns the netlink error.
pub fn add_address(sock: &NetlinkSocket, index: i32, ip: &IpSpec) -> Result<()> {
    let (family, bytes): (u8, Vec<u8>) = match ip.addr {
        std::net::IpAddr::V4(v4) => (libc::AF_INET as u8, v4.octets().to_vec()),
        std::net::IpAddr::V6(v6) => (libc::AF_INET6 as u8, v6.octets().to_vec()),
    };
    let mut msg = MessageBuilder::new(RTM_NEWADDR, NLM_F_ACK | NLM_F_CREATE | NLM_F_REPLACE);
    msg.payload(&netlink::ifaddrmsg(family, ip.prefix, index as u32));
    msg.attr(IFA_LOCAL, &bytes);
    msg.attr(IFA_ADDRESS, &bytes);
    sock.request(msg)
}

/// Install a default route through `gw`.
///
/// # Errors
///
/// Returns the netlink error.
pub fn add_default_gateway(sock: &NetlinkSocket, gw: std::net::IpAddr) -> Result<()> {
    let (family, bytes): (u8, Vec<u8>) = match gw {
        std::net::IpAddr::V4(v4) => (libc::AF_INET as u8, v4.octets().to_vec()),
        std::net::IpAddr::V6(v6) => (libc::AF_INET6 as u8, v6.octets().to_vec()),
    };
    let mut msg = MessageBuilder::new(RTM_NEWROUTE, NLM_F_ACK | NLM_F_CREATE | NLM_F_REPLACE);
    msg.payload(&netlink::rtmsg_default_route(family));
    msg.attr(RTA_GATEWAY, &bytes);
    sock.request(msg)
}

fn macvlan_mode_bits(mode: &str) -> Result<u32> {
    match mode {
        "private" => Ok(1),
        "vepa" => Ok(2),
        "bridge" => Ok(4),
        "passthru" => Ok(8),
        other => Err(Error::invalid_value(format!("invalid macvlan type {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tc_handle_layout() {
        assert_eq!(tc_handle(1, 3), 0x0001_0003);
        assert_eq!(QDISC_HANDLE, 0x0001_0000);
        assert_eq!(tc_handle(ROOT_TC_MAJOR, DEFAULT_TC_MINOR), 0x0001_ffff);
    }

    #[test]
    fn test_htb_opt_rewrites_zero_ceil_to_rate() {
        let opt = htb_opt(1000, 0, 3);
        assert_eq!(opt.len(), 44);
        // rate lives at offset 8 of the first ratespec, ceil at 12 + 8.
        assert_eq!(&opt[8..12], &1000u32.to_ne_bytes());
        assert_eq!(&opt[20..24], &1000u32.to_ne_bytes());
        // prio is the trailing word.
        assert_eq!(&opt[40..44], &3u32.to_ne_bytes());
    }

    #[test]
    fn test_rate_table_shape() {
        let table = rate_table(1_000_000);
        assert_eq!(table.len(), 1024);
        // Larger cells take longer to transmit.
        let first = u32::from_ne_bytes([table[0], table[1], table[2], table[3]]);
        let last = u32::from_ne_bytes([table[1020], table[1021], table[1022], table[1023]]);
        assert!(last > first);
    }

    #[test]
    fn test_map_value_fallback() {
        let mut map = BTreeMap::new();
        map.insert("default".to_string(), 7u64);
        map.insert("eth1".to_string(), 9u64);
        assert_eq!(Tclass::map_value(&map, "eth1"), 9);
        assert_eq!(Tclass::map_value(&map, "eth0"), 7);
        assert_eq!(Tclass::map_value(&BTreeMap::new(), "eth0"), 0);
    }

    #[test]
    fn test_parse_tc_stats_offsets() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&123_456u64.to_ne_bytes());
        raw.extend_from_slice(&77u32.to_ne_bytes());
        raw.extend_from_slice(&5u32.to_ne_bytes());
        raw.extend_from_slice(&2u32.to_ne_bytes());
        assert_eq!(parse_tc_stats(&raw, TclassStat::Bytes), 123_456);
        assert_eq!(parse_tc_stats(&raw, TclassStat::Packets), 77);
        assert_eq!(parse_tc_stats(&raw, TclassStat::Drops), 5);
        assert_eq!(parse_tc_stats(&raw, TclassStat::Overlimits), 2);
    }

    #[test]
    fn test_macvlan_mode_bits() {
        assert_eq!(macvlan_mode_bits("bridge").unwrap(), 4);
        assert!(macvlan_mode_bits("ring").is_err());
    }
}
