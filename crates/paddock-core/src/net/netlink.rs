//! Minimal rtnetlink codec over a raw `AF_NETLINK` socket.
//!
//! Covers exactly what the shaper needs: link dumps and creation, traffic
//! control (qdisc, class, filter), addresses and routes. Messages are built
//! into flat buffers with explicit byte layout; replies are parsed in place.

use std::cell::Cell;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use crate::error::{Error, Result};

// Message types.
pub const RTM_NEWLINK: u16 = 16;
pub const RTM_GETLINK: u16 = 18;
pub const RTM_NEWADDR: u16 = 20;
pub const RTM_NEWROUTE: u16 = 24;
pub const RTM_NEWQDISC: u16 = 36;
pub const RTM_DELQDISC: u16 = 37;
pub const RTM_NEWTCLASS: u16 = 40;
pub const RTM_DELTCLASS: u16 = 41;
pub const RTM_GETTCLASS: u16 = 42;
pub const RTM_NEWTFILTER: u16 = 44;

const NLMSG_ERROR: u16 = 2;
const NLMSG_DONE: u16 = 3;

// Header flags.
pub const NLM_F_REQUEST: u16 = 0x0001;
const NLM_F_MULTI: u16 = 0x0002;
pub const NLM_F_ACK: u16 = 0x0004;
pub const NLM_F_EXCL: u16 = 0x0200;
pub const NLM_F_CREATE: u16 = 0x0400;
pub const NLM_F_REPLACE: u16 = 0x0100;
pub const NLM_F_DUMP: u16 = 0x0100 | 0x0200;

// Link attributes.
pub const IFLA_ADDRESS: u16 = 1;
pub const IFLA_IFNAME: u16 = 3;
pub const IFLA_MTU: u16 = 4;
pub const IFLA_LINK: u16 = 5;
pub const IFLA_MASTER: u16 = 10;
pub const IFLA_LINKINFO: u16 = 18;
pub const IFLA_NET_NS_PID: u16 = 19;
pub const IFLA_INFO_KIND: u16 = 1;
pub const IFLA_INFO_DATA: u16 = 2;
pub const IFLA_MACVLAN_MODE: u16 = 1;
pub const VETH_INFO_PEER: u16 = 1;

// Address attributes.
pub const IFA_ADDRESS: u16 = 1;
pub const IFA_LOCAL: u16 = 2;

// Route attributes.
pub const RTA_GATEWAY: u16 = 5;

// Traffic-control attributes.
pub const TCA_KIND: u16 = 1;
pub const TCA_OPTIONS: u16 = 2;
pub const TCA_STATS: u16 = 3;
pub const TCA_HTB_PARMS: u16 = 1;
pub const TCA_HTB_INIT: u16 = 2;
pub const TCA_HTB_RTAB: u16 = 3;
pub const TCA_HTB_CTAB: u16 = 4;

// Interface flags.
pub const IFF_UP: u32 = 0x1;
pub const IFF_LOOPBACK: u32 = 0x8;
pub const IFF_RUNNING: u32 = 0x40;

const NLMSG_HDRLEN: usize = 16;
const NLA_HDRLEN: usize = 4;

fn nla_align(len: usize) -> usize {
    (len + 3) & !3
}

/// Builder for one netlink request.
pub struct MessageBuilder {
    buf: Vec<u8>,
}

impl MessageBuilder {
    /// Start a request with the given type and flags. `NLM_F_REQUEST` is
    /// implied.
    #[must_use]
    pub fn new(msg_type: u16, flags: u16) -> Self {
        let mut buf = vec![0u8; NLMSG_HDRLEN];
        buf[4..6].copy_from_slice(&msg_type.to_ne_bytes());
        buf[6..8].copy_from_slice(&(flags | NLM_F_REQUEST).to_ne_bytes());
        Self { buf }
    }

    /// Append raw payload bytes (a fixed kernel header struct).
    pub fn payload(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    /// Append one attribute.
    pub fn attr(&mut self, kind: u16, data: &[u8]) -> &mut Self {
        let len = NLA_HDRLEN + data.len();
        self.buf.extend_from_slice(&(len as u16).to_ne_bytes());
        self.buf.extend_from_slice(&kind.to_ne_bytes());
        self.buf.extend_from_slice(data);
        self.buf.resize(nla_align(self.buf.len()), 0);
        self
    }

    /// Append a string attribute with its NUL terminator.
    pub fn attr_str(&mut self, kind: u16, value: &str) -> &mut Self {
        let mut data = value.as_bytes().to_vec();
        data.push(0);
        self.attr(kind, &data)
    }

    /// Append a native-endian u32 attribute.
    pub fn attr_u32(&mut self, kind: u16, value: u32) -> &mut Self {
        self.attr(kind, &value.to_ne_bytes())
    }

    /// Append a nested attribute built by `fill`.
    pub fn nested(&mut self, kind: u16, fill: impl FnOnce(&mut Self)) -> &mut Self {
        let start = self.buf.len();
        self.buf.extend_from_slice(&0u16.to_ne_bytes());
        self.buf.extend_from_slice(&kind.to_ne_bytes());
        fill(self);
        let len = (self.buf.len() - start) as u16;
        self.buf[start..start + 2].copy_from_slice(&len.to_ne_bytes());
        self.buf.resize(nla_align(self.buf.len()), 0);
        self
    }

    fn finish(mut self, seq: u32) -> Vec<u8> {
        let len = self.buf.len() as u32;
        self.buf[0..4].copy_from_slice(&len.to_ne_bytes());
        self.buf[8..12].copy_from_slice(&seq.to_ne_bytes());
        self.buf
    }
}

/// A reply message: type plus payload (header struct and attributes).
#[derive(Debug, Clone)]
pub struct ReplyMessage {
    /// Netlink message type.
    pub msg_type: u16,
    /// Payload bytes after the netlink header.
    pub payload: Vec<u8>,
}

impl ReplyMessage {
    /// Iterate attributes that follow a fixed header of `header_len` bytes.
    #[must_use]
    pub fn attrs(&self, header_len: usize) -> AttrIter<'_> {
        AttrIter {
            data: self.payload.get(header_len..).unwrap_or(&[]),
        }
    }
}

/// Iterator over netlink attributes.
pub struct AttrIter<'a> {
    data: &'a [u8],
}

impl<'a> Iterator for AttrIter<'a> {
    type Item = (u16, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.data.len() < NLA_HDRLEN {
            return None;
        }
        let len = u16::from_ne_bytes([self.data[0], self.data[1]]) as usize;
        let kind = u16::from_ne_bytes([self.data[2], self.data[3]]);
        if len < NLA_HDRLEN || len > self.data.len() {
            return None;
        }
        let value = &self.data[NLA_HDRLEN..len];
        self.data = self.data.get(nla_align(len)..).unwrap_or(&[]);
        Some((kind, value))
    }
}

/// A connected rtnetlink socket.
///
/// Not internally synchronized; the shaper serializes access behind the
/// network lock.
#[derive(Debug)]
pub struct NetlinkSocket {
    fd: OwnedFd,
    seq: Cell<u32>,
}

impl NetlinkSocket {
    /// Open and bind a `NETLINK_ROUTE` socket.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be created or bound.
    pub fn connect() -> Result<Self> {
        // SAFETY: plain socket(2); the fd is owned immediately.
        let raw = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                libc::NETLINK_ROUTE,
            )
        };
        if raw < 0 {
            return Err(nix::errno::Errno::last().into());
        }
        // SAFETY: raw is a fresh, valid descriptor.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        // SAFETY: addr is a properly zeroed sockaddr_nl on the stack.
        let rc = unsafe {
            let mut addr: libc::sockaddr_nl = std::mem::zeroed();
            addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
            libc::bind(
                fd.as_raw_fd(),
                std::ptr::addr_of!(addr).cast(),
                std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(nix::errno::Errno::last().into());
        }
        Ok(Self { fd, seq: Cell::new(1) })
    }

    fn next_seq(&self) -> u32 {
        let seq = self.seq.get();
        self.seq.set(seq.wrapping_add(1));
        seq
    }

    fn send(&self, buf: &[u8]) -> Result<()> {
        // SAFETY: buf is valid for its length; the socket is connected to
        // the kernel by construction.
        let rc = unsafe {
            libc::send(self.fd.as_raw_fd(), buf.as_ptr().cast(), buf.len(), 0)
        };
        if rc < 0 {
            return Err(nix::errno::Errno::last().into());
        }
        Ok(())
    }

    fn recv(&self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; 1 << 16];
        // SAFETY: buf is valid for its length.
        let rc = unsafe {
            libc::recv(self.fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len(), 0)
        };
        if rc < 0 {
            return Err(nix::errno::Errno::last().into());
        }
        buf.truncate(rc as usize);
        Ok(buf)
    }

    /// Send a request and wait for its ack.
    ///
    /// # Errors
    ///
    /// Returns the kernel's errno (as `Error::errno`) on a negative ack.
    pub fn request(&self, msg: MessageBuilder) -> Result<()> {
        let seq = self.next_seq();
        self.send(&msg.finish(seq))?;

        loop {
            let raw = self.recv()?;
            for reply in parse_messages(&raw) {
                if reply.msg_type == NLMSG_ERROR {
                    return ack_to_result(&reply);
                }
            }
        }
    }

    /// Send a dump request and collect every part of the reply.
    ///
    /// # Errors
    ///
    /// Returns an error on a negative ack or a truncated reply.
    pub fn dump(&self, msg: MessageBuilder) -> Result<Vec<ReplyMessage>> {
        let seq = self.next_seq();
        self.send(&msg.finish(seq))?;

        let mut out = Vec::new();
        loop {
            let raw = self.recv()?;
            for reply in parse_messages(&raw) {
                match reply.msg_type {
                    NLMSG_DONE => return Ok(out),
                    NLMSG_ERROR => {
                        ack_to_result(&reply)?;
                        return Ok(out);
                    }
                    _ => out.push(reply),
                }
            }
        }
    }
}

fn ack_to_result(reply: &ReplyMessage) -> Result<()> {
    if reply.payload.len() < 4 {
        return Err(Error::unknown("short netlink ack"));
    }
    let code = i32::from_ne_bytes([
        reply.payload[0],
        reply.payload[1],
        reply.payload[2],
        reply.payload[3],
    ]);
    if code == 0 {
        Ok(())
    } else {
        let errno = -code;
        Err(Error::with_errno(
            crate::error::ErrorKind::Unknown,
            errno,
            format!("netlink: {}", nix::errno::Errno::from_raw(errno).desc()),
        ))
    }
}

fn parse_messages(raw: &[u8]) -> Vec<ReplyMessage> {
    let mut out = Vec::new();
    let mut rest = raw;
    while rest.len() >= NLMSG_HDRLEN {
        let len = u32::from_ne_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
        let msg_type = u16::from_ne_bytes([rest[4], rest[5]]);
        let flags = u16::from_ne_bytes([rest[6], rest[7]]);
        if len < NLMSG_HDRLEN || len > rest.len() {
            break;
        }
        out.push(ReplyMessage {
            msg_type,
            payload: rest[NLMSG_HDRLEN..len].to_vec(),
        });
        // Multipart replies are aligned; single acks are not necessarily.
        let step = if flags & NLM_F_MULTI != 0 { nla_align(len) } else { len };
        rest = rest.get(step..).unwrap_or(&[]);
    }
    out
}

/// Encode a `tcmsg` header.
#[must_use]
pub fn tcmsg(ifindex: i32, handle: u32, parent: u32, info: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(20);
    buf.push(libc::AF_UNSPEC as u8);
    buf.extend_from_slice(&[0u8; 3]);
    buf.extend_from_slice(&ifindex.to_ne_bytes());
    buf.extend_from_slice(&handle.to_ne_bytes());
    buf.extend_from_slice(&parent.to_ne_bytes());
    buf.extend_from_slice(&info.to_ne_bytes());
    buf
}

/// Decode the (ifindex, handle, parent) triple of a `tcmsg` payload.
#[must_use]
pub fn parse_tcmsg(payload: &[u8]) -> Option<(i32, u32, u32)> {
    if payload.len() < 20 {
        return None;
    }
    let ifindex = i32::from_ne_bytes([payload[4], payload[5], payload[6], payload[7]]);
    let handle = u32::from_ne_bytes([payload[8], payload[9], payload[10], payload[11]]);
    let parent = u32::from_ne_bytes([payload[12], payload[13], payload[14], payload[15]]);
    Some((ifindex, handle, parent))
}

/// Size of a `tcmsg` header.
pub const TCMSG_LEN: usize = 20;

/// Encode an `ifinfomsg` header.
#[must_use]
pub fn ifinfomsg(ifindex: i32, flags: u32, change: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16);
    buf.push(libc::AF_UNSPEC as u8);
    buf.push(0);
    buf.extend_from_slice(&0u16.to_ne_bytes());
    buf.extend_from_slice(&ifindex.to_ne_bytes());
    buf.extend_from_slice(&flags.to_ne_bytes());
    buf.extend_from_slice(&change.to_ne_bytes());
    buf
}

/// Decode the (ifindex, flags) of an `ifinfomsg` payload.
#[must_use]
pub fn parse_ifinfomsg(payload: &[u8]) -> Option<(i32, u32)> {
    if payload.len() < 16 {
        return None;
    }
    let ifindex = i32::from_ne_bytes([payload[4], payload[5], payload[6], payload[7]]);
    let flags = u32::from_ne_bytes([payload[8], payload[9], payload[10], payload[11]]);
    Some((ifindex, flags))
}

/// Size of an `ifinfomsg` header.
pub const IFINFOMSG_LEN: usize = 16;

/// Encode an `ifaddrmsg` header.
#[must_use]
pub fn ifaddrmsg(family: u8, prefixlen: u8, ifindex: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8);
    buf.push(family);
    buf.push(prefixlen);
    buf.push(0); // flags
    buf.push(0); // scope
    buf.extend_from_slice(&ifindex.to_ne_bytes());
    buf
}

/// Encode an `rtmsg` header for a main-table unicast route.
#[must_use]
pub fn rtmsg_default_route(family: u8) -> Vec<u8> {
    let mut buf = Vec::with_capacity(12);
    buf.push(family);
    buf.push(0); // dst_len: default route
    buf.push(0); // src_len
    buf.push(0); // tos
    buf.push(254); // RT_TABLE_MAIN
    buf.push(3); // RTPROT_BOOT
    buf.push(0); // RT_SCOPE_UNIVERSE
    buf.push(1); // RTN_UNICAST
    buf.extend_from_slice(&0u32.to_ne_bytes());
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attr_alignment() {
        let mut msg = MessageBuilder::new(RTM_NEWLINK, 0);
        msg.payload(&ifinfomsg(0, 0, 0));
        msg.attr_str(IFLA_IFNAME, "eth0");
        // "eth0\0" is 5 bytes + 4 header = 9, aligned to 12.
        let buf = msg.finish(7);
        assert_eq!(buf.len(), NLMSG_HDRLEN + IFINFOMSG_LEN + 12);
        assert_eq!(&buf[8..12], &7u32.to_ne_bytes());
    }

    #[test]
    fn test_nested_length_covers_children() {
        let mut msg = MessageBuilder::new(RTM_NEWLINK, 0);
        msg.payload(&ifinfomsg(0, 0, 0));
        msg.nested(IFLA_LINKINFO, |m| {
            m.attr_str(IFLA_INFO_KIND, "macvlan");
        });
        let buf = msg.finish(1);
        let payload = &buf[NLMSG_HDRLEN + IFINFOMSG_LEN..];
        let len = u16::from_ne_bytes([payload[0], payload[1]]) as usize;
        // nested header + (attr header + "macvlan\0" aligned)
        assert_eq!(len, 4 + 4 + 8);
    }

    #[test]
    fn test_attr_iter_round_trip() {
        let mut msg = MessageBuilder::new(RTM_NEWLINK, 0);
        msg.payload(&ifinfomsg(3, IFF_UP, 0));
        msg.attr_str(IFLA_IFNAME, "eth1");
        msg.attr_u32(IFLA_MTU, 1500);
        let buf = msg.finish(1);

        let reply = ReplyMessage {
            msg_type: RTM_NEWLINK,
            payload: buf[NLMSG_HDRLEN..].to_vec(),
        };
        let attrs: Vec<_> = reply.attrs(IFINFOMSG_LEN).collect();
        assert_eq!(attrs.len(), 2);
        assert_eq!(attrs[0].0, IFLA_IFNAME);
        assert_eq!(attrs[0].1, b"eth1\0");
        assert_eq!(attrs[1].0, IFLA_MTU);
        assert_eq!(attrs[1].1, &1500u32.to_ne_bytes());
    }

    #[test]
    fn test_parse_tcmsg_round_trip() {
        let buf = tcmsg(2, 0x0001_0003, 0x0001_0001, 0);
        let (ifindex, handle, parent) = parse_tcmsg(&buf).unwrap();
        assert_eq!(ifindex, 2);
        assert_eq!(handle, 0x0001_0003);
        assert_eq!(parent, 0x0001_0001);
    }
}
