// Copyright 2019 CoreOS, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! DHCPv4 client (§4.H): DISCOVER/OFFER/REQUEST/ACK over raw UDP on
//! ports 68/67, with exponential backoff. `network.rs` is the only
//! caller; this module owns nothing but the wire protocol and the
//! resulting lease.

use anyhow::{bail, Context, Result};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::time::Duration;

const CLIENT_PORT: u16 = 68;
const SERVER_PORT: u16 = 67;

const OP_BOOTREQUEST: u8 = 1;
const OP_BOOTREPLY: u8 = 2;
const HTYPE_ETHERNET: u8 = 1;
const MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];

const OPT_PAD: u8 = 0;
const OPT_SUBNET_MASK: u8 = 1;
const OPT_ROUTER: u8 = 3;
const OPT_DNS: u8 = 6;
const OPT_REQUESTED_IP: u8 = 50;
const OPT_LEASE_TIME: u8 = 51;
const OPT_MSG_TYPE: u8 = 53;
const OPT_SERVER_ID: u8 = 54;
const OPT_PARAM_REQUEST_LIST: u8 = 55;
const OPT_END: u8 = 255;

const DHCPDISCOVER: u8 = 1;
const DHCPOFFER: u8 = 2;
const DHCPREQUEST: u8 = 3;
const DHCPACK: u8 = 5;
const DHCPNAK: u8 = 6;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub address: Ipv4Addr,
    pub prefix_len: u8,
    pub router: Option<Ipv4Addr>,
    pub dns_servers: Vec<Ipv4Addr>,
    pub lease_seconds: u32,
    pub server_id: Ipv4Addr,
}

/// Runs the DHCPv4 DISCOVER/OFFER/REQUEST/ACK exchange on `ifname`,
/// retrying with exponential backoff until `overall_timeout` elapses
/// (§4.H, §7 transient).
pub fn run(ifname: &str, overall_timeout: Duration) -> Result<Lease> {
    let mac = crate::network::mac_of_interface(ifname)?;
    let xid: u32 = xid_from_mac(&mac);

    let socket = bind_broadcast_socket(ifname)?;
    socket
        .set_read_timeout(Some(Duration::from_secs(4)))
        .context("setting DHCP socket read timeout")?;

    let deadline = std::time::Instant::now() + overall_timeout;
    let mut backoff = Duration::from_millis(250);
    let mut last_err = None;

    while std::time::Instant::now() < deadline {
        match attempt(&socket, &mac, xid) {
            Ok(lease) => return Ok(lease),
            Err(err) => {
                log::warn!("DHCP attempt on {} failed: {:#}", ifname, err);
                last_err = Some(err);
                std::thread::sleep(backoff);
                backoff = (backoff * 2).min(Duration::from_secs(8));
            }
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("DHCP timed out on {}", ifname)))
}

fn attempt(socket: &UdpSocket, mac: &[u8; 6], xid: u32) -> Result<Lease> {
    send_discover(socket, mac, xid)?;
    let offer = recv_matching(socket, xid, DHCPOFFER)?;
    let requested_ip = offer
        .yiaddr
        .context("DHCPOFFER carried no offered address")?;
    let server_id = offer
        .option_ip(OPT_SERVER_ID)
        .context("DHCPOFFER carried no server identifier")?;

    send_request(socket, mac, xid, requested_ip, server_id)?;
    let ack = recv_matching(socket, xid, DHCPACK)?;
    let address = ack.yiaddr.context("DHCPACK carried no address")?;
    let mask = ack
        .option_ip(OPT_SUBNET_MASK)
        .unwrap_or(Ipv4Addr::new(255, 255, 255, 0));
    let router = ack.option_ip(OPT_ROUTER);
    let dns_servers = ack.option_ips(OPT_DNS);
    let lease_seconds = ack.option_u32(OPT_LEASE_TIME).unwrap_or(3600);

    Ok(Lease {
        address,
        prefix_len: mask_to_prefix_len(mask),
        router,
        dns_servers,
        lease_seconds,
        server_id,
    })
}

fn bind_broadcast_socket(ifname: &str) -> Result<UdpSocket> {
    let socket = UdpSocket::bind(SocketAddr::V4(SocketAddrV4::new(
        Ipv4Addr::UNSPECIFIED,
        CLIENT_PORT,
    )))
    .with_context(|| format!("binding DHCP client socket on {}", ifname))?;
    socket.set_broadcast(true).context("enabling SO_BROADCAST")?;
    bind_to_device(&socket, ifname)?;
    Ok(socket)
}

fn bind_to_device(socket: &UdpSocket, ifname: &str) -> Result<()> {
    use std::os::unix::io::AsRawFd;
    let name = std::ffi::CString::new(ifname).context("interface name contains a NUL byte")?;
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_BINDTODEVICE,
            name.as_ptr() as *const libc::c_void,
            ifname.len() as u32,
        )
    };
    if ret != 0 {
        return Err(std::io::Error::last_os_error()).context("SO_BINDTODEVICE");
    }
    Ok(())
}

fn send_discover(socket: &UdpSocket, mac: &[u8; 6], xid: u32) -> Result<()> {
    let mut opts = Vec::new();
    opts.push(OPT_MSG_TYPE);
    opts.push(1);
    opts.push(DHCPDISCOVER);
    opts.push(OPT_PARAM_REQUEST_LIST);
    opts.push(3);
    opts.extend_from_slice(&[OPT_SUBNET_MASK, OPT_ROUTER, OPT_DNS]);
    let packet = build_packet(mac, xid, None, &opts);
    send_broadcast(socket, &packet)
}

fn send_request(
    socket: &UdpSocket,
    mac: &[u8; 6],
    xid: u32,
    requested_ip: Ipv4Addr,
    server_id: Ipv4Addr,
) -> Result<()> {
    let mut opts = Vec::new();
    opts.push(OPT_MSG_TYPE);
    opts.push(1);
    opts.push(DHCPREQUEST);
    opts.push(OPT_REQUESTED_IP);
    opts.push(4);
    opts.extend_from_slice(&requested_ip.octets());
    opts.push(OPT_SERVER_ID);
    opts.push(4);
    opts.extend_from_slice(&server_id.octets());
    let packet = build_packet(mac, xid, None, &opts);
    send_broadcast(socket, &packet)
}

fn send_broadcast(socket: &UdpSocket, packet: &[u8]) -> Result<()> {
    socket
        .send_to(
            packet,
            SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::BROADCAST, SERVER_PORT)),
        )
        .context("sending DHCP packet")?;
    Ok(())
}

fn build_packet(mac: &[u8; 6], xid: u32, ciaddr: Option<Ipv4Addr>, options: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; 240];
    buf[0] = OP_BOOTREQUEST;
    buf[1] = HTYPE_ETHERNET;
    buf[2] = 6; // hlen
    buf[4..8].copy_from_slice(&xid.to_be_bytes());
    buf[10..12].copy_from_slice(&0x8000u16.to_be_bytes()); // broadcast flag
    if let Some(ip) = ciaddr {
        buf[12..16].copy_from_slice(&ip.octets());
    }
    buf[28..34].copy_from_slice(mac);
    buf[236..240].copy_from_slice(&MAGIC_COOKIE);
    buf.extend_from_slice(options);
    buf.push(OPT_END);
    buf
}

fn xid_from_mac(mac: &[u8; 6]) -> u32 {
    u32::from_be_bytes([mac[2], mac[3], mac[4], mac[5]])
}

struct DhcpReply {
    yiaddr: Option<Ipv4Addr>,
    options: Vec<(u8, Vec<u8>)>,
}

impl DhcpReply {
    fn option_ip(&self, code: u8) -> Option<Ipv4Addr> {
        self.options.iter().find(|(c, _)| *c == code).and_then(|(_, v)| {
            if v.len() == 4 {
                Some(Ipv4Addr::new(v[0], v[1], v[2], v[3]))
            } else {
                None
            }
        })
    }

    fn option_ips(&self, code: u8) -> Vec<Ipv4Addr> {
        self.options
            .iter()
            .find(|(c, _)| *c == code)
            .map(|(_, v)| v.chunks_exact(4).map(|c| Ipv4Addr::new(c[0], c[1], c[2], c[3])).collect())
            .unwrap_or_default()
    }

    fn option_u32(&self, code: u8) -> Option<u32> {
        self.options
            .iter()
            .find(|(c, _)| *c == code)
            .and_then(|(_, v)| v.as_slice().try_into().ok())
            .map(u32::from_be_bytes)
    }

    fn msg_type(&self) -> Option<u8> {
        self.options
            .iter()
            .find(|(c, _)| *c == OPT_MSG_TYPE)
            .and_then(|(_, v)| v.first().copied())
    }
}

fn recv_matching(socket: &UdpSocket, xid: u32, want: u8) -> Result<DhcpReply> {
    let mut buf = [0u8; 1500];
    loop {
        let (len, _) = socket.recv_from(&mut buf).context("receiving DHCP reply")?;
        let reply = match parse_reply(&buf[..len], xid) {
            Some(r) => r,
            None => continue,
        };
        match reply.msg_type() {
            Some(t) if t == want => return Ok(reply),
            Some(t) if t == DHCPNAK => bail!("DHCP server sent NAK"),
            _ => continue,
        }
    }
}

fn parse_reply(buf: &[u8], xid: u32) -> Option<DhcpReply> {
    if buf.len() < 240 || buf[0] != OP_BOOTREPLY {
        return None;
    }
    let got_xid = u32::from_be_bytes(buf[4..8].try_into().ok()?);
    if got_xid != xid {
        return None;
    }
    if buf[236..240] != MAGIC_COOKIE {
        return None;
    }
    let yiaddr = Ipv4Addr::new(buf[16], buf[17], buf[18], buf[19]);
    let yiaddr = if yiaddr == Ipv4Addr::UNSPECIFIED { None } else { Some(yiaddr) };

    let mut options = Vec::new();
    let mut i = 240;
    while i < buf.len() {
        let code = buf[i];
        if code == OPT_END {
            break;
        }
        if code == OPT_PAD {
            i += 1;
            continue;
        }
        if i + 1 >= buf.len() {
            break;
        }
        let len = buf[i + 1] as usize;
        if i + 2 + len > buf.len() {
            break;
        }
        options.push((code, buf[i + 2..i + 2 + len].to_vec()));
        i += 2 + len;
    }
    Some(DhcpReply { yiaddr, options })
}

fn mask_to_prefix_len(mask: Ipv4Addr) -> u8 {
    u32::from_be_bytes(mask.octets()).count_ones() as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_discover_packet_with_cookie_and_xid() {
        let mac = [0x02, 0x00, 0x00, 0x11, 0x22, 0x33];
        let packet = build_packet(&mac, 0xdeadbeef, None, &[OPT_MSG_TYPE, 1, DHCPDISCOVER]);
        assert_eq!(packet[0], OP_BOOTREQUEST);
        assert_eq!(&packet[4..8], &0xdeadbeefu32.to_be_bytes());
        assert_eq!(&packet[236..240], &MAGIC_COOKIE);
        assert_eq!(&packet[28..34], &mac);
    }

    #[test]
    fn parses_ack_options() {
        let mac = [0, 1, 2, 3, 4, 5];
        let xid = xid_from_mac(&mac);
        let mut pkt = vec![0u8; 240];
        pkt[0] = OP_BOOTREPLY;
        pkt[4..8].copy_from_slice(&xid.to_be_bytes());
        pkt[16..20].copy_from_slice(&[10, 0, 2, 15]);
        pkt[236..240].copy_from_slice(&MAGIC_COOKIE);
        pkt.extend_from_slice(&[OPT_MSG_TYPE, 1, DHCPACK]);
        pkt.extend_from_slice(&[OPT_SUBNET_MASK, 4, 255, 255, 255, 0]);
        pkt.extend_from_slice(&[OPT_ROUTER, 4, 10, 0, 2, 2]);
        pkt.extend_from_slice(&[OPT_END]);

        let reply = parse_reply(&pkt, xid).unwrap();
        assert_eq!(reply.msg_type(), Some(DHCPACK));
        assert_eq!(reply.yiaddr, Some(Ipv4Addr::new(10, 0, 2, 15)));
        assert_eq!(reply.option_ip(OPT_ROUTER), Some(Ipv4Addr::new(10, 0, 2, 2)));
    }

    #[test]
    fn mask_to_prefix() {
        assert_eq!(mask_to_prefix_len(Ipv4Addr::new(255, 255, 255, 0)), 24);
        assert_eq!(mask_to_prefix_len(Ipv4Addr::new(255, 255, 0, 0)), 16);
    }

    #[test]
    fn rejects_mismatched_xid() {
        let mut pkt = vec![0u8; 241];
        pkt[0] = OP_BOOTREPLY;
        pkt[4..8].copy_from_slice(&1u32.to_be_bytes());
        pkt[236..240].copy_from_slice(&MAGIC_COOKIE);
        assert!(parse_reply(&pkt, 2).is_none());
    }
}
