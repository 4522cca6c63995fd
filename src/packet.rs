//! DHCP packet parsing and encoding per RFC 2131.
//!
//! A packet is a fixed 236-byte BOOTP header, the 4-byte magic cookie
//! `99.130.83.99`, then TLV options terminated by End (255).
//!
//! ```text
//! offset  size  field
//!      0     1  op       1 = BOOTREQUEST, 2 = BOOTREPLY
//!      1     1  htype    1 = Ethernet
//!      2     1  hlen     6 for Ethernet
//!      3     1  hops
//!      4     4  xid
//!      8     2  secs
//!     10     2  flags    bit 15 = broadcast
//!     12     4  ciaddr
//!     16     4  yiaddr
//!     20     4  siaddr
//!     24     4  giaddr
//!     28    16  chaddr
//!     44    64  sname
//!    108   128  file
//!    236     4  magic cookie
//!    240     *  options
//! ```
//!
//! [`DhcpPacket`] is the raw wire form. The lease logic never touches it
//! directly: requests are narrowed to a [`ClientMessage`] and replies are
//! built from [`ResponseFields`] by [`DhcpPacket::build_response`].

use std::net::Ipv4Addr;

use crate::address::MacAddr;
use crate::error::{Error, Result};
use crate::options::{DhcpOption, MessageType, OptionCode};

const DHCP_MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];

const CHADDR_OFFSET: usize = 28;
const CHADDR_SIZE: usize = 16;
const SNAME_OFFSET: usize = CHADDR_OFFSET + CHADDR_SIZE;
const SNAME_SIZE: usize = 64;
const FILE_OFFSET: usize = SNAME_OFFSET + SNAME_SIZE;
const FILE_SIZE: usize = 128;
const MAGIC_COOKIE_OFFSET: usize = FILE_OFFSET + FILE_SIZE;

/// Header plus magic cookie; the shortest packet that can be parsed.
const DHCP_FIXED_HEADER_SIZE: usize = MAGIC_COOKIE_OFFSET + DHCP_MAGIC_COOKIE.len();

/// Replies are padded to this size for BOOTP relay compatibility (RFC 2131 §2).
const DHCP_MIN_PACKET_SIZE: usize = 300;

/// Minimum datagram every host must accept (RFC 791).
const DHCP_ENCODE_CAPACITY: usize = 576;

/// Relay loop guard (RFC 2131 §4.1).
const MAX_HOPS: u8 = 16;

const BROADCAST_FLAG: u16 = 0x8000;

pub const BOOTREQUEST: u8 = 1;
pub const BOOTREPLY: u8 = 2;
pub const HTYPE_ETHERNET: u8 = 1;
pub const HLEN_ETHERNET: u8 = 6;

/// A DHCP packet in wire layout.
#[derive(Debug, Clone)]
pub struct DhcpPacket {
    pub op: u8,
    pub htype: u8,
    pub hlen: u8,
    pub hops: u8,
    /// Transaction ID chosen by the client, echoed in replies.
    pub xid: u32,
    pub secs: u16,
    pub flags: u16,
    /// Client address; only set by clients that already hold a lease.
    pub ciaddr: Ipv4Addr,
    /// Address being assigned to the client.
    pub yiaddr: Ipv4Addr,
    pub siaddr: Ipv4Addr,
    /// Relay agent address.
    pub giaddr: Ipv4Addr,
    pub chaddr: [u8; 16],
    pub sname: [u8; 64],
    pub file: [u8; 128],
    pub options: Vec<DhcpOption>,
}

impl DhcpPacket {
    /// Parses a DHCP packet from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPacket`] if:
    /// - the packet is shorter than 240 bytes
    /// - the magic cookie is wrong
    /// - the hop count exceeds 16
    /// - an Ethernet packet has `hlen != 6`
    /// - an option is truncated or has a bad length
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < DHCP_FIXED_HEADER_SIZE {
            return Err(Error::InvalidPacket(format!(
                "Packet too short: {} bytes (minimum {})",
                data.len(),
                DHCP_FIXED_HEADER_SIZE
            )));
        }

        if data[MAGIC_COOKIE_OFFSET..DHCP_FIXED_HEADER_SIZE] != DHCP_MAGIC_COOKIE {
            return Err(Error::InvalidPacket("Invalid magic cookie".to_string()));
        }

        let [op, htype, hlen, hops] = [data[0], data[1], data[2], data[3]];

        if hops > MAX_HOPS {
            return Err(Error::InvalidPacket(format!(
                "Hop count {} exceeds maximum {}",
                hops, MAX_HOPS
            )));
        }

        if htype == HTYPE_ETHERNET && hlen != HLEN_ETHERNET {
            return Err(Error::InvalidPacket(format!(
                "Invalid hlen {} for Ethernet (expected {})",
                hlen, HLEN_ETHERNET
            )));
        }

        let address_at = |offset: usize| {
            Ipv4Addr::new(
                data[offset],
                data[offset + 1],
                data[offset + 2],
                data[offset + 3],
            )
        };

        let mut chaddr = [0u8; CHADDR_SIZE];
        chaddr.copy_from_slice(&data[CHADDR_OFFSET..SNAME_OFFSET]);
        let mut sname = [0u8; SNAME_SIZE];
        sname.copy_from_slice(&data[SNAME_OFFSET..FILE_OFFSET]);
        let mut file = [0u8; FILE_SIZE];
        file.copy_from_slice(&data[FILE_OFFSET..MAGIC_COOKIE_OFFSET]);

        Ok(Self {
            op,
            htype,
            hlen,
            hops,
            xid: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            secs: u16::from_be_bytes([data[8], data[9]]),
            flags: u16::from_be_bytes([data[10], data[11]]),
            ciaddr: address_at(12),
            yiaddr: address_at(16),
            siaddr: address_at(20),
            giaddr: address_at(24),
            chaddr,
            sname,
            file,
            options: Self::parse_options(&data[DHCP_FIXED_HEADER_SIZE..])?,
        })
    }

    fn parse_options(data: &[u8]) -> Result<Vec<DhcpOption>> {
        let mut options = Vec::new();
        let mut index = 0;

        while index < data.len() {
            let code = data[index];

            if code == OptionCode::Pad as u8 {
                index += 1;
                continue;
            }
            if code == OptionCode::End as u8 {
                break;
            }

            let Some(&length) = data.get(index + 1) else {
                return Err(Error::InvalidPacket("Option length missing".to_string()));
            };
            let start = index + 2;
            let end = start + length as usize;
            let Some(option_data) = data.get(start..end) else {
                return Err(Error::InvalidPacket("Option data truncated".to_string()));
            };

            options.push(DhcpOption::parse(code, option_data)?);
            index = end;
        }

        Ok(options)
    }

    /// Encodes the packet for transmission, padded to at least 300 bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(DHCP_ENCODE_CAPACITY);

        packet.extend_from_slice(&[self.op, self.htype, self.hlen, self.hops]);
        packet.extend_from_slice(&self.xid.to_be_bytes());
        packet.extend_from_slice(&self.secs.to_be_bytes());
        packet.extend_from_slice(&self.flags.to_be_bytes());
        for address in [self.ciaddr, self.yiaddr, self.siaddr, self.giaddr] {
            packet.extend_from_slice(&address.octets());
        }
        packet.extend_from_slice(&self.chaddr);
        packet.extend_from_slice(&self.sname);
        packet.extend_from_slice(&self.file);
        packet.extend_from_slice(&DHCP_MAGIC_COOKIE);

        for option in &self.options {
            option.encode_into(&mut packet);
        }
        packet.push(OptionCode::End as u8);

        if packet.len() < DHCP_MIN_PACKET_SIZE {
            packet.resize(DHCP_MIN_PACKET_SIZE, 0);
        }
        packet
    }

    /// Returns the first Message Type option, if any.
    pub fn message_type(&self) -> Option<MessageType> {
        self.options.iter().find_map(|option| match option {
            DhcpOption::MessageType(message_type) => Some(*message_type),
            _ => None,
        })
    }

    pub fn server_identifier(&self) -> Option<Ipv4Addr> {
        self.options.iter().find_map(|option| match option {
            DhcpOption::ServerIdentifier(address) => Some(*address),
            _ => None,
        })
    }

    pub fn is_broadcast(&self) -> bool {
        self.flags & BROADCAST_FLAG != 0
    }

    /// Builds a reply to `request`.
    ///
    /// Copies `xid`, `flags`, `giaddr`, `htype`, `hlen` and `chaddr` from
    /// the request. An ACK also echoes the request's `ciaddr` so renewing
    /// and INFORM clients see their own address. A NAK carries only the
    /// message type, server identifier, and optional message (RFC 2131
    /// table 3), with `yiaddr` and `siaddr` zeroed.
    pub fn build_response(request: &DhcpPacket, kind: ReplyKind, fields: &ResponseFields) -> Self {
        let mut options = vec![
            DhcpOption::MessageType(kind.message_type()),
            DhcpOption::ServerIdentifier(fields.server_identifier),
        ];

        let (yiaddr, siaddr, ciaddr) = match kind {
            ReplyKind::Nak => (Ipv4Addr::UNSPECIFIED, Ipv4Addr::UNSPECIFIED, Ipv4Addr::UNSPECIFIED),
            ReplyKind::Offer => (fields.address, fields.server_identifier, Ipv4Addr::UNSPECIFIED),
            ReplyKind::Ack => (fields.address, fields.server_identifier, request.ciaddr),
        };

        if kind != ReplyKind::Nak {
            if let Some(lease) = fields.lease_seconds {
                options.push(DhcpOption::LeaseTime(lease));
                if let Some(t1) = fields.renewal_seconds {
                    options.push(DhcpOption::RenewalTime(t1));
                }
                if let Some(t2) = fields.rebinding_seconds {
                    options.push(DhcpOption::RebindingTime(t2));
                }
            }
            options.push(DhcpOption::SubnetMask(fields.subnet_mask));
            if let Some(gateway) = fields.gateway {
                options.push(DhcpOption::Router(vec![gateway]));
            }
            if !fields.dns_servers.is_empty() {
                options.push(DhcpOption::DnsServer(fields.dns_servers.clone()));
            }
        }

        if let Some(message) = &fields.message {
            options.push(DhcpOption::Message(message.clone()));
        }

        Self {
            op: BOOTREPLY,
            htype: request.htype,
            hlen: request.hlen,
            hops: 0,
            xid: request.xid,
            secs: 0,
            flags: request.flags,
            ciaddr,
            yiaddr,
            siaddr,
            giaddr: request.giaddr,
            chaddr: request.chaddr,
            sname: [0u8; SNAME_SIZE],
            file: [0u8; FILE_SIZE],
            options,
        }
    }
}

/// The three replies a server sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    Offer,
    Ack,
    Nak,
}

impl ReplyKind {
    pub fn message_type(self) -> MessageType {
        match self {
            Self::Offer => MessageType::Offer,
            Self::Ack => MessageType::Ack,
            Self::Nak => MessageType::Nak,
        }
    }
}

/// Values the server fills into an OFFER, ACK, or NAK.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFields {
    pub server_identifier: Ipv4Addr,
    /// `yiaddr`; unspecified for NAK and INFORM acknowledgements.
    pub address: Ipv4Addr,
    /// Lease time (option 51); `None` for INFORM acknowledgements.
    pub lease_seconds: Option<u32>,
    pub renewal_seconds: Option<u32>,
    pub rebinding_seconds: Option<u32>,
    pub subnet_mask: Ipv4Addr,
    pub gateway: Option<Ipv4Addr>,
    pub dns_servers: Vec<Ipv4Addr>,
    /// Option 56 text.
    pub message: Option<String>,
}

/// A validated client request, reduced to what the lease logic reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientMessage {
    pub message_type: MessageType,
    pub mac: MacAddr,
    /// Option 50.
    pub requested_address: Option<Ipv4Addr>,
    /// Non-zero `ciaddr`.
    pub client_address: Option<Ipv4Addr>,
    /// Non-zero `giaddr`.
    pub relay_address: Option<Ipv4Addr>,
    /// Option 54.
    pub server_identifier: Option<Ipv4Addr>,
    /// Option 51.
    pub requested_lease_seconds: Option<u32>,
    /// Option 55.
    pub parameter_request_list: Option<Vec<u8>>,
    pub hostname: Option<String>,
    pub options: Vec<DhcpOption>,
}

impl ClientMessage {
    /// A message with only the type and hardware address set.
    pub fn new(message_type: MessageType, mac: MacAddr) -> Self {
        Self {
            message_type,
            mac,
            requested_address: None,
            client_address: None,
            relay_address: None,
            server_identifier: None,
            requested_lease_seconds: None,
            parameter_request_list: None,
            hostname: None,
            options: Vec::new(),
        }
    }

    /// Validates `packet` as a client-to-server DHCP message.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPacket`] if the packet is not a BOOTREQUEST,
    /// has no message type or a server-side one, or does not carry a 6-byte
    /// Ethernet hardware address.
    pub fn from_packet(packet: &DhcpPacket) -> Result<Self> {
        if packet.op != BOOTREQUEST {
            return Err(Error::InvalidPacket(format!(
                "Expected BOOTREQUEST, got op {}",
                packet.op
            )));
        }

        let message_type = packet
            .message_type()
            .ok_or_else(|| Error::InvalidPacket("Missing message type".to_string()))?;
        if !message_type.is_client_message() {
            return Err(Error::InvalidPacket(format!(
                "Unexpected {} from client",
                message_type
            )));
        }

        if packet.htype != HTYPE_ETHERNET || packet.hlen != HLEN_ETHERNET {
            return Err(Error::InvalidPacket(format!(
                "Unsupported hardware address (htype {}, hlen {})",
                packet.htype, packet.hlen
            )));
        }
        let mut mac = [0u8; 6];
        mac.copy_from_slice(&packet.chaddr[..6]);

        let mut message = Self::new(message_type, MacAddr::new(mac));
        message.client_address = Some(packet.ciaddr).filter(|ip| !ip.is_unspecified());
        message.relay_address = Some(packet.giaddr).filter(|ip| !ip.is_unspecified());

        for option in &packet.options {
            match option {
                DhcpOption::RequestedIpAddress(ip) if message.requested_address.is_none() => {
                    message.requested_address = Some(*ip)
                }
                DhcpOption::ServerIdentifier(ip) if message.server_identifier.is_none() => {
                    message.server_identifier = Some(*ip)
                }
                DhcpOption::LeaseTime(seconds) if message.requested_lease_seconds.is_none() => {
                    message.requested_lease_seconds = Some(*seconds)
                }
                DhcpOption::ParameterRequestList(codes)
                    if message.parameter_request_list.is_none() =>
                {
                    message.parameter_request_list = Some(codes.clone())
                }
                DhcpOption::Hostname(name) if message.hostname.is_none() => {
                    message.hostname = Some(name.clone())
                }
                _ => {}
            }
        }
        message.options = packet.options.clone();

        Ok(message)
    }
}
