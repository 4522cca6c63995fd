//! DHCP options (RFC 2132) understood by the lease server.
//!
//! Options are TLV encoded: one code byte, one length byte, then data.
//! Only the options the server reads from clients or writes into replies
//! get their own variant; everything else is kept as [`DhcpOption::Unknown`].

use std::net::Ipv4Addr;

use crate::error::{Error, Result};

/// Option data is at most 255 bytes, so at most 63 IPv4 addresses fit.
const MAX_ADDRESSES_PER_OPTION: usize = 63;

/// Option codes with dedicated handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OptionCode {
    Pad = 0,
    SubnetMask = 1,
    Router = 3,
    DnsServer = 6,
    Hostname = 12,
    RequestedIpAddress = 50,
    LeaseTime = 51,
    MessageType = 53,
    ServerIdentifier = 54,
    ParameterRequestList = 55,
    /// Human-readable error text, sent with NAK (RFC 2132 §9.9).
    Message = 56,
    RenewalTime = 58,
    RebindingTime = 59,
    ClientIdentifier = 61,
    End = 255,
}

impl TryFrom<u8> for OptionCode {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        let code = match value {
            0 => Self::Pad,
            1 => Self::SubnetMask,
            3 => Self::Router,
            6 => Self::DnsServer,
            12 => Self::Hostname,
            50 => Self::RequestedIpAddress,
            51 => Self::LeaseTime,
            53 => Self::MessageType,
            54 => Self::ServerIdentifier,
            55 => Self::ParameterRequestList,
            56 => Self::Message,
            58 => Self::RenewalTime,
            59 => Self::RebindingTime,
            61 => Self::ClientIdentifier,
            255 => Self::End,
            other => return Err(other),
        };
        Ok(code)
    }
}

/// DHCP message types (Option 53).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Discover = 1,
    Offer = 2,
    Request = 3,
    Decline = 4,
    Ack = 5,
    Nak = 6,
    Release = 7,
    Inform = 8,
}

impl MessageType {
    /// Returns true for the types a client sends to a server.
    pub fn is_client_message(self) -> bool {
        matches!(
            self,
            Self::Discover | Self::Request | Self::Decline | Self::Release | Self::Inform
        )
    }
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Discover),
            2 => Ok(Self::Offer),
            3 => Ok(Self::Request),
            4 => Ok(Self::Decline),
            5 => Ok(Self::Ack),
            6 => Ok(Self::Nak),
            7 => Ok(Self::Release),
            8 => Ok(Self::Inform),
            other => Err(other),
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Discover => "DISCOVER",
            Self::Offer => "OFFER",
            Self::Request => "REQUEST",
            Self::Decline => "DECLINE",
            Self::Ack => "ACK",
            Self::Nak => "NAK",
            Self::Release => "RELEASE",
            Self::Inform => "INFORM",
        };
        f.write_str(name)
    }
}

/// A parsed DHCP option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DhcpOption {
    SubnetMask(Ipv4Addr),
    /// First address is the default gateway.
    Router(Vec<Ipv4Addr>),
    DnsServer(Vec<Ipv4Addr>),
    Hostname(String),
    RequestedIpAddress(Ipv4Addr),
    /// Lease time in seconds.
    LeaseTime(u32),
    MessageType(MessageType),
    ServerIdentifier(Ipv4Addr),
    /// Option codes the client wants in the reply.
    ParameterRequestList(Vec<u8>),
    Message(String),
    /// T1 in seconds.
    RenewalTime(u32),
    /// T2 in seconds.
    RebindingTime(u32),
    ClientIdentifier(Vec<u8>),
    Unknown(u8, Vec<u8>),
}

impl DhcpOption {
    pub fn option_code(&self) -> u8 {
        let code = match self {
            Self::SubnetMask(_) => OptionCode::SubnetMask,
            Self::Router(_) => OptionCode::Router,
            Self::DnsServer(_) => OptionCode::DnsServer,
            Self::Hostname(_) => OptionCode::Hostname,
            Self::RequestedIpAddress(_) => OptionCode::RequestedIpAddress,
            Self::LeaseTime(_) => OptionCode::LeaseTime,
            Self::MessageType(_) => OptionCode::MessageType,
            Self::ServerIdentifier(_) => OptionCode::ServerIdentifier,
            Self::ParameterRequestList(_) => OptionCode::ParameterRequestList,
            Self::Message(_) => OptionCode::Message,
            Self::RenewalTime(_) => OptionCode::RenewalTime,
            Self::RebindingTime(_) => OptionCode::RebindingTime,
            Self::ClientIdentifier(_) => OptionCode::ClientIdentifier,
            Self::Unknown(code, _) => return *code,
        };
        code as u8
    }

    /// Parses one option from its code and data bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPacket`] if the data length does not fit the
    /// option, or if `code` is Pad or End.
    pub fn parse(code: u8, data: &[u8]) -> Result<Self> {
        let option = match OptionCode::try_from(code) {
            Ok(OptionCode::SubnetMask) => Self::SubnetMask(parse_address(data, "subnet mask")?),
            Ok(OptionCode::Router) => Self::Router(parse_address_list(data, "router")?),
            Ok(OptionCode::DnsServer) => Self::DnsServer(parse_address_list(data, "DNS server")?),
            Ok(OptionCode::Hostname) => Self::Hostname(String::from_utf8_lossy(data).into_owned()),
            Ok(OptionCode::RequestedIpAddress) => {
                Self::RequestedIpAddress(parse_address(data, "requested IP address")?)
            }
            Ok(OptionCode::LeaseTime) => Self::LeaseTime(parse_seconds(data, "lease time")?),
            Ok(OptionCode::MessageType) => {
                let [value] = data else {
                    return Err(Error::InvalidPacket(
                        "Invalid message type length".to_string(),
                    ));
                };
                let message_type = MessageType::try_from(*value).map_err(|value| {
                    Error::InvalidPacket(format!("Unknown message type: {}", value))
                })?;
                Self::MessageType(message_type)
            }
            Ok(OptionCode::ServerIdentifier) => {
                Self::ServerIdentifier(parse_address(data, "server identifier")?)
            }
            Ok(OptionCode::ParameterRequestList) => Self::ParameterRequestList(data.to_vec()),
            Ok(OptionCode::Message) => Self::Message(String::from_utf8_lossy(data).into_owned()),
            Ok(OptionCode::RenewalTime) => Self::RenewalTime(parse_seconds(data, "renewal time")?),
            Ok(OptionCode::RebindingTime) => {
                Self::RebindingTime(parse_seconds(data, "rebinding time")?)
            }
            Ok(OptionCode::ClientIdentifier) => Self::ClientIdentifier(data.to_vec()),
            Ok(OptionCode::Pad) | Ok(OptionCode::End) => {
                return Err(Error::InvalidPacket(
                    "Pad/End should not be parsed as options".to_string(),
                ));
            }
            Err(unknown) => Self::Unknown(unknown, data.to_vec()),
        };
        Ok(option)
    }

    /// Appends the option's wire form (code, length, data) to `buffer`.
    ///
    /// Variable-length data longer than 255 bytes is truncated.
    pub fn encode_into(&self, buffer: &mut Vec<u8>) {
        let code = self.option_code();
        match self {
            Self::SubnetMask(address)
            | Self::RequestedIpAddress(address)
            | Self::ServerIdentifier(address) => push_tlv(buffer, code, &address.octets()),
            Self::Router(addresses) | Self::DnsServer(addresses) => {
                let data: Vec<u8> = addresses
                    .iter()
                    .take(MAX_ADDRESSES_PER_OPTION)
                    .flat_map(|address| address.octets())
                    .collect();
                push_tlv(buffer, code, &data);
            }
            Self::LeaseTime(seconds) | Self::RenewalTime(seconds) | Self::RebindingTime(seconds) => {
                push_tlv(buffer, code, &seconds.to_be_bytes())
            }
            Self::MessageType(message_type) => push_tlv(buffer, code, &[*message_type as u8]),
            Self::Hostname(text) | Self::Message(text) => push_tlv(buffer, code, text.as_bytes()),
            Self::ParameterRequestList(data)
            | Self::ClientIdentifier(data)
            | Self::Unknown(_, data) => push_tlv(buffer, code, data),
        }
    }

    /// Returns the option's wire form as a new buffer.
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        self.encode_into(&mut buffer);
        buffer
    }
}

fn push_tlv(buffer: &mut Vec<u8>, code: u8, data: &[u8]) {
    let len = data.len().min(u8::MAX as usize);
    buffer.push(code);
    buffer.push(len as u8);
    buffer.extend_from_slice(&data[..len]);
}

fn parse_address(data: &[u8], what: &str) -> Result<Ipv4Addr> {
    let octets: [u8; 4] = data
        .try_into()
        .map_err(|_| Error::InvalidPacket(format!("Invalid {} length", what)))?;
    Ok(Ipv4Addr::from(octets))
}

fn parse_address_list(data: &[u8], what: &str) -> Result<Vec<Ipv4Addr>> {
    if data.is_empty() || !data.len().is_multiple_of(4) {
        return Err(Error::InvalidPacket(format!("Invalid {} option length", what)));
    }
    Ok(data
        .chunks_exact(4)
        .map(|chunk| Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]))
        .collect())
}

fn parse_seconds(data: &[u8], what: &str) -> Result<u32> {
    let bytes: [u8; 4] = data
        .try_into()
        .map_err(|_| Error::InvalidPacket(format!("Invalid {} length", what)))?;
    Ok(u32::from_be_bytes(bytes))
}
