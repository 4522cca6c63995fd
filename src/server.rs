use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::clock::SystemClock;
use crate::config::Config;
use crate::coordinator::{Coordinator, Reply};
use crate::error::{Error, Result};
use crate::options::{DhcpOption, OptionCode};
use crate::packet::{ClientMessage, DhcpPacket, ReplyKind, ResponseFields};
use crate::pool::LeasePool;

const DHCP_SERVER_PORT: u16 = 67;
const DHCP_CLIENT_PORT: u16 = 68;
const RECV_BUFFER_SIZE: usize = 1500;

pub struct DhcpServer {
    coordinator: Arc<Coordinator>,
    socket: Arc<UdpSocket>,
}

impl DhcpServer {
    pub async fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let pool = LeasePool::new(config.build_network()?, Arc::new(SystemClock));
        let coordinator = Arc::new(Coordinator::new(Arc::clone(&config), pool));

        let socket = Arc::new(Self::create_socket()?);

        info!(
            "DHCP server starting on {}:{}",
            config.server_ip, DHCP_SERVER_PORT
        );
        info!(
            "Address range: {} - {} ({} addresses)",
            config.range_start,
            config.range_end,
            config.pool_size()
        );

        Ok(Self {
            coordinator,
            socket,
        })
    }

    fn create_socket() -> Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|error| Error::Socket(format!("Failed to create socket: {}", error)))?;

        socket
            .set_reuse_address(true)
            .map_err(|error| Error::Socket(format!("Failed to set SO_REUSEADDR: {}", error)))?;

        socket
            .set_broadcast(true)
            .map_err(|error| Error::Socket(format!("Failed to set SO_BROADCAST: {}", error)))?;

        socket
            .set_nonblocking(true)
            .map_err(|error| Error::Socket(format!("Failed to set non-blocking: {}", error)))?;

        let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, DHCP_SERVER_PORT);
        socket.bind(&bind_addr.into()).map_err(|error| {
            Error::Socket(format!("Failed to bind to {}: {}", bind_addr, error))
        })?;

        let std_socket: std::net::UdpSocket = socket.into();
        UdpSocket::from_std(std_socket).map_err(|error| {
            Error::Socket(format!("Failed to convert to tokio socket: {}", error))
        })
    }

    /// Serves until the surrounding task is cancelled.
    pub async fn run(&self) -> Result<()> {
        let maintenance = spawn_maintenance(
            Arc::clone(&self.coordinator),
            Duration::from_secs(self.coordinator.config().sweep_interval_seconds),
        );
        let _maintenance = AbortOnDrop(maintenance);

        let mut buffer = [0u8; RECV_BUFFER_SIZE];

        info!("DHCP server ready and listening");

        loop {
            match self.socket.recv_from(&mut buffer).await {
                Ok((size, source)) => {
                    let data = buffer[..size].to_vec();
                    let handler = PacketHandler {
                        coordinator: Arc::clone(&self.coordinator),
                        socket: Arc::clone(&self.socket),
                    };

                    tokio::spawn(async move {
                        if let Err(error) = handler.handle_packet(&data, source).await {
                            warn!("Error handling packet from {}: {}", source, error);
                        }
                    });
                }
                Err(error) => {
                    error!("Error receiving packet: {}", error);
                }
            }
        }
    }

    pub fn config(&self) -> &Config {
        self.coordinator.config()
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }
}

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Runs [`Coordinator::tick`] every `period`, starting one period from now.
fn spawn_maintenance(coordinator: Arc<Coordinator>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await;

        loop {
            interval.tick().await;
            coordinator.tick().await;
        }
    })
}

struct PacketHandler {
    coordinator: Arc<Coordinator>,
    socket: Arc<UdpSocket>,
}

impl PacketHandler {
    async fn handle_packet(&self, data: &[u8], source: SocketAddr) -> Result<()> {
        let Some((reply, destination)) = self.respond(data, source).await? else {
            return Ok(());
        };

        self.socket.send_to(&reply.encode(), destination).await?;
        debug!("Sent {:?} to {}", reply.message_type(), destination);
        Ok(())
    }

    /// Decodes a datagram, runs it through the coordinator, and returns the
    /// encoded-ready reply with its destination.
    async fn respond(
        &self,
        data: &[u8],
        source: SocketAddr,
    ) -> Result<Option<(DhcpPacket, SocketAddr)>> {
        let packet = DhcpPacket::parse(data)?;
        let message = ClientMessage::from_packet(&packet)?;

        info!("{} from {} ({})", message.message_type, message.mac, source);

        let Some(reply) = self.coordinator.handle(&message).await else {
            return Ok(None);
        };

        let fields = response_fields(self.coordinator.config(), &reply);
        let mut response = DhcpPacket::build_response(&packet, reply.kind, &fields);
        response.options =
            filter_options_by_prl(response.options, message.parameter_request_list.as_deref());

        Ok(Some((response, reply_destination(&packet, reply.kind))))
    }
}

fn response_fields(config: &Config, reply: &Reply) -> ResponseFields {
    ResponseFields {
        server_identifier: config.server_ip,
        address: reply.address,
        lease_seconds: reply.lease_seconds,
        renewal_seconds: reply.lease_seconds.map(|lease| config.renewal_time(lease)),
        rebinding_seconds: reply.lease_seconds.map(|lease| config.rebinding_time(lease)),
        subnet_mask: config.subnet_mask,
        gateway: config.gateway,
        dns_servers: config.dns_servers.clone(),
        message: reply.message.clone(),
    }
}

/// Relay first, then broadcast for NAKs and clients without an address,
/// otherwise unicast to `ciaddr` (RFC 2131 §4.1).
fn reply_destination(request: &DhcpPacket, kind: ReplyKind) -> SocketAddr {
    if !request.giaddr.is_unspecified() {
        SocketAddr::new(IpAddr::V4(request.giaddr), DHCP_SERVER_PORT)
    } else if kind == ReplyKind::Nak || request.is_broadcast() || request.ciaddr.is_unspecified() {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), DHCP_CLIENT_PORT)
    } else {
        SocketAddr::new(IpAddr::V4(request.ciaddr), DHCP_CLIENT_PORT)
    }
}

/// Drops options the client did not ask for. Protocol options are always kept.
fn filter_options_by_prl(
    options: Vec<DhcpOption>,
    parameter_request_list: Option<&[u8]>,
) -> Vec<DhcpOption> {
    let Some(prl) = parameter_request_list else {
        return options;
    };

    const ALWAYS_SENT: [OptionCode; 6] = [
        OptionCode::MessageType,
        OptionCode::ServerIdentifier,
        OptionCode::LeaseTime,
        OptionCode::RenewalTime,
        OptionCode::RebindingTime,
        OptionCode::Message,
    ];

    options
        .into_iter()
        .filter(|option| {
            let code = option.option_code();
            ALWAYS_SENT.iter().any(|always| *always as u8 == code) || prl.contains(&code)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::options::MessageType;
    use crate::packet::{BOOTREPLY, BOOTREQUEST, HLEN_ETHERNET, HTYPE_ETHERNET};
    use chrono::DateTime;

    const DHCP_MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];
    const SERVER: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 1);
    const SOURCE: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 68);

    #[test]
    fn test_constants() {
        assert_eq!(DHCP_SERVER_PORT, 67);
        assert_eq!(DHCP_CLIENT_PORT, 68);
        assert_eq!(RECV_BUFFER_SIZE, 1500);
    }

    fn test_config() -> Config {
        Config {
            server_ip: SERVER,
            subnet_mask: Ipv4Addr::new(255, 255, 255, 0),
            range_start: Ipv4Addr::new(192, 168, 1, 100),
            range_end: Ipv4Addr::new(192, 168, 1, 200),
            gateway: Some(SERVER),
            dns_servers: vec![Ipv4Addr::new(8, 8, 8, 8)],
            lease_duration_seconds: 3600,
            renewal_time_seconds: Some(1800),
            rebinding_time_seconds: Some(3150),
            offer_timeout_seconds: 60,
            sweep_interval_seconds: 30,
        }
    }

    fn create_dhcp_packet(
        message_type: MessageType,
        mac: [u8; 6],
        xid: u32,
        options: Vec<DhcpOption>,
    ) -> Vec<u8> {
        let mut packet = vec![0u8; 240];

        packet[0] = BOOTREQUEST;
        packet[1] = HTYPE_ETHERNET;
        packet[2] = HLEN_ETHERNET;
        packet[4..8].copy_from_slice(&xid.to_be_bytes());
        packet[10..12].copy_from_slice(&0x8000u16.to_be_bytes());
        packet[28..34].copy_from_slice(&mac);
        packet[236..240].copy_from_slice(&DHCP_MAGIC_COOKIE);

        DhcpOption::MessageType(message_type).encode_into(&mut packet);
        for option in options {
            option.encode_into(&mut packet);
        }
        packet.push(OptionCode::End as u8);
        packet
    }

    fn create_unicast_packet(
        message_type: MessageType,
        mac: [u8; 6],
        xid: u32,
        ciaddr: Ipv4Addr,
        options: Vec<DhcpOption>,
    ) -> Vec<u8> {
        let mut packet = create_dhcp_packet(message_type, mac, xid, options);
        packet[10..12].copy_from_slice(&0x0000u16.to_be_bytes());
        packet[12..16].copy_from_slice(&ciaddr.octets());
        packet
    }

    async fn create_test_handler() -> PacketHandler {
        let config = Arc::new(test_config());
        let clock = ManualClock::new(DateTime::from_timestamp(1_700_000_000, 0).unwrap());
        let pool = LeasePool::new(config.build_network().unwrap(), Arc::new(clock));
        let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();

        PacketHandler {
            coordinator: Arc::new(Coordinator::new(config, pool)),
            socket: Arc::new(socket),
        }
    }

    #[tokio::test]
    async fn test_discover_produces_offer() {
        let handler = create_test_handler().await;
        let mac = [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x01];
        let data = create_dhcp_packet(MessageType::Discover, mac, 0x1234, vec![]);

        let (offer, destination) = handler.respond(&data, SOURCE).await.unwrap().unwrap();

        assert_eq!(offer.op, BOOTREPLY);
        assert_eq!(offer.xid, 0x1234);
        assert_eq!(offer.message_type(), Some(MessageType::Offer));
        assert_eq!(offer.yiaddr, Ipv4Addr::new(192, 168, 1, 100));
        assert_eq!(offer.server_identifier(), Some(SERVER));
        assert!(offer.options.contains(&DhcpOption::LeaseTime(3600)));
        assert!(offer.options.contains(&DhcpOption::RenewalTime(1800)));
        assert!(offer.options.contains(&DhcpOption::RebindingTime(3150)));
        assert_eq!(
            destination,
            SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), DHCP_CLIENT_PORT)
        );
    }

    #[tokio::test]
    async fn test_full_dora_flow() {
        let handler = create_test_handler().await;
        let mac = [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x02];

        let discover = create_dhcp_packet(MessageType::Discover, mac, 1, vec![]);
        let (offer, _) = handler.respond(&discover, SOURCE).await.unwrap().unwrap();

        let request = create_dhcp_packet(
            MessageType::Request,
            mac,
            2,
            vec![
                DhcpOption::RequestedIpAddress(offer.yiaddr),
                DhcpOption::ServerIdentifier(SERVER),
            ],
        );
        let (ack, _) = handler.respond(&request, SOURCE).await.unwrap().unwrap();
        assert_eq!(ack.message_type(), Some(MessageType::Ack));
        assert_eq!(ack.yiaddr, offer.yiaddr);

        let renew = create_unicast_packet(MessageType::Request, mac, 3, offer.yiaddr, vec![]);
        let (renewed, destination) = handler.respond(&renew, SOURCE).await.unwrap().unwrap();
        assert_eq!(renewed.message_type(), Some(MessageType::Ack));
        assert_eq!(renewed.ciaddr, offer.yiaddr);
        assert_eq!(
            destination,
            SocketAddr::new(IpAddr::V4(offer.yiaddr), DHCP_CLIENT_PORT)
        );

        let release = create_unicast_packet(MessageType::Release, mac, 4, offer.yiaddr, vec![]);
        assert!(handler.respond(&release, SOURCE).await.unwrap().is_none());

        let record = handler
            .coordinator
            .pool()
            .find_lease(offer.yiaddr)
            .await
            .unwrap();
        assert!(record.is_free());
    }

    #[tokio::test]
    async fn test_request_for_different_server_is_silent() {
        let handler = create_test_handler().await;
        let mac = [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x03];
        let request = create_dhcp_packet(
            MessageType::Request,
            mac,
            1,
            vec![
                DhcpOption::RequestedIpAddress(Ipv4Addr::new(192, 168, 1, 100)),
                DhcpOption::ServerIdentifier(Ipv4Addr::new(192, 168, 1, 2)),
            ],
        );
        assert!(handler.respond(&request, SOURCE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_nak_is_broadcast_with_message() {
        let handler = create_test_handler().await;
        let mac = [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x04];
        let request = create_unicast_packet(
            MessageType::Request,
            mac,
            1,
            Ipv4Addr::new(10, 9, 9, 9),
            vec![],
        );

        let (nak, destination) = handler.respond(&request, SOURCE).await.unwrap().unwrap();
        assert_eq!(nak.message_type(), Some(MessageType::Nak));
        assert_eq!(nak.yiaddr, Ipv4Addr::UNSPECIFIED);
        assert!(
            nak.options
                .iter()
                .any(|option| matches!(option, DhcpOption::Message(_)))
        );
        assert_eq!(
            destination,
            SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), DHCP_CLIENT_PORT)
        );
    }

    #[tokio::test]
    async fn test_reply_destination_relay() {
        let handler = create_test_handler().await;
        let mac = [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x05];
        let relay = Ipv4Addr::new(10, 1, 1, 1);
        let mut data = create_dhcp_packet(MessageType::Discover, mac, 1, vec![]);
        data[24..28].copy_from_slice(&relay.octets());

        let (offer, destination) = handler.respond(&data, SOURCE).await.unwrap().unwrap();
        assert_eq!(offer.giaddr, relay);
        assert_eq!(
            destination,
            SocketAddr::new(IpAddr::V4(relay), DHCP_SERVER_PORT)
        );
    }

    #[tokio::test]
    async fn test_inform_gets_configuration_only() {
        let handler = create_test_handler().await;
        let mac = [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x06];
        let inform = create_unicast_packet(
            MessageType::Inform,
            mac,
            1,
            Ipv4Addr::new(192, 168, 1, 50),
            vec![],
        );

        let (ack, destination) = handler.respond(&inform, SOURCE).await.unwrap().unwrap();
        assert_eq!(ack.message_type(), Some(MessageType::Ack));
        assert_eq!(ack.yiaddr, Ipv4Addr::UNSPECIFIED);
        assert!(
            !ack.options
                .iter()
                .any(|option| matches!(option, DhcpOption::LeaseTime(_)))
        );
        assert!(ack.options.contains(&DhcpOption::Router(vec![SERVER])));
        assert_eq!(
            destination,
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 50)), DHCP_CLIENT_PORT)
        );
    }

    #[tokio::test]
    async fn test_handle_packet_rejects_bootreply() {
        let handler = create_test_handler().await;
        let mut data =
            create_dhcp_packet(MessageType::Discover, [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x07], 1, vec![]);
        data[0] = BOOTREPLY;

        let result = handler.handle_packet(&data, SOURCE).await;
        assert!(matches!(result, Err(Error::InvalidPacket(_))));
        assert_eq!(handler.coordinator.pool().stats().await.records, 0);
    }

    #[tokio::test]
    async fn test_prl_limits_configuration_options() {
        let handler = create_test_handler().await;
        let mac = [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x08];
        let data = create_dhcp_packet(
            MessageType::Discover,
            mac,
            1,
            vec![DhcpOption::ParameterRequestList(vec![
                OptionCode::SubnetMask as u8,
            ])],
        );

        let (offer, _) = handler.respond(&data, SOURCE).await.unwrap().unwrap();
        assert!(offer.options.contains(&DhcpOption::SubnetMask(Ipv4Addr::new(255, 255, 255, 0))));
        assert!(
            !offer
                .options
                .iter()
                .any(|option| matches!(option, DhcpOption::Router(_) | DhcpOption::DnsServer(_)))
        );
        assert!(offer.options.contains(&DhcpOption::LeaseTime(3600)));
    }

    #[test]
    fn test_filter_options_by_prl() {
        let options = vec![
            DhcpOption::MessageType(MessageType::Offer),
            DhcpOption::ServerIdentifier(SERVER),
            DhcpOption::LeaseTime(3600),
            DhcpOption::SubnetMask(Ipv4Addr::new(255, 255, 255, 0)),
            DhcpOption::Router(vec![SERVER]),
            DhcpOption::DnsServer(vec![Ipv4Addr::new(8, 8, 8, 8)]),
        ];

        let unfiltered = filter_options_by_prl(options.clone(), None);
        assert_eq!(unfiltered, options);

        let filtered = filter_options_by_prl(options, Some(&[OptionCode::DnsServer as u8]));
        let codes: Vec<u8> = filtered.iter().map(DhcpOption::option_code).collect();
        assert_eq!(codes, vec![53, 54, 51, 6]);
    }

    #[test]
    fn test_response_fields_for_inform() {
        let config = test_config();
        let reply = Reply {
            kind: ReplyKind::Ack,
            address: Ipv4Addr::UNSPECIFIED,
            lease_seconds: None,
            message: None,
        };
        let fields = response_fields(&config, &reply);
        assert_eq!(fields.renewal_seconds, None);
        assert_eq!(fields.rebinding_seconds, None);
        assert_eq!(fields.server_identifier, SERVER);
    }

    #[tokio::test]
    async fn test_pool_exhaustion_is_silent() {
        let config = Arc::new(Config {
            range_start: Ipv4Addr::new(192, 168, 1, 100),
            range_end: Ipv4Addr::new(192, 168, 1, 101),
            ..test_config()
        });
        let clock = ManualClock::default();
        let pool = LeasePool::new(config.build_network().unwrap(), Arc::new(clock));
        let socket = Arc::new(tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let handler = PacketHandler {
            coordinator: Arc::new(Coordinator::new(config, pool)),
            socket,
        };

        for last in 0..2u8 {
            let data =
                create_dhcp_packet(MessageType::Discover, [0xaa, 0xbb, 0xcc, 0xdd, 0xee, last], 1, vec![]);
            assert!(handler.respond(&data, SOURCE).await.unwrap().is_some());
        }

        let data =
            create_dhcp_packet(MessageType::Discover, [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 9], 1, vec![]);
        assert!(handler.respond(&data, SOURCE).await.unwrap().is_none());
    }
}
