use std::net::Ipv4Addr;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta};

use dhcpool::{
    ClientMessage, ClientState, Clock, Config, Coordinator, LeasePool, MacAddr, ManualClock, MessageType,
    ReplyKind,
};

const SERVER: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);

fn config() -> Config {
    Config {
        server_ip: SERVER,
        subnet_mask: Ipv4Addr::new(255, 255, 255, 0),
        range_start: Ipv4Addr::new(10, 0, 0, 10),
        range_end: Ipv4Addr::new(10, 0, 0, 12),
        gateway: Some(SERVER),
        dns_servers: vec![Ipv4Addr::new(1, 1, 1, 1)],
        lease_duration_seconds: 60,
        renewal_time_seconds: None,
        rebinding_time_seconds: None,
        offer_timeout_seconds: 30,
        sweep_interval_seconds: 10,
    }
}

fn setup() -> (Coordinator, ManualClock) {
    let config = config();
    config.validate().unwrap();
    let clock = ManualClock::new(DateTime::from_timestamp(1_700_000_000, 0).unwrap());
    let pool = LeasePool::new(config.build_network().unwrap(), Arc::new(clock.clone()));
    (Coordinator::new(Arc::new(config), pool), clock)
}

fn client(tag: u8) -> MacAddr {
    MacAddr::new([tag, tag, tag, tag, tag, tag])
}

fn discover(mac: MacAddr) -> ClientMessage {
    ClientMessage::new(MessageType::Discover, mac)
}

fn request(mac: MacAddr, address: Ipv4Addr) -> ClientMessage {
    let mut message = ClientMessage::new(MessageType::Request, mac);
    message.requested_address = Some(address);
    message.server_identifier = Some(SERVER);
    message
}

fn release(mac: MacAddr, address: Ipv4Addr) -> ClientMessage {
    let mut message = ClientMessage::new(MessageType::Release, mac);
    message.client_address = Some(address);
    message
}

#[tokio::test]
async fn three_address_pool_walkthrough() {
    let (coordinator, clock) = setup();
    let (aa, bb, cc, dd, ee) = (client(0xaa), client(0xbb), client(0xcc), client(0xdd), client(0xee));

    let offered: Vec<Ipv4Addr> = {
        let mut offered = Vec::new();
        for mac in [aa, bb, cc] {
            let reply = coordinator.handle(&discover(mac)).await.unwrap();
            assert_eq!(reply.kind, ReplyKind::Offer);
            offered.push(reply.address);
        }
        offered
    };
    assert_eq!(
        offered,
        vec![
            Ipv4Addr::new(10, 0, 0, 10),
            Ipv4Addr::new(10, 0, 0, 11),
            Ipv4Addr::new(10, 0, 0, 12),
        ]
    );
    assert!(coordinator.pool().stats().await.exhausted);

    assert!(coordinator.handle(&discover(dd)).await.is_none());

    let ack = coordinator
        .handle(&request(aa, Ipv4Addr::new(10, 0, 0, 10)))
        .await
        .unwrap();
    assert_eq!(ack.kind, ReplyKind::Ack);
    assert_eq!(ack.lease_seconds, Some(60));
    let record = coordinator
        .pool()
        .find_lease(Ipv4Addr::new(10, 0, 0, 10))
        .await
        .unwrap();
    assert_eq!(record.lease_end(), Some(clock.now() + TimeDelta::seconds(60)));

    assert!(
        coordinator
            .handle(&release(aa, Ipv4Addr::new(10, 0, 0, 10)))
            .await
            .is_none()
    );

    let reply = coordinator.handle(&discover(ee)).await.unwrap();
    assert_eq!(reply.address, Ipv4Addr::new(10, 0, 0, 10));
    assert!(
        coordinator
            .pool()
            .find_lease(Ipv4Addr::new(10, 0, 0, 10))
            .await
            .unwrap()
            .belongs_to(ee)
    );
}

#[tokio::test]
async fn released_client_gets_its_address_back() {
    let (coordinator, _clock) = setup();
    let (aa, bb) = (client(0xaa), client(0xbb));

    let first = coordinator.handle(&discover(aa)).await.unwrap().address;
    coordinator.handle(&request(aa, first)).await.unwrap();
    coordinator.handle(&discover(bb)).await.unwrap();
    coordinator.handle(&release(aa, first)).await;

    let again = coordinator.handle(&discover(aa)).await.unwrap();
    assert_eq!(again.address, first);
}

#[tokio::test]
async fn expired_lease_is_reclaimed_by_maintenance() {
    let (coordinator, clock) = setup();
    let (aa, bb, cc, dd) = (client(0xaa), client(0xbb), client(0xcc), client(0xdd));

    for mac in [aa, bb, cc] {
        let offer = coordinator.handle(&discover(mac)).await.unwrap();
        let ack = coordinator.handle(&request(mac, offer.address)).await.unwrap();
        assert_eq!(ack.kind, ReplyKind::Ack);
    }
    assert!(coordinator.handle(&discover(dd)).await.is_none());

    clock.advance(TimeDelta::seconds(60));
    assert_eq!(coordinator.tick().await.expired_leases, 0);

    clock.advance(TimeDelta::seconds(1));
    let maintenance = coordinator.tick().await;
    assert_eq!(maintenance.expired_leases, 3);
    assert_eq!(coordinator.pool().stats().await.free, 3);

    let offer = coordinator.handle(&discover(dd)).await.unwrap();
    assert_eq!(offer.address, Ipv4Addr::new(10, 0, 0, 10));
    assert_eq!(coordinator.client_state(aa).await, Some(ClientState::Bound {
        address: Ipv4Addr::new(10, 0, 0, 10)
    }));

    let maintenance = coordinator.tick().await;
    assert_eq!(maintenance.pruned_clients, 1);
    assert_eq!(coordinator.client_state(aa).await, None);
}

#[tokio::test]
async fn renewal_overwrites_lease_end() {
    let (coordinator, clock) = setup();
    let aa = client(0xaa);

    let offer = coordinator.handle(&discover(aa)).await.unwrap();
    coordinator.handle(&request(aa, offer.address)).await.unwrap();

    clock.advance(TimeDelta::seconds(10));
    let mut renewal = ClientMessage::new(MessageType::Request, aa);
    renewal.client_address = Some(offer.address);
    renewal.requested_lease_seconds = Some(60);
    let ack = coordinator.handle(&renewal).await.unwrap();
    assert_eq!(ack.kind, ReplyKind::Ack);

    let record = coordinator.pool().find_lease(offer.address).await.unwrap();
    assert_eq!(record.lease_start(), Some(clock.now()));
    assert_eq!(record.lease_end(), Some(clock.now() + TimeDelta::seconds(60)));
}
