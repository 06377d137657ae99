//! End-to-end reliable echo: encode a payload, decode it back, and round-trip
//! an acknowledgement for it.

use bytes::Bytes;
use gaffer::connection::Connection;
use gaffer::flags::PacketFlags;
use gaffer::qos::QosProfile;
use gaffer::packet;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

fn addr(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
}

#[test]
fn reliable_echo_round_trips_and_acknowledges() {
    let mut client = Connection::new(addr(7000), 0);
    let mut server = Connection::new(addr(7001), 0);

    let packets = client.send(b"hello world", &QosProfile::DEFAULT, PacketFlags::empty(), 0, 0);
    assert_eq!(packets.len(), 1);

    let (header, payload) = packet::decode(&packets[0], 0).expect("valid frame");
    assert_eq!(payload.as_ref(), b"hello world");

    server.check_replay(header.sequence).expect("fresh sequence accepted");
    let received = server.receive(header, payload, 0, 0).expect("no fragment error");
    assert_eq!(received.deliveries.len(), 1);
    assert_eq!(received.deliveries[0].payload, Bytes::from_static(b"hello world"));
    assert_eq!(received.ack_packets.len(), 1);

    let (ack_header, ack_payload) = packet::decode(&received.ack_packets[0], 0).expect("valid ack frame");
    let echoed_back = client.receive(ack_header, ack_payload, 50, 0).expect("ack is never a fragment error");
    assert!(echoed_back.deliveries.is_empty());
    assert!(echoed_back.ack_packets.is_empty());
    assert_eq!(client.queued_packet_count(), 0);
    assert!(client.average_rtt().is_some());
}
