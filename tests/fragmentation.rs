//! A 2048-byte payload sent with a 512-byte fragment size splits into four
//! fragments and reassembles to the original bytes.

use bytes::Bytes;
use gaffer::connection::Connection;
use gaffer::flags::PacketFlags;
use gaffer::packet;
use gaffer::qos::QosProfile;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

fn addr(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
}

#[test]
fn large_payload_splits_into_four_fragments_and_reassembles() {
    let mut profile = QosProfile::DEFAULT;
    profile.fragment_size = 512;

    let payload = vec![0x42u8; 2048];
    let mut sender = Connection::new(addr(7100), 0);
    let packets = sender.send(&payload, &profile, PacketFlags::empty(), 0, 0);
    assert_eq!(packets.len(), 4);

    let mut receiver = Connection::new(addr(7101), 0);
    let mut assembled = None;
    for packet in &packets {
        let (header, body) = packet::decode(packet, 0).expect("valid frame");
        receiver.check_replay(header.sequence).expect("fragments have distinct sequences");
        let output = receiver.receive(header, body, 0, 0).expect("valid fragment");
        if let Some(delivery) = output.deliveries.into_iter().next() {
            assembled = Some(delivery.payload);
        }
    }

    assert_eq!(assembled.expect("group completes after the last fragment"), Bytes::from(payload));
}
