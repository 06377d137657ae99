//! Packets 3, 1, 2 arriving in that order under `ReliableOrdered` are
//! delivered to the application in order: 1, 2, 3.

use bytes::Bytes;
use gaffer::connection::Connection;
use gaffer::packet::PacketHeader;
use gaffer::qos::{Priority, Reliability};
use gaffer::seq::Seq;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

fn addr() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 7200)
}

#[test]
fn out_of_order_arrival_is_delivered_in_sequence_order() {
    let mut conn = Connection::new(addr(), 0);

    let make = |n: u32| {
        (
            PacketHeader::new(Seq::new(n), Reliability::ReliableOrdered, Priority::Normal, 0),
            Bytes::from(format!("msg-{n}")),
        )
    };
    let (h1, p1) = make(1);
    let (h2, p2) = make(2);
    let (h3, p3) = make(3);

    let mut delivered = Vec::new();

    conn.check_replay(h3.sequence).unwrap();
    delivered.extend(conn.receive(h3, p3, 0, 0).unwrap().deliveries.into_iter().map(|d| d.payload));

    conn.check_replay(h1.sequence).unwrap();
    delivered.extend(conn.receive(h1, p1, 0, 0).unwrap().deliveries.into_iter().map(|d| d.payload));

    conn.check_replay(h2.sequence).unwrap();
    delivered.extend(conn.receive(h2, p2, 0, 0).unwrap().deliveries.into_iter().map(|d| d.payload));

    assert_eq!(
        delivered,
        vec![Bytes::from("msg-1"), Bytes::from("msg-2"), Bytes::from("msg-3")]
    );
}
