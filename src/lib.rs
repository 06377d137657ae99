//! Reliable UDP transport for real-time game networking.
//!
//! Provides packet framing with checksums and replay protection
//! ([`packet`], [`replay`]), fragmentation and reassembly ([`frag`]),
//! configurable reliability/ordering/priority profiles ([`qos`]),
//! connection-level retransmission and ordering ([`connection`]), admission
//! control and rate limiting ([`admission`]), a challenge/response integrity
//! handshake ([`integrity`]), and a dispatcher tying it all to a UDP socket
//! ([`dispatcher`]).
//!
//! Everything below [`dispatcher`] is sans-IO: it operates purely on
//! caller-supplied timestamps and byte buffers, so it can be driven and
//! tested without a real socket. [`condition::NetworkConditioner`] is
//! provided for simulating loss, delay, corruption, and duplication in
//! tests.

#![warn(missing_docs)]

pub mod admission;
pub mod checksum;
pub mod codecs;
pub mod condition;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod flags;
pub mod frag;
pub mod integrity;
pub mod limit;
pub mod packet;
pub mod qos;
pub mod replay;
pub mod rtt;
pub mod seq;
pub mod stats;

pub use config::Config;
pub use connection::{Connection, ConnectionState};
pub use dispatcher::{Dispatcher, MessageHandler};
pub use packet::{DecodeError, EncodeError, PacketHeader};
pub use qos::{Priority, ProfileCatalog, QosProfile, Reliability};
pub use seq::Seq;
pub use stats::Stats;
