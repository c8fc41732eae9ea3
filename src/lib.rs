
#![warn(missing_docs)]

//! `ulink` is a connection-oriented layer over UDP that multiplexes
//! reliable, unreliable, and unsequenced delivery over a single socket
//! pair, designed primarily for real-time, multiplayer games. Each
//! connection carries up to 255 independently ordered channels, negotiates
//! its MTU and transfer window during the handshake, splits oversized
//! packets into fragments, and adapts its send rate to measured round-trip
//! times and the remote host's advertised bandwidth.
//!
//! # Hosts and peers
//!
//! A [`Host`] owns the UDP socket and a fixed table of peer slots. Servers
//! bind an address; clients may bind an OS-assigned port and call
//! [`Host::connect`]. All traffic moves inside [`Host::service`], which an
//! application calls in its main loop, reacting to the returned
//! [`Event`]s.
//!
//! # Delivery classes
//!
//! The flags on a [`Packet`] select how it travels:
//!
//! * [`packet::FLAG_RELIABLE`]: retransmitted until acknowledged, and
//!   delivered in order relative to other reliable packets on the channel.
//! * no flags: sent once, delivered in order; stale packets are dropped
//!   rather than delivered late.
//! * [`packet::FLAG_UNSEQUENCED`]: sent once, bypassing ordering
//!   entirely, with duplicates suppressed.

mod address;
mod compress;
mod endpoint;
mod error;
mod host;
pub mod packet;
mod peer;
mod protocol;
mod socket;
mod time;

pub use address::Address;
pub use compress::ChecksumFn;
pub use compress::Compressor;
pub use compress::Intercept;
pub use compress::InterceptFn;
pub use endpoint::PeerState;
pub use error::ConnectError;
pub use error::SendError;
pub use error::ServiceError;
pub use host::Host;
pub use packet::Packet;
pub use peer::Peer;
pub use protocol::serial::crc::crc32;

/// The maximum number of peer slots a single host may allocate.
pub const MAXIMUM_PEER_COUNT: usize = protocol::MAXIMUM_PEER_ID as usize;

/// The maximum number of channels which may be negotiated for a connection.
pub const MAXIMUM_CHANNEL_COUNT: usize = protocol::MAXIMUM_CHANNEL_COUNT;

/// The smallest MTU a connection will negotiate, in bytes.
pub const MINIMUM_MTU: u32 = protocol::MINIMUM_MTU;

/// The largest MTU a connection will negotiate, in bytes.
pub const MAXIMUM_MTU: u32 = protocol::MAXIMUM_MTU;

/// Packet loss statistics are expressed in fractions of this scale.
pub const PACKET_LOSS_SCALE: u32 = endpoint::PACKET_LOSS_SCALE;

/// Packet throttle values range from 0 (drop all unreliable packets) to
/// this scale (send everything).
pub const PACKET_THROTTLE_SCALE: u32 = endpoint::PACKET_THROTTLE_SCALE;

/// An event produced by [`Host::service`](Host::service) or
/// [`Host::check_events`](Host::check_events).
#[derive(Debug)]
pub enum Event {
    /// A connection finished its handshake, in either direction.
    Connect {
        /// The newly connected peer.
        peer: Peer,
        /// User data carried in the remote host's connection request, or 0
        /// for outgoing connections.
        data: u32,
    },
    /// A connection ended by explicit disconnection.
    Disconnect {
        /// The former peer. Its slot may be reused by later connections.
        peer: Peer,
        /// User data carried in the DISCONNECT notification.
        data: u32,
    },
    /// A packet arrived on a connection.
    Receive {
        /// The peer the packet arrived from.
        peer: Peer,
        /// The channel the packet was sent on.
        channel_id: u8,
        /// The received packet.
        packet: Packet,
    },
    /// A connection was dropped after the retry envelope was exhausted
    /// without hearing from the remote host.
    Timeout {
        /// The former peer.
        peer: Peer,
    },
}
