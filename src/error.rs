
use std::io;

use thiserror::Error;

/// Reasons a packet can be refused by [`Peer::send`](crate::Peer::send).
#[derive(Debug, Error)]
pub enum SendError {
    /// The connection is not in a state that accepts data.
    #[error("peer is not connected")]
    NotConnected,
    /// The channel id is outside the negotiated channel count.
    #[error("channel {0} is not open on this connection")]
    InvalidChannel(u8),
    /// The payload exceeds the host's maximum packet size.
    #[error("packet exceeds the maximum packet size")]
    PacketTooLarge,
    /// The payload would not fit in the fragment count limit.
    #[error("packet would require too many fragments")]
    TooManyFragments,
}

/// Reasons [`Host::connect`](crate::Host::connect) can fail.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// Every peer slot is occupied.
    #[error("no peer slot is available")]
    NoAvailablePeers,
}

/// Fatal conditions surfaced by [`Host::service`](crate::Host::service) and
/// [`Host::flush`](crate::Host::flush). The host should be dropped after
/// receiving one.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The socket failed to send or receive.
    #[error("socket error")]
    Io(#[from] io::Error),
    /// More datagrams arrived in one service pass than the receive budget
    /// allows. Treated the same as a socket failure.
    #[error("receive budget exhausted")]
    ReceiveBudgetExhausted,
    /// The intercept callback asked to abort servicing.
    #[error("intercept callback signaled an error")]
    Intercept,
}
