
use crate::address::Address;
use crate::endpoint;
use crate::error::SendError;
use crate::packet::Packet;
use crate::PeerState;

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// A connection to a remote host.
///
/// `Peer` is a shared handle onto a slot in the owning
/// [`Host`](crate::Host)'s peer table. Handles stay valid after the
/// connection ends; the slot may later be reused for a new connection, which
/// the application can detect through [`connect_id`](Self::connect_id).
///
/// All calls here only mutate queued state. Traffic moves when the host is
/// next serviced or flushed.
#[derive(Clone)]
pub struct Peer {
    endpoint: Rc<RefCell<endpoint::Endpoint>>,
}

impl Peer {
    pub(crate) fn new(endpoint: Rc<RefCell<endpoint::Endpoint>>) -> Self {
        Self { endpoint }
    }

    /// Enqueues a packet for delivery on the given channel.
    ///
    /// The packet's flags select the delivery class; payloads larger than
    /// one fragment are split and reassembled transparently.
    pub fn send(&self, channel_id: u8, packet: &Packet) -> Result<(), SendError> {
        self.endpoint.borrow_mut().send(channel_id, packet)
    }

    /// Removes the next received packet from the delivery queue, returning
    /// it with the channel it arrived on.
    pub fn receive(&self) -> Option<(u8, Packet)> {
        self.endpoint.borrow_mut().receive()
    }

    /// Queues an immediate ping. Pings are otherwise sent automatically
    /// every [`ping_interval`](Self::ping_interval) of silence.
    pub fn ping(&self) {
        self.endpoint.borrow_mut().ping();
    }

    /// Sets the keep-alive interval in milliseconds; 0 restores the
    /// default.
    pub fn ping_interval(&self, interval_ms: u32) {
        self.endpoint.borrow_mut().set_ping_interval(interval_ms);
    }

    /// Adjusts the timeout envelope: retry `limit` before giving up between
    /// `minimum_ms` and `maximum_ms` of silence. 0 restores a field's
    /// default.
    pub fn timeout(&self, limit: u32, minimum_ms: u32, maximum_ms: u32) {
        self.endpoint
            .borrow_mut()
            .set_timeout(limit, minimum_ms, maximum_ms);
    }

    /// Reconfigures the unreliable-packet throttle and informs the remote
    /// end.
    pub fn throttle_configure(&self, interval_ms: u32, acceleration: u32, deceleration: u32) {
        self.endpoint
            .borrow_mut()
            .throttle_configure(interval_ms, acceleration, deceleration);
    }

    /// Requests a graceful disconnection. A
    /// [`Disconnect`](crate::Event::Disconnect) event is delivered once the
    /// remote host acknowledges.
    pub fn disconnect(&self, data: u32) {
        self.endpoint.borrow_mut().disconnect(data);
    }

    /// Forces a disconnection. The remote host is notified once, with no
    /// delivery guarantee, and no local event is generated.
    pub fn disconnect_now(&self, data: u32) {
        self.endpoint.borrow_mut().disconnect_now(data);
    }

    /// Disconnects after all queued outgoing packets have been delivered.
    pub fn disconnect_later(&self, data: u32) {
        self.endpoint.borrow_mut().disconnect_later(data);
    }

    /// Abruptly returns the peer slot to its disconnected state. The remote
    /// host is not notified and will time out.
    pub fn reset(&self) {
        self.endpoint.borrow_mut().reset();
    }

    /// The remote address, once known.
    pub fn address(&self) -> Option<Address> {
        self.endpoint.borrow().address
    }

    /// The connection's lifecycle state.
    pub fn state(&self) -> PeerState {
        self.endpoint.borrow().state
    }

    /// The nonce identifying this connection attempt. Preserved across the
    /// final disconnect event.
    pub fn connect_id(&self) -> u32 {
        self.endpoint.borrow().connect_id
    }

    /// The smoothed round-trip time estimate, in milliseconds.
    pub fn round_trip_time_ms(&self) -> u32 {
        self.endpoint.borrow().round_trip_time
    }

    /// Mean packet loss, expressed in fractions of
    /// [`PACKET_LOSS_SCALE`](crate::PACKET_LOSS_SCALE), smoothed over
    /// 10-second intervals.
    pub fn packet_loss(&self) -> u32 {
        self.endpoint.borrow().packet_loss
    }

    /// Total bytes put on the wire for this connection.
    pub fn bytes_sent(&self) -> u64 {
        self.endpoint.borrow().total_data_sent
    }

    /// Total bytes received from this connection.
    pub fn bytes_received(&self) -> u64 {
        self.endpoint.borrow().total_data_received
    }

    /// Total datagram-level sends of reliable commands, retransmissions
    /// included.
    pub fn packets_sent(&self) -> u64 {
        self.endpoint.borrow().total_packets_sent
    }

    /// Total reliable commands given up on and retransmitted.
    pub fn packets_lost(&self) -> u32 {
        self.endpoint.borrow().total_packets_lost
    }
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.endpoint, &other.endpoint)
    }
}

impl Eq for Peer {}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let endpoint = self.endpoint.borrow();
        f.debug_struct("Peer")
            .field("id", &endpoint.incoming_peer_id)
            .field("state", &endpoint.state)
            .field("address", &endpoint.address)
            .finish()
    }
}
