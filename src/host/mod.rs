
pub(crate) mod service;

use crate::address::Address;
use crate::compress::ChecksumFn;
use crate::compress::Compressor;
use crate::compress::InterceptFn;
use crate::endpoint::channel::Channel;
use crate::endpoint::negotiated_window_size;
use crate::endpoint::Endpoint;
use crate::endpoint::PeerState;
use crate::error::ConnectError;
use crate::error::ServiceError;
use crate::packet::Packet;
use crate::peer::Peer;
use crate::protocol::*;
use crate::socket::Socket;
use crate::socket::WaitStatus;
use crate::time;
use crate::Event;

use log::debug;

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::rc::Rc;

pub(crate) const BANDWIDTH_THROTTLE_INTERVAL: u32 = 1000;
pub(crate) const DEFAULT_MTU: u32 = 1400;
pub(crate) const DEFAULT_MAXIMUM_PACKET_SIZE: usize = 32 * 1024 * 1024;
pub(crate) const DEFAULT_MAXIMUM_WAITING_DATA: usize = 32 * 1024 * 1024;
pub(crate) const RECEIVE_BUDGET: usize = 256;

/// A `ulink` endpoint: one UDP socket multiplexing up to 4095 peer
/// connections, each carrying up to 255 independently sequenced channels.
///
/// A host is serviced cooperatively from a single thread. Calling
/// [`service`](Self::service) (or [`flush`](Self::flush)) pumps every
/// connection: acknowledgements and retransmissions first, then queued
/// packet data, subject to each peer's negotiated MTU, reliable window, and
/// throttle.
pub struct Host {
    socket: Socket,
    pub(crate) peers: Vec<Rc<RefCell<Endpoint>>>,
    pub(crate) channel_limit: usize,
    pub(crate) incoming_bandwidth: u32,
    pub(crate) outgoing_bandwidth: u32,
    pub(crate) bandwidth_throttle_epoch: u32,
    pub(crate) recalculate_bandwidth_limits: bool,
    pub(crate) mtu: u32,
    random_seed: u32,
    pub(crate) maximum_packet_size: usize,
    pub(crate) maximum_waiting_data: usize,
    pub(crate) duplicate_peers: usize,
    pub(crate) service_time: u32,
    pub(crate) dispatch_queue: VecDeque<usize>,
    pub(crate) received_buffer: Box<[u8]>,
    pub(crate) checksum: Option<ChecksumFn>,
    pub(crate) compressor: Option<Box<dyn Compressor>>,
    pub(crate) intercept: Option<InterceptFn>,
    pub(crate) total_sent_data: u64,
    pub(crate) total_sent_packets: u64,
    pub(crate) total_received_data: u64,
    pub(crate) total_received_packets: u64,
}

fn normalized_channel_limit(channel_limit: usize) -> usize {
    if channel_limit == 0 || channel_limit > MAXIMUM_CHANNEL_COUNT {
        MAXIMUM_CHANNEL_COUNT
    } else {
        channel_limit.max(MINIMUM_CHANNEL_COUNT)
    }
}

impl Host {
    /// Opens a host bound to `address`, or to an OS-assigned port when
    /// `None` (a client-only host). Up to `peer_count` concurrent
    /// connections are allocated, each limited to `channel_limit` channels
    /// (0 means the maximum of 255). Nonzero bandwidth caps, in bytes per
    /// second, engage window scaling and the bandwidth throttle.
    ///
    /// Socket initialization errors are forwarded to the caller.
    pub fn new(
        address: Option<Address>,
        peer_count: usize,
        channel_limit: usize,
        incoming_bandwidth: u32,
        outgoing_bandwidth: u32,
    ) -> Result<Self, io::Error> {
        let peer_count = peer_count.min(MAXIMUM_PEER_ID as usize);

        let socket = Socket::bind(address)?;

        let mtu = DEFAULT_MTU;
        let peers = (0..peer_count)
            .map(|index| {
                Rc::new(RefCell::new(Endpoint::new(
                    index as u16,
                    mtu,
                    DEFAULT_MAXIMUM_PACKET_SIZE,
                )))
            })
            .collect();

        Ok(Self {
            socket,
            peers,
            channel_limit: normalized_channel_limit(channel_limit),
            incoming_bandwidth,
            outgoing_bandwidth,
            bandwidth_throttle_epoch: 0,
            recalculate_bandwidth_limits: false,
            mtu,
            random_seed: rand::random::<u32>(),
            maximum_packet_size: DEFAULT_MAXIMUM_PACKET_SIZE,
            maximum_waiting_data: DEFAULT_MAXIMUM_WAITING_DATA,
            duplicate_peers: MAXIMUM_PEER_ID as usize,
            service_time: 0,
            dispatch_queue: VecDeque::new(),
            received_buffer: vec![0; MAXIMUM_MTU as usize].into_boxed_slice(),
            checksum: None,
            compressor: None,
            intercept: None,
            total_sent_data: 0,
            total_sent_packets: 0,
            total_received_data: 0,
            total_received_packets: 0,
        })
    }

    /// Initiates a connection to a remote host. The returned peer completes
    /// the handshake asynchronously; wait for its
    /// [`Connect`](crate::Event::Connect) event.
    pub fn connect(
        &mut self,
        address: Address,
        channel_count: usize,
        data: u32,
    ) -> Result<Peer, ConnectError> {
        let channel_count = channel_count.clamp(MINIMUM_CHANNEL_COUNT, MAXIMUM_CHANNEL_COUNT);

        let index = self
            .peers
            .iter()
            .position(|peer| peer.borrow().state == PeerState::Disconnected)
            .ok_or(ConnectError::NoAvailablePeers)?;

        let peer_rc = Rc::clone(&self.peers[index]);

        {
            let mut peer = peer_rc.borrow_mut();

            peer.channels = (0..channel_count).map(|_| Channel::new()).collect();
            peer.state = PeerState::Connecting;
            peer.address = Some(address);

            self.random_seed = self.random_seed.wrapping_add(1);
            peer.connect_id = self.random_seed;

            peer.window_size = if self.outgoing_bandwidth == 0 {
                MAXIMUM_WINDOW_SIZE
            } else {
                ((self.outgoing_bandwidth / crate::endpoint::WINDOW_SIZE_SCALE)
                    * MINIMUM_WINDOW_SIZE)
                    .clamp(MINIMUM_WINDOW_SIZE, MAXIMUM_WINDOW_SIZE)
            };

            debug!(
                "peer {}: connecting to {} with {} channels",
                peer.incoming_peer_id, address, channel_count
            );

            let command = Command {
                header: CommandHeader {
                    flags: COMMAND_FLAG_ACKNOWLEDGE,
                    channel_id: CONTROL_CHANNEL_ID,
                    reliable_sequence_number: 0,
                },
                kind: CommandKind::Connect(Connect {
                    outgoing_peer_id: peer.incoming_peer_id,
                    incoming_session_id: peer.incoming_session_id,
                    outgoing_session_id: peer.outgoing_session_id,
                    mtu: peer.mtu,
                    window_size: peer.window_size,
                    channel_count: channel_count as u32,
                    incoming_bandwidth: self.incoming_bandwidth,
                    outgoing_bandwidth: self.outgoing_bandwidth,
                    packet_throttle_interval: peer.packet_throttle_interval,
                    packet_throttle_acceleration: peer.packet_throttle_acceleration,
                    packet_throttle_deceleration: peer.packet_throttle_deceleration,
                    connect_id: peer.connect_id,
                    data,
                }),
            };
            peer.queue_outgoing_command(command, None, 0, 0);
        }

        Ok(Peer::new(peer_rc))
    }

    /// Queues a packet for every connected peer. Peers draining toward a
    /// deferred disconnect are excluded.
    pub fn broadcast(&mut self, channel_id: u8, packet: &Packet) {
        for peer in self.peers.iter() {
            let mut peer = peer.borrow_mut();

            if peer.state != PeerState::Connected {
                continue;
            }

            let _ = peer.send(channel_id, packet);
        }
    }

    /// Limits the number of channels negotiated with future incoming
    /// connections; 0 restores the maximum of 255.
    pub fn channel_limit(&mut self, channel_limit: usize) {
        self.channel_limit = normalized_channel_limit(channel_limit);
    }

    /// Adjusts the host's bandwidth caps in bytes per second. Connected
    /// peers are informed at the next bandwidth throttle epoch.
    pub fn bandwidth_limit(&mut self, incoming_bandwidth: u32, outgoing_bandwidth: u32) {
        self.incoming_bandwidth = incoming_bandwidth;
        self.outgoing_bandwidth = outgoing_bandwidth;
        self.recalculate_bandwidth_limits = true;
    }

    /// Installs or removes the datagram compressor.
    pub fn compress(&mut self, compressor: Option<Box<dyn Compressor>>) {
        self.compressor = compressor;
    }

    /// Installs or removes the datagram checksum. When set, every outgoing
    /// datagram carries a trailing 32-bit checksum mixed with the peer's
    /// connect id, and inbound datagrams failing verification are dropped.
    pub fn set_checksum(&mut self, checksum: Option<ChecksumFn>) {
        let checksum_bytes = if checksum.is_some() {
            serial::CHECKSUM_SIZE
        } else {
            0
        };
        self.checksum = checksum;

        for peer in self.peers.iter() {
            peer.borrow_mut().checksum_bytes = checksum_bytes;
        }
    }

    /// Installs or removes the raw-datagram intercept callback.
    pub fn set_intercept(&mut self, intercept: Option<InterceptFn>) {
        self.intercept = intercept;
    }

    /// Caps the size of packets accepted for sending or reassembly.
    pub fn set_maximum_packet_size(&mut self, limit: usize) {
        self.maximum_packet_size = limit;
        for peer in self.peers.iter() {
            peer.borrow_mut().maximum_packet_size = limit;
        }
    }

    /// Caps the aggregate bytes of received packets a peer may hold
    /// undelivered before further data is refused.
    pub fn set_maximum_waiting_data(&mut self, limit: usize) {
        self.maximum_waiting_data = limit;
    }

    /// Limits how many non-disconnected peers may share one remote IP.
    pub fn set_duplicate_peers(&mut self, limit: usize) {
        self.duplicate_peers = if limit == 0 {
            MAXIMUM_PEER_ID as usize
        } else {
            limit
        };
    }

    /// The local address of the underlying socket.
    pub fn address(&self) -> Address {
        self.socket.local_address().unwrap()
    }

    /// The number of peer slots allocated at construction.
    pub fn peer_limit(&self) -> usize {
        self.peers.len()
    }

    /// Total bytes sent since the host was created.
    pub fn bytes_sent(&self) -> u64 {
        self.total_sent_data
    }

    /// Total bytes received since the host was created.
    pub fn bytes_received(&self) -> u64 {
        self.total_received_data
    }

    /// Total datagrams sent since the host was created.
    pub fn packets_sent(&self) -> u64 {
        self.total_sent_packets
    }

    /// Total datagrams received since the host was created.
    pub fn packets_received(&self) -> u64 {
        self.total_received_packets
    }

    /// Checks for an event queued by a previous service pass without doing
    /// any socket work.
    pub fn check_events(&mut self) -> Option<Event> {
        self.dispatch_incoming_commands()
    }

    /// Sends any pending outgoing commands without waiting for events or
    /// checking retransmission timers.
    pub fn flush(&mut self) -> Result<(), ServiceError> {
        self.service_time = time::time_get();

        let mut event = None;
        self.send_outgoing_commands(&mut event, false)?;

        Ok(())
    }

    /// Pumps the protocol: delivers queued events, sends and receives
    /// datagrams, and waits up to `timeout_ms` for traffic.
    ///
    /// Returns `Ok(Some(event))` when an event is ready, `Ok(None)` when
    /// the timeout elapsed quietly, and `Err` on a fatal socket or
    /// servicing error, after which the host should be dropped.
    pub fn service(&mut self, timeout_ms: u32) -> Result<Option<Event>, ServiceError> {
        if let Some(event) = self.dispatch_incoming_commands() {
            return Ok(Some(event));
        }

        self.service_time = time::time_get();
        let deadline = self.service_time.wrapping_add(timeout_ms);

        loop {
            if time::time_difference(self.service_time, self.bandwidth_throttle_epoch)
                >= BANDWIDTH_THROTTLE_INTERVAL
            {
                self.bandwidth_throttle();
            }

            let mut event = None;

            if self.send_outgoing_commands(&mut event, true)? {
                return Ok(event);
            }

            if self.receive_incoming_commands(&mut event)? {
                return Ok(event);
            }

            if self.send_outgoing_commands(&mut event, true)? {
                return Ok(event);
            }

            if let Some(event) = self.dispatch_incoming_commands() {
                return Ok(Some(event));
            }

            if time::time_greater_equal(self.service_time, deadline) {
                return Ok(None);
            }

            loop {
                self.service_time = time::time_get();

                if time::time_greater_equal(self.service_time, deadline) {
                    return Ok(None);
                }

                match self
                    .socket
                    .wait(time::time_difference(deadline, self.service_time))?
                {
                    WaitStatus::Interrupted => continue,
                    WaitStatus::TimedOut => return Ok(None),
                    WaitStatus::Ready => break,
                }
            }

            self.service_time = time::time_get();
        }
    }

    /// Drains the dispatch queue: peers promoted by the handshake, zombies
    /// owing their final event, and connections with delivered packets.
    pub(crate) fn dispatch_incoming_commands(&mut self) -> Option<Event> {
        while let Some(index) = self.dispatch_queue.pop_front() {
            let peer_rc = Rc::clone(&self.peers[index]);
            let mut peer = peer_rc.borrow_mut();

            peer.needs_dispatch = false;

            match peer.state {
                PeerState::ConnectionPending | PeerState::ConnectionSucceeded => {
                    peer.state = PeerState::Connected;
                    let data = peer.event_data;

                    drop(peer);
                    return Some(Event::Connect {
                        peer: Peer::new(peer_rc),
                        data,
                    });
                }

                PeerState::Zombie => {
                    self.recalculate_bandwidth_limits = true;
                    let data = peer.event_data;
                    peer.reset();

                    drop(peer);
                    return Some(Event::Disconnect {
                        peer: Peer::new(peer_rc),
                        data,
                    });
                }

                PeerState::Connected => {
                    if peer.dispatched_commands.is_empty() {
                        continue;
                    }

                    let (channel_id, packet) = match peer.receive() {
                        Some(received) => received,
                        None => continue,
                    };

                    if !peer.dispatched_commands.is_empty() {
                        peer.needs_dispatch = true;
                        self.dispatch_queue.push_back(index);
                    }

                    drop(peer);
                    return Some(Event::Receive {
                        peer: Peer::new(peer_rc),
                        channel_id,
                        packet,
                    });
                }

                _ => {}
            }
        }

        None
    }

    /// Redistributes the host's outgoing bandwidth across connected peers
    /// once per throttle interval, and pushes BANDWIDTH_LIMIT commands when
    /// the limits changed.
    pub(crate) fn bandwidth_throttle(&mut self) {
        let time_current = time::time_get();
        let elapsed = time_current.wrapping_sub(self.bandwidth_throttle_epoch);

        if elapsed < BANDWIDTH_THROTTLE_INTERVAL {
            return;
        }

        if self.outgoing_bandwidth == 0 && self.incoming_bandwidth == 0 {
            return;
        }

        self.bandwidth_throttle_epoch = time_current;

        let is_connected = |peer: &Endpoint| {
            matches!(
                peer.state,
                PeerState::Connected | PeerState::DisconnectLater
            )
        };

        let mut peers_remaining = self
            .peers
            .iter()
            .filter(|peer| is_connected(&peer.borrow()))
            .count() as u32;

        if peers_remaining == 0 {
            return;
        }

        let mut data_total = u32::MAX;
        let mut bandwidth = u32::MAX;
        let mut throttle;

        let mut needs_adjustment = self.peers.iter().any(|peer| {
            let peer = peer.borrow();
            is_connected(&peer) && peer.incoming_bandwidth != 0
        });

        if self.outgoing_bandwidth != 0 {
            data_total = 0;
            bandwidth = ((self.outgoing_bandwidth as u64 * elapsed as u64) / 1000) as u32;

            for peer in self.peers.iter() {
                let peer = peer.borrow();
                if is_connected(&peer) {
                    data_total = data_total.wrapping_add(peer.outgoing_data_total);
                }
            }
        }

        // Peers whose own receive cap is the bottleneck get an exact limit
        // and leave the pool; the rest share what remains.
        while peers_remaining > 0 && needs_adjustment {
            needs_adjustment = false;

            throttle = if data_total <= bandwidth {
                crate::endpoint::PACKET_THROTTLE_SCALE
            } else {
                ((bandwidth as u64 * crate::endpoint::PACKET_THROTTLE_SCALE as u64)
                    / data_total as u64) as u32
            };

            for peer in self.peers.iter() {
                let mut peer = peer.borrow_mut();

                if !is_connected(&peer)
                    || peer.incoming_bandwidth == 0
                    || peer.outgoing_bandwidth_throttle_epoch == time_current
                {
                    continue;
                }

                let peer_bandwidth =
                    ((peer.incoming_bandwidth as u64 * elapsed as u64) / 1000) as u32;
                if (throttle as u64 * peer.outgoing_data_total as u64)
                    / crate::endpoint::PACKET_THROTTLE_SCALE as u64
                    <= peer_bandwidth as u64
                {
                    continue;
                }

                peer.packet_throttle_limit = (((peer_bandwidth as u64)
                    * crate::endpoint::PACKET_THROTTLE_SCALE as u64)
                    / peer.outgoing_data_total as u64)
                    as u32;

                if peer.packet_throttle_limit == 0 {
                    peer.packet_throttle_limit = 1;
                }

                if peer.packet_throttle > peer.packet_throttle_limit {
                    peer.packet_throttle = peer.packet_throttle_limit;
                }

                peer.outgoing_bandwidth_throttle_epoch = time_current;
                peer.incoming_data_total = 0;
                peer.outgoing_data_total = 0;

                needs_adjustment = true;
                peers_remaining -= 1;
                bandwidth = bandwidth.wrapping_sub(peer_bandwidth);
                data_total = data_total.wrapping_sub(peer_bandwidth);
            }
        }

        if peers_remaining > 0 {
            throttle = if data_total <= bandwidth {
                crate::endpoint::PACKET_THROTTLE_SCALE
            } else {
                ((bandwidth as u64 * crate::endpoint::PACKET_THROTTLE_SCALE as u64)
                    / data_total as u64) as u32
            };

            for peer in self.peers.iter() {
                let mut peer = peer.borrow_mut();

                if !is_connected(&peer) || peer.outgoing_bandwidth_throttle_epoch == time_current {
                    continue;
                }

                peer.packet_throttle_limit = throttle;

                if peer.packet_throttle > peer.packet_throttle_limit {
                    peer.packet_throttle = peer.packet_throttle_limit;
                }

                peer.incoming_data_total = 0;
                peer.outgoing_data_total = 0;
            }
        }

        if self.recalculate_bandwidth_limits {
            self.recalculate_bandwidth_limits = false;

            let mut peers_remaining = self
                .peers
                .iter()
                .filter(|peer| is_connected(&peer.borrow()))
                .count() as u32;
            let mut bandwidth = self.incoming_bandwidth;
            let mut bandwidth_limit = 0;
            let mut needs_adjustment = true;

            if bandwidth != 0 {
                while peers_remaining > 0 && needs_adjustment {
                    needs_adjustment = false;
                    bandwidth_limit = bandwidth / peers_remaining;

                    for peer in self.peers.iter() {
                        let mut peer = peer.borrow_mut();

                        if !is_connected(&peer)
                            || peer.incoming_bandwidth_throttle_epoch == time_current
                        {
                            continue;
                        }

                        if peer.outgoing_bandwidth > 0
                            && peer.outgoing_bandwidth >= bandwidth_limit
                        {
                            continue;
                        }

                        peer.incoming_bandwidth_throttle_epoch = time_current;

                        needs_adjustment = true;
                        peers_remaining -= 1;
                        bandwidth -= peer.outgoing_bandwidth;
                    }
                }
            }

            for peer in self.peers.iter() {
                let mut peer = peer.borrow_mut();

                if !is_connected(&peer) {
                    continue;
                }

                let incoming_bandwidth =
                    if peer.incoming_bandwidth_throttle_epoch == time_current {
                        peer.outgoing_bandwidth
                    } else {
                        bandwidth_limit
                    };

                let command = Command {
                    header: CommandHeader {
                        flags: COMMAND_FLAG_ACKNOWLEDGE,
                        channel_id: CONTROL_CHANNEL_ID,
                        reliable_sequence_number: 0,
                    },
                    kind: CommandKind::BandwidthLimit {
                        incoming_bandwidth,
                        outgoing_bandwidth: self.outgoing_bandwidth,
                    },
                };
                peer.queue_outgoing_command(command, None, 0, 0);
            }
        }
    }

    /// Accepts an incoming connection request: allocates a free peer slot,
    /// negotiates MTU, window, and session ids, and queues the
    /// VERIFY_CONNECT reply.
    pub(crate) fn handle_connect(
        &mut self,
        received_address: Address,
        connect: &Connect,
    ) -> Option<usize> {
        let channel_count = connect.channel_count as usize;

        if !(MINIMUM_CHANNEL_COUNT..=MAXIMUM_CHANNEL_COUNT).contains(&channel_count) {
            return None;
        }

        let mut chosen = None;
        let mut duplicate_peers = 0;

        for (index, peer) in self.peers.iter().enumerate() {
            let peer = peer.borrow();

            if peer.state == PeerState::Disconnected {
                if chosen.is_none() {
                    chosen = Some(index);
                }
            } else if peer.state != PeerState::Connecting {
                if let Some(address) = peer.address {
                    if address.host() == received_address.host() {
                        if address.port() == received_address.port()
                            && peer.connect_id == connect.connect_id
                        {
                            // A retransmitted CONNECT for an already
                            // allocated connection.
                            return None;
                        }

                        duplicate_peers += 1;
                    }
                }
            }
        }

        let index = chosen?;

        if duplicate_peers >= self.duplicate_peers {
            debug!("refusing connect from {}: duplicate limit", received_address);
            return None;
        }

        let channel_count = channel_count.min(self.channel_limit);

        let peer_rc = Rc::clone(&self.peers[index]);
        let mut peer = peer_rc.borrow_mut();

        peer.channels = (0..channel_count).map(|_| Channel::new()).collect();
        peer.state = PeerState::AcknowledgingConnect;
        peer.connect_id = connect.connect_id;
        peer.address = Some(received_address);
        peer.outgoing_peer_id = connect.outgoing_peer_id;
        peer.incoming_bandwidth = connect.incoming_bandwidth;
        peer.outgoing_bandwidth = connect.outgoing_bandwidth;
        peer.packet_throttle_interval = connect.packet_throttle_interval;
        peer.packet_throttle_acceleration = connect.packet_throttle_acceleration;
        peer.packet_throttle_deceleration = connect.packet_throttle_deceleration;
        peer.event_data = connect.data;

        // Session ids advance from the client's proposal, skipping the
        // value currently in use so stale datagrams are recognizable; 0xFF
        // means "whatever the slot last used".
        let session_mask = (HEADER_SESSION_MASK >> HEADER_SESSION_SHIFT) as u8;

        let mut incoming_session_id = if connect.incoming_session_id == 0xFF {
            peer.outgoing_session_id
        } else {
            connect.incoming_session_id
        };
        incoming_session_id = incoming_session_id.wrapping_add(1) & session_mask;
        if incoming_session_id == peer.outgoing_session_id {
            incoming_session_id = incoming_session_id.wrapping_add(1) & session_mask;
        }
        peer.outgoing_session_id = incoming_session_id;

        let mut outgoing_session_id = if connect.outgoing_session_id == 0xFF {
            peer.incoming_session_id
        } else {
            connect.outgoing_session_id
        };
        outgoing_session_id = outgoing_session_id.wrapping_add(1) & session_mask;
        if outgoing_session_id == peer.incoming_session_id {
            outgoing_session_id = outgoing_session_id.wrapping_add(1) & session_mask;
        }
        peer.incoming_session_id = outgoing_session_id;

        peer.mtu = connect.mtu.clamp(MINIMUM_MTU, MAXIMUM_MTU);

        peer.window_size = negotiated_window_size(peer.incoming_bandwidth, self.outgoing_bandwidth);

        let mut window_size = if self.incoming_bandwidth == 0 {
            MAXIMUM_WINDOW_SIZE
        } else {
            (self.incoming_bandwidth / crate::endpoint::WINDOW_SIZE_SCALE) * MINIMUM_WINDOW_SIZE
        };

        if window_size > connect.window_size {
            window_size = connect.window_size;
        }

        let window_size = window_size.clamp(MINIMUM_WINDOW_SIZE, MAXIMUM_WINDOW_SIZE);

        debug!(
            "peer {}: accepting connect from {}, mtu {}, {} channels",
            peer.incoming_peer_id, received_address, peer.mtu, channel_count
        );

        let verify = Command {
            header: CommandHeader {
                flags: COMMAND_FLAG_ACKNOWLEDGE,
                channel_id: CONTROL_CHANNEL_ID,
                reliable_sequence_number: 0,
            },
            kind: CommandKind::VerifyConnect(VerifyConnect {
                outgoing_peer_id: peer.incoming_peer_id,
                incoming_session_id,
                outgoing_session_id,
                mtu: peer.mtu,
                window_size,
                channel_count: channel_count as u32,
                incoming_bandwidth: self.incoming_bandwidth,
                outgoing_bandwidth: self.outgoing_bandwidth,
                packet_throttle_interval: peer.packet_throttle_interval,
                packet_throttle_acceleration: peer.packet_throttle_acceleration,
                packet_throttle_deceleration: peer.packet_throttle_deceleration,
                connect_id: peer.connect_id,
            }),
        };
        peer.queue_outgoing_command(verify, None, 0, 0);

        Some(index)
    }
}

impl Drop for Host {
    fn drop(&mut self) {
        for peer in self.peers.iter() {
            peer.borrow_mut().reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connect_command(mtu: u32, connect_id: u32) -> Connect {
        Connect {
            outgoing_peer_id: 5,
            incoming_session_id: 0xFF,
            outgoing_session_id: 0xFF,
            mtu,
            window_size: 65536,
            channel_count: 2,
            incoming_bandwidth: 0,
            outgoing_bandwidth: 0,
            packet_throttle_interval: 5000,
            packet_throttle_acceleration: 2,
            packet_throttle_deceleration: 2,
            connect_id,
            data: 0,
        }
    }

    #[test]
    fn test_connect_negotiation_clamps_mtu() {
        let mut host = Host::new(None, 4, 2, 0, 0).unwrap();

        let index = host
            .handle_connect(Address::localhost(9000), &connect_command(100, 1))
            .unwrap();
        assert_eq!(host.peers[index].borrow().mtu, MINIMUM_MTU);

        let index = host
            .handle_connect(Address::localhost(9001), &connect_command(9000, 2))
            .unwrap();
        assert_eq!(host.peers[index].borrow().mtu, MAXIMUM_MTU);
    }

    #[test]
    fn test_duplicate_connect_rejected() {
        let mut host = Host::new(None, 4, 2, 0, 0).unwrap();
        let address = Address::localhost(9000);

        assert!(host
            .handle_connect(address, &connect_command(1400, 7))
            .is_some());

        // A second request with the same address and connect id is a
        // retransmission, not a new connection.
        assert!(host
            .handle_connect(address, &connect_command(1400, 7))
            .is_none());
    }

    #[test]
    fn test_channel_limit_caps_incoming_connections() {
        let mut host = Host::new(None, 4, 2, 0, 0).unwrap();

        let mut connect = connect_command(1400, 3);
        connect.channel_count = 5;

        let index = host
            .handle_connect(Address::localhost(9000), &connect)
            .unwrap();
        assert_eq!(host.peers[index].borrow().channels.len(), 2);
    }

    #[test]
    fn test_session_ids_advance_from_proposal() {
        let mut host = Host::new(None, 4, 2, 0, 0).unwrap();

        let mut connect = connect_command(1400, 4);
        connect.incoming_session_id = 1;
        connect.outgoing_session_id = 2;

        let index = host
            .handle_connect(Address::localhost(9000), &connect)
            .unwrap();

        let peer = host.peers[index].borrow();
        assert_eq!(peer.outgoing_session_id, 2);
        assert_eq!(peer.incoming_session_id, 3);
    }
}
