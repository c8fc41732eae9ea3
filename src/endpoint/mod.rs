
pub(crate) mod channel;

use crate::address::Address;
use crate::error::SendError;
use crate::packet;
use crate::packet::Packet;
use crate::protocol::*;
use crate::time;

use channel::Channel;
use channel::FREE_RELIABLE_WINDOWS;
use channel::RELIABLE_WINDOWS;
use channel::RELIABLE_WINDOW_SIZE;

use log::debug;
use log::trace;

use std::collections::VecDeque;

pub(crate) const DEFAULT_ROUND_TRIP_TIME: u32 = 500;
pub(crate) const DEFAULT_PACKET_THROTTLE: u32 = 32;
pub(crate) const PACKET_THROTTLE_SCALE: u32 = 32;
pub(crate) const PACKET_THROTTLE_COUNTER: u32 = 7;
pub(crate) const PACKET_THROTTLE_ACCELERATION: u32 = 2;
pub(crate) const PACKET_THROTTLE_DECELERATION: u32 = 2;
pub(crate) const PACKET_THROTTLE_INTERVAL: u32 = 5000;
pub(crate) const PACKET_LOSS_SCALE: u32 = 1 << 16;
pub(crate) const PACKET_LOSS_INTERVAL: u32 = 10000;
pub(crate) const WINDOW_SIZE_SCALE: u32 = 64 * 1024;
pub(crate) const TIMEOUT_LIMIT: u32 = 32;
pub(crate) const TIMEOUT_MINIMUM: u32 = 5000;
pub(crate) const TIMEOUT_MAXIMUM: u32 = 30000;
pub(crate) const PING_INTERVAL: u32 = 500;
pub(crate) const UNSEQUENCED_WINDOW_SIZE: u32 = 1024;
pub(crate) const FREE_UNSEQUENCED_WINDOWS: u32 = 32;

const UNSEQUENCED_WINDOW_WORDS: usize = (UNSEQUENCED_WINDOW_SIZE / 32) as usize;

/// The lifecycle state of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum PeerState {
    /// No connection; the slot is free.
    Disconnected,
    /// An outgoing connection request is in flight.
    Connecting,
    /// An incoming request was accepted; awaiting the acknowledgement of
    /// our verification.
    AcknowledgingConnect,
    /// Verified, with the connect event waiting in the dispatch queue.
    ConnectionPending,
    /// Verified on the initiating side, event pending dispatch.
    ConnectionSucceeded,
    /// Fully established.
    Connected,
    /// Draining queued outgoing data before disconnecting.
    DisconnectLater,
    /// A DISCONNECT was sent; awaiting its acknowledgement.
    Disconnecting,
    /// The remote host requested disconnection; the acknowledgement is on
    /// its way out.
    AcknowledgingDisconnect,
    /// Dead, but owing the application a final event.
    Zombie,
}

/// Signals that parsing of the current datagram must stop. Peer state is
/// kept; the event buffer may already hold an event.
#[derive(Debug)]
pub(crate) struct CommandError;

/// An event produced while handling commands, minus the peer handle (the
/// host attaches it).
#[derive(Debug)]
pub(crate) enum ProtocolEvent {
    Connect { data: u32 },
    Disconnect { data: u32 },
    Timeout,
}

/// Outcome of the retransmission scan for one peer.
pub(crate) enum TimeoutCheck {
    Alive,
    /// The peer exceeded its timeout envelope and was reset. Carries the
    /// event to surface, if the peer had progressed far enough to warrant
    /// one.
    Dropped(Option<ProtocolEvent>),
}

/// Host-owned state that endpoint handlers need to reach.
pub(crate) struct HostCtx<'a> {
    pub service_time: u32,
    pub maximum_waiting_data: usize,
    pub outgoing_bandwidth: u32,
    pub recalculate_bandwidth_limits: &'a mut bool,
    pub dispatch_queue: &'a mut VecDeque<usize>,
}

pub(crate) struct Acknowledgement {
    pub sent_time: u16,
    pub command_tag: u8,
    pub channel_id: u8,
    pub reliable_sequence_number: u16,
}

pub(crate) struct OutgoingCommand {
    pub command: Command,
    pub packet: Option<Packet>,
    pub fragment_offset: u32,
    pub fragment_length: u16,
    pub unreliable_sequence_number: u16,
    pub send_attempts: u16,
    pub sent_time: u32,
    pub round_trip_timeout: u32,
    pub round_trip_timeout_limit: u32,
}

impl OutgoingCommand {
    fn new(command: Command, packet: Option<Packet>, offset: u32, length: u16) -> Self {
        Self {
            command,
            packet,
            fragment_offset: offset,
            fragment_length: length,
            unreliable_sequence_number: 0,
            send_attempts: 0,
            sent_time: 0,
            round_trip_timeout: 0,
            round_trip_timeout_limit: 0,
        }
    }
}

pub(crate) struct IncomingCommand {
    pub command_tag: u8,
    pub channel_id: u8,
    pub reliable_sequence_number: u16,
    pub unreliable_sequence_number: u16,
    pub fragment_count: u32,
    pub fragments_remaining: u32,
    pub fragments: Vec<u32>,
    pub data: Box<[u8]>,
    pub flags: u32,
}

enum QueueResult {
    Queued,
    /// Silently dropped (duplicate or stale); not an error.
    Discarded,
    /// The command could not be accepted; parsing of the datagram stops.
    Refused,
}

enum FindFragment {
    Found(usize),
    NotFound,
    Mismatch,
}

/// The per-peer protocol machine. One `Endpoint` lives in each host peer
/// slot, shared between the host and any application-facing handles; the
/// host drives it with a `HostCtx` for anything that crosses back into
/// host state.
pub(crate) struct Endpoint {
    pub incoming_peer_id: u16,
    pub outgoing_peer_id: u16,
    pub incoming_session_id: u8,
    pub outgoing_session_id: u8,
    pub address: Option<Address>,
    pub state: PeerState,
    pub connect_id: u32,
    pub channels: Vec<Channel>,

    pub mtu: u32,
    pub window_size: u32,
    pub incoming_bandwidth: u32,
    pub outgoing_bandwidth: u32,
    pub incoming_bandwidth_throttle_epoch: u32,
    pub outgoing_bandwidth_throttle_epoch: u32,
    pub incoming_data_total: u32,
    pub outgoing_data_total: u32,
    pub total_data_sent: u64,
    pub total_data_received: u64,

    pub last_send_time: u32,
    pub last_receive_time: u32,
    pub next_timeout: u32,
    pub earliest_timeout: u32,
    pub packet_loss_epoch: u32,
    pub packets_sent: u32,
    pub total_packets_sent: u64,
    pub packets_lost: u32,
    pub total_packets_lost: u32,
    pub packet_loss: u32,
    pub packet_loss_variance: u32,

    pub packet_throttle: u32,
    pub packet_throttle_limit: u32,
    pub packet_throttle_counter: u32,
    pub packet_throttle_epoch: u32,
    pub packet_throttle_acceleration: u32,
    pub packet_throttle_deceleration: u32,
    pub packet_throttle_interval: u32,

    pub ping_interval: u32,
    pub timeout_limit: u32,
    pub timeout_minimum: u32,
    pub timeout_maximum: u32,

    pub round_trip_time: u32,
    pub round_trip_time_variance: u32,
    pub last_round_trip_time: u32,
    pub lowest_round_trip_time: u32,
    pub last_round_trip_time_variance: u32,
    pub highest_round_trip_time_variance: u32,

    pub reliable_data_in_transit: u32,
    pub outgoing_reliable_sequence_number: u16,
    pub incoming_unsequenced_group: u16,
    pub outgoing_unsequenced_group: u16,
    pub unsequenced_window: [u32; UNSEQUENCED_WINDOW_WORDS],
    pub event_data: u32,
    pub total_waiting_data: usize,
    pub needs_dispatch: bool,
    /// Armed by the disconnect family: the host sends whatever is queued
    /// on its next pass and then resets the slot without an event.
    pub flush_then_reset: bool,

    pub acknowledgements: VecDeque<Acknowledgement>,
    pub sent_reliable_commands: VecDeque<OutgoingCommand>,
    pub outgoing_reliable_commands: VecDeque<OutgoingCommand>,
    pub outgoing_unreliable_commands: VecDeque<OutgoingCommand>,
    pub dispatched_commands: VecDeque<IncomingCommand>,

    // Mirrored host configuration, so that application-facing calls on a
    // shared handle need no host access.
    pub host_mtu: u32,
    pub maximum_packet_size: usize,
    pub checksum_bytes: usize,
}

impl Endpoint {
    pub fn new(incoming_peer_id: u16, host_mtu: u32, maximum_packet_size: usize) -> Self {
        let mut endpoint = Self {
            incoming_peer_id,
            outgoing_peer_id: MAXIMUM_PEER_ID,
            incoming_session_id: 0xFF,
            outgoing_session_id: 0xFF,
            address: None,
            state: PeerState::Disconnected,
            connect_id: 0,
            channels: Vec::new(),

            mtu: host_mtu,
            window_size: MAXIMUM_WINDOW_SIZE,
            incoming_bandwidth: 0,
            outgoing_bandwidth: 0,
            incoming_bandwidth_throttle_epoch: 0,
            outgoing_bandwidth_throttle_epoch: 0,
            incoming_data_total: 0,
            outgoing_data_total: 0,
            total_data_sent: 0,
            total_data_received: 0,

            last_send_time: 0,
            last_receive_time: 0,
            next_timeout: 0,
            earliest_timeout: 0,
            packet_loss_epoch: 0,
            packets_sent: 0,
            total_packets_sent: 0,
            packets_lost: 0,
            total_packets_lost: 0,
            packet_loss: 0,
            packet_loss_variance: 0,

            packet_throttle: DEFAULT_PACKET_THROTTLE,
            packet_throttle_limit: PACKET_THROTTLE_SCALE,
            packet_throttle_counter: 0,
            packet_throttle_epoch: 0,
            packet_throttle_acceleration: PACKET_THROTTLE_ACCELERATION,
            packet_throttle_deceleration: PACKET_THROTTLE_DECELERATION,
            packet_throttle_interval: PACKET_THROTTLE_INTERVAL,

            ping_interval: PING_INTERVAL,
            timeout_limit: TIMEOUT_LIMIT,
            timeout_minimum: TIMEOUT_MINIMUM,
            timeout_maximum: TIMEOUT_MAXIMUM,

            round_trip_time: DEFAULT_ROUND_TRIP_TIME,
            round_trip_time_variance: 0,
            last_round_trip_time: DEFAULT_ROUND_TRIP_TIME,
            lowest_round_trip_time: DEFAULT_ROUND_TRIP_TIME,
            last_round_trip_time_variance: 0,
            highest_round_trip_time_variance: 0,

            reliable_data_in_transit: 0,
            outgoing_reliable_sequence_number: 0,
            incoming_unsequenced_group: 0,
            outgoing_unsequenced_group: 0,
            unsequenced_window: [0; UNSEQUENCED_WINDOW_WORDS],
            event_data: 0,
            total_waiting_data: 0,
            needs_dispatch: false,
            flush_then_reset: false,

            acknowledgements: VecDeque::new(),
            sent_reliable_commands: VecDeque::new(),
            outgoing_reliable_commands: VecDeque::new(),
            outgoing_unreliable_commands: VecDeque::new(),
            dispatched_commands: VecDeque::new(),

            host_mtu,
            maximum_packet_size,
            checksum_bytes: 0,
        };

        endpoint.reset();
        endpoint
    }

    /// Returns the peer to `Disconnected` and releases every queue. The
    /// connect id survives so the application can correlate the final event
    /// with the original connect; session ids survive so a reconnect on the
    /// same slot advances them.
    pub fn reset(&mut self) {
        self.outgoing_peer_id = MAXIMUM_PEER_ID;
        self.state = PeerState::Disconnected;
        self.incoming_bandwidth = 0;
        self.outgoing_bandwidth = 0;
        self.incoming_bandwidth_throttle_epoch = 0;
        self.outgoing_bandwidth_throttle_epoch = 0;
        self.incoming_data_total = 0;
        self.total_data_received = 0;
        self.outgoing_data_total = 0;
        self.total_data_sent = 0;
        self.last_send_time = 0;
        self.last_receive_time = 0;
        self.next_timeout = 0;
        self.earliest_timeout = 0;
        self.packet_loss_epoch = 0;
        self.packets_sent = 0;
        self.total_packets_sent = 0;
        self.packets_lost = 0;
        self.total_packets_lost = 0;
        self.packet_loss = 0;
        self.packet_loss_variance = 0;
        self.packet_throttle = DEFAULT_PACKET_THROTTLE;
        self.packet_throttle_limit = PACKET_THROTTLE_SCALE;
        self.packet_throttle_counter = 0;
        self.packet_throttle_epoch = 0;
        self.packet_throttle_acceleration = PACKET_THROTTLE_ACCELERATION;
        self.packet_throttle_deceleration = PACKET_THROTTLE_DECELERATION;
        self.packet_throttle_interval = PACKET_THROTTLE_INTERVAL;
        self.ping_interval = PING_INTERVAL;
        self.timeout_limit = TIMEOUT_LIMIT;
        self.timeout_minimum = TIMEOUT_MINIMUM;
        self.timeout_maximum = TIMEOUT_MAXIMUM;
        self.last_round_trip_time = DEFAULT_ROUND_TRIP_TIME;
        self.lowest_round_trip_time = DEFAULT_ROUND_TRIP_TIME;
        self.last_round_trip_time_variance = 0;
        self.highest_round_trip_time_variance = 0;
        self.round_trip_time = DEFAULT_ROUND_TRIP_TIME;
        self.round_trip_time_variance = 0;
        self.mtu = self.host_mtu;
        self.reliable_data_in_transit = 0;
        self.outgoing_reliable_sequence_number = 0;
        self.window_size = MAXIMUM_WINDOW_SIZE;
        self.incoming_unsequenced_group = 0;
        self.outgoing_unsequenced_group = 0;
        self.event_data = 0;
        self.total_waiting_data = 0;
        self.unsequenced_window = [0; UNSEQUENCED_WINDOW_WORDS];
        self.flush_then_reset = false;

        self.reset_queues();
    }

    pub fn reset_queues(&mut self) {
        self.needs_dispatch = false;
        self.acknowledgements.clear();
        self.sent_reliable_commands.clear();
        self.outgoing_reliable_commands.clear();
        self.outgoing_unreliable_commands.clear();
        self.dispatched_commands.clear();
        self.channels.clear();
    }

    fn change_state(&mut self, state: PeerState) {
        trace!(
            "peer {}: {:?} -> {:?}",
            self.incoming_peer_id,
            self.state,
            state
        );
        self.state = state;
    }

    pub(crate) fn dispatch_state(&mut self, ctx: &mut HostCtx, state: PeerState) {
        self.change_state(state);
        self.mark_dispatch(ctx);
    }

    fn mark_dispatch(&mut self, ctx: &mut HostCtx) {
        if !self.needs_dispatch {
            ctx.dispatch_queue.push_back(self.incoming_peer_id as usize);
            self.needs_dispatch = true;
        }
    }

    // ------------------------------------------------------------------
    // Outgoing path
    // ------------------------------------------------------------------

    /// Assigns sequence numbers to a freshly queued command and appends it
    /// to the reliable or unreliable outgoing queue. The control channel
    /// (0xFF) sequences against a peer-global counter.
    pub fn setup_outgoing_command(&mut self, mut command: OutgoingCommand) {
        self.outgoing_data_total = self
            .outgoing_data_total
            .wrapping_add((command.command.size() + command.fragment_length as usize) as u32);

        if command.command.header.channel_id == CONTROL_CHANNEL_ID {
            self.outgoing_reliable_sequence_number =
                self.outgoing_reliable_sequence_number.wrapping_add(1);

            command.command.header.reliable_sequence_number =
                self.outgoing_reliable_sequence_number;
            command.unreliable_sequence_number = 0;
        } else if command.command.header.flags & COMMAND_FLAG_ACKNOWLEDGE != 0 {
            let channel = &mut self.channels[command.command.header.channel_id as usize];

            channel.outgoing_reliable_sequence_number =
                channel.outgoing_reliable_sequence_number.wrapping_add(1);
            channel.outgoing_unreliable_sequence_number = 0;

            command.command.header.reliable_sequence_number =
                channel.outgoing_reliable_sequence_number;
            command.unreliable_sequence_number = 0;
        } else if command.command.header.flags & COMMAND_FLAG_UNSEQUENCED != 0 {
            self.outgoing_unsequenced_group = self.outgoing_unsequenced_group.wrapping_add(1);

            command.command.header.reliable_sequence_number = 0;
            command.unreliable_sequence_number = 0;
        } else {
            let channel = &mut self.channels[command.command.header.channel_id as usize];

            if command.fragment_offset == 0 {
                channel.outgoing_unreliable_sequence_number =
                    channel.outgoing_unreliable_sequence_number.wrapping_add(1);
            }

            command.command.header.reliable_sequence_number =
                channel.outgoing_reliable_sequence_number;
            command.unreliable_sequence_number = channel.outgoing_unreliable_sequence_number;
        }

        command.send_attempts = 0;
        command.sent_time = 0;
        command.round_trip_timeout = 0;
        command.round_trip_timeout_limit = 0;

        let assigned_unreliable = command.unreliable_sequence_number;
        let assigned_group = self.outgoing_unsequenced_group;
        match &mut command.command.kind {
            CommandKind::SendUnreliable {
                unreliable_sequence_number,
                ..
            } => {
                *unreliable_sequence_number = assigned_unreliable;
            }
            CommandKind::SendUnsequenced {
                unsequenced_group, ..
            } => {
                *unsequenced_group = assigned_group;
            }
            _ => {}
        }

        if command.command.header.flags & COMMAND_FLAG_ACKNOWLEDGE != 0 {
            self.outgoing_reliable_commands.push_back(command);
        } else {
            self.outgoing_unreliable_commands.push_back(command);
        }
    }

    pub fn queue_outgoing_command(
        &mut self,
        command: Command,
        packet: Option<Packet>,
        offset: u32,
        length: u16,
    ) {
        self.setup_outgoing_command(OutgoingCommand::new(command, packet, offset, length));
    }

    fn control_command(&self, flags: u8, kind: CommandKind) -> Command {
        Command {
            header: CommandHeader {
                flags,
                channel_id: CONTROL_CHANNEL_ID,
                reliable_sequence_number: 0,
            },
            kind,
        }
    }

    /// Enqueues a packet for delivery on the given channel. The packet's
    /// flags select the pipeline; payloads larger than one fragment are
    /// split into a fragment set sharing the packet.
    pub fn send(&mut self, channel_id: u8, packet: &Packet) -> Result<(), SendError> {
        if self.state != PeerState::Connected {
            return Err(SendError::NotConnected);
        }
        if channel_id as usize >= self.channels.len() {
            return Err(SendError::InvalidChannel(channel_id));
        }
        if packet.len() > self.maximum_packet_size {
            return Err(SendError::PacketTooLarge);
        }

        let fragment_length = self.mtu as usize
            - serial::HEADER_SIZE_SENT_TIME
            - command_size(COMMAND_SEND_FRAGMENT)
            - self.checksum_bytes;

        if packet.len() > fragment_length {
            let fragment_count = (packet.len() + fragment_length - 1) / fragment_length;

            if fragment_count > MAXIMUM_FRAGMENT_COUNT as usize {
                return Err(SendError::TooManyFragments);
            }

            let channel = &self.channels[channel_id as usize];

            let unreliable = packet.flags()
                & (packet::FLAG_RELIABLE | packet::FLAG_UNRELIABLE_FRAGMENT)
                == packet::FLAG_UNRELIABLE_FRAGMENT
                && channel.outgoing_unreliable_sequence_number < 0xFFFF;

            let (flags, start_sequence_number) = if unreliable {
                (
                    0,
                    channel.outgoing_unreliable_sequence_number.wrapping_add(1),
                )
            } else {
                (
                    COMMAND_FLAG_ACKNOWLEDGE,
                    channel.outgoing_reliable_sequence_number.wrapping_add(1),
                )
            };

            let mut fragment_offset = 0;
            let mut fragment_number = 0;

            while fragment_offset < packet.len() {
                let length = fragment_length.min(packet.len() - fragment_offset);

                let fragment = SendFragment {
                    start_sequence_number,
                    data_length: length as u16,
                    fragment_count: fragment_count as u32,
                    fragment_number,
                    total_length: packet.len() as u32,
                    fragment_offset: fragment_offset as u32,
                };

                let kind = if unreliable {
                    CommandKind::SendUnreliableFragment(fragment)
                } else {
                    CommandKind::SendFragment(fragment)
                };

                let command = Command {
                    header: CommandHeader {
                        flags,
                        channel_id,
                        reliable_sequence_number: 0,
                    },
                    kind,
                };

                self.setup_outgoing_command(OutgoingCommand::new(
                    command,
                    Some(packet.clone()),
                    fragment_offset as u32,
                    length as u16,
                ));

                fragment_offset += length;
                fragment_number += 1;
            }

            return Ok(());
        }

        let channel = &self.channels[channel_id as usize];

        let (flags, kind) = if packet.flags() & (packet::FLAG_RELIABLE | packet::FLAG_UNSEQUENCED)
            == packet::FLAG_UNSEQUENCED
        {
            (
                COMMAND_FLAG_UNSEQUENCED,
                CommandKind::SendUnsequenced {
                    unsequenced_group: 0,
                    data_length: packet.len() as u16,
                },
            )
        } else if packet.flags() & packet::FLAG_RELIABLE != 0
            || channel.outgoing_unreliable_sequence_number >= 0xFFFF
        {
            (
                COMMAND_FLAG_ACKNOWLEDGE,
                CommandKind::SendReliable {
                    data_length: packet.len() as u16,
                },
            )
        } else {
            (
                0,
                CommandKind::SendUnreliable {
                    unreliable_sequence_number: 0,
                    data_length: packet.len() as u16,
                },
            )
        };

        let command = Command {
            header: CommandHeader {
                flags,
                channel_id,
                reliable_sequence_number: 0,
            },
            kind,
        };

        let length = packet.len() as u16;
        self.queue_outgoing_command(command, Some(packet.clone()), 0, length);

        Ok(())
    }

    /// Removes the next delivered command, converting it into an
    /// application packet.
    pub fn receive(&mut self) -> Option<(u8, Packet)> {
        let command = self.dispatched_commands.pop_front()?;

        self.total_waiting_data = self.total_waiting_data.saturating_sub(command.data.len());

        let channel_id = command.channel_id;
        let packet = Packet::from_box(command.data, command.flags);

        Some((channel_id, packet))
    }

    pub fn ping(&mut self) {
        if self.state != PeerState::Connected {
            return;
        }

        let command = self.control_command(COMMAND_FLAG_ACKNOWLEDGE, CommandKind::Ping);
        self.queue_outgoing_command(command, None, 0, 0);
    }

    pub fn set_ping_interval(&mut self, ping_interval: u32) {
        self.ping_interval = if ping_interval != 0 {
            ping_interval
        } else {
            PING_INTERVAL
        };
    }

    pub fn set_timeout(&mut self, limit: u32, minimum: u32, maximum: u32) {
        self.timeout_limit = if limit != 0 { limit } else { TIMEOUT_LIMIT };
        self.timeout_minimum = if minimum != 0 { minimum } else { TIMEOUT_MINIMUM };
        self.timeout_maximum = if maximum != 0 { maximum } else { TIMEOUT_MAXIMUM };
    }

    /// Reconfigures the throttle parameters and informs the remote end.
    pub fn throttle_configure(&mut self, interval: u32, acceleration: u32, deceleration: u32) {
        self.packet_throttle_interval = interval;
        self.packet_throttle_acceleration = acceleration;
        self.packet_throttle_deceleration = deceleration;

        let command = self.control_command(
            COMMAND_FLAG_ACKNOWLEDGE,
            CommandKind::ThrottleConfigure {
                packet_throttle_interval: interval,
                packet_throttle_acceleration: acceleration,
                packet_throttle_deceleration: deceleration,
            },
        );
        self.queue_outgoing_command(command, None, 0, 0);
    }

    /// Adjusts the packet throttle from one RTT sample. Returns +1 on
    /// acceleration, -1 on deceleration, 0 when unchanged.
    pub fn throttle(&mut self, round_trip_time: u32) -> i32 {
        if self.last_round_trip_time <= self.last_round_trip_time_variance {
            self.packet_throttle = self.packet_throttle_limit;
        } else if round_trip_time < self.last_round_trip_time {
            self.packet_throttle = (self.packet_throttle + self.packet_throttle_acceleration)
                .min(self.packet_throttle_limit);
            return 1;
        } else if round_trip_time
            > self.last_round_trip_time + 2 * self.last_round_trip_time_variance
        {
            self.packet_throttle = self
                .packet_throttle
                .saturating_sub(self.packet_throttle_deceleration);
            return -1;
        }

        0
    }

    // ------------------------------------------------------------------
    // Disconnection
    // ------------------------------------------------------------------

    /// Requests a graceful disconnection. When connected, a reliable
    /// DISCONNECT is queued and the peer waits for its acknowledgement;
    /// otherwise an unsequenced DISCONNECT goes out on the next service
    /// tick and the slot is reset.
    pub fn disconnect(&mut self, data: u32) {
        if matches!(
            self.state,
            PeerState::Disconnecting
                | PeerState::Disconnected
                | PeerState::AcknowledgingDisconnect
                | PeerState::Zombie
        ) {
            return;
        }

        self.reset_queues();

        let connected = matches!(
            self.state,
            PeerState::Connected | PeerState::DisconnectLater
        );
        let flags = if connected {
            COMMAND_FLAG_ACKNOWLEDGE
        } else {
            COMMAND_FLAG_UNSEQUENCED
        };

        let command = self.control_command(flags, CommandKind::Disconnect { data });
        self.queue_outgoing_command(command, None, 0, 0);

        if connected {
            self.change_state(PeerState::Disconnecting);
        } else {
            self.flush_then_reset = true;
        }
    }

    /// Tears the connection down without waiting for an acknowledgement.
    /// The DISCONNECT notification is sent once, on the next service tick.
    pub fn disconnect_now(&mut self, data: u32) {
        if self.state == PeerState::Disconnected {
            return;
        }

        if self.state != PeerState::Zombie && self.state != PeerState::Disconnecting {
            self.reset_queues();

            let command =
                self.control_command(COMMAND_FLAG_UNSEQUENCED, CommandKind::Disconnect { data });
            self.queue_outgoing_command(command, None, 0, 0);

            self.flush_then_reset = true;
        } else {
            self.reset();
        }
    }

    /// Disconnects once every queued outgoing packet has been delivered.
    pub fn disconnect_later(&mut self, data: u32) {
        if matches!(
            self.state,
            PeerState::Connected | PeerState::DisconnectLater
        ) && !(self.outgoing_reliable_commands.is_empty()
            && self.outgoing_unreliable_commands.is_empty()
            && self.sent_reliable_commands.is_empty())
        {
            self.change_state(PeerState::DisconnectLater);
            self.event_data = data;
        } else {
            self.disconnect(data);
        }
    }

    // ------------------------------------------------------------------
    // Notifications
    // ------------------------------------------------------------------

    pub fn notify_connect(&mut self, ctx: &mut HostCtx) -> ProtocolEvent {
        *ctx.recalculate_bandwidth_limits = true;

        self.change_state(PeerState::Connected);

        self.total_data_sent = 0;
        self.total_data_received = 0;
        self.total_packets_sent = 0;
        self.total_packets_lost = 0;

        ProtocolEvent::Connect {
            data: self.event_data,
        }
    }

    fn notify_disconnect(&mut self, ctx: &mut HostCtx) -> Option<ProtocolEvent> {
        if self.state >= PeerState::ConnectionPending {
            *ctx.recalculate_bandwidth_limits = true;
        }

        if self.state != PeerState::Connecting && self.state < PeerState::ConnectionSucceeded {
            // The connection never completed; no event is owed.
            self.reset();
            None
        } else {
            self.reset();
            Some(ProtocolEvent::Disconnect { data: 0 })
        }
    }

    fn notify_disconnect_timeout(&mut self, ctx: &mut HostCtx) -> Option<ProtocolEvent> {
        if self.state >= PeerState::ConnectionPending {
            *ctx.recalculate_bandwidth_limits = true;
        }

        if self.state != PeerState::Connecting && self.state < PeerState::ConnectionSucceeded {
            self.reset();
            None
        } else {
            self.reset();
            Some(ProtocolEvent::Timeout)
        }
    }

    // ------------------------------------------------------------------
    // Acknowledgements and retransmission
    // ------------------------------------------------------------------

    pub fn queue_acknowledgement(
        &mut self,
        command_tag: u8,
        channel_id: u8,
        reliable_sequence_number: u16,
        sent_time: u16,
    ) {
        self.outgoing_data_total = self
            .outgoing_data_total
            .wrapping_add(command_size(COMMAND_ACKNOWLEDGE) as u32);

        self.acknowledgements.push_back(Acknowledgement {
            sent_time,
            command_tag,
            channel_id,
            reliable_sequence_number,
        });
    }

    /// Locates and removes the acknowledged command, releasing its window
    /// slot and in-transit budget. Returns the command's tag.
    fn remove_sent_reliable_command(
        &mut self,
        reliable_sequence_number: u16,
        channel_id: u8,
    ) -> Option<u8> {
        let mut was_sent = true;

        let position = self.sent_reliable_commands.iter().position(|command| {
            command.command.header.reliable_sequence_number == reliable_sequence_number
                && command.command.header.channel_id == channel_id
        });

        let command = match position {
            Some(index) => self.sent_reliable_commands.remove(index).unwrap(),
            None => {
                // The command may have been moved back for retransmission.
                // Entries that were never transmitted terminate the search:
                // the queue keeps retransmissions ahead of fresh commands.
                let mut found = None;
                for (index, command) in self.outgoing_reliable_commands.iter().enumerate() {
                    if command.send_attempts < 1 {
                        return None;
                    }
                    if command.command.header.reliable_sequence_number == reliable_sequence_number
                        && command.command.header.channel_id == channel_id
                    {
                        found = Some(index);
                        break;
                    }
                }

                was_sent = false;
                self.outgoing_reliable_commands.remove(found?).unwrap()
            }
        };

        if (channel_id as usize) < self.channels.len() {
            self.channels[channel_id as usize].release_reliable_window(reliable_sequence_number);
        }

        let tag = command.command.kind.tag();

        if command.packet.is_some() && was_sent {
            self.reliable_data_in_transit = self
                .reliable_data_in_transit
                .saturating_sub(command.fragment_length as u32);
        }

        drop(command);

        if let Some(front) = self.sent_reliable_commands.front() {
            self.next_timeout = front.sent_time.wrapping_add(front.round_trip_timeout);
        }

        Some(tag)
    }

    pub fn handle_acknowledge(
        &mut self,
        ctx: &mut HostCtx,
        channel_id: u8,
        received_reliable_sequence_number: u16,
        received_sent_time: u16,
    ) -> Result<Option<ProtocolEvent>, CommandError> {
        if matches!(self.state, PeerState::Disconnected | PeerState::Zombie) {
            return Ok(None);
        }

        // The peer echoed only the low 16 bits of our send time; recompose
        // against the current clock, accounting for rollover in between.
        let mut received_sent_time = received_sent_time as u32 | (ctx.service_time & 0xFFFF_0000);
        if (received_sent_time & 0x8000) > (ctx.service_time & 0x8000) {
            received_sent_time = received_sent_time.wrapping_sub(0x10000);
        }

        if time::time_less(ctx.service_time, received_sent_time) {
            return Ok(None);
        }

        self.last_receive_time = ctx.service_time;
        self.earliest_timeout = 0;

        let round_trip_time = time::time_difference(ctx.service_time, received_sent_time);

        self.throttle(round_trip_time);

        self.round_trip_time_variance -= self.round_trip_time_variance / 4;

        if round_trip_time >= self.round_trip_time {
            self.round_trip_time += (round_trip_time - self.round_trip_time) / 8;
            self.round_trip_time_variance += (round_trip_time - self.round_trip_time) / 4;
        } else {
            self.round_trip_time -= (self.round_trip_time - round_trip_time) / 8;
            self.round_trip_time_variance += (self.round_trip_time - round_trip_time) / 4;
        }

        if self.round_trip_time < self.lowest_round_trip_time {
            self.lowest_round_trip_time = self.round_trip_time;
        }
        if self.round_trip_time_variance > self.highest_round_trip_time_variance {
            self.highest_round_trip_time_variance = self.round_trip_time_variance;
        }

        if self.packet_throttle_epoch == 0
            || time::time_difference(ctx.service_time, self.packet_throttle_epoch)
                >= self.packet_throttle_interval
        {
            self.last_round_trip_time = self.lowest_round_trip_time;
            self.last_round_trip_time_variance = self.highest_round_trip_time_variance;
            self.lowest_round_trip_time = self.round_trip_time;
            self.highest_round_trip_time_variance = self.round_trip_time_variance;
            self.packet_throttle_epoch = ctx.service_time;
        }

        let command_tag =
            self.remove_sent_reliable_command(received_reliable_sequence_number, channel_id);

        match self.state {
            PeerState::AcknowledgingConnect => {
                if command_tag != Some(COMMAND_VERIFY_CONNECT) {
                    return Err(CommandError);
                }
                Ok(Some(self.notify_connect(ctx)))
            }
            PeerState::Disconnecting => {
                if command_tag != Some(COMMAND_DISCONNECT) {
                    return Err(CommandError);
                }
                Ok(self.notify_disconnect(ctx))
            }
            PeerState::DisconnectLater => {
                if self.outgoing_reliable_commands.is_empty()
                    && self.outgoing_unreliable_commands.is_empty()
                    && self.sent_reliable_commands.is_empty()
                {
                    self.disconnect(self.event_data);
                }
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    /// Scans sent reliable commands for retransmission. Commands past their
    /// round-trip timeout move back to the head of the outgoing queue with
    /// a refreshed timeout; a peer whose earliest outstanding send exceeds
    /// the timeout envelope is dropped.
    pub fn check_timeouts(&mut self, ctx: &mut HostCtx) -> TimeoutCheck {
        let mut requeued: Vec<OutgoingCommand> = Vec::new();
        let mut index = 0;

        while index < self.sent_reliable_commands.len() {
            let command = &self.sent_reliable_commands[index];

            if time::time_difference(ctx.service_time, command.sent_time)
                < command.round_trip_timeout
            {
                index += 1;
                continue;
            }

            if self.earliest_timeout == 0
                || time::time_less(command.sent_time, self.earliest_timeout)
            {
                self.earliest_timeout = command.sent_time;
            }

            let elapsed = time::time_difference(ctx.service_time, self.earliest_timeout);
            if self.earliest_timeout != 0
                && (elapsed >= self.timeout_maximum
                    || (command.round_trip_timeout >= command.round_trip_timeout_limit
                        && elapsed >= self.timeout_minimum))
            {
                debug!(
                    "peer {}: timed out after {} ms",
                    self.incoming_peer_id, elapsed
                );
                // Requeued commands are discarded with the rest of the
                // queues during reset.
                return TimeoutCheck::Dropped(self.notify_disconnect_timeout(ctx));
            }

            let mut command = self.sent_reliable_commands.remove(index).unwrap();

            if command.packet.is_some() {
                self.reliable_data_in_transit = self
                    .reliable_data_in_transit
                    .saturating_sub(command.fragment_length as u32);
            }

            self.packets_lost += 1;
            self.total_packets_lost += 1;

            // Linear backoff: refresh from the current estimate rather than
            // doubling.
            command.round_trip_timeout = self.round_trip_time + 4 * self.round_trip_time_variance;
            command.round_trip_timeout_limit = self.timeout_limit * command.round_trip_timeout;

            requeued.push(command);
        }

        if !requeued.is_empty() {
            for command in requeued.into_iter().rev() {
                self.outgoing_reliable_commands.push_front(command);
            }

            if let Some(front) = self.sent_reliable_commands.front() {
                self.next_timeout = front.sent_time.wrapping_add(front.round_trip_timeout);
            }
        }

        TimeoutCheck::Alive
    }

    // ------------------------------------------------------------------
    // Incoming command handlers
    // ------------------------------------------------------------------

    fn channel_valid(&self, channel_id: u8) -> bool {
        (channel_id as usize) < self.channels.len()
            && matches!(
                self.state,
                PeerState::Connected | PeerState::DisconnectLater
            )
    }

    pub fn handle_ping(&mut self) -> Result<(), CommandError> {
        if !matches!(
            self.state,
            PeerState::Connected | PeerState::DisconnectLater
        ) {
            return Err(CommandError);
        }
        Ok(())
    }

    pub fn handle_throttle_configure(
        &mut self,
        interval: u32,
        acceleration: u32,
        deceleration: u32,
    ) -> Result<(), CommandError> {
        if !matches!(
            self.state,
            PeerState::Connected | PeerState::DisconnectLater
        ) {
            return Err(CommandError);
        }

        self.packet_throttle_interval = interval;
        self.packet_throttle_acceleration = acceleration;
        self.packet_throttle_deceleration = deceleration;

        Ok(())
    }

    pub fn handle_bandwidth_limit(
        &mut self,
        ctx: &mut HostCtx,
        incoming_bandwidth: u32,
        outgoing_bandwidth: u32,
    ) -> Result<(), CommandError> {
        if !matches!(
            self.state,
            PeerState::Connected | PeerState::DisconnectLater
        ) {
            return Err(CommandError);
        }

        self.incoming_bandwidth = incoming_bandwidth;
        self.outgoing_bandwidth = outgoing_bandwidth;

        self.window_size = negotiated_window_size(self.incoming_bandwidth, ctx.outgoing_bandwidth);

        Ok(())
    }

    pub fn handle_disconnect(
        &mut self,
        ctx: &mut HostCtx,
        flags: u8,
        data: u32,
    ) -> Result<(), CommandError> {
        if matches!(
            self.state,
            PeerState::Disconnected | PeerState::Zombie | PeerState::AcknowledgingDisconnect
        ) {
            return Ok(());
        }

        self.reset_queues();

        if matches!(
            self.state,
            PeerState::ConnectionSucceeded | PeerState::Disconnecting | PeerState::Connecting
        ) {
            self.dispatch_state(ctx, PeerState::Zombie);
        } else if !matches!(
            self.state,
            PeerState::Connected | PeerState::DisconnectLater
        ) {
            if self.state == PeerState::ConnectionPending {
                *ctx.recalculate_bandwidth_limits = true;
            }
            self.reset();
        } else if flags & COMMAND_FLAG_ACKNOWLEDGE != 0 {
            self.change_state(PeerState::AcknowledgingDisconnect);
        } else {
            self.dispatch_state(ctx, PeerState::Zombie);
        }

        if self.state != PeerState::Disconnected {
            self.event_data = data;
        }

        Ok(())
    }

    pub fn handle_verify_connect(
        &mut self,
        ctx: &mut HostCtx,
        verify: &VerifyConnect,
    ) -> Result<Option<ProtocolEvent>, CommandError> {
        if self.state != PeerState::Connecting {
            return Ok(None);
        }

        let channel_count = verify.channel_count as usize;

        if channel_count < MINIMUM_CHANNEL_COUNT
            || channel_count > MAXIMUM_CHANNEL_COUNT
            || verify.packet_throttle_interval != self.packet_throttle_interval
            || verify.packet_throttle_acceleration != self.packet_throttle_acceleration
            || verify.packet_throttle_deceleration != self.packet_throttle_deceleration
            || verify.connect_id != self.connect_id
        {
            debug!(
                "peer {}: connection verification mismatch",
                self.incoming_peer_id
            );
            self.event_data = 0;
            self.dispatch_state(ctx, PeerState::Zombie);
            return Err(CommandError);
        }

        self.remove_sent_reliable_command(1, CONTROL_CHANNEL_ID);

        if channel_count < self.channels.len() {
            self.channels.truncate(channel_count);
        }

        self.outgoing_peer_id = verify.outgoing_peer_id;
        self.incoming_session_id = verify.incoming_session_id;
        self.outgoing_session_id = verify.outgoing_session_id;

        let mtu = verify.mtu.clamp(MINIMUM_MTU, MAXIMUM_MTU);
        if mtu < self.mtu {
            self.mtu = mtu;
        }

        let window_size = verify
            .window_size
            .clamp(MINIMUM_WINDOW_SIZE, MAXIMUM_WINDOW_SIZE);
        if window_size < self.window_size {
            self.window_size = window_size;
        }

        self.incoming_bandwidth = verify.incoming_bandwidth;
        self.outgoing_bandwidth = verify.outgoing_bandwidth;

        debug!(
            "peer {}: verified, mtu {}, window {}",
            self.incoming_peer_id, self.mtu, self.window_size
        );

        Ok(Some(self.notify_connect(ctx)))
    }

    pub fn handle_send_reliable(
        &mut self,
        ctx: &mut HostCtx,
        channel_id: u8,
        reliable_sequence_number: u16,
        data: &[u8],
    ) -> Result<(), CommandError> {
        if !self.channel_valid(channel_id) {
            return Err(CommandError);
        }

        match self.queue_incoming_command(
            ctx,
            channel_id,
            COMMAND_SEND_RELIABLE,
            reliable_sequence_number,
            0,
            Some(data),
            data.len(),
            packet::FLAG_RELIABLE,
            0,
        ) {
            QueueResult::Refused => Err(CommandError),
            _ => Ok(()),
        }
    }

    pub fn handle_send_unreliable(
        &mut self,
        ctx: &mut HostCtx,
        channel_id: u8,
        reliable_sequence_number: u16,
        unreliable_sequence_number: u16,
        data: &[u8],
    ) -> Result<(), CommandError> {
        if !self.channel_valid(channel_id) {
            return Err(CommandError);
        }

        match self.queue_incoming_command(
            ctx,
            channel_id,
            COMMAND_SEND_UNRELIABLE,
            reliable_sequence_number,
            unreliable_sequence_number,
            Some(data),
            data.len(),
            0,
            0,
        ) {
            QueueResult::Refused => Err(CommandError),
            _ => Ok(()),
        }
    }

    pub fn handle_send_unsequenced(
        &mut self,
        ctx: &mut HostCtx,
        channel_id: u8,
        unsequenced_group: u16,
        data: &[u8],
    ) -> Result<(), CommandError> {
        if !self.channel_valid(channel_id) {
            return Err(CommandError);
        }

        let mut group = unsequenced_group as u32;
        let index = (group % UNSEQUENCED_WINDOW_SIZE) as usize;

        if group < self.incoming_unsequenced_group as u32 {
            group += 0x10000;
        }

        if group
            >= self.incoming_unsequenced_group as u32
                + FREE_UNSEQUENCED_WINDOWS * UNSEQUENCED_WINDOW_SIZE
        {
            return Ok(());
        }

        group &= 0xFFFF;

        if group - index as u32 != self.incoming_unsequenced_group as u32 {
            self.incoming_unsequenced_group = (group - index as u32) as u16;
            self.unsequenced_window = [0; UNSEQUENCED_WINDOW_WORDS];
        } else if self.unsequenced_window[index / 32] & (1 << (index % 32)) != 0 {
            trace!(
                "peer {}: duplicate unsequenced group {}",
                self.incoming_peer_id,
                unsequenced_group
            );
            return Ok(());
        }

        if let QueueResult::Refused = self.queue_incoming_command(
            ctx,
            channel_id,
            COMMAND_SEND_UNSEQUENCED,
            0,
            0,
            Some(data),
            data.len(),
            packet::FLAG_UNSEQUENCED,
            0,
        ) {
            return Err(CommandError);
        }

        self.unsequenced_window[index / 32] |= 1 << (index % 32);

        Ok(())
    }

    pub fn handle_send_fragment(
        &mut self,
        ctx: &mut HostCtx,
        channel_id: u8,
        fragment: &SendFragment,
        data: &[u8],
    ) -> Result<(), CommandError> {
        if !self.channel_valid(channel_id) {
            return Err(CommandError);
        }

        let channel = &self.channels[channel_id as usize];
        let start_sequence_number = fragment.start_sequence_number;

        let mut start_window = start_sequence_number / RELIABLE_WINDOW_SIZE;
        let current_window = channel.incoming_reliable_sequence_number / RELIABLE_WINDOW_SIZE;

        if start_sequence_number < channel.incoming_reliable_sequence_number {
            start_window += RELIABLE_WINDOWS;
        }

        if start_window < current_window
            || start_window >= current_window + FREE_RELIABLE_WINDOWS - 1
        {
            return Ok(());
        }

        let fragment_number = fragment.fragment_number;
        let fragment_count = fragment.fragment_count;
        let fragment_offset = fragment.fragment_offset;
        let total_length = fragment.total_length;

        if fragment_count > MAXIMUM_FRAGMENT_COUNT
            || fragment_number >= fragment_count
            || total_length as usize > self.maximum_packet_size
            || fragment_offset >= total_length
            || data.len() as u32 > total_length - fragment_offset
        {
            return Err(CommandError);
        }

        let found = self.find_reliable_fragment_set(channel_id, start_sequence_number, fragment);

        let index = match found {
            FindFragment::Mismatch => return Err(CommandError),
            FindFragment::Found(index) => index,
            FindFragment::NotFound => {
                match self.queue_incoming_command(
                    ctx,
                    channel_id,
                    COMMAND_SEND_FRAGMENT,
                    start_sequence_number,
                    0,
                    None,
                    total_length as usize,
                    packet::FLAG_RELIABLE,
                    fragment_count,
                ) {
                    QueueResult::Queued => {}
                    _ => return Err(CommandError),
                }

                match self.find_reliable_fragment_set(channel_id, start_sequence_number, fragment)
                {
                    FindFragment::Found(index) => index,
                    _ => return Err(CommandError),
                }
            }
        };

        self.fill_fragment(
            ctx,
            channel_id,
            index,
            fragment_number,
            fragment_offset,
            data,
            true,
        );

        Ok(())
    }

    pub fn handle_send_unreliable_fragment(
        &mut self,
        ctx: &mut HostCtx,
        channel_id: u8,
        reliable_sequence_number: u16,
        fragment: &SendFragment,
        data: &[u8],
    ) -> Result<(), CommandError> {
        if !self.channel_valid(channel_id) {
            return Err(CommandError);
        }

        let channel = &self.channels[channel_id as usize];
        let start_sequence_number = fragment.start_sequence_number;

        let mut reliable_window = reliable_sequence_number / RELIABLE_WINDOW_SIZE;
        let current_window = channel.incoming_reliable_sequence_number / RELIABLE_WINDOW_SIZE;

        if reliable_sequence_number < channel.incoming_reliable_sequence_number {
            reliable_window += RELIABLE_WINDOWS;
        }

        if reliable_window < current_window
            || reliable_window >= current_window + FREE_RELIABLE_WINDOWS - 1
        {
            return Ok(());
        }

        if reliable_sequence_number == channel.incoming_reliable_sequence_number
            && start_sequence_number <= channel.incoming_unreliable_sequence_number
        {
            return Ok(());
        }

        let fragment_number = fragment.fragment_number;
        let fragment_count = fragment.fragment_count;
        let fragment_offset = fragment.fragment_offset;
        let total_length = fragment.total_length;

        if fragment_count > MAXIMUM_FRAGMENT_COUNT
            || fragment_number >= fragment_count
            || total_length as usize > self.maximum_packet_size
            || fragment_offset >= total_length
            || data.len() as u32 > total_length - fragment_offset
        {
            return Err(CommandError);
        }

        let found = self.find_unreliable_fragment_set(
            channel_id,
            reliable_sequence_number,
            start_sequence_number,
            fragment,
        );

        let index = match found {
            FindFragment::Mismatch => return Err(CommandError),
            FindFragment::Found(index) => index,
            FindFragment::NotFound => {
                match self.queue_incoming_command(
                    ctx,
                    channel_id,
                    COMMAND_SEND_UNRELIABLE_FRAGMENT,
                    reliable_sequence_number,
                    start_sequence_number,
                    None,
                    total_length as usize,
                    packet::FLAG_UNRELIABLE_FRAGMENT,
                    fragment_count,
                ) {
                    QueueResult::Queued => {}
                    _ => return Err(CommandError),
                }

                match self.find_unreliable_fragment_set(
                    channel_id,
                    reliable_sequence_number,
                    start_sequence_number,
                    fragment,
                ) {
                    FindFragment::Found(index) => index,
                    _ => return Err(CommandError),
                }
            }
        };

        self.fill_fragment(
            ctx,
            channel_id,
            index,
            fragment_number,
            fragment_offset,
            data,
            false,
        );

        Ok(())
    }

    /// Copies one fragment into its assembly buffer, clamping an overlong
    /// fragment to the packet bound, and dispatches the channel when the
    /// set completes.
    fn fill_fragment(
        &mut self,
        ctx: &mut HostCtx,
        channel_id: u8,
        index: usize,
        fragment_number: u32,
        fragment_offset: u32,
        data: &[u8],
        reliable: bool,
    ) {
        let queue = if reliable {
            &mut self.channels[channel_id as usize].incoming_reliable_commands
        } else {
            &mut self.channels[channel_id as usize].incoming_unreliable_commands
        };
        let set = &mut queue[index];

        let word = (fragment_number / 32) as usize;
        let bit = 1u32 << (fragment_number % 32);

        if set.fragments[word] & bit != 0 {
            return;
        }

        set.fragments_remaining -= 1;
        set.fragments[word] |= bit;

        let offset = fragment_offset as usize;
        let length = data.len().min(set.data.len().saturating_sub(offset));
        set.data[offset..offset + length].copy_from_slice(&data[..length]);

        if set.fragments_remaining == 0 {
            if reliable {
                self.dispatch_incoming_reliable_commands(ctx, channel_id);
            } else {
                self.dispatch_incoming_unreliable_commands(ctx, channel_id);
            }
        }
    }

    fn find_reliable_fragment_set(
        &self,
        channel_id: u8,
        start_sequence_number: u16,
        fragment: &SendFragment,
    ) -> FindFragment {
        let channel = &self.channels[channel_id as usize];

        let mut index = channel.incoming_reliable_commands.len();
        while index > 0 {
            let command = &channel.incoming_reliable_commands[index - 1];

            if start_sequence_number >= channel.incoming_reliable_sequence_number {
                if command.reliable_sequence_number < channel.incoming_reliable_sequence_number {
                    index -= 1;
                    continue;
                }
            } else if command.reliable_sequence_number >= channel.incoming_reliable_sequence_number
            {
                return FindFragment::NotFound;
            }

            if command.reliable_sequence_number <= start_sequence_number {
                if command.reliable_sequence_number < start_sequence_number {
                    return FindFragment::NotFound;
                }

                if command.command_tag != COMMAND_SEND_FRAGMENT
                    || fragment.total_length as usize != command.data.len()
                    || fragment.fragment_count != command.fragment_count
                {
                    return FindFragment::Mismatch;
                }

                return FindFragment::Found(index - 1);
            }

            index -= 1;
        }

        FindFragment::NotFound
    }

    fn find_unreliable_fragment_set(
        &self,
        channel_id: u8,
        reliable_sequence_number: u16,
        start_sequence_number: u16,
        fragment: &SendFragment,
    ) -> FindFragment {
        let channel = &self.channels[channel_id as usize];

        let mut index = channel.incoming_unreliable_commands.len();
        while index > 0 {
            let command = &channel.incoming_unreliable_commands[index - 1];

            if reliable_sequence_number >= channel.incoming_reliable_sequence_number {
                if command.reliable_sequence_number < channel.incoming_reliable_sequence_number {
                    index -= 1;
                    continue;
                }
            } else if command.reliable_sequence_number >= channel.incoming_reliable_sequence_number
            {
                return FindFragment::NotFound;
            }

            if command.reliable_sequence_number < reliable_sequence_number {
                return FindFragment::NotFound;
            }

            if command.reliable_sequence_number > reliable_sequence_number {
                index -= 1;
                continue;
            }

            if command.unreliable_sequence_number <= start_sequence_number {
                if command.unreliable_sequence_number < start_sequence_number {
                    return FindFragment::NotFound;
                }

                if command.command_tag != COMMAND_SEND_UNRELIABLE_FRAGMENT
                    || fragment.total_length as usize != command.data.len()
                    || fragment.fragment_count != command.fragment_count
                {
                    return FindFragment::Mismatch;
                }

                return FindFragment::Found(index - 1);
            }

            index -= 1;
        }

        FindFragment::NotFound
    }

    // ------------------------------------------------------------------
    // Incoming queues and dispatch
    // ------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    fn queue_incoming_command(
        &mut self,
        ctx: &mut HostCtx,
        channel_id: u8,
        command_tag: u8,
        reliable_sequence_number: u16,
        unreliable_sequence_number: u16,
        data: Option<&[u8]>,
        total_length: usize,
        flags: u32,
        fragment_count: u32,
    ) -> QueueResult {
        let discard = || {
            if fragment_count > 0 {
                QueueResult::Refused
            } else {
                QueueResult::Discarded
            }
        };

        if self.state == PeerState::DisconnectLater {
            return discard();
        }

        let channel = &self.channels[channel_id as usize];

        if command_tag != COMMAND_SEND_UNSEQUENCED {
            let mut reliable_window = reliable_sequence_number / RELIABLE_WINDOW_SIZE;
            let current_window = channel.incoming_reliable_sequence_number / RELIABLE_WINDOW_SIZE;

            if reliable_sequence_number < channel.incoming_reliable_sequence_number {
                reliable_window += RELIABLE_WINDOWS;
            }

            if reliable_window < current_window
                || reliable_window >= current_window + FREE_RELIABLE_WINDOWS - 1
            {
                return discard();
            }
        }

        let insert_index = match command_tag {
            COMMAND_SEND_FRAGMENT | COMMAND_SEND_RELIABLE => {
                if reliable_sequence_number == channel.incoming_reliable_sequence_number {
                    return discard();
                }

                let mut index = channel.incoming_reliable_commands.len();
                loop {
                    if index == 0 {
                        break 0;
                    }

                    let command = &channel.incoming_reliable_commands[index - 1];

                    if reliable_sequence_number >= channel.incoming_reliable_sequence_number {
                        if command.reliable_sequence_number
                            < channel.incoming_reliable_sequence_number
                        {
                            index -= 1;
                            continue;
                        }
                    } else if command.reliable_sequence_number
                        >= channel.incoming_reliable_sequence_number
                    {
                        break index;
                    }

                    if command.reliable_sequence_number <= reliable_sequence_number {
                        if command.reliable_sequence_number < reliable_sequence_number {
                            break index;
                        }

                        return discard();
                    }

                    index -= 1;
                }
            }

            COMMAND_SEND_UNRELIABLE | COMMAND_SEND_UNRELIABLE_FRAGMENT => {
                if reliable_sequence_number == channel.incoming_reliable_sequence_number
                    && unreliable_sequence_number <= channel.incoming_unreliable_sequence_number
                {
                    return discard();
                }

                let mut index = channel.incoming_unreliable_commands.len();
                loop {
                    if index == 0 {
                        break 0;
                    }

                    let command = &channel.incoming_unreliable_commands[index - 1];

                    if reliable_sequence_number >= channel.incoming_reliable_sequence_number {
                        if command.reliable_sequence_number
                            < channel.incoming_reliable_sequence_number
                        {
                            index -= 1;
                            continue;
                        }
                    } else if command.reliable_sequence_number
                        >= channel.incoming_reliable_sequence_number
                    {
                        break index;
                    }

                    if command.reliable_sequence_number < reliable_sequence_number {
                        break index;
                    }

                    if command.reliable_sequence_number > reliable_sequence_number {
                        index -= 1;
                        continue;
                    }

                    if command.unreliable_sequence_number <= unreliable_sequence_number {
                        if command.unreliable_sequence_number < unreliable_sequence_number {
                            break index;
                        }

                        return discard();
                    }

                    index -= 1;
                }
            }

            COMMAND_SEND_UNSEQUENCED => 0,

            _ => return discard(),
        };

        if self.total_waiting_data >= ctx.maximum_waiting_data {
            trace!(
                "peer {}: waiting data limit reached, refusing command",
                self.incoming_peer_id
            );
            return QueueResult::Refused;
        }

        let buffer: Box<[u8]> = match data {
            Some(data) => data.into(),
            None => vec![0; total_length].into_boxed_slice(),
        };

        let fragments = if fragment_count > 0 {
            if fragment_count > MAXIMUM_FRAGMENT_COUNT {
                return QueueResult::Refused;
            }
            vec![0u32; ((fragment_count + 31) / 32) as usize]
        } else {
            Vec::new()
        };

        self.total_waiting_data += buffer.len();

        let command = IncomingCommand {
            command_tag,
            channel_id,
            reliable_sequence_number,
            unreliable_sequence_number,
            fragment_count,
            fragments_remaining: fragment_count,
            fragments,
            data: buffer,
            flags,
        };

        let channel = &mut self.channels[channel_id as usize];
        match command_tag {
            COMMAND_SEND_FRAGMENT | COMMAND_SEND_RELIABLE => {
                channel
                    .incoming_reliable_commands
                    .insert(insert_index, command);
                self.dispatch_incoming_reliable_commands(ctx, channel_id);
            }
            _ => {
                channel
                    .incoming_unreliable_commands
                    .insert(insert_index, command);
                self.dispatch_incoming_unreliable_commands(ctx, channel_id);
            }
        }

        QueueResult::Queued
    }

    /// Delivers the run of consecutive, fully assembled reliable commands
    /// at the head of the channel queue.
    pub fn dispatch_incoming_reliable_commands(&mut self, ctx: &mut HostCtx, channel_id: u8) {
        let channel = &mut self.channels[channel_id as usize];

        let mut count = 0;
        for command in channel.incoming_reliable_commands.iter() {
            if command.fragments_remaining > 0
                || command.reliable_sequence_number
                    != channel.incoming_reliable_sequence_number.wrapping_add(1)
            {
                break;
            }

            channel.incoming_reliable_sequence_number = command.reliable_sequence_number;

            if command.fragment_count > 0 {
                channel.incoming_reliable_sequence_number = channel
                    .incoming_reliable_sequence_number
                    .wrapping_add(command.fragment_count as u16 - 1);
            }

            count += 1;
        }

        if count == 0 {
            return;
        }

        channel.incoming_unreliable_sequence_number = 0;

        let delivered: Vec<IncomingCommand> =
            channel.incoming_reliable_commands.drain(..count).collect();
        self.dispatched_commands.extend(delivered);

        self.mark_dispatch(ctx);

        if !self.channels[channel_id as usize]
            .incoming_unreliable_commands
            .is_empty()
        {
            self.dispatch_incoming_unreliable_commands(ctx, channel_id);
        }
    }

    /// Delivers unreliable commands anchored at the channel's current
    /// reliable sequence. Commands anchored in older reliable windows are
    /// dropped; commands in newer windows wait for the reliable stream to
    /// catch up.
    pub fn dispatch_incoming_unreliable_commands(&mut self, ctx: &mut HostCtx, channel_id: u8) {
        let channel = &mut self.channels[channel_id as usize];
        let incoming_reliable = channel.incoming_reliable_sequence_number;
        let queue_len = channel.incoming_unreliable_commands.len();

        let mut moved: Vec<usize> = Vec::new();
        let mut start = 0;
        let mut dropped = 0;
        let mut current = 0;
        let mut new_unreliable_sequence = channel.incoming_unreliable_sequence_number;

        while current < queue_len {
            let command = &channel.incoming_unreliable_commands[current];

            if command.command_tag != COMMAND_SEND_UNSEQUENCED {
                if command.reliable_sequence_number == incoming_reliable {
                    if command.fragments_remaining == 0 {
                        new_unreliable_sequence = command.unreliable_sequence_number;
                        current += 1;
                        continue;
                    }

                    // An incomplete fragment set at the current reliable
                    // generation: deliver the run before it, keep it queued.
                    if start != current {
                        moved.extend(start..current);
                        dropped = current;
                    } else if dropped != current {
                        dropped = current - 1;
                    }
                    start = current + 1;
                } else {
                    let mut reliable_window =
                        command.reliable_sequence_number / RELIABLE_WINDOW_SIZE;
                    let current_window = incoming_reliable / RELIABLE_WINDOW_SIZE;

                    if command.reliable_sequence_number < incoming_reliable {
                        reliable_window += RELIABLE_WINDOWS;
                    }

                    if reliable_window >= current_window
                        && reliable_window < current_window + FREE_RELIABLE_WINDOWS - 1
                    {
                        // Anchored ahead of the reliable stream; everything
                        // from here on stays queued.
                        break;
                    }

                    dropped = current + 1;
                    if start != current {
                        moved.extend(start..current);
                    }
                    start = current + 1;
                }
            }

            current += 1;
        }

        if start != current {
            moved.extend(start..current);
            dropped = current;
        }

        if moved.is_empty() && dropped == 0 {
            return;
        }

        channel.incoming_unreliable_sequence_number = new_unreliable_sequence;

        let queue =
            std::mem::take(&mut self.channels[channel_id as usize].incoming_unreliable_commands);
        let mut kept = VecDeque::new();
        let mut moved_cursor = 0;
        let mut delivered_any = false;

        for (index, command) in queue.into_iter().enumerate() {
            if moved_cursor < moved.len() && moved[moved_cursor] == index {
                moved_cursor += 1;
                delivered_any = true;
                self.dispatched_commands.push_back(command);
            } else if index < dropped {
                self.total_waiting_data =
                    self.total_waiting_data.saturating_sub(command.data.len());
            } else {
                kept.push_back(command);
            }
        }

        self.channels[channel_id as usize].incoming_unreliable_commands = kept;

        if delivered_any {
            self.mark_dispatch(ctx);
        }
    }
}

pub(crate) fn negotiated_window_size(
    peer_incoming_bandwidth: u32,
    host_outgoing_bandwidth: u32,
) -> u32 {
    let window_size = if peer_incoming_bandwidth == 0 && host_outgoing_bandwidth == 0 {
        MAXIMUM_WINDOW_SIZE
    } else if peer_incoming_bandwidth == 0 || host_outgoing_bandwidth == 0 {
        (peer_incoming_bandwidth.max(host_outgoing_bandwidth) / WINDOW_SIZE_SCALE)
            * MINIMUM_WINDOW_SIZE
    } else {
        (peer_incoming_bandwidth.min(host_outgoing_bandwidth) / WINDOW_SIZE_SCALE)
            * MINIMUM_WINDOW_SIZE
    };

    window_size.clamp(MINIMUM_WINDOW_SIZE, MAXIMUM_WINDOW_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_ctx<'a>(
        dispatch_queue: &'a mut VecDeque<usize>,
        recalculate: &'a mut bool,
    ) -> HostCtx<'a> {
        HostCtx {
            service_time: 1000,
            maximum_waiting_data: 32 * 1024 * 1024,
            outgoing_bandwidth: 0,
            recalculate_bandwidth_limits: recalculate,
            dispatch_queue,
        }
    }

    fn connected_endpoint(channel_count: usize) -> Endpoint {
        let mut endpoint = Endpoint::new(0, 1400, 32 * 1024 * 1024);
        endpoint.channels = (0..channel_count).map(|_| Channel::new()).collect();
        endpoint.state = PeerState::Connected;
        endpoint
    }

    #[test]
    fn test_reliable_sequencing_is_monotonic_per_channel() {
        let mut endpoint = connected_endpoint(2);

        let packet = Packet::new(&[0; 8], packet::FLAG_RELIABLE);
        endpoint.send(0, &packet).unwrap();
        endpoint.send(0, &packet).unwrap();
        endpoint.send(1, &packet).unwrap();

        let sequences: Vec<(u8, u16)> = endpoint
            .outgoing_reliable_commands
            .iter()
            .map(|c| {
                (
                    c.command.header.channel_id,
                    c.command.header.reliable_sequence_number,
                )
            })
            .collect();

        assert_eq!(sequences, [(0, 1), (0, 2), (1, 1)]);
    }

    #[test]
    fn test_control_channel_uses_peer_counter() {
        let mut endpoint = connected_endpoint(1);

        endpoint.ping();
        endpoint.ping();

        let sequences: Vec<u16> = endpoint
            .outgoing_reliable_commands
            .iter()
            .map(|c| c.command.header.reliable_sequence_number)
            .collect();

        assert_eq!(sequences, [1, 2]);
        assert_eq!(endpoint.outgoing_reliable_sequence_number, 2);
    }

    #[test]
    fn test_unreliable_commands_anchor_to_reliable_sequence() {
        let mut endpoint = connected_endpoint(1);

        let reliable = Packet::new(&[0; 8], packet::FLAG_RELIABLE);
        let unreliable = Packet::new(&[0; 8], 0);

        endpoint.send(0, &reliable).unwrap();
        endpoint.send(0, &unreliable).unwrap();
        endpoint.send(0, &unreliable).unwrap();

        let command = &endpoint.outgoing_unreliable_commands[0];
        assert_eq!(command.command.header.reliable_sequence_number, 1);
        assert_eq!(command.unreliable_sequence_number, 1);

        let command = &endpoint.outgoing_unreliable_commands[1];
        assert_eq!(command.command.header.reliable_sequence_number, 1);
        assert_eq!(command.unreliable_sequence_number, 2);
    }

    #[test]
    fn test_fragmentation_splits_and_shares_packet() {
        let mut endpoint = connected_endpoint(1);

        // Fragment length for mtu 1400 with no checksum: 1400 - 4 - 24.
        let fragment_length = 1372;
        let packet = Packet::new(&vec![7; fragment_length * 2 + 100], packet::FLAG_RELIABLE);

        endpoint.send(0, &packet).unwrap();

        assert_eq!(endpoint.outgoing_reliable_commands.len(), 3);
        // One reference per fragment plus the caller's.
        assert_eq!(packet.reference_count(), 4);

        for (number, command) in endpoint.outgoing_reliable_commands.iter().enumerate() {
            match &command.command.kind {
                CommandKind::SendFragment(fragment) => {
                    assert_eq!(fragment.start_sequence_number, 1);
                    assert_eq!(fragment.fragment_count, 3);
                    assert_eq!(fragment.fragment_number, number as u32);
                    assert_eq!(fragment.total_length, packet.len() as u32);
                }
                other => panic!("expected fragment, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_throttle_bounds() {
        let mut endpoint = connected_endpoint(1);
        endpoint.last_round_trip_time = 100;
        endpoint.last_round_trip_time_variance = 10;

        // Improving RTT accelerates up to the limit.
        for _ in 0..100 {
            endpoint.throttle(50);
            assert!(endpoint.packet_throttle <= endpoint.packet_throttle_limit);
        }
        assert_eq!(endpoint.packet_throttle, endpoint.packet_throttle_limit);

        // Degrading RTT decelerates, saturating at zero.
        for _ in 0..100 {
            endpoint.throttle(500);
        }
        assert_eq!(endpoint.packet_throttle, 0);
    }

    #[test]
    fn test_reliable_dispatch_in_order() {
        let mut endpoint = connected_endpoint(1);
        let mut dispatch_queue = VecDeque::new();
        let mut recalculate = false;
        let mut ctx = test_ctx(&mut dispatch_queue, &mut recalculate);

        // Sequence 2 arrives first and must wait for sequence 1.
        endpoint
            .handle_send_reliable(&mut ctx, 0, 2, b"second")
            .unwrap();
        assert!(endpoint.dispatched_commands.is_empty());

        endpoint
            .handle_send_reliable(&mut ctx, 0, 1, b"first")
            .unwrap();

        let payloads: Vec<&[u8]> = endpoint
            .dispatched_commands
            .iter()
            .map(|c| &*c.data)
            .collect();
        assert_eq!(payloads, [b"first".as_ref(), b"second".as_ref()]);
        assert_eq!(*ctx.dispatch_queue, [0usize]);
        assert!(endpoint.needs_dispatch);
    }

    #[test]
    fn test_duplicate_reliable_discarded() {
        let mut endpoint = connected_endpoint(1);
        let mut dispatch_queue = VecDeque::new();
        let mut recalculate = false;
        let mut ctx = test_ctx(&mut dispatch_queue, &mut recalculate);

        endpoint
            .handle_send_reliable(&mut ctx, 0, 1, b"payload")
            .unwrap();
        endpoint
            .handle_send_reliable(&mut ctx, 0, 1, b"payload")
            .unwrap();

        assert_eq!(endpoint.dispatched_commands.len(), 1);
    }

    #[test]
    fn test_unsequenced_duplicates_suppressed() {
        let mut endpoint = connected_endpoint(1);
        let mut dispatch_queue = VecDeque::new();
        let mut recalculate = false;
        let mut ctx = test_ctx(&mut dispatch_queue, &mut recalculate);

        endpoint
            .handle_send_unsequenced(&mut ctx, 0, 5, b"a")
            .unwrap();
        endpoint
            .handle_send_unsequenced(&mut ctx, 0, 5, b"a")
            .unwrap();
        endpoint
            .handle_send_unsequenced(&mut ctx, 0, 6, b"b")
            .unwrap();

        assert_eq!(endpoint.dispatched_commands.len(), 2);
    }

    #[test]
    fn test_unsequenced_window_advances() {
        let mut endpoint = connected_endpoint(1);
        let mut dispatch_queue = VecDeque::new();
        let mut recalculate = false;
        let mut ctx = test_ctx(&mut dispatch_queue, &mut recalculate);

        endpoint
            .handle_send_unsequenced(&mut ctx, 0, 5, b"a")
            .unwrap();

        // A group two window spans ahead rebases the bitmap.
        let far = 5 + UNSEQUENCED_WINDOW_SIZE as u16 * 2;
        endpoint
            .handle_send_unsequenced(&mut ctx, 0, far, b"b")
            .unwrap();
        assert_eq!(endpoint.incoming_unsequenced_group, far / 1024 * 1024);

        assert_eq!(endpoint.dispatched_commands.len(), 2);
    }

    #[test]
    fn test_waiting_data_limit_refuses() {
        let mut endpoint = connected_endpoint(1);
        let mut dispatch_queue = VecDeque::new();
        let mut recalculate = false;
        let mut ctx = HostCtx {
            service_time: 1000,
            maximum_waiting_data: 16,
            outgoing_bandwidth: 0,
            recalculate_bandwidth_limits: &mut recalculate,
            dispatch_queue: &mut dispatch_queue,
        };

        endpoint
            .handle_send_reliable(&mut ctx, 0, 1, &[0; 16])
            .unwrap();

        // The budget is exhausted; the next command is refused.
        assert!(endpoint
            .handle_send_reliable(&mut ctx, 0, 2, &[0; 16])
            .is_err());
        assert_eq!(endpoint.dispatched_commands.len(), 1);
    }

    #[test]
    fn test_fragment_reassembly() {
        let mut endpoint = connected_endpoint(1);
        let mut dispatch_queue = VecDeque::new();
        let mut recalculate = false;
        let mut ctx = test_ctx(&mut dispatch_queue, &mut recalculate);

        let make_fragment = |number: u32, offset: u32, length: u16| SendFragment {
            start_sequence_number: 1,
            data_length: length,
            fragment_count: 2,
            fragment_number: number,
            total_length: 10,
            fragment_offset: offset,
        };

        // Out-of-order arrival; duplicate of the second fragment ignored.
        endpoint
            .handle_send_fragment(&mut ctx, 0, &make_fragment(1, 6, 4), b"6789")
            .unwrap();
        assert!(endpoint.dispatched_commands.is_empty());

        endpoint
            .handle_send_fragment(&mut ctx, 0, &make_fragment(1, 6, 4), b"xxxx")
            .unwrap();

        endpoint
            .handle_send_fragment(&mut ctx, 0, &make_fragment(0, 0, 6), b"012345")
            .unwrap();

        assert_eq!(endpoint.dispatched_commands.len(), 1);
        assert_eq!(&*endpoint.dispatched_commands[0].data, b"0123456789");
    }

    #[test]
    fn test_unreliable_dropped_behind_reliable_stream() {
        let mut endpoint = connected_endpoint(1);
        let mut dispatch_queue = VecDeque::new();
        let mut recalculate = false;
        let mut ctx = test_ctx(&mut dispatch_queue, &mut recalculate);

        // Advance the reliable stream to sequence 2 first.
        endpoint
            .handle_send_reliable(&mut ctx, 0, 1, b"r1")
            .unwrap();
        endpoint
            .handle_send_reliable(&mut ctx, 0, 2, b"r2")
            .unwrap();
        let delivered = endpoint.dispatched_commands.len();

        // An unreliable command anchored at the old reliable sequence 1 is
        // stale and must be dropped, not delivered.
        endpoint
            .handle_send_unreliable(&mut ctx, 0, 1, 1, b"old")
            .unwrap();
        assert_eq!(endpoint.dispatched_commands.len(), delivered);

        // One anchored at the current sequence is delivered.
        endpoint
            .handle_send_unreliable(&mut ctx, 0, 2, 1, b"new")
            .unwrap();
        assert_eq!(endpoint.dispatched_commands.len(), delivered + 1);
    }

    #[test]
    fn test_receive_restores_waiting_budget() {
        let mut endpoint = connected_endpoint(1);
        let mut dispatch_queue = VecDeque::new();
        let mut recalculate = false;
        let mut ctx = test_ctx(&mut dispatch_queue, &mut recalculate);

        endpoint
            .handle_send_reliable(&mut ctx, 0, 1, b"hello")
            .unwrap();
        assert_eq!(endpoint.total_waiting_data, 5);

        let (channel_id, packet) = endpoint.receive().unwrap();
        assert_eq!(channel_id, 0);
        assert_eq!(packet.data(), b"hello");
        assert_eq!(
            packet.flags() & packet::FLAG_RELIABLE,
            packet::FLAG_RELIABLE
        );
        assert_eq!(endpoint.total_waiting_data, 0);

        assert!(endpoint.receive().is_none());
    }
}
