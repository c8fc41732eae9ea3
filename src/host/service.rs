
use super::Host;
use super::RECEIVE_BUDGET;

use crate::address::Address;
use crate::compress::Intercept;
use crate::endpoint::Endpoint;
use crate::endpoint::HostCtx;
use crate::endpoint::PeerState;
use crate::endpoint::ProtocolEvent;
use crate::endpoint::TimeoutCheck;
use crate::endpoint::PACKET_LOSS_INTERVAL;
use crate::endpoint::PACKET_LOSS_SCALE;
use crate::endpoint::PACKET_THROTTLE_COUNTER;
use crate::endpoint::PACKET_THROTTLE_SCALE;
use crate::error::ServiceError;
use crate::peer::Peer;
use crate::protocol::serial;
use crate::protocol::*;
use crate::time;
use crate::Event;

use log::trace;
use log::warn;

use std::rc::Rc;

/// One outbound datagram under construction: the packed command section,
/// plus the running size and header flags the commands decide.
struct FrameAssembly {
    commands: Vec<u8>,
    command_count: usize,
    packet_size: usize,
    header_flags: u16,
}

impl FrameAssembly {
    fn new(header_size: usize) -> Self {
        Self {
            commands: Vec::new(),
            command_count: 0,
            packet_size: header_size,
            header_flags: 0,
        }
    }

    fn push(&mut self, command: &Command, payload: Option<&[u8]>) {
        serial::write_command(&mut self.commands, command);
        self.packet_size += command.size();
        self.command_count += 1;

        if let Some(payload) = payload {
            self.commands.extend_from_slice(payload);
            self.packet_size += payload.len();
        }
    }

    fn remaining(&self, mtu: u32) -> usize {
        (mtu as usize).saturating_sub(self.packet_size)
    }
}

fn attach_peer(peer: Peer, event: ProtocolEvent) -> Event {
    match event {
        ProtocolEvent::Connect { data } => Event::Connect { peer, data },
        ProtocolEvent::Disconnect { data } => Event::Disconnect { peer, data },
        ProtocolEvent::Timeout => Event::Timeout { peer },
    }
}

/// Frames one ACKNOWLEDGE per pending acknowledgement, oldest first.
/// Acknowledging a DISCONNECT is the point of no return: the peer becomes a
/// zombie and surfaces its final event on the next dispatch.
fn send_acknowledgements(peer: &mut Endpoint, ctx: &mut HostCtx, frame: &mut FrameAssembly) {
    while !peer.acknowledgements.is_empty() {
        if frame.command_count >= MAXIMUM_PACKET_COMMANDS
            || frame.remaining(peer.mtu) < command_size(COMMAND_ACKNOWLEDGE)
        {
            break;
        }

        let acknowledgement = peer.acknowledgements.pop_front().unwrap();

        let command = Command {
            header: CommandHeader {
                flags: 0,
                channel_id: acknowledgement.channel_id,
                reliable_sequence_number: acknowledgement.reliable_sequence_number,
            },
            kind: CommandKind::Acknowledge(Acknowledge {
                received_reliable_sequence_number: acknowledgement.reliable_sequence_number,
                received_sent_time: acknowledgement.sent_time,
            }),
        };

        frame.push(&command, None);

        if acknowledgement.command_tag == COMMAND_DISCONNECT {
            peer.dispatch_state(ctx, PeerState::Zombie);
        }
    }
}

/// Frames queued reliable commands, subject to the reliable window, the
/// throttled in-transit byte budget, and the datagram's remaining room.
/// Returns whether the queue put nothing in flight, i.e. a keep-alive ping
/// would not be redundant.
fn send_reliable_outgoing_commands(
    peer: &mut Endpoint,
    frame: &mut FrameAssembly,
    service_time: u32,
) -> bool {
    use crate::endpoint::channel::FREE_RELIABLE_WINDOWS;
    use crate::endpoint::channel::RELIABLE_WINDOWS;
    use crate::endpoint::channel::RELIABLE_WINDOW_SIZE;

    let mut window_wrap = false;
    let mut window_exceeded = false;
    let mut can_ping = true;

    let mut index = 0;
    while index < peer.outgoing_reliable_commands.len() {
        let command = &peer.outgoing_reliable_commands[index];
        let channel_id = command.command.header.channel_id;
        let has_channel = (channel_id as usize) < peer.channels.len();
        let reliable_window =
            command.command.header.reliable_sequence_number / RELIABLE_WINDOW_SIZE;

        if has_channel {
            let channel = &peer.channels[channel_id as usize];

            // A command opening a new window is held back if the previous
            // window is still full or the free-window band ahead is in use.
            if !window_wrap
                && command.send_attempts < 1
                && command.command.header.reliable_sequence_number % RELIABLE_WINDOW_SIZE == 0
            {
                let free_mask = (1u32 << FREE_RELIABLE_WINDOWS) - 1;
                let wrap_mask = (free_mask << reliable_window)
                    | (free_mask >> (RELIABLE_WINDOWS - reliable_window));

                if channel.reliable_windows[((reliable_window + RELIABLE_WINDOWS - 1)
                    % RELIABLE_WINDOWS) as usize]
                    >= RELIABLE_WINDOW_SIZE
                    || channel.used_reliable_windows as u32 & wrap_mask != 0
                {
                    window_wrap = true;
                }
            }

            if window_wrap {
                index += 1;
                continue;
            }
        }

        if command.packet.is_some() {
            if !window_exceeded {
                let window_size =
                    (peer.packet_throttle * peer.window_size) / PACKET_THROTTLE_SCALE;

                if peer.reliable_data_in_transit + command.fragment_length as u32
                    > window_size.max(peer.mtu)
                {
                    window_exceeded = true;
                }
            }

            if window_exceeded {
                index += 1;
                continue;
            }
        }

        can_ping = false;

        let command_size = command.command.size();
        let payload_length = if command.packet.is_some() {
            command.fragment_length as usize
        } else {
            0
        };

        if frame.command_count >= MAXIMUM_PACKET_COMMANDS
            || frame.remaining(peer.mtu) < command_size + payload_length
        {
            break;
        }

        let mut command = peer.outgoing_reliable_commands.remove(index).unwrap();

        if has_channel && command.send_attempts < 1 {
            peer.channels[channel_id as usize]
                .occupy_reliable_window(command.command.header.reliable_sequence_number);
        }

        command.send_attempts += 1;

        if command.round_trip_timeout == 0 {
            command.round_trip_timeout = peer.round_trip_time + 4 * peer.round_trip_time_variance;
            command.round_trip_timeout_limit = peer.timeout_limit * command.round_trip_timeout;
        }

        if peer.sent_reliable_commands.is_empty() {
            peer.next_timeout = service_time.wrapping_add(command.round_trip_timeout);
        }

        command.sent_time = service_time;

        frame.header_flags |= HEADER_FLAG_SENT_TIME;

        if let Some(packet) = &command.packet {
            let offset = command.fragment_offset as usize;
            let payload = &packet.data()[offset..offset + command.fragment_length as usize];

            frame.push(&command.command, Some(payload));

            peer.reliable_data_in_transit += command.fragment_length as u32;
            packet.mark_sent();
        } else {
            frame.push(&command.command, None);
        }

        peer.packets_sent += 1;
        peer.total_packets_sent += 1;

        peer.sent_reliable_commands.push_back(command);
    }

    can_ping
}

/// Frames queued unreliable commands. Each first fragment advances the
/// throttle counter; a counter above the current throttle drops the command
/// and every sibling sharing its sequence pair instead of sending it.
fn send_unreliable_outgoing_commands(peer: &mut Endpoint, frame: &mut FrameAssembly) {
    let mut index = 0;
    while index < peer.outgoing_unreliable_commands.len() {
        let command = &peer.outgoing_unreliable_commands[index];

        let command_size = command.command.size();
        let payload_length = if command.packet.is_some() {
            command.fragment_length as usize
        } else {
            0
        };

        if frame.command_count >= MAXIMUM_PACKET_COMMANDS
            || frame.remaining(peer.mtu) < command_size + payload_length
        {
            break;
        }

        if command.packet.is_some() && command.fragment_offset == 0 {
            peer.packet_throttle_counter += PACKET_THROTTLE_COUNTER;
            peer.packet_throttle_counter %= PACKET_THROTTLE_SCALE;

            if peer.packet_throttle_counter > peer.packet_throttle {
                let reliable_sequence_number =
                    command.command.header.reliable_sequence_number;
                let unreliable_sequence_number = command.unreliable_sequence_number;

                loop {
                    drop(peer.outgoing_unreliable_commands.remove(index).unwrap());

                    match peer.outgoing_unreliable_commands.get(index) {
                        Some(next)
                            if next.command.header.reliable_sequence_number
                                == reliable_sequence_number
                                && next.unreliable_sequence_number
                                    == unreliable_sequence_number => {}
                        _ => break,
                    }
                }

                continue;
            }
        }

        let command = peer.outgoing_unreliable_commands.remove(index).unwrap();

        if let Some(packet) = &command.packet {
            let offset = command.fragment_offset as usize;
            let payload = &packet.data()[offset..offset + command.fragment_length as usize];

            frame.push(&command.command, Some(payload));
            packet.mark_sent();
        } else {
            frame.push(&command.command, None);
        }
    }

    if peer.state == PeerState::DisconnectLater
        && peer.outgoing_reliable_commands.is_empty()
        && peer.outgoing_unreliable_commands.is_empty()
        && peer.sent_reliable_commands.is_empty()
    {
        peer.disconnect(peer.event_data);
    }
}

impl Host {
    /// Builds and transmits at most one datagram per live peer:
    /// acknowledgements, then (after the retransmission scan) reliable
    /// commands and keep-alives, then unreliable commands.
    ///
    /// Returns `Ok(true)` when an event was placed in `event`.
    pub(crate) fn send_outgoing_commands(
        &mut self,
        event: &mut Option<Event>,
        check_for_timeouts: bool,
    ) -> Result<bool, ServiceError> {
        for index in 0..self.peers.len() {
            let peer_rc = Rc::clone(&self.peers[index]);
            let mut peer = peer_rc.borrow_mut();

            if matches!(peer.state, PeerState::Disconnected | PeerState::Zombie) {
                continue;
            }

            let checksum_bytes = if self.checksum.is_some() {
                serial::CHECKSUM_SIZE
            } else {
                0
            };
            let mut frame = FrameAssembly::new(serial::HEADER_SIZE_SENT_TIME + checksum_bytes);

            if !peer.acknowledgements.is_empty() {
                let mut ctx = HostCtx {
                    service_time: self.service_time,
                    maximum_waiting_data: self.maximum_waiting_data,
                    outgoing_bandwidth: self.outgoing_bandwidth,
                    recalculate_bandwidth_limits: &mut self.recalculate_bandwidth_limits,
                    dispatch_queue: &mut self.dispatch_queue,
                };
                send_acknowledgements(&mut peer, &mut ctx, &mut frame);
            }

            if check_for_timeouts
                && !peer.sent_reliable_commands.is_empty()
                && time::time_greater_equal(self.service_time, peer.next_timeout)
            {
                let outcome = {
                    let mut ctx = HostCtx {
                        service_time: self.service_time,
                        maximum_waiting_data: self.maximum_waiting_data,
                        outgoing_bandwidth: self.outgoing_bandwidth,
                        recalculate_bandwidth_limits: &mut self.recalculate_bandwidth_limits,
                        dispatch_queue: &mut self.dispatch_queue,
                    };
                    peer.check_timeouts(&mut ctx)
                };

                match outcome {
                    TimeoutCheck::Dropped(Some(protocol_event)) => {
                        drop(peer);
                        *event = Some(attach_peer(Peer::new(peer_rc), protocol_event));
                        return Ok(true);
                    }
                    TimeoutCheck::Dropped(None) => {
                        continue;
                    }
                    TimeoutCheck::Alive => {}
                }
            }

            let can_ping = if peer.outgoing_reliable_commands.is_empty() {
                true
            } else {
                send_reliable_outgoing_commands(&mut peer, &mut frame, self.service_time)
            };

            if can_ping
                && peer.sent_reliable_commands.is_empty()
                && time::time_difference(self.service_time, peer.last_receive_time)
                    >= peer.ping_interval
                && frame.remaining(peer.mtu) >= command_size(COMMAND_PING)
            {
                peer.ping();
                send_reliable_outgoing_commands(&mut peer, &mut frame, self.service_time);
            }

            if !peer.outgoing_unreliable_commands.is_empty() {
                send_unreliable_outgoing_commands(&mut peer, &mut frame);
            }

            if frame.command_count == 0 {
                if peer.flush_then_reset
                    && peer.outgoing_reliable_commands.is_empty()
                    && peer.outgoing_unreliable_commands.is_empty()
                {
                    peer.reset();
                }
                continue;
            }

            // Fold this interval's losses into the smoothed loss figures.
            if peer.packet_loss_epoch == 0 {
                peer.packet_loss_epoch = self.service_time;
            } else if time::time_difference(self.service_time, peer.packet_loss_epoch)
                >= PACKET_LOSS_INTERVAL
                && peer.packets_sent > 0
            {
                let packet_loss = peer.packets_lost * PACKET_LOSS_SCALE / peer.packets_sent;

                peer.packet_loss_variance -= peer.packet_loss_variance / 4;

                if packet_loss >= peer.packet_loss {
                    peer.packet_loss += (packet_loss - peer.packet_loss) / 8;
                    peer.packet_loss_variance += (packet_loss - peer.packet_loss) / 4;
                } else {
                    peer.packet_loss -= (peer.packet_loss - packet_loss) / 8;
                    peer.packet_loss_variance += (peer.packet_loss - packet_loss) / 4;
                }

                peer.packet_loss_epoch = self.service_time;
                peer.packets_sent = 0;
                peer.packets_lost = 0;
            }

            let mut header_flags = frame.header_flags;

            // Compression applies to the command section only, and only
            // when it is a strict win; the checksum always covers the
            // uncompressed form.
            let compressed = match &mut self.compressor {
                Some(compressor) => {
                    let mut output = vec![0u8; frame.commands.len()];
                    match compressor.compress(&frame.commands, &mut output) {
                        Some(size) if size > 0 && size < frame.commands.len() => {
                            output.truncate(size);
                            Some(output)
                        }
                        _ => None,
                    }
                }
                None => None,
            };

            if compressed.is_some() {
                header_flags |= HEADER_FLAG_COMPRESSED;
            }

            if peer.outgoing_peer_id < MAXIMUM_PEER_ID {
                header_flags |= (peer.outgoing_session_id as u16) << HEADER_SESSION_SHIFT;
            }

            let sent_time = if header_flags & HEADER_FLAG_SENT_TIME != 0 {
                Some((self.service_time & 0xFFFF) as u16)
            } else {
                None
            };

            let mut datagram = Vec::with_capacity(frame.packet_size);
            serial::write_header(&mut datagram, peer.outgoing_peer_id | header_flags, sent_time);
            let header_size = datagram.len();

            match &compressed {
                Some(compressed) => datagram.extend_from_slice(compressed),
                None => datagram.extend_from_slice(&frame.commands),
            }

            if let Some(checksum) = &self.checksum {
                let connect_id = if peer.outgoing_peer_id < MAXIMUM_PEER_ID {
                    peer.connect_id
                } else {
                    0
                };

                let mut check = Vec::with_capacity(header_size + frame.commands.len() + 4);
                check.extend_from_slice(&datagram[..header_size]);
                check.extend_from_slice(&frame.commands);
                check.extend_from_slice(&connect_id.to_be_bytes());

                datagram.extend_from_slice(&checksum(&check).to_be_bytes());
            }

            let address = match peer.address {
                Some(address) => address,
                None => continue,
            };

            peer.last_send_time = self.service_time;

            let sent = self.socket.send(address, &datagram)?;

            self.total_sent_data += sent as u64;
            self.total_sent_packets += 1;
            peer.total_data_sent += sent as u64;

            if peer.flush_then_reset
                && peer.outgoing_reliable_commands.is_empty()
                && peer.outgoing_unreliable_commands.is_empty()
            {
                peer.reset();
            }
        }

        Ok(false)
    }

    /// Drains the socket, up to the per-pass receive budget. Exhausting the
    /// budget without draining the socket is reported as an error, exactly
    /// like a failed read.
    pub(crate) fn receive_incoming_commands(
        &mut self,
        event: &mut Option<Event>,
    ) -> Result<bool, ServiceError> {
        for _ in 0..RECEIVE_BUDGET {
            let received = match self.socket.receive(&mut self.received_buffer) {
                Ok(Some(received)) => received,
                Ok(None) => return Ok(false),
                Err(error) if error.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(error) => return Err(error.into()),
            };

            let (length, address) = received;
            let length = length.min(self.mtu as usize);
            let datagram = self.received_buffer[..length].to_vec();

            self.total_received_data += length as u64;
            self.total_received_packets += 1;

            if let Some(intercept) = &mut self.intercept {
                match intercept(&address, &datagram) {
                    Intercept::Consume => continue,
                    Intercept::Error => return Err(ServiceError::Intercept),
                    Intercept::Pass => {}
                }
            }

            if self.handle_incoming_datagram(&datagram, address, event)? {
                return Ok(true);
            }
        }

        Err(ServiceError::ReceiveBudgetExhausted)
    }

    /// Validates and dispatches one received datagram: header checks, peer
    /// resolution, optional decompression and checksum verification, then
    /// the packed command stream.
    fn handle_incoming_datagram(
        &mut self,
        data: &[u8],
        received_address: Address,
        event: &mut Option<Event>,
    ) -> Result<bool, ServiceError> {
        let header = match serial::read_header(data) {
            Some(header) => header,
            None => return Ok(false),
        };
        let header_size = header.size();

        let mut current_peer = if header.peer_id == MAXIMUM_PEER_ID {
            None
        } else if header.peer_id as usize >= self.peers.len() {
            return Ok(false);
        } else {
            let index = header.peer_id as usize;
            let peer = self.peers[index].borrow();

            if matches!(peer.state, PeerState::Disconnected | PeerState::Zombie) {
                return Ok(false);
            }

            let address_matches = match peer.address {
                Some(address) => {
                    address.host() == received_address.host()
                        && address.port() == received_address.port()
                }
                None => false,
            };

            if !address_matches {
                return Ok(false);
            }

            if peer.outgoing_peer_id < MAXIMUM_PEER_ID
                && header.session_id != peer.incoming_session_id
            {
                trace!("peer {}: stale session id, dropping datagram", index);
                return Ok(false);
            }

            Some(index)
        };

        // With a checksum installed, the last four bytes of every datagram
        // are the trailer; everything between header and trailer is the
        // (possibly compressed) command section.
        let commands_end = if self.checksum.is_some() {
            if data.len() < header_size + serial::CHECKSUM_SIZE {
                return Ok(false);
            }
            data.len() - serial::CHECKSUM_SIZE
        } else {
            data.len()
        };

        if commands_end < header_size {
            return Ok(false);
        }

        let commands: Vec<u8> = if header.compressed {
            let compressor = match &mut self.compressor {
                Some(compressor) => compressor,
                None => return Ok(false),
            };

            let mut output = vec![0u8; MAXIMUM_MTU as usize];
            match compressor.decompress(&data[header_size..commands_end], &mut output) {
                Some(size) if size > 0 && size <= output.len() => {
                    output.truncate(size);
                    output
                }
                _ => {
                    trace!("dropping datagram from {}: bad decompress", received_address);
                    return Ok(false);
                }
            }
        } else {
            data[header_size..commands_end].to_vec()
        };

        if let Some(checksum) = &self.checksum {
            let expected = u32::from_be_bytes([
                data[commands_end],
                data[commands_end + 1],
                data[commands_end + 2],
                data[commands_end + 3],
            ]);

            let connect_id = current_peer
                .map(|index| self.peers[index].borrow().connect_id)
                .unwrap_or(0);

            let mut check = Vec::with_capacity(header_size + commands.len() + 4);
            check.extend_from_slice(&data[..header_size]);
            check.extend_from_slice(&commands);
            check.extend_from_slice(&connect_id.to_be_bytes());

            if checksum(&check) != expected {
                trace!("dropping datagram from {}: bad checksum", received_address);
                return Ok(false);
            }
        }

        if let Some(index) = current_peer {
            let mut peer = self.peers[index].borrow_mut();
            peer.address = Some(received_address);
            peer.incoming_data_total = peer.incoming_data_total.wrapping_add(data.len() as u32);
            peer.total_data_received += data.len() as u64;
        }

        let mut position = 0;

        while position < commands.len() {
            let (command, fixed_size) = match serial::read_command(&commands[position..]) {
                Some(parsed) => parsed,
                None => break,
            };

            position += fixed_size;

            let tag = command.kind.tag();

            // Before the handshake allocates a slot, the only acceptable
            // traffic is a single CONNECT and nothing else.
            if current_peer.is_none() && (tag != COMMAND_CONNECT || position < commands.len()) {
                break;
            }

            let data_length = match &command.kind {
                CommandKind::SendReliable { data_length } => Some(*data_length as usize),
                CommandKind::SendUnreliable { data_length, .. } => Some(*data_length as usize),
                CommandKind::SendUnsequenced { data_length, .. } => Some(*data_length as usize),
                CommandKind::SendFragment(fragment)
                | CommandKind::SendUnreliableFragment(fragment) => {
                    Some(fragment.data_length as usize)
                }
                _ => None,
            };

            let payload: &[u8] = match data_length {
                Some(data_length) => {
                    if data_length > self.maximum_packet_size
                        || position + data_length > commands.len()
                    {
                        return Ok(event.is_some());
                    }

                    let payload = &commands[position..position + data_length];
                    position += data_length;
                    payload
                }
                None => &[],
            };

            let handled: Result<(), crate::endpoint::CommandError> = match &command.kind {
                CommandKind::Connect(connect) => {
                    if current_peer.is_some() {
                        return Ok(event.is_some());
                    }

                    match self.handle_connect(received_address, connect) {
                        Some(index) => {
                            current_peer = Some(index);
                            Ok(())
                        }
                        None => return Ok(event.is_some()),
                    }
                }

                kind => {
                    let index = match current_peer {
                        Some(index) => index,
                        None => break,
                    };
                    let peer_rc = Rc::clone(&self.peers[index]);
                    let mut peer = peer_rc.borrow_mut();
                    let mut ctx = HostCtx {
                        service_time: self.service_time,
                        maximum_waiting_data: self.maximum_waiting_data,
                        outgoing_bandwidth: self.outgoing_bandwidth,
                        recalculate_bandwidth_limits: &mut self.recalculate_bandwidth_limits,
                        dispatch_queue: &mut self.dispatch_queue,
                    };

                    match kind {
                        CommandKind::Acknowledge(acknowledge) => {
                            match peer.handle_acknowledge(
                                &mut ctx,
                                command.header.channel_id,
                                acknowledge.received_reliable_sequence_number,
                                acknowledge.received_sent_time,
                            ) {
                                Ok(Some(protocol_event)) => {
                                    drop(peer);
                                    *event = Some(attach_peer(
                                        Peer::new(peer_rc),
                                        protocol_event,
                                    ));
                                    Ok(())
                                }
                                Ok(None) => Ok(()),
                                Err(error) => Err(error),
                            }
                        }

                        CommandKind::VerifyConnect(verify) => {
                            match peer.handle_verify_connect(&mut ctx, verify) {
                                Ok(Some(protocol_event)) => {
                                    drop(peer);
                                    *event = Some(attach_peer(
                                        Peer::new(peer_rc),
                                        protocol_event,
                                    ));
                                    Ok(())
                                }
                                Ok(None) => Ok(()),
                                Err(error) => Err(error),
                            }
                        }

                        CommandKind::Disconnect { data } => {
                            peer.handle_disconnect(&mut ctx, command.header.flags, *data)
                        }

                        CommandKind::Ping => peer.handle_ping(),

                        CommandKind::SendReliable { .. } => peer.handle_send_reliable(
                            &mut ctx,
                            command.header.channel_id,
                            command.header.reliable_sequence_number,
                            payload,
                        ),

                        CommandKind::SendUnreliable {
                            unreliable_sequence_number,
                            ..
                        } => peer.handle_send_unreliable(
                            &mut ctx,
                            command.header.channel_id,
                            command.header.reliable_sequence_number,
                            *unreliable_sequence_number,
                            payload,
                        ),

                        CommandKind::SendUnsequenced {
                            unsequenced_group, ..
                        } => peer.handle_send_unsequenced(
                            &mut ctx,
                            command.header.channel_id,
                            *unsequenced_group,
                            payload,
                        ),

                        CommandKind::SendFragment(fragment) => peer.handle_send_fragment(
                            &mut ctx,
                            command.header.channel_id,
                            fragment,
                            payload,
                        ),

                        CommandKind::SendUnreliableFragment(fragment) => peer
                            .handle_send_unreliable_fragment(
                                &mut ctx,
                                command.header.channel_id,
                                command.header.reliable_sequence_number,
                                fragment,
                                payload,
                            ),

                        CommandKind::BandwidthLimit {
                            incoming_bandwidth,
                            outgoing_bandwidth,
                        } => peer.handle_bandwidth_limit(
                            &mut ctx,
                            *incoming_bandwidth,
                            *outgoing_bandwidth,
                        ),

                        CommandKind::ThrottleConfigure {
                            packet_throttle_interval,
                            packet_throttle_acceleration,
                            packet_throttle_deceleration,
                        } => peer.handle_throttle_configure(
                            *packet_throttle_interval,
                            *packet_throttle_acceleration,
                            *packet_throttle_deceleration,
                        ),

                        CommandKind::Connect(_) => unreachable!(),
                    }
                }
            };

            if handled.is_err() {
                warn!(
                    "dropping rest of datagram from {}: command {} refused",
                    received_address, tag
                );
                return Ok(event.is_some());
            }

            // Acknowledgeable commands echo the datagram's send time so the
            // sender can measure round trips.
            if command.header.flags & COMMAND_FLAG_ACKNOWLEDGE != 0 {
                let index = match current_peer {
                    Some(index) => index,
                    None => break,
                };

                let sent_time = match header.sent_time {
                    Some(sent_time) => sent_time,
                    None => break,
                };

                let mut peer = self.peers[index].borrow_mut();

                match peer.state {
                    PeerState::Disconnecting
                    | PeerState::AcknowledgingConnect
                    | PeerState::Disconnected
                    | PeerState::Zombie => {}

                    PeerState::AcknowledgingDisconnect => {
                        if tag == COMMAND_DISCONNECT {
                            peer.queue_acknowledgement(
                                tag,
                                command.header.channel_id,
                                command.header.reliable_sequence_number,
                                sent_time,
                            );
                        }
                    }

                    _ => {
                        peer.queue_acknowledgement(
                            tag,
                            command.header.channel_id,
                            command.header.reliable_sequence_number,
                            sent_time,
                        );
                    }
                }
            }
        }

        Ok(event.is_some())
    }
}
