
pub(crate) mod serial;

pub(crate) const MINIMUM_MTU: u32 = 576;
pub(crate) const MAXIMUM_MTU: u32 = 4096;
pub(crate) const MAXIMUM_PACKET_COMMANDS: usize = 32;
pub(crate) const MINIMUM_WINDOW_SIZE: u32 = 4096;
pub(crate) const MAXIMUM_WINDOW_SIZE: u32 = 65536;
pub(crate) const MINIMUM_CHANNEL_COUNT: usize = 1;
pub(crate) const MAXIMUM_CHANNEL_COUNT: usize = 255;
pub(crate) const MAXIMUM_PEER_ID: u16 = 0xFFF;
pub(crate) const MAXIMUM_FRAGMENT_COUNT: u32 = 1024 * 1024;

// Command byte: low 4 bits select the command, the high bits are flags.
pub(crate) const COMMAND_MASK: u8 = 0x0F;
pub(crate) const COMMAND_FLAG_ACKNOWLEDGE: u8 = 1 << 7;
pub(crate) const COMMAND_FLAG_UNSEQUENCED: u8 = 1 << 6;

pub(crate) const COMMAND_ACKNOWLEDGE: u8 = 1;
pub(crate) const COMMAND_CONNECT: u8 = 2;
pub(crate) const COMMAND_VERIFY_CONNECT: u8 = 3;
pub(crate) const COMMAND_DISCONNECT: u8 = 4;
pub(crate) const COMMAND_PING: u8 = 5;
pub(crate) const COMMAND_SEND_RELIABLE: u8 = 6;
pub(crate) const COMMAND_SEND_UNRELIABLE: u8 = 7;
pub(crate) const COMMAND_SEND_FRAGMENT: u8 = 8;
pub(crate) const COMMAND_SEND_UNSEQUENCED: u8 = 9;
pub(crate) const COMMAND_BANDWIDTH_LIMIT: u8 = 10;
pub(crate) const COMMAND_THROTTLE_CONFIGURE: u8 = 11;
pub(crate) const COMMAND_SEND_UNRELIABLE_FRAGMENT: u8 = 12;
pub(crate) const COMMAND_COUNT: u8 = 13;

// Datagram header: 12 bits of peer id, 2 bits of session id, 2 flag bits.
pub(crate) const HEADER_FLAG_COMPRESSED: u16 = 1 << 14;
pub(crate) const HEADER_FLAG_SENT_TIME: u16 = 1 << 15;
pub(crate) const HEADER_FLAG_MASK: u16 = HEADER_FLAG_COMPRESSED | HEADER_FLAG_SENT_TIME;
pub(crate) const HEADER_SESSION_MASK: u16 = 3 << 12;
pub(crate) const HEADER_SESSION_SHIFT: u32 = 12;

pub(crate) const CONTROL_CHANNEL_ID: u8 = 0xFF;

// Fixed wire size of each command, including the 4-byte command header.
// Index 0 is unused.
pub(crate) const COMMAND_SIZES: [usize; COMMAND_COUNT as usize] =
    [0, 8, 48, 44, 8, 4, 6, 8, 24, 8, 12, 16, 24];

pub(crate) fn command_size(command_byte: u8) -> usize {
    COMMAND_SIZES[(command_byte & COMMAND_MASK) as usize]
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct CommandHeader {
    pub flags: u8,
    pub channel_id: u8,
    pub reliable_sequence_number: u16,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Acknowledge {
    pub received_reliable_sequence_number: u16,
    pub received_sent_time: u16,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Connect {
    pub outgoing_peer_id: u16,
    pub incoming_session_id: u8,
    pub outgoing_session_id: u8,
    pub mtu: u32,
    pub window_size: u32,
    pub channel_count: u32,
    pub incoming_bandwidth: u32,
    pub outgoing_bandwidth: u32,
    pub packet_throttle_interval: u32,
    pub packet_throttle_acceleration: u32,
    pub packet_throttle_deceleration: u32,
    pub connect_id: u32,
    pub data: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct VerifyConnect {
    pub outgoing_peer_id: u16,
    pub incoming_session_id: u8,
    pub outgoing_session_id: u8,
    pub mtu: u32,
    pub window_size: u32,
    pub channel_count: u32,
    pub incoming_bandwidth: u32,
    pub outgoing_bandwidth: u32,
    pub packet_throttle_interval: u32,
    pub packet_throttle_acceleration: u32,
    pub packet_throttle_deceleration: u32,
    pub connect_id: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct SendFragment {
    pub start_sequence_number: u16,
    pub data_length: u16,
    pub fragment_count: u32,
    pub fragment_number: u32,
    pub total_length: u32,
    pub fragment_offset: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum CommandKind {
    Acknowledge(Acknowledge),
    Connect(Connect),
    VerifyConnect(VerifyConnect),
    Disconnect {
        data: u32,
    },
    Ping,
    SendReliable {
        data_length: u16,
    },
    SendUnreliable {
        unreliable_sequence_number: u16,
        data_length: u16,
    },
    SendFragment(SendFragment),
    SendUnsequenced {
        unsequenced_group: u16,
        data_length: u16,
    },
    BandwidthLimit {
        incoming_bandwidth: u32,
        outgoing_bandwidth: u32,
    },
    ThrottleConfigure {
        packet_throttle_interval: u32,
        packet_throttle_acceleration: u32,
        packet_throttle_deceleration: u32,
    },
    SendUnreliableFragment(SendFragment),
}

impl CommandKind {
    pub fn tag(&self) -> u8 {
        match self {
            CommandKind::Acknowledge(_) => COMMAND_ACKNOWLEDGE,
            CommandKind::Connect(_) => COMMAND_CONNECT,
            CommandKind::VerifyConnect(_) => COMMAND_VERIFY_CONNECT,
            CommandKind::Disconnect { .. } => COMMAND_DISCONNECT,
            CommandKind::Ping => COMMAND_PING,
            CommandKind::SendReliable { .. } => COMMAND_SEND_RELIABLE,
            CommandKind::SendUnreliable { .. } => COMMAND_SEND_UNRELIABLE,
            CommandKind::SendFragment(_) => COMMAND_SEND_FRAGMENT,
            CommandKind::SendUnsequenced { .. } => COMMAND_SEND_UNSEQUENCED,
            CommandKind::BandwidthLimit { .. } => COMMAND_BANDWIDTH_LIMIT,
            CommandKind::ThrottleConfigure { .. } => COMMAND_THROTTLE_CONFIGURE,
            CommandKind::SendUnreliableFragment(_) => COMMAND_SEND_UNRELIABLE_FRAGMENT,
        }
    }

    pub fn size(&self) -> usize {
        command_size(self.tag())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Command {
    pub header: CommandHeader,
    pub kind: CommandKind,
}

impl Command {
    pub fn command_byte(&self) -> u8 {
        self.kind.tag() | self.header.flags
    }

    pub fn size(&self) -> usize {
        self.kind.size()
    }
}
