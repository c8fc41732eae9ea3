
use std::time;

use ulink::packet;
use ulink::Address;
use ulink::Compressor;
use ulink::Event;
use ulink::Host;
use ulink::Packet;

static NUM_CHANNELS: usize = 4;

fn connected_pair(channels: usize) -> (Host, Host, ulink::Peer) {
    let mut server = Host::new(Some(Address::localhost(0)), 8, channels, 0, 0).unwrap();
    let mut client = Host::new(None, 1, channels, 0, 0).unwrap();

    let server_address = Address::localhost(server.address().port());
    let client_peer = client.connect(server_address, channels, 0).unwrap();

    let deadline = time::Instant::now() + time::Duration::from_secs(10);
    let mut server_connected = false;
    let mut client_connected = false;

    while time::Instant::now() < deadline && !(server_connected && client_connected) {
        if let Some(Event::Connect { .. }) = server.service(1).unwrap() {
            server_connected = true;
        }
        if let Some(Event::Connect { .. }) = client.service(1).unwrap() {
            client_connected = true;
        }
    }

    assert!(server_connected && client_connected, "handshake stalled");

    (server, client, client_peer)
}

#[test]
fn test_fragmented_packet_reassembles() {
    let (mut server, mut client, client_peer) = connected_pair(1);

    // Larger than one fragment at the default MTU of 1400, so the packet
    // travels as multiple SEND_FRAGMENT commands.
    let payload: Vec<u8> = (0..2000u32).map(|i| (i * 31 % 251) as u8).collect();

    client_peer
        .send(0, &Packet::new(&payload, packet::FLAG_RELIABLE))
        .unwrap();

    let deadline = time::Instant::now() + time::Duration::from_secs(10);
    let mut received = None;

    while time::Instant::now() < deadline && received.is_none() {
        if let Some(Event::Receive { packet, .. }) = server.service(1).unwrap() {
            received = Some(packet);
        }
        client.service(1).unwrap();
    }

    let received = received.expect("fragmented packet never arrived");
    assert_eq!(received.len(), 2000);
    assert_eq!(received.data(), &payload[..]);
}

#[test]
fn test_reliable_transfer_is_ordered_per_channel() {
    let (mut server, mut client, client_peer) = connected_pair(NUM_CHANNELS);

    let mut sent: Vec<Vec<u8>> = vec![Vec::new(); NUM_CHANNELS];
    let mut received: Vec<Vec<u8>> = vec![Vec::new(); NUM_CHANNELS];

    let packet_count = 20;
    let mut total_received = 0;

    for _ in 0..packet_count {
        let size = 500 + rand::random::<usize>() % 2000;
        let data: Vec<u8> = (0..size).map(|_| rand::random::<u8>()).collect();
        let channel_id = rand::random::<u8>() % NUM_CHANNELS as u8;

        sent[channel_id as usize].extend_from_slice(&data);
        client_peer
            .send(channel_id, &Packet::new(&data, packet::FLAG_RELIABLE))
            .unwrap();
    }

    let deadline = time::Instant::now() + time::Duration::from_secs(30);

    while time::Instant::now() < deadline && total_received < packet_count {
        if let Some(Event::Receive {
            channel_id, packet, ..
        }) = server.service(1).unwrap()
        {
            received[channel_id as usize].extend_from_slice(packet.data());
            total_received += 1;
        }
        client.service(1).unwrap();
    }

    assert_eq!(total_received, packet_count);

    // Byte-for-byte ordered delivery within each channel.
    for (sent, received) in sent.iter().zip(received.iter()) {
        assert_eq!(md5::compute(sent), md5::compute(received));
    }
}

#[test]
fn test_unreliable_transfer_on_idle_link() {
    let (mut server, mut client, client_peer) = connected_pair(1);

    // With no loss and no bandwidth pressure the throttle stays open, so
    // every unreliable packet arrives, in order.
    for index in 0..10u8 {
        client_peer.send(0, &Packet::new(&[index], 0)).unwrap();
    }

    let deadline = time::Instant::now() + time::Duration::from_secs(10);
    let mut received = Vec::new();

    while time::Instant::now() < deadline && received.len() < 10 {
        if let Some(Event::Receive { packet, .. }) = server.service(1).unwrap() {
            received.push(packet.data()[0]);
        }
        client.service(1).unwrap();
    }

    assert_eq!(received, (0..10).collect::<Vec<u8>>());
}

#[test]
fn test_unsequenced_delivery() {
    let (mut server, mut client, client_peer) = connected_pair(1);

    for index in 0..5u8 {
        client_peer
            .send(0, &Packet::new(&[index], packet::FLAG_UNSEQUENCED))
            .unwrap();
    }

    let deadline = time::Instant::now() + time::Duration::from_secs(10);
    let mut received = Vec::new();

    while time::Instant::now() < deadline && received.len() < 5 {
        if let Some(Event::Receive { packet, .. }) = server.service(1).unwrap() {
            assert_eq!(packet.flags() & packet::FLAG_UNSEQUENCED, packet::FLAG_UNSEQUENCED);
            received.push(packet.data()[0]);
        }
        client.service(1).unwrap();
    }

    // At-most-once: five sends, five distinct deliveries.
    received.sort_unstable();
    assert_eq!(received, (0..5).collect::<Vec<u8>>());
}

// Run-length coding, enough to exercise the compressed-datagram path on
// payloads with long byte runs.
struct RunLength;

impl Compressor for RunLength {
    fn compress(&mut self, input: &[u8], output: &mut [u8]) -> Option<usize> {
        let mut written = 0;
        let mut index = 0;

        while index < input.len() {
            let byte = input[index];
            let mut run = 1;
            while index + run < input.len() && input[index + run] == byte && run < 255 {
                run += 1;
            }

            if written + 2 > output.len() {
                return None;
            }

            output[written] = run as u8;
            output[written + 1] = byte;
            written += 2;
            index += run;
        }

        Some(written)
    }

    fn decompress(&mut self, input: &[u8], output: &mut [u8]) -> Option<usize> {
        let mut written = 0;

        for pair in input.chunks(2) {
            if pair.len() != 2 {
                return None;
            }

            let run = pair[0] as usize;
            if written + run > output.len() {
                return None;
            }

            output[written..written + run].fill(pair[1]);
            written += run;
        }

        Some(written)
    }
}

#[test]
fn test_compressed_session() {
    let mut server = Host::new(Some(Address::localhost(0)), 8, 1, 0, 0).unwrap();
    let mut client = Host::new(None, 1, 1, 0, 0).unwrap();

    server.compress(Some(Box::new(RunLength)));
    client.compress(Some(Box::new(RunLength)));

    let server_address = Address::localhost(server.address().port());
    let client_peer = client.connect(server_address, 1, 0).unwrap();

    let deadline = time::Instant::now() + time::Duration::from_secs(10);
    let mut received = None;

    while time::Instant::now() < deadline && received.is_none() {
        if let Some(Event::Receive { packet, .. }) = server.service(1).unwrap() {
            received = Some(packet);
        }

        if let Some(Event::Connect { .. }) = client.service(1).unwrap() {
            // A highly compressible payload, so the compressed flag is
            // actually taken on the wire.
            client_peer
                .send(0, &Packet::new(&[0u8; 1200], packet::FLAG_RELIABLE))
                .unwrap();
        }
    }

    let received = received.expect("compressed packet never arrived");
    assert_eq!(received.data(), &[0u8; 1200][..]);
}
