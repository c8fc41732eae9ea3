
use std::time;

use ulink::packet;
use ulink::Address;
use ulink::Event;
use ulink::Host;
use ulink::Packet;
use ulink::PeerState;

fn run_until<F: FnMut(&mut Host, &mut Host) -> bool>(
    server: &mut Host,
    client: &mut Host,
    timeout: time::Duration,
    mut done: F,
) {
    let deadline = time::Instant::now() + timeout;

    while time::Instant::now() < deadline {
        if done(server, client) {
            return;
        }
    }

    panic!("condition not reached within {:?}", timeout);
}

fn host_pair() -> (Host, Host) {
    let server = Host::new(Some(Address::localhost(0)), 8, 2, 0, 0).unwrap();
    let client = Host::new(None, 1, 2, 0, 0).unwrap();
    (server, client)
}

#[test]
fn test_connect_and_hello() {
    let (mut server, mut client) = host_pair();
    let server_address = Address::localhost(server.address().port());

    let client_peer = client.connect(server_address, 2, 77).unwrap();
    assert_eq!(client_peer.state(), PeerState::Connecting);

    let mut client_connected = false;
    let mut server_connect_data = None;
    let mut received = None;

    run_until(
        &mut server,
        &mut client,
        time::Duration::from_secs(10),
        |server, client| {
            match server.service(1).unwrap() {
                Some(Event::Connect { data, .. }) => {
                    server_connect_data = Some(data);
                }
                Some(Event::Receive {
                    channel_id, packet, ..
                }) => {
                    received = Some((channel_id, packet.data().to_vec()));
                }
                _ => {}
            }

            if let Some(Event::Connect { .. }) = client.service(1).unwrap() {
                client_connected = true;

                let packet = Packet::new(b"hello", packet::FLAG_RELIABLE);
                client_peer.send(0, &packet).unwrap();
            }

            received.is_some()
        },
    );

    assert!(client_connected);
    assert_eq!(server_connect_data, Some(77));
    assert_eq!(received, Some((0, b"hello".to_vec())));
    assert_eq!(client_peer.state(), PeerState::Connected);
}

#[test]
fn test_server_initiated_disconnect_carries_data() {
    let (mut server, mut client) = host_pair();
    let server_address = Address::localhost(server.address().port());

    let _client_peer = client.connect(server_address, 1, 0).unwrap();

    let mut server_peer = None;
    let mut client_disconnect_data = None;

    run_until(
        &mut server,
        &mut client,
        time::Duration::from_secs(10),
        |server, client| {
            match server.service(1).unwrap() {
                Some(Event::Connect { peer, .. }) => {
                    peer.disconnect(42);
                    server_peer = Some(peer);
                }
                _ => {}
            }

            if let Some(Event::Disconnect { data, .. }) = client.service(1).unwrap() {
                client_disconnect_data = Some(data);
            }

            client_disconnect_data.is_some()
        },
    );

    assert_eq!(client_disconnect_data, Some(42));
    assert_eq!(server_peer.unwrap().state(), PeerState::Disconnected);
}

#[test]
fn test_broadcast_reaches_all_clients() {
    let mut server = Host::new(Some(Address::localhost(0)), 8, 1, 0, 0).unwrap();
    let server_address = Address::localhost(server.address().port());

    let mut client_a = Host::new(None, 1, 1, 0, 0).unwrap();
    let mut client_b = Host::new(None, 1, 1, 0, 0).unwrap();

    client_a.connect(server_address, 1, 0).unwrap();
    client_b.connect(server_address, 1, 0).unwrap();

    let mut connected = 0;
    let mut broadcast_sent = false;
    let mut received = 0;

    let deadline = time::Instant::now() + time::Duration::from_secs(10);
    while time::Instant::now() < deadline && received < 2 {
        if let Some(Event::Connect { .. }) = server.service(1).unwrap() {
            connected += 1;
        }

        if connected == 2 && !broadcast_sent {
            broadcast_sent = true;
            server.broadcast(0, &Packet::new(b"general call", packet::FLAG_RELIABLE));
        }

        for client in [&mut client_a, &mut client_b] {
            if let Some(Event::Receive { packet, .. }) = client.service(1).unwrap() {
                assert_eq!(packet.data(), b"general call");
                received += 1;
            }
        }
    }

    assert_eq!(received, 2);
}

#[test]
fn test_checksum_protected_session() {
    let mut server = Host::new(Some(Address::localhost(0)), 8, 1, 0, 0).unwrap();
    let mut client = Host::new(None, 1, 1, 0, 0).unwrap();

    server.set_checksum(Some(Box::new(ulink::crc32)));
    client.set_checksum(Some(Box::new(ulink::crc32)));

    let server_address = Address::localhost(server.address().port());
    let client_peer = client.connect(server_address, 1, 0).unwrap();

    let mut received = None;

    run_until(
        &mut server,
        &mut client,
        time::Duration::from_secs(10),
        |server, client| {
            if let Some(Event::Receive { packet, .. }) = server.service(1).unwrap() {
                received = Some(packet.data().to_vec());
            }

            if let Some(Event::Connect { .. }) = client.service(1).unwrap() {
                client_peer
                    .send(0, &Packet::new(b"checksummed", packet::FLAG_RELIABLE))
                    .unwrap();
            }

            received.is_some()
        },
    );

    assert_eq!(received.unwrap(), b"checksummed");
}

#[test]
fn test_peer_slots_exhausted() {
    let mut client = Host::new(None, 1, 1, 0, 0).unwrap();

    client.connect(Address::localhost(4000), 1, 0).unwrap();
    assert!(client.connect(Address::localhost(4001), 1, 0).is_err());
}
