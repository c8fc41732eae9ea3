
use std::time;

use ulink::packet;
use ulink::Address;
use ulink::Event;
use ulink::Host;
use ulink::Packet;
use ulink::PeerState;

fn connected_pair() -> (Host, Host, ulink::Peer, ulink::Peer) {
    let mut server = Host::new(Some(Address::localhost(0)), 8, 1, 0, 0).unwrap();
    let mut client = Host::new(None, 1, 1, 0, 0).unwrap();

    let server_address = Address::localhost(server.address().port());
    let client_peer = client.connect(server_address, 1, 0).unwrap();

    let deadline = time::Instant::now() + time::Duration::from_secs(10);
    let mut server_peer = None;
    let mut client_connected = false;

    while time::Instant::now() < deadline && !(server_peer.is_some() && client_connected) {
        if let Some(Event::Connect { peer, .. }) = server.service(1).unwrap() {
            server_peer = Some(peer);
        }
        if let Some(Event::Connect { .. }) = client.service(1).unwrap() {
            client_connected = true;
        }
    }

    (server, client, client_peer, server_peer.expect("handshake stalled"))
}

#[test]
fn test_graceful_disconnect_notifies_both_sides() {
    let (mut server, mut client, client_peer, _server_peer) = connected_pair();

    client_peer.disconnect(42);

    let deadline = time::Instant::now() + time::Duration::from_secs(10);
    let mut server_data = None;
    let mut client_data = None;

    while time::Instant::now() < deadline && !(server_data.is_some() && client_data.is_some()) {
        if let Some(Event::Disconnect { data, .. }) = server.service(1).unwrap() {
            server_data = Some(data);
        }
        if let Some(Event::Disconnect { data, .. }) = client.service(1).unwrap() {
            client_data = Some(data);
        }
    }

    // The remote side observes the user data; the initiator's own event
    // carries none.
    assert_eq!(server_data, Some(42));
    assert_eq!(client_data, Some(0));
    assert_eq!(client_peer.state(), PeerState::Disconnected);
}

#[test]
fn test_disconnect_later_drains_queue_first() {
    let (mut server, mut client, client_peer, _server_peer) = connected_pair();

    for index in 0..3u8 {
        client_peer
            .send(0, &Packet::new(&[index; 1024], packet::FLAG_RELIABLE))
            .unwrap();
    }
    client_peer.disconnect_later(7);
    assert_eq!(client_peer.state(), PeerState::DisconnectLater);

    let deadline = time::Instant::now() + time::Duration::from_secs(10);
    let mut received = 0;
    let mut server_data = None;

    while time::Instant::now() < deadline && server_data.is_none() {
        match server.service(1).unwrap() {
            Some(Event::Receive { packet, .. }) => {
                assert_eq!(packet.len(), 1024);
                received += 1;
            }
            Some(Event::Disconnect { data, .. }) => {
                server_data = Some(data);
            }
            _ => {}
        }

        client.service(1).unwrap();
    }

    // Every queued packet arrived before the disconnect did.
    assert_eq!(received, 3);
    assert_eq!(server_data, Some(7));
}

#[test]
fn test_disconnect_now_is_silent_locally() {
    let (mut server, mut client, client_peer, _server_peer) = connected_pair();

    client_peer.disconnect_now(9);

    let deadline = time::Instant::now() + time::Duration::from_secs(10);
    let mut server_data = None;

    while time::Instant::now() < deadline && server_data.is_none() {
        if let Some(Event::Disconnect { data, .. }) = server.service(1).unwrap() {
            server_data = Some(data);
        }

        // The initiator never sees an event for its own forced teardown.
        assert!(client.service(1).unwrap().is_none());
    }

    assert_eq!(server_data, Some(9));
    assert_eq!(client_peer.state(), PeerState::Disconnected);
}

#[test]
fn test_reset_times_out_remote() {
    let (mut server, _client, client_peer, server_peer) = connected_pair();

    // A hard reset sends nothing; the server only notices once its own
    // timeout envelope expires.
    client_peer.reset();
    assert_eq!(client_peer.state(), PeerState::Disconnected);

    server_peer.timeout(2, 100, 400);
    server_peer.ping_interval(50);

    let deadline = time::Instant::now() + time::Duration::from_secs(15);
    let mut timed_out = false;

    while time::Instant::now() < deadline && !timed_out {
        if let Some(Event::Timeout { .. }) = server.service(10).unwrap() {
            timed_out = true;
        }
    }

    assert!(timed_out);
    assert_eq!(server_peer.state(), PeerState::Disconnected);
}
