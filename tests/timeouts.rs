
use std::time;

use ulink::Address;
use ulink::Event;
use ulink::Host;
use ulink::PeerState;

#[test]
fn test_unserviced_remote_times_out() {
    let mut server = Host::new(Some(Address::localhost(0)), 8, 1, 0, 0).unwrap();
    let mut client = Host::new(None, 1, 1, 0, 0).unwrap();

    let server_address = Address::localhost(server.address().port());
    let client_peer = client.connect(server_address, 1, 0).unwrap();

    let deadline = time::Instant::now() + time::Duration::from_secs(10);
    let mut connected = false;

    while time::Instant::now() < deadline && !connected {
        server.service(1).unwrap();
        if let Some(Event::Connect { .. }) = client.service(1).unwrap() {
            connected = true;
        }
    }
    assert!(connected, "handshake stalled");

    // Shrink the timeout envelope, then stop servicing the server. The
    // client's keep-alives go unacknowledged until the envelope trips.
    client_peer.timeout(2, 100, 400);
    client_peer.ping_interval(50);

    let deadline = time::Instant::now() + time::Duration::from_secs(15);
    let mut timed_out = false;

    while time::Instant::now() < deadline && !timed_out {
        match client.service(10).unwrap() {
            Some(Event::Timeout { peer }) => {
                assert_eq!(peer.state(), PeerState::Disconnected);
                timed_out = true;
            }
            Some(event) => panic!("unexpected event: {:?}", event),
            None => {}
        }
    }

    assert!(timed_out, "client never timed out");
}

#[test]
fn test_connect_to_silent_address_times_out() {
    // Nothing is listening on the far side; the connection attempt must
    // eventually give up rather than retry forever.
    let silent = Host::new(Some(Address::localhost(0)), 1, 1, 0, 0).unwrap();
    let silent_address = Address::localhost(silent.address().port());

    let mut client = Host::new(None, 1, 1, 0, 0).unwrap();
    let client_peer = client.connect(silent_address, 1, 0).unwrap();
    client_peer.timeout(2, 100, 400);

    let deadline = time::Instant::now() + time::Duration::from_secs(15);
    let mut timed_out = false;

    while time::Instant::now() < deadline && !timed_out {
        match client.service(10).unwrap() {
            Some(Event::Timeout { .. }) => {
                timed_out = true;
            }
            Some(event) => panic!("unexpected event: {:?}", event),
            None => {}
        }
    }

    assert!(timed_out);
    assert_eq!(client_peer.state(), PeerState::Disconnected);
}
