//! Black-box coverage of the datagram-peer promotion path: an unregistered
//! datagram sender subscribes, gets promoted to a client record keyed by a
//! deterministic peer handle, and then receives a broadcast addressed to
//! the protocol it subscribed to.

use std::os::unix::net::{SocketAddr, UnixDatagram};
use std::time::Duration;

use gracht::{GrachtServer, GrachtServerConfig, Link, Message, ParamValue, UnixSocketLink};

const CONTROL_PROTOCOL: u8 = 0;
const CONTROL_ACTION_SUBSCRIBE: u8 = 0;

#[test]
fn datagram_peer_subscribes_then_receives_broadcast() {
    let dir = tempfile::tempdir().unwrap();
    let server_path = dir.path().join("gracht.dgram.sock");
    let peer_path = dir.path().join("peer.sock");

    let link = UnixSocketLink::new(None, Some(server_path.clone()), 4096);
    let config = GrachtServerConfig::new(Box::new(link) as Box<dyn Link>).workers(0).max_message_size(4096);
    let mut server = GrachtServer::initialize(config).unwrap();
    let handle = server.handle();

    std::thread::spawn(move || {
        let _ = server.run();
    });

    let peer = UnixDatagram::bind(&peer_path).unwrap();
    peer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

    let subscribe = Message::new(1, CONTROL_PROTOCOL, CONTROL_ACTION_SUBSCRIBE, vec![ParamValue::Scalar8(2)], vec![]);
    peer.send_to_addr(&subscribe.encode(), &SocketAddr::from_pathname(&server_path).unwrap()).unwrap();

    // Give the event loop a moment to drain the subscribe before broadcasting.
    std::thread::sleep(Duration::from_millis(200));
    handle.broadcast_event(2, 3, vec![ParamValue::Scalar32(123)]);

    let mut buf = [0u8; 256];
    let n = peer.recv(&mut buf).unwrap();
    let decoded = Message::decode(&buf[..n], 4096).unwrap();
    assert_eq!(decoded.header.protocol, 2);
    assert_eq!(decoded.header.action, 3);
    assert_eq!(decoded.params[0], ParamValue::Scalar32(123));
}

#[test]
fn datagram_peer_not_subscribed_does_not_receive_other_protocol_broadcast() {
    let dir = tempfile::tempdir().unwrap();
    let server_path = dir.path().join("gracht.dgram.sock");
    let peer_path = dir.path().join("peer.sock");

    let link = UnixSocketLink::new(None, Some(server_path.clone()), 4096);
    let config = GrachtServerConfig::new(Box::new(link) as Box<dyn Link>).workers(0).max_message_size(4096);
    let mut server = GrachtServer::initialize(config).unwrap();
    let handle = server.handle();

    std::thread::spawn(move || {
        let _ = server.run();
    });

    let peer = UnixDatagram::bind(&peer_path).unwrap();
    peer.set_read_timeout(Some(Duration::from_millis(300))).unwrap();

    let subscribe = Message::new(1, CONTROL_PROTOCOL, CONTROL_ACTION_SUBSCRIBE, vec![ParamValue::Scalar8(2)], vec![]);
    peer.send_to_addr(&subscribe.encode(), &SocketAddr::from_pathname(&server_path).unwrap()).unwrap();
    std::thread::sleep(Duration::from_millis(200));

    handle.broadcast_event(9, 1, vec![]);

    let mut buf = [0u8; 256];
    let result = peer.recv(&mut buf);
    assert!(result.is_err(), "peer subscribed only to protocol 2 must not receive a protocol 9 broadcast");
}
