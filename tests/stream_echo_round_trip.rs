//! Black-box coverage of the stream link driven through the real event
//! loop (`GrachtServer::run`), rather than the private per-step methods
//! exercised by `server.rs`'s own unit tests.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::Duration;

use gracht::{ActionContext, ActionDescriptor, GrachtServer, GrachtServerConfig, Link, Message, ParamValue, UnixSocketLink};

const ECHO_PROTOCOL: u8 = 1;
const ECHO_ACTION: u8 = 1;

fn echo_action() -> ActionDescriptor {
    ActionDescriptor {
        action_id: ECHO_ACTION,
        handler: Arc::new(|ctx: &ActionContext| {
            let _ = ctx.respond(ctx.params.clone());
        }),
    }
}

#[test]
fn client_connects_sends_request_and_reads_a_response_through_the_real_event_loop() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gracht.sock");

    let link = UnixSocketLink::new(Some(path.clone()), None, 4096);
    let config = GrachtServerConfig::new(Box::new(link) as Box<dyn Link>).workers(0).max_message_size(4096);
    let mut server = GrachtServer::initialize(config).unwrap();
    server.register_protocol(ECHO_PROTOCOL, vec![echo_action()]).unwrap();

    std::thread::spawn(move || {
        let _ = server.run();
    });

    // Give the accept listener time to come up before dialing it.
    std::thread::sleep(Duration::from_millis(100));
    let mut client = UnixStream::connect(&path).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

    let request = Message::new(55, ECHO_PROTOCOL, ECHO_ACTION, vec![ParamValue::Scalar32(1234)], vec![]);
    client.write_all(&request.encode()).unwrap();

    let mut buf = [0u8; 256];
    let n = client.read(&mut buf).unwrap();
    let decoded = Message::decode(&buf[..n], 4096).unwrap();
    assert_eq!(decoded.header.id, 55);
    assert_eq!(decoded.params[0], ParamValue::Scalar32(1234));
}
