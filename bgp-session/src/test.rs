// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Engine tests over loopback. The engine runs on its own thread; the test
//! plays the remote speaker on a plain blocking socket and the RDE and main
//! process on the other ends of the engine's channels.

use crate::capabilities::{Aid, GrLevel};
use crate::config::{GlobalConfig, ListenerConfig, PeerConfig};
use crate::engine::SessionEngine;
use crate::error::Error;
use crate::fsm::SessionState;
use crate::ipc::{
    channel, CtlRequest, Endpoint, FromParent, FromRde, NeighborSelector,
    ToParent, ToRde,
};
use crate::messages::{
    frame, Header, Message, MessageType, OpenMessage, MAX_EXT_MESSAGE_SIZE,
    MAX_MESSAGE_SIZE,
};
use crate::peer::PEER_ID_DYN_MAX;
use pretty_assertions::assert_eq;
use pretty_hex::*;
use slog::{Drain, Logger};
use std::io::{ErrorKind, Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpStream};
use std::thread::JoinHandle;
use std::time::Duration;

const LOCAL_AS: u32 = 65001;
const REMOTE_AS: u16 = 65000;
const REMOTE_ID: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
const TIMEOUT: Duration = Duration::from_secs(10);

lazy_static! {
    static ref LOG: Logger = {
        let decorator = slog_term::TermDecorator::new().build();
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        let drain = slog_envlogger::new(drain).fuse();
        let drain = slog_async::Async::new(drain).build().fuse();
        Logger::root(drain, slog::o!())
    };
}

struct Harness {
    parent: Endpoint<FromParent, ToParent>,
    rde: Endpoint<FromRde, ToRde>,
    addr: SocketAddr,
    engine: JoinHandle<Result<(), Error>>,
}

fn global() -> GlobalConfig {
    GlobalConfig {
        asn: LOCAL_AS,
        bgpid: Ipv4Addr::new(10, 0, 0, 1),
        ..Default::default()
    }
}

fn loopback_peer() -> PeerConfig {
    let mut conf =
        PeerConfig::new(1, "127.0.0.1".parse().unwrap(), u32::from(REMOTE_AS));
    conf.descr = "loopback".into();
    conf.passive = true;
    conf
}

fn start(peers: Vec<PeerConfig>) -> Harness {
    let (ours, parent) =
        channel::<ToParent, FromParent>().expect("parent channel");
    let (to_rde, rde) = channel::<ToRde, FromRde>().expect("rde channel");

    let mut engine = SessionEngine::new(global(), ours, LOG.clone());
    engine.ctx.rde = Some(to_rde);
    for p in peers {
        engine.add_peer(p).expect("add peer");
    }
    let addr = engine
        .listen(ListenerConfig {
            addr: "127.0.0.1:0".parse().unwrap(),
        })
        .expect("listen");

    let engine = std::thread::Builder::new()
        .name("session-engine".into())
        .spawn(move || engine.run())
        .expect("spawn engine");

    Harness {
        parent,
        rde,
        addr,
        engine,
    }
}

impl Harness {
    fn connect(&self) -> TcpStream {
        let s = TcpStream::connect(self.addr).expect("connect");
        s.set_read_timeout(Some(TIMEOUT)).expect("read timeout");
        s
    }

    fn rde_recv(&self) -> ToRde {
        self.rde
            .recv_timeout(TIMEOUT)
            .expect("rde channel")
            .expect("rde message")
    }

    /// Wait for the RDE to learn of an established session.
    fn expect_session_up(&self, peer_id: u32) -> ToRde {
        match self.rde_recv() {
            ToRde::SessionAdd { peer_id: id, .. } => assert_eq!(id, peer_id),
            other => panic!("expected session add, got {other:?}"),
        }
        let up = self.rde_recv();
        assert!(
            matches!(up, ToRde::SessionUp { peer_id: id, .. } if id == peer_id)
        );
        up
    }

    fn show(&self) -> Vec<crate::peer::NeighborInfo> {
        let (tx, rx) = std::sync::mpsc::channel();
        self.parent
            .send(FromParent::Ctl(CtlRequest::Show {
                neighbor: NeighborSelector::All,
                reply: tx,
            }))
            .expect("show");
        rx.recv_timeout(TIMEOUT).expect("show reply")
    }

    fn shutdown(self) {
        self.parent.send(FromParent::Shutdown).expect("shutdown");
        self.engine
            .join()
            .expect("engine thread")
            .expect("engine result");
    }
}

fn read_message(s: &mut TcpStream) -> (MessageType, Vec<u8>) {
    let mut raw = [0u8; Header::WIRE_SIZE];
    s.read_exact(&mut raw).expect("read header");
    let header =
        Header::validate(&raw, MAX_EXT_MESSAGE_SIZE).expect("valid header");
    let mut body = vec![0u8; usize::from(header.length) - Header::WIRE_SIZE];
    s.read_exact(&mut body).expect("read body");
    println!("received {}: {}", header.typ, body.hex_dump());
    (header.typ, body)
}

fn expect_closed(s: &mut TcpStream) {
    let mut buf = [0u8; 1];
    match s.read(&mut buf) {
        Ok(0) => {}
        Err(e) if e.kind() == ErrorKind::ConnectionReset => {}
        other => panic!("expected closed connection, got {other:?}"),
    }
}

fn send_open(s: &mut TcpStream, asn: u16, capabilities: Vec<u8>) {
    let open = OpenMessage::new(asn, 90, u32::from(REMOTE_ID), capabilities);
    let buf = Message::from(open)
        .to_frame(MAX_MESSAGE_SIZE)
        .expect("frame open");
    s.write_all(&buf).expect("send open");
}

fn send_keepalive(s: &mut TcpStream) {
    let buf =
        frame(MessageType::KeepAlive, &[], MAX_MESSAGE_SIZE).expect("frame");
    s.write_all(&buf).expect("send keepalive");
}

/// Run the OPEN exchange up to the point where both sides are established.
fn establish(s: &mut TcpStream, asn: u16, capabilities: Vec<u8>) {
    let (typ, body) = read_message(s);
    assert_eq!(typ, MessageType::Open);
    let open = OpenMessage::from_wire(&body).expect("parse open");
    assert_eq!(open.asn, LOCAL_AS as u16);
    assert_eq!(open.id, u32::from(Ipv4Addr::new(10, 0, 0, 1)));

    send_open(s, asn, capabilities);
    let (typ, _) = read_message(s);
    assert_eq!(typ, MessageType::KeepAlive);
    send_keepalive(s);
}

#[test]
fn session_establishes_without_capabilities() {
    let h = start(vec![loopback_peer()]);
    let mut s = h.connect();

    establish(&mut s, REMOTE_AS, Vec::new());
    match h.expect_session_up(1) {
        ToRde::SessionUp { info, .. } => {
            assert_eq!(info.remote_as, u32::from(REMOTE_AS));
            assert_eq!(info.remote_bgpid, u32::from(REMOTE_ID));
            assert!(info.ebgp);
            let families: Vec<Aid> = info.capabilities.families().collect();
            assert_eq!(families, vec![Aid::Inet]);
            assert!(!info.capabilities.as4byte);
        }
        _ => unreachable!(),
    }

    let peers = h.show();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].state, SessionState::Established);
    assert_eq!(peers[0].holdtime, 90);
    assert_eq!(peers[0].rcvd.open, 1);
    assert_eq!(peers[0].sent.keepalive, 1);

    h.shutdown();

    let (typ, body) = read_message(&mut s);
    assert_eq!(typ, MessageType::Notification);
    assert_eq!(&body[..2], &[6, 2]);
    let reason = "bgpd shutting down";
    assert_eq!(usize::from(body[2]), reason.len());
    assert_eq!(&body[3..], reason.as_bytes());
    expect_closed(&mut s);
}

#[test]
fn zero_four_byte_as_is_refused() {
    let h = start(vec![loopback_peer()]);
    let mut s = h.connect();

    let (typ, _) = read_message(&mut s);
    assert_eq!(typ, MessageType::Open);
    send_open(&mut s, REMOTE_AS, vec![65, 4, 0, 0, 0, 0]);

    let (typ, body) = read_message(&mut s);
    assert_eq!(typ, MessageType::Notification);
    assert_eq!(body, vec![2, 2]);
    expect_closed(&mut s);

    let peers = h.show();
    assert_eq!(peers[0].state, SessionState::Idle);
    assert!(peers[0].last_sent_error.is_some());
    assert_eq!(peers[0].sent.notification, 1);
    h.shutdown();
}

#[test]
fn graceful_restart_keeps_routes_on_close() {
    let h = start(vec![loopback_peer()]);
    let mut s = h.connect();

    // restart time 120, IPv4 unicast with forwarding state preserved
    let gr = vec![64, 6, 0x00, 0x78, 0x00, 0x01, 0x01, 0x80];
    establish(&mut s, REMOTE_AS, gr);
    match h.expect_session_up(1) {
        ToRde::SessionUp { info, .. } => {
            assert_eq!(info.capabilities.grestart.restart, GrLevel::Full);
            assert_eq!(info.capabilities.grestart.timeout, 120);
        }
        _ => unreachable!(),
    }

    drop(s);
    assert_eq!(
        h.rde_recv(),
        ToRde::SessionStale {
            peer_id: 1,
            aid: Aid::Inet
        }
    );

    // the restart skips idle hold, so the peer may already wait in Active
    let peers = h.show();
    assert!(matches!(
        peers[0].state,
        SessionState::Idle | SessionState::Active
    ));
    assert!(peers[0].capabilities.grestart.flags[Aid::Inet.index()].restarting);

    // no flush while the restart timer runs
    assert_eq!(h.rde.try_recv().expect("rde"), None);
    h.shutdown();
}

#[test]
fn oversized_message_is_refused() {
    let h = start(vec![loopback_peer()]);
    let mut s = h.connect();

    let (typ, _) = read_message(&mut s);
    assert_eq!(typ, MessageType::Open);

    let mut header = vec![0xff; 16];
    header.extend_from_slice(&5000u16.to_be_bytes());
    header.push(MessageType::Update as u8);
    s.write_all(&header).expect("send header");

    let (typ, body) = read_message(&mut s);
    assert_eq!(typ, MessageType::Notification);
    assert_eq!(body, vec![1, 2, 0x13, 0x88]);
    expect_closed(&mut s);

    assert_eq!(h.show()[0].state, SessionState::Idle);
    h.shutdown();
}

#[test]
fn template_clone_learns_remote_as() {
    let mut template = PeerConfig::new(10, "127.0.0.0".parse().unwrap(), 0);
    template.remote_masklen = 8;
    template.template = true;
    template.descr = "dynamic".into();
    let h = start(vec![template]);
    let mut s = h.connect();

    establish(&mut s, 65100, Vec::new());
    match h.rde_recv() {
        ToRde::SessionAdd { peer_id, conf } => {
            assert_eq!(peer_id, PEER_ID_DYN_MAX);
            assert_eq!(conf.remote_as, 65100);
            assert_eq!(conf.remote_addr, IpAddr::from([127, 0, 0, 1]));
            assert!(!conf.template);
        }
        other => panic!("expected session add, got {other:?}"),
    }

    let peers = h.show();
    assert_eq!(peers.len(), 2);
    let clone = peers
        .iter()
        .find(|p| p.id == PEER_ID_DYN_MAX)
        .expect("clone");
    assert_eq!(clone.cloned_from, Some(10));
    assert_eq!(clone.state, SessionState::Established);
    h.shutdown();
}

#[test]
fn unknown_peer_is_refused() {
    let mut conf = loopback_peer();
    conf.remote_addr = "127.0.0.9".parse().unwrap();
    let h = start(vec![conf]);
    let mut s = h.connect();
    expect_closed(&mut s);
    assert_eq!(h.show().len(), 1);
    h.shutdown();
}
