// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Typed channels between the session engine and its collaborators.
//!
//! An [`Endpoint`] is a duplex mpsc channel paired with a unix socket. Every
//! send writes a byte to the socket so that the receiving side can include
//! the socket in its readiness wait next to its TCP connections.

use crate::capabilities::{Aid, Capabilities};
use crate::config::{GlobalConfig, ListenerConfig, PeerConfig};
use crate::error::Error;
use crate::messages::RouteRefreshSubtype;
use crate::mrt::MrtConfig;
use crate::peer::NeighborInfo;
use std::fs::File;
use std::io::{self, ErrorKind, Read, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::mpsc::{channel as mpsc_channel, Receiver, Sender, TryRecvError};
use std::time::Duration;

/// One side of a duplex channel sending `Tx` and receiving `Rx`.
pub struct Endpoint<Tx, Rx> {
    tx: Sender<Tx>,
    rx: Receiver<Rx>,
    wake: UnixStream,
}

/// Create a connected pair of endpoints.
pub fn channel<A, B>() -> io::Result<(Endpoint<A, B>, Endpoint<B, A>)> {
    let (tx_a, rx_b) = mpsc_channel();
    let (tx_b, rx_a) = mpsc_channel();
    let (wake_a, wake_b) = UnixStream::pair()?;
    wake_a.set_nonblocking(true)?;
    wake_b.set_nonblocking(true)?;
    Ok((
        Endpoint {
            tx: tx_a,
            rx: rx_a,
            wake: wake_a,
        },
        Endpoint {
            tx: tx_b,
            rx: rx_b,
            wake: wake_b,
        },
    ))
}

impl<Tx, Rx> Endpoint<Tx, Rx> {
    pub fn send(&self, msg: Tx) -> Result<(), Error> {
        self.tx.send(msg).map_err(|_| Error::Disconnected)?;
        // A full socket already guarantees a pending wakeup.
        match (&self.wake).write(&[1]) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(()),
            Err(e) if e.kind() == ErrorKind::BrokenPipe => {
                Err(Error::Disconnected)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Receive without blocking. Clears pending wakeups first so that a
    /// message sent after this call always triggers a new one.
    pub fn try_recv(&self) -> Result<Option<Rx>, Error> {
        let mut buf = [0u8; 64];
        loop {
            match (&self.wake).read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        match self.rx.try_recv() {
            Ok(msg) => Ok(Some(msg)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(Error::Disconnected),
        }
    }

    pub fn recv(&self) -> Result<Rx, Error> {
        self.rx.recv().map_err(|_| Error::Disconnected)
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<Rx>, Error> {
        match self.rx.recv_timeout(timeout) {
            Ok(msg) => Ok(Some(msg)),
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => Ok(None),
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                Err(Error::Disconnected)
            }
        }
    }
}

impl<Tx, Rx> AsRawFd for Endpoint<Tx, Rx> {
    fn as_raw_fd(&self) -> RawFd {
        self.wake.as_raw_fd()
    }
}

/// Session parameters reported to the RDE when a session comes up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub remote_addr: IpAddr,
    pub local_v4: Option<Ipv4Addr>,
    pub local_v6: Option<Ipv6Addr>,
    pub remote_bgpid: u32,
    pub remote_as: u32,
    pub ebgp: bool,
    pub capabilities: Capabilities,
}

/// Messages from the session engine to the RDE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToRde {
    SessionAdd { peer_id: u32, conf: Box<PeerConfig> },
    SessionUp { peer_id: u32, info: Box<SessionInfo> },
    SessionDown { peer_id: u32 },
    SessionDelete { peer_id: u32 },
    Update { peer_id: u32, data: Vec<u8> },
    Refresh { peer_id: u32, aid: Aid, subtype: RouteRefreshSubtype },

    /// Keep the family's routes, marked stale.
    SessionStale { peer_id: u32, aid: Aid },

    /// The peer cannot restart gracefully for the family, drop its routes.
    SessionNoGrace { peer_id: u32, aid: Aid },

    /// Drop the routes still marked stale.
    SessionFlush { peer_id: u32, aid: Aid },

    /// The peer finished restarting for the family.
    SessionRestarted { peer_id: u32, aid: Aid },

    /// The outbound queue drained, resume sending updates.
    Xon { peer_id: u32 },

    /// The outbound queue is full, stop sending updates.
    Xoff { peer_id: u32 },

    ReconfDrain,
}

/// Messages from the RDE to the session engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FromRde {
    Update {
        peer_id: u32,
        data: Vec<u8>,
    },

    /// The RDE wants the session reset with the given NOTIFICATION.
    UpdateErr {
        peer_id: u32,
        errcode: u8,
        subcode: u8,
        data: Vec<u8>,
    },

    Refresh {
        peer_id: u32,
        aid: Aid,
        subtype: RouteRefreshSubtype,
    },

    /// End-of-RIB seen, graceful restart for the family is over.
    SessionRestarted {
        peer_id: u32,
        aid: Aid,
    },

    ReconfDrain,
}

/// Messages from the session engine to the main process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToParent {
    /// Adjust the demotion counter of a routing group.
    Demote { group: String, level: i32 },

    /// Reload TCP keys for the peer.
    PfkeyReload { peer_id: u32 },

    /// Ask for the link state of an interface.
    SessionDependOn { ifname: String },

    /// A reconfiguration round is complete.
    ReconfDone,
}

/// Which neighbors an administrative request addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NeighborSelector {
    All,
    Addr(IpAddr),
    Descr(String),
    Group(String),
}

/// Administrative requests.
#[derive(Debug, Clone)]
pub enum CtlRequest {
    NeighborUp(NeighborSelector),
    NeighborDown {
        neighbor: NeighborSelector,
        reason: Option<String>,
    },
    NeighborClear {
        neighbor: NeighborSelector,
        reason: Option<String>,
    },
    NeighborRefresh(NeighborSelector),
    Show {
        neighbor: NeighborSelector,
        reply: Sender<Vec<NeighborInfo>>,
    },
}

/// Messages from the main process to the session engine.
#[derive(Debug)]
pub enum FromParent {
    /// Channel to the RDE.
    RdeChannel(Endpoint<ToRde, FromRde>),

    /// Start of a reconfiguration round, followed by any number of peer and
    /// listener messages and a final `ReconfDone`.
    ReconfConf(Box<GlobalConfig>),
    ReconfPeer(Box<PeerConfig>),
    ReconfListener(ListenerConfig),
    ReconfDone,

    /// Link state of an interface some peers depend on.
    SessionDependOn { ifname: String, up: bool },

    MrtOpen { conf: MrtConfig, file: File },
    MrtReopen { name: String, file: File },
    MrtClose { name: String },

    Ctl(CtlRequest),

    Shutdown,
}

impl<Tx, Rx> std::fmt::Debug for Endpoint<Tx, Rx> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Endpoint(fd {})", self.wake.as_raw_fd())
    }
}
