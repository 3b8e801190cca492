// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The session engine event loop.
//!
//! Everything runs on one thread. Each iteration fires due timers, waits
//! for readiness on the collaborator channels, the listeners and every peer
//! connection, and then services what is ready: main process messages
//! first, then the RDE, new connections, peer I/O and finally buffered
//! inbound messages, a bounded number per peer.

use crate::clock::{TimerKind, INTERVAL_HOLD_CLONED, INTERVAL_SESSION_DOWN};
use crate::config::{GlobalConfig, ListenerConfig, PeerConfig};
use crate::connection::{self, Connection};
use crate::dispatcher::PendingReconf;
use crate::error::Error;
use crate::fsm::{FsmEvent, SessionState};
use crate::ipc::{Endpoint, FromParent, FromRde, ToParent, ToRde};
use crate::log::engine_log;
use crate::messages::CeaseErrorSubcode;
use crate::mrt::MrtDump;
use crate::peer::{Peer, ReconfAction, PEER_ID_DYN_MAX, PEER_ID_STATIC_MAX};
use crate::poll::{PollSet, Token};
use crate::{MAX_POLL_TIMEOUT, PAUSE_ACCEPT_TIMEOUT};
use slog::Logger;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream};
use std::os::fd::AsRawFd;
use std::time::{Duration, Instant};

const UNIT_ENGINE: &str = "engine";

/// State shared by every peer: the global configuration and the channels
/// to the collaborators.
#[derive(Debug)]
pub struct SessionCtx {
    pub conf: GlobalConfig,
    pub rde: Option<Endpoint<ToRde, FromRde>>,
    pub parent: Endpoint<ToParent, FromParent>,
    pub mrt: Vec<MrtDump>,
    pub log: Logger,
}

impl SessionCtx {
    pub fn new(
        conf: GlobalConfig,
        parent: Endpoint<ToParent, FromParent>,
        log: Logger,
    ) -> Self {
        Self {
            conf,
            rde: None,
            parent,
            mrt: Vec::new(),
            log,
        }
    }

    /// Send to the RDE. Returns false, after logging, if the message could
    /// not be delivered.
    pub fn to_rde(&self, msg: ToRde) -> bool {
        let Some(rde) = self.rde.as_ref() else {
            engine_log!(self.log, warn, "no RDE channel, dropping {:?}", msg);
            return false;
        };
        match rde.send(msg) {
            Ok(()) => true,
            Err(e) => {
                engine_log!(self.log, error, "send to RDE failed: {}", e);
                false
            }
        }
    }

    pub fn to_parent(&self, msg: ToParent) -> bool {
        match self.parent.send(msg) {
            Ok(()) => true,
            Err(e) => {
                engine_log!(self.log, error, "send to main failed: {}", e);
                false
            }
        }
    }
}

#[derive(Debug)]
pub struct Listener {
    pub conf: ListenerConfig,
    pub socket: TcpListener,
}

pub struct SessionEngine {
    pub ctx: SessionCtx,

    /// Ordered by id so that template matching is deterministic.
    pub peers: BTreeMap<u32, Peer>,
    pub listeners: Vec<Listener>,

    /// Configuration being received from the main process.
    pub(crate) reconf: Option<PendingReconf>,

    /// A reconfiguration was merged and waits for the RDE to drain. Peers
    /// are neither initialized nor deleted meanwhile.
    pub(crate) reconf_pending: bool,

    accept_paused_until: Option<Instant>,
    pub(crate) quit: bool,
}

/// Readiness interest registered for one loop iteration.
struct Registration {
    parent: Token,
    rde: Option<Token>,
    listeners: Vec<Token>,
    peers: Vec<(u32, Token)>,
}

impl SessionEngine {
    pub fn new(
        conf: GlobalConfig,
        parent: Endpoint<ToParent, FromParent>,
        log: Logger,
    ) -> Self {
        Self {
            ctx: SessionCtx::new(conf, parent, log),
            peers: BTreeMap::new(),
            listeners: Vec::new(),
            reconf: None,
            reconf_pending: false,
            accept_paused_until: None,
            quit: false,
        }
    }

    /// Add a configured peer. It is initialized at the top of the next loop
    /// iteration.
    pub fn add_peer(&mut self, conf: PeerConfig) -> Result<(), Error> {
        if conf.id == 0 || conf.id > PEER_ID_STATIC_MAX {
            return Err(Error::InvalidConfig(format!(
                "peer id {} out of range",
                conf.id
            )));
        }
        if self.peers.contains_key(&conf.id) {
            return Err(Error::InvalidConfig(format!(
                "duplicate peer id {}",
                conf.id
            )));
        }
        let log = self.ctx.log.clone();
        self.peers.insert(conf.id, Peer::new(conf, log));
        Ok(())
    }

    /// Bind a listener. Returns the bound address, which differs from the
    /// configured one when that asks for an ephemeral port.
    pub fn listen(&mut self, conf: ListenerConfig) -> Result<SocketAddr, Error> {
        let socket = connection::listen(conf.addr, &self.ctx.log)?;
        let addr = socket.local_addr()?;
        self.listeners.push(Listener { conf, socket });
        Ok(addr)
    }

    pub fn run(&mut self) -> Result<(), Error> {
        engine_log!(self.ctx.log, info, "session engine starting";
            "peers" => self.peers.len(),
            "listeners" => self.listeners.len()
        );

        let mut set = PollSet::new();
        while !self.quit {
            if let Err(e) = self.iteration(&mut set) {
                engine_log!(self.ctx.log, error, "fatal: {}", e);
                self.shutdown();
                return Err(e);
            }
        }

        self.shutdown();
        Ok(())
    }

    fn iteration(&mut self, set: &mut PollSet) -> Result<(), Error> {
        if !self.reconf_pending {
            self.maintain_peers();
        }

        let now = Instant::now();
        let mut timeout = self.run_timers(now);

        if let Some(until) = self.accept_paused_until {
            if until <= now {
                self.accept_paused_until = None;
            } else {
                timeout = timeout.min(until - now);
            }
        }

        if self.peers.values().any(|p| {
            p.conn
                .as_ref()
                .is_some_and(|c| c.reader.has_pending(p.max_len()))
        }) {
            timeout = Duration::ZERO;
        }

        let reg = self.register(set);
        set.wait(timeout)?;

        if set.readable(reg.parent) || set.failed(reg.parent) {
            self.handle_parent()?;
        }
        if self.quit {
            return Ok(());
        }
        if let Some(t) = reg.rde {
            if set.readable(t) || set.failed(t) {
                self.handle_rde()?;
            }
        }

        for (i, t) in reg.listeners.iter().enumerate() {
            if set.readable(*t) {
                self.accept(i);
            }
        }

        for (id, t) in &reg.peers {
            let Some(peer) = self.peers.get_mut(id) else {
                continue;
            };
            if set.readable(*t) || set.failed(*t) {
                peer.read(&mut self.ctx);
            }
            if set.writable(*t) {
                peer.write(&mut self.ctx);
            }
        }

        for peer in self.peers.values_mut() {
            peer.process_input(&mut self.ctx);
        }

        for m in self.ctx.mrt.iter_mut() {
            if let Err(e) = m.flush() {
                engine_log!(self.ctx.log, warn, "mrt dump {} write failed: {}",
                    m.conf.name, e);
            }
        }

        Ok(())
    }

    /// Initialize new peers and remove the ones marked for deletion.
    fn maintain_peers(&mut self) {
        let now = Instant::now();
        let ids: Vec<u32> = self.peers.keys().copied().collect();
        for id in ids {
            let Some(peer) = self.peers.get_mut(&id) else {
                continue;
            };

            if peer.template.is_some()
                && matches!(peer.state, SessionState::Idle | SessionState::Active)
                && peer.stats.last_updown.is_some_and(|t| {
                    now.saturating_duration_since(t)
                        >= Duration::from_secs(INTERVAL_HOLD_CLONED)
                })
            {
                peer.reconf_action = ReconfAction::Delete;
            }

            if peer.state == SessionState::None {
                peer.init(&mut self.ctx);
            }

            if peer.reconf_action == ReconfAction::Delete {
                self.remove_peer(id);
                continue;
            }
            peer.reconf_action = ReconfAction::None;
        }
    }

    fn remove_peer(&mut self, id: u32) {
        let Some(mut peer) = self.peers.remove(&id) else {
            return;
        };
        if peer.demoted {
            peer.demote(&mut self.ctx, -1);
        }
        peer.conf.demote_group = None;
        peer.stop(&mut self.ctx, CeaseErrorSubcode::PeerUnconfigured, None);
        if peer.rdesession {
            self.ctx.to_rde(ToRde::SessionDelete { peer_id: id });
        }
        engine_log!(self.ctx.log, info, "peer {} removed", peer.conf.remote_addr;
            "peer_id" => id
        );
    }

    /// Fire due timers and return how long the loop may sleep.
    fn run_timers(&mut self, now: Instant) -> Duration {
        let mut timeout = Duration::from_secs(MAX_POLL_TIMEOUT);
        for peer in self.peers.values_mut() {
            while let Some(kind) = peer.timers.pop_due(now) {
                peer.handle_timer(&mut self.ctx, kind);
            }
            if let Some(t) = peer.timers.next_timeout(now) {
                timeout = timeout.min(t);
            }
        }
        timeout
    }

    fn register(&self, set: &mut PollSet) -> Registration {
        set.clear();
        let parent = set.add(self.ctx.parent.as_raw_fd(), true, false);
        let rde = self
            .ctx
            .rde
            .as_ref()
            .map(|r| set.add(r.as_raw_fd(), true, false));

        let listeners = if self.accept_paused_until.is_none() {
            self.listeners
                .iter()
                .map(|l| set.add(l.socket.as_raw_fd(), true, false))
                .collect()
        } else {
            Vec::new()
        };

        let peers = self
            .peers
            .iter()
            .filter_map(|(id, p)| {
                let conn = p.conn.as_ref()?;
                let read = !conn.connecting && conn.reader.wants_read();
                let write = conn.connecting || !conn.queue.is_empty();
                Some((*id, set.add(conn.stream.as_raw_fd(), read, write)))
            })
            .collect();

        Registration {
            parent,
            rde,
            listeners,
            peers,
        }
    }

    fn accept(&mut self, index: usize) {
        loop {
            let Some(listener) = self.listeners.get(index) else {
                return;
            };
            match listener.socket.accept() {
                Ok((stream, addr)) => self.accept_connection(stream, addr),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e)
                    if matches!(
                        e.raw_os_error(),
                        Some(libc::EMFILE) | Some(libc::ENFILE)
                    ) =>
                {
                    engine_log!(self.ctx.log, warn,
                        "out of file descriptors, pausing accept");
                    self.accept_paused_until = Some(
                        Instant::now()
                            + Duration::from_secs(PAUSE_ACCEPT_TIMEOUT),
                    );
                    return;
                }
                Err(e) => {
                    engine_log!(self.ctx.log, error, "accept: {}", e);
                    return;
                }
            }
        }
    }

    fn accept_connection(&mut self, stream: TcpStream, addr: SocketAddr) {
        let Some(id) = self.peer_by_addr(addr.ip()) else {
            engine_log!(self.ctx.log, warn,
                "connection from non-peer {} refused", addr);
            return;
        };
        let ctx = &mut self.ctx;
        let Some(peer) = self.peers.get_mut(&id) else {
            return;
        };

        // fast reconnect after a clear
        if peer.state == SessionState::Idle
            && peer.errcnt < 2
            && peer.timers.running(TimerKind::IdleHold)
        {
            peer.passive = true;
            peer.fsm(ctx, FsmEvent::Start);
        }

        match peer.state {
            SessionState::Connect | SessionState::Active => {
                if peer.conn.is_some() {
                    if peer.state == SessionState::Active {
                        engine_log!(ctx.log, info,
                            "connection from {} refused, session busy", addr;
                            "peer_id" => id
                        );
                        return;
                    }
                    // the inbound connection wins over our attempt
                    peer.conn = None;
                }
            }
            SessionState::Established
                if peer.capa_neg.grestart.restart
                    == crate::capabilities::GrLevel::Full =>
            {
                peer.change_state(
                    ctx,
                    SessionState::Connect,
                    crate::fsm::FsmEventKind::ConClosed,
                );
            }
            _ => {
                engine_log!(ctx.log, info,
                    "connection from {} refused in state {}", addr, peer.state;
                    "peer_id" => id
                );
                return;
            }
        }

        let conn = match Connection::accepted(stream) {
            Ok(c) => c,
            Err(e) => {
                engine_log!(ctx.log, warn, "connection from {}: {}", addr, e);
                return;
            }
        };
        let opts = peer.socket_options(&ctx.conf);
        if let Err(e) = conn.setup(&opts, &ctx.log) {
            engine_log!(ctx.log, warn,
                "socket setup for {} failed: {}", addr, e);
            return;
        }
        peer.attach(conn);
        peer.fsm(ctx, FsmEvent::ConOpen);
    }

    /// Find the peer for an inbound connection. A configured peer with the
    /// exact address wins, otherwise the template with the longest matching
    /// prefix is cloned.
    pub fn peer_by_addr(&mut self, addr: IpAddr) -> Option<u32> {
        if let Some(p) = self
            .peers
            .values()
            .find(|p| !p.conf.template && p.conf.remote_addr == addr)
        {
            return Some(p.conf.id);
        }

        let template = self
            .peers
            .values()
            .filter(|p| p.conf.template && p.conf.covers(addr))
            .fold(None::<&Peer>, |best, p| match best {
                Some(b) if b.conf.remote_masklen >= p.conf.remote_masklen => {
                    Some(b)
                }
                _ => Some(p),
            })?;

        let id = (PEER_ID_STATIC_MAX + 1..=PEER_ID_DYN_MAX)
            .rev()
            .find(|id| !self.peers.contains_key(id))?;

        let mut clone = Peer::from_template(template, id, addr);
        engine_log!(self.ctx.log, info, "new peer {} cloned from template {}",
            addr, template.conf.descr;
            "peer_id" => id
        );
        clone.init(&mut self.ctx);
        clone
            .timers
            .set(TimerKind::SessionDown, INTERVAL_SESSION_DOWN);
        clone.fsm(&mut self.ctx, FsmEvent::Start);
        self.peers.insert(id, clone);
        Some(id)
    }

    /// Stop every session and tell the peers why.
    fn shutdown(&mut self) {
        for peer in self.peers.values_mut() {
            if peer.state == SessionState::None {
                continue;
            }
            peer.stop(
                &mut self.ctx,
                CeaseErrorSubcode::AdminShutdown,
                Some("bgpd shutting down"),
            );
            if peer.demoted {
                peer.demote(&mut self.ctx, -1);
            }
        }
        for m in self.ctx.mrt.iter_mut() {
            let _ = m.flush();
        }
        engine_log!(self.ctx.log, info, "session engine exiting");
    }
}
