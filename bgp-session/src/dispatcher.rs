// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Handling of messages from the main process and the RDE.

use crate::clock::{TimerKind, INTERVAL_IDLE_HOLD_INITIAL, INTERVAL_SESSION_CLEAR};
use crate::config::{GlobalConfig, ListenerConfig, PeerConfig};
use crate::connection;
use crate::engine::{Listener, SessionEngine};
use crate::error::Error;
use crate::fsm::{FsmEvent, SessionState};
use crate::ipc::{CtlRequest, FromParent, FromRde, NeighborSelector, ToParent, ToRde};
use crate::log::dispatcher_log;
use crate::messages::{CeaseErrorSubcode, RouteRefreshSubtype};
use crate::mrt::MrtDump;
use crate::peer::{Peer, ReconfAction};
use std::collections::BTreeMap;
use std::time::Instant;

const UNIT_DISPATCHER: &str = "dispatcher";

/// Configuration collected between `ReconfConf` and `ReconfDone`.
#[derive(Debug, Default)]
pub struct PendingReconf {
    conf: GlobalConfig,
    peers: BTreeMap<u32, PeerConfig>,
    listeners: Vec<ListenerConfig>,
}

impl NeighborSelector {
    pub fn matches(&self, peer: &Peer) -> bool {
        match self {
            Self::All => true,
            Self::Addr(a) => peer.conf.remote_addr == *a,
            Self::Descr(d) => peer.conf.descr == *d,
            Self::Group(g) => peer.conf.group == *g,
        }
    }
}

impl SessionEngine {
    pub(crate) fn handle_parent(&mut self) -> Result<(), Error> {
        loop {
            let msg = match self.ctx.parent.try_recv() {
                Ok(Some(msg)) => msg,
                Ok(None) => return Ok(()),
                Err(e) => {
                    dispatcher_log!(self.ctx.log, error,
                        "main channel lost: {}", e);
                    return Err(e);
                }
            };
            self.dispatch_parent(msg);
            if self.quit {
                return Ok(());
            }
        }
    }

    pub(crate) fn handle_rde(&mut self) -> Result<(), Error> {
        loop {
            let Some(rde) = self.ctx.rde.as_ref() else {
                return Ok(());
            };
            let msg = match rde.try_recv() {
                Ok(Some(msg)) => msg,
                Ok(None) => return Ok(()),
                Err(e) => {
                    dispatcher_log!(self.ctx.log, error,
                        "RDE channel lost: {}", e);
                    return Err(e);
                }
            };
            self.dispatch_rde(msg);
        }
    }

    fn dispatch_parent(&mut self, msg: FromParent) {
        match msg {
            FromParent::RdeChannel(ep) => {
                if self.ctx.rde.is_some() {
                    dispatcher_log!(self.ctx.log, warn,
                        "RDE channel replaced");
                }
                self.ctx.rde = Some(ep);
            }
            FromParent::ReconfConf(conf) => {
                if self.reconf.is_some() {
                    dispatcher_log!(self.ctx.log, warn,
                        "reconfiguration restarted");
                }
                self.reconf = Some(PendingReconf {
                    conf: *conf,
                    ..Default::default()
                });
            }
            FromParent::ReconfPeer(conf) => match self.reconf.as_mut() {
                Some(r) => {
                    r.peers.insert(conf.id, *conf);
                }
                None => {
                    dispatcher_log!(self.ctx.log, warn,
                        "peer {} outside of reconfiguration", conf.id);
                }
            },
            FromParent::ReconfListener(conf) => match self.reconf.as_mut() {
                Some(r) => r.listeners.push(conf),
                None => {
                    dispatcher_log!(self.ctx.log, warn,
                        "listener {} outside of reconfiguration", conf.addr);
                }
            },
            FromParent::ReconfDone => match self.reconf.take() {
                Some(r) => self.merge(r),
                None => {
                    dispatcher_log!(self.ctx.log, warn,
                        "reconfiguration done without config");
                }
            },
            FromParent::SessionDependOn { ifname, up } => {
                self.depend_on(&ifname, up)
            }
            FromParent::MrtOpen { conf, file } => {
                match self.ctx.mrt.iter_mut().find(|m| m.conf.name == conf.name)
                {
                    Some(m) => {
                        m.conf = conf;
                        if let Err(e) = m.reopen(file) {
                            dispatcher_log!(self.ctx.log, warn,
                                "mrt dump {}: {}", m.conf.name, e);
                        }
                    }
                    None => self.ctx.mrt.push(MrtDump::new(conf, file)),
                }
            }
            FromParent::MrtReopen { name, file } => {
                match self.ctx.mrt.iter_mut().find(|m| m.conf.name == name) {
                    Some(m) => {
                        if let Err(e) = m.reopen(file) {
                            dispatcher_log!(self.ctx.log, warn,
                                "mrt dump {}: {}", name, e);
                        }
                    }
                    None => {
                        dispatcher_log!(self.ctx.log, warn,
                            "reopen of unknown mrt dump {}", name);
                    }
                }
            }
            FromParent::MrtClose { name } => {
                self.ctx.mrt.retain_mut(|m| {
                    if m.conf.name != name {
                        return true;
                    }
                    let _ = m.flush();
                    false
                });
            }
            FromParent::Ctl(req) => self.control(req),
            FromParent::Shutdown => {
                dispatcher_log!(self.ctx.log, info, "shutdown requested");
                self.quit = true;
            }
        }
    }

    fn dispatch_rde(&mut self, msg: FromRde) {
        let peer_id = match &msg {
            FromRde::ReconfDrain => {
                if self.reconf_pending {
                    self.reconf_pending = false;
                    self.ctx.to_parent(ToParent::ReconfDone);
                }
                return;
            }
            FromRde::Update { peer_id, .. }
            | FromRde::UpdateErr { peer_id, .. }
            | FromRde::Refresh { peer_id, .. }
            | FromRde::SessionRestarted { peer_id, .. } => *peer_id,
        };
        let ctx = &mut self.ctx;
        let Some(peer) = self.peers.get_mut(&peer_id) else {
            dispatcher_log!(ctx.log, warn,
                "RDE message for unknown peer {}", peer_id);
            return;
        };
        match msg {
            FromRde::Update { data, .. } => peer.send_update(ctx, data),
            FromRde::UpdateErr {
                errcode,
                subcode,
                data,
                ..
            } => peer.update_error(ctx, errcode, subcode, data),
            FromRde::Refresh { aid, subtype, .. } => {
                peer.send_refresh(ctx, aid, subtype)
            }
            FromRde::SessionRestarted { aid, .. } => peer.restarted(ctx, aid),
            FromRde::ReconfDrain => {}
        }
    }

    /// Swap in a new configuration. Peers missing from it are deleted once
    /// the RDE has drained.
    fn merge(&mut self, mut r: PendingReconf) {
        self.ctx.conf = r.conf;

        let ids: Vec<u32> = self.peers.keys().copied().collect();
        for id in &ids {
            let Some(peer) = self.peers.get_mut(id) else {
                continue;
            };
            if peer.template.is_some() {
                continue;
            }
            match r.peers.remove(id) {
                Some(conf) => peer.reconfigure(&mut self.ctx, conf),
                None => peer.reconf_action = ReconfAction::Delete,
            }
        }

        // clones follow their template, or go with it
        for id in &ids {
            let Some(tid) = self.peers.get(id).and_then(|p| p.template) else {
                continue;
            };
            let template = self
                .peers
                .get(&tid)
                .filter(|t| t.reconf_action == ReconfAction::Keep)
                .map(|t| t.conf.clone());
            let Some(peer) = self.peers.get_mut(id) else {
                continue;
            };
            match template {
                Some(tconf) => {
                    peer.reclone(&tconf);
                    peer.reconf_action = ReconfAction::Keep;
                    if peer.rdesession {
                        self.ctx.to_rde(ToRde::SessionAdd {
                            peer_id: *id,
                            conf: Box::new(peer.conf.clone()),
                        });
                    }
                }
                None => peer.reconf_action = ReconfAction::Delete,
            }
        }

        let log = self.ctx.log.clone();
        for (id, conf) in r.peers {
            self.peers.insert(id, Peer::new(conf, log.clone()));
        }

        self.listeners.retain(|l| {
            let keep = r.listeners.contains(&l.conf);
            if !keep {
                dispatcher_log!(log, info, "closing listener {}", l.conf.addr);
            }
            keep
        });
        r.listeners
            .retain(|c| !self.listeners.iter().any(|l| l.conf == *c));
        for conf in r.listeners {
            match connection::listen(conf.addr, &log) {
                Ok(socket) => self.listeners.push(Listener { conf, socket }),
                Err(e) => {
                    dispatcher_log!(log, error,
                        "cannot listen on {}: {}", conf.addr, e);
                }
            }
        }

        dispatcher_log!(log, info, "reconfiguration merged";
            "peers" => self.peers.len(),
            "listeners" => self.listeners.len()
        );

        if self.ctx.to_rde(ToRde::ReconfDrain) {
            self.reconf_pending = true;
        } else {
            self.ctx.to_parent(ToParent::ReconfDone);
        }
    }

    fn depend_on(&mut self, ifname: &str, up: bool) {
        let ctx = &mut self.ctx;
        for peer in self.peers.values_mut() {
            if peer.conf.if_depend.as_deref() != Some(ifname) {
                continue;
            }
            if up && !peer.depend_ok {
                peer.depend_ok = true;
                peer.fsm(ctx, FsmEvent::Start);
            } else if !up && peer.depend_ok {
                peer.depend_ok = false;
                peer.stop(ctx, CeaseErrorSubcode::OtherConfigChange, None);
            }
        }
    }

    fn control(&mut self, req: CtlRequest) {
        let ctx = &mut self.ctx;
        let now = Instant::now();
        match req {
            CtlRequest::Show { neighbor, reply } => {
                let info = self
                    .peers
                    .values()
                    .filter(|p| neighbor.matches(p))
                    .map(|p| p.info(now))
                    .collect();
                if reply.send(info).is_err() {
                    dispatcher_log!(ctx.log, debug,
                        "show requester went away");
                }
            }
            CtlRequest::NeighborUp(sel) => {
                for peer in self.peers.values_mut().filter(|p| {
                    !p.conf.template && sel.matches(p)
                }) {
                    peer.conf.down = false;
                    peer.conf.shutdown_reason.clear();
                    peer.idle_hold_time = INTERVAL_IDLE_HOLD_INITIAL;
                    peer.errcnt = 0;
                    if peer.state == SessionState::Idle
                        && !peer.timers.running(TimerKind::IdleHold)
                    {
                        peer.timers.set(TimerKind::IdleHold, 0);
                    }
                }
            }
            CtlRequest::NeighborDown { neighbor, reason } => {
                for peer in self.peers.values_mut().filter(|p| {
                    !p.conf.template && neighbor.matches(p)
                }) {
                    peer.conf.down = true;
                    peer.conf.shutdown_reason =
                        reason.clone().unwrap_or_default();
                    peer.stop(
                        ctx,
                        CeaseErrorSubcode::AdminShutdown,
                        reason.as_deref(),
                    );
                    peer.timers.stop(TimerKind::IdleHold);
                }
            }
            CtlRequest::NeighborClear { neighbor, reason } => {
                for peer in self.peers.values_mut().filter(|p| {
                    !p.conf.template && neighbor.matches(p)
                }) {
                    peer.idle_hold_time = INTERVAL_IDLE_HOLD_INITIAL;
                    peer.errcnt = 0;
                    if peer.conf.down {
                        peer.stop(
                            ctx,
                            CeaseErrorSubcode::AdminShutdown,
                            reason.as_deref(),
                        );
                    } else {
                        peer.stop(
                            ctx,
                            CeaseErrorSubcode::AdminReset,
                            reason.as_deref(),
                        );
                        peer.timers
                            .set(TimerKind::IdleHold, INTERVAL_SESSION_CLEAR);
                    }
                }
            }
            CtlRequest::NeighborRefresh(sel) => {
                for peer in self.peers.values_mut().filter(|p| {
                    p.state == SessionState::Established && sel.matches(p)
                }) {
                    let families: Vec<_> = peer.capa_neg.families().collect();
                    for aid in families {
                        peer.send_refresh(ctx, aid, RouteRefreshSubtype::Request);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::channel;
    use pretty_assertions::assert_eq;

    fn engine() -> (SessionEngine, crate::ipc::Endpoint<FromParent, ToParent>)
    {
        let (ours, theirs) =
            channel::<ToParent, FromParent>().expect("channel");
        let log = slog::Logger::root(slog::Discard, slog::o!());
        let conf = GlobalConfig {
            asn: 65001,
            bgpid: "192.0.2.1".parse().unwrap(),
            ..Default::default()
        };
        (SessionEngine::new(conf, ours, log), theirs)
    }

    #[test]
    fn reconfiguration_merge() {
        let (mut e, parent) = engine();
        e.add_peer(PeerConfig::new(1, "192.0.2.10".parse().unwrap(), 65010))
            .expect("add");
        e.add_peer(PeerConfig::new(2, "192.0.2.20".parse().unwrap(), 65020))
            .expect("add");

        let mut changed = PeerConfig::new(1, "192.0.2.10".parse().unwrap(), 65010);
        changed.descr = "changed".into();
        e.dispatch_parent(FromParent::ReconfConf(Box::new(GlobalConfig {
            asn: 65001,
            holdtime: 30,
            ..Default::default()
        })));
        e.dispatch_parent(FromParent::ReconfPeer(Box::new(changed)));
        e.dispatch_parent(FromParent::ReconfPeer(Box::new(PeerConfig::new(
            3,
            "192.0.2.30".parse().unwrap(),
            65030,
        ))));
        e.dispatch_parent(FromParent::ReconfDone);

        assert_eq!(e.ctx.conf.holdtime, 30);
        assert_eq!(e.peers[&1].conf.descr, "changed");
        assert_eq!(e.peers[&1].reconf_action, ReconfAction::Keep);
        assert_eq!(e.peers[&2].reconf_action, ReconfAction::Delete);
        assert_eq!(e.peers[&3].state, SessionState::None);

        // no RDE to drain, done right away
        let mut last = None;
        while let Some(m) = parent.try_recv().expect("recv") {
            last = Some(m);
        }
        assert_eq!(last, Some(ToParent::ReconfDone));
        assert!(!e.reconf_pending);
    }

    #[test]
    fn drain_before_done() {
        let (mut e, parent) = engine();
        let (ours, rde) = channel::<ToRde, FromRde>().expect("channel");
        e.dispatch_parent(FromParent::RdeChannel(ours));
        e.dispatch_parent(FromParent::ReconfConf(Box::default()));
        e.dispatch_parent(FromParent::ReconfDone);

        assert_eq!(rde.try_recv().expect("recv"), Some(ToRde::ReconfDrain));
        assert!(e.reconf_pending);
        assert_eq!(parent.try_recv().expect("recv"), None);

        e.dispatch_rde(FromRde::ReconfDrain);
        assert!(!e.reconf_pending);
        assert_eq!(parent.try_recv().expect("recv"), Some(ToParent::ReconfDone));
    }

    #[test]
    fn neighbor_down_and_up() {
        let (mut e, _parent) = engine();
        e.add_peer(PeerConfig::new(1, "192.0.2.10".parse().unwrap(), 65010))
            .expect("add");
        let peer = e.peers.get_mut(&1).unwrap();
        peer.init(&mut e.ctx);
        assert!(peer.timers.running(TimerKind::IdleHold));

        e.control(CtlRequest::NeighborDown {
            neighbor: NeighborSelector::Addr("192.0.2.10".parse().unwrap()),
            reason: Some("maintenance".into()),
        });
        let peer = &e.peers[&1];
        assert!(peer.conf.down);
        assert_eq!(peer.conf.shutdown_reason, "maintenance");
        assert_eq!(peer.state, SessionState::Idle);

        e.control(CtlRequest::NeighborUp(NeighborSelector::All));
        let peer = &e.peers[&1];
        assert!(!peer.conf.down);
        assert!(peer.timers.running(TimerKind::IdleHold));

        let (tx, rx) = std::sync::mpsc::channel();
        e.control(CtlRequest::Show {
            neighbor: NeighborSelector::Group("none".into()),
            reply: tx,
        });
        assert_eq!(rx.recv().expect("reply"), Vec::new());
    }

    #[test]
    fn depend_on_gates_start() {
        let (mut e, parent) = engine();
        let mut conf = PeerConfig::new(1, "192.0.2.10".parse().unwrap(), 65010);
        conf.if_depend = Some("carp0".into());
        conf.passive = true;
        e.add_peer(conf).expect("add");
        let peer = e.peers.get_mut(&1).unwrap();
        peer.init(&mut e.ctx);
        assert!(!peer.depend_ok);

        let mut got = Vec::new();
        while let Some(m) = parent.try_recv().expect("recv") {
            got.push(m);
        }
        assert!(got.contains(&ToParent::SessionDependOn {
            ifname: "carp0".into()
        }));

        // start without the link does not leave idle
        e.peers.get_mut(&1).unwrap().fsm(&mut e.ctx, FsmEvent::Start);
        assert_eq!(e.peers[&1].state, SessionState::Idle);

        e.depend_on("carp0", true);
        assert_eq!(e.peers[&1].state, SessionState::Active);

        e.depend_on("carp0", false);
        assert_eq!(e.peers[&1].state, SessionState::Idle);
        assert!(!e.peers[&1].depend_ok);
    }
}
