// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::capabilities::{AnnouncedCapabilities, Capabilities};
use crate::clock::{Timers, INTERVAL_HOLD_INITIAL, INTERVAL_IDLE_HOLD_INITIAL};
use crate::config::PeerConfig;
use crate::connection::Connection;
use crate::fsm::{FsmEvent, SessionState};
use crate::messages::describe_error;
use serde::Serialize;
use slog::Logger;
use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Instant;

/// Configured peers have ids up to this value.
pub const PEER_ID_STATIC_MAX: u32 = u32::MAX / 2;

/// Peers cloned from templates get ids counting down from here.
pub const PEER_ID_DYN_MAX: u32 = u32::MAX;

/// What a reconfiguration round decided for a peer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ReconfAction {
    #[default]
    None,
    Keep,
    Delete,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MessageCounters {
    pub open: u64,
    pub update: u64,
    pub notification: u64,
    pub keepalive: u64,
    pub rrefresh: u64,
    pub refresh_begin: u64,
    pub refresh_end: u64,
}

#[derive(Debug, Default, Clone)]
pub struct PeerStats {
    pub sent: MessageCounters,
    pub rcvd: MessageCounters,
    pub last_updown: Option<Instant>,
    pub last_read: Option<Instant>,
    pub last_write: Option<Instant>,
    pub last_sent_error: Option<(u8, u8)>,
    pub last_rcvd_error: Option<(u8, u8)>,

    /// Shutdown reason received with the last administrative NOTIFICATION.
    pub last_reason: String,
}

/// A neighbor and its session.
#[derive(Debug)]
pub struct Peer {
    pub conf: PeerConfig,
    pub state: SessionState,
    pub prev_state: SessionState,
    pub conn: Option<Connection>,
    pub timers: Timers,

    /// What is announced in the next OPEN. Starts out as the configured set
    /// and loses capabilities the peer refused.
    pub ann: AnnouncedCapabilities,

    /// What the peer announced in its last OPEN.
    pub capa_peer: Capabilities,

    /// The agreed set of the current or last session.
    pub capa_neg: Capabilities,

    pub holdtime: u16,
    pub remote_bgpid: u32,
    pub local: Option<SocketAddr>,
    pub remote: Option<SocketAddr>,

    pub idle_hold_time: u64,
    pub errcnt: u32,

    /// Set by an inbound connection so that the next start waits for it.
    pub passive: bool,
    pub depend_ok: bool,
    pub demoted: bool,

    /// The RDE was told to stop sending updates.
    pub throttled: bool,

    /// The RDE knows this peer.
    pub rdesession: bool,

    /// A NOTIFICATION went out on the current connection.
    pub notification_sent: bool,

    pub reconf_action: ReconfAction,

    /// Id of the template this peer was cloned from.
    pub template: Option<u32>,

    /// Errno of the last failed connect, to keep repeats out of the log.
    pub last_connect_errno: Option<i32>,

    pub stats: PeerStats,

    /// Events raised while handling another event, run right after it.
    pub pending: VecDeque<FsmEvent>,

    pub log: Logger,
}

impl Peer {
    pub fn new(conf: PeerConfig, log: Logger) -> Self {
        Self {
            ann: conf.capabilities.clone(),
            conf,
            state: SessionState::None,
            prev_state: SessionState::None,
            conn: None,
            timers: Timers::new(),
            capa_peer: Capabilities::default(),
            capa_neg: Capabilities::default(),
            holdtime: INTERVAL_HOLD_INITIAL,
            remote_bgpid: 0,
            local: None,
            remote: None,
            idle_hold_time: INTERVAL_IDLE_HOLD_INITIAL,
            errcnt: 0,
            passive: false,
            depend_ok: false,
            demoted: false,
            throttled: false,
            rdesession: false,
            notification_sent: false,
            reconf_action: ReconfAction::None,
            template: None,
            last_connect_errno: None,
            stats: PeerStats::default(),
            pending: VecDeque::new(),
            log,
        }
    }

    /// Clone a concrete peer for `addr` from a template. The clone shares no
    /// state with the template; it is passive and has a full length mask.
    pub fn from_template(template: &Peer, id: u32, addr: IpAddr) -> Self {
        let mut conf = template.conf.clone();
        Self::stamp_clone(&mut conf, id, addr);
        let mut p = Peer::new(conf, template.log.clone());
        p.template = Some(template.conf.id);
        p
    }

    /// Derive a clone's configuration from its template's.
    pub fn stamp_clone(conf: &mut PeerConfig, id: u32, addr: IpAddr) {
        conf.id = id;
        conf.remote_addr = addr;
        conf.remote_masklen = if addr.is_ipv4() { 32 } else { 128 };
        conf.template = false;
        conf.passive = true;
    }

    /// Re-derive a clone's configuration after its template changed. The
    /// learned remote AS is kept.
    pub fn reclone(&mut self, template: &PeerConfig) {
        let remote_as = self.conf.remote_as;
        let mut conf = template.clone();
        Self::stamp_clone(&mut conf, self.conf.id, self.conf.remote_addr);
        if conf.remote_as == 0 {
            conf.remote_as = remote_as;
        }
        self.conf = conf;
    }

    pub fn queue_len(&self) -> usize {
        self.conn.as_ref().map(|c| c.queue.len()).unwrap_or(0)
    }

    pub fn info(&self, now: Instant) -> NeighborInfo {
        NeighborInfo {
            id: self.conf.id,
            descr: self.conf.descr.clone(),
            group: self.conf.group.clone(),
            remote_addr: self.conf.remote_addr,
            remote_as: self.conf.remote_as,
            template: self.conf.template,
            cloned_from: self.template,
            state: self.state,
            prev_state: self.prev_state,
            down: self.conf.down,
            holdtime: self.holdtime,
            remote_bgpid: Ipv4Addr::from(self.remote_bgpid),
            local: self.local,
            remote: self.remote,
            capabilities: self.capa_neg.clone(),
            sent: self.stats.sent,
            rcvd: self.stats.rcvd,
            last_updown_secs: self
                .stats
                .last_updown
                .map(|t| now.saturating_duration_since(t).as_secs()),
            last_read_secs: self
                .stats
                .last_read
                .map(|t| now.saturating_duration_since(t).as_secs()),
            last_write_secs: self
                .stats
                .last_write
                .map(|t| now.saturating_duration_since(t).as_secs()),
            last_sent_error: self
                .stats
                .last_sent_error
                .map(|(c, s)| describe_error(c, s)),
            last_rcvd_error: self
                .stats
                .last_rcvd_error
                .map(|(c, s)| describe_error(c, s)),
            last_reason: self.stats.last_reason.clone(),
            queue_len: self.queue_len(),
        }
    }
}

/// Administrative view of a neighbor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NeighborInfo {
    pub id: u32,
    pub descr: String,
    pub group: String,
    pub remote_addr: IpAddr,
    pub remote_as: u32,
    pub template: bool,
    pub cloned_from: Option<u32>,
    pub state: SessionState,
    pub prev_state: SessionState,
    pub down: bool,
    pub holdtime: u16,
    pub remote_bgpid: Ipv4Addr,
    pub local: Option<SocketAddr>,
    pub remote: Option<SocketAddr>,
    pub capabilities: Capabilities,
    pub sent: MessageCounters,
    pub rcvd: MessageCounters,
    pub last_updown_secs: Option<u64>,
    pub last_read_secs: Option<u64>,
    pub last_write_secs: Option<u64>,
    pub last_sent_error: Option<String>,
    pub last_rcvd_error: Option<String>,
    pub last_reason: String,
    pub queue_len: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn log() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    #[test]
    fn template_clone() {
        let mut conf = PeerConfig::new(10, "10.0.0.0".parse().unwrap(), 0);
        conf.remote_masklen = 8;
        conf.template = true;
        conf.descr = "dynamic".into();
        let template = Peer::new(conf, log());

        let mut clone =
            Peer::from_template(&template, PEER_ID_DYN_MAX, "10.9.8.7".parse().unwrap());
        assert_eq!(clone.conf.id, PEER_ID_DYN_MAX);
        assert_eq!(clone.conf.remote_masklen, 32);
        assert!(!clone.conf.template);
        assert!(clone.conf.passive);
        assert_eq!(clone.template, Some(10));
        assert_eq!(clone.state, SessionState::None);
        assert_eq!(template.conf.remote_addr, "10.0.0.0".parse::<IpAddr>().unwrap());

        // a learned AS survives a template update
        clone.conf.remote_as = 65123;
        let mut updated = template.conf.clone();
        updated.descr = "renamed".into();
        clone.reclone(&updated);
        assert_eq!(clone.conf.descr, "renamed");
        assert_eq!(clone.conf.remote_as, 65123);
        assert_eq!(clone.conf.remote_addr, "10.9.8.7".parse::<IpAddr>().unwrap());
    }
}
