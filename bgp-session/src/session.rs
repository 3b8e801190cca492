// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per peer session handling: running state machine actions, message
//! processing, graceful restart and the peer side of the RDE protocol.

use crate::capabilities::{
    self, Aid, Capabilities, DecodeError, GrLevel,
};
use crate::clock::{
    TimerKind, INTERVAL_HOLD_DEMOTED, INTERVAL_HOLD_INITIAL,
    INTERVAL_IDLE_HOLD_INITIAL, INTERVAL_SESSION_CLEAR, INTERVAL_SESSION_DOWN,
    MAX_IDLE_HOLD, SENDHOLD_MIN,
};
use crate::config::{GlobalConfig, PeerConfig};
use crate::connection::{Connection, SocketOptions};
use crate::engine::SessionCtx;
use crate::error::Error;
use crate::fsm::{
    self, Action, FsmEvent, FsmEventKind, FsmFlags, SessionState, TimerValue,
};
use crate::ipc::{SessionInfo, ToParent, ToRde};
use crate::log::session_log;
use crate::messages::{
    describe_error, frame, CeaseErrorSubcode, ErrorCode, Header,
    HeaderErrorSubcode, Message, MessageType, NotificationMessage,
    OpenErrorSubcode, OpenMessage, OptionalParameter, RouteRefreshErrorSubcode,
    RouteRefreshMessage, RouteRefreshSubtype, AS_TRANS, BGP4, MAX_MESSAGE_SIZE,
};
use crate::mrt::MrtPeer;
use crate::peer::{Peer, ReconfAction};
use crate::{MSG_PROCESS_LIMIT, SESS_MSG_HIGH_MARK, SESS_MSG_LOW_MARK};
use std::io::ErrorKind;
use std::net::IpAddr;
use std::time::Instant;

const UNIT_SESSION: &str = "session";

/// What a received NOTIFICATION means for the state change it causes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NotificationOutcome {
    Reset,

    /// Graceful restart state may be kept.
    Graceful,
}

/// Whether a NOTIFICATION has to go out as a Cease/Hard Reset once
/// graceful notification is in effect.
///
/// Ref: RFC 8538 §5
pub fn requires_hard_reset(code: u8, subcode: u8) -> bool {
    match ErrorCode::try_from(code) {
        Ok(ErrorCode::HoldTimerExpired | ErrorCode::SendHoldTimerExpired) => {
            false
        }
        Ok(ErrorCode::Cease) => !matches!(
            CeaseErrorSubcode::try_from(subcode),
            Ok(CeaseErrorSubcode::ConnectionRejected
                | CeaseErrorSubcode::OtherConfigChange
                | CeaseErrorSubcode::ConnectionCollision
                | CeaseErrorSubcode::OutOfResources)
        ),
        _ => true,
    }
}

/// Shutdown communication: one length byte and at most 255 bytes of UTF-8.
///
/// Ref: RFC 9003
pub fn shutdown_communication(reason: &str) -> Vec<u8> {
    let mut end = reason.len().min(usize::from(u8::MAX));
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    let mut data = Vec::with_capacity(end + 1);
    data.push(end as u8);
    data.extend_from_slice(&reason.as_bytes()[..end]);
    data
}

impl Peer {
    /// Bring a new peer into the idle state and schedule its first start.
    pub fn init(&mut self, ctx: &mut SessionCtx) {
        match &self.conf.if_depend {
            Some(ifname) => {
                self.depend_ok = false;
                ctx.to_parent(ToParent::SessionDependOn {
                    ifname: ifname.clone(),
                });
            }
            None => self.depend_ok = true,
        }

        self.change_state(ctx, SessionState::Idle, FsmEventKind::None);
        if self.conf.down {
            self.timers.stop(TimerKind::IdleHold);
        } else {
            self.timers.set(TimerKind::IdleHold, INTERVAL_SESSION_CLEAR);
        }

        if self.conf.demote_group.is_some() {
            self.demote(ctx, 1);
        }
    }

    /// Feed an event to the state machine. Events raised while it is
    /// handled run right after it, in order.
    pub fn fsm(&mut self, ctx: &mut SessionCtx, event: FsmEvent) {
        self.pending.push_back(event);
        while let Some(event) = self.pending.pop_front() {
            self.run(ctx, event);
        }
    }

    fn run(&mut self, ctx: &mut SessionCtx, mut event: FsmEvent) {
        let kind = event.kind();
        let flags = FsmFlags {
            depend_ok: self.depend_ok,
            passive: self.passive || self.conf.passive || self.conf.template,
        };
        let mut cause = kind;

        for action in fsm::transition(self.state, kind, &flags) {
            match action {
                Action::StopTimer(t) => self.timers.stop(t),
                Action::SetTimer(t, v) => {
                    let secs = match v {
                        TimerValue::ConnectRetry => ctx.conf.connect_retry,
                        TimerValue::Holdtime => self.holdtime,
                    };
                    self.timers.set(t, u64::from(secs));
                }
                Action::Connect => self.connect(ctx),
                Action::CloseConnection => self.close_connection(),
                Action::TcpEstablished => {
                    if !self.tcp_established() {
                        break;
                    }
                }
                Action::SendOpen => self.send_open(ctx),
                Action::SendKeepalive => self.send_keepalive(ctx),
                Action::SendNotification(code, subcode) => {
                    self.notify(
                        ctx,
                        NotificationMessage::new(code, subcode, Vec::new()),
                    );
                }
                Action::InitialHoldtime => self.holdtime = INTERVAL_HOLD_INITIAL,
                Action::StartHoldTimer => self.start_hold_timer(),
                Action::ProcessOpen => {
                    let FsmEvent::RcvdOpen(body) = &event else {
                        break;
                    };
                    if !self.process_open(ctx, body) {
                        break;
                    }
                }
                Action::ProcessNotification => {
                    if let FsmEvent::RcvdNotification(body) = &event {
                        if self.process_notification(body)
                            == NotificationOutcome::Graceful
                        {
                            cause = FsmEventKind::RcvdGraceNotification;
                        }
                    }
                }
                Action::ForwardUpdate => {
                    let FsmEvent::RcvdUpdate(body) = &mut event else {
                        break;
                    };
                    let data = std::mem::take(body);
                    if !self.forward_update(ctx, data) {
                        break;
                    }
                }
                Action::ClearPassive => self.passive = false,
                Action::ChangeState(state) => {
                    self.change_state(ctx, state, cause)
                }
            }
        }
    }

    /// Move to `state` because of `event`, with the side effects of entering
    /// the new state.
    pub fn change_state(
        &mut self,
        ctx: &mut SessionCtx,
        state: SessionState,
        event: FsmEventKind,
    ) {
        match state {
            SessionState::Idle => {
                if self.state == SessionState::Established
                    && self.conf.demote_group.is_some()
                    && !self.demoted
                {
                    self.demote(ctx, 1);
                }

                // best effort, there may be a NOTIFICATION in the queue
                if self.state >= SessionState::OpenSent {
                    if let Some(conn) = self.conn.as_mut() {
                        let _ = conn.flush();
                    }
                }

                let graceful = self.state == SessionState::Established
                    && self.keeps_graceful_state(event);

                if self.idle_hold_time == 0 {
                    self.idle_hold_time = INTERVAL_IDLE_HOLD_INITIAL;
                }
                self.reset_connection();
                self.throttled = false;
                if self.template.is_none() && !self.conf.template {
                    ctx.to_parent(ToParent::PfkeyReload {
                        peer_id: self.conf.id,
                    });
                }

                if event != FsmEventKind::Stop && !graceful {
                    self.timers.set(TimerKind::IdleHold, self.idle_hold_time);
                    if event != FsmEventKind::None
                        && self.idle_hold_time < MAX_IDLE_HOLD / 2
                    {
                        self.idle_hold_time *= 2;
                    }
                }

                if self.state == SessionState::Established {
                    if graceful {
                        // restart right away, no back off
                        self.timers.set(TimerKind::IdleHold, 0);
                        self.graceful_restart(ctx);
                    } else {
                        self.session_down(ctx);
                    }
                }

                if matches!(
                    self.state,
                    SessionState::None | SessionState::Established
                ) {
                    self.ann = self.conf.capabilities.clone();
                }
            }
            SessionState::Connect => {
                if self.state == SessionState::Established
                    && self.capa_neg.grestart.restart == GrLevel::Full
                {
                    self.graceful_restart(ctx);
                    self.reset_connection();
                }
            }
            SessionState::Active => {
                if self.template.is_none() && !self.conf.template {
                    ctx.to_parent(ToParent::PfkeyReload {
                        peer_id: self.conf.id,
                    });
                }
            }
            SessionState::Established => {
                self.timers
                    .set(TimerKind::IdleHoldReset, self.idle_hold_time);
                if self.demoted {
                    self.timers
                        .set(TimerKind::CarpUndemote, INTERVAL_HOLD_DEMOTED);
                }
                self.session_up(ctx);
            }
            _ => {}
        }

        session_log!(self, info, "state change {} -> {} (event {})",
            self.state, state, event;
            "new_state" => state.to_string()
        );

        let mut mp = None;
        for m in ctx.mrt.iter_mut() {
            if m.wants_state() && m.covers(&self.conf) {
                let mp = mp.get_or_insert_with(|| self.mrt_peer(&ctx.conf));
                m.dump_state(mp, self.state, state);
            }
        }

        self.prev_state = self.state;
        self.state = state;
    }

    /// Timers, connection and received capabilities go; the outbound queue
    /// goes with the connection.
    fn reset_connection(&mut self) {
        self.holdtime = INTERVAL_HOLD_INITIAL;
        for t in [
            TimerKind::ConnectRetry,
            TimerKind::Keepalive,
            TimerKind::Hold,
            TimerKind::SendHold,
            TimerKind::IdleHold,
            TimerKind::IdleHoldReset,
        ] {
            self.timers.stop(t);
        }
        self.close_connection();
        self.capa_peer = Capabilities::default();
    }

    fn keeps_graceful_state(&self, event: FsmEventKind) -> bool {
        let gr = &self.capa_neg.grestart;
        if gr.restart != GrLevel::Full {
            return false;
        }
        match event {
            FsmEventKind::ConClosed | FsmEventKind::ConFatal => true,
            FsmEventKind::RcvdGraceNotification
            | FsmEventKind::TimerHoldtime
            | FsmEventKind::TimerSendHold => gr.grnotification,
            _ => false,
        }
    }

    /// Send a Cease and stop the session. Without an open session there is
    /// nobody to tell, so the reason is only logged.
    pub fn stop(
        &mut self,
        ctx: &mut SessionCtx,
        subcode: CeaseErrorSubcode,
        reason: Option<&str>,
    ) {
        match self.state {
            SessionState::OpenSent
            | SessionState::OpenConfirm
            | SessionState::Established => {
                let data = match reason {
                    Some(r) if !r.is_empty() => shutdown_communication(r),
                    _ => Vec::new(),
                };
                self.notify(
                    ctx,
                    NotificationMessage::new(ErrorCode::Cease, subcode, data),
                );
            }
            _ => {
                session_log!(self, info, "session stop: {:?}, reason \"{}\"",
                    subcode, reason.unwrap_or_default());
            }
        }
        self.fsm(ctx, FsmEvent::Stop);
    }

    pub fn demote(&mut self, ctx: &mut SessionCtx, level: i32) {
        let Some(group) = self.conf.demote_group.clone() else {
            return;
        };
        ctx.to_parent(ToParent::Demote { group, level });
        self.demoted = level > 0;
    }

    pub fn handle_timer(&mut self, ctx: &mut SessionCtx, kind: TimerKind) {
        session_log!(self, debug, "{} expired", kind);
        match kind {
            TimerKind::Hold => self.fsm(ctx, FsmEvent::TimerHoldtime),
            TimerKind::SendHold => self.fsm(ctx, FsmEvent::TimerSendHold),
            TimerKind::ConnectRetry => self.fsm(ctx, FsmEvent::TimerConnRetry),
            TimerKind::Keepalive => self.fsm(ctx, FsmEvent::TimerKeepalive),
            TimerKind::IdleHold => {
                if !self.conf.down {
                    self.fsm(ctx, FsmEvent::Start);
                }
            }
            TimerKind::IdleHoldReset => {
                self.idle_hold_time = INTERVAL_IDLE_HOLD_INITIAL;
                self.errcnt = 0;
            }
            TimerKind::CarpUndemote => {
                if self.demoted && self.state == SessionState::Established {
                    self.demote(ctx, -1);
                }
            }
            TimerKind::RestartTimeout => self.graceful_stop(ctx),
            TimerKind::SessionDown => {
                if self.rdesession {
                    ctx.to_rde(ToRde::SessionDelete {
                        peer_id: self.conf.id,
                    });
                    self.rdesession = false;
                }
                if self.template.is_some() {
                    self.reconf_action = ReconfAction::Delete;
                }
            }
        }
    }

    fn session_up(&mut self, ctx: &mut SessionCtx) {
        self.stats.last_sent_error = None;
        self.stats.last_rcvd_error = None;
        self.stats.last_reason.clear();
        self.timers.stop(TimerKind::SessionDown);

        ctx.to_rde(ToRde::SessionAdd {
            peer_id: self.conf.id,
            conf: Box::new(self.conf.clone()),
        });

        let (local_v4, local_v6) = match self.local.map(|a| a.ip()) {
            Some(IpAddr::V4(a)) => (Some(a), None),
            Some(IpAddr::V6(a)) => (None, Some(a)),
            None => (None, None),
        };
        let info = SessionInfo {
            remote_addr: self
                .remote
                .map(|a| a.ip())
                .unwrap_or(self.conf.remote_addr),
            local_v4,
            local_v6,
            remote_bgpid: self.remote_bgpid,
            remote_as: self.conf.remote_as,
            ebgp: self.conf.ebgp(&ctx.conf),
            capabilities: self.capa_neg.clone(),
        };
        self.stats.last_updown = Some(Instant::now());
        ctx.to_rde(ToRde::SessionUp {
            peer_id: self.conf.id,
            info: Box::new(info),
        });
        self.rdesession = true;

        // stale routes are kept until End-of-RIB or the stale time runs out
        if self.capa_neg.restarting() {
            self.timers.set(
                TimerKind::RestartTimeout,
                u64::from(self.conf.staletime(&ctx.conf)),
            );
        }
    }

    fn session_down(&mut self, ctx: &mut SessionCtx) {
        self.capa_neg = Capabilities::default();
        self.stats.last_updown = Some(Instant::now());
        self.timers.set(TimerKind::SessionDown, INTERVAL_SESSION_DOWN);
        if self.rdesession {
            ctx.to_rde(ToRde::SessionDown {
                peer_id: self.conf.id,
            });
        }
    }

    /// Keep the routes of families the peer preserves forwarding state for,
    /// flush the others.
    ///
    /// Ref: RFC 4724 §4.2
    fn graceful_restart(&mut self, ctx: &mut SessionCtx) {
        let timeout = self
            .capa_neg
            .grestart
            .timeout
            .min(self.conf.staletime(&ctx.conf));
        self.timers.set(TimerKind::RestartTimeout, u64::from(timeout));
        for aid in Aid::ALL {
            let i = aid.index();
            let flags = self.capa_neg.grestart.flags[i];
            if flags.present && flags.forward {
                ctx.to_rde(ToRde::SessionStale {
                    peer_id: self.conf.id,
                    aid,
                });
                session_log!(self, warn,
                    "graceful restart of {}, keeping routes", aid);
                self.capa_neg.grestart.flags[i].restarting = true;
            } else if self.capa_neg.mp[i] {
                ctx.to_rde(ToRde::SessionNoGrace {
                    peer_id: self.conf.id,
                    aid,
                });
                session_log!(self, warn,
                    "graceful restart of {}, flushing routes", aid);
            }
        }
    }

    /// The restart took too long, drop what is still stale.
    fn graceful_stop(&mut self, ctx: &mut SessionCtx) {
        for aid in Aid::ALL {
            let i = aid.index();
            if !self.capa_neg.grestart.flags[i].restarting {
                continue;
            }
            session_log!(self, warn,
                "graceful restart of {}, time-out, flushing", aid);
            ctx.to_rde(ToRde::SessionFlush {
                peer_id: self.conf.id,
                aid,
            });
            self.capa_neg.grestart.flags[i].restarting = false;
        }
    }

    /// The RDE saw End-of-RIB for a restarting family.
    pub fn restarted(&mut self, ctx: &mut SessionCtx, aid: Aid) {
        let flags = &mut self.capa_neg.grestart.flags[aid.index()];
        if !flags.restarting {
            return;
        }
        flags.restarting = false;
        session_log!(self, info, "graceful restart of {} finished", aid);
        ctx.to_rde(ToRde::SessionRestarted {
            peer_id: self.conf.id,
            aid,
        });
        if !self.capa_neg.restarting() {
            self.timers.stop(TimerKind::RestartTimeout);
        }
    }

    pub fn socket_options(&self, global: &GlobalConfig) -> SocketOptions {
        SocketOptions {
            ebgp: self.conf.ebgp(global),
            distance: self.conf.distance,
            ttlsec: self.conf.ttlsec,
        }
    }

    fn connect(&mut self, ctx: &mut SessionCtx) {
        // an attempt is already under way
        if self.conn.is_some() {
            return;
        }
        let opts = self.socket_options(&ctx.conf);
        match Connection::connect(
            self.conf.remote_sockaddr(),
            self.conf.local_addr(),
            &opts,
            &self.log,
        ) {
            Ok(conn) => {
                let done = !conn.connecting;
                self.conn = Some(conn);
                if done {
                    self.pending.push_back(FsmEvent::ConOpen);
                }
            }
            Err(e) => {
                self.connect_failed(&e);
                self.pending.push_back(FsmEvent::ConOpenFail);
            }
        }
    }

    fn connect_failed(&mut self, e: &std::io::Error) {
        if self.last_connect_errno != e.raw_os_error() {
            session_log!(self, warn, "connect: {}", e);
        }
        self.last_connect_errno = e.raw_os_error();
    }

    /// Take over an accepted connection.
    pub fn attach(&mut self, conn: Connection) {
        self.conn = Some(conn);
    }

    fn tcp_established(&mut self) -> bool {
        let Some(conn) = self.conn.as_ref() else {
            session_log!(self, error, "connection established without socket");
            self.pending.push_back(FsmEvent::ConFatal);
            return false;
        };
        self.local = conn.local_addr();
        self.remote = conn.peer_addr();
        if self.local.is_none() || self.remote.is_none() {
            session_log!(self, error, "cannot learn connection addresses");
            self.pending.push_back(FsmEvent::ConFatal);
            return false;
        }
        self.notification_sent = false;
        self.last_connect_errno = None;
        self.start_sendhold_timer();
        true
    }

    fn close_connection(&mut self) {
        if self.conn.take().is_some() {
            session_log!(self, debug, "connection closed");
        }
    }

    pub fn mrt_peer(&self, global: &GlobalConfig) -> MrtPeer {
        MrtPeer {
            remote_as: self.conf.remote_as,
            local_as: self.conf.local_as(global),
            remote: self.conf.remote_addr,
            local: self.local.map(|a| a.ip()),
        }
    }

    /// Largest message allowed on the current session.
    pub fn max_len(&self) -> usize {
        if self.state >= SessionState::OpenConfirm {
            self.capa_neg.max_message_size()
        } else {
            MAX_MESSAGE_SIZE
        }
    }

    fn dump_message(
        &self,
        ctx: &mut SessionCtx,
        typ: MessageType,
        incoming: bool,
        msg: &[u8],
    ) {
        let mut mp = None;
        for m in ctx.mrt.iter_mut() {
            if m.wants(typ, incoming) && m.covers(&self.conf) {
                let mp = mp.get_or_insert_with(|| self.mrt_peer(&ctx.conf));
                m.dump_message(mp, msg);
            }
        }
    }

    /// Queue a framed message. Returns false if there is no connection to
    /// send it on.
    fn enqueue(
        &mut self,
        ctx: &mut SessionCtx,
        typ: MessageType,
        frame: Vec<u8>,
    ) -> bool {
        if self.conn.is_none() {
            session_log!(self, debug, "no connection, dropping {}", typ);
            return false;
        }
        self.dump_message(ctx, typ, false, &frame);
        if let Some(conn) = self.conn.as_mut() {
            conn.queue.push(frame);
        }
        true
    }

    fn start_keepalive_timer(&mut self) {
        if self.holdtime > 0 {
            self.timers
                .set(TimerKind::Keepalive, u64::from(self.holdtime / 3));
        } else {
            self.timers.stop(TimerKind::Keepalive);
        }
    }

    fn start_hold_timer(&mut self) {
        if self.holdtime > 0 {
            self.timers.set(TimerKind::Hold, u64::from(self.holdtime));
        } else {
            self.timers.stop(TimerKind::Hold);
        }
    }

    fn start_sendhold_timer(&mut self) {
        if self.holdtime > 0 {
            self.timers.set(
                TimerKind::SendHold,
                u64::from(self.holdtime).max(SENDHOLD_MIN),
            );
        } else {
            self.timers.stop(TimerKind::SendHold);
        }
    }

    fn send_open(&mut self, ctx: &mut SessionCtx) {
        let local_as = self.conf.local_as(&ctx.conf);
        let caps = capabilities::encode(
            &self.ann,
            local_as,
            self.conf.role,
            self.conf.ebgp(&ctx.conf),
            &self.capa_neg,
        );
        let open = OpenMessage::new(
            GlobalConfig::short_as(local_as),
            self.conf.holdtime(&ctx.conf),
            u32::from(ctx.conf.bgpid),
            caps,
        );
        match Message::from(open).to_frame(MAX_MESSAGE_SIZE) {
            Ok(f) => {
                if self.enqueue(ctx, MessageType::Open, f) {
                    self.stats.sent.open += 1;
                }
            }
            Err(e) => {
                session_log!(self, error, "cannot send OPEN: {}", e);
                self.pending.push_back(FsmEvent::ConFatal);
            }
        }
    }

    fn send_keepalive(&mut self, ctx: &mut SessionCtx) {
        if let Ok(f) = frame(MessageType::KeepAlive, &[], MAX_MESSAGE_SIZE) {
            if self.enqueue(ctx, MessageType::KeepAlive, f) {
                self.stats.sent.keepalive += 1;
            }
        }
        self.start_keepalive_timer();
    }

    /// Queue a NOTIFICATION. At most one goes out per connection, and only
    /// once our OPEN is on its way.
    pub fn notify(&mut self, ctx: &mut SessionCtx, msg: NotificationMessage) {
        let what = describe_error(msg.error_code, msg.error_subcode);
        if self.state < SessionState::OpenSent || self.conn.is_none() {
            session_log!(self, info, "not sending notification: {}", what);
            return;
        }
        if self.notification_sent {
            session_log!(self, debug,
                "notification already sent, dropping: {}", what);
            return;
        }

        let hard = self.capa_neg.grestart.grnotification
            && requires_hard_reset(msg.error_code, msg.error_subcode);
        let mut body = Vec::with_capacity(4 + msg.data.len());
        if hard {
            body.push(ErrorCode::Cease.into());
            body.push(CeaseErrorSubcode::HardReset.into());
        }
        body.push(msg.error_code);
        body.push(msg.error_subcode);
        body.extend_from_slice(&msg.data);

        let max = MAX_MESSAGE_SIZE - Header::WIRE_SIZE;
        if body.len() > max {
            session_log!(self, warn,
                "notification data of {} bytes truncated", body.len() - 2);
            body.truncate(max);
        }

        session_log!(self, warn, "sending notification: {}", what;
            "hard_reset" => hard
        );

        let Ok(f) = frame(MessageType::Notification, &body, MAX_MESSAGE_SIZE)
        else {
            return;
        };
        if self.enqueue(ctx, MessageType::Notification, f) {
            self.stats.sent.notification += 1;
            self.stats.last_sent_error =
                Some((msg.error_code, msg.error_subcode));
            self.notification_sent = true;
            self.errcnt += 1;
        }
    }

    fn refuse_open(
        &mut self,
        ctx: &mut SessionCtx,
        subcode: OpenErrorSubcode,
        data: Vec<u8>,
    ) -> bool {
        self.notify(ctx, NotificationMessage::new(ErrorCode::Open, subcode, data));
        self.change_state(ctx, SessionState::Idle, FsmEventKind::RcvdOpen);
        false
    }

    /// Validate the peer's OPEN and negotiate. On failure the NOTIFICATION is
    /// queued and the peer is idle.
    fn process_open(&mut self, ctx: &mut SessionCtx, body: &[u8]) -> bool {
        let open = match OpenMessage::from_wire(body) {
            Ok(open) => open,
            Err(Error::BadVersion(v)) => {
                session_log!(self, warn, "peer wants unrecognized version {}", v);
                return self.refuse_open(
                    ctx,
                    OpenErrorSubcode::UnsupportedVersionNumber,
                    vec![BGP4],
                );
            }
            Err(e) => {
                session_log!(self, warn, "bad OPEN message: {}", e);
                return self.refuse_open(
                    ctx,
                    OpenErrorSubcode::Unspecific,
                    Vec::new(),
                );
            }
        };

        if open.asn == 0 {
            session_log!(self, warn, "peer requests unacceptable AS 0");
            return self.refuse_open(
                ctx,
                OpenErrorSubcode::BadPeerAS,
                Vec::new(),
            );
        }

        let min_holdtime = self.conf.min_holdtime(&ctx.conf);
        if open.hold_time != 0 && open.hold_time < min_holdtime {
            session_log!(self, warn, "peer requests unacceptable holdtime {}",
                open.hold_time);
            return self.refuse_open(
                ctx,
                OpenErrorSubcode::UnacceptableHoldTime,
                Vec::new(),
            );
        }
        self.holdtime = open.hold_time.min(self.conf.holdtime(&ctx.conf));

        if open.id == 0 {
            session_log!(self, warn, "peer BGPID 0 unacceptable");
            return self.refuse_open(
                ctx,
                OpenErrorSubcode::BadBgpIdentifier,
                Vec::new(),
            );
        }
        self.remote_bgpid = open.id;

        let ebgp = self.conf.ebgp(&ctx.conf);
        self.capa_peer = Capabilities::default();
        let mut as4 = None;
        for p in &open.parameters {
            match p {
                OptionalParameter::Capabilities(value) => {
                    match capabilities::decode(
                        value,
                        &mut self.capa_peer,
                        ebgp,
                        &self.log,
                    ) {
                        Ok(Some(a)) => as4 = Some(a),
                        Ok(None) => {}
                        Err(DecodeError::ZeroAs) => {
                            session_log!(self, warn,
                                "peer requests unacceptable AS 0 in \
                                4-byte AS capability");
                            return self.refuse_open(
                                ctx,
                                OpenErrorSubcode::BadPeerAS,
                                Vec::new(),
                            );
                        }
                        Err(DecodeError::Truncated) => {
                            session_log!(self, warn,
                                "bad capabilities parameter");
                            return self.refuse_open(
                                ctx,
                                OpenErrorSubcode::Unspecific,
                                Vec::new(),
                            );
                        }
                    }
                }
                OptionalParameter::Other { code, .. } => {
                    session_log!(self, warn,
                        "received OPEN message with unsupported optional \
                        parameter: type {}", code);
                    return self.refuse_open(
                        ctx,
                        OpenErrorSubcode::UnsupportedOptionalParameter,
                        Vec::new(),
                    );
                }
            }
        }

        let remote_as = match as4 {
            Some(a) if self.ann.as4byte.enabled() => a,
            _ => u32::from(open.asn),
        };

        // clones of templates without a remote AS take what they are given
        if self.template.is_some()
            && self.conf.remote_as == 0
            && remote_as != u32::from(AS_TRANS)
        {
            self.conf.remote_as = remote_as;
        }
        if self.conf.remote_as != remote_as {
            session_log!(self, warn, "peer sent wrong AS {}", remote_as);
            return self.refuse_open(
                ctx,
                OpenErrorSubcode::BadPeerAS,
                Vec::new(),
            );
        }

        let ebgp = self.conf.ebgp(&ctx.conf);
        if !ebgp && self.remote_bgpid == u32::from(ctx.conf.bgpid) {
            session_log!(self, warn, "peer BGPID {} conflicts with ours",
                std::net::Ipv4Addr::from(self.remote_bgpid));
            return self.refuse_open(
                ctx,
                OpenErrorSubcode::BadBgpIdentifier,
                Vec::new(),
            );
        }

        self.negotiate(ctx, ebgp)
    }

    fn negotiate(&mut self, ctx: &mut SessionCtx, ebgp: bool) -> bool {
        let n = capabilities::negotiate(
            &self.ann,
            &self.capa_peer,
            &self.capa_neg,
            ebgp,
            self.conf.role,
        );
        for aid in n.flush {
            session_log!(self, warn,
                "graceful restart of {}, not restarted, flushing", aid);
            ctx.to_rde(ToRde::SessionFlush {
                peer_id: self.conf.id,
                aid,
            });
        }
        self.capa_neg = n.caps;

        match n.verdict {
            Ok(()) => true,
            Err(e) => {
                session_log!(self, warn, "capability negotiation failed: {:?}", e);
                self.notify(ctx, e.notification());
                self.change_state(
                    ctx,
                    SessionState::Idle,
                    FsmEventKind::RcvdOpen,
                );
                false
            }
        }
    }

    fn process_notification(&mut self, body: &[u8]) -> NotificationOutcome {
        self.errcnt += 1;
        let Ok(msg) = NotificationMessage::from_wire(body) else {
            session_log!(self, warn, "received short notification");
            return NotificationOutcome::Reset;
        };

        let cease: u8 = ErrorCode::Cease.into();
        let (mut code, mut subcode) = (msg.error_code, msg.error_subcode);
        let mut data = msg.data.as_slice();
        let mut outcome = NotificationOutcome::Reset;

        if self.capa_neg.grestart.grnotification {
            if code == cease
                && subcode == u8::from(CeaseErrorSubcode::HardReset)
            {
                if let [c, s, rest @ ..] = data {
                    code = *c;
                    subcode = *s;
                    data = rest;
                } else {
                    session_log!(self, warn,
                        "hard reset notification without embedded error");
                }
            } else {
                outcome = NotificationOutcome::Graceful;
            }
        }

        self.stats.last_rcvd_error = Some((code, subcode));
        session_log!(self, warn, "received notification: {}",
            describe_error(code, subcode);
            "graceful" => outcome == NotificationOutcome::Graceful
        );

        self.stats.last_reason.clear();
        if code == cease
            && (subcode == u8::from(CeaseErrorSubcode::AdminShutdown)
                || subcode == u8::from(CeaseErrorSubcode::AdminReset))
        {
            if let Some((&len, rest)) = data.split_first() {
                let len = usize::from(len);
                if len > 0 && rest.len() < len {
                    session_log!(self, warn,
                        "received truncated shutdown reason");
                } else if len > 0 {
                    let reason = String::from_utf8_lossy(&rest[..len]);
                    session_log!(self, warn,
                        "received shutdown reason: \"{}\"", reason);
                    self.stats.last_reason = reason.into_owned();
                }
            }
        }

        outcome
    }

    fn forward_update(&mut self, ctx: &mut SessionCtx, data: Vec<u8>) -> bool {
        if ctx.conf.log_updates {
            session_log!(self, info, "received update of {} bytes", data.len());
        }
        if ctx.to_rde(ToRde::Update {
            peer_id: self.conf.id,
            data,
        }) {
            return true;
        }
        self.change_state(ctx, SessionState::Idle, FsmEventKind::RcvdUpdate);
        false
    }

    fn process_refresh(&mut self, ctx: &mut SessionCtx, body: &[u8]) {
        self.stats.rcvd.rrefresh += 1;
        if self.state != SessionState::Established {
            session_log!(self, info, "route refresh outside of session, ignored");
            return;
        }
        let Ok(rr) = RouteRefreshMessage::from_wire(body) else {
            session_log!(self, warn, "short route refresh");
            return;
        };
        let length = (Header::WIRE_SIZE + body.len()) as u16;

        let subtype = if self.capa_neg.enhanced_rr {
            match RouteRefreshSubtype::try_from(rr.subtype) {
                Ok(RouteRefreshSubtype::Request) => {
                    if body.len() != 4 {
                        session_log!(self, warn,
                            "route refresh request with bad length {}", length);
                        self.notify(
                            ctx,
                            NotificationMessage::new(
                                ErrorCode::Header,
                                HeaderErrorSubcode::BadMessageLength,
                                length.to_be_bytes().to_vec(),
                            ),
                        );
                        self.fsm(ctx, FsmEvent::ConFatal);
                        return;
                    }
                    RouteRefreshSubtype::Request
                }
                Ok(s) => {
                    if body.len() != 4 {
                        session_log!(self, warn,
                            "route refresh {:?} with bad length {}", s, length);
                        let mut msg = Header {
                            length,
                            typ: MessageType::RouteRefresh,
                        }
                        .to_wire();
                        msg.extend_from_slice(body);
                        self.notify(
                            ctx,
                            NotificationMessage::new(
                                ErrorCode::RouteRefresh,
                                RouteRefreshErrorSubcode::InvalidLength,
                                msg,
                            ),
                        );
                        self.fsm(ctx, FsmEvent::ConFatal);
                        return;
                    }
                    s
                }
                Err(_) => {
                    session_log!(self, warn,
                        "route refresh with unknown subtype {}", rr.subtype);
                    return;
                }
            }
        } else {
            RouteRefreshSubtype::Request
        };

        match subtype {
            RouteRefreshSubtype::BeginOfRr => self.stats.rcvd.refresh_begin += 1,
            RouteRefreshSubtype::EndOfRr => self.stats.rcvd.refresh_end += 1,
            RouteRefreshSubtype::Request => {}
        }

        let Some(aid) = Aid::from_afi_safi(rr.afi, rr.safi) else {
            session_log!(self, warn,
                "route refresh for invalid afi {} safi {}", rr.afi, rr.safi);
            return;
        };
        if !self.capa_neg.refresh && !self.capa_neg.enhanced_rr {
            session_log!(self, warn, "peer sent unexpected refresh");
            return;
        }
        if !self.capa_neg.mp[aid.index()] {
            session_log!(self, warn,
                "route refresh for non-negotiated family {}", aid);
            return;
        }

        ctx.to_rde(ToRde::Refresh {
            peer_id: self.conf.id,
            aid,
            subtype,
        });
    }

    /// Queue an UPDATE produced by the RDE.
    pub fn send_update(&mut self, ctx: &mut SessionCtx, data: Vec<u8>) {
        if self.state != SessionState::Established {
            session_log!(self, debug, "session not established, update dropped");
            return;
        }
        let f = match frame(MessageType::Update, &data, self.max_len()) {
            Ok(f) => f,
            Err(e) => {
                session_log!(self, warn, "update dropped: {}", e);
                return;
            }
        };
        if ctx.conf.log_updates {
            session_log!(self, info, "sending update of {} bytes", data.len());
        }
        if !self.enqueue(ctx, MessageType::Update, f) {
            return;
        }
        self.stats.sent.update += 1;
        self.start_keepalive_timer();

        if !self.throttled && self.queue_len() > SESS_MSG_HIGH_MARK {
            ctx.to_rde(ToRde::Xoff {
                peer_id: self.conf.id,
            });
            self.throttled = true;
        }
    }

    pub fn send_refresh(
        &mut self,
        ctx: &mut SessionCtx,
        aid: Aid,
        subtype: RouteRefreshSubtype,
    ) {
        if self.state != SessionState::Established {
            session_log!(self, debug, "session not established, refresh dropped");
            return;
        }
        if !self.capa_neg.refresh && !self.capa_neg.enhanced_rr {
            session_log!(self, warn,
                "refresh: peer does not support route refresh");
            return;
        }
        if subtype != RouteRefreshSubtype::Request && !self.capa_neg.enhanced_rr
        {
            session_log!(self, warn,
                "refresh: peer does not support enhanced route refresh");
            return;
        }

        let (afi, safi) = aid.afi_safi();
        let msg = RouteRefreshMessage {
            afi,
            subtype: subtype.into(),
            safi,
        };
        let Ok(f) = Message::from(msg).to_frame(self.max_len()) else {
            return;
        };
        if self.enqueue(ctx, MessageType::RouteRefresh, f) {
            self.stats.sent.rrefresh += 1;
            match subtype {
                RouteRefreshSubtype::BeginOfRr => self.stats.sent.refresh_begin += 1,
                RouteRefreshSubtype::EndOfRr => self.stats.sent.refresh_end += 1,
                RouteRefreshSubtype::Request => {}
            }
        }
    }

    /// The RDE found an error in an UPDATE and wants the session reset.
    pub fn update_error(
        &mut self,
        ctx: &mut SessionCtx,
        errcode: u8,
        subcode: u8,
        data: Vec<u8>,
    ) {
        self.notify(
            ctx,
            NotificationMessage {
                error_code: errcode,
                error_subcode: subcode,
                data,
            },
        );

        let max_prefix: u8 = CeaseErrorSubcode::MaxPrefix.into();
        let max_sent_prefix: u8 = CeaseErrorSubcode::MaxSentPrefix.into();
        if errcode == u8::from(ErrorCode::Cease)
            && (subcode == max_prefix || subcode == max_sent_prefix)
        {
            let minutes = if subcode == max_prefix {
                self.conf.max_prefix_restart
            } else {
                self.conf.max_out_prefix_restart
            };
            self.fsm(ctx, FsmEvent::Stop);
            if minutes > 0 {
                self.timers.set(TimerKind::IdleHold, 60 * u64::from(minutes));
            }
        } else {
            self.fsm(ctx, FsmEvent::ConFatal);
        }
    }

    /// Read once from the connection, or resolve a pending connect.
    pub fn read(&mut self, ctx: &mut SessionCtx) {
        let Some(conn) = self.conn.as_mut() else {
            return;
        };
        if conn.connecting {
            self.write(ctx);
            return;
        }
        match conn.read() {
            Ok(0) => {
                session_log!(self, info, "connection closed by peer");
                self.fsm(ctx, FsmEvent::ConClosed);
            }
            Ok(_) => self.stats.last_read = Some(Instant::now()),
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::WouldBlock | ErrorKind::Interrupted
                ) => {}
            Err(e) => {
                session_log!(self, warn, "read error: {}", e);
                self.fsm(ctx, FsmEvent::ConFatal);
            }
        }
    }

    /// Write what is queued, or resolve a pending connect.
    pub fn write(&mut self, ctx: &mut SessionCtx) {
        let Some(conn) = self.conn.as_mut() else {
            return;
        };
        if conn.connecting {
            match conn.finish_connect() {
                Ok(()) => self.fsm(ctx, FsmEvent::ConOpen),
                Err(e) => {
                    self.connect_failed(&e);
                    self.fsm(ctx, FsmEvent::ConOpenFail);
                }
            }
            return;
        }
        match conn.flush() {
            Ok(0) => {}
            Ok(_) => {
                self.stats.last_write = Some(Instant::now());
                self.start_sendhold_timer();
                if self.throttled && self.queue_len() < SESS_MSG_LOW_MARK {
                    ctx.to_rde(ToRde::Xon {
                        peer_id: self.conf.id,
                    });
                    self.throttled = false;
                }
            }
            Err(e) if e.kind() == ErrorKind::WriteZero => {
                session_log!(self, info, "connection closed by peer");
                self.fsm(ctx, FsmEvent::ConClosed);
            }
            Err(e) => {
                session_log!(self, warn, "write error: {}", e);
                self.fsm(ctx, FsmEvent::ConFatal);
            }
        }
    }

    /// Handle buffered inbound messages, at most [`MSG_PROCESS_LIMIT`] of
    /// them. Returns true if more are ready.
    pub fn process_input(&mut self, ctx: &mut SessionCtx) -> bool {
        for _ in 0..MSG_PROCESS_LIMIT {
            let max_len = self.max_len();
            let Some(conn) = self.conn.as_mut() else {
                return false;
            };
            let (header, body) = match conn.reader.next_message(max_len) {
                None => return false,
                Some(Ok(m)) => m,
                Some(Err(e)) => {
                    session_log!(self, warn,
                        "received message with bad header: {}", e);
                    self.notify(ctx, e.notification());
                    self.fsm(ctx, FsmEvent::ConFatal);
                    return false;
                }
            };

            if !ctx.mrt.is_empty() {
                let mut msg = header.to_wire();
                msg.extend_from_slice(&body);
                self.dump_message(ctx, header.typ, true, &msg);
            }
            self.dispatch_message(ctx, header.typ, body);
        }
        let max_len = self.max_len();
        self.conn
            .as_ref()
            .map(|c| c.reader.has_pending(max_len))
            .unwrap_or(false)
    }

    fn dispatch_message(
        &mut self,
        ctx: &mut SessionCtx,
        typ: MessageType,
        body: Vec<u8>,
    ) {
        match typ {
            MessageType::Open => {
                self.stats.rcvd.open += 1;
                self.fsm(ctx, FsmEvent::RcvdOpen(body));
            }
            MessageType::Update => {
                self.stats.rcvd.update += 1;
                self.fsm(ctx, FsmEvent::RcvdUpdate(body));
            }
            MessageType::Notification => {
                self.stats.rcvd.notification += 1;
                self.fsm(ctx, FsmEvent::RcvdNotification(body));
            }
            MessageType::KeepAlive => {
                self.stats.rcvd.keepalive += 1;
                self.fsm(ctx, FsmEvent::RcvdKeepalive);
            }
            MessageType::RouteRefresh => self.process_refresh(ctx, &body),
        }
    }

    /// Apply a new configuration to a peer that is kept across a
    /// reconfiguration.
    pub fn reconfigure(&mut self, ctx: &mut SessionCtx, conf: PeerConfig) {
        if self.demoted && self.conf.demote_group != conf.demote_group {
            self.demote(ctx, -1);
        }
        if self.state < SessionState::OpenSent && !conf.template {
            ctx.to_parent(ToParent::PfkeyReload { peer_id: conf.id });
        }
        if self.rdesession {
            ctx.to_rde(ToRde::SessionAdd {
                peer_id: conf.id,
                conf: Box::new(conf.clone()),
            });
        }
        self.conf = conf;
        self.reconf_action = ReconfAction::Keep;
    }
}
