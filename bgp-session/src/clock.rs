// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per peer timers. Nothing ticks on its own: the event loop asks each peer
//! for due timers at the top of every iteration and sleeps until the
//! earliest deadline.

use std::fmt::{self, Display, Formatter};
use std::time::{Duration, Instant};

/// Hold time used between sending OPEN and receiving the peer's OPEN.
pub const INTERVAL_HOLD_INITIAL: u16 = 240;
pub const INTERVAL_IDLE_HOLD_INITIAL: u64 = 30;
pub const MAX_IDLE_HOLD: u64 = 3600;
pub const INTERVAL_SESSION_DOWN: u64 = 3600;
pub const INTERVAL_HOLD_DEMOTED: u64 = 60;
pub const INTERVAL_SESSION_CLEAR: u64 = 5;
pub const SENDHOLD_MIN: u64 = 90;

/// Template clones that stay down this long are removed.
pub const INTERVAL_HOLD_CLONED: u64 = 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TimerKind {
    ConnectRetry,
    Keepalive,
    Hold,
    SendHold,
    IdleHold,

    /// Resets the idle hold back off once a session stayed up long enough.
    IdleHoldReset,

    /// Lifts routing demotion after the session has been stable.
    CarpUndemote,

    /// Bounds how long routes of a restarting peer are kept stale.
    RestartTimeout,

    /// Tells the RDE to forget a peer that stayed down.
    SessionDown,
}

impl TimerKind {
    pub const ALL: [TimerKind; 9] = [
        TimerKind::ConnectRetry,
        TimerKind::Keepalive,
        TimerKind::Hold,
        TimerKind::SendHold,
        TimerKind::IdleHold,
        TimerKind::IdleHoldReset,
        TimerKind::CarpUndemote,
        TimerKind::RestartTimeout,
        TimerKind::SessionDown,
    ];
}

impl Display for TimerKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = match self {
            TimerKind::ConnectRetry => "ConnectRetryTimer",
            TimerKind::Keepalive => "KeepaliveTimer",
            TimerKind::Hold => "HoldTimer",
            TimerKind::SendHold => "SendHoldTimer",
            TimerKind::IdleHold => "IdleHoldTimer",
            TimerKind::IdleHoldReset => "IdleHoldResetTimer",
            TimerKind::CarpUndemote => "CarpUndemoteTimer",
            TimerKind::RestartTimeout => "RestartTimer",
            TimerKind::SessionDown => "SessionDownTimer",
        };
        write!(f, "{s}")
    }
}

/// The timers of one peer. At most one deadline per kind; arming a kind
/// replaces its previous deadline.
#[derive(Debug, Default, Clone)]
pub struct Timers {
    due: [Option<Instant>; TimerKind::ALL.len()],
}

impl Timers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm `kind` to fire `secs` seconds from now.
    pub fn set(&mut self, kind: TimerKind, secs: u64) {
        self.set_at(kind, Instant::now() + Duration::from_secs(secs));
    }

    pub fn set_at(&mut self, kind: TimerKind, when: Instant) {
        self.due[kind as usize] = Some(when);
    }

    pub fn stop(&mut self, kind: TimerKind) {
        self.due[kind as usize] = None;
    }

    pub fn stop_all(&mut self) {
        self.due = Default::default();
    }

    pub fn running(&self, kind: TimerKind) -> bool {
        self.due[kind as usize].is_some()
    }

    pub fn deadline(&self, kind: TimerKind) -> Option<Instant> {
        self.due[kind as usize]
    }

    /// Time left until `kind` fires, zero if already due.
    pub fn remaining(&self, kind: TimerKind, now: Instant) -> Option<Duration> {
        self.deadline(kind)
            .map(|d| d.saturating_duration_since(now))
    }

    /// Disarm and return the first timer that is due at `now`.
    pub fn pop_due(&mut self, now: Instant) -> Option<TimerKind> {
        let kind = TimerKind::ALL
            .into_iter()
            .find(|k| matches!(self.due[*k as usize], Some(d) if d <= now))?;
        self.stop(kind);
        Some(kind)
    }

    /// Time until the earliest armed timer fires.
    pub fn next_timeout(&self, now: Instant) -> Option<Duration> {
        self.due
            .iter()
            .flatten()
            .min()
            .map(|d| d.saturating_duration_since(now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn arm_and_replace() {
        let now = Instant::now();
        let mut t = Timers::new();
        assert_eq!(t.next_timeout(now), None);

        t.set_at(TimerKind::Hold, now + Duration::from_secs(90));
        t.set_at(TimerKind::Keepalive, now + Duration::from_secs(30));
        assert_eq!(t.next_timeout(now), Some(Duration::from_secs(30)));

        // rearming replaces the pending deadline
        t.set_at(TimerKind::Keepalive, now + Duration::from_secs(60));
        assert_eq!(t.next_timeout(now), Some(Duration::from_secs(60)));
        assert_eq!(
            t.remaining(TimerKind::Hold, now),
            Some(Duration::from_secs(90))
        );

        t.stop(TimerKind::Keepalive);
        assert!(!t.running(TimerKind::Keepalive));
        t.stop_all();
        assert!(!t.running(TimerKind::Hold));
    }

    #[test]
    fn due_order() {
        let now = Instant::now();
        let mut t = Timers::new();
        t.set_at(TimerKind::SessionDown, now);
        t.set_at(TimerKind::Hold, now - Duration::from_secs(1));
        t.set_at(TimerKind::ConnectRetry, now + Duration::from_secs(1));

        assert_eq!(t.pop_due(now), Some(TimerKind::Hold));
        assert_eq!(t.pop_due(now), Some(TimerKind::SessionDown));
        assert_eq!(t.pop_due(now), None);
        assert!(t.running(TimerKind::ConnectRetry));
        assert_eq!(t.next_timeout(now + Duration::from_secs(5)),
            Some(Duration::ZERO));
    }
}
