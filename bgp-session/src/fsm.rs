// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The RFC 4271 state machine as a pure transition table.
//!
//! [`transition`] maps a state and an event onto a list of [`Action`]s. It
//! performs no I/O and touches no peer state; the session executor in
//! [`crate::session`] runs the actions in order.

use crate::clock::TimerKind;
use crate::messages::{ErrorCode, FsmErrorSubcode};
use serde::Serialize;
use std::fmt::{self, Display, Formatter};

/// Session state. `None` is the pseudo state of a peer that has not been
/// initialized yet.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize,
)]
pub enum SessionState {
    #[default]
    None,

    /// Refuse all incoming connections, no resources allocated.
    Idle,

    /// Waiting for an outbound TCP connection to complete.
    Connect,

    /// Waiting for the peer to connect to us.
    Active,

    /// Waiting for the peer's OPEN.
    OpenSent,

    /// Waiting for KEEPALIVE or NOTIFICATION from the peer.
    OpenConfirm,

    /// Exchanging UPDATE, NOTIFICATION and KEEPALIVE messages.
    Established,
}

impl Display for SessionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::None => "none",
            SessionState::Idle => "idle",
            SessionState::Connect => "connect",
            SessionState::Active => "active",
            SessionState::OpenSent => "open sent",
            SessionState::OpenConfirm => "open confirm",
            SessionState::Established => "established",
        };
        write!(f, "{s}")
    }
}

/// An event fed to the state machine. Message events carry the message body
/// without the header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsmEvent {
    /// Initialization pseudo event.
    None,
    Start,
    Stop,
    ConOpen,
    ConOpenFail,
    ConClosed,
    ConFatal,
    TimerConnRetry,
    TimerHoldtime,
    TimerSendHold,
    TimerKeepalive,
    RcvdOpen(Vec<u8>),
    RcvdKeepalive,
    RcvdUpdate(Vec<u8>),
    RcvdNotification(Vec<u8>),

    /// A NOTIFICATION that permits keeping graceful restart state. Only used
    /// as the cause of a state change, never dispatched.
    RcvdGraceNotification,
}

impl FsmEvent {
    pub fn kind(&self) -> FsmEventKind {
        match self {
            FsmEvent::None => FsmEventKind::None,
            FsmEvent::Start => FsmEventKind::Start,
            FsmEvent::Stop => FsmEventKind::Stop,
            FsmEvent::ConOpen => FsmEventKind::ConOpen,
            FsmEvent::ConOpenFail => FsmEventKind::ConOpenFail,
            FsmEvent::ConClosed => FsmEventKind::ConClosed,
            FsmEvent::ConFatal => FsmEventKind::ConFatal,
            FsmEvent::TimerConnRetry => FsmEventKind::TimerConnRetry,
            FsmEvent::TimerHoldtime => FsmEventKind::TimerHoldtime,
            FsmEvent::TimerSendHold => FsmEventKind::TimerSendHold,
            FsmEvent::TimerKeepalive => FsmEventKind::TimerKeepalive,
            FsmEvent::RcvdOpen(_) => FsmEventKind::RcvdOpen,
            FsmEvent::RcvdKeepalive => FsmEventKind::RcvdKeepalive,
            FsmEvent::RcvdUpdate(_) => FsmEventKind::RcvdUpdate,
            FsmEvent::RcvdNotification(_) => FsmEventKind::RcvdNotification,
            FsmEvent::RcvdGraceNotification => {
                FsmEventKind::RcvdGraceNotification
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FsmEventKind {
    None,
    Start,
    Stop,
    ConOpen,
    ConOpenFail,
    ConClosed,
    ConFatal,
    TimerConnRetry,
    TimerHoldtime,
    TimerSendHold,
    TimerKeepalive,
    RcvdOpen,
    RcvdKeepalive,
    RcvdUpdate,
    RcvdNotification,
    RcvdGraceNotification,
}

impl FsmEventKind {
    pub const ALL: [FsmEventKind; 16] = [
        FsmEventKind::None,
        FsmEventKind::Start,
        FsmEventKind::Stop,
        FsmEventKind::ConOpen,
        FsmEventKind::ConOpenFail,
        FsmEventKind::ConClosed,
        FsmEventKind::ConFatal,
        FsmEventKind::TimerConnRetry,
        FsmEventKind::TimerHoldtime,
        FsmEventKind::TimerSendHold,
        FsmEventKind::TimerKeepalive,
        FsmEventKind::RcvdOpen,
        FsmEventKind::RcvdKeepalive,
        FsmEventKind::RcvdUpdate,
        FsmEventKind::RcvdNotification,
        FsmEventKind::RcvdGraceNotification,
    ];
}

impl Display for FsmEventKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = match self {
            FsmEventKind::None => "None",
            FsmEventKind::Start => "Start",
            FsmEventKind::Stop => "Stop",
            FsmEventKind::ConOpen => "Connection opened",
            FsmEventKind::ConOpenFail => "Connection open failed",
            FsmEventKind::ConClosed => "Connection closed",
            FsmEventKind::ConFatal => "Fatal error",
            FsmEventKind::TimerConnRetry => "ConnectRetryTimer expired",
            FsmEventKind::TimerHoldtime => "HoldTimer expired",
            FsmEventKind::TimerSendHold => "SendHoldTimer expired",
            FsmEventKind::TimerKeepalive => "KeepaliveTimer expired",
            FsmEventKind::RcvdOpen => "OPEN message received",
            FsmEventKind::RcvdKeepalive => "KEEPALIVE message received",
            FsmEventKind::RcvdUpdate => "UPDATE message received",
            FsmEventKind::RcvdNotification => "NOTIFICATION received",
            FsmEventKind::RcvdGraceNotification => {
                "graceful NOTIFICATION received"
            }
        };
        write!(f, "{s}")
    }
}

/// Which configured interval a timer is armed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerValue {
    ConnectRetry,
    Holdtime,
}

/// Side effects of a transition, executed in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    StopTimer(TimerKind),
    SetTimer(TimerKind, TimerValue),

    /// Start an outbound TCP connection.
    Connect,
    CloseConnection,

    /// The connection completed; apply socket options and learn addresses.
    TcpEstablished,

    SendOpen,
    SendKeepalive,
    SendNotification(ErrorCode, u8),

    /// Use the initial hold time until the peer's OPEN is processed.
    InitialHoldtime,

    /// Arm the hold timer with the current hold time, or stop it when the
    /// hold time is zero.
    StartHoldTimer,

    /// Validate the OPEN and negotiate. Failure moves the peer to idle and
    /// skips the remaining actions.
    ProcessOpen,

    /// Parse and log the NOTIFICATION. May turn the cause of the following
    /// state change into a graceful notification.
    ProcessNotification,

    /// Hand the UPDATE to the RDE. Failure moves the peer to idle and skips
    /// the remaining actions.
    ForwardUpdate,

    /// Forget that an inbound connection made this peer passive.
    ClearPassive,

    ChangeState(SessionState),
}

/// Peer properties that influence transitions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FsmFlags {
    /// The interface this peer depends on is up, or there is none.
    pub depend_ok: bool,

    /// The peer waits for inbound connections.
    pub passive: bool,
}

use Action::*;
use FsmEventKind as E;
use SessionState as S;

fn unexpected(state: SessionState) -> Vec<Action> {
    let subcode = match state {
        S::OpenSent => FsmErrorSubcode::UnexpectedInOpenSent,
        S::OpenConfirm => FsmErrorSubcode::UnexpectedInOpenConfirm,
        _ => FsmErrorSubcode::UnexpectedInEstablished,
    };
    vec![
        SendNotification(ErrorCode::Fsm, subcode.into()),
        ChangeState(S::Idle),
    ]
}

fn connection_opened() -> Vec<Action> {
    vec![
        TcpEstablished,
        SendOpen,
        StopTimer(TimerKind::ConnectRetry),
        InitialHoldtime,
        StartHoldTimer,
        ChangeState(S::OpenSent),
    ]
}

fn timer_expired(event: FsmEventKind) -> Vec<Action> {
    let code = if event == E::TimerHoldtime {
        ErrorCode::HoldTimerExpired
    } else {
        ErrorCode::SendHoldTimerExpired
    };
    vec![SendNotification(code, 0), ChangeState(S::Idle)]
}

/// Compute the actions for `event` in `state`. Events a state does not
/// handle yield an FSM error NOTIFICATION where one may be sent, and move the
/// peer to idle. Idle ignores everything but `Start`.
pub fn transition(
    state: SessionState,
    event: FsmEventKind,
    flags: &FsmFlags,
) -> Vec<Action> {
    match state {
        S::None | S::Idle => match event {
            E::Start => {
                let mut a = vec![
                    StopTimer(TimerKind::Hold),
                    StopTimer(TimerKind::SendHold),
                    StopTimer(TimerKind::Keepalive),
                    StopTimer(TimerKind::IdleHold),
                ];
                if !flags.depend_ok {
                    a.push(StopTimer(TimerKind::ConnectRetry));
                } else if flags.passive {
                    a.push(ChangeState(S::Active));
                    a.push(StopTimer(TimerKind::ConnectRetry));
                } else {
                    a.push(ChangeState(S::Connect));
                    a.push(SetTimer(
                        TimerKind::ConnectRetry,
                        TimerValue::ConnectRetry,
                    ));
                    a.push(Connect);
                }
                a.push(ClearPassive);
                a
            }
            _ => Vec::new(),
        },
        S::Connect => match event {
            E::Start => Vec::new(),
            E::ConOpen => connection_opened(),
            E::ConOpenFail => vec![
                SetTimer(TimerKind::ConnectRetry, TimerValue::ConnectRetry),
                CloseConnection,
                ChangeState(S::Active),
            ],
            E::TimerConnRetry => vec![
                SetTimer(TimerKind::ConnectRetry, TimerValue::ConnectRetry),
                Connect,
            ],
            _ => vec![ChangeState(S::Idle)],
        },
        S::Active => match event {
            E::Start => Vec::new(),
            E::ConOpen => connection_opened(),
            E::ConOpenFail => vec![
                SetTimer(TimerKind::ConnectRetry, TimerValue::ConnectRetry),
                CloseConnection,
                ChangeState(S::Active),
            ],
            E::TimerConnRetry => vec![
                SetTimer(TimerKind::ConnectRetry, TimerValue::Holdtime),
                ChangeState(S::Connect),
                Connect,
            ],
            _ => vec![ChangeState(S::Idle)],
        },
        S::OpenSent => match event {
            E::Start => Vec::new(),
            E::Stop | E::ConFatal => vec![ChangeState(S::Idle)],
            E::ConClosed => vec![
                CloseConnection,
                SetTimer(TimerKind::ConnectRetry, TimerValue::ConnectRetry),
                ChangeState(S::Active),
            ],
            E::TimerHoldtime | E::TimerSendHold => timer_expired(event),
            E::RcvdOpen => vec![
                ProcessOpen,
                SendKeepalive,
                ChangeState(S::OpenConfirm),
            ],
            E::RcvdNotification => {
                vec![ProcessNotification, ChangeState(S::Idle)]
            }
            _ => unexpected(state),
        },
        S::OpenConfirm => match event {
            E::Start => Vec::new(),
            E::Stop | E::ConClosed | E::ConFatal => {
                vec![ChangeState(S::Idle)]
            }
            E::TimerHoldtime | E::TimerSendHold => timer_expired(event),
            E::TimerKeepalive => vec![SendKeepalive],
            E::RcvdKeepalive => {
                vec![StartHoldTimer, ChangeState(S::Established)]
            }
            E::RcvdNotification => {
                vec![ProcessNotification, ChangeState(S::Idle)]
            }
            _ => unexpected(state),
        },
        S::Established => match event {
            E::Start => Vec::new(),
            E::Stop | E::ConClosed | E::ConFatal => {
                vec![ChangeState(S::Idle)]
            }
            E::TimerHoldtime | E::TimerSendHold => timer_expired(event),
            E::TimerKeepalive => vec![SendKeepalive],
            E::RcvdKeepalive => vec![StartHoldTimer],
            E::RcvdUpdate => vec![StartHoldTimer, ForwardUpdate],
            E::RcvdNotification => {
                vec![ProcessNotification, ChangeState(S::Idle)]
            }
            _ => unexpected(state),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const STATES: [SessionState; 7] = [
        S::None,
        S::Idle,
        S::Connect,
        S::Active,
        S::OpenSent,
        S::OpenConfirm,
        S::Established,
    ];

    const ACTIVE_PEER: FsmFlags = FsmFlags {
        depend_ok: true,
        passive: false,
    };

    fn next_state(actions: &[Action]) -> Option<SessionState> {
        actions.iter().rev().find_map(|a| match a {
            ChangeState(s) => Some(*s),
            _ => None,
        })
    }

    #[test]
    fn transition_table() {
        let table: &[(SessionState, FsmEventKind, Vec<Action>)] = &[
            (
                S::Connect,
                E::ConOpenFail,
                vec![
                    SetTimer(TimerKind::ConnectRetry, TimerValue::ConnectRetry),
                    CloseConnection,
                    ChangeState(S::Active),
                ],
            ),
            (
                S::Connect,
                E::TimerConnRetry,
                vec![
                    SetTimer(TimerKind::ConnectRetry, TimerValue::ConnectRetry),
                    Connect,
                ],
            ),
            (
                S::Active,
                E::TimerConnRetry,
                vec![
                    SetTimer(TimerKind::ConnectRetry, TimerValue::Holdtime),
                    ChangeState(S::Connect),
                    Connect,
                ],
            ),
            (
                S::Active,
                E::ConOpenFail,
                vec![
                    SetTimer(TimerKind::ConnectRetry, TimerValue::ConnectRetry),
                    CloseConnection,
                    ChangeState(S::Active),
                ],
            ),
            (
                S::OpenSent,
                E::ConClosed,
                vec![
                    CloseConnection,
                    SetTimer(TimerKind::ConnectRetry, TimerValue::ConnectRetry),
                    ChangeState(S::Active),
                ],
            ),
            (
                S::OpenSent,
                E::RcvdNotification,
                vec![ProcessNotification, ChangeState(S::Idle)],
            ),
            (
                S::OpenConfirm,
                E::ConClosed,
                vec![ChangeState(S::Idle)],
            ),
            (S::OpenConfirm, E::TimerKeepalive, vec![SendKeepalive]),
            (S::Established, E::RcvdKeepalive, vec![StartHoldTimer]),
            (
                S::Established,
                E::RcvdNotification,
                vec![ProcessNotification, ChangeState(S::Idle)],
            ),
            (
                S::Established,
                E::TimerHoldtime,
                vec![
                    SendNotification(ErrorCode::HoldTimerExpired, 0),
                    ChangeState(S::Idle),
                ],
            ),
            (S::Active, E::RcvdUpdate, vec![ChangeState(S::Idle)]),
        ];
        for (state, event, want) in table {
            assert_eq!(
                &transition(*state, *event, &ACTIVE_PEER),
                want,
                "{state} {event}"
            );
        }

        // a running session ignores Start
        for state in &STATES[2..] {
            assert_eq!(transition(*state, E::Start, &ACTIVE_PEER), vec![]);
        }
    }

    #[test]
    fn unexpected_events_after_open() {
        let handled: &[(SessionState, &[FsmEventKind])] = &[
            (
                S::OpenSent,
                &[
                    E::Start,
                    E::Stop,
                    E::ConFatal,
                    E::ConClosed,
                    E::TimerHoldtime,
                    E::TimerSendHold,
                    E::RcvdOpen,
                    E::RcvdNotification,
                ],
            ),
            (
                S::OpenConfirm,
                &[
                    E::Start,
                    E::Stop,
                    E::ConClosed,
                    E::ConFatal,
                    E::TimerHoldtime,
                    E::TimerSendHold,
                    E::TimerKeepalive,
                    E::RcvdKeepalive,
                    E::RcvdNotification,
                ],
            ),
            (
                S::Established,
                &[
                    E::Start,
                    E::Stop,
                    E::ConClosed,
                    E::ConFatal,
                    E::TimerHoldtime,
                    E::TimerSendHold,
                    E::TimerKeepalive,
                    E::RcvdKeepalive,
                    E::RcvdUpdate,
                    E::RcvdNotification,
                ],
            ),
        ];

        for (state, known) in handled {
            for event in FsmEventKind::ALL {
                if known.contains(&event) {
                    continue;
                }
                let actions = transition(*state, event, &ACTIVE_PEER);
                assert_eq!(
                    next_state(&actions),
                    Some(S::Idle),
                    "{state} {event}"
                );
                assert!(
                    matches!(
                        actions[0],
                        SendNotification(ErrorCode::Fsm, 1..=3)
                    ),
                    "{state} {event}: {actions:?}"
                );
            }
        }

        assert_eq!(
            transition(S::OpenConfirm, E::RcvdOpen, &ACTIVE_PEER)[0],
            SendNotification(ErrorCode::Fsm, 2)
        );
    }

    #[test]
    fn idle_ignores_all_but_start() {
        for event in FsmEventKind::ALL {
            if event == E::Start {
                continue;
            }
            assert_eq!(transition(S::Idle, event, &ACTIVE_PEER), vec![]);
        }
    }

    #[test]
    fn idle_start() {
        let a = transition(S::Idle, E::Start, &ACTIVE_PEER);
        assert_eq!(next_state(&a), Some(S::Connect));
        assert!(a.contains(&Connect));
        assert!(a.contains(&SetTimer(
            TimerKind::ConnectRetry,
            TimerValue::ConnectRetry
        )));

        let a = transition(
            S::Idle,
            E::Start,
            &FsmFlags {
                depend_ok: true,
                passive: true,
            },
        );
        assert_eq!(next_state(&a), Some(S::Active));
        assert!(!a.contains(&Connect));

        // waiting for the interface: no state change, connect retry stopped
        let a = transition(S::Idle, E::Start, &FsmFlags::default());
        assert_eq!(next_state(&a), None);
        assert!(a.contains(&StopTimer(TimerKind::ConnectRetry)));
        assert_eq!(a.last(), Some(&ClearPassive));
    }

    #[test]
    fn open_exchange() {
        let a = transition(S::Connect, E::ConOpen, &ACTIVE_PEER);
        assert_eq!(a, connection_opened());
        assert_eq!(next_state(&a), Some(S::OpenSent));

        let a = transition(S::OpenSent, E::RcvdOpen, &ACTIVE_PEER);
        assert_eq!(
            a,
            vec![ProcessOpen, SendKeepalive, ChangeState(S::OpenConfirm)]
        );

        let a = transition(S::OpenConfirm, E::RcvdKeepalive, &ACTIVE_PEER);
        assert_eq!(a, vec![StartHoldTimer, ChangeState(S::Established)]);

        let a = transition(S::Established, E::RcvdUpdate, &ACTIVE_PEER);
        assert_eq!(a, vec![StartHoldTimer, ForwardUpdate]);
    }

    #[test]
    fn connection_failures() {
        let a = transition(S::Connect, E::ConOpenFail, &ACTIVE_PEER);
        assert_eq!(next_state(&a), Some(S::Active));

        let a = transition(S::Active, E::TimerConnRetry, &ACTIVE_PEER);
        assert_eq!(
            a,
            vec![
                SetTimer(TimerKind::ConnectRetry, TimerValue::Holdtime),
                ChangeState(S::Connect),
                Connect,
            ]
        );

        let a = transition(S::OpenSent, E::ConClosed, &ACTIVE_PEER);
        assert_eq!(next_state(&a), Some(S::Active));
        assert_eq!(
            transition(S::OpenSent, E::ConFatal, &ACTIVE_PEER),
            vec![ChangeState(S::Idle)]
        );

        // nothing can be sent before OPEN
        assert_eq!(
            transition(S::Connect, E::RcvdKeepalive, &ACTIVE_PEER),
            vec![ChangeState(S::Idle)]
        );
    }

    #[test]
    fn timers_expire() {
        for state in [S::OpenSent, S::OpenConfirm, S::Established] {
            assert_eq!(
                transition(state, E::TimerHoldtime, &ACTIVE_PEER),
                vec![
                    SendNotification(ErrorCode::HoldTimerExpired, 0),
                    ChangeState(S::Idle)
                ]
            );
            assert_eq!(
                transition(state, E::TimerSendHold, &ACTIVE_PEER),
                vec![
                    SendNotification(ErrorCode::SendHoldTimerExpired, 0),
                    ChangeState(S::Idle)
                ]
            );
        }
        assert_eq!(
            transition(S::Established, E::TimerKeepalive, &ACTIVE_PEER),
            vec![SendKeepalive]
        );
    }
}
