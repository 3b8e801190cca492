// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The session engine of a BGP speaker. It owns the TCP connections to
//! every neighbor, runs the RFC 4271 state machine for each of them,
//! negotiates capabilities and hands UPDATE and ROUTE-REFRESH data to a
//! separate route decision engine (RDE) over a typed channel.

pub mod capabilities;
pub mod clock;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod fsm;
pub mod ipc;
pub mod log;
pub mod messages;
pub mod mrt;
pub mod peer;
pub mod poll;
pub mod session;

#[cfg(test)]
#[macro_use]
extern crate lazy_static;

#[cfg(test)]
mod test;

pub const BGP_PORT: u16 = 179;
pub const COMPONENT_BGP: &str = "bgp";
pub const MOD_ENGINE: &str = "engine";
pub const MOD_NEIGHBOR: &str = "neighbor";

/// Upper bound on how long the event loop sleeps in a single readiness wait,
/// in seconds.
pub const MAX_POLL_TIMEOUT: u64 = 240;

/// How long accepting new connections stays suspended after running out of
/// file descriptors, in seconds.
pub const PAUSE_ACCEPT_TIMEOUT: u64 = 1;

/// Number of queued inbound messages processed per peer per loop iteration.
pub const MSG_PROCESS_LIMIT: usize = 25;

/// Outbound queue length above which the RDE is told to stop sending.
pub const SESS_MSG_HIGH_MARK: usize = 2000;

/// Outbound queue length below which the RDE is told to resume.
pub const SESS_MSG_LOW_MARK: usize = 500;
