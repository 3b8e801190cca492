// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! MRT dumps of state changes and raw messages as BGP4MP records.
//!
//! Ref: RFC 6396 §4.4

use crate::config::PeerConfig;
use crate::fsm::SessionState;
use crate::messages::MessageType;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::{SystemTime, UNIX_EPOCH};

pub const MRT_BGP4MP: u16 = 16;
pub const BGP4MP_MESSAGE_AS4: u16 = 4;
pub const BGP4MP_STATE_CHANGE_AS4: u16 = 5;

const AFI_IPV4: u16 = 1;
const AFI_IPV6: u16 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MrtKind {
    /// Every message received, and state changes.
    AllIn,

    /// Every message sent and received, and state changes.
    AllOut,

    /// UPDATE messages received.
    UpdateIn,

    /// UPDATE messages sent.
    UpdateOut,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MrtConfig {
    pub name: String,
    pub kind: MrtKind,

    /// Restrict the dump to one peer.
    pub peer_id: Option<u32>,

    /// Restrict the dump to a peer group.
    pub group: Option<String>,
}

/// Addressing of one session as recorded in BGP4MP records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MrtPeer {
    pub remote_as: u32,
    pub local_as: u32,
    pub remote: IpAddr,
    pub local: Option<IpAddr>,
}

/// An open dump file. Records are buffered and written out once per event
/// loop iteration.
#[derive(Debug)]
pub struct MrtDump {
    pub conf: MrtConfig,
    file: File,
    buf: Vec<u8>,
}

impl MrtDump {
    pub fn new(conf: MrtConfig, file: File) -> Self {
        Self {
            conf,
            file,
            buf: Vec::new(),
        }
    }

    /// Swap in a new file, after log rotation.
    pub fn reopen(&mut self, file: File) -> io::Result<()> {
        self.flush()?;
        self.file = file;
        Ok(())
    }

    pub fn covers(&self, peer: &PeerConfig) -> bool {
        match (&self.conf.peer_id, &self.conf.group) {
            (None, None) => true,
            (Some(id), _) if *id == peer.id => true,
            (_, Some(group)) => *group == peer.group,
            _ => false,
        }
    }

    /// Whether a message of `typ` sent (`incoming == false`) or received is
    /// recorded.
    pub fn wants(&self, typ: MessageType, incoming: bool) -> bool {
        match self.conf.kind {
            MrtKind::AllIn => incoming,
            MrtKind::AllOut => true,
            MrtKind::UpdateIn => incoming && typ == MessageType::Update,
            MrtKind::UpdateOut => !incoming && typ == MessageType::Update,
        }
    }

    pub fn wants_state(&self) -> bool {
        matches!(self.conf.kind, MrtKind::AllIn | MrtKind::AllOut)
    }

    pub fn dump_state(
        &mut self,
        peer: &MrtPeer,
        old: SessionState,
        new: SessionState,
    ) {
        let rec = state_change_record(timestamp(), peer, old, new);
        self.buf.extend_from_slice(&rec);
    }

    /// Record a complete message, header included.
    pub fn dump_message(&mut self, peer: &MrtPeer, msg: &[u8]) {
        let rec = message_record(timestamp(), peer, msg);
        self.buf.extend_from_slice(&rec);
    }

    pub fn pending(&self) -> bool {
        !self.buf.is_empty()
    }

    pub fn flush(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        self.file.write_all(&self.buf)?;
        self.buf.clear();
        Ok(())
    }
}

fn timestamp() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

fn state_number(s: SessionState) -> u16 {
    match s {
        SessionState::None => 0,
        SessionState::Idle => 1,
        SessionState::Connect => 2,
        SessionState::Active => 3,
        SessionState::OpenSent => 4,
        SessionState::OpenConfirm => 5,
        SessionState::Established => 6,
    }
}

/// Peer AS, local AS, interface index, AFI and both addresses. The local
/// address is all zeros when unknown.
fn bgp4mp_peer(peer: &MrtPeer) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&peer.remote_as.to_be_bytes());
    buf.extend_from_slice(&peer.local_as.to_be_bytes());
    buf.extend_from_slice(&0u16.to_be_bytes());
    match peer.remote {
        IpAddr::V4(remote) => {
            let local = match peer.local {
                Some(IpAddr::V4(a)) => a,
                _ => Ipv4Addr::UNSPECIFIED,
            };
            buf.extend_from_slice(&AFI_IPV4.to_be_bytes());
            buf.extend_from_slice(&remote.octets());
            buf.extend_from_slice(&local.octets());
        }
        IpAddr::V6(remote) => {
            let local = match peer.local {
                Some(IpAddr::V6(a)) => a,
                _ => Ipv6Addr::UNSPECIFIED,
            };
            buf.extend_from_slice(&AFI_IPV6.to_be_bytes());
            buf.extend_from_slice(&remote.octets());
            buf.extend_from_slice(&local.octets());
        }
    }
    buf
}

fn record(ts: u32, subtype: u16, body: Vec<u8>) -> Vec<u8> {
    let mut buf = Vec::with_capacity(12 + body.len());
    buf.extend_from_slice(&ts.to_be_bytes());
    buf.extend_from_slice(&MRT_BGP4MP.to_be_bytes());
    buf.extend_from_slice(&subtype.to_be_bytes());
    buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
    buf.extend_from_slice(&body);
    buf
}

pub fn state_change_record(
    ts: u32,
    peer: &MrtPeer,
    old: SessionState,
    new: SessionState,
) -> Vec<u8> {
    let mut body = bgp4mp_peer(peer);
    body.extend_from_slice(&state_number(old).to_be_bytes());
    body.extend_from_slice(&state_number(new).to_be_bytes());
    record(ts, BGP4MP_STATE_CHANGE_AS4, body)
}

pub fn message_record(ts: u32, peer: &MrtPeer, msg: &[u8]) -> Vec<u8> {
    let mut body = bgp4mp_peer(peer);
    body.extend_from_slice(msg);
    record(ts, BGP4MP_MESSAGE_AS4, body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use pretty_hex::*;

    fn peer() -> MrtPeer {
        MrtPeer {
            remote_as: 65001,
            local_as: 4200000000,
            remote: "192.0.2.1".parse().unwrap(),
            local: Some("192.0.2.2".parse().unwrap()),
        }
    }

    #[test]
    fn state_change() {
        let rec = state_change_record(
            1,
            &peer(),
            SessionState::OpenConfirm,
            SessionState::Established,
        );
        println!("record: {}", rec.hex_dump());
        assert_eq!(
            rec,
            vec![
                0, 0, 0, 1, // timestamp
                0, 16, 0, 5, // BGP4MP, STATE_CHANGE_AS4
                0, 0, 0, 24, // length
                0, 0, 0xfd, 0xe9, // peer as
                0xfa, 0x56, 0xea, 0x00, // local as
                0, 0, // ifindex
                0, 1, // afi
                192, 0, 2, 1, // peer
                192, 0, 2, 2, // local
                0, 5, 0, 6, // states
            ]
        );
    }

    #[test]
    fn message_v6_without_local() {
        let p = MrtPeer {
            remote: "fd00::1".parse().unwrap(),
            local: None,
            ..peer()
        };
        let msg = [0xffu8; 19];
        let rec = message_record(0, &p, &msg);
        assert_eq!(&rec[6..8], &[0, 4]);
        assert_eq!(rec.len(), 12 + 12 + 32 + 19);
        assert_eq!(&rec[22..24], &[0, 2]);
        assert_eq!(&rec[40..56], &[0; 16]);
    }
}
