// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::capabilities::{AnnouncedCapabilities, Role};
use crate::messages::AS_TRANS;
use crate::BGP_PORT;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

pub const DEFAULT_HOLDTIME: u16 = 90;
pub const MIN_HOLDTIME: u16 = 3;
pub const DEFAULT_CONNECT_RETRY: u16 = 120;
pub const DEFAULT_STALETIME: u16 = 180;

/// Process wide settings shared by every peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    pub asn: u32,
    pub bgpid: Ipv4Addr,
    pub holdtime: u16,
    pub min_holdtime: u16,
    pub connect_retry: u16,
    pub staletime: u16,

    /// Log every UPDATE sent and received.
    pub log_updates: bool,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            asn: 0,
            bgpid: Ipv4Addr::UNSPECIFIED,
            holdtime: DEFAULT_HOLDTIME,
            min_holdtime: MIN_HOLDTIME,
            connect_retry: DEFAULT_CONNECT_RETRY,
            staletime: DEFAULT_STALETIME,
            log_updates: false,
        }
    }
}

impl GlobalConfig {
    /// The AS carried in the 2-byte OPEN field.
    pub fn short_as(asn: u32) -> u16 {
        u16::try_from(asn).unwrap_or(AS_TRANS)
    }
}

/// One configured neighbor, or a template that inbound connections are
/// cloned from. Unset timers fall back to the global values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    pub id: u32,
    pub descr: String,
    pub group: String,
    pub remote_addr: IpAddr,
    pub remote_masklen: u8,
    pub remote_port: u16,
    pub local_addr_v4: Option<Ipv4Addr>,
    pub local_addr_v6: Option<Ipv6Addr>,

    /// Zero on templates accepts any peer AS.
    pub remote_as: u32,
    pub local_as: Option<u32>,

    pub passive: bool,
    pub template: bool,
    pub down: bool,
    pub shutdown_reason: String,

    pub holdtime: Option<u16>,
    pub min_holdtime: Option<u16>,
    pub staletime: Option<u16>,

    /// Minutes to wait before restarting after a max-prefix shutdown.
    pub max_prefix_restart: u16,
    pub max_out_prefix_restart: u16,

    /// Hop distance for eBGP multihop.
    pub distance: u8,

    /// RFC 5082 generalized TTL security.
    pub ttlsec: bool,

    /// Interface whose link state gates the session.
    pub if_depend: Option<String>,

    /// Routing demotion group raised while the session is down.
    pub demote_group: Option<String>,

    pub role: Role,
    pub capabilities: AnnouncedCapabilities,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            id: 0,
            descr: String::new(),
            group: String::new(),
            remote_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            remote_masklen: 32,
            remote_port: BGP_PORT,
            local_addr_v4: None,
            local_addr_v6: None,
            remote_as: 0,
            local_as: None,
            passive: false,
            template: false,
            down: false,
            shutdown_reason: String::new(),
            holdtime: None,
            min_holdtime: None,
            staletime: None,
            max_prefix_restart: 0,
            max_out_prefix_restart: 0,
            distance: 1,
            ttlsec: false,
            if_depend: None,
            demote_group: None,
            role: Role::None,
            capabilities: AnnouncedCapabilities::default(),
        }
    }
}

impl PeerConfig {
    pub fn new(id: u32, remote_addr: IpAddr, remote_as: u32) -> Self {
        Self {
            id,
            remote_addr,
            remote_masklen: if remote_addr.is_ipv4() { 32 } else { 128 },
            remote_as,
            ..Default::default()
        }
    }

    pub fn local_as(&self, global: &GlobalConfig) -> u32 {
        self.local_as.unwrap_or(global.asn)
    }

    pub fn ebgp(&self, global: &GlobalConfig) -> bool {
        self.remote_as != self.local_as(global)
    }

    pub fn holdtime(&self, global: &GlobalConfig) -> u16 {
        self.holdtime.unwrap_or(global.holdtime)
    }

    pub fn min_holdtime(&self, global: &GlobalConfig) -> u16 {
        self.min_holdtime.unwrap_or(global.min_holdtime)
    }

    pub fn staletime(&self, global: &GlobalConfig) -> u16 {
        self.staletime.unwrap_or(global.staletime)
    }

    pub fn local_addr(&self) -> Option<IpAddr> {
        match self.remote_addr {
            IpAddr::V4(_) => self.local_addr_v4.map(IpAddr::V4),
            IpAddr::V6(_) => self.local_addr_v6.map(IpAddr::V6),
        }
    }

    pub fn remote_sockaddr(&self) -> SocketAddr {
        SocketAddr::new(self.remote_addr, self.remote_port)
    }

    /// Whether `addr` falls inside the configured remote prefix.
    pub fn covers(&self, addr: IpAddr) -> bool {
        match (self.remote_addr, addr) {
            (IpAddr::V4(net), IpAddr::V4(a)) => {
                let len = u32::from(self.remote_masklen.min(32));
                let mask = u32::MAX.checked_shl(32 - len).unwrap_or(0);
                u32::from(net) & mask == u32::from(a) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(a)) => {
                let len = u32::from(self.remote_masklen.min(128));
                let mask = u128::MAX.checked_shl(128 - len).unwrap_or(0);
                u128::from(net) & mask == u128::from(a) & mask
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerConfig {
    pub addr: SocketAddr,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn prefix_cover() {
        let mut t = PeerConfig::new(1, "10.1.0.0".parse().unwrap(), 0);
        t.remote_masklen = 16;
        assert!(t.covers("10.1.200.3".parse().unwrap()));
        assert!(!t.covers("10.2.0.1".parse().unwrap()));
        assert!(!t.covers("fd00::1".parse().unwrap()));

        t.remote_masklen = 0;
        assert!(t.covers("192.0.2.1".parse().unwrap()));

        let mut t = PeerConfig::new(2, "fd00:1::".parse().unwrap(), 0);
        t.remote_masklen = 32;
        assert!(t.covers("fd00:1::99".parse().unwrap()));
        assert!(!t.covers("fd00:2::99".parse().unwrap()));
    }

    #[test]
    fn global_fallbacks() {
        let g = GlobalConfig {
            asn: 65001,
            holdtime: 30,
            ..Default::default()
        };
        let mut p = PeerConfig::new(1, "192.0.2.1".parse().unwrap(), 65002);
        assert_eq!(p.holdtime(&g), 30);
        assert_eq!(p.min_holdtime(&g), MIN_HOLDTIME);
        assert!(p.ebgp(&g));
        p.local_as = Some(65002);
        assert!(!p.ebgp(&g));
        assert_eq!(GlobalConfig::short_as(4200000000), AS_TRANS);
    }

    #[test]
    fn deserialize_minimal() {
        let p: PeerConfig = serde_json::from_str(
            r#"{"id": 7, "remote_addr": "192.0.2.9", "remote_as": 65010,
                "capabilities": {"as4byte": "required"}}"#,
        )
        .expect("parse peer");
        assert_eq!(p.remote_port, BGP_PORT);
        assert_eq!(p.distance, 1);
        assert!(p.capabilities.as4byte.required());
        assert!(p.capabilities.refresh.enabled());
    }
}
