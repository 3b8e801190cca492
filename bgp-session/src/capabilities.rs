// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Capability advertisement (RFC 5492) and negotiation.
//!
//! Three capability sets exist per peer. [`AnnouncedCapabilities`] is what we
//! advertise and carries a tri-state [`CapaMode`] per capability so that
//! "required" can be enforced. [`Capabilities`] holds plain flags and is used
//! both for what the peer sent and for the agreed result of [`negotiate`].

use crate::messages::{
    ErrorCode, NotificationMessage, OpenErrorSubcode, MAX_EXT_MESSAGE_SIZE,
    MAX_MESSAGE_SIZE,
};
use nom::{
    bytes::complete::take,
    number::complete::{be_u16, u8 as parse_u8},
    IResult,
};
use num_enum::TryFromPrimitive;
use serde::{Deserialize, Serialize};
use slog::{warn, Logger};
use std::fmt::{self, Display, Formatter};

const UNIT_CAPABILITIES: &str = "capabilities";

pub const AFI_IPV4: u16 = 1;
pub const AFI_IPV6: u16 = 2;
pub const SAFI_UNICAST: u8 = 1;
pub const SAFI_MPLSVPN: u8 = 128;
pub const SAFI_FLOWSPEC: u8 = 133;

/// Size of the per family tables. Slot 0 is not a family; in received sets
/// it records a multiprotocol capability for a family we do not know.
pub const AID_MAX: usize = 7;

/// Address family identifier, a known AFI/SAFI pair.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum Aid {
    Inet = 1,
    Inet6,
    VpnIpv4,
    VpnIpv6,
    FlowspecV4,
    FlowspecV6,
}

impl Aid {
    pub const ALL: [Aid; AID_MAX - 1] = [
        Aid::Inet,
        Aid::Inet6,
        Aid::VpnIpv4,
        Aid::VpnIpv6,
        Aid::FlowspecV4,
        Aid::FlowspecV6,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn afi_safi(self) -> (u16, u8) {
        match self {
            Aid::Inet => (AFI_IPV4, SAFI_UNICAST),
            Aid::Inet6 => (AFI_IPV6, SAFI_UNICAST),
            Aid::VpnIpv4 => (AFI_IPV4, SAFI_MPLSVPN),
            Aid::VpnIpv6 => (AFI_IPV6, SAFI_MPLSVPN),
            Aid::FlowspecV4 => (AFI_IPV4, SAFI_FLOWSPEC),
            Aid::FlowspecV6 => (AFI_IPV6, SAFI_FLOWSPEC),
        }
    }

    pub fn from_afi_safi(afi: u16, safi: u8) -> Option<Aid> {
        Aid::ALL.into_iter().find(|a| a.afi_safi() == (afi, safi))
    }
}

impl Display for Aid {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = match self {
            Aid::Inet => "IPv4 unicast",
            Aid::Inet6 => "IPv6 unicast",
            Aid::VpnIpv4 => "IPv4 vpn",
            Aid::VpnIpv6 => "IPv6 vpn",
            Aid::FlowspecV4 => "IPv4 flowspec",
            Aid::FlowspecV6 => "IPv6 flowspec",
        };
        write!(f, "{s}")
    }
}

/// How a capability is announced.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum CapaMode {
    /// Not announced.
    #[default]
    Off,

    /// Announced, the session comes up without it.
    On,

    /// Announced, the session is refused if the peer does not agree.
    Required,
}

impl CapaMode {
    pub fn enabled(self) -> bool {
        self != CapaMode::Off
    }

    pub fn required(self) -> bool {
        self == CapaMode::Required
    }
}

#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
)]
pub struct AddPathMode {
    pub recv: CapaMode,
    pub send: CapaMode,
}

/// BGP role of the local or remote speaker.
///
/// Ref: RFC 9234
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    #[default]
    None,
    Provider,
    RouteServer,
    RouteServerClient,
    Customer,
    Peer,
}

impl Role {
    fn to_capa(self) -> Option<u8> {
        match self {
            Role::None => None,
            Role::Provider => Some(0),
            Role::RouteServer => Some(1),
            Role::RouteServerClient => Some(2),
            Role::Customer => Some(3),
            Role::Peer => Some(4),
        }
    }

    fn from_capa(v: u8) -> Role {
        match v {
            0 => Role::Provider,
            1 => Role::RouteServer,
            2 => Role::RouteServerClient,
            3 => Role::Customer,
            4 => Role::Peer,
            _ => Role::None,
        }
    }

    /// The only role the other side of the session may take.
    pub fn counterpart(self) -> Role {
        match self {
            Role::None => Role::None,
            Role::Provider => Role::Customer,
            Role::Customer => Role::Provider,
            Role::RouteServer => Role::RouteServerClient,
            Role::RouteServerClient => Role::RouteServer,
            Role::Peer => Role::Peer,
        }
    }
}

/// What we advertise to a peer. Announcing nothing for multiprotocol implies
/// IPv4 unicast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnnouncedCapabilities {
    pub mp: [CapaMode; AID_MAX],
    pub refresh: CapaMode,
    pub enhanced_rr: CapaMode,
    pub as4byte: CapaMode,
    pub ext_msg: CapaMode,

    /// Open policy role capability. Only sent on eBGP sessions that have a
    /// role configured.
    pub role: CapaMode,

    /// Graceful restart. With a zero `restart_time` only the End-of-RIB
    /// marker is advertised.
    pub graceful_restart: CapaMode,
    pub restart_time: u16,

    /// Set the forwarding state bit for every advertised family.
    pub gr_forwarding: bool,

    /// RFC 8538 graceful notification support, advertised inside the
    /// graceful restart capability.
    pub graceful_notification: bool,

    pub add_path: [AddPathMode; AID_MAX],
    pub ext_nh: [CapaMode; AID_MAX],
}

impl Default for AnnouncedCapabilities {
    fn default() -> Self {
        Self {
            mp: [CapaMode::Off; AID_MAX],
            refresh: CapaMode::On,
            enhanced_rr: CapaMode::Off,
            as4byte: CapaMode::On,
            ext_msg: CapaMode::Off,
            role: CapaMode::On,
            graceful_restart: CapaMode::On,
            restart_time: 0,
            gr_forwarding: false,
            graceful_notification: false,
            add_path: [AddPathMode::default(); AID_MAX],
            ext_nh: [CapaMode::Off; AID_MAX],
        }
    }
}

/// Graceful restart support level.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GrLevel {
    #[default]
    Off,

    /// The peer only understands the End-of-RIB marker.
    EndOfRib,

    /// Full graceful restart with per family state.
    Full,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GrFlags {
    /// The family was listed in the capability.
    pub present: bool,

    /// The peer preserved forwarding state for the family.
    pub forward: bool,

    /// The peer set the restart state bit.
    pub restart: bool,

    /// Routes of the family are held stale while the peer restarts.
    pub restarting: bool,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct GracefulRestart {
    pub restart: GrLevel,
    pub timeout: u16,
    pub grnotification: bool,
    pub flags: [GrFlags; AID_MAX],
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AddPath {
    pub recv: bool,
    pub send: bool,
}

/// Capabilities received from a peer, or the negotiated result.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub mp: [bool; AID_MAX],
    pub refresh: bool,
    pub enhanced_rr: bool,
    pub as4byte: bool,
    pub ext_msg: bool,
    pub policy: bool,
    pub role: Role,
    pub grestart: GracefulRestart,
    pub add_path: [AddPath; AID_MAX],
    pub ext_nh: [bool; AID_MAX],
}

impl Capabilities {
    /// Largest message the session accepts and sends.
    pub fn max_message_size(&self) -> usize {
        if self.ext_msg {
            MAX_EXT_MESSAGE_SIZE
        } else {
            MAX_MESSAGE_SIZE
        }
    }

    /// True while any family is held stale for a restarting peer.
    pub fn restarting(&self) -> bool {
        self.grestart.flags.iter().any(|f| f.restarting)
    }

    /// Families negotiated for multiprotocol.
    pub fn families(&self) -> impl Iterator<Item = Aid> + '_ {
        Aid::ALL.into_iter().filter(|a| self.mp[a.index()])
    }
}

#[derive(Debug, Eq, PartialEq, Clone, Copy, TryFromPrimitive)]
#[repr(u8)]
pub enum CapabilityCode {
    /// RFC 2858
    MultiprotocolExtensions = 1,

    /// RFC 2918
    RouteRefresh = 2,

    /// RFC 8950
    ExtendedNextHopEncoding = 5,

    /// RFC 8654
    BGPExtendedMessage = 6,

    /// RFC 9234
    BgpRole = 9,

    /// RFC 4724
    GracefulRestart = 64,

    /// RFC 6793
    FourOctetAs = 65,

    /// RFC 7911
    AddPath = 69,

    /// RFC 7313
    EnhancedRouteRefresh = 70,
}

const GR_RESTART_FLAG: u16 = 0x8000;
const GR_NOTIFICATION_FLAG: u16 = 0x4000;
const GR_TIME_MASK: u16 = 0x0fff;
const GR_FORWARD_FLAG: u8 = 0x80;

const ADD_PATH_RECV: u8 = 0x01;
const ADD_PATH_SEND: u8 = 0x02;

fn put(buf: &mut Vec<u8>, code: CapabilityCode, value: &[u8]) {
    buf.push(code as u8);
    buf.push(value.len() as u8);
    buf.extend_from_slice(value);
}

fn afi_safi_value(aid: Aid) -> [u8; 4] {
    let (afi, safi) = aid.afi_safi();
    let afi = afi.to_be_bytes();
    [afi[0], afi[1], 0, safi]
}

/// Encode the capabilities we announce as the value of an OPEN capabilities
/// parameter. `neg` is the previous negotiated set, consulted for families
/// still restarting.
pub fn encode(
    ann: &AnnouncedCapabilities,
    local_as: u32,
    role: Role,
    ebgp: bool,
    neg: &Capabilities,
) -> Vec<u8> {
    let mut buf = Vec::new();
    let announced: Vec<Aid> = Aid::ALL
        .into_iter()
        .filter(|a| ann.mp[a.index()].enabled())
        .collect();

    for aid in &announced {
        put(
            &mut buf,
            CapabilityCode::MultiprotocolExtensions,
            &afi_safi_value(*aid),
        );
    }

    if ann.refresh.enabled() {
        put(&mut buf, CapabilityCode::RouteRefresh, &[]);
    }

    let ext_nh: Vec<u8> = [Aid::Inet, Aid::VpnIpv4]
        .into_iter()
        .filter(|a| ann.ext_nh[a.index()].enabled() && ann.mp[a.index()].enabled())
        .flat_map(|a| {
            let (afi, safi) = a.afi_safi();
            let mut e = afi.to_be_bytes().to_vec();
            e.extend_from_slice(&u16::from(safi).to_be_bytes());
            e.extend_from_slice(&AFI_IPV6.to_be_bytes());
            e
        })
        .collect();
    if !ext_nh.is_empty() {
        put(&mut buf, CapabilityCode::ExtendedNextHopEncoding, &ext_nh);
    }

    if ann.ext_msg.enabled() {
        put(&mut buf, CapabilityCode::BGPExtendedMessage, &[]);
    }

    if let Some(r) = role.to_capa() {
        let afi_ok = announced.is_empty()
            || ann.mp[Aid::Inet.index()].enabled()
            || ann.mp[Aid::Inet6.index()].enabled();
        if ebgp && ann.role.enabled() && afi_ok {
            put(&mut buf, CapabilityCode::BgpRole, &[r]);
        }
    }

    if ann.graceful_restart.enabled() {
        let mut hdr = ann.restart_time & GR_TIME_MASK;
        if !neg.restarting() {
            hdr |= GR_RESTART_FLAG;
        }
        if ann.graceful_notification {
            hdr |= GR_NOTIFICATION_FLAG;
        }
        let mut value = hdr.to_be_bytes().to_vec();
        if ann.restart_time != 0 {
            let families = if announced.is_empty() {
                vec![Aid::Inet]
            } else {
                announced.clone()
            };
            for aid in families {
                let (afi, safi) = aid.afi_safi();
                value.extend_from_slice(&afi.to_be_bytes());
                value.push(safi);
                value.push(if ann.gr_forwarding { GR_FORWARD_FLAG } else { 0 });
            }
        }
        put(&mut buf, CapabilityCode::GracefulRestart, &value);
    }

    if ann.as4byte.enabled() {
        put(&mut buf, CapabilityCode::FourOctetAs, &local_as.to_be_bytes());
    }

    if ann.add_path.iter().any(|m| m.recv.enabled() || m.send.enabled()) {
        let families = if announced.is_empty() {
            vec![Aid::Inet]
        } else {
            announced.clone()
        };
        let mut value = Vec::new();
        for aid in families {
            let mode = ann.add_path[aid.index()];
            let mut flags = 0;
            if mode.recv.enabled() {
                flags |= ADD_PATH_RECV;
            }
            if mode.send.enabled() {
                flags |= ADD_PATH_SEND;
            }
            if flags == 0 {
                continue;
            }
            let (afi, safi) = aid.afi_safi();
            value.extend_from_slice(&afi.to_be_bytes());
            value.push(safi);
            value.push(flags);
        }
        if !value.is_empty() {
            put(&mut buf, CapabilityCode::AddPath, &value);
        }
    }

    if ann.enhanced_rr.enabled() {
        put(&mut buf, CapabilityCode::EnhancedRouteRefresh, &[]);
    }

    buf
}

/// Fatal outcomes of capability decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// A TLV header or length runs past the end of the parameter.
    Truncated,

    /// The 4-byte AS capability carries AS 0.
    ZeroAs,
}

fn tlv(input: &[u8]) -> IResult<&[u8], (u8, &[u8])> {
    let (input, code) = parse_u8(input)?;
    let (input, len) = parse_u8(input)?;
    let (input, value) = take(len)(input)?;
    Ok((input, (code, value)))
}

fn family_entry(input: &[u8]) -> IResult<&[u8], (u16, u8, u8)> {
    let (input, afi) = be_u16(input)?;
    let (input, safi) = parse_u8(input)?;
    let (input, flags) = parse_u8(input)?;
    Ok((input, (afi, safi, flags)))
}

/// Decode the value of one capabilities parameter into `caps`, which may
/// already hold capabilities from an earlier parameter. Malformed individual
/// capabilities are dropped with a warning. Returns the AS carried by the
/// 4-byte AS capability, if any.
pub fn decode(
    mut buf: &[u8],
    caps: &mut Capabilities,
    ebgp: bool,
    log: &Logger,
) -> Result<Option<u32>, DecodeError> {
    let mut asn = None;

    while !buf.is_empty() {
        let (rest, (code, value)) =
            tlv(buf).map_err(|_| DecodeError::Truncated)?;
        buf = rest;

        let Ok(code) = CapabilityCode::try_from(code) else {
            continue;
        };

        match code {
            CapabilityCode::MultiprotocolExtensions => {
                if value.len() != 4 {
                    warn!(log, "bad multiprotocol capability length {}",
                        value.len(); "unit" => UNIT_CAPABILITIES);
                    continue;
                }
                let afi = u16::from_be_bytes([value[0], value[1]]);
                let safi = value[3];
                match Aid::from_afi_safi(afi, safi) {
                    Some(aid) => caps.mp[aid.index()] = true,
                    None => {
                        warn!(log, "unknown multiprotocol family \
                            afi {} safi {}", afi, safi;
                            "unit" => UNIT_CAPABILITIES);
                        caps.mp[0] = true;
                    }
                }
            }
            CapabilityCode::RouteRefresh => caps.refresh = true,
            CapabilityCode::ExtendedNextHopEncoding => {
                decode_ext_nh(value, caps, log);
            }
            CapabilityCode::BGPExtendedMessage => caps.ext_msg = true,
            CapabilityCode::BgpRole => {
                if value.len() != 1 {
                    warn!(log, "bad role capability length {}",
                        value.len(); "unit" => UNIT_CAPABILITIES);
                    continue;
                }
                if !ebgp {
                    warn!(log, "role capability on iBGP session ignored";
                        "unit" => UNIT_CAPABILITIES);
                    continue;
                }
                caps.policy = true;
                caps.role = Role::from_capa(value[0]);
            }
            CapabilityCode::GracefulRestart => {
                decode_graceful_restart(value, caps, log);
            }
            CapabilityCode::FourOctetAs => {
                if value.len() != 4 {
                    warn!(log, "bad 4-byte AS capability length {}",
                        value.len(); "unit" => UNIT_CAPABILITIES);
                    caps.as4byte = false;
                    continue;
                }
                let a = u32::from_be_bytes([
                    value[0], value[1], value[2], value[3],
                ]);
                if a == 0 {
                    return Err(DecodeError::ZeroAs);
                }
                caps.as4byte = true;
                asn = Some(a);
            }
            CapabilityCode::AddPath => decode_add_path(value, caps, log),
            CapabilityCode::EnhancedRouteRefresh => caps.enhanced_rr = true,
        }
    }

    Ok(asn)
}

fn decode_ext_nh(value: &[u8], caps: &mut Capabilities, log: &Logger) {
    if value.len() % 6 != 0 {
        warn!(log, "bad extended next hop capability length {}",
            value.len(); "unit" => UNIT_CAPABILITIES);
        caps.ext_nh = [false; AID_MAX];
        return;
    }
    for e in value.chunks_exact(6) {
        let afi = u16::from_be_bytes([e[0], e[1]]);
        let safi = u16::from_be_bytes([e[2], e[3]]);
        let nhafi = u16::from_be_bytes([e[4], e[5]]);
        let aid = u8::try_from(safi)
            .ok()
            .and_then(|safi| Aid::from_afi_safi(afi, safi));
        match aid {
            Some(a @ (Aid::Inet | Aid::VpnIpv4)) if nhafi == AFI_IPV6 => {
                caps.ext_nh[a.index()] = true;
            }
            _ => {
                warn!(log, "unsupported extended next hop afi {} safi {} \
                    nexthop afi {}", afi, safi, nhafi;
                    "unit" => UNIT_CAPABILITIES);
            }
        }
    }
}

fn decode_graceful_restart(
    value: &[u8],
    caps: &mut Capabilities,
    log: &Logger,
) {
    if value.len() == 2 {
        caps.grestart.restart = GrLevel::EndOfRib;
        caps.grestart.timeout = 0;
        return;
    }
    if value.len() % 4 != 2 {
        warn!(log, "bad graceful restart capability length {}",
            value.len(); "unit" => UNIT_CAPABILITIES);
        caps.grestart.restart = GrLevel::Off;
        return;
    }

    let hdr = u16::from_be_bytes([value[0], value[1]]);
    let timeout = hdr & GR_TIME_MASK;
    if timeout == 0 {
        warn!(log, "graceful restart capability with zero restart time";
            "unit" => UNIT_CAPABILITIES);
        caps.grestart.restart = GrLevel::Off;
        return;
    }
    caps.grestart.timeout = timeout;

    let mut entries = &value[2..];
    while let Ok((rest, (afi, safi, flags))) = family_entry(entries) {
        entries = rest;
        let Some(aid) = Aid::from_afi_safi(afi, safi) else {
            warn!(log, "graceful restart for unknown afi {} safi {}",
                afi, safi; "unit" => UNIT_CAPABILITIES);
            continue;
        };
        let f = &mut caps.grestart.flags[aid.index()];
        f.present = true;
        if flags & GR_FORWARD_FLAG != 0 {
            f.forward = true;
        }
        if hdr & GR_RESTART_FLAG != 0 {
            f.restart = true;
        }
        caps.grestart.restart = GrLevel::Full;
    }

    if hdr & GR_NOTIFICATION_FLAG != 0 {
        caps.grestart.grnotification = true;
    }
}

fn decode_add_path(value: &[u8], caps: &mut Capabilities, log: &Logger) {
    if value.len() % 4 != 0 {
        warn!(log, "bad add-path capability length {}", value.len();
            "unit" => UNIT_CAPABILITIES);
        caps.add_path = [AddPath::default(); AID_MAX];
        return;
    }
    let mut entries = value;
    while let Ok((rest, (afi, safi, flags))) = family_entry(entries) {
        entries = rest;
        let Some(aid) = Aid::from_afi_safi(afi, safi) else {
            warn!(log, "add-path for unknown afi {} safi {}", afi, safi;
                "unit" => UNIT_CAPABILITIES);
            caps.add_path = [AddPath::default(); AID_MAX];
            return;
        };
        if flags & !(ADD_PATH_RECV | ADD_PATH_SEND) != 0 {
            warn!(log, "add-path with bad flags {:#x}", flags;
                "unit" => UNIT_CAPABILITIES);
            caps.add_path = [AddPath::default(); AID_MAX];
            return;
        }
        caps.add_path[aid.index()] = AddPath {
            recv: flags & ADD_PATH_RECV != 0,
            send: flags & ADD_PATH_SEND != 0,
        };
    }
}

/// Reasons a negotiation refuses the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    /// The roles do not pair up, or a required role is missing.
    RoleMismatch,

    /// A required capability was not agreed. Carries the capability TLV
    /// reported to the peer.
    Unsupported(Vec<u8>),
}

impl NegotiationError {
    pub fn notification(&self) -> NotificationMessage {
        match self {
            Self::RoleMismatch => NotificationMessage::new(
                ErrorCode::Open,
                OpenErrorSubcode::RoleMismatch,
                Vec::new(),
            ),
            Self::Unsupported(tlv) => NotificationMessage::new(
                ErrorCode::Open,
                OpenErrorSubcode::UnsupportedCapability,
                tlv.clone(),
            ),
        }
    }
}

/// Result of [`negotiate`]. `flush` lists the families whose stale routes
/// must be flushed because the peer no longer preserves them; it is valid
/// even when `verdict` is an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiation {
    pub caps: Capabilities,
    pub flush: Vec<Aid>,
    pub verdict: Result<(), NegotiationError>,
}

fn unsupported(code: CapabilityCode, value: &[u8]) -> NegotiationError {
    let mut tlv = Vec::with_capacity(2 + value.len());
    put(&mut tlv, code, value);
    NegotiationError::Unsupported(tlv)
}

/// Compute the agreed capability set from what we announced and what the
/// peer sent. `prev` is the negotiated set of the previous session, whose
/// restarting families are carried over or flushed.
pub fn negotiate(
    ann: &AnnouncedCapabilities,
    peer: &Capabilities,
    prev: &Capabilities,
    ebgp: bool,
    local_role: Role,
) -> Negotiation {
    let mut neg = Capabilities {
        refresh: ann.refresh.enabled() && peer.refresh,
        enhanced_rr: ann.enhanced_rr.enabled() && peer.enhanced_rr,
        as4byte: ann.as4byte.enabled() && peer.as4byte,
        ext_msg: ann.ext_msg.enabled() && peer.ext_msg,
        ..Default::default()
    };

    let mut hasmp = peer.mp[0];
    for aid in Aid::ALL {
        let i = aid.index();
        neg.mp[i] = ann.mp[i].enabled() && peer.mp[i];
        if ann.mp[i].enabled() || peer.mp[i] {
            hasmp = true;
        }
    }
    if !hasmp {
        neg.mp[Aid::Inet.index()] = true;
    }

    let mut flush = Vec::new();
    for aid in Aid::ALL {
        let i = aid.index();
        let mut flags = peer.grestart.flags[i];
        if flags.present && !neg.mp[i] {
            flags = GrFlags::default();
        }
        neg.grestart.flags[i] = flags;
        if prev.grestart.flags[i].restarting {
            if ann.graceful_restart.enabled() && flags.forward {
                neg.grestart.flags[i].restarting = true;
            } else {
                flush.push(aid);
            }
        }
    }
    neg.grestart.timeout = peer.grestart.timeout;
    neg.grestart.restart = if ann.graceful_restart.enabled() {
        peer.grestart.restart
    } else {
        GrLevel::Off
    };
    neg.grestart.grnotification =
        ann.graceful_notification && peer.grestart.grnotification;

    for aid in Aid::ALL {
        let i = aid.index();
        neg.ext_nh[i] = neg.mp[i] && ann.ext_nh[i].enabled() && peer.ext_nh[i];
    }

    for aid in Aid::ALL {
        let i = aid.index();
        if !neg.mp[i] {
            continue;
        }
        if ann.add_path[i].recv.enabled() && peer.add_path[i].send {
            neg.add_path[i].recv = true;
            neg.add_path[0].recv = true;
        }
        if ann.add_path[i].send.enabled() && peer.add_path[i].recv {
            neg.add_path[i].send = true;
            neg.add_path[0].send = true;
        }
    }

    let verdict = check_role(ann, peer, ebgp, local_role, &mut neg)
        .and_then(|_| check_required(ann, &neg));

    Negotiation {
        caps: neg,
        flush,
        verdict,
    }
}

fn check_role(
    ann: &AnnouncedCapabilities,
    peer: &Capabilities,
    ebgp: bool,
    local_role: Role,
    neg: &mut Capabilities,
) -> Result<(), NegotiationError> {
    let announced = ann.role.enabled() && local_role != Role::None;
    if announced && peer.policy && ebgp {
        if local_role.counterpart() != peer.role {
            return Err(NegotiationError::RoleMismatch);
        }
        neg.policy = true;
        neg.role = peer.role;
    } else if announced && ann.role.required() && ebgp {
        return Err(NegotiationError::RoleMismatch);
    }
    Ok(())
}

fn check_required(
    ann: &AnnouncedCapabilities,
    neg: &Capabilities,
) -> Result<(), NegotiationError> {
    if ann.refresh.required() && !neg.refresh {
        return Err(unsupported(CapabilityCode::RouteRefresh, &[]));
    }
    if ann.ext_msg.required() && !neg.ext_msg {
        return Err(unsupported(CapabilityCode::BGPExtendedMessage, &[]));
    }
    if ann.enhanced_rr.required() && !neg.enhanced_rr {
        return Err(unsupported(CapabilityCode::EnhancedRouteRefresh, &[]));
    }
    if ann.as4byte.required() && !neg.as4byte {
        return Err(unsupported(CapabilityCode::FourOctetAs, &[0; 4]));
    }
    if ann.graceful_restart.required() && neg.grestart.restart == GrLevel::Off
    {
        return Err(unsupported(CapabilityCode::GracefulRestart, &[0; 2]));
    }
    for aid in Aid::ALL {
        let i = aid.index();
        if ann.mp[i].required() && !neg.mp[i] {
            return Err(unsupported(
                CapabilityCode::MultiprotocolExtensions,
                &afi_safi_value(aid),
            ));
        }
    }
    for aid in Aid::ALL {
        let i = aid.index();
        if !neg.mp[i] {
            continue;
        }
        let (afi, safi) = aid.afi_safi();
        let afi = afi.to_be_bytes();
        let entry = [afi[0], afi[1], safi, 0];
        if ann.add_path[i].recv.required() && !neg.add_path[i].recv {
            return Err(unsupported(CapabilityCode::AddPath, &entry));
        }
        if ann.add_path[i].send.required() && !neg.add_path[i].send {
            return Err(unsupported(CapabilityCode::AddPath, &entry));
        }
    }
    for aid in Aid::ALL {
        let i = aid.index();
        if !neg.mp[i] {
            continue;
        }
        if ann.ext_nh[i].required() && !neg.ext_nh[i] {
            let (afi, safi) = aid.afi_safi();
            let mut entry = afi.to_be_bytes().to_vec();
            entry.extend_from_slice(&u16::from(safi).to_be_bytes());
            entry.extend_from_slice(&AFI_IPV6.to_be_bytes());
            return Err(unsupported(
                CapabilityCode::ExtendedNextHopEncoding,
                &entry,
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use pretty_hex::*;

    fn log() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    fn received(buf: &[u8], ebgp: bool) -> Capabilities {
        let mut caps = Capabilities::default();
        decode(buf, &mut caps, ebgp, &log()).expect("decode capabilities");
        caps
    }

    #[test]
    fn encode_default() {
        let ann = AnnouncedCapabilities::default();
        let buf = encode(&ann, 65547, Role::None, true, &Capabilities::default());
        println!("buf: {}", buf.hex_dump());
        assert_eq!(
            buf,
            vec![
                2, 0, // route refresh
                64, 2, 0x80, 0x00, // graceful restart, R flag
                65, 4, 0x00, 0x01, 0x00, 0x0b, // 4-byte as
            ]
        );
    }

    #[test]
    fn encode_order_and_families() {
        let mut ann = AnnouncedCapabilities::default();
        ann.mp[Aid::Inet.index()] = CapaMode::On;
        ann.mp[Aid::Inet6.index()] = CapaMode::On;
        ann.ext_nh[Aid::Inet.index()] = CapaMode::On;
        ann.ext_msg = CapaMode::On;
        ann.add_path[Aid::Inet6.index()].recv = CapaMode::On;
        ann.enhanced_rr = CapaMode::On;
        ann.graceful_notification = true;
        ann.restart_time = 120;
        ann.gr_forwarding = true;

        let buf =
            encode(&ann, 65000, Role::Customer, true, &Capabilities::default());
        println!("buf: {}", buf.hex_dump());
        assert_eq!(
            buf,
            vec![
                1, 4, 0, 1, 0, 1, // mp ipv4 unicast
                1, 4, 0, 2, 0, 1, // mp ipv6 unicast
                2, 0, // route refresh
                5, 6, 0, 1, 0, 1, 0, 2, // extended next hop
                6, 0, // extended message
                9, 1, 3, // role customer
                64, 10, 0xc0, 120, // graceful restart R+N, 120s
                0, 1, 1, 0x80, // ipv4 unicast, forwarding
                0, 2, 1, 0x80, // ipv6 unicast, forwarding
                65, 4, 0, 0, 0xfd, 0xe8, // 4-byte as
                69, 4, 0, 2, 1, 1, // add-path ipv6 receive
                70, 0, // enhanced route refresh
            ]
        );
    }

    #[test]
    fn role_only_on_ebgp() {
        let ann = AnnouncedCapabilities::default();
        let buf =
            encode(&ann, 65000, Role::Provider, false, &Capabilities::default());
        assert!(!buf.windows(3).any(|w| w == [9, 1, 0]));
    }

    #[test]
    fn restart_flag_cleared_while_restarting() {
        let ann = AnnouncedCapabilities::default();
        let mut neg = Capabilities::default();
        neg.grestart.flags[Aid::Inet.index()].restarting = true;
        let buf = encode(&ann, 65000, Role::None, true, &neg);
        assert_eq!(&buf[2..6], &[64, 2, 0x00, 0x00]);
    }

    #[test]
    fn decode_unknown_and_malformed() {
        let caps = received(
            &[
                73, 3, b'f', b'o', b'o', // hostname, ignored
                1, 3, 0, 1, 1, // mp with bad length, skipped
                1, 4, 0, 2, 0, 1, // mp ipv6 unicast
                1, 4, 0, 9, 0, 9, // mp unknown family
                2, 0, // route refresh
            ],
            true,
        );
        assert!(caps.refresh);
        assert!(caps.mp[Aid::Inet6.index()]);
        assert!(!caps.mp[Aid::Inet.index()]);
        assert!(caps.mp[0]);
    }

    #[test]
    fn decode_truncated() {
        let mut caps = Capabilities::default();
        assert_eq!(
            decode(&[1, 4, 0, 1], &mut caps, true, &log()),
            Err(DecodeError::Truncated)
        );
        assert_eq!(
            decode(&[1], &mut caps, true, &log()),
            Err(DecodeError::Truncated)
        );
    }

    #[test]
    fn decode_as4() {
        let mut caps = Capabilities::default();
        assert_eq!(
            decode(&[65, 4, 0, 1, 0, 0], &mut caps, true, &log()),
            Ok(Some(65536))
        );
        assert!(caps.as4byte);

        let mut caps = Capabilities::default();
        assert_eq!(
            decode(&[65, 4, 0, 0, 0, 0], &mut caps, true, &log()),
            Err(DecodeError::ZeroAs)
        );

        let mut caps = Capabilities::default();
        assert_eq!(
            decode(&[65, 2, 0, 1], &mut caps, true, &log()),
            Ok(None)
        );
        assert!(!caps.as4byte);
    }

    #[test]
    fn decode_graceful_restart() {
        let caps = received(&[64, 2, 0x40, 0], true);
        assert_eq!(caps.grestart.restart, GrLevel::EndOfRib);
        assert!(!caps.grestart.grnotification);

        let caps = received(&[64, 6, 0xc0, 90, 0, 1, 1, 0x80], true);
        assert_eq!(caps.grestart.restart, GrLevel::Full);
        assert_eq!(caps.grestart.timeout, 90);
        assert!(caps.grestart.grnotification);
        assert_eq!(
            caps.grestart.flags[Aid::Inet.index()],
            GrFlags {
                present: true,
                forward: true,
                restart: true,
                restarting: false,
            }
        );

        let caps = received(&[64, 5, 0x00, 90, 0, 1, 1], true);
        assert_eq!(caps.grestart.restart, GrLevel::Off);

        let caps = received(&[64, 6, 0x80, 0, 0, 1, 1, 0x80], true);
        assert_eq!(caps.grestart.restart, GrLevel::Off);
    }

    #[test]
    fn decode_add_path_and_ext_nh() {
        let caps = received(&[69, 8, 0, 1, 1, 3, 0, 2, 1, 1], true);
        assert_eq!(
            caps.add_path[Aid::Inet.index()],
            AddPath {
                recv: true,
                send: true
            }
        );
        assert!(caps.add_path[Aid::Inet6.index()].recv);

        // undefined flags wipe everything
        let caps = received(&[69, 8, 0, 1, 1, 3, 0, 2, 1, 4], true);
        assert_eq!(caps.add_path, [AddPath::default(); AID_MAX]);

        let caps = received(&[5, 12, 0, 1, 0, 1, 0, 2, 0, 2, 0, 1, 0, 2], true);
        assert!(caps.ext_nh[Aid::Inet.index()]);
        assert!(!caps.ext_nh[Aid::Inet6.index()]);

        let caps = received(&[5, 5, 0, 1, 0, 1, 0], true);
        assert_eq!(caps.ext_nh, [false; AID_MAX]);
    }

    #[test]
    fn decode_role() {
        let caps = received(&[9, 1, 3], true);
        assert!(caps.policy);
        assert_eq!(caps.role, Role::Customer);

        let caps = received(&[9, 1, 3], false);
        assert!(!caps.policy);
    }

    #[test]
    fn negotiate_default_ipv4() {
        let ann = AnnouncedCapabilities::default();
        let n = negotiate(
            &ann,
            &Capabilities::default(),
            &Capabilities::default(),
            true,
            Role::None,
        );
        assert_eq!(n.verdict, Ok(()));
        assert_eq!(n.caps.families().collect::<Vec<_>>(), vec![Aid::Inet]);
        assert!(!n.caps.refresh);
        assert!(!n.caps.as4byte);
        assert!(n.flush.is_empty());
    }

    #[test]
    fn negotiate_required_ipv6() {
        let mut ann = AnnouncedCapabilities::default();
        ann.mp[Aid::Inet6.index()] = CapaMode::Required;
        let peer = received(&[1, 4, 0, 2, 0, 1], true);
        let n = negotiate(&ann, &peer, &Capabilities::default(), true, Role::None);
        assert_eq!(n.verdict, Ok(()));
        assert!(n.caps.mp[Aid::Inet6.index()]);
        assert!(!n.caps.mp[Aid::Inet.index()]);
    }

    #[test]
    fn negotiate_required_missing() {
        let mut ann = AnnouncedCapabilities::default();
        ann.mp[Aid::Inet6.index()] = CapaMode::Required;
        ann.as4byte = CapaMode::Required;
        let peer = received(&[1, 4, 0, 1, 0, 1], true);
        let n = negotiate(&ann, &peer, &Capabilities::default(), true, Role::None);
        // only the first failure in enforcement order is reported
        assert_eq!(
            n.verdict,
            Err(NegotiationError::Unsupported(vec![65, 4, 0, 0, 0, 0]))
        );

        ann.as4byte = CapaMode::On;
        let n = negotiate(&ann, &peer, &Capabilities::default(), true, Role::None);
        let err = n.verdict.expect_err("ipv6 is required");
        assert_eq!(err, NegotiationError::Unsupported(vec![1, 4, 0, 2, 0, 1]));
        let notification = err.notification();
        assert_eq!(notification.error_code, 2);
        assert_eq!(notification.error_subcode, 7);
    }

    #[test]
    fn negotiate_add_path_directions() {
        let mut ann = AnnouncedCapabilities::default();
        ann.add_path[Aid::Inet.index()] = AddPathMode {
            recv: CapaMode::On,
            send: CapaMode::On,
        };
        let peer = received(&[69, 4, 0, 1, 1, 2], true);
        let n = negotiate(&ann, &peer, &Capabilities::default(), true, Role::None);
        assert_eq!(
            n.caps.add_path[Aid::Inet.index()],
            AddPath {
                recv: true,
                send: false
            }
        );
        assert!(n.caps.add_path[0].recv);
        assert!(!n.caps.add_path[0].send);

        ann.add_path[Aid::Inet.index()].send = CapaMode::Required;
        let n = negotiate(&ann, &peer, &Capabilities::default(), true, Role::None);
        assert_eq!(
            n.verdict,
            Err(NegotiationError::Unsupported(vec![69, 4, 0, 1, 1, 0]))
        );
    }

    #[test]
    fn add_path_needs_multiprotocol() {
        let mut ann = AnnouncedCapabilities::default();
        ann.add_path[Aid::Inet6.index()].recv = CapaMode::Required;
        ann.ext_nh[Aid::Inet6.index()] = CapaMode::Required;

        // add-path send for IPv6 unicast, but no multiprotocol for it
        let peer = received(&[69, 4, 0, 2, 1, 2], true);
        let n = negotiate(&ann, &peer, &Capabilities::default(), true, Role::None);
        assert!(!n.caps.mp[Aid::Inet6.index()]);
        assert_eq!(n.caps.add_path[Aid::Inet6.index()], AddPath::default());
        assert_eq!(n.caps.add_path[0], AddPath::default());
        assert_eq!(n.verdict, Ok(()));
    }

    #[test]
    fn negotiate_roles() {
        let ann = AnnouncedCapabilities::default();
        let peer = received(&[9, 1, 0], true);
        let n = negotiate(&ann, &peer, &Capabilities::default(), true, Role::Customer);
        assert_eq!(n.verdict, Ok(()));
        assert!(n.caps.policy);
        assert_eq!(n.caps.role, Role::Provider);

        let n = negotiate(&ann, &peer, &Capabilities::default(), true, Role::Peer);
        assert_eq!(n.verdict, Err(NegotiationError::RoleMismatch));
        assert_eq!(n.verdict.expect_err("mismatch").notification().error_subcode, 11);

        let mut strict = AnnouncedCapabilities::default();
        strict.role = CapaMode::Required;
        let n = negotiate(
            &strict,
            &Capabilities::default(),
            &Capabilities::default(),
            true,
            Role::Peer,
        );
        assert_eq!(n.verdict, Err(NegotiationError::RoleMismatch));

        // roles play no part on iBGP sessions
        let n = negotiate(
            &strict,
            &Capabilities::default(),
            &Capabilities::default(),
            false,
            Role::Peer,
        );
        assert_eq!(n.verdict, Ok(()));
    }

    #[test]
    fn negotiate_graceful_restart_families() {
        let ann = AnnouncedCapabilities::default();
        // peer lists ipv4 and ipv6 for graceful restart but only ipv4 is
        // negotiated for multiprotocol
        let peer = received(
            &[
                64, 10, 0x00, 120, 0, 1, 1, 0x80, 0, 2, 1, 0x80, //
            ],
            true,
        );
        let mut prev = Capabilities::default();
        prev.grestart.flags[Aid::Inet.index()].restarting = true;
        prev.grestart.flags[Aid::Inet6.index()].restarting = true;

        let n = negotiate(&ann, &peer, &prev, true, Role::None);
        assert_eq!(n.verdict, Ok(()));
        assert_eq!(n.caps.grestart.restart, GrLevel::Full);
        assert!(n.caps.grestart.flags[Aid::Inet.index()].present);
        assert!(n.caps.grestart.flags[Aid::Inet.index()].restarting);
        assert!(!n.caps.grestart.flags[Aid::Inet6.index()].present);
        assert_eq!(n.flush, vec![Aid::Inet6]);
    }

    #[test]
    fn negotiate_graceful_restart_required() {
        let mut ann = AnnouncedCapabilities::default();
        ann.graceful_restart = CapaMode::Required;
        let n = negotiate(
            &ann,
            &Capabilities::default(),
            &Capabilities::default(),
            true,
            Role::None,
        );
        assert_eq!(
            n.verdict,
            Err(NegotiationError::Unsupported(vec![64, 2, 0, 0]))
        );
    }

    /// The negotiated result of talking to a speaker that announces exactly
    /// what we announce.
    fn mirrored(ann: &AnnouncedCapabilities) -> Negotiation {
        let buf = encode(ann, 4200000000, Role::None, true, &Capabilities::default());
        let mut peer = Capabilities::default();
        let asn = decode(&buf, &mut peer, true, &log()).expect("decode");
        assert_eq!(asn.is_some(), ann.as4byte.enabled());
        negotiate(ann, &peer, &Capabilities::default(), true, Role::None)
    }

    #[test]
    fn mirrored_negotiation() {
        let mut ann = AnnouncedCapabilities::default();
        ann.mp[Aid::Inet.index()] = CapaMode::Required;
        ann.mp[Aid::VpnIpv6.index()] = CapaMode::On;
        ann.ext_msg = CapaMode::Required;
        ann.enhanced_rr = CapaMode::On;
        ann.ext_nh[Aid::Inet.index()] = CapaMode::On;
        ann.add_path[Aid::Inet.index()] = AddPathMode {
            recv: CapaMode::On,
            send: CapaMode::Required,
        };
        ann.graceful_notification = true;
        ann.restart_time = 90;

        let n = mirrored(&ann);
        assert_eq!(n.verdict, Ok(()));
        let caps = n.caps;
        assert_eq!(
            caps.families().collect::<Vec<_>>(),
            vec![Aid::Inet, Aid::VpnIpv6]
        );
        assert!(caps.refresh);
        assert!(caps.enhanced_rr);
        assert!(caps.as4byte);
        assert!(caps.ext_msg);
        assert!(caps.ext_nh[Aid::Inet.index()]);
        assert_eq!(
            caps.add_path[Aid::Inet.index()],
            AddPath {
                recv: true,
                send: true
            }
        );
        assert_eq!(caps.grestart.restart, GrLevel::Full);
        assert_eq!(caps.grestart.timeout, 90);
        assert!(caps.grestart.grnotification);
        assert!(caps.grestart.flags[Aid::VpnIpv6.index()].present);

        let n = mirrored(&AnnouncedCapabilities::default());
        assert_eq!(n.verdict, Ok(()));
        assert_eq!(n.caps.families().collect::<Vec<_>>(), vec![Aid::Inet]);
        assert_eq!(n.caps.grestart.restart, GrLevel::EndOfRib);
    }
}
