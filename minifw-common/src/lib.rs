#![cfg_attr(not(test), no_std)]

//! Types shared between the minifw TC classifiers and the userspace daemon.
//!
//! Everything in here must stay usable from `bpfel-unknown-none`: no
//! allocation, no formatting, plain `#[repr(C)]` layouts.  The matcher lives
//! here too so the kernel and userspace evaluate rules with the same code.

use core::hash::{Hash, Hasher};

/// Size of one rule bank in the `RULES` map.  The map holds two banks.
pub const MAX_RULES: u32 = 256;

/// Name of the `Array<Rule>` map holding both rule banks.
pub const RULES_MAP: &str = "RULES";

/// Name of the single-entry `Array<u64>` map holding the ruleset header.
pub const RULESET_MAP: &str = "RULESET";

/// Wildcard protocol.
pub const PROTO_ANY: u8 = 0;
pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;

/// Traffic direction a rule applies to.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "user",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "lowercase")
)]
pub enum Direction {
    Outbound = 0,
    Inbound = 1,
}

impl Direction {
    /// Strict conversion from the wire value.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Outbound),
            1 => Some(Self::Inbound),
            _ => None,
        }
    }
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "user",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "lowercase")
)]
pub enum IpVersion {
    V4 = 4,
    V6 = 6,
}

impl IpVersion {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            4 => Some(Self::V4),
            6 => Some(Self::V6),
            _ => None,
        }
    }
}

/// Interception point in the packet path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "user",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "lowercase")
)]
pub enum Hook {
    /// Before the packet is handed to routing/delivery (TC ingress).
    Ingress,
    /// After routing, before transmission (TC egress).
    Egress,
}

/// Which rules each interception point carries.
pub const HOOK_DIRECTIONS: [(Hook, Direction); 2] = [
    (Hook::Ingress, Direction::Inbound),
    (Hook::Egress, Direction::Outbound),
];

impl Hook {
    #[inline(always)]
    pub fn direction(self) -> Direction {
        let mut i = 0;
        while i < HOOK_DIRECTIONS.len() {
            if HOOK_DIRECTIONS[i].0 as u8 == self as u8 {
                return HOOK_DIRECTIONS[i].1;
            }
            i += 1;
        }
        // Unreachable while the table covers every variant.
        Direction::Inbound
    }
}

/// Outcome of evaluating one packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(
    feature = "user",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "lowercase")
)]
pub enum Verdict {
    Accept,
    Drop,
}

/// A deny rule, as stored in the userspace rule store and in the `RULES` map.
///
/// Addresses and masks are 16-byte slots in network byte order.  IPv4 values
/// occupy the first four bytes of a slot; the rest stays zero.  Ports are in
/// host byte order.  A zero port or protocol is a wildcard.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct Rule {
    /// 1 = inbound, 0 = outbound.
    pub direction: u8,
    /// 4 or 6.
    pub ip_version: u8,
    /// 0 = any, 6 = TCP, 17 = UDP.
    pub protocol: u8,
    pub _pad: u8,
    pub src_port: u16,
    pub dst_port: u16,
    pub src_addr: [u8; 16],
    pub src_mask: [u8; 16],
    pub dst_addr: [u8; 16],
    pub dst_mask: [u8; 16],
}

#[cfg(feature = "user")]
unsafe impl aya::Pod for Rule {}

impl Rule {
    /// A rule matching every packet of `ip_version` in `direction`.
    pub fn new(direction: Direction, ip_version: IpVersion) -> Self {
        Self {
            direction: direction as u8,
            ip_version: ip_version as u8,
            ..Self::default()
        }
    }

    /// Source address and mask, both IPv4 in host order.
    pub fn with_source_v4(mut self, addr: u32, mask: u32) -> Self {
        self.src_addr = v4_slot(addr);
        self.src_mask = v4_slot(mask);
        self
    }

    pub fn with_destination_v4(mut self, addr: u32, mask: u32) -> Self {
        self.dst_addr = v4_slot(addr);
        self.dst_mask = v4_slot(mask);
        self
    }

    pub fn with_source_v6(mut self, addr: [u8; 16], mask: [u8; 16]) -> Self {
        self.src_addr = addr;
        self.src_mask = mask;
        self
    }

    pub fn with_destination_v6(mut self, addr: [u8; 16], mask: [u8; 16]) -> Self {
        self.dst_addr = addr;
        self.dst_mask = mask;
        self
    }

    pub fn with_ports(mut self, src_port: u16, dst_port: u16) -> Self {
        self.src_port = src_port;
        self.dst_port = dst_port;
        self
    }

    pub fn with_protocol(mut self, protocol: u8) -> Self {
        self.protocol = protocol;
        self
    }

    /// Any non-zero direction byte counts as inbound.
    #[inline(always)]
    pub fn direction(&self) -> Direction {
        if self.direction == 0 {
            Direction::Outbound
        } else {
            Direction::Inbound
        }
    }

    pub fn ip_version(&self) -> Option<IpVersion> {
        IpVersion::from_u8(self.ip_version)
    }

    /// Whether this rule matches `packet`.
    ///
    /// Rules never match across IP versions.  IPv6 rules are kept in the
    /// data model but do not match anything yet.
    #[inline(always)]
    pub fn matches(&self, packet: &PacketKey) -> bool {
        if self.ip_version != packet.ip_version || self.ip_version != IpVersion::V4 as u8 {
            return false;
        }
        if self.protocol != PROTO_ANY && self.protocol != packet.protocol {
            return false;
        }

        let src_mask = slot_v4(&self.src_mask);
        if slot_v4(&self.src_addr) & src_mask != slot_v4(&packet.src_addr) & src_mask {
            return false;
        }
        let dst_mask = slot_v4(&self.dst_mask);
        if slot_v4(&self.dst_addr) & dst_mask != slot_v4(&packet.dst_addr) & dst_mask {
            return false;
        }

        if self.src_port != 0 && self.src_port != packet.src_port {
            return false;
        }
        if self.dst_port != 0 && self.dst_port != packet.dst_port {
            return false;
        }
        true
    }
}

// Equality covers the semantic fields only; `_pad` is layout filler.
impl PartialEq for Rule {
    fn eq(&self, other: &Self) -> bool {
        self.direction == other.direction
            && self.ip_version == other.ip_version
            && self.protocol == other.protocol
            && self.src_port == other.src_port
            && self.dst_port == other.dst_port
            && self.src_addr == other.src_addr
            && self.src_mask == other.src_mask
            && self.dst_addr == other.dst_addr
            && self.dst_mask == other.dst_mask
    }
}

impl Eq for Rule {}

impl Hash for Rule {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.direction.hash(state);
        self.ip_version.hash(state);
        self.protocol.hash(state);
        self.src_port.hash(state);
        self.dst_port.hash(state);
        self.src_addr.hash(state);
        self.src_mask.hash(state);
        self.dst_addr.hash(state);
        self.dst_mask.hash(state);
    }
}

/// The fields of a packet the matcher looks at.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PacketKey {
    pub ip_version: u8,
    pub protocol: u8,
    /// Zero unless the protocol is TCP or UDP.
    pub src_port: u16,
    pub dst_port: u16,
    pub src_addr: [u8; 16],
    pub dst_addr: [u8; 16],
}

impl PacketKey {
    /// IPv4 packet; addresses in host order.
    #[inline(always)]
    pub fn v4(src_addr: u32, dst_addr: u32, protocol: u8, src_port: u16, dst_port: u16) -> Self {
        let (src_port, dst_port) = transport_ports(protocol, src_port, dst_port);
        Self {
            ip_version: IpVersion::V4 as u8,
            protocol,
            src_port,
            dst_port,
            src_addr: v4_slot(src_addr),
            dst_addr: v4_slot(dst_addr),
        }
    }

    pub fn v6(
        src_addr: [u8; 16],
        dst_addr: [u8; 16],
        protocol: u8,
        src_port: u16,
        dst_port: u16,
    ) -> Self {
        let (src_port, dst_port) = transport_ports(protocol, src_port, dst_port);
        Self {
            ip_version: IpVersion::V6 as u8,
            protocol,
            src_port,
            dst_port,
            src_addr,
            dst_addr,
        }
    }
}

#[inline(always)]
fn transport_ports(protocol: u8, src_port: u16, dst_port: u16) -> (u16, u16) {
    match protocol {
        PROTO_TCP | PROTO_UDP => (src_port, dst_port),
        _ => (0, 0),
    }
}

/// Places a host-order IPv4 value in a 16-byte address slot.
#[inline(always)]
pub fn v4_slot(addr: u32) -> [u8; 16] {
    let b = addr.to_be_bytes();
    [b[0], b[1], b[2], b[3], 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]
}

/// Reads the IPv4 value (host order) out of a 16-byte address slot.
#[inline(always)]
pub fn slot_v4(slot: &[u8; 16]) -> u32 {
    u32::from_be_bytes([slot[0], slot[1], slot[2], slot[3]])
}

/// How many times a classifier restarts a walk that raced with a sync.
pub const WALK_RETRIES: u32 = 4;

/// Packs a sync generation and its rule count into the `RULESET` word.
///
/// Generation `g` lives in bank `g & 1`. Userspace fills the idle bank and
/// then publishes this word with the next generation.
pub fn ruleset_header(generation: u32, len: u32) -> u64 {
    ((generation as u64) << 32) | len as u64
}

/// Splits a `RULESET` word into `(generation, len)`.
#[inline(always)]
pub fn split_ruleset_header(header: u64) -> (u32, u32) {
    ((header >> 32) as u32, header as u32)
}

/// Bank holding the rules of `generation`.
#[inline(always)]
pub fn bank_of(generation: u32) -> u32 {
    generation & 1
}

/// First `RULES` index of `bank`.
#[inline(always)]
pub fn bank_offset(bank: u32) -> u32 {
    (bank & 1) * MAX_RULES
}

/// Runs `walk(base, len)` over the published bank and keeps its result only
/// if the header is unchanged afterwards.
///
/// A changed header means a sync landed mid-walk and the bank may have been
/// rewritten, so the walk starts over. Returns `None` once [`WALK_RETRIES`]
/// walks have all raced.
#[inline(always)]
pub fn walk_ruleset<T, H, W>(mut read_header: H, mut walk: W) -> Option<T>
where
    H: FnMut() -> u64,
    W: FnMut(u32, u32) -> T,
{
    let mut attempt = 0;
    while attempt < WALK_RETRIES {
        let header = read_header();
        let (generation, len) = split_ruleset_header(header);
        let len = if len > MAX_RULES { MAX_RULES } else { len };
        let result = walk(bank_offset(bank_of(generation)), len);
        if read_header() == header {
            return Some(result);
        }
        attempt += 1;
    }
    None
}
