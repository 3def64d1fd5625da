use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use minifw_common::{
    slot_v4, Direction, IpVersion, PacketKey, Rule, PROTO_ANY, PROTO_TCP, PROTO_UDP,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RuleSpecError {
    #[error("{field} {addr} does not match ip version {version:?}")]
    AddressFamily {
        field: &'static str,
        addr: IpAddr,
        version: IpVersion,
    },
    #[error("unsupported protocol {0} (expected 0, 6 or 17)")]
    Protocol(u8),
    #[error("stored rule has unknown ip version {0}")]
    UnknownIpVersion(u8),
    #[error("source and destination address families differ")]
    MixedFamilies,
}

/// A rule in readable form, as used by the YAML config, the admin API and
/// `mf`.  Missing addresses and masks default to the all-zero value, which
/// matches everything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSpec {
    pub direction: Direction,
    #[serde(default = "default_ip_version")]
    pub ip_version: IpVersion,
    #[serde(default)]
    pub src_addr: Option<IpAddr>,
    #[serde(default)]
    pub src_mask: Option<IpAddr>,
    #[serde(default)]
    pub src_port: u16,
    #[serde(default)]
    pub dst_addr: Option<IpAddr>,
    #[serde(default)]
    pub dst_mask: Option<IpAddr>,
    #[serde(default)]
    pub dst_port: u16,
    #[serde(default)]
    pub protocol: u8,
}

fn default_ip_version() -> IpVersion {
    IpVersion::V4
}

impl RuleSpec {
    pub fn new(direction: Direction, ip_version: IpVersion) -> Self {
        Self {
            direction,
            ip_version,
            src_addr: None,
            src_mask: None,
            src_port: 0,
            dst_addr: None,
            dst_mask: None,
            dst_port: 0,
            protocol: PROTO_ANY,
        }
    }

    pub fn to_rule(&self) -> Result<Rule, RuleSpecError> {
        if !matches!(self.protocol, PROTO_ANY | PROTO_TCP | PROTO_UDP) {
            return Err(RuleSpecError::Protocol(self.protocol));
        }

        let version = self.ip_version;
        let slot = |field: &'static str, addr: Option<IpAddr>| -> Result<[u8; 16], RuleSpecError> {
            match (version, addr) {
                (_, None) => Ok([0; 16]),
                (IpVersion::V4, Some(IpAddr::V4(v4))) => Ok(minifw_common::v4_slot(u32::from(v4))),
                (IpVersion::V6, Some(IpAddr::V6(v6))) => Ok(v6.octets()),
                (_, Some(addr)) => Err(RuleSpecError::AddressFamily { field, addr, version }),
            }
        };

        let mut rule = Rule::new(self.direction, version)
            .with_ports(self.src_port, self.dst_port)
            .with_protocol(self.protocol);
        rule.src_addr = slot("source address", self.src_addr)?;
        rule.src_mask = slot("source mask", self.src_mask)?;
        rule.dst_addr = slot("destination address", self.dst_addr)?;
        rule.dst_mask = slot("destination mask", self.dst_mask)?;
        Ok(rule)
    }
}

impl TryFrom<&Rule> for RuleSpec {
    type Error = RuleSpecError;

    fn try_from(rule: &Rule) -> Result<Self, Self::Error> {
        let version = rule
            .ip_version()
            .ok_or(RuleSpecError::UnknownIpVersion(rule.ip_version))?;
        let addr = |slot: &[u8; 16]| -> IpAddr {
            match version {
                IpVersion::V4 => IpAddr::V4(Ipv4Addr::from(slot_v4(slot))),
                IpVersion::V6 => IpAddr::V6(Ipv6Addr::from(*slot)),
            }
        };

        Ok(Self {
            direction: rule.direction(),
            ip_version: version,
            src_addr: Some(addr(&rule.src_addr)),
            src_mask: Some(addr(&rule.src_mask)),
            src_port: rule.src_port,
            dst_addr: Some(addr(&rule.dst_addr)),
            dst_mask: Some(addr(&rule.dst_mask)),
            dst_port: rule.dst_port,
            protocol: rule.protocol,
        })
    }
}

/// A packet described by its header fields, for "what would happen" checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketSpec {
    pub src_addr: IpAddr,
    pub dst_addr: IpAddr,
    #[serde(default)]
    pub src_port: u16,
    #[serde(default)]
    pub dst_port: u16,
    #[serde(default)]
    pub protocol: u8,
}

impl PacketSpec {
    pub fn to_key(&self) -> Result<PacketKey, RuleSpecError> {
        match (self.src_addr, self.dst_addr) {
            (IpAddr::V4(src), IpAddr::V4(dst)) => Ok(PacketKey::v4(
                u32::from(src),
                u32::from(dst),
                self.protocol,
                self.src_port,
                self.dst_port,
            )),
            (IpAddr::V6(src), IpAddr::V6(dst)) => Ok(PacketKey::v6(
                src.octets(),
                dst.octets(),
                self.protocol,
                self.src_port,
                self.dst_port,
            )),
            _ => Err(RuleSpecError::MixedFamilies),
        }
    }
}

/// One line of the `mf --view` table.
pub struct RuleRow<'a>(pub &'a RuleSpec);

impl RuleRow<'_> {
    pub const HEADER: &'static str = concat!(
        "I/O  S_IP             S_Mask           S_Port  ",
        "D_IP             D_Mask           D_Port  Proto"
    );
}

impl fmt::Display for RuleRow<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let spec = self.0;
        let unspecified = match spec.ip_version {
            IpVersion::V4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpVersion::V6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        let show = |addr: Option<IpAddr>| addr.unwrap_or(unspecified).to_string();
        let io = match spec.direction {
            Direction::Inbound => "In",
            Direction::Outbound => "Out",
        };
        write!(
            f,
            "{:<4} {:<16} {:<16} {:<7} {:<16} {:<16} {:<7} {}",
            io,
            show(spec.src_addr),
            show(spec.src_mask),
            spec.src_port,
            show(spec.dst_addr),
            show(spec.dst_mask),
            spec.dst_port,
            spec.protocol
        )
    }
}
