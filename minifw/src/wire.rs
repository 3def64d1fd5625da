//! Fixed-size binary encoding of control messages and rule records.
//!
//! Rule record, 71 bytes, integers big-endian:
//!
//! ```text
//! direction u8 | ip_version u8 | src_addr [16] | src_mask [16] | src_port u16
//!              | dst_addr [16] | dst_mask [16] | dst_port u16   | protocol u8
//! ```
//!
//! A control message is a mode byte followed by one rule record.  The record
//! is still present (and ignored) for View.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use minifw_common::{Direction, IpVersion, Rule, PROTO_ANY, PROTO_TCP, PROTO_UDP};

use crate::control::ControlError;

pub const RULE_RECORD_LEN: usize = 2 + 4 * 16 + 2 * 2 + 1;
pub const CONTROL_MESSAGE_LEN: usize = 1 + RULE_RECORD_LEN;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Add = 1,
    Remove = 2,
    View = 3,
}

impl TryFrom<u8> for Mode {
    type Error = ControlError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Mode::Add),
            2 => Ok(Mode::Remove),
            3 => Ok(Mode::View),
            other => Err(ControlError::InvalidMode(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    Add(Rule),
    Remove(Rule),
    View,
}

impl ControlMessage {
    pub fn mode(&self) -> Mode {
        match self {
            ControlMessage::Add(_) => Mode::Add,
            ControlMessage::Remove(_) => Mode::Remove,
            ControlMessage::View => Mode::View,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(CONTROL_MESSAGE_LEN);
        buf.put_u8(self.mode() as u8);
        match self {
            ControlMessage::Add(rule) | ControlMessage::Remove(rule) => put_rule(&mut buf, rule),
            ControlMessage::View => buf.put_bytes(0, RULE_RECORD_LEN),
        }
        buf.freeze()
    }

    /// Decodes one message.  Anything but exactly [`CONTROL_MESSAGE_LEN`]
    /// bytes is malformed.
    pub fn decode(bytes: &[u8]) -> Result<Self, ControlError> {
        if bytes.len() != CONTROL_MESSAGE_LEN {
            return Err(ControlError::MalformedMessage(format!(
                "expected {} bytes, got {}",
                CONTROL_MESSAGE_LEN,
                bytes.len()
            )));
        }

        let mut buf = bytes;
        match Mode::try_from(buf.get_u8())? {
            Mode::Add => Ok(ControlMessage::Add(get_rule(&mut buf)?)),
            Mode::Remove => Ok(ControlMessage::Remove(get_rule(&mut buf)?)),
            Mode::View => Ok(ControlMessage::View),
        }
    }
}

pub fn put_rule<B: BufMut>(buf: &mut B, rule: &Rule) {
    buf.put_u8(rule.direction);
    buf.put_u8(rule.ip_version);
    buf.put_slice(&rule.src_addr);
    buf.put_slice(&rule.src_mask);
    buf.put_u16(rule.src_port);
    buf.put_slice(&rule.dst_addr);
    buf.put_slice(&rule.dst_mask);
    buf.put_u16(rule.dst_port);
    buf.put_u8(rule.protocol);
}

/// Reads and validates one rule record.
pub fn get_rule<B: Buf>(buf: &mut B) -> Result<Rule, ControlError> {
    if buf.remaining() < RULE_RECORD_LEN {
        return Err(malformed(format!(
            "rule record needs {} bytes, {} left",
            RULE_RECORD_LEN,
            buf.remaining()
        )));
    }

    let direction = buf.get_u8();
    let ip_version = buf.get_u8();
    let src_addr = get_slot(buf);
    let src_mask = get_slot(buf);
    let src_port = buf.get_u16();
    let dst_addr = get_slot(buf);
    let dst_mask = get_slot(buf);
    let dst_port = buf.get_u16();
    let protocol = buf.get_u8();

    if Direction::from_u8(direction).is_none() {
        return Err(malformed(format!("invalid direction {direction}")));
    }
    let version = IpVersion::from_u8(ip_version)
        .ok_or_else(|| malformed(format!("invalid ip version {ip_version}")))?;
    if !matches!(protocol, PROTO_ANY | PROTO_TCP | PROTO_UDP) {
        return Err(malformed(format!("unsupported protocol {protocol}")));
    }
    if version == IpVersion::V4 {
        for (name, slot) in [
            ("source address", &src_addr),
            ("source mask", &src_mask),
            ("destination address", &dst_addr),
            ("destination mask", &dst_mask),
        ] {
            if slot[4..].iter().any(|&b| b != 0) {
                return Err(malformed(format!("{name} is wider than IPv4")));
            }
        }
    }

    Ok(Rule {
        direction,
        ip_version,
        protocol,
        _pad: 0,
        src_port,
        dst_port,
        src_addr,
        src_mask,
        dst_addr,
        dst_mask,
    })
}

pub fn encode_rule(rule: &Rule) -> Bytes {
    let mut buf = BytesMut::with_capacity(RULE_RECORD_LEN);
    put_rule(&mut buf, rule);
    buf.freeze()
}

fn get_slot<B: Buf>(buf: &mut B) -> [u8; 16] {
    let mut slot = [0u8; 16];
    buf.copy_to_slice(&mut slot);
    slot
}

fn malformed(reason: String) -> ControlError {
    ControlError::MalformedMessage(reason)
}
