#![no_std]
#![no_main]

use aya_ebpf::{
    bindings::{TC_ACT_PIPE, TC_ACT_SHOT},
    macros::{classifier, map},
    maps::Array,
    programs::TcContext,
};
use core::ptr;
use minifw_common::{walk_ruleset, Hook, PacketKey, Rule, MAX_RULES, PROTO_TCP, PROTO_UDP};
use network_types::{
    eth::{EthHdr, EtherType},
    ip::{IpProto, Ipv4Hdr},
    tcp::TcpHdr,
    udp::UdpHdr,
};

#[no_mangle]
#[link_section = "license"]
pub static _license: [u8; 4] = *b"GPL\0";

/// Two banks of `MAX_RULES` entries; userspace fills the idle bank and then
/// publishes the next generation in `RULESET`.
#[map]
static RULES: Array<Rule> = Array::with_max_entries(2 * MAX_RULES, 0);

/// Entry 0: `(generation << 32) | len`; the generation's low bit picks the bank.
#[map]
static RULESET: Array<u64> = Array::with_max_entries(1, 0);

#[classifier]
pub fn minifw_ingress(ctx: TcContext) -> i32 {
    filter(&ctx, Hook::Ingress)
}

#[classifier]
pub fn minifw_egress(ctx: TcContext) -> i32 {
    filter(&ctx, Hook::Egress)
}

/// Drops the packet when the first applicable rule matches, otherwise lets it
/// through.  Anything that cannot be parsed passes untouched, and so does a
/// packet whose walks kept racing with rule updates.
#[inline(always)]
fn filter(ctx: &TcContext, hook: Hook) -> i32 {
    let key = match packet_key(ctx) {
        Some(key) => key,
        None => return TC_ACT_PIPE,
    };
    let direction = hook.direction();

    let read_header = || match RULESET.get(0) {
        Some(header) => unsafe { ptr::read_volatile(header) },
        None => 0,
    };
    let walk = |base: u32, len: u32| {
        for i in 0..MAX_RULES {
            if i >= len {
                break;
            }
            let rule = match RULES.get(base + i) {
                Some(rule) => rule,
                None => break,
            };
            if rule.direction() == direction && rule.matches(&key) {
                return true;
            }
        }
        false
    };

    match walk_ruleset(read_header, walk) {
        Some(true) => TC_ACT_SHOT,
        _ => TC_ACT_PIPE,
    }
}

#[inline(always)]
fn packet_key(ctx: &TcContext) -> Option<PacketKey> {
    // -- Ethernet ----------------------------------------------------------
    let data = ctx.data();
    let data_end = ctx.data_end();

    let eth_end = data + EthHdr::LEN;
    if eth_end > data_end {
        return None;
    }
    let eth_hdr = data as *const EthHdr;
    let ether_type = unsafe { ptr::read_unaligned(ptr::addr_of!((*eth_hdr).ether_type)) };
    if ether_type != EtherType::Ipv4 {
        return None;
    }

    // -- IPv4 --------------------------------------------------------------
    let ip_start = eth_end;
    if ip_start + Ipv4Hdr::LEN > data_end {
        return None;
    }
    let ip_hdr = ip_start as *const Ipv4Hdr;
    let version_ihl = unsafe { ptr::read_unaligned(ip_start as *const u8) };
    let ihl = ((version_ihl & 0x0f) as usize) * 4;
    if ihl < Ipv4Hdr::LEN {
        return None;
    }
    let proto = unsafe { ptr::read_unaligned(ptr::addr_of!((*ip_hdr).proto)) };
    let src_addr = u32::from_be(unsafe { ptr::read_unaligned(ptr::addr_of!((*ip_hdr).src_addr)) });
    let dst_addr = u32::from_be(unsafe { ptr::read_unaligned(ptr::addr_of!((*ip_hdr).dst_addr)) });

    // -- Transport ---------------------------------------------------------
    let transport_start = ip_start + ihl;
    let (protocol, src_port, dst_port) = match proto {
        IpProto::Tcp => {
            if transport_start + TcpHdr::LEN > data_end {
                return None;
            }
            let tcp_hdr = transport_start as *const TcpHdr;
            (
                PROTO_TCP,
                u16::from_be(unsafe { ptr::read_unaligned(ptr::addr_of!((*tcp_hdr).source)) }),
                u16::from_be(unsafe { ptr::read_unaligned(ptr::addr_of!((*tcp_hdr).dest)) }),
            )
        }
        IpProto::Udp => {
            if transport_start + UdpHdr::LEN > data_end {
                return None;
            }
            let udp_hdr = transport_start as *const UdpHdr;
            (
                PROTO_UDP,
                u16::from_be(unsafe { ptr::read_unaligned(ptr::addr_of!((*udp_hdr).source)) }),
                u16::from_be(unsafe { ptr::read_unaligned(ptr::addr_of!((*udp_hdr).dest)) }),
            )
        }
        other => (other as u8, 0, 0),
    };

    Some(PacketKey::v4(src_addr, dst_addr, protocol, src_port, dst_port))
}

#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}
