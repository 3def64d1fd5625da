//! `mf`: command-line controller for a running minifw daemon.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{bail, Context as _};
use clap::{ArgGroup, Parser};
use ipnet::IpNet;

use minifw::client::ControlClient;
use minifw::hook::{first_match, Hook};
use minifw::rule::{PacketSpec, RuleRow, RuleSpec};
use minifw_common::{Direction, IpVersion, Rule, PROTO_ANY, PROTO_TCP, PROTO_UDP};

#[derive(Parser, Debug)]
#[command(version, about = "Add, remove and list minifw rules", long_about = None)]
#[command(group(ArgGroup::new("mode").required(true).args(["add", "remove", "view", "check"])))]
#[command(group(ArgGroup::new("direction").args(["inbound", "outbound"])))]
#[command(group(ArgGroup::new("family").args(["v4", "v6"])))]
struct Args {
    /// Match packets arriving on the interface.
    #[arg(short = 'i', long = "in")]
    inbound: bool,

    /// Match packets leaving the interface.
    #[arg(short = 'o', long = "out")]
    outbound: bool,

    /// IPv4 rule (default unless an address is IPv6).
    #[arg(long)]
    v4: bool,

    /// IPv6 rule.
    #[arg(long)]
    v6: bool,

    /// Source address, optionally in CIDR form (10.0.0.0/8).
    #[arg(short = 's', long = "s-ip")]
    src_ip: Option<Addr>,

    /// Source mask.
    #[arg(short = 'm', long = "s-mask")]
    src_mask: Option<IpAddr>,

    /// Source port (0 = any).
    #[arg(short = 'p', long = "s-port", default_value_t = 0)]
    src_port: u16,

    /// Destination address, optionally in CIDR form.
    #[arg(short = 'd', long = "d-ip")]
    dst_ip: Option<Addr>,

    /// Destination mask.
    #[arg(short = 'n', long = "d-mask")]
    dst_mask: Option<IpAddr>,

    /// Destination port (0 = any).
    #[arg(short = 'q', long = "d-port", default_value_t = 0)]
    dst_port: u16,

    /// Protocol: 0/any, 6/tcp or 17/udp.
    #[arg(short = 'c', long = "proto", default_value = "0", value_parser = parse_protocol)]
    protocol: u8,

    /// Add the rule.
    #[arg(short = 'a', long)]
    add: bool,

    /// Remove the first equal rule.
    #[arg(short = 'r', long)]
    remove: bool,

    /// List the installed rules.
    #[arg(short = 'v', long)]
    view: bool,

    /// Show what the rule set does to the described packet.
    #[arg(long)]
    check: bool,

    /// Control socket of the daemon.
    #[arg(long, default_value = "/run/minifw.sock")]
    socket: PathBuf,
}

/// An address argument: a plain host address or a CIDR network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Addr {
    Host(IpAddr),
    Net(IpNet),
}

impl Addr {
    fn ip(self) -> IpAddr {
        match self {
            Addr::Host(addr) => addr,
            Addr::Net(net) => net.addr(),
        }
    }
}

impl FromStr for Addr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.contains('/') {
            s.parse().map(Addr::Net).map_err(|e| format!("{s}: {e}"))
        } else {
            s.parse().map(Addr::Host).map_err(|e| format!("{s}: {e}"))
        }
    }
}

fn parse_protocol(s: &str) -> Result<u8, String> {
    match s.to_ascii_lowercase().as_str() {
        "0" | "any" => Ok(PROTO_ANY),
        "6" | "tcp" => Ok(PROTO_TCP),
        "17" | "udp" => Ok(PROTO_UDP),
        _ => Err(format!("unsupported protocol {s} (expected 0, 6 or 17)")),
    }
}

/// Combines an address argument with an explicit mask.
fn address_and_mask(
    name: &str,
    addr: Option<Addr>,
    mask: Option<IpAddr>,
) -> anyhow::Result<(Option<IpAddr>, Option<IpAddr>)> {
    match (addr, mask) {
        (Some(Addr::Net(_)), Some(_)) => {
            bail!("{name} is given in CIDR form; drop the separate mask")
        }
        (Some(Addr::Net(net)), None) => Ok((Some(net.addr()), Some(net.netmask()))),
        (Some(Addr::Host(addr)), mask) => Ok((Some(addr), mask)),
        (None, mask) => Ok((None, mask)),
    }
}

impl Args {
    fn direction(&self) -> anyhow::Result<Direction> {
        match (self.inbound, self.outbound) {
            (true, _) => Ok(Direction::Inbound),
            (_, true) => Ok(Direction::Outbound),
            _ => bail!("one of --in or --out is required"),
        }
    }

    fn ip_version(&self) -> IpVersion {
        if self.v6 {
            return IpVersion::V6;
        }
        if self.v4 {
            return IpVersion::V4;
        }
        let any_v6 = [
            self.src_ip.map(Addr::ip),
            self.src_mask,
            self.dst_ip.map(Addr::ip),
            self.dst_mask,
        ]
        .into_iter()
        .flatten()
        .any(|addr| addr.is_ipv6());
        if any_v6 {
            IpVersion::V6
        } else {
            IpVersion::V4
        }
    }

    fn rule(&self) -> anyhow::Result<Rule> {
        let (src_addr, src_mask) = address_and_mask("--s-ip", self.src_ip, self.src_mask)?;
        let (dst_addr, dst_mask) = address_and_mask("--d-ip", self.dst_ip, self.dst_mask)?;
        let spec = RuleSpec {
            src_addr,
            src_mask,
            src_port: self.src_port,
            dst_addr,
            dst_mask,
            dst_port: self.dst_port,
            protocol: self.protocol,
            ..RuleSpec::new(self.direction()?, self.ip_version())
        };
        Ok(spec.to_rule()?)
    }

    fn packet(&self) -> PacketSpec {
        let unspecified = match self.ip_version() {
            IpVersion::V4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpVersion::V6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        PacketSpec {
            src_addr: self.src_ip.map_or(unspecified, Addr::ip),
            dst_addr: self.dst_ip.map_or(unspecified, Addr::ip),
            src_port: self.src_port,
            dst_port: self.dst_port,
            protocol: self.protocol,
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let client = ControlClient::new(&args.socket);

    if args.add {
        client.add(args.rule()?).await.context("add failed")?;
    } else if args.remove {
        client.remove(args.rule()?).await.context("remove failed")?;
    } else if args.view {
        let rules = client.view().await.context("view failed")?;
        println!("{}", RuleRow::HEADER);
        for rule in &rules {
            let spec = RuleSpec::try_from(rule)?;
            println!("{}", RuleRow(&spec));
        }
    } else if args.check {
        let hook = match args.direction()? {
            Direction::Inbound => Hook::Ingress,
            Direction::Outbound => Hook::Egress,
        };
        let key = args.packet().to_key()?;
        let rules = client.view().await.context("view failed")?;
        match first_match(&rules, hook, &key, Rule::matches) {
            Some(index) => {
                let spec = RuleSpec::try_from(&rules[index])?;
                println!("drop (rule #{})", index + 1);
                println!("{}", RuleRow::HEADER);
                println!("{}", RuleRow(&spec));
            }
            None => println!("accept"),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cidr_fills_mask() {
        let args = Args::parse_from([
            "mf", "-a", "-i", "-s", "10.1.0.0/16", "-c", "tcp", "-q", "22",
        ]);
        let rule = args.rule().unwrap();
        let expected = Rule::new(Direction::Inbound, IpVersion::V4)
            .with_source_v4(
                u32::from_be_bytes([10, 1, 0, 0]),
                u32::from_be_bytes([255, 255, 0, 0]),
            )
            .with_ports(0, 22)
            .with_protocol(PROTO_TCP);
        assert_eq!(rule, expected);
    }

    #[test]
    fn test_cidr_with_mask_rejected() {
        let args = Args::parse_from(["mf", "-a", "-o", "-d", "10.0.0.0/8", "-n", "255.0.0.0"]);
        assert!(args.rule().is_err());
    }

    #[test]
    fn test_direction_required_for_add() {
        let args = Args::parse_from(["mf", "-r", "-d", "8.8.8.8"]);
        assert!(args.rule().is_err());
    }

    #[test]
    fn test_one_mode_only() {
        assert!(Args::try_parse_from(["mf", "-a", "-v", "-i"]).is_err());
        assert!(Args::try_parse_from(["mf", "-i"]).is_err());
        assert!(Args::try_parse_from(["mf", "-i", "-o", "-a"]).is_err());
    }

    #[test]
    fn test_protocol_names() {
        assert_eq!(parse_protocol("UDP"), Ok(PROTO_UDP));
        assert_eq!(parse_protocol("0"), Ok(PROTO_ANY));
        assert!(parse_protocol("1").is_err());
    }

    #[test]
    fn test_v6_inferred_from_address() {
        let args = Args::parse_from(["mf", "-a", "-i", "-s", "2001:db8::/32"]);
        assert_eq!(args.ip_version(), IpVersion::V6);
        let rule = args.rule().unwrap();
        assert_eq!(rule.ip_version(), Some(IpVersion::V6));
    }
}
