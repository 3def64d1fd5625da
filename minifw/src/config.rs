use ipnet::IpNet;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use minifw_common::MAX_RULES;

use crate::rule::RuleSpec;

/// Daemon configuration, loadable from CLI or YAML file.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Interfaces to attach the ingress and egress classifiers on.
    #[serde(default = "default_interfaces")]
    pub interfaces: Vec<String>,

    /// Compiled classifier object.
    #[serde(default = "default_ebpf_object")]
    pub ebpf_object: PathBuf,

    /// Unix socket the controller talks to.
    #[serde(default = "default_control_socket")]
    pub control_socket: PathBuf,

    /// Maximum number of rules (None = unbounded, needs `no_datapath`).
    #[serde(default = "default_max_rules")]
    pub max_rules: Option<usize>,

    /// Admin API port (None = API disabled).
    #[serde(default)]
    pub api_port: Option<u16>,

    /// List of CIDRs allowed to access the API (empty = allow all).
    #[serde(default)]
    pub allowed_ips: Vec<String>,

    /// Quiet mode (suppress non-error logs).
    #[serde(default)]
    pub quiet: bool,

    /// Run the control plane only, without loading the classifiers.
    #[serde(default)]
    pub no_datapath: bool,

    /// Rules added at startup, in order.
    #[serde(default)]
    pub rules: Vec<RuleSpec>,
}

fn default_interfaces() -> Vec<String> {
    vec!["eth0".to_string()]
}

fn default_ebpf_object() -> PathBuf {
    PathBuf::from("minifw-ebpf/target/bpfel-unknown-none/debug/minifw")
}

fn default_control_socket() -> PathBuf {
    PathBuf::from("/run/minifw.sock")
}

fn default_max_rules() -> Option<usize> {
    Some(100)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interfaces: default_interfaces(),
            ebpf_object: default_ebpf_object(),
            control_socket: default_control_socket(),
            max_rules: default_max_rules(),
            api_port: None,
            allowed_ips: Vec::new(),
            quiet: false,
            no_datapath: false,
            rules: Vec::new(),
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Merge CLI args into config (CLI takes precedence).
    pub fn merge_cli(&mut self, cli: &CliArgs) {
        if !cli.interface.is_empty() {
            self.interfaces = cli.interface.clone();
        }
        if let Some(ref object) = cli.ebpf_object {
            self.ebpf_object = object.clone();
        }
        if let Some(ref socket) = cli.control_socket {
            self.control_socket = socket.clone();
        }
        if cli.unbounded {
            self.max_rules = None;
        } else if cli.max_rules.is_some() {
            self.max_rules = cli.max_rules;
        }
        if cli.api_port.is_some() {
            self.api_port = cli.api_port;
        }
        if !cli.allowed_ips.is_empty() {
            self.allowed_ips = cli.allowed_ips.clone();
        }
        if cli.quiet {
            self.quiet = true;
        }
        if cli.no_datapath {
            self.no_datapath = true;
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.no_datapath {
            match self.max_rules {
                None => anyhow::bail!(
                    "an unbounded rule store needs no_datapath; the kernel holds at most {} rules",
                    MAX_RULES
                ),
                Some(max) if max > MAX_RULES as usize => anyhow::bail!(
                    "max_rules {} exceeds the kernel limit of {}",
                    max,
                    MAX_RULES
                ),
                Some(_) => {}
            }
            anyhow::ensure!(!self.interfaces.is_empty(), "no interfaces configured");
        }
        for cidr in &self.allowed_ips {
            cidr.parse::<IpNet>()
                .map_err(|e| anyhow::anyhow!("allowed_ips entry {:?}: {}", cidr, e))?;
        }
        for (i, spec) in self.rules.iter().enumerate() {
            spec.to_rule()
                .map_err(|e| anyhow::anyhow!("initial rule #{}: {}", i + 1, e))?;
        }
        Ok(())
    }
}

use clap::Parser;

/// minifw: stateless eBPF packet filter daemon
#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct CliArgs {
    /// Interface to attach the classifiers to (e.g., eth0). Repeat for multiple.
    #[arg(short, long)]
    pub interface: Vec<String>,

    /// Path to YAML config file.
    #[arg(short, long)]
    pub config: Option<String>,

    /// Compiled eBPF object to load.
    #[arg(long)]
    pub ebpf_object: Option<PathBuf>,

    /// Control socket path.
    #[arg(short = 's', long)]
    pub control_socket: Option<PathBuf>,

    /// Maximum number of rules.
    #[arg(long, conflicts_with = "unbounded")]
    pub max_rules: Option<usize>,

    /// Do not bound the rule store (requires --no-datapath).
    #[arg(long)]
    pub unbounded: bool,

    /// Port to serve the admin API on.
    #[arg(short = 'p', long)]
    pub api_port: Option<u16>,

    /// IP CIDRs allowed to access the API (e.g., 10.0.0.0/8). Repeat for multiple.
    #[arg(long)]
    pub allowed_ips: Vec<String>,

    /// Quiet mode (suppress non-error logs).
    #[arg(short = 'q', long)]
    pub quiet: bool,

    /// Run without loading the eBPF classifiers.
    #[arg(long)]
    pub no_datapath: bool,
}
