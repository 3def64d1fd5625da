//! Loads the TC classifiers and mirrors the rule store into their maps.

use std::future::Future;
use std::path::Path;

use anyhow::{anyhow, Context as _};
use aya::maps::{Array, MapData};
use aya::programs::{tc, SchedClassifier, TcAttachType};
use aya::Ebpf;
use minifw_common::{
    bank_of, bank_offset, ruleset_header, Rule, MAX_RULES, RULESET_MAP, RULES_MAP,
};
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::store::Snapshot;

/// Program name and TC attach point of each classifier.
const CLASSIFIERS: [(&str, TcAttachType); 2] = [
    ("minifw_ingress", TcAttachType::Ingress),
    ("minifw_egress", TcAttachType::Egress),
];

/// Write access to the kernel's rule maps.
pub trait RuleMaps {
    fn write_rule(&mut self, index: u32, rule: &Rule) -> anyhow::Result<()>;

    /// Publishes the ruleset header word.
    fn publish(&mut self, header: u64) -> anyhow::Result<()>;
}

/// Keeps two banks of rules in the maps and alternates between them.
///
/// Every sync bumps the generation.  A classifier that sees the generation
/// change under its walk starts over, so a bank rewritten mid-walk is never
/// mistaken for a complete set.
pub struct BankedRuleset<M> {
    maps: M,
    generation: u32,
}

impl<M: RuleMaps> BankedRuleset<M> {
    pub fn new(maps: M) -> Self {
        Self {
            maps,
            generation: 0,
        }
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn active_bank(&self) -> u32 {
        bank_of(self.generation)
    }

    /// Writes `rules` into the idle bank, then publishes it as the next
    /// generation.
    pub fn sync(&mut self, rules: &[Rule]) -> anyhow::Result<()> {
        anyhow::ensure!(
            rules.len() <= MAX_RULES as usize,
            "{} rules exceed the kernel map bank size {}",
            rules.len(),
            MAX_RULES
        );

        let generation = self.generation.wrapping_add(1);
        let base = bank_offset(bank_of(generation));
        for (i, rule) in rules.iter().enumerate() {
            self.maps.write_rule(base + i as u32, rule)?;
        }
        self.maps
            .publish(ruleset_header(generation, rules.len() as u32))?;
        self.generation = generation;
        Ok(())
    }
}

/// Publishes `initial` into `maps` and only then runs `attach`, so the
/// classifiers start out enforcing the configured rules.
pub fn install<M, F>(maps: M, initial: &[Rule], attach: F) -> anyhow::Result<BankedRuleset<M>>
where
    M: RuleMaps,
    F: FnOnce() -> anyhow::Result<()>,
{
    let mut ruleset = BankedRuleset::new(maps);
    ruleset.sync(initial)?;
    attach()?;
    Ok(ruleset)
}

/// The `RULES` and `RULESET` maps of a loaded program.
pub struct KernelMaps {
    rules: Array<MapData, Rule>,
    ruleset: Array<MapData, u64>,
}

impl RuleMaps for KernelMaps {
    fn write_rule(&mut self, index: u32, rule: &Rule) -> anyhow::Result<()> {
        self.rules
            .set(index, *rule, 0)
            .with_context(|| format!("failed to write rule slot {index}"))
    }

    fn publish(&mut self, header: u64) -> anyhow::Result<()> {
        self.ruleset
            .set(0, header, 0)
            .context("failed to publish ruleset header")
    }
}

/// Loaded classifiers attached to a set of interfaces.
///
/// The programs stay attached for as long as this value lives.
pub struct Datapath {
    bpf: Ebpf,
    ruleset: BankedRuleset<KernelMaps>,
}

impl Datapath {
    /// Loads the compiled object at `object`, publishes `initial`, then
    /// attaches both classifiers to every interface.
    pub fn load(object: &Path, interfaces: &[String], initial: &[Rule]) -> anyhow::Result<Self> {
        let mut bpf = Ebpf::load_file(object)
            .with_context(|| format!("failed to load eBPF object {}", object.display()))?;

        let rules = Array::try_from(
            bpf.take_map(RULES_MAP)
                .ok_or_else(|| anyhow!("map {RULES_MAP} not found"))?,
        )?;
        let ruleset = Array::try_from(
            bpf.take_map(RULESET_MAP)
                .ok_or_else(|| anyhow!("map {RULESET_MAP} not found"))?,
        )?;

        let ruleset = install(KernelMaps { rules, ruleset }, initial, || {
            attach(&mut bpf, interfaces)
        })?;
        info!("{} initial rules in the kernel", initial.len());

        Ok(Self { bpf, ruleset })
    }

    /// Keeps the kernel maps in step with `updates` until `shutdown`
    /// resolves or the store goes away.  The classifiers are detached when
    /// this returns.
    pub async fn run_until<F>(mut self, updates: watch::Receiver<Snapshot>, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            _ = run_sync(&mut self.ruleset, updates) => {}
            _ = shutdown => {}
        }
        drop(self.bpf);
        info!("classifiers detached");
    }
}

fn attach(bpf: &mut Ebpf, interfaces: &[String]) -> anyhow::Result<()> {
    for iface in interfaces {
        // If the clsact qdisc already exists (EEXIST), that is fine.
        if let Err(e) = tc::qdisc_add_clsact(iface) {
            if e.raw_os_error() != Some(17) {
                return Err(e).with_context(|| format!("failed to add clsact qdisc on {iface}"));
            }
            debug!("clsact qdisc already exists on {}, reusing", iface);
        }
    }

    for (name, attach_type) in CLASSIFIERS {
        let program: &mut SchedClassifier = bpf
            .program_mut(name)
            .ok_or_else(|| anyhow!("program {name} not found in eBPF object"))?
            .try_into()?;
        program.load()?;
        for iface in interfaces {
            program
                .attach(iface, attach_type)
                .with_context(|| format!("failed to attach {name} to {iface}"))?;
            info!("{} attached to {} ({:?})", name, iface, attach_type);
        }
    }
    Ok(())
}

/// Mirrors every published snapshot into the kernel until the store goes
/// away.  A failed sync is logged; the kernel keeps the last good set.
pub async fn run_sync<M: RuleMaps>(
    ruleset: &mut BankedRuleset<M>,
    mut updates: watch::Receiver<Snapshot>,
) {
    loop {
        let rules = updates.borrow_and_update().clone();
        match ruleset.sync(&rules) {
            Ok(()) => debug!(
                rules = rules.len(),
                generation = ruleset.generation(),
                "kernel rules synced"
            ),
            Err(e) => error!("failed to sync rules to the kernel: {:#}", e),
        }
        if updates.changed().await.is_err() {
            break;
        }
    }
}
