//! Userspace evaluation of the enforcement policy.
//!
//! The TC classifiers run the same first-match walk in the kernel; this copy
//! answers "what would happen to this packet" for the control plane.

use std::sync::Arc;

pub use minifw_common::{Hook, PacketKey, Verdict};
use minifw_common::Rule;

use crate::store::RuleStore;

/// Index of the first rule applicable at `hook` that `matcher` accepts.
///
/// Rules of the other direction are skipped without calling `matcher`, and
/// the walk stops at the first hit.
pub fn first_match<F>(
    rules: &[Rule],
    hook: Hook,
    packet: &PacketKey,
    mut matcher: F,
) -> Option<usize>
where
    F: FnMut(&Rule, &PacketKey) -> bool,
{
    let direction = hook.direction();
    rules
        .iter()
        .position(|rule| rule.direction() == direction && matcher(rule, packet))
}

/// Default-allow, first-match-drop.
pub fn evaluate(rules: &[Rule], hook: Hook, packet: &PacketKey) -> Verdict {
    match first_match(rules, hook, packet, Rule::matches) {
        Some(_) => Verdict::Drop,
        None => Verdict::Accept,
    }
}

/// Evaluates packets against the live contents of a [`RuleStore`].
#[derive(Clone)]
pub struct Enforcer {
    store: Arc<RuleStore>,
}

/// A verdict plus the rule that produced it, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub verdict: Verdict,
    pub rule_index: Option<usize>,
    pub rule: Option<Rule>,
}

impl Enforcer {
    pub fn new(store: Arc<RuleStore>) -> Self {
        Self { store }
    }

    pub fn verdict(&self, hook: Hook, packet: &PacketKey) -> Verdict {
        evaluate(&self.store.snapshot(), hook, packet)
    }

    pub fn decide(&self, hook: Hook, packet: &PacketKey) -> Decision {
        let rules = self.store.snapshot();
        match first_match(&rules, hook, packet, Rule::matches) {
            Some(index) => Decision {
                verdict: Verdict::Drop,
                rule_index: Some(index),
                rule: Some(rules[index]),
            },
            None => Decision {
                verdict: Verdict::Accept,
                rule_index: None,
                rule: None,
            },
        }
    }
}
