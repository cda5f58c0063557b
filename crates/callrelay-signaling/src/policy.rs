//! Call authorization: the static allow-list of who may call whom.
//!
//! Built once from configuration and never mutated afterwards. A caller with no
//! entry may call nobody. Rules are one-directional unless `mirror` is set.

use callrelay_common::config::AllowRule;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Default, Clone)]
pub struct Whitelist {
    allowed: HashMap<String, HashSet<String>>,
}

impl Whitelist {
    pub fn from_rules(rules: &[AllowRule], mirror: bool) -> Self {
        let mut allowed: HashMap<String, HashSet<String>> = HashMap::new();

        for rule in rules {
            for receiver in &rule.receivers {
                allowed
                    .entry(rule.caller.clone())
                    .or_default()
                    .insert(receiver.clone());
                if mirror {
                    allowed
                        .entry(receiver.clone())
                        .or_default()
                        .insert(rule.caller.clone());
                }
            }
        }

        Self { allowed }
    }

    pub fn is_authorized(&self, caller_id: &str, receiver_id: &str) -> bool {
        self.allowed
            .get(caller_id)
            .is_some_and(|receivers| receivers.contains(receiver_id))
    }

    /// Number of callers with at least one permitted peer.
    pub fn caller_count(&self) -> usize {
        self.allowed.len()
    }
}
