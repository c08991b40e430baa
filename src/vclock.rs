//! Per-peer monotonic counter map implementing causal ordering (spec §3, §4.4).

use serde::{Deserialize, Serialize};
use std::cmp::Ordering as CmpOrdering;
use std::collections::BTreeMap;

/// Result of comparing two `VectorClock`s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Equal,
    Antecedent,
    Successor,
    Concurrent,
}

/// `peer_id -> counter`. Absent keys compare as zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorClock(BTreeMap<String, u64>);

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, peer_id: &str) -> u64 {
        self.0.get(peer_id).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(|&v| v == 0)
    }

    /// Bump this peer's own component by one.
    pub fn increment(&self, peer_id: &str) -> Self {
        let mut next = self.0.clone();
        *next.entry(peer_id.to_string()).or_insert(0) += 1;
        VectorClock(next)
    }

    /// Componentwise max.
    pub fn merge(&self, other: &Self) -> Self {
        let mut out = self.0.clone();
        for (k, v) in &other.0 {
            let entry = out.entry(k.clone()).or_insert(0);
            if *v > *entry {
                *entry = *v;
            }
        }
        VectorClock(out)
    }

    pub fn compare(&self, other: &Self) -> Comparison {
        let mut keys: std::collections::BTreeSet<&String> = self.0.keys().collect();
        keys.extend(other.0.keys());

        let mut self_lt = false;
        let mut other_lt = false;
        for k in keys {
            match self.get(k).cmp(&other.get(k)) {
                CmpOrdering::Less => self_lt = true,
                CmpOrdering::Greater => other_lt = true,
                CmpOrdering::Equal => {}
            }
        }
        match (self_lt, other_lt) {
            (false, false) => Comparison::Equal,
            (true, false) => Comparison::Antecedent,
            (false, true) => Comparison::Successor,
            (true, true) => Comparison::Concurrent,
        }
    }

    pub fn lt(&self, other: &Self) -> bool {
        matches!(self.compare(other), Comparison::Antecedent)
    }

    pub fn gt(&self, other: &Self) -> bool {
        matches!(self.compare(other), Comparison::Successor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_clocks_are_equal() {
        let a = VectorClock::new();
        let b = VectorClock::new();
        assert_eq!(a.compare(&b), Comparison::Equal);
    }

    #[test]
    fn increment_makes_successor() {
        let a = VectorClock::new();
        let b = a.increment("pa");
        assert_eq!(b.compare(&a), Comparison::Successor);
        assert_eq!(a.compare(&b), Comparison::Antecedent);
    }

    #[test]
    fn concurrent_when_disjoint_components_advance() {
        let base = VectorClock::new();
        let a = base.increment("pa");
        let b = base.increment("pb");
        assert_eq!(a.compare(&b), Comparison::Concurrent);
        assert_eq!(b.compare(&a), Comparison::Concurrent);
    }

    #[test]
    fn merge_symmetry_and_dominance() {
        let base = VectorClock::new();
        let a = base.increment("pa").increment("pa");
        let b = base.increment("pb");
        let m1 = a.merge(&b);
        let m2 = b.merge(&a);
        assert_eq!(m1, m2);
        assert!(matches!(m1.compare(&a), Comparison::Equal | Comparison::Successor));
        assert!(matches!(m1.compare(&b), Comparison::Equal | Comparison::Successor));
    }

    #[test]
    fn merge_is_associative() {
        let base = VectorClock::new();
        let a = base.increment("pa");
        let b = base.increment("pb");
        let c = base.increment("pc");
        assert_eq!(a.merge(&b).merge(&c), a.merge(&b.merge(&c)));
    }

    #[test]
    fn vc_monotonicity_under_n_uploads() {
        let mut vc = VectorClock::new();
        for _ in 0..5 {
            vc = vc.increment("pa");
        }
        assert_eq!(vc.get("pa"), 5);
    }
}
