//! Vector clocks
//!
//! A clock maps agent ids to monotonically increasing counters. Missing
//! components read as zero, so clocks over different agent sets compare over
//! the union of their keys.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Causal relation between two clocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClockOrdering {
    Before,
    After,
    Equal,
    Concurrent,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock(BTreeMap<String, u64>);

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, agent_id: &str) -> u64 {
        self.0.get(agent_id).copied().unwrap_or(0)
    }

    /// Advance this agent's component; returns the new value
    pub fn increment(&mut self, agent_id: &str) -> u64 {
        let counter = self.0.entry(agent_id.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Componentwise maximum
    pub fn merge(&self, other: &VectorClock) -> VectorClock {
        let mut merged = self.clone();
        merged.merge_in_place(other);
        merged
    }

    pub fn merge_in_place(&mut self, other: &VectorClock) {
        for (agent, &count) in &other.0 {
            let entry = self.0.entry(agent.clone()).or_insert(0);
            *entry = (*entry).max(count);
        }
    }

    pub fn compare(&self, other: &VectorClock) -> ClockOrdering {
        let mut less = false;
        let mut greater = false;
        for agent in self.0.keys().chain(other.0.keys()) {
            let (a, b) = (self.get(agent), other.get(agent));
            less |= a < b;
            greater |= a > b;
            if less && greater {
                return ClockOrdering::Concurrent;
            }
        }
        match (less, greater) {
            (true, false) => ClockOrdering::Before,
            (false, true) => ClockOrdering::After,
            (false, false) => ClockOrdering::Equal,
            (true, true) => ClockOrdering::Concurrent,
        }
    }

    pub fn happened_before(&self, other: &VectorClock) -> bool {
        self.compare(other) == ClockOrdering::Before
    }

    /// Sum of all components. Strictly increases along every causal chain,
    /// so sorting by it is a linear extension of the causal order.
    pub fn weight(&self) -> u64 {
        self.0.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(|&c| c == 0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.0.iter().map(|(k, &v)| (k.as_str(), v))
    }
}

impl<K: Into<String>> FromIterator<(K, u64)> for VectorClock {
    fn from_iter<I: IntoIterator<Item = (K, u64)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clock(pairs: &[(&str, u64)]) -> VectorClock {
        pairs.iter().map(|&(k, v)| (k, v)).collect()
    }

    #[test]
    fn test_before_and_after() {
        let a = clock(&[("x", 1), ("y", 2)]);
        let b = clock(&[("x", 2), ("y", 2)]);
        assert_eq!(a.compare(&b), ClockOrdering::Before);
        assert_eq!(b.compare(&a), ClockOrdering::After);
        assert!(a.happened_before(&b));
    }

    #[test]
    fn test_concurrent() {
        let a = clock(&[("x", 2), ("y", 1)]);
        let b = clock(&[("x", 1), ("y", 2)]);
        assert_eq!(a.compare(&b), ClockOrdering::Concurrent);
        assert_eq!(b.compare(&a), ClockOrdering::Concurrent);
    }

    #[test]
    fn test_missing_components_are_zero() {
        let a = clock(&[("x", 1)]);
        let b = clock(&[("x", 1), ("y", 1)]);
        assert_eq!(a.compare(&b), ClockOrdering::Before);
        assert_eq!(clock(&[("x", 0)]).compare(&VectorClock::new()), ClockOrdering::Equal);
        assert_eq!(clock(&[("x", 1)]).compare(&clock(&[("y", 1)])), ClockOrdering::Concurrent);
    }

    #[test]
    fn test_merge_is_componentwise_max() {
        let a = clock(&[("x", 2), ("y", 1)]);
        let b = clock(&[("x", 1), ("y", 2), ("z", 4)]);
        assert_eq!(a.merge(&b), clock(&[("x", 2), ("y", 2), ("z", 4)]));
        assert_eq!(a.merge(&b).compare(&a), ClockOrdering::After);
    }

    #[test]
    fn test_increment_and_weight() {
        let mut c = VectorClock::new();
        assert!(c.is_empty());
        assert_eq!(c.increment("a"), 1);
        assert_eq!(c.increment("a"), 2);
        c.increment("b");
        assert_eq!(c.weight(), 3);
        assert_eq!(serde_json::to_value(&c).unwrap(), serde_json::json!({"a": 2, "b": 1}));
    }
}
