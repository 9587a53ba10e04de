//! Per-device reconciliation status records (Section 3): Agent and
//! DHCPSubnet. Agents are the ground truth the Readiness Oracle (4.C)
//! reasons over.

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::client::Named;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueCounters {
    pub transmit_bits: u64,
    pub transmit_pkts: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct InterfaceState {
    pub oper_status: String,
    pub counters: HashMap<String, QueueCounters>,
}

/// The per-switch (or per-gateway) reconciliation record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Agent {
    pub name: String,
    pub generation: u64,
    pub last_applied_generation: u64,
    pub last_applied_time: Option<SystemTime>,
    pub last_heartbeat: Option<SystemTime>,
    pub version: String,
    pub interfaces: HashMap<String, InterfaceState>,
}

impl Agent {
    /// Invariant (iv): an agent is ready iff its last-applied generation has
    /// caught up, the heartbeat is recent, and the required dwell since the
    /// last apply has elapsed.
    pub fn is_ready(&self, now: SystemTime, required_dwell: Duration) -> bool {
        if self.last_applied_generation != self.generation {
            return false;
        }
        let heartbeat_fresh = self
            .last_heartbeat
            .and_then(|hb| now.duration_since(hb).ok())
            .map(|age| age < Duration::from_secs(60))
            .unwrap_or(false);
        if !heartbeat_fresh {
            return false;
        }
        self.last_applied_time
            .and_then(|t| now.duration_since(t).ok())
            .map(|age| age >= required_dwell)
            .unwrap_or(false)
    }

    pub fn is_updated(&self, desired_version: &str) -> bool {
        self.version == desired_version
    }
}

impl Named for Agent {
    const KIND: &'static str = "Agent";
    fn object_name(&self) -> &str {
        &self.name
    }
}

/// Status record carrying the MAC-to-allocation map for one subnet.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DhcpSubnet {
    pub name: String,
    pub allocations: HashMap<String, String>, // mac -> ip
}

impl Named for DhcpSubnet {
    const KIND: &'static str = "DhcpSubnet";
    fn object_name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(gen: u64, applied: u64, heartbeat_age: Duration, applied_age: Duration) -> Agent {
        let now = SystemTime::now();
        Agent {
            name: "leaf-01".into(),
            generation: gen,
            last_applied_generation: applied,
            last_applied_time: Some(now - applied_age),
            last_heartbeat: Some(now - heartbeat_age),
            version: "v1".into(),
            interfaces: HashMap::new(),
        }
    }

    #[test]
    fn ready_requires_matching_generation() {
        let a = agent(2, 1, Duration::from_secs(1), Duration::from_secs(30));
        assert!(!a.is_ready(SystemTime::now(), Duration::from_secs(15)));
    }

    #[test]
    fn ready_requires_fresh_heartbeat() {
        let a = agent(2, 2, Duration::from_secs(120), Duration::from_secs(30));
        assert!(!a.is_ready(SystemTime::now(), Duration::from_secs(15)));
    }

    #[test]
    fn ready_requires_dwell_elapsed() {
        let a = agent(2, 2, Duration::from_secs(1), Duration::from_secs(1));
        assert!(!a.is_ready(SystemTime::now(), Duration::from_secs(15)));
    }

    #[test]
    fn ready_when_all_conditions_hold() {
        let a = agent(2, 2, Duration::from_secs(1), Duration::from_secs(30));
        assert!(a.is_ready(SystemTime::now(), Duration::from_secs(15)));
    }
}
