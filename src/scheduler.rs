//! Fleet scheduler.
//!
//! Filters the node set in a fixed order (health, quarantine routing,
//! heat class, affinity, capacity) and ranks the survivors under the
//! configured strategy. Ties break on the lexicographically lowest node
//! id so placement is deterministic.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::domain::{
    HeatClass, NodeId, NodeStatus, POOL_LABEL, QUARANTINE_LABEL, SandboxRequest, meta,
};

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("no node with sufficient capacity")]
    NoCapacity,

    #[error("no quarantine nodes in the fleet")]
    NoQuarantineNodes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    LeastLoaded,
    BinPacking,
}

impl Strategy {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "least-loaded" => Some(Strategy::LeastLoaded),
            "bin-packing" => Some(Strategy::BinPacking),
            _ => None,
        }
    }
}

pub struct Scheduler {
    strategy: Strategy,
    heat_classes: BTreeMap<String, HeatClass>,
}

impl Scheduler {
    pub fn new(strategy: Strategy, heat_classes: BTreeMap<String, HeatClass>) -> Self {
        Self {
            strategy,
            heat_classes,
        }
    }

    /// Pick a node for the request, or say why none fits.
    pub fn choose_node(
        &self,
        req: &SandboxRequest,
        nodes: &[NodeStatus],
        now: DateTime<Utc>,
    ) -> Result<NodeId, ScheduleError> {
        let quarantined = req.meta_is(meta::QUARANTINE, "true");

        // Quarantined workloads never fall back to ordinary nodes: a
        // fleet with no quarantine-labelled node at all is a hard
        // failure, regardless of node health.
        if quarantined
            && !nodes
                .iter()
                .any(|n| n.label_is(QUARANTINE_LABEL, "true"))
        {
            return Err(ScheduleError::NoQuarantineNodes);
        }

        let mut candidates: Vec<&NodeStatus> = nodes.iter().filter(|n| n.healthy(now)).collect();

        if quarantined {
            candidates.retain(|n| n.label_is(QUARANTINE_LABEL, "true"));
        } else {
            // Quarantine nodes are reserved for quarantined workloads.
            candidates.retain(|n| !n.label_is(QUARANTINE_LABEL, "true"));
        }

        if let Some(class) = req
            .heat_level
            .as_deref()
            .and_then(|level| self.heat_classes.get(level))
        {
            candidates.retain(|n| n.info.capacity.gpu >= class.gpu_count);
            candidates.retain(|n| match n.info.labels.get(POOL_LABEL) {
                Some(pool) => *pool == class.name,
                None => true,
            });
        } else if let Some(level) = &req.heat_level {
            tracing::debug!(heat_level = %level, "unknown heat level, skipping heat filter");
        }

        for (key, value) in &req.metadata {
            if let Some(label) = key.strip_prefix(meta::AFFINITY_PREFIX) {
                candidates.retain(|n| n.label_is(label, value));
            } else if let Some(label) = key.strip_prefix(meta::ANTI_AFFINITY_PREFIX) {
                candidates.retain(|n| !n.label_is(label, value));
            }
            // Other scheduler.* prefixes are ignored for forward compat.
        }

        candidates.retain(|n| n.free_mem_mb() >= u64::from(req.resources.mem_mb));

        if candidates.is_empty() {
            return Err(ScheduleError::NoCapacity);
        }

        match self.strategy {
            Strategy::LeastLoaded => candidates.sort_by(|a, b| {
                b.free_mem_mb()
                    .cmp(&a.free_mem_mb())
                    .then_with(|| a.info.id.cmp(&b.info.id))
            }),
            Strategy::BinPacking => candidates.sort_by(|a, b| {
                a.free_mem_mb()
                    .cmp(&b.free_mem_mb())
                    .then_with(|| a.info.id.cmp(&b.info.id))
            }),
        }

        Ok(candidates[0].info.id.clone())
    }
}
