//! In-flight flow phases.
//!
//! The ledger holds the durable state of an instance; this tracks where an
//! in-progress request currently is, for logs and stats. Entries are
//! dropped once the flow settles.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::trace;

use provisor_state::InstanceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowPhase {
    Received,
    Placed,
    NodeCommandSent,
    Confirmed,
    UnprovisionReceived,
    NodeDeleteCommandSent,
    Gone,
}

#[derive(Debug, Default)]
pub struct FlowTracker {
    phases: Mutex<BTreeMap<InstanceId, FlowPhase>>,
}

impl FlowTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(&self, instance_id: &str, phase: FlowPhase) {
        trace!(%instance_id, ?phase, "flow phase");
        self.phases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(instance_id.to_string(), phase);
    }

    /// Enter `phase` and finish the flow when the returned guard drops,
    /// however the flow ends.
    pub fn track(&self, instance_id: &str, phase: FlowPhase) -> FlowGuard<'_> {
        self.enter(instance_id, phase);
        FlowGuard {
            flows: self,
            instance_id: instance_id.to_string(),
        }
    }

    pub fn finish(&self, instance_id: &str) {
        self.phases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(instance_id);
    }

    pub fn phase(&self, instance_id: &str) -> Option<FlowPhase> {
        self.phases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(instance_id)
            .copied()
    }

    pub fn snapshot(&self) -> BTreeMap<InstanceId, FlowPhase> {
        self.phases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Finishes its flow on drop.
#[must_use]
pub struct FlowGuard<'a> {
    flows: &'a FlowTracker,
    instance_id: String,
}

impl Drop for FlowGuard<'_> {
    fn drop(&mut self) {
        self.flows.finish(&self.instance_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_latest_phase_until_finished() {
        let flows = FlowTracker::new();
        flows.enter("i1", FlowPhase::Received);
        flows.enter("i1", FlowPhase::Placed);
        flows.enter("i2", FlowPhase::UnprovisionReceived);

        assert_eq!(flows.phase("i1"), Some(FlowPhase::Placed));
        assert_eq!(flows.snapshot().len(), 2);

        flows.finish("i1");
        assert_eq!(flows.phase("i1"), None);
    }

    #[test]
    fn guard_finishes_flow_on_early_exit() {
        let flows = FlowTracker::new();
        let run = |fail: bool| -> Result<(), ()> {
            let _flow = flows.track("i1", FlowPhase::Received);
            flows.enter("i1", FlowPhase::NodeCommandSent);
            if fail {
                return Err(());
            }
            assert_eq!(flows.phase("i1"), Some(FlowPhase::NodeCommandSent));
            Ok(())
        };

        assert!(run(true).is_err());
        assert!(flows.snapshot().is_empty());
        assert!(run(false).is_ok());
        assert!(flows.snapshot().is_empty());
    }
}
