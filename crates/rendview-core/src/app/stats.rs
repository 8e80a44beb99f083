use serde::{Deserialize, Serialize};

use crate::domain::GlobalIntent;

/// Point-in-time view of the scheduler counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerStats {
    pub pending: usize,
    pub held: usize,
    pub running_render: usize,
    pub running_filter: usize,
    pub done: usize,
    /// Tasks that finished every step successfully.
    pub completed: u64,
    /// Sub-task runs (or launches) that failed.
    pub failed: u64,
    /// Results handed back to the source.
    pub reported: u64,
    pub failures_in_row: u32,
    pub intent: GlobalIntent,
}

impl ManagerStats {
    pub fn running(&self) -> usize {
        self.running_render + self.running_filter
    }
}
