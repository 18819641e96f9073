//! QueueCounts - 状態ごとのタスク数

use serde::{Deserialize, Serialize};

use super::state::TaskState;

/// Task counts per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub pending: usize,
    pub leased: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub retry_scheduled: usize,
    pub dead: usize,
}

impl QueueCounts {
    pub fn add(&mut self, state: TaskState) {
        match state {
            TaskState::Pending => self.pending += 1,
            TaskState::Leased => self.leased += 1,
            TaskState::Running => self.running += 1,
            TaskState::Succeeded => self.succeeded += 1,
            TaskState::Failed => self.failed += 1,
            TaskState::RetryScheduled => self.retry_scheduled += 1,
            TaskState::Dead => self.dead += 1,
        }
    }

    pub fn active(&self) -> usize {
        self.pending + self.leased + self.running + self.retry_scheduled
    }

    pub fn terminal(&self) -> usize {
        self.succeeded + self.failed + self.dead
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_split_active_and_terminal() {
        let mut counts = QueueCounts::default();
        for state in TaskState::ALL {
            counts.add(state);
        }
        assert_eq!(counts.active(), 4);
        assert_eq!(counts.terminal(), 3);
    }
}
