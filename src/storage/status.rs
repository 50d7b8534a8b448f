// ----------------------------------------------------------------------------
// Writing Status
// ----------------------------------------------------------------------------

use std::fmt::{self, Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

/// Load of the storage writer over the last check period
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum WritingStatus {
    Good,
    Medium,
    High,
    Critical,
}

impl WritingStatus {
    /// Status from the tasks that arrived and finished within one period.
    /// The fewer arrivals were matched by completions, the worse the load.
    pub fn from_counts(arrived: u64, finished: u64) -> Self {
        if arrived == 0 {
            return WritingStatus::Good;
        }
        let ratio = finished as f64 / arrived as f64;
        if ratio >= 1.0 {
            WritingStatus::Good
        } else if ratio >= 0.75 {
            WritingStatus::Medium
        } else if ratio >= 0.5 {
            WritingStatus::High
        } else {
            WritingStatus::Critical
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WritingStatus::Good => "good",
            WritingStatus::Medium => "medium",
            WritingStatus::High => "high",
            WritingStatus::Critical => "critical",
        }
    }
}

impl Display for WritingStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counts task arrivals and completions between two checks
#[derive(Debug)]
pub struct WritingStatusTracker {
    arrived: AtomicU64,
    finished: AtomicU64,
    last: Mutex<WritingStatus>,
}

impl Default for WritingStatusTracker {
    fn default() -> Self {
        Self {
            arrived: AtomicU64::new(0),
            finished: AtomicU64::new(0),
            last: Mutex::new(WritingStatus::Good),
        }
    }
}

impl WritingStatusTracker {
    pub fn task_arrived(&self) {
        self.arrived.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_finished(&self) {
        self.finished.fetch_add(1, Ordering::Relaxed);
    }

    /// Close the current period and compute its status
    pub fn check(&self) -> WritingStatus {
        let arrived = self.arrived.swap(0, Ordering::AcqRel);
        let finished = self.finished.swap(0, Ordering::AcqRel);
        let status = WritingStatus::from_counts(arrived, finished);
        *self.last.lock() = status;
        status
    }

    /// Status of the last closed period
    pub fn current(&self) -> WritingStatus {
        *self.last.lock()
    }
}
