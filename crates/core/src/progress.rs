//! Per-run progress counters.

use serde::{Deserialize, Serialize};

/// The four named counters kept for every (tenant, run).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressCounter {
    TotalIngestJobs,
    AttemptedIngestJobs,
    DoneIngestJobs,
    TotalIndexJobs,
}

impl ProgressCounter {
    pub const ALL: [ProgressCounter; 4] = [
        ProgressCounter::TotalIngestJobs,
        ProgressCounter::AttemptedIngestJobs,
        ProgressCounter::DoneIngestJobs,
        ProgressCounter::TotalIndexJobs,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProgressCounter::TotalIngestJobs => "total_ingest_jobs",
            ProgressCounter::AttemptedIngestJobs => "attempted_ingest_jobs",
            ProgressCounter::DoneIngestJobs => "done_ingest_jobs",
            ProgressCounter::TotalIndexJobs => "total_index_jobs",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == s)
    }
}

/// Point-in-time read of a run's counters.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub total_ingest_jobs: u64,
    pub attempted_ingest_jobs: u64,
    pub done_ingest_jobs: u64,
    pub total_index_jobs: u64,
}

impl ProgressSnapshot {
    pub fn get(&self, counter: ProgressCounter) -> u64 {
        match counter {
            ProgressCounter::TotalIngestJobs => self.total_ingest_jobs,
            ProgressCounter::AttemptedIngestJobs => self.attempted_ingest_jobs,
            ProgressCounter::DoneIngestJobs => self.done_ingest_jobs,
            ProgressCounter::TotalIndexJobs => self.total_index_jobs,
        }
    }

    pub fn set(&mut self, counter: ProgressCounter, value: u64) {
        match counter {
            ProgressCounter::TotalIngestJobs => self.total_ingest_jobs = value,
            ProgressCounter::AttemptedIngestJobs => self.attempted_ingest_jobs = value,
            ProgressCounter::DoneIngestJobs => self.done_ingest_jobs = value,
            ProgressCounter::TotalIndexJobs => self.total_index_jobs = value,
        }
    }

    /// Every registered leaf has run at least once.
    ///
    /// Monitors compare attempted against total rather than waiting for every
    /// leaf to succeed.
    pub fn all_attempted(&self) -> bool {
        self.total_ingest_jobs > 0 && self.attempted_ingest_jobs >= self.total_ingest_jobs
    }

    /// Every registered leaf has succeeded.
    pub fn is_complete(&self) -> bool {
        self.total_ingest_jobs > 0 && self.done_ingest_jobs >= self.total_ingest_jobs
    }

    /// Leaves that ran but never succeeded (saturating).
    pub fn failed_or_pending(&self) -> u64 {
        self.attempted_ingest_jobs.saturating_sub(self.done_ingest_jobs)
    }

    /// Every leaf ran at least once, yet some never succeeded. A monitor that
    /// keeps seeing this across polls can treat the run as stuck.
    pub fn is_stalled_candidate(&self) -> bool {
        self.all_attempted() && !self.is_complete()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_names_round_trip() {
        for c in ProgressCounter::ALL {
            assert_eq!(ProgressCounter::parse(c.as_str()), Some(c));
        }
        assert_eq!(ProgressCounter::parse("bogus"), None);
    }

    #[test]
    fn completion_requires_registered_total() {
        let mut snap = ProgressSnapshot::default();
        assert!(!snap.all_attempted());
        assert!(!snap.is_complete());

        snap.set(ProgressCounter::TotalIngestJobs, 3);
        snap.set(ProgressCounter::AttemptedIngestJobs, 3);
        snap.set(ProgressCounter::DoneIngestJobs, 2);
        assert!(snap.all_attempted());
        assert!(!snap.is_complete());
        assert_eq!(snap.failed_or_pending(), 1);
        assert!(snap.is_stalled_candidate());

        snap.set(ProgressCounter::DoneIngestJobs, 3);
        assert!(snap.is_complete());
        assert!(!snap.is_stalled_candidate());
    }
}
