//! Backfill runs and job roles.

use serde::{Deserialize, Serialize};

use crate::id::{JobId, RunId, TenantId};

/// One historical ingestion execution for a tenant.
///
/// Created by the root job and referenced read-only by every descendant.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillRun {
    run_id: RunId,
    tenant_id: TenantId,
    suppress_notification: bool,
}

impl BackfillRun {
    pub fn new(run_id: RunId, tenant_id: TenantId, suppress_notification: bool) -> Self {
        Self {
            run_id,
            tenant_id,
            suppress_notification,
        }
    }

    /// Mint the run for a root job.
    pub fn mint(root_job: JobId, tenant_id: TenantId, suppress_notification: bool) -> Self {
        Self::new(RunId::for_root_job(root_job), tenant_id, suppress_notification)
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    pub fn suppress_notification(&self) -> bool {
        self.suppress_notification
    }
}

/// Position of a job in the tree.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobRole {
    Root,
    Intermediate,
    Leaf,
}

impl JobRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobRole::Root => "root",
            JobRole::Intermediate => "intermediate",
            JobRole::Leaf => "leaf",
        }
    }
}

impl core::fmt::Display for JobRole {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}
