use serde::{Deserialize, Serialize};

use backfill_core::{
    BatchContext, DomainError, DomainResult, JobId, JobRole, MAX_FILE_PATHS_PER_BATCH,
    MAX_WORK_UNITS_PER_BATCH, RunId, TenantId, require_non_blank, split_full_name,
};

/// One job in the backfill tree, as carried by the queue.
///
/// The message is self-contained and replay-safe: delivering it twice must be
/// harmless because every batch write downstream upserts by stable identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMessage {
    pub job_id: JobId,
    pub tenant_id: TenantId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
    #[serde(default)]
    pub suppress_notification: bool,
    #[serde(flatten)]
    pub spec: JobSpec,
}

/// Role-specific job descriptor, tagged by `role` on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum JobSpec {
    Root(RootSpec),
    Intermediate(IntermediateSpec),
    LeafFiles(FileBatchSpec),
    LeafWorkUnits(WorkUnitBatchSpec),
}

/// Account-scope discovery. Both lists empty means "everything the installation can see".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootSpec {
    #[serde(default)]
    pub repositories: Vec<String>,
    #[serde(default)]
    pub organizations: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntermediateSpec {
    pub repository_full_name: String,
    pub repository_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileBatchSpec {
    pub organization: String,
    pub repository: String,
    pub file_paths: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_sha: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkUnitBatchSpec {
    pub organization: String,
    pub repository: String,
    pub repository_id: u64,
    pub work_unit_ids: Vec<u64>,
}

impl JobSpec {
    pub fn role(&self) -> JobRole {
        match self {
            JobSpec::Root(_) => JobRole::Root,
            JobSpec::Intermediate(_) => JobRole::Intermediate,
            JobSpec::LeafFiles(_) | JobSpec::LeafWorkUnits(_) => JobRole::Leaf,
        }
    }

    /// Wire name of the descriptor.
    pub fn kind(&self) -> &'static str {
        match self {
            JobSpec::Root(_) => "root",
            JobSpec::Intermediate(_) => "intermediate",
            JobSpec::LeafFiles(_) => "leaf_files",
            JobSpec::LeafWorkUnits(_) => "leaf_work_units",
        }
    }
}

impl FileBatchSpec {
    pub fn context(&self) -> BatchContext {
        BatchContext {
            organization: self.organization.clone(),
            repository: self.repository.clone(),
            repository_id: None,
            branch: self.branch.clone(),
            commit_sha: self.commit_sha.clone(),
        }
    }
}

impl WorkUnitBatchSpec {
    pub fn context(&self) -> BatchContext {
        BatchContext {
            organization: self.organization.clone(),
            repository: self.repository.clone(),
            repository_id: Some(self.repository_id),
            branch: None,
            commit_sha: None,
        }
    }
}

impl JobMessage {
    pub fn root(tenant_id: TenantId, spec: RootSpec, suppress_notification: bool) -> Self {
        Self {
            job_id: JobId::new(),
            tenant_id,
            run_id: None,
            suppress_notification,
            spec: JobSpec::Root(spec),
        }
    }

    pub fn role(&self) -> JobRole {
        self.spec.role()
    }

    /// The `index`-th child of this job. Inherits tenant, run and notification flag.
    pub fn child(&self, index: usize, run_id: Option<RunId>, spec: JobSpec) -> Self {
        Self {
            job_id: JobId::child_of(self.job_id, index),
            tenant_id: self.tenant_id,
            run_id: run_id.or(self.run_id),
            suppress_notification: self.suppress_notification,
            spec,
        }
    }

    /// Reject descriptors that can never succeed, whatever the number of redeliveries.
    pub fn validate(&self) -> DomainResult<()> {
        match &self.spec {
            JobSpec::Root(root) => {
                for full_name in &root.repositories {
                    split_full_name(full_name)?;
                }
                for org in &root.organizations {
                    require_non_blank("organization", org)?;
                }
                Ok(())
            }
            JobSpec::Intermediate(spec) => {
                split_full_name(&spec.repository_full_name)?;
                if spec.repository_id == 0 {
                    return Err(DomainError::missing("repository_id"));
                }
                Ok(())
            }
            JobSpec::LeafFiles(spec) => {
                require_non_blank("organization", &spec.organization)?;
                require_non_blank("repository", &spec.repository)?;
                if spec.file_paths.len() > MAX_FILE_PATHS_PER_BATCH {
                    return Err(DomainError::BatchTooLarge {
                        len: spec.file_paths.len(),
                        max: MAX_FILE_PATHS_PER_BATCH,
                    });
                }
                Ok(())
            }
            JobSpec::LeafWorkUnits(spec) => {
                require_non_blank("organization", &spec.organization)?;
                require_non_blank("repository", &spec.repository)?;
                if spec.repository_id == 0 {
                    return Err(DomainError::missing("repository_id"));
                }
                if spec.work_unit_ids.len() > MAX_WORK_UNITS_PER_BATCH {
                    return Err(DomainError::BatchTooLarge {
                        len: spec.work_unit_ids.len(),
                        max: MAX_WORK_UNITS_PER_BATCH,
                    });
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_format_flattens_the_descriptor() {
        let tenant = TenantId::new();
        let msg = JobMessage {
            job_id: JobId::new(),
            tenant_id: tenant,
            run_id: None,
            suppress_notification: true,
            spec: JobSpec::Intermediate(IntermediateSpec {
                repository_full_name: "acme/widgets".into(),
                repository_id: 42,
            }),
        };

        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["role"], "intermediate");
        assert_eq!(value["repository_full_name"], "acme/widgets");
        assert_eq!(value["repository_id"], 42);
        assert!(value.get("run_id").is_none());

        let back: JobMessage = serde_json::from_value(value).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn root_lists_default_to_empty() {
        let tenant = TenantId::new();
        let msg: JobMessage = serde_json::from_value(json!({
            "job_id": JobId::new(),
            "tenant_id": tenant,
            "role": "root",
        }))
        .unwrap();

        assert_eq!(msg.spec, JobSpec::Root(RootSpec::default()));
        assert!(!msg.suppress_notification);
        assert_eq!(msg.role(), JobRole::Root);
    }

    #[test]
    fn children_inherit_scope_and_get_stable_ids() {
        let parent = JobMessage::root(TenantId::new(), RootSpec::default(), true);
        let run = RunId::for_root_job(parent.job_id);
        let spec = JobSpec::Intermediate(IntermediateSpec {
            repository_full_name: "acme/widgets".into(),
            repository_id: 1,
        });

        let a = parent.child(0, Some(run), spec.clone());
        let b = parent.child(0, Some(run), spec);
        assert_eq!(a, b);
        assert_eq!(a.tenant_id, parent.tenant_id);
        assert_eq!(a.run_id, Some(run));
        assert!(a.suppress_notification);
    }

    #[test]
    fn validation_rejects_malformed_descriptors() {
        let tenant = TenantId::new();
        let mut msg = JobMessage::root(
            tenant,
            RootSpec {
                repositories: vec!["not-a-full-name".into()],
                organizations: vec![],
            },
            false,
        );
        assert!(msg.validate().is_err());

        msg.spec = JobSpec::LeafWorkUnits(WorkUnitBatchSpec {
            organization: "acme".into(),
            repository: "widgets".into(),
            repository_id: 3,
            work_unit_ids: (0..=MAX_WORK_UNITS_PER_BATCH as u64).collect(),
        });
        assert!(matches!(
            msg.validate(),
            Err(DomainError::BatchTooLarge { .. })
        ));

        msg.spec = JobSpec::LeafFiles(FileBatchSpec {
            organization: " ".into(),
            repository: "widgets".into(),
            file_paths: vec![],
            branch: None,
            commit_sha: None,
        });
        assert_eq!(msg.validate(), Err(DomainError::missing("organization")));
    }
}
