//! Bounded work batches.
//!
//! A batch is the unit of work for one leaf job: an ordered list of opaque
//! unit identifiers plus the minimal addressing context needed to fetch them.
//! The ceiling bounds a leaf job's memory and API footprint.

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Ceiling for filesystem-path batches.
pub const MAX_FILE_PATHS_PER_BATCH: usize = 100;

/// Ceiling for provider work-unit batches (e.g. pull-request numbers).
pub const MAX_WORK_UNITS_PER_BATCH: usize = 50;

/// Where a batch's units live.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchContext {
    pub organization: String,
    pub repository: String,
    pub repository_id: Option<u64>,
    pub branch: Option<String>,
    pub commit_sha: Option<String>,
}

impl BatchContext {
    pub fn new(organization: impl Into<String>, repository: impl Into<String>) -> Self {
        Self {
            organization: organization.into(),
            repository: repository.into(),
            ..Default::default()
        }
    }

    pub fn full_name(&self) -> String {
        format!("{}/{}", self.organization, self.repository)
    }
}

/// Ordered, bounded list of work units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkBatch<T> {
    context: BatchContext,
    units: Vec<T>,
}

impl<T> WorkBatch<T> {
    /// Build a batch, rejecting one above `max`.
    pub fn new(context: BatchContext, units: Vec<T>, max: usize) -> DomainResult<Self> {
        if units.len() > max {
            return Err(DomainError::BatchTooLarge {
                len: units.len(),
                max,
            });
        }
        Ok(Self { context, units })
    }

    /// Slice `units` into consecutive batches of at most `max`, preserving order.
    pub fn slice(context: &BatchContext, units: Vec<T>, max: usize) -> DomainResult<Vec<Self>> {
        if max == 0 {
            return Err(DomainError::validation("batch size must be positive"));
        }
        let mut batches = Vec::with_capacity(units.len().div_ceil(max));
        let mut iter = units.into_iter().peekable();
        while iter.peek().is_some() {
            let chunk: Vec<T> = iter.by_ref().take(max).collect();
            batches.push(Self {
                context: context.clone(),
                units: chunk,
            });
        }
        Ok(batches)
    }

    pub fn context(&self) -> &BatchContext {
        &self.context
    }

    pub fn units(&self) -> &[T] {
        &self.units
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn into_parts(self) -> (BatchContext, Vec<T>) {
        (self.context, self.units)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn oversized_batch_is_rejected() {
        let err = WorkBatch::new(BatchContext::default(), vec![1u64, 2, 3], 2).unwrap_err();
        assert_eq!(err, DomainError::BatchTooLarge { len: 3, max: 2 });
    }

    #[test]
    fn empty_input_yields_no_batches() {
        let batches = WorkBatch::<String>::slice(&BatchContext::default(), vec![], 10).unwrap();
        assert!(batches.is_empty());
    }

    #[test]
    fn zero_ceiling_is_a_validation_error() {
        assert!(WorkBatch::slice(&BatchContext::default(), vec![1u64], 0).is_err());
    }

    proptest! {
        #[test]
        fn slicing_preserves_order_and_respects_ceiling(
            units in proptest::collection::vec(any::<u32>(), 0..500),
            max in 1usize..120,
        ) {
            let ctx = BatchContext::new("acme", "widgets");
            let batches = WorkBatch::slice(&ctx, units.clone(), max).unwrap();

            prop_assert_eq!(batches.len(), units.len().div_ceil(max));
            for b in &batches {
                prop_assert!(!b.is_empty());
                prop_assert!(b.len() <= max);
                prop_assert_eq!(b.context(), &ctx);
            }
            let rejoined: Vec<u32> = batches.into_iter().flat_map(|b| b.into_parts().1).collect();
            prop_assert_eq!(rejoined, units);
        }
    }
}
