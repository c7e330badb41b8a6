use std::collections::HashSet;
use std::sync::{PoisonError, RwLock};

use crate::job::JobId;

/// Set of job ids flagged for cancellation.
///
/// Constructed once and shared by handle between the service, the queue
/// consumers and the transforms' cancellation predicates. An entry lives
/// from the cancel request until the job reaches a terminal state.
#[derive(Debug, Default)]
pub struct CancellationRegistry {
    flagged: RwLock<HashSet<JobId>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flags the given ids. Returns how many were not already flagged.
    pub fn request_cancel<'a, I>(&self, ids: I) -> usize
    where
        I: IntoIterator<Item = &'a JobId>,
    {
        let mut flagged = self
            .flagged
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        ids.into_iter()
            .filter(|id| flagged.insert((*id).clone()))
            .count()
    }

    pub fn is_cancelled(&self, id: &JobId) -> bool {
        self.flagged
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(id)
    }

    /// Removes the entry once the job is terminal.
    pub fn clear(&self, id: &JobId) -> bool {
        self.flagged
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
    }

    pub fn len(&self) -> usize {
        self.flagged
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
