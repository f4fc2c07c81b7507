use store::Store;

use crate::retry::{RetryExecutor, RetryPolicy};

/// Handles every saga component works with.
///
/// Built once by the process and cloned into each component.
#[derive(Debug, Clone)]
pub struct ExecutionContext<S> {
    pub store: S,
    pub retry: RetryExecutor,
}

impl<S: Store + Clone> ExecutionContext<S> {
    /// Wraps `store` with a retry executor built from `policy`.
    pub fn new(store: S, policy: RetryPolicy) -> Self {
        Self {
            store,
            retry: RetryExecutor::new(policy),
        }
    }
}
