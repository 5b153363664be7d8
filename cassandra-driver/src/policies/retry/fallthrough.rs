use cassandra_cql::errors::WriteType;
use cassandra_cql::Consistency;

use super::{RetryDecision, RetryPolicy};

/// Forwards all errors directly to the user, never retries
#[derive(Debug, Default, Clone, Copy)]
pub struct FallthroughRetryPolicy;

impl FallthroughRetryPolicy {
    /// Creates a new instance of [FallthroughRetryPolicy].
    pub fn new() -> FallthroughRetryPolicy {
        FallthroughRetryPolicy
    }
}

impl RetryPolicy for FallthroughRetryPolicy {
    fn read_timeout(
        &self,
        _consistency: Consistency,
        _required: i32,
        _received: i32,
        _data_retrieved: bool,
        _nb_retry: u32,
    ) -> RetryDecision {
        RetryDecision::Rethrow
    }

    fn write_timeout(
        &self,
        _consistency: Consistency,
        _write_type: &WriteType,
        _required: i32,
        _received: i32,
        _nb_retry: u32,
    ) -> RetryDecision {
        RetryDecision::Rethrow
    }

    fn unavailable(
        &self,
        _consistency: Consistency,
        _required: i32,
        _alive: i32,
        _nb_retry: u32,
    ) -> RetryDecision {
        RetryDecision::Rethrow
    }
}
