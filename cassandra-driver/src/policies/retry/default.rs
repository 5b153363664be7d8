use cassandra_cql::errors::WriteType;
use cassandra_cql::Consistency;

use super::{RetryDecision, RetryPolicy};

/// Retries at most once, with the original consistency, and only when the
/// retry has a fair chance to succeed:
/// - a read timeout where enough replicas answered but the data was not retrieved,
/// - a write timeout while writing the batch log,
/// - an unavailable error, since another coordinator may see more live replicas.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultRetryPolicy;

impl DefaultRetryPolicy {
    pub fn new() -> DefaultRetryPolicy {
        DefaultRetryPolicy
    }
}

impl RetryPolicy for DefaultRetryPolicy {
    fn read_timeout(
        &self,
        consistency: Consistency,
        required: i32,
        received: i32,
        data_retrieved: bool,
        nb_retry: u32,
    ) -> RetryDecision {
        if nb_retry != 0 {
            return RetryDecision::Rethrow;
        }
        if received >= required && !data_retrieved {
            RetryDecision::RetryWithConsistency(consistency)
        } else {
            RetryDecision::Rethrow
        }
    }

    fn write_timeout(
        &self,
        consistency: Consistency,
        write_type: &WriteType,
        _required: i32,
        _received: i32,
        nb_retry: u32,
    ) -> RetryDecision {
        if nb_retry != 0 {
            return RetryDecision::Rethrow;
        }
        match write_type {
            WriteType::BatchLog => RetryDecision::RetryWithConsistency(consistency),
            _ => RetryDecision::Rethrow,
        }
    }

    fn unavailable(
        &self,
        consistency: Consistency,
        _required: i32,
        _alive: i32,
        nb_retry: u32,
    ) -> RetryDecision {
        if nb_retry == 0 {
            RetryDecision::RetryWithConsistency(consistency)
        } else {
            RetryDecision::Rethrow
        }
    }
}
