//! Request retries configurations\
//! To decide when to retry a request the `Session` can use any object which implements
//! the `RetryPolicy` trait

use cassandra_cql::errors::{DbError, WriteType};
use cassandra_cql::Consistency;

mod default;
mod fallthrough;

pub use default::DefaultRetryPolicy;
pub use fallthrough::FallthroughRetryPolicy;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Send the request again with the given consistency.
    RetryWithConsistency(Consistency),
    /// Return the error to the caller.
    Rethrow,
    /// Swallow the error and report an empty result.
    Ignore,
}

/// Specifies a policy used to decide when to retry a request that the
/// server answered with a timeout or unavailable error.
///
/// `nb_retry` is the number of retries already done for the request.
pub trait RetryPolicy: std::fmt::Debug + Send + Sync {
    fn read_timeout(
        &self,
        consistency: Consistency,
        required: i32,
        received: i32,
        data_retrieved: bool,
        nb_retry: u32,
    ) -> RetryDecision;

    fn write_timeout(
        &self,
        consistency: Consistency,
        write_type: &WriteType,
        required: i32,
        received: i32,
        nb_retry: u32,
    ) -> RetryDecision;

    fn unavailable(
        &self,
        consistency: Consistency,
        required: i32,
        alive: i32,
        nb_retry: u32,
    ) -> RetryDecision;
}

/// Consults `policy` for the errors it has an opinion on; everything else is rethrown.
pub fn decide(policy: &dyn RetryPolicy, error: &DbError, nb_retry: u32) -> RetryDecision {
    match error {
        DbError::ReadTimeout {
            consistency,
            received,
            required,
            data_present,
        } => policy.read_timeout(*consistency, *required, *received, *data_present, nb_retry),
        DbError::WriteTimeout {
            consistency,
            received,
            required,
            write_type,
        } => policy.write_timeout(*consistency, write_type, *required, *received, nb_retry),
        DbError::Unavailable {
            consistency,
            required,
            alive,
        } => policy.unavailable(*consistency, *required, *alive, nb_retry),
        _ => RetryDecision::Rethrow,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decide_dispatches_by_error() {
        let policy = DefaultRetryPolicy::new();
        let unavailable = DbError::Unavailable {
            consistency: Consistency::Quorum,
            required: 2,
            alive: 1,
        };
        assert_eq!(
            decide(&policy, &unavailable, 0),
            RetryDecision::RetryWithConsistency(Consistency::Quorum)
        );
        assert_eq!(decide(&policy, &unavailable, 1), RetryDecision::Rethrow);
        assert_eq!(decide(&policy, &DbError::Overloaded, 0), RetryDecision::Rethrow);
        assert_eq!(
            decide(&FallthroughRetryPolicy::new(), &unavailable, 0),
            RetryDecision::Rethrow
        );
    }
}
