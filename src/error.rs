//! Error taxonomy for the runtime.
//!
//! Every failure in this crate is fatal to the whole process group: the
//! barrier protocol keeps collective state (registration serials, tag sizes,
//! exchange sizing) consistent across ranks, and there is no way to repair
//! that state locally once one rank has diverged. Errors therefore propagate
//! with `?` up to the caller, which is expected to hand them to
//! [`Transport::abort`](crate::transport::Transport::abort) so the entire
//! group terminates with the matching exit code.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, BspError>;

/// Fatal error classes of the runtime.
#[derive(Debug, Error)]
pub enum BspError {
    /// The transport could not be brought up, or the group is inconsistent
    /// (e.g. mismatched rank counts between peers).
    #[error("transport initialization failed: {0}")]
    Init(String),

    /// A communication buffer could not grow to the required size.
    #[error("out of memory growing a communication buffer ({requested} bytes requested)")]
    OutOfMemory {
        /// Size of the allocation that failed.
        requested: usize,
    },

    /// A registration operation violated the collective ordering contract:
    /// an unmatched `pop_reg`, a translation of an address that was never
    /// registered, or co-located contexts disagreeing about the registration
    /// stream.
    #[error("registration violation: {0}")]
    Registration(String),

    /// The user asked for the group to be torn down.
    #[error("aborted: {0}")]
    UserAbort(String),

    /// An internal invariant did not hold. Always a bug in the runtime or a
    /// breach of the documented usage contract.
    #[error("internal invariant violated: {0}")]
    Internal(String),

    /// An I/O failure on a networked transport.
    #[error("transport I/O failure: {0}")]
    Io(#[from] std::io::Error),
}

impl BspError {
    /// Process exit code reported through the transport abort path.
    ///
    /// The codes are stable: scripts driving a group may rely on them to
    /// distinguish setup failures from collective-usage bugs.
    pub fn exit_code(&self) -> i32 {
        match self {
            BspError::Init(_) | BspError::Io(_) => 2,
            BspError::OutOfMemory { .. } => 3,
            BspError::Registration(_) => 4,
            BspError::UserAbort(_) => 5,
            BspError::Internal(_) => 6,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_distinct_per_class() {
        let errors = [
            BspError::Init("x".into()),
            BspError::OutOfMemory { requested: 1 },
            BspError::Registration("x".into()),
            BspError::UserAbort("x".into()),
            BspError::Internal("x".into()),
        ];
        let mut codes: Vec<i32> = errors.iter().map(BspError::exit_code).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
        assert!(codes.iter().all(|&c| c != 0));
    }
}
