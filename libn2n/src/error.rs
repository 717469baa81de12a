use thiserror::Error;

use crate::process::ProcessKind;

/// Why a connect attempt ended.
///
/// Failures never reach the host application; the supervisor logs them,
/// tears the attempt down and retries after the backoff interval.
#[derive(Debug, Error)]
pub enum Failure {
    #[error("interface {interface} did not appear after {polls} polls")]
    InterfaceTimeout { interface: String, polls: u32 },

    #[error("no stable IPv4 address on {interface} after {polls} polls")]
    AddressTimeout { interface: String, polls: u32 },

    #[error("{kind} process exited unexpectedly ({status})")]
    ProcessExitedEarly { kind: ProcessKind, status: String },

    #[error("up callback rejected the connection: {0}")]
    UpCallbackRejected(String),

    #[error("failed to launch {kind}: {reason}")]
    SpawnFailed { kind: ProcessKind, reason: String },
}
