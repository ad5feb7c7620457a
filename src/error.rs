//! Error types for the messaging core.

/// Errors returned directly from public entry points.
///
/// Per-delivery and per-twin-operation failures are never surfaced here once
/// the submitting call has accepted the work — see [`crate::amqp::SendResult`]
/// and [`crate::twin::ReportResult`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A required argument was missing or null (e.g. an empty message body,
    /// a `None` completion callback).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A config field required by `create` was missing or empty.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The operation is not valid in the instance's current state (e.g.
    /// `start` while not Stopped, `send_message_disposition` with no
    /// receiver).
    #[error("invalid state: {0}")]
    BadState(String),

    /// A resource could not be allocated.
    #[error("allocation failed")]
    AllocationFailed,

    /// The link or transport rejected an operation outright (not a
    /// per-delivery failure, which is reported through a completion
    /// callback instead).
    #[error("send failed: {0}")]
    SendFailed(String),

    /// The instance has entered an unrecoverable state: a link state-change
    /// timeout was reached, a link reported an unrecoverable state, or the
    /// consecutive send-error count reached its limit.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl Error {
    pub(crate) fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    pub(crate) fn bad_state(msg: impl Into<String>) -> Self {
        Self::BadState(msg.into())
    }
}

/// Result of a previously-enqueued `send_async` call, delivered exactly once
/// to the caller-supplied completion closure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendResult {
    /// The delivery was accepted by the remote peer.
    Ok,
    /// The link rejected the delivery, or the underlying transport reported
    /// a non-terminal outcome (Rejected/Released/Modified).
    FailSending,
    /// The message's enqueue age exceeded the configured timeout before it
    /// could be sent.
    Timeout,
    /// The owning messenger was stopped or destroyed before the message
    /// could be sent.
    Cancelled,
}

/// Result of a `report_state_async` (twin PATCH) call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportResult {
    /// The service acknowledged the PATCH with the given status code.
    Success(u32),
    /// The PATCH failed.
    Error(ReportError),
}

/// The reason a twin PATCH failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportError {
    /// The response carried no status code.
    InvalidResponse,
    /// The underlying AMQP send failed.
    FailSending,
    /// The owning twin messenger was stopped or destroyed.
    Cancelled,
}
