//! The tagged state types for the AMQP messenger and the twin messenger.
//!
//! Kept as two explicit types rather than collapsed onto the underlying
//! AMQP library's link/sender/receiver states (see DESIGN.md, "State-machine
//! duplication").

/// Observed lifecycle state of a `fe2o3-amqp` sender or receiver link, as
/// tracked by [`crate::amqp::AmqpMessenger`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmqpLinkState {
    /// No attach has been attempted yet.
    Idle,
    /// Attach is in flight.
    Opening,
    /// The link is attached and usable.
    Open,
    /// A detach is in flight.
    Closing,
    /// The link reported an error, or an attach/detach failed.
    Error,
}

/// Top-level state of an [`crate::amqp::AmqpMessenger`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessengerState {
    /// `start` has been called; waiting for the sender to open.
    Starting,
    /// The sender link is open and the messenger is usable.
    Started,
    /// `stop` is in progress.
    Stopping,
    /// Not started, or fully stopped.
    Stopped,
    /// Unrecoverable failure.
    Error,
}

/// Top-level state of a [`crate::twin::TwinMessenger`], projected from its
/// embedded [`MessengerState`] (see spec §4.3 "Construction").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TwinState {
    /// Mirrors [`MessengerState::Stopped`].
    Stopped,
    /// Mirrors [`MessengerState::Stopping`].
    Stopping,
    /// Mirrors [`MessengerState::Starting`].
    Starting,
    /// Mirrors [`MessengerState::Started`].
    Started,
    /// Mirrors [`MessengerState::Error`].
    Error,
}

pub(crate) fn project_messenger_state(state: MessengerState) -> TwinState {
    match state {
        MessengerState::Starting => TwinState::Starting,
        MessengerState::Started => TwinState::Started,
        MessengerState::Stopping => TwinState::Stopping,
        MessengerState::Stopped => TwinState::Stopped,
        MessengerState::Error => TwinState::Error,
    }
}

/// Invoked whenever a messenger's observable state changes (I5: at most once
/// per transition, and only when `new != previous`).
pub type StateChangeSink<S> = Box<dyn FnMut(S, S) + Send>;

/// Fires `sink(new, previous)` iff they differ, matching invariant I5.
pub(crate) fn notify_if_changed<S: PartialEq + Copy>(
    sink: &mut Option<StateChangeSink<S>>,
    previous: S,
    new: S,
) {
    if previous != new {
        if let Some(sink) = sink.as_mut() {
            sink(new, previous);
        }
    }
}
