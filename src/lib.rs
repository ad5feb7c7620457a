//! Device-side AMQP 1.0 messaging core for Azure IoT Hub.
//!
//! Two layered components (see [`amqp`] and [`twin`]):
//!
//! - [`amqp::AmqpMessenger`] owns one sender link and an optional receiver
//!   link on a caller-supplied AMQP session, with a FIFO send queue and
//!   enqueue-time timeouts.
//! - [`twin::TwinMessenger`] wraps an `AmqpMessenger` configured for the
//!   device-twin link, adding correlation-id tracking for outstanding
//!   requests and the desired-properties subscription state machine.
//!
//! Neither component owns the TCP connection, TLS, SASL, or CBS token
//! renewal: the host opens a [`fe2o3_amqp::Connection`] and begins a
//! [`fe2o3_amqp::Session`] on it, then hands the session in through
//! [`amqp::AmqpMessenger::start`] / [`twin::TwinMessenger::start`].
//!
//! Everything here is driven by a single cooperative `do_work` tick; there
//! is no internal locking and no thread-safety story beyond what
//! [`std::sync::Arc`]/[`std::sync::Mutex`] is used for internally to satisfy
//! callback ownership (see [`twin`] module docs).

#![deny(unsafe_code)]

pub mod amqp;
pub mod error;
pub mod options;
pub mod session;
pub mod state;
pub mod twin;

pub use error::{Error, ReportError, ReportResult, SendResult};
pub use options::{OptionValue, Options};
pub use session::AmqpSession;
pub use state::{AmqpLinkState, MessengerState, StateChangeSink, TwinState};
