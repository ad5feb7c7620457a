//! The host-supplied AMQP session, passed into `start`.

use fe2o3_amqp::session::SessionHandle;

/// A thin wrapper around a `fe2o3-amqp` session handle.
///
/// The messaging core never owns the connection or session: the host opens
/// the `fe2o3_amqp::Connection`, begins a `fe2o3_amqp::Session` on it
/// (handling TLS, SASL and CBS token renewal itself), and hands the
/// resulting handle in through [`crate::amqp::AmqpMessenger::start`] /
/// [`crate::twin::TwinMessenger::start`].
pub struct AmqpSession {
    pub(crate) handle: SessionHandle<()>,
}

impl AmqpSession {
    /// Wrap an already-begun session handle.
    pub fn new(handle: SessionHandle<()>) -> Self {
        Self { handle }
    }
}

impl std::fmt::Debug for AmqpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmqpSession").finish_non_exhaustive()
    }
}
