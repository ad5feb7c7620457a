//! The AMQP Messenger (spec §4.1): owns one sender link and an optional
//! receiver link bound to a single session, and drives their lifecycle from
//! `do_work`.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use bytes::Bytes;
use fe2o3_amqp::link::delivery::Delivery;
use fe2o3_amqp::link::{ReceiverAttachError, SenderAttachError};
use fe2o3_amqp::{Receiver, Sender};
use fe2o3_amqp_types::definitions::DeliveryTag;
use fe2o3_amqp_types::messaging::{Data, Message};
use futures_util::FutureExt;
use log::{debug, error, warn};
use tokio::task::JoinHandle;

use crate::amqp::disposition::{outcome_to_delivery_state, DispositionOutcome, MessageDisposition};
use crate::amqp::link::{
    build_address, encode_attach_properties, generate_link_name, messaging_source, messaging_target,
    LinkConfig, RECEIVER_MAX_MESSAGE_SIZE, SENDER_MAX_MESSAGE_SIZE,
};
use crate::amqp::send_queue::{SendCompletion, SendQueue};
use crate::error::{Error, SendResult};
use crate::options::{OptionValue, Options, AMQP_EVENT_SEND_TIMEOUT_SECS};
use crate::session::AmqpSession;
use crate::state::{notify_if_changed, AmqpLinkState, MessengerState, StateChangeSink};

/// Time a link may spend in [`AmqpLinkState::Opening`] before the messenger
/// declares [`MessengerState::Error`] (spec §4.1 state table).
pub const MAX_SENDER_STATE_CHANGE_TIMEOUT: Duration = Duration::from_secs(300);
/// Receiver counterpart of [`MAX_SENDER_STATE_CHANGE_TIMEOUT`].
pub const MAX_RECEIVER_STATE_CHANGE_TIMEOUT: Duration = Duration::from_secs(300);
/// Consecutive send failures that push the messenger to Error (spec §4.1
/// step 7).
pub const DEFAULT_MAX_SEND_ERROR_COUNT: u32 = 10;

/// Busy/idle projection of the send queue (spec §4.1 `get_send_status`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// The send queue is empty.
    Idle,
    /// At least one message is pending or in progress.
    Busy,
}

/// Validated, immutable configuration for one [`AmqpMessenger`] (spec §3 "AM
/// config").
#[derive(Debug, Clone)]
pub struct MessengerConfig {
    pub client_version: String,
    pub device_id: String,
    pub host_fqdn: String,
    pub send_link: LinkConfig,
    pub recv_link: LinkConfig,
}

impl MessengerConfig {
    /// Validates that every required field is present (spec §4.1 `create`).
    pub fn new(
        client_version: impl Into<String>,
        device_id: impl Into<String>,
        host_fqdn: impl Into<String>,
        send_link: LinkConfig,
        recv_link: LinkConfig,
    ) -> Result<Self, Error> {
        let client_version = client_version.into();
        let device_id = device_id.into();
        let host_fqdn = host_fqdn.into();
        if client_version.trim().is_empty() {
            return Err(Error::invalid_config("client_version is required"));
        }
        if device_id.trim().is_empty() {
            return Err(Error::invalid_config("device_id is required"));
        }
        if host_fqdn.trim().is_empty() {
            return Err(Error::invalid_config("host_fqdn is required"));
        }
        send_link.require_non_empty("send_link.suffix")?;
        recv_link.require_non_empty("recv_link.suffix")?;
        Ok(Self { client_version, device_id, host_fqdn, send_link, recv_link })
    }
}

struct LinkSlot<L> {
    link: Option<L>,
    state: AmqpLinkState,
    state_since: Instant,
}

impl<L> LinkSlot<L> {
    fn new() -> Self {
        Self { link: None, state: AmqpLinkState::Idle, state_since: Instant::now() }
    }

    fn set_state(&mut self, state: AmqpLinkState) {
        self.state = state;
        self.state_since = Instant::now();
    }
}

/// The intent returned by a receive callback for a freshly dispatched
/// delivery (spec §4.1 "Receive path").
pub type ReceiveCallback =
    Box<dyn FnMut(Message<Data>, MessageDisposition) -> Option<DispositionOutcome> + Send>;

/// Owns one sender link and an optional receiver link over a caller-supplied
/// AMQP session (spec §4.1, §2 "AM").
pub struct AmqpMessenger {
    config: MessengerConfig,
    session: Option<AmqpSession>,

    sender: LinkSlot<Sender>,
    receiver: LinkSlot<Receiver>,
    /// The in-flight sender attach, run on a spawned task so `do_work` never
    /// awaits it directly (spec §5 "Suspension points: None"). Polled
    /// non-blockingly each tick; `observe_link_states`'s elapsed-time check
    /// is what actually detects a stuck attach, since the `Opening` state
    /// now stays observable across ticks instead of being resolved inside
    /// one blocking call.
    sender_attach: Option<JoinHandle<(AmqpSession, Result<Sender, SenderAttachError>)>>,
    /// Receiver counterpart of `sender_attach`.
    receiver_attach: Option<JoinHandle<(AmqpSession, Result<Receiver, ReceiverAttachError>)>>,

    send_queue: SendQueue,
    consecutive_send_errors: u32,
    max_send_error_count: u32,

    state: MessengerState,
    state_sink: Option<StateChangeSink<MessengerState>>,

    receive_callback: Option<ReceiveCallback>,
    /// Deliveries handed to the caller but not yet settled, keyed by the tag
    /// copied into the [`MessageDisposition`] the caller is holding. The
    /// library's `Delivery` must still be held somewhere to settle it later,
    /// so the messenger keeps it here rather than asking the caller to
    /// (spec §9 "Disposition handles": the tuple is what callers see, not
    /// what the library needs).
    held_deliveries: HashMap<DeliveryTag, Delivery<Data>>,
    /// Synchronous disposition intents returned by the receive callback,
    /// waiting to actually be sent to the link. `now_or_never()` only tells
    /// us whether the accept/reject/release future happened to resolve on
    /// its first poll; it is not a substitute for awaiting it. A delivery
    /// stays in `held_deliveries` until its settlement genuinely completes,
    /// so an intent that isn't ready yet is retried next tick instead of
    /// being silently dropped.
    pending_dispositions: VecDeque<(DeliveryTag, DispositionOutcome)>,

    options: Options,
}

impl AmqpMessenger {
    /// Creates a new messenger in state [`MessengerState::Stopped`] (spec
    /// §4.1 `create`).
    pub fn new(config: MessengerConfig) -> Self {
        let mut options = Options::new();
        options.set(
            AMQP_EVENT_SEND_TIMEOUT_SECS,
            OptionValue::Size(crate::amqp::send_queue::DEFAULT_MAX_ENQUEUED_TIME_SECS),
        );
        Self {
            config,
            session: None,
            sender: LinkSlot::new(),
            receiver: LinkSlot::new(),
            sender_attach: None,
            receiver_attach: None,
            send_queue: SendQueue::new(),
            consecutive_send_errors: 0,
            max_send_error_count: DEFAULT_MAX_SEND_ERROR_COUNT,
            state: MessengerState::Stopped,
            state_sink: None,
            receive_callback: None,
            held_deliveries: HashMap::new(),
            pending_dispositions: VecDeque::new(),
            options,
        }
    }

    /// Registers the sink invoked on every observable state transition
    /// (spec I5).
    pub fn on_state_change(&mut self, sink: StateChangeSink<MessengerState>) {
        self.state_sink = Some(sink);
    }

    pub fn state(&self) -> MessengerState {
        self.state
    }

    fn set_state(&mut self, new: MessengerState) {
        let previous = self.state;
        self.state = new;
        notify_if_changed(&mut self.state_sink, previous, new);
    }

    /// Requires [`MessengerState::Stopped`] (spec §4.1 `start`).
    pub fn start(&mut self, session: AmqpSession) -> Result<(), Error> {
        if self.state != MessengerState::Stopped {
            return Err(Error::bad_state("start requires Stopped"));
        }
        self.session = Some(session);
        self.set_state(MessengerState::Starting);
        Ok(())
    }

    /// Tears down both links and requeues in-flight sends (spec §4.1
    /// `stop`).
    pub async fn stop(&mut self) -> Result<(), Error> {
        if self.state == MessengerState::Stopped {
            return Err(Error::bad_state("stop requires a non-Stopped state"));
        }
        self.set_state(MessengerState::Stopping);

        if let Some(handle) = self.sender_attach.take() {
            handle.abort();
        }
        if let Some(handle) = self.receiver_attach.take() {
            handle.abort();
        }
        self.pending_dispositions.clear();

        let mut failed = false;
        if let Some(sender) = self.sender.link.take() {
            if sender.close().await.is_err() {
                failed = true;
            }
        }
        self.sender.set_state(AmqpLinkState::Idle);

        if let Some(receiver) = self.receiver.link.take() {
            if receiver.close().await.is_err() {
                failed = true;
            }
        }
        self.receiver.set_state(AmqpLinkState::Idle);
        self.held_deliveries.clear();

        self.send_queue.move_all_back_to_pending();
        self.session = None;

        if failed {
            self.set_state(MessengerState::Error);
            return Ok(());
        }
        self.set_state(MessengerState::Stopped);
        Ok(())
    }

    /// Enqueues a plain telemetry body for sending; `on_complete` fires
    /// exactly once (spec §4.1 `send_async`). Use [`Self::send_message_async`]
    /// to send a message with custom properties or annotations (the twin
    /// layer needs this).
    ///
    /// Fails without enqueuing if `on_complete` is `None` (spec §8 boundary
    /// property: a null completion callback fails rather than being
    /// silently accepted).
    pub fn send_async(&mut self, body: Bytes, on_complete: Option<SendCompletion>) -> Result<(), Error> {
        let Some(on_complete) = on_complete else {
            return Err(Error::InvalidArgument("send_async requires a completion callback".to_string()));
        };
        let message = Message::builder().data(Data(body)).build();
        self.send_message_async(message, on_complete);
        Ok(())
    }

    /// Enqueues a fully-formed message for sending (spec §4.1 `send_async`,
    /// generalized beyond a raw byte body so the twin envelope's
    /// correlation-id and annotations survive the trip through the queue).
    /// Every caller in this crate already has a completion to supply, so
    /// unlike [`Self::send_async`] there is no `None` case to validate.
    pub(crate) fn send_message_async(&mut self, message: Message<Data>, on_complete: SendCompletion) {
        self.send_queue.add(message, Some(on_complete));
    }

    pub fn send_status(&self) -> SendStatus {
        if self.send_queue.is_empty() {
            SendStatus::Idle
        } else {
            SendStatus::Busy
        }
    }

    /// Records the receive callback; the receiver link is created lazily on
    /// the next `do_work` tick (spec §4.1 `subscribe_for_messages`).
    pub fn subscribe_for_messages(&mut self, callback: ReceiveCallback) {
        self.receive_callback = Some(callback);
    }

    /// Clears the receive callback; the receiver link is torn down on the
    /// next tick (spec §4.1 `unsubscribe_for_messages`).
    pub fn unsubscribe_for_messages(&mut self) {
        self.receive_callback = None;
    }

    /// Settles a previously dispatched delivery (spec §4.1
    /// `send_message_disposition`). `outcome = None` is a no-op, matching
    /// the spec's "caller will settle later" path.
    pub async fn send_message_disposition(
        &mut self,
        disposition: MessageDisposition,
        outcome: Option<DispositionOutcome>,
    ) -> Result<(), Error> {
        let Some(receiver) = self.receiver.link.as_mut() else {
            return Err(Error::bad_state("send_message_disposition requires an active receiver"));
        };
        let Some(outcome) = outcome else {
            return Ok(());
        };
        let Some(delivery) = self.held_deliveries.remove(&disposition.delivery_tag) else {
            return Err(Error::bad_state("disposition handle does not reference a live delivery"));
        };
        let result = match outcome {
            DispositionOutcome::Accepted => receiver.accept(&delivery).await,
            DispositionOutcome::Released => receiver.release(&delivery).await,
            DispositionOutcome::Rejected => {
                let error = match outcome_to_delivery_state(DispositionOutcome::Rejected) {
                    fe2o3_amqp_types::messaging::DeliveryState::Rejected(r) => r.error,
                    _ => None,
                };
                receiver.reject(&delivery, error).await
            }
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                // Settlement didn't happen: put the delivery back so the
                // caller can retry the disposition instead of losing it.
                self.held_deliveries.insert(disposition.delivery_tag, delivery);
                Err(Error::SendFailed(format!("disposition failed: {e}")))
            }
        }
    }

    /// Tears down the messenger if needed, then frees the queue (spec §4.1
    /// `destroy`).
    pub async fn destroy(mut self) {
        if self.state != MessengerState::Stopped {
            let _ = self.stop().await;
        }
        self.send_queue.cancel_all();
    }

    pub fn set_option(&mut self, name: &str, value: OptionValue) -> Result<(), Error> {
        match name {
            AMQP_EVENT_SEND_TIMEOUT_SECS => {
                let secs = value.as_size().ok_or_else(|| Error::invalid_config("expected a size value"))?;
                self.send_queue.set_max_enqueued_time_secs(secs);
                self.options.set(name, value);
                Ok(())
            }
            other => Err(Error::InvalidArgument(format!("unrecognized option {other:?}"))),
        }
    }

    pub fn retrieve_options(&self) -> Options {
        let mut options = self.options.clone();
        options.set(
            AMQP_EVENT_SEND_TIMEOUT_SECS,
            OptionValue::Size(self.send_queue.max_enqueued_time_secs()),
        );
        options
    }

    /// Advances link creation/teardown, drains the send queue, and sweeps
    /// for timeouts (spec §4.1 "Tick semantics", the seven numbered steps).
    pub async fn do_work(&mut self) {
        self.observe_link_states();

        match self.state {
            MessengerState::Starting => self.poll_sender_attach(),
            MessengerState::Started => {
                if self.receive_callback.is_some() && self.receiver.link.is_none() {
                    self.poll_receiver_attach();
                } else if self.receive_callback.is_none() && self.receiver.link.is_some() {
                    self.close_receiver().await;
                }
                self.poll_inbound_deliveries();
                self.drive_pending_dispositions();
            }
            MessengerState::Stopping | MessengerState::Stopped | MessengerState::Error => {}
        }

        self.drive_send_queue().await;
        self.sweep_timeouts();
        if self.consecutive_send_errors >= self.max_send_error_count {
            error!("consecutive send errors reached {}", self.max_send_error_count);
            self.set_state(MessengerState::Error);
        }
    }

    fn observe_link_states(&mut self) {
        if self.state == MessengerState::Starting && self.sender.state == AmqpLinkState::Opening {
            if self.sender.state_since.elapsed() > MAX_SENDER_STATE_CHANGE_TIMEOUT {
                warn!("sender attach exceeded {MAX_SENDER_STATE_CHANGE_TIMEOUT:?}");
                self.sender.set_state(AmqpLinkState::Error);
                self.set_state(MessengerState::Error);
            }
        }
        if self.state == MessengerState::Started {
            if let Some(sender) = self.sender.link.as_mut() {
                if sender.on_detach().now_or_never().is_some() {
                    warn!("sender link detached unexpectedly");
                    self.sender.set_state(AmqpLinkState::Error);
                    self.set_state(MessengerState::Error);
                }
            }
            if self.receiver.state == AmqpLinkState::Opening
                && self.receiver.state_since.elapsed() > MAX_RECEIVER_STATE_CHANGE_TIMEOUT
            {
                warn!("receiver attach exceeded {MAX_RECEIVER_STATE_CHANGE_TIMEOUT:?}");
                self.receiver.set_state(AmqpLinkState::Error);
                self.set_state(MessengerState::Error);
            }
            if let Some(receiver) = self.receiver.link.as_mut() {
                if receiver.on_detach().now_or_never().is_some() {
                    warn!("receiver link detached unexpectedly");
                    self.receiver.set_state(AmqpLinkState::Error);
                }
            }
        }
    }

    /// Non-blocking sender attach (spec §5 "Suspension points: None").
    /// Either polls an attach already in flight, or starts one on a spawned
    /// task and returns immediately; `observe_link_states` is what notices
    /// if the attach sits in `Opening` too long.
    fn poll_sender_attach(&mut self) {
        if let Some(handle) = self.sender_attach.as_mut() {
            let Some(join_result) = handle.now_or_never() else {
                return;
            };
            self.sender_attach = None;
            match join_result {
                Ok((session, Ok(sender))) => {
                    self.session = Some(session);
                    self.sender.link = Some(sender);
                    self.sender.set_state(AmqpLinkState::Open);
                    self.set_state(MessengerState::Started);
                }
                Ok((session, Err(e))) => {
                    self.session = Some(session);
                    error!("sender attach failed: {e}");
                    self.sender.set_state(AmqpLinkState::Error);
                    self.set_state(MessengerState::Error);
                }
                Err(join_err) => {
                    error!("sender attach task failed: {join_err}");
                    self.sender.set_state(AmqpLinkState::Error);
                    self.receiver.set_state(AmqpLinkState::Error);
                    self.set_state(MessengerState::Error);
                }
            }
            return;
        }
        if self.sender.link.is_some() {
            return;
        }
        let Some(mut session) = self.session.take() else {
            return;
        };
        self.sender.set_state(AmqpLinkState::Opening);
        let link_name = generate_link_name("snd", &self.config.device_id);
        let target_addr = match build_address(
            &self.config.host_fqdn,
            &self.config.device_id,
            &self.config.send_link.suffix,
        ) {
            Ok(addr) => addr,
            Err(e) => {
                error!("bad sender address: {e}");
                self.session = Some(session);
                self.sender.set_state(AmqpLinkState::Error);
                self.set_state(MessengerState::Error);
                return;
            }
        };
        let source = messaging_source(format!("{link_name}-source"));
        let target = messaging_target(target_addr.to_string());

        let mut builder = Sender::builder()
            .name(link_name)
            .source(source)
            .target(target)
            .sender_settle_mode(self.config.send_link.sender_settle_mode)
            .max_message_size(SENDER_MAX_MESSAGE_SIZE);
        if let Some(props) = &self.config.send_link.attach_properties {
            builder = builder.properties(encode_attach_properties(props));
        }

        self.sender_attach = Some(tokio::spawn(async move {
            let result = builder.attach(&mut session.handle).await;
            (session, result)
        }));
    }

    /// Non-blocking receiver attach, analogous to [`Self::poll_sender_attach`].
    /// An ordinary attach failure is not fatal to the messenger as a whole
    /// (spec §4.1 step 3: log and retry next tick); only a panicked attach
    /// task (the session is gone) is, since the sender is lost along with it.
    fn poll_receiver_attach(&mut self) {
        if let Some(handle) = self.receiver_attach.as_mut() {
            let Some(join_result) = handle.now_or_never() else {
                return;
            };
            self.receiver_attach = None;
            match join_result {
                Ok((session, Ok(receiver))) => {
                    self.session = Some(session);
                    self.receiver.link = Some(receiver);
                    self.receiver.set_state(AmqpLinkState::Open);
                }
                Ok((session, Err(e))) => {
                    self.session = Some(session);
                    debug!("receiver attach failed, will retry: {e}");
                    self.receiver.set_state(AmqpLinkState::Idle);
                }
                Err(join_err) => {
                    error!("receiver attach task failed: {join_err}");
                    self.sender.set_state(AmqpLinkState::Error);
                    self.receiver.set_state(AmqpLinkState::Error);
                    self.set_state(MessengerState::Error);
                }
            }
            return;
        }
        if self.receiver.link.is_some() {
            return;
        }
        let Some(mut session) = self.session.take() else {
            return;
        };
        self.receiver.set_state(AmqpLinkState::Opening);
        let link_name = generate_link_name("rcv", &self.config.device_id);
        let source_addr = match build_address(
            &self.config.host_fqdn,
            &self.config.device_id,
            &self.config.recv_link.suffix,
        ) {
            Ok(addr) => addr,
            Err(e) => {
                error!("bad receiver address: {e}");
                self.session = Some(session);
                self.receiver.set_state(AmqpLinkState::Error);
                return;
            }
        };
        let source = messaging_source(source_addr.to_string());
        let target = messaging_target(format!("{link_name}-target"));

        let mut builder = Receiver::builder()
            .name(link_name)
            .source(source)
            .target(target)
            .receiver_settle_mode(self.config.recv_link.receiver_settle_mode)
            .max_message_size(RECEIVER_MAX_MESSAGE_SIZE);
        if let Some(props) = &self.config.recv_link.attach_properties {
            builder = builder.properties(encode_attach_properties(props));
        }

        self.receiver_attach = Some(tokio::spawn(async move {
            let result = builder.attach(&mut session.handle).await;
            (session, result)
        }));
    }

    async fn close_receiver(&mut self) {
        if let Some(receiver) = self.receiver.link.take() {
            let _ = receiver.close().await;
        }
        self.receiver.set_state(AmqpLinkState::Idle);
        self.held_deliveries.clear();
    }

    fn poll_inbound_deliveries(&mut self) {
        let Some(receiver) = self.receiver.link.as_mut() else {
            return;
        };
        let link_name = receiver.name().to_string();
        while let Some(outcome) = receiver.recv::<Data>().now_or_never() {
            let delivery = match outcome {
                Ok(delivery) => delivery,
                Err(e) => {
                    debug!("receiver recv error: {e}");
                    break;
                }
            };
            let disposition =
                MessageDisposition::new(delivery.delivery_id, delivery.delivery_tag.clone(), link_name.clone());
            let tag = disposition.delivery_tag.clone();
            let message = delivery.message.clone();
            self.held_deliveries.insert(tag.clone(), delivery);

            let intent = match self.receive_callback.as_mut() {
                Some(cb) => cb(message, disposition),
                None => Some(DispositionOutcome::Released),
            };

            // The delivery stays in `held_deliveries`; only queue the intent
            // here. `drive_pending_dispositions` is what actually sends the
            // disposition frame and removes the delivery, once settlement
            // genuinely completes.
            if let Some(intent) = intent {
                self.pending_dispositions.push_back((tag, intent));
            }
        }
    }

    /// Attempts to settle queued disposition intents (spec §4.1 receive
    /// path). `now_or_never()` only detects whether the accept/reject/release
    /// future happened to resolve on this poll; an intent that isn't ready
    /// yet stays at the front of the queue and is retried next tick, so a
    /// delivery is never dropped before it is actually settled.
    fn drive_pending_dispositions(&mut self) {
        let Some(receiver) = self.receiver.link.as_mut() else {
            return;
        };
        while let Some((tag, intent)) = self.pending_dispositions.front() {
            let tag = tag.clone();
            let intent = *intent;
            let Some(held) = self.held_deliveries.get(&tag) else {
                // Delivery vanished (e.g. receiver torn down mid-flight); drop the intent.
                self.pending_dispositions.pop_front();
                continue;
            };
            let settled = match intent {
                DispositionOutcome::Accepted => receiver.accept(held).now_or_never(),
                DispositionOutcome::Released => receiver.release(held).now_or_never(),
                DispositionOutcome::Rejected => {
                    let error = match outcome_to_delivery_state(DispositionOutcome::Rejected) {
                        fe2o3_amqp_types::messaging::DeliveryState::Rejected(r) => r.error,
                        _ => None,
                    };
                    receiver.reject(held, error).now_or_never()
                }
            };
            match settled {
                Some(Ok(())) => {
                    self.held_deliveries.remove(&tag);
                    self.pending_dispositions.pop_front();
                }
                Some(Err(e)) => {
                    warn!("disposition settlement failed, dropping delivery: {e}");
                    self.held_deliveries.remove(&tag);
                    self.pending_dispositions.pop_front();
                }
                None => break,
            }
        }
    }

    async fn drive_send_queue(&mut self) {
        if self.sender.state != AmqpLinkState::Open {
            return;
        }
        let Some(sender) = self.sender.link.as_mut() else {
            return;
        };
        let Some(queued) = self.send_queue.promote_next() else {
            return;
        };
        let sendable = fe2o3_amqp::link::delivery::Sendable::builder()
            .message(queued.message.clone())
            .build();
        match sender.send(sendable).await {
            Ok(_outcome) => {
                self.consecutive_send_errors = 0;
                self.send_queue.complete_head(SendResult::Ok);
            }
            Err(e) => {
                warn!("send failed: {e}");
                self.consecutive_send_errors += 1;
                self.send_queue.complete_head(SendResult::FailSending);
            }
        }
    }

    fn sweep_timeouts(&mut self) {
        let n = self.send_queue.sweep_timeouts(Instant::now());
        if n > 0 {
            debug!("{n} message(s) timed out waiting to send");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> MessengerConfig {
        MessengerConfig::new(
            "test-client/1.0",
            "dev-1",
            "h.example",
            LinkConfig::new("messages/events"),
            LinkConfig::new("messages/devicebound"),
        )
        .unwrap()
    }

    #[test]
    fn create_starts_stopped_and_idle() {
        let messenger = AmqpMessenger::new(test_config());
        assert_eq!(messenger.state(), MessengerState::Stopped);
        assert_eq!(messenger.send_status(), SendStatus::Idle);
    }

    #[test]
    fn send_async_makes_status_busy_immediately() {
        let mut messenger = AmqpMessenger::new(test_config());
        messenger.send_async(Bytes::from_static(b"hello"), Some(Box::new(|_| {}))).unwrap();
        assert_eq!(messenger.send_status(), SendStatus::Busy);
    }

    /// Spec §8 boundary property: a `None` completion callback fails without
    /// enqueuing.
    #[test]
    fn send_async_with_no_completion_fails_without_enqueuing() {
        let mut messenger = AmqpMessenger::new(test_config());
        let result = messenger.send_async(Bytes::from_static(b"hello"), None);
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
        assert_eq!(messenger.send_status(), SendStatus::Idle);
    }

    /// Three sends complete in the order they were submitted, carrying their
    /// own result through to their own callback (FIFO, not just FIFO count).
    #[tokio::test]
    async fn three_sends_complete_in_fifo_order_with_distinct_results() {
        use std::sync::{Arc, Mutex};

        let mut messenger = AmqpMessenger::new(test_config());
        let completions: Arc<Mutex<Vec<(u8, SendResult)>>> = Arc::new(Mutex::new(Vec::new()));

        for id in [1u8, 2, 3] {
            let completions = completions.clone();
            messenger
                .send_async(
                    Bytes::from(vec![id]),
                    Some(Box::new(move |result| completions.lock().unwrap().push((id, result)))),
                )
                .unwrap();
        }
        assert_eq!(messenger.send_status(), SendStatus::Busy);

        for _ in 0..3 {
            messenger.send_queue.promote_next();
            messenger.send_queue.complete_head(SendResult::Ok);
        }

        assert_eq!(
            completions.lock().unwrap().as_slice(),
            [(1, SendResult::Ok), (2, SendResult::Ok), (3, SendResult::Ok)]
        );
        assert_eq!(messenger.send_status(), SendStatus::Idle);
    }

    /// Spec §4.1 step 7: reaching the consecutive-send-error threshold
    /// transitions the messenger to Error on the next tick.
    #[tokio::test]
    async fn consecutive_send_errors_reaches_max_transitions_to_error() {
        let mut messenger = AmqpMessenger::new(test_config());
        messenger.consecutive_send_errors = DEFAULT_MAX_SEND_ERROR_COUNT;
        messenger.do_work().await;
        assert_eq!(messenger.state(), MessengerState::Error);
    }

    #[tokio::test]
    async fn stop_requires_a_non_stopped_state() {
        let mut messenger = AmqpMessenger::new(test_config());
        let result = messenger.stop().await;
        assert!(matches!(result, Err(Error::BadState(_))));
    }

    #[test]
    fn set_option_round_trips_send_timeout() {
        let mut messenger = AmqpMessenger::new(test_config());
        messenger.set_option(AMQP_EVENT_SEND_TIMEOUT_SECS, OptionValue::Size(42)).unwrap();
        let options = messenger.retrieve_options();
        assert_eq!(options.get(AMQP_EVENT_SEND_TIMEOUT_SECS).and_then(OptionValue::as_size), Some(42));
    }

    #[test]
    fn set_option_rejects_unknown_names() {
        let mut messenger = AmqpMessenger::new(test_config());
        assert!(messenger.set_option("not_a_real_option", OptionValue::Size(1)).is_err());
    }
}
