//! The Twin Messenger (spec §2, §4.3): a request/response layer for device
//! twin PATCH/GET/PUT/DELETE, built on an embedded [`AmqpMessenger`].

pub mod envelope;
pub mod subscription;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use fe2o3_amqp_types::messaging::{Data, Message};
use log::debug;
use uuid::Uuid;

use crate::amqp::disposition::DispositionOutcome;
use crate::amqp::link::LinkConfig;
use crate::amqp::messenger::{AmqpMessenger, MessengerConfig, SendStatus};
use crate::error::{Error, ReportError, ReportResult, SendResult};
use crate::options::Options;
use crate::session::AmqpSession;
use crate::state::{notify_if_changed, project_messenger_state, MessengerState, StateChangeSink, TwinState};

use envelope::{build_request, parse_response, status_is_success, TwinRequestKind};
use subscription::{SubscriptionEvent, SubscriptionMachine};

const TWIN_LINK_SUFFIX: &str = "twin/";
const TWIN_API_VERSION: &str = "2016-11-14";

/// Fires once with the outcome of a `report_state_async` call (spec §4.3
/// "Response correlation").
pub type ReportCompletion = Box<dyn FnOnce(ReportResult) + Send>;
/// Fires for every desired-property delivery, complete or partial (spec
/// §4.3).
pub type TwinUpdateCallback = Box<dyn FnMut(TwinUpdate) + Send>;

/// A desired-properties delivery handed to the caller's update callback.
#[derive(Debug, Clone)]
pub enum TwinUpdate {
    /// The full twin document, from a GET response.
    Complete(Bytes),
    /// An unsolicited desired-property delta.
    Partial(Bytes),
}

/// The business type of a twin operation table entry (spec §3 "Twin
/// operation"). A closed enum rather than a loosely-typed counter, so that
/// counting outstanding PATCH operations is a plain `matches!` filter (spec
/// §9, second Open Question).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TwinOperationKind {
    Patch,
    Get,
    Put,
    Delete,
}

impl From<TwinRequestKind> for TwinOperationKind {
    fn from(kind: TwinRequestKind) -> Self {
        match kind {
            TwinRequestKind::Patch => TwinOperationKind::Patch,
            TwinRequestKind::Get => TwinOperationKind::Get,
            TwinRequestKind::Put => TwinOperationKind::Put,
            TwinRequestKind::Delete => TwinOperationKind::Delete,
        }
    }
}

struct TwinOperation {
    kind: TwinOperationKind,
    on_complete: Option<ReportCompletion>,
}

/// State shared between [`TwinMessenger`]'s public methods and the receive
/// callback registered with the embedded AM.
///
/// The AM's receive callback must be `'static` and cannot borrow the
/// `TwinMessenger` that owns the AM (spec §9 "Callback-context ownership"),
/// so the operations table and subscription machine live behind this
/// `Arc<Mutex<_>>` instead. Both sides only ever touch it from the single
/// thread driving `do_work`, so the lock is never contended; it exists to
/// satisfy the borrow checker, not for cross-thread coordination.
struct TwinInner {
    operations: HashMap<Uuid, TwinOperation>,
    subscription: SubscriptionMachine,
    update_callback: Option<TwinUpdateCallback>,
    error_limit_reached: bool,
}

impl TwinInner {
    fn handle_inbound(&mut self, message: Message<Data>) -> Option<DispositionOutcome> {
        let response = parse_response(&message);

        let Some(correlation_id) = response.correlation_id else {
            return Some(match response.body {
                Some(body) => {
                    self.notify_update(TwinUpdate::Partial(body));
                    DispositionOutcome::Accepted
                }
                None => {
                    debug!("dropping twin message with neither correlation-id nor body");
                    DispositionOutcome::Accepted
                }
            });
        };

        let Some(op) = self.operations.remove(&correlation_id) else {
            debug!("twin response with unknown correlation-id {correlation_id}");
            return Some(DispositionOutcome::Accepted);
        };

        match op.kind {
            TwinOperationKind::Patch => {
                let result = match response.status_code {
                    Some(status) if status_is_success(status) => ReportResult::Success(status),
                    _ => ReportResult::Error(ReportError::InvalidResponse),
                };
                if let Some(on_complete) = op.on_complete {
                    on_complete(result);
                }
            }
            TwinOperationKind::Get => {
                // A missing or empty body both count as "no body" here: the
                // wire format always carries a Data section, so an empty one
                // is how a GET-without-content response shows up.
                let has_body = response.body.as_ref().is_some_and(|b| !b.is_empty());
                let delivered = response.body.clone().filter(|_| has_body).unwrap_or_default();
                self.notify_update(TwinUpdate::Complete(delivered));
                let event = self.subscription.on_get_response(has_body);
                self.record_event(event);
            }
            TwinOperationKind::Put => {
                let ok = response.status_code.map(status_is_success).unwrap_or(false);
                let event = self.subscription.on_put_response(ok);
                self.record_event(event);
            }
            TwinOperationKind::Delete => {
                let ok = response.status_code.map(status_is_success).unwrap_or(false);
                let event = self.subscription.on_delete_response(ok);
                self.record_event(event);
            }
        }

        Some(DispositionOutcome::Accepted)
    }

    fn record_event(&mut self, event: SubscriptionEvent) {
        if event == SubscriptionEvent::ErrorLimitReached {
            self.error_limit_reached = true;
        }
    }

    fn notify_update(&mut self, update: TwinUpdate) {
        if let Some(callback) = self.update_callback.as_mut() {
            callback(update);
        }
    }

    fn cancel_all(&mut self) {
        for (_, op) in self.operations.drain() {
            if let Some(on_complete) = op.on_complete {
                on_complete(ReportResult::Error(ReportError::Cancelled));
            }
        }
    }
}

/// Validated configuration for a [`TwinMessenger`] (spec §4.3
/// "Construction").
#[derive(Debug, Clone)]
pub struct TwinConfig {
    pub client_version: String,
    pub device_id: String,
    pub host_fqdn: String,
}

/// Wraps an [`AmqpMessenger`] fixed to the twin link suffixes and attach
/// properties, adding correlation tracking and the subscription state
/// machine (spec §2, §4.3).
pub struct TwinMessenger {
    am: AmqpMessenger,
    inner: Arc<Mutex<TwinInner>>,
    receive_wired: bool,
    state: TwinState,
    state_sink: Option<StateChangeSink<TwinState>>,
}

impl TwinMessenger {
    /// Builds the embedded AM with suffix `"twin/"` on both links and the
    /// three fixed attach properties (spec §4.3 "Construction").
    pub fn new(config: TwinConfig) -> Result<Self, Error> {
        let channel_correlation_id = format!("twin:{}", Uuid::new_v4());
        let mut properties = BTreeMap::new();
        properties.insert("com.microsoft:client-version".to_string(), config.client_version.clone());
        properties.insert("com.microsoft:channel-correlation-id".to_string(), channel_correlation_id);
        properties.insert("com.microsoft:api-version".to_string(), TWIN_API_VERSION.to_string());

        let mut send_link = LinkConfig::new(TWIN_LINK_SUFFIX);
        send_link.attach_properties = Some(properties.clone());
        let mut recv_link = LinkConfig::new(TWIN_LINK_SUFFIX);
        recv_link.attach_properties = Some(properties);

        let am_config = MessengerConfig::new(
            config.client_version,
            config.device_id,
            config.host_fqdn,
            send_link,
            recv_link,
        )?;

        Ok(Self {
            am: AmqpMessenger::new(am_config),
            inner: Arc::new(Mutex::new(TwinInner {
                operations: HashMap::new(),
                subscription: SubscriptionMachine::new(),
                update_callback: None,
                error_limit_reached: false,
            })),
            receive_wired: false,
            state: TwinState::Stopped,
            state_sink: None,
        })
    }

    /// Registers the sink invoked on every observable TM state transition.
    pub fn on_state_change(&mut self, sink: StateChangeSink<TwinState>) {
        self.state_sink = Some(sink);
    }

    /// Registers the callback for desired-property updates (spec §4.3
    /// `subscribe`). Does not itself start the subscription cycle; call
    /// [`Self::subscribe`] for that.
    pub fn on_update(&mut self, callback: TwinUpdateCallback) {
        self.inner.lock().expect("twin mutex poisoned").update_callback = Some(callback);
    }

    pub fn state(&self) -> TwinState {
        self.state
    }

    /// Requires the embedded AM's state to be Stopped (spec §4.3 `start`
    /// forwards to AM).
    pub fn start(&mut self, session: AmqpSession) -> Result<(), Error> {
        self.am.start(session)?;
        if !self.receive_wired {
            let inner = self.inner.clone();
            self.am.subscribe_for_messages(Box::new(move |message, _disposition| {
                inner.lock().expect("twin mutex poisoned").handle_inbound(message)
            }));
            self.receive_wired = true;
        }
        Ok(())
    }

    pub async fn stop(&mut self) -> Result<(), Error> {
        self.am.stop().await
    }

    /// Stops the AM if needed, cancels every outstanding twin operation with
    /// `Cancelled`, and clears the operations table (spec §4.3 `destroy`).
    pub async fn destroy(mut self) {
        self.inner.lock().expect("twin mutex poisoned").cancel_all();
        self.am.destroy().await;
    }

    /// Starts (or restarts) the subscribe cycle (spec §4.3 "Subscription
    /// state machine").
    pub fn subscribe(&mut self) {
        self.inner.lock().expect("twin mutex poisoned").subscription.subscribe();
    }

    /// Starts the unsubscribe cycle.
    pub fn unsubscribe(&mut self) {
        self.inner.lock().expect("twin mutex poisoned").subscription.unsubscribe();
    }

    /// Sends a PATCH with `payload` as the reported-properties body; invokes
    /// `on_complete` with the correlated response (spec §4.3
    /// `report_state_async`).
    ///
    /// Fails without enqueuing if `on_complete` is `None` (spec §8 boundary
    /// property: a null completion callback fails rather than being
    /// silently accepted).
    pub fn report_state_async(&mut self, payload: Bytes, on_complete: Option<ReportCompletion>) -> Result<(), Error> {
        let Some(on_complete) = on_complete else {
            return Err(Error::InvalidArgument("report_state_async requires a completion callback".to_string()));
        };
        let correlation_id = Uuid::new_v4();
        self.inner.lock().expect("twin mutex poisoned").operations.insert(
            correlation_id,
            TwinOperation { kind: TwinOperationKind::Patch, on_complete: Some(on_complete) },
        );
        self.send_request(TwinRequestKind::Patch, correlation_id, Some(payload));
        Ok(())
    }

    /// Busy iff the AM send queue is non-empty or a PATCH the caller
    /// submitted is still awaiting its response (spec §9, second Open
    /// Question: counts only PATCH-typed entries, not the internal
    /// subscription GET/PUT/DELETE traffic).
    pub fn send_status(&self) -> SendStatus {
        if self.am.send_status() == SendStatus::Busy {
            return SendStatus::Busy;
        }
        let has_pending_patch = self
            .inner
            .lock()
            .expect("twin mutex poisoned")
            .operations
            .values()
            .any(|op| matches!(op.kind, TwinOperationKind::Patch));
        if has_pending_patch {
            SendStatus::Busy
        } else {
            SendStatus::Idle
        }
    }

    pub fn set_option(&mut self, name: &str, value: crate::options::OptionValue) -> Result<(), Error> {
        self.am.set_option(name, value)
    }

    pub fn retrieve_options(&self) -> Options {
        self.am.retrieve_options()
    }

    /// Drives the subscription state machine, then delegates to the
    /// embedded AM's tick (spec §2 "Control flow").
    pub async fn do_work(&mut self) {
        self.drive_subscription();
        self.am.do_work().await;

        let projected = if self.inner.lock().expect("twin mutex poisoned").error_limit_reached {
            TwinState::Error
        } else {
            project_messenger_state(self.am.state())
        };
        notify_if_changed(&mut self.state_sink, self.state, projected);
        self.state = projected;
    }

    fn drive_subscription(&mut self) {
        if self.am.state() != MessengerState::Started {
            return;
        }
        let request = self.inner.lock().expect("twin mutex poisoned").subscription.next_request();
        let Some(kind) = request else {
            return;
        };
        let correlation_id = Uuid::new_v4();
        self.inner.lock().expect("twin mutex poisoned").operations.insert(
            correlation_id,
            TwinOperation { kind: kind.into(), on_complete: None },
        );
        self.send_request(kind, correlation_id, None);
    }

    fn send_request(&mut self, kind: TwinRequestKind, correlation_id: Uuid, payload: Option<Bytes>) {
        let message = build_request(kind, correlation_id, payload);
        let inner = self.inner.clone();
        self.am.send_message_async(
            message,
            Box::new(move |result| {
                if result == SendResult::Ok {
                    return;
                }
                let mut inner = inner.lock().expect("twin mutex poisoned");
                if let Some(op) = inner.operations.remove(&correlation_id) {
                    match op.kind {
                        TwinOperationKind::Patch => {
                            if let Some(on_complete) = op.on_complete {
                                let mapped = match result {
                                    SendResult::Cancelled => ReportResult::Error(ReportError::Cancelled),
                                    _ => ReportResult::Error(ReportError::FailSending),
                                };
                                on_complete(mapped);
                            }
                        }
                        TwinOperationKind::Get | TwinOperationKind::Put | TwinOperationKind::Delete => {
                            let event = inner.subscription.on_send_failed();
                            inner.record_event(event);
                        }
                    }
                }
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(correlation_id: Option<Uuid>, status: Option<u32>, body: Option<&'static [u8]>) -> Message<Data> {
        use fe2o3_amqp_types::messaging::{annotations::OwnedKey, MessageAnnotations, Properties};
        use fe2o3_amqp_types::primitives::Symbol;

        let mut builder = Message::builder();
        if let Some(id) = correlation_id {
            builder = builder.properties(Properties::builder().correlation_id(id.to_string()).build());
        }
        if let Some(status) = status {
            let mut annotations = MessageAnnotations::default();
            annotations.insert(OwnedKey::Symbol(Symbol::from("status")), status.into());
            builder = builder.message_annotations(annotations);
        }
        match body {
            Some(b) => builder.data(Data(Bytes::from_static(b))).build(),
            None => builder.data(Data(Bytes::new())).build(),
        }
    }

    fn fresh_inner() -> TwinInner {
        TwinInner {
            operations: HashMap::new(),
            subscription: SubscriptionMachine::new(),
            update_callback: None,
            error_limit_reached: false,
        }
    }

    /// Scenario: GET response with a body delivers Complete and advances
    /// the subscription cycle; a subsequent PUT response with a 2xx status
    /// reaches Subscribed.
    #[test]
    fn get_then_put_response_reaches_subscribed() {
        let mut inner = fresh_inner();
        inner.subscription.subscribe();
        let get_id = inner.subscription.next_request().map(|_| Uuid::new_v4()).unwrap();
        inner.operations.insert(get_id, TwinOperation { kind: TwinOperationKind::Get, on_complete: None });

        let received = Arc::new(Mutex::new(Vec::new()));
        let received2 = received.clone();
        inner.update_callback = Some(Box::new(move |update| received2.lock().unwrap().push(update)));

        let outcome = inner.handle_inbound(response(Some(get_id), None, Some(b"{\"desired\":{}}")));
        assert_eq!(outcome, Some(DispositionOutcome::Accepted));
        assert_eq!(inner.subscription.state(), subscription::SubscriptionState::SubscribeForUpdates);
        assert!(matches!(received.lock().unwrap().as_slice(), [TwinUpdate::Complete(b)] if b.as_ref() == b"{\"desired\":{}}"));

        let put_id = Uuid::new_v4();
        inner.operations.insert(put_id, TwinOperation { kind: TwinOperationKind::Put, on_complete: None });
        inner.handle_inbound(response(Some(put_id), Some(200), None));
        assert_eq!(inner.subscription.state(), subscription::SubscriptionState::Subscribed);
    }

    /// Scenario: a PATCH response with a 2xx status and no body invokes the
    /// report-state completion with Success(status).
    #[test]
    fn patch_response_with_status_and_no_body_succeeds() {
        let mut inner = fresh_inner();
        let id = Uuid::new_v4();
        let result = Arc::new(Mutex::new(None));
        let result2 = result.clone();
        inner.operations.insert(
            id,
            TwinOperation {
                kind: TwinOperationKind::Patch,
                on_complete: Some(Box::new(move |r| *result2.lock().unwrap() = Some(r))),
            },
        );
        inner.handle_inbound(response(Some(id), Some(204), None));
        assert_eq!(*result.lock().unwrap(), Some(ReportResult::Success(204)));
        assert!(inner.operations.is_empty());
    }

    /// Scenario: destroying with one pending PATCH fires Cancelled and
    /// leaves no dangling operations.
    #[test]
    fn cancel_all_fires_cancelled_for_pending_patch() {
        let mut inner = fresh_inner();
        let id = Uuid::new_v4();
        let result = Arc::new(Mutex::new(None));
        let result2 = result.clone();
        inner.operations.insert(
            id,
            TwinOperation {
                kind: TwinOperationKind::Patch,
                on_complete: Some(Box::new(move |r| *result2.lock().unwrap() = Some(r))),
            },
        );
        inner.cancel_all();
        assert_eq!(*result.lock().unwrap(), Some(ReportResult::Error(ReportError::Cancelled)));
        assert!(inner.operations.is_empty());
    }

    #[test]
    fn response_with_unknown_correlation_id_is_accepted_and_dropped() {
        let mut inner = fresh_inner();
        let outcome = inner.handle_inbound(response(Some(Uuid::new_v4()), Some(200), None));
        assert_eq!(outcome, Some(DispositionOutcome::Accepted));
    }

    #[test]
    fn unsolicited_body_with_no_correlation_id_is_a_partial_update() {
        let mut inner = fresh_inner();
        let received = Arc::new(Mutex::new(Vec::new()));
        let received2 = received.clone();
        inner.update_callback = Some(Box::new(move |update| received2.lock().unwrap().push(update)));
        inner.handle_inbound(response(None, None, Some(b"{\"x\":1}")));
        assert!(matches!(received.lock().unwrap().as_slice(), [TwinUpdate::Partial(b)] if b.as_ref() == b"{\"x\":1}"));
    }
}
