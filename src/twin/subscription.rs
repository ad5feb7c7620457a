//! The desired-properties subscription state machine (spec §4.3
//! "Subscription state machine").

use crate::twin::envelope::TwinRequestKind;

/// Error counter threshold past which the owning TM transitions to Error
/// (spec §4.3).
pub const MAX_SUBSCRIPTION_ERRORS: u32 = 3;

/// The nine ordered subscription states (spec §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    NotSubscribed,
    GetCompleteProperties,
    GettingCompleteProperties,
    SubscribeForUpdates,
    Subscribing,
    Subscribed,
    Unsubscribe,
    Unsubscribing,
}

/// Outcome of processing one response in the subscription cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionEvent {
    /// The cycle advanced normally.
    Advanced,
    /// The cycle reverted after a bad response; the error counter was
    /// incremented.
    Reverted,
    /// The error counter reached [`MAX_SUBSCRIPTION_ERRORS`]; the owning TM
    /// must transition to Error.
    ErrorLimitReached,
}

/// Drives [`SubscriptionState`] forward on `do_work` and backward on bad
/// responses (spec §4.3, I4: transitions are monotonic within a cycle).
#[derive(Debug, Clone)]
pub struct SubscriptionMachine {
    state: SubscriptionState,
    error_count: u32,
}

impl Default for SubscriptionMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionMachine {
    pub fn new() -> Self {
        Self { state: SubscriptionState::NotSubscribed, error_count: 0 }
    }

    pub fn state(&self) -> SubscriptionState {
        self.state
    }

    pub fn error_count(&self) -> u32 {
        self.error_count
    }

    /// Starts (or restarts) the subscribe cycle from [`SubscriptionState::NotSubscribed`].
    pub fn subscribe(&mut self) {
        if self.state == SubscriptionState::NotSubscribed {
            self.state = SubscriptionState::GetCompleteProperties;
        }
    }

    /// Starts the unsubscribe cycle; a no-op if already not subscribed.
    pub fn unsubscribe(&mut self) {
        if self.state != SubscriptionState::NotSubscribed && self.state != SubscriptionState::Unsubscribing {
            self.state = SubscriptionState::Unsubscribe;
        }
    }

    /// If in one of the three "intent" states, returns the request to send
    /// and transitions to the matching "in-flight" state (spec §4.3, per
    /// tick: at most one request built here).
    pub fn next_request(&mut self) -> Option<TwinRequestKind> {
        match self.state {
            SubscriptionState::GetCompleteProperties => {
                self.state = SubscriptionState::GettingCompleteProperties;
                Some(TwinRequestKind::Get)
            }
            SubscriptionState::SubscribeForUpdates => {
                self.state = SubscriptionState::Subscribing;
                Some(TwinRequestKind::Put)
            }
            SubscriptionState::Unsubscribe => {
                self.state = SubscriptionState::Unsubscribing;
                Some(TwinRequestKind::Delete)
            }
            _ => None,
        }
    }

    /// A send failure for the in-flight request reverts the cycle one step
    /// (mirrors a non-2xx response) without waiting for a response that
    /// will never arrive.
    pub fn on_send_failed(&mut self) -> SubscriptionEvent {
        match self.state {
            SubscriptionState::GettingCompleteProperties => self.revert(SubscriptionState::GetCompleteProperties),
            SubscriptionState::Subscribing => self.revert(SubscriptionState::SubscribeForUpdates),
            SubscriptionState::Unsubscribing => self.revert(SubscriptionState::Unsubscribe),
            _ => SubscriptionEvent::Advanced,
        }
    }

    pub fn on_get_response(&mut self, has_body: bool) -> SubscriptionEvent {
        if self.state != SubscriptionState::GettingCompleteProperties {
            return SubscriptionEvent::Advanced;
        }
        if has_body {
            self.state = SubscriptionState::SubscribeForUpdates;
            self.error_count = 0;
            SubscriptionEvent::Advanced
        } else {
            self.revert(SubscriptionState::GetCompleteProperties)
        }
    }

    pub fn on_put_response(&mut self, status_ok: bool) -> SubscriptionEvent {
        if self.state != SubscriptionState::Subscribing {
            return SubscriptionEvent::Advanced;
        }
        if status_ok {
            self.state = SubscriptionState::Subscribed;
            self.error_count = 0;
            SubscriptionEvent::Advanced
        } else {
            self.revert(SubscriptionState::SubscribeForUpdates)
        }
    }

    pub fn on_delete_response(&mut self, status_ok: bool) -> SubscriptionEvent {
        if self.state != SubscriptionState::Unsubscribing {
            return SubscriptionEvent::Advanced;
        }
        if status_ok {
            self.state = SubscriptionState::NotSubscribed;
            self.error_count = 0;
            SubscriptionEvent::Advanced
        } else {
            self.revert(SubscriptionState::Unsubscribe)
        }
    }

    fn revert(&mut self, to: SubscriptionState) -> SubscriptionEvent {
        self.state = to;
        self.error_count += 1;
        if self.error_count >= MAX_SUBSCRIPTION_ERRORS {
            SubscriptionEvent::ErrorLimitReached
        } else {
            SubscriptionEvent::Reverted
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_cycle_issues_one_get_then_one_put() {
        let mut m = SubscriptionMachine::new();
        m.subscribe();
        assert_eq!(m.next_request(), Some(TwinRequestKind::Get));
        assert_eq!(m.state(), SubscriptionState::GettingCompleteProperties);
        assert_eq!(m.on_get_response(true), SubscriptionEvent::Advanced);
        assert_eq!(m.state(), SubscriptionState::SubscribeForUpdates);
        assert_eq!(m.next_request(), Some(TwinRequestKind::Put));
        assert_eq!(m.on_put_response(true), SubscriptionEvent::Advanced);
        assert_eq!(m.state(), SubscriptionState::Subscribed);
    }

    #[test]
    fn three_cumulative_errors_signal_error_limit() {
        let mut m = SubscriptionMachine::new();
        m.subscribe();
        m.next_request();
        assert_eq!(m.on_get_response(false), SubscriptionEvent::Reverted);
        m.next_request();
        assert_eq!(m.on_get_response(false), SubscriptionEvent::Reverted);
        m.next_request();
        assert_eq!(m.on_get_response(false), SubscriptionEvent::ErrorLimitReached);
    }

    #[test]
    fn unsubscribe_then_subscribe_returns_to_subscribed() {
        let mut m = SubscriptionMachine::new();
        m.subscribe();
        m.next_request();
        m.on_get_response(true);
        m.next_request();
        m.on_put_response(true);

        m.unsubscribe();
        assert_eq!(m.next_request(), Some(TwinRequestKind::Delete));
        assert_eq!(m.on_delete_response(true), SubscriptionEvent::Advanced);
        assert_eq!(m.state(), SubscriptionState::NotSubscribed);

        m.subscribe();
        m.next_request();
        m.on_get_response(true);
        m.next_request();
        m.on_put_response(true);
        assert_eq!(m.state(), SubscriptionState::Subscribed);
    }
}
