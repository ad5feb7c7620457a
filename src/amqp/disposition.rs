//! The disposition handle minted for every inbound delivery (spec §4.1
//! "Receive path", Design Notes "Disposition handles").

use fe2o3_amqp_types::definitions::{DeliveryNumber, DeliveryTag};
use fe2o3_amqp_types::messaging::{Accepted, DeliveryState, Rejected, Released};

/// An inbound delivery the caller has not yet settled.
///
/// The delivery number and link name are copied out of the library's
/// borrowed storage at dispatch time (Design Notes): callers may hold this
/// handle for as long as they like before calling
/// [`crate::amqp::AmqpMessenger::send_message_disposition`].
#[derive(Debug, Clone)]
pub struct MessageDisposition {
    pub(crate) delivery_id: DeliveryNumber,
    pub(crate) delivery_tag: DeliveryTag,
    pub(crate) link_name: String,
}

impl MessageDisposition {
    pub(crate) fn new(delivery_id: DeliveryNumber, delivery_tag: DeliveryTag, link_name: String) -> Self {
        Self { delivery_id, delivery_tag, link_name }
    }

    /// The link the delivery arrived on.
    pub fn link_name(&self) -> &str {
        &self.link_name
    }

    /// The delivery number to settle.
    pub fn delivery_id(&self) -> DeliveryNumber {
        self.delivery_id
    }
}

/// The outcome the caller wants reported for a delivery, or `None` to defer
/// settlement (the caller must later call `send_message_disposition`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispositionOutcome {
    /// Settle as Accepted.
    Accepted,
    /// Settle as Rejected with the fixed description used by this crate
    /// ("Rejected by application").
    Rejected,
    /// Settle as Released.
    Released,
}

pub(crate) fn accepted() -> DeliveryState {
    DeliveryState::Accepted(Accepted {})
}

pub(crate) fn released() -> DeliveryState {
    DeliveryState::Released(Released {})
}

pub(crate) fn rejected(condition: &str, description: &str) -> DeliveryState {
    use fe2o3_amqp_types::definitions::{self, ErrorCondition};
    DeliveryState::Rejected(Rejected {
        error: Some(definitions::Error::new(
            ErrorCondition::Custom(fe2o3_amqp_types::primitives::Symbol::from(condition)),
            Some(description.to_string()),
            None,
        )),
    })
}

pub(crate) fn outcome_to_delivery_state(outcome: DispositionOutcome) -> DeliveryState {
    match outcome {
        DispositionOutcome::Accepted => accepted(),
        DispositionOutcome::Rejected => rejected("Rejected by application", "Rejected by application"),
        DispositionOutcome::Released => released(),
    }
}
