//! The AMQP Messenger and its Send Queue sub-component (spec §2, §4.1,
//! §4.2).

pub mod disposition;
pub mod link;
pub mod messenger;
pub mod send_queue;

pub use disposition::{DispositionOutcome, MessageDisposition};
pub use link::LinkConfig;
pub use messenger::{AmqpMessenger, MessengerConfig, ReceiveCallback, SendStatus};
pub use send_queue::{SendCompletion, SendQueue};
