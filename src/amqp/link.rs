//! Link configuration and address/attach-property construction (spec §4.1
//! "Link creation").

use std::collections::BTreeMap;

use fe2o3_amqp_types::definitions::{ReceiverSettleMode, SenderSettleMode};
use fe2o3_amqp_types::messaging::{Source, Target};
use fe2o3_amqp_types::primitives::{OrderedMap, Symbol};
use uuid::Uuid;

use crate::error::Error;

/// Maximum message size accepted by a sender link (spec §4.1: `UINT64_MAX`).
pub const SENDER_MAX_MESSAGE_SIZE: u64 = u64::MAX;

/// Maximum message size accepted by a receiver link (spec §4.1).
pub const RECEIVER_MAX_MESSAGE_SIZE: u64 = 65536;

/// Per-direction configuration for one of the two links an
/// [`crate::amqp::AmqpMessenger`] owns.
///
/// `BTreeMap` is used for attach properties (rather than `HashMap`) so that
/// link-creation is deterministic in tests and logs.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// The path segment appended to `amqps://<host>/devices/<device-id>/` to
    /// form this link's source (receiver) or target (sender) address.
    pub suffix: String,
    /// Negotiated sender-settle-mode (spec: always `Settled` in practice,
    /// but kept configurable for testing).
    pub sender_settle_mode: SenderSettleMode,
    /// Negotiated receiver-settle-mode (spec: always `First`).
    pub receiver_settle_mode: ReceiverSettleMode,
    /// Attach properties sent with the link's `Attach` frame.
    pub attach_properties: Option<BTreeMap<String, String>>,
}

impl LinkConfig {
    /// A link config with the spec's default settle modes and no attach
    /// properties.
    pub fn new(suffix: impl Into<String>) -> Self {
        Self {
            suffix: suffix.into(),
            sender_settle_mode: SenderSettleMode::Settled,
            receiver_settle_mode: ReceiverSettleMode::First,
            attach_properties: None,
        }
    }

    pub(crate) fn require_non_empty(&self, field: &str) -> Result<(), Error> {
        if self.suffix.trim().is_empty() {
            return Err(Error::invalid_config(format!("{field} is required")));
        }
        Ok(())
    }
}

/// Builds the service address `amqps://<host>/devices/<device_id>/<suffix>`.
pub(crate) fn build_address(host_fqdn: &str, device_id: &str, suffix: &str) -> Result<url::Url, Error> {
    let raw = format!(
        "amqps://{host}/devices/{device}/{suffix}",
        host = host_fqdn,
        device = device_id,
        suffix = suffix.trim_start_matches('/'),
    );
    url::Url::parse(&raw).map_err(|e| Error::invalid_config(format!("invalid address {raw:?}: {e}")))
}

/// `link-snd-<device-id>-<uuid>` / `link-rcv-<device-id>-<uuid>`.
pub(crate) fn generate_link_name(role: &str, device_id: &str) -> String {
    format!("link-{role}-{device_id}-{}", Uuid::new_v4())
}

pub(crate) fn messaging_source(address: impl Into<String>) -> Source {
    Source::builder().address(address.into()).build()
}

pub(crate) fn messaging_target(address: impl Into<String>) -> Target {
    Target::builder().address(address.into()).build()
}

/// Encodes an attach-properties map as AMQP symbol keys / string values.
pub(crate) fn encode_attach_properties(
    properties: &BTreeMap<String, String>,
) -> OrderedMap<Symbol, String> {
    properties
        .iter()
        .map(|(k, v)| (Symbol::from(k.as_str()), v.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_expected_sender_address() {
        let url = build_address("h.example", "dev-1", "messages/events").unwrap();
        assert_eq!(url.as_str(), "amqps://h.example/devices/dev-1/messages/events");
    }

    #[test]
    fn link_names_are_prefixed_and_unique() {
        let a = generate_link_name("snd", "dev-1");
        let b = generate_link_name("snd", "dev-1");
        assert!(a.starts_with("link-snd-dev-1-"));
        assert_ne!(a, b);
    }

    #[test]
    fn encodes_attach_properties_as_symbols() {
        let mut props = BTreeMap::new();
        props.insert("com.microsoft:client-version".to_string(), "1.0".to_string());
        let encoded = encode_attach_properties(&props);
        assert_eq!(
            encoded.get(&Symbol::from("com.microsoft:client-version")),
            Some(&"1.0".to_string())
        );
    }
}
