//! Twin request/response envelope construction and parsing (spec §4.3
//! "Twin request envelope").

use bytes::Bytes;
use fe2o3_amqp_types::messaging::{
    annotations::OwnedKey, Data, Message, MessageAnnotations, Properties,
};
use fe2o3_amqp_types::primitives::Symbol;
use uuid::Uuid;

const ANNOTATION_OPERATION: &str = "operation";
const ANNOTATION_RESOURCE: &str = "resource";
const ANNOTATION_STATUS: &str = "status";

const RESOURCE_REPORTED: &str = "/properties/reported";
const RESOURCE_DESIRED: &str = "/notifications/twin/properties/desired";

/// The four wire-level twin operations (spec §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TwinRequestKind {
    Patch,
    Get,
    Put,
    Delete,
}

impl TwinRequestKind {
    fn operation_name(self) -> &'static str {
        match self {
            TwinRequestKind::Patch => "PATCH",
            TwinRequestKind::Get => "GET",
            TwinRequestKind::Put => "PUT",
            TwinRequestKind::Delete => "DELETE",
        }
    }

    fn resource(self) -> Option<&'static str> {
        match self {
            TwinRequestKind::Patch => Some(RESOURCE_REPORTED),
            TwinRequestKind::Put | TwinRequestKind::Delete => Some(RESOURCE_DESIRED),
            TwinRequestKind::Get => None,
        }
    }
}

/// Builds one outbound twin request message (spec §4.3).
///
/// `correlation_id` is distinct from the per-TM channel-correlation-id sent
/// as an attach property; it identifies this single request/response pair.
pub(crate) fn build_request(kind: TwinRequestKind, correlation_id: Uuid, payload: Option<Bytes>) -> Message<Data> {
    let mut annotations = MessageAnnotations::default();
    annotations.insert(
        OwnedKey::Symbol(Symbol::from(ANNOTATION_OPERATION)),
        kind.operation_name().into(),
    );
    if let Some(resource) = kind.resource() {
        annotations.insert(OwnedKey::Symbol(Symbol::from(ANNOTATION_RESOURCE)), resource.into());
    }

    let body = payload.unwrap_or_else(|| Bytes::from_static(b" "));

    Message::builder()
        .properties(Properties::builder().correlation_id(correlation_id.to_string()).build())
        .message_annotations(annotations)
        .data(Data(body))
        .build()
}

/// A parsed inbound twin message: either a response to a request this TM
/// sent, or (if `correlation_id` is `None`) an unsolicited desired-property
/// delta.
#[derive(Debug, Clone)]
pub(crate) struct TwinResponse {
    pub(crate) correlation_id: Option<Uuid>,
    pub(crate) status_code: Option<u32>,
    pub(crate) body: Option<Bytes>,
}

pub(crate) fn parse_response(message: &Message<Data>) -> TwinResponse {
    let correlation_id = message
        .properties
        .as_ref()
        .and_then(|p| p.correlation_id.as_ref())
        .and_then(|c| c.to_string().parse::<Uuid>().ok());

    let status_code = message.message_annotations.as_ref().and_then(|annotations| {
        annotations
            .get(&OwnedKey::Symbol(Symbol::from(ANNOTATION_STATUS)))
            .and_then(|v| v.clone().try_into().ok())
    });

    let body = message.body.as_ref().map(|Data(bytes)| bytes.clone());

    TwinResponse { correlation_id, status_code, body }
}

pub(crate) fn status_is_success(status: u32) -> bool {
    (200..300).contains(&status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_request_carries_reported_resource() {
        let id = Uuid::new_v4();
        let msg = build_request(TwinRequestKind::Patch, id, Some(Bytes::from_static(b"{}")));
        let annotations = msg.message_annotations.unwrap();
        assert_eq!(
            annotations.get(&OwnedKey::Symbol(Symbol::from(ANNOTATION_OPERATION))),
            Some(&"PATCH".into())
        );
        assert_eq!(
            annotations.get(&OwnedKey::Symbol(Symbol::from(ANNOTATION_RESOURCE))),
            Some(&RESOURCE_REPORTED.into())
        );
    }

    #[test]
    fn get_request_has_no_resource_and_a_single_space_body() {
        let id = Uuid::new_v4();
        let msg = build_request(TwinRequestKind::Get, id, None);
        let annotations = msg.message_annotations.unwrap();
        assert!(annotations.get(&OwnedKey::Symbol(Symbol::from(ANNOTATION_RESOURCE))).is_none());
        assert_eq!(msg.body.unwrap().0, Bytes::from_static(b" "));
    }

    #[test]
    fn put_and_delete_share_the_desired_resource() {
        let put = build_request(TwinRequestKind::Put, Uuid::new_v4(), None);
        let delete = build_request(TwinRequestKind::Delete, Uuid::new_v4(), None);
        for msg in [put, delete] {
            let annotations = msg.message_annotations.unwrap();
            assert_eq!(
                annotations.get(&OwnedKey::Symbol(Symbol::from(ANNOTATION_RESOURCE))),
                Some(&RESOURCE_DESIRED.into())
            );
        }
    }
}
