// Copyright 2020 The Matrix.org Foundation C.I.C.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Models of the inbound events that can start a verification session.
//!
//! Only the parts of the events the [`VerificationManager`] needs for routing
//! are modelled strictly, everything else is kept around so it can be handed
//! to the verification flow.
//!
//! [`VerificationManager`]: crate::VerificationManager

use std::collections::BTreeMap;

use ruma::{
    MilliSecondsSinceUnixEpoch, OwnedDeviceId, OwnedEventId, OwnedTransactionId, OwnedUserId,
    TransactionId, UserId,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::EventError;

/// The event type of a verification request sent as a to-device message.
pub const REQUEST_EVENT_TYPE: &str = "m.key.verification.request";
/// The event type of a verification start message.
pub const START_EVENT_TYPE: &str = "m.key.verification.start";
const ROOM_MESSAGE_EVENT_TYPE: &str = "m.room.message";

/// A verification method a device can support.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum VerificationMethod {
    /// The `m.sas.v1` short authentication string method.
    #[serde(rename = "m.sas.v1")]
    SasV1,
    /// The `m.qr_code.show.v1` method.
    #[serde(rename = "m.qr_code.show.v1")]
    QrCodeShowV1,
    /// The `m.qr_code.scan.v1` method.
    #[serde(rename = "m.qr_code.scan.v1")]
    QrCodeScanV1,
    /// The `m.reciprocate.v1` method.
    #[serde(rename = "m.reciprocate.v1")]
    ReciprocateV1,
    /// A method this crate doesn't know about.
    #[serde(other)]
    Unknown,
}

/// The content of a `m.key.verification.request` to-device message.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ToDeviceKeyVerificationRequestContent {
    /// The device that sent the request.
    pub from_device: OwnedDeviceId,
    /// The transaction id of the flow.
    ///
    /// The field is mandatory, but some clients fail to send it. Such messages
    /// can't be routed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<OwnedTransactionId>,
    /// The verification methods the sending device supports.
    pub methods: Vec<VerificationMethod>,
    /// When the request was created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<MilliSecondsSinceUnixEpoch>,
}

/// The content of a `m.key.verification.start` to-device message.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ToDeviceKeyVerificationStartContent {
    /// The device that started the verification.
    pub from_device: OwnedDeviceId,
    /// The transaction id of the flow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<OwnedTransactionId>,
    /// The verification method that should be used, e.g. `m.sas.v1`.
    pub method: String,
    /// The method specific fields of the start message, these are only
    /// interesting to the verification flow.
    #[serde(flatten)]
    pub method_content: BTreeMap<String, JsonValue>,
}

/// The content of a to-device message that may create a new verification
/// session.
#[derive(Clone, Copy, Debug)]
pub enum ToDeviceVerificationContent<'a> {
    /// A `m.key.verification.request` message.
    Request(&'a ToDeviceKeyVerificationRequestContent),
    /// A `m.key.verification.start` message that wasn't preceded by a request.
    Start(&'a ToDeviceKeyVerificationStartContent),
}

impl ToDeviceVerificationContent<'_> {
    /// The transaction id the message carries, if any.
    pub fn transaction_id(&self) -> Option<&TransactionId> {
        match self {
            Self::Request(c) => c.transaction_id.as_deref(),
            Self::Start(c) => c.transaction_id.as_deref(),
        }
    }

    /// The event type of the message.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Request(_) => REQUEST_EVENT_TYPE,
            Self::Start(_) => START_EVENT_TYPE,
        }
    }
}

impl<'a> From<&'a ToDeviceKeyVerificationRequestContent> for ToDeviceVerificationContent<'a> {
    fn from(c: &'a ToDeviceKeyVerificationRequestContent) -> Self {
        Self::Request(c)
    }
}

impl<'a> From<&'a ToDeviceKeyVerificationStartContent> for ToDeviceVerificationContent<'a> {
    fn from(c: &'a ToDeviceKeyVerificationStartContent) -> Self {
        Self::Start(c)
    }
}

/// A to-device event, the content together with the sender.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ToDeviceEvent<C> {
    /// The user that sent the message.
    pub sender: OwnedUserId,
    /// The content of the message.
    pub content: C,
}

/// A to-device event as received from the sync response, classified by
/// whether it can start a verification session.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type")]
pub enum AnyToDeviceVerificationEvent {
    /// A `m.key.verification.request` message.
    #[serde(rename = "m.key.verification.request")]
    Request(ToDeviceEvent<ToDeviceKeyVerificationRequestContent>),
    /// A `m.key.verification.start` message.
    #[serde(rename = "m.key.verification.start")]
    Start(ToDeviceEvent<ToDeviceKeyVerificationStartContent>),
    /// Any other to-device message, including the in-flow verification
    /// messages which are routed by the flows themselves.
    #[serde(other)]
    Other,
}

impl AnyToDeviceVerificationEvent {
    /// Deserialize a to-device event from its JSON form.
    pub fn from_json(json: &str) -> Result<Self, EventError> {
        Ok(serde_json::from_str(json)?)
    }

    /// The sender of the event, `None` for unrelated events.
    pub fn sender(&self) -> Option<&UserId> {
        match self {
            Self::Request(e) => Some(&e.sender),
            Self::Start(e) => Some(&e.sender),
            Self::Other => None,
        }
    }
}

/// The content of a `m.room.message` with the `m.key.verification.request`
/// msgtype.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct KeyVerificationRequestContent {
    /// The device that sent the request.
    pub from_device: OwnedDeviceId,
    /// The verification methods the sending device supports.
    pub methods: Vec<VerificationMethod>,
    /// The user the verification request is meant for.
    pub to: OwnedUserId,
    /// Fallback text for clients that don't support verification.
    #[serde(default)]
    pub body: String,
}

/// A `m.key.verification.request` sent as a room message.
#[derive(Clone, Debug)]
pub struct RoomVerificationRequestEvent {
    /// The event id, this doubles as the transaction id of the flow.
    pub event_id: OwnedEventId,
    /// The user that sent the request.
    pub sender: OwnedUserId,
    /// The server timestamp of the event.
    pub origin_server_ts: MilliSecondsSinceUnixEpoch,
    /// The request itself.
    pub content: KeyVerificationRequestContent,
}

#[derive(Deserialize)]
struct RoomMessageEvent {
    #[serde(rename = "type")]
    event_type: String,
    event_id: OwnedEventId,
    sender: OwnedUserId,
    origin_server_ts: MilliSecondsSinceUnixEpoch,
    content: RoomMessageContent,
}

#[derive(Deserialize)]
struct RoomMessageContent {
    msgtype: Option<String>,
    #[serde(flatten)]
    rest: JsonValue,
}

impl RoomVerificationRequestEvent {
    /// Try to interpret a room timeline event as a verification request.
    ///
    /// Returns `Ok(None)` if the event is a well formed room message of some
    /// other msgtype, and an error if the event isn't a room message at all or
    /// is malformed.
    pub fn from_room_message(json: &str) -> Result<Option<Self>, EventError> {
        let event: RoomMessageEvent = serde_json::from_str(json)?;

        if event.event_type != ROOM_MESSAGE_EVENT_TYPE {
            return Err(EventError::UnexpectedEventType(event.event_type));
        }

        if event.content.msgtype.as_deref() != Some(REQUEST_EVENT_TYPE) {
            return Ok(None);
        }

        let content = serde_json::from_value(event.content.rest)?;

        Ok(Some(Self {
            event_id: event.event_id,
            sender: event.sender,
            origin_server_ts: event.origin_server_ts,
            content,
        }))
    }
}

#[cfg(test)]
mod tests {
    use assert_matches2::{assert_let, assert_matches};
    use ruma::{device_id, event_id, user_id};
    use serde_json::json;

    use super::{
        AnyToDeviceVerificationEvent, RoomVerificationRequestEvent, ToDeviceVerificationContent,
        VerificationMethod,
    };
    use crate::error::EventError;

    #[test]
    fn to_device_request_without_transaction_id() {
        let json = json!({
            "type": "m.key.verification.request",
            "sender": "@alice:example.org",
            "content": {
                "from_device": "ALICEDEVICE",
                "methods": ["m.sas.v1", "org.example.custom"],
                "timestamp": 1_559_598_944_869u64,
            }
        });

        let event = AnyToDeviceVerificationEvent::from_json(&json.to_string()).unwrap();

        assert_let!(AnyToDeviceVerificationEvent::Request(request) = &event);
        assert_eq!(request.sender, user_id!("@alice:example.org"));
        assert_eq!(request.content.from_device, device_id!("ALICEDEVICE"));
        assert!(request.content.transaction_id.is_none());
        assert_eq!(
            request.content.methods,
            [VerificationMethod::SasV1, VerificationMethod::Unknown]
        );
        assert!(ToDeviceVerificationContent::from(&request.content).transaction_id().is_none());
    }

    #[test]
    fn to_device_start_keeps_method_content() {
        let json = json!({
            "type": "m.key.verification.start",
            "sender": "@alice:example.org",
            "content": {
                "from_device": "ALICEDEVICE",
                "transaction_id": "txn1",
                "method": "m.sas.v1",
                "key_agreement_protocols": ["curve25519-hkdf-sha256"],
                "hashes": ["sha256"],
            }
        });

        let event = AnyToDeviceVerificationEvent::from_json(&json.to_string()).unwrap();

        assert_let!(AnyToDeviceVerificationEvent::Start(start) = &event);
        let content = ToDeviceVerificationContent::from(&start.content);
        assert_eq!(content.transaction_id().map(|t| t.as_str()), Some("txn1"));
        assert_eq!(content.event_type(), "m.key.verification.start");
        assert!(start.content.method_content.contains_key("hashes"));
        assert_eq!(event.sender(), Some(user_id!("@alice:example.org")));
    }

    #[test]
    fn in_flow_messages_are_not_classified() {
        let json = json!({
            "type": "m.key.verification.accept",
            "sender": "@alice:example.org",
            "content": { "transaction_id": "txn1" }
        });

        let event = AnyToDeviceVerificationEvent::from_json(&json.to_string()).unwrap();
        assert!(event.sender().is_none());
        assert_matches!(event, AnyToDeviceVerificationEvent::Other);
    }

    #[test]
    fn room_verification_request() {
        let json = json!({
            "type": "m.room.message",
            "event_id": "$request",
            "sender": "@alice:example.org",
            "origin_server_ts": 1_559_598_944_869u64,
            "content": {
                "msgtype": "m.key.verification.request",
                "body": "Alice is requesting to verify your device",
                "from_device": "ALICEDEVICE",
                "methods": ["m.sas.v1"],
                "to": "@bob:example.org",
            }
        });

        let event =
            RoomVerificationRequestEvent::from_room_message(&json.to_string()).unwrap().unwrap();

        assert_eq!(event.event_id, event_id!("$request"));
        assert_eq!(event.content.to, user_id!("@bob:example.org"));
        assert_eq!(event.content.methods, [VerificationMethod::SasV1]);
    }

    #[test]
    fn plain_room_message_is_not_a_request() {
        let json = json!({
            "type": "m.room.message",
            "event_id": "$text",
            "sender": "@alice:example.org",
            "origin_server_ts": 1_559_598_944_869u64,
            "content": { "msgtype": "m.text", "body": "hello" }
        });

        assert!(RoomVerificationRequestEvent::from_room_message(&json.to_string())
            .unwrap()
            .is_none());
    }

    #[test]
    fn non_message_room_event_is_rejected() {
        let json = json!({
            "type": "m.reaction",
            "event_id": "$reaction",
            "sender": "@alice:example.org",
            "origin_server_ts": 1_559_598_944_869u64,
            "content": {}
        });

        assert_let!(
            Err(EventError::UnexpectedEventType(event_type)) =
                RoomVerificationRequestEvent::from_room_message(&json.to_string())
        );
        assert_eq!(event_type, "m.reaction");
    }

    #[test]
    fn malformed_room_request_is_an_error() {
        let json = json!({
            "type": "m.room.message",
            "event_id": "$request",
            "sender": "@alice:example.org",
            "origin_server_ts": 1_559_598_944_869u64,
            "content": { "msgtype": "m.key.verification.request", "body": "no device" }
        });

        assert_matches!(
            RoomVerificationRequestEvent::from_room_message(&json.to_string()),
            Err(EventError::Json(_))
        );
    }
}
