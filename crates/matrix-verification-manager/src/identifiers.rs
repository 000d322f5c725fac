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

use std::fmt;

use ruma::{EventId, OwnedEventId, OwnedRoomId, OwnedTransactionId, RoomId, TransactionId};

/// The identifier of a verification flow.
///
/// In-room verifications are identified by the event id of the
/// `m.key.verification.request` room message, to-device verifications by the
/// transaction id every message of the flow carries.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum FlowId {
    /// A flow that happens over to-device messages.
    ToDevice(OwnedTransactionId),
    /// A flow that happens inside of a room.
    InRoom(OwnedRoomId, OwnedEventId),
}

impl FlowId {
    /// The room this flow lives in, if it's an in-room flow.
    pub fn room_id(&self) -> Option<&RoomId> {
        if let FlowId::InRoom(r, _) = &self {
            Some(r)
        } else {
            None
        }
    }

    /// Is this flow happening over to-device messages.
    pub fn is_to_device(&self) -> bool {
        matches!(self, FlowId::ToDevice(_))
    }

    /// The string form of the flow id, the key sessions are registered under.
    pub fn as_str(&self) -> &str {
        match self {
            FlowId::InRoom(_, r) => r.as_str(),
            FlowId::ToDevice(t) => t.as_str(),
        }
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<OwnedTransactionId> for FlowId {
    fn from(transaction_id: OwnedTransactionId) -> Self {
        FlowId::ToDevice(transaction_id)
    }
}

impl From<&TransactionId> for FlowId {
    fn from(transaction_id: &TransactionId) -> Self {
        FlowId::ToDevice(transaction_id.to_owned())
    }
}

impl From<(OwnedRoomId, OwnedEventId)> for FlowId {
    fn from(ids: (OwnedRoomId, OwnedEventId)) -> Self {
        FlowId::InRoom(ids.0, ids.1)
    }
}

impl From<(&RoomId, &EventId)> for FlowId {
    fn from(ids: (&RoomId, &EventId)) -> Self {
        FlowId::InRoom(ids.0.to_owned(), ids.1.to_owned())
    }
}
