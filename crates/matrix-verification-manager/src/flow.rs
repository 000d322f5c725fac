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

use std::{fmt, sync::Arc};

use ruma::{EventId, OwnedDeviceId, RoomId, TransactionId, UserId};

use crate::events::{KeyVerificationRequestContent, ToDeviceVerificationContent};

/// A single interactive verification, e.g. a SAS verification.
///
/// The flow owns the state machine of the verification and receives the
/// in-flow messages (`ready`, `accept`, `key`, `mac`, ...) on its own, the
/// [`VerificationManager`] only governs the creation and the lifetime of the
/// registry entry.
///
/// [`VerificationManager`]: crate::VerificationManager
pub trait VerificationFlow: fmt::Debug + Send + Sync + 'static {
    /// The user on the other side of the verification.
    fn other_user_id(&self) -> &UserId;

    /// Has the verification finished successfully.
    fn is_done(&self) -> bool;

    /// Has the verification been cancelled, by either side.
    fn is_cancelled(&self) -> bool;
}

/// Constructors for [`VerificationFlow`]s.
///
/// The constructors for inbound messages may refuse to create a flow, e.g.
/// because the content is malformed or the request was sent by our own
/// device. Such messages are dropped without further notice.
pub trait FlowFactory: fmt::Debug + Send + Sync {
    /// The verification flow this factory creates.
    type Flow: VerificationFlow;

    /// Create a flow for a `m.key.verification.request` room message.
    fn new_in_room_verification(
        &self,
        room_id: &RoomId,
        content: &KeyVerificationRequestContent,
        sender: &UserId,
        event_id: &EventId,
    ) -> Option<Self::Flow>;

    /// Create a flow for a request or start message received over to-device
    /// messaging.
    fn new_to_device_verification(
        &self,
        content: ToDeviceVerificationContent<'_>,
        sender: &UserId,
        transaction_id: &TransactionId,
    ) -> Option<Self::Flow>;

    /// Start a verification of the given user inside of the given room.
    ///
    /// The flow is expected to send out the `m.key.verification.request`
    /// message, the event id of that message becomes known only after the
    /// homeserver echoes it back.
    fn initiate_user_verification(&self, room_id: &RoomId, user_id: &UserId) -> Self::Flow;

    /// Start a to-device verification with one of the given devices of the
    /// given user, using the given transaction id.
    ///
    /// This is called while the session registry is locked, it must not call
    /// back into the [`VerificationManager`].
    ///
    /// [`VerificationManager`]: crate::VerificationManager
    fn initiate_device_verification(
        &self,
        user_id: &UserId,
        device_ids: &[OwnedDeviceId],
        transaction_id: &TransactionId,
    ) -> Self::Flow;
}

impl<T: FlowFactory + ?Sized> FlowFactory for Arc<T> {
    type Flow = T::Flow;

    fn new_in_room_verification(
        &self,
        room_id: &RoomId,
        content: &KeyVerificationRequestContent,
        sender: &UserId,
        event_id: &EventId,
    ) -> Option<Self::Flow> {
        (**self).new_in_room_verification(room_id, content, sender, event_id)
    }

    fn new_to_device_verification(
        &self,
        content: ToDeviceVerificationContent<'_>,
        sender: &UserId,
        transaction_id: &TransactionId,
    ) -> Option<Self::Flow> {
        (**self).new_to_device_verification(content, sender, transaction_id)
    }

    fn initiate_user_verification(&self, room_id: &RoomId, user_id: &UserId) -> Self::Flow {
        (**self).initiate_user_verification(room_id, user_id)
    }

    fn initiate_device_verification(
        &self,
        user_id: &UserId,
        device_ids: &[OwnedDeviceId],
        transaction_id: &TransactionId,
    ) -> Self::Flow {
        (**self).initiate_device_verification(user_id, device_ids, transaction_id)
    }
}
