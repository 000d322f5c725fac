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

use ruma::{OwnedRoomId, OwnedUserId, RoomId, UserId};

use crate::error::DirectoryError;

/// The summary of a room the [`RoomDirectory`] knows about.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RoomInfo {
    /// The number of joined members of the room.
    pub member_count: u64,
    /// Is the room encrypted.
    pub is_encrypted: bool,
}

impl RoomInfo {
    /// Is this an encrypted room with exactly two members, i.e. an encrypted
    /// direct message room.
    pub fn is_encrypted_direct_message(&self) -> bool {
        self.is_encrypted && self.member_count == 2
    }
}

/// Read-only access to the rooms of the logged in user.
///
/// This is usually backed by the state store of the client.
pub trait RoomDirectory: fmt::Debug + Send + Sync {
    /// The ids of all the rooms the user is joined to.
    ///
    /// No particular order is guaranteed.
    fn joined_room_ids(&self) -> Result<Vec<OwnedRoomId>, DirectoryError>;

    /// Get the summary of the given room.
    fn room_info(&self, room_id: &RoomId) -> Result<RoomInfo, DirectoryError>;

    /// Get the user ids of the members of the given room.
    fn room_members(&self, room_id: &RoomId) -> Result<Vec<OwnedUserId>, DirectoryError>;

    /// Is the given user a member of the given room.
    fn is_room_member(&self, room_id: &RoomId, user_id: &UserId) -> Result<bool, DirectoryError> {
        Ok(self.room_members(room_id)?.iter().any(|member| &**member == user_id))
    }
}

impl<T: RoomDirectory + ?Sized> RoomDirectory for Arc<T> {
    fn joined_room_ids(&self) -> Result<Vec<OwnedRoomId>, DirectoryError> {
        (**self).joined_room_ids()
    }

    fn room_info(&self, room_id: &RoomId) -> Result<RoomInfo, DirectoryError> {
        (**self).room_info(room_id)
    }

    fn room_members(&self, room_id: &RoomId) -> Result<Vec<OwnedUserId>, DirectoryError> {
        (**self).room_members(room_id)
    }

    fn is_room_member(&self, room_id: &RoomId, user_id: &UserId) -> Result<bool, DirectoryError> {
        (**self).is_room_member(room_id, user_id)
    }
}
