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

use ruma::{OwnedRoomId, OwnedUserId};
use serde_json::Error as SerdeError;
use thiserror::Error;

/// Error type describing why an inbound event couldn't be turned into a
/// verification event.
#[derive(Error, Debug)]
pub enum EventError {
    /// The event couldn't be deserialized.
    #[error(transparent)]
    Json(#[from] SerdeError),

    /// The event has a type the verification manager doesn't handle.
    #[error("the event type {0} is not a verification event type")]
    UnexpectedEventType(String),
}

/// Error type for the [`RoomDirectory`] collaborator.
///
/// [`RoomDirectory`]: crate::RoomDirectory
#[derive(Error, Debug)]
pub enum DirectoryError {
    /// The room isn't known to the directory.
    #[error("the room {0} is not known")]
    UnknownRoom(OwnedRoomId),

    /// The storage backing the directory returned an error.
    #[error(transparent)]
    Backend(Box<dyn std::error::Error + Send + Sync>),
}

/// Errors that can happen while looking for a way to verify someone.
#[derive(Error, Debug)]
pub enum VerificationError {
    /// There's no encrypted direct message room shared with the user, so no
    /// in-room verification can be started.
    #[error(
        "No encrypted private chat found with this user. Create an \
         encrypted private chat with this user and try again."
    )]
    NoEncryptedPrivateChat(OwnedUserId),

    /// The room directory couldn't answer our query.
    #[error("failed to query the room directory: {0}")]
    Directory(#[from] DirectoryError),
}
