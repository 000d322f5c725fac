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

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, RwLock as StdRwLock,
    },
};

use ruma::{EventId, OwnedDeviceId, OwnedRoomId, OwnedUserId, RoomId, UserId};
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, trace, warn};

use crate::{
    config::VerificationManagerConfig,
    directory::RoomDirectory,
    error::{EventError, VerificationError},
    events::{
        AnyToDeviceVerificationEvent, RoomVerificationRequestEvent,
        ToDeviceKeyVerificationRequestContent, ToDeviceKeyVerificationStartContent,
        ToDeviceVerificationContent,
    },
    flow::{FlowFactory, VerificationFlow},
    identifiers::FlowId,
    registry::{BindResult, SessionRegistry},
};

/// A notice the user should be shown.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum VerificationNotice {
    /// We were asked to verify a user, but don't share an encrypted direct
    /// message room with them.
    NoEncryptedPrivateChat {
        /// The user that should have been verified.
        user_id: OwnedUserId,
    },
}

impl fmt::Display for VerificationNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoEncryptedPrivateChat { user_id } => {
                fmt::Display::fmt(&VerificationError::NoEncryptedPrivateChat(user_id.clone()), f)
            }
        }
    }
}

struct VerificationManagerInner<D, Fa: FlowFactory> {
    directory: D,
    factory: Fa,
    registry: StdRwLock<SessionRegistry<Fa::Flow>>,
    /// Are we replaying the backlog of the initial sync.
    initial_sync: AtomicBool,
    new_session_sender: broadcast::Sender<Arc<Fa::Flow>>,
    notice_sender: broadcast::Sender<VerificationNotice>,
}

/// The registry of interactive verifications.
///
/// The manager receives the verification requests from the sync loop and
/// the verifications the user wants to start, creates the matching
/// [`VerificationFlow`]s and makes sure that there is at most one flow per
/// transaction.
///
/// Every new flow is announced on the channel returned by
/// [`VerificationManager::subscribe()`], observers hold on to the flow for as
/// long as they display it. Once a flow is over, [`remove_session()`] needs to
/// be called with it.
///
/// The manager expects to be driven from a single task, the sync loop and
/// the UI actions are not expected to race each other.
///
/// This is cheap to clone.
///
/// [`remove_session()`]: VerificationManager::remove_session
pub struct VerificationManager<D, Fa: FlowFactory> {
    inner: Arc<VerificationManagerInner<D, Fa>>,
}

impl<D, Fa: FlowFactory> Clone for VerificationManager<D, Fa> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

#[cfg(not(tarpaulin_include))]
impl<D: fmt::Debug, Fa: FlowFactory> fmt::Debug for VerificationManager<D, Fa> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerificationManager")
            .field("directory", &self.inner.directory)
            .field("factory", &self.inner.factory)
            .field("initial_sync", &self.is_initial_sync())
            .finish_non_exhaustive()
    }
}

impl<D, Fa: FlowFactory> VerificationManager<D, Fa> {
    /// Mark the start or the end of the initial sync.
    ///
    /// While the initial sync is in progress, inbound verification events are
    /// ignored.
    pub fn set_initial_sync(&self, initial_sync: bool) {
        debug!(initial_sync, "Toggling the initial sync verification gate");
        self.inner.initial_sync.store(initial_sync, Ordering::SeqCst);
    }

    /// Is the initial sync in progress.
    pub fn is_initial_sync(&self) -> bool {
        self.inner.initial_sync.load(Ordering::SeqCst)
    }
}

impl<D: RoomDirectory, Fa: FlowFactory> VerificationManager<D, Fa> {
    /// Create a new, empty, verification manager.
    ///
    /// # Arguments
    ///
    /// * `directory` - Answers which rooms we share with whom.
    ///
    /// * `factory` - Creates the verification flows.
    ///
    /// * `config` - The settings for the manager.
    pub fn new(directory: D, factory: Fa, config: VerificationManagerConfig) -> Self {
        let (new_session_sender, _) = broadcast::channel(config.channel_capacity());
        let (notice_sender, _) = broadcast::channel(config.channel_capacity());

        Self {
            inner: Arc::new(VerificationManagerInner {
                directory,
                factory,
                registry: Default::default(),
                initial_sync: AtomicBool::new(config.initial_sync),
                new_session_sender,
                notice_sender,
            }),
        }
    }

    /// Subscribe to newly created verification sessions.
    ///
    /// Note: If the receiver falls behind, older sessions may be dropped.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Fa::Flow>> {
        self.inner.new_session_sender.subscribe()
    }

    /// Subscribe to notices that should be shown to the user.
    pub fn subscribe_notices(&self) -> broadcast::Receiver<VerificationNotice> {
        self.inner.notice_sender.subscribe()
    }

    /// Get the flow registered under the given transaction or event id.
    pub fn get_session(&self, flow_id: impl AsRef<str>) -> Option<Arc<Fa::Flow>> {
        self.inner.registry.read().unwrap().get(flow_id.as_ref())
    }

    /// Is a session registered under the given transaction or event id.
    pub fn has_session(&self, flow_id: impl AsRef<str>) -> bool {
        self.inner.registry.read().unwrap().contains(flow_id.as_ref())
    }

    /// All the registered sessions whose flow is still alive.
    pub fn sessions(&self) -> Vec<(FlowId, Arc<Fa::Flow>)> {
        self.inner.registry.read().unwrap().sessions()
    }

    /// The number of registered sessions.
    pub fn session_count(&self) -> usize {
        self.inner.registry.read().unwrap().len()
    }

    /// The number of sessions we started in a room that are still waiting for
    /// the event id of their request.
    pub fn pending_count(&self) -> usize {
        self.inner.registry.read().unwrap().pending_len()
    }

    /// Is the given flow waiting for the event id of its request.
    pub fn is_pending(&self, flow: &Fa::Flow) -> bool {
        self.inner.registry.read().unwrap().is_pending(flow)
    }

    fn notify_new_session(&self, flow: &Arc<Fa::Flow>) {
        // It's fine if nobody is listening.
        let _ = self.inner.new_session_sender.send(flow.clone());
    }

    fn notify(&self, notice: VerificationNotice) {
        let _ = self.inner.notice_sender.send(notice);
    }

    /// Register a new session under the given flow id, unless we already know
    /// about it.
    fn create_session(
        &self,
        flow_id: FlowId,
        constructor: impl FnOnce() -> Option<Fa::Flow>,
    ) -> Option<Arc<Fa::Flow>> {
        if self.has_session(flow_id.as_str()) {
            debug!(flow_id = flow_id.as_str(), "Ignoring known verification request");
            return None;
        }

        let Some(flow) = constructor() else {
            debug!(flow_id = flow_id.as_str(), "The verification flow couldn't be created");
            return None;
        };

        let flow = Arc::new(flow);

        if !self.inner.registry.write().unwrap().insert(flow_id.clone(), &flow) {
            debug!(
                flow_id = flow_id.as_str(),
                "A session was registered while the verification flow was created"
            );
            return None;
        }

        info!(
            flow_id = flow_id.as_str(),
            other_user_id = flow.other_user_id().as_str(),
            "Created a new verification session"
        );

        self.notify_new_session(&flow);

        Some(flow)
    }

    /// Receive a `m.key.verification.request` sent as a room message.
    ///
    /// The session is keyed by the event id of the request. Requests that
    /// belong to a known session are ignored.
    ///
    /// Returns the newly created flow, if any.
    #[instrument(skip_all, fields(room_id = room_id.as_str(), sender = event.sender.as_str()))]
    pub fn receive_room_verification_request(
        &self,
        event: &RoomVerificationRequestEvent,
        room_id: &RoomId,
    ) -> Option<Arc<Fa::Flow>> {
        if self.is_initial_sync() {
            trace!("Ignoring a verification request received during the initial sync");
            return None;
        }

        debug!(
            event_id = event.event_id.as_str(),
            from_device = event.content.from_device.as_str(),
            "Received an in-room verification request",
        );

        let flow_id = FlowId::from((room_id, &*event.event_id));

        self.create_session(flow_id, || {
            self.inner.factory.new_in_room_verification(
                room_id,
                &event.content,
                &event.sender,
                &event.event_id,
            )
        })
    }

    /// Receive a `m.key.verification.request` sent as a to-device message.
    ///
    /// Returns the newly created flow, if any.
    pub fn receive_to_device_request(
        &self,
        content: &ToDeviceKeyVerificationRequestContent,
        sender: &UserId,
    ) -> Option<Arc<Fa::Flow>> {
        self.receive_to_device_verification(content.into(), sender)
    }

    /// Receive a `m.key.verification.start` sent as a to-device message.
    ///
    /// Some clients start a verification without sending a request first, or
    /// the request went to another one of our devices, so a start message for
    /// an unknown transaction creates a new session as well.
    ///
    /// Returns the newly created flow, if any.
    pub fn receive_to_device_start(
        &self,
        content: &ToDeviceKeyVerificationStartContent,
        sender: &UserId,
    ) -> Option<Arc<Fa::Flow>> {
        self.receive_to_device_verification(content.into(), sender)
    }

    #[instrument(skip_all, fields(event_type = content.event_type(), sender = sender.as_str()))]
    fn receive_to_device_verification(
        &self,
        content: ToDeviceVerificationContent<'_>,
        sender: &UserId,
    ) -> Option<Arc<Fa::Flow>> {
        if self.is_initial_sync() {
            trace!("Ignoring a verification message received during the initial sync");
            return None;
        }

        let Some(transaction_id) = content.transaction_id() else {
            trace!("Ignoring a verification message without a transaction id");
            return None;
        };

        let flow_id = FlowId::from(transaction_id);

        self.create_session(flow_id, || {
            self.inner.factory.new_to_device_verification(content, sender, transaction_id)
        })
    }

    /// Receive any to-device event from the sync response.
    ///
    /// Requests and start messages are handled like
    /// [`receive_to_device_request()`] and [`receive_to_device_start()`] do,
    /// everything else is ignored.
    ///
    /// [`receive_to_device_request()`]: Self::receive_to_device_request
    /// [`receive_to_device_start()`]: Self::receive_to_device_start
    pub fn receive_to_device_event(
        &self,
        event: &AnyToDeviceVerificationEvent,
    ) -> Option<Arc<Fa::Flow>> {
        match event {
            AnyToDeviceVerificationEvent::Request(e) => {
                self.receive_to_device_request(&e.content, &e.sender)
            }
            AnyToDeviceVerificationEvent::Start(e) => {
                self.receive_to_device_start(&e.content, &e.sender)
            }
            AnyToDeviceVerificationEvent::Other => None,
        }
    }

    /// Receive a room timeline event, in its JSON form, from the sync
    /// response.
    ///
    /// Events that aren't verification requests are ignored, malformed
    /// requests are logged and dropped.
    pub fn receive_room_event(&self, room_id: &RoomId, json: &str) -> Option<Arc<Fa::Flow>> {
        if self.is_initial_sync() {
            return None;
        }

        match RoomVerificationRequestEvent::from_room_message(json) {
            Ok(Some(event)) => self.receive_room_verification_request(&event, room_id),
            Ok(None) | Err(EventError::UnexpectedEventType(_)) => None,
            Err(e) => {
                warn!(
                    room_id = room_id.as_str(),
                    "Failed to deserialize a room verification request: {e}"
                );
                None
            }
        }
    }

    /// Find an encrypted room with exactly two members, one of them being
    /// the given user.
    ///
    /// If there are multiple such rooms, the first one the directory returns
    /// is picked.
    fn find_direct_message_room(&self, user_id: &UserId) -> Result<OwnedRoomId, VerificationError> {
        let directory = &self.inner.directory;

        for room_id in directory.joined_room_ids()? {
            let info = match directory.room_info(&room_id) {
                Ok(info) => info,
                Err(e) => {
                    warn!(room_id = room_id.as_str(), "Couldn't load the room info: {e}");
                    continue;
                }
            };

            if !info.is_encrypted_direct_message() {
                continue;
            }

            match directory.is_room_member(&room_id, user_id) {
                Ok(true) => return Ok(room_id),
                Ok(false) => {}
                Err(e) => {
                    warn!(room_id = room_id.as_str(), "Couldn't load the room members: {e}");
                }
            }
        }

        Err(VerificationError::NoEncryptedPrivateChat(user_id.to_owned()))
    }

    /// Start an in-room verification with the given user.
    ///
    /// The verification happens in an encrypted room that only the two of us
    /// are members of. If no such room exists, a
    /// [`VerificationNotice::NoEncryptedPrivateChat`] is sent out instead.
    ///
    /// The new flow is announced right away, but it will only be registered
    /// under its key once [`on_flow_event_id_assigned()`] tells us the event
    /// id of the request.
    ///
    /// [`on_flow_event_id_assigned()`]: Self::on_flow_event_id_assigned
    #[instrument(skip(self))]
    pub fn verify_user(&self, user_id: &UserId) -> Option<Arc<Fa::Flow>> {
        let room_id = match self.find_direct_message_room(user_id) {
            Ok(room_id) => room_id,
            Err(e) => {
                if let VerificationError::Directory(e) = &e {
                    warn!("Couldn't list the joined rooms: {e}");
                }

                info!("Can't verify the user, no encrypted direct message room found");
                self.notify(VerificationNotice::NoEncryptedPrivateChat {
                    user_id: user_id.to_owned(),
                });

                return None;
            }
        };

        let flow = Arc::new(self.inner.factory.initiate_user_verification(&room_id, user_id));

        debug!(room_id = room_id.as_str(), "Started an in-room verification");
        self.inner.registry.write().unwrap().insert_pending(room_id, &flow);
        self.notify_new_session(&flow);

        Some(flow)
    }

    /// Tell the manager which event id the request of a flow we started with
    /// [`verify_user()`] got.
    ///
    /// Returns true if the session got registered under the event id.
    ///
    /// [`verify_user()`]: Self::verify_user
    pub fn on_flow_event_id_assigned(&self, flow: &Fa::Flow, event_id: &EventId) -> bool {
        let result = self.inner.registry.write().unwrap().bind_pending(flow, event_id);

        match result {
            BindResult::Bound(flow_id) => {
                info!(flow_id = flow_id.as_str(), "Registered an in-room verification session");
                true
            }
            BindResult::NotPending => {
                debug!(
                    event_id = event_id.as_str(),
                    "Received an event id for a flow that isn't waiting for one"
                );
                false
            }
            BindResult::KeyTaken(flow_id) => {
                warn!(
                    flow_id = flow_id.as_str(),
                    "Another verification session is already registered under the event id \
                     of our request, dropping our session"
                );
                false
            }
        }
    }

    /// Start a to-device verification with a specific device of the given
    /// user.
    pub fn verify_device(&self, user_id: &UserId, device_id: OwnedDeviceId) -> Arc<Fa::Flow> {
        self.verify_one_of_devices(user_id, vec![device_id])
    }

    /// Start a to-device verification with whichever of the given devices of
    /// the given user answers first.
    #[instrument(skip(self))]
    pub fn verify_one_of_devices(
        &self,
        user_id: &UserId,
        device_ids: Vec<OwnedDeviceId>,
    ) -> Arc<Fa::Flow> {
        // The id is picked and the session registered under a single write
        // guard, so nothing else can claim the id in between.
        let mut registry = self.inner.registry.write().unwrap();

        let transaction_id = registry.fresh_transaction_id();
        let flow = Arc::new(self.inner.factory.initiate_device_verification(
            user_id,
            &device_ids,
            &transaction_id,
        ));

        let flow_id = FlowId::from(transaction_id);
        let inserted = registry.insert(flow_id.clone(), &flow);
        debug_assert!(inserted, "a fresh transaction id should always be free");

        drop(registry);

        info!(flow_id = flow_id.as_str(), "Started a to-device verification");
        self.notify_new_session(&flow);

        flow
    }

    /// Remove the session of a flow that is over.
    ///
    /// The session is found by the identity of the flow, so this works for
    /// sessions started with [`verify_user()`] whose key the caller doesn't
    /// know. A flow that is still waiting for its key won't be registered
    /// anymore.
    ///
    /// Returns true if a registered session was removed.
    ///
    /// [`verify_user()`]: Self::verify_user
    pub fn remove_session(&self, flow: &Fa::Flow) -> bool {
        match self.inner.registry.write().unwrap().remove(flow) {
            Some(flow_id) => {
                debug!(flow_id = flow_id.as_str(), "Removed a verification session");
                true
            }
            None => false,
        }
    }

    /// Remove the sessions whose flows are done, cancelled or have been
    /// dropped by everyone else.
    ///
    /// Returns the number of removed sessions.
    pub fn garbage_collect(&self) -> usize {
        let removed = self.inner.registry.write().unwrap().garbage_collect();

        if removed > 0 {
            debug!(removed, "Garbage collected verification sessions");
        }

        removed
    }
}
