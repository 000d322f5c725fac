// Copyright 2022 The Matrix.org Foundation C.I.C.
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
    collections::{BTreeMap, BTreeSet},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use once_cell::sync::Lazy;
use ruma::{
    device_id, user_id, EventId, MilliSecondsSinceUnixEpoch, OwnedDeviceId, OwnedEventId,
    OwnedRoomId, OwnedTransactionId, OwnedUserId, RoomId, TransactionId, UInt, UserId,
};

use crate::{
    directory::{RoomDirectory, RoomInfo},
    error::DirectoryError,
    events::{
        KeyVerificationRequestContent, RoomVerificationRequestEvent,
        ToDeviceKeyVerificationRequestContent, ToDeviceKeyVerificationStartContent,
        ToDeviceVerificationContent, VerificationMethod,
    },
    flow::{FlowFactory, VerificationFlow},
    VerificationManager, VerificationManagerConfig,
};

/// A user id that plays the role of the logged in user in tests.
pub static ALICE: Lazy<&UserId> = Lazy::new(|| user_id!("@alice:example.org"));
/// A user id that plays the role of the other side in tests.
pub static BOB: Lazy<&UserId> = Lazy::new(|| user_id!("@bob:example.org"));

/// A [`VerificationManager`] wired up with the test doubles of this module.
pub type TestManager = VerificationManager<Arc<MemoryDirectory>, Arc<TestFlowFactory>>;

#[derive(Debug)]
struct MemoryRoom {
    is_encrypted: bool,
    members: Vec<OwnedUserId>,
}

/// A [`RoomDirectory`] that keeps its rooms in memory.
#[derive(Debug, Default)]
pub struct MemoryDirectory {
    rooms: Mutex<BTreeMap<OwnedRoomId, MemoryRoom>>,
    failing_rooms: Mutex<BTreeSet<OwnedRoomId>>,
    fail_listing: AtomicBool,
}

impl MemoryDirectory {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a joined room with the given members.
    pub fn add_room(&self, room_id: &RoomId, is_encrypted: bool, members: &[&UserId]) {
        let room = MemoryRoom {
            is_encrypted,
            members: members.iter().map(|&m| m.to_owned()).collect(),
        };

        self.rooms.lock().unwrap().insert(room_id.to_owned(), room);
    }

    /// Make every query about the given room fail.
    pub fn fail_room(&self, room_id: &RoomId) {
        self.failing_rooms.lock().unwrap().insert(room_id.to_owned());
    }

    /// Make listing the joined rooms fail.
    pub fn fail_listing(&self, fail: bool) {
        self.fail_listing.store(fail, Ordering::SeqCst);
    }

    fn with_room<T>(
        &self,
        room_id: &RoomId,
        f: impl FnOnce(&MemoryRoom) -> T,
    ) -> Result<T, DirectoryError> {
        if self.failing_rooms.lock().unwrap().contains(room_id) {
            return Err(DirectoryError::Backend("the room store is unavailable".into()));
        }

        self.rooms
            .lock()
            .unwrap()
            .get(room_id)
            .map(f)
            .ok_or_else(|| DirectoryError::UnknownRoom(room_id.to_owned()))
    }
}

impl RoomDirectory for MemoryDirectory {
    fn joined_room_ids(&self) -> Result<Vec<OwnedRoomId>, DirectoryError> {
        if self.fail_listing.load(Ordering::SeqCst) {
            return Err(DirectoryError::Backend("the room store is unavailable".into()));
        }

        Ok(self.rooms.lock().unwrap().keys().cloned().collect())
    }

    fn room_info(&self, room_id: &RoomId) -> Result<RoomInfo, DirectoryError> {
        self.with_room(room_id, |room| RoomInfo {
            member_count: room.members.len() as u64,
            is_encrypted: room.is_encrypted,
        })
    }

    fn room_members(&self, room_id: &RoomId) -> Result<Vec<OwnedUserId>, DirectoryError> {
        self.with_room(room_id, |room| room.members.clone())
    }
}

/// How a [`TestFlow`] came to be.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TestFlowKind {
    /// Created by hand.
    Manual,
    /// Created for an inbound to-device request.
    ToDeviceRequest {
        /// The transaction id of the request.
        transaction_id: OwnedTransactionId,
    },
    /// Created for an inbound to-device start message.
    ToDeviceStart {
        /// The transaction id of the start message.
        transaction_id: OwnedTransactionId,
    },
    /// Created for an inbound in-room request.
    InRoom {
        /// The room the request was sent in.
        room_id: OwnedRoomId,
        /// The event id of the request.
        event_id: OwnedEventId,
    },
    /// Created by [`VerificationManager::verify_user()`].
    UserVerification {
        /// The room the verification happens in.
        room_id: OwnedRoomId,
    },
    /// Created by [`VerificationManager::verify_one_of_devices()`].
    DeviceVerification {
        /// The transaction id the manager picked.
        transaction_id: OwnedTransactionId,
        /// The devices that were asked.
        device_ids: Vec<OwnedDeviceId>,
    },
}

/// A [`VerificationFlow`] without any state machine, it only records how it
/// was created.
#[derive(Debug)]
pub struct TestFlow {
    other_user_id: OwnedUserId,
    kind: TestFlowKind,
    done: AtomicBool,
    cancelled: AtomicBool,
}

impl TestFlow {
    /// Create a new flow with the given user.
    pub fn new(other_user_id: &UserId) -> Self {
        Self::with_kind(other_user_id, TestFlowKind::Manual)
    }

    fn with_kind(other_user_id: &UserId, kind: TestFlowKind) -> Self {
        Self {
            other_user_id: other_user_id.to_owned(),
            kind,
            done: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
        }
    }

    /// How this flow was created.
    pub fn kind(&self) -> &TestFlowKind {
        &self.kind
    }

    /// Finish the verification successfully.
    pub fn mark_as_done(&self) {
        self.done.store(true, Ordering::SeqCst);
    }

    /// Cancel the verification.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

impl VerificationFlow for TestFlow {
    fn other_user_id(&self) -> &UserId {
        &self.other_user_id
    }

    fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// A [`FlowFactory`] creating [`TestFlow`]s.
#[derive(Debug, Default)]
pub struct TestFlowFactory {
    refuse_inbound: AtomicBool,
    created: AtomicUsize,
}

impl TestFlowFactory {
    /// Create a new factory that accepts every inbound request.
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse to create flows for inbound requests, as if they were
    /// malformed.
    pub fn refuse_inbound(&self, refuse: bool) {
        self.refuse_inbound.store(refuse, Ordering::SeqCst);
    }

    /// The number of flows this factory created.
    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    fn create(&self, other_user_id: &UserId, kind: TestFlowKind) -> TestFlow {
        self.created.fetch_add(1, Ordering::SeqCst);
        TestFlow::with_kind(other_user_id, kind)
    }

    fn create_inbound(&self, other_user_id: &UserId, kind: TestFlowKind) -> Option<TestFlow> {
        (!self.refuse_inbound.load(Ordering::SeqCst)).then(|| self.create(other_user_id, kind))
    }
}

impl FlowFactory for TestFlowFactory {
    type Flow = TestFlow;

    fn new_in_room_verification(
        &self,
        room_id: &RoomId,
        _content: &KeyVerificationRequestContent,
        sender: &UserId,
        event_id: &EventId,
    ) -> Option<TestFlow> {
        self.create_inbound(
            sender,
            TestFlowKind::InRoom { room_id: room_id.to_owned(), event_id: event_id.to_owned() },
        )
    }

    fn new_to_device_verification(
        &self,
        content: ToDeviceVerificationContent<'_>,
        sender: &UserId,
        transaction_id: &TransactionId,
    ) -> Option<TestFlow> {
        let transaction_id = transaction_id.to_owned();

        let kind = match content {
            ToDeviceVerificationContent::Request(_) => {
                TestFlowKind::ToDeviceRequest { transaction_id }
            }
            ToDeviceVerificationContent::Start(_) => TestFlowKind::ToDeviceStart { transaction_id },
        };

        self.create_inbound(sender, kind)
    }

    fn initiate_user_verification(&self, room_id: &RoomId, user_id: &UserId) -> TestFlow {
        self.create(user_id, TestFlowKind::UserVerification { room_id: room_id.to_owned() })
    }

    fn initiate_device_verification(
        &self,
        user_id: &UserId,
        device_ids: &[OwnedDeviceId],
        transaction_id: &TransactionId,
    ) -> TestFlow {
        self.create(
            user_id,
            TestFlowKind::DeviceVerification {
                transaction_id: transaction_id.to_owned(),
                device_ids: device_ids.to_vec(),
            },
        )
    }
}

/// A to-device request content, with the given transaction id.
pub fn to_device_request(transaction_id: Option<&str>) -> ToDeviceKeyVerificationRequestContent {
    ToDeviceKeyVerificationRequestContent {
        from_device: device_id!("ALICEDEVICE").to_owned(),
        transaction_id: transaction_id.map(OwnedTransactionId::from),
        methods: vec![VerificationMethod::SasV1],
        timestamp: Some(MilliSecondsSinceUnixEpoch::now()),
    }
}

/// A to-device start content for a SAS verification, with the given
/// transaction id.
pub fn to_device_start(transaction_id: Option<&str>) -> ToDeviceKeyVerificationStartContent {
    ToDeviceKeyVerificationStartContent {
        from_device: device_id!("ALICEDEVICE").to_owned(),
        transaction_id: transaction_id.map(OwnedTransactionId::from),
        method: "m.sas.v1".to_owned(),
        method_content: Default::default(),
    }
}

/// An in-room verification request sent by `sender` to `to`.
pub fn room_request(event_id: &str, sender: &UserId, to: &UserId) -> RoomVerificationRequestEvent {
    RoomVerificationRequestEvent {
        event_id: EventId::parse(event_id).expect("test event ids should be valid"),
        sender: sender.to_owned(),
        origin_server_ts: MilliSecondsSinceUnixEpoch(UInt::MIN),
        content: KeyVerificationRequestContent {
            from_device: device_id!("ALICEDEVICE").to_owned(),
            methods: vec![VerificationMethod::SasV1],
            to: to.to_owned(),
            body: format!("{sender} is requesting to verify your key"),
        },
    }
}

/// Create a manager with an empty directory and a fresh factory, using the
/// default settings.
pub fn test_manager() -> (TestManager, Arc<MemoryDirectory>, Arc<TestFlowFactory>) {
    test_manager_with_config(VerificationManagerConfig::new())
}

/// Create a manager with an empty directory and a fresh factory.
pub fn test_manager_with_config(
    config: VerificationManagerConfig,
) -> (TestManager, Arc<MemoryDirectory>, Arc<TestFlowFactory>) {
    let directory = Arc::new(MemoryDirectory::new());
    let factory = Arc::new(TestFlowFactory::new());
    let manager = VerificationManager::new(directory.clone(), factory.clone(), config);

    (manager, directory, factory)
}
