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
    collections::HashMap,
    sync::{Arc, Weak},
};

use ruma::{EventId, OwnedRoomId, OwnedTransactionId, TransactionId};

use crate::{flow::VerificationFlow, identifiers::FlowId};

/// A registered verification session.
///
/// The registry doesn't own the flow, whoever displays the verification keeps
/// it alive.
#[derive(Debug)]
struct SessionEntry<F> {
    flow_id: FlowId,
    flow: Weak<F>,
}

/// A session whose key isn't known yet.
///
/// In-room verifications we start are keyed by the event id of the request
/// event, which we only learn once the event has been sent.
#[derive(Debug)]
struct PendingRegistration<F> {
    room_id: OwnedRoomId,
    flow: Weak<F>,
}

/// The outcome of binding a pending registration to its key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum BindResult {
    /// The session is now registered under the given flow id.
    Bound(FlowId),
    /// The flow has no pending registration, it was either already bound or
    /// removed in the meantime.
    NotPending,
    /// Another session is already registered under the given flow id, the
    /// pending registration was dropped.
    KeyTaken(FlowId),
}

fn is_same_flow<F>(weak: &Weak<F>, flow: &F) -> bool {
    std::ptr::eq(weak.as_ptr(), flow)
}

/// The map of active verification sessions, keyed by the transaction id of
/// to-device flows or the request event id of in-room flows.
#[derive(Debug)]
pub(crate) struct SessionRegistry<F> {
    sessions: HashMap<String, SessionEntry<F>>,
    pending: Vec<PendingRegistration<F>>,
}

impl<F> Default for SessionRegistry<F> {
    fn default() -> Self {
        Self { sessions: HashMap::new(), pending: Vec::new() }
    }
}

impl<F: VerificationFlow> SessionRegistry<F> {
    pub fn contains(&self, key: &str) -> bool {
        self.sessions.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<Arc<F>> {
        self.sessions.get(key)?.flow.upgrade()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Get all the sessions whose flow is still alive.
    pub fn sessions(&self) -> Vec<(FlowId, Arc<F>)> {
        self.sessions
            .values()
            .filter_map(|entry| Some((entry.flow_id.clone(), entry.flow.upgrade()?)))
            .collect()
    }

    /// Generate a transaction id no registered session is using.
    pub fn fresh_transaction_id(&self) -> OwnedTransactionId {
        loop {
            let transaction_id = TransactionId::new();

            if !self.contains(transaction_id.as_str()) {
                return transaction_id;
            }
        }
    }

    /// Register a session under the given flow id.
    ///
    /// Returns `false`, leaving the registry untouched, if a session is already
    /// registered under this flow id.
    pub fn insert(&mut self, flow_id: FlowId, flow: &Arc<F>) -> bool {
        if self.contains(flow_id.as_str()) {
            return false;
        }

        let entry = SessionEntry { flow_id, flow: Arc::downgrade(flow) };
        self.sessions.insert(entry.flow_id.as_str().to_owned(), entry);

        true
    }

    /// Remember a session that will be registered once its key is known.
    pub fn insert_pending(&mut self, room_id: OwnedRoomId, flow: &Arc<F>) {
        self.pending.push(PendingRegistration { room_id, flow: Arc::downgrade(flow) });
    }

    /// Register a pending session under the event id that was assigned to
    /// its request event.
    pub fn bind_pending(&mut self, flow: &F, event_id: &EventId) -> BindResult {
        let Some(position) = self.pending.iter().position(|p| is_same_flow(&p.flow, flow)) else {
            return BindResult::NotPending;
        };

        let pending = self.pending.swap_remove(position);
        let flow_id = FlowId::InRoom(pending.room_id, event_id.to_owned());

        if self.contains(flow_id.as_str()) {
            return BindResult::KeyTaken(flow_id);
        }

        let entry = SessionEntry { flow_id: flow_id.clone(), flow: pending.flow };
        self.sessions.insert(flow_id.as_str().to_owned(), entry);

        BindResult::Bound(flow_id)
    }

    /// Remove the session of the given flow.
    ///
    /// Sessions are matched by the identity of their flow, not by their key,
    /// the key of a deferred session isn't known to whoever created it. A
    /// pending registration of the flow is dropped as well.
    ///
    /// Returns the flow id the session was registered under, if any.
    pub fn remove(&mut self, flow: &F) -> Option<FlowId> {
        self.pending.retain(|p| !is_same_flow(&p.flow, flow));

        let key = self
            .sessions
            .iter()
            .find(|(_, entry)| is_same_flow(&entry.flow, flow))
            .map(|(key, _)| key.clone())?;

        self.sessions.remove(&key).map(|entry| entry.flow_id)
    }

    /// Is the given flow waiting for its key.
    pub fn is_pending(&self, flow: &F) -> bool {
        self.pending.iter().any(|p| is_same_flow(&p.flow, flow))
    }

    /// Remove the sessions whose flow has been dropped, finished or got
    /// cancelled.
    ///
    /// Returns the number of removed sessions.
    pub fn garbage_collect(&mut self) -> usize {
        let is_live =
            |flow: &Weak<F>| flow.upgrade().is_some_and(|f| !(f.is_done() || f.is_cancelled()));

        let before = self.sessions.len();

        self.sessions.retain(|_, entry| is_live(&entry.flow));
        self.pending.retain(|p| is_live(&p.flow));

        before - self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use ruma::{event_id, room_id, TransactionId};

    use super::{BindResult, SessionRegistry};
    use crate::{
        identifiers::FlowId,
        test_utils::{TestFlow, ALICE, BOB},
    };

    fn flow() -> Arc<TestFlow> {
        Arc::new(TestFlow::new(&ALICE))
    }

    #[test]
    fn insert_is_first_come_first_served() {
        let mut registry = SessionRegistry::default();
        let flow_id = FlowId::from(TransactionId::new());

        let first = flow();
        let second = flow();

        assert!(registry.insert(flow_id.clone(), &first));
        assert!(!registry.insert(flow_id.clone(), &second));

        assert_eq!(registry.len(), 1);
        let stored = registry.get(flow_id.as_str()).unwrap();
        assert!(Arc::ptr_eq(&stored, &first));
    }

    #[test]
    fn fresh_transaction_ids_are_free() {
        let mut registry = SessionRegistry::default();
        let flows: Vec<_> = (0..50).map(|_| flow()).collect();

        for flow in &flows {
            let transaction_id = registry.fresh_transaction_id();
            assert!(!registry.contains(transaction_id.as_str()));
            assert!(registry.insert(FlowId::from(transaction_id), flow));
        }

        assert_eq!(registry.len(), 50);
    }

    #[test]
    fn removal_is_by_identity() {
        let mut registry = SessionRegistry::default();
        let first = flow();
        let second = flow();
        let stranger = flow();

        let first_id = FlowId::from(TransactionId::new());
        let second_id = FlowId::from(TransactionId::new());

        registry.insert(first_id.clone(), &first);
        registry.insert(second_id.clone(), &second);

        assert!(registry.remove(&stranger).is_none());
        assert_eq!(registry.len(), 2);

        assert_eq!(registry.remove(&second), Some(second_id.clone()));
        assert!(!registry.contains(second_id.as_str()));
        assert!(registry.contains(first_id.as_str()));

        // Removing twice is a no-op.
        assert!(registry.remove(&second).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn pending_sessions_get_bound_once() {
        let mut registry = SessionRegistry::default();
        let room_id = room_id!("!dm:example.org");
        let flow = Arc::new(TestFlow::new(&BOB));

        registry.insert_pending(room_id.to_owned(), &flow);
        assert!(registry.is_pending(&flow));
        assert_eq!(registry.len(), 0);

        let result = registry.bind_pending(&flow, event_id!("$request"));
        assert_eq!(
            result,
            BindResult::Bound(FlowId::InRoom(room_id.to_owned(), event_id!("$request").to_owned()))
        );
        assert!(!registry.is_pending(&flow));
        assert!(registry.contains("$request"));

        assert_eq!(registry.bind_pending(&flow, event_id!("$other")), BindResult::NotPending);
        assert!(!registry.contains("$other"));
    }

    #[test]
    fn binding_to_a_taken_key_is_refused() {
        let mut registry = SessionRegistry::default();
        let room_id = room_id!("!dm:example.org");
        let inbound = flow();
        let outbound = flow();

        registry.insert(FlowId::from((room_id, event_id!("$request"))), &inbound);
        registry.insert_pending(room_id.to_owned(), &outbound);

        assert!(matches!(
            registry.bind_pending(&outbound, event_id!("$request")),
            BindResult::KeyTaken(_)
        ));
        assert!(Arc::ptr_eq(&registry.get("$request").unwrap(), &inbound));
        assert_eq!(registry.pending_len(), 0);
    }

    #[test]
    fn removing_a_pending_flow_cancels_the_binding() {
        let mut registry = SessionRegistry::default();
        let flow = flow();

        registry.insert_pending(room_id!("!dm:example.org").to_owned(), &flow);
        assert!(registry.remove(&flow).is_none());
        assert!(!registry.is_pending(&flow));

        assert_eq!(registry.bind_pending(&flow, event_id!("$request")), BindResult::NotPending);
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn garbage_collection() {
        let mut registry = SessionRegistry::default();

        let done = flow();
        let cancelled = flow();
        let dropped = flow();
        let live = flow();

        registry.insert(FlowId::from(TransactionId::new()), &done);
        registry.insert(FlowId::from(TransactionId::new()), &cancelled);
        registry.insert(FlowId::from(TransactionId::new()), &dropped);
        registry.insert(FlowId::from(TransactionId::new()), &live);

        done.mark_as_done();
        cancelled.cancel();
        drop(dropped);

        assert_eq!(registry.sessions().len(), 3);
        assert_eq!(registry.garbage_collect(), 3);
        assert_eq!(registry.len(), 1);

        let sessions = registry.sessions();
        assert!(Arc::ptr_eq(&sessions[0].1, &live));
    }
}
