//! Session state: the participant registry, master election, turn queue
//! storage, and broadcast fan-out.
//!
//! All of this state is owned exclusively by the [`Coordinator`] task; other
//! tasks interact with it only through the command stream. That is what makes
//! the mutations here safe without any locking.
//!
//! [`Coordinator`]: super::coordinator::Coordinator

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::mpsc;

use crate::common::time::now_millis;

use super::message::ServerEvent;

/// Per-connection outbox capacity. Fan-out drops the newest message for a
/// connection whose outbox is full rather than blocking the coordinator.
pub const OUTBOX_CAPACITY: usize = 256;

/// Display name given to synthetic queue entries.
pub const VIRTUAL_USER_NAME: &str = "Virtual user";

/// Opaque handle for a registered participant, allocated monotonically.
/// Ordering by `ConnId` is join order, which master election relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnId(u64);

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegisterError {
    #[error("display name must not be empty")]
    EmptyName,
}

/// A meeting participant.
///
/// A participant with an outbox is a live connection; a virtual participant
/// (queue filler injected by the master) has none and never receives
/// notifications.
pub struct Participant {
    pub name: String,
    /// Unix timestamp (milliseconds, UTC) of the connection handshake.
    pub joined_at: i64,
    pub is_master: bool,
    pub has_spoken: bool,
    pub speaking: bool,
    /// Total time this participant has held the floor.
    pub turn_duration: Duration,
    pub(super) speaking_since: Option<Instant>,
    outbox: Option<mpsc::Sender<String>>,
}

impl Participant {
    fn connected(name: String, outbox: mpsc::Sender<String>) -> Self {
        Self {
            name,
            joined_at: now_millis(),
            is_master: false,
            has_spoken: false,
            speaking: false,
            turn_duration: Duration::ZERO,
            speaking_since: None,
            outbox: Some(outbox),
        }
    }

    fn virtual_user() -> Self {
        Self {
            name: VIRTUAL_USER_NAME.to_string(),
            joined_at: now_millis(),
            is_master: false,
            has_spoken: true,
            speaking: false,
            turn_duration: Duration::ZERO,
            speaking_since: None,
            outbox: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.outbox.is_some()
    }
}

/// Whether the traffic-light gate accepts button presses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Closed,
    /// A gate-open request was accepted and its random delay is in flight.
    /// Further requests are rejected until the delay fires or a reset lands.
    Pending,
    Open,
}

/// The process-wide meeting state, one instance per server.
pub struct SessionState {
    pub started: bool,
    pub gate: GateState,
    /// Bumped on every gate schedule and on reset so a stale delayed
    /// gate-open command can be recognized and discarded.
    pub gate_epoch: u64,
    /// FIFO speaking queue. Holds no duplicates and never the current speaker.
    pub queue: VecDeque<ConnId>,
    pub current_speaker: Option<ConnId>,
    pub master: Option<ConnId>,
    /// Participants who pressed the button during the current gate window.
    pub pressed: HashSet<ConnId>,
    /// All known participants (connected and virtual), ordered by join.
    pub participants: BTreeMap<ConnId, Participant>,
    next_id: u64,
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            started: false,
            gate: GateState::Closed,
            gate_epoch: 0,
            queue: VecDeque::new(),
            current_speaker: None,
            master: None,
            pressed: HashSet::new(),
            participants: BTreeMap::new(),
            next_id: 0,
        }
    }

    fn alloc_id(&mut self) -> ConnId {
        let id = ConnId(self.next_id);
        self.next_id += 1;
        id
    }

    // --- connection registry -------------------------------------------------

    /// Register a new connected participant. Fails if the display name is
    /// empty after trimming; the caller should reject the connection.
    pub fn register(
        &mut self,
        name: &str,
        outbox: mpsc::Sender<String>,
    ) -> Result<ConnId, RegisterError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(RegisterError::EmptyName);
        }
        let id = self.alloc_id();
        self.participants
            .insert(id, Participant::connected(name.to_string(), outbox));
        Ok(id)
    }

    /// Inject a synthetic participant used to pad the turn queue.
    pub fn register_virtual(&mut self) -> ConnId {
        let id = self.alloc_id();
        self.participants.insert(id, Participant::virtual_user());
        id
    }

    /// Remove a participant, excising them from the queue (preserving the
    /// relative order of the rest) and the pressed set. Idempotent: a second
    /// call for the same handle returns `None` and changes nothing.
    pub fn unregister(&mut self, id: ConnId) -> Option<Participant> {
        let participant = self.participants.remove(&id)?;
        self.queue.retain(|&queued| queued != id);
        self.pressed.remove(&id);
        if self.master == Some(id) {
            self.master = None;
        }
        if self.current_speaker == Some(id) {
            self.current_speaker = None;
        }
        Some(participant)
    }

    pub fn participant(&self, id: ConnId) -> Option<&Participant> {
        self.participants.get(&id)
    }

    /// Number of connected (non-virtual) participants.
    pub fn count(&self) -> usize {
        self.participants
            .values()
            .filter(|p| p.is_connected())
            .count()
    }

    /// Connected participant names, in join order.
    pub fn user_list(&self) -> Vec<String> {
        self.participants
            .values()
            .filter(|p| p.is_connected())
            .map(|p| p.name.clone())
            .collect()
    }

    /// Queued participant names, in speaking order.
    pub fn turn_order(&self) -> Vec<String> {
        self.queue
            .iter()
            .filter_map(|id| self.participants.get(id))
            .map(|p| p.name.clone())
            .collect()
    }

    // --- master election -----------------------------------------------------

    /// If no master currently holds the role, promote the first remaining
    /// connected participant and return its handle. No-op otherwise.
    pub fn elect_master_if_absent(&mut self) -> Option<ConnId> {
        if self.master.is_some() {
            return None;
        }
        let id = self
            .participants
            .iter()
            .find(|(_, p)| p.is_connected())
            .map(|(&id, _)| id)?;
        if let Some(p) = self.participants.get_mut(&id) {
            p.is_master = true;
        }
        self.master = Some(id);
        Some(id)
    }

    pub fn is_master(&self, id: ConnId) -> bool {
        self.master == Some(id)
    }

    // --- broadcast fan-out ---------------------------------------------------

    /// Deliver an event to every connected participant. Best effort: a full
    /// or closed outbox drops the message for that connection only and never
    /// blocks the coordinator.
    pub fn broadcast(&self, event: &ServerEvent) {
        let json = event.to_json();
        for participant in self.participants.values() {
            let Some(outbox) = &participant.outbox else {
                continue;
            };
            if let Err(e) = outbox.try_send(json.clone()) {
                tracing::warn!(
                    "dropping broadcast for '{}': outbox unavailable ({e})",
                    participant.name
                );
            }
        }
    }

    /// Deliver a targeted event to a single participant, best effort.
    pub fn send_to(&self, id: ConnId, event: &ServerEvent) {
        let Some(participant) = self.participants.get(&id) else {
            return;
        };
        let Some(outbox) = &participant.outbox else {
            return;
        };
        if let Err(e) = outbox.try_send(event.to_json()) {
            tracing::warn!(
                "dropping targeted message for '{}': outbox unavailable ({e})",
                participant.name
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outbox() -> (mpsc::Sender<String>, mpsc::Receiver<String>) {
        mpsc::channel(OUTBOX_CAPACITY)
    }

    fn register(state: &mut SessionState, name: &str) -> ConnId {
        let (tx, rx) = outbox();
        // Receivers are intentionally leaked so try_send keeps succeeding.
        std::mem::forget(rx);
        let id = state.register(name, tx).unwrap();
        state.elect_master_if_absent();
        id
    }

    #[test]
    fn test_register_rejects_blank_name() {
        // given (precondition):
        let mut state = SessionState::new();
        let (tx, _rx) = outbox();

        // when (operation):
        let result = state.register("   ", tx);

        // then (expected result):
        assert_eq!(result.unwrap_err(), RegisterError::EmptyName);
        assert_eq!(state.count(), 0);
    }

    #[test]
    fn test_first_connector_becomes_master() {
        // given (precondition):
        let mut state = SessionState::new();

        // when (operation):
        let alice = register(&mut state, "alice");
        let bob = register(&mut state, "bob");

        // then (expected result):
        assert!(state.is_master(alice));
        assert!(!state.is_master(bob));
        assert_eq!(state.user_list(), vec!["alice", "bob"]);
    }

    #[test]
    fn test_master_uniqueness_across_joins_and_leaves() {
        // given (precondition):
        let mut state = SessionState::new();
        let ids: Vec<ConnId> = ["a", "b", "c", "d"]
            .iter()
            .map(|n| register(&mut state, n))
            .collect();

        // when (operation): remove participants one by one, re-electing each time
        for &leaving in &ids {
            let master_count = state
                .participants
                .values()
                .filter(|p| p.is_master)
                .count();
            assert_eq!(master_count, 1);

            state.unregister(leaving);
            state.elect_master_if_absent();
        }

        // then (expected result): empty registry holds no master
        assert_eq!(state.count(), 0);
        assert_eq!(state.master, None);
    }

    #[test]
    fn test_unregister_is_idempotent() {
        // given (precondition):
        let mut state = SessionState::new();
        let alice = register(&mut state, "alice");

        // when (operation):
        let first = state.unregister(alice);
        let second = state.unregister(alice);

        // then (expected result):
        assert!(first.is_some());
        assert!(second.is_none());
    }

    #[test]
    fn test_unregister_excises_queue_preserving_order() {
        // given (precondition):
        let mut state = SessionState::new();
        let a = register(&mut state, "a");
        let b = register(&mut state, "b");
        let c = register(&mut state, "c");
        state.queue.extend([a, b, c]);
        state.pressed.extend([a, b, c]);

        // when (operation):
        state.unregister(b);

        // then (expected result):
        assert_eq!(state.queue, VecDeque::from([a, c]));
        assert!(!state.pressed.contains(&b));
    }

    #[test]
    fn test_reelection_picks_first_remaining_by_join_order() {
        // given (precondition):
        let mut state = SessionState::new();
        let a = register(&mut state, "a");
        let b = register(&mut state, "b");
        let c = register(&mut state, "c");

        // when (operation):
        state.unregister(a);
        let new_master = state.elect_master_if_absent();

        // then (expected result):
        assert_eq!(new_master, Some(b));
        assert!(state.is_master(b));
        assert!(!state.is_master(c));
    }

    #[test]
    fn test_virtual_user_excluded_from_user_list_and_count() {
        // given (precondition):
        let mut state = SessionState::new();
        register(&mut state, "alice");

        // when (operation):
        let virtual_id = state.register_virtual();
        state.queue.push_back(virtual_id);

        // then (expected result):
        assert_eq!(state.count(), 1);
        assert_eq!(state.user_list(), vec!["alice"]);
        assert_eq!(state.turn_order(), vec![VIRTUAL_USER_NAME]);
        assert!(state.participant(virtual_id).unwrap().has_spoken);
    }

    #[test]
    fn test_virtual_user_never_elected_master() {
        // given (precondition):
        let mut state = SessionState::new();
        state.register_virtual();

        // when (operation):
        let elected = state.elect_master_if_absent();

        // then (expected result):
        assert_eq!(elected, None);
        assert_eq!(state.master, None);
    }

    #[tokio::test]
    async fn test_broadcast_skips_full_outbox_without_blocking() {
        // given (precondition): bob's outbox has capacity 1 and is already full
        let mut state = SessionState::new();
        let (alice_tx, mut alice_rx) = outbox();
        state.register("alice", alice_tx).unwrap();
        let (bob_tx, mut bob_rx) = mpsc::channel(1);
        state.register("bob", bob_tx).unwrap();
        state.broadcast(&ServerEvent::MeetingReset); // fills bob's outbox

        // when (operation):
        state.broadcast(&ServerEvent::MeetingState {
            meeting_started: true,
            semaphore_green: false,
        });

        // then (expected result): alice got both, bob only the first
        assert!(alice_rx.try_recv().is_ok());
        assert!(alice_rx.try_recv().is_ok());
        assert!(bob_rx.try_recv().is_ok());
        assert!(bob_rx.try_recv().is_err());
    }
}
