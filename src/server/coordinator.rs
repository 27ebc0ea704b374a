//! The session coordinator: a single task that owns all meeting state.
//!
//! Per-connection reader tasks never touch shared state; they enqueue
//! [`Command`]s onto one mpsc stream, and the coordinator applies them
//! strictly in arrival order. The gate-reopen timer feeds its expiry back
//! into the same stream, so timer effects are ordered relative to every
//! other command instead of mutating state from a callback.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use rand::Rng;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use super::message::{ClientCommand, ServerEvent};
use super::state::{ConnId, GateState, RegisterError, SessionState};

/// Bounds for the random delay between a gate-open request and the gate
/// actually opening.
const GATE_DELAY_MIN_MS: u64 = 2000;
const GATE_DELAY_MAX_MS: u64 = 5000;

const MEETING_END_TEXT: &str = "The meeting has ended. Thanks for participating!";

/// Commands consumed by the coordinator, in arrival order.
#[derive(Debug)]
pub enum Command {
    /// A connection completed its handshake. The reply carries the assigned
    /// handle, or the registration error if the connection must be rejected.
    Join {
        name: String,
        outbox: mpsc::Sender<String>,
        reply: oneshot::Sender<Result<ConnId, RegisterError>>,
    },
    /// A connection closed or errored. Idempotent: read and write failures
    /// racing each other produce at most one removal.
    Leave(ConnId),
    /// A command issued by a participant over their connection.
    Client { id: ConnId, command: ClientCommand },
    /// The gate-open delay elapsed. Discarded unless the epoch still matches
    /// the pending gate request.
    GateElapsed { epoch: u64 },
    /// Out-of-band administrative reset (the HTTP endpoint), no privilege
    /// check because it does not originate from a connection.
    Reset,
}

/// Why a client command was dropped. Rejections never change state and never
/// produce a reply to the sender; they are only logged.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Rejection {
    #[error("sender is not the master")]
    NotMaster,
    #[error("sender is not a registered participant")]
    UnknownParticipant,
    #[error("meeting already started")]
    AlreadyStarted,
    #[error("meeting has not started")]
    NotStarted,
    #[error("a gate request is already pending or open")]
    GateBusy,
    #[error("gate is not open")]
    GateClosed,
    #[error("already signalled in this gate window")]
    AlreadyPressed,
    #[error("sender is not the current speaker")]
    NotSpeaker,
    #[error("no active speaker")]
    NoSpeaker,
}

/// Single consumer of the command stream and sole owner of [`SessionState`].
pub struct Coordinator {
    state: SessionState,
    /// Used to feed the delayed gate-open back into the command stream.
    commands: mpsc::UnboundedSender<Command>,
}

impl Coordinator {
    pub fn new(commands: mpsc::UnboundedSender<Command>) -> Self {
        Self {
            state: SessionState::new(),
            commands,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Consume the command stream until every sender is gone.
    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = commands.recv().await {
            self.apply(command);
        }
        tracing::debug!("command stream closed; coordinator stopping");
    }

    /// Apply one command. Never suspends; all mutation happens here.
    pub fn apply(&mut self, command: Command) {
        match command {
            Command::Join {
                name,
                outbox,
                reply,
            } => {
                let _ = reply.send(self.join(&name, outbox));
            }
            Command::Leave(id) => self.leave(id),
            Command::Client { id, command } => {
                if let Err(rejection) = self.handle_client(id, command) {
                    tracing::debug!("command from {id} rejected: {rejection}");
                }
            }
            Command::GateElapsed { epoch } => self.gate_elapsed(epoch),
            Command::Reset => self.reset(),
        }
    }

    fn join(
        &mut self,
        name: &str,
        outbox: mpsc::Sender<String>,
    ) -> Result<ConnId, RegisterError> {
        let id = self.state.register(name, outbox)?;
        self.state.elect_master_if_absent();
        let is_master = self.state.is_master(id);
        tracing::info!(
            "participant '{}' connected as {id}{}",
            name.trim(),
            if is_master { " (master)" } else { "" }
        );
        self.state.send_to(id, &ServerEvent::InitialRole { is_master });
        self.state.send_to(id, &self.meeting_state());
        self.state
            .broadcast(&ServerEvent::UserList(self.state.user_list()));
        Ok(id)
    }

    fn leave(&mut self, id: ConnId) {
        let was_master = self.state.is_master(id);
        let was_speaker = self.state.current_speaker == Some(id);
        let Some(participant) = self.state.unregister(id) else {
            return;
        };
        tracing::info!("participant '{}' ({id}) disconnected", participant.name);

        // Re-elect before anything else is broadcast, so every subsequent
        // notification already reflects the new master.
        if was_master {
            if let Some(new_master) = self.state.elect_master_if_absent() {
                self.state.send_to(new_master, &ServerEvent::YouAreMaster);
            }
        }
        self.state
            .broadcast(&ServerEvent::UserList(self.state.user_list()));
        self.state
            .broadcast(&ServerEvent::TurnOrder(self.state.turn_order()));
        if was_speaker {
            self.advance();
        }
    }

    fn handle_client(&mut self, id: ConnId, command: ClientCommand) -> Result<(), Rejection> {
        if self.state.participant(id).is_none() {
            return Err(Rejection::UnknownParticipant);
        }
        match command {
            ClientCommand::StartMeeting => self.start_meeting(id),
            ClientCommand::StartSemaphore => self.start_semaphore(id),
            ClientCommand::PressButton => self.press_button(id),
            ClientCommand::EndTurn => {
                if self.state.current_speaker != Some(id) {
                    return Err(Rejection::NotSpeaker);
                }
                self.finish_turn();
                Ok(())
            }
            // Two wire tags, one privileged "advance now" operation.
            ClientCommand::ForceEndTurn | ClientCommand::SkipTurn => {
                self.require_master(id)?;
                if self.state.current_speaker.is_none() {
                    return Err(Rejection::NoSpeaker);
                }
                self.finish_turn();
                Ok(())
            }
            ClientCommand::ResetMeeting => {
                self.require_master(id)?;
                self.reset();
                Ok(())
            }
            ClientCommand::AddVirtualUser => {
                self.require_master(id)?;
                self.add_virtual_user();
                Ok(())
            }
            ClientCommand::ReorderTurnOrder(names) => {
                self.require_master(id)?;
                self.reorder(&names);
                Ok(())
            }
        }
    }

    fn require_master(&self, id: ConnId) -> Result<(), Rejection> {
        if self.state.is_master(id) {
            Ok(())
        } else {
            Err(Rejection::NotMaster)
        }
    }

    fn meeting_state(&self) -> ServerEvent {
        ServerEvent::MeetingState {
            meeting_started: self.state.started,
            semaphore_green: self.state.gate == GateState::Open,
        }
    }

    fn start_meeting(&mut self, id: ConnId) -> Result<(), Rejection> {
        self.require_master(id)?;
        if self.state.started {
            return Err(Rejection::AlreadyStarted);
        }
        self.state.started = true;
        self.state.pressed.clear();
        tracing::info!("meeting started");
        self.state.broadcast(&self.meeting_state());
        Ok(())
    }

    fn start_semaphore(&mut self, id: ConnId) -> Result<(), Rejection> {
        self.require_master(id)?;
        if !self.state.started {
            return Err(Rejection::NotStarted);
        }
        if self.state.gate != GateState::Closed {
            return Err(Rejection::GateBusy);
        }
        // A new gate window begins: announce the red light first, then flip
        // to green only when the delayed command comes back through the
        // stream.
        self.state.pressed.clear();
        self.state.broadcast(&self.meeting_state());
        self.state.gate = GateState::Pending;
        self.state.gate_epoch += 1;
        self.schedule_gate_open(self.state.gate_epoch);
        Ok(())
    }

    fn schedule_gate_open(&self, epoch: u64) {
        let delay = Duration::from_millis(
            rand::thread_rng().gen_range(GATE_DELAY_MIN_MS..GATE_DELAY_MAX_MS),
        );
        tracing::info!("gate opens in {delay:?}");
        let commands = self.commands.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = commands.send(Command::GateElapsed { epoch });
        });
    }

    fn gate_elapsed(&mut self, epoch: u64) {
        if self.state.gate != GateState::Pending || epoch != self.state.gate_epoch {
            tracing::debug!("discarding stale gate timer (epoch {epoch})");
            return;
        }
        self.state.gate = GateState::Open;
        tracing::info!("gate is open");
        self.state.broadcast(&self.meeting_state());
    }

    fn press_button(&mut self, id: ConnId) -> Result<(), Rejection> {
        if self.state.gate != GateState::Open {
            return Err(Rejection::GateClosed);
        }
        if self.state.pressed.contains(&id) {
            return Err(Rejection::AlreadyPressed);
        }
        self.state.pressed.insert(id);
        if !self.state.queue.contains(&id) && self.state.current_speaker != Some(id) {
            self.state.queue.push_back(id);
        }
        self.state
            .broadcast(&ServerEvent::TurnOrder(self.state.turn_order()));
        // Advance policy: the first press while the floor is free starts a
        // turn immediately, with the queue head speaking.
        if self.state.current_speaker.is_none() {
            self.advance();
        }
        Ok(())
    }

    /// Pop the queue head into the speaker slot, or end the meeting if the
    /// queue is exhausted.
    fn advance(&mut self) {
        let Some(next) = self.state.queue.pop_front() else {
            tracing::info!("turn queue exhausted; ending the meeting");
            self.state
                .broadcast(&ServerEvent::MeetingEnd(MEETING_END_TEXT.to_string()));
            self.reset();
            return;
        };
        self.state.current_speaker = Some(next);
        let name = match self.state.participants.get_mut(&next) {
            Some(p) => {
                p.has_spoken = true;
                p.speaking = true;
                p.speaking_since = Some(Instant::now());
                p.name.clone()
            }
            None => String::new(),
        };
        tracing::info!("next speaker: '{name}'");
        self.state
            .broadcast(&ServerEvent::TurnOrder(self.state.turn_order()));
        self.state.broadcast(&ServerEvent::NextSpeaker(name));
    }

    fn finish_turn(&mut self) {
        let Some(id) = self.state.current_speaker.take() else {
            return;
        };
        if let Some(p) = self.state.participants.get_mut(&id) {
            p.speaking = false;
            if let Some(since) = p.speaking_since.take() {
                p.turn_duration += since.elapsed();
            }
            tracing::info!("turn finished for '{}'", p.name);
        }
        self.advance();
    }

    fn add_virtual_user(&mut self) {
        let id = self.state.register_virtual();
        self.state.queue.push_back(id);
        tracing::info!("virtual participant {id} appended to the queue");
        self.state
            .broadcast(&ServerEvent::TurnOrder(self.state.turn_order()));
    }

    /// Rebuild the queue to match the given name order. Names not currently
    /// queued are ignored; queued entries missing from the list are dropped.
    fn reorder(&mut self, names: &[String]) {
        let mut remaining: VecDeque<ConnId> = std::mem::take(&mut self.state.queue);
        let mut reordered = VecDeque::with_capacity(remaining.len());
        for name in names {
            let found = remaining.iter().position(|&queued| {
                self.state
                    .participant(queued)
                    .is_some_and(|p| &p.name == name)
            });
            if let Some(pos) = found {
                if let Some(queued) = remaining.remove(pos) {
                    reordered.push_back(queued);
                }
            }
        }
        self.state.queue = reordered;
        self.state
            .broadcast(&ServerEvent::TurnOrder(self.state.turn_order()));
    }

    /// Return everything to the idle state. Notifies every connection first;
    /// dropping the outboxes then ends each connection's write loop, so the
    /// transport tears the sockets down. Stale `Leave` commands arriving
    /// afterwards hit the idempotent unregister path and no-op.
    fn reset(&mut self) {
        self.state.broadcast(&ServerEvent::MeetingReset);
        self.state.participants.clear();
        self.state.queue.clear();
        self.state.pressed.clear();
        self.state.current_speaker = None;
        self.state.master = None;
        self.state.started = false;
        self.state.gate = GateState::Closed;
        self.state.gate_epoch += 1;
        tracing::info!("meeting state reset");
    }
}
