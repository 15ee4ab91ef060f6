//! Rollback engine: speculative execution with rewind-and-replay.
//!
//! The engine owns input histories and the per-frame snapshot ring, and
//! drives the machine exclusively through a [`SessionHandler`]: saving a
//! frame hands it an owned snapshot buffer, loading borrows one back out
//! of the ring, and the rollback replay loop runs inside the engine so no
//! callback ever re-enters it. Outgoing gameplay datagrams accumulate
//! internally and are drained by the session runner, which owns the
//! transport.

pub mod input_queue;
pub mod protocol;
pub mod sync;

use std::collections::{BTreeMap, VecDeque};
use std::time::Instant;

use tracing::{debug, info, trace, warn};

use basalt_netproto::gameplay::{GameplayMessage, InputBatch, MAX_INPUT_BATCH};

use crate::constants::MAX_PLAYERS;
use crate::error::NetplayError;
use crate::input::NetInput;
use crate::machine::MachineSnapshot;
use crate::transport::PeerId;

use input_queue::InputQueue;
use protocol::{PeerEndpoint, SyncOutcome};
use sync::{SavedFrame, SavedFrames};

/// A frame is a single step of execution; -1 is "no frame".
pub type Frame = i32;
pub const NULL_FRAME: Frame = -1;

/// Player handles are the player numbers they were added with.
pub type PlayerHandle = usize;

/// Frames between timesync evaluations.
pub const TIMESYNC_INTERVAL: u32 = 240;

/// Confirmed frames between outgoing checksum reports.
const CHECKSUM_SEND_INTERVAL: Frame = 30;

/// Confirmed-frame checksums kept for desync comparison.
const CHECKSUM_HISTORY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerKind {
    Local,
    Remote(PeerId),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SessionEvent {
    ConnectedToPeer {
        player: PlayerHandle,
    },
    SynchronizingWithPeer {
        player: PlayerHandle,
        count: u32,
        total: u32,
    },
    SynchronizedWithPeer {
        player: PlayerHandle,
    },
    Running,
    TimeSync {
        frames_ahead: f32,
        interval: u32,
    },
    Desync {
        frame: Frame,
        our_checksum: u32,
        remote_checksum: u32,
    },
    DisconnectedFromPeer {
        player: PlayerHandle,
    },
}

/// Link statistics for one remote player.
#[derive(Debug, Clone, Copy, Default)]
pub struct NetworkStats {
    pub ping_ms: u32,
    pub local_frames_ahead: i32,
    pub remote_frames_ahead: i32,
}

/// Callbacks the session runner provides to the engine.
pub trait SessionHandler {
    /// Serialize the machine into an owned snapshot and compute the
    /// desync checksum for `frame`. Buffers come from the runner's pool.
    fn save_frame(&mut self, frame: Frame) -> Result<(Box<MachineSnapshot>, u32), NetplayError>;

    /// Restore the machine from a snapshot taken at `frame_to_load`.
    /// `rollback_frames` is how many frames will be replayed.
    fn load_frame(
        &mut self,
        snapshot: &MachineSnapshot,
        rollback_frames: u32,
        frame_to_load: Frame,
    ) -> Result<(), NetplayError>;

    /// Apply `inputs` and run the machine for exactly one frame.
    fn advance_frame(&mut self, inputs: &[NetInput; MAX_PLAYERS], disconnect_flags: u32);

    /// A snapshot buffer fell out of the ring; return it to the pool.
    fn free_snapshot(&mut self, snapshot: Box<MachineSnapshot>, frame: Frame);

    fn on_event(&mut self, event: SessionEvent);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EngineState {
    Synchronizing,
    Running,
}

pub struct RollbackSession {
    num_players: usize,
    max_rollback: u32,
    state: EngineState,
    queues: Vec<InputQueue>,
    endpoints: Vec<PeerEndpoint>,
    local_player: Option<PlayerHandle>,
    current_frame: Frame,
    last_confirmed_frame: Frame,
    saved: SavedFrames,
    initial_saved: bool,
    in_rollback: bool,
    pending_rollback: Frame,
    pending_events: VecDeque<SessionEvent>,
    outgoing: Vec<(PeerId, Vec<u8>)>,
    disconnect_flags: u32,
    local_checksums: BTreeMap<Frame, u32>,
    remote_checksums: BTreeMap<Frame, u32>,
    checksums_recorded_through: Frame,
    last_checksum_sent: Frame,
    next_timesync_frame: Frame,
    start: Instant,
}

impl RollbackSession {
    pub fn new(num_players: usize, max_rollback: u32) -> Self {
        debug_assert!(num_players >= 1 && num_players <= MAX_PLAYERS);
        Self {
            num_players,
            max_rollback,
            state: EngineState::Synchronizing,
            queues: (0..MAX_PLAYERS).map(|_| InputQueue::new()).collect(),
            endpoints: Vec::new(),
            local_player: None,
            current_frame: 0,
            last_confirmed_frame: NULL_FRAME,
            saved: SavedFrames::with_capacity(max_rollback as usize + 2),
            initial_saved: false,
            in_rollback: false,
            pending_rollback: NULL_FRAME,
            pending_events: VecDeque::new(),
            outgoing: Vec::new(),
            disconnect_flags: 0,
            local_checksums: BTreeMap::new(),
            remote_checksums: BTreeMap::new(),
            checksums_recorded_through: NULL_FRAME,
            last_checksum_sent: NULL_FRAME,
            next_timesync_frame: TIMESYNC_INTERVAL as Frame,
            start: Instant::now(),
        }
    }

    pub fn add_player(
        &mut self,
        kind: PlayerKind,
        player_number: usize,
    ) -> Result<PlayerHandle, NetplayError> {
        if player_number >= self.num_players {
            return Err(NetplayError::InvalidHandle(player_number));
        }
        match kind {
            PlayerKind::Local => {
                self.local_player = Some(player_number);
            }
            PlayerKind::Remote(peer) => {
                self.endpoints
                    .push(PeerEndpoint::new(peer, player_number, Instant::now()));
            }
        }
        Ok(player_number)
    }

    pub fn set_frame_delay(&mut self, handle: PlayerHandle, frames: u32) {
        if let Some(queue) = self.queues.get_mut(handle) {
            queue.set_frame_delay(frames);
        }
    }

    pub fn current_frame(&self) -> Frame {
        self.current_frame
    }

    pub fn is_running(&self) -> bool {
        self.state == EngineState::Running
    }

    /// True while a rewind-and-replay is executing frames.
    pub fn in_rollback(&self) -> bool {
        self.in_rollback
    }

    pub fn network_stats(&self, handle: PlayerHandle) -> Option<NetworkStats> {
        self.endpoints
            .iter()
            .find(|ep| ep.player_number == handle)
            .map(|ep| NetworkStats {
                ping_ms: ep.ping_ms,
                local_frames_ahead: self.current_frame - ep.last_received_frame,
                remote_frames_ahead: ep.remote_frame_advantage,
            })
    }

    /// Datagrams produced since the last drain, ready for the gameplay
    /// channel.
    pub fn take_outgoing(&mut self) -> Vec<(PeerId, Vec<u8>)> {
        std::mem::take(&mut self.outgoing)
    }

    /// Queue the local input for the current frame and ship it to every
    /// remote. Fails with `PredictionThreshold` once the speculation
    /// window is exhausted; the caller skips the frame and keeps polling.
    pub fn add_local_input(
        &mut self,
        handle: PlayerHandle,
        input: NetInput,
    ) -> Result<(), NetplayError> {
        if self.state != EngineState::Running {
            return Err(NetplayError::NotSynchronized);
        }
        if self.local_player != Some(handle) {
            return Err(NetplayError::InvalidHandle(handle));
        }
        if self.frames_speculated() >= self.max_rollback as i32 {
            return Err(NetplayError::PredictionThreshold);
        }

        let actual = self.queues[handle].add_local(self.current_frame, input);
        trace!(frame = self.current_frame, actual, "local input queued");

        let current_frame = self.current_frame;
        let mut batches = Vec::new();
        for ep in &self.endpoints {
            if ep.disconnected || !ep.is_running() {
                continue;
            }
            let from = (ep.last_acked_frame + 1).max(actual - (MAX_INPUT_BATCH as i32 - 1)).max(0);
            let inputs = self.queues[handle].confirmed_range(from, actual);
            if inputs.is_empty() {
                continue;
            }
            let start_frame = inputs[0].0;
            let batch = GameplayMessage::Input(InputBatch {
                start_frame,
                ack_frame: ep.last_received_frame,
                frame_advantage: current_frame - ep.last_received_frame,
                inputs: inputs.iter().map(|(_, input)| input.0).collect(),
            });
            batches.push((ep.peer, batch));
        }
        for (peer, message) in batches {
            self.push_message(peer, &message);
        }
        Ok(())
    }

    /// Authoritative-or-predicted inputs for the current frame.
    pub fn synchronize_input(
        &mut self,
    ) -> Result<([NetInput; MAX_PLAYERS], u32), NetplayError> {
        if self.state != EngineState::Running {
            return Err(NetplayError::NotSynchronized);
        }
        let mut inputs = [NetInput::default(); MAX_PLAYERS];
        for player in 0..self.num_players {
            let (input, _confirmed) = self.queues[player].input(self.current_frame);
            inputs[player] = input;
        }
        Ok((inputs, self.disconnect_flags))
    }

    /// The current frame is complete: bump the frame counter and snapshot
    /// the new frame boundary.
    pub fn advance_frame(&mut self, handler: &mut dyn SessionHandler) -> Result<(), NetplayError> {
        self.current_frame += 1;
        self.save_current_frame(handler)?;
        self.recompute_confirmed();
        Ok(())
    }

    /// Housekeeping run once per outer-loop pass: deliver events, perform
    /// any pending rollback, track confirmed checksums, evaluate
    /// timesync drift.
    pub fn idle(&mut self, handler: &mut dyn SessionHandler) -> Result<(), NetplayError> {
        if self.state == EngineState::Synchronizing && self.endpoints.is_empty() {
            info!("no remote players, session running");
            self.state = EngineState::Running;
            handler.on_event(SessionEvent::Running);
        }

        while let Some(event) = self.pending_events.pop_front() {
            handler.on_event(event);
        }

        if self.state != EngineState::Running {
            return Ok(());
        }

        if !self.initial_saved {
            self.save_current_frame(handler)?;
            self.initial_saved = true;
        }

        if self.pending_rollback != NULL_FRAME {
            self.rollback_and_replay(handler)?;
        }

        self.record_confirmed_checksums();
        self.compare_checksums(handler);
        self.check_timesync(handler);
        self.prune_history();
        Ok(())
    }

    /// Wire upkeep: handshake retries, quality probes, keepalives,
    /// disconnect detection, checksum reports.
    pub fn network_idle(&mut self) {
        let now = Instant::now();
        let clock_ms = self.clock_ms();
        let current_frame = self.current_frame;

        let mut to_send: Vec<(PeerId, GameplayMessage)> = Vec::new();
        let mut newly_disconnected: Vec<PlayerHandle> = Vec::new();

        for ep in &mut self.endpoints {
            if ep.disconnected {
                continue;
            }
            if ep.timed_out(now) {
                warn!(player = ep.player_number, "remote peer stopped responding");
                ep.disconnected = true;
                newly_disconnected.push(ep.player_number);
                continue;
            }
            if let Some(probe) = ep.sync_probe(now) {
                to_send.push((ep.peer, probe));
            }
            let local_advantage = current_frame - ep.last_received_frame;
            if let Some(report) = ep.quality_probe(now, clock_ms, local_advantage) {
                to_send.push((ep.peer, report));
            }
            if ep.keepalive_due(now) {
                to_send.push((ep.peer, GameplayMessage::KeepAlive));
            }
        }

        for player in newly_disconnected {
            self.disconnect_flags |= 1 << player;
            self.queues[player].set_disconnected();
            self.pending_events
                .push_back(SessionEvent::DisconnectedFromPeer { player });
        }
        if self.disconnect_flags != 0 {
            self.recompute_confirmed();
        }

        if let Some((&frame, &checksum)) = self.local_checksums.iter().next_back() {
            if frame >= self.last_checksum_sent + CHECKSUM_SEND_INTERVAL {
                self.last_checksum_sent = frame;
                let report = GameplayMessage::ChecksumReport { frame, checksum };
                let peers: Vec<PeerId> = self
                    .endpoints
                    .iter()
                    .filter(|ep| !ep.disconnected && ep.is_running())
                    .map(|ep| ep.peer)
                    .collect();
                for peer in peers {
                    self.push_message(peer, &report);
                }
            }
        }

        for (peer, message) in to_send {
            self.push_message(peer, &message);
        }
    }

    /// Feed one gameplay datagram received from `peer`.
    pub fn handle_packet(&mut self, peer: PeerId, payload: &[u8]) -> Result<(), NetplayError> {
        let message = GameplayMessage::decode(payload)?;
        let now = Instant::now();
        let clock_ms = self.clock_ms();

        let Some(index) = self.endpoints.iter().position(|ep| ep.peer == peer) else {
            trace!(%peer, "gameplay packet from unknown peer");
            return Ok(());
        };

        let mut reply = None;
        let mut mispredicted: Option<Frame> = None;
        {
            let ep = &mut self.endpoints[index];
            ep.last_recv = now;
            match message {
                GameplayMessage::SyncRequest { random } => {
                    reply = Some(GameplayMessage::SyncReply { random });
                }
                GameplayMessage::SyncReply { random } => {
                    let player = ep.player_number;
                    if !ep.replied_once {
                        ep.replied_once = true;
                        self.pending_events
                            .push_back(SessionEvent::ConnectedToPeer { player });
                    }
                    match self.endpoints[index].on_sync_reply(random, now) {
                        SyncOutcome::Progress { count, total } => {
                            self.pending_events.push_back(
                                SessionEvent::SynchronizingWithPeer {
                                    player,
                                    count,
                                    total,
                                },
                            );
                        }
                        SyncOutcome::Finished => {
                            info!(player, "synchronized with peer");
                            self.pending_events
                                .push_back(SessionEvent::SynchronizedWithPeer { player });
                            self.maybe_promote_to_running();
                        }
                        SyncOutcome::Ignored => {}
                    }
                }
                GameplayMessage::Input(batch) => {
                    let player = ep.player_number;
                    ep.last_acked_frame = ep.last_acked_frame.max(batch.ack_frame);
                    ep.remote_frame_advantage = batch.frame_advantage;
                    let last = batch.start_frame + batch.inputs.len() as i32 - 1;
                    ep.last_received_frame = ep.last_received_frame.max(last);
                    for (offset, raw) in batch.inputs.iter().enumerate() {
                        let frame = batch.start_frame + offset as i32;
                        if let Some(frame) =
                            self.queues[player].add_remote(frame, NetInput(*raw))
                        {
                            mispredicted =
                                Some(mispredicted.map_or(frame, |prev: Frame| prev.min(frame)));
                        }
                    }
                }
                GameplayMessage::QualityReport {
                    frame_advantage,
                    ping,
                } => {
                    ep.remote_frame_advantage = frame_advantage;
                    reply = Some(GameplayMessage::QualityReply { pong: ping });
                }
                GameplayMessage::QualityReply { pong } => {
                    ep.ping_ms = clock_ms.saturating_sub(pong) as u32;
                }
                GameplayMessage::ChecksumReport { frame, checksum } => {
                    self.remote_checksums.insert(frame, checksum);
                }
                GameplayMessage::KeepAlive => {}
            }
        }

        if let Some(frame) = mispredicted {
            debug!(frame, "remote input contradicts prediction");
            self.pending_rollback = if self.pending_rollback == NULL_FRAME {
                frame
            } else {
                self.pending_rollback.min(frame)
            };
        }
        self.recompute_confirmed();

        if let Some(message) = reply {
            self.push_message(peer, &message);
        }
        Ok(())
    }

    fn maybe_promote_to_running(&mut self) {
        if self.state == EngineState::Running {
            return;
        }
        if self.endpoints.iter().all(|ep| ep.is_running()) {
            self.state = EngineState::Running;
            self.pending_events.push_back(SessionEvent::Running);
        }
    }

    fn rollback_and_replay(
        &mut self,
        handler: &mut dyn SessionHandler,
    ) -> Result<(), NetplayError> {
        let first_incorrect = self.pending_rollback;
        self.pending_rollback = NULL_FRAME;
        if first_incorrect == NULL_FRAME || first_incorrect >= self.current_frame {
            return Ok(());
        }

        let target = self.current_frame;
        let rollback_frames = (target - first_incorrect) as u32;
        debug!(
            from = first_incorrect,
            to = target,
            frames = rollback_frames,
            "rolling back"
        );

        {
            let saved = self
                .saved
                .get(first_incorrect)
                .ok_or(NetplayError::MissingSnapshot(first_incorrect))?;
            handler.load_frame(&saved.snapshot, rollback_frames, first_incorrect)?;
        }
        for queue in &mut self.queues {
            queue.reset_predictions(first_incorrect);
        }
        self.current_frame = first_incorrect;
        self.in_rollback = true;

        while self.current_frame < target {
            let mut inputs = [NetInput::default(); MAX_PLAYERS];
            for player in 0..self.num_players {
                let (input, _) = self.queues[player].input(self.current_frame);
                inputs[player] = input;
            }
            handler.advance_frame(&inputs, self.disconnect_flags);
            self.current_frame += 1;
            self.save_current_frame(handler)?;
        }
        self.in_rollback = false;
        self.recompute_confirmed();
        Ok(())
    }

    fn save_current_frame(&mut self, handler: &mut dyn SessionHandler) -> Result<(), NetplayError> {
        let (snapshot, checksum) = handler.save_frame(self.current_frame)?;
        self.saved.store(
            SavedFrame {
                frame: self.current_frame,
                snapshot,
                checksum,
            },
            handler,
        );
        Ok(())
    }

    /// How many frames past the last fully confirmed one we have run.
    fn frames_speculated(&self) -> i32 {
        let confirmed = self.remote_confirmed_frame();
        match confirmed {
            Some(frame) => self.current_frame - (frame + 1),
            None if self.has_active_remotes() => self.current_frame,
            None => 0,
        }
    }

    fn has_active_remotes(&self) -> bool {
        self.endpoints.iter().any(|ep| !ep.disconnected)
    }

    /// Minimum contiguous confirmed frame across connected remote players,
    /// or `None` when nothing has been confirmed yet.
    fn remote_confirmed_frame(&self) -> Option<Frame> {
        let mut confirmed: Option<Frame> = None;
        for ep in &self.endpoints {
            if ep.disconnected {
                continue;
            }
            let through = self.queues[ep.player_number].confirmed_through();
            confirmed = Some(confirmed.map_or(through, |c| c.min(through)));
        }
        confirmed
    }

    fn recompute_confirmed(&mut self) {
        self.last_confirmed_frame = match self.remote_confirmed_frame() {
            Some(frame) => frame.min(self.current_frame),
            None if self.has_active_remotes() => NULL_FRAME,
            None => self.current_frame,
        };
    }

    fn record_confirmed_checksums(&mut self) {
        // The state saved at the start of frame F only depends on inputs
        // for frames < F, so it is final once F-1 is confirmed and any
        // pending rollback has replayed.
        let through = (self.last_confirmed_frame + 1).min(self.current_frame);
        let mut frame = self.checksums_recorded_through + 1;
        while frame <= through {
            if let Some(saved) = self.saved.get(frame) {
                self.local_checksums.insert(frame, saved.checksum);
            }
            frame += 1;
        }
        self.checksums_recorded_through = self.checksums_recorded_through.max(through);
    }

    fn compare_checksums(&mut self, handler: &mut dyn SessionHandler) {
        let comparable: Vec<Frame> = self
            .remote_checksums
            .keys()
            .filter(|frame| self.local_checksums.contains_key(frame))
            .copied()
            .collect();
        for frame in comparable {
            let remote = self.remote_checksums.remove(&frame).unwrap_or_default();
            let ours = self.local_checksums.get(&frame).copied().unwrap_or_default();
            if ours != remote {
                warn!(frame, ours, remote, "desync detected");
                handler.on_event(SessionEvent::Desync {
                    frame,
                    our_checksum: ours,
                    remote_checksum: remote,
                });
            }
        }
    }

    fn check_timesync(&mut self, handler: &mut dyn SessionHandler) {
        if self.current_frame < self.next_timesync_frame {
            return;
        }
        self.next_timesync_frame = self.current_frame + TIMESYNC_INTERVAL as Frame;

        let mut frames_ahead = 0.0f32;
        for ep in &self.endpoints {
            if ep.disconnected || !ep.is_running() {
                continue;
            }
            let local_advantage = self.current_frame - ep.last_received_frame;
            let ahead = (local_advantage - ep.remote_frame_advantage) as f32 / 2.0;
            frames_ahead = frames_ahead.max(ahead);
        }
        if frames_ahead >= 1.0 {
            debug!(frames_ahead, "timesync: running ahead of remotes");
            handler.on_event(SessionEvent::TimeSync {
                frames_ahead,
                interval: TIMESYNC_INTERVAL,
            });
        }
    }

    fn prune_history(&mut self) {
        if self.last_confirmed_frame == NULL_FRAME {
            return;
        }
        let keep_from = self.last_confirmed_frame - 2 * self.max_rollback as i32;
        if keep_from <= 0 {
            return;
        }
        for queue in &mut self.queues {
            queue.prune(keep_from);
        }
        while self.local_checksums.len() > CHECKSUM_HISTORY {
            self.local_checksums.pop_first();
        }
        while self.remote_checksums.len() > CHECKSUM_HISTORY {
            self.remote_checksums.pop_first();
        }
    }

    fn push_message(&mut self, peer: PeerId, message: &GameplayMessage) {
        match message.encode() {
            Ok(bytes) => {
                if let Some(ep) = self.endpoints.iter_mut().find(|ep| ep.peer == peer) {
                    ep.last_send = Instant::now();
                }
                self.outgoing.push((peer, bytes));
            }
            Err(err) => warn!(%err, "failed to encode gameplay message"),
        }
    }

    fn clock_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}
