//! The netplay session: state machine, resync orchestration, and the
//! outer execution loop.
//!
//! All session state lives in one owned [`NetplaySession`] value; it is
//! created by [`NetplaySession::create_session`] or
//! [`NetplaySession::join_session`] and consumed by running
//! [`NetplaySession::execute`] until the session returns to `Inactive`.
//! The session is the only component that assigns [`SessionState`];
//! everything below it reports through return values and events.

use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, error, info, trace, warn};
use xxhash_rust::xxh32::xxh32;

use basalt_netproto::control::{
    CloseReason, ConnectMode, ConnectRequest, ConnectResponse, ConnectResult, DropPlayer,
    DropReason, PlayerEntry, Reset, ResetComplete, ResetReason, ResetRequest,
};
use basalt_netproto::header::{peek_message_type, MessageType};
use basalt_netproto::ControlMessage;

use crate::constants::{
    DESYNC_WINDOW_SIZE, MAX_CLOSE_TIME, MAX_CONNECT_RETRIES, MAX_CONNECT_TIME, MAX_PLAYERS,
    MAX_ROLLBACK_FRAMES,
};
use crate::error::NetplayError;
use crate::host::{HostInterface, SessionSettings};
use crate::input::{InputCollector, NetInput, BUTTON_COUNT};
use crate::machine::{Machine, MachineSnapshot};
use crate::pacing::{FramePacer, ThrottleAction};
use crate::rollback::{
    Frame, PlayerHandle, PlayerKind, RollbackSession, SessionEvent, SessionHandler,
};
use crate::transport::channel::Channel;
use crate::transport::{Endpoint, PeerId, TransportEvent};

/// Player 0 hosts the session.
const HOST_PLAYER_ID: i16 = 0;

/// Deadline granularity used while blocking in Connecting/Resetting.
const BLOCKING_POLL_SLICE: Duration = Duration::from_millis(16);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Inactive,
    Initializing,
    Connecting,
    Resetting,
    Running,
    ClosingSession,
}

/// Session tunables; the defaults match normal online play.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Frames of local input delay fed to the rollback engine.
    pub local_delay: u32,
    pub connect_timeout: Duration,
    pub connect_retries: u32,
    pub close_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            local_delay: 1,
            connect_timeout: MAX_CONNECT_TIME,
            connect_retries: MAX_CONNECT_RETRIES,
            close_timeout: MAX_CLOSE_TIME,
        }
    }
}

/// One roster slot. `peer` is `None` exactly when no transport
/// connection backs the slot.
#[derive(Debug, Default)]
struct PeerSlot {
    peer: Option<PeerId>,
    nickname: String,
    rollback_handle: Option<PlayerHandle>,
}

pub struct NetplaySession<M: Machine, H: HostInterface> {
    state: SessionState,
    options: SessionOptions,
    machine: M,
    host: H,
    transport: Endpoint,
    peers: [PeerSlot; MAX_PLAYERS],
    local_player_id: i16,
    num_players: u16,
    reset_cookie: u32,
    reset_players: u32,
    host_address: Option<SocketAddr>,
    local_nickname: String,
    reset_start: Instant,
    last_connect_attempt: Instant,
    rollback: Option<RollbackSession>,
    local_handle: Option<PlayerHandle>,
    pool: Vec<Box<MachineSnapshot>>,
    input: InputCollector,
    pacer: FramePacer,
}

/// The engine's callback surface, borrowing the session pieces the
/// callbacks touch. Built fresh around each engine call so the engine
/// itself never holds a machine borrow.
struct RunnerHandler<'a, M: Machine, H: HostInterface> {
    machine: &'a mut M,
    host: &'a mut H,
    pool: &'a mut Vec<Box<MachineSnapshot>>,
    pacer: &'a mut FramePacer,
    current_frame: Frame,
}

impl<M: Machine, H: HostInterface> SessionHandler for RunnerHandler<'_, M, H> {
    fn save_frame(&mut self, frame: Frame) -> Result<(Box<MachineSnapshot>, u32), NetplayError> {
        let mut snapshot = self.pool.pop().unwrap_or_default();
        self.machine.save_snapshot(&mut snapshot)?;
        let checksum = desync_checksum(frame, &snapshot.data);
        Ok((snapshot, checksum))
    }

    fn load_frame(
        &mut self,
        snapshot: &MachineSnapshot,
        rollback_frames: u32,
        frame_to_load: Frame,
    ) -> Result<(), NetplayError> {
        // Keep the speaker quiet while history replays.
        self.machine.set_audio_muted(true);
        trace!(frame_to_load, rollback_frames, "restoring snapshot");
        self.machine.load_snapshot(snapshot)?;
        Ok(())
    }

    fn advance_frame(&mut self, inputs: &[NetInput; MAX_PLAYERS], _disconnect_flags: u32) {
        apply_inputs(self.machine, inputs);
        self.machine.run_frame();
    }

    fn free_snapshot(&mut self, snapshot: Box<MachineSnapshot>, _frame: Frame) {
        self.pool.push(snapshot);
    }

    fn on_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::ConnectedToPeer { player } => {
                info!(player, "connected to peer");
            }
            SessionEvent::SynchronizingWithPeer {
                player,
                count,
                total,
            } => {
                info!(player, count, total, "synchronizing with peer");
            }
            SessionEvent::SynchronizedWithPeer { player } => {
                info!(player, "synchronized with peer");
            }
            SessionEvent::Running => {
                info!("rollback session running");
            }
            SessionEvent::TimeSync {
                frames_ahead,
                interval,
            } => {
                self.pacer
                    .handle_time_sync(frames_ahead, interval, self.current_frame);
            }
            SessionEvent::Desync {
                frame,
                our_checksum,
                remote_checksum,
            } => {
                self.host.on_netplay_message(&format!(
                    "Desync detected: current frame {}, desync frame {}, diff {}, L:{:08X} R:{:08X}",
                    self.current_frame,
                    frame,
                    self.current_frame - frame,
                    our_checksum,
                    remote_checksum
                ));
            }
            SessionEvent::DisconnectedFromPeer { player } => {
                warn!(player, "rollback peer disconnected");
            }
        }
    }
}

fn apply_inputs<M: Machine>(machine: &mut M, inputs: &[NetInput; MAX_PLAYERS]) {
    for (slot, input) in inputs.iter().enumerate() {
        for button in 0..BUTTON_COUNT {
            machine.set_button_state(slot, button, input.is_pressed(button));
        }
    }
}

/// 32-bit checksum over one 16 KiB window of the snapshot, walking a
/// different window each frame and seeding with the frame number.
fn desync_checksum(frame: Frame, data: &[u8]) -> u32 {
    let seed = frame.max(0) as u32;
    let num_groups = data.len() / DESYNC_WINDOW_SIZE;
    if num_groups == 0 {
        return xxh32(data, seed);
    }
    let start = (frame.max(0) as usize % num_groups) * DESYNC_WINDOW_SIZE;
    xxh32(&data[start..start + DESYNC_WINDOW_SIZE], seed)
}

fn socket_addr_to_entry(addr: SocketAddr) -> (u32, u16) {
    match addr {
        SocketAddr::V4(v4) => (u32::from(*v4.ip()), v4.port()),
        SocketAddr::V6(v6) => {
            warn!(%v6, "IPv6 peer address cannot be carried in the roster");
            (0, v6.port())
        }
    }
}

fn entry_to_socket_addr(entry: &PlayerEntry) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::from(entry.host), entry.port))
}

impl<M: Machine, H: HostInterface> NetplaySession<M, H> {
    /// Host a session. The machine must already be booted; joiners will
    /// receive its state in the first Reset. `_password` is carried on
    /// the wire but not enforced.
    pub fn create_session(
        machine: M,
        host: H,
        nickname: &str,
        port: u16,
        max_players: u32,
        _password: &str,
        options: SessionOptions,
    ) -> Result<Self, NetplayError> {
        let mut session = Self::new(machine, host, nickname, options)?;
        let max_peers = (max_players.clamp(2, MAX_PLAYERS as u32) - 1) as usize;
        if let Err(err) = session.start_host(port, max_peers) {
            session.host.set_settings_overlay(None);
            return Err(err);
        }
        Ok(session)
    }

    /// Join a session hosted at `hostname:port`.
    pub fn join_session(
        machine: M,
        host: H,
        nickname: &str,
        hostname: &str,
        port: u16,
        _password: &str,
        options: SessionOptions,
    ) -> Result<Self, NetplayError> {
        let mut session = Self::new(machine, host, nickname, options)?;
        if let Err(err) = session.start_join(hostname, port) {
            session.host.set_settings_overlay(None);
            return Err(err);
        }
        Ok(session)
    }

    fn new(
        machine: M,
        mut host: H,
        nickname: &str,
        options: SessionOptions,
    ) -> Result<Self, NetplayError> {
        host.set_settings_overlay(Some(SessionSettings::for_netplay()));
        let throttle_hz = machine.throttle_hz();
        Ok(Self {
            state: SessionState::Initializing,
            options,
            machine,
            host,
            // Rebound by start_host/start_join before first use.
            transport: Endpoint::bind(0, MAX_PLAYERS)?,
            peers: Default::default(),
            local_player_id: -1,
            num_players: 0,
            reset_cookie: 0,
            reset_players: 0,
            host_address: None,
            local_nickname: nickname.to_string(),
            reset_start: Instant::now(),
            last_connect_attempt: Instant::now(),
            rollback: None,
            local_handle: None,
            pool: Vec::new(),
            input: InputCollector::default(),
            pacer: FramePacer::new(throttle_hz),
        })
    }

    fn start_host(&mut self, port: u16, max_peers: usize) -> Result<(), NetplayError> {
        self.transport = Endpoint::bind(port, max_peers)?;
        self.local_player_id = HOST_PLAYER_ID;
        self.num_players = 1;
        self.reset_players = 1 << HOST_PLAYER_ID;
        self.create_rollback_session()?;
        self.state = SessionState::Running;
        info!(port = %self.transport.local_addr()?.port(), "netplay session started as host");
        Ok(())
    }

    fn start_join(&mut self, hostname: &str, port: u16) -> Result<(), NetplayError> {
        self.transport = Endpoint::bind(0, MAX_PLAYERS)?;
        let address = (hostname, port)
            .to_socket_addrs()
            .map_err(|_| NetplayError::AddressResolve(hostname.to_string()))?
            .find(SocketAddr::is_ipv4)
            .ok_or_else(|| NetplayError::AddressResolve(hostname.to_string()))?;
        self.host_address = Some(address);
        self.local_player_id = -1;

        let peer = self
            .transport
            .dial(address, self.local_player_id as i32 as u32)?;
        self.peers[HOST_PLAYER_ID as usize].peer = Some(peer);

        self.state = SessionState::Connecting;
        self.reset_start = Instant::now();
        self.last_connect_attempt = Instant::now();
        info!(%address, "connecting to netplay host");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Public surface
    // ------------------------------------------------------------------

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self.state,
            SessionState::Initializing
                | SessionState::Connecting
                | SessionState::Resetting
                | SessionState::Running
        )
    }

    pub fn is_host(&self) -> bool {
        self.local_player_id == HOST_PLAYER_ID
    }

    pub fn num_players(&self) -> u16 {
        self.num_players
    }

    pub fn local_addr(&self) -> Result<SocketAddr, NetplayError> {
        Ok(self.transport.local_addr()?)
    }

    pub fn current_frame(&self) -> Frame {
        self.rollback.as_ref().map_or(0, |rb| rb.current_frame())
    }

    /// Latest measured round-trip time to the remote peer, in ms.
    pub fn ping(&self) -> u32 {
        let Some(rollback) = &self.rollback else {
            return 0;
        };
        self.peers
            .iter()
            .enumerate()
            .filter(|(id, slot)| *id as i16 != self.local_player_id && slot.peer.is_some())
            .filter_map(|(_, slot)| slot.rollback_handle)
            .filter_map(|handle| rollback.network_stats(handle))
            .map(|stats| stats.ping_ms)
            .next()
            .unwrap_or(0)
    }

    /// Feed one controller bind value; sampled at the next frame.
    pub fn collect_input(&mut self, slot: usize, bind: usize, value: f32) {
        self.input.collect(slot, bind, value);
    }

    pub fn machine(&self) -> &M {
        &self.machine
    }

    pub fn host_interface(&self) -> &H {
        &self.host
    }

    /// Broadcast a chat line and echo it locally.
    pub fn send_chat_message(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        let message = ControlMessage::Chat {
            text: text.to_string(),
        };
        self.send_control_to_all(&message);
        let local_id = self.local_player_id;
        self.show_chat_message(local_id, text);
    }

    /// Run the session until it returns to `Inactive`.
    pub fn execute(&mut self) {
        while self.state != SessionState::Inactive {
            match self.state {
                SessionState::Connecting => self.update_connecting_state(),
                SessionState::Resetting => self.update_reset_state(),
                SessionState::Running => {
                    self.run_frame();
                    // The host may request a shutdown from its message loop.
                    if !self.host.pump_messages() {
                        self.request_close_session(CloseReason::HostShutdown);
                        continue;
                    }
                    if self.state != SessionState::Running {
                        continue;
                    }
                    self.machine.present_frame();
                    self.throttle();
                }
                SessionState::ClosingSession => self.close_session(),
                SessionState::Inactive | SessionState::Initializing => {
                    error!(state = ?self.state, "execute() reached an invalid state");
                    self.state = SessionState::ClosingSession;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Outer-loop states
    // ------------------------------------------------------------------

    fn update_connecting_state(&mut self) {
        if self.reset_start.elapsed() >= self.options.connect_timeout {
            self.close_session_with_error("Timed out connecting to server.");
            return;
        }

        // The host may still have been starting up when we first dialed;
        // retry on a schedule that fits connect_retries attempts into the
        // connect timeout.
        let retry_interval = self.options.connect_timeout / (self.options.connect_retries + 1);
        let host_connected = self.peers[HOST_PLAYER_ID as usize]
            .peer
            .is_some_and(|peer| self.transport.is_connected(peer));
        if !host_connected && self.last_connect_attempt.elapsed() > retry_interval {
            if let Some(peer) = self.peers[HOST_PLAYER_ID as usize].peer.take() {
                self.transport.reset(peer);
            }
            if let Some(address) = self.host_address {
                debug!(%address, "retrying connection to host");
                match self
                    .transport
                    .dial(address, self.local_player_id as i32 as u32)
                {
                    Ok(peer) => self.peers[HOST_PLAYER_ID as usize].peer = Some(peer),
                    Err(err) => {
                        self.close_session_with_error(&format!("Failed to dial host: {err}"));
                        return;
                    }
                }
            }
            self.last_connect_attempt = Instant::now();
        }

        self.poll_transport(Instant::now() + BLOCKING_POLL_SLICE);
        self.host.display_loading_screen("Connecting to host...", None);
        if !self.host.pump_messages() {
            self.request_close_session(CloseReason::HostShutdown);
        }
    }

    fn update_reset_state(&mut self) {
        if self.is_host() {
            if self.reset_players.count_ones() as u16 == self.num_players {
                info!("all players synchronized, resuming");
                self.send_control_to_all(&ControlMessage::ResumeSession);
                if let Err(err) = self.create_rollback_session() {
                    self.close_session_with_error(&format!("Failed to resume session: {err}"));
                    return;
                }
                self.state = SessionState::Running;
                return;
            }

            if self.reset_start.elapsed() >= self.options.connect_timeout {
                info!("reset timeout, dropping players who aren't connected");
                let stragglers: Vec<i16> = (0..MAX_PLAYERS as i16)
                    .filter(|&id| {
                        id != self.local_player_id
                            && self.is_valid_player_id(id)
                            && !self.reset_player_acked(id)
                    })
                    .collect();
                for id in stragglers {
                    debug!(player = id, "dropping player that didn't reset in time");
                    self.drop_player(id, DropReason::ConnectTimeout);
                }
            }
        } else {
            if self.reset_players.count_ones() as u16 != self.num_players {
                // Watch the roster come up; once everyone we need is
                // reachable, tell the host we're ready.
                for id in 0..MAX_PLAYERS as i16 {
                    if !self.is_valid_player_id(id) || self.reset_player_acked(id) {
                        continue;
                    }
                    let connected = self.peers[id as usize]
                        .peer
                        .is_some_and(|peer| self.transport.is_connected(peer));
                    if connected {
                        self.reset_players |= 1 << id;
                    }
                }

                if self.reset_players.count_ones() as u16 == self.num_players {
                    info!(
                        players = self.num_players,
                        "connected to all players, waiting for host"
                    );
                    let message = ControlMessage::ResetComplete(ResetComplete {
                        cookie: self.reset_cookie,
                    });
                    self.send_control_to_player(HOST_PLAYER_ID, &message);
                }

                if self.reset_start.elapsed() >= self.options.connect_timeout * 2 {
                    self.close_session_with_error("Failed to connect within timeout");
                    return;
                }
            }
        }

        self.poll_transport(Instant::now() + BLOCKING_POLL_SLICE);
        self.host.display_loading_screen(
            "Netplay synchronizing",
            Some((self.reset_players.count_ones(), self.num_players as u32)),
        );
        if !self.host.pump_messages() {
            self.request_close_session(CloseReason::HostShutdown);
        }
    }

    fn run_frame(&mut self) {
        self.poll_transport(Instant::now());
        if self.state != SessionState::Running || self.rollback.is_none() {
            return;
        }

        if let Some(Err(err)) = self.with_handler(|rollback, handler| rollback.idle(handler)) {
            self.close_session_with_error(&format!("Rollback session failed: {err}"));
            return;
        }
        self.network_idle_and_flush();

        let input = self.input.read_local();
        let added = match self.local_handle {
            Some(handle) => self
                .rollback
                .as_mut()
                .map(|rollback| rollback.add_local_input(handle, input))
                .unwrap_or(Ok(())),
            None => Ok(()),
        };

        match added {
            Ok(()) => {
                let synced = self
                    .rollback
                    .as_mut()
                    .map(|rollback| rollback.synchronize_input());
                match synced {
                    Some(Ok((inputs, _disconnect_flags))) => {
                        // Re-enable audio after any rollback replay.
                        self.machine.set_audio_muted(false);
                        apply_inputs(&mut self.machine, &inputs);
                        self.machine.run_frame();
                        if let Some(Err(err)) =
                            self.with_handler(|rollback, handler| rollback.advance_frame(handler))
                        {
                            self.close_session_with_error(&format!(
                                "Failed to advance frame: {err}"
                            ));
                            return;
                        }
                    }
                    Some(Err(
                        NetplayError::PredictionThreshold | NetplayError::NotSynchronized,
                    )) => {
                        trace!("frame skipped waiting for remote inputs");
                    }
                    Some(Err(err)) => {
                        self.close_session_with_error(&format!("Input sync failed: {err}"));
                        return;
                    }
                    None => {}
                }
            }
            Err(NetplayError::PredictionThreshold | NetplayError::NotSynchronized) => {
                trace!("local input deferred, prediction window full");
            }
            Err(err) => {
                self.close_session_with_error(&format!("Failed to add local input: {err}"));
                return;
            }
        }

        self.flush_rollback_output();
    }

    fn throttle(&mut self) {
        let current_frame = self.current_frame();
        match self.pacer.begin_throttle(current_frame, Instant::now()) {
            ThrottleAction::SkipBacklog => {
                // Way behind; drop the lost frames but keep the wire hot.
                self.poll_transport(Instant::now());
            }
            ThrottleAction::Sleep => {
                while self.is_active() {
                    let Some(deadline) = self.pacer.sleep_deadline(Instant::now()) else {
                        break;
                    };
                    self.poll_transport(deadline);
                }
            }
        }
    }

    fn close_session(&mut self) {
        self.destroy_rollback_session();

        // Give outstanding reliable traffic (CloseSession notices) a
        // chance to flush before dropping the links.
        while self.reset_start.elapsed() < self.options.close_timeout {
            let pending = self.peers.iter().any(|slot| {
                slot.peer.is_some_and(|peer| {
                    self.transport.is_connected(peer) && self.transport.has_unacked(peer)
                })
            });
            if !pending {
                break;
            }
            self.poll_transport(Instant::now() + Duration::from_millis(1));
            self.host.display_loading_screen("Closing session", None);
            self.host.pump_messages();
        }

        for slot in &mut self.peers {
            if let Some(peer) = slot.peer.take() {
                self.transport.disconnect(peer, true);
            }
            *slot = PeerSlot::default();
        }
        self.transport.shutdown();
        self.host.set_settings_overlay(None);
        self.state = SessionState::Inactive;
        info!("netplay session closed");
    }

    // ------------------------------------------------------------------
    // Transport events and control dispatch
    // ------------------------------------------------------------------

    fn poll_transport(&mut self, deadline: Instant) {
        while let Some(event) = self.transport.poll(deadline) {
            self.handle_transport_event(event);
            // Receiving can trigger sending.
            if self.rollback.is_some() {
                self.network_idle_and_flush();
            }
            if !self.is_active() {
                break;
            }
        }
    }

    fn network_idle_and_flush(&mut self) {
        if let Some(rollback) = &mut self.rollback {
            rollback.network_idle();
        }
        self.flush_rollback_output();
    }

    fn flush_rollback_output(&mut self) {
        let Some(rollback) = &mut self.rollback else {
            return;
        };
        for (peer, bytes) in rollback.take_outgoing() {
            if let Err(err) = self.transport.send(peer, Channel::Gameplay, &bytes) {
                trace!(%peer, %err, "failed to send gameplay packet");
            }
        }
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        if self.state == SessionState::ClosingSession {
            // Only track peers dropping; discard everything else.
            if let TransportEvent::Disconnected { peer } = event {
                if let Some(id) = self.player_id_for_peer(peer) {
                    self.peers[id as usize].peer = None;
                }
            }
            return;
        }

        match event {
            TransportEvent::Connected { peer, user_data } => {
                if self.is_host() {
                    // Nothing to do until they send a connect request.
                    info!(%peer, "new peer connection");
                } else {
                    self.handle_peer_connection_as_non_host(peer, user_data);
                }
            }
            TransportEvent::Disconnected { peer } => self.handle_disconnection(peer),
            TransportEvent::Received {
                peer,
                channel: Channel::Control,
                payload,
            } => match self.player_id_for_peer(peer) {
                Some(player_id) => self.handle_control_message(player_id, &payload),
                None => self.handle_message_from_new_peer(peer, &payload),
            },
            TransportEvent::Received {
                peer,
                channel: Channel::Gameplay,
                payload,
            } => {
                if let Some(rollback) = &mut self.rollback {
                    trace!(%peer, len = payload.len(), "gameplay packet");
                    if let Err(err) = rollback.handle_packet(peer, &payload) {
                        error!(%peer, %err, "failed to process gameplay packet");
                    }
                }
            }
        }
    }

    fn handle_peer_connection_as_non_host(&mut self, peer: PeerId, user_data: Option<u32>) {
        if self.state == SessionState::Connecting {
            if self.peers[HOST_PLAYER_ID as usize].peer == Some(peer) {
                self.send_connect_request();
            } else {
                warn!(%peer, "unexpected connection while joining, dropping");
                self.transport.disconnect(peer, false);
            }
            return;
        }

        match user_data {
            // One of our own resync dials completed.
            None => match self.player_id_for_peer(peer) {
                Some(id) => {
                    debug!(
                        player = id,
                        host = id == HOST_PLAYER_ID,
                        "connection complete with player"
                    );
                }
                None => {
                    warn!(%peer, "outbound connection to unknown slot, dropping");
                    self.transport.reset(peer);
                }
            },
            // A higher-numbered player dialing us during a resync.
            Some(word) => {
                let claimed = word as i32;
                if claimed < 0
                    || claimed >= MAX_PLAYERS as i32
                    || claimed as i16 == self.local_player_id
                {
                    warn!(claimed, "invalid claimed player id on incoming connection");
                    self.transport.disconnect(peer, false);
                    return;
                }
                let claimed = claimed as i16;
                if self.peers[claimed as usize].peer == Some(peer) {
                    debug!(player = claimed, "connection complete with player");
                    return;
                }
                if claimed < self.local_player_id {
                    warn!(
                        player = claimed,
                        "lower-numbered player dialed us, expected to dial them"
                    );
                }
                debug!(player = claimed, "connection received from peer");
                self.peers[claimed as usize].peer = Some(peer);
            }
        }
    }

    fn handle_disconnection(&mut self, peer: PeerId) {
        let player_id = self.player_id_for_peer(peer);
        match self.state {
            SessionState::Connecting => {
                // The retry schedule in update_connecting_state redials.
                warn!("connection attempt to host failed, will retry");
                if player_id == Some(HOST_PLAYER_ID) {
                    self.peers[HOST_PLAYER_ID as usize].peer = None;
                }
            }
            SessionState::Resetting => {
                // Let the reset timeout deal with it.
                debug!(?player_id, "ignoring disconnection while synchronizing");
            }
            _ => {
                let Some(player_id) = player_id else {
                    return;
                };
                warn!(player = player_id, "peer disconnected");
                if self.is_host() {
                    info!(
                        player = player_id,
                        "player disconnected from host, reclaiming their slot"
                    );
                    self.drop_player(player_id, DropReason::DisconnectedFromHost);
                } else if player_id == HOST_PLAYER_ID {
                    self.close_session_with_error("Lost connection to host");
                } else {
                    // Tell the host we lost a neighbour; it will resync,
                    // and its DropPlayer message reclaims the slot.
                    self.request_reset(ResetReason::ConnectionLost, player_id);
                }
            }
        }
    }

    /// Host admission: the first control packet from an unknown peer must
    /// be a connect request.
    fn handle_message_from_new_peer(&mut self, peer: PeerId, payload: &[u8]) {
        let request = match ControlMessage::decode(payload) {
            Ok(ControlMessage::ConnectRequest(request)) => request,
            _ => {
                warn!(%peer, "unknown packet from unknown peer");
                self.transport.reset(peer);
                return;
            }
        };
        if !self.is_host() {
            warn!(%peer, "connect request sent to a non-host peer");
            self.transport.reset(peer);
            return;
        }

        debug!(
            %peer,
            requested = request.requested_player_id,
            nickname = %request.nickname,
            "connect request"
        );

        let respond = |session: &mut Self, result: ConnectResult, player_id: i16| {
            let response = ControlMessage::ConnectResponse(ConnectResponse { result, player_id });
            session.send_control(peer, &response);
        };

        if request.mode != ConnectMode::Player {
            respond(self, ConnectResult::SessionClosed, -1);
            return;
        }
        if request.requested_player_id >= 0 && self.is_valid_player_id(request.requested_player_id)
        {
            error!(
                requested = request.requested_player_id,
                "player id already in use, rejecting connection"
            );
            respond(self, ConnectResult::PlayerIdInUse, -1);
            return;
        }

        let in_range = (0..MAX_PLAYERS as i16).contains(&request.requested_player_id);
        let new_player_id = if in_range {
            Some(request.requested_player_id)
        } else {
            self.free_player_id()
        };
        let Some(new_player_id) = new_player_id else {
            error!("server full, rejecting connection");
            respond(self, ConnectResult::ServerFull, -1);
            return;
        };

        info!(%peer, player = new_player_id, "assigned new connection");
        respond(self, ConnectResult::Success, new_player_id);

        self.peers[new_player_id as usize].peer = Some(peer);
        self.peers[new_player_id as usize].nickname = request.nickname;
        self.num_players += 1;

        // Force everyone to resynchronize with the new player, then
        // announce them so the roster already carries their nickname.
        self.reset();
        self.notify_player_joined(new_player_id);
    }

    fn handle_control_message(&mut self, player_id: i16, payload: &[u8]) {
        let message = match ControlMessage::decode(payload) {
            Ok(message) => message,
            Err(err) => {
                // A malformed reset means we cannot trust the snapshot we
                // would have loaded; anything else is just dropped.
                if peek_message_type(payload) == Some(MessageType::Reset) {
                    self.close_session_with_error(&format!(
                        "Invalid synchronization request: {err}"
                    ));
                } else {
                    error!(player = player_id, %err, "malformed control packet discarded");
                }
                return;
            }
        };

        match message {
            ControlMessage::ConnectRequest(_) => {
                error!(player = player_id, "unexpected connect request from known peer");
            }
            ControlMessage::ConnectResponse(response) => {
                self.handle_connect_response(player_id, response);
            }
            ControlMessage::Reset(reset) => self.handle_reset(player_id, reset),
            ControlMessage::ResetComplete(complete) => {
                self.handle_reset_complete(player_id, complete);
            }
            ControlMessage::ResumeSession => self.handle_resume_session(player_id),
            ControlMessage::PlayerJoined { player_id: joined } => {
                if player_id == HOST_PLAYER_ID {
                    self.notify_player_joined(joined);
                }
            }
            ControlMessage::DropPlayer(drop) => self.handle_drop_player(player_id, drop),
            ControlMessage::ResetRequest(request) => {
                self.handle_reset_request(player_id, request);
            }
            ControlMessage::CloseSession { reason } => {
                self.host
                    .report_error("Netplay Session Ended", reason.describe());
                self.request_close_session(reason);
            }
            ControlMessage::Chat { text } => self.show_chat_message(player_id, &text),
        }
    }

    fn handle_connect_response(&mut self, player_id: i16, response: ConnectResponse) {
        if self.state != SessionState::Connecting {
            error!(player = player_id, "unexpected connect response");
            return;
        }
        if response.result != ConnectResult::Success {
            self.close_session_with_error(&format!(
                "Connection rejected by server with error code {:?}",
                response.result
            ));
            return;
        }
        if !(0..MAX_PLAYERS as i16).contains(&response.player_id) {
            self.close_session_with_error(&format!(
                "Server assigned invalid player id {}",
                response.player_id
            ));
            return;
        }

        info!(player = response.player_id, "connected to host, id assigned");
        self.local_player_id = response.player_id;
        self.state = SessionState::Resetting;
        self.reset_players = 0;
        self.reset_start = Instant::now();
    }

    fn handle_reset(&mut self, player_id: i16, reset: Reset) {
        if player_id != HOST_PLAYER_ID {
            // This shouldn't ever happen, unless someone's being cheeky.
            error!(player = player_id, "dropping reset from non-host");
            return;
        }
        if self.local_player_id < 0 {
            error!("reset received before a player id was assigned");
            return;
        }

        self.destroy_rollback_session();

        debug!(cookie = reset.cookie, "checking connections");
        self.num_players = reset.num_players;
        for id in 0..MAX_PLAYERS {
            let entry = &reset.players[id];
            if !entry.is_occupied() {
                // If we had a client here, it must've dropped.
                if let Some(peer) = self.peers[id].peer.take() {
                    warn!(player = id, "dropping connection to player");
                    self.transport.disconnect(peer, false);
                }
                self.peers[id].nickname.clear();
                continue;
            }

            if id as i16 == self.local_player_id {
                continue;
            }
            self.peers[id].nickname = entry.nickname.clone();

            // The host connection is reused as-is; its roster entry does
            // not carry a dialable address.
            if id as i16 == HOST_PLAYER_ID {
                continue;
            }

            let address = entry_to_socket_addr(entry);
            if self.peers[id]
                .peer
                .is_some_and(|peer| self.transport.peer_addr(peer) == Some(address))
            {
                debug!(player = id, "preserving connection to player");
                continue;
            }
            if let Some(peer) = self.peers[id].peer.take() {
                self.transport.reset(peer);
            }

            // Higher-numbered players dial lower-numbered ones.
            if id as i16 > self.local_player_id {
                debug!(player = id, "waiting for higher-numbered player to dial us");
                continue;
            }
            match self
                .transport
                .dial(address, self.local_player_id as i32 as u32)
            {
                Ok(peer) => self.peers[id].peer = Some(peer),
                Err(err) => {
                    self.close_session_with_error(&format!(
                        "Failed to connect to peer on resynchronize: {err}"
                    ));
                    return;
                }
            }
        }

        debug!(bytes = reset.state.len(), "loading state from host");
        let raw = match lz4_flex::decompress_size_prepended(&reset.state) {
            Ok(raw) => raw,
            Err(err) => {
                self.close_session_with_error(&format!("Corrupt synchronization state: {err}"));
                return;
            }
        };
        if let Err(err) = self.machine.deserialize_state(&raw) {
            self.close_session_with_error(&format!("Failed to load state from host: {err}"));
            return;
        }

        self.state = SessionState::Resetting;
        self.reset_cookie = reset.cookie;
        self.reset_players = 1 << self.local_player_id;
        self.reset_start = Instant::now();
    }

    fn handle_reset_complete(&mut self, player_id: i16, complete: ResetComplete) {
        if self.state != SessionState::Resetting || player_id == HOST_PLAYER_ID {
            error!(player = player_id, "unexpected reset complete");
            return;
        }
        if self.reset_player_acked(player_id) {
            error!(player = player_id, "double reset complete discarded");
            return;
        }
        if complete.cookie != self.reset_cookie {
            error!(
                player = player_id,
                got = complete.cookie,
                want = self.reset_cookie,
                "incorrect reset cookie"
            );
            return;
        }

        debug!(player = player_id, "player is now reset and ready");
        self.reset_players |= 1 << player_id;
    }

    fn handle_resume_session(&mut self, player_id: i16) {
        if self.state != SessionState::Resetting || player_id != HOST_PLAYER_ID {
            error!(player = player_id, "unexpected resume session");
            return;
        }
        debug!("resuming session");
        if let Err(err) = self.create_rollback_session() {
            self.close_session_with_error(&format!("Failed to resume session: {err}"));
            return;
        }
        self.state = SessionState::Running;
    }

    fn handle_drop_player(&mut self, player_id: i16, drop: DropPlayer) {
        if player_id != HOST_PLAYER_ID {
            error!(player = player_id, "unexpected drop player message");
            return;
        }
        if drop.player_id == self.local_player_id {
            warn!("host dropped us; waiting for the connection to close");
            return;
        }
        self.drop_player(drop.player_id, drop.reason);
    }

    fn handle_reset_request(&mut self, player_id: i16, request: ResetRequest) {
        if !self.is_host() {
            error!(player = player_id, "reset request sent to non-host");
            return;
        }
        info!(
            player = player_id,
            causing = request.causing_player_id,
            reason = request.reason.describe(),
            "received reset request"
        );
        self.reset();
    }

    // ------------------------------------------------------------------
    // Session management
    // ------------------------------------------------------------------

    fn send_connect_request(&mut self) {
        debug!(
            player = self.local_player_id,
            "sending connect request to host"
        );
        let message = ControlMessage::ConnectRequest(ConnectRequest {
            mode: ConnectMode::Player,
            requested_player_id: self.local_player_id,
            nickname: self.local_nickname.clone(),
            session_password: String::new(),
        });
        self.send_control_to_player(HOST_PLAYER_ID, &message);
    }

    /// Host-side resynchronization: snapshot the machine, broadcast it
    /// with the roster, and reload it locally so everyone starts from an
    /// identical state.
    fn reset(&mut self) {
        debug_assert!(self.is_host());
        info!("resetting session");

        let raw = match self.machine.serialize_state() {
            Ok(raw) => raw,
            Err(err) => {
                self.close_session_with_error(&format!("Failed to save state: {err}"));
                return;
            }
        };
        let compressed = lz4_flex::compress_prepend_size(&raw);

        let mut players: [PlayerEntry; MAX_PLAYERS] = Default::default();
        for (id, entry) in players.iter_mut().enumerate() {
            if !self.is_valid_player_id(id as i16) {
                *entry = PlayerEntry::empty();
                continue;
            }
            let address = if id as i16 == self.local_player_id {
                self.transport.local_addr().ok()
            } else {
                self.peers[id].peer.and_then(|peer| self.transport.peer_addr(peer))
            };
            let (host, port) = address.map(socket_addr_to_entry).unwrap_or((0, 0));
            *entry = PlayerEntry {
                controller_port: id as i16,
                nickname: self.nickname_for_player(id as i16).to_string(),
                host,
                port,
            };
        }

        // Any in-flight gameplay traffic is for the session we are about
        // to discard.
        self.destroy_rollback_session();

        self.reset_cookie += 1;
        let message = ControlMessage::Reset(Reset {
            cookie: self.reset_cookie,
            num_players: self.num_players,
            players,
            state: Bytes::from(compressed),
        });
        self.send_control_to_all(&message);

        // Reload our own state too, so everything (including the GPU)
        // starts from the same clean slate as the joiners.
        if let Err(err) = self.machine.deserialize_state(&raw) {
            self.close_session_with_error(&format!("Failed to reload host state: {err}"));
            return;
        }

        self.state = SessionState::Resetting;
        self.reset_players = 1 << self.local_player_id;
        self.reset_start = Instant::now();
    }

    fn request_reset(&mut self, reason: ResetReason, causing_player_id: i16) {
        debug_assert!(!self.is_host());
        debug!(
            reason = reason.describe(),
            causing = causing_player_id,
            "requesting reset from host"
        );
        let message = ControlMessage::ResetRequest(ResetRequest {
            reason,
            causing_player_id,
        });
        self.send_control_to_player(HOST_PLAYER_ID, &message);

        // The host will send a resync shortly; enter the state early so
        // we stop producing gameplay traffic for the dead session.
        self.destroy_rollback_session();
        self.state = SessionState::Resetting;
        self.reset_players = 1 << self.local_player_id;
        self.reset_start = Instant::now();
    }

    fn drop_player(&mut self, player_id: i16, reason: DropReason) {
        if !self.is_valid_player_id(player_id)
            || player_id == self.local_player_id
            || player_id == HOST_PLAYER_ID && !self.is_host()
        {
            error!(player = player_id, "invalid drop target");
            return;
        }

        info!(player = player_id, "dropping player");
        self.host.on_netplay_message(&format!(
            "{} left the session: {}",
            self.nickname_for_player(player_id),
            reason.describe()
        ));

        if let Some(peer) = self.peers[player_id as usize].peer.take() {
            self.transport.disconnect(peer, false);
        }
        self.peers[player_id as usize] = PeerSlot::default();
        self.num_players -= 1;

        if self.is_host() {
            // Tell who's left to also drop their side, then resync.
            let message = ControlMessage::DropPlayer(DropPlayer { reason, player_id });
            self.send_control_to_all(&message);
            self.reset();
        } else {
            // The host will follow up with a resynchronize request.
            self.destroy_rollback_session();
            self.state = SessionState::Resetting;
            self.reset_players = 1 << self.local_player_id;
            self.reset_start = Instant::now();
        }
    }

    fn notify_player_joined(&mut self, player_id: i16) {
        if self.is_host() {
            let message = ControlMessage::PlayerJoined { player_id };
            self.send_control_to_all(&message);
        }
        self.host.on_netplay_message(&format!(
            "{} is joining the session as player {}.",
            self.nickname_for_player(player_id),
            player_id
        ));
    }

    fn request_close_session(&mut self, reason: CloseReason) {
        if self.is_host() {
            let message = ControlMessage::CloseSession { reason };
            self.send_control_to_all(&message);
        }
        self.destroy_rollback_session();
        self.state = SessionState::ClosingSession;
        self.reset_start = Instant::now();
    }

    fn close_session_with_error(&mut self, message: &str) {
        error!("{message}");
        self.host.report_error("Netplay Error", message);
        self.destroy_rollback_session();
        self.state = SessionState::ClosingSession;
        self.reset_start = Instant::now();
    }

    fn show_chat_message(&mut self, player_id: i16, text: &str) {
        if text.is_empty() {
            return;
        }
        let line = format!("{}: {}", self.nickname_for_player(player_id), text);
        self.host.on_netplay_message(&line);
    }

    // ------------------------------------------------------------------
    // Rollback session wiring
    // ------------------------------------------------------------------

    fn create_rollback_session(&mut self) -> Result<(), NetplayError> {
        let mut rollback = RollbackSession::new(self.num_players as usize, MAX_ROLLBACK_FRAMES);

        let mut player_number = 0;
        for id in 0..MAX_PLAYERS {
            let is_local = id as i16 == self.local_player_id;
            if !is_local && self.peers[id].peer.is_none() {
                continue;
            }
            let kind = if is_local {
                PlayerKind::Local
            } else {
                // Checked above.
                PlayerKind::Remote(self.peers[id].peer.ok_or(NetplayError::InvalidHandle(id))?)
            };
            let handle = rollback.add_player(kind, player_number)?;
            self.peers[id].rollback_handle = Some(handle);
            if is_local {
                self.local_handle = Some(handle);
            }
            player_number += 1;
        }

        if let Some(handle) = self.local_handle {
            rollback.set_frame_delay(handle, self.options.local_delay);
        }

        self.rollback = Some(rollback);
        self.pacer = FramePacer::new(self.machine.throttle_hz());
        Ok(())
    }

    fn destroy_rollback_session(&mut self) {
        if self.rollback.take().is_some() {
            debug!("destroying rollback session");
        }
        self.pool.clear();
        self.local_handle = None;
        for slot in &mut self.peers {
            slot.rollback_handle = None;
        }
    }

    fn with_handler<R>(
        &mut self,
        f: impl FnOnce(&mut RollbackSession, &mut RunnerHandler<'_, M, H>) -> R,
    ) -> Option<R> {
        let rollback = self.rollback.as_mut()?;
        let mut handler = RunnerHandler {
            machine: &mut self.machine,
            host: &mut self.host,
            pool: &mut self.pool,
            pacer: &mut self.pacer,
            current_frame: rollback.current_frame(),
        };
        Some(f(rollback, &mut handler))
    }

    // ------------------------------------------------------------------
    // Roster helpers
    // ------------------------------------------------------------------

    fn is_valid_player_id(&self, player_id: i16) -> bool {
        player_id == self.local_player_id
            || ((0..MAX_PLAYERS as i16).contains(&player_id)
                && self.peers[player_id as usize].peer.is_some())
    }

    fn free_player_id(&self) -> Option<i16> {
        (0..MAX_PLAYERS as i16)
            .find(|&id| id != self.local_player_id && self.peers[id as usize].peer.is_none())
    }

    fn reset_player_acked(&self, player_id: i16) -> bool {
        self.reset_players & (1 << player_id) != 0
    }

    fn nickname_for_player(&self, player_id: i16) -> &str {
        if player_id == self.local_player_id {
            &self.local_nickname
        } else if (0..MAX_PLAYERS as i16).contains(&player_id) {
            &self.peers[player_id as usize].nickname
        } else {
            ""
        }
    }

    fn player_id_for_peer(&self, peer: PeerId) -> Option<i16> {
        self.peers
            .iter()
            .position(|slot| slot.peer == Some(peer))
            .map(|id| id as i16)
    }

    fn send_control(&mut self, peer: PeerId, message: &ControlMessage) {
        let bytes = match message.encode() {
            Ok(bytes) => bytes,
            Err(err) => {
                error!(%err, "failed to encode control message");
                return;
            }
        };
        if let Err(err) = self.transport.send(peer, Channel::Control, &bytes) {
            error!(%peer, %err, "failed to send control message");
        }
    }

    fn send_control_to_player(&mut self, player_id: i16, message: &ControlMessage) {
        if let Some(peer) = self.peers[player_id as usize].peer {
            self.send_control(peer, message);
        }
    }

    fn send_control_to_all(&mut self, message: &ControlMessage) {
        let local = self.local_player_id;
        let peers: Vec<PeerId> = self
            .peers
            .iter()
            .enumerate()
            .filter(|(id, _)| *id as i16 != local)
            .filter_map(|(_, slot)| slot.peer)
            .collect();
        for peer in peers {
            self.send_control(peer, message);
        }
    }
}
