//! Per-peer gameplay protocol state: synchronization handshake, link
//! quality measurement, and liveness tracking.

use std::time::{Duration, Instant};

use basalt_netproto::gameplay::GameplayMessage;

use crate::transport::PeerId;

use super::{Frame, NULL_FRAME};

/// Successful `SyncRequest`/`SyncReply` roundtrips required before a peer
/// counts as synchronized.
pub const NUM_SYNC_ROUNDTRIPS: u32 = 5;

const SYNC_RETRY: Duration = Duration::from_millis(200);
const QUALITY_REPORT_INTERVAL: Duration = Duration::from_secs(1);
const GAMEPLAY_KEEPALIVE: Duration = Duration::from_millis(200);

/// Remote silence beyond this raises `DisconnectedFromPeer`.
pub const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub(super) enum SyncOutcome {
    Ignored,
    Progress { count: u32, total: u32 },
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum EndpointState {
    Syncing { roundtrips: u32, pending: u32 },
    Running,
}

pub(super) struct PeerEndpoint {
    pub peer: PeerId,
    pub player_number: usize,
    pub state: EndpointState,
    pub last_recv: Instant,
    pub last_send: Instant,
    last_sync_attempt: Option<Instant>,
    last_quality_report: Instant,
    /// Highest remote input frame received.
    pub last_received_frame: Frame,
    /// Highest local input frame the remote has acknowledged.
    pub last_acked_frame: Frame,
    /// The remote's view of how far ahead it is running.
    pub remote_frame_advantage: i32,
    pub ping_ms: u32,
    pub replied_once: bool,
    pub disconnected: bool,
    rng: u32,
}

impl PeerEndpoint {
    pub fn new(peer: PeerId, player_number: usize, now: Instant) -> Self {
        // Nonce quality does not matter here, the randoms only pair
        // replies with requests.
        let seed = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos()
            ^ (player_number as u32).wrapping_mul(0x9E37_79B9);
        Self {
            peer,
            player_number,
            state: EndpointState::Syncing {
                roundtrips: 0,
                pending: 0,
            },
            last_recv: now,
            last_send: now,
            last_sync_attempt: None,
            last_quality_report: now,
            last_received_frame: NULL_FRAME,
            last_acked_frame: NULL_FRAME,
            remote_frame_advantage: 0,
            ping_ms: 0,
            replied_once: false,
            disconnected: false,
            rng: seed | 1,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, EndpointState::Running)
    }

    fn next_random(&mut self) -> u32 {
        self.rng = self.rng.wrapping_mul(747_796_405).wrapping_add(2_891_336_453);
        self.rng
    }

    /// Produce a sync probe if the handshake is still in progress and the
    /// previous probe went unanswered long enough.
    pub fn sync_probe(&mut self, now: Instant) -> Option<GameplayMessage> {
        let EndpointState::Syncing { roundtrips, .. } = self.state else {
            return None;
        };
        let due = match self.last_sync_attempt {
            None => true,
            Some(at) => now.duration_since(at) >= SYNC_RETRY,
        };
        if !due {
            return None;
        }
        let random = self.next_random();
        self.state = EndpointState::Syncing {
            roundtrips,
            pending: random,
        };
        self.last_sync_attempt = Some(now);
        Some(GameplayMessage::SyncRequest { random })
    }

    pub fn on_sync_reply(&mut self, random: u32, now: Instant) -> SyncOutcome {
        let EndpointState::Syncing { roundtrips, pending } = self.state else {
            return SyncOutcome::Ignored;
        };
        if pending == 0 || random != pending {
            return SyncOutcome::Ignored;
        }
        let roundtrips = roundtrips + 1;
        self.last_sync_attempt = None;
        if roundtrips >= NUM_SYNC_ROUNDTRIPS {
            self.state = EndpointState::Running;
            self.last_recv = now;
            SyncOutcome::Finished
        } else {
            self.state = EndpointState::Syncing {
                roundtrips,
                pending: 0,
            };
            self.last_recv = now;
            SyncOutcome::Progress {
                count: roundtrips,
                total: NUM_SYNC_ROUNDTRIPS,
            }
        }
    }

    pub fn quality_probe(
        &mut self,
        now: Instant,
        clock_ms: u64,
        local_frame_advantage: i32,
    ) -> Option<GameplayMessage> {
        if !self.is_running()
            || now.duration_since(self.last_quality_report) < QUALITY_REPORT_INTERVAL
        {
            return None;
        }
        self.last_quality_report = now;
        Some(GameplayMessage::QualityReport {
            frame_advantage: local_frame_advantage,
            ping: clock_ms,
        })
    }

    pub fn keepalive_due(&self, now: Instant) -> bool {
        self.is_running() && now.duration_since(self.last_send) >= GAMEPLAY_KEEPALIVE
    }

    pub fn timed_out(&self, now: Instant) -> bool {
        self.is_running() && now.duration_since(self.last_recv) >= DISCONNECT_TIMEOUT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> PeerEndpoint {
        let peer = {
            let mut ep = crate::transport::Endpoint::bind(0, 1).unwrap();
            ep.dial("127.0.0.1:9".parse().unwrap(), 0).unwrap()
        };
        PeerEndpoint::new(peer, 1, Instant::now())
    }

    #[test]
    fn handshake_completes_after_five_roundtrips() {
        let mut ep = endpoint();
        let mut now = Instant::now();

        for i in 1..=NUM_SYNC_ROUNDTRIPS {
            let Some(GameplayMessage::SyncRequest { random }) = ep.sync_probe(now) else {
                panic!("expected probe");
            };
            match ep.on_sync_reply(random, now) {
                SyncOutcome::Finished => assert_eq!(i, NUM_SYNC_ROUNDTRIPS),
                SyncOutcome::Progress { count, total } => {
                    assert_eq!(count, i);
                    assert_eq!(total, NUM_SYNC_ROUNDTRIPS);
                }
                SyncOutcome::Ignored => panic!("reply ignored"),
            }
            now += SYNC_RETRY;
        }
        assert!(ep.is_running());
        assert!(ep.sync_probe(now).is_none());
    }

    #[test]
    fn stale_or_forged_replies_are_ignored() {
        let mut ep = endpoint();
        let now = Instant::now();

        let Some(GameplayMessage::SyncRequest { random }) = ep.sync_probe(now) else {
            panic!("expected probe");
        };
        assert!(matches!(
            ep.on_sync_reply(random ^ 1, now),
            SyncOutcome::Ignored
        ));
        // A matching reply still works afterwards.
        assert!(matches!(
            ep.on_sync_reply(random, now),
            SyncOutcome::Progress { count: 1, .. }
        ));
        // The same random cannot be replayed.
        assert!(matches!(ep.on_sync_reply(random, now), SyncOutcome::Ignored));
    }

    #[test]
    fn probes_are_rate_limited() {
        let mut ep = endpoint();
        let now = Instant::now();
        assert!(ep.sync_probe(now).is_some());
        assert!(ep.sync_probe(now).is_none());
        assert!(ep.sync_probe(now + SYNC_RETRY).is_some());
    }

    #[test]
    fn quality_probe_only_when_running() {
        let mut ep = endpoint();
        let now = Instant::now();
        assert!(ep.quality_probe(now, 0, 0).is_none());
    }
}
