//! End-to-end session tests over loopback UDP.
//!
//! Each peer runs a real `NetplaySession` on its own thread with a small
//! deterministic machine; the network between them is the real transport.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use basalt_netplay::machine::MachineError;
use basalt_netplay::session::{NetplaySession, SessionOptions, SessionState};
use basalt_netplay::{
    Channel, Endpoint, HostInterface, Machine, MachineSnapshot, SessionSettings, TransportEvent,
};
use basalt_netproto::control::{ConnectResponse, ConnectResult};
use basalt_netproto::ControlMessage;

struct TestMachine {
    frame: u32,
    state: u64,
    deserialize_calls: Arc<AtomicU32>,
}

impl TestMachine {
    fn new() -> Self {
        Self {
            frame: 0,
            state: 0x0123_4567_89AB_CDEF,
            deserialize_calls: Arc::new(AtomicU32::new(0)),
        }
    }
}

impl Machine for TestMachine {
    fn run_frame(&mut self) {
        self.frame += 1;
        self.state = self.state.wrapping_mul(6364136223846793005).wrapping_add(1);
    }

    fn frame_number(&self) -> u32 {
        self.frame
    }

    fn throttle_hz(&self) -> f64 {
        60.0
    }

    fn save_snapshot(&mut self, out: &mut MachineSnapshot) -> Result<(), MachineError> {
        out.data.clear();
        out.data.extend_from_slice(&self.frame.to_le_bytes());
        out.data.extend_from_slice(&self.state.to_le_bytes());
        Ok(())
    }

    fn load_snapshot(&mut self, snapshot: &MachineSnapshot) -> Result<(), MachineError> {
        let data = &snapshot.data;
        if data.len() != 12 {
            return Err(MachineError::Load(format!("bad snapshot size {}", data.len())));
        }
        self.frame = u32::from_le_bytes(data[0..4].try_into().unwrap());
        self.state = u64::from_le_bytes(data[4..12].try_into().unwrap());
        Ok(())
    }

    fn serialize_state(&mut self) -> Result<Vec<u8>, MachineError> {
        let mut snapshot = MachineSnapshot::default();
        self.save_snapshot(&mut snapshot)?;
        Ok(snapshot.data)
    }

    fn deserialize_state(&mut self, data: &[u8]) -> Result<(), MachineError> {
        self.deserialize_calls.fetch_add(1, Ordering::SeqCst);
        self.load_snapshot(&MachineSnapshot {
            data: data.to_vec(),
        })
    }

    fn set_audio_muted(&mut self, _muted: bool) {}

    fn set_button_state(&mut self, _slot: usize, _button: usize, _pressed: bool) {}
}

struct TestHost {
    deadline: Instant,
    messages: Arc<Mutex<Vec<String>>>,
    errors: Arc<Mutex<Vec<String>>>,
}

impl TestHost {
    fn run_for(duration: Duration) -> Self {
        Self {
            deadline: Instant::now() + duration,
            messages: Arc::new(Mutex::new(Vec::new())),
            errors: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl HostInterface for TestHost {
    fn on_netplay_message(&mut self, text: &str) {
        self.messages.lock().unwrap().push(text.to_string());
    }

    fn display_loading_screen(&mut self, _text: &str, _progress: Option<(u32, u32)>) {}

    fn pump_messages(&mut self) -> bool {
        Instant::now() < self.deadline
    }

    fn report_error(&mut self, title: &str, message: &str) {
        self.errors.lock().unwrap().push(format!("{title}: {message}"));
    }

    fn set_settings_overlay(&mut self, _overlay: Option<SessionSettings>) {}
}

fn messages_of(host: &TestHost) -> Vec<String> {
    host.messages.lock().unwrap().clone()
}

fn errors_of(host: &TestHost) -> Vec<String> {
    host.errors.lock().unwrap().clone()
}

#[test]
fn host_only_session_starts_running() {
    let session = NetplaySession::create_session(
        TestMachine::new(),
        TestHost::run_for(Duration::from_secs(1)),
        "Alice",
        0,
        2,
        "",
        SessionOptions::default(),
    )
    .unwrap();

    assert_eq!(session.state(), SessionState::Running);
    assert!(session.is_host());
    assert_eq!(session.num_players(), 1);
}

#[test]
fn join_handshake_reaches_running_on_both_peers() {
    let host_session = NetplaySession::create_session(
        TestMachine::new(),
        TestHost::run_for(Duration::from_secs(5)),
        "Alice",
        0,
        2,
        "",
        SessionOptions::default(),
    )
    .unwrap();
    let port = host_session.local_addr().unwrap().port();

    let host_thread = std::thread::spawn(move || {
        let mut session = host_session;
        session.execute();
        session
    });

    let joiner_thread = std::thread::spawn(move || {
        let mut session = NetplaySession::join_session(
            TestMachine::new(),
            TestHost::run_for(Duration::from_secs(3)),
            "Bob",
            "127.0.0.1",
            port,
            "",
            SessionOptions::default(),
        )
        .unwrap();
        session.execute();
        session
    });

    let joiner = joiner_thread.join().unwrap();
    let host = host_thread.join().unwrap();

    assert_eq!(host.state(), SessionState::Inactive);
    assert_eq!(joiner.state(), SessionState::Inactive);
    assert!(errors_of(host.host_interface()).is_empty());
    assert!(errors_of(joiner.host_interface()).is_empty());

    // The handshake admitted Bob as player 1 and both sides saw the join.
    let host_messages = messages_of(host.host_interface());
    assert!(
        host_messages
            .iter()
            .any(|m| m.contains("Bob is joining the session as player 1")),
        "host messages: {host_messages:?}"
    );
    let joiner_messages = messages_of(joiner.host_interface());
    assert!(
        joiner_messages
            .iter()
            .any(|m| m.contains("is joining the session as player 1")),
        "joiner messages: {joiner_messages:?}"
    );

    // Both machines actually simulated frames after the resync.
    assert!(host.machine().frame_number() > 30);
    assert!(joiner.machine().frame_number() > 30);

    // The joiner leaving first put the host through a drop + resync.
    assert!(
        host_messages.iter().any(|m| m.contains("left the session")),
        "host messages: {host_messages:?}"
    );
}

#[test]
fn connect_timeout_reports_error_and_goes_inactive() {
    let options = SessionOptions {
        connect_timeout: Duration::from_millis(400),
        connect_retries: 1,
        close_timeout: Duration::from_millis(200),
        ..SessionOptions::default()
    };

    // Nothing listens on the far side of this dial.
    let dead_port = {
        let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.local_addr().unwrap().port()
    };

    let started = Instant::now();
    let mut session = NetplaySession::join_session(
        TestMachine::new(),
        TestHost::run_for(Duration::from_secs(10)),
        "Bob",
        "127.0.0.1",
        dead_port,
        "",
        options,
    )
    .unwrap();
    session.execute();

    assert_eq!(session.state(), SessionState::Inactive);
    assert!(started.elapsed() >= Duration::from_millis(400));
    let errors = errors_of(session.host_interface());
    assert!(
        errors.iter().any(|e| e.contains("Timed out connecting to server")),
        "errors: {errors:?}"
    );
}

#[test]
fn malformed_reset_is_fatal_without_touching_the_machine() {
    // A bare endpoint plays the host and misbehaves on purpose.
    let mut fake_host = Endpoint::bind(0, 2).unwrap();
    let port = fake_host.local_addr().unwrap().port();

    let joiner_thread = std::thread::spawn(move || {
        let machine = TestMachine::new();
        let deserialize_calls = machine.deserialize_calls.clone();
        let mut session = NetplaySession::join_session(
            machine,
            TestHost::run_for(Duration::from_secs(10)),
            "Bob",
            "127.0.0.1",
            port,
            "",
            SessionOptions {
                connect_timeout: Duration::from_secs(5),
                close_timeout: Duration::from_millis(300),
                ..SessionOptions::default()
            },
        )
        .unwrap();
        session.execute();
        (session, deserialize_calls)
    });

    // Accept the joiner and wait for its connect request.
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut joiner_peer = None;
    let mut got_request = false;
    while Instant::now() < deadline && !got_request {
        match fake_host.poll(Instant::now() + Duration::from_millis(20)) {
            Some(TransportEvent::Connected { peer, .. }) => joiner_peer = Some(peer),
            Some(TransportEvent::Received {
                peer,
                channel: Channel::Control,
                payload,
            }) => {
                if let Ok(ControlMessage::ConnectRequest(_)) = ControlMessage::decode(&payload) {
                    joiner_peer = Some(peer);
                    got_request = true;
                }
            }
            _ => {}
        }
    }
    let joiner_peer = joiner_peer.expect("joiner never connected");
    assert!(got_request, "no connect request received");

    let response = ControlMessage::ConnectResponse(ConnectResponse {
        result: ConnectResult::Success,
        player_id: 1,
    });
    fake_host
        .send(joiner_peer, Channel::Control, &response.encode().unwrap())
        .unwrap();

    // A reset whose declared state size exceeds the packet payload.
    let mut reset = ControlMessage::Reset(basalt_netproto::control::Reset {
        cookie: 1,
        num_players: 2,
        players: Default::default(),
        state: bytes::Bytes::from_static(&[0u8; 8]),
    })
    .encode()
    .unwrap();
    reset[8..12].copy_from_slice(&0xFFFF_u32.to_le_bytes());
    fake_host
        .send(joiner_peer, Channel::Control, &reset)
        .unwrap();

    // Keep acking/retransmitting while the joiner reacts and shuts down.
    let drain_until = Instant::now() + Duration::from_secs(3);
    while Instant::now() < drain_until {
        let _ = fake_host.poll(Instant::now() + Duration::from_millis(20));
    }

    let (session, deserialize_calls) = joiner_thread.join().unwrap();
    assert_eq!(session.state(), SessionState::Inactive);
    let errors = errors_of(session.host_interface());
    assert!(
        errors
            .iter()
            .any(|e| e.contains("Invalid synchronization request")),
        "errors: {errors:?}"
    );
    assert_eq!(deserialize_calls.load(Ordering::SeqCst), 0);
}
