//! Integration tests driving scripted guests through the full bridge.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::json;
use wasmtime::Engine;

use gamerun::ActionId;
use gamerun::Driver;
use gamerun::Event;
use gamerun::Game;
use gamerun::GameConfig;
use gamerun::HostSystem;
use gamerun::IoHandler;
use gamerun::IoRequest;
use gamerun::Workspace;
use gamerun::event::Size;
use gamerun::event::TimeoutTag;
use gamerun::fault::ProtocolViolation;
use gamerun::game::Error;
use gamerun::queue::EventReceiver;
use gamerun::system::FrameBuffer;
use gamerun::system::SampleQueue;
use gamerun::workspace::InputNumber;

/// Helper to load WAT fixtures.
fn wat(name: &str) -> Vec<u8> {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(format!("{}.wat", name));
    std::fs::read(&path).unwrap_or_else(|_| panic!("Could not read fixture: {}", path.display()))
}

struct Session {
    game: Game<HostSystem>,
    host: HostSystem,
    events: EventReceiver,
    video: FrameBuffer,
    audio: SampleQueue,
}

impl Session {
    fn new() -> Self {
        let video = FrameBuffer::new();
        let audio = SampleQueue::new();
        let (host, events) = HostSystem::builder()
            .window(Size::new(320, 240))
            .video(Arc::new(video.clone()))
            .audio(Arc::new(audio.clone()))
            .build();
        let game = Game::from_bytes(&Engine::default(), &wat("editor"), &GameConfig::ephemeral())
            .expect("Failed to load editor fixture");
        Self {
            game,
            host,
            events,
            video,
            audio,
        }
    }

    fn initialized() -> Self {
        let mut session = Self::new();
        session.game.initialize(&session.host).expect("Failed to initialize");
        session
    }

    fn command(&mut self, name: &str, payload: &[u8]) -> gamerun::game::Result<()> {
        self.game.command(&self.host, name, payload)
    }

    fn query(&mut self, name: &str) -> gamerun::game::Result<Vec<u8>> {
        self.game.query(&self.host, name)
    }

    fn workspace(&mut self) -> Workspace<'_, HostSystem> {
        Workspace::new(&mut self.game, &self.host)
    }

    /// Delivers the next queued event to the guest.
    async fn pump(&mut self) -> gamerun::game::Result<bool> {
        let event = self.events.next().await.expect("event stream ended");
        self.game.handle_event(&self.host, event)
    }

    fn assert_balanced(&self) {
        let stats = self.game.buffer_stats();
        assert_eq!(stats.live, 0, "buffers leaked: {:?}", stats);
        assert_eq!(stats.obtained, stats.freed);
    }
}

fn fault_message(error: &Error) -> &str {
    match error {
        Error::Fault(fault) => &fault.message,
        other => panic!("expected a guest fault, got {:?}", other),
    }
}

// --- Lifecycle ---

#[tokio::test]
async fn test_initialize() {
    let mut session = Session::new();
    session.game.initialize(&session.host).unwrap();
    assert!(!session.game.is_terminated());
    session.assert_balanced();
}

#[tokio::test]
async fn test_initialize_twice_is_rejected() {
    let mut session = Session::initialized();
    let err = session.game.initialize(&session.host).unwrap_err();
    assert!(matches!(err, Error::Protocol(ProtocolViolation::AlreadyInitialized)));
    // The guest itself is untouched.
    assert!(session.query("stateVersion").is_ok());
}

#[tokio::test]
async fn test_events_wait_for_initialize() {
    let mut session = Session::new();
    let err = session.pump().await.unwrap_err();
    assert!(matches!(err, Error::Protocol(ProtocolViolation::NotInitialized)));
    assert!(!session.game.is_terminated());

    session.game.initialize(&session.host).unwrap();
    session.host.key_down(gamerun::event::Key::B);
    assert!(session.pump().await.unwrap());
    let count = session.query("c").unwrap();
    assert_eq!(u32::from_le_bytes(count.try_into().unwrap()), 1);
    session.assert_balanced();
}

#[tokio::test]
async fn test_failed_initialize_is_terminal() {
    let mut session = Session::new();
    session.command("M", &[2]).unwrap();
    let err = session.game.initialize(&session.host).unwrap_err();
    assert_eq!(fault_message(&err), "init failed");
    assert!(session.game.is_terminated());
    assert!(matches!(session.query("stateVersion"), Err(Error::Terminated)));
    session.assert_balanced();
}

#[tokio::test]
async fn test_capability_outside_bridge_call() {
    let result = Game::<HostSystem>::from_bytes(&Engine::default(), &wat("eager"), &GameConfig::ephemeral());
    assert!(matches!(result, Err(Error::Protocol(ProtocolViolation::NoActiveSystem))));
}

#[tokio::test]
async fn test_memory_limit_applies_to_instantiation() {
    let config = GameConfig::ephemeral().max_memory(Some(64 * 1024));
    let result = Game::<HostSystem>::from_bytes(&Engine::default(), &wat("editor"), &config);
    assert!(matches!(result, Err(Error::Module(_))));
}

// --- Events ---

#[tokio::test]
async fn test_first_event_is_redraw() {
    let mut session = Session::initialized();
    assert!(session.pump().await.unwrap());

    let envelope: serde_json::Value = serde_json::from_slice(&session.query("e").unwrap()).unwrap();
    assert_eq!(
        envelope,
        json!({"window": {"redrawNeeded": {"size": {"width": 320, "height": 240}}}})
    );
    session.assert_balanced();
}

#[tokio::test]
async fn test_shutdown_sentinel() {
    let mut session = Session::initialized();
    session.command("M", &[1]).unwrap();
    assert!(!session.pump().await.unwrap());
    assert!(!session.game.is_terminated());
    session.assert_balanced();
}

#[tokio::test]
async fn test_event_fault_is_reported() {
    let mut session = Session::initialized();
    session.command("M", &[2]).unwrap();
    let err = session.pump().await.unwrap_err();
    assert_eq!(fault_message(&err), "boom");
    assert!(!session.game.is_terminated());
    session.assert_balanced();
}

#[tokio::test]
async fn test_input_events_reach_guest() {
    let mut session = Session::initialized();
    session.pump().await.unwrap();

    session.host.key_down(gamerun::event::Key::A);
    session.host.mouse_down(
        gamerun::event::Position::new(4, 5),
        gamerun::event::MouseButton::Right,
    );
    session.pump().await.unwrap();
    let envelope: serde_json::Value = serde_json::from_slice(&session.query("e").unwrap()).unwrap();
    assert_eq!(envelope, json!({"key": {"down": {"key": "a"}}}));

    session.pump().await.unwrap();
    let envelope: serde_json::Value = serde_json::from_slice(&session.query("e").unwrap()).unwrap();
    assert_eq!(
        envelope,
        json!({"mouse": {"down": {"position": {"x": 4, "y": 5}, "button": "right"}}})
    );

    let count = session.query("c").unwrap();
    assert_eq!(u32::from_le_bytes(count.try_into().unwrap()), 3);
    session.assert_balanced();
}

// --- Queries and commands ---

#[tokio::test]
async fn test_query_failure_status() {
    let mut session = Session::initialized();
    let err = session.query("f").unwrap_err();
    assert_eq!(fault_message(&err), "no such thing");
    assert!(!session.game.is_terminated());
    session.assert_balanced();
}

#[tokio::test]
async fn test_query_without_status_tag() {
    let mut session = Session::initialized();
    let err = session.query("z").unwrap_err();
    assert!(matches!(err, Error::Protocol(ProtocolViolation::MissingStatusTag)));
    session.assert_balanced();
}

#[tokio::test]
async fn test_command_failure() {
    let mut session = Session::initialized();
    let err = session.command("X", b"payload").unwrap_err();
    assert_eq!(fault_message(&err), "bad command");
    session.command("C", b"still alive").unwrap();
    session.assert_balanced();
}

#[tokio::test]
async fn test_trap_is_terminal() {
    let mut session = Session::initialized();
    let err = session.command("U", &[]).unwrap_err();
    assert!(matches!(err, Error::Trap(_)));
    assert!(session.game.is_terminated());
    assert!(matches!(session.command("C", b"hello"), Err(Error::Terminated)));
}

#[tokio::test]
async fn test_state_version_changes_on_load() {
    let mut session = Session::initialized();
    let mut workspace = session.workspace();
    let before = workspace.state_version().unwrap();
    workspace.load_workspace(b"first").unwrap();
    let after_first = workspace.state_version().unwrap();
    workspace.load_workspace(b"second").unwrap();
    let after_second = workspace.state_version().unwrap();

    assert_eq!(before, 0);
    assert_ne!(before, after_first);
    assert_ne!(after_first, after_second);
    assert_eq!(workspace.workspace_png().unwrap(), b"png!".to_vec());
    session.assert_balanced();
}

#[tokio::test]
async fn test_workspace_commands() {
    let mut session = Session::initialized();
    let mut workspace = session.workspace();
    workspace.disable_save_workspace_button().unwrap();
    workspace
        .notify_input_number(&InputNumber {
            id: 7,
            number: "12".to_string(),
        })
        .unwrap();
    workspace.import_image(b"image").unwrap();
    assert_eq!(workspace.state_version().unwrap(), 1);

    assert_eq!(session.query("b").unwrap(), vec![1]);
    let payload: serde_json::Value = serde_json::from_slice(&session.query("p").unwrap()).unwrap();
    assert_eq!(payload, json!({"id": 7, "number": "12"}));
    session.assert_balanced();
}

// --- Asynchronous capabilities ---

#[tokio::test]
async fn test_storage_scenario() {
    let mut session = Session::initialized();
    session.pump().await.unwrap();

    session.command("S", &[1, 2, 3]).unwrap();
    session.command("G", &[]).unwrap();
    session.command("D", &[]).unwrap();
    session.command("G", &[]).unwrap();

    let expected = [
        Event::state_saved(ActionId(0), None),
        Event::state_loaded(ActionId(1), Some(vec![1, 2, 3]), None),
        Event::state_deleted(ActionId(2), None),
        Event::state_loaded(ActionId(3), None, None),
    ];
    for event in expected {
        assert_eq!(session.events.next().await, Some(event));
    }
    session.assert_balanced();
}

#[tokio::test]
async fn test_loaded_state_travels_as_separate_buffer() {
    let mut session = Session::initialized();
    session.pump().await.unwrap();

    session.command("S", &[9, 8, 7]).unwrap();
    session.command("G", &[]).unwrap();
    assert!(session.pump().await.unwrap()); // saved
    assert!(session.pump().await.unwrap()); // loaded

    let envelope: serde_json::Value = serde_json::from_slice(&session.query("e").unwrap()).unwrap();
    assert_eq!(envelope, json!({"state": {"loaded": {"id": 1}}}));
    assert_eq!(session.query("p").unwrap(), vec![9, 8, 7]);
    session.assert_balanced();
}

#[tokio::test]
async fn test_zero_delay_timeouts_keep_call_order() {
    let mut session = Session::initialized();
    session.pump().await.unwrap();

    session.command("T", b"x").unwrap();
    session.command("T", b"y").unwrap();

    assert_eq!(
        session.events.next().await,
        Some(Event::timeout(ActionId(0), TimeoutTag(b'x' as u32)))
    );
    assert_eq!(
        session.events.next().await,
        Some(Event::timeout(ActionId(1), TimeoutTag(b'y' as u32)))
    );
}

// --- Video, audio, clocks ---

#[tokio::test]
async fn test_video_frame_is_drawn() {
    let mut session = Session::initialized();
    session.command("V", &[]).unwrap();

    let frame = session.video.latest().expect("no frame drawn");
    assert_eq!(frame.size, Size::new(2, 1));
    assert_eq!(frame.pixels, vec![1, 2, 3, 255, 4, 5, 6, 255]);
    assert_eq!(session.video.drawn(), 1);
}

#[tokio::test]
async fn test_unexpected_pixel_format_is_a_violation() {
    let mut session = Session::initialized();
    let err = session.command("B", &[]).unwrap_err();
    assert!(matches!(
        err,
        Error::Protocol(ProtocolViolation::UnexpectedPixelFormat(0))
    ));
    assert!(session.game.is_terminated());
    assert_eq!(session.video.drawn(), 0);
}

#[tokio::test]
async fn test_partial_row_frame_is_a_violation() {
    let mut session = Session::initialized();
    let err = session.command("P", &[]).unwrap_err();
    assert!(matches!(
        err,
        Error::Protocol(ProtocolViolation::PartialRow { width: 2, len: 9 })
    ));
    assert_eq!(session.video.drawn(), 0);
}

#[tokio::test]
async fn test_capability_region_out_of_bounds() {
    let mut session = Session::initialized();
    let err = session.command("O", &[]).unwrap_err();
    assert!(matches!(
        err,
        Error::Protocol(ProtocolViolation::OutOfBounds { offset: 262_140, len: 8 })
    ));
    assert!(session.game.is_terminated());
}

#[cfg(target_endian = "little")]
#[tokio::test]
async fn test_audio_samples_are_forwarded() {
    let mut session = Session::initialized();
    session.command("A", &[]).unwrap();
    assert_eq!(session.audio.sample_rate(), Some(48_000));
    assert_eq!(session.audio.drain(), vec![0.5, -0.5]);
}

#[tokio::test]
async fn test_clocks() {
    let mut session = Session::initialized();
    let unix = f64::from_le_bytes(session.query("u").unwrap().try_into().unwrap());
    assert!(unix > 1_600_000_000.0);
    let game_time = f64::from_le_bytes(session.query("g").unwrap().try_into().unwrap());
    assert!(game_time >= 0.0);
    assert!(game_time < 3600.0);
}

// --- Driver ---

#[derive(Default)]
struct Recorder {
    requests: Vec<IoRequest>,
    saved: Vec<Vec<u8>>,
    dirty: usize,
}

impl IoHandler<HostSystem> for Recorder {
    type Error = Error;

    fn handle(&mut self, request: IoRequest, workspace: &mut Workspace<'_, HostSystem>) -> Result<(), Error> {
        if request == IoRequest::SaveWorkspace {
            self.saved.push(workspace.workspace_png()?);
        }
        self.requests.push(request);
        Ok(())
    }

    fn notify_dirty(&mut self) {
        self.dirty += 1;
    }
}

fn driver() -> Driver<HostSystem, Recorder> {
    let session = Session::initialized();
    Driver::new(session.game, session.host, session.events, Recorder::default())
}

#[tokio::test]
async fn test_driver_dispatches_io_requests() {
    let mut driver = driver();
    let host = driver.system().clone();

    driver.game_mut().command(&host, "R", &[1]).unwrap();
    assert!(driver.run_once().await.unwrap());
    assert_eq!(driver.handler().requests, vec![IoRequest::SaveWorkspace]);
    assert_eq!(driver.handler().saved, vec![b"png!".to_vec()]);

    driver.game_mut().command(&host, "R", &[2]).unwrap();
    host.key_up(gamerun::event::Key::Escape);
    assert!(driver.run_once().await.unwrap());
    assert_eq!(driver.handler().requests[1], IoRequest::InputNumber { id: 7 });

    // Nothing pending: no new request.
    host.key_up(gamerun::event::Key::Escape);
    assert!(driver.run_once().await.unwrap());
    assert_eq!(driver.handler().requests.len(), 2);
}

#[tokio::test]
async fn test_driver_skips_undecodable_request() {
    let mut driver = driver();
    let host = driver.system().clone();

    driver.game_mut().command(&host, "R", &[3]).unwrap();
    assert!(driver.run_once().await.unwrap());
    assert!(driver.handler().requests.is_empty());
    assert!(!driver.game().is_terminated());
}

#[tokio::test]
async fn test_driver_dirty_notification() {
    let mut driver = driver().dirty_notification(true).unwrap();
    let host = driver.system().clone();

    // Redraw without changes.
    assert!(driver.run_once().await.unwrap());
    assert_eq!(driver.handler().dirty, 0);

    driver.game_mut().command(&host, "loadWorkspace", b"a").unwrap();
    host.key_down(gamerun::event::Key::Space);
    assert!(driver.run_once().await.unwrap());
    assert_eq!(driver.handler().dirty, 1);

    // Still dirty: no second notification.
    driver.game_mut().command(&host, "loadWorkspace", b"b").unwrap();
    host.key_up(gamerun::event::Key::Space);
    assert!(driver.run_once().await.unwrap());
    assert_eq!(driver.handler().dirty, 1);

    // Saving resets the baseline.
    assert_eq!(driver.get_workspace().unwrap(), b"png!".to_vec());
    host.key_down(gamerun::event::Key::Space);
    assert!(driver.run_once().await.unwrap());
    assert_eq!(driver.handler().dirty, 1);

    driver.set_workspace(b"c").unwrap();
    driver.game_mut().command(&host, "importImage", b"d").unwrap();
    host.key_up(gamerun::event::Key::Space);
    assert!(driver.run_once().await.unwrap());
    assert_eq!(driver.handler().dirty, 2);
}

#[tokio::test]
async fn test_driver_stops_on_shutdown() {
    let mut driver = driver();
    let host = driver.system().clone();

    host.key_down(gamerun::event::Key::Q);
    driver.game_mut().command(&host, "M", &[1]).unwrap();
    driver.run().await.unwrap();

    let stats = driver.game().buffer_stats();
    assert_eq!(stats.live, 0);
    // The redraw event shut the guest down; the key press is still queued.
    assert!(driver.handler().requests.is_empty());
}

#[tokio::test]
async fn test_driver_propagates_faults() {
    let mut driver = driver();
    let host = driver.system().clone();

    driver.game_mut().command(&host, "M", &[2]).unwrap();
    let err = driver.run().await.unwrap_err();
    assert_eq!(fault_message(&err), "boom");
}
