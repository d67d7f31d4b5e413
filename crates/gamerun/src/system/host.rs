//! # Host platform adapter
//!
//! The concrete [`System`] used by the runner: clocks, a timer pump, a
//! storage pump, video/audio sinks and the input producers that feed the
//! event queue.
//!
//! `HostSystem` is a cheap handle over shared state. The pumps keep running
//! while any handle is alive; dropping the last one closes their request
//! channels, which stops them and eventually ends the event stream.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;
use std::time::SystemTime;

use tokio::sync::mpsc;

use crate::action::ActionId;
use crate::action::ActionRegistry;
use crate::event::Event;
use crate::event::Key;
use crate::event::KeyEvent;
use crate::event::MouseButton;
use crate::event::MouseEvent;
use crate::event::Position;
use crate::event::Size;
use crate::event::TimeoutTag;
use crate::queue::EventReceiver;
use crate::queue::EventSender;
use crate::queue::event_queue;
use crate::system::AudioSink;
use crate::system::FrameBuffer;
use crate::system::MemoryStore;
use crate::system::PixelFormat;
use crate::system::SampleFormat;
use crate::system::SampleQueue;
use crate::system::StateStore;
use crate::system::System;
use crate::system::VideoFrame;
use crate::system::VideoSink;
use crate::system::VideoSpec;
use crate::system::storage;
use crate::system::storage::StorageRequest;
use crate::system::timer;
use crate::system::timer::TimerRequest;

/// Fluent builder for [`HostSystem`].
///
/// Defaults: an 800x600 window, an in-memory store and headless sinks.
pub struct HostBuilder {
    window: Size,
    store: Arc<dyn StateStore>,
    video: Arc<dyn VideoSink>,
    audio: Arc<dyn AudioSink>,
}

impl HostBuilder {
    pub fn new() -> Self {
        Self {
            window: Size::new(800, 600),
            store: Arc::new(MemoryStore::new()),
            video: Arc::new(FrameBuffer::new()),
            audio: Arc::new(SampleQueue::new()),
        }
    }

    pub fn window(mut self, size: Size) -> Self {
        self.window = size;
        self
    }

    pub fn store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = store;
        self
    }

    pub fn video(mut self, sink: Arc<dyn VideoSink>) -> Self {
        self.video = sink;
        self
    }

    pub fn audio(mut self, sink: Arc<dyn AudioSink>) -> Self {
        self.audio = sink;
        self
    }

    /// Starts the pumps and returns the adapter with its event stream.
    ///
    /// Must be called from within a tokio runtime. The first event in the
    /// stream is always `window.redrawNeeded` with the configured size.
    pub fn build(self) -> (HostSystem, EventReceiver) {
        let (events, receiver) = event_queue();
        events.push(Event::redraw_needed(self.window));

        let inner = Inner {
            actions: ActionRegistry::new(),
            started: Instant::now(),
            timers: timer::spawn_pump(events.clone()),
            storage: storage::spawn_pump(self.store, events.clone()),
            events,
            video: self.video,
            audio: self.audio,
            window: Mutex::new(self.window),
            audio_ready: AtomicBool::new(false),
        };
        tracing::debug!(width = self.window.width, height = self.window.height, "host system started");
        (HostSystem { inner: Arc::new(inner) }, receiver)
    }
}

impl Default for HostBuilder {
    fn default() -> Self {
        Self::new()
    }
}

struct Inner {
    actions: ActionRegistry,
    events: EventSender,
    started: Instant,
    timers: mpsc::UnboundedSender<TimerRequest>,
    storage: mpsc::UnboundedSender<StorageRequest>,
    video: Arc<dyn VideoSink>,
    audio: Arc<dyn AudioSink>,
    window: Mutex<Size>,
    audio_ready: AtomicBool,
}

#[derive(Clone)]
pub struct HostSystem {
    inner: Arc<Inner>,
}

impl HostSystem {
    pub fn builder() -> HostBuilder {
        HostBuilder::new()
    }

    /// Current window size, as last announced by `notify_redraw_needed`.
    pub fn window(&self) -> Size {
        *self.inner.window.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of action ids issued so far.
    pub fn actions_issued(&self) -> u64 {
        self.inner.actions.issued()
    }

    pub fn push_event(&self, event: Event) {
        self.inner.events.push(event);
    }

    pub fn key_up(&self, key: Key) {
        self.push_event(Event::Key(KeyEvent::Up { key }));
    }

    pub fn key_down(&self, key: Key) {
        self.push_event(Event::Key(KeyEvent::Down { key }));
    }

    pub fn mouse_move(&self, position: Position) {
        self.push_event(Event::Mouse(MouseEvent::Move { position }));
    }

    pub fn mouse_down(&self, position: Position, button: MouseButton) {
        self.push_event(Event::Mouse(MouseEvent::Down { position, button }));
    }

    pub fn mouse_up(&self, position: Position, button: MouseButton) {
        self.push_event(Event::Mouse(MouseEvent::Up { position, button }));
    }

    /// Records the new window size and asks the guest to redraw.
    pub fn notify_redraw_needed(&self, size: Size) {
        *self.inner.window.lock().unwrap_or_else(PoisonError::into_inner) = size;
        self.push_event(Event::redraw_needed(size));
    }

    fn request_storage(&self, request: impl FnOnce(ActionId) -> StorageRequest) -> ActionId {
        let id = self.inner.actions.next_id();
        if self.inner.storage.send(request(id)).is_err() {
            // Only reachable once the runtime driving the pump has shut down.
            tracing::warn!(%id, "storage pump is gone; request dropped");
        }
        id
    }
}

impl System for HostSystem {
    fn video_init(&self, size: Size) -> VideoSpec {
        tracing::debug!(width = size.width, height = size.height, "video init");
        VideoSpec {
            pixel_format: PixelFormat::Rgb32,
            stride: size.width,
        }
    }

    fn video_draw(&self, frame: VideoFrame<'_>) {
        if frame.is_empty() {
            return;
        }
        self.inner.video.draw(&frame);
    }

    fn audio_init(&self, sample_rate: u32, data_samples: usize) -> SampleFormat {
        tracing::debug!(sample_rate, data_samples, "audio init");
        self.inner.audio.init(sample_rate);
        self.inner.audio_ready.store(true, Ordering::Release);
        SampleFormat::native_f32()
    }

    fn audio_enqueue(&self, data: &[u8]) {
        if !self.inner.audio_ready.load(Ordering::Acquire) {
            tracing::warn!(bytes = data.len(), "audio enqueued before init; dropped");
            return;
        }
        let samples = data
            .chunks_exact(4)
            .map(|chunk| f32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();
        self.inner.audio.enqueue(samples);
    }

    fn console_log(&self, message: &str) {
        tracing::info!(target: "guest", "{}", message);
    }

    fn clock_game_time(&self) -> Duration {
        self.inner.started.elapsed()
    }

    fn clock_unix_time(&self) -> Duration {
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
    }

    fn clock_set_timeout(&self, tag: TimeoutTag, timeout: Duration) -> ActionId {
        let id = self.inner.actions.next_id();
        tracing::trace!(%id, tag = tag.0, ?timeout, "timeout requested");
        if self.inner.timers.send(TimerRequest::new(id, tag, timeout)).is_err() {
            tracing::warn!(%id, "timer pump is gone; timeout dropped");
        }
        id
    }

    fn state_save(&self, name: &str, data: &[u8]) -> ActionId {
        self.request_storage(|id| StorageRequest::Save {
            id,
            name: name.to_string(),
            data: data.to_vec(),
        })
    }

    fn state_load(&self, name: &str) -> ActionId {
        self.request_storage(|id| StorageRequest::Load {
            id,
            name: name.to_string(),
        })
    }

    fn state_delete(&self, name: &str) -> ActionId {
        self.request_storage(|id| StorageRequest::Delete {
            id,
            name: name.to_string(),
        })
    }
}
