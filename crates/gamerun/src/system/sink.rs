//! # Video and audio sinks
//!
//! The device side of `video.draw` and `audio.enqueue`. Real windowing or
//! audio back-ends implement these traits; the headless implementations here
//! keep what they receive in memory for inspection.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use crate::event::Size;
use crate::system::VideoFrame;

pub trait VideoSink: Send + Sync + 'static {
    /// Presents a non-empty frame.
    fn draw(&self, frame: &VideoFrame<'_>);
}

pub trait AudioSink: Send + Sync + 'static {
    fn init(&self, sample_rate: u32);

    fn enqueue(&self, samples: Vec<f32>);
}

/// A copy of the most recently drawn frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub size: Size,
    pub pixels: Vec<u8>,
}

#[derive(Debug, Default)]
struct FrameState {
    latest: Option<Frame>,
    drawn: u64,
}

/// Headless video sink keeping the latest frame.
#[derive(Clone, Debug, Default)]
pub struct FrameBuffer {
    state: Arc<Mutex<FrameState>>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latest(&self) -> Option<Frame> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).latest.clone()
    }

    /// Number of frames drawn so far.
    pub fn drawn(&self) -> u64 {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).drawn
    }
}

impl VideoSink for FrameBuffer {
    fn draw(&self, frame: &VideoFrame<'_>) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.drawn += 1;
        match &mut state.latest {
            // Reuse the allocation when the layout is unchanged.
            Some(latest) if latest.pixels.len() == frame.data().len() && latest.size == frame.size() => {
                latest.pixels.copy_from_slice(frame.data())
            }
            latest => {
                *latest = Some(Frame {
                    size: frame.size(),
                    pixels: frame.data().to_vec(),
                })
            }
        }
    }
}

#[derive(Debug, Default)]
struct SampleState {
    sample_rate: Option<u32>,
    samples: VecDeque<f32>,
}

/// Headless audio sink accumulating samples.
#[derive(Clone, Debug, Default)]
pub struct SampleQueue {
    state: Arc<Mutex<SampleState>>,
}

impl SampleQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sample_rate(&self) -> Option<u32> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).sample_rate
    }

    /// Removes and returns everything queued so far.
    pub fn drain(&self) -> Vec<f32> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.samples.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AudioSink for SampleQueue {
    fn init(&self, sample_rate: u32) {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).sample_rate = Some(sample_rate);
    }

    fn enqueue(&self, samples: Vec<f32>) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .samples
            .extend(samples);
    }
}
