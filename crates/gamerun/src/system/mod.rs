//! # Capability Surface
//!
//! The fixed set of host functions a guest may call, expressed as the
//! [`System`] trait. The bridge installs one adapter per guest call; the
//! `env` imports in [`crate::linker`] decode their raw arguments and forward
//! them here.
//!
//! Synchronous capabilities return their result directly. Asynchronous ones
//! (`clock_set_timeout`, `state_*`) return an [`ActionId`] at once and later
//! push a completion event carrying that id.

pub mod host;
pub mod sink;
pub mod storage;
pub mod timer;

use std::time::Duration;

pub use host::HostBuilder;
pub use host::HostSystem;
pub use sink::AudioSink;
pub use sink::FrameBuffer;
pub use sink::SampleQueue;
pub use sink::VideoSink;
pub use storage::FileStore;
pub use storage::MemoryStore;
pub use storage::StateStore;

use crate::action::ActionId;
use crate::event::Size;
use crate::event::TimeoutTag;
use crate::fault::ProtocolViolation;

/// Pixel format tags shared with the guest.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum PixelFormat {
    Rgb24 = 0,
    Rgb32 = 1,
}

/// Sample format tags shared with the guest.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum SampleFormat {
    I16Be = 0,
    I16Le = 1,
    F32Be = 2,
    F32Le = 3,
}

impl SampleFormat {
    /// The f32 format matching this host's byte order.
    pub fn native_f32() -> Self {
        if cfg!(target_endian = "little") {
            SampleFormat::F32Le
        } else {
            SampleFormat::F32Be
        }
    }
}

/// Frame layout fixed by the host in response to `video.init`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct VideoSpec {
    pub pixel_format: PixelFormat,
    pub stride: u32,
}

/// A validated RGB32 frame borrowed from guest memory.
#[derive(Debug)]
pub struct VideoFrame<'a> {
    data: &'a [u8],
    width: u32,
}

impl<'a> VideoFrame<'a> {
    /// Checks a frame as described by the guest's `video.draw` arguments.
    pub fn new(data: &'a [u8], width: u32, stride: u32, format: u32) -> Result<Self, ProtocolViolation> {
        if format != PixelFormat::Rgb32 as u32 {
            return Err(ProtocolViolation::UnexpectedPixelFormat(format));
        }
        if width != stride {
            return Err(ProtocolViolation::StrideMismatch { width, stride });
        }
        if width != 0 && data.len() as u64 % (u64::from(width) * 4) != 0 {
            return Err(ProtocolViolation::PartialRow { width, len: data.len() });
        }
        Ok(Self { data, width })
    }

    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        if self.width == 0 {
            return 0;
        }
        (self.data.len() / 4 / self.width as usize) as u32
    }

    pub fn size(&self) -> Size {
        Size::new(self.width, self.height())
    }

    /// Zero-width or zero-length frames are dropped without drawing.
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.data.is_empty()
    }
}

/// The platform adapter contract the bridge requires.
///
/// An adapter is a cheap handle: the bridge clones it into the store for
/// the duration of each call, and the background tasks completing its
/// asynchronous operations share the same state.
pub trait System: Clone + Send + Sync + 'static {
    fn video_init(&self, size: Size) -> VideoSpec;

    fn video_draw(&self, frame: VideoFrame<'_>);

    fn audio_init(&self, sample_rate: u32, data_samples: usize) -> SampleFormat;

    /// Raw sample bytes in the format returned by `audio_init`.
    fn audio_enqueue(&self, data: &[u8]);

    fn console_log(&self, message: &str);

    /// Time elapsed since the session started.
    fn clock_game_time(&self) -> Duration;

    /// Time elapsed since the Unix epoch.
    fn clock_unix_time(&self) -> Duration;

    fn clock_set_timeout(&self, tag: TimeoutTag, timeout: Duration) -> ActionId;

    fn state_save(&self, name: &str, data: &[u8]) -> ActionId;

    fn state_load(&self, name: &str) -> ActionId;

    fn state_delete(&self, name: &str) -> ActionId;
}
