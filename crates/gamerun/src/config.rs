//! Runner configuration.

use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

use crate::event::Size;

#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    Parse(serde_json::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "Config I/O error: {}", e),
            Self::Parse(e) => write!(f, "Config parse error: {}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Parse(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Where persisted guest state lives.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StateBackend {
    /// Lost when the process exits.
    #[default]
    Memory,
    /// One file per entry under the given directory.
    Directory(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GameConfig {
    /// Initial window size announced to the guest.
    pub window: Size,

    /// Upper bound on guest linear memory in bytes (`None` = unlimited).
    pub max_memory: Option<usize>,

    pub state: StateBackend,

    /// Report transitions of the workspace to a modified state.
    pub dirty_notification: bool,

    /// Send `disableSaveWorkspaceButton` right after initialization.
    pub disable_save_workspace_button: bool,

    /// Path of the guest module; may also be given on the command line.
    pub module: Option<PathBuf>,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            window: Size::new(800, 600),
            max_memory: Some(512 * 1024 * 1024), // 512 MB
            state: StateBackend::Memory,
            dirty_notification: false,
            disable_save_workspace_button: false,
            module: None,
        }
    }
}

impl GameConfig {
    /// Small, fully in-memory setup for tests and throwaway sessions.
    pub fn ephemeral() -> Self {
        Self {
            window: Size::new(320, 240),
            max_memory: Some(64 * 1024 * 1024), // 64 MB
            ..Default::default()
        }
    }

    /// Editor-style session persisting state under `dir`.
    pub fn persistent(dir: impl Into<PathBuf>) -> Self {
        Self {
            state: StateBackend::Directory(dir.into()),
            dirty_notification: true,
            ..Default::default()
        }
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Builder: set the initial window size
    pub fn window(mut self, width: u32, height: u32) -> Self {
        self.window = Size::new(width, height);
        self
    }

    /// Builder: limit guest memory
    pub fn max_memory(mut self, bytes: Option<usize>) -> Self {
        self.max_memory = bytes;
        self
    }

    /// Builder: choose the state backend
    pub fn state(mut self, backend: StateBackend) -> Self {
        self.state = backend;
        self
    }

    /// Builder: enable dirty notifications
    pub fn dirty_notification(mut self, enable: bool) -> Self {
        self.dirty_notification = enable;
        self
    }

    /// Builder: hide the guest's save-workspace button
    pub fn disable_save_workspace_button(mut self, disable: bool) -> Self {
        self.disable_save_workspace_button = disable;
        self
    }

    /// Builder: set the guest module path
    pub fn module(mut self, path: impl Into<PathBuf>) -> Self {
        self.module = Some(path.into());
        self
    }
}
