//! # Persistent state
//!
//! Named byte blobs with last-write-wins semantics, one logical store per
//! session. The guest reaches the store only through `state.save`,
//! `state.load` and `state.delete`; each request is queued to a single
//! storage pump that applies it in request order and pushes the completion
//! event.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::action::ActionId;
use crate::event::DELETE_FAILURE;
use crate::event::Event;
use crate::event::Failure;
use crate::event::GET_FAILURE;
use crate::event::PUT_FAILURE;
use crate::queue::EventSender;

#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    Unavailable(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {}", e),
            Self::Unavailable(msg) => write!(f, "Store unavailable: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Backend for persisted guest state.
///
/// This trait is designed to be object-safe (`Arc<dyn StateStore>`).
#[async_trait::async_trait]
pub trait StateStore: Send + Sync + 'static {
    /// Replaces the entry called `name`.
    async fn save(&self, name: &str, data: Vec<u8>) -> Result<()>;

    /// Returns `Ok(None)` when no entry called `name` exists.
    async fn load(&self, name: &str) -> Result<Option<Vec<u8>>>;

    /// Removing an entry that does not exist succeeds.
    async fn delete(&self, name: &str) -> Result<()>;
}

/// In-memory store. Contents are lost with the process.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    entries: Arc<DashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<Vec<u8>> {
        self.entries.get(name).map(|entry| entry.value().clone())
    }
}

#[async_trait::async_trait]
impl StateStore for MemoryStore {
    async fn save(&self, name: &str, data: Vec<u8>) -> Result<()> {
        self.entries.insert(name.to_string(), data);
        Ok(())
    }

    async fn load(&self, name: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.get(name))
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.entries.remove(name);
        Ok(())
    }
}

/// Directory-backed store, one file per entry.
///
/// Entry names are hex encoded into file names, so any string is a valid
/// name. Writes go to a temporary file first and are renamed into place.
#[derive(Clone, Debug)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Opens (creating if needed) the store rooted at `dir`.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, name: &str) -> PathBuf {
        let mut file = String::with_capacity(name.len() * 2 + 6);
        for byte in name.bytes() {
            file.push_str(&format!("{:02x}", byte));
        }
        file.push_str(".state");
        self.dir.join(file)
    }
}

#[async_trait::async_trait]
impl StateStore for FileStore {
    async fn save(&self, name: &str, data: Vec<u8>) -> Result<()> {
        let path = self.path(name);
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &data).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn load(&self, name: &str) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.path(name)).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, name: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path(name)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Debug)]
pub(crate) enum StorageRequest {
    Save { id: ActionId, name: String, data: Vec<u8> },
    Load { id: ActionId, name: String },
    Delete { id: ActionId, name: String },
}

/// Starts the storage pump on the current tokio runtime.
///
/// The pump exits once every request sender is dropped.
pub(crate) fn spawn_pump(
    store: Arc<dyn StateStore>,
    events: EventSender,
) -> mpsc::UnboundedSender<StorageRequest> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(pump(store, rx, events));
    tx
}

async fn pump(
    store: Arc<dyn StateStore>,
    mut requests: mpsc::UnboundedReceiver<StorageRequest>,
    events: EventSender,
) {
    while let Some(request) = requests.recv().await {
        let event = apply(store.as_ref(), request).await;
        events.push(event);
    }
    tracing::debug!("storage pump stopped");
}

async fn apply(store: &dyn StateStore, request: StorageRequest) -> Event {
    match request {
        StorageRequest::Save { id, name, data } => {
            let failed = store.save(&name, data).await.err().map(|e| {
                tracing::warn!(%id, name = %name, error = %e, "state save failed");
                Failure::new(PUT_FAILURE)
            });
            Event::state_saved(id, failed)
        }
        StorageRequest::Load { id, name } => match store.load(&name).await {
            Ok(data) => Event::state_loaded(id, data, None),
            Err(e) => {
                tracing::warn!(%id, name = %name, error = %e, "state load failed");
                Event::state_loaded(id, None, Some(Failure::new(GET_FAILURE)))
            }
        },
        StorageRequest::Delete { id, name } => {
            let failed = store.delete(&name).await.err().map(|e| {
                tracing::warn!(%id, name = %name, error = %e, "state delete failed");
                Failure::new(DELETE_FAILURE)
            });
            Event::state_deleted(id, failed)
        }
    }
}
