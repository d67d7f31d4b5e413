//! # Driver Loop
//!
//! Pulls events off the queue one at a time and feeds them to the guest.
//! After each event the driver polls the guest's pending I/O request and
//! hands it to an [`IoHandler`], then optionally checks whether the
//! workspace became dirty.

use serde::Deserialize;
use serde::Serialize;

use crate::game::Game;
use crate::game::Result;
use crate::queue::EventReceiver;
use crate::system::System;
use crate::workspace::Workspace;

/// Something the guest wants the environment to do for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IoRequest {
    SaveWorkspace,
    LoadWorkspace,
    ImportImage,
    ImportImageFromClipboard,
    Vibrate,
    InputNumber { id: u32 },
}

/// Environment side of the guest's I/O requests.
pub trait IoHandler<S: System> {
    type Error: std::fmt::Display;

    fn handle(&mut self, request: IoRequest, workspace: &mut Workspace<'_, S>) -> std::result::Result<(), Self::Error>;

    /// The workspace changed since it was last loaded or saved.
    ///
    /// Called once per transition from clean to dirty. Further edits are not
    /// reported until [`Driver::set_workspace`] or [`Driver::get_workspace`]
    /// makes the workspace clean again.
    fn notify_dirty(&mut self) {}
}

#[derive(Debug, Default)]
struct DirtyState {
    baseline: i64,
    dirty: bool,
}

pub struct Driver<S: System, H> {
    game: Game<S>,
    system: S,
    events: EventReceiver,
    handler: H,
    dirty: Option<DirtyState>,
}

impl<S: System, H: IoHandler<S>> Driver<S, H> {
    /// Takes over an initialized game and the event stream of its adapter.
    pub fn new(game: Game<S>, system: S, events: EventReceiver, handler: H) -> Self {
        Self {
            game,
            system,
            events,
            handler,
            dirty: None,
        }
    }

    /// Builder: report transitions to a dirty workspace.
    pub fn dirty_notification(mut self, enable: bool) -> Result<Self> {
        self.dirty = None;
        if enable {
            let baseline = self.workspace().state_version()?;
            self.dirty = Some(DirtyState { baseline, dirty: false });
        }
        Ok(self)
    }

    pub fn game(&self) -> &Game<S> {
        &self.game
    }

    pub fn game_mut(&mut self) -> &mut Game<S> {
        &mut self.game
    }

    pub fn system(&self) -> &S {
        &self.system
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    pub fn workspace(&mut self) -> Workspace<'_, S> {
        Workspace::new(&mut self.game, &self.system)
    }

    /// Runs until the guest asks to shut down or the event stream ends.
    pub async fn run(&mut self) -> Result<()> {
        while self.run_once().await? {}
        tracing::info!("driver stopped");
        Ok(())
    }

    /// Handles a single event. Returns `Ok(false)` when the loop should stop.
    pub async fn run_once(&mut self) -> Result<bool> {
        let Some(event) = self.events.next().await else {
            tracing::debug!("event stream closed");
            return Ok(false);
        };
        tracing::trace!(?event, "dispatching event");
        if !self.game.handle_event(&self.system, event)? {
            return Ok(false);
        }

        self.check_dirty()?;
        self.poll_io_request()?;
        Ok(true)
    }

    /// Loads `png` as the workspace and makes it the clean baseline.
    pub fn set_workspace(&mut self, png: &[u8]) -> Result<()> {
        self.workspace().load_workspace(png)?;
        self.reset_baseline()
    }

    /// Returns the workspace as PNG and makes it the clean baseline.
    pub fn get_workspace(&mut self) -> Result<Vec<u8>> {
        let png = self.workspace().workspace_png()?;
        self.reset_baseline()?;
        Ok(png)
    }

    fn reset_baseline(&mut self) -> Result<()> {
        if self.dirty.is_none() {
            return Ok(());
        }
        let baseline = self.workspace().state_version()?;
        self.dirty = Some(DirtyState { baseline, dirty: false });
        Ok(())
    }

    fn check_dirty(&mut self) -> Result<()> {
        if !matches!(self.dirty, Some(DirtyState { dirty: false, .. })) {
            return Ok(());
        }
        let version = self.workspace().state_version()?;
        let Some(state) = &mut self.dirty else {
            return Ok(());
        };
        if version != state.baseline {
            state.baseline = version;
            state.dirty = true;
            tracing::debug!(version, "workspace became dirty");
            self.handler.notify_dirty();
        }
        Ok(())
    }

    fn poll_io_request(&mut self) -> Result<()> {
        let bytes = self.workspace().next_io_request()?;
        if bytes.is_empty() {
            return Ok(());
        }
        let request: IoRequest = match serde_json::from_slice(&bytes) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(error = %e, raw = %String::from_utf8_lossy(&bytes), "ignoring undecodable I/O request");
                return Ok(());
            }
        };
        tracing::debug!(?request, "guest I/O request");

        let mut workspace = Workspace::new(&mut self.game, &self.system);
        if let Err(e) = self.handler.handle(request, &mut workspace) {
            tracing::warn!(error = %e, "I/O request failed");
        }
        // A handler may have broken the guest through the workspace.
        if self.game.is_terminated() {
            return Err(crate::game::Error::Terminated);
        }
        Ok(())
    }
}
